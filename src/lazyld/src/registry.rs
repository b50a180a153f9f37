//! Loadable-segment bookkeeping and per-segment page residency.

use bitvec::boxed::BitBox;
use libimage::Segment;
use spin::Mutex;

/// Pages of one segment that have already been materialized.
pub struct Residency {
    pages: BitBox,
    resident: usize,
}

impl Residency {
    fn new(page_count: usize) -> Self {
        Self { pages: bitvec::bitbox![0; page_count + 1], resident: 0 }
    }

    #[inline]
    fn contains(&self, page: usize) -> bool {
        self.pages[page]
    }

    fn record(&mut self, page: usize) {
        debug_assert!(!self.pages[page], "page {page} recorded twice");

        self.pages.set(page, true);
        self.resident += 1;
    }
}

/// A faulting address resolved to the segment and page it belongs to.
#[derive(Clone, Copy)]
pub struct Hit<'a> {
    pub segment: &'a Segment,
    pub index: usize,
    pub page: usize,
}

/// The loadable segments of the running image, with their residency state.
///
/// Residency records are allocated lazily, on the first fault inside their
/// segment, and only ever grow.
pub struct Registry {
    segments: Box<[Segment]>,
    residency: Box<[Mutex<Option<Residency>>]>,
    page_size: usize,
}

impl Registry {
    pub fn new(segments: Box<[Segment]>, page_size: usize) -> Self {
        let residency = segments.iter().map(|_| Mutex::new(None)).collect();

        Self { segments, residency, page_size }
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Resolves `addr` to the unique segment containing it.
    ///
    /// Lookup is linear; executables carry a handful of loadable segments.
    pub fn locate(&self, addr: usize) -> Option<Hit<'_>> {
        self.segments
            .iter()
            .enumerate()
            .find(|(_, segment)| segment.contains(addr))
            .map(|(index, segment)| Hit { segment, index, page: (addr - segment.vaddr) / self.page_size })
    }

    /// Whether `page` of segment `index` has already been materialized.
    pub fn is_resident(&self, index: usize, page: usize) -> bool {
        self.residency[index].lock().as_ref().is_some_and(|residency| residency.contains(page))
    }

    /// Marks `page` of segment `index` materialized.
    pub fn record(&self, index: usize, page: usize) {
        let mut residency = self.residency[index].lock();

        residency
            .get_or_insert_with(|| Residency::new(self.segments[index].page_count(self.page_size)))
            .record(page);
    }

    /// Number of materialized pages in segment `index`.
    pub fn resident_pages(&self, index: usize) -> usize {
        self.residency[index].lock().as_ref().map_or(0, |residency| residency.resident)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libimage::Protection;

    const PAGE_SIZE: usize = 0x1000;

    fn segment(vaddr: usize, file_size: usize, mem_size: usize) -> Segment {
        Segment {
            vaddr,
            mem_size,
            file_size,
            file_offset: 0,
            protection: Protection::READ | Protection::WRITE,
        }
    }

    fn registry() -> Registry {
        let segments = vec![segment(0x400000, 0x1800, 0x3000), segment(0x600000, 0x1000, 0x1000)];

        Registry::new(segments.into_boxed_slice(), PAGE_SIZE)
    }

    #[test]
    fn locates_addresses_by_segment_and_page() {
        let registry = registry();

        let hit = registry.locate(0x400000).unwrap();
        assert_eq!((hit.index, hit.page), (0, 0));

        let hit = registry.locate(0x402FFF).unwrap();
        assert_eq!((hit.index, hit.page), (0, 2));

        let hit = registry.locate(0x600010).unwrap();
        assert_eq!((hit.index, hit.page), (1, 0));

        assert!(registry.locate(0x403000).is_none());
        assert!(registry.locate(0x3FFFFF).is_none());
        assert!(registry.locate(0x10).is_none());
    }

    #[test]
    fn residency_is_empty_until_recorded() {
        let registry = registry();

        assert!(!registry.is_resident(0, 0));
        assert_eq!(registry.resident_pages(0), 0);

        registry.record(0, 0);

        assert!(registry.is_resident(0, 0));
        assert!(!registry.is_resident(0, 1));
        assert_eq!(registry.resident_pages(0), 1);

        registry.record(0, 2);

        assert!(registry.is_resident(0, 2));
        assert_eq!(registry.resident_pages(0), 2);
    }

    #[test]
    fn residency_diverges_across_segments() {
        let registry = registry();

        registry.record(0, 0);

        assert!(!registry.is_resident(1, 0));
        assert_eq!(registry.resident_pages(1), 0);

        registry.record(1, 0);

        assert_eq!(registry.resident_pages(0), 1);
        assert_eq!(registry.resident_pages(1), 1);
    }
}
