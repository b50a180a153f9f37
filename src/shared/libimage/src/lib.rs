//! Loading-side view of a statically linked ELF executable.
//!
//! Parses an executable into the set of loadable segment descriptors a
//! loader needs, normalized so that every segment begins on a page
//! boundary.

#[macro_use]
extern crate log;


use bitflags::bitflags;
use elf::{ElfBytes, abi, endian::AnyEndian, segment::ProgramHeader};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read executable image: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed ELF image: {0}")]
    Elf(#[from] elf::parse::ParseError),

    #[error("image is not a fixed-address (ET_EXEC) executable")]
    NotExecutable,

    #[error("image has no loadable segments")]
    NoLoadableSegments,

    #[error("segment at {vaddr:#x} declares a file size larger than its memory size")]
    FileSizeExceedsMemSize { vaddr: usize },

    #[error("segment at {vaddr:#x} cannot be shifted down to a page boundary")]
    UnalignableSegment { vaddr: usize },

    #[error("segments at {lower:#x} and {upper:#x} overlap after page rounding")]
    OverlappingSegments { lower: usize, upper: usize },
}

pub type Result<T> = core::result::Result<T, Error>;

bitflags! {
    /// Final access protection of a loadable segment.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u32 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXECUTE = 0b100;
    }
}

impl Protection {
    fn from_phdr_flags(p_flags: u32) -> Self {
        let mut protection = Self::empty();

        if (p_flags & abi::PF_R) != 0 {
            protection |= Self::READ;
        }
        if (p_flags & abi::PF_W) != 0 {
            protection |= Self::WRITE;
        }
        if (p_flags & abi::PF_X) != 0 {
            protection |= Self::EXECUTE;
        }

        protection
    }
}

/// One loadable segment, page-normalized.
///
/// `vaddr` is always page-aligned; the byte at `vaddr + k` comes from file
/// offset `file_offset + k` for `k < file_size`, and is zero for
/// `file_size <= k < mem_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub vaddr: usize,
    pub mem_size: usize,
    pub file_size: usize,
    pub file_offset: u64,
    pub protection: Protection,
}

impl Segment {
    fn from_phdr(phdr: &ProgramHeader, page_size: usize) -> Result<Self> {
        let vaddr = usize::try_from(phdr.p_vaddr).unwrap();
        let mem_size = usize::try_from(phdr.p_memsz).unwrap();
        let file_size = usize::try_from(phdr.p_filesz).unwrap();

        if file_size > mem_size {
            return Err(Error::FileSizeExceedsMemSize { vaddr });
        }

        // Pull a segment that begins mid-page down to the page boundary,
        // shifting its file window by the same amount so the per-byte
        // correspondence is unchanged.
        let shift = vaddr & (page_size - 1);
        let (file_offset, file_size) = if file_size == 0 {
            // A pure BSS header has no file window to pull forward; the
            // pre-segment gap is zero-filled along with the rest.
            (phdr.p_offset, 0)
        } else {
            let file_offset = phdr
                .p_offset
                .checked_sub(shift as u64)
                .ok_or(Error::UnalignableSegment { vaddr })?;

            (file_offset, file_size + shift)
        };

        Ok(Self {
            vaddr: vaddr - shift,
            mem_size: mem_size + shift,
            file_size,
            file_offset,
            protection: Protection::from_phdr_flags(phdr.p_flags),
        })
    }

    /// Whether `addr` falls within the segment's memory range.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        (self.vaddr..(self.vaddr + self.mem_size)).contains(&addr)
    }

    /// Number of pages the segment spans, rounded up.
    #[inline]
    pub fn page_count(&self, page_size: usize) -> usize {
        self.mem_size.div_ceil(page_size)
    }
}

/// A parsed executable: its entry point and loadable segments.
#[derive(Debug)]
pub struct Image {
    pub entry: usize,
    pub segments: Box<[Segment]>,
}

/// Parses the executable at `path` into an [`Image`].
///
/// Only fixed-address (`ET_EXEC`) images are accepted; program headers
/// other than `PT_LOAD` are ignored.
pub fn parse(path: &Path, page_size: usize) -> Result<Image> {
    debug_assert!(page_size.is_power_of_two());

    let data = std::fs::read(path)?;
    let elf = ElfBytes::<AnyEndian>::minimal_parse(&data)?;

    if elf.ehdr.e_type != abi::ET_EXEC {
        return Err(Error::NotExecutable);
    }

    let segments = elf
        .segments()
        .ok_or(Error::NoLoadableSegments)?
        .iter()
        .filter(|phdr| phdr.p_type == abi::PT_LOAD)
        .map(|phdr| Segment::from_phdr(&phdr, page_size))
        .collect::<Result<Vec<Segment>>>()?;

    if segments.is_empty() {
        return Err(Error::NoLoadableSegments);
    }

    check_disjoint(&segments, page_size)?;

    let entry = usize::try_from(elf.ehdr.e_entry).unwrap();
    debug!("Parsed {} loadable segments, entry point {:#x}.", segments.len(), entry);

    Ok(Image { entry, segments: segments.into_boxed_slice() })
}

/// Verifies no two segments overlap once their ends are rounded up to page
/// boundaries.
fn check_disjoint(segments: &[Segment], page_size: usize) -> Result<()> {
    let mut rounded: Vec<(usize, usize)> = segments
        .iter()
        .map(|segment| {
            let end = (segment.vaddr + segment.mem_size).next_multiple_of(page_size);
            (segment.vaddr, end)
        })
        .collect();
    rounded.sort_unstable();

    for pair in rounded.windows(2) {
        if pair[1].0 < pair[0].1 {
            return Err(Error::OverlappingSegments { lower: pair[0].0, upper: pair[1].0 });
        }
    }

    Ok(())
}
