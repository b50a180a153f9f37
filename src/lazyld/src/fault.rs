//! Access-violation dispatch and demand materialization of image pages.
//!
//! The dispatcher owns the process's `SIGSEGV` disposition. A fault inside
//! a not-yet-resident page of a loadable segment is demand paging: the page
//! is materialized and recorded, and the faulting instruction retries.
//! Every other fault escalates to the disposition that was displaced at
//! install time.
//!
//! Everything on the fault path sticks to raw syscalls (`mmap`, `pread`,
//! `mprotect`, `sigaction`) and state published before control reached the
//! loaded image; no buffered I/O, no allocation outside the lazy residency
//! record.

use crate::loader;
use crate::registry::Hit;
use libimage::{Protection, Segment};
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::uio;
use spin::Once;
use std::ffi::{c_int, c_void};
use std::fs::File;
use std::num::NonZeroUsize;
use thiserror::Error;

#[derive(Debug, Error)]
enum MaterializeError {
    #[error("failed to map page at {base:#x}: {source}")]
    Map { base: usize, source: nix::Error },

    #[error("failed to read image bytes at offset {offset:#x}: {source}")]
    Read { offset: u64, source: nix::Error },

    #[error("image is truncated at offset {offset:#x}")]
    Truncated { offset: u64 },

    #[error("failed to apply {protection:?} to page at {base:#x}: {source}")]
    Protect { base: usize, protection: Protection, source: nix::Error },
}

static PREVIOUS: Once<SigAction> = Once::new();

/// Installs the dispatcher as the process-wide `SIGSEGV` handler, saving
/// the displaced disposition for escalation.
pub(crate) fn install() -> nix::Result<()> {
    let action =
        SigAction::new(SigHandler::SigAction(on_access_violation), SaFlags::SA_SIGINFO, SigSet::empty());

    // Safety: The handler confines itself to async-signal-safe syscalls
    // and to state that is published before any fault can reach it.
    let previous = unsafe { signal::sigaction(Signal::SIGSEGV, &action) }?;
    PREVIOUS.call_once(|| previous);

    Ok(())
}

extern "C" fn on_access_violation(signum: c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
    // Registered for SIGSEGV alone; anything else is not ours to interpret.
    if signum != Signal::SIGSEGV as c_int {
        escalate(signum, info, context);
        return;
    }

    // Safety: The kernel hands SA_SIGINFO handlers a valid siginfo_t, and
    // si_addr is defined for SIGSEGV.
    let addr = unsafe { (*info).si_addr() } as usize;

    // A fault before `execute` has published an image cannot be demand
    // paging.
    let Some(state) = loader::state() else {
        escalate(signum, info, context);
        return;
    };

    match state.registry().locate(addr) {
        // First touch of this page: materialize it, then let the access
        // retry.
        Some(hit) if !state.registry().is_resident(hit.index, hit.page) => {
            if let Err(error) = materialize(state.file(), &hit, state.registry().page_size()) {
                error!("fault at {addr:#x}: {error}");
                std::process::abort();
            }

            state.registry().record(hit.index, hit.page);
        }

        // The page is already resident, so the access itself violates the
        // segment's protection.
        Some(_) => escalate(signum, info, context),

        // Outside the loaded image entirely.
        None => escalate(signum, info, context),
    }
}

/// Maps and populates the faulted page, then applies its final protection.
fn materialize(file: &File, hit: &Hit, page_size: usize) -> Result<(), MaterializeError> {
    let base = hit.segment.vaddr + (hit.page * page_size);

    trace!("Demand mapping page {} of segment {} at {base:#x}.", hit.page, hit.index);

    // The page starts out writable regardless of its final protection so
    // the file bytes can be copied in; anonymous backing leaves any BSS
    // tail zeroed.
    // Safety: `base` lies on a page the registry knows to be unmapped, so
    // the fixed mapping cannot displace live memory.
    let page = unsafe {
        mman::mmap_anonymous(
            Some(NonZeroUsize::new(base).unwrap()),
            NonZeroUsize::new(page_size).unwrap(),
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_FIXED,
        )
    }
    .map_err(|source| MaterializeError::Map { base, source })?;

    if let Some((offset, len)) = file_range(hit.segment, hit.page, page_size) {
        trace!("Populating {len:#x} bytes from file offset {offset:#x}.");

        // Safety: The mapping above spans a full writable page at `page`.
        let buffer = unsafe { std::slice::from_raw_parts_mut(page.cast::<u8>().as_ptr(), len) };

        read_exact_at(file, buffer, offset)?;
    }

    trace!("Applying final protection {:?}.", hit.segment.protection);

    // Population is complete; write permission may now be withdrawn.
    // Safety: Pointer and length denote exactly the page mapped above.
    unsafe { mman::mprotect(page, page_size, prot_flags(hit.segment.protection)) }.map_err(|source| {
        MaterializeError::Protect { base, protection: hit.segment.protection, source }
    })?;

    Ok(())
}

/// File byte range backing `page` of `segment`: offset and length.
///
/// `None` for pages past the file window, which are BSS tail throughout.
fn file_range(segment: &Segment, page: usize, page_size: usize) -> Option<(u64, usize)> {
    let page_mem = page * page_size;

    (segment.file_size > page_mem).then(|| {
        let offset = segment.file_offset + page_mem as u64;
        let len = usize::min(page_size, segment.file_size - page_mem);

        (offset, len)
    })
}

/// Fills `buffer` from `file` at `offset` with raw positional reads.
fn read_exact_at(file: &File, buffer: &mut [u8], offset: u64) -> Result<(), MaterializeError> {
    let mut done = 0;

    while done < buffer.len() {
        let offset = offset + done as u64;
        let read = uio::pread(file, &mut buffer[done..], libc::off_t::try_from(offset).unwrap())
            .map_err(|source| MaterializeError::Read { offset, source })?;

        if read == 0 {
            return Err(MaterializeError::Truncated { offset });
        }

        done += read;
    }

    Ok(())
}

fn prot_flags(protection: Protection) -> ProtFlags {
    let mut flags = ProtFlags::PROT_NONE;

    if protection.contains(Protection::READ) {
        flags |= ProtFlags::PROT_READ;
    }
    if protection.contains(Protection::WRITE) {
        flags |= ProtFlags::PROT_WRITE;
    }
    if protection.contains(Protection::EXECUTE) {
        flags |= ProtFlags::PROT_EXEC;
    }

    flags
}

/// Delivers the fault to the disposition displaced at install time.
fn escalate(signum: c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
    let Some(previous) = PREVIOUS.get() else {
        // Nothing was displaced; put the default back and let the retried
        // instruction fault under it.
        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());

        // Safety: Restores the signal's default disposition.
        let _ = unsafe { signal::sigaction(Signal::SIGSEGV, &default) };
        return;
    };

    match previous.handler() {
        SigHandler::SigAction(handler) => handler(signum, info, context),
        SigHandler::Handler(handler) => handler(signum),

        // Not a handler we can invoke. Reinstate it and return; the
        // faulting instruction retries under the restored disposition.
        SigHandler::SigDfl | SigHandler::SigIgn => {
            // Safety: Reinstates the exact action captured at install time.
            let _ = unsafe { signal::sigaction(Signal::SIGSEGV, previous) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::file_range;
    use libimage::{Protection, Segment};

    const PAGE_SIZE: usize = 0x1000;

    fn segment(file_offset: u64, file_size: usize, mem_size: usize) -> Segment {
        Segment {
            vaddr: 0x400000,
            mem_size,
            file_size,
            file_offset,
            protection: Protection::READ | Protection::WRITE,
        }
    }

    #[test]
    fn splits_the_page_straddling_the_file_window() {
        let segment = segment(0, 0x1800, 0x3000);

        assert_eq!(file_range(&segment, 0, PAGE_SIZE), Some((0, 0x1000)));
        assert_eq!(file_range(&segment, 1, PAGE_SIZE), Some((0x1000, 0x800)));
        assert_eq!(file_range(&segment, 2, PAGE_SIZE), None);
    }

    #[test]
    fn offsets_into_the_file_by_whole_pages() {
        let segment = segment(0x2000, 0x1200, 0x2000);

        assert_eq!(file_range(&segment, 0, PAGE_SIZE), Some((0x2000, 0x1000)));
        assert_eq!(file_range(&segment, 1, PAGE_SIZE), Some((0x3000, 0x200)));
    }

    #[test]
    fn pure_bss_segment_reads_nothing() {
        let segment = segment(0x4000, 0, 0x2000);

        assert_eq!(file_range(&segment, 0, PAGE_SIZE), None);
        assert_eq!(file_range(&segment, 1, PAGE_SIZE), None);
    }
}
