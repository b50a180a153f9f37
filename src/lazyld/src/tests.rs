//! End-to-end demand-paging pass over synthetic segments.
//!
//! Publishes a hand-built image over a temp file, installs the real fault
//! dispatcher, and drives it with volatile touches. Everything lives in
//! one test because the dispatcher and its state are process-wide.

#![cfg(target_os = "linux")]

use crate::loader;
use libimage::{Image, Protection, Segment};
use std::fs::File;
use std::io::Write;

// A far, page-aligned corner of the address space, quiet in an ordinary
// test process.
const SEGMENT_A: usize = 0x4400_0000_0000;
const SEGMENT_B: usize = 0x4400_0020_0000;

fn page_size() -> usize {
    // Safety: sysconf reads a system constant; no memory effects.
    usize::try_from(unsafe { libc::sysconf(libc::_SC_PAGESIZE) }).unwrap()
}

fn read(addr: usize) -> u8 {
    // Safety: Addresses under test lie inside published segments; the
    // dispatcher materializes them on first touch.
    unsafe { core::ptr::read_volatile(addr as *const u8) }
}

#[test]
fn materializes_pages_on_first_touch() {
    let page_size = page_size();

    // Segment A: a file window of one and a half pages, then a BSS tail.
    // Segment B: one fully file-backed read-only page, later in the file.
    let file_size = page_size + (page_size / 2);

    let bytes: Vec<u8> = (0..(file_size + page_size)).map(|index| (index % 251) as u8).collect();
    let mut backing = tempfile::NamedTempFile::new().unwrap();
    backing.write_all(&bytes).unwrap();

    let segments = vec![
        Segment {
            vaddr: SEGMENT_A,
            mem_size: 3 * page_size,
            file_size,
            file_offset: 0,
            protection: Protection::READ | Protection::WRITE,
        },
        Segment {
            vaddr: SEGMENT_B,
            mem_size: page_size,
            file_size: page_size,
            file_offset: file_size as u64,
            protection: Protection::READ,
        },
    ];

    crate::init().unwrap();

    let file = File::open(backing.path()).unwrap();
    let state =
        loader::publish(Image { entry: 0, segments: segments.into_boxed_slice() }, file, page_size)
            .unwrap();

    // First touch materializes the page with the right file byte.
    assert_eq!(read(SEGMENT_A + 0x10), bytes[0x10]);
    assert_eq!(state.registry().resident_pages(0), 1);

    // Another touch of the same page is served without the dispatcher.
    assert_eq!(read(SEGMENT_A + 0x20), bytes[0x20]);
    assert_eq!(state.registry().resident_pages(0), 1);

    // The page straddling the file window: file bytes below the boundary,
    // zeros above it.
    assert_eq!(read(SEGMENT_A + file_size - 1), bytes[file_size - 1]);
    assert_eq!(read(SEGMENT_A + file_size), 0);
    assert_eq!(state.registry().resident_pages(0), 2);

    // A pure BSS-tail page reads zero throughout.
    assert_eq!(read(SEGMENT_A + (3 * page_size) - 1), 0);
    assert_eq!(state.registry().resident_pages(0), 3);

    // A writable segment takes stores once resident.
    // Safety: The page was materialized read+write above.
    unsafe { core::ptr::write_volatile((SEGMENT_A + 0x10) as *mut u8, 0xA5) };
    assert_eq!(read(SEGMENT_A + 0x10), 0xA5);
    assert_eq!(state.registry().resident_pages(0), 3);

    // Residency diverges per segment, and the second segment pulls its
    // bytes from its own file window.
    assert_eq!(state.registry().resident_pages(1), 0);
    assert_eq!(read(SEGMENT_B), bytes[file_size]);
    assert_eq!(read(SEGMENT_B + page_size - 1), bytes[file_size + page_size - 1]);
    assert_eq!(state.registry().resident_pages(1), 1);
    assert_eq!(state.registry().resident_pages(0), 3);
}
