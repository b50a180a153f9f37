//! Initial-stack construction and transfer of control to an image entry
//! point.
//!
//! The frame follows the System V initial-process contract: the stack
//! pointer lands on `argc`, followed by the `argv` pointers, a null
//! terminator, an empty environment, and a minimal auxiliary vector, with
//! the argument strings copied above the frame.

use nix::sys::mman::{self, MapFlags, ProtFlags};
use std::convert::Infallible;
use std::ffi::CString;
use std::num::NonZeroUsize;
use thiserror::Error;

/// Size of the loaded program's initial stack.
const STACK_SIZE: usize = 0x80_0000;

const WORD: usize = size_of::<u64>();

const AT_NULL: u64 = 0;
const AT_PAGESZ: u64 = 6;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to map the initial stack: {0}")]
    StackMap(#[source] nix::Error),

    #[error("argument vector does not fit in the initial stack")]
    OversizedArguments,
}

/// Maps a fresh stack, lays out the initial process frame, and jumps to
/// `entry`. Does not return on success.
pub(crate) fn start(entry: usize, argv: &[CString], page_size: usize) -> Result<Infallible, Error> {
    // Safety: A hint-less anonymous mapping; the kernel picks a free range.
    let stack = unsafe {
        mman::mmap_anonymous(
            None,
            NonZeroUsize::new(STACK_SIZE).unwrap(),
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE,
        )
    }
    .map_err(Error::StackMap)?;

    // Safety: The mapping spans STACK_SIZE writable bytes.
    let stack = unsafe { std::slice::from_raw_parts_mut(stack.cast::<u8>().as_ptr(), STACK_SIZE) };
    let stack_pointer = build_initial_frame(stack, argv, page_size)?;

    debug!("Jumping to entry point {entry:#x}, stack pointer {stack_pointer:#x}.");

    // Safety: `entry` is the declared entry point of a published image and
    // `stack_pointer` addresses the frame built above.
    unsafe { jump(entry, stack_pointer) }
}

/// Writes the argument strings and the initial process frame into the top
/// of `stack`, returning the stack-pointer value the entry point expects.
fn build_initial_frame(stack: &mut [u8], argv: &[CString], page_size: usize) -> Result<usize, Error> {
    let base = stack.as_ptr() as usize;
    let top = base + stack.len();

    // argc, argv pointers, argv terminator, envp terminator, two auxv
    // pairs.
    let frame_len = (argv.len() + 7) * WORD;
    let strings_len: usize = argv.iter().map(|arg| arg.as_bytes_with_nul().len()).sum();

    if strings_len + frame_len + 16 > stack.len() {
        return Err(Error::OversizedArguments);
    }

    // Strings first, from the top down.
    let mut cursor = top;
    let mut pointers = Vec::with_capacity(argv.len());

    for arg in argv {
        let bytes = arg.as_bytes_with_nul();
        cursor -= bytes.len();

        stack[(cursor - base)..(cursor - base) + bytes.len()].copy_from_slice(bytes);
        pointers.push(cursor as u64);
    }

    let mut words: Vec<u64> = Vec::with_capacity(argv.len() + 7);
    words.push(argv.len() as u64);
    words.extend_from_slice(&pointers);
    words.push(0); // argv terminator
    words.push(0); // envp: empty environment
    words.push(AT_PAGESZ);
    words.push(page_size as u64);
    words.push(AT_NULL);
    words.push(0);

    // The entry contract wants the stack pointer 16-byte aligned with
    // argc at its base.
    let stack_pointer = (cursor - (words.len() * WORD)) & !0xF;

    for (index, word) in words.iter().enumerate() {
        let at = (stack_pointer - base) + (index * WORD);
        stack[at..at + WORD].copy_from_slice(&word.to_le_bytes());
    }

    Ok(stack_pointer)
}

/// ## Safety
///
/// `entry` must be the entry point of a loadable image registered with the
/// fault dispatcher, and `stack_pointer` must address a well-formed
/// initial frame.
unsafe fn jump(entry: usize, stack_pointer: usize) -> ! {
    #[cfg(target_arch = "x86_64")]
    // Safety: Diverges into the loaded program.
    unsafe {
        // rdx carries the atexit hook at process entry; the image gets
        // none.
        core::arch::asm!(
            "mov rsp, {stack}",
            "xor ebp, ebp",
            "xor edx, edx",
            "jmp {entry}",
            stack = in(reg) stack_pointer,
            entry = in(reg) entry,
            options(noreturn),
        )
    }

    #[cfg(target_arch = "aarch64")]
    // Safety: Diverges into the loaded program.
    unsafe {
        core::arch::asm!(
            "mov sp, {stack}",
            "mov fp, xzr",
            "mov lr, xzr",
            "br {entry}",
            stack = in(reg) stack_pointer,
            entry = in(reg) entry,
            options(noreturn),
        )
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    compile_error!("no entry trampoline for this architecture");
}
