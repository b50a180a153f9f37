//! Process-wide loader state and the bootstrap that starts an image.
//!
//! The fault dispatcher runs in signal context and cannot be passed
//! parameters, so everything it consults (the segment registry, the open
//! executable, the page size) lives in one process-lifetime record behind
//! a one-shot initializer.

use crate::{fault, launch, registry::Registry};
use libimage::Image;
use spin::Once;
use std::convert::Infallible;
use std::ffi::{CString, OsString};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("loader is already initialized")]
    AlreadyInitialized,

    #[error("loader is not initialized")]
    Uninitialized,

    #[error("loader is already executing an image")]
    AlreadyExecuting,

    #[error("the system page size is unavailable")]
    PageSize,

    #[error("failed to install the fault dispatcher: {0}")]
    Install(#[source] nix::Error),

    #[error(transparent)]
    Image(#[from] libimage::Error),

    #[error("failed to open executable read-only: {0}")]
    Open(#[source] std::io::Error),

    #[error("argument contains an interior nul byte")]
    BadArgument(#[from] std::ffi::NulError),

    #[error(transparent)]
    Launch(#[from] launch::Error),
}

pub type Result<T> = core::result::Result<T, Error>;

/// Everything the fault dispatcher consults, published once per process.
pub(crate) struct State {
    registry: Registry,
    file: File,
    entry: usize,
}

impl State {
    #[inline]
    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    #[inline]
    pub(crate) fn file(&self) -> &File {
        &self.file
    }

    #[inline]
    pub(crate) fn entry(&self) -> usize {
        self.entry
    }
}

static PAGE_SIZE: Once<usize> = Once::new();
static STATE: Once<State> = Once::new();

#[inline]
pub(crate) fn state() -> Option<&'static State> {
    STATE.get()
}

/// One-time setup: caches the system page size and installs the fault
/// dispatcher, capturing the disposition it displaces.
///
/// Must be called exactly once, before [`execute`].
pub fn init() -> Result<()> {
    if PAGE_SIZE.is_completed() {
        return Err(Error::AlreadyInitialized);
    }

    // Safety: sysconf reads a system constant; no memory effects.
    let page_size = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => usize::try_from(size).unwrap(),
        _ => return Err(Error::PageSize),
    };
    PAGE_SIZE.call_once(|| page_size);

    fault::install().map_err(Error::Install)?;

    debug!("Loader initialized; page size {page_size:#x}.");

    Ok(())
}

/// Loads the executable at `path` and transfers control to it.
///
/// Nothing of the image is paged in up front; the program's first touch of
/// each page materializes it. On success the loaded program owns the
/// process and this function never returns. Every error is a bootstrap
/// failure, reported before any of the program's code has run.
pub fn execute(path: &Path, args: &[OsString]) -> Result<Infallible> {
    let &page_size = PAGE_SIZE.get().ok_or(Error::Uninitialized)?;

    let image = libimage::parse(path, page_size)?;
    let file = File::open(path).map_err(Error::Open)?;

    // argv[0] is the image path, as the program would see from a shell.
    let argv = std::iter::once(path.as_os_str().to_owned())
        .chain(args.iter().cloned())
        .map(|arg| CString::new(arg.into_encoded_bytes()))
        .collect::<core::result::Result<Vec<CString>, _>>()?;

    let state = publish(image, file, page_size)?;

    info!("Starting {} at entry point {:#x}.", path.display(), state.entry());

    // Diverges on success; the loaded program owns the process from here.
    launch::start(state.entry(), &argv, page_size).map_err(Error::from)
}

/// Publishes the process-wide state the dispatcher consults. One-shot.
pub(crate) fn publish(image: Image, file: File, page_size: usize) -> Result<&'static State> {
    if STATE.is_completed() {
        return Err(Error::AlreadyExecuting);
    }

    Ok(STATE.call_once(|| State {
        registry: Registry::new(image.segments, page_size),
        file,
        entry: image.entry,
    }))
}
