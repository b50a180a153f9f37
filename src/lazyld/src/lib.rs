//! Demand-paging loader for statically linked ELF executables.
//!
//! Nothing of the image is copied in before control transfers to it. Each
//! page of each loadable segment materializes on the first access that
//! touches it: the access faults, the fault dispatcher fills the page from
//! the executable file (or leaves it zeroed for the BSS tail) under the
//! segment's declared protection, and the access retries.

#[macro_use]
extern crate log;

mod fault;
mod launch;
mod loader;
mod registry;

#[cfg(test)]
mod tests;

pub use loader::{Error, Result, execute, init};
