//! A minimal preemptive kernel core for single-hart systems.
//!
//! The crate provides the machine-independent half of a small kernel:
//! a boundary-tag block allocator ([`mm`]), heap-backed thread records
//! with round-robin scheduling and a delta-list sleep queue ([`task`]),
//! and counting semaphores with timed waits ([`sync`]). All of it hangs
//! off one owned [`Kernel`] value; the platform supplies the actual
//! context switch through the [`ContextSwitch`] trait and drives the
//! core from its trap handlers.
//!
//! The core is `no_std` and allocates nothing behind the embedder's
//! back beyond its own bookkeeping collections; thread stacks and every
//! kernel record are charged to the managed heap region.

#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod config;
mod kernel;
pub mod mm;
pub mod platform;
pub mod sync;
pub mod task;
pub mod util;

pub use kernel::{Kernel, NoMemory};
pub use mm::{blocks_for, BlockAllocator, BlockPtr, FreeError};
pub use platform::{ContextSwitch, NullSwitch};
pub use sync::semaphore::{SemId, WaitStatus};
pub use task::{Privilege, SavedStatus, StackRegion, Thread, ThreadId, WaitOutcome};
