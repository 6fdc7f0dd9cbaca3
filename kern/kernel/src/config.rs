//! Compile-time kernel configuration.
//!
//! These are fixed constants, not runtime-negotiable. Constructors that
//! need different heap geometry for testing take it explicitly.

use static_assertions::const_assert;

/// First byte of the managed heap region.
pub const HEAP_START_ADDR: usize = 0x8020_0000;
/// One past the last byte of the managed heap region.
pub const HEAP_END_ADDR: usize = 0x8800_0000;

/// The allocator's minimum allocation granule, in bytes.
pub const MEM_BLOCK_SIZE: usize = 1024;

/// Tick budget a thread receives on every ready-queue admission.
pub const DEFAULT_TIME_SLICE: u64 = 10;

/// Stack size handed to threads created through [`Kernel::spawn`].
///
/// [`Kernel::spawn`]: crate::Kernel::spawn
pub const DEFAULT_STACK_SIZE: usize = 4096;

/// Bytes reserved at the top of a new thread's stack for the register
/// save area the platform trampoline consumes at first dispatch.
pub const CONTEXT_SAVE_SIZE: usize = 0x100;

const_assert!(MEM_BLOCK_SIZE.is_power_of_two());
const_assert!(HEAP_START_ADDR % MEM_BLOCK_SIZE == 0);
const_assert!(HEAP_START_ADDR < HEAP_END_ADDR);
const_assert!((HEAP_END_ADDR - HEAP_START_ADDR) % MEM_BLOCK_SIZE == 0);
const_assert!(DEFAULT_STACK_SIZE % MEM_BLOCK_SIZE == 0);
const_assert!(CONTEXT_SAVE_SIZE < DEFAULT_STACK_SIZE);
const_assert!(DEFAULT_TIME_SLICE > 0);
