pub mod block;

pub use block::{blocks_for, BlockAllocator, BlockPtr, FreeError};
