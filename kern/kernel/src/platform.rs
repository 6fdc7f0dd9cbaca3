//! The capability the core requires from its environment.
//!
//! The sole suspension point in the whole kernel is [`ContextSwitch::switch`]:
//! everything before and after it within one operation runs uninterrupted.
//! The core never inspects register contents; a resumed thread's wait
//! outcome lives in its record's pending slot, not in a return register.

use crate::task::ThreadId;

pub trait ContextSwitch {
    /// Saves `from`'s architectural register file onto its own stack and
    /// restores `to`'s previously saved file, transferring control. When
    /// `from == to` this degrades to a context refresh with no actual
    /// switch.
    fn switch(&mut self, from: ThreadId, to: ThreadId);

    /// Resume address installed into newly created threads. The routine
    /// at this address calls the thread's entry point with its argument
    /// and then requests thread exit.
    fn trampoline(&self) -> usize;
}

/// A platform that transfers no real control: the switch is recorded
/// nowhere and the trampoline is a null address. Useful for hosted
/// simulation and for tests that only observe scheduler state.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSwitch;

impl ContextSwitch for NullSwitch {
    fn switch(&mut self, _from: ThreadId, _to: ThreadId) {}

    fn trampoline(&self) -> usize {
        0
    }
}
