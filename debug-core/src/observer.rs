//! Narrow hook for tests and diagnostics.

use crate::continue_policy::Decision;
use crate::thread::ThreadState;

/// Observes the two internal transitions tests care about. All methods have
/// no-op defaults.
pub trait EngineObserver {
    fn on_state_change(&mut self, _thread_id: u32, _old: ThreadState, _new: ThreadState) {}

    fn on_decision(&mut self, _thread_id: u32, _decision: &Decision) {}
}

/// The default observer: does nothing.
#[derive(Default)]
pub struct NullObserver;

impl EngineObserver for NullObserver {}
