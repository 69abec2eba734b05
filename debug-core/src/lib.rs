//! Debuggee-side core of the remote debugging bridge.
//!
//! Everything here is OS-independent and driven through the [`DebugApi`]
//! trait; the one real implementation lives in the `windows` module, and the
//! [`mock`] implementation drives the whole core from canned event sequences
//! in tests.
//!
//! The platform debug API requires that events for a process are waited on
//! and continued from the thread that started or attached it, so the core is
//! strictly single-threaded: one [`ExecutionEngine::pump`] call at a time.

pub mod announcement;
pub mod breakpoint;
pub mod continue_policy;
pub mod debug_api;
pub mod debug_event;
mod error;
pub mod execution_engine;
pub mod mock;
pub mod observer;
pub mod process;
pub mod thread;
#[cfg(windows)]
pub mod windows;

pub use breakpoint::{Breakpoint, TRAP_INSTRUCTION};
pub use continue_policy::{make_continue_decision, Decision, DecisionStrength};
pub use debug_api::{ContinueStatus, DebugApi, NativeHandle, ThreadContext};
pub use debug_event::{DebugEvent, DebugEventInfo, EngineEvent, GuestEvent};
pub use error::{DebugError, Result};
pub use execution_engine::{ExecutionEngine, ProcessParts};
pub use observer::{EngineObserver, NullObserver};
pub use process::{DebuggeeProcess, ProcessState};
pub use thread::{ContinueOption, DebuggeeThread, ThreadState};
