//! The single event-loop entry point over all debuggee processes.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{debug, info, trace, warn};

use crate::debug_api::DebugApi;
use crate::debug_event::DebugEventInfo;
use crate::observer::{EngineObserver, NullObserver};
use crate::process::{DebuggeeProcess, ProcessState};
use crate::thread::ContinueOption;

/// How long a dropped engine waits for its debuggees to drain.
const DROP_DRAIN_TIMEOUT_MS: u32 = 300;

pub struct ExecutionEngine {
    debug_api: Box<dyn DebugApi>,
    observer: Box<dyn EngineObserver>,
    processes: Vec<DebuggeeProcess>,
}

impl Drop for ExecutionEngine {
    fn drop(&mut self) {
        if !self.processes.is_empty() {
            self.stop(DROP_DRAIN_TIMEOUT_MS);
        }
    }
}

/// Disjoint borrows of one process plus the engine-owned collaborators its
/// methods need. Exists so callers can hold the process and the debug API
/// mutably at the same time.
pub struct ProcessParts<'a> {
    pub process: &'a mut DebuggeeProcess,
    pub api: &'a mut dyn DebugApi,
    pub observer: &'a mut dyn EngineObserver,
}

impl ExecutionEngine {
    pub fn new(debug_api: Box<dyn DebugApi>) -> Self {
        ExecutionEngine {
            debug_api,
            observer: Box::new(NullObserver),
            processes: Vec::new(),
        }
    }

    pub fn with_observer(debug_api: Box<dyn DebugApi>, observer: Box<dyn EngineObserver>) -> Self {
        ExecutionEngine {
            debug_api,
            observer,
            processes: Vec::new(),
        }
    }

    /// Launches `cmdline` under the debugger. The process object itself is
    /// created when the create-process event arrives.
    pub fn start_process(&mut self, cmdline: &str, workdir: Option<&Path>) -> Result<u32> {
        let pid = self.debug_api.start_process(cmdline, workdir)?;
        info!("started debuggee pid={pid} cmd=[{cmdline}]");
        Ok(pid)
    }

    pub fn attach(&mut self, pid: u32) -> Result<()> {
        self.debug_api.attach(pid)?;
        info!("attached to pid={pid}");
        Ok(())
    }

    pub fn detach_all(&mut self) {
        for process in &mut self.processes {
            if let Err(err) = process.detach(self.debug_api.as_mut()) {
                warn!("detaching pid {}: {err}", process.id());
            }
        }
        self.processes.clear();
    }

    /// One turn of the event loop: waits up to `timeout_ms` for a debug
    /// event and routes it. Returns the id of the process that is now
    /// halted, if any.
    pub fn pump(&mut self, timeout_ms: u32) -> Result<Option<u32>> {
        self.reap_dead();

        let Some(event) = self.debug_api.wait_for_event(timeout_ms)? else {
            return Ok(None);
        };
        trace!("debug event: {event}");
        let pid = event.process_id;

        if let DebugEventInfo::CreateProcess {
            process_handle,
            thread_handle,
            image_file,
        } = event.info
        {
            let compat = self.debug_api.is_compat_process(process_handle);
            debug!("new debuggee process pid={pid} compat={compat}");
            self.processes.push(DebuggeeProcess::new(
                pid,
                process_handle,
                image_file,
                event.thread_id,
                thread_handle,
                compat,
            ));
        }

        let Some(process) = self.processes.iter_mut().find(|p| p.id() == pid) else {
            warn!("debug event for unknown process: {event}");
            self.debug_api.continue_event(
                pid,
                event.thread_id,
                crate::debug_api::ContinueStatus::Handled,
            )?;
            return Ok(None);
        };

        process.on_debug_event(self.debug_api.as_mut(), self.observer.as_mut(), event);
        if process.is_halted() {
            return Ok(Some(pid));
        }
        Ok(None)
    }

    /// True while any process is not yet Dead.
    pub fn alive(&mut self) -> bool {
        self.reap_dead();
        !self.processes.is_empty()
    }

    /// Terminates all debuggees and drains their exit events, bounded by
    /// `timeout_ms`.
    pub fn stop(&mut self, timeout_ms: u32) {
        let ExecutionEngine {
            debug_api,
            observer,
            processes,
        } = self;
        for process in processes.iter_mut() {
            process.kill(debug_api.as_mut(), observer.as_mut());
        }

        let deadline = Instant::now() + Duration::from_millis(u64::from(timeout_ms));
        while !self.processes.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                warn!("timed out draining exit events");
                break;
            }
            let remaining_ms = (deadline - now).as_millis() as u32;
            match self.pump(remaining_ms.max(1)) {
                Ok(Some(pid)) => {
                    if let Some(parts) = self.process_parts(pid) {
                        let _ = parts
                            .process
                            .resume(parts.api, parts.observer, ContinueOption::PassException);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!("waiting for exit events: {err}");
                    break;
                }
            }
            self.reap_dead();
        }
    }

    pub fn process_ids(&self) -> Vec<u32> {
        self.processes.iter().map(|p| p.id()).collect()
    }

    pub fn process(&self, pid: u32) -> Option<&DebuggeeProcess> {
        self.processes.iter().find(|p| p.id() == pid)
    }

    pub fn process_parts(&mut self, pid: u32) -> Option<ProcessParts<'_>> {
        let ExecutionEngine {
            debug_api,
            observer,
            processes,
        } = self;
        processes
            .iter_mut()
            .find(|p| p.id() == pid)
            .map(|process| ProcessParts {
                process,
                api: debug_api.as_mut(),
                observer: observer.as_mut(),
            })
    }

    pub fn debug_api_mut(&mut self) -> &mut dyn DebugApi {
        self.debug_api.as_mut()
    }

    fn reap_dead(&mut self) {
        self.processes.retain(|p| {
            if p.state() == ProcessState::Dead {
                debug!("reaping dead process {}", p.id());
                false
            } else {
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug_event::exception;
    use crate::mock::{events, SharedDebugApi};

    const PID: u32 = 1;
    const TID: u32 = 2;

    fn engine(api: &SharedDebugApi) -> ExecutionEngine {
        ExecutionEngine::new(Box::new(api.clone()))
    }

    fn resume(engine: &mut ExecutionEngine, pid: u32, option: ContinueOption) {
        let parts = engine.process_parts(pid).unwrap();
        parts.process.resume(parts.api, parts.observer, option).unwrap();
    }

    #[test]
    fn pump_times_out_without_events() {
        let api = SharedDebugApi::new();
        let mut engine = engine(&api);
        assert_eq!(None, engine.pump(20).unwrap());
        assert!(!engine.alive());
    }

    #[test]
    fn create_process_event_creates_a_halted_process() {
        let api = SharedDebugApi::new();
        let mut engine = engine(&api);
        api.with(|m| m.push_event(events::create_process(PID, TID)));

        assert_eq!(Some(PID), engine.pump(20).unwrap());
        assert!(engine.alive());
        assert!(engine.process(PID).unwrap().is_halted());
    }

    #[test]
    fn halted_event_is_reported_with_its_pid() {
        let api = SharedDebugApi::new();
        let mut engine = engine(&api);
        api.with(|m| m.push_event(events::create_process(PID, TID)));
        engine.pump(20).unwrap();
        resume(&mut engine, PID, ContinueOption::Continue);

        api.with(|m| {
            m.push_event(events::exception(
                PID,
                TID,
                exception::ACCESS_VIOLATION,
                0x4000,
            ))
        });
        assert_eq!(Some(PID), engine.pump(20).unwrap());
    }

    #[test]
    fn dead_processes_are_reaped_before_the_next_pump() {
        let api = SharedDebugApi::new();
        let mut engine = engine(&api);
        api.with(|m| m.push_event(events::create_process(PID, TID)));
        engine.pump(20).unwrap();
        resume(&mut engine, PID, ContinueOption::Continue);

        api.with(|m| m.push_event(events::exit_process(PID, TID, 0)));
        assert_eq!(Some(PID), engine.pump(20).unwrap());
        resume(&mut engine, PID, ContinueOption::Continue);

        assert!(!engine.alive());
        assert!(engine.process_ids().is_empty());
    }

    #[test]
    fn event_for_an_unknown_process_is_acknowledged() {
        let api = SharedDebugApi::new();
        let mut engine = engine(&api);
        api.with(|m| {
            m.push_event(events::exception(99, 7, exception::BREAKPOINT, 0x1000));
        });
        assert_eq!(None, engine.pump(20).unwrap());
        api.with(|m| assert_eq!(1, m.continued().len()));
    }

    #[test]
    fn stop_drains_exit_events() {
        let api = SharedDebugApi::new();
        let mut engine = engine(&api);
        api.with(|m| m.push_event(events::create_process(PID, TID)));
        engine.pump(20).unwrap();
        resume(&mut engine, PID, ContinueOption::Continue);

        // The kill makes the debuggee exit; the event is already queued.
        api.with(|m| m.push_event(events::exit_process(PID, TID, 1)));
        engine.stop(300);

        assert!(!engine.alive());
        api.with(|m| {
            assert_eq!(vec![events::thread_handle(TID)], m.terminated().to_vec());
        });
    }
}
