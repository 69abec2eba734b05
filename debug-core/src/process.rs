//! One debuggee process: its threads, its breakpoints, and the halt-gated
//! operations the protocol layer calls into.

use std::collections::BTreeMap;

use anyhow::Context;
use log::{debug, warn};

use crate::breakpoint::Breakpoint;
use crate::debug_api::{DebugApi, NativeHandle, ThreadContext};
use crate::debug_event::{DebugEvent, DebugEventInfo, EngineEvent};
use crate::error::{DebugError, Result};
use crate::observer::EngineObserver;
use crate::thread::{ContinueOption, DebuggeeThread, ProcessContext, ThreadState};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Halted,
    Dead,
}

pub struct DebuggeeProcess {
    id: u32,
    handle: NativeHandle,
    file_handle: NativeHandle,
    state: ProcessState,
    /// 32-bit debuggee on a 64-bit OS.
    compat: bool,
    memory_base: Option<u64>,
    entry_point: Option<u64>,
    threads: BTreeMap<u32, DebuggeeThread>,
    breakpoints: BTreeMap<u64, Breakpoint>,
    last_event: Option<EngineEvent>,
    halted_thread: Option<u32>,
    duplicate_app_create: bool,
}

impl DebuggeeProcess {
    pub fn new(
        id: u32,
        handle: NativeHandle,
        file_handle: NativeHandle,
        initial_thread_id: u32,
        initial_thread_handle: NativeHandle,
        compat: bool,
    ) -> Self {
        let mut threads = BTreeMap::new();
        threads.insert(
            initial_thread_id,
            DebuggeeThread::new(initial_thread_id, initial_thread_handle),
        );
        DebuggeeProcess {
            id,
            handle,
            file_handle,
            state: ProcessState::Running,
            compat,
            memory_base: None,
            entry_point: None,
            threads,
            breakpoints: BTreeMap::new(),
            last_event: None,
            halted_thread: None,
            duplicate_app_create: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn handle(&self) -> NativeHandle {
        self.handle
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn is_halted(&self) -> bool {
        self.state == ProcessState::Halted
    }

    /// 32 for compatibility-mode debuggees, 64 otherwise.
    pub fn word_size(&self) -> u32 {
        if self.compat {
            32
        } else {
            64
        }
    }

    pub fn is_compat(&self) -> bool {
        self.compat
    }

    pub fn memory_base(&self) -> Option<u64> {
        self.memory_base
    }

    pub fn entry_point(&self) -> Option<u64> {
        self.entry_point
    }

    pub fn last_event(&self) -> Option<&EngineEvent> {
        self.last_event.as_ref()
    }

    pub fn halted_thread_id(&self) -> Option<u32> {
        self.halted_thread
    }

    pub fn thread(&self, tid: u32) -> Option<&DebuggeeThread> {
        self.threads.get(&tid)
    }

    pub fn thread_ids(&self) -> Vec<u32> {
        self.threads.keys().copied().collect()
    }

    /// Ids of guest threads only; this is the thread list the client sees.
    pub fn guest_thread_ids(&self) -> Vec<u32> {
        self.threads
            .values()
            .filter(|t| t.is_guest())
            .map(|t| t.id())
            .collect()
    }

    /// True when the second `AppCreate` error is pending; reading clears it.
    pub fn take_duplicate_app_create(&mut self) -> bool {
        std::mem::take(&mut self.duplicate_app_create)
    }

    /// Sandbox-relative pointers (below the guest memory base) become flat.
    pub fn from_guest_to_flat(&self, addr: u64) -> u64 {
        match self.memory_base {
            Some(base) if addr < base => base + addr,
            _ => addr,
        }
    }

    /// Routes one debug event to its thread. New threads are created on
    /// thread-create events; dead threads stay in the map until their exit
    /// event is acknowledged by the next continue.
    pub fn on_debug_event(
        &mut self,
        api: &mut dyn DebugApi,
        observer: &mut dyn EngineObserver,
        os_event: DebugEvent,
    ) {
        let mut event = EngineEvent::new(os_event);
        let tid = event.os.thread_id;

        if let DebugEventInfo::CreateThread { thread_handle } = event.os.info {
            self.threads
                .entry(tid)
                .or_insert_with(|| DebuggeeThread::new(tid, thread_handle));
        }

        let DebuggeeProcess {
            id,
            handle,
            compat,
            memory_base,
            entry_point,
            threads,
            breakpoints,
            duplicate_app_create,
            ..
        } = self;

        let Some(thread) = threads.get_mut(&tid) else {
            warn!("debug event for unknown thread: {}", event.os);
            let _ = api.continue_event(*id, tid, crate::debug_api::ContinueStatus::Handled);
            return;
        };

        let mut ctx = ProcessContext {
            api,
            observer,
            process_id: *id,
            process_handle: *handle,
            compat: *compat,
            memory_base,
            entry_point,
            breakpoints,
            duplicate_app_create,
            last_event_was_exit: false,
        };
        thread.on_debug_event(&mut ctx, &mut event);

        if thread.is_halted() {
            self.halted_thread = Some(tid);
            self.state = ProcessState::Halted;
        }
        self.last_event = Some(event);
    }

    /// Resumes the halted thread. Threads whose exit event was just
    /// acknowledged are reaped here; acknowledging a process exit moves the
    /// process to Dead.
    pub fn resume(
        &mut self,
        api: &mut dyn DebugApi,
        observer: &mut dyn EngineObserver,
        option: ContinueOption,
    ) -> Result<()> {
        if self.state != ProcessState::Halted {
            return Err(DebugError::NotHalted);
        }
        let tid = self.halted_thread.ok_or(DebugError::NotHalted)?;

        let last_event_was_exit = matches!(
            self.last_event.as_ref().map(|e| &e.os.info),
            Some(DebugEventInfo::ExitThread { .. }) | Some(DebugEventInfo::ExitProcess { .. })
        );
        let process_exited = matches!(
            self.last_event.as_ref().map(|e| &e.os.info),
            Some(DebugEventInfo::ExitProcess { .. })
        );

        let DebuggeeProcess {
            id,
            handle,
            compat,
            memory_base,
            entry_point,
            threads,
            breakpoints,
            duplicate_app_create,
            ..
        } = self;
        let thread = threads.get_mut(&tid).ok_or(DebugError::NoSuchThread(tid))?;

        let mut ctx = ProcessContext {
            api: &mut *api,
            observer,
            process_id: *id,
            process_handle: *handle,
            compat: *compat,
            memory_base,
            entry_point,
            breakpoints,
            duplicate_app_create,
            last_event_was_exit,
        };
        thread.continue_thread(&mut ctx, option)?;

        self.halted_thread = None;
        if self.threads.get(&tid).map(|t| t.state()) == Some(ThreadState::Dead) {
            self.threads.remove(&tid);
        }
        self.state = if process_exited {
            api.close_handle(self.file_handle);
            ProcessState::Dead
        } else {
            ProcessState::Running
        };
        Ok(())
    }

    pub fn read_memory(
        &mut self,
        api: &mut dyn DebugApi,
        addr: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        if self.state != ProcessState::Halted {
            return Err(DebugError::NotHalted);
        }
        api.read_memory(self.handle, addr, buf)
            .with_context(|| format!("reading {} bytes at {addr:#x}", buf.len()))
            .map_err(DebugError::Io)
    }

    pub fn write_memory(&mut self, api: &mut dyn DebugApi, addr: u64, data: &[u8]) -> Result<()> {
        if self.state != ProcessState::Halted {
            return Err(DebugError::NotHalted);
        }
        api.write_memory(self.handle, addr, data)
            .with_context(|| format!("writing {} bytes at {addr:#x}", data.len()))
            .map_err(DebugError::Io)?;
        api.flush_instruction_cache(self.handle, addr, data.len())
            .map_err(DebugError::Io)
    }

    pub fn thread_context(&mut self, api: &mut dyn DebugApi, tid: u32) -> Result<ThreadContext> {
        if self.state != ProcessState::Halted {
            return Err(DebugError::NotHalted);
        }
        let thread = self.threads.get(&tid).ok_or(DebugError::NoSuchThread(tid))?;
        Ok(api.get_thread_context(thread.handle(), self.compat)?)
    }

    pub fn set_thread_context(
        &mut self,
        api: &mut dyn DebugApi,
        tid: u32,
        context: &ThreadContext,
    ) -> Result<()> {
        if self.state != ProcessState::Halted {
            return Err(DebugError::NotHalted);
        }
        let thread = self.threads.get(&tid).ok_or(DebugError::NoSuchThread(tid))?;
        Ok(api.set_thread_context(thread.handle(), context)?)
    }

    /// Sets and arms a breakpoint at a flat address. Requires a halted
    /// process; duplicates are refused.
    pub fn set_breakpoint(&mut self, api: &mut dyn DebugApi, addr: u64) -> Result<()> {
        if self.state != ProcessState::Halted {
            return Err(DebugError::NotHalted);
        }
        if self.breakpoints.contains_key(&addr) {
            return Err(DebugError::DuplicateBreakpoint(addr));
        }
        let mut bp = Breakpoint::new(addr);
        bp.arm(api, self.handle)?;
        self.breakpoints.insert(addr, bp);
        Ok(())
    }

    pub fn remove_breakpoint(&mut self, api: &mut dyn DebugApi, addr: u64) -> Result<()> {
        if self.state != ProcessState::Halted {
            return Err(DebugError::NotHalted);
        }
        if let Some(mut bp) = self.breakpoints.remove(&addr) {
            bp.disarm(api, self.handle)?;
        }
        Ok(())
    }

    pub fn breakpoint_addresses(&self) -> Vec<u64> {
        self.breakpoints.keys().copied().collect()
    }

    /// Asks the OS to trap a running process.
    pub fn break_into(&mut self, api: &mut dyn DebugApi) -> Result<()> {
        Ok(api.break_into(self.handle)?)
    }

    /// Terminates every thread, then continues so the final exit-process
    /// event can drain through the event loop.
    pub fn kill(&mut self, api: &mut dyn DebugApi, observer: &mut dyn EngineObserver) {
        debug!("killing process {}", self.id);
        let DebuggeeProcess {
            id,
            handle,
            compat,
            memory_base,
            entry_point,
            threads,
            breakpoints,
            duplicate_app_create,
            ..
        } = self;
        for thread in threads.values_mut() {
            let mut ctx = ProcessContext {
                api: &mut *api,
                observer: &mut *observer,
                process_id: *id,
                process_handle: *handle,
                compat: *compat,
                memory_base: &mut *memory_base,
                entry_point: &mut *entry_point,
                breakpoints: &mut *breakpoints,
                duplicate_app_create: &mut *duplicate_app_create,
                last_event_was_exit: false,
            };
            thread.kill(&mut ctx);
        }
        if self.state == ProcessState::Halted {
            if let Err(err) = self.resume(api, observer, ContinueOption::Continue) {
                warn!("continuing killed process {}: {err}", self.id);
            }
        }
    }

    pub fn detach(&mut self, api: &mut dyn DebugApi) -> Result<()> {
        Ok(api.detach(self.id)?)
    }
}
