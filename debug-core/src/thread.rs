//! Per-thread lifecycle of the debuggee.
//!
//! A thread is Running, Halted on a debug event, silently resuming through a
//! breakpoint, or Dead. The continue-from-breakpoint handoff lives here:
//!
//! 1. restore the original code at the breakpoint address,
//! 2. enable the CPU single-step flag,
//! 3. continue the event,
//! 4. on the resulting single-step exception write the trap byte back,
//!    clear the flag and continue again,
//! 5. the thread is Running again and the client never saw a thing.
//!
//! Step 4 can deliver something other than a single-step exception when the
//! original instruction itself faults; the breakpoint must still be restored
//! before the real event is surfaced.

use std::collections::BTreeMap;

use log::{debug, error, trace, warn};

use crate::announcement::{self, Announcement};
use crate::breakpoint::Breakpoint;
use crate::debug_api::{ContinueStatus, DebugApi, NativeHandle};
use crate::debug_event::{exception, DebugEventInfo, EngineEvent, GuestEvent};
use crate::error::{DebugError, Result};
use crate::observer::EngineObserver;

/// Debug strings longer than this are truncated before reading.
const MAX_DEBUG_STRING: usize = 32 * 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Halted,
    ContinuingFromBreakpoint,
    Dead,
}

/// What the client asked a halted thread to do.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ContinueOption {
    Continue,
    SingleStep,
    /// Continue and deliver the pending exception to the debuggee.
    PassException,
}

/// The slice of its owning process a thread needs while handling an event.
/// Threads hold no back-pointer; the process assembles this per call.
pub struct ProcessContext<'a> {
    pub api: &'a mut dyn DebugApi,
    pub observer: &'a mut dyn EngineObserver,
    pub process_id: u32,
    pub process_handle: NativeHandle,
    /// 32-bit debuggee on a 64-bit OS.
    pub compat: bool,
    pub memory_base: &'a mut Option<u64>,
    pub entry_point: &'a mut Option<u64>,
    pub breakpoints: &'a mut BTreeMap<u64, Breakpoint>,
    /// Set when a second `AppCreate` announcement is refused, so the server
    /// can surface it on the error-reply channel.
    pub duplicate_app_create: &'a mut bool,
    /// True when the event being acknowledged is a thread or process exit.
    pub last_event_was_exit: bool,
}

impl ProcessContext<'_> {
    /// Below-base guest pointers are sandbox offsets; everything else is
    /// already flat.
    fn flat_address(&self, addr: u64) -> u64 {
        match *self.memory_base {
            Some(base) if addr < base => base + addr,
            _ => addr,
        }
    }
}

pub struct DebuggeeThread {
    id: u32,
    handle: NativeHandle,
    state: ThreadState,
    is_guest: bool,
    triggered_breakpoint: Option<u64>,
    exit_code: Option<u32>,
}

impl DebuggeeThread {
    pub fn new(id: u32, handle: NativeHandle) -> Self {
        DebuggeeThread {
            id,
            handle,
            state: ThreadState::Running,
            is_guest: false,
            triggered_breakpoint: None,
            exit_code: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn handle(&self) -> NativeHandle {
        self.handle
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn is_halted(&self) -> bool {
        self.state == ThreadState::Halted
    }

    /// True once the host's announcement for this thread has been seen.
    pub fn is_guest(&self) -> bool {
        self.is_guest
    }

    pub fn exit_code(&self) -> Option<u32> {
        self.exit_code
    }

    pub fn triggered_breakpoint(&self) -> Option<u64> {
        self.triggered_breakpoint
    }

    fn set_state(&mut self, ctx: &mut ProcessContext<'_>, new_state: ThreadState) {
        trace!(
            "thread state change tid={} old={:?} new={:?}",
            self.id,
            self.state,
            new_state
        );
        ctx.observer.on_state_change(self.id, self.state, new_state);
        self.state = new_state;
    }

    /// Routes one debug event through the state machine. On return the
    /// thread is Halted, unless this was the internal single-step leg of a
    /// breakpoint resume, which continues silently.
    pub fn on_debug_event(&mut self, ctx: &mut ProcessContext<'_>, event: &mut EngineEvent) {
        // A stale single-step flag must never leak into the next resume.
        self.clear_single_step(ctx);

        // Expected the single-step of a breakpoint resume but got something
        // else (the patched instruction faulted, or another thread raced in).
        // Restore the breakpoint before surfacing the real event.
        let is_single_step = matches!(
            event.os.info,
            DebugEventInfo::Exception {
                code: exception::SINGLE_STEP,
                ..
            }
        );
        if !is_single_step && self.state == ThreadState::ContinuingFromBreakpoint {
            if let Some(addr) = self.triggered_breakpoint {
                if self.flat_ip(ctx) != Some(addr) {
                    rearm_breakpoint(ctx, addr);
                    self.triggered_breakpoint = None;
                }
            }
        }

        let info = event.os.info.clone();
        match info {
            DebugEventInfo::OutputDebugString {
                address,
                length,
                unicode,
            } => self.on_output_debug_string(ctx, event, address, length, unicode),
            DebugEventInfo::ExitThread { exit_code }
            | DebugEventInfo::ExitProcess { exit_code } => {
                self.exit_code = Some(exit_code);
            }
            DebugEventInfo::Exception { code, address, .. } => {
                if exception::is_breakpoint(code) {
                    self.on_breakpoint(ctx, address);
                } else if code == exception::SINGLE_STEP {
                    // May resume silently; it decides the state itself.
                    self.on_single_step(ctx);
                    return;
                }
            }
            _ => {}
        }

        self.set_state(ctx, ThreadState::Halted);
    }

    /// Resumes a halted thread the way the client asked.
    pub fn continue_thread(
        &mut self,
        ctx: &mut ProcessContext<'_>,
        option: ContinueOption,
    ) -> Result<()> {
        if self.state != ThreadState::Halted {
            warn!(
                "continue({option:?}) on thread {} in state {:?}",
                self.id, self.state
            );
            return Err(DebugError::NotHalted);
        }

        // Acknowledging an exit event reaps the thread.
        if ctx.last_event_was_exit {
            self.set_state(ctx, ThreadState::Dead);
            ctx.api
                .continue_event(ctx.process_id, self.id, ContinueStatus::Handled)?;
            return Ok(());
        }

        if let Some(addr) = self.triggered_breakpoint {
            if self.flat_ip(ctx) == Some(addr) {
                return self.continue_from_breakpoint(ctx);
            }
            // The client moved the instruction pointer away from the
            // triggered breakpoint; put the trap byte back and forget it.
            rearm_breakpoint(ctx, addr);
            self.triggered_breakpoint = None;
        }

        if option == ContinueOption::SingleStep {
            self.enable_single_step(ctx)?;
        }

        let status = match option {
            ContinueOption::PassException => ContinueStatus::NotHandled,
            _ => ContinueStatus::Handled,
        };
        self.set_state(ctx, ThreadState::Running);
        ctx.api.continue_event(ctx.process_id, self.id, status)?;
        Ok(())
    }

    pub fn kill(&mut self, ctx: &mut ProcessContext<'_>) {
        if let Err(err) = ctx.api.terminate_thread(self.handle) {
            error!("terminating thread {}: {err:#}", self.id);
        }
    }

    /// First leg of the breakpoint resume: original byte is already
    /// restored, so single-step over it and wait for the trap.
    fn continue_from_breakpoint(&mut self, ctx: &mut ProcessContext<'_>) -> Result<()> {
        self.set_state(ctx, ThreadState::ContinuingFromBreakpoint);
        self.enable_single_step(ctx)?;
        ctx.api
            .continue_event(ctx.process_id, self.id, ContinueStatus::Handled)?;
        Ok(())
    }

    fn on_single_step(&mut self, ctx: &mut ProcessContext<'_>) {
        if self.state != ThreadState::ContinuingFromBreakpoint {
            // A client-requested step; surfaces like any exception.
            self.set_state(ctx, ThreadState::Halted);
            return;
        }
        match self.triggered_breakpoint.take() {
            Some(addr) => {
                trace!(
                    "single-step completes breakpoint resume tid={} addr={addr:#x}",
                    self.id
                );
                rearm_breakpoint(ctx, addr);
                if let Err(err) =
                    ctx.api
                        .continue_event(ctx.process_id, self.id, ContinueStatus::Handled)
                {
                    error!("continuing after breakpoint rearm: {err:#}");
                }
                self.set_state(ctx, ThreadState::Running);
            }
            None => {
                error!(
                    "single-step while resuming from breakpoint, but no \
                     breakpoint is recorded; tid={}",
                    self.id
                );
                self.set_state(ctx, ThreadState::Halted);
            }
        }
    }

    fn on_breakpoint(&mut self, ctx: &mut ProcessContext<'_>, exception_address: u64) {
        let flat = if self.is_guest {
            ctx.flat_address(exception_address)
        } else {
            exception_address
        };
        let ours = ctx.breakpoints.contains_key(&flat);
        debug!(
            "breakpoint exception tid={} address={exception_address:#x} flat={flat:#x} ours={ours}",
            self.id
        );
        if !ours {
            return;
        }

        self.triggered_breakpoint = Some(flat);
        if let Some(bp) = ctx.breakpoints.get_mut(&flat) {
            if let Err(err) = bp.disarm(ctx.api, ctx.process_handle) {
                error!("restoring code at {flat:#x}: {err:#}");
            }
        }
        // The trap byte has executed, so the OS left the instruction pointer
        // one past the breakpoint; report it at the breakpoint itself.
        if let Err(err) = self.roll_ip_back(ctx) {
            error!("rolling instruction pointer back: {err:#}");
        }
    }

    fn on_output_debug_string(
        &mut self,
        ctx: &mut ProcessContext<'_>,
        event: &mut EngineEvent,
        address: u64,
        length: usize,
        unicode: bool,
    ) {
        if unicode {
            // The host announces in ASCII; wide strings are plain output.
            return;
        }
        let length = length.min(MAX_DEBUG_STRING);
        let mut buffer = vec![0u8; length];
        if ctx
            .api
            .read_memory(ctx.process_handle, address, &mut buffer)
            .is_err()
        {
            return;
        }
        while buffer.last() == Some(&0) {
            buffer.pop();
        }
        let text = String::from_utf8_lossy(&buffer);
        debug!("debug string tid={}: {text}", self.id);

        let Some(announcement) = announcement::parse(&text) else {
            return;
        };

        // Any announcement proves this thread belongs to the host runtime.
        self.is_guest = true;
        event.guest = GuestEvent::ThreadStarting;

        if let Announcement::AppCreate {
            mem_start,
            user_entry,
        } = announcement
        {
            event.guest = GuestEvent::AppStarted;
            if ctx.memory_base.is_some() {
                error!(
                    "second AppCreate announcement refused; keeping base {:#x}",
                    ctx.memory_base.unwrap()
                );
                *ctx.duplicate_app_create = true;
            } else {
                debug!("guest app created: base={mem_start:#x} entry={user_entry:#x}");
                *ctx.memory_base = Some(mem_start);
                *ctx.entry_point = Some(user_entry);
            }
        }
    }

    fn roll_ip_back(&self, ctx: &mut ProcessContext<'_>) -> Result<()> {
        let mut context = ctx.api.get_thread_context(self.handle, ctx.compat)?;
        context.set_ip(context.ip().wrapping_sub(1));
        Ok(ctx.api.set_thread_context(self.handle, &context)?)
    }

    fn flat_ip(&self, ctx: &mut ProcessContext<'_>) -> Option<u64> {
        let context = ctx.api.get_thread_context(self.handle, ctx.compat).ok()?;
        let ip = context.ip();
        Some(if self.is_guest {
            ctx.flat_address(ip)
        } else {
            ip
        })
    }

    fn enable_single_step(&mut self, ctx: &mut ProcessContext<'_>) -> Result<()> {
        trace!("enable single-step tid={}", self.id);
        let mut context = ctx.api.get_thread_context(self.handle, ctx.compat)?;
        context.set_single_step(true);
        Ok(ctx.api.set_thread_context(self.handle, &context)?)
    }

    fn clear_single_step(&mut self, ctx: &mut ProcessContext<'_>) {
        match ctx.api.get_thread_context(self.handle, ctx.compat) {
            Ok(mut context) if context.single_step() => {
                context.set_single_step(false);
                if let Err(err) = ctx.api.set_thread_context(self.handle, &context) {
                    error!("clearing single-step flag on tid {}: {err:#}", self.id);
                }
            }
            Ok(_) => {}
            Err(err) => error!("reading context of tid {}: {err:#}", self.id),
        }
    }
}

fn rearm_breakpoint(ctx: &mut ProcessContext<'_>, addr: u64) {
    match ctx.breakpoints.get_mut(&addr) {
        Some(bp) => {
            if let Err(err) = bp.rearm(ctx.api, ctx.process_handle) {
                error!("rearming breakpoint at {addr:#x}: {err:#}");
            }
        }
        // Removed by the client while triggered; nothing to restore.
        None => debug!("no breakpoint left at {addr:#x}"),
    }
}
