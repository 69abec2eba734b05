//! A pure mock of the platform debugger: no OS calls, canned events,
//! sparse byte-addressed memory and per-thread contexts.
//!
//! Tests queue debug events with [`MockDebugApi::push_event`], map memory
//! regions, and afterwards assert on the recorded call sequence and the
//! continue acknowledgements.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::rc::Rc;

use anyhow::{bail, Result};

use crate::debug_api::{
    ContinueStatus, DebugApi, NativeHandle, ThreadContext, X64ThreadContext, X86ThreadContext,
};
use crate::debug_event::DebugEvent;

/// One recorded facade call; parameters are not tracked, sequence is.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ApiCall {
    StartProcess,
    Attach,
    Detach,
    WaitForEvent,
    ContinueEvent,
    ReadMemory,
    WriteMemory,
    FlushInstructionCache,
    GetThreadContext,
    SetThreadContext,
    BreakInto,
    TerminateThread,
    CloseHandle,
}

#[derive(Default)]
pub struct MockDebugApi {
    calls: Vec<ApiCall>,
    events: VecDeque<DebugEvent>,
    memory: BTreeMap<u64, u8>,
    contexts: HashMap<NativeHandle, ThreadContext>,
    continued: Vec<(u32, u32, ContinueStatus)>,
    broken_into: Vec<NativeHandle>,
    terminated: Vec<NativeHandle>,
    compat: bool,
    next_pid: u32,
}

impl MockDebugApi {
    pub fn new() -> Self {
        MockDebugApi {
            next_pid: 1,
            ..MockDebugApi::default()
        }
    }

    /// Makes every process look like a 32-bit debuggee on a 64-bit OS.
    pub fn set_compat(&mut self, compat: bool) {
        self.compat = compat;
    }

    pub fn push_event(&mut self, event: DebugEvent) {
        self.events.push_back(event);
    }

    /// Maps `bytes` at `addr`; reads and writes outside mapped memory fail.
    pub fn map_region(&mut self, addr: u64, bytes: &[u8]) {
        for (i, &b) in bytes.iter().enumerate() {
            self.memory.insert(addr + i as u64, b);
        }
    }

    pub fn byte_at(&self, addr: u64) -> Option<u8> {
        self.memory.get(&addr).copied()
    }

    pub fn set_context(&mut self, thread: NativeHandle, context: ThreadContext) {
        self.contexts.insert(thread, context);
    }

    pub fn context_of(&self, thread: NativeHandle) -> Option<ThreadContext> {
        self.contexts.get(&thread).copied()
    }

    pub fn single_step_enabled(&self, thread: NativeHandle) -> bool {
        self.contexts
            .get(&thread)
            .map_or(false, |c| c.single_step())
    }

    pub fn calls(&self) -> &[ApiCall] {
        &self.calls
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    /// Every `continue_event` acknowledgement in order.
    pub fn continued(&self) -> &[(u32, u32, ContinueStatus)] {
        &self.continued
    }

    pub fn broken_into(&self) -> &[NativeHandle] {
        &self.broken_into
    }

    pub fn terminated(&self) -> &[NativeHandle] {
        &self.terminated
    }

    fn default_context(&self) -> ThreadContext {
        if self.compat {
            ThreadContext::X86(X86ThreadContext::default())
        } else {
            ThreadContext::X64(X64ThreadContext::default())
        }
    }
}

impl DebugApi for MockDebugApi {
    fn start_process(&mut self, _cmdline: &str, _workdir: Option<&Path>) -> Result<u32> {
        self.calls.push(ApiCall::StartProcess);
        let pid = self.next_pid;
        self.next_pid += 1;
        Ok(pid)
    }

    fn attach(&mut self, _pid: u32) -> Result<()> {
        self.calls.push(ApiCall::Attach);
        Ok(())
    }

    fn detach(&mut self, _pid: u32) -> Result<()> {
        self.calls.push(ApiCall::Detach);
        Ok(())
    }

    fn wait_for_event(&mut self, _timeout_ms: u32) -> Result<Option<DebugEvent>> {
        self.calls.push(ApiCall::WaitForEvent);
        Ok(self.events.pop_front())
    }

    fn continue_event(&mut self, pid: u32, tid: u32, status: ContinueStatus) -> Result<()> {
        self.calls.push(ApiCall::ContinueEvent);
        self.continued.push((pid, tid, status));
        Ok(())
    }

    fn read_memory(&mut self, _process: NativeHandle, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.calls.push(ApiCall::ReadMemory);
        for (i, slot) in buf.iter_mut().enumerate() {
            match self.memory.get(&(addr + i as u64)) {
                Some(&b) => *slot = b,
                None => bail!("unmapped read at {:#x}", addr + i as u64),
            }
        }
        Ok(())
    }

    fn write_memory(&mut self, _process: NativeHandle, addr: u64, data: &[u8]) -> Result<()> {
        self.calls.push(ApiCall::WriteMemory);
        for (i, _) in data.iter().enumerate() {
            if !self.memory.contains_key(&(addr + i as u64)) {
                bail!("unmapped write at {:#x}", addr + i as u64);
            }
        }
        for (i, &b) in data.iter().enumerate() {
            self.memory.insert(addr + i as u64, b);
        }
        Ok(())
    }

    fn flush_instruction_cache(
        &mut self,
        _process: NativeHandle,
        _addr: u64,
        _len: usize,
    ) -> Result<()> {
        self.calls.push(ApiCall::FlushInstructionCache);
        Ok(())
    }

    fn get_thread_context(&mut self, thread: NativeHandle, _compat: bool) -> Result<ThreadContext> {
        self.calls.push(ApiCall::GetThreadContext);
        let default = self.default_context();
        Ok(*self.contexts.entry(thread).or_insert(default))
    }

    fn set_thread_context(&mut self, thread: NativeHandle, context: &ThreadContext) -> Result<()> {
        self.calls.push(ApiCall::SetThreadContext);
        self.contexts.insert(thread, *context);
        Ok(())
    }

    fn break_into(&mut self, process: NativeHandle) -> Result<()> {
        self.calls.push(ApiCall::BreakInto);
        self.broken_into.push(process);
        Ok(())
    }

    fn terminate_thread(&mut self, thread: NativeHandle) -> Result<()> {
        self.calls.push(ApiCall::TerminateThread);
        self.terminated.push(thread);
        Ok(())
    }

    fn is_compat_process(&mut self, _process: NativeHandle) -> bool {
        self.compat
    }

    fn close_handle(&mut self, _handle: NativeHandle) {
        self.calls.push(ApiCall::CloseHandle);
    }
}

/// A handle to a [`MockDebugApi`] that can be given away (for example to an
/// `ExecutionEngine`, which owns its debug API) while the test keeps a clone
/// for scripting events and asserting afterwards. The core is
/// single-threaded, so `Rc<RefCell<_>>` is all the sharing needed.
#[derive(Clone, Default)]
pub struct SharedDebugApi(Rc<RefCell<MockDebugApi>>);

impl SharedDebugApi {
    pub fn new() -> Self {
        SharedDebugApi(Rc::new(RefCell::new(MockDebugApi::new())))
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MockDebugApi) -> R) -> R {
        f(&mut self.0.borrow_mut())
    }
}

impl DebugApi for SharedDebugApi {
    fn start_process(&mut self, cmdline: &str, workdir: Option<&Path>) -> Result<u32> {
        self.0.borrow_mut().start_process(cmdline, workdir)
    }

    fn attach(&mut self, pid: u32) -> Result<()> {
        self.0.borrow_mut().attach(pid)
    }

    fn detach(&mut self, pid: u32) -> Result<()> {
        self.0.borrow_mut().detach(pid)
    }

    fn wait_for_event(&mut self, timeout_ms: u32) -> Result<Option<DebugEvent>> {
        self.0.borrow_mut().wait_for_event(timeout_ms)
    }

    fn continue_event(&mut self, pid: u32, tid: u32, status: ContinueStatus) -> Result<()> {
        self.0.borrow_mut().continue_event(pid, tid, status)
    }

    fn read_memory(&mut self, process: NativeHandle, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.0.borrow_mut().read_memory(process, addr, buf)
    }

    fn write_memory(&mut self, process: NativeHandle, addr: u64, data: &[u8]) -> Result<()> {
        self.0.borrow_mut().write_memory(process, addr, data)
    }

    fn flush_instruction_cache(
        &mut self,
        process: NativeHandle,
        addr: u64,
        len: usize,
    ) -> Result<()> {
        self.0.borrow_mut().flush_instruction_cache(process, addr, len)
    }

    fn get_thread_context(&mut self, thread: NativeHandle, compat: bool) -> Result<ThreadContext> {
        self.0.borrow_mut().get_thread_context(thread, compat)
    }

    fn set_thread_context(&mut self, thread: NativeHandle, context: &ThreadContext) -> Result<()> {
        self.0.borrow_mut().set_thread_context(thread, context)
    }

    fn break_into(&mut self, process: NativeHandle) -> Result<()> {
        self.0.borrow_mut().break_into(process)
    }

    fn terminate_thread(&mut self, thread: NativeHandle) -> Result<()> {
        self.0.borrow_mut().terminate_thread(thread)
    }

    fn is_compat_process(&mut self, process: NativeHandle) -> bool {
        self.0.borrow_mut().is_compat_process(process)
    }

    fn close_handle(&mut self, handle: NativeHandle) {
        self.0.borrow_mut().close_handle(handle)
    }
}

/// Builders for the debug events the tests feed through the engine.
pub mod events {
    use crate::debug_api::NativeHandle;
    use crate::debug_event::{DebugEvent, DebugEventInfo};

    pub fn create_process(pid: u32, tid: u32) -> DebugEvent {
        DebugEvent {
            process_id: pid,
            thread_id: tid,
            info: DebugEventInfo::CreateProcess {
                process_handle: NativeHandle(0x1000 + u64::from(pid)),
                thread_handle: NativeHandle(0x2000 + u64::from(tid)),
                image_file: NativeHandle(0x3000 + u64::from(pid)),
            },
        }
    }

    pub fn create_thread(pid: u32, tid: u32) -> DebugEvent {
        DebugEvent {
            process_id: pid,
            thread_id: tid,
            info: DebugEventInfo::CreateThread {
                thread_handle: NativeHandle(0x2000 + u64::from(tid)),
            },
        }
    }

    pub fn thread_handle(tid: u32) -> NativeHandle {
        NativeHandle(0x2000 + u64::from(tid))
    }

    pub fn process_handle(pid: u32) -> NativeHandle {
        NativeHandle(0x1000 + u64::from(pid))
    }

    pub fn exception(pid: u32, tid: u32, code: u32, address: u64) -> DebugEvent {
        DebugEvent {
            process_id: pid,
            thread_id: tid,
            info: DebugEventInfo::Exception {
                code,
                address,
                first_chance: true,
            },
        }
    }

    pub fn exit_thread(pid: u32, tid: u32, exit_code: u32) -> DebugEvent {
        DebugEvent {
            process_id: pid,
            thread_id: tid,
            info: DebugEventInfo::ExitThread { exit_code },
        }
    }

    pub fn exit_process(pid: u32, tid: u32, exit_code: u32) -> DebugEvent {
        DebugEvent {
            process_id: pid,
            thread_id: tid,
            info: DebugEventInfo::ExitProcess { exit_code },
        }
    }

    pub fn debug_string(pid: u32, tid: u32, address: u64, length: usize) -> DebugEvent {
        DebugEvent {
            process_id: pid,
            thread_id: tid,
            info: DebugEventInfo::OutputDebugString {
                address,
                length,
                unicode: false,
            },
        }
    }
}
