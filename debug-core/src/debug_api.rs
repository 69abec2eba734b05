//! The injectable seam over the platform's native debugger primitives.
//!
//! The rest of the core only ever talks to [`DebugApi`], so every state
//! machine in this crate is testable against the mock implementation. The
//! CPU single-step flag is deliberately not a separate call: it is a bit of
//! the thread context and travels through the context get/modify/set path.

use std::path::Path;

use anyhow::Result;

use crate::debug_event::DebugEvent;

/// Opaque OS object handle (process, thread or file).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct NativeHandle(pub u64);

/// How a debug event is acknowledged back to the OS.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ContinueStatus {
    /// The exception (if any) is considered handled by the debugger.
    Handled,
    /// The exception is delivered to the debuggee.
    NotHandled,
}

/// x86 trap flag: bit 8 of EFLAGS.
const TRAP_FLAG: u32 = 1 << 8;

/// Thread context of a 32-bit debuggee. Field order is the wire-relevant
/// subset of the OS 32-bit context; segment registers are 32 bits wide
/// natively on this path.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct X86ThreadContext {
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub eip: u32,
    pub eflags: u32,
    pub seg_cs: u32,
    pub seg_ss: u32,
    pub seg_ds: u32,
    pub seg_es: u32,
    pub seg_fs: u32,
    pub seg_gs: u32,
}

/// Thread context of a 64-bit debuggee. Segment registers are 16 bits wide
/// natively, although the wire protocol moves them in 32-bit slots.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct X64ThreadContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub eflags: u32,
    pub seg_cs: u16,
    pub seg_ss: u16,
    pub seg_ds: u16,
    pub seg_es: u16,
    pub seg_fs: u16,
    pub seg_gs: u16,
}

/// A thread context in whichever flavour the debuggee runs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ThreadContext {
    X86(X86ThreadContext),
    X64(X64ThreadContext),
}

impl ThreadContext {
    pub fn ip(&self) -> u64 {
        match self {
            ThreadContext::X86(ctx) => u64::from(ctx.eip),
            ThreadContext::X64(ctx) => ctx.rip,
        }
    }

    pub fn set_ip(&mut self, ip: u64) {
        match self {
            ThreadContext::X86(ctx) => ctx.eip = ip as u32,
            ThreadContext::X64(ctx) => ctx.rip = ip as u64,
        }
    }

    pub fn single_step(&self) -> bool {
        self.eflags() & TRAP_FLAG != 0
    }

    pub fn set_single_step(&mut self, enable: bool) {
        let eflags = match self {
            ThreadContext::X86(ctx) => &mut ctx.eflags,
            ThreadContext::X64(ctx) => &mut ctx.eflags,
        };
        if enable {
            *eflags |= TRAP_FLAG;
        } else {
            *eflags &= !TRAP_FLAG;
        }
    }

    fn eflags(&self) -> u32 {
        match self {
            ThreadContext::X86(ctx) => ctx.eflags,
            ThreadContext::X64(ctx) => ctx.eflags,
        }
    }
}

/// Capability set of the platform debugger.
pub trait DebugApi {
    /// Launches `cmdline` with debugging enabled for the whole child tree,
    /// returning the root process id.
    fn start_process(&mut self, cmdline: &str, workdir: Option<&Path>) -> Result<u32>;

    /// Attaches to a running process.
    fn attach(&mut self, pid: u32) -> Result<()>;

    /// Detaches from a debuggee; it keeps running.
    fn detach(&mut self, pid: u32) -> Result<()>;

    /// Blocks up to `timeout_ms` for the next debug event. `Ok(None)` is a
    /// timeout.
    fn wait_for_event(&mut self, timeout_ms: u32) -> Result<Option<DebugEvent>>;

    /// Acknowledges the pending event of `(pid, tid)`.
    fn continue_event(&mut self, pid: u32, tid: u32, status: ContinueStatus) -> Result<()>;

    fn read_memory(&mut self, process: NativeHandle, addr: u64, buf: &mut [u8]) -> Result<()>;

    fn write_memory(&mut self, process: NativeHandle, addr: u64, data: &[u8]) -> Result<()>;

    fn flush_instruction_cache(
        &mut self,
        process: NativeHandle,
        addr: u64,
        len: usize,
    ) -> Result<()>;

    /// Reads the thread context, in the 32-bit flavour when `compat` says the
    /// debuggee is a 32-bit process on a 64-bit OS.
    fn get_thread_context(&mut self, thread: NativeHandle, compat: bool) -> Result<ThreadContext>;

    fn set_thread_context(&mut self, thread: NativeHandle, context: &ThreadContext) -> Result<()>;

    /// Asks the OS to break into a running process (a remote trap).
    fn break_into(&mut self, process: NativeHandle) -> Result<()>;

    fn terminate_thread(&mut self, thread: NativeHandle) -> Result<()>;

    /// True for 32-bit debuggees on a 64-bit OS.
    fn is_compat_process(&mut self, process: NativeHandle) -> bool;

    fn close_handle(&mut self, handle: NativeHandle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_step_flag_lives_in_eflags() {
        let mut context = ThreadContext::X64(X64ThreadContext::default());
        assert!(!context.single_step());
        context.set_single_step(true);
        assert!(context.single_step());
        let ThreadContext::X64(inner) = context else {
            unreachable!()
        };
        assert_eq!(1 << 8, inner.eflags);
        context.set_single_step(false);
        assert!(!context.single_step());
    }

    #[test]
    fn ip_accessors_cover_both_flavours() {
        let mut x86 = ThreadContext::X86(X86ThreadContext::default());
        x86.set_ip(0x20081);
        assert_eq!(0x20081, x86.ip());

        let mut x64 = ThreadContext::X64(X64ThreadContext::default());
        x64.set_ip(0xc00020081);
        assert_eq!(0xc00020081, x64.ip());
    }
}
