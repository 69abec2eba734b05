//! The real [`DebugApi`] over the Win32 debugger primitives.
//!
//! Only 64-bit hosts are supported; 32-bit debuggees run under WoW and are
//! reached through the `Wow64*` context calls.

#![cfg(windows)]
#![allow(clippy::not_unsafe_ptr_arg_deref)]

use std::ffi::OsStr;
use std::iter::once;
use std::mem::{size_of, MaybeUninit};
use std::os::windows::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

use anyhow::{Context, Result};
use winapi::shared::minwindef::{DWORD, FALSE, LPVOID, TRUE};
use winapi::shared::winerror::ERROR_SEM_TIMEOUT;
use winapi::um::debugapi::{
    ContinueDebugEvent, DebugActiveProcess, DebugActiveProcessStop, DebugBreakProcess,
    WaitForDebugEvent,
};
use winapi::um::errhandlingapi::GetLastError;
use winapi::um::handleapi::CloseHandle;
use winapi::um::memoryapi::{ReadProcessMemory, WriteProcessMemory};
use winapi::um::minwinbase::{
    CREATE_PROCESS_DEBUG_EVENT, CREATE_THREAD_DEBUG_EVENT, DEBUG_EVENT, EXCEPTION_DEBUG_EVENT,
    EXIT_PROCESS_DEBUG_EVENT, EXIT_THREAD_DEBUG_EVENT, LOAD_DLL_DEBUG_EVENT,
    OUTPUT_DEBUG_STRING_EVENT, RIP_EVENT, UNLOAD_DLL_DEBUG_EVENT,
};
use winapi::um::processthreadsapi::{
    CreateProcessW, FlushInstructionCache, GetThreadContext, SetThreadContext, TerminateThread,
    PROCESS_INFORMATION, STARTUPINFOW,
};
use winapi::um::winbase::{
    Wow64GetThreadContext, Wow64SetThreadContext, CREATE_NEW_CONSOLE, DEBUG_PROCESS,
};
use winapi::um::winnt::{
    CONTEXT, CONTEXT_ALL, DBG_CONTINUE, DBG_EXCEPTION_NOT_HANDLED, HANDLE, WOW64_CONTEXT,
    WOW64_CONTEXT_ALL,
};
use winapi::um::wow64apiset::IsWow64Process;

use crate::debug_api::{
    ContinueStatus, DebugApi, NativeHandle, ThreadContext, X64ThreadContext, X86ThreadContext,
};
use crate::debug_event::{DebugEvent, DebugEventInfo};

/// The CONTEXT structure must be 16-byte aligned; `MaybeUninit` alone does
/// not guarantee that on the heapless path.
#[repr(align(16))]
struct Align16<T>(T);

fn last_os_error() -> anyhow::Error {
    std::io::Error::last_os_error().into()
}

fn check_winapi<F: FnOnce() -> i32>(f: F) -> Result<()> {
    if f() == FALSE {
        Err(last_os_error())
    } else {
        Ok(())
    }
}

fn handle(h: HANDLE) -> NativeHandle {
    NativeHandle(h as u64)
}

fn raw(h: NativeHandle) -> HANDLE {
    h.0 as HANDLE
}

fn wide(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(once(0)).collect()
}

/// The production facade. Stateless: every call maps to one Win32 call.
#[derive(Default)]
pub struct WindowsDebugApi;

impl WindowsDebugApi {
    pub fn new() -> Self {
        WindowsDebugApi
    }
}

impl DebugApi for WindowsDebugApi {
    fn start_process(&mut self, cmdline: &str, workdir: Option<&Path>) -> Result<u32> {
        let mut cmdline = wide(OsStr::new(cmdline));
        let workdir = workdir.map(|p| wide(p.as_os_str()));

        let mut si: STARTUPINFOW = unsafe { std::mem::zeroed() };
        si.cb = size_of::<STARTUPINFOW>() as DWORD;
        let mut pi: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };

        check_winapi(|| unsafe {
            CreateProcessW(
                ptr::null(),
                cmdline.as_mut_ptr(),
                ptr::null_mut(),
                ptr::null_mut(),
                FALSE,
                DEBUG_PROCESS | CREATE_NEW_CONSOLE,
                ptr::null_mut(),
                workdir.as_ref().map_or(ptr::null(), |w| w.as_ptr()),
                &mut si,
                &mut pi,
            )
        })
        .context("starting debuggee")?;

        // The debug loop owns the process via debug events; these handles
        // are not needed.
        unsafe {
            CloseHandle(pi.hThread);
            CloseHandle(pi.hProcess);
        }
        Ok(pi.dwProcessId)
    }

    fn attach(&mut self, pid: u32) -> Result<()> {
        check_winapi(|| unsafe { DebugActiveProcess(pid) })
            .with_context(|| format!("attaching to pid {pid}"))
    }

    fn detach(&mut self, pid: u32) -> Result<()> {
        check_winapi(|| unsafe { DebugActiveProcessStop(pid) })
            .with_context(|| format!("detaching from pid {pid}"))
    }

    fn wait_for_event(&mut self, timeout_ms: u32) -> Result<Option<DebugEvent>> {
        let mut de = MaybeUninit::<DEBUG_EVENT>::uninit();
        if unsafe { WaitForDebugEvent(de.as_mut_ptr(), timeout_ms) } == FALSE {
            let err = unsafe { GetLastError() };
            if err == ERROR_SEM_TIMEOUT {
                return Ok(None);
            }
            return Err(last_os_error()).context("waiting for debug event");
        }
        let de = unsafe { de.assume_init() };
        Ok(Some(convert_event(&de)))
    }

    fn continue_event(&mut self, pid: u32, tid: u32, status: ContinueStatus) -> Result<()> {
        let status = match status {
            ContinueStatus::Handled => DBG_CONTINUE,
            ContinueStatus::NotHandled => DBG_EXCEPTION_NOT_HANDLED,
        };
        check_winapi(|| unsafe { ContinueDebugEvent(pid, tid, status) })
            .context("continuing debug event")
    }

    fn read_memory(&mut self, process: NativeHandle, addr: u64, buf: &mut [u8]) -> Result<()> {
        check_winapi(|| unsafe {
            ReadProcessMemory(
                raw(process),
                addr as LPVOID,
                buf.as_mut_ptr() as LPVOID,
                buf.len(),
                ptr::null_mut(),
            )
        })
        .context("reading process memory")
    }

    fn write_memory(&mut self, process: NativeHandle, addr: u64, data: &[u8]) -> Result<()> {
        check_winapi(|| unsafe {
            WriteProcessMemory(
                raw(process),
                addr as LPVOID,
                data.as_ptr() as LPVOID,
                data.len(),
                ptr::null_mut(),
            )
        })
        .context("writing process memory")
    }

    fn flush_instruction_cache(
        &mut self,
        process: NativeHandle,
        addr: u64,
        len: usize,
    ) -> Result<()> {
        check_winapi(|| unsafe { FlushInstructionCache(raw(process), addr as LPVOID, len) })
            .context("flushing instruction cache")
    }

    fn get_thread_context(&mut self, thread: NativeHandle, compat: bool) -> Result<ThreadContext> {
        if compat {
            let mut ctx = Align16(unsafe { std::mem::zeroed::<WOW64_CONTEXT>() });
            ctx.0.ContextFlags = WOW64_CONTEXT_ALL;
            check_winapi(|| unsafe { Wow64GetThreadContext(raw(thread), &mut ctx.0) })
                .context("Wow64GetThreadContext")?;
            Ok(ThreadContext::X86(from_wow64_context(&ctx.0)))
        } else {
            let mut ctx = Align16(unsafe { std::mem::zeroed::<CONTEXT>() });
            ctx.0.ContextFlags = CONTEXT_ALL;
            check_winapi(|| unsafe { GetThreadContext(raw(thread), &mut ctx.0) })
                .context("GetThreadContext")?;
            Ok(ThreadContext::X64(from_native_context(&ctx.0)))
        }
    }

    fn set_thread_context(&mut self, thread: NativeHandle, context: &ThreadContext) -> Result<()> {
        // Read-modify-write: only the registers the core models are
        // replaced, everything else in the native context is preserved.
        match context {
            ThreadContext::X86(regs) => {
                let mut ctx = Align16(unsafe { std::mem::zeroed::<WOW64_CONTEXT>() });
                ctx.0.ContextFlags = WOW64_CONTEXT_ALL;
                check_winapi(|| unsafe { Wow64GetThreadContext(raw(thread), &mut ctx.0) })
                    .context("Wow64GetThreadContext")?;
                apply_wow64_context(regs, &mut ctx.0);
                check_winapi(|| unsafe { Wow64SetThreadContext(raw(thread), &ctx.0) })
                    .context("Wow64SetThreadContext")
            }
            ThreadContext::X64(regs) => {
                let mut ctx = Align16(unsafe { std::mem::zeroed::<CONTEXT>() });
                ctx.0.ContextFlags = CONTEXT_ALL;
                check_winapi(|| unsafe { GetThreadContext(raw(thread), &mut ctx.0) })
                    .context("GetThreadContext")?;
                apply_native_context(regs, &mut ctx.0);
                check_winapi(|| unsafe { SetThreadContext(raw(thread), &ctx.0) })
                    .context("SetThreadContext")
            }
        }
    }

    fn break_into(&mut self, process: NativeHandle) -> Result<()> {
        check_winapi(|| unsafe { DebugBreakProcess(raw(process)) }).context("DebugBreakProcess")
    }

    fn terminate_thread(&mut self, thread: NativeHandle) -> Result<()> {
        check_winapi(|| unsafe { TerminateThread(raw(thread), 0) }).context("TerminateThread")
    }

    fn is_compat_process(&mut self, process: NativeHandle) -> bool {
        let mut is_wow64 = FALSE;
        if unsafe { IsWow64Process(raw(process), &mut is_wow64) } == FALSE {
            return false;
        }
        is_wow64 == TRUE
    }

    fn close_handle(&mut self, handle: NativeHandle) {
        unsafe {
            CloseHandle(raw(handle));
        }
    }
}

fn convert_event(de: &DEBUG_EVENT) -> DebugEvent {
    let info = unsafe {
        match de.dwDebugEventCode {
            EXCEPTION_DEBUG_EVENT => {
                let info = de.u.Exception();
                DebugEventInfo::Exception {
                    code: info.ExceptionRecord.ExceptionCode,
                    address: info.ExceptionRecord.ExceptionAddress as u64,
                    first_chance: info.dwFirstChance != 0,
                }
            }
            CREATE_PROCESS_DEBUG_EVENT => {
                let info = de.u.CreateProcessInfo();
                DebugEventInfo::CreateProcess {
                    process_handle: handle(info.hProcess),
                    thread_handle: handle(info.hThread),
                    image_file: handle(info.hFile),
                }
            }
            CREATE_THREAD_DEBUG_EVENT => {
                let info = de.u.CreateThread();
                DebugEventInfo::CreateThread {
                    thread_handle: handle(info.hThread),
                }
            }
            EXIT_THREAD_DEBUG_EVENT => DebugEventInfo::ExitThread {
                exit_code: de.u.ExitThread().dwExitCode,
            },
            EXIT_PROCESS_DEBUG_EVENT => DebugEventInfo::ExitProcess {
                exit_code: de.u.ExitProcess().dwExitCode,
            },
            LOAD_DLL_DEBUG_EVENT => DebugEventInfo::LoadDll {
                base: de.u.LoadDll().lpBaseOfDll as u64,
            },
            UNLOAD_DLL_DEBUG_EVENT => DebugEventInfo::UnloadDll {
                base: de.u.UnloadDll().lpBaseOfDll as u64,
            },
            OUTPUT_DEBUG_STRING_EVENT => {
                let info = de.u.DebugString();
                DebugEventInfo::OutputDebugString {
                    address: info.lpDebugStringData as u64,
                    // The reported length includes the terminating NUL.
                    length: usize::from(info.nDebugStringLength).saturating_sub(1),
                    unicode: info.fUnicode != 0,
                }
            }
            RIP_EVENT => DebugEventInfo::Rip {
                error: de.u.RipInfo().dwError,
            },
            _ => DebugEventInfo::Unknown,
        }
    };
    DebugEvent {
        process_id: de.dwProcessId,
        thread_id: de.dwThreadId,
        info,
    }
}

fn from_native_context(ctx: &CONTEXT) -> X64ThreadContext {
    X64ThreadContext {
        rax: ctx.Rax,
        rbx: ctx.Rbx,
        rcx: ctx.Rcx,
        rdx: ctx.Rdx,
        rsi: ctx.Rsi,
        rdi: ctx.Rdi,
        rbp: ctx.Rbp,
        rsp: ctx.Rsp,
        r8: ctx.R8,
        r9: ctx.R9,
        r10: ctx.R10,
        r11: ctx.R11,
        r12: ctx.R12,
        r13: ctx.R13,
        r14: ctx.R14,
        r15: ctx.R15,
        rip: ctx.Rip,
        eflags: ctx.EFlags,
        seg_cs: ctx.SegCs,
        seg_ss: ctx.SegSs,
        seg_ds: ctx.SegDs,
        seg_es: ctx.SegEs,
        seg_fs: ctx.SegFs,
        seg_gs: ctx.SegGs,
    }
}

fn apply_native_context(regs: &X64ThreadContext, ctx: &mut CONTEXT) {
    ctx.Rax = regs.rax;
    ctx.Rbx = regs.rbx;
    ctx.Rcx = regs.rcx;
    ctx.Rdx = regs.rdx;
    ctx.Rsi = regs.rsi;
    ctx.Rdi = regs.rdi;
    ctx.Rbp = regs.rbp;
    ctx.Rsp = regs.rsp;
    ctx.R8 = regs.r8;
    ctx.R9 = regs.r9;
    ctx.R10 = regs.r10;
    ctx.R11 = regs.r11;
    ctx.R12 = regs.r12;
    ctx.R13 = regs.r13;
    ctx.R14 = regs.r14;
    ctx.R15 = regs.r15;
    ctx.Rip = regs.rip;
    ctx.EFlags = regs.eflags;
    ctx.SegCs = regs.seg_cs;
    ctx.SegSs = regs.seg_ss;
    ctx.SegDs = regs.seg_ds;
    ctx.SegEs = regs.seg_es;
    ctx.SegFs = regs.seg_fs;
    ctx.SegGs = regs.seg_gs;
}

fn from_wow64_context(ctx: &WOW64_CONTEXT) -> X86ThreadContext {
    X86ThreadContext {
        eax: ctx.Eax,
        ecx: ctx.Ecx,
        edx: ctx.Edx,
        ebx: ctx.Ebx,
        esp: ctx.Esp,
        ebp: ctx.Ebp,
        esi: ctx.Esi,
        edi: ctx.Edi,
        eip: ctx.Eip,
        eflags: ctx.EFlags,
        seg_cs: ctx.SegCs,
        seg_ss: ctx.SegSs,
        seg_ds: ctx.SegDs,
        seg_es: ctx.SegEs,
        seg_fs: ctx.SegFs,
        seg_gs: ctx.SegGs,
    }
}

fn apply_wow64_context(regs: &X86ThreadContext, ctx: &mut WOW64_CONTEXT) {
    ctx.Eax = regs.eax;
    ctx.Ecx = regs.ecx;
    ctx.Edx = regs.edx;
    ctx.Ebx = regs.ebx;
    ctx.Esp = regs.esp;
    ctx.Ebp = regs.ebp;
    ctx.Esi = regs.esi;
    ctx.Edi = regs.edi;
    ctx.Eip = regs.eip;
    ctx.EFlags = regs.eflags;
    ctx.SegCs = regs.seg_cs;
    ctx.SegSs = regs.seg_ss;
    ctx.SegDs = regs.seg_ds;
    ctx.SegEs = regs.seg_es;
    ctx.SegFs = regs.seg_fs;
    ctx.SegGs = regs.seg_gs;
}
