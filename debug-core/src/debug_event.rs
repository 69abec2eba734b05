//! OS-independent view of a native debug event, plus the guest tag the
//! thread state machine derives from announcement strings.

use std::fmt::{self, Display};

use crate::debug_api::NativeHandle;

/// Exception codes the core knows by name. Values are the native NTSTATUS
/// codes of the reference platform.
pub mod exception {
    pub const GUARD_PAGE: u32 = 0x8000_0001;
    pub const DATATYPE_MISALIGNMENT: u32 = 0x8000_0002;
    pub const BREAKPOINT: u32 = 0x8000_0003;
    pub const SINGLE_STEP: u32 = 0x8000_0004;
    /// Breakpoint raised by a 32-bit debuggee on a 64-bit OS.
    pub const WX86_BREAKPOINT: u32 = 0x4000_001f;
    pub const CONTROL_C: u32 = 0x4001_0005;
    /// The compiler runtime's thread-naming exception.
    pub const THREAD_NAMING: u32 = 0x406d_1388;
    pub const ACCESS_VIOLATION: u32 = 0xc000_0005;
    pub const ILLEGAL_INSTRUCTION: u32 = 0xc000_001d;
    pub const FLT_DENORMAL_OPERAND: u32 = 0xc000_008d;
    pub const FLT_DIVIDE_BY_ZERO: u32 = 0xc000_008e;
    pub const FLT_INEXACT_RESULT: u32 = 0xc000_008f;
    pub const FLT_INVALID_OPERATION: u32 = 0xc000_0090;
    pub const FLT_OVERFLOW: u32 = 0xc000_0091;
    pub const FLT_STACK_CHECK: u32 = 0xc000_0092;
    pub const FLT_UNDERFLOW: u32 = 0xc000_0093;
    pub const INT_DIVIDE_BY_ZERO: u32 = 0xc000_0094;
    pub const INT_OVERFLOW: u32 = 0xc000_0095;
    pub const PRIV_INSTRUCTION: u32 = 0xc000_0096;
    pub const STACK_OVERFLOW: u32 = 0xc000_00fd;

    pub fn is_breakpoint(code: u32) -> bool {
        code == BREAKPOINT || code == WX86_BREAKPOINT
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DebugEventInfo {
    CreateProcess {
        process_handle: NativeHandle,
        thread_handle: NativeHandle,
        image_file: NativeHandle,
    },
    CreateThread {
        thread_handle: NativeHandle,
    },
    ExitThread {
        exit_code: u32,
    },
    ExitProcess {
        exit_code: u32,
    },
    Exception {
        code: u32,
        address: u64,
        first_chance: bool,
    },
    LoadDll {
        base: u64,
    },
    UnloadDll {
        base: u64,
    },
    /// The debuggee passed a string to the debugger. The payload stays in
    /// debuggee memory; `address`/`length` locate it.
    OutputDebugString {
        address: u64,
        length: usize,
        unicode: bool,
    },
    /// "RIP": the system-level debugger died.
    Rip {
        error: u32,
    },
    /// An event code this core does not model.
    Unknown,
}

impl Display for DebugEventInfo {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        use DebugEventInfo::*;
        match self {
            CreateProcess { .. } => write!(formatter, "event=CreateProcess"),
            CreateThread { .. } => write!(formatter, "event=CreateThread"),
            ExitThread { exit_code } => {
                write!(formatter, "event=ExitThread exit_code={exit_code}")
            }
            ExitProcess { exit_code } => {
                write!(formatter, "event=ExitProcess exit_code={exit_code}")
            }
            Exception {
                code,
                address,
                first_chance,
            } => write!(
                formatter,
                "event=Exception exception_code=0x{code:08x} exception_address=0x{address:x} first_chance={first_chance}"
            ),
            LoadDll { base } => write!(formatter, "event=LoadDll base=0x{base:016x}"),
            UnloadDll { base } => write!(formatter, "event=UnloadDll base=0x{base:016x}"),
            OutputDebugString {
                address,
                length,
                unicode,
            } => write!(
                formatter,
                "event=OutputDebugString unicode={unicode} address=0x{address:016x} length={length}"
            ),
            Rip { error } => write!(formatter, "event=Rip error=0x{error:x}"),
            Unknown => write!(formatter, "event=Unknown"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebugEvent {
    pub process_id: u32,
    pub thread_id: u32,
    pub info: DebugEventInfo,
}

impl Display for DebugEvent {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "pid={} tid={} {}",
            self.process_id, self.thread_id, self.info
        )
    }
}

/// What the announcement scan made of an event.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum GuestEvent {
    /// Plain OS traffic, nothing guest-related.
    #[default]
    NotGuest,
    /// The host announced that a guest thread is about to start.
    ThreadStarting,
    /// The host announced the guest application (memory base recorded).
    AppStarted,
}

impl GuestEvent {
    pub fn is_guest(self) -> bool {
        self != GuestEvent::NotGuest
    }
}

/// A debug event as the engine tracks it: the OS event plus the derived
/// guest tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineEvent {
    pub os: DebugEvent,
    pub guest: GuestEvent,
}

impl EngineEvent {
    pub fn new(os: DebugEvent) -> Self {
        EngineEvent {
            os,
            guest: GuestEvent::NotGuest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_key_value_shaped() {
        let event = DebugEvent {
            process_id: 1,
            thread_id: 2,
            info: DebugEventInfo::Exception {
                code: exception::BREAKPOINT,
                address: 0xc00020081,
                first_chance: true,
            },
        };
        assert_eq!(
            "pid=1 tid=2 event=Exception exception_code=0x80000003 \
             exception_address=0xc00020081 first_chance=true",
            event.to_string()
        );
    }

    #[test]
    fn wx86_counts_as_breakpoint() {
        assert!(exception::is_breakpoint(exception::BREAKPOINT));
        assert!(exception::is_breakpoint(exception::WX86_BREAKPOINT));
        assert!(!exception::is_breakpoint(exception::SINGLE_STEP));
    }
}
