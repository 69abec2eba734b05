//! Maps a debug event to the protocol's stop-reply form.

use debug_core::debug_event::{exception, DebugEventInfo, EngineEvent};
use gdb_rsp::StopReply;

pub const SIGINT: u8 = 2;
pub const SIGILL: u8 = 4;
pub const SIGTRAP: u8 = 5;
pub const SIGBUS: u8 = 7;
pub const SIGFPE: u8 = 8;
pub const SIGSEGV: u8 = 11;
pub const SIGSTOP: u8 = 19;
pub const SIGSYS: u8 = 31;
/// "No signal": nothing better is known about the stop.
pub const SIGNO: u8 = 0;

/// Exit codes 0..255 are a plain `exit()`; anything else is an NTSTATUS-like
/// value, i.e. the process was taken down by an exception.
fn exited_normally(exit_code: u32) -> bool {
    exit_code < 256
}

pub fn signal_for_exception(code: u32) -> u8 {
    match code {
        exception::ACCESS_VIOLATION | exception::STACK_OVERFLOW => SIGSEGV,
        exception::BREAKPOINT | exception::WX86_BREAKPOINT | exception::SINGLE_STEP => SIGTRAP,
        exception::DATATYPE_MISALIGNMENT => SIGBUS,
        exception::FLT_DENORMAL_OPERAND
        | exception::FLT_DIVIDE_BY_ZERO
        | exception::FLT_INEXACT_RESULT
        | exception::FLT_INVALID_OPERATION
        | exception::FLT_OVERFLOW
        | exception::FLT_STACK_CHECK
        | exception::FLT_UNDERFLOW
        | exception::INT_DIVIDE_BY_ZERO
        | exception::INT_OVERFLOW => SIGFPE,
        exception::ILLEGAL_INSTRUCTION | exception::PRIV_INSTRUCTION => SIGILL,
        exception::CONTROL_C => SIGINT,
        _ => SIGNO,
    }
}

/// The stop reply describing `event` to the client.
pub fn from_event(event: &EngineEvent) -> StopReply {
    let pid = event.os.process_id;
    match event.os.info {
        DebugEventInfo::Exception { code, .. } => StopReply::Signalled {
            signal: signal_for_exception(code),
        },
        DebugEventInfo::ExitProcess { exit_code } => {
            if exited_normally(exit_code) {
                StopReply::Exited {
                    exit_code: exit_code as u8,
                    pid: Some(pid),
                }
            } else {
                StopReply::Terminated {
                    signal: signal_for_exception(exit_code),
                    pid: Some(pid),
                }
            }
        }
        DebugEventInfo::Rip { .. } => StopReply::Terminated {
            signal: SIGSYS,
            pid: Some(pid),
        },
        // Thread and module lifecycle, debug strings, process creation: the
        // debuggee is merely stopped.
        DebugEventInfo::CreateProcess { .. }
        | DebugEventInfo::CreateThread { .. }
        | DebugEventInfo::ExitThread { .. }
        | DebugEventInfo::LoadDll { .. }
        | DebugEventInfo::UnloadDll { .. }
        | DebugEventInfo::OutputDebugString { .. } => StopReply::Signalled { signal: SIGSTOP },
        DebugEventInfo::Unknown => StopReply::Signalled { signal: SIGNO },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use debug_core::debug_event::{DebugEvent, GuestEvent};

    fn event(info: DebugEventInfo) -> EngineEvent {
        EngineEvent {
            os: DebugEvent {
                process_id: 0x9c4,
                thread_id: 2,
                info,
            },
            guest: GuestEvent::NotGuest,
        }
    }

    fn exception(code: u32) -> EngineEvent {
        event(DebugEventInfo::Exception {
            code,
            address: 0x20080,
            first_chance: true,
        })
    }

    #[test]
    fn breakpoint_and_single_step_are_sigtrap() {
        for code in [
            exception::BREAKPOINT,
            exception::WX86_BREAKPOINT,
            exception::SINGLE_STEP,
        ] {
            assert_eq!(
                StopReply::Signalled { signal: SIGTRAP },
                from_event(&exception(code))
            );
        }
    }

    #[test]
    fn faults_map_to_unix_signals() {
        assert_eq!(
            StopReply::Signalled { signal: SIGSEGV },
            from_event(&exception(exception::ACCESS_VIOLATION))
        );
        assert_eq!(
            StopReply::Signalled { signal: SIGSEGV },
            from_event(&exception(exception::STACK_OVERFLOW))
        );
        assert_eq!(
            StopReply::Signalled { signal: SIGBUS },
            from_event(&exception(exception::DATATYPE_MISALIGNMENT))
        );
        assert_eq!(
            StopReply::Signalled { signal: SIGFPE },
            from_event(&exception(exception::INT_DIVIDE_BY_ZERO))
        );
        assert_eq!(
            StopReply::Signalled { signal: SIGFPE },
            from_event(&exception(exception::FLT_OVERFLOW))
        );
        assert_eq!(
            StopReply::Signalled { signal: SIGILL },
            from_event(&exception(exception::PRIV_INSTRUCTION))
        );
        assert_eq!(
            StopReply::Signalled { signal: SIGINT },
            from_event(&exception(exception::CONTROL_C))
        );
    }

    #[test]
    fn unknown_exception_is_signal_zero() {
        assert_eq!(
            StopReply::Signalled { signal: SIGNO },
            from_event(&exception(0xE06D7363))
        );
    }

    #[test]
    fn lifecycle_events_are_sigstop() {
        let infos = [
            DebugEventInfo::CreateThread {
                thread_handle: debug_core::NativeHandle(1),
            },
            DebugEventInfo::ExitThread { exit_code: 0 },
            DebugEventInfo::LoadDll { base: 0x10000 },
            DebugEventInfo::UnloadDll { base: 0x10000 },
            DebugEventInfo::OutputDebugString {
                address: 0x1000,
                length: 4,
                unicode: false,
            },
        ];
        for info in infos {
            assert_eq!(
                StopReply::Signalled { signal: SIGSTOP },
                from_event(&event(info))
            );
        }
    }

    #[test]
    fn normal_exit_reports_the_exit_code() {
        assert_eq!(
            StopReply::Exited {
                exit_code: 3,
                pid: Some(0x9c4)
            },
            from_event(&event(DebugEventInfo::ExitProcess { exit_code: 3 }))
        );
    }

    #[test]
    fn exceptional_exit_reports_the_mapped_signal() {
        assert_eq!(
            StopReply::Terminated {
                signal: SIGSEGV,
                pid: Some(0x9c4)
            },
            from_event(&event(DebugEventInfo::ExitProcess {
                exit_code: exception::ACCESS_VIOLATION,
            }))
        );
    }

    #[test]
    fn a_dead_system_debugger_is_sigsys() {
        assert_eq!(
            StopReply::Terminated {
                signal: SIGSYS,
                pid: Some(0x9c4)
            },
            from_event(&event(DebugEventInfo::Rip { error: 2 }))
        );
    }
}
