//! The protocol server: one listen socket, one client, one debuggee engine.
//!
//! Each `do_work` turn reads client bytes into the framer and pumps the
//! execution engine once. Packets dispatch by variant; halts turn into stop
//! replies only when the client previously asked to resume (`continue
//! pending`), so the client never sees an unsolicited stop it did not cause.

use debug_core::debug_event::{exception, GuestEvent};
use debug_core::{make_continue_decision, ContinueOption, DebugError, ExecutionEngine};
use gdb_rsp::{add_envelope, Blob, Packet, PacketConsumer, Packetizer, ParseError, ThreadSubject};
use log::{debug, error, info, warn};

use crate::registers;
use crate::stop_reply;
use crate::transport::Transport;

const READ_BUFFER_SIZE: usize = 1024;
/// Bound on socket reads per loop turn, so a chatty client cannot starve
/// the debug-event pump.
const MAX_READS_PER_TURN: usize = 100;
const STOP_TIMEOUT_MS: u32 = 1000;

/// Error codes sent to the client in `E<hh>` replies.
pub mod error_code {
    /// A recognised command whose arguments did not parse.
    pub const MALFORMED_PACKET: u8 = 0;
    pub const NO_FOCUSED_THREAD: u8 = 1;
    pub const NO_FOCUSED_PROCESS: u8 = 2;
    pub const FOCUS_ALL_THREADS_UNSUPPORTED: u8 = 3;
    pub const READ_MEMORY_FAILED: u8 = 4;
    pub const PACKET_TOO_LARGE: u8 = 5;
    pub const WRITE_MEMORY_FAILED: u8 = 6;
    pub const GET_THREAD_CONTEXT_FAILED: u8 = 7;
    pub const SET_THREAD_CONTEXT_FAILED: u8 = 8;
    pub const SINGLE_STEP_FAILED: u8 = 9;
    pub const THREAD_IS_DEAD: u8 = 10;
    pub const GUEST_APP_ALREADY_CREATED: u8 = 11;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ServerState {
    Idle,
    Starting,
    Running,
    Exiting,
}

enum FramerOutput {
    Packet(Blob, bool),
    UnexpectedByte(u8),
    Break,
}

#[derive(Default)]
struct FramerSink {
    outputs: Vec<FramerOutput>,
}

impl PacketConsumer for FramerSink {
    fn on_packet(&mut self, body: Blob, valid_checksum: bool) {
        self.outputs.push(FramerOutput::Packet(body, valid_checksum));
    }

    fn on_unexpected_byte(&mut self, byte: u8) {
        self.outputs.push(FramerOutput::UnexpectedByte(byte));
    }

    fn on_break(&mut self) {
        self.outputs.push(FramerOutput::Break);
    }
}

pub struct DebugServer<T: Transport> {
    transport: T,
    packetizer: Packetizer,
    engine: ExecutionEngine,
    state: ServerState,
    compatibility_mode: bool,
    /// In compatibility mode the connection is refused until the first guest
    /// breakpoint, so the client always finds the guest stopped at entry.
    accepting_connections: bool,
    entry_breakpoint_set: bool,
    client_connected: bool,
    focused_process: Option<u32>,
    focused_thread: Option<u32>,
    /// Gates unsolicited stop replies: set by `c`/`s`, cleared by the reply.
    continue_pending: bool,
}

impl<T: Transport> DebugServer<T> {
    pub fn new(transport: T, engine: ExecutionEngine, compatibility_mode: bool) -> Self {
        DebugServer {
            transport,
            packetizer: Packetizer::new(),
            engine,
            state: ServerState::Idle,
            compatibility_mode,
            accepting_connections: !compatibility_mode,
            entry_breakpoint_set: false,
            client_connected: false,
            focused_process: None,
            focused_thread: None,
            continue_pending: false,
        }
    }

    pub fn start_process(&mut self, cmdline: &str, workdir: Option<&std::path::Path>) -> anyhow::Result<()> {
        self.engine.start_process(cmdline, workdir)?;
        self.state = ServerState::Starting;
        Ok(())
    }

    pub fn attach(&mut self, pid: u32) -> anyhow::Result<()> {
        self.engine.attach(pid)?;
        self.state = ServerState::Starting;
        Ok(())
    }

    /// One loop turn: client socket first, then one engine pump bounded by
    /// `wait_ms`.
    pub fn do_work(&mut self, wait_ms: u32) {
        self.handle_network();
        self.handle_execution_engine(wait_ms);
    }

    pub fn process_exited(&self) -> bool {
        self.state == ServerState::Exiting
    }

    /// Terminates all debuggees, drains their exit events and closes both
    /// sockets.
    pub fn quit(&mut self) {
        self.engine.stop(STOP_TIMEOUT_MS);
        self.transport.close();
    }

    fn handle_network(&mut self) {
        if !self.transport.is_connected() {
            if self.client_connected {
                self.client_connected = false;
                self.continue_pending = false;
                self.packetizer.reset();
                info!("debugger connection dropped");
            }
            if self.accepting_connections && self.transport.accept() {
                self.client_connected = true;
            }
            return;
        }

        let mut buf = [0u8; READ_BUFFER_SIZE];
        for _ in 0..MAX_READS_PER_TURN {
            let n = self.transport.read(&mut buf);
            if n == 0 {
                break;
            }
            let mut sink = FramerSink::default();
            self.packetizer.on_data(&buf[..n], &mut sink);
            for output in sink.outputs {
                match output {
                    FramerOutput::Packet(body, valid) => self.on_packet(body, valid),
                    FramerOutput::UnexpectedByte(byte) => {
                        warn!("unexpected byte between packets: 0x{byte:02x}");
                    }
                    FramerOutput::Break => self.on_break(),
                }
            }
        }
    }

    fn handle_execution_engine(&mut self, wait_ms: u32) {
        if self.state == ServerState::Exiting {
            return;
        }
        if self.state == ServerState::Starting && self.engine.alive() {
            self.state = ServerState::Running;
        }
        if self.state == ServerState::Running && !self.engine.alive() {
            info!("no alive debuggee, shutting down");
            self.quit();
            self.state = ServerState::Exiting;
            return;
        }

        let halted = match self.engine.pump(wait_ms) {
            Ok(halted) => halted,
            Err(err) => {
                error!("event pump failed: {err:#}");
                None
            }
        };
        if let Some(pid) = halted {
            self.on_halted_process(pid);
        }
    }

    fn on_packet(&mut self, body: Blob, valid_checksum: bool) {
        debug!("r> [{}]", body.to_text());
        if !valid_checksum {
            warn!("dropping packet with bad checksum: [{}]", body.to_text());
            return;
        }
        self.transport.write_all(b"+");

        match Packet::parse(&body, None) {
            Ok(packet) => self.dispatch(packet),
            Err(ParseError::Unsupported) => self.send_packet(&Packet::Empty),
            Err(ParseError::Malformed) => self.send_error(error_code::MALFORMED_PACKET),
        }
    }

    fn on_break(&mut self) {
        let Some(pid) = self.require_focused_process() else {
            return;
        };
        if let Some(parts) = self.engine.process_parts(pid) {
            if let Err(err) = parts.process.break_into(parts.api) {
                error!("break request failed: {err}");
            }
        }
    }

    fn dispatch(&mut self, packet: Packet) {
        match packet {
            Packet::GetStopReason => self.handle_get_stop_reason(),
            Packet::Continue => self.handle_continue(),
            Packet::Step => self.handle_step(),
            Packet::ReadRegisters => self.handle_read_registers(),
            Packet::WriteRegisters { data } => self.handle_write_registers(&data),
            Packet::ReadMemory { addr, len } => self.handle_read_memory(addr, len),
            Packet::WriteMemory { addr, data } => self.handle_write_memory(addr, &data),
            Packet::SetCurrentThread { subject, thread_id } => {
                self.handle_set_current_thread(subject, thread_id)
            }
            Packet::GetCurrentThread => self.handle_get_current_thread(),
            Packet::IsThreadAlive { thread_id } => self.handle_is_thread_alive(thread_id),
            Packet::GetThreadInfo { get_more } => self.handle_get_thread_info(get_more),
            Packet::QuerySupported { .. } => self.handle_query_supported(),
            Packet::QXferFeaturesRead { annex, .. } => self.handle_qxfer_features_read(&annex),
            Packet::GetOffsets => self.handle_get_offsets(),
            // Replies and the empty packet are not commands; per protocol,
            // anything unrecognised gets the empty packet back.
            _ => self.send_packet(&Packet::Empty),
        }
    }

    fn handle_get_stop_reason(&mut self) {
        let Some(pid) = self.require_focused_process() else {
            return;
        };
        let Some(process) = self.engine.process(pid) else {
            self.send_error(error_code::NO_FOCUSED_PROCESS);
            return;
        };
        if process.is_halted() {
            match process.last_event().cloned() {
                Some(event) => {
                    let reply = stop_reply::from_event(&event);
                    self.send_packet(&Packet::Stop(reply));
                }
                None => self.send_packet(&Packet::Stop(gdb_rsp::StopReply::StillRunning)),
            }
        } else {
            self.send_packet(&Packet::Stop(gdb_rsp::StopReply::StillRunning));
        }
    }

    fn handle_continue(&mut self) {
        let Some(pid) = self.require_focused_process() else {
            return;
        };
        match self.resume_process(pid, ContinueOption::Continue) {
            Ok(()) => self.continue_pending = true,
            // No reply on a failed continue; the next halt or `?` tells the
            // client where things stand.
            Err(err) => warn!("continue failed: {err}"),
        }
    }

    fn handle_step(&mut self) {
        let Some(pid) = self.require_focused_process() else {
            return;
        };
        match self.resume_process(pid, ContinueOption::SingleStep) {
            Ok(()) => self.continue_pending = true,
            Err(err) => {
                warn!("single-step failed: {err}");
                self.send_error(error_code::SINGLE_STEP_FAILED);
            }
        }
    }

    fn handle_read_registers(&mut self) {
        let Some((pid, tid)) = self.require_focused_thread() else {
            return;
        };
        let result = {
            let parts = self.engine.process_parts(pid).expect("focused process");
            parts.process.thread_context(parts.api, tid)
        };
        match result {
            Ok(context) => self.send_packet(&Packet::BlobReply {
                data: registers::context_to_blob(&context),
            }),
            Err(err) => {
                warn!("reading context of tid {tid:#x}: {err}");
                self.send_error(error_code::GET_THREAD_CONTEXT_FAILED);
            }
        }
    }

    fn handle_write_registers(&mut self, data: &Blob) {
        let Some((pid, tid)) = self.require_focused_thread() else {
            return;
        };
        let result = {
            let parts = self.engine.process_parts(pid).expect("focused process");
            match parts.process.thread_context(parts.api, tid) {
                Ok(mut context) => {
                    if registers::blob_to_context(data, &mut context) {
                        parts
                            .process
                            .set_thread_context(parts.api, tid, &context)
                            .map_err(|_| error_code::SET_THREAD_CONTEXT_FAILED)
                    } else {
                        Err(error_code::MALFORMED_PACKET)
                    }
                }
                Err(_) => Err(error_code::GET_THREAD_CONTEXT_FAILED),
            }
        };
        match result {
            Ok(()) => self.send_packet(&Packet::Ok),
            Err(code) => self.send_error(code),
        }
    }

    fn handle_read_memory(&mut self, addr: u64, len: usize) {
        if len == 0 {
            self.send_packet(&Packet::Empty);
            return;
        }
        let Some(pid) = self.require_focused_process() else {
            return;
        };
        // Two wire characters per byte.
        let len = len.min(gdb_rsp::MAX_PACKET_SIZE / 2);
        let result = {
            let parts = self.engine.process_parts(pid).expect("focused process");
            let addr = parts.process.from_guest_to_flat(addr);
            let mut buf = vec![0u8; len];
            parts
                .process
                .read_memory(parts.api, addr, &mut buf)
                .map(|()| buf)
        };
        match result {
            Ok(bytes) => self.send_packet(&Packet::BlobReply {
                data: Blob::from(bytes),
            }),
            Err(err) => {
                warn!("reading {len} bytes at {addr:#x}: {err}");
                self.send_error(error_code::READ_MEMORY_FAILED);
            }
        }
    }

    fn handle_write_memory(&mut self, addr: u64, data: &Blob) {
        if data.len() > gdb_rsp::MAX_PACKET_SIZE {
            self.send_error(error_code::PACKET_TOO_LARGE);
            return;
        }
        let Some(pid) = self.require_focused_process() else {
            return;
        };
        let result = {
            let parts = self.engine.process_parts(pid).expect("focused process");
            let addr = parts.process.from_guest_to_flat(addr);
            parts.process.write_memory(parts.api, addr, &data.to_vec())
        };
        match result {
            Ok(()) => self.send_packet(&Packet::Ok),
            Err(err) => {
                warn!("writing {} bytes at {addr:#x}: {err}", data.len());
                self.send_error(error_code::WRITE_MEMORY_FAILED);
            }
        }
    }

    fn handle_set_current_thread(&mut self, _subject: ThreadSubject, thread_id: i64) {
        if thread_id == -1 {
            // The core cannot fan a thread-scoped operation out to every
            // thread.
            self.send_error(error_code::FOCUS_ALL_THREADS_UNSUPPORTED);
            return;
        }
        if thread_id == 0 {
            // "Any thread": keep the current focus.
            self.send_packet(&Packet::Ok);
            return;
        }
        let Some(pid) = self.require_focused_process() else {
            return;
        };
        let tid = thread_id as u32;
        let known_guest = self
            .engine
            .process(pid)
            .and_then(|p| p.thread(tid))
            .map_or(false, |t| t.is_guest());
        if known_guest {
            self.focused_thread = Some(tid);
            self.send_packet(&Packet::Ok);
        } else {
            self.send_error(error_code::FOCUS_ALL_THREADS_UNSUPPORTED);
        }
    }

    fn handle_get_current_thread(&mut self) {
        self.send_packet(&Packet::CurrentThread {
            thread_id: self.focused_thread.unwrap_or(0),
        });
    }

    fn handle_is_thread_alive(&mut self, thread_id: u32) {
        let Some(pid) = self.require_focused_process() else {
            return;
        };
        let alive = self
            .engine
            .process(pid)
            .map_or(false, |p| p.guest_thread_ids().contains(&thread_id));
        if alive {
            self.send_packet(&Packet::Ok);
        } else {
            self.send_error(error_code::THREAD_IS_DEAD);
        }
    }

    fn handle_get_thread_info(&mut self, get_more: bool) {
        let Some(pid) = self.require_focused_process() else {
            return;
        };
        // The whole guest list fits in one chunk; the continuation is
        // always "done".
        let reply = if get_more {
            Packet::ThreadInfoReply {
                thread_ids: Vec::new(),
                eom: true,
            }
        } else {
            Packet::ThreadInfoReply {
                thread_ids: self
                    .engine
                    .process(pid)
                    .map(|p| p.guest_thread_ids())
                    .unwrap_or_default(),
                eom: false,
            }
        };
        self.send_packet(&reply);
    }

    fn handle_query_supported(&mut self) {
        self.send_packet(&Packet::QuerySupportedReply {
            features: vec![
                (
                    "PacketSize".to_string(),
                    format!("{:x}", gdb_rsp::MAX_PACKET_SIZE),
                ),
                ("qXfer:libraries:read".to_string(), "+".to_string()),
                ("qXfer:features:read".to_string(), "+".to_string()),
            ],
        });
    }

    fn handle_qxfer_features_read(&mut self, annex: &str) {
        if annex != "target.xml" {
            self.send_packet(&Packet::Empty);
            return;
        }
        let word_size = self
            .focused_process
            .and_then(|pid| self.engine.process(pid))
            .map_or(64, |p| p.word_size());
        let architecture = if word_size == 32 {
            "i386:x86-32"
        } else {
            "i386:x86-64"
        };
        self.send_packet(&Packet::QXferReply {
            eom: true,
            body: Blob::from(
                format!("<target><architecture>{architecture}</architecture></target>").as_str(),
            ),
        });
    }

    fn handle_get_offsets(&mut self) {
        let Some(pid) = self.require_focused_process() else {
            return;
        };
        let base = self
            .engine
            .process(pid)
            .and_then(|p| p.memory_base())
            .unwrap_or(0);
        self.send_packet(&Packet::OffsetsReply {
            text: base,
            data: base,
        });
    }

    /// Reacts to a halt reported by the engine: compatibility-mode hooks,
    /// the continue decision, and the stop reply when one is owed.
    fn on_halted_process(&mut self, pid: u32) {
        let Some(process) = self.engine.process(pid) else {
            return;
        };
        let Some(event) = process.last_event().cloned() else {
            return;
        };
        let Some(tid) = process.halted_thread_id() else {
            return;
        };
        let thread_is_guest = process.thread(tid).map_or(false, |t| t.is_guest());

        let duplicate_app_create = self
            .engine
            .process_parts(pid)
            .map_or(false, |parts| parts.process.take_duplicate_app_create());
        if duplicate_app_create {
            error!("guest announced a second application; refusing it");
            if self.client_connected {
                self.send_error(error_code::GUEST_APP_ALREADY_CREATED);
            }
            if let Err(err) = self.resume_process(pid, ContinueOption::Continue) {
                warn!("resuming after refused announcement: {err}");
            }
            return;
        }

        if self.compatibility_mode && !self.accepting_connections {
            if self.handle_compatibility_rendezvous(pid, &event.guest) {
                return;
            }
        }

        // The first guest breakpoint is the compatibility-mode rendezvous
        // point: from here on the client may connect.
        let guest_breakpoint = thread_is_guest
            && matches!(
                event.os.info,
                debug_core::DebugEventInfo::Exception { code, .. }
                    if exception::is_breakpoint(code)
            );
        if guest_breakpoint {
            self.accepting_connections = true;
        }

        let decision = make_continue_decision(&event, thread_is_guest);
        if let Some(parts) = self.engine.process_parts(pid) {
            parts.observer.on_decision(tid, &decision);
        }

        if decision.is_halt() {
            info!("halted: pid={pid} tid={tid} event=[{}]", event.os);
            if self.focused_process.is_none() {
                self.focused_process = Some(pid);
            }
            self.focused_thread = Some(tid);
            if self.client_connected && self.continue_pending {
                let reply = stop_reply::from_event(&event);
                self.send_packet(&Packet::Stop(reply));
                self.continue_pending = false;
            }
        } else {
            let option = if decision.pass_exception() {
                ContinueOption::PassException
            } else {
                ContinueOption::Continue
            };
            if let Err(err) = self.resume_process(pid, option) {
                warn!("resuming pid {pid}: {err}");
            }
        }
    }

    /// Compatibility-mode handling of guest announcements before the client
    /// is allowed in: plant the entry-point breakpoint on the first
    /// thread-start, keep everything running until that breakpoint fires.
    /// Returns true when the halt was consumed.
    fn handle_compatibility_rendezvous(&mut self, pid: u32, guest: &GuestEvent) -> bool {
        if !guest.is_guest() {
            return false;
        }

        if *guest == GuestEvent::ThreadStarting && !self.entry_breakpoint_set {
            let planted = {
                let parts = self.engine.process_parts(pid).expect("halted process");
                match parts.process.entry_point() {
                    Some(entry) => {
                        let flat = parts.process.from_guest_to_flat(entry);
                        match parts.process.set_breakpoint(parts.api, flat) {
                            Ok(()) => {
                                info!("entry-point breakpoint planted at {flat:#x}");
                                true
                            }
                            Err(err) => {
                                error!("planting entry-point breakpoint: {err}");
                                false
                            }
                        }
                    }
                    None => {
                        warn!("guest thread started before the application announcement");
                        false
                    }
                }
            };
            self.entry_breakpoint_set = planted;
        }

        if let Err(err) = self.resume_process(pid, ContinueOption::Continue) {
            warn!("resuming pid {pid}: {err}");
        }
        true
    }

    fn resume_process(&mut self, pid: u32, option: ContinueOption) -> Result<(), DebugError> {
        let parts = self
            .engine
            .process_parts(pid)
            .ok_or(DebugError::NotHalted)?;
        parts.process.resume(parts.api, parts.observer, option)
    }

    fn require_focused_process(&mut self) -> Option<u32> {
        match self.focused_process {
            Some(pid) if self.engine.process(pid).is_some() => Some(pid),
            _ => {
                self.send_error(error_code::NO_FOCUSED_PROCESS);
                None
            }
        }
    }

    fn require_focused_thread(&mut self) -> Option<(u32, u32)> {
        let pid = self.require_focused_process()?;
        let tid = match self.focused_thread {
            Some(tid) if self.engine.process(pid).and_then(|p| p.thread(tid)).is_some() => tid,
            _ => {
                self.send_error(error_code::NO_FOCUSED_THREAD);
                return None;
            }
        };
        Some((pid, tid))
    }

    fn send_packet(&mut self, packet: &Packet) {
        let body = packet.to_blob();
        let wire = add_envelope(&body);
        debug!("T> [{}]", body.to_text());
        self.transport.write_all(&wire.to_vec());
    }

    fn send_error(&mut self, code: u8) {
        self.send_packet(&Packet::Error { code });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use debug_core::debug_api::{ThreadContext, X64ThreadContext};
    use debug_core::mock::{events, SharedDebugApi};
    use debug_core::DebugEvent;
    use gdb_rsp::StopReply;

    const PID: u32 = 1;
    const TID: u32 = 2;
    const HOST_TID: u32 = 0x10;
    const ENTRY_FLAT: u64 = 0xc00020080;
    const STRING_ADDR: u64 = 0x7000;

    const APP_CREATE: &str = "{7AA7C9CF-89EC-4ed3-8DAD-6DC84302AB11} -version 1 \
         -event AppCreate -nap 00000000001CD3F0 -mem_start 0xC00000000 \
         -user_entry_pt 0x20080 -initial_entry_pt 0x8000080";
    const THREAD_CREATE: &str = "{7AA7C9CF-89EC-4ed3-8DAD-6DC84302AB11} -version 1 \
         -event ThreadCreate -natp 00000000001CD3F0 ";

    struct Harness {
        server: DebugServer<MockTransport>,
        api: SharedDebugApi,
    }

    impl Harness {
        fn new(compatibility_mode: bool) -> Self {
            let api = SharedDebugApi::new();
            let engine = ExecutionEngine::new(Box::new(api.clone()));
            let mut server = DebugServer::new(MockTransport::default(), engine, compatibility_mode);
            server.start_process("host.exe --no-sandbox", None).unwrap();
            Harness { server, api }
        }

        fn push_event(&self, event: DebugEvent) {
            self.api.with(|m| m.push_event(event));
        }

        fn push_string_event(&self, tid: u32, text: &str) {
            self.api.with(|m| m.map_region(STRING_ADDR, text.as_bytes()));
            self.push_event(events::debug_string(PID, tid, STRING_ADDR, text.len()));
        }

        fn pump(&mut self) {
            self.server.do_work(0);
        }

        fn connect(&mut self) {
            self.server.transport.pending_accept = true;
            self.pump();
            assert!(self.server.client_connected, "client was not accepted");
        }

        fn output(&mut self) -> String {
            String::from_utf8(self.server.transport.take_output()).unwrap()
        }

        fn rpc(&mut self, body: &str) -> String {
            let wire = add_envelope(&Blob::from(body));
            self.server.transport.push_input(&wire.to_vec());
            self.pump();
            self.output()
        }

        fn set_rip(&self, tid: u32, rip: u64) {
            self.api.with(|m| {
                let mut context = X64ThreadContext::default();
                context.rip = rip;
                m.set_context(events::thread_handle(tid), ThreadContext::X64(context));
            });
        }

        /// Create-process, first thread, and the guest `AppCreate`
        /// announcement; leaves the process halted at the announcement.
        fn boot_to_app_create(&mut self) {
            self.push_event(events::create_process(PID, TID));
            self.push_event(events::create_thread(PID, TID));
            self.pump();
            self.pump();
            self.push_string_event(TID, APP_CREATE);
            self.pump();
        }
    }

    fn envelope(packet: &Packet) -> String {
        add_envelope(&packet.to_blob()).to_text()
    }

    /// Ack plus the framed reply, as the client sees a command answered.
    fn reply(packet: &Packet) -> String {
        format!("+{}", envelope(packet))
    }

    fn error_reply(code: u8) -> String {
        reply(&Packet::Error { code })
    }

    #[test]
    fn attach_and_initial_query() {
        let mut h = Harness::new(false);
        h.boot_to_app_create();
        h.connect();

        // SIGSTOP (19) for the announcement halt.
        assert_eq!("+$S13#b7", h.rpc("?"));
        assert_eq!(
            reply(&Packet::Stop(StopReply::Signalled { signal: 0x13 })),
            h.rpc("?")
        );
    }

    #[test]
    fn stop_reason_without_a_debuggee_is_an_error() {
        let mut h = Harness::new(false);
        h.connect();
        assert_eq!(error_reply(error_code::NO_FOCUSED_PROCESS), h.rpc("?"));
    }

    #[test]
    fn breakpoint_set_hit_and_memory_inspected() {
        let mut h = Harness::new(false);
        h.boot_to_app_create();
        h.connect();
        h.api.with(|m| m.map_region(ENTRY_FLAT, &[0x55]));

        // The client plants the trap byte itself through a memory write.
        assert_eq!(reply(&Packet::Ok), h.rpc("Mc00020080,1:cc"));

        // Continue produces no direct reply, only the ack.
        assert_eq!("+", h.rpc("c"));

        // The breakpoint fires; exactly one unsolicited (un-acked) stop.
        h.set_rip(TID, ENTRY_FLAT + 1);
        h.push_event(events::exception(
            PID,
            TID,
            exception::BREAKPOINT,
            ENTRY_FLAT,
        ));
        h.pump();
        assert_eq!("$S05#b8", h.output());

        // The trap byte is still armed at the advertised address.
        assert_eq!(
            reply(&Packet::BlobReply {
                data: Blob::from_hex("cc").unwrap()
            }),
            h.rpc("mc00020080,1")
        );
    }

    #[test]
    fn sandbox_relative_and_flat_reads_see_the_same_memory() {
        let mut h = Harness::new(false);
        h.boot_to_app_create();
        h.connect();
        h.api.with(|m| m.map_region(ENTRY_FLAT, &[0xaa, 0xbb]));

        let flat = h.rpc("mc00020080,2");
        let relative = h.rpc("m20080,2");
        assert_eq!(flat, relative);
        assert_eq!(
            reply(&Packet::BlobReply {
                data: Blob::from_hex("aabb").unwrap()
            }),
            flat
        );
    }

    #[test]
    fn thread_enumeration_lists_only_guest_threads() {
        let mut h = Harness::new(false);
        h.boot_to_app_create();
        h.connect();
        assert_eq!("+", h.rpc("c"));

        // A host-only thread appears and is silently continued past.
        h.push_event(events::create_thread(PID, HOST_TID));
        h.pump();
        assert_eq!("", h.output());

        // The host announces it as a guest thread; that halt is reported.
        h.push_string_event(HOST_TID, THREAD_CREATE);
        h.pump();
        assert_eq!(
            envelope(&Packet::Stop(StopReply::Signalled { signal: 0x13 })),
            h.output()
        );

        assert_eq!(
            reply(&Packet::ThreadInfoReply {
                thread_ids: vec![TID, HOST_TID],
                eom: false,
            }),
            h.rpc("qfThreadInfo")
        );
        assert_eq!("+$m2,10#2c", h.rpc("qfThreadInfo"));
        assert_eq!("+$l#6c", h.rpc("qsThreadInfo"));
    }

    #[test]
    fn host_only_threads_are_never_listed() {
        let mut h = Harness::new(false);
        h.boot_to_app_create();
        h.connect();
        assert_eq!("+", h.rpc("c"));
        h.push_event(events::create_thread(PID, HOST_TID));
        h.pump();
        // Halt again on a guest event so the list can be queried.
        h.push_string_event(TID, THREAD_CREATE);
        h.pump();
        h.output();

        assert_eq!(
            reply(&Packet::ThreadInfoReply {
                thread_ids: vec![TID],
                eom: false,
            }),
            h.rpc("qfThreadInfo")
        );
    }

    #[test]
    fn unknown_thread_is_reported_dead() {
        let mut h = Harness::new(false);
        h.boot_to_app_create();
        h.connect();
        assert_eq!("+$E0a#d6", h.rpc("T1234"));
    }

    #[test]
    fn known_guest_thread_is_alive() {
        let mut h = Harness::new(false);
        h.boot_to_app_create();
        h.connect();
        assert_eq!(reply(&Packet::Ok), h.rpc("T2"));
    }

    #[test]
    fn unsupported_command_gets_the_empty_packet() {
        let mut h = Harness::new(false);
        h.boot_to_app_create();
        h.connect();
        assert_eq!("+$#00", h.rpc("Z4,0,1"));
        assert_eq!("+$#00", h.rpc("vCont;c"));
    }

    #[test]
    fn continue_from_breakpoint_is_transparent() {
        let mut h = Harness::new(true);
        h.api.with(|m| m.map_region(ENTRY_FLAT, &[0x55]));

        h.push_event(events::create_process(PID, TID));
        h.pump();
        h.push_string_event(TID, APP_CREATE);
        h.pump();
        // The thread-start announcement plants the entry breakpoint and
        // resumes; no client is involved yet.
        h.push_string_event(TID, THREAD_CREATE);
        h.pump();
        assert_eq!(Some(0xcc), h.api.with(|m| m.byte_at(ENTRY_FLAT)));

        // Connections are refused until the entry breakpoint fires.
        h.server.transport.pending_accept = true;
        h.pump();
        assert!(!h.server.client_connected);

        h.set_rip(TID, ENTRY_FLAT + 1);
        h.push_event(events::exception(
            PID,
            TID,
            exception::BREAKPOINT,
            ENTRY_FLAT,
        ));
        h.pump();

        // Stopped at entry: now the client may connect and sees SIGTRAP.
        h.connect();
        assert_eq!("+$S05#b8", h.rpc("?"));
        // The breakpoint byte was restored so the client reads the original
        // instruction at the entry point.
        assert_eq!(
            reply(&Packet::BlobReply {
                data: Blob::from_hex("55").unwrap()
            }),
            h.rpc("mc00020080,1")
        );

        // Resume through the breakpoint: disarm, single-step, rearm. The
        // internal single-step leg must not produce a stop reply.
        assert_eq!("+", h.rpc("c"));
        h.push_event(events::exception(
            PID,
            TID,
            exception::SINGLE_STEP,
            ENTRY_FLAT + 1,
        ));
        h.pump();
        assert_eq!("", h.output());
        assert_eq!(Some(0xcc), h.api.with(|m| m.byte_at(ENTRY_FLAT)));

        // The next real halt produces exactly one stop reply.
        h.set_rip(TID, ENTRY_FLAT + 1);
        h.push_event(events::exception(
            PID,
            TID,
            exception::BREAKPOINT,
            ENTRY_FLAT,
        ));
        h.pump();
        assert_eq!(
            envelope(&Packet::Stop(StopReply::Signalled { signal: 5 })),
            h.output()
        );
    }

    #[test]
    fn no_stop_reply_without_a_pending_continue() {
        let mut h = Harness::new(false);
        h.boot_to_app_create();
        // The halt predates the connection; the client never asked to
        // resume, so nothing unsolicited goes out after the accept.
        h.connect();
        assert_eq!("", h.output());
        // Once the client resumes, the next halt is owed a reply.
        assert_eq!("+", h.rpc("c"));
        h.push_string_event(TID, THREAD_CREATE);
        h.pump();
        assert_eq!(
            envelope(&Packet::Stop(StopReply::Signalled { signal: 0x13 })),
            h.output()
        );
    }

    #[test]
    fn query_supported_advertises_packet_size_and_xfer() {
        let mut h = Harness::new(false);
        h.boot_to_app_create();
        h.connect();
        assert_eq!(
            reply(&Packet::QuerySupportedReply {
                features: vec![
                    ("PacketSize".into(), "1000".into()),
                    ("qXfer:libraries:read".into(), "+".into()),
                    ("qXfer:features:read".into(), "+".into()),
                ]
            }),
            h.rpc("qSupported:xmlRegisters=i386;qRelocInsn+")
        );
    }

    #[test]
    fn target_xml_describes_the_architecture() {
        let mut h = Harness::new(false);
        h.boot_to_app_create();
        h.connect();
        assert_eq!(
            reply(&Packet::QXferReply {
                eom: true,
                body: Blob::from(
                    "<target><architecture>i386:x86-64</architecture></target>"
                ),
            }),
            h.rpc("qXfer:features:read:target.xml:0,7ca")
        );
        // Unknown annexes are unsupported.
        assert_eq!("+$#00", h.rpc("qXfer:features:read:library-list.xml:0,100"));
    }

    #[test]
    fn offsets_report_the_guest_memory_base() {
        let mut h = Harness::new(false);
        h.boot_to_app_create();
        h.connect();
        assert_eq!(
            reply(&Packet::OffsetsReply {
                text: 0xc00000000,
                data: 0xc00000000,
            }),
            h.rpc("qOffsets")
        );
        assert_eq!("+$Text=c00000000;Data=c00000000#9a", h.rpc("qOffsets"));
    }

    #[test]
    fn thread_focus_can_move_between_guest_threads() {
        let mut h = Harness::new(false);
        h.boot_to_app_create();
        h.connect();
        assert_eq!("+", h.rpc("c"));
        h.push_event(events::create_thread(PID, HOST_TID));
        h.pump();
        h.push_string_event(HOST_TID, THREAD_CREATE);
        h.pump();
        h.output();

        assert_eq!(
            reply(&Packet::CurrentThread {
                thread_id: HOST_TID
            }),
            h.rpc("qC")
        );
        assert_eq!(reply(&Packet::Ok), h.rpc("Hg2"));
        assert_eq!(
            reply(&Packet::CurrentThread { thread_id: TID }),
            h.rpc("qC")
        );
    }

    #[test]
    fn focusing_all_threads_is_refused() {
        let mut h = Harness::new(false);
        h.boot_to_app_create();
        h.connect();
        assert_eq!(
            error_reply(error_code::FOCUS_ALL_THREADS_UNSUPPORTED),
            h.rpc("Hc-1")
        );
    }

    #[test]
    fn focusing_a_host_thread_is_refused() {
        let mut h = Harness::new(false);
        h.boot_to_app_create();
        h.connect();
        assert_eq!("+", h.rpc("c"));
        h.push_event(events::create_thread(PID, HOST_TID));
        h.pump();
        h.push_string_event(TID, THREAD_CREATE);
        h.pump();
        h.output();

        assert_eq!(
            error_reply(error_code::FOCUS_ALL_THREADS_UNSUPPORTED),
            h.rpc("Hg10")
        );
    }

    #[test]
    fn register_read_returns_the_wire_blob() {
        let mut h = Harness::new(false);
        h.boot_to_app_create();
        h.connect();
        h.set_rip(TID, ENTRY_FLAT);

        let context = h
            .api
            .with(|m| m.context_of(events::thread_handle(TID)))
            .unwrap();
        assert_eq!(
            reply(&Packet::BlobReply {
                data: crate::registers::context_to_blob(&context),
            }),
            h.rpc("g")
        );
    }

    #[test]
    fn register_write_updates_the_context() {
        let mut h = Harness::new(false);
        h.boot_to_app_create();
        h.connect();
        h.set_rip(TID, ENTRY_FLAT);

        let mut context = h
            .api
            .with(|m| m.context_of(events::thread_handle(TID)))
            .unwrap();
        context.set_ip(0xc00030000);
        let blob = crate::registers::context_to_blob(&context);
        assert_eq!(reply(&Packet::Ok), h.rpc(&format!("G{}", blob.to_hex())));
        assert_eq!(
            0xc00030000,
            h.api
                .with(|m| m.context_of(events::thread_handle(TID)))
                .unwrap()
                .ip()
        );
    }

    #[test]
    fn zero_length_read_answers_the_empty_packet() {
        let mut h = Harness::new(false);
        h.boot_to_app_create();
        h.connect();
        assert_eq!("+$#00", h.rpc("mc00020080,0"));
    }

    #[test]
    fn unreadable_memory_is_a_read_error() {
        let mut h = Harness::new(false);
        h.boot_to_app_create();
        h.connect();
        assert_eq!(
            error_reply(error_code::READ_MEMORY_FAILED),
            h.rpc("mdeadbeef,4")
        );
    }

    #[test]
    fn oversized_memory_write_is_refused() {
        let mut h = Harness::new(false);
        h.boot_to_app_create();
        h.connect();
        let payload = "00".repeat(gdb_rsp::MAX_PACKET_SIZE + 1);
        let body = format!("M1000,{:x}:{payload}", gdb_rsp::MAX_PACKET_SIZE + 1);
        assert_eq!(error_reply(error_code::PACKET_TOO_LARGE), h.rpc(&body));
    }

    #[test]
    fn malformed_arguments_are_an_error_reply() {
        let mut h = Harness::new(false);
        h.boot_to_app_create();
        h.connect();
        assert_eq!(
            error_reply(error_code::MALFORMED_PACKET),
            h.rpc("mc00020080")
        );
    }

    #[test]
    fn break_request_traps_the_focused_process() {
        let mut h = Harness::new(false);
        h.boot_to_app_create();
        h.connect();
        assert_eq!("+", h.rpc("c"));

        h.server.transport.push_input(&[0x03]);
        h.pump();
        assert_eq!(
            vec![events::process_handle(PID)],
            h.api.with(|m| m.broken_into().to_vec())
        );
    }

    #[test]
    fn exit_is_reported_with_the_exit_code() {
        let mut h = Harness::new(false);
        h.boot_to_app_create();
        h.connect();
        assert_eq!("+", h.rpc("c"));

        h.push_event(events::exit_process(PID, TID, 3));
        h.pump();
        assert_eq!(
            envelope(&Packet::Stop(StopReply::Exited {
                exit_code: 3,
                pid: Some(PID),
            })),
            h.output()
        );
    }

    #[test]
    fn second_app_create_is_surfaced_as_an_error() {
        let mut h = Harness::new(false);
        h.boot_to_app_create();
        h.connect();
        assert_eq!("+", h.rpc("c"));

        h.push_string_event(TID, APP_CREATE);
        h.pump();
        assert_eq!(
            envelope(&Packet::Error {
                code: error_code::GUEST_APP_ALREADY_CREATED
            }),
            h.output()
        );
    }

    #[test]
    fn bad_checksum_is_dropped_without_an_ack() {
        let mut h = Harness::new(false);
        h.boot_to_app_create();
        h.connect();
        h.server.transport.push_input(b"$qC#00");
        h.pump();
        assert_eq!("", h.output());
    }
}
