//! Remote debugging bridge for sandboxed guest code.
//!
//! Attaches to (or launches) a host program that runs sandboxed guest code
//! and speaks the GDB remote serial protocol over TCP, presenting the guest
//! threads as if they were the whole process.

use anyhow::Result;
use clap::{Arg, ArgAction, Command};
use flexi_logger::{Cleanup, Criterion, Duplicate, FileSpec, Logger, Naming};
use log::{error, info};

use debug_core::{DebugApi, ExecutionEngine};

use crate::server::DebugServer;
use crate::transport::TcpTransport;

mod registers;
mod server;
mod stop_reply;
mod transport;

const EXIT_NO_PROGRAM: i32 = 1;
const EXIT_LISTEN_FAILED: i32 = 2;
const EXIT_START_PROCESS_FAILED: i32 = 3;
const EXIT_INIT_FAILED: i32 = 4;

const DEFAULT_PORT: &str = "4014";
const PUMP_INTERVAL_MS: u32 = 20;

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let matches = Command::new("guest-gdb-server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("GDB remote-protocol bridge for sandboxed guest code")
        .arg(
            Arg::new("port")
                .long("port")
                .value_name("N")
                .value_parser(clap::value_parser!(u16))
                .default_value(DEFAULT_PORT)
                .help("TCP port to listen on"),
        )
        .arg(
            Arg::new("program")
                .long("program")
                .value_name("CMDLINE")
                .help("Command line to launch under the debugger"),
        )
        .arg(
            Arg::new("attach")
                .long("attach")
                .value_name("PID")
                .value_parser(clap::value_parser!(u32))
                .conflicts_with("program")
                .help("Attach to a running process instead of launching one"),
        )
        .arg(
            Arg::new("compatibility-mode")
                .long("compatibility-mode")
                .action(ArgAction::SetTrue)
                .help("Stop at the guest entry point before accepting a client"),
        )
        .get_matches();

    // The handle keeps the rotating file writer alive until exit.
    let _logger = match init_logging() {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("failed to initialise logging: {err:#}");
            return EXIT_INIT_FAILED;
        }
    };

    let port = *matches.get_one::<u16>("port").expect("defaulted");
    let program = matches.get_one::<String>("program");
    let attach_pid = matches.get_one::<u32>("attach").copied();
    let compatibility_mode = matches.get_flag("compatibility-mode");

    if program.is_none() && attach_pid.is_none() {
        eprintln!("a program to debug must be given with --program (or --attach <pid>)");
        return EXIT_NO_PROGRAM;
    }

    let api = match native_debug_api() {
        Ok(api) => api,
        Err(err) => {
            error!("debug API unavailable: {err:#}");
            return EXIT_INIT_FAILED;
        }
    };
    let engine = ExecutionEngine::new(api);

    let transport = match TcpTransport::listen(port) {
        Ok(transport) => transport,
        Err(err) => {
            error!("cannot listen on port {port}: {err:#}");
            return EXIT_LISTEN_FAILED;
        }
    };

    let mut server = DebugServer::new(transport, engine, compatibility_mode);

    let started = match (program, attach_pid) {
        (Some(cmdline), _) => {
            info!("starting [{cmdline}]");
            server.start_process(cmdline, None)
        }
        (None, Some(pid)) => server.attach(pid),
        (None, None) => unreachable!("checked above"),
    };
    if let Err(err) = started {
        error!("cannot start debuggee: {err:#}");
        return EXIT_START_PROCESS_FAILED;
    }

    info!("debug server ready on port {port}");
    while !server.process_exited() {
        server.do_work(PUMP_INTERVAL_MS);
    }
    info!("debuggee exited, shutting down");
    0
}

fn init_logging() -> Result<flexi_logger::LoggerHandle> {
    let handle = Logger::try_with_str("debug")?
        .log_to_file(
            FileSpec::default()
                .directory(".")
                .basename("guest-gdb-server"),
        )
        .rotate(
            Criterion::Size(10 * 1024 * 1024),
            Naming::Numbers,
            Cleanup::KeepLogFiles(5),
        )
        .duplicate_to_stdout(Duplicate::Info)
        .start()?;
    Ok(handle)
}

#[cfg(windows)]
fn native_debug_api() -> Result<Box<dyn DebugApi>> {
    Ok(Box::new(debug_core::windows::WindowsDebugApi::new()))
}

#[cfg(not(windows))]
fn native_debug_api() -> Result<Box<dyn DebugApi>> {
    anyhow::bail!("the native debug API is only available on Windows")
}
