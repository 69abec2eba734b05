//! Software breakpoints: one overwritten instruction byte per address.

use anyhow::Context;
use log::trace;

use crate::debug_api::{DebugApi, NativeHandle};
use crate::error::Result;

/// `int 3` on x86.
pub const TRAP_INSTRUCTION: u8 = 0xcc;

/// One (address, original byte) pair on one process.
///
/// Invariant: while armed, debuggee memory at `address` holds the trap byte;
/// while disarmed it holds `original_byte` (unless the debuggee itself wrote
/// there).
#[derive(Debug)]
pub struct Breakpoint {
    address: u64,
    original_byte: u8,
    armed: bool,
}

impl Breakpoint {
    pub fn new(address: u64) -> Self {
        Breakpoint {
            address,
            original_byte: 0,
            armed: false,
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn original_byte(&self) -> u8 {
        self.original_byte
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Saves the byte at the address and overwrites it with the trap
    /// instruction. On a read failure the breakpoint stays unarmed and
    /// memory is untouched. Idempotent while armed.
    pub fn arm(&mut self, api: &mut dyn DebugApi, process: NativeHandle) -> Result<()> {
        if self.armed {
            return Ok(());
        }

        let mut byte = [0u8; 1];
        api.read_memory(process, self.address, &mut byte)
            .with_context(|| format!("reading original byte at {:#x}", self.address))?;
        self.original_byte = byte[0];

        write_instruction_byte(api, process, self.address, TRAP_INSTRUCTION)?;
        self.armed = true;
        trace!("armed breakpoint at {:#x}", self.address);
        Ok(())
    }

    /// Restores the original byte. A no-op on an unarmed breakpoint.
    pub fn disarm(&mut self, api: &mut dyn DebugApi, process: NativeHandle) -> Result<()> {
        if !self.armed {
            return Ok(());
        }
        write_instruction_byte(api, process, self.address, self.original_byte)?;
        self.armed = false;
        trace!("disarmed breakpoint at {:#x}", self.address);
        Ok(())
    }

    /// Writes the trap byte again without re-reading memory. Used while
    /// resuming through a breakpoint, where the saved original byte must be
    /// kept.
    pub fn rearm(&mut self, api: &mut dyn DebugApi, process: NativeHandle) -> Result<()> {
        write_instruction_byte(api, process, self.address, TRAP_INSTRUCTION)?;
        self.armed = true;
        trace!("rearmed breakpoint at {:#x}", self.address);
        Ok(())
    }
}

fn write_instruction_byte(
    api: &mut dyn DebugApi,
    process: NativeHandle,
    address: u64,
    byte: u8,
) -> Result<()> {
    api.write_memory(process, address, &[byte])
        .with_context(|| format!("patching instruction byte at {address:#x}"))?;
    api.flush_instruction_cache(process, address, 1)?;
    Ok(())
}
