//! Thread-context ↔ wire register blob conversion.
//!
//! The wire layout is gdbserver's: a fixed-order concatenation of registers
//! per ISA (see gdb's `regformats/reg-i386.dat` and `reg-x86-64.dat`). Each
//! layout is one declarative table; the code walking a table is
//! architecture-neutral, so a new ISA is a new table and nothing else.
//!
//! Segment registers are 16 bits in the 64-bit OS context but travel in
//! 32-bit wire slots: zero-extended on read, truncated on write.

use std::mem::size_of;

use debug_core::debug_api::{ThreadContext, X64ThreadContext, X86ThreadContext};
use gdb_rsp::Blob;
use memoffset::offset_of;

struct RegisterSlot {
    #[allow(dead_code)]
    name: &'static str,
    ctx_offset: usize,
    ctx_size: usize,
    flat_size: usize,
}

macro_rules! reg {
    ($ctx:ty, $field:ident, $size:expr) => {
        RegisterSlot {
            name: stringify!($field),
            ctx_offset: offset_of!($ctx, $field),
            ctx_size: $size,
            flat_size: $size,
        }
    };
    ($ctx:ty, $field:ident, $size:expr, wire $flat:expr) => {
        RegisterSlot {
            name: stringify!($field),
            ctx_offset: offset_of!($ctx, $field),
            ctx_size: $size,
            flat_size: $flat,
        }
    };
}

fn x64_layout() -> Vec<RegisterSlot> {
    type C = X64ThreadContext;
    vec![
        reg!(C, rax, 8),
        reg!(C, rbx, 8),
        reg!(C, rcx, 8),
        reg!(C, rdx, 8),
        reg!(C, rsi, 8),
        reg!(C, rdi, 8),
        reg!(C, rbp, 8),
        reg!(C, rsp, 8),
        reg!(C, r8, 8),
        reg!(C, r9, 8),
        reg!(C, r10, 8),
        reg!(C, r11, 8),
        reg!(C, r12, 8),
        reg!(C, r13, 8),
        reg!(C, r14, 8),
        reg!(C, r15, 8),
        reg!(C, rip, 8),
        reg!(C, eflags, 4),
        reg!(C, seg_cs, 2, wire 4),
        reg!(C, seg_ss, 2, wire 4),
        reg!(C, seg_ds, 2, wire 4),
        reg!(C, seg_es, 2, wire 4),
        reg!(C, seg_fs, 2, wire 4),
        reg!(C, seg_gs, 2, wire 4),
    ]
}

fn x86_layout() -> Vec<RegisterSlot> {
    type C = X86ThreadContext;
    vec![
        reg!(C, eax, 4),
        reg!(C, ecx, 4),
        reg!(C, edx, 4),
        reg!(C, ebx, 4),
        reg!(C, esp, 4),
        reg!(C, ebp, 4),
        reg!(C, esi, 4),
        reg!(C, edi, 4),
        reg!(C, eip, 4),
        reg!(C, eflags, 4),
        reg!(C, seg_cs, 4),
        reg!(C, seg_ss, 4),
        reg!(C, seg_ds, 4),
        reg!(C, seg_es, 4),
        reg!(C, seg_fs, 4),
        reg!(C, seg_gs, 4),
    ]
}

// Plain bags of little-endian integers with #[repr(C)]; viewing them as
// bytes is sound, and it is exactly what the table-driven copy needs.
fn context_bytes<T>(ctx: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts((ctx as *const T).cast::<u8>(), size_of::<T>()) }
}

fn context_bytes_mut<T>(ctx: &mut T) -> &mut [u8] {
    unsafe { std::slice::from_raw_parts_mut((ctx as *mut T).cast::<u8>(), size_of::<T>()) }
}

fn encode(bytes: &[u8], layout: &[RegisterSlot]) -> Blob {
    let mut blob = Blob::new();
    for slot in layout {
        let field = &bytes[slot.ctx_offset..slot.ctx_offset + slot.ctx_size];
        blob.extend_from_slice(field);
        // Zero-extend into the wider wire slot.
        for _ in slot.ctx_size..slot.flat_size {
            blob.push_back(0);
        }
    }
    blob
}

fn decode(data: &[u8], bytes: &mut [u8], layout: &[RegisterSlot]) -> bool {
    let expected: usize = layout.iter().map(|s| s.flat_size).sum();
    if data.len() != expected {
        return false;
    }
    let mut flat_offset = 0;
    for slot in layout {
        // Truncate to the native width; high wire bytes are dropped.
        let take = slot.ctx_size.min(slot.flat_size);
        bytes[slot.ctx_offset..slot.ctx_offset + take]
            .copy_from_slice(&data[flat_offset..flat_offset + take]);
        flat_offset += slot.flat_size;
    }
    true
}

/// Flattens a thread context into the wire register blob.
pub fn context_to_blob(context: &ThreadContext) -> Blob {
    match context {
        ThreadContext::X86(ctx) => encode(context_bytes(ctx), &x86_layout()),
        ThreadContext::X64(ctx) => encode(context_bytes(ctx), &x64_layout()),
    }
}

/// Applies a wire register blob onto `context`. `false` when the blob does
/// not match the layout size.
pub fn blob_to_context(data: &Blob, context: &mut ThreadContext) -> bool {
    let data = data.to_vec();
    match context {
        ThreadContext::X86(ctx) => decode(&data, context_bytes_mut(ctx), &x86_layout()),
        ThreadContext::X64(ctx) => decode(&data, context_bytes_mut(ctx), &x64_layout()),
    }
}
