use thiserror::Error;

/// Failures of core operations that the protocol layer must tell apart to
/// pick the right error reply.
#[derive(Debug, Error)]
pub enum DebugError {
    #[error("operation requires a halted process")]
    NotHalted,

    #[error("no thread with id {0:#x}")]
    NoSuchThread(u32),

    #[error("breakpoint already set at {0:#x}")]
    DuplicateBreakpoint(u64),

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DebugError>;
