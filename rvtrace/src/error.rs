use thiserror::Error;

use rvtrace_guest::GuestError;
use rvtrace_symbols::SymbolError;

/// Errors that can terminate the profiling run. Every variant here is fatal:
/// non-fatal conditions (callstack underflow, a missed rewind) are recorded
/// as warnings in the event log and the human-readable profiler log instead
/// of being returned as `Err`.
#[derive(Debug, Error)]
pub enum ProfilerError {
    #[error("setup error: {0}")]
    Setup(String),

    #[error("symbol lookup failed: {0}")]
    Symbol(#[from] SymbolError),

    #[error("guest memory fault during hook `{hook}` at pid {pid:?}: {source}")]
    HookMemoryFault {
        hook: &'static str,
        pid: Option<u32>,
        #[source]
        source: GuestError,
    },

    #[error("ganged-step divergence at pc 0x{0:x}: functional model produced 0x{1:x}")]
    GangedDivergence(u64, u64),

    #[error("PLIC out of pending: replay requested SEIP but no device produced one")]
    PlicOutOfPending,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ProfilerResult<T> = Result<T, ProfilerError>;
