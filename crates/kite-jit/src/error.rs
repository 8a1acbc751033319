//! Error taxonomy.
//!
//! Recoverable conditions (trampoline miss, bitmap hit, checksum mismatch)
//! are handled inside the core and never appear here. Guest-visible faults
//! exit the dispatch loop as [`GuestFault`] values; only conditions fatal to
//! the current guest context (never the process) surface as [`CoreError`].

use thiserror::Error;

/// A fault attributable to the guest, routed back to the embedder as an
/// exit reason rather than an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GuestFault {
    #[error("guest address {addr:#x} outside the representable range")]
    OutOfRange { addr: u64 },
    #[error("guest access to unmapped address {addr:#x}")]
    Unmapped { addr: u64 },
}

/// Decoder-side translation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("instruction fetch at {addr:#x} failed")]
    Fetch { addr: u64 },
    #[error("unsupported instruction at {pc:#x}: {detail}")]
    Unsupported { pc: u64, detail: String },
    #[error("translated block has no terminator")]
    MissingTerminator,
    #[error("translated block is empty")]
    EmptyBlock,
}

/// Conditions fatal to the current guest context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("translation failed at {pc:#x}")]
    Compile {
        pc: u64,
        #[source]
        source: CompileError,
    },
    /// A protection fault on a page the core never protected. This is a
    /// genuine host-level fault unrelated to emulation and must be forwarded,
    /// never swallowed.
    #[error("protection fault at {addr:#x} outside any tracked guest region")]
    UnattributedFault { addr: u64 },
}
