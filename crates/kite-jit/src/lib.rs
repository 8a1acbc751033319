//! Dynamic-translation execution core.
//!
//! Guest code is translated one basic block at a time into a host op stream
//! and dispatched through a flat lookup table whose slots default to the
//! compile trampoline, so a miss simply compiles and retries. Predictable
//! block exits are rewritten in place by the [`Linker`] to jump directly to
//! their targets; returns go through a [`ReturnPrediction`] stack; guest
//! loads and stores take a fastmem-style direct path that specializes
//! itself at MMIO sites. Self-modifying code is caught by per-page write
//! protection, per-byte bitmaps, or entry checksums, with automatic
//! escalation between them (see [`InvalidateMode`]).
//!
//! The embedder supplies the instruction decoder (the [`Translator`] seam)
//! and the device model (the [`kite_mmu::MmioHandler`] seam), then drives
//! the [`Engine`] with `enter` calls.

mod cache;
mod code;
mod error;
mod exec;
mod invalidate;
mod link;
mod lookup;
mod ret_stack;
mod translate;

pub use cache::{BlockId, CodeCache, CompiledBlock};
pub use code::{CodeArena, CpuState, HostAddr, HostOp, Reg, SemanticFn, GPR_COUNT};
pub use error::{CompileError, CoreError, GuestFault};
pub use exec::{Engine, ExitReason, JitConfig, JitStats, RunExit};
pub use invalidate::{DirtyState, InvalidateMode, StoreCheck};
pub use link::{LinkOutcome, LinkState, Linker, SiteId};
pub use lookup::LookupTable;
pub use ret_stack::ReturnPrediction;
pub use translate::{AssembledBlock, BlockAssembler, GuestMemView, Translator};
