//! Host-side representation of translated code.
//!
//! "Host code" is a compact register-machine op stream held in a
//! [`CodeArena`] owned by the execution core. Arena slots stand in for host
//! instruction bytes: a block occupies a contiguous slot range, patchable
//! regions are individual slots reserved at generation time, and a patch is
//! a single-slot overwrite. Slot 0 is permanently the compile trampoline, so
//! a lookup-table miss and a hit look identical to the code that takes the
//! jump.

use std::fmt;
use std::sync::Arc;

use kite_mmu::Width;

use crate::cache::BlockId;
use crate::link::SiteId;

pub const GPR_COUNT: usize = 16;

/// Host execution context. The guest register file is loaded in here on
/// `enter` and stored back on exit.
#[derive(Debug, Clone)]
pub struct CpuState {
    pub regs: [u64; GPR_COUNT],
    pub pc: u64,
}

impl CpuState {
    pub fn new() -> Self {
        Self {
            regs: [0; GPR_COUNT],
            pc: 0,
        }
    }

    #[inline]
    pub fn reg(&self, r: Reg) -> u64 {
        self.regs[r.0 as usize]
    }

    #[inline]
    pub fn set_reg(&mut self, r: Reg, value: u64) {
        self.regs[r.0 as usize] = value;
    }
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new()
    }
}

/// Index into the host register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reg(pub u8);

/// Opaque guest-instruction semantics produced by the decoder's emit calls.
pub type SemanticFn = Arc<dyn Fn(&mut CpuState)>;

/// Index of an arena slot; the portable analog of a host code address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostAddr(pub u32);

impl HostAddr {
    /// The compile trampoline. Every lookup-table slot starts out pointing
    /// here.
    pub const TRAMPOLINE: HostAddr = HostAddr(0);

    #[inline]
    pub fn next(self) -> HostAddr {
        HostAddr(self.0 + 1)
    }

    #[inline]
    pub fn offset(self, delta: u32) -> HostAddr {
        HostAddr(self.0 + delta)
    }
}

/// One slot of generated code.
#[derive(Clone)]
pub enum HostOp {
    /// Slot 0 only: a lookup miss landed here; the controller compiles.
    Trampoline,
    /// Slot belonged to an evicted block. Executing it is a core bug.
    Dead,
    /// First op of every block: establishes the executing block and charges
    /// the time slice. `cost` is the block's guest instruction count.
    BlockEntry { block: BlockId, cost: u32 },
    /// Recompute the block's source checksum and bail out on mismatch.
    /// Present only when the block's pages use checksum invalidation.
    EntryGuard { block: BlockId },
    /// Decoder-requested mid-block check point: exit at `resume_pc` if an
    /// interrupt is pending or the time slice has run out. Emitted inside
    /// long blocks so exit latency is not bounded by block length.
    InterruptCheck { resume_pc: u64 },
    /// Opaque decoder semantics.
    Exec(SemanticFn),
    /// Guest load through the memory fast path. `mmio` is set when the site
    /// has been backpatched to call the device handler directly.
    Load {
        dst: Reg,
        addr: Reg,
        width: Width,
        mmio: bool,
    },
    /// Guest store; same specialization as [`HostOp::Load`], plus the
    /// self-modifying-code checks.
    Store {
        src: Reg,
        addr: Reg,
        width: Width,
        mmio: bool,
    },
    /// `pc = guest`.
    SetPc { guest: u64 },
    /// `pc = regs[reg]` (indirect successors, returns).
    SetPcReg { reg: Reg },
    /// `pc = if regs[cond] != 0 { taken } else { fallthrough }`.
    BranchCond {
        cond: Reg,
        taken: u64,
        fallthrough: u64,
    },
    /// Push a return prediction for `ret_pc` at a guest call site.
    PushRet { ret_pc: u64 },
    /// Pop and validate the return prediction against `pc`.
    Ret,
    /// Route `pc` through the lookup table.
    JumpIndirect,
    /// Unlinked placeholder; sized so any link patch fits in its slot.
    LinkNop,
    /// Link-site fallback: invoke the linker with the current `pc`.
    CallLinker { site: SiteId },
    /// Singly-linked form: `if pc == guest { goto host }`.
    CondLink { guest: u64, host: HostAddr },
    /// Doubly-linked terminal form: unconditional branch.
    Jump { host: HostAddr },
    /// Leave the JIT with an explicit stop.
    Exit,
}

impl fmt::Debug for HostOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostOp::Trampoline => write!(f, "Trampoline"),
            HostOp::Dead => write!(f, "Dead"),
            HostOp::BlockEntry { block, cost } => {
                write!(f, "BlockEntry({block:?}, cost={cost})")
            }
            HostOp::EntryGuard { block } => write!(f, "EntryGuard({block:?})"),
            HostOp::InterruptCheck { resume_pc } => {
                write!(f, "InterruptCheck(resume={resume_pc:#x})")
            }
            HostOp::Exec(_) => write!(f, "Exec(..)"),
            HostOp::Load {
                dst, addr, width, mmio,
            } => write!(f, "Load({dst:?} <- [{addr:?}], {width:?}, mmio={mmio})"),
            HostOp::Store {
                src, addr, width, mmio,
            } => write!(f, "Store([{addr:?}] <- {src:?}, {width:?}, mmio={mmio})"),
            HostOp::SetPc { guest } => write!(f, "SetPc({guest:#x})"),
            HostOp::SetPcReg { reg } => write!(f, "SetPcReg({reg:?})"),
            HostOp::BranchCond {
                cond,
                taken,
                fallthrough,
            } => write!(f, "BranchCond({cond:?}, {taken:#x}, {fallthrough:#x})"),
            HostOp::PushRet { ret_pc } => write!(f, "PushRet({ret_pc:#x})"),
            HostOp::Ret => write!(f, "Ret"),
            HostOp::JumpIndirect => write!(f, "JumpIndirect"),
            HostOp::LinkNop => write!(f, "LinkNop"),
            HostOp::CallLinker { site } => write!(f, "CallLinker({site:?})"),
            HostOp::CondLink { guest, host } => {
                write!(f, "CondLink(pc=={guest:#x} -> {host:?})")
            }
            HostOp::Jump { host } => write!(f, "Jump({host:?})"),
            HostOp::Exit => write!(f, "Exit"),
        }
    }
}

/// Owned, append-only code memory.
///
/// Blocks are allocated contiguously; eviction overwrites their slots with
/// [`HostOp::Dead`] rather than reclaiming them (space is reclaimed wholesale
/// by `flush_all`, matching a real code cache that frees regions, not ops).
#[derive(Debug)]
pub struct CodeArena {
    ops: Vec<HostOp>,
}

impl CodeArena {
    pub fn new() -> Self {
        Self {
            ops: vec![HostOp::Trampoline],
        }
    }

    /// Append a block's ops, returning its host entry address.
    pub fn alloc(&mut self, ops: Vec<HostOp>) -> HostAddr {
        let entry = HostAddr(self.ops.len() as u32);
        self.ops.extend(ops);
        entry
    }

    #[inline]
    pub fn op(&self, addr: HostAddr) -> &HostOp {
        &self.ops[addr.0 as usize]
    }

    /// Overwrite a single slot. All self-modification of generated code is
    /// funneled through here; one slot is the unit a concurrent executor
    /// could observe atomically.
    #[inline]
    pub fn patch(&mut self, addr: HostAddr, op: HostOp) {
        self.ops[addr.0 as usize] = op;
    }

    pub fn deaden(&mut self, start: HostAddr, len: u32) {
        for slot in &mut self.ops[start.0 as usize..(start.0 + len) as usize] {
            *slot = HostOp::Dead;
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        false // slot 0 always exists
    }

    /// Drop all generated code, keeping only the trampoline.
    pub fn reset(&mut self) {
        self.ops.clear();
        self.ops.push(HostOp::Trampoline);
    }
}

impl Default for CodeArena {
    fn default() -> Self {
        Self::new()
    }
}
