//! Decoder seam and block assembly.
//!
//! The core never decodes guest instructions itself. A [`Translator`] walks
//! one basic block's worth of guest bytes through a [`GuestMemView`] and
//! drives a [`BlockAssembler`], which lowers the emit calls into the host op
//! stream, tracks the fetched byte range, and reserves link-site patch
//! regions at static exits. The engine prepends the block prologue
//! (entry accounting, optional checksum guard) after assembly.

use kite_mmu::{page_base, AddressSpaceMap, GuestRam, PageKind, Width, PAGE_SIZE};

use crate::code::{HostOp, Reg, SemanticFn};
use crate::error::CompileError;

/// Read-only view of guest memory for instruction fetch. Fetches resolve
/// through the address-space map; only RAM-backed pages are fetchable.
pub struct GuestMemView<'a> {
    ram: &'a GuestRam,
    map: &'a AddressSpaceMap,
}

impl<'a> GuestMemView<'a> {
    pub fn new(ram: &'a GuestRam, map: &'a AddressSpaceMap) -> Self {
        Self { ram, map }
    }

    /// Fetch `buf.len()` guest bytes starting at `vaddr`.
    pub fn read_into(&self, vaddr: u64, buf: &mut [u8]) -> Result<(), CompileError> {
        let mut addr = vaddr;
        let mut filled = 0;
        while filled < buf.len() {
            let PageKind::Ram { paddr } = self.map.resolve(addr) else {
                return Err(CompileError::Fetch { addr });
            };
            let in_page = (page_base(kite_mmu::page_of(addr)) + PAGE_SIZE - addr) as usize;
            let take = in_page.min(buf.len() - filled);
            let src = self
                .ram
                .bytes(paddr, take as u64)
                .map_err(|_| CompileError::Fetch { addr })?;
            buf[filled..filled + take].copy_from_slice(src);
            filled += take;
            addr += take as u64;
        }
        Ok(())
    }

    pub fn read_bytes(&self, vaddr: u64, len: usize) -> Result<Vec<u8>, CompileError> {
        let mut buf = vec![0; len];
        self.read_into(vaddr, &mut buf)?;
        Ok(buf)
    }

    pub fn read_u8(&self, vaddr: u64) -> Result<u8, CompileError> {
        let mut b = [0u8; 1];
        self.read_into(vaddr, &mut b)?;
        Ok(b[0])
    }

    pub fn read_u32(&self, vaddr: u64) -> Result<u32, CompileError> {
        let mut b = [0u8; 4];
        self.read_into(vaddr, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }
}

/// The external decoder. One call translates one basic block starting at
/// `pc`, stopping at the first control transfer or when the assembler hits
/// its instruction limit.
pub trait Translator {
    fn translate(
        &mut self,
        mem: &GuestMemView<'_>,
        pc: u64,
        asm: &mut BlockAssembler,
    ) -> Result<(), CompileError>;
}

/// Finished assembly, ready for the engine to allocate.
pub struct AssembledBlock {
    pub start: u64,
    /// One past the last fetched byte.
    pub end: u64,
    pub ops: Vec<HostOp>,
    pub instruction_count: u32,
    /// Offsets (into `ops`) of the first slot of each link-site region.
    pub site_offsets: Vec<u32>,
}

/// Lowers decoder emit calls into host ops.
///
/// Exactly one terminator call (`branch`, `branch_cond`, `call`, `ret`,
/// `jump_indirect`, `stop`) must end the block; emitting past it or
/// finishing without one is a decoder bug reported by [`finish`].
///
/// [`finish`]: BlockAssembler::finish
pub struct BlockAssembler {
    start: u64,
    end: u64,
    ops: Vec<HostOp>,
    instruction_count: u32,
    max_instructions: u32,
    site_offsets: Vec<u32>,
    terminated: bool,
}

impl BlockAssembler {
    pub fn new(start: u64, max_instructions: u32) -> Self {
        Self {
            start,
            end: start,
            ops: Vec::new(),
            instruction_count: 0,
            max_instructions,
            site_offsets: Vec::new(),
            terminated: false,
        }
    }

    /// Record that `[addr, addr + len)` was fetched; drives invalidation
    /// scope and checksum coverage.
    pub fn note_fetched(&mut self, addr: u64, len: u64) {
        self.end = self.end.max(addr + len);
    }

    /// Count one guest instruction. Call once per decoded instruction.
    pub fn instruction(&mut self) {
        self.instruction_count += 1;
    }

    /// True once the configured block-length cap is reached; the decoder
    /// should terminate with a fallthrough `branch` to the next pc.
    pub fn at_limit(&self) -> bool {
        self.max_instructions != 0 && self.instruction_count >= self.max_instructions
    }

    pub fn exec(&mut self, f: SemanticFn) {
        debug_assert!(!self.terminated);
        self.ops.push(HostOp::Exec(f));
    }

    pub fn load(&mut self, dst: Reg, addr: Reg, width: Width) {
        debug_assert!(!self.terminated);
        self.ops.push(HostOp::Load {
            dst,
            addr,
            width,
            mmio: false,
        });
    }

    /// Mid-block interrupt/slice check point. On a pending interrupt or an
    /// exhausted slice, execution exits here and resumes at `resume_pc`, so
    /// a long straight-line block does not hold off the exit until its end.
    /// `resume_pc` must be a valid block entry (an instruction boundary).
    pub fn interrupt_point(&mut self, resume_pc: u64) {
        debug_assert!(!self.terminated);
        self.ops.push(HostOp::InterruptCheck { resume_pc });
    }

    pub fn store(&mut self, src: Reg, addr: Reg, width: Width) {
        debug_assert!(!self.terminated);
        self.ops.push(HostOp::Store {
            src,
            addr,
            width,
            mmio: false,
        });
    }

    /// Two-slot unlinked site; the engine registers it and patches in the
    /// real site id after allocation.
    fn emit_site(&mut self) {
        self.site_offsets.push(self.ops.len() as u32);
        self.ops.push(HostOp::LinkNop);
        self.ops.push(HostOp::LinkNop);
    }

    /// Unconditional direct branch to `target`.
    pub fn branch(&mut self, target: u64) {
        debug_assert!(!self.terminated);
        self.ops.push(HostOp::SetPc { guest: target });
        self.emit_site();
        self.terminated = true;
    }

    /// Conditional branch: taken when `cond` is non-zero. Both arms share
    /// one link site.
    pub fn branch_cond(&mut self, cond: Reg, taken: u64, fallthrough: u64) {
        debug_assert!(!self.terminated);
        self.ops.push(HostOp::BranchCond {
            cond,
            taken,
            fallthrough,
        });
        self.emit_site();
        self.terminated = true;
    }

    /// Direct call: linkable like a branch, plus a return prediction for
    /// `ret_pc`. Architectural link-register updates are the decoder's job
    /// (via `exec`); this only covers control flow and prediction.
    pub fn call(&mut self, target: u64, ret_pc: u64) {
        debug_assert!(!self.terminated);
        self.ops.push(HostOp::PushRet { ret_pc });
        self.ops.push(HostOp::SetPc { guest: target });
        self.emit_site();
        self.terminated = true;
    }

    /// Return: pc comes from `reg`, validated against the prediction stack.
    pub fn ret(&mut self, reg: Reg) {
        debug_assert!(!self.terminated);
        self.ops.push(HostOp::SetPcReg { reg });
        self.ops.push(HostOp::Ret);
        self.terminated = true;
    }

    /// Computed jump: pc comes from `reg`, always routed through the lookup
    /// table.
    pub fn jump_indirect(&mut self, reg: Reg) {
        debug_assert!(!self.terminated);
        self.ops.push(HostOp::SetPcReg { reg });
        self.ops.push(HostOp::JumpIndirect);
        self.terminated = true;
    }

    /// Explicit stop (halt, trap to the embedder). Execution resumes at
    /// `next_pc` on the next `enter`.
    pub fn stop(&mut self, next_pc: u64) {
        debug_assert!(!self.terminated);
        self.ops.push(HostOp::SetPc { guest: next_pc });
        self.ops.push(HostOp::Exit);
        self.terminated = true;
    }

    pub fn finish(self) -> Result<AssembledBlock, CompileError> {
        if self.instruction_count == 0 {
            return Err(CompileError::EmptyBlock);
        }
        if !self.terminated {
            return Err(CompileError::MissingTerminator);
        }
        Ok(AssembledBlock {
            start: self.start,
            end: self.end,
            ops: self.ops,
            instruction_count: self.instruction_count,
            site_offsets: self.site_offsets,
        })
    }
}
