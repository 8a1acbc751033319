//! The execution engine: dispatch loop, compile trampoline, memory fast
//! path, and the invalidation plumbing that ties the subsystems together.
//!
//! `enter` runs translated guest code until something forces control back to
//! the embedder: time-slice expiry, a pending interrupt, an explicit stop,
//! or a guest fault. Compilation, linking, and invalidation all happen
//! synchronously on this one thread of control; the only suspension points
//! are the documented exits.

use std::collections::HashMap;

use kite_mmu::{
    page_of, AddressSpaceMap, GuestRam, MmioHandler, PageFlags, PageKind, ProtectionTable, Width,
    PAGE_SIZE,
};
use xxhash_rust::xxh3::xxh3_64;

use crate::cache::{BlockId, CodeCache, CompiledBlock};
use crate::code::{CodeArena, CpuState, HostAddr, HostOp};
use crate::error::{CoreError, GuestFault};
use crate::invalidate::{DirtyState, InvalidateMode, StoreCheck};
use crate::link::{LinkOutcome, Linker};
use crate::lookup::LookupTable;
use crate::ret_stack::ReturnPrediction;
use crate::translate::{GuestMemView, Translator};

/// Engine tunables. Zero means "unbounded" for the cache caps and
/// "unlimited" for the block-length cap.
#[derive(Debug, Clone)]
pub struct JitConfig {
    pub cache_max_blocks: usize,
    pub cache_max_bytes: usize,
    /// Guest instructions per block before the decoder must terminate with
    /// a fallthrough branch.
    pub max_block_instructions: u32,
    pub ret_stack_cap: usize,
    /// Protect faults / bitmap hits on one page before its invalidation
    /// strategy escalates; 0 disables escalation.
    pub escalate_after: u32,
    /// log2 of the guest instruction alignment; sizes the lookup table.
    pub lookup_align_shift: u32,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            cache_max_blocks: 0,
            cache_max_bytes: 0,
            max_block_instructions: 64,
            ret_stack_cap: 64,
            escalate_after: 8,
            lookup_align_shift: 0,
        }
    }
}

/// Counters for tests and diagnostics; never consulted by the hot path.
#[derive(Debug, Clone, Copy, Default)]
pub struct JitStats {
    pub blocks_compiled: u64,
    pub blocks_evicted: u64,
    pub blocks_entered: u64,
    pub instructions_retired: u64,
    pub lookup_misses: u64,
    pub link_calls: u64,
    pub links_made: u64,
    pub ret_hits: u64,
    pub ret_misses: u64,
    pub checksum_failures: u64,
    pub protect_faults: u64,
    pub bitmap_hits: u64,
    pub mmio_backpatches: u64,
}

/// Why `enter` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    TimeSliceExpired,
    InterruptPending,
    /// Generated code executed an explicit stop (halt, trap).
    Stopped,
    Fault(GuestFault),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunExit {
    /// Where guest execution should resume.
    pub next_pc: u64,
    pub reason: ExitReason,
}

pub struct Engine<T, M> {
    translator: T,
    mmio: M,
    ram: GuestRam,
    map: AddressSpaceMap,
    prot: ProtectionTable,
    arena: CodeArena,
    cache: CodeCache,
    lookup: LookupTable,
    linker: Linker,
    dirty: DirtyState,
    ret_stack: ReturnPrediction,
    /// Fastmem sites specialized away from the fast path, keyed by the page
    /// whose access triggered the patch. Reset when that page is remapped;
    /// a site is forgotten when its owning block is evicted.
    fastmem_patches: HashMap<u64, Vec<HostAddr>>,
    /// Arena ranges of evicted blocks we were executing at eviction time;
    /// deadened at the next block boundary, once no live op pointer can
    /// still land in them.
    pending_dead: Vec<(HostAddr, u32)>,
    executing: Option<BlockId>,
    interrupt: bool,
    config: JitConfig,
    stats: JitStats,
}

impl<T: Translator, M: MmioHandler> Engine<T, M> {
    pub fn new(translator: T, mmio: M, ram: GuestRam, map: AddressSpaceMap, config: JitConfig) -> Self {
        let virt_size = map.page_count() * PAGE_SIZE;
        Self {
            translator,
            mmio,
            ram,
            map,
            prot: ProtectionTable::new(virt_size),
            arena: CodeArena::new(),
            cache: CodeCache::new(config.cache_max_blocks, config.cache_max_bytes),
            lookup: LookupTable::new(virt_size, config.lookup_align_shift),
            linker: Linker::new(),
            dirty: DirtyState::new(config.escalate_after),
            ret_stack: ReturnPrediction::new(config.ret_stack_cap),
            fastmem_patches: HashMap::new(),
            pending_dead: Vec::new(),
            executing: None,
            interrupt: false,
            config,
            stats: JitStats::default(),
        }
    }

    pub fn ram(&self) -> &GuestRam {
        &self.ram
    }

    /// Direct RAM access for the embedder (loading images, DMA). Writes here
    /// bypass self-modifying-code detection; call [`Engine::invalidate`] for
    /// any range that may hold compiled code.
    pub fn ram_mut(&mut self) -> &mut GuestRam {
        &mut self.ram
    }

    pub fn map(&self) -> &AddressSpaceMap {
        &self.map
    }

    pub fn mmio_mut(&mut self) -> &mut M {
        &mut self.mmio
    }

    pub fn stats(&self) -> &JitStats {
        &self.stats
    }

    pub fn cached_blocks(&self) -> usize {
        self.cache.len()
    }

    /// Access sites currently specialized away from the fast path.
    pub fn fastmem_patched_sites(&self) -> usize {
        self.fastmem_patches.values().map(Vec::len).sum()
    }

    /// Pin a page to an invalidation strategy up front (e.g. Bitmap for a
    /// page known to mix code and data). Takes effect at the next compile
    /// touching the page.
    pub fn set_invalidate_mode(&mut self, page: u64, mode: InvalidateMode) {
        self.dirty.set_mode(page, mode);
    }

    /// Ask the dispatch loop to exit at the next block boundary. The flag is
    /// consumed by the exit.
    pub fn request_interrupt(&mut self) {
        self.interrupt = true;
    }

    /// Write-protect a page on behalf of an outer layer (memory banking,
    /// snapshotting). Faults here are not translation invalidations; a guest
    /// store into such a page surfaces as [`CoreError::UnattributedFault`].
    pub fn write_protect_page(&mut self, page: u64) {
        self.prot.set(page, PageFlags::WRITE_PROTECT);
    }

    // ---- Guest address space mutation ---------------------------------------

    pub fn map_pages(&mut self, vaddr: u64, paddr: u64, len: u64) {
        self.on_remap(vaddr, len);
        self.map.map(vaddr, paddr, len);
    }

    pub fn unmap_pages(&mut self, vaddr: u64, len: u64) {
        self.on_remap(vaddr, len);
        self.map.unmap(vaddr, len);
    }

    pub fn set_mmio_pages(&mut self, vaddr: u64, len: u64) {
        self.on_remap(vaddr, len);
        self.map.set_mmio(vaddr, len);
        for page in page_of(vaddr)..=page_of(vaddr + len.max(1) - 1) {
            self.prot.set(page, PageFlags::MMIO);
        }
    }

    /// Route accesses to the range through the handler without fastmem
    /// specialization (bankable regions whose backing can change).
    pub fn set_fallback_pages(&mut self, vaddr: u64, len: u64) {
        self.on_remap(vaddr, len);
        self.map.set_fallback(vaddr, len);
    }

    /// A mapping change invalidates translations fetched from the range and
    /// resets fastmem specializations keyed to it.
    fn on_remap(&mut self, vaddr: u64, len: u64) {
        self.invalidate(vaddr, len);
        for page in page_of(vaddr)..=page_of(vaddr + len.max(1) - 1) {
            self.prot.clear(page, PageFlags::MMIO);
            let Some(sites) = self.fastmem_patches.remove(&page) else {
                continue;
            };
            for host in sites {
                match self.arena.op(host).clone() {
                    HostOp::Load {
                        dst, addr, width, ..
                    } => self.arena.patch(
                        host,
                        HostOp::Load {
                            dst,
                            addr,
                            width,
                            mmio: false,
                        },
                    ),
                    HostOp::Store {
                        src, addr, width, ..
                    } => self.arena.patch(
                        host,
                        HostOp::Store {
                            src,
                            addr,
                            width,
                            mmio: false,
                        },
                    ),
                    // The owning block was evicted since the patch.
                    _ => {}
                }
            }
        }
    }

    // ---- Invalidation -------------------------------------------------------

    /// Evict every block whose fetched range intersects `[start, start + len)`
    /// and release page tracking that no longer covers any block.
    pub fn invalidate(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let end = start.saturating_add(len);
        for id in self.cache.find_intersecting(start, end) {
            self.evict_block(id);
        }
        for page in page_of(start)..=page_of(end - 1) {
            if self.cache.find_in_page(page).is_empty() && self.dirty.is_tracked(page) {
                self.dirty.clear_page(&mut self.prot, page);
            }
        }
    }

    /// Drop all translations and bookkeeping; guest-visible state (RAM, the
    /// address map) is untouched.
    pub fn flush_all(&mut self) {
        self.cache.clear();
        self.arena.reset();
        self.lookup.reset_all();
        self.linker.clear();
        self.ret_stack.clear();
        self.dirty.reset(&mut self.prot);
        self.fastmem_patches.clear();
        self.pending_dead.clear();
        self.executing = None;
        tracing::debug!("flushed all translations");
    }

    /// Full teardown of one block. Link bookkeeping is consulted strictly
    /// before removal so no patched branch can outlive its target.
    fn evict_block(&mut self, id: BlockId) {
        self.linker.unlink_all(&mut self.arena, id);
        let Some(block) = self.cache.remove(id) else {
            return;
        };
        self.linker.drop_sites(&mut self.arena, &block.sites);
        self.lookup.reset(block.entry);
        self.ret_stack.on_evicted(id);
        let (lo, hi) = (block.host_entry.0, block.host_entry.0 + block.host_len);
        self.fastmem_patches.retain(|_, sites| {
            sites.retain(|h| h.0 < lo || h.0 >= hi);
            !sites.is_empty()
        });
        if self.executing == Some(id) {
            self.pending_dead.push((block.host_entry, block.host_len));
        } else {
            self.arena.deaden(block.host_entry, block.host_len);
        }
        self.stats.blocks_evicted += 1;
        tracing::trace!(entry = block.entry, "evicted block");
    }

    fn drain_dead(&mut self) {
        for (start, len) in std::mem::take(&mut self.pending_dead) {
            self.arena.deaden(start, len);
        }
    }

    // ---- Compilation --------------------------------------------------------

    /// Compile the block at `pc`, install it, and return its host entry.
    /// Idempotent: a block already cached is simply re-installed.
    fn compile_at(&mut self, pc: u64) -> Result<HostAddr, CoreError> {
        if let Some(id) = self.cache.get(pc) {
            if let Some(block) = self.cache.block(id) {
                let entry = block.host_entry;
                self.lookup.install(pc, entry).ok();
                return Ok(entry);
            }
        }

        let mut asm = crate::translate::BlockAssembler::new(pc, self.config.max_block_instructions);
        {
            let view = GuestMemView::new(&self.ram, &self.map);
            self.translator
                .translate(&view, pc, &mut asm)
                .map_err(|source| CoreError::Compile { pc, source })?;
        }
        let assembled = asm
            .finish()
            .map_err(|source| CoreError::Compile { pc, source })?;

        let checksum = if self.dirty.wants_checksum(assembled.start, assembled.end) {
            let bytes = GuestMemView::new(&self.ram, &self.map)
                .read_bytes(assembled.start, (assembled.end - assembled.start) as usize)
                .map_err(|source| CoreError::Compile { pc, source })?;
            Some(xxh3_64(&bytes))
        } else {
            None
        };

        // Prologue, then the assembled body. Block ids are patched in after
        // insertion, since the cache allocates them.
        let placeholder = BlockId(u32::MAX);
        let mut ops = Vec::with_capacity(assembled.ops.len() + 2);
        ops.push(HostOp::BlockEntry {
            block: placeholder,
            cost: assembled.instruction_count,
        });
        if checksum.is_some() {
            ops.push(HostOp::EntryGuard { block: placeholder });
        }
        let prefix = ops.len() as u32;
        ops.extend(assembled.ops);
        let host_len = ops.len() as u32;
        let host_entry = self.arena.alloc(ops);

        let (id, victims) = self.cache.insert(CompiledBlock::new(
            pc,
            assembled.start,
            assembled.end,
            host_entry,
            host_len,
            checksum,
            assembled.instruction_count,
        ));

        self.arena.patch(
            host_entry,
            HostOp::BlockEntry {
                block: id,
                cost: assembled.instruction_count,
            },
        );
        if checksum.is_some() {
            self.arena
                .patch(host_entry.next(), HostOp::EntryGuard { block: id });
        }
        for off in &assembled.site_offsets {
            let host = host_entry.offset(prefix + off);
            let site = self.linker.create_site(id, host);
            self.arena.patch(host.next(), HostOp::CallLinker { site });
            if let Some(block) = self.cache.block_mut(id) {
                block.sites.push(site);
            }
        }

        self.dirty
            .mark_code(&mut self.prot, assembled.start, assembled.end);
        // pc was validated by the routing lookup that reached the trampoline.
        self.lookup.install(pc, host_entry).ok();
        self.stats.blocks_compiled += 1;
        tracing::trace!(pc, start = assembled.start, end = assembled.end, "compiled block");

        for victim in victims {
            self.evict_block(victim);
        }
        Ok(host_entry)
    }

    // ---- Memory fast path ---------------------------------------------------

    fn backpatch(&mut self, ip: HostAddr, vaddr: u64) {
        let op = match self.arena.op(ip).clone() {
            HostOp::Load {
                dst, addr, width, ..
            } => HostOp::Load {
                dst,
                addr,
                width,
                mmio: true,
            },
            HostOp::Store {
                src, addr, width, ..
            } => HostOp::Store {
                src,
                addr,
                width,
                mmio: true,
            },
            other => {
                debug_assert!(false, "backpatch of non-access op {other:?}");
                return;
            }
        };
        self.arena.patch(ip, op);
        self.fastmem_patches
            .entry(page_of(vaddr))
            .or_default()
            .push(ip);
        self.stats.mmio_backpatches += 1;
        tracing::trace!(?ip, vaddr, "specialized access site");
    }

    fn mem_load(
        &mut self,
        ip: HostAddr,
        vaddr: u64,
        width: Width,
        specialized: bool,
    ) -> Result<u64, GuestFault> {
        match self.map.resolve(vaddr) {
            PageKind::Ram { paddr } => self
                .ram
                .read(paddr, width)
                .map_err(|_| GuestFault::OutOfRange { addr: vaddr }),
            PageKind::Mmio => {
                if !specialized {
                    self.backpatch(ip, vaddr);
                }
                Ok(self.mmio.read(vaddr, width))
            }
            PageKind::Fallback => Ok(self.mmio.read(vaddr, width)),
            PageKind::Unmapped => Err(GuestFault::Unmapped { addr: vaddr }),
        }
    }

    fn mem_store(
        &mut self,
        ip: HostAddr,
        vaddr: u64,
        value: u64,
        width: Width,
        specialized: bool,
    ) -> Result<Result<(), GuestFault>, CoreError> {
        match self.map.resolve(vaddr) {
            PageKind::Ram { paddr } => self.checked_ram_write(vaddr, paddr, value, width),
            PageKind::Mmio => {
                if !specialized {
                    self.backpatch(ip, vaddr);
                }
                self.mmio.write(vaddr, width, value);
                Ok(Ok(()))
            }
            PageKind::Fallback => {
                self.mmio.write(vaddr, width, value);
                Ok(Ok(()))
            }
            PageKind::Unmapped => Ok(Err(GuestFault::Unmapped { addr: vaddr })),
        }
    }

    /// RAM store with self-modifying-code checks applied before the write
    /// lands.
    fn checked_ram_write(
        &mut self,
        vaddr: u64,
        paddr: u64,
        value: u64,
        width: Width,
    ) -> Result<Result<(), GuestFault>, CoreError> {
        let len = width.bytes();
        match self.dirty.check_store(&self.prot, vaddr, len) {
            StoreCheck::Clear => {}
            StoreCheck::ProtectFault { page } => {
                self.stats.protect_faults += 1;
                self.dirty.note_strike(page);
                let victims = self.cache.find_in_page(page);
                let mut touched = Vec::new();
                for id in victims {
                    if let Some(b) = self.cache.block(id) {
                        touched.push((b.start, b.end));
                    }
                    self.evict_block(id);
                }
                self.dirty.clear_page(&mut self.prot, page);
                self.release_empty_pages(&touched);
                tracing::debug!(page, vaddr, "write to protected code page, invalidated");
            }
            StoreCheck::BitmapHit { page } => {
                self.stats.bitmap_hits += 1;
                self.dirty.note_strike(page);
                let mut touched = Vec::new();
                for id in self.cache.find_intersecting(vaddr, vaddr + len) {
                    if let Some(b) = self.cache.block(id) {
                        touched.push((b.start, b.end));
                    }
                    self.evict_block(id);
                }
                // Only the written bytes' bits are cleared; bits an evicted
                // block shared with a survivor must stay set. Stale bits left
                // behind self-clean on their next (vacuous) hit.
                self.dirty.clear_bits(vaddr, vaddr + len);
                self.release_empty_pages(&touched);
                tracing::debug!(page, vaddr, "write hit tracked code bytes, invalidated");
            }
            StoreCheck::Foreign { page } => {
                tracing::error!(page, vaddr, "protection fault outside tracked code");
                return Err(CoreError::UnattributedFault { addr: vaddr });
            }
        }
        Ok(self
            .ram
            .write(paddr, width, value)
            .map_err(|_| GuestFault::OutOfRange { addr: vaddr }))
    }

    /// Release write protection on pages that no longer hold any block
    /// (evicted blocks may have spanned into neighbouring pages).
    fn release_empty_pages(&mut self, ranges: &[(u64, u64)]) {
        for &(start, end) in ranges {
            for page in page_of(start)..=page_of(end.max(start + 1) - 1) {
                if self.cache.find_in_page(page).is_empty() && self.dirty.is_tracked(page) {
                    self.dirty.clear_page(&mut self.prot, page);
                }
            }
        }
    }

    // ---- Dispatch loop ------------------------------------------------------

    /// Run guest code starting at `cpu.pc` for up to `slice` guest
    /// instructions. Guest register state is loaded into the execution
    /// context on entry and stored back on every exit, including errors.
    pub fn enter(&mut self, cpu: &mut CpuState, slice: u64) -> Result<RunExit, CoreError> {
        let mut st = cpu.clone();
        let result = self.run(&mut st, slice);
        *cpu = st;
        self.drain_dead();
        self.executing = None;
        let reason = result?;
        if reason == ExitReason::InterruptPending {
            self.interrupt = false;
        }
        Ok(RunExit {
            next_pc: cpu.pc,
            reason,
        })
    }

    fn run(&mut self, st: &mut CpuState, slice: u64) -> Result<ExitReason, CoreError> {
        let mut remaining = slice as i64;
        let mut ip = match self.lookup.lookup(st.pc) {
            Ok(host) => host,
            Err(fault) => return Ok(ExitReason::Fault(fault)),
        };

        loop {
            let op = self.arena.op(ip).clone();
            match op {
                HostOp::Trampoline => {
                    self.stats.lookup_misses += 1;
                    ip = self.compile_at(st.pc)?;
                }
                HostOp::Dead => {
                    debug_assert!(false, "executed dead arena slot {ip:?}");
                    match self.lookup.lookup(st.pc) {
                        Ok(host) => ip = host,
                        Err(fault) => return Ok(ExitReason::Fault(fault)),
                    }
                }
                HostOp::BlockEntry { block, cost } => {
                    self.drain_dead();
                    self.executing = Some(block);
                    if self.interrupt {
                        return Ok(ExitReason::InterruptPending);
                    }
                    if remaining <= 0 {
                        return Ok(ExitReason::TimeSliceExpired);
                    }
                    remaining -= i64::from(cost);
                    self.stats.blocks_entered += 1;
                    self.stats.instructions_retired += u64::from(cost);
                    ip = ip.next();
                }
                HostOp::EntryGuard { block } => {
                    if self.verify_checksum(block) {
                        ip = ip.next();
                    } else {
                        self.stats.checksum_failures += 1;
                        tracing::debug!(pc = st.pc, "checksum mismatch, recompiling");
                        self.evict_block(block);
                        // Lookup slot was just reset; the trampoline
                        // recompiles from the current bytes.
                        ip = HostAddr::TRAMPOLINE;
                    }
                }
                HostOp::InterruptCheck { resume_pc } => {
                    if self.interrupt {
                        st.pc = resume_pc;
                        return Ok(ExitReason::InterruptPending);
                    }
                    if remaining <= 0 {
                        st.pc = resume_pc;
                        return Ok(ExitReason::TimeSliceExpired);
                    }
                    ip = ip.next();
                }
                HostOp::Exec(f) => {
                    f(st);
                    ip = ip.next();
                }
                HostOp::Load {
                    dst,
                    addr,
                    width,
                    mmio,
                } => {
                    let vaddr = st.reg(addr);
                    match self.mem_load(ip, vaddr, width, mmio) {
                        Ok(value) => {
                            st.set_reg(dst, value);
                            ip = ip.next();
                        }
                        Err(fault) => return Ok(ExitReason::Fault(fault)),
                    }
                }
                HostOp::Store {
                    src,
                    addr,
                    width,
                    mmio,
                } => {
                    let vaddr = st.reg(addr);
                    let value = st.reg(src);
                    match self.mem_store(ip, vaddr, value, width, mmio)? {
                        Ok(()) => ip = ip.next(),
                        Err(fault) => return Ok(ExitReason::Fault(fault)),
                    }
                }
                HostOp::SetPc { guest } => {
                    st.pc = guest;
                    ip = ip.next();
                }
                HostOp::SetPcReg { reg } => {
                    st.pc = st.reg(reg);
                    ip = ip.next();
                }
                HostOp::BranchCond {
                    cond,
                    taken,
                    fallthrough,
                } => {
                    st.pc = if st.reg(cond) != 0 { taken } else { fallthrough };
                    ip = ip.next();
                }
                HostOp::PushRet { ret_pc } => {
                    if let Ok(host) = self.lookup.lookup(ret_pc) {
                        let block = if host == HostAddr::TRAMPOLINE {
                            None
                        } else {
                            self.cache.entry_block(ret_pc)
                        };
                        self.ret_stack.push(ret_pc, host, block);
                    }
                    ip = ip.next();
                }
                HostOp::Ret => match self.ret_stack.pop(st.pc) {
                    Some(host) => {
                        self.stats.ret_hits += 1;
                        ip = host;
                    }
                    None => {
                        self.stats.ret_misses += 1;
                        match self.lookup.lookup(st.pc) {
                            Ok(host) => ip = host,
                            Err(fault) => return Ok(ExitReason::Fault(fault)),
                        }
                    }
                },
                HostOp::JumpIndirect => match self.lookup.lookup(st.pc) {
                    Ok(host) => ip = host,
                    Err(fault) => return Ok(ExitReason::Fault(fault)),
                },
                HostOp::LinkNop => {
                    ip = ip.next();
                }
                HostOp::CallLinker { site } => {
                    self.stats.link_calls += 1;
                    let target = self.cache.get(st.pc).and_then(|id| {
                        self.cache.block(id).map(|b| (id, b.host_entry))
                    });
                    match self.linker.link(&mut self.arena, site, st.pc, target) {
                        LinkOutcome::Linked(host) => {
                            self.stats.links_made += 1;
                            ip = host;
                        }
                        LinkOutcome::NoTarget => match self.lookup.lookup(st.pc) {
                            Ok(host) => ip = host,
                            Err(fault) => return Ok(ExitReason::Fault(fault)),
                        },
                    }
                }
                HostOp::CondLink { guest, host } => {
                    if st.pc == guest {
                        ip = host;
                    } else {
                        ip = ip.next();
                    }
                }
                HostOp::Jump { host } => {
                    ip = host;
                }
                HostOp::Exit => {
                    return Ok(ExitReason::Stopped);
                }
            }
        }
    }

    /// Recompute a guarded block's source checksum. A fetch failure (the
    /// backing pages changed under it) counts as a mismatch.
    fn verify_checksum(&self, id: BlockId) -> bool {
        let Some(block) = self.cache.block(id) else {
            return false;
        };
        let Some(expected) = block.checksum else {
            return true;
        };
        let view = GuestMemView::new(&self.ram, &self.map);
        match view.read_bytes(block.start, (block.end - block.start) as usize) {
            Ok(bytes) => xxh3_64(&bytes) == expected,
            Err(_) => false,
        }
    }
}
