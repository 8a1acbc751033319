//! Code cache bookkeeping: which guest ranges are compiled, where their host
//! code lives, and which blocks an invalidation must visit.
//!
//! The cache owns [`CompiledBlock`] metadata only; op storage lives in the
//! [`crate::code::CodeArena`] and teardown (unlinking, lookup resets) is the
//! engine's job, so `insert` reports LRU victims instead of destroying them.

use std::collections::HashMap;

use kite_mmu::page_of;

use crate::code::HostAddr;
use crate::link::SiteId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

/// Metadata for one translated basic block.
#[derive(Debug, Clone)]
pub struct CompiledBlock {
    /// Guest entry address, the lookup-table key.
    pub entry: u64,
    /// Guest byte range actually fetched during translation, `[start, end)`.
    /// Invalidation and checksums are scoped to this range.
    pub start: u64,
    pub end: u64,
    pub host_entry: HostAddr,
    pub host_len: u32,
    /// xxh3 over the source bytes at compile time, when checksum
    /// invalidation applies to this block.
    pub checksum: Option<u64>,
    pub instruction_count: u32,
    /// Link sites inside this block (outgoing exits).
    pub sites: Vec<SiteId>,
    /// LRU stamp; refreshed by [`CodeCache::get`].
    tick: u64,
}

impl CompiledBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        entry: u64,
        start: u64,
        end: u64,
        host_entry: HostAddr,
        host_len: u32,
        checksum: Option<u64>,
        instruction_count: u32,
    ) -> Self {
        Self {
            entry,
            start,
            end,
            host_entry,
            host_len,
            checksum,
            instruction_count,
            sites: Vec::new(),
            tick: 0,
        }
    }

    #[inline]
    pub fn covers(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    #[inline]
    pub fn intersects(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }
}

/// Block store with optional LRU caps.
///
/// `max_blocks` / `max_bytes` of 0 mean unbounded; eviction is a tunable,
/// not a correctness requirement. "Bytes" are arena slots, the unit the
/// arena allocates in.
#[derive(Debug)]
pub struct CodeCache {
    blocks: Vec<Option<CompiledBlock>>,
    free: Vec<u32>,
    by_entry: HashMap<u64, BlockId>,
    by_page: HashMap<u64, Vec<BlockId>>,
    max_blocks: usize,
    max_bytes: usize,
    cur_bytes: usize,
    live: usize,
    tick: u64,
}

impl CodeCache {
    pub fn new(max_blocks: usize, max_bytes: usize) -> Self {
        Self {
            blocks: Vec::new(),
            free: Vec::new(),
            by_entry: HashMap::new(),
            by_page: HashMap::new(),
            max_blocks,
            max_bytes,
            cur_bytes: 0,
            live: 0,
            tick: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    #[inline]
    pub fn current_bytes(&self) -> usize {
        self.cur_bytes
    }

    #[inline]
    pub fn contains(&self, entry: u64) -> bool {
        self.by_entry.contains_key(&entry)
    }

    /// Entry lookup without touching recency.
    #[inline]
    pub fn entry_block(&self, entry: u64) -> Option<BlockId> {
        self.by_entry.get(&entry).copied()
    }

    /// Entry lookup that refreshes the block's LRU recency.
    pub fn get(&mut self, entry: u64) -> Option<BlockId> {
        let id = *self.by_entry.get(&entry)?;
        self.tick += 1;
        let tick = self.tick;
        if let Some(block) = self.block_mut(id) {
            block.tick = tick;
        }
        Some(id)
    }

    #[inline]
    pub fn block(&self, id: BlockId) -> Option<&CompiledBlock> {
        self.blocks.get(id.0 as usize)?.as_ref()
    }

    #[inline]
    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut CompiledBlock> {
        self.blocks.get_mut(id.0 as usize)?.as_mut()
    }

    /// Insert a block, returning its id plus any LRU victims the caller must
    /// evict to get back under the configured caps. The victims are still
    /// resident; full teardown is the engine's responsibility.
    pub fn insert(&mut self, mut block: CompiledBlock) -> (BlockId, Vec<BlockId>) {
        debug_assert!(
            !self.by_entry.contains_key(&block.entry),
            "recompilation must evict first"
        );
        self.tick += 1;
        block.tick = self.tick;

        let bytes = block.host_len as usize;
        let entry = block.entry;
        let (first_page, last_page) = (page_of(block.start), page_of(block.end.max(block.start + 1) - 1));

        let id = match self.free.pop() {
            Some(slot) => {
                self.blocks[slot as usize] = Some(block);
                BlockId(slot)
            }
            None => {
                self.blocks.push(Some(block));
                BlockId((self.blocks.len() - 1) as u32)
            }
        };
        self.by_entry.insert(entry, id);
        for page in first_page..=last_page {
            self.by_page.entry(page).or_default().push(id);
        }
        self.cur_bytes += bytes;
        self.live += 1;

        (id, self.pick_victims(id))
    }

    fn pick_victims(&self, protect: BlockId) -> Vec<BlockId> {
        let mut victims = Vec::new();
        let mut bytes = self.cur_bytes;
        let mut count = self.live;
        loop {
            let over_blocks = self.max_blocks != 0 && count > self.max_blocks;
            let over_bytes = self.max_bytes != 0 && bytes > self.max_bytes;
            if !over_blocks && !over_bytes {
                break;
            }
            // Oldest tick wins; the just-inserted block is never a victim.
            let victim = self
                .blocks
                .iter()
                .enumerate()
                .filter_map(|(i, slot)| slot.as_ref().map(|b| (BlockId(i as u32), b)))
                .filter(|(id, _)| *id != protect && !victims.contains(id))
                .min_by_key(|(_, b)| b.tick);
            match victim {
                Some((id, b)) => {
                    bytes -= b.host_len as usize;
                    count -= 1;
                    victims.push(id);
                }
                None => break,
            }
        }
        victims
    }

    /// Remove a block, returning its metadata for teardown.
    pub fn remove(&mut self, id: BlockId) -> Option<CompiledBlock> {
        let block = self.blocks.get_mut(id.0 as usize)?.take()?;
        self.by_entry.remove(&block.entry);
        let first_page = page_of(block.start);
        let last_page = page_of(block.end.max(block.start + 1) - 1);
        for page in first_page..=last_page {
            if let Some(list) = self.by_page.get_mut(&page) {
                list.retain(|&b| b != id);
                if list.is_empty() {
                    self.by_page.remove(&page);
                }
            }
        }
        self.cur_bytes -= block.host_len as usize;
        self.live -= 1;
        self.free.push(id.0);
        Some(block)
    }

    /// All blocks whose covered range intersects the given page.
    pub fn find_in_page(&self, page: u64) -> Vec<BlockId> {
        self.by_page.get(&page).cloned().unwrap_or_default()
    }

    /// All blocks whose covered range contains `addr`.
    pub fn find_containing(&self, addr: u64) -> Vec<BlockId> {
        self.find_in_page(page_of(addr))
            .into_iter()
            .filter(|&id| self.block(id).is_some_and(|b| b.covers(addr)))
            .collect()
    }

    /// All blocks intersecting `[start, end)`.
    pub fn find_intersecting(&self, start: u64, end: u64) -> Vec<BlockId> {
        if start >= end {
            return Vec::new();
        }
        let mut out = Vec::new();
        for page in page_of(start)..=page_of(end - 1) {
            for id in self.find_in_page(page) {
                if !out.contains(&id) && self.block(id).is_some_and(|b| b.intersects(start, end)) {
                    out.push(id);
                }
            }
        }
        out
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.free.clear();
        self.by_entry.clear();
        self.by_page.clear();
        self.cur_bytes = 0;
        self.live = 0;
    }

    /// Iterate live block ids (bookkeeping paths only).
    pub fn ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|_| BlockId(i as u32)))
    }
}
