//! Self-modifying-code detection.
//!
//! Three strategies, selectable per page:
//!
//! - **PageProtect** (default, coarse): pages holding compiled code are
//!   write-protected in the [`ProtectionTable`]; any guest store there
//!   faults and evicts every block intersecting the page.
//! - **Bitmap** (fine): a per-page bitmap records exactly which bytes were
//!   fetched as code. The store path consults it and only a write that
//!   actually lands on code invalidates, and only the blocks overlapping
//!   the written bytes.
//! - **Checksum** (reactive): no write-side instrumentation at all; blocks
//!   on such pages carry an entry guard that re-hashes their source bytes
//!   on every execution and evicts themselves on mismatch.
//!
//! Escalation: a page that keeps faulting under PageProtect (unrelated data
//! sharing the page) moves to Bitmap; a page that keeps taking bitmap hits
//! (code rewritten in place repeatedly) moves to Checksum. Fault and hit
//! counts survive eviction, otherwise a thrashing page would reset its own
//! evidence every time it thrashed.

use std::collections::HashMap;

use kite_mmu::{page_base, page_of, PageFlags, ProtectionTable, PAGE_SIZE};

/// Words in a per-page code bitmap, one bit per byte.
const BITMAP_WORDS: usize = (PAGE_SIZE as usize) / 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidateMode {
    PageProtect,
    Bitmap,
    Checksum,
}

/// Verdict on a guest store, checked before the write lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreCheck {
    /// No compiled code affected.
    Clear,
    /// Write-protect fault on a tracked code page: evict everything
    /// intersecting the page, then restore write permission.
    ProtectFault { page: u64 },
    /// The written bytes overlap known code: evict only the overlapping
    /// blocks and clear their bits.
    BitmapHit { page: u64 },
    /// Write-protect fault on a page this subsystem never protected. Must
    /// be forwarded, not swallowed.
    Foreign { page: u64 },
}

#[derive(Debug)]
struct PageState {
    mode: InvalidateMode,
    /// Set while the page holds at least one compiled block.
    has_code: bool,
    bitmap: Option<Box<[u64; BITMAP_WORDS]>>,
    /// Protect faults taken (PageProtect) or bitmap hits taken (Bitmap).
    strikes: u32,
}

impl PageState {
    fn new() -> Self {
        Self {
            mode: InvalidateMode::PageProtect,
            has_code: false,
            bitmap: None,
            strikes: 0,
        }
    }

    fn bitmap_mut(&mut self) -> &mut [u64; BITMAP_WORDS] {
        self.bitmap.get_or_insert_with(|| Box::new([0; BITMAP_WORDS]))
    }
}

/// Per-page code-tracking state shared by the compiler (marks fetched
/// bytes) and the store path (checks writes).
#[derive(Debug)]
pub struct DirtyState {
    pages: HashMap<u64, PageState>,
    /// Strikes before a page escalates to the next strategy; 0 disables
    /// escalation.
    escalate_after: u32,
}

impl DirtyState {
    pub fn new(escalate_after: u32) -> Self {
        Self {
            pages: HashMap::new(),
            escalate_after,
        }
    }

    pub fn mode(&self, page: u64) -> InvalidateMode {
        self.pages
            .get(&page)
            .map(|p| p.mode)
            .unwrap_or(InvalidateMode::PageProtect)
    }

    /// Pin a page to a strategy (also how an embedder opts a known
    /// code-and-data page into Bitmap up front).
    pub fn set_mode(&mut self, page: u64, mode: InvalidateMode) {
        self.pages.entry(page).or_insert_with(PageState::new).mode = mode;
    }

    /// Whether this subsystem currently tracks code on `page`. A protect
    /// fault on an untracked page is [`StoreCheck::Foreign`].
    pub fn is_tracked(&self, page: u64) -> bool {
        self.pages.get(&page).is_some_and(|p| p.has_code)
    }

    /// True when any page in `[start, end)` wants checksum guards; the
    /// compiler consults this to decide whether a block carries one.
    pub fn wants_checksum(&self, start: u64, end: u64) -> bool {
        debug_assert!(start < end);
        (page_of(start)..=page_of(end - 1)).any(|p| self.mode(p) == InvalidateMode::Checksum)
    }

    /// Record that `[start, end)` was fetched as code, applying each page's
    /// strategy: protect, set bitmap bits, or nothing (checksum).
    pub fn mark_code(&mut self, prot: &mut ProtectionTable, start: u64, end: u64) {
        debug_assert!(start < end);
        for page in page_of(start)..=page_of(end - 1) {
            let state = self.pages.entry(page).or_insert_with(PageState::new);
            state.has_code = true;
            match state.mode {
                InvalidateMode::PageProtect => prot.set(page, PageFlags::WRITE_PROTECT),
                InvalidateMode::Bitmap => {
                    let base = page_base(page);
                    let lo = start.max(base) - base;
                    let hi = end.min(base + PAGE_SIZE) - base;
                    let bits = state.bitmap_mut();
                    for b in lo..hi {
                        bits[(b / 64) as usize] |= 1 << (b % 64);
                    }
                }
                InvalidateMode::Checksum => {}
            }
        }
    }

    /// Check a store of `len` bytes at `addr` against tracked code. Called
    /// on the memory fast path before the write.
    pub fn check_store(&self, prot: &ProtectionTable, addr: u64, len: u64) -> StoreCheck {
        debug_assert!(len > 0);
        for page in page_of(addr)..=page_of(addr + len - 1) {
            if prot.flags(page).contains(PageFlags::WRITE_PROTECT) {
                return if self.is_tracked(page) {
                    StoreCheck::ProtectFault { page }
                } else {
                    StoreCheck::Foreign { page }
                };
            }
            let Some(state) = self.pages.get(&page) else {
                continue;
            };
            if state.mode != InvalidateMode::Bitmap || !state.has_code {
                continue;
            }
            if let Some(bits) = &state.bitmap {
                let base = page_base(page);
                let lo = addr.max(base) - base;
                let hi = (addr + len).min(base + PAGE_SIZE) - base;
                for b in lo..hi {
                    if bits[(b / 64) as usize] & (1 << (b % 64)) != 0 {
                        return StoreCheck::BitmapHit { page };
                    }
                }
            }
        }
        StoreCheck::Clear
    }

    /// Count a protect fault or bitmap hit against `page` and escalate its
    /// strategy when the threshold is reached. Returns the mode now in
    /// effect.
    pub fn note_strike(&mut self, page: u64) -> InvalidateMode {
        let threshold = self.escalate_after;
        let state = self.pages.entry(page).or_insert_with(PageState::new);
        state.strikes += 1;
        if threshold != 0 && state.strikes >= threshold {
            let next = match state.mode {
                InvalidateMode::PageProtect => Some(InvalidateMode::Bitmap),
                InvalidateMode::Bitmap => Some(InvalidateMode::Checksum),
                InvalidateMode::Checksum => None,
            };
            if let Some(next) = next {
                tracing::debug!(page, ?next, strikes = state.strikes, "escalating invalidation strategy");
                state.mode = next;
                state.strikes = 0;
            }
        }
        state.mode
    }

    /// Drop all code tracking for `page` and restore write permission.
    /// Strategy and strike count survive; they are the escalation evidence.
    pub fn clear_page(&mut self, prot: &mut ProtectionTable, page: u64) {
        if let Some(state) = self.pages.get_mut(&page) {
            state.has_code = false;
            state.bitmap = None;
        }
        prot.clear(page, PageFlags::WRITE_PROTECT);
    }

    /// Clear bitmap bits for `[start, end)` after a fine-grained eviction.
    pub fn clear_bits(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        for page in page_of(start)..=page_of(end - 1) {
            let Some(state) = self.pages.get_mut(&page) else {
                continue;
            };
            let Some(bits) = &mut state.bitmap else {
                continue;
            };
            let base = page_base(page);
            let lo = start.max(base) - base;
            let hi = end.min(base + PAGE_SIZE) - base;
            for b in lo..hi {
                bits[(b / 64) as usize] &= !(1 << (b % 64));
            }
            if bits.iter().all(|&w| w == 0) {
                state.bitmap = None;
                state.has_code = false;
            }
        }
    }

    pub fn reset(&mut self, prot: &mut ProtectionTable) {
        for (&page, state) in &self.pages {
            if state.has_code {
                prot.clear(page, PageFlags::WRITE_PROTECT);
            }
        }
        self.pages.clear();
    }
}
