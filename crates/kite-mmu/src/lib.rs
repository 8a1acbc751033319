//! Guest address-space plumbing for the kite execution core.
//!
//! This crate is the leaf the rest of the core builds on:
//!
//! - [`AddressSpaceMap`]: per-page virtual → physical mapping stored as a
//!   signed offset so translation is a single wrapping add, with out-of-band
//!   tag bits for pages that cannot be accessed directly (unmapped, MMIO,
//!   fallback-required).
//! - [`GuestRam`]: flat physical memory with typed and bulk accessors.
//! - [`ProtectionTable`]: per-page write-protect/MMIO flags. This is the
//!   portable stand-in for host `mprotect`: the store fast path consults it
//!   and a set flag is what a host page fault would be.
//! - [`MmioHandler`]: the device-access collaborator seam.

use bitflags::bitflags;
use thiserror::Error;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Largest supported guest address space. Keeps the high bits of
/// [`AddressSpaceMap`] entries genuinely unused so they can carry tags.
pub const MAX_GUEST_SPACE: u64 = 1 << 47;

#[inline]
pub fn page_of(addr: u64) -> u64 {
    addr >> PAGE_SHIFT
}

#[inline]
pub fn page_base(page: u64) -> u64 {
    page << PAGE_SHIFT
}

/// Access width of a guest load/store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
}

impl Width {
    #[inline]
    pub const fn bytes(self) -> u64 {
        match self {
            Width::W8 => 1,
            Width::W16 => 2,
            Width::W32 => 4,
            Width::W64 => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemError {
    #[error("physical access at {paddr:#x}+{len} outside guest RAM")]
    OutOfRange { paddr: u64, len: u64 },
}

// ---- Guest physical memory --------------------------------------------------

/// Flat guest physical memory.
///
/// All accessors are bounds-checked; the execution core only reaches them
/// after the fast path has already resolved the page, so the checks are cold
/// in practice.
#[derive(Debug, Clone)]
pub struct GuestRam {
    bytes: Vec<u8>,
}

impl GuestRam {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
        }
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline]
    fn slice(&self, paddr: u64, len: u64) -> Result<&[u8], MemError> {
        let start = usize::try_from(paddr).map_err(|_| MemError::OutOfRange { paddr, len })?;
        let end = start
            .checked_add(len as usize)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(MemError::OutOfRange { paddr, len })?;
        Ok(&self.bytes[start..end])
    }

    #[inline]
    fn slice_mut(&mut self, paddr: u64, len: u64) -> Result<&mut [u8], MemError> {
        let start = usize::try_from(paddr).map_err(|_| MemError::OutOfRange { paddr, len })?;
        let end = start
            .checked_add(len as usize)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(MemError::OutOfRange { paddr, len })?;
        Ok(&mut self.bytes[start..end])
    }

    #[inline]
    pub fn read(&self, paddr: u64, width: Width) -> Result<u64, MemError> {
        let src = self.slice(paddr, width.bytes())?;
        Ok(match width {
            Width::W8 => u64::from(src[0]),
            Width::W16 => u64::from(u16::from_le_bytes([src[0], src[1]])),
            Width::W32 => u64::from(u32::from_le_bytes([src[0], src[1], src[2], src[3]])),
            Width::W64 => u64::from_le_bytes(src.try_into().expect("8-byte slice")),
        })
    }

    #[inline]
    pub fn write(&mut self, paddr: u64, width: Width, value: u64) -> Result<(), MemError> {
        let dst = self.slice_mut(paddr, width.bytes())?;
        match width {
            Width::W8 => dst.copy_from_slice(&[value as u8]),
            Width::W16 => dst.copy_from_slice(&(value as u16).to_le_bytes()),
            Width::W32 => dst.copy_from_slice(&(value as u32).to_le_bytes()),
            Width::W64 => dst.copy_from_slice(&value.to_le_bytes()),
        }
        Ok(())
    }

    pub fn read_bytes(&self, paddr: u64, dst: &mut [u8]) -> Result<(), MemError> {
        dst.copy_from_slice(self.slice(paddr, dst.len() as u64)?);
        Ok(())
    }

    pub fn write_bytes(&mut self, paddr: u64, src: &[u8]) -> Result<(), MemError> {
        self.slice_mut(paddr, src.len() as u64)?.copy_from_slice(src);
        Ok(())
    }

    /// Borrow a byte range, e.g. for checksumming a compiled block's source.
    pub fn bytes(&self, paddr: u64, len: u64) -> Result<&[u8], MemError> {
        self.slice(paddr, len)
    }
}

// ---- Address space map ------------------------------------------------------

/// Resolution of one guest virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Directly backed by guest RAM at `paddr`.
    Ram { paddr: u64 },
    /// Device memory; must go through the [`MmioHandler`].
    Mmio,
    /// No mapping; a guest fault.
    Unmapped,
    /// Mapped, but the generic slow path must be taken.
    Fallback,
}

// Entry layout: bit 63 set marks a tagged (non-RAM) page, with bits 62..61
// selecting the tag. For RAM pages the low 61 bits hold `pbase - vbase` as a
// two's-complement value (sign bit 60), so translation is one wrapping add.
const ENTRY_TAGGED: u64 = 1 << 63;
const ENTRY_TAG_MASK: u64 = 0b11 << 61;
const ENTRY_TAG_UNMAPPED: u64 = 0b00 << 61;
const ENTRY_TAG_MMIO: u64 = 0b01 << 61;
const ENTRY_TAG_FALLBACK: u64 = 0b10 << 61;
const ENTRY_DELTA_MASK: u64 = (1 << 61) - 1;

#[inline]
fn encode_delta(vbase: u64, pbase: u64) -> u64 {
    pbase.wrapping_sub(vbase) & ENTRY_DELTA_MASK
}

#[inline]
fn decode_delta(entry: u64) -> u64 {
    // Sign-extend from bit 60.
    (((entry << 3) as i64) >> 3) as u64
}

/// Per-page guest virtual → physical map.
///
/// Read on every guest memory access; mutated only when the guest remaps a
/// page. Each remap bumps [`AddressSpaceMap::epoch`] so callers that cache
/// derived state (e.g. specialized access sites) know to reset it.
#[derive(Debug, Clone)]
pub struct AddressSpaceMap {
    entries: Vec<u64>,
    epoch: u64,
}

impl AddressSpaceMap {
    /// Create a map covering `virt_size` bytes of guest virtual space, all
    /// pages initially unmapped.
    pub fn new(virt_size: u64) -> Self {
        assert!(virt_size <= MAX_GUEST_SPACE, "guest space too large");
        let pages = virt_size.div_ceil(PAGE_SIZE) as usize;
        Self {
            entries: vec![ENTRY_TAGGED | ENTRY_TAG_UNMAPPED; pages],
            epoch: 0,
        }
    }

    #[inline]
    pub fn page_count(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Monotonic counter bumped on every mutation.
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    #[inline]
    pub fn contains(&self, vaddr: u64) -> bool {
        page_of(vaddr) < self.page_count()
    }

    fn set_pages(&mut self, vaddr: u64, len: u64, mut entry_for: impl FnMut(u64) -> u64) {
        let first = page_of(vaddr);
        let last = page_of(vaddr + len.max(1) - 1);
        for page in first..=last.min(self.page_count().saturating_sub(1)) {
            self.entries[page as usize] = entry_for(page);
        }
        self.epoch += 1;
    }

    /// Map `[vaddr, vaddr + len)` to physical memory starting at `paddr`.
    /// Addresses must be page-aligned.
    pub fn map(&mut self, vaddr: u64, paddr: u64, len: u64) {
        debug_assert_eq!(vaddr % PAGE_SIZE, 0);
        debug_assert_eq!(paddr % PAGE_SIZE, 0);
        let vpage0 = page_of(vaddr);
        self.set_pages(vaddr, len, |page| {
            let vbase = page_base(page);
            let pbase = paddr + page_base(page - vpage0);
            encode_delta(vbase, pbase)
        });
        tracing::trace!(vaddr, paddr, len, "map pages");
    }

    pub fn unmap(&mut self, vaddr: u64, len: u64) {
        self.set_pages(vaddr, len, |_| ENTRY_TAGGED | ENTRY_TAG_UNMAPPED);
        tracing::trace!(vaddr, len, "unmap pages");
    }

    pub fn set_mmio(&mut self, vaddr: u64, len: u64) {
        self.set_pages(vaddr, len, |_| ENTRY_TAGGED | ENTRY_TAG_MMIO);
    }

    /// Force the generic slow path for a page range without unmapping it.
    pub fn set_fallback(&mut self, vaddr: u64, len: u64) {
        self.set_pages(vaddr, len, |_| ENTRY_TAGGED | ENTRY_TAG_FALLBACK);
    }

    /// Resolve a guest virtual address. This is the inline-page-table fast
    /// path: one shift, one load, one tag test, one wrapping add.
    #[inline]
    pub fn resolve(&self, vaddr: u64) -> PageKind {
        let page = page_of(vaddr) as usize;
        let Some(&entry) = self.entries.get(page) else {
            return PageKind::Unmapped;
        };
        if entry & ENTRY_TAGGED == 0 {
            return PageKind::Ram {
                paddr: vaddr.wrapping_add(decode_delta(entry)),
            };
        }
        match entry & ENTRY_TAG_MASK {
            ENTRY_TAG_MMIO => PageKind::Mmio,
            ENTRY_TAG_FALLBACK => PageKind::Fallback,
            _ => PageKind::Unmapped,
        }
    }

    /// Translate without classifying, for callers that only care about RAM.
    #[inline]
    pub fn translate(&self, vaddr: u64) -> Option<u64> {
        match self.resolve(vaddr) {
            PageKind::Ram { paddr } => Some(paddr),
            _ => None,
        }
    }
}

// ---- Page protection --------------------------------------------------------

bitflags! {
    /// Per-page protection state, the portable analog of host page
    /// permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageFlags: u8 {
        /// Writes to this page must fault (it holds translated code).
        const WRITE_PROTECT = 1 << 0;
        /// Accesses to this page must fault (device memory under fastmem).
        const MMIO = 1 << 1;
    }
}

/// Per-page protection flags over the guest range.
///
/// Mutations here model `mprotect` calls; the execution core's store fast
/// path checks [`ProtectionTable::flags`] and treats a set bit as a host
/// page fault would be treated.
#[derive(Debug, Clone)]
pub struct ProtectionTable {
    flags: Vec<PageFlags>,
}

impl ProtectionTable {
    pub fn new(virt_size: u64) -> Self {
        Self {
            flags: vec![PageFlags::empty(); virt_size.div_ceil(PAGE_SIZE) as usize],
        }
    }

    #[inline]
    pub fn flags(&self, page: u64) -> PageFlags {
        self.flags
            .get(page as usize)
            .copied()
            .unwrap_or_default()
    }

    #[inline]
    pub fn set(&mut self, page: u64, flag: PageFlags) {
        if let Some(slot) = self.flags.get_mut(page as usize) {
            *slot |= flag;
        }
    }

    #[inline]
    pub fn clear(&mut self, page: u64, flag: PageFlags) {
        if let Some(slot) = self.flags.get_mut(page as usize) {
            *slot &= !flag;
        }
    }

    pub fn clear_all(&mut self) {
        self.flags.fill(PageFlags::empty());
    }
}

// ---- Device access seam -----------------------------------------------------

/// Collaborator handling accesses the fast path cannot serve directly
/// (MMIO pages and fallback-tagged pages).
pub trait MmioHandler {
    fn read(&mut self, addr: u64, width: Width) -> u64;
    fn write(&mut self, addr: u64, width: Width, value: u64);
}

/// Handler that reads as open bus and drops writes; useful as a default and
/// in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenBus;

impl MmioHandler for OpenBus {
    fn read(&mut self, _addr: u64, _width: Width) -> u64 {
        !0
    }

    fn write(&mut self, _addr: u64, _width: Width, _value: u64) {}
}
