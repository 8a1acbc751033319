//! Flat dispatch table mapping aligned guest addresses to host entries.
//!
//! Every slot is pre-filled with the compile trampoline, so a miss and a hit
//! are indistinguishable to generated code: both are an indirect jump
//! through the slot. The invariant maintained here is that a slot only ever
//! holds a live block entry or the trampoline; `reset` is the only way an
//! entry leaves, and it restores the trampoline.

use crate::code::HostAddr;
use crate::error::GuestFault;

#[derive(Debug)]
pub struct LookupTable {
    slots: Vec<HostAddr>,
    align_shift: u32,
    limit: u64,
}

impl LookupTable {
    /// One slot per `1 << align_shift` bytes of guest space below `limit`.
    pub fn new(limit: u64, align_shift: u32) -> Self {
        let count = (limit >> align_shift) as usize;
        Self {
            slots: vec![HostAddr::TRAMPOLINE; count],
            align_shift,
            limit,
        }
    }

    #[inline]
    fn index(&self, guest: u64) -> Result<usize, GuestFault> {
        if guest >= self.limit {
            return Err(GuestFault::OutOfRange { addr: guest });
        }
        Ok((guest >> self.align_shift) as usize)
    }

    /// Hot-path slot read. Out-of-range addresses are a guest fault, never a
    /// host crash.
    #[inline]
    pub fn lookup(&self, guest: u64) -> Result<HostAddr, GuestFault> {
        Ok(self.slots[self.index(guest)?])
    }

    pub fn install(&mut self, guest: u64, entry: HostAddr) -> Result<(), GuestFault> {
        debug_assert_ne!(entry, HostAddr::TRAMPOLINE);
        let idx = self.index(guest)?;
        self.slots[idx] = entry;
        Ok(())
    }

    pub fn reset(&mut self, guest: u64) {
        if let Ok(idx) = self.index(guest) {
            self.slots[idx] = HostAddr::TRAMPOLINE;
        }
    }

    pub fn reset_all(&mut self) {
        self.slots.fill(HostAddr::TRAMPOLINE);
    }

    #[inline]
    pub fn limit(&self) -> u64 {
        self.limit
    }
}
