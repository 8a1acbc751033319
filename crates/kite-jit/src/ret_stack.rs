//! Return prediction.
//!
//! Calls push the expected return pc together with the host address just
//! past the call site; returns pop and compare. A hit skips the lookup
//! table entirely; any mismatch throws the whole stack away, since one
//! wrong frame means every frame below it is suspect too.

use crate::cache::BlockId;
use crate::code::HostAddr;

#[derive(Debug, Clone, Copy)]
struct Frame {
    ret_pc: u64,
    host: HostAddr,
    /// Block the predicted host address points into; `None` when the
    /// prediction is the trampoline (target not compiled at push time),
    /// which can never be evicted.
    block: Option<BlockId>,
}

#[derive(Debug)]
pub struct ReturnPrediction {
    frames: Vec<Frame>,
    cap: usize,
}

impl ReturnPrediction {
    pub fn new(cap: usize) -> Self {
        Self {
            frames: Vec::with_capacity(cap),
            cap,
        }
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Record a prediction. A full stack drops the oldest frame; deep
    /// recursion degrades to table lookups instead of failing.
    pub fn push(&mut self, ret_pc: u64, host: HostAddr, block: Option<BlockId>) {
        if self.frames.len() == self.cap {
            self.frames.remove(0);
        }
        self.frames.push(Frame {
            ret_pc,
            host,
            block,
        });
    }

    /// Pop and validate against the actual return pc. `Some(host)` on a hit;
    /// `None` clears all remaining frames.
    pub fn pop(&mut self, actual_pc: u64) -> Option<HostAddr> {
        match self.frames.pop() {
            Some(frame) if frame.ret_pc == actual_pc => Some(frame.host),
            Some(_) => {
                self.frames.clear();
                None
            }
            None => None,
        }
    }

    /// Drop every frame predicting into `block`. The frames above and below
    /// go too: their host addresses are fine, but a partial stack would pair
    /// pops with the wrong pushes once the missing frame's call returns.
    pub fn on_evicted(&mut self, block: BlockId) {
        if self.frames.iter().any(|f| f.block == Some(block)) {
            self.frames.clear();
        }
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}
