//! Static branch linker: rewrites block exits in place so predictable
//! successors bypass the lookup table.
//!
//! Each link site is a two-slot patch region reserved at block generation:
//!
//! ```text
//! Unlinked:       [LinkNop,              CallLinker{site}]
//! Singly-linked:  [CondLink{T1 -> B1},   CallLinker{site}]
//! Doubly-linked:  [CondLink{T1 -> B1},   Jump{B2}]          (terminal)
//! ```
//!
//! A site reaches Doubly only when the fallback fires with a second distinct
//! target, which can only happen at a two-successor exit (conditional
//! branch); the decoder guarantees at most two static successors per site,
//! so no third target is representable by construction; there is no runtime
//! check.
//!
//! Every patch is paired with a link entry keyed by the target block, so
//! invalidating a target restores each referencing site to its byte-exact
//! unlinked form. The linker table is always consulted before a block is
//! removed, never the other way around; that ordering is what prevents a
//! stale patched branch from outliving its target.

use std::collections::HashMap;

use crate::cache::BlockId;
use crate::code::{CodeArena, HostAddr, HostOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SiteId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Unlinked,
    Singly { t1: u64 },
    Doubly { t1: u64, t2: u64 },
}

#[derive(Debug)]
struct LinkSite {
    /// First slot of the patch region.
    host: HostAddr,
    /// Block the site lives in.
    owner: BlockId,
    state: LinkState,
    /// Target blocks this site currently holds patches into.
    recorded: Vec<BlockId>,
}

/// Outcome of a linker invocation from generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    /// The site was patched (or already routes the target); continue at the
    /// target's host entry.
    Linked(HostAddr),
    /// Target not compiled yet: nothing was patched, route through the
    /// lookup table and retry on a future hit.
    NoTarget,
}

#[derive(Debug, Default)]
pub struct Linker {
    sites: Vec<Option<LinkSite>>,
    by_target: HashMap<BlockId, Vec<SiteId>>,
}

impl Linker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh (unlinked) site. The caller patches the arena's
    /// second site slot with `CallLinker{site}` using the returned id.
    pub fn create_site(&mut self, owner: BlockId, host: HostAddr) -> SiteId {
        let id = SiteId(self.sites.len() as u32);
        self.sites.push(Some(LinkSite {
            host,
            owner,
            state: LinkState::Unlinked,
            recorded: Vec::new(),
        }));
        id
    }

    pub fn state(&self, site: SiteId) -> Option<LinkState> {
        self.sites.get(site.0 as usize)?.as_ref().map(|s| s.state)
    }

    /// Sites currently patched into `target`.
    pub fn sites_into(&self, target: BlockId) -> &[SiteId] {
        self.by_target
            .get(&target)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Linker entry point, invoked from a site's `CallLinker` fallback with
    /// the current guest `pc` as the wanted target. `target` is the resolved
    /// block for that pc, if one exists.
    pub fn link(
        &mut self,
        arena: &mut CodeArena,
        site_id: SiteId,
        target_guest: u64,
        target: Option<(BlockId, HostAddr)>,
    ) -> LinkOutcome {
        let Some((target_block, target_host)) = target else {
            return LinkOutcome::NoTarget;
        };
        let Some(site) = self.sites.get_mut(site_id.0 as usize).and_then(Option::as_mut) else {
            // The owning block was evicted out from under a pending call;
            // resolve through the table.
            return LinkOutcome::NoTarget;
        };

        match site.state {
            LinkState::Unlinked => {
                arena.patch(
                    site.host,
                    HostOp::CondLink {
                        guest: target_guest,
                        host: target_host,
                    },
                );
                site.state = LinkState::Singly { t1: target_guest };
                site.recorded.push(target_block);
                self.by_target.entry(target_block).or_default().push(site_id);
                tracing::trace!(?site_id, target_guest, "link site singly-linked");
                LinkOutcome::Linked(target_host)
            }
            LinkState::Singly { t1 } => {
                // The CondLink catches t1, so the fallback only fires for a
                // second, distinct successor.
                debug_assert_ne!(t1, target_guest);
                arena.patch(site.host.next(), HostOp::Jump { host: target_host });
                site.state = LinkState::Doubly {
                    t1,
                    t2: target_guest,
                };
                site.recorded.push(target_block);
                self.by_target.entry(target_block).or_default().push(site_id);
                tracing::trace!(?site_id, target_guest, "link site doubly-linked");
                LinkOutcome::Linked(target_host)
            }
            LinkState::Doubly { .. } => {
                // The fallback slot no longer exists in a doubly-linked site.
                debug_assert!(false, "linker call from doubly-linked site");
                LinkOutcome::NoTarget
            }
        }
    }

    /// Undo every patch into `target`, restoring each referencing site to
    /// its byte-exact unlinked form. Returns how many sites were restored.
    pub fn unlink_all(&mut self, arena: &mut CodeArena, target: BlockId) -> usize {
        let Some(site_ids) = self.by_target.remove(&target) else {
            return 0;
        };
        let count = site_ids.len();
        for site_id in site_ids {
            let Some(site) = self.sites.get_mut(site_id.0 as usize).and_then(Option::as_mut)
            else {
                continue;
            };
            arena.patch(site.host, HostOp::LinkNop);
            arena.patch(site.host.next(), HostOp::CallLinker { site: site_id });
            site.state = LinkState::Unlinked;
            // A doubly-linked site also held a patch into its other target;
            // drop that entry so it cannot be restored twice.
            for other in site.recorded.drain(..) {
                if other != target {
                    if let Some(list) = self.by_target.get_mut(&other) {
                        list.retain(|&s| s != site_id);
                        if list.is_empty() {
                            self.by_target.remove(&other);
                        }
                    }
                }
            }
        }
        count
    }

    /// Forget the sites owned by an evicted block. Each slot is restored to
    /// its unlinked form first: the owner may still be mid-execution when it
    /// is evicted, and its terminator must then resolve through the table
    /// instead of jumping into a torn-down target.
    pub fn drop_sites(&mut self, arena: &mut CodeArena, sites: &[SiteId]) {
        for &site_id in sites {
            let Some(site) = self.sites.get_mut(site_id.0 as usize).and_then(Option::take) else {
                continue;
            };
            arena.patch(site.host, HostOp::LinkNop);
            arena.patch(site.host.next(), HostOp::CallLinker { site: site_id });
            for target in site.recorded {
                if let Some(list) = self.by_target.get_mut(&target) {
                    list.retain(|&s| s != site_id);
                    if list.is_empty() {
                        self.by_target.remove(&target);
                    }
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.sites.clear();
        self.by_target.clear();
    }
}
