//! Multicast group subscription database.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::address::{Address, MulticastGroup};

/// How long a LIKE stays fresh before gather stops returning it.
pub const MULTICAST_LIKE_EXPIRE: u64 = 600_000;

/// Subscription store mapping (network, group) to liking members.
///
/// Internally synchronized; `add` has set semantics so replayed LIKEs are
/// idempotent apart from refreshing the timestamp.
#[derive(Default)]
pub struct MulticastStore {
    groups: RwLock<HashMap<(u64, MulticastGroup), HashMap<Address, u64>>>,
}

impl MulticastStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `member` subscribes to `group` on `nwid`.
    pub fn add(&self, now: u64, nwid: u64, group: MulticastGroup, member: Address) {
        self.groups
            .write()
            .entry((nwid, group))
            .or_default()
            .insert(member, now);
    }

    /// Record a batch of gathered members.
    pub fn add_multiple(
        &self,
        now: u64,
        nwid: u64,
        group: MulticastGroup,
        members: &[Address],
        _total_known: u32,
    ) {
        let mut groups = self.groups.write();
        let entry = groups.entry((nwid, group)).or_default();
        for m in members {
            entry.insert(*m, now);
        }
    }

    /// Remove a member that no longer wants the group.
    pub fn remove(&self, nwid: u64, group: MulticastGroup, member: Address) {
        let mut groups = self.groups.write();
        if let Some(entry) = groups.get_mut(&(nwid, group)) {
            entry.remove(&member);
            if entry.is_empty() {
                groups.remove(&(nwid, group));
            }
        }
    }

    /// Sample up to `limit` fresh subscribers, excluding the requestor.
    ///
    /// Returns the total number of fresh subscribers known and the sampled
    /// addresses.
    pub fn gather(
        &self,
        requestor: Address,
        nwid: u64,
        group: MulticastGroup,
        limit: u32,
        now: u64,
    ) -> (u32, Vec<Address>) {
        let groups = self.groups.read();
        let Some(entry) = groups.get(&(nwid, group)) else {
            return (0, Vec::new());
        };
        let mut fresh: Vec<Address> = entry
            .iter()
            .filter(|(a, last)| **a != requestor && now.saturating_sub(**last) < MULTICAST_LIKE_EXPIRE)
            .map(|(a, _)| *a)
            .collect();
        fresh.sort_unstable();
        let total = fresh.len() as u32;
        fresh.truncate(limit as usize);
        (total, fresh)
    }

    /// True iff `member` currently subscribes to `group` on `nwid`.
    pub fn is_subscribed(&self, nwid: u64, group: MulticastGroup, member: Address) -> bool {
        self.groups
            .read()
            .get(&(nwid, group))
            .is_some_and(|e| e.contains_key(&member))
    }
}
