//! Which members exchange state when a ring changes.
//!
//! These helpers answer, for a member joining or leaving, who may hold state
//! it must now co-own and who holds copies it no longer needs.

use std::hash::Hash;

use super::{ConsistentHash, OwnerLookup};

impl<T, S> ConsistentHash<T, S>
where
    T: Clone + PartialEq,
{
    /// Members that may hold keys `target` co-owns on this ring.
    ///
    /// With `replication_count` owners per key, `target` only shares keys
    /// with its `replication_count - 1` predecessors in ring order, and it
    /// takes over keys from its immediate successor. Asking exactly these
    /// members avoids an all-to-all state request.
    ///
    /// Predecessors come first, farthest first, followed by the successor.
    /// `target` itself is never returned. Returns an empty list if `target`
    /// is not on the ring or is alone on it.
    pub fn state_providers(&self, target: &T, replication_count: usize) -> Vec<T> {
        let Some(index) = self.members.iter().position(|m| m == target) else {
            return vec![];
        };

        let len = self.members.len();
        let mut providers: Vec<T> = vec![];

        for back in (1..replication_count.min(len)).rev() {
            let member = &self.members[(index + len - back) % len];
            if !providers.contains(member) {
                providers.push(member.clone());
            }
        }

        let successor = &self.members[(index + 1) % len];
        if successor != target && !providers.contains(successor) {
            providers.push(successor.clone());
        }

        providers
    }
}

/// Members that owned `key` under `old` but do not own it under `new`.
pub fn stale_owners<T, K, O, N>(old: &O, new: &N, key: &K, replication_count: usize) -> Vec<T>
where
    T: PartialEq,
    K: Hash + ?Sized,
    O: OwnerLookup<T>,
    N: OwnerLookup<T>,
{
    let current = new.locate(key, replication_count);
    old.locate(key, replication_count)
        .into_iter()
        .filter(|member| !current.contains(member))
        .collect()
}

/// Members that own `key` under `new` but did not own it under `old`.
pub fn gained_owners<T, K, O, N>(old: &O, new: &N, key: &K, replication_count: usize) -> Vec<T>
where
    T: PartialEq,
    K: Hash + ?Sized,
    O: OwnerLookup<T>,
    N: OwnerLookup<T>,
{
    stale_owners(new, old, key, replication_count)
}
