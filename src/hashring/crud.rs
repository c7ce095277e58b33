use std::hash::{BuildHasher, Hash};

use super::{ConsistentHash, OwnerLookup, ring_slot};

impl<T, S> ConsistentHash<T, S>
where
    T: Clone + PartialEq,
    S: BuildHasher,
{
    /// Returns the owners of `key`: the member at the first ring position at
    /// or after the key's slot, followed by the next members in ring order,
    /// wrapping around once.
    ///
    /// At most `min(replication_count, len())` members are returned, never
    /// the same member twice. Returns an empty list if the ring is empty.
    pub fn locate<K: Hash + ?Sized>(&self, key: &K, replication_count: usize) -> Vec<T> {
        let limit = replication_count.min(self.len());

        self.walk_from(self.key_position(key))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Same answer as `locate(key, replication_count).contains(candidate)`,
    /// without building the owner list.
    pub fn is_owner<K: Hash + ?Sized>(
        &self,
        candidate: &T,
        key: &K,
        replication_count: usize,
    ) -> bool {
        let limit = replication_count.min(self.len());

        self.walk_from(self.key_position(key))
            .take(limit)
            .any(|member| member == candidate)
    }

    /// Primary owner of `key`, `None` on an empty ring.
    pub fn primary<K: Hash + ?Sized>(&self, key: &K) -> Option<&T> {
        self.walk_from(self.key_position(key)).next()
    }

    /// Ring slot a key hashes to.
    pub fn key_position<K: Hash + ?Sized>(&self, key: &K) -> u32 {
        ring_slot(self.get_hash(key))
    }

    // Converts a reference to a hashable type into the `u64` the ring slot is
    // derived from.
    pub fn get_hash<U: Hash + ?Sized>(&self, input: &U) -> u64 {
        self.hash_builder.hash_one(input)
    }

    // Members from `position` onwards, then from the start of the ring.
    fn walk_from(&self, position: u32) -> impl Iterator<Item = &T> {
        self.positions
            .range(position..)
            .chain(self.positions.range(..position))
            .map(|(_, member)| member)
    }
}

impl<T, S> OwnerLookup<T> for ConsistentHash<T, S>
where
    T: Clone + PartialEq,
    S: BuildHasher,
{
    fn locate<K: Hash + ?Sized>(&self, key: &K, replication_count: usize) -> Vec<T> {
        ConsistentHash::locate(self, key, replication_count)
    }

    fn is_owner<K: Hash + ?Sized>(
        &self,
        candidate: &T,
        key: &K,
        replication_count: usize,
    ) -> bool {
        ConsistentHash::is_owner(self, candidate, key, replication_count)
    }

    fn all_members(&self) -> Vec<T> {
        self.members.clone()
    }
}
