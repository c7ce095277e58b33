//! Transitional mappings used while ownership moves from one ring to another.

use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

#[cfg(feature = "derive")]
use serde::{Deserialize, Serialize};

use super::{ConsistentHash, HashStrategy, OwnerLookup};

/// Combines the ring in force before a topology change with the ring that
/// will be in force after it.
///
/// Lookups return the owners under `old` first, then any additional owners
/// under `new`, so a read issued against either ring still reaches a member
/// holding the key.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "derive", derive(Serialize, Deserialize))]
#[cfg_attr(
    feature = "derive",
    serde(bound(
        serialize = "T: Serialize",
        deserialize = "T: Deserialize<'de> + Ord, S: Default"
    ))
)]
pub struct UnionConsistentHash<T, S = HashStrategy> {
    old: Arc<ConsistentHash<T, S>>,
    new: Arc<ConsistentHash<T, S>>,
}

impl<T, S> UnionConsistentHash<T, S> {
    pub fn new(old: Arc<ConsistentHash<T, S>>, new: Arc<ConsistentHash<T, S>>) -> Self {
        UnionConsistentHash { old, new }
    }

    pub fn old(&self) -> &Arc<ConsistentHash<T, S>> {
        &self.old
    }

    pub fn new_hash(&self) -> &Arc<ConsistentHash<T, S>> {
        &self.new
    }
}

impl<T, S> OwnerLookup<T> for UnionConsistentHash<T, S>
where
    T: Clone + PartialEq,
    S: BuildHasher,
{
    /// Owners under `old`, topped up with owners under `new`, capped at
    /// `replication_count`.
    fn locate<K: Hash + ?Sized>(&self, key: &K, replication_count: usize) -> Vec<T> {
        let mut owners = self.old.locate(key, replication_count);

        for member in self.new.locate(key, replication_count) {
            if owners.len() >= replication_count {
                break;
            }
            if !owners.contains(&member) {
                owners.push(member);
            }
        }

        owners
    }

    fn is_owner<K: Hash + ?Sized>(
        &self,
        candidate: &T,
        key: &K,
        replication_count: usize,
    ) -> bool {
        OwnerLookup::locate(self, key, replication_count).contains(candidate)
    }

    /// Every owner under either ring, not capped: writes issued during a
    /// transition must reach the future owners too.
    fn write_owners<K: Hash + ?Sized>(&self, key: &K, replication_count: usize) -> Vec<T> {
        let mut owners = self.old.locate(key, replication_count);

        for member in self.new.locate(key, replication_count) {
            if !owners.contains(&member) {
                owners.push(member);
            }
        }

        owners
    }

    fn all_members(&self) -> Vec<T> {
        let mut members = self.old.members().to_vec();

        for member in self.new.members() {
            if !members.contains(member) {
                members.push(member.clone());
            }
        }

        members
    }
}

impl<T: PartialEq, S> PartialEq for UnionConsistentHash<T, S> {
    fn eq(&self, other: &Self) -> bool {
        self.old == other.old && self.new == other.new
    }
}

/// The mapping a node routes keys with: either a settled ring, or the union
/// of two rings while a rehash is in flight.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "derive", derive(Serialize, Deserialize))]
#[cfg_attr(
    feature = "derive",
    serde(bound(
        serialize = "T: Serialize",
        deserialize = "T: Deserialize<'de> + Ord, S: Default"
    ))
)]
pub enum Mapping<T, S = HashStrategy> {
    Single(Arc<ConsistentHash<T, S>>),
    Union(UnionConsistentHash<T, S>),
}

impl<T, S> Mapping<T, S> {
    pub fn union(old: Arc<ConsistentHash<T, S>>, new: Arc<ConsistentHash<T, S>>) -> Self {
        Mapping::Union(UnionConsistentHash::new(old, new))
    }

    pub fn is_union(&self) -> bool {
        matches!(self, Mapping::Union(_))
    }

    /// The settled ring, `None` while a transition is in flight.
    pub fn as_single(&self) -> Option<&Arc<ConsistentHash<T, S>>> {
        match self {
            Mapping::Single(hash) => Some(hash),
            Mapping::Union(_) => None,
        }
    }

    /// The ring this mapping is heading to: itself when settled, the new
    /// side of a union otherwise.
    pub fn target(&self) -> &Arc<ConsistentHash<T, S>> {
        match self {
            Mapping::Single(hash) => hash,
            Mapping::Union(union) => union.new_hash(),
        }
    }
}

impl<T, S> From<ConsistentHash<T, S>> for Mapping<T, S> {
    fn from(hash: ConsistentHash<T, S>) -> Self {
        Mapping::Single(Arc::new(hash))
    }
}

impl<T, S> From<Arc<ConsistentHash<T, S>>> for Mapping<T, S> {
    fn from(hash: Arc<ConsistentHash<T, S>>) -> Self {
        Mapping::Single(hash)
    }
}

impl<T, S> OwnerLookup<T> for Mapping<T, S>
where
    T: Clone + PartialEq,
    S: BuildHasher,
{
    fn locate<K: Hash + ?Sized>(&self, key: &K, replication_count: usize) -> Vec<T> {
        match self {
            Mapping::Single(hash) => hash.locate(key, replication_count),
            Mapping::Union(union) => union.locate(key, replication_count),
        }
    }

    fn is_owner<K: Hash + ?Sized>(
        &self,
        candidate: &T,
        key: &K,
        replication_count: usize,
    ) -> bool {
        match self {
            Mapping::Single(hash) => hash.is_owner(candidate, key, replication_count),
            Mapping::Union(union) => union.is_owner(candidate, key, replication_count),
        }
    }

    fn write_owners<K: Hash + ?Sized>(&self, key: &K, replication_count: usize) -> Vec<T> {
        match self {
            Mapping::Single(hash) => hash.locate(key, replication_count),
            Mapping::Union(union) => union.write_owners(key, replication_count),
        }
    }

    fn all_members(&self) -> Vec<T> {
        match self {
            Mapping::Single(hash) => hash.all_members(),
            Mapping::Union(union) => union.all_members(),
        }
    }
}

impl<T: PartialEq, S> PartialEq for Mapping<T, S> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Mapping::Single(a), Mapping::Single(b)) => a == b,
            (Mapping::Union(a), Mapping::Union(b)) => a == b,
            _ => false,
        }
    }
}
