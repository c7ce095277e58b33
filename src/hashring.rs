use siphasher::sip::{SipHasher13, SipHasher24};
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{BuildHasher, Hash, Hasher};
use std::str::FromStr;

#[cfg(feature = "derive")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

mod crud;
mod iterator;
pub mod sources;
pub mod union;

pub use iterator::ConsistentHashIterator;
pub use union::{Mapping, UnionConsistentHash};

/// Number of slots on the ring. Must stay well above the largest expected
/// cluster so that collision probing remains short.
pub const RING_SIZE: u32 = 10240;

/// Hash functions a ring can be configured with, resolved by name at startup.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "derive", derive(Serialize, Deserialize))]
pub enum HashStrategy {
    Sip13,
    #[default]
    Sip24,
}

impl HashStrategy {
    /// Names accepted by [`HashStrategy::from_str`].
    pub const NAMES: [&'static str; 3] = ["default", "sip13", "sip24"];
}

impl FromStr for HashStrategy {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "default" | "sip24" => Ok(HashStrategy::Sip24),
            "sip13" => Ok(HashStrategy::Sip13),
            other => Err(Error::Config(format!(
                "unknown hash strategy '{other}', expected one of {:?}",
                HashStrategy::NAMES
            ))),
        }
    }
}

/// Hasher produced by a [`HashStrategy`].
#[derive(Debug, Clone)]
pub enum StrategyHasher {
    Sip13(SipHasher13),
    Sip24(SipHasher24),
}

impl Hasher for StrategyHasher {
    fn finish(&self) -> u64 {
        match self {
            StrategyHasher::Sip13(h) => h.finish(),
            StrategyHasher::Sip24(h) => h.finish(),
        }
    }

    fn write(&mut self, bytes: &[u8]) {
        match self {
            StrategyHasher::Sip13(h) => h.write(bytes),
            StrategyHasher::Sip24(h) => h.write(bytes),
        }
    }
}

impl BuildHasher for HashStrategy {
    type Hasher = StrategyHasher;

    fn build_hasher(&self) -> Self::Hasher {
        match self {
            HashStrategy::Sip13 => StrategyHasher::Sip13(SipHasher13::new()),
            HashStrategy::Sip24 => StrategyHasher::Sip24(SipHasher24::new()),
        }
    }
}

/// Reduces a hash to a ring slot.
///
/// The hash is narrowed to a signed 32-bit value first. `i32::MIN` is nudged
/// by one so that taking the absolute value cannot overflow.
pub(crate) fn ring_slot(hash: u64) -> u32 {
    let mut signed = hash as u32 as i32;
    if signed == i32::MIN {
        signed += 1;
    }
    signed.unsigned_abs() % RING_SIZE
}

/// Lookup contract shared by plain and union mappings.
pub trait OwnerLookup<T> {
    /// Ordered owners of `key`, at most `replication_count` distinct members.
    fn locate<K: Hash + ?Sized>(&self, key: &K, replication_count: usize) -> Vec<T>;

    fn is_owner<K: Hash + ?Sized>(&self, candidate: &T, key: &K, replication_count: usize)
    -> bool;

    /// Members that must receive a write to `key`. Same as `locate` unless a
    /// transition is in flight.
    fn write_owners<K: Hash + ?Sized>(&self, key: &K, replication_count: usize) -> Vec<T> {
        self.locate(key, replication_count)
    }

    /// Every member known to the mapping.
    fn all_members(&self) -> Vec<T>;
}

/// ConsistentHash maps every member to exactly one slot of a ring of
/// [`RING_SIZE`] slots and every key to the members following its slot.
///
/// The canonical member order is the ascending order of ring positions, not
/// the order members were handed in. Two rings built from the same member
/// set with the same hash function are identical.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "derive", derive(Serialize, Deserialize))]
#[cfg_attr(
    feature = "derive",
    serde(bound(
        serialize = "T: Serialize",
        deserialize = "T: Deserialize<'de> + Ord, S: Default"
    ))
)]
pub struct ConsistentHash<T, S = HashStrategy> {
    #[cfg_attr(feature = "derive", serde(skip))]
    hash_builder: S,
    members: Vec<T>,
    positions: BTreeMap<u32, T>,
    member_positions: BTreeMap<T, u32>,
}

impl<T> ConsistentHash<T>
where
    T: Hash + Ord + Clone,
{
    /// Build a ring using the default hash strategy.
    pub fn new(members: impl IntoIterator<Item = T>) -> Result<Self> {
        Self::with_hasher(members, HashStrategy::default())
    }
}

impl<T, S> ConsistentHash<T, S>
where
    T: Hash + Ord + Clone,
    S: BuildHasher,
{
    /// Place `members` on the ring.
    ///
    /// Duplicates are ignored. Members are placed in ascending order of
    /// (natural slot, member), an occupied slot is probed forward by one
    /// until a free one is found, so placement never depends on the order
    /// of the input.
    ///
    /// # Examples
    ///
    /// ```
    /// use hashring_rehash::{ConsistentHash, HashStrategy};
    ///
    /// let ring = ConsistentHash::with_hasher(["b", "a", "c"], HashStrategy::Sip13).unwrap();
    /// let same = ConsistentHash::with_hasher(["c", "b", "a"], HashStrategy::Sip13).unwrap();
    ///
    /// assert_eq!(ring, same);
    /// assert_eq!(ring.locate(&"some key", 2).len(), 2);
    /// ```
    pub fn with_hasher(members: impl IntoIterator<Item = T>, hash_builder: S) -> Result<Self> {
        let distinct: BTreeSet<T> = members.into_iter().collect();

        if distinct.len() > RING_SIZE as usize {
            return Err(Error::RingFull {
                members: distinct.len(),
                ring_size: RING_SIZE,
            });
        }

        let mut slotted: Vec<(u32, T)> = distinct
            .into_iter()
            .map(|member| (ring_slot(hash_builder.hash_one(&member)), member))
            .collect();
        slotted.sort();

        let mut positions = BTreeMap::new();
        let mut member_positions = BTreeMap::new();

        for (slot, member) in slotted {
            let mut position = slot;
            while positions.contains_key(&position) {
                position = (position + 1) % RING_SIZE;
            }
            member_positions.insert(member.clone(), position);
            positions.insert(position, member);
        }

        let members = positions.values().cloned().collect();

        Ok(ConsistentHash {
            hash_builder,
            members,
            positions,
            member_positions,
        })
    }
}

impl<T, S> ConsistentHash<T, S> {
    /// Get the number of members on the ring.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns true if the ring has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members in canonical (ring position) order.
    pub fn members(&self) -> &[T] {
        &self.members
    }

    /// Occupied ring positions with their members, ascending.
    pub fn positions(&self) -> impl Iterator<Item = (u32, &T)> {
        self.positions.iter().map(|(position, member)| (*position, member))
    }

    pub fn hash_space(&self) -> u32 {
        RING_SIZE
    }

    pub fn hash_builder(&self) -> &S {
        &self.hash_builder
    }
}

impl<T, S> ConsistentHash<T, S>
where
    T: Ord,
{
    pub fn contains(&self, member: &T) -> bool {
        self.member_positions.contains_key(member)
    }

    /// Ring position of `member`, `None` if it is not part of the ring.
    pub fn ring_position_of(&self, member: &T) -> Option<u32> {
        self.member_positions.get(member).copied()
    }

    fn canonical_index(&self, member: &T) -> Option<usize> {
        let position = self.ring_position_of(member)?;
        Some(self.positions.range(..position).count())
    }

    /// Forward distance from `a` to `b` in canonical order, wrapping around.
    /// `None` if either member is unknown.
    pub fn ring_distance(&self, a: &T, b: &T) -> Option<usize> {
        let from = self.canonical_index(a)?;
        let to = self.canonical_index(b)?;

        if from <= to {
            Some(to - from)
        } else {
            Some(self.members.len() - (from - to))
        }
    }

    /// True if `a` and `b` are neighbours in either direction.
    pub fn are_adjacent(&self, a: &T, b: &T) -> bool {
        match self.ring_distance(a, b) {
            Some(distance) => distance == 1 || distance == self.members.len() - 1,
            None => false,
        }
    }
}

// Equality ignores the hash builder: two rings are the same mapping when
// they order and place the same members identically.
impl<T: PartialEq, S> PartialEq for ConsistentHash<T, S> {
    fn eq(&self, other: &Self) -> bool {
        self.members == other.members && self.positions == other.positions
    }
}

impl<T: Eq, S> Eq for ConsistentHash<T, S> {}
