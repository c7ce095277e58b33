//! Builds and derives rings for a configured hash strategy.

use std::hash::Hash;
use std::sync::Arc;

use tracing::debug;

use crate::config::DistributionConfig;
use crate::error::Result;
use crate::hashring::{ConsistentHash, HashStrategy, Mapping};

/// Creates rings that all share one hash strategy, so that rings built on
/// different members of the cluster agree on placement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ConsistentHashFactory {
    strategy: HashStrategy,
}

impl ConsistentHashFactory {
    pub fn new(strategy: HashStrategy) -> Self {
        ConsistentHashFactory { strategy }
    }

    /// Resolve the configured strategy name.
    ///
    /// An unknown name is a configuration error and must stop startup.
    pub fn from_config(config: &DistributionConfig) -> Result<Self> {
        let strategy = config.hash_strategy.parse()?;
        debug!(?strategy, "resolved consistent hash strategy");
        Ok(Self::new(strategy))
    }

    pub fn strategy(&self) -> HashStrategy {
        self.strategy
    }

    pub fn create<T>(&self, members: impl IntoIterator<Item = T>) -> Result<ConsistentHash<T>>
    where
        T: Hash + Ord + Clone,
    {
        ConsistentHash::with_hasher(members, self.strategy)
    }

    /// Build a ring from `members` plus `extra` (typically a joiner).
    pub fn create_with<T>(
        &self,
        members: impl IntoIterator<Item = T>,
        extra: impl IntoIterator<Item = T>,
    ) -> Result<ConsistentHash<T>>
    where
        T: Hash + Ord + Clone,
    {
        self.create(members.into_iter().chain(extra))
    }

    /// A copy of `mapping` without `member`.
    ///
    /// A union loses the member on both sides and stays a union.
    pub fn remove_member<T>(&self, mapping: &Mapping<T>, member: &T) -> Result<Mapping<T>>
    where
        T: Hash + Ord + Clone,
    {
        match mapping {
            Mapping::Single(hash) => Ok(Mapping::Single(Arc::new(
                self.remove_from_hash(hash, member)?,
            ))),
            Mapping::Union(union) => Ok(Mapping::union(
                Arc::new(self.remove_from_hash(union.old(), member)?),
                Arc::new(self.remove_from_hash(union.new_hash(), member)?),
            )),
        }
    }

    fn remove_from_hash<T>(&self, hash: &ConsistentHash<T>, member: &T) -> Result<ConsistentHash<T>>
    where
        T: Hash + Ord + Clone,
    {
        self.create(hash.iter().filter(|m| *m != member).cloned())
    }

    /// Transitional mapping over `old` and `new`, `old` owners first.
    pub fn union_of<T>(&self, old: Arc<ConsistentHash<T>>, new: Arc<ConsistentHash<T>>) -> Mapping<T> {
        Mapping::union(old, new)
    }
}
