//! A cluster member: accepted mapping, write log, local store and transport,
//! wired together.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::DistributionConfig;
use crate::error::{RehashError, Result, TransportError};
use crate::factory::ConsistentHashFactory;
use crate::hashring::{ConsistentHash, Mapping, OwnerLookup};
use crate::member::Address;
use crate::membership::MembershipState;
use crate::store::{CacheEntry, DataStore, WriteCommand};
use crate::transport::{ClusterTransport, CommandHandler, RehashCommand, Response};
use crate::txlog::{LoggedTransaction, TransactionLogger};

/// One member of the cluster.
///
/// Serves the commands other members send during and outside a rehash and
/// routes client reads and writes to the owners of each key.
#[derive(Debug)]
pub struct ClusterNode {
    address: Address,
    config: DistributionConfig,
    factory: ConsistentHashFactory,
    membership: MembershipState,
    logger: TransactionLogger,
    // ring a running rehash moves away from, set while the log is on
    moving_from: RwLock<Option<Arc<ConsistentHash<Address>>>>,
    store: Arc<dyn DataStore>,
    transport: Arc<dyn ClusterTransport>,
    rehash_lock: Mutex<()>,
}

impl ClusterNode {
    /// Create a member that accepts a ring of `members`.
    ///
    /// A member about to join passes only itself; the cluster mapping is
    /// fetched when it joins.
    pub fn new(
        config: DistributionConfig,
        transport: Arc<dyn ClusterTransport>,
        store: Arc<dyn DataStore>,
        members: impl IntoIterator<Item = Address>,
    ) -> Result<Self> {
        config.validate()?;

        let factory = ConsistentHashFactory::from_config(&config)?;
        let mapping = Mapping::from(factory.create(members)?);
        let address = transport.local_address().clone();

        debug!(%address, members = mapping.target().len(), "cluster node created");

        Ok(ClusterNode {
            address,
            config,
            factory,
            membership: MembershipState::new(mapping),
            logger: TransactionLogger::new(),
            moving_from: RwLock::new(None),
            store,
            transport,
            rehash_lock: Mutex::new(()),
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn config(&self) -> &DistributionConfig {
        &self.config
    }

    pub fn factory(&self) -> &ConsistentHashFactory {
        &self.factory
    }

    pub fn membership(&self) -> &MembershipState {
        &self.membership
    }

    pub fn logger(&self) -> &TransactionLogger {
        &self.logger
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    pub fn transport(&self) -> &Arc<dyn ClusterTransport> {
        &self.transport
    }

    pub(crate) fn rehash_lock(&self) -> &Mutex<()> {
        &self.rehash_lock
    }

    pub fn accepted_mapping(&self) -> Mapping<Address> {
        self.membership.mapping()
    }

    pub fn install_mapping(&self, mapping: Mapping<Address>) -> u64 {
        self.membership.install(mapping)
    }

    pub fn is_owner(&self, key: &str) -> bool {
        self.accepted_mapping()
            .is_owner(&self.address, key, self.config.num_owners)
    }

    /// The ring being moved from while a transition is in flight, the
    /// accepted ring otherwise.
    pub fn stable_ring(&self) -> Arc<ConsistentHash<Address>> {
        match self.accepted_mapping() {
            Mapping::Single(hash) => hash,
            Mapping::Union(union) => Arc::clone(union.old()),
        }
    }

    /// Whether this member's copy of `key` may be incomplete.
    ///
    /// While a rehash runs, only the keys this member owned under the ring it
    /// moves away from are complete locally. The rest may still be in
    /// transit, whatever mapping other members have installed meanwhile.
    pub fn is_uncertain(&self, key: &str) -> bool {
        if !self.logger.is_active() {
            return false;
        }

        match &*self.moving_from.read() {
            Some(old) => !old.is_owner(&self.address, key, self.config.num_owners),
            None => true,
        }
    }

    /// Start logging writes for a rehash away from `old`.
    pub(crate) fn begin_transition(
        &self,
        old: Arc<ConsistentHash<Address>>,
    ) -> std::result::Result<(), RehashError> {
        self.logger.enable()?;
        *self.moving_from.write() = Some(old);
        Ok(())
    }

    /// Replay the write log into the store and stop logging. Returns the
    /// number of replayed transactions.
    pub(crate) fn finish_transition(&self) -> usize {
        let replayed = self.logger.drain_and_disable(|tx| self.apply_to_store(&tx));
        *self.moving_from.write() = None;
        replayed
    }

    /// Drop the write log and stop logging. Returns the number of dropped
    /// transactions.
    pub(crate) fn abort_transition(&self) -> usize {
        let dropped = self.logger.unlock_and_disable();
        *self.moving_from.write() = None;
        dropped
    }

    // Local value of `key` including writes still waiting in the log. The
    // log is read before the store so a concurrent drain is never missed.
    fn local_entry(&self, key: &str) -> Option<CacheEntry> {
        if !self.logger.is_uncertain(key) {
            return self.store.get(key);
        }

        let pending = self.logger.pending_writes(key);
        let stored = self.store.get(key);

        pending.into_iter().fold(stored, |current, write| match write {
            WriteCommand::Put { key, value } => {
                let version = current.map_or(1, |entry| entry.version + 1);
                Some(CacheEntry::new(key, value, version))
            }
            WriteCommand::Remove { .. } => None,
        })
    }

    // Members a read of `key` is sent to, owners under the ring being moved
    // from first. Members missing from the target ring have left.
    fn read_owners(&self, mapping: &Mapping<Address>, key: &str) -> Vec<Address> {
        let target = mapping.target();
        mapping
            .write_owners(key, self.config.num_owners)
            .into_iter()
            .filter(|owner| target.contains(owner))
            .collect()
    }

    /// Apply writes to the local store, bypassing the log.
    fn apply_to_store(&self, tx: &LoggedTransaction) {
        for write in &tx.writes {
            self.store.write(write);
        }
    }

    // Log the transaction while a rehash runs, apply it otherwise.
    fn accept_write(&self, tx: LoggedTransaction) {
        if self.logger.log_if_enabled(tx.clone()) {
            return;
        }
        self.apply_to_store(&tx);
    }

    pub async fn put(
        &self,
        key: impl Into<String>,
        value: impl Into<Vec<u8>>,
    ) -> std::result::Result<(), TransportError> {
        self.write(LoggedTransaction::single(WriteCommand::put(key, value)))
            .await
    }

    pub async fn remove(&self, key: impl Into<String>) -> std::result::Result<(), TransportError> {
        self.write(LoggedTransaction::single(WriteCommand::remove(key)))
            .await
    }

    /// Send each write of `tx` to every member that must receive it.
    ///
    /// While a transition is in flight this includes the future owners, but
    /// not a member that has left. Each member gets a copy of the transaction
    /// holding only its own writes.
    pub async fn write(&self, tx: LoggedTransaction) -> std::result::Result<(), TransportError> {
        let mapping = self.accepted_mapping();
        let target = mapping.target();
        let mut per_owner: BTreeMap<Address, Vec<WriteCommand>> = BTreeMap::new();

        for write in &tx.writes {
            for owner in mapping.write_owners(write.key(), self.config.num_owners) {
                if target.contains(&owner) {
                    per_owner.entry(owner).or_default().push(write.clone());
                }
            }
        }

        let mut failed = vec![];

        for (owner, writes) in per_owner {
            let copy = tx.with_writes(writes);

            if owner == self.address {
                self.accept_write(copy);
                continue;
            }

            let replies = self
                .transport
                .send_sync(
                    std::slice::from_ref(&owner),
                    RehashCommand::Write(copy),
                    self.config.rehash_rpc_timeout,
                )
                .await;

            for (target, reply) in replies {
                match reply {
                    Ok(Response::Ack) => {}
                    Ok(other) => {
                        warn!(%target, ?other, "write not acknowledged");
                        failed.push(target);
                    }
                    Err(error) => {
                        warn!(%target, %error, "write not delivered");
                        failed.push(target);
                    }
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(TransportError::MissingAcks(failed))
        }
    }

    /// Read `key` from its owners.
    ///
    /// Served locally when this member owns the key and its copy is
    /// complete. Otherwise the other owners are asked, old owners first; one
    /// that is itself uncertain is skipped. Writes still in the log count as
    /// part of the local copy.
    pub async fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, TransportError> {
        let owners = self.read_owners(&self.accepted_mapping(), key);
        let local_owner = owners.contains(&self.address);

        if local_owner && !self.is_uncertain(key) {
            return Ok(self.local_entry(key).map(|entry| entry.value));
        }

        let mut last_error = None;

        for owner in owners.iter().filter(|owner| **owner != self.address) {
            let replies = self
                .transport
                .send_sync(
                    std::slice::from_ref(owner),
                    RehashCommand::ClusteredGet(key.to_string()),
                    self.config.rehash_rpc_timeout,
                )
                .await;

            for (target, reply) in replies {
                match reply {
                    Ok(Response::Value(entry)) => return Ok(entry.map(|entry| entry.value)),
                    Ok(Response::Uncertain) => trace!(%target, key, "owner is uncertain"),
                    Ok(other) => {
                        warn!(%target, ?other, "unexpected reply to a read");
                        last_error = Some(TransportError::Rejected {
                            from: target,
                            reason: format!("{other:?}"),
                        });
                    }
                    Err(error) => {
                        debug!(%target, %error, "read failed, trying next owner");
                        last_error = Some(error);
                    }
                }
            }
        }

        if local_owner {
            return Ok(self.local_entry(key).map(|entry| entry.value));
        }

        match (last_error, owners.first()) {
            (Some(error), _) => Err(error),
            (None, Some(owner)) => Err(TransportError::Unreachable(owner.clone())),
            (None, None) => Ok(None),
        }
    }

    // Entries `requester` owns under `new_mapping`. Copies this member kept
    // without owning them are left out: they may predate a later write.
    fn state_for(
        &self,
        requester: &Address,
        new_mapping: &ConsistentHash<Address>,
    ) -> Vec<CacheEntry> {
        let owners = self.config.num_owners;
        let held = self.stable_ring();

        self.store.read_all_matching(&|key| {
            new_mapping.is_owner(requester, key, owners)
                && held.is_owner(&self.address, key, owners)
        })
    }

    // Drop copies of `keys` this member no longer owns.
    fn invalidate(&self, keys: Vec<String>) -> usize {
        let mapping = self.accepted_mapping();
        let mut removed = 0;

        for key in keys {
            if mapping.is_owner(&self.address, key.as_str(), self.config.num_owners) {
                continue;
            }
            if self.store.remove_if_present(&key).is_some() {
                removed += 1;
            }
        }

        removed
    }
}

impl CommandHandler for ClusterNode {
    fn handle(&self, from: &Address, command: RehashCommand) -> Response {
        trace!(node = %self.address, %from, kind = ?command.kind(), "handling command");

        match command {
            RehashCommand::GetCurrentMapping { requester } => {
                let mapping = self.accepted_mapping();
                let settled = mapping.as_single().cloned();
                if settled.is_none() {
                    debug!(%requester, "mapping requested while a rehash is in flight");
                }
                Response::CurrentMapping(settled)
            }
            RehashCommand::InstallMapping(mapping) => {
                self.install_mapping(mapping);
                Response::Ack
            }
            RehashCommand::PullState {
                requester,
                new_mapping,
            } => {
                let entries = self.state_for(&requester, &new_mapping);
                debug!(%requester, entries = entries.len(), "serving state");
                Response::StateChunk(entries)
            }
            RehashCommand::PushState(entries) => {
                let received = entries.len();
                let applied = self.store.apply_entries(entries);
                debug!(%from, received, applied, "applied pushed state");
                Response::Ack
            }
            RehashCommand::InvalidateHint(keys) => {
                let removed = self.invalidate(keys);
                if removed > 0 {
                    debug!(%from, removed, "dropped stale copies");
                }
                Response::Ack
            }
            RehashCommand::JoinComplete(member) => {
                info!(node = %self.address, %member, "member finished joining");
                Response::Ack
            }
            RehashCommand::Write(tx) => {
                self.accept_write(tx);
                Response::Ack
            }
            RehashCommand::ClusteredGet(key) => {
                if self.is_uncertain(&key) {
                    Response::Uncertain
                } else {
                    Response::Value(self.local_entry(&key))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::ClusterNode;
    use crate::config::DistributionConfig;
    use crate::hashring::Mapping;
    use crate::member::Address;
    use crate::store::{CacheEntry, DataStore, InMemoryDataStore, WriteCommand};
    use crate::transport::{CommandHandler, LocalNetwork, RehashCommand, Response};
    use crate::txlog::LoggedTransaction;

    fn standalone(members: &[&str]) -> ClusterNode {
        let network = LocalNetwork::new();
        ClusterNode::new(
            DistributionConfig::default(),
            Arc::new(network.transport(Address::from(members[0]))),
            Arc::new(InMemoryDataStore::new()),
            members.iter().map(|m| Address::from(*m)),
        )
        .unwrap()
    }

    #[test]
    fn rejects_invalid_config() {
        let network = LocalNetwork::new();
        let result = ClusterNode::new(
            DistributionConfig::default().with_hash_strategy("nope"),
            Arc::new(network.transport(Address::from("a"))),
            Arc::new(InMemoryDataStore::new()),
            [Address::from("a")],
        );

        assert!(result.is_err());
    }

    #[test]
    fn writes_are_logged_while_rehashing() {
        let node = standalone(&["a"]);
        let from = Address::from("b");
        let tx = LoggedTransaction::single(WriteCommand::put("k", "v"));

        // "a" joins, it owned nothing before
        let old = Arc::new(node.factory().create([from.clone()]).unwrap());
        node.begin_transition(old).unwrap();
        assert_eq!(node.handle(&from, RehashCommand::Write(tx.clone())), Response::Ack);
        assert_eq!(node.store().get("k"), None);
        assert!(node.is_uncertain("k"));
        assert_eq!(
            node.handle(&from, RehashCommand::ClusteredGet("k".to_string())),
            Response::Uncertain
        );

        assert_eq!(node.finish_transition(), 1);
        assert!(!node.is_uncertain("k"));
        assert_eq!(
            node.handle(&from, RehashCommand::ClusteredGet("k".to_string())),
            Response::Value(Some(CacheEntry::new("k", "v", 1)))
        );
    }

    #[tokio::test]
    async fn former_owner_answers_with_logged_writes() {
        let node = standalone(&["a", "b"]);
        let from = Address::from("b");
        let get = || RehashCommand::ClusteredGet("k".to_string());
        node.store().write(&WriteCommand::put("k", "v1"));

        node.begin_transition(node.stable_ring()).unwrap();
        node.handle(
            &from,
            RehashCommand::Write(LoggedTransaction::single(WriteCommand::put("k", "v2"))),
        );

        assert_eq!(node.store().get("k").map(|e| e.value), Some(b"v1".to_vec()));
        assert!(!node.is_uncertain("k"));
        assert_eq!(
            node.handle(&from, get()),
            Response::Value(Some(CacheEntry::new("k", "v2", 2)))
        );
        assert_eq!(node.get("k").await.unwrap(), Some(b"v2".to_vec()));

        node.handle(
            &from,
            RehashCommand::Write(LoggedTransaction::single(WriteCommand::remove("k"))),
        );
        assert_eq!(node.handle(&from, get()), Response::Value(None));

        assert_eq!(node.finish_transition(), 2);
        assert_eq!(node.store().get("k"), None);
    }

    #[test]
    fn leftover_copies_are_not_served() {
        let node = standalone(&["a", "b", "c"]);
        let new_mapping = Arc::new(
            node.factory()
                .create(["a", "b", "c", "d"].map(Address::from))
                .unwrap(),
        );

        // a key "a" does not own, asked for by one of its owners
        let (leftover, requester) = (0..200)
            .map(|n| format!("key-{n}"))
            .filter(|key| !node.is_owner(key))
            .find_map(|key| {
                let requester = ["b", "c"]
                    .map(Address::from)
                    .into_iter()
                    .find(|member| new_mapping.is_owner(member, key.as_str(), 2))?;
                Some((key, requester))
            })
            .unwrap();
        node.store().write(&WriteCommand::put(leftover.as_str(), "old"));

        let reply = node.handle(
            &requester,
            RehashCommand::PullState {
                requester: requester.clone(),
                new_mapping,
            },
        );
        assert_eq!(reply, Response::StateChunk(vec![]));
    }

    #[test]
    fn serves_only_the_requesters_state() {
        let node = standalone(&["a", "b", "c"]);
        for n in 0..50 {
            node.store().write(&WriteCommand::put(format!("key-{n}"), "v"));
        }

        let new_mapping = Arc::new(
            node.factory()
                .create(["a", "b", "c", "d"].map(Address::from))
                .unwrap(),
        );
        let requester = Address::from("d");

        let Response::StateChunk(entries) = node.handle(
            node.address(),
            RehashCommand::PullState {
                requester: requester.clone(),
                new_mapping: new_mapping.clone(),
            },
        ) else {
            panic!("expected a state chunk");
        };

        assert!(!entries.is_empty());
        for entry in &entries {
            assert!(new_mapping.is_owner(&requester, entry.key.as_str(), 2));
            assert!(node.is_owner(entry.key.as_str()));
        }
    }

    #[test]
    fn invalidation_keeps_owned_keys() {
        let node = standalone(&["a", "b"]);
        node.store().write(&WriteCommand::put("k", "v"));

        // with two members and two owners every key is owned by both
        node.handle(
            &Address::from("b"),
            RehashCommand::InvalidateHint(vec!["k".to_string()]),
        );
        assert!(node.store().get("k").is_some());

        let elsewhere = node
            .factory()
            .create(["b", "c"].map(Address::from))
            .unwrap();
        node.install_mapping(Mapping::from(elsewhere));
        node.handle(
            &Address::from("b"),
            RehashCommand::InvalidateHint(vec!["k".to_string()]),
        );
        assert_eq!(node.store().get("k"), None);
    }

    #[test]
    fn mapping_is_withheld_during_a_transition() {
        let node = standalone(&["a", "b"]);
        let requester = Address::from("c");

        let Response::CurrentMapping(Some(current)) = node.handle(
            &requester,
            RehashCommand::GetCurrentMapping {
                requester: requester.clone(),
            },
        ) else {
            panic!("settled mapping expected");
        };

        let next = Arc::new(
            node.factory()
                .create_with(current.iter().cloned(), [requester.clone()])
                .unwrap(),
        );
        node.install_mapping(Mapping::union(current, next));

        assert_eq!(
            node.handle(
                &requester,
                RehashCommand::GetCurrentMapping {
                    requester: requester.clone()
                }
            ),
            Response::CurrentMapping(None)
        );
    }

    #[tokio::test]
    async fn single_member_reads_its_own_writes() {
        let node = standalone(&["a"]);

        node.put("k", "v1").await.unwrap();
        assert_eq!(node.get("k").await.unwrap(), Some(b"v1".to_vec()));

        node.remove("k").await.unwrap();
        assert_eq!(node.get("k").await.unwrap(), None);
    }
}
