use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{RehashCoordinator, RehashPhase, RehashState, invalidate};
use crate::error::{Error, RehashError, TransportError};
use crate::hashring::sources::gained_owners;
use crate::hashring::{ConsistentHash, Mapping};
use crate::member::Address;
use crate::store::CacheEntry;
use crate::transport::{RehashCommand, Response};

impl RehashCoordinator {
    pub(super) async fn run_leave(
        &self,
        leaver: Address,
        old: Arc<ConsistentHash<Address>>,
    ) -> Result<Arc<ConsistentHash<Address>>, RehashError> {
        let node = &self.node;
        let local = node.address().clone();
        let deadline = self.deadline();

        self.set_phase(RehashPhase::FetchOldMapping);
        if leaver == local {
            return Err(Error::Config(format!("{local} cannot rehash its own departure")).into());
        }
        if !old.contains(&leaver) {
            return Err(RehashError::NotAMember(leaver));
        }

        self.set_phase(RehashPhase::BuildUnion);
        let remaining = node
            .factory()
            .remove_member(&Mapping::Single(Arc::clone(&old)), &leaver)?;
        let new = Arc::clone(remaining.target());
        info!(node = %local, %leaver, members = new.len(), "member left");

        if !node.config().rehash_enabled {
            info!(node = %local, "rehash disabled");
            return self.direct_swap(new).await;
        }

        let union = node.factory().union_of(Arc::clone(&old), Arc::clone(&new));
        self.record_state(RehashState {
            local,
            old: Arc::clone(&old),
            new: Arc::clone(&new),
            union: union.clone(),
        });

        node.begin_transition(Arc::clone(&old))?;

        if let Err(cause) = self.transfer_from_survivor(union, &old, &new, deadline).await {
            self.abort(old).await;
            return Err(cause);
        }

        self.set_phase(RehashPhase::BroadcastFinal);
        self.broadcast_mapping(Mapping::Single(Arc::clone(&new))).await;

        let dropped = invalidate::drop_unowned(node, &new);
        if dropped > 0 {
            debug!(node = %node.address(), dropped, "dropped copies no longer owned");
        }
        self.spawn_invalidation(old, Arc::clone(&new));

        Ok(new)
    }

    async fn transfer_from_survivor(
        &self,
        union: Mapping<Address>,
        old: &ConsistentHash<Address>,
        new: &ConsistentHash<Address>,
        deadline: Instant,
    ) -> Result<(), RehashError> {
        self.set_phase(RehashPhase::BroadcastUnion);
        self.broadcast_mapping(union).await;

        self.set_phase(RehashPhase::PullState);
        let pushed = self.push_state(old, new, deadline).await?;
        debug!(node = %self.node.address(), pushed, "state pushed to new owners");

        // pushed entries are applied by their receivers
        self.set_phase(RehashPhase::ApplyState);

        self.set_phase(RehashPhase::DrainLog);
        let node = &self.node;
        let replayed = node.finish_transition();
        debug!(node = %node.address(), replayed, "write log replayed");

        Ok(())
    }

    /// Send every entry this node owned under `old` to the members that own
    /// it under `new` but did not under `old`. Targets are served in
    /// parallel.
    async fn push_state(
        &self,
        old: &ConsistentHash<Address>,
        new: &ConsistentHash<Address>,
        deadline: Instant,
    ) -> Result<usize, RehashError> {
        let local = self.node.address();
        let owners = self.node.config().num_owners;
        let mut per_target: BTreeMap<Address, Vec<CacheEntry>> = BTreeMap::new();

        let held = self
            .node
            .store()
            .read_all_matching(&|key| old.is_owner(local, key, owners));

        for entry in held {
            for target in gained_owners(old, new, entry.key.as_str(), owners) {
                if target != *local {
                    per_target.entry(target).or_default().push(entry.clone());
                }
            }
        }

        let pushes = per_target
            .iter()
            .map(|(target, entries)| self.push_to(target, entries, deadline));

        let mut pushed = 0;
        for result in join_all(pushes).await {
            pushed += result?;
        }

        Ok(pushed)
    }

    async fn push_to(
        &self,
        target: &Address,
        entries: &[CacheEntry],
        deadline: Instant,
    ) -> Result<usize, RehashError> {
        let transport = self.node.transport();
        let timeout = self.rpc_timeout();

        self.retry_until(RehashPhase::PullState, deadline, || {
            let command = RehashCommand::PushState(entries.to_vec());

            async move {
                let replies = transport
                    .send_sync(std::slice::from_ref(target), command, timeout)
                    .await;

                match replies.into_iter().next() {
                    Some((_, Ok(Response::Ack))) => Ok(entries.len()),
                    Some((from, Ok(other))) => {
                        warn!(%from, ?other, "state push rejected");
                        Err(TransportError::Rejected {
                            from,
                            reason: format!("{other:?}"),
                        }
                        .into())
                    }
                    Some((_, Err(cause))) => Err(cause.into()),
                    None => Err(TransportError::Unreachable(target.clone()).into()),
                }
            }
        })
        .await
    }
}
