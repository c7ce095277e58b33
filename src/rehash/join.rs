use std::sync::Arc;

use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{RehashCoordinator, RehashPhase, RehashState};
use crate::error::{RehashError, TransportError};
use crate::hashring::{ConsistentHash, Mapping};
use crate::member::Address;
use crate::store::CacheEntry;
use crate::transport::{RehashCommand, Response};

impl RehashCoordinator {
    pub(super) async fn run_join(&self) -> Result<Arc<ConsistentHash<Address>>, RehashError> {
        let node = &self.node;
        let local = node.address().clone();
        let deadline = self.deadline();

        self.set_phase(RehashPhase::FetchOldMapping);
        let old = self.fetch_old_mapping(deadline).await?;
        info!(node = %local, members = old.len(), "fetched cluster mapping");

        self.set_phase(RehashPhase::BuildUnion);
        let new = Arc::new(
            node.factory()
                .create_with(old.iter().cloned(), [local.clone()])?,
        );

        if *new == *old {
            info!(node = %local, "already a member, nothing to move");
            return self.direct_swap(new).await;
        }
        if !node.config().rehash_enabled {
            info!(node = %local, "rehash disabled");
            return self.direct_swap(new).await;
        }

        let union = node.factory().union_of(Arc::clone(&old), Arc::clone(&new));
        self.record_state(RehashState {
            local: local.clone(),
            old: Arc::clone(&old),
            new: Arc::clone(&new),
            union: union.clone(),
        });

        node.begin_transition(Arc::clone(&old))?;

        if let Err(cause) = self.transfer_to_joiner(union, &new, deadline).await {
            self.abort(old).await;
            return Err(cause);
        }

        self.set_phase(RehashPhase::BroadcastFinal);
        self.broadcast_mapping(Mapping::Single(Arc::clone(&new))).await;
        self.announce_join_complete().await;

        self.spawn_invalidation(old, Arc::clone(&new));

        Ok(new)
    }

    // Everything between enabling the log and the final broadcast; an error
    // here rolls the change back.
    async fn transfer_to_joiner(
        &self,
        union: Mapping<Address>,
        new: &Arc<ConsistentHash<Address>>,
        deadline: Instant,
    ) -> Result<(), RehashError> {
        self.set_phase(RehashPhase::BroadcastUnion);
        self.broadcast_mapping(union).await;

        self.set_phase(RehashPhase::PullState);
        let chunks = self.pull_state(new, deadline).await?;

        self.set_phase(RehashPhase::ApplyState);
        let applied = self.apply_state(chunks, new);
        debug!(node = %self.node.address(), applied, "state applied");

        self.set_phase(RehashPhase::DrainLog);
        let node = &self.node;
        let replayed = node.finish_transition();
        debug!(node = %node.address(), replayed, "write log replayed");

        Ok(())
    }

    async fn fetch_old_mapping(
        &self,
        deadline: Instant,
    ) -> Result<Arc<ConsistentHash<Address>>, RehashError> {
        let transport = self.node.transport();
        let local = self.node.address();

        let Some(coordinator) = transport.coordinator() else {
            return Err(TransportError::Unreachable(local.clone()).into());
        };
        let coordinator = &coordinator;
        let timeout = self.rpc_timeout();

        self.retry_until(RehashPhase::FetchOldMapping, deadline, || async move {
            let replies = transport
                .send_sync(
                    std::slice::from_ref(coordinator),
                    RehashCommand::GetCurrentMapping {
                        requester: local.clone(),
                    },
                    timeout,
                )
                .await;

            match replies.into_iter().next() {
                Some((_, Ok(Response::CurrentMapping(Some(mapping))))) => Ok(mapping),
                Some((from, Ok(Response::CurrentMapping(None)))) => {
                    debug!(%from, "coordinator is itself rehashing");
                    Err(RehashError::AlreadyInProgress)
                }
                Some((from, Ok(other))) => Err(TransportError::Rejected {
                    from,
                    reason: format!("{other:?}"),
                }
                .into()),
                Some((_, Err(cause))) => Err(cause.into()),
                None => Err(TransportError::Unreachable(coordinator.clone()).into()),
            }
        })
        .await
    }

    /// Pull from every provider in parallel. Chunks come back sorted by
    /// source address, the order they are applied in.
    async fn pull_state(
        &self,
        new: &Arc<ConsistentHash<Address>>,
        deadline: Instant,
    ) -> Result<Vec<(Address, Vec<CacheEntry>)>, RehashError> {
        let sources = new.state_providers(self.node.address(), self.node.config().num_owners);
        debug!(node = %self.node.address(), ?sources, "pulling state");

        let pulls = sources
            .iter()
            .map(|source| self.pull_from(source, new, deadline));
        let results = join_all(pulls).await;

        let mut chunks = sources
            .into_iter()
            .zip(results)
            .map(|(source, result)| result.map(|entries| (source, entries)))
            .collect::<Result<Vec<_>, _>>()?;
        chunks.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(chunks)
    }

    async fn pull_from(
        &self,
        source: &Address,
        new: &Arc<ConsistentHash<Address>>,
        deadline: Instant,
    ) -> Result<Vec<CacheEntry>, RehashError> {
        let transport = self.node.transport();
        let requester = self.node.address();
        let timeout = self.rpc_timeout();

        self.retry_until(RehashPhase::PullState, deadline, || {
            let command = RehashCommand::PullState {
                requester: requester.clone(),
                new_mapping: Arc::clone(new),
            };

            async move {
                let replies = transport
                    .send_sync(std::slice::from_ref(source), command, timeout)
                    .await;

                match replies.into_iter().next() {
                    Some((_, Ok(Response::StateChunk(entries)))) => Ok(entries),
                    Some((from, Ok(other))) => {
                        warn!(%from, ?other, "discarding a reply that carries no state");
                        Ok(vec![])
                    }
                    Some((_, Err(cause))) => Err(cause.into()),
                    None => Err(TransportError::Unreachable(source.clone()).into()),
                }
            }
        })
        .await
    }

    // Merge chunks in order. Entries this node does not own under `new` are
    // dropped.
    fn apply_state(
        &self,
        chunks: Vec<(Address, Vec<CacheEntry>)>,
        new: &ConsistentHash<Address>,
    ) -> usize {
        let local = self.node.address();
        let owners = self.node.config().num_owners;
        let mut applied = 0;

        for (source, entries) in chunks {
            let received = entries.len();
            let (owned, foreign): (Vec<_>, Vec<_>) = entries
                .into_iter()
                .partition(|entry| new.is_owner(local, entry.key.as_str(), owners));

            if !foreign.is_empty() {
                warn!(%source, dropped = foreign.len(), "dropping entries not owned by this node");
            }

            let taken = self.node.store().apply_entries(owned);
            debug!(%source, received, taken, "applied state chunk");
            applied += taken;
        }

        applied
    }

    async fn announce_join_complete(&self) {
        let transport = self.node.transport();
        let local = self.node.address();

        let Some(coordinator) = transport.coordinator() else {
            return;
        };
        if coordinator == *local {
            return;
        }

        let replies = transport
            .send_sync(
                std::slice::from_ref(&coordinator),
                RehashCommand::JoinComplete(local.clone()),
                self.rpc_timeout(),
            )
            .await;

        for (target, reply) in replies {
            if let Err(cause) = reply {
                warn!(%target, %cause, "join completion not delivered");
            }
        }
    }
}
