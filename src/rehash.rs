//! Moves a cluster from one mapping to the next without losing writes.
//!
//! A [`RehashCoordinator`] drives a single membership change on one node:
//! a member joining (run by the joiner) or a member gone (run by every
//! survivor). Both go through the same phases:
//!
//! 1. settle on the old ring and derive the new one,
//! 2. route through the union of both while state moves and the joiner logs
//!    incoming writes,
//! 3. replay the log, switch everyone to the new ring and tell former owners
//!    to drop what they no longer own.
//!
//! Any failure once the write log is enabled restores the old ring.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[cfg(feature = "derive")]
use serde::{Deserialize, Serialize};

use crate::error::RehashError;
use crate::hashring::{ConsistentHash, Mapping};
use crate::member::Address;
use crate::node::ClusterNode;
use crate::transport::RehashCommand;

mod invalidate;
mod join;
mod leave;

/// Where a rehash currently stands. `Done` and `Failed` are final.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "derive", derive(Serialize, Deserialize))]
pub enum RehashPhase {
    #[default]
    Idle,
    FetchOldMapping,
    BuildUnion,
    BroadcastUnion,
    PullState,
    ApplyState,
    DrainLog,
    BroadcastFinal,
    InvalidateStale,
    Done,
    Failed,
}

impl RehashPhase {
    pub fn is_final(&self) -> bool {
        matches!(self, RehashPhase::Done | RehashPhase::Failed)
    }
}

/// The membership change a coordinator carries out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MembershipChange {
    /// The local member joins the cluster.
    Join,
    /// `leaver` left; the old ring is the one accepted when the change was
    /// observed.
    Leave {
        leaver: Address,
        old: Arc<ConsistentHash<Address>>,
    },
}

/// The rings a rehash moves between.
#[derive(Clone, Debug, PartialEq)]
pub struct RehashState {
    pub local: Address,
    pub old: Arc<ConsistentHash<Address>>,
    pub new: Arc<ConsistentHash<Address>>,
    pub union: Mapping<Address>,
}

/// Drives one membership change on one node.
#[derive(Debug)]
pub struct RehashCoordinator {
    node: Arc<ClusterNode>,
    change: MembershipChange,
    phase: watch::Sender<RehashPhase>,
    state: Mutex<Option<RehashState>>,
    invalidation: Mutex<Option<JoinHandle<usize>>>,
}

impl RehashCoordinator {
    fn new(node: Arc<ClusterNode>, change: MembershipChange) -> Self {
        let (phase, _) = watch::channel(RehashPhase::Idle);

        RehashCoordinator {
            node,
            change,
            phase,
            state: Mutex::new(None),
            invalidation: Mutex::new(None),
        }
    }

    /// Coordinator for `node` joining the cluster.
    pub fn join(node: Arc<ClusterNode>) -> Self {
        Self::new(node, MembershipChange::Join)
    }

    /// Coordinator for a survivor after `leaver` left.
    ///
    /// The old ring is captured now, so that mappings installed by other
    /// survivors in the meantime do not change what this node moves from.
    pub fn leave(node: Arc<ClusterNode>, leaver: Address) -> Self {
        let old = node.stable_ring();

        Self::new(node, MembershipChange::Leave { leaver, old })
    }

    pub fn node(&self) -> &Arc<ClusterNode> {
        &self.node
    }

    pub fn change(&self) -> &MembershipChange {
        &self.change
    }

    pub fn phase(&self) -> RehashPhase {
        *self.phase.borrow()
    }

    /// Receiver notified on every phase change.
    pub fn subscribe(&self) -> watch::Receiver<RehashPhase> {
        self.phase.subscribe()
    }

    /// Old, new and union mapping once they have been built.
    pub fn state(&self) -> Option<RehashState> {
        self.state.lock().clone()
    }

    /// Run the membership change to completion and return the new ring.
    ///
    /// Only one rehash runs on a node at a time; a second attempt fails with
    /// [`RehashError::AlreadyInProgress`].
    pub async fn run(&self) -> Result<Arc<ConsistentHash<Address>>, RehashError> {
        let Ok(_running) = self.node.rehash_lock().try_lock() else {
            warn!(node = %self.node.address(), "rehash already running");
            return Err(RehashError::AlreadyInProgress);
        };

        info!(node = %self.node.address(), change = self.change_name(), "rehash started");

        let result = match &self.change {
            MembershipChange::Join => self.run_join().await,
            MembershipChange::Leave { leaver, old } => {
                self.run_leave(leaver.clone(), Arc::clone(old)).await
            }
        };

        match &result {
            Ok(new) => {
                self.set_phase(RehashPhase::Done);
                info!(node = %self.node.address(), members = new.len(), "rehash done");
            }
            Err(cause) => {
                self.set_phase(RehashPhase::Failed);
                error!(
                    node = %self.node.address(),
                    %cause,
                    retryable = cause.is_retryable(),
                    "rehash failed"
                );
            }
        }

        result
    }

    /// Wait for the background invalidation started by a successful rehash.
    /// Returns the number of hinted keys, 0 if none was started.
    pub async fn wait_for_invalidation(&self) -> usize {
        let handle = self.invalidation.lock().take();

        match handle {
            Some(handle) => match handle.await {
                Ok(hinted) => hinted,
                Err(cause) => {
                    warn!(%cause, "invalidation task did not finish");
                    0
                }
            },
            None => 0,
        }
    }

    fn change_name(&self) -> &'static str {
        match self.change {
            MembershipChange::Join => "join",
            MembershipChange::Leave { .. } => "leave",
        }
    }

    fn set_phase(&self, phase: RehashPhase) {
        let previous = self.phase.send_replace(phase);
        debug!(node = %self.node.address(), from = ?previous, to = ?phase, "rehash phase");
    }

    fn record_state(&self, state: RehashState) {
        *self.state.lock() = Some(state);
    }

    fn rpc_timeout(&self) -> Duration {
        self.node.config().rehash_rpc_timeout
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.node.config().deadline()
    }

    fn backoff(&self) -> Duration {
        let config = self.node.config();
        let min = config.rehash_retry_min.as_millis() as u64;
        let max = config.rehash_retry_max.as_millis() as u64;

        Duration::from_millis(rand::rng().random_range(min..=max))
    }

    /// Run `attempt` until it succeeds, sleeping a random backoff between
    /// tries. Gives up with a timeout for `phase` once `deadline` is reached.
    async fn retry_until<T, F, Fut>(
        &self,
        phase: RehashPhase,
        deadline: Instant,
        mut attempt: F,
    ) -> Result<T, RehashError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RehashError>>,
    {
        let mut tries = 0_u32;

        loop {
            tries += 1;

            match tokio::time::timeout_at(deadline, attempt()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(cause)) => {
                    warn!(node = %self.node.address(), ?phase, tries, %cause, "rehash step failed");
                }
                Err(_) => {
                    warn!(node = %self.node.address(), ?phase, tries, "rehash step hit the deadline");
                    return Err(RehashError::Timeout { phase });
                }
            }

            let wait = self.backoff();
            if Instant::now() + wait >= deadline {
                warn!(node = %self.node.address(), ?phase, tries, "giving up before the deadline");
                return Err(RehashError::Timeout { phase });
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Install `mapping` everywhere, best effort.
    async fn broadcast_mapping(&self, mapping: Mapping<Address>) {
        self.node.install_mapping(mapping.clone());

        let acks = self
            .node
            .transport()
            .broadcast_sync(
                RehashCommand::InstallMapping(mapping),
                self.rpc_timeout(),
                false,
            )
            .await;

        match acks {
            Ok(acks) => debug!(acks = acks.len(), "mapping broadcast"),
            Err(cause) => warn!(%cause, "mapping broadcast failed"),
        }
    }

    /// Undo a rehash that failed after the write log was enabled: discard the
    /// log and put the old ring back on every reachable member.
    async fn abort(&self, old: Arc<ConsistentHash<Address>>) {
        let dropped = self.node.abort_transition();
        warn!(node = %self.node.address(), dropped, "aborting rehash, restoring old mapping");

        self.broadcast_mapping(Mapping::Single(old)).await;
    }

    /// Swap straight to `new` without moving any state.
    async fn direct_swap(
        &self,
        new: Arc<ConsistentHash<Address>>,
    ) -> Result<Arc<ConsistentHash<Address>>, RehashError> {
        debug!(node = %self.node.address(), "swapping mapping");

        self.set_phase(RehashPhase::BroadcastFinal);
        self.broadcast_mapping(Mapping::Single(Arc::clone(&new))).await;
        Ok(new)
    }

    /// Spawn the hinting of stale copies and remember the task.
    fn spawn_invalidation(
        &self,
        old: Arc<ConsistentHash<Address>>,
        new: Arc<ConsistentHash<Address>>,
    ) {
        if !self.node.config().invalidate_stale {
            return;
        }

        self.set_phase(RehashPhase::InvalidateStale);

        let node = Arc::clone(&self.node);
        let handle = tokio::spawn(async move { invalidate::hint_stale_owners(&node, &old, &new).await });
        *self.invalidation.lock() = Some(handle);
    }
}
