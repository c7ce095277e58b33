//! Commands exchanged during a rehash and the transport seam they travel
//! through.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

#[cfg(feature = "derive")]
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::hashring::{ConsistentHash, Mapping};
use crate::member::Address;
use crate::store::CacheEntry;
use crate::txlog::LoggedTransaction;

pub mod local;

pub use local::{LocalNetwork, LocalTransport};

/// Everything one member can ask of another.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "derive", derive(Serialize, Deserialize))]
pub enum RehashCommand {
    /// Ask the coordinator for the settled mapping.
    GetCurrentMapping { requester: Address },

    /// Replace the receiver's accepted mapping.
    InstallMapping(Mapping<Address>),

    /// Ask for every local entry `requester` owns under `new_mapping`.
    PullState {
        requester: Address,
        new_mapping: Arc<ConsistentHash<Address>>,
    },

    /// Entries the receiver now co-owns.
    PushState(Vec<CacheEntry>),

    /// Keys the receiver may hold but no longer owns.
    InvalidateHint(Vec<String>),

    JoinComplete(Address),

    /// A client write routed to one of the key's owners.
    Write(LoggedTransaction),

    /// Read a key from one of its owners.
    ClusteredGet(String),
}

impl RehashCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            RehashCommand::GetCurrentMapping { .. } => CommandKind::GetCurrentMapping,
            RehashCommand::InstallMapping(_) => CommandKind::InstallMapping,
            RehashCommand::PullState { .. } => CommandKind::PullState,
            RehashCommand::PushState(_) => CommandKind::PushState,
            RehashCommand::InvalidateHint(_) => CommandKind::InvalidateHint,
            RehashCommand::JoinComplete(_) => CommandKind::JoinComplete,
            RehashCommand::Write(_) => CommandKind::Write,
            RehashCommand::ClusteredGet(_) => CommandKind::ClusteredGet,
        }
    }
}

/// Payload-free tag of a [`RehashCommand`], used to target fault injection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandKind {
    GetCurrentMapping,
    InstallMapping,
    PullState,
    PushState,
    InvalidateHint,
    JoinComplete,
    Write,
    ClusteredGet,
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "derive", derive(Serialize, Deserialize))]
pub enum Response {
    /// The settled mapping, `None` while the responder is mid-rehash.
    CurrentMapping(Option<Arc<ConsistentHash<Address>>>),
    StateChunk(Vec<CacheEntry>),
    Value(Option<CacheEntry>),
    /// The responder cannot vouch for its copy right now; ask another owner.
    Uncertain,
    Ack,
    Unsuccessful(String),
}

/// Receives commands delivered to a member.
pub trait CommandHandler: Send + Sync + Debug {
    fn handle(&self, from: &Address, command: RehashCommand) -> Response;
}

/// Point-to-point and broadcast RPC between members.
#[async_trait]
pub trait ClusterTransport: Send + Sync + Debug {
    fn local_address(&self) -> &Address;

    /// Member that answers [`RehashCommand::GetCurrentMapping`].
    fn coordinator(&self) -> Option<Address>;

    /// Current view of the cluster, the local member included.
    fn members(&self) -> Vec<Address>;

    /// Send `command` to every target and wait for each reply or `timeout`.
    /// Replies come back in `targets` order.
    async fn send_sync(
        &self,
        targets: &[Address],
        command: RehashCommand,
        timeout: Duration,
    ) -> Vec<(Address, Result<Response, TransportError>)>;

    /// Send `command` to every other member.
    ///
    /// Failed members are logged and left out of the result, unless
    /// `require_all_acks` is set, in which case any failure is an error.
    async fn broadcast_sync(
        &self,
        command: RehashCommand,
        timeout: Duration,
        require_all_acks: bool,
    ) -> Result<Vec<(Address, Response)>, TransportError> {
        let local = self.local_address().clone();
        let targets: Vec<Address> = self
            .members()
            .into_iter()
            .filter(|member| *member != local)
            .collect();

        let kind = command.kind();
        let mut responses = Vec::with_capacity(targets.len());
        let mut missing = vec![];

        for (target, reply) in self.send_sync(&targets, command, timeout).await {
            match reply {
                Ok(Response::Unsuccessful(reason)) => {
                    warn!(%target, ?kind, %reason, "broadcast rejected");
                    missing.push(target);
                }
                Ok(response) => responses.push((target, response)),
                Err(error) => {
                    warn!(%target, ?kind, %error, "broadcast not delivered");
                    missing.push(target);
                }
            }
        }

        if !missing.is_empty() {
            if require_all_acks {
                return Err(TransportError::MissingAcks(missing));
            }
            warn!(?kind, missing = missing.len(), "broadcast partially failed");
        }

        Ok(responses)
    }
}
