//! Error types shared by the hash ring, the transport seam and the rehash protocol.

use thiserror::Error;

use crate::member::Address;
use crate::rehash::RehashPhase;

/// Result type alias for ring construction and configuration.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building rings or resolving configuration.
///
/// Both variants are startup errors: they are reported, never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid or unknown configuration value.
    #[error("config error: {0}")]
    Config(String),

    /// More distinct members than the ring has slots.
    #[error("cannot place {members} members on a ring of {ring_size} slots")]
    RingFull { members: usize, ring_size: u32 },
}

/// Failures reported by a [`crate::transport::ClusterTransport`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No response within the deadline.
    #[error("no response from {0} within the rpc timeout")]
    Timeout(Address),

    /// The target is not part of the current view.
    #[error("{0} is unreachable")]
    Unreachable(Address),

    /// The target answered, but not with what was asked for.
    #[error("{from} rejected the command: {reason}")]
    Rejected { from: Address, reason: String },

    /// A broadcast that required every ack did not get them.
    #[error("broadcast missing acks from {0:?}")]
    MissingAcks(Vec<Address>),
}

/// Errors that end a rehash attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RehashError {
    /// Another rehash is already running on this node.
    #[error("a rehash is already in progress on this node")]
    AlreadyInProgress,

    /// The overall deadline elapsed. The membership change may be retried.
    #[error("rehash timed out during {phase:?}")]
    Timeout { phase: RehashPhase },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The member to remove is not part of the accepted mapping.
    #[error("{0} is not a member of the accepted mapping")]
    NotAMember(Address),

    #[error(transparent)]
    Config(#[from] Error),
}

impl RehashError {
    /// Whether the membership change can simply be attempted again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RehashError::Timeout { .. }
                | RehashError::Transport(_)
                | RehashError::AlreadyInProgress
        )
    }
}
