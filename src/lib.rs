//! Key distribution for a clustered in-memory key/value store.
//!
//! Members are placed on a fixed ring of [`RING_SIZE`] slots. A key is owned
//! by the member at the first slot at or after the key's slot and by the
//! members following it, so adding or removing a member only moves the keys
//! next to it.
//!
//! When membership changes, a [`RehashCoordinator`] moves the cluster from
//! the old ring to the new one:
//!
//! - while state moves, every member routes through the union of both rings
//!   (old owners first), so reads keep finding a member that holds the key,
//! - writes reach old and new owners; the joining member logs them in its
//!   [`TransactionLogger`] and replays them once the pulled state is applied,
//! - when the new ring is installed everywhere, members that lost a key are
//!   told to drop it.
//!
//! Members talk through the [`ClusterTransport`] seam. [`LocalNetwork`] runs
//! a whole cluster in-process, with fault injection for the retry paths.
//!
//! ```
//! use hashring_rehash::{ConsistentHashFactory, Mapping, OwnerLookup};
//!
//! let factory = ConsistentHashFactory::default();
//! let ring = factory.create(["10.0.0.1", "10.0.0.2", "10.0.0.3"]).unwrap();
//! let owners = ring.locate("user:42", 2);
//! assert_eq!(owners.len(), 2);
//!
//! // without the second owner, the key moves to the next member on the ring
//! let shrunk = factory
//!     .remove_member(&Mapping::from(ring.clone()), &owners[1])
//!     .unwrap();
//! assert!(!shrunk.locate("user:42", 2).contains(&owners[1]));
//! assert_eq!(shrunk.locate("user:42", 2)[0], owners[0]);
//! ```

pub mod config;
pub mod error;
pub mod factory;
pub mod hashring;
pub mod member;
pub mod membership;
pub mod node;
pub mod rehash;
pub mod store;
pub mod transport;
pub mod txlog;

pub use config::DistributionConfig;
pub use error::{Error, RehashError, Result, TransportError};
pub use factory::ConsistentHashFactory;
pub use hashring::{
    ConsistentHash, HashStrategy, Mapping, OwnerLookup, RING_SIZE, UnionConsistentHash,
};
pub use member::Address;
pub use membership::{MembershipState, VersionedMapping};
pub use node::ClusterNode;
pub use rehash::{MembershipChange, RehashCoordinator, RehashPhase, RehashState};
pub use store::{CacheEntry, DataStore, InMemoryDataStore, WriteCommand};
pub use transport::{
    ClusterTransport, CommandHandler, CommandKind, LocalNetwork, LocalTransport, RehashCommand,
    Response,
};
pub use txlog::{LoggedTransaction, LoggerState, TransactionLogger};
