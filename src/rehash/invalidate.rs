//! Cleanup of copies left behind on members that lost ownership.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::hashring::ConsistentHash;
use crate::hashring::sources::stale_owners;
use crate::member::Address;
use crate::node::ClusterNode;
use crate::transport::RehashCommand;

/// Tell every member that owned one of our keys under `old`, but no longer
/// does under `new`, which keys it may drop. Best effort: undelivered hints
/// are logged and skipped. Returns the number of hinted keys.
pub(super) async fn hint_stale_owners(
    node: &ClusterNode,
    old: &ConsistentHash<Address>,
    new: &ConsistentHash<Address>,
) -> usize {
    let local = node.address();
    let owners = node.config().num_owners;
    let mut hints: BTreeMap<Address, Vec<String>> = BTreeMap::new();

    for key in node.store().keys() {
        for stale in stale_owners(old, new, key.as_str(), owners) {
            // departed members are not told anything
            if stale != *local && new.contains(&stale) {
                hints.entry(stale).or_default().push(key.clone());
            }
        }
    }

    let mut hinted = 0;

    for (target, keys) in hints {
        let count = keys.len();
        let replies = node
            .transport()
            .send_sync(
                std::slice::from_ref(&target),
                RehashCommand::InvalidateHint(keys),
                node.config().rehash_rpc_timeout,
            )
            .await;

        for (target, reply) in replies {
            match reply {
                Ok(_) => hinted += count,
                Err(cause) => warn!(%target, %cause, "invalidation hint not delivered"),
            }
        }
    }

    debug!(node = %local, hinted, "stale owners hinted");
    hinted
}

/// Remove local entries this node does not own under `new`.
pub(super) fn drop_unowned(node: &ClusterNode, new: &ConsistentHash<Address>) -> usize {
    let local = node.address();
    let owners = node.config().num_owners;

    node.store()
        .keys()
        .into_iter()
        .filter(|key| !new.is_owner(local, key.as_str(), owners))
        .filter(|key| node.store().remove_if_present(key).is_some())
        .count()
}
