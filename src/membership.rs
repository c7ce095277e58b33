//! The mapping a node currently accepts.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::hashring::Mapping;
use crate::member::Address;

/// A mapping together with the local install counter it was accepted at.
#[derive(Clone, Debug, PartialEq)]
pub struct VersionedMapping {
    pub version: u64,
    pub mapping: Mapping<Address>,
}

/// Holds the node's accepted mapping.
///
/// Readers get a cheap snapshot; installs swap the whole value, so a reader
/// never sees half of a change.
#[derive(Debug)]
pub struct MembershipState {
    current: RwLock<Arc<VersionedMapping>>,
}

impl MembershipState {
    pub fn new(mapping: Mapping<Address>) -> Self {
        MembershipState {
            current: RwLock::new(Arc::new(VersionedMapping {
                version: 0,
                mapping,
            })),
        }
    }

    pub fn current(&self) -> Arc<VersionedMapping> {
        Arc::clone(&self.current.read())
    }

    pub fn mapping(&self) -> Mapping<Address> {
        self.current.read().mapping.clone()
    }

    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    /// Replace the accepted mapping and return the new version.
    pub fn install(&self, mapping: Mapping<Address>) -> u64 {
        let mut current = self.current.write();
        let version = current.version + 1;

        debug!(
            version,
            union = mapping.is_union(),
            members = mapping.target().len(),
            "installed mapping"
        );

        *current = Arc::new(VersionedMapping { version, mapping });
        version
    }
}
