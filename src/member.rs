use std::fmt::Display;

#[cfg(feature = "derive")]
use serde::{Deserialize, Serialize};

/// Identifier of a cluster member.
///
/// Addresses are opaque and immutable. They order lexicographically, which
/// only serves as a tie-break: the ring order of members comes from their
/// hashed position, not from this ordering.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "derive", derive(Serialize, Deserialize))]
pub struct Address(String);

impl Address {
    pub fn new(name: impl Into<String>) -> Self {
        Address(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(name: &str) -> Self {
        Address::new(name)
    }
}
