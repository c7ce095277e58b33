//! Local key/value storage seen by the rehash protocol.
//!
//! The protocol only needs to read entries by ownership, merge transferred
//! entries, apply replayed writes and drop stale copies. [`InMemoryDataStore`]
//! is the storage used by nodes in this crate; any other backend can be
//! plugged in through [`DataStore`].

use std::collections::BTreeMap;
use std::fmt::Debug;

use parking_lot::RwLock;

#[cfg(feature = "derive")]
use serde::{Deserialize, Serialize};

/// A stored value with its per-key version.
///
/// The version is a logical counter bumped by the owner on every write of
/// the key. It decides which copy survives when transferred state overlaps.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "derive", derive(Serialize, Deserialize))]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub version: u64,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>, version: u64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            version,
        }
    }
}

/// A single write as issued by a client.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "derive", derive(Serialize, Deserialize))]
pub enum WriteCommand {
    Put { key: String, value: Vec<u8> },
    Remove { key: String },
}

impl WriteCommand {
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        WriteCommand::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn remove(key: impl Into<String>) -> Self {
        WriteCommand::Remove { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            WriteCommand::Put { key, .. } | WriteCommand::Remove { key } => key,
        }
    }
}

/// Storage a node keeps its owned entries in.
pub trait DataStore: Send + Sync + Debug {
    fn get(&self, key: &str) -> Option<CacheEntry>;

    /// Every entry whose key satisfies `predicate`.
    fn read_all_matching(&self, predicate: &dyn Fn(&str) -> bool) -> Vec<CacheEntry>;

    /// Merge transferred entries. An incoming entry replaces the stored one
    /// only if its version is strictly higher, and is refused if the key was
    /// removed at the same or a later version. Returns how many were taken.
    fn apply_entries(&self, entries: Vec<CacheEntry>) -> usize;

    /// Apply a client write, bumping the key's version. Versions keep counting
    /// across a remove.
    fn write(&self, command: &WriteCommand);

    /// Drop the local copy of `key`. Unlike a client remove this leaves no
    /// trace: the key may be transferred back later.
    fn remove_if_present(&self, key: &str) -> Option<CacheEntry>;

    fn keys(&self) -> Vec<String>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Thread-safe in-memory storage.
///
/// Keys are kept in a `BTreeMap` so that state chunks and key scans come out
/// in a stable order. A client remove leaves the key's last version behind,
/// so that a later put continues counting from it and older copies of the
/// removed value are refused by [`DataStore::apply_entries`].
#[derive(Debug, Default)]
pub struct InMemoryDataStore {
    data: RwLock<Entries>,
}

#[derive(Debug, Default)]
struct Entries {
    live: BTreeMap<String, CacheEntry>,
    removed: BTreeMap<String, u64>,
}

impl Entries {
    fn version_of(&self, key: &str) -> Option<u64> {
        self.live
            .get(key)
            .map(|entry| entry.version)
            .or_else(|| self.removed.get(key).copied())
    }
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Version a client remove left for `key`, if it is currently removed.
    pub fn removed_version(&self, key: &str) -> Option<u64> {
        self.data.read().removed.get(key).copied()
    }
}

impl DataStore for InMemoryDataStore {
    fn get(&self, key: &str) -> Option<CacheEntry> {
        self.data.read().live.get(key).cloned()
    }

    fn read_all_matching(&self, predicate: &dyn Fn(&str) -> bool) -> Vec<CacheEntry> {
        self.data
            .read()
            .live
            .values()
            .filter(|entry| predicate(&entry.key))
            .cloned()
            .collect()
    }

    fn apply_entries(&self, entries: Vec<CacheEntry>) -> usize {
        let mut data = self.data.write();
        let mut applied = 0;

        for entry in entries {
            let newer = data
                .version_of(&entry.key)
                .is_none_or(|existing| entry.version > existing);

            if newer {
                data.removed.remove(&entry.key);
                data.live.insert(entry.key.clone(), entry);
                applied += 1;
            }
        }

        applied
    }

    fn write(&self, command: &WriteCommand) {
        let mut data = self.data.write();

        match command {
            WriteCommand::Put { key, value } => {
                let version = data.version_of(key).map_or(1, |existing| existing + 1);
                data.removed.remove(key);
                data.live
                    .insert(key.clone(), CacheEntry::new(key.clone(), value.clone(), version));
            }
            WriteCommand::Remove { key } => {
                if let Some(entry) = data.live.remove(key) {
                    data.removed.insert(key.clone(), entry.version);
                }
            }
        }
    }

    fn remove_if_present(&self, key: &str) -> Option<CacheEntry> {
        self.data.write().live.remove(key)
    }

    fn keys(&self) -> Vec<String> {
        self.data.read().live.keys().cloned().collect()
    }

    fn len(&self) -> usize {
        self.data.read().live.len()
    }
}
