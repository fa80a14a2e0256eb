//! The node-local key-value map. Values are kept typed in memory; there is
//! no durability layer underneath.

use std::collections::BTreeMap;

use thiserror::Error;

/// Which copy of a key an entry is. `Reserved` is a request-only marker
/// ("leave the stored role alone") and is never stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaRole {
    Primary,
    Secondary,
    Tertiary,
    Reserved,
}

impl ReplicaRole {
    pub fn code(self) -> u8 {
        match self {
            ReplicaRole::Primary => 0,
            ReplicaRole::Secondary => 1,
            ReplicaRole::Tertiary => 2,
            ReplicaRole::Reserved => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ReplicaRole::Primary),
            1 => Some(ReplicaRole::Secondary),
            2 => Some(ReplicaRole::Tertiary),
            3 => Some(ReplicaRole::Reserved),
            _ => None,
        }
    }

    /// Role of the replica at `index` in a placement triple.
    pub fn of_position(index: usize) -> Self {
        match index {
            0 => ReplicaRole::Primary,
            1 => ReplicaRole::Secondary,
            2 => ReplicaRole::Tertiary,
            _ => unreachable!("replica sets have exactly three positions"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredEntry {
    pub value: String,
    /// Local heartbeat at the time of the write.
    pub timestamp: u64,
    pub role: ReplicaRole,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StoreError {
    #[error("key already exists: {0}")]
    DuplicateKey(String),
    #[error("no such key: {0}")]
    NoSuchKey(String),
    #[error("refusing to store the reserved replica role for key {0}")]
    ReservedRole(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// Ordered so stabilization scans keys the same way on every node.
#[derive(Default)]
pub struct LocalStore {
    entries: BTreeMap<String, StoredEntry>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, key: &str, value: &str, role: ReplicaRole, now: u64) -> Result<()> {
        if role == ReplicaRole::Reserved {
            return Err(StoreError::ReservedRole(key.to_string()));
        }
        if self.entries.contains_key(key) {
            return Err(StoreError::DuplicateKey(key.to_string()));
        }
        self.entries.insert(
            key.to_string(),
            StoredEntry {
                value: value.to_string(),
                timestamp: now,
                role,
            },
        );
        Ok(())
    }

    pub fn read(&self, key: &str) -> Option<&StoredEntry> {
        self.entries.get(key)
    }

    /// Overwrites value and timestamp of an existing entry. The stored role
    /// is kept as-is when the incoming role is `Reserved`.
    pub fn update(&mut self, key: &str, value: &str, role: ReplicaRole, now: u64) -> Result<()> {
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| StoreError::NoSuchKey(key.to_string()))?;
        entry.value = value.to_string();
        entry.timestamp = now;
        if role != ReplicaRole::Reserved {
            entry.role = role;
        }
        Ok(())
    }

    pub fn delete(&mut self, key: &str) -> Result<()> {
        self.entries
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NoSuchKey(key.to_string()))
    }

    /// Rewrites the replica role of an existing entry, refreshing its
    /// timestamp. Used by stabilization when a key's placement moves.
    pub fn assign_role(&mut self, key: &str, role: ReplicaRole, now: u64) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.role = role;
            entry.timestamp = now;
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &StoredEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
