use std::collections::HashMap;

use crate::types::{ReplicaRole, StoreError};

/// A value held by this node, tagged with the replica slot it was written
/// under and the transaction id of the write that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    pub value: String,
    pub role: ReplicaRole,
    pub last_trans_id: u64,
}

/// This node's key table. Single-threaded by design: the tick loop runs
/// handlers to completion, so there is no interior locking. Outcome logging
/// happens at the node layer, which knows whether it acts as coordinator.
#[derive(Debug, Default)]
pub struct LocalStore {
    entries: HashMap<String, StoreEntry>,
}

impl LocalStore {
    pub fn new() -> Self {
        LocalStore {
            entries: HashMap::new(),
        }
    }

    /// Inserts a key. An existing key rejects the write with `KeyExists`
    /// unless the incoming transaction id is strictly newer than the held
    /// one; a newer id overwrites. That single rule gives rejoining nodes
    /// with stale data the correct authority ordering and makes
    /// stabilization re-pushes (same id) no-ops.
    pub fn create(
        &mut self,
        key: &str,
        value: String,
        role: ReplicaRole,
        trans_id: u64,
    ) -> Result<(), StoreError> {
        if let Some(held) = self.entries.get(key) {
            if trans_id <= held.last_trans_id {
                return Err(StoreError::KeyExists);
            }
        }
        self.entries.insert(
            key.to_string(),
            StoreEntry {
                value,
                role,
                last_trans_id: trans_id,
            },
        );
        Ok(())
    }

    pub fn read(&self, key: &str) -> Result<&StoreEntry, StoreError> {
        self.entries.get(key).ok_or(StoreError::KeyNotFound)
    }

    pub fn update(
        &mut self,
        key: &str,
        value: String,
        role: ReplicaRole,
        trans_id: u64,
    ) -> Result<(), StoreError> {
        let entry = self
            .entries
            .get_mut(key)
            .ok_or(StoreError::KeyNotFound)?;
        entry.value = value;
        entry.role = role;
        entry.last_trans_id = trans_id;
        Ok(())
    }

    pub fn delete(&mut self, key: &str) -> Result<(), StoreError> {
        self.entries
            .remove(key)
            .map(|_| ())
            .ok_or(StoreError::KeyNotFound)
    }

    /// Retags a held entry with the replica slot this node now occupies.
    pub fn set_role(&mut self, key: &str, role: ReplicaRole) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.role = role;
        }
    }

    pub fn get(&self, key: &str) -> Option<&StoreEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &StoreEntry)> {
        self.entries.iter()
    }

    /// Keys this node holds as PRIMARY, the ones it owes to its successors.
    pub fn primary_entries(&self) -> impl Iterator<Item = (&String, &StoreEntry)> {
        self.entries
            .iter()
            .filter(|(_, e)| e.role == ReplicaRole::Primary)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
