// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{binary_search::partition_point, Error, NodeId, Result, UserKey};

/// One route entry, mapping an edge key to a node
///
/// The entry is addressed by its node id; a node owns at most one entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteEntry {
    edge_key: UserKey,
    node_id: NodeId,
}

impl RouteEntry {
    /// Returns the edge key.
    #[must_use]
    pub fn edge_key(&self) -> &UserKey {
        &self.edge_key
    }

    /// Returns the node id.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }
}

/// Key-to-node routing table
///
/// Entries are kept sorted by edge key. A lookup resolves to the first
/// entry whose edge key is greater than or equal to the lookup key; keys
/// beyond every edge resolve to the last entry, so the last node catches
/// the tail of the keyspace.
#[derive(Debug, Default)]
pub struct RouteMap {
    entries: Vec<RouteEntry>,
}

impl RouteMap {
    /// Creates an empty route map sized for the given fanout.
    #[must_use]
    pub fn with_capacity(fanout: usize) -> Self {
        Self {
            entries: Vec::with_capacity(fanout),
        }
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the map holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves a key to exactly one node.
    #[must_use]
    pub fn lookup(&self, key: &[u8]) -> Option<NodeId> {
        let idx = partition_point(&self.entries, |e| &*e.edge_key < key);

        self.entries
            .get(idx)
            .or_else(|| self.entries.last())
            .map(|e| e.node_id)
    }

    /// Inserts an entry.
    ///
    /// # Errors
    ///
    /// Returns `Bug` if the edge key is already present.
    pub fn insert(&mut self, edge_key: UserKey, node_id: NodeId) -> Result<()> {
        let idx = partition_point(&self.entries, |e| e.edge_key < edge_key);

        if self
            .entries
            .get(idx)
            .is_some_and(|e| e.edge_key == edge_key)
        {
            return Err(Error::Bug("duplicate route edge key"));
        }

        self.entries.insert(idx, RouteEntry { edge_key, node_id });
        Ok(())
    }

    /// Removes the entry of a node.
    pub fn remove(&mut self, node_id: NodeId) -> Option<RouteEntry> {
        let idx = self.position(node_id)?;
        Some(self.entries.remove(idx))
    }

    /// Replaces a node's edge key, keeping the map sorted.
    ///
    /// # Errors
    ///
    /// Returns `Bug` if the node has no entry or the new key collides.
    pub fn key_modify(&mut self, node_id: NodeId, new_key: UserKey) -> Result<()> {
        let Some(idx) = self.position(node_id) else {
            return Err(Error::Bug("route entry missing for node"));
        };

        self.entries.remove(idx);
        self.insert(new_key, node_id)
    }

    /// Returns `true` if the node owns the last (catch-all) entry.
    #[must_use]
    pub fn is_last(&self, node_id: NodeId) -> bool {
        self.entries.last().is_some_and(|e| e.node_id == node_id)
    }

    /// Returns a node's edge key.
    #[must_use]
    pub fn edge_key(&self, node_id: NodeId) -> Option<&UserKey> {
        self.position(node_id)
            .and_then(|idx| self.entries.get(idx))
            .map(RouteEntry::edge_key)
    }

    /// Iterates the entries in edge-key order.
    pub fn iter(&self) -> impl Iterator<Item = &RouteEntry> {
        self.entries.iter()
    }

    fn position(&self, node_id: NodeId) -> Option<usize> {
        self.entries.iter().position(|e| e.node_id == node_id)
    }
}
