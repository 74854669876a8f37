//! # Sharing Registries
//!
//! Content-addressed reuse of nodes.
//!
//! A registry maps a condition hash to the node built for it, together with
//! the canonical string that produced the hash and the set of rules that own
//! the entry. The refcount of an entry is the number of distinct owning rules.
//!
//! The network keeps three registries: alpha nodes, beta nodes (joins) and
//! passthrough alphas. All three are plain per-network fields.

use crate::types::{NodeId, ReteError, RuleId};
use std::collections::{BTreeMap, BTreeSet};

/// One registered node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub node: NodeId,
    pub canonical: String,
    pub rules: BTreeSet<RuleId>,
    /// Nodes built together with this one that a reusing rule must also own
    /// (the passthrough inputs of a join).
    pub upstream: Vec<NodeId>,
}

impl RegistryEntry {
    #[must_use]
    pub fn refcount(&self) -> usize {
        self.rules.len()
    }
}

/// Outcome of [`SharingRegistry::get_or_create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    pub node: NodeId,
    pub hash: String,
    /// True if the node already existed.
    pub was_shared: bool,
}

/// Hash-keyed, refcounted node registry.
#[derive(Debug, Clone, Default)]
pub struct SharingRegistry {
    entries: BTreeMap<String, RegistryEntry>,
    by_node: BTreeMap<NodeId, String>,
}

impl SharingRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the node registered under `hash`, or build one with `create`.
    ///
    /// Either way `rule` owns the entry afterwards. A different canonical
    /// string under the same hash is a `RegistryConflict`; nothing changes in
    /// that case, and nothing changes if `create` fails.
    pub fn get_or_create<F>(
        &mut self,
        hash: &str,
        canonical: &str,
        rule: &RuleId,
        create: F,
    ) -> Result<Lookup, ReteError>
    where
        F: FnOnce() -> Result<NodeId, ReteError>,
    {
        if let Some(entry) = self.entries.get_mut(hash) {
            if entry.canonical != canonical {
                return Err(ReteError::RegistryConflict {
                    hash: hash.to_string(),
                    reason: format!("registered {} but requested {canonical}", entry.canonical),
                });
            }
            entry.rules.insert(rule.clone());
            return Ok(Lookup {
                node: entry.node,
                hash: hash.to_string(),
                was_shared: true,
            });
        }

        let node = create()?;
        self.entries.insert(
            hash.to_string(),
            RegistryEntry {
                node,
                canonical: canonical.to_string(),
                rules: BTreeSet::from([rule.clone()]),
                upstream: Vec::new(),
            },
        );
        self.by_node.insert(node, hash.to_string());
        Ok(Lookup {
            node,
            hash: hash.to_string(),
            was_shared: false,
        })
    }

    /// Record the upstream nodes of an entry.
    pub fn set_upstream(&mut self, hash: &str, upstream: Vec<NodeId>) {
        if let Some(entry) = self.entries.get_mut(hash) {
            entry.upstream = upstream;
        }
    }

    /// Add an owning rule. Returns the new refcount.
    pub fn add_ref(&mut self, hash: &str, rule: &RuleId) -> Result<usize, ReteError> {
        let entry = self
            .entries
            .get_mut(hash)
            .ok_or_else(|| ReteError::RegistryConflict {
                hash: hash.to_string(),
                reason: "no such entry".to_string(),
            })?;
        entry.rules.insert(rule.clone());
        Ok(entry.refcount())
    }

    /// Drop an owning rule. Returns the new refcount; an unknown hash is 0.
    ///
    /// The entry itself stays until [`unregister`](Self::unregister).
    pub fn release(&mut self, hash: &str, rule: &RuleId) -> usize {
        match self.entries.get_mut(hash) {
            Some(entry) => {
                entry.rules.remove(rule);
                entry.refcount()
            }
            None => 0,
        }
    }

    /// Remove an entry from both indices.
    pub fn unregister(&mut self, hash: &str) -> Option<RegistryEntry> {
        let entry = self.entries.remove(hash)?;
        self.by_node.remove(&entry.node);
        Some(entry)
    }

    /// Remove the entry of a node, if it has one.
    pub fn unregister_node(&mut self, node: NodeId) -> Option<RegistryEntry> {
        let hash = self.by_node.get(&node)?.clone();
        self.unregister(&hash)
    }

    #[must_use]
    pub fn get(&self, hash: &str) -> Option<&RegistryEntry> {
        self.entries.get(hash)
    }

    #[must_use]
    pub fn hash_of(&self, node: NodeId) -> Option<&str> {
        self.by_node.get(&node).map(String::as_str)
    }

    #[must_use]
    pub fn refcount(&self, hash: &str) -> usize {
        self.entries.get(hash).map_or(0, RegistryEntry::refcount)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &RegistryEntry)> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_node.clear();
    }
}
