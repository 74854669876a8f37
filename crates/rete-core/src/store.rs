//! # Fact Store
//!
//! The typed fact set shared by every node of a network.
//!
//! This module implements the `FactStore` trait and its in-memory
//! implementation. All data structures use `BTreeMap` for deterministic
//! ordering.

use crate::fact::{Fact, FactId};
use crate::types::ReteError;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// FACTSTORE TRAIT
// =============================================================================

/// The FactStore trait defines the storage boundary of the engine.
///
/// Implementations guarantee read-after-write for a single-threaded caller.
/// Indexing is an implementation detail; the network only relies on the
/// operations below.
pub trait FactStore: fmt::Debug + Send + Sync {
    /// Insert a fact. Fails with `Duplicate` if its internal id is present.
    fn add(&mut self, fact: Arc<Fact>) -> Result<(), ReteError>;

    /// Remove a fact. Fails with `NotFound` if absent.
    fn remove(&mut self, id: &FactId) -> Result<Arc<Fact>, ReteError>;

    /// Lookup a fact by internal id.
    fn get(&self, id: &FactId) -> Option<Arc<Fact>>;

    /// All stored facts, ordered by internal id.
    fn all(&self) -> Vec<Arc<Fact>>;

    /// Number of stored facts.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, id: &FactId) -> bool {
        self.get(id).is_some()
    }

    /// Facts of one type, ordered by user id.
    fn by_type(&self, fact_type: &str) -> Vec<Arc<Fact>> {
        self.all()
            .into_iter()
            .filter(|f| f.fact_type == fact_type)
            .collect()
    }

    /// Remove every fact.
    fn clear(&mut self);

    /// Flush pending writes. A no-op for in-memory stores.
    fn sync(&mut self) -> Result<(), ReteError> {
        Ok(())
    }
}

// =============================================================================
// IN-MEMORY IMPLEMENTATION
// =============================================================================

/// In-memory fact store.
///
/// Keyed by `FactId`, whose ordering is (type, id), so facts of one type are a
/// contiguous range and `by_type` needs no secondary index.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    facts: BTreeMap<FactId, Arc<Fact>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl FactStore for MemoryStore {
    fn add(&mut self, fact: Arc<Fact>) -> Result<(), ReteError> {
        let id = fact.internal_id();
        if self.facts.contains_key(&id) {
            return Err(ReteError::Duplicate(id));
        }
        self.facts.insert(id, fact);
        Ok(())
    }

    fn remove(&mut self, id: &FactId) -> Result<Arc<Fact>, ReteError> {
        self.facts
            .remove(id)
            .ok_or_else(|| ReteError::NotFound(id.clone()))
    }

    fn get(&self, id: &FactId) -> Option<Arc<Fact>> {
        self.facts.get(id).cloned()
    }

    fn all(&self) -> Vec<Arc<Fact>> {
        self.facts.values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.facts.len()
    }

    fn by_type(&self, fact_type: &str) -> Vec<Arc<Fact>> {
        let start = FactId::new(fact_type, String::new());
        self.facts
            .range(start..)
            .take_while(|(id, _)| id.fact_type == fact_type)
            .map(|(_, fact)| Arc::clone(fact))
            .collect()
    }

    fn clear(&mut self) {
        self.facts.clear();
    }
}

// =============================================================================
// TESTS
// =============================================================================
