//! # Working Memory
//!
//! Per-node storage of the facts and tokens that reached a node.

use crate::fact::{Fact, FactId};
use crate::token::{Token, TokenKey};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Facts and partial-match tokens held by one node.
///
/// Type and alpha nodes use the fact side; beta and terminal nodes use the
/// token side for the tokens they emitted or received.
#[derive(Debug, Clone, Default)]
pub struct WorkingMemory {
    facts: BTreeMap<FactId, Arc<Fact>>,
    tokens: BTreeMap<TokenKey, Token>,
}

impl WorkingMemory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a fact. Returns `false` if it was already present.
    pub fn add_fact(&mut self, fact: Arc<Fact>) -> bool {
        let id = fact.internal_id();
        if self.facts.contains_key(&id) {
            return false;
        }
        self.facts.insert(id, fact);
        true
    }

    pub fn remove_fact(&mut self, id: &FactId) -> Option<Arc<Fact>> {
        self.facts.remove(id)
    }

    #[must_use]
    pub fn contains_fact(&self, id: &FactId) -> bool {
        self.facts.contains_key(id)
    }

    pub fn facts(&self) -> impl Iterator<Item = &Arc<Fact>> {
        self.facts.values()
    }

    #[must_use]
    pub fn fact_count(&self) -> usize {
        self.facts.len()
    }

    /// Store a token, returning the one it replaced.
    pub fn add_token(&mut self, token: Token) -> Option<Token> {
        self.tokens.insert(token.key(), token)
    }

    pub fn remove_token(&mut self, key: &TokenKey) -> Option<Token> {
        self.tokens.remove(key)
    }

    #[must_use]
    pub fn token(&self, key: &TokenKey) -> Option<&Token> {
        self.tokens.get(key)
    }

    /// Remove and return every token binding `id`.
    pub fn remove_tokens_referencing(&mut self, id: &FactId) -> Vec<Token> {
        let keys: Vec<TokenKey> = self
            .tokens
            .keys()
            .filter(|k| k.references(id))
            .cloned()
            .collect();
        keys.iter().filter_map(|k| self.tokens.remove(k)).collect()
    }

    /// Remove and return every token whose key covers `key`.
    pub fn remove_tokens_covering(&mut self, key: &TokenKey) -> Vec<Token> {
        let keys: Vec<TokenKey> = self
            .tokens
            .keys()
            .filter(|k| k.covers(key))
            .cloned()
            .collect();
        keys.iter().filter_map(|k| self.tokens.remove(k)).collect()
    }

    pub fn tokens(&self) -> impl Iterator<Item = &Token> {
        self.tokens.values()
    }

    #[must_use]
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty() && self.tokens.is_empty()
    }

    pub fn clear(&mut self) {
        self.facts.clear();
        self.tokens.clear();
    }
}
