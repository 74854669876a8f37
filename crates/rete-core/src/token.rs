//! # Tokens and Binding Chains
//!
//! A token is one partial match: the facts joined so far, the variable
//! bindings that name them, and the node that produced it. Binding chains are
//! immutable linked lists, so extending a token shares its whole prefix.

use crate::fact::{Fact, FactId};
use crate::types::{NodeId, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// BINDING CHAIN
// =============================================================================

#[derive(Debug)]
struct Binding {
    variable: String,
    fact: Arc<Fact>,
    parent: Option<Arc<Binding>>,
}

/// Immutable variable-to-fact mapping.
///
/// Each variable appears at most once; `extend` refuses to shadow.
#[derive(Debug, Clone, Default)]
pub struct BindingChain {
    head: Option<Arc<Binding>>,
    len: usize,
}

impl BindingChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn single(variable: impl Into<String>, fact: Arc<Fact>) -> Self {
        Self::new().extended(variable, fact)
    }

    /// New chain with one more binding. Returns `None` if `variable` is bound.
    #[must_use]
    pub fn extend(&self, variable: impl Into<String>, fact: Arc<Fact>) -> Option<Self> {
        let variable = variable.into();
        if self.contains(&variable) {
            return None;
        }
        Some(self.extended(variable, fact))
    }

    fn extended(&self, variable: impl Into<String>, fact: Arc<Fact>) -> Self {
        Self {
            head: Some(Arc::new(Binding {
                variable: variable.into(),
                fact,
                parent: self.head.clone(),
            })),
            len: self.len + 1,
        }
    }

    /// Merge two chains with disjoint variables. Returns `None` on overlap.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Option<Self> {
        let mut merged = self.clone();
        let mut pending: Vec<(&str, &Arc<Fact>)> = other.iter().collect();
        pending.reverse();
        for (variable, fact) in pending {
            merged = merged.extend(variable, Arc::clone(fact))?;
        }
        Some(merged)
    }

    #[must_use]
    pub fn get(&self, variable: &str) -> Option<&Arc<Fact>> {
        self.iter().find(|(v, _)| *v == variable).map(|(_, f)| f)
    }

    #[must_use]
    pub fn contains(&self, variable: &str) -> bool {
        self.get(variable).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bindings from newest to oldest.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<Fact>)> {
        let mut cursor = self.head.as_deref();
        std::iter::from_fn(move || {
            let binding = cursor?;
            cursor = binding.parent.as_deref();
            Some((binding.variable.as_str(), &binding.fact))
        })
    }

    /// Variables in binding order (oldest first).
    #[must_use]
    pub fn variables(&self) -> Vec<String> {
        let mut vars: Vec<String> = self.iter().map(|(v, _)| v.to_string()).collect();
        vars.reverse();
        vars
    }

    #[must_use]
    pub fn references(&self, id: &FactId) -> bool {
        self.iter().any(|(_, f)| f.fact_type == id.fact_type && f.id == id.id)
    }
}

// =============================================================================
// TOKEN
// =============================================================================

/// Identity of a token: its (variable, fact id) pairs ordered by variable.
///
/// Two tokens binding the same facts to different variables are distinct,
/// which matters for self-joins.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TokenKey(pub Vec<(String, FactId)>);

impl TokenKey {
    /// True if every pair of `other` also appears in `self`.
    #[must_use]
    pub fn covers(&self, other: &TokenKey) -> bool {
        other.0.iter().all(|pair| self.0.contains(pair))
    }

    #[must_use]
    pub fn references(&self, id: &FactId) -> bool {
        self.0.iter().any(|(_, f)| f == id)
    }
}

/// A partial match travelling through beta nodes.
#[derive(Debug, Clone)]
pub struct Token {
    /// Facts in join order, one per bound variable.
    pub facts: Vec<Arc<Fact>>,
    pub bindings: BindingChain,
    /// Node that produced this token.
    pub node: NodeId,
    /// Values computed by accumulators, by aggregation variable name.
    pub aggregates: BTreeMap<String, Value>,
}

impl Token {
    /// Token binding a single variable.
    #[must_use]
    pub fn from_fact(variable: impl Into<String>, fact: Arc<Fact>, node: NodeId) -> Self {
        Self {
            facts: vec![Arc::clone(&fact)],
            bindings: BindingChain::single(variable, fact),
            node,
            aggregates: BTreeMap::new(),
        }
    }

    /// Copy of this token extended with one binding, or `None` if the
    /// variable is already bound.
    #[must_use]
    pub fn extend(&self, variable: &str, fact: Arc<Fact>, node: NodeId) -> Option<Self> {
        let bindings = self.bindings.extend(variable, Arc::clone(&fact))?;
        let mut facts = self.facts.clone();
        facts.push(fact);
        Some(Self {
            facts,
            bindings,
            node,
            aggregates: self.aggregates.clone(),
        })
    }

    #[must_use]
    pub fn key(&self) -> TokenKey {
        let mut pairs: Vec<(String, FactId)> = self
            .bindings
            .iter()
            .map(|(v, f)| (v.to_string(), f.internal_id()))
            .collect();
        pairs.sort();
        TokenKey(pairs)
    }

    #[must_use]
    pub fn references(&self, id: &FactId) -> bool {
        self.bindings.references(id)
    }

    #[must_use]
    pub fn fact(&self, variable: &str) -> Option<&Arc<Fact>> {
        self.bindings.get(variable)
    }

    /// Variable name to internal fact id.
    #[must_use]
    pub fn binding_ids(&self) -> BTreeMap<String, FactId> {
        self.bindings
            .iter()
            .map(|(v, f)| (v.to_string(), f.internal_id()))
            .collect()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(t: &str, id: &str) -> Arc<Fact> {
        Arc::new(Fact::new(t, id))
    }

    #[test]
    fn extend_refuses_shadowing() {
        let chain = BindingChain::single("p", fact("Person", "P1"));
        assert!(chain.extend("p", fact("Person", "P2")).is_none());
        let chain = chain.extend("o", fact("Order", "O1")).expect("extend");
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.variables(), vec!["p".to_string(), "o".to_string()]);
    }

    #[test]
    fn extension_shares_prefix() {
        let base = BindingChain::single("u", fact("User", "U1"));
        let a = base.extend("o", fact("Order", "O1")).expect("a");
        let b = base.extend("o", fact("Order", "O2")).expect("b");
        assert_eq!(base.len(), 1);
        assert_eq!(a.get("o").map(|f| f.id.as_str()), Some("O1"));
        assert_eq!(b.get("o").map(|f| f.id.as_str()), Some("O2"));
        assert_eq!(a.get("u").map(|f| f.id.as_str()), Some("U1"));
    }

    #[test]
    fn merge_requires_disjoint_variables() {
        let left = BindingChain::single("a", fact("A", "1"));
        let right = BindingChain::single("b", fact("B", "1"));
        let merged = left.merge(&right).expect("disjoint");
        assert_eq!(merged.variables(), vec!["a".to_string(), "b".to_string()]);
        assert!(left.merge(&left).is_none());
    }

    #[test]
    fn token_key_distinguishes_variable_roles() {
        let p1 = fact("Person", "P1");
        let p2 = fact("Person", "P2");
        let ab = Token::from_fact("a", Arc::clone(&p1), NodeId(1))
            .extend("b", Arc::clone(&p2), NodeId(2))
            .expect("ab");
        let ba = Token::from_fact("a", p2, NodeId(1))
            .extend("b", p1, NodeId(2))
            .expect("ba");
        assert_ne!(ab.key(), ba.key());
        assert!(ab.references(&FactId::new("Person", "P1")));
    }

    #[test]
    fn key_coverage() {
        let t = Token::from_fact("u", fact("User", "U1"), NodeId(1));
        let joined = t.extend("o", fact("Order", "O1"), NodeId(2)).expect("join");
        assert!(joined.key().covers(&t.key()));
        assert!(!t.key().covers(&joined.key()));
    }
}
