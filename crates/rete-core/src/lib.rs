//! # rete-core
//!
//! A forward-chaining rule engine built on the RETE algorithm.
//!
//! Facts flow from a root node through per-type nodes, alpha filters and
//! beta joins down to one terminal per rule. Every node keeps the partial
//! matches it has seen, so each new fact is matched incrementally instead of
//! re-evaluating every rule against every fact.
//!
//! ## Layout
//!
//! | Module | Role |
//! |--------|------|
//! | `types`, `fact`, `token`, `memory` | data model |
//! | `expr` | condition AST, canonical form, evaluation, decomposition |
//! | `node` | node kinds and the activation protocol |
//! | `builder` | rule definition to subnetwork |
//! | `registry`, `lifecycle` | node sharing and reference counting |
//! | `network` | the engine: propagation and public operations |
//! | `transaction` | reversible commands |
//! | `orchestrator` | program ingestion |
//!
//! ## Constraints
//!
//! - Deterministic: ordered maps only, propagation depth-first in child
//!   insertion order
//! - Synchronous: no async, no network dependencies
//! - No panics: every fallible operation returns `Result<T, ReteError>`

// =============================================================================
// MODULES
// =============================================================================

pub mod action;
pub mod builder;
pub mod expr;
pub mod fact;
pub mod lifecycle;
pub mod memory;
pub mod metrics;
pub mod network;
pub mod node;
pub mod orchestrator;
pub mod primitives;
pub mod registry;
pub mod rule;
pub mod store;
pub mod token;
pub mod transaction;
pub mod types;

// =============================================================================
// RE-EXPORTS: Data Model
// =============================================================================

pub use fact::{Fact, FactId, FieldDefinition, FieldType, TypeDefinition};
pub use memory::WorkingMemory;
pub use token::{BindingChain, Token, TokenKey};
pub use types::{CommandPhase, NodeId, ReteError, RuleId, TransactionId, Value};

// =============================================================================
// RE-EXPORTS: Conditions and Rules
// =============================================================================

pub use expr::canonical::{canonical_string, condition_hash, normalize, split_conditions};
pub use expr::{AggregateFunction, BinaryOp, Expr, LogicalOp};
pub use rule::{Action, ActionArg, Pattern, Program, RuleDefinition, VariableDecl};

// =============================================================================
// RE-EXPORTS: Engine
// =============================================================================

pub use action::{
    ActionExecutor, ActionHandler, ActionInvocation, ExecutionRecord, ExecutionStatus, FiringObserver,
    FnHandler,
};
pub use builder::{BuildReport, RuleBuilder, RuleShape};
pub use lifecycle::LifecycleManager;
pub use metrics::{NetworkMetrics, NetworkStats};
pub use network::Network;
pub use node::{Node, NodeKind, NodeType};
pub use orchestrator::{IngestionReport, Orchestrator, SubmissionConfig};
pub use registry::SharingRegistry;
pub use store::{FactStore, MemoryStore};
pub use transaction::{Command, Transaction, TransactionState};
