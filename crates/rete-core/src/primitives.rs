//! # Engine Primitives
//!
//! Hardcoded runtime constants for the Rete engine.
//!
//! These values are compiled into the binary. Anything a deployment may want
//! to tune is also exposed through a config struct with these as defaults.

use std::time::Duration;

// =============================================================================
// IDENTIFIERS & HASHING
// =============================================================================

/// Separator between type name and user id in a rendered internal fact id.
///
/// `Person~P1` is the internal id of the `Person` fact whose user id is `P1`.
pub const FACT_ID_SEPARATOR: char = '~';

/// Number of digest bytes kept in a condition hash.
///
/// Rendered as lowercase hex, so every hash body is `2 * CONDITION_HASH_BYTES`
/// characters long.
pub const CONDITION_HASH_BYTES: usize = 8;

/// Prefix of alpha-registry hashes.
pub const ALPHA_HASH_PREFIX: &str = "alpha";

/// Prefix of beta-registry hashes.
pub const JOIN_HASH_PREFIX: &str = "join";

/// Prefix of passthrough registry hashes.
pub const PASSTHROUGH_HASH_PREFIX: &str = "passthrough";

/// Prefix of decomposition step result names.
pub const STEP_RESULT_PREFIX: &str = "step";

/// Prefix of generated fact ids when neither an id nor a primary key exists.
pub const DERIVED_ID_PREFIX: &str = "h";

// =============================================================================
// NORMALIZATION LIMITS
// =============================================================================

/// Maximum number of disjuncts produced by DNF expansion.
///
/// A conjunction of disjunctions whose expansion would exceed this bound is
/// kept as written (one predicate inside one alpha node).
pub const MAX_DNF_TERMS: usize = 16;

/// Maximum nesting depth accepted by the decomposer.
///
/// Deeper arithmetic trees are rejected as invalid rules.
pub const MAX_DECOMPOSITION_DEPTH: usize = 64;

// =============================================================================
// PERSISTENCE BARRIER
// =============================================================================

/// Total time the ingestion path waits for submitted facts to become visible.
pub const DEFAULT_SUBMISSION_TIMEOUT: Duration = Duration::from_secs(30);

/// First polling delay of the persistence barrier.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(10);

/// Upper bound of the exponential polling delay.
pub const MAX_BACKOFF: Duration = Duration::from_millis(500);

/// Lower bound for the per-fact share of the submission timeout.
pub const MIN_FACT_TIMEOUT: Duration = Duration::from_secs(1);

// =============================================================================
// ACTION EXECUTOR
// =============================================================================

/// Number of execution records kept by the action executor.
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;
