//! # Transactions
//!
//! Reversible mutation through a command log.
//!
//! A transaction records every command it executes. Rollback undoes the log
//! in reverse; commit simply drops it. No snapshot of the network is taken,
//! so the overhead is proportional to the number of recorded commands.
//!
//! ## State Machine
//!
//! ```text
//! Active --commit--> Committed
//!    \
//!     --rollback--> RolledBack
//! ```
//!
//! Both terminal states reject every further operation with `InvalidState`.
//! A rollback whose undo fails keeps the transaction `Active` with the
//! failing command still on the log, so the caller may retry.

use crate::fact::{Fact, FactId, TypeDefinition};
use crate::network::Network;
use crate::rule::RuleDefinition;
use crate::types::{CommandPhase, ReteError, RuleId, TransactionId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

// =============================================================================
// STATE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
        })
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

/// A reversible mutation of a network.
///
/// `undo` must reverse exactly what `execute` did and nothing else. Commands
/// record whatever they need for that during `execute`.
pub trait Command: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn execute(&mut self, network: &mut Network) -> Result<(), ReteError>;

    fn undo(&mut self, network: &mut Network) -> Result<(), ReteError>;
}

/// Insert a fact and propagate it.
#[derive(Debug)]
pub struct AddFact {
    pub fact: Arc<Fact>,
    stored: bool,
}

impl AddFact {
    #[must_use]
    pub fn new(fact: Arc<Fact>) -> Self {
        Self {
            fact,
            stored: false,
        }
    }
}

impl Command for AddFact {
    fn name(&self) -> &'static str {
        "add_fact"
    }

    fn execute(&mut self, network: &mut Network) -> Result<(), ReteError> {
        network.apply_insert(Arc::clone(&self.fact))?;
        self.stored = true;
        Ok(())
    }

    fn undo(&mut self, network: &mut Network) -> Result<(), ReteError> {
        if self.stored {
            network.apply_retract(&self.fact.internal_id())?;
            self.stored = false;
        }
        Ok(())
    }
}

/// Retract a fact, keeping it for undo.
#[derive(Debug)]
pub struct RemoveFact {
    pub id: FactId,
    removed: Option<Arc<Fact>>,
}

impl RemoveFact {
    #[must_use]
    pub fn new(id: FactId) -> Self {
        Self { id, removed: None }
    }
}

impl Command for RemoveFact {
    fn name(&self) -> &'static str {
        "remove_fact"
    }

    fn execute(&mut self, network: &mut Network) -> Result<(), ReteError> {
        self.removed = Some(network.apply_retract(&self.id)?);
        Ok(())
    }

    fn undo(&mut self, network: &mut Network) -> Result<(), ReteError> {
        if let Some(fact) = self.removed.take() {
            network.apply_insert(fact)?;
        }
        Ok(())
    }
}

/// Declare a type. Undo removes the Type node only if this command created it.
#[derive(Debug)]
pub struct AddType {
    pub definition: TypeDefinition,
    created: bool,
}

impl AddType {
    #[must_use]
    pub fn new(definition: TypeDefinition) -> Self {
        Self {
            definition,
            created: false,
        }
    }
}

impl Command for AddType {
    fn name(&self) -> &'static str {
        "add_type"
    }

    fn execute(&mut self, network: &mut Network) -> Result<(), ReteError> {
        let (_, created) = network.apply_add_type(self.definition.clone())?;
        self.created = created;
        Ok(())
    }

    fn undo(&mut self, network: &mut Network) -> Result<(), ReteError> {
        if self.created {
            network.apply_remove_type(&self.definition.name)?;
            self.created = false;
        }
        Ok(())
    }
}

/// Build a rule subnetwork.
#[derive(Debug)]
pub struct AddRule {
    pub definition: RuleDefinition,
    built: bool,
}

impl AddRule {
    #[must_use]
    pub fn new(definition: RuleDefinition) -> Self {
        Self {
            definition,
            built: false,
        }
    }
}

impl Command for AddRule {
    fn name(&self) -> &'static str {
        "add_rule"
    }

    fn execute(&mut self, network: &mut Network) -> Result<(), ReteError> {
        network.apply_add_rule(self.definition.clone())?;
        self.built = true;
        Ok(())
    }

    fn undo(&mut self, network: &mut Network) -> Result<(), ReteError> {
        if self.built {
            network.apply_remove_rule(&self.definition.rule_id)?;
            self.built = false;
        }
        Ok(())
    }
}

/// Remove a rule, keeping its definition for undo.
///
/// Undo rebuilds the rule and replays current facts into it. Rollback mutes
/// actions meanwhile, so restored matches do not fire again.
#[derive(Debug)]
pub struct RemoveRule {
    pub rule_id: RuleId,
    removed: Option<RuleDefinition>,
}

impl RemoveRule {
    #[must_use]
    pub fn new(rule_id: RuleId) -> Self {
        Self {
            rule_id,
            removed: None,
        }
    }
}

impl Command for RemoveRule {
    fn name(&self) -> &'static str {
        "remove_rule"
    }

    fn execute(&mut self, network: &mut Network) -> Result<(), ReteError> {
        self.removed = Some(network.apply_remove_rule(&self.rule_id)?);
        Ok(())
    }

    fn undo(&mut self, network: &mut Network) -> Result<(), ReteError> {
        if let Some(definition) = self.removed.take() {
            network.apply_add_rule(definition)?;
        }
        Ok(())
    }
}

// =============================================================================
// TRANSACTION
// =============================================================================

/// Command log of one transaction.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    state: TransactionState,
    log: Vec<Box<dyn Command>>,
}

impl Transaction {
    #[must_use]
    pub fn new(id: TransactionId) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            log: Vec::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Number of recorded commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.log.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Names of the recorded commands, oldest first.
    #[must_use]
    pub fn command_names(&self) -> Vec<&'static str> {
        self.log.iter().map(|c| c.name()).collect()
    }

    fn ensure_active(&self, operation: &str) -> Result<(), ReteError> {
        match self.state {
            TransactionState::Active => Ok(()),
            state => Err(ReteError::InvalidState(format!(
                "cannot {operation} transaction {}: already {state}",
                self.id
            ))),
        }
    }

    /// Execute `command` and log it.
    ///
    /// A failed command is not logged. Whatever part of it did take effect is
    /// undone on a best-effort basis.
    pub fn record_and_execute(
        &mut self,
        mut command: Box<dyn Command>,
        network: &mut Network,
    ) -> Result<(), ReteError> {
        self.ensure_active("execute in")?;
        match command.execute(network) {
            Ok(()) => {
                debug!(transaction = %self.id, command = command.name(), position = self.log.len(), "command recorded");
                self.log.push(command);
                Ok(())
            }
            Err(e) => {
                if let Err(undo) = command.undo(network) {
                    warn!(transaction = %self.id, command = command.name(), error = %undo, "cleanup after failed command failed");
                }
                Err(ReteError::Command {
                    command: command.name().to_string(),
                    phase: CommandPhase::Execute,
                    position: self.log.len(),
                    source: Box::new(e),
                })
            }
        }
    }

    /// Drop the log and become `Committed`.
    pub fn commit(&mut self) -> Result<(), ReteError> {
        self.ensure_active("commit")?;
        self.log.clear();
        self.state = TransactionState::Committed;
        Ok(())
    }

    /// Undo the log in reverse and become `RolledBack`.
    ///
    /// Actions are muted while undoing: matches an undo restores do not run
    /// their actions again.
    pub fn rollback(&mut self, network: &mut Network) -> Result<(), ReteError> {
        self.ensure_active("roll back")?;
        let muted = network.executor_mut().set_muted(true);
        let result = self.undo_log(network);
        network.executor_mut().set_muted(muted);
        result?;
        self.state = TransactionState::RolledBack;
        Ok(())
    }

    fn undo_log(&mut self, network: &mut Network) -> Result<(), ReteError> {
        while let Some(mut command) = self.log.pop() {
            let position = self.log.len();
            if let Err(e) = command.undo(network) {
                let name = command.name().to_string();
                self.log.push(command);
                return Err(ReteError::Command {
                    command: name,
                    phase: CommandPhase::Undo,
                    position,
                    source: Box::new(e),
                });
            }
        }
        Ok(())
    }
}
