//! # Action Executor
//!
//! Resolves fired actions to registered handlers.
//!
//! Terminals hand every complete match to the executor. The executor resolves
//! the action arguments against the token, looks the handler up by name and
//! records the firing in a bounded history.
//!
//! An unknown action name is not an error: it is logged and counted.
//!
//! Observers see every recorded firing, whatever the history limit. While
//! muted the executor skips handlers, history and observers; rollbacks use
//! this so restored matches do not run their actions twice.

use crate::expr::Expr;
use crate::expr::eval::evaluate;
use crate::primitives::DEFAULT_HISTORY_LIMIT;
use crate::rule::{Action, ActionArg};
use crate::token::Token;
use crate::types::{ReteError, RuleId};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

// =============================================================================
// HANDLERS
// =============================================================================

/// One resolved action call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionInvocation {
    pub rule: RuleId,
    pub action: String,
    /// Arguments resolved against the token; whole facts render as JSON objects.
    pub args: Vec<serde_json::Value>,
    /// Variable to rendered internal fact id.
    pub bindings: BTreeMap<String, String>,
    pub aggregates: BTreeMap<String, serde_json::Value>,
}

/// A handler for one action name.
pub trait ActionHandler: Send + Sync {
    /// The action name this handler serves.
    fn name(&self) -> &str;

    fn execute(&self, invocation: &ActionInvocation) -> Result<(), ReteError>;
}

/// Adapter turning a closure into a handler.
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&ActionInvocation) -> Result<(), ReteError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> ActionHandler for FnHandler<F>
where
    F: Fn(&ActionInvocation) -> Result<(), ReteError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, invocation: &ActionInvocation) -> Result<(), ReteError> {
        (self.f)(invocation)
    }
}

/// `print(args...)`: the arguments, space separated, at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrintHandler;

impl ActionHandler for PrintHandler {
    fn name(&self) -> &str {
        "print"
    }

    fn execute(&self, invocation: &ActionInvocation) -> Result<(), ReteError> {
        let line: Vec<String> = invocation
            .args
            .iter()
            .map(|a| match a {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        tracing::info!(rule = %invocation.rule, "{}", line.join(" "));
        Ok(())
    }
}

/// `log(args...)`: the full invocation as structured fields, at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogHandler;

impl ActionHandler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    fn execute(&self, invocation: &ActionInvocation) -> Result<(), ReteError> {
        tracing::debug!(
            rule = %invocation.rule,
            args = ?invocation.args,
            bindings = ?invocation.bindings,
            "action fired"
        );
        Ok(())
    }
}

// =============================================================================
// HISTORY
// =============================================================================

/// Outcome of one firing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Executed,
    UnknownAction,
    Failed(String),
}

/// One entry of the execution history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRecord {
    pub sequence: u64,
    #[serde(flatten)]
    pub invocation: ActionInvocation,
    pub status: ExecutionStatus,
}

// =============================================================================
// EXECUTOR
// =============================================================================

/// Callback receiving each firing as it is recorded.
pub type FiringObserver = Arc<dyn Fn(&ExecutionRecord) + Send + Sync>;

/// Handler registry plus firing history.
pub struct ActionExecutor {
    handlers: BTreeMap<String, Arc<dyn ActionHandler>>,
    observers: Vec<FiringObserver>,
    history: VecDeque<ExecutionRecord>,
    history_limit: usize,
    sequence: u64,
    unknown: u64,
    failures: u64,
    muted: bool,
    suppressed: u64,
}

impl fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionExecutor")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("history", &self.history.len())
            .field("observers", &self.observers.len())
            .field("sequence", &self.sequence)
            .field("muted", &self.muted)
            .finish()
    }
}

impl Default for ActionExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionExecutor {
    /// Executor with the built-in `print` and `log` handlers.
    #[must_use]
    pub fn new() -> Self {
        let mut executor = Self::empty(DEFAULT_HISTORY_LIMIT);
        executor.register(Arc::new(PrintHandler));
        executor.register(Arc::new(LogHandler));
        executor
    }

    /// Executor without any handler.
    #[must_use]
    pub fn empty(history_limit: usize) -> Self {
        Self {
            handlers: BTreeMap::new(),
            observers: Vec::new(),
            history: VecDeque::new(),
            history_limit,
            sequence: 0,
            unknown: 0,
            failures: 0,
            muted: false,
            suppressed: 0,
        }
    }

    pub fn set_history_limit(&mut self, limit: usize) {
        self.history_limit = limit;
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }

    /// Register a handler under the name it advertises, returning the one it
    /// replaces.
    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.insert(handler.name().to_string(), handler)
    }

    /// Call `observer` with every firing recorded from now on.
    pub fn subscribe(&mut self, observer: FiringObserver) {
        self.observers.push(observer);
    }

    /// Mute or unmute action execution. Returns the previous setting.
    pub fn set_muted(&mut self, muted: bool) -> bool {
        std::mem::replace(&mut self.muted, muted)
    }

    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Firings skipped while muted.
    #[must_use]
    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }

    #[must_use]
    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    #[must_use]
    pub fn handler_names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    /// Run every call of `action` for a match of `rule`.
    ///
    /// Unknown names are logged and recorded, not raised. A failing handler
    /// is recorded and its error returned after the remaining calls ran.
    pub fn execute(&mut self, rule: &RuleId, action: &Action, token: &Token) -> Result<(), ReteError> {
        if self.muted {
            self.suppressed += 1;
            tracing::debug!(rule = %rule, action = %action.name(), "action muted");
            return Ok(());
        }
        let bindings: BTreeMap<String, String> = token
            .binding_ids()
            .into_iter()
            .map(|(v, id)| (v, id.to_string()))
            .collect();
        let aggregates: BTreeMap<String, serde_json::Value> = token
            .aggregates
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();

        let mut first_error = None;
        for job in &action.jobs {
            let invocation = ActionInvocation {
                rule: rule.clone(),
                action: job.name.clone(),
                args: job.args.iter().map(|a| resolve_arg(a, token)).collect(),
                bindings: bindings.clone(),
                aggregates: aggregates.clone(),
            };
            let status = match self.handlers.get(&job.name) {
                None => {
                    self.unknown += 1;
                    tracing::warn!(rule = %rule, action = %job.name, "unknown action ignored");
                    ExecutionStatus::UnknownAction
                }
                Some(handler) => match handler.execute(&invocation) {
                    Ok(()) => ExecutionStatus::Executed,
                    Err(e) => {
                        self.failures += 1;
                        let reason = e.to_string();
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                        ExecutionStatus::Failed(reason)
                    }
                },
            };
            self.record(invocation, status);
        }
        first_error.map_or(Ok(()), Err)
    }

    fn record(&mut self, invocation: ActionInvocation, status: ExecutionStatus) {
        self.sequence += 1;
        let record = ExecutionRecord {
            sequence: self.sequence,
            invocation,
            status,
        };
        for observer in &self.observers {
            observer(&record);
        }
        if self.history_limit == 0 {
            return;
        }
        while self.history.len() >= self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    /// Retained records, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &ExecutionRecord> {
        self.history.iter()
    }

    /// Retained records of one rule.
    #[must_use]
    pub fn history_for(&self, rule: &RuleId) -> Vec<&ExecutionRecord> {
        self.history.iter().filter(|r| &r.invocation.rule == rule).collect()
    }

    /// Number of calls made since creation, including evicted records.
    #[must_use]
    pub fn total_executions(&self) -> u64 {
        self.sequence
    }

    #[must_use]
    pub fn unknown_actions(&self) -> u64 {
        self.unknown
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }
}

/// Resolve one argument. Unresolvable expressions render as `null`.
fn resolve_arg(arg: &ActionArg, token: &Token) -> serde_json::Value {
    match arg {
        ActionArg::Literal(v) => v.clone(),
        ActionArg::Expr(Expr::Variable { name }) => match token.fact(name) {
            Some(fact) => fact.to_json(),
            None => token
                .aggregates
                .get(name)
                .map(|v| v.to_json())
                .unwrap_or(serde_json::Value::Null),
        },
        ActionArg::Expr(expr) => match evaluate(expr, token) {
            Ok(v) => v.to_json(),
            Err(e) => {
                tracing::debug!(error = %e, "action argument did not resolve");
                serde_json::Value::Null
            }
        },
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::Fact;
    use crate::types::NodeId;
    use std::sync::Mutex;

    fn token() -> Token {
        let fact = Arc::new(Fact::new("Person", "P1").with_field("name", "Ada"));
        Token::from_fact("p", fact, NodeId(1))
    }

    #[test]
    fn builtins_are_registered() {
        let executor = ActionExecutor::new();
        assert!(executor.has_handler("print"));
        assert!(executor.has_handler("log"));
    }

    #[test]
    fn resolves_fields_facts_and_literals() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut executor = ActionExecutor::empty(8);
        executor.register(Arc::new(FnHandler::new("notify", move |inv: &ActionInvocation| {
            sink.lock().expect("lock").push(inv.args.clone());
            Ok(())
        })));

        let action = Action::single(
            "notify",
            vec![
                ActionArg::field("p", "name"),
                ActionArg::variable("p"),
                ActionArg::Literal(serde_json::json!(3)),
            ],
        );
        executor
            .execute(&RuleId::new("r"), &action, &token())
            .expect("execute");

        let calls = seen.lock().expect("lock");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][0], serde_json::json!("Ada"));
        assert_eq!(calls[0][1]["id"], serde_json::json!("P1"));
        assert_eq!(calls[0][2], serde_json::json!(3));
    }

    #[test]
    fn unknown_action_is_recorded_not_raised() {
        let mut executor = ActionExecutor::empty(8);
        let action = Action::single("missing", Vec::new());
        executor
            .execute(&RuleId::new("r"), &action, &token())
            .expect("unknown is not an error");
        assert_eq!(executor.unknown_actions(), 1);
        let record = executor.history().next().expect("record");
        assert_eq!(record.status, ExecutionStatus::UnknownAction);
        assert_eq!(record.invocation.bindings.get("p").map(String::as_str), Some("Person~P1"));
    }

    #[test]
    fn failing_handler_is_surfaced() {
        let mut executor = ActionExecutor::empty(8);
        executor.register(Arc::new(FnHandler::new("boom", |_: &ActionInvocation| {
            Err(ReteError::Action {
                action: "boom".to_string(),
                reason: "nope".to_string(),
            })
        })));
        let result = executor.execute(&RuleId::new("r"), &Action::single("boom", Vec::new()), &token());
        assert!(matches!(result, Err(ReteError::Action { .. })));
        assert_eq!(executor.failures(), 1);
    }

    #[test]
    fn history_is_bounded() {
        let mut executor = ActionExecutor::empty(2);
        let action = Action::single("x", Vec::new());
        for _ in 0..5 {
            executor
                .execute(&RuleId::new("r"), &action, &token())
                .expect("execute");
        }
        assert_eq!(executor.history().count(), 2);
        assert_eq!(executor.total_executions(), 5);
        assert_eq!(executor.history().next().map(|r| r.sequence), Some(4));
    }

    #[test]
    fn observers_see_firings_beyond_the_history() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut executor = ActionExecutor::empty(0);
        executor.subscribe(Arc::new(move |record: &ExecutionRecord| {
            sink.lock().expect("lock").push(record.sequence);
        }));
        let action = Action::single("x", Vec::new());
        for _ in 0..3 {
            executor
                .execute(&RuleId::new("r"), &action, &token())
                .expect("execute");
        }
        assert_eq!(executor.history().count(), 0);
        assert_eq!(*seen.lock().expect("lock"), vec![1, 2, 3]);
    }

    #[test]
    fn muted_executor_skips_everything() {
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        let mut executor = ActionExecutor::empty(8);
        executor.register(Arc::new(FnHandler::new("count", move |_: &ActionInvocation| {
            *counter.lock().expect("lock") += 1;
            Ok(())
        })));
        let action = Action::single("count", Vec::new());

        assert!(!executor.set_muted(true));
        executor
            .execute(&RuleId::new("r"), &action, &token())
            .expect("muted");
        assert!(executor.set_muted(false));
        executor
            .execute(&RuleId::new("r"), &action, &token())
            .expect("execute");

        assert_eq!(*calls.lock().expect("lock"), 1);
        assert_eq!(executor.suppressed(), 1);
        assert_eq!(executor.total_executions(), 1);
    }
}
