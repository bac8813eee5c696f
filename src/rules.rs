//! Reactive rule engine (spec.md §4.5).
//!
//! A rule matches a node's type/predicate and runs an action through a
//! context exposing a suppressed-broadcast `put` and an ordinary `get`.
//! Orchestration shape is grounded on the teacher's `PolicyEngine`
//! (`policy/engine.rs`): a registry of named entries evaluated in order
//! against an incoming record, each producing side effects through a
//! narrow capability object rather than touching shared state directly.

use crate::error::CoreResult;
use crate::record::{DataMap, NodeRecord};

/// Capabilities exposed to a rule's action. Implemented by `facade::Database`
/// via its suppressed-broadcast put path (`Database::apply_put` with
/// `suppress_rules = true`) so actions can't recurse into the rule engine.
pub trait RuleContext {
    fn put(&self, id: &str, data: DataMap) -> CoreResult<()>;
    fn get(&self, id: &str) -> CoreResult<Option<NodeRecord>>;
}

/// A rule: name, optional type selector, predicate, and action.
pub struct Rule {
    pub name: String,
    pub type_selector: Option<String>,
    pub predicate: Box<dyn Fn(&NodeRecord) -> bool + Send + Sync>,
    pub action: Box<dyn Fn(&NodeRecord, &dyn RuleContext) + Send + Sync>,
}

impl Rule {
    pub fn new(
        name: impl Into<String>,
        type_selector: Option<String>,
        predicate: impl Fn(&NodeRecord) -> bool + Send + Sync + 'static,
        action: impl Fn(&NodeRecord, &dyn RuleContext) + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            type_selector,
            predicate: Box::new(predicate),
            action: Box::new(action),
        }
    }

    fn matches(&self, record: &NodeRecord) -> bool {
        if let Some(ref selector) = self.type_selector {
            if record.node_type.as_deref() != Some(selector.as_str()) {
                return false;
            }
        }
        (self.predicate)(record)
    }
}

/// Registry of rules, evaluated sequentially in registration order (spec.md
/// §4.5). `addRule` overwrites a prior rule with the same name.
#[derive(Default)]
pub struct RuleEngine {
    rules: Vec<Rule>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, rule: Rule) {
        self.rules.retain(|r| r.name != rule.name);
        self.rules.push(rule);
    }

    pub fn remove_rule(&mut self, name: &str) {
        self.rules.retain(|r| r.name != name);
    }

    /// Run every matching rule's action against `record`. Errors from one
    /// action are logged and do not abort remaining rules (spec.md §7).
    pub fn evaluate(&self, record: &NodeRecord, ctx: &dyn RuleContext) {
        for rule in &self.rules {
            if rule.matches(record) {
                tracing::debug!(rule = %rule.name, id = %record.id, "rule matched, running action");
                (rule.action)(record, ctx);
            }
        }
    }
}
