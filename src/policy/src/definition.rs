//! Read-only adapter over a rule's declared scopes and metadata

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::Result;
use crate::store::RuleStore;
use crate::types::{GroupId, Rule, Scope, TargetType};

/// A rule together with its declared scopes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleDefinition {
    pub rule: Rule,
    pub scopes: Vec<Scope>,
}

impl RuleDefinition {
    /// Groups referenced by the rule's group scopes, sorted
    pub fn referenced_groups(&self) -> BTreeSet<GroupId> {
        self.scopes
            .iter()
            .filter(|s| s.target_type == TargetType::Group)
            .map(|s| s.target_id.clone())
            .collect()
    }

    /// Whether the rule is in dynamic mode
    pub fn is_dynamic(&self) -> bool {
        self.rule.is_dynamic()
    }

    /// The stored dynamic expression, if any
    pub fn expression(&self) -> Option<&str> {
        self.rule.metadata.expression.as_deref()
    }
}

/// Loads [`RuleDefinition`]s from a [`RuleStore`]
#[derive(Clone)]
pub struct ScopeStoreAdapter {
    rules: Arc<dyn RuleStore>,
}

impl ScopeStoreAdapter {
    pub fn new(rules: Arc<dyn RuleStore>) -> Self {
        Self { rules }
    }

    /// Load a rule and its scopes; `None` when the rule no longer exists
    pub async fn load(&self, rule_id: &str) -> Result<Option<RuleDefinition>> {
        let Some(rule) = self.rules.get_rule(rule_id).await? else {
            return Ok(None);
        };

        let scopes = self.rules.list_scopes(rule_id).await?;
        Ok(Some(RuleDefinition { rule, scopes }))
    }
}
