//! Rule and scope writes with recompilation hooks
//!
//! Every successful write schedules a background recompilation of the
//! affected rule and returns without waiting for it. Definition-time checks
//! run before persistence and block the write; recompilation never does.

use std::sync::Arc;
use tracing::info;

use crate::cel::ExpressionValidator;
use crate::error::{PolicyError, Result};
use crate::guard::{check_rule_definition, check_rule_update, check_scope};
use crate::scheduler::{RecompilationScheduler, TriggerKind};
use crate::store::{RuleRepository, RuleStore};
use crate::types::{Rule, Scope};

/// Write path for rules and scopes
#[derive(Clone)]
pub struct PolicyService {
    repository: Arc<dyn RuleRepository>,
    validator: Arc<ExpressionValidator>,
    scheduler: RecompilationScheduler,
}

impl PolicyService {
    pub fn new(
        repository: Arc<dyn RuleRepository>,
        validator: Arc<ExpressionValidator>,
        scheduler: RecompilationScheduler,
    ) -> Self {
        Self {
            repository,
            validator,
            scheduler,
        }
    }

    pub fn scheduler(&self) -> &RecompilationScheduler {
        &self.scheduler
    }

    /// Validate a dynamic expression without storing anything
    pub fn validate_expression(&self, expr: &str) -> Result<()> {
        self.validator.validate(expr)?;
        Ok(())
    }

    pub async fn create_rule(&self, rule: Rule) -> Result<Rule> {
        check_rule_definition(&self.validator, &rule)?;

        if self
            .repository
            .find_rule_by_identifier(&rule.identifier)
            .await?
            .is_some()
        {
            return Err(PolicyError::DuplicateIdentifier(rule.identifier));
        }

        self.repository.insert_rule(rule.clone()).await?;
        info!("Created rule {} for {}", rule.id, rule.identifier);

        self.scheduler.schedule_with(&rule.id, TriggerKind::RuleChanged);
        Ok(rule)
    }

    pub async fn update_rule(&self, rule: Rule) -> Result<Rule> {
        let current = self
            .repository
            .get_rule(&rule.id)
            .await?
            .ok_or_else(|| PolicyError::RuleNotFound(rule.id.clone()))?;
        let scopes = self.repository.list_scopes(&rule.id).await?;

        check_rule_update(&self.validator, &current, &rule, &scopes)?;

        if let Some(other) = self.repository.find_rule_by_identifier(&rule.identifier).await? {
            if other.id != rule.id {
                return Err(PolicyError::DuplicateIdentifier(rule.identifier));
            }
        }

        self.repository.update_rule(rule.clone()).await?;

        let kind = if current.enabled && !rule.enabled {
            TriggerKind::RuleDisabled
        } else {
            TriggerKind::RuleChanged
        };
        info!("Updated rule {} ({:?})", rule.id, kind);

        self.scheduler.schedule_with(&rule.id, kind);
        Ok(rule)
    }

    pub async fn delete_rule(&self, rule_id: &str) -> Result<()> {
        if !self.repository.delete_rule(rule_id).await? {
            return Err(PolicyError::RuleNotFound(rule_id.to_string()));
        }
        info!("Deleted rule {}", rule_id);

        self.scheduler.schedule_with(rule_id, TriggerKind::RuleDeleted);
        Ok(())
    }

    pub async fn add_scope(&self, scope: Scope) -> Result<Scope> {
        let rule = self
            .repository
            .get_rule(&scope.rule_id)
            .await?
            .ok_or_else(|| PolicyError::RuleNotFound(scope.rule_id.clone()))?;
        let existing = self.repository.list_scopes(&rule.id).await?;

        check_scope(&rule, &existing, &scope)?;
        self.repository.insert_scope(scope.clone()).await?;

        self.scheduler.schedule_with(&scope.rule_id, TriggerKind::ScopeChanged);
        Ok(scope)
    }

    pub async fn remove_scope(&self, rule_id: &str, scope_id: &str) -> Result<()> {
        if !self.repository.delete_scope(rule_id, scope_id).await? {
            return Err(PolicyError::ScopeNotFound(scope_id.to_string()));
        }

        self.scheduler.schedule_with(rule_id, TriggerKind::ScopeChanged);
        Ok(())
    }

    /// Schedule every rule that targets a group whose membership changed
    ///
    /// Returns how many rules were scheduled.
    pub async fn membership_changed(&self, group_id: &str) -> Result<usize> {
        let rules = self.repository.list_rules_targeting_group(group_id).await?;
        for rule_id in &rules {
            self.scheduler.schedule_with(rule_id, TriggerKind::MembershipChanged);
        }

        info!(
            "Membership of group {} changed; scheduled {} rules",
            group_id,
            rules.len()
        );
        Ok(rules.len())
    }
}
