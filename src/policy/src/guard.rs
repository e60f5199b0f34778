//! Definition-time checks on rules and scopes
//!
//! These run synchronously before a write is persisted and block it on
//! failure. Recompilation never re-runs them.

use crate::cel::ExpressionValidator;
use crate::error::{PolicyError, Result};
use crate::types::{Rule, Scope, ScopeAction};

/// Check a rule about to be created
pub fn check_rule_definition(validator: &ExpressionValidator, rule: &Rule) -> Result<()> {
    if rule.identifier.trim().is_empty() {
        return Err(PolicyError::InvalidInput("rule identifier is empty".into()));
    }

    if rule.is_dynamic() {
        validator.validate(rule.metadata.expression.as_deref().unwrap_or(""))?;
    } else if rule.metadata.expression.is_some() {
        return Err(PolicyError::DynamicModeViolation(format!(
            "rule {} carries an expression but is not in dynamic mode",
            rule.id
        )));
    }

    Ok(())
}

/// Check an update against the stored rule and its scopes
///
/// Dynamic mode is one-way. Switching it on is only allowed while the rule
/// has no `allow`/`block` scopes, since dynamic rules take `dynamic` scopes
/// exclusively.
pub fn check_rule_update(
    validator: &ExpressionValidator,
    current: &Rule,
    updated: &Rule,
    scopes: &[Scope],
) -> Result<()> {
    if current.id != updated.id {
        return Err(PolicyError::InvalidInput(format!(
            "cannot change rule id {} to {}",
            current.id, updated.id
        )));
    }

    check_mode_change(current, updated, scopes)?;
    check_rule_definition(validator, updated)
}

/// Check a dynamic-mode transition against the rule's current scopes
///
/// Stores call this again under their write lock, so a scope added
/// concurrently cannot slip past a mode switch.
pub fn check_mode_change(current: &Rule, updated: &Rule, scopes: &[Scope]) -> Result<()> {
    if current.is_dynamic() && !updated.is_dynamic() {
        return Err(PolicyError::DynamicModeViolation(format!(
            "dynamic mode cannot be disabled on rule {}",
            current.id
        )));
    }

    if !current.is_dynamic() && updated.is_dynamic() {
        if let Some(scope) = scopes.iter().find(|s| s.action != ScopeAction::Dynamic) {
            return Err(PolicyError::DynamicModeViolation(format!(
                "rule {} has {} scope {} for {}; remove it before enabling dynamic mode",
                current.id,
                scope.action,
                scope.id,
                scope.target()
            )));
        }
    }

    Ok(())
}

/// Check a scope about to be added to `rule`
pub fn check_scope(rule: &Rule, existing: &[Scope], candidate: &Scope) -> Result<()> {
    if candidate.rule_id != rule.id {
        return Err(PolicyError::InvalidInput(format!(
            "scope belongs to rule {}, not {}",
            candidate.rule_id, rule.id
        )));
    }

    if candidate.target_id.trim().is_empty() {
        return Err(PolicyError::InvalidInput("scope target id is empty".into()));
    }

    check_scope_action(rule, candidate)?;

    if existing.iter().any(|s| s.same_target(candidate)) {
        return Err(PolicyError::DuplicateScope {
            rule_id: rule.id.clone(),
            target: candidate.target(),
        });
    }

    Ok(())
}

/// Check that a scope's action matches the rule's mode
pub fn check_scope_action(rule: &Rule, candidate: &Scope) -> Result<()> {
    match (rule.is_dynamic(), candidate.action) {
        (true, ScopeAction::Allow | ScopeAction::Block) => Err(PolicyError::DynamicModeViolation(
            format!("rule {} is dynamic; scopes must use the dynamic action", rule.id),
        )),
        (false, ScopeAction::Dynamic) => Err(PolicyError::DynamicModeViolation(format!(
            "rule {} is not dynamic; the dynamic action is not allowed",
            rule.id
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cel::ExpressionError;
    use crate::types::RuleType;

    fn validator() -> ExpressionValidator {
        ExpressionValidator::new(4096).unwrap()
    }

    fn static_rule() -> Rule {
        Rule::new("r", RuleType::Binary, "abc").with_id("r1")
    }

    #[test]
    fn test_dynamic_rule_needs_expression() {
        let mut rule = static_rule();
        rule.metadata.dynamic = true;

        let result = check_rule_definition(&validator(), &rule);
        assert!(matches!(
            result,
            Err(PolicyError::InvalidExpression(ExpressionError::Empty))
        ));

        let rule = static_rule().with_expression("euid == 0");
        assert!(check_rule_definition(&validator(), &rule).is_ok());
    }

    #[test]
    fn test_dynamic_mode_is_one_way() {
        let dynamic = static_rule().with_expression("euid == 0");
        let mut reverted = dynamic.clone();
        reverted.metadata.dynamic = false;
        reverted.metadata.expression = None;

        let result = check_rule_update(&validator(), &dynamic, &reverted, &[]);
        assert!(matches!(result, Err(PolicyError::DynamicModeViolation(_))));
    }

    #[test]
    fn test_enabling_dynamic_with_static_scopes_rejected() {
        let current = static_rule();
        let updated = static_rule().with_expression("euid == 0");
        let scopes = vec![Scope::user("r1", "alice", ScopeAction::Allow)];

        let result = check_rule_update(&validator(), &current, &updated, &scopes);
        assert!(matches!(result, Err(PolicyError::DynamicModeViolation(_))));

        assert!(check_rule_update(&validator(), &current, &updated, &[]).is_ok());
    }

    #[test]
    fn test_scope_action_gating() {
        let dynamic = static_rule().with_expression("euid == 0");
        let stat = static_rule();

        let allow = Scope::user("r1", "alice", ScopeAction::Allow);
        let dyn_scope = Scope::user("r1", "alice", ScopeAction::Dynamic);

        assert!(matches!(
            check_scope(&dynamic, &[], &allow),
            Err(PolicyError::DynamicModeViolation(_))
        ));
        assert!(matches!(
            check_scope(&stat, &[], &dyn_scope),
            Err(PolicyError::DynamicModeViolation(_))
        ));
        assert!(check_scope(&dynamic, &[], &dyn_scope).is_ok());
        assert!(check_scope(&stat, &[], &allow).is_ok());
    }

    #[test]
    fn test_duplicate_target_rejected() {
        let rule = static_rule();
        let existing = vec![Scope::group("r1", "eng", ScopeAction::Allow)];

        let result = check_scope(&rule, &existing, &Scope::group("r1", "eng", ScopeAction::Block));
        assert!(matches!(result, Err(PolicyError::DuplicateScope { .. })));

        // Same id as a user is a different target
        assert!(check_scope(&rule, &existing, &Scope::user("r1", "eng", ScopeAction::Block)).is_ok());
    }
}
