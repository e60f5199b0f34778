//! Error types for the policy compiler

use thiserror::Error;

use crate::cel::ExpressionError;

/// Policy compiler errors
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Dynamic expression rejected by the validator
    #[error("Invalid expression: {0}")]
    InvalidExpression(#[from] ExpressionError),

    /// A user or group already has a scope on this rule
    #[error("Duplicate scope: {target} already assigned on rule {rule_id}")]
    DuplicateScope {
        /// Rule the scope was added to
        rule_id: String,
        /// Rendered target (e.g. "group:eng")
        target: String,
    },

    /// Another rule already governs this identifier
    #[error("Duplicate identifier: {0} is already governed by another rule")]
    DuplicateIdentifier(String),

    /// Scope action does not agree with the rule's dynamic mode
    #[error("Dynamic mode violation: {0}")]
    DynamicModeViolation(String),

    /// Rule not found
    #[error("Rule not found: {0}")]
    RuleNotFound(String),

    /// Scope not found
    #[error("Scope not found: {0}")]
    ScopeNotFound(String),

    /// Persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Resync request could not be delivered
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for policy compiler operations
pub type Result<T> = std::result::Result<T, PolicyError>;
