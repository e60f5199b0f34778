//! Error types for expression validation

use thiserror::Error;

/// Expression validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("expression is empty")]
    Empty,

    #[error("expression is {len} bytes, limit is {max}")]
    TooLong { len: usize, max: usize },

    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("undeclared reference to '{0}'")]
    UndeclaredReference(String),
}
