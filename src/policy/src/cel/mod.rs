//! Dynamic-rule expression validation
//!
//! Expressions are only parsed and checked against the endpoint evaluation
//! environment here. Evaluation itself happens on the endpoint agent.

pub mod error;
pub mod validator;

pub use error::ExpressionError;
pub use validator::{ExpressionValidator, ENVIRONMENT};
