//! Syntactic validation of dynamic-rule expressions
//!
//! The validator is built once at process start and shared by reference.
//! It never executes an expression: it parses it with the CEL parser and
//! checks that every free variable is part of the endpoint evaluation
//! environment.

use cel_interpreter::Program;
use regex::Regex;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};

use crate::cel::error::ExpressionError;
use crate::error::{PolicyError, Result};

/// Identifiers the endpoint evaluation environment declares.
///
/// Activation fields first, then the return-value constants.
pub const ENVIRONMENT: &[&str] = &[
    "target",
    "args",
    "envs",
    "euid",
    "cwd",
    "ALLOWLIST",
    "ALLOWLIST_COMPILER",
    "BLOCKLIST",
    "SILENT_BLOCKLIST",
    "REQUIRE_TOUCHID",
    "REQUIRE_TOUCHID_ONLY",
];

/// Matches the iteration variable of a comprehension macro, e.g. the `a`
/// in `args.exists(a, a == '--inspect')`.
const BINDER_PATTERN: &str =
    r"\.\s*(?:all|exists|exists_one|map|filter)\s*\(\s*([A-Za-z_][A-Za-z0-9_]*)\s*,";

/// Stateless CEL expression validator
pub struct ExpressionValidator {
    /// Declared environment identifiers
    declared: HashSet<String>,
    /// Comprehension binder extractor
    binder: Regex,
    /// Maximum accepted expression length in bytes
    max_len: usize,
}

impl ExpressionValidator {
    /// Build the evaluation environment
    ///
    /// # Errors
    ///
    /// Returns an internal error if the environment cannot be built.
    pub fn new(max_len: usize) -> Result<Self> {
        let binder = Regex::new(BINDER_PATTERN)
            .map_err(|e| PolicyError::Internal(format!("binder pattern: {}", e)))?;

        Ok(Self {
            declared: ENVIRONMENT.iter().map(|s| s.to_string()).collect(),
            binder,
            max_len,
        })
    }

    /// Validate an expression without executing it
    ///
    /// # Errors
    ///
    /// - [`ExpressionError::Empty`] for blank input
    /// - [`ExpressionError::TooLong`] above the configured limit
    /// - [`ExpressionError::Syntax`] when the CEL parser rejects it
    /// - [`ExpressionError::UndeclaredReference`] for a free variable the
    ///   environment does not declare
    pub fn validate(&self, expr: &str) -> std::result::Result<(), ExpressionError> {
        if expr.trim().is_empty() {
            return Err(ExpressionError::Empty);
        }

        if expr.len() > self.max_len {
            return Err(ExpressionError::TooLong {
                len: expr.len(),
                max: self.max_len,
            });
        }

        // The CEL parser panics on some malformed literals (bad escapes,
        // integer overflow) instead of returning an error
        let program = match panic::catch_unwind(AssertUnwindSafe(|| Program::compile(expr))) {
            Ok(Ok(program)) => program,
            Ok(Err(e)) => return Err(ExpressionError::Syntax(format!("{:?}", e))),
            Err(_) => {
                return Err(ExpressionError::Syntax(
                    "malformed literal rejected by the parser".to_string(),
                ))
            }
        };

        let references = program.references();
        let mut undeclared: Vec<&str> = references
            .variables()
            .into_iter()
            .filter(|v| !self.declared.contains(*v) && !self.is_bound_everywhere(expr, v))
            .collect();
        undeclared.sort_unstable();

        match undeclared.first() {
            Some(name) => Err(ExpressionError::UndeclaredReference(name.to_string())),
            None => Ok(()),
        }
    }

    /// Whether every use of `name` sits inside a comprehension binding it
    fn is_bound_everywhere(&self, expr: &str, name: &str) -> bool {
        let scopes: Vec<(usize, usize)> = self
            .binder
            .captures_iter(expr)
            .filter(|c| c.get(1).is_some_and(|m| m.as_str() == name))
            .filter_map(|c| {
                let whole = c.get(0)?;
                let open = whole.start() + whole.as_str().find('(')?;
                Some((open, closing_paren(expr, open)?))
            })
            .collect();

        if scopes.is_empty() {
            return false;
        }

        identifier_uses(expr, name)
            .into_iter()
            .all(|at| scopes.iter().any(|&(open, close)| open < at && at < close))
    }

    /// Maximum accepted expression length
    pub fn max_len(&self) -> usize {
        self.max_len
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Index just past the string literal opening at `start`
fn skip_string(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if b == quote => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Index of the parenthesis closing the one at `open`
fn closing_paren(expr: &str, open: usize) -> Option<usize> {
    let bytes = expr.as_bytes();
    let mut depth = 0usize;
    let mut i = open;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' => {
                i = skip_string(bytes, i);
                continue;
            }
            b'(' => depth += 1,
            b')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Offsets where `name` is used as a variable, skipping string literals
/// and field selections such as `target.name`
fn identifier_uses(expr: &str, name: &str) -> Vec<usize> {
    let bytes = expr.as_bytes();
    let mut uses = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'\'' || b == b'"' {
            i = skip_string(bytes, i);
            continue;
        }
        if !(b.is_ascii_alphabetic() || b == b'_') {
            i += 1;
            continue;
        }

        let start = i;
        while i < bytes.len() && is_ident_byte(bytes[i]) {
            i += 1;
        }
        let selected = expr[..start].trim_end().ends_with('.');
        if &expr[start..i] == name && !selected {
            uses.push(start);
        }
    }
    uses
}
