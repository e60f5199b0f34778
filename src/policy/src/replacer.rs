//! Atomic replacement of a rule's compiled assignments

use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::compiler::{AssignmentDiff, AssignmentSet};
use crate::error::{PolicyError, Result};
use crate::store::AssignmentStore;
use crate::types::CompiledAssignment;

/// Outcome of a successful swap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    /// The generation that was replaced
    pub previous: Vec<CompiledAssignment>,
    /// The generation now in place
    pub current: Vec<CompiledAssignment>,
}

impl Replacement {
    /// Per-principal difference between the two generations
    pub fn diff(&self) -> AssignmentDiff {
        AssignmentDiff::between(&self.previous, &self.current)
    }
}

/// Swaps a rule's whole assignment set in one unit
#[derive(Clone)]
pub struct AssignmentReplacer {
    store: Arc<dyn AssignmentStore>,
}

impl AssignmentReplacer {
    pub fn new(store: Arc<dyn AssignmentStore>) -> Self {
        Self { store }
    }

    /// Replace a rule's assignments with a freshly compiled set
    ///
    /// # Errors
    ///
    /// Rejects sets holding assignments of another rule or duplicate
    /// principals. Storage failures are returned to the caller for retry;
    /// the previous generation stays authoritative.
    pub async fn replace(&self, rule_id: &str, next: AssignmentSet) -> Result<Replacement> {
        let mut seen = HashSet::with_capacity(next.len());
        for a in next.as_slice() {
            if a.rule_id != rule_id {
                return Err(PolicyError::Internal(format!(
                    "assignment for rule {} in set for rule {}",
                    a.rule_id, rule_id
                )));
            }
            if !seen.insert(a.principal_id.as_str()) {
                return Err(PolicyError::Internal(format!(
                    "duplicate principal {} in set for rule {}",
                    a.principal_id, rule_id
                )));
            }
        }

        let current = next.into_vec();
        let previous = self
            .store
            .replace_assignments(rule_id, current.clone())
            .await?;

        debug!(
            "Replaced assignments for rule {}: {} -> {}",
            rule_id,
            previous.len(),
            current.len()
        );

        Ok(Replacement { previous, current })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::ScopeAction;

    #[tokio::test]
    async fn test_replace_swaps_generations() {
        let store = Arc::new(MemoryStore::new());
        let replacer = AssignmentReplacer::new(store.clone());

        let first = AssignmentSet::new(vec![
            CompiledAssignment::direct("r1", "alice", ScopeAction::Allow),
            CompiledAssignment::via_group("r1", "bob", ScopeAction::Allow, "eng"),
        ]);
        let replacement = replacer.replace("r1", first).await.unwrap();
        assert!(replacement.previous.is_empty());
        assert_eq!(replacement.diff().added.len(), 2);

        let second = AssignmentSet::new(vec![CompiledAssignment::direct("r1", "alice", ScopeAction::Block)]);
        let replacement = replacer.replace("r1", second).await.unwrap();
        let diff = replacement.diff();
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.removed.len(), 1);

        assert_eq!(store.list_assignments("r1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_foreign_assignments() {
        let store = Arc::new(MemoryStore::new());
        let replacer = AssignmentReplacer::new(store.clone());

        let set = AssignmentSet::new(vec![CompiledAssignment::direct("r2", "alice", ScopeAction::Allow)]);
        let result = replacer.replace("r1", set).await;

        assert!(matches!(result, Err(PolicyError::Internal(_))));
        assert!(store.list_assignments("r2").await.unwrap().is_empty());
    }
}
