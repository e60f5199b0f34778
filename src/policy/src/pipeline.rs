//! One recompilation pass: load, expand, compile, replace, resync
//!
//! A pass reads the rule and its scopes, resolves every referenced group
//! once, compiles the full assignment set, swaps it in atomically and then
//! asks affected endpoints to resynchronize. Any error before the swap
//! leaves the previous generation in place; resync failures after the swap
//! are logged and counted but never fail the pass.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::compiler::{compile, AssignmentDiff, AssignmentSet};
use crate::definition::ScopeStoreAdapter;
use crate::error::Result;
use crate::membership::MembershipResolver;
use crate::metrics::MetricsCollector;
use crate::replacer::{AssignmentReplacer, Replacement};
use crate::resync::{BlastRadius, DispatchReport, ResyncDispatcher, ResyncPlan};
use crate::store::{AssignmentStore, DirectoryStore, ResyncSink, RuleStore};
use crate::types::RuleId;

/// What a successful pass did
#[derive(Debug, Clone)]
pub struct RecompileOutcome {
    pub rule_id: RuleId,
    /// Fingerprint of the generation now in place
    pub fingerprint: String,
    /// Size of the generation now in place
    pub assignments: usize,
    /// Whether the rule had been deleted and its assignments cleared
    pub cleared: bool,
    pub diff: AssignmentDiff,
    pub plan: ResyncPlan,
    pub resync: DispatchReport,
}

/// A pass whose assignments are in place but whose endpoints have not
/// been told yet
#[derive(Debug, Clone)]
pub struct CommittedPass {
    pub rule_id: RuleId,
    pub fingerprint: String,
    pub cleared: bool,
    pub replacement: Replacement,
    pub plan: ResyncPlan,
    started: Instant,
}

/// Runs recompilation passes against the injected stores
pub struct RecompilePipeline {
    definitions: ScopeStoreAdapter,
    directory: Arc<dyn DirectoryStore>,
    replacer: AssignmentReplacer,
    dispatcher: ResyncDispatcher,
    metrics: Arc<MetricsCollector>,
}

impl RecompilePipeline {
    pub fn new(
        rules: Arc<dyn RuleStore>,
        directory: Arc<dyn DirectoryStore>,
        assignments: Arc<dyn AssignmentStore>,
        sink: Arc<dyn ResyncSink>,
        max_targeted: usize,
    ) -> Self {
        Self {
            definitions: ScopeStoreAdapter::new(rules),
            directory,
            replacer: AssignmentReplacer::new(assignments),
            dispatcher: ResyncDispatcher::new(sink, max_targeted),
            metrics: Arc::new(MetricsCollector::new()),
        }
    }

    /// Build a pipeline over a single store serving every interface
    pub fn from_store<S>(store: Arc<S>, max_targeted: usize) -> Self
    where
        S: RuleStore + DirectoryStore + AssignmentStore + ResyncSink + 'static,
    {
        Self::new(store.clone(), store.clone(), store.clone(), store, max_targeted)
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    /// Recompile one rule with a fresh membership cache
    pub async fn run(&self, rule_id: &str, radius: BlastRadius) -> Result<RecompileOutcome> {
        let mut resolver = MembershipResolver::new(self.directory.clone());
        self.run_with(rule_id, radius, &mut resolver).await
    }

    /// Recompile many rules sharing one membership cache
    ///
    /// Each group is looked up once for the whole batch. A failing rule does
    /// not stop the others. Intended for offline rebuilds; live triggers go
    /// through the scheduler so each rule stays serialized.
    pub async fn run_batch(
        &self,
        rule_ids: &[RuleId],
        radius: BlastRadius,
    ) -> Vec<(RuleId, Result<RecompileOutcome>)> {
        let mut resolver = MembershipResolver::new(self.directory.clone());
        let mut results = Vec::with_capacity(rule_ids.len());

        for rule_id in rule_ids {
            let result = self.run_with(rule_id, radius, &mut resolver).await;
            if let Err(e) = &result {
                warn!("Batch recompilation of rule {} failed: {}", rule_id, e);
            }
            results.push((rule_id.clone(), result));
        }

        let stats = resolver.stats();
        info!(
            "Batch recompiled {} rules ({} group lookups, {} cache hits)",
            rule_ids.len(),
            stats.misses,
            stats.hits
        );

        results
    }

    /// Load, resolve, compile and swap in a rule's assignments
    ///
    /// Returns once the new generation is in place, before any endpoint
    /// has been told about it. Callers that bound this stage must still
    /// hand the result to [`RecompilePipeline::resync`].
    pub async fn commit(&self, rule_id: &str, radius: BlastRadius) -> Result<CommittedPass> {
        let mut resolver = MembershipResolver::new(self.directory.clone());
        self.commit_with(rule_id, radius, &mut resolver).await
    }

    /// Dispatch the resync requests of a committed pass
    ///
    /// Never fails: dispatch errors are logged and counted.
    pub async fn resync(&self, committed: CommittedPass) -> RecompileOutcome {
        let CommittedPass {
            rule_id,
            fingerprint,
            cleared,
            replacement,
            plan,
            started,
        } = committed;

        let resync = self.dispatcher.dispatch(&rule_id, &plan).await;
        self.metrics.record_resync(resync.requested, resync.failed).await;

        let assignments = replacement.current.len();
        let diff = replacement.diff();
        debug!(
            "Recompiled rule {} in {:?}: {} assignments ({} changed), fingerprint {}",
            rule_id,
            started.elapsed(),
            assignments,
            diff.len(),
            &fingerprint[..16]
        );

        RecompileOutcome {
            rule_id,
            fingerprint,
            assignments,
            cleared,
            diff,
            plan,
            resync,
        }
    }

    async fn run_with(
        &self,
        rule_id: &str,
        radius: BlastRadius,
        resolver: &mut MembershipResolver,
    ) -> Result<RecompileOutcome> {
        let committed = self.commit_with(rule_id, radius, resolver).await?;
        Ok(self.resync(committed).await)
    }

    async fn commit_with(
        &self,
        rule_id: &str,
        radius: BlastRadius,
        resolver: &mut MembershipResolver,
    ) -> Result<CommittedPass> {
        let started = Instant::now();

        let (set, radius, cleared) = match self.definitions.load(rule_id).await? {
            Some(definition) => {
                let membership = resolver.snapshot_for(&definition.scopes).await?;
                let set = compile(&definition.rule, &definition.scopes, &membership);
                (set, radius, false)
            }
            None => {
                debug!("Rule {} no longer exists; clearing its assignments", rule_id);
                (AssignmentSet::default(), BlastRadius::Fleet, true)
            }
        };

        let fingerprint = set.fingerprint();
        let replacement = self.replacer.replace(rule_id, set).await?;
        self.metrics
            .record_completed(replacement.current.len(), started.elapsed())
            .await;

        let plan = self.dispatcher.plan(radius, &replacement);

        Ok(CommittedPass {
            rule_id: rule_id.to_string(),
            fingerprint,
            cleared,
            replacement,
            plan,
            started,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, RuleRepository};
    use crate::types::{ResyncTarget, Rule, RuleType, Scope, ScopeAction};

    async fn seeded() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_rule(Rule::new("r", RuleType::Binary, "abc").with_id("r1"))
            .await
            .unwrap();
        store
            .insert_rule(Rule::new("r", RuleType::Binary, "def").with_id("r2"))
            .await
            .unwrap();
        store.insert_scope(Scope::group("r1", "eng", ScopeAction::Allow)).await.unwrap();
        store.insert_scope(Scope::group("r2", "eng", ScopeAction::Block)).await.unwrap();
        store.set_group_members("eng", ["alice", "bob"]).await;
        store
    }

    #[tokio::test]
    async fn test_run_replaces_and_resyncs() {
        let store = seeded().await;
        let pipeline = RecompilePipeline::from_store(store.clone(), 100);

        let outcome = pipeline.run("r1", BlastRadius::Diff).await.unwrap();

        assert_eq!(outcome.assignments, 2);
        assert!(!outcome.cleared);
        assert_eq!(store.list_assignments("r1").await.unwrap().len(), 2);
        assert_eq!(store.resync_requests(), vec![ResyncTarget::Group("eng".to_string())]);

        // Nothing changed, nothing to resync
        let again = pipeline.run("r1", BlastRadius::Diff).await.unwrap();
        assert_eq!(again.fingerprint, outcome.fingerprint);
        assert!(again.plan.is_empty());
    }

    #[tokio::test]
    async fn test_commit_swaps_before_resync() {
        let store = seeded().await;
        let pipeline = RecompilePipeline::from_store(store.clone(), 100);

        let committed = pipeline.commit("r1", BlastRadius::Diff).await.unwrap();

        assert_eq!(store.list_assignments("r1").await.unwrap().len(), 2);
        assert!(store.resync_requests().is_empty());

        let outcome = pipeline.resync(committed).await;
        assert_eq!(outcome.resync.requested, 1);
        assert_eq!(store.resync_requests(), vec![ResyncTarget::Group("eng".to_string())]);
    }

    #[tokio::test]
    async fn test_deleted_rule_clears_assignments() {
        let store = seeded().await;
        let pipeline = RecompilePipeline::from_store(store.clone(), 100);
        pipeline.run("r1", BlastRadius::Diff).await.unwrap();
        store.take_resync_requests();

        store.delete_rule("r1").await.unwrap();
        let outcome = pipeline.run("r1", BlastRadius::Diff).await.unwrap();

        assert!(outcome.cleared);
        assert_eq!(outcome.assignments, 0);
        assert!(store.list_assignments("r1").await.unwrap().is_empty());
        assert_eq!(store.resync_requests(), vec![ResyncTarget::All]);
    }

    #[tokio::test]
    async fn test_batch_compiles_every_rule() {
        let store = seeded().await;
        let pipeline = RecompilePipeline::from_store(store.clone(), 100);

        let results = pipeline
            .run_batch(&["r1".to_string(), "r2".to_string()], BlastRadius::Diff)
            .await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        let r2 = store.list_assignments("r2").await.unwrap();
        assert!(r2.iter().all(|a| a.action == ScopeAction::Block));

        let metrics = pipeline.metrics().snapshot().await;
        assert_eq!(metrics.completed, 2);
        assert_eq!(metrics.assignments_written, 4);
    }
}
