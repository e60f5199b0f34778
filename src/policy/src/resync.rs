//! Forced resynchronization ("clean sync") requests after a recompilation
//!
//! The dispatcher turns a replaced generation into the narrowest set of
//! resync targets that covers every affected endpoint, and escalates to all
//! machines when precision is impossible or not worth it. Dispatch fails
//! soft: the write that triggered the pass has already succeeded.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::replacer::Replacement;
use crate::store::ResyncSink;
use crate::types::{CompiledAssignment, Provenance, ResyncTarget};

/// How far a change reaches beyond the assignment diff
///
/// Ordered from narrowest to widest; coalesced triggers keep the widest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BlastRadius {
    /// Only principals whose assignment changed
    Diff,
    /// Every principal holding an assignment before or after, because
    /// rule content changed even if assignments did not
    Holders,
    /// Every machine
    Fleet,
}

/// Resync requests to issue for one pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncPlan {
    /// Specific users and groups; empty means nothing to do
    Targeted(BTreeSet<ResyncTarget>),
    /// All machines
    Fleet,
}

impl ResyncPlan {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Targeted(targets) if targets.is_empty())
    }

    /// Flattened request list
    pub fn targets(&self) -> Vec<ResyncTarget> {
        match self {
            Self::Targeted(targets) => targets.iter().cloned().collect(),
            Self::Fleet => vec![ResyncTarget::All],
        }
    }
}

/// Result of dispatching a plan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub requested: usize,
    pub failed: usize,
}

/// Plans and issues resync requests
#[derive(Clone)]
pub struct ResyncDispatcher {
    sink: Arc<dyn ResyncSink>,
    max_targeted: usize,
}

impl ResyncDispatcher {
    pub fn new(sink: Arc<dyn ResyncSink>, max_targeted: usize) -> Self {
        Self { sink, max_targeted }
    }

    /// Work out which endpoints a replacement affects
    pub fn plan(&self, radius: BlastRadius, replacement: &Replacement) -> ResyncPlan {
        let mut targets = BTreeSet::new();

        match radius {
            BlastRadius::Fleet => return ResyncPlan::Fleet,
            BlastRadius::Diff => {
                let diff = replacement.diff();
                for a in diff.added.iter().chain(diff.changed.iter().map(|(_, after)| after)) {
                    targets.insert(target_for(a));
                }
                // A removed principal may no longer be in the group it came
                // through, so address the user directly
                for a in &diff.removed {
                    targets.insert(ResyncTarget::User(a.principal_id.clone()));
                }
            }
            BlastRadius::Holders => {
                let current: BTreeSet<&str> = replacement
                    .current
                    .iter()
                    .map(|a| a.principal_id.as_str())
                    .collect();
                for a in &replacement.current {
                    targets.insert(target_for(a));
                }
                for a in &replacement.previous {
                    if !current.contains(a.principal_id.as_str()) {
                        targets.insert(ResyncTarget::User(a.principal_id.clone()));
                    }
                }
            }
        }

        if targets.len() > self.max_targeted {
            debug!(
                "{} resync targets exceed limit of {}; escalating to all machines",
                targets.len(),
                self.max_targeted
            );
            return ResyncPlan::Fleet;
        }

        ResyncPlan::Targeted(targets)
    }

    /// Issue the plan's requests, logging failures instead of returning them
    pub async fn dispatch(&self, rule_id: &str, plan: &ResyncPlan) -> DispatchReport {
        let mut report = DispatchReport::default();

        for target in plan.targets() {
            report.requested += 1;
            let result = match &target {
                ResyncTarget::User(id) => self.sink.request_resync_for_user(id).await,
                ResyncTarget::Group(id) => self.sink.request_resync_for_group(id).await,
                ResyncTarget::All => self.sink.request_resync_all().await,
            };

            if let Err(e) = result {
                report.failed += 1;
                warn!("Resync request {} for rule {} failed: {}", target, rule_id, e);
            }
        }

        if report.requested > 0 {
            debug!(
                "Dispatched {} resync requests for rule {} ({} failed)",
                report.requested, rule_id, report.failed
            );
        }

        report
    }
}

fn target_for(assignment: &CompiledAssignment) -> ResyncTarget {
    match &assignment.provenance {
        Provenance::Direct => ResyncTarget::User(assignment.principal_id.clone()),
        Provenance::Group { group_id } => ResyncTarget::Group(group_id.clone()),
    }
}
