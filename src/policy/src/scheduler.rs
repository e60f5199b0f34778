//! Background recompilation scheduling
//!
//! Each rule with outstanding work gets one long-lived worker task. A
//! trigger records its blast radius in the worker's pending slot and wakes
//! it; triggers that arrive before the worker reads the slot are merged, so
//! a burst of scope edits costs one pass. If the rule is currently
//! compiling, the worker will compile again when it finishes. There is
//! never more than one pass in flight per rule, and each pass reads the
//! latest stored state, so the last pass to run reflects the last trigger.
//!
//! Workers for different rules run in parallel, bounded by a shared
//! semaphore. Passes are detached from the caller: `schedule` returns at
//! once, never fails, and a failing, hanging or panicking pass is logged
//! and counted without affecting the worker or the caller.
//!
//! The compile timeout covers a pass up to the assignment swap. Resync
//! delivery has its own bound; when it is exceeded after the swap the rule
//! is queued again with a fleet-wide radius.

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify, Semaphore};
use tracing::{debug, error, info};

use crate::config::SchedulerSection;
use crate::error::{PolicyError, Result};
use crate::metrics::{CompilerMetrics, MetricsCollector};
use crate::pipeline::RecompilePipeline;
use crate::resync::BlastRadius;
use crate::types::RuleId;

/// What kind of mutation caused a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    /// A scope was created or deleted
    ScopeChanged,
    /// Membership of a group targeted by the rule changed
    MembershipChanged,
    /// Rule was created or its content changed
    RuleChanged,
    /// Rule went from enabled to disabled
    RuleDisabled,
    /// Rule was deleted
    RuleDeleted,
}

impl TriggerKind {
    pub fn blast_radius(self) -> BlastRadius {
        match self {
            Self::ScopeChanged | Self::MembershipChanged => BlastRadius::Diff,
            Self::RuleChanged => BlastRadius::Holders,
            Self::RuleDisabled | Self::RuleDeleted => BlastRadius::Fleet,
        }
    }
}

/// Schedules per-rule recompilation in the background
#[derive(Clone)]
pub struct RecompilationScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    pipeline: Arc<RecompilePipeline>,
    workers: DashMap<RuleId, Arc<RuleWorker>>,
    permits: Semaphore,
    config: SchedulerSection,
    runtime: Handle,
    /// Bumped after every finished pass
    progress: watch::Sender<u64>,
    metrics: Arc<MetricsCollector>,
}

struct RuleWorker {
    notify: Notify,
    state: Mutex<WorkerState>,
}

#[derive(Default)]
struct WorkerState {
    /// Widest radius among triggers not yet picked up
    pending: Option<BlastRadius>,
    /// Triggers not yet picked up
    triggers: u64,
    running: bool,
}

impl RuleWorker {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            state: Mutex::new(WorkerState::default()),
        }
    }

    fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_none() && !state.running
    }
}

impl RecompilationScheduler {
    /// Create a scheduler bound to the current tokio runtime
    ///
    /// Workers are spawned on that runtime, so passes keep running after
    /// the request that triggered them is gone.
    pub fn new(pipeline: Arc<RecompilePipeline>, config: SchedulerSection) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| PolicyError::Internal(format!("scheduler needs a tokio runtime: {}", e)))?;
        let (progress, _) = watch::channel(0);
        let metrics = pipeline.metrics();

        info!(
            "Recompilation scheduler started (window {}ms, timeout {}ms, resync timeout {}ms, {} concurrent)",
            config.coalesce_window_ms,
            config.compile_timeout_ms,
            config.resync_timeout_ms,
            config.max_concurrent
        );

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                pipeline,
                workers: DashMap::new(),
                permits: Semaphore::new(config.max_concurrent),
                config,
                runtime,
                progress,
                metrics,
            }),
        })
    }

    /// Schedule a recompilation of a rule
    pub fn schedule(&self, rule_id: &str) {
        self.schedule_with(rule_id, TriggerKind::RuleChanged);
    }

    /// Schedule a recompilation, recording what caused it
    pub fn schedule_with(&self, rule_id: &str, kind: TriggerKind) {
        let radius = kind.blast_radius();
        let mut spawned = false;

        // Pending is set while the map shard is held so an idle worker
        // cannot retire between lookup and update
        let worker = {
            let entry = self
                .inner
                .workers
                .entry(rule_id.to_string())
                .or_insert_with(|| {
                    spawned = true;
                    Arc::new(RuleWorker::new())
                });
            let worker = entry.value().clone();

            let mut state = worker.state.lock();
            state.pending = Some(state.pending.map_or(radius, |p| p.max(radius)));
            state.triggers += 1;
            drop(state);

            worker
        };

        worker.notify.notify_one();

        if spawned {
            let inner = self.inner.clone();
            self.inner
                .runtime
                .spawn(run_worker(inner, rule_id.to_string(), worker));
        }

        debug!("Scheduled recompilation of rule {} ({:?})", rule_id, kind);
    }

    /// Wait until no rule has a pending or running compilation
    pub async fn settled(&self) {
        let mut progress = self.inner.progress.subscribe();
        loop {
            if self.is_idle() {
                return;
            }
            if progress.changed().await.is_err() {
                return;
            }
        }
    }

    /// Whether no rule has a pending or running compilation
    pub fn is_idle(&self) -> bool {
        self.inner.workers.iter().all(|w| w.value().is_idle())
    }

    /// Number of live per-rule workers
    pub fn active_workers(&self) -> usize {
        self.inner.workers.len()
    }

    pub async fn metrics(&self) -> CompilerMetrics {
        self.inner.metrics.snapshot().await
    }
}

async fn run_worker(inner: Arc<SchedulerInner>, rule_id: RuleId, worker: Arc<RuleWorker>) {
    debug!("Starting recompilation worker for rule {}", rule_id);

    loop {
        tokio::select! {
            _ = worker.notify.notified() => {}
            _ = tokio::time::sleep(inner.config.idle_retire()) => {
                let retired = inner
                    .workers
                    .remove_if(&rule_id, |_, w| Arc::ptr_eq(w, &worker) && w.is_idle())
                    .is_some();
                if retired {
                    break;
                }
                continue;
            }
        }

        // Let the rest of a burst land before reading state
        tokio::time::sleep(inner.config.coalesce_window()).await;

        let _permit = match inner.permits.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                error!("Recompilation worker for rule {} stopping: {}", rule_id, e);
                break;
            }
        };

        let (radius, triggers) = {
            let mut state = worker.state.lock();
            let Some(radius) = state.pending.take() else {
                continue;
            };
            state.running = true;
            (radius, std::mem::take(&mut state.triggers))
        };

        inner.metrics.record_triggers(triggers).await;
        let delivered = inner.execute(&rule_id, radius).await;

        {
            let mut state = worker.state.lock();
            // Stored set already matches, so a diff would be empty
            if !delivered {
                state.pending = Some(BlastRadius::Fleet);
            }
            state.running = false;
        }
        if !delivered {
            worker.notify.notify_one();
        }
        inner.progress.send_modify(|n| *n += 1);
    }

    debug!("Recompilation worker for rule {} retired", rule_id);
}

impl SchedulerInner {
    /// Run one pass, containing every failure mode
    ///
    /// Returns `false` when the new generation was swapped in but its
    /// resync requests were not all delivered.
    async fn execute(&self, rule_id: &str, radius: BlastRadius) -> bool {
        let timeout = self.config.compile_timeout();
        let commit = tokio::time::timeout(timeout, self.pipeline.commit(rule_id, radius));

        let committed = match AssertUnwindSafe(commit).catch_unwind().await {
            Ok(Ok(Ok(committed))) => committed,
            Ok(Ok(Err(e))) => {
                error!("Background recompilation of rule {} failed: {}", rule_id, e);
                self.metrics.record_failed().await;
                return true;
            }
            Ok(Err(_)) => {
                error!(
                    "Background recompilation of rule {} timed out after {:?}",
                    rule_id, timeout
                );
                self.metrics.record_timeout().await;
                return true;
            }
            Err(panic) => {
                error!(
                    "Background recompilation of rule {} panicked: {}",
                    rule_id,
                    panic_message(panic)
                );
                self.metrics.record_panic().await;
                return true;
            }
        };

        let timeout = self.config.resync_timeout();
        let delivery = tokio::time::timeout(timeout, self.pipeline.resync(committed));

        match AssertUnwindSafe(delivery).catch_unwind().await {
            Ok(Ok(outcome)) => {
                debug!(
                    "Background recompilation of rule {} done: {} assignments",
                    rule_id, outcome.assignments
                );
                true
            }
            Ok(Err(_)) => {
                error!(
                    "Resync for rule {} timed out after {:?}; resyncing all machines next",
                    rule_id, timeout
                );
                self.metrics.record_timeout().await;
                false
            }
            Err(panic) => {
                error!(
                    "Resync for rule {} panicked: {}; resyncing all machines next",
                    rule_id,
                    panic_message(panic)
                );
                self.metrics.record_panic().await;
                false
            }
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
