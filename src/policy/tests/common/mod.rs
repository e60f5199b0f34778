//! Shared fixtures for the integration suites

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use warden_policy::config::SchedulerSection;
use warden_policy::{
    AssignmentStore, CompiledAssignment, DirectoryStore, ExpressionValidator, MemoryStore,
    PolicyError, PolicyService, PrincipalId, RecompilationScheduler, RecompilePipeline, ResyncSink,
    Result, Rule, RuleId, RuleStore, Scope,
};

/// Scheduler settings small enough for tests
pub fn fast_config() -> SchedulerSection {
    SchedulerSection {
        coalesce_window_ms: 20,
        compile_timeout_ms: 2_000,
        resync_timeout_ms: 2_000,
        max_concurrent: 4,
        idle_retire_ms: 5_000,
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warden_policy=debug")
        .with_test_writer()
        .try_init();
}

/// [`MemoryStore`] wrapper with switchable faults and call accounting
pub struct FaultyStore {
    pub inner: Arc<MemoryStore>,
    pub fail_replace: AtomicBool,
    pub fail_resync: AtomicBool,
    pub fail_directory: AtomicBool,
    directory_delay: Mutex<Duration>,
    resync_delay: Mutex<Duration>,
    slow_resyncs: AtomicUsize,
    panic_group: Mutex<Option<String>>,
    pub directory_lookups: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FaultyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(MemoryStore::new()),
            fail_replace: AtomicBool::new(false),
            fail_resync: AtomicBool::new(false),
            fail_directory: AtomicBool::new(false),
            directory_delay: Mutex::new(Duration::ZERO),
            resync_delay: Mutex::new(Duration::ZERO),
            slow_resyncs: AtomicUsize::new(0),
            panic_group: Mutex::new(None),
            directory_lookups: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    /// Make every directory lookup take this long
    pub fn set_directory_delay(&self, delay: Duration) {
        *self.directory_delay.lock() = delay;
    }

    /// Make the next `calls` resync requests take this long
    pub fn slow_down_resync(&self, delay: Duration, calls: usize) {
        *self.resync_delay.lock() = delay;
        self.slow_resyncs.store(calls, Ordering::SeqCst);
    }

    async fn resync_fault(&self) -> Result<()> {
        let slow = self
            .slow_resyncs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if slow {
            let delay = *self.resync_delay.lock();
            tokio::time::sleep(delay).await;
        }

        if self.fail_resync.load(Ordering::SeqCst) {
            return Err(PolicyError::Dispatch("queue unavailable".into()));
        }
        Ok(())
    }

    /// Panic when this group is looked up
    pub fn panic_on_group(&self, group_id: Option<&str>) {
        *self.panic_group.lock() = group_id.map(str::to_string);
    }

    pub fn lookups(&self) -> usize {
        self.directory_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuleStore for FaultyStore {
    async fn get_rule(&self, rule_id: &str) -> Result<Option<Rule>> {
        self.inner.get_rule(rule_id).await
    }

    async fn list_scopes(&self, rule_id: &str) -> Result<Vec<Scope>> {
        self.inner.list_scopes(rule_id).await
    }

    async fn list_rules_targeting_group(&self, group_id: &str) -> Result<Vec<RuleId>> {
        self.inner.list_rules_targeting_group(group_id).await
    }
}

#[async_trait]
impl DirectoryStore for FaultyStore {
    async fn list_group_member_ids(&self, group_id: &str) -> Result<Option<Vec<PrincipalId>>> {
        self.directory_lookups.fetch_add(1, Ordering::SeqCst);

        if self.panic_group.lock().as_deref() == Some(group_id) {
            panic!("directory exploded on {}", group_id);
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.directory_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_directory.load(Ordering::SeqCst) {
            return Err(PolicyError::Storage("directory unavailable".into()));
        }
        self.inner.list_group_member_ids(group_id).await
    }
}

#[async_trait]
impl AssignmentStore for FaultyStore {
    async fn replace_assignments(
        &self,
        rule_id: &str,
        assignments: Vec<CompiledAssignment>,
    ) -> Result<Vec<CompiledAssignment>> {
        if self.fail_replace.load(Ordering::SeqCst) {
            return Err(PolicyError::Storage("write failed".into()));
        }
        self.inner.replace_assignments(rule_id, assignments).await
    }

    async fn list_assignments(&self, rule_id: &str) -> Result<Vec<CompiledAssignment>> {
        self.inner.list_assignments(rule_id).await
    }
}

#[async_trait]
impl ResyncSink for FaultyStore {
    async fn request_resync_for_user(&self, user_id: &str) -> Result<()> {
        self.resync_fault().await?;
        self.inner.request_resync_for_user(user_id).await
    }

    async fn request_resync_for_group(&self, group_id: &str) -> Result<()> {
        self.resync_fault().await?;
        self.inner.request_resync_for_group(group_id).await
    }

    async fn request_resync_all(&self) -> Result<()> {
        self.resync_fault().await?;
        self.inner.request_resync_all().await
    }
}

/// Pipeline and scheduler over a faulty store
pub fn faulty_scheduler(
    store: &Arc<FaultyStore>,
    config: SchedulerSection,
) -> RecompilationScheduler {
    let pipeline = Arc::new(RecompilePipeline::from_store(store.clone(), 100));
    RecompilationScheduler::new(pipeline, config).unwrap()
}

/// Service, scheduler and store wired the way a deployment would be
pub fn service() -> (PolicyService, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let pipeline = Arc::new(RecompilePipeline::from_store(store.clone(), 100));
    let scheduler = RecompilationScheduler::new(pipeline, fast_config()).unwrap();
    let validator = Arc::new(ExpressionValidator::new(4096).unwrap());

    (PolicyService::new(store.clone(), validator, scheduler), store)
}
