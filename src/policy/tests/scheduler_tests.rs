//! Background scheduling tests: per-rule serialization, coalescing,
//! last-trigger-wins and containment of failing passes.

mod common;

use common::{fast_config, faulty_scheduler, init_tracing, FaultyStore};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::sleep;

use warden_policy::config::SchedulerSection;
use warden_policy::{
    AssignmentStore, Rule, RuleRepository, RuleType, Scope, ScopeAction, TriggerKind,
};

async fn seed_rule(store: &FaultyStore, rule_id: &str, group_id: &str) {
    store
        .inner
        .insert_rule(Rule::new("rule", RuleType::Binary, format!("hash-{}", rule_id)).with_id(rule_id))
        .await
        .unwrap();
    store
        .inner
        .insert_scope(Scope::group(rule_id, group_id, ScopeAction::Allow))
        .await
        .unwrap();
    store.inner.set_group_members(group_id, ["alice", "bob"]).await;
}

// ============================================================================
// SERIALIZATION
// ============================================================================

#[tokio::test]
async fn test_one_pass_in_flight_per_rule() {
    init_tracing();
    let store = FaultyStore::new();
    seed_rule(&store, "r1", "eng").await;
    store.set_directory_delay(Duration::from_millis(60));
    let scheduler = faulty_scheduler(&store, fast_config());

    for _ in 0..20 {
        scheduler.schedule_with("r1", TriggerKind::ScopeChanged);
        sleep(Duration::from_millis(10)).await;
    }
    scheduler.settled().await;

    assert_eq!(store.max_in_flight.load(Ordering::SeqCst), 1);

    let metrics = scheduler.metrics().await;
    assert_eq!(metrics.triggers, 20);
    assert!(metrics.completed < 20, "bursts should coalesce");
    assert_eq!(metrics.completed + metrics.coalesced, 20);
}

#[tokio::test]
async fn test_trigger_during_pass_reruns_with_latest_state() {
    let store = FaultyStore::new();
    seed_rule(&store, "r1", "eng").await;
    store.set_directory_delay(Duration::from_millis(100));
    let scheduler = faulty_scheduler(&store, fast_config());

    scheduler.schedule_with("r1", TriggerKind::ScopeChanged);

    // First pass is now blocked in the directory lookup
    sleep(Duration::from_millis(60)).await;
    store
        .inner
        .insert_scope(Scope::user("r1", "carol", ScopeAction::Block))
        .await
        .unwrap();
    scheduler.schedule_with("r1", TriggerKind::ScopeChanged);

    scheduler.settled().await;

    let assignments = store.list_assignments("r1").await.unwrap();
    let principals: Vec<&str> = assignments.iter().map(|a| a.principal_id.as_str()).collect();
    assert_eq!(principals, vec!["alice", "bob", "carol"]);
    assert_eq!(scheduler.metrics().await.completed, 2);
}

#[tokio::test]
async fn test_different_rules_run_in_parallel() {
    let store = FaultyStore::new();
    seed_rule(&store, "r1", "eng").await;
    seed_rule(&store, "r2", "ops").await;
    store.set_directory_delay(Duration::from_millis(150));
    let scheduler = faulty_scheduler(&store, fast_config());

    scheduler.schedule("r1");
    scheduler.schedule("r2");
    scheduler.settled().await;

    assert_eq!(store.max_in_flight.load(Ordering::SeqCst), 2);
    assert_eq!(store.list_assignments("r2").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_concurrency_limit_is_respected() {
    let store = FaultyStore::new();
    for i in 0..6 {
        seed_rule(&store, &format!("r{}", i), &format!("g{}", i)).await;
    }
    store.set_directory_delay(Duration::from_millis(80));
    let scheduler = faulty_scheduler(
        &store,
        SchedulerSection {
            max_concurrent: 2,
            ..fast_config()
        },
    );

    for i in 0..6 {
        scheduler.schedule(&format!("r{}", i));
    }
    scheduler.settled().await;

    assert_eq!(store.max_in_flight.load(Ordering::SeqCst), 2);
    assert_eq!(scheduler.metrics().await.completed, 6);
}

// ============================================================================
// FAILURE CONTAINMENT
// ============================================================================

#[tokio::test]
async fn test_failed_pass_is_contained() {
    let store = FaultyStore::new();
    seed_rule(&store, "r1", "eng").await;
    let scheduler = faulty_scheduler(&store, fast_config());

    store.fail_replace.store(true, Ordering::SeqCst);
    scheduler.schedule("r1");
    scheduler.settled().await;

    assert_eq!(scheduler.metrics().await.failed, 1);
    assert!(store.list_assignments("r1").await.unwrap().is_empty());

    // The same worker keeps serving the rule
    store.fail_replace.store(false, Ordering::SeqCst);
    scheduler.schedule("r1");
    scheduler.settled().await;

    assert_eq!(store.list_assignments("r1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_panicking_pass_is_contained() {
    let store = FaultyStore::new();
    seed_rule(&store, "r1", "eng").await;
    let scheduler = faulty_scheduler(&store, fast_config());

    store.panic_on_group(Some("eng"));
    scheduler.schedule("r1");
    scheduler.settled().await;
    assert_eq!(scheduler.metrics().await.panics, 1);

    store.panic_on_group(None);
    scheduler.schedule("r1");
    scheduler.settled().await;

    assert_eq!(store.list_assignments("r1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_hung_pass_times_out_and_keeps_previous_set() {
    let store = FaultyStore::new();
    seed_rule(&store, "r1", "eng").await;
    let scheduler = faulty_scheduler(
        &store,
        SchedulerSection {
            compile_timeout_ms: 100,
            ..fast_config()
        },
    );

    scheduler.schedule("r1");
    scheduler.settled().await;
    assert_eq!(store.list_assignments("r1").await.unwrap().len(), 2);

    store.inner.add_group_member("eng", "carol").await;
    store.set_directory_delay(Duration::from_millis(400));
    scheduler.schedule("r1");
    scheduler.settled().await;

    assert_eq!(scheduler.metrics().await.timeouts, 1);
    assert_eq!(store.list_assignments("r1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_slow_resync_does_not_count_against_compile_timeout() {
    let store = FaultyStore::new();
    seed_rule(&store, "r1", "eng").await;
    store.slow_down_resync(Duration::from_millis(400), 1);
    let scheduler = faulty_scheduler(
        &store,
        SchedulerSection {
            compile_timeout_ms: 100,
            ..fast_config()
        },
    );

    scheduler.schedule_with("r1", TriggerKind::ScopeChanged);
    scheduler.settled().await;

    assert_eq!(store.list_assignments("r1").await.unwrap().len(), 2);
    assert_eq!(
        store.inner.resync_requests(),
        vec![warden_policy::ResyncTarget::Group("eng".into())]
    );
    assert_eq!(scheduler.metrics().await.timeouts, 0);
}

#[tokio::test]
async fn test_undelivered_resync_escalates_to_all_machines() {
    let store = FaultyStore::new();
    seed_rule(&store, "r1", "eng").await;
    store.slow_down_resync(Duration::from_millis(400), 1);
    let scheduler = faulty_scheduler(
        &store,
        SchedulerSection {
            resync_timeout_ms: 100,
            ..fast_config()
        },
    );

    scheduler.schedule_with("r1", TriggerKind::ScopeChanged);
    scheduler.settled().await;

    // The new set was committed before delivery timed out
    assert_eq!(store.list_assignments("r1").await.unwrap().len(), 2);
    assert_eq!(
        store.inner.resync_requests(),
        vec![warden_policy::ResyncTarget::All]
    );

    let metrics = scheduler.metrics().await;
    assert_eq!(metrics.timeouts, 1);
    assert_eq!(metrics.completed, 2);
}

// ============================================================================
// QUIESCENCE
// ============================================================================

#[tokio::test]
async fn test_settled_returns_immediately_when_idle() {
    let store = FaultyStore::new();
    let scheduler = faulty_scheduler(&store, fast_config());

    tokio::time::timeout(Duration::from_millis(100), scheduler.settled())
        .await
        .unwrap();
    assert!(scheduler.is_idle());
}

#[tokio::test]
async fn test_disable_resyncs_all_machines() {
    let store = FaultyStore::new();
    seed_rule(&store, "r1", "eng").await;
    let scheduler = faulty_scheduler(&store, fast_config());

    scheduler.schedule_with("r1", TriggerKind::ScopeChanged);
    scheduler.settled().await;
    store.inner.take_resync_requests();

    // A disable coalesced with a scope change still reaches every machine
    scheduler.schedule_with("r1", TriggerKind::ScopeChanged);
    scheduler.schedule_with("r1", TriggerKind::RuleDisabled);
    scheduler.settled().await;

    assert_eq!(
        store.inner.resync_requests(),
        vec![warden_policy::ResyncTarget::All]
    );
}
