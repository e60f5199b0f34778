//! # Warden Policy Compiler
//!
//! Compiles binary-authorization scopes into principal-level assignments
//! and keeps them current as rules, scopes and group membership change.
//!
//! ## Features
//!
//! - **Deterministic compilation** of user and group scopes with
//!   direct-over-group precedence
//! - **Per-pass membership caching**: one directory lookup per group
//! - **Atomic replacement** of each rule's assignment set
//! - **Background scheduling** with per-rule serialization and coalescing
//! - **Targeted resync** of affected endpoints, escalating to all machines
//! - **CEL validation** of dynamic-rule expressions at definition time
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use warden_policy::{
//!     CompilerConfig, ExpressionValidator, MemoryStore, PolicyService,
//!     RecompilationScheduler, RecompilePipeline, Rule, RuleType, Scope, ScopeAction,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CompilerConfig::default();
//!     let store = Arc::new(MemoryStore::new());
//!
//!     let pipeline = Arc::new(RecompilePipeline::from_store(store.clone(), config.resync.max_targeted));
//!     let scheduler = RecompilationScheduler::new(pipeline, config.scheduler.clone())?;
//!     let validator = Arc::new(ExpressionValidator::new(config.validator.max_expression_len)?);
//!     let service = PolicyService::new(store.clone(), validator, scheduler.clone());
//!
//!     let rule = service
//!         .create_rule(Rule::new("Block tool", RuleType::Binary, "deadbeef"))
//!         .await?;
//!     store.set_group_members("eng", ["alice", "bob"]).await;
//!     service.add_scope(Scope::group(&rule.id, "eng", ScopeAction::Block)).await?;
//!
//!     scheduler.settled().await;
//!     Ok(())
//! }
//! ```

pub mod cel;
pub mod compiler;
pub mod config;
pub mod definition;
pub mod error;
pub mod guard;
pub mod membership;
pub mod metrics;
pub mod pipeline;
pub mod replacer;
pub mod resync;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use cel::{ExpressionError, ExpressionValidator};
pub use compiler::{compile, AssignmentDiff, AssignmentSet};
pub use config::CompilerConfig;
pub use definition::{RuleDefinition, ScopeStoreAdapter};
pub use error::{PolicyError, Result};
pub use membership::{CacheStats, MembershipResolver, MembershipSnapshot};
pub use metrics::{CompilerMetrics, MetricsCollector};
pub use pipeline::{CommittedPass, RecompileOutcome, RecompilePipeline};
pub use replacer::{AssignmentReplacer, Replacement};
pub use resync::{BlastRadius, DispatchReport, ResyncDispatcher, ResyncPlan};
pub use scheduler::{RecompilationScheduler, TriggerKind};
pub use service::PolicyService;
pub use store::{
    AssignmentStore, DirectoryStore, MemoryStore, ResyncSink, RuleRepository, RuleStore, Snapshot,
};
pub use types::{
    CompiledAssignment, GroupId, PrincipalId, Provenance, ResyncTarget, Rule, RuleId, RuleMetadata,
    RuleType, Scope, ScopeAction, ScopeId, TargetType,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
