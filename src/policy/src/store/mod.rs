//! Interfaces consumed from the persistence and directory layers
//!
//! The compiler reads rules, scopes and group membership and writes only
//! compiled assignments. Every writer of compiled assignments goes through
//! [`AssignmentStore::replace_assignments`], which swaps a rule's whole set
//! in one unit.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{CompiledAssignment, PrincipalId, Rule, RuleId, Scope};

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::{MemoryStore, Snapshot};

#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

/// Read-only view over rules and their scopes
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Get a rule by id
    async fn get_rule(&self, rule_id: &str) -> Result<Option<Rule>>;

    /// List the scopes declared on a rule
    async fn list_scopes(&self, rule_id: &str) -> Result<Vec<Scope>>;

    /// List the rules with at least one scope targeting the group
    async fn list_rules_targeting_group(&self, group_id: &str) -> Result<Vec<RuleId>>;
}

/// Group membership lookups
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    /// Current member user ids of a group, `None` if the group does not exist
    async fn list_group_member_ids(&self, group_id: &str) -> Result<Option<Vec<PrincipalId>>>;
}

/// Durable compiled assignment storage
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    /// Atomically replace a rule's assignments, returning the previous set
    ///
    /// Readers observe either the full previous set or the full new one.
    /// On error the previous set stays in place.
    async fn replace_assignments(
        &self,
        rule_id: &str,
        assignments: Vec<CompiledAssignment>,
    ) -> Result<Vec<CompiledAssignment>>;

    /// Current assignments of a rule
    async fn list_assignments(&self, rule_id: &str) -> Result<Vec<CompiledAssignment>>;
}

/// Fire-and-forget forced resync requests
#[async_trait]
pub trait ResyncSink: Send + Sync {
    /// Resync the machines of one user
    async fn request_resync_for_user(&self, user_id: &str) -> Result<()>;

    /// Resync the machines of every member of a group
    async fn request_resync_for_group(&self, group_id: &str) -> Result<()>;

    /// Resync every machine
    async fn request_resync_all(&self) -> Result<()>;
}

/// Rule and scope writes, used by the service facade
#[async_trait]
pub trait RuleRepository: RuleStore {
    /// Find the rule governing an identifier, compared case-insensitively
    async fn find_rule_by_identifier(&self, identifier: &str) -> Result<Option<Rule>>;

    /// Insert a rule; fails on a duplicate identifier
    async fn insert_rule(&self, rule: Rule) -> Result<()>;

    /// Replace a stored rule
    async fn update_rule(&self, rule: Rule) -> Result<()>;

    /// Delete a rule and its scopes; returns whether it existed
    async fn delete_rule(&self, rule_id: &str) -> Result<bool>;

    /// Insert a scope; fails if the target already has a scope on the rule
    async fn insert_scope(&self, scope: Scope) -> Result<()>;

    /// Delete a scope; returns whether it existed
    async fn delete_scope(&self, rule_id: &str, scope_id: &str) -> Result<bool>;
}
