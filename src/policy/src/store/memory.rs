//! In-memory implementation of every store interface
//!
//! Backs the operator CLI and the test suites. Compiled assignment sets are
//! held as `Arc<Vec<_>>` and swapped under a write lock, so a reader always
//! sees one whole generation.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{PolicyError, Result};
use crate::guard::{check_mode_change, check_scope_action};
use crate::store::{AssignmentStore, DirectoryStore, ResyncSink, RuleRepository, RuleStore};
use crate::types::{
    CompiledAssignment, GroupId, PrincipalId, ResyncTarget, Rule, RuleId, Scope, TargetType,
};

/// Serializable point-in-time content of a store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub rules: Vec<Rule>,

    #[serde(default)]
    pub scopes: Vec<Scope>,

    /// Group id to member user ids
    #[serde(default)]
    pub groups: BTreeMap<GroupId, Vec<PrincipalId>>,
}

#[derive(Default)]
struct Policies {
    rules: HashMap<RuleId, Rule>,
    scopes: HashMap<RuleId, Vec<Scope>>,
}

/// In-memory policy, directory, assignment and resync store
pub struct MemoryStore {
    policies: Arc<RwLock<Policies>>,
    groups: Arc<RwLock<HashMap<GroupId, BTreeSet<PrincipalId>>>>,
    assignments: Arc<RwLock<HashMap<RuleId, Arc<Vec<CompiledAssignment>>>>>,
    resyncs: Mutex<Vec<ResyncTarget>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            policies: Arc::new(RwLock::new(Policies::default())),
            groups: Arc::new(RwLock::new(HashMap::new())),
            assignments: Arc::new(RwLock::new(HashMap::new())),
            resyncs: Mutex::new(Vec::new()),
        }
    }

    /// Load a snapshot, enforcing identifier and scope uniqueness
    pub async fn from_snapshot(snapshot: Snapshot) -> Result<Self> {
        let store = Self::new();

        for rule in snapshot.rules {
            store.insert_rule(rule).await?;
        }

        for scope in snapshot.scopes {
            if store.get_rule(&scope.rule_id).await?.is_none() {
                return Err(PolicyError::RuleNotFound(scope.rule_id));
            }
            store.insert_scope(scope).await?;
        }

        for (group_id, members) in snapshot.groups {
            store.set_group_members(&group_id, members).await;
        }

        Ok(store)
    }

    /// Replace a group's membership, creating the group if needed
    pub async fn set_group_members<I, S>(&self, group_id: &str, members: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let members = members.into_iter().map(Into::into).collect();
        self.groups.write().await.insert(group_id.to_string(), members);
    }

    /// Add a user to a group, creating the group if needed
    pub async fn add_group_member(&self, group_id: &str, user_id: &str) {
        self.groups
            .write()
            .await
            .entry(group_id.to_string())
            .or_default()
            .insert(user_id.to_string());
    }

    /// Remove a user from a group
    pub async fn remove_group_member(&self, group_id: &str, user_id: &str) {
        if let Some(members) = self.groups.write().await.get_mut(group_id) {
            members.remove(user_id);
        }
    }

    /// Delete a group entirely
    pub async fn delete_group(&self, group_id: &str) {
        self.groups.write().await.remove(group_id);
    }

    /// Resync requests received so far, in arrival order
    pub fn resync_requests(&self) -> Vec<ResyncTarget> {
        self.resyncs.lock().clone()
    }

    /// Drain the received resync requests
    pub fn take_resync_requests(&self) -> Vec<ResyncTarget> {
        std::mem::take(&mut *self.resyncs.lock())
    }

    /// Every rule id currently stored, sorted
    pub async fn rule_ids(&self) -> Vec<RuleId> {
        let mut ids: Vec<RuleId> = self.policies.read().await.rules.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn get_rule(&self, rule_id: &str) -> Result<Option<Rule>> {
        Ok(self.policies.read().await.rules.get(rule_id).cloned())
    }

    async fn list_scopes(&self, rule_id: &str) -> Result<Vec<Scope>> {
        Ok(self
            .policies
            .read()
            .await
            .scopes
            .get(rule_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_rules_targeting_group(&self, group_id: &str) -> Result<Vec<RuleId>> {
        let policies = self.policies.read().await;
        let mut rule_ids: Vec<RuleId> = policies
            .scopes
            .iter()
            .filter(|(_, scopes)| {
                scopes
                    .iter()
                    .any(|s| s.target_type == TargetType::Group && s.target_id == group_id)
            })
            .map(|(rule_id, _)| rule_id.clone())
            .collect();
        rule_ids.sort();
        Ok(rule_ids)
    }
}

#[async_trait]
impl DirectoryStore for MemoryStore {
    async fn list_group_member_ids(&self, group_id: &str) -> Result<Option<Vec<PrincipalId>>> {
        Ok(self
            .groups
            .read()
            .await
            .get(group_id)
            .map(|members| members.iter().cloned().collect()))
    }
}

#[async_trait]
impl AssignmentStore for MemoryStore {
    async fn replace_assignments(
        &self,
        rule_id: &str,
        assignments: Vec<CompiledAssignment>,
    ) -> Result<Vec<CompiledAssignment>> {
        let mut all = self.assignments.write().await;
        let previous = if assignments.is_empty() {
            all.remove(rule_id)
        } else {
            all.insert(rule_id.to_string(), Arc::new(assignments))
        };

        Ok(previous.map(|set| set.as_ref().clone()).unwrap_or_default())
    }

    async fn list_assignments(&self, rule_id: &str) -> Result<Vec<CompiledAssignment>> {
        Ok(self
            .assignments
            .read()
            .await
            .get(rule_id)
            .map(|set| set.as_ref().clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl ResyncSink for MemoryStore {
    async fn request_resync_for_user(&self, user_id: &str) -> Result<()> {
        self.resyncs.lock().push(ResyncTarget::User(user_id.to_string()));
        Ok(())
    }

    async fn request_resync_for_group(&self, group_id: &str) -> Result<()> {
        self.resyncs.lock().push(ResyncTarget::Group(group_id.to_string()));
        Ok(())
    }

    async fn request_resync_all(&self) -> Result<()> {
        self.resyncs.lock().push(ResyncTarget::All);
        Ok(())
    }
}

#[async_trait]
impl RuleRepository for MemoryStore {
    async fn find_rule_by_identifier(&self, identifier: &str) -> Result<Option<Rule>> {
        Ok(self
            .policies
            .read()
            .await
            .rules
            .values()
            .find(|r| r.identifier.eq_ignore_ascii_case(identifier))
            .cloned())
    }

    async fn insert_rule(&self, rule: Rule) -> Result<()> {
        let mut policies = self.policies.write().await;

        if policies.rules.contains_key(&rule.id) {
            return Err(PolicyError::InvalidInput(format!("rule {} already exists", rule.id)));
        }
        if policies
            .rules
            .values()
            .any(|r| r.identifier.eq_ignore_ascii_case(&rule.identifier))
        {
            return Err(PolicyError::DuplicateIdentifier(rule.identifier));
        }

        policies.rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    async fn update_rule(&self, rule: Rule) -> Result<()> {
        let mut policies = self.policies.write().await;

        let Some(current) = policies.rules.get(&rule.id) else {
            return Err(PolicyError::RuleNotFound(rule.id));
        };
        let scopes = policies.scopes.get(&rule.id).map_or(&[][..], Vec::as_slice);
        check_mode_change(current, &rule, scopes)?;
        if policies
            .rules
            .values()
            .any(|r| r.id != rule.id && r.identifier.eq_ignore_ascii_case(&rule.identifier))
        {
            return Err(PolicyError::DuplicateIdentifier(rule.identifier));
        }

        policies.rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    async fn delete_rule(&self, rule_id: &str) -> Result<bool> {
        let mut policies = self.policies.write().await;
        policies.scopes.remove(rule_id);
        Ok(policies.rules.remove(rule_id).is_some())
    }

    async fn insert_scope(&self, scope: Scope) -> Result<()> {
        let mut policies = self.policies.write().await;

        let Some(rule) = policies.rules.get(&scope.rule_id) else {
            return Err(PolicyError::RuleNotFound(scope.rule_id));
        };
        check_scope_action(rule, &scope)?;

        let scopes = policies.scopes.entry(scope.rule_id.clone()).or_default();
        if scopes.iter().any(|s| s.same_target(&scope)) {
            return Err(PolicyError::DuplicateScope {
                rule_id: scope.rule_id.clone(),
                target: scope.target(),
            });
        }

        scopes.push(scope);
        Ok(())
    }

    async fn delete_scope(&self, rule_id: &str, scope_id: &str) -> Result<bool> {
        let mut policies = self.policies.write().await;
        let Some(scopes) = policies.scopes.get_mut(rule_id) else {
            return Ok(false);
        };

        let before = scopes.len();
        scopes.retain(|s| s.id != scope_id);
        Ok(scopes.len() != before)
    }
}
