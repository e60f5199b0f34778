//! Group membership resolution with a per-pass cache
//!
//! A [`MembershipResolver`] lives for exactly one compilation pass. It is
//! never shared between concurrent compilations, so a pass cannot pick up
//! membership cached by an unrelated pass. Within a pass every group is
//! looked up once, however many scopes (or rules, for batch passes)
//! reference it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::DirectoryStore;
use crate::types::{GroupId, PrincipalId, Scope, TargetType};

/// Statistics about cache performance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from the pass cache
    pub hits: usize,
    /// Lookups that went to the directory
    pub misses: usize,
    /// Referenced groups the directory does not know
    pub missing_groups: usize,
}

impl CacheStats {
    /// Calculates the cache hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Point-in-time membership of the groups a pass references
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipSnapshot {
    groups: HashMap<GroupId, BTreeSet<PrincipalId>>,
}

impl MembershipSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, handy for fixtures
    pub fn with_group<I, S>(mut self, group_id: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.insert(group_id, members.into_iter().map(Into::into).collect());
        self
    }

    pub fn insert(&mut self, group_id: impl Into<String>, members: BTreeSet<PrincipalId>) {
        self.groups.insert(group_id.into(), members);
    }

    /// Members of a group; `None` when the group was never resolved
    pub fn members(&self, group_id: &str) -> Option<&BTreeSet<PrincipalId>> {
        self.groups.get(group_id)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Resolves group ids to member user ids for one compilation pass
pub struct MembershipResolver {
    directory: Arc<dyn DirectoryStore>,
    cache: HashMap<GroupId, BTreeSet<PrincipalId>>,
    stats: CacheStats,
}

impl MembershipResolver {
    /// Start a new pass with an empty cache
    pub fn new(directory: Arc<dyn DirectoryStore>) -> Self {
        Self {
            directory,
            cache: HashMap::new(),
            stats: CacheStats::default(),
        }
    }

    /// Current members of a group
    ///
    /// A group the directory does not know resolves to the empty set.
    ///
    /// # Errors
    ///
    /// Propagates directory failures other than "not found", so a transient
    /// outage never compiles a group down to zero members.
    pub async fn resolve(&mut self, group_id: &str) -> Result<BTreeSet<PrincipalId>> {
        if let Some(members) = self.cache.get(group_id) {
            self.stats.hits += 1;
            return Ok(members.clone());
        }

        self.stats.misses += 1;
        let members: BTreeSet<PrincipalId> =
            match self.directory.list_group_member_ids(group_id).await? {
                Some(ids) => ids.into_iter().collect(),
                None => {
                    warn!("Group {} is referenced by a scope but does not exist; treating as empty", group_id);
                    self.stats.missing_groups += 1;
                    BTreeSet::new()
                }
            };

        debug!("Resolved group {} to {} members", group_id, members.len());
        self.cache.insert(group_id.to_string(), members.clone());
        Ok(members)
    }

    /// Resolve every group referenced by the scopes into a snapshot
    pub async fn snapshot_for(&mut self, scopes: &[Scope]) -> Result<MembershipSnapshot> {
        let groups: BTreeSet<&str> = scopes
            .iter()
            .filter(|s| s.target_type == TargetType::Group)
            .map(|s| s.target_id.as_str())
            .collect();

        let mut snapshot = MembershipSnapshot::new();
        for group_id in groups {
            let members = self.resolve(group_id).await?;
            snapshot.insert(group_id, members);
        }

        Ok(snapshot)
    }

    /// Cache statistics for this pass
    pub fn stats(&self) -> CacheStats {
        self.stats.clone()
    }
}
