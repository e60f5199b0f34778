//! Scope-to-assignment compiler
//!
//! Pure, in-memory expansion of a rule's scopes into principal-level
//! assignments:
//!
//! 1. every user scope yields a direct assignment;
//! 2. every group scope yields a via-group assignment for each member not
//!    already covered by a direct user scope on the same rule;
//! 3. a principal reached through several group scopes gets the most
//!    restrictive action (`block` > `dynamic` > `allow`), ties keeping the
//!    lexicographically smallest group id.
//!
//! Disabled rules compile like enabled ones. Groups missing from the
//! membership snapshot contribute nothing. The output is sorted by
//! principal id and never holds two assignments for the same principal,
//! so compiling the same inputs in any order yields the same set.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::warn;

use crate::membership::MembershipSnapshot;
use crate::types::{
    CompiledAssignment, GroupId, PrincipalId, Provenance, Rule, Scope, ScopeAction, TargetType,
};


/// A rule's compiled assignments, sorted by principal id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentSet {
    assignments: Vec<CompiledAssignment>,
}

impl AssignmentSet {
    /// Canonicalize an arbitrary assignment list
    ///
    /// Sorts by principal. A principal listed more than once keeps the
    /// entry [`compile`] would have chosen: direct over via-group, then the
    /// most restrictive action, then the smallest group id.
    pub fn new(mut assignments: Vec<CompiledAssignment>) -> Self {
        assignments.sort_by(|a, b| {
            a.principal_id
                .cmp(&b.principal_id)
                .then_with(|| precedence(a, b))
        });
        assignments.dedup_by(|b, a| a.principal_id == b.principal_id);
        Self { assignments }
    }

    pub fn as_slice(&self) -> &[CompiledAssignment] {
        &self.assignments
    }

    pub fn into_vec(self) -> Vec<CompiledAssignment> {
        self.assignments
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Look up the assignment held by a principal
    pub fn get(&self, principal_id: &str) -> Option<&CompiledAssignment> {
        self.assignments
            .binary_search_by(|a| a.principal_id.as_str().cmp(principal_id))
            .ok()
            .map(|i| &self.assignments[i])
    }

    /// BLAKE3 fingerprint of the canonical encoding, hex encoded
    ///
    /// Equal sets have equal fingerprints.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for a in &self.assignments {
            hasher.update(a.rule_id.as_bytes());
            hasher.update(&[0]);
            hasher.update(a.principal_id.as_bytes());
            hasher.update(&[0]);
            hasher.update(a.action.to_string().as_bytes());
            hasher.update(&[0]);
            hasher.update(a.group_id().unwrap_or("").as_bytes());
            hasher.update(&[b'\n']);
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// Compile a rule's scopes against a membership snapshot
pub fn compile(rule: &Rule, scopes: &[Scope], membership: &MembershipSnapshot) -> AssignmentSet {
    let mut direct: BTreeMap<&str, ScopeAction> = BTreeMap::new();
    let mut group_scopes: Vec<&Scope> = Vec::new();

    for scope in scopes {
        if scope.rule_id != rule.id {
            warn!("Ignoring scope {} of rule {} while compiling rule {}", scope.id, scope.rule_id, rule.id);
            continue;
        }

        match scope.target_type {
            TargetType::User => {
                direct
                    .entry(scope.target_id.as_str())
                    .and_modify(|action| *action = most_restrictive(*action, scope.action))
                    .or_insert(scope.action);
            }
            TargetType::Group => group_scopes.push(scope),
        }
    }

    // Deterministic regardless of scope order
    group_scopes.sort_by(|a, b| a.target_id.cmp(&b.target_id).then(a.action.cmp(&b.action)));

    let mut via_group: BTreeMap<&str, (ScopeAction, &str)> = BTreeMap::new();
    for scope in group_scopes {
        let Some(members) = membership.members(&scope.target_id) else {
            continue;
        };

        for member in members {
            if direct.contains_key(member.as_str()) {
                continue;
            }

            via_group
                .entry(member.as_str())
                .and_modify(|(action, group)| {
                    if scope.action.restrictiveness() > action.restrictiveness() {
                        *action = scope.action;
                        *group = scope.target_id.as_str();
                    }
                })
                .or_insert((scope.action, scope.target_id.as_str()));
        }
    }

    let mut assignments = Vec::with_capacity(direct.len() + via_group.len());
    assignments.extend(
        direct
            .into_iter()
            .map(|(principal, action)| CompiledAssignment::direct(&rule.id, principal, action)),
    );
    assignments.extend(via_group.into_iter().map(|(principal, (action, group))| {
        CompiledAssignment::via_group(&rule.id, principal, action, group)
    }));
    assignments.sort_by(|a, b| a.principal_id.cmp(&b.principal_id));

    AssignmentSet { assignments }
}

/// Orders the winning assignment of a principal first
fn precedence(a: &CompiledAssignment, b: &CompiledAssignment) -> Ordering {
    let is_direct = |x: &CompiledAssignment| x.provenance == Provenance::Direct;

    is_direct(b)
        .cmp(&is_direct(a))
        .then_with(|| b.action.restrictiveness().cmp(&a.action.restrictiveness()))
        .then_with(|| a.group_id().cmp(&b.group_id()))
}

fn most_restrictive(a: ScopeAction, b: ScopeAction) -> ScopeAction {
    if b.restrictiveness() > a.restrictiveness() {
        b
    } else {
        a
    }
}

/// Per-principal difference between two generations of a rule's assignments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentDiff {
    /// Principals that gained an assignment
    pub added: Vec<CompiledAssignment>,
    /// Principals that lost their assignment
    pub removed: Vec<CompiledAssignment>,
    /// Principals whose action or provenance changed, as (before, after)
    pub changed: Vec<(CompiledAssignment, CompiledAssignment)>,
}

impl AssignmentDiff {
    /// Diff two assignment lists keyed by principal id
    pub fn between(previous: &[CompiledAssignment], next: &[CompiledAssignment]) -> Self {
        let before: BTreeMap<&PrincipalId, &CompiledAssignment> =
            previous.iter().map(|a| (&a.principal_id, a)).collect();
        let after: BTreeMap<&PrincipalId, &CompiledAssignment> =
            next.iter().map(|a| (&a.principal_id, a)).collect();

        let mut diff = Self::default();
        for (principal, new) in &after {
            match before.get(principal) {
                None => diff.added.push((*new).clone()),
                Some(old) if old.action != new.action || old.provenance != new.provenance => {
                    diff.changed.push(((*old).clone(), (*new).clone()));
                }
                Some(_) => {}
            }
        }
        for (principal, old) in &before {
            if !after.contains_key(principal) {
                diff.removed.push((*old).clone());
            }
        }

        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// Number of principals affected
    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.changed.len()
    }

    /// Groups that appear in any affected assignment, before or after
    pub fn groups(&self) -> Vec<GroupId> {
        let mut groups: Vec<GroupId> = self
            .added
            .iter()
            .chain(self.removed.iter())
            .chain(self.changed.iter().flat_map(|(a, b)| [a, b]))
            .filter_map(|a| a.group_id().map(str::to_string))
            .collect();
        groups.sort();
        groups.dedup();
        groups
    }
}
