//! Core policy types
//!
//! Rules and scopes are owned by the CRUD and directory layers and are only
//! read here. [`CompiledAssignment`] is the derived, principal-level state
//! the compiler owns end to end.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique rule identifier
pub type RuleId = String;

/// Unique scope identifier
pub type ScopeId = String;

/// Directory user identifier
pub type PrincipalId = String;

/// Directory group identifier
pub type GroupId = String;

/// Kind of artifact a rule governs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    /// SHA-256 of the binary
    Binary,
    /// SHA-256 of the leaf signing certificate
    Certificate,
    /// `TEAMID:bundle.id` signing identifier
    SigningId,
    /// Apple developer team id
    TeamId,
    /// Code directory hash
    Cdhash,
}

/// Rule-level metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMetadata {
    /// Free-text description
    #[serde(default)]
    pub description: String,

    /// Message shown on the endpoint when the rule blocks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_message: Option<String>,

    /// Route evaluation through `expression` instead of a fixed action.
    /// Once set it can never be cleared.
    #[serde(default)]
    pub dynamic: bool,

    /// CEL expression evaluated on the endpoint in dynamic mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

/// Authorization rule keyed by an artifact identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique rule identifier
    pub id: RuleId,

    /// Display name
    pub name: String,

    /// Artifact kind
    pub rule_type: RuleType,

    /// Governed artifact (hash, signing id, ...). Unique across rules,
    /// compared case-insensitively.
    pub identifier: String,

    /// Disabled rules are still compiled; endpoints ignore them
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Description, block message and dynamic mode settings
    #[serde(default)]
    pub metadata: RuleMetadata,
}

fn default_enabled() -> bool {
    true
}

impl Rule {
    /// Create an enabled, non-dynamic rule with a fresh id
    pub fn new(
        name: impl Into<String>,
        rule_type: RuleType,
        identifier: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            rule_type,
            identifier: identifier.into(),
            enabled: true,
            metadata: RuleMetadata::default(),
        }
    }

    /// Override the generated id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Switch the rule to dynamic mode with the given expression
    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.metadata.dynamic = true;
        self.metadata.expression = Some(expression.into());
        self
    }

    /// Set the block message
    pub fn with_block_message(mut self, message: impl Into<String>) -> Self {
        self.metadata.block_message = Some(message.into());
        self
    }

    /// Whether the rule routes evaluation through its expression
    pub fn is_dynamic(&self) -> bool {
        self.metadata.dynamic
    }
}

/// What a scope points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    /// A single directory user
    User,
    /// Every member of a directory group
    Group,
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Group => write!(f, "group"),
        }
    }
}

/// Action a scope applies to its target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeAction {
    /// Allow execution
    Allow,
    /// Block execution
    Block,
    /// Defer to the rule's expression; only legal on dynamic rules
    Dynamic,
}

impl ScopeAction {
    /// Rank used to settle conflicts between group scopes: higher wins
    pub fn restrictiveness(self) -> u8 {
        match self {
            Self::Allow => 0,
            Self::Dynamic => 1,
            Self::Block => 2,
        }
    }
}

impl fmt::Display for ScopeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Block => write!(f, "block"),
            Self::Dynamic => write!(f, "dynamic"),
        }
    }
}

/// Binding of a rule to a user or group with an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    /// Unique scope identifier
    pub id: ScopeId,

    /// Owning rule
    pub rule_id: RuleId,

    /// User or group
    pub target_type: TargetType,

    /// User id or group id
    pub target_id: String,

    /// Action for the target
    pub action: ScopeAction,

    /// Creation time
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Scope {
    /// Create a scope with a fresh id
    pub fn new(
        rule_id: impl Into<String>,
        target_type: TargetType,
        target_id: impl Into<String>,
        action: ScopeAction,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            rule_id: rule_id.into(),
            target_type,
            target_id: target_id.into(),
            action,
            created_at: Utc::now(),
        }
    }

    /// Scope targeting a single user
    pub fn user(rule_id: impl Into<String>, user_id: impl Into<String>, action: ScopeAction) -> Self {
        Self::new(rule_id, TargetType::User, user_id, action)
    }

    /// Scope targeting every member of a group
    pub fn group(rule_id: impl Into<String>, group_id: impl Into<String>, action: ScopeAction) -> Self {
        Self::new(rule_id, TargetType::Group, group_id, action)
    }

    /// Whether two scopes bind the same target on the same rule
    pub fn same_target(&self, other: &Scope) -> bool {
        self.rule_id == other.rule_id
            && self.target_type == other.target_type
            && self.target_id == other.target_id
    }

    /// Render the target as `type:id`
    pub fn target(&self) -> String {
        format!("{}:{}", self.target_type, self.target_id)
    }
}

/// How a principal came to hold an assignment
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Provenance {
    /// A user scope naming the principal directly
    Direct,
    /// Membership in a group named by a group scope
    Group {
        /// The group the principal was reached through
        group_id: GroupId,
    },
}

/// Derived, principal-level resolution of a rule's scopes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompiledAssignment {
    /// Rule the assignment belongs to
    pub rule_id: RuleId,

    /// Directory user holding the assignment
    pub principal_id: PrincipalId,

    /// Effective action
    pub action: ScopeAction,

    /// Direct or via a group
    pub provenance: Provenance,
}

impl CompiledAssignment {
    /// Assignment from a direct user scope
    pub fn direct(rule_id: impl Into<String>, principal_id: impl Into<String>, action: ScopeAction) -> Self {
        Self {
            rule_id: rule_id.into(),
            principal_id: principal_id.into(),
            action,
            provenance: Provenance::Direct,
        }
    }

    /// Assignment reached through group membership
    pub fn via_group(
        rule_id: impl Into<String>,
        principal_id: impl Into<String>,
        action: ScopeAction,
        group_id: impl Into<String>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            principal_id: principal_id.into(),
            action,
            provenance: Provenance::Group {
                group_id: group_id.into(),
            },
        }
    }

    /// Group the assignment was reached through, if any
    pub fn group_id(&self) -> Option<&str> {
        match &self.provenance {
            Provenance::Direct => None,
            Provenance::Group { group_id } => Some(group_id),
        }
    }
}

/// Key of a forced ("clean") resync request
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ResyncTarget {
    /// Machines of one user
    User(PrincipalId),
    /// Machines of every member of a group
    Group(GroupId),
    /// Every enrolled machine
    All,
}

impl fmt::Display for ResyncTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{}", id),
            Self::Group(id) => write!(f, "group:{}", id),
            Self::All => write!(f, "all"),
        }
    }
}
