use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::authz::condition::Condition;
use crate::authz::errors::AuthzError;

pub type SubjectId = String;
pub type RoleId = String;
pub type PermissionId = String;

/// Breadth of a permission's applicability, from narrowest to broadest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Public,
    #[serde(rename = "self")]
    Own,
    Channel,
    Organization,
    Global,
}

impl Scope {
    pub const ALL: [Scope; 5] = [
        Scope::Global,
        Scope::Organization,
        Scope::Channel,
        Scope::Own,
        Scope::Public,
    ];

    pub fn breadth(self) -> u8 {
        match self {
            Scope::Public => 0,
            Scope::Own => 1,
            Scope::Channel => 2,
            Scope::Organization => 3,
            Scope::Global => 4,
        }
    }

    /// A permission granted at `self` applies to a request made at `requested`
    /// when it is at least as broad.
    pub fn covers(self, requested: Scope) -> bool {
        self.breadth() >= requested.breadth()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Public => "public",
            Scope::Own => "self",
            Scope::Channel => "channel",
            Scope::Organization => "organization",
            Scope::Global => "global",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = AuthzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Scope::Public),
            "self" => Ok(Scope::Own),
            "channel" => Ok(Scope::Channel),
            "organization" => Ok(Scope::Organization),
            "global" => Ok(Scope::Global),
            other => Err(AuthzError::InvalidPolicy(format!(
                "unknown scope `{other}` (expected global, organization, channel, self or public)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Effect::Allow => "allow",
            Effect::Deny => "deny",
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Effect {
    type Err = AuthzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Effect::Allow),
            "deny" => Ok(Effect::Deny),
            other => Err(AuthzError::InvalidPolicy(format!(
                "unknown effect `{other}` (expected allow or deny)"
            ))),
        }
    }
}

// ---------- Policy domain types ----------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub parent_id: Option<RoleId>,
    /// Depth in the hierarchy; a parent always has a lower level than its children.
    pub level: i32,
    /// System roles cannot be deleted.
    pub is_system: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permission {
    pub id: PermissionId,
    pub resource: String,
    pub action: String,
    pub scope: Scope,
    pub conditions: Option<Condition>,
}

impl Permission {
    /// Resource `"*"` matches any resource and is evaluated after exact rows.
    pub fn is_wildcard(&self) -> bool {
        self.resource == "*"
    }

    pub fn matches(&self, resource: &str, action: &str) -> bool {
        (self.is_wildcard() || self.resource == resource) && self.action == action
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RolePermission {
    pub role_id: RoleId,
    pub permission_id: PermissionId,
    pub effect: Effect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectRoleAssignment {
    pub subject_id: SubjectId,
    pub role_id: RoleId,
    pub valid_from: DateTime<Utc>,
    /// `None` means unbounded.
    pub valid_until: Option<DateTime<Utc>>,
}

impl SubjectRoleAssignment {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_from <= now && self.valid_until.is_none_or(|until| now < until)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectPermissionOverride {
    pub subject_id: SubjectId,
    pub permission_id: PermissionId,
    pub effect: Effect,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
}

impl SubjectPermissionOverride {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_from.is_none_or(|from| from <= now)
            && self.valid_until.is_none_or(|until| now < until)
    }
}

/// A role binding joined with the permission it grants.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleGrant {
    pub role_id: RoleId,
    pub effect: Effect,
    pub permission: Permission,
}

/// A subject override joined with the permission it targets.
#[derive(Debug, Clone, PartialEq)]
pub struct OverrideGrant {
    pub entry: SubjectPermissionOverride,
    pub permission: Permission,
}

// ---------- Evaluation context ----------

/// Attributes supplied by the caller for ABAC evaluation.
///
/// Attribute names are dot paths (`resource.channel`, `subject.department`). A
/// path is looked up first as a flat key, then by descending into nested objects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeContext {
    #[serde(default)]
    pub attributes: Map<String, Value>,
    /// Evaluation time for time-window conditions; the engine clock when absent.
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
}

impl AttributeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    pub fn lookup(&self, path: &str) -> Option<&Value> {
        if let Some(v) = self.attributes.get(path) {
            return Some(v);
        }
        let mut segments = path.split('.');
        let mut current = self.attributes.get(segments.next()?)?;
        for seg in segments {
            current = current.as_object()?.get(seg)?;
        }
        Some(current)
    }

    /// Flatten nested objects into dot-path keys.
    pub fn flatten(&self) -> Map<String, Value> {
        fn walk(prefix: &str, value: &Value, out: &mut Map<String, Value>) {
            match value {
                Value::Object(map) => {
                    for (k, v) in map {
                        walk(&format!("{prefix}.{k}"), v, out);
                    }
                }
                other => {
                    out.insert(prefix.to_string(), other.clone());
                }
            }
        }
        let mut out = Map::new();
        for (k, v) in &self.attributes {
            walk(k, v, &mut out);
        }
        out
    }
}

// ---------- Decisions ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Allowed,
    Denied,
    /// Denied because a configured remote evaluator was unavailable and the
    /// deployment fails closed in degraded mode.
    DeniedDegraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    RoleGrant,
    OverrideAllow,
    OverrideDeny,
    RoleDeny,
    NoMatchingPermission,
    ConditionsNotMet,
    RemoteDenied,
    RemoteUnavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub outcome: Outcome,
    pub matched_permission: Option<PermissionId>,
    pub reason: DecisionReason,
    /// Computed without confirmation from a remote evaluator that was expected.
    pub degraded: bool,
    pub evaluated_at: DateTime<Utc>,
}

impl Decision {
    pub fn allow(
        matched: PermissionId,
        reason: DecisionReason,
        evaluated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            allowed: true,
            outcome: Outcome::Allowed,
            matched_permission: Some(matched),
            reason,
            degraded: false,
            evaluated_at,
        }
    }

    pub fn deny(
        matched: Option<PermissionId>,
        reason: DecisionReason,
        evaluated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            allowed: false,
            outcome: Outcome::Denied,
            matched_permission: matched,
            reason,
            degraded: false,
            evaluated_at,
        }
    }
}

// ---------- API request/response types ----------

#[derive(Debug, Deserialize)]
pub struct AuthorizeBody {
    /// e.g. "u1"
    pub subject: SubjectId,
    /// e.g. "batch"
    pub resource: String,
    /// e.g. "submit"
    pub action: String,
    pub scope: Scope,
    #[serde(default)]
    pub context: AttributeContext,
    /// Caller deadline for the whole evaluation
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckTarget {
    pub resource: String,
    pub action: String,
    pub scope: Scope,
}

#[derive(Debug, Deserialize)]
pub struct AuthorizeAnyBody {
    pub subject: SubjectId,
    pub checks: Vec<CheckTarget>,
    #[serde(default)]
    pub context: AttributeContext,
    pub timeout_ms: Option<u64>,
}

/// Cache invalidation event pushed by whatever mutates policy data.
/// All fields empty flushes everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Invalidation {
    pub subject: Option<SubjectId>,
    pub role: Option<RoleId>,
    pub permission: Option<PermissionId>,
}

impl Invalidation {
    pub fn subject(id: &str) -> Self {
        Self {
            subject: Some(id.to_string()),
            ..Default::default()
        }
    }

    pub fn role(id: &str) -> Self {
        Self {
            role: Some(id.to_string()),
            ..Default::default()
        }
    }

    pub fn permission(id: &str) -> Self {
        Self {
            permission: Some(id.to_string()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.subject.is_none() && self.role.is_none() && self.permission.is_none()
    }
}
