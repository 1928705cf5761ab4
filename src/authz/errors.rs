use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;

use crate::authz::types::RoleId;

#[derive(Debug, Error, Diagnostic)]
pub enum AuthzError {
    #[error("Failed to load policy file `{path}`")]
    #[diagnostic(
        code(warden::authz::policy_load),
        help("Check that the file exists and contains valid KDL syntax")
    )]
    PolicyLoadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Policy store unavailable: {0}")]
    #[diagnostic(
        code(warden::authz::store_unavailable),
        help("The decision could not be evaluated; the caller decides its own outage policy")
    )]
    PolicyStoreUnavailable(String),

    #[error("Invalid policy: {0}")]
    #[diagnostic(
        code(warden::authz::invalid_policy),
        help("Each policy file may contain `role`, `permission`, `bind`, `assign` and `override` KDL nodes")
    )]
    InvalidPolicy(String),

    #[error("Invalid condition: {0}")]
    #[diagnostic(
        code(warden::authz::invalid_condition),
        help("Supported predicates: time-window, equals, not-equals, in-set, combined with all, any and not")
    )]
    InvalidCondition(String),

    #[error("Undefined role `{0}`")]
    #[diagnostic(
        code(warden::authz::undefined_role),
        help("Define the role with: role \"<id>\" name=\"...\"")
    )]
    UndefinedRole(String),

    #[error("Undefined permission `{0}`")]
    #[diagnostic(
        code(warden::authz::undefined_permission),
        help("Define the permission with: permission \"<id>\" resource=\"...\" action=\"...\" scope=\"...\"")
    )]
    UndefinedPermission(String),

    #[error("Duplicate role binding: {0}")]
    #[diagnostic(code(warden::authz::duplicate_binding))]
    DuplicateBinding(String),

    #[error("Cyclic role inheritance detected: {0}")]
    #[diagnostic(
        code(warden::authz::cyclic_roles),
        help("Check the `parent` of each role for circular references")
    )]
    CyclicRoleInheritance(String),

    #[error("KDL parse error: {0}")]
    #[diagnostic(
        code(warden::authz::kdl_parse),
        help("Check your KDL file syntax, see https://kdl.dev for the specification")
    )]
    KdlParse(String),

    #[error("I/O error: {0}")]
    #[diagnostic(code(warden::authz::io))]
    Io(#[from] std::io::Error),
}

impl IntoResponse for AuthzError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AuthzError::InvalidPolicy(_) | AuthzError::InvalidCondition(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            AuthzError::PolicyStoreUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };
        let body = json!({ "error": message });
        (status, Json(body)).into_response()
    }
}

/// A corrupt hierarchy edge found while resolving roles. Only the affected
/// role's contribution is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum PolicyIntegrityError {
    #[error("role `{role}` is part of an inheritance cycle: {}", .path.join(" -> "))]
    #[diagnostic(code(warden::authz::integrity::cycle))]
    Cycle { role: RoleId, path: Vec<RoleId> },

    #[error("role `{role}` references undefined role `{missing}`")]
    #[diagnostic(code(warden::authz::integrity::dangling))]
    DanglingReference { role: RoleId, missing: RoleId },
}

impl PolicyIntegrityError {
    pub fn role(&self) -> &str {
        match self {
            PolicyIntegrityError::Cycle { role, .. } => role,
            PolicyIntegrityError::DanglingReference { role, .. } => role,
        }
    }
}

/// The remote evaluator could not produce a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
#[error("Remote policy evaluator unavailable: {0}")]
#[diagnostic(code(warden::authz::remote_unavailable))]
pub struct RemotePolicyUnavailable(pub String);

/// Distributed cache tier failure; always recovered by recomputing.
#[derive(Debug, Error, Diagnostic)]
pub enum SharedCacheError {
    #[error("shared cache timed out after {0:?}")]
    #[diagnostic(code(warden::cache::timeout))]
    Timeout(std::time::Duration),

    #[error("shared cache backend error: {0}")]
    #[diagnostic(code(warden::cache::backend))]
    Backend(String),

    #[error("shared cache entry could not be decoded: {0}")]
    #[diagnostic(code(warden::cache::decode))]
    Decode(#[from] serde_json::Error),
}

impl From<redis::RedisError> for SharedCacheError {
    fn from(value: redis::RedisError) -> Self {
        SharedCacheError::Backend(value.to_string())
    }
}
