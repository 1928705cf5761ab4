//! Authorization decisions: role hierarchy, permission matching, attribute
//! conditions, per-subject overrides and a two-tier decision cache.

pub mod cache;
pub mod condition;
pub mod engine;
pub mod errors;
pub mod loader;
pub mod matcher;
pub mod policy;
pub mod remote;
pub mod resolver;
pub mod service;
pub mod store;
pub mod types;
pub mod web;

pub use errors::AuthzError;
pub use service::{AuthorizationService, AuthorizeRequest, ServiceConfig};
pub use store::{DatabasePolicyStore, MemoryPolicyStore, PolicyStore};
pub use types::{Decision, DecisionReason, Invalidation, Outcome, Scope};
