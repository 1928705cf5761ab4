//! Warden - authorization decision engine
//!
//! Answers "may this subject perform this action on this resource at this
//! scope?" from role hierarchies, attribute conditions and per-subject
//! overrides. It exposes all modules for testing purposes.

pub mod authz;
pub mod entities;
pub mod errors;
pub mod jobs;
pub mod settings;
pub mod storage;
