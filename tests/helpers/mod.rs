#![allow(dead_code)]

pub mod builders;
pub mod db;

pub use builders::{AssignmentBuilder, PermissionBuilder, RoleBuilder};
pub use db::TestDb;
