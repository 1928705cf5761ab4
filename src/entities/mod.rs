pub mod permission;
pub mod role;
pub mod role_permission;
pub mod subject_permission;
pub mod subject_role;

pub use permission::Entity as Permission;
pub use role::Entity as Role;
pub use role_permission::Entity as RolePermission;
pub use subject_permission::Entity as SubjectPermission;
pub use subject_role::Entity as SubjectRole;
