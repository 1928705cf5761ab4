use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use warden::authz::condition::Condition;
use warden::authz::types::{Permission, Role, Scope, SubjectRoleAssignment};
use warden::storage::{self, NewPermission, NewRole};

/// Builder for creating test roles
pub struct RoleBuilder {
    id: String,
    name: String,
    parent: Option<String>,
    is_system: bool,
}

impl RoleBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            parent: None,
            is_system: false,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn parent(mut self, parent: &str) -> Self {
        self.parent = Some(parent.to_string());
        self
    }

    pub fn system(mut self) -> Self {
        self.is_system = true;
        self
    }

    pub async fn create(self, db: &DatabaseConnection) -> Role {
        storage::create_role(
            db,
            NewRole {
                id: self.id,
                name: self.name,
                parent_id: self.parent,
                is_system: self.is_system,
            },
        )
        .await
        .expect("Failed to create test role")
    }
}

/// Builder for creating test permissions
pub struct PermissionBuilder {
    id: String,
    resource: String,
    action: String,
    scope: Scope,
    conditions: Option<Condition>,
}

impl PermissionBuilder {
    pub fn new(id: &str, resource: &str, action: &str) -> Self {
        Self {
            id: id.to_string(),
            resource: resource.to_string(),
            action: action.to_string(),
            scope: Scope::Organization,
            conditions: None,
        }
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.conditions = Some(condition);
        self
    }

    pub async fn create(self, db: &DatabaseConnection) -> Permission {
        storage::create_permission(
            db,
            NewPermission {
                id: self.id,
                resource: self.resource,
                action: self.action,
                scope: self.scope,
                conditions: self.conditions,
            },
        )
        .await
        .expect("Failed to create test permission")
    }
}

/// Builder for creating test role assignments
pub struct AssignmentBuilder {
    subject: String,
    role_id: String,
    valid_from: DateTime<Utc>,
    valid_until: Option<DateTime<Utc>>,
}

impl AssignmentBuilder {
    pub fn new(subject: &str, role_id: &str) -> Self {
        Self {
            subject: subject.to_string(),
            role_id: role_id.to_string(),
            valid_from: DateTime::<Utc>::UNIX_EPOCH,
            valid_until: None,
        }
    }

    pub fn active_from(mut self, valid_from: DateTime<Utc>) -> Self {
        self.valid_from = valid_from;
        self
    }

    pub fn active_until(mut self, valid_until: DateTime<Utc>) -> Self {
        self.valid_until = Some(valid_until);
        self
    }

    pub async fn create(self, db: &DatabaseConnection) -> SubjectRoleAssignment {
        storage::assign_role(
            db,
            &self.subject,
            &self.role_id,
            self.valid_from,
            self.valid_until,
        )
        .await
        .expect("Failed to create test assignment")
    }
}
