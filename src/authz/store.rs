use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sea_orm::DatabaseConnection;

use crate::authz::errors::AuthzError;
use crate::authz::types::*;
use crate::errors::WardenError;
use crate::storage;

/// Read-only view of the authoritative policy data.
///
/// Implementations report any failure to read as
/// [`AuthzError::PolicyStoreUnavailable`]; the engine never guesses a decision
/// when the store cannot answer.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Assignments for `subject` whose validity window contains `now`.
    async fn get_active_assignments(
        &self,
        subject: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<SubjectRoleAssignment>, AuthzError>;

    async fn get_role(&self, role_id: &str) -> Result<Option<Role>, AuthzError>;

    /// Bindings of the given roles joined with their permissions.
    async fn get_role_permissions(
        &self,
        role_ids: &BTreeSet<RoleId>,
    ) -> Result<Vec<RoleGrant>, AuthzError>;

    /// Overrides for `subject` whose validity window contains `now`.
    async fn get_overrides(
        &self,
        subject: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<OverrideGrant>, AuthzError>;
}

/// Run a store read under `timeout`, turning expiry into
/// [`AuthzError::PolicyStoreUnavailable`].
pub async fn bounded<T, F>(timeout: Duration, operation: &str, fut: F) -> Result<T, AuthzError>
where
    F: Future<Output = Result<T, AuthzError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(AuthzError::PolicyStoreUnavailable(format!(
            "{operation} timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

// ---------- In-memory store ----------

#[derive(Debug, Default)]
struct MemoryState {
    roles: HashMap<RoleId, Role>,
    permissions: HashMap<PermissionId, Permission>,
    bindings: Vec<RolePermission>,
    assignments: Vec<SubjectRoleAssignment>,
    overrides: Vec<SubjectPermissionOverride>,
}

/// Policy data held in process, used by the file backend and by tests.
///
/// Mutators perform no hierarchy validation so that corrupt graphs can be
/// represented; the KDL loader validates before populating.
#[derive(Debug, Default)]
pub struct MemoryPolicyStore {
    state: RwLock<MemoryState>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_role(&self, role: Role) {
        self.state.write().roles.insert(role.id.clone(), role);
    }

    pub fn insert_permission(&self, permission: Permission) {
        self.state
            .write()
            .permissions
            .insert(permission.id.clone(), permission);
    }

    /// Bind a permission to a role; a second binding of the same pair is rejected.
    pub fn bind(&self, role_id: &str, permission_id: &str, effect: Effect) -> Result<(), AuthzError> {
        let mut state = self.state.write();
        if state
            .bindings
            .iter()
            .any(|b| b.role_id == role_id && b.permission_id == permission_id)
        {
            return Err(AuthzError::DuplicateBinding(format!(
                "{role_id} -> {permission_id}"
            )));
        }
        state.bindings.push(RolePermission {
            role_id: role_id.to_string(),
            permission_id: permission_id.to_string(),
            effect,
        });
        Ok(())
    }

    pub fn unbind(&self, role_id: &str, permission_id: &str) -> bool {
        let mut state = self.state.write();
        let before = state.bindings.len();
        state
            .bindings
            .retain(|b| !(b.role_id == role_id && b.permission_id == permission_id));
        state.bindings.len() != before
    }

    pub fn assign(&self, assignment: SubjectRoleAssignment) {
        self.state.write().assignments.push(assignment);
    }

    pub fn revoke(&self, subject: &str, role_id: &str) -> bool {
        let mut state = self.state.write();
        let before = state.assignments.len();
        state
            .assignments
            .retain(|a| !(a.subject_id == subject && a.role_id == role_id));
        state.assignments.len() != before
    }

    pub fn add_override(&self, entry: SubjectPermissionOverride) {
        self.state.write().overrides.push(entry);
    }

    pub fn role_count(&self) -> usize {
        self.state.read().roles.len()
    }

    pub fn permission_count(&self) -> usize {
        self.state.read().permissions.len()
    }

    pub fn binding_count(&self) -> usize {
        self.state.read().bindings.len()
    }

    pub fn assignment_count(&self) -> usize {
        self.state.read().assignments.len()
    }

    pub fn override_count(&self) -> usize {
        self.state.read().overrides.len()
    }
}

#[async_trait]
impl PolicyStore for MemoryPolicyStore {
    async fn get_active_assignments(
        &self,
        subject: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<SubjectRoleAssignment>, AuthzError> {
        Ok(self
            .state
            .read()
            .assignments
            .iter()
            .filter(|a| a.subject_id == subject && a.is_active_at(now))
            .cloned()
            .collect())
    }

    async fn get_role(&self, role_id: &str) -> Result<Option<Role>, AuthzError> {
        Ok(self.state.read().roles.get(role_id).cloned())
    }

    async fn get_role_permissions(
        &self,
        role_ids: &BTreeSet<RoleId>,
    ) -> Result<Vec<RoleGrant>, AuthzError> {
        let state = self.state.read();
        let mut grants = Vec::new();
        for binding in state.bindings.iter().filter(|b| role_ids.contains(&b.role_id)) {
            match state.permissions.get(&binding.permission_id) {
                Some(permission) => grants.push(RoleGrant {
                    role_id: binding.role_id.clone(),
                    effect: binding.effect,
                    permission: permission.clone(),
                }),
                None => tracing::warn!(
                    role = %binding.role_id,
                    permission = %binding.permission_id,
                    "binding references undefined permission, skipping"
                ),
            }
        }
        Ok(grants)
    }

    async fn get_overrides(
        &self,
        subject: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<OverrideGrant>, AuthzError> {
        let state = self.state.read();
        let mut grants = Vec::new();
        for entry in state
            .overrides
            .iter()
            .filter(|o| o.subject_id == subject && o.is_active_at(now))
        {
            match state.permissions.get(&entry.permission_id) {
                Some(permission) => grants.push(OverrideGrant {
                    entry: entry.clone(),
                    permission: permission.clone(),
                }),
                None => tracing::warn!(
                    subject,
                    permission = %entry.permission_id,
                    "override references undefined permission, skipping"
                ),
            }
        }
        Ok(grants)
    }
}

// ---------- Database store ----------

/// Policy data read through SeaORM from the tables created by `migration`.
#[derive(Debug, Clone)]
pub struct DatabasePolicyStore {
    db: DatabaseConnection,
}

impl DatabasePolicyStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

/// Every failure reading stored policy is a server-side fault.
fn store_error(e: WardenError) -> AuthzError {
    AuthzError::PolicyStoreUnavailable(e.to_string())
}

#[async_trait]
impl PolicyStore for DatabasePolicyStore {
    async fn get_active_assignments(
        &self,
        subject: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<SubjectRoleAssignment>, AuthzError> {
        storage::get_active_assignments(&self.db, subject, now)
            .await
            .map_err(store_error)
    }

    async fn get_role(&self, role_id: &str) -> Result<Option<Role>, AuthzError> {
        storage::get_role(&self.db, role_id)
            .await
            .map_err(store_error)
    }

    async fn get_role_permissions(
        &self,
        role_ids: &BTreeSet<RoleId>,
    ) -> Result<Vec<RoleGrant>, AuthzError> {
        storage::get_role_permissions(&self.db, role_ids)
            .await
            .map_err(store_error)
    }

    async fn get_overrides(
        &self,
        subject: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<OverrideGrant>, AuthzError> {
        storage::get_overrides(&self.db, subject, now)
            .await
            .map_err(store_error)
    }
}
