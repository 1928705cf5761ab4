use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::authz::errors::{AuthzError, PolicyIntegrityError};
use crate::authz::store::{bounded, PolicyStore};
use crate::authz::types::*;

/// Effective roles of one subject at one instant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRoles {
    pub roles: BTreeSet<RoleId>,
    /// Corrupt hierarchy edges met while walking; each dropped one assigned role.
    #[serde(skip)]
    pub integrity_errors: Vec<PolicyIntegrityError>,
    /// Earliest assignment expiry after the resolution instant.
    pub valid_until: Option<DateTime<Utc>>,
}

/// Expands assigned roles into the full ancestor closure.
///
/// Each role has at most one parent, so the walk for an assigned role is a
/// chain. Roles are fetched once per resolution into a local arena; a chain
/// that revisits a role on its own path, or names a role that does not exist,
/// contributes nothing.
pub struct RoleResolver<'a> {
    store: &'a dyn PolicyStore,
    timeout: Duration,
    arena: HashMap<RoleId, Option<Role>>,
}

impl<'a> RoleResolver<'a> {
    pub fn new(store: &'a dyn PolicyStore, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            arena: HashMap::new(),
        }
    }

    pub async fn resolve(
        mut self,
        subject: &str,
        now: DateTime<Utc>,
    ) -> Result<ResolvedRoles, AuthzError> {
        let store = self.store;
        let assignments = bounded(
            self.timeout,
            "get_active_assignments",
            store.get_active_assignments(subject, now),
        )
        .await?;

        let mut resolved = ResolvedRoles::default();
        // roles whose chain up to a root is known to be sound
        let mut sound: HashSet<RoleId> = HashSet::new();

        for assignment in assignments.iter().filter(|a| a.is_active_at(now)) {
            if let Some(until) = assignment.valid_until {
                resolved.valid_until = Some(match resolved.valid_until {
                    Some(current) => current.min(until),
                    None => until,
                });
            }

            match self.walk(&assignment.role_id, &sound).await? {
                Ok(chain) => {
                    for role in chain {
                        sound.insert(role.clone());
                        resolved.roles.insert(role);
                    }
                }
                Err(integrity) => {
                    tracing::warn!(
                        subject,
                        role = %assignment.role_id,
                        error = %integrity,
                        "dropping role with corrupt hierarchy"
                    );
                    resolved.integrity_errors.push(integrity);
                }
            }
        }

        Ok(resolved)
    }

    /// Walk from `start` to the root. Stops early on a role already proven sound.
    async fn walk(
        &mut self,
        start: &str,
        sound: &HashSet<RoleId>,
    ) -> Result<Result<Vec<RoleId>, PolicyIntegrityError>, AuthzError> {
        let mut path: Vec<RoleId> = Vec::new();
        let mut on_path: HashSet<RoleId> = HashSet::new();
        let mut current = start.to_string();

        loop {
            if sound.contains(&current) {
                return Ok(Ok(path));
            }
            if !on_path.insert(current.clone()) {
                path.push(current);
                return Ok(Err(PolicyIntegrityError::Cycle {
                    role: start.to_string(),
                    path,
                }));
            }

            let Some(role) = self.fetch(&current).await? else {
                let referrer = path.last().cloned().unwrap_or_else(|| start.to_string());
                return Ok(Err(PolicyIntegrityError::DanglingReference {
                    role: referrer,
                    missing: current,
                }));
            };

            path.push(current);
            match role.parent_id {
                Some(parent) => current = parent,
                None => return Ok(Ok(path)),
            }
        }
    }

    async fn fetch(&mut self, role_id: &str) -> Result<Option<Role>, AuthzError> {
        if let Some(cached) = self.arena.get(role_id) {
            return Ok(cached.clone());
        }
        let role = bounded(self.timeout, "get_role", self.store.get_role(role_id)).await?;
        self.arena.insert(role_id.to_string(), role.clone());
        Ok(role)
    }
}
