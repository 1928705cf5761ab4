use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::authz::errors::AuthzError;
use crate::authz::policy::{parse_kdl_document, ParsedPolicy, RoleDef};
use crate::authz::store::MemoryPolicyStore;
use crate::authz::types::*;

/// Load all `.kdl` policy files from the given directory and compile them
/// into an in-memory policy store.
pub fn load_policies(dir: &Path) -> Result<MemoryPolicyStore, AuthzError> {
    let parsed = read_policy_dir(dir)?;
    let file_count = parsed.len();
    let store = compile_policies(parsed)?;

    tracing::info!(
        files = file_count,
        roles = store.role_count(),
        permissions = store.permission_count(),
        bindings = store.binding_count(),
        assignments = store.assignment_count(),
        overrides = store.override_count(),
        "Loaded authorization policies"
    );

    Ok(store)
}

/// Parse every `.kdl` file in `dir`, in file name order.
pub fn read_policy_dir(dir: &Path) -> Result<Vec<ParsedPolicy>, AuthzError> {
    if !dir.is_dir() {
        return Err(AuthzError::InvalidPolicy(format!(
            "policies directory `{}` does not exist or is not a directory",
            dir.display()
        )));
    }

    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "kdl"))
        .collect();
    entries.sort_by_key(|e| e.path());

    let mut parsed = Vec::with_capacity(entries.len());
    for entry in entries {
        let path = entry.path();
        let contents =
            std::fs::read_to_string(&path).map_err(|source| AuthzError::PolicyLoadError {
                path: path.display().to_string(),
                source,
            })?;
        parsed.push(parse_kdl_document(&contents)?);
    }
    Ok(parsed)
}

/// Merge parsed documents and check them as a whole: unique ids, existing
/// references, an acyclic role hierarchy, unique bindings and well-formed
/// conditions. Role levels are derived from the hierarchy.
pub fn compile_policies(parsed: Vec<ParsedPolicy>) -> Result<MemoryPolicyStore, AuthzError> {
    let mut roles: HashMap<RoleId, RoleDef> = HashMap::new();
    let mut permissions: HashMap<PermissionId, Permission> = HashMap::new();
    let mut bindings = Vec::new();
    let mut assignments = Vec::new();
    let mut overrides = Vec::new();

    for p in parsed {
        for role in p.roles {
            if roles.contains_key(&role.id) {
                return Err(AuthzError::InvalidPolicy(format!(
                    "role `{}` is defined more than once",
                    role.id
                )));
            }
            roles.insert(role.id.clone(), role);
        }
        for permission in p.permissions {
            if permissions.contains_key(&permission.id) {
                return Err(AuthzError::InvalidPolicy(format!(
                    "permission `{}` is defined more than once",
                    permission.id
                )));
            }
            permissions.insert(permission.id.clone(), permission);
        }
        bindings.extend(p.bindings);
        assignments.extend(p.assignments);
        overrides.extend(p.overrides);
    }

    let levels = role_levels(&roles)?;

    for permission in permissions.values() {
        if let Some(cond) = &permission.conditions {
            cond.validate().map_err(|e| {
                AuthzError::InvalidCondition(format!("permission `{}`: {e}", permission.id))
            })?;
        }
    }

    let store = MemoryPolicyStore::new();
    for (id, def) in roles.iter() {
        store.insert_role(Role {
            id: id.clone(),
            name: def.name.clone(),
            parent_id: def.parent.clone(),
            level: levels.get(id).copied().unwrap_or_default(),
            is_system: def.is_system,
        });
    }
    for permission in permissions.values() {
        store.insert_permission(permission.clone());
    }

    for binding in bindings {
        if !roles.contains_key(&binding.role_id) {
            return Err(AuthzError::UndefinedRole(binding.role_id));
        }
        if !permissions.contains_key(&binding.permission_id) {
            return Err(AuthzError::UndefinedPermission(binding.permission_id));
        }
        store.bind(&binding.role_id, &binding.permission_id, binding.effect)?;
    }
    for assignment in assignments {
        if !roles.contains_key(&assignment.role_id) {
            return Err(AuthzError::UndefinedRole(assignment.role_id));
        }
        store.assign(assignment);
    }
    for entry in overrides {
        if !permissions.contains_key(&entry.permission_id) {
            return Err(AuthzError::UndefinedPermission(entry.permission_id));
        }
        store.add_override(entry);
    }

    Ok(store)
}

/// Depth of every role below its root. Fails on a parent that is not defined
/// or on a cycle.
fn role_levels(roles: &HashMap<RoleId, RoleDef>) -> Result<HashMap<RoleId, i32>, AuthzError> {
    let mut levels: HashMap<RoleId, i32> = HashMap::new();

    for start in roles.keys() {
        if levels.contains_key(start) {
            continue;
        }

        // climb until a root or an already-levelled role
        let mut chain: Vec<&str> = Vec::new();
        let mut on_chain: HashSet<&str> = HashSet::new();
        let mut current: &str = start;
        let base = loop {
            if let Some(level) = levels.get(current) {
                break *level + 1;
            }
            if !on_chain.insert(current) {
                let mut path: Vec<&str> = chain
                    .iter()
                    .skip_while(|r| **r != current)
                    .copied()
                    .collect();
                path.push(current);
                return Err(AuthzError::CyclicRoleInheritance(path.join(" -> ")));
            }
            chain.push(current);
            let def = &roles[current];
            match def.parent.as_deref() {
                None => break 0,
                Some(parent) if roles.contains_key(parent) => current = parent,
                Some(parent) => {
                    return Err(AuthzError::UndefinedRole(format!(
                        "{parent} (parent of {current})"
                    )))
                }
            }
        };

        // chain runs child to ancestor; the last element sits at `base`
        for (offset, role) in chain.iter().rev().enumerate() {
            levels.insert(role.to_string(), base + offset as i32);
        }
    }

    Ok(levels)
}
