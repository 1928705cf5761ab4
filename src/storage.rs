use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition as Where, Database, DatabaseConnection, EntityTrait,
    IntoActiveModel, QueryFilter, QueryOrder, Set,
};

use crate::authz::condition::Condition;
use crate::authz::errors::AuthzError;
use crate::authz::loader::compile_policies;
use crate::authz::policy::{ParsedPolicy, RoleDef};
use crate::authz::types::*;
use crate::entities;
use crate::errors::WardenError;
use crate::settings::Database as DbCfg;

#[derive(Debug, Clone)]
pub struct NewRole {
    pub id: RoleId,
    pub name: String,
    pub parent_id: Option<RoleId>,
    pub is_system: bool,
}

#[derive(Debug, Clone)]
pub struct NewPermission {
    pub id: PermissionId,
    pub resource: String,
    pub action: String,
    pub scope: Scope,
    pub conditions: Option<Condition>,
}

pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, WardenError> {
    let db = Database::connect(&cfg.url).await?;
    Ok(db)
}

fn from_timestamp(secs: i64) -> Result<DateTime<Utc>, WardenError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| WardenError::InvalidData(format!("timestamp {secs} out of range")))
}

fn role_from_model(model: entities::role::Model) -> Role {
    Role {
        id: model.id,
        name: model.name,
        parent_id: model.parent_role_id,
        level: model.level,
        is_system: model.is_system != 0,
    }
}

fn permission_from_model(model: entities::permission::Model) -> Result<Permission, WardenError> {
    let scope: Scope = model.scope.parse().map_err(|_| {
        WardenError::InvalidData(format!(
            "permission `{}` has unknown scope `{}`",
            model.id, model.scope
        ))
    })?;
    let conditions = match model.conditions.as_deref() {
        None | Some("") => None,
        Some(raw) => {
            let cond: Condition = serde_json::from_str(raw).map_err(|e| {
                WardenError::InvalidData(format!(
                    "permission `{}` has malformed conditions: {e}",
                    model.id
                ))
            })?;
            cond.validate().map_err(|e| {
                WardenError::InvalidData(format!("permission `{}`: {e}", model.id))
            })?;
            Some(cond)
        }
    };
    Ok(Permission {
        id: model.id,
        resource: model.resource,
        action: model.action,
        scope,
        conditions,
    })
}

fn parse_effect(raw: &str, owner: &str) -> Result<Effect, WardenError> {
    raw.parse()
        .map_err(|_| WardenError::InvalidData(format!("{owner} has unknown effect `{raw}`")))
}

async fn load_permissions(
    db: &DatabaseConnection,
    ids: &BTreeSet<PermissionId>,
) -> Result<HashMap<PermissionId, Permission>, WardenError> {
    use entities::permission::{Column, Entity};

    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let models = Entity::find()
        .filter(Column::Id.is_in(ids.iter().cloned()))
        .filter(Column::DeletedAt.is_null())
        .all(db)
        .await?;

    let mut out = HashMap::with_capacity(models.len());
    for model in models {
        // a corrupt row drops only its own grants
        match permission_from_model(model) {
            Ok(perm) => {
                out.insert(perm.id.clone(), perm);
            }
            Err(e) => tracing::warn!(error = %e, "skipping unreadable permission row"),
        }
    }
    Ok(out)
}

// ---------- Reads used by the decision engine ----------

pub async fn get_active_assignments(
    db: &DatabaseConnection,
    subject: &str,
    now: DateTime<Utc>,
) -> Result<Vec<SubjectRoleAssignment>, WardenError> {
    use entities::subject_role::{Column, Entity};

    let now_ts = now.timestamp();
    let models = Entity::find()
        .filter(Column::Subject.eq(subject))
        .filter(Column::IsActive.eq(1))
        .filter(Column::ValidFrom.lte(now_ts))
        .filter(
            Where::any()
                .add(Column::ValidUntil.is_null())
                .add(Column::ValidUntil.gt(now_ts)),
        )
        .order_by_asc(Column::Id)
        .all(db)
        .await?;

    let mut assignments = Vec::with_capacity(models.len());
    for m in models {
        let window = from_timestamp(m.valid_from)
            .and_then(|from| Ok((from, m.valid_until.map(from_timestamp).transpose()?)));
        match window {
            Ok((valid_from, valid_until)) => assignments.push(SubjectRoleAssignment {
                subject_id: m.subject,
                role_id: m.role_id,
                valid_from,
                valid_until,
            }),
            Err(e) => tracing::warn!(
                subject = %m.subject,
                role = %m.role_id,
                error = %e,
                "skipping unreadable assignment row"
            ),
        }
    }
    Ok(assignments)
}

pub async fn get_role(db: &DatabaseConnection, role_id: &str) -> Result<Option<Role>, WardenError> {
    use entities::role::{Column, Entity};

    let model = Entity::find_by_id(role_id.to_string())
        .filter(Column::DeletedAt.is_null())
        .one(db)
        .await?;
    Ok(model.map(role_from_model))
}

pub async fn get_role_permissions(
    db: &DatabaseConnection,
    role_ids: &BTreeSet<RoleId>,
) -> Result<Vec<RoleGrant>, WardenError> {
    use entities::role_permission::{Column, Entity};

    if role_ids.is_empty() {
        return Ok(Vec::new());
    }

    let bindings = Entity::find()
        .filter(Column::RoleId.is_in(role_ids.iter().cloned()))
        .all(db)
        .await?;

    let wanted: BTreeSet<PermissionId> = bindings.iter().map(|b| b.permission_id.clone()).collect();
    let permissions = load_permissions(db, &wanted).await?;

    let mut grants = Vec::with_capacity(bindings.len());
    for binding in bindings {
        // soft-deleted permissions drop out here
        let Some(permission) = permissions.get(&binding.permission_id) else {
            continue;
        };
        let owner = format!("binding {} -> {}", binding.role_id, binding.permission_id);
        let effect = match parse_effect(&binding.effect, &owner) {
            Ok(effect) => effect,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable binding row");
                continue;
            }
        };
        grants.push(RoleGrant {
            effect,
            role_id: binding.role_id,
            permission: permission.clone(),
        });
    }
    Ok(grants)
}

pub async fn get_overrides(
    db: &DatabaseConnection,
    subject: &str,
    now: DateTime<Utc>,
) -> Result<Vec<OverrideGrant>, WardenError> {
    use entities::subject_permission::{Column, Entity};

    let now_ts = now.timestamp();
    let models = Entity::find()
        .filter(Column::Subject.eq(subject))
        .filter(Column::IsActive.eq(1))
        .filter(
            Where::any()
                .add(Column::ValidFrom.is_null())
                .add(Column::ValidFrom.lte(now_ts)),
        )
        .filter(
            Where::any()
                .add(Column::ValidUntil.is_null())
                .add(Column::ValidUntil.gt(now_ts)),
        )
        .order_by_asc(Column::Id)
        .all(db)
        .await?;

    let wanted: BTreeSet<PermissionId> = models.iter().map(|m| m.permission_id.clone()).collect();
    let permissions = load_permissions(db, &wanted).await?;

    let mut grants = Vec::with_capacity(models.len());
    for m in models {
        let Some(permission) = permissions.get(&m.permission_id) else {
            continue;
        };
        let owner = format!("override {} -> {}", m.subject, m.permission_id);
        let entry = parse_effect(&m.effect, &owner).and_then(|effect| {
            Ok(SubjectPermissionOverride {
                effect,
                subject_id: m.subject.clone(),
                permission_id: m.permission_id.clone(),
                valid_from: m.valid_from.map(from_timestamp).transpose()?,
                valid_until: m.valid_until.map(from_timestamp).transpose()?,
            })
        });
        match entry {
            Ok(entry) => grants.push(OverrideGrant {
                entry,
                permission: permission.clone(),
            }),
            Err(e) => tracing::warn!(error = %e, "skipping unreadable override row"),
        }
    }
    Ok(grants)
}

// ---------- Administrative writes ----------

pub async fn create_role(db: &DatabaseConnection, input: NewRole) -> Result<Role, WardenError> {
    let level = match &input.parent_id {
        Some(parent_id) => {
            let parent = get_role(db, parent_id)
                .await?
                .ok_or_else(|| AuthzError::UndefinedRole(parent_id.clone()))?;
            parent.level + 1
        }
        None => 0,
    };

    let role = entities::role::ActiveModel {
        id: Set(input.id.clone()),
        name: Set(input.name.clone()),
        parent_role_id: Set(input.parent_id.clone()),
        level: Set(level),
        is_system: Set(i32::from(input.is_system)),
        created_at: Set(Utc::now().timestamp()),
        deleted_at: Set(None),
    };
    role.insert(db).await?;

    Ok(Role {
        id: input.id,
        name: input.name,
        parent_id: input.parent_id,
        level,
        is_system: input.is_system,
    })
}

/// Soft-delete a role. System roles cannot be deleted.
pub async fn delete_role(db: &DatabaseConnection, role_id: &str) -> Result<(), WardenError> {
    use entities::role::Entity;

    let model = Entity::find_by_id(role_id.to_string())
        .one(db)
        .await?
        .ok_or_else(|| AuthzError::UndefinedRole(role_id.to_string()))?;
    if model.is_system != 0 {
        return Err(AuthzError::InvalidPolicy(format!(
            "system role `{role_id}` cannot be deleted"
        ))
        .into());
    }
    let mut active = model.into_active_model();
    active.deleted_at = Set(Some(Utc::now().timestamp()));
    active.update(db).await?;
    Ok(())
}

pub async fn create_permission(
    db: &DatabaseConnection,
    input: NewPermission,
) -> Result<Permission, WardenError> {
    let conditions_json = match &input.conditions {
        Some(cond) => {
            cond.validate()?;
            Some(serde_json::to_string(cond)?)
        }
        None => None,
    };

    let permission = entities::permission::ActiveModel {
        id: Set(input.id.clone()),
        resource: Set(input.resource.clone()),
        action: Set(input.action.clone()),
        scope: Set(input.scope.as_str().to_string()),
        conditions: Set(conditions_json),
        created_at: Set(Utc::now().timestamp()),
        deleted_at: Set(None),
    };
    permission.insert(db).await?;

    Ok(Permission {
        id: input.id,
        resource: input.resource,
        action: input.action,
        scope: input.scope,
        conditions: input.conditions,
    })
}

pub async fn bind_permission(
    db: &DatabaseConnection,
    role_id: &str,
    permission_id: &str,
    effect: Effect,
) -> Result<(), WardenError> {
    use entities::role_permission::Entity;

    if Entity::find_by_id((role_id.to_string(), permission_id.to_string()))
        .one(db)
        .await?
        .is_some()
    {
        return Err(AuthzError::DuplicateBinding(format!("{role_id} -> {permission_id}")).into());
    }

    let binding = entities::role_permission::ActiveModel {
        role_id: Set(role_id.to_string()),
        permission_id: Set(permission_id.to_string()),
        effect: Set(effect.as_str().to_string()),
    };
    Entity::insert(binding).exec_without_returning(db).await?;
    Ok(())
}

pub async fn assign_role(
    db: &DatabaseConnection,
    subject: &str,
    role_id: &str,
    valid_from: DateTime<Utc>,
    valid_until: Option<DateTime<Utc>>,
) -> Result<SubjectRoleAssignment, WardenError> {
    let assignment = entities::subject_role::ActiveModel {
        subject: Set(subject.to_string()),
        role_id: Set(role_id.to_string()),
        valid_from: Set(valid_from.timestamp()),
        valid_until: Set(valid_until.map(|t| t.timestamp())),
        is_active: Set(1),
        ..Default::default()
    };
    assignment.insert(db).await?;

    Ok(SubjectRoleAssignment {
        subject_id: subject.to_string(),
        role_id: role_id.to_string(),
        valid_from,
        valid_until,
    })
}

/// Deactivate every assignment of `role_id` to `subject`. Returns how many rows changed.
pub async fn revoke_role(
    db: &DatabaseConnection,
    subject: &str,
    role_id: &str,
) -> Result<u64, WardenError> {
    use entities::subject_role::{Column, Entity};

    let result = Entity::update_many()
        .col_expr(Column::IsActive, sea_orm::sea_query::Expr::value(0))
        .filter(Column::Subject.eq(subject))
        .filter(Column::RoleId.eq(role_id))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

pub async fn create_override(
    db: &DatabaseConnection,
    entry: SubjectPermissionOverride,
) -> Result<SubjectPermissionOverride, WardenError> {
    let row = entities::subject_permission::ActiveModel {
        subject: Set(entry.subject_id.clone()),
        permission_id: Set(entry.permission_id.clone()),
        effect: Set(entry.effect.as_str().to_string()),
        valid_from: Set(entry.valid_from.map(|t| t.timestamp())),
        valid_until: Set(entry.valid_until.map(|t| t.timestamp())),
        is_active: Set(1),
        ..Default::default()
    };
    row.insert(db).await?;
    Ok(entry)
}

/// Counts of rows written by [`import_policies`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub roles: usize,
    pub permissions: usize,
    pub bindings: usize,
    pub assignments: usize,
    pub overrides: usize,
}

/// Write parsed policy documents into the database. The documents are
/// compiled first so a broken set is rejected before anything is written.
/// Roles are inserted parents first so levels can be derived.
pub async fn import_policies(
    db: &DatabaseConnection,
    parsed: Vec<ParsedPolicy>,
) -> Result<ImportSummary, WardenError> {
    compile_policies(parsed.clone())?;

    let mut summary = ImportSummary::default();
    let mut pending: Vec<RoleDef> = Vec::new();
    let mut permissions = Vec::new();
    let mut bindings = Vec::new();
    let mut assignments = Vec::new();
    let mut overrides = Vec::new();
    for p in parsed {
        pending.extend(p.roles);
        permissions.extend(p.permissions);
        bindings.extend(p.bindings);
        assignments.extend(p.assignments);
        overrides.extend(p.overrides);
    }

    let mut inserted: HashSet<RoleId> = HashSet::new();
    while !pending.is_empty() {
        let (ready, rest): (Vec<RoleDef>, Vec<RoleDef>) = pending
            .into_iter()
            .partition(|r| r.parent.as_ref().is_none_or(|p| inserted.contains(p)));
        if ready.is_empty() {
            // compile_policies rejects cycles and dangling parents
            return Err(WardenError::InvalidData(format!(
                "{} roles have unresolvable parents",
                rest.len()
            )));
        }
        for role in ready {
            create_role(
                db,
                NewRole {
                    id: role.id.clone(),
                    name: role.name,
                    parent_id: role.parent,
                    is_system: role.is_system,
                },
            )
            .await?;
            inserted.insert(role.id);
            summary.roles += 1;
        }
        pending = rest;
    }

    for permission in permissions {
        create_permission(
            db,
            NewPermission {
                id: permission.id,
                resource: permission.resource,
                action: permission.action,
                scope: permission.scope,
                conditions: permission.conditions,
            },
        )
        .await?;
        summary.permissions += 1;
    }
    for binding in bindings {
        bind_permission(db, &binding.role_id, &binding.permission_id, binding.effect).await?;
        summary.bindings += 1;
    }
    for a in assignments {
        assign_role(db, &a.subject_id, &a.role_id, a.valid_from, a.valid_until).await?;
        summary.assignments += 1;
    }
    for entry in overrides {
        create_override(db, entry).await?;
        summary.overrides += 1;
    }

    Ok(summary)
}
