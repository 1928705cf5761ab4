use chrono::{DateTime, Utc};
use kdl::{KdlDocument, KdlNode, KdlValue};
use serde_json::Value;

use crate::authz::condition::Condition;
use crate::authz::errors::AuthzError;
use crate::authz::types::*;

/// A role as declared in a policy file; `level` is derived at compile time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleDef {
    pub id: RoleId,
    pub name: String,
    pub parent: Option<RoleId>,
    pub is_system: bool,
}

/// Everything declared by one policy document.
#[derive(Debug, Clone, Default)]
pub struct ParsedPolicy {
    pub roles: Vec<RoleDef>,
    pub permissions: Vec<Permission>,
    pub bindings: Vec<RolePermission>,
    pub assignments: Vec<SubjectRoleAssignment>,
    pub overrides: Vec<SubjectPermissionOverride>,
}

/// Parse a KDL document string into typed policy structs.
pub fn parse_kdl_document(source: &str) -> Result<ParsedPolicy, AuthzError> {
    let doc: KdlDocument = source
        .parse()
        .map_err(|e: kdl::KdlError| AuthzError::KdlParse(e.to_string()))?;

    let mut policy = ParsedPolicy::default();

    for node in doc.nodes() {
        match node.name().value() {
            "role" => {
                let id = positional_string(node, 0).ok_or_else(|| {
                    AuthzError::InvalidPolicy(
                        "role node requires an id argument (e.g. role \"operator\" name=\"Operator\")"
                            .into(),
                    )
                })?;
                let name = string_prop(node, "name").unwrap_or_else(|| id.clone());
                let is_system = match node.get("system") {
                    None => false,
                    Some(v) => v.as_bool().ok_or_else(|| {
                        AuthzError::InvalidPolicy(format!(
                            "role `{id}`: `system` must be a boolean (#true or #false)"
                        ))
                    })?,
                };
                policy.roles.push(RoleDef {
                    parent: string_prop(node, "parent"),
                    id,
                    name,
                    is_system,
                });
            }
            "permission" => {
                policy.permissions.push(parse_permission(node)?);
            }
            "bind" => {
                let (role_id, permission_id) = two_strings(node, "bind \"<role>\" \"<permission>\"")?;
                policy.bindings.push(RolePermission {
                    role_id,
                    permission_id,
                    effect: effect_prop(node)?,
                });
            }
            "assign" => {
                let (subject_id, role_id) = two_strings(node, "assign \"<subject>\" \"<role>\"")?;
                policy.assignments.push(SubjectRoleAssignment {
                    subject_id,
                    role_id,
                    valid_from: time_prop(node, "from")?.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
                    valid_until: time_prop(node, "until")?,
                });
            }
            "override" => {
                let (subject_id, permission_id) =
                    two_strings(node, "override \"<subject>\" \"<permission>\" effect=\"deny\"")?;
                policy.overrides.push(SubjectPermissionOverride {
                    subject_id,
                    permission_id,
                    effect: effect_prop(node)?,
                    valid_from: time_prop(node, "from")?,
                    valid_until: time_prop(node, "until")?,
                });
            }
            other => {
                tracing::warn!("ignoring unknown top-level KDL node `{other}`");
            }
        }
    }

    Ok(policy)
}

fn parse_permission(node: &KdlNode) -> Result<Permission, AuthzError> {
    let id = positional_string(node, 0).ok_or_else(|| {
        AuthzError::InvalidPolicy(
            "permission node requires an id argument (e.g. permission \"batch-submit\" resource=\"batch\" action=\"submit\" scope=\"organization\")"
                .into(),
        )
    })?;
    let required = |key: &str| {
        string_prop(node, key).ok_or_else(|| {
            AuthzError::InvalidPolicy(format!("permission `{id}` missing `{key}` property"))
        })
    };
    let resource = required("resource")?;
    let action = required("action")?;
    let scope: Scope = required("scope")?.parse()?;

    let mut conditions = None;
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "when" => {
                    let cond = parse_condition_block(child)?;
                    cond.validate()
                        .map_err(|e| AuthzError::InvalidCondition(format!("permission `{id}`: {e}")))?;
                    conditions = Some(cond);
                }
                other => {
                    return Err(AuthzError::InvalidPolicy(format!(
                        "unexpected child `{other}` in permission `{id}` (expected `when`)"
                    )));
                }
            }
        }
    }

    Ok(Permission {
        id,
        resource,
        action,
        scope,
        conditions,
    })
}

/// A `when` block holds one predicate, or several that must all hold.
fn parse_condition_block(node: &KdlNode) -> Result<Condition, AuthzError> {
    let mut parsed = condition_children(node)?;
    match parsed.len() {
        0 => Err(AuthzError::InvalidCondition(
            "`when` block has no predicates".into(),
        )),
        1 => Ok(parsed.remove(0)),
        _ => Ok(Condition::all(parsed)),
    }
}

fn condition_children(node: &KdlNode) -> Result<Vec<Condition>, AuthzError> {
    match node.children() {
        Some(children) => children.nodes().iter().map(parse_condition).collect(),
        None => Ok(Vec::new()),
    }
}

fn parse_condition(node: &KdlNode) -> Result<Condition, AuthzError> {
    let op = node.name().value();
    match op {
        "time-window" => Ok(Condition::time_window(
            time_prop(node, "from")?,
            time_prop(node, "until")?,
        )),
        "equals" | "not-equals" => {
            let attribute = attribute_arg(node)?;
            let value = positional(node, 1).map(kdl_to_json).ok_or_else(|| {
                AuthzError::InvalidCondition(format!("`{op}` on `{attribute}` needs a value"))
            })?;
            Ok(if op == "equals" {
                Condition::equals(&attribute, value)
            } else {
                Condition::not_equals(&attribute, value)
            })
        }
        "in-set" => {
            let attribute = attribute_arg(node)?;
            let values = positionals(node).skip(1).map(kdl_to_json).collect();
            Ok(Condition::in_set(&attribute, values))
        }
        "all" => Ok(Condition::all(condition_children(node)?)),
        "any" => Ok(Condition::any(condition_children(node)?)),
        "not" => {
            let mut inner = condition_children(node)?;
            if inner.len() != 1 {
                return Err(AuthzError::InvalidCondition(format!(
                    "`not` takes exactly one predicate, found {}",
                    inner.len()
                )));
            }
            Ok(Condition::not(inner.remove(0)))
        }
        other => Err(AuthzError::InvalidCondition(format!(
            "unknown predicate `{other}`"
        ))),
    }
}

fn positionals(node: &KdlNode) -> impl Iterator<Item = &KdlValue> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(|e| e.value())
}

fn positional(node: &KdlNode, index: usize) -> Option<&KdlValue> {
    positionals(node).nth(index)
}

fn positional_string(node: &KdlNode, index: usize) -> Option<String> {
    positional(node, index)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn string_prop(node: &KdlNode, key: &str) -> Option<String> {
    node.get(key)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn two_strings(node: &KdlNode, usage: &str) -> Result<(String, String), AuthzError> {
    match (positional_string(node, 0), positional_string(node, 1)) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(AuthzError::InvalidPolicy(format!(
            "`{}` node requires two string arguments (e.g. {usage})",
            node.name().value()
        ))),
    }
}

fn attribute_arg(node: &KdlNode) -> Result<String, AuthzError> {
    positional_string(node, 0).ok_or_else(|| {
        AuthzError::InvalidCondition(format!(
            "`{}` needs an attribute path as its first argument",
            node.name().value()
        ))
    })
}

fn effect_prop(node: &KdlNode) -> Result<Effect, AuthzError> {
    match string_prop(node, "effect") {
        Some(raw) => raw.parse(),
        None => Ok(Effect::Allow),
    }
}

fn time_prop(node: &KdlNode, key: &str) -> Result<Option<DateTime<Utc>>, AuthzError> {
    let Some(raw) = string_prop(node, key) else {
        return Ok(None);
    };
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| Some(t.with_timezone(&Utc)))
        .map_err(|e| {
            AuthzError::InvalidPolicy(format!(
                "`{key}` on `{}` is not an RFC 3339 timestamp: {e}",
                node.name().value()
            ))
        })
}

fn kdl_to_json(value: &KdlValue) -> Value {
    if let Some(s) = value.as_string() {
        Value::String(s.to_string())
    } else if let Some(i) = value.as_integer() {
        i64::try_from(i)
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(i as f64))
    } else if let Some(f) = value.as_float() {
        Value::from(f)
    } else if let Some(b) = value.as_bool() {
        Value::Bool(b)
    } else {
        Value::Null
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_parse_roles_with_parent() {
        let kdl = r#"
role "viewer" name="Viewer"
role "operator" name="Operator" parent="viewer"
"#;
        let policy = parse_kdl_document(kdl).unwrap();
        assert_eq!(policy.roles.len(), 2);
        let operator = &policy.roles[1];
        assert_eq!(operator.id, "operator");
        assert_eq!(operator.name, "Operator");
        assert_eq!(operator.parent.as_deref(), Some("viewer"));
        assert!(!operator.is_system);
    }

    #[test]
    fn test_role_name_defaults_to_id() {
        let policy = parse_kdl_document(r#"role "auditor""#).unwrap();
        assert_eq!(policy.roles[0].name, "auditor");
    }

    #[test]
    fn test_parse_permission_with_conditions() {
        let kdl = r#"
permission "batch-submit-ch1" resource="batch" action="submit" scope="channel" {
    when {
        equals "resource.channel" "ch1"
        time-window from="2025-01-01T09:00:00Z" until="2025-01-01T17:00:00Z"
        not {
            in-set "subject.department" "contractors" "interns"
        }
    }
}
"#;
        let policy = parse_kdl_document(kdl).unwrap();
        assert_eq!(policy.permissions.len(), 1);
        let p = &policy.permissions[0];
        assert_eq!(p.resource, "batch");
        assert_eq!(p.scope, Scope::Channel);

        let from = Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap();
        let until = Utc.with_ymd_and_hms(2025, 1, 1, 17, 0, 0).unwrap();
        assert_eq!(
            p.conditions,
            Some(Condition::all(vec![
                Condition::equals("resource.channel", "ch1"),
                Condition::time_window(Some(from), Some(until)),
                Condition::not(Condition::in_set(
                    "subject.department",
                    vec![json!("contractors"), json!("interns")]
                )),
            ]))
        );
    }

    #[test]
    fn test_numeric_condition_values() {
        let kdl = r#"
permission "big" resource="batch" action="submit" scope="global" {
    when {
        any {
            equals "resource.tier" 2
            equals "resource.weight" 1.5
        }
    }
}
"#;
        let policy = parse_kdl_document(kdl).unwrap();
        let ctx = AttributeContext::new().with("resource.tier", 2);
        let cond = policy.permissions[0].conditions.as_ref().unwrap();
        assert!(cond.evaluate(&ctx, Utc::now()));
    }

    #[test]
    fn test_parse_bind_assign_override() {
        let kdl = r#"
bind "operator" "batch-submit"
bind "auditor" "batch-delete" effect="deny"
assign "u1" "operator" from="2025-01-01T00:00:00Z" until="2026-01-01T00:00:00Z"
assign "u2" "auditor"
override "u1" "batch-delete" effect="deny"
"#;
        let policy = parse_kdl_document(kdl).unwrap();
        assert_eq!(policy.bindings.len(), 2);
        assert_eq!(policy.bindings[0].effect, Effect::Allow);
        assert_eq!(policy.bindings[1].effect, Effect::Deny);

        assert_eq!(policy.assignments.len(), 2);
        assert_eq!(
            policy.assignments[0].valid_until,
            Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(policy.assignments[1].valid_from, DateTime::<Utc>::UNIX_EPOCH);
        assert!(policy.assignments[1].valid_until.is_none());

        assert_eq!(policy.overrides.len(), 1);
        assert_eq!(policy.overrides[0].effect, Effect::Deny);
    }

    #[test]
    fn test_permission_missing_scope() {
        let kdl = r#"permission "p" resource="batch" action="read""#;
        let err = parse_kdl_document(kdl).unwrap_err();
        assert!(matches!(err, AuthzError::InvalidPolicy(_)));
    }

    #[test]
    fn test_unknown_scope_rejected() {
        let kdl = r#"permission "p" resource="batch" action="read" scope="tenant""#;
        let err = parse_kdl_document(kdl).unwrap_err();
        assert!(matches!(err, AuthzError::InvalidPolicy(_)));
    }

    #[test]
    fn test_unknown_predicate_rejected() {
        let kdl = r#"
permission "p" resource="batch" action="read" scope="global" {
    when {
        matches "resource.name" "prod-.*"
    }
}
"#;
        let err = parse_kdl_document(kdl).unwrap_err();
        assert!(matches!(err, AuthzError::InvalidCondition(_)));
    }

    #[test]
    fn test_empty_in_set_rejected() {
        let kdl = r#"
permission "p" resource="batch" action="read" scope="global" {
    when {
        in-set "subject.department"
    }
}
"#;
        let err = parse_kdl_document(kdl).unwrap_err();
        assert!(matches!(err, AuthzError::InvalidCondition(_)));
    }

    #[test]
    fn test_bad_timestamp_rejected() {
        let kdl = r#"assign "u1" "operator" from="yesterday""#;
        let err = parse_kdl_document(kdl).unwrap_err();
        assert!(matches!(err, AuthzError::InvalidPolicy(_)));
    }

    #[test]
    fn test_bind_requires_two_arguments() {
        let err = parse_kdl_document(r#"bind "operator""#).unwrap_err();
        assert!(matches!(err, AuthzError::InvalidPolicy(_)));
    }

    #[test]
    fn test_invalid_kdl_syntax() {
        let err = parse_kdl_document("role \"unterminated").unwrap_err();
        assert!(matches!(err, AuthzError::KdlParse(_)));
    }
}
