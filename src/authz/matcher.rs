use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::authz::errors::AuthzError;
use crate::authz::store::{bounded, PolicyStore};
use crate::authz::types::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Override,
    Role(RoleId),
}

/// A permission that may decide a request, with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub permission: Permission,
    pub effect: Effect,
    pub source: Source,
}

impl Candidate {
    fn sort_key(&self) -> (bool, u8, u8, &str) {
        let source_rank = match self.source {
            Source::Override => 0,
            Source::Role(_) => 1,
        };
        (
            self.permission.is_wildcard(),
            self.permission.scope.breadth(),
            source_rank,
            self.permission.id.as_str(),
        )
    }
}

/// Ordered candidates for one request, and the earliest instant at which one
/// of the subject's active overrides lapses.
#[derive(Debug, Clone, PartialEq)]
pub struct Matched {
    pub candidates: Vec<Candidate>,
    pub valid_until: Option<DateTime<Utc>>,
}

/// The request a set of candidates is matched against.
#[derive(Debug, Clone, Copy)]
pub struct Target<'r> {
    pub resource: &'r str,
    pub action: &'r str,
    pub scope: Scope,
}

pub struct PermissionMatcher<'a> {
    store: &'a dyn PolicyStore,
    timeout: Duration,
}

impl<'a> PermissionMatcher<'a> {
    pub fn new(store: &'a dyn PolicyStore, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Fetch bindings of `roles` and the subject's overrides, then order the
    /// ones applicable to `target`. A decision built from them stops holding
    /// once any override lapses, so the result carries that bound.
    pub async fn match_candidates(
        &self,
        roles: &BTreeSet<RoleId>,
        subject: &str,
        target: Target<'_>,
        now: DateTime<Utc>,
    ) -> Result<Matched, AuthzError> {
        let (grants, overrides) = tokio::try_join!(
            bounded(
                self.timeout,
                "get_role_permissions",
                self.store.get_role_permissions(roles)
            ),
            bounded(
                self.timeout,
                "get_overrides",
                self.store.get_overrides(subject, now)
            ),
        )?;

        let overrides: Vec<OverrideGrant> = overrides
            .into_iter()
            .filter(|o| o.entry.is_active_at(now))
            .collect();
        let valid_until = overrides
            .iter()
            .filter_map(|o| o.entry.valid_until)
            .min();

        Ok(Matched {
            candidates: order_candidates(grants, overrides, target),
            valid_until,
        })
    }
}

/// Keep the grants that apply to `target` and put them in evaluation order:
/// exact resources before `"*"`, narrowest scope first, overrides before
/// role bindings, then permission id. A permission reached through several
/// roles with the same effect appears once.
pub fn order_candidates(
    grants: Vec<RoleGrant>,
    overrides: Vec<OverrideGrant>,
    target: Target<'_>,
) -> Vec<Candidate> {
    let applies = |p: &Permission| {
        p.matches(target.resource, target.action) && p.scope.covers(target.scope)
    };

    let mut candidates: Vec<Candidate> = overrides
        .into_iter()
        .filter(|o| applies(&o.permission))
        .map(|o| Candidate {
            effect: o.entry.effect,
            permission: o.permission,
            source: Source::Override,
        })
        .chain(
            grants
                .into_iter()
                .filter(|g| applies(&g.permission))
                .map(|g| Candidate {
                    effect: g.effect,
                    permission: g.permission,
                    source: Source::Role(g.role_id),
                }),
        )
        .collect();

    candidates.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    let mut seen: HashSet<(PermissionId, Effect, bool)> = HashSet::new();
    candidates.retain(|c| {
        seen.insert((
            c.permission.id.clone(),
            c.effect,
            matches!(c.source, Source::Override),
        ))
    });
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::store::MemoryPolicyStore;

    fn perm(id: &str, resource: &str, action: &str, scope: Scope) -> Permission {
        Permission {
            id: id.into(),
            resource: resource.into(),
            action: action.into(),
            scope,
            conditions: None,
        }
    }

    fn grant(role: &str, permission: Permission, effect: Effect) -> RoleGrant {
        RoleGrant {
            role_id: role.into(),
            effect,
            permission,
        }
    }

    fn override_of(permission: Permission, effect: Effect) -> OverrideGrant {
        OverrideGrant {
            entry: SubjectPermissionOverride {
                subject_id: "u1".into(),
                permission_id: permission.id.clone(),
                effect,
                valid_from: None,
                valid_until: None,
            },
            permission,
        }
    }

    const BATCH_SUBMIT_ORG: Target<'static> = Target {
        resource: "batch",
        action: "submit",
        scope: Scope::Organization,
    };

    #[test]
    fn test_filters_by_resource_action_and_scope() {
        let grants = vec![
            grant("r", perm("p-org", "batch", "submit", Scope::Organization), Effect::Allow),
            grant("r", perm("p-read", "batch", "read", Scope::Global), Effect::Allow),
            grant("r", perm("p-chan", "batch", "submit", Scope::Channel), Effect::Allow),
            grant("r", perm("p-other", "ledger", "submit", Scope::Global), Effect::Allow),
        ];
        let ids: Vec<_> = order_candidates(grants, vec![], BATCH_SUBMIT_ORG)
            .into_iter()
            .map(|c| c.permission.id)
            .collect();
        assert_eq!(ids, vec!["p-org"]);
    }

    #[test]
    fn test_order_narrowest_override_wildcard_last() {
        let grants = vec![
            grant("r", perm("p-star", "*", "submit", Scope::Organization), Effect::Allow),
            grant("r", perm("p-global", "batch", "submit", Scope::Global), Effect::Allow),
            grant("r", perm("p-org", "batch", "submit", Scope::Organization), Effect::Allow),
        ];
        let overrides = vec![override_of(
            perm("o-org", "batch", "submit", Scope::Organization),
            Effect::Deny,
        )];

        let ordered = order_candidates(grants, overrides, BATCH_SUBMIT_ORG);
        let ids: Vec<_> = ordered.iter().map(|c| c.permission.id.as_str()).collect();
        assert_eq!(ids, vec!["o-org", "p-org", "p-global", "p-star"]);
        assert_eq!(ordered[0].source, Source::Override);
    }

    #[test]
    fn test_same_permission_through_two_roles_deduplicated() {
        let p = perm("p", "batch", "submit", Scope::Global);
        let grants = vec![
            grant("viewer", p.clone(), Effect::Allow),
            grant("operator", p.clone(), Effect::Allow),
            grant("auditor", p, Effect::Deny),
        ];
        let ordered = order_candidates(grants, vec![], BATCH_SUBMIT_ORG);
        assert_eq!(ordered.len(), 2);
    }

    #[tokio::test]
    async fn test_match_candidates_reads_store() {
        let store = MemoryPolicyStore::new();
        store.insert_permission(perm("p", "batch", "submit", Scope::Organization));
        store.insert_permission(perm("d", "batch", "submit", Scope::Organization));
        store.bind("operator", "p", Effect::Allow).unwrap();
        store.add_override(SubjectPermissionOverride {
            subject_id: "u1".into(),
            permission_id: "d".into(),
            effect: Effect::Deny,
            valid_from: None,
            valid_until: None,
        });

        let roles = BTreeSet::from(["operator".to_string()]);
        let matcher = PermissionMatcher::new(&store, Duration::from_secs(1));
        let matched = matcher
            .match_candidates(&roles, "u1", BATCH_SUBMIT_ORG, Utc::now())
            .await
            .unwrap();
        assert_eq!(matched.valid_until, None);
        let ordered = matched.candidates;
        assert_eq!(ordered.len(), 2);
        assert_eq!(ordered[0].permission.id, "d");
        assert_eq!(ordered[0].effect, Effect::Deny);
        assert_eq!(ordered[1].source, Source::Role("operator".into()));
    }

    #[tokio::test]
    async fn test_match_candidates_reports_earliest_override_lapse() {
        let now = Utc::now();
        let soon = now + chrono::Duration::minutes(5);
        let later = now + chrono::Duration::hours(1);

        let store = MemoryPolicyStore::new();
        store.insert_permission(perm("p", "batch", "submit", Scope::Organization));
        store.insert_permission(perm("q", "report", "read", Scope::Organization));
        store.add_override(SubjectPermissionOverride {
            subject_id: "u1".into(),
            permission_id: "p".into(),
            effect: Effect::Allow,
            valid_from: None,
            valid_until: Some(later),
        });
        // lapses first even though it does not apply to the target
        store.add_override(SubjectPermissionOverride {
            subject_id: "u1".into(),
            permission_id: "q".into(),
            effect: Effect::Deny,
            valid_from: None,
            valid_until: Some(soon),
        });
        // already lapsed
        store.add_override(SubjectPermissionOverride {
            subject_id: "u1".into(),
            permission_id: "p".into(),
            effect: Effect::Deny,
            valid_from: None,
            valid_until: Some(now - chrono::Duration::minutes(1)),
        });

        let matched = PermissionMatcher::new(&store, Duration::from_secs(1))
            .match_candidates(&BTreeSet::new(), "u1", BATCH_SUBMIT_ORG, now)
            .await
            .unwrap();
        assert_eq!(matched.candidates.len(), 1);
        assert_eq!(matched.candidates[0].effect, Effect::Allow);
        assert_eq!(matched.valid_until, Some(soon));
    }
}
