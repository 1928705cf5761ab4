use chrono::{DateTime, Utc};

use crate::authz::matcher::{Candidate, Source};
use crate::authz::types::*;

/// Result of evaluating candidates locally, before any remote confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalDecision {
    pub decision: Decision,
    /// False when the outcome depends on caller attributes or a pinned clock.
    pub cacheable: bool,
    /// Next instant a time window among the candidates opens or closes.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Combine ordered candidates into one decision.
///
/// Any applicable deny wins, whatever its position. Otherwise the first
/// applicable allow decides. Conditions are evaluated at `context.time`, or at
/// `now` when the caller did not pin a time.
pub fn decide(
    candidates: &[Candidate],
    context: &AttributeContext,
    now: DateTime<Utc>,
) -> LocalDecision {
    let at = context.time.unwrap_or(now);

    let mut cacheable = true;
    let mut expires_at: Option<DateTime<Utc>> = None;
    for cond in candidates.iter().filter_map(|c| c.permission.conditions.as_ref()) {
        if cond.references_attributes() || (context.time.is_some() && cond.references_time()) {
            cacheable = false;
        }
        if let Some(next) = cond.next_transition(at) {
            expires_at = Some(expires_at.map_or(next, |e| e.min(next)));
        }
    }

    // Missing attributes never grant: an allow needs its conditions met, a
    // deny applies unless its conditions are refuted.
    let applicable = |c: &Candidate| match &c.permission.conditions {
        None => true,
        Some(cond) => {
            let missing = cond.missing_attributes(context);
            if !missing.is_empty() {
                tracing::warn!(
                    permission = %c.permission.id,
                    effect = %c.effect,
                    missing = ?missing,
                    "attribute context incomplete, failing closed"
                );
            }
            match c.effect {
                Effect::Allow => cond.evaluate(context, at),
                Effect::Deny => !cond.refuted(context, at),
            }
        }
    };

    let decision = if let Some(deny) = candidates
        .iter()
        .filter(|c| c.effect == Effect::Deny)
        .find(|c| applicable(*c))
    {
        let reason = match deny.source {
            Source::Override => DecisionReason::OverrideDeny,
            Source::Role(_) => DecisionReason::RoleDeny,
        };
        Decision::deny(Some(deny.permission.id.clone()), reason, at)
    } else if let Some(allow) = candidates
        .iter()
        .filter(|c| c.effect == Effect::Allow)
        .find(|c| applicable(*c))
    {
        let reason = match allow.source {
            Source::Override => DecisionReason::OverrideAllow,
            Source::Role(_) => DecisionReason::RoleGrant,
        };
        Decision::allow(allow.permission.id.clone(), reason, at)
    } else if candidates.is_empty() {
        Decision::deny(None, DecisionReason::NoMatchingPermission, at)
    } else {
        Decision::deny(None, DecisionReason::ConditionsNotMet, at)
    };

    LocalDecision {
        decision,
        cacheable,
        expires_at,
    }
}
