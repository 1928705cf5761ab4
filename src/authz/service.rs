use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::authz::cache::{self, DecisionCache, Lookup};
use crate::authz::engine::decide;
use crate::authz::errors::AuthzError;
use crate::authz::matcher::{PermissionMatcher, Target};
use crate::authz::remote::{evaluate_remote, RemotePolicyEvaluator, RemotePolicyRequest};
use crate::authz::resolver::{ResolvedRoles, RoleResolver};
use crate::authz::store::PolicyStore;
use crate::authz::types::*;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub store_timeout: Duration,
    pub remote_timeout: Duration,
    /// Deny instead of degrading when the remote evaluator cannot answer.
    pub fail_closed_on_degraded: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_millis(500),
            remote_timeout: Duration::from_millis(200),
            fail_closed_on_degraded: false,
        }
    }
}

/// One authorization question.
#[derive(Debug, Clone)]
pub struct AuthorizeRequest {
    pub subject: SubjectId,
    pub resource: String,
    pub action: String,
    pub scope: Scope,
    pub context: AttributeContext,
    /// Bounds the remote check; an exhausted deadline degrades the decision.
    pub deadline: Option<Instant>,
}

impl AuthorizeRequest {
    pub fn new(subject: &str, resource: &str, action: &str, scope: Scope) -> Self {
        Self {
            subject: subject.to_string(),
            resource: resource.to_string(),
            action: action.to_string(),
            scope,
            context: AttributeContext::default(),
            deadline: None,
        }
    }

    pub fn with_context(mut self, context: AttributeContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

impl From<AuthorizeBody> for AuthorizeRequest {
    fn from(body: AuthorizeBody) -> Self {
        Self {
            subject: body.subject,
            resource: body.resource,
            action: body.action,
            scope: body.scope,
            context: body.context,
            deadline: body
                .timeout_ms
                .map(|ms| Instant::now() + Duration::from_millis(ms)),
        }
    }
}

/// Entry point answering authorization questions.
///
/// Holds no global state; store, cache and remote evaluator are injected so
/// several independently configured services can live in one process.
pub struct AuthorizationService {
    store: Arc<dyn PolicyStore>,
    cache: Arc<DecisionCache>,
    remote: Arc<dyn RemotePolicyEvaluator>,
    config: ServiceConfig,
}

impl AuthorizationService {
    pub fn new(
        store: Arc<dyn PolicyStore>,
        cache: Arc<DecisionCache>,
        remote: Arc<dyn RemotePolicyEvaluator>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            store,
            cache,
            remote,
            config,
        }
    }

    pub fn cache(&self) -> &DecisionCache {
        &self.cache
    }

    pub async fn authorize(&self, request: &AuthorizeRequest) -> Result<Decision, AuthzError> {
        let now = Utc::now();
        let at = request.context.time.unwrap_or(now);
        // a pinned clock asks about a different instant than the cache holds
        let use_cache = request.context.time.is_none();

        let key = cache::decision_key(
            &request.subject,
            &request.resource,
            &request.action,
            request.scope,
        );
        let token = if use_cache {
            match self.cache.get_decision(&key, &request.subject).await {
                Lookup::Hit(decision) => {
                    tracing::debug!(
                        subject = %request.subject,
                        key = %key,
                        allowed = decision.allowed,
                        "cached decision"
                    );
                    return Ok(decision);
                }
                Lookup::Miss(token) => Some(token),
            }
        } else {
            None
        };

        let resolved = self.resolve(&request.subject, at, use_cache).await?;

        let target = Target {
            resource: &request.resource,
            action: &request.action,
            scope: request.scope,
        };
        let matched = PermissionMatcher::new(self.store.as_ref(), self.config.store_timeout)
            .match_candidates(&resolved.roles, &request.subject, target, at)
            .await?;

        let local = decide(&matched.candidates, &request.context, now);
        let mut decision = local.decision;

        if decision.allowed && self.remote.is_configured() {
            decision = self.confirm_remotely(request, at, decision).await;
        }

        tracing::debug!(
            subject = %request.subject,
            resource = %request.resource,
            action = %request.action,
            scope = %request.scope,
            allowed = decision.allowed,
            reason = ?decision.reason,
            degraded = decision.degraded,
            "authorization decided"
        );

        if let Some(token) = token {
            if local.cacheable && !decision.degraded {
                let expires_at = min_opt(
                    min_opt(local.expires_at, resolved.valid_until),
                    matched.valid_until,
                );
                self.cache
                    .put_decision(
                        &key,
                        &request.subject,
                        &resolved.roles,
                        &decision,
                        expires_at,
                        token,
                    )
                    .await;
            }
        }

        Ok(decision)
    }

    /// Evaluate several targets for one subject; the first allowed decision is
    /// returned, otherwise the last denial.
    pub async fn authorize_any(
        &self,
        subject: &str,
        targets: &[CheckTarget],
        context: &AttributeContext,
        deadline: Option<Instant>,
    ) -> Result<Decision, AuthzError> {
        let mut last = None;
        for target in targets {
            let request = AuthorizeRequest {
                subject: subject.to_string(),
                resource: target.resource.clone(),
                action: target.action.clone(),
                scope: target.scope,
                context: context.clone(),
                deadline,
            };
            let decision = self.authorize(&request).await?;
            if decision.allowed {
                return Ok(decision);
            }
            last = Some(decision);
        }
        Ok(last.unwrap_or_else(|| {
            Decision::deny(None, DecisionReason::NoMatchingPermission, Utc::now())
        }))
    }

    pub async fn invalidate(&self, invalidation: &Invalidation) {
        self.cache.invalidate(invalidation).await;
    }

    /// Effective roles of `subject` now.
    pub async fn effective_roles(&self, subject: &str) -> Result<BTreeSet<RoleId>, AuthzError> {
        Ok(self.resolve(subject, Utc::now(), true).await?.roles)
    }

    async fn resolve(
        &self,
        subject: &str,
        at: DateTime<Utc>,
        use_cache: bool,
    ) -> Result<ResolvedRoles, AuthzError> {
        if !use_cache {
            return RoleResolver::new(self.store.as_ref(), self.config.store_timeout)
                .resolve(subject, at)
                .await;
        }

        let token = match self.cache.get_roles(subject).await {
            Lookup::Hit(resolved) => return Ok(resolved),
            Lookup::Miss(token) => token,
        };
        let resolved = RoleResolver::new(self.store.as_ref(), self.config.store_timeout)
            .resolve(subject, at)
            .await?;
        self.cache.put_roles(subject, &resolved, token).await;
        Ok(resolved)
    }

    async fn confirm_remotely(
        &self,
        request: &AuthorizeRequest,
        at: DateTime<Utc>,
        local: Decision,
    ) -> Decision {
        let timeout = match request.deadline {
            Some(deadline) => self
                .config
                .remote_timeout
                .min(deadline.saturating_duration_since(Instant::now())),
            None => self.config.remote_timeout,
        };
        let remote_request = RemotePolicyRequest {
            subject: request.subject.clone(),
            resource: request.resource.clone(),
            action: request.action.clone(),
            scope: request.scope,
            time: at,
            context: request.context.clone(),
        };

        let check = evaluate_remote(self.remote.as_ref(), &remote_request, timeout).await;
        match (check.ok, check.allowed) {
            (true, true) => local,
            (true, false) => Decision {
                allowed: false,
                outcome: Outcome::Denied,
                reason: DecisionReason::RemoteDenied,
                ..local
            },
            (false, _) if self.config.fail_closed_on_degraded => Decision {
                allowed: false,
                outcome: Outcome::DeniedDegraded,
                reason: DecisionReason::RemoteUnavailable,
                degraded: true,
                ..local
            },
            (false, _) => Decision {
                degraded: true,
                ..local
            },
        }
    }
}

fn min_opt(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
