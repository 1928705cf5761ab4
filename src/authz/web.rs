use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use miette::IntoDiagnostic;
use tokio::time::Instant;

use crate::authz::service::{AuthorizationService, AuthorizeRequest};
use crate::authz::types::{AuthorizeAnyBody, AuthorizeBody, Invalidation};

pub fn router(service: Arc<AuthorizationService>) -> Router {
    Router::new()
        .route("/v1/authorize", post(handle_authorize))
        .route("/v1/authorize/any", post(handle_authorize_any))
        .route("/v1/invalidate", post(handle_invalidate))
        .route("/v1/cache/stats", get(handle_cache_stats))
        .route("/healthz", get(health))
        .with_state(service)
}

pub async fn serve(addr: SocketAddr, router: Router) -> miette::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .into_diagnostic()?;
    tracing::info!(%addr, "Authorization API listening");
    axum::serve(listener, router).await.into_diagnostic()?;
    Ok(())
}

async fn handle_authorize(
    State(service): State<Arc<AuthorizationService>>,
    Json(body): Json<AuthorizeBody>,
) -> impl IntoResponse {
    let request = AuthorizeRequest::from(body);
    match service.authorize(&request).await {
        Ok(decision) => Json(decision).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_authorize_any(
    State(service): State<Arc<AuthorizationService>>,
    Json(body): Json<AuthorizeAnyBody>,
) -> impl IntoResponse {
    let deadline = body
        .timeout_ms
        .map(|ms| Instant::now() + Duration::from_millis(ms));
    match service
        .authorize_any(&body.subject, &body.checks, &body.context, deadline)
        .await
    {
        Ok(decision) => Json(decision).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_invalidate(
    State(service): State<Arc<AuthorizationService>>,
    Json(invalidation): Json<Invalidation>,
) -> impl IntoResponse {
    tracing::info!(?invalidation, "Cache invalidation requested");
    service.invalidate(&invalidation).await;
    StatusCode::NO_CONTENT
}

async fn handle_cache_stats(State(service): State<Arc<AuthorizationService>>) -> impl IntoResponse {
    Json(service.cache().stats())
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::cache::{CacheConfig, DecisionCache};
    use crate::authz::remote::LocalOnly;
    use crate::authz::service::ServiceConfig;
    use crate::authz::store::MemoryPolicyStore;
    use crate::authz::types::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{DateTime, Utc};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app() -> (Router, Arc<MemoryPolicyStore>) {
        let store = Arc::new(MemoryPolicyStore::new());
        store.insert_role(Role {
            id: "operator".into(),
            name: "Operator".into(),
            parent_id: None,
            level: 0,
            is_system: false,
        });
        store.insert_permission(Permission {
            id: "batch-submit".into(),
            resource: "batch".into(),
            action: "submit".into(),
            scope: Scope::Organization,
            conditions: None,
        });
        store
            .bind("operator", "batch-submit", Effect::Allow)
            .unwrap();
        store.assign(SubjectRoleAssignment {
            subject_id: "u1".into(),
            role_id: "operator".into(),
            valid_from: DateTime::<Utc>::UNIX_EPOCH,
            valid_until: None,
        });

        let service = AuthorizationService::new(
            store.clone(),
            Arc::new(DecisionCache::local_only(CacheConfig::default())),
            Arc::new(LocalOnly),
            ServiceConfig::default(),
        );
        (router(Arc::new(service)), store)
    }

    async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_authorize_endpoint() {
        let (app, _) = app();
        let (status, body) = post_json(
            app.clone(),
            "/v1/authorize",
            json!({ "subject": "u1", "resource": "batch", "action": "submit", "scope": "self" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["allowed"], true);
        assert_eq!(body["reason"], "role_grant");
        assert_eq!(body["matched_permission"], "batch-submit");

        let (_, body) = post_json(
            app,
            "/v1/authorize",
            json!({ "subject": "u2", "resource": "batch", "action": "submit", "scope": "self" }),
        )
        .await;
        assert_eq!(body["allowed"], false);
        assert_eq!(body["reason"], "no_matching_permission");
    }

    #[tokio::test]
    async fn test_authorize_any_endpoint() {
        let (app, _) = app();
        let (status, body) = post_json(
            app,
            "/v1/authorize/any",
            json!({
                "subject": "u1",
                "checks": [
                    { "resource": "batch", "action": "delete", "scope": "self" },
                    { "resource": "batch", "action": "submit", "scope": "channel" }
                ]
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["allowed"], true);
    }

    #[tokio::test]
    async fn test_invalidate_endpoint() {
        let (app, store) = app();
        let request = json!({ "subject": "u1", "resource": "batch", "action": "submit", "scope": "self" });

        let (_, body) = post_json(app.clone(), "/v1/authorize", request.clone()).await;
        assert_eq!(body["allowed"], true);

        store.revoke("u1", "operator");
        let (status, _) = post_json(app.clone(), "/v1/invalidate", json!({ "subject": "u1" })).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, body) = post_json(app, "/v1/authorize", request).await;
        assert_eq!(body["allowed"], false);
    }

    #[tokio::test]
    async fn test_malformed_body_rejected() {
        let (app, _) = app();
        let (status, _) = post_json(
            app,
            "/v1/authorize",
            json!({ "subject": "u1", "resource": "batch", "action": "submit", "scope": "galaxy" }),
        )
        .await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app();
        let resp = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
