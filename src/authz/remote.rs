//! Optional confirmation of local decisions by a separately deployed policy
//! engine. The HTTP client speaks the OPA data API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::authz::errors::RemotePolicyUnavailable;
use crate::authz::types::*;

/// The tuple submitted for remote evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemotePolicyRequest {
    pub subject: SubjectId,
    pub resource: String,
    pub action: String,
    pub scope: Scope,
    pub time: DateTime<Utc>,
    pub context: AttributeContext,
}

impl RemotePolicyRequest {
    /// Flat attribute map sent as `input`. Context attributes are prefixed with
    /// `context.` and nested objects flattened to dot paths.
    pub fn input(&self) -> Map<String, Value> {
        let mut input = Map::new();
        input.insert("subject".into(), Value::String(self.subject.clone()));
        input.insert("resource".into(), Value::String(self.resource.clone()));
        input.insert("action".into(), Value::String(self.action.clone()));
        input.insert("scope".into(), Value::String(self.scope.as_str().into()));
        input.insert("time".into(), Value::String(self.time.to_rfc3339()));
        for (key, value) in self.context.flatten() {
            input.insert(format!("context.{key}"), value);
        }
        input
    }
}

#[async_trait]
pub trait RemotePolicyEvaluator: Send + Sync {
    /// Whether a remote engine takes part in decisions at all.
    fn is_configured(&self) -> bool;

    /// Callers bound the wait; see [`evaluate_remote`].
    async fn evaluate(
        &self,
        request: &RemotePolicyRequest,
    ) -> Result<bool, RemotePolicyUnavailable>;
}

/// Local decisions stand alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalOnly;

#[async_trait]
impl RemotePolicyEvaluator for LocalOnly {
    fn is_configured(&self) -> bool {
        false
    }

    async fn evaluate(
        &self,
        _request: &RemotePolicyRequest,
    ) -> Result<bool, RemotePolicyUnavailable> {
        Err(RemotePolicyUnavailable("no remote evaluator configured".into()))
    }
}

#[derive(Debug, Serialize)]
struct OpaQuery<'a> {
    input: &'a Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct OpaAnswer {
    result: Option<bool>,
}

/// Client for `POST {base}/v1/data/{policy_path}`.
#[derive(Debug, Clone)]
pub struct OpaEvaluator {
    client: reqwest::Client,
    base_url: String,
    policy_path: String,
}

impl OpaEvaluator {
    pub fn new(base_url: &str, policy_path: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            policy_path: policy_path.trim_matches('/').to_string(),
        }
    }

    fn decision_url(&self) -> String {
        format!("{}/v1/data/{}", self.base_url, self.policy_path)
    }

    /// Probe `GET {base}/health`.
    pub async fn health(&self, timeout: Duration) -> Result<(), RemotePolicyUnavailable> {
        let resp = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| RemotePolicyUnavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(RemotePolicyUnavailable(format!(
                "health check returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RemotePolicyEvaluator for OpaEvaluator {
    fn is_configured(&self) -> bool {
        true
    }

    async fn evaluate(
        &self,
        request: &RemotePolicyRequest,
    ) -> Result<bool, RemotePolicyUnavailable> {
        let input = request.input();
        let resp = self
            .client
            .post(self.decision_url())
            .json(&OpaQuery { input: &input })
            .send()
            .await
            .map_err(|e| RemotePolicyUnavailable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RemotePolicyUnavailable(format!(
                "policy engine returned {status}"
            )));
        }

        let answer: OpaAnswer = resp
            .json()
            .await
            .map_err(|e| RemotePolicyUnavailable(format!("malformed response: {e}")))?;
        answer
            .result
            .ok_or_else(|| RemotePolicyUnavailable("response has no `result`".into()))
    }
}

/// Outcome of a remote check: `ok == false` means no verdict was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteCheck {
    pub allowed: bool,
    pub ok: bool,
}

/// Ask `evaluator` for a verdict within `timeout`. Never fails; any problem is
/// reported as `ok == false`.
pub async fn evaluate_remote(
    evaluator: &dyn RemotePolicyEvaluator,
    request: &RemotePolicyRequest,
    timeout: Duration,
) -> RemoteCheck {
    let unavailable = RemoteCheck {
        allowed: false,
        ok: false,
    };
    if timeout.is_zero() {
        tracing::warn!(subject = %request.subject, "deadline exhausted before remote check");
        return unavailable;
    }

    match tokio::time::timeout(timeout, evaluator.evaluate(request)).await {
        Ok(Ok(allowed)) => RemoteCheck { allowed, ok: true },
        Ok(Err(e)) => {
            tracing::warn!(subject = %request.subject, error = %e, "remote policy check failed");
            unavailable
        }
        Err(_) => {
            tracing::warn!(
                subject = %request.subject,
                timeout_ms = timeout.as_millis() as u64,
                "remote policy check timed out"
            );
            unavailable
        }
    }
}
