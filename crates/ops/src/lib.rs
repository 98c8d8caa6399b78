//! Trellis ops: the per-pod operational sidecar protocol.
//!
//! Three actions are used by scale orchestration: `switchover`, `leave_member` and `join_member`.
//! Older sidecars answer "not implemented"; callers wrap results in [`tolerate_not_implemented`].

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// The pod an action is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodTarget {
    pub namespace: String,
    pub pod: String,
    pub pod_ip: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpsAction {
    Switchover,
    LeaveMember,
    JoinMember,
}

impl OpsAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Switchover => "switchover",
            Self::LeaveMember => "leaveMember",
            Self::JoinMember => "joinMember",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OpsError {
    #[error("{0}: not implemented by sidecar")]
    NotImplemented(String),
    #[error("{0}: sidecar unreachable")]
    Unreachable(String),
    #[error("{action} on {pod} failed ({status}): {message}")]
    Failed { action: String, pod: String, status: u16, message: String },
}

impl OpsError {
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, Self::NotImplemented(_))
    }
}

#[async_trait]
pub trait SidecarOps: Send + Sync {
    /// Hand leadership away from `target`, optionally to `candidate`.
    async fn switchover(&self, target: &PodTarget, candidate: Option<&str>) -> Result<(), OpsError>;
    async fn leave_member(&self, target: &PodTarget) -> Result<(), OpsError>;
    async fn join_member(&self, target: &PodTarget) -> Result<(), OpsError>;
}

/// "Not implemented" is an older sidecar, not a failure.
pub fn tolerate_not_implemented(r: Result<(), OpsError>) -> Result<(), OpsError> {
    match r {
        Err(e) if e.is_not_implemented() => {
            debug!(error = %e, "sidecar action skipped");
            Ok(())
        }
        other => other,
    }
}

#[derive(Debug, Serialize)]
struct ActionRequest<'a> {
    pod: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    candidate: Option<&'a str>,
}

/// HTTP client for the sidecar listening on each pod's IP.
#[derive(Clone)]
pub struct HttpSidecar {
    client: reqwest::Client,
    port: u16,
}

impl HttpSidecar {
    pub fn new(port: u16, timeout: Duration) -> Self {
        let client = reqwest::Client::builder().timeout(timeout).build().unwrap_or_else(|_| reqwest::Client::new());
        Self { client, port }
    }

    fn url(&self, target: &PodTarget, action: OpsAction) -> Result<String, OpsError> {
        let ip = target.pod_ip.as_deref().filter(|s| !s.is_empty()).ok_or_else(|| OpsError::Unreachable(target.pod.clone()))?;
        Ok(format!("http://{ip}:{}/v1.0/{}", self.port, action.as_str()))
    }

    async fn call(&self, target: &PodTarget, action: OpsAction, candidate: Option<&str>) -> Result<(), OpsError> {
        counter!("trellis_ops_total", 1u64, "action" => action.as_str());
        let url = self.url(target, action)?;
        let resp = self
            .client
            .post(url)
            .json(&ActionRequest { pod: &target.pod, candidate })
            .send()
            .await
            .map_err(|e| OpsError::Unreachable(format!("{}: {e}", target.pod)))?;
        let status = resp.status();
        if status.is_success() {
            info!(pod = %target.pod, action = action.as_str(), "sidecar action done");
            return Ok(());
        }
        let body = resp.bytes().await.unwrap_or_default();
        Err(classify(action, &target.pod, status, &body))
    }
}

/// Map a non-success sidecar response to an error.
fn classify(action: OpsAction, pod: &str, status: StatusCode, body: &[u8]) -> OpsError {
    let message = serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(body).to_string());
    match status {
        StatusCode::NOT_IMPLEMENTED | StatusCode::NOT_FOUND => OpsError::NotImplemented(format!("{} on {pod}", action.as_str())),
        _ => OpsError::Failed { action: action.as_str().to_string(), pod: pod.to_string(), status: status.as_u16(), message },
    }
}

#[async_trait]
impl SidecarOps for HttpSidecar {
    async fn switchover(&self, target: &PodTarget, candidate: Option<&str>) -> Result<(), OpsError> {
        self.call(target, OpsAction::Switchover, candidate).await
    }

    async fn leave_member(&self, target: &PodTarget) -> Result<(), OpsError> {
        self.call(target, OpsAction::LeaveMember, None).await
    }

    async fn join_member(&self, target: &PodTarget) -> Result<(), OpsError> {
        self.call(target, OpsAction::JoinMember, None).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpsCall {
    pub action: OpsAction,
    pub pod: String,
    pub candidate: Option<String>,
}

/// Records every call; can pose as an old sidecar or an unreachable pod.
#[derive(Default)]
pub struct FakeOps {
    calls: Mutex<Vec<OpsCall>>,
    not_implemented: bool,
    unreachable: BTreeSet<String>,
}

impl FakeOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn not_implemented() -> Self {
        Self { not_implemented: true, ..Self::default() }
    }

    pub fn with_unreachable(mut self, pod: &str) -> Self {
        self.unreachable.insert(pod.to_string());
        self
    }

    pub fn calls(&self) -> Vec<OpsCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, action: OpsAction, target: &PodTarget, candidate: Option<&str>) -> Result<(), OpsError> {
        if let Ok(mut c) = self.calls.lock() {
            c.push(OpsCall { action, pod: target.pod.clone(), candidate: candidate.map(str::to_string) });
        }
        if self.unreachable.contains(&target.pod) {
            return Err(OpsError::Unreachable(target.pod.clone()));
        }
        if self.not_implemented {
            return Err(OpsError::NotImplemented(format!("{} on {}", action.as_str(), target.pod)));
        }
        Ok(())
    }
}

#[async_trait]
impl SidecarOps for FakeOps {
    async fn switchover(&self, target: &PodTarget, candidate: Option<&str>) -> Result<(), OpsError> {
        self.record(OpsAction::Switchover, target, candidate)
    }

    async fn leave_member(&self, target: &PodTarget) -> Result<(), OpsError> {
        self.record(OpsAction::LeaveMember, target, None)
    }

    async fn join_member(&self, target: &PodTarget) -> Result<(), OpsError> {
        self.record(OpsAction::JoinMember, target, None)
    }
}
