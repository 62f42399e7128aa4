//! Approval gate.
//!
//! A suspension point where a human (or an automated policy) decides on a
//! high-risk action. [`TimedApprovalGate`] wraps any [`Approver`] with a hard
//! deadline and cancellation: the wait always ends with a decision, and every
//! non-answer is a denial.
//!
//! | outcome                  | decision   | approver           |
//! |--------------------------|------------|--------------------|
//! | approver answered        | as given   | approver identity  |
//! | deadline passed          | `TimedOut` | `system:timeout`   |
//! | approver failed          | `Denied`   | `system:error`     |
//! | caller cancelled         | `Denied`   | `system:cancelled` |

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;
use warden_types::actions::{ApprovalDecision, ApprovalRecord, ApprovalRequest};
use warden_types::cancel::CancelSignal;
use warden_types::errors::WardenError;
use warden_types::traits::ApprovalGate;

/// Approver identity recorded when the deadline passes.
pub const SYSTEM_TIMEOUT: &str = "system:timeout";
/// Approver identity recorded when the approver fails.
pub const SYSTEM_ERROR: &str = "system:error";
/// Approver identity recorded when the caller cancels.
pub const SYSTEM_CANCELLED: &str = "system:cancelled";

/// An approver's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApproverVerdict {
    /// Whether the action may proceed.
    pub approved: bool,
    /// Who decided.
    pub approver: String,
}

/// Source of approval decisions. May wait indefinitely; the gate bounds it.
#[async_trait]
pub trait Approver: Send + Sync {
    /// Decide on one request.
    async fn decide(&self, request: &ApprovalRequest) -> Result<ApproverVerdict, WardenError>;
}

/// [`ApprovalGate`] with a hard timeout around an [`Approver`].
pub struct TimedApprovalGate {
    approver: Arc<dyn Approver>,
}

impl TimedApprovalGate {
    /// Gate over `approver`.
    pub fn new(approver: Arc<dyn Approver>) -> Self {
        Self { approver }
    }
}

#[async_trait]
impl ApprovalGate for TimedApprovalGate {
    async fn request_approval(
        &self,
        request: ApprovalRequest,
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> ApprovalRecord {
        info!(
            request_id = %request.request_id,
            approval_id = %request.id,
            tools = ?request.tools,
            timeout_secs = timeout.as_secs(),
            "awaiting approval"
        );

        let (decision, approver) = tokio::select! {
            _ = cancel.cancelled() => (ApprovalDecision::Denied, SYSTEM_CANCELLED.to_string()),
            answer = tokio::time::timeout(timeout, self.approver.decide(&request)) => match answer {
                Ok(Ok(verdict)) if verdict.approved => (ApprovalDecision::Approved, verdict.approver),
                Ok(Ok(verdict)) => (ApprovalDecision::Denied, verdict.approver),
                Ok(Err(e)) => {
                    warn!(approval_id = %request.id, error = %e, "approver failed, denying");
                    (ApprovalDecision::Denied, SYSTEM_ERROR.to_string())
                }
                Err(_) => (ApprovalDecision::TimedOut, SYSTEM_TIMEOUT.to_string()),
            },
        };

        info!(
            request_id = %request.request_id,
            approval_id = %request.id,
            decision = ?decision,
            approver = %approver,
            "approval decided"
        );
        ApprovalRecord {
            approval_id: request.id,
            decision,
            approver,
            decided_at: Utc::now(),
        }
    }
}

/// Answers every request the same way.
#[derive(Debug, Clone)]
pub struct StaticApprover {
    approved: bool,
    name: String,
}

impl StaticApprover {
    /// Approve everything as `name`.
    pub fn allow(name: impl Into<String>) -> Self {
        Self {
            approved: true,
            name: name.into(),
        }
    }

    /// Deny everything as `name`.
    pub fn deny(name: impl Into<String>) -> Self {
        Self {
            approved: false,
            name: name.into(),
        }
    }
}

#[async_trait]
impl Approver for StaticApprover {
    async fn decide(&self, _request: &ApprovalRequest) -> Result<ApproverVerdict, WardenError> {
        Ok(ApproverVerdict {
            approved: self.approved,
            approver: self.name.clone(),
        })
    }
}

type PendingMap = Mutex<HashMap<Uuid, (ApprovalRequest, oneshot::Sender<ApproverVerdict>)>>;

/// Parks each request until an operator resolves it.
#[derive(Default)]
pub struct ChannelApprover {
    pending: PendingMap,
}

/// Removes a pending entry when its waiter goes away (timeout or cancel).
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(&self.id);
    }
}

impl ChannelApprover {
    /// Create an approver with nothing pending.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests awaiting a decision, oldest first.
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let mut requests: Vec<ApprovalRequest> = map.values().map(|(r, _)| r.clone()).collect();
        requests.sort_by_key(|r| r.requested_at);
        requests
    }

    /// Deliver an operator decision for approval `id`.
    pub fn resolve(
        &self,
        id: Uuid,
        approver: impl Into<String>,
        approved: bool,
    ) -> Result<(), WardenError> {
        let entry = {
            let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            map.remove(&id)
        };
        let Some((_, tx)) = entry else {
            return Err(WardenError::Approval(format!("no pending approval {id}")));
        };
        tx.send(ApproverVerdict {
            approved,
            approver: approver.into(),
        })
        .map_err(|_| WardenError::Approval(format!("approval {id} is no longer awaited")))
    }
}

#[async_trait]
impl Approver for ChannelApprover {
    async fn decide(&self, request: &ApprovalRequest) -> Result<ApproverVerdict, WardenError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            map.insert(request.id, (request.clone(), tx));
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            id: request.id,
        };
        rx.await
            .map_err(|_| WardenError::Approval("approval channel closed".to_string()))
    }
}
