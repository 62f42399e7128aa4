/// Trait contracts for all Warden subsystems.
///
/// The validators, sinks, backends and gates are all defined here in
/// `warden-types` so that every crate can code against them without depending
/// on each other's concrete types.
use std::time::Duration;

use async_trait::async_trait;

use crate::actions::*;
use crate::cancel::CancelSignal;
use crate::config::{InputPolicy, OutputPolicy};
use crate::errors::WardenError;

// ============================================================
// Validation Traits
// ============================================================

/// Scans and transforms untrusted caller input before it reaches the model.
///
/// Implementations must be pure: the same text and policy always produce the
/// same report, and validating an already-transformed text yields the same
/// transformed text again.
pub trait InputValidator: Send + Sync {
    /// Validate a raw user turn against a caller-class input policy.
    fn validate(&self, raw_text: &str, policy: &InputPolicy) -> ValidationReport;
}

/// Scans realized model output before it reaches the caller.
///
/// Checks for leakage of the confidential system policy in addition to the
/// content rules applied to input.
pub trait OutputFilter: Send + Sync {
    /// Filter model output against the system policy and an output policy.
    fn filter(&self, output: &str, system_policy: &str, policy: &OutputPolicy)
        -> ValidationReport;
}

/// Pluggable scoring capability (e.g. an external classifier).
///
/// Scorers contribute findings alongside the built-in rules. They must not
/// block or perform I/O; a scorer that needs a remote model should cache or
/// precompute.
pub trait Scorer: Send + Sync {
    /// Name recorded as the rule name on every finding this scorer emits.
    fn name(&self) -> &str;

    /// Produce findings for `text`. Spans index into `text`.
    fn score(&self, text: &str) -> Vec<Finding>;
}

// ============================================================
// Backend Traits
// ============================================================

/// Opaque text-generation backend. Its output is always untrusted.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Send one completion request.
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, WardenError>;
}

/// Invocation function of one registered tool.
///
/// Handlers receive parameters that have already passed schema validation.
/// Timeouts, retries and authorization are the sandbox's responsibility.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Run the tool once.
    async fn invoke(&self, parameters: &Parameters) -> Result<serde_json::Value, WardenError>;
}

// ============================================================
// Audit Trait
// ============================================================

/// Append-only, ordered, queryable audit trail.
///
/// Events for one request are kept in append order and numbered by the sink.
/// No updates or deletes are permitted.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append an event. Returns the per-request sequence number assigned to it.
    async fn append(&self, event: AuditEvent) -> Result<u64, WardenError>;

    /// Query events. Results for a request are in sequence order.
    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, WardenError>;
}

// ============================================================
// Approval Trait
// ============================================================

/// Human-in-the-loop gate for high-risk or side-effecting actions.
///
/// A decision is always produced: a missing answer becomes `TimedOut`, which
/// callers must treat as a denial.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    /// Wait for a decision on `request`, at most `timeout`, or until cancelled.
    async fn request_approval(
        &self,
        request: ApprovalRequest,
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> ApprovalRecord;
}
