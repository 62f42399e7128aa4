//! Tool sandbox.
//!
//! Executes one tool call on behalf of a validated plan, re-checking
//! everything itself regardless of what earlier stages decided. Per-call state
//! machine:
//!
//! ```text
//! Idle → Authorizing → Executing → Completed
//!             │             ├────→ TimedOut
//!             │             └────→ Errored
//!             └──────────────────→ Blocked
//! ```
//!
//! Each attempt re-passes authorization (scope, parameter schema, circuit
//! breaker). Failed attempts are retried at most twice with exponential
//! backoff. Side-effecting tools require an approval unless pre-approved by
//! policy. Every call, including refused and cancelled ones, yields a
//! [`ToolInvocationRecord`] that is appended to the audit sink before
//! `execute` returns.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use warden_types::actions::{
    ApprovalDecision, ApprovalRequest, AuditEvent, AuditEventKind, InvocationOutcome, Parameters,
    PipelineState, RequestContext, ToolInvocationRecord,
};
use warden_types::cancel::CancelSignal;
use warden_types::config::{CallerClassPolicy, CircuitBreakerConfig};
use warden_types::config_loader::MAX_TOOL_RETRIES;
use warden_types::traits::{ApprovalGate, AuditSink};

use crate::circuit_breaker::CircuitBreakers;
use crate::registry::ToolRegistry;
use crate::schema::validate_parameters;

/// Longest result summary kept in an invocation record.
const SUMMARY_MAX_CHARS: usize = 256;

type CallResult = Result<serde_json::Value, (SandboxFailure, String)>;

/// Per-call states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Not yet started.
    Idle,
    /// Checking scope, parameters, breaker and approval.
    Authorizing,
    /// Handler running.
    Executing,
    /// Handler returned a result.
    Completed,
    /// Every permitted attempt exceeded the timeout.
    TimedOut,
    /// The sandbox refused the call.
    Blocked,
    /// Every permitted attempt failed.
    Errored,
}

/// Why a call did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxFailure {
    /// The tool is not registered.
    UnknownTool,
    /// The tool is outside the caller's scopes.
    Unauthorized,
    /// The per-request call cap is exhausted.
    CallLimit,
    /// Parameters fail the tool's schema.
    InvalidParameters,
    /// An approver refused, or no approval gate is configured.
    ApprovalDenied,
    /// No approval decision before the deadline.
    ApprovalTimeout,
    /// The tool's circuit breaker is open.
    CircuitOpen,
    /// The handler failed on every attempt.
    Error,
    /// The handler exceeded its timeout on every attempt.
    TimedOut,
    /// The caller cancelled the request.
    Cancelled,
    /// The invocation or its approval could not be written to the audit sink.
    AuditUnavailable,
}

/// Per-caller-class execution limits.
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    /// Maximum tool calls per request.
    pub max_tool_calls: u32,
    /// Retries after a failed attempt (clamped to 2).
    pub retries: u32,
    /// Base backoff, doubled per retry.
    pub retry_backoff: Duration,
    /// Wait limit for per-call approvals.
    pub approval_timeout: Duration,
    /// Side-effecting tools that run without per-call approval.
    pub pre_approved_tools: BTreeSet<String>,
}

impl SandboxLimits {
    /// Limits taken from a caller class policy.
    pub fn from_policy(policy: &CallerClassPolicy) -> Self {
        Self {
            max_tool_calls: policy.max_tool_calls,
            retries: policy.tool_retries.min(MAX_TOOL_RETRIES),
            retry_backoff: Duration::from_millis(policy.retry_backoff_ms),
            approval_timeout: Duration::from_secs(policy.approval.timeout_secs),
            pre_approved_tools: policy.approval.pre_approved_tools.clone(),
        }
    }
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self::from_policy(&CallerClassPolicy::default())
    }
}

/// One requested tool call.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Tool name.
    pub tool_name: String,
    /// Parameters as planned.
    pub parameters: Parameters,
    /// Plan step index, if any.
    pub step_index: Option<usize>,
    /// Whether an approval for this call was already granted upstream.
    pub approved: bool,
}

impl ToolCall {
    /// A call with no plan position and no prior approval.
    pub fn new(tool_name: impl Into<String>, parameters: Parameters) -> Self {
        Self {
            tool_name: tool_name.into(),
            parameters,
            step_index: None,
            approved: false,
        }
    }

    /// Set the plan step index.
    pub fn at_step(mut self, index: usize) -> Self {
        self.step_index = Some(index);
        self
    }

    /// Mark the call as approved upstream.
    pub fn pre_approved(mut self) -> Self {
        self.approved = true;
        self
    }
}

/// Result of one sandboxed call.
#[derive(Debug, Clone)]
pub struct SandboxOutcome {
    /// The invocation record. Audited unless `failure` is `AuditUnavailable`.
    pub record: ToolInvocationRecord,
    /// Tool output, present only on success.
    pub result: Option<serde_json::Value>,
    /// Failure cause, absent only on success.
    pub failure: Option<SandboxFailure>,
}

impl SandboxOutcome {
    /// Whether the tool returned a result.
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Tracks one call's progress through the state machine.
struct CallTrace {
    request_id: Uuid,
    tool: String,
    state: CallState,
}

impl CallTrace {
    fn transition(&mut self, next: CallState) {
        debug!(
            request_id = %self.request_id,
            tool = %self.tool,
            from = ?self.state,
            to = ?next,
            "tool call state"
        );
        self.state = next;
    }
}

/// Executes tool calls under authorization, timeout, retry and approval rules.
pub struct ToolSandbox {
    registry: Arc<ToolRegistry>,
    audit: Arc<dyn AuditSink>,
    approval: Option<Arc<dyn ApprovalGate>>,
    breakers: CircuitBreakers,
}

impl ToolSandbox {
    /// Create a sandbox over a registry. Without an approval gate every
    /// side-effecting call that is not pre-approved is refused.
    pub fn new(
        registry: Arc<ToolRegistry>,
        audit: Arc<dyn AuditSink>,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            registry,
            audit,
            approval: None,
            breakers: CircuitBreakers::new(breaker_config),
        }
    }

    /// Attach an approval gate for side-effecting calls.
    pub fn with_approval_gate(mut self, gate: Arc<dyn ApprovalGate>) -> Self {
        self.approval = Some(gate);
        self
    }

    /// The registry this sandbox executes from.
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Execute one call. Never fails: every outcome is described by the
    /// returned record. An unaudited call is reported as
    /// [`SandboxFailure::AuditUnavailable`] and its result withheld, even if the
    /// handler succeeded.
    pub async fn execute(
        &self,
        call: ToolCall,
        ctx: &mut RequestContext,
        limits: &SandboxLimits,
        cancel: &CancelSignal,
    ) -> SandboxOutcome {
        let started_at = Utc::now();
        let mut trace = CallTrace {
            request_id: ctx.request_id,
            tool: call.tool_name.clone(),
            state: CallState::Idle,
        };
        trace.transition(CallState::Authorizing);

        let (attempts, result) = self.run(&call, ctx, limits, cancel, &mut trace).await;

        let (outcome, summary, mut value, mut failure) = match result {
            Ok(value) => (
                InvocationOutcome::Success,
                summarize(&value.to_string()),
                Some(value),
                None,
            ),
            Err((failure, detail)) => {
                let outcome = match failure {
                    SandboxFailure::Cancelled => InvocationOutcome::Cancelled,
                    SandboxFailure::TimedOut => InvocationOutcome::TimedOut,
                    SandboxFailure::Error => InvocationOutcome::Error,
                    _ => InvocationOutcome::Blocked,
                };
                (outcome, summarize(&detail), None, Some(failure))
            }
        };

        let record = ToolInvocationRecord {
            id: Uuid::new_v4(),
            request_id: ctx.request_id,
            step_index: call.step_index,
            tool_name: call.tool_name,
            parameters: call.parameters,
            attempts,
            started_at,
            finished_at: Utc::now(),
            outcome,
            result_summary: summary,
        };

        info!(
            request_id = %record.request_id,
            tool = %record.tool_name,
            outcome = ?record.outcome,
            attempts = record.attempts,
            "tool invocation finished"
        );

        let detail = serde_json::to_value(&record).unwrap_or_else(|e| {
            serde_json::json!({ "tool_name": &record.tool_name, "encode_error": e.to_string() })
        });
        let event = AuditEvent::new(
            record.request_id,
            AuditEventKind::ToolInvocation,
            PipelineState::Executing,
            detail,
        );
        if let Err(e) = self.audit.append(event).await {
            error!(request_id = %record.request_id, error = %e, "failed to audit tool invocation");
            value = None;
            failure = Some(SandboxFailure::AuditUnavailable);
        }

        SandboxOutcome {
            record,
            result: value,
            failure,
        }
    }

    /// Drive the call to a final state. Returns attempts made and the result.
    async fn run(
        &self,
        call: &ToolCall,
        ctx: &mut RequestContext,
        limits: &SandboxLimits,
        cancel: &CancelSignal,
        trace: &mut CallTrace,
    ) -> (u32, CallResult) {
        if cancel.is_cancelled() {
            return (0, Err((SandboxFailure::Cancelled, "cancelled before start".to_string())));
        }
        if ctx.tool_calls >= limits.max_tool_calls {
            return blocked(
                trace,
                SandboxFailure::CallLimit,
                format!("tool call limit of {} reached", limits.max_tool_calls),
            );
        }
        ctx.tool_calls += 1;

        let Some(tool) = self.registry.get(&call.tool_name).await else {
            return blocked(
                trace,
                SandboxFailure::UnknownTool,
                format!("unknown tool: {}", call.tool_name),
            );
        };

        if tool.spec.side_effecting
            && !call.approved
            && !limits.pre_approved_tools.contains(&tool.spec.name)
        {
            if let Err((failure, detail)) = self.seek_approval(call, ctx, limits, cancel).await {
                if failure == SandboxFailure::Cancelled {
                    return (0, Err((failure, detail)));
                }
                return blocked(trace, failure, detail);
            }
        }

        let timeout = Duration::from_millis(tool.spec.timeout_ms);
        let max_attempts = limits.retries.min(MAX_TOOL_RETRIES) + 1;
        let mut last_failure = (SandboxFailure::Error, String::new());

        for attempt in 0..max_attempts {
            if attempt > 0 {
                trace.transition(CallState::Authorizing);
                let backoff = limits.retry_backoff.saturating_mul(1 << (attempt - 1));
                debug!(
                    request_id = %ctx.request_id,
                    tool = %call.tool_name,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "retrying tool call"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return (attempt, Err((SandboxFailure::Cancelled, "cancelled during backoff".to_string())));
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
            }

            if !ctx.is_authorized(&call.tool_name) {
                return with_attempts(
                    attempt,
                    blocked(
                        trace,
                        SandboxFailure::Unauthorized,
                        format!("tool '{}' is outside caller scopes", call.tool_name),
                    ),
                );
            }
            if let Err(violation) = validate_parameters(&tool.spec, &call.parameters) {
                return with_attempts(
                    attempt,
                    blocked(trace, SandboxFailure::InvalidParameters, violation.to_string()),
                );
            }
            if !self.breakers.allow_call(&call.tool_name) {
                return with_attempts(
                    attempt,
                    blocked(
                        trace,
                        SandboxFailure::CircuitOpen,
                        format!("circuit open for tool '{}'", call.tool_name),
                    ),
                );
            }

            trace.transition(CallState::Executing);
            let invocation = tokio::time::timeout(timeout, tool.handler.invoke(&call.parameters));
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(request_id = %ctx.request_id, tool = %call.tool_name, "tool call cancelled");
                    return (attempt + 1, Err((SandboxFailure::Cancelled, "cancelled during execution".to_string())));
                }
                result = invocation => result,
            };

            match result {
                Ok(Ok(value)) => {
                    self.breakers.record_success(&call.tool_name);
                    trace.transition(CallState::Completed);
                    return (attempt + 1, Ok(value));
                }
                Ok(Err(e)) => {
                    self.breakers.record_failure(&call.tool_name);
                    trace.transition(CallState::Errored);
                    warn!(request_id = %ctx.request_id, tool = %call.tool_name, attempt, error = %e, "tool call failed");
                    last_failure = (SandboxFailure::Error, e.to_string());
                }
                Err(_) => {
                    self.breakers.record_failure(&call.tool_name);
                    trace.transition(CallState::TimedOut);
                    warn!(
                        request_id = %ctx.request_id,
                        tool = %call.tool_name,
                        attempt,
                        timeout_ms = tool.spec.timeout_ms,
                        "tool call timed out"
                    );
                    last_failure = (
                        SandboxFailure::TimedOut,
                        format!("timed out after {}ms", tool.spec.timeout_ms),
                    );
                }
            }
        }

        (max_attempts, Err(last_failure))
    }

    async fn seek_approval(
        &self,
        call: &ToolCall,
        ctx: &RequestContext,
        limits: &SandboxLimits,
        cancel: &CancelSignal,
    ) -> Result<(), (SandboxFailure, String)> {
        let Some(gate) = &self.approval else {
            return Err((
                SandboxFailure::ApprovalDenied,
                "no approval gate configured".to_string(),
            ));
        };

        let params = serde_json::to_string(&call.parameters).unwrap_or_default();
        let request = ApprovalRequest {
            id: Uuid::new_v4(),
            request_id: ctx.request_id,
            identity: ctx.identity.clone(),
            action_description: format!("run {} with {params}", call.tool_name),
            tools: vec![call.tool_name.clone()],
            requested_at: Utc::now(),
        };
        let record = gate
            .request_approval(request, limits.approval_timeout, cancel)
            .await;

        let event = AuditEvent::new(
            ctx.request_id,
            AuditEventKind::ApprovalDecision,
            PipelineState::Executing,
            serde_json::json!({
                "tool_name": &call.tool_name,
                "step_index": call.step_index,
                "record": &record,
            }),
        );
        if let Err(e) = self.audit.append(event).await {
            error!(request_id = %ctx.request_id, error = %e, "failed to audit approval decision");
            return Err((
                SandboxFailure::AuditUnavailable,
                "approval decision not audited".to_string(),
            ));
        }

        if record.decision.is_approved() {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err((SandboxFailure::Cancelled, "cancelled awaiting approval".to_string()));
        }
        let failure = match record.decision {
            ApprovalDecision::TimedOut => SandboxFailure::ApprovalTimeout,
            _ => SandboxFailure::ApprovalDenied,
        };
        Err((failure, format!("approval {:?} by {}", record.decision, record.approver)))
    }
}

fn blocked(trace: &mut CallTrace, failure: SandboxFailure, detail: String) -> (u32, CallResult) {
    trace.transition(CallState::Blocked);
    warn!(request_id = %trace.request_id, tool = %trace.tool, ?failure, "tool call refused");
    (0, Err((failure, detail)))
}

fn with_attempts(attempts: u32, (_, result): (u32, CallResult)) -> (u32, CallResult) {
    (attempts, result)
}

fn summarize(text: &str) -> String {
    if text.chars().count() <= SUMMARY_MAX_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(SUMMARY_MAX_CHARS).collect();
    out.push('…');
    out
}
