/// Shared data types used across all Warden subsystems.
///
/// Every crate in the workspace imports from here: findings produced by the
/// validators, action plans produced by the model, invocation records produced
/// by the sandbox, and the audit events that record all of it.
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of one inbound request. Doubles as the audit trail reference.
pub type RequestId = Uuid;

/// Tool parameters, keyed by parameter name. Ordered for stable audit output.
pub type Parameters = BTreeMap<String, serde_json::Value>;

// ============================================================
// Request Context
// ============================================================

/// Per-request state owned by the orchestrator for the lifetime of one call.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Unique request identifier.
    pub request_id: RequestId,
    /// Caller identity (ledger key).
    pub identity: String,
    /// Caller class whose policy applies to this request.
    pub caller_class: String,
    /// Tool names this caller may invoke.
    pub scopes: BTreeSet<String>,
    /// Conversation session identifier.
    pub session_id: String,
    /// Turn number within the session (1-based).
    pub turn: u32,
    /// Tokens consumed by model calls so far.
    pub tokens_used: u64,
    /// Estimated cost consumed so far.
    pub cost_used: f64,
    /// Tool calls started so far (loop guard).
    pub tool_calls: u32,
    risk: f64,
}

impl RequestContext {
    /// Create a context for a new turn, seeded with the session's carried risk.
    pub fn new(
        identity: impl Into<String>,
        caller_class: impl Into<String>,
        scopes: BTreeSet<String>,
        session_id: impl Into<String>,
        turn: u32,
        carried_risk: f64,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            identity: identity.into(),
            caller_class: caller_class.into(),
            scopes,
            session_id: session_id.into(),
            turn,
            tokens_used: 0,
            cost_used: 0.0,
            tool_calls: 0,
            risk: carried_risk.clamp(0.0, 1.0),
        }
    }

    /// Current value of the risk accumulator.
    pub fn risk(&self) -> f64 {
        self.risk
    }

    /// Fold a stage risk score into the accumulator.
    ///
    /// Combination is noisy-or, so the accumulator never decreases and never
    /// exceeds 1.0.
    pub fn accumulate_risk(&mut self, score: f64) {
        let score = score.clamp(0.0, 1.0);
        self.risk = 1.0 - (1.0 - self.risk) * (1.0 - score);
    }

    /// Whether the caller may invoke `tool_name`.
    pub fn is_authorized(&self, tool_name: &str) -> bool {
        self.scopes.contains(tool_name)
    }
}

// ============================================================
// Findings
// ============================================================

/// Fixed taxonomy of validation finding categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FindingCategory {
    /// Attempts to override or replace prior instructions.
    InstructionOverride,
    /// Attempts to make the model adopt another role or persona.
    RoleChange,
    /// Obfuscated payloads: encoded blocks, invisible control characters.
    EncodingBypass,
    /// Patterns that move data out of the system (exfil links, "send to").
    DataExfiltrationPattern,
    /// Personally identifiable information.
    PiiPattern,
    /// Disclosure of, or probing for, the confidential system policy.
    PromptLeak,
    /// Requests or content outside the permitted scope (length, harmful topics).
    OutOfScope,
}

impl FindingCategory {
    /// Kebab-case tag, as used in configuration and redaction markers.
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingCategory::InstructionOverride => "instruction-override",
            FindingCategory::RoleChange => "role-change",
            FindingCategory::EncodingBypass => "encoding-bypass",
            FindingCategory::DataExfiltrationPattern => "data-exfiltration-pattern",
            FindingCategory::PiiPattern => "pii-pattern",
            FindingCategory::PromptLeak => "prompt-leak",
            FindingCategory::OutOfScope => "out-of-scope",
        }
    }
}

/// What a rule does to the text it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Record the finding; leave text untouched.
    #[default]
    Flag,
    /// Replace the match with a `[REDACTED:<category>]` marker.
    Redact,
    /// Replace each matched character with a visible `[U+XXXX]` escape.
    Escape,
}

/// Byte range within the scanned text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSpan {
    /// Start offset (inclusive).
    pub start: usize,
    /// End offset (exclusive).
    pub end: usize,
}

/// A tagged, scored detection produced by the input validator or output filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Taxonomy tag.
    pub category: FindingCategory,
    /// Name of the rule that produced this finding.
    pub rule: String,
    /// Severity in [0, 1].
    pub severity: f64,
    /// Whether this finding alone forces a block.
    pub critical: bool,
    /// What was done to the matched text.
    pub action: RuleAction,
    /// Location of the match in the scanned text.
    pub span: TextSpan,
    /// The matched text, truncated for audit use.
    pub matched: String,
}

/// Decision derived from a finding set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Forward the text as-is.
    Allow,
    /// Forward the transformed text; something was redacted.
    Redact,
    /// Do not forward anything.
    Block,
}

/// Result of running a validator or filter over one piece of text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Text safe to forward. Empty for input blocks; the refusal string for
    /// output blocks.
    pub transformed_text: String,
    /// All findings, ordered by span start.
    pub findings: Vec<Finding>,
    /// Aggregate risk score in [0, 1].
    pub risk_score: f64,
    /// Allow / redact / block decision.
    pub verdict: Verdict,
}

impl ValidationReport {
    /// Distinct categories present in the findings, for audit and logging.
    pub fn categories(&self) -> Vec<&'static str> {
        let set: BTreeSet<FindingCategory> = self.findings.iter().map(|f| f.category).collect();
        set.into_iter().map(|c| c.as_str()).collect()
    }
}

// ============================================================
// Action Plans
// ============================================================

/// A structured, finite list of proposed tool invocations from the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionPlan {
    /// Short summary of what the plan is meant to achieve.
    pub intent: String,
    /// Ordered steps. May be empty when no tools are needed.
    #[serde(default)]
    pub steps: Vec<PlanStep>,
    /// Direct answer text when the model needs no tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

/// One proposed tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Registered tool name.
    pub tool_name: String,
    /// Parameters, validated against the tool's schema before execution.
    #[serde(default)]
    pub parameters: Parameters,
    /// The model's stated reason for this step.
    #[serde(default)]
    pub justification: String,
}

// ============================================================
// Tool Types
// ============================================================

/// Per-tool risk classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    /// Read-only, low impact.
    Low,
    /// Limited side effects.
    Medium,
    /// Destructive or irreversible; approval is mandatory.
    High,
}

/// JSON type of a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    /// UTF-8 string.
    String,
    /// Whole number.
    Integer,
    /// Any JSON number.
    Number,
    /// true / false.
    Boolean,
}

/// Declared schema for a single tool parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSchema {
    /// Expected JSON type.
    #[serde(rename = "type")]
    pub kind: ParamType,
    /// Whether the parameter must be present.
    #[serde(default)]
    pub required: bool,
    /// Maximum string length in characters.
    #[serde(default)]
    pub max_length: Option<usize>,
    /// Closed set of permitted values.
    #[serde(default)]
    pub allowed_values: Option<Vec<serde_json::Value>>,
    /// Inclusive numeric lower bound.
    #[serde(default)]
    pub min: Option<f64>,
    /// Inclusive numeric upper bound.
    #[serde(default)]
    pub max: Option<f64>,
}

impl ParamSchema {
    /// A required parameter of the given type with no further constraints.
    pub fn required(kind: ParamType) -> Self {
        Self {
            kind,
            required: true,
            max_length: None,
            allowed_values: None,
            min: None,
            max: None,
        }
    }

    /// An optional parameter of the given type with no further constraints.
    pub fn optional(kind: ParamType) -> Self {
        Self {
            required: false,
            ..Self::required(kind)
        }
    }
}

/// Registry entry describing a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Unique tool name (e.g. "lookup_order", "delete_record").
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Parameter schemas keyed by parameter name.
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamSchema>,
    /// Risk tier controlling plan-level approval.
    pub risk_tier: RiskTier,
    /// Whether the tool writes, deletes, sends or pays.
    #[serde(default)]
    pub side_effecting: bool,
    /// Per-call timeout in milliseconds.
    pub timeout_ms: u64,
}

/// Final outcome of one tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationOutcome {
    /// The tool returned a result.
    Success,
    /// The tool or its backend returned an error.
    Error,
    /// The call exceeded its timeout on every permitted attempt.
    TimedOut,
    /// The sandbox refused to run the call.
    Blocked,
    /// The caller cancelled the request mid-call.
    Cancelled,
}

/// Record of one executed (or refused) tool call. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocationRecord {
    /// Unique record identifier.
    pub id: Uuid,
    /// Request this call belongs to.
    pub request_id: RequestId,
    /// Index of the plan step, if the call came from a plan.
    pub step_index: Option<usize>,
    /// Tool name.
    pub tool_name: String,
    /// Parameters as validated.
    pub parameters: Parameters,
    /// Number of execution attempts made.
    pub attempts: u32,
    /// When the sandbox started handling the call.
    pub started_at: DateTime<Utc>,
    /// When the sandbox finished handling the call.
    pub finished_at: DateTime<Utc>,
    /// Final outcome.
    pub outcome: InvocationOutcome,
    /// Truncated result or failure summary.
    pub result_summary: String,
}

// ============================================================
// Model Types
// ============================================================

/// Roles in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    /// The caller.
    User,
    /// The model.
    Assistant,
}

/// A message in a conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author role.
    pub role: ChatRole,
    /// Message text.
    pub content: String,
}

/// Request to the model backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    /// Request this call belongs to.
    pub request_id: RequestId,
    /// Confidential system policy text.
    pub system_policy: String,
    /// Prior conversation turns.
    pub history: Vec<ChatMessage>,
    /// The current (validated, transformed) user turn.
    pub user_turn: String,
    /// JSON schema the response must follow, when structured output is wanted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<serde_json::Value>,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
}

/// Token usage statistics from a model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens.
    pub input_tokens: u32,
    /// Generated tokens.
    pub output_tokens: u32,
}

impl TokenUsage {
    /// Prompt plus generated tokens.
    pub fn total(&self) -> u64 {
        self.input_tokens as u64 + self.output_tokens as u64
    }
}

/// Response from the model backend. Always untrusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Generated text.
    pub text: String,
    /// Token usage.
    #[serde(default)]
    pub usage: TokenUsage,
}

// ============================================================
// Approval Types
// ============================================================

/// A request for a human decision on a high-risk action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Unique approval identifier.
    pub id: Uuid,
    /// Request this approval belongs to.
    pub request_id: RequestId,
    /// Caller identity, shown to the approver.
    pub identity: String,
    /// Description of the action awaiting a decision.
    pub action_description: String,
    /// Tools involved.
    pub tools: Vec<String>,
    /// When the approval was requested.
    pub requested_at: DateTime<Utc>,
}

/// Outcome of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// An approver allowed the action.
    Approved,
    /// An approver refused, or the approver failed.
    Denied,
    /// No decision before the deadline. Treated as a denial.
    TimedOut,
}

impl ApprovalDecision {
    /// Only an explicit approval lets an action proceed.
    pub fn is_approved(&self) -> bool {
        matches!(self, ApprovalDecision::Approved)
    }
}

/// Recorded approval decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    /// Approval identifier.
    pub approval_id: Uuid,
    /// The decision.
    pub decision: ApprovalDecision,
    /// Approver identity, or `system:timeout` / `system:error`.
    pub approver: String,
    /// When the decision was made.
    pub decided_at: DateTime<Utc>,
}

// ============================================================
// Pipeline State
// ============================================================

/// Orchestrator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Request accepted into the pipeline.
    Admitted,
    /// Input passed validation.
    InputValidated,
    /// The model produced a plan.
    Planned,
    /// The plan passed validation.
    PlanValidated,
    /// Tool calls in progress.
    Executing,
    /// Output passed filtering.
    OutputValidated,
    /// Terminal: response delivered.
    Completed,
    /// Terminal: policy refused the request.
    Blocked,
    /// Terminal: an upstream dependency failed.
    Failed,
}

impl PipelineState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Completed | PipelineState::Blocked | PipelineState::Failed
        )
    }

    /// Whether the machine may move from `self` to `next`.
    ///
    /// Forward moves go exactly one stage at a time. `Blocked` and `Failed` are
    /// reachable from every non-terminal state.
    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Blocked | Failed) {
            return true;
        }
        matches!(
            (self, next),
            (Admitted, InputValidated)
                | (InputValidated, Planned)
                | (Planned, PlanValidated)
                | (PlanValidated, Executing)
                | (Executing, OutputValidated)
                | (OutputValidated, Completed)
        )
    }
}

// ============================================================
// Caller Interface
// ============================================================

/// An inbound call from an untrusted caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRequest {
    /// Caller identity.
    pub identity: String,
    /// Caller class; the configured default applies when absent.
    #[serde(default)]
    pub caller_class: Option<String>,
    /// Optional narrowing of the class's tool scopes.
    #[serde(default)]
    pub scopes: Option<BTreeSet<String>>,
    /// Conversation session identifier.
    pub session_id: String,
    /// The user turn.
    pub text: String,
    /// Prior turns of the conversation.
    #[serde(default)]
    pub history: Vec<ChatMessage>,
}

/// Machine-readable response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// Completed with no redaction.
    Allowed,
    /// Completed; input or output was redacted.
    Redacted,
    /// Refused by policy.
    Blocked,
    /// Waiting on a human decision that did not arrive in time.
    PendingApproval,
    /// An upstream failure prevented completion.
    Error,
}

/// Response returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayResponse {
    /// Request identifier.
    pub request_id: RequestId,
    /// Outcome status.
    pub status: ResponseStatus,
    /// Final text, or a fixed failure message.
    pub text: String,
    /// Reference for audit lookup.
    pub audit_ref: String,
    /// Retry hint for budget rejections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    /// Terminal pipeline state.
    pub final_state: PipelineState,
}

// ============================================================
// Audit Types
// ============================================================

/// An event on the append-only audit stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event identifier.
    pub id: Uuid,
    /// Request this event belongs to.
    pub request_id: RequestId,
    /// Position within the request's events; assigned by the sink.
    #[serde(default)]
    pub sequence: u64,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// Category of the event.
    pub kind: AuditEventKind,
    /// Pipeline state when the event was produced.
    pub state: PipelineState,
    /// Structured detail.
    pub detail: serde_json::Value,
}

impl AuditEvent {
    /// Build an event; the sink assigns the sequence number on append.
    pub fn new(
        request_id: RequestId,
        kind: AuditEventKind,
        state: PipelineState,
        detail: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_id,
            sequence: 0,
            timestamp: Utc::now(),
            kind,
            state,
            detail,
        }
    }
}

/// Categories of audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    /// Ledger admission decision.
    Admission,
    /// Input validator decision.
    InputValidation,
    /// Model backend call.
    ModelCall,
    /// Plan validator decision.
    PlanValidation,
    /// Approval gate decision.
    ApprovalDecision,
    /// Tool sandbox invocation record.
    ToolInvocation,
    /// Output filter decision.
    OutputValidation,
    /// Pipeline state change.
    StateTransition,
    /// Terminal summary; exactly one per request.
    Terminal,
}

/// Filter criteria for querying audit events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditFilter {
    /// Restrict to one request.
    pub request_id: Option<RequestId>,
    /// Restrict to one event kind.
    pub kind: Option<AuditEventKind>,
    /// Maximum number of results.
    pub limit: Option<usize>,
}

impl AuditFilter {
    /// All events for one request.
    pub fn for_request(request_id: RequestId) -> Self {
        Self {
            request_id: Some(request_id),
            ..Default::default()
        }
    }

    /// Whether `event` passes this filter (ignores `limit`).
    pub fn matches(&self, event: &AuditEvent) -> bool {
        self.request_id.map_or(true, |id| id == event.request_id)
            && self.kind.map_or(true, |k| k == event.kind)
    }
}
