/// Unified error type for the Warden gateway.
///
/// All modules use this error type for propagation across crate boundaries.
/// Internal module errors should be converted into the appropriate variant.
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    /// Error from the input validator (rule compilation, normalization).
    #[error("ingress error: {0}")]
    Ingress(String),

    /// Error from the output filter.
    #[error("egress error: {0}")]
    Egress(String),

    /// Error from an audit sink (append or query failures).
    #[error("audit error: {0}")]
    Audit(String),

    /// Error from the rate/budget ledger.
    #[error("ledger error: {0}")]
    Ledger(String),

    /// Error from plan parsing or plan validation.
    #[error("plan error: {0}")]
    Plan(String),

    /// Error from the tool registry or a tool backend.
    #[error("tool error: {0}")]
    Tool(String),

    /// Error from the approval gate or an approver.
    #[error("approval error: {0}")]
    Approval(String),

    /// Error from the model backend (HTTP failures, malformed responses).
    #[error("model backend error: {0}")]
    Model(String),

    /// A model or tool backend could not be reached.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Error from configuration loading or validation.
    #[error("config error: {0}")]
    Config(String),

    /// Timeout at a suspension point (model call, tool call, approval wait).
    #[error("timeout: {0}")]
    Timeout(String),

    /// The caller cancelled the request.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic internal error for unexpected conditions.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Budget rejection details, returned by the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetExceeded {
    /// Name of the window that would have been exceeded (e.g. "minute").
    pub window: String,
    /// Human-readable description of the limit that was hit.
    pub limit: String,
    /// Seconds until enough of the window expires for the request to fit.
    pub retry_after_secs: u64,
}

impl std::fmt::Display for BudgetExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "budget exceeded for window '{}': {} (retry after {}s)",
            self.window, self.limit, self.retry_after_secs
        )
    }
}

impl std::error::Error for BudgetExceeded {}

/// Caller-facing failure taxonomy.
///
/// Every terminal failure the gateway reports maps to exactly one of these.
/// The user-visible text is fixed per variant; the reason a rule fired or a
/// tool was denied is recorded in the audit trail only.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayFailure {
    /// An input or output finding crossed the block threshold.
    PolicyViolation,
    /// The ledger rejected the request.
    BudgetExceeded {
        /// Seconds until the caller may retry.
        retry_after_secs: u64,
    },
    /// The model's action plan failed validation.
    PlanRejected,
    /// A tool call failed after bounded retries.
    ToolFailure,
    /// A required approval did not arrive in time.
    ApprovalTimeout,
    /// A required approval was explicitly denied.
    ApprovalDenied,
    /// The model or a tool backend was unreachable.
    BackendUnavailable,
    /// The caller cancelled the request.
    Cancelled,
}

impl GatewayFailure {
    /// The fixed, policy-safe message shown to the caller.
    pub fn user_message(&self) -> &'static str {
        match self {
            GatewayFailure::PolicyViolation => REFUSAL_TEXT,
            GatewayFailure::BudgetExceeded { .. } => {
                "Request limit reached. Please retry later."
            }
            GatewayFailure::PlanRejected => "I cannot complete this request.",
            GatewayFailure::ToolFailure => "Part of this request could not be completed.",
            GatewayFailure::ApprovalTimeout => "This request requires manual review.",
            GatewayFailure::ApprovalDenied => "This action was not approved.",
            GatewayFailure::BackendUnavailable => {
                "The service is temporarily unavailable. Please try again."
            }
            GatewayFailure::Cancelled => "The request was cancelled.",
        }
    }

    /// Stable machine-readable name, used in audit records.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayFailure::PolicyViolation => "policy_violation",
            GatewayFailure::BudgetExceeded { .. } => "budget_exceeded",
            GatewayFailure::PlanRejected => "plan_rejected",
            GatewayFailure::ToolFailure => "tool_failure",
            GatewayFailure::ApprovalTimeout => "approval_timeout",
            GatewayFailure::ApprovalDenied => "approval_denied",
            GatewayFailure::BackendUnavailable => "backend_unavailable",
            GatewayFailure::Cancelled => "cancelled",
        }
    }
}

/// Fixed refusal string used for policy blocks and leaking responses.
pub const REFUSAL_TEXT: &str = "I can't help with that request.";

impl From<serde_json::Error> for WardenError {
    fn from(err: serde_json::Error) -> Self {
        WardenError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for WardenError {
    fn from(err: serde_yaml::Error) -> Self {
        WardenError::Serialization(err.to_string())
    }
}
