/// Configuration types for the Warden gateway.
///
/// Loaded from a config directory by [`crate::config_loader::ConfigLoader`]:
/// `gateway.yaml` for global settings, `system-policy.md` for the confidential
/// policy text and `caller-classes/*.yaml` for per-class policy.
use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::actions::{FindingCategory, RuleAction};

/// Global gateway settings, parsed from `config/gateway.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Caller class applied when a request names none.
    pub default_caller_class: String,
    /// Hard timeout on each model backend call (seconds).
    pub model_timeout_secs: u64,
    /// Generation limit passed to the model backend.
    pub model_max_tokens: u32,
    /// Store a SHA-256 digest of raw input in the audit trail instead of the text.
    pub hash_raw_input: bool,
    /// Overrides the built-in refusal string.
    pub refusal_text: Option<String>,
    /// Run a second model call to synthesize tool results into a final answer.
    pub final_synthesis: bool,
    /// Cost charged per 1000 tokens, for cost-limited budget windows.
    pub cost_per_1k_tokens: f64,
    /// Custom rules merged into the built-in rule library.
    pub extra_rules: Vec<RuleConfig>,
    /// Per-tool circuit breaker settings.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Sessions idle this long are forgotten (seconds).
    pub session_idle_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_caller_class: "default".to_string(),
            model_timeout_secs: 30,
            model_max_tokens: 1024,
            hash_raw_input: true,
            refusal_text: None,
            final_synthesis: false,
            cost_per_1k_tokens: 0.0,
            extra_rules: Vec::new(),
            circuit_breaker: CircuitBreakerConfig::default(),
            session_idle_secs: 3600,
        }
    }
}

/// Which text a custom rule scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    /// Caller input only.
    Input,
    /// Model output only.
    Output,
    /// Both directions.
    #[default]
    Both,
}

/// A custom pattern rule from configuration.
///
/// ```yaml
/// extra_rules:
///   - name: internal-hostname
///     pattern: "(?i)\\b[a-z0-9-]+\\.corp\\.internal\\b"
///     category: data-exfiltration-pattern
///     severity: 0.6
///     action: redact
///     scope: output
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Rule name recorded on findings.
    pub name: String,
    /// Regular expression.
    pub pattern: String,
    /// Finding category.
    pub category: FindingCategory,
    /// Severity in [0, 1].
    pub severity: f64,
    /// Whether a match alone forces a block.
    #[serde(default)]
    pub critical: bool,
    /// What to do with matched text.
    #[serde(default)]
    pub action: RuleAction,
    /// Which direction the rule applies to.
    #[serde(default)]
    pub scope: RuleScope,
}

/// Two-tier scoring thresholds shared by input and output checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringThresholds {
    /// Aggregate risk at or above which the text is blocked.
    pub block_threshold: f64,
    /// Severity at or above which a single finding is critical.
    pub critical_severity: f64,
    /// Severity at or above which a finding counts as medium.
    pub medium_severity: f64,
    /// Number of medium findings that escalates to a block.
    pub medium_escalation_count: usize,
    /// Redact PII matches. When false they are recorded only.
    pub redact_pii: bool,
}

impl Default for ScoringThresholds {
    fn default() -> Self {
        Self {
            block_threshold: 0.8,
            critical_severity: 0.9,
            medium_severity: 0.5,
            medium_escalation_count: 2,
            redact_pii: true,
        }
    }
}

/// Input validation policy for one caller class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputPolicy {
    /// Maximum input length in characters.
    pub max_input_chars: usize,
    /// Scoring thresholds.
    pub thresholds: ScoringThresholds,
}

impl Default for InputPolicy {
    fn default() -> Self {
        Self {
            max_input_chars: 4000,
            thresholds: ScoringThresholds::default(),
        }
    }
}

/// Output filtering policy for one caller class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputPolicy {
    /// Scoring thresholds.
    pub thresholds: ScoringThresholds,
    /// Fraction of policy n-grams found in a response that counts as a leak.
    pub leak_overlap_ratio: f64,
    /// Word n-gram size used for leak detection.
    pub leak_ngram_size: usize,
    /// Text that replaces a blocked response.
    pub refusal_text: String,
}

impl Default for OutputPolicy {
    fn default() -> Self {
        Self {
            thresholds: ScoringThresholds::default(),
            leak_overlap_ratio: 0.5,
            leak_ngram_size: 3,
            refusal_text: crate::errors::REFUSAL_TEXT.to_string(),
        }
    }
}

/// One sliding budget window.
///
/// ```yaml
/// budget_windows:
///   - name: minute
///     window_secs: 60
///     max_requests: 20
///     max_tokens: 40000
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetWindowConfig {
    /// Window name, reported in rejections.
    pub name: String,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Maximum admitted requests within the window.
    #[serde(default)]
    pub max_requests: Option<u64>,
    /// Maximum tokens within the window.
    #[serde(default)]
    pub max_tokens: Option<u64>,
    /// Maximum cost within the window.
    #[serde(default)]
    pub max_cost: Option<f64>,
}

/// Approval requirements for one caller class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalPolicy {
    /// How long to wait for a human decision (seconds).
    pub timeout_secs: u64,
    /// Side-effecting tools that need no per-call approval.
    pub pre_approved_tools: BTreeSet<String>,
    /// Skip denied high-risk steps instead of rejecting the whole plan.
    pub partial_plan_mode: bool,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            pre_approved_tools: BTreeSet::new(),
            partial_plan_mode: false,
        }
    }
}

/// Policy for one caller class, parsed from `config/caller-classes/<name>.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallerClassPolicy {
    /// Tools callers in this class may invoke.
    pub authorized_tools: BTreeSet<String>,
    /// Input validation policy.
    pub input: InputPolicy,
    /// Output filtering policy.
    pub output: OutputPolicy,
    /// Sliding budget windows, all enforced per identity.
    pub budget_windows: Vec<BudgetWindowConfig>,
    /// Maximum steps in one plan.
    pub max_plan_steps: usize,
    /// Maximum tool calls per request.
    pub max_tool_calls: u32,
    /// Retries after a failed tool call. At most 2.
    pub tool_retries: u32,
    /// Base backoff between tool retries (milliseconds), doubled per retry.
    pub retry_backoff_ms: u64,
    /// Approval settings.
    pub approval: ApprovalPolicy,
    /// Session risk at or above which further turns are refused.
    pub max_session_risk: f64,
    /// Maximum turns per session.
    pub max_session_turns: u32,
}

impl Default for CallerClassPolicy {
    fn default() -> Self {
        Self {
            authorized_tools: BTreeSet::new(),
            input: InputPolicy::default(),
            output: OutputPolicy::default(),
            budget_windows: vec![BudgetWindowConfig {
                name: "minute".to_string(),
                window_secs: 60,
                max_requests: Some(60),
                max_tokens: None,
                max_cost: None,
            }],
            max_plan_steps: 8,
            max_tool_calls: 16,
            tool_retries: 2,
            retry_backoff_ms: 200,
            approval: ApprovalPolicy::default(),
            max_session_risk: 0.95,
            max_session_turns: 50,
        }
    }
}

/// Per-tool circuit breaker configuration.
///
/// Controls the state machine transitions: Closed → Open → HalfOpen.
///
/// ```yaml
/// circuit_breaker:
///   error_threshold: 5
///   error_window_secs: 60
///   recovery_timeout_secs: 30
///   recovery_probes: 2
///   max_recovery_backoff_secs: 600
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive errors within `error_window_secs` before the circuit trips open.
    pub error_threshold: u32,
    /// Window for counting consecutive errors (seconds).
    pub error_window_secs: u64,
    /// Base wait before recovery probes are allowed (seconds).
    pub recovery_timeout_secs: u64,
    /// Consecutive successful probes needed to close the circuit.
    pub recovery_probes: u32,
    /// Cap on the exponential recovery backoff (seconds).
    pub max_recovery_backoff_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold: 5,
            error_window_secs: 60,
            recovery_timeout_secs: 30,
            recovery_probes: 2,
            max_recovery_backoff_secs: 600,
        }
    }
}

/// Aggregate configuration loaded from the config directory.
#[derive(Debug, Clone)]
pub struct WardenConfig {
    /// Global settings.
    pub gateway: GatewayConfig,
    /// Confidential system policy text given to the model.
    pub system_policy: String,
    /// Caller-class policies keyed by class name.
    pub caller_classes: HashMap<String, CallerClassPolicy>,
}

impl WardenConfig {
    /// Configuration with default gateway settings and no caller classes.
    pub fn new(system_policy: impl Into<String>) -> Self {
        Self {
            gateway: GatewayConfig::default(),
            system_policy: system_policy.into(),
            caller_classes: HashMap::new(),
        }
    }

    /// Add or replace a caller class.
    pub fn with_caller_class(mut self, name: impl Into<String>, policy: CallerClassPolicy) -> Self {
        self.caller_classes.insert(name.into(), policy);
        self
    }

    /// Resolve a requested class, falling back to the default class.
    ///
    /// Returns `None` for unknown classes; callers must refuse such requests.
    pub fn caller_class<'a>(
        &'a self,
        requested: Option<&'a str>,
    ) -> Option<(&'a str, &'a CallerClassPolicy)> {
        let name = requested.unwrap_or(&self.gateway.default_caller_class);
        self.caller_classes
            .get_key_value(name)
            .map(|(k, v)| (k.as_str(), v))
    }

    /// The refusal text in effect.
    pub fn refusal_text(&self) -> &str {
        self.gateway
            .refusal_text
            .as_deref()
            .unwrap_or(crate::errors::REFUSAL_TEXT)
    }
}
