//! Action plan parsing and validation.
//!
//! The model proposes a plan as structured data; nothing here calls a model.
//! Validation runs four checks in order, each over every step:
//!
//! 1. every tool is registered and within the caller's scopes
//! 2. every step's parameters satisfy the tool's declared schema
//! 3. the step count does not exceed the caller class maximum
//! 4. high-risk steps are flagged for the approval gate
//!
//! Any failure in checks 1-3 rejects the whole plan.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};
use warden_types::actions::{ActionPlan, RiskTier, ToolSpec};
use warden_types::errors::WardenError;
use warden_tools::schema::{validate_parameters, SchemaViolation};

/// Why a plan was rejected. Audit-only; callers see a fixed message.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanRejection {
    /// A step names a tool that is not registered.
    #[error("step {step}: unknown tool '{tool}'")]
    UnknownTool {
        /// Step index.
        step: usize,
        /// Tool name.
        tool: String,
    },

    /// A step names a tool outside the caller's scopes.
    #[error("step {step}: tool '{tool}' is not authorized")]
    OutOfScope {
        /// Step index.
        step: usize,
        /// Tool name.
        tool: String,
    },

    /// A step's parameters fail the tool's schema.
    #[error("step {step}: {violation}")]
    InvalidParameters {
        /// Step index.
        step: usize,
        /// Schema violation.
        violation: SchemaViolation,
    },

    /// More steps than the caller class allows.
    #[error("plan has {count} steps, max is {max}")]
    TooManySteps {
        /// Steps in the plan.
        count: usize,
        /// Configured maximum.
        max: usize,
    },
}

/// Plan validation result.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanDecision {
    /// Structurally valid. Steps at these indices need approval first.
    Accept {
        /// Indices of high-risk steps.
        approval_required: Vec<usize>,
    },
    /// Rejected as a whole.
    Reject(PlanRejection),
}

/// JSON schema the model is asked to follow when planning.
pub fn plan_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "required": ["intent"],
        "properties": {
            "intent": { "type": "string" },
            "response": { "type": "string" },
            "steps": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["tool_name"],
                    "properties": {
                        "tool_name": { "type": "string" },
                        "parameters": { "type": "object" },
                        "justification": { "type": "string" }
                    }
                }
            }
        }
    })
}

/// Parse model output into a plan.
///
/// Accepts a bare JSON object or one wrapped in a Markdown code fence. Output
/// that is not JSON at all is a direct answer with no steps; output that
/// looks like JSON but does not parse is an error.
pub fn parse_plan(text: &str) -> Result<ActionPlan, WardenError> {
    let trimmed = text.trim();
    let body = strip_fence(trimmed);

    if !body.starts_with('{') {
        return Ok(ActionPlan {
            intent: "respond".to_string(),
            steps: Vec::new(),
            response: Some(trimmed.to_string()),
        });
    }

    serde_json::from_str(body).map_err(|e| WardenError::Plan(format!("malformed plan: {e}")))
}

fn strip_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_end()
        .strip_suffix("```")
        .unwrap_or(rest)
        .trim()
}

/// Validates plans against a tool catalog.
#[derive(Debug, Clone)]
pub struct PlanValidator {
    catalog: BTreeMap<String, ToolSpec>,
}

impl PlanValidator {
    /// Validator over the given tool declarations.
    pub fn new(catalog: BTreeMap<String, ToolSpec>) -> Self {
        Self { catalog }
    }

    /// Validate `plan` for a caller holding `scopes`.
    pub fn validate(
        &self,
        plan: &ActionPlan,
        scopes: &BTreeSet<String>,
        max_steps: usize,
    ) -> PlanDecision {
        for (step, s) in plan.steps.iter().enumerate() {
            if !self.catalog.contains_key(&s.tool_name) {
                return reject(PlanRejection::UnknownTool {
                    step,
                    tool: s.tool_name.clone(),
                });
            }
            if !scopes.contains(&s.tool_name) {
                return reject(PlanRejection::OutOfScope {
                    step,
                    tool: s.tool_name.clone(),
                });
            }
        }

        for (step, s) in plan.steps.iter().enumerate() {
            if let Some(spec) = self.catalog.get(&s.tool_name) {
                if let Err(violation) = validate_parameters(spec, &s.parameters) {
                    return reject(PlanRejection::InvalidParameters { step, violation });
                }
            }
        }

        if plan.steps.len() > max_steps {
            return reject(PlanRejection::TooManySteps {
                count: plan.steps.len(),
                max: max_steps,
            });
        }

        let approval_required: Vec<usize> = plan
            .steps
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                self.catalog
                    .get(&s.tool_name)
                    .is_some_and(|spec| spec.risk_tier == RiskTier::High)
            })
            .map(|(i, _)| i)
            .collect();

        debug!(
            steps = plan.steps.len(),
            flagged = approval_required.len(),
            "plan accepted"
        );
        PlanDecision::Accept { approval_required }
    }
}

fn reject(reason: PlanRejection) -> PlanDecision {
    warn!(reason = %reason, "plan rejected");
    PlanDecision::Reject(reason)
}
