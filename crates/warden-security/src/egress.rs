//! Output filter implementation.
//!
//! Last line of defense. Scans realized model output before it reaches the
//! caller:
//! - Prompt-leak detection against the confidential system policy
//! - Exfiltration links (markdown images and links carrying payloads)
//! - PII redaction and harmful-instruction blocking
//!
//! A blocked response is replaced wholesale by the policy's refusal text.

use std::sync::Arc;

use tracing::{debug, warn};
use warden_types::actions::{Finding, FindingCategory, RuleAction, TextSpan, ValidationReport, Verdict};
use warden_types::config::{GatewayConfig, OutputPolicy, RuleScope};
use warden_types::errors::WardenError;
use warden_types::traits::{OutputFilter, Scorer};

use crate::leak_detector::LeakDetector;
use crate::rules::{neutralize, score, RuleSet};

/// Default implementation of the [`OutputFilter`] trait.
pub struct DefaultOutputFilter {
    rules: RuleSet,
    scorers: Vec<Arc<dyn Scorer>>,
}

impl Default for DefaultOutputFilter {
    fn default() -> Self {
        Self::new(RuleSet::builtin_output())
    }
}

impl DefaultOutputFilter {
    /// Create a filter over the given rule set.
    pub fn new(rules: RuleSet) -> Self {
        Self {
            rules,
            scorers: Vec::new(),
        }
    }

    /// Built-in output rules plus the output-scoped custom rules from config.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, WardenError> {
        let rules =
            RuleSet::builtin_output().with_config_rules(&config.extra_rules, RuleScope::Output)?;
        Ok(Self::new(rules))
    }

    /// Attach a pluggable scorer.
    pub fn with_scorer(mut self, scorer: Arc<dyn Scorer>) -> Self {
        self.scorers.push(scorer);
        self
    }

    fn refuse(findings: Vec<Finding>, risk_score: f64, policy: &OutputPolicy) -> ValidationReport {
        ValidationReport {
            transformed_text: policy.refusal_text.clone(),
            findings,
            risk_score,
            verdict: Verdict::Block,
        }
    }
}

impl OutputFilter for DefaultOutputFilter {
    fn filter(&self, output: &str, system_policy: &str, policy: &OutputPolicy) -> ValidationReport {
        let ratio = LeakDetector::new(policy.leak_ngram_size).overlap_ratio(output, system_policy);
        if ratio > policy.leak_overlap_ratio {
            warn!(
                overlap = ratio,
                limit = policy.leak_overlap_ratio,
                "model output reproduces system policy"
            );
            let finding = Finding {
                category: FindingCategory::PromptLeak,
                rule: "system_policy_overlap".to_string(),
                severity: 1.0,
                critical: true,
                action: RuleAction::Flag,
                span: TextSpan {
                    start: 0,
                    end: output.len(),
                },
                matched: format!("overlap ratio {ratio:.2}"),
            };
            return Self::refuse(vec![finding], 1.0, policy);
        }

        let thresholds = &policy.thresholds;
        let (transformed, findings) = neutralize(output, |text| {
            let mut found = self.rules.scan(text, thresholds);
            for scorer in &self.scorers {
                for mut finding in scorer.score(text) {
                    finding.critical |= finding.severity >= thresholds.critical_severity;
                    finding.rule = format!("{}:{}", scorer.name(), finding.rule);
                    found.push(finding);
                }
            }
            found
        });
        let (risk_score, verdict) = score(&findings, thresholds);

        if verdict == Verdict::Block {
            let categories: Vec<&str> = findings.iter().map(|f| f.category.as_str()).collect();
            warn!(?categories, risk_score, "model output blocked");
            return Self::refuse(findings, risk_score, policy);
        }

        debug!(
            finding_count = findings.len(),
            risk_score,
            verdict = ?verdict,
            "model output filtered"
        );
        ValidationReport {
            transformed_text: transformed,
            findings,
            risk_score,
            verdict,
        }
    }
}
