//! Input validator implementation.
//!
//! Validates untrusted caller input before it reaches the model:
//! - Unicode NFKC normalization so lookalike characters cannot dodge patterns
//! - Length budget enforcement (over-length input is a critical finding)
//! - Pattern detection across the fixed finding taxonomy
//! - Redaction of PII and escaping of invisible control characters
//! - Two-tier scoring into allow / redact / block
//!
//! Only the transformed text is forwarded. The raw text is for the audit trail
//! alone, optionally as a SHA-256 digest ([`digest_raw`]).

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use unicode_normalization::UnicodeNormalization;
use warden_types::actions::{Finding, FindingCategory, RuleAction, TextSpan, ValidationReport, Verdict};
use warden_types::config::{GatewayConfig, InputPolicy, RuleScope, ScoringThresholds};
use warden_types::errors::WardenError;
use warden_types::traits::{InputValidator, Scorer};

use crate::rules::{neutralize, score, RuleSet};

/// Default implementation of the [`InputValidator`] trait.
///
/// Compiles all rules at construction time. Extra scoring capabilities can be
/// attached with [`DefaultInputValidator::with_scorer`].
pub struct DefaultInputValidator {
    rules: RuleSet,
    scorers: Vec<Arc<dyn Scorer>>,
}

impl Default for DefaultInputValidator {
    fn default() -> Self {
        Self::new(RuleSet::builtin_input())
    }
}

impl DefaultInputValidator {
    /// Create a validator over the given rule set.
    pub fn new(rules: RuleSet) -> Self {
        Self {
            rules,
            scorers: Vec::new(),
        }
    }

    /// Built-in input rules plus the input-scoped custom rules from config.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, WardenError> {
        let rules = RuleSet::builtin_input().with_config_rules(&config.extra_rules, RuleScope::Input)?;
        Ok(Self::new(rules))
    }

    /// Attach a pluggable scorer.
    pub fn with_scorer(mut self, scorer: Arc<dyn Scorer>) -> Self {
        self.scorers.push(scorer);
        self
    }

    /// Run the rule set and every scorer over `text`.
    fn scan(&self, text: &str, thresholds: &ScoringThresholds) -> Vec<Finding> {
        let mut findings = self.rules.scan(text, thresholds);
        for scorer in &self.scorers {
            for mut finding in scorer.score(text) {
                finding.critical |= finding.severity >= thresholds.critical_severity;
                finding.rule = format!("{}:{}", scorer.name(), finding.rule);
                findings.push(finding);
            }
        }
        findings.sort_by_key(|f| f.span.start);
        findings
    }
}

impl InputValidator for DefaultInputValidator {
    /// Validate a raw user turn.
    ///
    /// Pipeline: normalize → length check → scan/redact → score.
    fn validate(&self, raw_text: &str, policy: &InputPolicy) -> ValidationReport {
        let normalized = normalize(raw_text);

        let length = normalized.chars().count();
        if length > policy.max_input_chars {
            warn!(
                length,
                max = policy.max_input_chars,
                "input exceeds maximum length"
            );
            return ValidationReport {
                transformed_text: String::new(),
                findings: vec![Finding {
                    category: FindingCategory::OutOfScope,
                    rule: "max_input_length".to_string(),
                    severity: 1.0,
                    critical: true,
                    action: RuleAction::Flag,
                    span: TextSpan {
                        start: 0,
                        end: normalized.len(),
                    },
                    matched: format!("{length} chars (max {})", policy.max_input_chars),
                }],
                risk_score: 1.0,
                verdict: Verdict::Block,
            };
        }

        let (transformed, findings) =
            neutralize(&normalized, |text| self.scan(text, &policy.thresholds));
        let (risk_score, verdict) = score(&findings, &policy.thresholds);

        let report = ValidationReport {
            transformed_text: if verdict == Verdict::Block {
                String::new()
            } else {
                transformed
            },
            findings,
            risk_score,
            verdict,
        };

        if report.findings.is_empty() {
            debug!("input clean");
        } else {
            warn!(
                finding_count = report.findings.len(),
                categories = ?report.categories(),
                risk_score = report.risk_score,
                verdict = ?report.verdict,
                "input findings"
            );
        }
        report
    }
}

/// NFKC-normalize text before scanning.
pub fn normalize(text: &str) -> String {
    text.nfkc().collect()
}

/// Hex SHA-256 digest of raw input, stored in the audit trail in place of the text.
pub fn digest_raw(raw_text: &str) -> String {
    hex::encode(Sha256::digest(raw_text.as_bytes()))
}
