//! Pattern rule library shared by the input validator and output filter.
//!
//! A [`RuleSet`] is a list of compiled regex rules, each tagged with a finding
//! category, a severity and an action (flag, redact or escape). Scanning is a
//! pure function of the text and the scoring thresholds; [`score`] turns a
//! finding set into an aggregate risk and a verdict under the two-tier policy:
//!
//! - any critical finding blocks
//! - two or more medium findings block, whether from distinct rules or
//!   repeated hits of one rule
//! - aggregate risk at or above the block threshold blocks
//! - otherwise neutralized findings yield `Redact`, and no findings yield `Allow`

use std::collections::HashMap;

use regex::Regex;
use warden_types::actions::{Finding, FindingCategory, RuleAction, TextSpan, Verdict};
use warden_types::config::{RuleConfig, RuleScope, ScoringThresholds};
use warden_types::errors::WardenError;

/// Maximum length of the matched-text snippet kept on a finding.
const SNIPPET_CHARS: usize = 100;

/// A compiled detection rule.
pub struct Rule {
    /// Rule name recorded on findings.
    pub name: String,
    /// Finding category.
    pub category: FindingCategory,
    /// Severity in [0, 1].
    pub severity: f64,
    /// Whether a match alone forces a block.
    pub critical: bool,
    /// What to do with matched text.
    pub action: RuleAction,
    regex: Regex,
    /// Extra check on each match (e.g. Luhn for card numbers).
    check: Option<fn(&str) -> bool>,
}

impl Rule {
    /// Compile a rule.
    pub fn new(
        name: impl Into<String>,
        pattern: &str,
        category: FindingCategory,
        severity: f64,
        action: RuleAction,
    ) -> Result<Self, WardenError> {
        let name = name.into();
        let regex = Regex::new(pattern)
            .map_err(|e| WardenError::Config(format!("invalid regex in rule '{name}': {e}")))?;
        Ok(Self {
            name,
            category,
            severity: severity.clamp(0.0, 1.0),
            critical: false,
            action,
            regex,
            check: None,
        })
    }

    /// Mark the rule critical.
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    fn with_check(mut self, check: fn(&str) -> bool) -> Self {
        self.check = Some(check);
        self
    }

    fn from_config(config: &RuleConfig) -> Result<Self, WardenError> {
        let mut rule = Self::new(
            config.name.clone(),
            &config.pattern,
            config.category,
            config.severity,
            config.action,
        )?;
        rule.critical = config.critical;
        Ok(rule)
    }
}

/// An ordered collection of compiled rules.
#[derive(Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// An empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in rules applied to caller input.
    pub fn builtin_input() -> Self {
        let mut set = Self::new();
        set.rules.extend(instruction_rules());
        set.rules.extend(encoding_rules());
        set.rules.extend(pii_rules());
        set.rules.push(builtin(
            "exfiltration_request",
            r"(?i)\b(send|forward|upload|post|email|exfiltrate)\s+(all\s+|the\s+|every\s+|my\s+)*(data|records|customer\s+data|conversation|credentials|passwords|database|history)\s+(to|at)\b",
            FindingCategory::DataExfiltrationPattern,
            0.5,
            RuleAction::Flag,
        ));
        set
    }

    /// Built-in rules applied to model output.
    pub fn builtin_output() -> Self {
        let mut set = Self::new();
        set.rules.push(builtin(
            "markdown_image_exfil",
            r"!\[[^\]\n]*\]\(\s*https?://[^)\s]*\?[^)\s]*\)",
            FindingCategory::DataExfiltrationPattern,
            0.8,
            RuleAction::Redact,
        ));
        set.rules.push(builtin(
            "link_with_payload",
            r"\[[^\]\n]*\]\(\s*https?://[^)\s]*[?&][A-Za-z0-9_]+=[^)\s&]{16,}[^)\s]*\)",
            FindingCategory::DataExfiltrationPattern,
            0.6,
            RuleAction::Redact,
        ));
        set.rules.push(
            builtin(
                "harmful_instructions",
                r"(?i)\b(make|build|synthesi[sz]e|assemble|manufacture)\s+(a\s+|an\s+|your\s+own\s+)?(pipe\s+bomb|explosive\s+device|nerve\s+agent|bioweapon|methamphetamine)\b",
                FindingCategory::OutOfScope,
                0.95,
                RuleAction::Flag,
            )
            .critical(),
        );
        set.rules.extend(
            encoding_rules()
                .into_iter()
                .filter(|r| r.action == RuleAction::Escape),
        );
        set.rules.extend(pii_rules());
        set
    }

    /// Append a rule.
    pub fn push(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// Merge configured rules that apply to `scope` (input or output).
    pub fn with_config_rules(
        mut self,
        configs: &[RuleConfig],
        scope: RuleScope,
    ) -> Result<Self, WardenError> {
        for config in configs {
            if config.scope == RuleScope::Both || config.scope == scope {
                self.rules.push(Rule::from_config(config)?);
            }
        }
        Ok(self)
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the set has no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Scan `text` and return all findings ordered by span start.
    ///
    /// Criticality is resolved against `thresholds`. With `redact_pii` off,
    /// PII rules only flag.
    pub fn scan(&self, text: &str, thresholds: &ScoringThresholds) -> Vec<Finding> {
        let mut findings = Vec::new();

        for rule in &self.rules {
            let action = if rule.category == FindingCategory::PiiPattern && !thresholds.redact_pii
            {
                RuleAction::Flag
            } else {
                rule.action
            };

            for m in rule.regex.find_iter(text) {
                if let Some(check) = rule.check {
                    if !check(m.as_str()) {
                        continue;
                    }
                }
                findings.push(Finding {
                    category: rule.category,
                    rule: rule.name.clone(),
                    severity: rule.severity,
                    critical: rule.critical || rule.severity >= thresholds.critical_severity,
                    action,
                    span: TextSpan {
                        start: m.start(),
                        end: m.end(),
                    },
                    // Redacted spans are not copied into findings.
                    matched: if action == RuleAction::Redact {
                        String::new()
                    } else {
                        snippet(m.as_str())
                    },
                });
            }
        }

        findings.sort_by(|a, b| {
            a.span
                .start
                .cmp(&b.span.start)
                .then_with(|| a.rule.cmp(&b.rule))
        });
        findings
    }

    /// Apply redact and escape actions from `findings` to `text`.
    ///
    /// Overlapping spans are resolved in favour of the earliest start.
    pub fn redact(text: &str, findings: &[Finding]) -> String {
        let mut spans: Vec<&Finding> = findings
            .iter()
            .filter(|f| f.action != RuleAction::Flag)
            .collect();
        spans.sort_by_key(|f| (f.span.start, std::cmp::Reverse(f.span.end)));

        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        for finding in spans {
            let TextSpan { start, end } = finding.span;
            if start < cursor || end > text.len() || !text.is_char_boundary(start) {
                continue;
            }
            out.push_str(&text[cursor..start]);
            match finding.action {
                RuleAction::Redact => {
                    out.push_str("[REDACTED:");
                    out.push_str(finding.category.as_str());
                    out.push(']');
                }
                RuleAction::Escape => {
                    for ch in text[start..end].chars() {
                        out.push_str(&format!("[U+{:04X}]", ch as u32));
                    }
                }
                RuleAction::Flag => {}
            }
            cursor = end;
        }
        out.push_str(&text[cursor..]);
        out
    }
}

/// Aggregate a finding set into `(risk_score, verdict)`.
///
/// Risk is the noisy-or of each rule's strongest finding, excluding redacted
/// findings, so repeated hits of one rule do not inflate it. Medium escalation
/// counts every unredacted finding at or above the medium severity, repeats
/// included.
pub fn score(findings: &[Finding], thresholds: &ScoringThresholds) -> (f64, Verdict) {
    let mut per_rule: HashMap<&str, f64> = HashMap::new();
    for f in findings.iter().filter(|f| f.action != RuleAction::Redact) {
        let entry = per_rule.entry(f.rule.as_str()).or_insert(0.0);
        if f.severity > *entry {
            *entry = f.severity;
        }
    }

    let risk = 1.0
        - per_rule
            .values()
            .fold(1.0, |acc, severity| acc * (1.0 - severity));
    let mediums = findings
        .iter()
        .filter(|f| f.action != RuleAction::Redact && f.severity >= thresholds.medium_severity)
        .count();

    let verdict = if findings.iter().any(|f| f.critical)
        || mediums >= thresholds.medium_escalation_count
        || risk >= thresholds.block_threshold
    {
        Verdict::Block
    } else if findings.iter().any(|f| f.action != RuleAction::Flag) {
        Verdict::Redact
    } else {
        Verdict::Allow
    };

    (risk, verdict)
}

/// Upper bound on scan/redact passes in [`neutralize`].
const MAX_PASSES: usize = 8;

/// Scan and redact repeatedly until a pass finds nothing to neutralize.
///
/// A single pass is not always enough: removing one match can expose another
/// (a greedy card match failing its checksum hides a shorter valid one).
/// Returns the final text and the findings of every pass, so a second call on
/// the returned text finds a subset of them and returns the text unchanged.
///
/// Flagged text survives redaction and is matched again on later passes; a
/// later pass only contributes the flagged hits an earlier pass did not see.
pub fn neutralize<F>(text: &str, scan: F) -> (String, Vec<Finding>)
where
    F: Fn(&str) -> Vec<Finding>,
{
    let mut current = text.to_string();
    let mut findings = Vec::new();
    let mut flagged: HashMap<(String, String), usize> = HashMap::new();
    for _ in 0..MAX_PASSES {
        let pass = scan(&current);
        let next = pass
            .iter()
            .any(|f| f.action != RuleAction::Flag)
            .then(|| RuleSet::redact(&current, &pass));

        let mut seen: HashMap<(String, String), usize> = HashMap::new();
        for finding in pass {
            if finding.action == RuleAction::Flag {
                let key = (finding.rule.clone(), finding.matched.clone());
                let count = seen.entry(key.clone()).or_insert(0);
                *count += 1;
                let known = flagged.entry(key).or_insert(0);
                if *count <= *known {
                    continue;
                }
                *known = *count;
            }
            findings.push(finding);
        }
        match next {
            Some(redacted) => current = redacted,
            None => break,
        }
    }
    (current, findings)
}

fn snippet(matched: &str) -> String {
    if matched.chars().count() > SNIPPET_CHARS {
        let head: String = matched.chars().take(SNIPPET_CHARS - 3).collect();
        format!("{head}...")
    } else {
        matched.to_string()
    }
}

/// Compile a built-in rule. Built-in patterns are constants.
fn builtin(
    name: &str,
    pattern: &str,
    category: FindingCategory,
    severity: f64,
    action: RuleAction,
) -> Rule {
    Rule::new(name, pattern, category, severity, action).expect("built-in rule pattern is valid")
}

fn instruction_rules() -> Vec<Rule> {
    vec![
        builtin(
            "ignore_instructions",
            r"(?i)\b(ignore|disregard|forget)\s+(all\s+|any\s+)?(of\s+)?(the\s+|your\s+)?(previous|prior|above|earlier|preceding)\s+(instructions|directives|rules|prompts|guidelines|messages)",
            FindingCategory::InstructionOverride,
            0.7,
            RuleAction::Flag,
        ),
        builtin(
            "new_instructions",
            r"(?i)\b((new|updated)\s+instructions?\s*:|override\s+(all\s+|your\s+)?(instructions|rules|safety)|your\s+new\s+(instructions|rules|task)\s+(are|is))",
            FindingCategory::InstructionOverride,
            0.6,
            RuleAction::Flag,
        ),
        builtin(
            "delimiter_injection",
            r"(?i)(\[/?(system|inst|instructions?|admin)\]|</?(system|instructions?|admin)>|<\|im_(start|end)\|>)",
            FindingCategory::InstructionOverride,
            0.6,
            RuleAction::Flag,
        ),
        builtin(
            "role_play",
            r"(?i)\b(you\s+are\s+now|act\s+as\s+(if\s+you\s+(are|were)\s+|an?\s+)|pretend\s+(to\s+be|you\s+are)|roleplay\s+as|from\s+now\s+on\s+you)",
            FindingCategory::RoleChange,
            0.6,
            RuleAction::Flag,
        ),
        builtin(
            "jailbreak_mode",
            r"(?i)\b(developer\s+mode|jailbreak(ed)?|do\s+anything\s+now)\b",
            FindingCategory::RoleChange,
            0.7,
            RuleAction::Flag,
        ),
        builtin(
            "speaker_prefix",
            r"(?m)^\s*(system|SYSTEM|assistant|ASSISTANT)\s*:",
            FindingCategory::RoleChange,
            0.5,
            RuleAction::Flag,
        ),
        builtin(
            "prompt_probe",
            r"(?i)\b(reveal|show|print|repeat|display|output|tell\s+me|what\s+(is|are))\s+(me\s+)?(your|the)\s+(system\s+prompt|initial\s+(prompt|instructions)|hidden\s+(prompt|instructions)|system\s+(message|policy)|instructions)",
            FindingCategory::PromptLeak,
            0.6,
            RuleAction::Flag,
        ),
    ]
}

fn encoding_rules() -> Vec<Rule> {
    vec![
        builtin(
            "base64_block",
            r"[A-Za-z0-9+/]{50,}={0,2}",
            FindingCategory::EncodingBypass,
            0.5,
            RuleAction::Flag,
        ),
        builtin(
            "escaped_byte_run",
            r"(?i)(\\x[0-9a-f]{2}){8,}|(%[0-9a-f]{2}){8,}",
            FindingCategory::EncodingBypass,
            0.5,
            RuleAction::Flag,
        ),
        builtin(
            "bidi_control",
            r"[\u{200E}\u{200F}\u{202A}-\u{202E}\u{2066}-\u{2069}]+",
            FindingCategory::EncodingBypass,
            0.6,
            RuleAction::Escape,
        ),
        builtin(
            "invisible_char",
            r"[\u{200B}\u{2060}\u{FEFF}\u{180E}]+",
            FindingCategory::EncodingBypass,
            0.3,
            RuleAction::Escape,
        ),
    ]
}

fn pii_rules() -> Vec<Rule> {
    vec![
        builtin(
            "email_address",
            r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}",
            FindingCategory::PiiPattern,
            0.3,
            RuleAction::Redact,
        ),
        builtin(
            "us_ssn",
            r"\b\d{3}-\d{2}-\d{4}\b",
            FindingCategory::PiiPattern,
            0.3,
            RuleAction::Redact,
        ),
        builtin(
            "payment_card",
            r"\b(?:\d[ -]?){12,18}\d\b",
            FindingCategory::PiiPattern,
            0.3,
            RuleAction::Redact,
        )
        .with_check(luhn_valid),
        builtin(
            "phone_number",
            r"(?:\+?1[ .-]?)?\(?\b\d{3}\)?[ .-]\d{3}[ .-]\d{4}\b",
            FindingCategory::PiiPattern,
            0.3,
            RuleAction::Redact,
        ),
    ]
}

/// Luhn checksum over the digits of `candidate`.
fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}
