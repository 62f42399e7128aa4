/// Config directory loader with validation and hot-reload support.
///
/// Reads all config from a directory path, validates on load, watches for
/// file changes via `notify`, and emits config change events via
/// `tokio::sync::watch`.
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::watch;

use crate::config::*;
use crate::errors::WardenError;

/// Upper bound on tool retries per call.
pub const MAX_TOOL_RETRIES: u32 = 2;

/// Loads, validates, and watches configuration from a directory.
///
/// Expected directory structure:
/// ```text
/// config/
/// ├── gateway.yaml
/// ├── system-policy.md
/// └── caller-classes/
///     ├── default.yaml
///     └── partner.yaml
/// ```
pub struct ConfigLoader {
    config_dir: PathBuf,
    tx: watch::Sender<WardenConfig>,
    /// Kept alive to maintain the watch.
    _watcher: Option<RecommendedWatcher>,
}

impl ConfigLoader {
    /// Load and validate the config directory, returning the loader and a
    /// receiver that observes every accepted reload.
    pub fn load(config_dir: &Path) -> Result<(Self, watch::Receiver<WardenConfig>), WardenError> {
        let config = Self::load_all(config_dir)?;
        Self::validate(&config)?;

        let (tx, rx) = watch::channel(config);

        Ok((
            Self {
                config_dir: config_dir.to_path_buf(),
                tx,
                _watcher: None,
            },
            rx,
        ))
    }

    /// Start watching the config directory for changes.
    ///
    /// A change that loads and validates replaces the broadcast config. Anything
    /// else is logged and the previous config stays in force.
    pub fn watch(&mut self) -> Result<(), WardenError> {
        let config_dir = self.config_dir.clone();
        let tx = self.tx.clone();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    if !matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        return;
                    }
                    match Self::load_all(&config_dir).and_then(|c| Self::validate(&c).map(|_| c)) {
                        Ok(config) => {
                            let classes = config.caller_classes.len();
                            tx.send_replace(config);
                            tracing::info!(classes, "config reloaded");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "config reload rejected, keeping previous config");
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "file watcher error");
                }
            }
        })
        .map_err(|e| WardenError::Config(format!("failed to create file watcher: {e}")))?;

        watcher
            .watch(&self.config_dir, RecursiveMode::Recursive)
            .map_err(|e| WardenError::Config(format!("failed to watch config directory: {e}")))?;

        self._watcher = Some(watcher);
        tracing::info!(dir = %self.config_dir.display(), "watching config directory");
        Ok(())
    }

    /// A new receiver for the current config.
    pub fn subscribe(&self) -> watch::Receiver<WardenConfig> {
        self.tx.subscribe()
    }

    /// Load all config files from a directory.
    pub fn load_all(config_dir: &Path) -> Result<WardenConfig, WardenError> {
        let gateway = Self::load_gateway(config_dir)?;
        let system_policy = read_file(&config_dir.join("system-policy.md"))?;
        let mut caller_classes = Self::load_caller_classes(config_dir)?;

        if let Some(refusal) = &gateway.refusal_text {
            for policy in caller_classes.values_mut() {
                policy.output.refusal_text = refusal.clone();
            }
        }

        Ok(WardenConfig {
            gateway,
            system_policy: system_policy.trim().to_string(),
            caller_classes,
        })
    }

    fn load_gateway(config_dir: &Path) -> Result<GatewayConfig, WardenError> {
        let path = config_dir.join("gateway.yaml");
        let content = read_file(&path)?;
        serde_yaml::from_str(&content)
            .map_err(|e| WardenError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Load every `caller-classes/*.yaml`, keyed by file stem.
    fn load_caller_classes(
        config_dir: &Path,
    ) -> Result<HashMap<String, CallerClassPolicy>, WardenError> {
        let classes_dir = config_dir.join("caller-classes");
        let mut classes = HashMap::new();

        if !classes_dir.exists() {
            return Ok(classes);
        }

        let entries = std::fs::read_dir(&classes_dir).map_err(|e| {
            WardenError::Config(format!("failed to read {}: {e}", classes_dir.display()))
        })?;

        for entry in entries {
            let entry = entry
                .map_err(|e| WardenError::Config(format!("failed to read directory entry: {e}")))?;
            let path = entry.path();

            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let content = read_file(&path)?;
            let policy: CallerClassPolicy = serde_yaml::from_str(&content).map_err(|e| {
                WardenError::Config(format!("failed to parse {}: {e}", path.display()))
            })?;
            classes.insert(name.to_string(), policy);
        }

        Ok(classes)
    }

    /// Validate the aggregate config for internal consistency.
    ///
    /// Checks:
    /// - The default caller class exists
    /// - Thresholds and ratios lie in [0, 1]
    /// - Budget windows have a positive length and at least one positive limit
    /// - Tool retries do not exceed the retry bound
    /// - Custom rule patterns compile
    pub fn validate(config: &WardenConfig) -> Result<(), WardenError> {
        Self::validate_gateway(&config.gateway)?;

        if !config
            .caller_classes
            .contains_key(&config.gateway.default_caller_class)
        {
            return Err(WardenError::Config(format!(
                "default_caller_class '{}' has no caller-classes/{}.yaml",
                config.gateway.default_caller_class, config.gateway.default_caller_class
            )));
        }
        if config.system_policy.trim().is_empty() {
            return Err(WardenError::Config(
                "system-policy.md must not be empty".to_string(),
            ));
        }

        for (name, policy) in &config.caller_classes {
            Self::validate_caller_class(name, policy)?;
        }
        Ok(())
    }

    fn validate_gateway(gateway: &GatewayConfig) -> Result<(), WardenError> {
        if gateway.model_timeout_secs == 0 {
            return Err(WardenError::Config(
                "model_timeout_secs must be positive".to_string(),
            ));
        }
        if gateway.session_idle_secs == 0 {
            return Err(WardenError::Config(
                "session_idle_secs must be positive".to_string(),
            ));
        }
        if gateway.cost_per_1k_tokens < 0.0 {
            return Err(WardenError::Config(
                "cost_per_1k_tokens must not be negative".to_string(),
            ));
        }
        for rule in &gateway.extra_rules {
            regex::Regex::new(&rule.pattern).map_err(|e| {
                WardenError::Config(format!(
                    "invalid regex in extra_rules '{}': {e}",
                    rule.name
                ))
            })?;
            validate_unit(rule.severity, &format!("extra_rules '{}' severity", rule.name))?;
        }
        validate_circuit_breaker(&gateway.circuit_breaker, "circuit_breaker")
    }

    fn validate_caller_class(name: &str, policy: &CallerClassPolicy) -> Result<(), WardenError> {
        let ctx = format!("caller class '{name}'");

        if policy.input.max_input_chars == 0 {
            return Err(WardenError::Config(format!(
                "{ctx}: input.max_input_chars must be positive"
            )));
        }
        validate_thresholds(&policy.input.thresholds, &format!("{ctx} input"))?;
        validate_thresholds(&policy.output.thresholds, &format!("{ctx} output"))?;
        validate_unit(
            policy.output.leak_overlap_ratio,
            &format!("{ctx}: output.leak_overlap_ratio"),
        )?;
        if policy.output.leak_ngram_size == 0 {
            return Err(WardenError::Config(format!(
                "{ctx}: output.leak_ngram_size must be positive"
            )));
        }

        if policy.budget_windows.is_empty() {
            return Err(WardenError::Config(format!(
                "{ctx}: at least one budget window is required"
            )));
        }
        for window in &policy.budget_windows {
            validate_window(window, &ctx)?;
        }

        if policy.max_plan_steps == 0 {
            return Err(WardenError::Config(format!(
                "{ctx}: max_plan_steps must be positive"
            )));
        }
        if policy.tool_retries > MAX_TOOL_RETRIES {
            return Err(WardenError::Config(format!(
                "{ctx}: tool_retries must be at most {MAX_TOOL_RETRIES} (got {})",
                policy.tool_retries
            )));
        }
        if policy.approval.timeout_secs == 0 {
            return Err(WardenError::Config(format!(
                "{ctx}: approval.timeout_secs must be positive"
            )));
        }
        validate_unit(policy.max_session_risk, &format!("{ctx}: max_session_risk"))?;
        Ok(())
    }
}

fn read_file(path: &Path) -> Result<String, WardenError> {
    std::fs::read_to_string(path)
        .map_err(|e| WardenError::Config(format!("failed to read {}: {e}", path.display())))
}

/// Validate that a value lies in [0, 1].
fn validate_unit(value: f64, what: &str) -> Result<(), WardenError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(WardenError::Config(format!(
            "{what} must be within [0, 1] (got {value})"
        )))
    }
}

fn validate_thresholds(t: &ScoringThresholds, context: &str) -> Result<(), WardenError> {
    validate_unit(t.block_threshold, &format!("{context} block_threshold"))?;
    validate_unit(t.critical_severity, &format!("{context} critical_severity"))?;
    validate_unit(t.medium_severity, &format!("{context} medium_severity"))?;
    if t.medium_severity > t.critical_severity {
        return Err(WardenError::Config(format!(
            "{context}: medium_severity must not exceed critical_severity"
        )));
    }
    if t.medium_escalation_count == 0 {
        return Err(WardenError::Config(format!(
            "{context}: medium_escalation_count must be positive"
        )));
    }
    Ok(())
}

fn validate_window(window: &BudgetWindowConfig, context: &str) -> Result<(), WardenError> {
    if window.window_secs == 0 {
        return Err(WardenError::Config(format!(
            "{context}: budget window '{}' must have positive window_secs",
            window.name
        )));
    }
    let limits = [
        window.max_requests.map(|v| v > 0),
        window.max_tokens.map(|v| v > 0),
        window.max_cost.map(|v| v > 0.0),
    ];
    if limits.iter().any(|l| *l == Some(false)) {
        return Err(WardenError::Config(format!(
            "{context}: budget window '{}' limits must be positive",
            window.name
        )));
    }
    if limits.iter().all(|l| l.is_none()) {
        return Err(WardenError::Config(format!(
            "{context}: budget window '{}' sets no limit",
            window.name
        )));
    }
    Ok(())
}

/// Validate circuit breaker configuration values.
fn validate_circuit_breaker(cb: &CircuitBreakerConfig, context: &str) -> Result<(), WardenError> {
    if cb.error_threshold == 0 {
        return Err(WardenError::Config(format!(
            "{context}: error_threshold must be positive"
        )));
    }
    if cb.error_window_secs == 0 {
        return Err(WardenError::Config(format!(
            "{context}: error_window_secs must be positive"
        )));
    }
    if cb.recovery_timeout_secs == 0 {
        return Err(WardenError::Config(format!(
            "{context}: recovery_timeout_secs must be positive"
        )));
    }
    if cb.recovery_probes == 0 {
        return Err(WardenError::Config(format!(
            "{context}: recovery_probes must be positive"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;

    use crate::actions::{FindingCategory, RuleAction};

    const DEFAULT_CLASS: &str = r#"
authorized_tools:
  - lookup_order
  - check_status
input:
  max_input_chars: 2000
budget_windows:
  - name: minute
    window_secs: 60
    max_requests: 10
  - name: day
    window_secs: 86400
    max_tokens: 200000
max_plan_steps: 5
tool_retries: 1
approval:
  timeout_secs: 120
  pre_approved_tools:
    - check_status
"#;

    /// Create a temporary config directory with valid default files.
    fn setup_config_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();

        fs::write(
            dir.path().join("gateway.yaml"),
            r#"
default_caller_class: default
model_timeout_secs: 20
extra_rules:
  - name: internal-hostname
    pattern: "(?i)\\b[a-z0-9-]+\\.corp\\.internal\\b"
    category: data-exfiltration-pattern
    severity: 0.6
    action: redact
    scope: output
"#,
        )
        .unwrap();

        fs::write(
            dir.path().join("system-policy.md"),
            "You are the order support assistant for Example Corp.\n\
             Never disclose internal account notes.\n",
        )
        .unwrap();

        let classes = dir.path().join("caller-classes");
        fs::create_dir_all(&classes).unwrap();
        fs::write(classes.join("default.yaml"), DEFAULT_CLASS).unwrap();
        fs::write(
            classes.join("partner.yaml"),
            r#"
authorized_tools:
  - lookup_order
  - delete_record
approval:
  partial_plan_mode: true
"#,
        )
        .unwrap();

        dir
    }

    // ============================
    // Parsing tests
    // ============================

    #[test]
    fn test_parse_gateway_yaml() {
        let dir = setup_config_dir();
        let config = ConfigLoader::load_all(dir.path()).unwrap();

        assert_eq!(config.gateway.default_caller_class, "default");
        assert_eq!(config.gateway.model_timeout_secs, 20);
        assert!(config.gateway.hash_raw_input);
        assert_eq!(config.gateway.session_idle_secs, 3600);

        let rule = &config.gateway.extra_rules[0];
        assert_eq!(rule.category, FindingCategory::DataExfiltrationPattern);
        assert_eq!(rule.action, RuleAction::Redact);
        assert_eq!(rule.scope, RuleScope::Output);
    }

    #[test]
    fn test_parse_caller_classes() {
        let dir = setup_config_dir();
        let config = ConfigLoader::load_all(dir.path()).unwrap();

        assert_eq!(config.caller_classes.len(), 2);
        let default = &config.caller_classes["default"];
        assert!(default.authorized_tools.contains("lookup_order"));
        assert_eq!(default.input.max_input_chars, 2000);
        assert_eq!(default.budget_windows.len(), 2);
        assert_eq!(default.budget_windows[1].max_tokens, Some(200000));
        assert_eq!(default.budget_windows[1].max_requests, None);
        assert!(default.approval.pre_approved_tools.contains("check_status"));

        let partner = &config.caller_classes["partner"];
        assert!(partner.approval.partial_plan_mode);
        // Unspecified fields fall back to defaults.
        assert_eq!(partner.output.leak_overlap_ratio, 0.5);
        assert_eq!(partner.input.thresholds.medium_escalation_count, 2);
    }

    #[test]
    fn test_system_policy_is_trimmed() {
        let dir = setup_config_dir();
        let config = ConfigLoader::load_all(dir.path()).unwrap();
        assert!(config.system_policy.starts_with("You are the order support"));
        assert!(!config.system_policy.ends_with('\n'));
    }

    #[test]
    fn test_refusal_override_reaches_every_class() {
        let dir = setup_config_dir();
        fs::write(
            dir.path().join("gateway.yaml"),
            "default_caller_class: default\nrefusal_text: \"Request declined.\"\n",
        )
        .unwrap();

        let config = ConfigLoader::load_all(dir.path()).unwrap();
        assert_eq!(config.refusal_text(), "Request declined.");
        for policy in config.caller_classes.values() {
            assert_eq!(policy.output.refusal_text, "Request declined.");
        }
    }

    #[test]
    fn test_caller_class_resolution() {
        let dir = setup_config_dir();
        let config = ConfigLoader::load_all(dir.path()).unwrap();

        let (name, _) = config.caller_class(None).unwrap();
        assert_eq!(name, "default");
        let (name, policy) = config.caller_class(Some("partner")).unwrap();
        assert_eq!(name, "partner");
        assert!(policy.authorized_tools.contains("delete_record"));
        assert!(config.caller_class(Some("unknown")).is_none());
    }

    // ============================
    // Validation tests
    // ============================

    #[test]
    fn test_valid_config_passes() {
        let dir = setup_config_dir();
        let config = ConfigLoader::load_all(dir.path()).unwrap();
        assert!(ConfigLoader::validate(&config).is_ok());
    }

    #[test]
    fn test_validation_catches_missing_default_class() {
        let dir = setup_config_dir();
        fs::remove_file(dir.path().join("caller-classes/default.yaml")).unwrap();

        let config = ConfigLoader::load_all(dir.path()).unwrap();
        let err = ConfigLoader::validate(&config).unwrap_err().to_string();
        assert!(err.contains("default_caller_class 'default'"));
    }

    #[test]
    fn test_validation_catches_excess_retries() {
        let dir = setup_config_dir();
        fs::write(
            dir.path().join("caller-classes/partner.yaml"),
            "tool_retries: 3\n",
        )
        .unwrap();

        let config = ConfigLoader::load_all(dir.path()).unwrap();
        let err = ConfigLoader::validate(&config).unwrap_err().to_string();
        assert!(err.contains("tool_retries must be at most 2"));
        assert!(err.contains("partner"));
    }

    #[test]
    fn test_validation_catches_threshold_out_of_range() {
        let dir = setup_config_dir();
        fs::write(
            dir.path().join("caller-classes/partner.yaml"),
            "output:\n  leak_overlap_ratio: 1.5\n",
        )
        .unwrap();

        let config = ConfigLoader::load_all(dir.path()).unwrap();
        let err = ConfigLoader::validate(&config).unwrap_err().to_string();
        assert!(err.contains("leak_overlap_ratio must be within [0, 1]"));
    }

    #[test]
    fn test_validation_catches_window_without_limits() {
        let dir = setup_config_dir();
        fs::write(
            dir.path().join("caller-classes/partner.yaml"),
            "budget_windows:\n  - name: hour\n    window_secs: 3600\n",
        )
        .unwrap();

        let config = ConfigLoader::load_all(dir.path()).unwrap();
        let err = ConfigLoader::validate(&config).unwrap_err().to_string();
        assert!(err.contains("budget window 'hour' sets no limit"));
    }

    #[test]
    fn test_validation_catches_zero_window_limit() {
        let window = BudgetWindowConfig {
            name: "minute".to_string(),
            window_secs: 60,
            max_requests: Some(0),
            max_tokens: None,
            max_cost: None,
        };
        let err = validate_window(&window, "test").unwrap_err().to_string();
        assert!(err.contains("limits must be positive"));
    }

    #[test]
    fn test_validation_catches_invalid_regex() {
        let dir = setup_config_dir();
        fs::write(
            dir.path().join("gateway.yaml"),
            r#"
extra_rules:
  - name: broken
    pattern: "[invalid regex"
    category: pii-pattern
    severity: 0.3
"#,
        )
        .unwrap();

        let config = ConfigLoader::load_all(dir.path()).unwrap();
        let err = ConfigLoader::validate(&config).unwrap_err().to_string();
        assert!(err.contains("invalid regex in extra_rules 'broken'"));
    }

    #[test]
    fn test_validation_catches_zero_session_idle() {
        let dir = setup_config_dir();
        fs::write(dir.path().join("gateway.yaml"), "session_idle_secs: 0\n").unwrap();

        let config = ConfigLoader::load_all(dir.path()).unwrap();
        let err = ConfigLoader::validate(&config).unwrap_err().to_string();
        assert!(err.contains("session_idle_secs must be positive"));
    }

    #[test]
    fn test_validation_catches_zero_circuit_breaker_threshold() {
        let cb = CircuitBreakerConfig {
            error_threshold: 0,
            ..Default::default()
        };
        let err = validate_circuit_breaker(&cb, "test").unwrap_err().to_string();
        assert!(err.contains("error_threshold must be positive"));
    }

    // ============================
    // Error message quality tests
    // ============================

    #[test]
    fn test_error_for_missing_gateway_file() {
        let dir = setup_config_dir();
        fs::remove_file(dir.path().join("gateway.yaml")).unwrap();

        let err = ConfigLoader::load_all(dir.path()).unwrap_err().to_string();
        assert!(err.contains("gateway.yaml"));
        assert!(err.contains("failed to read"));
    }

    #[test]
    fn test_error_for_invalid_yaml() {
        let dir = setup_config_dir();
        fs::write(
            dir.path().join("caller-classes/partner.yaml"),
            "this is not: valid: yaml: [",
        )
        .unwrap();

        let err = ConfigLoader::load_all(dir.path()).unwrap_err().to_string();
        assert!(err.contains("failed to parse"));
        assert!(err.contains("partner.yaml"));
    }

    #[test]
    fn test_non_yaml_files_ignored() {
        let dir = setup_config_dir();
        fs::write(dir.path().join("caller-classes/README.txt"), "notes").unwrap();

        let config = ConfigLoader::load_all(dir.path()).unwrap();
        assert_eq!(config.caller_classes.len(), 2);
    }

    #[test]
    fn test_default_configs_parse_successfully() {
        // The shipped config/ directory at the workspace root must load and validate.
        let config_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .parent()
            .unwrap()
            .parent()
            .unwrap()
            .join("config");

        if config_dir.exists() {
            let result = ConfigLoader::load(&config_dir);
            assert!(result.is_ok(), "default configs failed: {:?}", result.err());
        }
    }

    // ============================
    // Hot-reload tests
    // ============================

    #[tokio::test]
    async fn test_hot_reload_detects_file_changes() {
        let dir = setup_config_dir();
        let (mut loader, mut rx) = ConfigLoader::load(dir.path()).unwrap();
        assert_eq!(rx.borrow().caller_classes["default"].authorized_tools.len(), 2);

        loader.watch().unwrap();

        let mut file = fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(dir.path().join("caller-classes/default.yaml"))
            .unwrap();
        write!(
            file,
            "{}",
            DEFAULT_CLASS.replacen("  - check_status\n", "  - check_status\n  - track_shipment\n", 1)
        )
        .unwrap();
        drop(file);

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let changed = tokio::time::timeout_at(deadline, rx.changed()).await;
            assert!(changed.is_ok(), "timed out waiting for config change");
            if rx.borrow().caller_classes["default"]
                .authorized_tools
                .contains("track_shipment")
            {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_invalid_reload_keeps_previous_config() {
        let dir = setup_config_dir();
        let (mut loader, rx) = ConfigLoader::load(dir.path()).unwrap();
        loader.watch().unwrap();

        fs::write(
            dir.path().join("caller-classes/default.yaml"),
            "tool_retries: 9\n",
        )
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;

        assert_eq!(rx.borrow().caller_classes["default"].tool_retries, 1);
    }
}
