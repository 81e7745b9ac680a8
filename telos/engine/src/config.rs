//! TOML configuration of the engine and its runtime loops.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// How the two periodic activities share the runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    /// One task alternating deliberation and intention processing.
    #[default]
    Cooperative,
    /// Independent deliberation and intention tasks.
    Concurrent,
}

/// What happens when a belief revision or promotion rule returns an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleFailurePolicy {
    /// Abort the cycle with [`crate::EngineError::RuleFailed`].
    #[default]
    Propagate,
    /// Record a failure event and continue with the next rule.
    Record,
}

/// Loop scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Scheduling mode.
    #[serde(default)]
    pub mode: RuntimeMode,
    /// Period of the deliberation loop.
    #[serde(default = "default_interval_ms")]
    pub deliberation_interval_ms: u64,
    /// Period of the intention loop.
    #[serde(default = "default_interval_ms")]
    pub intention_interval_ms: u64,
}

impl RuntimeSettings {
    /// Deliberation period.
    #[must_use]
    pub const fn deliberation_interval(&self) -> Duration {
        Duration::from_millis(self.deliberation_interval_ms)
    }

    /// Intention period.
    #[must_use]
    pub const fn intention_interval(&self) -> Duration {
        Duration::from_millis(self.intention_interval_ms)
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            mode: RuntimeMode::default(),
            deliberation_interval_ms: default_interval_ms(),
            intention_interval_ms: default_interval_ms(),
        }
    }
}

/// Intention queue limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentionSettings {
    /// Queue length at which deliberation ticks are skipped.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for IntentionSettings {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

/// Rule execution policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSettings {
    /// Reaction to failing belief revision and promotion rules.
    #[serde(default)]
    pub failure_policy: RuleFailurePolicy,
}

/// Explanation limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplainerSettings {
    /// Deepest level a traversal expands.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

impl Default for ExplainerSettings {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
        }
    }
}

/// Structured log output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySettings {
    /// Module name stamped on every record.
    #[serde(default = "default_module")]
    pub module: String,
    /// JSON-lines log file; relative paths resolve against the config file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            module: default_module(),
            log_path: None,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// `[runtime]`
    #[serde(default)]
    pub runtime: RuntimeSettings,
    /// `[intentions]`
    #[serde(default)]
    pub intentions: IntentionSettings,
    /// `[rules]`
    #[serde(default)]
    pub rules: RuleSettings,
    /// `[explainer]`
    #[serde(default)]
    pub explainer: ExplainerSettings,
    /// `[telemetry]`
    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

impl EngineConfig {
    /// Loads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading engine config {}", path.display()))?;
        let mut config =
            Self::from_toml(&raw).with_context(|| format!("parsing {}", path.display()))?;
        if let Some(log_path) = &config.telemetry.log_path {
            if log_path.is_relative() {
                let base = path.parent().unwrap_or_else(|| Path::new("."));
                config.telemetry.log_path = Some(base.join(log_path));
            }
        }
        Ok(config)
    }

    /// Parses and validates TOML text.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Rejects settings the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.runtime.deliberation_interval_ms == 0 || self.runtime.intention_interval_ms == 0 {
            bail!("runtime intervals must be positive");
        }
        if self.intentions.capacity == 0 {
            bail!("intention capacity must be positive");
        }
        if self.explainer.max_depth == 0 {
            bail!("explainer max_depth must be positive");
        }
        if self.telemetry.module.trim().is_empty() {
            bail!("telemetry module name must not be empty");
        }
        Ok(())
    }
}

const fn default_interval_ms() -> u64 {
    500
}

const fn default_capacity() -> usize {
    1_024
}

const fn default_max_depth() -> usize {
    64
}

fn default_module() -> String {
    "telos".into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_document_uses_defaults() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.runtime.deliberation_interval(), Duration::from_millis(500));
        assert_eq!(config.rules.failure_policy, RuleFailurePolicy::Propagate);
    }

    #[test]
    fn sections_override_defaults() {
        let config = EngineConfig::from_toml(
            r#"
            [runtime]
            mode = "concurrent"
            intention_interval_ms = 50

            [rules]
            failure_policy = "record"

            [explainer]
            max_depth = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.runtime.mode, RuntimeMode::Concurrent);
        assert_eq!(config.runtime.intention_interval_ms, 50);
        assert_eq!(config.runtime.deliberation_interval_ms, 500);
        assert_eq!(config.rules.failure_policy, RuleFailurePolicy::Record);
        assert_eq!(config.explainer.max_depth, 8);
    }

    #[test]
    fn shipped_config_matches_defaults() {
        let config = EngineConfig::from_toml(include_str!("../config/engine.toml")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn zero_values_are_rejected() {
        assert!(EngineConfig::from_toml("[intentions]\ncapacity = 0").is_err());
        assert!(EngineConfig::from_toml("[runtime]\ndeliberation_interval_ms = 0").is_err());
        assert!(EngineConfig::from_toml("[explainer]\nmax_depth = 0").is_err());
        assert!(EngineConfig::from_toml("[runtime]\nmode = \"parallel\"").is_err());
    }

    #[test]
    fn load_resolves_log_path_next_to_the_file() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("engine.toml");
        std::fs::write(&path, "[telemetry]\nlog_path = \"logs/engine.log\"\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(
            config.telemetry.log_path,
            Some(tmp.path().join("logs/engine.log"))
        );
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("[runtime]"));
        assert!(EngineConfig::load(tmp.path().join("missing.toml")).is_err());
    }
}
