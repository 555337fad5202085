//! Configuration types for pipeline execution.
//!
//! This module provides configuration options using the builder pattern
//! for flexible and ergonomic pipeline setup.

use crate::error::{FlowError, Result, ResultExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How values travel from a producing stage to its consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum HandoffMode {
    /// Hand the in-memory payload to each consumer as a Read-phase sibling.
    #[default]
    InMemory,
    /// Write each value to a container file in the scratch directory and
    /// open one Read-phase instance per consumer.
    Persisted,
}

/// What to do with side-effecting stages whose outputs nobody needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SideEffectPolicy {
    /// Run them anyway (file and database writes are never silently skipped).
    #[default]
    AlwaysRun,
    /// Skip them like any other stage without demanded outputs.
    SkipWhenUnused,
}

/// Configuration for running a pipeline.
///
/// # Example
///
/// ```rust,ignore
/// use lex_flow::{HandoffMode, PipelineConfig};
///
/// let config = PipelineConfig::builder()
///     .handoff(HandoffMode::Persisted)
///     .scratch_dir("/var/tmp/my-run")
///     .build()?;
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// How values are delivered along edges.
    /// Default: InMemory
    pub handoff: HandoffMode,

    /// Directory for container files written in `Persisted` mode.
    /// Default: `<system temp>/lex-flow`
    pub scratch_dir: PathBuf,

    /// Whether unused side-effecting stages still run.
    /// Default: AlwaysRun
    pub side_effect_policy: SideEffectPolicy,

    /// Maximum nesting depth of meta-stage expansion.
    /// Default: 16
    pub max_expansion_depth: usize,

    /// Prefix of generated relational table names (`{prefix}_{id}`).
    /// Default: "tmp"
    pub table_prefix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            handoff: HandoffMode::default(),
            scratch_dir: default_scratch_dir(),
            side_effect_policy: SideEffectPolicy::default(),
            max_expansion_depth: 16,
            table_prefix: "tmp".to_string(),
        }
    }
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("lex-flow")
}

impl PipelineConfig {
    /// Create a new configuration builder.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Validate the configuration and return errors if invalid.
    pub fn validate(&self) -> std::result::Result<(), ConfigValidationError> {
        if self.scratch_dir.as_os_str().is_empty() {
            return Err(ConfigValidationError::EmptyScratchDir);
        }

        if self.max_expansion_depth == 0 {
            return Err(ConfigValidationError::InvalidExpansionDepth(
                self.max_expansion_depth,
            ));
        }

        let mut chars = self.table_prefix.chars();
        let valid_prefix = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_prefix {
            return Err(ConfigValidationError::InvalidTablePrefix(
                self.table_prefix.clone(),
            ));
        }

        Ok(())
    }

    /// Parse and validate a JSON configuration. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .context(format!("Failed to read config '{}'", path.display()))?;
        Self::from_json_str(&json).context(format!("Invalid config '{}'", path.display()))
    }
}

/// Errors that can occur during configuration validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Scratch directory must not be empty")]
    EmptyScratchDir,

    #[error("Invalid max expansion depth: {0} (must be at least 1)")]
    InvalidExpansionDepth(usize),

    #[error("Invalid table prefix '{0}' (must be a SQL identifier)")]
    InvalidTablePrefix(String),
}

impl From<ConfigValidationError> for FlowError {
    fn from(error: ConfigValidationError) -> Self {
        FlowError::InvalidConfig(error.to_string())
    }
}

/// Builder for [`PipelineConfig`] with fluent API.
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    handoff: Option<HandoffMode>,
    scratch_dir: Option<PathBuf>,
    side_effect_policy: Option<SideEffectPolicy>,
    max_expansion_depth: Option<usize>,
    table_prefix: Option<String>,
}

impl PipelineConfigBuilder {
    pub fn handoff(mut self, mode: HandoffMode) -> Self {
        self.handoff = Some(mode);
        self
    }

    /// Set the directory for container files in `Persisted` mode.
    pub fn scratch_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(path.into());
        self
    }

    pub fn side_effect_policy(mut self, policy: SideEffectPolicy) -> Self {
        self.side_effect_policy = Some(policy);
        self
    }

    /// Bound the nesting of meta stages inside meta stages.
    pub fn max_expansion_depth(mut self, depth: usize) -> Self {
        self.max_expansion_depth = Some(depth);
        self
    }

    pub fn table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = Some(prefix.into());
        self
    }

    /// Build the configuration.
    ///
    /// Returns a validated `PipelineConfig` or an error if validation fails.
    pub fn build(self) -> std::result::Result<PipelineConfig, ConfigValidationError> {
        let config = PipelineConfig {
            handoff: self.handoff.unwrap_or_default(),
            scratch_dir: self.scratch_dir.unwrap_or_else(default_scratch_dir),
            side_effect_policy: self.side_effect_policy.unwrap_or_default(),
            max_expansion_depth: self.max_expansion_depth.unwrap_or(16),
            table_prefix: self.table_prefix.unwrap_or_else(|| "tmp".to_string()),
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.handoff, HandoffMode::InMemory);
        assert_eq!(config.side_effect_policy, SideEffectPolicy::AlwaysRun);
        assert_eq!(config.max_expansion_depth, 16);
        assert_eq!(config.table_prefix, "tmp");
        assert!(config.scratch_dir.ends_with("lex-flow"));
    }

    #[test]
    fn test_builder_custom_values() {
        let config = PipelineConfig::builder()
            .handoff(HandoffMode::Persisted)
            .scratch_dir("/var/tmp/run")
            .side_effect_policy(SideEffectPolicy::SkipWhenUnused)
            .max_expansion_depth(3)
            .table_prefix("stage")
            .build()
            .unwrap();

        assert_eq!(config.handoff, HandoffMode::Persisted);
        assert_eq!(config.scratch_dir, PathBuf::from("/var/tmp/run"));
        assert_eq!(config.side_effect_policy, SideEffectPolicy::SkipWhenUnused);
        assert_eq!(config.max_expansion_depth, 3);
        assert_eq!(config.table_prefix, "stage");
    }

    #[test]
    fn test_validation_invalid_depth() {
        let result = PipelineConfig::builder().max_expansion_depth(0).build();
        assert!(matches!(
            result.unwrap_err(),
            ConfigValidationError::InvalidExpansionDepth(0)
        ));
    }

    #[test]
    fn test_validation_invalid_prefix() {
        for prefix in ["", "1tmp", "tmp-x", "tmp x"] {
            let result = PipelineConfig::builder().table_prefix(prefix).build();
            assert!(
                matches!(result, Err(ConfigValidationError::InvalidTablePrefix(_))),
                "prefix {prefix:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_validation_empty_scratch_dir() {
        let result = PipelineConfig::builder().scratch_dir("").build();
        assert!(matches!(
            result.unwrap_err(),
            ConfigValidationError::EmptyScratchDir
        ));
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "handoff": "Persisted",
            "scratch_dir": "custom_scratch",
            "max_expansion_depth": 4
        }"#;

        let config = PipelineConfig::from_json_str(json).unwrap();
        assert_eq!(config.handoff, HandoffMode::Persisted);
        assert_eq!(config.scratch_dir.to_str().unwrap(), "custom_scratch");
        assert_eq!(config.max_expansion_depth, 4);
        assert_eq!(config.side_effect_policy, SideEffectPolicy::AlwaysRun);
        assert_eq!(config.table_prefix, "tmp");
    }

    #[test]
    fn test_config_from_json_rejects_invalid_values() {
        let err = PipelineConfig::from_json_str(r#"{"table_prefix": "9x"}"#).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIG");
    }

    #[test]
    fn test_config_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, r#"{"side_effect_policy": "SkipWhenUnused"}"#).unwrap();
        let config = PipelineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.side_effect_policy, SideEffectPolicy::SkipWhenUnused);
    }

    #[test]
    fn test_config_serialization() {
        let config = PipelineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: PipelineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, deserialized);
    }
}
