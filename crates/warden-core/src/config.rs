//! Engine configuration parsing.
//!
//! Tunables that are operational rather than correctness-bearing live
//! here, loadable from a TOML fragment of the agent's configuration file.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML content could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration could not be serialized.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Transitive-rule culling tunables.
    #[serde(default)]
    pub cull: CullConfig,
}

impl EngineConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Serializes configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Tunables for the transitive-rule culler.
///
/// The defaults (500 000 rules, 180 days, one hour) carry over from fleet
/// deployments where transitive-rule growth first became an operational
/// problem; they bound hygiene cost, not correctness, and deployments may
/// lower them freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CullConfig {
    /// Total rule count below which culling is skipped entirely.
    #[serde(default = "default_cull_min_rule_count")]
    pub min_rule_count: u64,

    /// Age in seconds past which an unexercised transitive rule is
    /// considered stale.
    #[serde(default = "default_cull_retention_secs")]
    pub retention_secs: u64,

    /// Minimum seconds between cull runs.
    #[serde(default = "default_cull_min_interval_secs")]
    pub min_interval_secs: u64,
}

impl Default for CullConfig {
    fn default() -> Self {
        Self {
            min_rule_count: default_cull_min_rule_count(),
            retention_secs: default_cull_retention_secs(),
            min_interval_secs: default_cull_min_interval_secs(),
        }
    }
}

fn default_cull_min_rule_count() -> u64 {
    500_000
}

fn default_cull_retention_secs() -> u64 {
    // Six months.
    15_552_000
}

fn default_cull_min_interval_secs() -> u64 {
    3_600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.cull.min_rule_count, 500_000);
        assert_eq!(config.cull.retention_secs, 15_552_000);
        assert_eq!(config.cull.min_interval_secs, 3_600);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = EngineConfig::from_toml(
            r"
            [cull]
            min_rule_count = 1000
            ",
        )
        .expect("valid config");
        assert_eq!(config.cull.min_rule_count, 1000);
        assert_eq!(config.cull.retention_secs, 15_552_000);
    }

    #[test]
    fn test_empty_toml_is_all_defaults() {
        let config = EngineConfig::from_toml("").expect("valid config");
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_round_trip() {
        let config = EngineConfig::default();
        let toml = config.to_toml().expect("serializes");
        let parsed = EngineConfig::from_toml(&toml).expect("parses");
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(matches!(
            EngineConfig::from_toml("cull = \"nope\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
