use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::{ExecutionPolicy, PolicyOverrides};

mod loader;

/// Example configuration embedded at compile time.
///
/// Doubles as the lowest configuration layer. Library users can access this to
/// generate a starter config file.
pub const EXAMPLE_CONFIG: &str = include_str!("../../snipbox.example.toml");

/// Prefix of environment variables read by [`Config::load`]
pub const ENV_PREFIX: &str = "SNIPBOX";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Config for snipbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Default policy; each invocation runs under a snapshot of it
    #[serde(default)]
    pub policy: ExecutionPolicy,

    /// Run [`Runner::health_check`](crate::Runner::health_check) before
    /// executing anything
    #[serde(default)]
    pub health_check: bool,
}

impl Config {
    /// Create a new config from the embedded defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Default policy with per-invocation overrides applied
    pub fn effective_policy(&self, overrides: &PolicyOverrides) -> ExecutionPolicy {
        self.policy.with_overrides(overrides)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_toml(EXAMPLE_CONFIG).expect("embedded default config should be valid")
    }
}
