//! Configuration loading for snipbox
//!
//! Layers, lowest first: the embedded example config, an optional file, then
//! `SNIPBOX_`-prefixed environment variables with `__` between nested keys.

use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use tracing::debug;

use crate::config::{Config, ConfigError, ENV_PREFIX, EXAMPLE_CONFIG};
use crate::guard::IncludeGuard;

/// Keys whose environment values are comma-separated lists
const LIST_KEYS: [&str; 3] = [
    "policy.extra_compile_flags",
    "policy.allowed_include_patterns",
    "policy.denied_include_patterns",
];

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load the layered configuration
    ///
    /// `path`, when given, must exist. Environment variables such as
    /// `SNIPBOX_POLICY__RUN_TIMEOUT_MS=500` override both files.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, environment())
    }

    fn load_with_env(path: Option<&Path>, env: Environment) -> Result<Self, ConfigError> {
        let mut builder =
            ConfigBuilder::builder().add_source(File::from_str(EXAMPLE_CONFIG, FileFormat::Toml));

        if let Some(path) = path {
            if !path.is_file() {
                return Err(ConfigError::ReadFile {
                    path: path.to_path_buf(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "no such config file",
                    ),
                });
            }
            debug!(path = %path.display(), "adding config file layer");
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }

        let config: Config = builder.add_source(env).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.policy
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        IncludeGuard::new(&self.policy).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }
}

fn environment() -> Environment {
    let env = Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .list_separator(",")
        .try_parsing(true);
    LIST_KEYS
        .into_iter()
        .fold(env, |env, key| env.with_list_parse_key(key))
}
