use std::path::PathBuf;

use snipbox::{Backend, Config, ConfigError};

use super::FIXTURES_PATH;

#[test]
fn test_load_valid_config() {
    let path = format!("{FIXTURES_PATH}/configs/valid_full.toml");
    let config = Config::from_file(&path).expect("Failed to load config");

    assert!(config.health_check);
    assert_eq!(config.policy.backend, Some(Backend::NsJail));
    assert_eq!(config.policy.run_timeout_ms, 2000);
    assert_eq!(config.policy.max_stdout_bytes, 4096);
    assert_eq!(config.policy.extra_compile_flags, vec!["-O1", "-Wall"]);
    assert_eq!(config.policy.allowed_include_patterns.len(), 2);
    assert_eq!(
        config.policy.toolchain.nsjail,
        PathBuf::from("/usr/local/bin/nsjail")
    );
}

#[test]
fn test_load_minimal_config() {
    let path = format!("{FIXTURES_PATH}/configs/valid_minimal.toml");
    let config = Config::from_file(&path).expect("Failed to load config");

    assert_eq!(config.policy.run_timeout_ms, 1000);
    assert!(config.policy.disable_network);
}

#[test]
fn test_load_invalid_zero_timeout() {
    let path = format!("{FIXTURES_PATH}/configs/invalid_zero_timeout.toml");
    let result = Config::from_file(&path);
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
}

#[test]
fn test_load_invalid_pattern() {
    let path = format!("{FIXTURES_PATH}/configs/invalid_pattern.toml");
    let result = Config::from_file(&path);
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
}

#[test]
fn test_load_invalid_backend() {
    let path = format!("{FIXTURES_PATH}/configs/invalid_backend.toml");
    let result = Config::from_file(&path);
    assert!(matches!(result, Err(ConfigError::Parse(_))));
}

#[test]
fn test_layered_load_with_file() {
    let path = PathBuf::from(format!("{FIXTURES_PATH}/configs/valid_minimal.toml"));
    let config = Config::load(Some(&path)).expect("Failed to load config");
    // Environment may override it, but the embedded defaults fill everything else
    assert!(!config.policy.denied_include_patterns.is_empty());
}

#[test]
fn test_example_config_is_valid() {
    let config = Config::parse_toml(snipbox::EXAMPLE_CONFIG).expect("Example config invalid");
    assert_eq!(config, Config::default());
}
