//! Integration tests for snipbox
//!
//! These tests drive the real toolchain: nsjail, clang++ and, for the WASI
//! tests, wasmtime with a wasi-sdk sysroot. Tool paths come from the usual
//! configuration layers, so `SNIPBOX_POLICY__TOOLCHAIN__NSJAIL=...` and
//! friends point the tests at non-default installs.
//!
//! Run with: cargo test -p snipbox --features integration-tests

#![cfg(feature = "integration-tests")]

use std::fs;

use snipbox::{Backend, Config, ExecutionOptions, Runner};

mod config_loading;
mod lifecycle;
mod scenarios;
mod wasi;

const FIXTURES_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

/// Helper to get fixture file content
pub(crate) fn fixture_source(name: &str) -> String {
    let path = format!("{FIXTURES_PATH}/sources/{name}");
    fs::read_to_string(&path).unwrap_or_else(|e| panic!("Failed to read fixture {path}: {e}"))
}

/// Runner over the layered configuration (embedded defaults + environment)
pub(crate) fn test_runner() -> Runner {
    Runner::new(Config::load(None).expect("Failed to load configuration"))
}

/// Options for a fixture file, pinned to `backend`
pub(crate) fn fixture_options(runner: &Runner, name: &str, backend: Backend) -> ExecutionOptions {
    let is_cpp = name.ends_with(".cpp");
    let mut options = runner.options(fixture_source(name), is_cpp);
    options.policy.backend = Some(backend);
    options
}
