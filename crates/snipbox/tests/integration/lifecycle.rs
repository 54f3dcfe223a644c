use std::time::Duration;

use snipbox::workspace::WORKSPACE_PREFIX;
use snipbox::{Backend, Phase};

use super::{fixture_options, test_runner};

/// Entries under `root` that look like snipbox workspaces
fn workspaces_in(root: &std::path::Path) -> usize {
    std::fs::read_dir(root)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|e| e.file_name().to_string_lossy().starts_with(WORKSPACE_PREFIX))
                .count()
        })
        .unwrap_or(0)
}

#[tokio::test]
async fn test_identical_runs_are_idempotent() {
    let runner = test_runner();
    let options = fixture_options(&runner, "exit_42.c", Backend::NsJail);

    let first = runner.execute_once(&options).await.expect("Execution failed");
    let second = runner.execute_once(&options).await.expect("Execution failed");

    assert_eq!(first.phase, second.phase);
    assert_eq!(first.ok, second.ok);
    assert_eq!(first.exit_code, second.exit_code);
    assert_eq!(first.stdout, second.stdout);
}

#[tokio::test]
async fn test_stdin_is_delivered() {
    let runner = test_runner();
    let options =
        fixture_options(&runner, "echo_stdin.cpp", Backend::NsJail).with_stdin("1\n2\n39\n");

    let result = runner.execute_once(&options).await.expect("Execution failed");

    assert!(result.ok, "stderr: {}", result.stderr);
    assert_eq!(result.stdout, "42\n");
}

#[tokio::test]
async fn test_no_stdin_reads_eof() {
    let runner = test_runner();
    let options = fixture_options(&runner, "echo_stdin.cpp", Backend::NsJail);

    let result = runner.execute_once(&options).await.expect("Execution failed");

    assert!(result.ok, "stderr: {}", result.stderr);
    assert_eq!(result.stdout, "0\n");
}

#[tokio::test]
async fn test_symlink_does_not_escape_workspace() {
    let runner = test_runner();
    let options = fixture_options(&runner, "symlink_escape.c", Backend::NsJail);

    let result = runner.execute_once(&options).await.expect("Execution failed");

    assert_eq!(result.phase, Phase::Run);
    assert_eq!(result.stdout, "DENIED\n");
    assert_eq!(result.exit_code, 3);
}

#[tokio::test]
async fn test_workspace_removed_after_each_run() {
    let root = tempfile::TempDir::new().unwrap();
    let runner = test_runner();

    for name in ["hello.c", "compile_error.c", "infinite_loop.c"] {
        let mut options = fixture_options(&runner, name, Backend::NsJail);
        options.policy.toolchain.work_root = root.path().to_path_buf();
        options.policy.run_timeout_ms = 300;

        runner.execute_once(&options).await.expect("Execution failed");
        assert_eq!(workspaces_in(root.path()), 0, "{name} left a workspace behind");
    }
}

#[tokio::test]
async fn test_cancelled_run_cleans_up() {
    let root = tempfile::TempDir::new().unwrap();
    let runner = test_runner();
    let mut options = fixture_options(&runner, "infinite_loop.c", Backend::NsJail);
    options.policy.toolchain.work_root = root.path().to_path_buf();
    options.policy.run_timeout_ms = 30_000;

    // Drop the invocation mid-run
    let cancelled =
        tokio::time::timeout(Duration::from_secs(3), runner.execute_once(&options)).await;
    assert!(cancelled.is_err());

    assert_eq!(workspaces_in(root.path()), 0);
}

#[tokio::test]
async fn test_concurrent_runs_are_isolated() {
    let runner = test_runner();
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let runner = runner.clone();
            let options = fixture_options(&runner, "echo_stdin.cpp", Backend::NsJail)
                .with_stdin(format!("{i}\n"));
            tokio::spawn(async move { runner.execute_once(&options).await })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let result = handle.await.unwrap().expect("Execution failed");
        assert!(result.ok, "stderr: {}", result.stderr);
        assert_eq!(result.stdout, format!("{i}\n"));
    }
}

#[tokio::test]
async fn test_health_check_passes() {
    let runner = test_runner();
    let result = runner.health_check().await.expect("Health check failed");
    assert!(result.ok, "stderr: {}", result.stderr);
}
