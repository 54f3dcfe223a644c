use std::time::{Duration, Instant};

use snipbox::{Backend, FailureKind, Phase};

use super::{fixture_options, test_runner};

#[tokio::test]
async fn test_wasi_hello_world() {
    let runner = test_runner();
    let options = fixture_options(&runner, "hello.c", Backend::Wasi);

    let result = runner.execute_once(&options).await.expect("Execution failed");

    assert_eq!(result.phase, Phase::Run);
    assert!(result.ok, "stderr: {}", result.stderr);
    assert!(result.stdout.contains("OK"));
}

#[tokio::test]
async fn test_wasi_compile_error() {
    let runner = test_runner();
    let options = fixture_options(&runner, "compile_error.c", Backend::Wasi);

    let result = runner.execute_once(&options).await.expect("Execution failed");

    assert_eq!(result.phase, Phase::Compile);
    assert_eq!(result.failure, Some(FailureKind::CompileError));
}

#[tokio::test]
async fn test_wasi_infinite_loop_times_out() {
    let runner = test_runner();
    let mut options = fixture_options(&runner, "infinite_loop.c", Backend::Wasi);
    options.policy.run_timeout_ms = 500;
    options.policy.hard_kill_grace_ms = 200;

    let started = Instant::now();
    let result = runner.execute_once(&options).await.expect("Execution failed");

    assert!(!result.ok);
    assert_eq!(result.failure, Some(FailureKind::RunTimeout));
    assert!(started.elapsed() < result.compile_time + Duration::from_secs(3));
}

#[tokio::test]
async fn test_wasi_has_no_etc_passwd() {
    let runner = test_runner();
    let options = fixture_options(&runner, "read_passwd.c", Backend::Wasi);

    let result = runner.execute_once(&options).await.expect("Execution failed");

    assert_eq!(result.stdout, "DENIED\n");
    assert_eq!(result.exit_code, 3);
}

#[tokio::test]
async fn test_wasi_stdout_truncated() {
    let runner = test_runner();
    let mut options = fixture_options(&runner, "print_1000.c", Backend::Wasi);
    options.policy.max_stdout_bytes = 64;

    let result = runner.execute_once(&options).await.expect("Execution failed");

    assert!(result.stdout_truncated);
    assert!(result.stdout.len() <= 64);
}

#[tokio::test]
async fn test_wasi_stdin_is_delivered() {
    let runner = test_runner();
    let options = fixture_options(&runner, "echo_stdin.cpp", Backend::Wasi).with_stdin("40\n2\n");

    let result = runner.execute_once(&options).await.expect("Execution failed");

    assert!(result.ok, "stderr: {}", result.stderr);
    assert_eq!(result.stdout, "42\n");
}

#[tokio::test]
async fn test_wasi_relative_paths_resolve_in_work_dir() {
    let runner = test_runner();
    let options = fixture_options(&runner, "relative_file.c", Backend::Wasi);

    let result = runner.execute_once(&options).await.expect("Execution failed");

    assert!(result.ok, "stdout: {} stderr: {}", result.stdout, result.stderr);
    assert_eq!(result.stdout, "round trip\n");
}
