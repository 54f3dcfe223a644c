use std::time::{Duration, Instant};

use snipbox::{Backend, FailureKind, NO_EXIT_CODE, Phase};

use super::{fixture_options, test_runner};

#[tokio::test]
async fn test_hello_world_runs() {
    let runner = test_runner();
    let options = fixture_options(&runner, "hello.c", Backend::NsJail);

    let result = runner.execute_once(&options).await.expect("Execution failed");

    assert_eq!(result.phase, Phase::Run);
    assert!(result.ok, "stderr: {}", result.stderr);
    assert_eq!(result.exit_code, 0);
    assert!(result.stdout.contains("OK"));
    assert!(!result.stdout_truncated);
    assert_eq!(result.failure, None);
}

#[tokio::test]
async fn test_hello_world_cpp_runs() {
    let runner = test_runner();
    let options = fixture_options(&runner, "hello.cpp", Backend::NsJail);

    let result = runner.execute_once(&options).await.expect("Execution failed");

    assert!(result.ok, "stderr: {}", result.stderr);
    assert_eq!(result.stdout, "Hello, World!\n");
}

#[tokio::test]
async fn test_compile_error() {
    let runner = test_runner();
    let options = fixture_options(&runner, "compile_error.c", Backend::NsJail);

    let result = runner.execute_once(&options).await.expect("Execution failed");

    assert_eq!(result.phase, Phase::Compile);
    assert!(!result.ok);
    assert_ne!(result.exit_code, 0);
    assert_eq!(result.failure, Some(FailureKind::CompileError));
    assert!(result.stderr.contains("error"));
    assert_eq!(result.run_time, Duration::ZERO);
}

#[tokio::test]
async fn test_infinite_loop_times_out() {
    let runner = test_runner();
    let mut options = fixture_options(&runner, "infinite_loop.c", Backend::NsJail);
    options.policy.run_timeout_ms = 500;
    options.policy.hard_kill_grace_ms = 200;

    let started = Instant::now();
    let result = runner.execute_once(&options).await.expect("Execution failed");
    let elapsed = started.elapsed();

    assert_eq!(result.phase, Phase::Run);
    assert!(!result.ok);
    assert!(result.timed_out());
    assert_eq!(result.failure, Some(FailureKind::RunTimeout));
    assert!(result.run_time >= Duration::from_millis(500));
    // Compile time plus watchdog plus grace, with generous slack for slow hosts
    assert!(
        elapsed < result.compile_time + Duration::from_secs(3),
        "took {elapsed:?}"
    );
}

#[tokio::test]
async fn test_etc_passwd_is_not_visible() {
    let runner = test_runner();
    let options = fixture_options(&runner, "read_passwd.c", Backend::NsJail);

    let result = runner.execute_once(&options).await.expect("Execution failed");

    assert_eq!(result.phase, Phase::Run);
    assert_eq!(result.stdout, "DENIED\n");
    assert_eq!(result.exit_code, 3);
    assert_eq!(result.failure, Some(FailureKind::RuntimeFault));
}

#[tokio::test]
async fn test_stdout_truncated_at_cap() {
    let runner = test_runner();
    let mut options = fixture_options(&runner, "print_1000.c", Backend::NsJail);
    options.policy.max_stdout_bytes = 64;

    let result = runner.execute_once(&options).await.expect("Execution failed");

    assert!(result.ok, "stderr: {}", result.stderr);
    assert!(result.stdout_truncated);
    assert!(result.stdout.len() <= 64);
    assert!(result.stdout.chars().all(|c| c == 'x'));
}

#[tokio::test]
async fn test_denied_include_never_compiles() {
    let runner = test_runner();
    let options = fixture_options(&runner, "socket.c", Backend::NsJail);

    let result = runner.execute_once(&options).await.expect("Execution failed");

    assert_eq!(result.phase, Phase::Compile);
    assert!(!result.ok);
    assert_eq!(result.exit_code, NO_EXIT_CODE);
    assert_eq!(result.failure, Some(FailureKind::GuardViolation));
    assert!(result.stderr.contains("sys/socket.h"));
    assert_eq!(result.compile_time, Duration::ZERO);
}

#[tokio::test]
async fn test_exit_code_and_stderr() {
    let runner = test_runner();
    let options = fixture_options(&runner, "exit_42.c", Backend::NsJail);

    let result = runner.execute_once(&options).await.expect("Execution failed");

    assert_eq!(result.phase, Phase::Run);
    assert!(!result.ok);
    assert_eq!(result.exit_code, 42);
    assert_eq!(result.stderr, "bye\n");
}

#[tokio::test]
async fn test_segfault_maps_to_signal_code() {
    let runner = test_runner();
    let options = fixture_options(&runner, "segfault.c", Backend::NsJail);

    let result = runner.execute_once(&options).await.expect("Execution failed");

    assert_eq!(result.phase, Phase::Run);
    assert!(!result.ok);
    assert_eq!(result.exit_code, 139);
    assert_eq!(result.failure, Some(FailureKind::RuntimeFault));
}

#[tokio::test]
async fn test_output_flood_aborts_when_enabled() {
    let runner = test_runner();
    let mut options = fixture_options(&runner, "flood_stdout.c", Backend::NsJail);
    options.policy.max_stdout_bytes = 1024;
    options.policy.abort_on_output_overflow = true;
    options.policy.run_timeout_ms = 10_000;

    let started = Instant::now();
    let result = runner.execute_once(&options).await.expect("Execution failed");

    assert!(!result.ok);
    assert_eq!(result.failure, Some(FailureKind::OutputOverflow));
    assert!(result.stdout_truncated);
    assert!(result.stdout.len() <= 1024);
    assert!(started.elapsed() < Duration::from_secs(8));
}

#[tokio::test]
async fn test_output_flood_truncates_until_timeout() {
    let runner = test_runner();
    let mut options = fixture_options(&runner, "flood_stdout.c", Backend::NsJail);
    options.policy.max_stdout_bytes = 1024;
    options.policy.run_timeout_ms = 500;

    let result = runner.execute_once(&options).await.expect("Execution failed");

    assert_eq!(result.failure, Some(FailureKind::RunTimeout));
    assert!(result.stdout_truncated);
    assert!(result.stdout.len() <= 1024);
}

#[tokio::test]
async fn test_relative_paths_resolve_in_work_dir() {
    let runner = test_runner();
    let options = fixture_options(&runner, "relative_file.c", Backend::NsJail);

    let result = runner.execute_once(&options).await.expect("Execution failed");

    assert!(result.ok, "stdout: {} stderr: {}", result.stdout, result.stderr);
    assert_eq!(result.stdout, "round trip\n");
}
