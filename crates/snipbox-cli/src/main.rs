//! Snipbox CLI
//!
//! A command-line tool for compiling and running C/C++ snippets in a sandbox.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use snipbox::{
    Backend, Config, EXAMPLE_CONFIG, ExecutionOptions, ExecutionResult, NO_EXIT_CODE,
    PolicyOverrides, Runner,
};
use tracing::{Level, debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "snipbox")]
#[command(about = "Compile and run C/C++ snippets in a sandbox")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path (default: snipbox.toml)
        #[arg(short, long, default_value = "snipbox.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Compile and run a source file
    Run(RunArgs),

    /// Compile and run a trivial program to verify the toolchain
    Check,

    /// Print the effective configuration as JSON
    ShowConfig,
}

#[derive(Args)]
struct RunArgs {
    /// Source file to run
    #[arg(value_name = "FILE")]
    source: PathBuf,

    /// Treat the source as C (default: inferred from the extension)
    #[arg(long, conflicts_with = "cpp")]
    c: bool,

    /// Treat the source as C++ (default: inferred from the extension)
    #[arg(long)]
    cpp: bool,

    /// File fed to the program's standard input
    #[arg(short, long)]
    stdin: Option<PathBuf>,

    /// Backend to run under (nsjail or wasi; default: detect)
    #[arg(short, long, value_parser = parse_backend)]
    backend: Option<Backend>,

    /// Compile timeout in milliseconds
    #[arg(long)]
    compile_timeout_ms: Option<u64>,

    /// Run timeout in milliseconds
    #[arg(short = 't', long)]
    run_timeout_ms: Option<u64>,

    /// Captured stdout cap in bytes
    #[arg(long)]
    max_stdout_bytes: Option<usize>,

    /// Captured stderr cap in bytes
    #[arg(long)]
    max_stderr_bytes: Option<usize>,

    /// Stop the program as soon as an output cap is exceeded
    #[arg(long)]
    abort_on_overflow: bool,

    /// Print the full result as JSON instead of the program's output
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn overrides(&self) -> PolicyOverrides {
        PolicyOverrides {
            backend: self.backend,
            compile_timeout_ms: self.compile_timeout_ms,
            run_timeout_ms: self.run_timeout_ms,
            max_stdout_bytes: self.max_stdout_bytes,
            max_stderr_bytes: self.max_stderr_bytes,
            abort_on_output_overflow: self.abort_on_overflow.then_some(true),
            ..Default::default()
        }
    }

    fn is_cpp(&self) -> bool {
        if self.c {
            return false;
        }
        self.cpp || is_cpp_extension(&self.source)
    }
}

fn parse_backend(name: &str) -> Result<Backend, String> {
    Backend::from_name(name)
        .ok_or_else(|| format!("unknown backend '{name}' (expected nsjail or wasi)"))
}

fn is_cpp_extension(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("cpp" | "cc" | "cxx" | "c++" | "hpp")
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    // Program output goes to stdout, logs never do
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init { output, force } => init_config(&output, force).await,
        Commands::Run(args) => run_execute(&load_runner(cli.config.as_deref())?, &args).await,
        Commands::Check => run_check(&load_runner(cli.config.as_deref())?).await,
        Commands::ShowConfig => show_config(load_runner(cli.config.as_deref())?.config()),
    }
}

fn load_runner(path: Option<&Path>) -> Result<Runner> {
    if let Some(path) = path {
        info!(?path, "loading configuration");
    } else {
        debug!("using embedded configuration with environment overrides");
    }
    let config = Config::load(path).context("failed to load configuration")?;
    Ok(Runner::new(config))
}

async fn run_execute(runner: &Runner, args: &RunArgs) -> Result<()> {
    if runner.config().health_check {
        let health = runner
            .health_check()
            .await
            .context("health check failed")?;
        if !health.ok {
            anyhow::bail!("health check failed: {}", health.stderr.trim_end());
        }
    }

    let code = tokio::fs::read_to_string(&args.source)
        .await
        .with_context(|| format!("failed to read source file '{}'", args.source.display()))?;

    let stdin = match &args.stdin {
        Some(path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read input file '{}'", path.display()))?,
        ),
        None => None,
    };

    let overrides = args.overrides();
    let policy = runner.config().effective_policy(&overrides);
    let mut options = if args.is_cpp() {
        ExecutionOptions::cpp(code)
    } else {
        ExecutionOptions::c(code)
    }
    .with_policy(policy);
    options.stdin = stdin;

    info!(
        source = %args.source.display(),
        cpp = options.is_cpp,
        overridden = !overrides.is_empty(),
        "running snippet"
    );
    let result = runner
        .execute_once(&options)
        .await
        .context("execution failed")?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&result).context("failed to serialize result")?
        );
    } else {
        print_result(&result);
    }

    if result.ok {
        Ok(())
    } else {
        std::io::stdout().flush().context("failed to flush stdout")?;
        std::process::exit(process_exit_code(&result));
    }
}

fn print_result(result: &ExecutionResult) {
    print!("{}", result.stdout);
    if !result.stderr.is_empty() {
        eprint!("{}", result.stderr);
    }

    // Log execution info via tracing (stderr), keeping stdout clean for piping
    info!(
        phase = ?result.phase,
        failure = ?result.failure,
        exit_code = result.exit_code,
        compile_time = format_args!("{:.3}s", result.compile_time.as_secs_f64()),
        run_time = format_args!("{:.3}s", result.run_time.as_secs_f64()),
        "execution result"
    );
    if result.stdout_truncated {
        warn!("stdout was truncated");
    }
    if result.stderr_truncated {
        warn!("stderr was truncated");
    }
}

fn process_exit_code(result: &ExecutionResult) -> i32 {
    match result.exit_code {
        0 | NO_EXIT_CODE => 1,
        code => code,
    }
}

async fn run_check(runner: &Runner) -> Result<()> {
    let result = runner
        .health_check()
        .await
        .context("health check failed")?;

    if result.ok {
        println!("Toolchain OK");
        Ok(())
    } else {
        eprintln!("Toolchain check failed ({:?} phase)", result.phase);
        if !result.stderr.is_empty() {
            eprintln!("{}", result.stderr.trim_end());
        }
        std::process::exit(1);
    }
}

fn show_config(config: &Config) -> Result<()> {
    let json = serde_json::to_string_pretty(config).context("failed to serialize configuration")?;
    println!("{json}");
    Ok(())
}

async fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}
