use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use cltiming::combine;
use cltiming::Config;

/// Command timing pipeline utilities.
#[derive(Parser)]
#[command(name = "cltiming", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,

    /// Load and validate the configuration, then print the resolved settings.
    Validate,

    /// Merge Chrome traces from several processes onto a common timeline.
    Combine {
        /// Trace files to merge (at least two).
        #[arg(required = true, num_args = 2..)]
        traces: Vec<PathBuf>,

        /// Keep only events whose name contains one of these strings.
        #[arg(short, long)]
        filter: Vec<String>,

        /// Output file.
        #[arg(short, long, default_value = "merged_trace.json")]
        output: PathBuf,
    },
}

/// Build-time version info, injected via env at build time.
mod version {
    /// Release version string.
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Command::Version = cli.command {
        println!("cltiming {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Version => Ok(()),
        Command::Validate => validate(cli.config),
        Command::Combine {
            traces,
            filter,
            output,
        } => {
            let count = combine::combine_files(&traces, &filter, &output)
                .context("combining traces")?;
            println!("wrote {count} events to {}", output.display());
            Ok(())
        }
    }
}

fn validate(config: Option<PathBuf>) -> Result<()> {
    let config_path = config.context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    tracing::info!(path = %config_path.display(), "configuration is valid");

    println!("timing.drift_threshold: {:?}", cfg.timing.drift_threshold);
    println!(
        "timing.device_timeline_logging: {}",
        cfg.timing.device_timeline_logging
    );
    println!("timing.host_report: {}", cfg.timing.host_report);
    println!("timing.device_report: {}", cfg.timing.device_report);
    println!("chrome_trace.enabled: {}", cfg.chrome_trace.enabled);
    if cfg.chrome_trace.enabled {
        println!("chrome_trace.file: {}", cfg.chrome_trace.file.display());
        println!("chrome_trace.per_kernel: {}", cfg.chrome_trace.per_kernel);
        println!("chrome_trace.in_stages: {}", cfg.chrome_trace.in_stages);
    }
    println!("instrumentation.enabled: {}", cfg.instrumentation.enabled);
    if cfg.instrumentation.enabled {
        println!("instrumentation.domain: {}", cfg.instrumentation.domain);
    }
    println!("report.to_stderr: {}", cfg.report.to_stderr);
    if let Some(file) = &cfg.report.file {
        println!("report.file: {}", file.display());
    }

    Ok(())
}
