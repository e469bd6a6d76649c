//! AGH Exporter binary
//!
//! Command-line entry point: parses arguments, loads layered configuration,
//! installs logging and hands over to [`agh_exporter::run`].

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use agh_exporter::{
    init_logging, run, ConfigError, ExporterConfig, ExporterError, ExporterResult,
    EXPORTER_FULL_NAME, EXPORTER_NAME, EXPORTER_VERSION,
};

// ============================================================================
// SECTION 1: COMMAND LINE INTERFACE
// ============================================================================

/// AdGuard Home query log exporter
#[derive(Parser, Debug)]
#[command(
    name = EXPORTER_NAME,
    version,
    about = "Tails the AdGuard Home query log and exposes DNS metrics for Prometheus",
    long_about = "Reads querylog.json as AdGuard Home appends to it, classifies every \
                  query and serves rolling counters, top hosts and latency averages \
                  on /metrics, with /livez and /readyz probes alongside."
)]
struct Cli {
    /// Optional TOML configuration file
    #[arg(short, long, env = "AGH_EXPORTER_CONFIG")]
    config: Option<PathBuf>,

    /// Query log path override
    #[arg(short = 'f', long)]
    log_file_path: Option<PathBuf>,

    /// Log level override
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Subcommand to run (defaults to `run`)
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Tail the query log and serve metrics
    Run,

    /// Validate the effective configuration
    Validate {
        /// Show the full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate a default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

// ============================================================================
// SECTION 2: SUBCOMMAND HANDLERS
// ============================================================================

/// Load the layered configuration and apply command-line overrides on top.
fn load_config(cli: &Cli) -> Result<ExporterConfig, ConfigError> {
    let mut config = ExporterConfig::load(cli.config.as_deref())?;

    if let Some(path) = &cli.log_file_path {
        config.log_file_path = path.clone();
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.debug {
        config.logging.level = "debug".into();
    }

    config.validate()?;
    Ok(config)
}

fn handle_validate(cli: &Cli, verbose: bool) -> ExporterResult<()> {
    match &cli.config {
        Some(path) => println!("Validating configuration file: {}", path.display()),
        None => println!("Validating configuration from defaults and environment"),
    }

    match load_config(cli) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • Log file: {}", config.log_file_path.display());
            println!("  • Listen address: {}", config.listen_addr());
            println!("  • Latency window: {}s", config.window_seconds);
            println!("  • Top hosts: {}", config.top_k);
            match config.max_tracked_hosts {
                Some(limit) => println!("  • Tracked hosts cap: {}", limit),
                None => println!("  • Tracked hosts cap: unbounded"),
            }
            println!("  • Log level: {} ({})", config.logging.level, config.logging.format);

            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(ExporterError::Config(e))
        }
    }
}

fn handle_generate_config(output: Option<&Path>) -> ExporterResult<()> {
    let config_str = ExporterConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }

    Ok(())
}

fn handle_version() {
    println!("{} v{}", EXPORTER_FULL_NAME, EXPORTER_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Endpoints:");
    println!("  • /metrics  Prometheus text exposition");
    println!("  • /livez    200 while the log tailer is healthy, 503 otherwise");
    println!("  • /readyz   200 once the server is up");
}

// ============================================================================
// SECTION 3: MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli, *verbose)?;
            return Ok(());
        }
        Some(Commands::Run) | None => {}
    }

    let config = load_config(&cli).with_context(|| match &cli.config {
        Some(path) => format!("Failed to load config from {}", path.display()),
        None => "Failed to load config from environment".to_string(),
    })?;

    init_logging(&config.logging)?;

    info!("{} v{}", EXPORTER_FULL_NAME, EXPORTER_VERSION);
    info!(
        log_file = %config.log_file_path.display(),
        port = config.metrics_port,
        window_seconds = config.window_seconds,
        top_k = config.top_k,
        "Starting exporter"
    );

    if let Err(err) = run(config).await {
        error!(category = err.category(), error = %err, "Exporter stopped");
        return Err(err.into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_validate_applies_log_file_override() {
        let cli = Cli::parse_from(["agh-exporter", "--log-file-path", "/", "validate"]);
        assert!(matches!(cli.command, Some(Commands::Validate { .. })));

        let err = load_config(&cli).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "log_file_path"));
        assert!(handle_validate(&cli, false).is_err());
    }

    #[test]
    fn test_overrides_reach_effective_config() {
        let cli = Cli::parse_from(["agh-exporter", "-f", "/tmp/q.json", "-l", "warn", "-d", "validate"]);
        let config = load_config(&cli).unwrap();

        assert_eq!(config.log_file_path, PathBuf::from("/tmp/q.json"));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_log_level_override_without_debug() {
        let cli = Cli::parse_from(["agh-exporter", "--log-level", "warn"]);
        let config = load_config(&cli).unwrap();

        assert_eq!(config.logging.level, "warn");
        assert!(cli.command.is_none());
    }
}
