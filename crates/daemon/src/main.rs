//! sockpool — connection-pool daemon and its management CLI.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

use sockpool_config::Config;
use sockpool_daemon::cli;

/// Connection-pooling daemon for high-rate short TCP frames
#[derive(Parser, Debug)]
#[command(name = "sockpool")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon
    Start {
        /// Detach and run in the background
        #[arg(long)]
        daemon: bool,
        /// PID file path
        #[arg(long, value_name = "PATH")]
        pid_file: Option<PathBuf>,
    },
    /// Stop a running daemon
    Stop {
        /// PID file path
        #[arg(long, value_name = "PATH")]
        pid_file: Option<PathBuf>,
        /// Escalate to SIGKILL if the daemon does not exit in time
        #[arg(long)]
        force: bool,
        /// Seconds to wait for the daemon to exit
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
    /// Stop then start the daemon
    Restart {
        /// PID file path
        #[arg(long, value_name = "PATH")]
        pid_file: Option<PathBuf>,
        /// Detach the new instance
        #[arg(long)]
        daemon: bool,
    },
    /// Show daemon status
    Status {
        /// Include stats and metrics
        #[arg(long)]
        detailed: bool,
    },
    /// Show per-endpoint statistics
    Stats {
        /// Refresh every N seconds
        #[arg(long, value_name = "SECONDS")]
        watch: Option<u64>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    /// Run a health check against the daemon
    Health {
        /// Include the individual checks
        #[arg(long)]
        detailed: bool,
    },
    /// Inspect and manage pooled connections
    Pool {
        #[command(subcommand)]
        command: PoolCommands,
    },
    /// Send test frames through the daemon
    Test {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 5027)]
        port: u16,
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Show or validate configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Continuously print pool metrics
    Monitor {
        /// Seconds between samples
        #[arg(long, default_value_t = 5)]
        interval: u64,
    },
}

#[derive(Subcommand, Debug)]
enum PoolCommands {
    /// List pooled endpoints
    List,
    /// Close the pooled connection to an endpoint (host:port), or all
    Close {
        target: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Pre-establish connections by sending a TEST probe
    WarmUp { targets: Vec<String> },
    /// Close every pooled connection
    Drain,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Print one configuration value (dot path, e.g. daemon.max_pool_size)
    Get { key: String },
    /// Set a configuration value (unsupported: configuration is environment-driven)
    Set { key: String, value: String },
    /// Validate the environment-derived configuration
    Validate,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OutputFormat {
    Table,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let config = Config::from_env();

    match args.command {
        Commands::Start { daemon, pid_file } => cli::start(config, daemon, pid_file).await,
        Commands::Stop {
            pid_file,
            force,
            timeout,
        } => cli::stop(&config, pid_file, force, timeout).await,
        Commands::Restart { pid_file, daemon } => {
            cli::restart(config, pid_file, daemon).await
        }
        Commands::Status { detailed } => cli::status(&config, detailed).await,
        Commands::Stats { watch, format } => {
            cli::stats(&config, watch, matches!(format, OutputFormat::Json)).await
        }
        Commands::Health { detailed } => cli::health(&config, detailed).await,
        Commands::Pool { command } => match command {
            PoolCommands::List => cli::pool_list(&config).await,
            PoolCommands::Close { target, all } => cli::pool_close(&config, target, all).await,
            PoolCommands::WarmUp { targets } => cli::pool_warm_up(&config, targets).await,
            PoolCommands::Drain => cli::pool_close(&config, None, true).await,
        },
        Commands::Test { host, port, count } => cli::test(&config, &host, port, count).await,
        Commands::Config { command } => match command {
            ConfigCommands::Show => cli::config_show(&config).await,
            ConfigCommands::Get { key } => cli::config_get(&config, &key).await,
            ConfigCommands::Set { key, value } => cli::config_set(&key, &value),
            ConfigCommands::Validate => cli::config_validate(&config),
        },
        Commands::Monitor { interval } => cli::monitor(&config, interval).await,
    }
}
