use clap::{Parser, Subcommand};

use std::path::PathBuf;

use super::config::DatabaseBackend;
use super::constants::{
    ENV_BATCH_THRESHOLD, ENV_CONFIG, ENV_DATABASE_BACKEND, ENV_DEBUG, ENV_FLUSH_INTERVAL_MS,
    ENV_GRPC_ENABLED, ENV_GRPC_PORT, ENV_HOST, ENV_PORT, ENV_POSTGRES_URL, ENV_RETRY_BUDGET,
};

#[derive(Parser)]
#[command(name = "traceport")]
#[command(version, about = "LLM observability trace collector", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Server host address
    #[arg(long, short = 'H', global = true, env = ENV_HOST)]
    pub host: Option<String>,

    /// Server port
    #[arg(long, short = 'p', global = true, env = ENV_PORT)]
    pub port: Option<u16>,

    /// Enable debug logging of accepted telemetry batches
    #[arg(long, global = true, env = ENV_DEBUG)]
    pub debug: bool,

    /// Path to config file
    #[arg(long, short = 'c', global = true, env = ENV_CONFIG)]
    pub config: Option<PathBuf>,

    /// Enable OTLP gRPC endpoint
    #[arg(long, global = true, env = ENV_GRPC_ENABLED)]
    pub grpc: Option<bool>,

    /// OTLP gRPC port
    #[arg(long, global = true, env = ENV_GRPC_PORT)]
    pub grpc_port: Option<u16>,

    /// Insertion-engine flush interval in milliseconds
    #[arg(long, global = true, env = ENV_FLUSH_INTERVAL_MS)]
    pub flush_interval_ms: Option<u64>,

    /// How many flush cycles an unresolved item is retried before discard
    #[arg(long, global = true, env = ENV_RETRY_BUDGET)]
    pub retry_budget: Option<u32>,

    /// Buffered item count that triggers an immediate flush
    #[arg(long, global = true, env = ENV_BATCH_THRESHOLD)]
    pub batch_threshold: Option<usize>,

    /// Database backend (sqlite or postgres)
    #[arg(long, global = true, env = ENV_DATABASE_BACKEND, value_parser = parse_database_backend)]
    pub database_backend: Option<DatabaseBackend>,

    /// PostgreSQL connection URL (when using postgres backend)
    #[arg(long, global = true, env = ENV_POSTGRES_URL)]
    pub postgres_url: Option<String>,
}

/// Parse database backend from CLI/env string
fn parse_database_backend(s: &str) -> Result<DatabaseBackend, String> {
    match s.to_lowercase().as_str() {
        "sqlite" => Ok(DatabaseBackend::Sqlite),
        "postgres" | "postgresql" => Ok(DatabaseBackend::Postgres),
        _ => Err(format!(
            "Invalid database backend '{}'. Valid options: sqlite, postgres",
            s
        )),
    }
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Start the server (default command)
    Start,
    /// System maintenance commands
    System {
        #[command(subcommand)]
        command: SystemCommands,
    },
}

#[derive(Subcommand, Clone, Debug)]
pub enum SystemCommands {
    /// Delete local data directory (databases). Requires confirmation.
    Prune {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

/// Configuration derived from CLI arguments
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub debug: bool,
    pub config: Option<PathBuf>,
    pub grpc: Option<bool>,
    pub grpc_port: Option<u16>,
    pub flush_interval_ms: Option<u64>,
    pub retry_budget: Option<u32>,
    pub batch_threshold: Option<usize>,
    pub database_backend: Option<DatabaseBackend>,
    pub postgres_url: Option<String>,
}

/// Parse CLI arguments and return config with command
pub fn parse() -> (CliConfig, Option<Commands>) {
    let cli = Cli::parse();
    let config = CliConfig {
        host: cli.host,
        port: cli.port,
        debug: cli.debug,
        config: cli.config,
        grpc: cli.grpc,
        grpc_port: cli.grpc_port,
        flush_interval_ms: cli.flush_interval_ms,
        retry_budget: cli.retry_budget,
        batch_threshold: cli.batch_threshold,
        database_backend: cli.database_backend,
        postgres_url: cli.postgres_url,
    };
    (config, cli.command)
}
