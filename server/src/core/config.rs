//! Application configuration
//!
//! Configuration is layered, later layers taking precedence:
//! 1. Built-in defaults
//! 2. JSON config file (`traceport.json` in the data dir, or `--config`)
//! 3. Environment variables / CLI flags (clap resolves both)

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use super::cli::CliConfig;
use super::constants::{
    CONFIG_FILE_NAME, DEFAULT_BATCH_THRESHOLD, DEFAULT_FLUSH_INTERVAL_MS, DEFAULT_GRPC_PORT,
    DEFAULT_HOST, DEFAULT_PORT, DEFAULT_RETRY_BUDGET, POSTGRES_DEFAULT_ACQUIRE_TIMEOUT_SECS,
    POSTGRES_DEFAULT_MAX_CONNECTIONS, POSTGRES_DEFAULT_MIN_CONNECTIONS,
    POSTGRES_DEFAULT_STATEMENT_TIMEOUT_SECS,
};
use super::storage::AppStorage;

// =============================================================================
// File configuration (all fields optional, merged over defaults)
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GrpcFileConfig {
    pub enabled: Option<bool>,
    pub port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
pub struct IngestFileConfig {
    pub grpc: Option<GrpcFileConfig>,
    pub flush_interval_ms: Option<u64>,
    pub retry_budget: Option<u32>,
    pub batch_threshold: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PostgresFileConfig {
    pub url: Option<String>,
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
    pub acquire_timeout_secs: Option<u64>,
    pub statement_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DatabaseFileConfig {
    pub backend: Option<String>,
    pub postgres: Option<PostgresFileConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub server: Option<ServerFileConfig>,
    pub ingest: Option<IngestFileConfig>,
    pub database: Option<DatabaseFileConfig>,
    pub debug: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Value,
}

impl FileConfig {
    /// Load configuration from a JSON file
    fn load_from_file(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "Loading config file");
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Warn about unknown fields in the config
    fn warn_unknown_fields(&self) {
        if let serde_json::Value::Object(map) = &self.extra
            && !map.is_empty()
        {
            let keys_str: String = map
                .keys()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            tracing::warn!(
                fields = %keys_str,
                "Unknown fields in config file (possible typos)"
            );
        }
    }
}

// =============================================================================
// Runtime configuration
// =============================================================================

/// Database backend identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DatabaseBackend {
    #[default]
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub grpc_enabled: bool,
    pub grpc_port: u16,
    pub flush_interval: Duration,
    pub retry_budget: u32,
    pub batch_threshold: usize,
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub statement_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub postgres: Option<PostgresConfig>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub ingest: IngestConfig,
    pub database: DatabaseConfig,
    pub debug: bool,
}

impl AppConfig {
    /// Resolve the final configuration from defaults, config file, and CLI/env
    pub fn load(cli: &CliConfig) -> Result<Self> {
        let file = Self::load_file_config(cli)?;
        file.warn_unknown_fields();

        let server_file = file.server.unwrap_or_default();
        let ingest_file = file.ingest.unwrap_or_default();
        let grpc_file = ingest_file.grpc.unwrap_or_default();
        let database_file = file.database.unwrap_or_default();
        let postgres_file = database_file.postgres.unwrap_or_default();

        let server = ServerConfig {
            host: cli
                .host
                .clone()
                .or(server_file.host)
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: cli.port.or(server_file.port).unwrap_or(DEFAULT_PORT),
        };

        let ingest = IngestConfig {
            grpc_enabled: cli.grpc.or(grpc_file.enabled).unwrap_or(true),
            grpc_port: cli.grpc_port.or(grpc_file.port).unwrap_or(DEFAULT_GRPC_PORT),
            flush_interval: Duration::from_millis(
                cli.flush_interval_ms
                    .or(ingest_file.flush_interval_ms)
                    .unwrap_or(DEFAULT_FLUSH_INTERVAL_MS),
            ),
            retry_budget: cli
                .retry_budget
                .or(ingest_file.retry_budget)
                .unwrap_or(DEFAULT_RETRY_BUDGET),
            batch_threshold: cli
                .batch_threshold
                .or(ingest_file.batch_threshold)
                .unwrap_or(DEFAULT_BATCH_THRESHOLD),
        };

        let backend = match cli.database_backend {
            Some(b) => b,
            None => match database_file.backend.as_deref() {
                Some("postgres") | Some("postgresql") => DatabaseBackend::Postgres,
                Some("sqlite") | None => DatabaseBackend::Sqlite,
                Some(other) => {
                    anyhow::bail!("Invalid database backend in config file: {}", other)
                }
            },
        };

        let postgres_url = cli.postgres_url.clone().or(postgres_file.url);
        let postgres = postgres_url.map(|url| PostgresConfig {
            url,
            max_connections: postgres_file
                .max_connections
                .unwrap_or(POSTGRES_DEFAULT_MAX_CONNECTIONS),
            min_connections: postgres_file
                .min_connections
                .unwrap_or(POSTGRES_DEFAULT_MIN_CONNECTIONS),
            acquire_timeout_secs: postgres_file
                .acquire_timeout_secs
                .unwrap_or(POSTGRES_DEFAULT_ACQUIRE_TIMEOUT_SECS),
            statement_timeout_secs: postgres_file
                .statement_timeout_secs
                .unwrap_or(POSTGRES_DEFAULT_STATEMENT_TIMEOUT_SECS),
        });

        if backend == DatabaseBackend::Postgres && postgres.is_none() {
            anyhow::bail!(
                "postgres backend selected but no connection URL configured \
                 (set TRACEPORT_POSTGRES_URL or database.postgres.url)"
            );
        }

        let config = Self {
            server,
            ingest,
            database: DatabaseConfig { backend, postgres },
            debug: cli.debug || file.debug.unwrap_or(false),
        };

        tracing::debug!(config = ?config, "Configuration resolved");
        Ok(config)
    }

    /// Load the file layer: explicit `--config` path wins, otherwise the
    /// well-known file in the data directory (if present)
    fn load_file_config(cli: &CliConfig) -> Result<FileConfig> {
        if let Some(path) = &cli.config {
            return FileConfig::load_from_file(path);
        }

        let default_path = AppStorage::resolve_data_dir().join(CONFIG_FILE_NAME);
        if default_path.exists() {
            return FileConfig::load_from_file(&default_path);
        }

        Ok(FileConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file_or_cli() {
        let config = AppConfig::load(&CliConfig::default()).unwrap();
        assert_eq!(config.server.host, DEFAULT_HOST);
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.database.backend, DatabaseBackend::Sqlite);
        assert_eq!(config.ingest.retry_budget, DEFAULT_RETRY_BUDGET);
        assert!(config.ingest.grpc_enabled);
    }

    #[test]
    fn test_cli_overrides_defaults() {
        let cli = CliConfig {
            port: Some(9999),
            retry_budget: Some(3),
            ..Default::default()
        };
        let config = AppConfig::load(&cli).unwrap();
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.ingest.retry_budget, 3);
    }

    #[test]
    fn test_postgres_backend_requires_url() {
        let cli = CliConfig {
            database_backend: Some(DatabaseBackend::Postgres),
            ..Default::default()
        };
        assert!(AppConfig::load(&cli).is_err());
    }

    #[test]
    fn test_file_config_parses_nested_sections() {
        let json = r#"{
            "server": {"port": 7070},
            "ingest": {"grpc": {"enabled": false}, "retry_budget": 5},
            "database": {"backend": "sqlite"}
        }"#;
        let file: FileConfig = serde_json::from_str(json).unwrap();
        assert_eq!(file.server.unwrap().port, Some(7070));
        let ingest = file.ingest.unwrap();
        assert_eq!(ingest.retry_budget, Some(5));
        assert_eq!(ingest.grpc.unwrap().enabled, Some(false));
    }
}
