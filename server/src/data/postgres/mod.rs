//! PostgreSQL database service
//!
//! Provides centralized database management for the PostgreSQL backend.
//! Optimized for scalable deployments with:
//! - Connection pooling with min/max bounds
//! - Idle connection cleanup
//! - Query timeout protection
//!
//! All schema definitions and migrations are managed here.

pub mod error;
mod migrations;
pub mod schema;

pub use error::PostgresError;
pub use sqlx::PgPool;

use std::sync::Arc;
use std::time::Duration;

use sqlx::ConnectOptions;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::log::LevelFilter;

use crate::core::config::PostgresConfig;
use crate::core::constants::POSTGRES_HEALTH_CHECK_INTERVAL_SECS;

/// PostgreSQL database service
///
/// Handles database initialization, connection pooling, and background tasks.
/// Should be created once at server startup and shared across all modules.
pub struct PostgresService {
    pool: PgPool,
}

impl PostgresService {
    /// Initialize the database service from configuration
    pub async fn init(config: &PostgresConfig) -> Result<Self, PostgresError> {
        if config.url.is_empty() {
            return Err(PostgresError::Config("PostgreSQL URL is required".into()));
        }

        let mut options: PgConnectOptions = config
            .url
            .parse()
            .map_err(|e| PostgresError::Config(format!("Invalid PostgreSQL URL: {}", e)))?;

        options = options.log_statements(LevelFilter::Trace);

        // Set statement timeout at connection level for query protection
        if config.statement_timeout_secs > 0 {
            options = options.options([(
                "statement_timeout",
                format!("{}s", config.statement_timeout_secs),
            )]);
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect_with(options)
            .await?;

        migrations::run_migrations(&pool).await?;

        tracing::debug!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            acquire_timeout_secs = config.acquire_timeout_secs,
            statement_timeout_secs = config.statement_timeout_secs,
            "PostgresService initialized"
        );
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close the connection pool gracefully
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::debug!("PostgreSQL pool closed");
    }

    /// Start a background health check task
    pub fn start_health_check_task(
        self: &Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let db = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(POSTGRES_HEALTH_CHECK_INTERVAL_SECS));
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::debug!("PostgreSQL health check task shutting down");
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        if let Err(e) = sqlx::query("SELECT 1").execute(&db.pool).await {
                            tracing::warn!("PostgreSQL health check failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}
