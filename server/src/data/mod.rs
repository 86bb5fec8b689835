//! Data layer: SQL dialects, database services, insertion engines, and the
//! change-event bus

pub mod error;
pub mod events;
pub mod inserter;
pub mod postgres;
pub mod sql;
pub mod sqlite;

pub use error::DataError;
pub use events::{ChangeEvent, ChangeEventBus, EntityKind};
pub use sql::Dialect;

use std::sync::Arc;

use sqlx::{PgPool, SqlitePool};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::config::{DatabaseBackend, DatabaseConfig};
use crate::core::storage::AppStorage;
use postgres::PostgresService;
use sqlite::SqliteService;

/// Handle to the active relational backend.
///
/// Cloning is cheap (sqlx pools are reference-counted); every query site
/// matches on the variant, so each backend keeps its native pool type.
#[derive(Clone)]
pub enum Db {
    Sqlite(SqlitePool),
    Postgres(PgPool),
}

impl Db {
    pub fn dialect(&self) -> Dialect {
        match self {
            Db::Sqlite(_) => Dialect::Sqlite,
            Db::Postgres(_) => Dialect::Postgres,
        }
    }
}

/// The configured transactional database service
pub enum TransactionalService {
    Sqlite(Arc<SqliteService>),
    Postgres(Arc<PostgresService>),
}

impl TransactionalService {
    /// Initialize the backend selected by configuration
    pub async fn init(config: &DatabaseConfig, storage: &AppStorage) -> Result<Self, DataError> {
        match config.backend {
            DatabaseBackend::Sqlite => {
                let service = SqliteService::init(storage).await?;
                Ok(Self::Sqlite(Arc::new(service)))
            }
            DatabaseBackend::Postgres => {
                let postgres_config = config.postgres.as_ref().ok_or_else(|| {
                    DataError::Config("postgres backend requires a connection URL".into())
                })?;
                let service = PostgresService::init(postgres_config).await?;
                Ok(Self::Postgres(Arc::new(service)))
            }
        }
    }

    /// In-memory SQLite service for tests
    #[cfg(test)]
    pub async fn init_in_memory() -> Result<Self, DataError> {
        let service = SqliteService::init_in_memory().await?;
        Ok(Self::Sqlite(Arc::new(service)))
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "sqlite",
            Self::Postgres(_) => "postgres",
        }
    }

    /// Cheap query handle for the insertion engines and repositories
    pub fn db(&self) -> Db {
        match self {
            Self::Sqlite(service) => Db::Sqlite(service.pool().clone()),
            Self::Postgres(service) => Db::Postgres(service.pool().clone()),
        }
    }

    /// Force durability housekeeping (WAL checkpoint on SQLite; no-op on
    /// PostgreSQL, which manages its own WAL)
    pub async fn checkpoint(&self) -> Result<(), DataError> {
        match self {
            Self::Sqlite(service) => service.checkpoint().await.map_err(DataError::from),
            Self::Postgres(_) => Ok(()),
        }
    }

    /// Close the connection pool gracefully
    pub async fn close(&self) {
        match self {
            Self::Sqlite(service) => service.close().await,
            Self::Postgres(service) => service.close().await,
        }
    }

    /// Periodic backend maintenance: WAL checkpoints for SQLite, connection
    /// health checks for PostgreSQL
    pub fn start_maintenance_task(&self, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        match self {
            Self::Sqlite(service) => service.start_checkpoint_task(shutdown_rx),
            Self::Postgres(service) => service.start_health_check_task(shutdown_rx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_service_reports_sqlite() {
        let service = TransactionalService::init_in_memory().await.unwrap();
        assert_eq!(service.backend_name(), "sqlite");
        assert_eq!(service.db().dialect(), Dialect::Sqlite);
        service.checkpoint().await.unwrap();
        service.close().await;
    }
}
