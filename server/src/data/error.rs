//! Unified error type for data layer
//!
//! Wraps backend-specific errors while preserving context about which
//! backend generated the error.

use thiserror::Error;

/// Unified error type for data layer operations
#[derive(Error, Debug)]
pub enum DataError {
    /// SQLite database error
    #[error("SQLite error: {0}")]
    Sqlite(sqlx::Error),

    /// PostgreSQL database error
    #[error("PostgreSQL error: {0}")]
    Postgres(sqlx::Error),

    /// Migration failed
    #[error("Migration {version} ({name}) failed on {backend}: {error}")]
    MigrationFailed {
        backend: &'static str,
        version: i32,
        name: String,
        error: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DataError {
    /// Create a SQLite error with preserved context
    pub fn from_sqlite(e: sqlx::Error) -> Self {
        Self::Sqlite(e)
    }

    /// Create a PostgreSQL error with preserved context
    pub fn from_postgres(e: sqlx::Error) -> Self {
        Self::Postgres(e)
    }

    /// Check if this is a connection-related error that might be transient
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlite(e) | Self::Postgres(e) => {
                matches!(
                    e,
                    sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
                )
            }
            _ => false,
        }
    }

    /// Get the backend name that generated this error
    pub fn backend(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "sqlite",
            Self::Postgres(_) => "postgres",
            Self::MigrationFailed { backend, .. } => backend,
            Self::Config(_) | Self::Io(_) => "unknown",
        }
    }
}

impl From<crate::data::sqlite::SqliteError> for DataError {
    fn from(e: crate::data::sqlite::SqliteError) -> Self {
        match e {
            crate::data::sqlite::SqliteError::Database(e) => Self::Sqlite(e),
            crate::data::sqlite::SqliteError::MigrationFailed {
                version,
                name,
                error,
            } => Self::MigrationFailed {
                backend: "sqlite",
                version,
                name,
                error,
            },
            crate::data::sqlite::SqliteError::Io(e) => Self::Io(e),
        }
    }
}

impl From<crate::data::postgres::PostgresError> for DataError {
    fn from(e: crate::data::postgres::PostgresError) -> Self {
        match e {
            crate::data::postgres::PostgresError::Database(e) => Self::Postgres(e),
            crate::data::postgres::PostgresError::MigrationFailed {
                version,
                name,
                error,
            } => Self::MigrationFailed {
                backend: "postgres",
                version,
                name,
                error,
            },
            crate::data::postgres::PostgresError::Config(msg) => Self::Config(msg),
            crate::data::postgres::PostgresError::Io(e) => Self::Io(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_failed_error_display() {
        let err = DataError::MigrationFailed {
            backend: "postgres",
            version: 2,
            name: "add_annotations".to_string(),
            error: "syntax error".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Migration 2 (add_annotations) failed on postgres: syntax error"
        );
    }

    #[test]
    fn test_backend_method() {
        assert_eq!(
            DataError::Sqlite(sqlx::Error::PoolClosed).backend(),
            "sqlite"
        );
        assert_eq!(
            DataError::Postgres(sqlx::Error::PoolClosed).backend(),
            "postgres"
        );
        assert_eq!(DataError::Config("bad".into()).backend(), "unknown");
    }

    #[test]
    fn test_is_transient() {
        assert!(DataError::Sqlite(sqlx::Error::PoolTimedOut).is_transient());
        assert!(DataError::Postgres(sqlx::Error::PoolClosed).is_transient());
        assert!(!DataError::Config("bad config".into()).is_transient());
        assert!(!DataError::Sqlite(sqlx::Error::RowNotFound).is_transient());
    }
}
