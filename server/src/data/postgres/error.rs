//! PostgreSQL error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PostgresError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration {version} ({name}) failed: {error}")]
    MigrationFailed {
        version: i32,
        name: String,
        error: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = PostgresError::Config("PostgreSQL URL is required".into());
        assert_eq!(
            err.to_string(),
            "Configuration error: PostgreSQL URL is required"
        );
    }

    #[test]
    fn test_migration_failed_error_display() {
        let err = PostgresError::MigrationFailed {
            version: 3,
            name: "add_annotations".to_string(),
            error: "relation exists".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Migration 3 (add_annotations) failed: relation exists"
        );
    }
}
