// =============================================================================
// Application Identity
// =============================================================================

/// Application name in title case (for display and platform directories)
pub const APP_NAME: &str = "TracePort";

/// Application name in lowercase (for paths and identifiers)
pub const APP_NAME_LOWER: &str = "traceport";

/// Unix-style dotfile folder name
pub const APP_DOT_FOLDER: &str = ".traceport";

// =============================================================================
// Configuration Files
// =============================================================================

/// Config file name
pub const CONFIG_FILE_NAME: &str = "traceport.json";

/// Environment variable for config file path
pub const ENV_CONFIG: &str = "TRACEPORT_CONFIG";

// =============================================================================
// Environment Variables - Server
// =============================================================================

/// Environment variable for server host
pub const ENV_HOST: &str = "TRACEPORT_HOST";

/// Environment variable for server port
pub const ENV_PORT: &str = "TRACEPORT_PORT";

/// Environment variable for log level/filter
pub const ENV_LOG: &str = "TRACEPORT_LOG";

/// Environment variable for debug mode
pub const ENV_DEBUG: &str = "TRACEPORT_DEBUG";

// =============================================================================
// Environment Variables - Ingestion
// =============================================================================

pub const ENV_GRPC_ENABLED: &str = "TRACEPORT_GRPC_ENABLED";
pub const ENV_GRPC_PORT: &str = "TRACEPORT_GRPC_PORT";
pub const ENV_FLUSH_INTERVAL_MS: &str = "TRACEPORT_FLUSH_INTERVAL_MS";
pub const ENV_RETRY_BUDGET: &str = "TRACEPORT_RETRY_BUDGET";
pub const ENV_BATCH_THRESHOLD: &str = "TRACEPORT_BATCH_THRESHOLD";

// =============================================================================
// Environment Variables - Storage / Database
// =============================================================================

/// Environment variable to override data directory
pub const ENV_DATA_DIR: &str = "TRACEPORT_DATA_DIR";

/// Transactional database backend (sqlite or postgres)
pub const ENV_DATABASE_BACKEND: &str = "TRACEPORT_DATABASE_BACKEND";

/// PostgreSQL connection URL (when using postgres backend)
pub const ENV_POSTGRES_URL: &str = "TRACEPORT_POSTGRES_URL";

// =============================================================================
// Server Defaults
// =============================================================================

/// Default server host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default HTTP server port
pub const DEFAULT_PORT: u16 = 6060;

/// Default OTLP gRPC port
pub const DEFAULT_GRPC_PORT: u16 = 4317;

/// Maximum OTLP request body size (8 MB)
pub const OTLP_BODY_LIMIT: usize = 8 * 1024 * 1024;

// =============================================================================
// Ingestion Defaults
// =============================================================================

/// Well-known resource attribute carrying the logical project name
pub const PROJECT_NAME_ATTR: &str = "traceport.project.name";

/// HTTP header / gRPC metadata key overriding the project name
pub const PROJECT_NAME_HEADER: &str = "x-traceport-project-name";

/// Project that receives telemetry without an explicit project name
pub const DEFAULT_PROJECT_NAME: &str = "default";

/// Interval between insertion-engine flush cycles
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 500;

/// How many flush cycles an item may be postponed before it is discarded
pub const DEFAULT_RETRY_BUDGET: u32 = 10;

/// Buffer size that triggers an immediate flush ahead of the timer
pub const DEFAULT_BATCH_THRESHOLD: usize = 100;

/// Capacity of each change-event broadcast channel
pub const CHANGE_EVENT_CAPACITY: usize = 10_000;

// =============================================================================
// SQLite Database
// =============================================================================

/// SQLite database filename
pub const SQLITE_DB_FILENAME: &str = "traceport.db";

/// SQLite connection pool max connections
pub const SQLITE_MAX_CONNECTIONS: u32 = 5;

/// SQLite busy timeout in seconds
pub const SQLITE_BUSY_TIMEOUT_SECS: u64 = 30;

/// SQLite cache size (negative = KB, so -64000 = 64MB)
pub const SQLITE_CACHE_SIZE: &str = "-64000";

/// SQLite WAL autocheckpoint (pages)
pub const SQLITE_WAL_AUTOCHECKPOINT: &str = "1000";

/// Interval between WAL checkpoints in seconds
pub const SQLITE_CHECKPOINT_INTERVAL_SECS: u64 = 300;

// =============================================================================
// PostgreSQL Database
// =============================================================================

pub const POSTGRES_DEFAULT_MAX_CONNECTIONS: u32 = 20;
pub const POSTGRES_DEFAULT_MIN_CONNECTIONS: u32 = 2;
pub const POSTGRES_DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 10;
pub const POSTGRES_DEFAULT_STATEMENT_TIMEOUT_SECS: u64 = 30;
pub const POSTGRES_HEALTH_CHECK_INTERVAL_SECS: u64 = 60;

// =============================================================================
// Shutdown
// =============================================================================

/// Maximum time to wait for background tasks during shutdown
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 10;
