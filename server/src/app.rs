//! Core application

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::api::{ApiServer, OtlpGrpcServer, OtlpState};
use crate::core::cli::{self, CliConfig, Commands, SystemCommands};
use crate::core::config::AppConfig;
use crate::core::constants::{APP_NAME_LOWER, ENV_LOG};
use crate::core::shutdown::ShutdownService;
use crate::core::storage::AppStorage;
use crate::data::inserter::{InserterConfig, Inserters};
use crate::data::{ChangeEventBus, TransactionalService};
use crate::domain::traces::Traces;

pub struct CoreApp {
    pub shutdown: ShutdownService,
    pub config: AppConfig,
    pub storage: AppStorage,
    pub database: Arc<TransactionalService>,
    pub events: Arc<ChangeEventBus>,
    pub traces: Arc<Traces>,
    pub inserters: Arc<Inserters>,
}

impl CoreApp {
    /// Run the application with CLI argument parsing
    pub async fn run() -> Result<()> {
        dotenvy::dotenv().ok();
        Self::init_logging();

        tracing::debug!("Application starting");

        let (cli_config, command) = cli::parse();
        tracing::trace!(command = ?command, "Parsed command");

        match command {
            Some(Commands::System {
                command: system_cmd,
            }) => {
                return Self::handle_system_command(system_cmd);
            }
            Some(Commands::Start) | None => {}
        }

        let app = Self::init(&cli_config).await?;
        Self::start_server(app).await
    }

    async fn init(cli: &CliConfig) -> Result<Self> {
        let config = AppConfig::load(cli)?;
        let storage = AppStorage::init().await?;

        let database = Arc::new(
            TransactionalService::init(&config.database, &storage)
                .await
                .context("Failed to initialize database")?,
        );
        tracing::debug!(backend = database.backend_name(), "Database initialized");

        let events = Arc::new(ChangeEventBus::default());
        let inserters = Inserters::new(
            database.db(),
            Arc::clone(&events),
            InserterConfig::from(&config.ingest),
        );
        let traces = Traces::start();
        let shutdown = ShutdownService::new(Arc::clone(&database));

        Ok(Self {
            shutdown,
            config,
            storage,
            database,
            events,
            traces,
            inserters,
        })
    }

    fn handle_system_command(cmd: SystemCommands) -> Result<()> {
        match cmd {
            SystemCommands::Prune { yes } => Self::prune_data(yes),
        }
    }

    fn prune_data(skip_confirm: bool) -> Result<()> {
        let data_dir = AppStorage::resolve_data_dir();

        if !data_dir.exists() {
            println!(
                "Nothing to prune. Data directory does not exist: {}",
                data_dir.display()
            );
            return Ok(());
        }

        let data_dir = data_dir.canonicalize().unwrap_or(data_dir);

        println!("This will permanently delete the local data directory:");
        println!("  {}", data_dir.display());
        println!();
        println!(
            "Make sure the server is not running. \
             Deleting data while the server is running will cause data corruption."
        );

        if !skip_confirm {
            print!("\nContinue? [y/N] ");
            std::io::Write::flush(&mut std::io::stdout())?;

            let mut input = String::new();
            std::io::stdin().read_line(&mut input)?;

            if !matches!(input.trim().to_lowercase().as_str(), "y" | "yes") {
                println!("Aborted.");
                return Ok(());
            }
        }

        std::fs::remove_dir_all(&data_dir)
            .with_context(|| format!("Failed to delete data directory: {}", data_dir.display()))?;
        println!("Pruned: {}", data_dir.display());
        Ok(())
    }

    fn init_logging() {
        let default_filter = format!("info,{}=info", APP_NAME_LOWER);

        let filter = std::env::var(ENV_LOG)
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or(default_filter);

        tracing_subscriber::fmt()
            .with_target(false)
            .with_thread_ids(false)
            .with_level(true)
            .with_ansi(true)
            .compact()
            .with_env_filter(filter)
            .init();
    }

    async fn start_server(app: Self) -> Result<()> {
        // Install signal handlers FIRST (before any blocking calls)
        app.shutdown.install_signal_handlers();

        app.start_background_tasks().await;

        // Start OTLP gRPC server if enabled
        if app.config.ingest.grpc_enabled {
            let grpc_server = OtlpGrpcServer::new(
                &app.config.ingest,
                &app.config.server.host,
                OtlpState {
                    traces: app.traces.clone(),
                    inserters: app.inserters.clone(),
                },
            )?;
            let shutdown_rx = app.shutdown.subscribe();
            let handle = tokio::spawn(async move {
                if let Err(e) = grpc_server.start(shutdown_rx).await {
                    tracing::error!(error = %e, "OTLP gRPC server error");
                }
            });

            app.shutdown.register(handle).await;
        }

        let server = ApiServer::new(app);
        let app = server.start().await?;

        // Stop accepting new work, drain the dispatcher, then flush and close
        app.traces.stop().await;
        app.shutdown.shutdown().await;

        Ok(())
    }

    async fn start_background_tasks(&self) {
        self.shutdown
            .register(
                self.database
                    .start_maintenance_task(self.shutdown.subscribe()),
            )
            .await;

        for handle in self.inserters.start_all(self.shutdown.subscribe()) {
            self.shutdown.register(handle).await;
        }

        tracing::debug!("Background tasks started");
    }
}
