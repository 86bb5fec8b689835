//! API server initialization

use std::net::SocketAddr;

use anyhow::Result;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::routes::otlp_collector::{self, OtlpState};
use super::routes::projects::{self, ProjectsApiState};
use super::routes::health;
use crate::core::CoreApp;
use crate::core::constants::OTLP_BODY_LIMIT;

pub struct ApiServer {
    app: CoreApp,
}

impl ApiServer {
    pub fn new(app: CoreApp) -> Self {
        Self { app }
    }

    /// Returns CoreApp for graceful shutdown
    pub async fn start(self) -> Result<CoreApp> {
        let app = self.app;

        // Clone shutdown before moving app
        let shutdown = app.shutdown.clone();

        let host = app.config.server.host.clone();
        let port = app.config.server.port;
        let addr = SocketAddr::new(host.parse()?, port);

        let otlp_routes = otlp_collector::routes(OtlpState {
            traces: app.traces.clone(),
            inserters: app.inserters.clone(),
        })
        .layer(DefaultBodyLimit::max(OTLP_BODY_LIMIT));

        let project_routes = projects::routes(ProjectsApiState {
            traces: app.traces.clone(),
        });

        let router = Router::new()
            .route("/health", get(health::health))
            .nest("/v1", otlp_routes.merge(project_routes))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive());

        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "HTTP server listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.wait())
            .await?;

        Ok(app)
    }
}
