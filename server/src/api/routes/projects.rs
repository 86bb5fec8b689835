//! Read-side project stats from in-memory state
//!
//! Thin view over `Traces::get_project` for liveness checks and local
//! debugging; the full read API is a separate concern.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::domain::traces::Traces;

#[derive(Clone)]
pub struct ProjectsApiState {
    pub traces: Arc<Traces>,
}

#[derive(Serialize)]
pub struct ProjectStats {
    pub name: String,
    pub span_count: usize,
    pub trace_count: usize,
    pub evaluation_count: usize,
}

/// In-memory stats for one project; 404 until the project has received data
pub async fn stats(
    State(state): State<ProjectsApiState>,
    Path(name): Path<String>,
) -> Response {
    match state.traces.get_project(&name) {
        Some(project) => Json(ProjectStats {
            name,
            span_count: project.span_count(),
            trace_count: project.trace_count(),
            evaluation_count: project.evaluation_count(),
        })
        .into_response(),
        None => (StatusCode::NOT_FOUND, "project not found").into_response(),
    }
}

pub fn routes(state: ProjectsApiState) -> axum::Router {
    axum::Router::new()
        .route("/projects/{name}/stats", axum::routing::get(stats))
        .with_state(state)
}
