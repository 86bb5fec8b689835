//! OTLP HTTP and gRPC collector endpoints

mod encoding;
mod evaluations;
mod grpc;
mod traces;

pub use grpc::OtlpGrpcServer;

use std::sync::Arc;

use axum::Router;
use axum::http::HeaderMap;
use axum::routing::post;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;

use crate::core::constants::PROJECT_NAME_HEADER;
use crate::data::inserter::{Inserters, SpanPrecursor};
use crate::domain::telemetry::extract::extract_resource_groups;
use crate::domain::telemetry::TelemetryItem;
use crate::domain::traces::Traces;

#[derive(Clone)]
pub struct OtlpState {
    pub traces: Arc<Traces>,
    pub inserters: Arc<Inserters>,
}

pub fn routes(state: OtlpState) -> Router {
    Router::new()
        .route("/traces", post(traces::export))
        .route("/evaluations", post(evaluations::export))
        .with_state(state)
}

/// Project override carried in a transport header; takes precedence over the
/// resource attribute resolution
pub(crate) fn project_override(headers: &HeaderMap) -> Option<String> {
    headers
        .get(PROJECT_NAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Shared ingestion path for both transports: extract per-resource groups,
/// resolve each group's project, then hand every span to the in-memory
/// dispatcher and the span insertion engine. Returns the accepted span count.
pub(crate) fn ingest_trace_request(
    state: &OtlpState,
    request: &ExportTraceServiceRequest,
    project_override: Option<String>,
) -> usize {
    let mut accepted = 0;
    for group in extract_resource_groups(request) {
        let project_name = project_override
            .clone()
            .unwrap_or(group.project_name);
        for span in group.spans {
            state.inserters.spans.submit(SpanPrecursor {
                project_name: project_name.clone(),
                span: span.clone(),
            });
            state
                .traces
                .put(TelemetryItem::Span(span), Some(project_name.clone()));
            accepted += 1;
        }
    }
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::DEFAULT_PROJECT_NAME;
    use crate::data::inserter::InserterConfig;
    use crate::data::{ChangeEventBus, Db, TransactionalService};
    use crate::domain::telemetry::extract_tests::{make_otlp_span, make_request};
    use std::time::Duration;

    async fn make_state() -> (OtlpState, Db) {
        let service = TransactionalService::init_in_memory().await.unwrap();
        let db = service.db();
        let inserters = Inserters::new(
            db.clone(),
            Arc::new(ChangeEventBus::default()),
            InserterConfig {
                flush_interval: Duration::from_secs(3600),
                retry_budget: 3,
                batch_threshold: 1000,
            },
        );
        let state = OtlpState {
            traces: Traces::start(),
            inserters,
        };
        (state, db)
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met within timeout");
    }

    #[tokio::test]
    async fn test_ingest_routes_spans_by_resource_group() {
        let (state, db) = make_state().await;

        // Group A without a project attribute (2 spans), group B with one
        let request = make_request(vec![
            (
                None,
                vec![
                    make_otlp_span("x", &[1u8; 16], &[1u8; 8]),
                    make_otlp_span("y", &[1u8; 16], &[2u8; 8]),
                ],
            ),
            (
                Some("proj1"),
                vec![make_otlp_span("z", &[2u8; 16], &[3u8; 8])],
            ),
        ]);

        let accepted = ingest_trace_request(&state, &request, None);
        assert_eq!(accepted, 3);

        wait_for(|| {
            state
                .traces
                .get_project(DEFAULT_PROJECT_NAME)
                .is_some_and(|p| p.span_count() == 2)
        })
        .await;
        wait_for(|| {
            state
                .traces
                .get_project("proj1")
                .is_some_and(|p| p.span_count() == 1)
        })
        .await;

        let default = state.traces.get_project(DEFAULT_PROJECT_NAME).unwrap();
        let mut names = default.span_names();
        names.sort();
        assert_eq!(names, vec!["x", "y"]);
        assert_eq!(
            state.traces.get_project("proj1").unwrap().span_names(),
            vec!["z"]
        );
        assert!(state.traces.get_project("unknown").is_none());

        // One flush cycle commits every accepted span
        let outcome = state.inserters.spans.flush_once().await;
        assert_eq!(outcome.inserted, 3);

        let Db::Sqlite(pool) = &db else { unreachable!() };
        let (spans, projects): (i64, i64) = (
            sqlx::query_scalar("SELECT COUNT(*) FROM spans")
                .fetch_one(pool)
                .await
                .unwrap(),
            sqlx::query_scalar("SELECT COUNT(*) FROM projects")
                .fetch_one(pool)
                .await
                .unwrap(),
        );
        assert_eq!(spans, 3);
        assert_eq!(projects, 2);

        state.traces.stop().await;
    }

    #[tokio::test]
    async fn test_transport_override_takes_precedence() {
        let (state, _db) = make_state().await;

        let request = make_request(vec![(
            Some("from-resource"),
            vec![make_otlp_span("a", &[1u8; 16], &[1u8; 8])],
        )]);
        ingest_trace_request(&state, &request, Some("from-header".to_string()));

        wait_for(|| {
            state
                .traces
                .get_project("from-header")
                .is_some_and(|p| p.span_count() == 1)
        })
        .await;
        assert!(state.traces.get_project("from-resource").is_none());

        state.traces.stop().await;
    }
}
