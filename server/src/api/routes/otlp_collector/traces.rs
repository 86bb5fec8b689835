//! Traces export endpoint (HTTP transport)

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use opentelemetry_proto::tonic::collector::trace::v1::{
    ExportTraceServiceRequest, ExportTraceServiceResponse,
};

use super::encoding::{decode_request, success_response};
use super::{OtlpState, ingest_trace_request, project_override};

pub async fn export(
    State(state): State<OtlpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Parse request (content type and encoding are validated first; a
    // rejected request mutates no state)
    let (request, content_type): (ExportTraceServiceRequest, _) =
        match decode_request(&body, &headers) {
            Ok(decoded) => decoded,
            Err(e) => return e.into_response(),
        };

    let accepted = ingest_trace_request(&state, &request, project_override(&headers));
    tracing::debug!(spans = accepted, "Accepted trace export");

    // OTLP-compliant response, matching the request content type
    let response = ExportTraceServiceResponse {
        partial_success: None,
    };
    success_response(&response, content_type)
}
