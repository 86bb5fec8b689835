//! Evaluations export endpoint (HTTP transport only)
//!
//! Accepts the evaluation envelope, validates every record, then feeds the
//! in-memory dispatcher and the per-kind annotation insertion engines.
//! Validation is all-or-nothing: a request with any semantically invalid
//! record is rejected without buffering anything.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};

use super::encoding::{decode_request, success_response};
use super::{OtlpState, project_override};
use crate::data::inserter::{
    DocumentAnnotationPrecursor, SpanAnnotationPrecursor, TraceAnnotationPrecursor,
};
use crate::domain::telemetry::extract::evaluation_from_record;
use crate::domain::telemetry::proto::{ExportEvaluationRequest, ExportEvaluationResponse};
use crate::domain::telemetry::{Evaluation, EvaluationSubject, TelemetryItem};

pub async fn export(
    State(state): State<OtlpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (request, content_type): (ExportEvaluationRequest, _) =
        match decode_request(&body, &headers) {
            Ok(decoded) => decoded,
            Err(e) => return e.into_response(),
        };

    // Validate every record before buffering any of them
    let mut evaluations = Vec::with_capacity(request.evaluations.len());
    for record in request.evaluations {
        match evaluation_from_record(record) {
            Ok(evaluation) => evaluations.push(evaluation),
            Err(e) => {
                tracing::warn!(error = %e, "Rejecting evaluation export");
                return (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    [(header::CONTENT_TYPE, "text/plain")],
                    e.to_string(),
                )
                    .into_response();
            }
        }
    }

    let accepted = evaluations.len();
    let project = project_override(&headers);
    for evaluation in evaluations {
        submit_evaluation(&state, evaluation, project.clone());
    }
    tracing::debug!(evaluations = accepted, "Accepted evaluation export");

    success_response(&ExportEvaluationResponse {}, content_type)
}

/// Route one evaluation to the matching annotation engine and the dispatcher
fn submit_evaluation(state: &OtlpState, evaluation: Evaluation, project: Option<String>) {
    match &evaluation.subject {
        EvaluationSubject::Trace(trace_id) => {
            state.inserters.trace_annotations.submit(TraceAnnotationPrecursor {
                trace_id: trace_id.clone(),
                data: (&evaluation).into(),
            });
        }
        EvaluationSubject::Span(span_id) => {
            state.inserters.span_annotations.submit(SpanAnnotationPrecursor {
                span_id: span_id.clone(),
                data: (&evaluation).into(),
            });
        }
        EvaluationSubject::Document { span_id, position } => {
            state
                .inserters
                .document_annotations
                .submit(DocumentAnnotationPrecursor {
                    span_id: span_id.clone(),
                    document_position: *position,
                    data: (&evaluation).into(),
                });
        }
    }
    state
        .traces
        .put(TelemetryItem::Evaluation(evaluation), project);
}
