//! Tests for OTLP extraction and project resolution

use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue, any_value};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span as OtlpSpan, Status};
use serde_json::json;

use super::extract::*;
use super::proto::{
    self, DocumentRef, EvaluationRecord, EvaluationResult, SubjectRef, subject_ref,
};
use super::{AnnotatorKind, EvaluationSubject, SpanKind, SpanStatusCode};
use crate::core::constants::{DEFAULT_PROJECT_NAME, PROJECT_NAME_ATTR};

pub(crate) fn string_attr(key: &str, value: &str) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(any_value::Value::StringValue(value.to_string())),
        }),
    }
}

fn int_attr(key: &str, value: i64) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(any_value::Value::IntValue(value)),
        }),
    }
}

pub(crate) fn make_otlp_span(name: &str, trace_id: &[u8], span_id: &[u8]) -> OtlpSpan {
    OtlpSpan {
        trace_id: trace_id.to_vec(),
        span_id: span_id.to_vec(),
        trace_state: String::new(),
        parent_span_id: vec![],
        flags: 0,
        name: name.to_string(),
        kind: 1,
        start_time_unix_nano: 1_700_000_000_000_000_000,
        end_time_unix_nano: 1_700_000_001_000_000_000,
        attributes: vec![],
        dropped_attributes_count: 0,
        events: vec![],
        dropped_events_count: 0,
        links: vec![],
        dropped_links_count: 0,
        status: None,
    }
}

pub(crate) fn make_request(groups: Vec<(Option<&str>, Vec<OtlpSpan>)>) -> ExportTraceServiceRequest {
    ExportTraceServiceRequest {
        resource_spans: groups
            .into_iter()
            .map(|(project, spans)| ResourceSpans {
                resource: Some(Resource {
                    attributes: project
                        .map(|p| vec![string_attr(PROJECT_NAME_ATTR, p)])
                        .unwrap_or_default(),
                    dropped_attributes_count: 0,
                }),
                scope_spans: vec![ScopeSpans {
                    scope: None,
                    spans,
                    schema_url: String::new(),
                }],
                schema_url: String::new(),
            })
            .collect(),
    }
}

// ==========================================================================
// Project Resolution
// ==========================================================================

#[test]
fn test_resolve_project_name_present() {
    let attrs = vec![
        string_attr("service.name", "svc"),
        string_attr(PROJECT_NAME_ATTR, "proj1"),
    ];
    assert_eq!(resolve_project_name(&attrs), "proj1");
}

#[test]
fn test_resolve_project_name_missing_returns_default() {
    let attrs = vec![string_attr("service.name", "svc")];
    assert_eq!(resolve_project_name(&attrs), DEFAULT_PROJECT_NAME);
    assert_eq!(resolve_project_name(&[]), DEFAULT_PROJECT_NAME);
}

#[test]
fn test_resolve_project_name_empty_value_returns_default() {
    let attrs = vec![string_attr(PROJECT_NAME_ATTR, "")];
    assert_eq!(resolve_project_name(&attrs), DEFAULT_PROJECT_NAME);
}

#[test]
fn test_resolve_project_name_non_string_returns_default() {
    let attrs = vec![int_attr(PROJECT_NAME_ATTR, 42)];
    assert_eq!(resolve_project_name(&attrs), DEFAULT_PROJECT_NAME);
}

// ==========================================================================
// Attribute Conversion
// ==========================================================================

#[test]
fn test_any_value_to_json_scalars() {
    let int = AnyValue {
        value: Some(any_value::Value::IntValue(7)),
    };
    assert_eq!(any_value_to_json(&int), json!(7));

    let boolean = AnyValue {
        value: Some(any_value::Value::BoolValue(true)),
    };
    assert_eq!(any_value_to_json(&boolean), json!(true));

    let empty = AnyValue { value: None };
    assert_eq!(any_value_to_json(&empty), serde_json::Value::Null);
}

#[test]
fn test_unflatten_attributes_nests_dotted_keys() {
    let mut flat = serde_json::Map::new();
    flat.insert("llm.token_count.prompt".to_string(), json!(10));
    flat.insert("llm.token_count.completion".to_string(), json!(20));
    flat.insert("plain".to_string(), json!("x"));

    let nested = unflatten_attributes(&flat);
    assert_eq!(
        nested,
        json!({
            "llm": {"token_count": {"prompt": 10, "completion": 20}},
            "plain": "x"
        })
    );
}

#[test]
fn test_unflatten_attributes_prefix_collision_keeps_flat_key() {
    let mut flat = serde_json::Map::new();
    flat.insert("a".to_string(), json!("scalar"));
    flat.insert("a.b".to_string(), json!(1));

    let nested = unflatten_attributes(&flat);
    assert_eq!(nested, json!({"a": "scalar", "a.b": 1}));
}

// ==========================================================================
// Span Extraction
// ==========================================================================

#[test]
fn test_extract_span_core_fields() {
    let mut otlp = make_otlp_span("chat", &[1u8; 16], &[2u8; 8]);
    otlp.parent_span_id = vec![3u8; 8];
    otlp.status = Some(Status {
        code: 2,
        message: "boom".to_string(),
    });
    otlp.attributes = vec![
        string_attr(keys::SPAN_KIND, "LLM"),
        string_attr(keys::SESSION_ID, "sess-1"),
        int_attr(keys::LLM_TOKEN_COUNT_PROMPT, 11),
        int_attr(keys::LLM_TOKEN_COUNT_COMPLETION, 5),
    ];

    let span = extract_span(&otlp);
    assert_eq!(span.trace_id, hex::encode([1u8; 16]));
    assert_eq!(span.span_id, hex::encode([2u8; 8]));
    assert_eq!(span.parent_span_id, Some(hex::encode([3u8; 8])));
    assert_eq!(span.name, "chat");
    assert_eq!(span.kind, SpanKind::Llm);
    assert_eq!(span.session_id.as_deref(), Some("sess-1"));
    assert_eq!(span.status.code, SpanStatusCode::Error);
    assert_eq!(span.status.message.as_deref(), Some("boom"));
    assert_eq!(span.cumulative_error_count, 1);
    assert_eq!(span.cumulative_llm_token_count_prompt, 11);
    assert_eq!(span.cumulative_llm_token_count_completion, 5);
    assert_eq!(span.latency_ms(), 1000);
}

#[test]
fn test_extract_span_clamps_regressed_end_time() {
    let mut otlp = make_otlp_span("x", &[1u8; 16], &[2u8; 8]);
    otlp.end_time_unix_nano = otlp.start_time_unix_nano - 1;

    let span = extract_span(&otlp);
    assert_eq!(span.start_time, span.end_time);
    assert_eq!(span.latency_ms(), 0);
}

#[test]
fn test_extract_span_unknown_kind_defaults() {
    let otlp = make_otlp_span("x", &[1u8; 16], &[2u8; 8]);
    let span = extract_span(&otlp);
    assert_eq!(span.kind, SpanKind::Unknown);
    assert_eq!(span.status.code, SpanStatusCode::Unset);
    assert_eq!(span.cumulative_error_count, 0);
}

#[test]
fn test_extract_resource_groups_projects_and_counts() {
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

    let groups = extract_resource_groups(&request);
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].project_name, DEFAULT_PROJECT_NAME);
    assert_eq!(groups[0].spans.len(), 2);
    assert_eq!(groups[1].project_name, "proj1");
    assert_eq!(groups[1].spans.len(), 1);

    let total: usize = groups.iter().map(|g| g.spans.len()).sum();
    assert_eq!(total, 3);
}

// ==========================================================================
// Evaluation Extraction
// ==========================================================================

fn record_with_subject(kind: subject_ref::Kind) -> EvaluationRecord {
    EvaluationRecord {
        name: "correctness".to_string(),
        subject: Some(SubjectRef { kind: Some(kind) }),
        result: Some(EvaluationResult {
            label: Some("correct".to_string()),
            score: Some(0.5),
            explanation: None,
        }),
        annotator_kind: proto::AnnotatorKind::Llm as i32,
        metadata_json: String::new(),
    }
}

#[test]
fn test_evaluation_from_record_trace_subject() {
    let eval =
        evaluation_from_record(record_with_subject(subject_ref::Kind::TraceId("t1".into())))
            .unwrap();
    assert_eq!(eval.subject, EvaluationSubject::Trace("t1".into()));
    assert_eq!(eval.annotator_kind, AnnotatorKind::Llm);
    assert_eq!(eval.score, Some(0.5));
    assert_eq!(eval.metadata, json!({}));
}

#[test]
fn test_evaluation_from_record_document_subject() {
    let eval = evaluation_from_record(record_with_subject(subject_ref::Kind::Document(
        DocumentRef {
            span_id: "s1".into(),
            document_position: 2,
        },
    )))
    .unwrap();
    assert_eq!(
        eval.subject,
        EvaluationSubject::Document {
            span_id: "s1".into(),
            position: 2
        }
    );
}

#[test]
fn test_evaluation_from_record_missing_subject() {
    let mut record = record_with_subject(subject_ref::Kind::TraceId("t1".into()));
    record.subject = None;
    assert_eq!(
        evaluation_from_record(record),
        Err(InvalidEvaluation::MissingSubject)
    );

    let empty_id = record_with_subject(subject_ref::Kind::TraceId(String::new()));
    assert_eq!(
        evaluation_from_record(empty_id),
        Err(InvalidEvaluation::MissingSubject)
    );
}

#[test]
fn test_evaluation_from_record_missing_name() {
    let mut record = record_with_subject(subject_ref::Kind::SpanId("s1".into()));
    record.name = String::new();
    assert_eq!(
        evaluation_from_record(record),
        Err(InvalidEvaluation::MissingName)
    );
}

#[test]
fn test_evaluation_from_record_rejects_non_object_metadata() {
    let mut record = record_with_subject(subject_ref::Kind::SpanId("s1".into()));
    record.metadata_json = "[1, 2]".to_string();
    assert!(matches!(
        evaluation_from_record(record),
        Err(InvalidEvaluation::BadMetadata(_))
    ));
}

#[test]
fn test_evaluation_from_record_unknown_annotator() {
    let mut record = record_with_subject(subject_ref::Kind::SpanId("s1".into()));
    record.annotator_kind = 99;
    assert_eq!(
        evaluation_from_record(record),
        Err(InvalidEvaluation::UnknownAnnotatorKind(99))
    );
}
