//! OTLP extraction
//!
//! Converts OTLP protobuf spans into the domain model and resolves the
//! logical project a resource group belongs to.

use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue, any_value};
use opentelemetry_proto::tonic::trace::v1::Span as OtlpSpan;
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

use super::proto::{self, EvaluationRecord, subject_ref};
use super::{AnnotatorKind, Evaluation, EvaluationSubject, Span, SpanEvent, SpanKind, SpanStatus, SpanStatusCode};
use crate::core::constants::{DEFAULT_PROJECT_NAME, PROJECT_NAME_ATTR};
use crate::utils::time::nanos_to_datetime;

/// Well-known attribute keys
pub mod keys {
    /// Observation kind of a span (OpenInference convention)
    pub const SPAN_KIND: &str = "openinference.span.kind";
    /// Session grouping identifier
    pub const SESSION_ID: &str = "session.id";
    pub const LLM_TOKEN_COUNT_PROMPT: &str = "llm.token_count.prompt";
    pub const LLM_TOKEN_COUNT_COMPLETION: &str = "llm.token_count.completion";
}

// ============================================================================
// PROJECT RESOLUTION
// ============================================================================

/// Resolve the logical project name from resource attributes.
///
/// Returns the value of the well-known project attribute when present and
/// non-empty, otherwise the default project name. Pure and total.
pub fn resolve_project_name(resource_attributes: &[KeyValue]) -> String {
    resource_attributes
        .iter()
        .find(|kv| kv.key == PROJECT_NAME_ATTR)
        .and_then(|kv| kv.value.as_ref())
        .and_then(|v| match &v.value {
            Some(any_value::Value::StringValue(s)) if !s.is_empty() => Some(s.clone()),
            _ => None,
        })
        .unwrap_or_else(|| DEFAULT_PROJECT_NAME.to_string())
}

// ============================================================================
// ATTRIBUTE CONVERSION
// ============================================================================

/// Convert an OTLP AnyValue to JSON
pub fn any_value_to_json(value: &AnyValue) -> JsonValue {
    match &value.value {
        Some(any_value::Value::StringValue(s)) => JsonValue::String(s.clone()),
        Some(any_value::Value::BoolValue(b)) => JsonValue::Bool(*b),
        Some(any_value::Value::IntValue(i)) => JsonValue::from(*i),
        Some(any_value::Value::DoubleValue(d)) => {
            serde_json::Number::from_f64(*d).map_or(JsonValue::Null, JsonValue::Number)
        }
        Some(any_value::Value::ArrayValue(arr)) => {
            JsonValue::Array(arr.values.iter().map(any_value_to_json).collect())
        }
        Some(any_value::Value::KvlistValue(kvlist)) => {
            let map: JsonMap<String, JsonValue> = kvlist
                .values
                .iter()
                .filter_map(|kv| {
                    kv.value
                        .as_ref()
                        .map(|v| (kv.key.clone(), any_value_to_json(v)))
                })
                .collect();
            JsonValue::Object(map)
        }
        Some(any_value::Value::BytesValue(b)) => JsonValue::String(hex::encode(b)),
        None => JsonValue::Null,
    }
}

/// Convert a KeyValue list to a flat JSON object (keys stay dotted)
pub fn attributes_to_flat_json(attrs: &[KeyValue]) -> JsonMap<String, JsonValue> {
    attrs
        .iter()
        .filter_map(|kv| {
            kv.value
                .as_ref()
                .map(|v| (kv.key.clone(), any_value_to_json(v)))
        })
        .collect()
}

/// Unflatten dotted keys into nested objects.
///
/// OTLP attributes arrive flat (`llm.token_count.prompt`); the stored
/// representation nests them (`{"llm": {"token_count": {"prompt": ...}}}`).
/// A dotted key whose prefix collides with an existing non-object value keeps
/// its flat form rather than clobbering the earlier value.
pub fn unflatten_attributes(flat: &JsonMap<String, JsonValue>) -> JsonValue {
    let mut root = JsonMap::new();

    for (key, value) in flat {
        if !key.contains('.') {
            root.insert(key.clone(), value.clone());
            continue;
        }
        if !set_nested_value(&mut root, key, value) {
            root.insert(key.clone(), value.clone());
        }
    }

    JsonValue::Object(root)
}

fn set_nested_value(root: &mut JsonMap<String, JsonValue>, path: &str, value: &JsonValue) -> bool {
    let parts: Vec<&str> = path.split('.').collect();
    let mut current = root;

    for (i, part) in parts.iter().enumerate() {
        if i == parts.len() - 1 {
            current.insert(part.to_string(), value.clone());
            return true;
        }

        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| JsonValue::Object(JsonMap::new()));
        match entry {
            JsonValue::Object(obj) => current = obj,
            _ => return false,
        }
    }

    false
}

fn flat_str(flat: &JsonMap<String, JsonValue>, key: &str) -> Option<String> {
    flat.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn flat_i64(flat: &JsonMap<String, JsonValue>, key: &str) -> i64 {
    match flat.get(key) {
        Some(JsonValue::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(JsonValue::String(s)) => s.parse().ok(),
        _ => None,
    }
    .unwrap_or(0)
}

// ============================================================================
// SPAN EXTRACTION
// ============================================================================

/// Convert one OTLP span into the domain model
pub fn extract_span(span: &OtlpSpan) -> Span {
    let flat = attributes_to_flat_json(&span.attributes);

    let kind = flat_str(&flat, keys::SPAN_KIND)
        .map(|s| SpanKind::parse(&s))
        .unwrap_or_default();
    let session_id = flat_str(&flat, keys::SESSION_ID).filter(|s| !s.is_empty());

    let status = span
        .status
        .as_ref()
        .map(|st| SpanStatus {
            code: match st.code {
                1 => SpanStatusCode::Ok,
                2 => SpanStatusCode::Error,
                _ => SpanStatusCode::Unset,
            },
            message: if st.message.is_empty() {
                None
            } else {
                Some(st.message.clone())
            },
        })
        .unwrap_or_default();

    let start_time = nanos_to_datetime(span.start_time_unix_nano);
    // A zero or regressed end timestamp is clamped to the start
    let end_time = if span.end_time_unix_nano > span.start_time_unix_nano {
        nanos_to_datetime(span.end_time_unix_nano)
    } else {
        start_time
    };

    let events = span
        .events
        .iter()
        .map(|event| SpanEvent {
            name: event.name.clone(),
            timestamp: nanos_to_datetime(event.time_unix_nano),
            attributes: JsonValue::Object(attributes_to_flat_json(&event.attributes)),
        })
        .collect();

    let own_prompt_tokens = flat_i64(&flat, keys::LLM_TOKEN_COUNT_PROMPT);
    let own_completion_tokens = flat_i64(&flat, keys::LLM_TOKEN_COUNT_COMPLETION);

    let mut extracted = Span {
        span_id: hex::encode(&span.span_id),
        trace_id: hex::encode(&span.trace_id),
        parent_span_id: if span.parent_span_id.is_empty() {
            None
        } else {
            Some(hex::encode(&span.parent_span_id))
        },
        name: span.name.clone(),
        kind,
        start_time,
        end_time,
        status,
        attributes: unflatten_attributes(&flat),
        events,
        session_id,
        cumulative_error_count: 0,
        cumulative_llm_token_count_prompt: own_prompt_tokens,
        cumulative_llm_token_count_completion: own_completion_tokens,
    };
    extracted.cumulative_error_count = extracted.own_error_count();
    extracted
}

/// One resource group of an export request, resolved to its project
#[derive(Debug, Clone)]
pub struct SpanGroup {
    pub project_name: String,
    pub spans: Vec<Span>,
}

/// Split an export request into per-resource groups of extracted spans
pub fn extract_resource_groups(request: &ExportTraceServiceRequest) -> Vec<SpanGroup> {
    request
        .resource_spans
        .iter()
        .map(|resource_spans| {
            let resource_attributes = resource_spans
                .resource
                .as_ref()
                .map(|r| r.attributes.as_slice())
                .unwrap_or(&[]);
            let project_name = resolve_project_name(resource_attributes);
            let spans = resource_spans
                .scope_spans
                .iter()
                .flat_map(|scope| scope.spans.iter().map(extract_span))
                .collect();
            SpanGroup {
                project_name,
                spans,
            }
        })
        .collect()
}

// ============================================================================
// EVALUATION EXTRACTION
// ============================================================================

/// A syntactically valid evaluation record that is semantically unusable
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidEvaluation {
    #[error("evaluation name must not be empty")]
    MissingName,
    #[error("evaluation subject is missing")]
    MissingSubject,
    #[error("unknown annotator kind: {0}")]
    UnknownAnnotatorKind(i32),
    #[error("metadata is not a JSON object: {0}")]
    BadMetadata(String),
}

/// Validate and convert a wire evaluation record into the domain model
pub fn evaluation_from_record(record: EvaluationRecord) -> Result<Evaluation, InvalidEvaluation> {
    if record.name.is_empty() {
        return Err(InvalidEvaluation::MissingName);
    }

    let subject = match record.subject.and_then(|s| s.kind) {
        Some(subject_ref::Kind::TraceId(trace_id)) if !trace_id.is_empty() => {
            EvaluationSubject::Trace(trace_id)
        }
        Some(subject_ref::Kind::SpanId(span_id)) if !span_id.is_empty() => {
            EvaluationSubject::Span(span_id)
        }
        Some(subject_ref::Kind::Document(doc)) if !doc.span_id.is_empty() => {
            EvaluationSubject::Document {
                span_id: doc.span_id,
                position: doc.document_position,
            }
        }
        _ => return Err(InvalidEvaluation::MissingSubject),
    };

    let annotator_kind = match proto::AnnotatorKind::try_from(record.annotator_kind) {
        Ok(proto::AnnotatorKind::Llm) => AnnotatorKind::Llm,
        Ok(proto::AnnotatorKind::Human) => AnnotatorKind::Human,
        Ok(proto::AnnotatorKind::Code) | Ok(proto::AnnotatorKind::Unspecified) => {
            AnnotatorKind::Code
        }
        Err(_) => return Err(InvalidEvaluation::UnknownAnnotatorKind(record.annotator_kind)),
    };

    let metadata = if record.metadata_json.is_empty() {
        JsonValue::Object(JsonMap::new())
    } else {
        match serde_json::from_str(&record.metadata_json) {
            Ok(value @ JsonValue::Object(_)) => value,
            Ok(other) => return Err(InvalidEvaluation::BadMetadata(other.to_string())),
            Err(e) => return Err(InvalidEvaluation::BadMetadata(e.to_string())),
        }
    };

    let result = record.result.unwrap_or_default();
    Ok(Evaluation {
        subject,
        name: record.name,
        annotator_kind,
        label: result.label,
        score: result.score,
        explanation: result.explanation,
        metadata,
    })
}
