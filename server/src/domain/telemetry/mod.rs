//! Decoded telemetry model
//!
//! Language-neutral in-memory representation of spans and evaluations,
//! produced by the collector endpoints and consumed by the trace buffer and
//! the insertion engines. OTLP protobuf stays at the API boundary; everything
//! downstream works on these types.

pub mod extract;
pub mod proto;

#[cfg(test)]
pub(crate) mod extract_tests;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

// ============================================================================
// SPANS
// ============================================================================

/// Observation kind of a span, from the `openinference.span.kind` attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpanKind {
    Llm,
    Chain,
    Retriever,
    Embedding,
    Tool,
    Agent,
    Reranker,
    Evaluator,
    Guardrail,
    #[default]
    Unknown,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Llm => "LLM",
            Self::Chain => "CHAIN",
            Self::Retriever => "RETRIEVER",
            Self::Embedding => "EMBEDDING",
            Self::Tool => "TOOL",
            Self::Agent => "AGENT",
            Self::Reranker => "RERANKER",
            Self::Evaluator => "EVALUATOR",
            Self::Guardrail => "GUARDRAIL",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "LLM" => Self::Llm,
            "CHAIN" => Self::Chain,
            "RETRIEVER" => Self::Retriever,
            "EMBEDDING" => Self::Embedding,
            "TOOL" => Self::Tool,
            "AGENT" => Self::Agent,
            "RERANKER" => Self::Reranker,
            "EVALUATOR" => Self::Evaluator,
            "GUARDRAIL" => Self::Guardrail,
            _ => Self::Unknown,
        }
    }
}

/// Span status per the OTLP status code set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpanStatusCode {
    #[default]
    Unset,
    Ok,
    Error,
}

impl SpanStatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "UNSET",
            Self::Ok => "OK",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SpanStatus {
    pub code: SpanStatusCode,
    pub message: Option<String>,
}

/// Timestamped event attached to a span (includes structured exceptions)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub attributes: JsonValue,
}

impl SpanEvent {
    /// Exception events follow the OTLP `exception` semantic convention
    pub fn is_exception(&self) -> bool {
        self.name == "exception"
    }
}

/// One timed unit of work within a trace.
///
/// Immutable after ingestion except for the cumulative roll-up counters,
/// which are recomputed by the owning project as descendants arrive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub span_id: String,
    pub trace_id: String,
    pub parent_span_id: Option<String>,
    pub name: String,
    pub kind: SpanKind,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: SpanStatus,
    /// Nested JSON attributes, unflattened from dotted OTLP keys
    pub attributes: JsonValue,
    pub events: Vec<SpanEvent>,
    pub session_id: Option<String>,
    pub cumulative_error_count: i64,
    pub cumulative_llm_token_count_prompt: i64,
    pub cumulative_llm_token_count_completion: i64,
}

impl Span {
    /// Error/token contribution of this span alone, before roll-up
    pub fn own_error_count(&self) -> i64 {
        if self.status.code == SpanStatusCode::Error {
            1
        } else {
            0
        }
    }

    pub fn latency_ms(&self) -> i64 {
        (self.end_time - self.start_time).num_milliseconds()
    }
}

// ============================================================================
// EVALUATIONS
// ============================================================================

/// Who produced an evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum AnnotatorKind {
    Llm,
    #[default]
    Code,
    Human,
}

impl AnnotatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Llm => "LLM",
            Self::Code => "CODE",
            Self::Human => "HUMAN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LLM" => Some(Self::Llm),
            "CODE" => Some(Self::Code),
            "HUMAN" => Some(Self::Human),
            _ => None,
        }
    }
}

/// What an evaluation judges: a trace, a span, or one retrieved document
/// within a span
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EvaluationSubject {
    Trace(String),
    Span(String),
    Document { span_id: String, position: i64 },
}

/// A named judgment attached to exactly one subject.
///
/// Identity for upsert purposes is `(subject, name)`; a later evaluation with
/// the same identity supersedes the earlier one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub subject: EvaluationSubject,
    pub name: String,
    pub annotator_kind: AnnotatorKind,
    pub label: Option<String>,
    pub score: Option<f64>,
    pub explanation: Option<String>,
    pub metadata: JsonValue,
}

impl Evaluation {
    /// Upsert identity: (subject, name)
    pub fn identity(&self) -> (EvaluationSubject, String) {
        (self.subject.clone(), self.name.clone())
    }
}

// ============================================================================
// DISPATCH ITEMS
// ============================================================================

/// One item accepted by `Traces::put`; queue choice is by variant
#[derive(Debug, Clone)]
pub enum TelemetryItem {
    Span(Span),
    Evaluation(Evaluation),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_kind_parse_roundtrip() {
        for kind in [
            SpanKind::Llm,
            SpanKind::Chain,
            SpanKind::Retriever,
            SpanKind::Embedding,
            SpanKind::Tool,
            SpanKind::Agent,
            SpanKind::Reranker,
            SpanKind::Evaluator,
            SpanKind::Guardrail,
        ] {
            assert_eq!(SpanKind::parse(kind.as_str()), kind);
        }
        assert_eq!(SpanKind::parse("something else"), SpanKind::Unknown);
        assert_eq!(SpanKind::parse("llm"), SpanKind::Llm);
    }

    #[test]
    fn test_annotator_kind_parse() {
        assert_eq!(AnnotatorKind::parse("human"), Some(AnnotatorKind::Human));
        assert_eq!(AnnotatorKind::parse("LLM"), Some(AnnotatorKind::Llm));
        assert_eq!(AnnotatorKind::parse("robot"), None);
    }

    #[test]
    fn test_evaluation_identity_distinguishes_subjects() {
        let eval = |subject| Evaluation {
            subject,
            name: "correctness".into(),
            annotator_kind: AnnotatorKind::Llm,
            label: None,
            score: Some(1.0),
            explanation: None,
            metadata: serde_json::json!({}),
        };
        let a = eval(EvaluationSubject::Trace("t1".into()));
        let b = eval(EvaluationSubject::Span("t1".into()));
        assert_ne!(a.identity(), b.identity());
    }
}
