//! Wire envelope for evaluation records
//!
//! Evaluations travel over the HTTP transport only, in a small envelope that
//! follows the same encoding rules as the OTLP trace envelope (protobuf or
//! JSON body, identity/gzip/deflate content encoding). The messages are
//! declared by hand rather than generated; the field numbers are the schema.

use serde::{Deserialize, Serialize};

/// A batch of evaluation records
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExportEvaluationRequest {
    #[prost(message, repeated, tag = "1")]
    pub evaluations: Vec<EvaluationRecord>,
}

/// One named judgment attached to a trace, span, or document position
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EvaluationRecord {
    /// Evaluation name, e.g. "correctness"; part of the upsert identity
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub subject: Option<SubjectRef>,
    #[prost(message, optional, tag = "3")]
    pub result: Option<EvaluationResult>,
    #[prost(enumeration = "AnnotatorKind", tag = "4")]
    pub annotator_kind: i32,
    /// Arbitrary metadata as a JSON object, serialized to text
    #[prost(string, tag = "5")]
    pub metadata_json: String,
}

/// Reference to the subject row the evaluation judges
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SubjectRef {
    #[prost(oneof = "subject_ref::Kind", tags = "1, 2, 3")]
    pub kind: Option<subject_ref::Kind>,
}

pub mod subject_ref {
    use serde::{Deserialize, Serialize};

    #[derive(Clone, PartialEq, ::prost::Oneof, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub enum Kind {
        /// Hex trace id, as rendered in the span envelope
        #[prost(string, tag = "1")]
        TraceId(String),
        /// Hex span id
        #[prost(string, tag = "2")]
        SpanId(String),
        /// A (span, retrieved-document position) pair
        #[prost(message, tag = "3")]
        Document(super::DocumentRef),
    }
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DocumentRef {
    #[prost(string, tag = "1")]
    pub span_id: String,
    /// Zero-based position of the document in the span's retrieval output
    #[prost(int64, tag = "2")]
    pub document_position: i64,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EvaluationResult {
    #[prost(string, optional, tag = "1")]
    pub label: Option<String>,
    #[prost(double, optional, tag = "2")]
    pub score: Option<f64>,
    #[prost(string, optional, tag = "3")]
    pub explanation: Option<String>,
}

/// Empty response, mirroring the OTLP export response shape
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExportEvaluationResponse {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum AnnotatorKind {
    Unspecified = 0,
    Llm = 1,
    Code = 2,
    Human = 3,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    fn sample_record() -> EvaluationRecord {
        EvaluationRecord {
            name: "correctness".to_string(),
            subject: Some(SubjectRef {
                kind: Some(subject_ref::Kind::TraceId("0af7651916cd43dd".to_string())),
            }),
            result: Some(EvaluationResult {
                label: Some("correct".to_string()),
                score: Some(0.9),
                explanation: None,
            }),
            annotator_kind: AnnotatorKind::Llm as i32,
            metadata_json: "{}".to_string(),
        }
    }

    #[test]
    fn test_protobuf_roundtrip() {
        let request = ExportEvaluationRequest {
            evaluations: vec![sample_record()],
        };
        let bytes = request.encode_to_vec();
        let decoded = ExportEvaluationRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_json_roundtrip() {
        let request = ExportEvaluationRequest {
            evaluations: vec![sample_record()],
        };
        let json = serde_json::to_string(&request).unwrap();
        let decoded: ExportEvaluationRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_empty_body_is_valid_protobuf() {
        let decoded = ExportEvaluationRequest::decode(&[][..]).unwrap();
        assert!(decoded.evaluations.is_empty());
    }

    #[test]
    fn test_annotator_kind_try_from() {
        assert_eq!(AnnotatorKind::try_from(1), Ok(AnnotatorKind::Llm));
        assert_eq!(AnnotatorKind::try_from(3), Ok(AnnotatorKind::Human));
        assert!(AnnotatorKind::try_from(99).is_err());
    }
}
