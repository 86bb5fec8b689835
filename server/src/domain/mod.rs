//! Domain logic: decoded telemetry model and the in-memory trace buffer

pub mod telemetry;
pub mod traces;

pub use telemetry::{
    AnnotatorKind, Evaluation, EvaluationSubject, Span, SpanKind, SpanStatus, SpanStatusCode,
    TelemetryItem,
};
pub use traces::{Project, Traces};
