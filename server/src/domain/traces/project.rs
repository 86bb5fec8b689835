//! Per-project in-memory telemetry state
//!
//! A `Project` is mutated exclusively by its own dispatcher worker task;
//! readers (the stats route, tests, a future read API) take the inner lock
//! themselves. Spans are immutable after ingestion except for the cumulative
//! roll-up counters, which are recomputed as descendants arrive.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::domain::telemetry::{Evaluation, EvaluationSubject, Span};

#[derive(Default)]
struct TraceState {
    span_ids: Vec<String>,
    session_id: Option<String>,
}

#[derive(Default)]
struct ProjectState {
    spans: HashMap<String, Span>,
    /// Span ids in arrival order
    span_order: Vec<String>,
    traces: HashMap<String, TraceState>,
    evaluations: HashMap<(EvaluationSubject, String), Evaluation>,
}

/// Derived view of one trace, computed from its member spans
#[derive(Debug, Clone, Serialize)]
pub struct TraceSummary {
    pub trace_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub latency_ms: i64,
    pub session_id: Option<String>,
    pub span_count: usize,
}

pub struct Project {
    name: String,
    state: RwLock<ProjectState>,
    #[cfg(test)]
    add_delay: RwLock<Option<std::time::Duration>>,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(ProjectState::default()),
            #[cfg(test)]
            add_delay: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a span; a span with an already-known id replaces the earlier copy.
    /// Roll-up counters of the span's trace are recomputed afterwards.
    pub fn add_span(&self, span: Span) {
        #[cfg(test)]
        if let Some(delay) = *self.add_delay.read() {
            std::thread::sleep(delay);
        }

        let mut state = self.state.write();
        let trace_id = span.trace_id.clone();
        let span_id = span.span_id.clone();

        let trace = state.traces.entry(trace_id.clone()).or_default();
        if let Some(session_id) = &span.session_id {
            trace.session_id = Some(session_id.clone());
        }
        if !trace.span_ids.contains(&span_id) {
            trace.span_ids.push(span_id.clone());
        }

        if state.spans.insert(span_id.clone(), span).is_none() {
            state.span_order.push(span_id);
        }

        recompute_rollups(&mut state, &trace_id);
    }

    /// Add an evaluation; a later evaluation with the same (subject, name)
    /// identity supersedes the earlier one.
    pub fn add_evaluation(&self, evaluation: Evaluation) {
        #[cfg(test)]
        if let Some(delay) = *self.add_delay.read() {
            std::thread::sleep(delay);
        }

        let mut state = self.state.write();
        state.evaluations.insert(evaluation.identity(), evaluation);
    }

    // ========================================================================
    // READ ACCESS
    // ========================================================================

    pub fn span_count(&self) -> usize {
        self.state.read().spans.len()
    }

    pub fn trace_count(&self) -> usize {
        self.state.read().traces.len()
    }

    pub fn evaluation_count(&self) -> usize {
        self.state.read().evaluations.len()
    }

    pub fn get_span(&self, span_id: &str) -> Option<Span> {
        self.state.read().spans.get(span_id).cloned()
    }

    /// Span names in arrival order
    pub fn span_names(&self) -> Vec<String> {
        let state = self.state.read();
        state
            .span_order
            .iter()
            .filter_map(|id| state.spans.get(id).map(|s| s.name.clone()))
            .collect()
    }

    pub fn get_evaluation(&self, subject: &EvaluationSubject, name: &str) -> Option<Evaluation> {
        self.state
            .read()
            .evaluations
            .get(&(subject.clone(), name.to_string()))
            .cloned()
    }

    /// Derived trace attributes; `None` if no span of the trace has arrived
    pub fn get_trace(&self, trace_id: &str) -> Option<TraceSummary> {
        let state = self.state.read();
        let trace = state.traces.get(trace_id)?;
        let spans: Vec<&Span> = trace
            .span_ids
            .iter()
            .filter_map(|id| state.spans.get(id))
            .collect();
        let start_time = spans.iter().map(|s| s.start_time).min()?;
        let end_time = spans.iter().map(|s| s.end_time).max()?;
        Some(TraceSummary {
            trace_id: trace_id.to_string(),
            start_time,
            end_time,
            latency_ms: (end_time - start_time).num_milliseconds(),
            session_id: trace.session_id.clone(),
            span_count: spans.len(),
        })
    }

    #[cfg(test)]
    pub fn set_add_delay(&self, delay: std::time::Duration) {
        *self.add_delay.write() = Some(delay);
    }
}

/// Recompute cumulative counters for every span of one trace.
///
/// cumulative(span) = own contribution + sum of children's cumulative values,
/// computed bottom-up. Spans whose parent has not arrived yet count as roots.
fn recompute_rollups(state: &mut ProjectState, trace_id: &str) {
    let Some(trace) = state.traces.get(trace_id) else {
        return;
    };
    let span_ids = trace.span_ids.clone();

    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    for id in &span_ids {
        if let Some(span) = state.spans.get(id)
            && let Some(parent) = &span.parent_span_id
        {
            children.entry(parent.as_str()).or_default().push(id);
        }
    }

    let mut totals: HashMap<String, (i64, i64, i64)> = HashMap::new();
    let mut visiting = HashSet::new();
    for id in &span_ids {
        cumulative(id, &state.spans, &children, &mut totals, &mut visiting);
    }

    for (id, (errors, prompt, completion)) in totals {
        if let Some(span) = state.spans.get_mut(&id) {
            span.cumulative_error_count = errors;
            span.cumulative_llm_token_count_prompt = prompt;
            span.cumulative_llm_token_count_completion = completion;
        }
    }
}

fn cumulative(
    span_id: &str,
    spans: &HashMap<String, Span>,
    children: &HashMap<&str, Vec<&str>>,
    totals: &mut HashMap<String, (i64, i64, i64)>,
    visiting: &mut HashSet<String>,
) -> (i64, i64, i64) {
    if let Some(total) = totals.get(span_id) {
        return *total;
    }
    // Cycle guard: a malformed parent chain must not recurse forever
    if !visiting.insert(span_id.to_string()) {
        return (0, 0, 0);
    }

    let own = match spans.get(span_id) {
        Some(span) => {
            let flat = span.attributes.pointer("/llm/token_count");
            let own_prompt = flat
                .and_then(|v| v.get("prompt"))
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            let own_completion = flat
                .and_then(|v| v.get("completion"))
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            (span.own_error_count(), own_prompt, own_completion)
        }
        None => (0, 0, 0),
    };

    let mut total = own;
    if let Some(child_ids) = children.get(span_id) {
        for child in child_ids {
            let (e, p, c) = cumulative(child, spans, children, totals, visiting);
            total.0 += e;
            total.1 += p;
            total.2 += c;
        }
    }

    visiting.remove(span_id);
    totals.insert(span_id.to_string(), total);
    total
}
