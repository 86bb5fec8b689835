//! PostgreSQL schema definitions
//!
//! Structurally identical to the SQLite schema. Uniqueness constraints carry
//! the names the insert builder targets with `ON CONFLICT ON CONSTRAINT`.

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Complete schema SQL for PostgreSQL
pub const SCHEMA: &str = r#"
-- =============================================================================
-- Infrastructure: Schema version tracking
-- =============================================================================
CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL,
    applied_at BIGINT NOT NULL,
    description TEXT
);

CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at BIGINT NOT NULL,
    checksum TEXT NOT NULL,
    execution_time_ms INTEGER,
    success BOOLEAN NOT NULL DEFAULT TRUE
);

-- =============================================================================
-- 1. Projects
-- =============================================================================
CREATE TABLE IF NOT EXISTS projects (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL CHECK(length(name) >= 1),
    created_at BIGINT NOT NULL,
    CONSTRAINT uq_projects_name UNIQUE (name)
);

-- =============================================================================
-- 2. Traces (created implicitly with the first span of the trace)
-- =============================================================================
CREATE TABLE IF NOT EXISTS traces (
    id BIGSERIAL PRIMARY KEY,
    trace_id TEXT NOT NULL,
    project_id BIGINT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    session_id TEXT,
    start_time BIGINT NOT NULL,
    end_time BIGINT NOT NULL,
    CONSTRAINT uq_traces_trace_id UNIQUE (trace_id)
);

CREATE INDEX IF NOT EXISTS idx_traces_project ON traces(project_id);
CREATE INDEX IF NOT EXISTS idx_traces_session ON traces(session_id);

-- =============================================================================
-- 3. Spans
-- =============================================================================
CREATE TABLE IF NOT EXISTS spans (
    id BIGSERIAL PRIMARY KEY,
    span_id TEXT NOT NULL,
    trace_rowid BIGINT NOT NULL REFERENCES traces(id) ON DELETE CASCADE,
    parent_span_id TEXT,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    start_time BIGINT NOT NULL,
    end_time BIGINT NOT NULL,
    status_code TEXT NOT NULL DEFAULT 'UNSET',
    status_message TEXT,
    attributes TEXT NOT NULL DEFAULT '{}',
    events TEXT NOT NULL DEFAULT '[]',
    cumulative_error_count BIGINT NOT NULL DEFAULT 0,
    cumulative_llm_token_count_prompt BIGINT NOT NULL DEFAULT 0,
    cumulative_llm_token_count_completion BIGINT NOT NULL DEFAULT 0,
    CONSTRAINT uq_spans_span_id UNIQUE (span_id)
);

CREATE INDEX IF NOT EXISTS idx_spans_trace ON spans(trace_rowid);
CREATE INDEX IF NOT EXISTS idx_spans_parent ON spans(parent_span_id);
CREATE INDEX IF NOT EXISTS idx_spans_start_time ON spans(start_time);

-- =============================================================================
-- 4. Annotations (one row per (subject, name) identity)
-- =============================================================================
CREATE TABLE IF NOT EXISTS trace_annotations (
    id BIGSERIAL PRIMARY KEY,
    trace_rowid BIGINT NOT NULL REFERENCES traces(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    label TEXT,
    score DOUBLE PRECISION,
    explanation TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    annotator_kind TEXT NOT NULL CHECK(annotator_kind IN ('LLM', 'CODE', 'HUMAN')),
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL,
    CONSTRAINT uq_trace_annotations_trace_rowid_name UNIQUE (trace_rowid, name)
);

CREATE TABLE IF NOT EXISTS span_annotations (
    id BIGSERIAL PRIMARY KEY,
    span_rowid BIGINT NOT NULL REFERENCES spans(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    label TEXT,
    score DOUBLE PRECISION,
    explanation TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    annotator_kind TEXT NOT NULL CHECK(annotator_kind IN ('LLM', 'CODE', 'HUMAN')),
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL,
    CONSTRAINT uq_span_annotations_span_rowid_name UNIQUE (span_rowid, name)
);

CREATE TABLE IF NOT EXISTS document_annotations (
    id BIGSERIAL PRIMARY KEY,
    span_rowid BIGINT NOT NULL REFERENCES spans(id) ON DELETE CASCADE,
    document_position BIGINT NOT NULL,
    name TEXT NOT NULL,
    label TEXT,
    score DOUBLE PRECISION,
    explanation TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    annotator_kind TEXT NOT NULL CHECK(annotator_kind IN ('LLM', 'CODE', 'HUMAN')),
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL,
    CONSTRAINT uq_document_annotations_span_rowid_position_name
        UNIQUE (span_rowid, document_position, name)
);

CREATE INDEX IF NOT EXISTS idx_trace_annotations_name ON trace_annotations(name);
CREATE INDEX IF NOT EXISTS idx_span_annotations_name ON span_annotations(name);
CREATE INDEX IF NOT EXISTS idx_document_annotations_name ON document_annotations(name);
"#;
