//! Annotation insertion kinds
//!
//! Trace, span, and document annotations share one shape: a named judgment
//! with a foreign key to the subject's row. The subject row may not have been
//! committed yet when the annotation arrives, so the resolve step looks up
//! the current row ids in one batched query and unresolved items are left to
//! the engine's postponement machinery. Identity for upsert purposes is the
//! (subject, name) tuple declared by each table's uniqueness constraint.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;

use super::{DataError, Db, EntityKind, InsertionKind};
use crate::data::sql::{InsertStatement, OnConflict, UniqueKey};
use crate::domain::telemetry::{AnnotatorKind, Evaluation};

const UQ_TRACE_ANNOTATIONS: UniqueKey = UniqueKey {
    name: "uq_trace_annotations_trace_rowid_name",
    columns: &["trace_rowid", "name"],
};

const UQ_SPAN_ANNOTATIONS: UniqueKey = UniqueKey {
    name: "uq_span_annotations_span_rowid_name",
    columns: &["span_rowid", "name"],
};

const UQ_DOCUMENT_ANNOTATIONS: UniqueKey = UniqueKey {
    name: "uq_document_annotations_span_rowid_position_name",
    columns: &["span_rowid", "document_position", "name"],
};

const ANNOTATION_UPDATE_COLUMNS: &[&str] = &[
    "label",
    "score",
    "explanation",
    "metadata",
    "annotator_kind",
    "updated_at",
];

/// The judgment itself, shared by all three annotation kinds
#[derive(Debug, Clone)]
pub struct AnnotationData {
    pub name: String,
    pub annotator_kind: AnnotatorKind,
    pub label: Option<String>,
    pub score: Option<f64>,
    pub explanation: Option<String>,
    pub metadata: JsonValue,
}

impl From<&Evaluation> for AnnotationData {
    fn from(evaluation: &Evaluation) -> Self {
        Self {
            name: evaluation.name.clone(),
            annotator_kind: evaluation.annotator_kind,
            label: evaluation.label.clone(),
            score: evaluation.score,
            explanation: evaluation.explanation.clone(),
            metadata: evaluation.metadata.clone(),
        }
    }
}

impl AnnotationData {
    fn metadata_json(&self) -> String {
        serde_json::to_string(&self.metadata).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Bind one annotation row: FK columns first, then the shared value columns
macro_rules! bind_annotation_values {
    ($query:expr, $data:expr, $now:expr $(, $fk:expr)+) => {{
        let query = $query $(.bind($fk))+;
        query
            .bind($data.name.clone())
            .bind($data.label.clone())
            .bind($data.score)
            .bind($data.explanation.clone())
            .bind($data.metadata_json())
            .bind($data.annotator_kind.as_str())
            .bind($now)
            .bind($now)
    }};
}

/// Run a batched upsert over both backends, binding rows with `$bind`.
///
/// The bind step is passed in closure syntax but expanded to `let` bindings in
/// each match arm: the backend-specific `query` type differs between the Sqlite
/// and Postgres arms, so a real closure parameter cannot be given one type that
/// satisfies both. Binding `query`/`row`/`now` as locals lets each arm infer the
/// type from its own `query_as` value.
macro_rules! fetch_annotation_ids {
    ($db:expr, $sql:expr, $rows:expr, $now:expr,
     |$q:ident, $r:ident : &$rt:ty, $n:ident| $body:block) => {{
        match $db {
            Db::Sqlite(pool) => {
                let mut query = sqlx::query_as::<_, (i64,)>(&$sql);
                for row in &$rows {
                    let $n = $now;
                    let $r: &$rt = row;
                    query = {
                        let $q = query;
                        $body
                    };
                }
                query.fetch_all(pool).await.map_err(DataError::from_sqlite)
            }
            Db::Postgres(pool) => {
                let mut query = sqlx::query_as::<_, (i64,)>(&$sql);
                for row in &$rows {
                    let $n = $now;
                    let $r: &$rt = row;
                    query = {
                        let $q = query;
                        $body
                    };
                }
                query.fetch_all(pool).await.map_err(DataError::from_postgres)
            }
        }
    }};
}

// ============================================================================
// BATCHED SUBJECT LOOKUPS
// ============================================================================

/// Current trace row ids for a set of wire trace ids, in one query
async fn lookup_trace_rowids(
    db: &Db,
    trace_ids: &BTreeSet<&str>,
) -> Result<HashMap<String, i64>, DataError> {
    if trace_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let sql = format!(
        "SELECT trace_id, id FROM traces WHERE trace_id IN ({})",
        db.dialect().placeholder_list(1, trace_ids.len())
    );
    lookup_rowids(db, &sql, trace_ids).await
}

/// Current span row ids for a set of wire span ids, in one query
async fn lookup_span_rowids(
    db: &Db,
    span_ids: &BTreeSet<&str>,
) -> Result<HashMap<String, i64>, DataError> {
    if span_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let sql = format!(
        "SELECT span_id, id FROM spans WHERE span_id IN ({})",
        db.dialect().placeholder_list(1, span_ids.len())
    );
    lookup_rowids(db, &sql, span_ids).await
}

async fn lookup_rowids(
    db: &Db,
    sql: &str,
    keys: &BTreeSet<&str>,
) -> Result<HashMap<String, i64>, DataError> {
    let rows: Vec<(String, i64)> = match db {
        Db::Sqlite(pool) => {
            let mut query = sqlx::query_as::<_, (String, i64)>(sql);
            for key in keys {
                query = query.bind(key.to_string());
            }
            query.fetch_all(pool).await.map_err(DataError::from_sqlite)?
        }
        Db::Postgres(pool) => {
            let mut query = sqlx::query_as::<_, (String, i64)>(sql);
            for key in keys {
                query = query.bind(key.to_string());
            }
            query
                .fetch_all(pool)
                .await
                .map_err(DataError::from_postgres)?
        }
    };
    Ok(rows.into_iter().collect())
}

// ============================================================================
// TRACE ANNOTATIONS
// ============================================================================

/// An annotation awaiting the database row id of its trace
#[derive(Debug, Clone)]
pub struct TraceAnnotationPrecursor {
    pub trace_id: String,
    pub data: AnnotationData,
}

#[derive(Debug, Clone)]
pub struct TraceAnnotationRow {
    trace_rowid: i64,
    data: AnnotationData,
}

pub struct TraceAnnotationInsertion;

#[async_trait]
impl InsertionKind for TraceAnnotationInsertion {
    type Precursor = TraceAnnotationPrecursor;
    type Insertable = TraceAnnotationRow;

    fn entity(&self) -> EntityKind {
        EntityKind::TraceAnnotation
    }

    async fn resolve(
        &self,
        db: &Db,
        precursors: &[TraceAnnotationPrecursor],
    ) -> Result<Vec<Option<TraceAnnotationRow>>, DataError> {
        let trace_ids: BTreeSet<&str> = precursors.iter().map(|p| p.trace_id.as_str()).collect();
        let rowids = lookup_trace_rowids(db, &trace_ids).await?;
        Ok(precursors
            .iter()
            .map(|p| {
                rowids.get(p.trace_id.as_str()).map(|&trace_rowid| TraceAnnotationRow {
                    trace_rowid,
                    data: p.data.clone(),
                })
            })
            .collect())
    }

    async fn insert(
        &self,
        db: &Db,
        items: Vec<TraceAnnotationRow>,
    ) -> Result<Vec<i64>, DataError> {
        // Last submission wins within one batch
        let mut unique: HashMap<(i64, String), TraceAnnotationRow> = HashMap::new();
        for row in items {
            unique.insert((row.trace_rowid, row.data.name.clone()), row);
        }
        let rows: Vec<TraceAnnotationRow> = unique.into_values().collect();

        let statement = InsertStatement::new(
            "trace_annotations",
            &[
                "trace_rowid",
                "name",
                "label",
                "score",
                "explanation",
                "metadata",
                "annotator_kind",
                "created_at",
                "updated_at",
            ],
        )
        .unique_by(
            UQ_TRACE_ANNOTATIONS,
            OnConflict::DoUpdate {
                update_columns: ANNOTATION_UPDATE_COLUMNS,
            },
        );
        let sql = statement.build(db.dialect(), rows.len());
        let now = Utc::now().timestamp_micros();

        let ids = fetch_annotation_ids!(db, sql, rows, now, |query, row: &TraceAnnotationRow, now| {
            bind_annotation_values!(query, row.data, now, row.trace_rowid)
        })?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }
}

// ============================================================================
// SPAN ANNOTATIONS
// ============================================================================

/// An annotation awaiting the database row id of its span
#[derive(Debug, Clone)]
pub struct SpanAnnotationPrecursor {
    pub span_id: String,
    pub data: AnnotationData,
}

#[derive(Debug, Clone)]
pub struct SpanAnnotationRow {
    span_rowid: i64,
    data: AnnotationData,
}

pub struct SpanAnnotationInsertion;

#[async_trait]
impl InsertionKind for SpanAnnotationInsertion {
    type Precursor = SpanAnnotationPrecursor;
    type Insertable = SpanAnnotationRow;

    fn entity(&self) -> EntityKind {
        EntityKind::SpanAnnotation
    }

    async fn resolve(
        &self,
        db: &Db,
        precursors: &[SpanAnnotationPrecursor],
    ) -> Result<Vec<Option<SpanAnnotationRow>>, DataError> {
        let span_ids: BTreeSet<&str> = precursors.iter().map(|p| p.span_id.as_str()).collect();
        let rowids = lookup_span_rowids(db, &span_ids).await?;
        Ok(precursors
            .iter()
            .map(|p| {
                rowids.get(p.span_id.as_str()).map(|&span_rowid| SpanAnnotationRow {
                    span_rowid,
                    data: p.data.clone(),
                })
            })
            .collect())
    }

    async fn insert(
        &self,
        db: &Db,
        items: Vec<SpanAnnotationRow>,
    ) -> Result<Vec<i64>, DataError> {
        let mut unique: HashMap<(i64, String), SpanAnnotationRow> = HashMap::new();
        for row in items {
            unique.insert((row.span_rowid, row.data.name.clone()), row);
        }
        let rows: Vec<SpanAnnotationRow> = unique.into_values().collect();

        let statement = InsertStatement::new(
            "span_annotations",
            &[
                "span_rowid",
                "name",
                "label",
                "score",
                "explanation",
                "metadata",
                "annotator_kind",
                "created_at",
                "updated_at",
            ],
        )
        .unique_by(
            UQ_SPAN_ANNOTATIONS,
            OnConflict::DoUpdate {
                update_columns: ANNOTATION_UPDATE_COLUMNS,
            },
        );
        let sql = statement.build(db.dialect(), rows.len());
        let now = Utc::now().timestamp_micros();

        let ids = fetch_annotation_ids!(db, sql, rows, now, |query, row: &SpanAnnotationRow, now| {
            bind_annotation_values!(query, row.data, now, row.span_rowid)
        })?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }
}

// ============================================================================
// DOCUMENT ANNOTATIONS
// ============================================================================

/// An annotation of one retrieved document within a span
#[derive(Debug, Clone)]
pub struct DocumentAnnotationPrecursor {
    pub span_id: String,
    pub document_position: i64,
    pub data: AnnotationData,
}

#[derive(Debug, Clone)]
pub struct DocumentAnnotationRow {
    span_rowid: i64,
    document_position: i64,
    data: AnnotationData,
}

pub struct DocumentAnnotationInsertion;

#[async_trait]
impl InsertionKind for DocumentAnnotationInsertion {
    type Precursor = DocumentAnnotationPrecursor;
    type Insertable = DocumentAnnotationRow;

    fn entity(&self) -> EntityKind {
        EntityKind::DocumentAnnotation
    }

    async fn resolve(
        &self,
        db: &Db,
        precursors: &[DocumentAnnotationPrecursor],
    ) -> Result<Vec<Option<DocumentAnnotationRow>>, DataError> {
        let span_ids: BTreeSet<&str> = precursors.iter().map(|p| p.span_id.as_str()).collect();
        let rowids = lookup_span_rowids(db, &span_ids).await?;
        Ok(precursors
            .iter()
            .map(|p| {
                rowids
                    .get(p.span_id.as_str())
                    .map(|&span_rowid| DocumentAnnotationRow {
                        span_rowid,
                        document_position: p.document_position,
                        data: p.data.clone(),
                    })
            })
            .collect())
    }

    async fn insert(
        &self,
        db: &Db,
        items: Vec<DocumentAnnotationRow>,
    ) -> Result<Vec<i64>, DataError> {
        let mut unique: HashMap<(i64, i64, String), DocumentAnnotationRow> = HashMap::new();
        for row in items {
            unique.insert(
                (row.span_rowid, row.document_position, row.data.name.clone()),
                row,
            );
        }
        let rows: Vec<DocumentAnnotationRow> = unique.into_values().collect();

        let statement = InsertStatement::new(
            "document_annotations",
            &[
                "span_rowid",
                "document_position",
                "name",
                "label",
                "score",
                "explanation",
                "metadata",
                "annotator_kind",
                "created_at",
                "updated_at",
            ],
        )
        .unique_by(
            UQ_DOCUMENT_ANNOTATIONS,
            OnConflict::DoUpdate {
                update_columns: ANNOTATION_UPDATE_COLUMNS,
            },
        );
        let sql = statement.build(db.dialect(), rows.len());
        let now = Utc::now().timestamp_micros();

        let ids =
            fetch_annotation_ids!(db, sql, rows, now, |query, row: &DocumentAnnotationRow, now| {
                bind_annotation_values!(query, row.data, now, row.span_rowid, row.document_position)
            })?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }
}
