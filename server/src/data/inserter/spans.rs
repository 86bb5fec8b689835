//! Span insertion kind
//!
//! Spans are the one kind whose dependencies are created rather than awaited:
//! the resolve step get-or-creates the project row and upserts the trace row
//! (a trace exists implicitly once any of its spans arrives), so a span never
//! postpones. The insert upserts by span id, making span delivery idempotent.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::Utc;

use super::{DataError, Db, EntityKind, InsertionKind};
use crate::data::sql::{Dialect, InsertStatement, OnConflict, UniqueKey};
use crate::domain::telemetry::Span;
use crate::utils::time::datetime_to_micros;

const UQ_PROJECTS_NAME: UniqueKey = UniqueKey {
    name: "uq_projects_name",
    columns: &["name"],
};

const UQ_SPANS_SPAN_ID: UniqueKey = UniqueKey {
    name: "uq_spans_span_id",
    columns: &["span_id"],
};

const SPAN_COLUMNS: &[&str] = &[
    "span_id",
    "trace_rowid",
    "parent_span_id",
    "name",
    "kind",
    "start_time",
    "end_time",
    "status_code",
    "status_message",
    "attributes",
    "events",
    "cumulative_error_count",
    "cumulative_llm_token_count_prompt",
    "cumulative_llm_token_count_completion",
];

const SPAN_UPDATE_COLUMNS: &[&str] = &[
    "trace_rowid",
    "parent_span_id",
    "name",
    "kind",
    "start_time",
    "end_time",
    "status_code",
    "status_message",
    "attributes",
    "events",
    "cumulative_error_count",
    "cumulative_llm_token_count_prompt",
    "cumulative_llm_token_count_completion",
];

/// Bind one span row in `SPAN_COLUMNS` order; shared across backends since
/// the bound value types are identical
macro_rules! bind_span_values {
    ($query:expr, $row:expr) => {{
        let span = &$row.span;
        $query
            .bind(span.span_id.clone())
            .bind($row.trace_rowid)
            .bind(span.parent_span_id.clone())
            .bind(span.name.clone())
            .bind(span.kind.as_str())
            .bind(datetime_to_micros(span.start_time))
            .bind(datetime_to_micros(span.end_time))
            .bind(span.status.code.as_str())
            .bind(span.status.message.clone())
            .bind(serde_json::to_string(&span.attributes).unwrap_or_else(|_| "{}".to_string()))
            .bind(serde_json::to_string(&span.events).unwrap_or_else(|_| "[]".to_string()))
            .bind(span.cumulative_error_count)
            .bind(span.cumulative_llm_token_count_prompt)
            .bind(span.cumulative_llm_token_count_completion)
    }};
}

/// A span plus the project it was resolved to at the collector
#[derive(Debug, Clone)]
pub struct SpanPrecursor {
    pub project_name: String,
    pub span: Span,
}

/// A span whose trace row exists, carrying the trace's database id
#[derive(Debug, Clone)]
pub struct SpanRow {
    trace_rowid: i64,
    span: Span,
}

/// Insertion strategy for spans
pub struct SpanInsertion;

#[async_trait]
impl InsertionKind for SpanInsertion {
    type Precursor = SpanPrecursor;
    type Insertable = SpanRow;

    fn entity(&self) -> EntityKind {
        EntityKind::Span
    }

    async fn resolve(
        &self,
        db: &Db,
        precursors: &[SpanPrecursor],
    ) -> Result<Vec<Option<SpanRow>>, DataError> {
        if precursors.is_empty() {
            return Ok(Vec::new());
        }
        let now = Utc::now().timestamp_micros();

        let project_names: BTreeSet<&str> =
            precursors.iter().map(|p| p.project_name.as_str()).collect();
        let project_ids = ensure_projects(db, &project_names, now).await?;

        // One upsert row per trace: widen the time window over the batch's
        // spans and keep the first session id seen
        let mut traces: BTreeMap<&str, TraceUpsert> = BTreeMap::new();
        for precursor in precursors {
            let Some(&project_id) = project_ids.get(precursor.project_name.as_str()) else {
                // The project row vanished between the two statements
                // (concurrent deletion); the span stays unresolved
                continue;
            };
            let span = &precursor.span;
            let start = datetime_to_micros(span.start_time);
            let end = datetime_to_micros(span.end_time);
            traces
                .entry(span.trace_id.as_str())
                .and_modify(|t| {
                    t.start_time = t.start_time.min(start);
                    t.end_time = t.end_time.max(end);
                    if t.session_id.is_none() {
                        t.session_id = span.session_id.clone();
                    }
                })
                .or_insert_with(|| TraceUpsert {
                    trace_id: span.trace_id.clone(),
                    project_id,
                    session_id: span.session_id.clone(),
                    start_time: start,
                    end_time: end,
                });
        }

        let trace_rowids = upsert_traces(db, traces.into_values().collect()).await?;

        Ok(precursors
            .iter()
            .map(|p| {
                trace_rowids.get(p.span.trace_id.as_str()).map(|&trace_rowid| SpanRow {
                    trace_rowid,
                    span: p.span.clone(),
                })
            })
            .collect())
    }

    async fn insert(&self, db: &Db, items: Vec<SpanRow>) -> Result<Vec<i64>, DataError> {
        // Collapse duplicate span ids to the last submission: two rows with
        // the same conflict target in one statement would abort the upsert
        let mut unique: HashMap<String, SpanRow> = HashMap::new();
        for row in items {
            unique.insert(row.span.span_id.clone(), row);
        }
        let rows: Vec<SpanRow> = unique.into_values().collect();

        let statement = InsertStatement::new("spans", SPAN_COLUMNS).unique_by(
            UQ_SPANS_SPAN_ID,
            OnConflict::DoUpdate {
                update_columns: SPAN_UPDATE_COLUMNS,
            },
        );
        let sql = statement.build(db.dialect(), rows.len());

        let ids: Vec<(i64,)> = match db {
            Db::Sqlite(pool) => {
                let mut query = sqlx::query_as::<_, (i64,)>(&sql);
                for row in &rows {
                    query = bind_span_values!(query, row);
                }
                query.fetch_all(pool).await.map_err(DataError::from_sqlite)?
            }
            Db::Postgres(pool) => {
                let mut query = sqlx::query_as::<_, (i64,)>(&sql);
                for row in &rows {
                    query = bind_span_values!(query, row);
                }
                query
                    .fetch_all(pool)
                    .await
                    .map_err(DataError::from_postgres)?
            }
        };

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }
}

struct TraceUpsert {
    trace_id: String,
    project_id: i64,
    session_id: Option<String>,
    start_time: i64,
    end_time: i64,
}

/// Get-or-create the project rows for every name, returning name → row id
async fn ensure_projects(
    db: &Db,
    names: &BTreeSet<&str>,
    now: i64,
) -> Result<HashMap<String, i64>, DataError> {
    let insert = InsertStatement::new("projects", &["name", "created_at"])
        .unique_by(UQ_PROJECTS_NAME, OnConflict::DoNothing)
        .build(db.dialect(), names.len());

    let select = format!(
        "SELECT name, id FROM projects WHERE name IN ({})",
        db.dialect().placeholder_list(1, names.len())
    );

    match db {
        Db::Sqlite(pool) => {
            let mut query = sqlx::query(&insert);
            for name in names {
                query = query.bind(name.to_string()).bind(now);
            }
            query.execute(pool).await.map_err(DataError::from_sqlite)?;

            let mut query = sqlx::query_as::<_, (String, i64)>(&select);
            for name in names {
                query = query.bind(name.to_string());
            }
            let rows = query.fetch_all(pool).await.map_err(DataError::from_sqlite)?;
            Ok(rows.into_iter().collect())
        }
        Db::Postgres(pool) => {
            let mut query = sqlx::query(&insert);
            for name in names {
                query = query.bind(name.to_string()).bind(now);
            }
            query.execute(pool).await.map_err(DataError::from_postgres)?;

            let mut query = sqlx::query_as::<_, (String, i64)>(&select);
            for name in names {
                query = query.bind(name.to_string());
            }
            let rows = query
                .fetch_all(pool)
                .await
                .map_err(DataError::from_postgres)?;
            Ok(rows.into_iter().collect())
        }
    }
}

/// Upsert trace rows, widening an existing trace's time window and filling a
/// missing session id. Returns trace_id → row id for the whole set.
async fn upsert_traces(
    db: &Db,
    traces: Vec<TraceUpsert>,
) -> Result<HashMap<String, i64>, DataError> {
    if traces.is_empty() {
        return Ok(HashMap::new());
    }
    let dialect = db.dialect();

    let rows = (0..traces.len())
        .map(|row| format!("({})", dialect.placeholder_list(row * 5 + 1, 5)))
        .collect::<Vec<_>>()
        .join(", ");
    let target = match dialect {
        Dialect::Sqlite => "(trace_id)".to_string(),
        Dialect::Postgres => "ON CONSTRAINT uq_traces_trace_id".to_string(),
    };
    let sql = format!(
        "INSERT INTO traces (trace_id, project_id, session_id, start_time, end_time) \
         VALUES {rows} \
         ON CONFLICT {target} DO UPDATE SET \
         session_id = COALESCE(traces.session_id, excluded.session_id), \
         start_time = {start}, \
         end_time = {end} \
         RETURNING trace_id, id",
        rows = rows,
        target = target,
        start = dialect.least("traces.start_time", "excluded.start_time"),
        end = dialect.greatest("traces.end_time", "excluded.end_time"),
    );

    let rows: Vec<(String, i64)> = match db {
        Db::Sqlite(pool) => {
            let mut query = sqlx::query_as::<_, (String, i64)>(&sql);
            for trace in &traces {
                query = query
                    .bind(trace.trace_id.clone())
                    .bind(trace.project_id)
                    .bind(trace.session_id.clone())
                    .bind(trace.start_time)
                    .bind(trace.end_time);
            }
            query.fetch_all(pool).await.map_err(DataError::from_sqlite)?
        }
        Db::Postgres(pool) => {
            let mut query = sqlx::query_as::<_, (String, i64)>(&sql);
            for trace in &traces {
                query = query
                    .bind(trace.trace_id.clone())
                    .bind(trace.project_id)
                    .bind(trace.session_id.clone())
                    .bind(trace.start_time)
                    .bind(trace.end_time);
            }
            query
                .fetch_all(pool)
                .await
                .map_err(DataError::from_postgres)?
        }
    };

    Ok(rows.into_iter().collect())
}
