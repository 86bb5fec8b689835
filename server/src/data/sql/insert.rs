//! Conflict-aware insert statement builder
//!
//! Builds multi-row `INSERT ... ON CONFLICT ...` statements for both
//! dialects. PostgreSQL targets the named uniqueness constraint; SQLite only
//! supports column-list conflict targets, so it gets the column list. With no
//! uniqueness key the caller is asserting no conflict is possible and a plain
//! insert is emitted for both dialects.
//!
//! Pure string construction, no I/O; values are bound by the caller in
//! column-major-per-row order.

use super::Dialect;

/// A declared uniqueness constraint: its name (for the dialect that targets
/// constraints by name) and its column list (for the one that cannot)
#[derive(Debug, Clone, Copy)]
pub struct UniqueKey {
    pub name: &'static str,
    pub columns: &'static [&'static str],
}

/// Conflict resolution for rows that hit the uniqueness constraint
#[derive(Debug, Clone, Copy)]
pub enum OnConflict {
    DoNothing,
    /// Overwrite the listed columns from the incoming row
    DoUpdate {
        update_columns: &'static [&'static str],
    },
}

/// Builder for one batched insert
#[derive(Debug, Clone)]
pub struct InsertStatement {
    table: &'static str,
    columns: &'static [&'static str],
    unique_key: Option<UniqueKey>,
    on_conflict: OnConflict,
}

impl InsertStatement {
    pub fn new(table: &'static str, columns: &'static [&'static str]) -> Self {
        Self {
            table,
            columns,
            unique_key: None,
            on_conflict: OnConflict::DoNothing,
        }
    }

    pub fn unique_by(mut self, key: UniqueKey, on_conflict: OnConflict) -> Self {
        self.unique_key = Some(key);
        self.on_conflict = on_conflict;
        self
    }

    pub fn columns(&self) -> &'static [&'static str] {
        self.columns
    }

    /// Render the statement for `row_count` rows in the given dialect.
    /// The returned SQL ends with `RETURNING id`.
    pub fn build(&self, dialect: Dialect, row_count: usize) -> String {
        assert!(row_count > 0, "insert requires at least one row");

        let width = self.columns.len();
        let rows = (0..row_count)
            .map(|row| {
                format!(
                    "({})",
                    dialect.placeholder_list(row * width + 1, width)
                )
            })
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.table,
            self.columns.join(", "),
            rows
        );

        if let Some(key) = self.unique_key {
            // Conflict target: named constraint where supported, column list
            // otherwise
            let target = match dialect {
                Dialect::Sqlite => format!("({})", key.columns.join(", ")),
                Dialect::Postgres => format!("ON CONSTRAINT {}", key.name),
            };
            match self.on_conflict {
                OnConflict::DoNothing => {
                    sql.push_str(&format!(" ON CONFLICT {} DO NOTHING", target));
                }
                OnConflict::DoUpdate { update_columns } => {
                    let assignments = update_columns
                        .iter()
                        .map(|col| format!("{} = excluded.{}", col, col))
                        .collect::<Vec<_>>()
                        .join(", ");
                    sql.push_str(&format!(
                        " ON CONFLICT {} DO UPDATE SET {}",
                        target, assignments
                    ));
                }
            }
        }

        sql.push_str(" RETURNING id");
        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: UniqueKey = UniqueKey {
        name: "uq_things_a_b",
        columns: &["a", "b"],
    };

    #[test]
    fn test_plain_insert_without_unique_key() {
        let stmt = InsertStatement::new("things", &["a", "b"]);
        assert_eq!(
            stmt.build(Dialect::Sqlite, 1),
            "INSERT INTO things (a, b) VALUES (?, ?) RETURNING id"
        );
        assert_eq!(
            stmt.build(Dialect::Postgres, 1),
            "INSERT INTO things (a, b) VALUES ($1, $2) RETURNING id"
        );
    }

    #[test]
    fn test_multi_row_placeholder_numbering() {
        let stmt = InsertStatement::new("things", &["a", "b"]);
        assert_eq!(
            stmt.build(Dialect::Postgres, 3),
            "INSERT INTO things (a, b) VALUES ($1, $2), ($3, $4), ($5, $6) RETURNING id"
        );
        assert_eq!(
            stmt.build(Dialect::Sqlite, 2),
            "INSERT INTO things (a, b) VALUES (?, ?), (?, ?) RETURNING id"
        );
    }

    #[test]
    fn test_do_nothing_targets() {
        let stmt =
            InsertStatement::new("things", &["a", "b", "c"]).unique_by(KEY, OnConflict::DoNothing);
        assert_eq!(
            stmt.build(Dialect::Sqlite, 1),
            "INSERT INTO things (a, b, c) VALUES (?, ?, ?) \
             ON CONFLICT (a, b) DO NOTHING RETURNING id"
        );
        assert_eq!(
            stmt.build(Dialect::Postgres, 1),
            "INSERT INTO things (a, b, c) VALUES ($1, $2, $3) \
             ON CONFLICT ON CONSTRAINT uq_things_a_b DO NOTHING RETURNING id"
        );
    }

    #[test]
    fn test_do_update_sets_excluded_columns() {
        let stmt = InsertStatement::new("things", &["a", "b", "c"]).unique_by(
            KEY,
            OnConflict::DoUpdate {
                update_columns: &["c"],
            },
        );
        assert_eq!(
            stmt.build(Dialect::Sqlite, 2),
            "INSERT INTO things (a, b, c) VALUES (?, ?, ?), (?, ?, ?) \
             ON CONFLICT (a, b) DO UPDATE SET c = excluded.c RETURNING id"
        );
        assert_eq!(
            stmt.build(Dialect::Postgres, 1),
            "INSERT INTO things (a, b, c) VALUES ($1, $2, $3) \
             ON CONFLICT ON CONSTRAINT uq_things_a_b DO UPDATE SET c = excluded.c RETURNING id"
        );
    }

    #[test]
    #[should_panic(expected = "at least one row")]
    fn test_zero_rows_panics() {
        InsertStatement::new("things", &["a"]).build(Dialect::Sqlite, 0);
    }
}
