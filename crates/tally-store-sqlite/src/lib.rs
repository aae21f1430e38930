#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tally_core::{format_rfc3339, now_utc, parse_rfc3339_utc, Counter, CounterError};

const COUNTER_MIGRATION_VERSION: i64 = 1;

const SCHEMA_COUNTERS_V1: &str = r"
CREATE TABLE IF NOT EXISTS counters (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  site_id TEXT NOT NULL CHECK (length(site_id) > 0),
  url TEXT NOT NULL CHECK (length(url) > 0),
  key TEXT NOT NULL CHECK (length(key) > 0),
  num INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE (site_id, url, key)
);

CREATE INDEX IF NOT EXISTS idx_counters_site_url
  ON counters(site_id, url);
";

const SELECT_COUNTER_COLUMNS: &str =
    "SELECT id, site_id, url, key, num, created_at, updated_at FROM counters";

pub struct SqliteCounterStore {
    conn: Connection,
}

/// Row operations over one connection. Outside a transaction this borrows
/// the store's connection; inside `in_transaction` it borrows the
/// transaction, so every call in the closure shares its fate.
pub struct CounterRows<'c> {
    conn: &'c Connection,
}

impl SqliteCounterStore {
    pub fn open(path: &Path) -> Result<Self, CounterError> {
        let conn = Connection::open(path).map_err(|err| {
            CounterError::Storage(format!(
                "failed to open sqlite database at {}: {err}",
                path.display()
            ))
        })?;

        configure_pragmas(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, CounterError> {
        let conn = Connection::open_in_memory()
            .map_err(|err| CounterError::Storage(format!("failed to open in-memory db: {err}")))?;

        configure_pragmas(&conn)?;
        Ok(Self { conn })
    }

    /// Applies the counter schema. Safe to call on every startup; the
    /// applied version is registered in `schema_migrations`.
    pub fn migrate(&self) -> Result<(), CounterError> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .map_err(storage)?;

        self.conn.execute_batch(SCHEMA_COUNTERS_V1).map_err(storage)?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![COUNTER_MIGRATION_VERSION, now],
            )
            .map_err(storage)?;

        Ok(())
    }

    #[must_use]
    pub fn rows(&self) -> CounterRows<'_> {
        CounterRows { conn: &self.conn }
    }

    pub fn find_one(
        &self,
        site_id: &str,
        url: &str,
        key: &str,
    ) -> Result<Option<Counter>, CounterError> {
        self.rows().find_one(site_id, url, key)
    }

    pub fn find_many(
        &self,
        site_id: &str,
        url: &str,
        keys: &[String],
    ) -> Result<Vec<Counter>, CounterError> {
        self.rows().find_many(site_id, url, keys)
    }

    pub fn create(
        &self,
        site_id: &str,
        url: &str,
        key: &str,
        num: i64,
    ) -> Result<Counter, CounterError> {
        self.rows().create(site_id, url, key, num)
    }

    pub fn save(&self, counter: &Counter) -> Result<Counter, CounterError> {
        self.rows().save(counter)
    }

    /// Runs `f` against a transaction-scoped [`CounterRows`] view. Commits
    /// when `f` returns `Ok`; any error rolls back every write made inside
    /// the closure before it propagates.
    pub fn in_transaction<T>(
        &mut self,
        f: impl FnOnce(&CounterRows<'_>) -> Result<T, CounterError>,
    ) -> Result<T, CounterError> {
        let tx = self.conn.transaction().map_err(storage)?;

        let outcome = f(&CounterRows { conn: &tx });
        match outcome {
            Ok(value) => {
                tx.commit().map_err(storage)?;
                Ok(value)
            }
            Err(err) => {
                // Rollback failure is secondary; the original error wins.
                let _ = tx.rollback();
                Err(err)
            }
        }
    }
}

impl CounterRows<'_> {
    pub fn find_one(
        &self,
        site_id: &str,
        url: &str,
        key: &str,
    ) -> Result<Option<Counter>, CounterError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{SELECT_COUNTER_COLUMNS} WHERE site_id = ?1 AND url = ?2 AND key = ?3"
            ))
            .map_err(storage)?;

        stmt.query_row(params![site_id, url, key], parse_counter_row)
            .optional()
            .map_err(storage)
    }

    /// Fetches the existing rows for a key set. Keys with no row are simply
    /// absent from the result; callers synthesize zeros when they need full
    /// coverage.
    pub fn find_many(
        &self,
        site_id: &str,
        url: &str,
        keys: &[String],
    ) -> Result<Vec<Counter>, CounterError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (0..keys.len())
            .map(|index| format!("?{}", index + 3))
            .collect::<Vec<_>>()
            .join(", ");
        let query = format!(
            "{SELECT_COUNTER_COLUMNS}
             WHERE site_id = ?1 AND url = ?2 AND key IN ({placeholders})
             ORDER BY id ASC"
        );

        let mut stmt = self.conn.prepare(&query).map_err(storage)?;

        let mut bindings: Vec<&dyn rusqlite::types::ToSql> = Vec::with_capacity(keys.len() + 2);
        bindings.push(&site_id);
        bindings.push(&url);
        for key in keys {
            bindings.push(key);
        }

        let rows = stmt
            .query_map(bindings.as_slice(), parse_counter_row)
            .map_err(storage)?;

        collect_rows(rows)
    }

    /// Inserts a new counter row. A duplicate (site_id, url, key) triple is
    /// reported as [`CounterError::Conflict`], the signal for a lost
    /// create race.
    pub fn create(
        &self,
        site_id: &str,
        url: &str,
        key: &str,
        num: i64,
    ) -> Result<Counter, CounterError> {
        let stamp_at = now_utc();
        let stamp = format_rfc3339(stamp_at)?;

        self.conn
            .execute(
                "INSERT INTO counters(site_id, url, key, num, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![site_id, url, key, num, stamp],
            )
            .map_err(storage)?;

        Ok(Counter {
            id: Some(self.conn.last_insert_rowid()),
            site_id: site_id.to_string(),
            url: url.to_string(),
            key: key.to_string(),
            num,
            created_at: stamp_at,
            updated_at: stamp_at,
        })
    }

    /// Writes `num` back to an existing row and refreshes `updated_at`.
    pub fn save(&self, counter: &Counter) -> Result<Counter, CounterError> {
        let Some(id) = counter.id else {
            return Err(CounterError::Storage(
                "cannot save a counter that was never created".to_string(),
            ));
        };

        let stamp_at = now_utc();
        let stamp = format_rfc3339(stamp_at)?;

        let changed = self
            .conn
            .execute(
                "UPDATE counters SET num = ?1, updated_at = ?2 WHERE id = ?3",
                params![counter.num, stamp, id],
            )
            .map_err(storage)?;

        if changed != 1 {
            return Err(CounterError::Storage(format!(
                "counter row {id} disappeared during save"
            )));
        }

        Ok(Counter {
            updated_at: stamp_at,
            ..counter.clone()
        })
    }
}

fn configure_pragmas(conn: &Connection) -> Result<(), CounterError> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .map_err(|err| CounterError::Storage(format!("failed to configure sqlite pragmas: {err}")))
}

fn storage(err: rusqlite::Error) -> CounterError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err {
        if failure.code == ErrorCode::ConstraintViolation {
            return CounterError::Conflict(format!("unique constraint violated: {err}"));
        }
    }
    CounterError::Storage(err.to_string())
}

fn parse_counter_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Counter> {
    let created_raw: String = row.get(5)?;
    let updated_raw: String = row.get(6)?;

    Ok(Counter {
        id: Some(row.get(0)?),
        site_id: row.get(1)?,
        url: row.get(2)?,
        key: row.get(3)?,
        num: row.get(4)?,
        created_at: parse_rfc3339_utc(&created_raw).map_err(|err| to_sql_error(5, &err))?,
        updated_at: parse_rfc3339_utc(&updated_raw).map_err(|err| to_sql_error(6, &err))?,
    })
}

fn to_sql_error(column: usize, err: &CounterError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>, CounterError> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.map_err(storage)?);
    }
    Ok(values)
}
