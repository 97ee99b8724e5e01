use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{
    params_from_iter,
    types::{Type, Value},
    Connection, OptionalExtension, Row,
};
use taskrunner_core::types::{TaskRecord, UNLOCKED};
use tracing::{debug, info, instrument};

use crate::{
    db::init_db,
    error::{Result, StoreError},
    filter::TaskFilter,
    group::GROUP_ELIGIBLE_SQL,
    store::TaskStore,
    update::{Field, RetriesUpdate, TaskUpdate},
};

/// How long a statement waits for another connection's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const COLUMNS: &str = "task_id, name, data, task_group, repeat_every, start_at, created_at,
     locked_at, processed_at, failed_at, error_msg, retries";

const FIFO: &str = "ORDER BY cand.start_at, cand.created_at, cand.task_id";

/// SQLite-backed [`TaskStore`].
///
/// Several `SqliteStore`s (one per worker, or one per process) may open the
/// same database file; they coordinate purely through SQLite's locking.
/// Blocking SQLite calls run on Tokio's blocking pool.
pub struct SqliteStore {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteStore {
    /// Open (or create) a database file in WAL mode.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::from_connection(conn)
    }

    /// A private, non-shared in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wrap an already-open connection, initialising the schema.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            let conn = guard.as_ref().ok_or(StoreError::Closed)?;
            f(conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn now(&self) -> Result<DateTime<Utc>> {
        self.with_conn(|conn| {
            let now: String = conn.query_row(
                "SELECT strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
                [],
                |row| row.get(0),
            )?;
            parse_ts(&now).map_err(|e| StoreError::Unavailable(format!("bad store clock: {e}")))
        })
        .await
    }

    #[instrument(skip_all, fields(task_id = %task.task_id))]
    async fn insert(&self, task: &TaskRecord) -> Result<()> {
        let data = serde_json::to_string(&task.data)?;
        let task = task.clone();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                &format!(
                    "INSERT INTO tasks ({COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                rusqlite::params![
                    task.task_id,
                    task.name,
                    data,
                    task.group,
                    i64::try_from(task.repeat_every).unwrap_or(i64::MAX),
                    fmt_ts(task.start_at),
                    fmt_ts(task.created_at),
                    fmt_ts(task.locked_at),
                    task.processed_at.map(fmt_ts),
                    task.failed_at.map(fmt_ts),
                    task.error_msg,
                    i64::from(task.retries),
                ],
            );
            match inserted {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if matches!(
                        err.extended_code,
                        rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                            | rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    ) =>
                {
                    Err(StoreError::Duplicate {
                        task_id: task.task_id,
                    })
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn find_and_modify(
        &self,
        filter: &TaskFilter,
        update: &TaskUpdate,
    ) -> Result<Option<TaskRecord>> {
        let mut params = Vec::new();
        let sql = if update.is_empty() {
            let cond = where_clause(filter, &mut params);
            format!("SELECT {COLUMNS} FROM tasks AS cand WHERE {cond} {FIFO} LIMIT 1")
        } else {
            // One statement: SQLite takes the write lock before evaluating the
            // sub-select, so selection and update cannot interleave with
            // another writer.
            let set = set_clause(update, &mut params);
            let cond = where_clause(filter, &mut params);
            format!(
                "UPDATE tasks SET {set}
                 WHERE task_id = (SELECT cand.task_id FROM tasks AS cand
                                  WHERE {cond} {FIFO} LIMIT 1)
                 RETURNING {COLUMNS}"
            )
        };

        let task = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(&sql, params_from_iter(params), row_to_task)
                    .optional()?)
            })
            .await?;
        if let Some(ref t) = task {
            debug!(task_id = %t.task_id, "find_and_modify matched");
        }
        Ok(task)
    }

    async fn update_many(&self, filter: &TaskFilter, update: &TaskUpdate) -> Result<u64> {
        if update.is_empty() {
            return Ok(0);
        }
        let mut params = Vec::new();
        let set = set_clause(update, &mut params);
        let cond = where_clause(filter, &mut params);
        let sql = format!(
            "UPDATE tasks SET {set}
             WHERE task_id IN (SELECT cand.task_id FROM tasks AS cand WHERE {cond})"
        );
        self.with_conn(move |conn| Ok(conn.execute(&sql, params_from_iter(params))? as u64))
            .await
    }

    async fn find(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>> {
        let mut params = Vec::new();
        let cond = where_clause(filter, &mut params);
        let sql = format!("SELECT {COLUMNS} FROM tasks AS cand WHERE {cond} {FIFO}");
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(params), row_to_task)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    #[instrument(skip_all)]
    async fn remove(&self, filter: &TaskFilter) -> Result<u64> {
        let mut params = Vec::new();
        let cond = where_clause(filter, &mut params);
        let sql = format!(
            "DELETE FROM tasks
             WHERE task_id IN (SELECT cand.task_id FROM tasks AS cand WHERE {cond})"
        );
        let n = self
            .with_conn(move |conn| Ok(conn.execute(&sql, params_from_iter(params))? as u64))
            .await?;
        info!(count = n, "tasks removed");
        Ok(n)
    }

    async fn close(&self) -> Result<()> {
        // an in-flight statement may hold the lock for the whole busy timeout
        let conn = Arc::clone(&self.conn);
        let closed = tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            guard.take().is_some()
        })
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        if closed {
            info!("sqlite task store closed");
        }
        Ok(())
    }
}

/// Fixed-width RFC 3339 with milliseconds and a `Z` suffix.
pub fn fmt_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|t| t.with_timezone(&Utc))
}

/// Render `filter` as a boolean SQL expression over the row alias `cand`,
/// appending its bind values to `params` in order of appearance.
fn where_clause(filter: &TaskFilter, params: &mut Vec<Value>) -> String {
    let mut clauses: Vec<String> = Vec::new();

    if let Some(ref id) = filter.task_id {
        clauses.push("cand.task_id = ?".into());
        params.push(Value::Text(id.clone()));
    }
    if let Some(ref names) = filter.names {
        if names.is_empty() {
            clauses.push("0".into());
        } else {
            let marks = vec!["?"; names.len()].join(", ");
            clauses.push(format!("cand.name IN ({marks})"));
            params.extend(names.iter().cloned().map(Value::Text));
        }
    }
    if let Some(ref group) = filter.group {
        clauses.push("cand.task_group = ?".into());
        params.push(Value::Text(group.clone()));
    }
    if let Some(at) = filter.locked_at {
        clauses.push("cand.locked_at = ?".into());
        params.push(Value::Text(fmt_ts(at)));
    }
    match filter.processed {
        Some(true) => clauses.push("cand.processed_at IS NOT NULL".into()),
        Some(false) => clauses.push("cand.processed_at IS NULL".into()),
        None => {}
    }
    if let Some(window) = filter.claimable {
        let stale = fmt_ts(window.stale_before);
        clauses.push(format!(
            "cand.start_at <= ? AND cand.processed_at IS NULL
             AND (cand.locked_at = ? OR cand.locked_at < ?)
             AND {GROUP_ELIGIBLE_SQL}"
        ));
        params.extend([
            Value::Text(fmt_ts(window.now)),
            Value::Text(fmt_ts(UNLOCKED)),
            Value::Text(stale.clone()),
            Value::Text(fmt_ts(UNLOCKED)),
            Value::Text(stale),
        ]);
    }
    if let Some(cutoff) = filter.stale_before {
        clauses.push(
            "cand.processed_at IS NULL AND cand.locked_at <> ? AND cand.locked_at < ?".into(),
        );
        params.extend([Value::Text(fmt_ts(UNLOCKED)), Value::Text(fmt_ts(cutoff))]);
    }

    if clauses.is_empty() {
        "1".to_string()
    } else {
        clauses.join(" AND ")
    }
}

/// Render `update` as a `SET` list. Callers must check `is_empty` first.
fn set_clause(update: &TaskUpdate, params: &mut Vec<Value>) -> String {
    let mut sets: Vec<String> = Vec::new();

    if let Some(at) = update.locked_at {
        sets.push("locked_at = ?".into());
        params.push(Value::Text(fmt_ts(at)));
    }
    if let Some(at) = update.start_at {
        sets.push("start_at = ?".into());
        params.push(Value::Text(fmt_ts(at)));
    }
    push_field(&mut sets, params, "processed_at", &update.processed_at, |t| {
        Value::Text(fmt_ts(*t))
    });
    push_field(&mut sets, params, "failed_at", &update.failed_at, |t| {
        Value::Text(fmt_ts(*t))
    });
    push_field(&mut sets, params, "error_msg", &update.error_msg, |m| {
        Value::Text(m.clone())
    });
    match update.retries {
        RetriesUpdate::Keep => {}
        RetriesUpdate::Increment => sets.push("retries = retries + 1".into()),
        RetriesUpdate::Reset => sets.push("retries = 0".into()),
    }

    sets.join(", ")
}

fn push_field<T>(
    sets: &mut Vec<String>,
    params: &mut Vec<Value>,
    column: &str,
    field: &Field<T>,
    to_value: impl Fn(&T) -> Value,
) {
    match field {
        Field::Keep => {}
        Field::Set(v) => {
            sets.push(format!("{column} = ?"));
            params.push(to_value(v));
        }
        Field::Clear => sets.push(format!("{column} = NULL")),
    }
}

/// Map a SQLite row (in `COLUMNS` order) to a `TaskRecord`.
fn row_to_task(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let data: String = row.get(2)?;
    let data = serde_json::from_str(&data)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;

    Ok(TaskRecord {
        task_id: row.get(0)?,
        name: row.get(1)?,
        data,
        group: row.get(3)?,
        repeat_every: row.get::<_, i64>(4)?.max(0) as u64,
        start_at: ts_column(row, 5)?,
        created_at: ts_column(row, 6)?,
        locked_at: ts_column(row, 7)?,
        processed_at: opt_ts_column(row, 8)?,
        failed_at: opt_ts_column(row, 9)?,
        error_msg: row.get(10)?,
        retries: u32::try_from(row.get::<_, i64>(11)?.max(0)).unwrap_or(u32::MAX),
    })
}

fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        parse_ts(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}
