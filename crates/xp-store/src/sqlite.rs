//! SQLite-backed experiment store.
//!
//! Each conditional update is a single `UPDATE ... WHERE` statement, so the
//! compare-and-swap holds across processes sharing one database file.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use tracing::{debug, warn};

use xp_core::{
    Expectation, ExperimentRecord, ExperimentStore, JobRecord, NewExperiment, Purge, ResultEntry,
    ResultKind, ScanFilter, StageOutput, StateUpdate, StoreError, Trace, WorkState,
};

use crate::row::{
    encode_opt_ts, encode_ts, in_progress_list, second_pass_kinds, window_params, RecordRow,
    COLUMNS,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS experiments (
        trace_id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        seed TEXT NOT NULL,
        machine TEXT NOT NULL,
        trace_type TEXT NOT NULL,
        subtraces TEXT NOT NULL DEFAULT '[]',
        manifest_list TEXT NOT NULL DEFAULT '[]',
        workflow_policy TEXT NOT NULL,
        workflow_period_s INTEGER NOT NULL DEFAULT 0,
        workflow_handling TEXT NOT NULL DEFAULT 'no',
        preload_time_s INTEGER NOT NULL DEFAULT 0,
        workload_duration_s INTEGER NOT NULL,
        start_date TEXT NOT NULL,
        overload_target REAL,
        work_state TEXT NOT NULL,
        assigned_worker TEXT,
        version INTEGER NOT NULL DEFAULT 0,
        lease_expires_at TEXT,
        created_at TEXT NOT NULL,
        state_entered_at TEXT NOT NULL,
        simulation_start TEXT,
        simulation_end TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_experiments_state
        ON experiments(work_state, trace_type);
    CREATE TABLE IF NOT EXISTS traces (
        trace_id INTEGER NOT NULL,
        seq INTEGER NOT NULL,
        id_job INTEGER NOT NULL,
        job_name TEXT NOT NULL,
        timelimit INTEGER NOT NULL,
        cpus_req INTEGER NOT NULL,
        dependency TEXT NOT NULL DEFAULT '',
        manifest TEXT NOT NULL DEFAULT '',
        time_submit INTEGER NOT NULL,
        time_start INTEGER NOT NULL,
        time_end INTEGER NOT NULL,
        PRIMARY KEY (trace_id, seq)
    );
    CREATE TABLE IF NOT EXISTS results (
        trace_id INTEGER NOT NULL,
        kind TEXT NOT NULL,
        payload TEXT NOT NULL,
        PRIMARY KEY (trace_id, kind)
    );";

const CAS_UPDATE: &str = "
    UPDATE experiments SET
        work_state = ?1,
        assigned_worker = ?2,
        lease_expires_at = ?3,
        state_entered_at = ?4,
        version = version + 1,
        simulation_start = CASE ?5 WHEN 'start' THEN ?6 WHEN 'clear' THEN NULL
            ELSE simulation_start END,
        simulation_end = CASE ?5 WHEN 'start' THEN NULL WHEN 'end' THEN ?6 WHEN 'clear' THEN NULL
            ELSE simulation_end END
    WHERE trace_id = ?7
        AND work_state = ?8
        AND (?9 IS NULL OR version = ?9)
        AND (?10 IS NULL OR assigned_worker = ?10)";

fn sql_err(operation: &'static str) -> impl Fn(rusqlite::Error) -> StoreError {
    move |e| match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            StoreError::Timeout {
                operation: operation.to_string(),
                target: "sqlite".to_string(),
            }
        }
        _ => StoreError::Other(format!("SQLite {} failed: {}", operation, e)),
    }
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordRow> {
    Ok(RecordRow {
        trace_id: row.get(0)?,
        name: row.get(1)?,
        seed: row.get(2)?,
        machine: row.get(3)?,
        trace_type: row.get(4)?,
        subtraces: row.get(5)?,
        manifest_list: row.get(6)?,
        workflow_policy: row.get(7)?,
        workflow_period_s: row.get(8)?,
        workflow_handling: row.get(9)?,
        preload_time_s: row.get(10)?,
        workload_duration_s: row.get(11)?,
        start_date: row.get(12)?,
        overload_target: row.get(13)?,
        work_state: row.get(14)?,
        assigned_worker: row.get(15)?,
        version: row.get(16)?,
        lease_expires_at: row.get(17)?,
        created_at: row.get(18)?,
        state_entered_at: row.get(19)?,
        simulation_start: row.get(20)?,
        simulation_end: row.get(21)?,
    })
}

fn read_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRecord> {
    Ok(JobRecord {
        id_job: row.get::<_, i64>(0)? as u64,
        job_name: row.get(1)?,
        timelimit: row.get::<_, i64>(2)? as u64,
        cpus_req: row.get::<_, i64>(3)? as u32,
        dependency: row.get(4)?,
        manifest: row.get(5)?,
        time_submit: row.get(6)?,
        time_start: row.get(7)?,
        time_end: row.get(8)?,
    })
}

/// Run the conditional state update of `compare_and_swap` on `conn`.
fn execute_cas(
    conn: &Connection,
    trace_id: u64,
    expect: &Expectation,
    update: &StateUpdate,
) -> rusqlite::Result<usize> {
    let (mode, at) = window_params(&update.window);
    conn.execute(
        CAS_UPDATE,
        params![
            update.state.as_str(),
            update.assigned_worker,
            encode_opt_ts(update.lease_expires_at.as_ref()),
            encode_ts(&update.entered_at),
            mode,
            at,
            trace_id as i64,
            expect.state.as_str(),
            expect.version.map(|v| v as i64),
            expect.worker,
        ],
    )
}

/// Replace the stored trace rows of `trace_id`.
fn write_trace(conn: &Connection, trace_id: u64, trace: &Trace) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM traces WHERE trace_id = ?1",
        params![trace_id as i64],
    )?;
    let mut stmt = conn.prepare(
        "INSERT INTO traces (trace_id, seq, id_job, job_name, timelimit, cpus_req,
            dependency, manifest, time_submit, time_start, time_end)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )?;
    for (seq, job) in trace.jobs.iter().enumerate() {
        stmt.execute(params![
            trace_id as i64,
            seq as i64,
            job.id_job as i64,
            job.job_name,
            job.timelimit as i64,
            job.cpus_req as i64,
            job.dependency,
            job.manifest,
            job.time_submit,
            job.time_start,
            job.time_end,
        ])?;
    }
    Ok(())
}

fn write_result(
    conn: &Connection,
    trace_id: u64,
    kind: ResultKind,
    payload: &str,
) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT OR REPLACE INTO results (trace_id, kind, payload) VALUES (?1, ?2, ?3)",
        params![trace_id as i64, kind.as_str(), payload],
    )
}

/// Experiment store on a single SQLite database.
///
/// Several processes (or several `SqliteStore`s in one process) may open the
/// same file; WAL mode plus `busy_timeout` serializes their writes.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a store at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::ConnectionFailed {
            backend: format!("sqlite:{}", path.display()),
            source: Box::new(e),
        })?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .map_err(sql_err("set pragmas"))?;

        debug!(path = %path.display(), "opened sqlite store");
        Self::init(conn)
    }

    /// Open a private in-memory store.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::ConnectionFailed {
            backend: "sqlite::memory:".to_string(),
            source: Box::new(e),
        })?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)
            .map_err(sql_err("create tables"))?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_exists(conn: &Connection, trace_id: u64) -> Result<bool, StoreError> {
        conn.query_row(
            "SELECT 1 FROM experiments WHERE trace_id = ?1",
            params![trace_id as i64],
            |_| Ok(()),
        )
        .optional()
        .map(|found| found.is_some())
        .map_err(sql_err("lookup"))
    }
}

#[async_trait]
impl ExperimentStore for SqliteStore {
    async fn insert(&self, new: &NewExperiment) -> Result<ExperimentRecord, StoreError> {
        let now = Utc::now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO experiments (name, seed, machine, trace_type, subtraces, manifest_list,
                workflow_policy, workflow_period_s, workflow_handling, preload_time_s,
                workload_duration_s, start_date, overload_target, work_state, version,
                created_at, state_entered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 0, ?15, ?15)",
            params![
                new.derive_name(),
                new.seed,
                new.machine,
                new.kind.trace_type().as_str(),
                serde_json::to_string(new.kind.subtraces())?,
                serde_json::to_string(&new.manifest_list)?,
                new.workflow_policy,
                new.workflow_period_s as i64,
                new.workflow_handling.as_str(),
                new.preload_time_s as i64,
                new.workload_duration_s as i64,
                encode_ts(&new.start_date),
                new.overload_target,
                WorkState::Fresh.as_str(),
                encode_ts(&now),
            ],
        )
        .map_err(sql_err("insert"))?;

        let trace_id = conn.last_insert_rowid() as u64;
        debug!(trace_id, "inserted experiment");
        Ok(ExperimentRecord::from_new(trace_id, new, now))
    }

    async fn get(&self, trace_id: u64) -> Result<Option<ExperimentRecord>, StoreError> {
        let row = {
            let conn = self.conn();
            conn.query_row(
                &format!("SELECT {} FROM experiments WHERE trace_id = ?1", COLUMNS),
                params![trace_id as i64],
                read_row,
            )
            .optional()
            .map_err(sql_err("get"))?
        };
        row.map(RecordRow::into_record).transpose()
    }

    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<ExperimentRecord>, StoreError> {
        let mut sql = format!("SELECT {} FROM experiments WHERE 1 = 1", COLUMNS);
        let mut values: Vec<Value> = Vec::new();

        if !filter.states.is_empty() {
            sql.push_str(&format!(
                " AND work_state IN ({})",
                vec!["?"; filter.states.len()].join(", ")
            ));
            values.extend(filter.states.iter().map(|s| Value::Text(s.as_str().to_string())));
        }
        if !filter.kinds.is_empty() {
            sql.push_str(&format!(
                " AND trace_type IN ({})",
                vec!["?"; filter.kinds.len()].join(", ")
            ));
            values.extend(filter.kinds.iter().map(|k| Value::Text(k.as_str().to_string())));
        }
        if let Some(min) = filter.min_trace_id {
            sql.push_str(" AND trace_id >= ?");
            values.push(Value::Integer(min as i64));
        }
        if let Some(now) = filter.lease_expired_before {
            sql.push_str(" AND lease_expires_at IS NOT NULL AND lease_expires_at <= ?");
            values.push(Value::Text(encode_ts(&now)));
        }
        sql.push_str(" ORDER BY trace_id");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            values.push(Value::Integer(limit as i64));
        }

        let rows = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&sql).map_err(sql_err("scan"))?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), read_row)
                .map_err(sql_err("scan"))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err("scan"))?;
            rows
        };
        rows.into_iter().map(RecordRow::into_record).collect()
    }

    async fn compare_and_swap(
        &self,
        trace_id: u64,
        expect: &Expectation,
        update: &StateUpdate,
    ) -> Result<bool, StoreError> {
        let conn = self.conn();
        let changed = execute_cas(&conn, trace_id, expect, update)
            .map_err(sql_err("compare_and_swap"))?;
        Ok(changed == 1)
    }

    async fn reset(
        &self,
        trace_id: u64,
        expect: &Expectation,
        update: &StateUpdate,
        purge: Purge,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(sql_err("reset"))?;

        let changed = execute_cas(&tx, trace_id, expect, update).map_err(sql_err("reset"))?;
        if changed == 0 {
            return Ok(false);
        }

        let id = trace_id as i64;
        match purge {
            Purge::Nothing => {}
            Purge::SecondPass => {
                tx.execute(
                    &format!(
                        "DELETE FROM results WHERE trace_id = ?1 AND kind IN ({})",
                        second_pass_kinds()
                    ),
                    params![id],
                )
                .map_err(sql_err("reset"))?;
            }
            Purge::Results => {
                tx.execute("DELETE FROM results WHERE trace_id = ?1", params![id])
                    .map_err(sql_err("reset"))?;
            }
            Purge::TraceAndResults => {
                tx.execute("DELETE FROM results WHERE trace_id = ?1", params![id])
                    .map_err(sql_err("reset"))?;
                tx.execute("DELETE FROM traces WHERE trace_id = ?1", params![id])
                    .map_err(sql_err("reset"))?;
            }
        }

        tx.commit().map_err(sql_err("reset"))?;
        Ok(true)
    }

    async fn commit(
        &self,
        trace_id: u64,
        expect: &Expectation,
        update: &StateUpdate,
        output: &StageOutput,
    ) -> Result<bool, StoreError> {
        let payloads = output
            .results
            .iter()
            .map(|entry| Ok((entry.kind(), serde_json::to_string(entry)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;

        let mut conn = self.conn();
        let tx = conn.transaction().map_err(sql_err("commit"))?;

        let changed = execute_cas(&tx, trace_id, expect, update).map_err(sql_err("commit"))?;
        if changed == 0 {
            return Ok(false);
        }
        if let Some(trace) = &output.trace {
            write_trace(&tx, trace_id, trace).map_err(sql_err("commit"))?;
        }
        for (kind, payload) in &payloads {
            write_result(&tx, trace_id, *kind, payload).map_err(sql_err("commit"))?;
        }

        tx.commit().map_err(sql_err("commit"))?;
        Ok(true)
    }

    async fn renew_lease(
        &self,
        trace_id: u64,
        worker: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn();
        let changed = conn
            .execute(
                &format!(
                    "UPDATE experiments SET lease_expires_at = ?1
                     WHERE trace_id = ?2 AND assigned_worker = ?3 AND work_state IN ({})",
                    in_progress_list()
                ),
                params![encode_ts(&expires_at), trace_id as i64, worker],
            )
            .map_err(sql_err("renew_lease"))?;
        Ok(changed == 1)
    }

    async fn state_counts(&self) -> Result<BTreeMap<WorkState, usize>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT work_state, COUNT(*) FROM experiments GROUP BY work_state")
            .map_err(sql_err("state_counts"))?;

        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(sql_err("state_counts"))?;

        let mut counts = BTreeMap::new();
        for (state, count) in rows.filter_map(|r| r.ok()) {
            match state.parse::<WorkState>() {
                Ok(state) => {
                    counts.insert(state, count as usize);
                }
                Err(e) => warn!(error = %e, "skipping unknown work state"),
            }
        }
        Ok(counts)
    }

    async fn put_trace(&self, trace_id: u64, trace: &Trace) -> Result<(), StoreError> {
        let mut conn = self.conn();
        if !Self::record_exists(&conn, trace_id)? {
            return Err(StoreError::NotFound(trace_id));
        }

        let tx = conn.transaction().map_err(sql_err("put_trace"))?;
        write_trace(&tx, trace_id, trace).map_err(sql_err("put_trace"))?;
        tx.commit().map_err(sql_err("put_trace"))?;

        debug!(trace_id, jobs = trace.job_count(), "stored trace");
        Ok(())
    }

    async fn get_trace(&self, trace_id: u64) -> Result<Option<Trace>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id_job, job_name, timelimit, cpus_req, dependency, manifest,
                        time_submit, time_start, time_end
                 FROM traces WHERE trace_id = ?1 ORDER BY seq",
            )
            .map_err(sql_err("get_trace"))?;

        let jobs = stmt
            .query_map(params![trace_id as i64], read_job)
            .map_err(sql_err("get_trace"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err("get_trace"))?;

        if jobs.is_empty() {
            return Ok(None);
        }
        Ok(Some(Trace::new(jobs)))
    }

    async fn trace_job_count(&self, trace_id: u64) -> Result<Option<usize>, StoreError> {
        let conn = self.conn();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM traces WHERE trace_id = ?1",
                params![trace_id as i64],
                |row| row.get(0),
            )
            .map_err(sql_err("trace_job_count"))?;
        Ok((count > 0).then_some(count as usize))
    }

    async fn put_result(&self, trace_id: u64, entry: &ResultEntry) -> Result<(), StoreError> {
        let payload = serde_json::to_string(entry)?;
        let conn = self.conn();
        if !Self::record_exists(&conn, trace_id)? {
            return Err(StoreError::NotFound(trace_id));
        }
        write_result(&conn, trace_id, entry.kind(), &payload).map_err(sql_err("put_result"))?;
        Ok(())
    }

    async fn get_result(
        &self,
        trace_id: u64,
        kind: ResultKind,
    ) -> Result<Option<ResultEntry>, StoreError> {
        let payload: Option<String> = {
            let conn = self.conn();
            conn.query_row(
                "SELECT payload FROM results WHERE trace_id = ?1 AND kind = ?2",
                params![trace_id as i64, kind.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err("get_result"))?
        };
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn list_results(&self, trace_id: u64) -> Result<Vec<ResultEntry>, StoreError> {
        let payloads = {
            let conn = self.conn();
            let mut stmt = conn
                .prepare("SELECT payload FROM results WHERE trace_id = ?1")
                .map_err(sql_err("list_results"))?;
            let payloads = stmt
                .query_map(params![trace_id as i64], |row| row.get::<_, String>(0))
                .map_err(sql_err("list_results"))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err("list_results"))?;
            payloads
        };

        let mut entries = payloads
            .iter()
            .map(|p| serde_json::from_str::<ResultEntry>(p))
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|e| e.kind());
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xp_core::WindowChange;

    #[tokio::test]
    async fn test_record_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        let mut new = NewExperiment::single("AAAA", "edison");
        new.overload_target = Some(1.2);
        new.manifest_list = vec!["floodplain.json".to_string()];

        let inserted = store.insert(&new).await.unwrap();
        let loaded = store.get(inserted.trace_id).await.unwrap().unwrap();
        assert_eq!(loaded, inserted);
    }

    #[tokio::test]
    async fn test_cas_writes_window_columns() {
        let store = SqliteStore::in_memory().unwrap();
        let rec = store.insert(&NewExperiment::single("A", "edison")).await.unwrap();
        let at = Utc::now();

        let update = StateUpdate::new(WorkState::PreSimulating, Some("w1".to_string()))
            .with_window(WindowChange::Start(at));
        assert!(store
            .compare_and_swap(rec.trace_id, &Expectation::exact(WorkState::Fresh, 0), &update)
            .await
            .unwrap());

        let loaded = store.get(rec.trace_id).await.unwrap().unwrap();
        assert_eq!(loaded.simulation_start, Some(at));
        assert_eq!(loaded.simulation_end, None);
        assert_eq!(loaded.version, 1);

        let clear = StateUpdate::new(WorkState::Fresh, None).with_window(WindowChange::Clear);
        assert!(store
            .compare_and_swap(
                rec.trace_id,
                &Expectation::held_by(WorkState::PreSimulating, 1, "w1"),
                &clear
            )
            .await
            .unwrap());
        let loaded = store.get(rec.trace_id).await.unwrap().unwrap();
        assert_eq!(loaded.simulation_start, None);
        assert_eq!(loaded.assigned_worker, None);
    }

    #[tokio::test]
    async fn test_wrong_worker_is_rejected() {
        let store = SqliteStore::in_memory().unwrap();
        let rec = store.insert(&NewExperiment::single("A", "edison")).await.unwrap();
        let claim = StateUpdate::new(WorkState::PreSimulating, Some("w1".to_string()));
        assert!(store
            .compare_and_swap(rec.trace_id, &Expectation::state(WorkState::Fresh), &claim)
            .await
            .unwrap());

        let steal = StateUpdate::new(WorkState::Simulating, Some("w2".to_string()));
        assert!(!store
            .compare_and_swap(
                rec.trace_id,
                &Expectation::held_by(WorkState::PreSimulating, 1, "w2"),
                &steal
            )
            .await
            .unwrap());
    }
}
