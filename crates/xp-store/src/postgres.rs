use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, warn};

use xp_config::PostgresStoreConfig;
use xp_core::{
    Expectation, ExperimentRecord, ExperimentStore, JobRecord, NewExperiment, Purge, ResultEntry,
    ResultKind, ScanFilter, StageOutput, StateUpdate, StoreError, Trace, WorkState,
};

use crate::row::{
    encode_opt_ts, encode_ts, in_progress_list, second_pass_kinds, window_params, RecordRow,
    COLUMNS,
};

fn pg_err(operation: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| match e {
        sqlx::Error::PoolTimedOut => StoreError::Timeout {
            operation: operation.to_string(),
            target: "postgres".to_string(),
        },
        sqlx::Error::Io(io) => StoreError::Io(io),
        other => StoreError::Other(format!("Postgres {} failed: {}", operation, other)),
    }
}

fn read_row(row: &PgRow) -> Result<RecordRow, sqlx::Error> {
    Ok(RecordRow {
        trace_id: row.try_get("trace_id")?,
        name: row.try_get("name")?,
        seed: row.try_get("seed")?,
        machine: row.try_get("machine")?,
        trace_type: row.try_get("trace_type")?,
        subtraces: row.try_get("subtraces")?,
        manifest_list: row.try_get("manifest_list")?,
        workflow_policy: row.try_get("workflow_policy")?,
        workflow_period_s: row.try_get("workflow_period_s")?,
        workflow_handling: row.try_get("workflow_handling")?,
        preload_time_s: row.try_get("preload_time_s")?,
        workload_duration_s: row.try_get("workload_duration_s")?,
        start_date: row.try_get("start_date")?,
        overload_target: row.try_get("overload_target")?,
        work_state: row.try_get("work_state")?,
        assigned_worker: row.try_get("assigned_worker")?,
        version: row.try_get("version")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        created_at: row.try_get("created_at")?,
        state_entered_at: row.try_get("state_entered_at")?,
        simulation_start: row.try_get("simulation_start")?,
        simulation_end: row.try_get("simulation_end")?,
    })
}

/// Experiment store on PostgreSQL.
///
/// Tables are `{prefix}experiments`, `{prefix}traces`, and `{prefix}results`
/// (default prefix `xp_`).
pub struct PostgresStore {
    pool: PgPool,
    experiments: String,
    traces: String,
    results: String,
}

impl PostgresStore {
    pub async fn connect(config: &PostgresStoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.unwrap_or(5))
            .connect(&config.connection_string)
            .await
            .map_err(|e| StoreError::ConnectionFailed {
                backend: "postgres".to_string(),
                source: Box::new(e),
            })?;

        let prefix = config.table_prefix.as_deref().unwrap_or("xp_");
        let store = PostgresStore {
            pool,
            experiments: format!("{}experiments", prefix),
            traces: format!("{}traces", prefix),
            results: format!("{}results", prefix),
        };
        store.ensure_tables().await?;
        Ok(store)
    }

    async fn ensure_tables(&self) -> Result<(), StoreError> {
        let statements = [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    trace_id BIGSERIAL PRIMARY KEY,
                    name TEXT NOT NULL,
                    seed TEXT NOT NULL,
                    machine TEXT NOT NULL,
                    trace_type TEXT NOT NULL,
                    subtraces TEXT NOT NULL DEFAULT '[]',
                    manifest_list TEXT NOT NULL DEFAULT '[]',
                    workflow_policy TEXT NOT NULL,
                    workflow_period_s BIGINT NOT NULL DEFAULT 0,
                    workflow_handling TEXT NOT NULL DEFAULT 'no',
                    preload_time_s BIGINT NOT NULL DEFAULT 0,
                    workload_duration_s BIGINT NOT NULL,
                    start_date TEXT NOT NULL,
                    overload_target DOUBLE PRECISION,
                    work_state TEXT NOT NULL,
                    assigned_worker TEXT,
                    version BIGINT NOT NULL DEFAULT 0,
                    lease_expires_at TEXT,
                    created_at TEXT NOT NULL,
                    state_entered_at TEXT NOT NULL,
                    simulation_start TEXT,
                    simulation_end TEXT
                )
                "#,
                self.experiments
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {0}_state_idx ON {0} (work_state, trace_type)",
                self.experiments
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    trace_id BIGINT NOT NULL,
                    seq BIGINT NOT NULL,
                    id_job BIGINT NOT NULL,
                    job_name TEXT NOT NULL,
                    timelimit BIGINT NOT NULL,
                    cpus_req BIGINT NOT NULL,
                    dependency TEXT NOT NULL DEFAULT '',
                    manifest TEXT NOT NULL DEFAULT '',
                    time_submit BIGINT NOT NULL,
                    time_start BIGINT NOT NULL,
                    time_end BIGINT NOT NULL,
                    PRIMARY KEY (trace_id, seq)
                )
                "#,
                self.traces
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    trace_id BIGINT NOT NULL,
                    kind TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    PRIMARY KEY (trace_id, kind)
                )
                "#,
                self.results
            ),
        ];

        for statement in &statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(pg_err("create tables"))?;
        }
        Ok(())
    }

    fn cas_sql(&self) -> String {
        format!(
            r#"
            UPDATE {} SET
                work_state = $1,
                assigned_worker = $2,
                lease_expires_at = $3,
                state_entered_at = $4,
                version = version + 1,
                simulation_start = CASE $5::TEXT WHEN 'start' THEN $6::TEXT WHEN 'clear' THEN NULL
                    ELSE simulation_start END,
                simulation_end = CASE $5::TEXT WHEN 'start' THEN NULL WHEN 'end' THEN $6::TEXT
                    WHEN 'clear' THEN NULL ELSE simulation_end END
            WHERE trace_id = $7
                AND work_state = $8
                AND ($9::BIGINT IS NULL OR version = $9)
                AND ($10::TEXT IS NULL OR assigned_worker = $10)
            "#,
            self.experiments
        )
    }

    async fn record_exists(&self, trace_id: u64) -> Result<bool, StoreError> {
        let q = format!("SELECT 1 FROM {} WHERE trace_id = $1", self.experiments);
        let row = sqlx::query(&q)
            .bind(trace_id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(pg_err("lookup"))?;
        Ok(row.is_some())
    }

    /// Replace the stored trace rows of `trace_id`.
    async fn write_trace(
        &self,
        conn: &mut PgConnection,
        trace_id: u64,
        trace: &Trace,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(&format!("DELETE FROM {} WHERE trace_id = $1", self.traces))
            .bind(trace_id as i64)
            .execute(&mut *conn)
            .await?;

        let insert = format!(
            "INSERT INTO {} (trace_id, seq, id_job, job_name, timelimit, cpus_req, dependency,
                manifest, time_submit, time_start, time_end)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            self.traces
        );
        for (seq, job) in trace.jobs.iter().enumerate() {
            sqlx::query(&insert)
                .bind(trace_id as i64)
                .bind(seq as i64)
                .bind(job.id_job as i64)
                .bind(&job.job_name)
                .bind(job.timelimit as i64)
                .bind(job.cpus_req as i64)
                .bind(&job.dependency)
                .bind(&job.manifest)
                .bind(job.time_submit)
                .bind(job.time_start)
                .bind(job.time_end)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    async fn write_result(
        &self,
        conn: &mut PgConnection,
        trace_id: u64,
        kind: ResultKind,
        payload: &str,
    ) -> Result<(), sqlx::Error> {
        let q = format!(
            r#"
            INSERT INTO {} (trace_id, kind, payload)
            VALUES ($1, $2, $3)
            ON CONFLICT (trace_id, kind) DO UPDATE SET payload = EXCLUDED.payload
            "#,
            self.results
        );
        sqlx::query(&q)
            .bind(trace_id as i64)
            .bind(kind.as_str())
            .bind(payload)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}

macro_rules! bind_cas {
    ($query:expr, $trace_id:expr, $expect:expr, $update:expr) => {{
        let (mode, at) = window_params(&$update.window);
        $query
            .bind($update.state.as_str())
            .bind($update.assigned_worker.clone())
            .bind(encode_opt_ts($update.lease_expires_at.as_ref()))
            .bind(encode_ts(&$update.entered_at))
            .bind(mode)
            .bind(at)
            .bind($trace_id as i64)
            .bind($expect.state.as_str())
            .bind($expect.version.map(|v| v as i64))
            .bind($expect.worker.clone())
    }};
}

#[async_trait]
impl ExperimentStore for PostgresStore {
    async fn insert(&self, new: &NewExperiment) -> Result<ExperimentRecord, StoreError> {
        let now = Utc::now();
        let q = format!(
            r#"
            INSERT INTO {} (name, seed, machine, trace_type, subtraces, manifest_list,
                workflow_policy, workflow_period_s, workflow_handling, preload_time_s,
                workload_duration_s, start_date, overload_target, work_state, version,
                created_at, state_entered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, 0, $15, $15)
            RETURNING trace_id
            "#,
            self.experiments
        );

        let trace_id: i64 = sqlx::query_scalar(&q)
            .bind(new.derive_name())
            .bind(&new.seed)
            .bind(&new.machine)
            .bind(new.kind.trace_type().as_str())
            .bind(serde_json::to_string(new.kind.subtraces())?)
            .bind(serde_json::to_string(&new.manifest_list)?)
            .bind(&new.workflow_policy)
            .bind(new.workflow_period_s as i64)
            .bind(new.workflow_handling.as_str())
            .bind(new.preload_time_s as i64)
            .bind(new.workload_duration_s as i64)
            .bind(encode_ts(&new.start_date))
            .bind(new.overload_target)
            .bind(WorkState::Fresh.as_str())
            .bind(encode_ts(&now))
            .fetch_one(&self.pool)
            .await
            .map_err(pg_err("insert"))?;

        debug!(trace_id, "inserted experiment");
        Ok(ExperimentRecord::from_new(trace_id as u64, new, now))
    }

    async fn get(&self, trace_id: u64) -> Result<Option<ExperimentRecord>, StoreError> {
        let q = format!("SELECT {} FROM {} WHERE trace_id = $1", COLUMNS, self.experiments);
        let row = sqlx::query(&q)
            .bind(trace_id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(pg_err("get"))?;

        match row {
            Some(row) => Ok(Some(read_row(&row).map_err(pg_err("get"))?.into_record()?)),
            None => Ok(None),
        }
    }

    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<ExperimentRecord>, StoreError> {
        let q = format!(
            r#"
            SELECT {} FROM {}
            WHERE (cardinality($1::TEXT[]) = 0 OR work_state = ANY($1))
                AND (cardinality($2::TEXT[]) = 0 OR trace_type = ANY($2))
                AND ($3::BIGINT IS NULL OR trace_id >= $3)
                AND ($4::TEXT IS NULL OR (lease_expires_at IS NOT NULL AND lease_expires_at <= $4))
            ORDER BY trace_id
            LIMIT $5
            "#,
            COLUMNS, self.experiments
        );

        let states: Vec<String> = filter.states.iter().map(|s| s.as_str().to_string()).collect();
        let kinds: Vec<String> = filter.kinds.iter().map(|k| k.as_str().to_string()).collect();
        let rows = sqlx::query(&q)
            .bind(states)
            .bind(kinds)
            .bind(filter.min_trace_id.map(|m| m as i64))
            .bind(filter.lease_expired_before.as_ref().map(encode_ts))
            .bind(filter.limit.map(|l| l as i64))
            .fetch_all(&self.pool)
            .await
            .map_err(pg_err("scan"))?;

        rows.iter()
            .map(|row| read_row(row).map_err(pg_err("scan"))?.into_record())
            .collect()
    }

    async fn compare_and_swap(
        &self,
        trace_id: u64,
        expect: &Expectation,
        update: &StateUpdate,
    ) -> Result<bool, StoreError> {
        let q = self.cas_sql();
        let result = bind_cas!(sqlx::query(&q), trace_id, expect, update)
            .execute(&self.pool)
            .await
            .map_err(pg_err("compare_and_swap"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn reset(
        &self,
        trace_id: u64,
        expect: &Expectation,
        update: &StateUpdate,
        purge: Purge,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(pg_err("reset"))?;

        let q = self.cas_sql();
        let result = bind_cas!(sqlx::query(&q), trace_id, expect, update)
            .execute(&mut *tx)
            .await
            .map_err(pg_err("reset"))?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        let mut deletes = Vec::new();
        match purge {
            Purge::Nothing => {}
            Purge::SecondPass => deletes.push(format!(
                "DELETE FROM {} WHERE trace_id = $1 AND kind IN ({})",
                self.results,
                second_pass_kinds()
            )),
            Purge::Results => {
                deletes.push(format!("DELETE FROM {} WHERE trace_id = $1", self.results))
            }
            Purge::TraceAndResults => {
                deletes.push(format!("DELETE FROM {} WHERE trace_id = $1", self.results));
                deletes.push(format!("DELETE FROM {} WHERE trace_id = $1", self.traces));
            }
        }
        for delete in &deletes {
            sqlx::query(delete)
                .bind(trace_id as i64)
                .execute(&mut *tx)
                .await
                .map_err(pg_err("reset"))?;
        }

        tx.commit().await.map_err(pg_err("reset"))?;
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

        let mut tx = self.pool.begin().await.map_err(pg_err("commit"))?;

        let q = self.cas_sql();
        let result = bind_cas!(sqlx::query(&q), trace_id, expect, update)
            .execute(&mut *tx)
            .await
            .map_err(pg_err("commit"))?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }
        if let Some(trace) = &output.trace {
            self.write_trace(&mut tx, trace_id, trace)
                .await
                .map_err(pg_err("commit"))?;
        }
        for (kind, payload) in &payloads {
            self.write_result(&mut tx, trace_id, *kind, payload)
                .await
                .map_err(pg_err("commit"))?;
        }

        tx.commit().await.map_err(pg_err("commit"))?;
        Ok(true)
    }

    async fn renew_lease(
        &self,
        trace_id: u64,
        worker: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let q = format!(
            "UPDATE {} SET lease_expires_at = $1
             WHERE trace_id = $2 AND assigned_worker = $3 AND work_state IN ({})",
            self.experiments,
            in_progress_list()
        );
        let result = sqlx::query(&q)
            .bind(encode_ts(&expires_at))
            .bind(trace_id as i64)
            .bind(worker)
            .execute(&self.pool)
            .await
            .map_err(pg_err("renew_lease"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn state_counts(&self) -> Result<BTreeMap<WorkState, usize>, StoreError> {
        let q = format!(
            "SELECT work_state, COUNT(*) FROM {} GROUP BY work_state",
            self.experiments
        );
        let rows: Vec<(String, i64)> = sqlx::query_as(&q)
            .fetch_all(&self.pool)
            .await
            .map_err(pg_err("state_counts"))?;

        let mut counts = BTreeMap::new();
        for (state, count) in rows {
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
        if !self.record_exists(trace_id).await? {
            return Err(StoreError::NotFound(trace_id));
        }

        let mut tx = self.pool.begin().await.map_err(pg_err("put_trace"))?;
        self.write_trace(&mut tx, trace_id, trace)
            .await
            .map_err(pg_err("put_trace"))?;
        tx.commit().await.map_err(pg_err("put_trace"))?;

        debug!(trace_id, jobs = trace.job_count(), "stored trace");
        Ok(())
    }

    async fn get_trace(&self, trace_id: u64) -> Result<Option<Trace>, StoreError> {
        let q = format!(
            "SELECT id_job, job_name, timelimit, cpus_req, dependency, manifest,
                    time_submit, time_start, time_end
             FROM {} WHERE trace_id = $1 ORDER BY seq",
            self.traces
        );
        #[allow(clippy::type_complexity)]
        let rows: Vec<(i64, String, i64, i64, String, String, i64, i64, i64)> =
            sqlx::query_as(&q)
                .bind(trace_id as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(pg_err("get_trace"))?;

        if rows.is_empty() {
            return Ok(None);
        }
        let jobs = rows
            .into_iter()
            .map(
                |(id_job, job_name, timelimit, cpus_req, dependency, manifest, submit, start, end)| {
                    JobRecord {
                        id_job: id_job as u64,
                        job_name,
                        timelimit: timelimit as u64,
                        cpus_req: cpus_req as u32,
                        dependency,
                        manifest,
                        time_submit: submit,
                        time_start: start,
                        time_end: end,
                    }
                },
            )
            .collect();
        Ok(Some(Trace::new(jobs)))
    }

    async fn trace_job_count(&self, trace_id: u64) -> Result<Option<usize>, StoreError> {
        let q = format!("SELECT COUNT(*) FROM {} WHERE trace_id = $1", self.traces);
        let count: i64 = sqlx::query_scalar(&q)
            .bind(trace_id as i64)
            .fetch_one(&self.pool)
            .await
            .map_err(pg_err("trace_job_count"))?;
        Ok((count > 0).then_some(count as usize))
    }

    async fn put_result(&self, trace_id: u64, entry: &ResultEntry) -> Result<(), StoreError> {
        if !self.record_exists(trace_id).await? {
            return Err(StoreError::NotFound(trace_id));
        }
        let payload = serde_json::to_string(entry)?;
        let mut conn = self.pool.acquire().await.map_err(pg_err("put_result"))?;
        self.write_result(&mut conn, trace_id, entry.kind(), &payload)
            .await
            .map_err(pg_err("put_result"))?;
        Ok(())
    }

    async fn get_result(
        &self,
        trace_id: u64,
        kind: ResultKind,
    ) -> Result<Option<ResultEntry>, StoreError> {
        let q = format!(
            "SELECT payload FROM {} WHERE trace_id = $1 AND kind = $2",
            self.results
        );
        let payload: Option<String> = sqlx::query_scalar(&q)
            .bind(trace_id as i64)
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(pg_err("get_result"))?;
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn list_results(&self, trace_id: u64) -> Result<Vec<ResultEntry>, StoreError> {
        let q = format!("SELECT payload FROM {} WHERE trace_id = $1", self.results);
        let payloads: Vec<String> = sqlx::query_scalar(&q)
            .bind(trace_id as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(pg_err("list_results"))?;

        let mut entries = payloads
            .iter()
            .map(|p| serde_json::from_str::<ResultEntry>(p))
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|e| e.kind());
        Ok(entries)
    }
}
