//! Durable job store for careerscan: SQLite-backed job rows, scrape runs and the dedup index.
//!
//! Every mutation is a single statement keyed by `url_hash` or primary id, so
//! concurrent extraction workers never need cross-worker locking; the database
//! is the serialization point.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use careerscan_core::{
    ExtractStatus, ExtractedFields, FailureReason, JobRecord, KeyedCandidate, RunCounts,
    RunStatus, ScrapeRun, UrlHash,
};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, Sqlite};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "careerscan-storage";

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
    #[error("job store migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt {table} row {id}: {message}")]
    Corrupt {
        table: &'static str,
        id: i64,
        message: String,
    },
    #[error("cannot finalize a run with non-terminal status {0}")]
    NotTerminal(RunStatus),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Result of `upsert_discovered`: the stable row id and whether this call created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upserted {
    pub id: i64,
    pub inserted: bool,
}

/// Read-side filter for `list_jobs` / `count_jobs`.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub source_id: Option<String>,
    pub status: Option<ExtractStatus>,
    pub processed: Option<bool>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Per-source job counts for the status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSummary {
    pub source_id: String,
    pub total: u32,
    pub extracted: u32,
    pub failed: u32,
    pub pending: u32,
    pub analyzed: u32,
    pub last_scraped_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Connect to a `sqlite:` URL, creating the database file if needed, and migrate.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?;
        Self::connect_with(options).await
    }

    pub async fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::connect_with(SqliteConnectOptions::new().filename(path.as_ref())).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> Result<Self> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ---- jobs: write side ----

    /// Insert a placeholder row for a newly seen hash, or return the existing id.
    ///
    /// Content fields of an existing row are never touched.
    pub async fn upsert_discovered(
        &self,
        source_id: &str,
        candidate: &KeyedCandidate,
    ) -> Result<Upserted> {
        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (url_hash, canonical_url, source_id, title, team, location, discovered_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(url_hash) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(candidate.hash.as_str())
        .bind(candidate.canonical.as_str())
        .bind(source_id)
        .bind(&candidate.link.title)
        .bind(candidate.link.team.as_deref())
        .bind(candidate.link.location.as_deref())
        .bind(now_ts())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(id) = inserted {
            debug!(job_id = id, url_hash = %candidate.hash, "job placeholder inserted");
            return Ok(Upserted { id, inserted: true });
        }

        let id: i64 = sqlx::query_scalar("SELECT id FROM jobs WHERE url_hash = ?")
            .bind(candidate.hash.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(Upserted {
            id,
            inserted: false,
        })
    }

    /// Write extracted content onto the row and mark it processed.
    ///
    /// Returns false when no row has this id.
    pub async fn update_extracted(
        &self,
        id: i64,
        fields: &ExtractedFields,
        attempts: u32,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET title = ?,
                raw_description = ?,
                team = COALESCE(?, team),
                location = COALESCE(?, location),
                employment_type = ?,
                scraped_at = ?,
                processed = 1,
                extract_status = 'extracted',
                failure_reason = NULL,
                failure_detail = NULL,
                attempts = ?
            WHERE id = ?
            "#,
        )
        .bind(&fields.title)
        .bind(&fields.raw_description)
        .bind(fields.team.as_deref())
        .bind(fields.location.as_deref())
        .bind(fields.employment_type.as_deref())
        .bind(now_ts())
        .bind(i64::from(attempts))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Record a terminal extraction failure. The row stays `processed = false`.
    ///
    /// Rows that were already extracted are left alone and false is returned.
    pub async fn mark_failed(
        &self,
        id: i64,
        reason: FailureReason,
        detail: &str,
        attempts: u32,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET extract_status = 'failed',
                failure_reason = ?,
                failure_detail = ?,
                attempts = ?
            WHERE id = ? AND processed = 0
            "#,
        )
        .bind(reason.as_str())
        .bind(detail)
        .bind(i64::from(attempts))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Stamp a job as consumed by the analysis pipeline.
    pub async fn mark_analyzed(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE jobs SET analyzed_at = ? WHERE id = ? AND processed = 1")
            .bind(now_ts())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    // ---- jobs: read side ----

    pub async fn exists(&self, hash: &UrlHash) -> Result<bool> {
        let found: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM jobs WHERE url_hash = ?)")
                .bind(hash.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(found)
    }

    pub async fn get_job(&self, id: i64) -> Result<Option<JobRecord>> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRow::into_record).transpose()
    }

    pub async fn get_job_by_hash(&self, hash: &UrlHash) -> Result<Option<JobRecord>> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE url_hash = ?")
            .bind(hash.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRow::into_record).transpose()
    }

    /// Rows not yet extracted (pending or failed), oldest first.
    pub async fn list_unprocessed(
        &self,
        source_id: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Vec<JobRecord>> {
        self.list_jobs(&JobFilter {
            source_id: source_id.map(ToString::to_string),
            processed: Some(false),
            limit,
            ..Default::default()
        })
        .await
    }

    /// Extracted rows the analysis pipeline has not consumed yet.
    pub async fn list_awaiting_analysis(&self, limit: Option<u32>) -> Result<Vec<JobRecord>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT * FROM jobs WHERE processed = 1 AND analyzed_at IS NULL ORDER BY id",
        );
        if let Some(limit) = limit {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
        }
        let rows: Vec<JobRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(JobRow::into_record).collect()
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM jobs");
        push_job_filter(&mut qb, filter);
        qb.push(" ORDER BY id");
        if filter.limit.is_some() || filter.offset.is_some() {
            qb.push(" LIMIT ")
                .push_bind(filter.limit.map(i64::from).unwrap_or(-1));
            qb.push(" OFFSET ")
                .push_bind(i64::from(filter.offset.unwrap_or(0)));
        }
        let rows: Vec<JobRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(JobRow::into_record).collect()
    }

    pub async fn count_jobs(&self, filter: &JobFilter) -> Result<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM jobs");
        push_job_filter(&mut qb, filter);
        let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    pub async fn count_analyzed_since(&self, since: DateTime<Utc>) -> Result<u32> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE analyzed_at >= ?")
                .bind(format_ts(since))
                .fetch_one(&self.pool)
                .await?;
        Ok(clamp_u32(count))
    }

    /// One summary per source that has any job rows, ordered by source id.
    pub async fn source_summaries(&self) -> Result<Vec<SourceSummary>> {
        let rows: Vec<SummaryRow> = sqlx::query_as(
            "SELECT source_id, \
                    MAX(id) AS newest_id, \
                    COUNT(*) AS total, \
                    SUM(CASE WHEN extract_status = 'extracted' THEN 1 ELSE 0 END) AS extracted, \
                    SUM(CASE WHEN extract_status = 'failed' THEN 1 ELSE 0 END) AS failed, \
                    SUM(CASE WHEN extract_status = 'pending' THEN 1 ELSE 0 END) AS pending, \
                    SUM(CASE WHEN analyzed_at IS NOT NULL THEN 1 ELSE 0 END) AS analyzed, \
                    MAX(scraped_at) AS last_scraped_at \
             FROM jobs GROUP BY source_id ORDER BY source_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SummaryRow::into_summary).collect()
    }

    // ---- scrape runs ----

    /// Open a new run in `running` state.
    pub async fn record_run(&self, source_id: Option<&str>) -> Result<ScrapeRun> {
        let row: RunRow = sqlx::query_as(
            r#"
            INSERT INTO scrape_runs (source_id, started_at, status)
            VALUES (?, ?, 'running')
            RETURNING *
            "#,
        )
        .bind(source_id)
        .bind(now_ts())
        .fetch_one(&self.pool)
        .await?;
        row.into_run()
    }

    /// Progress checkpoint while the run is still open.
    pub async fn record_discovered(&self, run_id: i64, jobs_discovered: u32) -> Result<()> {
        sqlx::query(
            "UPDATE scrape_runs SET jobs_discovered = ? WHERE id = ? AND status = 'running'",
        )
        .bind(i64::from(jobs_discovered))
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Close a running run. A run that already left `running` is never rewritten.
    pub async fn finalize_run(
        &self,
        run_id: i64,
        status: RunStatus,
        counts: RunCounts,
        error_message: Option<&str>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(StoreError::NotTerminal(status));
        }
        let result = sqlx::query(
            r#"
            UPDATE scrape_runs
            SET status = ?,
                completed_at = ?,
                jobs_discovered = ?,
                jobs_scraped = ?,
                jobs_analyzed = ?,
                error_message = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(status.as_str())
        .bind(now_ts())
        .bind(i64::from(counts.jobs_discovered))
        .bind(i64::from(counts.jobs_scraped))
        .bind(i64::from(counts.jobs_analyzed))
        .bind(error_message)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get_run(&self, run_id: i64) -> Result<Option<ScrapeRun>> {
        let row: Option<RunRow> = sqlx::query_as("SELECT * FROM scrape_runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(RunRow::into_run).transpose()
    }

    pub async fn recent_runs(&self, limit: u32) -> Result<Vec<ScrapeRun>> {
        let rows: Vec<RunRow> =
            sqlx::query_as("SELECT * FROM scrape_runs ORDER BY id DESC LIMIT ?")
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(RunRow::into_run).collect()
    }
}

/// Dedup view over the store's unique `url_hash` index.
#[derive(Debug, Clone)]
pub struct DedupIndex {
    store: JobStore,
}

impl DedupIndex {
    pub fn new(store: JobStore) -> Self {
        Self { store }
    }

    pub async fn exists(&self, hash: &UrlHash) -> Result<bool> {
        self.store.exists(hash).await
    }

    /// Idempotent: marking an already-known hash returns the existing id.
    pub async fn mark_known(&self, source_id: &str, candidate: &KeyedCandidate) -> Result<Upserted> {
        self.store.upsert_discovered(source_id, candidate).await
    }

    /// Split candidates into (new, already known) without writing anything.
    pub async fn partition(
        &self,
        candidates: Vec<KeyedCandidate>,
    ) -> Result<(Vec<KeyedCandidate>, Vec<KeyedCandidate>)> {
        let mut fresh = Vec::new();
        let mut known = Vec::new();
        for candidate in candidates {
            if self.exists(&candidate.hash).await? {
                known.push(candidate);
            } else {
                fresh.push(candidate);
            }
        }
        Ok((fresh, known))
    }
}

fn push_job_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &JobFilter) {
    let mut sep = " WHERE ";
    if let Some(source_id) = &filter.source_id {
        qb.push(sep).push("source_id = ").push_bind(source_id.clone());
        sep = " AND ";
    }
    if let Some(status) = filter.status {
        qb.push(sep).push("extract_status = ").push_bind(status.as_str());
        sep = " AND ";
    }
    if let Some(processed) = filter.processed {
        qb.push(sep).push("processed = ").push_bind(processed);
    }
}

fn clamp_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now_ts() -> String {
    format_ts(Utc::now())
}

fn parse_ts(table: &'static str, id: i64, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            table,
            id,
            message: format!("bad timestamp {value:?}: {e}"),
        })
}

fn parse_opt_ts(table: &'static str, id: i64, value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_ts(table, id, v)).transpose()
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: i64,
    url_hash: String,
    canonical_url: String,
    source_id: String,
    title: String,
    team: Option<String>,
    location: Option<String>,
    employment_type: Option<String>,
    raw_description: String,
    discovered_at: String,
    scraped_at: Option<String>,
    processed: bool,
    extract_status: String,
    failure_reason: Option<String>,
    failure_detail: Option<String>,
    attempts: i64,
    analyzed_at: Option<String>,
}

impl JobRow {
    fn into_record(self) -> Result<JobRecord> {
        const TABLE: &str = "jobs";
        let id = self.id;
        let corrupt = |message: String| StoreError::Corrupt {
            table: TABLE,
            id,
            message,
        };
        let url_hash = UrlHash::from_hex(self.url_hash.clone())
            .ok_or_else(|| corrupt(format!("bad url_hash {:?}", self.url_hash)))?;
        let extract_status = self
            .extract_status
            .parse::<ExtractStatus>()
            .map_err(|e| corrupt(e.to_string()))?;
        let failure_reason = self
            .failure_reason
            .as_deref()
            .map(FailureReason::from_str)
            .transpose()
            .map_err(|e| corrupt(e.to_string()))?;

        Ok(JobRecord {
            id,
            url_hash,
            canonical_url: self.canonical_url,
            source_id: self.source_id,
            title: self.title,
            team: self.team,
            location: self.location,
            employment_type: self.employment_type,
            raw_description: self.raw_description,
            discovered_at: parse_ts(TABLE, id, &self.discovered_at)?,
            scraped_at: parse_opt_ts(TABLE, id, self.scraped_at.as_deref())?,
            processed: self.processed,
            extract_status,
            failure_reason,
            failure_detail: self.failure_detail,
            attempts: clamp_u32(self.attempts),
            analyzed_at: parse_opt_ts(TABLE, id, self.analyzed_at.as_deref())?,
        })
    }
}

#[derive(Debug, FromRow)]
struct SummaryRow {
    source_id: String,
    newest_id: i64,
    total: i64,
    extracted: i64,
    failed: i64,
    pending: i64,
    analyzed: i64,
    last_scraped_at: Option<String>,
}

impl SummaryRow {
    fn into_summary(self) -> Result<SourceSummary> {
        Ok(SourceSummary {
            last_scraped_at: parse_opt_ts("jobs", self.newest_id, self.last_scraped_at.as_deref())?,
            source_id: self.source_id,
            total: clamp_u32(self.total),
            extracted: clamp_u32(self.extracted),
            failed: clamp_u32(self.failed),
            pending: clamp_u32(self.pending),
            analyzed: clamp_u32(self.analyzed),
        })
    }
}

#[derive(Debug, FromRow)]
struct RunRow {
    id: i64,
    source_id: Option<String>,
    started_at: String,
    completed_at: Option<String>,
    jobs_discovered: i64,
    jobs_scraped: i64,
    jobs_analyzed: i64,
    status: String,
    error_message: Option<String>,
}

impl RunRow {
    fn into_run(self) -> Result<ScrapeRun> {
        const TABLE: &str = "scrape_runs";
        let status = self.status.parse::<RunStatus>().map_err(|e| StoreError::Corrupt {
            table: TABLE,
            id: self.id,
            message: e.to_string(),
        })?;
        Ok(ScrapeRun {
            id: self.id,
            source_id: self.source_id,
            started_at: parse_ts(TABLE, self.id, &self.started_at)?,
            completed_at: parse_opt_ts(TABLE, self.id, self.completed_at.as_deref())?,
            jobs_discovered: clamp_u32(self.jobs_discovered),
            jobs_scraped: clamp_u32(self.jobs_scraped),
            jobs_analyzed: clamp_u32(self.jobs_analyzed),
            status,
            error_message: self.error_message,
        })
    }
}
