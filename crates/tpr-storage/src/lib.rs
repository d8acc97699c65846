//! HTTP transport with bounded retry + the SQLite record store for mirrored judge data.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use reqwest::{StatusCode, Url};
use serde::Serialize;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Semaphore;
use tpr_core::{LinkedUser, RemoteProblem, RemoteSubmission, Verdict};
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "tpr-storage";

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Only connection-level trouble is worth another attempt. A response that
/// made it back, whatever its status, is an answer.
pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 4,
        }
    }
}

/// A successful response. `body` is already decoded using the charset the
/// server declared (UTF-8 when it declared none).
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

impl FetchedResponse {
    pub fn text(&self) -> &str {
        &self.body
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transient network failure for {url}: {source}")]
    Transient {
        url: String,
        #[source]
        source: BoxError,
    },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    fn from_reqwest(url: &Url, err: reqwest::Error) -> Self {
        match classify_reqwest_error(&err) {
            RetryDisposition::Retryable => Self::Transient {
                url: url.to_string(),
                source: Box::new(err),
            },
            RetryDisposition::NonRetryable => Self::Request {
                url: url.to_string(),
                source: err,
            },
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// One GET against the remote. Implementations decide nothing about retries;
/// wrap them in [`RetryingTransport`] for that.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &Url) -> Result<FetchedResponse, FetchError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn get(&self, url: &Url) -> Result<FetchedResponse, FetchError> {
        (**self).get(url).await
    }
}

/// Single-attempt reqwest transport with a process-wide concurrency cap.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }
}

#[async_trait]
impl Transport for HttpFetcher {
    async fn get(&self, url: &Url) -> Result<FetchedResponse, FetchError> {
        // The semaphore is never closed, so a failed acquire only means "no cap".
        let _permit = self.global_limit.acquire().await.ok();

        let span = info_span!("http_fetch", %url);
        async {
            let resp = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(|err| FetchError::from_reqwest(url, err))?;

            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp
                .text()
                .await
                .map_err(|err| FetchError::from_reqwest(url, err))?;
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

/// Retries transient failures of the wrapped transport with exponential backoff.
/// Status failures pass straight through.
#[derive(Debug)]
pub struct RetryingTransport<T> {
    inner: T,
    backoff: BackoffPolicy,
}

impl<T: Transport> RetryingTransport<T> {
    pub fn new(inner: T, backoff: BackoffPolicy) -> Self {
        Self { inner, backoff }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: Transport> Transport for RetryingTransport<T> {
    async fn get(&self, url: &Url) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.inner.get(url).await {
                Ok(resp) => return Ok(resp),
                Err(err) if err.is_transient() && attempt < self.backoff.max_retries => {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(%url, attempt = attempt + 1, ?delay, error = %err, "retrying fetch");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("no linked user for chat id {chat_id}")]
    UserNotFound { chat_id: u64 },
    #[error("{field} value {value} is out of range for the store")]
    OutOfRange { field: &'static str, value: String },
}

fn to_db<T>(field: &'static str, value: T) -> Result<i64, StoreError>
where
    T: TryInto<i64> + Copy + ToString,
{
    value.try_into().map_err(|_| StoreError::OutOfRange {
        field,
        value: value.to_string(),
    })
}

fn from_db<T: TryFrom<i64>>(row: &SqliteRow, field: &'static str) -> Result<T, StoreError> {
    let raw: i64 = row.try_get(field)?;
    T::try_from(raw).map_err(|_| StoreError::OutOfRange {
        field,
        value: raw.to_string(),
    })
}

/// The slice of the global feed a watermark describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedScope {
    All,
    AcceptedOnly,
}

impl FeedScope {
    pub fn for_filter(accepted_only: bool) -> Self {
        if accepted_only {
            Self::AcceptedOnly
        } else {
            Self::All
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::All => "global",
            Self::AcceptedOnly => "global:accepted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub users: u64,
    pub problems: u64,
    pub submissions: u64,
}

/// Persistence for users, problems and submissions.
///
/// Uniqueness of `submit_id`, problem `number` and user `chat_id` is enforced
/// by the schema; every multi-row write runs in one transaction.
#[derive(Debug, Clone)]
pub struct RecordStore {
    pool: SqlitePool,
}

impl RecordStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Private in-memory database. One connection, kept alive for the pool's lifetime.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert or refresh a problem by number. Returns the local row id.
    pub async fn upsert_problem(&self, problem: &RemoteProblem) -> Result<i64, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO problems (number, title, difficulty, solved_count, limits_text, statement_text, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(number) DO UPDATE SET
                title = excluded.title,
                difficulty = excluded.difficulty,
                solved_count = excluded.solved_count,
                limits_text = excluded.limits_text,
                statement_text = excluded.statement_text,
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(i64::from(problem.number))
        .bind(&problem.title)
        .bind(i64::from(problem.difficulty))
        .bind(i64::from(problem.solved_count))
        .bind(&problem.limits_text)
        .bind(&problem.statement_text)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn problem(&self, number: u32) -> Result<Option<RemoteProblem>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT number, title, difficulty, solved_count, limits_text, statement_text
              FROM problems
             WHERE number = ?1
            "#,
        )
        .bind(i64::from(number))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(problem_from_row).transpose()
    }

    /// Whole catalog, most solved first.
    pub async fn problems(&self) -> Result<Vec<RemoteProblem>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT number, title, difficulty, solved_count, limits_text, statement_text
              FROM problems
             ORDER BY solved_count DESC, number ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(problem_from_row).collect()
    }

    /// Insert the records whose `submit_id` is not stored yet; known ids are skipped.
    /// The batch commits as a whole or not at all. Returns the number of new rows.
    pub async fn insert_new_submissions(&self, batch: &[RemoteSubmission]) -> Result<u64, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let inserted = insert_rows(&mut tx, batch).await?;
        tx.commit().await?;

        debug!(offered = batch.len(), inserted, "stored submission batch");
        Ok(inserted)
    }

    /// Like [`Self::insert_new_submissions`], and in the same transaction
    /// raise the feed watermark of `scope` to `covered_up_to` when given. Only
    /// pass an id once every remote id in scope at or below it is stored or in
    /// `batch`.
    pub async fn commit_feed_batch(
        &self,
        batch: &[RemoteSubmission],
        scope: FeedScope,
        covered_up_to: Option<u64>,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let inserted = insert_rows(&mut tx, batch).await?;
        if let Some(watermark) = covered_up_to {
            sqlx::query(
                r#"
                INSERT INTO sync_state (target, watermark, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(target) DO UPDATE SET
                    watermark = MAX(sync_state.watermark, excluded.watermark),
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(scope.key())
            .bind(to_db("watermark", watermark)?)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(offered = batch.len(), inserted, ?covered_up_to, "stored feed batch");
        Ok(inserted)
    }

    /// Highest id up to which the global feed is known to be mirrored without
    /// gaps. Rows stored by per-author syncs do not move it.
    pub async fn feed_watermark(&self, scope: FeedScope) -> Result<Option<u64>, StoreError> {
        let value = sqlx::query_scalar::<_, i64>("SELECT watermark FROM sync_state WHERE target = ?1")
            .bind(scope.key())
            .fetch_optional(&self.pool)
            .await?;
        value.map(watermark_from_db).transpose()
    }

    /// Highest stored `submit_id` for the author: the sync watermark.
    pub async fn latest_submission_id(&self, author_id: u32) -> Result<Option<u64>, StoreError> {
        let max = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MAX(submit_id) FROM submissions WHERE author_id = ?1",
        )
        .bind(i64::from(author_id))
        .fetch_one(&self.pool)
        .await?;
        max.map(watermark_from_db).transpose()
    }

    /// Every stored submission of the author, newest first.
    pub async fn submissions_for(&self, author_id: u32) -> Result<Vec<RemoteSubmission>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT submit_id, author_id, problem_id, submitted_at, language, verdict, test_index, runtime_ms, memory_kb
              FROM submissions
             WHERE author_id = ?1
             ORDER BY submit_id DESC
            "#,
        )
        .bind(i64::from(author_id))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(submission_from_row).collect()
    }

    /// Link a chat identity to a remote author, replacing any previous link.
    pub async fn link_user(&self, chat_id: u64, author_id: u32) -> Result<LinkedUser, StoreError> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO users (chat_id, author_id, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?3)
            ON CONFLICT(chat_id) DO UPDATE SET
                author_id = excluded.author_id,
                updated_at = excluded.updated_at
            RETURNING id, chat_id, author_id
            "#,
        )
        .bind(to_db("chat_id", chat_id)?)
        .bind(i64::from(author_id))
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        user_from_row(&row)
    }

    pub async fn lookup_user(&self, chat_id: u64) -> Result<LinkedUser, StoreError> {
        let row = sqlx::query("SELECT id, chat_id, author_id FROM users WHERE chat_id = ?1")
            .bind(to_db("chat_id", chat_id)?)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => user_from_row(&row),
            None => Err(StoreError::UserNotFound { chat_id }),
        }
    }

    pub async fn linked_users(&self) -> Result<Vec<LinkedUser>, StoreError> {
        let rows = sqlx::query("SELECT id, chat_id, author_id FROM users ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(user_from_row).collect()
    }

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT (SELECT COUNT(*) FROM users) AS users,
                   (SELECT COUNT(*) FROM problems) AS problems,
                   (SELECT COUNT(*) FROM submissions) AS submissions
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(StoreStats {
            users: from_db(&row, "users")?,
            problems: from_db(&row, "problems")?,
            submissions: from_db(&row, "submissions")?,
        })
    }
}

async fn insert_rows(conn: &mut SqliteConnection, batch: &[RemoteSubmission]) -> Result<u64, StoreError> {
    let mut inserted = 0u64;
    for submission in batch {
        let result = sqlx::query(
            r#"
            INSERT INTO submissions
                (submit_id, author_id, problem_id, submitted_at, language, verdict, test_index, runtime_ms, memory_kb)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(submit_id) DO NOTHING
            "#,
        )
        .bind(to_db("submit_id", submission.submit_id)?)
        .bind(to_db("author_id", submission.author_id)?)
        .bind(i64::from(submission.problem_id))
        .bind(submission.submitted_at)
        .bind(&submission.language)
        .bind(submission.verdict.as_str())
        .bind(i64::from(submission.test_index))
        .bind(i64::from(submission.runtime_ms))
        .bind(i64::from(submission.memory_kb))
        .execute(&mut *conn)
        .await?;
        inserted += result.rows_affected();
    }
    Ok(inserted)
}

fn watermark_from_db(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::OutOfRange {
        field: "submit_id",
        value: value.to_string(),
    })
}

fn submission_from_row(row: &SqliteRow) -> Result<RemoteSubmission, StoreError> {
    let submitted_at: NaiveDateTime = row.try_get("submitted_at")?;
    let verdict: String = row.try_get("verdict")?;
    Ok(RemoteSubmission {
        submit_id: from_db(row, "submit_id")?,
        author_id: from_db(row, "author_id")?,
        problem_id: from_db(row, "problem_id")?,
        submitted_at,
        language: row.try_get("language")?,
        verdict: Verdict::parse(&verdict),
        test_index: from_db(row, "test_index")?,
        runtime_ms: from_db(row, "runtime_ms")?,
        memory_kb: from_db(row, "memory_kb")?,
    })
}

fn problem_from_row(row: &SqliteRow) -> Result<RemoteProblem, StoreError> {
    Ok(RemoteProblem {
        number: from_db(row, "number")?,
        title: row.try_get("title")?,
        difficulty: from_db(row, "difficulty")?,
        solved_count: from_db(row, "solved_count")?,
        limits_text: row.try_get("limits_text")?,
        statement_text: row.try_get("statement_text")?,
    })
}

fn user_from_row(row: &SqliteRow) -> Result<LinkedUser, StoreError> {
    Ok(LinkedUser {
        local_id: row.try_get("id")?,
        external_chat_id: from_db(row, "chat_id")?,
        remote_author_id: from_db(row, "author_id")?,
    })
}
