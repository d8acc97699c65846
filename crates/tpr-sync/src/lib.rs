//! Incremental mirroring of the judge's submission feed.
//!
//! [`SyncCursor`] holds the pagination state (frontier, watermark, accumulated
//! records) and decides when a run is complete; [`PaginationDriver`] feeds it
//! pages from a [`SubmissionSource`]; [`SyncService`] wires the driver to the
//! [`RecordStore`] and exposes the operations the bot and CLI call.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_cron_scheduler::{Job, JobScheduler};
use tpr_adapters::{ClientError, ParseError, ProblemSource, SubmissionSource, TimusClient};
use tpr_core::{LinkedUser, RemoteProblem, RemoteSubmission, SubmissionQuery, SyncTarget};
use tpr_storage::{
    BackoffPolicy, FeedScope, FetchError, HttpClientConfig, HttpFetcher, RecordStore, RetryingTransport,
    StoreError,
};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tpr-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub remote_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_retries: usize,
    pub page_size: u32,
    pub max_pages: usize,
    pub page_delay_ms: u64,
    pub accepted_only: bool,
    pub recommend_limit: usize,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        Self {
            database_url: text("DATABASE_URL", "sqlite://tpr.sqlite"),
            remote_url: text("TPR_REMOTE_URL", "https://timus.online"),
            user_agent: text("TPR_USER_AGENT", "tpr-bot/0.1"),
            http_timeout_secs: parsed(&lookup, "TPR_HTTP_TIMEOUT_SECS", 20),
            max_retries: parsed(&lookup, "TPR_MAX_RETRIES", 3),
            page_size: parsed(&lookup, "TPR_PAGE_SIZE", 100),
            max_pages: parsed(&lookup, "TPR_MAX_PAGES", 10_000),
            page_delay_ms: parsed(&lookup, "TPR_PAGE_DELAY_MS", 0),
            accepted_only: flag(&lookup, "TPR_ACCEPTED_ONLY"),
            recommend_limit: parsed(&lookup, "TPR_RECOMMEND_LIMIT", 10),
            scheduler_enabled: flag(&lookup, "TPR_SCHEDULER_ENABLED"),
            sync_cron: text("TPR_SYNC_CRON", "0 */30 * * * *"),
        }
    }

    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            page_size: self.page_size.max(1),
            max_pages: self.max_pages.max(1),
            accepted_only: self.accepted_only,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> bool {
    lookup(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("network failure: {0}")]
    Network(#[source] FetchError),
    #[error("remote protocol violation: {0}")]
    RemoteProtocol(String),
    #[error("malformed remote page: {0}")]
    Parse(#[from] ParseError),
    #[error("pagination did not reach known data after {pages} pages")]
    PaginationLimit { pages: usize },
    #[error("storage failure: {0}")]
    Storage(#[source] StoreError),
    #[error("no linked user for chat id {chat_id}")]
    UserNotFound { chat_id: u64 },
    #[error("recommender failed: {0:#}")]
    Recommender(anyhow::Error),
}

impl SyncError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::RemoteProtocol(_) => "remote_protocol",
            Self::Parse(_) => "parse",
            Self::PaginationLimit { .. } => "pagination_limit",
            Self::Storage(_) => "storage",
            Self::UserNotFound { .. } => "user_not_found",
            Self::Recommender(_) => "recommender",
        }
    }

    /// Text safe to show an end user. Details belong in the logs.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::UserNotFound { .. } => "You are not registered yet. Send your Timus author id to link your account.",
            _ => "Something went wrong while talking to Timus. Please try again later.",
        }
    }
}

impl From<ClientError> for SyncError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Fetch(FetchError::HttpStatus { status, url }) => {
                Self::RemoteProtocol(format!("http status {status} for {url}"))
            }
            ClientError::Fetch(fetch) => Self::Network(fetch),
            ClientError::Parse(parse) => Self::Parse(parse),
            ClientError::InvalidUrl(url) => Self::RemoteProtocol(format!("invalid remote url {url}")),
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UserNotFound { chat_id } => Self::UserNotFound { chat_id },
            other => Self::Storage(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    Continue,
    WatermarkReached,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    WatermarkReached,
    Exhausted,
}

/// Pagination state for one run against one target.
///
/// `frontier` is the inclusive upper bound for the next request (`None` means
/// "newest"). Records at or below `watermark` are already stored and end the
/// run. Nothing here touches the network or the store.
#[derive(Debug, Clone)]
pub struct SyncCursor {
    frontier: Option<u64>,
    watermark: u64,
    accumulated: Vec<RemoteSubmission>,
    pages: usize,
}

impl SyncCursor {
    pub fn new(watermark: Option<u64>) -> Self {
        Self::starting_at(None, watermark)
    }

    pub fn starting_at(frontier: Option<u64>, watermark: Option<u64>) -> Self {
        Self {
            frontier,
            watermark: watermark.unwrap_or(0),
            accumulated: Vec::new(),
            pages: 0,
        }
    }

    pub fn frontier(&self) -> Option<u64> {
        self.frontier
    }

    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn accumulated(&self) -> &[RemoteSubmission] {
        &self.accumulated
    }

    pub fn take_accumulated(&mut self) -> Vec<RemoteSubmission> {
        std::mem::take(&mut self.accumulated)
    }

    pub fn into_accumulated(self) -> Vec<RemoteSubmission> {
        self.accumulated
    }

    /// Fold one page (in the order received) into the state.
    ///
    /// A page holding an id above the frontier it was requested with is
    /// rejected whole; nothing from it is accumulated.
    pub fn absorb(&mut self, page: Vec<RemoteSubmission>) -> Result<PageOutcome, SyncError> {
        self.pages += 1;
        if page.is_empty() {
            return Ok(PageOutcome::Exhausted);
        }

        if let Some(frontier) = self.frontier {
            if let Some(bad) = page.iter().find(|s| s.submit_id > frontier) {
                return Err(SyncError::RemoteProtocol(format!(
                    "submission {} returned for cursor {frontier}",
                    bad.submit_id
                )));
            }
        }

        let mut oldest = u64::MAX;
        for submission in page {
            if submission.submit_id <= self.watermark {
                return Ok(PageOutcome::WatermarkReached);
            }
            oldest = oldest.min(submission.submit_id);
            self.accumulated.push(submission);
        }

        match oldest.checked_sub(1) {
            None | Some(0) => Ok(PageOutcome::Exhausted),
            Some(next) => {
                self.frontier = Some(next);
                // everything at or below the next cursor is already stored
                if next <= self.watermark {
                    Ok(PageOutcome::WatermarkReached)
                } else {
                    Ok(PageOutcome::Continue)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverConfig {
    pub page_size: u32,
    pub max_pages: usize,
    pub accepted_only: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_pages: 10_000,
            accepted_only: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DriveOutcome {
    pub records: Vec<RemoteSubmission>,
    pub requests: usize,
    pub termination: Termination,
}

/// Sequential cursor-chained paging over a [`SubmissionSource`].
pub struct PaginationDriver<'a, S: ?Sized> {
    source: &'a S,
    config: DriverConfig,
}

impl<'a, S: SubmissionSource + ?Sized> PaginationDriver<'a, S> {
    pub fn new(source: &'a S, config: DriverConfig) -> Self {
        Self { source, config }
    }

    /// Fetch and absorb the next page.
    pub async fn step(&self, target: SyncTarget, cursor: &mut SyncCursor) -> Result<PageOutcome, SyncError> {
        if cursor.pages() >= self.config.max_pages {
            return Err(SyncError::PaginationLimit { pages: cursor.pages() });
        }

        let query = SubmissionQuery::for_target(target)
            .with_count(self.config.page_size)
            .with_before_id(cursor.frontier())
            .accepted_only(self.config.accepted_only);
        let page = self.source.get_submissions(&query).await?;
        let received = page.len();
        let outcome = cursor.absorb(page)?;

        debug!(
            %target,
            page = cursor.pages(),
            received,
            accumulated = cursor.accumulated().len(),
            frontier = ?cursor.frontier(),
            ?outcome,
            "page absorbed"
        );
        Ok(outcome)
    }

    /// Page from the newest record down to the watermark (or the start of history).
    pub async fn run(&self, target: SyncTarget, watermark: Option<u64>) -> Result<DriveOutcome, SyncError> {
        let mut cursor = SyncCursor::new(watermark);
        let termination = loop {
            match self.step(target, &mut cursor).await? {
                PageOutcome::Continue => continue,
                PageOutcome::WatermarkReached => break Termination::WatermarkReached,
                PageOutcome::Exhausted => break Termination::Exhausted,
            }
        };
        Ok(DriveOutcome {
            requests: cursor.pages(),
            records: cursor.into_accumulated(),
            termination,
        })
    }
}

/// Keeps at least `min_interval` between consecutive requests to the wrapped source.
pub struct PacedSource {
    inner: Arc<dyn SubmissionSource>,
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl PacedSource {
    pub fn new(inner: Arc<dyn SubmissionSource>, min_interval: Duration) -> Self {
        Self {
            inner,
            min_interval,
            last_request: Mutex::new(None),
        }
    }
}

#[async_trait]
impl SubmissionSource for PacedSource {
    async fn get_submissions(&self, query: &SubmissionQuery) -> Result<Vec<RemoteSubmission>, ClientError> {
        {
            let mut last = self.last_request.lock().await;
            if let Some(previous) = *last {
                let wait = self.min_interval.saturating_sub(previous.elapsed());
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
            }
            *last = Some(Instant::now());
        }
        self.inner.get_submissions(query).await
    }
}

/// A solved problem: the earliest accepted submission for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Interaction {
    pub problem_id: u32,
    pub submit_id: u64,
    pub solved_at: NaiveDateTime,
}

/// What the recommender sees of a user: one interaction per solved problem, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InteractionSet {
    pub interactions: Vec<Interaction>,
}

impl InteractionSet {
    pub fn from_submissions(submissions: &[RemoteSubmission]) -> Self {
        let mut first_accepted: BTreeMap<u32, &RemoteSubmission> = BTreeMap::new();
        for submission in submissions.iter().filter(|s| s.verdict.is_accepted()) {
            first_accepted
                .entry(submission.problem_id)
                .and_modify(|kept| {
                    if submission.submit_id < kept.submit_id {
                        *kept = submission;
                    }
                })
                .or_insert(submission);
        }

        let mut interactions: Vec<Interaction> = first_accepted
            .into_values()
            .map(|s| Interaction {
                problem_id: s.problem_id,
                submit_id: s.submit_id,
                solved_at: s.submitted_at,
            })
            .collect();
        interactions.sort_by_key(|i| i.submit_id);
        Self { interactions }
    }

    pub fn solved(&self) -> BTreeSet<u32> {
        self.interactions.iter().map(|i| i.problem_id).collect()
    }

    pub fn len(&self) -> usize {
        self.interactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interactions.is_empty()
    }
}

/// Ranking collaborator: interactions in, problem numbers out (best first).
#[async_trait]
pub trait Recommender: Send + Sync {
    async fn recommend(&self, interactions: &InteractionSet, limit: usize) -> anyhow::Result<Vec<u32>>;
}

/// Unsolved problems, most solved first.
pub struct PopularityRecommender {
    store: RecordStore,
}

impl PopularityRecommender {
    pub fn new(store: RecordStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Recommender for PopularityRecommender {
    async fn recommend(&self, interactions: &InteractionSet, limit: usize) -> anyhow::Result<Vec<u32>> {
        let solved = interactions.solved();
        let catalog = self.store.problems().await.context("loading problem catalog")?;
        Ok(catalog
            .into_iter()
            .map(|p| p.number)
            .filter(|number| !solved.contains(number))
            .take(limit)
            .collect())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub target: SyncTarget,
    pub watermark: Option<u64>,
    pub fetched: usize,
    pub stored: u64,
    pub requests: usize,
    pub termination: Termination,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkProgress {
    pub batch: usize,
    pub fetched: usize,
    pub stored: u64,
    pub oldest_id: Option<u64>,
    /// Pass back as the starting cursor to resume; `None` once the import is done.
    pub next_cursor: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MirrorSummary {
    pub authors: usize,
    pub stored: u64,
    pub failures: usize,
}

/// Page-at-a-time import of the global feed. Each page commits on its own so
/// progress survives an interrupted run.
pub struct BulkImport<'a> {
    service: &'a SyncService,
    driver: DriverConfig,
    cursor: SyncCursor,
    interval: Duration,
    batches: usize,
    finished: bool,
    ceiling: Option<u64>,
    _guard: OwnedMutexGuard<()>,
}

impl BulkImport<'_> {
    pub fn next_cursor(&self) -> Option<u64> {
        if self.finished {
            None
        } else {
            self.cursor.frontier()
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub async fn next_batch(&mut self) -> Result<Option<BulkProgress>, SyncError> {
        if self.finished {
            return Ok(None);
        }
        if self.batches > 0 && !self.interval.is_zero() {
            tokio::time::sleep(self.interval).await;
        }

        let driver = PaginationDriver::new(self.service.submissions.as_ref(), self.driver);
        let outcome = driver.step(SyncTarget::Global, &mut self.cursor).await?;
        let records = self.cursor.take_accumulated();
        self.ceiling = self.ceiling.or(records.iter().map(|r| r.submit_id).max());

        // Everything between the watermark and the first page's newest id is
        // stored only once the import reaches its end.
        let finished = outcome != PageOutcome::Continue;
        let covered = if finished { self.ceiling } else { None };
        let stored = self
            .service
            .store
            .commit_feed_batch(&records, FeedScope::All, covered)
            .await?;

        self.batches += 1;
        self.finished = finished;
        let progress = BulkProgress {
            batch: self.batches,
            fetched: records.len(),
            stored,
            oldest_id: records.iter().map(|r| r.submit_id).min(),
            next_cursor: self.next_cursor(),
        };
        info!(
            batch = progress.batch,
            fetched = progress.fetched,
            stored,
            next_cursor = ?progress.next_cursor,
            "bulk batch committed"
        );
        Ok(Some(progress))
    }
}

/// Orchestrates syncs, registration, catalog import and recommendations.
pub struct SyncService {
    store: RecordStore,
    submissions: Arc<dyn SubmissionSource>,
    problems: Arc<dyn ProblemSource>,
    recommender: Arc<dyn Recommender>,
    driver: DriverConfig,
    recommend_limit: usize,
    detail_delay: Duration,
    target_locks: Mutex<HashMap<SyncTarget, Arc<Mutex<()>>>>,
}

impl SyncService {
    pub fn new(
        store: RecordStore,
        submissions: Arc<dyn SubmissionSource>,
        problems: Arc<dyn ProblemSource>,
        driver: DriverConfig,
    ) -> Self {
        let recommender = Arc::new(PopularityRecommender::new(store.clone()));
        Self {
            store,
            submissions,
            problems,
            recommender,
            driver,
            recommend_limit: 10,
            detail_delay: Duration::ZERO,
            target_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_recommender(mut self, recommender: Arc<dyn Recommender>, limit: usize) -> Self {
        self.recommender = recommender;
        self.recommend_limit = limit;
        self
    }

    /// Space out requests to the remote: feed pages go through a [`PacedSource`],
    /// catalog detail pages sleep between fetches.
    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        if !delay.is_zero() {
            self.submissions = Arc::new(PacedSource::new(self.submissions, delay));
            self.detail_delay = delay;
        }
        self
    }

    /// Real remote + SQLite store, as configured.
    pub async fn connect(config: &SyncConfig) -> anyhow::Result<Self> {
        let store = RecordStore::connect(&config.database_url)
            .await
            .with_context(|| format!("opening store at {}", config.database_url))?;

        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let transport = RetryingTransport::new(
            http,
            BackoffPolicy {
                max_retries: config.max_retries,
                ..Default::default()
            },
        );
        let client = Arc::new(TimusClient::new(&config.remote_url, transport)?);

        let service = Self::new(store.clone(), client.clone(), client, config.driver_config());
        let recommender = Arc::new(PopularityRecommender::new(store));
        Ok(service
            .with_recommender(recommender, config.recommend_limit)
            .with_page_delay(Duration::from_millis(config.page_delay_ms)))
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    fn feed_scope(&self) -> FeedScope {
        FeedScope::for_filter(self.driver.accepted_only)
    }

    async fn target_lock(&self, target: SyncTarget) -> Arc<Mutex<()>> {
        let mut locks = self.target_locks.lock().await;
        // An entry nobody holds or waits on belongs to a finished run.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(target).or_default().clone()
    }

    async fn release_target(&self, target: SyncTarget, lock: Arc<Mutex<()>>) {
        drop(lock);
        let mut locks = self.target_locks.lock().await;
        if locks.get(&target).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&target);
        }
    }

    /// Incremental sync of one author's submissions.
    pub async fn sync(&self, author_id: u32) -> Result<SyncReport, SyncError> {
        self.sync_target(SyncTarget::Author(author_id)).await
    }

    /// Incremental sync of the unfiltered feed.
    pub async fn sync_global(&self) -> Result<SyncReport, SyncError> {
        self.sync_target(SyncTarget::Global).await
    }

    async fn sync_target(&self, target: SyncTarget) -> Result<SyncReport, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync", %run_id, %target);
        async move {
            let lock = self.target_lock(target).await;
            let result = {
                let _guard = lock.lock().await;
                self.sync_locked(run_id, target).await
            };
            self.release_target(target, lock).await;
            result
        }
        .instrument(span)
        .await
    }

    async fn sync_locked(&self, run_id: Uuid, target: SyncTarget) -> Result<SyncReport, SyncError> {
        let watermark = match target {
            SyncTarget::Author(author_id) => self.store.latest_submission_id(author_id).await?,
            SyncTarget::Global => self.store.feed_watermark(self.feed_scope()).await?,
        };
        let outcome = PaginationDriver::new(self.submissions.as_ref(), self.driver)
            .run(target, watermark)
            .await?;
        let stored = match target {
            SyncTarget::Author(_) => self.store.insert_new_submissions(&outcome.records).await?,
            SyncTarget::Global => {
                // A finished run has seen every id from its newest record down to the watermark.
                let newest = outcome.records.iter().map(|r| r.submit_id).max();
                self.store
                    .commit_feed_batch(&outcome.records, self.feed_scope(), newest)
                    .await?
            }
        };

        let report = SyncReport {
            run_id,
            target,
            watermark,
            fetched: outcome.records.len(),
            stored,
            requests: outcome.requests,
            termination: outcome.termination,
        };
        info!(
            fetched = report.fetched,
            stored,
            requests = report.requests,
            termination = ?report.termination,
            "sync finished"
        );
        Ok(report)
    }

    /// Link (or relink) a chat to an author, then pull the author's history.
    /// A failed initial sync is logged; the link stands.
    pub async fn register(&self, chat_id: u64, author_id: u32) -> Result<LinkedUser, SyncError> {
        let user = self.store.link_user(chat_id, author_id).await?;
        info!(chat_id, author_id, "linked user");
        if let Err(err) = self.sync(author_id).await {
            warn!(chat_id, author_id, kind = err.kind(), error = %err, "initial sync after registration failed");
        }
        Ok(user)
    }

    pub async fn recommend(&self, chat_id: u64) -> Result<Vec<u32>, SyncError> {
        let user = self.store.lookup_user(chat_id).await?;
        self.sync(user.remote_author_id).await?;

        let submissions = self.store.submissions_for(user.remote_author_id).await?;
        let interactions = InteractionSet::from_submissions(&submissions);
        let ranked = self
            .recommender
            .recommend(&interactions, self.recommend_limit)
            .await
            .map_err(SyncError::Recommender)?;
        debug!(chat_id, solved = interactions.len(), suggested = ranked.len(), "recommendations ready");
        Ok(ranked)
    }

    /// Start a resumable import of the global feed, paging down from `from`
    /// (inclusive, `None` = newest) until the feed watermark or the start of
    /// history. A completed import raises the watermark to the newest id it saw.
    pub async fn bulk_sync(
        &self,
        from: Option<u64>,
        batch_size: u32,
        interval: Duration,
    ) -> Result<BulkImport<'_>, SyncError> {
        let guard = self.target_lock(SyncTarget::Global).await.lock_owned().await;
        let watermark = self.store.feed_watermark(FeedScope::All).await?;
        let already_covered = matches!((from, watermark), (Some(from), Some(watermark)) if from <= watermark);
        info!(?from, ?watermark, batch_size, already_covered, "bulk import starting");
        Ok(BulkImport {
            service: self,
            driver: DriverConfig {
                page_size: batch_size.max(1),
                max_pages: usize::MAX,
                accepted_only: false,
            },
            cursor: SyncCursor::starting_at(from, watermark),
            interval,
            batches: 0,
            finished: already_covered,
            ceiling: None,
            _guard: guard,
        })
    }

    /// Fetch the catalog and every problem page; upsert the merged records.
    pub async fn load_problems(&self) -> Result<usize, SyncError> {
        let catalog = self.problems.get_problem_catalog().await?;
        info!(problems = catalog.len(), "catalog fetched");

        let mut stored = 0usize;
        for (idx, info) in catalog.into_iter().enumerate() {
            if idx > 0 && !self.detail_delay.is_zero() {
                tokio::time::sleep(self.detail_delay).await;
            }
            let detail = self.problems.get_problem_detail(info.number).await?;
            if detail.number != info.number {
                return Err(SyncError::RemoteProtocol(format!(
                    "problem page for {} describes {}",
                    info.number, detail.number
                )));
            }
            self.store.upsert_problem(&RemoteProblem::from_parts(info, detail)).await?;
            stored += 1;
        }
        info!(stored, "problems loaded");
        Ok(stored)
    }

    /// Sync every linked author once. Failures are counted, not fatal.
    pub async fn sync_linked_users(&self) -> Result<MirrorSummary, SyncError> {
        let authors: BTreeSet<u32> = self
            .store
            .linked_users()
            .await?
            .into_iter()
            .map(|u| u.remote_author_id)
            .collect();

        let mut summary = MirrorSummary {
            authors: authors.len(),
            ..MirrorSummary::default()
        };
        for author_id in authors {
            match self.sync(author_id).await {
                Ok(report) => summary.stored += report.stored,
                Err(err) => {
                    summary.failures += 1;
                    warn!(author_id, kind = err.kind(), error = %err, "mirror sync failed");
                }
            }
        }
        Ok(summary)
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>, config: &SyncConfig) -> anyhow::Result<Option<JobScheduler>> {
        if !config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = config.sync_cron.as_str();
        let service = Arc::clone(self);
        let job = Job::new_async(cron, move |_uuid, _l| {
            let service = Arc::clone(&service);
            Box::pin(async move {
                match service.sync_linked_users().await {
                    Ok(summary) => info!(
                        authors = summary.authors,
                        stored = summary.stored,
                        failures = summary.failures,
                        "scheduled mirror finished"
                    ),
                    Err(err) => warn!(kind = err.kind(), error = %err, "scheduled mirror failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::NaiveDate;
    use tpr_core::{ProblemDetail, ProblemInfo, Verdict};

    fn submission(submit_id: u64, author_id: u64, problem_id: u32, verdict: Verdict) -> RemoteSubmission {
        RemoteSubmission {
            submit_id,
            author_id,
            problem_id,
            submitted_at: NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
                + chrono::Duration::seconds(submit_id as i64),
            language: "G++ 13.2 x64".to_string(),
            verdict,
            test_index: 0,
            runtime_ms: 15,
            memory_kb: 400,
        }
    }

    fn accepted(ids: impl IntoIterator<Item = u64>, author_id: u64) -> Vec<RemoteSubmission> {
        ids.into_iter()
            .map(|id| submission(id, author_id, 1000 + (id % 7) as u32, Verdict::Accepted))
            .collect()
    }

    /// In-memory feed honouring the remote's filters; newest first.
    #[derive(Default)]
    struct FakeFeed {
        records: std::sync::Mutex<Vec<RemoteSubmission>>,
        requests: AtomicUsize,
        fail_on_request: Option<usize>,
        ignore_cursor: bool,
    }

    impl FakeFeed {
        fn with(records: Vec<RemoteSubmission>) -> Self {
            let feed = Self::default();
            feed.push(records);
            feed
        }

        fn push(&self, records: Vec<RemoteSubmission>) {
            let mut all = self.records.lock().unwrap();
            all.extend(records);
            all.sort_by(|a, b| b.submit_id.cmp(&a.submit_id));
        }

        fn requests(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SubmissionSource for FakeFeed {
        async fn get_submissions(&self, query: &SubmissionQuery) -> Result<Vec<RemoteSubmission>, ClientError> {
            let n = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on_request == Some(n) {
                return Err(ClientError::Fetch(FetchError::Transient {
                    url: "https://judge.test/textstatus.aspx".to_string(),
                    source: Box::new(std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out")),
                }));
            }
            let before = if self.ignore_cursor { None } else { query.before_id };
            let all = self.records.lock().unwrap();
            Ok(all
                .iter()
                .filter(|s| query.author_id.map_or(true, |a| s.author_id == u64::from(a)))
                .filter(|s| before.map_or(true, |b| s.submit_id <= b))
                .filter(|s| !query.accepted_only || s.verdict.is_accepted())
                .take(query.count.unwrap_or(100) as usize)
                .cloned()
                .collect())
        }
    }

    #[derive(Default)]
    struct FakeProblems {
        catalog: Vec<ProblemInfo>,
    }

    #[async_trait]
    impl ProblemSource for FakeProblems {
        async fn get_problem_catalog(&self) -> Result<Vec<ProblemInfo>, ClientError> {
            Ok(self.catalog.clone())
        }

        async fn get_problem_detail(&self, number: u32) -> Result<ProblemDetail, ClientError> {
            Ok(ProblemDetail {
                number,
                title: format!("Problem {number} (print)"),
                limits_text: "Time limit: 1.0 second\nMemory limit: 64 MB".to_string(),
                statement_text: format!("<div id=\"problem_text\">statement {number}</div>"),
            })
        }
    }

    fn catalog(entries: &[(u32, u32)]) -> FakeProblems {
        FakeProblems {
            catalog: entries
                .iter()
                .map(|&(number, solved_count)| ProblemInfo {
                    number,
                    title: format!("Problem {number}"),
                    difficulty: 100,
                    solved_count,
                })
                .collect(),
        }
    }

    fn driver(page_size: u32) -> DriverConfig {
        DriverConfig {
            page_size,
            ..DriverConfig::default()
        }
    }

    async fn service(feed: Arc<FakeFeed>, problems: FakeProblems, page_size: u32) -> SyncService {
        let store = RecordStore::in_memory().await.unwrap();
        SyncService::new(store, feed, Arc::new(problems), driver(page_size))
    }

    fn ids(records: &[RemoteSubmission]) -> Vec<u64> {
        records.iter().map(|r| r.submit_id).collect()
    }

    #[test]
    fn cursor_stops_at_watermark_without_including_it() {
        let mut cursor = SyncCursor::new(Some(100));

        let outcome = cursor.absorb(accepted([105, 104, 103], 7)).unwrap();
        assert_eq!(outcome, PageOutcome::Continue);
        assert_eq!(cursor.frontier(), Some(102));

        let outcome = cursor.absorb(accepted([102, 101, 100], 7)).unwrap();
        assert_eq!(outcome, PageOutcome::WatermarkReached);
        assert_eq!(ids(cursor.accumulated()), vec![105, 104, 103, 102, 101]);
        assert_eq!(cursor.pages(), 2);
    }

    #[test]
    fn cursor_rejects_ids_above_the_frontier() {
        let mut cursor = SyncCursor::new(None);
        cursor.absorb(accepted([50, 49], 1)).unwrap();
        assert_eq!(cursor.frontier(), Some(48));

        // the cursor itself is allowed back: `from` is inclusive
        assert_eq!(cursor.absorb(accepted([48, 47], 1)).unwrap(), PageOutcome::Continue);

        let err = cursor.absorb(accepted([46, 47], 1)).unwrap_err();
        assert!(matches!(err, SyncError::RemoteProtocol(_)));
        assert_eq!(ids(cursor.accumulated()), vec![50, 49, 48, 47]);
    }

    #[test]
    fn cursor_reaching_id_one_is_natural_exhaustion() {
        let mut cursor = SyncCursor::new(None);
        assert_eq!(cursor.absorb(accepted([2, 1], 1)).unwrap(), PageOutcome::Exhausted);
        assert_eq!(cursor.accumulated().len(), 2);
    }

    #[tokio::test]
    async fn scenario_watermark_100_pages_of_three() {
        let feed = FakeFeed::with(accepted(99..=105, 7));
        let outcome = PaginationDriver::new(&feed, driver(3))
            .run(SyncTarget::Author(7), Some(100))
            .await
            .unwrap();

        assert_eq!(ids(&outcome.records), vec![105, 104, 103, 102, 101]);
        assert_eq!(outcome.requests, 2);
        assert_eq!(outcome.termination, Termination::WatermarkReached);
        assert_eq!(feed.requests(), 2);
    }

    #[tokio::test]
    async fn scenario_empty_feed_is_one_request() {
        let feed = FakeFeed::default();
        let outcome = PaginationDriver::new(&feed, driver(3))
            .run(SyncTarget::Global, None)
            .await
            .unwrap();

        assert!(outcome.records.is_empty());
        assert_eq!(outcome.requests, 1);
        assert_eq!(outcome.termination, Termination::Exhausted);
    }

    #[tokio::test]
    async fn pagination_returns_exactly_the_records_above_the_watermark() {
        let n = 23u64;
        for page_size in [1u32, 2, 3, 5, 10, 50] {
            for k in 0..n {
                let feed = FakeFeed::with(accepted(1..=n, 3));
                let watermark = (k > 0).then_some(k);
                let outcome = PaginationDriver::new(&feed, driver(page_size))
                    .run(SyncTarget::Author(3), watermark)
                    .await
                    .unwrap();

                let expected: Vec<u64> = ((k + 1)..=n).rev().collect();
                assert_eq!(ids(&outcome.records), expected, "k={k} page={page_size}");
                let bound = (n - k).div_ceil(u64::from(page_size)) as usize;
                assert!(
                    outcome.requests <= bound,
                    "k={k} page={page_size}: {} requests > {bound}",
                    outcome.requests
                );
            }
        }
    }

    #[tokio::test]
    async fn up_to_date_target_costs_one_request() {
        let feed = FakeFeed::with(accepted(1..=10, 3));
        let outcome = PaginationDriver::new(&feed, driver(4))
            .run(SyncTarget::Author(3), Some(10))
            .await
            .unwrap();
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.requests, 1);
    }

    #[tokio::test]
    async fn runaway_pagination_trips_the_page_limit() {
        let feed = FakeFeed::with(accepted(1..=10, 3));
        let config = DriverConfig {
            page_size: 3,
            max_pages: 2,
            accepted_only: false,
        };
        let err = PaginationDriver::new(&feed, config)
            .run(SyncTarget::Global, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::PaginationLimit { pages: 2 }));
        assert_eq!(err.kind(), "pagination_limit");
        assert_eq!(feed.requests(), 2);
    }

    #[tokio::test]
    async fn remote_ignoring_the_cursor_aborts_the_sync() {
        let feed = Arc::new(FakeFeed {
            ignore_cursor: true,
            ..FakeFeed::default()
        });
        feed.push(accepted(1..=10, 3));
        let svc = service(feed.clone(), FakeProblems::default(), 4).await;

        let err = svc.sync(3).await.unwrap_err();
        assert_eq!(err.kind(), "remote_protocol");
        assert_eq!(feed.requests(), 2);
        assert_eq!(svc.store().latest_submission_id(3).await.unwrap(), None);
    }

    #[tokio::test]
    async fn sync_only_fetches_what_is_new_and_watermark_grows() {
        let feed = Arc::new(FakeFeed::with(accepted(1..=8, 7)));
        feed.push(accepted(9..=12, 8));
        let svc = service(feed.clone(), FakeProblems::default(), 3).await;

        let first = svc.sync(7).await.unwrap();
        assert_eq!(first.stored, 8);
        assert_eq!(first.termination, Termination::Exhausted);
        assert_eq!(svc.store().latest_submission_id(7).await.unwrap(), Some(8));

        feed.push(accepted([20, 21], 7));
        let before = feed.requests();
        let second = svc.sync(7).await.unwrap();
        assert_eq!(second.watermark, Some(8));
        assert_eq!(second.stored, 2);
        assert_eq!(second.termination, Termination::WatermarkReached);
        assert_eq!(feed.requests() - before, 1);
        assert_eq!(svc.store().latest_submission_id(7).await.unwrap(), Some(21));

        let third = svc.sync(7).await.unwrap();
        assert_eq!(third.stored, 0);
        assert_eq!(third.requests, 1);
        assert_eq!(svc.store().latest_submission_id(7).await.unwrap(), Some(21));
        assert_eq!(svc.store().latest_submission_id(8).await.unwrap(), None);
    }

    #[tokio::test]
    async fn failure_mid_sync_stores_nothing_and_retry_recovers() {
        let feed = Arc::new(FakeFeed {
            fail_on_request: Some(2),
            ..FakeFeed::default()
        });
        feed.push(accepted(1..=9, 5));
        let svc = service(feed.clone(), FakeProblems::default(), 3).await;

        let err = svc.sync(5).await.unwrap_err();
        assert_eq!(err.kind(), "network");
        assert_eq!(svc.store().stats().await.unwrap().submissions, 0);

        let report = svc.sync(5).await.unwrap();
        assert_eq!(report.stored, 9);
        assert_eq!(svc.store().latest_submission_id(5).await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn concurrent_syncs_of_one_target_run_one_after_another() {
        let feed = Arc::new(FakeFeed::with(accepted(1..=5, 4)));
        let svc = service(feed.clone(), FakeProblems::default(), 3).await;

        let (a, b) = tokio::join!(svc.sync(4), svc.sync(4));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.stored + b.stored, 5);
        // 2 pages for the first run, 1 for the second which starts at the new watermark
        assert_eq!(feed.requests(), 3);
    }

    #[tokio::test]
    async fn global_sync_resumes_from_its_own_watermark() {
        let feed = Arc::new(FakeFeed::with(accepted(1..=4, 1)));
        feed.push(accepted(5..=6, 2));
        let svc = service(feed.clone(), FakeProblems::default(), 10).await;

        assert_eq!(svc.sync_global().await.unwrap().stored, 6);
        feed.push(accepted([7], 3));
        let report = svc.sync_global().await.unwrap();
        assert_eq!(report.watermark, Some(6));
        assert_eq!(report.stored, 1);
    }

    #[tokio::test]
    async fn author_syncs_do_not_hide_older_records_from_the_global_feed() {
        let feed = Arc::new(FakeFeed::with(accepted(1..=4, 1)));
        feed.push(accepted(5..=6, 2));
        feed.push(accepted([7], 1));
        let svc = service(feed.clone(), FakeProblems::default(), 10).await;

        assert_eq!(svc.sync(1).await.unwrap().stored, 5);
        assert_eq!(svc.store().feed_watermark(FeedScope::All).await.unwrap(), None);

        let report = svc.sync_global().await.unwrap();
        assert_eq!(report.watermark, None);
        assert_eq!(report.stored, 2);
        assert_eq!(svc.store().stats().await.unwrap().submissions, 7);
        assert_eq!(svc.store().feed_watermark(FeedScope::All).await.unwrap(), Some(7));

        feed.push(accepted([8], 2));
        svc.sync(2).await.unwrap();
        feed.push(accepted([9], 3));
        let report = svc.sync_global().await.unwrap();
        assert_eq!(report.watermark, Some(7));
        assert_eq!(report.stored, 1);
        assert_eq!(svc.store().stats().await.unwrap().submissions, 9);
    }

    #[tokio::test]
    async fn bulk_import_after_author_sync_fills_the_gaps() {
        let feed = Arc::new(FakeFeed::with(accepted(1..=4, 1)));
        feed.push(accepted(5..=6, 2));
        feed.push(accepted([7], 1));
        let svc = service(feed.clone(), FakeProblems::default(), 10).await;
        svc.sync(1).await.unwrap();

        let mut import = svc.bulk_sync(None, 10, Duration::ZERO).await.unwrap();
        let mut stored = 0;
        while let Some(progress) = import.next_batch().await.unwrap() {
            stored += progress.stored;
        }
        drop(import);

        assert_eq!(stored, 2);
        assert_eq!(svc.store().stats().await.unwrap().submissions, 7);
        assert_eq!(svc.store().feed_watermark(FeedScope::All).await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn accepted_only_runs_keep_their_own_feed_watermark() {
        let feed = Arc::new(FakeFeed::with(accepted(1..=3, 1)));
        feed.push(vec![submission(4, 2, 1000, Verdict::WrongAnswer)]);
        feed.push(accepted([5], 2));
        let store = RecordStore::in_memory().await.unwrap();
        let svc = SyncService::new(
            store,
            feed.clone(),
            Arc::new(FakeProblems::default()),
            DriverConfig {
                page_size: 10,
                accepted_only: true,
                ..DriverConfig::default()
            },
        );

        assert_eq!(svc.sync_global().await.unwrap().stored, 4);
        assert_eq!(svc.store().feed_watermark(FeedScope::AcceptedOnly).await.unwrap(), Some(5));
        assert_eq!(svc.store().feed_watermark(FeedScope::All).await.unwrap(), None);

        let mut import = svc.bulk_sync(None, 10, Duration::ZERO).await.unwrap();
        let progress = import.next_batch().await.unwrap().unwrap();
        assert_eq!(progress.stored, 1);
    }

    #[tokio::test]
    async fn finished_runs_release_their_target_locks() {
        let feed = Arc::new(FakeFeed::with(accepted(1..=3, 7)));
        feed.push(accepted(4..=5, 9));
        let svc = service(feed, FakeProblems::default(), 10).await;

        svc.sync(7).await.unwrap();
        svc.sync(9).await.unwrap();
        svc.sync(11).await.unwrap();
        svc.sync_global().await.unwrap();
        assert!(svc.target_locks.lock().await.is_empty());

        {
            let mut import = svc.bulk_sync(None, 2, Duration::ZERO).await.unwrap();
            assert_eq!(svc.target_locks.lock().await.len(), 1);
            while import.next_batch().await.unwrap().is_some() {}
        }
        svc.sync(7).await.unwrap();
        assert!(svc.target_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn register_links_and_pulls_history() {
        let feed = Arc::new(FakeFeed::with(accepted(1..=3, 7)));
        let svc = service(feed, FakeProblems::default(), 10).await;

        let user = svc.register(42, 7).await.unwrap();
        assert_eq!(user.external_chat_id, 42);
        assert_eq!(user.remote_author_id, 7);
        assert_eq!(svc.store().latest_submission_id(7).await.unwrap(), Some(3));

        let relinked = svc.register(42, 9).await.unwrap();
        assert_eq!(relinked.local_id, user.local_id);
        assert_eq!(svc.store().lookup_user(42).await.unwrap().remote_author_id, 9);
        assert_eq!(svc.store().linked_users().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn register_survives_a_failed_initial_sync() {
        let feed = Arc::new(FakeFeed {
            fail_on_request: Some(1),
            ..FakeFeed::default()
        });
        let svc = service(feed, FakeProblems::default(), 10).await;

        let user = svc.register(11, 77).await.unwrap();
        assert_eq!(user.remote_author_id, 77);
        assert_eq!(svc.store().lookup_user(11).await.unwrap(), user);
    }

    #[tokio::test]
    async fn recommend_for_unknown_chat_is_user_not_found() {
        let svc = service(Arc::new(FakeFeed::default()), FakeProblems::default(), 10).await;
        let err = svc.recommend(999).await.unwrap_err();
        assert!(matches!(err, SyncError::UserNotFound { chat_id: 999 }));
        assert!(err.user_message().contains("not registered"));
    }

    #[tokio::test]
    async fn recommend_syncs_then_ranks_unsolved_problems() {
        let feed = Arc::new(FakeFeed::with(vec![
            submission(10, 7, 1000, Verdict::WrongAnswer),
            submission(11, 7, 1000, Verdict::Accepted),
            submission(12, 7, 1001, Verdict::TimeLimitExceeded),
        ]));
        let problems = catalog(&[(1000, 900), (1001, 500), (1002, 800), (1003, 10)]);
        let svc = service(feed.clone(), problems, 10).await;
        let store = svc.store().clone();
        let svc = svc.with_recommender(Arc::new(PopularityRecommender::new(store)), 2);
        assert_eq!(svc.load_problems().await.unwrap(), 4);
        svc.register(42, 7).await.unwrap();

        feed.push(vec![submission(13, 7, 1002, Verdict::Accepted)]);
        let ranked = svc.recommend(42).await.unwrap();
        assert_eq!(ranked, vec![1001, 1003]);
        assert_eq!(svc.store().latest_submission_id(7).await.unwrap(), Some(13));
    }

    struct FailingRecommender;

    #[async_trait]
    impl Recommender for FailingRecommender {
        async fn recommend(&self, _interactions: &InteractionSet, _limit: usize) -> anyhow::Result<Vec<u32>> {
            anyhow::bail!("model unavailable")
        }
    }

    #[tokio::test]
    async fn recommender_failure_is_reported_as_such() {
        let svc = service(Arc::new(FakeFeed::default()), FakeProblems::default(), 10)
            .await
            .with_recommender(Arc::new(FailingRecommender), 5);
        svc.register(1, 2).await.unwrap();

        let err = svc.recommend(1).await.unwrap_err();
        assert_eq!(err.kind(), "recommender");
        assert!(err.to_string().contains("model unavailable"));
    }

    #[test]
    fn interaction_set_keeps_first_accepted_submission_per_problem() {
        let submissions = vec![
            submission(40, 7, 1001, Verdict::Accepted),
            submission(30, 7, 1000, Verdict::Accepted),
            submission(20, 7, 1000, Verdict::Accepted),
            submission(10, 7, 1000, Verdict::WrongAnswer),
            submission(5, 7, 1002, Verdict::CompilationError),
        ];
        let set = InteractionSet::from_submissions(&submissions);

        let pairs: Vec<(u32, u64)> = set.interactions.iter().map(|i| (i.problem_id, i.submit_id)).collect();
        assert_eq!(pairs, vec![(1000, 20), (1001, 40)]);
        assert_eq!(set.solved(), BTreeSet::from([1000, 1001]));
    }

    #[tokio::test]
    async fn load_problems_upserts_catalog_with_details() {
        let svc = service(
            Arc::new(FakeFeed::default()),
            catalog(&[(1000, 92118), (1001, 27011)]),
            10,
        )
        .await;

        assert_eq!(svc.load_problems().await.unwrap(), 2);
        let stored = svc.store().problem(1001).await.unwrap().unwrap();
        assert_eq!(stored.title, "Problem 1001");
        assert_eq!(stored.solved_count, 27011);
        assert!(stored.statement_text.contains("statement 1001"));

        assert_eq!(svc.load_problems().await.unwrap(), 2);
        assert_eq!(svc.store().stats().await.unwrap().problems, 2);
    }

    #[tokio::test]
    async fn bulk_import_commits_per_batch_and_resumes() {
        let feed = Arc::new(FakeFeed::with(accepted(1..=7, 1)));
        let svc = service(feed.clone(), FakeProblems::default(), 100).await;

        let resume_from = {
            let mut import = svc.bulk_sync(None, 3, Duration::ZERO).await.unwrap();
            let first = import.next_batch().await.unwrap().unwrap();
            assert_eq!((first.batch, first.fetched, first.stored), (1, 3, 3));
            assert_eq!(first.oldest_id, Some(5));
            assert_eq!(first.next_cursor, Some(4));
            assert_eq!(svc.store().stats().await.unwrap().submissions, 3);
            import.next_cursor()
        };

        let mut import = svc.bulk_sync(resume_from, 3, Duration::ZERO).await.unwrap();
        let mut batches = Vec::new();
        while let Some(progress) = import.next_batch().await.unwrap() {
            batches.push(progress);
        }
        assert!(import.is_finished());
        assert_eq!(batches.len(), 2);
        assert_eq!(batches.iter().map(|b| b.stored).sum::<u64>(), 4);
        assert_eq!(batches.last().unwrap().next_cursor, None);
        assert_eq!(svc.store().stats().await.unwrap().submissions, 7);
        drop(import);

        // the resumed import only vouches for ids at or below where it began
        assert_eq!(svc.store().feed_watermark(FeedScope::All).await.unwrap(), Some(4));
        let report = svc.sync_global().await.unwrap();
        assert_eq!((report.fetched, report.stored), (3, 0));
        assert_eq!(svc.store().feed_watermark(FeedScope::All).await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn bulk_import_stops_at_previously_imported_history() {
        let feed = Arc::new(FakeFeed::with(accepted(1..=4, 1)));
        let svc = service(feed.clone(), FakeProblems::default(), 100).await;
        svc.sync_global().await.unwrap();

        feed.push(accepted(5..=9, 2));
        let mut import = svc.bulk_sync(None, 2, Duration::ZERO).await.unwrap();
        let mut stored = 0;
        while let Some(progress) = import.next_batch().await.unwrap() {
            stored += progress.stored;
        }
        assert_eq!(stored, 5);
        // pages 9,8 | 7,6 | 5,4 and 4 is the watermark
        assert_eq!(feed.requests() - 1, 3);
        drop(import);
        assert_eq!(svc.store().feed_watermark(FeedScope::All).await.unwrap(), Some(9));

        let before = feed.requests();
        let mut import = svc.bulk_sync(Some(6), 2, Duration::ZERO).await.unwrap();
        assert!(import.is_finished());
        assert!(import.next_batch().await.unwrap().is_none());
        assert_eq!(feed.requests(), before);
    }

    #[tokio::test]
    async fn mirror_syncs_each_linked_author_once() {
        let feed = Arc::new(FakeFeed::with(accepted(1..=3, 7)));
        feed.push(accepted(4..=5, 9));
        let svc = service(feed, FakeProblems::default(), 10).await;
        svc.store().link_user(1, 7).await.unwrap();
        svc.store().link_user(2, 7).await.unwrap();
        svc.store().link_user(3, 9).await.unwrap();

        let summary = svc.sync_linked_users().await.unwrap();
        assert_eq!(summary.authors, 2);
        assert_eq!(summary.stored, 5);
        assert_eq!(summary.failures, 0);
    }

    #[tokio::test]
    async fn paced_source_spaces_out_requests() {
        let feed: Arc<dyn SubmissionSource> = Arc::new(FakeFeed::with(accepted(1..=3, 1)));
        let paced = PacedSource::new(feed, Duration::from_millis(40));

        let started = Instant::now();
        paced.get_submissions(&SubmissionQuery::default()).await.unwrap();
        paced.get_submissions(&SubmissionQuery::default()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn client_errors_map_onto_the_sync_taxonomy() {
        let status: SyncError = ClientError::Fetch(FetchError::HttpStatus {
            status: 502,
            url: "https://judge.test/textstatus.aspx".into(),
        })
        .into();
        assert_eq!(status.kind(), "remote_protocol");

        let parse: SyncError = ClientError::Parse(ParseError::MissingElement(".problemset")).into();
        assert_eq!(parse.kind(), "parse");

        let missing: SyncError = StoreError::UserNotFound { chat_id: 3 }.into();
        assert!(matches!(missing, SyncError::UserNotFound { chat_id: 3 }));
        assert!(status.user_message().contains("try again later"));
    }

    #[test]
    fn config_defaults_and_overrides() {
        let defaults = SyncConfig::from_lookup(|_| None);
        assert_eq!(defaults.database_url, "sqlite://tpr.sqlite");
        assert_eq!(defaults.remote_url, "https://timus.online");
        assert_eq!(defaults.page_size, 100);
        assert_eq!(defaults.max_pages, 10_000);
        assert_eq!(defaults.max_retries, 3);
        assert!(!defaults.scheduler_enabled);
        assert_eq!(defaults.sync_cron, "0 */30 * * * *");

        let env: HashMap<&str, &str> = HashMap::from([
            ("TPR_PAGE_SIZE", "25"),
            ("TPR_ACCEPTED_ONLY", "true"),
            ("TPR_MAX_PAGES", "not-a-number"),
            ("TPR_PAGE_DELAY_MS", "500"),
        ]);
        let config = SyncConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.page_size, 25);
        assert!(config.accepted_only);
        assert_eq!(config.max_pages, 10_000);
        assert_eq!(config.page_delay_ms, 500);
        assert_eq!(
            config.driver_config(),
            DriverConfig {
                page_size: 25,
                max_pages: 10_000,
                accepted_only: true,
            }
        );
    }
}
