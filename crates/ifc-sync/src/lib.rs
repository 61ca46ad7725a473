//! Collection orchestration: configuration, noise filtering, dedup, watermarks and run reports.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use ifc_adapters::{
    fetcher_for_target, BackoffPolicy, CollectionTarget, CookieFileSession, FetchError, FetchLimits,
    FetchRequest, FetchedBatch, PlatformClient, RenderSettings, SessionError, SessionProvider, SourceFetcher,
};
use ifc_core::{Candidate, CollectedItem, FetchWindow, SourceKind};
use ifc_storage::{InsertOutcome, ItemStore, StorageError};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ifc-sync";

const DEFAULT_LOOKBACK_HOURS: i64 = 24;

#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    #[serde(default, alias = "twitter")]
    pub session: SessionConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default = "default_reports_dir")]
    pub reports_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_cookies_file")]
    pub cookies_file: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookies_file: default_cookies_file(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default, alias = "sarvam_handle")]
    pub handle: Option<String>,
    #[serde(default, alias = "indus_threads")]
    pub threads: Vec<ThreadConfig>,
    #[serde(default = "default_max_posts")]
    pub max_posts: usize,
    #[serde(default)]
    pub reply_lookback_hours: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            handle: None,
            threads: Vec::new(),
            max_posts: default_max_posts(),
            reply_lookback_hours: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThreadConfig {
    #[serde(deserialize_with = "deserialize_post_id")]
    pub tweet_id: String,
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchConfig {
    #[serde(default)]
    pub queries: Vec<String>,
    #[serde(default)]
    pub relevance_signals: Vec<String>,
    #[serde(default)]
    pub exclude_terms: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub timeline: Option<NoiseRules>,
    #[serde(default)]
    pub threads: Option<NoiseRules>,
    #[serde(default)]
    pub keyword: NoiseRules,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_render_url")]
    pub render_url: String,
    #[serde(default)]
    pub render_token: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_request_interval_ms")]
    pub request_interval_ms: u64,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_max_pages")]
    pub max_pages_per_target: usize,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            render_url: default_render_url(),
            render_token: None,
            user_agent: None,
            timeout_secs: default_timeout_secs(),
            request_interval_ms: default_request_interval_ms(),
            settle_ms: default_settle_ms(),
            max_pages_per_target: default_max_pages(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
        }
    }
}

fn default_cookies_file() -> PathBuf {
    PathBuf::from("data/cookies.json")
}

fn default_reports_dir() -> PathBuf {
    PathBuf::from("reports")
}

fn default_max_posts() -> usize {
    40
}

fn default_render_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_timeout_secs() -> u64 {
    45
}

fn default_request_interval_ms() -> u64 {
    2_000
}

fn default_settle_ms() -> u64 {
    3_000
}

fn default_max_pages() -> usize {
    5
}

fn default_retry_backoff_ms() -> u64 {
    5_000
}

fn default_database_url() -> String {
    "sqlite://data/ifc.db".to_string()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPostId {
    Text(String),
    Number(u64),
}

fn deserialize_post_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match RawPostId::deserialize(deserializer)? {
        RawPostId::Text(text) => text.trim().to_string(),
        RawPostId::Number(n) => n.to_string(),
    })
}

fn normalize_handle(handle: &str) -> String {
    handle.trim().trim_start_matches('@').to_string()
}

impl CollectorConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing collector config")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading collector config {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Load the file named by `IFC_CONFIG` (default `config.yaml`) and apply env overrides.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var("IFC_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
        let mut config = Self::load(&path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("DATABASE_URL") {
            self.storage.database_url = url;
        }
        if let Some(url) = lookup("IFC_RENDER_URL") {
            self.fetch.render_url = url;
        }
        if let Some(token) = lookup("IFC_RENDER_TOKEN") {
            self.fetch.render_token = Some(token);
        }
    }

    /// Targets in configuration order: timeline, tracked threads, keyword queries.
    pub fn targets(&self) -> Vec<CollectionTarget> {
        let monitored = self
            .monitor
            .handle
            .as_deref()
            .map(normalize_handle)
            .filter(|h| !h.is_empty());

        let mut targets = Vec::new();
        if let Some(handle) = &monitored {
            targets.push(CollectionTarget::Timeline {
                handle: handle.clone(),
            });
        }

        let mut seen_threads = HashSet::new();
        for thread in &self.monitor.threads {
            if thread.tweet_id.is_empty() || !seen_threads.insert(thread.tweet_id.clone()) {
                continue;
            }
            let handle = thread
                .handle
                .as_deref()
                .map(normalize_handle)
                .or_else(|| monitored.clone())
                .unwrap_or_default();
            targets.push(CollectionTarget::Thread {
                root_id: thread.tweet_id.clone(),
                handle,
                label: thread.label.clone(),
            });
        }

        let mut seen_queries = HashSet::new();
        for query in &self.search.queries {
            let expression = query.trim();
            if expression.is_empty() || !seen_queries.insert(expression.to_string()) {
                continue;
            }
            targets.push(CollectionTarget::Keyword {
                expression: expression.to_string(),
            });
        }
        targets
    }

    pub fn fetch_limits(&self) -> FetchLimits {
        FetchLimits {
            max_pages: self.fetch.max_pages_per_target.max(1),
            max_posts: self.monitor.max_posts,
            reply_lookback: chrono::Duration::hours(i64::from(self.monitor.reply_lookback_hours)),
        }
    }

    pub fn render_settings(&self) -> RenderSettings {
        let defaults = RenderSettings::default();
        RenderSettings {
            endpoint: self.fetch.render_url.clone(),
            token: self.fetch.render_token.clone(),
            user_agent: self.fetch.user_agent.clone().or(defaults.user_agent),
            timeout: Duration::from_secs(self.fetch.timeout_secs),
            settle: Duration::from_millis(self.fetch.settle_ms),
            request_interval: Duration::from_millis(self.fetch.request_interval_ms),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            limits: self.fetch_limits(),
            retry: BackoffPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(self.fetch.retry_backoff_ms),
                max_delay: Duration::from_millis(self.fetch.retry_backoff_ms.saturating_mul(4)),
            },
        }
    }

    /// Keyword rules also pick up the `search.relevance_signals` / `search.exclude_terms` lists.
    pub fn noise_filter(&self) -> NoiseFilter {
        let mut keyword = self.filters.keyword.clone();
        keyword.required.extend(self.search.relevance_signals.iter().cloned());
        keyword.excluded.extend(self.search.exclude_terms.iter().cloned());
        NoiseFilter {
            timeline: self.filters.timeline.clone(),
            threads: self.filters.threads.clone(),
            keyword,
        }
    }
}

/// Keyword and author rules; matching is case-insensitive substring matching on the body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoiseRules {
    #[serde(default, alias = "relevance_signals")]
    pub required: Vec<String>,
    #[serde(default, alias = "exclude_terms")]
    pub excluded: Vec<String>,
    #[serde(default)]
    pub excluded_authors: Vec<String>,
}

impl NoiseRules {
    pub fn is_configured(&self) -> bool {
        [&self.required, &self.excluded, &self.excluded_authors]
            .iter()
            .any(|list| list.iter().any(|v| !v.trim().is_empty()))
    }
}

fn lowered_terms(list: &[String]) -> Vec<String> {
    list.iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Exclusions are checked first; then at least one required keyword must match, if any are set.
pub fn is_relevant(candidate: &Candidate, rules: &NoiseRules) -> bool {
    let author = normalize_handle(&candidate.author_handle).to_lowercase();
    let blocked_author = rules
        .excluded_authors
        .iter()
        .map(|a| normalize_handle(a).to_lowercase())
        .any(|a| !a.is_empty() && a == author);
    if blocked_author {
        return false;
    }

    let body = candidate.body_text.to_lowercase();
    if lowered_terms(&rules.excluded).iter().any(|t| body.contains(t.as_str())) {
        return false;
    }

    let required = lowered_terms(&rules.required);
    required.is_empty() || required.iter().any(|t| body.contains(t.as_str()))
}

#[derive(Debug, Clone, Default)]
pub struct NoiseFilter {
    pub timeline: Option<NoiseRules>,
    pub threads: Option<NoiseRules>,
    pub keyword: NoiseRules,
}

impl NoiseFilter {
    pub fn accepts(&self, source_kind: SourceKind, candidate: &Candidate) -> bool {
        let rules = match source_kind {
            SourceKind::KeywordMention => Some(&self.keyword),
            SourceKind::TimelineReply => self.timeline.as_ref().filter(|r| r.is_configured()),
            SourceKind::ThreadReply => self.threads.as_ref().filter(|r| r.is_configured()),
        };
        rules.map_or(true, |rules| is_relevant(candidate, rules))
    }
}

/// Per-run membership check over `platform_id`, covering both this run and stored history.
pub struct Deduplicator<'a> {
    store: &'a dyn ItemStore,
    seen: HashSet<String>,
}

impl<'a> Deduplicator<'a> {
    pub fn new(store: &'a dyn ItemStore) -> Self {
        Self {
            store,
            seen: HashSet::new(),
        }
    }

    pub async fn accept(&mut self, candidate: &Candidate) -> Result<bool, StorageError> {
        if self.seen.contains(&candidate.platform_id) {
            return Ok(false);
        }
        Ok(!self.store.contains(&candidate.platform_id).await?)
    }

    /// Mark an id as handled once its insert has committed or lost to an existing row.
    pub fn remember(&mut self, platform_id: &str) {
        self.seen.insert(platform_id.to_string());
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowParseError {
    #[error("cannot read `{0}` as a time bound (try 24h, 7 days, 2w, 2026-02-25 or \"2026-02-25 14:30\")")]
    Unrecognized(String),
    #[error("window start {start} is not before end {end}")]
    Inverted {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

fn parse_relative(text: &str) -> Option<chrono::Duration> {
    let lowered = text.to_ascii_lowercase();
    let trimmed = lowered.strip_suffix("ago").unwrap_or(&lowered).trim();
    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    if digits_end == 0 {
        return None;
    }
    let amount: i64 = trimmed[..digits_end].parse().ok()?;
    match trimmed[digits_end..].trim() {
        "min" | "mins" | "minute" | "minutes" => chrono::Duration::try_minutes(amount),
        "h" | "hr" | "hrs" | "hour" | "hours" => chrono::Duration::try_hours(amount),
        "d" | "day" | "days" => chrono::Duration::try_days(amount),
        "w" | "wk" | "wks" | "week" | "weeks" => chrono::Duration::try_weeks(amount),
        "m" | "mo" | "month" | "months" => chrono::Duration::try_days(amount.checked_mul(30)?),
        _ => None,
    }
}

/// Parse a relative (`12h`, `7 days`, `2w`, `1m` = 30 days) or absolute (RFC 3339,
/// `YYYY-MM-DD HH:MM`, `YYYY-MM-DD`, all UTC) time bound.
pub fn parse_time_bound(text: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, WindowParseError> {
    let trimmed = text.trim();
    let unrecognized = || WindowParseError::Unrecognized(trimmed.to_string());

    if let Some(span) = parse_relative(trimmed) {
        return now.checked_sub_signed(span).ok_or_else(unrecognized);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(unrecognized)
}

/// Requested run bounds. `manual_floor` marks an explicit `--since`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub manual_floor: bool,
}

impl RunWindow {
    pub fn scheduled(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            manual_floor: false,
        }
    }

    pub fn backfill(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            manual_floor: true,
        }
    }

    /// Build the window from optional `--since` / `--until` expressions.
    pub fn resolve(
        since: Option<&str>,
        until: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Self, WindowParseError> {
        let end = until
            .map(|text| parse_time_bound(text, now))
            .transpose()?
            .unwrap_or(now);
        let window = match since {
            Some(text) => Self::backfill(parse_time_bound(text, now)?, end),
            None => Self::scheduled(now - chrono::Duration::hours(DEFAULT_LOOKBACK_HOURS), end),
        };
        if window.start >= window.end {
            return Err(WindowParseError::Inverted {
                start: window.start,
                end: window.end,
            });
        }
        Ok(window)
    }

    /// Fetch window for one target given its stored watermark.
    pub fn effective(&self, watermark: Option<DateTime<Utc>>) -> FetchWindow {
        let start = match watermark {
            None => self.start,
            Some(mark) if self.manual_floor => self.start.min(mark),
            Some(mark) => self.start.max(mark),
        };
        FetchWindow::new(start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    AuthExpired,
    Rejected,
    Malformed,
    Storage,
}

impl From<&FetchError> for FailureKind {
    fn from(err: &FetchError) -> Self {
        match err {
            FetchError::Transient(_) => FailureKind::Transient,
            FetchError::AuthExpired => FailureKind::AuthExpired,
            FetchError::Rejected { .. } => FailureKind::Rejected,
            FetchError::Malformed(_) => FailureKind::Malformed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub scope: String,
    pub label: String,
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTally {
    pub targets: usize,
    pub fetched: usize,
    pub noise: usize,
    pub duplicate: usize,
    pub stored: usize,
    pub failed: usize,
    /// Targets whose paging hit `max_pages` before reaching the window start.
    #[serde(default)]
    pub truncated: usize,
    pub failures: Vec<SourceFailure>,
}

impl SourceTally {
    fn record_failure(&mut self, target: &CollectionTarget, kind: FailureKind, message: String) {
        warn!(scope = target.scope(), ?kind, %message, "target failed");
        self.failed += 1;
        self.failures.push(SourceFailure {
            scope: target.scope().to_string(),
            label: target.label(),
            kind,
            message,
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub manual_floor: bool,
    pub sources: BTreeMap<SourceKind, SourceTally>,
}

impl RunSummary {
    fn new(run_id: Uuid, started_at: DateTime<Utc>, window: &RunWindow) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            window_start: window.start,
            window_end: window.end,
            manual_floor: window.manual_floor,
            sources: SourceKind::ALL
                .iter()
                .map(|kind| (*kind, SourceTally::default()))
                .collect(),
        }
    }

    fn tally_mut(&mut self, kind: SourceKind) -> &mut SourceTally {
        self.sources.entry(kind).or_default()
    }

    pub fn tally(&self, kind: SourceKind) -> Option<&SourceTally> {
        self.sources.get(&kind)
    }

    pub fn has_failures(&self) -> bool {
        self.sources.values().any(|t| t.failed > 0)
    }

    pub fn total_stored(&self) -> usize {
        self.sources.values().map(|t| t.stored).sum()
    }

    fn finish(&mut self) {
        self.finished_at = Utc::now();
        for (kind, tally) in &self.sources {
            info!(
                run_id = %self.run_id,
                source = %kind,
                targets = tally.targets,
                fetched = tally.fetched,
                noise = tally.noise,
                duplicate = tally.duplicate,
                stored = tally.stored,
                failed = tally.failed,
                truncated = tally.truncated,
                "source summary"
            );
        }
    }
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("no usable session: {0}")]
    Session(#[from] SessionError),
    #[error("session expired during run {run_id}; re-run the login flow")]
    SessionExpired {
        run_id: Uuid,
        summary: Box<RunSummary>,
    },
}

impl CollectError {
    /// Partial summary when the run got far enough to produce one.
    pub fn summary(&self) -> Option<&RunSummary> {
        match self {
            CollectError::Session(_) => None,
            CollectError::SessionExpired { summary, .. } => Some(summary),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OrchestratorSettings {
    pub limits: FetchLimits,
    pub retry: BackoffPolicy,
}

pub struct CollectionOrchestrator {
    session: Arc<dyn SessionProvider>,
    store: Arc<dyn ItemStore>,
    filter: NoiseFilter,
    settings: OrchestratorSettings,
}

impl CollectionOrchestrator {
    pub fn new(
        session: Arc<dyn SessionProvider>,
        store: Arc<dyn ItemStore>,
        filter: NoiseFilter,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            session,
            store,
            filter,
            settings,
        }
    }

    /// Collect every target, source kind by source kind.
    ///
    /// Only a missing session or a mid-run session expiry ends the run early; other
    /// failures are recorded against their source and the run continues.
    pub async fn run(
        &self,
        window: RunWindow,
        targets: &[CollectionTarget],
    ) -> Result<RunSummary, CollectError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let client = self.session.open().await?;
        info!(
            %run_id,
            window_start = %window.start,
            window_end = %window.end,
            manual_floor = window.manual_floor,
            targets = targets.len(),
            "collection run started"
        );

        let mut summary = RunSummary::new(run_id, started_at, &window);
        let mut dedup = Deduplicator::new(self.store.as_ref());

        for kind in SourceKind::ALL {
            for target in targets.iter().filter(|t| t.source_kind() == kind) {
                let span = info_span!("collect_target", %run_id, source = %kind, scope = target.scope());
                let tally = summary.tally_mut(kind);
                let outcome = self
                    .collect_target(run_id, client.as_ref(), target, &window, &mut dedup, tally)
                    .instrument(span)
                    .await;
                if outcome.is_err() {
                    summary.finish();
                    warn!(%run_id, "session expired; aborting run");
                    return Err(CollectError::SessionExpired {
                        run_id,
                        summary: Box::new(summary),
                    });
                }
            }
        }

        summary.finish();
        info!(%run_id, stored = summary.total_stored(), partial = summary.has_failures(), "collection run finished");
        Ok(summary)
    }

    /// Returns `Err` only for session expiry; every other failure lands in `tally`.
    async fn collect_target(
        &self,
        run_id: Uuid,
        client: &dyn PlatformClient,
        target: &CollectionTarget,
        window: &RunWindow,
        dedup: &mut Deduplicator<'_>,
        tally: &mut SourceTally,
    ) -> Result<(), FetchError> {
        let kind = target.source_kind();
        let scope = target.scope();
        tally.targets += 1;

        let watermark = match self.store.get_watermark(kind, scope).await {
            Ok(mark) => mark,
            Err(err) => {
                tally.record_failure(target, FailureKind::Storage, err.to_string());
                return Ok(());
            }
        };
        let fetch_window = window.effective(watermark);
        if fetch_window.is_empty() {
            debug!(window = %fetch_window, "nothing to fetch");
            return Ok(());
        }

        let fetcher = fetcher_for_target(target, self.settings.limits);
        let request = FetchRequest::new(fetch_window).with_parents_since(window.start);
        let fetched = self.fetch_with_retry(fetcher.as_ref(), client, &request).await;
        let FetchedBatch { candidates, truncated } = match fetched {
            Ok(batch) => batch,
            Err(err) => {
                tally.record_failure(target, FailureKind::from(&err), err.to_string());
                return match err {
                    FetchError::AuthExpired => Err(err),
                    _ => Ok(()),
                };
            }
        };

        let before = (tally.fetched, tally.noise, tally.duplicate, tally.stored);
        let mut newest_stored: Option<DateTime<Utc>> = None;
        for candidate in candidates {
            if !fetch_window.contains(candidate.posted_at) {
                continue;
            }
            tally.fetched += 1;

            if !self.filter.accepts(kind, &candidate) {
                tally.noise += 1;
                continue;
            }

            match dedup.accept(&candidate).await {
                Ok(true) => {}
                Ok(false) => {
                    tally.duplicate += 1;
                    continue;
                }
                Err(err) => {
                    tally.record_failure(target, FailureKind::Storage, err.to_string());
                    return Ok(());
                }
            }

            let posted_at = candidate.posted_at;
            let item = CollectedItem::from_candidate(kind, scope, candidate, run_id);
            match self.store.upsert_if_absent(&item).await {
                Ok(InsertOutcome::Stored) => {
                    dedup.remember(&item.platform_id);
                    tally.stored += 1;
                    newest_stored = newest_stored.max(Some(posted_at));
                }
                Ok(InsertOutcome::Duplicate) => {
                    dedup.remember(&item.platform_id);
                    tally.duplicate += 1;
                }
                Err(err) => {
                    tally.record_failure(target, FailureKind::Storage, err.to_string());
                    return Ok(());
                }
            }
        }

        // Older in-window posts were left unpaged; the next run must cover them again.
        if truncated {
            warn!(window = %fetch_window, "paging truncated; watermark held");
            tally.truncated += 1;
        } else if let Some(newest) = newest_stored {
            if let Err(err) = self.store.advance_watermark(kind, scope, newest).await {
                tally.record_failure(target, FailureKind::Storage, err.to_string());
            }
        }

        info!(
            window = %fetch_window,
            fetched = tally.fetched - before.0,
            noise = tally.noise - before.1,
            duplicate = tally.duplicate - before.2,
            stored = tally.stored - before.3,
            truncated,
            "target collected"
        );
        Ok(())
    }

    async fn fetch_with_retry(
        &self,
        fetcher: &dyn SourceFetcher,
        client: &dyn PlatformClient,
        request: &FetchRequest,
    ) -> Result<FetchedBatch, FetchError> {
        let mut attempt = 0;
        loop {
            match fetcher.fetch(client, request).await {
                Err(err) if err.is_retryable() && attempt < self.settings.retry.max_retries => {
                    let delay = self.settings.retry.delay_for_attempt(attempt);
                    warn!(error = %err, attempt, delay_ms = delay.as_millis() as u64, "retrying source");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Orchestrator bound to its configured targets, writing a report after every run.
pub struct Collector {
    orchestrator: CollectionOrchestrator,
    targets: Vec<CollectionTarget>,
    reports_dir: Option<PathBuf>,
}

impl Collector {
    pub fn new(orchestrator: CollectionOrchestrator, targets: Vec<CollectionTarget>) -> Self {
        Self {
            orchestrator,
            targets,
            reports_dir: None,
        }
    }

    pub fn from_config(config: &CollectorConfig, store: Arc<dyn ItemStore>) -> Self {
        let session = Arc::new(CookieFileSession::new(
            config.session.cookies_file.clone(),
            config.render_settings(),
        ));
        let orchestrator = CollectionOrchestrator::new(
            session,
            store,
            config.noise_filter(),
            config.orchestrator_settings(),
        );
        Self::new(orchestrator, config.targets()).with_reports_dir(config.reports_dir.clone())
    }

    pub fn with_reports_dir(mut self, reports_dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(reports_dir.into());
        self
    }

    pub fn targets(&self) -> &[CollectionTarget] {
        &self.targets
    }

    pub async fn collect(&self, window: RunWindow) -> Result<RunSummary, CollectError> {
        let result = self.orchestrator.run(window, &self.targets).await;
        let summary = match &result {
            Ok(summary) => Some(summary),
            Err(err) => err.summary(),
        };
        if let (Some(dir), Some(summary)) = (&self.reports_dir, summary) {
            match write_reports(dir, summary).await {
                Ok(path) => info!(reports = %path.display(), "run reports written"),
                Err(err) => warn!(error = ?err, "writing run reports failed"),
            }
        }
        result
    }
}

pub fn render_summary_markdown(summary: &RunSummary) -> String {
    let status = if summary.has_failures() {
        "partial failure"
    } else {
        "ok"
    };
    let mut lines = vec![
        format!("# Collection Run `{}`", summary.run_id),
        String::new(),
        format!(
            "- Window: {} to {}{}",
            summary.window_start.to_rfc3339(),
            summary.window_end.to_rfc3339(),
            if summary.manual_floor { " (manual floor)" } else { "" }
        ),
        format!("- Started: {}", summary.started_at.to_rfc3339()),
        format!("- Finished: {}", summary.finished_at.to_rfc3339()),
        format!("- Status: {status}"),
        String::new(),
        "## Sources".to_string(),
        String::new(),
        "| source | targets | fetched | noise | duplicate | stored | failed | truncated |".to_string(),
        "|---|---:|---:|---:|---:|---:|---:|---:|".to_string(),
    ];
    for (kind, t) in &summary.sources {
        lines.push(format!(
            "| {kind} | {} | {} | {} | {} | {} | {} | {} |",
            t.targets, t.fetched, t.noise, t.duplicate, t.stored, t.failed, t.truncated
        ));
    }

    let failures = summary
        .sources
        .iter()
        .flat_map(|(kind, t)| t.failures.iter().map(move |f| (kind, f)))
        .collect::<Vec<_>>();
    if !failures.is_empty() {
        lines.push(String::new());
        lines.push("## Failures".to_string());
        lines.push(String::new());
        for (kind, failure) in failures {
            lines.push(format!(
                "- {kind} {} (`{}`): {:?}: {}",
                failure.label, failure.scope, failure.kind, failure.message
            ));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Write `run_summary.json` and `summary.md` under `reports_dir/<run_id>/`.
pub async fn write_reports(reports_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    fs::write(run_dir.join("summary.md"), render_summary_markdown(summary))
        .await
        .context("writing summary.md")?;
    Ok(run_dir)
}
