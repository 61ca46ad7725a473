//! Session handling, rendered-page platform client and the three source fetchers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ifc_core::{Candidate, FetchWindow, SourceKind};
use reqwest::{StatusCode, Url};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "ifc-adapters";

const PLATFORM_ORIGIN: &str = "https://x.com";
const COOKIE_DOMAIN: &str = ".x.com";
const REQUIRED_COOKIES: [&str; 2] = ["auth_token", "ct0"];
const LOGIN_WALL_MARKERS: [&str; 3] = [
    "/i/flow/login",
    "data-testid=\"loginButton\"",
    "data-testid=\"LoginForm_Login_Button\"",
];

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transient fetch failure: {0}")]
    Transient(String),
    #[error("platform session is no longer authenticated")]
    AuthExpired,
    #[error("request rejected (status {status:?}): {message}")]
    Rejected { status: Option<u16>, message: String },
    #[error("unreadable platform page: {0}")]
    Malformed(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no session credential at {0}; run the login flow first")]
    Missing(PathBuf),
    #[error("session credential {path} is missing cookies: {missing:?}")]
    Invalid { path: PathBuf, missing: Vec<String> },
    #[error("reading session credential {path}: {message}")]
    Unreadable { path: PathBuf, message: String },
    #[error(transparent)]
    Context(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Delay schedule for source-level retries.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Spaces outbound requests so a whole run shares one request budget.
#[derive(Debug)]
pub struct RequestPacer {
    burst: u32,
    refill_every: Duration,
    state: Mutex<PacerState>,
}

#[derive(Debug, Clone, Copy)]
struct PacerState {
    tokens: u32,
    last_refill: Instant,
}

impl RequestPacer {
    pub fn new(burst: u32, refill_every: Duration) -> Self {
        let burst = burst.max(1);
        Self {
            burst,
            refill_every,
            state: Mutex::new(PacerState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let mut state = self.state.lock().await;
            let refill_ms = self.refill_every.as_millis();
            let elapsed = state.last_refill.elapsed();
            if refill_ms > 0 && elapsed >= self.refill_every {
                let refills = (elapsed.as_millis() / refill_ms).min(u128::from(self.burst)) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.burst);
                state.last_refill = Instant::now();
            } else if refill_ms == 0 {
                state.tokens = self.burst;
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let wait = self.refill_every.saturating_sub(elapsed);
            drop(state);
            tokio::time::sleep(wait).await;
        }
    }
}

/// Connection settings for a Browserless-compatible `/content` render endpoint.
#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub endpoint: String,
    pub token: Option<String>,
    pub user_agent: Option<String>,
    pub timeout: Duration,
    pub settle: Duration,
    pub request_interval: Duration,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:3000".to_string(),
            token: None,
            user_agent: Some(
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36"
                    .to_string(),
            ),
            timeout: Duration::from_secs(45),
            settle: Duration::from_secs(3),
            request_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
}

/// Renders pages through a headless browser service and returns the final HTML.
#[derive(Debug)]
pub struct RenderClient {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    user_agent: Option<String>,
    settle: Duration,
    pacer: RequestPacer,
}

impl RenderClient {
    pub fn new(settings: &RenderSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(settings.timeout)
            .build()
            .context("building render http client")?;

        Ok(Self {
            client,
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            token: settings.token.clone(),
            user_agent: settings.user_agent.clone(),
            settle: settings.settle,
            pacer: RequestPacer::new(1, settings.request_interval),
        })
    }

    pub async fn content(&self, url: &str, cookies: &[RenderCookie]) -> Result<String, FetchError> {
        self.pacer.acquire().await;

        let endpoint = self.content_url()?;

        let mut body = serde_json::json!({
            "url": url,
            "cookies": cookies,
            "gotoOptions": { "waitUntil": "domcontentloaded" },
            "waitForTimeout": self.settle.as_millis() as u64,
        });
        if let Some(user_agent) = &self.user_agent {
            body["userAgent"] = serde_json::Value::String(user_agent.clone());
        }

        let resp = self
            .client
            .post(endpoint)
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(match classify_status(status) {
                RetryDisposition::Retryable => {
                    FetchError::Transient(format!("render endpoint returned {status}"))
                }
                RetryDisposition::NonRetryable => FetchError::Rejected {
                    status: Some(status.as_u16()),
                    message,
                },
            });
        }

        resp.text().await.map_err(request_error)
    }

    fn content_url(&self) -> Result<Url, FetchError> {
        let mut url = Url::parse(&format!("{}/content", self.endpoint)).map_err(|e| FetchError::Rejected {
            status: None,
            message: format!("invalid render endpoint {}: {e}", self.endpoint),
        })?;
        if let Some(token) = &self.token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }
}

fn request_error(err: reqwest::Error) -> FetchError {
    match classify_reqwest_error(&err) {
        RetryDisposition::Retryable => FetchError::Transient(err.to_string()),
        RetryDisposition::NonRetryable => FetchError::Rejected {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        },
    }
}

/// A post as it appears on a rendered platform page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformPost {
    pub id: String,
    pub author_handle: String,
    pub author_display_name: String,
    pub text: String,
    pub posted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostPage {
    pub posts: Vec<PlatformPost>,
    pub next_cursor: Option<String>,
}

/// Logical page request, independent of how a client talks to the platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PageQuery {
    AccountPosts { handle: String },
    Replies { handle: String, post_id: String },
    Search { expression: String },
}

#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Fetch one page of posts for `query`, newest first, continuing from `cursor`.
    async fn fetch_page(
        &self,
        query: &PageQuery,
        window: &FetchWindow,
        cursor: Option<&str>,
    ) -> Result<PostPage, FetchError>;
}

/// Live-search expression for a page request, bounded to the window.
pub fn search_expression(query: &PageQuery, window: &FetchWindow, cursor: Option<&str>) -> String {
    let base = match query {
        PageQuery::AccountPosts { handle } => {
            format!("from:{} -filter:replies", handle.trim_start_matches('@'))
        }
        PageQuery::Replies { post_id, .. } => format!("conversation_id:{post_id}"),
        PageQuery::Search { expression } => format!("({})", expression.trim()),
    };
    let mut expr = format!(
        "{base} since_time:{} until_time:{}",
        window.start.timestamp(),
        window.end.timestamp()
    );
    if let Some(max_id) = cursor {
        expr.push_str(" max_id:");
        expr.push_str(max_id);
    }
    expr
}

pub fn search_url(expression: &str) -> Result<Url, FetchError> {
    let mut url = Url::parse(&format!("{PLATFORM_ORIGIN}/search"))
        .map_err(|e| FetchError::Malformed(e.to_string()))?;
    url.query_pairs_mut()
        .append_pair("q", expression)
        .append_pair("src", "typed_query")
        .append_pair("f", "live");
    Ok(url)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPage {
    pub posts: Vec<PlatformPost>,
    pub login_wall: bool,
}

struct ArticleSelectors {
    article: Selector,
    status_link: Selector,
    time: Selector,
    text: Selector,
    user_name: Selector,
}

impl ArticleSelectors {
    fn new() -> Result<Self, FetchError> {
        let parse = |s: &str| Selector::parse(s).map_err(|e| FetchError::Malformed(e.to_string()));
        Ok(Self {
            article: parse(r#"article[data-testid="tweet"]"#)?,
            status_link: parse(r#"a[href*="/status/"]"#)?,
            time: parse("time[datetime]")?,
            text: parse(r#"[data-testid="tweetText"]"#)?,
            user_name: parse(r#"[data-testid="User-Name"] span"#)?,
        })
    }
}

/// Extract `(handle, status id)` from a status permalink.
pub fn parse_status_href(href: &str) -> Option<(String, String)> {
    let idx = href.find("/status/")?;
    let handle = href[..idx].rsplit('/').next()?.trim();
    let id = href[idx + "/status/".len()..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>();
    let handle_ok = !handle.is_empty() && handle.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !handle_ok || id.is_empty() {
        return None;
    }
    Some((handle.to_string(), id))
}

fn parse_platform_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn first_text(element: &ElementRef<'_>, selector: &Selector) -> Option<String> {
    element
        .select(selector)
        .map(|n| n.text().collect::<String>().trim().to_string())
        .find(|s| !s.is_empty())
}

/// Parse the post articles of a rendered timeline, conversation or search page.
pub fn parse_post_page(html: &str) -> Result<ParsedPage, FetchError> {
    let selectors = ArticleSelectors::new()?;
    let document = Html::parse_document(html);
    let mut posts = Vec::new();

    for article in document.select(&selectors.article) {
        let mut status = None;
        let mut posted_at = None;
        // the permalink wrapping <time> belongs to the post itself, not a quoted one
        for anchor in article.select(&selectors.status_link) {
            let Some(parsed) = anchor.value().attr("href").and_then(parse_status_href) else {
                continue;
            };
            if let Some(time) = anchor.select(&selectors.time).next() {
                posted_at = time.value().attr("datetime").and_then(parse_platform_time);
                status = Some(parsed);
                break;
            }
            if status.is_none() {
                status = Some(parsed);
            }
        }
        let Some((handle, id)) = status else {
            continue;
        };
        if posted_at.is_none() {
            posted_at = article
                .select(&selectors.time)
                .next()
                .and_then(|t| t.value().attr("datetime"))
                .and_then(parse_platform_time);
        }

        posts.push(PlatformPost {
            author_display_name: first_text(&article, &selectors.user_name).unwrap_or_else(|| handle.clone()),
            text: first_text(&article, &selectors.text).unwrap_or_default(),
            author_handle: handle,
            id,
            posted_at,
        });
    }

    let login_wall = posts.is_empty() && LOGIN_WALL_MARKERS.iter().any(|m| html.contains(m));
    Ok(ParsedPage { posts, login_wall })
}

/// Cursor for the page after `posts`: one below the smallest numeric id seen.
fn next_max_id(posts: &[PlatformPost]) -> Option<String> {
    posts
        .iter()
        .filter_map(|p| p.id.parse::<u64>().ok())
        .min()
        .and_then(|id| id.checked_sub(1))
        .map(|id| id.to_string())
}

/// Platform client that renders live-search pages with the session cookies attached.
pub struct RenderedSearchClient {
    render: RenderClient,
    cookies: Vec<RenderCookie>,
}

impl RenderedSearchClient {
    pub fn new(render: RenderClient, cookies: &SessionCookies) -> Self {
        Self {
            render,
            cookies: cookies.to_render_cookies(),
        }
    }
}

#[async_trait]
impl PlatformClient for RenderedSearchClient {
    async fn fetch_page(
        &self,
        query: &PageQuery,
        window: &FetchWindow,
        cursor: Option<&str>,
    ) -> Result<PostPage, FetchError> {
        let expression = search_expression(query, window, cursor);
        let url = search_url(&expression)?;
        debug!(%expression, "rendering search page");

        let html = self.render.content(url.as_str(), &self.cookies).await?;
        let parsed = parse_post_page(&html)?;
        if parsed.login_wall {
            return Err(FetchError::AuthExpired);
        }

        let next_cursor = next_max_id(&parsed.posts);
        Ok(PostPage {
            posts: parsed.posts,
            next_cursor,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CookieFile {
    Map(BTreeMap<String, String>),
    List(Vec<CookieEntry>),
}

#[derive(Debug, Deserialize)]
struct CookieEntry {
    name: String,
    value: String,
}

/// Cookies exported by the external login flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCookies {
    cookies: BTreeMap<String, String>,
}

impl SessionCookies {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let path = path.as_ref();
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SessionError::Missing(path.to_path_buf()));
            }
            Err(err) => {
                return Err(SessionError::Unreadable {
                    path: path.to_path_buf(),
                    message: err.to_string(),
                });
            }
        };
        Self::parse(path, &text)
    }

    pub fn parse(path: &Path, text: &str) -> Result<Self, SessionError> {
        let parsed: CookieFile = serde_json::from_str(text).map_err(|e| SessionError::Unreadable {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let cookies = match parsed {
            CookieFile::Map(map) => map,
            CookieFile::List(entries) => entries.into_iter().map(|c| (c.name, c.value)).collect(),
        };

        let missing = REQUIRED_COOKIES
            .iter()
            .filter(|name| cookies.get(**name).map_or(true, |v| v.trim().is_empty()))
            .map(|name| name.to_string())
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(SessionError::Invalid {
                path: path.to_path_buf(),
                missing,
            });
        }
        Ok(Self { cookies })
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn to_render_cookies(&self) -> Vec<RenderCookie> {
        self.cookies
            .iter()
            .map(|(name, value)| RenderCookie {
                name: name.clone(),
                value: value.clone(),
                domain: COOKIE_DOMAIN.to_string(),
                path: "/".to_string(),
            })
            .collect()
    }
}

/// Produces the authenticated fetch context for one run.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn open(&self) -> Result<Arc<dyn PlatformClient>, SessionError>;
}

/// Session backed by the cookie file written by the login flow. The file is never written here.
#[derive(Debug, Clone)]
pub struct CookieFileSession {
    cookies_file: PathBuf,
    render: RenderSettings,
}

impl CookieFileSession {
    pub fn new(cookies_file: impl Into<PathBuf>, render: RenderSettings) -> Self {
        Self {
            cookies_file: cookies_file.into(),
            render,
        }
    }
}

#[async_trait]
impl SessionProvider for CookieFileSession {
    async fn open(&self) -> Result<Arc<dyn PlatformClient>, SessionError> {
        let cookies = SessionCookies::load(&self.cookies_file).await?;
        debug!(count = cookies.len(), "loaded session cookies");
        let render = RenderClient::new(&self.render)?;
        Ok(Arc::new(RenderedSearchClient::new(render, &cookies)))
    }
}

/// One unit of collection work with its own watermark scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CollectionTarget {
    Timeline {
        handle: String,
    },
    Thread {
        root_id: String,
        handle: String,
        label: Option<String>,
    },
    Keyword {
        expression: String,
    },
}

impl CollectionTarget {
    pub fn source_kind(&self) -> SourceKind {
        match self {
            CollectionTarget::Timeline { .. } => SourceKind::TimelineReply,
            CollectionTarget::Thread { .. } => SourceKind::ThreadReply,
            CollectionTarget::Keyword { .. } => SourceKind::KeywordMention,
        }
    }

    /// Watermark scope: the handle, the thread root id, or the keyword expression.
    pub fn scope(&self) -> &str {
        match self {
            CollectionTarget::Timeline { handle } => handle,
            CollectionTarget::Thread { root_id, .. } => root_id,
            CollectionTarget::Keyword { expression } => expression,
        }
    }

    pub fn label(&self) -> String {
        match self {
            CollectionTarget::Timeline { handle } => format!("@{} timeline", handle.trim_start_matches('@')),
            CollectionTarget::Thread { root_id, label, .. } => {
                label.clone().unwrap_or_else(|| format!("thread {root_id}"))
            }
            CollectionTarget::Keyword { expression } => format!("search {expression}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetchLimits {
    pub max_pages: usize,
    pub max_posts: usize,
    pub reply_lookback: chrono::Duration,
}

impl Default for FetchLimits {
    fn default() -> Self {
        Self {
            max_pages: 5,
            max_posts: 40,
            reply_lookback: chrono::Duration::zero(),
        }
    }
}

/// Bounds for one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    /// Candidates are kept only when `posted_at` falls inside this window.
    pub window: FetchWindow,
    /// Oldest parent post whose replies are still listed. Not raised by the watermark.
    pub parents_since: DateTime<Utc>,
}

impl FetchRequest {
    pub fn new(window: FetchWindow) -> Self {
        Self {
            window,
            parents_since: window.start,
        }
    }

    pub fn with_parents_since(mut self, parents_since: DateTime<Utc>) -> Self {
        self.parents_since = parents_since.min(self.window.start);
        self
    }
}

/// Candidates from one fetch. `truncated` means the page budget ran out before some
/// sequence reached the window start, so older in-window posts may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedBatch {
    pub candidates: Vec<Candidate>,
    pub truncated: bool,
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    fn source_kind(&self) -> SourceKind;
    fn scope(&self) -> &str;

    /// Candidates with `posted_at` inside `request.window`.
    async fn fetch(
        &self,
        client: &dyn PlatformClient,
        request: &FetchRequest,
    ) -> Result<FetchedBatch, FetchError>;
}

fn is_newest_first(posts: &[PlatformPost]) -> bool {
    let stamps = posts.iter().filter_map(|p| p.posted_at).collect::<Vec<_>>();
    stamps.windows(2).all(|w| w[0] >= w[1])
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PagedPosts {
    pub posts: Vec<PlatformPost>,
    pub truncated: bool,
}

/// Page through `query`, keeping posts inside `window`.
///
/// Paging stops when a page comes back empty, has no continuation, or its oldest post predates
/// `window.start`. The last rule relies on newest-first page order; the first page that breaks
/// that order turns it off and the remaining pages are scanned up to `max_pages`. Running out of
/// pages while a continuation is still on offer marks the result `truncated`.
pub async fn page_through(
    client: &dyn PlatformClient,
    query: &PageQuery,
    window: &FetchWindow,
    max_pages: usize,
) -> Result<PagedPosts, FetchError> {
    let budget = max_pages.max(1);
    let mut out = PagedPosts::default();
    let mut cursor: Option<String> = None;
    let mut early_stop = true;

    for page_no in 0..budget {
        let page = client.fetch_page(query, window, cursor.as_deref()).await?;
        if page.posts.is_empty() {
            break;
        }

        if early_stop && !is_newest_first(&page.posts) {
            warn!(?query, page_no, "page not ordered newest first; scanning without early stop");
            early_stop = false;
        }

        let oldest = page.posts.iter().filter_map(|p| p.posted_at).min();
        let kept_before = out.posts.len();
        out.posts.extend(
            page.posts
                .into_iter()
                .filter(|p| p.posted_at.is_some_and(|at| window.contains(at))),
        );
        debug!(?query, page_no, kept = out.posts.len() - kept_before, "page scanned");

        if early_stop && oldest.is_some_and(|at| at < window.start) {
            break;
        }
        match page.next_cursor {
            Some(next) if cursor.as_deref() != Some(next.as_str()) => {
                if page_no + 1 == budget {
                    warn!(?query, max_pages = budget, "page budget spent before reaching window start");
                    out.truncated = true;
                }
                cursor = Some(next);
            }
            _ => break,
        }
    }

    Ok(out)
}

fn to_candidate(post: PlatformPost, parent_id: Option<&str>, fetched_at: DateTime<Utc>) -> Option<Candidate> {
    let posted_at = post.posted_at?;
    Some(Candidate {
        platform_id: post.id,
        parent_id: parent_id.map(ToString::to_string),
        author_handle: post.author_handle,
        author_display_name: post.author_display_name,
        body_text: post.text,
        posted_at,
        fetched_at,
    })
}

/// Replies to the monitored account's recent posts.
#[derive(Debug, Clone)]
pub struct TimelineRepliesFetcher {
    handle: String,
    limits: FetchLimits,
}

impl TimelineRepliesFetcher {
    pub fn new(handle: impl Into<String>, limits: FetchLimits) -> Self {
        Self {
            handle: handle.into(),
            limits,
        }
    }
}

#[async_trait]
impl SourceFetcher for TimelineRepliesFetcher {
    fn source_kind(&self) -> SourceKind {
        SourceKind::TimelineReply
    }

    fn scope(&self) -> &str {
        &self.handle
    }

    async fn fetch(
        &self,
        client: &dyn PlatformClient,
        request: &FetchRequest,
    ) -> Result<FetchedBatch, FetchError> {
        let fetched_at = Utc::now();
        let handle = self.handle.trim_start_matches('@');
        let window = &request.window;
        let post_window = FetchWindow::new(request.parents_since - self.limits.reply_lookback, window.end);
        let listed = page_through(
            client,
            &PageQuery::AccountPosts {
                handle: handle.to_string(),
            },
            &post_window,
            self.limits.max_pages,
        )
        .await?;

        let own_posts = listed
            .posts
            .into_iter()
            .filter(|p| p.author_handle.eq_ignore_ascii_case(handle))
            .take(self.limits.max_posts)
            .collect::<Vec<_>>();
        debug!(handle, posts = own_posts.len(), "monitored posts in range");

        // A short parent list means older parents were cut off by the page budget.
        let mut batch = FetchedBatch {
            truncated: listed.truncated && own_posts.len() < self.limits.max_posts,
            ..FetchedBatch::default()
        };
        for post in &own_posts {
            let replies = page_through(
                client,
                &PageQuery::Replies {
                    handle: handle.to_string(),
                    post_id: post.id.clone(),
                },
                window,
                self.limits.max_pages,
            )
            .await?;
            batch.truncated |= replies.truncated;
            batch.candidates.extend(
                replies
                    .posts
                    .into_iter()
                    .filter(|r| r.id != post.id)
                    .filter_map(|r| to_candidate(r, Some(&post.id), fetched_at)),
            );
        }
        Ok(batch)
    }
}

/// Replies inside one tracked conversation.
#[derive(Debug, Clone)]
pub struct ThreadRepliesFetcher {
    root_id: String,
    handle: String,
    limits: FetchLimits,
}

impl ThreadRepliesFetcher {
    pub fn new(root_id: impl Into<String>, handle: impl Into<String>, limits: FetchLimits) -> Self {
        Self {
            root_id: root_id.into(),
            handle: handle.into(),
            limits,
        }
    }
}

#[async_trait]
impl SourceFetcher for ThreadRepliesFetcher {
    fn source_kind(&self) -> SourceKind {
        SourceKind::ThreadReply
    }

    fn scope(&self) -> &str {
        &self.root_id
    }

    async fn fetch(
        &self,
        client: &dyn PlatformClient,
        request: &FetchRequest,
    ) -> Result<FetchedBatch, FetchError> {
        let fetched_at = Utc::now();
        let replies = page_through(
            client,
            &PageQuery::Replies {
                handle: self.handle.trim_start_matches('@').to_string(),
                post_id: self.root_id.clone(),
            },
            &request.window,
            self.limits.max_pages,
        )
        .await?;
        Ok(FetchedBatch {
            truncated: replies.truncated,
            candidates: replies
                .posts
                .into_iter()
                .filter(|r| r.id != self.root_id)
                .filter_map(|r| to_candidate(r, Some(&self.root_id), fetched_at))
                .collect(),
        })
    }
}

/// Platform-wide search hits for a keyword expression.
#[derive(Debug, Clone)]
pub struct KeywordMentionsFetcher {
    expression: String,
    limits: FetchLimits,
}

impl KeywordMentionsFetcher {
    pub fn new(expression: impl Into<String>, limits: FetchLimits) -> Self {
        Self {
            expression: expression.into(),
            limits,
        }
    }
}

#[async_trait]
impl SourceFetcher for KeywordMentionsFetcher {
    fn source_kind(&self) -> SourceKind {
        SourceKind::KeywordMention
    }

    fn scope(&self) -> &str {
        &self.expression
    }

    async fn fetch(
        &self,
        client: &dyn PlatformClient,
        request: &FetchRequest,
    ) -> Result<FetchedBatch, FetchError> {
        let fetched_at = Utc::now();
        let hits = page_through(
            client,
            &PageQuery::Search {
                expression: self.expression.clone(),
            },
            &request.window,
            self.limits.max_pages,
        )
        .await?;
        Ok(FetchedBatch {
            truncated: hits.truncated,
            candidates: hits
                .posts
                .into_iter()
                .filter_map(|h| to_candidate(h, None, fetched_at))
                .collect(),
        })
    }
}

pub fn fetcher_for_target(target: &CollectionTarget, limits: FetchLimits) -> Box<dyn SourceFetcher> {
    match target {
        CollectionTarget::Timeline { handle } => Box::new(TimelineRepliesFetcher::new(handle.clone(), limits)),
        CollectionTarget::Thread { root_id, handle, .. } => {
            Box::new(ThreadRepliesFetcher::new(root_id.clone(), handle.clone(), limits))
        }
        CollectionTarget::Keyword { expression } => {
            Box::new(KeywordMentionsFetcher::new(expression.clone(), limits))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 25, h, m, 0).single().unwrap()
    }

    fn post(id: &str, handle: &str, at: DateTime<Utc>, text: &str) -> PlatformPost {
        PlatformPost {
            id: id.to_string(),
            author_handle: handle.to_string(),
            author_display_name: handle.to_string(),
            text: text.to_string(),
            posted_at: Some(at),
        }
    }

    /// Serves scripted pages per query; the cursor is the index of the next page.
    #[derive(Default)]
    struct ScriptedPlatform {
        pages: HashMap<PageQuery, Vec<Vec<PlatformPost>>>,
        calls: StdMutex<Vec<(PageQuery, Option<String>)>>,
        fail_with_auth: bool,
    }

    impl ScriptedPlatform {
        fn with_pages(mut self, query: PageQuery, pages: Vec<Vec<PlatformPost>>) -> Self {
            self.pages.insert(query, pages);
            self
        }

        fn calls_for(&self, query: &PageQuery) -> usize {
            self.calls.lock().unwrap().iter().filter(|(q, _)| q == query).count()
        }
    }

    #[async_trait]
    impl PlatformClient for ScriptedPlatform {
        async fn fetch_page(
            &self,
            query: &PageQuery,
            _window: &FetchWindow,
            cursor: Option<&str>,
        ) -> Result<PostPage, FetchError> {
            self.calls
                .lock()
                .unwrap()
                .push((query.clone(), cursor.map(ToString::to_string)));
            if self.fail_with_auth {
                return Err(FetchError::AuthExpired);
            }
            let index = cursor.map(|c| c.parse::<usize>().unwrap()).unwrap_or(0);
            let pages = self.pages.get(query).cloned().unwrap_or_default();
            let posts = pages.get(index).cloned().unwrap_or_default();
            let next_cursor = (index + 1 < pages.len()).then(|| (index + 1).to_string());
            Ok(PostPage { posts, next_cursor })
        }
    }

    fn search(expr: &str) -> PageQuery {
        PageQuery::Search {
            expression: expr.to_string(),
        }
    }

    #[test]
    fn status_href_parsing_handles_relative_and_absolute_links() {
        assert_eq!(
            parse_status_href("/asha_dev/status/1894000000000000001"),
            Some(("asha_dev".to_string(), "1894000000000000001".to_string()))
        );
        assert_eq!(
            parse_status_href("https://x.com/SarvamAI/status/42/analytics"),
            Some(("SarvamAI".to_string(), "42".to_string()))
        );
        assert_eq!(parse_status_href("/i/status/"), None);
        assert_eq!(parse_status_href("/home"), None);
    }

    #[test]
    fn search_expression_bounds_window_and_appends_cursor() {
        let window = FetchWindow::new(ts(10, 0), ts(12, 0));
        let expr = search_expression(
            &PageQuery::AccountPosts {
                handle: "@SarvamAI".to_string(),
            },
            &window,
            None,
        );
        assert_eq!(
            expr,
            format!(
                "from:SarvamAI -filter:replies since_time:{} until_time:{}",
                ts(10, 0).timestamp(),
                ts(12, 0).timestamp()
            )
        );

        let expr = search_expression(&search("indus OR \"sarvam indus\""), &window, Some("99"));
        assert!(expr.starts_with("(indus OR \"sarvam indus\") since_time:"));
        assert!(expr.ends_with(" max_id:99"));

        let url = search_url(&expr).unwrap();
        assert_eq!(url.host_str(), Some("x.com"));
        assert!(url.query().unwrap().contains("f=live"));
    }

    #[test]
    fn next_cursor_is_one_below_smallest_id() {
        let posts = vec![post("105", "a", ts(10, 0), ""), post("101", "b", ts(9, 0), "")];
        assert_eq!(next_max_id(&posts), Some("100".to_string()));
        assert_eq!(next_max_id(&[]), None);
    }

    #[tokio::test]
    async fn paging_stops_once_a_page_reaches_before_window_start() {
        let query = search("indus");
        let platform = ScriptedPlatform::default().with_pages(
            query.clone(),
            vec![
                vec![post("5", "a", ts(11, 30), "x"), post("4", "a", ts(11, 0), "x")],
                vec![post("3", "a", ts(10, 30), "x"), post("2", "a", ts(9, 30), "x")],
                vec![post("1", "a", ts(9, 0), "x")],
            ],
        );
        let window = FetchWindow::new(ts(10, 0), ts(12, 0));

        let paged = page_through(&platform, &query, &window, 10).await.unwrap();
        let ids = paged.posts.iter().map(|p| p.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["5", "4", "3"]);
        assert_eq!(platform.calls_for(&query), 2);
        assert!(!paged.truncated);
    }

    #[tokio::test]
    async fn out_of_order_page_disables_early_stop() {
        let query = search("indus");
        let platform = ScriptedPlatform::default().with_pages(
            query.clone(),
            vec![
                // oldest item first breaks the newest-first assumption
                vec![post("2", "a", ts(9, 30), "x"), post("6", "a", ts(11, 30), "x")],
                vec![post("5", "a", ts(10, 45), "x")],
                vec![],
            ],
        );
        let window = FetchWindow::new(ts(10, 0), ts(12, 0));

        let paged = page_through(&platform, &query, &window, 10).await.unwrap();
        let ids = paged.posts.iter().map(|p| p.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["6", "5"]);
        assert_eq!(platform.calls_for(&query), 3);
        assert!(!paged.truncated);
    }

    #[tokio::test]
    async fn paging_respects_max_pages_and_window_end() {
        let query = search("indus");
        let platform = ScriptedPlatform::default().with_pages(
            query.clone(),
            vec![
                vec![post("9", "a", ts(12, 30), "too new"), post("8", "a", ts(11, 50), "x")],
                vec![post("7", "a", ts(11, 40), "x")],
                vec![post("6", "a", ts(11, 30), "x")],
            ],
        );
        let window = FetchWindow::new(ts(10, 0), ts(12, 0));

        let paged = page_through(&platform, &query, &window, 2).await.unwrap();
        let ids = paged.posts.iter().map(|p| p.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["8", "7"]);
        assert!(paged.truncated, "a third page was still on offer");
    }

    #[tokio::test]
    async fn spending_the_page_budget_on_the_last_page_is_not_truncation() {
        let query = search("indus");
        let platform = ScriptedPlatform::default().with_pages(
            query.clone(),
            vec![
                vec![post("8", "a", ts(11, 50), "x")],
                vec![post("7", "a", ts(11, 40), "x")],
            ],
        );
        let window = FetchWindow::new(ts(10, 0), ts(12, 0));

        let paged = page_through(&platform, &query, &window, 2).await.unwrap();
        assert_eq!(paged.posts.len(), 2);
        assert!(!paged.truncated);
    }

    #[tokio::test]
    async fn timeline_fetcher_flattens_replies_under_each_post() {
        let window = FetchWindow::new(ts(10, 0), ts(12, 0));
        let posts_query = PageQuery::AccountPosts {
            handle: "SarvamAI".to_string(),
        };
        let replies_to = |id: &str| PageQuery::Replies {
            handle: "SarvamAI".to_string(),
            post_id: id.to_string(),
        };
        let platform = ScriptedPlatform::default()
            .with_pages(
                posts_query,
                vec![vec![
                    post("200", "SarvamAI", ts(11, 0), "Indus is live"),
                    post("150", "SarvamAI", ts(10, 30), "Changelog"),
                ]],
            )
            .with_pages(
                replies_to("200"),
                vec![vec![
                    post("210", "asha_dev", ts(11, 20), "Loving the new Indus update!"),
                    post("200", "SarvamAI", ts(11, 0), "Indus is live"),
                ]],
            )
            .with_pages(
                replies_to("150"),
                vec![vec![post("160", "ravi", ts(10, 40), "voice mode lags")]],
            );

        let fetcher = TimelineRepliesFetcher::new("@SarvamAI", FetchLimits::default());
        let batch = fetcher.fetch(&platform, &FetchRequest::new(window)).await.unwrap();
        assert!(!batch.truncated);

        let got = batch
            .candidates
            .iter()
            .map(|c| (c.platform_id.as_str(), c.parent_id.as_deref()))
            .collect::<Vec<_>>();
        assert_eq!(got, vec![("210", Some("200")), ("160", Some("150"))]);
        assert_eq!(fetcher.scope(), "@SarvamAI");
        assert_eq!(fetcher.source_kind(), SourceKind::TimelineReply);
    }

    #[tokio::test]
    async fn timeline_parents_are_listed_below_a_raised_window_start() {
        // Window raised to the last stored reply; the parent post is older than that.
        let window = FetchWindow::new(ts(10, 20), ts(12, 0));
        let platform = ScriptedPlatform::default()
            .with_pages(
                PageQuery::AccountPosts {
                    handle: "SarvamAI".to_string(),
                },
                vec![vec![post("100", "SarvamAI", ts(9, 0), "Indus beta")]],
            )
            .with_pages(
                PageQuery::Replies {
                    handle: "SarvamAI".to_string(),
                    post_id: "100".to_string(),
                },
                vec![vec![
                    post("120", "meera", ts(11, 30), "indus keeps crashing"),
                    post("110", "asha_dev", ts(10, 20), "nice"),
                ]],
            );
        let fetcher = TimelineRepliesFetcher::new("SarvamAI", FetchLimits::default());

        let narrow = fetcher.fetch(&platform, &FetchRequest::new(window)).await.unwrap();
        assert!(narrow.candidates.is_empty());

        let request = FetchRequest::new(window).with_parents_since(ts(8, 0));
        let batch = fetcher.fetch(&platform, &request).await.unwrap();
        let ids = batch
            .candidates
            .iter()
            .map(|c| c.platform_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["120", "110"]);
    }

    #[tokio::test]
    async fn truncated_reply_paging_marks_the_batch() {
        let window = FetchWindow::new(ts(10, 0), ts(12, 0));
        let thread_query = PageQuery::Replies {
            handle: "SarvamAI".to_string(),
            post_id: "900".to_string(),
        };
        let platform = ScriptedPlatform::default().with_pages(
            thread_query,
            vec![
                vec![post("950", "meera", ts(11, 30), "x")],
                vec![post("940", "ravi", ts(10, 30), "y")],
            ],
        );
        let limits = FetchLimits {
            max_pages: 1,
            ..FetchLimits::default()
        };

        let batch = ThreadRepliesFetcher::new("900", "SarvamAI", limits)
            .fetch(&platform, &FetchRequest::new(window))
            .await
            .unwrap();
        assert_eq!(batch.candidates.len(), 1);
        assert!(batch.truncated);
    }

    #[test]
    fn render_token_is_query_encoded() {
        let settings = RenderSettings {
            endpoint: "http://localhost:3000/".to_string(),
            token: Some("a&b=c d".to_string()),
            ..RenderSettings::default()
        };
        let client = RenderClient::new(&settings).unwrap();
        assert_eq!(
            client.content_url().unwrap().as_str(),
            "http://localhost:3000/content?token=a%26b%3Dc+d"
        );
    }

    #[tokio::test]
    async fn thread_and_keyword_fetchers_set_parent_ids() {
        let window = FetchWindow::new(ts(10, 0), ts(12, 0));
        let thread_query = PageQuery::Replies {
            handle: "SarvamAI".to_string(),
            post_id: "900".to_string(),
        };
        let platform = ScriptedPlatform::default()
            .with_pages(
                thread_query,
                vec![vec![
                    post("950", "meera", ts(11, 0), "dark mode please"),
                    post("900", "SarvamAI", ts(10, 5), "Tell us what you think"),
                ]],
            )
            .with_pages(
                search("indus app"),
                vec![vec![post("77", "kiran", ts(10, 10), "indus app is fast")]],
            );

        let thread = fetcher_for_target(
            &CollectionTarget::Thread {
                root_id: "900".to_string(),
                handle: "SarvamAI".to_string(),
                label: Some("launch thread".to_string()),
            },
            FetchLimits::default(),
        );
        let replies = thread.fetch(&platform, &FetchRequest::new(window)).await.unwrap().candidates;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].parent_id.as_deref(), Some("900"));

        let keyword = fetcher_for_target(
            &CollectionTarget::Keyword {
                expression: "indus app".to_string(),
            },
            FetchLimits::default(),
        );
        let hits = keyword.fetch(&platform, &FetchRequest::new(window)).await.unwrap().candidates;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].parent_id, None);
        assert_eq!(keyword.source_kind(), SourceKind::KeywordMention);
    }

    #[tokio::test]
    async fn auth_expiry_surfaces_from_fetchers() {
        let platform = ScriptedPlatform {
            fail_with_auth: true,
            ..Default::default()
        };
        let window = FetchWindow::new(ts(10, 0), ts(12, 0));
        let err = KeywordMentionsFetcher::new("indus", FetchLimits::default())
            .fetch(&platform, &FetchRequest::new(window))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::AuthExpired));
        assert!(!err.is_retryable());
    }

    #[test]
    fn session_cookies_require_auth_token_and_ct0() {
        let path = Path::new("data/cookies.json");
        let ok = SessionCookies::parse(path, r#"{"auth_token":"abc","ct0":"def","lang":"en"}"#).unwrap();
        assert_eq!(ok.len(), 3);
        assert!(ok.to_render_cookies().iter().all(|c| c.domain == ".x.com"));

        let listed = SessionCookies::parse(
            path,
            r#"[{"name":"auth_token","value":"abc","domain":".x.com"},{"name":"ct0","value":"def"}]"#,
        )
        .unwrap();
        assert_eq!(listed.len(), 2);

        match SessionCookies::parse(path, r#"{"auth_token":"abc"}"#) {
            Err(SessionError::Invalid { missing, .. }) => assert_eq!(missing, vec!["ct0".to_string()]),
            other => panic!("expected invalid session, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_cookie_file_is_reported_as_missing_session() {
        let dir = tempfile::tempdir().unwrap();
        let session = CookieFileSession::new(dir.path().join("cookies.json"), RenderSettings::default());
        match session.open().await {
            Err(SessionError::Missing(path)) => assert!(path.ends_with("cookies.json")),
            Err(other) => panic!("expected missing session, got {other}"),
            Ok(_) => panic!("expected missing session"),
        }
    }

    #[test]
    fn render_status_classification() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn pacer_spaces_requests_after_burst() {
        let pacer = RequestPacer::new(1, Duration::from_millis(40));
        let started = Instant::now();
        pacer.acquire().await;
        pacer.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(35));
    }
}
