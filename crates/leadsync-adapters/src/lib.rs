//! Lead listing source contract, the Graph lead endpoint, and cursor-following pagination.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use leadsync_core::{Cursor, RawRecord, ACCESS_TOKEN_PARAM};
use leadsync_storage::{pace, FetchError, HttpFetcher};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadsync-adapters";

/// Page size requested on the first page, whatever the target count.
pub const FIRST_PAGE_SIZE: usize = 100;

pub const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.facebook.com";
pub const DEFAULT_GRAPH_API_VERSION: &str = "v17.0";

/// Ready-to-use source credentials, built once by the caller.
#[derive(Clone)]
pub struct SessionHandle {
    access_token: String,
}

impl SessionHandle {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("access_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeadPage {
    pub records: Vec<RawRecord>,
    pub next: Option<Cursor>,
}

#[async_trait]
pub trait LeadSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Cursor of the first page.
    fn start_cursor(&self) -> Cursor;

    async fn fetch_page(&self, run_id: Uuid, cursor: &Cursor) -> Result<LeadPage, FetchError>;
}

#[derive(Debug, Deserialize)]
struct GraphPage {
    #[serde(default)]
    data: Vec<RawRecord>,
    #[serde(default)]
    paging: Option<GraphPaging>,
}

#[derive(Debug, Deserialize)]
struct GraphPaging {
    #[serde(default)]
    next: Option<String>,
}

impl From<GraphPage> for LeadPage {
    fn from(page: GraphPage) -> Self {
        Self {
            records: page.data,
            next: page.paging.and_then(|p| p.next).map(Cursor::new),
        }
    }
}

/// Leads of one ad, read from the versioned Graph listing resource.
#[derive(Debug, Clone)]
pub struct GraphLeadSource {
    http: HttpFetcher,
    session: SessionHandle,
    target_id: String,
    listing_url: Url,
}

impl GraphLeadSource {
    pub fn new(
        http: HttpFetcher,
        session: &SessionHandle,
        base_url: &str,
        api_version: &str,
        target_id: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let target_id = target_id.into();
        let base = format!(
            "{}/{}/{}/leads",
            base_url.trim_end_matches('/'),
            api_version.trim_matches('/'),
            target_id
        );
        let limit = FIRST_PAGE_SIZE.to_string();
        let listing_url = Url::parse_with_params(
            &base,
            [
                (ACCESS_TOKEN_PARAM, session.access_token()),
                ("limit", limit.as_str()),
            ],
        )
        .with_context(|| format!("building lead listing url from {base}"))?;

        Ok(Self {
            http,
            session: session.clone(),
            target_id,
            listing_url,
        })
    }

    /// Request URL for `cursor`. A cursor handed back without its token (see
    /// `Cursor::resumable`) gets the session token attached again.
    fn request_url(&self, cursor: &Cursor) -> String {
        match Url::parse(cursor.as_str()) {
            Ok(mut url) if !url.query_pairs().any(|(name, _)| name == ACCESS_TOKEN_PARAM) => {
                url.query_pairs_mut()
                    .append_pair(ACCESS_TOKEN_PARAM, self.session.access_token());
                url.to_string()
            }
            _ => cursor.as_str().to_string(),
        }
    }
}

#[async_trait]
impl LeadSource for GraphLeadSource {
    fn source_id(&self) -> &str {
        &self.target_id
    }

    fn start_cursor(&self) -> Cursor {
        Cursor::new(self.listing_url.as_str())
    }

    async fn fetch_page(&self, run_id: Uuid, cursor: &Cursor) -> Result<LeadPage, FetchError> {
        let page: GraphPage = self.http.get_json(run_id, &self.request_url(cursor)).await?;
        Ok(page.into())
    }
}

pub trait FetchProgress: Send + Sync {
    fn on_page(&self, _page_index: usize, _records_so_far: usize) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl FetchProgress for NoopProgress {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStop {
    NothingRequested,
    TargetReached,
    Exhausted,
    Failed,
    Cancelled,
}

#[derive(Debug)]
pub struct FetchReport {
    pub records: Vec<RawRecord>,
    pub pages: usize,
    pub stop: FetchStop,
    pub error: Option<FetchError>,
    /// Where a later run could pick up: the failed or not-yet-fetched page.
    pub resume_cursor: Option<Cursor>,
}

impl FetchReport {
    fn empty(stop: FetchStop) -> Self {
        Self {
            records: Vec::new(),
            pages: 0,
            stop,
            error: None,
            resume_cursor: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PaginationConfig {
    /// Pause before following each next-page cursor.
    pub page_delay: Duration,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            page_delay: Duration::from_secs(1),
        }
    }
}

pub struct PaginatedFetcher {
    config: PaginationConfig,
    cancel: CancellationToken,
    progress: Arc<dyn FetchProgress>,
}

impl PaginatedFetcher {
    pub fn new(config: PaginationConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            progress: Arc::new(NoopProgress),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn FetchProgress>) -> Self {
        self.progress = progress;
        self
    }

    /// Walk the listing from `start_cursor` (or the source's first page) until
    /// `target_count` records are in hand, the source runs out, a page fails,
    /// or the run is cancelled. Records gathered before a failure are kept.
    pub async fn fetch(
        &self,
        source: &dyn LeadSource,
        run_id: Uuid,
        start_cursor: Option<Cursor>,
        target_count: usize,
    ) -> FetchReport {
        if target_count == 0 {
            return FetchReport::empty(FetchStop::NothingRequested);
        }

        let mut report = FetchReport::empty(FetchStop::Exhausted);
        let mut remaining = target_count;
        let mut cursor = start_cursor.unwrap_or_else(|| source.start_cursor());

        loop {
            if self.cancel.is_cancelled() {
                report.stop = FetchStop::Cancelled;
                report.resume_cursor = Some(cursor);
                break;
            }

            let page = match source.fetch_page(run_id, &cursor).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(
                        %run_id,
                        source = source.source_id(),
                        page = report.pages,
                        error = %err,
                        "page fetch failed"
                    );
                    report.stop = FetchStop::Failed;
                    report.error = Some(err);
                    report.resume_cursor = Some(cursor);
                    break;
                }
            };

            let received = page.records.len();
            report.records.extend(page.records);
            remaining = remaining.saturating_sub(received);
            self.progress.on_page(report.pages, report.records.len());
            info!(
                %run_id,
                source = source.source_id(),
                page = report.pages,
                records = received,
                total = report.records.len(),
                "fetched lead page"
            );
            report.pages += 1;

            if remaining == 0 {
                report.stop = FetchStop::TargetReached;
                report.resume_cursor = page.next;
                break;
            }

            let Some(next) = page.next else {
                report.stop = FetchStop::Exhausted;
                break;
            };

            if !pace(self.config.page_delay, &self.cancel).await {
                report.stop = FetchStop::Cancelled;
                report.resume_cursor = Some(next);
                break;
            }
            cursor = next;
        }

        report.records.truncate(target_count);
        report
    }
}
