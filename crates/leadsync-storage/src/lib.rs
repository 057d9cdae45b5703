//! HTTP plumbing, pacing and the append-only destination contract for leadsync.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use leadsync_core::redact_query;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadsync-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        // reqwest renders the full URL, which carries the access token.
        FetchError::Request(err.without_url())
    }
}

/// Shared HTTP client. One request at a time per caller; no retries, the
/// caller decides what to do with a failure.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
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
        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        run_id: Uuid,
        url: &str,
    ) -> Result<T, FetchError> {
        let span = info_span!("http_fetch", %run_id, url = redact_query(url));
        async move {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            if status != StatusCode::OK {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: redact_query(url).to_string(),
                });
            }
            let body = resp.bytes().await?;
            debug!(bytes = body.len(), "response received");
            serde_json::from_slice(&body).map_err(|err| FetchError::Decode {
                url: redact_query(url).to_string(),
                message: err.to_string(),
            })
        }
        .instrument(span)
        .await
    }
}

/// Sleep for `delay` unless `cancel` fires first. Returns `false` when cancelled.
pub async fn pace(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Spreadsheet key plus the named worksheet rows are appended to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationKey {
    pub spreadsheet_key: String,
    pub worksheet: String,
}

impl DestinationKey {
    pub fn new(spreadsheet_key: impl Into<String>, worksheet: impl Into<String>) -> Self {
        Self {
            spreadsheet_key: spreadsheet_key.into(),
            worksheet: worksheet.into(),
        }
    }
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.spreadsheet_key, self.worksheet)
    }
}

#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("worksheet {0} not found")]
    WorksheetNotFound(String),
    #[error("invalid destination url {0}")]
    InvalidUrl(String),
    #[error("destination rejected the write: {0}")]
    Rejected(String),
}

impl From<reqwest::Error> for DestinationError {
    fn from(err: reqwest::Error) -> Self {
        DestinationError::Request(err.without_url())
    }
}

/// Append-only tabular store.
#[async_trait]
pub trait Destination: Send + Sync {
    fn describe(&self) -> String;

    async fn row_count(&self) -> Result<u64, DestinationError>;

    async fn append_header(&self, columns: &[String]) -> Result<(), DestinationError>;

    async fn append_rows(&self, rows: &[Vec<String>]) -> Result<(), DestinationError>;
}

#[derive(Debug, Error)]
pub enum AuthorizationError {
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    #[error("access to {key} denied (http status {status})")]
    Denied { key: String, status: u16 },
    #[error("worksheet {0} not found")]
    WorksheetNotFound(String),
    #[error("destination unreachable: {0}")]
    Unreachable(String),
}

/// Exchanges credentials for a destination handle. Acquiring the credentials
/// themselves happens elsewhere.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn open(&self, key: &DestinationKey) -> Result<Arc<dyn Destination>, AuthorizationError>;
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetMeta>,
}

#[derive(Debug, Deserialize)]
struct SheetMeta {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    title: String,
    #[serde(default)]
    grid_properties: Option<GridProperties>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GridProperties {
    #[serde(default)]
    row_count: u64,
}

/// Worksheet in a Google spreadsheet, spoken to over the Sheets v4 REST API.
pub struct SheetsDestination {
    client: reqwest::Client,
    base_url: String,
    key: DestinationKey,
    bearer_token: String,
}

impl fmt::Debug for SheetsDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SheetsDestination")
            .field("base_url", &self.base_url)
            .field("key", &self.key)
            .field("bearer_token", &"<redacted>")
            .finish()
    }
}

impl SheetsDestination {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        key: DestinationKey,
        bearer_token: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            key,
            bearer_token: bearer_token.into(),
        }
    }

    pub fn key(&self) -> &DestinationKey {
        &self.key
    }

    fn spreadsheet_url(&self, extra: &[&str]) -> Result<Url, DestinationError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|err| DestinationError::InvalidUrl(format!("{}: {err}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| DestinationError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(["v4", "spreadsheets", self.key.spreadsheet_key.as_str()])
            .extend(extra);
        Ok(url)
    }

    fn checked(resp: reqwest::Response) -> Result<reqwest::Response, DestinationError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        Err(DestinationError::HttpStatus {
            status: status.as_u16(),
            url: redact_query(resp.url().as_str()).to_string(),
        })
    }
}

#[async_trait]
impl Destination for SheetsDestination {
    fn describe(&self) -> String {
        format!("sheets:{}", self.key)
    }

    async fn row_count(&self) -> Result<u64, DestinationError> {
        let mut url = self.spreadsheet_url(&[])?;
        url.query_pairs_mut().append_pair("fields", "sheets.properties");
        let resp = self
            .client
            .get(url.clone())
            .bearer_auth(&self.bearer_token)
            .send()
            .await?;
        let body = Self::checked(resp)?.bytes().await?;
        let meta: SpreadsheetMeta =
            serde_json::from_slice(&body).map_err(|err| DestinationError::Decode {
                url: redact_query(url.as_str()).to_string(),
                message: err.to_string(),
            })?;

        meta.sheets
            .into_iter()
            .find(|sheet| sheet.properties.title == self.key.worksheet)
            .map(|sheet| {
                sheet
                    .properties
                    .grid_properties
                    .map(|grid| grid.row_count)
                    .unwrap_or_default()
            })
            .ok_or_else(|| DestinationError::WorksheetNotFound(self.key.worksheet.clone()))
    }

    async fn append_header(&self, columns: &[String]) -> Result<(), DestinationError> {
        self.append_rows(&[columns.to_vec()]).await
    }

    async fn append_rows(&self, rows: &[Vec<String>]) -> Result<(), DestinationError> {
        let append_range = format!("{}:append", self.key.worksheet);
        let mut url = self.spreadsheet_url(&["values", append_range.as_str()])?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "RAW")
            .append_pair("insertDataOption", "INSERT_ROWS");
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.bearer_token)
            .json(&json!({ "majorDimension": "ROWS", "values": rows }))
            .send()
            .await?;
        Self::checked(resp)?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct CredentialsBlob {
    access_token: Option<String>,
    token: Option<String>,
}

/// Opens Sheets worksheets with a bearer token taken from a credentials blob
/// (`{"access_token": "..."}` or `{"token": "..."}`).
pub struct BearerTokenAuthenticator {
    client: reqwest::Client,
    sheets_base_url: String,
    bearer_token: String,
}

impl fmt::Debug for BearerTokenAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerTokenAuthenticator")
            .field("sheets_base_url", &self.sheets_base_url)
            .field("bearer_token", &"<redacted>")
            .finish()
    }
}

impl BearerTokenAuthenticator {
    pub fn from_credentials_json(
        http: &HttpFetcher,
        sheets_base_url: impl Into<String>,
        credentials_json: &str,
    ) -> Result<Self, AuthorizationError> {
        let blob: CredentialsBlob = serde_json::from_str(credentials_json)
            .map_err(|err| AuthorizationError::InvalidCredentials(err.to_string()))?;
        let bearer_token = blob
            .access_token
            .or(blob.token)
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| {
                AuthorizationError::InvalidCredentials("no access_token in credentials".to_string())
            })?;
        Ok(Self {
            client: http.client().clone(),
            sheets_base_url: sheets_base_url.into(),
            bearer_token,
        })
    }
}

#[async_trait]
impl Authenticator for BearerTokenAuthenticator {
    async fn open(&self, key: &DestinationKey) -> Result<Arc<dyn Destination>, AuthorizationError> {
        let destination = SheetsDestination::new(
            self.client.clone(),
            self.sheets_base_url.clone(),
            key.clone(),
            self.bearer_token.clone(),
        );

        match destination.row_count().await {
            Ok(_) => Ok(Arc::new(destination)),
            Err(DestinationError::HttpStatus { status, .. })
                if status == StatusCode::UNAUTHORIZED.as_u16()
                    || status == StatusCode::FORBIDDEN.as_u16()
                    || status == StatusCode::NOT_FOUND.as_u16() =>
            {
                Err(AuthorizationError::Denied {
                    key: key.to_string(),
                    status,
                })
            }
            Err(DestinationError::WorksheetNotFound(name)) => {
                Err(AuthorizationError::WorksheetNotFound(name))
            }
            Err(err) => Err(AuthorizationError::Unreachable(err.to_string())),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    row_count: u64,
    header: Option<Vec<String>>,
    rows: Vec<Vec<String>>,
    batch_sizes: Vec<usize>,
}

/// In-memory destination. Starts out reporting a row count of 1, the value
/// a freshly created worksheet without a header reports.
#[derive(Debug)]
pub struct MemoryDestination {
    name: String,
    fail_from_batch: Option<usize>,
    state: Mutex<MemoryState>,
}

impl Default for MemoryDestination {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl MemoryDestination {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fail_from_batch: None,
            state: Mutex::new(MemoryState {
                row_count: 1,
                ..Default::default()
            }),
        }
    }

    pub fn with_row_count(self, row_count: u64) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                row_count,
                ..Default::default()
            }),
            ..self
        }
    }

    /// Reject every `append_rows` call from the given zero-based call index on.
    pub fn failing_from_batch(self, batch_index: usize) -> Self {
        Self {
            fail_from_batch: Some(batch_index),
            ..self
        }
    }

    pub async fn header(&self) -> Option<Vec<String>> {
        self.state.lock().await.header.clone()
    }

    pub async fn rows(&self) -> Vec<Vec<String>> {
        self.state.lock().await.rows.clone()
    }

    pub async fn batch_sizes(&self) -> Vec<usize> {
        self.state.lock().await.batch_sizes.clone()
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    fn describe(&self) -> String {
        format!("memory:{}", self.name)
    }

    async fn row_count(&self) -> Result<u64, DestinationError> {
        Ok(self.state.lock().await.row_count)
    }

    async fn append_header(&self, columns: &[String]) -> Result<(), DestinationError> {
        let mut state = self.state.lock().await;
        state.header = Some(columns.to_vec());
        state.row_count += 1;
        Ok(())
    }

    async fn append_rows(&self, rows: &[Vec<String>]) -> Result<(), DestinationError> {
        let mut state = self.state.lock().await;
        if self
            .fail_from_batch
            .is_some_and(|index| state.batch_sizes.len() >= index)
        {
            return Err(DestinationError::Rejected(format!(
                "{} refuses batch {}",
                self.name,
                state.batch_sizes.len()
            )));
        }
        state.rows.extend(rows.iter().cloned());
        state.batch_sizes.push(rows.len());
        state.row_count += rows.len() as u64;
        Ok(())
    }
}
