//! Ingestion orchestration: fetch lead pages, normalize them, append them to the sheet.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use leadsync_adapters::{
    FetchProgress, FetchReport, FetchStop, GraphLeadSource, LeadSource, PaginatedFetcher,
    PaginationConfig, SessionHandle,
};
use leadsync_core::{normalize, Cursor, NormalizedRow, RawRecord, SchemaAccumulator};
use leadsync_storage::{
    Authenticator, AuthorizationError, BearerTokenAuthenticator, Destination, DestinationKey,
    FetchError, HttpFetcher,
};
use serde::{Serialize, Serializer};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

mod config;
mod writer;

pub use config::{IngestConfig, DEFAULT_SHEETS_BASE_URL, DEFAULT_WORKSHEET};
pub use writer::{
    QuotaAwareWriter, WriteError, WriteOutcome, WriteProgress, WriterConfig, BATCH_SIZE,
    HEADERLESS_ROW_COUNT,
};

pub const CRATE_NAME: &str = "leadsync-sync";

/// `resume_cursor` on the fetch and cancel variants is where a rerun should
/// start so that nothing is skipped: the first page whose records were not
/// written. `None` means start from the first page.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(
        "fetching leads failed after {records_fetched} records ({rows_written} rows written): {source}"
    )]
    Fetch {
        source: FetchError,
        records_fetched: usize,
        rows_written: usize,
        resume_cursor: Option<Cursor>,
    },
    #[error("opening destination: {0}")]
    Authorization(#[from] AuthorizationError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error("ingestion cancelled after {rows_written} rows were written")]
    Cancelled {
        rows_written: usize,
        resume_cursor: Option<Cursor>,
    },
    #[error(transparent)]
    Setup(#[from] anyhow::Error),
}

impl IngestError {
    /// Rows durably appended before the run stopped.
    pub fn rows_written(&self) -> usize {
        match self {
            IngestError::Fetch { rows_written, .. }
            | IngestError::Cancelled { rows_written, .. } => *rows_written,
            IngestError::Write(err) => err.rows_written(),
            IngestError::Authorization(_) | IngestError::Setup(_) => 0,
        }
    }

    pub fn resume_cursor(&self) -> Option<&Cursor> {
        match self {
            IngestError::Fetch { resume_cursor, .. }
            | IngestError::Cancelled { resume_cursor, .. } => resume_cursor.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_fetched: usize,
    pub records_fetched: usize,
    pub rows_written: usize,
    pub batches_written: usize,
    pub header_written: bool,
    pub columns: Vec<String>,
    pub fetch_stop: FetchStop,
    /// Next unfetched page. Serialized without the access token.
    #[serde(serialize_with = "serialize_resumable")]
    pub resume_cursor: Option<Cursor>,
}

fn serialize_resumable<S: Serializer>(
    cursor: &Option<Cursor>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    cursor.as_ref().map(Cursor::resumable).serialize(serializer)
}

/// Normalize every record in order, growing one schema across all of them.
pub fn normalize_records(records: &[RawRecord]) -> (Vec<NormalizedRow>, SchemaAccumulator) {
    let mut schema = SchemaAccumulator::new();
    let rows = records
        .iter()
        .map(|record| {
            let row = normalize(record);
            schema.observe(&row);
            row
        })
        .collect();
    (rows, schema)
}

pub struct IngestionPipeline {
    fetcher: PaginatedFetcher,
    writer: QuotaAwareWriter,
    write_partial_on_fetch_error: bool,
}

impl IngestionPipeline {
    pub fn new(pagination: PaginationConfig, writer: WriterConfig) -> Self {
        Self {
            fetcher: PaginatedFetcher::new(pagination),
            writer: QuotaAwareWriter::new(writer),
            write_partial_on_fetch_error: true,
        }
    }

    pub fn from_config(config: &IngestConfig) -> Self {
        Self::new(config.pagination_config(), config.writer_config())
            .with_partial_writes(config.write_partial_on_fetch_error)
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.fetcher = self.fetcher.with_cancel(cancel.clone());
        self.writer = self.writer.with_cancel(cancel);
        self
    }

    pub fn with_progress<P>(mut self, progress: Arc<P>) -> Self
    where
        P: FetchProgress + WriteProgress + 'static,
    {
        self.fetcher = self.fetcher.with_progress(progress.clone());
        self.writer = self.writer.with_progress(progress);
        self
    }

    /// Whether records fetched before a page failure are still written.
    pub fn with_partial_writes(mut self, enabled: bool) -> Self {
        self.write_partial_on_fetch_error = enabled;
        self
    }

    pub async fn run(
        &self,
        source: &dyn LeadSource,
        destination: &dyn Destination,
        start_cursor: Option<Cursor>,
        target_count: usize,
    ) -> Result<IngestSummary, IngestError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(
            %run_id,
            source = source.source_id(),
            destination = %destination.describe(),
            target_count,
            "ingestion started"
        );

        let FetchReport {
            records,
            pages,
            stop,
            error: fetch_error,
            resume_cursor,
        } = self
            .fetcher
            .fetch(source, run_id, start_cursor.clone(), target_count)
            .await;
        let records_fetched = records.len();

        // Nothing fetched in this run is written, so a rerun starts where this one did.
        if stop == FetchStop::Cancelled {
            return Err(IngestError::Cancelled {
                rows_written: 0,
                resume_cursor: start_cursor,
            });
        }
        let fetch_error = match fetch_error {
            Some(source) if !self.write_partial_on_fetch_error || records.is_empty() => {
                return Err(IngestError::Fetch {
                    source,
                    records_fetched,
                    rows_written: 0,
                    resume_cursor: if records.is_empty() { resume_cursor } else { start_cursor },
                });
            }
            other => other,
        };

        if records.is_empty() {
            info!(%run_id, "zero rows ingested");
        }

        let (rows, schema) = normalize_records(&records);
        let outcome = match self.writer.write(run_id, destination, &rows, &schema).await {
            Ok(outcome) => outcome,
            // Batches need not line up with pages, so no cursor marks the cut.
            Err(WriteError::Cancelled { rows_written, .. }) => {
                return Err(IngestError::Cancelled {
                    rows_written,
                    resume_cursor: None,
                });
            }
            Err(err) => {
                if let Some(fetch_error) = &fetch_error {
                    warn!(
                        %run_id,
                        error = %fetch_error,
                        "fetch had already failed before the write error"
                    );
                }
                return Err(err.into());
            }
        };

        if let Some(source) = fetch_error {
            return Err(IngestError::Fetch {
                source,
                records_fetched,
                rows_written: outcome.rows_written,
                resume_cursor,
            });
        }

        let summary = IngestSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            pages_fetched: pages,
            records_fetched,
            rows_written: outcome.rows_written,
            batches_written: outcome.batches_written,
            header_written: outcome.header_written,
            columns: schema.columns().to_vec(),
            fetch_stop: stop,
            resume_cursor,
        };
        info!(
            %run_id,
            records = summary.records_fetched,
            rows_written = summary.rows_written,
            batches = summary.batches_written,
            "ingestion finished"
        );
        Ok(summary)
    }
}

/// Caller-facing entry point: opens the destination through the authenticator,
/// then runs the pipeline against the Graph lead listing.
pub struct Ingestor {
    config: IngestConfig,
    http: HttpFetcher,
    authenticator: Arc<dyn Authenticator>,
    pipeline: IngestionPipeline,
}

impl Ingestor {
    pub fn new(
        config: IngestConfig,
        http: HttpFetcher,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let pipeline = IngestionPipeline::from_config(&config);
        Self {
            config,
            http,
            authenticator,
            pipeline,
        }
    }

    /// Build the HTTP client and a bearer-token authenticator from `config`.
    /// An unusable credentials blob is an `IngestError::Authorization`.
    pub fn from_config(config: IngestConfig) -> Result<Self, IngestError> {
        config.validate()?;
        let http = HttpFetcher::new(config.http_config())?;
        let credentials = config.credentials_json.as_deref().unwrap_or_default();
        let authenticator = BearerTokenAuthenticator::from_credentials_json(
            &http,
            config.sheets_base_url.clone(),
            credentials,
        )?;
        Ok(Self::new(config, http, Arc::new(authenticator)))
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.pipeline = self.pipeline.with_cancel(cancel);
        self
    }

    pub fn with_progress<P>(mut self, progress: Arc<P>) -> Self
    where
        P: FetchProgress + WriteProgress + 'static,
    {
        self.pipeline = self.pipeline.with_progress(progress);
        self
    }

    pub async fn ingest(
        &self,
        session: &SessionHandle,
        target_id: &str,
        destination_key: &str,
        desired_count: usize,
    ) -> Result<IngestSummary, IngestError> {
        self.ingest_from(session, target_id, destination_key, desired_count, None)
            .await
    }

    pub async fn ingest_from(
        &self,
        session: &SessionHandle,
        target_id: &str,
        destination_key: &str,
        desired_count: usize,
        start_cursor: Option<Cursor>,
    ) -> Result<IngestSummary, IngestError> {
        let key = DestinationKey::new(destination_key, self.config.worksheet.clone());
        let destination = self.authenticator.open(&key).await?;
        let source = GraphLeadSource::new(
            self.http.clone(),
            session,
            &self.config.graph_base_url,
            &self.config.graph_api_version,
            target_id,
        )?;
        self.pipeline
            .run(&source, destination.as_ref(), start_cursor, desired_count)
            .await
    }

    /// Ingest with the session, ad and sheet named in the configuration.
    pub async fn ingest_configured(
        &self,
        desired_count: usize,
        start_cursor: Option<Cursor>,
    ) -> Result<IngestSummary, IngestError> {
        let session = SessionHandle::new(self.config.access_token.clone().unwrap_or_default());
        let target_id = self.config.target_id.as_deref().unwrap_or_default();
        let destination_key = self.config.destination_key.as_deref().unwrap_or_default();
        self.ingest_from(&session, target_id, destination_key, desired_count, start_cursor)
            .await
    }
}
