use std::sync::Arc;
use std::time::Duration;

use leadsync_adapters::NoopProgress;
use leadsync_core::{NormalizedRow, SchemaAccumulator};
use leadsync_storage::{pace, Destination, DestinationError};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

/// Rows per append call; the unit of write-quota accounting.
pub const BATCH_SIZE: usize = 50;

/// Row count a destination reports while it has no header yet.
pub const HEADERLESS_ROW_COUNT: u64 = 1;

#[derive(Debug, Clone, Copy)]
pub struct WriterConfig {
    pub batch_size: usize,
    /// Pause between consecutive batches.
    pub batch_delay: Duration,
    /// Also pause after the final batch.
    pub trailing_batch_delay: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: BATCH_SIZE,
            batch_delay: Duration::from_secs(30),
            trailing_batch_delay: false,
        }
    }
}

pub trait WriteProgress: Send + Sync {
    fn on_batch(&self, _batch_index: usize, _rows_so_far: usize) {}
}

impl WriteProgress for NoopProgress {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    pub rows_written: usize,
    pub batches_written: usize,
    pub header_written: bool,
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("reading row count of {destination}: {source}")]
    RowCount {
        destination: String,
        source: DestinationError,
    },
    #[error("writing header row to {destination}: {source}")]
    Header {
        destination: String,
        source: DestinationError,
    },
    /// `batch_index` is the zero-based batch that failed; every batch before it
    /// is committed, so a rerun can resume from it.
    #[error(
        "batch {batch_index} to {destination} failed with {rows_written} rows already committed: {source}"
    )]
    Batch {
        destination: String,
        batch_index: usize,
        rows_written: usize,
        header_written: bool,
        source: DestinationError,
    },
    #[error("write cancelled before batch {batch_index} with {rows_written} rows committed")]
    Cancelled {
        batch_index: usize,
        rows_written: usize,
        header_written: bool,
    },
}

impl WriteError {
    pub fn committed_batches(&self) -> usize {
        match self {
            WriteError::RowCount { .. } | WriteError::Header { .. } => 0,
            WriteError::Batch { batch_index, .. }
            | WriteError::Cancelled { batch_index, .. } => *batch_index,
        }
    }

    pub fn rows_written(&self) -> usize {
        match self {
            WriteError::RowCount { .. } | WriteError::Header { .. } => 0,
            WriteError::Batch { rows_written, .. }
            | WriteError::Cancelled { rows_written, .. } => *rows_written,
        }
    }
}

/// Appends rows in fixed-size batches, pausing between batches to stay under
/// the destination's write quota.
pub struct QuotaAwareWriter {
    config: WriterConfig,
    cancel: CancellationToken,
    progress: Arc<dyn WriteProgress>,
}

impl QuotaAwareWriter {
    pub fn new(config: WriterConfig) -> Self {
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

    pub fn with_progress(mut self, progress: Arc<dyn WriteProgress>) -> Self {
        self.progress = progress;
        self
    }

    /// Rows are padded against `schema` as it stands at each batch, never
    /// before. Batches already appended stay appended when a later one fails.
    pub async fn write(
        &self,
        run_id: Uuid,
        destination: &dyn Destination,
        rows: &[NormalizedRow],
        schema: &SchemaAccumulator,
    ) -> Result<WriteOutcome, WriteError> {
        let destination_name = destination.describe();
        let mut outcome = WriteOutcome::default();

        if rows.is_empty() {
            info!(%run_id, destination = %destination_name, "nothing to insert");
            return Ok(outcome);
        }

        if self.cancel.is_cancelled() {
            return Err(self.cancelled(0, &outcome));
        }

        let existing_rows = destination
            .row_count()
            .await
            .map_err(|source| WriteError::RowCount {
                destination: destination_name.clone(),
                source,
            })?;
        if existing_rows == HEADERLESS_ROW_COUNT {
            destination
                .append_header(schema.columns())
                .await
                .map_err(|source| WriteError::Header {
                    destination: destination_name.clone(),
                    source,
                })?;
            outcome.header_written = true;
            info!(
                %run_id,
                destination = %destination_name,
                columns = schema.len(),
                "header row written"
            );
        }

        let batch_size = self.config.batch_size.max(1);
        let batch_total = rows.len().div_ceil(batch_size);

        for (batch_index, batch) in rows.chunks(batch_size).enumerate() {
            if batch_index > 0 && !pace(self.config.batch_delay, &self.cancel).await {
                return Err(self.cancelled(batch_index, &outcome));
            }

            let padded = batch.iter().map(|row| schema.pad(row)).collect::<Vec<_>>();
            if let Err(source) = destination.append_rows(&padded).await {
                error!(
                    %run_id,
                    destination = %destination_name,
                    batch = batch_index,
                    rows_written = outcome.rows_written,
                    error = %source,
                    "batch append failed"
                );
                return Err(WriteError::Batch {
                    destination: destination_name,
                    batch_index,
                    rows_written: outcome.rows_written,
                    header_written: outcome.header_written,
                    source,
                });
            }

            outcome.rows_written += batch.len();
            outcome.batches_written += 1;
            self.progress.on_batch(batch_index, outcome.rows_written);
            info!(
                %run_id,
                destination = %destination_name,
                batch = batch_index + 1,
                of = batch_total,
                rows_written = outcome.rows_written,
                "rows inserted"
            );
        }

        if self.config.trailing_batch_delay {
            pace(self.config.batch_delay, &self.cancel).await;
        }

        Ok(outcome)
    }

    fn cancelled(&self, batch_index: usize, outcome: &WriteOutcome) -> WriteError {
        WriteError::Cancelled {
            batch_index,
            rows_written: outcome.rows_written,
            header_written: outcome.header_written,
        }
    }
}
