use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use leadsync_adapters::{FetchProgress, GraphLeadSource, SessionHandle};
use leadsync_core::Cursor;
use leadsync_storage::{HttpFetcher, MemoryDestination};
use leadsync_sync::{
    IngestConfig, IngestError, IngestSummary, IngestionPipeline, Ingestor, WriteProgress,
    WriterConfig,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "leadsync")]
#[command(about = "Copy ad leads into a spreadsheet worksheet")]
struct Cli {
    /// YAML settings file; environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch leads and append them to the configured worksheet.
    Ingest {
        #[arg(long)]
        count: usize,
        /// Resume from a cursor printed by an earlier run.
        #[arg(long)]
        start_cursor: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Fetch and normalize leads without touching the worksheet.
    Preview {
        #[arg(long)]
        count: usize,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => bail!("invalid log format: {s}"),
        }
    }
}

fn init_logging(format: Option<LogFormat>) -> Result<()> {
    let format = match format {
        Some(format) => format,
        None => match std::env::var("LEADSYNC_LOG_FORMAT") {
            Ok(value) => value.parse()?,
            Err(_) => LogFormat::Text,
        },
    };
    let directives = std::env::var("LEADSYNC_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(&directives)
        .with_context(|| format!("invalid log filter {directives:?}"))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|err| anyhow::anyhow!("initializing logging: {err}"))
}

/// Prints the running insert total to stderr after each batch.
struct ConsoleProgress;

impl FetchProgress for ConsoleProgress {}

impl WriteProgress for ConsoleProgress {
    fn on_batch(&self, _batch_index: usize, rows_so_far: usize) {
        eprintln!("{rows_so_far} leads inserted");
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current request");
            token.cancel();
        }
    });
    cancel
}

/// Rerun hint for `cursor`, without the access token it may embed.
fn resume_hint(cursor: &Cursor) -> String {
    format!("resume with --start-cursor '{}'", cursor.resumable())
}

fn print_summary(summary: &IngestSummary, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        println!(
            "ingest complete: run_id={} pages={} records={} rows_written={} batches={} header_written={}",
            summary.run_id,
            summary.pages_fetched,
            summary.records_fetched,
            summary.rows_written,
            summary.batches_written,
            summary.header_written
        );
    }
    if let Some(cursor) = &summary.resume_cursor {
        eprintln!("more leads available; {}", resume_hint(cursor));
    }
    Ok(())
}

async fn ingest(
    config: IngestConfig,
    count: usize,
    start_cursor: Option<String>,
    as_json: bool,
) -> Result<()> {
    let ingestor = Ingestor::from_config(config)?
        .with_cancel(cancel_on_ctrl_c())
        .with_progress(Arc::new(ConsoleProgress));

    match ingestor
        .ingest_configured(count, start_cursor.map(Cursor::new))
        .await
    {
        Ok(summary) => print_summary(&summary, as_json),
        Err(err) => {
            if let IngestError::Fetch { .. }
            | IngestError::Write(_)
            | IngestError::Cancelled { .. } = &err
            {
                eprintln!("{} leads inserted before the run stopped", err.rows_written());
            }
            if let Some(cursor) = err.resume_cursor() {
                eprintln!("{}", resume_hint(cursor));
            }
            error!(error = %err, "ingestion failed");
            Err(err.into())
        }
    }
}

async fn preview(config: IngestConfig, count: usize, as_json: bool) -> Result<()> {
    let access_token = config
        .access_token
        .clone()
        .filter(|token| !token.trim().is_empty())
        .context("FACEBOOK_ACCESS_TOKEN is required")?;
    let target_id = config
        .target_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .context("FACEBOOK_AD_ID is required")?;

    let http = HttpFetcher::new(config.http_config())?;
    let source = GraphLeadSource::new(
        http,
        &SessionHandle::new(access_token),
        &config.graph_base_url,
        &config.graph_api_version,
        target_id,
    )?;
    let pipeline = IngestionPipeline::new(
        config.pagination_config(),
        WriterConfig {
            batch_delay: Duration::ZERO,
            ..WriterConfig::default()
        },
    )
    .with_cancel(cancel_on_ctrl_c());
    let destination = MemoryDestination::new("preview");

    let summary = pipeline.run(&source, &destination, None, count).await?;
    let columns = destination.header().await.unwrap_or_default();
    let rows = destination.rows().await;

    if as_json {
        let body = json!({
            "columns": columns,
            "rows": rows,
            "records_fetched": summary.records_fetched,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        println!("{}", columns.join("\t"));
        for row in rows {
            println!("{}", row.join("\t"));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format)?;
    let config = IngestConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Ingest {
            count,
            start_cursor,
            json,
        } => ingest(config, count, start_cursor, json).await,
        Commands::Preview { count, json } => preview(config, count, json).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ingest_with_global_flags() {
        let cli = Cli::try_parse_from([
            "leadsync",
            "ingest",
            "--count",
            "120",
            "--log-format",
            "json",
            "--config",
            "leadsync.yaml",
        ])
        .unwrap();

        assert_eq!(cli.log_format, Some(LogFormat::Json));
        assert_eq!(cli.config, Some(PathBuf::from("leadsync.yaml")));
        match cli.command {
            Commands::Ingest {
                count,
                start_cursor,
                json,
            } => {
                assert_eq!(count, 120);
                assert!(start_cursor.is_none());
                assert!(!json);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_negative_count() {
        assert!(Cli::try_parse_from(["leadsync", "preview", "--count", "-3"]).is_err());
    }

    #[test]
    fn resume_hint_round_trips_through_start_cursor() {
        let cursor =
            Cursor::new("https://graph.facebook.com/v17.0/ad/leads?access_token=tok&after=c1");
        let hint = resume_hint(&cursor);
        assert!(!hint.contains("access_token"));

        let printed = hint
            .trim_start_matches("resume with --start-cursor '")
            .trim_end_matches('\'');
        let cli = Cli::try_parse_from([
            "leadsync",
            "ingest",
            "--count",
            "5",
            "--start-cursor",
            printed,
        ])
        .unwrap();
        match cli.command {
            Commands::Ingest { start_cursor, .. } => assert_eq!(
                start_cursor.as_deref(),
                Some("https://graph.facebook.com/v17.0/ad/leads?after=c1")
            ),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn log_format_parses_case_insensitively() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
