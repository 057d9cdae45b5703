use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use leadsync_adapters::{PaginationConfig, DEFAULT_GRAPH_API_VERSION, DEFAULT_GRAPH_BASE_URL};
use leadsync_storage::HttpClientConfig;
use serde::Deserialize;

use crate::writer::WriterConfig;

pub const DEFAULT_WORKSHEET: &str = "resiliation";
pub const DEFAULT_SHEETS_BASE_URL: &str = "https://sheets.googleapis.com";

/// Run settings. Layered as defaults, then an optional YAML file, then the
/// process environment.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub access_token: Option<String>,
    pub target_id: Option<String>,
    pub destination_key: Option<String>,
    pub credentials_json: Option<String>,
    pub worksheet: String,
    pub graph_base_url: String,
    pub graph_api_version: String,
    pub sheets_base_url: String,
    pub page_delay_ms: u64,
    pub batch_delay_secs: u64,
    pub trailing_batch_delay: bool,
    pub write_partial_on_fetch_error: bool,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            access_token: None,
            target_id: None,
            destination_key: None,
            credentials_json: None,
            worksheet: DEFAULT_WORKSHEET.to_string(),
            graph_base_url: DEFAULT_GRAPH_BASE_URL.to_string(),
            graph_api_version: DEFAULT_GRAPH_API_VERSION.to_string(),
            sheets_base_url: DEFAULT_SHEETS_BASE_URL.to_string(),
            page_delay_ms: 1000,
            batch_delay_secs: 30,
            trailing_batch_delay: false,
            write_partial_on_fetch_error: true,
            http_timeout_secs: 20,
            user_agent: "leadsync/0.1".to_string(),
        }
    }
}

impl fmt::Debug for IngestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secret = |value: &Option<String>| value.as_ref().map(|_| "<redacted>");
        f.debug_struct("IngestConfig")
            .field("access_token", &secret(&self.access_token))
            .field("target_id", &self.target_id)
            .field("destination_key", &self.destination_key)
            .field("credentials_json", &secret(&self.credentials_json))
            .field("worksheet", &self.worksheet)
            .field("graph_base_url", &self.graph_base_url)
            .field("graph_api_version", &self.graph_api_version)
            .field("sheets_base_url", &self.sheets_base_url)
            .field("page_delay_ms", &self.page_delay_ms)
            .field("batch_delay_secs", &self.batch_delay_secs)
            .field("trailing_batch_delay", &self.trailing_batch_delay)
            .field("write_partial_on_fetch_error", &self.write_partial_on_fetch_error)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True" | "yes")
}

fn parse_number(name: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .with_context(|| format!("{name} must be a non-negative integer, got {value:?}"))
}

impl IngestConfig {
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        base.with_overrides(|name| std::env::var(name).ok())
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Apply overrides looked up by environment variable name.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = lookup("FACEBOOK_ACCESS_TOKEN") {
            self.access_token = Some(v);
        }
        if let Some(v) = lookup("FACEBOOK_AD_ID") {
            self.target_id = Some(v);
        }
        if let Some(v) = lookup("GOOGLE_SHEET_ID") {
            self.destination_key = Some(v);
        }
        if let Some(v) = lookup("GOOGLE_CREDENTIALS_JSON") {
            self.credentials_json = Some(v);
        }
        if let Some(v) = lookup("LEADSYNC_WORKSHEET") {
            self.worksheet = v;
        }
        if let Some(v) = lookup("LEADSYNC_GRAPH_BASE_URL") {
            self.graph_base_url = v;
        }
        if let Some(v) = lookup("LEADSYNC_GRAPH_API_VERSION") {
            self.graph_api_version = v;
        }
        if let Some(v) = lookup("LEADSYNC_SHEETS_BASE_URL") {
            self.sheets_base_url = v;
        }
        if let Some(v) = lookup("LEADSYNC_PAGE_DELAY_MS") {
            self.page_delay_ms = parse_number("LEADSYNC_PAGE_DELAY_MS", &v)?;
        }
        if let Some(v) = lookup("LEADSYNC_BATCH_DELAY_SECS") {
            self.batch_delay_secs = parse_number("LEADSYNC_BATCH_DELAY_SECS", &v)?;
        }
        if let Some(v) = lookup("LEADSYNC_TRAILING_BATCH_DELAY") {
            self.trailing_batch_delay = parse_flag(&v);
        }
        if let Some(v) = lookup("LEADSYNC_WRITE_PARTIAL") {
            self.write_partial_on_fetch_error = parse_flag(&v);
        }
        if let Some(v) = lookup("LEADSYNC_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = parse_number("LEADSYNC_HTTP_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("LEADSYNC_USER_AGENT") {
            self.user_agent = v;
        }
        Ok(self)
    }

    /// Fail listing every required setting that is missing or blank.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("FACEBOOK_ACCESS_TOKEN", &self.access_token),
            ("FACEBOOK_AD_ID", &self.target_id),
            ("GOOGLE_SHEET_ID", &self.destination_key),
            ("GOOGLE_CREDENTIALS_JSON", &self.credentials_json),
        ];
        let missing = required
            .iter()
            .filter(|(_, value)| value.as_deref().map_or(true, |v| v.trim().is_empty()))
            .map(|(name, _)| *name)
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            bail!("missing required settings: {}", missing.join(", "));
        }
        Ok(())
    }

    pub fn pagination_config(&self) -> PaginationConfig {
        PaginationConfig {
            page_delay: Duration::from_millis(self.page_delay_ms),
        }
    }

    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            batch_delay: Duration::from_secs(self.batch_delay_secs),
            trailing_batch_delay: self.trailing_batch_delay,
            ..WriterConfig::default()
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_source_and_sheet_quotas() {
        let config = IngestConfig::default();
        assert_eq!(config.worksheet, "resiliation");
        assert_eq!(config.graph_api_version, "v17.0");
        assert_eq!(config.pagination_config().page_delay, Duration::from_secs(1));
        let writer = config.writer_config();
        assert_eq!(writer.batch_size, 50);
        assert_eq!(writer.batch_delay, Duration::from_secs(30));
        assert!(!writer.trailing_batch_delay);
    }

    #[test]
    fn environment_overrides_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "target_id: from-file\nworksheet: leads\nbatch_delay_secs: 5\ntrailing_batch_delay: true"
        )
        .unwrap();

        let config = IngestConfig::from_yaml_file(file.path())
            .unwrap()
            .with_overrides(lookup(&[
                ("FACEBOOK_AD_ID", "from-env"),
                ("LEADSYNC_PAGE_DELAY_MS", "0"),
            ]))
            .unwrap();

        assert_eq!(config.target_id.as_deref(), Some("from-env"));
        assert_eq!(config.worksheet, "leads");
        assert_eq!(config.batch_delay_secs, 5);
        assert_eq!(config.page_delay_ms, 0);
        assert!(config.trailing_batch_delay);
        assert_eq!(config.graph_api_version, "v17.0");
    }

    #[test]
    fn invalid_number_is_reported() {
        let err = IngestConfig::default()
            .with_overrides(lookup(&[("LEADSYNC_BATCH_DELAY_SECS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("LEADSYNC_BATCH_DELAY_SECS"));
    }

    #[test]
    fn validate_lists_every_missing_setting() {
        let err = IngestConfig::default()
            .with_overrides(lookup(&[("FACEBOOK_ACCESS_TOKEN", "tok"), ("GOOGLE_SHEET_ID", " ")]))
            .unwrap()
            .validate()
            .unwrap_err()
            .to_string();
        assert!(err.contains("FACEBOOK_AD_ID"));
        assert!(err.contains("GOOGLE_SHEET_ID"));
        assert!(err.contains("GOOGLE_CREDENTIALS_JSON"));
        assert!(!err.contains("FACEBOOK_ACCESS_TOKEN"));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let config = IngestConfig::default()
            .with_overrides(lookup(&[
                ("FACEBOOK_ACCESS_TOKEN", "very-secret"),
                ("GOOGLE_CREDENTIALS_JSON", "{\"access_token\":\"also-secret\"}"),
            ]))
            .unwrap();
        let text = format!("{config:?}");
        assert!(!text.contains("very-secret"));
        assert!(!text.contains("also-secret"));
    }
}
