//! Run configuration: optional YAML file, then environment overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use billwatch_core::IdFormat;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_CONFIG_FILE: &str = "billwatch.yaml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub chamber: String,
    /// Overrides the adapter's listing URL.
    pub listing_url: Option<String>,
    /// Read a saved listing instead of fetching one.
    pub listing_file: Option<PathBuf>,
    pub spreadsheet_id: String,
    pub worksheet: String,
    pub sheets_api_base: String,
    #[serde(skip_serializing)]
    pub sheets_access_token: Option<String>,
    /// Service account key JSON, inline. Used when no access token is set.
    #[serde(skip_serializing)]
    pub gcp_credentials: Option<String>,
    /// Service account key file, read when `gcp_credentials` is unset.
    pub gcp_credentials_file: Option<PathBuf>,
    /// Use a JSON file as the sheet instead of the Sheets API.
    pub local_store: Option<PathBuf>,
    pub id_format: IdFormat,
    pub id_prefix: String,
    pub notify_webhook_url: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Write `<run_id>/run.json` here after each run. Off unless set.
    pub reports_dir: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chamber: "diputados".to_string(),
            listing_url: None,
            listing_file: None,
            spreadsheet_id: String::new(),
            worksheet: "Proyectos".to_string(),
            sheets_api_base: "https://sheets.googleapis.com".to_string(),
            sheets_access_token: None,
            gcp_credentials: None,
            gcp_credentials_file: None,
            local_store: None,
            id_format: IdFormat::Prefixed,
            id_prefix: "DIP-".to_string(),
            notify_webhook_url: None,
            user_agent: "billwatch/0.1".to_string(),
            http_timeout_secs: 30,
            reports_dir: None,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl SyncConfig {
    /// Load `path`, else `$BILLWATCH_CONFIG`, else `./billwatch.yaml` when present,
    /// then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| non_empty(std::env::var("BILLWATCH_CONFIG").ok()).map(PathBuf::from));
        let mut config = match explicit {
            Some(path) => Self::from_yaml_file(&path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_yaml_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Service account key JSON from `gcp_credentials`, else from
    /// `gcp_credentials_file`.
    pub fn service_account_json(&self) -> Result<Option<String>> {
        if let Some(json) = &self.gcp_credentials {
            return Ok(Some(json.clone()));
        }
        match &self.gcp_credentials_file {
            Some(path) => std::fs::read_to_string(path)
                .map(Some)
                .with_context(|| format!("reading credentials {}", path.display())),
            None => Ok(None),
        }
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| non_empty(lookup(key));

        if let Some(v) = get("BILLWATCH_CHAMBER") {
            self.chamber = v;
        }
        if let Some(v) = get("BILLWATCH_LISTING_URL") {
            self.listing_url = Some(v);
        }
        if let Some(v) = get("BILLWATCH_LISTING_FILE") {
            self.listing_file = Some(PathBuf::from(v));
        }
        if let Some(v) = get("BILLWATCH_SPREADSHEET_ID") {
            self.spreadsheet_id = v;
        }
        if let Some(v) = get("BILLWATCH_WORKSHEET") {
            self.worksheet = v;
        }
        if let Some(v) = get("SHEETS_API_BASE") {
            self.sheets_api_base = v;
        }
        if let Some(v) = get("SHEETS_ACCESS_TOKEN") {
            self.sheets_access_token = Some(v);
        }
        if let Some(v) = get("GCP_CREDENTIALS") {
            self.gcp_credentials = Some(v);
        }
        if let Some(v) = get("GCP_CREDENTIALS_FILE") {
            self.gcp_credentials_file = Some(PathBuf::from(v));
        }
        if let Some(v) = get("BILLWATCH_LOCAL_STORE") {
            self.local_store = Some(PathBuf::from(v));
        }
        if let Some(v) = get("BILLWATCH_ID_FORMAT") {
            match v.to_ascii_lowercase().as_str() {
                "plain" => self.id_format = IdFormat::Plain,
                "prefixed" => self.id_format = IdFormat::Prefixed,
                other => warn!(value = other, "ignoring unknown BILLWATCH_ID_FORMAT"),
            }
        }
        if let Some(v) = lookup("BILLWATCH_ID_PREFIX") {
            self.id_prefix = v.trim().to_string();
        }
        if let Some(v) = get("BILLWATCH_NOTIFY_WEBHOOK") {
            self.notify_webhook_url = Some(v);
        }
        if let Some(v) = get("BILLWATCH_USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = get("BILLWATCH_HTTP_TIMEOUT_SECS") {
            match v.parse() {
                Ok(secs) => self.http_timeout_secs = secs,
                Err(_) => warn!(value = %v, "ignoring non-numeric BILLWATCH_HTTP_TIMEOUT_SECS"),
            }
        }
        if let Some(v) = get("REPORTS_DIR") {
            self.reports_dir = Some(PathBuf::from(v));
        }
    }
}
