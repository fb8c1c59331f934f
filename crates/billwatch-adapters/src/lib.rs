//! Chamber listing adapters: page acquisition + record extraction.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use billwatch_core::ScrapedRecord;
use billwatch_storage::{FetchError, HttpFetcher};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

mod diputados;

pub use diputados::{DiputadosAdapter, ExtractedFields, DIPUTADOS_LISTING_URL};

pub const CRATE_NAME: &str = "billwatch-adapters";

/// Raw listing page as handed to the extractor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedPage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn extension(&self) -> &'static str {
        match self.content_type.split(';').next().map(str::trim) {
            Some("text/html") => "html",
            Some("application/json") => "json",
            _ => "bin",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingTarget {
    pub url: String,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("fetching listing: {0}")]
    Fetch(#[from] FetchError),
    #[error("reading listing snapshot {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait ChamberAdapter: Send + Sync {
    /// Registry key, e.g. `diputados`.
    fn chamber(&self) -> &'static str;

    /// Value written to the origin chamber column.
    fn origin_label(&self) -> &'static str;

    fn default_listing_url(&self) -> &'static str;

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        target: &ListingTarget,
    ) -> Result<FetchedPage, AdapterError>;

    /// Extract one record per project block, in page order. A page whose
    /// shape is not recognised yields an empty list, not an error.
    fn parse_listing(&self, page: &FetchedPage) -> Result<Vec<ScrapedRecord>, AdapterError>;
}

/// Load a listing saved to disk (e.g. a rendered page dumped by a headless browser).
pub fn load_listing_file(path: impl AsRef<Path>) -> Result<FetchedPage, AdapterError> {
    let path = path.as_ref();
    let body = fs::read(path).map_err(|source| AdapterError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let content_type = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => "application/json",
        _ => "text/html",
    };
    info!(path = %path.display(), bytes = body.len(), "loaded listing snapshot");
    Ok(FetchedPage {
        url: format!("file://{}", path.display()),
        content_type: content_type.to_string(),
        body,
        fetched_at: Utc::now(),
    })
}

pub fn diputados_adapter() -> impl ChamberAdapter {
    DiputadosAdapter
}

pub fn adapter_for_chamber(chamber: &str) -> Option<Box<dyn ChamberAdapter>> {
    match chamber.trim().to_ascii_lowercase().as_str() {
        "diputados" => Some(Box::new(DiputadosAdapter)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_known_chambers_only() {
        let adapter = adapter_for_chamber(" Diputados ").expect("diputados adapter");
        assert_eq!(adapter.chamber(), "diputados");
        assert_eq!(adapter.origin_label(), "Diputados");
        assert!(adapter_for_chamber("senado").is_none());
    }

    #[test]
    fn page_extension_follows_content_type() {
        let page = FetchedPage {
            url: "https://example.test".into(),
            content_type: "text/html; charset=utf-8".into(),
            body: Vec::new(),
            fetched_at: Utc::now(),
        };
        assert_eq!(page.extension(), "html");
    }

    #[test]
    fn missing_snapshot_file_is_an_io_error() {
        let err = load_listing_file("/definitely/not/here.html").unwrap_err();
        assert!(matches!(err, AdapterError::Io { .. }));
    }
}
