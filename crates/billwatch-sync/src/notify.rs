//! Operator notifications. Delivery is best effort: a failed send is logged
//! and never changes the outcome of a run.

use std::time::Duration;

use async_trait::async_trait;
use billwatch_storage::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Request(#[from] FetchError),
    #[error("notifier setup failed: {0}")]
    Setup(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &str) -> Result<(), NotifyError>;
}

/// Writes the message to the log only.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &str) -> Result<(), NotifyError> {
        info!(target: "billwatch::notify", "{message}");
        Ok(())
    }
}

/// POSTs `{"text": message}` to a chat webhook. Single attempt.
#[derive(Debug)]
pub struct WebhookNotifier {
    http: HttpFetcher,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout,
            user_agent: None,
            backoff: BackoffPolicy {
                max_retries: 0,
                ..BackoffPolicy::default()
            },
        })
        .map_err(|e| NotifyError::Setup(format!("{e:#}")))?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, message: &str) -> Result<(), NotifyError> {
        let body = json!({ "text": message });
        self.http
            .execute(&self.url, |client| client.post(&self.url).json(&body))
            .await?;
        Ok(())
    }
}

pub async fn notify_best_effort(notifier: &dyn Notifier, message: &str) {
    if let Err(err) = notifier.send(message).await {
        warn!(error = %err, "notification failed; run result unaffected");
    }
}
