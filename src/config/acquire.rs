//! Configuration acquisition
//!
//! The node cannot do anything useful without a configuration, so the
//! acquirer blocks until a source hands back a well-formed document.

use super::Configuration;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{error, info, warn};

/// Fixed backoff between fetch attempts
pub const FETCH_BACKOFF: Duration = Duration::from_secs(5);

/// Result of a single fetch attempt
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// A validated configuration
    Ready(Configuration),
    /// The store exists but its content is absent or malformed
    NotReady(String),
    /// Anything else went wrong (transport, auth, ...)
    Fatal(String),
}

/// Trait for remote configuration stores
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Name of this source, for logging
    fn name(&self) -> &'static str;

    /// Attempt one fetch. Never panics, never retries on its own.
    async fn fetch(&self) -> FetchOutcome;
}

/// Blocking fetch loop over a [`ConfigSource`]
pub struct ConfigAcquirer {
    backoff: Duration,
}

impl ConfigAcquirer {
    pub fn new() -> Self {
        Self {
            backoff: FETCH_BACKOFF,
        }
    }

    /// Override the retry backoff
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Fetch until a configuration is available.
    ///
    /// There is no give-up path: not-ready and unexpected failures are both
    /// logged and retried after the same backoff. Only process termination
    /// stops the loop.
    pub async fn acquire(&self, source: &dyn ConfigSource) -> Configuration {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match source.fetch().await {
                FetchOutcome::Ready(config) => {
                    info!(
                        "Config fetched from {} after {} attempt(s)",
                        source.name(),
                        attempts
                    );
                    return config;
                }
                FetchOutcome::NotReady(reason) => {
                    warn!(
                        "config is not ready yet: {}, sleeping for {}s",
                        reason,
                        self.backoff.as_secs()
                    );
                }
                FetchOutcome::Fatal(reason) => {
                    error!(
                        "unexpected error while fetching config from {}: {}, sleeping for {}s",
                        source.name(),
                        reason,
                        self.backoff.as_secs()
                    );
                }
            }
            tokio::time::sleep(self.backoff).await;
        }
    }
}

impl Default for ConfigAcquirer {
    fn default() -> Self {
        Self::new()
    }
}

/// Classify a raw document: parse, then validate
pub fn classify_document(raw: &str) -> FetchOutcome {
    match Configuration::from_yaml(raw) {
        Ok(config) => match config.validate() {
            Ok(()) => FetchOutcome::Ready(config),
            Err(e) => FetchOutcome::NotReady(e.to_string()),
        },
        Err(e) => FetchOutcome::NotReady(format!("malformed config.yaml: {}", e)),
    }
}
