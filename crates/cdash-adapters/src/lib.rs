//! Connectors for every external service the dashboard pulls from or pushes to.
//!
//! Each connector owns a shared [`HttpFetcher`] handle and a base URL so tests can
//! point it at a mock server. The sync engine only talks to the seams defined
//! here: [`CodeHost`], [`Warehouse`] and [`Notifier`].

pub mod chat;
pub mod drive;
pub mod forum;
pub mod github;
pub mod packages;
pub mod warehouse;

use cdash_storage::FetchError;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;

pub use chat::{split_message, LogNotifier, Notifier, ZulipClient};
pub use drive::{DriveClient, DriveFile};
pub use forum::{ForumClient, ForumPage, ForumTopic, ForumUser};
pub use github::{CodeHost, GithubClient};
pub use packages::{CondaClient, PepyClient, PluginRegistryClient, PypiJsonClient, PypiStatsClient};
pub use warehouse::{BigQueryClient, QueryOutcome, Warehouse, WarehouseRow};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected payload from {source_id}: {message}")]
    Payload { source_id: &'static str, message: String },
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl SourceError {
    pub fn payload(source_id: &'static str, message: impl Into<String>) -> Self {
        Self::Payload {
            source_id,
            message: message.into(),
        }
    }

    /// HTTP status of the failed request, if the failure came from one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Fetch(err) => err.status(),
            _ => None,
        }
    }
}

pub type SourceResult<T> = Result<T, SourceError>;

pub(crate) fn header_map(pairs: &[(&'static str, &str)]) -> SourceResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        let value = HeaderValue::from_str(value)
            .map_err(|err| SourceError::Message(format!("invalid header {name}: {err}")))?;
        headers.insert(HeaderName::from_static(name), value);
    }
    Ok(headers)
}

pub(crate) fn trim_base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use cdash_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};

    pub fn fetcher() -> Arc<HttpFetcher> {
        Arc::new(
            HttpFetcher::new(HttpClientConfig {
                backoff: BackoffPolicy::fixed(2, Duration::from_millis(5)),
                ..Default::default()
            })
            .unwrap(),
        )
    }
}
