//! Operational notifications and chat delivery.

use std::sync::Arc;

use async_trait::async_trait;
use cdash_storage::HttpFetcher;
use serde::Deserialize;
use tracing::info;

use crate::{trim_base, SourceError, SourceResult};

pub const SOURCE_ID: &str = "zulip";

/// Receiver of operational messages (quota skips, warehouse summaries).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> SourceResult<()>;
}

/// Notifier used when no chat credentials are configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str) -> SourceResult<()> {
        info!(target: "cdash::notify", "{message}");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ZulipResponse {
    result: String,
    #[serde(default)]
    msg: String,
    max_message_length: Option<usize>,
}

impl ZulipResponse {
    fn ensure_success(self) -> SourceResult<Self> {
        if self.result == "success" {
            Ok(self)
        } else {
            Err(SourceError::payload(SOURCE_ID, self.msg))
        }
    }
}

pub struct ZulipClient {
    http: Arc<HttpFetcher>,
    site: String,
    email: String,
    api_key: String,
    stream: String,
    topic: String,
}

impl ZulipClient {
    /// `stream` and `topic` are the destination of [`Notifier::notify`].
    pub fn new(
        http: Arc<HttpFetcher>,
        site: &str,
        email: impl Into<String>,
        api_key: impl Into<String>,
        stream: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            http,
            site: trim_base(site),
            email: email.into(),
            api_key: api_key.into(),
            stream: stream.into(),
            topic: topic.into(),
        }
    }

    async fn post_form(&self, endpoint: &str, form: &[(&str, &str)]) -> SourceResult<ZulipResponse> {
        let url = format!("{}/api/v1/{endpoint}", self.site);
        let resp = self
            .http
            .execute(SOURCE_ID, &url, |client| {
                client
                    .post(&url)
                    .basic_auth(&self.email, Some(&self.api_key))
                    .form(form)
            })
            .await?;
        resp.json::<ZulipResponse>()?.ensure_success()
    }

    /// Largest message the server accepts, in characters.
    pub async fn max_message_length(&self) -> SourceResult<usize> {
        let resp = self
            .post_form("register", &[("event_types", r#"["message","realm"]"#)])
            .await?;
        resp.max_message_length
            .ok_or_else(|| SourceError::payload(SOURCE_ID, "register response without max_message_length"))
    }

    pub async fn send_message(&self, stream: &str, topic: &str, content: &str) -> SourceResult<()> {
        self.post_form(
            "messages",
            &[("type", "stream"), ("to", stream), ("topic", topic), ("content", content)],
        )
        .await?;
        Ok(())
    }

    /// Sends `lines` as one or more messages, splitting at the server limit.
    pub async fn send_lines(&self, stream: &str, topic: &str, lines: &[String]) -> SourceResult<usize> {
        let max = self.max_message_length().await?;
        let parts = split_message(lines, max);
        for part in &parts {
            self.send_message(stream, topic, &part.join("\n")).await?;
        }
        Ok(parts.len())
    }
}

#[async_trait]
impl Notifier for ZulipClient {
    async fn notify(&self, message: &str) -> SourceResult<()> {
        self.send_message(&self.stream, &self.topic, message).await
    }
}

/// Groups lines into parts whose length, counting one newline per line, stays
/// within `max_length`. A single line longer than the limit gets its own part.
pub fn split_message(lines: &[String], max_length: usize) -> Vec<Vec<String>> {
    let mut parts: Vec<Vec<String>> = vec![Vec::new()];
    let mut count = 0usize;
    for line in lines {
        let line_length = line.chars().count() + 1;
        let current_is_empty = parts.last().map_or(true, Vec::is_empty);
        if count + line_length > max_length && !current_is_empty {
            parts.push(Vec::new());
            count = 0;
        }
        if let Some(part) = parts.last_mut() {
            part.push(line.clone());
        }
        count += line_length;
    }
    parts.retain(|part| !part.is_empty());
    parts
}
