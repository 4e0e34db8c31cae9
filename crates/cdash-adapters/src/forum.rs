//! Discourse forum connector for the `latest.json` topic listing.

use std::sync::Arc;

use cdash_storage::HttpFetcher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{header_map, SourceResult};

pub const SOURCE_ID: &str = "forum";
pub const DEFAULT_LATEST_URL: &str = "https://forum.image.sc/tag/napari/l/latest.json";

// The forum rejects requests without a browser-like agent.
const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 6.1; WOW64; rv:20.0) Gecko/20100101 Firefox/20.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForumUser {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Tags are plain strings on older forum versions and objects on newer ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ForumTagRef {
    Name(String),
    Object { name: String },
}

impl ForumTagRef {
    pub fn name(&self) -> &str {
        match self {
            Self::Name(name) | Self::Object { name } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForumPoster {
    pub user_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForumTopic {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub fancy_title: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_posted_at: Option<DateTime<Utc>>,
    pub posts_count: i64,
    #[serde(default)]
    pub tags: Vec<ForumTagRef>,
    #[serde(default)]
    pub posters: Vec<ForumPoster>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForumPage {
    pub users: Vec<ForumUser>,
    pub topics: Vec<ForumTopic>,
}

#[derive(Debug, Deserialize)]
struct TopicList {
    #[serde(default)]
    topics: Vec<ForumTopic>,
}

#[derive(Debug, Deserialize)]
struct LatestResponse {
    #[serde(default)]
    users: Vec<ForumUser>,
    topic_list: TopicList,
}

pub struct ForumClient {
    http: Arc<HttpFetcher>,
    latest_url: String,
}

impl ForumClient {
    pub fn new(http: Arc<HttpFetcher>, latest_url: &str) -> Self {
        Self {
            http,
            latest_url: latest_url.to_string(),
        }
    }

    /// One page of the latest-topics listing. Pages start at 1; an empty topic
    /// list marks the end.
    pub async fn latest_page(&self, page: u32) -> SourceResult<ForumPage> {
        let url = format!("{}?page={page}", self.latest_url);
        let headers = header_map(&[("user-agent", BROWSER_USER_AGENT)])?;
        let resp = self.http.get(SOURCE_ID, &url, &headers).await?;
        let latest: LatestResponse = resp.json()?;
        Ok(ForumPage {
            users: latest.users,
            topics: latest.topic_list.topics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fetcher;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn tags_accept_both_shapes() {
        let tags: Vec<ForumTagRef> =
            serde_json::from_value(json!(["napari", {"id": 3, "name": "plugin", "slug": "plugin"}])).unwrap();
        let names: Vec<_> = tags.iter().map(ForumTagRef::name).collect();
        assert_eq!(names, vec!["napari", "plugin"]);
    }

    #[tokio::test]
    async fn latest_page_parses_users_and_topics() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tag/napari/l/latest.json"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "users": [{"id": 1, "username": "alice", "name": "Alice"}],
                "topic_list": {"topics": [{
                    "id": 10, "title": "Help", "fancy_title": "Help", "slug": "help",
                    "created_at": "2024-03-01T10:00:00.000Z",
                    "last_posted_at": "2024-03-02T10:00:00.000Z",
                    "posts_count": 4, "tags": ["napari"],
                    "posters": [{"user_id": 1, "description": "Original Poster"}]
                }]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tag/napari/l/latest.json"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "users": [], "topic_list": {"topics": []}
            })))
            .mount(&server)
            .await;

        let client = ForumClient::new(fetcher(), &format!("{}/tag/napari/l/latest.json", server.uri()));
        let first = client.latest_page(1).await.unwrap();
        assert_eq!(first.users[0].username, "alice");
        assert_eq!(first.topics[0].posts_count, 4);
        assert_eq!(first.topics[0].posters[0].user_id, 1);
        assert!(client.latest_page(2).await.unwrap().topics.is_empty());
    }
}
