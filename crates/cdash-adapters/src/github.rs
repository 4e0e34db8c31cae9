use std::sync::Arc;

use async_trait::async_trait;
use cdash_core::{RepoRef, GHOST_USER};
use cdash_storage::HttpFetcher;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{header_map, trim_base, SourceResult};

pub const SOURCE_ID: &str = "github";
pub const DEFAULT_API_URL: &str = "https://api.github.com";
pub const PER_PAGE: u32 = 100;

const API_VERSION: &str = "2022-11-28";
const JSON_MEDIA_TYPE: &str = "application/vnd.github+json";
const STAR_MEDIA_TYPE: &str = "application/vnd.github.star+json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteUser {
    pub login: String,
}

/// Login of an optional account, mapping deleted accounts to the ghost user.
pub fn login_or_ghost(user: &Option<RemoteUser>) -> String {
    user.as_ref()
        .map(|u| u.login.clone())
        .unwrap_or_else(|| GHOST_USER.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRepository {
    pub full_name: String,
    pub stargazers_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stargazer {
    pub starred_at: DateTime<Utc>,
    pub user: Option<RemoteUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteLabel {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemotePullRequest {
    pub number: i64,
    pub user: Option<RemoteUser>,
    pub title: String,
    pub body: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: Vec<RemoteLabel>,
}

#[derive(Debug, Clone, Deserialize)]
struct PullRequestDetail {
    commits: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitSignature {
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitDetail {
    pub author: Option<GitSignature>,
    pub committer: Option<GitSignature>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteCommit {
    pub sha: String,
    pub author: Option<RemoteUser>,
    pub commit: CommitDetail,
}

impl RemoteCommit {
    pub fn authored_at(&self) -> Option<DateTime<Utc>> {
        self.commit
            .author
            .as_ref()
            .or(self.commit.committer.as_ref())
            .map(|sig| sig.date)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteReview {
    pub id: i64,
    pub user: Option<RemoteUser>,
    pub state: String,
    pub submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteComment {
    pub id: i64,
    pub user: Option<RemoteUser>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteIssue {
    pub number: i64,
    pub user: Option<RemoteUser>,
    pub title: String,
    pub body: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: Vec<RemoteLabel>,
    /// Present when the issue is actually a pull request.
    #[serde(default)]
    pub pull_request: Option<serde_json::Value>,
}

impl RemoteIssue {
    pub fn is_pull_request(&self) -> bool {
        self.pull_request.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteAsset {
    pub name: String,
    pub download_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRelease {
    pub tag_name: String,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub assets: Vec<RemoteAsset>,
}

/// Read access to a code-hosting API. Listing calls are page based (1-indexed,
/// [`PER_PAGE`] items) so callers control pagination and can report progress.
#[async_trait]
pub trait CodeHost: Send + Sync {
    async fn repository(&self, repo: &RepoRef) -> SourceResult<RemoteRepository>;

    async fn stargazers_page(&self, repo: &RepoRef, page: u32) -> SourceResult<Vec<Stargazer>>;

    async fn pull_requests_page(&self, repo: &RepoRef, page: u32) -> SourceResult<Vec<RemotePullRequest>>;

    /// Number of commits on a pull request, from its detail endpoint.
    async fn pull_request_commit_count(&self, repo: &RepoRef, number: i64) -> SourceResult<u64>;

    async fn pull_request_commits_page(
        &self,
        repo: &RepoRef,
        number: i64,
        page: u32,
    ) -> SourceResult<Vec<RemoteCommit>>;

    async fn pull_request_reviews(&self, repo: &RepoRef, number: i64) -> SourceResult<Vec<RemoteReview>>;

    async fn pull_request_comments(&self, repo: &RepoRef, number: i64) -> SourceResult<Vec<RemoteComment>>;

    async fn issues_page(&self, repo: &RepoRef, page: u32) -> SourceResult<Vec<RemoteIssue>>;

    async fn issue_comments(&self, repo: &RepoRef, number: i64) -> SourceResult<Vec<RemoteComment>>;

    async fn releases_page(&self, repo: &RepoRef, page: u32) -> SourceResult<Vec<RemoteRelease>>;
}

/// Number of commit pages needed for `count` commits.
pub fn commit_pages(count: u64) -> u32 {
    count.div_ceil(u64::from(PER_PAGE)) as u32
}

pub struct GithubClient {
    http: Arc<HttpFetcher>,
    base_url: String,
    token: Option<String>,
}

impl GithubClient {
    pub fn new(http: Arc<HttpFetcher>, token: Option<String>) -> Self {
        Self::with_base_url(http, DEFAULT_API_URL, token)
    }

    pub fn with_base_url(http: Arc<HttpFetcher>, base_url: &str, token: Option<String>) -> Self {
        Self {
            http,
            base_url: trim_base(base_url),
            token,
        }
    }

    fn headers(&self, accept: &str) -> SourceResult<HeaderMap> {
        let auth = self.token.as_ref().map(|t| format!("Bearer {t}"));
        let mut pairs = vec![("accept", accept), ("x-github-api-version", API_VERSION)];
        if let Some(auth) = auth.as_deref() {
            pairs.push(("authorization", auth));
        }
        header_map(&pairs)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, accept: &str) -> SourceResult<T> {
        let url = format!("{}/{}", self.base_url, path);
        let resp = self.http.get(SOURCE_ID, &url, &self.headers(accept)?).await?;
        Ok(resp.json()?)
    }

    /// Collects every page of a listing endpoint until a short page is returned.
    async fn get_all_pages<T: DeserializeOwned>(&self, path: &str) -> SourceResult<Vec<T>> {
        let mut out = Vec::new();
        let mut page = 1;
        loop {
            let items: Vec<T> = self
                .get_json(&paged(path, page), JSON_MEDIA_TYPE)
                .await?;
            let len = items.len();
            out.extend(items);
            if len < PER_PAGE as usize {
                return Ok(out);
            }
            page += 1;
        }
    }
}

fn paged(path: &str, page: u32) -> String {
    let sep = if path.contains('?') { '&' } else { '?' };
    format!("{path}{sep}per_page={PER_PAGE}&page={page}")
}

fn repo_path(repo: &RepoRef) -> String {
    format!("repos/{}/{}", repo.owner, repo.name)
}

#[async_trait]
impl CodeHost for GithubClient {
    async fn repository(&self, repo: &RepoRef) -> SourceResult<RemoteRepository> {
        self.get_json(&repo_path(repo), JSON_MEDIA_TYPE).await
    }

    async fn stargazers_page(&self, repo: &RepoRef, page: u32) -> SourceResult<Vec<Stargazer>> {
        let path = paged(&format!("{}/stargazers", repo_path(repo)), page);
        self.get_json(&path, STAR_MEDIA_TYPE).await
    }

    async fn pull_requests_page(&self, repo: &RepoRef, page: u32) -> SourceResult<Vec<RemotePullRequest>> {
        let path = paged(&format!("{}/pulls?state=all", repo_path(repo)), page);
        self.get_json(&path, JSON_MEDIA_TYPE).await
    }

    async fn pull_request_commit_count(&self, repo: &RepoRef, number: i64) -> SourceResult<u64> {
        let detail: PullRequestDetail = self
            .get_json(&format!("{}/pulls/{number}", repo_path(repo)), JSON_MEDIA_TYPE)
            .await?;
        Ok(detail.commits)
    }

    async fn pull_request_commits_page(
        &self,
        repo: &RepoRef,
        number: i64,
        page: u32,
    ) -> SourceResult<Vec<RemoteCommit>> {
        let path = paged(&format!("{}/pulls/{number}/commits", repo_path(repo)), page);
        self.get_json(&path, JSON_MEDIA_TYPE).await
    }

    async fn pull_request_reviews(&self, repo: &RepoRef, number: i64) -> SourceResult<Vec<RemoteReview>> {
        self.get_all_pages(&format!("{}/pulls/{number}/reviews", repo_path(repo)))
            .await
    }

    async fn pull_request_comments(&self, repo: &RepoRef, number: i64) -> SourceResult<Vec<RemoteComment>> {
        self.get_all_pages(&format!("{}/pulls/{number}/comments", repo_path(repo)))
            .await
    }

    async fn issues_page(&self, repo: &RepoRef, page: u32) -> SourceResult<Vec<RemoteIssue>> {
        let path = paged(&format!("{}/issues?state=all", repo_path(repo)), page);
        self.get_json(&path, JSON_MEDIA_TYPE).await
    }

    async fn issue_comments(&self, repo: &RepoRef, number: i64) -> SourceResult<Vec<RemoteComment>> {
        self.get_all_pages(&format!("{}/issues/{number}/comments", repo_path(repo)))
            .await
    }

    async fn releases_page(&self, repo: &RepoRef, page: u32) -> SourceResult<Vec<RemoteRelease>> {
        let path = paged(&format!("{}/releases", repo_path(repo)), page);
        self.get_json(&path, JSON_MEDIA_TYPE).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fetcher;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn commit_page_count_rounds_up() {
        assert_eq!(commit_pages(0), 0);
        assert_eq!(commit_pages(1), 1);
        assert_eq!(commit_pages(100), 1);
        assert_eq!(commit_pages(101), 2);
    }

    #[test]
    fn deleted_accounts_become_ghost() {
        assert_eq!(login_or_ghost(&None), "ghost");
        assert_eq!(
            login_or_ghost(&Some(RemoteUser { login: "jni".into() })),
            "jni"
        );
    }

    #[tokio::test]
    async fn stargazers_use_star_media_type_and_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/napari/docs/stargazers"))
            .and(query_param("page", "1"))
            .and(query_param("per_page", "100"))
            .and(header("accept", STAR_MEDIA_TYPE))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"starred_at": "2024-01-02T03:04:05Z", "user": {"login": "alice"}},
                {"starred_at": "2024-01-03T03:04:05Z", "user": null}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let client = GithubClient::with_base_url(fetcher(), &server.uri(), Some("secret".into()));
        let stars = client
            .stargazers_page(&RepoRef::new("napari", "docs"), 1)
            .await
            .unwrap();
        assert_eq!(stars.len(), 2);
        assert_eq!(login_or_ghost(&stars[1].user), "ghost");
    }

    #[tokio::test]
    async fn issues_flag_pull_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/napari/napari/issues"))
            .and(query_param("state", "all"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {
                    "number": 7, "user": {"login": "bob"}, "title": "crash", "body": null,
                    "created_at": "2024-01-01T00:00:00Z", "updated_at": "2024-01-02T00:00:00Z",
                    "closed_at": null, "labels": [{"name": "bug"}]
                },
                {
                    "number": 8, "user": {"login": "bob"}, "title": "fix", "body": "",
                    "created_at": "2024-01-01T00:00:00Z", "updated_at": "2024-01-02T00:00:00Z",
                    "closed_at": null, "labels": [], "pull_request": {"url": "x"}
                }
            ])))
            .mount(&server)
            .await;

        let client = GithubClient::with_base_url(fetcher(), &server.uri(), None);
        let issues = client
            .issues_page(&RepoRef::new("napari", "napari"), 1)
            .await
            .unwrap();
        assert!(!issues[0].is_pull_request());
        assert_eq!(issues[0].labels[0].name, "bug");
        assert!(issues[1].is_pull_request());
    }

    #[tokio::test]
    async fn review_listing_walks_all_pages() {
        let server = MockServer::start().await;
        let full_page: Vec<_> = (0..100)
            .map(|id| json!({"id": id, "user": {"login": "r"}, "state": "APPROVED", "submitted_at": "2024-01-01T00:00:00Z"}))
            .collect();
        Mock::given(method("GET"))
            .and(path("/repos/napari/napari/pulls/5/reviews"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(full_page)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/napari/napari/pulls/5/reviews"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 100, "user": null, "state": "PENDING", "submitted_at": null}
            ])))
            .mount(&server)
            .await;

        let client = GithubClient::with_base_url(fetcher(), &server.uri(), None);
        let reviews = client
            .pull_request_reviews(&RepoRef::new("napari", "napari"), 5)
            .await
            .unwrap();
        assert_eq!(reviews.len(), 101);
        assert_eq!(reviews[100].state, "PENDING");
    }

    #[tokio::test]
    async fn commit_count_comes_from_pull_detail() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/napari/napari/pulls/12"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"number": 12, "commits": 250})))
            .mount(&server)
            .await;

        let client = GithubClient::with_base_url(fetcher(), &server.uri(), None);
        let count = client
            .pull_request_commit_count(&RepoRef::new("napari", "napari"), 12)
            .await
            .unwrap();
        assert_eq!(commit_pages(count), 3);
    }
}
