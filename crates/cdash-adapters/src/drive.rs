//! Google Drive v3 REST client for storing the database snapshot.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use cdash_storage::{write_atomic, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::{trim_base, SourceError, SourceResult};

pub const SOURCE_ID: &str = "drive";
pub const DEFAULT_API_URL: &str = "https://www.googleapis.com";

const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const FILE_FIELDS: &str = "files(id,name,sha256Checksum)";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub sha256_checksum: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

fn escape_query_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

pub struct DriveClient {
    http: Arc<HttpFetcher>,
    base_url: String,
    token: String,
}

impl DriveClient {
    pub fn new(http: Arc<HttpFetcher>, token: impl Into<String>) -> Self {
        Self::with_base_url(http, DEFAULT_API_URL, token)
    }

    pub fn with_base_url(http: Arc<HttpFetcher>, base_url: &str, token: impl Into<String>) -> Self {
        Self {
            http,
            base_url: trim_base(base_url),
            token: token.into(),
        }
    }

    async fn list(&self, query: String) -> SourceResult<Vec<DriveFile>> {
        let url = format!("{}/drive/v3/files", self.base_url);
        let params = [("q", query.as_str()), ("fields", FILE_FIELDS)];
        let resp = self
            .http
            .execute(SOURCE_ID, &url, |client| {
                client.get(&url).bearer_auth(&self.token).query(&params)
            })
            .await?;
        Ok(resp.json::<FileList>()?.files)
    }

    /// First non-trashed file called `name`.
    pub async fn find_file(&self, name: &str) -> SourceResult<Option<DriveFile>> {
        let query = format!("name='{}' and trashed=false", escape_query_value(name));
        Ok(self.list(query).await?.into_iter().next())
    }

    pub async fn find_folder(&self, name: &str) -> SourceResult<Option<DriveFile>> {
        let query = format!(
            "name='{}' and mimeType='{FOLDER_MIME_TYPE}' and trashed=false",
            escape_query_value(name)
        );
        Ok(self
            .list(query)
            .await?
            .into_iter()
            .find(|folder| folder.name == name))
    }

    /// Downloads the content of `file` to `dst`.
    pub async fn download(&self, file: &DriveFile, dst: &Path) -> SourceResult<u64> {
        let url = format!("{}/drive/v3/files/{}", self.base_url, file.id);
        let resp = self
            .http
            .execute(SOURCE_ID, &url, |client| {
                client
                    .get(&url)
                    .bearer_auth(&self.token)
                    .query(&[("alt", "media")])
            })
            .await?;
        write_atomic(dst, &resp.body).await?;
        info!(file = %file.name, bytes = resp.body.len(), dst = %dst.display(), "downloaded from drive");
        Ok(resp.body.len() as u64)
    }

    /// Replaces the content of the file called `name`, creating it inside
    /// `folder` when it does not exist yet.
    pub async fn upload(&self, name: &str, folder: &str, src: &Path) -> SourceResult<DriveFile> {
        let body = tokio::fs::read(src)
            .await
            .with_context(|| format!("reading {}", src.display()))?;

        let file = match self.find_file(name).await? {
            Some(file) => file,
            None => {
                let parent = self
                    .find_folder(folder)
                    .await?
                    .ok_or_else(|| SourceError::Message(format!("drive folder `{folder}` not found")))?;
                self.create_metadata(name, &parent.id).await?
            }
        };

        let url = format!("{}/upload/drive/v3/files/{}", self.base_url, file.id);
        let resp = self
            .http
            .execute(SOURCE_ID, &url, |client| {
                client
                    .patch(&url)
                    .bearer_auth(&self.token)
                    .query(&[("uploadType", "media")])
                    .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                    .body(body.clone())
            })
            .await?;
        let updated: DriveFile = resp.json()?;
        info!(file = %updated.name, id = %updated.id, bytes = body.len(), "uploaded to drive");
        Ok(updated)
    }

    async fn create_metadata(&self, name: &str, parent_id: &str) -> SourceResult<DriveFile> {
        let url = format!("{}/drive/v3/files", self.base_url);
        let metadata = json!({"name": name, "parents": [parent_id]});
        let resp = self
            .http
            .execute(SOURCE_ID, &url, |client| {
                client.post(&url).bearer_auth(&self.token).json(&metadata)
            })
            .await?;
        Ok(resp.json()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fetcher;
    use tempfile::tempdir;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn quotes_are_escaped_in_queries() {
        assert_eq!(escape_query_value("it's"), "it\\'s");
    }

    #[tokio::test]
    async fn download_writes_media() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .and(query_param("q", "name='dashboard.db.bz2' and trashed=false"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "files": [{"id": "f1", "name": "dashboard.db.bz2", "sha256Checksum": "abc"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files/f1"))
            .and(query_param("alt", "media"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"BZh9".to_vec()))
            .mount(&server)
            .await;

        let client = DriveClient::with_base_url(fetcher(), &server.uri(), "tok");
        let file = client.find_file("dashboard.db.bz2").await.unwrap().unwrap();
        assert_eq!(file.sha256_checksum.as_deref(), Some("abc"));

        let dir = tempdir().unwrap();
        let dst = dir.path().join("dashboard.db.bz2");
        assert_eq!(client.download(&file, &dst).await.unwrap(), 4);
        assert_eq!(std::fs::read(&dst).unwrap(), b"BZh9");
    }

    #[tokio::test]
    async fn upload_creates_file_in_folder() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .and(query_param("q", "name='dashboard.db.bz2' and trashed=false"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"files": []})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .and(query_param(
                "q",
                "name='napari_dashboard' and mimeType='application/vnd.google-apps.folder' and trashed=false",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "files": [{"id": "dir1", "name": "napari_dashboard"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/drive/v3/files"))
            .and(body_partial_json(json!({"parents": ["dir1"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "new1", "name": "dashboard.db.bz2"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/upload/drive/v3/files/new1"))
            .and(query_param("uploadType", "media"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "new1", "name": "dashboard.db.bz2"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let src = dir.path().join("dashboard.db.bz2");
        std::fs::write(&src, b"payload").unwrap();

        let client = DriveClient::with_base_url(fetcher(), &server.uri(), "tok");
        let uploaded = client
            .upload("dashboard.db.bz2", "napari_dashboard", &src)
            .await
            .unwrap();
        assert_eq!(uploaded.id, "new1");
    }

    #[tokio::test]
    async fn upload_without_folder_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"files": []})))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let src = dir.path().join("x.bz2");
        std::fs::write(&src, b"payload").unwrap();

        let client = DriveClient::with_base_url(fetcher(), &server.uri(), "tok");
        let err = client.upload("x.bz2", "missing", &src).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
