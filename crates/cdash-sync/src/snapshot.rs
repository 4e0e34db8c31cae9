//! Moving the database between the local file and the shared drive.

use std::path::Path;

use anyhow::{Context, Result};
use cdash_adapters::DriveClient;
use cdash_storage::snapshot::{compress_file, decompress_file, file_sha256};
use tracing::info;

use crate::config::DriveSettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The local archive already matched the remote checksum.
    UpToDate,
    Downloaded { bytes: u64 },
}

/// Fetches the archived database unless the local archive is identical, then
/// unpacks it over `db_path`.
pub async fn fetch_snapshot(
    drive: &DriveClient,
    settings: &DriveSettings,
    archive: &Path,
    db_path: &Path,
) -> Result<FetchOutcome> {
    let remote = drive
        .find_file(&settings.snapshot_name)
        .await?
        .with_context(|| format!("`{}` not found on drive", settings.snapshot_name))?;

    let local_sum = if archive.exists() {
        Some(file_sha256(archive).await?)
    } else {
        None
    };

    let outcome = match (&local_sum, &remote.sha256_checksum) {
        (Some(local), Some(remote_sum)) if local.eq_ignore_ascii_case(remote_sum) => {
            info!(archive = %archive.display(), "local snapshot matches drive, skipping download");
            FetchOutcome::UpToDate
        }
        _ => FetchOutcome::Downloaded {
            bytes: drive.download(&remote, archive).await?,
        },
    };

    if outcome != FetchOutcome::UpToDate || !db_path.exists() {
        decompress_file(archive, db_path).await?;
    }
    Ok(outcome)
}

/// Compresses `db_path` into `archive` and uploads it.
pub async fn publish_snapshot(
    drive: &DriveClient,
    settings: &DriveSettings,
    db_path: &Path,
    archive: &Path,
) -> Result<u64> {
    let size = compress_file(db_path, archive).await?;
    drive
        .upload(&settings.snapshot_name, &settings.folder, archive)
        .await
        .context("uploading snapshot")?;
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fetcher;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn archive_of(dir: &Path, content: &[u8]) -> std::path::PathBuf {
        let raw = dir.join("raw.db");
        tokio::fs::write(&raw, content).await.unwrap();
        let archive = dir.join("remote.db.bz2");
        compress_file(&raw, &archive).await.unwrap();
        archive
    }

    #[tokio::test]
    async fn matching_checksum_skips_download() {
        let dir = tempfile::tempdir().unwrap();
        let archive = archive_of(dir.path(), b"sqlite bytes").await;
        let sum = file_sha256(&archive).await.unwrap();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "files": [{"id": "f1", "name": "dashboard.db.bz2", "sha256Checksum": sum}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files/f1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let drive = DriveClient::with_base_url(fetcher(), &server.uri(), "token");
        let db = dir.path().join("dashboard.db");
        let outcome = fetch_snapshot(&drive, &DriveSettings::default(), &archive, &db).await.unwrap();
        assert_eq!(outcome, FetchOutcome::UpToDate);
        assert_eq!(tokio::fs::read(&db).await.unwrap(), b"sqlite bytes");
    }

    #[tokio::test]
    async fn changed_archive_is_downloaded_and_unpacked() {
        let dir = tempfile::tempdir().unwrap();
        let remote = archive_of(dir.path(), b"fresh").await;
        let remote_bytes = tokio::fs::read(&remote).await.unwrap();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "files": [{"id": "f1", "name": "dashboard.db.bz2", "sha256Checksum": "00"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files/f1"))
            .and(query_param("alt", "media"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(remote_bytes))
            .expect(1)
            .mount(&server)
            .await;

        let drive = DriveClient::with_base_url(fetcher(), &server.uri(), "token");
        let archive = dir.path().join("dashboard.db.bz2");
        let db = dir.path().join("dashboard.db");
        let outcome = fetch_snapshot(&drive, &DriveSettings::default(), &archive, &db).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Downloaded { .. }));
        assert_eq!(tokio::fs::read(&db).await.unwrap(), b"fresh");
    }
}
