//! Package registry and download statistics connectors.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use cdash_core::{normalized_package_name, DownloadCategory};
use cdash_storage::HttpFetcher;
use chrono::{NaiveDate, NaiveDateTime};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{header_map, trim_base, SourceError, SourceResult};

pub const PEPY_URL: &str = "https://pepy.tech/api/v2";
pub const PYPISTATS_URL: &str = "https://pypistats.org/api";
pub const PYPI_URL: &str = "https://pypi.org/pypi";
pub const ANACONDA_URL: &str = "https://api.anaconda.org";
pub const PLUGIN_SUMMARY_URL: &str = "https://api.napari.org/api/extended_summary";
pub const PLUGIN_CONDA_URL: &str = "https://api.napari.org/api/conda";

/// Per-package download counters published by pepy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PepyProject {
    pub total_downloads: i64,
    /// `date -> version -> downloads`
    #[serde(default)]
    pub downloads: BTreeMap<NaiveDate, BTreeMap<String, i64>>,
}

pub struct PepyClient {
    http: Arc<HttpFetcher>,
    base_url: String,
    api_key: String,
}

impl PepyClient {
    pub fn new(http: Arc<HttpFetcher>, api_key: impl Into<String>) -> Self {
        Self::with_base_url(http, PEPY_URL, api_key)
    }

    pub fn with_base_url(http: Arc<HttpFetcher>, base_url: &str, api_key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: trim_base(base_url),
            api_key: api_key.into(),
        }
    }

    pub async fn project(&self, package: &str) -> SourceResult<PepyProject> {
        let url = format!("{}/projects/{package}", self.base_url);
        let headers = header_map(&[("x-api-key", self.api_key.as_str())])?;
        let resp = self.http.get("pepy", &url, &headers).await?;
        Ok(resp.json()?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsRow {
    pub date: NaiveDate,
    pub category: String,
    pub downloads: i64,
}

#[derive(Debug, Deserialize)]
struct StatsEnvelope {
    data: Vec<StatsRow>,
}

/// `overall` series split by mirror accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverallDownloads {
    pub without_mirrors: i64,
    pub with_mirrors: i64,
}

pub struct PypiStatsClient {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl PypiStatsClient {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self::with_base_url(http, PYPISTATS_URL)
    }

    pub fn with_base_url(http: Arc<HttpFetcher>, base_url: &str) -> Self {
        Self {
            http,
            base_url: trim_base(base_url),
        }
    }

    async fn series(&self, package: &str, endpoint: &str) -> SourceResult<Vec<StatsRow>> {
        let url = format!("{}/packages/{package}/{endpoint}", self.base_url);
        let resp = self.http.get("pypistats", &url, &HeaderMap::new()).await?;
        let envelope: StatsEnvelope = resp.json()?;
        Ok(envelope.data)
    }

    /// Daily totals keyed by date.
    pub async fn overall(&self, package: &str) -> SourceResult<BTreeMap<NaiveDate, OverallDownloads>> {
        let mut out: BTreeMap<NaiveDate, OverallDownloads> = BTreeMap::new();
        for row in self.series(package, "overall").await? {
            let entry = out.entry(row.date).or_default();
            match row.category.as_str() {
                "without_mirrors" => entry.without_mirrors = row.downloads,
                "with_mirrors" => entry.with_mirrors = row.downloads,
                other => debug!(package, category = other, "ignoring overall category"),
            }
        }
        Ok(out)
    }

    pub async fn category(&self, package: &str, category: DownloadCategory) -> SourceResult<Vec<StatsRow>> {
        self.series(package, category.endpoint()).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRelease {
    pub version: String,
    pub release_date: NaiveDate,
}

#[derive(Debug, Deserialize)]
struct ReleaseFile {
    upload_time: NaiveDateTime,
}

#[derive(Debug, Deserialize)]
struct PypiProject {
    #[serde(default)]
    releases: BTreeMap<String, Vec<ReleaseFile>>,
}

pub struct PypiJsonClient {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl PypiJsonClient {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self::with_base_url(http, PYPI_URL)
    }

    pub fn with_base_url(http: Arc<HttpFetcher>, base_url: &str) -> Self {
        Self {
            http,
            base_url: trim_base(base_url),
        }
    }

    /// First upload date of every version that has files. Unknown packages yield
    /// an empty list.
    pub async fn releases(&self, package: &str) -> SourceResult<Vec<PackageRelease>> {
        let url = format!("{}/{package}/json", self.base_url);
        let resp = match self.http.get("pypi", &url, &HeaderMap::new()).await {
            Ok(resp) => resp,
            Err(err) if err.status() == Some(404) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let project: PypiProject = resp.json()?;
        Ok(project
            .releases
            .into_iter()
            .filter_map(|(version, files)| {
                files
                    .iter()
                    .map(|f| f.upload_time.date())
                    .min()
                    .map(|release_date| PackageRelease { version, release_date })
            })
            .collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CondaFile {
    pub version: String,
    pub ndownloads: i64,
    pub full_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CondaPackage {
    pub latest_version: Option<String>,
    #[serde(default)]
    pub files: Vec<CondaFile>,
}

pub struct CondaClient {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl CondaClient {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self::with_base_url(http, ANACONDA_URL)
    }

    pub fn with_base_url(http: Arc<HttpFetcher>, base_url: &str) -> Self {
        Self {
            http,
            base_url: trim_base(base_url),
        }
    }

    /// `conda_name` is `channel/package`, e.g. `conda-forge/napari`.
    pub async fn package(&self, conda_name: &str) -> SourceResult<CondaPackage> {
        let url = format!("{}/package/{conda_name}", self.base_url);
        let resp = self.http.get("conda", &url, &HeaderMap::new()).await?;
        Ok(resp.json()?)
    }
}

#[derive(Debug, Deserialize)]
struct PluginSummary {
    name: String,
}

/// Plugin registry: plugin names and the pypi to conda name mapping.
pub struct PluginRegistryClient {
    http: Arc<HttpFetcher>,
    summary_url: String,
    conda_url: String,
}

impl PluginRegistryClient {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self::with_urls(http, PLUGIN_SUMMARY_URL, PLUGIN_CONDA_URL)
    }

    pub fn with_urls(http: Arc<HttpFetcher>, summary_url: &str, conda_url: &str) -> Self {
        Self {
            http,
            summary_url: summary_url.to_string(),
            conda_url: conda_url.to_string(),
        }
    }

    /// Normalized, deduplicated and sorted plugin names.
    pub async fn plugin_names(&self) -> SourceResult<Vec<String>> {
        let resp = self.http.fetch_bytes("plugins", &self.summary_url).await?;
        let plugins: Vec<PluginSummary> = resp.json()?;
        let names: BTreeSet<String> = plugins
            .iter()
            .map(|p| normalized_package_name(&p.name))
            .collect();
        Ok(names.into_iter().collect())
    }

    /// `pypi name -> conda name`; plugins without a conda build map to `None`.
    pub async fn conda_mapping(&self) -> SourceResult<BTreeMap<String, Option<String>>> {
        let resp = self.http.fetch_bytes("plugins", &self.conda_url).await?;
        let value: serde_json::Value = resp.json()?;
        let map = value
            .as_object()
            .ok_or_else(|| SourceError::payload("plugins", "conda mapping is not an object"))?;
        Ok(map
            .iter()
            .map(|(k, v)| (k.clone(), v.as_str().map(str::to_string)))
            .collect())
    }
}

/// Core packages first, then plugins, without duplicates.
pub fn packages_to_fetch(core_packages: &[String], plugins: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    core_packages
        .iter()
        .chain(plugins.iter())
        .filter(|name| seen.insert(name.to_string()))
        .cloned()
        .collect()
}
