//! Analytical warehouse access over the BigQuery v2 REST API.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cdash_storage::HttpFetcher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::{trim_base, SourceError, SourceResult};

pub const SOURCE_ID: &str = "bigquery";
pub const DEFAULT_API_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";

const QUERY_TIMEOUT_MS: u64 = 60_000;
const PAGE_ROWS: u64 = 10_000;

/// One download event as selected by the warehouse query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarehouseRow {
    pub timestamp: DateTime<Utc>,
    pub country_code: Option<String>,
    pub file_name: String,
    pub python: Option<String>,
    pub system: Option<String>,
    pub system_release: Option<String>,
    pub distro_name: Option<String>,
    pub distro_version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutcome {
    pub rows: Vec<WarehouseRow>,
    pub bytes_processed: u64,
}

/// SQL warehouse billed by scanned bytes.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Bytes processed by all jobs created since `since`.
    async fn processed_bytes_since(&self, since: DateTime<Utc>) -> SourceResult<u64>;

    /// Dry-run estimate of the bytes `query` would scan.
    async fn estimate_bytes(&self, query: &str) -> SourceResult<u64>;

    async fn run_query(&self, query: &str) -> SourceResult<QueryOutcome>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SchemaField {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<SchemaField>,
}

#[derive(Debug, Deserialize)]
struct Cell {
    v: Value,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<Cell>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: Option<bool>,
    job_reference: Option<JobReference>,
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<TableRow>,
    page_token: Option<String>,
    total_bytes_processed: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryStatistics {
    total_bytes_processed: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatistics {
    total_bytes_processed: Option<String>,
    query: Option<QueryStatistics>,
}

#[derive(Debug, Deserialize)]
struct JobSummary {
    statistics: Option<JobStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobList {
    #[serde(default)]
    jobs: Vec<JobSummary>,
    next_page_token: Option<String>,
}

fn parse_bytes(value: Option<&str>) -> SourceResult<Option<u64>> {
    value
        .map(|v| {
            v.parse::<u64>()
                .map_err(|err| SourceError::payload(SOURCE_ID, format!("bad byte count `{v}`: {err}")))
        })
        .transpose()
}

fn cell_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Timestamps arrive as int64 microseconds, or as float seconds when the
/// int64 format option is not honoured.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(micros) = raw.parse::<i64>() {
        return DateTime::from_timestamp_micros(micros);
    }
    let secs = raw.parse::<f64>().ok()?;
    DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64)
}

fn convert_rows(fields: &[String], rows: Vec<TableRow>) -> SourceResult<Vec<WarehouseRow>> {
    let index: HashMap<&str, usize> = fields
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();
    let column = |row: &TableRow, name: &str| -> Option<String> {
        index
            .get(name)
            .and_then(|i| row.f.get(*i))
            .and_then(|cell| cell_string(&cell.v))
    };

    rows.into_iter()
        .map(|row| {
            let raw_ts = column(&row, "timestamp")
                .ok_or_else(|| SourceError::payload(SOURCE_ID, "row without timestamp"))?;
            let timestamp = parse_timestamp(&raw_ts)
                .ok_or_else(|| SourceError::payload(SOURCE_ID, format!("bad timestamp `{raw_ts}`")))?;
            let file_name = column(&row, "project")
                .ok_or_else(|| SourceError::payload(SOURCE_ID, "row without file name"))?;
            Ok(WarehouseRow {
                timestamp,
                country_code: column(&row, "country_code"),
                file_name,
                python: column(&row, "python"),
                system: column(&row, "system"),
                system_release: column(&row, "system_release"),
                distro_name: column(&row, "distro_name"),
                distro_version: column(&row, "distro_version"),
            })
        })
        .collect()
}

pub struct BigQueryClient {
    http: Arc<HttpFetcher>,
    base_url: String,
    project_id: String,
    token: String,
}

impl BigQueryClient {
    pub fn new(http: Arc<HttpFetcher>, project_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_base_url(http, DEFAULT_API_URL, project_id, token)
    }

    pub fn with_base_url(
        http: Arc<HttpFetcher>,
        base_url: &str,
        project_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: trim_base(base_url),
            project_id: project_id.into(),
            token: token.into(),
        }
    }

    fn project_url(&self) -> String {
        format!("{}/projects/{}", self.base_url, self.project_id)
    }

    async fn post_query(&self, body: Value) -> SourceResult<QueryResponse> {
        let url = format!("{}/queries", self.project_url());
        let resp = self
            .http
            .execute(SOURCE_ID, &url, |client| {
                client.post(&url).bearer_auth(&self.token).json(&body)
            })
            .await?;
        Ok(resp.json()?)
    }

    async fn query_results(&self, job: &JobReference, page_token: Option<&str>) -> SourceResult<QueryResponse> {
        let url = format!("{}/queries/{}", self.project_url(), job.job_id);
        let mut params = vec![
            ("timeoutMs", QUERY_TIMEOUT_MS.to_string()),
            ("maxResults", PAGE_ROWS.to_string()),
            ("formatOptions.useInt64Timestamp", "true".to_string()),
        ];
        if let Some(location) = &job.location {
            params.push(("location", location.clone()));
        }
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }
        let resp = self
            .http
            .execute(SOURCE_ID, &url, |client| {
                client.get(&url).bearer_auth(&self.token).query(&params)
            })
            .await?;
        Ok(resp.json()?)
    }
}

#[async_trait]
impl Warehouse for BigQueryClient {
    async fn processed_bytes_since(&self, since: DateTime<Utc>) -> SourceResult<u64> {
        let url = format!("{}/jobs", self.project_url());
        let mut total = 0u64;
        let mut page_token: Option<String> = None;
        loop {
            let mut params = vec![
                ("allUsers", "true".to_string()),
                ("minCreationTime", since.timestamp_millis().to_string()),
                ("projection", "full".to_string()),
                ("maxResults", "1000".to_string()),
            ];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }
            let resp = self
                .http
                .execute(SOURCE_ID, &url, |client| {
                    client.get(&url).bearer_auth(&self.token).query(&params)
                })
                .await?;
            let list: JobList = resp.json()?;
            for job in &list.jobs {
                let Some(stats) = &job.statistics else { continue };
                let bytes = stats
                    .query
                    .as_ref()
                    .and_then(|q| q.total_bytes_processed.as_deref())
                    .or(stats.total_bytes_processed.as_deref());
                if let Some(bytes) = parse_bytes(bytes)? {
                    total += bytes;
                }
            }
            match list.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        debug!(total, %since, "processed bytes since");
        Ok(total)
    }

    async fn estimate_bytes(&self, query: &str) -> SourceResult<u64> {
        let resp = self
            .post_query(json!({
                "query": query,
                "useLegacySql": false,
                "dryRun": true,
                "useQueryCache": false,
            }))
            .await?;
        parse_bytes(resp.total_bytes_processed.as_deref())?
            .ok_or_else(|| SourceError::payload(SOURCE_ID, "dry run without totalBytesProcessed"))
    }

    async fn run_query(&self, query: &str) -> SourceResult<QueryOutcome> {
        let mut resp = self
            .post_query(json!({
                "query": query,
                "useLegacySql": false,
                "timeoutMs": QUERY_TIMEOUT_MS,
                "maxResults": PAGE_ROWS,
                "formatOptions": {"useInt64Timestamp": true},
            }))
            .await?;
        let job = resp
            .job_reference
            .take()
            .ok_or_else(|| SourceError::payload(SOURCE_ID, "query response without job reference"))?;

        while resp.job_complete == Some(false) {
            info!(job_id = %job.job_id, "waiting for query job");
            resp = self.query_results(&job, None).await?;
        }

        let fields: Vec<String> = resp
            .schema
            .as_ref()
            .map(|s| s.fields.iter().map(|f| f.name.clone()).collect())
            .unwrap_or_default();
        let mut bytes_processed = parse_bytes(resp.total_bytes_processed.as_deref())?.unwrap_or(0);
        let mut rows = convert_rows(&fields, std::mem::take(&mut resp.rows))?;

        let mut page_token = resp.page_token.take();
        while let Some(token) = page_token {
            let mut page = self.query_results(&job, Some(&token)).await?;
            if let Some(bytes) = parse_bytes(page.total_bytes_processed.as_deref())? {
                bytes_processed = bytes_processed.max(bytes);
            }
            rows.extend(convert_rows(&fields, std::mem::take(&mut page.rows))?);
            page_token = page.page_token;
        }

        Ok(QueryOutcome { rows, bytes_processed })
    }
}
