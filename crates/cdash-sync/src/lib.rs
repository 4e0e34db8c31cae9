//! Sync pipeline orchestration: every source merged into the dashboard store,
//! one after another.

pub mod config;
pub mod db;
pub mod forum;
pub mod github;
pub mod packages;
pub mod progress;
pub mod snapshot;
pub mod warehouse;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cdash_adapters::{
    BigQueryClient, CondaClient, DriveClient, ForumClient, GithubClient, LogNotifier, Notifier, PepyClient,
    PluginRegistryClient, PypiJsonClient, PypiStatsClient, SourceError, ZulipClient,
};
use cdash_adapters::packages::packages_to_fetch;
use cdash_core::CoreError;
use cdash_storage::HttpFetcher;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub use config::{ChatSettings, DriveSettings, ProjectConfig, SyncConfig, DEFAULT_WAREHOUSE_BYTE_LIMIT};
pub use db::{Store, StoreError, StoreResult};
pub use packages::CondaTarget;
pub use progress::{logging_callback, EntityKind, ProgressCallback, SyncCounts, SyncProgress};
pub use warehouse::{QuotaGuard, WarehouseOutcome};

/// A full update is skipped when the previous one finished within this window.
pub const RECENT_UPDATE_HOURS: i64 = 12;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("warehouse quota exceeded: processed {processed} + estimated {estimated} > limit {limit}")]
    QuotaExceeded { processed: u64, estimated: u64, limit: u64 },
    #[error("only {hours}h since the newest stored download")]
    TooSoon { hours: i64 },
    #[error("{days} days since the newest stored download, refusing to query")]
    GapTooLarge { days: i64 },
    #[error("no stored downloads to continue from")]
    NoData,
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(StoreError::Sqlx(err))
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Everything an entity sync needs besides its remote client.
pub struct SyncContext<'a> {
    pub store: &'a Store,
    pub batch_size: usize,
    pub bots: &'a [String],
    pub on_progress: Option<&'a ProgressCallback>,
}

impl SyncContext<'_> {
    pub fn started(&self, entity: EntityKind, scope: &str) {
        progress::emit(
            self.on_progress,
            SyncProgress::Started {
                entity,
                scope: scope.to_string(),
            },
        );
    }

    /// Reports the terminal state of a sync and passes its result through.
    pub fn finish(&self, entity: EntityKind, scope: &str, result: SyncResult<SyncCounts>) -> SyncResult<SyncCounts> {
        match result {
            Ok(counts) => {
                progress::emit(self.on_progress, counts.done(entity, scope));
                Ok(counts)
            }
            Err(err) => Err(self.fail(entity, scope, err)),
        }
    }

    pub fn fail(&self, entity: EntityKind, scope: &str, err: SyncError) -> SyncError {
        progress::emit(
            self.on_progress,
            SyncProgress::Failed {
                entity,
                scope: scope.to_string(),
                error: err.to_string(),
            },
        );
        err
    }
}

#[derive(Debug, Clone)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// True when the store was updated recently and nothing was fetched.
    pub skipped: bool,
    pub entities: BTreeMap<&'static str, SyncCounts>,
}

impl SyncRunSummary {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: started_at,
            skipped: false,
            entities: BTreeMap::new(),
        }
    }

    fn record(&mut self, entity: EntityKind, counts: SyncCounts) {
        let total = self.entities.entry(entity.as_str()).or_default();
        total.inserted += counts.inserted;
        total.updated += counts.updated;
        total.skipped += counts.skipped;
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    project: ProjectConfig,
    http: Arc<HttpFetcher>,
    on_progress: ProgressCallback,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, project: ProjectConfig) -> Result<Self> {
        let log = logging_callback();
        let http = HttpFetcher::new(config.http_client_config())?.with_rate_limit_hook(Arc::new(
            move |source: &str, wait: Duration| {
                log(SyncProgress::RateLimited {
                    source: source.to_string(),
                    wait_secs: wait.as_secs(),
                })
            },
        ));
        Ok(Self {
            config,
            project,
            http: Arc::new(http),
            on_progress: logging_callback(),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn project(&self) -> &ProjectConfig {
        &self.project
    }

    pub fn http(&self) -> Arc<HttpFetcher> {
        Arc::clone(&self.http)
    }

    /// Chat notifier for operational messages, or the log when no chat
    /// credentials are configured.
    pub fn notifier(&self) -> Box<dyn Notifier> {
        match self.chat_client(&self.project.chat.ops_stream, &self.project.chat.ops_topic) {
            Some(client) => Box::new(client),
            None => Box::new(LogNotifier),
        }
    }

    pub fn chat_client(&self, stream: &str, topic: &str) -> Option<ZulipClient> {
        let api_key = self.config.zulip_api_key.as_deref()?;
        let chat = &self.project.chat;
        Some(ZulipClient::new(
            self.http(),
            self.config.zulip_site.as_deref().unwrap_or(&chat.site),
            self.config.zulip_email.as_deref().unwrap_or(&chat.email),
            api_key,
            stream,
            topic,
        ))
    }

    pub fn drive(&self) -> Result<DriveClient> {
        let token = self
            .config
            .google_access_token
            .clone()
            .context("GOOGLE_ACCESS_TOKEN is required for drive access")?;
        Ok(DriveClient::new(self.http(), token))
    }

    async fn open_store(&self) -> Result<Store> {
        Store::open(&self.config.db_path)
            .await
            .with_context(|| format!("opening {}", self.config.db_path.display()))
    }

    /// Updates the store from every source except the warehouse.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let mut summary = SyncRunSummary::new(Utc::now());
        let store = self.open_store().await?;

        if store
            .recently_updated(summary.started_at, chrono::Duration::hours(RECENT_UPDATE_HOURS))
            .await?
        {
            info!("database was recently updated, skipping update");
            summary.skipped = true;
            store.close().await;
            return Ok(summary);
        }

        let result = self.sync_all(&store, &mut summary).await;
        if result.is_ok() {
            store.mark_updated(Utc::now()).await?;
        }
        store.close().await;
        result?;

        summary.finished_at = Utc::now();
        info!(run_id = %summary.run_id, entities = summary.entities.len(), "update finished");
        Ok(summary)
    }

    async fn sync_all(&self, store: &Store, summary: &mut SyncRunSummary) -> Result<()> {
        let ctx = SyncContext {
            store,
            batch_size: self.config.batch_size,
            bots: &self.project.bot_accounts,
            on_progress: Some(&self.on_progress),
        };

        let host = GithubClient::new(self.http(), self.config.github_token.clone());
        let repos = self.project.repositories()?;
        for repo in &repos {
            summary.record(EntityKind::Stars, github::sync_stars(&ctx, &host, repo).await?);
        }
        for repo in &repos {
            summary.record(
                EntityKind::PullRequests,
                github::sync_pull_requests(&ctx, &host, repo).await?,
            );
        }
        for repo in &repos {
            summary.record(EntityKind::Issues, github::sync_issues(&ctx, &host, repo).await?);
        }
        let main = self.project.main_repository()?;
        summary.record(
            EntityKind::Artifacts,
            github::sync_artifact_downloads(&ctx, &host, &main).await?,
        );

        let forum_client = ForumClient::new(self.http(), &self.project.forum_latest_url);
        summary.record(EntityKind::Forum, forum::sync_forum(&ctx, &forum_client).await?);

        let registry = PluginRegistryClient::with_urls(
            self.http(),
            &self.project.plugin_summary_url,
            &self.project.plugin_conda_url,
        );
        let plugins = registry.plugin_names().await.context("listing plugins")?;
        let conda_mapping = registry.conda_mapping().await.context("fetching conda mapping")?;
        let targets = self.conda_targets(conda_mapping);
        summary.record(
            EntityKind::Conda,
            packages::sync_conda(&ctx, &CondaClient::new(self.http()), &targets, Utc::now().date_naive()).await?,
        );

        let package_names = packages_to_fetch(&self.project.core_packages, &plugins);
        match &self.config.pepy_key {
            Some(key) => {
                let pepy = PepyClient::new(self.http(), key.clone());
                summary.record(EntityKind::Pepy, packages::sync_pepy(&ctx, &pepy, &package_names).await?);
            }
            None => warn!("PEPY_KEY not set, skipping pepy download stats"),
        }
        summary.record(
            EntityKind::PypiStats,
            packages::sync_pypistats(&ctx, &PypiStatsClient::new(self.http()), &package_names).await?,
        );
        summary.record(
            EntityKind::Releases,
            packages::sync_releases(&ctx, &PypiJsonClient::new(self.http()), &package_names).await?,
        );
        Ok(())
    }

    fn conda_targets(&self, mapping: BTreeMap<String, Option<String>>) -> Vec<CondaTarget> {
        let core = self.project.core_conda_packages.iter().map(|(pypi, conda)| CondaTarget {
            pypi_name: pypi.clone(),
            conda_name: Some(conda.clone()),
        });
        let plugins = mapping
            .into_iter()
            .filter(|(pypi, _)| !self.project.core_conda_packages.contains_key(pypi))
            .map(|(pypi_name, conda_name)| CondaTarget { pypi_name, conda_name });
        core.chain(plugins).collect()
    }

    /// Loads the newest download events from the warehouse.
    ///
    /// An estimate over budget comes back as an error wrapping
    /// [`SyncError::QuotaExceeded`].
    pub async fn run_warehouse(&self) -> Result<WarehouseOutcome> {
        let token = self
            .config
            .google_access_token
            .clone()
            .context("GOOGLE_ACCESS_TOKEN is required for the warehouse step")?;
        let project_id = self
            .config
            .google_cloud_project
            .clone()
            .context("GOOGLE_CLOUD_PROJECT is required for the warehouse step")?;
        let client = BigQueryClient::new(self.http(), project_id, token);
        let notifier = self.notifier();

        let store = self.open_store().await?;
        let ctx = SyncContext {
            store: &store,
            batch_size: self.config.batch_size,
            bots: &self.project.bot_accounts,
            on_progress: Some(&self.on_progress),
        };
        let outcome = warehouse::run_warehouse_update(
            &ctx,
            &client,
            notifier.as_ref(),
            QuotaGuard::new(self.project.warehouse_byte_limit),
            &self.project.warehouse_projects,
            Utc::now(),
        )
        .await;
        store.close().await;
        Ok(outcome?)
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;

        let pipeline = Arc::clone(self);
        let update = Job::new_async(self.config.sync_cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(run_id = %summary.run_id, skipped = summary.skipped, "scheduled update done"),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled update failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {}", self.config.sync_cron))?;
        sched.add(update).await.context("adding scheduler job")?;

        let pipeline = Arc::clone(self);
        let warehouse_job = Job::new_async(self.config.warehouse_cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_warehouse().await {
                    Ok(outcome) => info!(?outcome, "scheduled warehouse update done"),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled warehouse update failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {}", self.config.warehouse_cron))?;
        sched.add(warehouse_job).await.context("adding scheduler job")?;

        Ok(Some(sched))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use cdash_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};

    use crate::{Store, SyncContext};

    pub fn fetcher() -> Arc<HttpFetcher> {
        Arc::new(
            HttpFetcher::new(HttpClientConfig {
                backoff: BackoffPolicy::fixed(2, Duration::from_millis(5)),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    pub fn ctx(store: &Store) -> SyncContext<'_> {
        SyncContext {
            store,
            batch_size: 2,
            bots: &[],
            on_progress: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::scratch_store;
    use std::sync::Mutex;

    fn pipeline_for(db_path: std::path::PathBuf) -> SyncPipeline {
        let mut config = SyncConfig::from_env();
        config.db_path = db_path;
        config.scheduler_enabled = false;
        SyncPipeline::new(config, ProjectConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn finish_reports_failures() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb: ProgressCallback = Box::new(move |event| {
            if let SyncProgress::Failed { error, .. } = event {
                sink.lock().unwrap().push(error);
            }
        });

        let (_dir, store) = scratch_store().await;
        let ctx = SyncContext {
            store: &store,
            batch_size: 10,
            bots: &[],
            on_progress: Some(&cb),
        };
        let result = ctx.finish(EntityKind::Forum, "forum", Err(SyncError::NoData));
        assert!(matches!(result, Err(SyncError::NoData)));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], "no stored downloads to continue from");
    }

    #[tokio::test]
    async fn recent_update_skips_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("dashboard.db");
        let store = Store::open(&db_path).await.unwrap();
        store.mark_updated(Utc::now()).await.unwrap();
        store.close().await;

        let summary = pipeline_for(db_path).run_once().await.unwrap();
        assert!(summary.skipped);
        assert!(summary.entities.is_empty());
    }

    #[tokio::test]
    async fn disabled_scheduler_is_not_built() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(pipeline_for(dir.path().join("dashboard.db")));
        assert!(pipeline.maybe_build_scheduler().await.unwrap().is_none());
    }

    #[test]
    fn core_conda_names_take_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline_for(dir.path().join("dashboard.db"));
        let mapping = BTreeMap::from([
            ("napari".to_string(), None),
            ("affinder".to_string(), Some("conda-forge/affinder".to_string())),
        ]);
        let targets = pipeline.conda_targets(mapping);
        assert_eq!(targets.len(), 4);
        assert!(targets.contains(&CondaTarget {
            pypi_name: "napari".into(),
            conda_name: Some("conda-forge/napari".into()),
        }));
        assert_eq!(targets.last().unwrap().pypi_name, "affinder");
    }

    #[test]
    fn summary_accumulates_per_entity() {
        let mut summary = SyncRunSummary::new(Utc::now());
        let one = SyncCounts {
            inserted: 1,
            updated: 2,
            skipped: 0,
        };
        summary.record(EntityKind::Stars, one);
        summary.record(EntityKind::Stars, one);
        assert_eq!(summary.entities["stars"].updated, 4);
    }
}
