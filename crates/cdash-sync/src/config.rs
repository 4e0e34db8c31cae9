use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use cdash_core::{CoreError, RepoRef, DEFAULT_BOT_ACCOUNTS, DEFAULT_CORE_DEVS};
use cdash_storage::{HttpClientConfig, ResponseCache};
use serde::{Deserialize, Serialize};

/// 950 GB, leaving headroom under the 1 TB monthly free tier.
pub const DEFAULT_WAREHOUSE_BYTE_LIMIT: u64 = 1000u64.pow(4) - 50 * 1000u64.pow(3);

/// Process-level settings read from the environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub db_path: PathBuf,
    pub project_config_path: PathBuf,
    pub github_token: Option<String>,
    pub pepy_key: Option<String>,
    pub zulip_email: Option<String>,
    pub zulip_api_key: Option<String>,
    pub zulip_site: Option<String>,
    pub google_access_token: Option<String>,
    pub google_cloud_project: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub cache_ttl_secs: u64,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub batch_size: usize,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub warehouse_cron: String,
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            db_path: std::env::var("CDASH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("dashboard.db")),
            project_config_path: std::env::var("CDASH_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("dashboard.yaml")),
            github_token: env_opt("GH_TOKEN"),
            pepy_key: env_opt("PEPY_KEY"),
            zulip_email: env_opt("ZULIP_EMAIL"),
            zulip_api_key: env_opt("ZULIP_API_KEY"),
            zulip_site: env_opt("ZULIP_SITE"),
            google_access_token: env_opt("GOOGLE_ACCESS_TOKEN"),
            google_cloud_project: env_opt("GOOGLE_CLOUD_PROJECT"),
            cache_dir: env_opt("CDASH_CACHE_DIR").map(PathBuf::from),
            cache_ttl_secs: env_parse("CDASH_CACHE_TTL_SECS", 3600),
            user_agent: std::env::var("CDASH_USER_AGENT")
                .unwrap_or_else(|_| "cdash-bot/0.1".to_string()),
            http_timeout_secs: env_parse("CDASH_HTTP_TIMEOUT_SECS", 30),
            batch_size: env_parse("CDASH_BATCH_SIZE", 500usize).max(1),
            scheduler_enabled: std::env::var("CDASH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("CDASH_SYNC_CRON").unwrap_or_else(|_| "0 0 3 * * *".to_string()),
            warehouse_cron: std::env::var("CDASH_WAREHOUSE_CRON")
                .unwrap_or_else(|_| "0 0 5 * * Mon".to_string()),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            cache: self
                .cache_dir
                .as_ref()
                .map(|dir| ResponseCache::new(dir, Duration::from_secs(self.cache_ttl_secs))),
            ..Default::default()
        }
    }

    /// Location of the compressed snapshot next to the database file.
    pub fn snapshot_path(&self) -> PathBuf {
        let mut name = self
            .db_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "dashboard.db".into());
        name.push(".bz2");
        self.db_path.with_file_name(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveSettings {
    pub folder: String,
    pub snapshot_name: String,
    pub workbook_name: String,
}

impl Default for DriveSettings {
    fn default() -> Self {
        Self {
            folder: "napari_dashboard".into(),
            snapshot_name: "dashboard.db.bz2".into(),
            workbook_name: "napari_dashboard.xlsx".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    pub site: String,
    pub email: String,
    pub ops_stream: String,
    pub ops_topic: String,
    pub summary_stream: String,
    pub summary_topic: String,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            site: "https://napari.zulipchat.com".into(),
            email: "dashboard-bot@napari.zulipchat.com".into(),
            ops_stream: "metrics and analytics".into(),
            ops_topic: "Deploy dashboard".into(),
            summary_stream: "metrics and analytics".into(),
            summary_topic: "Weekly Summary".into(),
        }
    }
}

/// Project-level settings loaded from `dashboard.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub project_name: String,
    /// Tracked repositories as `owner/name`.
    pub repositories: Vec<String>,
    /// Repository whose stars and bundle downloads are charted.
    pub main_repository: String,
    pub core_packages: Vec<String>,
    /// Conda names for core packages, which the plugin registry does not list.
    pub core_conda_packages: BTreeMap<String, String>,
    pub bot_accounts: Vec<String>,
    pub core_devs: Vec<String>,
    pub dashboard_labels: Vec<String>,
    pub forum_latest_url: String,
    pub plugin_summary_url: String,
    pub plugin_conda_url: String,
    /// Packages selected by the warehouse query.
    pub warehouse_projects: Vec<String>,
    pub warehouse_byte_limit: u64,
    /// 30-day downloads above which a plugin counts as active.
    pub active_plugin_threshold: i64,
    pub drive: DriveSettings,
    pub chat: ChatSettings,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            project_name: "napari".into(),
            repositories: strings(&["napari/napari", "napari/docs", "napari/npe2"]),
            main_repository: "napari/napari".into(),
            core_packages: strings(&["napari", "napari-plugin-manager", "npe2"]),
            core_conda_packages: [
                ("napari", "conda-forge/napari"),
                ("napari-plugin-manager", "conda-forge/napari-plugin-manager"),
                ("npe2", "conda-forge/npe2"),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
            bot_accounts: strings(DEFAULT_BOT_ACCOUNTS),
            core_devs: strings(DEFAULT_CORE_DEVS),
            dashboard_labels: strings(&["feature", "bugfix", "maintenance", "enhancement"]),
            forum_latest_url: cdash_adapters::forum::DEFAULT_LATEST_URL.into(),
            plugin_summary_url: cdash_adapters::packages::PLUGIN_SUMMARY_URL.into(),
            plugin_conda_url: cdash_adapters::packages::PLUGIN_CONDA_URL.into(),
            warehouse_projects: strings(&["napari"]),
            warehouse_byte_limit: DEFAULT_WAREHOUSE_BYTE_LIMIT,
            active_plugin_threshold: 1500,
            drive: DriveSettings::default(),
            chat: ChatSettings::default(),
        }
    }
}

impl ProjectConfig {
    /// Reads the YAML file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "project config missing, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn repositories(&self) -> Result<Vec<RepoRef>, CoreError> {
        self.repositories.iter().map(|r| RepoRef::parse(r)).collect()
    }

    pub fn main_repository(&self) -> Result<RepoRef, CoreError> {
        RepoRef::parse(&self.main_repository)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_limit_is_950_gb() {
        assert_eq!(DEFAULT_WAREHOUSE_BYTE_LIMIT, 950_000_000_000);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dashboard.yaml");
        std::fs::write(
            &path,
            "project_name: demo\nrepositories: [demo/core]\nmain_repository: demo/core\nchat:\n  ops_topic: Ops\n",
        )
        .unwrap();

        let cfg = ProjectConfig::load(&path).unwrap();
        assert_eq!(cfg.project_name, "demo");
        assert_eq!(cfg.repositories().unwrap(), vec![RepoRef::new("demo", "core")]);
        assert_eq!(cfg.chat.ops_topic, "Ops");
        assert_eq!(cfg.chat.summary_topic, "Weekly Summary");
        assert_eq!(cfg.active_plugin_threshold, 1500);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = ProjectConfig::load(Path::new("/nonexistent/dashboard.yaml")).unwrap();
        assert_eq!(cfg, ProjectConfig::default());
        assert_eq!(cfg.main_repository().unwrap().full_name(), "napari/napari");
    }

    #[test]
    fn snapshot_sits_next_to_database() {
        let mut cfg = SyncConfig::from_env();
        cfg.db_path = PathBuf::from("/data/dashboard.db");
        assert_eq!(cfg.snapshot_path(), PathBuf::from("/data/dashboard.db.bz2"));
    }
}
