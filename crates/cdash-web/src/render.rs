//! Static dashboard rendering.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use askama::Template;
use cdash_core::RepoRef;
use cdash_sync::ProjectConfig;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::excel::export_workbook;
use crate::stats::*;

pub const INDEX_FILE: &str = "index.html";
pub const SCRIPT_FILE: &str = "dashboard.js";
pub const STYLE_FILE: &str = "dashboard.css";

#[derive(Debug, Clone, Serialize)]
pub struct RepoSummary {
    pub repo: String,
    pub prs: PrStats,
    pub issues: IssueCounts,
    pub labels: Vec<NamedCount>,
    pub active_contributors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RankingTable {
    pub title: String,
    pub rows: Vec<ContributorRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CondaRow {
    pub name: String,
    pub totals: CondaTotals,
}

/// Weekly buckets of the main repository activity, ready for plotting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActivityChart {
    pub weeks: Vec<NaiveDate>,
    pub opened_prs: Vec<i64>,
    pub merged_prs: Vec<i64>,
    pub closed_prs: Vec<i64>,
    pub opened_issues: Vec<i64>,
    pub closed_issues: Vec<i64>,
    pub open_prs_total: Vec<i64>,
    pub merged_by_label: BTreeMap<String, Vec<i64>>,
}

impl From<&ActivitySeries> for ActivityChart {
    fn from(series: &ActivitySeries) -> Self {
        // Running open count: opened minus merged minus closed, sampled weekly.
        let net: Vec<i64> = (0..series.days.len())
            .map(|i| series.opened_prs[i] - series.merged_prs[i] - series.closed_prs[i])
            .collect();
        Self {
            weeks: series.weeks(),
            opened_prs: weekly(&series.opened_prs),
            merged_prs: weekly(&series.merged_prs),
            closed_prs: weekly(&series.closed_prs),
            opened_issues: weekly(&series.opened_issues),
            closed_issues: weekly(&series.closed_issues),
            open_prs_total: cumulative(&net).into_iter().step_by(7).collect(),
            merged_by_label: series
                .merged_by_label
                .iter()
                .map(|(label, counts)| (label.clone(), weekly(counts)))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChartData {
    pub stars: Vec<DayCount>,
    pub activity: ActivityChart,
    pub warehouse_per_day: Vec<DayCount>,
}

/// Everything the dashboard page shows.
#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub project_name: String,
    pub generated_at: DateTime<Utc>,
    pub since: DateTime<Utc>,
    pub main_repository: String,
    pub repos: Vec<String>,
    pub repo_summaries: Vec<RepoSummary>,
    pub rankings: Vec<RankingTable>,
    pub bundles: Vec<NamedCount>,
    pub packages: Vec<PackageDownloads>,
    pub main_package: String,
    pub python_versions: Vec<NamedCount>,
    pub operating_systems: Vec<NamedCount>,
    pub countries: Vec<NamedCount>,
    pub conda: Vec<CondaRow>,
    pub forum: ForumStats,
    pub plugins: PluginStats,
    pub charts: ChartData,
}

pub async fn collect_dashboard(
    pool: &SqlitePool,
    project: &ProjectConfig,
    since: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Dashboard> {
    let repos = project.repositories()?;
    let main = project.main_repository()?;
    let today = now.date_naive();
    let since_day = since.date_naive();
    let bots = &project.bot_accounts;

    let mut repo_summaries = Vec::with_capacity(repos.len());
    for repo in &repos {
        repo_summaries.push(RepoSummary {
            repo: repo.full_name(),
            prs: pr_stats(pool, repo, since, now).await?,
            issues: issue_counts(pool, repo, since).await?,
            labels: merged_by_label(pool, repo, since, &project.dashboard_labels).await?,
            active_contributors: active_contributors(pool, repo, since, bots).await?,
        });
    }

    let rankings = rankings(pool, project, &repos, since).await?;

    let mut packages = Vec::with_capacity(project.core_packages.len());
    let mut conda = Vec::with_capacity(project.core_packages.len());
    for package in &project.core_packages {
        packages.push(package_downloads(pool, package, today).await?);
        conda.push(CondaRow {
            name: package.clone(),
            totals: conda_totals(pool, package).await?,
        });
    }
    let main_package = project
        .core_packages
        .first()
        .cloned()
        .unwrap_or_else(|| project.project_name.clone());

    let series = activity_series(pool, &main, &project.dashboard_labels, today).await?;
    let charts = ChartData {
        stars: stars_cumulative(pool, &main).await?,
        activity: ActivityChart::from(&series),
        warehouse_per_day: warehouse_downloads_per_day(pool, &main_package, since_day).await?,
    };

    Ok(Dashboard {
        project_name: project.project_name.clone(),
        generated_at: now,
        since,
        main_repository: main.full_name(),
        repos: repos.iter().map(RepoRef::full_name).collect(),
        repo_summaries,
        rankings,
        bundles: bundle_downloads(pool, &main).await?,
        packages,
        python_versions: downloads_per_python_version(pool, &main_package, since_day).await?,
        operating_systems: downloads_per_os(pool, &main_package, since_day).await?,
        countries: warehouse_downloads_per_country(pool, &main_package, since_day).await?,
        main_package,
        conda,
        forum: forum_stats(pool, since).await?,
        plugins: plugin_stats(pool, &project.core_packages, project.active_plugin_threshold, since, today).await?,
        charts,
    })
}

async fn rankings(
    pool: &SqlitePool,
    project: &ProjectConfig,
    repos: &[RepoRef],
    since: DateTime<Utc>,
) -> Result<Vec<RankingTable>> {
    let bots = &project.bot_accounts;
    let mut tables = Vec::new();
    for kind in [RankingKind::Creators, RankingKind::Coauthors, RankingKind::Reviewers] {
        tables.push(RankingTable {
            title: kind.title().to_string(),
            rows: contributor_ranking(pool, kind, repos, None, bots).await?,
        });
        tables.push(RankingTable {
            title: format!("{} since {}", kind.title(), since.date_naive()),
            rows: contributor_ranking(pool, kind, repos, Some(since), bots).await?,
        });
    }

    let outsiders: Vec<&str> = bots
        .iter()
        .chain(&project.core_devs)
        .map(String::as_str)
        .collect();
    tables.push(RankingTable {
        title: "PR creators outside the core team".to_string(),
        rows: contributor_ranking(pool, RankingKind::Creators, repos, None, &outsiders).await?,
    });
    Ok(tables)
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate<'a> {
    dash: &'a Dashboard,
    workbook: &'a str,
}

#[derive(Template)]
#[template(path = "dashboard.js", escape = "none")]
struct ScriptTemplate {
    charts_json: String,
}

#[derive(Template)]
#[template(path = "dashboard.css", escape = "none")]
struct StyleTemplate<'a> {
    project_name: &'a str,
}

/// Renders the page, script, style sheet and workbook into `target_dir`.
pub async fn generate_webpage(
    pool: &SqlitePool,
    project: &ProjectConfig,
    target_dir: &Path,
    since: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Dashboard> {
    let dash = collect_dashboard(pool, project, since, now).await?;
    tokio::fs::create_dir_all(target_dir)
        .await
        .with_context(|| format!("creating {}", target_dir.display()))?;

    let index = IndexTemplate {
        dash: &dash,
        workbook: &project.drive.workbook_name,
    }
    .render()?;
    let script = ScriptTemplate {
        charts_json: serde_json::to_string(&dash.charts)?,
    }
    .render()?;
    let style = StyleTemplate {
        project_name: &dash.project_name,
    }
    .render()?;

    for (name, body) in [(INDEX_FILE, index), (SCRIPT_FILE, script), (STYLE_FILE, style)] {
        let path = target_dir.join(name);
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
    }

    let workbook = target_dir.join(&project.drive.workbook_name);
    match export_workbook(pool, &workbook).await {
        Ok(sheets) => info!(path = %workbook.display(), sheets, "workbook exported"),
        Err(err) => warn!(path = %workbook.display(), error = %err, "workbook export failed"),
    }

    info!(dir = %target_dir.display(), "dashboard rendered");
    Ok(dash)
}
