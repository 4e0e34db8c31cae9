//! Read-only aggregation queries behind the dashboard.
//!
//! Every function here takes the pool by reference and never writes. Missing
//! child rows (a repository without issues, a package without conda builds)
//! produce zeros or empty series rather than errors.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::Result;
use cdash_core::{is_bot, Platform, RepoRef};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

/// Length of every contributor ranking.
pub const RANKING_SIZE: usize = 10;

/// Python versions with fewer downloads in the window are left out.
pub const MIN_PYTHON_VERSION_DOWNLOADS: i64 = 100;

type Timestamp = DateTime<Utc>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DayCount {
    pub date: NaiveDate,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamedCount {
    pub name: String,
    pub count: i64,
}

impl NamedCount {
    fn new(name: impl Into<String>, count: i64) -> Self {
        Self {
            name: name.into(),
            count,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PrStats {
    pub total: i64,
    pub merged: i64,
    pub open: i64,
    pub new_merged: i64,
    pub new_opened: i64,
    pub closed_without_merge: i64,
    /// New pull requests per day since the reporting date, two decimals.
    pub average_per_day: f64,
}

pub async fn pr_stats(pool: &SqlitePool, repo: &RepoRef, since: Timestamp, now: Timestamp) -> Result<PrStats> {
    let (total, merged, open, new_merged, new_opened, closed_without_merge): (i64, i64, i64, i64, i64, i64) =
        sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(merge_time IS NOT NULL), 0),
                COALESCE(SUM(merge_time IS NULL AND close_time IS NULL), 0),
                COALESCE(SUM(merge_time > ?), 0),
                COALESCE(SUM(open_time > ?), 0),
                COALESCE(SUM(close_time IS NOT NULL AND merge_time IS NULL), 0)
            FROM github_pull_requests
            WHERE repository_user = ? AND repository_name = ?
            "#,
        )
        .bind(since)
        .bind(since)
        .bind(&repo.owner)
        .bind(&repo.name)
        .fetch_one(pool)
        .await?;

    let days = (now - since).num_days().max(1);
    let average_per_day = (new_opened as f64 / days as f64 * 100.0).round() / 100.0;
    Ok(PrStats {
        total,
        merged,
        open,
        new_merged,
        new_opened,
        closed_without_merge,
        average_per_day,
    })
}

/// Pull requests merged since `since`, per label; labels nobody used report 0.
pub async fn merged_by_label(
    pool: &SqlitePool,
    repo: &RepoRef,
    since: Timestamp,
    labels: &[String],
) -> Result<Vec<NamedCount>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT l.label, COUNT(*)
        FROM github_pr_to_labels_table l
        JOIN github_pull_requests p
          ON p.repository_user = l.repository_user
         AND p.repository_name = l.repository_name
         AND p.pull_request = l.pull_request_num
        WHERE p.repository_user = ? AND p.repository_name = ? AND p.merge_time > ?
        GROUP BY l.label
        "#,
    )
    .bind(&repo.owner)
    .bind(&repo.name)
    .bind(since)
    .fetch_all(pool)
    .await?;
    let found: HashMap<String, i64> = rows.into_iter().collect();

    Ok(labels
        .iter()
        .map(|label| NamedCount::new(label, found.get(label).copied().unwrap_or(0)))
        .collect())
}

/// Distinct non-bot authors with a pull request merged since `since`.
pub async fn active_contributors<S: AsRef<str>>(
    pool: &SqlitePool,
    repo: &RepoRef,
    since: Timestamp,
    bots: &[S],
) -> Result<Vec<String>> {
    let users: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT user FROM github_pull_requests
        WHERE repository_user = ? AND repository_name = ? AND merge_time > ?
        ORDER BY user
        "#,
    )
    .bind(&repo.owner)
    .bind(&repo.name)
    .bind(since)
    .fetch_all(pool)
    .await?;
    Ok(users.into_iter().filter(|u| !is_bot(u, bots)).collect())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IssueCounts {
    pub opened: i64,
    pub closed: i64,
}

pub async fn issue_counts(pool: &SqlitePool, repo: &RepoRef, since: Timestamp) -> Result<IssueCounts> {
    let (opened, closed): (i64, i64) = sqlx::query_as(
        r#"
        SELECT COALESCE(SUM(open_time > ?), 0), COALESCE(SUM(close_time > ?), 0)
        FROM github_issues
        WHERE repository_user = ? AND repository_name = ?
        "#,
    )
    .bind(since)
    .bind(since)
    .bind(&repo.owner)
    .bind(&repo.name)
    .fetch_one(pool)
    .await?;
    Ok(IssueCounts { opened, closed })
}

/// Bundle downloads summed over releases, one entry per known platform.
pub async fn bundle_downloads(pool: &SqlitePool, repo: &RepoRef) -> Result<Vec<NamedCount>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT platform, SUM(download_count) FROM github_artifact_downloads
        WHERE repository_user = ? AND repository_name = ?
        GROUP BY platform
        "#,
    )
    .bind(&repo.owner)
    .bind(&repo.name)
    .fetch_all(pool)
    .await?;
    let found: HashMap<String, i64> = rows.into_iter().collect();

    Ok(Platform::ALL
        .iter()
        .map(|p| NamedCount::new(p.as_str(), found.get(p.as_str()).copied().unwrap_or(0)))
        .collect())
}

/// Daily activity counts from the first recorded pull request or issue up to
/// `today`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActivitySeries {
    pub days: Vec<NaiveDate>,
    pub opened_prs: Vec<i64>,
    pub merged_prs: Vec<i64>,
    pub closed_prs: Vec<i64>,
    pub opened_issues: Vec<i64>,
    pub closed_issues: Vec<i64>,
    pub merged_by_label: BTreeMap<String, Vec<i64>>,
}

impl ActivitySeries {
    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    /// First day of every 7-day bucket.
    pub fn weeks(&self) -> Vec<NaiveDate> {
        self.days.iter().step_by(7).copied().collect()
    }
}

pub fn cumulative(values: &[i64]) -> Vec<i64> {
    values
        .iter()
        .scan(0, |acc, v| {
            *acc += v;
            Some(*acc)
        })
        .collect()
}

/// Sums consecutive 7-day buckets; the last bucket may be partial.
pub fn weekly(values: &[i64]) -> Vec<i64> {
    values.chunks(7).map(|week| week.iter().sum()).collect()
}

pub async fn activity_series(
    pool: &SqlitePool,
    repo: &RepoRef,
    labels: &[String],
    today: NaiveDate,
) -> Result<ActivitySeries> {
    let prs: Vec<(i64, Timestamp, Option<Timestamp>, Option<Timestamp>)> = sqlx::query_as(
        r#"
        SELECT pull_request, open_time, close_time, merge_time FROM github_pull_requests
        WHERE repository_user = ? AND repository_name = ?
        "#,
    )
    .bind(&repo.owner)
    .bind(&repo.name)
    .fetch_all(pool)
    .await?;
    let issues: Vec<(Timestamp, Option<Timestamp>)> = sqlx::query_as(
        "SELECT open_time, close_time FROM github_issues WHERE repository_user = ? AND repository_name = ?",
    )
    .bind(&repo.owner)
    .bind(&repo.name)
    .fetch_all(pool)
    .await?;

    let first = prs
        .iter()
        .map(|pr| pr.1)
        .chain(issues.iter().map(|issue| issue.0))
        .min();
    let Some(first) = first else {
        return Ok(ActivitySeries::default());
    };
    let start = first.date_naive();
    let len = (today - start).num_days() + 1;
    if len <= 0 {
        return Ok(ActivitySeries::default());
    }
    let len = len as usize;
    let slot = |t: Timestamp| -> Option<usize> {
        usize::try_from((t.date_naive() - start).num_days())
            .ok()
            .filter(|i| *i < len)
    };

    let label_rows: Vec<(i64, String)> = sqlx::query_as(
        r#"
        SELECT pull_request_num, label FROM github_pr_to_labels_table
        WHERE repository_user = ? AND repository_name = ?
        "#,
    )
    .bind(&repo.owner)
    .bind(&repo.name)
    .fetch_all(pool)
    .await?;
    let mut pr_labels: HashMap<i64, Vec<String>> = HashMap::new();
    for (number, label) in label_rows {
        pr_labels.entry(number).or_default().push(label);
    }

    let mut series = ActivitySeries {
        days: start.iter_days().take(len).collect(),
        opened_prs: vec![0; len],
        merged_prs: vec![0; len],
        closed_prs: vec![0; len],
        opened_issues: vec![0; len],
        closed_issues: vec![0; len],
        merged_by_label: labels.iter().map(|l| (l.clone(), vec![0; len])).collect(),
    };

    for (number, open, close, merge) in &prs {
        if let Some(i) = slot(*open) {
            series.opened_prs[i] += 1;
        }
        match (merge, close) {
            (Some(merge), _) => {
                if let Some(i) = slot(*merge) {
                    series.merged_prs[i] += 1;
                    for label in pr_labels.get(number).into_iter().flatten() {
                        if let Some(counts) = series.merged_by_label.get_mut(label) {
                            counts[i] += 1;
                        }
                    }
                }
            }
            (None, Some(close)) => {
                if let Some(i) = slot(*close) {
                    series.closed_prs[i] += 1;
                }
            }
            (None, None) => {}
        }
    }
    for (open, close) in &issues {
        if let Some(i) = slot(*open) {
            series.opened_issues[i] += 1;
        }
        if let Some(i) = close.and_then(slot) {
            series.closed_issues[i] += 1;
        }
    }
    Ok(series)
}

/// Running star total per day a star was recorded.
pub async fn stars_cumulative(pool: &SqlitePool, repo: &RepoRef) -> Result<Vec<DayCount>> {
    let rows: Vec<(NaiveDate, i64)> = sqlx::query_as(
        r#"
        SELECT date, COUNT(*) FROM github_stars
        WHERE repository_user = ? AND repository_name = ?
        GROUP BY date ORDER BY date
        "#,
    )
    .bind(&repo.owner)
    .bind(&repo.name)
    .fetch_all(pool)
    .await?;

    let mut total = 0;
    Ok(rows
        .into_iter()
        .map(|(date, count)| {
            total += count;
            DayCount { date, count: total }
        })
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RankingKind {
    Creators,
    Coauthors,
    Reviewers,
}

impl RankingKind {
    fn base_sql(self) -> &'static str {
        match self {
            Self::Creators => {
                "SELECT p.user, COUNT(*) FROM github_pull_requests p \
                 WHERE p.repository_user = ? AND p.repository_name = ?"
            }
            Self::Coauthors => {
                "SELECT c.user, COUNT(DISTINCT c.pr_num) FROM github_pr_commits c \
                 JOIN github_pull_requests p ON p.repository_user = c.repository_user \
                 AND p.repository_name = c.repository_name AND p.pull_request = c.pr_num \
                 WHERE p.repository_user = ? AND p.repository_name = ? AND c.user <> p.user"
            }
            Self::Reviewers => {
                "SELECT r.user, COUNT(DISTINCT r.pr_num) FROM github_pr_reviews r \
                 JOIN github_pull_requests p ON p.repository_user = r.repository_user \
                 AND p.repository_name = r.repository_name AND p.pull_request = r.pr_num \
                 WHERE p.repository_user = ? AND p.repository_name = ? AND r.user <> p.user"
            }
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::Creators => "PR creators",
            Self::Coauthors => "PR co-authors",
            Self::Reviewers => "PR reviewers",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContributorRow {
    pub user: String,
    /// One count per repository, in the order the repositories were given.
    pub per_repo: Vec<i64>,
    pub total: i64,
}

async fn counts_per_user(
    pool: &SqlitePool,
    kind: RankingKind,
    repo: &RepoRef,
    since: Option<Timestamp>,
) -> Result<Vec<(String, i64)>> {
    let mut sql = kind.base_sql().to_string();
    if since.is_some() {
        sql.push_str(" AND p.open_time > ?");
    }
    sql.push_str(" GROUP BY 1");

    let mut query = sqlx::query_as::<_, (String, i64)>(&sql)
        .bind(&repo.owner)
        .bind(&repo.name);
    if let Some(since) = since {
        query = query.bind(since);
    }
    Ok(query.fetch_all(pool).await?)
}

/// Top contributors of one kind across `repos`, skipping `excluded` logins.
pub async fn contributor_ranking<S: AsRef<str>>(
    pool: &SqlitePool,
    kind: RankingKind,
    repos: &[RepoRef],
    since: Option<Timestamp>,
    excluded: &[S],
) -> Result<Vec<ContributorRow>> {
    let mut table: BTreeMap<String, Vec<i64>> = BTreeMap::new();
    for (idx, repo) in repos.iter().enumerate() {
        for (user, count) in counts_per_user(pool, kind, repo, since).await? {
            if is_bot(&user, excluded) {
                continue;
            }
            table.entry(user).or_insert_with(|| vec![0; repos.len()])[idx] += count;
        }
    }

    let mut rows: Vec<ContributorRow> = table
        .into_iter()
        .map(|(user, per_repo)| ContributorRow {
            total: per_repo.iter().sum(),
            user,
            per_repo,
        })
        .collect();
    rows.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.user.cmp(&b.user)));
    rows.truncate(RANKING_SIZE);
    Ok(rows)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PackageDownloads {
    pub name: String,
    pub last_day: i64,
    pub last_week: i64,
    pub last_month: i64,
    pub total: i64,
}

pub async fn package_downloads(pool: &SqlitePool, name: &str, today: NaiveDate) -> Result<PackageDownloads> {
    let (last_day, last_week, last_month): (i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT
            COALESCE(SUM(CASE WHEN date >= ? THEN downloads END), 0),
            COALESCE(SUM(CASE WHEN date >= ? THEN downloads END), 0),
            COALESCE(SUM(CASE WHEN date >= ? THEN downloads END), 0)
        FROM pepy_download_stats WHERE name = ?
        "#,
    )
    .bind(today - Duration::days(1))
    .bind(today - Duration::days(7))
    .bind(today - Duration::days(30))
    .bind(name)
    .fetch_one(pool)
    .await?;
    let total: Option<i64> = sqlx::query_scalar("SELECT downloads FROM pepy_total_downloads WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?;

    Ok(PackageDownloads {
        name: name.to_string(),
        last_day,
        last_week,
        last_month,
        total: total.unwrap_or(0),
    })
}

fn version_key(version: &str) -> Vec<u32> {
    version.split('.').map(|part| part.parse().unwrap_or(0)).collect()
}

/// Downloads per python version since `since`, ordered by version.
pub async fn downloads_per_python_version(
    pool: &SqlitePool,
    package: &str,
    since: NaiveDate,
) -> Result<Vec<NamedCount>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT python_version_name, SUM(downloads) FROM pypi_downloads_per_python_version
        WHERE package_name = ? AND package_date >= ? AND python_version_name <> 'null'
        GROUP BY python_version_name
        "#,
    )
    .bind(package)
    .bind(since)
    .fetch_all(pool)
    .await?;

    let mut rows: Vec<NamedCount> = rows
        .into_iter()
        .filter(|(_, count)| *count >= MIN_PYTHON_VERSION_DOWNLOADS)
        .map(|(name, count)| NamedCount::new(name, count))
        .collect();
    rows.sort_by(|a, b| version_key(&a.name).cmp(&version_key(&b.name)));
    Ok(rows)
}

pub async fn downloads_per_os(pool: &SqlitePool, package: &str, since: NaiveDate) -> Result<Vec<NamedCount>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT os_name, SUM(downloads) FROM pypi_downloads_per_os
        WHERE package_name = ? AND package_date >= ?
        GROUP BY os_name ORDER BY os_name
        "#,
    )
    .bind(package)
    .bind(since)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(name, count)| NamedCount::new(name, count)).collect())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CondaTotals {
    /// Day of the most recent counters; `None` when nothing was recorded.
    pub date: Option<NaiveDate>,
    pub total: i64,
    pub latest_version: i64,
}

/// Conda counters are cumulative, so only the most recent day is summed.
pub async fn conda_totals(pool: &SqlitePool, pypi_name: &str) -> Result<CondaTotals> {
    let date: Option<NaiveDate> = sqlx::query_scalar("SELECT MAX(date) FROM conda_downloads WHERE pypi_name = ?")
        .bind(pypi_name)
        .fetch_one(pool)
        .await?;
    let Some(date) = date else {
        return Ok(CondaTotals::default());
    };

    let (total, latest_version): (i64, i64) = sqlx::query_as(
        r#"
        SELECT COALESCE(SUM(download_count), 0),
               COALESCE(SUM(CASE WHEN latest_version THEN download_count END), 0)
        FROM conda_downloads WHERE pypi_name = ? AND date = ?
        "#,
    )
    .bind(pypi_name)
    .bind(date)
    .fetch_one(pool)
    .await?;
    Ok(CondaTotals {
        date: Some(date),
        total,
        latest_version,
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ForumStats {
    pub topics: i64,
    pub active_topics: i64,
    pub users: i64,
    pub active_users: i64,
}

pub async fn forum_stats(pool: &SqlitePool, since: Timestamp) -> Result<ForumStats> {
    let (topics, active_topics): (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COALESCE(SUM(last_posted_at >= ?), 0) FROM forum_topics",
    )
    .bind(since)
    .fetch_one(pool)
    .await?;
    let (users, active_users): (i64, i64) = sqlx::query_as(
        r#"
        SELECT
            COUNT(DISTINCT ut.user_id),
            COUNT(DISTINCT CASE WHEN t.last_posted_at >= ? THEN ut.user_id END)
        FROM forum_user_to_topic ut
        JOIN forum_topics t ON t.id = ut.topic_id
        "#,
    )
    .bind(since)
    .fetch_one(pool)
    .await?;
    Ok(ForumStats {
        topics,
        active_topics,
        users,
        active_users,
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PluginStats {
    pub plugins: i64,
    /// Plugins above the download threshold over the last 30 days.
    pub active: i64,
    pub released_since: i64,
    pub pypi_downloads: i64,
    pub conda_downloads: i64,
}

/// Plugin figures. Every tracked package that is not a core package counts as a
/// plugin.
pub async fn plugin_stats<S: AsRef<str>>(
    pool: &SqlitePool,
    core_packages: &[S],
    active_threshold: i64,
    since: Timestamp,
    today: NaiveDate,
) -> Result<PluginStats> {
    let core: HashSet<&str> = core_packages.iter().map(|p| p.as_ref()).collect();
    let is_plugin = |name: &str| !core.contains(name);

    let totals: Vec<(String, i64)> = sqlx::query_as("SELECT name, downloads FROM pepy_total_downloads")
        .fetch_all(pool)
        .await?;
    let recent: Vec<(String, i64)> = sqlx::query_as(
        "SELECT name, SUM(downloads) FROM pepy_download_stats WHERE date >= ? GROUP BY name",
    )
    .bind(today - Duration::days(30))
    .fetch_all(pool)
    .await?;
    let released: Vec<String> =
        sqlx::query_scalar("SELECT DISTINCT name FROM pypi_package_releases WHERE release_date >= ?")
            .bind(since)
            .fetch_all(pool)
            .await?;
    let conda: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT c.pypi_name, SUM(c.download_count)
        FROM conda_downloads c
        JOIN (SELECT pypi_name, MAX(date) AS last_day FROM conda_downloads GROUP BY pypi_name) m
          ON m.pypi_name = c.pypi_name AND m.last_day = c.date
        GROUP BY c.pypi_name
        "#,
    )
    .fetch_all(pool)
    .await?;

    let plugin_totals: Vec<i64> = totals
        .iter()
        .filter(|(name, _)| is_plugin(name))
        .map(|(_, n)| *n)
        .collect();
    Ok(PluginStats {
        plugins: plugin_totals.len() as i64,
        active: recent
            .iter()
            .filter(|(name, n)| is_plugin(name) && *n > active_threshold)
            .count() as i64,
        released_since: released.iter().filter(|name| is_plugin(name)).count() as i64,
        pypi_downloads: plugin_totals.iter().sum(),
        conda_downloads: conda
            .iter()
            .filter(|(name, _)| is_plugin(name))
            .map(|(_, n)| n)
            .sum(),
    })
}

/// Non-CI warehouse downloads per day since `since`.
pub async fn warehouse_downloads_per_day(
    pool: &SqlitePool,
    project: &str,
    since: NaiveDate,
) -> Result<Vec<DayCount>> {
    let rows: Vec<(NaiveDate, i64)> = sqlx::query_as(
        r#"
        SELECT date, COUNT(*) FROM pypi_downloads
        WHERE project = ? AND ci_install = 0 AND date >= ?
        GROUP BY date ORDER BY date
        "#,
    )
    .bind(project)
    .bind(since)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(date, count)| DayCount { date, count }).collect())
}

pub async fn warehouse_downloads_per_country(
    pool: &SqlitePool,
    project: &str,
    since: NaiveDate,
) -> Result<Vec<NamedCount>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT country_code, COUNT(*) FROM pypi_downloads
        WHERE project = ? AND ci_install = 0 AND date >= ? AND country_code IS NOT NULL
        GROUP BY country_code ORDER BY 2 DESC, 1
        "#,
    )
    .bind(project)
    .bind(since)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(name, count)| NamedCount::new(name, count)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{now, seeded_store, since, ts};
    use cdash_core::DEFAULT_BOT_ACCOUNTS;

    fn napari() -> RepoRef {
        RepoRef::new("napari", "napari")
    }

    fn labels() -> Vec<String> {
        ["feature", "bugfix", "maintenance", "enhancement"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[tokio::test]
    async fn pull_request_counts() {
        let (_dir, store) = seeded_store().await;
        let stats = pr_stats(store.pool(), &napari(), since(), now()).await.unwrap();
        assert_eq!(stats.total, 7);
        assert_eq!(stats.merged, 4);
        assert_eq!(stats.open, 2);
        assert_eq!(stats.new_merged, 3);
        assert_eq!(stats.new_opened, 6);
        assert_eq!(stats.closed_without_merge, 1);
        // 6 new pull requests over 40 days.
        assert_eq!(stats.average_per_day, 0.15);
    }

    #[tokio::test]
    async fn missing_labels_report_zero() {
        let (_dir, store) = seeded_store().await;
        let counts = merged_by_label(store.pool(), &napari(), since(), &labels()).await.unwrap();
        let get = |name: &str| counts.iter().find(|c| c.name == name).unwrap().count;
        assert_eq!(get("feature"), 1);
        assert_eq!(get("maintenance"), 1);
        assert_eq!(get("bugfix"), 0);
        assert_eq!(get("enhancement"), 0);
    }

    #[tokio::test]
    async fn bots_are_not_active_contributors() {
        let (_dir, store) = seeded_store().await;
        let users = active_contributors(store.pool(), &napari(), since(), DEFAULT_BOT_ACCOUNTS)
            .await
            .unwrap();
        assert_eq!(users, vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn issues_and_bundles() {
        let (_dir, store) = seeded_store().await;
        let issues = issue_counts(store.pool(), &napari(), since()).await.unwrap();
        assert_eq!(issues, IssueCounts { opened: 1, closed: 1 });

        let bundles = bundle_downloads(store.pool(), &napari()).await.unwrap();
        let names: Vec<_> = bundles.iter().map(|b| (b.name.as_str(), b.count)).collect();
        assert_eq!(names, vec![("Windows", 20), ("Linux", 10), ("macOS", 0)]);
    }

    #[tokio::test]
    async fn empty_repository_has_no_series() {
        let (_dir, store) = seeded_store().await;
        let series = activity_series(store.pool(), &RepoRef::new("napari", "docs"), &labels(), now().date_naive())
            .await
            .unwrap();
        assert!(series.is_empty());
        assert!(series.weeks().is_empty());
    }

    #[tokio::test]
    async fn series_covers_first_activity_to_today() {
        let (_dir, store) = seeded_store().await;
        let today = now().date_naive();
        let series = activity_series(store.pool(), &napari(), &labels(), today).await.unwrap();

        assert_eq!(series.days.first(), Some(&NaiveDate::from_ymd_opt(2024, 4, 1).unwrap()));
        assert_eq!(series.days.last(), Some(&today));
        assert_eq!(series.opened_prs.iter().sum::<i64>(), 7);
        assert_eq!(series.merged_prs.iter().sum::<i64>(), 4);
        assert_eq!(series.closed_prs.iter().sum::<i64>(), 1);
        assert_eq!(series.opened_issues.iter().sum::<i64>(), 3);
        assert_eq!(series.merged_by_label["bugfix"].iter().sum::<i64>(), 1);
        assert_eq!(cumulative(&series.opened_prs).last(), Some(&7));
        assert_eq!(weekly(&series.opened_prs).len(), series.weeks().len());
    }

    #[test]
    fn weekly_buckets_keep_partial_tail() {
        assert_eq!(weekly(&[1; 9]), vec![7, 2]);
        assert_eq!(cumulative(&[1, 2, 3]), vec![1, 3, 6]);
    }

    #[tokio::test]
    async fn star_totals_accumulate() {
        let (_dir, store) = seeded_store().await;
        let stars = stars_cumulative(store.pool(), &napari()).await.unwrap();
        let counts: Vec<i64> = stars.iter().map(|s| s.count).collect();
        assert_eq!(counts, vec![2, 3]);
    }

    #[tokio::test]
    async fn rankings_skip_bots_and_own_pull_requests() {
        let (_dir, store) = seeded_store().await;
        let repos = [napari(), RepoRef::new("napari", "docs")];

        let creators = contributor_ranking(store.pool(), RankingKind::Creators, &repos, None, DEFAULT_BOT_ACCOUNTS)
            .await
            .unwrap();
        assert_eq!(creators[0].user, "alice");
        assert_eq!(creators[0].total, 2);
        assert_eq!(creators[0].per_repo, vec![2, 0]);
        assert!(creators.iter().all(|r| r.user != "dependabot[bot]"));

        let coauthors = contributor_ranking(store.pool(), RankingKind::Coauthors, &repos, None, DEFAULT_BOT_ACCOUNTS)
            .await
            .unwrap();
        assert_eq!(coauthors.len(), 1);
        assert_eq!(coauthors[0].user, "carol");

        let recent_reviewers = contributor_ranking(
            store.pool(),
            RankingKind::Reviewers,
            &repos,
            Some(ts("2024-05-29T00:00:00Z")),
            DEFAULT_BOT_ACCOUNTS,
        )
        .await
        .unwrap();
        assert_eq!(recent_reviewers.len(), 1);
        assert_eq!(recent_reviewers[0].total, 1);
    }

    #[tokio::test]
    async fn package_windows() {
        let (_dir, store) = seeded_store().await;
        let napari = package_downloads(store.pool(), "napari", now().date_naive()).await.unwrap();
        assert_eq!(
            napari,
            PackageDownloads {
                name: "napari".into(),
                last_day: 5,
                last_week: 15,
                last_month: 115,
                total: 1000,
            }
        );
        let unknown = package_downloads(store.pool(), "nothing", now().date_naive()).await.unwrap();
        assert_eq!(unknown.total, 0);
    }

    #[tokio::test]
    async fn python_versions_are_filtered_and_ordered() {
        let (_dir, store) = seeded_store().await;
        let rows = downloads_per_python_version(store.pool(), "napari", since().date_naive())
            .await
            .unwrap();
        let names: Vec<_> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["3.9", "3.10"]);

        let os = downloads_per_os(store.pool(), "napari", since().date_naive()).await.unwrap();
        assert_eq!(os, vec![NamedCount::new("linux", 70), NamedCount::new("windows", 30)]);
    }

    #[tokio::test]
    async fn conda_uses_latest_day() {
        let (_dir, store) = seeded_store().await;
        let totals = conda_totals(store.pool(), "napari").await.unwrap();
        assert_eq!(totals.total, 50);
        assert_eq!(totals.latest_version, 30);
        assert_eq!(conda_totals(store.pool(), "missing").await.unwrap(), CondaTotals::default());
    }

    #[tokio::test]
    async fn forum_and_plugins() {
        let (_dir, store) = seeded_store().await;
        let forum = forum_stats(store.pool(), since()).await.unwrap();
        assert_eq!(
            forum,
            ForumStats {
                topics: 2,
                active_topics: 1,
                users: 2,
                active_users: 1,
            }
        );

        let plugins = plugin_stats(store.pool(), &["napari"], 1500, since(), now().date_naive())
            .await
            .unwrap();
        assert_eq!(
            plugins,
            PluginStats {
                plugins: 2,
                active: 1,
                released_since: 1,
                pypi_downloads: 3050,
                conda_downloads: 7,
            }
        );
    }

    #[tokio::test]
    async fn warehouse_rows_exclude_ci() {
        let (_dir, store) = seeded_store().await;
        let days = warehouse_downloads_per_day(store.pool(), "napari", since().date_naive())
            .await
            .unwrap();
        assert_eq!(days.iter().map(|d| d.count).sum::<i64>(), 2);
        let countries = warehouse_downloads_per_country(store.pool(), "napari", since().date_naive())
            .await
            .unwrap();
        assert_eq!(countries, vec![NamedCount::new("DE", 1), NamedCount::new("PL", 1)]);
    }
}
