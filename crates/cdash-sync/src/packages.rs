//! Day-bucketed package download counters: pepy, pypistats, PyPI release
//! dates and conda file downloads.

use cdash_adapters::packages::{CondaClient, PepyClient, PypiJsonClient, PypiStatsClient};
use cdash_core::{known_python_versions, DownloadCategory, KNOWN_OPERATING_SYSTEMS};
use chrono::NaiveDate;
use sqlx::sqlite::SqliteConnection;
use tracing::{debug, info};

use crate::db::{ensure, OperatingSystem, PythonVersion, SqliteQuery, StoreResult};
use crate::progress::{EntityKind, SyncCounts};
use crate::{SyncContext, SyncResult};

/// Inserts a counter row, or overwrites it when the stored value differs.
///
/// `update` must only match the row when its value changed, so an unchanged
/// counter is reported as skipped.
async fn merge_counter(
    conn: &mut SqliteConnection,
    insert: SqliteQuery<'_>,
    update: SqliteQuery<'_>,
    counts: &mut SyncCounts,
) -> StoreResult<()> {
    if insert.execute(&mut *conn).await?.rows_affected() == 1 {
        counts.inserted += 1;
    } else if update.execute(&mut *conn).await?.rows_affected() == 1 {
        counts.updated += 1;
    } else {
        counts.skipped += 1;
    }
    Ok(())
}

/// Total and per (version, day) downloads from pepy.
pub async fn sync_pepy(ctx: &SyncContext<'_>, client: &PepyClient, packages: &[String]) -> SyncResult<SyncCounts> {
    let scope = format!("{} packages", packages.len());
    ctx.started(EntityKind::Pepy, &scope);
    let result = pepy_inner(ctx, client, packages).await;
    ctx.finish(EntityKind::Pepy, &scope, result)
}

async fn pepy_inner(ctx: &SyncContext<'_>, client: &PepyClient, packages: &[String]) -> SyncResult<SyncCounts> {
    let mut counts = SyncCounts::default();
    let mut batch = ctx.store.batch(ctx.batch_size);

    for package in packages {
        let project = client.project(package).await?;
        let conn = batch.conn().await?;
        sqlx::query(
            r#"
            INSERT INTO pepy_total_downloads (name, downloads) VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET downloads = excluded.downloads
            "#,
        )
        .bind(package)
        .bind(project.total_downloads)
        .execute(&mut *conn)
        .await?;

        let mut rows = 0usize;
        for (day, versions) in &project.downloads {
            for (version, downloads) in versions {
                let insert = sqlx::query(
                    r#"
                    INSERT INTO pepy_download_stats (name, version, date, downloads)
                    VALUES (?, ?, ?, ?) ON CONFLICT DO NOTHING
                    "#,
                )
                .bind(package)
                .bind(version)
                .bind(*day)
                .bind(*downloads);
                let update = sqlx::query(
                    r#"
                    UPDATE pepy_download_stats SET downloads = ?
                    WHERE name = ? AND version = ? AND date = ? AND downloads <> ?
                    "#,
                )
                .bind(*downloads)
                .bind(package)
                .bind(version)
                .bind(*day)
                .bind(*downloads);
                merge_counter(conn, insert, update, &mut counts).await?;
                rows += 1;
            }
        }
        debug!(package, rows, "merged pepy counters");
        batch.record(rows + 1).await?;
    }

    batch.finish().await?;
    Ok(counts)
}

/// Overall, python-version and operating-system series from pypistats.
pub async fn sync_pypistats(
    ctx: &SyncContext<'_>,
    client: &PypiStatsClient,
    packages: &[String],
) -> SyncResult<SyncCounts> {
    let scope = format!("{} packages", packages.len());
    ctx.started(EntityKind::PypiStats, &scope);
    let result = pypistats_inner(ctx, client, packages).await;
    ctx.finish(EntityKind::PypiStats, &scope, result)
}

async fn pypistats_inner(
    ctx: &SyncContext<'_>,
    client: &PypiStatsClient,
    packages: &[String],
) -> SyncResult<SyncCounts> {
    let mut counts = SyncCounts::default();
    let mut batch = ctx.store.batch(ctx.batch_size);

    let conn = batch.conn().await?;
    for os in KNOWN_OPERATING_SYSTEMS {
        ensure(conn, &OperatingSystem(os)).await?;
    }
    for version in known_python_versions() {
        ensure(conn, &PythonVersion(&version)).await?;
    }
    batch.commit().await?;

    for package in packages {
        let overall = client.overall(package).await?;
        let python_minor = client.category(package, DownloadCategory::PythonMinor).await?;
        let system = client.category(package, DownloadCategory::System).await?;
        let conn = batch.conn().await?;

        for (day, downloads) in &overall {
            let insert = sqlx::query(
                r#"
                INSERT INTO pypi_stats_downloads (name, date, downloads, downloads_with_mirror)
                VALUES (?, ?, ?, ?) ON CONFLICT DO NOTHING
                "#,
            )
            .bind(package)
            .bind(*day)
            .bind(downloads.without_mirrors)
            .bind(downloads.with_mirrors);
            let update = sqlx::query(
                r#"
                UPDATE pypi_stats_downloads SET downloads = ?, downloads_with_mirror = ?
                WHERE name = ? AND date = ? AND (downloads <> ? OR downloads_with_mirror <> ?)
                "#,
            )
            .bind(downloads.without_mirrors)
            .bind(downloads.with_mirrors)
            .bind(package)
            .bind(*day)
            .bind(downloads.without_mirrors)
            .bind(downloads.with_mirrors);
            merge_counter(conn, insert, update, &mut counts).await?;
        }

        for row in &python_minor {
            ensure(conn, &PythonVersion(&row.category)).await?;
            let insert = sqlx::query(
                r#"
                INSERT INTO pypi_downloads_per_python_version (python_version_name, package_name, package_date, downloads)
                VALUES (?, ?, ?, ?) ON CONFLICT DO NOTHING
                "#,
            )
            .bind(&row.category)
            .bind(package)
            .bind(row.date)
            .bind(row.downloads);
            let update = sqlx::query(
                r#"
                UPDATE pypi_downloads_per_python_version SET downloads = ?
                WHERE python_version_name = ? AND package_name = ? AND package_date = ? AND downloads <> ?
                "#,
            )
            .bind(row.downloads)
            .bind(&row.category)
            .bind(package)
            .bind(row.date)
            .bind(row.downloads);
            merge_counter(conn, insert, update, &mut counts).await?;
        }

        for row in &system {
            ensure(conn, &OperatingSystem(&row.category)).await?;
            let insert = sqlx::query(
                r#"
                INSERT INTO pypi_downloads_per_os (os_name, package_name, package_date, downloads)
                VALUES (?, ?, ?, ?) ON CONFLICT DO NOTHING
                "#,
            )
            .bind(&row.category)
            .bind(package)
            .bind(row.date)
            .bind(row.downloads);
            let update = sqlx::query(
                r#"
                UPDATE pypi_downloads_per_os SET downloads = ?
                WHERE os_name = ? AND package_name = ? AND package_date = ? AND downloads <> ?
                "#,
            )
            .bind(row.downloads)
            .bind(&row.category)
            .bind(package)
            .bind(row.date)
            .bind(row.downloads);
            merge_counter(conn, insert, update, &mut counts).await?;
        }

        batch
            .record(overall.len() + python_minor.len() + system.len())
            .await?;
    }

    batch.finish().await?;
    Ok(counts)
}

/// First upload date of every released version.
pub async fn sync_releases(ctx: &SyncContext<'_>, client: &PypiJsonClient, packages: &[String]) -> SyncResult<SyncCounts> {
    let scope = format!("{} packages", packages.len());
    ctx.started(EntityKind::Releases, &scope);
    let result = releases_inner(ctx, client, packages).await;
    ctx.finish(EntityKind::Releases, &scope, result)
}

async fn releases_inner(ctx: &SyncContext<'_>, client: &PypiJsonClient, packages: &[String]) -> SyncResult<SyncCounts> {
    let mut counts = SyncCounts::default();
    let mut batch = ctx.store.batch(ctx.batch_size);

    for package in packages {
        let releases = client.releases(package).await?;
        let conn = batch.conn().await?;
        for release in &releases {
            let insert = sqlx::query(
                "INSERT INTO pypi_package_releases (name, version, release_date) VALUES (?, ?, ?) ON CONFLICT DO NOTHING",
            )
            .bind(package)
            .bind(&release.version)
            .bind(release.release_date);
            let update = sqlx::query(
                r#"
                UPDATE pypi_package_releases SET release_date = ?
                WHERE name = ? AND version = ? AND release_date <> ?
                "#,
            )
            .bind(release.release_date)
            .bind(package)
            .bind(&release.version)
            .bind(release.release_date);
            merge_counter(conn, insert, update, &mut counts).await?;
        }
        batch.record(releases.len()).await?;
    }

    batch.finish().await?;
    Ok(counts)
}

/// One `(pypi name, conda name)` pair; packages without a conda build carry
/// `None` and are skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CondaTarget {
    pub pypi_name: String,
    pub conda_name: Option<String>,
}

/// Snapshot of conda file download counters for `today`. A package already
/// recorded today is not fetched again.
pub async fn sync_conda(
    ctx: &SyncContext<'_>,
    client: &CondaClient,
    targets: &[CondaTarget],
    today: NaiveDate,
) -> SyncResult<SyncCounts> {
    let scope = format!("{} packages", targets.len());
    ctx.started(EntityKind::Conda, &scope);
    let result = conda_inner(ctx, client, targets, today).await;
    ctx.finish(EntityKind::Conda, &scope, result)
}

async fn conda_inner(
    ctx: &SyncContext<'_>,
    client: &CondaClient,
    targets: &[CondaTarget],
    today: NaiveDate,
) -> SyncResult<SyncCounts> {
    let mut counts = SyncCounts::default();
    let mut batch = ctx.store.batch(ctx.batch_size);

    for target in targets {
        let Some(conda_name) = target.conda_name.as_deref() else {
            counts.skipped += 1;
            continue;
        };
        let conn = batch.conn().await?;
        let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conda_downloads WHERE pypi_name = ? AND date = ?")
            .bind(&target.pypi_name)
            .bind(today)
            .fetch_one(&mut *conn)
            .await?;
        if existing > 0 {
            counts.skipped += 1;
            continue;
        }

        let package = client.package(conda_name).await?;
        let conn = batch.conn().await?;
        for file in &package.files {
            let latest = package.latest_version.as_deref() == Some(file.version.as_str());
            sqlx::query(
                r#"
                INSERT INTO conda_downloads (
                    pypi_name, name, version, download_count, date, full_binary_name, latest_version
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(name, full_binary_name, date) DO UPDATE SET download_count = excluded.download_count
                "#,
            )
            .bind(&target.pypi_name)
            .bind(conda_name)
            .bind(&file.version)
            .bind(file.ndownloads)
            .bind(today)
            .bind(&file.full_name)
            .bind(latest)
            .execute(&mut *conn)
            .await?;
            counts.inserted += 1;
        }
        batch.record(package.files.len()).await?;
    }

    batch.finish().await?;
    info!(inserted = counts.inserted, skipped = counts.skipped, "conda downloads recorded");
    Ok(counts)
}
