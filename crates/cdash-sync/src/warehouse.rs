//! Download events from the analytical warehouse, guarded by a monthly
//! processed-bytes budget.

use cdash_adapters::{Notifier, Warehouse, WarehouseRow};
use cdash_core::{human_bytes, is_ci_install, parse_distribution_file_name, CoreError, PypiDownload};
use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};
use sqlx::sqlite::SqliteConnection;
use tracing::{info, info_span, warn, Instrument};

use crate::db::{Store, StoreResult};
use crate::progress::{EntityKind, SyncCounts};
use crate::{SyncContext, SyncError, SyncResult};

const MIN_WINDOW_HOURS: i64 = 10;
const MAX_WINDOW_DAYS: i64 = 15;

/// Refuses a query whose estimated cost would push the monthly total past
/// `limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaGuard {
    pub limit: u64,
}

impl QuotaGuard {
    pub fn new(limit: u64) -> Self {
        Self { limit }
    }

    pub fn exhausted(&self, processed: u64) -> bool {
        processed > self.limit
    }

    pub fn check(&self, processed: u64, estimated: u64) -> SyncResult<()> {
        if processed.saturating_add(estimated) > self.limit {
            return Err(SyncError::QuotaExceeded {
                processed,
                estimated,
                limit: self.limit,
            });
        }
        Ok(())
    }
}

/// How a warehouse update ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarehouseOutcome {
    Inserted { rows: usize, skipped: usize, bytes_processed: u64 },
    /// The newest stored event is too recent for a worthwhile query.
    SkippedTooSoon,
    /// The month's budget was already spent before estimating.
    BudgetSpent { processed: u64 },
}

/// Start of the billing period containing `now`.
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// Query window from the newest stored event to midnight of `now`.
pub fn warehouse_window(
    last: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> SyncResult<(DateTime<Utc>, DateTime<Utc>)> {
    let last = last.ok_or(SyncError::NoData)?;
    let end = now.date_naive().and_time(NaiveTime::MIN).and_utc();
    let span = end - last;
    if span < Duration::hours(MIN_WINDOW_HOURS) {
        return Err(SyncError::TooSoon {
            hours: span.num_hours(),
        });
    }
    if span > Duration::days(MAX_WINDOW_DAYS) {
        return Err(SyncError::GapTooLarge {
            days: span.num_days(),
        });
    }
    Ok((last, end))
}

pub fn build_query(projects: &[String], begin: DateTime<Utc>, end: DateTime<Utc>) -> String {
    let projects = projects
        .iter()
        .map(|p| format!("'{}'", p.replace('\'', "")))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT timestamp, country_code, file.filename AS project, details.python AS python, \
         details.system.name AS system, details.system.release AS system_release, \
         details.distro.name AS distro_name, details.distro.version AS distro_version \
         FROM `bigquery-public-data.pypi.file_downloads` \
         WHERE file.project IN ({projects}) AND details.installer.name = 'pip' \
         AND timestamp BETWEEN TIMESTAMP('{begin}') AND TIMESTAMP('{end}') \
         ORDER BY timestamp",
        begin = begin.format("%Y-%m-%d %H:%M:%S"),
        end = end.format("%Y-%m-%d %H:%M:%S"),
    )
}

pub fn download_from_row(row: &WarehouseRow) -> Result<PypiDownload, CoreError> {
    let file = parse_distribution_file_name(&row.file_name)?;
    let system_release = row.system_release.clone().unwrap_or_default();
    Ok(PypiDownload {
        timestamp: row.timestamp,
        date: row.timestamp.date_naive(),
        country_code: row.country_code.clone(),
        project: file.name,
        version: file.version,
        python_version: row.python.clone(),
        system_name: row.system.clone().unwrap_or_default(),
        ci_install: is_ci_install(&system_release),
        system_release,
        distro_name: row.distro_name.clone().unwrap_or_default(),
        distro_version: row.distro_version.clone().unwrap_or_default(),
        wheel: file.wheel,
    })
}

async fn insert_download(conn: &mut SqliteConnection, download: &PypiDownload) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO pypi_downloads (
            timestamp, date, country_code, project, version, python_version,
            system_name, system_release, distro_name, distro_version, wheel, ci_install
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(download.timestamp)
    .bind(download.date)
    .bind(&download.country_code)
    .bind(&download.project)
    .bind(&download.version)
    .bind(&download.python_version)
    .bind(&download.system_name)
    .bind(&download.system_release)
    .bind(&download.distro_name)
    .bind(&download.distro_version)
    .bind(download.wheel)
    .bind(download.ci_install)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn latest_download(store: &Store) -> StoreResult<Option<DateTime<Utc>>> {
    let last: Option<DateTime<Utc>> = sqlx::query_scalar("SELECT MAX(timestamp) FROM pypi_downloads")
        .fetch_one(store.pool())
        .await?;
    Ok(last)
}

/// Pulls the download events that arrived since the newest stored one.
///
/// Skips with a notification when the budget is already spent or the window
/// is too short. A query whose estimate would exceed the budget is never run
/// and surfaces as [`SyncError::QuotaExceeded`].
pub async fn run_warehouse_update(
    ctx: &SyncContext<'_>,
    warehouse: &dyn Warehouse,
    notifier: &dyn Notifier,
    guard: QuotaGuard,
    projects: &[String],
    now: DateTime<Utc>,
) -> SyncResult<WarehouseOutcome> {
    let scope = projects.join(",");
    ctx.started(EntityKind::Warehouse, &scope);
    let result = warehouse_inner(ctx, warehouse, notifier, guard, projects, now)
        .instrument(info_span!("warehouse", %scope))
        .await;
    match result {
        Ok(outcome) => {
            let (inserted, skipped) = match &outcome {
                WarehouseOutcome::Inserted { rows, skipped, .. } => (*rows, *skipped),
                _ => (0, 0),
            };
            let counts = SyncCounts {
                inserted,
                skipped,
                ..Default::default()
            };
            ctx.finish(EntityKind::Warehouse, &scope, Ok(counts))?;
            Ok(outcome)
        }
        Err(err) => Err(ctx.fail(EntityKind::Warehouse, &scope, err)),
    }
}

async fn warehouse_inner(
    ctx: &SyncContext<'_>,
    warehouse: &dyn Warehouse,
    notifier: &dyn Notifier,
    guard: QuotaGuard,
    projects: &[String],
    now: DateTime<Utc>,
) -> SyncResult<WarehouseOutcome> {
    let processed = warehouse.processed_bytes_since(month_start(now)).await?;
    if guard.exhausted(processed) {
        notifier
            .notify(&format!(
                "Totally processed: {} is more than {} limit. Skip the update",
                human_bytes(processed),
                human_bytes(guard.limit)
            ))
            .await?;
        return Ok(WarehouseOutcome::BudgetSpent { processed });
    }

    let (begin, end) = match warehouse_window(latest_download(ctx.store).await?, now) {
        Ok(window) => window,
        Err(SyncError::TooSoon { hours }) => {
            info!(hours, "warehouse window too short, skipping");
            notifier.notify("Too little time between the last entry and now").await?;
            return Ok(WarehouseOutcome::SkippedTooSoon);
        }
        Err(err) => return Err(err),
    };

    let query = build_query(projects, begin, end);
    info!(%begin, %end, "estimating warehouse query");
    let estimated = warehouse.estimate_bytes(&query).await?;
    if let Err(err) = guard.check(processed, estimated) {
        notifier
            .notify(&format!(
                "The estimated download size is more than the limit. Skip the update. \
                 Currently processed bytes: {}. Estimated bytes to processed query: {}. Limit: {}.",
                human_bytes(processed),
                human_bytes(estimated),
                human_bytes(guard.limit)
            ))
            .await?;
        return Err(err);
    }

    let outcome = warehouse.run_query(&query).await?;
    let mut batch = ctx.store.batch(ctx.batch_size);
    let mut rows = 0usize;
    let mut skipped = 0usize;
    for row in &outcome.rows {
        let download = match download_from_row(row) {
            Ok(download) => download,
            Err(err) => {
                warn!(file = %row.file_name, %err, "skipping download with unparseable file name");
                skipped += 1;
                continue;
            }
        };
        insert_download(batch.conn().await?, &download).await?;
        batch.record(1).await?;
        rows += 1;
    }
    batch.finish().await?;

    let mut message = format!(
        "Downloaded data from big query. Processed bytes {}. \
         This makes total processed bytes growth from {} to {}. \
         The estimated size of the query was {}.",
        human_bytes(outcome.bytes_processed),
        human_bytes(processed),
        human_bytes(processed.saturating_add(outcome.bytes_processed)),
        human_bytes(estimated)
    );
    if skipped > 0 {
        message.push_str(&format!(" Skipped {skipped} rows with unparseable file names."));
    }
    notifier.notify(&message).await?;

    Ok(WarehouseOutcome::Inserted {
        rows,
        skipped,
        bytes_processed: outcome.bytes_processed,
    })
}
