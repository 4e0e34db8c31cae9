//! Workbook export: one worksheet per database table.

use std::path::Path;

use anyhow::Result;
use rust_xlsxwriter::{Format, Workbook, Worksheet};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

/// Worksheet names are capped by the file format.
const MAX_SHEET_NAME: usize = 31;
/// Data rows per sheet, leaving one row for the header.
const MAX_DATA_ROWS: usize = 1_048_575;

const SKIPPED_TABLES: &[&str] = &["sqlite_sequence", "_sqlx_migrations"];

async fn table_names(pool: &SqlitePool) -> Result<Vec<String>> {
    let names: Vec<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .fetch_all(pool)
            .await?;
    Ok(names
        .into_iter()
        .filter(|n| !SKIPPED_TABLES.contains(&n.as_str()))
        .collect())
}

struct TableDump {
    columns: Vec<String>,
    rows: Vec<SqliteRow>,
}

async fn dump_table(pool: &SqlitePool, table: &str) -> Result<TableDump> {
    let columns: Vec<String> = sqlx::query_scalar("SELECT name FROM pragma_table_info(?) ORDER BY cid")
        .bind(table)
        .fetch_all(pool)
        .await?;
    let sql = format!("SELECT * FROM \"{}\"", table.replace('"', "\"\""));
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    Ok(TableDump { columns, rows })
}

fn write_cell(sheet: &mut Worksheet, row: u32, col: u16, record: &SqliteRow, idx: usize) -> Result<()> {
    if let Ok(value) = record.try_get::<Option<i64>, _>(idx) {
        if let Some(value) = value {
            sheet.write_number(row, col, value as f64)?;
        }
    } else if let Ok(Some(value)) = record.try_get::<Option<f64>, _>(idx) {
        sheet.write_number(row, col, value)?;
    } else if let Ok(Some(value)) = record.try_get::<Option<String>, _>(idx) {
        sheet.write_string(row, col, value)?;
    }
    Ok(())
}

fn write_sheet(workbook: &mut Workbook, table: &str, dump: &TableDump, header: &Format) -> Result<()> {
    let name: String = table.chars().take(MAX_SHEET_NAME).collect();
    let sheet = workbook.add_worksheet();
    sheet.set_name(name)?;

    for (col, column) in dump.columns.iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, column, header)?;
    }
    if dump.rows.len() > MAX_DATA_ROWS {
        warn!(table, rows = dump.rows.len(), "table truncated to fit the sheet");
    }
    for (r, record) in dump.rows.iter().take(MAX_DATA_ROWS).enumerate() {
        for col in 0..dump.columns.len() {
            write_cell(sheet, r as u32 + 1, col as u16, record, col)?;
        }
    }
    Ok(())
}

/// Writes every table to `path`. A table that cannot be read is logged and left
/// out; returns the number of sheets written.
pub async fn export_workbook(pool: &SqlitePool, path: &Path) -> Result<usize> {
    let header = Format::new().set_bold();
    let mut workbook = Workbook::new();
    let mut sheets = 0;

    for table in table_names(pool).await? {
        let dump = match dump_table(pool, &table).await {
            Ok(dump) => dump,
            Err(err) => {
                warn!(table = %table, error = %err, "skipping table");
                continue;
            }
        };
        write_sheet(&mut workbook, &table, &dump, &header)?;
        sheets += 1;
    }

    workbook.save(path)?;
    info!(path = %path.display(), sheets, "workbook saved");
    Ok(sheets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::seeded_store;

    #[tokio::test]
    async fn bookkeeping_tables_are_skipped() {
        let (_dir, store) = seeded_store().await;
        let names = table_names(store.pool()).await.unwrap();
        assert!(names.contains(&"github_pull_requests".to_string()));
        assert!(names.contains(&"pypi_downloads_per_python_version".to_string()));
        assert!(!names.iter().any(|n| SKIPPED_TABLES.contains(&n.as_str())));
    }

    #[tokio::test]
    async fn dump_keeps_declared_columns() {
        let (_dir, store) = seeded_store().await;
        let dump = dump_table(store.pool(), "github_stars").await.unwrap();
        assert_eq!(
            dump.columns,
            vec!["repository_user", "repository_name", "user", "datetime", "date"]
        );
        assert_eq!(dump.rows.len(), 3);
    }

    #[tokio::test]
    async fn workbook_has_one_sheet_per_table() {
        let (dir, store) = seeded_store().await;
        let path = dir.path().join("tables.xlsx");
        let sheets = export_workbook(store.pool(), &path).await.unwrap();
        assert_eq!(sheets, table_names(store.pool()).await.unwrap().len());
        assert!(tokio::fs::metadata(&path).await.unwrap().len() > 0);
    }
}
