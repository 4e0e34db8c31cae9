//! Reporting side of the dashboard: aggregation queries, the weekly digest,
//! the static site with its workbook, and a preview server for rendered output.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tracing::info;

pub mod excel;
pub mod render;
pub mod stats;
pub mod weekly;

pub use excel::export_workbook;
pub use render::{collect_dashboard, generate_webpage, Dashboard};
pub use weekly::{last_week, weekly_summary_lines};

const XLSX_CONTENT_TYPE: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

#[derive(Clone)]
pub struct AppState {
    pub site_dir: PathBuf,
}

impl AppState {
    pub fn new(site_dir: impl Into<PathBuf>) -> Self {
        Self {
            site_dir: site_dir.into(),
        }
    }
}

/// Router over a directory produced by [`generate_webpage`].
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/dashboard.js", get(script_handler))
        .route("/dashboard.css", get(style_handler))
        .route("/{file}", get(workbook_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_dir(dir: impl Into<PathBuf>, port: u16) -> anyhow::Result<()> {
    let state = AppState::new(dir);
    info!(dir = %state.site_dir.display(), port, "serving dashboard");
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    match tokio::fs::read_to_string(state.site_dir.join(render::INDEX_FILE)).await {
        Ok(html) => Html(html).into_response(),
        Err(_) => (
            StatusCode::NOT_FOUND,
            Html("Dashboard not rendered yet; run the webpage command first.".to_string()),
        )
            .into_response(),
    }
}

async fn script_handler(State(state): State<Arc<AppState>>) -> Response {
    static_file(&state.site_dir, render::SCRIPT_FILE, "text/javascript; charset=utf-8").await
}

async fn style_handler(State(state): State<Arc<AppState>>) -> Response {
    static_file(&state.site_dir, render::STYLE_FILE, "text/css; charset=utf-8").await
}

async fn workbook_handler(State(state): State<Arc<AppState>>, AxumPath(file): AxumPath<String>) -> Response {
    if !file.ends_with(".xlsx") || file.contains("..") || file.contains('/') {
        return StatusCode::NOT_FOUND.into_response();
    }
    static_file(&state.site_dir, &file, XLSX_CONTENT_TYPE).await
}

async fn static_file(dir: &Path, name: &str, content_type: &'static str) -> Response {
    match tokio::fs::read(dir.join(name)).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, content_type)], bytes).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn site() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("index.html"), "<h1>napari dashboard</h1>").await.unwrap();
        tokio::fs::write(dir.path().join("dashboard.js"), "const DASHBOARD = {};").await.unwrap();
        tokio::fs::write(dir.path().join("napari_dashboard.xlsx"), b"PK").await.unwrap();
        dir
    }

    async fn get(dir: &Path, uri: &str) -> Response {
        app(AppState::new(dir))
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn index_is_served() {
        let dir = site().await;
        let resp = get(dir.path(), "/").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8(body.to_vec()).unwrap().contains("napari dashboard"));
    }

    #[tokio::test]
    async fn assets_carry_content_types() {
        let dir = site().await;
        let script = get(dir.path(), "/dashboard.js").await;
        assert_eq!(script.status(), StatusCode::OK);
        assert_eq!(
            script.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "text/javascript; charset=utf-8"
        );

        let workbook = get(dir.path(), "/napari_dashboard.xlsx").await;
        assert_eq!(workbook.status(), StatusCode::OK);
        assert_eq!(workbook.headers()[header::CONTENT_TYPE].to_str().unwrap(), XLSX_CONTENT_TYPE);

        // Not rendered in this directory.
        assert_eq!(get(dir.path(), "/dashboard.css").await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn only_workbooks_are_exposed() {
        let dir = site().await;
        assert_eq!(get(dir.path(), "/secrets.db").await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unrendered_directory_reports_missing_page() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(get(dir.path(), "/").await.status(), StatusCode::NOT_FOUND);
    }
}
