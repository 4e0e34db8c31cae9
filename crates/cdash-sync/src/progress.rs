//! Progress events for entity syncs.
//!
//! Every entity sync walks the same states: it starts, fetches pages, may be
//! throttled, merges each page and ends done or failed. Callers observe these
//! transitions through an optional callback.

use tracing::{info, warn};

/// Kind of entity being synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Stars,
    PullRequests,
    Issues,
    Artifacts,
    Pepy,
    PypiStats,
    Releases,
    Conda,
    Forum,
    Warehouse,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stars => "stars",
            Self::PullRequests => "pull_requests",
            Self::Issues => "issues",
            Self::Artifacts => "artifacts",
            Self::Pepy => "pepy",
            Self::PypiStats => "pypistats",
            Self::Releases => "releases",
            Self::Conda => "conda",
            Self::Forum => "forum",
            Self::Warehouse => "warehouse",
        }
    }
}

#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum SyncProgress {
    /// A sync for `scope` (repository or package set) is about to start.
    Started { entity: EntityKind, scope: String },

    /// Requesting a page (1-indexed).
    FetchingPage {
        entity: EntityKind,
        scope: String,
        page: u32,
    },

    /// A request to `source` was throttled; the fetch sleeps until the reset
    /// and then repeats the same page.
    RateLimited { source: String, wait_secs: u64 },

    /// Merged a page of records into the store.
    Merged {
        entity: EntityKind,
        scope: String,
        page: u32,
        records: usize,
    },

    /// Sync finished successfully.
    Done {
        entity: EntityKind,
        scope: String,
        inserted: usize,
        updated: usize,
        skipped: usize,
    },

    /// Sync aborted; already committed batches stay in place.
    Failed {
        entity: EntityKind,
        scope: String,
        error: String,
    },
}

/// Callback type for progress reporting.
pub type ProgressCallback = Box<dyn Fn(SyncProgress) + Send + Sync>;

pub fn emit(on_progress: Option<&ProgressCallback>, event: SyncProgress) {
    if let Some(cb) = on_progress {
        cb(event);
    }
}

/// Callback that writes every event to the log.
pub fn logging_callback() -> ProgressCallback {
    Box::new(|event| match event {
        SyncProgress::Started { entity, scope } => {
            info!(entity = entity.as_str(), %scope, "sync started");
        }
        SyncProgress::FetchingPage { entity, scope, page } => {
            tracing::debug!(entity = entity.as_str(), %scope, page, "fetching page");
        }
        SyncProgress::RateLimited { source, wait_secs } => {
            warn!(%source, wait_secs, "rate limited, waiting for reset");
        }
        SyncProgress::Merged {
            entity,
            scope,
            page,
            records,
        } => {
            tracing::debug!(entity = entity.as_str(), %scope, page, records, "merged page");
        }
        SyncProgress::Done {
            entity,
            scope,
            inserted,
            updated,
            skipped,
        } => {
            info!(entity = entity.as_str(), %scope, inserted, updated, skipped, "sync done");
        }
        SyncProgress::Failed { entity, scope, error } => {
            warn!(entity = entity.as_str(), %scope, %error, "sync failed");
        }
    })
}

/// Counters accumulated while merging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounts {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

impl SyncCounts {
    pub fn done(&self, entity: EntityKind, scope: &str) -> SyncProgress {
        SyncProgress::Done {
            entity,
            scope: scope.to_string(),
            inserted: self.inserted,
            updated: self.updated,
            skipped: self.skipped,
        }
    }
}
