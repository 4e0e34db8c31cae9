//! Incremental sync of code-host entities: stars, pull requests, issues and
//! release artifact downloads.

use std::collections::BTreeSet;

use cdash_adapters::github::{
    commit_pages, login_or_ghost, CodeHost, RemoteIssue, RemoteLabel, RemotePullRequest, PER_PAGE,
};
use cdash_core::{is_automatic_pr_title, is_bot, Platform, RepoRef};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteConnection;
use tracing::{info, warn};

use crate::db::{ensure, ensure_repository, GithubUser, Label, Release, StoreResult};
use crate::progress::{emit, EntityKind, SyncCounts, SyncProgress};
use crate::{SyncContext, SyncResult};

const PAGE_LEN: usize = PER_PAGE as usize;

/// Brings the star table of `repo` in line with the remote star count.
///
/// Equal counts mean nothing to do. A local count above the remote one is
/// drift: the stored stars are dropped and fetched again from scratch.
pub async fn sync_stars<H: CodeHost + ?Sized>(ctx: &SyncContext<'_>, host: &H, repo: &RepoRef) -> SyncResult<SyncCounts> {
    let scope = repo.full_name();
    ctx.started(EntityKind::Stars, &scope);
    let result = stars_inner(ctx, host, repo, &scope).await;
    ctx.finish(EntityKind::Stars, &scope, result)
}

async fn stars_inner<H: CodeHost + ?Sized>(
    ctx: &SyncContext<'_>,
    host: &H,
    repo: &RepoRef,
    scope: &str,
) -> SyncResult<SyncCounts> {
    let mut counts = SyncCounts::default();
    let remote = host.repository(repo).await?;
    let mut batch = ctx.store.batch(ctx.batch_size);

    let conn = batch.conn().await?;
    ensure_repository(conn, repo).await?;
    let local: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM github_stars WHERE repository_user = ? AND repository_name = ?",
    )
    .bind(&repo.owner)
    .bind(&repo.name)
    .fetch_one(&mut *conn)
    .await?;

    if local == remote.stargazers_count {
        counts.skipped = local as usize;
        batch.finish().await?;
        return Ok(counts);
    }
    if local > remote.stargazers_count {
        warn!(repo = %scope, local, remote = remote.stargazers_count, "star drift, resetting stored stars");
        sqlx::query("DELETE FROM github_stars WHERE repository_user = ? AND repository_name = ?")
            .bind(&repo.owner)
            .bind(&repo.name)
            .execute(&mut *conn)
            .await?;
    }

    let mut page = 1;
    loop {
        emit(
            ctx.on_progress,
            SyncProgress::FetchingPage {
                entity: EntityKind::Stars,
                scope: scope.to_string(),
                page,
            },
        );
        let stargazers = host.stargazers_page(repo, page).await?;
        let len = stargazers.len();

        for star in &stargazers {
            let login = login_or_ghost(&star.user);
            let conn = batch.conn().await?;
            ensure(conn, &GithubUser(&login)).await?;
            let result = sqlx::query(
                r#"
                INSERT INTO github_stars (repository_user, repository_name, user, datetime, date)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(&repo.owner)
            .bind(&repo.name)
            .bind(&login)
            .bind(star.starred_at)
            .bind(star.starred_at.date_naive())
            .execute(&mut *conn)
            .await?;
            if result.rows_affected() == 1 {
                counts.inserted += 1;
            } else {
                counts.skipped += 1;
            }
        }
        batch.record(len).await?;
        emit(
            ctx.on_progress,
            SyncProgress::Merged {
                entity: EntityKind::Stars,
                scope: scope.to_string(),
                page,
                records: len,
            },
        );

        if len < PAGE_LEN {
            break;
        }
        page += 1;
    }

    batch.finish().await?;
    Ok(counts)
}

enum Stored {
    Missing,
    Unchanged,
    Changed,
}

async fn stored_state(
    conn: &mut SqliteConnection,
    sql: &str,
    repo: &RepoRef,
    number: i64,
    updated_at: DateTime<Utc>,
) -> StoreResult<Stored> {
    let stored: Option<DateTime<Utc>> = sqlx::query_scalar(sql)
        .bind(&repo.owner)
        .bind(&repo.name)
        .bind(number)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(match stored {
        None => Stored::Missing,
        Some(ts) if ts == updated_at => Stored::Unchanged,
        Some(_) => Stored::Changed,
    })
}

/// Replaces the label set of one pull request or issue.
async fn replace_labels(
    conn: &mut SqliteConnection,
    table: &str,
    number_column: &str,
    repo: &RepoRef,
    number: i64,
    labels: &[RemoteLabel],
) -> StoreResult<()> {
    sqlx::query(&format!(
        "DELETE FROM {table} WHERE repository_user = ? AND repository_name = ? AND {number_column} = ?"
    ))
    .bind(&repo.owner)
    .bind(&repo.name)
    .bind(number)
    .execute(&mut *conn)
    .await?;

    let insert = format!(
        "INSERT INTO {table} (label, repository_user, repository_name, {number_column}) \
         VALUES (?, ?, ?, ?) ON CONFLICT DO NOTHING"
    );
    for label in labels {
        ensure(conn, &Label(&label.name)).await?;
        sqlx::query(&insert)
            .bind(&label.name)
            .bind(&repo.owner)
            .bind(&repo.name)
            .bind(number)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Syncs every pull request of `repo`, refetching children only for pull
/// requests whose remote modification time moved.
pub async fn sync_pull_requests<H: CodeHost + ?Sized>(
    ctx: &SyncContext<'_>,
    host: &H,
    repo: &RepoRef,
) -> SyncResult<SyncCounts> {
    let scope = repo.full_name();
    ctx.started(EntityKind::PullRequests, &scope);
    let result = pull_requests_inner(ctx, host, repo, &scope).await;
    ctx.finish(EntityKind::PullRequests, &scope, result)
}

async fn pull_requests_inner<H: CodeHost + ?Sized>(
    ctx: &SyncContext<'_>,
    host: &H,
    repo: &RepoRef,
    scope: &str,
) -> SyncResult<SyncCounts> {
    let mut counts = SyncCounts::default();
    let mut batch = ctx.store.batch(ctx.batch_size);
    ensure_repository(batch.conn().await?, repo).await?;

    let mut page = 1;
    loop {
        emit(
            ctx.on_progress,
            SyncProgress::FetchingPage {
                entity: EntityKind::PullRequests,
                scope: scope.to_string(),
                page,
            },
        );
        let pulls = host.pull_requests_page(repo, page).await?;
        let len = pulls.len();

        for pr in &pulls {
            let author = login_or_ghost(&pr.user);
            let conn = batch.conn().await?;
            ensure(conn, &GithubUser(&author)).await?;
            let state = stored_state(
                conn,
                r#"
                SELECT last_modification_time FROM github_pull_requests
                WHERE repository_user = ? AND repository_name = ? AND pull_request = ?
                "#,
                repo,
                pr.number,
                pr.updated_at,
            )
            .await?;

            match state {
                Stored::Unchanged => {
                    counts.skipped += 1;
                    continue;
                }
                Stored::Missing => {
                    insert_pull_request(conn, repo, pr, &author).await?;
                    counts.inserted += 1;
                }
                Stored::Changed => {
                    update_pull_request(conn, repo, pr).await?;
                    counts.updated += 1;
                }
            }
            replace_labels(
                conn,
                "github_pr_to_labels_table",
                "pull_request_num",
                repo,
                pr.number,
                &pr.labels,
            )
            .await?;

            let children = sync_pull_request_children(ctx, host, &mut batch, repo, pr, &author).await?;
            batch.record(1 + children).await?;
        }
        emit(
            ctx.on_progress,
            SyncProgress::Merged {
                entity: EntityKind::PullRequests,
                scope: scope.to_string(),
                page,
                records: len,
            },
        );

        if len < PAGE_LEN {
            break;
        }
        page += 1;
    }

    batch.finish().await?;
    Ok(counts)
}

async fn insert_pull_request(
    conn: &mut SqliteConnection,
    repo: &RepoRef,
    pr: &RemotePullRequest,
    author: &str,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO github_pull_requests (
            repository_user, repository_name, pull_request, user, open_time,
            close_time, merge_time, last_modification_time, title, description
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&repo.owner)
    .bind(&repo.name)
    .bind(pr.number)
    .bind(author)
    .bind(pr.created_at)
    .bind(pr.closed_at)
    .bind(pr.merged_at)
    .bind(pr.updated_at)
    .bind(&pr.title)
    .bind(&pr.body)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn update_pull_request(conn: &mut SqliteConnection, repo: &RepoRef, pr: &RemotePullRequest) -> StoreResult<()> {
    sqlx::query(
        r#"
        UPDATE github_pull_requests
        SET close_time = ?, merge_time = ?, last_modification_time = ?, title = ?, description = ?
        WHERE repository_user = ? AND repository_name = ? AND pull_request = ?
        "#,
    )
    .bind(pr.closed_at)
    .bind(pr.merged_at)
    .bind(pr.updated_at)
    .bind(&pr.title)
    .bind(&pr.body)
    .bind(&repo.owner)
    .bind(&repo.name)
    .bind(pr.number)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Merges commits, reviews and comments of one pull request. Returns the
/// number of child records seen.
async fn sync_pull_request_children<H: CodeHost + ?Sized>(
    ctx: &SyncContext<'_>,
    host: &H,
    batch: &mut crate::db::BatchWriter,
    repo: &RepoRef,
    pr: &RemotePullRequest,
    author: &str,
) -> SyncResult<usize> {
    let mut seen = 0usize;
    let mut commit_authors = BTreeSet::new();

    let commit_count = host.pull_request_commit_count(repo, pr.number).await?;
    for page in 1..=commit_pages(commit_count) {
        let commits = host.pull_request_commits_page(repo, pr.number, page).await?;
        seen += commits.len();
        for commit in &commits {
            // Commits without a linked account belong to the pull request author.
            let login = commit
                .author
                .as_ref()
                .map(|u| u.login.clone())
                .unwrap_or_else(|| author.to_string());
            let date = commit.authored_at().unwrap_or(pr.updated_at);
            let conn = batch.conn().await?;
            ensure(conn, &GithubUser(&login)).await?;
            sqlx::query(
                r#"
                INSERT INTO github_pr_commits (sha, user, date, repository_user, repository_name, pr_num)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(sha) DO NOTHING
                "#,
            )
            .bind(&commit.sha)
            .bind(&login)
            .bind(date)
            .bind(&repo.owner)
            .bind(&repo.name)
            .bind(pr.number)
            .execute(&mut *conn)
            .await?;
            commit_authors.insert(login);
        }
    }

    if !commit_authors.contains(author) && !is_bot(author, ctx.bots) && !is_automatic_pr_title(&pr.title) {
        warn!(
            repo = %repo,
            pull_request = pr.number,
            %author,
            "pull request author is not among commit authors"
        );
    }

    let reviews = host.pull_request_reviews(repo, pr.number).await?;
    for review in &reviews {
        let Some(submitted_at) = review.submitted_at else {
            continue;
        };
        if review.state == "PENDING" {
            continue;
        }
        seen += 1;
        let login = login_or_ghost(&review.user);
        let conn = batch.conn().await?;
        ensure(conn, &GithubUser(&login)).await?;
        sqlx::query(
            r#"
            INSERT INTO github_pr_reviews (id, user, date, state, repository_user, repository_name, pr_num)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET state = excluded.state
            "#,
        )
        .bind(review.id)
        .bind(&login)
        .bind(submitted_at)
        .bind(&review.state)
        .bind(&repo.owner)
        .bind(&repo.name)
        .bind(pr.number)
        .execute(&mut *conn)
        .await?;
    }

    let comments = host.pull_request_comments(repo, pr.number).await?;
    seen += comments.len();
    for comment in &comments {
        let login = login_or_ghost(&comment.user);
        let conn = batch.conn().await?;
        ensure(conn, &GithubUser(&login)).await?;
        sqlx::query(
            r#"
            INSERT INTO github_pr_comments (id, user, date, repository_user, repository_name, pr_num)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(comment.id)
        .bind(&login)
        .bind(comment.created_at)
        .bind(&repo.owner)
        .bind(&repo.name)
        .bind(pr.number)
        .execute(&mut *conn)
        .await?;
    }

    Ok(seen)
}

/// Syncs issues of `repo`; pull requests listed by the issues endpoint are
/// skipped.
pub async fn sync_issues<H: CodeHost + ?Sized>(ctx: &SyncContext<'_>, host: &H, repo: &RepoRef) -> SyncResult<SyncCounts> {
    let scope = repo.full_name();
    ctx.started(EntityKind::Issues, &scope);
    let result = issues_inner(ctx, host, repo, &scope).await;
    ctx.finish(EntityKind::Issues, &scope, result)
}

async fn issues_inner<H: CodeHost + ?Sized>(
    ctx: &SyncContext<'_>,
    host: &H,
    repo: &RepoRef,
    scope: &str,
) -> SyncResult<SyncCounts> {
    let mut counts = SyncCounts::default();
    let mut batch = ctx.store.batch(ctx.batch_size);
    ensure_repository(batch.conn().await?, repo).await?;

    let mut page = 1;
    loop {
        emit(
            ctx.on_progress,
            SyncProgress::FetchingPage {
                entity: EntityKind::Issues,
                scope: scope.to_string(),
                page,
            },
        );
        let issues = host.issues_page(repo, page).await?;
        let len = issues.len();

        for issue in issues.iter().filter(|i| !i.is_pull_request()) {
            let author = login_or_ghost(&issue.user);
            let conn = batch.conn().await?;
            ensure(conn, &GithubUser(&author)).await?;
            let state = stored_state(
                conn,
                r#"
                SELECT last_modification_time FROM github_issues
                WHERE repository_user = ? AND repository_name = ? AND issue = ?
                "#,
                repo,
                issue.number,
                issue.updated_at,
            )
            .await?;

            match state {
                Stored::Unchanged => {
                    counts.skipped += 1;
                    continue;
                }
                Stored::Missing => {
                    insert_issue(conn, repo, issue, &author).await?;
                    counts.inserted += 1;
                }
                Stored::Changed => {
                    update_issue(conn, repo, issue).await?;
                    counts.updated += 1;
                }
            }
            replace_labels(
                conn,
                "github_issues_to_labels_table",
                "issue_num",
                repo,
                issue.number,
                &issue.labels,
            )
            .await?;

            let comments = host.issue_comments(repo, issue.number).await?;
            for comment in &comments {
                let login = login_or_ghost(&comment.user);
                let conn = batch.conn().await?;
                ensure(conn, &GithubUser(&login)).await?;
                sqlx::query(
                    r#"
                    INSERT INTO github_issue_comments (id, user, date, repository_user, repository_name, issue)
                    VALUES (?, ?, ?, ?, ?, ?)
                    ON CONFLICT(id) DO NOTHING
                    "#,
                )
                .bind(comment.id)
                .bind(&login)
                .bind(comment.created_at)
                .bind(&repo.owner)
                .bind(&repo.name)
                .bind(issue.number)
                .execute(&mut *conn)
                .await?;
            }
            batch.record(1 + comments.len()).await?;
        }
        emit(
            ctx.on_progress,
            SyncProgress::Merged {
                entity: EntityKind::Issues,
                scope: scope.to_string(),
                page,
                records: len,
            },
        );

        if len < PAGE_LEN {
            break;
        }
        page += 1;
    }

    batch.finish().await?;
    Ok(counts)
}

async fn insert_issue(conn: &mut SqliteConnection, repo: &RepoRef, issue: &RemoteIssue, author: &str) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO github_issues (
            repository_user, repository_name, issue, user, open_time,
            close_time, last_modification_time, title, description
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&repo.owner)
    .bind(&repo.name)
    .bind(issue.number)
    .bind(author)
    .bind(issue.created_at)
    .bind(issue.closed_at)
    .bind(issue.updated_at)
    .bind(&issue.title)
    .bind(&issue.body)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn update_issue(conn: &mut SqliteConnection, repo: &RepoRef, issue: &RemoteIssue) -> StoreResult<()> {
    sqlx::query(
        r#"
        UPDATE github_issues
        SET close_time = ?, last_modification_time = ?, title = ?, description = ?
        WHERE repository_user = ? AND repository_name = ? AND issue = ?
        "#,
    )
    .bind(issue.closed_at)
    .bind(issue.updated_at)
    .bind(&issue.title)
    .bind(&issue.body)
    .bind(&repo.owner)
    .bind(&repo.name)
    .bind(issue.number)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Refreshes per-artifact download counters of every stable release.
pub async fn sync_artifact_downloads<H: CodeHost + ?Sized>(
    ctx: &SyncContext<'_>,
    host: &H,
    repo: &RepoRef,
) -> SyncResult<SyncCounts> {
    let scope = repo.full_name();
    ctx.started(EntityKind::Artifacts, &scope);
    let result = artifacts_inner(ctx, host, repo, &scope).await;
    ctx.finish(EntityKind::Artifacts, &scope, result)
}

async fn artifacts_inner<H: CodeHost + ?Sized>(
    ctx: &SyncContext<'_>,
    host: &H,
    repo: &RepoRef,
    scope: &str,
) -> SyncResult<SyncCounts> {
    let mut counts = SyncCounts::default();
    let mut batch = ctx.store.batch(ctx.batch_size);
    ensure_repository(batch.conn().await?, repo).await?;

    let mut page = 1;
    loop {
        emit(
            ctx.on_progress,
            SyncProgress::FetchingPage {
                entity: EntityKind::Artifacts,
                scope: scope.to_string(),
                page,
            },
        );
        let releases = host.releases_page(repo, page).await?;
        let len = releases.len();

        for release in releases.iter().filter(|r| !r.prerelease) {
            let conn = batch.conn().await?;
            ensure(
                conn,
                &Release {
                    repo,
                    tag: &release.tag_name,
                },
            )
            .await?;

            let mut written = 0usize;
            for asset in &release.assets {
                let Some(platform) = Platform::from_artifact_name(&asset.name) else {
                    continue;
                };
                let stored: Option<i64> = sqlx::query_scalar(
                    r#"
                    SELECT download_count FROM github_artifact_downloads
                    WHERE repository_user = ? AND repository_name = ? AND release_tag = ? AND artifact_name = ?
                    "#,
                )
                .bind(&repo.owner)
                .bind(&repo.name)
                .bind(&release.tag_name)
                .bind(&asset.name)
                .fetch_optional(&mut *conn)
                .await?;

                match stored {
                    Some(count) if count == asset.download_count => {
                        counts.skipped += 1;
                        continue;
                    }
                    Some(_) => counts.updated += 1,
                    None => counts.inserted += 1,
                }
                sqlx::query(
                    r#"
                    INSERT INTO github_artifact_downloads (
                        repository_user, repository_name, release_tag, artifact_name, download_count, platform
                    ) VALUES (?, ?, ?, ?, ?, ?)
                    ON CONFLICT(repository_user, repository_name, release_tag, artifact_name)
                    DO UPDATE SET download_count = excluded.download_count, platform = excluded.platform
                    "#,
                )
                .bind(&repo.owner)
                .bind(&repo.name)
                .bind(&release.tag_name)
                .bind(&asset.name)
                .bind(asset.download_count)
                .bind(platform.as_str())
                .execute(&mut *conn)
                .await?;
                written += 1;
            }
            batch.record(1 + written).await?;
        }

        if len < PAGE_LEN {
            break;
        }
        page += 1;
    }

    batch.finish().await?;
    info!(repo = %scope, inserted = counts.inserted, updated = counts.updated, "artifact downloads refreshed");
    Ok(counts)
}
