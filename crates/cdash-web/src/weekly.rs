//! Markdown digest of last week's pull request and issue activity.

use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use sqlx::SqlitePool;

type Timestamp = DateTime<Utc>;

/// Previous full week: Monday 00:00:00 to Sunday 23:59:59.
pub fn last_week(now: Timestamp) -> (Timestamp, Timestamp) {
    let this_monday = now.date_naive() - Duration::days(i64::from(now.weekday().num_days_from_monday()));
    let start = (this_monday - Duration::days(7)).and_time(NaiveTime::MIN).and_utc();
    let end = start + Duration::days(7) - Duration::seconds(1);
    (start, end)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemKind {
    PullRequest,
    Issue,
}

impl ItemKind {
    fn url_segment(self) -> &'static str {
        match self {
            Self::PullRequest => "pull",
            Self::Issue => "issues",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct Item {
    owner: String,
    name: String,
    number: i64,
    title: String,
    user: String,
    close_time: Option<Timestamp>,
    merge_time: Option<Timestamp>,
}

impl Item {
    fn book(&self, kind: ItemKind, end: Timestamp) -> &'static str {
        let closed = self.close_time.is_some_and(|t| t < end);
        match kind {
            ItemKind::PullRequest if self.merge_time.is_some_and(|t| t < end) => "📗",
            ItemKind::PullRequest if closed => "📕",
            ItemKind::Issue if closed => "📗",
            _ => "📖",
        }
    }

    fn describe(&self, kind: ItemKind, end: Timestamp) -> String {
        format!(
            "{book} [{owner}/{name}#{number}](https://github.com/{owner}/{name}/{segment}/{number}) {title} ({user})",
            book = self.book(kind, end),
            owner = self.owner,
            name = self.name,
            number = self.number,
            segment = kind.url_segment(),
            title = self.title,
            user = self.user,
        )
    }
}

const PR_COLUMNS: &str = "SELECT p.repository_user AS owner, p.repository_name AS name, \
     p.pull_request AS number, p.title, p.user, p.close_time, p.merge_time \
     FROM github_pull_requests p WHERE ";

const ISSUE_COLUMNS: &str = "SELECT i.repository_user AS owner, i.repository_name AS name, \
     i.issue AS number, i.title, i.user, i.close_time, NULL AS merge_time \
     FROM github_issues i WHERE ";

const UPDATED_PR: &str = r#"
    p.open_time < ? AND p.close_time IS NULL AND (
        EXISTS (SELECT 1 FROM github_pr_reviews r
                WHERE r.repository_user = p.repository_user AND r.repository_name = p.repository_name
                  AND r.pr_num = p.pull_request AND r.date BETWEEN ? AND ?)
        OR EXISTS (SELECT 1 FROM github_pr_comments c
                WHERE c.repository_user = p.repository_user AND c.repository_name = p.repository_name
                  AND c.pr_num = p.pull_request AND c.date BETWEEN ? AND ?)
        OR EXISTS (SELECT 1 FROM github_pr_commits m
                WHERE m.repository_user = p.repository_user AND m.repository_name = p.repository_name
                  AND m.pr_num = p.pull_request AND m.date BETWEEN ? AND ?)
    )
"#;

const UPDATED_ISSUE: &str = r#"
    i.open_time < ? AND i.close_time IS NULL AND EXISTS (
        SELECT 1 FROM github_issue_comments c
        WHERE c.repository_user = i.repository_user AND c.repository_name = i.repository_name
          AND c.issue = i.issue AND c.date BETWEEN ? AND ?
    )
"#;

struct Section {
    heading: &'static str,
    kind: ItemKind,
    condition: &'static str,
    binds: Vec<Timestamp>,
}

fn sections(start: Timestamp, end: Timestamp) -> Vec<Section> {
    use ItemKind::{Issue, PullRequest};
    vec![
        Section {
            heading: "## New Pull Requests\n",
            kind: PullRequest,
            condition: "p.open_time > ? AND p.open_time < ?",
            binds: vec![start, end],
        },
        Section {
            heading: "\n## Updated Pull Requests (state unchanged)\n",
            kind: PullRequest,
            condition: UPDATED_PR,
            binds: vec![start, start, end, start, end, start, end],
        },
        Section {
            heading: "\n## Merged Pull Requests\n",
            kind: PullRequest,
            condition: "p.merge_time > ? AND p.merge_time < ? AND p.open_time < ?",
            binds: vec![start, end, start],
        },
        Section {
            heading: "\n## Closed Pull Requests (unmerged)\n",
            kind: PullRequest,
            condition: "p.close_time > ? AND p.close_time < ? AND p.open_time < ? AND p.merge_time IS NULL",
            binds: vec![start, end, start],
        },
        Section {
            heading: "\n## New Issues\n",
            kind: Issue,
            condition: "i.open_time > ? AND i.open_time < ?",
            binds: vec![start, end],
        },
        Section {
            heading: "\n## Updated Issues (state unchanged)\n",
            kind: Issue,
            condition: UPDATED_ISSUE,
            binds: vec![start, start, end],
        },
        Section {
            heading: "\n## Closed Issues\n",
            kind: Issue,
            condition: "i.close_time > ? AND i.close_time < ? AND i.open_time < ?",
            binds: vec![start, end, start],
        },
    ]
}

async fn fetch_items(pool: &SqlitePool, section: &Section) -> Result<Vec<Item>> {
    let columns = match section.kind {
        ItemKind::PullRequest => PR_COLUMNS,
        ItemKind::Issue => ISSUE_COLUMNS,
    };
    let sql = format!("{columns}{} ORDER BY 1, 2, 3", section.condition);
    let mut query = sqlx::query_as::<_, Item>(&sql);
    for bind in &section.binds {
        query = query.bind(*bind);
    }
    Ok(query.fetch_all(pool).await?)
}

/// Core developers with a comment, review or commit inside the window, sorted.
pub async fn active_core_devs<S: AsRef<str>>(
    pool: &SqlitePool,
    core_devs: &[S],
    start: Timestamp,
    end: Timestamp,
) -> Result<Vec<String>> {
    let mut query = sqlx::query_scalar::<_, String>(
        r#"
        SELECT user FROM github_pr_comments WHERE date BETWEEN ? AND ?
        UNION SELECT user FROM github_pr_reviews WHERE date BETWEEN ? AND ?
        UNION SELECT user FROM github_pr_commits WHERE date BETWEEN ? AND ?
        UNION SELECT user FROM github_issue_comments WHERE date BETWEEN ? AND ?
        "#,
    );
    for _ in 0..4 {
        query = query.bind(start).bind(end);
    }
    let mut users: Vec<String> = query
        .fetch_all(pool)
        .await?
        .into_iter()
        .filter(|u| core_devs.iter().any(|c| c.as_ref() == u))
        .collect();
    users.sort();
    Ok(users)
}

/// Summary lines for the week before `now`; empty sections are left out.
pub async fn weekly_summary_lines<S: AsRef<str>>(
    pool: &SqlitePool,
    core_devs: &[S],
    now: Timestamp,
) -> Result<Vec<String>> {
    let (start, end) = last_week(now);
    let mut lines = vec![format!(
        "# Weekly Summary {}-{}\n",
        start.date_naive(),
        end.date_naive()
    )];

    for section in sections(start, end) {
        let items = fetch_items(pool, &section).await?;
        if items.is_empty() {
            continue;
        }
        lines.push(section.heading.to_string());
        lines.extend(items.iter().map(|item| format!(" - {}", item.describe(section.kind, end))));
    }

    let devs = active_core_devs(pool, core_devs, start, end).await?;
    if !devs.is_empty() {
        lines.push("\n## Core-devs active in repositories\n".to_string());
        lines.push(devs.join(", "));
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{now, seeded_store, ts};

    #[test]
    fn window_is_previous_monday_to_sunday() {
        let (start, end) = last_week(ts("2024-06-12T08:30:00Z"));
        assert_eq!(start, ts("2024-06-03T00:00:00Z"));
        assert_eq!(end, ts("2024-06-09T23:59:59Z"));

        // On a Monday the window still ends the day before.
        let (start, _) = last_week(ts("2024-06-10T00:00:00Z"));
        assert_eq!(start, ts("2024-06-03T00:00:00Z"));
    }

    #[test]
    fn books_follow_state_at_window_end() {
        let end = ts("2024-06-09T23:59:59Z");
        let item = Item {
            owner: "napari".into(),
            name: "napari".into(),
            number: 6,
            title: "Add points".into(),
            user: "bob".into(),
            close_time: Some(ts("2024-06-06T00:00:00Z")),
            merge_time: Some(ts("2024-06-06T00:00:00Z")),
        };
        assert_eq!(
            item.describe(ItemKind::PullRequest, end),
            "📗 [napari/napari#6](https://github.com/napari/napari/pull/6) Add points (bob)"
        );
        let unmerged = Item {
            merge_time: None,
            ..item.clone()
        };
        assert_eq!(unmerged.book(ItemKind::PullRequest, end), "📕");
        assert_eq!(unmerged.book(ItemKind::Issue, end), "📗");
        let later = Item {
            close_time: Some(ts("2024-06-11T00:00:00Z")),
            merge_time: None,
            ..item
        };
        assert_eq!(later.book(ItemKind::Issue, end), "📖");
        assert!(later.describe(ItemKind::Issue, end).contains("/issues/6"));
    }

    #[tokio::test]
    async fn summary_lists_each_section() {
        let (_dir, store) = seeded_store().await;
        let lines = weekly_summary_lines(store.pool(), &["alice", "carol"], now()).await.unwrap();

        let expected = [
            "# Weekly Summary 2024-06-03-2024-06-09\n",
            "## New Pull Requests\n",
            " - 📖 [napari/napari#4](https://github.com/napari/napari/pull/4) Add shapes (carol)",
            "\n## Updated Pull Requests (state unchanged)\n",
            " - 📖 [napari/napari#7](https://github.com/napari/napari/pull/7) Refactor layers (carol)",
            "\n## Merged Pull Requests\n",
            " - 📗 [napari/napari#6](https://github.com/napari/napari/pull/6) Add points (bob)",
            "\n## Closed Pull Requests (unmerged)\n",
            " - 📕 [napari/napari#5](https://github.com/napari/napari/pull/5) Try vispy (alice)",
            "\n## New Issues\n",
            " - 📖 [napari/napari#2](https://github.com/napari/napari/issues/2) Crash on start (bob)",
            "\n## Updated Issues (state unchanged)\n",
            " - 📖 [napari/napari#3](https://github.com/napari/napari/issues/3) Docs typo (carol)",
            "\n## Closed Issues\n",
            " - 📗 [napari/napari#1](https://github.com/napari/napari/issues/1) Slow rendering (alice)",
            "\n## Core-devs active in repositories\n",
            "alice",
        ];
        assert_eq!(lines, expected);
    }

    #[tokio::test]
    async fn quiet_week_has_only_the_title() {
        let (_dir, store) = seeded_store().await;
        let lines = weekly_summary_lines(store.pool(), &["alice"], ts("2025-01-15T00:00:00Z"))
            .await
            .unwrap();
        assert_eq!(lines, vec!["# Weekly Summary 2025-01-06-2025-01-12\n".to_string()]);
    }
}
