use cdash_adapters::forum::{ForumClient, ForumTopic};
use sqlx::sqlite::SqliteConnection;

use crate::db::{ensure, ForumTag, ForumUser, StoreResult};
use crate::progress::{emit, EntityKind, SyncCounts, SyncProgress};
use crate::{SyncContext, SyncResult};

/// Walks the latest-topic listing until an empty page, inserting new topics
/// and refreshing activity, tags and posters of known ones.
pub async fn sync_forum(ctx: &SyncContext<'_>, client: &ForumClient) -> SyncResult<SyncCounts> {
    let scope = "forum";
    ctx.started(EntityKind::Forum, scope);
    let result = forum_inner(ctx, client).await;
    ctx.finish(EntityKind::Forum, scope, result)
}

async fn forum_inner(ctx: &SyncContext<'_>, client: &ForumClient) -> SyncResult<SyncCounts> {
    let mut counts = SyncCounts::default();
    let mut batch = ctx.store.batch(ctx.batch_size);

    let mut page = 1;
    loop {
        emit(
            ctx.on_progress,
            SyncProgress::FetchingPage {
                entity: EntityKind::Forum,
                scope: "forum".into(),
                page,
            },
        );
        let listing = client.latest_page(page).await?;
        if listing.topics.is_empty() {
            break;
        }

        let conn = batch.conn().await?;
        for user in &listing.users {
            ensure(
                conn,
                &ForumUser {
                    id: user.id,
                    username: &user.username,
                    name: user.name.as_deref(),
                },
            )
            .await?;
        }

        for topic in &listing.topics {
            let known: Option<i64> = sqlx::query_scalar("SELECT id FROM forum_topics WHERE id = ?")
                .bind(topic.id)
                .fetch_optional(&mut *conn)
                .await?;
            if known.is_some() {
                update_topic(conn, topic).await?;
                counts.updated += 1;
            } else {
                insert_topic(conn, topic).await?;
                counts.inserted += 1;
            }
            replace_topic_links(conn, topic).await?;
        }

        batch.record(listing.topics.len()).await?;
        emit(
            ctx.on_progress,
            SyncProgress::Merged {
                entity: EntityKind::Forum,
                scope: "forum".into(),
                page,
                records: listing.topics.len(),
            },
        );
        page += 1;
    }

    batch.finish().await?;
    Ok(counts)
}

async fn insert_topic(conn: &mut SqliteConnection, topic: &ForumTopic) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO forum_topics (id, title, fancy_title, slug, created_at, last_posted_at, post_count)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(topic.id)
    .bind(&topic.title)
    .bind(topic.fancy_title.as_deref().unwrap_or(&topic.title))
    .bind(topic.slug.as_deref().unwrap_or_default())
    .bind(topic.created_at)
    .bind(topic.last_posted_at)
    .bind(topic.posts_count)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn update_topic(conn: &mut SqliteConnection, topic: &ForumTopic) -> StoreResult<()> {
    sqlx::query("UPDATE forum_topics SET last_posted_at = ?, post_count = ? WHERE id = ?")
        .bind(topic.last_posted_at)
        .bind(topic.posts_count)
        .bind(topic.id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn replace_topic_links(conn: &mut SqliteConnection, topic: &ForumTopic) -> StoreResult<()> {
    sqlx::query("DELETE FROM forum_tag_to_topic WHERE topic_id = ?")
        .bind(topic.id)
        .execute(&mut *conn)
        .await?;
    for tag in &topic.tags {
        ensure(conn, &ForumTag(tag.name())).await?;
        sqlx::query("INSERT INTO forum_tag_to_topic (tag_name, topic_id) VALUES (?, ?) ON CONFLICT DO NOTHING")
            .bind(tag.name())
            .bind(topic.id)
            .execute(&mut *conn)
            .await?;
    }

    sqlx::query("DELETE FROM forum_user_to_topic WHERE topic_id = ?")
        .bind(topic.id)
        .execute(&mut *conn)
        .await?;
    // Posters missing from the page's user list are not linked.
    for poster in &topic.posters {
        sqlx::query(
            r#"
            INSERT INTO forum_user_to_topic (user_id, topic_id)
            SELECT id, ? FROM forum_users WHERE id = ?
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(topic.id)
        .bind(poster.user_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{count, scratch_store};
    use crate::test_support::{ctx, fetcher};
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn topic(posts: i64, tags: serde_json::Value) -> serde_json::Value {
        json!({
            "id": 42,
            "title": "Layer opacity",
            "fancy_title": "Layer opacity",
            "slug": "layer-opacity",
            "created_at": "2024-05-01T10:00:00.000Z",
            "last_posted_at": "2024-05-03T10:00:00.000Z",
            "posts_count": posts,
            "tags": tags,
            "posters": [{"user_id": 1}, {"user_id": 99}]
        })
    }

    async fn mount_pages(server: &MockServer, first: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/latest.json"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "users": [{"id": 1, "username": "jni", "name": "Juan"}],
                "topic_list": {"topics": [first]}
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/latest.json"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "users": [], "topic_list": {"topics": []}
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn topics_are_inserted_then_refreshed() {
        let (_dir, store) = scratch_store().await;

        let server = MockServer::start().await;
        mount_pages(&server, topic(3, json!(["napari", "plugins"]))).await;
        let client = ForumClient::new(fetcher(), &format!("{}/latest.json", server.uri()));
        let counts = sync_forum(&ctx(&store), &client).await.unwrap();
        assert_eq!(counts.inserted, 1);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM forum_tag_to_topic").await, 2);
        // The unknown poster 99 is not linked.
        assert_eq!(count(&store, "SELECT COUNT(*) FROM forum_user_to_topic").await, 1);

        let server = MockServer::start().await;
        mount_pages(&server, topic(5, json!([{"name": "napari"}]))).await;
        let client = ForumClient::new(fetcher(), &format!("{}/latest.json", server.uri()));
        let counts = sync_forum(&ctx(&store), &client).await.unwrap();
        assert_eq!(counts.updated, 1);
        assert_eq!(count(&store, "SELECT post_count FROM forum_topics WHERE id = 42").await, 5);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM forum_tag_to_topic").await, 1);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM forum_tags").await, 2);
    }
}
