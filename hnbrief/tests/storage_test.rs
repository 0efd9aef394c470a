mod support;

use chrono::{Duration, TimeZone, Utc};
use hnbrief::conversations::{list_messages, store_message, ConversationRecorder};
use hnbrief::error::PersistenceError;
use hnbrief::llm::Role;
use hnbrief::storage::{Story, StoryStore};
use support::memory_pool;

fn story(id: i64, score: i64, time: i64) -> Story {
    Story {
        story_id: id,
        title: format!("Story {}", id),
        by: "pg".into(),
        url: format!("https://example.com/{}", id),
        score,
        time,
        story_type: "story".into(),
        descendants: 0,
        summary: format!("Summary {}", id),
        is_published: false,
    }
}

#[tokio::test]
async fn create_get_and_update_score() {
    let store = StoryStore::new(memory_pool().await);
    assert!(!store.exists(1).await.unwrap());
    assert!(matches!(store.get(1).await, Err(PersistenceError::NotFound(1))));

    store.create(&story(1, 10, 1_700_000_000)).await.unwrap();
    assert!(store.exists(1).await.unwrap());

    store.update_score(1, 250).await.unwrap();
    let stored = store.get(1).await.unwrap();
    assert_eq!(stored.score, 250);
    assert_eq!(stored.title, "Story 1");
    assert_eq!(stored.published_at().unwrap().timestamp(), 1_700_000_000);
}

#[tokio::test]
async fn list_by_score_filters_window_and_orders() {
    let store = StoryStore::new(memory_pool().await);
    let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let hours_ago = |h: i64| (now - Duration::hours(h)).timestamp();

    store.create(&story(1, 50, hours_ago(2))).await.unwrap();
    store.create(&story(2, 300, hours_ago(5))).await.unwrap();
    store.create(&story(3, 120, hours_ago(20))).await.unwrap();
    // Outside a one day window.
    store.create(&story(4, 999, hours_ago(30))).await.unwrap();

    let top = store.list_by_score_at(now, 2, 1).await.unwrap();
    let ids: Vec<i64> = top.iter().map(|s| s.story_id).collect();
    assert_eq!(ids, vec![2, 3]);

    let wider = store.list_by_score_at(now, 10, 2).await.unwrap();
    assert_eq!(wider.first().map(|s| s.story_id), Some(4));
    assert_eq!(wider.len(), 4);
}

#[tokio::test]
async fn mark_published_semantics() {
    let store = StoryStore::new(memory_pool().await);
    store.create(&story(1, 1, 1_700_000_000)).await.unwrap();
    store.create(&story(2, 2, 1_700_000_000)).await.unwrap();
    store.create(&story(3, 3, 1_700_000_000)).await.unwrap();

    // Empty input is a no-op, unknown ids are reported.
    store.mark_published(&[], true).await.unwrap();
    assert!(matches!(
        store.mark_published(&[404], true).await,
        Err(PersistenceError::NothingUpdated)
    ));

    store.mark_published(&[1, 3], true).await.unwrap();
    let unpublished: Vec<i64> = store
        .list_unpublished()
        .await
        .unwrap()
        .iter()
        .map(|s| s.story_id)
        .collect();
    assert_eq!(unpublished, vec![2]);

    store.mark_published(&[3], false).await.unwrap();
    assert!(!store.get(3).await.unwrap().is_published);
    assert!(store.get(1).await.unwrap().is_published);
}

#[tokio::test]
async fn messages_are_listed_in_insertion_order() {
    let pool = memory_pool().await;
    store_message(&pool, "conv", Role::User, "question").await.unwrap();
    store_message(&pool, "other", Role::User, "unrelated").await.unwrap();
    store_message(&pool, "conv", Role::Assistant, "answer").await.unwrap();

    let messages = list_messages(&pool, "conv").await.unwrap();
    let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant]);
    assert_eq!(messages[1].content, "answer");
    assert!(list_messages(&pool, "nobody").await.unwrap().is_empty());
}

#[tokio::test]
async fn recorder_handle_reports_write() {
    let pool = memory_pool().await;
    let (recorder, worker) = ConversationRecorder::spawn(pool.clone(), 1);

    let first = recorder.record("conv", Role::User, "one").await;
    let second = recorder.record("conv", Role::Assistant, "two").await;
    let stored = second.wait().await.unwrap();
    assert_eq!(stored.content, "two");
    assert_eq!(first.wait().await.unwrap().role, Role::User);

    drop(recorder);
    worker.await.unwrap();
    assert_eq!(list_messages(&pool, "conv").await.unwrap().len(), 2);
}

#[tokio::test]
async fn recorder_reports_database_failure() {
    let pool = memory_pool().await;
    sqlx::query("DROP TABLE messages").execute(&pool).await.unwrap();
    let (recorder, _worker) = ConversationRecorder::spawn(pool, 4);

    let result = recorder.record("conv", Role::User, "lost").await.wait().await;
    assert!(matches!(result, Err(PersistenceError::Database(_))));
}
