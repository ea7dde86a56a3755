use super::*;

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn upserting_the_same_email_reuses_the_account() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let first = storage.upsert_user("alice@example.com").await.expect("user");
    let second = storage.upsert_user("alice@example.com").await.expect("user");
    assert_eq!(first.user_id, second.user_id);
    assert_eq!(second.email, "alice@example.com");
}

#[tokio::test]
async fn session_tokens_round_trip_and_revoke() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let principal = storage.upsert_user("bob@example.com").await.expect("user");
    let token = storage
        .create_session(principal.user_id)
        .await
        .expect("session");

    let resolved = storage
        .principal_for_token(&token)
        .await
        .expect("lookup")
        .expect("live session");
    assert_eq!(resolved, principal);

    storage.revoke_session(&token).await.expect("revoke");
    assert!(storage
        .principal_for_token(&token)
        .await
        .expect("lookup")
        .is_none());

    // Revoking again must stay a no-op.
    storage.revoke_session(&token).await.expect("revoke twice");
}

#[tokio::test]
async fn unknown_token_resolves_to_no_session() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    assert!(storage
        .principal_for_token("not-a-token")
        .await
        .expect("lookup")
        .is_none());
}

#[tokio::test]
async fn lists_bookmarks_newest_first() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let owner = storage.upsert_user("carol@example.com").await.expect("user");

    let first = storage
        .insert_bookmark("first", "https://one.example", owner.user_id)
        .await
        .expect("insert");
    let second = storage
        .insert_bookmark("second", "https://two.example", owner.user_id)
        .await
        .expect("insert");
    assert!(second.id > first.id);

    let listed = storage
        .list_bookmarks_newest_first()
        .await
        .expect("listing");
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, second.id);
    assert_eq!(listed[1].id, first.id);
    assert_eq!(listed[0].owner, owner.user_id);
}

#[tokio::test]
async fn delete_reports_whether_a_row_was_removed() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let owner = storage.upsert_user("dan@example.com").await.expect("user");
    let bookmark = storage
        .insert_bookmark("doc", "https://docs.example", owner.user_id)
        .await
        .expect("insert");

    assert!(storage.delete_bookmark(bookmark.id).await.expect("delete"));
    assert!(!storage
        .delete_bookmark(bookmark.id)
        .await
        .expect("second delete"));
    assert!(storage
        .list_bookmarks_newest_first()
        .await
        .expect("listing")
        .is_empty());
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("linkstash_storage_test_{suffix}"));
    let db_path = temp_root.join("nested").join("storage.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}
