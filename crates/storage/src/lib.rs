use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use uuid::Uuid;

use shared::domain::{Bookmark, BookmarkId, Principal, UserId};

/// SQLite persistence for the bookmark backend: accounts, opaque session
/// tokens, and the shared bookmark table itself.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id         TEXT PRIMARY KEY,
                email      TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure users table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                token      TEXT PRIMARY KEY,
                user_id    TEXT NOT NULL REFERENCES users(id),
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure sessions table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bookmarks (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                title         TEXT NOT NULL,
                url           TEXT NOT NULL,
                owner_user_id TEXT NOT NULL REFERENCES users(id),
                created_at    TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure bookmarks table exists")?;

        Ok(())
    }

    /// Finds or creates the account for an email address. Sign-in is the only
    /// account-creation path, so the first login mints the user row.
    pub async fn upsert_user(&self, email: &str) -> Result<Principal> {
        let candidate_id = Uuid::new_v4();
        let row = sqlx::query(
            "INSERT INTO users (id, email) VALUES (?, ?)
             ON CONFLICT(email) DO UPDATE SET email=excluded.email
             RETURNING id, email",
        )
        .bind(candidate_id.to_string())
        .bind(email)
        .fetch_one(&self.pool)
        .await?;
        principal_from_row(&row)
    }

    pub async fn create_session(&self, user_id: UserId) -> Result<String> {
        let token = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO sessions (token, user_id) VALUES (?, ?)")
            .bind(&token)
            .bind(user_id.0.to_string())
            .execute(&self.pool)
            .await?;
        Ok(token)
    }

    pub async fn principal_for_token(&self, token: &str) -> Result<Option<Principal>> {
        let row = sqlx::query(
            "SELECT u.id, u.email
             FROM sessions s
             INNER JOIN users u ON u.id = s.user_id
             WHERE s.token = ?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| principal_from_row(&r)).transpose()
    }

    /// Removes a session token. Revoking an unknown token is a no-op.
    pub async fn revoke_session(&self, token: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_bookmark(&self, title: &str, url: &str, owner: UserId) -> Result<Bookmark> {
        let row = sqlx::query(
            "INSERT INTO bookmarks (title, url, owner_user_id, created_at)
             VALUES (?, ?, ?, ?)
             RETURNING id, title, url, owner_user_id, created_at",
        )
        .bind(title)
        .bind(url)
        .bind(owner.0.to_string())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        bookmark_from_row(&row)
    }

    pub async fn list_bookmarks_newest_first(&self) -> Result<Vec<Bookmark>> {
        let rows = sqlx::query(
            "SELECT id, title, url, owner_user_id, created_at
             FROM bookmarks
             ORDER BY created_at DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(bookmark_from_row).collect()
    }

    /// Deletes a bookmark by id. Returns whether a row was actually removed,
    /// so the caller can decide whether a change event is warranted.
    pub async fn delete_bookmark(&self, id: BookmarkId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM bookmarks WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn principal_from_row(row: &SqliteRow) -> Result<Principal> {
    let raw_id = row.get::<String, _>(0);
    let user_id = Uuid::parse_str(&raw_id)
        .with_context(|| format!("invalid user id '{raw_id}' in users row"))?;
    Ok(Principal {
        user_id: UserId(user_id),
        email: row.get::<String, _>(1),
    })
}

fn bookmark_from_row(row: &SqliteRow) -> Result<Bookmark> {
    let raw_owner = row.get::<String, _>(3);
    let owner = Uuid::parse_str(&raw_owner)
        .with_context(|| format!("invalid owner id '{raw_owner}' in bookmarks row"))?;
    Ok(Bookmark {
        id: BookmarkId(row.get::<i64, _>(0)),
        title: row.get::<String, _>(1),
        url: row.get::<String, _>(2),
        owner: UserId(owner),
        created_at: row.get::<DateTime<Utc>, _>(4),
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
