//! The deployment-wide keyed-store database: one sqlite file backing the
//! context, profile, focus, and audit stores, each table keyed by `user`.
//! Generalizes `database::init_database`'s per-instance connection pattern
//! to a single shared pool, since these four stores are partitioned by a
//! `user` column rather than by file.

use crate::error::MemoryResult;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool},
    Pool, Sqlite,
};
use std::path::Path;

/// Open (creating if missing) the shared keyed-store database and run its
/// migrations.
pub async fn init_main_db(db_path: &Path) -> MemoryResult<Pool<Sqlite>> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| crate::error::MemoryError::StoreUnavailable(e.to_string()))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true);

    let pool = SqlitePool::connect_with(options).await?;
    create_tables(&pool).await?;

    tracing::info!(path = %db_path.display(), "initialized main keyed-store database");
    Ok(pool)
}

/// Open an in-memory database for tests; same schema, no file on disk.
pub async fn init_test_db() -> MemoryResult<Pool<Sqlite>> {
    let pool = SqlitePool::connect("sqlite::memory:").await?;
    create_tables(&pool).await?;
    Ok(pool)
}

async fn create_tables(pool: &Pool<Sqlite>) -> MemoryResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS context_state (
            user TEXT PRIMARY KEY,
            summary TEXT NOT NULL DEFAULT '',
            recent_json TEXT NOT NULL DEFAULT '[]',
            updated_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS user_profile (
            user TEXT PRIMARY KEY,
            slots_json TEXT NOT NULL DEFAULT '{}',
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS focus_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user TEXT NOT NULL,
            content TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active' CHECK(status IN ('active', 'archived')),
            expected_date TEXT,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL,
            last_injected_at DATETIME
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_focus_items_user ON focus_items(user, status)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS whisper_suggestions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user TEXT NOT NULL,
            suggestion TEXT NOT NULL,
            is_consumed INTEGER NOT NULL DEFAULT 0,
            created_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_whisper_user ON whisper_suggestions(user, is_consumed)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_messages (
            id TEXT PRIMARY KEY,
            user TEXT NOT NULL,
            role TEXT NOT NULL CHECK(role IN ('user', 'assistant')),
            content TEXT NOT NULL,
            created_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_messages_user ON audit_messages(user)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_traces (
            trace_id TEXT PRIMARY KEY,
            user TEXT NOT NULL,
            latency_ms INTEGER NOT NULL,
            step_latencies_json TEXT NOT NULL DEFAULT '{}',
            prompt_snapshot TEXT NOT NULL,
            model_reply TEXT NOT NULL,
            token_usage_json TEXT,
            new_memories_json TEXT NOT NULL DEFAULT '[]',
            created_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::debug!("main keyed-store tables created");
    Ok(())
}

/// Purge every row belonging to `user` from all four keyed stores,
/// including the audit log, in one pass over the raw pool. The orchestrator
/// itself does not call this: spec §1 scopes the audit table as a sink
/// outside the core's lifecycle rules, so `TurnOrchestrator::clear_user`
/// purges context/profile/focus/graph but deliberately leaves the audit
/// trail intact. This function is for callers (e.g. an admin/GDPR deletion
/// path) that hold the raw pool and want a full wipe including audit rows.
pub async fn clear_user(pool: &Pool<Sqlite>, user: &str) -> MemoryResult<()> {
    sqlx::query("DELETE FROM context_state WHERE user = ?")
        .bind(user)
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM user_profile WHERE user = ?")
        .bind(user)
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM focus_items WHERE user = ?")
        .bind(user)
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM whisper_suggestions WHERE user = ?")
        .bind(user)
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM audit_messages WHERE user = ?")
        .bind(user)
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM audit_traces WHERE user = ?")
        .bind(user)
        .execute(pool)
        .await?;
    Ok(())
}
