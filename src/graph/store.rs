//! Per-user property-graph database driver (spec §4.A). Since the example
//! pack has no Rust client for the original's FalkorDB backend (DESIGN.md
//! Open Question (d)), each user partition is its own sqlite file,
//! generalizing `database::init_database`'s per-instance-database pattern
//! from "AI instance" to "user". The process-wide handle cache mirrors the
//! teacher's `AIInstanceManager` in-memory map.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::MemoryResult;

/// A single user's graph partition: its own sqlite connection pool plus
/// the directory it lives in (needed for `drop-all`'s file removal path).
pub struct GraphHandle {
    pub pool: Pool<Sqlite>,
}

/// Process-wide `user -> graph handle` cache, initialized lazily.
/// Handles are never evicted during process lifetime; concurrent creation
/// for the same user is deduplicated by the outer mutex.
pub struct GraphStoreDriver {
    root: PathBuf,
    handles: Mutex<HashMap<String, Arc<GraphHandle>>>,
}

impl GraphStoreDriver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn partition_path(&self, user: &str) -> PathBuf {
        self.root.join(format!("user_{user}.sqlite"))
    }

    /// Fetch or lazily create the partition handle for `user`. Routes every
    /// call for user *u* to partition *u* only; callers cannot read another
    /// user's partition through this driver because there is no API to
    /// obtain a handle for anything but the requested user.
    pub async fn handle(&self, user: &str) -> MemoryResult<Arc<GraphHandle>> {
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get(user) {
            return Ok(handle.clone());
        }

        let path = self.partition_path(user);
        let pool = open_partition(&path).await?;
        create_tables(&pool).await?;

        let handle = Arc::new(GraphHandle { pool });
        handles.insert(user.to_string(), handle.clone());
        tracing::info!(user, "opened graph partition");
        Ok(handle)
    }

    /// Detach every node for `user`: drops the partition's tables and
    /// evicts the cached handle so a later write re-creates a clean file.
    pub async fn drop_all(&self, user: &str) -> MemoryResult<()> {
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.remove(user) {
            sqlx::query("DELETE FROM episodes").execute(&handle.pool).await?;
            sqlx::query("DELETE FROM entities").execute(&handle.pool).await?;
            sqlx::query("DELETE FROM edges").execute(&handle.pool).await?;
        }
        let path = self.partition_path(user);
        let _ = std::fs::remove_file(&path);
        tracing::info!(user, "dropped graph partition");
        Ok(())
    }
}

async fn open_partition(path: &Path) -> MemoryResult<Pool<Sqlite>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| crate::error::MemoryError::StoreUnavailable(e.to_string()))?;
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    Ok(SqlitePool::connect_with(options).await?)
}

/// In-memory partition, for tests.
pub async fn open_test_partition() -> MemoryResult<Pool<Sqlite>> {
    let pool = SqlitePool::connect("sqlite::memory:").await?;
    create_tables(&pool).await?;
    Ok(pool)
}

async fn create_tables(pool: &Pool<Sqlite>) -> MemoryResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS episodes (
            uuid TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            body TEXT NOT NULL,
            source_type TEXT NOT NULL,
            source_description TEXT NOT NULL DEFAULT '',
            reference_time DATETIME NOT NULL,
            created_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            uuid TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            summary TEXT NOT NULL DEFAULT '',
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entities_name ON entities(name)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS edges (
            uuid TEXT PRIMARY KEY,
            subject_entity TEXT NOT NULL,
            predicate_name TEXT NOT NULL,
            object_entity TEXT,
            fact_text TEXT NOT NULL,
            embedding BLOB NOT NULL,
            valid_at DATETIME,
            invalid_at DATETIME,
            created_at DATETIME NOT NULL,
            is_mentions INTEGER NOT NULL DEFAULT 0,
            episode_uuid TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_edges_family ON edges(subject_entity, predicate_name)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_edges_mentions ON edges(is_mentions, episode_uuid)")
        .execute(pool)
        .await?;

    Ok(())
}
