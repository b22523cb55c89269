//! Active focus list (TTL, deadline, cooldown) + whisper queue (spec §4.E).
//! Grounded on the teacher's per-row sqlite CRUD idiom in
//! `scheduler::storage` and `original_source/services/focus_service.py`'s
//! cooldown/expiry windows.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};

use crate::clock::Clock;
use crate::config::MemoryConfig;
use crate::error::MemoryResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusStatus {
    Active,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FocusItem {
    pub id: i64,
    pub user: String,
    pub content: String,
    pub status: FocusStatus,
    pub expected_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_injected_at: Option<DateTime<Utc>>,
}

impl FocusItem {
    fn is_expired(&self, today: NaiveDate, ttl: chrono::Duration) -> bool {
        match self.expected_date {
            Some(expected) => today > expected + chrono::Duration::days(1),
            None => today > self.created_at.date_naive() + ttl,
        }
    }

    fn in_cooldown(&self, now: DateTime<Utc>, cooldown: chrono::Duration) -> bool {
        match self.last_injected_at {
            Some(last) => now < last + cooldown,
            None => false,
        }
    }

    pub fn is_visible(&self, now: DateTime<Utc>, config: &MemoryConfig) -> bool {
        self.status == FocusStatus::Active
            && !self.is_expired(now.date_naive(), config.focus_ttl)
            && !self.in_cooldown(now, config.focus_cooldown)
    }
}

pub struct FocusStore<C: Clock> {
    db: Pool<Sqlite>,
    clock: C,
    config: MemoryConfig,
}

fn row_to_focus(row: &sqlx::sqlite::SqliteRow) -> FocusItem {
    let status_str: String = row.get("status");
    let expected_date: Option<String> = row.get("expected_date");
    FocusItem {
        id: row.get("id"),
        user: row.get("user"),
        content: row.get("content"),
        status: if status_str == "active" {
            FocusStatus::Active
        } else {
            FocusStatus::Archived
        },
        expected_date: expected_date.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        last_injected_at: row.get("last_injected_at"),
    }
}

impl<C: Clock> FocusStore<C> {
    pub fn new(db: Pool<Sqlite>, clock: C, config: MemoryConfig) -> Self {
        Self { db, clock, config }
    }

    /// Upsert by `(user, content, status=active)`: refresh `updated_at` and
    /// optionally the `expected_date` if it already exists, else insert.
    pub async fn add_focus(
        &self,
        user: &str,
        content: &str,
        expected_date: Option<NaiveDate>,
    ) -> MemoryResult<i64> {
        let now = self.clock.now();
        let existing = sqlx::query(
            "SELECT id FROM focus_items WHERE user = ? AND content = ? AND status = 'active'",
        )
        .bind(user)
        .bind(content)
        .fetch_optional(&self.db)
        .await?;

        if let Some(row) = existing {
            let id: i64 = row.get("id");
            if let Some(date) = expected_date {
                sqlx::query(
                    "UPDATE focus_items SET updated_at = ?, expected_date = ? WHERE id = ?",
                )
                .bind(now)
                .bind(date.format("%Y-%m-%d").to_string())
                .bind(id)
                .execute(&self.db)
                .await?;
            } else {
                sqlx::query("UPDATE focus_items SET updated_at = ? WHERE id = ?")
                    .bind(now)
                    .bind(id)
                    .execute(&self.db)
                    .await?;
            }
            return Ok(id);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO focus_items (user, content, status, expected_date, created_at, updated_at)
            VALUES (?, ?, 'active', ?, ?, ?)
            "#,
        )
        .bind(user)
        .bind(content)
        .bind(expected_date.map(|d| d.format("%Y-%m-%d").to_string()))
        .bind(now)
        .bind(now)
        .execute(&self.db)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Only active, not-expired, not-in-cooldown items are visible (spec
    /// §4.E / §8 Focus visibility rule). Expiry/cooldown are computed, not
    /// stored, so a clock change takes effect immediately.
    pub async fn get_active(&self, user: &str) -> MemoryResult<Vec<FocusItem>> {
        let rows = sqlx::query(
            "SELECT * FROM focus_items WHERE user = ? AND status = 'active' ORDER BY created_at",
        )
        .bind(user)
        .fetch_all(&self.db)
        .await?;

        let now = self.clock.now();
        Ok(rows
            .iter()
            .map(row_to_focus)
            .filter(|f| f.is_visible(now, &self.config))
            .collect())
    }

    pub async fn mark_injected(&self, focus_id: i64) -> MemoryResult<()> {
        sqlx::query("UPDATE focus_items SET last_injected_at = ? WHERE id = ?")
            .bind(self.clock.now())
            .bind(focus_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Archive every active item and consume all pending whispers for the user.
    pub async fn clear_all(&self, user: &str) -> MemoryResult<()> {
        sqlx::query("UPDATE focus_items SET status = 'archived', updated_at = ? WHERE user = ? AND status = 'active'")
            .bind(self.clock.now())
            .bind(user)
            .execute(&self.db)
            .await?;
        sqlx::query("UPDATE whisper_suggestions SET is_consumed = 1 WHERE user = ? AND is_consumed = 0")
            .bind(user)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Physically delete every focus item and whisper row for `user` (spec
    /// §3: clearing a user purges every store for that user). Distinct from
    /// `clear_all`, which only archives for an in-conversation "forget my
    /// focus list" action and keeps rows for audit.
    pub async fn clear(&self, user: &str) -> MemoryResult<()> {
        sqlx::query("DELETE FROM focus_items WHERE user = ?")
            .bind(user)
            .execute(&self.db)
            .await?;
        sqlx::query("DELETE FROM whisper_suggestions WHERE user = ?")
            .bind(user)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Append to the whisper queue.
    pub async fn save_whisper(&self, user: &str, text: &str) -> MemoryResult<i64> {
        let result = sqlx::query(
            "INSERT INTO whisper_suggestions (user, suggestion, is_consumed, created_at) VALUES (?, ?, 0, ?)",
        )
        .bind(user)
        .bind(text)
        .bind(self.clock.now())
        .execute(&self.db)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Newest unconsumed row, no side effects.
    pub async fn peek_whisper(&self, user: &str) -> MemoryResult<Option<String>> {
        let row = sqlx::query(
            "SELECT suggestion FROM whisper_suggestions WHERE user = ? AND is_consumed = 0 ORDER BY id DESC LIMIT 1",
        )
        .bind(user)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|r| r.get("suggestion")))
    }

    /// Returns and atomically consumes the newest unconsumed row.
    pub async fn consume_whisper(&self, user: &str) -> MemoryResult<Option<String>> {
        let row = sqlx::query(
            "SELECT id, suggestion FROM whisper_suggestions WHERE user = ? AND is_consumed = 0 ORDER BY id DESC LIMIT 1",
        )
        .bind(user)
        .fetch_optional(&self.db)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let id: i64 = row.get("id");
        let suggestion: String = row.get("suggestion");

        sqlx::query("UPDATE whisper_suggestions SET is_consumed = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.db)
            .await?;

        Ok(Some(suggestion))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::db::init_test_db;
    use chrono::TimeZone;

    async fn store_at(start: DateTime<Utc>) -> (FocusStore<FixedClock>, FixedClock) {
        let db = init_test_db().await.unwrap();
        let clock = FixedClock::new(start);
        (
            FocusStore::new(db, clock.clone(), MemoryConfig::default()),
            clock,
        )
    }

    #[tokio::test]
    async fn add_focus_is_upsert_by_content() {
        let (store, _clock) = store_at(Utc::now()).await;
        let id1 = store.add_focus("alice", "面试", None).await.unwrap();
        let id2 = store.add_focus("alice", "面试", None).await.unwrap();
        assert_eq!(id1, id2);

        let active = store.get_active("alice").await.unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn deadline_plus_one_day_grace_window() {
        let start = Utc.with_ymd_and_hms(2026, 1, 29, 9, 0, 0).unwrap();
        let (store, clock) = store_at(start).await;
        let deadline = NaiveDate::from_ymd_opt(2026, 2, 4).unwrap();
        store.add_focus("bob", "面试", Some(deadline)).await.unwrap();

        clock.set(Utc.with_ymd_and_hms(2026, 2, 5, 9, 0, 0).unwrap());
        assert_eq!(store.get_active("bob").await.unwrap().len(), 1, "still within +1 day grace");

        clock.set(Utc.with_ymd_and_hms(2026, 2, 6, 0, 1, 0).unwrap());
        assert_eq!(store.get_active("bob").await.unwrap().len(), 0, "expired after grace window");
    }

    #[tokio::test]
    async fn ttl_expiry_without_expected_date() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let (store, clock) = store_at(start).await;
        store.add_focus("carol", "idle thing", None).await.unwrap();

        clock.advance(chrono::Duration::days(13));
        assert_eq!(store.get_active("carol").await.unwrap().len(), 1);

        clock.advance(chrono::Duration::days(2));
        assert_eq!(store.get_active("carol").await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn cooldown_suppresses_then_reappears() {
        let start = Utc.with_ymd_and_hms(2026, 1, 29, 9, 0, 0).unwrap();
        let (store, clock) = store_at(start).await;
        let id = store.add_focus("dave", "面试", None).await.unwrap();
        store.mark_injected(id).await.unwrap();

        assert_eq!(store.get_active("dave").await.unwrap().len(), 0);

        clock.advance(chrono::Duration::hours(13));
        assert_eq!(store.get_active("dave").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn whisper_single_consume() {
        let (store, _clock) = store_at(Utc::now()).await;
        store.save_whisper("erin", "hint one").await.unwrap();

        let first = store.consume_whisper("erin").await.unwrap();
        assert_eq!(first, Some("hint one".to_string()));

        let second = store.consume_whisper("erin").await.unwrap();
        assert_eq!(second, None);
    }

    #[tokio::test]
    async fn peek_does_not_consume() {
        let (store, _clock) = store_at(Utc::now()).await;
        store.save_whisper("frank", "hint").await.unwrap();

        assert_eq!(store.peek_whisper("frank").await.unwrap(), Some("hint".to_string()));
        assert_eq!(store.peek_whisper("frank").await.unwrap(), Some("hint".to_string()));
        assert_eq!(store.consume_whisper("frank").await.unwrap(), Some("hint".to_string()));
    }

    #[tokio::test]
    async fn clear_all_archives_and_consumes_whispers() {
        let (store, _clock) = store_at(Utc::now()).await;
        store.add_focus("gina", "focus item", None).await.unwrap();
        store.save_whisper("gina", "a hint").await.unwrap();

        store.clear_all("gina").await.unwrap();

        assert!(store.get_active("gina").await.unwrap().is_empty());
        assert_eq!(store.peek_whisper("gina").await.unwrap(), None);
    }

    #[tokio::test]
    async fn clear_physically_removes_rows_unlike_clear_all() {
        let (store, _clock) = store_at(Utc::now()).await;
        store.add_focus("henry", "focus item", None).await.unwrap();
        store.save_whisper("henry", "a hint").await.unwrap();

        store.clear("henry").await.unwrap();

        let rows: Vec<(i64,)> = sqlx::query_as("SELECT id FROM focus_items WHERE user = ?")
            .bind("henry")
            .fetch_all(&store.db)
            .await
            .unwrap();
        assert!(rows.is_empty());
        let whispers: Vec<(i64,)> = sqlx::query_as("SELECT id FROM whisper_suggestions WHERE user = ?")
            .bind("henry")
            .fetch_all(&store.db)
            .await
            .unwrap();
        assert!(whispers.is_empty());
    }
}
