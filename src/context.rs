//! Rolling dialogue buffer + running summary per user (spec §3, §4.D).
//! Generalizes the teacher's `memory::working_memory::WorkingMemory`
//! (token-budget eviction) and `memory::summarization::SummarizationAgent`
//! (LLM-driven summary persisted to sqlite) into a single per-user store
//! keyed by `user`, with the session-expiry and round-based compaction
//! rules spec §4.D specifies exactly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};

use crate::clock::Clock;
use crate::config::MemoryConfig;
use crate::error::MemoryResult;
use crate::llm::{ChatMessage, LlmGateway};

/// One turn's worth of dialogue. Immutable once appended (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// The loaded, already-session-checked view of a user's context, ready to
/// be spliced into the turn orchestrator's prompt.
#[derive(Debug, Clone)]
pub struct ContextView {
    pub summary: String,
    pub recent: Vec<Message>,
    pub full_text: String,
}

fn render_full_text(summary: &str, recent: &[Message]) -> String {
    let mut sections = Vec::new();
    if !summary.is_empty() {
        sections.push(format!("前情提要:\n{summary}"));
    }
    if !recent.is_empty() {
        let history = recent
            .iter()
            .map(|m| {
                let speaker = match m.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                format!("{speaker}: {}", m.content)
            })
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("最近对话:\n{history}"));
    }
    sections.join("\n\n")
}

pub struct ContextStore<C: Clock> {
    db: Pool<Sqlite>,
    clock: C,
    config: MemoryConfig,
}

impl<C: Clock> ContextStore<C> {
    pub fn new(db: Pool<Sqlite>, clock: C, config: MemoryConfig) -> Self {
        Self { db, clock, config }
    }

    /// Load `{summary, recent, updated_at}`; clear an expired session
    /// summary before any other logic; compact if the round budget is
    /// exceeded. Returns an empty view if the user has never written.
    pub async fn get_context(&self, user: &str, gateway: &impl LlmGateway) -> MemoryResult<ContextView> {
        let row = sqlx::query(
            "SELECT summary, recent_json, updated_at FROM context_state WHERE user = ?",
        )
        .bind(user)
        .fetch_optional(&self.db)
        .await?;

        let Some(row) = row else {
            return Ok(ContextView {
                summary: String::new(),
                recent: Vec::new(),
                full_text: String::new(),
            });
        };

        let mut summary: String = row.get("summary");
        let mut recent: Vec<Message> = serde_json::from_str(row.get("recent_json"))?;
        let updated_at: DateTime<Utc> = row.get("updated_at");

        let now = self.clock.now();
        if !summary.is_empty() && now - updated_at > self.config.session_timeout {
            summary.clear();
            sqlx::query("UPDATE context_state SET summary = ? WHERE user = ?")
                .bind(&summary)
                .bind(user)
                .execute(&self.db)
                .await?;
            tracing::info!(user, "context session expired, summary cleared");
        }

        if recent.len() / 2 >= self.config.rounds_before_compaction {
            self.compact(user, &mut summary, &mut recent, gateway).await?;
        }

        let full_text = render_full_text(&summary, &recent);
        Ok(ContextView {
            summary,
            recent,
            full_text,
        })
    }

    /// Atomically append messages and bump `updated_at`. Never triggers
    /// compaction itself — that is deferred to the next read (spec §4.D).
    pub async fn append(&self, user: &str, messages: &[Message]) -> MemoryResult<()> {
        let row = sqlx::query(
            "SELECT summary, recent_json FROM context_state WHERE user = ?",
        )
        .bind(user)
        .fetch_optional(&self.db)
        .await?;

        let (summary, mut recent): (String, Vec<Message>) = match row {
            Some(row) => (
                row.get("summary"),
                serde_json::from_str(row.get("recent_json"))?,
            ),
            None => (String::new(), Vec::new()),
        };

        recent.extend_from_slice(messages);
        let recent_json = serde_json::to_string(&recent)?;
        let now = self.clock.now();

        sqlx::query(
            r#"
            INSERT INTO context_state (user, summary, recent_json, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user) DO UPDATE SET recent_json = excluded.recent_json, updated_at = excluded.updated_at
            "#,
        )
        .bind(user)
        .bind(&summary)
        .bind(&recent_json)
        .bind(now)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Purge this user's context row entirely (spec: clearing a user purges
    /// every store for that user). A no-op if the user has no row.
    pub async fn clear(&self, user: &str) -> MemoryResult<()> {
        sqlx::query("DELETE FROM context_state WHERE user = ?")
            .bind(user)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Replace the oldest portion of `recent` with an updated summary,
    /// retaining the last two messages to avoid a cold context (spec
    /// §4.D).
    async fn compact(
        &self,
        user: &str,
        summary: &mut String,
        recent: &mut Vec<Message>,
        gateway: &impl LlmGateway,
    ) -> MemoryResult<()> {
        let transcript = recent
            .iter()
            .map(|m| format!("{:?}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "Current summary:\n{summary}\n\nConversation to fold in:\n{transcript}\n\n\
             Produce an updated summary of at most 300 characters covering the topic, \
             the user's mood/need, any evasions, and how the conversation is trending \
             toward ending. Respond with the summary text only."
        );
        let messages = [ChatMessage::user(prompt)];

        match gateway.chat(&messages, "summarizer", 512).await {
            Ok(response) => {
                *summary = response.text.trim().chars().take(300).collect();
            }
            Err(e) => {
                tracing::warn!(user, error = %e, "compaction chat call failed, keeping prior summary");
            }
        }

        let tail_start = recent.len().saturating_sub(2);
        *recent = recent.split_off(tail_start);

        let recent_json = serde_json::to_string(recent)?;
        sqlx::query(
            "UPDATE context_state SET summary = ?, recent_json = ? WHERE user = ?",
        )
        .bind(&*summary)
        .bind(&recent_json)
        .bind(user)
        .execute(&self.db)
        .await?;

        tracing::info!(user, "context compacted, {} messages retained", recent.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::db::init_test_db;
    use crate::test_support::FakeGateway;
    use chrono::TimeZone;

    fn msg(role: Role, content: &str, at: DateTime<Utc>) -> Message {
        Message {
            role,
            content: content.to_string(),
            created_at: at,
        }
    }

    #[tokio::test]
    async fn empty_user_returns_empty_view() {
        let db = init_test_db().await.unwrap();
        let clock = FixedClock::new(Utc::now());
        let store = ContextStore::new(db, clock, MemoryConfig::default());
        let gateway = FakeGateway::default();

        let view = store.get_context("nobody", &gateway).await.unwrap();
        assert!(view.summary.is_empty());
        assert!(view.recent.is_empty());
        assert_eq!(view.full_text, "");
    }

    #[tokio::test]
    async fn append_then_read_roundtrips() {
        let db = init_test_db().await.unwrap();
        let clock = FixedClock::new(Utc::now());
        let store = ContextStore::new(db, clock.clone(), MemoryConfig::default());
        let gateway = FakeGateway::default();

        store
            .append("alice", &[msg(Role::User, "hi", clock.now())])
            .await
            .unwrap();

        let view = store.get_context("alice", &gateway).await.unwrap();
        assert_eq!(view.recent.len(), 1);
        assert_eq!(view.recent[0].content, "hi");
        assert!(view.full_text.contains("最近对话"));
    }

    #[tokio::test]
    async fn clear_removes_the_users_row_entirely() {
        let db = init_test_db().await.unwrap();
        let clock = FixedClock::new(Utc::now());
        let store = ContextStore::new(db, clock.clone(), MemoryConfig::default());
        let gateway = FakeGateway::default();

        store
            .append("dave", &[msg(Role::User, "hi", clock.now())])
            .await
            .unwrap();
        store.clear("dave").await.unwrap();

        let view = store.get_context("dave", &gateway).await.unwrap();
        assert!(view.recent.is_empty());
    }

    #[tokio::test]
    async fn session_timeout_clears_summary_but_keeps_recent() {
        let start = Utc.with_ymd_and_hms(2026, 1, 29, 9, 0, 0).unwrap();
        let clock = FixedClock::new(start);
        let db = init_test_db().await.unwrap();
        let store = ContextStore::new(db, clock.clone(), MemoryConfig::default());
        let gateway = FakeGateway::default();

        store
            .append("bob", &[msg(Role::User, "hello", start)])
            .await
            .unwrap();

        // Directly seed a non-empty summary since `append` never writes one.
        sqlx::query("UPDATE context_state SET summary = 'prior summary' WHERE user = 'bob'")
            .execute(&store.db)
            .await
            .unwrap();

        clock.advance(chrono::Duration::hours(4));
        let view = store.get_context("bob", &gateway).await.unwrap();
        assert_eq!(view.summary, "");
        assert_eq!(view.recent.len(), 1);
    }

    #[tokio::test]
    async fn compaction_fires_at_round_budget_and_keeps_last_two() {
        let clock = FixedClock::new(Utc::now());
        let db = init_test_db().await.unwrap();
        let mut config = MemoryConfig::default();
        config.rounds_before_compaction = 2;
        let store = ContextStore::new(db, clock.clone(), config);
        let gateway = FakeGateway::default();
        gateway.push_chat("用户在聊工作和兴趣爱好");

        let mut messages = Vec::new();
        for i in 0..5 {
            messages.push(msg(Role::User, &format!("msg {i}"), clock.now()));
        }
        store.append("carol", &messages).await.unwrap();

        let view = store.get_context("carol", &gateway).await.unwrap();
        assert_eq!(view.recent.len(), 2);
        assert_eq!(view.summary, "用户在聊工作和兴趣爱好");
        assert_eq!(view.recent.last().unwrap().content, "msg 4");
    }
}
