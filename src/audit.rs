//! Per-turn audit trail: message log + trace record (spec §3's `Trace`,
//! §4.J's "record a trace for every synchronous turn"). No teacher
//! analogue; the sqlite-backed sink follows the same upsert-free
//! insert-only idiom as `scheduler::storage`'s run-history table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use uuid::Uuid;

use crate::context::{Message, Role};
use crate::error::MemoryResult;
use crate::llm::TokenUsage;

/// Matches spec §3's `Trace` type exactly. Not itself `Serialize`d wholesale
/// ([`TokenUsage`] has no serde impl); [`SqliteAuditSink::record_trace`]
/// serializes the composite fields individually.
#[derive(Debug, Clone)]
pub struct Trace {
    pub trace_id: String,
    pub user: String,
    pub latency_ms: i64,
    pub step_latencies: HashMap<String, i64>,
    pub prompt_snapshot: String,
    pub model_reply: String,
    pub token_usage: Option<TokenUsage>,
    pub new_memories: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Trace {
    pub fn new(user: &str, prompt_snapshot: String, model_reply: String) -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            user: user.to_string(),
            latency_ms: 0,
            step_latencies: HashMap::new(),
            prompt_snapshot,
            model_reply,
            token_usage: None,
            new_memories: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

/// Serializable mirror of [`TokenUsage`], since the gateway's struct has no
/// `Serialize` derive of its own (it never crosses a store boundary
/// elsewhere).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenUsageRecord {
    prompt_tokens: u64,
    completion_tokens: u64,
}

impl From<&TokenUsage> for TokenUsageRecord {
    fn from(u: &TokenUsage) -> Self {
        Self {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        }
    }
}

/// Where turn messages and traces are recorded. A trait so the
/// orchestrator doesn't depend on sqlite directly, matching the
/// generics-over-gateway pattern used for `LlmGateway`.
pub trait AuditSink: Send + Sync {
    async fn record_message(
        &self,
        user: &str,
        role: Role,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> MemoryResult<()>;

    async fn record_trace(&self, trace: &Trace) -> MemoryResult<()>;
}

pub struct SqliteAuditSink {
    db: Pool<Sqlite>,
}

impl SqliteAuditSink {
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }

    pub async fn record_turn(&self, user: &str, messages: &[Message]) -> MemoryResult<()> {
        for message in messages {
            self.record_message(user, message.role, &message.content, message.created_at)
                .await?;
        }
        Ok(())
    }
}

impl AuditSink for SqliteAuditSink {
    async fn record_message(
        &self,
        user: &str,
        role: Role,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> MemoryResult<()> {
        let role_str = match role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        sqlx::query(
            "INSERT INTO audit_messages (id, user, role, content, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user)
        .bind(role_str)
        .bind(content)
        .bind(created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn record_trace(&self, trace: &Trace) -> MemoryResult<()> {
        let step_latencies_json = serde_json::to_string(&trace.step_latencies)?;
        let token_usage_json = trace
            .token_usage
            .as_ref()
            .map(|u| serde_json::to_string(&TokenUsageRecord::from(u)))
            .transpose()?;
        let new_memories_json = serde_json::to_string(&trace.new_memories)?;

        sqlx::query(
            r#"
            INSERT INTO audit_traces
                (trace_id, user, latency_ms, step_latencies_json, prompt_snapshot, model_reply, token_usage_json, new_memories_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trace.trace_id)
        .bind(&trace.user)
        .bind(trace.latency_ms)
        .bind(&step_latencies_json)
        .bind(&trace.prompt_snapshot)
        .bind(&trace.model_reply)
        .bind(token_usage_json)
        .bind(&new_memories_json)
        .bind(trace.created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

impl SqliteAuditSink {
    #[cfg(test)]
    async fn message_count(&self, user: &str) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM audit_messages WHERE user = ?")
            .bind(user)
            .fetch_one(&self.db)
            .await
            .unwrap()
    }

    #[cfg(test)]
    async fn trace_row(&self, trace_id: &str) -> (i64, String) {
        let row = sqlx::query("SELECT latency_ms, model_reply FROM audit_traces WHERE trace_id = ?")
            .bind(trace_id)
            .fetch_one(&self.db)
            .await
            .unwrap();
        (row.get("latency_ms"), row.get("model_reply"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;

    #[tokio::test]
    async fn record_turn_writes_both_messages() {
        let db = init_test_db().await.unwrap();
        let sink = SqliteAuditSink::new(db);
        let now = Utc::now();

        sink.record_turn(
            "alice",
            &[
                Message { role: Role::User, content: "hi".into(), created_at: now },
                Message { role: Role::Assistant, content: "hello".into(), created_at: now },
            ],
        )
        .await
        .unwrap();

        assert_eq!(sink.message_count("alice").await, 2);
    }

    #[tokio::test]
    async fn record_trace_persists_fields() {
        let db = init_test_db().await.unwrap();
        let sink = SqliteAuditSink::new(db);
        let mut trace = Trace::new("bob", "prompt".into(), "reply".into());
        trace.latency_ms = 42;
        trace.step_latencies.insert("retrieve".into(), 10);
        trace.new_memories.push("fact: bob likes coffee".into());

        sink.record_trace(&trace).await.unwrap();

        let (latency, reply) = sink.trace_row(&trace.trace_id).await;
        assert_eq!(latency, 42);
        assert_eq!(reply, "reply");
    }
}
