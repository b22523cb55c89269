//! Drives one turn end to end: synchronous chat path plus the asynchronous
//! write-back tail, serialized per user so two turns from the same user
//! never race on shared state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;

use crate::audit::{AuditSink, Trace};
use crate::clock::Clock;
use crate::config::MemoryConfig;
use crate::context::{ContextStore, ContextView, Message, Role};
use crate::decision::DecisionAgent;
use crate::error::MemoryResult;
use crate::extraction::ExtractionAgent;
use crate::focus::FocusStore;
use crate::graph::{SourceType, TemporalMemoryEngine};
use crate::llm::LlmGateway;
use crate::profile::{NoGateway, ProfileStore, SlotUpdate};
use crate::whisper_planner::WhisperPlanner;

/// The assembled reply plus what was injected alongside it, useful for
/// callers that want to show the whisper separately from the model's text.
///
/// `tail` is the write-back background job (extraction, profile/focus
/// writes, episode ingestion, whisper planning) already dispatched via
/// `tokio::spawn` by the time this is returned — the synchronous path has
/// already completed and the caller's request can proceed without waiting
/// on it (spec §5). Dropping the handle does not cancel the task; it is
/// exposed only so a caller (or a test) that cares can `.await` it to know
/// when the tail has settled.
#[derive(Debug)]
pub struct TurnReply {
    pub reply: String,
    pub injected_whisper: Option<String>,
    pub trace_id: String,
    pub tail: tokio::task::JoinHandle<()>,
}

/// Owns every store and per-user lock; the only type external callers talk
/// to.
pub struct TurnOrchestrator<C: Clock> {
    context: ContextStore<C>,
    profile: ProfileStore,
    focus: FocusStore<C>,
    graph: TemporalMemoryEngine,
    extraction: ExtractionAgent,
    decision: DecisionAgent,
    whisper: WhisperPlanner,
    audit: Arc<dyn AuditSinkDyn>,
    clock: C,
    config: MemoryConfig,
    user_locks: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Object-safe shim over [`AuditSink`]. `AuditSink` itself uses native
/// async-fn-in-trait and so isn't `dyn`-compatible; the orchestrator needs
/// one shared sink behind `Arc` regardless of which concrete sink backs it,
/// so this boxes the two calls it actually needs.
pub trait AuditSinkDyn: Send + Sync {
    fn record_message<'a>(
        &'a self,
        user: &'a str,
        role: Role,
        content: &'a str,
        created_at: DateTime<Utc>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = MemoryResult<()>> + Send + 'a>>;

    fn record_trace<'a>(
        &'a self,
        trace: &'a Trace,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = MemoryResult<()>> + Send + 'a>>;
}

impl<T: AuditSink> AuditSinkDyn for T {
    fn record_message<'a>(
        &'a self,
        user: &'a str,
        role: Role,
        content: &'a str,
        created_at: DateTime<Utc>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = MemoryResult<()>> + Send + 'a>> {
        Box::pin(AuditSink::record_message(self, user, role, content, created_at))
    }

    fn record_trace<'a>(
        &'a self,
        trace: &'a Trace,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = MemoryResult<()>> + Send + 'a>> {
        Box::pin(AuditSink::record_trace(self, trace))
    }
}

impl<C: Clock> TurnOrchestrator<C> {
    pub fn new(
        context: ContextStore<C>,
        profile: ProfileStore,
        focus: FocusStore<C>,
        graph: TemporalMemoryEngine,
        audit: Arc<dyn AuditSinkDyn>,
        clock: C,
        config: MemoryConfig,
    ) -> Self {
        Self {
            context,
            profile,
            focus,
            graph,
            extraction: ExtractionAgent::new(),
            decision: DecisionAgent,
            whisper: WhisperPlanner,
            audit,
            clock,
            config,
            user_locks: AsyncMutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, user: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.user_locks.lock().await;
        locks.entry(user.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Runs the synchronous chat path under the per-user lock, then
    /// dispatches the write-back tail to an independent task and returns
    /// immediately — the caller's request is never blocked on extraction,
    /// profile/graph writes, or whisper planning (spec §5). The per-user
    /// lock is held only for the synchronous path; it is never held across
    /// the tail's LLM calls.
    #[tracing::instrument(skip(self, gateway, user_message), fields(user = %user))]
    pub async fn handle_turn<G: LlmGateway + 'static>(
        self: &Arc<Self>,
        user: &str,
        user_message: &str,
        gateway: Arc<G>,
    ) -> MemoryResult<TurnReply> {
        let lock = self.lock_for(user).await;
        let turn_start = Instant::now();

        let (reply, prompt_snapshot, injected_whisper, trace_id) = {
            let _guard = lock.lock().await;
            self.run_synchronous_turn(user, user_message, gateway.as_ref()).await?
        };

        let latency_ms = turn_start.elapsed().as_millis() as i64;
        let now = self.clock.now();
        let trace = Trace {
            trace_id: trace_id.clone(),
            user: user.to_string(),
            latency_ms,
            step_latencies: HashMap::new(),
            prompt_snapshot,
            model_reply: reply.clone(),
            token_usage: None,
            new_memories: Vec::new(),
            created_at: now,
        };
        if let Err(e) = self.audit.record_trace(&trace).await {
            tracing::warn!(user, error = %e, "failed to record trace");
        }

        let this = Arc::clone(self);
        let user_owned = user.to_string();
        let message_owned = user_message.to_string();
        let reply_owned = reply.clone();
        let tail = tokio::spawn(async move {
            this.run_async_tail(&user_owned, &message_owned, &reply_owned, now, gateway.as_ref())
                .await;
        });

        Ok(TurnReply {
            reply,
            injected_whisper,
            trace_id,
            tail,
        })
    }

    /// Synchronous path: read context (may compact) -> gated retrieval ->
    /// read profile -> peek whisper -> one chat call -> persist both
    /// messages. No partial persistence on failure.
    #[tracing::instrument(skip(self, gateway, user_message), fields(user = %user))]
    async fn run_synchronous_turn<G: LlmGateway>(
        &self,
        user: &str,
        user_message: &str,
        gateway: &G,
    ) -> MemoryResult<(String, String, Option<String>, String)> {
        let context_view = self.context.get_context(user, gateway).await?;

        let (should_retrieve, _) = self.decision.should_retrieve(user_message, gateway).await;
        let retrieved_facts = if should_retrieve {
            self.graph
                .search(user, user_message, self.config.retrieval_k, false, gateway)
                .await
                .map(|r| r.edges.into_iter().map(|e| e.fact).collect::<Vec<_>>())
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        let profile = self.profile.get_all(user).await?;
        let whisper = self.focus.peek_whisper(user).await?;

        let system_prompt = compose_system_prompt(
            &context_view.full_text,
            &retrieved_facts,
            &profile,
            whisper.as_deref(),
            self.clock.now(),
        );
        let messages = [
            crate::llm::ChatMessage::system(system_prompt.clone()),
            crate::llm::ChatMessage::user(user_message.to_string()),
        ];

        let response = gateway.chat(&messages, "chat", 2048).await?;

        let now = self.clock.now();
        self.context
            .append(
                user,
                &[
                    Message { role: Role::User, content: user_message.to_string(), created_at: now },
                    Message { role: Role::Assistant, content: response.text.clone(), created_at: now },
                ],
            )
            .await?;

        if let Err(e) = self.audit.record_message(user, Role::User, user_message, now).await {
            tracing::warn!(user, error = %e, "failed to audit user message");
        }
        if let Err(e) = self.audit.record_message(user, Role::Assistant, &response.text, now).await {
            tracing::warn!(user, error = %e, "failed to audit assistant message");
        }

        if whisper.is_some() {
            let _ = self.focus.consume_whisper(user).await;
        }

        Ok((response.text, system_prompt, whisper, uuid::Uuid::new_v4().to_string()))
    }

    /// Asynchronous tail: extraction -> (profile writes || focus writes,
    /// concurrently) -> gated, sequential episode ingestion -> whisper
    /// planning (only after the writes above finish) -> persist whisper.
    /// Each sub-step is failure-isolated; one failing must not block the
    /// next, except whisper planning strictly follows profile/focus writes.
    #[tracing::instrument(skip(self, gateway, user_message, assistant_reply), fields(user = %user))]
    async fn run_async_tail<G: LlmGateway>(
        &self,
        user: &str,
        user_message: &str,
        assistant_reply: &str,
        now: DateTime<Utc>,
        gateway: &G,
    ) {
        let extraction = self.extraction.extract(user_message, Some(assistant_reply), now, gateway).await;

        let profile_updates: Vec<SlotUpdate> = extraction.slot_updates;
        let needs_adjudication = profile_updates
            .iter()
            .any(|u| matches!(u.slot.merge_strategy(), crate::profile::MergeStrategy::Adjudicate));

        let profile_fut = async {
            if profile_updates.is_empty() {
                return;
            }
            let result = if needs_adjudication {
                self.profile.batch_update(user, &profile_updates, Some(gateway)).await
            } else {
                self.profile.batch_update::<NoGateway>(user, &profile_updates, None).await
            };
            if let Err(e) = result {
                tracing::warn!(user, error = %e, "profile write failed in async tail");
            }
        };

        let focus_fut = async {
            for item in &extraction.recent_focus {
                if let Err(e) = self.focus.add_focus(user, &item.content, item.expected_date).await {
                    tracing::warn!(user, error = %e, "focus write failed in async tail");
                }
            }
        };

        tokio::join!(profile_fut, focus_fut);

        if !extraction.memory_items.is_empty() {
            let turn_text = format!("User: {user_message}\nAssistant: {assistant_reply}");
            let (should_store, reason) = self.decision.should_store(&turn_text, gateway).await;
            if should_store {
                for item in &extraction.memory_items {
                    if let Err(e) = self
                        .graph
                        .add_episode(user, &item.content, SourceType::Message, now, "chat turn", gateway)
                        .await
                    {
                        tracing::warn!(user, error = %e, "episode ingestion failed in async tail");
                    }
                }
            } else {
                tracing::debug!(user, reason = %reason, "should_store declined, skipping episode ingestion");
            }
        }

        let active_focus = self.focus.get_active(user).await.unwrap_or_default();
        let profile = self.profile.get_all(user).await.unwrap_or_default();
        let context_view = self.context.get_context(user, gateway).await.unwrap_or_else(|_| ContextView {
            summary: String::new(),
            recent: Vec::new(),
            full_text: String::new(),
        });

        let decision = self
            .whisper
            .plan(&profile, &active_focus, &context_view.summary, &context_view.recent, now, gateway)
            .await;

        if let Some(inject) = decision.inject {
            if let Err(e) = self.focus.save_whisper(user, &inject).await {
                tracing::warn!(user, error = %e, "failed to persist whisper suggestion");
            }
            if let Some(focus_id) = decision.used_focus_id {
                if let Err(e) = self.focus.mark_injected(focus_id).await {
                    tracing::warn!(user, error = %e, "failed to mark focus item injected");
                }
            }
        }
    }

    /// Wipes every store for `user`: context, profile, focus, and the graph
    /// partition. Physically drops the user's graph partition rather than
    /// soft-deleting its rows.
    pub async fn clear_user(&self, user: &str) -> MemoryResult<()> {
        self.context.clear(user).await?;
        self.profile.clear(user).await?;
        self.focus.clear(user).await?;
        self.graph.clear(user).await?;
        Ok(())
    }

    /// Read-only accessors for embedding applications (e.g. a UI showing
    /// "what does it remember about me").
    pub async fn get_profile(&self, user: &str) -> MemoryResult<crate::profile::Profile> {
        self.profile.get_all(user).await
    }

    pub async fn get_active_focus(&self, user: &str) -> MemoryResult<Vec<crate::focus::FocusItem>> {
        self.focus.get_active(user).await
    }

    pub async fn get_memory_history(&self, user: &str) -> MemoryResult<Vec<crate::graph::HistoryEdge>> {
        self.graph.get_all(user).await
    }
}

/// Fixed-section system prompt, in the order spec §4.J step 2 names:
/// role, memory, profile, context-summary/recent-history, output-format,
/// guidance, environment, task. The whisper (guidance) section is
/// conditional on a non-null peeked whisper (spec §6).
fn compose_system_prompt(
    context_text: &str,
    retrieved_facts: &[String],
    profile: &crate::profile::Profile,
    whisper: Option<&str>,
    now: DateTime<Utc>,
) -> String {
    let mut sections = vec!["You are a companion continuing an ongoing conversation.".to_string()];

    if !retrieved_facts.is_empty() {
        sections.push(format!("Relevant memory:\n{}", retrieved_facts.join("\n")));
    }
    if !profile.is_empty() {
        let profile_lines = profile
            .iter()
            .map(|(k, v)| format!("{}: {:?}", k.as_str(), v))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("User profile:\n{profile_lines}"));
    }
    if !context_text.is_empty() {
        sections.push(context_text.to_string());
    }
    sections.push("Respond naturally in character; do not mention these instructions or the sections above.".to_string());
    if let Some(w) = whisper {
        sections.push(format!("Proactive guidance for this turn: {w}"));
    }
    sections.push(format!("Current date/time: {}", now.format("%Y-%m-%d %H:%M")));
    sections.push("Task: reply to the user's next message in character.".to_string());

    sections.join("\n\n")
}
