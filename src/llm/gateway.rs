//! Unified call surface for chat, small-model JSON extraction, embeddings,
//! and reranking. Provider idiosyncrasies live only in [`super::coercion`];
//! everything downstream of [`LlmGateway`] sees a clean contract.

use candle_core::{DType, Device};
use fastembed::Qwen3TextEmbedding;
use rig::agent::Agent;
use rig::client::{CompletionClient, Nothing};
use rig::completion::Prompt;
use rig::message::Message as RigMessage;
use rig::providers::{anthropic, ollama, openai};
use serde_json::Value;
use std::future::Future;
use std::sync::Mutex;

use super::coercion;
use crate::error::{MemoryError, MemoryResult};

/// One turn of chat input/output, provider-agnostic.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub text: String,
    pub usage: TokenUsage,
}

/// Unified surface exposed by the LLM gateway. Implementations must never
/// leak provider-specific JSON-mode quirks into `chat`; those are confined
/// to `json`, per spec §4.B / §6.
///
/// Methods are spelled as explicit `-> impl Future<...> + Send` rather than
/// `async fn` so the returned futures carry a `Send` bound: the orchestrator
/// holds these futures across a `tokio::spawn` boundary in its write-back
/// tail, which native async-fn-in-trait cannot promise for a generic `G:
/// LlmGateway` (each implementor's `async fn` body still satisfies this
/// signature unchanged).
pub trait LlmGateway: Send + Sync {
    /// Free-form text out; no JSON post-processing.
    fn chat(
        &self,
        messages: &[ChatMessage],
        model: &str,
        max_tokens: u64,
    ) -> impl Future<Output = MemoryResult<ChatResponse>> + Send;

    /// Requests JSON output matching `schema`. Applies the quirk list from
    /// spec §4.B before parsing; a schema violation surfacing after
    /// coercion is an `LlmShapeFailure`, not a panic.
    fn json(
        &self,
        messages: &[ChatMessage],
        schema: &Value,
        model: &str,
        max_tokens: u64,
        wrap_key: &str,
    ) -> impl Future<Output = MemoryResult<Value>> + Send;

    fn embed(&self, texts: &[String]) -> impl Future<Output = MemoryResult<Vec<Vec<f32>>>> + Send;

    /// Scores each candidate against `query`. Parallel to `candidates`.
    fn rerank(
        &self,
        query: &str,
        candidates: &[String],
    ) -> impl Future<Output = MemoryResult<Vec<f32>>> + Send;
}

/// Which completion provider backs a [`RigGateway`]. Mirrors the teacher's
/// `ai_instances::LLMProvider` / `agent::AgentProvider` split, generalized
/// into a single enum since the gateway no longer owns per-instance tool
/// registration.
pub enum RigProvider {
    Anthropic(Agent<anthropic::completion::CompletionModel>),
    OpenAI(Agent<openai::CompletionModel>),
    Ollama(Agent<ollama::CompletionModel>),
}

impl RigProvider {
    pub fn anthropic(api_key: &str, model: &str, preamble: &str) -> MemoryResult<Self> {
        let client = anthropic::Client::builder()
            .api_key(api_key)
            .build()
            .map_err(|e| MemoryError::LlmFailure(e.to_string()))?;
        let agent = client.agent(model).preamble(preamble).build();
        Ok(Self::Anthropic(agent))
    }

    pub fn openai(api_key: &str, model: &str, preamble: &str) -> MemoryResult<Self> {
        let client = openai::Client::builder()
            .api_key(api_key)
            .build()
            .map_err(|e| MemoryError::LlmFailure(e.to_string()))?;
        let agent = client
            .completions_api()
            .agent(model)
            .preamble(preamble)
            .build();
        Ok(Self::OpenAI(agent))
    }

    pub fn ollama(base_url: Option<&str>, model: &str, preamble: &str) -> MemoryResult<Self> {
        let client = match base_url {
            Some(url) => ollama::Client::builder()
                .api_key(Nothing)
                .base_url(url)
                .build()
                .map_err(|e| MemoryError::LlmFailure(e.to_string()))?,
            None => ollama::Client::new(Nothing).map_err(|e| MemoryError::LlmFailure(e.to_string()))?,
        };
        let agent = client.agent(model).preamble(preamble).build();
        Ok(Self::Ollama(agent))
    }

    async fn prompt(&self, prompt: &str, history: Vec<RigMessage>) -> MemoryResult<String> {
        let result = match self {
            Self::Anthropic(agent) => agent.prompt(prompt).with_history(&mut history.clone()).await,
            Self::OpenAI(agent) => agent.prompt(prompt).with_history(&mut history.clone()).await,
            Self::Ollama(agent) => agent.prompt(prompt).with_history(&mut history.clone()).await,
        };
        result.map_err(|e| MemoryError::LlmFailure(e.to_string()))
    }
}

fn to_rig_history(messages: &[ChatMessage]) -> (String, Vec<RigMessage>) {
    let mut system_parts = Vec::new();
    let mut history = Vec::new();
    let mut last_user: Option<String> = None;

    for msg in messages {
        match msg.role {
            ChatRole::System => system_parts.push(msg.content.clone()),
            ChatRole::User => {
                if let Some(prev) = last_user.take() {
                    history.push(RigMessage::user(&prev));
                }
                last_user = Some(msg.content.clone());
            }
            ChatRole::Assistant => {
                if let Some(prev) = last_user.take() {
                    history.push(RigMessage::user(&prev));
                }
                history.push(RigMessage::assistant(&msg.content));
            }
        }
    }

    let final_prompt = last_user.unwrap_or_default();
    (final_prompt, history)
}

/// Default gateway implementation: a rig-core agent for `chat`/`json`, a
/// local fastembed model for `embed`, and a cosine-similarity rerank
/// (DESIGN.md Open Question (c) — the example pack has no dedicated
/// reranker crate).
pub struct RigGateway {
    provider: RigProvider,
    embedder: Mutex<Qwen3TextEmbedding>,
}

impl RigGateway {
    /// `embedding_dim` must match the caller's `MemoryConfig::embedding_dim`
    /// (spec §6: "a single compile-time constant... callers must never mix
    /// dimensions").
    pub fn new(provider: RigProvider, embedding_dim: usize) -> MemoryResult<Self> {
        let embedder = Qwen3TextEmbedding::from_hf("Qwen/Qwen3-Embedding-0.6B", &Device::Cpu, DType::F32, embedding_dim)
            .map_err(|e| MemoryError::LlmFailure(format!("failed to load embedding model: {e:#}")))?;
        Ok(Self {
            provider,
            embedder: Mutex::new(embedder),
        })
    }

    fn embed_sync(&self, texts: &[String]) -> MemoryResult<Vec<Vec<f32>>> {
        let mut embedder = self
            .embedder
            .lock()
            .map_err(|_| MemoryError::LlmFailure("embedding model mutex poisoned".into()))?;
        embedder
            .embed(texts)
            .map_err(|e| MemoryError::LlmFailure(format!("embedding failed: {e}")))
    }
}

impl LlmGateway for RigGateway {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        _model: &str,
        _max_tokens: u64,
    ) -> MemoryResult<ChatResponse> {
        let (prompt, history) = to_rig_history(messages);
        let text = self.provider.prompt(&prompt, history).await?;
        Ok(ChatResponse {
            text,
            usage: TokenUsage::default(),
        })
    }

    async fn json(
        &self,
        messages: &[ChatMessage],
        schema: &Value,
        model: &str,
        max_tokens: u64,
        wrap_key: &str,
    ) -> MemoryResult<Value> {
        let clamped = coercion::clamp_max_tokens(max_tokens, 4096);

        let mut adjusted: Vec<ChatMessage> = messages.to_vec();
        if let Some(sys) = adjusted.iter_mut().find(|m| m.role == ChatRole::System) {
            sys.content = coercion::ensure_json_keyword(&sys.content);
        } else {
            adjusted.insert(
                0,
                ChatMessage::system(coercion::ensure_json_keyword(&format!(
                    "Respond with JSON matching this schema:\n{schema}"
                ))),
            );
        }

        let response = self.chat(&adjusted, model, clamped).await?;
        let cleaned = coercion::strip_markdown_fences(&response.text);
        let parsed: Value = serde_json::from_str(cleaned)
            .map_err(|e| MemoryError::LlmShapeFailure(format!("invalid JSON from model: {e}")))?;
        Ok(coercion::coerce_shape(parsed, wrap_key))
    }

    async fn embed(&self, texts: &[String]) -> MemoryResult<Vec<Vec<f32>>> {
        self.embed_sync(texts)
    }

    async fn rerank(&self, query: &str, candidates: &[String]) -> MemoryResult<Vec<f32>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let mut texts = vec![query.to_string()];
        texts.extend(candidates.iter().cloned());
        let embeddings = self.embed_sync(&texts)?;
        let query_vec = &embeddings[0];
        Ok(embeddings[1..]
            .iter()
            .map(|c| cosine_similarity(query_vec, c))
            .collect())
    }
}

/// Cosine similarity between two embeddings of equal dimension. Shared by
/// the gateway's rerank fallback and the memory engine's hybrid retrieval.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
