//! Shared test doubles. Compiled only under `cfg(test)`; every store and
//! agent module that needs a gateway in its unit tests reaches for
//! [`FakeGateway`] instead of standing up a real provider.

use serde_json::Value;
use std::sync::Mutex;

use crate::error::{MemoryError, MemoryResult};
use crate::llm::{ChatMessage, ChatResponse, LlmGateway, TokenUsage};

/// A scriptable gateway: queue canned `chat`/`json` responses, read back
/// the embeddings it was asked to produce deterministically from input
/// text length (good enough to exercise ranking logic without a real
/// model).
pub struct FakeGateway {
    chat_responses: Mutex<Vec<String>>,
    json_responses: Mutex<Vec<Value>>,
    pub fail_chat: Mutex<bool>,
    pub fail_json: Mutex<bool>,
}

impl Default for FakeGateway {
    fn default() -> Self {
        Self {
            chat_responses: Mutex::new(Vec::new()),
            json_responses: Mutex::new(Vec::new()),
            fail_chat: Mutex::new(false),
            fail_json: Mutex::new(false),
        }
    }
}

impl FakeGateway {
    pub fn push_chat(&self, text: impl Into<String>) {
        self.chat_responses.lock().unwrap().push(text.into());
    }

    pub fn push_json(&self, value: Value) {
        self.json_responses.lock().unwrap().push(value);
    }
}

impl LlmGateway for FakeGateway {
    async fn chat(
        &self,
        _messages: &[ChatMessage],
        _model: &str,
        _max_tokens: u64,
    ) -> MemoryResult<ChatResponse> {
        if *self.fail_chat.lock().unwrap() {
            return Err(MemoryError::LlmFailure("simulated chat failure".into()));
        }
        let mut queue = self.chat_responses.lock().unwrap();
        let text = if queue.is_empty() {
            String::new()
        } else {
            queue.remove(0)
        };
        Ok(ChatResponse {
            text,
            usage: TokenUsage::default(),
        })
    }

    async fn json(
        &self,
        _messages: &[ChatMessage],
        _schema: &Value,
        _model: &str,
        _max_tokens: u64,
        _wrap_key: &str,
    ) -> MemoryResult<Value> {
        if *self.fail_json.lock().unwrap() {
            return Err(MemoryError::LlmFailure("simulated json failure".into()));
        }
        let mut queue = self.json_responses.lock().unwrap();
        if queue.is_empty() {
            return Err(MemoryError::LlmShapeFailure("no canned response queued".into()));
        }
        Ok(queue.remove(0))
    }

    async fn embed(&self, texts: &[String]) -> MemoryResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| fake_embedding(t)).collect())
    }

    async fn rerank(&self, query: &str, candidates: &[String]) -> MemoryResult<Vec<f32>> {
        let q = fake_embedding(query);
        Ok(candidates
            .iter()
            .map(|c| crate::llm::gateway::cosine_similarity(&q, &fake_embedding(c)))
            .collect())
    }
}

/// A cheap deterministic "embedding": bag-of-characters histogram. Good
/// enough to give near-duplicate strings high cosine similarity in tests
/// without loading a real model.
fn fake_embedding(text: &str) -> Vec<f32> {
    let mut buckets = vec![0f32; 32];
    for byte in text.bytes() {
        buckets[(byte as usize) % 32] += 1.0;
    }
    buckets
}
