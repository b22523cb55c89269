//! From a single turn: user-slot updates, memory items, recent-focus items.
//! A single schemars-typed LLM call returns a three-list shape; relative
//! dates in the model's own output ("明天", "下周三", ...) are rewritten to
//! absolute `NaiveDate`s against the turn's clock before anything downstream
//! sees them.

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::MemoryResult;
use crate::llm::{ChatMessage, LlmGateway};
use crate::profile::{validate_extracted_slot, SlotUpdate, SlotValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryItemType {
    Event,
    Fact,
    Preference,
    SharedMemory,
    WorldSetting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryItemSource {
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct MemoryItem {
    pub content: String,
    pub item_type: MemoryItemType,
    pub source: MemoryItemSource,
}

#[derive(Debug, Clone)]
pub struct RecentFocusItem {
    pub content: String,
    pub evidence: String,
    pub expected_date: Option<NaiveDate>,
}

/// Validated output of one extraction pass.
#[derive(Debug, Clone, Default)]
pub struct ExtractionResult {
    pub slot_updates: Vec<SlotUpdate>,
    pub memory_items: Vec<MemoryItem>,
    pub recent_focus: Vec<RecentFocusItem>,
}

/// Raw shape requested from the gateway's `json` call, before validation.
#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct RawExtraction {
    slot_updates: Vec<RawSlotUpdate>,
    memory_items: Vec<RawMemoryItem>,
    recent_focus: Vec<RawFocusItem>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct RawSlotUpdate {
    slot: String,
    value: serde_json::Value,
    #[allow(dead_code)]
    evidence: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct RawMemoryItem {
    content: String,
    #[serde(rename = "type")]
    item_type: String,
    source: String,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct RawFocusItem {
    content: String,
    evidence: String,
    expected_date: Option<String>,
}

pub struct ExtractionAgent {
    relative_date_re: Regex,
}

impl Default for ExtractionAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractionAgent {
    pub fn new() -> Self {
        Self {
            relative_date_re: Regex::new(r"(今天|明天|后天|大后天|下周[一二三四五六日天]|这周[一二三四五六日天])")
                .expect("static regex"),
        }
    }

    /// Extract from the current user utterance and assistant reply (if
    /// any). On any failure, returns empty lists — never blocks the turn.
    pub async fn extract<G: LlmGateway>(
        &self,
        user_message: &str,
        assistant_reply: Option<&str>,
        now: DateTime<Utc>,
        gateway: &G,
    ) -> ExtractionResult {
        match self.try_extract(user_message, assistant_reply, now, gateway).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(error = %e, "extraction failed, returning empty lists");
                ExtractionResult::default()
            }
        }
    }

    async fn try_extract<G: LlmGateway>(
        &self,
        user_message: &str,
        assistant_reply: Option<&str>,
        now: DateTime<Utc>,
        gateway: &G,
    ) -> MemoryResult<ExtractionResult> {
        let schema = serde_json::to_value(schemars::schema_for!(RawExtraction))?;
        let system = format!(
            "You extract structured memory signals from one conversational turn. \
             Rewrite first-person pronouns in memory_items to third-person narration. \
             Rewrite relative time phrases (e.g. \"day after tomorrow\", \"this Friday\") to \
             absolute dates using {} as the current date, in both `content` and `expected_date`. \
             A recent_focus item requires both timeliness (imminent or ongoing) and emotional \
             salience; do not report past idle events. Return JSON matching the given schema; \
             use empty arrays when nothing applies.",
            now.format("%Y-%m-%d")
        );
        let mut user_text = format!("User: {user_message}");
        if let Some(reply) = assistant_reply {
            user_text.push_str(&format!("\nAssistant: {reply}"));
        }
        let messages = [ChatMessage::system(system), ChatMessage::user(user_text)];

        let value = gateway.json(&messages, &schema, "extractor", 2048, "slot_updates").await?;
        let raw: RawExtraction = serde_json::from_value(value)?;

        Ok(self.validate(raw))
    }

    fn validate(&self, raw: RawExtraction) -> ExtractionResult {
        let slot_updates = raw
            .slot_updates
            .into_iter()
            .filter_map(|u| {
                let value = match u.value {
                    serde_json::Value::Array(items) => SlotValue::List(
                        items.into_iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
                    ),
                    serde_json::Value::String(s) => SlotValue::Text(s),
                    _ => return None,
                };
                validate_extracted_slot(&u.slot, value)
            })
            .collect();

        let memory_items = raw
            .memory_items
            .into_iter()
            .filter_map(|m| {
                let item_type = match m.item_type.as_str() {
                    "event" => MemoryItemType::Event,
                    "fact" => MemoryItemType::Fact,
                    "preference" => MemoryItemType::Preference,
                    "shared_memory" => MemoryItemType::SharedMemory,
                    "world_setting" => MemoryItemType::WorldSetting,
                    _ => return None,
                };
                let source = match m.source.as_str() {
                    "user" => MemoryItemSource::User,
                    "assistant" => MemoryItemSource::Assistant,
                    _ => return None,
                };
                if m.content.is_empty() {
                    return None;
                }
                Some(MemoryItem {
                    content: m.content,
                    item_type,
                    source,
                })
            })
            .collect();

        let recent_focus = raw
            .recent_focus
            .into_iter()
            .filter(|f| !f.content.is_empty())
            .map(|f| RecentFocusItem {
                content: f.content,
                evidence: f.evidence,
                expected_date: f
                    .expected_date
                    .as_deref()
                    .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()),
            })
            .collect();

        ExtractionResult {
            slot_updates,
            memory_items,
            recent_focus,
        }
    }

    /// Whether `text` carries a relative-date phrase the prompt is
    /// expected to have rewritten. Exposed so tests/callers can assert the
    /// rewrite actually happened rather than trusting the model blindly.
    pub fn contains_relative_date_phrase(&self, text: &str) -> bool {
        self.relative_date_re.is_match(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeGateway;
    use serde_json::json;

    #[tokio::test]
    async fn slot_extract_scenario() {
        let agent = ExtractionAgent::new();
        let gateway = FakeGateway::default();
        gateway.push_json(json!({
            "slot_updates": [
                {"slot": "nickname", "value": "小明", "evidence": "我叫小明"},
                {"slot": "occupation", "value": "程序员", "evidence": "是个程序员"},
                {"slot": "hobbies", "value": ["打游戏", "看日本动漫"], "evidence": "喜欢打游戏和看日本动漫"}
            ],
            "memory_items": [],
            "recent_focus": []
        }));

        let result = agent
            .extract(
                "我叫小明，是个程序员，平时喜欢打游戏和看日本动漫。",
                None,
                Utc::now(),
                &gateway,
            )
            .await;

        assert_eq!(result.slot_updates.len(), 3);
        assert!(result.memory_items.is_empty());
        assert!(result.recent_focus.is_empty());
    }

    #[tokio::test]
    async fn focus_with_relative_date() {
        let agent = ExtractionAgent::new();
        let gateway = FakeGateway::default();
        gateway.push_json(json!({
            "slot_updates": [],
            "memory_items": [],
            "recent_focus": [
                {"content": "用户 2026-02-04 有面试", "evidence": "我下周三要面试", "expected_date": "2026-02-04"}
            ]
        }));

        let result = agent.extract("我下周三要面试。", None, Utc::now(), &gateway).await;
        assert_eq!(result.recent_focus.len(), 1);
        assert_eq!(
            result.recent_focus[0].expected_date,
            NaiveDate::from_ymd_opt(2026, 2, 4)
        );
    }

    #[tokio::test]
    async fn unknown_slot_dropped() {
        let agent = ExtractionAgent::new();
        let gateway = FakeGateway::default();
        gateway.push_json(json!({
            "slot_updates": [{"slot": "favorite_color", "value": "blue", "evidence": "e"}],
            "memory_items": [],
            "recent_focus": []
        }));

        let result = agent.extract("test", None, Utc::now(), &gateway).await;
        assert!(result.slot_updates.is_empty());
    }

    #[tokio::test]
    async fn failure_yields_empty_result() {
        let agent = ExtractionAgent::new();
        let gateway = FakeGateway::default();
        *gateway.fail_json.lock().unwrap() = true;

        let result = agent.extract("anything", None, Utc::now(), &gateway).await;
        assert!(result.slot_updates.is_empty());
        assert!(result.memory_items.is_empty());
        assert!(result.recent_focus.is_empty());
    }

    #[test]
    fn detects_relative_date_phrases() {
        let agent = ExtractionAgent::new();
        assert!(agent.contains_relative_date_phrase("我下周三要面试"));
        assert!(!agent.contains_relative_date_phrase("用户 2026-02-04 有面试"));
    }
}
