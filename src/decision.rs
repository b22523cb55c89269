//! Cheap yes/no judgements: should-retrieve, should-store (spec §4.H). No
//! teacher analogue; modeled as a thin gateway `json` caller with the
//! fail-open/fail-closed policy table spec §9's design notes call for.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::llm::{ChatMessage, LlmGateway};

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct Verdict {
    decision: bool,
    reason: String,
}

pub struct DecisionAgent;

impl DecisionAgent {
    /// True for questions referencing user history/preferences/identity or
    /// carrying past-tense/time-deictic markers; false for general
    /// knowledge and greetings. Defaults **true** on error (fail-open for
    /// recall, spec §4.H/§7).
    pub async fn should_retrieve<G: LlmGateway>(&self, query: &str, gateway: &G) -> (bool, String) {
        let schema = serde_json::to_value(schemars::schema_for!(Verdict)).unwrap();
        let messages = [
            ChatMessage::system(
                "Decide whether answering this message benefits from retrieving the user's \
                 stored history, preferences, or identity facts. True for questions about the \
                 user's past, preferences, or identity, or carrying past-tense/time-deictic \
                 markers. False for general knowledge questions and greetings. Return JSON \
                 {decision, reason}.",
            ),
            ChatMessage::user(query.to_string()),
        ];

        match gateway.json(&messages, &schema, "decider", 256, "result").await {
            Ok(value) => match serde_json::from_value::<Verdict>(value) {
                Ok(v) => (v.decision, v.reason),
                Err(_) => (true, "unparseable decision, defaulting to retrieve".to_string()),
            },
            Err(e) => {
                tracing::warn!(error = %e, "should_retrieve failed, defaulting to true (fail-open)");
                (true, "decision call failed".to_string())
            }
        }
    }

    /// True for preferences, identity facts, important events, explicit
    /// "remember this"; false for chit-chat. Defaults **false** on error
    /// (fail-closed for ingestion, spec §4.H/§7).
    pub async fn should_store<G: LlmGateway>(&self, messages_text: &str, gateway: &G) -> (bool, String) {
        let schema = serde_json::to_value(schemars::schema_for!(Verdict)).unwrap();
        let messages = [
            ChatMessage::system(
                "Decide whether this turn contains information worth storing long-term: \
                 preferences, identity facts, important events, or an explicit request to \
                 remember something. False for ordinary chit-chat. Return JSON {decision, reason}.",
            ),
            ChatMessage::user(messages_text.to_string()),
        ];

        match gateway.json(&messages, &schema, "decider", 256, "result").await {
            Ok(value) => match serde_json::from_value::<Verdict>(value) {
                Ok(v) => (v.decision, v.reason),
                Err(_) => (false, "unparseable decision, defaulting to skip".to_string()),
            },
            Err(e) => {
                tracing::warn!(error = %e, "should_store failed, defaulting to false (fail-closed)");
                (false, "decision call failed".to_string())
            }
        }
    }
}
