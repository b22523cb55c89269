//! Keyed slot map per user, persisted; merge policy dispatcher (spec §3,
//! §4.C). Generalizes `database::schema`'s open-ended `user_profile`
//! key/value table into the closed ~30-key enum `original_source`'s
//! `profile_service.py` curates, grouped into families.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;

use crate::error::MemoryResult;
use crate::llm::{ChatMessage, LlmGateway};

/// The closed slot vocabulary (spec §3: "closed enum of ~30 keys grouped
/// into families"). Unknown keys coming back from extraction are dropped,
/// never added here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKey {
    // identity
    Nickname,
    RealName,
    Occupation,
    AgeRange,
    Gender,
    Location,
    // lifestyle
    Hobbies,
    DailyRoutine,
    DietaryPreference,
    SleepSchedule,
    PetNames,
    // communication-preference
    PreferredTone,
    PreferredLanguage,
    AddressingStyle,
    ResponseLength,
    // traits
    MbtiLikeTraits,
    CoreValues,
    Strengths,
    Weaknesses,
    // needs
    CurrentGoals,
    EmotionalNeeds,
    SupportStyle,
    TriggersToAvoid,
    // deep-psychology
    AttachmentStyle,
    CopingMechanisms,
    FormativeExperiences,
    FearsAndAnxieties,
    CoreBeliefs,
    SelfImage,
    RelationshipPatterns,
}

impl SlotKey {
    pub fn from_str(s: &str) -> Option<Self> {
        serde_json::from_value(Value::String(s.to_string())).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nickname => "nickname",
            Self::RealName => "real_name",
            Self::Occupation => "occupation",
            Self::AgeRange => "age_range",
            Self::Gender => "gender",
            Self::Location => "location",
            Self::Hobbies => "hobbies",
            Self::DailyRoutine => "daily_routine",
            Self::DietaryPreference => "dietary_preference",
            Self::SleepSchedule => "sleep_schedule",
            Self::PetNames => "pet_names",
            Self::PreferredTone => "preferred_tone",
            Self::PreferredLanguage => "preferred_language",
            Self::AddressingStyle => "addressing_style",
            Self::ResponseLength => "response_length",
            Self::MbtiLikeTraits => "mbti_like_traits",
            Self::CoreValues => "core_values",
            Self::Strengths => "strengths",
            Self::Weaknesses => "weaknesses",
            Self::CurrentGoals => "current_goals",
            Self::EmotionalNeeds => "emotional_needs",
            Self::SupportStyle => "support_style",
            Self::TriggersToAvoid => "triggers_to_avoid",
            Self::AttachmentStyle => "attachment_style",
            Self::CopingMechanisms => "coping_mechanisms",
            Self::FormativeExperiences => "formative_experiences",
            Self::FearsAndAnxieties => "fears_and_anxieties",
            Self::CoreBeliefs => "core_beliefs",
            Self::SelfImage => "self_image",
            Self::RelationshipPatterns => "relationship_patterns",
        }
    }

    /// Per-slot merge strategy (spec §3, design note in spec §9).
    pub fn merge_strategy(&self) -> MergeStrategy {
        use SlotKey::*;
        match self {
            Nickname | RealName | Occupation | AgeRange | Gender | Location | DailyRoutine
            | DietaryPreference | SleepSchedule | PreferredTone | PreferredLanguage
            | AddressingStyle | ResponseLength => MergeStrategy::Replace,
            Hobbies | PetNames | CoreValues | Strengths | Weaknesses | CurrentGoals
            | EmotionalNeeds | TriggersToAvoid | MbtiLikeTraits => MergeStrategy::Append,
            SupportStyle | AttachmentStyle | CopingMechanisms | FormativeExperiences
            | FearsAndAnxieties | CoreBeliefs | SelfImage | RelationshipPatterns => {
                MergeStrategy::Adjudicate
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    Replace,
    Append,
    Adjudicate,
}

/// A slot's persisted value: either a single string or a list of short
/// strings (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SlotValue {
    Text(String),
    List(Vec<String>),
}

impl SlotValue {
    fn is_empty(&self) -> bool {
        match self {
            Self::Text(s) => s.is_empty(),
            Self::List(items) => items.is_empty() || items.iter().all(|s| s.is_empty()),
        }
    }
}

/// One requested update against a slot.
#[derive(Debug, Clone)]
pub struct SlotUpdate {
    pub slot: SlotKey,
    pub value: SlotValue,
}

pub type Profile = HashMap<SlotKey, SlotValue>;

/// Phantom gateway type for call sites that only ever hit `Replace`/`Append`
/// slots and so pass `None`; `batch_update` is generic over the gateway, so
/// monomorphization needs a concrete (never-constructed) type to satisfy it.
pub struct NoGateway;

impl LlmGateway for NoGateway {
    async fn chat(&self, _: &[ChatMessage], _: &str, _: u64) -> MemoryResult<crate::llm::ChatResponse> {
        unreachable!("NoGateway is never called")
    }
    async fn json(&self, _: &[ChatMessage], _: &Value, _: &str, _: u64, _: &str) -> MemoryResult<Value> {
        unreachable!("NoGateway is never called")
    }
    async fn embed(&self, _: &[String]) -> MemoryResult<Vec<Vec<f32>>> {
        unreachable!("NoGateway is never called")
    }
    async fn rerank(&self, _: &str, _: &[String]) -> MemoryResult<Vec<f32>> {
        unreachable!("NoGateway is never called")
    }
}

pub struct ProfileStore {
    db: Pool<Sqlite>,
}

impl ProfileStore {
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }

    pub async fn get_all(&self, user: &str) -> MemoryResult<Profile> {
        let row = sqlx::query("SELECT slots_json FROM user_profile WHERE user = ?")
            .bind(user)
            .fetch_optional(&self.db)
            .await?;
        match row {
            Some(row) => {
                let slots_json: String = row.get("slots_json");
                let raw: HashMap<String, SlotValue> = serde_json::from_str(&slots_json)?;
                Ok(raw
                    .into_iter()
                    .filter_map(|(k, v)| SlotKey::from_str(&k).map(|key| (key, v)))
                    .collect())
            }
            None => Ok(Profile::new()),
        }
    }

    pub async fn update_slot(&self, user: &str, slot: SlotKey, value: SlotValue) -> MemoryResult<()> {
        self.batch_update::<NoGateway>(user, &[SlotUpdate { slot, value }], None)
            .await?;
        Ok(())
    }

    /// Apply each update per that slot's merge strategy (spec §4.C).
    /// `gateway` is required only for `adjudicate` slots; pass `None` when
    /// no such slots are present in `updates` (e.g. extraction's
    /// non-adjudicated fast path).
    pub async fn batch_update<G: LlmGateway>(
        &self,
        user: &str,
        updates: &[SlotUpdate],
        gateway: Option<&G>,
    ) -> MemoryResult<bool> {
        let mut profile = self.get_all(user).await?;
        let mut changed = false;

        for update in updates {
            if update.value.is_empty() {
                tracing::warn!(user, slot = update.slot.as_str(), "dropping empty slot value");
                continue;
            }

            let merged = match update.slot.merge_strategy() {
                MergeStrategy::Replace => {
                    let old = profile.get(&update.slot);
                    if old == Some(&update.value) {
                        continue;
                    }
                    update.value.clone()
                }
                MergeStrategy::Append => {
                    let new_items = match &update.value {
                        SlotValue::List(items) => items.clone(),
                        SlotValue::Text(s) => vec![s.clone()],
                    };
                    let mut merged_items = match profile.get(&update.slot) {
                        Some(SlotValue::List(items)) => items.clone(),
                        Some(SlotValue::Text(s)) => vec![s.clone()],
                        None => Vec::new(),
                    };
                    let before_len = merged_items.len();
                    for item in new_items {
                        if !merged_items.contains(&item) {
                            merged_items.push(item);
                        }
                    }
                    if merged_items.len() == before_len {
                        continue;
                    }
                    SlotValue::List(merged_items)
                }
                MergeStrategy::Adjudicate => {
                    let old = profile.get(&update.slot).cloned();
                    match (old, gateway) {
                        (None, _) => update.value.clone(),
                        (Some(old), Some(gateway)) => {
                            self.adjudicate(user, &update.slot, &old, &update.value, gateway)
                                .await
                        }
                        (Some(_), None) => update.value.clone(),
                    }
                }
            };

            profile.insert(update.slot, merged);
            changed = true;
        }

        if !changed {
            return Ok(false);
        }

        self.persist(user, &profile).await?;
        Ok(true)
    }

    /// Ask the gateway to choose `replace | merge` between old and new
    /// values; fall back to the new value if parsing fails (spec §4.C).
    async fn adjudicate<G: LlmGateway>(
        &self,
        user: &str,
        slot: &SlotKey,
        old: &SlotValue,
        new: &SlotValue,
        gateway: &G,
    ) -> SlotValue {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "decision": {"type": "string", "enum": ["replace", "merge"]},
                "value": {"type": "string"}
            },
            "required": ["decision", "value"]
        });
        let prompt = format!(
            "Slot `{}`. Old value: {:?}. New observation: {:?}. \
             Decide whether the new observation should replace the old value or be merged \
             with it, and return the resulting value as JSON {{decision, value}}.",
            slot.as_str(),
            old,
            new
        );
        let messages = [ChatMessage::system("Respond with JSON."), ChatMessage::user(prompt)];

        match gateway.json(&messages, &schema, "adjudicator", 512, "result").await {
            Ok(value) => match value.get("value").and_then(Value::as_str) {
                Some(text) if !text.is_empty() => SlotValue::Text(text.to_string()),
                _ => new.clone(),
            },
            Err(e) => {
                tracing::warn!(user, slot = slot.as_str(), error = %e, "adjudication failed, using new value");
                new.clone()
            }
        }
    }

    async fn persist(&self, user: &str, profile: &Profile) -> MemoryResult<()> {
        let as_strings: HashMap<&str, &SlotValue> =
            profile.iter().map(|(k, v)| (k.as_str(), v)).collect();
        let slots_json = serde_json::to_string(&as_strings)?;
        let now = chrono::Utc::now();

        sqlx::query(
            r#"
            INSERT INTO user_profile (user, slots_json, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user) DO UPDATE SET slots_json = excluded.slots_json, updated_at = excluded.updated_at
            "#,
        )
        .bind(user)
        .bind(&slots_json)
        .bind(now)
        .bind(now)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn clear(&self, user: &str) -> MemoryResult<()> {
        sqlx::query("DELETE FROM user_profile WHERE user = ?")
            .bind(user)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

/// Validates a raw `(slot_key_string, value)` pair coming back from
/// extraction against the closed enum; unknown keys are dropped with a
/// warning (spec §4.C).
pub fn validate_extracted_slot(slot: &str, value: SlotValue) -> Option<SlotUpdate> {
    match SlotKey::from_str(slot) {
        Some(slot) if !value.is_empty() => Some(SlotUpdate { slot, value }),
        Some(_) => None,
        None => {
            tracing::warn!(slot, "dropping unknown slot key from extraction");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;

    #[tokio::test]
    async fn replace_strategy_overwrites() {
        let db = init_test_db().await.unwrap();
        let store = ProfileStore::new(db);
        let gw: Option<&crate::test_support::FakeGateway> = None;

        store
            .batch_update(
                "alice",
                &[SlotUpdate {
                    slot: SlotKey::Occupation,
                    value: SlotValue::Text("程序员".into()),
                }],
                gw,
            )
            .await
            .unwrap();

        let profile = store.get_all("alice").await.unwrap();
        assert_eq!(
            profile.get(&SlotKey::Occupation),
            Some(&SlotValue::Text("程序员".into()))
        );
    }

    #[tokio::test]
    async fn append_strategy_deduplicates() {
        let db = init_test_db().await.unwrap();
        let store = ProfileStore::new(db);
        let gw: Option<&crate::test_support::FakeGateway> = None;

        store
            .batch_update(
                "bob",
                &[SlotUpdate {
                    slot: SlotKey::Hobbies,
                    value: SlotValue::List(vec!["打游戏".into(), "看日本动漫".into()]),
                }],
                gw,
            )
            .await
            .unwrap();
        store
            .batch_update(
                "bob",
                &[SlotUpdate {
                    slot: SlotKey::Hobbies,
                    value: SlotValue::List(vec!["打游戏".into(), "跑步".into()]),
                }],
                gw,
            )
            .await
            .unwrap();

        let profile = store.get_all("bob").await.unwrap();
        match profile.get(&SlotKey::Hobbies).unwrap() {
            SlotValue::List(items) => {
                assert_eq!(items, &vec!["打游戏".to_string(), "看日本动漫".to_string(), "跑步".to_string()]);
            }
            _ => panic!("expected list"),
        }
    }

    #[tokio::test]
    async fn batch_update_idempotent() {
        let db = init_test_db().await.unwrap();
        let store = ProfileStore::new(db);
        let gw: Option<&crate::test_support::FakeGateway> = None;
        let updates = vec![SlotUpdate {
            slot: SlotKey::Nickname,
            value: SlotValue::Text("小明".into()),
        }];

        store.batch_update("carol", &updates, gw).await.unwrap();
        let after_first = store.get_all("carol").await.unwrap();

        let changed = store.batch_update("carol", &updates, gw).await.unwrap();
        let after_second = store.get_all("carol").await.unwrap();

        assert!(!changed);
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn empty_values_never_persist() {
        let db = init_test_db().await.unwrap();
        let store = ProfileStore::new(db);
        let gw: Option<&crate::test_support::FakeGateway> = None;

        let changed = store
            .batch_update(
                "dave",
                &[SlotUpdate {
                    slot: SlotKey::Nickname,
                    value: SlotValue::Text("".into()),
                }],
                gw,
            )
            .await
            .unwrap();

        assert!(!changed);
        let profile = store.get_all("dave").await.unwrap();
        assert!(profile.is_empty());
    }

    #[tokio::test]
    async fn adjudicate_falls_back_to_new_on_unparseable_result() {
        let db = init_test_db().await.unwrap();
        let store = ProfileStore::new(db);
        let gateway = crate::test_support::FakeGateway::default();

        store
            .batch_update(
                "erin",
                &[SlotUpdate {
                    slot: SlotKey::AttachmentStyle,
                    value: SlotValue::Text("anxious".into()),
                }],
                Some(&gateway),
            )
            .await
            .unwrap();

        gateway.push_json(serde_json::json!({"decision": "replace", "value": "secure"}));
        store
            .batch_update(
                "erin",
                &[SlotUpdate {
                    slot: SlotKey::AttachmentStyle,
                    value: SlotValue::Text("secure-leaning".into()),
                }],
                Some(&gateway),
            )
            .await
            .unwrap();

        let profile = store.get_all("erin").await.unwrap();
        assert_eq!(
            profile.get(&SlotKey::AttachmentStyle),
            Some(&SlotValue::Text("secure".into()))
        );
    }

    #[test]
    fn unknown_slot_is_dropped() {
        assert!(validate_extracted_slot("not_a_real_slot", SlotValue::Text("x".into())).is_none());
    }
}
