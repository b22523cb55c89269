//! Given profile + active focus + recent history, chooses at most one hint
//! for next turn and records which focus it consumed (spec §4.I).
//! Grounded on `original_source/agents/whisperer_agent.py`'s five-section
//! prompt and restraint rule, re-expressed in the teacher's idiom of
//! building a formatted prompt string (`agent::OwnAIAgent::system_prompt`).

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::context::Message;
use crate::focus::FocusItem;
use crate::llm::{ChatMessage, LlmGateway};
use crate::profile::Profile;

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
struct WhisperPlan {
    inject: Option<String>,
    used_focus_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WhisperDecision {
    pub inject: Option<String>,
    pub used_focus_id: Option<i64>,
}

/// Serializes `active_focus` per spec §6's wire format:
/// `[ID: <int>] <content> (recorded_at: YYYY-MM-DD, deadline: YYYY-MM-DD)`,
/// omitting `deadline` when absent.
fn render_focus_line(focus: &FocusItem) -> String {
    match focus.expected_date {
        Some(date) => format!(
            "[ID: {}] {} (recorded_at: {}, deadline: {})",
            focus.id,
            focus.content,
            focus.created_at.format("%Y-%m-%d"),
            date.format("%Y-%m-%d")
        ),
        None => format!(
            "[ID: {}] {} (recorded_at: {})",
            focus.id,
            focus.content,
            focus.created_at.format("%Y-%m-%d")
        ),
    }
}

pub struct WhisperPlanner;

impl WhisperPlanner {
    /// Empty-workload skip (spec §4.I): if profile is empty, active focus
    /// is empty, and fewer than ~2 messages of history exist, the planner
    /// is not invoked at all.
    fn should_skip(profile: &Profile, active_focus: &[FocusItem], recent_history: &[Message]) -> bool {
        profile.is_empty() && active_focus.is_empty() && recent_history.len() < 2
    }

    pub async fn plan<G: LlmGateway>(
        &self,
        profile: &Profile,
        active_focus: &[FocusItem],
        chat_summary: &str,
        recent_history: &[Message],
        current_time: DateTime<Utc>,
        gateway: &G,
    ) -> WhisperDecision {
        if Self::should_skip(profile, active_focus, recent_history) {
            return WhisperDecision::default();
        }

        match self
            .try_plan(profile, active_focus, chat_summary, recent_history, current_time, gateway)
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(error = %e, "whisper planning failed, skipping");
                WhisperDecision::default()
            }
        }
    }

    async fn try_plan<G: LlmGateway>(
        &self,
        profile: &Profile,
        active_focus: &[FocusItem],
        chat_summary: &str,
        recent_history: &[Message],
        current_time: DateTime<Utc>,
        gateway: &G,
    ) -> crate::error::MemoryResult<WhisperDecision> {
        let profile_json = serde_json::to_string(
            &profile
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), v))
                .collect::<std::collections::HashMap<_, _>>(),
        )?;
        let focus_lines = active_focus.iter().map(render_focus_line).collect::<Vec<_>>().join("\n");
        let history_text = recent_history
            .iter()
            .map(|m| format!("{:?}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let schema = serde_json::to_value(schemars::schema_for!(WhisperPlan))?;
        let system = format!(
            "You plan at most one line of proactive guidance for the next turn. \
             Sections:\n\
             current_time: {}\n\
             user_profile: {}\n\
             recent_focus:\n{}\n\
             chat_summary (background only, never a trigger): {}\n\
             chat_history:\n{}\n\n\
             Rules: emit guidance only if (a) the latest turn semantically relates to a focus \
             or profile fact AND the character has not yet referenced it in chat_history, OR \
             (b) current_time is close to a focus's expected date. Most turns should return \
             inject=null; never force an injection. If you use a focus item, its used_focus_id \
             must match one of the [ID: ...] values above. Return JSON {{inject, used_focus_id}}.",
            current_time.format("%Y-%m-%d %H:%M"),
            profile_json,
            focus_lines,
            chat_summary,
            history_text
        );
        let messages = [ChatMessage::system(system), ChatMessage::user("Plan the next-turn guidance.")];

        let value = gateway.json(&messages, &schema, "planner", 512, "result").await?;
        let plan: WhisperPlan = serde_json::from_value(value)?;

        let valid_ids: Vec<i64> = active_focus.iter().map(|f| f.id).collect();
        let used_focus_id = plan.used_focus_id.filter(|id| valid_ids.contains(id));

        Ok(WhisperDecision {
            inject: plan.inject.filter(|s| !s.is_empty()),
            used_focus_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::context::Role;
    use crate::focus::FocusStatus;
    use crate::test_support::FakeGateway;
    use serde_json::json;

    fn sample_focus(id: i64) -> FocusItem {
        FocusItem {
            id,
            user: "alice".into(),
            content: "用户 2026-02-04 有面试".into(),
            status: FocusStatus::Active,
            expected_date: chrono::NaiveDate::from_ymd_opt(2026, 2, 4),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_injected_at: None,
        }
    }

    #[tokio::test]
    async fn empty_workload_skips_without_calling_gateway() {
        let planner = WhisperPlanner;
        let gateway = FakeGateway::default();
        let profile = Profile::new();
        let history = vec![Message {
            role: Role::User,
            content: "hi".into(),
            created_at: Utc::now(),
        }];

        let decision = planner.plan(&profile, &[], "", &history, Utc::now(), &gateway).await;
        assert_eq!(decision, WhisperDecision::default());
    }

    #[tokio::test]
    async fn whisper_cooldown_scenario_produces_used_focus_id() {
        let planner = WhisperPlanner;
        let gateway = FakeGateway::default();
        let focus = sample_focus(42);
        gateway.push_json(json!({
            "inject": "用户下周有面试，适合主动关心一下",
            "used_focus_id": 42
        }));
        let history = vec![
            Message { role: Role::User, content: "最近有点紧张".into(), created_at: Utc::now() },
            Message { role: Role::Assistant, content: "怎么了".into(), created_at: Utc::now() },
        ];
        let profile = Profile::new();

        let decision = planner
            .plan(&profile, &[focus], "", &history, Utc::now(), &gateway)
            .await;

        assert_eq!(decision.inject.as_deref(), Some("用户下周有面试，适合主动关心一下"));
        assert_eq!(decision.used_focus_id, Some(42));
    }

    #[tokio::test]
    async fn used_focus_id_must_reference_a_known_id() {
        let planner = WhisperPlanner;
        let gateway = FakeGateway::default();
        let focus = sample_focus(1);
        gateway.push_json(json!({"inject": "hint", "used_focus_id": 999}));
        let history = vec![
            Message { role: Role::User, content: "a".into(), created_at: Utc::now() },
            Message { role: Role::User, content: "b".into(), created_at: Utc::now() },
        ];
        let profile = Profile::new();

        let decision = planner.plan(&profile, &[focus], "", &history, Utc::now(), &gateway).await;
        assert_eq!(decision.used_focus_id, None);
    }

    #[tokio::test]
    async fn failure_yields_no_inject() {
        let planner = WhisperPlanner;
        let gateway = FakeGateway::default();
        *gateway.fail_json.lock().unwrap() = true;
        let focus = sample_focus(1);
        let history = vec![
            Message { role: Role::User, content: "a".into(), created_at: Utc::now() },
            Message { role: Role::User, content: "b".into(), created_at: Utc::now() },
        ];
        let profile = Profile::new();

        let decision = planner.plan(&profile, &[focus], "", &history, Utc::now(), &gateway).await;
        assert_eq!(decision, WhisperDecision::default());
    }

    #[test]
    fn render_focus_line_matches_wire_format() {
        let focus = sample_focus(7);
        let line = render_focus_line(&focus);
        assert!(line.starts_with("[ID: 7]"));
        assert!(line.contains("deadline: 2026-02-04"));
    }

    #[allow(dead_code)]
    fn _unused_config() -> MemoryConfig {
        MemoryConfig::default()
    }
}
