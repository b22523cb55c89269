//! Scheduled batch work interface (spec §9: daily-summary and long-arc
//! "psychologist" slot extraction are named but explicitly out of scope for
//! a concrete body). Mirrors the teacher's `scheduler::jobs::ScheduledJob`
//! trait shape so a concrete cron runner can be wired in later without
//! touching this crate.

use chrono::{DateTime, Utc};

use crate::error::MemoryResult;

/// A unit of work a future cron-style runner would invoke for a user on a
/// schedule (e.g. nightly). This crate defines only the interface; no
/// concrete job (daily summary, long-arc trait extraction) ships here.
pub trait ScheduledBatchJob: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, user: &str, now: DateTime<Utc>) -> MemoryResult<serde_json::Value>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopJob;

    impl ScheduledBatchJob for NoopJob {
        fn name(&self) -> &str {
            "noop"
        }

        async fn run(&self, _user: &str, _now: DateTime<Utc>) -> MemoryResult<serde_json::Value> {
            Ok(serde_json::json!({}))
        }
    }

    #[tokio::test]
    async fn trait_is_object_usable_via_generics() {
        let job = NoopJob;
        let result = job.run("alice", Utc::now()).await.unwrap();
        assert_eq!(result, serde_json::json!({}));
        assert_eq!(job.name(), "noop");
    }
}
