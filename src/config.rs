use chrono::Duration;

/// Tunables shared across the stores: compaction/expiry windows, embedding
/// dimension, and retrieval defaults.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Context compaction fires when `len(recent)/2 >= rounds_before_compaction`.
    pub rounds_before_compaction: usize,
    /// Session summary is cleared on next read after this much silence.
    pub session_timeout: Duration,
    /// Focus items with no `expected_date` expire this long after creation.
    pub focus_ttl: Duration,
    /// A focus item already injected is suppressed for this long.
    pub focus_cooldown: Duration,
    /// Compile-time-fixed embedding dimension; callers must never mix
    /// embeddings of different dimensions.
    pub embedding_dim: usize,
    /// Hard clamp applied to every `json` gateway call's `max_tokens`.
    pub json_max_tokens: u64,
    /// Default top-k for hybrid retrieval.
    pub retrieval_k: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            rounds_before_compaction: 50,
            session_timeout: Duration::hours(3),
            focus_ttl: Duration::days(14),
            focus_cooldown: Duration::hours(12),
            embedding_dim: 1024,
            json_max_tokens: 4096,
            retrieval_k: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_expected_values() {
        let cfg = MemoryConfig::default();
        assert_eq!(cfg.rounds_before_compaction, 50);
        assert_eq!(cfg.session_timeout, Duration::hours(3));
        assert_eq!(cfg.focus_ttl, Duration::days(14));
        assert_eq!(cfg.focus_cooldown, Duration::hours(12));
        assert_eq!(cfg.embedding_dim, 1024);
        assert_eq!(cfg.json_max_tokens, 4096);
    }
}
