use thiserror::Error;

/// Structured error taxonomy for the memory backend.
///
/// Every fallible public API returns `Result<T, MemoryError>`. `anyhow` is
/// still used at the thinnest glue points (the same mix the rest of this
/// codebase already uses), but nothing that crosses a store or agent
/// boundary returns a bare `anyhow::Error`.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("LLM call failed: {0}")]
    LlmFailure(String),

    #[error("LLM response did not match the expected shape: {0}")]
    LlmShapeFailure(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("store conflict for user {user}: lock held past timeout")]
    StoreConflict { user: String },

    #[error("graph write failed for user {user}: {reason}")]
    GraphWriteFailure { user: String, reason: String },

    #[error("validation failed: {0}")]
    ValidationFailure(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for MemoryError {
    fn from(err: sqlx::Error) -> Self {
        MemoryError::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(err: serde_json::Error) -> Self {
        MemoryError::LlmShapeFailure(err.to_string())
    }
}

pub type MemoryResult<T> = Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlx_errors_become_store_unavailable() {
        let err: MemoryError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, MemoryError::StoreUnavailable(_)));
    }

    #[test]
    fn json_errors_become_shape_failures() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: MemoryError = json_err.into();
        assert!(matches!(err, MemoryError::LlmShapeFailure(_)));
    }
}
