//! Error taxonomy for the RAG engine.
//!
//! Every failure is classified into one of the kinds below so callers can
//! decide between retrying, degrading to a weaker strategy, or surfacing
//! the error. Transport-level errors from reqwest/sqlx are classified by
//! the `From` impls; only `Transient` is eligible for backoff retry.

use thiserror::Error;

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Error, Debug)]
pub enum RagError {
    /// Unsupported file type, empty content, malformed request
    #[error("invalid input: {0}")]
    InputInvalid(String),

    /// Re-ingest of a document whose content hash already exists
    #[error("duplicate document: {0}")]
    Duplicate(String),

    /// Transport failure, timeout, connection reset — retryable
    #[error("transient failure: {0}")]
    Transient(String),

    /// Embedding / LLM / vector store returned malformed or empty data
    #[error("upstream returned bad data: {0}")]
    Upstream(String),

    /// Database constraint or schema violation — not retryable
    #[error("data integrity violation: {0}")]
    Corrupt(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Queue full or pool exhausted
    #[error("overloaded: {0}")]
    Overload(String),

    /// Unrecoverable after pool recreation and retries
    #[error("fatal: {0}")]
    Fatal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RagError {
    /// Whether a backoff retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RagError::Transient(_))
    }
}

impl From<reqwest::Error> for RagError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            RagError::Upstream(format!("response decode failed: {e}"))
        } else if e.is_timeout() {
            RagError::Transient(format!("request timed out: {e}"))
        } else if e.is_connect() {
            RagError::Transient(format!("connection failed: {e}"))
        } else {
            RagError::Transient(e.to_string())
        }
    }
}

impl From<sqlx::Error> for RagError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => RagError::NotFound("row not found".into()),
            sqlx::Error::Database(db) => {
                // 23505 = unique_violation; other 23xxx are integrity,
                // 42xxx are syntax/undefined-object
                match db.code().as_deref() {
                    Some("23505") => RagError::Duplicate(db.message().to_string()),
                    Some(code) if code.starts_with("23") || code.starts_with("42") => {
                        RagError::Corrupt(db.message().to_string())
                    }
                    _ => RagError::Transient(db.message().to_string()),
                }
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => RagError::Transient(e.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                RagError::Corrupt(e.to_string())
            }
            _ => RagError::Fatal(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for RagError {
    fn from(e: serde_json::Error) -> Self {
        RagError::Upstream(format!("JSON parse failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_retryable() {
        assert!(RagError::Transient("reset".into()).is_retryable());
        assert!(!RagError::Corrupt("constraint".into()).is_retryable());
        assert!(!RagError::Duplicate("hash".into()).is_retryable());
    }

    #[test]
    fn json_parse_failures_are_upstream() {
        let err: RagError = serde_json::from_str::<serde_json::Value>("not json")
            .map_err(RagError::from)
            .unwrap_err();
        assert!(matches!(err, RagError::Upstream(_)));
    }
}
