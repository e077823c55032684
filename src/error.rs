use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Service-wide error taxonomy. Every failure surfaced by the core carries
/// one of these structured kinds; callers branch on [`Error::code`] rather
/// than string matching.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("rate limit exceeded for tenant {0}")]
    ResourceExhausted(String),

    #[error("source unreachable: {0}")]
    SourceUnreachable(String),

    #[error("extraction failed: {0}")]
    ExtractFailed(String),

    #[error("embedding failed: {0}")]
    EmbedFailed(String),

    #[error("indexing failed: {0}")]
    IndexFailed(String),

    #[error("retrieval failed: {0}")]
    RetrieveFailed(String),

    #[error("llm failed: {0}")]
    LlmFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Wire-level code for an [`Error`], serialized SCREAMING_SNAKE_CASE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    ResourceExhausted,
    SourceUnreachable,
    ExtractFailed,
    EmbedFailed,
    IndexFailed,
    RetrieveFailed,
    LlmFailed,
    Internal,
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            Error::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            Error::SourceUnreachable(_) => ErrorCode::SourceUnreachable,
            Error::ExtractFailed(_) => ErrorCode::ExtractFailed,
            Error::EmbedFailed(_) => ErrorCode::EmbedFailed,
            Error::IndexFailed(_) => ErrorCode::IndexFailed,
            Error::RetrieveFailed(_) => ErrorCode::RetrieveFailed,
            Error::LlmFailed(_) => ErrorCode::LlmFailed,
            Error::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Whether this error terminates an ingestion job (as opposed to a
    /// per-query failure reported inside a chat session).
    pub fn is_fatal_for_job(&self) -> bool {
        matches!(
            self,
            Error::SourceUnreachable(_)
                | Error::ExtractFailed(_)
                | Error::EmbedFailed(_)
                | Error::IndexFailed(_)
                | Error::Internal(_)
        )
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("serialization error: {err}"))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Internal(format!("background task failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping() {
        assert_eq!(
            Error::InvalidArgument("x".into()).code(),
            ErrorCode::InvalidArgument
        );
        assert_eq!(Error::LlmFailed("x".into()).code(), ErrorCode::LlmFailed);
        assert_eq!(Error::internal("x").code(), ErrorCode::Internal);
    }

    #[test]
    fn test_code_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::FailedPrecondition).unwrap();
        assert_eq!(json, "\"FAILED_PRECONDITION\"");
        let json = serde_json::to_string(&ErrorCode::RetrieveFailed).unwrap();
        assert_eq!(json, "\"RETRIEVE_FAILED\"");
    }

    #[test]
    fn test_job_fatality() {
        assert!(Error::EmbedFailed("quota".into()).is_fatal_for_job());
        assert!(Error::IndexFailed("upsert".into()).is_fatal_for_job());
        assert!(!Error::RetrieveFailed("both".into()).is_fatal_for_job());
        assert!(!Error::LlmFailed("502".into()).is_fatal_for_job());
    }
}
