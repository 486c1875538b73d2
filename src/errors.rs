//! Typed error hierarchy for the document review service.
//!
//! A single `ReviewError` enum covers the store, the inference backend and the
//! lifecycle operations. Persistence internals use `anyhow` and surface here
//! as `Internal`.

use thiserror::Error;

/// Errors from review orchestration, issue persistence and the lifecycle operations.
#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("Issue {issue_id} not found for document {doc_id}")]
    NotFound { doc_id: String, issue_id: String },

    #[error("Document {doc_id} not found")]
    DocumentNotFound { doc_id: String },

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Inference backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Inference backend error: {0}")]
    BackendError(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ReviewError {
    pub fn not_found(doc_id: &str, issue_id: &str) -> Self {
        Self::NotFound {
            doc_id: doc_id.to_string(),
            issue_id: issue_id.to_string(),
        }
    }

    /// Whether a human should simply try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_))
    }
}

pub type ReviewResult<T> = Result<T, ReviewError>;
