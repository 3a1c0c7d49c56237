//! Error types for item-level and batch-level failures.
//!
//! [`ItemError`] is always captured into a per-item or per-page result and
//! never aborts sibling processing. [`BatchError`] is the only failure that
//! surfaces at the top level, in which case no per-item output is produced.

use std::any::Any;
use thiserror::Error;

/// Failure of a single item (or a single PDF page).
///
/// The `Display` text is what callers see in the `error` field of the result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ItemError {
    #[error("Invalid file type: {0}, should be one of: pdf, image")]
    InvalidKind(String),

    #[error("No file data or URL provided")]
    NoSourceProvided,

    #[error("Error downloading file from URL: {reference}: {cause}")]
    FetchFailed { reference: String, cause: String },

    #[error("Error decoding file data: {0}")]
    DecodeFailed(String),

    #[error("Error splitting PDF into pages: {0}")]
    SplitFailed(String),

    #[error("OCR failed: {0}")]
    RecognitionFailed(String),

    #[error("Unsupported document kind: {0}")]
    UnsupportedKind(String),
}

impl ItemError {
    /// Wrap a collaborator failure, keeping the whole context chain.
    pub fn fetch_failed(reference: &str, cause: &anyhow::Error) -> Self {
        Self::FetchFailed {
            reference: reference.to_string(),
            cause: format!("{:#}", cause),
        }
    }

    pub fn split_failed(cause: &anyhow::Error) -> Self {
        Self::SplitFailed(format!("{:#}", cause))
    }

    pub fn recognition_failed(cause: &anyhow::Error) -> Self {
        Self::RecognitionFailed(format!("{:#}", cause))
    }
}

/// Failure of the batch request as a whole.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Malformed batch request: {0}")]
    Malformed(String),

    #[error("Batch timed out after {0}s")]
    TimedOut(u64),
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
