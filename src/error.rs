//! Error types for the edgequake-docpipe library.
//!
//! Three distinct error types reflect three distinct failure modes:
//!
//! * [`ConvertError`]: **Fatal**: the conversion cannot proceed at all
//!   (bad selector, missing model artifact, a builder failed, a structural
//!   processor broke the document). Returned as `Err(ConvertError)` from
//!   [`crate::convert::Converter::convert`].
//!
//! * [`StageError`]: **Stage-local**: what an individual builder, processor
//!   or renderer reports. The drivers in [`crate::pipeline`] decide, from the
//!   stage's declared failure policy, whether it becomes a [`ConvertError`] or
//!   is logged and skipped.
//!
//! * [`ResourceCleanupError`]: **Never fatal**: removing a temporary input
//!   file failed. It is logged and never replaces the primary result.

use crate::schema::BlockType;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-docpipe library.
#[derive(Debug, Error)]
pub enum ConvertError {
    // ── Configuration errors ──────────────────────────────────────────────
    /// Unknown selector, malformed option, invalid stage list.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The resolver could not satisfy a declared stage dependency.
    #[error("Stage '{stage}' requires '{dependency}' but it is not available")]
    MissingDependency { stage: String, dependency: String },

    /// The configured LLM service could not be constructed.
    #[error("LLM service '{service}' is not configured.\n{hint}")]
    ProviderNotConfigured { service: String, hint: String },

    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Input file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// No provider is registered for this kind of file.
    #[error("No document provider registered for '{path}'")]
    UnsupportedFileType { path: PathBuf },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    // ── Stage errors ──────────────────────────────────────────────────────
    /// A builder stage failed; no partial document is returned.
    #[error("Builder '{stage}' failed: {detail}")]
    Build { stage: String, detail: String },

    /// A processor with an abort policy failed.
    #[error("Processor '{processor}' failed: {detail}")]
    Processor { processor: String, detail: String },

    /// A renderer failed under the abort render policy.
    #[error("Renderer '{renderer}' failed: {detail}")]
    Render { renderer: String, detail: String },

    // ── Output errors ─────────────────────────────────────────────────────
    /// Could not create or write the output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Which side of the request boundary an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The caller sent something unusable (bad options, unreachable file).
    Client,
    /// The conversion itself failed.
    Server,
}

impl ConvertError {
    /// Shorthand for a [`ConvertError::Configuration`].
    pub fn config(msg: impl Into<String>) -> Self {
        ConvertError::Configuration(msg.into())
    }

    /// Classify the error for the HTTP boundary.
    pub fn class(&self) -> ErrorClass {
        match self {
            ConvertError::Configuration(_)
            | ConvertError::FileNotFound { .. }
            | ConvertError::PermissionDenied { .. }
            | ConvertError::NotAPdf { .. }
            | ConvertError::UnsupportedFileType { .. }
            | ConvertError::DownloadFailed { .. }
            | ConvertError::DownloadTimeout { .. } => ErrorClass::Client,
            _ => ErrorClass::Server,
        }
    }
}

/// An error reported by a single stage.
///
/// Stages never decide whether their failure is fatal; they describe what
/// went wrong and the driver applies the stage's [`crate::pipeline::FailurePolicy`].
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum StageError {
    /// The stage could not do its job with the input it was given.
    #[error("{0}")]
    Failed(String),

    /// A block the stage expected was missing from the document.
    #[error("block {0} does not exist")]
    MissingBlock(String),

    /// The document's structure references no longer resolve.
    #[error("broken structure on page {page}: {detail}")]
    BrokenStructure { page: usize, detail: String },

    /// LLM call failed after retries.
    #[error("LLM call failed after {retries} retries: {detail}")]
    LlmFailed { retries: u32, detail: String },

    /// LLM call did not answer in time.
    #[error("LLM call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The LLM answered with something the stage could not use.
    #[error("unusable LLM response: {0}")]
    BadResponse(String),

    /// A block type was used where the stage does not support it.
    #[error("unsupported block type {0}")]
    UnsupportedBlock(BlockType),
}

impl StageError {
    pub fn failed(msg: impl Into<String>) -> Self {
        StageError::Failed(msg.into())
    }
}

/// Removing a transient resource failed. Logged, never returned.
#[derive(Debug, Error)]
#[error("Failed to remove temporary file '{path}': {source}")]
pub struct ResourceCleanupError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_dependency_names_stage_and_dependency() {
        let e = ConvertError::MissingDependency {
            stage: "layout".into(),
            dependency: "layout_model".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("layout"), "got: {msg}");
        assert!(msg.contains("layout_model"), "got: {msg}");
    }

    #[test]
    fn build_error_names_stage() {
        let e = ConvertError::Build {
            stage: "ocr".into(),
            detail: "no image".into(),
        };
        assert!(e.to_string().contains("ocr"));
        assert!(e.to_string().contains("no image"));
    }

    #[test]
    fn error_classes() {
        assert_eq!(ConvertError::config("bad").class(), ErrorClass::Client);
        assert_eq!(
            ConvertError::DownloadFailed {
                url: "http://x".into(),
                reason: "404".into()
            }
            .class(),
            ErrorClass::Client
        );
        assert_eq!(
            ConvertError::Processor {
                processor: "order".into(),
                detail: "x".into()
            }
            .class(),
            ErrorClass::Server
        );
    }

    #[test]
    fn stage_error_timeout_display() {
        let e = StageError::Timeout { secs: 30 };
        assert!(e.to_string().contains("30s"));
    }

    #[test]
    fn cleanup_error_display() {
        let e = ResourceCleanupError {
            path: PathBuf::from("/tmp/x.pdf"),
            source: std::io::Error::new(std::io::ErrorKind::Other, "busy"),
        };
        assert!(e.to_string().contains("/tmp/x.pdf"));
    }
}
