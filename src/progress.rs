//! Progress-callback trait for per-stage conversion events.
//!
//! Inject an [`Arc<dyn StageProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the run moves through builders, processors and renderers.
//! Stages run strictly one after another, so callbacks are never invoked
//! concurrently for the same run; they may be for different runs sharing
//! one callback.
//!
//! # Example
//!
//! ```rust
//! use edgequake_docpipe::{PipelineConfig, StageProgressCallback, StageCategory};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct Counting(AtomicUsize);
//!
//! impl StageProgressCallback for Counting {
//!     fn on_stage_complete(&self, _category: StageCategory, _stage: &str) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(Counting(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use crate::pipeline::StageCategory;
use std::sync::Arc;

/// Called by the pipeline drivers around every stage.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
pub trait StageProgressCallback: Send + Sync {
    /// Called once after the input is materialised and a provider opened.
    ///
    /// * `total_pages`: pages that will be built
    /// * `total_stages`: builders + processors + renderers in this run
    fn on_conversion_start(&self, total_pages: usize, total_stages: usize) {
        let _ = (total_pages, total_stages);
    }

    /// Called just before a stage runs.
    fn on_stage_start(&self, category: StageCategory, stage: &str) {
        let _ = (category, stage);
    }

    /// Called when a stage finished and its output was accepted.
    fn on_stage_complete(&self, category: StageCategory, stage: &str) {
        let _ = (category, stage);
    }

    /// Called when a skip-policy stage failed and was skipped.
    fn on_stage_skipped(&self, category: StageCategory, stage: &str, error: &str) {
        let _ = (category, stage, error);
    }

    /// Called once with the output keys of the finished render result.
    fn on_conversion_complete(&self, output_keys: &[String]) {
        let _ = output_keys;
    }
}

/// A no-op implementation, used when no callback is configured.
pub struct NoopProgressCallback;

impl StageProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn StageProgressCallback>;
