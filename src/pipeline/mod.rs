//! Pipeline drivers: everything between a provider and a [`crate::output::RenderResult`].
//!
//! Each submodule owns exactly one step. Stages themselves live in
//! [`crate::builders`], [`crate::processors`] and [`crate::renderers`]; the
//! modules here resolve them, run them in order and apply their failure
//! policies.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ build ──▶ process ──▶ render
//! (path/bytes) (fixed chain) (ordered list) (fan-out + merge)
//! ```
//!
//! 1. [`input`]: materialise a path or byte buffer as a local file, with
//!    guaranteed cleanup
//! 2. [`resolve`]: satisfy each stage's declared dependencies from the
//!    artifact bag, the configuration options or the stage's defaults
//! 3. [`build`]: layout, line, OCR and structure builders, in that order
//! 4. [`process`]: the configured processors, each under its declared
//!    abort or skip policy
//! 5. [`render`]: every selected renderer, merged into one result
//!
//! [`encode`] and [`postprocess`] are shared helpers: PNG/base64 encoding of
//! page crops and the markdown cleanup applied to unified markdown.

pub mod build;
pub mod encode;
pub mod input;
pub mod postprocess;
pub mod process;
pub mod render;
pub mod resolve;

pub use render::{MergePolicy, RenderFailurePolicy};
pub use resolve::{Artifact, ArtifactBag, FailurePolicy, StageCategory, LLM_SERVICE};
