//! # edgequake-docpipe
//!
//! Convert documents into structured outputs through a pluggable pipeline
//! of builders, processors and renderers.
//!
//! ## Why a pipeline?
//!
//! Layout detection, text cleanup, table extraction and output formatting
//! are separate concerns that change at different speeds. Each is a stage
//! with a name, a declared failure policy and declared dependencies, and
//! the orchestrator in [`pipeline`] decides how they run. Adding a
//! processor or a renderer does not touch the driver.
//!
//! ## Pipeline Overview
//!
//! ```text
//! file / bytes
//!  │
//!  ├─ 1. Input     materialise to a local path (temp file for buffers)
//!  ├─ 2. Provider  page text, bboxes, images, outline (pdfium or JSON)
//!  ├─ 3. Build     layout → line → ocr → structure, then the ignore list
//!  ├─ 4. Process   ordered processors, abort or skip-and-continue
//!  ├─ 5. Render    page markdown / markdown / chunks, merged into one result
//!  └─ 6. Cleanup   temp input removed on every exit path
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_docpipe::{convert, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder()
//!         .renderer("pageMarkdown+chunks")
//!         .ignore_toc(true)
//!         .build()?;
//!     let result = convert("document.pdf", &config).await?;
//!     for (page, blocks) in &result.page_structure {
//!         eprintln!("page {page}: {} visible blocks", blocks.len());
//!     }
//!     println!("{}", serde_json::to_string_pretty(&result)?);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature  | Default | Description |
//! |----------|---------|-------------|
//! | `cli`    | on      | Enables the `docpipe` binary (clap + anyhow + tracing-subscriber + indicatif) |
//! | `server` | on      | HTTP surface (`POST /parse-pdf/`) on axum |
//!
//! Disable both when using only the library:
//! ```toml
//! edgequake-docpipe = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod builders;
pub mod config;
pub mod convert;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod processors;
pub mod progress;
pub mod prompts;
pub mod providers;
pub mod renderers;
pub mod schema;
#[cfg(feature = "server")]
pub mod server;
pub mod services;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ConversionOptions, LlmFallback, PipelineConfig, PipelineConfigBuilder, RequestDefaults};
pub use convert::{convert, convert_from_bytes, convert_sync, convert_to_file, Converter};
pub use error::{ConvertError, ErrorClass, ResourceCleanupError, StageError};
pub use output::RenderResult;
pub use pipeline::input::FileRef;
pub use pipeline::render::parse_renderer_selector;
pub use pipeline::{
    Artifact, ArtifactBag, FailurePolicy, MergePolicy, RenderFailurePolicy, StageCategory,
};
pub use processors::ProcessorKind;
pub use progress::{NoopProgressCallback, ProgressCallback, StageProgressCallback};
pub use providers::{DocumentProvider, MemoryProvider, ProviderRegistry};
pub use renderers::RendererKind;
pub use schema::{BlockId, BlockType, Document};
#[cfg(feature = "server")]
pub use server::{build_router, serve, ServerState};
pub use services::{LlmService, StaticService};
