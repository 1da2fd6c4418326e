//! Document model shared by every pipeline stage.
//!
//! ```text
//! Document ─┬─ Page ─┬─ structure: [BlockId, ...]      (top level, ordered)
//!           │        └─ blocks: {index → Block}        (arena)
//!           │                      └─ structure: [BlockId, ...] (children)
//!           └─ registry: BlockRegistry                 (per-run block classes)
//! ```

mod block;
mod document;
mod registry;

pub use block::{BBox, Block, BlockId, BlockType, TextExtraction};
pub use document::{Document, OutlineEntry, Page, PageRef, TocEntry};
pub use registry::{class_by_name, BlockClass, BlockRegistry, PageFurniture, PlainText, StandardBlock};
