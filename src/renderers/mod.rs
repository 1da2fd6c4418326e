//! Renderer stages: serialise a finished [`Document`].
//!
//! A renderer returns a [`Rendered`] triple: its payload, the images it
//! referenced (name → base64 PNG) and a metadata record. The fan-out in
//! [`crate::pipeline::render`] files the payload under the kind's fixed
//! output key and merges images and metadata according to the run's
//! [`crate::pipeline::MergePolicy`].

mod chunk;
mod markdown;
mod page_markdown;

pub use chunk::ChunkRenderer;
pub use markdown::{image_name, MarkdownRenderer, PAGE_SEPARATOR};
pub use page_markdown::PageMarkdownRenderer;

use crate::config::PipelineConfig;
use crate::error::{ConvertError, StageError};
use crate::pipeline::resolve::{
    Dependency, FailurePolicy, ResolvedDeps, StageCategory, StageDescriptor, StageSpec,
};
use crate::schema::{BlockType, Document, Page, TextExtraction};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Output of one renderer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Rendered {
    pub payload: Value,
    /// Image name → base64 PNG.
    pub images: BTreeMap<String, String>,
    pub metadata: Value,
}

pub trait Renderer: Send + Sync {
    fn kind(&self) -> RendererKind;

    fn render(&self, document: &Document) -> Result<Rendered, StageError>;
}

/// The closed set of renderers. Each kind owns its output key and whether
/// its payload goes through markdown cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RendererKind {
    PageMarkdown,
    Markdown,
    Chunks,
}

impl RendererKind {
    pub const ALL: [RendererKind; 3] = [
        RendererKind::PageMarkdown,
        RendererKind::Markdown,
        RendererKind::Chunks,
    ];

    /// Default selection when the configuration names no renderer.
    pub const DEFAULT: [RendererKind; 2] = [RendererKind::PageMarkdown, RendererKind::Chunks];

    /// Key the payload is stored under in the render result.
    pub fn output_key(self) -> &'static str {
        match self {
            RendererKind::PageMarkdown => "page_renders",
            RendererKind::Markdown => "markdown",
            RendererKind::Chunks => "chunks",
        }
    }

    /// Selector token, as written in `"pageMarkdown+chunks"`.
    pub fn token(self) -> &'static str {
        match self {
            RendererKind::PageMarkdown => "pageMarkdown",
            RendererKind::Markdown => "markdown",
            RendererKind::Chunks => "chunks",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RendererKind::PageMarkdown => "page_markdown",
            RendererKind::Markdown => "markdown",
            RendererKind::Chunks => "chunk",
        }
    }

    /// Whether the payload is markdown text that gets cleaned up before
    /// it is stored.
    pub fn applies_cleanup(self) -> bool {
        self == RendererKind::Markdown
    }
}

impl fmt::Display for RendererKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for RendererKind {
    type Err = ConvertError;

    /// Accepts the selector tokens (any case) and renderer names such as
    /// `page_markdown` or `ChunkRenderer`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim();
        let last = token.rsplit('.').next().unwrap_or_default();
        let wanted: String = last
            .strip_suffix("Renderer")
            .unwrap_or(last)
            .chars()
            .filter(|c| *c != '_')
            .flat_map(char::to_lowercase)
            .collect();
        match wanted.as_str() {
            "pagemarkdown" => Ok(RendererKind::PageMarkdown),
            "markdown" => Ok(RendererKind::Markdown),
            "chunks" | "chunk" => Ok(RendererKind::Chunks),
            _ => Err(ConvertError::config(format!("unknown renderer '{token}'"))),
        }
    }
}

impl StageDescriptor for RendererKind {
    type Stage = Box<dyn Renderer>;

    fn spec(&self) -> StageSpec {
        let spec = StageSpec::new(self.name(), StageCategory::Renderer, FailurePolicy::Abort);
        match self {
            RendererKind::Markdown => spec.depends_on(Dependency::with_default(
                "page_separator",
                json!(PAGE_SEPARATOR),
            )),
            RendererKind::PageMarkdown | RendererKind::Chunks => spec,
        }
    }

    fn instantiate(
        &self,
        deps: ResolvedDeps,
        config: &PipelineConfig,
    ) -> Result<Self::Stage, ConvertError> {
        Ok(match self {
            RendererKind::PageMarkdown => Box::new(PageMarkdownRenderer),
            RendererKind::Markdown => Box::new(MarkdownRenderer {
                paginate: config.paginate_output,
                page_separator: deps.string("page_separator")?,
            }),
            RendererKind::Chunks => Box::new(ChunkRenderer {
                output_json: config.output_json,
            }),
        })
    }
}

fn extraction_name(method: TextExtraction) -> &'static str {
    match method {
        TextExtraction::None => "none",
        TextExtraction::PdfText => "pdftext",
        TextExtraction::Ocr => "ocr",
        TextExtraction::Llm => "llm",
    }
}

fn page_stats(page: &Page) -> Value {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    let mut methods: BTreeMap<&str, usize> = BTreeMap::new();
    for block in page.blocks() {
        *counts.entry(block.block_type().name()).or_default() += 1;
        if block.block_type() == BlockType::Line {
            *methods.entry(extraction_name(block.extraction)).or_default() += 1;
        }
    }
    let method = methods
        .iter()
        .max_by_key(|(_, n)| **n)
        .map(|(m, _)| *m)
        .unwrap_or("none");
    json!({
        "page_id": page.page_id,
        "text_extraction_method": method,
        "block_counts": counts,
        "ignored": page.ignore_for_output,
    })
}

/// Metadata shared by every renderer: table of contents and page statistics.
pub(crate) fn document_metadata(document: &Document) -> Value {
    let mut metadata = json!({
        "table_of_contents": document.table_of_contents,
        "page_stats": document.pages.iter().map(page_stats).collect::<Vec<_>>(),
    });
    if !document.debug.is_empty() {
        metadata["debug"] = json!(document.debug);
    }
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::resolve::{ArtifactBag, Resolver};

    #[test]
    fn tokens_and_names_parse() {
        for s in ["pageMarkdown", "PAGEMARKDOWN", "page_markdown", "renderers.PageMarkdownRenderer"] {
            assert_eq!(s.parse::<RendererKind>().unwrap(), RendererKind::PageMarkdown);
        }
        assert_eq!("ChunkRenderer".parse::<RendererKind>().unwrap(), RendererKind::Chunks);
        let err = "pdf2html".parse::<RendererKind>().unwrap_err();
        assert!(err.to_string().contains("pdf2html"));
    }

    #[test]
    fn output_keys_are_fixed() {
        let keys: Vec<_> = RendererKind::ALL.iter().map(|k| k.output_key()).collect();
        assert_eq!(keys, vec!["page_renders", "markdown", "chunks"]);
        assert!(RendererKind::Markdown.applies_cleanup());
        assert!(!RendererKind::Chunks.applies_cleanup());
    }

    #[test]
    fn every_kind_resolves() {
        let bag = ArtifactBag::new();
        let config = PipelineConfig::default();
        let renderers = Resolver::new(&bag, &config)
            .resolve_all(&RendererKind::ALL)
            .unwrap();
        let kinds: Vec<_> = renderers.iter().map(|r| r.kind()).collect();
        assert_eq!(kinds, RendererKind::ALL.to_vec());
    }
}
