use super::markdown::BlockWriter;
use super::{document_metadata, Rendered, Renderer, RendererKind};
use crate::error::StageError;
use crate::schema::Document;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Markdown per visible page: `[{page_id, markdown}, ...]`.
pub struct PageMarkdownRenderer;

impl Renderer for PageMarkdownRenderer {
    fn kind(&self) -> RendererKind {
        RendererKind::PageMarkdown
    }

    fn render(&self, document: &Document) -> Result<Rendered, StageError> {
        let mut pages = Vec::new();
        let mut images = BTreeMap::new();
        for page in document.pages.iter().filter(|p| !p.ignore_for_output) {
            let mut writer = BlockWriter::new(page);
            let markdown = writer.page_markdown()?;
            pages.push(json!({ "page_id": page.page_id, "markdown": markdown }));
            images.append(&mut writer.images);
        }
        Ok(Rendered {
            payload: Value::Array(pages),
            images,
            metadata: document_metadata(document),
        })
    }
}
