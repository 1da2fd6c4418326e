//! Flat block chunks for retrieval pipelines.
//!
//! Every visible top-level block becomes one chunk carrying its html, its
//! markdown, its position and the section headers it sits under.

use super::markdown::{image_name, BlockWriter};
use super::{document_metadata, Rendered, Renderer, RendererKind};
use crate::error::StageError;
use crate::pipeline::postprocess::cleanup_markdown;
use crate::processors::escape_html;
use crate::schema::{BlockId, BlockType, Document, Page};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

pub struct ChunkRenderer {
    /// Emit an id-keyed map instead of `{blocks, page_info}`.
    pub output_json: bool,
}

/// Html of a block with its visible children assembled inside it.
fn block_html(document: &Document, page: &Page, id: &BlockId) -> Result<String, StageError> {
    let block = page.block(id)?;
    if block.block_type().is_image() && block.html.is_none() {
        let alt = escape_html(block.metadata.get("description").map(String::as_str).unwrap_or(""));
        return Ok(format!("<img src=\"{}\" alt=\"{alt}\">", image_name(id)));
    }
    let inner = if block.structure.is_empty() {
        escape_html(&block.text)
    } else {
        let mut parts = Vec::new();
        for child in &block.structure {
            if page.get_block(child).is_some_and(|c| !c.ignore_for_output) {
                parts.push(block_html(document, page, child)?);
            }
        }
        parts.join(match block.block_type() {
            BlockType::Line | BlockType::Span | BlockType::TableCell => " ",
            _ => "\n",
        })
    };
    Ok(document
        .registry
        .class_for(block.block_type())
        .assemble_html(block, &inner))
}

/// Open section headers, keyed by heading level.
#[derive(Default)]
struct SectionTrail(BTreeMap<u8, String>);

impl SectionTrail {
    fn enter(&mut self, level: u8, id: &BlockId) {
        self.0.retain(|l, _| *l < level);
        self.0.insert(level, id.to_string());
    }

    fn snapshot(&self) -> Value {
        json!(self
            .0
            .iter()
            .map(|(l, id)| (l.to_string(), id.clone()))
            .collect::<BTreeMap<_, _>>())
    }
}

impl Renderer for ChunkRenderer {
    fn kind(&self) -> RendererKind {
        RendererKind::Chunks
    }

    fn render(&self, document: &Document) -> Result<Rendered, StageError> {
        let mut chunks = Vec::new();
        let mut images = BTreeMap::new();
        let mut trail = SectionTrail::default();
        let mut page_info = Map::new();

        for page in document.pages.iter().filter(|p| !p.ignore_for_output) {
            page_info.insert(page.page_id.to_string(), json!({ "bbox": page.bbox }));
            let mut writer = BlockWriter::new(page);
            for id in page.visible_structure() {
                let block = page.block(&id)?;
                if block.block_type() == BlockType::SectionHeader {
                    trail.enter(block.heading_level.unwrap_or(2), &id);
                }
                let markdown = writer.block_markdown(&id)?;
                let block_images = std::mem::take(&mut writer.images);
                chunks.push((id, json!({
                    "id": id.to_string(),
                    "block_type": block.block_type().name(),
                    "html": block_html(document, page, &id)?,
                    "markdown": markdown,
                    "page": page.page_id,
                    "bbox": block.bbox,
                    "section_hierarchy": trail.snapshot(),
                    "images": block_images.keys().collect::<Vec<_>>(),
                })));
                images.extend(block_images);
            }
        }

        let payload = if self.output_json {
            let mut by_id = Map::new();
            for (id, chunk) in chunks {
                let markdown = chunk["markdown"].as_str().unwrap_or_default();
                let empty = markdown.trim().is_empty();
                let droppable = matches!(
                    chunk["block_type"].as_str(),
                    Some("Text" | "SectionHeader" | "ListGroup")
                );
                if empty && droppable {
                    continue;
                }
                by_id.insert(
                    id.to_string(),
                    json!({
                        "page": chunk["page"],
                        "block_id": id.index,
                        "block_type": chunk["block_type"],
                        "html": chunk["html"],
                        "markdown": cleanup_markdown(markdown),
                        "bbox": chunk["bbox"],
                    }),
                );
            }
            Value::Object(by_id)
        } else {
            json!({
                "blocks": chunks.into_iter().map(|(_, chunk)| chunk).collect::<Vec<_>>(),
                "page_info": page_info,
                "metadata": document_metadata(document),
            })
        };

        Ok(Rendered {
            payload,
            images,
            metadata: document_metadata(document),
        })
    }
}
