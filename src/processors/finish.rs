//! Last-pass processors: link anchors, blank content, debug annotations.

use super::Processor;
use crate::error::StageError;
use crate::pipeline::encode::crop;
use crate::schema::{BBox, BlockId, BlockType, Document, Page};
use async_trait::async_trait;
use image::{DynamicImage, GenericImageView};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::debug;

/// Inserts a `Reference` anchor for every internal link target of a page,
/// right before the block the target points into.
pub struct ReferenceProcessor;

fn anchor_position(page: &Page, x: f32, y: f32) -> usize {
    let top: Vec<(usize, BBox)> = page
        .structure
        .iter()
        .enumerate()
        .filter_map(|(i, id)| page.get_block(id).map(|b| (i, b.bbox)))
        .collect();
    top.iter()
        .find(|(_, bbox)| bbox.contains_point(x, y))
        .or_else(|| top.iter().find(|(_, bbox)| bbox.y0() >= y))
        .map(|(i, _)| *i)
        .unwrap_or(page.structure.len())
}

#[async_trait]
impl Processor for ReferenceProcessor {
    fn name(&self) -> &'static str {
        "reference"
    }

    async fn process(&self, document: &mut Document) -> Result<(), StageError> {
        for page in document.pages.iter_mut() {
            for target in page.refs.clone() {
                let position = anchor_position(page, target.x, target.y);
                let id = page.add_block(
                    BlockType::Reference,
                    BBox::new(target.x, target.y, target.x, target.y),
                );
                page.block_mut(&id)?.text = target.ref_id.clone();
                page.structure.insert(position, id);
            }
        }
        Ok(())
    }
}

/// Hides image blocks whose crop is a single flat colour, and pages left
/// with nothing to show.
pub struct BlankPageProcessor {
    /// Largest per-channel deviation still counted as the same colour.
    pub tolerance: u8,
}

impl BlankPageProcessor {
    fn is_blank(&self, image: &DynamicImage) -> bool {
        let mut pixels = image.pixels().map(|(_, _, p)| p.0);
        let Some(first) = pixels.next() else {
            return true;
        };
        pixels.all(|p| {
            p.iter()
                .zip(first.iter())
                .all(|(a, b)| a.abs_diff(*b) <= self.tolerance)
        })
    }
}

#[async_trait]
impl Processor for BlankPageProcessor {
    fn name(&self) -> &'static str {
        "blank_page"
    }

    async fn process(&self, document: &mut Document) -> Result<(), StageError> {
        for page in document.pages.iter_mut() {
            if page.ignore_for_output {
                continue;
            }
            if let Some(image) = page.image.clone() {
                let blank: Vec<BlockId> = page
                    .blocks()
                    .filter(|b| b.block_type().is_image() && !b.ignore_for_output)
                    .filter(|b| {
                        crop(&image, &page.bbox, &b.bbox).is_none_or(|c| self.is_blank(&c))
                    })
                    .map(|b| b.id)
                    .collect();
                for id in blank {
                    debug!("{} is blank, hiding", id);
                    page.block_mut(&id)?.ignore_for_output = true;
                }
            }

            let has_content = page.visible_structure().iter().any(|id| {
                id.block_type.is_image()
                    || id.block_type.is_group()
                    || !page.raw_text(id).trim().is_empty()
                    || page.get_block(id).is_some_and(|b| b.html.is_some())
            });
            if !has_content && !page.structure.is_empty() {
                debug!("Page {} has no visible content, hiding", page.page_id);
                page.ignore_for_output = true;
            }
        }
        Ok(())
    }
}

/// Records per-page block statistics in [`Document::debug`] when enabled.
pub struct DebugProcessor {
    pub enabled: bool,
}

#[async_trait]
impl Processor for DebugProcessor {
    fn name(&self) -> &'static str {
        "debug"
    }

    async fn process(&self, document: &mut Document) -> Result<(), StageError> {
        if !self.enabled {
            return Ok(());
        }
        let pages: Vec<serde_json::Value> = document
            .pages
            .iter()
            .map(|page| {
                let mut by_type: BTreeMap<&str, usize> = BTreeMap::new();
                for block in page.blocks() {
                    *by_type.entry(block.block_type().name()).or_default() += 1;
                }
                json!({
                    "page_id": page.page_id,
                    "blocks": page.block_count(),
                    "hidden": page.ignore_for_output,
                    "by_type": by_type,
                })
            })
            .collect();
        debug!("Debug annotations for {} pages", pages.len());
        document.debug.insert("pages".into(), json!(pages));
        Ok(())
    }
}
