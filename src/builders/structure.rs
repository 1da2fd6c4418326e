//! Structure pass: reading order, grouping and the ignore list.

use super::DocumentBuilder;
use crate::config::PipelineConfig;
use crate::error::StageError;
use crate::providers::DocumentProvider;
use crate::schema::{BBox, BlockId, BlockType, Document, Page};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// A table of contents only hides its page within the first pages of a
/// document; later TOC-like blocks are indexes or appendices.
pub const MAX_TOC_PAGE: usize = 10;

/// Orders each page's top-level blocks and groups related ones.
pub struct StructureBuilder {
    pub group_captions: bool,
    /// Largest vertical distance between a caption and what it labels.
    pub caption_gap: f32,
}

impl DocumentBuilder for StructureBuilder {
    fn name(&self) -> &'static str {
        "structure"
    }

    fn build(
        &self,
        document: &mut Document,
        _provider: &dyn DocumentProvider,
    ) -> Result<(), StageError> {
        for index in 0..document.pages.len() {
            sort_reading_order(&mut document.pages[index]);
            group_list_items(document, index)?;
            if self.group_captions {
                self.group_captions(document, index)?;
            }
        }
        Ok(())
    }
}

fn sort_reading_order(page: &mut Page) {
    let mut keyed: Vec<(BlockId, BBox)> = page
        .structure
        .iter()
        .filter_map(|id| page.get_block(id).map(|b| (*id, b.bbox)))
        .collect();
    keyed.sort_by(|(_, a), (_, b)| a.y0().total_cmp(&b.y0()).then(a.x0().total_cmp(&b.x0())));
    page.structure = keyed.into_iter().map(|(id, _)| id).collect();
}

fn union_of(page: &Page, ids: &[BlockId]) -> BBox {
    ids.iter()
        .filter_map(|id| page.get_block(id))
        .map(|b| b.bbox)
        .reduce(|a, b| a.union(&b))
        .unwrap_or_default()
}

/// Wrap consecutive `ListItem`s in a `ListGroup`.
fn group_list_items(document: &mut Document, index: usize) -> Result<(), StageError> {
    let structure = document.pages[index].structure.clone();
    let mut grouped = Vec::with_capacity(structure.len());
    let mut run: Vec<BlockId> = Vec::new();
    for id in structure {
        if id.block_type == BlockType::ListItem {
            run.push(id);
            continue;
        }
        if !run.is_empty() {
            grouped.push(wrap(document, index, BlockType::ListGroup, std::mem::take(&mut run))?);
        }
        grouped.push(id);
    }
    if !run.is_empty() {
        grouped.push(wrap(document, index, BlockType::ListGroup, run)?);
    }
    document.pages[index].structure = grouped;
    Ok(())
}

/// Allocate a group block around `members`. The caller relinks the structure.
fn wrap(
    document: &mut Document,
    index: usize,
    group_type: BlockType,
    members: Vec<BlockId>,
) -> Result<BlockId, StageError> {
    let bbox = union_of(&document.pages[index], &members);
    let group = document.add_block(index, group_type, bbox)?;
    document.pages[index].block_mut(&group)?.structure = members;
    Ok(group)
}

impl StructureBuilder {
    /// Pair each caption with the nearest adjacent table or image.
    fn group_captions(&self, document: &mut Document, index: usize) -> Result<(), StageError> {
        let mut i = 0;
        while i < document.pages[index].structure.len() {
            let structure = &document.pages[index].structure;
            let id = structure[i];
            if id.block_type != BlockType::Caption {
                i += 1;
                continue;
            }
            let page = &document.pages[index];
            let caption = page.block(&id)?.bbox;
            let gap_to = |j: usize| -> Option<(usize, f32)> {
                let other = structure.get(j)?;
                group_type(other.block_type)?;
                let bbox = page.get_block(other)?.bbox;
                let gap = (caption.y0() - bbox.y1()).max(bbox.y0() - caption.y1()).max(0.0);
                (gap <= self.caption_gap).then_some((j, gap))
            };
            let before = i.checked_sub(1).and_then(gap_to);
            let after = gap_to(i + 1);
            let target = match (before, after) {
                (Some(b), Some(a)) => Some(if a.1 < b.1 { a.0 } else { b.0 }),
                (b, a) => b.or(a).map(|(j, _)| j),
            };
            let Some(j) = target else {
                i += 1;
                continue;
            };

            let other = structure[j];
            let members = if j < i { vec![other, id] } else { vec![id, other] };
            let kind = group_type(other.block_type).unwrap_or(BlockType::FigureGroup);
            let group = wrap(document, index, kind, members)?;
            let first = i.min(j);
            document.pages[index].structure.splice(first..=first + 1, [group]);
            i = first + 1;
        }
        Ok(())
    }
}

fn group_type(block_type: BlockType) -> Option<BlockType> {
    match block_type {
        BlockType::Table => Some(BlockType::TableGroup),
        BlockType::Picture => Some(BlockType::PictureGroup),
        BlockType::Figure => Some(BlockType::FigureGroup),
        _ => None,
    }
}

/// Block types excluded from output, computed once per run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreList {
    pub block_types: BTreeSet<BlockType>,
    /// Also hide every page before a hidden table of contents.
    pub ignore_before_toc: bool,
}

impl IgnoreList {
    pub fn from_config(config: &PipelineConfig) -> Self {
        let mut block_types = BTreeSet::new();
        if config.ignore_toc {
            block_types.insert(BlockType::TableOfContents);
        }
        Self {
            block_types,
            ignore_before_toc: config.ignore_before_toc,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.block_types.is_empty()
    }
}

/// Flag ignored blocks and pages. Nothing is deleted.
///
/// Every top-level block whose type is listed is hidden. A hidden table of
/// contents on one of the first [`MAX_TOC_PAGE`] pages hides its whole page,
/// and with `ignore_before_toc` every page before it. A hidden page hides
/// all of its blocks.
pub fn apply_ignore_list(document: &mut Document, ignore: &IgnoreList) {
    if ignore.is_empty() {
        return;
    }
    for i in 0..document.pages.len() {
        let page = &mut document.pages[i];
        let hits: Vec<BlockId> = page
            .structure
            .iter()
            .filter(|id| ignore.block_types.contains(&id.block_type))
            .copied()
            .collect();
        let mut hide_page = false;
        for id in hits {
            if let Some(block) = page.get_block_mut(&id) {
                block.ignore_for_output = true;
            }
            if id.block_type == BlockType::TableOfContents && page.page_id <= MAX_TOC_PAGE {
                hide_page = true;
            }
        }
        if hide_page {
            info!("Page {}: table of contents, excluded from output", page.page_id);
            page.ignore_for_output = true;
            if ignore.ignore_before_toc {
                for earlier in &mut document.pages[..i] {
                    earlier.ignore_for_output = true;
                }
            }
        }
    }
    for page in document.pages.iter_mut().filter(|p| p.ignore_for_output) {
        page.blocks_mut().for_each(|b| b.ignore_for_output = true);
        debug!("Page {}: all blocks hidden", page.page_id);
    }
}
