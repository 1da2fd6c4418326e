//! Pages and the document they make up.
//!
//! Every page owns an arena of blocks keyed by index and an ordered
//! `structure` list of top-level block identities. Blocks reference their
//! children the same way. All mutation goes through [`Page`] methods so the
//! structure references stay resolvable: removing a block drops every
//! reference to it, relabeling rewrites them.

use super::block::{BBox, Block, BlockId, BlockType};
use super::registry::BlockRegistry;
use crate::error::StageError;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

/// An internal link target reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRef {
    pub ref_id: String,
    pub x: f32,
    pub y: f32,
}

/// One bookmark of the source document's outline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlineEntry {
    pub title: String,
    /// 0 for top-level entries.
    pub level: u8,
    pub page_id: Option<usize>,
}

/// One page of the document.
#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub page_id: usize,
    pub bbox: BBox,
    blocks: BTreeMap<usize, Block>,
    next_index: usize,
    /// Ordered top-level block identities.
    pub structure: Vec<BlockId>,
    pub ignore_for_output: bool,
    #[serde(skip)]
    pub image: Option<Arc<DynamicImage>>,
    pub refs: Vec<PageRef>,
}

impl PartialEq for Page {
    fn eq(&self, other: &Self) -> bool {
        self.page_id == other.page_id
            && self.bbox == other.bbox
            && self.blocks == other.blocks
            && self.structure == other.structure
            && self.ignore_for_output == other.ignore_for_output
            && self.refs == other.refs
    }
}

impl Page {
    pub fn new(page_id: usize, bbox: BBox) -> Self {
        Self {
            page_id,
            bbox,
            blocks: BTreeMap::new(),
            next_index: 0,
            structure: Vec::new(),
            ignore_for_output: false,
            image: None,
            refs: Vec::new(),
        }
    }

    /// Allocate a block in the arena. The caller links it into a structure.
    pub fn add_block(&mut self, block_type: BlockType, bbox: BBox) -> BlockId {
        let id = BlockId {
            page_id: self.page_id,
            block_type,
            index: self.next_index,
        };
        self.next_index += 1;
        self.blocks.insert(id.index, Block::new(id, bbox));
        id
    }

    pub fn get_block(&self, id: &BlockId) -> Option<&Block> {
        self.blocks
            .get(&id.index)
            .filter(|b| b.id == *id)
    }

    pub fn get_block_mut(&mut self, id: &BlockId) -> Option<&mut Block> {
        self.blocks
            .get_mut(&id.index)
            .filter(|b| b.id == *id)
    }

    pub fn block(&self, id: &BlockId) -> Result<&Block, StageError> {
        self.get_block(id)
            .ok_or_else(|| StageError::MissingBlock(id.to_string()))
    }

    pub fn block_mut(&mut self, id: &BlockId) -> Result<&mut Block, StageError> {
        self.get_block_mut(id)
            .ok_or_else(|| StageError::MissingBlock(id.to_string()))
    }

    /// Every block in the arena, in allocation order.
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    pub fn blocks_mut(&mut self) -> impl Iterator<Item = &mut Block> {
        self.blocks.values_mut()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Top-level blocks in structure order.
    pub fn top_level(&self) -> impl Iterator<Item = &Block> {
        self.structure.iter().filter_map(|id| self.get_block(id))
    }

    /// Depth-first walk of the structure, returning ids of the requested
    /// types (all types when `types` is empty).
    pub fn contained_blocks(&self, types: &[BlockType]) -> Vec<BlockId> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for id in &self.structure {
            self.collect(id, types, &mut out, &mut seen);
        }
        out
    }

    fn collect(
        &self,
        id: &BlockId,
        types: &[BlockType],
        out: &mut Vec<BlockId>,
        seen: &mut HashSet<BlockId>,
    ) {
        if !seen.insert(*id) {
            return;
        }
        let Some(block) = self.get_block(id) else {
            return;
        };
        if types.is_empty() || types.contains(&block.block_type()) {
            out.push(*id);
        }
        for child in &block.structure {
            self.collect(child, types, out, seen);
        }
    }

    /// Raw text of a block: its own text, or its children's text joined by
    /// newlines when it has none.
    pub fn raw_text(&self, id: &BlockId) -> String {
        let Some(block) = self.get_block(id) else {
            return String::new();
        };
        if !block.text.is_empty() || block.structure.is_empty() {
            return block.text.clone();
        }
        block
            .structure
            .iter()
            .map(|child| self.raw_text(child))
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Remove a block, its descendants and every reference to it.
    pub fn remove_block(&mut self, id: &BlockId) {
        let Some(block) = self.blocks.remove(&id.index) else {
            return;
        };
        for child in block.structure {
            self.remove_block(&child);
        }
        self.structure.retain(|s| s != id);
        for other in self.blocks.values_mut() {
            other.structure.retain(|s| s != id);
        }
    }

    /// Change a block's type, rewriting every reference. Returns the new id.
    pub fn relabel(&mut self, id: &BlockId, to: BlockType) -> Result<BlockId, StageError> {
        let mut block = self
            .blocks
            .remove(&id.index)
            .filter(|b| b.id == *id)
            .ok_or_else(|| StageError::MissingBlock(id.to_string()))?;
        let new_id = BlockId {
            block_type: to,
            ..*id
        };
        block.id = new_id;
        self.blocks.insert(new_id.index, block);
        let rewrite = |s: &mut BlockId| {
            if s == id {
                *s = new_id;
            }
        };
        self.structure.iter_mut().for_each(rewrite);
        for other in self.blocks.values_mut() {
            other.structure.iter_mut().for_each(rewrite);
        }
        Ok(new_id)
    }

    /// Identities of visible top-level blocks, or nothing for a hidden page.
    pub fn visible_structure(&self) -> Vec<BlockId> {
        if self.ignore_for_output {
            return Vec::new();
        }
        self.top_level()
            .filter(|b| !b.ignore_for_output)
            .map(|b| b.id)
            .collect()
    }

    /// Check that every structure entry resolves and the child graph is acyclic.
    pub fn validate(&self) -> Result<(), StageError> {
        let broken = |detail: String| StageError::BrokenStructure {
            page: self.page_id,
            detail,
        };
        for id in &self.structure {
            if self.get_block(id).is_none() {
                return Err(broken(format!("structure references missing block {id}")));
            }
        }
        for block in self.blocks.values() {
            for child in &block.structure {
                if self.get_block(child).is_none() {
                    return Err(broken(format!(
                        "{} references missing child {child}",
                        block.id
                    )));
                }
            }
        }
        // Three-colour DFS over the child graph.
        let mut state: BTreeMap<usize, u8> = BTreeMap::new();
        for start in self.blocks.keys() {
            if state.get(start).copied().unwrap_or(0) == 0 {
                self.visit(*start, &mut state)
                    .map_err(|at| broken(format!("cycle through block index {at}")))?;
            }
        }
        Ok(())
    }

    fn visit(&self, index: usize, state: &mut BTreeMap<usize, u8>) -> Result<(), usize> {
        state.insert(index, 1);
        if let Some(block) = self.blocks.get(&index) {
            for child in &block.structure {
                match state.get(&child.index).copied().unwrap_or(0) {
                    1 => return Err(child.index),
                    0 => self.visit(child.index, state)?,
                    _ => {}
                }
            }
        }
        state.insert(index, 2);
        Ok(())
    }
}

/// One table-of-contents entry, derived from section headers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TocEntry {
    pub title: String,
    pub heading_level: u8,
    pub page_id: usize,
    pub bbox: BBox,
    pub doc_toc_level: bool,
}

/// The central document model, rebuilt for every conversion.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub filepath: PathBuf,
    pub pages: Vec<Page>,
    pub table_of_contents: Vec<TocEntry>,
    /// Bookmarks reported by the provider.
    pub outline: Vec<OutlineEntry>,
    /// Free-form annotations written by the debug processor.
    pub debug: BTreeMap<String, serde_json::Value>,
    #[serde(skip)]
    pub registry: Arc<BlockRegistry>,
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.filepath == other.filepath
            && self.pages == other.pages
            && self.table_of_contents == other.table_of_contents
            && self.outline == other.outline
            && self.debug == other.debug
    }
}

impl Document {
    pub fn new(filepath: impl Into<PathBuf>, pages: Vec<Page>, registry: Arc<BlockRegistry>) -> Self {
        Self {
            filepath: filepath.into(),
            pages,
            table_of_contents: Vec::new(),
            outline: Vec::new(),
            debug: BTreeMap::new(),
            registry,
        }
    }

    pub fn get_page(&self, page_id: usize) -> Option<&Page> {
        self.pages.iter().find(|p| p.page_id == page_id)
    }

    pub fn get_page_mut(&mut self, page_id: usize) -> Option<&mut Page> {
        self.pages.iter_mut().find(|p| p.page_id == page_id)
    }

    pub fn get_block(&self, id: &BlockId) -> Option<&Block> {
        self.get_page(id.page_id).and_then(|p| p.get_block(id))
    }

    /// Allocate a block on a page, applying the block class's default
    /// visibility from this run's registry.
    pub fn add_block(
        &mut self,
        page_index: usize,
        block_type: BlockType,
        bbox: BBox,
    ) -> Result<BlockId, StageError> {
        let hidden = self.registry.class_for(block_type).hidden_by_default();
        let page = self
            .pages
            .get_mut(page_index)
            .ok_or_else(|| StageError::failed(format!("no page at position {page_index}")))?;
        let id = page.add_block(block_type, bbox);
        if let Some(block) = page.get_block_mut(&id) {
            block.ignore_for_output = hidden;
        }
        Ok(id)
    }

    /// Relabel a block and apply the new type's default visibility.
    pub fn relabel_block(&mut self, id: &BlockId, to: BlockType) -> Result<BlockId, StageError> {
        let hidden = self.registry.class_for(to).hidden_by_default();
        let page = self
            .get_page_mut(id.page_id)
            .ok_or_else(|| StageError::MissingBlock(id.to_string()))?;
        let new_id = page.relabel(id, to)?;
        if !page.ignore_for_output {
            page.block_mut(&new_id)?.ignore_for_output = hidden;
        }
        Ok(new_id)
    }

    /// Validate every page's structure.
    pub fn validate_structure(&self) -> Result<(), StageError> {
        self.pages.iter().try_for_each(Page::validate)
    }

    /// `(page_id, block_id)` pairs of every block of the given types, in
    /// page then structure order.
    pub fn contained_blocks(&self, types: &[BlockType]) -> Vec<BlockId> {
        self.pages
            .iter()
            .flat_map(|p| p.contained_blocks(types))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_with_text() -> (Page, BlockId, BlockId) {
        let mut page = Page::new(0, BBox::new(0.0, 0.0, 600.0, 800.0));
        let text = page.add_block(BlockType::Text, BBox::new(10.0, 10.0, 500.0, 40.0));
        let line = page.add_block(BlockType::Line, BBox::new(10.0, 10.0, 500.0, 20.0));
        page.get_block_mut(&line).unwrap().text = "hello".into();
        page.get_block_mut(&text).unwrap().structure.push(line);
        page.structure.push(text);
        (page, text, line)
    }

    #[test]
    fn raw_text_falls_back_to_children() {
        let (page, text, _) = page_with_text();
        assert_eq!(page.raw_text(&text), "hello");
    }

    #[test]
    fn relabel_rewrites_references() {
        let (mut page, text, _) = page_with_text();
        let new_id = page.relabel(&text, BlockType::SectionHeader).unwrap();
        assert_eq!(page.structure, vec![new_id]);
        assert!(page.get_block(&text).is_none());
        assert_eq!(page.get_block(&new_id).unwrap().block_type(), BlockType::SectionHeader);
        page.validate().unwrap();
    }

    #[test]
    fn remove_block_drops_descendants_and_references() {
        let (mut page, text, line) = page_with_text();
        page.remove_block(&text);
        assert!(page.structure.is_empty());
        assert!(page.get_block(&line).is_none());
        assert_eq!(page.block_count(), 0);
        page.validate().unwrap();
    }

    #[test]
    fn validate_detects_dangling_reference() {
        let (mut page, _, _) = page_with_text();
        page.structure.push(BlockId {
            page_id: 0,
            block_type: BlockType::Table,
            index: 99,
        });
        assert!(matches!(
            page.validate(),
            Err(StageError::BrokenStructure { page: 0, .. })
        ));
    }

    #[test]
    fn validate_detects_cycle() {
        let (mut page, text, line) = page_with_text();
        page.get_block_mut(&line).unwrap().structure.push(text);
        assert!(page.validate().is_err());
    }

    #[test]
    fn hidden_page_has_empty_visible_structure() {
        let (mut page, text, _) = page_with_text();
        assert_eq!(page.visible_structure(), vec![text]);
        page.ignore_for_output = true;
        assert!(page.visible_structure().is_empty());
    }

    #[test]
    fn add_block_applies_class_visibility() {
        let page = Page::new(0, BBox::new(0.0, 0.0, 100.0, 100.0));
        let mut doc = Document::new("x.pdf", vec![page], Arc::new(BlockRegistry::default()));
        let header = doc
            .add_block(0, BlockType::PageHeader, BBox::new(0.0, 0.0, 100.0, 10.0))
            .unwrap();
        let text = doc
            .add_block(0, BlockType::Text, BBox::new(0.0, 20.0, 100.0, 30.0))
            .unwrap();
        assert!(doc.get_block(&header).unwrap().ignore_for_output);
        assert!(!doc.get_block(&text).unwrap().ignore_for_output);

        let shown = doc.relabel_block(&header, BlockType::SectionHeader).unwrap();
        assert!(!doc.get_block(&shown).unwrap().ignore_for_output);
    }
}
