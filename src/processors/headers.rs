//! Page headers, section heading levels and the table of contents.

use super::Processor;
use crate::error::StageError;
use crate::schema::{BlockId, BlockType, Document, TocEntry};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Moves page headers to the front of their page and turns "headers"
/// found far down the page into section headers.
pub struct PageHeaderProcessor {
    /// Fraction of page height a real running header stays within.
    pub band: f32,
}

#[async_trait]
impl Processor for PageHeaderProcessor {
    fn name(&self) -> &'static str {
        "page_header"
    }

    async fn process(&self, document: &mut Document) -> Result<(), StageError> {
        let misplaced: Vec<BlockId> = document
            .pages
            .iter()
            .flat_map(|page| {
                let limit = page.bbox.y0() + self.band * page.bbox.height();
                page.top_level()
                    .filter(move |b| b.block_type() == BlockType::PageHeader && b.bbox.y0() > limit)
                    .map(|b| b.id)
            })
            .collect();
        for id in misplaced {
            debug!("{} sits below the header band, relabeling", id);
            document.relabel_block(&id, BlockType::SectionHeader)?;
        }

        for page in document.pages.iter_mut() {
            let (headers, rest): (Vec<BlockId>, Vec<BlockId>) = page
                .structure
                .iter()
                .partition(|id| id.block_type == BlockType::PageHeader);
            page.structure = headers.into_iter().chain(rest).collect();
        }
        Ok(())
    }
}

fn header_font_size(document: &Document, id: &BlockId) -> Option<f32> {
    let block = document.get_block(id)?;
    block
        .metadata
        .get("font_size")
        .and_then(|s| s.parse().ok())
        .or(block.line_height)
}

/// Assigns heading levels by clustering section header font sizes:
/// the largest size is level 1, the next level 2, and so on.
pub struct SectionHeaderProcessor {
    pub level_count: usize,
    /// Sizes closer than this, in points, share a level.
    pub merge_threshold: f32,
    /// Level used when every header has the same size.
    pub default_level: u8,
}

impl SectionHeaderProcessor {
    fn levels(&self, sizes: &[f32]) -> Vec<f32> {
        let mut sorted = sizes.to_vec();
        sorted.sort_by(|a, b| b.total_cmp(a));
        let mut clusters: Vec<f32> = Vec::new();
        for size in sorted {
            match clusters.last() {
                Some(last) if last - size <= self.merge_threshold => {}
                _ => clusters.push(size),
            }
        }
        clusters
    }
}

#[async_trait]
impl Processor for SectionHeaderProcessor {
    fn name(&self) -> &'static str {
        "section_header"
    }

    async fn process(&self, document: &mut Document) -> Result<(), StageError> {
        let headers: Vec<(BlockId, Option<f32>)> = document
            .contained_blocks(&[BlockType::SectionHeader])
            .into_iter()
            .filter(|id| document.get_block(id).is_some_and(|b| !b.doc_toc_level))
            .map(|id| (id, header_font_size(document, &id)))
            .collect();
        let sizes: Vec<f32> = headers.iter().filter_map(|h| h.1).collect();
        let clusters = self.levels(&sizes);

        for (id, size) in headers {
            let level = match size {
                Some(size) if clusters.len() > 1 => {
                    let rank = clusters
                        .iter()
                        .position(|c| c - size <= self.merge_threshold)
                        .unwrap_or(clusters.len() - 1);
                    (rank + 1).min(self.level_count) as u8
                }
                _ => self.default_level,
            };
            if let Some(page) = document.get_page_mut(id.page_id) {
                page.block_mut(&id)?.heading_level = Some(level);
            }
        }
        Ok(())
    }
}

fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Similarity of two titles: `(jaccard, cosine, overlap)` over lowercase
/// alphanumeric tokens.
pub fn lexical_similarity(a: &str, b: &str) -> (f32, f32, f32) {
    let (ta, tb) = (tokens(a), tokens(b));
    if ta.is_empty() || tb.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let sa: HashSet<&str> = ta.iter().map(String::as_str).collect();
    let sb: HashSet<&str> = tb.iter().map(String::as_str).collect();
    let shared = sa.intersection(&sb).count() as f32;
    let jaccard = shared / sa.union(&sb).count() as f32;
    let overlap = shared / sa.len().min(sb.len()) as f32;

    fn freq(t: &[String]) -> HashMap<&str, f32> {
        let mut m = HashMap::new();
        for w in t {
            *m.entry(w.as_str()).or_default() += 1.0;
        }
        m
    }
    let (fa, fb) = (freq(&ta), freq(&tb));
    let dot: f32 = fa.iter().map(|(w, n)| n * fb.get(w).copied().unwrap_or(0.0)).sum();
    let norm = |m: &HashMap<&str, f32>| m.values().map(|n| n * n).sum::<f32>().sqrt();
    let cosine = dot / (norm(&fa) * norm(&fb));
    (jaccard, cosine, overlap)
}

/// Matches outline bookmarks to section headers and builds the
/// document's table of contents.
pub struct DocumentTocProcessor {
    pub overlap_threshold: f32,
}

/// Titles longer than the outline entry by more than this are not matches.
const MAX_TITLE_LENGTH_DIFF: usize = 60;

#[async_trait]
impl Processor for DocumentTocProcessor {
    fn name(&self) -> &'static str {
        "document_toc"
    }

    async fn process(&self, document: &mut Document) -> Result<(), StageError> {
        let headers: Vec<(BlockId, String)> = document
            .contained_blocks(&[BlockType::SectionHeader])
            .into_iter()
            .filter_map(|id| {
                let page = document.get_page(id.page_id)?;
                Some((id, page.raw_text(&id).replace('\n', " ")))
            })
            .collect();

        let mut matched: HashMap<BlockId, u8> = HashMap::new();
        for entry in &document.outline {
            let best = headers
                .iter()
                .filter(|(id, _)| entry.page_id.is_none_or(|p| p == id.page_id))
                .filter(|(id, _)| !matched.contains_key(id))
                .filter(|(_, text)| {
                    text.chars().count().abs_diff(entry.title.chars().count()) <= MAX_TITLE_LENGTH_DIFF
                })
                .map(|(id, text)| (id, lexical_similarity(&entry.title, text)))
                .filter(|(_, (_, _, overlap))| *overlap > self.overlap_threshold)
                .max_by(|a, b| (a.1 .0 + a.1 .1).total_cmp(&(b.1 .0 + b.1 .1)));
            if let Some((id, _)) = best {
                matched.insert(*id, (entry.level + 1).min(6));
            }
        }
        debug!("{} of {} outline entries matched a header", matched.len(), document.outline.len());

        for (id, level) in &matched {
            if let Some(page) = document.get_page_mut(id.page_id) {
                let block = page.block_mut(id)?;
                block.heading_level = Some(*level);
                block.doc_toc_level = true;
            }
        }

        let mut toc = Vec::with_capacity(headers.len());
        let mut parent_level = 0u8;
        for (id, title) in headers {
            let Some(block) = document.get_block(&id) else {
                continue;
            };
            let heading_level = match matched.get(&id) {
                Some(level) => {
                    parent_level = *level;
                    *level
                }
                None => (parent_level + 1).min(6),
            };
            toc.push(TocEntry {
                title,
                heading_level,
                page_id: id.page_id,
                bbox: block.bbox,
                doc_toc_level: matched.contains_key(&id),
            });
        }
        document.table_of_contents = toc;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{BBox, BlockRegistry, OutlineEntry, Page};
    use std::sync::Arc;

    fn doc() -> Document {
        Document::new(
            "t.pdf",
            vec![Page::new(0, BBox::new(0.0, 0.0, 600.0, 800.0))],
            Arc::new(BlockRegistry::default()),
        )
    }

    fn header(d: &mut Document, text: &str, y: f32, size: f32) -> BlockId {
        let id = d.add_block(0, BlockType::SectionHeader, BBox::new(50.0, y, 550.0, y + size)).unwrap();
        let p = &mut d.pages[0];
        p.structure.push(id);
        let block = p.block_mut(&id).unwrap();
        block.text = text.into();
        block.metadata.insert("font_size".into(), format!("{size:.1}"));
        id
    }

    #[test]
    fn similarity_measures() {
        let (j, c, o) = lexical_similarity("1. Introduction", "Introduction");
        assert!(o > 0.99 && j < 1.0 && c > 0.5);
        assert_eq!(lexical_similarity("", "x"), (0.0, 0.0, 0.0));
    }

    #[test]
    fn cosine_counts_repeated_tokens() {
        let (j, c, _) = lexical_similarity("data data model", "data model");
        assert_eq!(j, 1.0);
        assert!((c - 3.0 / 10f32.sqrt()).abs() < 1e-5);
    }

    #[tokio::test]
    async fn levels_follow_font_size() {
        let mut d = doc();
        let h1 = header(&mut d, "Title", 40.0, 24.0);
        let h2 = header(&mut d, "Section", 100.0, 16.0);
        let h2b = header(&mut d, "Other section", 200.0, 15.8);
        let h3 = header(&mut d, "Detail", 300.0, 12.0);
        SectionHeaderProcessor { level_count: 4, merge_threshold: 0.5, default_level: 2 }
            .process(&mut d)
            .await
            .unwrap();
        let level = |id: &BlockId| d.get_block(id).unwrap().heading_level;
        assert_eq!(level(&h1), Some(1));
        assert_eq!(level(&h2), Some(2));
        assert_eq!(level(&h2b), Some(2));
        assert_eq!(level(&h3), Some(3));
    }

    #[tokio::test]
    async fn outline_sets_levels_and_builds_toc() {
        let mut d = doc();
        let intro = header(&mut d, "1 Introduction", 100.0, 16.0);
        header(&mut d, "Background details", 200.0, 14.0);
        d.outline = vec![OutlineEntry {
            title: "Introduction".into(),
            level: 0,
            page_id: Some(0),
        }];
        DocumentTocProcessor { overlap_threshold: 0.9 }
            .process(&mut d)
            .await
            .unwrap();
        let block = d.get_block(&intro).unwrap();
        assert_eq!(block.heading_level, Some(1));
        assert!(block.doc_toc_level);
        let levels: Vec<_> = d.table_of_contents.iter().map(|e| (e.heading_level, e.doc_toc_level)).collect();
        assert_eq!(levels, vec![(1, true), (2, false)]);
    }

    #[tokio::test]
    async fn misplaced_page_header_becomes_section_header() {
        let mut d = doc();
        let text = d.add_block(0, BlockType::Text, BBox::new(50.0, 100.0, 550.0, 120.0)).unwrap();
        let top = d.add_block(0, BlockType::PageHeader, BBox::new(50.0, 20.0, 550.0, 30.0)).unwrap();
        let low = d.add_block(0, BlockType::PageHeader, BBox::new(50.0, 400.0, 550.0, 420.0)).unwrap();
        d.pages[0].structure = vec![text, top, low];
        PageHeaderProcessor { band: 0.2 }.process(&mut d).await.unwrap();
        let s = &d.pages[0].structure;
        assert_eq!(s[0], top);
        assert_eq!(s[1], text);
        assert_eq!(s[2].block_type, BlockType::SectionHeader);
        assert!(!d.get_block(&s[2]).unwrap().ignore_for_output);
    }
}
