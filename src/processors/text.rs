//! Textual cleanup processors.

use super::Processor;
use crate::error::StageError;
use crate::schema::{BlockId, BlockType, Document, Page};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use tracing::debug;

fn font_size(page: &Page, id: &BlockId) -> Option<f32> {
    page.get_block(id)?.metadata.get("font_size")?.parse().ok()
}

fn child_lines(page: &Page, id: &BlockId) -> Vec<BlockId> {
    page.get_block(id)
        .map(|b| {
            b.structure
                .iter()
                .filter(|c| c.block_type == BlockType::Line)
                .copied()
                .collect()
        })
        .unwrap_or_default()
}

/// Marks indented text blocks as block quotes.
pub struct BlockquoteProcessor {
    /// Left indent, as a fraction of page width, that makes a quote.
    pub min_x_indent: f32,
    /// How far inside the text column's right edge a quote must end.
    pub x_end_tolerance: f32,
}

#[async_trait]
impl Processor for BlockquoteProcessor {
    fn name(&self) -> &'static str {
        "blockquote"
    }

    async fn process(&self, document: &mut Document) -> Result<(), StageError> {
        for page in document.pages.iter_mut() {
            let texts: Vec<(BlockId, f32, f32)> = page
                .top_level()
                .filter(|b| b.block_type() == BlockType::Text)
                .map(|b| (b.id, b.bbox.x0(), b.bbox.x1()))
                .collect();
            if texts.len() < 2 {
                continue;
            }
            let left = texts.iter().map(|t| t.1).fold(f32::INFINITY, f32::min);
            let right = texts.iter().map(|t| t.2).fold(f32::NEG_INFINITY, f32::max);
            let width = page.bbox.width();
            for (id, x0, x1) in texts {
                if x0 - left >= self.min_x_indent * width
                    && right - x1 >= self.x_end_tolerance * width
                {
                    let block = page.block_mut(&id)?;
                    block.metadata.insert("blockquote".into(), "true".into());
                    block.indent_level = Some(1);
                }
            }
        }
        Ok(())
    }
}

/// Rebuilds code indentation from line positions.
pub struct CodeProcessor;

#[async_trait]
impl Processor for CodeProcessor {
    fn name(&self) -> &'static str {
        "code"
    }

    async fn process(&self, document: &mut Document) -> Result<(), StageError> {
        for page in document.pages.iter_mut() {
            for id in page.contained_blocks(&[BlockType::Code]) {
                let lines: Vec<(f32, f32, String)> = child_lines(page, &id)
                    .iter()
                    .filter_map(|l| page.get_block(l))
                    .map(|l| (l.bbox.x0(), l.bbox.width(), l.text.clone()))
                    .collect();
                if lines.is_empty() {
                    continue;
                }
                let min_x = lines.iter().map(|l| l.0).fold(f32::INFINITY, f32::min);
                let chars: usize = lines.iter().map(|l| l.2.chars().count()).sum();
                let width: f32 = lines.iter().map(|l| l.1).sum();
                let char_width = if chars > 0 { width / chars as f32 } else { 0.0 };
                let text = lines
                    .iter()
                    .map(|(x0, _, t)| {
                        let indent = if char_width > 0.0 {
                            ((x0 - min_x) / char_width).round() as usize
                        } else {
                            0
                        };
                        format!("{}{}", " ".repeat(indent), t)
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                page.block_mut(&id)?.text = text;
            }
        }
        Ok(())
    }
}

/// Collapses equation lines into one expression.
pub struct EquationProcessor;

#[async_trait]
impl Processor for EquationProcessor {
    fn name(&self) -> &'static str {
        "equation"
    }

    async fn process(&self, document: &mut Document) -> Result<(), StageError> {
        for page in document.pages.iter_mut() {
            for id in page.contained_blocks(&[BlockType::Equation]) {
                let text = page
                    .raw_text(&id)
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ");
                page.block_mut(&id)?.text = text;
            }
        }
        Ok(())
    }
}

static FOOTNOTE_MARK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:\d{1,3}|[*†‡§¶])\s?\S").unwrap());

/// Relabels small marked text at the bottom of a page as footnotes.
pub struct FootnoteProcessor;

#[async_trait]
impl Processor for FootnoteProcessor {
    fn name(&self) -> &'static str {
        "footnote"
    }

    async fn process(&self, document: &mut Document) -> Result<(), StageError> {
        let mut targets = Vec::new();
        for page in &document.pages {
            let mut sizes: Vec<f32> = page
                .top_level()
                .filter(|b| b.block_type() == BlockType::Text)
                .filter_map(|b| font_size(page, &b.id))
                .collect();
            sizes.sort_by(f32::total_cmp);
            let body = sizes.get(sizes.len() / 2).copied();
            let cutoff = page.bbox.y0() + 0.85 * page.bbox.height();
            for block in page.top_level() {
                if block.block_type() != BlockType::Text || block.bbox.y0() < cutoff {
                    continue;
                }
                let smaller = match (body, font_size(page, &block.id)) {
                    (Some(body), Some(size)) => size < body,
                    _ => true,
                };
                if smaller && FOOTNOTE_MARK.is_match(&page.raw_text(&block.id)) {
                    targets.push(block.id);
                }
            }
        }
        for id in targets {
            document.relabel_block(&id, BlockType::Footnote)?;
        }
        Ok(())
    }
}

fn normalise_repeated(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_ascii_digit())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Hides text repeated at the top or bottom of many pages (running
/// titles the layout model did not catch as page furniture).
pub struct IgnoreTextProcessor {
    /// Fraction of pages a text must appear on.
    pub threshold: f32,
    /// Minimum number of pages a text must appear on.
    pub min_blocks: usize,
}

#[async_trait]
impl Processor for IgnoreTextProcessor {
    fn name(&self) -> &'static str {
        "ignore_text"
    }

    async fn process(&self, document: &mut Document) -> Result<(), StageError> {
        let pages = document.pages.len();
        if pages < self.min_blocks {
            return Ok(());
        }
        let mut seen: HashMap<String, Vec<BlockId>> = HashMap::new();
        for page in &document.pages {
            let edges: Vec<&BlockId> = page
                .structure
                .first()
                .into_iter()
                .chain(page.structure.last().filter(|_| page.structure.len() > 1))
                .collect();
            for id in edges {
                if !matches!(id.block_type, BlockType::Text | BlockType::SectionHeader) {
                    continue;
                }
                let key = normalise_repeated(&page.raw_text(id));
                if !key.is_empty() {
                    seen.entry(key).or_default().push(*id);
                }
            }
        }
        let needed = self
            .min_blocks
            .max((self.threshold * pages as f32).ceil() as usize);
        for (key, ids) in seen {
            if ids.len() < needed {
                continue;
            }
            debug!("Hiding '{}' repeated on {} pages", key, ids.len());
            for id in ids {
                if let Some(page) = document.get_page_mut(id.page_id) {
                    page.block_mut(&id)?.ignore_for_output = true;
                }
            }
        }
        Ok(())
    }
}

static LINE_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*\d+\s+").unwrap());

/// Strips line numbers from line-numbered documents (legal, drafts).
pub struct LineNumbersProcessor {
    /// Fraction of lines that must start with a number.
    pub threshold: f32,
    pub min_lines: usize,
}

#[async_trait]
impl Processor for LineNumbersProcessor {
    fn name(&self) -> &'static str {
        "line_numbers"
    }

    async fn process(&self, document: &mut Document) -> Result<(), StageError> {
        for page in document.pages.iter_mut() {
            for id in page.contained_blocks(&[BlockType::Text]) {
                let lines = child_lines(page, &id);
                if lines.len() < self.min_lines {
                    continue;
                }
                let numbered = lines
                    .iter()
                    .filter_map(|l| page.get_block(l))
                    .filter(|l| LINE_NUMBER.is_match(&l.text))
                    .count();
                if (numbered as f32) < self.threshold * lines.len() as f32 {
                    continue;
                }
                for line in lines {
                    let block = page.block_mut(&line)?;
                    block.text = LINE_NUMBER.replace(&block.text, "").into_owned();
                }
            }
        }
        Ok(())
    }
}

/// Nesting levels for list items and list continuation across pages.
pub struct ListProcessor {
    /// Horizontal offset, in points, of one nesting level.
    pub indent_width: f32,
}

#[async_trait]
impl Processor for ListProcessor {
    fn name(&self) -> &'static str {
        "list"
    }

    async fn process(&self, document: &mut Document) -> Result<(), StageError> {
        for page in document.pages.iter_mut() {
            for group in page.contained_blocks(&[BlockType::ListGroup]) {
                let items: Vec<(BlockId, f32)> = page
                    .block(&group)?
                    .structure
                    .iter()
                    .filter_map(|i| page.get_block(i))
                    .map(|b| (b.id, b.bbox.x0()))
                    .collect();
                let min_x = items.iter().map(|i| i.1).fold(f32::INFINITY, f32::min);
                for (item, x0) in items {
                    let level = if self.indent_width > 0.0 {
                        ((x0 - min_x) / self.indent_width).round().min(6.0) as u8
                    } else {
                        0
                    };
                    page.block_mut(&item)?.indent_level = Some(level);
                }
            }
        }

        for i in 1..document.pages.len() {
            let ends_with_list = document.pages[i - 1]
                .visible_structure()
                .last()
                .is_some_and(|id| id.block_type == BlockType::ListGroup);
            let starts_with_list = document.pages[i]
                .visible_structure()
                .first()
                .is_some_and(|id| id.block_type == BlockType::ListGroup);
            if ends_with_list && starts_with_list {
                if let Some(id) = document.pages[i - 1].visible_structure().last().copied() {
                    document.pages[i - 1]
                        .block_mut(&id)?
                        .metadata
                        .insert("has_continuation".into(), "true".into());
                }
            }
        }
        Ok(())
    }
}

/// Detects paragraphs that continue on the next page.
pub struct TextProcessor;

fn ends_open(text: &str) -> bool {
    text.trim_end()
        .chars()
        .last()
        .is_some_and(|c| !matches!(c, '.' | '!' | '?' | ':' | ';' | '"' | '”' | ')'))
}

#[async_trait]
impl Processor for TextProcessor {
    fn name(&self) -> &'static str {
        "text"
    }

    async fn process(&self, document: &mut Document) -> Result<(), StageError> {
        for i in 1..document.pages.len() {
            let last = document.pages[i - 1]
                .visible_structure()
                .last()
                .copied()
                .filter(|id| id.block_type == BlockType::Text);
            let next = document.pages[i]
                .visible_structure()
                .first()
                .copied()
                .filter(|id| id.block_type == BlockType::Text);
            let (Some(last), Some(next)) = (last, next) else {
                continue;
            };
            let continues = ends_open(&document.pages[i - 1].raw_text(&last))
                && document.pages[i]
                    .raw_text(&next)
                    .chars()
                    .next()
                    .is_some_and(char::is_lowercase);
            if continues {
                document.pages[i - 1]
                    .block_mut(&last)?
                    .metadata
                    .insert("has_continuation".into(), "true".into());
            }
        }
        Ok(())
    }
}
