//! Structural normalisation: reading order, relabeling, line merging.

use super::Processor;
use crate::error::{ConvertError, StageError};
use crate::schema::{BBox, BlockId, BlockType, Document, Page};
use async_trait::async_trait;
use tracing::debug;

/// Column-aware reading order.
///
/// A page is treated as two-column when at least two blocks sit entirely
/// in each half. Full-width blocks split the page into bands; within a
/// band the left column is read before the right one.
pub struct OrderProcessor;

#[derive(Clone, Copy, PartialEq)]
enum Column {
    Left,
    Right,
    Full,
}

pub(crate) fn reading_order(page: &Page) -> Vec<BlockId> {
    let mut items: Vec<(BlockId, BBox)> = page
        .structure
        .iter()
        .filter_map(|id| page.get_block(id).map(|b| (*id, b.bbox)))
        .collect();
    items.sort_by(|(_, a), (_, b)| a.y0().total_cmp(&b.y0()).then(a.x0().total_cmp(&b.x0())));

    let mid = page.bbox.x0() + page.bbox.width() / 2.0;
    let tolerance = 0.02 * page.bbox.width();
    let column = |b: &BBox| {
        if b.x1() <= mid + tolerance {
            Column::Left
        } else if b.x0() >= mid - tolerance {
            Column::Right
        } else {
            Column::Full
        }
    };
    let left = items.iter().filter(|(_, b)| column(b) == Column::Left).count();
    let right = items.iter().filter(|(_, b)| column(b) == Column::Right).count();
    if left < 2 || right < 2 {
        return items.into_iter().map(|(id, _)| id).collect();
    }

    let mut ordered = Vec::with_capacity(items.len());
    let mut lefts = Vec::new();
    let mut rights = Vec::new();
    for (id, bbox) in items {
        match column(&bbox) {
            Column::Left => lefts.push(id),
            Column::Right => rights.push(id),
            Column::Full => {
                ordered.append(&mut lefts);
                ordered.append(&mut rights);
                ordered.push(id);
            }
        }
    }
    ordered.append(&mut lefts);
    ordered.append(&mut rights);
    ordered
}

#[async_trait]
impl Processor for OrderProcessor {
    fn name(&self) -> &'static str {
        "order"
    }

    async fn process(&self, document: &mut Document) -> Result<(), StageError> {
        for page in document.pages.iter_mut() {
            page.structure = reading_order(page);
        }
        Ok(())
    }
}

/// `from:to:threshold`: relabel `from` blocks whose layout confidence is
/// below `threshold`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelabelRule {
    pub from: BlockType,
    pub to: BlockType,
    pub threshold: f32,
}

/// Applies configured relabel rules to top-level blocks.
#[derive(Debug, Default)]
pub struct RelabelProcessor {
    rules: Vec<RelabelRule>,
}

impl RelabelProcessor {
    /// Parse `"Table:Picture:0.9,SectionHeader:Text:0.5"`. Empty means no rules.
    pub fn parse(rules: &str) -> Result<Self, ConvertError> {
        let mut parsed = Vec::new();
        for rule in rules.split(',').map(str::trim).filter(|r| !r.is_empty()) {
            let parts: Vec<&str> = rule.split(':').map(str::trim).collect();
            let [from, to, threshold] = parts.as_slice() else {
                return Err(ConvertError::config(format!(
                    "relabel rule '{rule}' must look like from:to:threshold"
                )));
            };
            let bad = |e: String| ConvertError::config(format!("relabel rule '{rule}': {e}"));
            parsed.push(RelabelRule {
                from: from.parse().map_err(bad)?,
                to: to.parse().map_err(bad)?,
                threshold: threshold
                    .parse()
                    .map_err(|_| bad(format!("'{threshold}' is not a number")))?,
            });
        }
        Ok(Self { rules: parsed })
    }
}

#[async_trait]
impl Processor for RelabelProcessor {
    fn name(&self) -> &'static str {
        "relabel"
    }

    async fn process(&self, document: &mut Document) -> Result<(), StageError> {
        for rule in &self.rules {
            let targets: Vec<BlockId> = document
                .pages
                .iter()
                .flat_map(|p| p.top_level())
                .filter(|b| b.block_type() == rule.from && b.confidence() < rule.threshold)
                .map(|b| b.id)
                .collect();
            for id in targets {
                let new_id = document.relabel_block(&id, rule.to)?;
                debug!("Relabeled {} → {}", id, new_id);
            }
        }
        Ok(())
    }
}

/// Rejoins words hyphenated across a line break.
pub struct LineMergeProcessor;

const MERGEABLE: [BlockType; 5] = [
    BlockType::Text,
    BlockType::TextInlineMath,
    BlockType::ListItem,
    BlockType::Caption,
    BlockType::Footnote,
];

fn ends_hyphenated(text: &str) -> bool {
    let mut rev = text.chars().rev();
    rev.next() == Some('-') && rev.next().is_some_and(char::is_alphabetic)
}

#[async_trait]
impl Processor for LineMergeProcessor {
    fn name(&self) -> &'static str {
        "line_merge"
    }

    async fn process(&self, document: &mut Document) -> Result<(), StageError> {
        for page in document.pages.iter_mut() {
            for parent in page.contained_blocks(&MERGEABLE) {
                let mut lines = page.block(&parent)?.structure.clone();
                let mut i = 0;
                while i + 1 < lines.len() {
                    let (first, second) = (lines[i], lines[i + 1]);
                    let (a, b) = (page.block(&first)?, page.block(&second)?);
                    let joinable = ends_hyphenated(&a.text)
                        && b.text.chars().next().is_some_and(char::is_lowercase);
                    if !joinable {
                        i += 1;
                        continue;
                    }
                    let mut text = a.text.clone();
                    text.pop();
                    text.push_str(&b.text);
                    let bbox = a.bbox.union(&b.bbox);
                    let merged = page.block_mut(&first)?;
                    merged.text = text;
                    merged.bbox = bbox;
                    page.remove_block(&second);
                    lines.remove(i + 1);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::BlockRegistry;
    use std::sync::Arc;

    fn doc() -> Document {
        Document::new(
            "t.pdf",
            vec![Page::new(0, BBox::new(0.0, 0.0, 600.0, 800.0))],
            Arc::new(BlockRegistry::default()),
        )
    }

    fn push(d: &mut Document, t: BlockType, bbox: BBox) -> BlockId {
        let id = d.add_block(0, t, bbox).unwrap();
        d.pages[0].structure.push(id);
        id
    }

    #[tokio::test]
    async fn two_columns_read_left_then_right() {
        let mut d = doc();
        let title = push(&mut d, BlockType::SectionHeader, BBox::new(50.0, 40.0, 550.0, 60.0));
        let r1 = push(&mut d, BlockType::Text, BBox::new(310.0, 100.0, 550.0, 200.0));
        let l1 = push(&mut d, BlockType::Text, BBox::new(50.0, 100.0, 290.0, 200.0));
        let r2 = push(&mut d, BlockType::Text, BBox::new(310.0, 220.0, 550.0, 300.0));
        let l2 = push(&mut d, BlockType::Text, BBox::new(50.0, 220.0, 290.0, 300.0));
        OrderProcessor.process(&mut d).await.unwrap();
        assert_eq!(d.pages[0].structure, vec![title, l1, l2, r1, r2]);
    }

    #[tokio::test]
    async fn single_column_is_top_to_bottom() {
        let mut d = doc();
        let b = push(&mut d, BlockType::Text, BBox::new(50.0, 300.0, 550.0, 320.0));
        let a = push(&mut d, BlockType::Text, BBox::new(50.0, 100.0, 550.0, 120.0));
        OrderProcessor.process(&mut d).await.unwrap();
        assert_eq!(d.pages[0].structure, vec![a, b]);
    }

    #[tokio::test]
    async fn relabel_rules_use_confidence() {
        let mut d = doc();
        let id = push(&mut d, BlockType::Table, BBox::new(0.0, 0.0, 10.0, 10.0));
        d.pages[0].block_mut(&id).unwrap().top_k.insert(BlockType::Table, 0.4);
        RelabelProcessor::parse("Table:Picture:0.5")
            .unwrap()
            .process(&mut d)
            .await
            .unwrap();
        assert_eq!(d.pages[0].structure[0].block_type, BlockType::Picture);
    }

    #[test]
    fn malformed_relabel_rule() {
        assert!(RelabelProcessor::parse("").unwrap().rules.is_empty());
        assert!(RelabelProcessor::parse("Table:Picture").is_err());
        assert!(RelabelProcessor::parse("Table:Nope:0.5").is_err());
    }

    #[tokio::test]
    async fn hyphenated_lines_are_joined() {
        let mut d = doc();
        let text = push(&mut d, BlockType::Text, BBox::new(0.0, 0.0, 300.0, 30.0));
        let page = &mut d.pages[0];
        for (i, t) in ["The docu-", "ment is long", "Next-", "Line"].iter().enumerate() {
            let y = i as f32 * 10.0;
            let line = page.add_block(BlockType::Line, BBox::new(0.0, y, 300.0, y + 10.0));
            page.block_mut(&line).unwrap().text = t.to_string();
            page.block_mut(&text).unwrap().structure.push(line);
        }
        LineMergeProcessor.process(&mut d).await.unwrap();
        assert_eq!(d.pages[0].raw_text(&text), "The document is long\nNext-\nLine");
        d.validate_structure().unwrap();
    }
}
