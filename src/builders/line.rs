//! Attach provider text lines to layout regions.

use super::DocumentBuilder;
use crate::error::StageError;
use crate::providers::{DocumentProvider, TextLine};
use crate::schema::{BBox, BlockId, BlockType, Document, TextExtraction};
use tracing::debug;

/// Splits each region into `Line` children.
///
/// A line goes to the smallest region containing its center (grown by
/// `margin` points). Lines no region claims get a fresh `Text` region so
/// that no extracted text is lost. Regions left without any line are
/// flagged `needs_ocr`, except images.
pub struct LineBuilder {
    margin: f32,
}

impl LineBuilder {
    pub fn new(margin: f32) -> Self {
        Self {
            margin: margin.max(0.0),
        }
    }

    fn owner(&self, regions: &[(BlockId, BBox)], line: &TextLine) -> Option<BlockId> {
        let (cx, cy) = line.bbox.center();
        regions
            .iter()
            .filter(|(_, bbox)| {
                BBox::new(
                    bbox.x0() - self.margin,
                    bbox.y0() - self.margin,
                    bbox.x1() + self.margin,
                    bbox.y1() + self.margin,
                )
                .contains_point(cx, cy)
            })
            .min_by(|a, b| a.1.area().total_cmp(&b.1.area()))
            .map(|(id, _)| *id)
    }
}

impl DocumentBuilder for LineBuilder {
    fn name(&self) -> &'static str {
        "line"
    }

    fn build(
        &self,
        document: &mut Document,
        provider: &dyn DocumentProvider,
    ) -> Result<(), StageError> {
        for (index, source) in provider.pages().iter().enumerate() {
            let regions: Vec<(BlockId, BBox)> = document.pages[index]
                .top_level()
                .map(|b| (b.id, b.bbox))
                .collect();

            let mut orphans = 0;
            for line in source.lines.iter().filter(|l| !l.text.trim().is_empty()) {
                let parent = match self.owner(&regions, line) {
                    Some(id) => id,
                    None => {
                        orphans += 1;
                        let id = document.add_block(index, BlockType::Text, line.bbox)?;
                        document.pages[index].structure.push(id);
                        id
                    }
                };
                let page = &mut document.pages[index];
                let child = page.add_block(BlockType::Line, line.bbox);
                let block = page.block_mut(&child)?;
                block.text = line.text.trim().to_string();
                block.line_height = Some(line.bbox.height());
                block.extraction = TextExtraction::PdfText;
                if line.font_size > 0.0 {
                    block
                        .metadata
                        .insert("font_size".into(), format!("{:.1}", line.font_size));
                }
                if line.bold {
                    block.metadata.insert("bold".into(), "true".into());
                }
                page.block_mut(&parent)?.structure.push(child);
            }

            let page = &mut document.pages[index];
            for id in page.structure.clone() {
                let (heights, sizes) = {
                    let block = page.block(&id)?;
                    let children: Vec<_> = block
                        .structure
                        .iter()
                        .filter_map(|c| page.get_block(c))
                        .collect();
                    let heights: Vec<f32> = children.iter().filter_map(|c| c.line_height).collect();
                    let sizes: Vec<f32> = children
                        .iter()
                        .filter_map(|c| c.metadata.get("font_size"))
                        .filter_map(|s| s.parse().ok())
                        .collect();
                    (heights, sizes)
                };
                let block = page.block_mut(&id)?;
                if heights.is_empty() {
                    block.needs_ocr = !block.block_type().is_image();
                    continue;
                }
                block.extraction = TextExtraction::PdfText;
                block.line_height = Some(heights.iter().sum::<f32>() / heights.len() as f32);
                if let Some(max) = sizes.into_iter().reduce(f32::max) {
                    block.metadata.insert("font_size".into(), format!("{max:.1}"));
                }
            }
            if orphans > 0 {
                debug!("Page {}: {} unclaimed lines became text regions", source.page_id, orphans);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{MemoryProvider, ProviderPage};
    use crate::schema::{BlockRegistry, Page};
    use std::sync::Arc;

    fn setup(lines: Vec<TextLine>, regions: &[(BlockType, BBox)]) -> (Document, MemoryProvider) {
        let bbox = BBox::new(0.0, 0.0, 600.0, 800.0);
        let mut source = ProviderPage::new(0, bbox);
        source.lines = lines;
        let provider = MemoryProvider::new("t.json", vec![source]);
        let mut doc = Document::new("t.json", vec![Page::new(0, bbox)], Arc::new(BlockRegistry::default()));
        for (t, b) in regions {
            let id = doc.add_block(0, *t, *b).unwrap();
            doc.pages[0].structure.push(id);
        }
        (doc, provider)
    }

    #[test]
    fn lines_go_to_smallest_containing_region() {
        let (mut doc, provider) = setup(
            vec![TextLine::new("inner", BBox::new(110.0, 110.0, 190.0, 120.0), 10.0)],
            &[
                (BlockType::Text, BBox::new(0.0, 0.0, 600.0, 800.0)),
                (BlockType::Caption, BBox::new(100.0, 100.0, 200.0, 130.0)),
            ],
        );
        LineBuilder::new(2.0).build(&mut doc, &provider).unwrap();
        let page = &doc.pages[0];
        let caption = page.structure[1];
        assert_eq!(page.raw_text(&caption), "inner");
        assert!(page.block(&page.structure[0]).unwrap().needs_ocr);
        assert_eq!(
            page.block(&caption).unwrap().metadata.get("font_size").map(String::as_str),
            Some("10.0")
        );
    }

    #[test]
    fn unclaimed_lines_become_text_regions() {
        let (mut doc, provider) = setup(
            vec![TextLine::new("stray", BBox::new(10.0, 500.0, 80.0, 510.0), 10.0)],
            &[(BlockType::Picture, BBox::new(0.0, 0.0, 100.0, 100.0))],
        );
        LineBuilder::new(2.0).build(&mut doc, &provider).unwrap();
        let page = &doc.pages[0];
        assert_eq!(page.structure.len(), 2);
        assert_eq!(page.structure[1].block_type, BlockType::Text);
        assert_eq!(page.raw_text(&page.structure[1]), "stray");
        assert!(!page.block(&page.structure[0]).unwrap().needs_ocr);
        page.validate().unwrap();
    }
}
