//! Layout detection: page primitives → typed regions.

use super::DocumentBuilder;
use crate::error::StageError;
use crate::providers::{DocumentProvider, ProviderPage, TextLine};
use crate::schema::{BBox, BlockType, Document};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

/// A labelled region proposed by a layout model.
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutRegion {
    pub block_type: BlockType,
    pub bbox: BBox,
    /// Confidence in `block_type`, 0..=1.
    pub confidence: f32,
}

/// Anything that can label the regions of a page.
pub trait LayoutModel: Send + Sync {
    fn name(&self) -> &str;

    fn detect(&self, page: &ProviderPage) -> Result<Vec<LayoutRegion>, StageError>;
}

static BULLET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:[•●▪◦‣∙·\-\*–]|\(?\d{1,3}[.)]|\(?[a-zA-Z][.)]|\([ivx]{1,4}\))\s+\S")
        .unwrap()
});

static TOC_LEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:\.\s?){3,}\s*\d{1,4}\s*$|…+\s*\d{1,4}\s*$").unwrap());

static CAPTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:figure|fig\.|table|chart|plate)\s*\d+").unwrap());

static CODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:fn |pub fn |def |class |import |from \S+ import |#include|let |const |var |function |return\b|if \(|for \(|while \()|[;{}]\s*$",
    )
    .unwrap()
});

static PAGE_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:page\s+)?\d{1,4}(?:\s*(?:/|of)\s*\d{1,4})?$").unwrap());

const MATH_CHARS: &str = "=+−×÷∑∫√≤≥≈≠∞^_{}\\∂∇πσμλαβγδθ";

/// Rule-based layout model over text lines and font sizes.
///
/// Good enough for born-digital documents with a conventional layout; a
/// learned model can replace it through the [`crate::pipeline::ArtifactBag`].
#[derive(Debug, Clone)]
pub struct HeuristicLayoutModel {
    /// Lines at least this many times the body font size are headings.
    pub heading_ratio: f32,
    /// Top and bottom page bands, as a fraction of page height, that hold
    /// running headers and footers.
    pub furniture_band: f32,
    /// Largest vertical gap, in line heights, between lines of one region.
    pub max_line_gap: f32,
    pub max_heading_chars: usize,
}

impl Default for HeuristicLayoutModel {
    fn default() -> Self {
        Self {
            heading_ratio: 1.15,
            furniture_band: 0.07,
            max_line_gap: 1.0,
            max_heading_chars: 120,
        }
    }
}

/// A region being grown line by line.
struct Open {
    block_type: BlockType,
    bbox: BBox,
    last: BBox,
    font_size: f32,
    lines: usize,
    confidence: f32,
}

impl HeuristicLayoutModel {
    fn classify(&self, line: &TextLine, body: f32, page: &BBox) -> (BlockType, f32) {
        let text = line.text.trim();
        let chars = text.chars().count();
        let band = self.furniture_band * page.height();

        if line.bbox.y1() <= page.y0() + band && chars <= 100 {
            return (BlockType::PageHeader, 0.8);
        }
        if line.bbox.y0() >= page.y1() - band && (PAGE_NUMBER.is_match(text) || chars <= 100) {
            return (BlockType::PageFooter, 0.8);
        }
        if TOC_LEADER.is_match(text) {
            return (BlockType::TableOfContents, 0.85);
        }
        if CAPTION.is_match(text) {
            return (BlockType::Caption, 0.85);
        }
        let big = body > 0.0 && line.font_size >= body * self.heading_ratio;
        let short = chars <= self.max_heading_chars && !text.ends_with('.');
        if big && short {
            return (BlockType::SectionHeader, 0.8);
        }
        if BULLET.is_match(text) {
            return (BlockType::ListItem, 0.85);
        }
        if text.contains('\t') {
            return (BlockType::Table, 0.7);
        }
        if CODE.is_match(text) {
            return (BlockType::Code, 0.7);
        }
        if is_equation(text) {
            return (BlockType::Equation, 0.6);
        }
        if line.bold && short && chars > 0 {
            return (BlockType::SectionHeader, 0.65);
        }
        (BlockType::Text, 0.9)
    }

    fn continues(&self, open: &Open, block_type: BlockType, line: &TextLine) -> bool {
        let height = line.bbox.height().max(open.last.height()).max(1.0);
        let gap = line.bbox.y0() - open.last.y1();
        if gap > self.max_line_gap * height {
            return false;
        }
        let same_column = line.bbox.x0() < open.bbox.x1() && line.bbox.x1() > open.bbox.x0();
        if !same_column {
            return false;
        }
        match (open.block_type, block_type) {
            // Wrapped list item text is indented past the bullet.
            (BlockType::ListItem, BlockType::Text) => line.bbox.x0() > open.bbox.x0() + 2.0,
            (BlockType::SectionHeader, BlockType::SectionHeader) => {
                (open.font_size - line.font_size).abs() < 0.5
            }
            (a, b) if a == b => matches!(
                a,
                BlockType::Text
                    | BlockType::Code
                    | BlockType::Table
                    | BlockType::TableOfContents
                    | BlockType::Equation
                    | BlockType::PageHeader
                    | BlockType::PageFooter
            ),
            _ => false,
        }
    }
}

impl LayoutModel for HeuristicLayoutModel {
    fn name(&self) -> &str {
        "heuristic"
    }

    fn detect(&self, page: &ProviderPage) -> Result<Vec<LayoutRegion>, StageError> {
        let body = body_font_size(&page.lines);
        let mut regions: Vec<LayoutRegion> = page
            .figures
            .iter()
            .map(|bbox| LayoutRegion {
                block_type: BlockType::Picture,
                bbox: *bbox,
                confidence: 0.9,
            })
            .collect();

        let mut lines: Vec<&TextLine> = page
            .lines
            .iter()
            .filter(|l| !l.text.trim().is_empty())
            .filter(|l| {
                let (cx, cy) = l.bbox.center();
                !page.figures.iter().any(|f| f.contains_point(cx, cy))
            })
            .collect();
        lines.sort_by(|a, b| {
            a.bbox
                .y0()
                .total_cmp(&b.bbox.y0())
                .then(a.bbox.x0().total_cmp(&b.bbox.x0()))
        });

        let mut open: Option<Open> = None;
        let mut closed = Vec::new();
        for line in lines {
            let (block_type, confidence) = self.classify(line, body, &page.bbox);
            match open.as_mut() {
                Some(current) if self.continues(current, block_type, line) => {
                    current.bbox = current.bbox.union(&line.bbox);
                    current.last = line.bbox;
                    current.lines += 1;
                    current.confidence = current.confidence.min(confidence);
                }
                _ => {
                    closed.extend(open.take());
                    open = Some(Open {
                        block_type,
                        bbox: line.bbox,
                        last: line.bbox,
                        font_size: line.font_size,
                        lines: 1,
                        confidence,
                    });
                }
            }
        }
        closed.extend(open);

        regions.extend(closed.into_iter().map(|o| {
            // A single tab-separated row is a line with wide spacing, not a table.
            let block_type = if o.block_type == BlockType::Table && o.lines < 2 {
                BlockType::Text
            } else {
                o.block_type
            };
            LayoutRegion {
                block_type,
                bbox: o.bbox,
                confidence: o.confidence,
            }
        }));

        debug!("Page {}: {} layout regions", page.page_id, regions.len());
        Ok(regions)
    }
}

/// Median font size of the page's lines, 0 when none carry one.
fn body_font_size(lines: &[TextLine]) -> f32 {
    let mut sizes: Vec<f32> = lines
        .iter()
        .map(|l| l.font_size)
        .filter(|s| *s > 0.0)
        .collect();
    if sizes.is_empty() {
        return 0.0;
    }
    sizes.sort_by(f32::total_cmp);
    sizes[sizes.len() / 2]
}

fn is_equation(text: &str) -> bool {
    let visible: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    if visible.len() < 3 {
        return false;
    }
    let math = visible.iter().filter(|c| MATH_CHARS.contains(**c)).count();
    math * 4 >= visible.len()
}

/// Runs a [`LayoutModel`] over every page and adds its regions as
/// top-level blocks.
pub struct LayoutBuilder {
    model: Arc<dyn LayoutModel>,
}

impl LayoutBuilder {
    pub fn new(model: Arc<dyn LayoutModel>) -> Self {
        Self { model }
    }
}

impl DocumentBuilder for LayoutBuilder {
    fn name(&self) -> &'static str {
        "layout"
    }

    fn build(
        &self,
        document: &mut Document,
        provider: &dyn DocumentProvider,
    ) -> Result<(), StageError> {
        for (index, source) in provider.pages().iter().enumerate() {
            let expected = document.pages.get(index).map(|p| p.page_id);
            if expected != Some(source.page_id) {
                return Err(StageError::failed(format!(
                    "provider page {} does not match document page {:?}",
                    source.page_id, expected
                )));
            }
            for region in self.model.detect(source)? {
                let id = document.add_block(index, region.block_type, region.bbox)?;
                let page = &mut document.pages[index];
                let block = page.block_mut(&id)?;
                block.top_k.insert(region.block_type, region.confidence);
                if region.block_type != BlockType::Text {
                    block
                        .top_k
                        .insert(BlockType::Text, (1.0 - region.confidence).max(0.0));
                }
                page.structure.push(id);
            }
        }
        debug!("{} layout: {} pages labelled", self.model.name(), provider.page_count());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str, y: f32, size: f32) -> TextLine {
        TextLine::new(text, BBox::new(72.0, y, 540.0, y + size), size)
    }

    fn page(lines: Vec<TextLine>) -> ProviderPage {
        let mut p = ProviderPage::new(0, BBox::new(0.0, 0.0, 612.0, 792.0));
        p.lines = lines;
        p
    }

    fn types(regions: &[LayoutRegion]) -> Vec<BlockType> {
        regions.iter().map(|r| r.block_type).collect()
    }

    #[test]
    fn headings_lists_and_paragraphs() {
        let regions = HeuristicLayoutModel::default()
            .detect(&page(vec![
                line("Introduction", 100.0, 18.0),
                line("This is the first line of body text", 130.0, 10.0),
                line("and this continues the paragraph", 141.0, 10.0),
                line("• first point", 170.0, 10.0),
                line("• second point", 182.0, 10.0),
            ]))
            .unwrap();
        assert_eq!(
            types(&regions),
            vec![
                BlockType::SectionHeader,
                BlockType::Text,
                BlockType::ListItem,
                BlockType::ListItem
            ]
        );
        assert_eq!(regions[1].bbox.y1(), 151.0);
    }

    #[test]
    fn page_bands_and_toc_leaders() {
        let regions = HeuristicLayoutModel::default()
            .detect(&page(vec![
                line("Annual Report 2024", 20.0, 9.0),
                line("Contents", 100.0, 18.0),
                line("Introduction ........ 3", 130.0, 10.0),
                line("Methods ........ 7", 142.0, 10.0),
                line("12", 770.0, 9.0),
            ]))
            .unwrap();
        assert_eq!(
            types(&regions),
            vec![
                BlockType::PageHeader,
                BlockType::SectionHeader,
                BlockType::TableOfContents,
                BlockType::PageFooter
            ]
        );
    }

    #[test]
    fn tab_rows_become_a_table_only_when_repeated() {
        let model = HeuristicLayoutModel::default();
        let single = model
            .detect(&page(vec![line("Name\tAge", 100.0, 10.0)]))
            .unwrap();
        assert_eq!(types(&single), vec![BlockType::Text]);

        let table = model
            .detect(&page(vec![
                line("Name\tAge", 100.0, 10.0),
                line("Ada\t36", 111.0, 10.0),
            ]))
            .unwrap();
        assert_eq!(types(&table), vec![BlockType::Table]);
    }

    #[test]
    fn captions_and_figures() {
        let mut p = page(vec![
            line("label inside", 210.0, 8.0),
            line("Figure 1: A chart", 320.0, 10.0),
        ]);
        p.figures.push(BBox::new(72.0, 200.0, 540.0, 310.0));
        let regions = HeuristicLayoutModel::default().detect(&p).unwrap();
        assert_eq!(types(&regions), vec![BlockType::Picture, BlockType::Caption]);
    }

    #[test]
    fn equation_detection() {
        assert!(is_equation("E = mc^2"));
        assert!(!is_equation("An ordinary sentence."));
    }

    #[test]
    fn body_font_is_median() {
        let lines = vec![line("a", 0.0, 10.0), line("b", 0.0, 24.0), line("c", 0.0, 10.0)];
        assert_eq!(body_font_size(&lines), 10.0);
        assert_eq!(body_font_size(&[]), 0.0);
    }
}
