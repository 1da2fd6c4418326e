//! Blocks: typed regions of a page and their identities.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Every kind of region the pipeline knows about.
///
/// The set is closed: builders and processors relabel blocks among these
/// variants, renderers and block classes dispatch on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BlockType {
    Line,
    Span,
    Text,
    TextInlineMath,
    SectionHeader,
    ListItem,
    ListGroup,
    Table,
    TableGroup,
    TableCell,
    Figure,
    FigureGroup,
    Picture,
    PictureGroup,
    Caption,
    Code,
    Equation,
    Footnote,
    Form,
    Handwriting,
    PageHeader,
    PageFooter,
    TableOfContents,
    ComplexRegion,
    Reference,
    Page,
    Document,
}

impl BlockType {
    pub const ALL: [BlockType; 27] = [
        BlockType::Line,
        BlockType::Span,
        BlockType::Text,
        BlockType::TextInlineMath,
        BlockType::SectionHeader,
        BlockType::ListItem,
        BlockType::ListGroup,
        BlockType::Table,
        BlockType::TableGroup,
        BlockType::TableCell,
        BlockType::Figure,
        BlockType::FigureGroup,
        BlockType::Picture,
        BlockType::PictureGroup,
        BlockType::Caption,
        BlockType::Code,
        BlockType::Equation,
        BlockType::Footnote,
        BlockType::Form,
        BlockType::Handwriting,
        BlockType::PageHeader,
        BlockType::PageFooter,
        BlockType::TableOfContents,
        BlockType::ComplexRegion,
        BlockType::Reference,
        BlockType::Page,
        BlockType::Document,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BlockType::Line => "Line",
            BlockType::Span => "Span",
            BlockType::Text => "Text",
            BlockType::TextInlineMath => "TextInlineMath",
            BlockType::SectionHeader => "SectionHeader",
            BlockType::ListItem => "ListItem",
            BlockType::ListGroup => "ListGroup",
            BlockType::Table => "Table",
            BlockType::TableGroup => "TableGroup",
            BlockType::TableCell => "TableCell",
            BlockType::Figure => "Figure",
            BlockType::FigureGroup => "FigureGroup",
            BlockType::Picture => "Picture",
            BlockType::PictureGroup => "PictureGroup",
            BlockType::Caption => "Caption",
            BlockType::Code => "Code",
            BlockType::Equation => "Equation",
            BlockType::Footnote => "Footnote",
            BlockType::Form => "Form",
            BlockType::Handwriting => "Handwriting",
            BlockType::PageHeader => "PageHeader",
            BlockType::PageFooter => "PageFooter",
            BlockType::TableOfContents => "TableOfContents",
            BlockType::ComplexRegion => "ComplexRegion",
            BlockType::Reference => "Reference",
            BlockType::Page => "Page",
            BlockType::Document => "Document",
        }
    }

    /// Blocks whose content is an image rather than text.
    pub fn is_image(self) -> bool {
        matches!(self, BlockType::Picture | BlockType::Figure)
    }

    /// Containers that only exist to group other top-level blocks.
    pub fn is_group(self) -> bool {
        matches!(
            self,
            BlockType::ListGroup
                | BlockType::TableGroup
                | BlockType::FigureGroup
                | BlockType::PictureGroup
        )
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BlockType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        BlockType::ALL
            .iter()
            .copied()
            .find(|t| t.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| format!("unknown block type '{wanted}'"))
    }
}

/// Identity of a block: unique within its page.
///
/// Displayed as `/page/{page_id}/{BlockType}/{index}`. Relabeling a block
/// changes its identity, so [`crate::schema::Page::relabel`] rewrites every
/// structure reference that pointed at the old id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId {
    pub page_id: usize,
    pub block_type: BlockType,
    pub index: usize,
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/page/{}/{}/{}", self.page_id, self.block_type, self.index)
    }
}

impl FromStr for BlockId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim_matches('/').split('/').collect();
        match parts.as_slice() {
            ["page", page, kind, index] => Ok(BlockId {
                page_id: page.parse().map_err(|_| format!("bad page in '{s}'"))?,
                block_type: kind.parse()?,
                index: index.parse().map_err(|_| format!("bad index in '{s}'"))?,
            }),
            _ => Err(format!("malformed block id '{s}'")),
        }
    }
}

/// Axis-aligned box in page coordinates: `[x0, y0, x1, y1]`, y grows downwards.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BBox(pub [f32; 4]);

impl BBox {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        BBox([x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1)])
    }

    pub fn x0(&self) -> f32 {
        self.0[0]
    }
    pub fn y0(&self) -> f32 {
        self.0[1]
    }
    pub fn x1(&self) -> f32 {
        self.0[2]
    }
    pub fn y1(&self) -> f32 {
        self.0[3]
    }

    pub fn width(&self) -> f32 {
        (self.x1() - self.x0()).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y1() - self.y0()).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x0() + self.x1()) / 2.0, (self.y0() + self.y1()) / 2.0)
    }

    pub fn contains_point(&self, x: f32, y: f32) -> bool {
        x >= self.x0() && x <= self.x1() && y >= self.y0() && y <= self.y1()
    }

    pub fn intersection_area(&self, other: &BBox) -> f32 {
        let w = self.x1().min(other.x1()) - self.x0().max(other.x0());
        let h = self.y1().min(other.y1()) - self.y0().max(other.y0());
        if w <= 0.0 || h <= 0.0 {
            0.0
        } else {
            w * h
        }
    }

    pub fn overlaps(&self, other: &BBox) -> bool {
        self.intersection_area(other) > 0.0
    }

    /// Intersection over union; 0 when both boxes are empty.
    pub fn iou(&self, other: &BBox) -> f32 {
        let inter = self.intersection_area(other);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    pub fn union(&self, other: &BBox) -> BBox {
        BBox([
            self.x0().min(other.x0()),
            self.y0().min(other.y0()),
            self.x1().max(other.x1()),
            self.y1().max(other.y1()),
        ])
    }
}

/// How a block's text was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TextExtraction {
    /// Not extracted yet.
    #[default]
    None,
    /// Embedded text layer of the source file.
    PdfText,
    /// Recognised from the rendered page image.
    Ocr,
    /// Rewritten by an LLM-assisted processor.
    Llm,
}

/// A typed region of a page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Block {
    pub id: BlockId,
    pub bbox: BBox,
    /// Own text. Container blocks usually leave this empty and carry
    /// their text in `Line` children.
    pub text: String,
    /// Pre-assembled html, set by processors that rewrite a block wholesale
    /// (tables, forms, LLM corrections). Takes precedence over `text`.
    pub html: Option<String>,
    /// Ordered child identities.
    pub structure: Vec<BlockId>,
    /// Layout confidences per candidate label.
    pub top_k: BTreeMap<BlockType, f32>,
    pub heading_level: Option<u8>,
    /// Heading level came from the document outline rather than heuristics.
    pub doc_toc_level: bool,
    pub indent_level: Option<u8>,
    /// Dominant line height, used for heading and header heuristics.
    pub line_height: Option<f32>,
    pub ignore_for_output: bool,
    pub needs_ocr: bool,
    pub extraction: TextExtraction,
    pub metadata: BTreeMap<String, String>,
}

impl Block {
    pub fn new(id: BlockId, bbox: BBox) -> Self {
        Self {
            id,
            bbox,
            text: String::new(),
            html: None,
            structure: Vec::new(),
            top_k: BTreeMap::new(),
            heading_level: None,
            doc_toc_level: false,
            indent_level: None,
            line_height: None,
            ignore_for_output: false,
            needs_ocr: false,
            extraction: TextExtraction::None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn block_type(&self) -> BlockType {
        self.id.block_type
    }

    /// Confidence of the current label, 1.0 when the layout gave none.
    pub fn confidence(&self) -> f32 {
        self.top_k.get(&self.block_type()).copied().unwrap_or(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_id_display_and_parse() {
        let id = BlockId {
            page_id: 3,
            block_type: BlockType::SectionHeader,
            index: 7,
        };
        assert_eq!(id.to_string(), "/page/3/SectionHeader/7");
        assert_eq!("/page/3/SectionHeader/7".parse::<BlockId>().unwrap(), id);
        assert!("/page/x/Text/1".parse::<BlockId>().is_err());
        assert!("/page/1/Nope/1".parse::<BlockId>().is_err());
    }

    #[test]
    fn block_type_parse_is_case_insensitive() {
        assert_eq!("tableofcontents".parse::<BlockType>().unwrap(), BlockType::TableOfContents);
        assert_eq!("Text".parse::<BlockType>().unwrap(), BlockType::Text);
        assert!("Paragraph".parse::<BlockType>().is_err());
    }

    #[test]
    fn bbox_geometry() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(5.0, 5.0, 15.0, 15.0);
        assert_eq!(a.intersection_area(&b), 25.0);
        assert!((a.iou(&b) - 25.0 / 175.0).abs() < 1e-6);
        assert_eq!(a.union(&b), BBox::new(0.0, 0.0, 15.0, 15.0));
        assert!(!a.overlaps(&BBox::new(10.0, 10.0, 20.0, 20.0)));
        assert!(a.contains_point(5.0, 5.0));
    }

    #[test]
    fn new_normalises_corner_order() {
        let b = BBox::new(10.0, 20.0, 0.0, 5.0);
        assert_eq!(b.0, [0.0, 5.0, 10.0, 20.0]);
    }
}
