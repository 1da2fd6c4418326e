//! Block classes: per-type behaviour, resolved per run.
//!
//! A [`BlockRegistry`] is built from the run's configuration and travels
//! with the [`super::Document`]. Two conversions with different overrides
//! each see their own registry; nothing here is process-global.

use super::block::{Block, BlockType};
use crate::error::ConvertError;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Behaviour attached to a block type.
pub trait BlockClass: Send + Sync {
    /// Short name used in configuration and logs.
    fn name(&self) -> &'static str;

    /// Whether freshly created blocks of this type are hidden from output.
    fn hidden_by_default(&self) -> bool {
        false
    }

    /// Wrap the block's already-assembled inner html.
    fn assemble_html(&self, block: &Block, inner: &str) -> String;
}

/// The standard html shape for every block type.
pub struct StandardBlock;

impl BlockClass for StandardBlock {
    fn name(&self) -> &'static str {
        "Standard"
    }

    fn hidden_by_default(&self) -> bool {
        false
    }

    fn assemble_html(&self, block: &Block, inner: &str) -> String {
        if let Some(html) = &block.html {
            return html.clone();
        }
        let one_line = inner.replace('\n', " ");
        match block.block_type() {
            BlockType::SectionHeader => {
                let level = block.heading_level.unwrap_or(2).clamp(1, 6);
                format!("<h{level}>{one_line}</h{level}>")
            }
            BlockType::ListItem => format!("<li>{one_line}</li>"),
            BlockType::ListGroup => format!("<ul>{inner}</ul>"),
            BlockType::Code => format!("<pre><code>{inner}</code></pre>"),
            BlockType::Equation => format!("<math display=\"block\">{one_line}</math>"),
            BlockType::TextInlineMath => format!("<p class=\"math\">{one_line}</p>"),
            BlockType::Caption => format!("<figcaption>{one_line}</figcaption>"),
            BlockType::Footnote => format!("<p class=\"footnote\">{one_line}</p>"),
            BlockType::TableCell => format!("<td>{one_line}</td>"),
            BlockType::Table | BlockType::Form => format!("<table>{inner}</table>"),
            BlockType::Picture | BlockType::Figure => {
                let alt = block.metadata.get("description").cloned().unwrap_or_default();
                format!("<img alt=\"{alt}\">")
            }
            BlockType::Reference => format!("<span id=\"{}\"></span>", block.text),
            BlockType::TableGroup
            | BlockType::FigureGroup
            | BlockType::PictureGroup
            | BlockType::Page
            | BlockType::Document => inner.to_string(),
            BlockType::Line | BlockType::Span => inner.to_string(),
            BlockType::PageHeader | BlockType::PageFooter => format!("<p>{one_line}</p>"),
            BlockType::Text
            | BlockType::Handwriting
            | BlockType::ComplexRegion
            | BlockType::TableOfContents => format!("<p>{one_line}</p>"),
        }
    }
}

/// Page furniture: hidden unless an override makes it visible.
pub struct PageFurniture;

impl BlockClass for PageFurniture {
    fn name(&self) -> &'static str {
        "PageFurniture"
    }

    fn hidden_by_default(&self) -> bool {
        true
    }

    fn assemble_html(&self, block: &Block, inner: &str) -> String {
        StandardBlock.assemble_html(block, inner)
    }
}

/// Renders any block as a plain paragraph and never hides it.
pub struct PlainText;

impl BlockClass for PlainText {
    fn name(&self) -> &'static str {
        "PlainText"
    }

    fn assemble_html(&self, block: &Block, inner: &str) -> String {
        match &block.html {
            Some(html) => html.clone(),
            None => format!("<p>{}</p>", inner.replace('\n', " ")),
        }
    }
}

/// Resolve a block class by its configuration name.
pub fn class_by_name(name: &str) -> Option<Arc<dyn BlockClass>> {
    match name.trim().to_ascii_lowercase().as_str() {
        "standard" | "visible" => Some(Arc::new(StandardBlock)),
        "pagefurniture" | "hidden" => Some(Arc::new(PageFurniture)),
        "plaintext" | "plain" => Some(Arc::new(PlainText)),
        _ => None,
    }
}

/// Block type → class mapping for one conversion run.
#[derive(Clone)]
pub struct BlockRegistry {
    overrides: HashMap<BlockType, Arc<dyn BlockClass>>,
    standard: Arc<dyn BlockClass>,
    furniture: Arc<dyn BlockClass>,
}

impl Default for BlockRegistry {
    fn default() -> Self {
        Self {
            overrides: HashMap::new(),
            standard: Arc::new(StandardBlock),
            furniture: Arc::new(PageFurniture),
        }
    }
}

impl fmt::Debug for BlockRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let overrides: BTreeMap<String, &str> = self
            .overrides
            .iter()
            .map(|(t, c)| (t.to_string(), c.name()))
            .collect();
        f.debug_struct("BlockRegistry")
            .field("overrides", &overrides)
            .finish()
    }
}

impl BlockRegistry {
    pub fn with_override(mut self, block_type: BlockType, class: Arc<dyn BlockClass>) -> Self {
        self.overrides.insert(block_type, class);
        self
    }

    /// Build from `{"PageHeader": "visible", ...}` style configuration.
    pub fn from_named(overrides: &BTreeMap<String, String>) -> Result<Self, ConvertError> {
        let mut registry = Self::default();
        for (type_name, class_name) in overrides {
            let block_type: BlockType = type_name.parse().map_err(ConvertError::Configuration)?;
            let class = class_by_name(class_name).ok_or_else(|| {
                ConvertError::config(format!(
                    "unknown block class '{class_name}' for block type {block_type}"
                ))
            })?;
            registry.overrides.insert(block_type, class);
        }
        Ok(registry)
    }

    pub fn class_for(&self, block_type: BlockType) -> &dyn BlockClass {
        if let Some(class) = self.overrides.get(&block_type) {
            return class.as_ref();
        }
        match block_type {
            BlockType::PageHeader | BlockType::PageFooter => self.furniture.as_ref(),
            _ => self.standard.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{BBox, BlockId};

    fn block(block_type: BlockType) -> Block {
        Block::new(
            BlockId {
                page_id: 0,
                block_type,
                index: 0,
            },
            BBox::default(),
        )
    }

    #[test]
    fn headers_hidden_by_default() {
        let reg = BlockRegistry::default();
        assert!(reg.class_for(BlockType::PageHeader).hidden_by_default());
        assert!(!reg.class_for(BlockType::Text).hidden_by_default());
    }

    #[test]
    fn named_override_replaces_class() {
        let mut map = BTreeMap::new();
        map.insert("PageHeader".to_string(), "visible".to_string());
        let reg = BlockRegistry::from_named(&map).unwrap();
        assert!(!reg.class_for(BlockType::PageHeader).hidden_by_default());
        // Other registries are unaffected.
        assert!(BlockRegistry::default()
            .class_for(BlockType::PageHeader)
            .hidden_by_default());
    }

    #[test]
    fn unknown_override_is_configuration_error() {
        let mut map = BTreeMap::new();
        map.insert("Text".to_string(), "fancy".to_string());
        assert!(matches!(
            BlockRegistry::from_named(&map),
            Err(ConvertError::Configuration(_))
        ));
    }

    #[test]
    fn heading_html_uses_level() {
        let mut b = block(BlockType::SectionHeader);
        b.heading_level = Some(3);
        assert_eq!(StandardBlock.assemble_html(&b, "Intro"), "<h3>Intro</h3>");
        b.heading_level = None;
        assert_eq!(StandardBlock.assemble_html(&b, "Intro"), "<h2>Intro</h2>");
    }
}
