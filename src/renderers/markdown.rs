//! Block → markdown conversion and the unified markdown renderer.

use super::{document_metadata, Rendered, Renderer, RendererKind};
use crate::error::StageError;
use crate::pipeline::encode::{crop, encode_png};
use crate::schema::{Block, BlockId, BlockType, Document, Page};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;

/// Separator between pages when output is paginated. `{page}` is replaced
/// by the page id.
pub const PAGE_SEPARATOR: &str = "\n\n{page}------------------------------------------------\n\n";

static RE_ROW: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<tr\b.*?</tr>").unwrap());
static RE_CELL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<t[hd]\b[^>]*>(.*?)</t[hd]>").unwrap());
static RE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static RE_MATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^\s*<math\b[^>]*>(.*?)</math>\s*$").unwrap());
static RE_BULLET: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*[•●○◦▪·\-*–]\s*").unwrap());

/// File name of a block's image: its id with `/` replaced.
pub fn image_name(id: &BlockId) -> String {
    format!("{}.png", id.to_string().trim_start_matches('/').replace('/', "_"))
}

fn unescape_html(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn clean_cell(html: &str) -> String {
    let text = unescape_html(&RE_TAG.replace_all(html, " "));
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('|', "\\|")
}

/// GFM table with the first row as header.
pub(crate) fn grid_markdown(rows: &[Vec<String>]) -> String {
    let cols = rows.iter().map(Vec::len).max().unwrap_or(0).max(1);
    let line = |row: &[String]| {
        let cells: Vec<&str> = (0..cols)
            .map(|c| row.get(c).map(String::as_str).unwrap_or(""))
            .collect();
        format!("| {} |", cells.join(" | "))
    };
    let mut out = Vec::with_capacity(rows.len() + 1);
    for (i, row) in rows.iter().enumerate() {
        out.push(line(row));
        if i == 0 {
            out.push(format!("|{}", " --- |".repeat(cols)));
        }
    }
    out.join("\n")
}

/// Markdown for block html: tables become GFM tables, math becomes a
/// display equation, anything else is reduced to its text.
pub(crate) fn html_to_markdown(html: &str) -> String {
    if let Some(caps) = RE_MATH.captures(html) {
        return format!("$$\n{}\n$$", unescape_html(caps[1].trim()));
    }
    let rows: Vec<Vec<String>> = RE_ROW
        .find_iter(html)
        .map(|row| {
            RE_CELL
                .captures_iter(row.as_str())
                .map(|c| clean_cell(&c[1]))
                .collect::<Vec<_>>()
        })
        .filter(|row| !row.is_empty())
        .collect();
    if !rows.is_empty() {
        return grid_markdown(&rows);
    }
    unescape_html(&RE_TAG.replace_all(html, ""))
        .trim()
        .to_string()
}

/// Converts the blocks of one page, collecting image crops on the way.
pub(crate) struct BlockWriter<'a> {
    page: &'a Page,
    pub images: BTreeMap<String, String>,
}

impl<'a> BlockWriter<'a> {
    pub fn new(page: &'a Page) -> Self {
        Self {
            page,
            images: BTreeMap::new(),
        }
    }

    /// Markdown of every visible top-level block, separated by blank lines.
    pub fn page_markdown(&mut self) -> Result<String, StageError> {
        let mut parts = Vec::new();
        for id in self.page.visible_structure() {
            let md = self.block_markdown(&id)?;
            if !md.trim().is_empty() {
                parts.push(md);
            }
        }
        Ok(parts.join("\n\n"))
    }

    fn paragraph(&self, block: &Block) -> String {
        self.page
            .raw_text(&block.id)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn children(&mut self, block: &Block, separator: &str) -> Result<String, StageError> {
        let mut parts = Vec::new();
        for child in &block.structure {
            let md = self.block_markdown(child)?;
            if !md.trim().is_empty() {
                parts.push(md);
            }
        }
        Ok(parts.join(separator))
    }

    fn cell_grid(&self, block: &Block) -> Option<String> {
        let mut grid: BTreeMap<(usize, usize), String> = BTreeMap::new();
        for cell in block.structure.iter().filter_map(|id| self.page.get_block(id)) {
            if cell.block_type() != BlockType::TableCell {
                continue;
            }
            let pos = |key: &str| cell.metadata.get(key).and_then(|v| v.parse::<usize>().ok());
            grid.insert((pos("row")?, pos("col")?), cell.text.replace('|', "\\|"));
        }
        let rows = grid.keys().map(|(r, _)| r + 1).max()?;
        let mut out = vec![Vec::new(); rows];
        for ((r, c), text) in grid {
            let row = &mut out[r];
            row.resize(c + 1, String::new());
            row[c] = text;
        }
        Some(grid_markdown(&out))
    }

    fn image(&mut self, block: &Block) -> Result<String, StageError> {
        let description = block.metadata.get("description").cloned().unwrap_or_default();
        let Some(image) = self
            .page
            .image
            .as_ref()
            .and_then(|img| crop(img, &self.page.bbox, &block.bbox))
        else {
            return Ok(if description.is_empty() {
                String::new()
            } else {
                format!("*{description}*")
            });
        };
        let encoded = encode_png(&image)
            .map_err(|e| StageError::failed(format!("cannot encode {}: {e}", block.id)))?;
        let name = image_name(&block.id);
        self.images.insert(name.clone(), encoded.base64);
        Ok(format!("![{description}]({name})"))
    }

    pub fn block_markdown(&mut self, id: &BlockId) -> Result<String, StageError> {
        let page = self.page;
        let block = page.block(id)?;
        if block.ignore_for_output {
            return Ok(String::new());
        }
        if let Some(md) = block.metadata.get("markdown") {
            return Ok(md.trim().to_string());
        }

        let md = match block.block_type() {
            BlockType::SectionHeader => {
                let level = block.heading_level.unwrap_or(2).clamp(1, 6) as usize;
                format!("{} {}", "#".repeat(level), self.paragraph(block))
            }
            BlockType::ListGroup => self.children(block, "\n")?,
            BlockType::ListItem => {
                let indent = "  ".repeat(block.indent_level.unwrap_or(0) as usize);
                let text = self.paragraph(block);
                format!("{indent}- {}", RE_BULLET.replace(&text, ""))
            }
            BlockType::Code => format!("```\n{}\n```", page.raw_text(id).trim_end()),
            BlockType::Equation => match &block.html {
                Some(html) => html_to_markdown(html),
                None => format!("$$\n{}\n$$", self.paragraph(block)),
            },
            BlockType::Table | BlockType::Form => match &block.html {
                Some(html) => html_to_markdown(html),
                None => self
                    .cell_grid(block)
                    .unwrap_or_else(|| page.raw_text(id)),
            },
            BlockType::Picture | BlockType::Figure => self.image(block)?,
            BlockType::TableGroup | BlockType::FigureGroup | BlockType::PictureGroup => {
                self.children(block, "\n\n")?
            }
            BlockType::Reference => format!("<span id=\"{}\"></span>", block.text),
            BlockType::Page | BlockType::Document => String::new(),
            BlockType::Line | BlockType::Span | BlockType::TableCell => block.text.clone(),
            BlockType::Text
            | BlockType::TextInlineMath
            | BlockType::Caption
            | BlockType::Footnote
            | BlockType::Handwriting
            | BlockType::ComplexRegion
            | BlockType::TableOfContents
            | BlockType::PageHeader
            | BlockType::PageFooter => match &block.html {
                Some(html) => html_to_markdown(html),
                None => self.paragraph(block),
            },
        };

        if block.metadata.get("blockquote").is_some_and(|v| v == "true") {
            return Ok(md.lines().map(|l| format!("> {l}")).collect::<Vec<_>>().join("\n"));
        }
        Ok(md)
    }

    /// Whether the page's last visible block continues on the next page.
    pub fn ends_with_continuation(&self) -> bool {
        self.page
            .visible_structure()
            .last()
            .and_then(|id| self.page.get_block(id))
            .is_some_and(|b| b.metadata.get("has_continuation").is_some_and(|v| v == "true"))
    }
}

/// One markdown string for the whole document.
///
/// Hidden pages are left out. A paragraph or list that continues on the
/// next page is joined with a space instead of a blank line.
pub struct MarkdownRenderer {
    pub paginate: bool,
    pub page_separator: String,
}

impl Renderer for MarkdownRenderer {
    fn kind(&self) -> RendererKind {
        RendererKind::Markdown
    }

    fn render(&self, document: &Document) -> Result<Rendered, StageError> {
        let mut out = String::new();
        let mut images = BTreeMap::new();
        let mut joins_next = false;
        for page in document.pages.iter().filter(|p| !p.ignore_for_output) {
            let mut writer = BlockWriter::new(page);
            let md = writer.page_markdown()?;
            if self.paginate {
                out.push_str(&self.page_separator.replace("{page}", &page.page_id.to_string()));
            } else if !out.is_empty() {
                out.push_str(if joins_next { " " } else { "\n\n" });
            }
            out.push_str(&md);
            joins_next = writer.ends_with_continuation();
            images.append(&mut writer.images);
        }
        Ok(Rendered {
            payload: Value::String(out),
            images,
            metadata: document_metadata(document),
        })
    }
}
