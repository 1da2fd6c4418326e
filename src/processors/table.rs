//! Heuristic table structure from text-layer lines.

use super::Processor;
use crate::error::StageError;
use crate::schema::{BBox, BlockId, BlockType, Document, Page};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

static WIDE_GAP: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s{2,}").unwrap());

/// Splits each table line into cells and assembles table html.
///
/// Tabs separate cells when present; otherwise runs of two or more spaces
/// do. The first row becomes the header row.
pub struct TableProcessor;

fn split_cells(line: &str) -> Vec<String> {
    let cells: Vec<&str> = if line.contains('\t') {
        line.split('\t').collect()
    } else {
        WIDE_GAP.split(line.trim()).collect()
    };
    cells.into_iter().map(|c| c.trim().to_string()).collect()
}

pub(crate) fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// `<table>` html for a grid whose first row is the header.
pub(crate) fn table_html(rows: &[Vec<String>]) -> String {
    let mut html = String::from("<table>");
    for (r, row) in rows.iter().enumerate() {
        let tag = if r == 0 { "th" } else { "td" };
        html.push_str("<tr>");
        for cell in row {
            html.push_str(&format!("<{tag}>{}</{tag}>", escape_html(cell)));
        }
        html.push_str("</tr>");
    }
    html.push_str("</table>");
    html
}

fn rebuild_table(page: &mut Page, table: &BlockId) -> Result<(), StageError> {
    let lines: Vec<(BlockId, BBox, String)> = page
        .block(table)?
        .structure
        .iter()
        .filter(|id| id.block_type == BlockType::Line)
        .filter_map(|id| page.get_block(id).map(|b| (*id, b.bbox, b.text.clone())))
        .collect();
    if lines.is_empty() {
        return Ok(());
    }

    let rows: Vec<Vec<String>> = lines.iter().map(|(_, _, text)| split_cells(text)).collect();
    let mut cells = Vec::new();
    for ((_, bbox, _), (r, row)) in lines.iter().zip(rows.iter().enumerate()) {
        let width = bbox.width() / row.len().max(1) as f32;
        for (c, text) in row.iter().enumerate() {
            let x0 = bbox.x0() + c as f32 * width;
            let cell = page.add_block(BlockType::TableCell, BBox::new(x0, bbox.y0(), x0 + width, bbox.y1()));
            let block = page.block_mut(&cell)?;
            block.text = text.clone();
            block.metadata.insert("row".into(), r.to_string());
            block.metadata.insert("col".into(), c.to_string());
            cells.push(cell);
        }
    }
    for (line, _, _) in &lines {
        page.remove_block(line);
    }
    let block = page.block_mut(table)?;
    block.structure = cells;
    block.html = Some(table_html(&rows));
    Ok(())
}

#[async_trait]
impl Processor for TableProcessor {
    fn name(&self) -> &'static str {
        "table"
    }

    async fn process(&self, document: &mut Document) -> Result<(), StageError> {
        for page in document.pages.iter_mut() {
            for table in page.contained_blocks(&[BlockType::Table]) {
                rebuild_table(page, &table)?;
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

    #[test]
    fn cells_split_on_tabs_or_wide_gaps() {
        assert_eq!(split_cells("a\tb\t c"), vec!["a", "b", "c"]);
        assert_eq!(split_cells("Name   Age  City"), vec!["Name", "Age", "City"]);
        assert_eq!(split_cells("one cell"), vec!["one cell"]);
    }

    #[tokio::test]
    async fn lines_become_cells_and_html() {
        let mut d = Document::new(
            "t.pdf",
            vec![Page::new(0, BBox::new(0.0, 0.0, 600.0, 800.0))],
            Arc::new(BlockRegistry::default()),
        );
        let table = d.add_block(0, BlockType::Table, BBox::new(0.0, 0.0, 300.0, 20.0)).unwrap();
        let page = &mut d.pages[0];
        page.structure.push(table);
        for (i, t) in ["Item\tPrice", "Tea & cake\t<3"].iter().enumerate() {
            let y = i as f32 * 10.0;
            let line = page.add_block(BlockType::Line, BBox::new(0.0, y, 300.0, y + 10.0));
            page.block_mut(&line).unwrap().text = t.to_string();
            page.block_mut(&table).unwrap().structure.push(line);
        }

        TableProcessor.process(&mut d).await.unwrap();

        let block = d.get_block(&table).unwrap();
        assert_eq!(block.structure.len(), 4);
        assert!(block.structure.iter().all(|c| c.block_type == BlockType::TableCell));
        assert_eq!(
            block.html.as_deref(),
            Some("<table><tr><th>Item</th><th>Price</th></tr><tr><td>Tea &amp; cake</td><td>&lt;3</td></tr></table>")
        );
        assert_eq!(d.pages[0].contained_blocks(&[BlockType::Line]).len(), 0);
        d.validate_structure().unwrap();
    }
}
