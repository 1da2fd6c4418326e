//! PDF provider backed by pdfium.
//!
//! pdfium wraps a C++ library with thread-local state, so everything is
//! extracted up front in [`PdfiumProvider::open`], which the converter calls
//! from `spawn_blocking`. After that the provider is plain owned data.

use super::{select_pages, DocumentProvider, OutlineEntry, ProviderPage, TextLine};
use crate::config::PipelineConfig;
use crate::error::ConvertError;
use crate::schema::BBox;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Bookmarks nested deeper than this are ignored.
const MAX_OUTLINE_DEPTH: u8 = 8;

/// Eagerly extracted PDF pages.
#[derive(Debug)]
pub struct PdfiumProvider {
    filepath: PathBuf,
    pages: Vec<ProviderPage>,
    outline: Vec<OutlineEntry>,
}

/// A positioned run of text before line merging.
#[derive(Debug, Clone)]
pub(crate) struct Segment {
    pub text: String,
    pub bbox: BBox,
    pub font_size: f32,
    pub bold: bool,
}

impl PdfiumProvider {
    /// Load the PDF and extract the configured pages. Blocking.
    pub fn open(path: &Path, config: &PipelineConfig) -> Result<Self, ConvertError> {
        let pdfium = Pdfium::default();
        let password = config.password.as_deref();
        let document = pdfium
            .load_pdf_from_file(path, password)
            .map_err(|e| ConvertError::Build {
                stage: "provider".into(),
                detail: format!("cannot open '{}': {:?}", path.display(), e),
            })?;

        let total = document.pages().len() as usize;
        info!("PDF loaded: {} pages", total);

        let wanted: Vec<usize> = match &config.page_range {
            Some(range) => range.clone(),
            None => (0..total).collect(),
        };

        let mut pages = Vec::with_capacity(wanted.len());
        for idx in wanted.iter().copied().filter(|i| *i < total) {
            let page = document.pages().get(idx as u16).map_err(|e| ConvertError::Build {
                stage: "provider".into(),
                detail: format!("page {idx}: {e:?}"),
            })?;
            pages.push(extract_page(idx, &page, config.dpi)?);
        }
        let pages = select_pages(pages, config.page_range.as_deref());

        let mut outline = Vec::new();
        if let Some(root) = document.bookmarks().root() {
            collect_outline(root, 0, &mut outline);
        }
        debug!("Outline: {} entries", outline.len());

        Ok(Self {
            filepath: path.to_path_buf(),
            pages,
            outline,
        })
    }
}

impl DocumentProvider for PdfiumProvider {
    fn filepath(&self) -> &Path {
        &self.filepath
    }

    fn pages(&self) -> &[ProviderPage] {
        &self.pages
    }

    fn outline(&self) -> &[OutlineEntry] {
        &self.outline
    }
}

fn extract_page(idx: usize, page: &PdfPage, dpi: u32) -> Result<ProviderPage, ConvertError> {
    let width = page.width().value;
    let height = page.height().value;
    let mut out = ProviderPage::new(idx, BBox::new(0.0, 0.0, width, height));

    match page.text() {
        Ok(text) => {
            let mut segments = Vec::new();
            for segment in text.segments().iter() {
                let content = segment.text();
                let content = content.trim();
                if content.is_empty() {
                    continue;
                }
                let bounds = segment.bounds();
                // PDF origin is bottom-left; the document model is top-left.
                let bbox = BBox::new(
                    bounds.left().value,
                    height - bounds.top().value,
                    bounds.right().value,
                    height - bounds.bottom().value,
                );
                let (font_size, bold) = segment
                    .chars()
                    .ok()
                    .and_then(|chars| {
                        chars
                            .iter()
                            .next()
                            .map(|c| (c.scaled_font_size().value, c.font_name().contains("Bold")))
                    })
                    .unwrap_or((bbox.height(), false));
                segments.push(Segment {
                    text: content.to_string(),
                    bbox,
                    font_size,
                    bold,
                });
            }
            out.lines = merge_segments(segments);
        }
        Err(e) => warn!("Page {}: no text layer ({:?})", idx, e),
    }

    let target_w = ((width * dpi as f32) / 72.0).round().max(1.0) as i32;
    let target_h = ((height * dpi as f32) / 72.0).round().max(1.0) as i32;
    let render_config = PdfRenderConfig::new()
        .set_target_width(target_w)
        .set_maximum_height(target_h);
    match page.render_with_config(&render_config) {
        Ok(bitmap) => {
            let image = bitmap.as_image();
            debug!("Rendered page {} → {}x{} px", idx, image.width(), image.height());
            out.image = Some(Arc::new(image));
        }
        Err(e) => warn!("Page {}: rasterisation failed ({:?})", idx, e),
    }

    debug!("Page {}: {} lines", idx, out.lines.len());
    Ok(out)
}

/// Join segments that sit on the same baseline into reading-order lines.
pub(crate) fn merge_segments(mut segments: Vec<Segment>) -> Vec<TextLine> {
    segments.sort_by(|a, b| {
        a.bbox
            .y0()
            .partial_cmp(&b.bbox.y0())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                a.bbox
                    .x0()
                    .partial_cmp(&b.bbox.x0())
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
    });

    let mut rows: Vec<Vec<Segment>> = Vec::new();
    for seg in segments {
        let (_, cy) = seg.bbox.center();
        let joined = rows.iter_mut().rev().take(3).find(|row| {
            row.first().is_some_and(|first| {
                let (_, ry) = first.bbox.center();
                let tolerance = 0.5 * first.bbox.height().min(seg.bbox.height()).max(1.0);
                (ry - cy).abs() <= tolerance
            })
        });
        match joined {
            Some(row) => row.push(seg),
            None => rows.push(vec![seg]),
        }
    }

    rows.into_iter()
        .filter_map(|mut row| {
            row.sort_by(|a, b| {
                a.bbox
                    .x0()
                    .partial_cmp(&b.bbox.x0())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let first = row.first()?.clone();
            let mut text = first.text.clone();
            let mut bbox = first.bbox;
            let mut font_size = first.font_size;
            for seg in row.iter().skip(1) {
                // Wide gaps separate table cells.
                let gap = seg.bbox.x0() - bbox.x1();
                let h = seg.bbox.height();
                if gap > 1.5 * h {
                    text.push('\t');
                } else if gap > 0.15 * h {
                    text.push(' ');
                }
                text.push_str(&seg.text);
                bbox = bbox.union(&seg.bbox);
                font_size = font_size.max(seg.font_size);
            }
            Some(TextLine {
                text,
                bbox,
                font_size,
                bold: row.iter().all(|s| s.bold),
            })
        })
        .collect()
}

fn collect_outline(first: PdfBookmark<'_>, level: u8, out: &mut Vec<OutlineEntry>) {
    if level > MAX_OUTLINE_DEPTH {
        return;
    }
    let mut current = Some(first);
    while let Some(b) = current {
        if let Some(title) = b.title() {
            let page_id = b
                .destination()
                .and_then(|d| d.page_index().ok())
                .map(|i| i as usize);
            out.push(OutlineEntry {
                title: title.trim().to_string(),
                level,
                page_id,
            });
        }
        if let Some(child) = b.first_child() {
            collect_outline(child, level + 1, out);
        }
        current = b.next_sibling();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(text: &str, x0: f32, y0: f32, x1: f32) -> Segment {
        Segment {
            text: text.into(),
            bbox: BBox::new(x0, y0, x1, y0 + 10.0),
            font_size: 10.0,
            bold: false,
        }
    }

    #[test]
    fn segments_on_one_baseline_become_one_line() {
        let lines = merge_segments(vec![
            seg("world", 60.0, 100.5, 90.0),
            seg("Hello", 10.0, 100.0, 50.0),
            seg("Next line", 10.0, 120.0, 80.0),
        ]);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "Hello world");
        assert_eq!(lines[0].bbox.x0(), 10.0);
        assert_eq!(lines[0].bbox.x1(), 90.0);
        assert_eq!(lines[1].text, "Next line");
    }

    #[test]
    fn wide_gap_becomes_cell_separator() {
        let lines = merge_segments(vec![seg("Name", 0.0, 0.0, 30.0), seg("Age", 100.0, 0.0, 120.0)]);
        assert_eq!(lines[0].text, "Name\tAge");
    }

    #[test]
    fn touching_segments_join_without_space() {
        let lines = merge_segments(vec![seg("foo", 0.0, 0.0, 20.0), seg("bar", 20.5, 0.0, 40.0)]);
        assert_eq!(lines[0].text, "foobar");
    }
}
