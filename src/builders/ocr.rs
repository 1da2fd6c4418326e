//! Selective OCR of regions the text layer could not fill.

use super::DocumentBuilder;
use crate::error::StageError;
use crate::pipeline::encode::crop;
use crate::providers::DocumentProvider;
use crate::schema::{BBox, BlockId, BlockType, Document, TextExtraction};
use image::DynamicImage;
use std::sync::Arc;
use tracing::{debug, warn};

/// Recognises text lines in an image crop.
pub trait OcrModel: Send + Sync {
    fn name(&self) -> &str;

    /// Text lines, top to bottom.
    fn recognize(&self, image: &DynamicImage) -> Result<Vec<String>, StageError>;
}

/// Re-recognises every region flagged `needs_ocr` from the page image.
///
/// When OCR is disabled the builder is still part of the chain but does
/// nothing, so the chain shape never depends on configuration.
pub struct OcrBuilder {
    model: Option<Arc<dyn OcrModel>>,
}

impl OcrBuilder {
    pub fn new(model: Arc<dyn OcrModel>) -> Self {
        Self { model: Some(model) }
    }

    pub fn disabled() -> Self {
        Self { model: None }
    }
}

impl DocumentBuilder for OcrBuilder {
    fn name(&self) -> &'static str {
        "ocr"
    }

    fn build(
        &self,
        document: &mut Document,
        _provider: &dyn DocumentProvider,
    ) -> Result<(), StageError> {
        let Some(model) = &self.model else {
            debug!("OCR disabled, skipping");
            return Ok(());
        };

        let mut recognised = 0;
        for page in document.pages.iter_mut() {
            let flagged: Vec<(BlockId, BBox)> = page
                .top_level()
                .filter(|b| b.needs_ocr && !b.block_type().is_image())
                .map(|b| (b.id, b.bbox))
                .collect();
            if flagged.is_empty() {
                continue;
            }
            let Some(image) = page.image.clone() else {
                warn!("Page {}: {} regions need OCR but no page image", page.page_id, flagged.len());
                continue;
            };

            for (id, bbox) in flagged {
                let Some(region) = crop(&image, &page.bbox, &bbox) else {
                    continue;
                };
                let lines = model.recognize(&region)?;
                let lines: Vec<String> = lines
                    .into_iter()
                    .map(|l| l.trim().to_string())
                    .filter(|l| !l.is_empty())
                    .collect();
                if lines.is_empty() {
                    continue;
                }
                // Recognised lines share the region height evenly.
                let step = bbox.height() / lines.len() as f32;
                let mut children = Vec::with_capacity(lines.len());
                for (i, text) in lines.into_iter().enumerate() {
                    let y0 = bbox.y0() + step * i as f32;
                    let line_box = BBox::new(bbox.x0(), y0, bbox.x1(), y0 + step);
                    let child = page.add_block(BlockType::Line, line_box);
                    let block = page.block_mut(&child)?;
                    block.text = text;
                    block.line_height = Some(step);
                    block.extraction = TextExtraction::Ocr;
                    children.push(child);
                }
                let block = page.block_mut(&id)?;
                block.structure.extend(children);
                block.needs_ocr = false;
                block.extraction = TextExtraction::Ocr;
                recognised += 1;
            }
        }
        debug!("{}: recognised {} regions", model.name(), recognised);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MemoryProvider;
    use crate::schema::{BlockRegistry, Page};
    use image::{Rgba, RgbaImage};

    struct Fixed;

    impl OcrModel for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        fn recognize(&self, _image: &DynamicImage) -> Result<Vec<String>, StageError> {
            Ok(vec!["scanned one".into(), " ".into(), "scanned two".into()])
        }
    }

    fn doc_with_flagged_region(with_image: bool) -> (Document, BlockId) {
        let bbox = BBox::new(0.0, 0.0, 100.0, 100.0);
        let mut page = Page::new(0, bbox);
        if with_image {
            let img = RgbaImage::from_pixel(100, 100, Rgba([255, 255, 255, 255]));
            page.image = Some(Arc::new(DynamicImage::ImageRgba8(img)));
        }
        let mut doc = Document::new("scan.pdf", vec![page], Arc::new(BlockRegistry::default()));
        let id = doc.add_block(0, BlockType::Text, BBox::new(10.0, 10.0, 90.0, 50.0)).unwrap();
        doc.pages[0].structure.push(id);
        doc.pages[0].block_mut(&id).unwrap().needs_ocr = true;
        (doc, id)
    }

    #[test]
    fn flagged_regions_get_ocr_lines() {
        let (mut doc, id) = doc_with_flagged_region(true);
        let provider = MemoryProvider::new("scan.pdf", vec![]);
        OcrBuilder::new(Arc::new(Fixed)).build(&mut doc, &provider).unwrap();
        let page = &doc.pages[0];
        let block = page.block(&id).unwrap();
        assert!(!block.needs_ocr);
        assert_eq!(block.extraction, TextExtraction::Ocr);
        assert_eq!(page.raw_text(&id), "scanned one\nscanned two");
        page.validate().unwrap();
    }

    #[test]
    fn disabled_or_imageless_pages_are_left_alone() {
        let provider = MemoryProvider::new("scan.pdf", vec![]);
        let (mut doc, id) = doc_with_flagged_region(true);
        OcrBuilder::disabled().build(&mut doc, &provider).unwrap();
        assert!(doc.pages[0].block(&id).unwrap().needs_ocr);

        let (mut doc, id) = doc_with_flagged_region(false);
        OcrBuilder::new(Arc::new(Fixed)).build(&mut doc, &provider).unwrap();
        assert!(doc.pages[0].block(&id).unwrap().needs_ocr);
    }
}
