//! Image encoding: `DynamicImage` → base64 PNG.
//!
//! Used twice: renderers store picture crops in the result's images map,
//! and LLM-assisted processors attach page or block crops to prompts.
//! PNG is lossless, which keeps rendered text crisp for vision models.

use crate::schema::BBox;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::DynamicImage;
use serde::Serialize;
use std::io::Cursor;
use tracing::debug;

/// A base64-encoded image and its MIME type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncodedImage {
    pub base64: String,
    pub mime: &'static str,
}

/// Encode an image as a base64 PNG.
pub fn encode_png(img: &DynamicImage) -> Result<EncodedImage, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let base64 = STANDARD.encode(&buf);
    debug!("Encoded image → {} bytes base64", base64.len());

    Ok(EncodedImage {
        base64,
        mime: "image/png",
    })
}

/// Cut `bbox` (page coordinates) out of a page image rendered for a page of
/// size `page_bbox`. Returns `None` for empty crops.
pub fn crop(image: &DynamicImage, page_bbox: &BBox, bbox: &BBox) -> Option<DynamicImage> {
    if page_bbox.width() <= 0.0 || page_bbox.height() <= 0.0 {
        return None;
    }
    let sx = image.width() as f32 / page_bbox.width();
    let sy = image.height() as f32 / page_bbox.height();
    let x0 = ((bbox.x0() - page_bbox.x0()) * sx).floor().max(0.0) as u32;
    let y0 = ((bbox.y0() - page_bbox.y0()) * sy).floor().max(0.0) as u32;
    let x1 = (((bbox.x1() - page_bbox.x0()) * sx).ceil().max(0.0) as u32).min(image.width());
    let y1 = (((bbox.y1() - page_bbox.y0()) * sy).ceil().max(0.0) as u32).min(image.height());
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(image.crop_imm(x0, y0, x1 - x0, y1 - y0))
}
