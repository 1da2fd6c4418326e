//! Document providers: raw page primitives extracted from a source file.
//!
//! A provider is opened once per conversion, eagerly extracts everything the
//! builders need (text lines with boxes and font sizes, page sizes, page
//! images, the outline) into owned data, and is then read by the builder
//! chain. Which provider handles a file is decided by the
//! [`ProviderRegistry`], keyed by [`FileKind`].

mod memory;
mod pdfium;

pub use memory::MemoryProvider;
pub use pdfium::PdfiumProvider;

use crate::config::PipelineConfig;
use crate::error::ConvertError;
pub use crate::schema::OutlineEntry;
use crate::schema::{BBox, PageRef};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

/// A line of text as the provider saw it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextLine {
    pub text: String,
    pub bbox: BBox,
    #[serde(default)]
    pub font_size: f32,
    #[serde(default)]
    pub bold: bool,
}

impl TextLine {
    pub fn new(text: impl Into<String>, bbox: BBox, font_size: f32) -> Self {
        Self {
            text: text.into(),
            bbox,
            font_size,
            bold: false,
        }
    }
}

/// Everything a provider extracted for one page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderPage {
    pub page_id: usize,
    pub bbox: BBox,
    #[serde(default)]
    pub lines: Vec<TextLine>,
    #[serde(skip)]
    pub image: Option<Arc<DynamicImage>>,
    #[serde(default)]
    pub refs: Vec<PageRef>,
    /// Regions holding graphics rather than text.
    #[serde(default)]
    pub figures: Vec<BBox>,
}

impl ProviderPage {
    pub fn new(page_id: usize, bbox: BBox) -> Self {
        Self {
            page_id,
            bbox,
            lines: Vec::new(),
            image: None,
            refs: Vec::new(),
            figures: Vec::new(),
        }
    }

    pub fn line(mut self, line: TextLine) -> Self {
        self.lines.push(line);
        self
    }

    pub fn figure(mut self, bbox: BBox) -> Self {
        self.figures.push(bbox);
        self
    }

    pub fn with_image(mut self, image: DynamicImage) -> Self {
        self.image = Some(Arc::new(image));
        self
    }
}

/// Source of page primitives for the builder chain.
pub trait DocumentProvider: Send + Sync {
    fn filepath(&self) -> &Path;

    /// Selected pages, in document order.
    fn pages(&self) -> &[ProviderPage];

    fn outline(&self) -> &[OutlineEntry] {
        &[]
    }

    fn page(&self, page_id: usize) -> Option<&ProviderPage> {
        self.pages().iter().find(|p| p.page_id == page_id)
    }

    fn page_count(&self) -> usize {
        self.pages().len()
    }
}

/// Keep only `page_range` pages (all when `None`), warning on indices that
/// do not exist.
pub(crate) fn select_pages(
    mut pages: Vec<ProviderPage>,
    page_range: Option<&[usize]>,
) -> Vec<ProviderPage> {
    let Some(range) = page_range else {
        return pages;
    };
    for idx in range {
        if !pages.iter().any(|p| p.page_id == *idx) {
            tracing::warn!("Skipping page {} (out of range, total={})", idx, pages.len());
        }
    }
    pages.retain(|p| range.contains(&p.page_id));
    pages
}

/// Kinds of source file the registry can route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Pdf,
    /// Pre-extracted pages serialised as JSON (see [`MemoryProvider`]).
    Extracted,
    Unknown,
}

impl FileKind {
    /// Sniff the first bytes, then fall back to the extension.
    pub fn detect(path: &Path) -> FileKind {
        let mut head = [0u8; 16];
        let n = std::fs::File::open(path)
            .and_then(|mut f| f.read(&mut head))
            .unwrap_or(0);
        let head = &head[..n];
        if head.starts_with(b"%PDF") {
            return FileKind::Pdf;
        }
        if head.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'{') {
            return FileKind::Extracted;
        }
        match path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .as_deref()
        {
            Some("pdf") => FileKind::Pdf,
            Some("json") => FileKind::Extracted,
            _ => FileKind::Unknown,
        }
    }
}

/// Opens a provider for a path.
pub type ProviderFactory =
    Arc<dyn Fn(&Path, &PipelineConfig) -> Result<Box<dyn DocumentProvider>, ConvertError> + Send + Sync>;

/// File kind → provider factory lookup table.
#[derive(Clone)]
pub struct ProviderRegistry {
    factories: HashMap<FileKind, ProviderFactory>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("kinds", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(
            FileKind::Pdf,
            Arc::new(|path: &Path, config: &PipelineConfig| {
                PdfiumProvider::open(path, config).map(|p| Box::new(p) as Box<dyn DocumentProvider>)
            }),
        );
        registry.register(
            FileKind::Extracted,
            Arc::new(|path: &Path, config: &PipelineConfig| {
                MemoryProvider::from_json_file(path, config)
                    .map(|p| Box::new(p) as Box<dyn DocumentProvider>)
            }),
        );
        registry
    }
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: FileKind, factory: ProviderFactory) {
        self.factories.insert(kind, factory);
    }

    /// Detect the file kind and open a provider for it.
    pub fn open(
        &self,
        path: &Path,
        config: &PipelineConfig,
    ) -> Result<Box<dyn DocumentProvider>, ConvertError> {
        let kind = FileKind::detect(path);
        let factory = self
            .factories
            .get(&kind)
            .ok_or_else(|| ConvertError::UnsupportedFileType {
                path: path.to_path_buf(),
            })?;
        if kind == FileKind::Pdf {
            check_pdf_magic(path)?;
        }
        tracing::debug!("Opening {} as {:?}", path.display(), kind);
        factory(path, config)
    }
}

/// A file detected as PDF by its extension alone must still start with
/// `%PDF`, so callers get a clear error instead of a pdfium failure.
fn check_pdf_magic(path: &Path) -> Result<(), ConvertError> {
    let mut magic = [0u8; 4];
    let read = std::fs::File::open(path).and_then(|mut f| f.read(&mut magic));
    match read {
        Ok(_) if &magic == b"%PDF" => Ok(()),
        Ok(_) => Err(ConvertError::NotAPdf {
            path: path.to_path_buf(),
            magic,
        }),
        Err(_) => Err(ConvertError::FileNotFound {
            path: path.to_path_buf(),
        }),
    }
}
