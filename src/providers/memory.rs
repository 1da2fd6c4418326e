//! Provider over pages that were extracted ahead of time.

use super::{select_pages, DocumentProvider, OutlineEntry, ProviderPage};
use crate::config::PipelineConfig;
use crate::error::ConvertError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Pages held in memory.
///
/// Also readable from a JSON dump `{"pages": [...], "outline": [...]}`,
/// which is how pre-extracted documents are fed through the file-based
/// conversion path.
#[derive(Debug, Clone)]
pub struct MemoryProvider {
    filepath: PathBuf,
    pages: Vec<ProviderPage>,
    outline: Vec<OutlineEntry>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ExtractedDocument {
    #[serde(default)]
    pub pages: Vec<ProviderPage>,
    #[serde(default)]
    pub outline: Vec<OutlineEntry>,
}

impl MemoryProvider {
    pub fn new(filepath: impl Into<PathBuf>, pages: Vec<ProviderPage>) -> Self {
        Self {
            filepath: filepath.into(),
            pages,
            outline: Vec::new(),
        }
    }

    pub fn with_outline(mut self, outline: Vec<OutlineEntry>) -> Self {
        self.outline = outline;
        self
    }

    /// Restrict to the configured page range.
    pub fn with_page_range(mut self, page_range: Option<&[usize]>) -> Self {
        self.pages = select_pages(self.pages, page_range);
        self
    }

    pub fn from_json_file(path: &Path, config: &PipelineConfig) -> Result<Self, ConvertError> {
        let raw = std::fs::read(path).map_err(|_| ConvertError::FileNotFound {
            path: path.to_path_buf(),
        })?;
        let doc: ExtractedDocument = serde_json::from_slice(&raw).map_err(|e| ConvertError::Build {
            stage: "provider".into(),
            detail: format!("invalid extracted document: {e}"),
        })?;
        Ok(Self::new(path, doc.pages)
            .with_outline(doc.outline)
            .with_page_range(config.page_range.as_deref()))
    }
}

impl DocumentProvider for MemoryProvider {
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_json_dump_with_page_range() {
        let json = r#"{
            "pages": [
                {"page_id": 0, "bbox": [0, 0, 600, 800],
                 "lines": [{"text": "Hello", "bbox": [50, 50, 200, 62], "font_size": 12}]},
                {"page_id": 1, "bbox": [0, 0, 600, 800]}
            ],
            "outline": [{"title": "Intro", "level": 0, "page_id": 0}]
        }"#;
        let mut f = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        f.write_all(json.as_bytes()).unwrap();
        let config = PipelineConfig::builder().page_range(vec![0]).build().unwrap();
        let provider = MemoryProvider::from_json_file(f.path(), &config).unwrap();
        assert_eq!(provider.page_count(), 1);
        assert_eq!(provider.pages()[0].lines[0].text, "Hello");
        assert_eq!(provider.outline()[0].title, "Intro");
    }

    #[test]
    fn invalid_json_is_build_error() {
        let mut f = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        f.write_all(b"{ nope").unwrap();
        let err = MemoryProvider::from_json_file(f.path(), &PipelineConfig::default()).unwrap_err();
        assert!(matches!(err, ConvertError::Build { .. }));
    }
}
