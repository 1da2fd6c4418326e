//! Builder chain driver: provider → initial [`Document`].

use super::resolve::{Resolver, StageCategory};
use crate::builders::{apply_ignore_list, BuilderKind, DocumentBuilder, IgnoreList};
use crate::error::ConvertError;
use crate::progress::StageProgressCallback;
use crate::providers::DocumentProvider;
use crate::schema::{BlockRegistry, Document, Page};
use std::sync::Arc;
use tracing::{debug, info};

/// The four builders, held in their fixed execution order.
pub struct BuilderChain {
    pub layout: Box<dyn DocumentBuilder>,
    pub line: Box<dyn DocumentBuilder>,
    pub ocr: Box<dyn DocumentBuilder>,
    pub structure: Box<dyn DocumentBuilder>,
}

impl BuilderChain {
    /// Resolve every builder. Fails before any page is touched.
    pub fn resolve(resolver: &Resolver<'_>) -> Result<Self, ConvertError> {
        Ok(Self {
            layout: resolver.resolve(&BuilderKind::Layout)?,
            line: resolver.resolve(&BuilderKind::Line)?,
            ocr: resolver.resolve(&BuilderKind::Ocr)?,
            structure: resolver.resolve(&BuilderKind::Structure)?,
        })
    }

    /// Build the document. Any builder failure aborts with
    /// [`ConvertError::Build`]; no partial document escapes.
    pub fn build(
        &self,
        provider: &dyn DocumentProvider,
        ignore: &IgnoreList,
        registry: Arc<BlockRegistry>,
        progress: &dyn StageProgressCallback,
    ) -> Result<Document, ConvertError> {
        let pages = provider
            .pages()
            .iter()
            .map(|source| {
                let mut page = Page::new(source.page_id, source.bbox);
                page.image = source.image.clone();
                page.refs = source.refs.clone();
                page
            })
            .collect();
        let mut document = Document::new(provider.filepath(), pages, registry);
        document.outline = provider.outline().to_vec();

        for builder in [&self.layout, &self.line, &self.ocr, &self.structure] {
            let name = builder.name();
            progress.on_stage_start(StageCategory::Builder, name);
            let failed = |detail: String| ConvertError::Build {
                stage: name.to_string(),
                detail,
            };
            builder
                .build(&mut document, provider)
                .map_err(|e| failed(e.to_string()))?;
            document
                .validate_structure()
                .map_err(|e| failed(e.to_string()))?;
            debug!("Builder '{}' done", name);
            progress.on_stage_complete(StageCategory::Builder, name);
        }

        apply_ignore_list(&mut document, ignore);

        let blocks: usize = document.pages.iter().map(Page::block_count).sum();
        info!(
            "Built document: {} pages, {} blocks",
            document.pages.len(),
            blocks
        );
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::error::StageError;
    use crate::pipeline::resolve::ArtifactBag;
    use crate::progress::NoopProgressCallback;
    use crate::providers::{MemoryProvider, ProviderPage, TextLine};
    use crate::schema::{BBox, BlockType};

    fn provider() -> MemoryProvider {
        let page = ProviderPage::new(0, BBox::new(0.0, 0.0, 612.0, 792.0))
            .line(TextLine::new("Heading", BBox::new(72.0, 100.0, 300.0, 118.0), 18.0))
            .line(TextLine::new("Body text here.", BBox::new(72.0, 130.0, 400.0, 140.0), 10.0))
            .line(TextLine::new("More body text.", BBox::new(72.0, 141.0, 400.0, 151.0), 10.0));
        MemoryProvider::new("doc.json", vec![page])
    }

    fn chain() -> BuilderChain {
        let bag = ArtifactBag::with_default_models();
        let config = PipelineConfig::default();
        BuilderChain::resolve(&Resolver::new(&bag, &config)).unwrap()
    }

    #[test]
    fn builds_regions_with_lines() {
        let doc = chain()
            .build(
                &provider(),
                &IgnoreList::default(),
                Arc::new(BlockRegistry::default()),
                &NoopProgressCallback,
            )
            .unwrap();
        let page = &doc.pages[0];
        let types: Vec<_> = page.structure.iter().map(|id| id.block_type).collect();
        assert_eq!(types, vec![BlockType::SectionHeader, BlockType::Text]);
        assert_eq!(page.raw_text(&page.structure[1]), "Body text here.\nMore body text.");
        doc.validate_structure().unwrap();
    }

    struct Broken;

    impl DocumentBuilder for Broken {
        fn name(&self) -> &'static str {
            "line"
        }

        fn build(&self, _: &mut Document, _: &dyn DocumentProvider) -> Result<(), StageError> {
            Err(StageError::failed("cannot split lines"))
        }
    }

    #[test]
    fn builder_failure_names_the_stage() {
        let mut chain = chain();
        chain.line = Box::new(Broken);
        let err = chain
            .build(
                &provider(),
                &IgnoreList::default(),
                Arc::new(BlockRegistry::default()),
                &NoopProgressCallback,
            )
            .unwrap_err();
        match err {
            ConvertError::Build { stage, detail } => {
                assert_eq!(stage, "line");
                assert!(detail.contains("cannot split lines"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
