//! Builder stages: turn provider primitives into the initial document.
//!
//! The chain order is fixed because each stage consumes the previous one's
//! output:
//!
//! ```text
//! layout ──▶ line ──▶ ocr ──▶ structure ──▶ ignore list
//! regions    Line     fill    reading order
//!            children textless groups
//! ```
//!
//! Builders receive the provider and the partially built [`Document`].
//! Their failure is always fatal for the run; the driver in
//! [`crate::pipeline::build`] wraps it into [`ConvertError::Build`].

mod layout;
mod line;
mod ocr;
mod structure;

pub use layout::{HeuristicLayoutModel, LayoutBuilder, LayoutModel, LayoutRegion};
pub use line::LineBuilder;
pub use ocr::{OcrBuilder, OcrModel};
pub use structure::{apply_ignore_list, IgnoreList, StructureBuilder, MAX_TOC_PAGE};

use crate::config::PipelineConfig;
use crate::error::{ConvertError, StageError};
use crate::pipeline::resolve::{
    Dependency, FailurePolicy, ResolvedDeps, StageCategory, StageDescriptor, StageSpec,
    LAYOUT_MODEL, OCR_MODEL,
};
use crate::providers::DocumentProvider;
use crate::schema::Document;
use serde_json::json;

/// One stage of the builder chain.
pub trait DocumentBuilder: Send + Sync {
    fn name(&self) -> &'static str;

    fn build(
        &self,
        document: &mut Document,
        provider: &dyn DocumentProvider,
    ) -> Result<(), StageError>;
}

/// The four builder stages, in chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuilderKind {
    Layout,
    Line,
    Ocr,
    Structure,
}

impl BuilderKind {
    pub const CHAIN: [BuilderKind; 4] = [
        BuilderKind::Layout,
        BuilderKind::Line,
        BuilderKind::Ocr,
        BuilderKind::Structure,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BuilderKind::Layout => "layout",
            BuilderKind::Line => "line",
            BuilderKind::Ocr => "ocr",
            BuilderKind::Structure => "structure",
        }
    }
}

impl StageDescriptor for BuilderKind {
    type Stage = Box<dyn DocumentBuilder>;

    fn spec(&self) -> StageSpec {
        let spec = StageSpec::new(self.name(), StageCategory::Builder, FailurePolicy::Abort);
        match self {
            BuilderKind::Layout => spec.depends_on(Dependency::required(LAYOUT_MODEL)),
            BuilderKind::Line => spec.depends_on(Dependency::with_default(
                "line_containment_margin",
                json!(2.0),
            )),
            BuilderKind::Ocr => spec.depends_on(Dependency::optional(OCR_MODEL)),
            BuilderKind::Structure => spec
                .depends_on(Dependency::with_default("group_captions", json!(true)))
                .depends_on(Dependency::with_default("caption_gap", json!(24.0))),
        }
    }

    fn instantiate(
        &self,
        deps: ResolvedDeps,
        config: &PipelineConfig,
    ) -> Result<Self::Stage, ConvertError> {
        Ok(match self {
            BuilderKind::Layout => Box::new(LayoutBuilder::new(deps.layout_model(LAYOUT_MODEL)?)),
            BuilderKind::Line => Box::new(LineBuilder::new(deps.f32("line_containment_margin")?)),
            BuilderKind::Ocr => {
                if config.disable_ocr {
                    Box::new(OcrBuilder::disabled())
                } else {
                    let model = deps.ocr_model(OCR_MODEL)?.ok_or_else(|| {
                        ConvertError::MissingDependency {
                            stage: deps.stage().to_string(),
                            dependency: OCR_MODEL.to_string(),
                        }
                    })?;
                    Box::new(OcrBuilder::new(model))
                }
            }
            BuilderKind::Structure => Box::new(StructureBuilder {
                group_captions: deps.bool("group_captions")?,
                caption_gap: deps.f32("caption_gap")?,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::resolve::{ArtifactBag, Resolver};

    #[test]
    fn layout_requires_a_model() {
        let config = PipelineConfig::default();
        let bag = ArtifactBag::new();
        let err = Resolver::new(&bag, &config)
            .resolve(&BuilderKind::Layout)
            .err()
            .unwrap();
        match err {
            ConvertError::MissingDependency { stage, dependency } => {
                assert_eq!(stage, "layout");
                assert_eq!(dependency, LAYOUT_MODEL);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn ocr_model_only_needed_when_enabled() {
        let bag = ArtifactBag::with_default_models();
        let disabled = PipelineConfig::default();
        assert!(Resolver::new(&bag, &disabled).resolve(&BuilderKind::Ocr).is_ok());

        let enabled = PipelineConfig::builder().disable_ocr(false).build().unwrap();
        let err = Resolver::new(&bag, &enabled)
            .resolve(&BuilderKind::Ocr)
            .err()
            .unwrap();
        assert!(matches!(err, ConvertError::MissingDependency { .. }));
    }

    #[test]
    fn chain_resolves_in_order() {
        let bag = ArtifactBag::with_default_models();
        let config = PipelineConfig::default();
        let chain = Resolver::new(&bag, &config)
            .resolve_all(&BuilderKind::CHAIN)
            .unwrap();
        let names: Vec<_> = chain.iter().map(|b| b.name()).collect();
        assert_eq!(names, vec!["layout", "line", "ocr", "structure"]);
    }
}
