//! Processor stages: in-place rewrites of a built [`Document`].
//!
//! Processors run one after another in the configured order (see
//! [`ProcessorKind::DEFAULT_ORDER`]); later ones rely on the normalisation
//! done by earlier ones. Every kind declares a [`FailurePolicy`]:
//! structural processors abort the run, LLM-assisted ones are skipped with a
//! warning and leave no partial change behind.

mod finish;
mod headers;
mod llm;
mod order;
mod table;
mod text;

pub use finish::{BlankPageProcessor, DebugProcessor, ReferenceProcessor};
pub use headers::{lexical_similarity, DocumentTocProcessor, PageHeaderProcessor, SectionHeaderProcessor};
pub use llm::{LlmContext, LlmProcessor, LlmTask};
pub use order::{LineMergeProcessor, OrderProcessor, RelabelProcessor, RelabelRule};
pub use table::TableProcessor;
pub(crate) use table::escape_html;
pub use text::{
    BlockquoteProcessor, CodeProcessor, EquationProcessor, FootnoteProcessor,
    IgnoreTextProcessor, LineNumbersProcessor, ListProcessor, TextProcessor,
};

use crate::config::PipelineConfig;
use crate::error::{ConvertError, StageError};
use crate::pipeline::resolve::{
    Dependency, FailurePolicy, ResolvedDeps, StageCategory, StageDescriptor, StageSpec,
    LLM_SERVICE,
};
use crate::schema::Document;
use async_trait::async_trait;
use serde_json::json;
use std::fmt;
use std::str::FromStr;

/// One document-rewriting stage.
#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(&self, document: &mut Document) -> Result<(), StageError>;
}

/// Every processor the pipeline knows, by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessorKind {
    Order,
    Relabel,
    LineMerge,
    Blockquote,
    Code,
    DocumentToc,
    Equation,
    Footnote,
    IgnoreText,
    LineNumbers,
    List,
    PageHeader,
    SectionHeader,
    Table,
    LlmTable,
    LlmTableMerge,
    LlmForm,
    Text,
    LlmComplexRegion,
    LlmImageDescription,
    LlmEquation,
    LlmHandwriting,
    LlmMathBlock,
    LlmSectionHeader,
    LlmPageCorrection,
    Reference,
    BlankPage,
    Debug,
}

impl ProcessorKind {
    /// The order used when the configuration names no processors.
    pub const DEFAULT_ORDER: [ProcessorKind; 28] = [
        ProcessorKind::Order,
        ProcessorKind::Relabel,
        ProcessorKind::LineMerge,
        ProcessorKind::Blockquote,
        ProcessorKind::Code,
        ProcessorKind::DocumentToc,
        ProcessorKind::Equation,
        ProcessorKind::Footnote,
        ProcessorKind::IgnoreText,
        ProcessorKind::LineNumbers,
        ProcessorKind::List,
        ProcessorKind::PageHeader,
        ProcessorKind::SectionHeader,
        ProcessorKind::Table,
        ProcessorKind::LlmTable,
        ProcessorKind::LlmTableMerge,
        ProcessorKind::LlmForm,
        ProcessorKind::Text,
        ProcessorKind::LlmComplexRegion,
        ProcessorKind::LlmImageDescription,
        ProcessorKind::LlmEquation,
        ProcessorKind::LlmHandwriting,
        ProcessorKind::LlmMathBlock,
        ProcessorKind::LlmSectionHeader,
        ProcessorKind::LlmPageCorrection,
        ProcessorKind::Reference,
        ProcessorKind::BlankPage,
        ProcessorKind::Debug,
    ];

    /// snake_case name used in configuration and logs.
    pub fn name(self) -> &'static str {
        match self {
            ProcessorKind::Order => "order",
            ProcessorKind::Relabel => "relabel",
            ProcessorKind::LineMerge => "line_merge",
            ProcessorKind::Blockquote => "blockquote",
            ProcessorKind::Code => "code",
            ProcessorKind::DocumentToc => "document_toc",
            ProcessorKind::Equation => "equation",
            ProcessorKind::Footnote => "footnote",
            ProcessorKind::IgnoreText => "ignore_text",
            ProcessorKind::LineNumbers => "line_numbers",
            ProcessorKind::List => "list",
            ProcessorKind::PageHeader => "page_header",
            ProcessorKind::SectionHeader => "section_header",
            ProcessorKind::Table => "table",
            ProcessorKind::LlmTable => "llm_table",
            ProcessorKind::LlmTableMerge => "llm_table_merge",
            ProcessorKind::LlmForm => "llm_form",
            ProcessorKind::Text => "text",
            ProcessorKind::LlmComplexRegion => "llm_complex_region",
            ProcessorKind::LlmImageDescription => "llm_image_description",
            ProcessorKind::LlmEquation => "llm_equation",
            ProcessorKind::LlmHandwriting => "llm_handwriting",
            ProcessorKind::LlmMathBlock => "llm_math_block",
            ProcessorKind::LlmSectionHeader => "llm_section_header",
            ProcessorKind::LlmPageCorrection => "llm_page_correction",
            ProcessorKind::Reference => "reference",
            ProcessorKind::BlankPage => "blank_page",
            ProcessorKind::Debug => "debug",
        }
    }

    /// The LLM task for LLM-assisted kinds.
    pub fn llm_task(self) -> Option<LlmTask> {
        Some(match self {
            ProcessorKind::LlmTable => LlmTask::Table,
            ProcessorKind::LlmTableMerge => LlmTask::TableMerge,
            ProcessorKind::LlmForm => LlmTask::Form,
            ProcessorKind::LlmComplexRegion => LlmTask::ComplexRegion,
            ProcessorKind::LlmImageDescription => LlmTask::ImageDescription,
            ProcessorKind::LlmEquation => LlmTask::Equation,
            ProcessorKind::LlmHandwriting => LlmTask::Handwriting,
            ProcessorKind::LlmMathBlock => LlmTask::MathBlock,
            ProcessorKind::LlmSectionHeader => LlmTask::SectionHeader,
            ProcessorKind::LlmPageCorrection => LlmTask::PageCorrection,
            _ => return None,
        })
    }

    pub fn is_llm_assisted(self) -> bool {
        self.llm_task().is_some()
    }

    pub fn failure_policy(self) -> FailurePolicy {
        if self.is_llm_assisted() {
            FailurePolicy::Skip
        } else {
            FailurePolicy::Abort
        }
    }

    /// Parse a list of processor names, keeping order.
    pub fn parse_list<S: AsRef<str>>(names: &[S]) -> Result<Vec<ProcessorKind>, ConvertError> {
        names.iter().map(|n| n.as_ref().parse()).collect()
    }
}

impl fmt::Display for ProcessorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProcessorKind {
    type Err = ConvertError;

    /// Accepts `line_merge`, `LineMerge`, `LineMergeProcessor` and dotted
    /// paths ending in one of those.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let last = s.trim().rsplit('.').next().unwrap_or_default();
        let wanted: String = last
            .strip_suffix("Processor")
            .unwrap_or(last)
            .chars()
            .filter(|c| *c != '_')
            .flat_map(char::to_lowercase)
            .collect();
        ProcessorKind::DEFAULT_ORDER
            .iter()
            .copied()
            .find(|k| k.name().replace('_', "") == wanted)
            .ok_or_else(|| ConvertError::config(format!("unknown processor '{}'", s.trim())))
    }
}

impl StageDescriptor for ProcessorKind {
    type Stage = Box<dyn Processor>;

    fn spec(&self) -> StageSpec {
        let spec = StageSpec::new(self.name(), StageCategory::Processor, self.failure_policy());
        match self {
            ProcessorKind::Relabel => {
                spec.depends_on(Dependency::with_default("block_relabel_str", json!("")))
            }
            ProcessorKind::Blockquote => spec
                .depends_on(Dependency::with_default("min_x_indent", json!(0.05)))
                .depends_on(Dependency::with_default("x_end_tolerance", json!(0.03))),
            ProcessorKind::IgnoreText => spec
                .depends_on(Dependency::with_default("common_element_threshold", json!(0.2)))
                .depends_on(Dependency::with_default("common_element_min_blocks", json!(3))),
            ProcessorKind::LineNumbers => spec
                .depends_on(Dependency::with_default("strip_numbers_threshold", json!(0.6)))
                .depends_on(Dependency::with_default("min_lines_in_block", json!(4))),
            ProcessorKind::List => {
                spec.depends_on(Dependency::with_default("list_indent_width", json!(12.0)))
            }
            ProcessorKind::PageHeader => {
                spec.depends_on(Dependency::with_default("page_header_band", json!(0.2)))
            }
            ProcessorKind::SectionHeader => spec
                .depends_on(Dependency::with_default("level_count", json!(4)))
                .depends_on(Dependency::with_default("merge_threshold", json!(0.5)))
                .depends_on(Dependency::with_default("default_level", json!(2))),
            ProcessorKind::DocumentToc => {
                spec.depends_on(Dependency::with_default("toc_overlap_threshold", json!(0.9)))
            }
            ProcessorKind::BlankPage => {
                spec.depends_on(Dependency::with_default("blank_pixel_tolerance", json!(12)))
            }
            kind if kind.is_llm_assisted() => {
                let spec = spec
                    .depends_on(Dependency::optional(LLM_SERVICE))
                    .depends_on(Dependency::with_default("max_concurrency", json!(3)));
                if *kind == ProcessorKind::LlmPageCorrection {
                    spec.depends_on(Dependency::with_default("page_correction_prompt", json!("")))
                } else {
                    spec
                }
            }
            _ => spec,
        }
    }

    fn instantiate(
        &self,
        deps: ResolvedDeps,
        config: &PipelineConfig,
    ) -> Result<Self::Stage, ConvertError> {
        if let Some(task) = self.llm_task() {
            let context = LlmContext::from_deps(&deps, config)?;
            let extra = if task == LlmTask::PageCorrection {
                deps.string("page_correction_prompt")?
            } else {
                String::new()
            };
            return Ok(Box::new(LlmProcessor::new(task, context, extra)));
        }
        Ok(match self {
            ProcessorKind::Order => Box::new(OrderProcessor),
            ProcessorKind::Relabel => Box::new(RelabelProcessor::parse(
                &deps.string("block_relabel_str")?,
            )?),
            ProcessorKind::LineMerge => Box::new(LineMergeProcessor),
            ProcessorKind::Blockquote => Box::new(BlockquoteProcessor {
                min_x_indent: deps.f32("min_x_indent")?,
                x_end_tolerance: deps.f32("x_end_tolerance")?,
            }),
            ProcessorKind::Code => Box::new(CodeProcessor),
            ProcessorKind::DocumentToc => Box::new(DocumentTocProcessor {
                overlap_threshold: deps.f32("toc_overlap_threshold")?,
            }),
            ProcessorKind::Equation => Box::new(EquationProcessor),
            ProcessorKind::Footnote => Box::new(FootnoteProcessor),
            ProcessorKind::IgnoreText => Box::new(IgnoreTextProcessor {
                threshold: deps.f32("common_element_threshold")?,
                min_blocks: deps.usize("common_element_min_blocks")?,
            }),
            ProcessorKind::LineNumbers => Box::new(LineNumbersProcessor {
                threshold: deps.f32("strip_numbers_threshold")?,
                min_lines: deps.usize("min_lines_in_block")?,
            }),
            ProcessorKind::List => Box::new(ListProcessor {
                indent_width: deps.f32("list_indent_width")?,
            }),
            ProcessorKind::PageHeader => Box::new(PageHeaderProcessor {
                band: deps.f32("page_header_band")?,
            }),
            ProcessorKind::SectionHeader => Box::new(SectionHeaderProcessor {
                level_count: deps.usize("level_count")?.clamp(1, 6),
                merge_threshold: deps.f32("merge_threshold")?,
                default_level: deps.usize("default_level")?.clamp(1, 6) as u8,
            }),
            ProcessorKind::Table => Box::new(TableProcessor),
            ProcessorKind::Text => Box::new(TextProcessor),
            ProcessorKind::Reference => Box::new(ReferenceProcessor),
            ProcessorKind::BlankPage => Box::new(BlankPageProcessor {
                tolerance: deps.usize("blank_pixel_tolerance")?.min(255) as u8,
            }),
            ProcessorKind::Debug => Box::new(DebugProcessor {
                enabled: config.debug,
            }),
            other => {
                return Err(ConvertError::Internal(format!(
                    "processor '{other}' has no constructor"
                )))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::resolve::{ArtifactBag, Resolver};

    #[test]
    fn names_parse_in_every_spelling() {
        for spelling in ["line_merge", "LineMerge", "LineMergeProcessor", "processors.LineMergeProcessor"] {
            assert_eq!(spelling.parse::<ProcessorKind>().unwrap(), ProcessorKind::LineMerge);
        }
        assert_eq!("llm_table_merge".parse::<ProcessorKind>().unwrap(), ProcessorKind::LlmTableMerge);
    }

    #[test]
    fn unknown_processor_is_configuration_error() {
        let err = ProcessorKind::parse_list(&["order", "sparkle"]).unwrap_err();
        assert!(matches!(&err, ConvertError::Configuration(m) if m.contains("sparkle")));
    }

    #[test]
    fn policies_follow_llm_assistance() {
        assert_eq!(ProcessorKind::Table.failure_policy(), FailurePolicy::Abort);
        assert_eq!(ProcessorKind::LlmTable.failure_policy(), FailurePolicy::Skip);
        let llm = ProcessorKind::DEFAULT_ORDER.iter().filter(|k| k.is_llm_assisted()).count();
        assert_eq!(llm, 10);
    }

    #[test]
    fn every_default_processor_resolves() {
        let bag = ArtifactBag::with_default_models();
        let config = PipelineConfig::default();
        let stages = Resolver::new(&bag, &config)
            .resolve_all(&ProcessorKind::DEFAULT_ORDER)
            .unwrap();
        let names: Vec<_> = stages.iter().map(|p| p.name()).collect();
        let expected: Vec<_> = ProcessorKind::DEFAULT_ORDER.iter().map(|k| k.name()).collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn options_override_declared_defaults() {
        let bag = ArtifactBag::new();
        let config = PipelineConfig::builder()
            .option("block_relabel_str", json!("Table:Picture:bogus"))
            .build()
            .unwrap();
        let err = Resolver::new(&bag, &config)
            .resolve(&ProcessorKind::Relabel)
            .err()
            .unwrap();
        assert!(matches!(err, ConvertError::Configuration(_)));
    }
}
