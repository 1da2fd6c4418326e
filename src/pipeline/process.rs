//! Processor chain driver.
//!
//! Processors run strictly in the configured order. What happens when one
//! fails depends on its declared [`FailurePolicy`]:
//!
//! - `Abort` processors mutate the document in place; a failure ends the
//!   run with [`ConvertError::Processor`].
//! - `Skip` processors mutate a draft copy. The draft replaces the document
//!   only when the processor succeeded and the structure still validates,
//!   so a failed refinement leaves nothing half-applied behind.

use super::resolve::{FailurePolicy, Resolver, StageCategory};
use crate::error::ConvertError;
use crate::processors::{Processor, ProcessorKind};
use crate::progress::StageProgressCallback;
use crate::schema::Document;
use tracing::{debug, info, warn};

/// One resolved processor and the policy the driver applies to it.
pub struct ChainStage {
    pub name: &'static str,
    pub policy: FailurePolicy,
    pub processor: Box<dyn Processor>,
}

/// An ordered list of resolved processors.
#[derive(Default)]
pub struct ProcessorChain {
    stages: Vec<ChainStage>,
}

impl ProcessorChain {
    /// Resolve `kinds` in order. `policy` overrides every stage's declared
    /// policy when set.
    pub fn resolve(
        resolver: &Resolver<'_>,
        kinds: &[ProcessorKind],
        policy: Option<FailurePolicy>,
    ) -> Result<Self, ConvertError> {
        let processors = resolver.resolve_all(kinds)?;
        let stages = kinds
            .iter()
            .zip(processors)
            .map(|(kind, processor)| ChainStage {
                name: kind.name(),
                policy: policy.unwrap_or_else(|| kind.failure_policy()),
                processor,
            })
            .collect();
        Ok(Self { stages })
    }

    /// Append an already-built processor.
    pub fn push(&mut self, processor: Box<dyn Processor>, policy: FailurePolicy) {
        self.stages.push(ChainStage {
            name: processor.name(),
            policy,
            processor,
        });
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every processor over `document`.
    pub async fn run(
        &self,
        document: &mut Document,
        progress: &dyn StageProgressCallback,
    ) -> Result<(), ConvertError> {
        let mut skipped = 0usize;
        for stage in &self.stages {
            progress.on_stage_start(StageCategory::Processor, stage.name);
            match stage.policy {
                FailurePolicy::Abort => {
                    let failed = |detail: String| ConvertError::Processor {
                        processor: stage.name.to_string(),
                        detail,
                    };
                    stage
                        .processor
                        .process(document)
                        .await
                        .map_err(|e| failed(e.to_string()))?;
                    document
                        .validate_structure()
                        .map_err(|e| failed(e.to_string()))?;
                }
                FailurePolicy::Skip => {
                    let mut draft = document.clone();
                    let outcome = match stage.processor.process(&mut draft).await {
                        Ok(()) => draft.validate_structure(),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = outcome {
                        warn!("Processor '{}' failed, skipping: {}", stage.name, e);
                        progress.on_stage_skipped(StageCategory::Processor, stage.name, &e.to_string());
                        skipped += 1;
                        continue;
                    }
                    *document = draft;
                }
            }
            debug!("Processor '{}' done", stage.name);
            progress.on_stage_complete(StageCategory::Processor, stage.name);
        }
        info!(
            "Ran {} processors ({} skipped)",
            self.stages.len(),
            skipped
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::error::StageError;
    use crate::pipeline::resolve::ArtifactBag;
    use crate::progress::NoopProgressCallback;
    use crate::schema::{BBox, BlockRegistry, BlockType, Page};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// Adds a block, then fails.
    struct HalfDone;

    #[async_trait]
    impl Processor for HalfDone {
        fn name(&self) -> &'static str {
            "half_done"
        }

        async fn process(&self, document: &mut Document) -> Result<(), StageError> {
            let id = document.add_block(0, BlockType::Text, BBox::new(0.0, 0.0, 1.0, 1.0))?;
            document.pages[0].structure.push(id);
            Err(StageError::failed("gave up halfway"))
        }
    }

    fn doc() -> Document {
        Document::new(
            "t.pdf",
            vec![Page::new(0, BBox::new(0.0, 0.0, 100.0, 100.0))],
            Arc::new(BlockRegistry::default()),
        )
    }

    #[derive(Default)]
    struct Skips(Mutex<Vec<String>>);

    impl StageProgressCallback for Skips {
        fn on_stage_skipped(&self, _: StageCategory, stage: &str, _: &str) {
            self.0.lock().unwrap().push(stage.to_string());
        }
    }

    #[tokio::test]
    async fn skipped_processor_leaves_no_trace() {
        let mut chain = ProcessorChain::default();
        chain.push(Box::new(HalfDone), FailurePolicy::Skip);
        let mut d = doc();
        let skips = Skips::default();
        chain.run(&mut d, &skips).await.unwrap();
        assert!(d.pages[0].structure.is_empty());
        assert_eq!(d.pages[0].block_count(), 0);
        assert_eq!(*skips.0.lock().unwrap(), vec!["half_done".to_string()]);
    }

    #[tokio::test]
    async fn aborting_processor_names_itself() {
        let mut chain = ProcessorChain::default();
        chain.push(Box::new(HalfDone), FailurePolicy::Abort);
        let err = chain.run(&mut doc(), &NoopProgressCallback).await.unwrap_err();
        match err {
            ConvertError::Processor { processor, detail } => {
                assert_eq!(processor, "half_done");
                assert!(detail.contains("halfway"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn resolve_keeps_order_and_applies_override() {
        let bag = ArtifactBag::with_default_models();
        let config = PipelineConfig::default();
        let resolver = Resolver::new(&bag, &config);
        let kinds = [ProcessorKind::LlmTable, ProcessorKind::Order, ProcessorKind::Table];

        let chain = ProcessorChain::resolve(&resolver, &kinds, None).unwrap();
        assert_eq!(chain.names(), vec!["llm_table", "order", "table"]);
        let policies: Vec<_> = chain.stages.iter().map(|s| s.policy).collect();
        assert_eq!(policies, vec![FailurePolicy::Skip, FailurePolicy::Abort, FailurePolicy::Abort]);

        let strict = ProcessorChain::resolve(&resolver, &kinds, Some(FailurePolicy::Abort)).unwrap();
        assert!(strict.stages.iter().all(|s| s.policy == FailurePolicy::Abort));
    }
}
