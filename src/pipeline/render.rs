//! Renderer fan-out: run every selected renderer over the finished document
//! and merge their outputs into one [`RenderResult`].
//!
//! Each renderer's payload lands under its kind's fixed output key, so
//! payloads never collide. Images and metadata can collide; how they are
//! combined is the run's [`MergePolicy`]:
//!
//! - `Namespaced` (default) keeps one map per output key, nothing is lost.
//! - `LastWriterWins` flat-merges in renderer order; a later renderer
//!   overwrites an earlier one's entries with the same name.

use super::postprocess::cleanup_markdown;
use super::resolve::{Resolver, StageCategory};
use crate::config::PipelineConfig;
use crate::error::ConvertError;
use crate::output::RenderResult;
use crate::progress::StageProgressCallback;
use crate::renderers::{Renderer, RendererKind};
use crate::schema::Document;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// How images and metadata from several renderers are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// One entry per output key.
    #[default]
    Namespaced,
    /// One flat map; later renderers overwrite earlier entries.
    LastWriterWins,
}

/// What a failing renderer does to the fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderFailurePolicy {
    /// Fail the conversion with [`ConvertError::Render`].
    #[default]
    Abort,
    /// Leave the renderer's key out and record the error.
    Partial,
}

/// Parse a `"pageMarkdown+chunks"` selector, keeping token order.
///
/// Empty, unknown and repeated tokens are configuration errors.
pub fn parse_renderer_selector(selector: &str) -> Result<Vec<RendererKind>, ConvertError> {
    let mut kinds = Vec::new();
    for token in selector.split('+') {
        let token = token.trim();
        if token.is_empty() {
            return Err(ConvertError::config(format!(
                "empty renderer token in selector '{selector}'"
            )));
        }
        push_unique(&mut kinds, token.parse()?, token)?;
    }
    Ok(kinds)
}

fn push_unique(
    kinds: &mut Vec<RendererKind>,
    kind: RendererKind,
    token: &str,
) -> Result<(), ConvertError> {
    if kinds.contains(&kind) {
        return Err(ConvertError::config(format!(
            "renderer '{token}' selected more than once"
        )));
    }
    kinds.push(kind);
    Ok(())
}

/// The renderers a configuration selects: the explicit list, else the
/// selector shorthand, else the default pair.
pub fn selected_renderers(config: &PipelineConfig) -> Result<Vec<RendererKind>, ConvertError> {
    if let Some(names) = &config.renderers {
        let mut kinds = Vec::with_capacity(names.len());
        for name in names {
            push_unique(&mut kinds, name.parse()?, name)?;
        }
        return Ok(kinds);
    }
    match &config.renderer {
        Some(selector) => parse_renderer_selector(selector),
        None => Ok(RendererKind::DEFAULT.to_vec()),
    }
}

/// Page id → ids of its visible top-level blocks. Hidden pages map to `[]`.
pub fn page_structure(document: &Document) -> BTreeMap<usize, Vec<String>> {
    document
        .pages
        .iter()
        .map(|page| {
            let ids = page
                .visible_structure()
                .iter()
                .map(ToString::to_string)
                .collect();
            (page.page_id, ids)
        })
        .collect()
}

/// Resolved renderers plus the policies that govern their merge.
pub struct RendererFanOut {
    renderers: Vec<Box<dyn Renderer>>,
    merge: MergePolicy,
    failure: RenderFailurePolicy,
}

impl RendererFanOut {
    pub fn resolve(
        resolver: &Resolver<'_>,
        kinds: &[RendererKind],
        config: &PipelineConfig,
    ) -> Result<Self, ConvertError> {
        if kinds.is_empty() {
            return Err(ConvertError::config("no renderer selected"));
        }
        Ok(Self {
            renderers: resolver.resolve_all(kinds)?,
            merge: config.merge_policy,
            failure: config.render_failure_policy,
        })
    }

    pub fn kinds(&self) -> Vec<RendererKind> {
        self.renderers.iter().map(|r| r.kind()).collect()
    }

    pub fn render(
        &self,
        document: &Document,
        progress: &dyn StageProgressCallback,
    ) -> Result<RenderResult, ConvertError> {
        let mut result = RenderResult {
            page_structure: page_structure(document),
            ..RenderResult::default()
        };

        for renderer in &self.renderers {
            let kind = renderer.kind();
            let key = kind.output_key();
            progress.on_stage_start(StageCategory::Renderer, kind.name());

            let rendered = match renderer.render(document) {
                Ok(rendered) => rendered,
                Err(e) => match self.failure {
                    RenderFailurePolicy::Abort => {
                        return Err(ConvertError::Render {
                            renderer: kind.name().to_string(),
                            detail: e.to_string(),
                        });
                    }
                    RenderFailurePolicy::Partial => {
                        warn!("Renderer '{}' failed, leaving '{}' out: {}", kind.name(), key, e);
                        progress.on_stage_skipped(StageCategory::Renderer, kind.name(), &e.to_string());
                        result.errors.insert(key.to_string(), e.to_string());
                        continue;
                    }
                },
            };

            let payload = match (&rendered.payload, kind.applies_cleanup()) {
                (Value::String(text), true) => Value::String(cleanup_markdown(text)),
                (other, _) => other.clone(),
            };
            result.outputs.insert(key.to_string(), payload);

            let images: Map<String, Value> = rendered
                .images
                .into_iter()
                .map(|(name, data)| (name, Value::String(data)))
                .collect();
            match self.merge {
                MergePolicy::Namespaced => {
                    result.images.insert(key.to_string(), Value::Object(images));
                    result.metadata.insert(key.to_string(), rendered.metadata);
                }
                MergePolicy::LastWriterWins => {
                    result.images.extend(images);
                    if let Value::Object(metadata) = rendered.metadata {
                        result.metadata.extend(metadata);
                    }
                }
            }

            debug!("Renderer '{}' done", kind.name());
            progress.on_stage_complete(StageCategory::Renderer, kind.name());
        }

        info!(
            "Rendered {} outputs ({} failed)",
            result.outputs.len(),
            result.errors.len()
        );
        Ok(result)
    }
}
