//! LLM-assisted processors.
//!
//! One [`LlmProcessor`] type serves every task; the [`LlmTask`] picks the
//! blocks it looks at, the prompt it sends and how the answer is applied.
//! Requests of one processor run concurrently, bounded by the
//! `max_concurrency` option, and answers are applied in document order.
//!
//! Without a resolved LLM service these processors do nothing. Any failed
//! call or unusable answer fails the processor; the chain driver then
//! discards its partial changes.

use super::table::escape_html;
use super::Processor;
use crate::config::PipelineConfig;
use crate::error::{ConvertError, StageError};
use crate::pipeline::encode::{crop, encode_png, EncodedImage};
use crate::pipeline::resolve::ResolvedDeps;
use crate::prompts::{self, fill};
use crate::schema::{BlockId, BlockType, Document, Page, TextExtraction};
use crate::services::{ask_llm, LlmRequest, LlmService, LlmSettings};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use image::DynamicImage;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

static RE_FENCED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z]*\s*\n(.*?)\n?```$").unwrap());
static RE_TABLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<table\b.*?</table>").unwrap());
static RE_ROW: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<tr\b.*?</tr>").unwrap());

/// What an LLM-assisted processor asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmTask {
    Table,
    TableMerge,
    Form,
    ComplexRegion,
    ImageDescription,
    Equation,
    Handwriting,
    MathBlock,
    SectionHeader,
    PageCorrection,
}

impl LlmTask {
    pub fn processor_name(self) -> &'static str {
        match self {
            LlmTask::Table => "llm_table",
            LlmTask::TableMerge => "llm_table_merge",
            LlmTask::Form => "llm_form",
            LlmTask::ComplexRegion => "llm_complex_region",
            LlmTask::ImageDescription => "llm_image_description",
            LlmTask::Equation => "llm_equation",
            LlmTask::Handwriting => "llm_handwriting",
            LlmTask::MathBlock => "llm_math_block",
            LlmTask::SectionHeader => "llm_section_header",
            LlmTask::PageCorrection => "llm_page_correction",
        }
    }

    /// Block types rewritten by the per-block tasks.
    fn block_types(self) -> &'static [BlockType] {
        match self {
            LlmTask::Table => &[BlockType::Table],
            LlmTask::Form => &[BlockType::Form],
            LlmTask::ComplexRegion => &[BlockType::ComplexRegion],
            LlmTask::ImageDescription => &[BlockType::Picture, BlockType::Figure],
            LlmTask::Equation => &[BlockType::Equation],
            LlmTask::Handwriting => &[BlockType::Handwriting],
            LlmTask::MathBlock => &[BlockType::TextInlineMath],
            LlmTask::TableMerge | LlmTask::SectionHeader | LlmTask::PageCorrection => &[],
        }
    }

    fn prompt(self) -> &'static str {
        match self {
            LlmTask::Table => prompts::TABLE_PROMPT,
            LlmTask::TableMerge => prompts::TABLE_MERGE_PROMPT,
            LlmTask::Form => prompts::FORM_PROMPT,
            LlmTask::ComplexRegion => prompts::COMPLEX_REGION_PROMPT,
            LlmTask::ImageDescription => prompts::IMAGE_DESCRIPTION_PROMPT,
            LlmTask::Equation => prompts::EQUATION_PROMPT,
            LlmTask::Handwriting => prompts::HANDWRITING_PROMPT,
            LlmTask::MathBlock => prompts::MATH_BLOCK_PROMPT,
            LlmTask::SectionHeader => prompts::SECTION_HEADER_PROMPT,
            LlmTask::PageCorrection => prompts::PAGE_CORRECTION_PROMPT,
        }
    }

    /// Tasks that have nothing to work with when the page was not rendered.
    fn needs_image(self) -> bool {
        matches!(self, LlmTask::ImageDescription | LlmTask::Handwriting)
    }
}

/// The service handle and call settings an LLM processor runs with.
#[derive(Clone)]
pub struct LlmContext {
    pub service: Option<Arc<dyn LlmService>>,
    pub settings: LlmSettings,
    /// Requests in flight at once.
    pub concurrency: usize,
}

impl LlmContext {
    pub fn from_deps(deps: &ResolvedDeps, config: &PipelineConfig) -> Result<Self, ConvertError> {
        Ok(Self {
            service: deps.llm(),
            settings: LlmSettings::from_config(config),
            concurrency: deps.usize("max_concurrency")?.max(1),
        })
    }
}

pub struct LlmProcessor {
    task: LlmTask,
    context: LlmContext,
    /// Caller instructions, only used by page correction.
    instructions: String,
}

#[derive(Deserialize)]
struct MergeAnswer {
    merge: bool,
}

#[derive(Deserialize)]
struct HeaderCorrection {
    id: String,
    level: u8,
}

#[derive(Deserialize)]
struct HeaderAnswer {
    #[serde(default)]
    corrections: Vec<HeaderCorrection>,
}

#[derive(Deserialize)]
struct TypeCorrection {
    id: String,
    block_type: String,
}

#[derive(Deserialize)]
struct PageAnswer {
    #[serde(default)]
    corrections: Vec<TypeCorrection>,
}

fn strip_fences(answer: &str) -> &str {
    let trimmed = answer.trim();
    RE_FENCED
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map_or(trimmed, |m| m.as_str().trim())
}

/// Parse the first JSON object in an answer.
fn parse_json<T: for<'de> Deserialize<'de>>(answer: &str) -> Result<T, StageError> {
    let body = strip_fences(answer);
    let (Some(start), Some(end)) = (body.find('{'), body.rfind('}')) else {
        return Err(StageError::BadResponse(format!("no JSON object in '{body}'")));
    };
    if end < start {
        return Err(StageError::BadResponse(format!("no JSON object in '{body}'")));
    }
    serde_json::from_str(&body[start..=end]).map_err(|e| StageError::BadResponse(e.to_string()))
}

fn encode(image: &DynamicImage, what: &str) -> Result<EncodedImage, StageError> {
    encode_png(image).map_err(|e| StageError::failed(format!("cannot encode {what}: {e}")))
}

fn visible_blocks(page: &Page, types: &[BlockType]) -> Vec<BlockId> {
    if page.ignore_for_output {
        return Vec::new();
    }
    page.contained_blocks(types)
        .into_iter()
        .filter(|id| page.get_block(id).is_some_and(|b| !b.ignore_for_output))
        .collect()
}

/// Append the body rows of `second` to `first`, dropping a repeated header.
fn append_rows(first: &str, second: &str) -> Option<String> {
    let end = first.rfind("</table>")?;
    let header = RE_ROW.find(first).map(|m| m.as_str());
    let body: String = RE_ROW
        .find_iter(second)
        .map(|m| m.as_str())
        .enumerate()
        .filter(|(i, row)| !(*i == 0 && Some(*row) == header))
        .map(|(_, row)| row)
        .collect();
    Some(format!("{}{}{}", &first[..end], body, &first[end..]))
}

impl LlmProcessor {
    pub fn new(task: LlmTask, context: LlmContext, instructions: String) -> Self {
        Self {
            task,
            context,
            instructions,
        }
    }

    fn request(&self, prompt: String) -> LlmRequest {
        LlmRequest::new(prompt).system(prompts::SYSTEM_PROMPT)
    }

    /// Run every request, keeping input order. The first failure wins.
    async fn ask_all<K: Send>(
        &self,
        service: &Arc<dyn LlmService>,
        jobs: Vec<(K, LlmRequest)>,
    ) -> Result<Vec<(K, String)>, StageError> {
        debug!(
            "{}: sending {} requests to {} (concurrency {})",
            self.task.processor_name(),
            jobs.len(),
            service.name(),
            self.context.concurrency
        );
        let settings = self.context.settings;
        let answers: Vec<(K, Result<String, StageError>)> = stream::iter(jobs)
            .map(|(key, request)| {
                let service = Arc::clone(service);
                async move { (key, ask_llm(service.as_ref(), request, &settings).await) }
            })
            .buffered(self.context.concurrency)
            .collect()
            .await;
        answers
            .into_iter()
            .map(|(key, answer)| answer.map(|a| (key, a)))
            .collect()
    }

    async fn rewrite_blocks(
        &self,
        service: &Arc<dyn LlmService>,
        document: &mut Document,
    ) -> Result<(), StageError> {
        let mut jobs = Vec::new();
        for page in &document.pages {
            for id in visible_blocks(page, self.task.block_types()) {
                let block = page.block(&id)?;
                let image = page
                    .image
                    .as_ref()
                    .and_then(|img| crop(img, &page.bbox, &block.bbox));
                if image.is_none() && self.task.needs_image() {
                    debug!("{}: no image for {}, skipping", self.task.processor_name(), id);
                    continue;
                }
                let text = page.raw_text(&id);
                let mut request = self.request(fill(self.task.prompt(), &[("text", &text)]));
                if let Some(image) = image {
                    request = request.image(encode(&image, &id.to_string())?);
                }
                jobs.push((id, request));
            }
        }
        if jobs.is_empty() {
            return Ok(());
        }
        for (id, answer) in self.ask_all(service, jobs).await? {
            self.apply_block_answer(document, &id, &answer)?;
        }
        Ok(())
    }

    fn apply_block_answer(
        &self,
        document: &mut Document,
        id: &BlockId,
        answer: &str,
    ) -> Result<(), StageError> {
        let answer = strip_fences(answer);
        if answer.is_empty() {
            return Err(StageError::BadResponse(format!("empty answer for {id}")));
        }
        let page = document
            .get_page_mut(id.page_id)
            .ok_or_else(|| StageError::MissingBlock(id.to_string()))?;
        let block = page.block_mut(id)?;
        match self.task {
            LlmTask::Table | LlmTask::Form => {
                let table = RE_TABLE
                    .find(answer)
                    .ok_or_else(|| StageError::BadResponse(format!("no <table> in answer for {id}")))?;
                block.html = Some(table.as_str().to_string());
            }
            LlmTask::ComplexRegion | LlmTask::Handwriting | LlmTask::MathBlock => {
                block.metadata.insert("markdown".into(), answer.to_string());
            }
            LlmTask::ImageDescription => {
                block.metadata.insert("description".into(), answer.to_string());
            }
            LlmTask::Equation => {
                let latex = answer.trim_matches('$').trim();
                block.html = Some(format!(
                    "<math display=\"block\">{}</math>",
                    escape_html(latex)
                ));
                block.text = latex.to_string();
            }
            LlmTask::TableMerge | LlmTask::SectionHeader | LlmTask::PageCorrection => {
                return Err(StageError::UnsupportedBlock(id.block_type));
            }
        }
        block.extraction = TextExtraction::Llm;
        Ok(())
    }

    /// Ask whether the last table of each page continues on the next page.
    async fn merge_tables(
        &self,
        service: &Arc<dyn LlmService>,
        document: &mut Document,
    ) -> Result<(), StageError> {
        let mut jobs = Vec::new();
        for pair in document.pages.windows(2) {
            let (Some(first), Some(second)) = (
                visible_blocks(&pair[0], &[BlockType::Table]).last().copied(),
                visible_blocks(&pair[1], &[BlockType::Table]).first().copied(),
            ) else {
                continue;
            };
            let html = |page: &Page, id: &BlockId| page.get_block(id).and_then(|b| b.html.clone());
            let (Some(a), Some(b)) = (html(&pair[0], &first), html(&pair[1], &second)) else {
                continue;
            };
            let prompt = fill(self.task.prompt(), &[("first", &a), ("second", &b)]);
            jobs.push(((first, second), self.request(prompt).json()));
        }
        if jobs.is_empty() {
            return Ok(());
        }

        let mut merged_into: HashMap<BlockId, BlockId> = HashMap::new();
        for ((first, second), answer) in self.ask_all(service, jobs).await? {
            if !parse_json::<MergeAnswer>(&answer)?.merge {
                continue;
            }
            let target = merged_into.get(&first).copied().unwrap_or(first);
            let rows = document
                .get_block(&second)
                .and_then(|b| b.html.clone())
                .ok_or_else(|| StageError::MissingBlock(second.to_string()))?;
            let page = document
                .get_page_mut(target.page_id)
                .ok_or_else(|| StageError::MissingBlock(target.to_string()))?;
            let block = page.block_mut(&target)?;
            let combined = append_rows(block.html.as_deref().unwrap_or_default(), &rows)
                .ok_or_else(|| StageError::failed(format!("{target} has no table html")))?;
            block.html = Some(combined);
            if let Some(page) = document.get_page_mut(second.page_id) {
                page.block_mut(&second)?.ignore_for_output = true;
            }
            merged_into.insert(second, target);
            info!("Merged table {} into {}", second, target);
        }
        Ok(())
    }

    async fn correct_headers(
        &self,
        service: &Arc<dyn LlmService>,
        document: &mut Document,
    ) -> Result<(), StageError> {
        let headers: Vec<serde_json::Value> = document
            .pages
            .iter()
            .flat_map(|page| {
                visible_blocks(page, &[BlockType::SectionHeader])
                    .into_iter()
                    .map(move |id| {
                        json!({
                            "id": id.to_string(),
                            "text": page.raw_text(&id).replace('\n', " "),
                            "level": page.get_block(&id).and_then(|b| b.heading_level),
                        })
                    })
            })
            .collect();
        if headers.is_empty() {
            return Ok(());
        }
        let listing = serde_json::to_string_pretty(&headers)
            .map_err(|e| StageError::failed(e.to_string()))?;
        let request = self
            .request(fill(self.task.prompt(), &[("headers", &listing)]))
            .json();

        for ((), answer) in self.ask_all(service, vec![((), request)]).await? {
            let answer: HeaderAnswer = parse_json(&answer)?;
            for correction in answer.corrections {
                let Ok(id) = correction.id.parse::<BlockId>() else {
                    warn!("Ignoring header correction for unknown id '{}'", correction.id);
                    continue;
                };
                match document.get_page_mut(id.page_id).and_then(|p| p.get_block_mut(&id)) {
                    Some(block) => block.heading_level = Some(correction.level.clamp(1, 6)),
                    None => warn!("Ignoring header correction for missing block {}", id),
                }
            }
        }
        Ok(())
    }

    async fn correct_pages(
        &self,
        service: &Arc<dyn LlmService>,
        document: &mut Document,
    ) -> Result<(), StageError> {
        if self.instructions.trim().is_empty() {
            debug!("llm_page_correction: no instructions configured, skipping");
            return Ok(());
        }
        let mut jobs = Vec::new();
        for page in document.pages.iter().filter(|p| !p.ignore_for_output) {
            let blocks: Vec<serde_json::Value> = page
                .visible_structure()
                .iter()
                .map(|id| {
                    let text: String = page.raw_text(id).chars().take(200).collect();
                    json!({"id": id.to_string(), "block_type": id.block_type, "text": text})
                })
                .collect();
            if blocks.is_empty() {
                continue;
            }
            let listing = serde_json::to_string_pretty(&blocks)
                .map_err(|e| StageError::failed(e.to_string()))?;
            let prompt = fill(
                self.task.prompt(),
                &[("blocks", &listing), ("instructions", &self.instructions)],
            );
            let mut request = self.request(prompt).json();
            if let Some(image) = &page.image {
                request = request.image(encode(image, &format!("page {}", page.page_id))?);
            }
            jobs.push((page.page_id, request));
        }
        if jobs.is_empty() {
            return Ok(());
        }

        for (page_id, answer) in self.ask_all(service, jobs).await? {
            let answer: PageAnswer = parse_json(&answer)?;
            for correction in answer.corrections {
                let id = match correction.id.parse::<BlockId>() {
                    Ok(id) if id.page_id == page_id && document.get_block(&id).is_some() => id,
                    _ => {
                        warn!("Ignoring correction for unknown block '{}'", correction.id);
                        continue;
                    }
                };
                let Ok(to) = correction.block_type.parse::<BlockType>() else {
                    warn!("Ignoring correction to unknown type '{}'", correction.block_type);
                    continue;
                };
                if to != id.block_type {
                    document.relabel_block(&id, to)?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Processor for LlmProcessor {
    fn name(&self) -> &'static str {
        self.task.processor_name()
    }

    async fn process(&self, document: &mut Document) -> Result<(), StageError> {
        let Some(service) = self.context.service.clone() else {
            debug!("{}: no LLM service, nothing to do", self.name());
            return Ok(());
        };
        match self.task {
            LlmTask::TableMerge => self.merge_tables(&service, document).await,
            LlmTask::SectionHeader => self.correct_headers(&service, document).await,
            LlmTask::PageCorrection => self.correct_pages(&service, document).await,
            _ => self.rewrite_blocks(&service, document).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{BBox, BlockRegistry};
    use crate::services::StaticService;
    use image::{Rgba, RgbaImage};

    fn context(service: Option<Arc<dyn LlmService>>) -> LlmContext {
        LlmContext {
            service,
            settings: LlmSettings::from_config(&PipelineConfig::default()),
            concurrency: 2,
        }
    }

    fn processor(task: LlmTask, answer: &str) -> (LlmProcessor, Arc<StaticService>) {
        let service = Arc::new(StaticService::new(answer));
        let handle: Arc<dyn LlmService> = service.clone();
        (LlmProcessor::new(task, context(Some(handle)), String::new()), service)
    }

    fn doc(pages: usize) -> Document {
        let pages = (0..pages)
            .map(|i| Page::new(i, BBox::new(0.0, 0.0, 100.0, 100.0)))
            .collect();
        Document::new("t.pdf", pages, Arc::new(BlockRegistry::default()))
    }

    fn push(d: &mut Document, page: usize, t: BlockType, text: &str) -> BlockId {
        let id = d.add_block(page, t, BBox::new(10.0, 10.0, 90.0, 40.0)).unwrap();
        let p = &mut d.pages[page];
        p.structure.push(id);
        p.block_mut(&id).unwrap().text = text.into();
        id
    }

    #[test]
    fn json_answers_tolerate_fences_and_chatter() {
        let v: MergeAnswer = parse_json("```json\n{\"merge\": true}\n```").unwrap();
        assert!(v.merge);
        let v: MergeAnswer = parse_json("Sure! {\"merge\": false} Hope this helps").unwrap();
        assert!(!v.merge);
        assert!(matches!(
            parse_json::<MergeAnswer>("no idea"),
            Err(StageError::BadResponse(_))
        ));
    }

    #[test]
    fn repeated_header_row_is_dropped() {
        let merged = append_rows(
            "<table><tr><th>A</th></tr><tr><td>1</td></tr></table>",
            "<table><tr><th>A</th></tr><tr><td>2</td></tr></table>",
        )
        .unwrap();
        assert_eq!(
            merged,
            "<table><tr><th>A</th></tr><tr><td>1</td></tr><tr><td>2</td></tr></table>"
        );
    }

    #[tokio::test]
    async fn without_service_nothing_changes() {
        let mut d = doc(1);
        push(&mut d, 0, BlockType::Table, "a b");
        let before = d.clone();
        LlmProcessor::new(LlmTask::Table, context(None), String::new())
            .process(&mut d)
            .await
            .unwrap();
        assert_eq!(d, before);
    }

    #[tokio::test]
    async fn table_answer_sets_html() {
        let mut d = doc(1);
        let table = push(&mut d, 0, BlockType::Table, "a b");
        let (p, service) = processor(
            LlmTask::Table,
            "```html\n<table><tr><td>a</td><td>b</td></tr></table>\n```",
        );
        p.process(&mut d).await.unwrap();
        let block = d.get_block(&table).unwrap();
        assert_eq!(block.html.as_deref(), Some("<table><tr><td>a</td><td>b</td></tr></table>"));
        assert_eq!(block.extraction, TextExtraction::Llm);
        assert_eq!(service.calls(), 1);
    }

    #[tokio::test]
    async fn unusable_answer_fails_the_processor() {
        let mut d = doc(1);
        push(&mut d, 0, BlockType::Table, "a b");
        let (p, _) = processor(LlmTask::Table, "I cannot read this table.");
        assert!(matches!(
            p.process(&mut d).await,
            Err(StageError::BadResponse(_))
        ));
    }

    #[tokio::test]
    async fn image_description_needs_a_rendered_page() {
        let mut d = doc(1);
        let pic = push(&mut d, 0, BlockType::Picture, "");
        let (p, service) = processor(LlmTask::ImageDescription, "A bar chart of sales.");
        p.process(&mut d).await.unwrap();
        assert_eq!(service.calls(), 0);

        d.pages[0].image = Some(Arc::new(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            50,
            50,
            Rgba([0, 0, 255, 255]),
        ))));
        p.process(&mut d).await.unwrap();
        assert_eq!(
            d.get_block(&pic).unwrap().metadata.get("description").map(String::as_str),
            Some("A bar chart of sales.")
        );
    }

    #[tokio::test]
    async fn continued_table_is_merged_and_hidden() {
        let mut d = doc(2);
        let first = push(&mut d, 0, BlockType::Table, "");
        let second = push(&mut d, 1, BlockType::Table, "");
        d.pages[0].block_mut(&first).unwrap().html =
            Some("<table><tr><th>A</th></tr><tr><td>1</td></tr></table>".into());
        d.pages[1].block_mut(&second).unwrap().html =
            Some("<table><tr><td>2</td></tr></table>".into());
        let (p, _) = processor(LlmTask::TableMerge, r#"{"merge": true}"#);
        p.process(&mut d).await.unwrap();
        assert_eq!(
            d.get_block(&first).unwrap().html.as_deref(),
            Some("<table><tr><th>A</th></tr><tr><td>1</td></tr><tr><td>2</td></tr></table>")
        );
        assert!(d.get_block(&second).unwrap().ignore_for_output);
    }

    #[tokio::test]
    async fn header_levels_follow_corrections() {
        let mut d = doc(1);
        let h = push(&mut d, 0, BlockType::SectionHeader, "Methods");
        let answer = format!(
            r#"{{"corrections": [{{"id": "{h}", "level": 3}}, {{"id": "/page/9/Text/1", "level": 1}}]}}"#
        );
        let (p, _) = processor(LlmTask::SectionHeader, &answer);
        p.process(&mut d).await.unwrap();
        assert_eq!(d.get_block(&h).unwrap().heading_level, Some(3));
    }

    #[tokio::test]
    async fn page_correction_needs_instructions() {
        let mut d = doc(1);
        let text = push(&mut d, 0, BlockType::Text, "Figure 1: results");
        let answer = format!(r#"{{"corrections": [{{"id": "{text}", "block_type": "Caption"}}]}}"#);

        let (idle, service) = processor(LlmTask::PageCorrection, &answer);
        idle.process(&mut d).await.unwrap();
        assert_eq!(service.calls(), 0);

        let handle: Arc<dyn LlmService> = Arc::new(StaticService::new(answer));
        LlmProcessor::new(
            LlmTask::PageCorrection,
            context(Some(handle)),
            "Captions start with 'Figure'.".into(),
        )
        .process(&mut d)
        .await
        .unwrap();
        assert_eq!(d.pages[0].structure[0].block_type, BlockType::Caption);
        d.validate_structure().unwrap();
    }
}
