//! Integration tests for the conversion pipeline.
//!
//! Documents are built in memory through [`MemoryProvider`] or fed as the
//! JSON dump the provider registry understands, so no PDF engine or LLM
//! backend is needed.

use edgequake_docpipe::pipeline::input::{self, FileRef};
use edgequake_docpipe::providers::{FileKind, ProviderPage, ProviderRegistry, TextLine};
use edgequake_docpipe::schema::BBox;
use edgequake_docpipe::{
    convert_from_bytes, ArtifactBag, ConvertError, Converter, DocumentProvider, LlmFallback,
    MemoryProvider, PipelineConfig, RenderResult, StaticService,
};
use serde_json::{json, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

// ── Test helpers ─────────────────────────────────────────────────────────────

fn page_box() -> BBox {
    BBox::new(0.0, 0.0, 612.0, 792.0)
}

fn line(text: &str, y: f32, size: f32) -> TextLine {
    TextLine::new(text, BBox::new(72.0, y, 540.0, y + size), size)
}

fn article_page(id: usize) -> ProviderPage {
    ProviderPage::new(id, page_box())
        .line(line("Introduction", 100.0, 18.0))
        .line(line("Pipelines turn documents into structured text", 130.0, 10.0))
        .line(line("and every stage can be swapped out", 141.0, 10.0))
        .line(line("• builders detect layout", 170.0, 10.0))
        .line(line("• renderers produce output", 182.0, 10.0))
}

fn toc_page(id: usize) -> ProviderPage {
    ProviderPage::new(id, page_box())
        .line(line("Contents", 100.0, 18.0))
        .line(line("Introduction ........ 3", 130.0, 10.0))
        .line(line("Methods ........ 7", 142.0, 10.0))
}

fn provider(pages: Vec<ProviderPage>) -> Box<MemoryProvider> {
    Box::new(MemoryProvider::new("memory.json", pages))
}

async fn run(config: PipelineConfig, pages: Vec<ProviderPage>) -> Result<RenderResult, ConvertError> {
    Converter::new(config, ArtifactBag::with_default_models())?
        .convert_provider(provider(pages))
        .await
}

fn dump(pages: &[ProviderPage]) -> Vec<u8> {
    serde_json::to_vec(&json!({ "pages": pages })).unwrap()
}

// ── Output shape ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn default_renderers_produce_documented_keys() {
    let result = run(PipelineConfig::default(), vec![article_page(0)]).await.unwrap();
    assert_eq!(
        result.keys(),
        vec!["chunks", "images", "metadata", "page_renders", "page_structure"]
    );
    assert!(result.errors.is_empty());
}

/// Ids of every chunk, in either chunk output form.
fn chunk_ids(chunks: &Value) -> Vec<String> {
    match chunks {
        Value::Object(by_id) if !by_id.contains_key("blocks") => by_id.keys().cloned().collect(),
        _ => chunks["blocks"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|c| c["id"].as_str().map(str::to_string))
            .collect(),
    }
}

#[tokio::test]
async fn page_structure_ids_match_chunk_ids() {
    for output_json in [false, true] {
        let config = PipelineConfig::builder().output_json(output_json).build().unwrap();
        let result = run(config, vec![article_page(0), article_page(1)]).await.unwrap();
        assert_eq!(result.page_structure.len(), 2);

        let chunk_ids = chunk_ids(result.output("chunks").unwrap());
        for ids in result.page_structure.values() {
            assert!(!ids.is_empty());
            for id in ids {
                assert!(chunk_ids.contains(id), "{id} has no chunk (output_json={output_json})");
            }
        }
    }
}

#[tokio::test]
async fn page_renders_are_per_visible_page() {
    let config = PipelineConfig::builder().renderer("pageMarkdown").build().unwrap();
    let result = run(config, vec![article_page(0), article_page(1)]).await.unwrap();
    let renders = result.output("page_renders").unwrap().as_array().unwrap();
    assert_eq!(renders.len(), 2);
    assert_eq!(renders[1]["page_id"], json!(1));
    assert!(renders[0]["markdown"].as_str().unwrap().contains("Introduction"));
}

#[tokio::test]
async fn conversion_is_deterministic() {
    let config = PipelineConfig::builder().renderer("markdown+chunks").build().unwrap();
    let first = run(config.clone(), vec![article_page(0), toc_page(1)]).await.unwrap();
    let second = run(config, vec![article_page(0), toc_page(1)]).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn conversion_with_llm_stub_is_deterministic() {
    let convert_once = || async {
        let service = Arc::new(StaticService::new(r#"{"corrections": []}"#));
        let config = PipelineConfig::builder()
            .use_llm(true)
            .llm_handle(service.clone())
            .llm_max_retries(0)
            .renderer("markdown+chunks")
            .build()
            .unwrap();
        let result = run(config, vec![article_page(0), toc_page(1)]).await.unwrap();
        (result, service.calls())
    };
    let (first, first_calls) = convert_once().await;
    let (second, second_calls) = convert_once().await;
    assert!(first_calls > 0);
    assert_eq!(first_calls, second_calls);
    assert_eq!(first, second);
}

#[tokio::test]
async fn selector_order_does_not_change_keys() {
    let a = PipelineConfig::builder().renderer("chunks+markdown").build().unwrap();
    let b = PipelineConfig::builder().renderer("markdown+chunks").build().unwrap();
    let a = run(a, vec![article_page(0)]).await.unwrap();
    let b = run(b, vec![article_page(0)]).await.unwrap();
    assert_eq!(a.keys(), b.keys());
    assert_eq!(a.markdown(), b.markdown());
}

#[tokio::test]
async fn single_page_markdown() {
    let config = PipelineConfig::builder().renderer("markdown").build().unwrap();
    let result = run(config, vec![article_page(0)]).await.unwrap();
    let md = result.markdown().unwrap();
    assert!(md.contains("# Introduction"), "{md}");
    assert!(md.contains("Pipelines turn documents into structured text"));
    assert!(md.contains("- builders detect layout"), "{md}");
    assert!(md.ends_with('\n'));
    assert_eq!(result.page_structure.len(), 1);
}

#[tokio::test]
async fn chunk_json_output_is_keyed_by_block_id() {
    let config = PipelineConfig::builder()
        .renderer("chunks")
        .output_json(true)
        .build()
        .unwrap();
    let result = run(config, vec![article_page(0)]).await.unwrap();
    let chunks = result.output("chunks").unwrap().as_object().unwrap();
    assert!(!chunks.is_empty());
    for (id, chunk) in chunks {
        let index = chunk["block_id"].as_u64().unwrap();
        assert!(id.ends_with(&format!("/{index}")), "{id} vs {index}");
        assert_eq!(chunk["page"], json!(0));
        assert!(chunk["markdown"].as_str().unwrap().ends_with('\n'));
    }
}

// ── Ignore list ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn ignored_toc_page_is_empty_and_left_out_of_markdown() {
    let config = PipelineConfig::builder()
        .renderer("markdown")
        .ignore_toc(true)
        .build()
        .unwrap();
    let result = run(config, vec![toc_page(0), article_page(1)]).await.unwrap();
    assert_eq!(result.page_structure[&0], Vec::<String>::new());
    assert!(!result.page_structure[&1].is_empty());
    let md = result.markdown().unwrap();
    assert!(!md.contains("Methods"), "{md}");
    assert!(md.contains("Introduction"));
}

#[tokio::test]
async fn toc_is_kept_without_ignore_flag() {
    let config = PipelineConfig::builder().renderer("markdown").build().unwrap();
    let result = run(config, vec![toc_page(0), article_page(1)]).await.unwrap();
    assert!(!result.page_structure[&0].is_empty());
    assert!(result.markdown().unwrap().contains("Methods"));
}

// ── Configuration errors ─────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_renderer_fails_before_any_work() {
    let err = PipelineConfig::builder()
        .renderer("pdf2html")
        .build()
        .and_then(|c| Converter::new(c, ArtifactBag::with_default_models()).map(|_| ()))
        .unwrap_err();
    assert!(matches!(err, ConvertError::Configuration(_)));
    assert!(err.to_string().contains("pdf2html"));
}

#[tokio::test]
async fn unknown_processor_is_a_configuration_error() {
    let config = PipelineConfig::builder()
        .processors(["order", "no_such_processor"])
        .build();
    let err = config
        .and_then(|c| Converter::new(c, ArtifactBag::with_default_models()).map(|_| ()))
        .unwrap_err();
    assert!(matches!(err, ConvertError::Configuration(_)));
}

// ── LLM service resolution ───────────────────────────────────────────────────

#[tokio::test]
async fn llm_required_without_service_is_missing_dependency() {
    let config = PipelineConfig::builder()
        .use_llm(true)
        .llm_fallback(LlmFallback::Require)
        .build()
        .unwrap();
    let err = Converter::new(config, ArtifactBag::with_default_models())
        .err()
        .unwrap();
    assert!(matches!(err, ConvertError::MissingDependency { .. }));
}

#[tokio::test]
async fn llm_default_fallback_installs_local_service() {
    let config = PipelineConfig::builder()
        .use_llm(true)
        .llm_fallback(LlmFallback::Default)
        .build()
        .unwrap();
    let converter = Converter::new(config, ArtifactBag::with_default_models()).unwrap();
    let service = converter.artifacts().llm().unwrap();
    assert!(service.name().starts_with("ollama"));
}

#[tokio::test]
async fn unusable_llm_answer_is_skipped() {
    let service = Arc::new(StaticService::new("this is not json"));
    let config = PipelineConfig::builder()
        .use_llm(true)
        .llm_handle(service.clone())
        .llm_max_retries(0)
        .processors(["order", "section_header", "llm_section_header"])
        .renderer("markdown")
        .build()
        .unwrap();
    let result = run(config, vec![article_page(0)]).await.unwrap();
    assert!(service.calls() >= 1);
    assert!(result.markdown().unwrap().contains("Introduction"));
}

// ── Input handling ───────────────────────────────────────────────────────────

#[tokio::test]
async fn bytes_input_converts_through_registry() {
    let config = PipelineConfig::builder().renderer("markdown").build().unwrap();
    let result = convert_from_bytes(&dump(&[article_page(0)]), &config).await.unwrap();
    assert!(result.markdown().unwrap().contains("Introduction"));
}

#[tokio::test]
async fn temp_input_is_removed_after_conversion() {
    let config = PipelineConfig::builder().renderer("markdown").build().unwrap();
    let converter = Converter::new(config, ArtifactBag::with_default_models()).unwrap();

    let mut temp = input::materialize(FileRef::Bytes(dump(&[article_page(0)]))).unwrap();
    let path = temp.path().to_path_buf();
    assert!(temp.is_temporary() && path.exists());

    converter.convert_input(&temp).await.unwrap();
    temp.cleanup();
    temp.cleanup();
    assert!(!path.exists());
}

#[tokio::test]
async fn temp_input_is_removed_after_failed_conversion() {
    let config = PipelineConfig::builder().renderer("markdown").build().unwrap();
    let converter = Converter::new(config, ArtifactBag::with_default_models()).unwrap();

    let mut temp = input::materialize(FileRef::Bytes(b"{ broken".to_vec())).unwrap();
    let path = temp.path().to_path_buf();
    let err = converter.convert_input(&temp).await.unwrap_err();
    assert!(matches!(err, ConvertError::Build { .. }));
    temp.cleanup();
    assert!(!path.exists());
}

/// Registry whose JSON factory records the path it was handed before
/// delegating, or failing when `fail` is set.
fn recording_registry(seen: Arc<Mutex<Option<PathBuf>>>, fail: bool) -> ProviderRegistry {
    let mut registry = ProviderRegistry::empty();
    registry.register(
        FileKind::Extracted,
        Arc::new(move |path: &Path, config: &PipelineConfig| {
            *seen.lock().unwrap() = Some(path.to_path_buf());
            if fail {
                return Err(ConvertError::Build {
                    stage: "provider".into(),
                    detail: "refused".into(),
                });
            }
            MemoryProvider::from_json_file(path, config)
                .map(|p| Box::new(p) as Box<dyn DocumentProvider>)
        }),
    );
    registry
}

#[tokio::test]
async fn facade_removes_its_temp_file() {
    for fail in [false, true] {
        let seen = Arc::new(Mutex::new(None));
        let config = PipelineConfig::builder().renderer("markdown").build().unwrap();
        let converter = Converter::new(config, ArtifactBag::with_default_models())
            .unwrap()
            .with_providers(recording_registry(seen.clone(), fail));

        let outcome = converter.convert(FileRef::Bytes(dump(&[article_page(0)]))).await;
        assert_eq!(outcome.is_err(), fail);

        let path = seen.lock().unwrap().clone().unwrap();
        assert!(!path.exists(), "{} left behind (fail={fail})", path.display());
    }
}

#[tokio::test]
async fn local_json_path_is_left_in_place() {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    file.write_all(&dump(&[article_page(0)])).unwrap();
    let config = PipelineConfig::builder().renderer("markdown").build().unwrap();
    let converter = Converter::new(config, ArtifactBag::with_default_models()).unwrap();
    converter.convert(file.path()).await.unwrap();
    assert!(file.path().exists());
}

#[tokio::test]
async fn missing_file_is_reported() {
    let err = Converter::new(PipelineConfig::default(), ArtifactBag::with_default_models())
        .unwrap()
        .convert(std::path::Path::new("/definitely/not/here.pdf"))
        .await
        .unwrap_err();
    assert!(matches!(err, ConvertError::FileNotFound { .. }));
}

#[test]
fn result_is_written_as_json_file() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("nested").join("result.json");
    let config = PipelineConfig::builder().renderer("markdown").build().unwrap();

    let result = tokio_test::block_on(async {
        let result = run(config, vec![article_page(0)]).await.unwrap();
        edgequake_docpipe::convert::write_json(&result, &out).await.unwrap();
        result
    });

    let written: Value = serde_json::from_slice(&std::fs::read(&out).unwrap()).unwrap();
    assert_eq!(written["markdown"], json!(result.markdown().unwrap()));
    assert!(written["page_structure"]["0"].is_array());
    assert!(!out.with_extension("json.tmp").exists());
}
