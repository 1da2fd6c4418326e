//! The conversion facade: file in, [`RenderResult`] out.
//!
//! A [`Converter`] is built once per configuration. Construction does all
//! the work that can fail without touching the input: it resolves the LLM
//! service, builds the per-run block registry and resolves every builder,
//! processor and renderer. A missing dependency or an unknown stage name
//! therefore surfaces before any page is built.
//!
//! ## Steps of one conversion
//!
//! 1. Materialise the input (byte buffers go to a temp file)
//! 2. Open a provider for the file kind and run the builder chain, both
//!    inside `spawn_blocking` (pdfium is not async-safe)
//! 3. Run the processor chain
//! 4. Fan out to the renderers
//! 5. Remove the temp file, on every exit path
//!
//! Step 5 also runs when the conversion future is dropped mid-flight: the
//! [`TempInput`] guard removes its file on `Drop`.

use crate::builders::IgnoreList;
use crate::config::PipelineConfig;
use crate::error::ConvertError;
use crate::output::RenderResult;
use crate::pipeline::build::BuilderChain;
use crate::pipeline::input::{self, FileRef, TempInput};
use crate::pipeline::process::ProcessorChain;
use crate::pipeline::render::{selected_renderers, RendererFanOut};
use crate::pipeline::resolve::{ArtifactBag, Resolver};
use crate::processors::ProcessorKind;
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::providers::{DocumentProvider, ProviderRegistry};
use crate::renderers::RendererKind;
use crate::schema::{BlockRegistry, Document};
use crate::services::resolve_service;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// A configured pipeline, reusable across conversions.
pub struct Converter {
    config: Arc<PipelineConfig>,
    artifacts: ArtifactBag,
    providers: ProviderRegistry,
    registry: Arc<BlockRegistry>,
    ignore: IgnoreList,
    builders: Arc<BuilderChain>,
    processors: ProcessorChain,
    renderers: RendererFanOut,
    progress: ProgressCallback,
}

impl Converter {
    /// Resolve every stage of the pipeline against `artifacts`.
    ///
    /// # Errors
    /// - [`ConvertError::Configuration`] for unknown processor, renderer or
    ///   block class names
    /// - [`ConvertError::MissingDependency`] when a stage (or `use_llm`)
    ///   needs something neither the bag nor the options provide
    pub fn new(config: PipelineConfig, artifacts: ArtifactBag) -> Result<Self, ConvertError> {
        if artifacts.llm().is_none() {
            if let Some(service) = resolve_service(&config)? {
                artifacts.install_llm(service)?;
            }
        }

        let registry = Arc::new(BlockRegistry::from_named(&config.block_overrides)?);
        let ignore = IgnoreList::from_config(&config);

        let processor_kinds = match &config.processors {
            Some(names) => ProcessorKind::parse_list(names)?,
            None => ProcessorKind::DEFAULT_ORDER.to_vec(),
        };
        let renderer_kinds = selected_renderers(&config)?;

        let resolver = Resolver::new(&artifacts, &config);
        let builders = Arc::new(BuilderChain::resolve(&resolver)?);
        let processors =
            ProcessorChain::resolve(&resolver, &processor_kinds, config.processor_failure_policy)?;
        let renderers = RendererFanOut::resolve(&resolver, &renderer_kinds, &config)?;

        let progress = config
            .progress_callback
            .clone()
            .unwrap_or_else(|| Arc::new(NoopProgressCallback));

        debug!(
            "Resolved pipeline: {} processors, renderers {:?}",
            processors.len(),
            renderer_kinds
        );

        Ok(Self {
            config: Arc::new(config),
            artifacts,
            providers: ProviderRegistry::default(),
            registry,
            ignore,
            builders,
            processors,
            renderers,
            progress,
        })
    }

    /// Replace the file kind → provider table.
    pub fn with_providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = providers;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn artifacts(&self) -> &ArtifactBag {
        &self.artifacts
    }

    pub fn processor_names(&self) -> Vec<&'static str> {
        self.processors.names()
    }

    pub fn renderer_kinds(&self) -> Vec<RendererKind> {
        self.renderers.kinds()
    }

    /// Convert a path or an in-memory buffer.
    pub async fn convert(&self, file: impl Into<FileRef>) -> Result<RenderResult, ConvertError> {
        let mut input = input::materialize(file.into())?;
        let result = self.convert_path(&input).await;
        input.cleanup();
        result
    }

    /// Convert a file held by an already-materialised input. The caller
    /// keeps ownership of the input and its cleanup.
    pub async fn convert_input(&self, input: &TempInput) -> Result<RenderResult, ConvertError> {
        self.convert_path(input).await
    }

    async fn convert_path(&self, input: &TempInput) -> Result<RenderResult, ConvertError> {
        let path = input.path().to_path_buf();
        info!("Starting conversion: {}", path.display());
        let providers = self.providers.clone();
        let config = Arc::clone(&self.config);
        self.run(move || providers.open(&path, &config)).await
    }

    /// Convert from a provider the caller already opened.
    pub async fn convert_provider(
        &self,
        provider: Box<dyn DocumentProvider>,
    ) -> Result<RenderResult, ConvertError> {
        info!("Starting conversion: {}", provider.filepath().display());
        self.run(move || Ok(provider)).await
    }

    async fn run<F>(&self, open: F) -> Result<RenderResult, ConvertError>
    where
        F: FnOnce() -> Result<Box<dyn DocumentProvider>, ConvertError> + Send + 'static,
    {
        let start = Instant::now();

        let mut document = self.build(open).await?;
        let build_ms = start.elapsed().as_millis();

        self.processors
            .run(&mut document, self.progress.as_ref())
            .await?;

        let result = self.renderers.render(&document, self.progress.as_ref())?;
        self.progress.on_conversion_complete(&result.keys());

        info!(
            "Conversion complete: {} pages, build {}ms, total {}ms",
            document.pages.len(),
            build_ms,
            start.elapsed().as_millis()
        );
        Ok(result)
    }

    async fn build<F>(&self, open: F) -> Result<Document, ConvertError>
    where
        F: FnOnce() -> Result<Box<dyn DocumentProvider>, ConvertError> + Send + 'static,
    {
        let builders = Arc::clone(&self.builders);
        let ignore = self.ignore.clone();
        let registry = Arc::clone(&self.registry);
        let progress = Arc::clone(&self.progress);
        let stages = 4 + self.processors.len() + self.renderers.kinds().len();

        tokio::task::spawn_blocking(move || {
            let provider = open()?;
            progress.on_conversion_start(provider.page_count(), stages);
            builders.build(provider.as_ref(), &ignore, registry, progress.as_ref())
        })
        .await
        .map_err(|e| ConvertError::Internal(format!("Build task panicked: {e}")))?
    }
}

/// Convert a file with the bundled models.
///
/// # Example
/// ```rust,no_run
/// use edgequake_docpipe::{convert, PipelineConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = PipelineConfig::builder().renderer("markdown").build()?;
///     let result = convert("paper.pdf", &config).await?;
///     println!("{}", result.markdown().unwrap_or_default());
///     Ok(())
/// }
/// ```
pub async fn convert(
    file: impl AsRef<Path>,
    config: &PipelineConfig,
) -> Result<RenderResult, ConvertError> {
    Converter::new(config.clone(), ArtifactBag::with_default_models())?
        .convert(file.as_ref())
        .await
}

/// Convert in-memory file contents with the bundled models.
pub async fn convert_from_bytes(
    bytes: &[u8],
    config: &PipelineConfig,
) -> Result<RenderResult, ConvertError> {
    Converter::new(config.clone(), ArtifactBag::with_default_models())?
        .convert(bytes.to_vec())
        .await
}

/// Blocking wrapper around [`convert`].
///
/// Creates a tokio runtime internally. Do not call from inside an async
/// context.
pub fn convert_sync(
    file: impl AsRef<Path>,
    config: &PipelineConfig,
) -> Result<RenderResult, ConvertError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| ConvertError::Internal(format!("Failed to create tokio runtime: {e}")))?
        .block_on(convert(file, config))
}

/// Convert and write the render result as pretty JSON.
///
/// The file is written to a sibling temp path first and renamed into place.
pub async fn convert_to_file(
    file: impl AsRef<Path>,
    output_path: impl AsRef<Path>,
    config: &PipelineConfig,
) -> Result<RenderResult, ConvertError> {
    let result = convert(file, config).await?;
    write_json(&result, output_path.as_ref()).await?;
    Ok(result)
}

/// Write a render result as pretty JSON, atomically.
pub async fn write_json(result: &RenderResult, path: &Path) -> Result<(), ConvertError> {
    let write_failed = |e: std::io::Error| ConvertError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_failed)?;
    }
    let json = serde_json::to_vec_pretty(result)
        .map_err(|e| ConvertError::Internal(format!("Failed to serialise result: {e}")))?;
    let tmp: PathBuf = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await.map_err(write_failed)?;
    tokio::fs::rename(&tmp, path).await.map_err(write_failed)?;
    info!("Wrote {}", path.display());
    Ok(())
}
