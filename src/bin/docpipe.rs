//! CLI binary for edgequake-docpipe.
//!
//! A thin shim over the library crate: `convert` maps flags to a
//! `PipelineConfig` and prints the render result as JSON, `serve` starts
//! the HTTP surface.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use edgequake_docpipe::convert::write_json;
use edgequake_docpipe::pipeline::input;
use edgequake_docpipe::{
    serve, ArtifactBag, Converter, LlmFallback, PipelineConfig, ProgressCallback, RenderResult,
    ServerState, StageCategory, StageProgressCallback,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One bar over every stage of the run: builders, processors, renderers.
struct CliProgressCallback {
    bar: ProgressBar,
    skipped: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Preparing");
        bar.set_message("Opening document…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            skipped: AtomicUsize::new(0),
        })
    }
}

impl StageProgressCallback for CliProgressCallback {
    fn on_conversion_start(&self, total_pages: usize, total_stages: usize) {
        self.bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}/{len} stages  {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS),
        );
        self.bar.set_length(total_stages as u64);
        self.bar.set_prefix("Converting");
        self.bar
            .println(format!("{} {}", green("◆"), bold(&format!("{total_pages} pages"))));
    }

    fn on_stage_start(&self, category: StageCategory, stage: &str) {
        self.bar.set_message(format!("{category} {stage}"));
    }

    fn on_stage_complete(&self, _category: StageCategory, _stage: &str) {
        self.bar.inc(1);
    }

    fn on_stage_skipped(&self, category: StageCategory, stage: &str, error: &str) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} {category} {stage} skipped  {}",
            yellow("⚠"),
            dim(error)
        ));
        self.bar.inc(1);
    }

    fn on_conversion_complete(&self, output_keys: &[String]) {
        self.bar.finish_and_clear();
        let skipped = self.skipped.load(Ordering::SeqCst);
        eprintln!(
            "{} produced {}{}",
            green("✔"),
            bold(&output_keys.join(", ")),
            if skipped > 0 {
                format!("  ({skipped} stages skipped)")
            } else {
                String::new()
            }
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Default outputs (page markdown + chunks) as JSON on stdout
  docpipe convert document.pdf

  # Unified markdown only, written to a file
  docpipe convert --renderer markdown document.pdf -o result.json

  # Several renderers, in order
  docpipe convert --renderer pageMarkdown+markdown+chunks document.pdf

  # LLM-assisted processors through a local Ollama
  docpipe convert --use-llm --llm-service ollama --llm-model llama3.2:latest paper.pdf

  # Only some processors
  docpipe convert --processors order,line_merge,section_header,table paper.pdf

  # HTTP service
  docpipe serve --addr 0.0.0.0:8000

RENDERERS:
  pageMarkdown   markdown per page       → "page_renders"
  markdown       one markdown document   → "markdown"
  chunks         flat block chunks       → "chunks"
"#;

/// Run documents through the builder, processor and renderer pipeline.
#[derive(Parser, Debug)]
#[command(
    name = "docpipe",
    version,
    about = "Convert PDF documents through a pluggable builder/processor/renderer pipeline",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "DOCPIPE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "DOCPIPE_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert one document and print the render result as JSON.
    Convert(ConvertArgs),
    /// Serve `POST /parse-pdf/` over HTTP.
    Serve {
        /// Address to listen on.
        #[arg(long, env = "DOCPIPE_ADDR", default_value = "127.0.0.1:8000")]
        addr: String,
    },
}

#[derive(clap::Args, Debug)]
struct ConvertArgs {
    /// Local file path (PDF or extracted JSON) or HTTP/HTTPS URL.
    input: String,

    /// Write the JSON result to this file instead of stdout.
    #[arg(short, long, env = "DOCPIPE_OUTPUT")]
    output: Option<PathBuf>,

    /// Renderer selector, e.g. `pageMarkdown+chunks`.
    #[arg(long, env = "DOCPIPE_RENDERER")]
    renderer: Option<String>,

    /// Comma-separated processor names replacing the default order.
    #[arg(long, value_delimiter = ',')]
    processors: Option<Vec<String>>,

    /// Enable LLM-assisted processors.
    #[arg(long, env = "DOCPIPE_USE_LLM")]
    use_llm: bool,

    /// LLM service: ollama, openai, anthropic, gemini, azure, ...
    #[arg(long, env = "DOCPIPE_LLM_SERVICE")]
    llm_service: Option<String>,

    /// Base URL of the LLM service (Ollama).
    #[arg(long, env = "DOCPIPE_LLM_BASE_URL")]
    llm_base_url: Option<String>,

    /// LLM model ID.
    #[arg(long, env = "DOCPIPE_LLM_MODEL")]
    llm_model: Option<String>,

    /// With --use-llm and no service, fall back to a local Ollama instead of failing.
    #[arg(long)]
    llm_default: bool,

    /// Run the OCR builder on regions without text. Needs an `ocr_model` artifact.
    #[arg(long)]
    enable_ocr: bool,

    /// Hide a detected table of contents (and its page).
    #[arg(long)]
    ignore_toc: bool,

    /// Also hide every page before the table of contents.
    #[arg(long)]
    ignore_before_toc: bool,

    /// Page selection, 1-indexed: all, 5, 3-15, or 1,3,5,7.
    #[arg(long, default_value = "all")]
    pages: String,

    /// Insert page separators into unified markdown.
    #[arg(long)]
    paginate: bool,

    /// Attach per-page debug data to the metadata.
    #[arg(long)]
    debug: bool,

    /// Disable progress bar.
    #[arg(long, env = "DOCPIPE_NO_PROGRESS")]
    no_progress: bool,

    /// HTTP download timeout in seconds.
    #[arg(long, default_value_t = 120)]
    download_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let show_progress = matches!(&cli.command, Command::Convert(a) if !a.no_progress) && !cli.quiet;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Serve { addr } => serve(&addr, ServerState::default())
            .await
            .with_context(|| format!("Server on {addr} stopped")),
        Command::Convert(args) => {
            let progress: Option<ProgressCallback> = if show_progress {
                Some(CliProgressCallback::new() as Arc<dyn StageProgressCallback>)
            } else {
                None
            };
            run_convert(args, progress).await
        }
    }
}

async fn run_convert(args: ConvertArgs, progress: Option<ProgressCallback>) -> Result<()> {
    let config = build_config(&args, progress)?;
    let converter = Converter::new(config, ArtifactBag::with_default_models())
        .context("Invalid pipeline configuration")?;

    let outcome = if input::is_url(&args.input) {
        let mut file = input::download(&args.input, args.download_timeout, false)
            .await
            .context("Download failed")?;
        let result = converter.convert_input(&file).await;
        file.cleanup();
        result
    } else {
        converter.convert(PathBuf::from(&args.input)).await
    };
    let result: RenderResult = outcome.context("Conversion failed")?;

    match &args.output {
        Some(path) => write_json(&result, path)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => {
            let json = serde_json::to_string_pretty(&result).context("Failed to serialise output")?;
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            handle
                .write_all(json.as_bytes())
                .and_then(|_| handle.write_all(b"\n"))
                .context("Failed to write to stdout")?;
        }
    }
    Ok(())
}

/// Map CLI args to `PipelineConfig`.
fn build_config(args: &ConvertArgs, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .use_llm(args.use_llm)
        .disable_ocr(!args.enable_ocr)
        .ignore_toc(args.ignore_toc)
        .ignore_before_toc(args.ignore_before_toc)
        .paginate_output(args.paginate)
        .debug(args.debug)
        .download_timeout_secs(args.download_timeout);

    if args.llm_default {
        builder = builder.llm_fallback(LlmFallback::Default);
    }
    if let Some(s) = &args.llm_service {
        builder = builder.llm_service(s.clone());
    }
    if let Some(url) = &args.llm_base_url {
        builder = builder.llm_base_url(url.clone());
    }
    if let Some(model) = &args.llm_model {
        builder = builder.llm_model(model.clone());
    }
    if let Some(renderer) = &args.renderer {
        builder = builder.renderer(renderer.clone());
    }
    if let Some(list) = &args.processors {
        builder = builder.processors(list.iter().cloned());
    }
    if let Some(pages) = parse_pages(&args.pages)? {
        builder = builder.page_range(pages);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Parse `--pages` (1-indexed) into 0-indexed page ids; `None` means all.
fn parse_pages(s: &str) -> Result<Option<Vec<usize>>> {
    let s = s.trim().to_lowercase();
    if s == "all" {
        return Ok(None);
    }

    let one = |p: &str| -> Result<usize> {
        let page: usize = p
            .trim()
            .parse()
            .with_context(|| format!("Invalid page number: '{}'", p.trim()))?;
        if page < 1 {
            anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", page);
        }
        Ok(page - 1)
    };

    if let Some((start, end)) = s.split_once('-') {
        let (start, end) = (one(start)?, one(end)?);
        if start > end {
            anyhow::bail!("Invalid page range '{s}': start must be <= end");
        }
        return Ok(Some((start..=end).collect()));
    }

    s.split(',').map(one).collect::<Result<Vec<_>>>().map(Some)
}
