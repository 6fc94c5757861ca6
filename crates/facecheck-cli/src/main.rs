use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use facecheck_core::search::{reverse_search_links, ImageRef};
use facecheck_core::{
    build_report, ingest, AggregateSummary, Aggregator, AnalysisRun, CancelToken, CsvRenderer,
    ImageId, JsonRenderer, ReportRenderer, Upload,
};
use facecheck_models::{FaceAnalyzer, ModelPaths};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

mod settings;

use settings::Settings;

#[derive(Parser)]
#[command(name = "facecheck", about = "Compare faces across photos and report their attributes")]
struct Cli {
    /// TOML settings file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze up to ten photos against a reference photo
    Analyze {
        /// JPEG or PNG files, in report order
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Position of the reference photo among IMAGES (1-based)
        #[arg(short, long, default_value_t = 1)]
        reference: u32,
        /// Report format
        #[arg(short, long, value_enum, default_value_t = Format::Csv)]
        format: Format,
        /// Write the report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print reverse image search links for a photo or image URL
    Links {
        image: String,
    },
    /// Show resolved settings and which model files are present
    Status,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Csv,
    Json,
}

impl Format {
    fn renderer(self) -> Box<dyn ReportRenderer> {
        match self {
            Format::Csv => Box::new(CsvRenderer),
            Format::Json => Box::new(JsonRenderer),
        }
    }
}

/// How long shutdown waits for blocking workers before abandoning them.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    run_detached(run(cli))?
}

/// Drive `future` on a fresh runtime, then shut down without waiting for
/// blocking inference whose results were already discarded.
fn run_detached<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting tokio runtime")?;
    let output = runtime.block_on(future);
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    Ok(output)
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Analyze { images, reference, format, output } => {
            let settings = Settings::load(cli.config.as_deref())?;
            analyze(settings, &images, reference, format, output.as_deref()).await?;
        }
        Commands::Links { image } => {
            let target = if image.starts_with("http://") || image.starts_with("https://") {
                ImageRef::Url(&image)
            } else {
                ImageRef::Local
            };
            for link in reverse_search_links(target) {
                println!("{}: {}", link.engine.name(), link.url);
            }
        }
        Commands::Status => {
            let settings = Settings::load(cli.config.as_deref())?;
            let paths = ModelPaths::in_dir(&settings.model_dir);
            let models: serde_json::Map<String, serde_json::Value> = paths
                .entries()
                .iter()
                .map(|(name, path)| {
                    let entry = serde_json::json!({ "path": path, "present": path.exists() });
                    (name.to_string(), entry)
                })
                .collect();
            let status = serde_json::json!({ "settings": settings, "models": models });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

async fn analyze(
    settings: Settings,
    paths: &[PathBuf],
    reference: u32,
    format: Format,
    output: Option<&Path>,
) -> Result<()> {
    let mut uploads = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        uploads.push(Upload::new(filename, bytes));
    }

    let batch = ingest(uploads, &settings.ingest)?;
    let mut run = AnalysisRun::new(batch, settings.analysis.clone());
    let reference = reference
        .checked_sub(1)
        .context("--reference is 1-based")?;
    run.select_reference(ImageId(reference))
        .context("selecting reference image")?;

    let model_paths = ModelPaths::in_dir(&settings.model_dir);
    let analysis = settings.analysis.clone();
    let analyzer = tokio::task::spawn_blocking(move || FaceAnalyzer::load(&model_paths, &analysis))
        .await?
        .context("loading face analysis models")?;
    let analyzer = Arc::new(analyzer);
    let aggregator = Aggregator::new(analyzer.clone(), analyzer, &settings.aggregator);

    let cancel = CancelToken::new();
    let interrupt = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, cancelling analysis");
                cancel.cancel();
            }
        }
    });
    let summary = aggregator.aggregate(&mut run, &cancel).await;
    interrupt.abort();
    let summary = summary?;

    let report = build_report(&run);
    let renderer = format.renderer();
    let bytes = renderer.render(&report).context("rendering report")?;

    match output {
        Some(path) => {
            let path = with_default_extension(path, renderer.file_extension());
            tokio::fs::write(&path, &bytes)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            tracing::info!(
                path = %path.display(),
                content_type = renderer.content_type(),
                bytes = bytes.len(),
                "report written"
            );
        }
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&bytes).await?;
            stdout.flush().await?;
        }
    }

    eprintln!("{}", summary_line(&run, &summary));
    Ok(())
}

fn with_default_extension(path: &Path, extension: &str) -> PathBuf {
    if path.extension().is_some() {
        path.to_path_buf()
    } else {
        path.with_extension(extension)
    }
}

fn summary_line(run: &AnalysisRun, summary: &AggregateSummary) -> String {
    let verified = run
        .comparisons()
        .values()
        .filter_map(|c| c.ok())
        .filter(|c| c.verified)
        .count();
    format!(
        "run {}: {} images ({} rejected), {} extracted ({} failed), {} compared ({} failed, {} verified), {} timed out, {} ms",
        run.id,
        run.images().len(),
        run.rejected().len(),
        summary.extracted,
        summary.extraction_failures,
        summary.compared,
        summary.comparison_failures,
        verified,
        summary.timed_out,
        summary.elapsed_ms,
    )
}
