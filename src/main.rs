//! Application entry point: the `narrator` CLI.
//!
//! # Startup sequence
//!
//! 1. Parse arguments and initialise logging.
//! 2. Load [`AppConfig`] (defaults on first run) and apply CLI overrides.
//! 3. Create the tokio runtime (multi-thread, 2 workers).
//! 4. Start the progress bus with a [`LogSubscriber`].
//! 5. Run the orchestrator over the input document.  Ctrl-C cancels the run;
//!    items in flight finish and the partial results are still written.
//! 6. Stop the bus, print a summary and exit non-zero if extraction failed.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use narrator::{
    config::{AppConfig, SynthesisEngine},
    output::DirectorySink,
    pipeline::{Orchestrator, PipelineResult, RunContext, RunOptions},
    progress::{BusConfig, LogSubscriber, ProgressBus},
};

#[derive(Parser)]
#[command(name = "narrator")]
#[command(about = "Turn a Markdown or text document into narrated audio", long_about = None)]
struct Cli {
    /// Document to narrate (.md, .markdown or .txt)
    input: PathBuf,

    /// Output directory (default: <input stem>_narration next to the input)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Settings file to use instead of the per-user one
    #[arg(long)]
    config: Option<PathBuf>,

    /// Skip audio synthesis
    #[arg(long)]
    no_audio: bool,

    /// Skip image descriptions
    #[arg(long)]
    no_images: bool,

    /// Process items one at a time
    #[arg(long)]
    sequential: bool,

    /// Override the configured synthesis engine
    #[arg(long, value_enum)]
    engine: Option<EngineArg>,

    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum EngineArg {
    Tone,
    Api,
}

impl From<EngineArg> for SynthesisEngine {
    fn from(arg: EngineArg) -> Self {
        match arg {
            EngineArg::Tone => SynthesisEngine::Tone,
            EngineArg::Api => SynthesisEngine::Api,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // 1. Logging
    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<bool> {
    // 2. Configuration
    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load().unwrap_or_else(|e| {
            log::warn!("Failed to load config ({e:#}); using defaults");
            AppConfig::default()
        }),
    };
    if let Some(engine) = cli.engine {
        config.synthesis.engine = engine.into();
    }
    config.validate()?;

    let output = cli
        .output
        .clone()
        .unwrap_or_else(|| default_output_dir(&cli.input));
    let options = RunOptions {
        synthesize: !cli.no_audio,
        describe_images: !cli.no_images,
        sequential: cli.sequential,
    };

    // 3. Tokio runtime (2 worker threads; blocking work goes to the pool)
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    // 4. Progress bus
    let bus = ProgressBus::new(BusConfig::from(&config.progress));
    bus.subscribe(Arc::new(LogSubscriber::new()));
    bus.start().context("failed to start progress bus")?;

    // 5. Run
    log::info!(
        "narrator starting: {} → {}",
        cli.input.display(),
        output.display()
    );
    let ctx = RunContext::new(config, bus.clone());
    let orchestrator = Orchestrator::from_config(ctx);
    let sink = Arc::new(DirectorySink::new(&output));
    let result = rt.block_on(orchestrator.run_until_interrupted(
        &cli.input,
        sink,
        options,
        ctrl_c(),
    ));

    // 6. Shutdown
    let overall = bus.overall_stats();
    bus.stop();
    print_summary(&result, &output);
    println!(
        "Events: {} errors, {} warnings",
        overall.error_count, overall.warning_count
    );

    Ok(result.success)
}

/// Resolves on Ctrl-C.  Never resolves if the handler cannot be installed.
async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => log::warn!("Ctrl-C received; stopping after the items in flight"),
        Err(e) => {
            log::warn!("Cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await
        }
    }
}

fn default_output_dir(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".into());
    input
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!("{stem}_narration"))
}

fn print_summary(result: &PipelineResult, output: &Path) {
    if let Some(err) = &result.extraction_error {
        println!("Extraction failed: {err}");
        return;
    }
    if let Some(extraction) = &result.extraction {
        println!(
            "{}: {} chapters, {} words",
            extraction.title(),
            extraction.chapters.len(),
            extraction.word_count()
        );
    }
    if let Some(description) = &result.description {
        println!(
            "Images: {}/{} described, {} integrated",
            description.succeeded(),
            description.results.len(),
            result.integrated_images.len()
        );
    }
    if let Some(synthesis) = &result.synthesis {
        println!(
            "Audio: {}/{} items synthesised",
            synthesis.succeeded(),
            synthesis.results.len()
        );
        if let Some(err) = &synthesis.error_message {
            println!("  synthesis error: {err}");
        }
        if let Some(merged) = &synthesis.merged_file {
            println!("  audiobook: {}", merged.display());
        }
    }
    if let Some(err) = &result.artifacts_error {
        println!("Some artifacts were not written: {err}");
    }
    println!(
        "Output in {} ({:.1}s)",
        output.display(),
        result.total_elapsed.as_secs_f64()
    );
}
