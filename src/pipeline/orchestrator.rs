//! Orchestrator: drives one document through the whole pipeline.
//!
//! # Run flow
//!
//! ```text
//! run_complete()
//!   ├─ spawn_blocking(extractor.extract)          [extraction]
//!   │     └─ Err → PipelineResult { success: false, .. }   (nothing else runs)
//!   ├─ tokio::spawn(description batch)  ─┐        [description]
//!   ├─ tokio::spawn(synthesis batch)    ─┤        [synthesis]
//!   │                                     └─ join both; a failed side becomes
//!   │                                        an outcome with `error_message`
//!   ├─ integrate_descriptions()                    [integration]
//!   └─ spawn_blocking(write text, summary, report) [final_output]
//! ```
//!
//! Synthesis reads the chapters as extracted.  Descriptions are spliced in
//! afterwards, so they reach the written text but not the audio.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::task::JoinError;

use crate::batch::{BatchItem, BatchItemResult, BatchRunner, ExecutionMode};
use crate::config::{AppConfig, AppPaths, DescriptionConfig};
use crate::describe::{
    ApiDescriber, CachedDescriber, DescriptionCache, ImageDescriber, ImageDescription,
    RetryingDescriber,
};
use crate::extract::{Chapter, DocumentExtractor, ExtractionResult, ImageRef, MarkdownExtractor};
use crate::output::{
    audio_file_name, render_report, ChapterSummary, FailedItem, ImageEntry, ImageSummary,
    ConfigSnapshot, OutputSink, RunSummary, SynthesisSummary, MERGED_STEM, TEXT_FILE,
};
use crate::progress::{PipelineKind, ProgressEvent};
use crate::synth::{
    chunk_text, config_factory, prepare_for_speech, BackendFactory, DegradationLevel,
    DegradingBackend, FaultSignatures, RetryPolicy, SynthesisBackend,
};

use super::context::RunContext;
use super::integrate::integrate_descriptions;

// ---------------------------------------------------------------------------
// Options and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub synthesize: bool,
    pub describe_images: bool,
    /// Force one-at-a-time processing in both batches.
    pub sequential: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            synthesize: true,
            describe_images: true,
            sequential: false,
        }
    }
}

#[derive(Debug)]
pub struct SynthesisOutcome {
    /// One result per synthesised chunk; the output is the written file.
    pub results: Vec<BatchItemResult<PathBuf>>,
    pub merged_file: Option<PathBuf>,
    pub error_message: Option<String>,
    pub final_level: Option<DegradationLevel>,
    pub elapsed: Duration,
}

impl SynthesisOutcome {
    fn failed(message: String, elapsed: Duration) -> Self {
        Self {
            results: Vec::new(),
            merged_file: None,
            error_message: Some(message),
            final_level: None,
            elapsed,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }
}

#[derive(Debug)]
pub struct DescriptionOutcome {
    /// One result per distinct image; `item_id` is the image file name.
    pub results: Vec<BatchItemResult<ImageDescription>>,
    pub error_message: Option<String>,
    pub elapsed: Duration,
}

impl DescriptionOutcome {
    fn failed(message: String, elapsed: Duration) -> Self {
        Self {
            results: Vec::new(),
            error_message: Some(message),
            elapsed,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    /// `(image name, description)` for every successful item.
    fn descriptions(&self) -> Vec<(String, ImageDescription)> {
        self.results
            .iter()
            .filter_map(|r| r.output.clone().map(|d| (r.item_id.clone(), d)))
            .collect()
    }
}

/// Everything a run produced.  `success` is true whenever extraction
/// succeeded, even if a sub-pipeline failed.
#[derive(Debug)]
pub struct PipelineResult {
    pub success: bool,
    pub extraction: Option<ExtractionResult>,
    pub extraction_error: Option<String>,
    pub synthesis: Option<SynthesisOutcome>,
    pub description: Option<DescriptionOutcome>,
    /// Names of images whose description was spliced into the text.
    pub integrated_images: Vec<String>,
    /// Seconds per stage.
    pub stage_timings: BTreeMap<String, f64>,
    pub total_elapsed: Duration,
    pub artifacts_error: Option<String>,
}

impl PipelineResult {
    fn extraction_failed(message: String, total_elapsed: Duration) -> Self {
        Self {
            success: false,
            extraction: None,
            extraction_error: Some(message),
            synthesis: None,
            description: None,
            integrated_images: Vec::new(),
            stage_timings: BTreeMap::new(),
            total_elapsed,
            artifacts_error: None,
        }
    }
}

/// Stage keys in `stage_timings`.
pub const STAGES: [&str; 5] = [
    "extraction",
    "description",
    "synthesis",
    "integration",
    "final_output",
];

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    ctx: RunContext,
    extractor: Arc<dyn DocumentExtractor>,
    describer: Option<Arc<dyn ImageDescriber>>,
    backends: Option<BackendFactory>,
}

impl Orchestrator {
    /// Extraction only; add a describer and backends with the builders.
    pub fn new(ctx: RunContext, extractor: Arc<dyn DocumentExtractor>) -> Self {
        Self {
            ctx,
            extractor,
            describer: None,
            backends: None,
        }
    }

    /// Markdown extraction, the vision API describer when enabled and
    /// backends built from the synthesis config.
    pub fn from_config(ctx: RunContext) -> Self {
        let describer = ctx
            .config
            .description
            .enabled
            .then(|| describer_chain(&ctx.config.description, &AppPaths::new().cache_dir));
        let backends = config_factory(ctx.config.synthesis.clone());
        Self {
            describer,
            backends: Some(backends),
            ..Self::new(ctx, Arc::new(MarkdownExtractor::new()))
        }
    }

    pub fn with_describer(mut self, describer: Arc<dyn ImageDescriber>) -> Self {
        self.describer = Some(describer);
        self
    }

    pub fn with_backends(mut self, backends: BackendFactory) -> Self {
        self.backends = Some(backends);
        self
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Run extraction, description and synthesis for `document` and write
    /// the artifacts through `sink`.
    pub async fn run_complete(
        &self,
        document: &Path,
        sink: Arc<dyn OutputSink>,
        options: RunOptions,
    ) -> PipelineResult {
        let run_started = Instant::now();
        let bus = &self.ctx.bus;
        bus.emit(ProgressEvent::info(
            PipelineKind::Overall,
            format!("run started: {}", document.display()),
        ));
        log::info!("pipeline: processing {}", document.display());

        // ---- extraction ----
        let stage = Instant::now();
        let mut extraction = match self.extract(document).await {
            Ok(extraction) => extraction,
            Err(message) => {
                log::error!("pipeline: extraction failed: {message}");
                bus.emit(ProgressEvent::info(PipelineKind::Overall, "run aborted"));
                return PipelineResult::extraction_failed(message, run_started.elapsed());
            }
        };
        let mut timings = BTreeMap::new();
        timings.insert("extraction".to_string(), stage.elapsed().as_secs_f64());
        log::info!(
            "pipeline: extracted {} chapters, {} words, {} images",
            extraction.chapters.len(),
            extraction.word_count(),
            extraction.images.len()
        );

        // ---- description ‖ synthesis ----
        let description_task = self.spawn_description(&extraction, options);
        let synthesis_task = self.spawn_synthesis(&extraction, Arc::clone(&sink), options);

        let description = match description_task {
            Some((started, handle)) => Some(
                handle
                    .await
                    .unwrap_or_else(|e| DescriptionOutcome::failed(task_failure(&e), started.elapsed())),
            ),
            None => None,
        };
        let synthesis = match synthesis_task {
            Some((started, handle)) => Some(
                handle
                    .await
                    .unwrap_or_else(|e| SynthesisOutcome::failed(task_failure(&e), started.elapsed())),
            ),
            None => None,
        };
        for (kind, err) in [
            (PipelineKind::Description, description.as_ref().and_then(|d| d.error_message.as_deref())),
            (PipelineKind::Synthesis, synthesis.as_ref().and_then(|s| s.error_message.as_deref())),
        ] {
            if let Some(err) = err {
                log::warn!("pipeline: {kind} failed: {err}");
                bus.emit(ProgressEvent::error(kind, err, None));
            }
        }
        timings.insert(
            "description".to_string(),
            description.as_ref().map_or(0.0, |d| d.elapsed.as_secs_f64()),
        );
        timings.insert(
            "synthesis".to_string(),
            synthesis.as_ref().map_or(0.0, |s| s.elapsed.as_secs_f64()),
        );

        // ---- integration ----
        let stage = Instant::now();
        let integrated_images = match &description {
            Some(outcome) => integrate_descriptions(
                &mut extraction,
                &outcome.descriptions(),
                self.ctx.config.description.min_confidence,
            ),
            None => Vec::new(),
        };
        timings.insert("integration".to_string(), stage.elapsed().as_secs_f64());

        // ---- final output ----
        let stage = Instant::now();
        let summary = build_summary(
            &self.ctx.config,
            &extraction,
            description.as_ref(),
            &integrated_images,
            synthesis.as_ref(),
            &timings,
        );
        let artifacts_error = self.write_artifacts(sink, &extraction.text, summary).await;
        if let Some(err) = &artifacts_error {
            log::error!("pipeline: writing artifacts failed: {err}");
            bus.emit(ProgressEvent::warning(PipelineKind::Overall, err.clone(), None));
        }
        timings.insert("final_output".to_string(), stage.elapsed().as_secs_f64());

        let total_elapsed = run_started.elapsed();
        bus.emit(ProgressEvent::info(
            PipelineKind::Overall,
            format!("run finished in {:.1}s", total_elapsed.as_secs_f64()),
        ));
        log::info!("pipeline: done in {:.1}s", total_elapsed.as_secs_f64());

        PipelineResult {
            success: true,
            extraction: Some(extraction),
            extraction_error: None,
            synthesis,
            description,
            integrated_images,
            stage_timings: timings,
            total_elapsed,
            artifacts_error,
        }
    }

    /// [`run_complete`](Self::run_complete), cancelled when `interrupt`
    /// resolves first.  Items already in flight finish and the partial result
    /// is still written and returned.
    pub async fn run_until_interrupted<F>(
        &self,
        document: &Path,
        sink: Arc<dyn OutputSink>,
        options: RunOptions,
        interrupt: F,
    ) -> PipelineResult
    where
        F: Future<Output = ()>,
    {
        let run = self.run_complete(document, sink, options);
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => result,
            () = interrupt => {
                log::warn!("pipeline: interrupted; finishing items already in flight");
                self.ctx.bus.emit(ProgressEvent::warning(PipelineKind::Overall, "interrupted", None));
                self.ctx.cancel();
                run.await
            }
        }
    }

    async fn extract(&self, document: &Path) -> Result<ExtractionResult, String> {
        let bus = &self.ctx.bus;
        let label = document
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| document.display().to_string());
        bus.emit(ProgressEvent::start(PipelineKind::Extraction, Some(1), Some(&label)));

        let extractor = Arc::clone(&self.extractor);
        let path = document.to_path_buf();
        let outcome = tokio::task::spawn_blocking(move || extractor.extract(&path))
            .await
            .map_err(|e| task_failure(&e))
            .and_then(|r| r.map_err(|e| e.to_string()));

        match &outcome {
            Ok(_) => bus.emit(ProgressEvent::complete(
                PipelineKind::Extraction,
                Some(&label),
                Some(&label),
            )),
            Err(message) => {
                bus.emit(ProgressEvent::error(PipelineKind::Extraction, message.clone(), Some(&label)))
            }
        }
        outcome
    }

    fn spawn_description(
        &self,
        extraction: &ExtractionResult,
        options: RunOptions,
    ) -> Option<(Instant, tokio::task::JoinHandle<DescriptionOutcome>)> {
        let config = &self.ctx.config.description;
        if !options.describe_images || !config.enabled || extraction.images.is_empty() {
            return None;
        }
        let Some(describer) = self.describer.clone() else {
            log::info!("pipeline: no image describer configured; skipping descriptions");
            return None;
        };

        let items = image_items(&extraction.images);
        let mode = if options.sequential {
            ExecutionMode::Sequential {
                delay: Duration::ZERO,
            }
        } else {
            ExecutionMode::parallel(config.max_workers)
        };
        let runner = BatchRunner::new(
            self.ctx.bus.clone(),
            PipelineKind::Description,
            self.ctx.cancel.clone(),
        );

        let started = Instant::now();
        let handle = tokio::spawn(async move {
            let results = runner
                .run(items, mode, move |image: &ImageRef| {
                    describer.describe(&image.path, &image.context)
                })
                .await;
            DescriptionOutcome {
                results,
                error_message: None,
                elapsed: started.elapsed(),
            }
        });
        Some((started, handle))
    }

    fn spawn_synthesis(
        &self,
        extraction: &ExtractionResult,
        sink: Arc<dyn OutputSink>,
        options: RunOptions,
    ) -> Option<(Instant, tokio::task::JoinHandle<SynthesisOutcome>)> {
        if !options.synthesize {
            return None;
        }
        let config = &self.ctx.config;
        let started = Instant::now();

        let backend = self.backends.clone().and_then(|factory| {
            DegradingBackend::new(
                factory,
                RetryPolicy::from_config(&config.synthesis),
                FaultSignatures::from_config(&config.synthesis),
            )
        });
        let Some(backend) = backend.map(Arc::new) else {
            let outcome =
                SynthesisOutcome::failed("no synthesis backend available".into(), Duration::ZERO);
            return Some((started, tokio::spawn(async move { outcome })));
        };

        let items = synthesis_items(
            &extraction.chapters,
            config.synthesis.max_chunk_chars,
            backend.file_extension(),
        );
        let mode = if options.sequential || !config.synthesis.parallel || !backend.parallel_safe()
        {
            ExecutionMode::Sequential {
                delay: backend.inter_item_delay(),
            }
        } else {
            ExecutionMode::parallel(config.synthesis.max_workers)
        };
        let merged_name = config
            .output
            .merge_audio
            .then(|| format!("{MERGED_STEM}.{}", backend.file_extension()));
        let voice = config.synthesis.voice.clone();
        let speed = config.synthesis.speed;
        let runner = BatchRunner::new(
            self.ctx.bus.clone(),
            PipelineKind::Synthesis,
            self.ctx.cancel.clone(),
        );
        let bus = self.ctx.bus.clone();

        let handle = tokio::spawn(async move {
            let worker_backend = Arc::clone(&backend);
            let worker_sink = Arc::clone(&sink);
            let results = runner
                .run(items, mode, move |job: &SynthesisJob| {
                    let audio = worker_backend
                        .synthesize(&job.text, &voice, speed)
                        .map_err(|e| e.to_string())?;
                    worker_sink
                        .write_audio(&job.file_name, &audio)
                        .map_err(|e| e.to_string())
                })
                .await;

            let parts: Vec<PathBuf> = results.iter().filter_map(|r| r.output.clone()).collect();
            let merged_file = match merged_name {
                Some(name) if !parts.is_empty() => {
                    let merged = tokio::task::spawn_blocking(move || sink.merge_audio(&parts, &name))
                        .await
                        .map_err(|e| task_failure(&e))
                        .and_then(|r| r.map_err(|e| e.to_string()));
                    match merged {
                        Ok(path) => Some(path),
                        Err(err) => {
                            log::warn!("pipeline: merging audio failed: {err}");
                            bus.emit(ProgressEvent::warning(
                                PipelineKind::Synthesis,
                                format!("merging audio failed: {err}"),
                                None,
                            ));
                            None
                        }
                    }
                }
                _ => None,
            };

            let final_level = backend.level();
            if final_level > DegradationLevel::Primary {
                log::warn!("pipeline: synthesis finished at level {final_level}");
            }
            SynthesisOutcome {
                results,
                merged_file,
                error_message: None,
                final_level: Some(final_level),
                elapsed: started.elapsed(),
            }
        });
        Some((started, handle))
    }

    /// Write the text, summary and report; returns the joined error messages
    /// of whatever failed.
    async fn write_artifacts(
        &self,
        sink: Arc<dyn OutputSink>,
        text: &str,
        summary: RunSummary,
    ) -> Option<String> {
        let text = self.ctx.config.output.write_text.then(|| text.to_string());
        let written = tokio::task::spawn_blocking(move || {
            let mut errors = Vec::new();
            if let Some(text) = text {
                if let Err(e) = sink.write_text(TEXT_FILE, &text) {
                    errors.push(e.to_string());
                }
            }
            if let Err(e) = sink.write_summary(&summary) {
                errors.push(e.to_string());
            }
            if let Err(e) = sink.write_report(&render_report(&summary)) {
                errors.push(e.to_string());
            }
            errors
        })
        .await;

        match written {
            Ok(errors) if errors.is_empty() => None,
            Ok(errors) => Some(errors.join("; ")),
            Err(e) => Some(task_failure(&e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// One chunk of chapter text to synthesise into `file_name`.
#[derive(Debug, Clone)]
struct SynthesisJob {
    text: String,
    file_name: String,
}

fn synthesis_items(chapters: &[Chapter], max_chars: usize, ext: &str) -> Vec<BatchItem<SynthesisJob>> {
    let mut items = Vec::new();
    for chapter in chapters {
        let chunks = chunk_text(&prepare_for_speech(&chapter.content), max_chars);
        let split = chunks.len() > 1;
        for (index, text) in chunks.into_iter().enumerate() {
            let part = split.then_some(index + 1);
            let (id, label) = match part {
                Some(part) => (
                    format!("ch{:03}_p{part:02}", chapter.number),
                    format!("{} (part {part})", chapter.title),
                ),
                None => (format!("ch{:03}", chapter.number), chapter.title.clone()),
            };
            let file_name = audio_file_name(chapter.number, &chapter.title, part, ext);
            items.push(BatchItem::new(id, label, SynthesisJob { text, file_name }));
        }
    }
    items
}

/// One item per distinct image file name, keyed by that name.
fn image_items(images: &[ImageRef]) -> Vec<BatchItem<ImageRef>> {
    let mut seen = HashSet::new();
    images
        .iter()
        .filter(|image| seen.insert(image.name()))
        .map(|image| BatchItem::new(image.name(), image.name(), image.clone()))
        .collect()
}

/// Vision API describer wrapped in retries and, when enabled, the on-disk
/// cache in `cache_dir`.  A cache that cannot be opened is skipped.
fn describer_chain(config: &DescriptionConfig, cache_dir: &Path) -> Arc<dyn ImageDescriber> {
    let api: Arc<dyn ImageDescriber> = Arc::new(ApiDescriber::from_config(config));
    let retrying: Arc<dyn ImageDescriber> = Arc::new(RetryingDescriber::from_config(api, config));
    if !config.cache_enabled {
        return retrying;
    }
    match DescriptionCache::open(cache_dir) {
        Ok(cache) => {
            if let Err(e) = cache.clear_old_entries(config.cache_max_age_days) {
                log::warn!("pipeline: pruning the description cache failed: {e}");
            }
            Arc::new(CachedDescriber::new(retrying, Arc::new(cache)))
        }
        Err(e) => {
            log::warn!(
                "pipeline: description cache unavailable at {}: {e}",
                cache_dir.display()
            );
            retrying
        }
    }
}

fn task_failure(e: &JoinError) -> String {
    if e.is_panic() {
        "task panicked".to_string()
    } else {
        format!("task failed: {e}")
    }
}

fn build_summary(
    config: &AppConfig,
    extraction: &ExtractionResult,
    description: Option<&DescriptionOutcome>,
    integrated: &[String],
    synthesis: Option<&SynthesisOutcome>,
    timings: &BTreeMap<String, f64>,
) -> RunSummary {
    let images = description.map(|outcome| {
        let entries = outcome
            .results
            .iter()
            .map(|r| ImageEntry {
                image: r.item_id.clone(),
                description: r.output.as_ref().map(|d| d.text.clone()),
                confidence: r.output.as_ref().map(|d| d.confidence),
                model: r.output.as_ref().map(|d| d.model.clone()),
                integrated: integrated.contains(&r.item_id),
                error: r.error_message.clone(),
            })
            .collect();
        ImageSummary::from_entries(entries, outcome.error_message.clone())
    });

    let synthesis = synthesis.map(|outcome| SynthesisSummary {
        total_items: outcome.results.len(),
        succeeded: outcome.succeeded(),
        failed: outcome
            .results
            .iter()
            .filter(|r| !r.success)
            .map(|r| FailedItem {
                item_id: r.item_id.clone(),
                error: r.error_message.clone().unwrap_or_default(),
            })
            .collect(),
        audio_files: outcome
            .results
            .iter()
            .filter_map(|r| r.output.as_ref().map(|p| p.display().to_string()))
            .collect(),
        merged_file: outcome.merged_file.as_ref().map(|p| p.display().to_string()),
        final_level: outcome.final_level,
        error_message: outcome.error_message.clone(),
    });

    RunSummary {
        title: extraction.title().to_string(),
        metadata: extraction.metadata.clone(),
        chapters: extraction.chapters.iter().map(ChapterSummary::from).collect(),
        total_words: extraction.word_count(),
        total_characters: extraction.text.chars().count(),
        images,
        synthesis,
        config: ConfigSnapshot::from(config),
        stage_timings: timings.clone(),
        generated_at: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::describe::MockDescriber;
    use crate::extract::StaticExtractor;
    use crate::output::{MemorySink, REPORT_FILE, SUMMARY_FILE};
    use crate::progress::{BusConfig, ProgressBus};
    use crate::synth::{BackendVariant, ScriptedBackend, SynthesisError};

    fn book(chapters: &[(&str, &str)], images: &[&str]) -> ExtractionResult {
        let chapters: Vec<Chapter> = chapters
            .iter()
            .enumerate()
            .map(|(i, (title, body))| Chapter::new(i + 1, *title, *body))
            .collect();
        let text = chapters
            .iter()
            .map(|c| c.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        ExtractionResult {
            text,
            chapters,
            metadata: [("title".to_string(), "Test Book".to_string())].into(),
            images: images
                .iter()
                .map(|name| ImageRef {
                    path: PathBuf::from(name),
                    context: String::new(),
                })
                .collect(),
        }
    }

    fn primary_only(backend: Arc<ScriptedBackend>) -> BackendFactory {
        Arc::new(move |variant| match variant {
            BackendVariant::Primary => Some(Arc::clone(&backend) as Arc<dyn SynthesisBackend>),
            _ => None,
        })
    }

    fn context() -> RunContext {
        let mut config = AppConfig::default();
        config.synthesis.retry_base_ms = 1;
        config.synthesis.cleanup_pause_ms = 0;
        RunContext::new(config, ProgressBus::new(BusConfig::default()))
    }

    #[tokio::test]
    async fn extraction_failure_stops_the_run() {
        let backend = Arc::new(ScriptedBackend::ok("primary"));
        let orchestrator = Orchestrator::new(context(), Arc::new(StaticExtractor::failing()))
            .with_describer(Arc::new(MockDescriber::new(0.9)))
            .with_backends(primary_only(Arc::clone(&backend)));
        let sink = Arc::new(MemorySink::new());

        let result = orchestrator
            .run_complete(Path::new("missing.md"), sink.clone(), RunOptions::default())
            .await;

        assert!(!result.success);
        assert!(result.extraction_error.is_some());
        assert!(result.extraction.is_none());
        assert!(result.synthesis.is_none());
        assert!(result.description.is_none());
        assert_eq!(backend.call_count(), 0);
        assert!(sink.names().is_empty());
    }

    #[tokio::test]
    async fn full_run_writes_integrated_text_and_audio() {
        let extraction = book(
            &[
                ("Harbour", "Boats rest. [IMAGE: boat.png] Gulls call."),
                ("Storm", "Waves rise over the wall."),
            ],
            &["boat.png"],
        );
        let backend = Arc::new(ScriptedBackend::ok("primary"));
        let orchestrator = Orchestrator::new(context(), Arc::new(StaticExtractor::ok(extraction)))
            .with_describer(Arc::new(MockDescriber::new(0.9)))
            .with_backends(primary_only(Arc::clone(&backend)));
        let sink = Arc::new(MemorySink::new());

        let result = orchestrator
            .run_complete(Path::new("book.md"), sink.clone(), RunOptions::default())
            .await;

        assert!(result.success);
        assert_eq!(result.integrated_images, vec!["boat.png".to_string()]);
        let synthesis = result.synthesis.as_ref().unwrap();
        assert_eq!(synthesis.results.len(), 2);
        assert_eq!(synthesis.succeeded(), 2);
        assert_eq!(synthesis.final_level, Some(DegradationLevel::Primary));
        assert_eq!(
            synthesis.merged_file.as_deref(),
            Some(Path::new("mem/audiobook.wav"))
        );
        assert_eq!(result.description.as_ref().unwrap().succeeded(), 1);

        let text = sink.text(TEXT_FILE).unwrap();
        assert!(text.contains("[IMAGE DESCRIPTION: A picture of boat.png.]"));
        assert!(sink.get("chapters/chapter_001_Harbour.wav").is_some());
        assert!(sink.get("chapters/chapter_002_Storm.wav").is_some());
        assert!(sink.text(REPORT_FILE).unwrap().contains("Items processed: 2/2"));
        let summary: serde_json::Value =
            serde_json::from_slice(&sink.get(SUMMARY_FILE).unwrap()).unwrap();
        assert_eq!(summary["title"], "Test Book");
        assert_eq!(summary["images"]["integrated"], 1);
        assert_eq!(summary["config"]["engine"], "tone");
        assert_eq!(summary["config"]["max_retries"], 3);
        assert!(sink.text(REPORT_FILE).unwrap().contains("Configuration:"));

        for stage in STAGES {
            assert!(result.stage_timings.contains_key(stage), "{stage}");
        }
        assert!(result.artifacts_error.is_none());
    }

    #[tokio::test]
    async fn failed_items_do_not_sink_the_batch() {
        let chapters: Vec<(String, String)> = (1..=5)
            .map(|i| {
                let body = if i == 2 || i == 4 {
                    format!("Chapter {i} BADVOICE text.")
                } else {
                    format!("Chapter {i} text.")
                };
                (format!("Part {i}"), body)
            })
            .collect();
        let refs: Vec<(&str, &str)> = chapters
            .iter()
            .map(|(t, b)| (t.as_str(), b.as_str()))
            .collect();
        let backend = Arc::new(ScriptedBackend::failing_on("primary", "BADVOICE"));
        let orchestrator =
            Orchestrator::new(context(), Arc::new(StaticExtractor::ok(book(&refs, &[]))))
                .with_backends(primary_only(Arc::clone(&backend)));

        let result = orchestrator
            .run_complete(Path::new("book.md"), Arc::new(MemorySink::new()), RunOptions::default())
            .await;

        let synthesis = result.synthesis.unwrap();
        assert_eq!(synthesis.results.len(), 5);
        let failed: Vec<&str> = synthesis
            .results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.item_id.as_str())
            .collect();
        assert_eq!(failed, vec!["ch002", "ch004"]);
        // Fatal errors are not retried.
        assert_eq!(backend.call_count(), 5);
    }

    #[tokio::test]
    async fn description_failure_leaves_synthesis_untouched() {
        let extraction = book(&[("One", "[IMAGE: a.png] [IMAGE: b.png] words")], &["a.png", "b.png"]);
        let backend = Arc::new(ScriptedBackend::ok("primary"));
        let orchestrator = Orchestrator::new(context(), Arc::new(StaticExtractor::ok(extraction)))
            .with_describer(Arc::new(
                MockDescriber::new(0.9).failing_on("a.png").with_confidence("b.png", 0.2),
            ))
            .with_backends(primary_only(backend));

        let result = orchestrator
            .run_complete(Path::new("book.md"), Arc::new(MemorySink::new()), RunOptions::default())
            .await;

        assert!(result.success);
        let description = result.description.unwrap();
        assert_eq!(description.results.len(), 2);
        assert_eq!(description.succeeded(), 1);
        // b.png was described but below the confidence floor.
        assert!(result.integrated_images.is_empty());
        assert_eq!(result.synthesis.unwrap().succeeded(), 1);
        let text = result.extraction.unwrap().text;
        assert!(text.contains("[IMAGE: a.png]") && text.contains("[IMAGE: b.png]"));
    }

    #[tokio::test]
    async fn synthesis_failure_leaves_descriptions_untouched() {
        let extraction = book(
            &[("One", "BADVOICE [IMAGE: a.png] words"), ("Two", "BADVOICE again")],
            &["a.png"],
        );
        let backend = Arc::new(ScriptedBackend::failing_on("primary", "BADVOICE"));
        let orchestrator = Orchestrator::new(context(), Arc::new(StaticExtractor::ok(extraction)))
            .with_describer(Arc::new(MockDescriber::new(0.9)))
            .with_backends(primary_only(Arc::clone(&backend)));
        let sink = Arc::new(MemorySink::new());

        let result = orchestrator
            .run_complete(Path::new("book.md"), sink.clone(), RunOptions::default())
            .await;

        assert!(result.success);
        let synthesis = result.synthesis.as_ref().unwrap();
        assert_eq!(synthesis.results.len(), 2);
        assert_eq!(synthesis.succeeded(), 0);
        assert!(synthesis.merged_file.is_none());
        assert_eq!(result.description.as_ref().unwrap().succeeded(), 1);
        assert_eq!(result.integrated_images, vec!["a.png".to_string()]);
        assert!(sink
            .text(TEXT_FILE)
            .unwrap()
            .contains("[IMAGE DESCRIPTION: A picture of a.png.]"));
    }

    /// Two-party meeting point; `meet` reports whether the other side turned
    /// up within the timeout.
    #[derive(Default)]
    struct Rendezvous {
        arrived: std::sync::Mutex<usize>,
        signal: std::sync::Condvar,
    }

    impl Rendezvous {
        fn meet(&self) -> bool {
            let mut arrived = self.arrived.lock().unwrap();
            *arrived += 1;
            self.signal.notify_all();
            let (arrived, _) = self
                .signal
                .wait_timeout_while(arrived, Duration::from_secs(5), |n| *n < 2)
                .unwrap();
            *arrived >= 2
        }
    }

    struct MeetingDescriber(Arc<Rendezvous>, std::sync::atomic::AtomicBool);

    impl ImageDescriber for MeetingDescriber {
        fn describe(
            &self,
            _path: &Path,
            _context: &str,
        ) -> Result<ImageDescription, crate::describe::DescribeError> {
            self.1.store(self.0.meet(), std::sync::atomic::Ordering::SeqCst);
            Ok(ImageDescription {
                text: "A map.".into(),
                confidence: 0.9,
                model: "mock".into(),
            })
        }
    }

    struct MeetingBackend(Arc<Rendezvous>, std::sync::atomic::AtomicBool);

    impl SynthesisBackend for MeetingBackend {
        fn synthesize(&self, text: &str, _voice: &str, _speed: f32) -> Result<Vec<u8>, SynthesisError> {
            self.1.store(self.0.meet(), std::sync::atomic::Ordering::SeqCst);
            Ok(text.as_bytes().to_vec())
        }

        fn name(&self) -> &str {
            "meeting"
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn description_and_synthesis_run_at_the_same_time() {
        let point = Arc::new(Rendezvous::default());
        let describer = Arc::new(MeetingDescriber(Arc::clone(&point), Default::default()));
        let backend = Arc::new(MeetingBackend(Arc::clone(&point), Default::default()));
        let factory: BackendFactory = {
            let backend = Arc::clone(&backend);
            Arc::new(move |variant| match variant {
                BackendVariant::Primary => Some(Arc::clone(&backend) as Arc<dyn SynthesisBackend>),
                _ => None,
            })
        };
        let orchestrator = Orchestrator::new(
            context(),
            Arc::new(StaticExtractor::ok(book(&[("One", "[IMAGE: map.png] Hello.")], &["map.png"]))),
        )
        .with_describer(describer.clone())
        .with_backends(factory);

        let result = orchestrator
            .run_complete(Path::new("book.md"), Arc::new(MemorySink::new()), RunOptions::default())
            .await;

        assert!(result.success);
        // Each side only returns true if the other was in flight at the same time.
        assert!(describer.1.load(std::sync::atomic::Ordering::SeqCst));
        assert!(backend.1.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(result.synthesis.unwrap().succeeded(), 1);
    }

    #[test]
    fn describer_chain_uses_the_cache_directory() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut config = DescriptionConfig::default();
        let cached = dir.path().join("cache");
        describer_chain(&config, &cached);
        assert!(cached.is_dir());

        config.cache_enabled = false;
        let uncached = dir.path().join("unused");
        describer_chain(&config, &uncached);
        assert!(!uncached.exists());
    }

    #[tokio::test]
    async fn missing_backend_is_reported_not_fatal() {
        let orchestrator = Orchestrator::new(
            context(),
            Arc::new(StaticExtractor::ok(book(&[("One", "Hello.")], &[]))),
        )
        .with_backends(Arc::new(|_: BackendVariant| None::<Arc<dyn SynthesisBackend>>));

        let result = orchestrator
            .run_complete(Path::new("book.md"), Arc::new(MemorySink::new()), RunOptions::default())
            .await;

        assert!(result.success);
        let synthesis = result.synthesis.unwrap();
        assert!(synthesis.results.is_empty());
        assert_eq!(
            synthesis.error_message.as_deref(),
            Some("no synthesis backend available")
        );
    }

    #[tokio::test]
    async fn artifact_errors_are_recorded_not_fatal() {
        let orchestrator = Orchestrator::new(
            context(),
            Arc::new(StaticExtractor::ok(book(&[("One", "Hello.")], &[]))),
        );
        let options = RunOptions {
            synthesize: false,
            ..RunOptions::default()
        };

        let result = orchestrator
            .run_complete(Path::new("book.md"), Arc::new(MemorySink::failing()), options)
            .await;

        assert!(result.success);
        assert!(result.synthesis.is_none());
        assert!(result.artifacts_error.is_some());
    }

    #[tokio::test]
    async fn hardware_faults_degrade_the_shared_backend() {
        let primary = Arc::new(ScriptedBackend::with_script(
            "primary",
            vec![
                Err(SynthesisError::HardwareFault("metal device lost".into())),
                Err(SynthesisError::HardwareFault("metal device lost".into())),
            ],
        ));
        let fallback = Arc::new(ScriptedBackend::ok("fallback"));
        let factory: BackendFactory = {
            let primary = Arc::clone(&primary);
            let fallback = Arc::clone(&fallback);
            Arc::new(move |variant| match variant {
                BackendVariant::Primary => Some(Arc::clone(&primary) as Arc<dyn SynthesisBackend>),
                BackendVariant::SafeFallback => {
                    Some(Arc::clone(&fallback) as Arc<dyn SynthesisBackend>)
                }
                BackendVariant::Mock => None,
            })
        };
        let orchestrator = Orchestrator::new(
            context(),
            Arc::new(StaticExtractor::ok(book(&[("One", "Hello."), ("Two", "Again.")], &[]))),
        )
        .with_backends(factory);
        let options = RunOptions {
            sequential: true,
            ..RunOptions::default()
        };

        let result = orchestrator
            .run_complete(Path::new("book.md"), Arc::new(MemorySink::new()), options)
            .await;

        let synthesis = result.synthesis.unwrap();
        assert_eq!(synthesis.succeeded(), 2);
        assert_eq!(synthesis.final_level, Some(DegradationLevel::SafeFallback));
        assert_eq!(fallback.call_count(), 2);
    }

    #[tokio::test]
    async fn cancelled_run_reports_items_as_cancelled() {
        let ctx = context();
        ctx.cancel();
        let backend = Arc::new(ScriptedBackend::ok("primary"));
        let orchestrator = Orchestrator::new(
            ctx,
            Arc::new(StaticExtractor::ok(book(&[("One", "Hello."), ("Two", "Again.")], &[]))),
        )
        .with_backends(primary_only(Arc::clone(&backend)));

        let result = orchestrator
            .run_complete(Path::new("book.md"), Arc::new(MemorySink::new()), RunOptions::default())
            .await;

        let synthesis = result.synthesis.unwrap();
        assert_eq!(synthesis.results.len(), 2);
        assert!(synthesis
            .results
            .iter()
            .all(|r| r.error_message.as_deref() == Some("cancelled")));
        assert_eq!(backend.call_count(), 0);
        assert!(synthesis.merged_file.is_none());
    }

    #[tokio::test]
    async fn interrupt_cancels_but_still_writes_the_partial_run() {
        let backend = Arc::new(ScriptedBackend::ok("primary"));
        let orchestrator = Orchestrator::new(
            context(),
            Arc::new(StaticExtractor::ok(book(&[("One", "Hello."), ("Two", "Again.")], &[]))),
        )
        .with_backends(primary_only(Arc::clone(&backend)));
        let sink = Arc::new(MemorySink::new());

        let result = orchestrator
            .run_until_interrupted(
                Path::new("book.md"),
                sink.clone(),
                RunOptions::default(),
                std::future::ready(()),
            )
            .await;

        assert!(orchestrator.context().is_cancelled());
        assert!(result.success);
        let synthesis = result.synthesis.unwrap();
        assert_eq!(synthesis.results.len(), 2);
        assert!(synthesis
            .results
            .iter()
            .all(|r| r.error_message.as_deref() == Some("cancelled")));
        assert_eq!(backend.call_count(), 0);
        assert!(sink.get(SUMMARY_FILE).is_some());
    }

    #[tokio::test]
    async fn run_without_interrupt_is_not_cancelled() {
        let orchestrator = Orchestrator::new(
            context(),
            Arc::new(StaticExtractor::ok(book(&[("One", "Hello.")], &[]))),
        )
        .with_backends(primary_only(Arc::new(ScriptedBackend::ok("primary"))));

        let result = orchestrator
            .run_until_interrupted(
                Path::new("book.md"),
                Arc::new(MemorySink::new()),
                RunOptions::default(),
                std::future::pending(),
            )
            .await;

        assert!(!orchestrator.context().is_cancelled());
        assert_eq!(result.synthesis.unwrap().succeeded(), 1);
    }

    #[test]
    fn long_chapters_are_split_into_numbered_parts() {
        let body = "A sentence that is long enough to matter here. ".repeat(10);
        let chapter = Chapter::new(3, "Deep Water", body);
        let items = synthesis_items(&[chapter], 100, "wav");
        assert!(items.len() > 1);
        assert_eq!(items[0].id, "ch003_p01");
        assert_eq!(items[0].input.file_name, "chapter_003_Deep_Water_part_01.wav");
        assert!(items.iter().all(|i| i.input.text.chars().count() <= 100));
    }

    #[test]
    fn duplicate_images_are_described_once() {
        let refs = vec![
            ImageRef { path: PathBuf::from("img/a.png"), context: String::new() },
            ImageRef { path: PathBuf::from("img/a.png"), context: String::new() },
            ImageRef { path: PathBuf::from("img/b.png"), context: String::new() },
        ];
        let ids: Vec<String> = image_items(&refs).into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["a.png".to_string(), "b.png".to_string()]);
    }
}
