use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use chrono::Utc;
use tracing::{error, info, warn};

use super::aggregate::{StoreExtraction, build_store_record};
use super::checkpoint::{Checkpoint, load_checkpoint};
use super::client::{CompletionClient, OpenAiClient};
use super::kmz::locate_coordinates;
use super::report::{ReportExtractor, ReportExtractorConfig, ReportOutcome};
use super::sink::{OutputPaths, PersistenceSink, load_error_entries};
use crate::cli::IngestArgs;
use crate::commands::inventory::{StoreFolder, discover_stores, resolve_root};
use crate::model::{ErrorEntry, IngestCounts, IngestPaths, IngestRunManifest, UsageTotals};
use crate::shutdown::{Shutdown, Sleeper};
use crate::util::{now_utc_string, utc_compact_string, write_json_pretty};

/// Pause after each successful extraction call.
const COURTESY_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub root: PathBuf,
    pub paths: OutputPaths,
    pub extractor: ReportExtractorConfig,
    pub limit: Option<usize>,
}

impl PipelineConfig {
    pub fn from_args(args: &IngestArgs) -> Result<Self> {
        Ok(Self {
            root: resolve_root(&args.root)?,
            paths: OutputPaths::new(&args.output_dir, &args.output_stem),
            extractor: ReportExtractorConfig {
                max_attempts: args.max_attempts,
                large_file_threshold_bytes: args.large_file_threshold_mb * 1024 * 1024,
                text_fallback_max_pages: args.text_fallback_max_pages,
            },
            limit: args.limit,
        })
    }
}

enum StoreStep {
    Recorded,
    Interrupted,
}

/// Walks the store tree once, extracting and persisting every store the
/// checkpoint does not already cover.
pub struct Pipeline<'a> {
    config: &'a PipelineConfig,
    extractor: ReportExtractor<'a>,
    sleeper: &'a dyn Sleeper,
    shutdown: &'a Shutdown,
    checkpoint: Checkpoint,
    sink: PersistenceSink,
    errors: Vec<ErrorEntry>,
    usage: UsageTotals,
    counts: IngestCounts,
    warnings: Vec<String>,
    interrupted: bool,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        client: &'a dyn CompletionClient,
        sleeper: &'a dyn Sleeper,
        shutdown: &'a Shutdown,
    ) -> Result<Self> {
        let checkpoint = load_checkpoint(&config.paths.structural, &config.root);
        // Entries for stores still pending will be raised again when they run.
        let errors: Vec<ErrorEntry> = load_error_entries(&config.paths.sqlite)
            .into_iter()
            .filter(|entry| checkpoint.is_completed(&entry.identity))
            .collect();
        if !errors.is_empty() {
            info!(entries = errors.len(), "carrying over previous error entries");
        }

        Ok(Self {
            config,
            extractor: ReportExtractor::new(client, sleeper, config.extractor.clone())?,
            sleeper,
            shutdown,
            checkpoint,
            sink: PersistenceSink::new(config.paths.clone()),
            errors,
            usage: UsageTotals::default(),
            counts: IngestCounts::default(),
            warnings: Vec::new(),
            interrupted: false,
        })
    }

    pub fn execute(&mut self) -> Result<()> {
        let result = self.process_pending();
        self.refresh_record_counts();

        if let Err(err) = &result {
            error!(error = %err, "ingest aborted; flushing collected results");
            if let Err(flush_err) = self.flush() {
                warn!(error = %flush_err, "best-effort flush failed");
            }
            return result;
        }

        if self.interrupted {
            warn!(
                processed = self.counts.processed_stores,
                "ingest interrupted; results saved, rerun to continue"
            );
            self.warnings
                .push("run interrupted before all pending stores were processed".to_string());
            self.flush()?;
        }

        Ok(())
    }

    pub fn counts(&self) -> &IngestCounts {
        &self.counts
    }

    pub fn usage(&self) -> &UsageTotals {
        &self.usage
    }

    pub fn errors(&self) -> &[ErrorEntry] {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn interrupted(&self) -> bool {
        self.interrupted
    }

    fn process_pending(&mut self) -> Result<()> {
        let stores = discover_stores(&self.config.root)?;
        let pending: Vec<&StoreFolder> = stores
            .iter()
            .filter(|store| !self.checkpoint.is_completed(&store.identity))
            .collect();

        self.counts.discovered_stores = stores.len();
        self.counts.skipped_completed = stores.len() - pending.len();
        info!(
            discovered = stores.len(),
            completed = self.counts.skipped_completed,
            pending = pending.len(),
            "resolved store folders"
        );

        for (position, store) in pending.iter().enumerate() {
            if self.interrupted || self.shutdown.is_requested() {
                self.interrupted = true;
                break;
            }
            if let Some(limit) = self.config.limit {
                if self.counts.processed_stores >= limit {
                    info!(limit, "store limit reached");
                    self.warnings
                        .push(format!("stopped after {limit} stores (--limit)"));
                    break;
                }
            }

            info!(
                progress = %format!("{}/{}", position + 1, pending.len()),
                store = %store.identity,
                "processing store"
            );

            match self.process_store(store) {
                StoreStep::Recorded => self.flush()?,
                StoreStep::Interrupted => {
                    info!(store = %store.identity, "store left pending after interrupt");
                    self.interrupted = true;
                    break;
                }
            }
        }

        Ok(())
    }

    fn process_store(&mut self, store: &StoreFolder) -> StoreStep {
        let geodata_path = store.geodata_file();
        let coordinates = match &geodata_path {
            Some(path) => match locate_coordinates(path) {
                Ok(pair) => Some(pair),
                Err(err) => {
                    warn!(store = %store.identity, path = %path.display(), error = %err, "coordinates unavailable");
                    self.push_error(store, format!("coordinates unavailable: {err}"));
                    None
                }
            },
            None => {
                warn!(store = %store.identity, "no KMZ file in store folder");
                self.push_error(store, "KMZ file not found".to_string());
                None
            }
        };

        let report_path = store.report_file();
        let mut extraction = StoreExtraction {
            coordinates,
            geodata_path,
            report_path: report_path.clone(),
            ..StoreExtraction::default()
        };

        match &report_path {
            None => {
                warn!(store = %store.identity, "no PDF file in store folder");
                extraction.error = Some("PDF file not found".to_string());
                self.push_error(store, "PDF file not found".to_string());
            }
            Some(path) => match self.extractor.extract(path) {
                ReportOutcome::Extracted { report, usage } => {
                    self.usage.add(&usage);
                    extraction.report = Some(report);
                    extraction.usage = Some(usage);
                    if !self.sleeper.sleep(COURTESY_PAUSE) {
                        self.interrupted = true;
                    }
                }
                ReportOutcome::Failed { error, usage } => {
                    if let Some(usage) = &usage {
                        self.usage.add(usage);
                    }
                    self.push_error(store, error.clone());
                    extraction.error = Some(error);
                    extraction.usage = usage;
                }
                ReportOutcome::Interrupted => return StoreStep::Interrupted,
            },
        }

        let record = build_store_record(store, extraction);
        info!(
            store = %store.identity,
            store_id = %record.store_id,
            coordinates = record.coordinates().is_some(),
            alternatives = record.alternatives.len(),
            error = record.error.as_deref().unwrap_or(""),
            cost_usd = record.usage.as_ref().map(|usage| usage.cost_usd).unwrap_or(0.0),
            "store processed"
        );

        self.checkpoint.record(store.identity.clone(), record);
        self.counts.processed_stores += 1;
        StoreStep::Recorded
    }

    fn push_error(&mut self, store: &StoreFolder, reason: String) {
        self.errors.push(ErrorEntry {
            store: store.folder_name.clone(),
            identity: store.identity.clone(),
            reason,
        });
    }

    fn flush(&mut self) -> Result<()> {
        self.sink.persist(self.checkpoint.records(), &self.errors)
    }

    fn refresh_record_counts(&mut self) {
        let records = self.checkpoint.records();
        self.counts.records_total = records.len();
        self.counts.records_with_coordinates = records
            .iter()
            .filter(|record| record.coordinates().is_some())
            .count();
        self.counts.records_with_errors = records
            .iter()
            .filter(|record| record.error.is_some())
            .count();
        self.counts.error_entries = self.errors.len();
    }
}

pub fn run(args: IngestArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("run-{}", utc_compact_string(started_ts));
    let started = Instant::now();

    if args.api_key.trim().is_empty() {
        bail!("OPENAI_API_KEY is not set");
    }

    let config = PipelineConfig::from_args(&args)?;
    let run_manifest_path = args.run_manifest_path.clone().unwrap_or_else(|| {
        args.output_dir.join("manifests").join(format!(
            "ingest_run_{}.json",
            utc_compact_string(started_ts)
        ))
    });

    let client = OpenAiClient::new(
        &args.base_url,
        &args.api_key,
        &args.model,
        Duration::from_secs(args.request_timeout_secs),
    )?;
    let shutdown = Shutdown::new();
    shutdown.listen_for_ctrl_c()?;

    info!(
        run_id = %run_id,
        root = %config.root.display(),
        output = %config.paths.structural.display(),
        model = %args.model,
        "starting ingest"
    );

    let mut pipeline = Pipeline::new(&config, &client, &shutdown, &shutdown)?;
    let result = pipeline.execute();
    let elapsed_secs = started.elapsed().as_secs_f64();

    let status = match (&result, pipeline.interrupted()) {
        (Err(_), _) => "failed",
        (Ok(()), true) => "interrupted",
        (Ok(()), false) => "completed",
    };
    let mut warnings = pipeline.warnings().to_vec();
    if let Err(err) = &result {
        warnings.push(format!("{err:#}"));
    }

    let manifest = IngestRunManifest {
        manifest_version: 1,
        run_id,
        status: status.to_string(),
        started_at,
        updated_at: now_utc_string(),
        elapsed_secs,
        command: render_ingest_command(&args),
        paths: IngestPaths {
            root: config.root.display().to_string(),
            structural_path: config.paths.structural.display().to_string(),
            sqlite_path: config.paths.sqlite.display().to_string(),
            csv_path: config.paths.csv.display().to_string(),
            error_report_path: config.paths.errors.display().to_string(),
        },
        counts: pipeline.counts().clone(),
        usage: pipeline.usage().clone(),
        warnings,
    };

    match write_json_pretty(&run_manifest_path, &manifest) {
        Ok(()) => info!(path = %run_manifest_path.display(), "wrote ingest run manifest"),
        Err(err) if result.is_err() => {
            warn!(error = %err, "failed to write run manifest");
        }
        Err(err) => return Err(err),
    }

    result?;

    let usage = pipeline.usage();
    info!(
        status,
        processed = manifest.counts.processed_stores,
        skipped = manifest.counts.skipped_completed,
        records = manifest.counts.records_total,
        with_coordinates = manifest.counts.records_with_coordinates,
        with_errors = manifest.counts.records_with_errors,
        error_entries = pipeline.errors().len(),
        elapsed_secs = %format!("{elapsed_secs:.1}"),
        tokens = usage.prompt_tokens + usage.completion_tokens,
        cost_usd = %format!("{:.4}", usage.cost_usd),
        "ingest completed"
    );

    Ok(())
}

pub fn render_ingest_command(args: &IngestArgs) -> String {
    let mut command = vec![
        "geotech".to_string(),
        "ingest".to_string(),
        "--root".to_string(),
        args.root.display().to_string(),
        "--output-dir".to_string(),
        args.output_dir.display().to_string(),
        "--output-stem".to_string(),
        args.output_stem.clone(),
        "--base-url".to_string(),
        args.base_url.clone(),
        "--model".to_string(),
        args.model.clone(),
        "--max-attempts".to_string(),
        args.max_attempts.to_string(),
        "--large-file-threshold-mb".to_string(),
        args.large_file_threshold_mb.to_string(),
        "--text-fallback-max-pages".to_string(),
        args.text_fallback_max_pages.to_string(),
        "--request-timeout-secs".to_string(),
        args.request_timeout_secs.to_string(),
    ];

    if let Some(limit) = args.limit {
        command.push("--limit".to_string());
        command.push(limit.to_string());
    }
    if let Some(path) = &args.run_manifest_path {
        command.push("--run-manifest-path".to_string());
        command.push(path.display().to_string());
    }

    command.join(" ")
}
