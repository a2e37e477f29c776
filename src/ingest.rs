//! Import orchestration.
//!
//! [`DataPopulator`] decides the target version, maintains the metadata
//! pointer and per-version record, runs the processor pool over the input
//! and finalizes the counters however the run ends.
//!
//! A normal run clears the pointer's `importing` marker. A cancelled run
//! (bulk error, rollover failure or operator interrupt) records what it
//! counted but leaves the marker set, so the next `ingest` refuses to start
//! until the operator runs `reingest` or `clear-interrupted`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use serde_json::json;
use tracing::{debug, error, info, warn};

use whois_ingest_core::models::{FieldFilter, MetadataRecord};

use crate::config::IngestConfig;
use crate::error::{IngestError, Result};
use crate::events::EventTracker;
use crate::file_reader::{FileReader, InputSource};
use crate::ingest_handler::IngestHandler;
use crate::pipeline::pool::{bulk_error_reason, DataProcessorPool};
use crate::pipeline::{drain, ProcessOptions, POLL, QUEUE_SIZE};
use crate::progress::{ImportProgressEvent, ImportProgressReporter, NoProgress};
use crate::stats::{StatTracker, Stats};
use crate::template::load_template;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Per-run settings of one populator.
#[derive(Clone, Debug)]
pub struct PopulatorOptions {
    pub source: Option<InputSource>,
    pub extension: String,
    pub comment: String,
    /// Date the data represents, `YYYY-MM-DD`.
    pub ingest_day: String,
    pub include_fields: Option<Vec<String>>,
    pub exclude_fields: Option<Vec<String>>,
    pub ignore_field_prefixes: Vec<String>,
    pub pipelines: usize,
    pub fetcher_threads: usize,
    pub shipper_threads: usize,
    pub bulk_fetch_size: usize,
    pub bulk_ship_size: usize,
    pub template_dir: PathBuf,
}

impl PopulatorOptions {
    /// Options with every knob taken from `config` and no input yet.
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            source: None,
            extension: config.extension.clone(),
            comment: String::new(),
            ingest_day: today(),
            include_fields: None,
            exclude_fields: None,
            ignore_field_prefixes: config.ignore_field_prefixes.clone(),
            pipelines: config.pipelines,
            fetcher_threads: config.fetcher_threads,
            shipper_threads: config.shipper_threads,
            bulk_fetch_size: config.bulk_fetch_size,
            bulk_ship_size: config.bulk_ship_size,
            template_dir: config.template_dir.clone(),
        }
    }

    pub fn with_source(mut self, source: InputSource) -> Self {
        self.source = Some(source);
        self
    }
}

pub fn today() -> String {
    chrono::Local::now().format("%Y-%m-%d").to_string()
}

pub struct DataPopulator {
    handler: IngestHandler,
    options: PopulatorOptions,
    events: EventTracker,
    progress: Box<dyn ImportProgressReporter>,
    stats: Option<Stats>,
}

/// What the supervisor needs to run one version.
struct RunPlan {
    process: ProcessOptions,
    record: MetadataRecord,
    seed: Stats,
}

impl DataPopulator {
    pub fn new(handler: IngestHandler, options: PopulatorOptions, events: EventTracker) -> Self {
        Self {
            handler,
            options,
            events,
            progress: Box::new(NoProgress),
            stats: None,
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn ImportProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Shared signals; setting shutdown cancels a running import.
    pub fn events(&self) -> &EventTracker {
        &self.events
    }

    /// Final totals of the last completed run.
    pub fn stats(&self) -> Option<&Stats> {
        self.stats.as_ref()
    }

    /// Install the index template for the cluster's major version.
    pub fn config_template(&self) -> Result<()> {
        let major = self.handler.get_version()?;
        let template = load_template(&self.options.template_dir, major)?;
        self.handler.config_template(template)
    }

    pub fn clear_interrupted(&self) -> Result<()> {
        self.handler.clear_interrupted()?;
        info!("interrupted import cleared");
        Ok(())
    }

    /// The stored record for `version`, or for the last version.
    pub fn metadata(&self, version: Option<u64>) -> Result<MetadataRecord> {
        if !self.handler.meta_exists()? {
            return Err(IngestError::NoData);
        }
        let version = match version {
            Some(v) => v,
            None => {
                let pointer = self.handler.meta_record()?.ok_or(IngestError::NoData)?;
                if pointer.last_version == 0 {
                    return Err(IngestError::NoData);
                }
                pointer.last_version
            }
        };
        self.handler
            .get_metadata(version)?
            .ok_or_else(|| IngestError::Metadata(format!("no metadata for version {}", version)))
    }

    /// Import the input as the next version, bootstrapping an empty cluster.
    pub fn ingest(&mut self) -> Result<Stats> {
        if self.options.source.is_none() {
            return Err(IngestError::NoInput);
        }
        let mut first_import = false;
        if !self.handler.meta_exists()? {
            let major = self.handler.get_version()?;
            let template = load_template(&self.options.template_dir, major)?;
            self.handler.initialize(template)?;
            first_import = true;
        }

        let pointer = self
            .handler
            .meta_record()?
            .ok_or_else(|| IngestError::Metadata("Unable to get metadata from cluster".into()))?;
        if pointer.is_interrupted() {
            return Err(IngestError::InterruptedImport {
                version: pointer.importing,
            });
        }
        let version = if first_import {
            1
        } else {
            pointer.last_version + 1
        };

        let mut pointer_doc = json!({ "importing": version, "lastVersion": version });
        if pointer.last_version == 0 {
            pointer_doc["firstVersion"] = json!(1);
        }
        self.handler.update_metadata(0, &pointer_doc)?;

        let filter = FieldFilter::from_lists(
            self.options.include_fields.clone(),
            self.options.exclude_fields.clone(),
        );
        let now = today();
        let record = MetadataRecord::new(
            version,
            &self.options.comment,
            &now,
            &self.options.ingest_day,
            &filter,
        );
        self.handler.create_metadata(&record)?;
        info!(version, first_import, "starting import");

        let process = self.process_options(version, false, first_import, filter, now);
        self.run(RunPlan {
            process,
            record,
            seed: Stats::default(),
        })
    }

    /// Resume an interrupted import, or repeat the last one.
    ///
    /// Records already at the target version are skipped without being
    /// counted, and counters continue from the stored totals.
    pub fn reingest(&mut self) -> Result<Stats> {
        if self.options.source.is_none() {
            return Err(IngestError::NoInput);
        }
        if !self.handler.meta_exists()? {
            return Err(IngestError::NoData);
        }
        let pointer = self.handler.meta_record()?.ok_or(IngestError::NoData)?;
        let version = if pointer.is_interrupted() {
            pointer.importing
        } else {
            pointer.last_version
        };
        if version == 0 {
            return Err(IngestError::NoData);
        }

        let record = self.handler.get_metadata(version)?.ok_or_else(|| {
            IngestError::Metadata(format!("Unable to get metadata record {}", version))
        })?;
        self.handler
            .update_metadata(0, &json!({ "importing": version }))?;
        info!(version, interrupted = pointer.is_interrupted(), "starting reingest");

        let filter = record.filter();
        let ingest_day = record.date_ingest.clone();
        let mut process = self.process_options(version, true, false, filter, today());
        if !ingest_day.is_empty() {
            process.ingest_day = ingest_day;
        }
        let seed = Stats::from_record(&record);
        self.run(RunPlan {
            process,
            record,
            seed,
        })
    }

    fn process_options(
        &self,
        version: u64,
        reingest: bool,
        first_import: bool,
        filter: FieldFilter,
        ingest_now: String,
    ) -> ProcessOptions {
        ProcessOptions {
            version,
            reingest,
            first_import,
            ingest_day: self.options.ingest_day.clone(),
            ingest_now,
            ignore_field_prefixes: self.options.ignore_field_prefixes.clone(),
            filter,
            bulk_fetch_size: self.options.bulk_fetch_size,
            bulk_ship_size: self.options.bulk_ship_size,
            fetcher_threads: self.options.fetcher_threads,
            shipper_threads: self.options.shipper_threads,
        }
    }

    /// Supervise one run to completion or cancellation.
    fn run(&mut self, plan: RunPlan) -> Result<Stats> {
        let RunPlan {
            process,
            record,
            seed,
        } = plan;
        let version = process.version;
        self.progress.report(ImportProgressEvent::Started {
            version,
            reingest: process.reingest,
        });

        let source = self.options.source.clone().ok_or(IngestError::NoInput)?;
        let mut tracker = StatTracker::start(seed);
        let (file_tx, file_rx) = bounded(QUEUE_SIZE);
        let mut file_reader = match FileReader::new(
            source,
            &self.options.extension,
            file_tx,
            self.events.clone(),
        )
        .spawn()
        {
            Ok(handle) => handle,
            Err(e) => {
                tracker.stop();
                return Err(e.into());
            }
        };

        let mut pool = match DataProcessorPool::start(
            self.options.pipelines,
            &file_rx,
            &self.handler,
            &self.events,
            &tracker,
            Arc::new(process),
        ) {
            Ok(pool) => pool,
            Err(e) => {
                file_reader.shutdown();
                drain(&file_rx);
                file_reader.join();
                tracker.stop();
                return Err(e);
            }
        };

        let mut last_progress = Instant::now();
        let outcome = loop {
            if self.events.shutdown() {
                break Err("shutdown requested".to_string());
            }
            if self.events.bulk_error() {
                break Err(bulk_error_reason(&self.events));
            }
            if let Err(e) = pool.check_rollover() {
                break Err(format!("rollover failed: {}", e));
            }
            if file_reader.is_finished() && file_rx.is_empty() {
                debug!("all input queued and picked up");
                break Ok(());
            }
            if last_progress.elapsed() >= PROGRESS_INTERVAL {
                last_progress = Instant::now();
                self.progress.report(ImportProgressEvent::Ingesting {
                    version,
                    stats: tracker.snapshot(),
                });
            }
            std::thread::sleep(POLL);
        };
        let outcome = outcome.and_then(|()| {
            pool.join().map_err(|e| match e {
                IngestError::Aborted { reason } => reason,
                other => other.to_string(),
            })
        });

        match outcome {
            Ok(()) => {
                file_reader.join();
                let stats = tracker.stop();
                self.finish(version, record, &stats)?;
                self.stats = Some(stats.clone());
                Ok(stats)
            }
            Err(reason) => {
                error!(version, reason = %reason, "import aborted, shutting down");
                file_reader.shutdown();
                let dropped = drain(&file_rx);
                file_reader.join();
                drain(&file_rx);
                pool.set_shutdown();
                if let Err(e) = pool.join() {
                    debug!(error = %e, "pool stopped with error");
                }
                let stats = tracker.stop();
                debug!(dropped, "discarded queued files");
                self.cancel(version, record, &stats);
                self.stats = Some(stats);
                Err(IngestError::Aborted { reason })
            }
        }
    }

    /// Record final totals and clear the importing marker.
    fn finish(&self, version: u64, mut record: MetadataRecord, stats: &Stats) -> Result<()> {
        if let Err(e) = self.handler.refresh_indices(None) {
            warn!(error = %e, "unable to refresh indices");
        }
        stats.apply_to(&mut record);
        self.handler
            .update_metadata(version, &serde_json::to_value(&record)?)?;
        self.handler.update_metadata(0, &json!({ "importing": 0 }))?;
        info!(
            version,
            total = stats.total,
            new = stats.new,
            updated = stats.updated,
            unchanged = stats.unchanged,
            duplicates = stats.duplicates,
            failed = stats.failed,
            "import complete"
        );
        Ok(())
    }

    /// Best-effort finalization after an aborted run; `importing` stays set.
    fn cancel(&self, version: u64, mut record: MetadataRecord, stats: &Stats) {
        if let Err(e) = self.handler.refresh_indices(None) {
            warn!(error = %e, "unable to refresh indices");
        }
        stats.apply_to(&mut record);
        let stored = serde_json::to_value(&record)
            .map_err(IngestError::from)
            .and_then(|doc| self.handler.update_metadata(version, &doc));
        if let Err(e) = stored {
            warn!(version, error = %e, "Unable to finalize stats, data may be out of sync");
        }
        info!(version, total = stats.total, "import cancelled, run reingest to resume");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use whois_ingest_core::backend::memory::InMemoryBackend;

    fn populator(backend: Arc<InMemoryBackend>) -> DataPopulator {
        let handler = IngestHandler::new(backend, "whois", 1000, Duration::from_secs(60));
        let options = PopulatorOptions::from_config(&IngestConfig::default())
            .with_source(InputSource::Directory(PathBuf::from("/no/such/dir")));
        DataPopulator::new(handler, options, EventTracker::new())
    }

    #[test]
    fn reingest_without_data_fails() {
        let mut p = populator(Arc::new(InMemoryBackend::new()));
        assert!(matches!(p.reingest(), Err(IngestError::NoData)));
        assert!(matches!(p.metadata(None), Err(IngestError::NoData)));
    }

    #[test]
    fn import_requires_a_source() {
        let handler = IngestHandler::new(
            Arc::new(InMemoryBackend::new()),
            "whois",
            1000,
            Duration::from_secs(60),
        );
        let options = PopulatorOptions::from_config(&IngestConfig::default());
        let mut p = DataPopulator::new(handler, options, EventTracker::new());
        assert!(matches!(p.ingest(), Err(IngestError::NoInput)));
    }

    #[test]
    fn from_config_copies_knobs() {
        let config = IngestConfig::default();
        let options = PopulatorOptions::from_config(&config);
        assert!(options.source.is_none());
        assert_eq!(options.pipelines, config.pipelines);
        assert_eq!(options.bulk_ship_size, config.bulk_ship_size);
        assert_eq!(options.ingest_day.len(), 10);
    }
}
