//! DataProcessorPool: several processors over one shared file queue.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::Receiver;
use tracing::{debug, error, info, warn};

use whois_ingest_core::models::RolloverTarget;

use super::processor::{DataProcessor, ProcessorControl, ProcessorState};
use super::{join_stage, ProcessOptions, POLL};
use crate::error::{IngestError, Result};
use crate::events::EventTracker;
use crate::ingest_handler::IngestHandler;
use crate::stats::StatTracker;

struct Member {
    pipeline: usize,
    control: Arc<ProcessorControl>,
    thread: Option<JoinHandle<()>>,
}

impl Member {
    fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

pub struct DataProcessorPool {
    handler: IngestHandler,
    events: EventTracker,
    members: Vec<Member>,
    rollover_timer: Instant,
}

impl DataProcessorPool {
    /// Spawn `pipelines` processors.
    pub fn start(
        pipelines: usize,
        file_queue: &Receiver<PathBuf>,
        handler: &IngestHandler,
        events: &EventTracker,
        stats: &StatTracker,
        options: Arc<ProcessOptions>,
    ) -> Result<Self> {
        let mut pool = Self {
            handler: handler.clone(),
            events: events.clone(),
            members: Vec::new(),
            rollover_timer: Instant::now(),
        };

        for pipeline in 0..pipelines.max(1) {
            let control = ProcessorControl::new();
            let processor = DataProcessor::new(
                pipeline,
                file_queue.clone(),
                handler.clone(),
                events.clone(),
                stats.handle(),
                Arc::clone(&options),
                Arc::clone(&control),
            );
            let spawned = std::thread::Builder::new()
                .name(format!("processor-{}", pipeline))
                .spawn(move || processor.run());
            match spawned {
                Ok(thread) => pool.members.push(Member {
                    pipeline,
                    control,
                    thread: Some(thread),
                }),
                Err(e) => {
                    error!(pipeline, error = %e, "unable to start processor");
                    pool.set_shutdown();
                    pool.join_members();
                    return Err(e.into());
                }
            }
        }
        info!(pipelines = pool.members.len(), "processor pool started");
        Ok(pool)
    }

    pub fn set_shutdown(&self) {
        self.events.set_shutdown();
    }

    pub fn states(&self) -> Vec<ProcessorState> {
        self.members.iter().map(|m| m.control.state()).collect()
    }

    /// Roll an index family over if its write index has grown too large.
    /// Checks at most once per configured interval.
    pub fn check_rollover(&mut self) -> Result<()> {
        if let Some(target) = self.handler.rollover_timer(&mut self.rollover_timer) {
            self.handle_rollover(&target)?;
        }
        Ok(())
    }

    /// Pause every active processor, roll `target` over, then resume them.
    ///
    /// No processor writes while the write alias moves, and each resumes with
    /// a refreshed list of live indices.
    pub fn handle_rollover(&self, target: &RolloverTarget) -> Result<()> {
        info!(alias = %target.write_alias, "rollover required, pausing pipelines");
        let active: Vec<&Member> = self
            .members
            .iter()
            .filter(|m| !m.control.state().is_terminal())
            .collect();
        for member in &active {
            member.control.pause();
        }

        for member in &active {
            loop {
                let state = member.control.wait_settled(POLL);
                if state == ProcessorState::Paused || state.is_terminal() {
                    debug!(pipeline = member.pipeline, state = ?state, "pipeline settled");
                    break;
                }
                if self.events.shutdown() || self.events.bulk_error() {
                    for member in &active {
                        member.control.unpause();
                    }
                    return Err(IngestError::Aborted {
                        reason: "pipelines stopped while pausing for rollover".into(),
                    });
                }
            }
        }

        let result = self.handler.rollover_indices(target);
        for member in &active {
            member.control.unpause();
        }
        match result {
            Ok(new_index) => {
                info!(alias = %target.write_alias, new_index = %new_index, "pipelines resumed");
                Ok(())
            }
            Err(e) => {
                error!(alias = %target.write_alias, error = %e, "rollover failed");
                Err(e)
            }
        }
    }

    /// Wait for every processor to finish, servicing rollovers meanwhile.
    pub fn join(&mut self) -> Result<()> {
        let mut failure = None;
        while !self.members.iter().all(Member::is_finished) {
            if !self.events.shutdown() {
                if self.events.bulk_error() {
                    error!("bulk error detected, shutting down pipelines");
                    self.set_shutdown();
                } else if let Err(e) = self.check_rollover() {
                    self.set_shutdown();
                    failure = Some(e);
                }
            }
            std::thread::sleep(POLL);
        }
        self.join_members();

        if let Some(e) = failure {
            return Err(e);
        }
        if self.events.bulk_error() {
            return Err(IngestError::Aborted {
                reason: bulk_error_reason(&self.events),
            });
        }
        Ok(())
    }

    fn join_members(&mut self) {
        for member in &mut self.members {
            if let Some(thread) = member.thread.take() {
                join_stage("processor", thread);
            }
            if !member.control.state().is_terminal() {
                warn!(pipeline = member.pipeline, "processor exited without finishing");
            }
        }
    }
}

pub(crate) fn bulk_error_reason(events: &EventTracker) -> String {
    match (events.fetch_error(), events.ship_error()) {
        (true, true) => "bulk fetch and bulk ship failed".into(),
        (true, false) => "bulk fetch failed".into(),
        (false, true) => "bulk ship failed".into(),
        (false, false) => "shutdown requested".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Stats;
    use crossbeam_channel::bounded;
    use serde_json::json;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;
    use whois_ingest_core::backend::memory::InMemoryBackend;
    use whois_ingest_core::backend::SearchBackend;
    use whois_ingest_core::models::FieldFilter;

    const ROWS_PER_FILE: usize = 20_000;

    fn write_rows(dir: &Path, name: &str, from: usize) -> PathBuf {
        let mut content = String::from("domainName,registrant_name\n");
        for i in from..from + ROWS_PER_FILE {
            content.push_str(&format!("d{}.com,Registrant {}\n", i, i));
        }
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(60);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn rollover_pauses_every_pipeline_without_losing_rows() {
        let backend = Arc::new(InMemoryBackend::new());
        let handler = IngestHandler::new(
            backend.clone(),
            "whois",
            u64::MAX,
            Duration::from_secs(3600),
        );
        handler.initialize(json!({})).unwrap();
        let events = EventTracker::new();
        let mut tracker = StatTracker::start(Stats::default());
        let options = Arc::new(ProcessOptions {
            version: 1,
            reingest: false,
            first_import: true,
            ingest_day: "2024-01-01".into(),
            ingest_now: "2024-01-01".into(),
            ignore_field_prefixes: vec![],
            filter: FieldFilter::All,
            bulk_fetch_size: 100,
            bulk_ship_size: 250,
            fetcher_threads: 2,
            shipper_threads: 2,
        });

        let tmp = TempDir::new().unwrap();
        let (file_tx, file_rx) = bounded(4);
        file_tx.send(write_rows(tmp.path(), "a.csv", 0)).unwrap();
        file_tx.send(write_rows(tmp.path(), "b.csv", ROWS_PER_FILE)).unwrap();
        let total = (2 * ROWS_PER_FILE) as u64;

        let mut pool =
            DataProcessorPool::start(2, &file_rx, &handler, &events, &tracker, options).unwrap();

        wait_for("first writes", || {
            backend.count("whois-data-000001").unwrap_or(0) > 0
        });
        for member in &pool.members {
            member.control.pause();
        }
        for member in &pool.members {
            wait_for("pause", || {
                member.control.wait_settled(POLL) == ProcessorState::Paused
            });
        }
        assert!(pool.states().iter().all(|s| *s == ProcessorState::Paused));

        // paused pipelines have drained and write nothing more
        let before = backend.count("whois-data-000001").unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(backend.count("whois-data-000001").unwrap(), before);

        let new_index = handler
            .rollover_indices(&handler.names().orig_family())
            .unwrap();
        assert_eq!(new_index, "whois-data-000002");

        for member in &pool.members {
            member.control.unpause();
        }
        for member in &pool.members {
            wait_for("resume", || member.control.state() == ProcessorState::Running);
        }

        events.set_file_reader_done();
        pool.join().unwrap();
        let stats = tracker.stop();

        let old = backend.count("whois-data-000001").unwrap();
        let new = backend.count("whois-data-000002").unwrap();
        assert_eq!(old, before, "old write index untouched after rollover");
        assert_eq!(old + new, total);
        assert_eq!(backend.count("whois-data-orig").unwrap(), total);
        assert_eq!(stats.total, total);
        assert_eq!(stats.new, total);
        assert!(pool.states().iter().all(|s| *s == ProcessorState::Complete));
    }

    #[test]
    fn bulk_error_reason_names_the_failed_stage() {
        let events = EventTracker::new();
        assert_eq!(bulk_error_reason(&events), "shutdown requested");
        events.set_ship_error();
        assert_eq!(bulk_error_reason(&events), "bulk ship failed");
        events.set_fetch_error();
        assert_eq!(bulk_error_reason(&events), "bulk fetch and bulk ship failed");
    }
}
