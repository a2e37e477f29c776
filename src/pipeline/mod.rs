//! The ingestion pipeline.
//!
//! ```text
//! file queue ─▶ DataReader ─▶ data queue ─▶ DataFetcher ×N ─▶ work queue
//!                                                               │
//!            search engine ◀─ DataShipper ×N ◀─ insert queue ◀─ DataWorker
//! ```
//!
//! One [`processor::DataProcessor`] owns a reader, fetchers, a worker and
//! shippers plus the three private queues between them. A
//! [`pool::DataProcessorPool`] runs several processors over a shared file
//! queue and coordinates the pause-all/resume-all barrier needed for index
//! rollover.
//!
//! Every queue operation polls with a short timeout so each loop notices
//! shutdown, finish and pause requests promptly.

pub mod fetcher;
pub mod pool;
pub mod processor;
pub mod reader;
pub mod shipper;
pub mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender};
use tracing::error;

use whois_ingest_core::diff::Outcome;
use whois_ingest_core::domain::Stamp;
use whois_ingest_core::models::{BulkCommand, FieldFilter};

/// Capacity of every pipeline queue.
pub const QUEUE_SIZE: usize = 10_000;

/// Poll interval for queue reads and writes.
pub(crate) const POLL: Duration = Duration::from_millis(50);

/// Immutable per-run options handed to every stage.
#[derive(Clone, Debug)]
pub struct ProcessOptions {
    pub version: u64,
    pub reingest: bool,
    /// Nothing can exist in the cluster yet.
    pub first_import: bool,
    pub ingest_day: String,
    pub ingest_now: String,
    pub ignore_field_prefixes: Vec<String>,
    pub filter: FieldFilter,
    pub bulk_fetch_size: usize,
    pub bulk_ship_size: usize,
    pub fetcher_threads: usize,
    pub shipper_threads: usize,
}

impl ProcessOptions {
    pub fn stamp(&self) -> Stamp {
        Stamp {
            version: self.version,
            ingest_day: self.ingest_day.clone(),
            ingest_now: self.ingest_now.clone(),
        }
    }

    /// Skip the existence lookup on a true first import.
    pub fn skip_fetch(&self) -> bool {
        self.first_import && !self.reingest
    }
}

/// One validated CSV row with the header of its file.
#[derive(Clone, Debug)]
pub struct Row {
    pub header: Arc<Vec<String>>,
    pub fields: Vec<String>,
}

/// The bulk writes planned for one entry. Its counters are settled only
/// once every command has been shipped.
#[derive(Clone, Debug)]
pub struct Shipment {
    pub outcome: Outcome,
    pub changed: Vec<String>,
    pub commands: Vec<BulkCommand>,
}

/// Cooperative control flags for one stage thread.
#[derive(Default)]
pub struct StageControl {
    shutdown: AtomicBool,
    finish: AtomicBool,
    pause: AtomicBool,
    paused: AtomicBool,
}

impl StageControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Stop as soon as safe, abandoning queued work.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Drain the input queue, then stop.
    pub fn finish(&self) {
        self.finish.store(true, Ordering::SeqCst);
    }

    pub fn is_finishing(&self) -> bool {
        self.finish.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    pub fn unpause(&self) {
        self.pause.store(false, Ordering::SeqCst);
    }

    pub fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    /// True while the stage is parked in [`StageControl::wait_while_paused`].
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Park while a pause is requested. Returns false if shut down meanwhile.
    pub fn wait_while_paused(&self) -> bool {
        if !self.pause_requested() {
            return !self.is_shutdown();
        }
        self.paused.store(true, Ordering::SeqCst);
        while self.pause_requested() && !self.is_shutdown() {
            std::thread::sleep(POLL);
        }
        self.paused.store(false, Ordering::SeqCst);
        !self.is_shutdown()
    }
}

/// Push onto a bounded queue, giving up on shutdown or disconnect.
pub(crate) fn push<T>(queue: &Sender<T>, mut item: T, control: &StageControl) -> bool {
    loop {
        if control.is_shutdown() {
            return false;
        }
        match queue.send_timeout(item, POLL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => item = back,
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

/// Discard everything currently queued.
pub(crate) fn drain<T>(queue: &Receiver<T>) -> usize {
    queue.try_iter().count()
}

/// Join a stage thread, logging a panic instead of propagating it.
pub(crate) fn join_stage<T>(name: &str, handle: JoinHandle<T>) -> Option<T> {
    match handle.join() {
        Ok(value) => Some(value),
        Err(_) => {
            error!(stage = name, "pipeline stage panicked");
            None
        }
    }
}
