//! DataProcessor: one complete reader → fetchers → worker → shippers pipeline.
//!
//! The processor thread supervises its stages. It can be paused (stages
//! drained and joined, reader parked between rows), resumed with a fresh view
//! of the live indices, finished once its reader runs out of files, or shut
//! down.

use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, error, info};

use whois_ingest_core::diff::PlanContext;
use whois_ingest_core::models::WorkItem;

use super::fetcher::DataFetcher;
use super::reader::DataReader;
use super::shipper::DataShipper;
use super::worker::{DataWorker, RecentIds, RECENT_IDS};
use super::{drain, join_stage, ProcessOptions, Row, Shipment, StageControl, POLL, QUEUE_SIZE};
use crate::events::EventTracker;
use crate::ingest_handler::IngestHandler;
use crate::stats::StatHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessorState {
    Running,
    Paused,
    /// Reader done; draining the remaining stages.
    Finishing,
    Complete,
    Shuttered,
}

impl ProcessorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessorState::Complete | ProcessorState::Shuttered)
    }
}

struct ControlState {
    state: ProcessorState,
    pause_requested: bool,
}

/// Shared between a processor thread and the pool that drives it.
pub struct ProcessorControl {
    inner: Mutex<ControlState>,
    changed: Condvar,
}

impl ProcessorControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ControlState {
                state: ProcessorState::Running,
                pause_requested: false,
            }),
            changed: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ProcessorState {
        self.lock().state
    }

    pub fn pause(&self) {
        self.lock().pause_requested = true;
        self.changed.notify_all();
    }

    pub fn unpause(&self) {
        self.lock().pause_requested = false;
        self.changed.notify_all();
    }

    pub fn pause_requested(&self) -> bool {
        self.lock().pause_requested
    }

    fn set_state(&self, state: ProcessorState) {
        self.lock().state = state;
        self.changed.notify_all();
    }

    /// Wait up to `timeout` for the processor to reach paused or a terminal
    /// state, returning the state it is in.
    pub fn wait_settled(&self, timeout: Duration) -> ProcessorState {
        let guard = self.lock();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |s| {
                matches!(s.state, ProcessorState::Running | ProcessorState::Finishing)
            })
            .unwrap_or_else(PoisonError::into_inner);
        guard.state
    }

    /// Block until the pause is lifted, then mark the processor running.
    /// Returns false on shutdown.
    fn wait_for_resume(&self, events: &EventTracker) -> bool {
        let mut guard = self.lock();
        loop {
            if events.shutdown() {
                return false;
            }
            if !guard.pause_requested {
                guard.state = ProcessorState::Running;
                self.changed.notify_all();
                return true;
            }
            guard = self
                .changed
                .wait_timeout(guard, POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

struct Queues {
    data_tx: Sender<Row>,
    data_rx: Receiver<Row>,
    work_tx: Sender<WorkItem>,
    work_rx: Receiver<WorkItem>,
    insert_tx: Sender<Shipment>,
    insert_rx: Receiver<Shipment>,
}

impl Queues {
    fn new() -> Self {
        let (data_tx, data_rx) = bounded(QUEUE_SIZE);
        let (work_tx, work_rx) = bounded(QUEUE_SIZE);
        let (insert_tx, insert_rx) = bounded(QUEUE_SIZE);
        Self {
            data_tx,
            data_rx,
            work_tx,
            work_rx,
            insert_tx,
            insert_rx,
        }
    }
}

/// The fetch, work and ship threads of one running segment.
struct Stages {
    fetch: Arc<StageControl>,
    fetchers: Vec<JoinHandle<()>>,
    work: Arc<StageControl>,
    worker: Option<JoinHandle<RecentIds>>,
    ship: Arc<StageControl>,
    shippers: Vec<JoinHandle<()>>,
}

impl Stages {
    fn new() -> Self {
        Self {
            fetch: StageControl::new(),
            fetchers: Vec::new(),
            work: StageControl::new(),
            worker: None,
            ship: StageControl::new(),
            shippers: Vec::new(),
        }
    }

    /// Wait for `done`, cutting the upstream stages short on shutdown or a
    /// bulk error.
    fn wait(&self, events: &EventTracker, done: impl Fn(&Self) -> bool) {
        while !done(self) {
            if events.shutdown() || events.bulk_error() {
                self.fetch.shutdown();
                self.work.shutdown();
                if events.ship_error() {
                    self.ship.shutdown();
                }
            }
            std::thread::sleep(POLL);
        }
    }

    /// Drain every stage in pipeline order and hand back the worker's cache.
    fn finish(&mut self, events: &EventTracker) -> Option<RecentIds> {
        self.fetch.finish();
        self.wait(events, |s| s.fetchers.iter().all(JoinHandle::is_finished));
        for handle in self.fetchers.drain(..) {
            join_stage("fetcher", handle);
        }

        self.work.finish();
        self.wait(events, |s| s.worker.as_ref().map_or(true, JoinHandle::is_finished));
        let recent = self.worker.take().and_then(|h| join_stage("worker", h));

        self.ship.finish();
        self.wait(events, |s| s.shippers.iter().all(JoinHandle::is_finished));
        for handle in self.shippers.drain(..) {
            join_stage("shipper", handle);
        }
        recent
    }

    /// Stop fetching and working at once, drop their queued input and let the
    /// shippers send what is already planned unless shipping itself failed.
    fn shutdown(&mut self, queues: &Queues, events: &EventTracker) {
        self.fetch.shutdown();
        self.work.shutdown();
        for handle in self.fetchers.drain(..) {
            join_stage("fetcher", handle);
        }
        if let Some(handle) = self.worker.take() {
            join_stage("worker", handle);
        }
        let dropped = drain(&queues.data_rx) + drain(&queues.work_rx);
        if dropped > 0 {
            debug!(dropped, "discarded queued entries");
        }

        if events.ship_error() {
            self.ship.shutdown();
        } else {
            self.ship.finish();
        }
        self.wait(events, |s| s.shippers.iter().all(JoinHandle::is_finished));
        for handle in self.shippers.drain(..) {
            join_stage("shipper", handle);
        }
        drain(&queues.insert_rx);
    }
}

pub struct DataProcessor {
    pipeline: usize,
    file_queue: Receiver<PathBuf>,
    handler: IngestHandler,
    events: EventTracker,
    stats: StatHandle,
    options: Arc<ProcessOptions>,
    control: Arc<ProcessorControl>,
}

impl DataProcessor {
    pub fn new(
        pipeline: usize,
        file_queue: Receiver<PathBuf>,
        handler: IngestHandler,
        events: EventTracker,
        stats: StatHandle,
        options: Arc<ProcessOptions>,
        control: Arc<ProcessorControl>,
    ) -> Self {
        Self {
            pipeline,
            file_queue,
            handler,
            events,
            stats,
            options,
            control,
        }
    }

    pub fn run(self) {
        let state = self.process();
        self.control.set_state(state);
        info!(pipeline = self.pipeline, state = ?state, "processor exiting");
    }

    fn process(&self) -> ProcessorState {
        let queues = Queues::new();
        let reader_ctl = StageControl::new();
        let mut stages = Stages::new();

        let reader = match self.spawn_reader(&queues, &reader_ctl) {
            Ok(handle) => handle,
            Err(e) => {
                error!(pipeline = self.pipeline, error = %e, "unable to start reader");
                self.events.set_shutdown();
                return ProcessorState::Shuttered;
            }
        };

        let mut skip_fetch = self.options.skip_fetch();
        let mut recent = RecentIds::new(RECENT_IDS);

        loop {
            let index_list = if skip_fetch {
                Vec::new()
            } else {
                match self.handler.resolve_alias() {
                    Ok(list) => list,
                    Err(e) => {
                        error!(pipeline = self.pipeline, error = %e, "unable to resolve live indices");
                        self.events.set_fetch_error();
                        return self.shut_down(reader, &reader_ctl, &mut stages, &queues);
                    }
                }
            };
            debug!(pipeline = self.pipeline, indices = ?index_list, "starting stages");

            if let Err(e) = self.spawn_stages(&mut stages, &queues, Arc::new(index_list), recent) {
                error!(pipeline = self.pipeline, error = %e, "unable to start pipeline stages");
                self.events.set_shutdown();
                return self.shut_down(reader, &reader_ctl, &mut stages, &queues);
            }
            reader_ctl.unpause();

            loop {
                if self.events.shutdown() {
                    return self.shut_down(reader, &reader_ctl, &mut stages, &queues);
                }
                if reader.is_finished() {
                    return self.complete(reader, &mut stages);
                }
                if self.control.pause_requested() {
                    break;
                }
                std::thread::sleep(POLL);
            }

            debug!(pipeline = self.pipeline, "pausing");
            reader_ctl.pause();
            loop {
                if self.events.shutdown() {
                    return self.shut_down(reader, &reader_ctl, &mut stages, &queues);
                }
                if reader_ctl.is_paused() {
                    break;
                }
                if reader.is_finished() {
                    return self.complete(reader, &mut stages);
                }
                std::thread::sleep(POLL);
            }

            recent = stages
                .finish(&self.events)
                .unwrap_or_else(|| RecentIds::new(RECENT_IDS));
            self.control.set_state(ProcessorState::Paused);
            debug!(pipeline = self.pipeline, "paused");

            if !self.control.wait_for_resume(&self.events) {
                return self.shut_down(reader, &reader_ctl, &mut stages, &queues);
            }
            debug!(pipeline = self.pipeline, "resuming");
            skip_fetch = false;
        }
    }

    fn spawn_reader(
        &self,
        queues: &Queues,
        control: &Arc<StageControl>,
    ) -> anyhow::Result<JoinHandle<()>> {
        let reader = DataReader::new(
            self.pipeline,
            self.file_queue.clone(),
            queues.data_tx.clone(),
            self.events.clone(),
            Arc::clone(control),
        )?;
        Ok(std::thread::Builder::new()
            .name(format!("reader-{}", self.pipeline))
            .spawn(move || reader.run())?)
    }

    fn spawn_stages(
        &self,
        stages: &mut Stages,
        queues: &Queues,
        index_list: Arc<Vec<String>>,
        recent: RecentIds,
    ) -> std::io::Result<()> {
        *stages = Stages::new();

        for n in 0..self.options.fetcher_threads.max(1) {
            let fetcher = DataFetcher::new(
                self.pipeline,
                queues.data_rx.clone(),
                queues.work_tx.clone(),
                self.handler.clone(),
                self.events.clone(),
                self.stats.fork(),
                Arc::clone(&stages.fetch),
                Arc::clone(&self.options),
                Arc::clone(&index_list),
            );
            stages.fetchers.push(
                std::thread::Builder::new()
                    .name(format!("fetcher-{}-{}", self.pipeline, n))
                    .spawn(move || fetcher.run())?,
            );
        }

        let worker = DataWorker::new(
            self.pipeline,
            queues.work_rx.clone(),
            queues.insert_tx.clone(),
            self.stats.fork(),
            Arc::clone(&stages.work),
            PlanContext {
                version: self.options.version,
                reingest: self.options.reingest,
                filter: self.options.filter.clone(),
                names: self.handler.names().clone(),
            },
            recent,
        );
        stages.worker = Some(
            std::thread::Builder::new()
                .name(format!("worker-{}", self.pipeline))
                .spawn(move || worker.run())?,
        );

        for n in 0..self.options.shipper_threads.max(1) {
            let shipper = DataShipper::new(
                self.pipeline,
                queues.insert_rx.clone(),
                self.handler.clone(),
                self.events.clone(),
                self.stats.fork(),
                Arc::clone(&stages.ship),
                self.options.bulk_ship_size,
            );
            stages.shippers.push(
                std::thread::Builder::new()
                    .name(format!("shipper-{}-{}", self.pipeline, n))
                    .spawn(move || shipper.run())?,
            );
        }
        Ok(())
    }

    fn complete(&self, reader: JoinHandle<()>, stages: &mut Stages) -> ProcessorState {
        self.control.set_state(ProcessorState::Finishing);
        join_stage("reader", reader);
        debug!(pipeline = self.pipeline, "reader done, finishing stages");
        stages.finish(&self.events);
        ProcessorState::Complete
    }

    fn shut_down(
        &self,
        reader: JoinHandle<()>,
        reader_ctl: &StageControl,
        stages: &mut Stages,
        queues: &Queues,
    ) -> ProcessorState {
        debug!(pipeline = self.pipeline, "shutting down");
        reader_ctl.shutdown();
        join_stage("reader", reader);
        stages.shutdown(queues, &self.events);
        ProcessorState::Shuttered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settled_wait_times_out_while_running() {
        let control = ProcessorControl::new();
        assert_eq!(
            control.wait_settled(Duration::from_millis(10)),
            ProcessorState::Running
        );
        control.set_state(ProcessorState::Paused);
        assert_eq!(
            control.wait_settled(Duration::from_millis(10)),
            ProcessorState::Paused
        );
    }

    #[test]
    fn resume_marks_running() {
        let control = ProcessorControl::new();
        let events = EventTracker::new();
        control.pause();
        control.set_state(ProcessorState::Paused);

        let waiter = {
            let control = Arc::clone(&control);
            let events = events.clone();
            std::thread::spawn(move || control.wait_for_resume(&events))
        };
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(control.state(), ProcessorState::Paused);
        control.unpause();
        assert!(waiter.join().unwrap());
        assert_eq!(control.state(), ProcessorState::Running);
    }

    #[test]
    fn shutdown_releases_a_paused_processor() {
        let control = ProcessorControl::new();
        let events = EventTracker::new();
        control.pause();
        events.set_shutdown();
        assert!(!control.wait_for_resume(&events));
    }
}
