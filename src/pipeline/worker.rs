//! DataWorker: diffs entries against their LiveRecords and emits bulk writes.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace, warn};

use whois_ingest_core::diff::{plan_item, Outcome, PlanContext};
use whois_ingest_core::domain::generate_doc_id;
use whois_ingest_core::models::WorkItem;

use super::{push, Shipment, StageControl, POLL};
use crate::stats::StatHandle;

/// Number of doc ids remembered for in-run duplicate detection.
pub const RECENT_IDS: usize = 100_000;

/// Bounded set of doc ids this pipeline has written during the current run.
///
/// A lookup can race the write of an earlier row for the same domain; this
/// cache catches that case. Oldest ids are evicted first.
#[derive(Debug)]
pub struct RecentIds {
    capacity: usize,
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ids: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn insert(&mut self, id: String) {
        if self.capacity == 0 || self.ids.contains(&id) {
            return;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.ids.insert(id.clone());
        self.order.push_back(id);
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

pub struct DataWorker {
    pipeline: usize,
    work_queue: Receiver<WorkItem>,
    insert_queue: Sender<Shipment>,
    stats: StatHandle,
    control: Arc<StageControl>,
    context: PlanContext,
    recent: RecentIds,
}

impl DataWorker {
    pub fn new(
        pipeline: usize,
        work_queue: Receiver<WorkItem>,
        insert_queue: Sender<Shipment>,
        stats: StatHandle,
        control: Arc<StageControl>,
        context: PlanContext,
        recent: RecentIds,
    ) -> Self {
        Self {
            pipeline,
            work_queue,
            insert_queue,
            stats,
            control,
            context,
            recent,
        }
    }

    /// Process until finished or shut down, handing back the id cache so a
    /// resumed pipeline keeps it.
    pub fn run(mut self) -> RecentIds {
        loop {
            if self.control.is_shutdown() {
                break;
            }
            match self.work_queue.recv_timeout(POLL) {
                Ok(item) => {
                    if !self.process(item) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.control.is_finishing() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.stats.flush();
        debug!(pipeline = self.pipeline, recent = self.recent.len(), "worker exiting");
        self.recent
    }

    fn process(&mut self, item: WorkItem) -> bool {
        let id = match &item.existing {
            Some(current) => current.id.clone(),
            None => match generate_doc_id(&item.entry.domain_name) {
                Ok(id) => id,
                Err(e) => {
                    warn!(pipeline = self.pipeline, error = %e, "unable to derive document id");
                    return true;
                }
            },
        };

        let plan = match plan_item(&self.context, item, self.recent.contains(&id)) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(pipeline = self.pipeline, error = %e, "unable to process entry");
                return true;
            }
        };
        trace!(pipeline = self.pipeline, id = %plan.doc_id, outcome = ?plan.outcome, "planned");

        if matches!(
            plan.outcome,
            Outcome::New | Outcome::Updated | Outcome::Unchanged
        ) {
            self.recent.insert(plan.doc_id);
        }

        // Nothing to write: count now. Otherwise the shipper counts the
        // entry once its writes land.
        if plan.commands.is_empty() {
            self.stats.record(plan.outcome, &plan.changed);
            return true;
        }
        let shipment = Shipment {
            outcome: plan.outcome,
            changed: plan.changed,
            commands: plan.commands,
        };
        push(&self.insert_queue, shipment, &self.control)
    }
}
