//! DataShipper: batches bulk writes, sends them and settles their counters.

use std::sync::Arc;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error};

use whois_ingest_core::models::BulkCommand;

use super::{Shipment, StageControl, POLL};
use crate::events::EventTracker;
use crate::ingest_handler::IngestHandler;
use crate::stats::StatHandle;

pub struct DataShipper {
    pipeline: usize,
    insert_queue: Receiver<Shipment>,
    handler: IngestHandler,
    events: EventTracker,
    stats: StatHandle,
    control: Arc<StageControl>,
    batch_size: usize,
}

/// Whole shipments waiting for one bulk request. An entry's commands never
/// straddle two requests.
#[derive(Default)]
struct Batch {
    shipments: Vec<Shipment>,
    commands: usize,
}

impl Batch {
    fn push(&mut self, shipment: Shipment) {
        self.commands += shipment.commands.len();
        self.shipments.push(shipment);
    }

    fn is_empty(&self) -> bool {
        self.shipments.is_empty()
    }
}

impl DataShipper {
    pub fn new(
        pipeline: usize,
        insert_queue: Receiver<Shipment>,
        handler: IngestHandler,
        events: EventTracker,
        stats: StatHandle,
        control: Arc<StageControl>,
        batch_size: usize,
    ) -> Self {
        Self {
            pipeline,
            insert_queue,
            handler,
            events,
            stats,
            control,
            batch_size: batch_size.max(1),
        }
    }

    pub fn run(mut self) {
        let mut batch = Batch::default();
        loop {
            if self.control.is_shutdown() {
                break;
            }
            match self.insert_queue.recv_timeout(POLL) {
                Ok(shipment) => {
                    batch.push(shipment);
                    if batch.commands >= self.batch_size && !self.ship(&mut batch) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.control.is_finishing() {
                        if !batch.is_empty() {
                            self.ship(&mut batch);
                        }
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    if !batch.is_empty() {
                        self.ship(&mut batch);
                    }
                    break;
                }
            }
        }
        if !batch.is_empty() {
            debug!(pipeline = self.pipeline, dropped = batch.commands, "shipper dropped pending writes");
        }
        self.stats.flush();
        debug!(pipeline = self.pipeline, "shipper exiting");
    }

    fn ship(&mut self, batch: &mut Batch) -> bool {
        let Batch { shipments, commands } = std::mem::take(batch);
        let mut request: Vec<BulkCommand> = Vec::with_capacity(commands);
        let mut settled = Vec::with_capacity(shipments.len());
        for shipment in shipments {
            request.extend(shipment.commands);
            settled.push((shipment.outcome, shipment.changed));
        }

        match self.handler.ship_documents(&request) {
            Ok(()) => {
                debug!(pipeline = self.pipeline, count = request.len(), "shipped batch");
                for (outcome, changed) in &settled {
                    self.stats.record(*outcome, changed);
                }
                true
            }
            Err(e) => {
                error!(pipeline = self.pipeline, error = %e, "bulk ship failed");
                self.events.set_ship_error();
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{StatTracker, Stats};
    use crossbeam_channel::unbounded;
    use serde_json::json;
    use std::time::Duration;
    use whois_ingest_core::backend::memory::InMemoryBackend;
    use whois_ingest_core::backend::{BackendError, SearchBackend};
    use whois_ingest_core::diff::Outcome;

    fn create(id: &str) -> Shipment {
        Shipment {
            outcome: Outcome::New,
            changed: vec![],
            commands: vec![BulkCommand::Create {
                index: "whois-data-000001".into(),
                id: id.into(),
                source: json!({"domainName": id}),
            }],
        }
    }

    fn run_shipper(
        backend: Arc<InMemoryBackend>,
        shipments: Vec<Shipment>,
    ) -> (EventTracker, Stats) {
        let handler = IngestHandler::new(backend, "whois", 1000, Duration::from_secs(60));
        let (tx, rx) = unbounded();
        for s in shipments {
            tx.send(s).unwrap();
        }
        let events = EventTracker::new();
        let mut tracker = StatTracker::start(Stats::default());
        let control = StageControl::new();
        control.finish();
        DataShipper::new(0, rx, handler, events.clone(), tracker.handle(), control, 2).run();
        (events, tracker.stop())
    }

    #[test]
    fn ships_full_and_partial_batches() {
        let backend = Arc::new(InMemoryBackend::new());
        let (events, stats) = run_shipper(
            backend.clone(),
            vec![create("com.a"), create("com.b"), create("com.c")],
        );
        assert!(!events.ship_error());
        assert_eq!(backend.documents_in("whois-data-000001").len(), 3);
        assert_eq!((stats.total, stats.new), (3, 3));
    }

    #[test]
    fn failure_raises_ship_error_and_counts_nothing() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.fail_next_bulk(BackendError::Transport("down".into()));
        let (events, stats) = run_shipper(
            backend.clone(),
            vec![create("com.a"), create("com.b"), create("com.c")],
        );
        assert!(events.ship_error());
        assert!(events.bulk_error());
        assert!(backend.documents_in("whois-data-000001").is_empty());
        assert_eq!(stats.total, 0);
    }

    #[test]
    fn updated_entry_ships_in_one_request() {
        let backend = Arc::new(InMemoryBackend::new());
        backend
            .create_document("whois-data-000001", "com.a", &json!({"domainName": "a.com"}))
            .unwrap();
        let updated = Shipment {
            outcome: Outcome::Updated,
            changed: vec!["registrant_name".into()],
            commands: vec![
                BulkCommand::Create {
                    index: "whois-data-delta-000001".into(),
                    id: "com.a#1".into(),
                    source: json!({"domainName": "a.com", "historical": true}),
                },
                BulkCommand::Index {
                    index: "whois-data-000001".into(),
                    id: "com.a".into(),
                    source: json!({"domainName": "a.com"}),
                },
            ],
        };
        let (events, stats) = run_shipper(backend.clone(), vec![create("com.b"), updated]);
        assert!(!events.ship_error());
        assert_eq!(backend.documents_in("whois-data-delta-000001").len(), 1);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.updated, 1);
        assert_eq!(stats.changed_stats["registrant_name"], 1);
    }
}
