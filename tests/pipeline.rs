//! End-to-end imports against the in-memory backend.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;

use whois_ingest::config::IngestConfig;
use whois_ingest::error::IngestError;
use whois_ingest::events::EventTracker;
use whois_ingest::file_reader::InputSource;
use whois_ingest::ingest::{DataPopulator, PopulatorOptions};
use whois_ingest::ingest_handler::IngestHandler;
use whois_ingest_core::backend::memory::InMemoryBackend;
use whois_ingest_core::backend::{BackendError, SearchBackend};

struct Harness {
    backend: Arc<InMemoryBackend>,
    rollover_size: u64,
    rollover_interval: Duration,
}

impl Harness {
    fn new() -> Self {
        Self {
            backend: Arc::new(InMemoryBackend::new()),
            rollover_size: 1_000_000,
            rollover_interval: Duration::from_secs(3600),
        }
    }

    fn handler(&self) -> IngestHandler {
        IngestHandler::new(
            self.backend.clone(),
            "whois",
            self.rollover_size,
            self.rollover_interval,
        )
    }

    fn options(&self, dir: &Path, day: &str) -> PopulatorOptions {
        let mut options = PopulatorOptions::from_config(&IngestConfig::default())
            .with_source(InputSource::Directory(dir.to_path_buf()));
        options.template_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("templates");
        options.ingest_day = day.to_string();
        options.pipelines = 1;
        options
    }

    fn populator(&self, dir: &Path, day: &str) -> DataPopulator {
        DataPopulator::new(self.handler(), self.options(dir, day), EventTracker::new())
    }

    /// Live records keyed by doc id.
    fn live(&self) -> Vec<(String, Value)> {
        self.backend.documents_in("whois-data-orig")
    }

    fn live_doc(&self, id: &str) -> Value {
        self.live()
            .into_iter()
            .find(|(doc_id, _)| doc_id == id)
            .map(|(_, doc)| doc)
            .unwrap_or_else(|| panic!("no live record {}", id))
    }

    fn deltas(&self) -> Vec<(String, Value)> {
        self.backend.documents_in("whois-data-delta")
    }

    fn pointer(&self) -> Value {
        self.record(0)
    }

    fn record(&self, version: u64) -> Value {
        self.backend
            .get_document("whois-meta", &version.to_string())
            .unwrap()
            .unwrap()
    }
}

fn input(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for (name, content) in files {
        std::fs::write(dir.path().join(name), content).unwrap();
    }
    dir
}

#[test]
fn changed_registrant_is_versioned() {
    let h = Harness::new();

    let v1 = input(&[("a.csv", "domainName,registrant_name\nexample.com,Alice\n")]);
    let stats = h.populator(v1.path(), "2024-01-01").ingest().unwrap();
    assert_eq!((stats.total, stats.new), (1, 1));

    let live = h.live_doc("com.example");
    assert_eq!(live["domainName"], "example.com");
    assert_eq!(live["details"]["registrant_name"], "Alice");
    assert_eq!(live["dataVersion"], 1);
    assert!(h.deltas().is_empty());

    let v2 = input(&[("a.csv", "domainName,registrant_name\nexample.com,Bob\n")]);
    let stats = h.populator(v2.path(), "2024-02-01").ingest().unwrap();
    assert_eq!((stats.total, stats.updated), (1, 1));
    assert_eq!(stats.changed_stats["registrant_name"], 1);

    let deltas = h.deltas();
    assert_eq!(deltas.len(), 1);
    let (delta_id, delta) = &deltas[0];
    assert_eq!(delta_id, "com.example#1");
    assert_eq!(delta["historical"], true);
    assert_eq!(delta["dataVersion"], 1);
    assert_eq!(delta["details"]["registrant_name"], "Alice");

    let live = h.live_doc("com.example");
    assert_eq!(live["details"]["registrant_name"], "Bob");
    assert_eq!(live["dataVersion"], 2);
    assert_eq!(live["dataFirstSeen"], 1);
    assert_eq!(live["dateFirstSeen"], "2024-01-01");
    assert_eq!(live["dateLastSeen"], "2024-02-01");
    assert_eq!(h.live().len(), 1);

    let pointer = h.pointer();
    assert_eq!(pointer["lastVersion"], 2);
    assert_eq!(pointer["firstVersion"], 1);
    assert_eq!(pointer["importing"], 0);

    let record = h.backend.get_document("whois-meta", "2").unwrap().unwrap();
    assert_eq!(record["updated"], 1);
    assert_eq!(record["dateIngest"], "2024-02-01");
}

#[test]
fn unchanged_domain_only_moves_version() {
    let h = Harness::new();
    let rows = "domainName,registrant_name,status\nexample.com,Alice,ok\n";

    let v1 = input(&[("a.csv", rows)]);
    h.populator(v1.path(), "2024-01-01").ingest().unwrap();
    let v2 = input(&[("a.csv", rows)]);
    let stats = h.populator(v2.path(), "2024-02-01").ingest().unwrap();

    assert_eq!((stats.total, stats.unchanged, stats.updated), (1, 1, 0));
    assert!(h.deltas().is_empty());
    let live = h.live_doc("com.example");
    assert_eq!(live["dataVersion"], 2);
    assert_eq!(live["dateFirstSeen"], "2024-01-01");
    assert_eq!(live["dateLastSeen"], "2024-02-01");
}

#[test]
fn repeated_rows_count_as_duplicates() {
    let h = Harness::new();
    let rows = "domainName,registrant_name\n\
                example.com,Alice\n\
                example.com,Mallory\n\
                other.org,Carol\n";

    let v1 = input(&[("a.csv", rows)]);
    let stats = h.populator(v1.path(), "2024-01-01").ingest().unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.new, 2);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(h.live().len(), 2);
    assert_eq!(h.live_doc("com.example")["details"]["registrant_name"], "Alice");

    let v2 = input(&[("a.csv", rows)]);
    let stats = h.populator(v2.path(), "2024-02-01").ingest().unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.unchanged, 2);
    assert!(h.deltas().is_empty());
}

#[test]
fn malformed_rows_are_dropped() {
    let h = Harness::new();
    let long_label = "a".repeat(64);
    let content = format!(
        "domainName,registrant_name\n\
         ,Nobody\n\
         {}.com,TooLong\n\
         short.com\n\
         good.com,Alice\n",
        long_label
    );
    let v1 = input(&[("a.csv", &content), ("empty.csv", "")]);
    let stats = h.populator(v1.path(), "2024-01-01").ingest().unwrap();
    assert_eq!((stats.total, stats.new), (1, 1));
    let ids: Vec<String> = h.live().into_iter().map(|(id, _)| id).collect();
    assert_eq!(ids, vec!["com.good".to_string()]);
}

#[test]
fn reingest_of_completed_version_is_idempotent() {
    let h = Harness::new();
    let v1 = input(&[("a.csv", "domainName,registrant_name\nexample.com,Alice\nother.org,Carol\n")]);
    h.populator(v1.path(), "2024-01-01").ingest().unwrap();

    let v2 = input(&[("a.csv", "domainName,registrant_name\nexample.com,Bob\nother.org,Carol\nnew.net,Dan\n")]);
    let first = h.populator(v2.path(), "2024-02-01").ingest().unwrap();
    let deltas_before = h.deltas().len();

    let again = h.populator(v2.path(), "2024-02-01").reingest().unwrap();
    assert_eq!(again, first);
    assert_eq!(h.deltas().len(), deltas_before);
    assert_eq!(h.pointer()["lastVersion"], 2);
    assert_eq!(h.pointer()["importing"], 0);
}

#[test]
fn ship_failure_aborts_and_blocks_next_ingest() {
    let h = Harness::new();
    let v1 = input(&[("a.csv", "domainName,registrant_name\nexample.com,Alice\n")]);
    h.populator(v1.path(), "2024-01-01").ingest().unwrap();

    let v2 = input(&[("a.csv", "domainName,registrant_name\nexample.com,Bob\n")]);
    h.backend
        .fail_next_bulk(BackendError::Status {
            status: 500,
            reason: "boom".into(),
        });
    match h.populator(v2.path(), "2024-02-01").ingest() {
        Err(IngestError::Aborted { reason }) => assert!(reason.contains("ship")),
        other => panic!("expected abort, got {:?}", other.map(|s| s.total)),
    }
    assert_eq!(h.pointer()["importing"], 2);
    assert_eq!(h.live_doc("com.example")["details"]["registrant_name"], "Alice");

    match h.populator(v2.path(), "2024-02-01").ingest() {
        Err(IngestError::InterruptedImport { version }) => assert_eq!(version, 2),
        other => panic!("expected refusal, got {:?}", other.map(|s| s.total)),
    }

    // nothing was written, so nothing was counted
    let aborted = h.record(2);
    assert_eq!(aborted["total"], 0);
    assert_eq!(aborted["updated"], 0);

    let stats = h.populator(v2.path(), "2024-02-01").reingest().unwrap();
    assert_eq!(h.pointer()["importing"], 0);
    assert_eq!(stats.failed, 0);
    let record = h.record(2);
    for (field, expected) in [
        ("total", 1),
        ("new", 0),
        ("updated", 1),
        ("unchanged", 0),
        ("duplicates", 0),
    ] {
        assert_eq!(record[field], expected, "{}", field);
    }
    assert_eq!(record["changed_stats"]["registrant_name"], 1);
    assert!(record.get("failed").is_none(), "failed is never persisted");
    let live = h.live_doc("com.example");
    assert_eq!(live["details"]["registrant_name"], "Bob");
    assert_eq!(live["dataVersion"], 2);
    let delta_ids: Vec<String> = h.deltas().into_iter().map(|(id, _)| id).collect();
    assert_eq!(delta_ids, vec!["com.example#1".to_string()]);
}

#[test]
fn fetch_failure_aborts_import() {
    let h = Harness::new();
    let v1 = input(&[("a.csv", "domainName,registrant_name\nexample.com,Alice\n")]);
    h.populator(v1.path(), "2024-01-01").ingest().unwrap();

    h.backend
        .fail_next_multi_get(BackendError::CircuitBreaker("circuit_breaking_exception".into()));
    let v2 = input(&[("a.csv", "domainName,registrant_name\nexample.com,Bob\n")]);
    match h.populator(v2.path(), "2024-02-01").ingest() {
        Err(IngestError::Aborted { reason }) => assert!(reason.contains("fetch")),
        other => panic!("expected abort, got {:?}", other.map(|s| s.total)),
    }
    assert_eq!(h.pointer()["importing"], 2);
    assert_eq!(h.live_doc("com.example")["dataVersion"], 1);
}

#[test]
fn interrupted_by_operator_keeps_marker() {
    let h = Harness::new();
    let v1 = input(&[("a.csv", "domainName,registrant_name\nexample.com,Alice\n")]);
    let events = EventTracker::new();
    events.set_shutdown();
    let mut populator = DataPopulator::new(h.handler(), h.options(v1.path(), "2024-01-01"), events);
    assert!(matches!(
        populator.ingest(),
        Err(IngestError::Aborted { .. })
    ));
    assert_eq!(h.pointer()["importing"], 1);

    populator.clear_interrupted().unwrap();
    assert_eq!(h.pointer()["importing"], 0);
}

#[test]
fn rollover_moves_write_alias_without_losing_work() {
    let mut h = Harness::new();
    let v1 = input(&[(
        "a.csv",
        "domainName,registrant_name\n\
         a.com,A\nb.com,B\nc.com,C\nd.com,D\ne.com,E\n",
    )]);
    h.populator(v1.path(), "2024-01-01").ingest().unwrap();
    assert_eq!(h.live().len(), 5);

    h.rollover_size = 2;
    h.rollover_interval = Duration::from_secs(0);
    let v2 = input(&[
        (
            "a.csv",
            "domainName,registrant_name\n\
             a.com,A2\nb.com,B\nc.com,C2\nd.com,D\ne.com,E2\n",
        ),
        ("b.csv", "domainName,registrant_name\nf.com,F\ng.com,G\nh.com,H\n"),
    ]);
    let mut options = h.options(v2.path(), "2024-02-01");
    options.pipelines = 2;
    options.bulk_ship_size = 1;
    options.bulk_fetch_size = 1;
    let stats = DataPopulator::new(h.handler(), options, EventTracker::new())
        .ingest()
        .unwrap();

    assert_eq!(stats.total, 8);
    assert_eq!(stats.new, 3);
    assert_eq!(stats.updated, 3);
    assert_eq!(stats.unchanged, 2);

    let indices = h.backend.index_names();
    assert!(indices.contains(&"whois-data-000002".to_string()));
    let write_targets = h.backend.resolve_alias("whois-data-write").unwrap();
    assert_eq!(write_targets.len(), 1);
    assert_ne!(write_targets[0], "whois-data-000001");

    let live = h.live();
    let ids: BTreeSet<String> = live.iter().map(|(id, _)| id.clone()).collect();
    assert_eq!(live.len(), 8, "each domain has exactly one live record");
    assert_eq!(ids.len(), 8);
    assert!(live.iter().all(|(_, doc)| doc["dataVersion"] == 2));

    let delta_ids: BTreeSet<String> = h.deltas().into_iter().map(|(id, _)| id).collect();
    let expected: BTreeSet<String> = ["com.a#1", "com.c#1", "com.e#1"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(delta_ids, expected);
}

#[test]
fn filters_are_stored_and_restrict_changes() {
    let h = Harness::new();
    let v1 = input(&[("a.csv", "domainName,registrant_name,status\nexample.com,Alice,ok\n")]);
    h.populator(v1.path(), "2024-01-01").ingest().unwrap();

    let v2 = input(&[("a.csv", "domainName,registrant_name,status\nexample.com,Bob,ok\n")]);
    let mut options = h.options(v2.path(), "2024-02-01");
    options.include_fields = Some(vec!["status".into()]);
    let stats = DataPopulator::new(h.handler(), options, EventTracker::new())
        .ingest()
        .unwrap();
    assert_eq!(stats.unchanged, 1);
    assert!(h.deltas().is_empty());

    let populator = h.populator(v2.path(), "2024-02-01");
    let record = populator.metadata(Some(2)).unwrap();
    assert_eq!(record.included_keys, Some(vec!["status".to_string()]));
    assert!(record.excluded_keys.is_none());
    assert_eq!(populator.metadata(None).unwrap().metadata, 2);
}

#[test]
fn multiple_pipelines_share_the_input() {
    let h = Harness::new();
    let files: Vec<(String, String)> = (0..6)
        .map(|i| {
            (
                format!("{}.csv", i),
                format!(
                    "domainName,registrant_name\nd{}a.com,X\nd{}b.com,Y\n",
                    i, i
                ),
            )
        })
        .collect();
    let refs: Vec<(&str, &str)> = files
        .iter()
        .map(|(n, c)| (n.as_str(), c.as_str()))
        .collect();
    let dir = input(&refs);

    let mut options = h.options(dir.path(), "2024-01-01");
    options.pipelines = 3;
    let stats = DataPopulator::new(h.handler(), options, EventTracker::new())
        .ingest()
        .unwrap();
    assert_eq!((stats.total, stats.new), (12, 12));
    assert_eq!(h.live().len(), 12);
}
