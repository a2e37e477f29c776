//! Core data models for whois-ingest.
//!
//! These types describe the documents stored in the search engine (live and
//! delta domain records, the metadata pointer and per-import metadata) and the
//! transient values that flow between pipeline stages.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Key/value whois fields of one domain. Empty CSV cells are stored as `None`.
pub type Details = BTreeMap<String, Option<String>>;

/// Field names used in stored domain documents.
pub mod keys {
    pub const DOMAIN_NAME: &str = "domainName";
    pub const VERSION: &str = "dataVersion";
    pub const FIRST_SEEN: &str = "dataFirstSeen";
    pub const DATE_FIRST_SEEN: &str = "dateFirstSeen";
    pub const DATE_LAST_SEEN: &str = "dateLastSeen";
    pub const DATE_CREATED: &str = "dateCreated";
    pub const DATE_UPDATED: &str = "dateUpdated";
    pub const HISTORICAL: &str = "historical";
    pub const DETAILS: &str = "details";
}

/// Body of a domain document.
///
/// With `historical == false` this is the LiveRecord, the single current
/// truth for a domain. With `historical == true` it is a DeltaRecord, an
/// immutable archived copy of a prior LiveRecord.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainRecord {
    pub domain_name: String,
    pub tld: String,
    #[serde(default)]
    pub details: Details,
    /// Last import version that created, changed or confirmed this record.
    pub data_version: u64,
    /// Import version in which the domain was first seen.
    pub data_first_seen: u64,
    pub date_first_seen: String,
    pub date_last_seen: String,
    pub date_created: String,
    pub date_updated: String,
    #[serde(default)]
    pub historical: bool,
}

impl DomainRecord {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A LiveRecord as returned by a multi-get: its physical index, id and body.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedRecord {
    pub index: String,
    pub id: String,
    pub source: DomainRecord,
}

/// A freshly parsed entry paired with the LiveRecord found for it, if any.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub entry: DomainRecord,
    pub existing: Option<FetchedRecord>,
}

/// One write shipped to the search engine in a bulk request.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkCommand {
    /// Create a document; fails with a conflict if the id exists.
    Create { index: String, id: String, source: Value },
    /// Create or fully replace a document.
    Index { index: String, id: String, source: Value },
    /// Partially update an existing document.
    Update { index: String, id: String, doc: Value },
    Delete { index: String, id: String },
}

impl BulkCommand {
    pub fn op(&self) -> &'static str {
        match self {
            BulkCommand::Create { .. } => "create",
            BulkCommand::Index { .. } => "index",
            BulkCommand::Update { .. } => "update",
            BulkCommand::Delete { .. } => "delete",
        }
    }

    pub fn index(&self) -> &str {
        match self {
            BulkCommand::Create { index, .. }
            | BulkCommand::Index { index, .. }
            | BulkCommand::Update { index, .. }
            | BulkCommand::Delete { index, .. } => index,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            BulkCommand::Create { id, .. }
            | BulkCommand::Index { id, .. }
            | BulkCommand::Update { id, .. }
            | BulkCommand::Delete { id, .. } => id,
        }
    }
}

/// Reference to a single document for a multi-get.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocRef {
    pub index: String,
    pub id: String,
}

/// Singleton metadata document (id 0) tracking versions and import state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataPointer {
    #[serde(default)]
    pub metadata: u64,
    #[serde(rename = "firstVersion", default)]
    pub first_version: u64,
    #[serde(rename = "lastVersion", default)]
    pub last_version: u64,
    /// Nonzero while an import is running or after one was interrupted.
    #[serde(default)]
    pub importing: u64,
}

impl MetadataPointer {
    pub fn empty() -> Self {
        Self {
            metadata: 0,
            first_version: 0,
            last_version: 0,
            importing: 0,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.importing > 0
    }
}

/// Per-import metadata document (id = version).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub metadata: u64,
    #[serde(default)]
    pub comment: String,
    #[serde(rename = "dateProcessed", default)]
    pub date_processed: String,
    #[serde(rename = "dateIngest", default)]
    pub date_ingest: String,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub new: u64,
    #[serde(default)]
    pub updated: u64,
    #[serde(default)]
    pub unchanged: u64,
    #[serde(default)]
    pub duplicates: u64,
    #[serde(default)]
    pub changed_stats: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub included_keys: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub excluded_keys: Option<Vec<String>>,
}

impl MetadataRecord {
    /// A fresh record for `version` with zeroed counters.
    pub fn new(
        version: u64,
        comment: &str,
        date_processed: &str,
        date_ingest: &str,
        filter: &FieldFilter,
    ) -> Self {
        let (included_keys, excluded_keys) = match filter {
            FieldFilter::All => (None, None),
            FieldFilter::Include(keys) => (Some(keys.clone()), None),
            FieldFilter::Exclude(keys) => (None, Some(keys.clone())),
        };
        Self {
            metadata: version,
            comment: comment.to_string(),
            date_processed: date_processed.to_string(),
            date_ingest: date_ingest.to_string(),
            total: 0,
            new: 0,
            updated: 0,
            unchanged: 0,
            duplicates: 0,
            changed_stats: BTreeMap::new(),
            included_keys,
            excluded_keys,
        }
    }

    /// The include/exclude filter this import ran with.
    pub fn filter(&self) -> FieldFilter {
        match (&self.excluded_keys, &self.included_keys) {
            (Some(keys), _) => FieldFilter::Exclude(keys.clone()),
            (None, Some(keys)) => FieldFilter::Include(keys.clone()),
            (None, None) => FieldFilter::All,
        }
    }
}

/// Restricts which `details` keys participate in change detection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FieldFilter {
    #[default]
    All,
    Include(Vec<String>),
    Exclude(Vec<String>),
}

impl FieldFilter {
    /// Build from optional include/exclude lists; exclude wins if both are set.
    pub fn from_lists(include: Option<Vec<String>>, exclude: Option<Vec<String>>) -> Self {
        match (exclude, include) {
            (Some(keys), _) if !keys.is_empty() => FieldFilter::Exclude(keys),
            (_, Some(keys)) if !keys.is_empty() => FieldFilter::Include(keys),
            _ => FieldFilter::All,
        }
    }

    /// The subset of `details` that is compared.
    pub fn apply(&self, details: &Details) -> Details {
        match self {
            FieldFilter::All => details.clone(),
            FieldFilter::Exclude(keys) => details
                .iter()
                .filter(|(k, _)| !keys.iter().any(|x| x == *k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            FieldFilter::Include(keys) => keys
                .iter()
                .filter_map(|k| details.get(k).map(|v| (k.clone(), v.clone())))
                .collect(),
        }
    }
}

/// Write/search alias pair of one index family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloverTarget {
    pub write_alias: String,
    pub search_alias: String,
}

/// Index and alias names derived from a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexNames {
    pub prefix: String,
    pub orig_write: String,
    pub delta_write: String,
    pub orig_search: String,
    pub delta_search: String,
    pub search: String,
    pub meta: String,
    pub template_pattern: String,
    pub template_name: String,
}

impl IndexNames {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            orig_write: format!("{}-data-write", prefix),
            delta_write: format!("{}-data-delta-write", prefix),
            orig_search: format!("{}-data-orig", prefix),
            delta_search: format!("{}-data-delta", prefix),
            search: format!("{}-data-search", prefix),
            meta: format!("{}-meta", prefix),
            template_pattern: format!("{}-data-*", prefix),
            template_name: format!("{}-template", prefix),
        }
    }

    pub fn first_orig_index(&self) -> String {
        format!("{}-data-000001", self.prefix)
    }

    pub fn first_delta_index(&self) -> String {
        format!("{}-data-delta-000001", self.prefix)
    }

    pub fn orig_family(&self) -> RolloverTarget {
        RolloverTarget {
            write_alias: self.orig_write.clone(),
            search_alias: self.orig_search.clone(),
        }
    }

    pub fn delta_family(&self) -> RolloverTarget {
        RolloverTarget {
            write_alias: self.delta_write.clone(),
            search_alias: self.delta_search.clone(),
        }
    }
}

/// Settings/mappings for the metadata index.
pub fn metadata_index_body() -> Value {
    json!({
        "settings": {
            "index": {
                "number_of_shards": 1,
                "analysis": {
                    "analyzer": {
                        "default": { "type": "keyword" }
                    }
                }
            }
        },
        "mappings": {
            "properties": {
                "dateProcessed": { "type": "keyword" },
                "dateIngest": { "type": "keyword" }
            }
        }
    })
}
