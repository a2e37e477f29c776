//! Change detection and versioning.
//!
//! [`plan_item`] decides, for one freshly parsed entry and the LiveRecord
//! found for it, whether the domain is new, a duplicate within this run,
//! updated or unchanged, and produces the bulk writes that record it.
//!
//! Only keys present in the new row are compared, so a field that disappears
//! from the source data is not reported as a change.

use serde_json::{Map, Value};

use crate::domain::{generate_doc_id, DomainError};
use crate::models::{keys, BulkCommand, FieldFilter, IndexNames, WorkItem};

/// Classification of one work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Reingest found the record already at the target version.
    Skipped,
    New,
    Duplicate,
    Updated,
    Unchanged,
}

impl Outcome {
    /// Whether the item counts towards `total`.
    pub fn counted(&self) -> bool {
        !matches!(self, Outcome::Skipped)
    }
}

/// Per-import inputs to the diff.
#[derive(Debug, Clone)]
pub struct PlanContext {
    pub version: u64,
    pub reingest: bool,
    pub filter: FieldFilter,
    pub names: IndexNames,
}

/// Result of diffing one work item.
#[derive(Debug, Clone)]
pub struct Plan {
    pub doc_id: String,
    pub outcome: Outcome,
    pub commands: Vec<BulkCommand>,
    /// Detail keys whose value changed, for the changed-field histogram.
    pub changed: Vec<String>,
}

/// Diff one work item.
///
/// `written_this_run` is true when this pipeline already emitted a write for
/// the same doc id during the current import; such an entry is a duplicate
/// even if the lookup ran before the first write landed.
pub fn plan_item(
    ctx: &PlanContext,
    item: WorkItem,
    written_this_run: bool,
) -> Result<Plan, DomainError> {
    let WorkItem { mut entry, existing } = item;

    if ctx.reingest {
        if let Some(current) = &existing {
            if current.source.data_version == ctx.version {
                return Ok(Plan {
                    doc_id: current.id.clone(),
                    outcome: Outcome::Skipped,
                    commands: Vec::new(),
                    changed: Vec::new(),
                });
            }
        }
    }

    let doc_id = match &existing {
        Some(current) => current.id.clone(),
        None => generate_doc_id(&entry.domain_name)?,
    };

    let duplicate = written_this_run
        || existing
            .as_ref()
            .is_some_and(|current| current.source.data_version == ctx.version);
    if duplicate {
        return Ok(Plan {
            doc_id,
            outcome: Outcome::Duplicate,
            commands: Vec::new(),
            changed: Vec::new(),
        });
    }

    let Some(current) = existing else {
        return Ok(Plan {
            commands: vec![BulkCommand::Create {
                index: ctx.names.orig_write.clone(),
                id: doc_id.clone(),
                source: entry.to_value(),
            }],
            doc_id,
            outcome: Outcome::New,
            changed: Vec::new(),
        });
    };

    let changed: Vec<String> = ctx
        .filter
        .apply(&entry.details)
        .into_iter()
        .filter(|(key, value)| current.source.details.get(key) != Some(value))
        .map(|(key, _)| key)
        .collect();

    if changed.is_empty() {
        let mut doc = Map::new();
        doc.insert(keys::VERSION.into(), Value::from(ctx.version));
        doc.insert(keys::DATE_LAST_SEEN.into(), Value::from(entry.date_last_seen));
        doc.insert(keys::DATE_UPDATED.into(), Value::from(entry.date_updated));
        doc.insert(
            keys::DETAILS.into(),
            serde_json::to_value(&entry.details).unwrap_or(Value::Null),
        );
        let doc = Value::Object(doc);
        return Ok(Plan {
            commands: vec![BulkCommand::Update {
                index: current.index,
                id: current.id,
                doc,
            }],
            doc_id,
            outcome: Outcome::Unchanged,
            changed,
        });
    }

    let prior_version = current.source.data_version;
    let mut archived = current.source;
    archived.historical = true;

    entry.data_first_seen = archived.data_first_seen;
    entry.date_first_seen = archived.date_first_seen.clone();
    entry.date_created = archived.date_created.clone();

    let commands = vec![
        BulkCommand::Create {
            index: ctx.names.delta_write.clone(),
            id: format!("{}#{}", current.id, prior_version),
            source: archived.to_value(),
        },
        BulkCommand::Index {
            index: current.index,
            id: current.id,
            source: entry.to_value(),
        },
    ];

    Ok(Plan {
        doc_id,
        outcome: Outcome::Updated,
        commands,
        changed,
    })
}

/// Merge of a partial update into a stored document.
pub fn merge_doc(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_doc(existing, value)
                    }
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}
