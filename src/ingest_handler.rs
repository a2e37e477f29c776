//! Typed wrapper over the search backend for ingestion.
//!
//! Owns the index naming scheme and translates backend failures into the
//! metadata, fetch and ship error kinds the pipeline reacts to.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use whois_ingest_core::backend::{BackendError, MultiGetResult, SearchBackend};
use whois_ingest_core::models::{
    metadata_index_body, BulkCommand, DocRef, IndexNames, MetadataPointer, MetadataRecord,
    RolloverTarget,
};

use crate::error::{FetchError, IngestError, Result, ShipError};
use crate::template::cluster_major_version;

const POINTER_ID: &str = "0";

#[derive(Clone)]
pub struct IngestHandler {
    backend: Arc<dyn SearchBackend>,
    names: IndexNames,
    rollover_size: u64,
    rollover_interval: Duration,
}

impl IngestHandler {
    pub fn new(
        backend: Arc<dyn SearchBackend>,
        index_prefix: &str,
        rollover_size: u64,
        rollover_interval: Duration,
    ) -> Self {
        Self {
            backend,
            names: IndexNames::new(index_prefix),
            rollover_size,
            rollover_interval,
        }
    }

    pub fn names(&self) -> &IndexNames {
        &self.names
    }

    pub fn backend(&self) -> &Arc<dyn SearchBackend> {
        &self.backend
    }

    /// Highest major version in the cluster.
    pub fn get_version(&self) -> Result<u64> {
        cluster_major_version(&self.backend.node_versions()?)
    }

    pub fn template_exists(&self) -> Result<bool> {
        Ok(self.backend.template_exists(&self.names.template_name)?)
    }

    pub fn meta_exists(&self) -> Result<bool> {
        Ok(self.backend.index_exists(&self.names.meta)?)
    }

    /// The pointer document, `None` if it does not exist.
    pub fn meta_record(&self) -> Result<Option<MetadataPointer>> {
        match self.backend.get_document(&self.names.meta, POINTER_ID) {
            Ok(Some(doc)) => Ok(Some(serde_json::from_value(doc)?)),
            Ok(None) | Err(BackendError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_metadata(&self, version: u64) -> Result<Option<MetadataRecord>> {
        match self
            .backend
            .get_document(&self.names.meta, &version.to_string())
        {
            Ok(Some(doc)) => Ok(Some(serde_json::from_value(doc)?)),
            Ok(None) | Err(BackendError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn create_metadata(&self, record: &MetadataRecord) -> Result<()> {
        let body = serde_json::to_value(record)?;
        self.backend
            .create_document(&self.names.meta, &record.metadata.to_string(), &body)
            .map_err(|e| IngestError::Metadata(format!("unable to create metadata {}: {}", record.metadata, e)))
    }

    /// Merge `doc` into metadata document `version` (0 is the pointer).
    pub fn update_metadata(&self, version: u64, doc: &Value) -> Result<()> {
        self.backend
            .update_document(&self.names.meta, &version.to_string(), doc)
            .map_err(|e| IngestError::Metadata(format!("unable to update metadata {}: {}", version, e)))
    }

    pub fn clear_interrupted(&self) -> Result<()> {
        if !self.meta_exists()? || self.meta_record()?.is_none() {
            return Err(IngestError::Metadata(
                "Cannot find metadata records for cluster".into(),
            ));
        }
        self.update_metadata(0, &json!({ "importing": 0 }))
    }

    /// Install `template` for the data index pattern, adding the shared
    /// search alias.
    pub fn config_template(&self, mut template: Value) -> Result<()> {
        let obj = template
            .as_object_mut()
            .ok_or_else(|| IngestError::Template("template must be a JSON object".into()))?;
        obj.insert(
            "index_patterns".into(),
            json!([self.names.template_pattern]),
        );
        let aliases = obj
            .entry("aliases")
            .or_insert_with(|| json!({}))
            .as_object_mut()
            .ok_or_else(|| IngestError::Template("template aliases must be an object".into()))?;
        aliases.insert(self.names.search.clone(), json!({}));

        self.backend
            .put_template(&self.names.template_name, &template)?;
        info!(template = %self.names.template_name, "index template configured");
        Ok(())
    }

    /// Bootstrap an empty cluster: template, metadata index, pointer document
    /// and the first live/delta indices behind their aliases.
    pub fn initialize(&self, template: Value) -> Result<()> {
        self.config_template(template)?;

        self.backend
            .create_index(&self.names.meta, &metadata_index_body())?;
        let pointer = serde_json::to_value(MetadataPointer::empty())?;
        self.backend
            .create_document(&self.names.meta, POINTER_ID, &pointer)?;

        self.backend.create_index(
            &self.names.first_orig_index(),
            &json!({ "aliases": { &self.names.orig_write: {}, &self.names.orig_search: {} } }),
        )?;
        self.backend.create_index(
            &self.names.first_delta_index(),
            &json!({ "aliases": { &self.names.delta_write: {}, &self.names.delta_search: {} } }),
        )?;
        info!(prefix = %self.names.prefix, "cluster initialized");
        Ok(())
    }

    /// Refresh `name`, or every data index when `None`.
    pub fn refresh_indices(&self, name: Option<&str>) -> Result<()> {
        let name = name.unwrap_or(&self.names.search);
        Ok(self.backend.refresh(name)?)
    }

    /// Physical live indices, newest first.
    pub fn resolve_alias(&self) -> Result<Vec<String>> {
        let mut indices = self.backend.resolve_alias(&self.names.orig_search)?;
        indices.sort();
        indices.reverse();
        Ok(indices)
    }

    fn rollover_required(&self, write_alias: &str) -> bool {
        match self.backend.count(write_alias) {
            Ok(count) => count > self.rollover_size,
            Err(BackendError::NotFound(_)) => {
                warn!(alias = write_alias, "unable to find required index");
                false
            }
            Err(e) => {
                error!(alias = write_alias, error = %e, "unexpected error checking doc count");
                false
            }
        }
    }

    pub fn rollover_required_orig(&self) -> bool {
        self.rollover_required(&self.names.orig_write)
    }

    pub fn rollover_required_delta(&self) -> bool {
        self.rollover_required(&self.names.delta_write)
    }

    /// Check the rollover thresholds at most once per interval.
    ///
    /// Resets `timer` whenever a check runs; returns the family that needs to
    /// roll over, live indices first.
    pub fn rollover_timer(&self, timer: &mut Instant) -> Option<RolloverTarget> {
        if timer.elapsed() < self.rollover_interval {
            return None;
        }
        *timer = Instant::now();
        debug!("checking if rollover required");
        if self.rollover_required_orig() {
            Some(self.names.orig_family())
        } else if self.rollover_required_delta() {
            Some(self.names.delta_family())
        } else {
            None
        }
    }

    /// Point `target.write_alias` at a fresh index that also joins
    /// `target.search_alias`, then refresh the index it left.
    pub fn rollover_indices(&self, target: &RolloverTarget) -> Result<String> {
        let old = self
            .backend
            .resolve_alias(&target.write_alias)?
            .into_iter()
            .next();

        let new_index = self.backend.rollover(
            &target.write_alias,
            &json!({ "aliases": { &target.search_alias: {} } }),
        )?;
        info!(alias = %target.write_alias, new_index = %new_index, "rolled over index");

        if let Some(old) = old {
            if let Err(e) = self.backend.refresh(&old) {
                warn!(index = %old, error = %e, "unable to refresh rolled over index");
            }
        }
        Ok(new_index)
    }

    /// Bulk multi-get.
    pub fn fetch_documents(
        &self,
        docs: &[DocRef],
    ) -> std::result::Result<Vec<MultiGetResult>, FetchError> {
        self.backend.multi_get(docs).map_err(FetchError::from)
    }

    /// Ship one batch. Not-found and version-conflict item responses are
    /// accepted; any other item failure fails the batch.
    pub fn ship_documents(&self, commands: &[BulkCommand]) -> std::result::Result<(), ShipError> {
        let items = self.backend.bulk(commands)?;
        for item in items {
            if item.ok() || item.status == 404 || item.status == 409 {
                continue;
            }
            debug!(?item, "bulk item failed");
            if item.status == 429 {
                return Err(ShipError::TooLarge(BackendError::from_status(
                    item.status,
                    item.error.as_deref().unwrap_or_default(),
                )));
            }
            return Err(ShipError::Item {
                status: item.status,
                reason: item.error.unwrap_or_default(),
            });
        }
        Ok(())
    }
}
