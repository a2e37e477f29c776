//! In-memory [`SearchBackend`] implementation for tests.
//!
//! Keeps indices, aliases and templates behind a single `RwLock`. Supports the
//! behaviors the pipeline depends on: template aliases applied to matching
//! new indices, `create` conflicts, partial-update merging, alias-based reads
//! and writes, and rollover with a numeric index suffix. Failures can be
//! injected for the next multi-get or bulk call.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;

use crate::diff::merge_doc;
use crate::models::{BulkCommand, DocRef};

use super::{BackendError, BulkItemResult, MultiGetResult, SearchBackend};

#[derive(Default)]
struct State {
    indices: BTreeMap<String, BTreeMap<String, Value>>,
    aliases: BTreeMap<String, BTreeSet<String>>,
    templates: BTreeMap<String, Value>,
}

impl State {
    /// The single physical index a write to `name` lands in.
    fn write_target(&self, name: &str) -> Result<Option<String>, BackendError> {
        if self.indices.contains_key(name) {
            return Ok(Some(name.to_string()));
        }
        match self.aliases.get(name) {
            Some(set) if set.len() == 1 => Ok(set.iter().next().cloned()),
            Some(set) if set.len() > 1 => Err(BackendError::Status {
                status: 400,
                reason: format!("alias [{}] has more than one index associated with it", name),
            }),
            _ => Ok(None),
        }
    }

    /// Every physical index a read of `name` covers.
    fn read_targets(&self, name: &str) -> Vec<String> {
        if self.indices.contains_key(name) {
            return vec![name.to_string()];
        }
        self.aliases
            .get(name)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn add_alias(&mut self, alias: &str, index: &str) {
        self.aliases
            .entry(alias.to_string())
            .or_default()
            .insert(index.to_string());
    }

    fn create_index(&mut self, index: &str, body: &Value) -> Result<(), BackendError> {
        if self.indices.contains_key(index) || self.aliases.contains_key(index) {
            return Err(BackendError::Status {
                status: 400,
                reason: format!("resource_already_exists_exception: index [{}]", index),
            });
        }
        self.indices.insert(index.to_string(), BTreeMap::new());

        let mut aliases: Vec<String> = Vec::new();
        for template in self.templates.values() {
            if template_matches(template, index) {
                aliases.extend(alias_names(template));
            }
        }
        aliases.extend(alias_names(body));
        for alias in aliases {
            self.add_alias(&alias, index);
        }
        Ok(())
    }

    fn apply(&mut self, command: &BulkCommand) -> BulkItemResult {
        let mut result = BulkItemResult {
            op: command.op().to_string(),
            index: command.index().to_string(),
            id: command.id().to_string(),
            status: 200,
            error: None,
        };

        let target = match self.write_target(command.index()) {
            Ok(Some(target)) => target,
            Ok(None) => match command {
                BulkCommand::Create { .. } | BulkCommand::Index { .. } => {
                    if let Err(e) = self.create_index(command.index(), &Value::Null) {
                        return fail(result, 400, e.to_string());
                    }
                    command.index().to_string()
                }
                _ => return fail(result, 404, "index_not_found_exception".into()),
            },
            Err(e) => return fail(result, 400, e.to_string()),
        };
        result.index = target.clone();

        let docs = self.indices.entry(target).or_default();
        match command {
            BulkCommand::Create { id, source, .. } => {
                if docs.contains_key(id) {
                    return fail(result, 409, "version_conflict_engine_exception".into());
                }
                docs.insert(id.clone(), source.clone());
                result.status = 201;
            }
            BulkCommand::Index { id, source, .. } => {
                if docs.insert(id.clone(), source.clone()).is_none() {
                    result.status = 201;
                }
            }
            BulkCommand::Update { id, doc, .. } => match docs.get_mut(id) {
                Some(existing) => merge_doc(existing, doc),
                None => return fail(result, 404, "document_missing_exception".into()),
            },
            BulkCommand::Delete { id, .. } => {
                if docs.remove(id).is_none() {
                    return fail(result, 404, "not_found".into());
                }
            }
        }
        result
    }
}

fn fail(mut result: BulkItemResult, status: u16, reason: String) -> BulkItemResult {
    result.status = status;
    result.error = Some(reason);
    result
}

fn alias_names(body: &Value) -> Vec<String> {
    body.get("aliases")
        .and_then(Value::as_object)
        .map(|map| map.keys().cloned().collect())
        .unwrap_or_default()
}

fn template_matches(template: &Value, index: &str) -> bool {
    template
        .get("index_patterns")
        .and_then(Value::as_array)
        .map(|patterns| {
            patterns.iter().filter_map(Value::as_str).any(|p| match p.strip_suffix('*') {
                Some(prefix) => index.starts_with(prefix),
                None => index == p,
            })
        })
        .unwrap_or(false)
}

/// `whois-data-000001` -> `whois-data-000002`.
fn next_index_name(index: &str) -> Result<String, BackendError> {
    let bad = || BackendError::Status {
        status: 400,
        reason: format!("index name [{}] does not match pattern '^.*-\\d+$'", index),
    };
    let (stem, suffix) = index.rsplit_once('-').ok_or_else(bad)?;
    let n: u64 = suffix.parse().map_err(|_| bad())?;
    Ok(format!("{}-{:06}", stem, n + 1))
}

/// In-memory search engine for tests.
pub struct InMemoryBackend {
    state: RwLock<State>,
    node_version: String,
    fail_next_multi_get: Mutex<Option<BackendError>>,
    fail_next_bulk: Mutex<Option<BackendError>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::with_version("8.11.3")
    }

    /// A backend reporting `version` as its node version.
    pub fn with_version(version: &str) -> Self {
        Self {
            state: RwLock::new(State::default()),
            node_version: version.to_string(),
            fail_next_multi_get: Mutex::new(None),
            fail_next_bulk: Mutex::new(None),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `multi_get` call fail with `err`.
    pub fn fail_next_multi_get(&self, err: BackendError) {
        *self
            .fail_next_multi_get
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(err);
    }

    /// Make the next `bulk` call fail with `err`.
    pub fn fail_next_bulk(&self, err: BackendError) {
        *self
            .fail_next_bulk
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(err);
    }

    /// All `(id, source)` pairs stored in an index or behind an alias.
    pub fn documents_in(&self, name: &str) -> Vec<(String, Value)> {
        let state = self.read();
        state
            .read_targets(name)
            .iter()
            .filter_map(|index| state.indices.get(index))
            .flat_map(|docs| docs.iter().map(|(id, v)| (id.clone(), v.clone())))
            .collect()
    }

    /// Physical index names, sorted.
    pub fn index_names(&self) -> Vec<String> {
        self.read().indices.keys().cloned().collect()
    }

    pub fn template(&self, name: &str) -> Option<Value> {
        self.read().templates.get(name).cloned()
    }

    fn take(slot: &Mutex<Option<BackendError>>) -> Option<BackendError> {
        slot.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchBackend for InMemoryBackend {
    fn node_versions(&self) -> Result<Vec<String>, BackendError> {
        Ok(vec![self.node_version.clone()])
    }

    fn index_exists(&self, index: &str) -> Result<bool, BackendError> {
        let state = self.read();
        Ok(state.indices.contains_key(index) || state.aliases.contains_key(index))
    }

    fn template_exists(&self, name: &str) -> Result<bool, BackendError> {
        Ok(self.read().templates.contains_key(name))
    }

    fn put_template(&self, name: &str, body: &Value) -> Result<(), BackendError> {
        self.write().templates.insert(name.to_string(), body.clone());
        Ok(())
    }

    fn create_index(&self, index: &str, body: &Value) -> Result<(), BackendError> {
        self.write().create_index(index, body)
    }

    fn get_document(&self, index: &str, id: &str) -> Result<Option<Value>, BackendError> {
        let state = self.read();
        let targets = state.read_targets(index);
        if targets.is_empty() {
            return Err(BackendError::NotFound(format!("no such index [{}]", index)));
        }
        Ok(targets
            .iter()
            .filter_map(|t| state.indices.get(t).and_then(|docs| docs.get(id)))
            .next()
            .cloned())
    }

    fn create_document(&self, index: &str, id: &str, body: &Value) -> Result<(), BackendError> {
        let result = self.write().apply(&BulkCommand::Create {
            index: index.to_string(),
            id: id.to_string(),
            source: body.clone(),
        });
        item_to_result(result)
    }

    fn update_document(&self, index: &str, id: &str, doc: &Value) -> Result<(), BackendError> {
        let result = self.write().apply(&BulkCommand::Update {
            index: index.to_string(),
            id: id.to_string(),
            doc: doc.clone(),
        });
        item_to_result(result)
    }

    fn multi_get(&self, docs: &[DocRef]) -> Result<Vec<MultiGetResult>, BackendError> {
        if let Some(err) = Self::take(&self.fail_next_multi_get) {
            return Err(err);
        }
        let state = self.read();
        Ok(docs
            .iter()
            .map(|doc| {
                let found = state.read_targets(&doc.index).into_iter().find_map(|index| {
                    state
                        .indices
                        .get(&index)
                        .and_then(|stored| stored.get(&doc.id))
                        .map(|source| (index, source.clone()))
                });
                match found {
                    Some((index, source)) => MultiGetResult {
                        index,
                        id: doc.id.clone(),
                        source: Some(source),
                    },
                    None => MultiGetResult {
                        index: doc.index.clone(),
                        id: doc.id.clone(),
                        source: None,
                    },
                }
            })
            .collect())
    }

    fn bulk(&self, commands: &[BulkCommand]) -> Result<Vec<BulkItemResult>, BackendError> {
        if let Some(err) = Self::take(&self.fail_next_bulk) {
            return Err(err);
        }
        let mut state = self.write();
        Ok(commands.iter().map(|c| state.apply(c)).collect())
    }

    fn count(&self, index: &str) -> Result<u64, BackendError> {
        let state = self.read();
        let targets = state.read_targets(index);
        if targets.is_empty() {
            return Err(BackendError::NotFound(format!("no such index [{}]", index)));
        }
        Ok(targets
            .iter()
            .filter_map(|t| state.indices.get(t))
            .map(|docs| docs.len() as u64)
            .sum())
    }

    fn resolve_alias(&self, alias: &str) -> Result<Vec<String>, BackendError> {
        self.read()
            .aliases
            .get(alias)
            .map(|set| set.iter().cloned().collect())
            .ok_or_else(|| BackendError::NotFound(format!("alias [{}] missing", alias)))
    }

    fn rollover(&self, write_alias: &str, body: &Value) -> Result<String, BackendError> {
        let mut state = self.write();
        let old = match state.aliases.get(write_alias) {
            Some(set) if set.len() == 1 => set.iter().next().cloned(),
            _ => None,
        }
        .ok_or_else(|| {
            BackendError::Status {
                status: 400,
                reason: format!("rollover target [{}] must point to a single index", write_alias),
            }
        })?;

        let new_index = next_index_name(&old)?;
        state.create_index(&new_index, body)?;
        if let Some(set) = state.aliases.get_mut(write_alias) {
            set.remove(&old);
            set.insert(new_index.clone());
        }
        Ok(new_index)
    }

    fn refresh(&self, index: &str) -> Result<(), BackendError> {
        if self.read().read_targets(index).is_empty() {
            return Err(BackendError::NotFound(format!("no such index [{}]", index)));
        }
        Ok(())
    }
}

fn item_to_result(item: BulkItemResult) -> Result<(), BackendError> {
    if item.ok() {
        return Ok(());
    }
    Err(BackendError::from_status(
        item.status,
        item.error.as_deref().unwrap_or_default(),
    ))
}
