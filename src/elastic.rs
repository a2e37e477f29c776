//! Elasticsearch [`SearchBackend`] over the HTTP/JSON REST API.
//!
//! Uses a blocking `reqwest` client shared by every pipeline thread. Requests
//! rotate through the configured hosts; connection failures and 502/503/504
//! responses are retried on the next host with exponential backoff, up to
//! `max_retries` times. HTTP 429 is never retried: it is surfaced as
//! [`BackendError::CircuitBreaker`] or [`BackendError::RateLimited`] so the
//! caller can tell the operator to shrink the batch size.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::{Method, Url};
use serde_json::{json, Value};
use tracing::{debug, warn};

use whois_ingest_core::backend::{BackendError, BulkItemResult, MultiGetResult, SearchBackend};
use whois_ingest_core::models::{BulkCommand, DocRef};

use crate::config::ElasticConfig;

enum Body {
    Json(Value),
    Ndjson(String),
}

pub struct ElasticBackend {
    client: Client,
    hosts: Vec<Url>,
    next_host: AtomicUsize,
    username: Option<String>,
    password: Option<String>,
    max_retries: u32,
}

impl ElasticBackend {
    pub fn new(config: &ElasticConfig) -> Result<Self> {
        let mut builder = Client::builder().timeout(Duration::from_secs(config.timeout_secs));

        if let Some(path) = &config.ca_cert {
            let pem = std::fs::read(path)
                .with_context(|| format!("Failed to read CA certificate: {}", path.display()))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .with_context(|| format!("Invalid CA certificate: {}", path.display()))?;
            builder = builder.add_root_certificate(cert);
        }

        let hosts = config
            .hosts
            .iter()
            .map(|h| Url::parse(h).with_context(|| format!("Invalid elastic host: {}", h)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            client: builder.build().context("Failed to build HTTP client")?,
            hosts,
            next_host: AtomicUsize::new(0),
            username: config.username.clone(),
            password: config.password.clone(),
            max_retries: config.max_retries,
        })
    }

    fn url(&self, host: &Url, segments: &[&str], query: &[(&str, &str)]) -> Result<Url, BackendError> {
        let mut url = host.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::Transport(format!("host cannot be a base: {}", host)))?
            .pop_if_empty()
            .extend(segments);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    fn request(&self, method: &Method, url: Url, body: Option<&Body>) -> RequestBuilder {
        let mut req = self.client.request(method.clone(), url);
        if let Some(user) = &self.username {
            req = req.basic_auth(user, self.password.as_ref());
        }
        match body {
            Some(Body::Json(value)) => req.json(value),
            Some(Body::Ndjson(text)) => req
                .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
                .body(text.clone()),
            None => req,
        }
    }

    /// Send a request, returning the status and body text of the first
    /// non-retryable response.
    fn send(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
        body: Option<Body>,
    ) -> Result<(u16, String), BackendError> {
        let mut last_err = BackendError::Transport("no hosts configured".into());

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_millis(250 << (attempt - 1).min(5));
                std::thread::sleep(delay);
            }
            if self.hosts.is_empty() {
                break;
            }
            let idx = self.next_host.fetch_add(1, Ordering::Relaxed) % self.hosts.len();
            let url = self.url(&self.hosts[idx], segments, query)?;

            match self.request(&method, url.clone(), body.as_ref()).send() {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let text = response
                        .text()
                        .map_err(|e| BackendError::Decode(e.to_string()))?;
                    if matches!(status, 502..=504) {
                        warn!(%url, status, attempt, "elastic node unavailable, retrying");
                        last_err = BackendError::from_status(status, &text);
                        continue;
                    }
                    debug!(%method, %url, status, "elastic request");
                    return Ok((status, text));
                }
                Err(e) => {
                    warn!(%url, attempt, error = %e, "elastic request failed, retrying");
                    last_err = BackendError::Transport(e.to_string());
                }
            }
        }

        Err(last_err)
    }

    fn send_ok(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
        body: Option<Body>,
    ) -> Result<Value, BackendError> {
        let (status, text) = self.send(method, segments, query, body)?;
        if !(200..300).contains(&status) {
            return Err(BackendError::from_status(status, &text));
        }
        if text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| BackendError::Decode(e.to_string()))
    }

    fn exists(&self, segments: &[&str]) -> Result<bool, BackendError> {
        let (status, text) = self.send(Method::HEAD, segments, &[], None)?;
        match status {
            200..=299 => Ok(true),
            404 => Ok(false),
            _ => Err(BackendError::from_status(status, &text)),
        }
    }
}

/// Serialize bulk commands as the newline-delimited body of `_bulk`.
pub fn bulk_body(commands: &[BulkCommand]) -> Result<String, BackendError> {
    let mut out = String::new();
    for command in commands {
        let action = json!({ command.op(): { "_index": command.index(), "_id": command.id() } });
        push_line(&mut out, &action)?;
        match command {
            BulkCommand::Create { source, .. } | BulkCommand::Index { source, .. } => {
                push_line(&mut out, source)?
            }
            BulkCommand::Update { doc, .. } => push_line(&mut out, &json!({ "doc": doc }))?,
            BulkCommand::Delete { .. } => {}
        }
    }
    Ok(out)
}

fn push_line(out: &mut String, value: &Value) -> Result<(), BackendError> {
    let line = serde_json::to_string(value).map_err(|e| BackendError::Decode(e.to_string()))?;
    out.push_str(&line);
    out.push('\n');
    Ok(())
}

/// Parse the `items` array of a `_bulk` response.
pub fn parse_bulk_response(response: &Value) -> Result<Vec<BulkItemResult>, BackendError> {
    let items = response
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| BackendError::Decode("bulk response without items".into()))?;

    items
        .iter()
        .map(|item| {
            let (op, body) = item
                .as_object()
                .and_then(|obj| obj.iter().next())
                .ok_or_else(|| BackendError::Decode("empty bulk item".into()))?;
            let error = body.get("error").map(|e| {
                e.get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| e.to_string())
            });
            Ok(BulkItemResult {
                op: op.clone(),
                index: str_field(body, "_index"),
                id: str_field(body, "_id"),
                status: body.get("status").and_then(Value::as_u64).unwrap_or(0) as u16,
                error,
            })
        })
        .collect()
}

/// Parse the `docs` array of an `_mget` response. Error entries count as
/// not found.
pub fn parse_mget_response(response: &Value) -> Result<Vec<MultiGetResult>, BackendError> {
    let docs = response
        .get("docs")
        .and_then(Value::as_array)
        .ok_or_else(|| BackendError::Decode("mget response without docs".into()))?;

    Ok(docs
        .iter()
        .map(|doc| {
            let found = doc.get("found").and_then(Value::as_bool).unwrap_or(false);
            MultiGetResult {
                index: str_field(doc, "_index"),
                id: str_field(doc, "_id"),
                source: if found { doc.get("_source").cloned() } else { None },
            }
        })
        .collect())
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

impl SearchBackend for ElasticBackend {
    fn node_versions(&self) -> Result<Vec<String>, BackendError> {
        let nodes = self.send_ok(
            Method::GET,
            &["_cat", "nodes"],
            &[("h", "version"), ("format", "json")],
            None,
        )?;
        Ok(nodes
            .as_array()
            .map(|nodes| {
                nodes
                    .iter()
                    .filter_map(|n| n.get("version").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn index_exists(&self, index: &str) -> Result<bool, BackendError> {
        self.exists(&[index])
    }

    fn template_exists(&self, name: &str) -> Result<bool, BackendError> {
        self.exists(&["_template", name])
    }

    fn put_template(&self, name: &str, body: &Value) -> Result<(), BackendError> {
        self.send_ok(Method::PUT, &["_template", name], &[], Some(Body::Json(body.clone())))?;
        Ok(())
    }

    fn create_index(&self, index: &str, body: &Value) -> Result<(), BackendError> {
        self.send_ok(Method::PUT, &[index], &[], Some(Body::Json(body.clone())))?;
        Ok(())
    }

    fn get_document(&self, index: &str, id: &str) -> Result<Option<Value>, BackendError> {
        let (status, text) = self.send(Method::GET, &[index, "_doc", id], &[], None)?;
        if status == 404 {
            let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
            if body.get("found").and_then(Value::as_bool) == Some(false) {
                return Ok(None);
            }
            return Err(BackendError::NotFound(text));
        }
        if !(200..300).contains(&status) {
            return Err(BackendError::from_status(status, &text));
        }
        let body: Value =
            serde_json::from_str(&text).map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok(body.get("_source").cloned())
    }

    fn create_document(&self, index: &str, id: &str, body: &Value) -> Result<(), BackendError> {
        self.send_ok(
            Method::PUT,
            &[index, "_create", id],
            &[],
            Some(Body::Json(body.clone())),
        )?;
        Ok(())
    }

    fn update_document(&self, index: &str, id: &str, doc: &Value) -> Result<(), BackendError> {
        self.send_ok(
            Method::POST,
            &[index, "_update", id],
            &[],
            Some(Body::Json(json!({ "doc": doc }))),
        )?;
        Ok(())
    }

    fn multi_get(&self, docs: &[DocRef]) -> Result<Vec<MultiGetResult>, BackendError> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({
            "docs": docs
                .iter()
                .map(|d| json!({ "_index": d.index, "_id": d.id }))
                .collect::<Vec<_>>()
        });
        let response = self.send_ok(Method::POST, &["_mget"], &[], Some(Body::Json(body)))?;
        parse_mget_response(&response)
    }

    fn bulk(&self, commands: &[BulkCommand]) -> Result<Vec<BulkItemResult>, BackendError> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let body = bulk_body(commands)?;
        let response = self.send_ok(Method::POST, &["_bulk"], &[], Some(Body::Ndjson(body)))?;
        parse_bulk_response(&response)
    }

    fn count(&self, index: &str) -> Result<u64, BackendError> {
        let rows = self.send_ok(
            Method::GET,
            &["_cat", "count", index],
            &[("h", "count"), ("format", "json")],
            None,
        )?;
        rows.get(0)
            .and_then(|row| row.get("count"))
            .and_then(|c| match c {
                Value::String(s) => s.parse().ok(),
                other => other.as_u64(),
            })
            .ok_or_else(|| BackendError::Decode(format!("unexpected count response: {}", rows)))
    }

    fn resolve_alias(&self, alias: &str) -> Result<Vec<String>, BackendError> {
        let body = self.send_ok(Method::GET, &["_alias", alias], &[], None)?;
        Ok(body
            .as_object()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn rollover(&self, write_alias: &str, body: &Value) -> Result<String, BackendError> {
        let response = self.send_ok(
            Method::POST,
            &[write_alias, "_rollover"],
            &[],
            Some(Body::Json(body.clone())),
        )?;
        Ok(str_field(&response, "new_index"))
    }

    fn refresh(&self, index: &str) -> Result<(), BackendError> {
        self.send_ok(Method::POST, &[index, "_refresh"], &[], None)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_body_is_newline_delimited() {
        let body = bulk_body(&[
            BulkCommand::Create {
                index: "whois-data-delta-write".into(),
                id: "com.example#1".into(),
                source: json!({"historical": true}),
            },
            BulkCommand::Update {
                index: "whois-data-000001".into(),
                id: "com.example".into(),
                doc: json!({"dataVersion": 2}),
            },
            BulkCommand::Delete {
                index: "whois-data-000001".into(),
                id: "com.gone".into(),
            },
        ])
        .unwrap();

        let lines: Vec<Value> = body
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0]["create"]["_id"], "com.example#1");
        assert_eq!(lines[1]["historical"], true);
        assert_eq!(lines[2]["update"]["_index"], "whois-data-000001");
        assert_eq!(lines[3]["doc"]["dataVersion"], 2);
        assert_eq!(lines[4]["delete"]["_id"], "com.gone");
        assert!(body.ends_with('\n'));
    }

    #[test]
    fn parses_bulk_item_errors() {
        let response = json!({
            "errors": true,
            "items": [
                {"create": {"_index": "a", "_id": "1", "status": 201}},
                {"create": {"_index": "a", "_id": "2", "status": 409,
                    "error": {"type": "version_conflict_engine_exception", "reason": "exists"}}}
            ]
        });
        let items = parse_bulk_response(&response).unwrap();
        assert!(items[0].ok());
        assert_eq!(items[1].status, 409);
        assert_eq!(items[1].error.as_deref(), Some("exists"));
    }

    #[test]
    fn parses_mget_with_missing_index() {
        let response = json!({
            "docs": [
                {"_index": "a", "_id": "1", "found": true, "_source": {"n": 1}},
                {"_index": "b", "_id": "1", "found": false},
                {"_index": "c", "_id": "1", "error": {"type": "index_not_found_exception"}}
            ]
        });
        let docs = parse_mget_response(&response).unwrap();
        assert_eq!(docs[0].source, Some(json!({"n": 1})));
        assert!(docs[1].source.is_none());
        assert!(docs[2].source.is_none());
    }

    #[test]
    fn url_encodes_ids() {
        let config = ElasticConfig {
            hosts: vec!["http://localhost:9200/".into()],
            username: None,
            password: None,
            ca_cert: None,
            index_prefix: "whois".into(),
            rollover_size: 10,
            timeout_secs: 1,
            max_retries: 0,
        };
        let backend = ElasticBackend::new(&config).unwrap();
        let url = backend
            .url(&backend.hosts[0], &["whois-data-delta", "_doc", "com.example#1"], &[("h", "count")])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:9200/whois-data-delta/_doc/com.example%231?h=count"
        );
    }
}
