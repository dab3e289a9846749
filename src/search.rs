use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::error::KiraError;

/// One document handed to the bulk endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkAction {
    pub doc_type: String,
    pub id: String,
    pub document: Value,
}

#[derive(Debug, Clone, Default)]
pub struct BulkOutcome {
    /// One message per rejected item.
    pub failures: Vec<String>,
}

/// Document store holding index generations behind a public alias.
pub trait IndexClient: Send + Sync {
    fn exists(&self, name: &str) -> Result<bool, KiraError>;
    fn delete(&self, name: &str) -> Result<(), KiraError>;
    fn create(&self, name: &str, settings: &Value) -> Result<(), KiraError>;
    fn put_schema(&self, name: &str, doc_type: &str, schema: &Value) -> Result<(), KiraError>;
    fn bulk(&self, name: &str, actions: &[BulkAction]) -> Result<BulkOutcome, KiraError>;
    /// Removes `alias` from every index in `old` and adds it to `new` in one request.
    fn reassign_alias(&self, alias: &str, old: &[String], new: &str) -> Result<(), KiraError>;
    fn alias_holders(&self, alias: &str) -> Result<Vec<String>, KiraError>;
    fn list_names(&self) -> Result<Vec<String>, KiraError>;
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BulkStats {
    pub batches: usize,
    pub documents: usize,
}

/// Buffers documents and submits them in batches bounded by count and payload size.
pub struct BulkSink<'a, C: IndexClient> {
    client: &'a C,
    index: String,
    max_actions: usize,
    max_bytes: usize,
    pending: Vec<BulkAction>,
    pending_bytes: usize,
    stats: BulkStats,
}

impl<'a, C: IndexClient> BulkSink<'a, C> {
    pub fn new(client: &'a C, index: &str, max_actions: usize, max_bytes: usize) -> Self {
        Self {
            client,
            index: index.to_string(),
            max_actions: max_actions.max(1),
            max_bytes: max_bytes.max(1),
            pending: Vec::new(),
            pending_bytes: 0,
            stats: BulkStats::default(),
        }
    }

    pub fn add(&mut self, doc_type: &str, id: &str, document: Value) -> Result<(), KiraError> {
        let size = serde_json::to_vec(&document)
            .map_err(|err| KiraError::Serialization(err.to_string()))?
            .len()
            + id.len()
            + doc_type.len();
        self.pending.push(BulkAction {
            doc_type: doc_type.to_string(),
            id: id.to_string(),
            document,
        });
        self.pending_bytes += size;
        if self.pending.len() >= self.max_actions || self.pending_bytes >= self.max_bytes {
            self.flush()?;
        }
        Ok(())
    }

    /// Submits the buffered batch; a single rejected item fails the batch.
    pub fn flush(&mut self) -> Result<(), KiraError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.pending);
        self.pending_bytes = 0;
        let outcome = self.client.bulk(&self.index, &batch)?;
        if !outcome.failures.is_empty() {
            return Err(KiraError::IndexHttp(format!(
                "{} of {} documents rejected, first: {}",
                outcome.failures.len(),
                batch.len(),
                outcome.failures[0]
            )));
        }
        self.stats.batches += 1;
        self.stats.documents += batch.len();
        debug!(index = %self.index, size = batch.len(), "bulk batch accepted");
        Ok(())
    }

    pub fn finish(mut self) -> Result<BulkStats, KiraError> {
        self.flush()?;
        Ok(self.stats)
    }
}

#[derive(Clone)]
pub struct ElasticsearchClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<BTreeMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(rename = "_id", default)]
    id: Option<String>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CatIndex {
    index: String,
}

impl ElasticsearchClient {
    pub fn new(base_url: &str) -> Result<Self, KiraError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-repo/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| KiraError::IndexHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| KiraError::IndexHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn handle_status(response: Response) -> Result<Response, KiraError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "index request failed".to_string());
        Err(KiraError::IndexStatus { status, message })
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, KiraError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 500;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(KiraError::IndexHttp(err.to_string()));
                }
            }
        }
    }
}

impl IndexClient for ElasticsearchClient {
    fn exists(&self, name: &str) -> Result<bool, KiraError> {
        let url = self.url(name);
        let response = self.send_with_retries(|| self.client.head(&url))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            _ => Self::handle_status(response).map(|_| true),
        }
    }

    fn delete(&self, name: &str) -> Result<(), KiraError> {
        let url = self.url(name);
        let response = self.send_with_retries(|| self.client.delete(&url))?;
        Self::handle_status(response).map(|_| ())
    }

    fn create(&self, name: &str, settings: &Value) -> Result<(), KiraError> {
        let url = self.url(name);
        let response = self.send_with_retries(|| self.client.put(&url).json(settings))?;
        Self::handle_status(response).map(|_| ())
    }

    /// Views share one physical index, each under an object keyed by its type.
    fn put_schema(&self, name: &str, doc_type: &str, schema: &Value) -> Result<(), KiraError> {
        let url = self.url(&format!("{name}/_mapping"));
        let body = json!({
            "properties": {
                "doc_type": { "type": "keyword" },
                doc_type: schema,
            }
        });
        let response = self.send_with_retries(|| self.client.put(&url).json(&body))?;
        Self::handle_status(response).map(|_| ())
    }

    fn bulk(&self, name: &str, actions: &[BulkAction]) -> Result<BulkOutcome, KiraError> {
        let mut payload = String::new();
        for action in actions {
            let header = json!({
                "index": { "_index": name, "_id": format!("{}:{}", action.doc_type, action.id) }
            });
            let document = json!({
                "doc_type": action.doc_type,
                action.doc_type.as_str(): action.document,
            });
            payload.push_str(&header.to_string());
            payload.push('\n');
            payload.push_str(&document.to_string());
            payload.push('\n');
        }
        let url = self.url("_bulk");
        let response = self.send_with_retries(|| {
            self.client
                .post(&url)
                .header(CONTENT_TYPE, "application/x-ndjson")
                .body(payload.clone())
        })?;
        let response = Self::handle_status(response)?;
        let parsed = response
            .json::<BulkResponse>()
            .map_err(|err| KiraError::IndexHttp(err.to_string()))?;
        if !parsed.errors {
            return Ok(BulkOutcome::default());
        }
        let failures = parsed
            .items
            .iter()
            .flat_map(|item| item.values())
            .filter_map(|item| {
                item.error.as_ref().map(|error| {
                    format!("{}: {}", item.id.as_deref().unwrap_or("?"), error)
                })
            })
            .collect();
        Ok(BulkOutcome { failures })
    }

    fn reassign_alias(&self, alias: &str, old: &[String], new: &str) -> Result<(), KiraError> {
        let mut actions = old
            .iter()
            .map(|index| json!({ "remove": { "index": index, "alias": alias } }))
            .collect::<Vec<_>>();
        actions.push(json!({ "add": { "index": new, "alias": alias } }));
        let body = json!({ "actions": actions });
        let url = self.url("_aliases");
        let response = self.send_with_retries(|| self.client.post(&url).json(&body))?;
        Self::handle_status(response).map(|_| ())
    }

    fn alias_holders(&self, alias: &str) -> Result<Vec<String>, KiraError> {
        let url = self.url(&format!("_alias/{alias}"));
        let response = self.send_with_retries(|| self.client.get(&url))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = Self::handle_status(response)?;
        let parsed = response
            .json::<BTreeMap<String, Value>>()
            .map_err(|err| KiraError::IndexHttp(err.to_string()))?;
        Ok(parsed.into_keys().collect())
    }

    fn list_names(&self) -> Result<Vec<String>, KiraError> {
        let url = self.url("_cat/indices?format=json&h=index");
        let response = self.send_with_retries(|| self.client.get(&url))?;
        let response = Self::handle_status(response)?;
        let parsed = response
            .json::<Vec<CatIndex>>()
            .map_err(|err| KiraError::IndexHttp(err.to_string()))?;
        Ok(parsed.into_iter().map(|entry| entry.index).collect())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryIndex {
    pub settings: Value,
    pub schemas: BTreeMap<String, Value>,
    /// Keyed by `(doc_type, id)`.
    pub documents: BTreeMap<(String, String), Value>,
}

#[derive(Debug, Default)]
struct MemoryState {
    indices: BTreeMap<String, MemoryIndex>,
    aliases: BTreeMap<String, BTreeSet<String>>,
}

/// In-process document store used for dry runs.
#[derive(Debug, Default)]
pub struct MemoryIndexClient {
    state: Mutex<MemoryState>,
}

impl MemoryIndexClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(&self, name: &str) -> Option<MemoryIndex> {
        self.state().indices.get(name).cloned()
    }

    pub fn documents(&self, name: &str, doc_type: &str) -> Vec<(String, Value)> {
        self.state()
            .indices
            .get(name)
            .map(|index| {
                index
                    .documents
                    .iter()
                    .filter(|((kind, _), _)| kind == doc_type)
                    .map(|((_, id), doc)| (id.clone(), doc.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn missing(name: &str) -> KiraError {
        KiraError::IndexStatus {
            status: 404,
            message: format!("no such index: {name}"),
        }
    }
}

impl IndexClient for MemoryIndexClient {
    fn exists(&self, name: &str) -> Result<bool, KiraError> {
        Ok(self.state().indices.contains_key(name))
    }

    fn delete(&self, name: &str) -> Result<(), KiraError> {
        let mut state = self.state();
        state
            .indices
            .remove(name)
            .ok_or_else(|| Self::missing(name))?;
        for holders in state.aliases.values_mut() {
            holders.remove(name);
        }
        Ok(())
    }

    fn create(&self, name: &str, settings: &Value) -> Result<(), KiraError> {
        let mut state = self.state();
        if state.indices.contains_key(name) {
            return Err(KiraError::IndexStatus {
                status: 400,
                message: format!("index already exists: {name}"),
            });
        }
        state.indices.insert(
            name.to_string(),
            MemoryIndex {
                settings: settings.clone(),
                ..MemoryIndex::default()
            },
        );
        Ok(())
    }

    fn put_schema(&self, name: &str, doc_type: &str, schema: &Value) -> Result<(), KiraError> {
        let mut state = self.state();
        let index = state
            .indices
            .get_mut(name)
            .ok_or_else(|| Self::missing(name))?;
        index.schemas.insert(doc_type.to_string(), schema.clone());
        Ok(())
    }

    fn bulk(&self, name: &str, actions: &[BulkAction]) -> Result<BulkOutcome, KiraError> {
        let mut state = self.state();
        let index = state
            .indices
            .get_mut(name)
            .ok_or_else(|| Self::missing(name))?;
        let mut failures = Vec::new();
        for action in actions {
            if !index.schemas.contains_key(&action.doc_type) {
                failures.push(format!("{}: no schema for {}", action.id, action.doc_type));
                continue;
            }
            index.documents.insert(
                (action.doc_type.clone(), action.id.clone()),
                action.document.clone(),
            );
        }
        Ok(BulkOutcome { failures })
    }

    fn reassign_alias(&self, alias: &str, old: &[String], new: &str) -> Result<(), KiraError> {
        let mut state = self.state();
        if !state.indices.contains_key(new) {
            return Err(Self::missing(new));
        }
        if let Some(name) = old.iter().find(|name| !state.indices.contains_key(*name)) {
            return Err(Self::missing(name));
        }
        let holders = state.aliases.entry(alias.to_string()).or_default();
        for name in old {
            holders.remove(name);
        }
        holders.insert(new.to_string());
        Ok(())
    }

    fn alias_holders(&self, alias: &str) -> Result<Vec<String>, KiraError> {
        Ok(self
            .state()
            .aliases
            .get(alias)
            .map(|holders| holders.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn list_names(&self) -> Result<Vec<String>, KiraError> {
        Ok(self.state().indices.keys().cloned().collect())
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_flushes_on_action_count() {
        let client = MemoryIndexClient::new();
        client.create("idx", &json!({})).unwrap();
        client.put_schema("idx", "file", &json!({})).unwrap();
        let mut sink = BulkSink::new(&client, "idx", 2, usize::MAX);
        for id in ["a", "b", "c"] {
            sink.add("file", id, json!({ "id": id })).unwrap();
        }
        assert_eq!(client.documents("idx", "file").len(), 2);
        let stats = sink.finish().unwrap();
        assert_eq!(stats.batches, 2);
        assert_eq!(stats.documents, 3);
        assert_eq!(client.documents("idx", "file").len(), 3);
    }

    #[test]
    fn sink_reports_rejected_items() {
        let client = MemoryIndexClient::new();
        client.create("idx", &json!({})).unwrap();
        let mut sink = BulkSink::new(&client, "idx", 10, usize::MAX);
        sink.add("file", "a", json!({})).unwrap();
        assert!(sink.finish().is_err());
    }
}
