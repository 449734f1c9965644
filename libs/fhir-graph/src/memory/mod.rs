//! In-process FHIR server
//!
//! [`MemoryFhirServer`] implements [`FhirTransport`] over a plain in-memory store. It speaks
//! enough of the REST protocol for the exchange workflows: atomic transactions with
//! `urn:uuid` rewriting, batches, searches over a fixed parameter table with `_include`
//! expansion. Every request is recorded so tests can assert on round trips, and searches of
//! a given type can be made to fail.

mod search;
mod transaction;

use crate::error::TransportError;
use crate::transport::{FhirTransport, SearchQuery};
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tandem_models::{Bundle, BundleEntry, BundleEntryResponse, BundleType};
use uuid::Uuid;

/// Request observed by a [`MemoryFhirServer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedRequest {
    Search {
        resource_type: String,
        params: Vec<(String, String)>,
    },
    Transaction {
        entries: usize,
    },
    Batch {
        entries: usize,
    },
}

/// Resources by type, each type in insertion order.
#[derive(Debug, Clone, Default)]
pub(crate) struct Store {
    resources: HashMap<String, Vec<JsonValue>>,
    /// Largest page a search returns, whatever `_count` asks for.
    max_page_size: Option<usize>,
}

impl Store {
    pub(crate) fn all(&self, resource_type: &str) -> &[JsonValue] {
        self.resources
            .get(resource_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub(crate) fn get(&self, resource_type: &str, id: &str) -> Option<&JsonValue> {
        self.all(resource_type)
            .iter()
            .find(|r| r.get("id").and_then(|v| v.as_str()) == Some(id))
    }

    /// Current version of a stored resource, 0 if absent.
    pub(crate) fn version(&self, resource_type: &str, id: &str) -> u32 {
        self.get(resource_type, id)
            .and_then(|r| r.pointer("/meta/versionId"))
            .and_then(|v| v.as_str())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Insert or replace by `(resourceType, id)`. The resource must carry both.
    pub(crate) fn put(&mut self, resource: JsonValue) {
        let (Some(rt), Some(id)) = (
            resource.get("resourceType").and_then(|v| v.as_str()).map(str::to_string),
            resource.get("id").and_then(|v| v.as_str()).map(str::to_string),
        ) else {
            return;
        };
        let bucket = self.resources.entry(rt).or_default();
        match bucket
            .iter_mut()
            .find(|r| r.get("id").and_then(|v| v.as_str()) == Some(id.as_str()))
        {
            Some(existing) => *existing = resource,
            None => bucket.push(resource),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    store: Store,
    requests: Vec<RecordedRequest>,
    failing: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct MemoryFhirServer {
    state: Mutex<State>,
}

impl MemoryFhirServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not wedge the other assertions.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a resource as-is, assigning an id when it has none. Returns the id.
    ///
    /// Seeding is not recorded as a request.
    pub fn seed(&self, mut resource: JsonValue) -> String {
        let id = match resource.get("id").and_then(|v| v.as_str()) {
            Some(id) => id.to_string(),
            None => {
                let id = Uuid::new_v4().to_string();
                if let Some(obj) = resource.as_object_mut() {
                    obj.insert("id".to_string(), json!(id));
                }
                id
            }
        };
        if let Some(obj) = resource.as_object_mut() {
            let meta = obj.entry("meta".to_string()).or_insert_with(|| json!({}));
            if let Some(meta) = meta.as_object_mut() {
                meta.entry("versionId".to_string()).or_insert_with(|| json!("1"));
            }
        }
        self.state().store.put(resource);
        id
    }

    pub fn get(&self, resource_type: &str, id: &str) -> Option<JsonValue> {
        self.state().store.get(resource_type, id).cloned()
    }

    pub fn count(&self, resource_type: &str) -> usize {
        self.state().store.all(resource_type).len()
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.state().requests.clear();
    }

    /// Cap search pages at `size` matches. Longer results carry a `next` link.
    pub fn set_max_page_size(&self, size: usize) {
        self.state().store.max_page_size = Some(size);
    }

    /// Make every search of `resource_type` fail with HTTP 500, including batch entries.
    pub fn fail_searches_for(&self, resource_type: &str) {
        self.state().failing.insert(resource_type.to_string());
    }

    fn run_batch(&self, bundle: &Bundle) -> Result<Bundle, TransportError> {
        if bundle.bundle_type != BundleType::Batch {
            return Err(bad_request("batch endpoint expects a Bundle of type batch"));
        }

        let state = self.state();
        let entries = bundle
            .entries()
            .iter()
            .map(|entry| batch_entry(&state, entry))
            .collect();
        Ok(Bundle::with_entries(BundleType::BatchResponse, entries))
    }
}

fn batch_entry(state: &State, entry: &BundleEntry) -> BundleEntry {
    let Some(request) = &entry.request else {
        return error_entry(400, "batch entry missing request");
    };
    if !request.method.eq_ignore_ascii_case("GET") {
        return error_entry(405, &format!("unsupported batch method {}", request.method));
    }

    let (path, query) = request.url.split_once('?').unwrap_or((request.url.as_str(), ""));
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    let (Some(resource_type), id) = (segments.next(), segments.next()) else {
        return error_entry(400, "batch entry url has no resource type");
    };

    if let Some(id) = id {
        return match state.store.get(resource_type, id) {
            Some(resource) => BundleEntry {
                resource: Some(resource.clone()),
                response: Some(BundleEntryResponse::new(status_line(200))),
                ..BundleEntry::default()
            },
            None => error_entry(404, &format!("{resource_type}/{id} not found")),
        };
    }

    if state.failing.contains(resource_type) {
        return error_entry(500, &format!("search of {resource_type} failed"));
    }

    let result = decode_query(query)
        .and_then(|pairs| search::execute(&state.store, resource_type, &SearchQuery::from_pairs(pairs)));
    match result {
        Ok(searchset) => match serde_json::to_value(&searchset) {
            Ok(resource) => BundleEntry {
                resource: Some(resource),
                response: Some(BundleEntryResponse::new(status_line(200))),
                ..BundleEntry::default()
            },
            Err(e) => error_entry(500, &e.to_string()),
        },
        Err(TransportError::Status { status, body }) => error_entry(status, &body),
        Err(other) => error_entry(500, &other.to_string()),
    }
}

/// Decode `a=b&c=d` into pairs, percent-decoding both sides.
pub(crate) fn decode_query(query: &str) -> Result<Vec<(String, String)>, TransportError> {
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| -> Result<(String, String), TransportError> {
            let (name, value) = part.split_once('=').unwrap_or((part, ""));
            let decode = |s: &str| {
                urlencoding::decode(&s.replace('+', " "))
                    .map(|c| c.into_owned())
                    .map_err(|e| bad_request(&format!("invalid query encoding: {e}")))
            };
            Ok((decode(name)?, decode(value)?))
        })
        .collect()
}

pub(crate) fn status_line(status: u16) -> String {
    let reason = match status {
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        500 => "Internal Server Error",
        _ => return status.to_string(),
    };
    format!("{status} {reason}")
}

pub(crate) fn operation_outcome(code: &str, diagnostics: &str) -> JsonValue {
    json!({
        "resourceType": "OperationOutcome",
        "issue": [{ "severity": "error", "code": code, "diagnostics": diagnostics }]
    })
}

pub(crate) fn bad_request(diagnostics: &str) -> TransportError {
    TransportError::Status {
        status: 400,
        body: operation_outcome("invalid", diagnostics).to_string(),
    }
}

pub(crate) fn not_found(diagnostics: &str) -> TransportError {
    TransportError::Status {
        status: 404,
        body: operation_outcome("not-found", diagnostics).to_string(),
    }
}

fn error_entry(status: u16, diagnostics: &str) -> BundleEntry {
    let mut response = BundleEntryResponse::new(status_line(status));
    response.outcome = Some(operation_outcome("processing", diagnostics));
    BundleEntry {
        response: Some(response),
        ..BundleEntry::default()
    }
}

#[async_trait]
impl FhirTransport for MemoryFhirServer {
    async fn search(
        &self,
        resource_type: &str,
        query: &SearchQuery,
    ) -> Result<Bundle, TransportError> {
        let mut state = self.state();
        state.requests.push(RecordedRequest::Search {
            resource_type: resource_type.to_string(),
            params: query.to_pairs(),
        });
        if state.failing.contains(resource_type) {
            return Err(TransportError::Status {
                status: 500,
                body: operation_outcome("exception", &format!("search of {resource_type} failed"))
                    .to_string(),
            });
        }
        search::execute(&state.store, resource_type, query)
    }

    async fn transaction(&self, bundle: Bundle) -> Result<Bundle, TransportError> {
        let mut state = self.state();
        state.requests.push(RecordedRequest::Transaction {
            entries: bundle.entries().len(),
        });

        // Work on a copy so a failing entry leaves the store untouched.
        let mut staged = state.store.clone();
        let response = transaction::process(&mut staged, &bundle)?;
        state.store = staged;
        Ok(response)
    }

    async fn batch(&self, bundle: Bundle) -> Result<Bundle, TransportError> {
        self.state().requests.push(RecordedRequest::Batch {
            entries: bundle.entries().len(),
        });
        self.run_batch(&bundle)
    }
}
