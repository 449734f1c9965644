//! Positional correlation of transaction responses
//!
//! A FHIR server answers a transaction with one response entry per request entry, in the
//! same order. [`extract`] walks request and response in lockstep and maps every operation's
//! placeholder to the identity the server assigned.

use crate::error::{Error, Result};
use crate::factory::{Operation, TransactionRequest, Verb};
use crate::reference::{LocalId, ParsedUrl, Reference};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use tandem_models::Bundle;

/// One entry of a `transaction-response` bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationResult {
    pub status: String,
    pub location: Option<String>,
    pub full_url: Option<String>,
    pub resource: Option<JsonValue>,
}

impl OperationResult {
    pub fn status_code(&self) -> Option<u16> {
        self.status
            .split_whitespace()
            .next()
            .and_then(|code| code.parse().ok())
    }

    pub fn is_success(&self) -> bool {
        self.status_code()
            .is_some_and(|code| (200..300).contains(&code))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionResponse {
    results: Vec<OperationResult>,
}

impl TransactionResponse {
    pub fn new(results: Vec<OperationResult>) -> Self {
        Self { results }
    }

    /// Read the entries of a `transaction-response` bundle in order.
    ///
    /// An entry without a `response` element reads as an empty status, which
    /// [`extract`] rejects.
    pub fn from_bundle(bundle: &Bundle) -> Self {
        let results = bundle
            .entries()
            .iter()
            .map(|entry| {
                let response = entry.response.as_ref();
                OperationResult {
                    status: response.map(|r| r.status.clone()).unwrap_or_default(),
                    location: response.and_then(|r| r.location.clone()),
                    full_url: entry.full_url.clone(),
                    resource: entry.resource.clone(),
                }
            })
            .collect();
        Self { results }
    }

    pub fn results(&self) -> &[OperationResult] {
        &self.results
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Server identity of one operation after the transaction committed.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub index: usize,
    pub verb: Verb,
    pub resource_type: String,
    pub id: String,
    pub version_id: Option<String>,
    pub resource: Option<JsonValue>,
}

impl Extracted {
    pub fn reference(&self) -> Reference {
        Reference::resolved(self.resource_type.clone(), self.id.clone())
    }
}

/// Mapping from placeholders to assigned identities, in request order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionResult {
    entries: Vec<Extracted>,
    by_local: HashMap<LocalId, usize>,
}

impl TransactionResult {
    pub fn get(&self, local_id: LocalId) -> Option<&Extracted> {
        self.by_local.get(&local_id).map(|&i| &self.entries[i])
    }

    /// Like [`get`](Self::get), for placeholders the caller registered itself.
    pub fn require(&self, local_id: LocalId) -> Result<&Extracted> {
        self.get(local_id).ok_or_else(|| {
            Error::CorrelationMismatch(format!("{local_id} is not part of this transaction"))
        })
    }

    pub fn first_of_type(&self, resource_type: &str) -> Option<&Extracted> {
        self.entries.iter().find(|e| e.resource_type == resource_type)
    }

    pub fn of_type<'a>(&'a self, resource_type: &'a str) -> impl Iterator<Item = &'a Extracted> {
        self.entries
            .iter()
            .filter(move |e| e.resource_type == resource_type)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Extracted> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a> IntoIterator for &'a TransactionResult {
    type Item = &'a Extracted;
    type IntoIter = std::slice::Iter<'a, Extracted>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Correlate `response` with `request` by position.
///
/// Either every operation gets an identity or the call fails; no partial mapping is
/// returned.
pub fn extract(request: &TransactionRequest, response: &TransactionResponse) -> Result<TransactionResult> {
    if request.len() != response.len() {
        return Err(Error::CorrelationMismatch(format!(
            "request has {} entries, response has {}",
            request.len(),
            response.len()
        )));
    }

    let mut result = TransactionResult::default();
    for (index, (operation, outcome)) in request
        .operations()
        .iter()
        .zip(response.results())
        .enumerate()
    {
        let extracted = extract_one(index, operation, outcome)?;
        result.by_local.insert(operation.local_id, index);
        result.entries.push(extracted);
    }

    tracing::debug!(entries = result.len(), "Extracted transaction identities");
    Ok(result)
}

fn extract_one(index: usize, operation: &Operation, outcome: &OperationResult) -> Result<Extracted> {
    if !outcome.is_success() {
        return Err(Error::TransactionRejected {
            index,
            status: outcome.status.clone(),
        });
    }

    // An explicit placeholder echo wins over position; it must name this operation.
    if let Some(echoed) = outcome.full_url.as_deref().and_then(LocalId::parse) {
        if operation.placeholder() != Some(echoed) {
            return Err(Error::CorrelationMismatch(format!(
                "entry {index} echoes {echoed}, expected {}",
                operation
                    .placeholder()
                    .map(|l| l.urn())
                    .unwrap_or_else(|| "no placeholder".to_string())
            )));
        }
    }

    let from_location = outcome.location.as_deref().map(ParsedUrl::parse);
    let resource_type = from_location
        .as_ref()
        .and_then(|p| p.resource_type.clone())
        .or_else(|| resource_str(outcome, "resourceType"))
        .unwrap_or_else(|| operation.resource_type.clone());
    if resource_type != operation.resource_type {
        return Err(Error::CorrelationMismatch(format!(
            "entry {index} answers for {resource_type}, expected {}",
            operation.resource_type
        )));
    }

    let id = from_location
        .as_ref()
        .and_then(|p| p.resource_id.clone())
        .or_else(|| resource_str(outcome, "id"))
        .or_else(|| operation.target_id.clone())
        .ok_or_else(|| {
            Error::CorrelationMismatch(format!(
                "entry {index} ({resource_type}) carries no assigned id"
            ))
        })?;

    if operation.verb != Verb::Create && operation.target_id.as_deref() != Some(id.as_str()) {
        return Err(Error::CorrelationMismatch(format!(
            "entry {index} answers for {resource_type}/{id}, expected {}",
            operation.request_url()
        )));
    }

    let version_id = from_location
        .and_then(|p| p.version_id)
        .or_else(|| {
            outcome
                .resource
                .as_ref()
                .and_then(|r| r.pointer("/meta/versionId"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        });

    Ok(Extracted {
        index,
        verb: operation.verb,
        resource_type,
        id,
        version_id,
        resource: outcome.resource.clone(),
    })
}

fn resource_str(outcome: &OperationResult, key: &str) -> Option<String> {
    outcome
        .resource
        .as_ref()?
        .get(key)?
        .as_str()
        .map(str::to_string)
}
