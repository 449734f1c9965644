use super::{bad_request, decode_query, not_found, search, status_line, Store};
use crate::error::TransportError;
use crate::reference::ParsedUrl;
use crate::transport::SearchQuery;
use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use std::collections::{HashMap, HashSet};
use tandem_models::{Bundle, BundleEntry, BundleEntryResponse, BundleType};
use uuid::Uuid;

/// Process a transaction bundle against `store`.
///
/// Entries run POST first, then PUT, then GET, so reads observe the writes of the same
/// transaction. Response entries keep request order. The first failing entry fails the
/// whole call; the caller discards `store` in that case.
pub(super) fn process(store: &mut Store, bundle: &Bundle) -> Result<Bundle, TransportError> {
    if bundle.bundle_type != BundleType::Transaction {
        return Err(bad_request("transaction endpoint expects a Bundle of type transaction"));
    }

    let entries = bundle.entries();
    validate_transaction_bundle(entries)?;
    let (post_indices, put_indices, get_indices) = partition_transaction_entries(entries)?;

    let mut url_rewriter = UrlRewriter::default();
    url_rewriter.seed_non_post_mappings(entries);
    url_rewriter.reserve_post_ids(entries, &post_indices)?;

    tracing::debug!(
        entries = entries.len(),
        posts = post_indices.len(),
        puts = put_indices.len(),
        gets = get_indices.len(),
        "Processing in-memory transaction"
    );

    let mut response_entries = vec![BundleEntry::default(); entries.len()];
    for &index in post_indices.iter().chain(&put_indices).chain(&get_indices) {
        response_entries[index] = process_entry(store, &entries[index], index, &url_rewriter)
            .map_err(|err| with_entry_context(err, index))?;
    }

    Ok(Bundle::with_entries(
        BundleType::TransactionResponse,
        response_entries,
    ))
}

fn process_entry(
    store: &mut Store,
    entry: &BundleEntry,
    index: usize,
    url_rewriter: &UrlRewriter,
) -> Result<BundleEntry, TransportError> {
    let request = entry
        .request
        .as_ref()
        .ok_or_else(|| bad_request(&format!("transaction entry {index} missing request")))?;
    let parsed = ParsedUrl::parse(&request.url);

    match request.method.to_uppercase().as_str() {
        "POST" => {
            let resource_type = parsed.resource_type.ok_or_else(|| {
                bad_request(&format!("transaction entry {index} POST missing resource type"))
            })?;
            let id = url_rewriter.reserved_post_id(index).ok_or_else(|| {
                bad_request(&format!("transaction entry {index} has no reserved id"))
            })?;
            let resource = prepared_resource(entry, &resource_type, url_rewriter)?;
            write_resource(store, resource, &resource_type, &id, 201)
        }
        "PUT" => {
            let (Some(resource_type), Some(id)) = (parsed.resource_type, parsed.resource_id) else {
                return Err(bad_request(&format!(
                    "transaction entry {index} PUT needs Type/id in request.url"
                )));
            };
            let resource = prepared_resource(entry, &resource_type, url_rewriter)?;
            if let Some(body_id) = resource.get("id").and_then(|v| v.as_str()) {
                if body_id != id {
                    return Err(bad_request(&format!(
                        "transaction entry {index} PUT id '{body_id}' does not match url id '{id}'"
                    )));
                }
            }
            let status = if store.get(&resource_type, &id).is_some() {
                200
            } else {
                201
            };
            write_resource(store, resource, &resource_type, &id, status)
        }
        "GET" => {
            let Some(resource_type) = parsed.resource_type else {
                return Err(bad_request(&format!(
                    "transaction entry {index} GET missing resource type"
                )));
            };
            match parsed.resource_id {
                Some(id) => {
                    let resource = store
                        .get(&resource_type, &id)
                        .cloned()
                        .ok_or_else(|| not_found(&format!("{resource_type}/{id} not found")))?;
                    Ok(BundleEntry {
                        resource: Some(resource),
                        response: Some(BundleEntryResponse::new(status_line(200))),
                        ..BundleEntry::default()
                    })
                }
                None => {
                    let query = request.url.split_once('?').map(|(_, q)| q).unwrap_or("");
                    let query = SearchQuery::from_pairs(decode_query(query)?);
                    let searchset = search::execute(store, &resource_type, &query)?;
                    let resource = serde_json::to_value(&searchset)
                        .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
                    Ok(BundleEntry {
                        resource: Some(resource),
                        response: Some(BundleEntryResponse::new(status_line(200))),
                        ..BundleEntry::default()
                    })
                }
            }
        }
        other => Err(bad_request(&format!(
            "unsupported HTTP method in transaction: {other}"
        ))),
    }
}

/// Entry resource with placeholders rewritten, checked against the request url type.
fn prepared_resource(
    entry: &BundleEntry,
    resource_type: &str,
    url_rewriter: &UrlRewriter,
) -> Result<JsonValue, TransportError> {
    let mut resource = entry
        .resource
        .clone()
        .ok_or_else(|| bad_request("transaction write entry missing resource"))?;
    let body_type = resource.get("resourceType").and_then(|v| v.as_str());
    if body_type != Some(resource_type) {
        return Err(bad_request(&format!(
            "resource type {} does not match request url type {resource_type}",
            body_type.unwrap_or("<none>")
        )));
    }
    url_rewriter.rewrite_resource(&mut resource);
    Ok(resource)
}

fn write_resource(
    store: &mut Store,
    mut resource: JsonValue,
    resource_type: &str,
    id: &str,
    status: u16,
) -> Result<BundleEntry, TransportError> {
    let version_id = store.version(resource_type, id) + 1;
    let now = Utc::now();
    populate_meta(&mut resource, id, version_id, now);
    store.put(resource.clone());

    let location = format!("{resource_type}/{id}/_history/{version_id}");
    let mut response = BundleEntryResponse::new(status_line(status));
    response.location = Some(location);
    response.etag = Some(format!("W/\"{version_id}\""));
    response.last_modified = Some(now.to_rfc3339());

    Ok(BundleEntry {
        full_url: Some(format!("{resource_type}/{id}")),
        resource: Some(resource),
        response: Some(response),
        ..BundleEntry::default()
    })
}

fn populate_meta(resource: &mut JsonValue, id: &str, version_id: u32, now: chrono::DateTime<Utc>) {
    if let Some(obj) = resource.as_object_mut() {
        obj.insert("id".to_string(), json!(id));

        let meta = obj.entry("meta".to_string()).or_insert_with(|| json!({}));
        if let Some(meta_obj) = meta.as_object_mut() {
            meta_obj.insert("versionId".to_string(), json!(version_id.to_string()));
            meta_obj.insert("lastUpdated".to_string(), json!(now.to_rfc3339()));
        }
    }
}

fn with_entry_context(err: TransportError, index: usize) -> TransportError {
    match err {
        TransportError::Status { status, body } => TransportError::Status {
            status,
            body: format!("transaction entry {index}: {body}"),
        },
        other => other,
    }
}

fn validate_transaction_bundle(entries: &[BundleEntry]) -> Result<(), TransportError> {
    let mut seen_full_urls = HashSet::new();

    for (i, entry) in entries.iter().enumerate() {
        let request = entry
            .request
            .as_ref()
            .ok_or_else(|| bad_request(&format!("transaction entry {i} missing request")))?;
        let method = request.method.to_uppercase();

        if (method == "POST" || method == "PUT") && entry.resource.is_none() {
            return Err(bad_request(&format!(
                "transaction entry {i} with method {method} missing resource"
            )));
        }

        if let Some(full_url) = &entry.full_url {
            if !seen_full_urls.insert(full_url.as_str()) {
                return Err(bad_request(&format!(
                    "duplicate fullUrl in transaction at entry {i}: {full_url}"
                )));
            }
        }
    }

    Ok(())
}

type EntryIndices = (Vec<usize>, Vec<usize>, Vec<usize>);

fn partition_transaction_entries(entries: &[BundleEntry]) -> Result<EntryIndices, TransportError> {
    let mut post_indices = Vec::new();
    let mut put_indices = Vec::new();
    let mut get_indices = Vec::new();

    for (index, entry) in entries.iter().enumerate() {
        let method = entry
            .request
            .as_ref()
            .map(|r| r.method.to_uppercase())
            .unwrap_or_default();
        match method.as_str() {
            "POST" => post_indices.push(index),
            "PUT" => put_indices.push(index),
            "GET" => get_indices.push(index),
            other => {
                return Err(bad_request(&format!(
                    "unsupported HTTP method in transaction: {other}"
                )))
            }
        }
    }

    Ok((post_indices, put_indices, get_indices))
}

/// Maps entry `fullUrl`s to the identities they stand for within one transaction.
#[derive(Debug, Default)]
struct UrlRewriter {
    mapping: HashMap<String, String>,
    reserved_post_ids: HashMap<usize, String>,
}

impl UrlRewriter {
    /// PUT and GET entries already name their identity in `request.url`.
    fn seed_non_post_mappings(&mut self, entries: &[BundleEntry]) {
        for entry in entries {
            let (Some(full_url), Some(request)) = (&entry.full_url, &entry.request) else {
                continue;
            };
            if request.method.eq_ignore_ascii_case("POST") {
                continue;
            }
            if let Some(identity) = ParsedUrl::parse(&request.url).identity() {
                self.mapping.insert(full_url.clone(), identity);
            }
        }
    }

    fn reserve_post_ids(
        &mut self,
        entries: &[BundleEntry],
        post_indices: &[usize],
    ) -> Result<(), TransportError> {
        for &idx in post_indices {
            let entry = &entries[idx];
            let resource_type = entry
                .request
                .as_ref()
                .and_then(|r| ParsedUrl::parse(&r.url).resource_type)
                .ok_or_else(|| {
                    bad_request(&format!(
                        "transaction entry {idx} POST missing resource type in request.url"
                    ))
                })?;

            let id = Uuid::new_v4().to_string();
            self.reserved_post_ids.insert(idx, id.clone());

            if let Some(full_url) = &entry.full_url {
                self.mapping
                    .insert(full_url.clone(), format!("{resource_type}/{id}"));
            }
        }
        Ok(())
    }

    fn reserved_post_id(&self, index: usize) -> Option<String> {
        self.reserved_post_ids.get(&index).cloned()
    }

    fn rewrite_resource(&self, resource: &mut JsonValue) {
        if !self.mapping.is_empty() {
            rewrite_json_value(resource, &self.mapping);
        }
    }
}

fn rewrite_json_value(value: &mut JsonValue, mapping: &HashMap<String, String>) {
    match value {
        JsonValue::Object(map) => {
            for v in map.values_mut() {
                rewrite_json_value(v, mapping);
            }
        }
        JsonValue::Array(arr) => {
            for item in arr.iter_mut() {
                rewrite_json_value(item, mapping);
            }
        }
        JsonValue::String(s) => {
            if let Some(updated) = rewrite_string(s, mapping) {
                *s = updated;
            }
        }
        _ => {}
    }
}

fn rewrite_string(input: &str, mapping: &HashMap<String, String>) -> Option<String> {
    if let Some(replacement) = mapping.get(input) {
        return Some(replacement.clone());
    }

    // Fragment-aware replacement: replace base before '#'.
    let (base, frag) = input.split_once('#')?;
    mapping
        .get(base)
        .map(|replacement| format!("{replacement}#{frag}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_models::BundleEntryRequest;

    fn entry(method: &str, url: &str, full_url: Option<&str>, resource: Option<JsonValue>) -> BundleEntry {
        BundleEntry {
            full_url: full_url.map(str::to_string),
            resource,
            request: Some(BundleEntryRequest::new(method, url)),
            ..BundleEntry::default()
        }
    }

    #[test]
    fn rewrites_placeholders_and_answers_in_request_order() {
        let mut store = Store::default();
        store.put(json!({ "resourceType": "Patient", "id": "P1", "meta": { "versionId": "1" } }));
        let goal_urn = "urn:uuid:1b4e28ba-2fa1-11d2-883f-0016d3cca427";
        let patient_urn = "urn:uuid:6fa459ea-ee8a-3ca4-894e-db77e160355e";

        let bundle = Bundle::with_entries(
            BundleType::Transaction,
            vec![
                entry(
                    "POST",
                    "Condition",
                    None,
                    Some(json!({
                        "resourceType": "Condition",
                        "subject": { "reference": patient_urn },
                        "evidence": [{ "detail": [{ "reference": format!("{goal_urn}#x") }] }]
                    })),
                ),
                entry("GET", "Patient/P1", Some(patient_urn), None),
                entry("POST", "Goal", Some(goal_urn), Some(json!({ "resourceType": "Goal" }))),
            ],
        );

        let response = process(&mut store, &bundle).unwrap();
        let entries = response.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].response.as_ref().unwrap().status, "200 OK");

        let goal_location = entries[2].response.as_ref().unwrap().location.clone().unwrap();
        let goal_id = ParsedUrl::parse(&goal_location).resource_id.unwrap();

        let condition = entries[0].resource.as_ref().unwrap();
        assert_eq!(entries[0].response.as_ref().unwrap().status, "201 Created");
        assert_eq!(condition["subject"]["reference"], "Patient/P1");
        assert_eq!(
            condition["evidence"][0]["detail"][0]["reference"],
            format!("Goal/{goal_id}#x").as_str()
        );
        assert_eq!(condition["meta"]["versionId"], "1");
    }

    #[test]
    fn updates_bump_the_version() {
        let mut store = Store::default();
        store.put(json!({ "resourceType": "Task", "id": "T1", "meta": { "versionId": "3" } }));
        let bundle = Bundle::with_entries(
            BundleType::Transaction,
            vec![entry(
                "PUT",
                "Task/T1",
                None,
                Some(json!({ "resourceType": "Task", "id": "T1", "status": "completed" })),
            )],
        );

        let response = process(&mut store, &bundle).unwrap();
        let result = response.entries()[0].response.as_ref().unwrap();
        assert_eq!(result.status, "200 OK");
        assert_eq!(result.location.as_deref(), Some("Task/T1/_history/4"));
        assert_eq!(store.get("Task", "T1").unwrap()["status"], "completed");
    }

    #[test]
    fn missing_read_fails_the_transaction() {
        let mut store = Store::default();
        let bundle = Bundle::with_entries(
            BundleType::Transaction,
            vec![
                entry("POST", "Goal", None, Some(json!({ "resourceType": "Goal" }))),
                entry("GET", "Patient/nope", None, None),
            ],
        );
        let err = process(&mut store, &bundle).unwrap_err();
        assert!(matches!(err, TransportError::Status { status: 404, .. }));
    }

    #[test]
    fn rejects_malformed_bundles() {
        let mut store = Store::default();
        let duplicate = Bundle::with_entries(
            BundleType::Transaction,
            vec![
                entry("POST", "Goal", Some("urn:uuid:a"), Some(json!({ "resourceType": "Goal" }))),
                entry("POST", "Goal", Some("urn:uuid:a"), Some(json!({ "resourceType": "Goal" }))),
            ],
        );
        assert!(process(&mut store, &duplicate).is_err());

        let wrong_type = Bundle::with_entries(
            BundleType::Transaction,
            vec![entry("POST", "Goal", None, Some(json!({ "resourceType": "Patient" })))],
        );
        assert!(process(&mut store, &wrong_type).is_err());

        let not_a_transaction = Bundle::new(BundleType::Batch);
        assert!(process(&mut store, &not_a_transaction).is_err());
    }
}
