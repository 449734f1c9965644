use super::{bad_request, Store};
use crate::collector::collect_path;
use crate::error::TransportError;
use crate::reference::Reference;
use crate::transport::{Include, SearchQuery};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use tandem_models::{
    Bundle, BundleEntry, BundleEntrySearch, BundleLink, BundleType, SearchEntryMode,
};

/// Iterating includes can feed each other; stop after this many passes.
const MAX_ITERATE_PASSES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamKind {
    Reference,
    Token,
}

/// Element path and kind of a supported search parameter.
fn param_def(resource_type: &str, name: &str) -> Option<(&'static str, ParamKind)> {
    use ParamKind::{Reference as Ref, Token};
    let def = match (resource_type, name) {
        ("Task", "focus") => ("focus", Ref),
        ("Task", "patient" | "subject") => ("for", Ref),
        ("Task", "requester") => ("requester", Ref),
        ("Task", "owner") => ("owner", Ref),
        ("Task", "based-on") => ("basedOn", Ref),
        ("Task", "status") => ("status", Token),
        ("ServiceRequest", "patient" | "subject") => ("subject", Ref),
        ("ServiceRequest", "requester") => ("requester", Ref),
        ("ServiceRequest", "status") => ("status", Token),
        ("Condition", "patient" | "subject") => ("subject", Ref),
        ("Condition", "asserter") => ("asserter", Ref),
        ("Condition", "evidence-detail") => ("evidence.detail", Ref),
        ("Condition", "clinical-status") => ("clinicalStatus", Token),
        ("Condition", "verification-status") => ("verificationStatus", Token),
        ("Condition", "category") => ("category", Token),
        ("Condition", "code") => ("code", Token),
        ("Observation", "patient" | "subject") => ("subject", Ref),
        ("Observation", "derived-from") => ("derivedFrom", Ref),
        ("Observation", "has-member") => ("hasMember", Ref),
        ("Observation", "code") => ("code", Token),
        ("Goal", "patient" | "subject") => ("subject", Ref),
        ("Goal", "lifecycle-status") => ("lifecycleStatus", Token),
        ("Procedure", "patient" | "subject") => ("subject", Ref),
        ("Procedure", "based-on") => ("basedOn", Ref),
        ("Consent", "patient") => ("patient", Ref),
        ("Patient", "organization") => ("managingOrganization", Ref),
        ("Patient", "general-practitioner") => ("generalPractitioner", Ref),
        ("Organization", "partof") => ("partOf", Ref),
        _ => return None,
    };
    Some(def)
}

enum Filter {
    Id(Vec<String>),
    Profile(Vec<String>),
    Param {
        path: &'static str,
        kind: ParamKind,
        values: Vec<String>,
    },
}

impl Filter {
    fn matches(&self, resource: &JsonValue) -> bool {
        match self {
            Self::Id(ids) => resource
                .get("id")
                .and_then(|v| v.as_str())
                .is_some_and(|id| ids.iter().any(|candidate| candidate == id)),
            Self::Profile(profiles) => resource
                .pointer("/meta/profile")
                .and_then(|v| v.as_array())
                .is_some_and(|declared| {
                    declared
                        .iter()
                        .filter_map(|p| p.as_str())
                        .any(|p| profiles.iter().any(|wanted| wanted == p))
                }),
            Self::Param {
                path,
                kind: ParamKind::Reference,
                values,
            } => {
                let found = collect_path(resource, path);
                values.iter().any(|value| reference_matches(&found, value))
            }
            Self::Param {
                path,
                kind: ParamKind::Token,
                values,
            } => {
                let tokens = tokens_at(resource, path);
                values.iter().any(|value| token_matches(&tokens, value))
            }
        }
    }
}

fn split_values(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

/// `Type/id` compares type and id; a bare value compares the id only.
fn reference_matches(found: &[Reference], value: &str) -> bool {
    match Reference::parse(value) {
        Some(wanted) if !wanted.is_placeholder() => found.contains(&wanted),
        _ => found.iter().any(|r| r.id() == Some(value)),
    }
}

/// `(system, code)` pairs of the CodeableConcept, Coding or code values at `path`.
fn tokens_at(resource: &JsonValue, path: &str) -> Vec<(Option<String>, String)> {
    let mut out = Vec::new();
    let mut stack = vec![(resource, path)];
    while let Some((value, path)) = stack.pop() {
        match value {
            JsonValue::Array(items) => stack.extend(items.iter().rev().map(|item| (item, path))),
            JsonValue::Object(obj) if !path.is_empty() => {
                let (head, tail) = path.split_once('.').unwrap_or((path, ""));
                if let Some(child) = obj.get(head) {
                    stack.push((child, tail));
                }
            }
            JsonValue::Object(obj) => {
                if let Some(codings) = obj.get("coding").and_then(|c| c.as_array()) {
                    out.extend(codings.iter().filter_map(coding_token));
                } else if let Some(token) = coding_token(value) {
                    out.push(token);
                }
            }
            JsonValue::String(code) if path.is_empty() => out.push((None, code.clone())),
            _ => {}
        }
    }
    out
}

fn coding_token(coding: &JsonValue) -> Option<(Option<String>, String)> {
    let code = coding.get("code").and_then(|v| v.as_str())?;
    let system = coding
        .get("system")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    Some((system, code.to_string()))
}

/// `system|code`, `system|`, `|code` (no system) or `code`.
fn token_matches(tokens: &[(Option<String>, String)], value: &str) -> bool {
    match value.split_once('|') {
        Some(("", code)) => tokens.iter().any(|(s, c)| s.is_none() && c == code),
        Some((system, "")) => tokens.iter().any(|(s, _)| s.as_deref() == Some(system)),
        Some((system, code)) => tokens
            .iter()
            .any(|(s, c)| s.as_deref() == Some(system) && c == code),
        None => tokens.iter().any(|(_, c)| c == value),
    }
}

/// Run a type-level search against the store.
pub(super) fn execute(
    store: &Store,
    resource_type: &str,
    query: &SearchQuery,
) -> Result<Bundle, TransportError> {
    let mut filters = Vec::new();
    let mut count: Option<usize> = None;
    let mut offset = 0usize;

    for (name, value) in query.params() {
        match name.as_str() {
            "_id" => filters.push(Filter::Id(split_values(value))),
            "_profile" => filters.push(Filter::Profile(split_values(value))),
            "_count" => {
                count = Some(value.parse().map_err(|_| {
                    bad_request(&format!("_count must be a non-negative integer, got '{value}'"))
                })?)
            }
            "_offset" => {
                offset = value.parse().map_err(|_| {
                    bad_request(&format!("_offset must be a non-negative integer, got '{value}'"))
                })?
            }
            _ => {
                let (path, kind) = param_def(resource_type, name).ok_or_else(|| {
                    bad_request(&format!(
                        "unknown search parameter '{name}' for {resource_type}"
                    ))
                })?;
                filters.push(Filter::Param {
                    path,
                    kind,
                    values: split_values(value),
                });
            }
        }
    }

    let all_matches: Vec<&JsonValue> = store
        .all(resource_type)
        .iter()
        .filter(|r| filters.iter().all(|f| f.matches(r)))
        .collect();
    let total = all_matches.len();
    let page_size = match (count, store.max_page_size) {
        (Some(count), Some(max)) => count.min(max),
        (requested, max) => requested.or(max).unwrap_or(usize::MAX),
    };
    let matches: Vec<JsonValue> = all_matches
        .into_iter()
        .skip(offset)
        .take(page_size)
        .cloned()
        .collect();

    let included = fetch_includes(store, &matches, query.includes())?;

    let mut bundle = Bundle::new(BundleType::Searchset);
    bundle.total = Some(u32::try_from(total).unwrap_or(u32::MAX));
    let next_offset = offset.saturating_add(matches.len());
    if !matches.is_empty() && next_offset < total {
        bundle.link = Some(vec![BundleLink {
            relation: "next".to_string(),
            url: next_page_url(resource_type, query, next_offset),
        }]);
    }
    for resource in matches {
        bundle.push_entry(search_entry(resource, SearchEntryMode::Match));
    }
    for resource in included {
        bundle.push_entry(search_entry(resource, SearchEntryMode::Include));
    }
    Ok(bundle)
}

/// The same search with `_offset` moved past the current page.
fn next_page_url(resource_type: &str, query: &SearchQuery, offset: usize) -> String {
    let pairs = query
        .to_pairs()
        .into_iter()
        .filter(|(name, _)| name != "_offset")
        .chain(std::iter::once(("_offset".to_string(), offset.to_string())));
    format!(
        "{resource_type}?{}",
        SearchQuery::from_pairs(pairs).to_query_string()
    )
}

fn search_entry(resource: JsonValue, mode: SearchEntryMode) -> BundleEntry {
    let full_url = match (
        resource.get("resourceType").and_then(|v| v.as_str()),
        resource.get("id").and_then(|v| v.as_str()),
    ) {
        (Some(rt), Some(id)) => Some(format!("{rt}/{id}")),
        _ => None,
    };
    BundleEntry {
        full_url,
        resource: Some(resource),
        search: Some(BundleEntrySearch {
            mode: Some(mode),
            score: None,
        }),
        ..BundleEntry::default()
    }
}

fn identity(resource: &JsonValue) -> Option<(String, String)> {
    Some((
        resource.get("resourceType")?.as_str()?.to_string(),
        resource.get("id")?.as_str()?.to_string(),
    ))
}

fn fetch_includes(
    store: &Store,
    matches: &[JsonValue],
    includes: &[Include],
) -> Result<Vec<JsonValue>, TransportError> {
    let mut processed: HashSet<(String, String)> = matches.iter().filter_map(identity).collect();
    let mut included = Vec::new();

    // Non-iterating includes apply only to the matching resources.
    for spec in includes.iter().filter(|s| !s.iterate) {
        collect_includes(store, spec, matches, &mut processed, &mut included)?;
    }

    for _pass in 0..MAX_ITERATE_PASSES {
        let before = processed.len();
        let mut sources = Vec::with_capacity(matches.len() + included.len());
        sources.extend_from_slice(matches);
        sources.extend_from_slice(&included);

        for spec in includes.iter().filter(|s| s.iterate) {
            collect_includes(store, spec, &sources, &mut processed, &mut included)?;
        }
        if processed.len() == before {
            break;
        }
    }

    Ok(included)
}

fn collect_includes(
    store: &Store,
    spec: &Include,
    sources: &[JsonValue],
    processed: &mut HashSet<(String, String)>,
    included: &mut Vec<JsonValue>,
) -> Result<(), TransportError> {
    let path = match param_def(&spec.source_type, &spec.param) {
        Some((path, ParamKind::Reference)) => path,
        _ => {
            return Err(bad_request(&format!(
                "cannot include {}: not a reference parameter",
                spec.value()
            )))
        }
    };

    for source in sources
        .iter()
        .filter(|r| r.get("resourceType").and_then(|v| v.as_str()) == Some(spec.source_type.as_str()))
    {
        for reference in collect_path(source, path) {
            let Some((rt, id)) = reference.key() else {
                continue;
            };
            if spec.target_type.as_deref().is_some_and(|t| t != rt) {
                continue;
            }
            if processed.contains(&(rt.to_string(), id.to_string())) {
                continue;
            }
            if let Some(target) = store.get(rt, id) {
                processed.insert((rt.to_string(), id.to_string()));
                included.push(target.clone());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> Store {
        let mut store = Store::default();
        for resource in [
            json!({ "resourceType": "Patient", "id": "P1" }),
            json!({
                "resourceType": "Condition", "id": "C1",
                "meta": { "profile": ["http://example.org/sdoh"] },
                "subject": { "reference": "Patient/P1" },
                "clinicalStatus": { "coding": [{ "system": "http://cs", "code": "active" }] },
                "category": [{ "coding": [{ "system": "http://cat", "code": "health-concern" }] }],
                "evidence": [{ "detail": [{ "reference": "Observation/O1" }] }]
            }),
            json!({
                "resourceType": "Condition", "id": "C2",
                "subject": { "reference": "Patient/P2" },
                "clinicalStatus": { "coding": [{ "system": "http://cs", "code": "resolved" }] }
            }),
            json!({
                "resourceType": "Observation", "id": "O1",
                "derivedFrom": [{ "reference": "Observation/O2" }]
            }),
            json!({
                "resourceType": "Observation", "id": "O2",
                "derivedFrom": [{ "reference": "Observation/O3" }]
            }),
            json!({ "resourceType": "Observation", "id": "O3" }),
        ] {
            store.put(resource);
        }
        store
    }

    fn ids(bundle: &Bundle, mode: SearchEntryMode) -> Vec<String> {
        bundle
            .entries()
            .iter()
            .filter(|e| e.search_mode() == Some(mode))
            .filter_map(|e| e.resource.as_ref()?.get("id")?.as_str().map(str::to_string))
            .collect()
    }

    #[test]
    fn filters_by_reference_token_and_profile() {
        let store = store();
        let query = SearchQuery::new()
            .param("patient", "Patient/P1")
            .param("clinical-status", "active")
            .param("category", "http://cat|health-concern")
            .param("_profile", "http://example.org/sdoh");
        let bundle = execute(&store, "Condition", &query).unwrap();
        assert_eq!(ids(&bundle, SearchEntryMode::Match), vec!["C1"]);
        assert_eq!(bundle.total, Some(1));

        let bare_id = SearchQuery::new().param("subject", "P2");
        let bundle = execute(&store, "Condition", &bare_id).unwrap();
        assert_eq!(ids(&bundle, SearchEntryMode::Match), vec!["C2"]);
    }

    #[test]
    fn id_lists_and_count() {
        let store = store();
        let query = SearchQuery::new()
            .param("_id", "O3,O1")
            .param("_count", "1");
        let bundle = execute(&store, "Observation", &query).unwrap();
        assert_eq!(ids(&bundle, SearchEntryMode::Match), vec!["O1"]);
        assert_eq!(bundle.total, Some(2));
        assert_eq!(
            bundle.next_link(),
            Some("Observation?_id=O3%2CO1&_count=1&_offset=1")
        );

        let last = SearchQuery::new()
            .param("_id", "O3,O1")
            .param("_count", "1")
            .param("_offset", "1");
        let bundle = execute(&store, "Observation", &last).unwrap();
        assert_eq!(ids(&bundle, SearchEntryMode::Match), vec!["O3"]);
        assert_eq!(bundle.next_link(), None);
    }

    #[test]
    fn server_page_limit_overrides_count() {
        let mut store = store();
        store.max_page_size = Some(1);
        let query = SearchQuery::new()
            .param("_id", "O1,O3")
            .param("_count", "2");
        let bundle = execute(&store, "Observation", &query).unwrap();
        assert_eq!(ids(&bundle, SearchEntryMode::Match), vec!["O1"]);
        assert!(bundle.next_link().is_some());
    }

    #[test]
    fn includes_iterate_to_a_fixpoint() {
        let store = store();
        let query = SearchQuery::new()
            .param("_id", "C1")
            .include("Condition", "evidence-detail")
            .include_iterate("Observation", "derived-from");
        let bundle = execute(&store, "Condition", &query).unwrap();
        assert_eq!(ids(&bundle, SearchEntryMode::Include), vec!["O1", "O2", "O3"]);
    }

    #[test]
    fn unknown_parameters_are_rejected() {
        let store = store();
        let query = SearchQuery::new().param("color", "blue");
        let err = execute(&store, "Condition", &query).unwrap_err();
        assert!(matches!(err, TransportError::Status { status: 400, .. }));

        let bad_include = SearchQuery::new().include("Condition", "clinical-status");
        assert!(execute(&store, "Condition", &bad_include).is_err());
    }
}
