//! Reference collection.
//!
//! Pure functions that read the declared reference fields of a resource and return the
//! references found there, in field-declaration order and then document order. Duplicates
//! are kept; deduplication belongs to the loader.

use crate::kind::{ReferenceField, ResourceKind};
use crate::reference::Reference;
use serde_json::Value as JsonValue;

/// All references held in the declared fields of `resource`.
///
/// Resources of a type without a field table contribute nothing.
pub fn collect(resource: &JsonValue) -> Vec<Reference> {
    match ResourceKind::of(resource) {
        Some(kind) => collect_fields(resource, kind.reference_fields()),
        None => Vec::new(),
    }
}

pub fn collect_fields(resource: &JsonValue, fields: &[ReferenceField]) -> Vec<Reference> {
    let mut out = Vec::new();
    for field in fields {
        walk(resource, field.path, &mut out);
    }
    out
}

/// References held in one declared field of `resource`.
///
/// A path missing from the kind's field table yields nothing.
pub fn collect_field(resource: &JsonValue, path: &str) -> Vec<Reference> {
    let field = ResourceKind::of(resource).and_then(|kind| kind.field(path));
    match field {
        Some(field) => collect_fields(resource, std::slice::from_ref(field)),
        None => {
            tracing::debug!(path, "Not a declared reference field");
            Vec::new()
        }
    }
}

/// References at one dotted path, flattening arrays along the way.
pub fn collect_path(resource: &JsonValue, path: &str) -> Vec<Reference> {
    let mut out = Vec::new();
    walk(resource, path, &mut out);
    out
}

/// The references whose target is `target_type`, in collection order.
///
/// Polymorphic fields such as `ServiceRequest.supportingInfo` only reveal the role of a
/// reference through its type prefix.
pub fn of_type(references: &[Reference], target_type: &str) -> Vec<Reference> {
    references
        .iter()
        .filter(|r| r.resource_type() == Some(target_type))
        .cloned()
        .collect()
}

fn walk(value: &JsonValue, path: &str, out: &mut Vec<Reference>) {
    match value {
        JsonValue::Array(items) => {
            for item in items {
                walk(item, path, out);
            }
        }
        JsonValue::Object(obj) => {
            if path.is_empty() {
                push_reference(value, out);
                return;
            }
            let (head, tail) = path.split_once('.').unwrap_or((path, ""));
            if let Some(child) = obj.get(head) {
                walk(child, tail, out);
            }
        }
        _ => {}
    }
}

fn push_reference(value: &JsonValue, out: &mut Vec<Reference>) {
    let Some(raw) = value.get("reference").and_then(|v| v.as_str()) else {
        return;
    };
    match Reference::parse(raw) {
        Some(reference) => out.push(reference),
        None if raw.starts_with('#') => {}
        None => tracing::debug!(reference = raw, "Skipping unaddressable reference"),
    }
}
