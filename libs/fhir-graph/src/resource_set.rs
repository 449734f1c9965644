//! Type-keyed collection of loaded resources

use crate::reference::Reference;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use tandem_models::{Bundle, SearchEntryMode};

/// Resources grouped by `resourceType`, each group in server return order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceSet {
    by_type: HashMap<String, Vec<JsonValue>>,
}

impl ResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every resource carried by a search or read bundle, matches and includes alike.
    ///
    /// `OperationOutcome` entries flagged with search mode `outcome` are dropped.
    pub fn from_bundle(bundle: &Bundle) -> Self {
        let mut set = Self::new();
        for entry in bundle.entries() {
            if entry.search_mode() == Some(SearchEntryMode::Outcome) {
                continue;
            }
            if let Some(resource) = &entry.resource {
                set.push(resource.clone());
            }
        }
        set
    }

    /// Append resources under `resource_type`, keeping their order.
    pub fn insert(&mut self, resource_type: impl Into<String>, resources: Vec<JsonValue>) {
        self.by_type
            .entry(resource_type.into())
            .or_default()
            .extend(resources);
    }

    /// Append one resource under its own `resourceType`. Untyped values are ignored.
    pub fn push(&mut self, resource: JsonValue) {
        let Some(rt) = resource
            .get("resourceType")
            .and_then(|v| v.as_str())
            .map(str::to_string)
        else {
            return;
        };
        self.by_type.entry(rt).or_default().push(resource);
    }

    pub fn get(&self, resource_type: &str) -> &[JsonValue] {
        self.by_type
            .get(resource_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn first(&self, resource_type: &str) -> Option<&JsonValue> {
        self.get(resource_type).first()
    }

    pub fn find(&self, resource_type: &str, id: &str) -> Option<&JsonValue> {
        self.get(resource_type)
            .iter()
            .find(|r| r.get("id").and_then(|v| v.as_str()) == Some(id))
    }

    /// Resource a resolved reference points at, if present.
    pub fn resolve(&self, reference: &Reference) -> Option<&JsonValue> {
        let (rt, id) = reference.key()?;
        self.find(rt, id)
    }

    pub fn contains(&self, reference: &Reference) -> bool {
        self.resolve(reference).is_some()
    }

    /// Total number of resources across all types.
    pub fn len(&self) -> usize {
        self.by_type.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add resources of `other` that are not already present (by type and id).
    pub fn merge(&mut self, other: ResourceSet) {
        for (rt, resources) in other.by_type {
            for resource in resources {
                let id = resource.get("id").and_then(|v| v.as_str());
                if id.is_some_and(|id| self.find(&rt, id).is_some()) {
                    continue;
                }
                self.by_type.entry(rt.clone()).or_default().push(resource);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn groups_bundle_entries_and_drops_outcomes() {
        let bundle: Bundle = serde_json::from_value(json!({
            "resourceType": "Bundle",
            "type": "searchset",
            "entry": [
                { "resource": { "resourceType": "Task", "id": "T1" }, "search": { "mode": "match" } },
                { "resource": { "resourceType": "Patient", "id": "P1" }, "search": { "mode": "include" } },
                { "resource": { "resourceType": "OperationOutcome" }, "search": { "mode": "outcome" } },
                { "resource": { "resourceType": "Patient", "id": "P2" }, "search": { "mode": "include" } }
            ]
        }))
        .unwrap();

        let set = ResourceSet::from_bundle(&bundle);
        assert_eq!(set.len(), 3);
        assert_eq!(set.get("Patient").len(), 2);
        assert_eq!(set.first("Patient").unwrap()["id"], "P1");
        assert!(set.get("OperationOutcome").is_empty());
        assert!(set.contains(&Reference::resolved("Task", "T1")));
        assert!(!set.contains(&Reference::resolved("Task", "T2")));
    }

    #[test]
    fn merge_skips_resources_already_present() {
        let mut left = ResourceSet::new();
        left.push(json!({ "resourceType": "Goal", "id": "G1", "v": 1 }));
        let mut right = ResourceSet::new();
        right.push(json!({ "resourceType": "Goal", "id": "G1", "v": 2 }));
        right.push(json!({ "resourceType": "Goal", "id": "G2" }));

        left.merge(right);
        let goals = left.get("Goal");
        assert_eq!(goals.len(), 2);
        assert_eq!(goals[0]["v"], 1);
        assert_eq!(goals[1]["id"], "G2");
    }
}
