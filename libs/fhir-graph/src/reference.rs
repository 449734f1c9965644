//! Typed references and transaction placeholders

use serde_json::{json, Value as JsonValue};
use std::fmt;
use uuid::Uuid;

const URN_UUID_PREFIX: &str = "urn:uuid:";

/// Placeholder identity of a resource that only exists inside a pending transaction.
///
/// Rendered as `urn:uuid:<uuid>` on the wire. Kept as its own type so it can never be
/// mistaken for a server-assigned id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(Uuid);

impl LocalId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a `urn:uuid:` placeholder.
    pub fn parse(raw: &str) -> Option<Self> {
        raw.trim()
            .strip_prefix(URN_UUID_PREFIX)
            .and_then(|u| Uuid::parse_str(u).ok())
            .map(Self)
    }

    pub fn urn(&self) -> String {
        format!("{URN_UUID_PREFIX}{}", self.0)
    }

    /// Reference datatype pointing at this placeholder.
    pub fn to_reference_json(&self) -> JsonValue {
        json!({ "reference": self.urn() })
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{URN_UUID_PREFIX}{}", self.0)
    }
}

/// Pointer from one resource to another.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    /// `Type/id`, possibly parsed out of an absolute or versioned URL.
    Resolved { resource_type: String, id: String },
    /// Target is part of the same, not yet submitted transaction.
    Placeholder(LocalId),
}

impl Reference {
    pub fn resolved(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Resolved {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    /// Parse a reference string.
    ///
    /// Accepts `Type/id`, `Type/id/_history/v`, absolute `http(s)://base/Type/id` and
    /// `urn:uuid:` placeholders. Contained (`#id`), conditional (`Type?query`) and other
    /// URN references cannot be addressed and yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.contains('?') {
            return None;
        }
        if trimmed.starts_with("urn:") {
            return LocalId::parse(trimmed).map(Self::Placeholder);
        }

        let parsed = ParsedUrl::parse(trimmed);
        match (parsed.resource_type, parsed.resource_id) {
            (Some(resource_type), Some(id)) if is_resource_type(&resource_type) => {
                Some(Self::Resolved { resource_type, id })
            }
            _ => None,
        }
    }

    /// Read a Reference datatype object (`{"reference": "..."}`).
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        value
            .get("reference")
            .and_then(|v| v.as_str())
            .and_then(Self::parse)
    }

    pub fn resource_type(&self) -> Option<&str> {
        match self {
            Self::Resolved { resource_type, .. } => Some(resource_type),
            Self::Placeholder(_) => None,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Resolved { id, .. } => Some(id),
            Self::Placeholder(_) => None,
        }
    }

    /// `(type, id)` for resolved references.
    pub fn key(&self) -> Option<(&str, &str)> {
        match self {
            Self::Resolved { resource_type, id } => Some((resource_type, id)),
            Self::Placeholder(_) => None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Placeholder(_))
    }

    /// Whether this reference points at the given resource JSON.
    pub fn points_to(&self, resource: &JsonValue) -> bool {
        match self.key() {
            Some((rt, id)) => {
                resource.get("resourceType").and_then(|v| v.as_str()) == Some(rt)
                    && resource.get("id").and_then(|v| v.as_str()) == Some(id)
            }
            None => false,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        json!({ "reference": self.to_string() })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolved { resource_type, id } => write!(f, "{resource_type}/{id}"),
            Self::Placeholder(local) => write!(f, "{local}"),
        }
    }
}

impl From<LocalId> for Reference {
    fn from(local: LocalId) -> Self {
        Self::Placeholder(local)
    }
}

/// FHIR resource type names are PascalCase identifiers.
fn is_resource_type(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next().is_some_and(|c| c.is_ascii_uppercase()) && chars.all(|c| c.is_ascii_alphanumeric())
}

/// Resource identity extracted from a FHIR URL (`[base/]Type/id[/_history/vid][?query]`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ParsedUrl {
    pub(crate) resource_type: Option<String>,
    pub(crate) resource_id: Option<String>,
    pub(crate) version_id: Option<String>,
}

impl ParsedUrl {
    pub(crate) fn parse(raw: &str) -> Self {
        let mut path = raw.trim();

        if let Some((p, _q)) = path.split_once('?') {
            path = p;
        }

        // Strip scheme + host
        if let Some(scheme_idx) = path.find("://") {
            let after_scheme = &path[scheme_idx + 3..];
            path = after_scheme.split_once('/').map(|(_, p)| p).unwrap_or("");
        }

        let mut parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut version_id = None;
        if let Some(history_idx) = parts.iter().position(|p| *p == "_history") {
            version_id = parts.get(history_idx + 1).map(|v| v.to_string());
            parts.truncate(history_idx);
        }

        match parts.len() {
            0 => Self::default(),
            1 => Self {
                resource_type: parts.last().map(|s| s.to_string()),
                ..Self::default()
            },
            _ => Self {
                resource_type: parts.get(parts.len() - 2).map(|s| s.to_string()),
                resource_id: parts.last().map(|s| s.to_string()),
                version_id,
            },
        }
    }

    pub(crate) fn identity(&self) -> Option<String> {
        match (&self.resource_type, &self.resource_id) {
            (Some(rt), Some(id)) => Some(format!("{}/{}", rt, id)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_relative_and_absolute_references() {
        assert_eq!(
            Reference::parse("Patient/123"),
            Some(Reference::resolved("Patient", "123"))
        );
        assert_eq!(
            Reference::parse("https://ehr.example.org/fhir/Condition/c1/_history/4"),
            Some(Reference::resolved("Condition", "c1"))
        );
        assert_eq!(
            Reference::parse("Goal/g1/_history/2"),
            Some(Reference::resolved("Goal", "g1"))
        );
    }

    #[test]
    fn skips_unaddressable_references() {
        assert_eq!(Reference::parse(""), None);
        assert_eq!(Reference::parse("#contained"), None);
        assert_eq!(Reference::parse("Patient?identifier=mrn|1"), None);
        assert_eq!(Reference::parse("urn:oid:1.2.3"), None);
        assert_eq!(Reference::parse("Patient"), None);
        assert_eq!(Reference::parse("patient/1"), None);
    }

    #[test]
    fn placeholder_round_trips_through_its_urn() {
        let local = LocalId::generate();
        let urn = local.urn();
        assert!(urn.starts_with("urn:uuid:"));
        assert_eq!(LocalId::parse(&urn), Some(local));
        assert_eq!(Reference::parse(&urn), Some(Reference::Placeholder(local)));
        assert_eq!(local.to_reference_json()["reference"], urn.as_str());
    }

    #[test]
    fn placeholder_never_equals_a_resolved_reference() {
        let local = LocalId::generate();
        let placeholder = Reference::from(local);
        assert!(placeholder.is_placeholder());
        assert_eq!(placeholder.key(), None);
        assert_ne!(placeholder, Reference::resolved("Patient", local.urn()));
    }

    #[test]
    fn parsed_url_extracts_version() {
        let parsed = ParsedUrl::parse("Condition/42/_history/3");
        assert_eq!(parsed.identity().as_deref(), Some("Condition/42"));
        assert_eq!(parsed.version_id.as_deref(), Some("3"));

        let type_only = ParsedUrl::parse("Condition?_id=1");
        assert_eq!(type_only.resource_type.as_deref(), Some("Condition"));
        assert_eq!(type_only.identity(), None);
    }
}
