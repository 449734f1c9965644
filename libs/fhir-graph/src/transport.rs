//! Transport abstraction over a FHIR REST endpoint

use crate::error::TransportError;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tandem_models::{Bundle, SearchEntryMode};

/// `_include` directive for a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Include {
    pub source_type: String,
    pub param: String,
    pub target_type: Option<String>,
    pub iterate: bool,
}

impl Include {
    pub fn new(source_type: impl Into<String>, param: impl Into<String>) -> Self {
        Self {
            source_type: source_type.into(),
            param: param.into(),
            target_type: None,
            iterate: false,
        }
    }

    /// Query parameter name, `_include` or `_include:iterate`.
    pub fn key(&self) -> &'static str {
        if self.iterate {
            "_include:iterate"
        } else {
            "_include"
        }
    }

    /// Query parameter value, `Source:param[:Target]`.
    pub fn value(&self) -> String {
        match &self.target_type {
            Some(target) => format!("{}:{}:{}", self.source_type, self.param, target),
            None => format!("{}:{}", self.source_type, self.param),
        }
    }

    /// Parse an `_include` value. `iterate` comes from the parameter name.
    pub fn parse(value: &str, iterate: bool) -> Option<Self> {
        let mut parts = value.splitn(3, ':');
        let source_type = parts.next().filter(|s| !s.is_empty())?;
        let param = parts.next().filter(|s| !s.is_empty())?;
        Some(Self {
            source_type: source_type.to_string(),
            param: param.to_string(),
            target_type: parts.next().map(str::to_string),
            iterate,
        })
    }
}

/// Type-level search: plain parameters plus server-side includes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    params: Vec<(String, String)>,
    includes: Vec<Include>,
}

impl SearchQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a set of ids in one request, sized so a single page holds them all.
    pub fn by_ids(ids: &[String]) -> Self {
        Self::new()
            .param("_id", ids.join(","))
            .param("_count", ids.len().to_string())
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn include(mut self, source_type: &str, param: &str) -> Self {
        self.includes.push(Include::new(source_type, param));
        self
    }

    pub fn include_iterate(mut self, source_type: &str, param: &str) -> Self {
        let mut include = Include::new(source_type, param);
        include.iterate = true;
        self.includes.push(include);
        self
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn includes(&self) -> &[Include] {
        &self.includes
    }

    /// Flattened `(name, value)` pairs in request order, includes last.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = self.params.clone();
        pairs.extend(
            self.includes
                .iter()
                .map(|inc| (inc.key().to_string(), inc.value())),
        );
        pairs
    }

    /// Rebuild a query from decoded `(name, value)` pairs.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut query = Self::new();
        for (name, value) in pairs {
            let include = match name.as_str() {
                "_include" => Include::parse(&value, false),
                "_include:iterate" => Include::parse(&value, true),
                _ => {
                    query.params.push((name, value));
                    continue;
                }
            };
            if let Some(include) = include {
                query.includes.push(include);
            }
        }
        query
    }

    /// URL-encoded query string, without the leading `?`.
    pub fn to_query_string(&self) -> String {
        self.to_pairs()
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// Resources of `resource_type` matched by a searchset, in bundle order.
///
/// Entries explicitly flagged as includes or outcomes are left out.
pub fn search_matches(bundle: &Bundle, resource_type: &str) -> Vec<JsonValue> {
    bundle
        .entries()
        .iter()
        .filter(|e| {
            !matches!(
                e.search_mode(),
                Some(SearchEntryMode::Include | SearchEntryMode::Outcome)
            )
        })
        .filter(|e| e.resource_type() == Some(resource_type))
        .filter_map(|e| e.resource.clone())
        .collect()
}

/// Like [`search_matches`], but fails when the server returned only part of the result.
///
/// A `next` link, or a `total` above the matches on this page, means the read was paged.
pub fn complete_matches(
    bundle: &Bundle,
    resource_type: &str,
) -> Result<Vec<JsonValue>, TransportError> {
    let matches = search_matches(bundle, resource_type);
    if let Some(next) = bundle.next_link() {
        return Err(TransportError::InvalidResponse(format!(
            "{resource_type} read returned a partial page of {} matches (next: {next})",
            matches.len()
        )));
    }
    if let Some(total) = bundle.total {
        if total as usize > matches.len() {
            return Err(TransportError::InvalidResponse(format!(
                "{resource_type} read returned {} of {total} matches",
                matches.len()
            )));
        }
    }
    Ok(matches)
}

/// Client side of a FHIR server.
///
/// Implementations must be safe to share between concurrent in-flight requests.
#[async_trait]
pub trait FhirTransport: Send + Sync {
    /// `GET [base]/{resource_type}?{query}`
    async fn search(
        &self,
        resource_type: &str,
        query: &SearchQuery,
    ) -> Result<Bundle, TransportError>;

    /// Read several resources of one type in a single request.
    ///
    /// A paged answer is an error, never a silent subset.
    async fn read_batch(
        &self,
        resource_type: &str,
        ids: &[String],
    ) -> Result<Vec<JsonValue>, TransportError> {
        let bundle = self
            .search(resource_type, &SearchQuery::by_ids(ids))
            .await?;
        complete_matches(&bundle, resource_type)
    }

    /// Submit an atomic `transaction` bundle; entries of the response follow request order.
    async fn transaction(&self, bundle: Bundle) -> Result<Bundle, TransportError>;

    /// Submit a `batch` bundle; entries succeed or fail independently.
    async fn batch(&self, bundle: Bundle) -> Result<Bundle, TransportError>;
}
