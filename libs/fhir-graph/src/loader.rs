//! Batched, de-duplicated loading of referenced resources
//!
//! References are deduplicated by `(type, id)`, partitioned by target type and fetched
//! with one request per type, so N references of K types cost K reads instead of N.

use crate::error::{Error, Result, TransportError};
use crate::reference::Reference;
use crate::resource_set::ResourceSet;
use crate::transport::{complete_matches, FhirTransport, SearchQuery};
use futures::future::try_join_all;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tandem_models::{Bundle, BundleEntry, BundleEntryRequest, BundleType};

/// How partitions are sent to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadStrategy {
    /// One search per type, issued concurrently.
    #[default]
    PerType,
    /// A single `batch` bundle with one GET entry per type.
    Batch,
}

impl std::str::FromStr for LoadStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "per-type" => Ok(Self::PerType),
            "batch" => Ok(Self::Batch),
            other => Err(format!(
                "unknown load strategy '{other}' (expected per-type or batch)"
            )),
        }
    }
}

/// Ids to read for one resource type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub resource_type: String,
    pub ids: Vec<String>,
}

/// Deduplicate resolved references and group them by type, both in first-occurrence order.
///
/// Placeholders are dropped: nothing persisted can be addressed by them.
pub fn partition(references: &[Reference]) -> Vec<Partition> {
    let mut seen: HashSet<(&str, &str)> = HashSet::new();
    let mut partitions: Vec<Partition> = Vec::new();

    for reference in references {
        let Some((rt, id)) = reference.key() else {
            tracing::debug!(%reference, "Skipping placeholder reference during load");
            continue;
        };
        if !seen.insert((rt, id)) {
            continue;
        }
        match partitions.iter_mut().find(|p| p.resource_type == rt) {
            Some(p) => p.ids.push(id.to_string()),
            None => partitions.push(Partition {
                resource_type: rt.to_string(),
                ids: vec![id.to_string()],
            }),
        }
    }

    partitions
}

#[derive(Clone)]
pub struct ResourceLoader {
    transport: Arc<dyn FhirTransport>,
    strategy: LoadStrategy,
}

impl ResourceLoader {
    pub fn new(transport: Arc<dyn FhirTransport>) -> Self {
        Self {
            transport,
            strategy: LoadStrategy::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: LoadStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn strategy(&self) -> LoadStrategy {
        self.strategy
    }

    /// Load every referenced resource, grouped by type.
    ///
    /// Fails as a whole with [`Error::LoadFailure`] if any partition fails.
    pub async fn load(&self, references: &[Reference]) -> Result<ResourceSet> {
        let partitions = partition(references);
        if partitions.is_empty() {
            return Ok(ResourceSet::new());
        }

        tracing::debug!(
            references = references.len(),
            partitions = partitions.len(),
            strategy = ?self.strategy,
            "Loading referenced resources"
        );

        match self.strategy {
            LoadStrategy::PerType => self.load_per_type(partitions).await,
            LoadStrategy::Batch => self.load_batched(partitions).await,
        }
    }

    async fn load_per_type(&self, partitions: Vec<Partition>) -> Result<ResourceSet> {
        // try_join_all drops the remaining futures on the first error.
        let fetches = partitions.into_iter().map(|p| async move {
            match self.transport.read_batch(&p.resource_type, &p.ids).await {
                Ok(resources) => Ok((p.resource_type, resources)),
                Err(source) => Err(Error::load_failure(p.resource_type, source)),
            }
        });
        let results = try_join_all(fetches).await?;

        let mut set = ResourceSet::new();
        for (resource_type, resources) in results {
            tracing::debug!(
                resource_type = %resource_type,
                count = resources.len(),
                "Loaded partition"
            );
            set.insert(resource_type, resources);
        }
        Ok(set)
    }

    async fn load_batched(&self, partitions: Vec<Partition>) -> Result<ResourceSet> {
        let entries = partitions
            .iter()
            .map(|p| BundleEntry {
                request: Some(BundleEntryRequest::new(
                    "GET",
                    format!(
                        "{}?{}",
                        p.resource_type,
                        SearchQuery::by_ids(&p.ids).to_query_string()
                    ),
                )),
                ..BundleEntry::default()
            })
            .collect();
        let request = Bundle::with_entries(BundleType::Batch, entries);

        let response = self.transport.batch(request).await.map_err(|source| {
            let types: Vec<&str> = partitions.iter().map(|p| p.resource_type.as_str()).collect();
            Error::load_failure(types.join(","), source)
        })?;

        let response_entries = response.entries();
        if response_entries.len() != partitions.len() {
            return Err(Error::CorrelationMismatch(format!(
                "batch response has {} entries for {} requests",
                response_entries.len(),
                partitions.len()
            )));
        }

        let mut set = ResourceSet::new();
        for (partition, entry) in partitions.into_iter().zip(response_entries) {
            let resources = batch_entry_resources(&partition.resource_type, entry)
                .map_err(|source| Error::load_failure(&partition.resource_type, source))?;
            set.insert(partition.resource_type, resources);
        }
        Ok(set)
    }
}

fn batch_entry_resources(
    resource_type: &str,
    entry: &BundleEntry,
) -> std::result::Result<Vec<serde_json::Value>, TransportError> {
    let response = entry.response.as_ref().ok_or_else(|| {
        TransportError::InvalidResponse("batch response entry without response".to_string())
    })?;
    if !response.is_success() {
        return Err(TransportError::Status {
            status: response.status_code().unwrap_or(0),
            body: response
                .outcome
                .as_ref()
                .map(|o| o.to_string())
                .unwrap_or_else(|| response.status.clone()),
        });
    }

    let Some(resource) = &entry.resource else {
        return Ok(Vec::new());
    };
    let searchset: Bundle = serde_json::from_value(resource.clone()).map_err(|e| {
        TransportError::InvalidResponse(format!("batch entry is not a searchset: {e}"))
    })?;
    complete_matches(&searchset, resource_type)
}
