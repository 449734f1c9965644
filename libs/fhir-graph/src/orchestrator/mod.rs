//! Workflows over the collector, loader, factory and extractor
//!
//! [`ResourceGraph`] owns no state beyond its collaborators; every workflow runs end to end
//! against the injected transport and returns or fails as a whole.

mod health_concern;
mod task;

pub use health_concern::{HealthConcern, NewHealthConcern, SubjectContext};
pub use task::{TaskResources, TaskStatus, TaskUpdate};

use crate::error::{Error, Result};
use crate::extract::{extract, TransactionResponse, TransactionResult};
use crate::factory::TransactionRequest;
use crate::loader::{LoadStrategy, ResourceLoader};
use crate::reference::Reference;
use crate::resource_set::ResourceSet;
use crate::terminology::CodeResolver;
use crate::transport::{FhirTransport, SearchQuery};
use serde_json::Value as JsonValue;
use std::sync::Arc;

#[derive(Clone)]
pub struct ResourceGraph {
    transport: Arc<dyn FhirTransport>,
    loader: ResourceLoader,
    codes: Arc<dyn CodeResolver>,
}

impl ResourceGraph {
    pub fn new(transport: Arc<dyn FhirTransport>, codes: Arc<dyn CodeResolver>) -> Self {
        Self {
            loader: ResourceLoader::new(transport.clone()),
            transport,
            codes,
        }
    }

    pub fn with_load_strategy(mut self, strategy: LoadStrategy) -> Self {
        self.loader = self.loader.with_strategy(strategy);
        self
    }

    /// Load referenced resources through the configured strategy.
    pub async fn load(&self, references: &[Reference]) -> Result<ResourceSet> {
        self.loader.load(references).await
    }

    /// Submit a transaction and map its placeholders to the assigned identities.
    pub async fn submit(&self, request: &TransactionRequest) -> Result<TransactionResult> {
        tracing::debug!(entries = request.len(), "Submitting transaction");
        let response = self.transport.transaction(request.to_bundle()).await?;
        extract(request, &TransactionResponse::from_bundle(&response))
    }

    /// Single resource by id through a search, so server-side includes can ride along.
    async fn search_one(
        &self,
        resource_type: &str,
        id: &str,
        query: SearchQuery,
    ) -> Result<(JsonValue, ResourceSet)> {
        let bundle = self
            .transport
            .search(resource_type, &query.param("_id", id))
            .await?;
        let resources = ResourceSet::from_bundle(&bundle);
        let found = resources
            .find(resource_type, id)
            .cloned()
            .ok_or_else(|| Error::not_found(resource_type, id))?;
        Ok((found, resources))
    }
}

/// Resources the references point at, in reference order, each at most once.
///
/// References with no counterpart in `set` are skipped.
fn resolve_all(set: &ResourceSet, references: &[Reference]) -> Vec<JsonValue> {
    let mut out: Vec<JsonValue> = Vec::new();
    for reference in references {
        match set.resolve(reference) {
            Some(resource) if !out.iter().any(|r| reference.points_to(r)) => {
                out.push(resource.clone())
            }
            Some(_) => {}
            None => tracing::warn!(%reference, "Referenced resource was not returned by the server"),
        }
    }
    out
}

fn resource_id(resource: &JsonValue) -> Result<&str> {
    resource
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::InvalidResource("resource without id".to_string()))
}
