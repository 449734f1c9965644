#![allow(dead_code)]

use serde_json::json;
use std::sync::Arc;
use tandem_graph::memory::{MemoryFhirServer, RecordedRequest};
use tandem_graph::{ResourceGraph, StaticCodeResolver, SubjectContext};

pub const PATIENT_ID: &str = "P1";
pub const PRACTITIONER_ID: &str = "U1";

pub fn server() -> Arc<MemoryFhirServer> {
    Arc::new(MemoryFhirServer::new())
}

pub fn graph(server: &Arc<MemoryFhirServer>) -> ResourceGraph {
    ResourceGraph::new(
        server.clone(),
        Arc::new(StaticCodeResolver::sdoh_defaults()),
    )
}

pub fn subject() -> SubjectContext {
    SubjectContext::new(PATIENT_ID, PRACTITIONER_ID)
}

/// Patient and practitioner every scenario starts from.
pub fn seed_people(server: &MemoryFhirServer) {
    server.seed(json!({
        "resourceType": "Patient",
        "id": PATIENT_ID,
        "name": [{ "family": "Doe", "given": ["Jane"] }],
        "managingOrganization": { "reference": "Organization/O1" }
    }));
    server.seed(json!({
        "resourceType": "Practitioner",
        "id": PRACTITIONER_ID,
        "name": [{ "family": "House" }]
    }));
    server.seed(json!({
        "resourceType": "Organization",
        "id": "O1",
        "name": "Community Housing Services"
    }));
}

/// Referral T1 → S1 → {C1, G1} with no consent.
pub fn seed_referral(server: &MemoryFhirServer) {
    seed_people(server);
    server.seed(json!({
        "resourceType": "Condition",
        "id": "C1",
        "subject": { "reference": "Patient/P1" },
        "code": { "text": "Homelessness" }
    }));
    server.seed(json!({
        "resourceType": "Goal",
        "id": "G1",
        "subject": { "reference": "Patient/P1" },
        "addresses": [{ "reference": "Condition/C1" }]
    }));
    server.seed(json!({
        "resourceType": "ServiceRequest",
        "id": "S1",
        "status": "active",
        "subject": { "reference": "Patient/P1" },
        "reasonReference": [{ "reference": "Condition/C1" }],
        "supportingInfo": [{ "reference": "Goal/G1" }]
    }));
    server.seed(json!({
        "resourceType": "Task",
        "id": "T1",
        "status": "requested",
        "intent": "order",
        "focus": { "reference": "ServiceRequest/S1" },
        "for": { "reference": "Patient/P1" },
        "requester": { "reference": "Organization/O1" }
    }));
}

pub fn search_types(server: &MemoryFhirServer) -> Vec<String> {
    server
        .requests()
        .into_iter()
        .filter_map(|r| match r {
            RecordedRequest::Search { resource_type, .. } => Some(resource_type),
            _ => None,
        })
        .collect()
}

pub fn transaction_count(server: &MemoryFhirServer) -> usize {
    server
        .requests()
        .iter()
        .filter(|r| matches!(r, RecordedRequest::Transaction { .. }))
        .count()
}
