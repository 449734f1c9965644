//! Demo records for `--memory` runs

use serde_json::json;
use tandem_graph::fhir::{clinical_status, condition_category, profile, system};
use tandem_graph::memory::MemoryFhirServer;

pub const PATIENT_ID: &str = "P1";
pub const PRACTITIONER_ID: &str = "U1";
pub const TASK_ID: &str = "T1";

/// A referral (Task T1 → ServiceRequest S1) and one open SDOH health concern for P1.
pub fn seed_demo(server: &MemoryFhirServer) {
    server.seed(json!({
        "resourceType": "Patient",
        "id": PATIENT_ID,
        "name": [{ "family": "Doe", "given": ["Jane"] }],
        "managingOrganization": { "reference": "Organization/O1" }
    }));
    server.seed(json!({
        "resourceType": "Practitioner",
        "id": PRACTITIONER_ID,
        "name": [{ "family": "Rivera", "given": ["Sam"] }]
    }));
    server.seed(json!({
        "resourceType": "Organization",
        "id": "O1",
        "name": "Community Housing Services"
    }));

    server.seed(json!({
        "resourceType": "Observation",
        "id": "OB2",
        "status": "final",
        "code": { "text": "Housing status screening response" },
        "subject": { "reference": "Patient/P1" }
    }));
    server.seed(json!({
        "resourceType": "Observation",
        "id": "OB1",
        "status": "final",
        "code": { "text": "Housing instability" },
        "subject": { "reference": "Patient/P1" },
        "derivedFrom": [{ "reference": "Observation/OB2" }]
    }));
    server.seed(json!({
        "resourceType": "Condition",
        "id": "C1",
        "meta": { "profile": [profile::SDOH_CONDITION] },
        "clinicalStatus": {
            "coding": [{ "system": system::CONDITION_CLINICAL, "code": clinical_status::ACTIVE }]
        },
        "category": [
            {
                "coding": [{
                    "system": system::CONDITION_CATEGORY,
                    "code": condition_category::HEALTH_CONCERN
                }]
            },
            {
                "coding": [{ "system": system::SDOH_CATEGORY, "code": "housing-instability" }]
            }
        ],
        "code": {
            "coding": [{ "system": system::ICD_10, "code": "Z59.0", "display": "Homelessness" }],
            "text": "Homelessness"
        },
        "subject": { "reference": "Patient/P1" },
        "asserter": { "reference": "Practitioner/U1" },
        "evidence": [{ "detail": [{ "reference": "Observation/OB1" }] }]
    }));

    server.seed(json!({
        "resourceType": "Goal",
        "id": "G1",
        "lifecycleStatus": "active",
        "description": { "text": "Stable housing within 90 days" },
        "subject": { "reference": "Patient/P1" },
        "addresses": [{ "reference": "Condition/C1" }]
    }));
    server.seed(json!({
        "resourceType": "ServiceRequest",
        "id": "S1",
        "status": "active",
        "intent": "order",
        "code": { "text": "Referral to housing assistance" },
        "subject": { "reference": "Patient/P1" },
        "requester": { "reference": "Practitioner/U1" },
        "reasonReference": [{ "reference": "Condition/C1" }],
        "supportingInfo": [{ "reference": "Goal/G1" }]
    }));
    server.seed(json!({
        "resourceType": "Task",
        "id": TASK_ID,
        "status": "requested",
        "intent": "order",
        "focus": { "reference": "ServiceRequest/S1" },
        "for": { "reference": "Patient/P1" },
        "requester": { "reference": "Practitioner/U1" },
        "owner": { "reference": "Organization/O1" }
    }));
}
