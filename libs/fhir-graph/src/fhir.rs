//! Code systems, profiles and value codes used by the workflows

pub mod system {
    pub const ICD_10: &str = "http://hl7.org/fhir/sid/icd-10-cm";
    pub const SNOMED: &str = "http://snomed.info/sct";
    pub const SDOH_CATEGORY: &str =
        "http://hl7.org/fhir/us/sdoh-clinicalcare/CodeSystem/SDOHCC-CodeSystemTemporaryCodes";
    pub const CONDITION_CATEGORY: &str =
        "http://hl7.org/fhir/us/core/CodeSystem/condition-category";
    pub const CONDITION_CLINICAL: &str =
        "http://terminology.hl7.org/CodeSystem/condition-clinical";
    pub const CONDITION_VERIFICATION: &str =
        "http://terminology.hl7.org/CodeSystem/condition-ver-status";
}

pub mod profile {
    pub const SDOH_CONDITION: &str =
        "http://hl7.org/fhir/us/sdoh-clinicalcare/StructureDefinition/SDOHCC-Condition";
}

/// US Core condition categories.
pub mod condition_category {
    pub const HEALTH_CONCERN: &str = "health-concern";
    pub const HEALTH_CONCERN_DISPLAY: &str = "Health Concern";
    pub const PROBLEM_LIST_ITEM: &str = "problem-list-item";
    pub const PROBLEM_LIST_ITEM_DISPLAY: &str = "Problem List Item";
}

pub mod clinical_status {
    pub const ACTIVE: &str = "active";
    pub const ACTIVE_DISPLAY: &str = "Active";
    pub const RESOLVED: &str = "resolved";
    pub const RESOLVED_DISPLAY: &str = "Resolved";
}

pub mod verification_status {
    pub const UNCONFIRMED: &str = "unconfirmed";
    pub const UNCONFIRMED_DISPLAY: &str = "Unconfirmed";
}
