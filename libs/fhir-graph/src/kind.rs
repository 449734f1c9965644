//! Resource kinds the exchange core knows the reference layout of

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A reference-bearing element of a resource, as a dotted path from the resource root.
///
/// Arrays anywhere along the path are flattened, so `output.valueReference` visits the
/// `valueReference` of every `Task.output` item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceField {
    pub path: &'static str,
}

const fn field(path: &'static str) -> ReferenceField {
    ReferenceField { path }
}

const TASK_FIELDS: &[ReferenceField] = &[
    field("basedOn"),
    field("focus"),
    field("for"),
    field("requester"),
    field("owner"),
    field("output.valueReference"),
];

const SERVICE_REQUEST_FIELDS: &[ReferenceField] = &[
    field("basedOn"),
    field("subject"),
    field("requester"),
    field("performer"),
    field("reasonReference"),
    field("supportingInfo"),
];

const CONDITION_FIELDS: &[ReferenceField] = &[
    field("subject"),
    field("asserter"),
    field("recorder"),
    field("evidence.detail"),
];

const GOAL_FIELDS: &[ReferenceField] = &[
    field("subject"),
    field("expressedBy"),
    field("addresses"),
];

const PROCEDURE_FIELDS: &[ReferenceField] = &[
    field("subject"),
    field("basedOn"),
    field("reasonReference"),
    field("performer.actor"),
];

const CONSENT_FIELDS: &[ReferenceField] = &[
    field("patient"),
    field("performer"),
    field("organization"),
];

const OBSERVATION_FIELDS: &[ReferenceField] = &[
    field("subject"),
    field("derivedFrom"),
    field("hasMember"),
];

const PATIENT_FIELDS: &[ReferenceField] =
    &[field("generalPractitioner"), field("managingOrganization")];

const ORGANIZATION_FIELDS: &[ReferenceField] = &[field("partOf")];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Task,
    ServiceRequest,
    Patient,
    Practitioner,
    Organization,
    Condition,
    Goal,
    Procedure,
    Consent,
    Observation,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 10] = [
        Self::Task,
        Self::ServiceRequest,
        Self::Patient,
        Self::Practitioner,
        Self::Organization,
        Self::Condition,
        Self::Goal,
        Self::Procedure,
        Self::Consent,
        Self::Observation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Task => "Task",
            Self::ServiceRequest => "ServiceRequest",
            Self::Patient => "Patient",
            Self::Practitioner => "Practitioner",
            Self::Organization => "Organization",
            Self::Condition => "Condition",
            Self::Goal => "Goal",
            Self::Procedure => "Procedure",
            Self::Consent => "Consent",
            Self::Observation => "Observation",
        }
    }

    /// Kind of a resource JSON object, from its `resourceType`.
    pub fn of(resource: &serde_json::Value) -> Option<Self> {
        resource
            .get("resourceType")
            .and_then(|v| v.as_str())
            .and_then(|rt| rt.parse().ok())
    }

    /// Reference-bearing fields in declaration order.
    pub fn reference_fields(self) -> &'static [ReferenceField] {
        match self {
            Self::Task => TASK_FIELDS,
            Self::ServiceRequest => SERVICE_REQUEST_FIELDS,
            Self::Patient => PATIENT_FIELDS,
            Self::Practitioner => &[],
            Self::Organization => ORGANIZATION_FIELDS,
            Self::Condition => CONDITION_FIELDS,
            Self::Goal => GOAL_FIELDS,
            Self::Procedure => PROCEDURE_FIELDS,
            Self::Consent => CONSENT_FIELDS,
            Self::Observation => OBSERVATION_FIELDS,
        }
    }

    /// The declared field at `path`, if this kind has one.
    pub fn field(self, path: &str) -> Option<&'static ReferenceField> {
        self.reference_fields().iter().find(|f| f.path == path)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unsupported resource type: {s}"))
    }
}
