use super::{resolve_all, resource_id, ResourceGraph};
use crate::collector::collect_field;
use crate::error::{Error, Result};
use crate::factory::{Target, TransactionBuilder};
use crate::fhir::{clinical_status, condition_category, profile, system, verification_status};
use crate::resource_set::ResourceSet;
use crate::transport::{search_matches, SearchQuery};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::collections::HashSet;
use tandem_models::{CodeableConcept, Coding};

/// Patient in focus and the practitioner acting on their record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectContext {
    pub patient_id: String,
    pub user_id: String,
}

impl SubjectContext {
    pub fn new(patient_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
            user_id: user_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewHealthConcern {
    pub name: String,
    pub category: String,
    pub icd_code: Option<String>,
    pub snomed_code: Option<String>,
}

/// View of an SDOH Condition and the evidence backing it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthConcern {
    pub id: String,
    pub name: Option<String>,
    pub category: Option<Coding>,
    pub icd: Option<Coding>,
    pub snomed: Option<Coding>,
    pub clinical_status: Option<String>,
    pub onset: Option<String>,
    pub recorded_date: Option<String>,
    pub evidence: Vec<JsonValue>,
    pub resource: JsonValue,
}

impl HealthConcern {
    /// Build the view from a Condition; evidence is looked up in `related`.
    pub fn from_condition(condition: JsonValue, related: &ResourceSet) -> Result<Self> {
        let id = resource_id(&condition)?.to_string();
        let code = concept(&condition["code"]);
        let category = concepts(&condition["category"])
            .iter()
            .find_map(|c| c.coding_for(system::SDOH_CATEGORY).cloned());
        let clinical_status = concept(&condition["clinicalStatus"])
            .and_then(|c| c.coding.into_iter().next())
            .and_then(|c| c.code);

        Ok(Self {
            id,
            name: code.as_ref().and_then(|c| c.text.clone()),
            category,
            icd: code.as_ref().and_then(|c| c.coding_for(system::ICD_10).cloned()),
            snomed: code.as_ref().and_then(|c| c.coding_for(system::SNOMED).cloned()),
            clinical_status,
            onset: string_at(&condition, "onsetDateTime"),
            recorded_date: string_at(&condition, "recordedDate"),
            evidence: evidence(&condition, related),
            resource: condition,
        })
    }
}

fn concept(value: &JsonValue) -> Option<CodeableConcept> {
    serde_json::from_value(value.clone()).ok()
}

fn concepts(value: &JsonValue) -> Vec<CodeableConcept> {
    serde_json::from_value(value.clone()).unwrap_or_default()
}

fn string_at(resource: &JsonValue, key: &str) -> Option<String> {
    resource.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

/// Evidence observations and everything they were derived from, breadth first.
fn evidence(condition: &JsonValue, related: &ResourceSet) -> Vec<JsonValue> {
    let mut out = resolve_all(related, &collect_field(condition, "evidence.detail"));
    let mut seen: HashSet<String> = out.iter().filter_map(identity).collect();
    let mut next = 0;
    while next < out.len() {
        let derived = resolve_all(related, &collect_field(&out[next], "derivedFrom"));
        for resource in derived {
            if identity(&resource).is_some_and(|key| seen.insert(key)) {
                out.push(resource);
            }
        }
        next += 1;
    }
    out
}

fn identity(resource: &JsonValue) -> Option<String> {
    Some(format!(
        "{}/{}",
        resource.get("resourceType")?.as_str()?,
        resource.get("id")?.as_str()?
    ))
}

/// Conditions of the subject, with their evidence chains included.
fn concern_query(subject: &SubjectContext) -> SearchQuery {
    SearchQuery::new()
        .param("patient", format!("Patient/{}", subject.patient_id))
        .include("Condition", "evidence-detail")
        .include_iterate("Observation", "derived-from")
}

/// Active SDOH health concerns of the subject.
fn active_concern_query(subject: &SubjectContext) -> SearchQuery {
    concern_query(subject)
        .param("_profile", profile::SDOH_CONDITION)
        .param("clinical-status", clinical_status::ACTIVE)
        .param(
            "category",
            format!(
                "{}|{}",
                system::CONDITION_CATEGORY,
                condition_category::HEALTH_CONCERN
            ),
        )
}

impl ResourceGraph {
    pub async fn list_health_concerns(&self, subject: &SubjectContext) -> Result<Vec<HealthConcern>> {
        let bundle = self
            .transport
            .search("Condition", &active_concern_query(subject))
            .await?;
        let related = ResourceSet::from_bundle(&bundle);
        let concerns = search_matches(&bundle, "Condition")
            .into_iter()
            .map(|condition| HealthConcern::from_condition(condition, &related))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            patient_id = %subject.patient_id,
            count = concerns.len(),
            "Listed health concerns"
        );
        Ok(concerns)
    }

    /// Record a new health concern for the subject and return it as stored.
    ///
    /// Runs a prepare transaction confirming patient and practitioner, a second transaction
    /// creating the Condition, then reloads the Condition through the listing query.
    pub async fn create_health_concern(
        &self,
        subject: &SubjectContext,
        new: &NewHealthConcern,
    ) -> Result<HealthConcern> {
        if new.name.trim().is_empty() {
            return Err(Error::Validation("health concern name is required".to_string()));
        }

        let category = self.codes.resolve_category(&new.category)?;
        let icd = new
            .icd_code
            .as_deref()
            .map(|code| {
                self.codes
                    .resolve_code(&new.category, "Condition", system::ICD_10, code)
            })
            .transpose()?;
        let snomed = new
            .snomed_code
            .as_deref()
            .map(|code| {
                self.codes
                    .resolve_code(&new.category, "Condition", system::SNOMED, code)
            })
            .transpose()?;

        let mut prepare = TransactionBuilder::new();
        let patient = prepare.read("Patient", &subject.patient_id);
        let practitioner = prepare.read("Practitioner", &subject.user_id);
        let prepared = self.submit(&prepare.build()?).await?;
        let patient_id = prepared.require(patient)?.id.clone();
        let practitioner_id = prepared.require(practitioner)?.id.clone();

        let mut create = TransactionBuilder::new();
        let condition = create.create(new_condition(&new.name, category, icd, snomed)?);
        create
            .link(condition, "subject", Target::existing("Patient", &patient_id))
            .link(condition, "asserter", Target::existing("Practitioner", &practitioner_id));
        let created = self.submit(&create.build()?).await?;
        let condition_id = created.require(condition)?.id.clone();

        tracing::info!(
            patient_id = %patient_id,
            condition_id = %condition_id,
            category = %new.category,
            "Created health concern"
        );

        self.reload_concern(&active_concern_query(subject), &condition_id)
            .await
    }

    /// Move a health concern onto the problem list.
    pub async fn promote_health_concern(
        &self,
        subject: &SubjectContext,
        id: &str,
    ) -> Result<HealthConcern> {
        self.change_concern(subject, id, |condition| {
            set_coding(
                condition,
                "category",
                system::CONDITION_CATEGORY,
                condition_category::PROBLEM_LIST_ITEM,
                condition_category::PROBLEM_LIST_ITEM_DISPLAY,
            )
        })
        .await
    }

    pub async fn resolve_health_concern(
        &self,
        subject: &SubjectContext,
        id: &str,
    ) -> Result<HealthConcern> {
        self.change_concern(subject, id, |condition| {
            set_coding(
                condition,
                "clinicalStatus",
                system::CONDITION_CLINICAL,
                clinical_status::RESOLVED,
                clinical_status::RESOLVED_DISPLAY,
            )
        })
        .await
    }

    /// Fetch an active concern, apply `change`, stamp the onset and write it back.
    ///
    /// The returned view comes from a fresh read, so it reflects what the server stored.
    async fn change_concern<F>(
        &self,
        subject: &SubjectContext,
        id: &str,
        change: F,
    ) -> Result<HealthConcern>
    where
        F: FnOnce(&mut JsonValue) -> Result<()>,
    {
        let (mut condition, _) = self
            .search_one("Condition", id, active_concern_query(subject))
            .await?;
        change(&mut condition)?;
        if let Some(obj) = condition.as_object_mut() {
            obj.insert("onsetDateTime".to_string(), json!(Utc::now().to_rfc3339()));
        }

        let mut builder = TransactionBuilder::new();
        builder.update(condition);
        self.submit(&builder.build()?).await?;
        tracing::info!(condition_id = %id, "Updated health concern");

        // The change may take the Condition out of the active listing filters.
        self.reload_concern(&concern_query(subject), id).await
    }

    async fn reload_concern(&self, query: &SearchQuery, id: &str) -> Result<HealthConcern> {
        let bundle = self
            .transport
            .search("Condition", &query.clone().param("_id", id))
            .await?;
        let related = ResourceSet::from_bundle(&bundle);
        let condition = related
            .find("Condition", id)
            .cloned()
            .ok_or_else(|| Error::not_found("Condition", id))?;
        HealthConcern::from_condition(condition, &related)
    }
}

fn new_condition(
    name: &str,
    category: Coding,
    icd: Option<Coding>,
    snomed: Option<Coding>,
) -> Result<JsonValue> {
    let health_concern = CodeableConcept::from_coding(
        Coding::new(system::CONDITION_CATEGORY, condition_category::HEALTH_CONCERN)
            .with_display(condition_category::HEALTH_CONCERN_DISPLAY),
    );
    let code = CodeableConcept {
        coding: icd.into_iter().chain(snomed).collect(),
        text: Some(name.to_string()),
    };
    let clinical = CodeableConcept::from_coding(
        Coding::new(system::CONDITION_CLINICAL, clinical_status::ACTIVE)
            .with_display(clinical_status::ACTIVE_DISPLAY),
    );
    let verification = CodeableConcept::from_coding(
        Coding::new(system::CONDITION_VERIFICATION, verification_status::UNCONFIRMED)
            .with_display(verification_status::UNCONFIRMED_DISPLAY),
    );

    let to_json = |value: &CodeableConcept| {
        serde_json::to_value(value).map_err(|e| Error::InvalidResource(e.to_string()))
    };
    Ok(json!({
        "resourceType": "Condition",
        "meta": { "profile": [profile::SDOH_CONDITION] },
        "clinicalStatus": to_json(&clinical)?,
        "verificationStatus": to_json(&verification)?,
        "category": [to_json(&health_concern)?, to_json(&CodeableConcept::from_coding(category))?],
        "code": to_json(&code)?,
        "recordedDate": Utc::now().to_rfc3339(),
    }))
}

/// Set the `system` coding of a CodeableConcept element (or array of them) to `code`.
///
/// The first concept holding a coding from `system` is changed; if none does, the coding
/// is added to the first concept.
fn set_coding(
    resource: &mut JsonValue,
    element: &str,
    system: &str,
    code: &str,
    display: &str,
) -> Result<()> {
    let obj = resource
        .as_object_mut()
        .ok_or_else(|| Error::InvalidResource("resource is not a JSON object".to_string()))?;
    let current = obj.get(element).cloned().unwrap_or(JsonValue::Null);
    let is_array = current.is_array() || (current.is_null() && element == "category");

    let mut values: Vec<CodeableConcept> = match current {
        JsonValue::Null => Vec::new(),
        items @ JsonValue::Array(_) => serde_json::from_value(items)
            .map_err(|e| Error::InvalidResource(format!("{element}: {e}")))?,
        single => vec![serde_json::from_value(single)
            .map_err(|e| Error::InvalidResource(format!("{element}: {e}")))?],
    };

    let replacement = Coding::new(system, code).with_display(display);
    match values.iter_mut().find_map(|c| c.coding_for_mut(system)) {
        Some(coding) => *coding = replacement,
        None => match values.first_mut() {
            Some(first) => first.coding.push(replacement),
            None => values.push(CodeableConcept::from_coding(replacement)),
        },
    }

    let value = if is_array {
        serde_json::to_value(&values)
    } else {
        serde_json::to_value(&values[0])
    }
    .map_err(|e| Error::InvalidResource(e.to_string()))?;
    obj.insert(element.to_string(), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_pulls_codes_and_evidence_chain() {
        let condition = json!({
            "resourceType": "Condition",
            "id": "C1",
            "clinicalStatus": { "coding": [{ "system": system::CONDITION_CLINICAL, "code": "active" }] },
            "category": [
                { "coding": [{ "system": system::CONDITION_CATEGORY, "code": "health-concern" }] },
                { "coding": [{ "system": system::SDOH_CATEGORY, "code": "food-insecurity" }] }
            ],
            "code": {
                "coding": [{ "system": system::ICD_10, "code": "Z59.4" }],
                "text": "Food insecurity"
            },
            "evidence": [{ "detail": [{ "reference": "Observation/O1" }] }]
        });
        let mut related = ResourceSet::new();
        related.push(json!({ "resourceType": "Observation", "id": "O1", "derivedFrom": [{ "reference": "Observation/O2" }] }));
        related.push(json!({ "resourceType": "Observation", "id": "O2", "derivedFrom": [{ "reference": "Observation/O1" }] }));

        let concern = HealthConcern::from_condition(condition, &related).unwrap();
        assert_eq!(concern.name.as_deref(), Some("Food insecurity"));
        assert_eq!(concern.icd.unwrap().code.as_deref(), Some("Z59.4"));
        assert!(concern.snomed.is_none());
        assert_eq!(
            concern.category.unwrap().code.as_deref(),
            Some("food-insecurity")
        );
        assert_eq!(concern.clinical_status.as_deref(), Some("active"));
        assert_eq!(concern.evidence.len(), 2);
    }

    #[test]
    fn set_coding_replaces_in_place() {
        let mut condition = json!({
            "resourceType": "Condition",
            "category": [
                { "coding": [{ "system": system::CONDITION_CATEGORY, "code": "health-concern" }] },
                { "coding": [{ "system": system::SDOH_CATEGORY, "code": "housing-instability" }] }
            ],
            "clinicalStatus": { "coding": [{ "system": system::CONDITION_CLINICAL, "code": "active" }] }
        });

        set_coding(
            &mut condition,
            "category",
            system::CONDITION_CATEGORY,
            condition_category::PROBLEM_LIST_ITEM,
            condition_category::PROBLEM_LIST_ITEM_DISPLAY,
        )
        .unwrap();
        assert_eq!(condition["category"][0]["coding"][0]["code"], "problem-list-item");
        assert_eq!(condition["category"][1]["coding"][0]["code"], "housing-instability");

        set_coding(
            &mut condition,
            "clinicalStatus",
            system::CONDITION_CLINICAL,
            clinical_status::RESOLVED,
            clinical_status::RESOLVED_DISPLAY,
        )
        .unwrap();
        assert_eq!(condition["clinicalStatus"]["coding"][0]["code"], "resolved");
        assert!(condition["clinicalStatus"].is_object());
    }

    #[test]
    fn new_condition_carries_profile_and_codes() {
        let condition = new_condition(
            "Homeless",
            Coding::new(system::SDOH_CATEGORY, "housing-instability"),
            Some(Coding::new(system::ICD_10, "Z59.0")),
            None,
        )
        .unwrap();
        assert_eq!(condition["meta"]["profile"][0], profile::SDOH_CONDITION);
        assert_eq!(condition["code"]["text"], "Homeless");
        assert_eq!(condition["code"]["coding"][0]["code"], "Z59.0");
        assert_eq!(condition["category"][0]["coding"][0]["code"], "health-concern");
        assert!(condition.get("id").is_none());
    }
}
