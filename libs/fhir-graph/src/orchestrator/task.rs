use super::{resolve_all, ResourceGraph};
use crate::collector;
use crate::error::{Error, Result};
use crate::factory::TransactionBuilder;
use crate::reference::Reference;
use crate::resource_set::ResourceSet;
use crate::transport::SearchQuery;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::fmt;
use std::str::FromStr;
use tandem_models::Annotation;

/// A Task with everything a receiving party needs to act on it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResources {
    pub task: JsonValue,
    pub service_request: JsonValue,
    pub patient: JsonValue,
    pub requester: Option<JsonValue>,
    pub consent: Option<JsonValue>,
    pub conditions: Vec<JsonValue>,
    pub goals: Vec<JsonValue>,
    pub procedures: Vec<JsonValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Draft,
    Requested,
    Received,
    Accepted,
    Rejected,
    Ready,
    Cancelled,
    InProgress,
    OnHold,
    Failed,
    Completed,
    EnteredInError,
}

impl TaskStatus {
    const ALL: [TaskStatus; 12] = [
        Self::Draft,
        Self::Requested,
        Self::Received,
        Self::Accepted,
        Self::Rejected,
        Self::Ready,
        Self::Cancelled,
        Self::InProgress,
        Self::OnHold,
        Self::Failed,
        Self::Completed,
        Self::EnteredInError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Requested => "requested",
            Self::Received => "received",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Ready => "ready",
            Self::Cancelled => "cancelled",
            Self::InProgress => "in-progress",
            Self::OnHold => "on-hold",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::EnteredInError => "entered-in-error",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown task status: {s}"))
    }
}

/// Requested change to a Task. Absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub status_reason: Option<String>,
    pub comment: Option<String>,
}

impl TaskUpdate {
    /// Only a comment is present: the task is annotated, nothing else changes.
    pub fn is_comment_only(&self) -> bool {
        self.status.is_none() && self.status_reason.is_none() && has_text(&self.comment)
    }

    pub fn validate(&self) -> Result<()> {
        if self.status.is_none() && !has_text(&self.status_reason) && !has_text(&self.comment) {
            return Err(Error::Validation(
                "task update carries no status, reason or comment".to_string(),
            ));
        }
        if self.status == Some(TaskStatus::Cancelled) && !has_text(&self.status_reason) {
            return Err(Error::Validation(
                "cancelling a task requires a status reason".to_string(),
            ));
        }
        Ok(())
    }

    fn apply(&self, task: &mut JsonValue, now: &str) -> Result<()> {
        let obj = task
            .as_object_mut()
            .ok_or_else(|| Error::InvalidResource("Task is not a JSON object".to_string()))?;

        if let Some(comment) = self.comment.as_deref().filter(|c| !c.trim().is_empty()) {
            let notes = obj.entry("note".to_string()).or_insert_with(|| json!([]));
            let note = Annotation {
                text: comment.to_string(),
                time: Some(now.to_string()),
                author_reference: None,
            };
            let note = serde_json::to_value(note)
                .map_err(|e| Error::InvalidResource(format!("Task.note: {e}")))?;
            match notes.as_array_mut() {
                Some(notes) => notes.push(note),
                None => {
                    return Err(Error::InvalidResource(
                        "Task.note is not an array".to_string(),
                    ))
                }
            }
        }
        if self.is_comment_only() {
            return Ok(());
        }

        if let Some(status) = self.status {
            obj.insert("status".to_string(), json!(status.as_str()));
        }
        if let Some(reason) = self.status_reason.as_deref().filter(|r| !r.trim().is_empty()) {
            obj.insert("statusReason".to_string(), json!({ "text": reason }));
        }
        obj.insert("lastModified".to_string(), json!(now));
        Ok(())
    }
}

fn has_text(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

impl ResourceGraph {
    /// Read a Task together with the resources it and its focus ServiceRequest point at.
    ///
    /// Task, focus, patient and requester come back in one search with includes. The
    /// references both resources declare are then collected, and whatever the includes
    /// did not cover is loaded in one request per resource type.
    pub async fn task_resources(&self, task_id: &str) -> Result<TaskResources> {
        let query = SearchQuery::new()
            .include("Task", "focus")
            .include("Task", "patient")
            .include("Task", "requester");
        let (task, mut resources) = self.search_one("Task", task_id, query).await?;

        let focus = first_in(&task, "focus");
        let service_request = required(&resources, focus.as_ref(), "ServiceRequest", task_id)?;
        let subject = first_in(&task, "for");
        let patient = required(&resources, subject.as_ref(), "Patient", task_id)?;
        let requester = first_in(&task, "requester").and_then(|r| resources.resolve(&r).cloned());

        let task_refs = collector::collect(&task);
        let request_refs = collector::collect(&service_request);
        let procedure_refs = collector::of_type(&task_refs, "Procedure");
        let consent_refs = collector::of_type(&request_refs, "Consent");
        let goal_refs = collector::of_type(&request_refs, "Goal");
        let condition_refs = collector::of_type(&request_refs, "Condition");

        let missing: Vec<Reference> = procedure_refs
            .iter()
            .chain(&consent_refs)
            .chain(&goal_refs)
            .chain(&condition_refs)
            .filter(|r| !resources.contains(r))
            .cloned()
            .collect();
        resources.merge(self.load(&missing).await?);

        let result = TaskResources {
            consent: resolve_all(&resources, &consent_refs).into_iter().next(),
            conditions: resolve_all(&resources, &condition_refs),
            goals: resolve_all(&resources, &goal_refs),
            procedures: resolve_all(&resources, &procedure_refs),
            task,
            service_request,
            patient,
            requester,
        };

        tracing::info!(
            task_id = %task_id,
            conditions = result.conditions.len(),
            goals = result.goals.len(),
            procedures = result.procedures.len(),
            consent = result.consent.is_some(),
            "Resolved task resources"
        );
        Ok(result)
    }

    /// Apply a status change or comment to a Task, then re-read it with its resources.
    pub async fn update_task(&self, task_id: &str, update: &TaskUpdate) -> Result<TaskResources> {
        update.validate()?;

        let (mut task, _) = self
            .search_one("Task", task_id, SearchQuery::new())
            .await?;
        update.apply(&mut task, &Utc::now().to_rfc3339())?;

        let mut builder = TransactionBuilder::new();
        builder.update(task);
        self.submit(&builder.build()?).await?;

        tracing::info!(
            task_id = %task_id,
            status = ?update.status,
            comment_only = update.is_comment_only(),
            "Updated task"
        );
        self.task_resources(task_id).await
    }
}

fn first_in(resource: &JsonValue, field: &str) -> Option<Reference> {
    collector::collect_field(resource, field).into_iter().next()
}

/// The resource `reference` points at, else the first of its type in the include result.
fn required(
    resources: &ResourceSet,
    reference: Option<&Reference>,
    resource_type: &str,
    task_id: &str,
) -> Result<JsonValue> {
    reference
        .and_then(|r| resources.resolve(r))
        .or_else(|| resources.first(resource_type))
        .cloned()
        .ok_or_else(|| {
            let id = reference
                .and_then(Reference::id)
                .map(str::to_string)
                .unwrap_or_else(|| format!("referenced by Task/{task_id}"));
            Error::not_found(resource_type, id)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelling_requires_a_reason() {
        let update = TaskUpdate {
            status: Some(TaskStatus::Cancelled),
            ..TaskUpdate::default()
        };
        assert!(matches!(update.validate(), Err(Error::Validation(_))));

        let with_reason = TaskUpdate {
            status: Some(TaskStatus::Cancelled),
            status_reason: Some("patient moved".to_string()),
            comment: None,
        };
        assert!(with_reason.validate().is_ok());
        assert!(TaskUpdate::default().validate().is_err());
    }

    #[test]
    fn comment_only_update_just_appends_a_note() {
        let update = TaskUpdate {
            comment: Some("called the patient".to_string()),
            ..TaskUpdate::default()
        };
        assert!(update.is_comment_only());

        let mut task = json!({ "resourceType": "Task", "id": "T1", "status": "ready" });
        update.apply(&mut task, "2024-05-01T10:00:00Z").unwrap();
        assert_eq!(task["status"], "ready");
        assert_eq!(task["note"][0]["text"], "called the patient");
        assert!(task.get("lastModified").is_none());
    }

    #[test]
    fn status_update_sets_reason_and_timestamp() {
        let update = TaskUpdate {
            status: Some(TaskStatus::Cancelled),
            status_reason: Some("duplicate referral".to_string()),
            comment: Some("closing".to_string()),
        };
        let mut task = json!({ "resourceType": "Task", "id": "T1", "status": "in-progress", "note": [{ "text": "old" }] });
        update.apply(&mut task, "2024-05-01T10:00:00Z").unwrap();
        assert_eq!(task["status"], "cancelled");
        assert_eq!(task["statusReason"]["text"], "duplicate referral");
        assert_eq!(task["note"][1]["text"], "closing");
        assert_eq!(task["lastModified"], "2024-05-01T10:00:00Z");
    }

    #[test]
    fn statuses_use_fhir_codes() {
        assert_eq!("in-progress".parse::<TaskStatus>(), Ok(TaskStatus::InProgress));
        assert_eq!(
            serde_json::to_value(TaskStatus::EnteredInError).unwrap(),
            json!("entered-in-error")
        );
        assert!("done".parse::<TaskStatus>().is_err());
    }
}
