//! Transaction bundle construction
//!
//! A [`TransactionBuilder`] collects create/update/read operations and the reference links
//! between them. New resources get a `urn:uuid:` placeholder when registered, so resources
//! of the same transaction can point at each other before the server has assigned any id.
//! [`TransactionBuilder::build`] writes the links, checks that every placeholder resolves
//! inside the transaction and orders operations so referenced resources come first.

use crate::error::{Error, Result};
use crate::reference::{LocalId, Reference};
use serde_json::{Map, Value as JsonValue};
use std::collections::{HashMap, HashSet};
use tandem_models::{Bundle, BundleEntry, BundleEntryRequest, BundleType, Reference as WireReference};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Create,
    Update,
    Read,
}

impl Verb {
    pub fn method(self) -> &'static str {
        match self {
            Self::Create => "POST",
            Self::Update => "PUT",
            Self::Read => "GET",
        }
    }
}

/// Target of a declared reference link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Another operation of the same transaction.
    Local(LocalId),
    /// A resource that already exists on the server.
    Existing { resource_type: String, id: String },
}

impl Target {
    pub fn existing(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Existing {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }
}

impl From<LocalId> for Target {
    fn from(local: LocalId) -> Self {
        Self::Local(local)
    }
}

/// One entry of a transaction request.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub verb: Verb,
    pub resource_type: String,
    pub local_id: LocalId,
    /// Server id for updates and reads.
    pub target_id: Option<String>,
    pub resource: Option<JsonValue>,
}

impl Operation {
    /// Placeholder other operations may reference. Only creates have one.
    pub fn placeholder(&self) -> Option<LocalId> {
        (self.verb == Verb::Create).then_some(self.local_id)
    }

    pub fn request_url(&self) -> String {
        match &self.target_id {
            Some(id) if self.verb != Verb::Create => format!("{}/{}", self.resource_type, id),
            _ => self.resource_type.clone(),
        }
    }

    fn to_entry(&self) -> BundleEntry {
        BundleEntry {
            full_url: self.placeholder().map(|l| l.urn()),
            resource: self.resource.clone(),
            request: Some(BundleEntryRequest::new(self.verb.method(), self.request_url())),
            ..BundleEntry::default()
        }
    }
}

/// Ordered operations forming one atomic transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRequest {
    operations: Vec<Operation>,
}

impl TransactionRequest {
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn position(&self, local_id: LocalId) -> Option<usize> {
        self.operations.iter().position(|op| op.local_id == local_id)
    }

    /// FHIR `transaction` bundle with entries in operation order.
    pub fn to_bundle(&self) -> Bundle {
        Bundle::with_entries(
            BundleType::Transaction,
            self.operations.iter().map(Operation::to_entry).collect(),
        )
    }
}

#[derive(Debug)]
struct PendingOperation {
    verb: Verb,
    local_id: LocalId,
    resource_type: Option<String>,
    target_id: Option<String>,
    resource: Option<JsonValue>,
    links: Vec<(String, Target)>,
}

/// Caller-side description of a transaction.
#[derive(Debug, Default)]
pub struct TransactionBuilder {
    pending: Vec<PendingOperation>,
}

impl TransactionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource to create. The returned placeholder stays valid for this builder.
    pub fn create(&mut self, resource: JsonValue) -> LocalId {
        self.push(Verb::Create, None, None, Some(resource))
    }

    /// Register an update of an existing resource; it must carry its `id`.
    pub fn update(&mut self, resource: JsonValue) -> LocalId {
        let id = resource.get("id").and_then(|v| v.as_str()).map(str::to_string);
        self.push(Verb::Update, None, id, Some(resource))
    }

    /// Register a read confirming that `resource_type/id` exists.
    pub fn read(&mut self, resource_type: &str, id: &str) -> LocalId {
        self.push(
            Verb::Read,
            Some(resource_type.to_string()),
            Some(id.to_string()),
            None,
        )
    }

    /// Write a reference to `target` into `field` of the resource registered as `from`.
    ///
    /// `field` is a dotted path from the resource root; a trailing `[]` appends to an array
    /// (`"reasonReference[]"`), otherwise the element is set.
    pub fn link(&mut self, from: LocalId, field: &str, target: impl Into<Target>) -> &mut Self {
        let target = target.into();
        if let Some(op) = self.pending.iter_mut().find(|op| op.local_id == from) {
            op.links.push((field.to_string(), target));
        } else {
            // Reported by build(); an unknown source cannot be linked from.
            self.pending.push(PendingOperation {
                verb: Verb::Read,
                local_id: from,
                resource_type: None,
                target_id: None,
                resource: None,
                links: vec![(field.to_string(), target)],
            });
        }
        self
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn push(
        &mut self,
        verb: Verb,
        resource_type: Option<String>,
        target_id: Option<String>,
        resource: Option<JsonValue>,
    ) -> LocalId {
        let local_id = LocalId::generate();
        let resource_type = resource_type.or_else(|| {
            resource
                .as_ref()
                .and_then(|r| r.get("resourceType"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        });
        self.pending.push(PendingOperation {
            verb,
            local_id,
            resource_type,
            target_id,
            resource,
            links: Vec::new(),
        });
        local_id
    }

    /// Produce the ordered, self-consistent transaction request.
    ///
    /// Fails with [`Error::InvalidSpec`] when a link or an embedded placeholder does not
    /// resolve to an operation of this transaction, or an operation is malformed.
    pub fn build(self) -> Result<TransactionRequest> {
        let index: HashMap<LocalId, usize> = self
            .pending
            .iter()
            .enumerate()
            .map(|(i, op)| (op.local_id, i))
            .collect();

        let mut operations = Vec::with_capacity(self.pending.len());
        let mut dependencies: Vec<HashSet<usize>> = vec![HashSet::new(); self.pending.len()];

        // Snapshot identities first: links may target operations registered later.
        let identities: Vec<(Verb, Option<String>, Option<String>)> = self
            .pending
            .iter()
            .map(|op| (op.verb, op.resource_type.clone(), op.target_id.clone()))
            .collect();

        for (i, op) in self.pending.into_iter().enumerate() {
            let resource_type = validate_operation(i, &op)?;
            let mut resource = op.resource;

            for (field, target) in &op.links {
                let reference = match target {
                    Target::Existing { resource_type, id } => {
                        Reference::resolved(resource_type.clone(), id.clone()).to_string()
                    }
                    Target::Local(local) => {
                        let j = *index.get(local).ok_or_else(|| {
                            Error::InvalidSpec(format!(
                                "operation {i} links {field} to {local}, which is not part of this transaction"
                            ))
                        })?;
                        match &identities[j] {
                            (Verb::Create, _, _) => {
                                if j != i {
                                    dependencies[i].insert(j);
                                }
                                local.urn()
                            }
                            (_, Some(rt), Some(id)) => format!("{rt}/{id}"),
                            _ => {
                                return Err(Error::InvalidSpec(format!(
                                    "operation {i} links {field} to an operation without identity"
                                )))
                            }
                        }
                    }
                };
                let target_resource = resource.as_mut().ok_or_else(|| {
                    Error::InvalidSpec(format!(
                        "operation {i} ({}) has no resource to link {field} from",
                        op.verb.method()
                    ))
                })?;
                set_reference(target_resource, field, reference).map_err(|msg| {
                    Error::InvalidSpec(format!("operation {i}: cannot set {field}: {msg}"))
                })?;
            }

            if let Some(resource) = &resource {
                let mut embedded = Vec::new();
                collect_placeholders(resource, &mut embedded);
                for local in embedded {
                    match index.get(&local) {
                        Some(&j) if identities[j].0 == Verb::Create => {
                            if j != i {
                                dependencies[i].insert(j);
                            }
                        }
                        _ => {
                            return Err(Error::InvalidSpec(format!(
                                "operation {i} references placeholder {local} with no matching create"
                            )))
                        }
                    }
                }
            }

            operations.push(Operation {
                verb: op.verb,
                resource_type,
                local_id: op.local_id,
                target_id: op.target_id,
                resource,
            });
        }

        let order = dependency_order(&dependencies);
        let mut slots: Vec<Option<Operation>> = operations.into_iter().map(Some).collect();
        let operations: Vec<Operation> = order.into_iter().filter_map(|i| slots[i].take()).collect();

        tracing::debug!(operations = operations.len(), "Built transaction request");
        Ok(TransactionRequest { operations })
    }
}

fn validate_operation(index: usize, op: &PendingOperation) -> Result<String> {
    let resource_type = op.resource_type.clone().ok_or_else(|| {
        Error::InvalidSpec(format!(
            "operation {index} has no resource type (unknown link source or resource without resourceType)"
        ))
    })?;

    match op.verb {
        Verb::Create => {
            let resource = op.resource.as_ref().filter(|r| r.is_object()).ok_or_else(|| {
                Error::InvalidSpec(format!("create {index} needs a resource object"))
            })?;
            if resource.get("id").is_some() {
                return Err(Error::InvalidSpec(format!(
                    "create {index} of {resource_type} already carries an id"
                )));
            }
        }
        Verb::Update => {
            if !op.resource.as_ref().is_some_and(JsonValue::is_object) || op.target_id.is_none() {
                return Err(Error::InvalidSpec(format!(
                    "update {index} of {resource_type} needs a resource with an id"
                )));
            }
        }
        Verb::Read => {
            if op.target_id.is_none() {
                return Err(Error::InvalidSpec(format!(
                    "read {index} of {resource_type} needs an id"
                )));
            }
        }
    }
    Ok(resource_type)
}

/// Stable topological order: referenced operations first, ties and cycles by registration.
fn dependency_order(dependencies: &[HashSet<usize>]) -> Vec<usize> {
    let n = dependencies.len();
    let mut emitted = vec![false; n];
    let mut order = Vec::with_capacity(n);

    while order.len() < n {
        let ready = (0..n).find(|&i| {
            !emitted[i] && dependencies[i].iter().all(|&dep| emitted[dep])
        });
        // A cycle leaves nothing ready; fall back to registration order.
        let next = ready.or_else(|| (0..n).find(|&i| !emitted[i]));
        let Some(next) = next else { break };
        emitted[next] = true;
        order.push(next);
    }

    order
}

fn set_reference(resource: &mut JsonValue, field: &str, reference: String) -> std::result::Result<(), String> {
    let (path, append) = match field.strip_suffix("[]") {
        Some(path) => (path, true),
        None => (field, false),
    };
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop().filter(|s| !s.is_empty()).ok_or("empty field path")?;

    let mut current = resource;
    for segment in segments {
        let obj = current.as_object_mut().ok_or("path crosses a non-object element")?;
        current = obj
            .entry(segment.to_string())
            .or_insert_with(|| JsonValue::Object(Map::new()));
    }

    let obj = current.as_object_mut().ok_or("path crosses a non-object element")?;
    let value = serde_json::to_value(WireReference::to(reference)).map_err(|e| e.to_string())?;
    if append {
        match obj
            .entry(last.to_string())
            .or_insert_with(|| JsonValue::Array(Vec::new()))
        {
            JsonValue::Array(items) => items.push(value),
            _ => return Err(format!("{last} is not an array")),
        }
    } else {
        obj.insert(last.to_string(), value);
    }
    Ok(())
}

fn collect_placeholders(value: &JsonValue, out: &mut Vec<LocalId>) {
    match value {
        JsonValue::Array(items) => {
            for item in items {
                collect_placeholders(item, out);
            }
        }
        JsonValue::Object(obj) => {
            if let Some(raw) = obj.get("reference").and_then(|v| v.as_str()) {
                if raw.starts_with("urn:uuid:") {
                    // A malformed uuid can never match; keep it so it is reported.
                    out.push(LocalId::parse(raw).unwrap_or_else(LocalId::generate));
                }
            }
            for child in obj.values() {
                collect_placeholders(child, out);
            }
        }
        _ => {}
    }
}
