//! Resource-graph resolution and transaction aggregation over FHIR
//!
//! # Read path
//!
//! ```text
//! root resource → collector (references) → loader (one read per type) → ResourceSet
//! ```
//!
//! The [`collector`] lists the references a resource holds, using a per-kind field table.
//! The [`loader`] deduplicates them and fetches each target type in a single request.
//!
//! # Write path
//!
//! ```text
//! TransactionBuilder → TransactionRequest → transaction Bundle → response → TransactionResult
//! ```
//!
//! New resources get `urn:uuid` placeholders so they can reference each other before the
//! server assigns ids; [`extract`] recovers those ids by position.
//!
//! [`ResourceGraph`] composes both paths into the exchange workflows. Transports are
//! injected through [`FhirTransport`]; [`memory::MemoryFhirServer`] is an in-process one.

pub mod collector;
mod error;
pub mod extract;
pub mod factory;
pub mod fhir;
pub mod kind;
pub mod loader;
pub mod memory;
pub mod orchestrator;
pub mod reference;
mod resource_set;
pub mod terminology;
pub mod transport;

pub use error::{Error, Result, TransportError};
pub use extract::{extract, Extracted, OperationResult, TransactionResponse, TransactionResult};
pub use factory::{Operation, Target, TransactionBuilder, TransactionRequest, Verb};
pub use kind::ResourceKind;
pub use loader::{LoadStrategy, ResourceLoader};
pub use orchestrator::{
    HealthConcern, NewHealthConcern, ResourceGraph, SubjectContext, TaskResources, TaskStatus,
    TaskUpdate,
};
pub use reference::{LocalId, Reference};
pub use resource_set::ResourceSet;
pub use terminology::{CodeResolver, StaticCodeResolver};
pub use transport::{FhirTransport, Include, SearchQuery};
