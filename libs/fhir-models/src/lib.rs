//! FHIR data types shared by the tandem exchange crates.
//!
//! Resources are carried as `serde_json::Value`; only bundles and the handful of
//! datatypes the exchange core manipulates are typed.

pub mod bundle;
pub mod common;

pub use bundle::{
    Bundle, BundleEntry, BundleEntryRequest, BundleEntryResponse, BundleEntrySearch, BundleLink,
    BundleType, SearchEntryMode,
};
pub use common::complex::{Annotation, CodeableConcept, Coding, Reference};
