//! HTTP transport for the tandem resource-graph core
//!
//! [`HttpTransport`] implements [`tandem_graph::FhirTransport`] against a FHIR R4 REST base.

mod http;

pub use http::{HttpTransport, HttpTransportBuilder};
