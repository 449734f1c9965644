use thiserror::Error;

/// Failure reported by a [`FhirTransport`](crate::FhirTransport).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The server answered with a non-success HTTP status.
    #[error("server returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("request timed out")]
    Timeout,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("server unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum Error {
    /// A required resource was absent from a read result.
    #[error("{resource_type}/{id} not found")]
    ResourceNotFound { resource_type: String, id: String },

    /// A batched read failed; nothing from the load is returned.
    #[error("failed to load {resource_type} resources: {source}")]
    LoadFailure {
        resource_type: String,
        #[source]
        source: TransportError,
    },

    /// The transaction description cannot produce a self-consistent bundle.
    #[error("invalid transaction spec: {0}")]
    InvalidSpec(String),

    /// A transaction response cannot be lined up with its request.
    #[error("transaction response does not correlate with request: {0}")]
    CorrelationMismatch(String),

    #[error("transaction entry {index} was rejected with status '{status}'")]
    TransactionRejected { index: usize, status: String },

    #[error("no {system} code '{code}' for {resource_type} in category '{category}'")]
    UnknownCode {
        category: String,
        resource_type: String,
        system: String,
        code: String,
    },

    #[error("unknown category '{0}'")]
    UnknownCategory(String),

    #[error("invalid resource: {0}")]
    InvalidResource(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl Error {
    pub(crate) fn not_found(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::ResourceNotFound {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    pub(crate) fn load_failure(resource_type: impl Into<String>, source: TransportError) -> Self {
        Self::LoadFailure {
            resource_type: resource_type.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
