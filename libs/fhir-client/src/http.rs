use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder};
use std::time::{Duration, Instant};
use tandem_graph::{FhirTransport, SearchQuery, TransportError};
use tandem_models::Bundle;
use url::Url;

pub const FHIR_JSON: &str = "application/fhir+json";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Builder for [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct HttpTransportBuilder {
    base_url: String,
    timeout: Duration,
    bearer_token: Option<String>,
}

impl HttpTransportBuilder {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send `Authorization: Bearer <token>` with every request.
    pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn build(self) -> Result<HttpTransport, TransportError> {
        let base = normalize_base(&self.base_url)?;
        let client = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| TransportError::Request(format!("failed to create HTTP client: {e}")))?;

        Ok(HttpTransport {
            client,
            base,
            bearer_token: self.bearer_token,
        })
    }
}

/// FHIR REST client over `reqwest`.
///
/// Cloning is cheap; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base: Url,
    bearer_token: Option<String>,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self, TransportError> {
        Self::builder(base_url).build()
    }

    pub fn builder(base_url: impl Into<String>) -> HttpTransportBuilder {
        HttpTransportBuilder {
            base_url: base_url.into(),
            timeout: DEFAULT_TIMEOUT,
            bearer_token: None,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// `[base]/{resource_type}?{query}`
    pub fn search_url(&self, resource_type: &str, query: &SearchQuery) -> Result<Url, TransportError> {
        if resource_type.is_empty() || resource_type.contains(['/', '?', '#']) {
            return Err(TransportError::Request(format!(
                "invalid resource type '{resource_type}'"
            )));
        }
        let mut url = self
            .base
            .join(resource_type)
            .map_err(|e| TransportError::Request(format!("invalid search URL: {e}")))?;
        let query = query.to_query_string();
        if !query.is_empty() {
            url.set_query(Some(&query));
        }
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn post_bundle(&self, kind: &str, bundle: &Bundle) -> Result<Bundle, TransportError> {
        let body = serde_json::to_vec(bundle)
            .map_err(|e| TransportError::Request(format!("failed to encode {kind} bundle: {e}")))?;
        let request = self
            .client
            .post(self.base.clone())
            .header(CONTENT_TYPE, FHIR_JSON)
            .body(body);
        self.send(kind, request).await
    }

    async fn send(&self, kind: &str, request: RequestBuilder) -> Result<Bundle, TransportError> {
        let started = Instant::now();
        let response = self
            .authorize(request.header(ACCEPT, FHIR_JSON))
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        let body = response.text().await.map_err(map_reqwest_error)?;
        tracing::debug!(
            kind,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "FHIR request completed"
        );

        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body)
            .map_err(|e| TransportError::InvalidResponse(format!("{kind} response is not a Bundle: {e}")))
    }
}

#[async_trait]
impl FhirTransport for HttpTransport {
    async fn search(
        &self,
        resource_type: &str,
        query: &SearchQuery,
    ) -> Result<Bundle, TransportError> {
        let url = self.search_url(resource_type, query)?;
        tracing::debug!(%url, "search");
        self.send("search", self.client.get(url)).await
    }

    async fn transaction(&self, bundle: Bundle) -> Result<Bundle, TransportError> {
        tracing::debug!(entries = bundle.entries().len(), "transaction");
        self.post_bundle("transaction", &bundle).await
    }

    async fn batch(&self, bundle: Bundle) -> Result<Bundle, TransportError> {
        tracing::debug!(entries = bundle.entries().len(), "batch");
        self.post_bundle("batch", &bundle).await
    }
}

/// Parse the service base and make sure its path ends in `/`, so relative joins keep it.
fn normalize_base(raw: &str) -> Result<Url, TransportError> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| TransportError::Request(format!("invalid base URL '{raw}': {e}")))?;
    if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
        return Err(TransportError::Request(format!(
            "base URL '{raw}' must be an http(s) URL"
        )));
    }
    url.set_query(None);
    url.set_fragment(None);
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Unavailable(err.to_string())
    } else if err.is_decode() {
        TransportError::InvalidResponse(err.to_string())
    } else {
        TransportError::Request(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_gets_a_trailing_slash() {
        let transport = HttpTransport::new("https://fhir.example.org/r4").unwrap();
        assert_eq!(transport.base_url().as_str(), "https://fhir.example.org/r4/");

        let transport = HttpTransport::new("https://fhir.example.org/r4/?x=1").unwrap();
        assert_eq!(transport.base_url().as_str(), "https://fhir.example.org/r4/");
    }

    #[test]
    fn rejects_non_http_bases() {
        assert!(matches!(
            HttpTransport::new("mailto:fhir@example.org"),
            Err(TransportError::Request(_))
        ));
        assert!(HttpTransport::new("not a url").is_err());
    }

    #[test]
    fn search_url_keeps_the_base_path() {
        let transport = HttpTransport::new("https://fhir.example.org/r4").unwrap();
        let query = SearchQuery::new()
            .param("_id", "T1")
            .include("Task", "focus");

        let url = transport.search_url("Task", &query).unwrap();
        assert_eq!(
            url.as_str(),
            "https://fhir.example.org/r4/Task?_id=T1&_include=Task%3Afocus"
        );

        let bare = transport.search_url("Patient", &SearchQuery::new()).unwrap();
        assert_eq!(bare.as_str(), "https://fhir.example.org/r4/Patient");
    }

    #[test]
    fn search_url_rejects_path_injection() {
        let transport = HttpTransport::new("https://fhir.example.org/r4").unwrap();
        assert!(transport.search_url("../admin", &SearchQuery::new()).is_err());
        assert!(transport.search_url("", &SearchQuery::new()).is_err());
    }

    #[tokio::test]
    async fn refused_connection_is_unavailable() {
        let transport = HttpTransport::builder("http://127.0.0.1:1/fhir")
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let err = transport
            .search("Patient", &SearchQuery::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Unavailable(_) | TransportError::Timeout
        ));
    }
}
