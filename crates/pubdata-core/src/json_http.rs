//! [`Fetcher`] for upstreams that answer `GET {base_url}/{operation}?{args}`
//! with a JSON body.
//!
//! Sending is behind the [`Transport`] seam so adapters can be tested
//! without a network. Transport failures come back already classified as
//! [`FetchError`]s, which is all the pipeline needs to decide on retries.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::fetcher::{FetchError, FetchFuture, FetchRequest, Fetcher, Payload};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const EXCERPT_CHARS: usize = 200;

/// How an upstream expects its API key.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Bearer(String),
    Header { name: String, value: String },
    /// Key passed as a query parameter, e.g. `api_key` for api.nasa.gov.
    Query { name: String, value: String },
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bearer(_) => f.write_str("Bearer(..)"),
            Self::Header { name, .. } => write!(f, "Header({name})"),
            Self::Query { name, .. } => write!(f, "Query({name})"),
        }
    }
}

/// A fully resolved GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonGet {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<RawResponse, FetchError>> + Send + 'a>>;

pub trait Transport: Send + Sync {
    fn get<'a>(&'a self, request: &'a JsonGet) -> TransportFuture<'a>;
}

/// [`Transport`] backed by a shared reqwest client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("pubdata-core/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for ReqwestTransport {
    fn get<'a>(&'a self, request: &'a JsonGet) -> TransportFuture<'a> {
        Box::pin(async move {
            let builder = request
                .headers
                .iter()
                .fold(self.client.get(&request.url), |builder, (name, value)| {
                    builder.header(name, value)
                })
                .timeout(request.timeout);

            let response = builder.send().await.map_err(classify)?;
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|e| FetchError::network(format!("failed to read response body: {e}")))?;
            Ok(RawResponse { status, body })
        })
    }
}

fn classify(error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::timeout(format!("request timed out: {error}"))
    } else if error.is_connect() {
        FetchError::network(format!("connection failed: {error}"))
    } else {
        FetchError::network(format!("request failed: {error}"))
    }
}

/// Generic JSON adapter over a [`Transport`].
#[derive(Clone)]
pub struct JsonFetcher {
    name: String,
    resource_key: String,
    base_url: String,
    credential: Option<Credential>,
    timeout: Duration,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for JsonFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonFetcher")
            .field("name", &self.name)
            .field("resource_key", &self.resource_key)
            .field("base_url", &self.base_url)
            .field("credential", &self.credential)
            .finish_non_exhaustive()
    }
}

impl JsonFetcher {
    pub fn new(
        name: impl Into<String>,
        resource_key: impl Into<String>,
        base_url: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            name: name.into(),
            resource_key: resource_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            credential: None,
            timeout: DEFAULT_TIMEOUT,
            transport,
        }
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Transport-level deadline. The pipeline's per-attempt deadline still
    /// applies on top of it.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolves `request` into the GET this fetcher would send.
    pub fn resolve(&self, request: &FetchRequest) -> JsonGet {
        let mut query: Vec<(&str, &str)> = request
            .args
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        let mut headers = vec![(String::from("accept"), String::from("application/json"))];
        match &self.credential {
            Some(Credential::Bearer(token)) => {
                headers.push((String::from("authorization"), format!("Bearer {token}")));
            }
            Some(Credential::Header { name, value }) => {
                headers.push((name.to_ascii_lowercase(), value.clone()));
            }
            Some(Credential::Query { name, value }) => query.push((name.as_str(), value.as_str())),
            None => {}
        }

        let path = request.operation.trim_start_matches('/');
        let mut url = format!("{}/{path}", self.base_url);
        for (index, (name, value)) in query.into_iter().enumerate() {
            url.push(if index == 0 { '?' } else { '&' });
            url.push_str(&urlencoding::encode(name));
            url.push('=');
            url.push_str(&urlencoding::encode(value));
        }

        JsonGet {
            url,
            headers,
            timeout: self.timeout,
        }
    }
}

impl Fetcher for JsonFetcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn resource_key(&self) -> &str {
        &self.resource_key
    }

    fn fetch<'a>(&'a self, request: &'a FetchRequest) -> FetchFuture<'a> {
        Box::pin(async move {
            let get = self.resolve(request);
            let response = self.transport.get(&get).await?;
            if !(200..300).contains(&response.status) {
                return Err(FetchError::from_status(response.status, excerpt(&response.body)));
            }
            serde_json::from_str::<Payload>(&response.body)
                .map_err(|e| FetchError::decode(format!("response is not valid JSON: {e}")))
        })
    }
}

fn excerpt(body: &str) -> String {
    match body.char_indices().nth(EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}...", &body[..cut]),
        None if body.is_empty() => String::from("empty response body"),
        None => body.to_owned(),
    }
}
