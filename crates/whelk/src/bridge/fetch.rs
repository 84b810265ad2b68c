//! The network fetch bridge.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::block_on::wait_for;
use crate::bridge::JsonBridge;

/// A network request decoded from the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FetchRequest {
    /// Target URL.
    pub url: String,
    /// HTTP method; empty means GET.
    pub method: String,
    /// Request headers.
    pub headers: HashMap<String, String>,
    /// Optional request body.
    pub body: Option<String>,
}

/// A network response encoded for the engine.
///
/// Every field has a defined default so partial host responses never
/// propagate missing values across the boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FetchResponse {
    /// Whether the response status was in the success range.
    pub ok: bool,
    /// HTTP status code; 0 when no response was received.
    pub status: u16,
    /// Status reason phrase.
    pub status_text: String,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Response body text.
    pub body: String,
    /// Host-side failure message, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FetchResponse {
    /// A response representing a host-side failure.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Host network capability.
///
/// Implementations may be fully async; the bridge adapts them to the
/// engine's synchronous calling convention.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform a network request.
    async fn fetch(&self, request: FetchRequest) -> anyhow::Result<FetchResponse>;
}

/// Blanket implementation for async closures.
#[async_trait]
impl<F, Fut> Fetcher for F
where
    F: Fn(FetchRequest) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<FetchResponse>> + Send,
{
    async fn fetch(&self, request: FetchRequest) -> anyhow::Result<FetchResponse> {
        self(request).await
    }
}

/// Default fetcher backed by `reqwest`.
#[derive(Debug, Default, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Create a fetcher with a fresh HTTP client.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: FetchRequest) -> anyhow::Result<FetchResponse> {
        let method = if request.method.is_empty() {
            reqwest::Method::GET
        } else {
            reqwest::Method::from_bytes(request.method.as_bytes())?
        };
        let mut builder = self.client.request(method, request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_string(), value.to_string());
            }
        }
        let body = response.text().await?;
        Ok(FetchResponse {
            ok: status.is_success(),
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
            error: None,
        })
    }
}

fn encode(response: &FetchResponse) -> String {
    serde_json::to_string(response).unwrap_or_else(|_| {
        r#"{"ok":false,"status":0,"statusText":"","headers":{},"body":"","error":"fetch response failed to encode"}"#
            .to_string()
    })
}

/// Build the fetch bridge closure for one engine call.
pub(crate) fn make_fetch_bridge(fetcher: Arc<dyn Fetcher>) -> JsonBridge {
    Arc::new(move |request_json: &str| {
        let request = match serde_json::from_str::<FetchRequest>(request_json) {
            Ok(request) => request,
            Err(error) => {
                return encode(&FetchResponse::failure(format!(
                    "malformed fetch request: {error}"
                )));
            }
        };
        let fetcher = Arc::clone(&fetcher);
        let outcome = wait_for(async move { fetcher.fetch(request).await });
        let response = match outcome {
            Ok(response) => response,
            Err(error) => FetchResponse::failure(error.to_string()),
        };
        encode(&response)
    })
}
