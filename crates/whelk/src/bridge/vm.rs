//! The nested-runtime bridge wire format.
//!
//! Requests are tagged with a runtime kind and routed either to one of the
//! built-in auxiliary runtime synchronizers (see [`crate::vm`]) or to a
//! host-supplied [`VmHandler`] override. Rejected kinds return a well-formed
//! error response carrying the request's filesystem snapshot unchanged, so
//! the caller cannot lose state on rejection.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A nested-runtime invocation decoded from the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VmRequest {
    /// Runtime kind, e.g. `"python3"` or `"sqlite3"`.
    pub runtime: String,
    /// Command-line arguments for the runtime.
    pub args: Vec<String>,
    /// Standard input text.
    pub stdin: String,
    /// Working directory inside the runtime.
    pub cwd: String,
    /// Environment for the invocation.
    pub env: HashMap<String, String>,
    /// Filesystem snapshot visible to the runtime.
    pub files: HashMap<String, String>,
}

/// A nested-runtime result encoded for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VmResponse {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Exit code; nonzero on failure.
    pub exit_code: i32,
    /// Host-side failure message, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Updated filesystem snapshot, when the runtime ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<HashMap<String, String>>,
}

impl Default for VmResponse {
    fn default() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 1,
            error: None,
            files: None,
        }
    }
}

impl VmResponse {
    /// An error response that echoes the given snapshot back unchanged.
    pub fn unavailable(message: impl Into<String>, files: HashMap<String, String>) -> Self {
        Self {
            error: Some(message.into()),
            files: Some(files),
            ..Default::default()
        }
    }

    /// An error response without a snapshot (the engine keeps its own).
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Host override for the whole nested-runtime bridge.
///
/// When configured, every request goes to the handler regardless of kind;
/// the built-in synchronizers are bypassed.
#[async_trait]
pub trait VmHandler: Send + Sync {
    /// Handle a nested-runtime request.
    async fn run(&self, request: VmRequest) -> anyhow::Result<VmResponse>;
}

/// Blanket implementation for async closures.
#[async_trait]
impl<F, Fut> VmHandler for F
where
    F: Fn(VmRequest) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<VmResponse>> + Send,
{
    async fn run(&self, request: VmRequest) -> anyhow::Result<VmResponse> {
        self(request).await
    }
}

pub(crate) fn encode(response: &VmResponse) -> String {
    serde_json::to_string(response).unwrap_or_else(|_| {
        r#"{"stdout":"","stderr":"","exitCode":1,"error":"vm response failed to encode"}"#
            .to_string()
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let request: VmRequest = serde_json::from_str(r#"{"runtime":"python3"}"#).unwrap();
        assert_eq!(request.runtime, "python3");
        assert!(request.args.is_empty());
        assert_eq!(request.stdin, "");
        assert!(request.files.is_empty());
    }

    #[test]
    fn test_unavailable_echoes_files() {
        let mut files = HashMap::new();
        files.insert("/db".to_string(), "data".to_string());
        let response = VmResponse::unavailable("python3 runtime is disabled", files.clone());
        assert_eq!(response.exit_code, 1);
        assert_eq!(response.files.unwrap(), files);

        let encoded = encode(&VmResponse::unavailable("nope", HashMap::new()));
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["exitCode"], 1);
        assert_eq!(value["error"], "nope");
    }
}
