use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata that follows a call from the caller to the instance serving it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestInfo {
    pub request_id: String,
    pub origin_address: Option<String>,
    pub connection_address: Option<String>,
}

impl RequestInfo {
    /// Creates a `RequestInfo` carrying a fresh request id.
    pub fn new() -> Self {
        RequestInfo {
            request_id: new_id(),
            ..Default::default()
        }
    }
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Envelope sent to an instance's `Forward` method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRpcIn {
    pub request_info: RequestInfo,
    pub method: String,
    pub input: Bytes,
}

/// Envelope returned by an instance. `error` is set when the service code
/// itself failed; `output` may still carry bytes in that case.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceRpcOut {
    pub output: Bytes,
    pub error: Option<String>,
}

pub fn forward_method(service_name: &str) -> String {
    format!("{}.Forward", service_name)
}
