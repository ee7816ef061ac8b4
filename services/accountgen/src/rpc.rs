//! JSON-RPC types and method dispatch
//!
//! A single mapper routes method names to handlers; anything unregistered
//! falls through to the default handler's fixed "method not supported"
//! error. Registration happens once at startup, so a backend that failed to
//! initialize simply never gets its method registered.

use std::collections::HashMap;
use std::sync::Arc;

use accountgen::{GeneratorError, KeyGenerator};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const METHOD_NOT_SUPPORTED: i64 = -32601;
pub const KEYSTORE_OPERATION_FAILED: i64 = -32000;
pub const DUPLICATE_ADDRESS: i64 = -32001;
pub const CERTIFICATE_ISSUANCE_FAILED: i64 = -32002;
pub const BACKEND_NOT_READY: i64 = -32003;
pub const BACKEND_INITIALIZATION_FAILED: i64 = -32004;
pub const INVALID_ADDRESS: i64 = -32602;

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Value,
}

impl JsonRpcResponse {
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0",
            result: None,
            error: Some(error),
            id,
        }
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

impl JsonRpcError {
    pub fn method_not_supported() -> Self {
        Self {
            code: METHOD_NOT_SUPPORTED,
            message: "method not supported".to_string(),
        }
    }
}

/// Backend failure detail stays in the logs. The wire carries stable codes
/// and generic messages so no backend text reaches callers.
impl From<&GeneratorError> for JsonRpcError {
    fn from(error: &GeneratorError) -> Self {
        match error {
            GeneratorError::KeyStoreOperation(_) => Self {
                code: KEYSTORE_OPERATION_FAILED,
                message: "keystore operation failed".to_string(),
            },
            GeneratorError::DuplicateAddress(address) => Self {
                code: DUPLICATE_ADDRESS,
                message: format!("address already exists: {}", address),
            },
            GeneratorError::CertificateIssuance(_) => Self {
                code: CERTIFICATE_ISSUANCE_FAILED,
                message: "certificate issuance failed".to_string(),
            },
            GeneratorError::BackendNotReady => Self {
                code: BACKEND_NOT_READY,
                message: "backend is not ready".to_string(),
            },
            GeneratorError::Initialization(_) | GeneratorError::Configuration(_) => Self {
                code: BACKEND_INITIALIZATION_FAILED,
                message: "backend initialization failed".to_string(),
            },
            GeneratorError::InvalidAddress(_) => Self {
                code: INVALID_ADDRESS,
                message: "invalid address".to_string(),
            },
        }
    }
}

#[async_trait]
pub trait JsonRpcHandler: Send + Sync {
    async fn handle(&self, request: &JsonRpcRequest) -> JsonRpcResponse;
}

/// Fallback for unregistered methods.
pub struct DefaultHandler;

#[async_trait]
impl JsonRpcHandler for DefaultHandler {
    async fn handle(&self, request: &JsonRpcRequest) -> JsonRpcResponse {
        JsonRpcResponse::error(request.id.clone(), JsonRpcError::method_not_supported())
    }
}

/// Handles `eth_generateAccount`: allocates a new key entry and returns its
/// checksummed address.
pub struct GenerateAccountHandler {
    generator: Arc<dyn KeyGenerator>,
}

impl GenerateAccountHandler {
    pub fn new(generator: Arc<dyn KeyGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl JsonRpcHandler for GenerateAccountHandler {
    async fn handle(&self, request: &JsonRpcRequest) -> JsonRpcResponse {
        match self.generator.generate().await {
            Ok(address) => JsonRpcResponse::result(
                request.id.clone(),
                json!({ "address": address.to_checksum_string() }),
            ),
            Err(e) => {
                tracing::error!("Account generation failed: {}", e);
                JsonRpcResponse::error(request.id.clone(), JsonRpcError::from(&e))
            }
        }
    }
}

/// Method name to handler mapping.
pub struct RequestMapper {
    handlers: HashMap<String, Arc<dyn JsonRpcHandler>>,
    default_handler: Arc<dyn JsonRpcHandler>,
}

impl RequestMapper {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            default_handler: Arc::new(DefaultHandler),
        }
    }

    pub fn add_handler(&mut self, method: &str, handler: Arc<dyn JsonRpcHandler>) {
        self.handlers.insert(method.to_string(), handler);
    }

    pub async fn dispatch(&self, request: &JsonRpcRequest) -> JsonRpcResponse {
        let handler = self
            .handlers
            .get(&request.method)
            .unwrap_or(&self.default_handler);
        handler.handle(request).await
    }
}

impl Default for RequestMapper {
    fn default() -> Self {
        Self::new()
    }
}
