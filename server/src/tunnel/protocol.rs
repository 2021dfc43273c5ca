//! Relay wire protocol: JSON text frames with a `type` discriminator.
//!
//! | Direction          | Types                                                          |
//! |--------------------|----------------------------------------------------------------|
//! | backend → gateway  | `register`, `client_auth_result`, `backend_response`, `http_proxy_response` |
//! | gateway → backend  | `register_result`, `client_connected`, `client_auth`, `forwarded`, `client_disconnected`, `http_proxy_request` |
//! | client → gateway   | `gateway_auth`, `list_backends`, `connect_backend`, `send_to_backend` |
//! | gateway → client   | `gateway_auth_result`, `backends_list`, `client_auth_result`, `backend_message`, `backend_disconnected` |
//! | gateway → anyone   | `gateway_error`                                                |
//!
//! Field names are camelCase on the wire (`deviceId`, `backendId`, ...).

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every frame exchanged over the relay channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RelayMessage {
    Register {
        secret: String,
        device_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    RegisterResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backend_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    GatewayAuth {
        secret: String,
    },
    GatewayAuthResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ListBackends,
    BackendsList {
        backends: Vec<BackendInfo>,
    },
    ConnectBackend {
        backend_id: String,
        api_key: String,
    },
    ClientConnected {
        client_id: String,
    },
    ClientAuth {
        client_id: String,
        api_key: String,
    },
    /// Sent by the backend with `client_id`; relayed to the client with
    /// `backend_id` instead.
    ClientAuthResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backend_id: Option<String>,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    SendToBackend {
        backend_id: String,
        message: Value,
    },
    Forwarded {
        client_id: String,
        message: Value,
    },
    BackendResponse {
        client_id: String,
        message: Value,
    },
    BackendMessage {
        backend_id: String,
        message: Value,
    },
    ClientDisconnected {
        client_id: String,
    },
    BackendDisconnected {
        backend_id: String,
    },
    GatewayError {
        code: ErrorCode,
        message: String,
    },
    HttpProxyRequest(ProxyRequest),
    HttpProxyResponse(ProxyResponse),
}

/// One entry of `backends_list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendInfo {
    pub backend_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub online: bool,
}

/// Bridged HTTP call, gateway → backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRequest {
    pub request_id: String,
    pub method: String,
    /// Sub-path below `/api/proxy/{backendId}`, with leading `/` and query.
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_encoding: Option<BodyEncoding>,
}

/// Backend's answer to a [`ProxyRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyResponse {
    pub request_id: String,
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_encoding: Option<BodyEncoding>,
}

/// How a string `body` is to be read. Absent means plain UTF-8 text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    Base64,
}

/// Raw bytes as a string `body`: UTF-8 text as is, anything else base64.
pub fn text_or_base64(bytes: &[u8]) -> (Value, Option<BodyEncoding>) {
    match std::str::from_utf8(bytes) {
        Ok(text) => (Value::String(text.to_string()), None),
        Err(_) => (
            Value::String(STANDARD.encode(bytes)),
            Some(BodyEncoding::Base64),
        ),
    }
}

/// Bytes of a string `body`. `None` when it is flagged base64 but does not
/// decode.
pub fn string_body_bytes(body: &str, encoding: Option<BodyEncoding>) -> Option<Vec<u8>> {
    match encoding {
        Some(BodyEncoding::Base64) => STANDARD.decode(body).ok(),
        None => Some(body.as_bytes().to_vec()),
    }
}

/// `gateway_error` codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MalformedMessage,
    InvalidFirstMessage,
    AuthFailed,
    NotAuthenticated,
    BackendNotFound,
    UnexpectedMessage,
    ConnectionLimit,
    Internal,
}

impl RelayMessage {
    /// The wire `type` of this message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::RegisterResult { .. } => "register_result",
            Self::GatewayAuth { .. } => "gateway_auth",
            Self::GatewayAuthResult { .. } => "gateway_auth_result",
            Self::ListBackends => "list_backends",
            Self::BackendsList { .. } => "backends_list",
            Self::ConnectBackend { .. } => "connect_backend",
            Self::ClientConnected { .. } => "client_connected",
            Self::ClientAuth { .. } => "client_auth",
            Self::ClientAuthResult { .. } => "client_auth_result",
            Self::SendToBackend { .. } => "send_to_backend",
            Self::Forwarded { .. } => "forwarded",
            Self::BackendResponse { .. } => "backend_response",
            Self::BackendMessage { .. } => "backend_message",
            Self::ClientDisconnected { .. } => "client_disconnected",
            Self::BackendDisconnected { .. } => "backend_disconnected",
            Self::GatewayError { .. } => "gateway_error",
            Self::HttpProxyRequest(_) => "http_proxy_request",
            Self::HttpProxyResponse(_) => "http_proxy_response",
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::GatewayError {
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"gateway_error","code":"INTERNAL","message":"encode failed"}"#.to_string()
        })
    }
}
