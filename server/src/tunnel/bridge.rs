//! HTTP-over-tunnel bridge.
//!
//! `ANY /api/proxy/{backendId}/{*subpath}` with
//! `Authorization: Bearer <gateway_secret>:<api_key>` becomes an
//! `http_proxy_request` on the backend's relay connection. The caller is
//! suspended until the matching `http_proxy_response` arrives or the bridge
//! timeout fires; both paths resolve the pending entry inside the hub, so it
//! is settled exactly once.
//!
//! | Status | Meaning                              |
//! |--------|--------------------------------------|
//! | 2xx-5xx | backend's own answer                |
//! | 401    | missing/malformed/invalid credential |
//! | 413    | request body over the limit          |
//! | 429    | per-IP rate limit exceeded           |
//! | 502    | backend not connected, or bad answer |
//! | 503    | gateway unavailable or backend busy  |
//! | 504    | backend did not answer in time       |

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Path as AxumPath, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::protocol::{string_body_bytes, text_or_base64, ProxyRequest, ProxyResponse};
use crate::state::GatewayState;

/// Route prefix of the bridge; the backend id is the next segment.
const PROXY_PREFIX: &str = "/api/proxy/";

/// Response headers that describe the tunnel hop, not the backend's answer.
const HOP_BY_HOP: &[&str] = &["transfer-encoding", "connection", "content-length", "keep-alive"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("backend '{0}' is not connected")]
    BackendOffline(String),
    #[error("backend '{0}' is not keeping up, try again later")]
    BackendBusy(String),
    #[error("backend did not respond in time")]
    Timeout,
    #[error("backend sent an invalid response")]
    InvalidResponse,
    #[error("request body too large")]
    BodyTooLarge,
    #[error("gateway unavailable")]
    Unavailable,
}

impl BridgeError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::BackendOffline(_) => StatusCode::BAD_GATEWAY,
            Self::BackendBusy(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::InvalidResponse => StatusCode::BAD_GATEWAY,
            Self::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::RateLimited => "RATE_LIMITED",
            Self::BackendOffline(_) => "BACKEND_OFFLINE",
            Self::BackendBusy(_) => "BACKEND_BUSY",
            Self::Timeout => "TIMEOUT",
            Self::InvalidResponse => "INVALID_RESPONSE",
            Self::BodyTooLarge => "BODY_TOO_LARGE",
            Self::Unavailable => "UNAVAILABLE",
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(json!({"error": self.to_string(), "code": self.code()})),
        )
            .into_response()
    }
}

/// Everything the hub needs to run one bridge call.
#[derive(Debug, Clone)]
pub struct BridgeCall {
    pub peer_ip: IpAddr,
    pub backend_id: String,
    pub authorization: Option<String>,
    pub method: Method,
    /// Sub-path with leading `/`, including the query string.
    pub path: String,
    pub content_type: Option<String>,
    pub body: Bytes,
}

pub type BridgeReply = oneshot::Sender<Result<ProxyResponse, BridgeError>>;

/// A bridge call suspended on its correlation id.
pub struct PendingBridgeRequest {
    pub backend_id: String,
    resolver: BridgeReply,
    timeout: AbortHandle,
}

/// Outstanding bridge calls keyed by `request_id`.
#[derive(Default)]
pub struct PendingRequests {
    entries: HashMap<String, PendingBridgeRequest>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        request_id: String,
        backend_id: String,
        resolver: BridgeReply,
        timeout: AbortHandle,
    ) {
        self.entries.insert(
            request_id,
            PendingBridgeRequest {
                backend_id,
                resolver,
                timeout,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.contains_key(request_id)
    }

    /// Settle a pending call with the backend's response. Responses from a
    /// backend other than the one the call was sent to are ignored.
    pub fn resolve(&mut self, from_backend: &str, response: ProxyResponse) -> bool {
        let request_id = response.request_id.clone();
        match self.entries.get(&request_id) {
            None => {
                warn!(
                    request_id = %request_id,
                    "Response arrived for timed-out or unknown request (dropped)"
                );
                return false;
            }
            Some(p) if p.backend_id != from_backend => {
                warn!(
                    request_id = %request_id,
                    backend_id = %from_backend,
                    "Bridge response from the wrong backend (dropped)"
                );
                return false;
            }
            Some(_) => {}
        }
        let Some(pending) = self.entries.remove(&request_id) else {
            return false;
        };
        pending.timeout.abort();
        let _ = pending.resolver.send(Ok(response));
        true
    }

    /// Settle a pending call with [`BridgeError::Timeout`].
    pub fn expire(&mut self, request_id: &str) -> bool {
        match self.entries.remove(request_id) {
            Some(pending) => {
                debug!(request_id, backend_id = %pending.backend_id, "Bridge request timed out");
                let _ = pending.resolver.send(Err(BridgeError::Timeout));
                true
            }
            None => false,
        }
    }

    /// Settle a call that never reached the backend.
    pub fn fail(&mut self, request_id: &str, err: BridgeError) -> bool {
        match self.entries.remove(request_id) {
            Some(pending) => {
                pending.timeout.abort();
                let _ = pending.resolver.send(Err(err));
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding call (gateway shutdown).
    pub fn fail_all(&mut self) {
        for (_, pending) in self.entries.drain() {
            pending.timeout.abort();
            let _ = pending
                .resolver
                .send(Err(BridgeError::BackendOffline(pending.backend_id.clone())));
        }
    }
}

fn is_read_only(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Build the envelope sent to the backend. The backend receives its own api
/// key as a plain bearer token; the gateway secret never leaves the gateway.
pub fn build_proxy_request(request_id: &str, call: &BridgeCall, api_key: &str) -> ProxyRequest {
    let mut headers = BTreeMap::new();
    headers.insert(
        "content-type".to_string(),
        call.content_type
            .clone()
            .unwrap_or_else(|| "application/json".to_string()),
    );
    headers.insert("authorization".to_string(), format!("Bearer {api_key}"));

    let (body, body_encoding) = if is_read_only(&call.method) || call.body.is_empty() {
        (None, None)
    } else if let Ok(json) = serde_json::from_slice::<Value>(&call.body) {
        (Some(json), None)
    } else {
        let (body, encoding) = text_or_base64(&call.body);
        (Some(body), encoding)
    };

    ProxyRequest {
        request_id: request_id.to_string(),
        method: call.method.as_str().to_string(),
        path: call.path.clone(),
        headers,
        body,
        body_encoding,
    }
}

/// Turn the backend's answer into the HTTP response returned to the caller.
pub fn proxy_response_to_http(response: ProxyResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut headers = HeaderMap::new();
    for (name, value) in &response.headers {
        if HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            continue;
        };
        headers.append(name, value);
    }

    let body = match response.body {
        None | Some(Value::Null) => Body::empty(),
        Some(Value::String(s)) => match string_body_bytes(&s, response.body_encoding) {
            Some(bytes) => Body::from(bytes),
            None => {
                warn!(request_id = %response.request_id, "Backend sent an undecodable body");
                return BridgeError::InvalidResponse.into_response();
            }
        },
        Some(v) => {
            if !headers.contains_key(header::CONTENT_TYPE) {
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
            }
            Body::from(serde_json::to_vec(&v).unwrap_or_default())
        }
    };

    let mut out = Response::new(body);
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    out
}

/// `ANY /api/proxy/{backend_id}`: bridge call to the backend's root path.
pub async fn proxy_root(
    State(state): State<GatewayState>,
    AxumPath(backend_id): AxumPath<String>,
    request: Request,
) -> Response {
    bridge(state, backend_id, request).await
}

/// `ANY /api/proxy/{backend_id}/{*subpath}`: bridge call to a sub-path.
///
/// The decoded `subpath` capture is not used: the backend gets the raw
/// request target (see [`forwarded_path`]).
pub async fn proxy_path(
    State(state): State<GatewayState>,
    AxumPath((backend_id, _subpath)): AxumPath<(String, String)>,
    request: Request,
) -> Response {
    bridge(state, backend_id, request).await
}

/// What follows `/api/proxy/{backend_id}` in the request target, still
/// percent-encoded, with the raw query appended. `%2F` and `%3F` stay
/// opaque so they cannot add segments or query parameters at the backend.
fn forwarded_path(uri: &Uri) -> String {
    let rest = uri.path().strip_prefix(PROXY_PREFIX).unwrap_or_default();
    let sub = rest.find('/').map_or("", |slash| &rest[slash + 1..]);
    let mut path = format!("/{}", sub.trim_start_matches('/'));
    if let Some(query) = uri.query() {
        path.push('?');
        path.push_str(query);
    }
    path
}

async fn bridge(state: GatewayState, backend_id: String, request: Request) -> Response {
    let peer_ip = client_ip(&request, state.config.server.trust_forwarded_for);
    let path = forwarded_path(request.uri());
    let method = request.method().clone();
    let headers = request.headers();
    let authorization = header_string(headers, header::AUTHORIZATION);
    let content_type = header_string(headers, header::CONTENT_TYPE);

    let body = match axum::body::to_bytes(request.into_body(), state.config.server.max_body_bytes).await
    {
        Ok(b) => b,
        Err(_) => return BridgeError::BodyTooLarge.into_response(),
    };

    let call = BridgeCall {
        peer_ip,
        backend_id,
        authorization,
        method,
        path,
        content_type,
        body,
    };

    match state.hub.bridge(call).await {
        Ok(response) => proxy_response_to_http(response),
        Err(e) => e.into_response(),
    }
}

fn header_string(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}

/// Rate-limit key for a request: the socket peer, or the first
/// `X-Forwarded-For` hop when the gateway sits behind a trusted proxy.
fn client_ip(request: &Request, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for {
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|ip| ip.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |ci| ci.0.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::protocol::BodyEncoding;

    fn call(method: Method, body: &'static [u8]) -> BridgeCall {
        BridgeCall {
            peer_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            backend_id: "b1".into(),
            authorization: Some("Bearer secret:k".into()),
            method,
            path: "/api/widgets?page=2".into(),
            content_type: None,
            body: Bytes::from_static(body),
        }
    }

    #[test]
    fn envelope_forwards_api_key_not_secret() {
        let req = build_proxy_request("r1", &call(Method::POST, br#"{"name":"w"}"#), "k");
        assert_eq!(req.headers["authorization"], "Bearer k");
        assert_eq!(req.headers["content-type"], "application/json");
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/api/widgets?page=2");
        assert_eq!(req.body, Some(json!({"name": "w"})));
        assert!(!req.headers.values().any(|v| v.contains("secret")));
    }

    #[test]
    fn read_only_methods_carry_no_body() {
        let req = build_proxy_request("r1", &call(Method::GET, b"ignored"), "k");
        assert!(req.body.is_none());
    }

    #[test]
    fn non_json_body_is_forwarded_as_text() {
        let req = build_proxy_request("r1", &call(Method::PUT, b"plain text"), "k");
        assert_eq!(req.body, Some(Value::String("plain text".into())));
    }

    #[test]
    fn forwarded_path_keeps_percent_encoding() {
        let uri: Uri = "/api/proxy/b1/files/a%2Fb%3Fadmin=1?page=2".parse().unwrap();
        assert_eq!(forwarded_path(&uri), "/files/a%2Fb%3Fadmin=1?page=2");

        let uri: Uri = "/api/proxy/b1/..%2F..%2Fetc/passwd".parse().unwrap();
        assert_eq!(forwarded_path(&uri), "/..%2F..%2Fetc/passwd");

        let uri: Uri = "/api/proxy/b1?x=1".parse().unwrap();
        assert_eq!(forwarded_path(&uri), "/?x=1");

        let uri: Uri = "/api/proxy/b1".parse().unwrap();
        assert_eq!(forwarded_path(&uri), "/");
    }

    #[tokio::test]
    async fn binary_bodies_cross_the_bridge_intact() {
        static RAW: &[u8] = &[0x1f, 0x8b, 0x08, 0x00, 0xff, 0xfe];
        let req = build_proxy_request("r1", &call(Method::POST, RAW), "k");
        let Some(Value::String(encoded)) = &req.body else {
            panic!("expected an encoded body");
        };
        assert_eq!(req.body_encoding, Some(BodyEncoding::Base64));
        assert_eq!(string_body_bytes(encoded, req.body_encoding).unwrap(), RAW);

        let resp = proxy_response_to_http(ProxyResponse {
            request_id: "r1".into(),
            status: 200,
            headers: BTreeMap::new(),
            body: req.body.clone(),
            body_encoding: req.body_encoding,
        });
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], RAW);

        let resp = proxy_response_to_http(ProxyResponse {
            request_id: "r1".into(),
            status: 200,
            headers: BTreeMap::new(),
            body: Some(json!("%%%")),
            body_encoding: Some(BodyEncoding::Base64),
        });
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn response_strips_hop_by_hop_headers() {
        let mut headers = BTreeMap::new();
        headers.insert("Transfer-Encoding".into(), "chunked".into());
        headers.insert("connection".into(), "keep-alive".into());
        headers.insert("x-widget-count".into(), "3".into());
        let resp = proxy_response_to_http(ProxyResponse {
            request_id: "r1".into(),
            status: 201,
            headers,
            body: Some(json!({"ok": true})),
            body_encoding: None,
        });
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert!(resp.headers().get("transfer-encoding").is_none());
        assert!(resp.headers().get("connection").is_none());
        assert_eq!(resp.headers()["x-widget-count"], "3");
        assert_eq!(resp.headers()["content-type"], "application/json");
    }

    #[test]
    fn invalid_status_maps_to_bad_gateway() {
        let resp = proxy_response_to_http(ProxyResponse {
            request_id: "r1".into(),
            status: 1000,
            headers: BTreeMap::new(),
            body: None,
            body_encoding: None,
        });
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn error_statuses() {
        assert_eq!(BridgeError::Unauthorized("x".into()).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(BridgeError::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(BridgeError::BackendOffline("b1".into()).status(), StatusCode::BAD_GATEWAY);
        assert_eq!(BridgeError::BackendBusy("b1".into()).status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(BridgeError::Timeout.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn pending_entry_settles_once() {
        let mut pending = PendingRequests::new();
        let (tx, rx) = oneshot::channel();
        let timer = tokio::spawn(std::future::pending::<()>());
        pending.insert("r1".into(), "b1".into(), tx, timer.abort_handle());

        let response = ProxyResponse {
            request_id: "r1".into(),
            status: 200,
            headers: BTreeMap::new(),
            body: None,
            body_encoding: None,
        };
        assert!(!pending.resolve("b2", response.clone()));
        assert!(pending.contains("r1"));
        assert!(pending.resolve("b1", response.clone()));
        assert!(!pending.expire("r1"));
        assert!(!pending.resolve("b1", response));
        assert!(pending.is_empty());
        assert_eq!(rx.await.unwrap().unwrap().status, 200);
        assert!(timer.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn expired_entry_reports_timeout() {
        let mut pending = PendingRequests::new();
        let (tx, rx) = oneshot::channel();
        let timer = tokio::spawn(async {});
        pending.insert("r1".into(), "b1".into(), tx, timer.abort_handle());
        assert!(pending.expire("r1"));
        assert!(pending.is_empty());
        assert_eq!(rx.await.unwrap().unwrap_err(), BridgeError::Timeout);
    }
}
