//! Backend tunnel client: outbound relay connection from a backend to the
//! gateway.
//!
//! Dials the gateway (optionally through SOCKS5), registers with the device
//! id, then answers `client_auth`, `forwarded` and `http_proxy_request`
//! frames through the injected capabilities. Reconnects on a fixed interval,
//! for a bounded number of consecutive failed attempts.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{http::Uri, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::protocol::{string_body_bytes, text_or_base64, ProxyRequest, ProxyResponse, RelayMessage};
use super::socks::{self, ProxyConfig, SocksError};
use crate::auth::{constant_time_eq, parse_bearer};
use crate::config::BackendConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long to wait for `register_result` after connecting.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Local HTTP calls must finish before the gateway's bridge timeout.
const LOCAL_FORWARD_TIMEOUT: Duration = Duration::from_secs(25);

const OUTBOUND_QUEUE: usize = 256;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid gateway URL: {0}")]
    InvalidUrl(String),
    #[error(transparent)]
    Socks(#[from] SocksError),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("registration rejected: {0}")]
    Rejected(String),
    #[error("gateway closed the connection before registration completed")]
    ClosedBeforeRegister,
    #[error("no register_result within {}s", REGISTER_TIMEOUT.as_secs())]
    RegisterTimeout,
    #[error("tunnel client needs a {0}")]
    MissingCapability(&'static str),
}

impl From<tokio_tungstenite::tungstenite::Error> for TunnelError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(e))
    }
}

/// Observable connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelStatus {
    Disconnected,
    Connecting,
    Registering,
    Connected { backend_id: String },
    /// Waiting to retry; `attempt` counts consecutive failures so far.
    Reconnecting { attempt: u32 },
    /// Reconnect attempts exhausted. Terminal.
    GaveUp,
    /// The gateway refused the registration. Terminal.
    Rejected { reason: String },
}

impl TunnelStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::GaveUp | Self::Rejected { .. })
    }
}

// ─── Capabilities ────────────────────────────────────────────────────────────

/// Decides whether a client's api key grants access to this backend.
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    async fn validate(&self, client_id: &str, api_key: &str) -> Result<(), String>;
}

/// Handles application messages from authorized clients.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, client_id: String, message: Value) -> Result<Value, String>;
}

/// Answers bridged HTTP calls. Only invoked after the bearer api key passed
/// the [`CredentialValidator`].
#[async_trait]
pub trait ProxyHandler: Send + Sync {
    async fn handle(&self, request: ProxyRequest) -> ProxyResponse;
}

/// Optional hooks for client lifecycle events.
#[async_trait]
pub trait ClientObserver: Send + Sync {
    async fn client_connected(&self, _client_id: &str) {}
    async fn client_authorized(&self, _client_id: &str) {}
    async fn client_disconnected(&self, _client_id: &str) {}
}

/// Accepts exactly one configured api key.
pub struct ApiKeyValidator {
    key: String,
}

impl ApiKeyValidator {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[async_trait]
impl CredentialValidator for ApiKeyValidator {
    async fn validate(&self, _client_id: &str, api_key: &str) -> Result<(), String> {
        if !self.key.is_empty() && constant_time_eq(self.key.as_bytes(), api_key.as_bytes()) {
            Ok(())
        } else {
            Err("Invalid API key".into())
        }
    }
}

/// Hop-by-hop and tunnel-credential headers, never passed to the local service.
const SKIP_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "authorization",
    "content-length",
];

const SKIP_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Forwards bridged calls to a local HTTP service.
pub struct LocalHttpForwarder {
    base_url: String,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl LocalHttpForwarder {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    async fn forward(&self, request: &ProxyRequest) -> Result<ProxyResponse, String> {
        let uri = format!("{}{}", self.base_url, request.path);
        let mut builder = hyper::Request::builder()
            .method(request.method.as_str())
            .uri(&uri);
        for (name, value) in &request.headers {
            if SKIP_REQUEST_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            builder = builder.header(name, value);
        }
        let body = match &request.body {
            None | Some(Value::Null) => Bytes::new(),
            Some(Value::String(s)) => string_body_bytes(s, request.body_encoding)
                .map(Bytes::from)
                .ok_or_else(|| "request body is not valid base64".to_string())?,
            Some(v) => Bytes::from(serde_json::to_vec(v).map_err(|e| e.to_string())?),
        };
        let req = builder.body(Full::new(body)).map_err(|e| e.to_string())?;

        debug!(method = %request.method, uri = %uri, "Forwarding bridged request");
        let resp = tokio::time::timeout(LOCAL_FORWARD_TIMEOUT, self.client.request(req))
            .await
            .map_err(|_| "local service timed out".to_string())?
            .map_err(|e| format!("local service unavailable: {e}"))?;

        let (parts, body) = resp.into_parts();
        let bytes = body
            .collect()
            .await
            .map_err(|e| format!("failed to read local response: {e}"))?
            .to_bytes();

        let headers: BTreeMap<String, String> = parts
            .headers
            .iter()
            .filter(|(name, _)| !SKIP_RESPONSE_HEADERS.contains(&name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let (body, body_encoding) = if bytes.is_empty() {
            (None, None)
        } else {
            let (body, encoding) = text_or_base64(&bytes);
            (Some(body), encoding)
        };
        Ok(ProxyResponse {
            request_id: request.request_id.clone(),
            status: parts.status.as_u16(),
            headers,
            body,
            body_encoding,
        })
    }
}

#[async_trait]
impl ProxyHandler for LocalHttpForwarder {
    async fn handle(&self, request: ProxyRequest) -> ProxyResponse {
        match self.forward(&request).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(request_id = %request.request_id, error = %e, "Local forward failed");
                error_response(&request.request_id, 502, &e)
            }
        }
    }
}

fn error_response(request_id: &str, status: u16, message: &str) -> ProxyResponse {
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    ProxyResponse {
        request_id: request_id.to_string(),
        status,
        headers,
        body: Some(json!({"error": message})),
        body_encoding: None,
    }
}

// ─── Client ──────────────────────────────────────────────────────────────────

struct Capabilities {
    validator: Arc<dyn CredentialValidator>,
    handler: Arc<dyn MessageHandler>,
    proxy: Option<Arc<dyn ProxyHandler>>,
    observer: Option<Arc<dyn ClientObserver>>,
}

pub struct TunnelClientBuilder {
    config: BackendConfig,
    device_id: String,
    validator: Option<Arc<dyn CredentialValidator>>,
    handler: Option<Arc<dyn MessageHandler>>,
    proxy: Option<Arc<dyn ProxyHandler>>,
    observer: Option<Arc<dyn ClientObserver>>,
}

impl TunnelClientBuilder {
    #[must_use]
    pub fn validator(mut self, v: impl CredentialValidator + 'static) -> Self {
        self.validator = Some(Arc::new(v));
        self
    }

    #[must_use]
    pub fn handler(mut self, h: impl MessageHandler + 'static) -> Self {
        self.handler = Some(Arc::new(h));
        self
    }

    #[must_use]
    pub fn proxy_handler(mut self, p: impl ProxyHandler + 'static) -> Self {
        self.proxy = Some(Arc::new(p));
        self
    }

    #[must_use]
    pub fn observer(mut self, o: impl ClientObserver + 'static) -> Self {
        self.observer = Some(Arc::new(o));
        self
    }

    pub fn build(self) -> Result<TunnelClient, TunnelError> {
        let validator = self
            .validator
            .ok_or(TunnelError::MissingCapability("credential validator"))?;
        let handler = self
            .handler
            .ok_or(TunnelError::MissingCapability("message handler"))?;
        let proxy = self
            .config
            .socks5_proxy
            .as_deref()
            .map(ProxyConfig::parse)
            .transpose()?;
        parse_gateway_url(&self.config.gateway_url)?;
        Ok(TunnelClient {
            config: self.config,
            device_id: self.device_id,
            socks: proxy,
            caps: Arc::new(Capabilities {
                validator,
                handler,
                proxy: self.proxy,
                observer: self.observer,
            }),
        })
    }
}

pub struct TunnelClient {
    config: BackendConfig,
    device_id: String,
    socks: Option<ProxyConfig>,
    caps: Arc<Capabilities>,
}

/// Control handle for a running [`TunnelClient`].
pub struct TunnelHandle {
    status: watch::Receiver<TunnelStatus>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TunnelHandle {
    pub fn status(&self) -> TunnelStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TunnelStatus> {
        self.status.clone()
    }

    /// Wait until the client stops on its own (gave up or rejected).
    pub async fn wait(mut self) -> TunnelStatus {
        let _ = (&mut self.task).await;
        self.status()
    }

    /// Disconnect and stop reconnecting.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

impl TunnelClient {
    pub fn builder(config: BackendConfig, device_id: impl Into<String>) -> TunnelClientBuilder {
        TunnelClientBuilder {
            config,
            device_id: device_id.into(),
            validator: None,
            handler: None,
            proxy: None,
            observer: None,
        }
    }

    pub fn spawn(self) -> TunnelHandle {
        let (status_tx, status_rx) = watch::channel(TunnelStatus::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(status_tx, shutdown_rx));
        TunnelHandle {
            status: status_rx,
            shutdown: shutdown_tx,
            task,
        }
    }

    /// Main loop: connect, serve until disconnect, wait, reconnect.
    async fn run(self, status: watch::Sender<TunnelStatus>, mut shutdown: watch::Receiver<bool>) {
        let delay = Duration::from_secs(self.config.reconnect_delay_secs);
        let max_attempts = self.config.max_reconnect_attempts;
        let mut attempt: u32 = 0;

        loop {
            status.send_replace(TunnelStatus::Connecting);
            info!(url = %self.config.gateway_url, "Tunnel: connecting to gateway");

            let outcome = tokio::select! {
                r = self.connect_and_run(&status) => r,
                _ = shutdown.changed() => {
                    info!("Tunnel: shutting down");
                    status.send_replace(TunnelStatus::Disconnected);
                    return;
                }
            };

            match outcome {
                Ok(()) => {
                    info!("Tunnel: disconnected from gateway");
                    attempt = 1;
                }
                Err(TunnelError::Rejected(reason)) => {
                    warn!(reason = %reason, "Tunnel: registration rejected, not retrying");
                    status.send_replace(TunnelStatus::Rejected { reason });
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    warn!(error = %e, attempt, "Tunnel: connection attempt failed");
                }
            }

            if attempt > max_attempts {
                warn!(attempts = max_attempts, "Tunnel: giving up on reconnecting");
                status.send_replace(TunnelStatus::GaveUp);
                return;
            }

            status.send_replace(TunnelStatus::Reconnecting { attempt });
            info!(secs = delay.as_secs(), attempt, "Tunnel: reconnecting after delay");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    status.send_replace(TunnelStatus::Disconnected);
                    return;
                }
            }
        }
    }

    async fn dial(&self) -> Result<WsStream, TunnelError> {
        let url = self.config.gateway_url.as_str();
        let ws = match &self.socks {
            Some(proxy) => {
                let (host, port) = parse_gateway_url(url)?;
                debug!(proxy = ?proxy, "Tunnel: dialing through SOCKS5");
                let stream = socks::connect(proxy, &host, port).await?;
                tokio_tungstenite::client_async_tls(url, stream).await?.0
            }
            None => tokio_tungstenite::connect_async(url).await?.0,
        };
        Ok(ws)
    }

    /// One connection. `Err` if registration never completed; `Ok` once a
    /// registered session ends.
    async fn connect_and_run(&self, status: &watch::Sender<TunnelStatus>) -> Result<(), TunnelError> {
        let ws = self.dial().await?;
        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);

        let mut writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        status.send_replace(TunnelStatus::Registering);
        let session = Session::new(self.caps.clone(), out_tx);
        session
            .send(RelayMessage::Register {
                secret: self.config.secret.clone(),
                device_id: self.device_id.clone(),
                display_name: self.config.display_name.clone(),
            })
            .await;

        let backend_id = match tokio::time::timeout(REGISTER_TIMEOUT, await_registration(&mut stream)).await
        {
            Ok(Ok(id)) => id,
            Ok(Err(e)) => {
                drop(session);
                let _ = writer.await;
                return Err(e);
            }
            Err(_) => {
                writer.abort();
                return Err(TunnelError::RegisterTimeout);
            }
        };
        info!(backend_id = %backend_id, "Tunnel: registered with gateway");
        status.send_replace(TunnelStatus::Connected { backend_id });

        loop {
            let msg = tokio::select! {
                msg = stream.next() => msg,
                _ = &mut writer => {
                    warn!("Tunnel: writer stopped");
                    break;
                }
            };
            match msg {
                None => break,
                Some(Err(e)) => {
                    warn!(error = %e, "Tunnel: read error");
                    break;
                }
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<RelayMessage>(&text) {
                    Ok(msg) => session.dispatch(msg).await,
                    Err(e) => warn!(error = %e, "Tunnel: undecodable frame from gateway"),
                },
                Some(Ok(Message::Close(frame))) => {
                    info!(reason = ?frame.map(|f| f.reason.to_string()), "Tunnel: gateway closed connection");
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
        writer.abort();
        Ok(())
    }
}

/// Read frames until `register_result` arrives.
async fn await_registration(
    stream: &mut futures_util::stream::SplitStream<WsStream>,
) -> Result<String, TunnelError> {
    while let Some(msg) = stream.next().await {
        let Message::Text(text) = msg? else {
            continue;
        };
        match serde_json::from_str::<RelayMessage>(&text) {
            Ok(RelayMessage::RegisterResult {
                success: true,
                backend_id: Some(id),
                ..
            }) => return Ok(id),
            Ok(RelayMessage::RegisterResult { error, .. }) => {
                return Err(TunnelError::Rejected(
                    error.unwrap_or_else(|| "registration failed".into()),
                ))
            }
            Ok(RelayMessage::GatewayError { code, message }) => {
                warn!(?code, message = %message, "Tunnel: gateway error during registration");
            }
            Ok(other) => debug!(kind = other.kind(), "Tunnel: ignoring frame before registration"),
            Err(e) => warn!(error = %e, "Tunnel: undecodable frame from gateway"),
        }
    }
    Err(TunnelError::ClosedBeforeRegister)
}

/// Host and port of a `ws://` or `wss://` URL.
fn parse_gateway_url(url: &str) -> Result<(String, u16), TunnelError> {
    let uri: Uri = url
        .parse()
        .map_err(|e| TunnelError::InvalidUrl(format!("{url}: {e}")))?;
    let default_port = match uri.scheme_str() {
        Some("ws") => 80,
        Some("wss") => 443,
        _ => return Err(TunnelError::InvalidUrl(format!("{url}: expected ws:// or wss://"))),
    };
    let host = uri
        .host()
        .ok_or_else(|| TunnelError::InvalidUrl(format!("{url}: missing host")))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    Ok((host, uri.port_u16().unwrap_or(default_port)))
}

/// Clients granted access on this connection. Each `client_auth` takes a
/// generation when it arrives; a disconnect or a newer `client_auth` for the
/// same client invalidates it, so a late validation cannot grant access.
#[derive(Default)]
struct Authorizations {
    granted: HashSet<String>,
    in_flight: HashMap<String, u64>,
    next_generation: u64,
}

impl Authorizations {
    fn begin(&mut self, client_id: &str) -> u64 {
        self.next_generation += 1;
        self.in_flight
            .insert(client_id.to_string(), self.next_generation);
        self.next_generation
    }

    /// Settle an auth attempt. `false` when it was superseded.
    fn finish(&mut self, client_id: &str, generation: u64, granted: bool) -> bool {
        if self.in_flight.get(client_id) != Some(&generation) {
            return false;
        }
        self.in_flight.remove(client_id);
        if granted {
            self.granted.insert(client_id.to_string());
        }
        true
    }

    fn revoke(&mut self, client_id: &str) {
        self.granted.remove(client_id);
        self.in_flight.remove(client_id);
    }

    fn contains(&self, client_id: &str) -> bool {
        self.granted.contains(client_id)
    }
}

/// Per-connection state. A reconnect builds a fresh one, so the authorized
/// set never outlives the connection it was granted on.
struct Session {
    caps: Arc<Capabilities>,
    out: mpsc::Sender<Message>,
    authorized: Arc<RwLock<Authorizations>>,
}

impl Session {
    fn new(caps: Arc<Capabilities>, out: mpsc::Sender<Message>) -> Self {
        Self {
            caps,
            out,
            authorized: Arc::new(RwLock::new(Authorizations::default())),
        }
    }

    async fn send(&self, msg: RelayMessage) {
        send_relay(&self.out, msg).await;
    }

    /// Handle one frame from the gateway. Handler calls run on their own
    /// tasks so a slow client does not hold up the others.
    async fn dispatch(&self, msg: RelayMessage) {
        match msg {
            RelayMessage::ClientConnected { client_id } => {
                debug!(client_id = %client_id, "Tunnel: client wants in");
                if let Some(observer) = &self.caps.observer {
                    observer.client_connected(&client_id).await;
                }
            }
            RelayMessage::ClientAuth { client_id, api_key } => {
                let generation = self.authorized.write().await.begin(&client_id);
                let caps = self.caps.clone();
                let authorized = self.authorized.clone();
                let out = self.out.clone();
                tokio::spawn(async move {
                    let mut result = caps.validator.validate(&client_id, &api_key).await;
                    let current = authorized
                        .write()
                        .await
                        .finish(&client_id, generation, result.is_ok());
                    if !current {
                        debug!(client_id = %client_id, "Tunnel: client auth superseded");
                        result = Err("Authentication superseded".into());
                    }
                    let success = result.is_ok();
                    if success {
                        if let Some(observer) = &caps.observer {
                            observer.client_authorized(&client_id).await;
                        }
                    }
                    info!(client_id = %client_id, success, "Tunnel: client auth");
                    send_relay(
                        &out,
                        RelayMessage::ClientAuthResult {
                            client_id: Some(client_id),
                            backend_id: None,
                            success,
                            error: result.err(),
                        },
                    )
                    .await;
                });
            }
            RelayMessage::Forwarded { client_id, message } => {
                if !self.authorized.read().await.contains(&client_id) {
                    debug!(client_id = %client_id, "Tunnel: message from unauthorized client");
                    self.send(RelayMessage::BackendResponse {
                        client_id,
                        message: json!({"error": "Unauthorized"}),
                    })
                    .await;
                    return;
                }
                let handler = self.caps.handler.clone();
                let out = self.out.clone();
                tokio::spawn(async move {
                    let id = client_id.clone();
                    let outcome = tokio::spawn(async move { handler.handle(id, message).await }).await;
                    let message = match outcome {
                        Ok(Ok(result)) => result,
                        Ok(Err(e)) => json!({"error": e}),
                        Err(join) => {
                            warn!(client_id = %client_id, error = %join, "Tunnel: message handler failed");
                            json!({"error": "Internal error"})
                        }
                    };
                    send_relay(&out, RelayMessage::BackendResponse { client_id, message }).await;
                });
            }
            RelayMessage::ClientDisconnected { client_id } => {
                self.authorized.write().await.revoke(&client_id);
                debug!(client_id = %client_id, "Tunnel: client left");
                if let Some(observer) = &self.caps.observer {
                    observer.client_disconnected(&client_id).await;
                }
            }
            RelayMessage::HttpProxyRequest(request) => {
                let caps = self.caps.clone();
                let out = self.out.clone();
                tokio::spawn(async move {
                    let response = answer_proxy_request(caps, request).await;
                    send_relay(&out, RelayMessage::HttpProxyResponse(response)).await;
                });
            }
            RelayMessage::GatewayError { code, message } => {
                warn!(?code, message = %message, "Tunnel: gateway error");
            }
            other => debug!(kind = other.kind(), "Tunnel: ignoring frame"),
        }
    }
}

async fn answer_proxy_request(caps: Arc<Capabilities>, request: ProxyRequest) -> ProxyResponse {
    let request_id = request.request_id.clone();
    let api_key = request
        .headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("authorization"))
        .and_then(|(_, v)| parse_bearer(Some(v.as_str())).ok())
        .map(ToString::to_string);
    let Some(api_key) = api_key else {
        return error_response(&request_id, 401, "Missing API key");
    };
    if let Err(e) = caps.validator.validate("bridge", &api_key).await {
        return error_response(&request_id, 401, &e);
    }
    let Some(proxy) = caps.proxy.clone() else {
        return error_response(&request_id, 501, "HTTP bridge not supported by this backend");
    };
    match tokio::spawn(async move { proxy.handle(request).await }).await {
        Ok(response) => ProxyResponse {
            request_id,
            ..response
        },
        Err(join) => {
            warn!(request_id = %request_id, error = %join, "Tunnel: proxy handler failed");
            error_response(&request_id, 500, "Internal error")
        }
    }
}

async fn send_relay(out: &mpsc::Sender<Message>, msg: RelayMessage) {
    if out.send(Message::Text(msg.to_json().into())).await.is_err() {
        debug!(kind = msg.kind(), "Tunnel: connection gone, frame dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle(&self, client_id: String, message: Value) -> Result<Value, String> {
            if message.get("boom").is_some() {
                panic!("handler blew up");
            }
            if message.get("fail").is_some() {
                return Err("nope".into());
            }
            Ok(json!({"from": client_id, "echo": message}))
        }
    }

    struct Fixed(u16);

    #[async_trait]
    impl ProxyHandler for Fixed {
        async fn handle(&self, request: ProxyRequest) -> ProxyResponse {
            ProxyResponse {
                request_id: "overwritten".into(),
                status: self.0,
                headers: BTreeMap::new(),
                body: Some(json!(request.path)),
                body_encoding: None,
            }
        }
    }

    fn caps(proxy: Option<Arc<dyn ProxyHandler>>) -> Arc<Capabilities> {
        caps_with(Arc::new(ApiKeyValidator::new("k")), proxy)
    }

    fn caps_with(
        validator: Arc<dyn CredentialValidator>,
        proxy: Option<Arc<dyn ProxyHandler>>,
    ) -> Arc<Capabilities> {
        Arc::new(Capabilities {
            validator,
            handler: Arc::new(Echo),
            proxy,
            observer: None,
        })
    }

    /// Accepts every key, but only once released.
    struct Gated(Arc<tokio::sync::Notify>);

    #[async_trait]
    impl CredentialValidator for Gated {
        async fn validate(&self, _client_id: &str, _api_key: &str) -> Result<(), String> {
            self.0.notified().await;
            Ok(())
        }
    }

    fn session(proxy: Option<Arc<dyn ProxyHandler>>) -> (Session, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(16);
        (Session::new(caps(proxy), tx), rx)
    }

    async fn next(rx: &mut mpsc::Receiver<Message>) -> RelayMessage {
        match rx.recv().await {
            Some(Message::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected {other:?}"),
        }
    }

    async fn authorize(s: &Session, rx: &mut mpsc::Receiver<Message>, client_id: &str) {
        s.dispatch(RelayMessage::ClientAuth {
            client_id: client_id.into(),
            api_key: "k".into(),
        })
        .await;
        assert!(matches!(
            next(rx).await,
            RelayMessage::ClientAuthResult { success: true, .. }
        ));
    }

    #[tokio::test]
    async fn client_auth_reports_result() {
        let (s, mut rx) = session(None);
        s.dispatch(RelayMessage::ClientAuth {
            client_id: "c1".into(),
            api_key: "wrong".into(),
        })
        .await;
        assert_eq!(
            next(&mut rx).await,
            RelayMessage::ClientAuthResult {
                client_id: Some("c1".into()),
                backend_id: None,
                success: false,
                error: Some("Invalid API key".into()),
            }
        );
        assert!(!s.authorized.read().await.contains("c1"));

        authorize(&s, &mut rx, "c1").await;
        assert!(s.authorized.read().await.contains("c1"));
    }

    #[tokio::test]
    async fn unauthorized_forward_skips_handler() {
        let (s, mut rx) = session(None);
        s.dispatch(RelayMessage::Forwarded {
            client_id: "c1".into(),
            message: json!({"op": "x"}),
        })
        .await;
        assert_eq!(
            next(&mut rx).await,
            RelayMessage::BackendResponse {
                client_id: "c1".into(),
                message: json!({"error": "Unauthorized"}),
            }
        );
    }

    #[tokio::test]
    async fn forwarded_message_reaches_handler() {
        let (s, mut rx) = session(None);
        authorize(&s, &mut rx, "c1").await;
        s.dispatch(RelayMessage::Forwarded {
            client_id: "c1".into(),
            message: json!({"op": "x"}),
        })
        .await;
        assert_eq!(
            next(&mut rx).await,
            RelayMessage::BackendResponse {
                client_id: "c1".into(),
                message: json!({"from": "c1", "echo": {"op": "x"}}),
            }
        );
    }

    #[tokio::test]
    async fn handler_errors_and_panics_are_answered() {
        let (s, mut rx) = session(None);
        authorize(&s, &mut rx, "c1").await;

        s.dispatch(RelayMessage::Forwarded {
            client_id: "c1".into(),
            message: json!({"fail": true}),
        })
        .await;
        match next(&mut rx).await {
            RelayMessage::BackendResponse { message, .. } => assert_eq!(message, json!({"error": "nope"})),
            other => panic!("unexpected {other:?}"),
        }

        s.dispatch(RelayMessage::Forwarded {
            client_id: "c1".into(),
            message: json!({"boom": true}),
        })
        .await;
        match next(&mut rx).await {
            RelayMessage::BackendResponse { message, .. } => assert!(message.get("error").is_some()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn client_disconnect_revokes() {
        let (s, mut rx) = session(None);
        authorize(&s, &mut rx, "c1").await;
        s.dispatch(RelayMessage::ClientDisconnected {
            client_id: "c1".into(),
        })
        .await;
        assert!(!s.authorized.read().await.contains("c1"));
    }

    #[tokio::test]
    async fn disconnect_during_validation_does_not_authorize() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let (tx, mut rx) = mpsc::channel(16);
        let s = Session::new(caps_with(Arc::new(Gated(gate.clone())), None), tx);

        s.dispatch(RelayMessage::ClientAuth {
            client_id: "c1".into(),
            api_key: "k".into(),
        })
        .await;
        s.dispatch(RelayMessage::ClientDisconnected {
            client_id: "c1".into(),
        })
        .await;
        gate.notify_one();

        assert!(matches!(
            next(&mut rx).await,
            RelayMessage::ClientAuthResult { success: false, .. }
        ));
        assert!(!s.authorized.read().await.contains("c1"));

        s.dispatch(RelayMessage::Forwarded {
            client_id: "c1".into(),
            message: json!({"op": "x"}),
        })
        .await;
        assert_eq!(
            next(&mut rx).await,
            RelayMessage::BackendResponse {
                client_id: "c1".into(),
                message: json!({"error": "Unauthorized"}),
            }
        );
    }

    fn proxy_request(authorization: Option<&str>) -> ProxyRequest {
        let mut headers = BTreeMap::new();
        if let Some(a) = authorization {
            headers.insert("authorization".to_string(), a.to_string());
        }
        ProxyRequest {
            request_id: "r1".into(),
            method: "GET".into(),
            path: "/status".into(),
            headers,
            body: None,
            body_encoding: None,
        }
    }

    #[tokio::test]
    async fn proxy_request_checks_api_key() {
        let fixed: Arc<dyn ProxyHandler> = Arc::new(Fixed(200));
        let resp = answer_proxy_request(caps(Some(fixed.clone())), proxy_request(Some("Bearer bad"))).await;
        assert_eq!(resp.status, 401);
        let resp = answer_proxy_request(caps(Some(fixed.clone())), proxy_request(None)).await;
        assert_eq!(resp.status, 401);

        let resp = answer_proxy_request(caps(Some(fixed)), proxy_request(Some("Bearer k"))).await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.request_id, "r1");
        assert_eq!(resp.body, Some(json!("/status")));
    }

    #[tokio::test]
    async fn proxy_request_without_handler_is_not_implemented() {
        let resp = answer_proxy_request(caps(None), proxy_request(Some("Bearer k"))).await;
        assert_eq!(resp.status, 501);
        assert_eq!(resp.request_id, "r1");
    }

    #[test]
    fn gateway_url_host_and_port() {
        assert_eq!(
            parse_gateway_url("wss://gw.example.com/ws").unwrap(),
            ("gw.example.com".to_string(), 443)
        );
        assert_eq!(
            parse_gateway_url("ws://127.0.0.1:8787/ws").unwrap(),
            ("127.0.0.1".to_string(), 8787)
        );
        assert!(parse_gateway_url("http://gw/ws").is_err());
    }

    fn backend_config(url: &str) -> BackendConfig {
        BackendConfig {
            gateway_url: url.into(),
            secret: "s".into(),
            display_name: None,
            api_key: "k".into(),
            local_url: None,
            socks5_proxy: None,
            reconnect_delay_secs: 5,
            max_reconnect_attempts: 2,
        }
    }

    #[test]
    fn builder_requires_capabilities() {
        let err = TunnelClient::builder(backend_config("ws://127.0.0.1:1/ws"), "d1")
            .validator(ApiKeyValidator::new("k"))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, TunnelError::MissingCapability(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_bounded_attempts() {
        // Nothing listens on the port, so every attempt fails fast.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let handle = TunnelClient::builder(backend_config(&format!("ws://127.0.0.1:{port}/ws")), "d1")
            .validator(ApiKeyValidator::new("k"))
            .handler(Echo)
            .build()
            .unwrap()
            .spawn();
        assert_eq!(handle.wait().await, TunnelStatus::GaveUp);
    }

    #[tokio::test]
    async fn rejected_registration_is_terminal() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let Some(Ok(Message::Text(text))) = ws.next().await else {
                panic!("expected register");
            };
            let msg: RelayMessage = serde_json::from_str(&text).unwrap();
            assert!(matches!(msg, RelayMessage::Register { ref device_id, .. } if device_id == "d1"));
            let reply = RelayMessage::RegisterResult {
                success: false,
                backend_id: None,
                error: Some("Invalid secret".into()),
            };
            ws.send(Message::Text(reply.to_json().into())).await.unwrap();
            // Accept no further connections: a retry would hang the test.
            let _ = ws.next().await;
        });

        let handle = TunnelClient::builder(backend_config(&format!("ws://127.0.0.1:{port}/ws")), "d1")
            .validator(ApiKeyValidator::new("k"))
            .handler(Echo)
            .build()
            .unwrap()
            .spawn();
        assert_eq!(
            handle.wait().await,
            TunnelStatus::Rejected {
                reason: "Invalid secret".into()
            }
        );
        server.await.unwrap();
    }

    /// Accepts `sessions` registrations, closing each one right after
    /// `register_result`, then stops listening.
    async fn flapping_gateway(listener: tokio::net::TcpListener, sessions: usize) -> usize {
        let mut registered = 0;
        for n in 0..sessions {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let Some(Ok(Message::Text(text))) = ws.next().await else {
                panic!("expected register");
            };
            let msg: RelayMessage = serde_json::from_str(&text).unwrap();
            assert!(matches!(msg, RelayMessage::Register { .. }));
            let reply = RelayMessage::RegisterResult {
                success: true,
                backend_id: Some(format!("b{n}")),
                error: None,
            };
            ws.send(Message::Text(reply.to_json().into())).await.unwrap();
            let _ = ws.close(None).await;
            while let Some(Ok(_)) = ws.next().await {}
            registered += 1;
        }
        registered
    }

    #[tokio::test]
    async fn registered_sessions_reset_the_attempt_counter() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut config = backend_config(&format!("ws://127.0.0.1:{port}/ws"));
        config.reconnect_delay_secs = 0;
        let sessions = config.max_reconnect_attempts as usize + 3;
        let server = tokio::spawn(flapping_gateway(listener, sessions));

        let handle = TunnelClient::builder(config, "d1")
            .validator(ApiKeyValidator::new("k"))
            .handler(Echo)
            .build()
            .unwrap()
            .spawn();

        // Without the reset the client would stop after max_reconnect_attempts
        // sessions and the gateway would wait forever.
        let served = tokio::time::timeout(Duration::from_secs(10), server)
            .await
            .expect("client stopped reconnecting")
            .unwrap();
        assert_eq!(served, sessions);

        // Listener gone: only failed attempts remain.
        let last = tokio::time::timeout(Duration::from_secs(10), handle.wait())
            .await
            .unwrap();
        assert_eq!(last, TunnelStatus::GaveUp);
    }

    #[tokio::test]
    async fn dials_gateway_through_socks5() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_port = listener.local_addr().unwrap().port();
        let proxy = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut greet = [0u8; 3];
            s.read_exact(&mut greet).await.unwrap();
            assert_eq!(greet, [0x05, 1, 0x00]);
            s.write_all(&[0x05, 0x00]).await.unwrap();

            let mut hdr = [0u8; 5];
            s.read_exact(&mut hdr).await.unwrap();
            assert_eq!(&hdr[..4], &[0x05, 0x01, 0x00, 0x03]);
            let mut host = vec![0u8; usize::from(hdr[4])];
            s.read_exact(&mut host).await.unwrap();
            let mut port = [0u8; 2];
            s.read_exact(&mut port).await.unwrap();
            s.write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 0])
                .await
                .unwrap();

            // Play the gateway on the tunnelled stream.
            let mut ws = tokio_tungstenite::accept_async(s).await.unwrap();
            let Some(Ok(Message::Text(text))) = ws.next().await else {
                panic!("expected register");
            };
            let msg: RelayMessage = serde_json::from_str(&text).unwrap();
            assert!(matches!(msg, RelayMessage::Register { .. }));
            let reply = RelayMessage::RegisterResult {
                success: false,
                backend_id: None,
                error: Some("maintenance".into()),
            };
            ws.send(Message::Text(reply.to_json().into())).await.unwrap();
            let _ = ws.next().await;
            (String::from_utf8(host).unwrap(), u16::from_be_bytes(port))
        });

        let mut config = backend_config("ws://gateway.invalid:8787/ws");
        config.socks5_proxy = Some(format!("socks5://127.0.0.1:{proxy_port}"));
        let handle = TunnelClient::builder(config, "d1")
            .validator(ApiKeyValidator::new("k"))
            .handler(Echo)
            .build()
            .unwrap()
            .spawn();
        assert_eq!(
            handle.wait().await,
            TunnelStatus::Rejected {
                reason: "maintenance".into()
            }
        );
        assert_eq!(proxy.await.unwrap(), ("gateway.invalid".to_string(), 8787));
    }
}
