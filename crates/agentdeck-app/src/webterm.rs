//! Browser access to the live session over WebSockets.
//!
//! Agent output is broadcast to every client as binary frames; binary
//! frames from clients are keystrokes for the current agent. Control
//! messages travel as JSON text frames.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use agentdeck_pty::ProcessProxy;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::share::{ClientInfo, ShareError, TerminalShare};

/// Ports tried after the configured one.
const PORT_FALLBACKS: u16 = 10;
const CLIENT_QUEUE: usize = 256;
/// Close code sent when the server drops a client.
pub const CLOSE_DISCONNECTED: u16 = 4001;
const OUTPUT_HANDLER_ID: &str = "webterm";
const AUTH_REALM: &str = "Basic realm=\"agentdeck\"";

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub host: IpAddr,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            user: None,
            pass: None,
        }
    }
}

/// Server to client control messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Agent { name: String },
    Reset,
    Disconnect { reason: String },
}

/// Client to server control messages.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    /// The local terminal owns the size; accepted and ignored.
    Resize {
        #[allow(dead_code)]
        cols: u16,
        #[allow(dead_code)]
        rows: u16,
    },
}

enum Outbound {
    Output(Vec<u8>),
    Control(ServerMessage),
    Close(&'static str),
}

struct Client {
    info: ClientInfo,
    tx: mpsc::Sender<Outbound>,
}

struct Credentials {
    user: String,
    pass: String,
}

impl Credentials {
    /// Auth is on when either half is non-empty.
    fn from_config(config: &WebConfig) -> Option<Self> {
        let user = config.user.clone().unwrap_or_default();
        let pass = config.pass.clone().unwrap_or_default();
        if user.is_empty() && pass.is_empty() {
            return None;
        }
        Some(Self { user, pass })
    }

    fn check(&self, authorization: Option<&str>) -> bool {
        let Some(encoded) = authorization.and_then(|v| v.strip_prefix("Basic ")) else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Some(sep) = decoded.iter().position(|&b| b == b':') else {
            return false;
        };
        let user_ok = decoded[..sep].ct_eq(self.user.as_bytes());
        let pass_ok = decoded[sep + 1..].ct_eq(self.pass.as_bytes());
        bool::from(user_ok & pass_ok)
    }
}

struct Inner {
    credentials: Option<Credentials>,
    clients: Mutex<HashMap<String, Client>>,
    next_client: AtomicU64,
    proxy: Mutex<Option<Arc<ProcessProxy>>>,
    agent_name: Mutex<String>,
    shutdown: CancellationToken,
}

impl Inner {
    fn clients(&self) -> MutexGuard<'_, HashMap<String, Client>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn agent_name(&self) -> String {
        self.agent_name
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn current_proxy(&self) -> Option<Arc<ProcessProxy>> {
        self.proxy.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn register(&self, addr: SocketAddr, user_agent: String, tx: mpsc::Sender<Outbound>) -> String {
        let id = format!("client-{}", self.next_client.fetch_add(1, Ordering::SeqCst) + 1);
        info!("web client {id} connected from {addr}");
        self.clients().insert(
            id.clone(),
            Client {
                info: ClientInfo {
                    id: id.clone(),
                    addr: addr.to_string(),
                    user_agent,
                },
                tx,
            },
        );
        id
    }

    fn unregister(&self, id: &str) {
        if self.clients().remove(id).is_some() {
            info!("web client {id} disconnected");
        }
    }

    /// Queue `message` for every client. Full queues drop it.
    fn broadcast(&self, make: impl Fn() -> Outbound) {
        for client in self.clients().values() {
            match client.tx.try_send(make()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("queue full for {}, dropping message", client.info.id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    fn forward_input(&self, data: &[u8]) {
        let Some(proxy) = self.current_proxy() else {
            return;
        };
        if let Err(e) = proxy.write(data) {
            debug!("web input dropped: {e}");
        }
    }

    fn attach(self: &Arc<Self>, proxy: Option<Arc<ProcessProxy>>) {
        let mut current = self.proxy.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = current.take() {
            old.remove_output_handler(OUTPUT_HANDLER_ID);
        }
        if let Some(proxy) = &proxy {
            let weak: Weak<Self> = Arc::downgrade(self);
            proxy.add_output_handler(OUTPUT_HANDLER_ID, move |data| {
                if let Some(inner) = weak.upgrade() {
                    inner.broadcast(|| Outbound::Output(data.clone()));
                }
            });
        }
        *current = proxy;
    }

    fn drop_client(&self, id: &str, reason: &'static str) -> bool {
        let Some(client) = self.clients().remove(id) else {
            return false;
        };
        let _ = client.tx.try_send(Outbound::Control(ServerMessage::Disconnect {
            reason: reason.to_string(),
        }));
        let _ = client.tx.try_send(Outbound::Close(reason));
        true
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, addr: SocketAddr, user_agent: String) {
        let (mut sender, mut receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Outbound>(CLIENT_QUEUE);
        let _ = tx.try_send(Outbound::Control(ServerMessage::Agent {
            name: self.agent_name(),
        }));
        let id = self.register(addr, user_agent, tx);

        // Ends when the registry drops the client's sender or a close is queued.
        let mut writer = tokio::spawn(async move {
            while let Some(out) = rx.recv().await {
                let message = match out {
                    Outbound::Output(data) => Message::Binary(data),
                    Outbound::Control(control) => match serde_json::to_string(&control) {
                        Ok(text) => Message::Text(text),
                        Err(e) => {
                            warn!("failed to encode control message: {e}");
                            continue;
                        }
                    },
                    Outbound::Close(reason) => {
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code: CLOSE_DISCONNECTED,
                                reason: reason.into(),
                            })))
                            .await;
                        return;
                    }
                };
                if sender.send(message).await.is_err() {
                    return;
                }
            }
        });

        loop {
            tokio::select! {
                _ = &mut writer => break,
                _ = self.shutdown.cancelled() => break,
                message = receiver.next() => match message {
                    Some(Ok(Message::Binary(data))) => self.forward_input(&data),
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(ClientMessage::Resize { .. }) => {}
                        Err(e) => debug!("ignoring message from {id}: {e}"),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("read from {id} failed: {e}");
                        break;
                    }
                },
            }
        }
        self.unregister(&id);
        if !writer.is_finished() {
            // Give a queued close frame a moment to go out.
            let _ = tokio::time::timeout(std::time::Duration::from_millis(200), &mut writer).await;
            writer.abort();
        }
    }
}

/// The terminal-sharing server.
pub struct WebTerminal {
    inner: Arc<Inner>,
    addr: SocketAddr,
}

impl WebTerminal {
    /// Listen on the first free port in `port..=port+10` and start serving.
    /// Output of `proxy`, if given, is broadcast from the start.
    pub async fn bind(
        config: WebConfig,
        agent_name: &str,
        proxy: Option<Arc<ProcessProxy>>,
    ) -> io::Result<Self> {
        let listener = bind_with_fallback(config.host, config.port).await?;
        let addr = listener.local_addr()?;

        let inner = Arc::new(Inner {
            credentials: Credentials::from_config(&config),
            clients: Mutex::new(HashMap::new()),
            next_client: AtomicU64::new(0),
            proxy: Mutex::new(None),
            agent_name: Mutex::new(agent_name.to_string()),
            shutdown: CancellationToken::new(),
        });
        inner.attach(proxy);

        let app = router(Arc::clone(&inner));
        let shutdown = inner.shutdown.clone();
        tokio::spawn(async move {
            let served = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await;
            if let Err(e) = served {
                warn!("web terminal server failed: {e}");
            }
        });

        info!(
            "web terminal listening on {addr}{}",
            if inner.credentials.is_some() { " (auth on)" } else { "" }
        );
        Ok(Self { inner, addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl TerminalShare for WebTerminal {
    fn set_proxy(&self, proxy: Option<Arc<ProcessProxy>>) {
        self.inner.attach(proxy);
    }

    fn set_agent_name(&self, name: &str) {
        *self.inner.agent_name.lock().unwrap_or_else(|e| e.into_inner()) = name.to_string();
        let name = name.to_string();
        self.inner.broadcast(|| {
            Outbound::Control(ServerMessage::Agent { name: name.clone() })
        });
    }

    fn broadcast_reset(&self) {
        self.inner
            .broadcast(|| Outbound::Control(ServerMessage::Reset));
    }

    /// Sorted by address, then user agent.
    fn list_clients(&self) -> Vec<ClientInfo> {
        let mut clients: Vec<ClientInfo> = self
            .inner
            .clients()
            .values()
            .map(|c| c.info.clone())
            .collect();
        clients.sort_by(|a, b| {
            a.addr
                .cmp(&b.addr)
                .then_with(|| a.user_agent.cmp(&b.user_agent))
        });
        clients
    }

    fn disconnect_client(&self, id: &str) -> Result<(), ShareError> {
        if self.inner.drop_client(id, "Disconnected by server") {
            Ok(())
        } else {
            Err(ShareError::ClientNotFound(id.to_string()))
        }
    }

    fn stop(&self) -> Result<(), ShareError> {
        if self.inner.shutdown.is_cancelled() {
            return Ok(());
        }
        let ids: Vec<String> = self.inner.clients().keys().cloned().collect();
        for id in ids {
            self.inner.drop_client(&id, "Server shutting down");
        }
        self.inner.attach(None);
        self.inner.shutdown.cancel();
        info!("web terminal stopped");
        Ok(())
    }
}

async fn bind_with_fallback(host: IpAddr, port: u16) -> io::Result<TcpListener> {
    let mut last_err = None;
    for offset in 0..=PORT_FALLBACKS {
        let Some(candidate) = port.checked_add(offset) else {
            break;
        };
        match TcpListener::bind((host, candidate)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                debug!("port {candidate} unavailable: {e}");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "no port available")
    }))
}

fn router(inner: Arc<Inner>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&inner),
            require_auth,
        ))
        .route("/health", get(health))
        .with_state(inner)
}

async fn require_auth(State(inner): State<Arc<Inner>>, request: Request, next: Next) -> Response {
    let Some(credentials) = &inner.credentials else {
        return next.run(request).await;
    };
    let header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if credentials.check(header) {
        return next.run(request).await;
    }
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, AUTH_REALM)],
        "Unauthorized",
    )
        .into_response()
}

async fn index(State(inner): State<Arc<Inner>>) -> impl IntoResponse {
    format!(
        "agentdeck web terminal\ncurrent agent: {}\nconnect a WebSocket terminal client to /ws\n",
        inner.agent_name()
    )
}

async fn health(State(inner): State<Arc<Inner>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "agent": inner.agent_name(),
        "clients": inner.clients().len(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(inner): State<Arc<Inner>>,
) -> impl IntoResponse {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    ws.on_upgrade(move |socket| inner.handle_socket(socket, addr, user_agent))
}
