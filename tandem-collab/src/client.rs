//! Client session: transport lifecycle, document handles, pending buffer.
//!
//! One session owns one WebSocket, a set of open documents, and a pending
//! buffer per document holding locally-applied operations the server has
//! not yet acknowledged. Inbound remote operations are transformed against
//! the still-pending buffer before applying; the buffer itself is never
//! transformed server-bound — the authority does the symmetric rebase.
//!
//! Lifecycle: DISCONNECTED → CONNECTING → CONNECTED, with RECONNECTING
//! rounds on transport loss (exponential backoff, capped). On a rejoin the
//! server snapshot replaces local state and pending operations are
//! dropped; re-issuing them is the application's call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::stream::{SplitStream, SplitSink};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use tandem_ot::{
    generate_client_id, transform_against, ClientId, DocumentId, MapEntryOp, Operation,
    OperationId, OtError, Schema, SharedDoc, SharedEvent, Snapshot, Version,
};

use crate::presence::{Cursor, Presence, PresenceThrottle};
use crate::protocol::{
    ClientEnvelope, ClientMessage, ErrorCode, ProtocolError, ServerEnvelope, ServerMessage,
    WS_PATH,
};

/// Reconnection policy.
#[derive(Debug, Clone)]
pub struct ReconnectionConfig {
    pub enabled: bool,
    pub attempts: u32,
    pub delay: Duration,
    pub delay_max: Duration,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            attempts: 5,
            delay: Duration::from_secs(1),
            delay_max: Duration::from_secs(30),
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base server URL, e.g. `ws://127.0.0.1:8080` (the `/ws` path is
    /// appended when missing).
    pub server_url: String,
    pub token: Option<String>,
    /// Declared client id; generated when absent.
    pub client_id: Option<ClientId>,
    pub connection_timeout: Duration,
    /// How long to wait for AUTH_SUCCESS after AUTHENTICATE.
    pub auth_timeout: Duration,
    /// Application-level ping cadence.
    pub ping_interval: Duration,
    /// Grace period for the matching pong before the transport is closed.
    pub pong_timeout: Duration,
    pub reconnection: ReconnectionConfig,
    /// Extra headers for the WebSocket handshake.
    pub headers: Vec<(String, String)>,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            token: None,
            client_id: None,
            connection_timeout: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(5),
            reconnection: ReconnectionConfig::default(),
            headers: Vec::new(),
        }
    }

    fn ws_url(&self) -> String {
        let base = self.server_url.trim_end_matches('/');
        if base.ends_with(WS_PATH) {
            base.to_string()
        } else {
            format!("{base}{WS_PATH}")
        }
    }
}

/// Session connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal for the current attempt; reconnection may follow.
    Error,
}

/// Events surfaced to the application.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Reconnecting { attempt: u32 },
    DocumentJoined { document_id: DocumentId, version: Version },
    RemoteOperation { document_id: DocumentId, operation: Operation },
    OperationAcknowledged {
        document_id: DocumentId,
        operation_id: OperationId,
        version: Version,
    },
    OperationFailed {
        document_id: DocumentId,
        operation_id: OperationId,
        code: ErrorCode,
        message: String,
    },
    PresenceUpdated { document_id: DocumentId, presence: Presence },
    PresenceSnapshot { document_id: DocumentId, users: Vec<Presence> },
    UserJoined { document_id: DocumentId, user: Presence },
    UserLeft { document_id: DocumentId, client_id: ClientId },
    ServerError { code: ErrorCode, message: String },
}

/// Session-level failures.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("not connected")]
    NotConnected,
    #[error("document holds a different value kind")]
    WrongKind,
    #[error(transparent)]
    Ot(#[from] OtError),
    #[error("timed out waiting for the server")]
    Timeout,
}

enum OutboundFrame {
    Msg(ClientMessage),
    Close,
}

type OutboundTx = mpsc::UnboundedSender<OutboundFrame>;
type SharedOutbound = Arc<Mutex<Option<OutboundTx>>>;

struct DocState {
    schema: Schema,
    doc: SharedDoc,
    pending: Vec<Operation>,
}

type SharedDocState = Arc<Mutex<DocState>>;

/// Everything the background tasks need, cheaply cloneable.
#[derive(Clone)]
struct SessionShared {
    config: ClientConfig,
    client_id: ClientId,
    state: Arc<RwLock<SessionState>>,
    docs: Arc<Mutex<HashMap<DocumentId, SharedDocState>>>,
    outbound: SharedOutbound,
    event_tx: mpsc::Sender<SessionEvent>,
    pending_joins: Arc<Mutex<HashMap<DocumentId, oneshot::Sender<Version>>>>,
    reconnect_enabled: Arc<AtomicBool>,
    last_pong: Arc<Mutex<Instant>>,
}

impl SessionShared {
    fn emit(&self, event: SessionEvent) {
        // A slow consumer must not stall the read loop; stale awareness
        // events are droppable.
        if let Err(e) = self.event_tx.try_send(event) {
            log::trace!("session event dropped: {e}");
        }
    }

    fn send(&self, msg: ClientMessage) -> Result<(), ClientError> {
        let outbound = self.outbound.lock().expect("outbound lock");
        match outbound.as_ref() {
            Some(tx) => tx
                .send(OutboundFrame::Msg(msg))
                .map_err(|_| ClientError::NotConnected),
            None => Err(ClientError::NotConnected),
        }
    }
}

/// Handle to one open document: typed mutators that apply locally, queue in
/// the pending buffer and ship to the coordinator.
#[derive(Clone)]
pub struct DocumentHandle {
    document_id: DocumentId,
    state: SharedDocState,
    shared: SessionShared,
}

impl DocumentHandle {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn schema(&self) -> Schema {
        self.state.lock().expect("doc lock").schema
    }

    pub fn version(&self) -> Version {
        self.state.lock().expect("doc lock").doc.version()
    }

    /// Current value (deep copy).
    pub fn value(&self) -> Value {
        self.state.lock().expect("doc lock").doc.value_json()
    }

    /// Operations shipped but not yet acknowledged.
    pub fn pending_len(&self) -> usize {
        self.state.lock().expect("doc lock").pending.len()
    }

    pub fn subscribe(&self, listener: impl FnMut(&SharedEvent) + Send + 'static) {
        self.state.lock().expect("doc lock").doc.subscribe(listener);
    }

    fn ship(&self, op: Operation) -> Operation {
        // While disconnected the edit still succeeded locally; it stays in
        // the pending buffer and is dropped on the next rejoin.
        if let Err(ClientError::NotConnected) = self.shared.send(ClientMessage::Operation {
            document_id: self.document_id.clone(),
            operation: op.clone(),
        }) {
            log::debug!(
                "offline edit on {} kept pending ({})",
                self.document_id,
                op.kind()
            );
        }
        op
    }

    fn with_doc<T>(
        &self,
        f: impl FnOnce(&mut SharedDoc) -> Result<T, OtError>,
    ) -> Result<T, ClientError> {
        let mut state = self.state.lock().expect("doc lock");
        let out = f(&mut state.doc)?;
        Ok(out)
    }

    fn apply_local(
        &self,
        f: impl FnOnce(&mut SharedDoc) -> Result<Operation, ClientError>,
    ) -> Result<Operation, ClientError> {
        let op = {
            let mut state = self.state.lock().expect("doc lock");
            let op = f(&mut state.doc)?;
            state.pending.push(op.clone());
            op
        };
        Ok(self.ship(op))
    }

    // ── Text ────────────────────────────────────────────────────────

    pub fn insert_text(&self, position: usize, text: impl Into<String>) -> Result<Operation, ClientError> {
        let text = text.into();
        self.apply_local(|doc| {
            let shared = doc.as_text_mut().ok_or(ClientError::WrongKind)?;
            Ok(shared.insert(position, text)?)
        })
    }

    pub fn delete_text(&self, position: usize, length: usize) -> Result<Operation, ClientError> {
        self.apply_local(|doc| {
            let shared = doc.as_text_mut().ok_or(ClientError::WrongKind)?;
            Ok(shared.delete(position, length)?)
        })
    }

    /// Replace the whole text, shipping the minimal diff operations.
    pub fn set_text(&self, new_value: impl Into<String>) -> Result<Vec<Operation>, ClientError> {
        let new_value = new_value.into();
        let ops = {
            let mut state = self.state.lock().expect("doc lock");
            let DocState { doc, pending, .. } = &mut *state;
            let shared = doc.as_text_mut().ok_or(ClientError::WrongKind)?;
            let ops = shared.set_value(new_value)?;
            pending.extend(ops.iter().cloned());
            ops
        };
        for op in &ops {
            self.ship(op.clone());
        }
        Ok(ops)
    }

    pub fn text(&self) -> Result<String, ClientError> {
        match self.value() {
            Value::String(s) => Ok(s),
            _ => Err(ClientError::WrongKind),
        }
    }

    // ── List ────────────────────────────────────────────────────────

    pub fn list_insert(&self, index: usize, item: Value) -> Result<Operation, ClientError> {
        self.apply_local(|doc| {
            let shared = doc.as_list_mut().ok_or(ClientError::WrongKind)?;
            Ok(shared.insert(index, item)?)
        })
    }

    pub fn list_push(&self, item: Value) -> Result<Operation, ClientError> {
        self.apply_local(|doc| {
            let shared = doc.as_list_mut().ok_or(ClientError::WrongKind)?;
            Ok(shared.push(item)?)
        })
    }

    pub fn list_delete(&self, index: usize, count: usize) -> Result<Operation, ClientError> {
        self.apply_local(|doc| {
            let shared = doc.as_list_mut().ok_or(ClientError::WrongKind)?;
            Ok(shared.delete(index, count)?)
        })
    }

    pub fn list_replace(&self, index: usize, item: Value) -> Result<Operation, ClientError> {
        self.apply_local(|doc| {
            let shared = doc.as_list_mut().ok_or(ClientError::WrongKind)?;
            Ok(shared.replace(index, item)?)
        })
    }

    pub fn list_move(&self, index: usize, target_index: usize) -> Result<Operation, ClientError> {
        self.apply_local(|doc| {
            let shared = doc.as_list_mut().ok_or(ClientError::WrongKind)?;
            Ok(shared.move_item(index, target_index)?)
        })
    }

    // ── Map ─────────────────────────────────────────────────────────

    pub fn map_set(&self, key: impl Into<String>, value: Value) -> Result<Operation, ClientError> {
        let key = key.into();
        self.apply_local(|doc| {
            let shared = doc.as_map_mut().ok_or(ClientError::WrongKind)?;
            Ok(shared.set(key, value)?)
        })
    }

    pub fn map_delete(&self, key: impl Into<String>) -> Result<Operation, ClientError> {
        let key = key.into();
        self.apply_local(|doc| {
            let shared = doc.as_map_mut().ok_or(ClientError::WrongKind)?;
            Ok(shared.delete(key)?)
        })
    }

    pub fn map_batch(&self, entries: Vec<MapEntryOp>) -> Result<Operation, ClientError> {
        self.apply_local(|doc| {
            let shared = doc.as_map_mut().ok_or(ClientError::WrongKind)?;
            Ok(shared.batch(entries)?)
        })
    }

    pub fn map_clear(&self) -> Result<Operation, ClientError> {
        self.apply_local(|doc| {
            let shared = doc.as_map_mut().ok_or(ClientError::WrongKind)?;
            Ok(shared.clear()?)
        })
    }

    pub fn map_get(&self, key: &str) -> Result<Option<Value>, ClientError> {
        self.with_doc(|doc| {
            Ok(doc
                .as_map_mut()
                .map(|m| m.get(key))
                .unwrap_or(None))
        })
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// The collaborative editing session.
pub struct CollabClient {
    shared: SessionShared,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
    throttle: Mutex<PresenceThrottle>,
}

impl CollabClient {
    pub fn new(config: ClientConfig) -> Self {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(generate_client_id);
        let (event_tx, event_rx) = mpsc::channel(256);
        let shared = SessionShared {
            config,
            client_id,
            state: Arc::new(RwLock::new(SessionState::Disconnected)),
            docs: Arc::new(Mutex::new(HashMap::new())),
            outbound: Arc::new(Mutex::new(None)),
            event_tx,
            pending_joins: Arc::new(Mutex::new(HashMap::new())),
            reconnect_enabled: Arc::new(AtomicBool::new(true)),
            last_pong: Arc::new(Mutex::new(Instant::now())),
        };
        CollabClient {
            shared,
            event_rx: Some(event_rx),
            throttle: Mutex::new(PresenceThrottle::default()),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    /// Take the event receiver (once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    pub async fn state(&self) -> SessionState {
        *self.shared.state.read().await
    }

    /// Connect and authenticate. A no-op when already connected.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if *self.shared.state.read().await == SessionState::Connected {
            return Ok(());
        }
        self.shared
            .reconnect_enabled
            .store(self.shared.config.reconnection.enabled, Ordering::SeqCst);
        Self::establish(self.shared.clone()).await
    }

    async fn establish(shared: SessionShared) -> Result<(), ClientError> {
        *shared.state.write().await = SessionState::Connecting;

        let url = shared.config.ws_url();
        let mut request = url
            .clone()
            .into_client_request()
            .map_err(|e| ClientError::Protocol(ProtocolError::Serialization(e.to_string())))?;
        for (name, value) in &shared.config.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(n), Ok(v)) => {
                    request.headers_mut().insert(n, v);
                }
                _ => log::warn!("skipping invalid header {name:?}"),
            }
        }

        let connected = timeout(
            shared.config.connection_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await;
        let ws_stream = match connected {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                *shared.state.write().await = SessionState::Error;
                log::warn!("connection to {url} failed: {e}");
                return Err(ClientError::Protocol(ProtocolError::ConnectionClosed));
            }
            Err(_) => {
                *shared.state.write().await = SessionState::Error;
                return Err(ClientError::Timeout);
            }
        };
        log::debug!("websocket open to {url}");

        let (ws_sink, mut ws_source) = ws_stream.split();

        // Writer task drains the outbound queue.
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::write_loop(ws_sink, out_rx));
        *shared.outbound.lock().expect("outbound lock") = Some(out_tx);

        // Authenticate before anything else; the reader is not running yet
        // so the handshake owns the stream.
        shared.send(ClientMessage::Authenticate {
            client_id: Some(shared.client_id.clone()),
            token: shared.config.token.clone(),
        })?;
        if let Err(e) = Self::await_auth(&shared, &mut ws_source).await {
            // Tear the writer down so the half-open socket closes.
            shared.outbound.lock().expect("outbound lock").take();
            return Err(e);
        }

        *shared.state.write().await = SessionState::Connected;
        shared.emit(SessionEvent::Connected);
        log::info!("session {} connected", shared.client_id);

        tokio::spawn(Self::read_loop(shared.clone(), ws_source));
        let keepalive_tx = shared
            .outbound
            .lock()
            .expect("outbound lock")
            .clone()
            .expect("just installed");
        *shared.last_pong.lock().expect("pong lock") = Instant::now();
        tokio::spawn(Self::keepalive_loop(shared.clone(), keepalive_tx));
        // Any documents left open from a previous connection are rejoined;
        // their DOCUMENT_JOINED snapshots replace local state.
        Self::rejoin_documents(&shared);
        Ok(())
    }

    async fn await_auth(
        shared: &SessionShared,
        ws_source: &mut WsSource,
    ) -> Result<(), ClientError> {
        let deadline = shared.config.auth_timeout;
        let result = timeout(deadline, async {
            while let Some(frame) = ws_source.next().await {
                let WsMessage::Text(text) = frame
                    .map_err(|_| ClientError::Protocol(ProtocolError::ConnectionClosed))?
                else {
                    continue;
                };
                match ServerEnvelope::decode(text.as_str()) {
                    Ok(envelope) => match envelope.msg {
                        ServerMessage::AuthRequired => continue,
                        ServerMessage::AuthSuccess { client_info } => {
                            log::debug!("authenticated as {}", client_info.client_id);
                            return Ok(());
                        }
                        ServerMessage::AuthFailed { reason } => {
                            return Err(ClientError::AuthFailed(reason));
                        }
                        other => {
                            log::debug!("pre-auth frame ignored: {other:?}");
                        }
                    },
                    Err(e) => log::warn!("undecodable frame during auth: {e}"),
                }
            }
            Err(ClientError::Protocol(ProtocolError::ConnectionClosed))
        })
        .await;
        match result {
            Ok(inner) => {
                if inner.is_err() {
                    *shared.state.write().await = SessionState::Error;
                }
                inner
            }
            Err(_) => {
                *shared.state.write().await = SessionState::Error;
                Err(ClientError::Timeout)
            }
        }
    }

    async fn write_loop(mut sink: WsSink, mut out_rx: mpsc::UnboundedReceiver<OutboundFrame>) {
        while let Some(frame) = out_rx.recv().await {
            match frame {
                OutboundFrame::Msg(msg) => {
                    let encoded = match ClientEnvelope::new(msg).encode() {
                        Ok(encoded) => encoded,
                        Err(e) => {
                            log::error!("dropping unencodable frame: {e}");
                            continue;
                        }
                    };
                    if sink.send(WsMessage::Text(encoded.into())).await.is_err() {
                        break;
                    }
                }
                OutboundFrame::Close => {
                    let _ = sink
                        .send(WsMessage::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "client disconnect".into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    }

    /// Application-level keepalive: ping every interval, close the
    /// transport when the pong misses its grace period. Reconnection then
    /// takes over.
    async fn keepalive_loop(shared: SessionShared, tx: OutboundTx) {
        let interval = shared.config.ping_interval;
        let grace = shared.config.pong_timeout;
        loop {
            tokio::time::sleep(interval).await;
            if tx.is_closed() {
                return;
            }
            let sent_at = Instant::now();
            if tx.send(OutboundFrame::Msg(ClientMessage::Ping)).is_err() {
                return;
            }
            tokio::time::sleep(grace).await;
            if tx.is_closed() {
                return;
            }
            if *shared.last_pong.lock().expect("pong lock") < sent_at {
                log::warn!("pong overdue, closing transport");
                let _ = tx.send(OutboundFrame::Close);
                return;
            }
        }
    }

    async fn read_loop(shared: SessionShared, mut ws_source: WsSource) {
        while let Some(frame) = ws_source.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => match ServerEnvelope::decode(text.as_str()) {
                    Ok(envelope) => Self::handle_server_message(&shared, envelope.msg),
                    Err(e) => log::warn!("undecodable frame: {e}"),
                },
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    log::debug!("socket error: {e}");
                    break;
                }
            }
        }

        shared.outbound.lock().expect("outbound lock").take();
        *shared.state.write().await = SessionState::Disconnected;
        shared.emit(SessionEvent::Disconnected);
        log::info!("session {} disconnected", shared.client_id);

        if shared.config.reconnection.enabled && shared.reconnect_enabled.load(Ordering::SeqCst) {
            tokio::spawn(Self::reconnect_loop(shared));
        }
    }

    /// Backoff schedule: `min(delay · 2^attempt, delay_max)`.
    fn backoff(config: &ReconnectionConfig, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        config.delay.saturating_mul(factor).min(config.delay_max)
    }

    async fn reconnect_loop(shared: SessionShared) {
        let policy = shared.config.reconnection.clone();
        for attempt in 0..policy.attempts {
            if !shared.reconnect_enabled.load(Ordering::SeqCst) {
                return;
            }
            *shared.state.write().await = SessionState::Reconnecting;
            shared.emit(SessionEvent::Reconnecting { attempt });
            tokio::time::sleep(Self::backoff(&policy, attempt)).await;
            if !shared.reconnect_enabled.load(Ordering::SeqCst) {
                return;
            }
            match Self::establish(shared.clone()).await {
                Ok(()) => return,
                Err(e) => log::warn!(
                    "reconnect attempt {} failed: {e}",
                    attempt + 1
                ),
            }
        }
        log::error!(
            "reconnection abandoned after {} attempts",
            policy.attempts
        );
        *shared.state.write().await = SessionState::Disconnected;
    }

    /// After a reconnect, rejoin every open document. The snapshot in each
    /// DOCUMENT_JOINED replaces local state; pending edits are dropped.
    fn rejoin_documents(shared: &SessionShared) {
        let docs: Vec<(DocumentId, Schema)> = {
            let map = shared.docs.lock().expect("docs lock");
            map.iter()
                .map(|(id, state)| (id.clone(), state.lock().expect("doc lock").schema))
                .collect()
        };
        for (document_id, schema) in docs {
            if let Err(e) = shared.send(ClientMessage::JoinDocument {
                document_id: document_id.clone(),
                schema: Some(schema),
            }) {
                log::warn!("rejoin of {document_id} failed: {e}");
            }
        }
    }

    fn handle_server_message(shared: &SessionShared, msg: ServerMessage) {
        match msg {
            ServerMessage::DocumentJoined {
                document_id,
                version,
                state,
                schema,
                users,
            } => {
                let known = {
                    let map = shared.docs.lock().expect("docs lock");
                    map.get(&document_id).cloned()
                };
                let Some(doc_state) = known else {
                    log::warn!("document_joined for unopened {document_id}");
                    return;
                };
                {
                    let mut st = doc_state.lock().expect("doc lock");
                    if st.schema != schema {
                        // The server knows this document under another
                        // schema; adopt it.
                        st.schema = schema;
                        st.doc = SharedDoc::new(schema, shared.client_id.clone());
                    }
                    if let Err(e) = st.doc.restore(Snapshot {
                        value: state,
                        version,
                    }) {
                        log::error!("snapshot for {document_id} rejected: {e}");
                        return;
                    }
                    st.pending.clear();
                }
                if let Some(waiter) = shared
                    .pending_joins
                    .lock()
                    .expect("joins lock")
                    .remove(&document_id)
                {
                    let _ = waiter.send(version);
                }
                shared.emit(SessionEvent::DocumentJoined {
                    document_id: document_id.clone(),
                    version,
                });
                shared.emit(SessionEvent::PresenceSnapshot { document_id, users });
            }

            ServerMessage::Operation {
                document_id,
                operation,
            } => {
                let known = {
                    let map = shared.docs.lock().expect("docs lock");
                    map.get(&document_id).cloned()
                };
                let Some(doc_state) = known else {
                    return;
                };
                {
                    let mut st = doc_state.lock().expect("doc lock");
                    // Rebase the remote op over everything we have applied
                    // locally but the server has not yet acknowledged.
                    let rebased = transform_against(&operation, st.pending.iter());
                    for op in &rebased {
                        if let Err(e) = st.doc.apply(op) {
                            log::error!(
                                "remote op {} unapplicable on {document_id}: {e}",
                                op.id
                            );
                        }
                    }
                }
                shared.emit(SessionEvent::RemoteOperation {
                    document_id,
                    operation,
                });
            }

            ServerMessage::OperationApplied {
                document_id,
                operation_id,
                version,
            } => {
                let known = {
                    let map = shared.docs.lock().expect("docs lock");
                    map.get(&document_id).cloned()
                };
                if let Some(doc_state) = known {
                    let mut st = doc_state.lock().expect("doc lock");
                    st.pending.retain(|p| p.id != operation_id);
                    st.doc.observe_version(version);
                }
                shared.emit(SessionEvent::OperationAcknowledged {
                    document_id,
                    operation_id,
                    version,
                });
            }

            ServerMessage::OperationFailed {
                document_id,
                operation_id,
                code,
                message,
            } => {
                let known = {
                    let map = shared.docs.lock().expect("docs lock");
                    map.get(&document_id).cloned()
                };
                if let Some(doc_state) = known {
                    let mut st = doc_state.lock().expect("doc lock");
                    st.pending.retain(|p| p.id != operation_id);
                }
                if code == ErrorCode::DocumentNotFound {
                    // Our base fell behind the trim horizon; rejoin for a
                    // fresh snapshot.
                    let schema = {
                        let map = shared.docs.lock().expect("docs lock");
                        map.get(&document_id)
                            .map(|s| s.lock().expect("doc lock").schema)
                    };
                    if let Some(schema) = schema {
                        let _ = shared.send(ClientMessage::JoinDocument {
                            document_id: document_id.clone(),
                            schema: Some(schema),
                        });
                    }
                }
                shared.emit(SessionEvent::OperationFailed {
                    document_id,
                    operation_id,
                    code,
                    message,
                });
            }

            ServerMessage::PresenceUpdate {
                document_id,
                presence,
            } => {
                shared.emit(SessionEvent::PresenceUpdated {
                    document_id,
                    presence,
                });
            }

            ServerMessage::PresenceState { document_id, users } => {
                shared.emit(SessionEvent::PresenceSnapshot { document_id, users });
            }

            ServerMessage::UserJoined { document_id, user } => {
                shared.emit(SessionEvent::UserJoined { document_id, user });
            }

            ServerMessage::UserLeft {
                document_id,
                client_id,
            } => {
                shared.emit(SessionEvent::UserLeft {
                    document_id,
                    client_id,
                });
            }

            ServerMessage::Error { code, message } => {
                shared.emit(SessionEvent::ServerError { code, message });
            }

            ServerMessage::Pong => {
                *shared.last_pong.lock().expect("pong lock") = Instant::now();
            }

            ServerMessage::DocumentLeft { .. } => {}

            ServerMessage::AuthRequired
            | ServerMessage::AuthSuccess { .. }
            | ServerMessage::AuthFailed { .. }
            | ServerMessage::DocumentState { .. } => {
                log::debug!("unexpected post-handshake frame ignored");
            }
        }
    }

    /// Open (or return the already-open handle for) a document.
    pub async fn open_document(
        &self,
        document_id: impl Into<DocumentId>,
        schema: Schema,
    ) -> Result<DocumentHandle, ClientError> {
        let document_id = document_id.into();

        // Idempotent: a second open returns the existing handle.
        if let Some(state) = self
            .shared
            .docs
            .lock()
            .expect("docs lock")
            .get(&document_id)
            .cloned()
        {
            return Ok(DocumentHandle {
                document_id,
                state,
                shared: self.shared.clone(),
            });
        }

        if self.state().await != SessionState::Connected {
            return Err(ClientError::NotConnected);
        }

        let state: SharedDocState = Arc::new(Mutex::new(DocState {
            schema,
            doc: SharedDoc::new(schema, self.shared.client_id.clone()),
            pending: Vec::new(),
        }));
        self.shared
            .docs
            .lock()
            .expect("docs lock")
            .insert(document_id.clone(), state.clone());

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending_joins
            .lock()
            .expect("joins lock")
            .insert(document_id.clone(), tx);

        let sent = self.shared.send(ClientMessage::JoinDocument {
            document_id: document_id.clone(),
            schema: Some(schema),
        });
        if let Err(e) = sent {
            self.forget_document(&document_id);
            return Err(e);
        }

        match timeout(self.shared.config.connection_timeout, rx).await {
            Ok(Ok(_version)) => Ok(DocumentHandle {
                document_id,
                state,
                shared: self.shared.clone(),
            }),
            Ok(Err(_)) | Err(_) => {
                self.forget_document(&document_id);
                Err(ClientError::Timeout)
            }
        }
    }

    fn forget_document(&self, document_id: &str) {
        self.shared
            .docs
            .lock()
            .expect("docs lock")
            .remove(document_id);
        self.shared
            .pending_joins
            .lock()
            .expect("joins lock")
            .remove(document_id);
    }

    /// Leave a document and drop its local state.
    pub async fn close_document(&self, document_id: &str) -> Result<(), ClientError> {
        self.forget_document(document_id);
        self.shared.send(ClientMessage::LeaveDocument {
            document_id: document_id.to_string(),
        })
    }

    /// Send a presence update; rapid cursor motion is coalesced.
    pub fn update_presence(
        &self,
        document_id: &str,
        cursor: Option<Cursor>,
    ) -> Result<(), ClientError> {
        if cursor.is_some() && !self.throttle.lock().expect("throttle lock").allow_cursor() {
            return Ok(()); // coalesced
        }
        let mut presence = Presence::new(self.shared.client_id.clone());
        presence.cursor = cursor;
        self.shared.send(ClientMessage::PresenceUpdate {
            document_id: document_id.to_string(),
            presence,
        })
    }

    /// Application-level keepalive.
    pub fn ping(&self) -> Result<(), ClientError> {
        self.shared.send(ClientMessage::Ping)
    }

    /// Cancel reconnection, leave all documents, close with 1000.
    pub async fn disconnect(&self) {
        self.shared.reconnect_enabled.store(false, Ordering::SeqCst);

        let doc_ids: Vec<DocumentId> = {
            let map = self.shared.docs.lock().expect("docs lock");
            map.keys().cloned().collect()
        };
        for document_id in doc_ids {
            let _ = self
                .shared
                .send(ClientMessage::LeaveDocument { document_id });
        }

        let outbound = self.shared.outbound.lock().expect("outbound lock").take();
        if let Some(tx) = outbound {
            let _ = tx.send(OutboundFrame::Close);
        }
        *self.shared.state.write().await = SessionState::Disconnected;
    }
}
