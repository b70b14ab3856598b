//! The coordinator: WebSocket accept point, message routing, registries.
//!
//! ```text
//! Client A ──┐                       ┌── DocumentAuthority "doc-1"
//!            ├── axum /ws ── dispatch ┤
//! Client B ──┘        │              └── DocumentAuthority "doc-2"
//!                     │
//!              ┌──────┴───────┐
//!              │ Registry     │  clients, doc→clients index
//!              │ AuthService  │  token + access/edit gates
//!              │ Persistence  │  fail-soft storage
//!              └──────────────┘
//! ```
//!
//! Each connection runs one task that owns the socket: inbound frames are
//! dispatched from it, outbound frames drain from the connection's bounded
//! queue, and a kick channel lets authorities force-close a saturated or
//! idle peer. Authorities broadcast from their own single-writer loops;
//! the coordinator never touches document state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tower_http::cors::CorsLayer;

use tandem_ot::{is_valid_identifier, now_millis, ClientId, DocumentId, Schema};

use crate::auth::{AnyTokenAuth, AuthService, OpenAuth, SharedSecretAuth};
use crate::authority::{spawn_authority, AuthorityConfig, AuthorityHandle};
use crate::protocol::{
    ClientEnvelope, ClientInfo, ClientMessage, ErrorCode, ServerEnvelope, ServerMessage, WS_PATH,
};
use crate::registry::{ClientHandle, ClientRecord, CoordinatorStats, Registry};
use crate::storage::{MemoryStore, Persistence, RocksStore, StoreConfig, StoreError};

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Interface to bind.
    pub host: String,
    /// Port to bind (0 picks a free port).
    pub port: u16,
    /// Require AUTHENTICATE before joins.
    pub auth_required: bool,
    /// Shared secret tokens must match (when auth is required).
    pub auth_secret: Option<String>,
    /// Allowed CORS origin for the HTTP surface (None = no CORS layer).
    pub cors_origin: Option<String>,
    /// RocksDB directory (None = in-memory persistence).
    pub storage_path: Option<PathBuf>,
    /// Sessions idle longer than this are swept.
    pub idle_timeout: Duration,
    /// Sweep cadence.
    pub sweep_interval: Duration,
    /// Outbound queue depth per connection.
    pub outbound_capacity: usize,
    /// Per-document authority tuning.
    pub authority: AuthorityConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            auth_required: false,
            auth_secret: None,
            cors_origin: None,
            storage_path: None,
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            outbound_capacity: 64,
            authority: AuthorityConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Top-level server object owning every subsystem.
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Registry,
    authorities: RwLock<HashMap<DocumentId, AuthorityHandle>>,
    auth: Arc<dyn AuthService>,
    store: Arc<dyn Persistence>,
    stats: CoordinatorStats,
}

impl Coordinator {
    /// Build a coordinator, selecting storage and auth from the config.
    pub fn new(config: CoordinatorConfig) -> Result<Arc<Self>, StoreError> {
        let store: Arc<dyn Persistence> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemoryStore::new()),
        };
        let auth: Arc<dyn AuthService> = if config.auth_required {
            match &config.auth_secret {
                Some(secret) => Arc::new(SharedSecretAuth::new(secret.clone())),
                None => Arc::new(AnyTokenAuth),
            }
        } else {
            Arc::new(OpenAuth)
        };
        Ok(Self::with_services(config, store, auth))
    }

    /// Build with host-provided persistence and auth implementations.
    pub fn with_services(
        config: CoordinatorConfig,
        store: Arc<dyn Persistence>,
        auth: Arc<dyn AuthService>,
    ) -> Arc<Self> {
        Arc::new(Coordinator {
            config,
            registry: Registry::new(),
            authorities: RwLock::new(HashMap::new()),
            auth,
            store,
            stats: CoordinatorStats::default(),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Bind and serve until `shutdown` resolves.
    pub async fn serve(
        self: Arc<Self>,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        self.serve_on(listener, shutdown).await
    }

    /// Serve on an already-bound listener (tests bind port 0 themselves).
    pub async fn serve_on(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        match self.store.list_documents() {
            Ok(ids) if !ids.is_empty() => {
                log::info!("{} persisted documents available", ids.len())
            }
            Ok(_) => {}
            Err(e) => log::error!("listing persisted documents failed: {e}"),
        }
        log::info!("coordinator listening on {addr} (ws at {WS_PATH})");

        let sweeper = tokio::spawn(self.clone().sweep_loop());
        let result = axum::serve(listener, self.clone().router())
            .with_graceful_shutdown(shutdown)
            .await;
        sweeper.abort();
        log::info!("coordinator stopped");
        result
    }

    fn router(self: Arc<Self>) -> Router {
        let router = Router::new()
            .route(WS_PATH, get(ws_upgrade))
            .route("/health", get(health))
            .route("/documents", get(list_documents))
            .route("/documents/{id}", get(document_info))
            .with_state(self.clone());
        match &self.config.cors_origin {
            Some(origin) if origin == "*" => router.layer(CorsLayer::permissive()),
            Some(origin) => match origin.parse::<axum::http::HeaderValue>() {
                Ok(value) => router.layer(CorsLayer::new().allow_origin(value)),
                Err(_) => {
                    log::warn!("invalid CORS origin {origin:?}, layer disabled");
                    router
                }
            },
            None => router,
        }
    }

    /// Periodic sweep: drop idle sessions and evict empty authorities.
    async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.tick().await; // immediate first tick is a no-op
        loop {
            ticker.tick().await;
            for handle in self.registry.idle_clients(self.config.idle_timeout).await {
                log::info!("sweeping idle session {}", handle.client_id);
                handle.close(1000);
            }

            let handles: Vec<AuthorityHandle> = {
                let map = self.authorities.read().await;
                map.values().cloned().collect()
            };
            for handle in handles {
                if let Some(info) = handle.info().await {
                    if info.client_count == 0 {
                        handle.shutdown().await;
                    }
                }
            }
            let mut map = self.authorities.write().await;
            map.retain(|_, handle| !handle.is_closed());
        }
    }

    /// Get or lazily create the authority for a document.
    async fn authority_for(&self, document_id: &str, schema: Option<Schema>) -> AuthorityHandle {
        // Fast path: read lock.
        {
            let map = self.authorities.read().await;
            if let Some(handle) = map.get(document_id) {
                if !handle.is_closed() {
                    return handle.clone();
                }
            }
        }
        // Slow path: write lock, re-check, spawn.
        let mut map = self.authorities.write().await;
        if let Some(handle) = map.get(document_id) {
            if !handle.is_closed() {
                return handle.clone();
            }
        }
        let handle = spawn_authority(
            document_id.to_string(),
            schema,
            self.store.clone(),
            self.config.authority.clone(),
            self.stats.total_operations.clone(),
        );
        map.insert(document_id.to_string(), handle.clone());
        handle
    }

    async fn authority_if_live(&self, document_id: &str) -> Option<AuthorityHandle> {
        let map = self.authorities.read().await;
        map.get(document_id)
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    /// Drive one accepted WebSocket connection to completion.
    async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        self.stats.record_connection();
        let mut client_id: ClientId = tandem_ot::generate_client_id();

        let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(self.config.outbound_capacity);
        let (kick_tx, mut kick_rx) = mpsc::unbounded_channel::<u16>();
        let mut handle = ClientHandle::new(client_id.clone(), out_tx, kick_tx);

        self.registry
            .insert(ClientRecord {
                info: ClientInfo::anonymous(client_id.clone()),
                handle: handle.clone(),
                authenticated: !self.config.auth_required,
                joined: Default::default(),
                last_activity: std::time::Instant::now(),
            })
            .await;
        log::info!("connection established as {client_id}");

        let (mut ws_out, mut ws_in) = socket.split();
        if self.config.auth_required {
            let _ = handle.send(ServerMessage::AuthRequired);
        }

        loop {
            tokio::select! {
                inbound = ws_in.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            self.stats.record_message();
                            self.registry.touch(&client_id).await;
                            match ClientEnvelope::decode(text.as_str()) {
                                Ok(envelope) => {
                                    self.dispatch(&mut client_id, &mut handle, envelope.msg).await;
                                }
                                Err(e) => {
                                    log::warn!("{client_id}: undecodable frame: {e}");
                                    let _ = handle.send(ServerMessage::Error {
                                        code: ErrorCode::InvalidOperation,
                                        message: "malformed message".into(),
                                    });
                                }
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = ws_out.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {} // binary frames are not part of the protocol
                        Some(Err(e)) => {
                            log::debug!("{client_id}: socket error: {e}");
                            break;
                        }
                    }
                }
                outbound = out_rx.recv() => {
                    match outbound {
                        Some(msg) => {
                            let frame = match ServerEnvelope::new(msg).encode() {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::error!("{client_id}: encoding outbound frame failed: {e}");
                                    continue;
                                }
                            };
                            if ws_out.send(Message::Text(frame.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                code = kick_rx.recv() => {
                    let code = code.unwrap_or(1000);
                    let _ = ws_out
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: axum::extract::ws::Utf8Bytes::from_static("closed by server"),
                        })))
                        .await;
                    break;
                }
            }
        }

        // Disconnect: leave every joined document, firing USER_LEFT, then
        // forget the session.
        let joined = self.registry.remove(&client_id).await;
        for document_id in joined {
            if let Some(authority) = self.authority_if_live(&document_id).await {
                authority.leave(client_id.clone()).await;
            }
        }
        log::info!("connection closed for {client_id}");
    }

    /// The inbound dispatch table.
    async fn dispatch(
        self: &Arc<Self>,
        client_id: &mut ClientId,
        handle: &mut ClientHandle,
        msg: ClientMessage,
    ) {
        match msg {
            ClientMessage::Authenticate {
                client_id: declared,
                token,
            } => {
                if let Some(declared) = declared {
                    if declared != *client_id {
                        if !is_valid_identifier(&declared) {
                            let _ = handle.send(ServerMessage::AuthFailed {
                                reason: "invalid client id".into(),
                            });
                            return;
                        }
                        // Re-declaring after joining documents would leave
                        // authority membership keyed by the old identity.
                        if self.registry.has_joined_any(client_id).await {
                            log::warn!("{client_id}: id re-declaration after join ignored");
                        } else if self.registry.rename(client_id, &declared).await {
                            log::debug!("{client_id} re-declared as {declared}");
                            *client_id = declared.clone();
                            handle.client_id = declared;
                        }
                    }
                }
                match self.auth.authenticate(client_id, token.as_deref()) {
                    Ok(info) => {
                        self.registry.set_authenticated(client_id, info.clone()).await;
                        let _ = handle.send(ServerMessage::AuthSuccess { client_info: info });
                    }
                    Err(e) => {
                        let _ = handle.send(ServerMessage::AuthFailed {
                            reason: e.to_string(),
                        });
                    }
                }
            }

            ClientMessage::JoinDocument {
                document_id,
                schema,
            } => {
                if !self.registry.is_authenticated(client_id).await {
                    let _ = handle.send(ServerMessage::Error {
                        code: ErrorCode::Unauthorized,
                        message: "authenticate first".into(),
                    });
                    return;
                }
                if !is_valid_identifier(&document_id) {
                    let _ = handle.send(ServerMessage::Error {
                        code: ErrorCode::InvalidOperation,
                        message: format!("invalid document id {document_id:?}"),
                    });
                    return;
                }
                let info = self
                    .registry
                    .info(client_id)
                    .await
                    .unwrap_or_else(|| ClientInfo::anonymous(client_id.clone()));
                if !self.auth.can_access(&info, &document_id) {
                    let _ = handle.send(ServerMessage::Error {
                        code: ErrorCode::Forbidden,
                        message: format!("access to {document_id} denied"),
                    });
                    return;
                }
                let authority = self.authority_for(&document_id, schema).await;
                // DOCUMENT_JOINED arrives through the outbound queue; the
                // reply only confirms membership for the registry.
                match authority.join(info, handle.clone()).await {
                    Some(_) => {
                        self.registry.join_document(client_id, &document_id).await;
                    }
                    None => {
                        let _ = handle.send(ServerMessage::Error {
                            code: ErrorCode::ServerError,
                            message: "document unavailable".into(),
                        });
                    }
                }
            }

            ClientMessage::LeaveDocument { document_id } => {
                if let Some(authority) = self.authority_if_live(&document_id).await {
                    authority.leave(client_id.clone()).await;
                }
                self.registry.leave_document(client_id, &document_id).await;
                let _ = handle.send(ServerMessage::DocumentLeft { document_id });
            }

            ClientMessage::Operation {
                document_id,
                operation,
            } => {
                if !self.registry.is_member(client_id, &document_id).await {
                    let _ = handle.send(ServerMessage::Error {
                        code: ErrorCode::Forbidden,
                        message: format!("not joined to {document_id}"),
                    });
                    return;
                }
                let info = self
                    .registry
                    .info(client_id)
                    .await
                    .unwrap_or_else(|| ClientInfo::anonymous(client_id.clone()));
                if !self.auth.can_edit(&info, &document_id) {
                    let _ = handle.send(ServerMessage::Error {
                        code: ErrorCode::Forbidden,
                        message: format!("editing {document_id} denied"),
                    });
                    return;
                }
                let authority = self.authority_for(&document_id, None).await;
                authority.apply(client_id.clone(), operation).await;
            }

            ClientMessage::PresenceUpdate {
                document_id,
                presence,
            } => {
                if !self.registry.is_member(client_id, &document_id).await {
                    return; // presence is soft state, drop silently
                }
                if let Some(authority) = self.authority_if_live(&document_id).await {
                    authority.presence(client_id.clone(), presence).await;
                }
            }

            ClientMessage::Ping => {
                let _ = handle.send(ServerMessage::Pong);
            }
        }
    }
}

// ─── HTTP surface (auxiliary) ───────────────────────────────────────────

async fn ws_upgrade(
    State(coordinator): State<Arc<Coordinator>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| coordinator.handle_socket(socket))
}

async fn health(State(coordinator): State<Arc<Coordinator>>) -> Response {
    let connected = coordinator.registry.client_count().await;
    let active = {
        let map = coordinator.authorities.read().await;
        map.values().filter(|h| !h.is_closed()).count()
    };
    Json(json!({
        "status": "ok",
        "timestamp": now_millis(),
        "connectedClients": connected,
        "activeDocuments": active,
        "totalOperations": coordinator.stats.operations(),
        "uptime": coordinator.stats.uptime_secs(),
    }))
    .into_response()
}

async fn list_documents(State(coordinator): State<Arc<Coordinator>>) -> Response {
    let ids: Vec<DocumentId> = {
        let map = coordinator.authorities.read().await;
        let mut ids: Vec<DocumentId> = map
            .iter()
            .filter(|(_, handle)| !handle.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    };
    Json(json!({ "documents": ids })).into_response()
}

async fn document_info(
    State(coordinator): State<Arc<Coordinator>>,
    Path(id): Path<String>,
) -> Response {
    match coordinator.authority_if_live(&id).await {
        Some(handle) => match handle.info().await {
            Some(info) => Json(info).into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Convenience used by `main` and tests: serve until ctrl-c.
pub async fn run(config: CoordinatorConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let coordinator = Coordinator::new(config)?;
    coordinator
        .serve(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.bind_addr(), "127.0.0.1:8080");
        assert!(!config.auth_required);
        assert!(config.storage_path.is_none());
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.outbound_capacity, 64);
    }

    #[tokio::test]
    async fn test_coordinator_builds_with_memory_store() {
        let coordinator = Coordinator::new(CoordinatorConfig::default()).unwrap();
        assert_eq!(coordinator.registry.client_count().await, 0);
        assert!(coordinator.store.list_documents().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_authority_for_is_idempotent() {
        let coordinator = Coordinator::new(CoordinatorConfig::default()).unwrap();
        let first = coordinator.authority_for("doc-1", Some(Schema::Text)).await;
        let second = coordinator.authority_for("doc-1", None).await;
        assert_eq!(first.document_id, second.document_id);
        assert!(!first.is_closed());
        {
            let map = coordinator.authorities.read().await;
            assert_eq!(map.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_authority_respawns_after_eviction() {
        let coordinator = Coordinator::new(CoordinatorConfig::default()).unwrap();
        let first = coordinator.authority_for("doc-1", Some(Schema::Text)).await;
        first.shutdown().await;
        for _ in 0..50 {
            if first.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(first.is_closed());
        let second = coordinator.authority_for("doc-1", None).await;
        assert!(!second.is_closed());
    }
}
