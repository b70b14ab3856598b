//! Per-document authority: the single writer for canonical state.
//!
//! One actor per live document. All mutating access is serialized through
//! its mailbox; transform → apply → acknowledge → broadcast happen inside
//! one loop iteration, which is what makes the ordering guarantees hold:
//!
//! - every peer observes broadcasts in applied-version order,
//! - an originator sees OPERATION_APPLIED for its op before any broadcast
//!   of a later op that transformed against it,
//! - operations from one author are never reordered.
//!
//! ```text
//!        apply/join/leave/presence            per-client bounded queues
//! ────────────► mailbox ───► [ transform → apply → persist ] ───► peers
//!                                                    │
//!                                              fail-soft store
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use tandem_ot::{
    now_millis, transform_against, ClientId, DocumentId, DocumentValue, Operation, Schema, Version,
};

use crate::presence::{Presence, PresenceSet};
use crate::protocol::{ClientInfo, ErrorCode, ServerMessage};
use crate::registry::{ClientHandle, SendOutcome};
use crate::storage::{Persistence, StoredDocument};

/// Tuning for a document authority.
#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    /// Trim `recent_ops` when it grows past this…
    pub ops_high_water: usize,
    /// …down to this many retained operations.
    pub ops_low_water: usize,
    /// Mailbox depth before senders await.
    pub mailbox_capacity: usize,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            ops_high_water: 1000,
            ops_low_water: 500,
            mailbox_capacity: 256,
        }
    }
}

/// Reply to a successful join.
#[derive(Debug, Clone)]
pub struct JoinReply {
    pub version: Version,
    pub state: Value,
    pub schema: Schema,
    pub users: Vec<Presence>,
}

/// Point-in-time document facts for the HTTP surface and the sweeper.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentInfo {
    pub id: DocumentId,
    pub version: Version,
    pub client_count: usize,
    pub created_at: u64,
    pub updated_at: u64,
}

enum Request {
    Join {
        info: ClientInfo,
        handle: ClientHandle,
        reply: oneshot::Sender<JoinReply>,
    },
    Leave {
        client_id: ClientId,
    },
    Apply {
        client_id: ClientId,
        operation: Operation,
    },
    Presence {
        client_id: ClientId,
        presence: Presence,
    },
    Info {
        reply: oneshot::Sender<DocumentInfo>,
    },
    Shutdown,
}

/// Cheap handle for routing requests into an authority's mailbox.
#[derive(Clone)]
pub struct AuthorityHandle {
    pub document_id: DocumentId,
    tx: mpsc::Sender<Request>,
}

impl AuthorityHandle {
    pub async fn join(&self, info: ClientInfo, handle: ClientHandle) -> Option<JoinReply> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Join {
                info,
                handle,
                reply,
            })
            .await
            .ok()?;
        rx.await.ok()
    }

    pub async fn leave(&self, client_id: impl Into<ClientId>) {
        let _ = self
            .tx
            .send(Request::Leave {
                client_id: client_id.into(),
            })
            .await;
    }

    pub async fn apply(&self, client_id: impl Into<ClientId>, operation: Operation) {
        let _ = self
            .tx
            .send(Request::Apply {
                client_id: client_id.into(),
                operation,
            })
            .await;
    }

    pub async fn presence(&self, client_id: impl Into<ClientId>, presence: Presence) {
        let _ = self
            .tx
            .send(Request::Presence {
                client_id: client_id.into(),
                presence,
            })
            .await;
    }

    pub async fn info(&self) -> Option<DocumentInfo> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Request::Info { reply }).await.ok()?;
        rx.await.ok()
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Request::Shutdown).await;
    }

    /// True once the actor has stopped (evicted document).
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the authority actor for `document_id`, rehydrating from
/// persistence when a stored copy exists.
pub fn spawn_authority(
    document_id: DocumentId,
    schema_hint: Option<Schema>,
    store: Arc<dyn Persistence>,
    config: AuthorityConfig,
    op_counter: Arc<AtomicU64>,
) -> AuthorityHandle {
    let (tx, rx) = mpsc::channel(config.mailbox_capacity);
    let handle = AuthorityHandle {
        document_id: document_id.clone(),
        tx,
    };
    tokio::spawn(async move {
        let mut authority = Authority::load(document_id, schema_hint, store, config, op_counter);
        authority.run(rx).await;
    });
    handle
}

struct AppliedOp {
    version: Version,
    op: Operation,
}

struct Authority {
    id: DocumentId,
    schema: Schema,
    value: DocumentValue,
    version: Version,
    recent: VecDeque<AppliedOp>,
    clients: HashMap<ClientId, ClientHandle>,
    presence: PresenceSet,
    store: Arc<dyn Persistence>,
    config: AuthorityConfig,
    created_at: u64,
    updated_at: u64,
    op_counter: Arc<AtomicU64>,
}

impl Authority {
    fn load(
        id: DocumentId,
        schema_hint: Option<Schema>,
        store: Arc<dyn Persistence>,
        config: AuthorityConfig,
        op_counter: Arc<AtomicU64>,
    ) -> Self {
        let now = now_millis();
        let mut authority = match store.load_document(&id) {
            Ok(Some(stored)) => {
                let value = DocumentValue::from_json(stored.schema, stored.value)
                    .unwrap_or_else(|e| {
                        log::error!("document {id}: corrupt snapshot ({e}), starting fresh");
                        stored.schema.initial_value()
                    });
                log::info!("document {id}: rehydrated at version {}", stored.version);
                Authority {
                    id,
                    schema: stored.schema,
                    value,
                    version: stored.version,
                    recent: VecDeque::new(),
                    clients: HashMap::new(),
                    presence: PresenceSet::new(),
                    store,
                    config,
                    created_at: stored.created_at,
                    updated_at: stored.updated_at,
                    op_counter,
                }
            }
            Ok(None) => {
                let schema = schema_hint.unwrap_or_default();
                Authority {
                    id,
                    schema,
                    value: schema.initial_value(),
                    version: 0,
                    recent: VecDeque::new(),
                    clients: HashMap::new(),
                    presence: PresenceSet::new(),
                    store,
                    config,
                    created_at: now,
                    updated_at: now,
                    op_counter,
                }
            }
            Err(e) => {
                log::error!("document {id}: load failed ({e}), starting fresh");
                let schema = schema_hint.unwrap_or_default();
                Authority {
                    id,
                    schema,
                    value: schema.initial_value(),
                    version: 0,
                    recent: VecDeque::new(),
                    clients: HashMap::new(),
                    presence: PresenceSet::new(),
                    store,
                    config,
                    created_at: now,
                    updated_at: now,
                    op_counter,
                }
            }
        };
        authority.replay_tail();
        authority
    }

    /// Apply operations persisted after the last snapshot (snapshot writes
    /// are fail-soft, so the log can run ahead of it).
    fn replay_tail(&mut self) {
        let tail = match self.store.load_operations(&self.id, self.version) {
            Ok(tail) => tail,
            Err(e) => {
                log::error!("document {}: operation tail load failed: {e}", self.id);
                return;
            }
        };
        for op in tail {
            match self.value.apply(&op) {
                Ok(()) => {
                    self.version += 1;
                    self.recent.push_back(AppliedOp {
                        version: self.version,
                        op,
                    });
                }
                Err(e) => {
                    log::error!(
                        "document {}: skipping unreplayable stored op: {e}",
                        self.id
                    );
                }
            }
        }
    }

    async fn run(&mut self, mut rx: mpsc::Receiver<Request>) {
        while let Some(request) = rx.recv().await {
            match request {
                Request::Join {
                    info,
                    handle,
                    reply,
                } => self.handle_join(info, handle, reply),
                Request::Leave { client_id } => self.handle_leave(&client_id),
                Request::Apply {
                    client_id,
                    operation,
                } => self.handle_apply(&client_id, operation),
                Request::Presence {
                    client_id,
                    presence,
                } => self.handle_presence(&client_id, presence),
                Request::Info { reply } => {
                    let _ = reply.send(self.info());
                }
                Request::Shutdown => {
                    // The sweeper races with late joins; eviction only
                    // proceeds when nobody is attached.
                    if self.clients.is_empty() {
                        break;
                    }
                    log::debug!(
                        "document {}: shutdown ignored, {} clients attached",
                        self.id,
                        self.clients.len()
                    );
                }
            }
        }
        self.persist_document();
        log::debug!("document {}: authority stopped at version {}", self.id, self.version);
    }

    fn info(&self) -> DocumentInfo {
        DocumentInfo {
            id: self.id.clone(),
            version: self.version,
            client_count: self.clients.len(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Oldest base version `recent` can still rebase against.
    fn horizon(&self) -> Version {
        self.version - self.recent.len() as Version
    }

    fn handle_join(
        &mut self,
        info: ClientInfo,
        handle: ClientHandle,
        reply: oneshot::Sender<JoinReply>,
    ) {
        let client_id = handle.client_id.clone();
        let user = self.presence.update(Presence::from_info(&info));

        let joined = JoinReply {
            version: self.version,
            state: self.value.to_json(),
            schema: self.schema,
            users: self.presence.list(),
        };
        // DOCUMENT_JOINED goes through the client's own queue, from inside
        // this loop, so no later broadcast can overtake the snapshot.
        let _ = handle.send(ServerMessage::DocumentJoined {
            document_id: self.id.clone(),
            version: joined.version,
            state: joined.state.clone(),
            schema: joined.schema,
            users: joined.users.clone(),
        });
        self.clients.insert(client_id.clone(), handle);
        let _ = reply.send(joined);

        self.broadcast(
            ServerMessage::UserJoined {
                document_id: self.id.clone(),
                user,
            },
            Some(&client_id),
        );
        log::info!(
            "document {}: {client_id} joined ({} clients)",
            self.id,
            self.clients.len()
        );
    }

    fn handle_leave(&mut self, client_id: &str) {
        if self.clients.remove(client_id).is_none() {
            return;
        }
        self.presence.remove(client_id);
        self.broadcast(
            ServerMessage::UserLeft {
                document_id: self.id.clone(),
                client_id: client_id.to_string(),
            },
            None,
        );
        log::info!(
            "document {}: {client_id} left ({} clients)",
            self.id,
            self.clients.len()
        );
        if self.clients.is_empty() {
            self.persist_document();
        }
    }

    fn handle_apply(&mut self, client_id: &str, mut operation: Operation) {
        let Some(origin) = self.clients.get(client_id).cloned() else {
            log::warn!(
                "document {}: op from {client_id} which is not attached, dropping",
                self.id
            );
            return;
        };
        // The session identity is authoritative for tie-breaking.
        operation.client_id = client_id.to_string();
        let operation_id = operation.id.clone();

        if operation.base_version > self.version {
            self.reject(
                &origin,
                &operation_id,
                ErrorCode::InvalidOperation,
                format!(
                    "base version {} is ahead of document version {}",
                    operation.base_version, self.version
                ),
            );
            return;
        }
        if operation.base_version < self.horizon() {
            // The retained window no longer covers this base; the client
            // must rejoin from a fresh snapshot.
            self.reject(
                &origin,
                &operation_id,
                ErrorCode::DocumentNotFound,
                format!(
                    "base version {} predates retained history (oldest {})",
                    operation.base_version,
                    self.horizon()
                ),
            );
            return;
        }

        // Rebase over everything applied since the author's base version.
        let skip = (operation.base_version - self.horizon()) as usize;
        let parts = transform_against(&operation, self.recent.iter().skip(skip).map(|a| &a.op));

        // Dry-run all fragments so a post-transform range failure leaves
        // value and version untouched.
        let mut staged = self.value.clone();
        for part in &parts {
            if let Err(e) = staged.apply(part) {
                log::warn!("document {}: rejected op {operation_id}: {e}", self.id);
                self.reject(&origin, &operation_id, ErrorCode::InvalidOperation, e.to_string());
                return;
            }
        }
        self.value = staged;

        let mut applied = Vec::with_capacity(parts.len());
        for mut part in parts {
            part.base_version = self.version;
            self.version += 1;
            if let Err(e) = self.store.save_operation(&self.id, self.version, &part) {
                log::error!("document {}: saving op failed: {e}", self.id);
            }
            self.recent.push_back(AppliedOp {
                version: self.version,
                op: part.clone(),
            });
            applied.push(part);
        }
        self.updated_at = now_millis();
        self.op_counter.fetch_add(1, Ordering::Relaxed);
        self.trim_recent();
        self.persist_document();

        // Acknowledge first: the originator must see its ack before any
        // later broadcast that transformed against this op.
        let ack = ServerMessage::OperationApplied {
            document_id: self.id.clone(),
            operation_id,
            version: self.version,
        };
        if origin.send(ack) != SendOutcome::Sent {
            self.drop_client(client_id);
        }
        for part in applied {
            self.broadcast(
                ServerMessage::Operation {
                    document_id: self.id.clone(),
                    operation: part,
                },
                Some(client_id),
            );
        }
    }

    fn handle_presence(&mut self, client_id: &str, mut presence: Presence) {
        if !self.clients.contains_key(client_id) {
            return;
        }
        presence.stamp(client_id);
        let stored = self.presence.update(presence);
        self.broadcast(
            ServerMessage::PresenceUpdate {
                document_id: self.id.clone(),
                presence: stored,
            },
            Some(client_id),
        );
    }

    fn trim_recent(&mut self) {
        if self.recent.len() > self.config.ops_high_water {
            let drop_count = self.recent.len() - self.config.ops_low_water;
            self.recent.drain(..drop_count);
            log::debug!(
                "document {}: trimmed {drop_count} ops, horizon now {}",
                self.id,
                self.horizon()
            );
        }
    }

    /// Fan out to every joined client except `exclude`. Peers whose queue
    /// is saturated or gone are dropped; nobody else waits for them.
    fn broadcast(&mut self, msg: ServerMessage, exclude: Option<&str>) {
        let mut dead = Vec::new();
        for (client_id, handle) in &self.clients {
            if exclude == Some(client_id.as_str()) {
                continue;
            }
            match handle.send(msg.clone()) {
                SendOutcome::Sent => {}
                SendOutcome::Saturated => {
                    log::warn!(
                        "document {}: {client_id} outbound queue saturated, disconnecting",
                        self.id
                    );
                    dead.push(client_id.clone());
                }
                SendOutcome::Closed => dead.push(client_id.clone()),
            }
        }
        for client_id in dead {
            self.drop_client(&client_id);
        }
    }

    fn drop_client(&mut self, client_id: &str) {
        if self.clients.remove(client_id).is_some() {
            self.presence.remove(client_id);
            self.broadcast(
                ServerMessage::UserLeft {
                    document_id: self.id.clone(),
                    client_id: client_id.to_string(),
                },
                None,
            );
        }
    }

    fn reject(&self, origin: &ClientHandle, operation_id: &str, code: ErrorCode, message: String) {
        let _ = origin.send(ServerMessage::OperationFailed {
            document_id: self.id.clone(),
            operation_id: operation_id.to_string(),
            code,
            message,
        });
    }

    /// Best-effort snapshot write; the in-memory copy stays authoritative.
    fn persist_document(&self) {
        let stored = StoredDocument {
            id: self.id.clone(),
            schema: self.schema,
            version: self.version,
            value: self.value.to_json(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        };
        if let Err(e) = self.store.save_document(&stored) {
            log::error!("document {}: snapshot save failed: {e}", self.id);
        }
    }
}
