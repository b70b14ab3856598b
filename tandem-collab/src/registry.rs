//! Coordinator-scoped client registry and document membership index.
//!
//! The registry is touched on connect/disconnect/join/leave only — never on
//! hot-path operation delivery, which flows through per-document authority
//! mailboxes and per-client outbound queues.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};

use tandem_ot::{ClientId, DocumentId};

use crate::protocol::{ClientInfo, ServerMessage};

/// Write side of one connection's outbound queue plus its kill switch.
///
/// The queue is bounded: a peer that cannot drain it past the watermark is
/// kicked (close code 1011) instead of ever stalling an authority loop.
#[derive(Clone)]
pub struct ClientHandle {
    pub client_id: ClientId,
    out: mpsc::Sender<ServerMessage>,
    kick: mpsc::UnboundedSender<u16>,
}

/// Outcome of a non-blocking outbound enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Queue saturated: the peer was told to close with 1011.
    Saturated,
    /// The connection is gone.
    Closed,
}

impl ClientHandle {
    pub fn new(
        client_id: impl Into<ClientId>,
        out: mpsc::Sender<ServerMessage>,
        kick: mpsc::UnboundedSender<u16>,
    ) -> Self {
        ClientHandle {
            client_id: client_id.into(),
            out,
            kick,
        }
    }

    /// Enqueue without blocking. Backpressure policy: a full queue
    /// disconnects that peer only; other peers proceed.
    pub fn send(&self, msg: ServerMessage) -> SendOutcome {
        match self.out.try_send(msg) {
            Ok(()) => SendOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.kick.send(1011);
                SendOutcome::Saturated
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Ask the connection task to close with the given code.
    pub fn close(&self, code: u16) {
        let _ = self.kick.send(code);
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("client_id", &self.client_id)
            .finish()
    }
}

/// One connected client's registry record.
pub struct ClientRecord {
    pub info: ClientInfo,
    pub handle: ClientHandle,
    pub authenticated: bool,
    pub joined: HashSet<DocumentId>,
    pub last_activity: Instant,
}

/// Client registry plus the document → clients index.
#[derive(Default)]
pub struct Registry {
    clients: RwLock<HashMap<ClientId, ClientRecord>>,
    documents: RwLock<HashMap<DocumentId, HashSet<ClientId>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: ClientRecord) {
        let mut clients = self.clients.write().await;
        clients.insert(record.handle.client_id.clone(), record);
    }

    /// Remove a client, returning the documents it was joined to.
    pub async fn remove(&self, client_id: &str) -> Vec<DocumentId> {
        let joined = {
            let mut clients = self.clients.write().await;
            match clients.remove(client_id) {
                Some(record) => record.joined.into_iter().collect::<Vec<_>>(),
                None => Vec::new(),
            }
        };
        if !joined.is_empty() {
            let mut documents = self.documents.write().await;
            for doc in &joined {
                if let Some(members) = documents.get_mut(doc) {
                    members.remove(client_id);
                    if members.is_empty() {
                        documents.remove(doc);
                    }
                }
            }
        }
        joined
    }

    /// Whether a client currently sits in any document.
    pub async fn has_joined_any(&self, client_id: &str) -> bool {
        self.clients
            .read()
            .await
            .get(client_id)
            .is_some_and(|r| !r.joined.is_empty())
    }

    /// Re-key a session after AUTHENTICATE re-declared its client id.
    pub async fn rename(&self, old_id: &str, new_id: &str) -> bool {
        let mut clients = self.clients.write().await;
        match clients.remove(old_id) {
            Some(mut record) => {
                record.info.client_id = new_id.to_string();
                record.handle.client_id = new_id.to_string();
                clients.insert(new_id.to_string(), record);
                true
            }
            None => false,
        }
    }

    pub async fn set_authenticated(&self, client_id: &str, info: ClientInfo) {
        let mut clients = self.clients.write().await;
        if let Some(record) = clients.get_mut(client_id) {
            record.authenticated = true;
            record.info = info;
        }
    }

    pub async fn is_authenticated(&self, client_id: &str) -> bool {
        self.clients
            .read()
            .await
            .get(client_id)
            .is_some_and(|r| r.authenticated)
    }

    pub async fn info(&self, client_id: &str) -> Option<ClientInfo> {
        self.clients.read().await.get(client_id).map(|r| r.info.clone())
    }

    pub async fn touch(&self, client_id: &str) {
        let mut clients = self.clients.write().await;
        if let Some(record) = clients.get_mut(client_id) {
            record.last_activity = Instant::now();
        }
    }

    pub async fn join_document(&self, client_id: &str, document_id: &str) {
        {
            let mut clients = self.clients.write().await;
            if let Some(record) = clients.get_mut(client_id) {
                record.joined.insert(document_id.to_string());
            }
        }
        let mut documents = self.documents.write().await;
        documents
            .entry(document_id.to_string())
            .or_default()
            .insert(client_id.to_string());
    }

    pub async fn leave_document(&self, client_id: &str, document_id: &str) {
        {
            let mut clients = self.clients.write().await;
            if let Some(record) = clients.get_mut(client_id) {
                record.joined.remove(document_id);
            }
        }
        let mut documents = self.documents.write().await;
        if let Some(members) = documents.get_mut(document_id) {
            members.remove(client_id);
            if members.is_empty() {
                documents.remove(document_id);
            }
        }
    }

    pub async fn is_member(&self, client_id: &str, document_id: &str) -> bool {
        self.documents
            .read()
            .await
            .get(document_id)
            .is_some_and(|members| members.contains(client_id))
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<DocumentId> {
        let mut ids: Vec<DocumentId> = self.documents.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Clients idle longer than `max_idle`, for the periodic sweep.
    pub async fn idle_clients(&self, max_idle: std::time::Duration) -> Vec<ClientHandle> {
        self.clients
            .read()
            .await
            .values()
            .filter(|r| r.last_activity.elapsed() > max_idle)
            .map(|r| r.handle.clone())
            .collect()
    }
}

/// Coordinator-wide counters surfaced by `/health`.
#[derive(Debug)]
pub struct CoordinatorStats {
    started: Instant,
    pub total_connections: AtomicU64,
    pub total_messages: AtomicU64,
    pub total_operations: Arc<AtomicU64>,
}

impl Default for CoordinatorStats {
    fn default() -> Self {
        CoordinatorStats {
            started: Instant::now(),
            total_connections: AtomicU64::new(0),
            total_messages: AtomicU64::new(0),
            total_operations: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl CoordinatorStats {
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn record_connection(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message(&self) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn operations(&self) -> u64 {
        self.total_operations.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str, capacity: usize) -> (ClientHandle, mpsc::Receiver<ServerMessage>) {
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (kick_tx, _kick_rx) = mpsc::unbounded_channel();
        (ClientHandle::new(id, out_tx, kick_tx), out_rx)
    }

    fn record(id: &str) -> (ClientRecord, mpsc::Receiver<ServerMessage>) {
        let (h, rx) = handle(id, 8);
        (
            ClientRecord {
                info: ClientInfo::anonymous(id),
                handle: h,
                authenticated: false,
                joined: HashSet::new(),
                last_activity: Instant::now(),
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_insert_join_leave_remove() {
        let registry = Registry::new();
        let (rec, _rx) = record("c1");
        registry.insert(rec).await;
        registry.join_document("c1", "doc-1").await;
        assert!(registry.is_member("c1", "doc-1").await);
        assert_eq!(registry.active_documents().await, vec!["doc-1".to_string()]);

        registry.leave_document("c1", "doc-1").await;
        assert!(!registry.is_member("c1", "doc-1").await);
        assert!(registry.active_documents().await.is_empty());

        registry.join_document("c1", "doc-2").await;
        let joined = registry.remove("c1").await;
        assert_eq!(joined, vec!["doc-2".to_string()]);
        assert_eq!(registry.client_count().await, 0);
        assert!(registry.active_documents().await.is_empty());
    }

    #[tokio::test]
    async fn test_rename_rekeys_session() {
        let registry = Registry::new();
        let (rec, _rx) = record("server-minted");
        registry.insert(rec).await;
        assert!(registry.rename("server-minted", "declared").await);
        assert!(registry.info("declared").await.is_some());
        assert!(registry.info("server-minted").await.is_none());
        assert_eq!(
            registry.info("declared").await.unwrap().client_id,
            "declared"
        );
    }

    #[tokio::test]
    async fn test_authentication_flag() {
        let registry = Registry::new();
        let (rec, _rx) = record("c1");
        registry.insert(rec).await;
        assert!(!registry.is_authenticated("c1").await);
        registry
            .set_authenticated("c1", ClientInfo::anonymous("c1"))
            .await;
        assert!(registry.is_authenticated("c1").await);
    }

    #[tokio::test]
    async fn test_send_outcomes() {
        let (h, mut rx) = handle("c1", 1);
        assert_eq!(h.send(ServerMessage::Pong), SendOutcome::Sent);
        // Queue full → saturated.
        assert_eq!(h.send(ServerMessage::Pong), SendOutcome::Saturated);
        rx.recv().await.unwrap();
        drop(rx);
        assert_eq!(h.send(ServerMessage::Pong), SendOutcome::Closed);
    }

    #[tokio::test]
    async fn test_idle_clients() {
        let registry = Registry::new();
        let (mut rec, _rx) = record("c1");
        rec.last_activity = Instant::now() - std::time::Duration::from_secs(600);
        registry.insert(rec).await;
        let idle = registry.idle_clients(std::time::Duration::from_secs(300)).await;
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].client_id, "c1");
    }
}
