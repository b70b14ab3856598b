//! Persistence adapter contract and implementations.
//!
//! The document authority calls the adapter fail-soft: storage errors are
//! logged and never propagated to clients; in-memory state remains the
//! source of truth for an active document.
//!
//! ```text
//! ┌────────────────────┐   save_document / save_operation   ┌─────────────┐
//! │ DocumentAuthority  │ ─────────────────────────────────► │ Persistence │
//! │ (single writer)    │ ◄───────────────────────────────── │ adapter     │
//! └────────────────────┘   load_document / load_operations  └─────────────┘
//! ```

pub mod memory;
pub mod rocks;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use tandem_ot::{DocumentId, Operation, Schema, Version};

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// Durable form of a document: value snapshot plus bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDocument {
    pub id: DocumentId,
    pub schema: Schema,
    pub version: Version,
    pub value: Value,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Storage failures. Callers log these; they never reach clients.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// The persistence contract required from the host.
pub trait Persistence: Send + Sync {
    /// Persist the current document state (full snapshot).
    fn save_document(&self, doc: &StoredDocument) -> Result<(), StoreError>;

    /// Load a document's last persisted state, if any.
    fn load_document(&self, id: &str) -> Result<Option<StoredDocument>, StoreError>;

    /// Append an applied operation under its canonical version.
    fn save_operation(&self, id: &str, version: Version, op: &Operation) -> Result<(), StoreError>;

    /// Operations with applied version strictly greater than `since`,
    /// ordered by version.
    fn load_operations(&self, id: &str, since: Version) -> Result<Vec<Operation>, StoreError>;

    /// Remove a document and its operation log.
    fn delete_document(&self, id: &str) -> Result<(), StoreError>;

    /// Ids of all persisted documents.
    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError>;
}
