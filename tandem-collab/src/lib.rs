//! # tandem-collab — Real-time collaboration layer for Tandem
//!
//! Keeps N concurrent editors converged on shared documents through
//! operational transformation (`tandem-ot`) and a central coordinator.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    JSON over WebSocket    ┌───────────────┐
//! │ CollabClient │ ◄───────────────────────► │  Coordinator  │
//! │ (per user)   │         at /ws            │  (central)    │
//! └──────┬───────┘                           └──────┬────────┘
//!        │                                          │ route by doc id
//! ┌──────▼───────┐                      ┌───────────▼───────────┐
//! │ SharedDoc    │                      │ DocumentAuthority     │
//! │ + pending    │                      │ (single writer:       │
//! │   buffer     │                      │  transform→apply→     │
//! └──────────────┘                      │  ack→broadcast)       │
//!                                       └───────────┬───────────┘
//!                                                   │ fail-soft
//!                                       ┌───────────▼───────────┐
//!                                       │ Persistence adapter   │
//!                                       │ (memory / RocksDB)    │
//!                                       └───────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire messages and error codes
//! - [`client`] — client session with pending buffer and reconnection
//! - [`authority`] — per-document single-writer actor
//! - [`server`] — coordinator: `/ws` endpoint, registries, HTTP surface
//! - [`presence`] — soft awareness state and coalescing
//! - [`auth`] — token gate and permission hooks
//! - [`storage`] — persistence contract, memory and RocksDB adapters

pub mod auth;
pub mod authority;
pub mod client;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod storage;

pub use auth::{AnyTokenAuth, AuthError, AuthService, OpenAuth, SharedSecretAuth};
pub use authority::{AuthorityConfig, AuthorityHandle, DocumentInfo, JoinReply};
pub use client::{
    ClientConfig, ClientError, CollabClient, DocumentHandle, ReconnectionConfig, SessionEvent,
    SessionState,
};
pub use presence::{Cursor, Presence, PresenceSet, PresenceThrottle};
pub use protocol::{
    ClientEnvelope, ClientInfo, ClientMessage, ErrorCode, ProtocolError, ServerEnvelope,
    ServerMessage, WS_PATH,
};
pub use registry::{ClientHandle, CoordinatorStats, Registry, SendOutcome};
pub use server::{run, Coordinator, CoordinatorConfig};
pub use storage::{MemoryStore, Persistence, RocksStore, StoreConfig, StoreError, StoredDocument};
