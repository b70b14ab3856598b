//! # tandem-ot — Operational transformation core for Tandem
//!
//! Pure algebra and state for real-time collaborative editing: no I/O, no
//! async, no global state.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────┐
//! │ shared::SharedDoc      │  optimistic local edits → Operation
//! │ (Text / List / Map)    │◄─ rehydrate from Snapshot
//! └───────────┬────────────┘
//!             │ apply / emit events
//! ┌───────────▼────────────┐
//! │ value::DocumentValue   │  application semantics (splice, move, set)
//! └───────────┬────────────┘
//!             │
//! ┌───────────▼────────────┐
//! │ transform / compose    │  TP1 rebasing, merging, conflict detection
//! │ (text, list, map)      │
//! └────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`operation`] — the tagged operation union and its wire layout
//! - [`value`] — document values and application semantics
//! - [`transform`] — transformation, composition, conflict detection
//! - [`shared`] — stateful SharedText / SharedList / SharedMap
//! - [`diff`] — prefix/suffix text diffing for wholesale edits

pub mod diff;
pub mod error;
pub mod operation;
pub mod shared;
pub mod transform;
pub mod value;

mod list;
mod map;
mod text;

pub use error::OtError;
pub use operation::{
    generate_client_id, generate_operation_id, is_valid_identifier, now_millis, Attributes,
    ClientId, DocumentId, MapEntryOp, OpBody, OpFamily, Operation, OperationId, Version,
};
pub use shared::{EventRegistry, SharedDoc, SharedEvent, SharedList, SharedMap, SharedText, Snapshot};
pub use transform::{can_merge, compose, compose_all, conflicts, transform, transform_against};
pub use value::{DocumentValue, Schema};
