//! Presence: soft, ephemeral per-client, per-document awareness state.
//!
//! Presence carries identity and cursor metadata for "who is looking at
//! what". It is never persisted, carries no ordering guarantees beyond
//! FIFO per sender, is lost on disconnect and rebuilt on join. Rapid
//! cursor updates from the same sender are coalesced client-side.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use tandem_ot::{now_millis, ClientId};

use crate::protocol::ClientInfo;

/// Cursor position with optional selection range `[anchor, head]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub position: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<(usize, usize)>,
}

impl Cursor {
    pub fn at(position: usize) -> Self {
        Cursor {
            position,
            selection: None,
        }
    }

    pub fn with_selection(position: usize, anchor: usize, head: usize) -> Self {
        Cursor {
            position,
            selection: Some((anchor, head)),
        }
    }
}

/// One client's presence inside one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub client_id: ClientId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    #[serde(default)]
    pub last_seen: u64,
    #[serde(default)]
    pub is_online: bool,
}

impl Presence {
    pub fn new(client_id: impl Into<ClientId>) -> Self {
        Presence {
            client_id: client_id.into(),
            user_id: None,
            name: None,
            avatar: None,
            cursor: None,
            last_seen: now_millis(),
            is_online: true,
        }
    }

    pub fn from_info(info: &ClientInfo) -> Self {
        Presence {
            client_id: info.client_id.clone(),
            user_id: info.user_id.clone(),
            name: info.name.clone(),
            avatar: info.avatar.clone(),
            cursor: None,
            last_seen: now_millis(),
            is_online: true,
        }
    }

    pub fn with_cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
        self
    }

    /// Server-side stamp applied before indexing and broadcast.
    pub fn stamp(&mut self, client_id: &str) {
        self.client_id = client_id.to_string();
        self.last_seen = now_millis();
        self.is_online = true;
    }
}

/// Per-document presence index, owned by the document authority.
#[derive(Debug, Default)]
pub struct PresenceSet {
    entries: HashMap<ClientId, Presence>,
}

impl PresenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a client's presence; returns the stored record.
    pub fn update(&mut self, presence: Presence) -> Presence {
        self.entries
            .insert(presence.client_id.clone(), presence.clone());
        presence
    }

    pub fn remove(&mut self, client_id: &str) -> Option<Presence> {
        self.entries.remove(client_id)
    }

    pub fn get(&self, client_id: &str) -> Option<&Presence> {
        self.entries.get(client_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All current presence records, ordered by client id so every peer
    /// receives the same listing.
    pub fn list(&self) -> Vec<Presence> {
        let mut all: Vec<Presence> = self.entries.values().cloned().collect();
        all.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        all
    }
}

/// Client-side coalescing for rapid cursor movement. Identity and
/// selection changes always pass; pure cursor motion is limited to one
/// update per interval.
#[derive(Debug)]
pub struct PresenceThrottle {
    last_cursor_send: Instant,
    interval: Duration,
}

impl Default for PresenceThrottle {
    fn default() -> Self {
        Self::new(Duration::from_millis(33))
    }
}

impl PresenceThrottle {
    pub fn new(interval: Duration) -> Self {
        PresenceThrottle {
            // Allow the first cursor update immediately.
            last_cursor_send: Instant::now() - interval.max(Duration::from_millis(1)),
            interval,
        }
    }

    /// Whether a cursor-only update may be sent now; records the send.
    pub fn allow_cursor(&mut self) -> bool {
        if self.last_cursor_send.elapsed() >= self.interval {
            self.last_cursor_send = Instant::now();
            true
        } else {
            false
        }
    }
}
