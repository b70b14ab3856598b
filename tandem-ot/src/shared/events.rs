//! Typed event registry for shared data types.
//!
//! Listeners are plain callbacks keyed by an enumerated event kind; there
//! is no string-keyed dispatch. Every mutation fires its granular event,
//! then a generic `Change`, then `Operation` carrying the op that caused
//! it. Snapshot restores fire only `Change` — snapshots are opaque.

use serde_json::Value;

use crate::operation::Operation;

/// Events observable on a shared data type.
#[derive(Debug, Clone)]
pub enum SharedEvent {
    /// Text or list content inserted at a position.
    Insert { position: usize, content: Value },
    /// Text characters or list items removed.
    Delete { position: usize, count: usize },
    /// A list item replaced in place.
    Replace {
        index: usize,
        item: Value,
        old_item: Option<Value>,
    },
    /// A list item relocated.
    Move { index: usize, target_index: usize },
    /// A map key written.
    Set {
        key: String,
        value: Value,
        previous: Option<Value>,
    },
    /// A map key removed.
    Unset { key: String, previous: Option<Value> },
    /// An atomic group of map entry edits landed.
    Batch { entries: usize },
    /// Generic change notification with before/after values.
    Change { new_value: Value, old_value: Value },
    /// The operation that produced the preceding events.
    Operation(Operation),
}

type Listener = Box<dyn FnMut(&SharedEvent) + Send>;

/// Callback registry; subscription order is emission order.
#[derive(Default)]
pub struct EventRegistry {
    listeners: Vec<Listener>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, listener: impl FnMut(&SharedEvent) + Send + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn emit(&mut self, event: &SharedEvent) {
        for listener in &mut self.listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_listeners_fire_in_subscription_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = EventRegistry::new();
        for tag in ["first", "second"] {
            let seen = seen.clone();
            registry.subscribe(move |_| seen.lock().unwrap().push(tag));
        }
        registry.emit(&SharedEvent::Batch { entries: 1 });
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_event_payload_visible_to_listener() {
        let got = Arc::new(Mutex::new(None));
        let mut registry = EventRegistry::new();
        {
            let got = got.clone();
            registry.subscribe(move |ev| {
                if let SharedEvent::Insert { position, content } = ev {
                    *got.lock().unwrap() = Some((*position, content.clone()));
                }
            });
        }
        registry.emit(&SharedEvent::Insert {
            position: 3,
            content: json!("abc"),
        });
        assert_eq!(*got.lock().unwrap(), Some((3, json!("abc"))));
    }
}
