//! Broker notifications for operators and embedding hosts.
//!
//! Everything here is also logged; subscribing is optional and events are
//! simply dropped when nobody listens.

use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationOutcome {
    /// Catalog entry found and merged into the session.
    Matched { functions: usize },
    /// No catalog entry for the tag; the session keeps an empty capability list.
    NotFound,
    /// No catalog is configured.
    NoCatalog,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BrokerEvent {
    SessionRegistered {
        instance_id: String,
        language: String,
        functions: usize,
        ambient_dispatch: bool,
    },
    SessionReplaced {
        instance_id: String,
    },
    SessionClosed {
        instance_id: String,
        failed_calls: usize,
    },
    AutoAssociation {
        instance_id: String,
        process_tag: String,
        outcome: AssociationOutcome,
    },
    AmbiguousFunction {
        function: String,
        chosen: String,
        shadowed: Vec<String>,
    },
    StaleResult {
        instance_id: String,
        request_id: String,
    },
    ProtocolViolation {
        peer: String,
        detail: String,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BrokerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: BrokerEvent) {
        // Err only means there are no subscribers
        let _ = self.tx.send(event);
    }
}
