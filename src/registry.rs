use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use tracing::info;

use crate::session::Session;

struct Registered {
    seq: u64,
    session: Arc<Session>,
}

/// Connected sessions keyed by instance id.
///
/// Every registration gets a sequence number so snapshots come back in
/// registration order, which is what the router's tie-break relies on.
#[derive(Default)]
pub struct ClientRegistry {
    sessions: DashMap<String, Registered>,
    next_seq: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `session`. A session already registered under the same id is a
    /// stale connection from the same client: it is swapped out in one step,
    /// then closed and returned.
    pub async fn register(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let id = session.instance_id().to_string();

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let previous = self
            .sessions
            .insert(id.clone(), Registered { seq, session })
            .map(|r| r.session);
        if let Some(prev) = &previous {
            info!(instance = %id, "replacing existing session");
            prev.close("replaced by a new connection").await;
        }
        previous
    }

    pub fn unregister(&self, instance_id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(instance_id).map(|(_, r)| r.session)
    }

    /// Removes `session` only if it is still the one registered under its id.
    pub fn unregister_if_same(&self, session: &Arc<Session>) -> bool {
        self.sessions
            .remove_if(session.instance_id(), |_, r| Arc::ptr_eq(&r.session, session))
            .is_some()
    }

    pub fn get(&self, instance_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(instance_id).map(|r| r.session.clone())
    }

    /// Point-in-time copy in registration order.
    pub fn all(&self) -> Vec<Arc<Session>> {
        let mut entries: Vec<(u64, Arc<Session>)> = self
            .sessions
            .iter()
            .map(|r| (r.seq, r.session.clone()))
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, s)| s).collect()
    }

    /// Empties the registry, returning what was in it.
    pub fn drain(&self) -> Vec<Arc<Session>> {
        let sessions = self.all();
        for s in &sessions {
            self.unregister_if_same(s);
        }
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
