//! Matches RESULT frames to the calls waiting for them.
//!
//! Every pending call is a `oneshot` slot keyed by a fresh UUID. Whoever
//! removes the slot from the map owns the right to settle it, so fulfil,
//! expire and disconnect race safely: the first one wins and the rest see
//! `false`.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::{sync::oneshot, time};
use uuid::Uuid;

#[derive(Debug)]
enum Settlement {
    Fulfilled(Value),
    Failed(String),
}

/// How a pending call ended. Exactly one of these is observed per call.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Result(Value),
    Timeout,
    Disconnected(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum CorrelatorError {
    #[error("session is closed")]
    Closed,
    #[error("too many calls in flight ({0})")]
    Full(usize),
}

pub struct Correlator {
    pending: DashMap<String, oneshot::Sender<Settlement>>,
    max_pending: usize,
    closed: AtomicBool,
}

/// The caller's half of a pending call.
pub struct PendingCall {
    request_id: String,
    rx: oneshot::Receiver<Settlement>,
}

impl Correlator {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: DashMap::new(),
            max_pending,
            closed: AtomicBool::new(false),
        }
    }

    pub fn create_pending(&self) -> Result<PendingCall, CorrelatorError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CorrelatorError::Closed);
        }
        if self.pending.len() >= self.max_pending {
            return Err(CorrelatorError::Full(self.max_pending));
        }

        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);

        // close() may have drained the map between the check and the insert
        if self.closed.load(Ordering::SeqCst) {
            self.pending.remove(&request_id);
            return Err(CorrelatorError::Closed);
        }
        Ok(PendingCall { request_id, rx })
    }

    /// Delivers a result. `false` for unknown, expired or already settled ids.
    pub fn fulfil(&self, request_id: &str, payload: Value) -> bool {
        match self.pending.remove(request_id) {
            Some((_, tx)) => tx.send(Settlement::Fulfilled(payload)).is_ok(),
            None => false,
        }
    }

    /// Gives up on a call. `false` if it was already settled.
    pub fn expire(&self, request_id: &str) -> bool {
        self.pending.remove(request_id).is_some()
    }

    /// Fails every pending call with `reason` and refuses new ones.
    /// Returns how many calls were failed.
    pub fn close(&self, reason: &str) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        self.fail_all(reason)
    }

    pub fn fail_all(&self, reason: &str) -> usize {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        ids.into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .map(|(_, tx)| tx.send(Settlement::Failed(reason.to_string())).is_ok())
            .filter(|sent| *sent)
            .count()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl PendingCall {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Waits for the call to settle, expiring it after `timeout`.
    pub async fn wait(mut self, correlator: &Correlator, timeout: Duration) -> Outcome {
        match time::timeout(timeout, &mut self.rx).await {
            Ok(settled) => Self::outcome(settled),
            Err(_) => {
                if correlator.expire(&self.request_id) {
                    Outcome::Timeout
                } else {
                    // Lost the race: the winner already holds the sender and
                    // settles it without yielding.
                    Self::outcome((&mut self.rx).await)
                }
            }
        }
    }

    fn outcome(settled: Result<Settlement, oneshot::error::RecvError>) -> Outcome {
        match settled {
            Ok(Settlement::Fulfilled(value)) => Outcome::Result(value),
            Ok(Settlement::Failed(reason)) => Outcome::Disconnected(reason),
            Err(_) => Outcome::Disconnected("call abandoned".to_string()),
        }
    }
}
