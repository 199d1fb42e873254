//! Encapsulated per-session state: correlation map, outbound queue, retry counter
//!
//! All mutation goes through the methods here; the manager keeps a single
//! instance behind a mutex and never exposes the maps directly.

use crate::session::types::{ConnectionState, CorrelatedRequest, QueuedMessage};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Mutable state owned by one logical session
pub struct SessionState {
    conn_state: ConnectionState,
    /// In-flight correlated requests, keyed by req_id
    pending: HashMap<u64, CorrelatedRequest>,
    /// Outbound frames submitted while not open, in submission order
    queue: VecDeque<QueuedMessage>,
    /// Sink for inbound messages with no matching correlation id
    global: Option<mpsc::UnboundedSender<Value>>,
    reconnect_attempts: u32,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            conn_state: ConnectionState::Closed,
            pending: HashMap::new(),
            queue: VecDeque::new(),
            global: None,
            reconnect_attempts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.conn_state
    }

    pub fn is_open(&self) -> bool {
        self.conn_state == ConnectionState::Open
    }

    pub fn set_state(&mut self, next: ConnectionState) {
        if self.conn_state != next {
            debug!(from = ?self.conn_state, to = ?next, "Session state transition");
            self.conn_state = next;
        }
    }

    pub fn attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Increment the reconnect counter and return the new attempt number
    pub fn bump_attempts(&mut self) -> u32 {
        self.reconnect_attempts += 1;
        self.reconnect_attempts
    }

    pub fn reset_attempts(&mut self) {
        self.reconnect_attempts = 0;
    }

    /// Register a correlated request under its id
    pub fn register(&mut self, req_id: u64, request: CorrelatedRequest) {
        self.pending.insert(req_id, request);
    }

    /// Remove a registered handler; returns whether one was present
    pub fn remove(&mut self, req_id: u64) -> bool {
        self.pending.remove(&req_id).is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn set_global(&mut self, sink: mpsc::UnboundedSender<Value>) {
        self.global = Some(sink);
    }

    pub fn enqueue(&mut self, message: QueuedMessage) {
        debug!(req_id = message.req_id, "Queueing outbound frame");
        self.queue.push_back(message);
    }

    /// Put messages back at the head of the queue, preserving their order
    pub fn requeue_front(&mut self, messages: Vec<QueuedMessage>) {
        for message in messages.into_iter().rev() {
            self.queue.push_front(message);
        }
    }

    /// Take the whole queue for draining
    pub fn take_queue(&mut self) -> VecDeque<QueuedMessage> {
        std::mem::take(&mut self.queue)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queued_ids(&self) -> Vec<u64> {
        self.queue.iter().map(|m| m.req_id).collect()
    }

    /// Drop all in-flight requests; responses arriving later fall through to
    /// the global sink or are discarded
    pub fn clear_pending(&mut self) {
        if !self.pending.is_empty() {
            debug!(count = self.pending.len(), "Clearing pending requests");
            self.pending.clear();
        }
    }

    /// Explicit close: drop pending requests, the queue, and the global sink
    pub fn clear_all(&mut self) {
        self.clear_pending();
        self.queue.clear();
        self.global = None;
        self.set_state(ConnectionState::Closed);
    }

    /// Route one inbound message to its handler.
    ///
    /// One-shot handlers are consumed on delivery; subscription handlers stay
    /// registered until removed or until their receiver is dropped. Messages
    /// with no matching id go to the global sink, or are dropped silently.
    pub fn dispatch(&mut self, message: Value) {
        let req_id = message.get("req_id").and_then(Value::as_u64);

        if let Some(id) = req_id {
            if let Some(request) = self.pending.remove(&id) {
                match request {
                    CorrelatedRequest::OneShot(tx) => {
                        if tx.send(message).is_err() {
                            debug!(req_id = id, "One-shot receiver dropped before delivery");
                        }
                    }
                    CorrelatedRequest::Subscription(tx) => {
                        if tx.send(message).is_ok() {
                            self.pending.insert(id, CorrelatedRequest::Subscription(tx));
                        } else {
                            debug!(req_id = id, "Subscription receiver dropped, removing handler");
                        }
                    }
                }
                return;
            }
        }

        if let Some(global) = &self.global {
            if global.send(message).is_err() {
                debug!("Global receiver dropped, clearing sink");
                self.global = None;
            }
        } else {
            debug!(?req_id, "Dropping message with no matching handler");
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Reconnection delay: `min(base × attempt, cap)`
pub fn reconnect_delay(base_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    Duration::from_millis(base_ms.saturating_mul(attempt as u64).min(max_ms))
}
