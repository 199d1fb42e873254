//! Session types shared between the handle and the connection task

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

/// Connection state of the underlying transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// A registered response handler, tagged by delivery semantics
#[derive(Debug)]
pub enum CorrelatedRequest {
    /// Plain request: delivered at most once, removed on delivery
    OneShot(oneshot::Sender<Value>),
    /// Subscription: may receive any number of responses under the same id,
    /// removed only explicitly or when the receiver is dropped
    Subscription(mpsc::UnboundedSender<Value>),
}

/// An outbound frame held while the session is not open
#[derive(Debug)]
pub struct QueuedMessage {
    pub req_id: u64,
    /// Serialized payload, `req_id` already injected
    pub frame: String,
    /// Handler attached at transmission time, not before, so that clearing
    /// the pending map on disconnect cannot orphan a still-queued request
    pub request: Option<CorrelatedRequest>,
}
