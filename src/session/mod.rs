//! Persistent multiplexed session layer for trading-data WebSocket feeds
//!
//! This module provides:
//! - A session handle with request/response correlation by `req_id`
//! - FIFO queueing of outbound frames while disconnected
//! - Auto-reconnection with a bounded, capped delay schedule
//! - Keepalive signaling and an authorization handshake on open

pub mod manager;
pub mod state;
pub mod types;

pub use manager::{Session, SessionError};
pub use types::{ConnectionState, CorrelatedRequest, QueuedMessage};
