//! Trace event client for instrumented agent processes.
//!
//! [`TraceClient::send_event`] queues events without touching the network. A
//! background task flushes the queue in ordered batches and keeps the
//! connection alive:
//!
//! ```text
//! Disconnected ──attempt──▶ Connecting ──ok──▶ Connected
//!      ▲                        │                  │
//!      └──── fail / timeout ────┘◀── send failure ─┘
//! ```
//!
//! Failed attempts back off exponentially for `max_reconnect_attempts`
//! tries, then retry on a fixed interval. Events are only lost when the
//! bounded queue overflows (oldest first, counted in
//! [`TraceClient::dropped_events`]) or when the process exits before a
//! batch is sent.

mod backoff;
mod client;
mod config;
mod error;
mod queue;
mod transport;

pub use client::{ConnectionState, TraceClient};
pub use config::ClientConfig;
pub use error::ClientError;
pub use transport::{BatchSink, Connector, WsConnector};
