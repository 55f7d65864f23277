//! IPC protocol and client library for the sockpool daemon.
//!
//! The daemon listens on a Unix stream socket; each connection carries
//! exactly one JSON request and one JSON response. [`protocol`] defines
//! the envelopes both sides speak; [`client`] is the library sibling
//! processes link to submit requests with retries, a per-endpoint
//! circuit breaker and an optional result cache.

pub mod client;
pub mod protocol;

pub use client::{BatchItem, BatchItemResult, BatchResult, PoolClient, SendOptions};
pub use protocol::{
    HealthChecks, HealthReply, HealthStatus, MetricsReply, Request, Response, SendGpsReply,
    StatsReply, MAX_REQUEST_BYTES, MAX_RESPONSE_BYTES,
};
