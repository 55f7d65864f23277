//! Shared foundation for the sockpool daemon and client.
//!
//! This crate holds the pieces every other sockpool crate depends on:
//! endpoint keys and statistics types, typed identifiers, the common
//! error enum with its stable wire codes, and the per-endpoint circuit
//! breaker used by the client library.

pub mod circuit_breaker;
pub mod errors;
pub mod ids;
pub mod types;

pub use circuit_breaker::{BreakerDecision, CircuitBreaker};
pub use errors::{PoolError, PoolResult};
pub use ids::{ConnectionId, InstanceId, RequestId};
pub use types::{CircuitBreakerConfig, CircuitState, EndpointKey, EndpointStats};
