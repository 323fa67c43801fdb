//! Infrastructure-backed bus implementations.
//!
//! The bus abstraction lives in `tidecrm-events`. Job change notifications use
//! the in-process bus by default; with the `redis` feature they can fan out
//! across worker processes over Redis pub/sub.

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::{DEFAULT_JOB_CHANNEL, RedisBusError, RedisPubSubBus};
