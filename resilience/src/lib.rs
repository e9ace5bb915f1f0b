//! # Resilience primitives
//!
//! Building blocks shared by the event consumers:
//! - Keyed TTL cache with an ordered expiry index (idempotency ledgers)
//! - Exponential backoff policy with a hard delay cap
//! - Circuit breaker per logical downstream dependency
//! - Retry coordinator composing the three around a fallible async call
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │            RetryCoordinator::execute         │
//! └──────┬──────────────────┬───────────────┬────┘
//!        │                  │               │
//! ┌──────▼──────┐  ┌────────▼───────┐  ┌────▼──────────┐
//! │ RetryPolicy │  │ BreakerRegistry│  │ per-attempt   │
//! │ (backoff)   │  │ (per dependency)│ │ timeout       │
//! └─────────────┘  └────────────────┘  └───────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod circuit_breaker;
pub mod error;
pub mod policy;
pub mod retry;
pub mod ttl_cache;

pub use circuit_breaker::{
    BreakerRegistry, BreakerSnapshot, CircuitBreakerConfig, CircuitState, Permit,
};
pub use error::{Classify, Error, FailureClass, Result};
pub use policy::RetryPolicy;
pub use retry::{RetryCoordinator, RetryFailure, RetrySuccess, StopReason};
pub use ttl_cache::{TtlCache, MAX_TTL};

/// Default circuit breaker threshold (consecutive failures before opening)
pub const DEFAULT_CB_FAILURE_THRESHOLD: u32 = 5;

/// Default circuit breaker cool-down (milliseconds before half-open)
pub const DEFAULT_CB_COOL_DOWN_MS: u64 = 30_000;

/// Default window in which consecutive failures are counted (milliseconds)
pub const DEFAULT_CB_FAILURE_WINDOW_MS: u64 = 60_000;

/// Default retry attempts for known-transient failures
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
