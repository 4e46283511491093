//! # Resilience Module
//!
//! Per-provider fault isolation for outbound requests.
//!
//! ## Architecture
//!
//! - **Circuit Breakers**: one per provider, owned by the scheduler, tripped
//!   by consecutive `NETWORK_ERROR` / `SERVER_ERROR` outcomes
//! - **Half-open trial**: after the cooldown a single request is admitted;
//!   its outcome closes or reopens the circuit
//!
//! ## Usage
//!
//! ```rust,no_run
//! use anisync::resilience::{BreakerConfig, CircuitBreaker};
//! use std::time::Duration;
//!
//! let breaker = CircuitBreaker::new("anilist", BreakerConfig::new(5, Duration::from_secs(60)));
//! if breaker.try_acquire() {
//!     // dispatch, then report the outcome
//!     breaker.record_success();
//! }
//! ```

pub mod circuit_breaker;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitState};

/// Thresholds for a single provider's breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive tripping failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting a trial.
    pub cooldown: Duration,
}

impl BreakerConfig {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60))
    }
}
