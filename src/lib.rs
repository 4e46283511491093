//! # anisync
//!
//! Client-side data plane for anime/manga list providers.
//!
//! - [`cache`]: multi-scope TTL cache with secondary indexes and snapshots
//! - [`scheduler`]: priority queues, per-provider rate windows and retries
//! - [`error`]: failure taxonomy, correlation and guarded recovery
//! - [`api`]: descriptor-driven facade over a provider backend
//!
//! [`DataPlane`] wires the shared pieces together.

pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod plane;
pub mod resilience;
pub mod scheduler;
pub mod storage;

pub use config::Config;
pub use error::{ApiError, ErrorKind};
pub use plane::DataPlane;
