//! Surveyor - discovery orchestration engine for a remote telemetry store.
//!
//! Surveyor explores an unknown telemetry store by issuing many small
//! analytic queries through a rate-limited dispatcher, degrading queries
//! that blow the remote execution budget, and checkpointing everything it
//! learns so a multi-hour exploration survives a crash or restart.
//!
//! The main pieces:
//! - [`limiter::RateLimiter`] - concurrency + throughput admission control
//! - [`optimizer`] - query shaping and timeout degradation
//! - [`progress::ProgressStore`] - atomic checkpoints, backups, snapshots
//! - [`engine::DiscoveryEngine`] - the phased orchestrator
//! - [`executor::QueryExecutor`] - the boundary to the remote API

pub mod config;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod limiter;
pub mod optimizer;
pub mod progress;
pub mod types;

pub use config::SurveyorConfig;
pub use engine::events::DiscoveryEvent;
pub use engine::{CancelHandle, DiscoveryEngine};
pub use errors::{DiscoveryError, DiscoveryResult};
pub use limiter::{RateLimiter, RateLimiterEvent};
pub use progress::{ProgressEstimate, ProgressStore};
pub use types::{Checkpoint, DiscoverySession, SessionStatus};
