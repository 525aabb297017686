//! Observability events emitted by the discovery engine.
//!
//! Advisory only: consumers (logging, metrics) may lag or drop events
//! without affecting control flow.

use crate::types::{DiscoveryPhase, SessionStatus};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    PhaseStarted {
        phase: DiscoveryPhase,
    },
    PhaseCompleted {
        phase: DiscoveryPhase,
    },
    QuerySucceeded {
        phase: DiscoveryPhase,
        query: String,
        rows: usize,
    },
    /// A query that exhausted its transient retries or hit a fatal error.
    QueryFailed {
        phase: DiscoveryPhase,
        query: String,
        error: String,
    },
    /// A query abandoned after the degradation ladder ran out.
    QueryAbandoned {
        phase: DiscoveryPhase,
        query: String,
        attempts: u32,
    },
    CheckpointSaved {
        path: PathBuf,
    },
    SessionFinished {
        status: SessionStatus,
    },
}
