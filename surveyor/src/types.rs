//! Data model for a discovery session and its checkpoint document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Format version written into every checkpoint document.
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

/// The fixed, ordered exploration phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryPhase {
    Entities,
    EntityMetadata,
    Metrics,
    Relationships,
    Samples,
    Done,
}

impl DiscoveryPhase {
    /// Phases that issue queries, in execution order.
    pub const ACTIVE: [DiscoveryPhase; 5] = [
        DiscoveryPhase::Entities,
        DiscoveryPhase::EntityMetadata,
        DiscoveryPhase::Metrics,
        DiscoveryPhase::Relationships,
        DiscoveryPhase::Samples,
    ];

    pub fn next(self) -> DiscoveryPhase {
        match self {
            DiscoveryPhase::Entities => DiscoveryPhase::EntityMetadata,
            DiscoveryPhase::EntityMetadata => DiscoveryPhase::Metrics,
            DiscoveryPhase::Metrics => DiscoveryPhase::Relationships,
            DiscoveryPhase::Relationships => DiscoveryPhase::Samples,
            DiscoveryPhase::Samples => DiscoveryPhase::Done,
            DiscoveryPhase::Done => DiscoveryPhase::Done,
        }
    }

    /// Count of active phases already behind this one.
    pub fn completed_count(self) -> usize {
        match self {
            DiscoveryPhase::Entities => 0,
            DiscoveryPhase::EntityMetadata => 1,
            DiscoveryPhase::Metrics => 2,
            DiscoveryPhase::Relationships => 3,
            DiscoveryPhase::Samples => 4,
            DiscoveryPhase::Done => 5,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            DiscoveryPhase::Entities => "entities",
            DiscoveryPhase::EntityMetadata => "entity-metadata",
            DiscoveryPhase::Metrics => "metrics",
            DiscoveryPhase::Relationships => "relationships",
            DiscoveryPhase::Samples => "samples",
            DiscoveryPhase::Done => "done",
        }
    }
}

/// Inferred attribute value type, from sampled values only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    String,
    Numeric,
    Boolean,
    Timestamp,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeDescriptor {
    pub name: String,
    pub inferred_type: AttributeType,
    /// Distinct values seen in the sampled rows.
    pub cardinality_estimate: Option<u64>,
    pub nullable: bool,
}

/// Aggregate metadata discovered for one record kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub entity_count: Option<u64>,
    pub host_count: Option<u64>,
    pub earliest_timestamp: Option<DateTime<Utc>>,
    pub latest_timestamp: Option<DateTime<Utc>>,
}

/// One discovered kind of record. Enriched incrementally, never deleted
/// within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub name: String,
    /// Record count observed in the reference window.
    pub observed_volume: u64,
    pub attributes: Vec<AttributeDescriptor>,
    pub metadata: EntityMetadata,
}

impl EntityDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            observed_volume: 0,
            attributes: Vec::new(),
            metadata: EntityMetadata::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricStats {
    pub series_count: u64,
    pub sample_count: Option<u64>,
}

/// A named cluster of numeric series sharing a prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricGroup {
    pub name: String,
    pub members: Vec<String>,
    pub stats: MetricStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOutcome {
    Succeeded,
    Failed,
    Abandoned,
}

/// Record of one query issued during discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedQuery {
    pub text: String,
    pub phase: DiscoveryPhase,
    pub outcome: QueryOutcome,
    pub attempts: u32,
}

/// A templated observation derived from discovered data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub kind: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Insight {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

/// The unit of work: everything discovered so far plus where we are in
/// the phase sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySession {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub phase: DiscoveryPhase,
    pub entities: Vec<EntityDescriptor>,
    pub metric_groups: Vec<MetricGroup>,
    pub queries: Vec<GeneratedQuery>,
    pub insights: Vec<Insight>,
    pub failed_queries: u32,
    pub abandoned_queries: u32,
    /// Change counter bumped by `touch()`. Process-local; the autosave
    /// loop compares it against the last saved value.
    #[serde(skip)]
    pub revision: u64,
}

impl DiscoverySession {
    pub fn new() -> Self {
        Self {
            id: format!("session-{}", uuid::Uuid::new_v4()),
            started_at: Utc::now(),
            status: SessionStatus::Running,
            phase: DiscoveryPhase::Entities,
            entities: Vec::new(),
            metric_groups: Vec::new(),
            queries: Vec::new(),
            insights: Vec::new(),
            failed_queries: 0,
            abandoned_queries: 0,
            revision: 0,
        }
    }

    /// Mark the session changed since the last checkpoint.
    pub fn touch(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }

    /// Insert a descriptor if the name is new; entity names are unique
    /// within a session.
    pub fn upsert_entity(&mut self, name: &str) -> &mut EntityDescriptor {
        if let Some(idx) = self.entities.iter().position(|e| e.name == name) {
            return &mut self.entities[idx];
        }
        self.entities.push(EntityDescriptor::new(name));
        let idx = self.entities.len() - 1;
        &mut self.entities[idx]
    }

    pub fn entity_mut(&mut self, name: &str) -> Option<&mut EntityDescriptor> {
        self.entities.iter_mut().find(|e| e.name == name)
    }

    pub fn record_query(
        &mut self,
        text: impl Into<String>,
        phase: DiscoveryPhase,
        outcome: QueryOutcome,
        attempts: u32,
    ) {
        match outcome {
            QueryOutcome::Failed => self.failed_queries += 1,
            QueryOutcome::Abandoned => self.abandoned_queries += 1,
            QueryOutcome::Succeeded => {}
        }
        self.queries.push(GeneratedQuery {
            text: text.into(),
            phase,
            outcome,
            attempts,
        });
        self.touch();
    }
}

impl Default for DiscoverySession {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialized snapshot of a session plus wall-clock timestamp and format
/// version. Written by the progress store; readable only while younger
/// than the staleness ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub session: DiscoverySession,
}

impl Checkpoint {
    pub fn new(session: DiscoverySession) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            timestamp: Utc::now(),
            session,
        }
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order_ends_at_done() {
        let mut phase = DiscoveryPhase::Entities;
        let mut seen = vec![phase];
        while phase != DiscoveryPhase::Done {
            phase = phase.next();
            seen.push(phase);
        }
        assert_eq!(seen.len(), 6);
        assert_eq!(DiscoveryPhase::Done.next(), DiscoveryPhase::Done);
    }

    #[test]
    fn test_upsert_entity_is_unique_by_name() {
        let mut session = DiscoverySession::new();
        session.upsert_entity("PageView").observed_volume = 10;
        session.upsert_entity("PageView").metadata.host_count = Some(3);
        assert_eq!(session.entities.len(), 1);
        assert_eq!(session.entities[0].observed_volume, 10);
        assert_eq!(session.entities[0].metadata.host_count, Some(3));
    }

    #[test]
    fn test_record_query_counts_outcomes() {
        let mut session = DiscoverySession::new();
        session.record_query("q1", DiscoveryPhase::Entities, QueryOutcome::Succeeded, 1);
        session.record_query("q2", DiscoveryPhase::Entities, QueryOutcome::Failed, 4);
        session.record_query("q3", DiscoveryPhase::Samples, QueryOutcome::Abandoned, 6);
        assert_eq!(session.queries.len(), 3);
        assert_eq!(session.failed_queries, 1);
        assert_eq!(session.abandoned_queries, 1);
    }

    #[test]
    fn test_touch_advances_revision() {
        let mut session = DiscoverySession::new();
        let before = session.revision;
        session.touch();
        assert_eq!(session.revision, before + 1);
    }
}
