//! The discovery orchestrator.
//!
//! Walks the fixed phase sequence, submitting every query through the
//! rate limiter, degrading timed-out queries through the optimizer
//! ladder, and checkpointing the session after each phase. The session
//! structure is only ever mutated here (and briefly read by the autosave
//! loop), so short mutex locks are all the coordination it needs.

pub mod events;
mod parse;

use crate::config::{RetryConfig, SurveyorConfig};
use crate::errors::{DiscoveryError, DiscoveryResult};
use crate::executor::{QueryExecutor, QueryOptions, QueryResponse};
use crate::limiter::RateLimiter;
use crate::optimizer;
use crate::progress::ProgressStore;
use crate::types::{
    AttributeDescriptor, AttributeType, DiscoveryPhase, DiscoverySession, MetricGroup,
    MetricStats, QueryOutcome, SessionStatus,
};
use events::DiscoveryEvent;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Upper bound on per-group metric probes; prefixes beyond this are
/// grouped without aggregate stats.
const METRIC_PROBE_CAP: usize = 20;

/// Attribute-name overlap required before two entities are called
/// related.
const SHARED_ATTRIBUTE_FLOOR: usize = 3;

/// Shared flag for operator abort. Cancelling stops new submissions
/// immediately; in-flight calls finish naturally.
#[derive(Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

pub struct DiscoveryEngine {
    executor: Arc<dyn QueryExecutor>,
    limiter: RateLimiter,
    store: ProgressStore,
    retry: RetryConfig,
    query_timeout: Duration,
    session: Arc<Mutex<DiscoverySession>>,
    cancel: CancelHandle,
    events: broadcast::Sender<DiscoveryEvent>,
}

impl DiscoveryEngine {
    /// Build an engine, resuming from a fresh-enough checkpoint when one
    /// exists. Requires a running tokio runtime (spawns the limiter).
    pub fn new(config: &SurveyorConfig, executor: Arc<dyn QueryExecutor>) -> DiscoveryResult<Self> {
        let store = ProgressStore::new(&config.progress)?;
        let session = match store.load()? {
            Some(checkpoint) if checkpoint.session.status == SessionStatus::Running => {
                checkpoint.session
            }
            Some(checkpoint) => {
                info!(
                    session = %checkpoint.session.id,
                    "previous session already finished, starting a new one"
                );
                DiscoverySession::new()
            }
            None => DiscoverySession::new(),
        };
        Ok(Self::with_session(config, executor, store, session))
    }

    /// Build around an explicit session (embedders, tests).
    pub fn with_session(
        config: &SurveyorConfig,
        executor: Arc<dyn QueryExecutor>,
        store: ProgressStore,
        session: DiscoverySession,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            executor,
            limiter: RateLimiter::new(&config.limiter),
            store,
            retry: config.retry.clone(),
            query_timeout: config.executor.query_timeout(),
            session: Arc::new(Mutex::new(session)),
            cancel: CancelHandle::default(),
            events,
        }
    }

    /// Shared session handle, for the autosave loop and status readers.
    pub fn session(&self) -> Arc<Mutex<DiscoverySession>> {
        Arc::clone(&self.session)
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Run phases until done, cancelled, or fatally misconfigured.
    pub async fn run(&self) -> DiscoveryResult<SessionStatus> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(self.finish_cancelled());
            }
            let phase = self.session.lock().unwrap().phase;
            if phase == DiscoveryPhase::Done {
                break;
            }

            info!(phase = phase.label(), "phase started");
            self.emit(DiscoveryEvent::PhaseStarted { phase });

            let outcome = match phase {
                DiscoveryPhase::Entities => self.discover_entities().await,
                DiscoveryPhase::EntityMetadata => self.discover_entity_metadata().await,
                DiscoveryPhase::Metrics => self.discover_metrics().await,
                DiscoveryPhase::Relationships => self.discover_relationships().await,
                DiscoveryPhase::Samples => self.collect_samples().await,
                DiscoveryPhase::Done => Ok(()),
            };

            if let Err(e) = outcome {
                if e.is_fatal() {
                    {
                        let mut session = self.session.lock().unwrap();
                        session.status = SessionStatus::Failed;
                        session.touch();
                    }
                    self.checkpoint();
                    self.emit(DiscoveryEvent::SessionFinished {
                        status: SessionStatus::Failed,
                    });
                    return Err(e);
                }
                // Everything non-fatal is already accounted for inside
                // the phase; the phase keeps whatever data it gathered.
                warn!(phase = phase.label(), error = %e, "phase finished with errors");
            }

            if self.cancel.is_cancelled() {
                // The phase may be partially done; don't advance past it.
                return Ok(self.finish_cancelled());
            }

            {
                let mut session = self.session.lock().unwrap();
                session.phase = phase.next();
                session.touch();
            }
            self.checkpoint();
            self.emit(DiscoveryEvent::PhaseCompleted { phase });
        }

        let status = {
            let mut session = self.session.lock().unwrap();
            if session.status == SessionStatus::Running {
                session.status = SessionStatus::Completed;
                session.touch();
            }
            session.status
        };
        self.checkpoint();
        self.emit(DiscoveryEvent::SessionFinished { status });
        let (failed, abandoned) = {
            let session = self.session.lock().unwrap();
            (session.failed_queries, session.abandoned_queries)
        };
        info!(
            ?status,
            failed_queries = failed,
            abandoned_queries = abandoned,
            "discovery session finished"
        );
        Ok(status)
    }

    fn finish_cancelled(&self) -> SessionStatus {
        let status = self.session.lock().unwrap().status;
        self.checkpoint();
        info!("session cancelled; progress checkpointed for resume");
        status
    }

    /// Save the session, surfacing failures as warnings only: discovery
    /// continues with in-memory state.
    fn checkpoint(&self) {
        let copy = self.session.lock().unwrap().clone();
        match self.store.save(&copy) {
            Ok(path) => self.emit(DiscoveryEvent::CheckpointSaved { path }),
            Err(e) => warn!(error = %e, "checkpoint save failed, continuing in memory"),
        }
    }

    fn emit(&self, event: DiscoveryEvent) {
        let _ = self.events.send(event);
    }

    /// Submit one query through the limiter with the full retry policy:
    /// timeouts walk the degradation ladder (bounded by the retry
    /// ceiling), transient errors retry unchanged, malformed responses
    /// collapse to an empty result. Returns `Ok(None)` when the query
    /// was recorded failed or abandoned; only fatal errors propagate.
    async fn run_query(
        &self,
        phase: DiscoveryPhase,
        query: String,
        row_limit: u32,
    ) -> DiscoveryResult<Option<QueryResponse>> {
        let mut current = query;
        let mut attempts: u32 = 0;
        let mut degrade_retries: u32 = 0;
        let mut transient_left = self.retry.transient_retries;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            attempts += 1;
            let executor = Arc::clone(&self.executor);
            let submitted = current.clone();
            let options = QueryOptions {
                timeout: self.query_timeout,
                row_limit,
            };
            let outcome = self
                .limiter
                .execute(move || async move { executor.execute(&submitted, &options).await })
                .await;

            match outcome {
                Ok(response) => {
                    let rows = response.results.len();
                    self.session.lock().unwrap().record_query(
                        current.clone(),
                        phase,
                        QueryOutcome::Succeeded,
                        attempts,
                    );
                    self.emit(DiscoveryEvent::QuerySucceeded {
                        phase,
                        query: current,
                        rows,
                    });
                    return Ok(Some(response));
                }
                Err(DiscoveryError::Timeout(reason)) => {
                    if degrade_retries >= self.retry.max_retries {
                        warn!(
                            query = %current,
                            attempts,
                            "retry ceiling reached, abandoning query"
                        );
                        self.abandon(phase, current, attempts);
                        return Ok(None);
                    }
                    let degraded = optimizer::degrade(&current);
                    if degraded == current {
                        warn!(query = %current, %reason, "query not degradable, abandoning");
                        self.abandon(phase, current, attempts);
                        return Ok(None);
                    }
                    debug!(from = %current, to = %degraded, "degrading timed-out query");
                    current = degraded;
                    degrade_retries += 1;
                }
                Err(DiscoveryError::MalformedResponse(reason)) => {
                    warn!(query = %current, %reason, "malformed response treated as empty result");
                    self.session.lock().unwrap().record_query(
                        current,
                        phase,
                        QueryOutcome::Succeeded,
                        attempts,
                    );
                    return Ok(Some(QueryResponse::default()));
                }
                Err(e) if e.is_fatal() => {
                    self.session.lock().unwrap().record_query(
                        current.clone(),
                        phase,
                        QueryOutcome::Failed,
                        attempts,
                    );
                    self.emit(DiscoveryEvent::QueryFailed {
                        phase,
                        query: current,
                        error: e.to_string(),
                    });
                    return Err(e);
                }
                // Transient and anything else retryable-unchanged.
                Err(e) => {
                    if transient_left == 0 {
                        warn!(query = %current, error = %e, "transient retries exhausted");
                        self.session.lock().unwrap().record_query(
                            current.clone(),
                            phase,
                            QueryOutcome::Failed,
                            attempts,
                        );
                        self.emit(DiscoveryEvent::QueryFailed {
                            phase,
                            query: current,
                            error: e.to_string(),
                        });
                        return Ok(None);
                    }
                    transient_left -= 1;
                    debug!(query = %current, error = %e, "retrying after transient failure");
                }
            }
        }
    }

    fn abandon(&self, phase: DiscoveryPhase, query: String, attempts: u32) {
        self.session.lock().unwrap().record_query(
            query.clone(),
            phase,
            QueryOutcome::Abandoned,
            attempts,
        );
        self.emit(DiscoveryEvent::QueryAbandoned {
            phase,
            query,
            attempts,
        });
    }

    /// Phase 1: enumerate the record kinds the store contains.
    async fn discover_entities(&self) -> DiscoveryResult<()> {
        // No volume estimate exists yet; start wide and let the ladder
        // shrink the window if the store proves too big.
        let shape = optimizer::select_shape(0);
        let query = format!("SHOW EVENT TYPES SINCE {} ago", shape.window);
        let Some(response) = self
            .run_query(DiscoveryPhase::Entities, query, shape.row_limit)
            .await?
        else {
            return Ok(());
        };

        let names = parse::string_values(&response.results, &["eventType", "name", "type"]);
        if names.is_empty() {
            warn!("no record kinds discovered in reference window");
        }
        let mut session = self.session.lock().unwrap();
        for name in &names {
            session.upsert_entity(name);
        }
        session.touch();
        info!(entities = session.entities.len(), "entity enumeration complete");
        Ok(())
    }

    /// Phase 2: per-entity attributes and aggregate counts, fanned out
    /// through the limiter and merged after the join.
    async fn discover_entity_metadata(&self) -> DiscoveryResult<()> {
        let phase = DiscoveryPhase::EntityMetadata;
        let names: Vec<String> = {
            let session = self.session.lock().unwrap();
            session.entities.iter().map(|e| e.name.clone()).collect()
        };

        let tasks = names.into_iter().map(|name| async move {
            let shape = optimizer::select_shape(0);
            let attr_query = format!("SELECT keyset() FROM {} SINCE {} ago", name, shape.window);
            let count_query = format!(
                "SELECT count(*), uniqueCount(host), earliest(timestamp), latest(timestamp) FROM {} SINCE {} ago",
                name, shape.window
            );
            let attrs = self.run_query(phase, attr_query, shape.row_limit).await?;
            let counts = self.run_query(phase, count_query, 10).await?;
            Ok::<_, DiscoveryError>((name, attrs, counts))
        });

        let mut fatal = None;
        for result in join_all(tasks).await {
            match result {
                Ok((name, attrs, counts)) => self.merge_entity_metadata(&name, attrs, counts),
                Err(e) => fatal = Some(e),
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }
        Ok(())
    }

    fn merge_entity_metadata(
        &self,
        name: &str,
        attrs: Option<QueryResponse>,
        counts: Option<QueryResponse>,
    ) {
        let mut session = self.session.lock().unwrap();
        let Some(entity) = session.entity_mut(name) else {
            return;
        };

        if let Some(attrs) = attrs {
            let keys = parse::string_values(&attrs.results, &["key", "keyset", "allKeys"]);
            for key in keys {
                if !entity.attributes.iter().any(|a| a.name == key) {
                    entity.attributes.push(AttributeDescriptor {
                        name: key,
                        inferred_type: AttributeType::Unknown,
                        cardinality_estimate: None,
                        nullable: false,
                    });
                }
            }
        }
        if let Some(counts) = counts {
            if let Some(count) = parse::first_u64(&counts.results, &["count", "count.*"]) {
                entity.observed_volume = count;
                entity.metadata.entity_count = Some(count);
            }
            entity.metadata.host_count =
                parse::first_u64(&counts.results, &["uniqueCount.host", "uniqueCount"]);
            entity.metadata.earliest_timestamp = parse::first_timestamp(
                &counts.results,
                &["earliest.timestamp", "earliest"],
            );
            entity.metadata.latest_timestamp =
                parse::first_timestamp(&counts.results, &["latest.timestamp", "latest"]);
        }
        session.touch();
    }

    /// Phase 3: enumerate numeric series and cluster them by prefix.
    async fn discover_metrics(&self) -> DiscoveryResult<()> {
        let phase = DiscoveryPhase::Metrics;
        let total_volume: u64 = {
            let session = self.session.lock().unwrap();
            session.entities.iter().map(|e| e.observed_volume).sum()
        };
        let shape = optimizer::select_shape(total_volume);
        let query = format!(
            "SELECT uniques(metricName) FROM Metric SINCE {} ago",
            shape.window
        );
        let Some(response) = self.run_query(phase, query, shape.row_limit).await? else {
            return Ok(());
        };

        let metric_names = parse::string_values(
            &response.results,
            &["uniques.metricName", "metricName", "name"],
        );
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for metric in metric_names {
            let prefix = metric
                .split('.')
                .next()
                .unwrap_or(metric.as_str())
                .to_string();
            grouped.entry(prefix).or_default().push(metric);
        }

        {
            let mut session = self.session.lock().unwrap();
            session.metric_groups = grouped
                .iter()
                .map(|(prefix, members)| MetricGroup {
                    name: prefix.clone(),
                    members: members.clone(),
                    stats: MetricStats {
                        series_count: members.len() as u64,
                        sample_count: None,
                    },
                })
                .collect();
            session.touch();
        }

        // Aggregate probes for the largest groups only.
        let mut prefixes: Vec<(String, usize)> = grouped
            .into_iter()
            .map(|(prefix, members)| (prefix, members.len()))
            .collect();
        prefixes.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        if prefixes.len() > METRIC_PROBE_CAP {
            info!(
                groups = prefixes.len(),
                probed = METRIC_PROBE_CAP,
                "metric group probes capped"
            );
            prefixes.truncate(METRIC_PROBE_CAP);
        }

        let window = shape.window;
        let tasks = prefixes.into_iter().map(|(prefix, _)| async move {
            let probe = format!(
                "SELECT count(*) FROM Metric WHERE metricName LIKE '{}%' SINCE {} ago",
                prefix, window
            );
            let response = self.run_query(phase, probe, 10).await?;
            Ok::<_, DiscoveryError>((prefix, response))
        });

        let mut fatal = None;
        for result in join_all(tasks).await {
            match result {
                Ok((prefix, Some(response))) => {
                    let mut session = self.session.lock().unwrap();
                    if let Some(group) =
                        session.metric_groups.iter_mut().find(|g| g.name == prefix)
                    {
                        group.stats.sample_count =
                            parse::first_u64(&response.results, &["count", "count.*"]);
                    }
                    session.touch();
                }
                Ok((_, None)) => {}
                Err(e) => fatal = Some(e),
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }
        Ok(())
    }

    /// Phase 4: probe which hosts each entity is observed on and record
    /// overlaps as insights. Attribute overlap needs no queries.
    async fn discover_relationships(&self) -> DiscoveryResult<()> {
        let phase = DiscoveryPhase::Relationships;
        let entities: Vec<(String, u64)> = {
            let session = self.session.lock().unwrap();
            session
                .entities
                .iter()
                .map(|e| (e.name.clone(), e.observed_volume))
                .collect()
        };

        let tasks = entities.iter().map(|(name, volume)| {
            let name = name.clone();
            let shape = optimizer::select_shape(*volume);
            async move {
                let probe = format!(
                    "SELECT uniques(host) FROM {} SINCE {} ago",
                    name, shape.window
                );
                let response = self.run_query(phase, probe, shape.row_limit).await?;
                let hosts = response
                    .map(|r| parse::string_values(&r.results, &["uniques.host", "host"]))
                    .unwrap_or_default();
                Ok::<_, DiscoveryError>((name, hosts))
            }
        });

        let mut host_sets: Vec<(String, Vec<String>)> = Vec::new();
        let mut fatal = None;
        for result in join_all(tasks).await {
            match result {
                Ok((name, hosts)) => host_sets.push((name, hosts)),
                Err(e) => fatal = Some(e),
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        let mut session = self.session.lock().unwrap();
        for i in 0..host_sets.len() {
            for j in i + 1..host_sets.len() {
                let (left, left_hosts) = &host_sets[i];
                let (right, right_hosts) = &host_sets[j];
                let shared = left_hosts
                    .iter()
                    .filter(|h| right_hosts.contains(h))
                    .count();
                if shared > 0 {
                    session.insights.push(crate::types::Insight::new(
                        "shared-hosts",
                        format!("{} and {} are observed on {} shared host(s)", left, right, shared),
                    ));
                }
            }
        }

        // Attribute overlap from already-discovered metadata.
        let attr_sets: Vec<(String, Vec<String>)> = session
            .entities
            .iter()
            .map(|e| {
                (
                    e.name.clone(),
                    e.attributes.iter().map(|a| a.name.clone()).collect(),
                )
            })
            .collect();
        for i in 0..attr_sets.len() {
            for j in i + 1..attr_sets.len() {
                let (left, left_attrs) = &attr_sets[i];
                let (right, right_attrs) = &attr_sets[j];
                let shared: Vec<&String> = left_attrs
                    .iter()
                    .filter(|a| right_attrs.contains(a))
                    .collect();
                if shared.len() >= SHARED_ATTRIBUTE_FLOOR {
                    session.insights.push(crate::types::Insight::new(
                        "shared-attributes",
                        format!(
                            "{} and {} share {} attribute(s)",
                            left,
                            right,
                            shared.len()
                        ),
                    ));
                }
            }
        }
        session.touch();
        Ok(())
    }

    /// Phase 5: sample raw rows per entity and refine attribute types,
    /// nullability and cardinality from the samples.
    async fn collect_samples(&self) -> DiscoveryResult<()> {
        let phase = DiscoveryPhase::Samples;
        let entities: Vec<(String, u64)> = {
            let session = self.session.lock().unwrap();
            session
                .entities
                .iter()
                .map(|e| (e.name.clone(), e.observed_volume))
                .collect()
        };

        let tasks = entities.iter().map(|(name, volume)| {
            let name = name.clone();
            let shape = optimizer::select_shape(*volume);
            async move {
                let sampling = shape
                    .sampling
                    .map(|s| format!(" {}", s))
                    .unwrap_or_default();
                let query = format!(
                    "SELECT * FROM {}{} SINCE {} ago LIMIT {}",
                    name, sampling, shape.window, shape.row_limit
                );
                let response = self.run_query(phase, query, shape.row_limit).await?;
                Ok::<_, DiscoveryError>((name, response))
            }
        });

        let mut fatal = None;
        for result in join_all(tasks).await {
            match result {
                Ok((name, Some(response))) => self.merge_samples(&name, &response),
                Ok((_, None)) => {}
                Err(e) => fatal = Some(e),
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        self.summarize();
        Ok(())
    }

    fn merge_samples(&self, name: &str, response: &QueryResponse) {
        let rows = parse::object_rows(&response.results);
        if rows.is_empty() {
            return;
        }
        let total = rows.len();

        // Per attribute: how often it appears, what shapes its values
        // take, and how many distinct values the sample holds.
        let mut seen: BTreeMap<String, (usize, AttributeType, Vec<String>)> = BTreeMap::new();
        for row in &rows {
            for (key, value) in row.iter() {
                let entry = seen
                    .entry(key.clone())
                    .or_insert((0, AttributeType::Unknown, Vec::new()));
                entry.0 += 1;
                let inferred = parse::infer_type(value);
                if entry.1 == AttributeType::Unknown {
                    entry.1 = inferred;
                }
                let rendered = value.to_string();
                if !entry.2.contains(&rendered) {
                    entry.2.push(rendered);
                }
            }
        }

        let mut session = self.session.lock().unwrap();
        let Some(entity) = session.entity_mut(name) else {
            return;
        };
        for (attr_name, (occurrences, inferred, distinct)) in seen {
            let nullable = occurrences < total;
            let cardinality = Some(distinct.len() as u64);
            match entity.attributes.iter_mut().find(|a| a.name == attr_name) {
                Some(attr) => {
                    if attr.inferred_type == AttributeType::Unknown {
                        attr.inferred_type = inferred;
                    }
                    attr.cardinality_estimate = cardinality;
                    attr.nullable = nullable;
                }
                None => entity.attributes.push(AttributeDescriptor {
                    name: attr_name,
                    inferred_type: inferred,
                    cardinality_estimate: cardinality,
                    nullable,
                }),
            }
        }
        session.touch();
    }

    /// Closing insights over the whole catalog. String templating only.
    fn summarize(&self) {
        let mut session = self.session.lock().unwrap();
        let entity_count = session.entities.len();
        let metric_count = session.metric_groups.len();
        session.insights.push(crate::types::Insight::new(
            "catalog-size",
            format!(
                "discovered {} record kind(s) and {} metric group(s)",
                entity_count, metric_count
            ),
        ));
        if let Some(top) = session
            .entities
            .iter()
            .max_by_key(|e| e.observed_volume)
            .filter(|e| e.observed_volume > 0)
        {
            let message = format!(
                "{} has the highest observed volume ({} records in the reference window)",
                top.name, top.observed_volume
            );
            session
                .insights
                .push(crate::types::Insight::new("top-volume", message));
        }
        session.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProgressConfig;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Executor that always times out and records every query text.
    struct AlwaysTimeout {
        seen: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl QueryExecutor for AlwaysTimeout {
        async fn execute(
            &self,
            query: &str,
            _options: &QueryOptions,
        ) -> DiscoveryResult<QueryResponse> {
            self.seen.lock().unwrap().push(query.to_string());
            Err(DiscoveryError::Timeout("budget exceeded".to_string()))
        }
    }

    /// Executor that fails transiently a fixed number of times, then
    /// succeeds with one row.
    struct FlakyThenOk {
        failures_left: StdMutex<u32>,
    }

    #[async_trait]
    impl QueryExecutor for FlakyThenOk {
        async fn execute(
            &self,
            _query: &str,
            _options: &QueryOptions,
        ) -> DiscoveryResult<QueryResponse> {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(DiscoveryError::Transient("connection reset".to_string()));
            }
            Ok(QueryResponse {
                results: vec![serde_json::json!({"count": 1})],
                ..QueryResponse::default()
            })
        }
    }

    struct AlwaysMalformed;

    #[async_trait]
    impl QueryExecutor for AlwaysMalformed {
        async fn execute(
            &self,
            _query: &str,
            _options: &QueryOptions,
        ) -> DiscoveryResult<QueryResponse> {
            Err(DiscoveryError::MalformedResponse("not json".to_string()))
        }
    }

    fn engine_with(executor: Arc<dyn QueryExecutor>, dir: &std::path::Path) -> DiscoveryEngine {
        let mut config = SurveyorConfig::default();
        config.progress = ProgressConfig {
            dir: dir.to_path_buf(),
            ..ProgressConfig::default()
        };
        let store = ProgressStore::new(&config.progress).unwrap();
        DiscoveryEngine::with_session(&config, executor, store, DiscoverySession::new())
    }

    #[tokio::test]
    async fn test_timeout_walks_ladder_then_abandons() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(AlwaysTimeout {
            seen: StdMutex::new(Vec::new()),
        });
        let engine = engine_with(executor.clone(), dir.path());

        let query = "SELECT count(*) FROM Tx SINCE 7 days ago".to_string();
        let result = engine
            .run_query(DiscoveryPhase::Entities, query, 100)
            .await
            .unwrap();
        assert!(result.is_none());

        let seen = executor.seen.lock().unwrap().clone();
        let expected = vec![
            "SELECT count(*) FROM Tx SINCE 7 days ago",
            "SELECT count(*) FROM Tx SINCE 1 day ago",
            "SELECT count(*) FROM Tx SINCE 6 hours ago",
            "SELECT count(*) FROM Tx SINCE 1 hour ago",
            "SELECT count(*) FROM Tx SINCE 30 minutes ago",
            "SELECT count(*) FROM Tx SINCE 10 minutes ago",
        ];
        assert_eq!(seen, expected, "one submission per rung, never a sixth retry");

        let session = engine.session();
        let session = session.lock().unwrap();
        assert_eq!(session.abandoned_queries, 1);
        assert_eq!(session.queries.len(), 1);
        assert_eq!(session.queries[0].outcome, QueryOutcome::Abandoned);
        assert_eq!(session.queries[0].attempts, 6);
    }

    #[tokio::test]
    async fn test_transient_errors_retry_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(FlakyThenOk {
            failures_left: StdMutex::new(2),
        });
        let engine = engine_with(executor, dir.path());

        let result = engine
            .run_query(
                DiscoveryPhase::Metrics,
                "SELECT count(*) FROM Metric SINCE 1 hour ago".to_string(),
                10,
            )
            .await
            .unwrap();
        assert!(result.is_some());

        let session = engine.session();
        let session = session.lock().unwrap();
        assert_eq!(session.failed_queries, 0);
        assert_eq!(session.queries[0].attempts, 3);
        assert_eq!(session.queries[0].outcome, QueryOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_transient_retries_exhausted_is_failed_not_abandoned() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(FlakyThenOk {
            failures_left: StdMutex::new(100),
        });
        let engine = engine_with(executor, dir.path());

        let result = engine
            .run_query(
                DiscoveryPhase::Metrics,
                "SELECT count(*) FROM Metric SINCE 1 hour ago".to_string(),
                10,
            )
            .await
            .unwrap();
        assert!(result.is_none());

        let session = engine.session();
        let session = session.lock().unwrap();
        assert_eq!(session.failed_queries, 1);
        assert_eq!(session.abandoned_queries, 0);
    }

    #[tokio::test]
    async fn test_malformed_response_is_empty_result() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(Arc::new(AlwaysMalformed), dir.path());

        let result = engine
            .run_query(
                DiscoveryPhase::Samples,
                "SELECT * FROM PageView SINCE 1 hour ago".to_string(),
                10,
            )
            .await
            .unwrap();
        let response = result.expect("malformed collapses to empty, not failure");
        assert!(response.results.is_empty());

        let session = engine.session();
        let session = session.lock().unwrap();
        assert_eq!(session.failed_queries, 0);
        assert_eq!(session.queries[0].outcome, QueryOutcome::Succeeded);
    }
}
