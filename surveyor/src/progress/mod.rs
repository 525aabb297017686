//! Durable, checkpointed record of discovery state.
//!
//! Layout inside the configured directory:
//! - `checkpoint.json` — the canonical rolling checkpoint
//! - `checkpoint-<timestamp>.json` — rotated backups of previous saves
//! - `snapshots/<label>-<ISO-timestamp>.json` — named, permanent copies
//!
//! Saves are atomic: serialize to a temp file in the same directory,
//! fsync, rename over the canonical path, fsync the directory. A reader
//! never observes a half-written checkpoint.

use crate::config::ProgressConfig;
use crate::errors::DiscoveryResult;
use crate::types::{Checkpoint, DiscoveryPhase, DiscoverySession, CHECKPOINT_VERSION};
use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CHECKPOINT_FILE: &str = "checkpoint.json";
const CHECKPOINT_TMP: &str = "checkpoint.json.tmp";
const BACKUP_PREFIX: &str = "checkpoint-";
const SNAPSHOT_DIR: &str = "snapshots";

/// Heuristic, monotonically non-decreasing progress estimate. Purely
/// informational.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEstimate {
    pub percentage: u8,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ProgressStore {
    dir: PathBuf,
    staleness_ceiling: chrono::Duration,
    max_backups: usize,
    checkpoint_interval: std::time::Duration,
    poll_interval: std::time::Duration,
}

impl ProgressStore {
    pub fn new(config: &ProgressConfig) -> DiscoveryResult<Self> {
        fs::create_dir_all(&config.dir)?;
        fs::create_dir_all(config.dir.join(SNAPSHOT_DIR))?;
        Ok(Self {
            dir: config.dir.clone(),
            staleness_ceiling: config.staleness_ceiling(),
            max_backups: config.max_backups,
            checkpoint_interval: config.checkpoint_interval(),
            poll_interval: config.poll_interval(),
        })
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    /// Read the checkpoint if present, fresh, and well-formed. Missing,
    /// corrupt, or stale checkpoints all fall back to `None` (start
    /// fresh); the decision is logged for operator visibility.
    pub fn load(&self) -> DiscoveryResult<Option<Checkpoint>> {
        let path = self.checkpoint_path();
        if !path.exists() {
            info!(path = %path.display(), "no checkpoint found, starting fresh");
            return Ok(None);
        }
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable checkpoint, starting fresh");
                return Ok(None);
            }
        };
        let checkpoint: Checkpoint = match serde_json::from_str(&content) {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt checkpoint, starting fresh");
                return Ok(None);
            }
        };
        if checkpoint.version != CHECKPOINT_VERSION {
            warn!(
                found = checkpoint.version,
                expected = CHECKPOINT_VERSION,
                "checkpoint format version mismatch, starting fresh"
            );
            return Ok(None);
        }
        let age = checkpoint.age();
        if age > self.staleness_ceiling {
            info!(
                age_hours = age.num_hours(),
                ceiling_hours = self.staleness_ceiling.num_hours(),
                "checkpoint exceeds staleness ceiling, discarding"
            );
            return Ok(None);
        }
        info!(
            age_minutes = age.num_minutes(),
            phase = checkpoint.session.phase.label(),
            "resuming from checkpoint"
        );
        Ok(Some(checkpoint))
    }

    /// Write a full checkpoint atomically, rotating the previous one
    /// into a timestamped backup first.
    pub fn save(&self, session: &DiscoverySession) -> DiscoveryResult<PathBuf> {
        let path = self.checkpoint_path();
        let checkpoint = Checkpoint::new(session.clone());
        let json = serde_json::to_string_pretty(&checkpoint)?;

        if path.exists() {
            self.rotate_backup(&path)?;
        }
        self.atomic_write(&path, json.as_bytes())?;
        self.prune_backups();
        debug!(path = %path.display(), revision = session.revision, "checkpoint saved");
        Ok(path)
    }

    /// Write a permanently retained, labelled copy of the current state,
    /// independent of checkpoint rotation.
    pub fn snapshot(&self, session: &DiscoverySession, label: &str) -> DiscoveryResult<PathBuf> {
        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ");
        let path = self
            .dir
            .join(SNAPSHOT_DIR)
            .join(format!("{}-{}.json", sanitize_label(label), stamp));
        let checkpoint = Checkpoint::new(session.clone());
        let json = serde_json::to_string_pretty(&checkpoint)?;
        self.atomic_write(&path, json.as_bytes())?;
        info!(path = %path.display(), label, "snapshot written");
        Ok(path)
    }

    pub fn list_snapshots(&self) -> DiscoveryResult<Vec<PathBuf>> {
        let dir = self.dir.join(SNAPSHOT_DIR);
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }

    pub fn load_snapshot(path: &Path) -> DiscoveryResult<Checkpoint> {
        let content = fs::read_to_string(path)?;
        let checkpoint = serde_json::from_str(&content)?;
        Ok(checkpoint)
    }

    /// Progress derived from how far the phase sequence has advanced.
    /// Monotone because phases only move forward.
    pub fn estimate_progress(session: &DiscoverySession) -> ProgressEstimate {
        let completed = session.phase.completed_count();
        let total = DiscoveryPhase::ACTIVE.len();
        let percentage = (completed * 100 / total) as u8;
        let message = format!(
            "{}/{} phases complete ({} entities, {} metric groups, {} queries, {} abandoned)",
            completed,
            total,
            session.entities.len(),
            session.metric_groups.len(),
            session.queries.len(),
            session.abandoned_queries,
        );
        ProgressEstimate {
            percentage,
            message,
        }
    }

    /// Spawn the periodic autosave loop. Saves whenever the session
    /// revision has advanced since the last save, or unconditionally
    /// once per checkpoint interval; polling granularity is capped
    /// independently of the interval.
    pub fn start_autosave(&self, session: Arc<Mutex<DiscoverySession>>) -> AutosaveHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let store = self.clone();
        let interval = self.checkpoint_interval;
        let poll = self.poll_interval;

        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(poll);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Swallow the immediate first tick.
            tick.tick().await;
            let mut last_save = tokio::time::Instant::now();
            let mut last_revision = session.lock().unwrap().revision;

            loop {
                tick.tick().await;
                if stop_flag.load(Ordering::SeqCst) {
                    break;
                }
                let interval_due = last_save.elapsed() >= interval;
                let copy = {
                    let guard = session.lock().unwrap();
                    if guard.revision == last_revision && !interval_due {
                        continue;
                    }
                    guard.clone()
                };
                match store.save(&copy) {
                    Ok(_) => {
                        last_revision = copy.revision;
                        last_save = tokio::time::Instant::now();
                    }
                    Err(e) => warn!(error = %e, "autosave failed, discovery continues in memory"),
                }
            }
        });

        AutosaveHandle { stop, task }
    }

    /// Copy the current checkpoint aside under an embedded timestamp.
    fn rotate_backup(&self, path: &Path) -> DiscoveryResult<()> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6fZ");
        let backup = self.dir.join(format!("{}{}.json", BACKUP_PREFIX, stamp));
        fs::copy(path, &backup)?;
        Ok(())
    }

    /// Keep only the most recent `max_backups` backup files. Prune
    /// failures are logged, never fatal.
    fn prune_backups(&self) {
        let mut backups: Vec<PathBuf> = match fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with(BACKUP_PREFIX) && n.ends_with(".json"))
                        .unwrap_or(false)
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "failed to enumerate checkpoint backups");
                return;
            }
        };
        // Timestamps sort lexicographically, oldest first.
        backups.sort();
        while backups.len() > self.max_backups {
            let victim = backups.remove(0);
            if let Err(e) = fs::remove_file(&victim) {
                warn!(path = %victim.display(), error = %e, "failed to prune backup");
            }
        }
    }

    /// Temp-write then atomic rename in the same directory, with fsync
    /// of both the file and the directory entry.
    fn atomic_write(&self, path: &Path, data: &[u8]) -> DiscoveryResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = match path.file_name().and_then(|n| n.to_str()) {
            Some(CHECKPOINT_FILE) => self.dir.join(CHECKPOINT_TMP),
            _ => path.with_extension("json.tmp"),
        };
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(data)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        if let Some(dir) = path.parent() {
            if let Ok(dir_file) = fs::File::open(dir) {
                let _ = dir_file.sync_all();
            }
        }
        Ok(())
    }
}

/// Handle for the background autosave task.
pub struct AutosaveHandle {
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl AutosaveHandle {
    /// Stop the loop. Any save already in progress is unaffected by the
    /// abort thanks to the temp-write-then-rename discipline.
    pub fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        self.task.abort();
    }
}

fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
