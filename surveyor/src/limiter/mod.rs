//! Rate limiting for calls into the remote API.
//!
//! A single dispatch loop owns every counter (token bucket, rolling
//! minute window, FIFO queue); callers hand it zero-argument async tasks
//! through a bounded channel and get the task's result back on a oneshot.
//! Nothing outside the loop touches the counters.

use crate::config::LimiterConfig;
use crate::errors::{DiscoveryError, DiscoveryResult};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{broadcast, mpsc, oneshot, Semaphore};
use tokio::time::Instant;
use tracing::{debug, trace};

const WINDOW: Duration = Duration::from_secs(60);
const QUEUE_CAPACITY: usize = 1024;

type Job = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Advisory events emitted by the dispatch loop. Not part of the
/// correctness contract.
#[derive(Debug, Clone)]
pub enum RateLimiterEvent {
    /// Emitted before each token-wait sleep.
    RateLimitReached { wait: Duration },
    /// Periodic operational stats.
    Stats {
        queue_depth: usize,
        tokens_remaining: f64,
        window_remaining: Duration,
    },
}

/// Thread-safe handle to the dispatch loop. Cheap to clone; the loop
/// exits once every handle is dropped and the queue drains.
#[derive(Clone)]
pub struct RateLimiter {
    jobs: mpsc::Sender<Job>,
    events: broadcast::Sender<RateLimiterEvent>,
}

impl RateLimiter {
    /// Spawn the dispatch loop. Requires a running tokio runtime.
    pub fn new(config: &LimiterConfig) -> Self {
        let (jobs_tx, jobs_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (events_tx, _) = broadcast::channel(64);
        let dispatch = DispatchLoop::new(config, jobs_rx, events_tx.clone());
        tokio::spawn(dispatch.run());
        Self {
            jobs: jobs_tx,
            events: events_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RateLimiterEvent> {
        self.events.subscribe()
    }

    /// Run `task` under the concurrency and throughput limits. Task
    /// failures propagate to this caller untouched; the limiter itself
    /// only errors when its loop has shut down.
    pub async fn execute<T, F, Fut>(&self, task: F) -> DiscoveryResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = DiscoveryResult<T>> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            Box::pin(async move {
                let _ = reply_tx.send(task().await);
            })
        });
        self.jobs.send(job).await.map_err(|_| {
            DiscoveryError::Transient("rate limiter dispatch loop stopped".to_string())
        })?;
        reply_rx.await.map_err(|_| {
            DiscoveryError::Transient("rate limiter dropped task reply".to_string())
        })?
    }
}

/// State owned exclusively by the dispatch loop task.
struct DispatchLoop {
    jobs_rx: mpsc::Receiver<Job>,
    queue: VecDeque<Job>,
    gate: Arc<Semaphore>,
    events: broadcast::Sender<RateLimiterEvent>,
    queries_per_minute: u32,
    capacity: f64,
    /// Tokens refilled per millisecond: capacity / 60_000.
    rate_per_ms: f64,
    tokens: f64,
    last_refill: Instant,
    minute_count: u32,
    window_start: Instant,
    stats_interval: Duration,
}

impl DispatchLoop {
    fn new(
        config: &LimiterConfig,
        jobs_rx: mpsc::Receiver<Job>,
        events: broadcast::Sender<RateLimiterEvent>,
    ) -> Self {
        let capacity = config.queries_per_minute as f64;
        let now = Instant::now();
        Self {
            jobs_rx,
            queue: VecDeque::new(),
            gate: Arc::new(Semaphore::new(config.max_concurrent)),
            events,
            queries_per_minute: config.queries_per_minute,
            capacity,
            rate_per_ms: capacity / 60_000.0,
            tokens: capacity,
            last_refill: now,
            minute_count: 0,
            window_start: now,
            stats_interval: config.stats_interval(),
        }
    }

    async fn run(mut self) {
        let mut stats_tick = tokio::time::interval(self.stats_interval);
        stats_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            // Opportunistically drain the submission channel so queue
            // depth stats are honest and FIFO order is preserved.
            loop {
                match self.jobs_rx.try_recv() {
                    Ok(job) => self.queue.push_back(job),
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }

            if self.queue.is_empty() {
                tokio::select! {
                    incoming = self.jobs_rx.recv() => match incoming {
                        Some(job) => self.queue.push_back(job),
                        // Every handle dropped and nothing pending.
                        None => break,
                    },
                    _ = stats_tick.tick() => self.emit_stats(),
                }
                continue;
            }

            self.refill();

            if self.tokens < 1.0 {
                let wait = self.time_until_token();
                let _ = self
                    .events
                    .send(RateLimiterEvent::RateLimitReached { wait });
                debug!(wait_ms = wait.as_millis() as u64, "token bucket empty, backing off");
                tokio::time::sleep(wait).await;
                continue;
            }

            if self.window_start.elapsed() >= WINDOW {
                self.reset_window();
            }
            if self.minute_count >= self.queries_per_minute {
                let wait = WINDOW.saturating_sub(self.window_start.elapsed());
                debug!(
                    wait_ms = wait.as_millis() as u64,
                    "per-minute budget spent, waiting for window rollover"
                );
                tokio::time::sleep(wait).await;
                self.reset_window();
            }

            // Concurrency gate: acquired here, released when the spawned
            // job finishes. Keeps dispatch order FIFO.
            let permit = match self.gate.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            if let Some(job) = self.queue.pop_front() {
                self.tokens -= 1.0;
                self.minute_count += 1;
                tokio::spawn(async move {
                    let _permit = permit;
                    job().await;
                });
            }
        }
        trace!("rate limiter dispatch loop exited");
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed_ms = now.duration_since(self.last_refill).as_secs_f64() * 1000.0;
        self.tokens = (self.tokens + elapsed_ms * self.rate_per_ms).min(self.capacity);
        self.last_refill = now;
    }

    /// Exact wait until one whole token has accumulated.
    fn time_until_token(&self) -> Duration {
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        let needed = 1.0 - self.tokens;
        Duration::from_secs_f64(needed / self.rate_per_ms / 1000.0)
    }

    fn reset_window(&mut self) {
        self.minute_count = 0;
        self.window_start = Instant::now();
    }

    fn emit_stats(&self) {
        let stats = RateLimiterEvent::Stats {
            queue_depth: self.queue.len(),
            tokens_remaining: self.tokens,
            window_remaining: WINDOW.saturating_sub(self.window_start.elapsed()),
        };
        trace!(?stats, "rate limiter stats");
        let _ = self.events.send(stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(qpm: u32, max_concurrent: usize) -> LimiterConfig {
        LimiterConfig {
            queries_per_minute: qpm,
            max_concurrent,
            stats_interval_secs: 10,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_capped_by_token_capacity() {
        // Capacity 3: exactly 3 tasks start before any refill.
        let limiter = RateLimiter::new(&config(3, 10));
        let started = Arc::new(std::sync::Mutex::new(Vec::new()));
        let t0 = Instant::now();

        let mut handles = Vec::new();
        for i in 0..5u32 {
            let limiter = limiter.clone();
            let started = Arc::clone(&started);
            handles.push(tokio::spawn(async move {
                limiter
                    .execute(move || async move {
                        started.lock().unwrap().push((i, t0.elapsed()));
                        Ok::<_, DiscoveryError>(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let starts = started.lock().unwrap().clone();
        assert_eq!(starts.len(), 5);
        let immediate = starts
            .iter()
            .filter(|(_, at)| *at < Duration::from_secs(1))
            .count();
        assert_eq!(immediate, 3);
        // The remaining two waited for refills (20s per token at 3/min).
        for (_, at) in starts.iter().filter(|(_, at)| *at >= Duration::from_secs(1)) {
            assert!(*at >= Duration::from_secs(19), "start at {:?}", at);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_dispatch_order() {
        let limiter = RateLimiter::new(&config(60, 1));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..6u32 {
            let limiter = limiter.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                limiter
                    .execute(move || async move {
                        order.lock().unwrap().push(i);
                        Ok::<_, DiscoveryError>(())
                    })
                    .await
            }));
            // Ensure submission order matches spawn order.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_failure_does_not_stop_dispatch() {
        let limiter = RateLimiter::new(&config(60, 2));
        let failed: DiscoveryResult<()> = limiter
            .execute(|| async { Err(DiscoveryError::Transient("boom".to_string())) })
            .await;
        assert!(matches!(failed, Err(DiscoveryError::Transient(_))));

        let ok = limiter.execute(|| async { Ok::<_, DiscoveryError>(42) }).await;
        assert_eq!(ok.unwrap(), 42);
    }
}
