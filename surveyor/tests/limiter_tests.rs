//! Rate limiter admission-control properties.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use surveyor::config::LimiterConfig;
use surveyor::{DiscoveryError, RateLimiter, RateLimiterEvent};

fn config(qpm: u32, max_concurrent: usize) -> LimiterConfig {
    LimiterConfig {
        queries_per_minute: qpm,
        max_concurrent,
        stats_interval_secs: 10,
    }
}

/// queries_per_minute=60, max_concurrent=2, 10 tasks of 50ms each:
/// completion takes at least 10/2 * 50ms, the concurrency bound is never
/// exceeded, and the per-minute budget is never touched.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_bound_without_throttling() {
    let limiter = RateLimiter::new(&config(60, 2));
    let mut events = limiter.subscribe();

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let started = std::time::Instant::now();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let limiter = limiter.clone();
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        handles.push(tokio::spawn(async move {
            limiter
                .execute(move || async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, DiscoveryError>(())
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(250),
        "10 tasks at 2 concurrent x 50ms must take >= 250ms, took {:?}",
        elapsed
    );
    assert!(peak.load(Ordering::SeqCst) <= 2, "max_concurrent exceeded");

    // Budget of 60/min was never exhausted by 10 starts.
    let mut throttled = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, RateLimiterEvent::RateLimitReached { .. }) {
            throttled += 1;
        }
    }
    assert_eq!(throttled, 0, "no rateLimitReached events expected");
}

/// No rolling 60-second window ever sees more task starts than the
/// per-minute budget, even though the token bucket keeps refilling.
#[tokio::test(start_paused = true)]
async fn test_rolling_minute_window_cap() {
    let qpm = 3;
    let limiter = RateLimiter::new(&config(qpm, 10));
    let starts = Arc::new(Mutex::new(Vec::new()));
    let t0 = tokio::time::Instant::now();

    let mut handles = Vec::new();
    for _ in 0..7 {
        let limiter = limiter.clone();
        let starts = Arc::clone(&starts);
        handles.push(tokio::spawn(async move {
            limiter
                .execute(move || async move {
                    starts.lock().unwrap().push(t0.elapsed());
                    Ok::<_, DiscoveryError>(())
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let mut starts = starts.lock().unwrap().clone();
    starts.sort();
    assert_eq!(starts.len(), 7);

    // Slide a 60s window across every start.
    for (i, window_open) in starts.iter().enumerate() {
        let window_close = *window_open + Duration::from_secs(60);
        let in_window = starts[i..]
            .iter()
            .filter(|at| **at < window_close)
            .count();
        assert!(
            in_window <= qpm as usize,
            "{} starts within 60s of {:?}",
            in_window,
            window_open
        );
    }
}

/// Token bucket capacity bounds the initial burst: with capacity 3 only
/// 3 tasks may start before any refill time has passed.
#[tokio::test(start_paused = true)]
async fn test_initial_burst_limited_to_capacity() {
    let limiter = RateLimiter::new(&config(3, 10));
    let starts = Arc::new(Mutex::new(Vec::new()));
    let t0 = tokio::time::Instant::now();

    let mut handles = Vec::new();
    for _ in 0..5 {
        let limiter = limiter.clone();
        let starts = Arc::clone(&starts);
        handles.push(tokio::spawn(async move {
            limiter
                .execute(move || async move {
                    starts.lock().unwrap().push(t0.elapsed());
                    Ok::<_, DiscoveryError>(())
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let starts = starts.lock().unwrap().clone();
    let immediate = starts
        .iter()
        .filter(|at| **at < Duration::from_secs(1))
        .count();
    assert_eq!(immediate, 3, "burst must be capped at token capacity");
}

/// Waiting for a token emits the advisory throttle event with the
/// computed wait.
#[tokio::test(start_paused = true)]
async fn test_throttle_event_emitted_when_bucket_empty() {
    let limiter = RateLimiter::new(&config(3, 10));
    let mut events = limiter.subscribe();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let limiter = limiter.clone();
        handles.push(tokio::spawn(async move {
            limiter
                .execute(|| async { Ok::<_, DiscoveryError>(()) })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let mut waits = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let RateLimiterEvent::RateLimitReached { wait } = event {
            waits.push(wait);
        }
    }
    assert!(!waits.is_empty(), "4th task must report a throttle wait");
    // One token at 3/minute takes 20s to accumulate.
    assert!(waits.iter().any(|w| *w > Duration::from_secs(15)));
}
