use chrono::{Duration as ChronoDuration, Utc};
use llmpanel::rate_limiter::{LimitKind, RateLimit, RateLimiter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_concurrent_admissions_never_exceed_rpm() {
    let limiter = Arc::new(RateLimiter::new().with_limit("gpt-4o", RateLimit::new(10, 1_000_000)));
    let admitted = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            let admitted = Arc::clone(&admitted);
            std::thread::spawn(move || {
                if limiter.check_allowance("gpt-4o", 10, 10, true).is_ok() {
                    admitted.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(admitted.load(Ordering::SeqCst), 10);
    assert_eq!(limiter.usage("gpt-4o").requests, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_admissions_never_exceed_tpm() {
    let limiter = Arc::new(RateLimiter::new().with_limit("gpt-4o", RateLimit::new(1_000, 1_000)));

    let tasks: Vec<_> = (0..30)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.check_allowance("gpt-4o", 50, 50, true).is_ok() })
        })
        .collect();

    let mut admitted = 0;
    for task in tasks {
        if task.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 10);
    assert!(limiter.usage("gpt-4o").tokens <= 1_000);
}

#[test]
fn test_dry_run_does_not_reserve() {
    let limiter = RateLimiter::new().with_limit("gpt-4o", RateLimit::new(1, 10_000));
    for _ in 0..5 {
        assert!(limiter.check_allowance("gpt-4o", 10, 10, false).is_ok());
    }
    assert_eq!(limiter.usage("gpt-4o").requests, 0);
    assert!(limiter.check_allowance("gpt-4o", 10, 10, true).is_ok());
    assert!(limiter.check_allowance("gpt-4o", 10, 10, false).is_err());
}

#[test]
fn test_model_names_share_a_window_after_normalization() {
    let limiter = RateLimiter::new().with_limit("claude-3-5-sonnet", RateLimit::new(1, 10_000));
    limiter
        .check_allowance("Claude 3.5 Sonnet", 1, 1, true)
        .unwrap();
    let err = limiter
        .check_allowance("claude-3-5-sonnet-20241022", 1, 1, true)
        .unwrap_err();
    assert_eq!(err.model, "claude-3-5-sonnet");
}

#[test]
fn test_unknown_model_gets_conservative_limit() {
    let limiter = RateLimiter::new();
    assert_eq!(limiter.limit_for("some-local-model"), RateLimit::CONSERVATIVE);
}

#[test]
fn test_retry_after_tracks_oldest_request() {
    let limiter = RateLimiter::new().with_limit("gpt-4o", RateLimit::new(2, 1_000_000));
    let now = Utc::now();
    limiter
        .check_allowance_at("gpt-4o", 1, 1, true, now - ChronoDuration::seconds(50))
        .unwrap();
    limiter
        .check_allowance_at("gpt-4o", 1, 1, true, now - ChronoDuration::seconds(10))
        .unwrap();

    let err = limiter
        .check_allowance_at("gpt-4o", 1, 1, true, now)
        .unwrap_err();
    assert_eq!(err.binding, LimitKind::Requests);
    assert_eq!(err.retry_after, Duration::from_secs(10));
    assert_eq!(err.current_requests, 2);
}

#[test]
fn test_retry_after_tracks_tokens_aging_out() {
    let limiter = RateLimiter::new().with_limit("gpt-4o", RateLimit::new(100, 1_000));
    let now = Utc::now();
    limiter
        .check_allowance_at("gpt-4o", 300, 0, true, now - ChronoDuration::seconds(40))
        .unwrap();
    limiter
        .check_allowance_at("gpt-4o", 600, 0, true, now - ChronoDuration::seconds(20))
        .unwrap();

    // 900 in window; 400 more needs 300 freed, which the oldest entry provides.
    let err = limiter
        .check_allowance_at("gpt-4o", 400, 0, true, now)
        .unwrap_err();
    assert_eq!(err.binding, LimitKind::Tokens);
    assert_eq!(err.retry_after, Duration::from_secs(20));
}

#[test]
fn test_oversized_request_waits_full_window() {
    let limiter = RateLimiter::new().with_limit("gpt-4o", RateLimit::new(100, 1_000));
    let err = limiter.check_allowance("gpt-4o", 2_000, 0, true).unwrap_err();
    assert_eq!(err.binding, LimitKind::Tokens);
    assert_eq!(err.retry_after, limiter.window());
}

#[test]
fn test_entries_expire_after_window() {
    let limiter = RateLimiter::new().with_limit("gpt-4o", RateLimit::new(1, 1_000));
    let now = Utc::now();
    limiter
        .check_allowance_at("gpt-4o", 1, 1, true, now - ChronoDuration::seconds(60))
        .unwrap();
    assert!(limiter.check_allowance_at("gpt-4o", 1, 1, true, now).is_ok());
}

#[test]
fn test_persistence_round_trip_reproduces_decisions() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("rate_limiter_state.json");

    let before = RateLimiter::with_persistence(&path).unwrap();
    before.set_limit("gpt-4o", RateLimit::new(3, 1_000));
    for _ in 0..2 {
        before.check_allowance("gpt-4o", 100, 100, true).unwrap();
    }
    before.save().unwrap();

    let after = RateLimiter::with_persistence(&path).unwrap();
    after.set_limit("gpt-4o", RateLimit::new(3, 1_000));

    for (input, output) in [(100, 100), (300, 300), (500, 500)] {
        assert_eq!(
            before.check_allowance("gpt-4o", input, output, false).is_ok(),
            after.check_allowance("gpt-4o", input, output, false).is_ok(),
            "decision differs for {} tokens",
            input + output
        );
    }
    assert_eq!(after.usage("gpt-4o").requests, 2);
    assert_eq!(after.usage("gpt-4o").tokens, 400);
}

#[test]
fn test_merge_on_save_keeps_both_writers() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("rate_limiter_state.json");
    let now = Utc::now();

    let first = RateLimiter::with_persistence(&path).unwrap();
    let second = RateLimiter::with_persistence(&path).unwrap();
    for secs in [1, 2] {
        first
            .check_allowance_at("gpt-4o", 10, 0, true, now - ChronoDuration::seconds(secs))
            .unwrap();
    }
    for secs in [3, 4, 5] {
        second
            .check_allowance_at("gpt-4o", 20, 0, true, now - ChronoDuration::seconds(secs))
            .unwrap();
    }

    first.save().unwrap();
    second.save().unwrap();

    let reader = RateLimiter::with_persistence(&path).unwrap();
    let usage = reader.usage("gpt-4o");
    assert_eq!(usage.requests, 5);
    assert_eq!(usage.tokens, 80);
    // The second writer absorbed the first writer's entries when it saved.
    assert_eq!(second.usage("gpt-4o").requests, 5);
}

#[test]
fn test_repeated_saves_do_not_duplicate_entries() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    let limiter = RateLimiter::with_persistence(&path).unwrap();
    limiter.check_allowance("gpt-4o", 10, 10, true).unwrap();
    limiter.save().unwrap();
    limiter.save().unwrap();
    limiter.load().unwrap();

    let reader = RateLimiter::with_persistence(&path).unwrap();
    assert_eq!(reader.usage("gpt-4o").requests, 1);
    assert_eq!(limiter.usage("gpt-4o").requests, 1);
}

#[test]
fn test_expired_entries_are_dropped_on_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    let limiter = RateLimiter::with_persistence(&path).unwrap();
    limiter
        .check_allowance_at("gpt-4o", 10, 10, true, Utc::now() - ChronoDuration::seconds(59))
        .unwrap();
    limiter.save().unwrap();

    std::thread::sleep(Duration::from_millis(1_100));
    let reader = RateLimiter::with_persistence(&path).unwrap();
    assert_eq!(reader.usage("gpt-4o").requests, 0);
}

#[test]
fn test_clear_removes_memory_and_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    let limiter = RateLimiter::with_persistence(&path).unwrap();
    limiter.check_allowance("gpt-4o", 10, 10, true).unwrap();
    limiter.save().unwrap();
    assert!(path.exists());

    limiter.clear().unwrap();
    assert!(!path.exists());
    assert_eq!(limiter.usage("gpt-4o").requests, 0);
    // Clearing twice is fine.
    limiter.clear().unwrap();
}

#[test]
fn test_check_capacity_for_a_batch() {
    let limiter = RateLimiter::new().with_limit("gpt-4o", RateLimit::new(3, 10_000));
    assert!(limiter.check_capacity("gpt-4o", 3, 3_000).is_ok());
    let err = limiter.check_capacity("gpt-4o", 4, 3_000).unwrap_err();
    assert_eq!(err.binding, LimitKind::Requests);
    assert_eq!(limiter.usage("gpt-4o").requests, 0);
}

#[test]
fn test_simultaneous_saves_from_two_processes_lose_nothing() {
    let limit = RateLimit::new(1_000, 10_000_000);
    for _ in 0..20 {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rate_limits.json");
        let now = Utc::now();

        let writers: Vec<Arc<RateLimiter>> = (0..2u64)
            .map(|writer| {
                let limiter = RateLimiter::with_persistence(&path)
                    .unwrap()
                    .with_limit("m", limit);
                for i in 0..50u64 {
                    let at = now - ChronoDuration::milliseconds(i as i64);
                    let tokens = (writer * 1_000 + i) as usize;
                    limiter.check_allowance_at("m", tokens, 0, true, at).unwrap();
                }
                Arc::new(limiter)
            })
            .collect();

        let barrier = Arc::new(Barrier::new(writers.len()));
        let handles: Vec<_> = writers
            .iter()
            .map(|limiter| {
                let limiter = Arc::clone(limiter);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    limiter.save().unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let reader = RateLimiter::with_persistence(&path).unwrap();
        assert_eq!(reader.usage("m").requests, 100);
    }
}
