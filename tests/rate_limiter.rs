use std::{
    sync::{
        Arc, Barrier,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use tokio::time::Instant;
use video_downloader::{RateLimiter, config::LimiterConfig};

fn limiter(max_requests: usize, window: Duration) -> RateLimiter {
    RateLimiter::new(LimiterConfig {
        max_requests,
        window,
    })
}

#[test]
fn concurrent_requests_never_exceed_the_limit() {
    let limiter = Arc::new(limiter(5, Duration::from_secs(60)));
    let admitted = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(16));
    let now = Instant::now();

    let handles = (0..16)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            let admitted = Arc::clone(&admitted);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..4 {
                    if limiter.admit_at(&"user:1".to_string(), now).is_ok() {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect::<Vec<_>>();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(admitted.load(Ordering::SeqCst), 5);
}

#[test]
fn concurrent_requests_respect_every_trailing_window() {
    const LIMIT: usize = 3;
    const WINDOW_SECS: u64 = 10;
    const STEPS: usize = 35;
    const CALLERS: usize = 8;

    let limiter = Arc::new(limiter(LIMIT, Duration::from_secs(WINDOW_SECS)));
    let admitted_per_step = Arc::new((0..STEPS).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>());
    let barrier = Arc::new(Barrier::new(CALLERS));
    let start = Instant::now();

    let handles = (0..CALLERS)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            let admitted_per_step = Arc::clone(&admitted_per_step);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                for step in 0..STEPS {
                    // Every caller fires at the same moment, one second apart.
                    barrier.wait();
                    let at = start + Duration::from_secs(step as u64);
                    if limiter.admit_at(&"user:1".to_string(), at).is_ok() {
                        admitted_per_step[step].fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect::<Vec<_>>();

    for handle in handles {
        handle.join().unwrap();
    }

    let admitted = admitted_per_step
        .iter()
        .map(|count| count.load(Ordering::SeqCst))
        .collect::<Vec<_>>();

    // A window ending at step t covers (t - WINDOW, t].
    for end in 0..STEPS {
        let first = (end + 1).saturating_sub(WINDOW_SECS as usize);
        let in_window: usize = admitted[first..=end].iter().sum();
        assert!(in_window <= LIMIT, "{in_window} admitted in window ending at {end}: {admitted:?}");
    }

    // The quota refills every time the window slides past the last burst.
    assert_eq!(admitted.iter().sum::<usize>(), LIMIT * 4, "{admitted:?}");
    for (step, count) in admitted.iter().enumerate() {
        let expected = if step % WINDOW_SECS as usize == 0 { LIMIT } else { 0 };
        assert_eq!(*count, expected, "step {step}: {admitted:?}");
    }
}

#[test]
fn concurrent_identities_are_limited_independently() {
    let limiter = Arc::new(limiter(3, Duration::from_secs(60)));
    let now = Instant::now();

    let handles = (0..8)
        .map(|id| {
            let limiter = Arc::clone(&limiter);
            thread::spawn(move || {
                let identity = format!("user:{id}");
                (0..10)
                    .filter(|_| limiter.admit_at(&identity, now).is_ok())
                    .count()
            })
        })
        .collect::<Vec<_>>();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), 3);
    }
    assert_eq!(limiter.tracked_identities(), 8);
}

#[tokio::test(start_paused = true)]
async fn window_slides_with_the_clock() {
    let limiter = limiter(2, Duration::from_secs(10));
    let user = "user:42".to_string();

    assert!(limiter.admit(&user).is_ok());
    tokio::time::advance(Duration::from_secs(4)).await;
    assert!(limiter.admit(&user).is_ok());

    let denied = limiter.admit(&user).unwrap_err();
    assert_eq!(denied.retry_after, Duration::from_secs(6));
    assert_eq!(denied.retry_after_secs(), 6);

    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(limiter.admit(&user).is_ok());

    let denied = limiter.admit(&user).unwrap_err();
    assert_eq!(denied.retry_after, Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn idle_identities_are_eventually_forgotten() {
    let limiter = limiter(1, Duration::from_secs(1));

    for id in 0..20 {
        limiter.admit(&format!("user:{id}")).unwrap();
    }
    assert_eq!(limiter.tracked_identities(), 20);

    tokio::time::advance(Duration::from_secs(11)).await;
    limiter.admit(&"user:fresh".to_string()).unwrap();

    assert_eq!(limiter.tracked_identities(), 1);
}
