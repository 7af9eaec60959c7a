//! Concurrency and shutdown behavior of the reliability manager

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use reliability::{
    CircuitBreakerConfig, CircuitState, ErrorKind, RateLimitConfig, ReliabilityConfig,
    ReliabilityManager, RetryPolicy,
};
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_admissions_never_exceed_the_limit() {
    let manager = Arc::new(
        ReliabilityManager::new(
            ReliabilityConfig::default().with_rate_limit(
                RateLimitConfig::default()
                    .with_max_requests(50)
                    .with_window(Duration::from_secs(60)),
            ),
        )
        .expect("valid config"),
    );

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                (0..25)
                    .filter(|_| manager.check_rate_limit("events").is_ok())
                    .count()
            })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        admitted += handle.await.expect("task should complete");
    }

    assert_eq!(admitted, 50);
    let stats = manager.get_rate_limiter_stats();
    let global = &stats.keys["global"];
    assert_eq!(global.total_admitted, 50);
    assert_eq!(global.total_rejected, 150);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_failures_open_the_circuit() {
    let manager = Arc::new(
        ReliabilityManager::new(
            ReliabilityConfig::default().with_circuit_breaker(
                CircuitBreakerConfig::default()
                    .with_threshold(10)
                    .with_timeout(Duration::from_secs(60)),
            ),
        )
        .expect("valid config"),
    );
    let invoked = Arc::new(AtomicU32::new(0));

    let handles: Vec<_> = (0..40)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let invoked = Arc::clone(&invoked);
            tokio::spawn(async move {
                manager
                    .execute_with_circuit_breaker("storage:primary", || async move {
                        invoked.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(io::Error::other("down"))
                    })
                    .await
                    .unwrap_err()
                    .kind()
            })
        })
        .collect();

    let mut rejected = 0;
    for handle in handles {
        if handle.await.expect("task should complete") == ErrorKind::CircuitOpen {
            rejected += 1;
        }
    }

    let invoked = invoked.load(Ordering::SeqCst);
    assert!(invoked >= 10);
    assert_eq!(invoked + rejected, 40);
    assert_eq!(
        manager.get_circuit_breaker_stats()["storage:primary"].state,
        CircuitState::Open
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn keys_do_not_interfere_across_tasks() {
    let manager = Arc::new(
        ReliabilityManager::new(
            ReliabilityConfig::default()
                .with_circuit_breaker(CircuitBreakerConfig::default().with_threshold(1)),
        )
        .expect("valid config"),
    );

    let failing = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            let _ = manager
                .execute_with_circuit_breaker("storage:primary", || async {
                    Err::<(), _>(io::Error::other("down"))
                })
                .await;
        })
    };
    let healthy = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            for _ in 0..20 {
                manager
                    .execute_with_circuit_breaker("streaming:primary", || async {
                        Ok::<_, io::Error>(())
                    })
                    .await
                    .expect("independent key stays closed");
            }
        })
    };
    failing.await.expect("task should complete");
    healthy.await.expect("task should complete");

    let stats = manager.get_circuit_breaker_stats();
    assert_eq!(stats["storage:primary"].state, CircuitState::Open);
    assert_eq!(stats["streaming:primary"].state, CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_retry_backoff() {
    let manager = ReliabilityManager::new(
        ReliabilityConfig::default().with_retry(
            RetryPolicy::default()
                .with_max_retries(10)
                .with_backoff(Duration::from_secs(5)),
        ),
    )
    .expect("valid config");
    let calls = AtomicU32::new(0);

    let retrying = manager.execute_with_retry(
        || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(io::Error::other("timeout"))
        },
        "storage:primary",
    );
    let stop = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.shutdown();
    };

    let (result, ()) = tokio::join!(retrying, stop);
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(manager.get_error_stats().total, 0);
}

#[tokio::test]
async fn in_flight_operation_completes_across_shutdown() {
    let manager = ReliabilityManager::new(ReliabilityConfig::default()).expect("valid config");
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

    let in_flight = manager.execute_with_circuit_breaker("storage:primary", || async move {
        let _ = release_rx.await;
        Err::<(), _>(io::Error::other("late failure"))
    });
    let stop = async {
        tokio::task::yield_now().await;
        manager.shutdown();
        let _ = release_tx.send(());
    };

    let (result, ()) = tokio::join!(in_flight, stop);
    assert_eq!(result.unwrap_err().to_string(), "late failure");
    assert_eq!(manager.get_error_stats().total, 0);
    assert!(manager.get_circuit_breaker_stats().is_empty());
}

#[tokio::test(start_paused = true)]
async fn caller_token_cancels_only_its_own_sequence() {
    let manager = ReliabilityManager::new(
        ReliabilityConfig::default()
            .with_retry(RetryPolicy::default().with_backoff(Duration::from_millis(500))),
    )
    .expect("valid config");
    let token = CancellationToken::new();

    let cancelled = manager.execute_with_retry_cancellable(
        || async { Err::<(), _>(io::Error::other("timeout")) },
        "storage:a",
        &token,
    );
    let attempts = AtomicU32::new(0);
    let unaffected = manager.execute_with_retry(
        || async {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(io::Error::other("timeout"))
            } else {
                Ok("done")
            }
        },
        "storage:b",
    );
    let cancel = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    };

    let (cancelled, unaffected, ()) = tokio::join!(cancelled, unaffected, cancel);
    assert_eq!(cancelled.unwrap_err().kind(), ErrorKind::Cancelled);
    assert_eq!(unaffected.unwrap(), "done");
    assert!(!manager.is_shut_down());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_racing_new_keys_leaves_no_state() {
    let manager = Arc::new(
        ReliabilityManager::new(
            ReliabilityConfig::default()
                .with_rate_limit(RateLimitConfig::default().with_per_key(true)),
        )
        .expect("valid config"),
    );

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                for i in 0..200 {
                    let key = format!("storage:w{worker}-{i}");
                    let _ = manager.check_rate_limit(key.as_str());
                    let _ = manager
                        .execute_with_circuit_breaker(&key, || async { Ok::<_, io::Error>(()) })
                        .await;
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    tokio::task::yield_now().await;
    manager.shutdown();
    for handle in handles {
        handle.await.expect("task should complete");
    }

    assert!(manager.get_circuit_breaker_stats().is_empty());
    assert!(manager.get_rate_limiter_stats().keys.is_empty());
    assert_eq!(manager.get_error_stats().total, 0);
}
