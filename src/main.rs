//! Demo: push a burst of telemetry events through a flaky storage sink.
//!
//! The primary sink fails every third write. Writes go through retry and the
//! circuit breaker, and fall back to an in-memory buffer when retries run out.
//! The final health snapshot is printed as JSON.
//!
//! `RUST_LOG` controls verbosity (default `info`); set
//! `RELIABILITY_LOG_JSON=1` for JSON log lines. Pass a YAML file path as the
//! first argument to override the built-in config.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use reliability::{
    CircuitBreakerConfig, RateLimitConfig, ReliabilityConfig, ReliabilityManager, RetryPolicy,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Storage sink that fails every `fail_every`-th write.
struct FlakySink {
    writes: AtomicU64,
    fail_every: u64,
}

impl FlakySink {
    async fn write(&self, event: &str) -> Result<usize, std::io::Error> {
        tokio::time::sleep(Duration::from_millis(2)).await;
        let n = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if n % self.fail_every == 0 {
            Err(std::io::Error::other(format!("storage timeout writing {event}")))
        } else {
            Ok(event.len())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("RELIABILITY_LOG_JSON").is_ok_and(|v| v == "1");

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config() -> anyhow::Result<ReliabilityConfig> {
    match std::env::args().nth(1) {
        Some(path) => ReliabilityConfig::from_file(&path)
            .with_context(|| format!("loading reliability config from {path}")),
        None => Ok(ReliabilityConfig::default()
            .with_circuit_breaker(
                CircuitBreakerConfig::default()
                    .with_threshold(3)
                    .with_timeout(Duration::from_millis(200)),
            )
            .with_rate_limit(
                RateLimitConfig::default()
                    .with_max_requests(40)
                    .with_window(Duration::from_secs(1))
                    .with_per_key(true),
            )
            .with_retry(
                RetryPolicy::default()
                    .with_max_retries(2)
                    .with_backoff(Duration::from_millis(20))
                    .with_jitter(true),
            )),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = load_config()?;
    let manager = ReliabilityManager::new(config).context("invalid reliability config")?;
    let sink = FlakySink {
        writes: AtomicU64::new(0),
        fail_every: 3,
    };
    let buffered = AtomicU64::new(0);

    for i in 0..50 {
        let tenant = if i % 2 == 0 { "tenant-a" } else { "tenant-b" };
        if let Err(err) = manager.check_rate_limit(tenant) {
            warn!(tenant, error = %err, "event_dropped");
            continue;
        }

        let event = format!("{tenant}:event-{i}");
        let stored = manager
            .execute_with_graceful_degradation(
                || {
                    manager.execute_with_retry(
                        || {
                            manager.execute_with_circuit_breaker("storage:primary", || {
                                sink.write(&event)
                            })
                        },
                        "storage:primary",
                    )
                },
                || async {
                    buffered.fetch_add(1, Ordering::Relaxed);
                    Ok::<_, std::io::Error>(event.len())
                },
                "storage:write",
            )
            .await;

        match stored {
            Ok(bytes) => info!(event = %event, bytes, "event_stored"),
            Err(err) => warn!(event = %event, error = %err, "event_lost"),
        }
    }

    let health = manager.get_health_status();
    println!("{}", serde_json::to_string_pretty(&health)?);
    println!(
        "{}",
        serde_json::to_string_pretty(&manager.get_error_stats())?
    );
    info!(
        buffered = buffered.load(Ordering::Relaxed),
        status = health.status.as_str(),
        "demo_finished"
    );

    manager.shutdown();
    Ok(())
}
