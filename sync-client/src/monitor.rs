//! Background connection health monitor.
//!
//! Runs periodically to fold subscription failures into the process-wide
//! health aggregate and to trigger a mass reconnect when it turns unhealthy.

use sync_core::HealthVerdict;
use tokio::time::{interval_at, Instant};

use crate::config::HealthConfig;

/// Spawn the health monitor task on `runtime`.
///
/// `check` runs once per interval and returns `None` once the engine is
/// gone, which stops the task. The first check happens one full interval
/// after start.
pub(crate) fn spawn_health_monitor<F>(
    runtime: &tokio::runtime::Handle,
    config: HealthConfig,
    mut check: F,
) -> tokio::task::JoinHandle<()>
where
    F: FnMut() -> Option<HealthVerdict> + Send + 'static,
{
    runtime.spawn(async move {
        if !config.enabled {
            tracing::info!("Health monitor disabled");
            return;
        }

        let period = config.interval();
        tracing::info!("Health monitor started (interval: {:?})", period);

        let mut timer = interval_at(Instant::now() + period, period);

        loop {
            timer.tick().await;

            match check() {
                Some(HealthVerdict::Healthy) => {
                    tracing::debug!("Health check: healthy");
                }
                Some(HealthVerdict::Degraded {
                    consecutive_failures,
                }) => {
                    tracing::debug!(
                        "Health check: {} consecutive failing intervals",
                        consecutive_failures
                    );
                }
                Some(HealthVerdict::ReconnectAll {
                    consecutive_failures,
                }) => {
                    tracing::warn!(
                        "Health check: unhealthy after {} failing intervals, reconnecting all subscriptions",
                        consecutive_failures
                    );
                }
                None => {
                    tracing::debug!("Health monitor stopped");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn test_health_config(interval_secs: u64) -> HealthConfig {
        HealthConfig {
            enabled: true,
            interval_secs,
            failure_threshold: 3,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn checks_once_per_interval() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let handle = spawn_health_monitor(
            &tokio::runtime::Handle::current(),
            test_health_config(30),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Some(HealthVerdict::Healthy)
            },
        );

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(62)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_check_returns_none() {
        let handle = spawn_health_monitor(
            &tokio::runtime::Handle::current(),
            test_health_config(1),
            || None,
        );

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn disabled_monitor_exits_immediately() {
        let mut config = test_health_config(1);
        config.enabled = false;
        let handle = spawn_health_monitor(&tokio::runtime::Handle::current(), config, || {
            panic!("check must not run")
        });

        handle.await.unwrap();
    }
}
