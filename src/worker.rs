use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::service::SyncService;

/// Longest the retry timer sleeps when nothing is scheduled.
const IDLE_WAIT: Duration = Duration::from_secs(60);

/// Drain whenever the debounced connectivity state flips to online.
pub async fn run_online_watcher(
    service: Arc<SyncService>,
    mut online: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!("Online watcher started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            changed = online.changed() => {
                if changed.is_err() {
                    break;
                }
                if *online.borrow_and_update() {
                    tracing::info!("Connection restored, draining offline queue");
                    service.trigger_drain().await;
                }
            }
            _ = shutdown.changed() => {}
        }
    }

    tracing::debug!("Online watcher stopped");
}

/// Sleep until the earliest backoff deadline, then requeue whatever is due.
pub async fn run_retry_timer(service: Arc<SyncService>, mut shutdown: watch::Receiver<bool>) {
    tracing::debug!("Retry timer started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        service.fire_due_retries().await;

        let wait = service
            .scheduler()
            .next_deadline()
            .map(|at| {
                (at - service.clock().now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
            })
            .unwrap_or(IDLE_WAIT)
            .min(IDLE_WAIT);

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = service.scheduler().changed() => {}
            _ = shutdown.changed() => {}
        }
    }

    tracing::debug!("Retry timer stopped");
}
