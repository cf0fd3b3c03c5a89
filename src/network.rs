use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::lock;

type TransitionCallback = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, TransitionCallback)>>,
}

impl Callbacks {
    fn snapshot(&self) -> Vec<TransitionCallback> {
        lock(&self.entries).iter().map(|(_, cb)| cb.clone()).collect()
    }
}

/// Debounced view of a raw connectivity signal.
///
/// A raw change only becomes a transition once the signal has held the new
/// value for the whole debounce window. Flapping inside the window restarts it.
#[derive(Clone)]
pub struct NetworkMonitor {
    stable: Arc<watch::Sender<bool>>,
    callbacks: Arc<Callbacks>,
}

/// Returned by [`NetworkMonitor::on_transition`].
pub struct TransitionSubscription {
    id: u64,
    callbacks: Arc<Callbacks>,
}

impl TransitionSubscription {
    pub fn unsubscribe(self) {
        lock(&self.callbacks.entries).retain(|(id, _)| *id != self.id);
    }
}

impl NetworkMonitor {
    /// Start watching `raw`. The initial stable state is whatever `raw` holds now.
    pub fn spawn(
        mut raw: watch::Receiver<bool>,
        debounce: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let initial = *raw.borrow_and_update();
        let stable = Arc::new(watch::Sender::new(initial));
        let callbacks = Arc::new(Callbacks::default());

        let monitor = NetworkMonitor {
            stable: stable.clone(),
            callbacks: callbacks.clone(),
        };

        let handle = tokio::spawn(async move {
            tracing::debug!("Network monitor started (online={initial})");

            'outer: loop {
                tokio::select! {
                    changed = raw.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.changed() => break,
                }

                loop {
                    let candidate = *raw.borrow_and_update();
                    tokio::select! {
                        _ = tokio::time::sleep(debounce) => {
                            let current = *stable.borrow();
                            if candidate != current {
                                stable.send_replace(candidate);
                                tracing::info!(
                                    "Network is now {}",
                                    if candidate { "online" } else { "offline" }
                                );
                                for callback in callbacks.snapshot() {
                                    callback(candidate);
                                }
                            }
                            break;
                        }
                        changed = raw.changed() => {
                            if changed.is_err() {
                                break 'outer;
                            }
                        }
                        _ = shutdown.changed() => break 'outer,
                    }
                }
            }

            tracing::debug!("Network monitor stopped");
        });

        (monitor, handle)
    }

    /// A monitor pinned to a fixed state, for hosts without a connectivity source.
    pub fn fixed(online: bool) -> Self {
        NetworkMonitor {
            stable: Arc::new(watch::Sender::new(online)),
            callbacks: Arc::new(Callbacks::default()),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.stable.borrow()
    }

    /// Receiver of the debounced state, for tasks that prefer to await changes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.stable.subscribe()
    }

    /// Called with the new state once per stable change.
    pub fn on_transition<F>(&self, callback: F) -> TransitionSubscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let id = self.callbacks.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.callbacks.entries).push((id, Arc::new(callback)));
        TransitionSubscription {
            id,
            callbacks: self.callbacks.clone(),
        }
    }
}

/// Feeds a raw connectivity signal by polling the dashboard API.
///
/// Any HTTP response counts as reachable; only transport errors and timeouts
/// mark the network as down.
pub struct ConnectivityProbe {
    client: reqwest::Client,
    url: String,
    interval: Duration,
}

impl ConnectivityProbe {
    pub fn new(api_base_url: &str, interval: Duration) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| format!("Failed to build probe client: {e}"))?;
        Ok(Self {
            client,
            url: format!("{}/api/health", api_base_url.trim_end_matches('/')),
            interval,
        })
    }

    pub async fn check(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("Connectivity probe failed: {e}");
                false
            }
        }
    }

    pub fn spawn(
        self,
        raw: watch::Sender<bool>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }

                let online = self.check().await;
                raw.send_if_modified(|current| {
                    let modified = *current != online;
                    *current = online;
                    modified
                });

                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        })
    }
}
