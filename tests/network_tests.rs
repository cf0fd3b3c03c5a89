use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use homesync::network::{ConnectivityProbe, NetworkMonitor};

const DEBOUNCE: Duration = Duration::from_secs(2);

struct Harness {
    raw: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    monitor: NetworkMonitor,
    transitions: Arc<Mutex<Vec<bool>>>,
    task: tokio::task::JoinHandle<()>,
}

fn harness(initial: bool) -> Harness {
    let (raw, raw_rx) = watch::channel(initial);
    let (shutdown, shutdown_rx) = watch::channel(false);
    let (monitor, task) = NetworkMonitor::spawn(raw_rx, DEBOUNCE, shutdown_rx);

    let transitions = Arc::new(Mutex::new(Vec::new()));
    let sink = transitions.clone();
    let _ = monitor.on_transition(move |online| sink.lock().unwrap().push(online));

    Harness {
        raw,
        shutdown,
        monitor,
        transitions,
        task,
    }
}

impl Harness {
    fn transitions(&self) -> Vec<bool> {
        self.transitions.lock().unwrap().clone()
    }

    async fn stop(self) {
        self.shutdown.send_replace(true);
        self.task.await.unwrap();
    }
}

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn stable_change_is_reported_once_after_debounce() {
    let h = harness(false);
    assert!(!h.monitor.is_online());

    h.raw.send_replace(true);
    sleep_ms(1500).await;
    assert!(!h.monitor.is_online(), "still inside the debounce window");

    sleep_ms(1000).await;
    assert!(h.monitor.is_online());
    assert_eq!(h.transitions(), vec![true]);

    sleep_ms(10_000).await;
    assert_eq!(h.transitions(), vec![true]);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn flapping_inside_the_window_is_ignored() {
    let h = harness(true);

    for _ in 0..5 {
        h.raw.send_replace(false);
        sleep_ms(300).await;
        h.raw.send_replace(true);
        sleep_ms(300).await;
    }
    sleep_ms(5000).await;

    assert!(h.monitor.is_online());
    assert!(h.transitions().is_empty());

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn flapping_restarts_the_window() {
    let h = harness(false);

    h.raw.send_replace(true);
    sleep_ms(1500).await;
    h.raw.send_replace(false);
    sleep_ms(100).await;
    h.raw.send_replace(true);
    sleep_ms(1500).await;
    assert!(!h.monitor.is_online());

    sleep_ms(1000).await;
    assert!(h.monitor.is_online());
    assert_eq!(h.transitions(), vec![true]);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn subscribers_see_each_direction() {
    let h = harness(true);
    let mut rx = h.monitor.subscribe();

    h.raw.send_replace(false);
    sleep_ms(2500).await;
    assert!(rx.has_changed().unwrap());
    assert!(!*rx.borrow_and_update());

    h.raw.send_replace(true);
    sleep_ms(2500).await;
    assert!(*rx.borrow_and_update());
    assert_eq!(h.transitions(), vec![false, true]);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn unsubscribed_callback_is_not_called() {
    let h = harness(false);
    let calls = Arc::new(Mutex::new(0));
    let counter = calls.clone();
    let subscription = h.monitor.on_transition(move |_| *counter.lock().unwrap() += 1);

    h.raw.send_replace(true);
    sleep_ms(2500).await;
    assert_eq!(*calls.lock().unwrap(), 1);

    subscription.unsubscribe();
    h.raw.send_replace(false);
    sleep_ms(2500).await;
    assert_eq!(*calls.lock().unwrap(), 1);
    assert_eq!(h.transitions(), vec![true, false]);

    h.stop().await;
}

#[test]
fn fixed_monitor_reports_its_state() {
    assert!(NetworkMonitor::fixed(true).is_online());
    assert!(!NetworkMonitor::fixed(false).is_online());
}

#[tokio::test]
async fn probe_reports_offline_when_nothing_listens() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let probe = ConnectivityProbe::new(&format!("http://{addr}"), Duration::from_secs(30)).unwrap();
    assert!(!probe.check().await);
}

#[tokio::test]
async fn probe_reports_online_for_any_response() {
    let app = axum::Router::new().route(
        "/api/health",
        axum::routing::get(|| async { axum::http::StatusCode::SERVICE_UNAVAILABLE }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let probe = ConnectivityProbe::new(&format!("http://{addr}"), Duration::from_secs(30)).unwrap();
    assert!(probe.check().await);
}
