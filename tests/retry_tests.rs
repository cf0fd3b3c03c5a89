use std::time::Duration;

use chrono::TimeZone;
use uuid::Uuid;

use homesync::retry::{BackoffPolicy, RetryScheduler};

fn policy(jitter: f64) -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(300), jitter)
}

#[test]
fn delay_doubles_per_attempt() {
    let backoff = policy(0.0);
    let delays: Vec<u64> = (0..5).map(|n| backoff.delay_with(n, 0.5).as_secs()).collect();
    assert_eq!(delays, vec![1, 2, 4, 8, 16]);
}

#[test]
fn delay_is_capped() {
    let backoff = policy(0.0);
    assert_eq!(backoff.delay_with(9, 0.0), Duration::from_secs(300));
    assert_eq!(backoff.delay_with(40, 0.0), Duration::from_secs(300));
    assert_eq!(backoff.delay_with(u32::MAX, 0.0), Duration::from_secs(300));
}

#[test]
fn jitter_only_shortens_the_delay() {
    let backoff = policy(0.25);
    assert_eq!(backoff.delay_with(2, 0.0), Duration::from_secs(4));
    assert_eq!(backoff.delay_with(2, 1.0), Duration::from_secs(3));

    for _ in 0..100 {
        let delay = backoff.delay(3);
        assert!(delay <= Duration::from_secs(8));
        assert!(delay >= Duration::from_secs(6));
    }
}

#[test]
fn jitter_is_clamped() {
    let backoff = BackoffPolicy::new(Duration::from_secs(2), Duration::from_secs(10), 4.0);
    assert_eq!(backoff.jitter, 1.0);
    assert_eq!(backoff.delay_with(0, 0.5), Duration::from_secs(1));
}

fn at(secs: u32) -> chrono::DateTime<chrono::Utc> {
    chrono::Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, secs).unwrap()
}

#[test]
fn take_due_returns_only_expired_deadlines_in_order() {
    let scheduler = RetryScheduler::new();
    let (a, b, c) = (Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7());
    scheduler.schedule(a, at(30));
    scheduler.schedule(b, at(10));
    scheduler.schedule(c, at(50));

    assert_eq!(scheduler.next_deadline(), Some(at(10)));
    assert!(scheduler.take_due(at(5)).is_empty());
    assert_eq!(scheduler.take_due(at(30)), vec![b, a]);
    assert_eq!(scheduler.pending(), vec![(c, at(50))]);
    assert_eq!(scheduler.len(), 1);
}

#[test]
fn reschedule_replaces_and_cancel_removes() {
    let scheduler = RetryScheduler::new();
    let id = Uuid::now_v7();
    scheduler.schedule(id, at(10));
    scheduler.schedule(id, at(40));
    assert_eq!(scheduler.deadline(id), Some(at(40)));
    assert_eq!(scheduler.len(), 1);

    assert!(scheduler.cancel(id));
    assert!(!scheduler.cancel(id));
    assert!(scheduler.is_empty());
    assert_eq!(scheduler.next_deadline(), None);
}

#[tokio::test]
async fn changed_resolves_after_schedule() {
    let scheduler = std::sync::Arc::new(RetryScheduler::new());
    let waiter = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.changed().await })
    };
    tokio::task::yield_now().await;
    scheduler.schedule(Uuid::now_v7(), at(1));
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("changed() did not resolve")
        .unwrap();
}

#[tokio::test]
async fn rearm_updates_the_deadline_without_waking() {
    let scheduler = RetryScheduler::new();
    let id = Uuid::now_v7();
    scheduler.rearm(id, at(5));
    assert_eq!(scheduler.deadline(id), Some(at(5)));
    assert_eq!(scheduler.next_deadline(), Some(at(5)));

    let woke = tokio::time::timeout(Duration::from_millis(50), scheduler.changed()).await;
    assert!(woke.is_err(), "rearm must not wake the retry timer");
}
