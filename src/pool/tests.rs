use super::*;

use std::time::Duration;

use crate::config::RateLimitConfig;
use crate::error::Error;
use crate::testkit;
use crate::testkit::connector::MockConnector;
use crate::testkit::stream::ChannelSubscriptionHandle;

// -- Helpers --------------------------------------------------------------

fn pool_with(config: PoolConfig) -> (ConnectionPool, Arc<MockConnector>) {
    let connector = MockConnector::new();
    let pool = ConnectionPool::new(config, connector.clone()).unwrap();
    (pool, connector)
}

/// Acquire for `owner`, open a stream on the handle and bind it.
async fn acquire_and_bind(
    pool: &ConnectionPool,
    connector: &MockConnector,
    owner: &str,
) -> (ClientHandle, BoundStream, ChannelSubscriptionHandle) {
    let handle = pool.acquire(owner).await.unwrap();
    let stream = handle.open_stream().await.unwrap();
    let control = connector.last_stream().unwrap();
    let bound = pool.bind_stream(owner, stream).await.unwrap();
    (handle, bound, control)
}

async fn tick() {
    tokio::time::advance(Duration::from_secs(1)).await;
}

// -- Construction ---------------------------------------------------------

#[tokio::test]
async fn rejects_missing_credential() {
    let mut cfg = testkit::config::pool(2);
    cfg.credential.clear();
    let result = ConnectionPool::new(cfg, MockConnector::new());
    assert!(matches!(
        result,
        Err(Error::Config(crate::error::ConfigError::MissingField {
            field: "credential"
        }))
    ));
}

#[tokio::test]
async fn dials_configured_endpoint_with_credential() {
    let (pool, connector) = pool_with(testkit::config::pool(2));
    pool.acquire("a").await.unwrap();
    assert_eq!(
        connector.dialed(),
        vec![("mock://feed".to_string(), "test-token".to_string())]
    );
}

// -- Acquire --------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn reacquire_returns_same_connection_and_advances_last_used() {
    let (pool, connector) = pool_with(testkit::config::pool(2));

    let first = pool.acquire("a").await.unwrap();
    let before = pool.entry_snapshot("a").unwrap().last_used_at;

    // Clock frozen: last_used_at must still strictly advance.
    let second = pool.acquire("a").await.unwrap();
    let after = pool.entry_snapshot("a").unwrap().last_used_at;

    assert!(first.same_connection(&second));
    assert!(after > before);
    assert_eq!(connector.dial_count(), 1);
    assert_eq!(pool.stats().total, 1);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_denies_creation_without_queueing() {
    let mut cfg = testkit::config::pool(5);
    cfg.rate_limit = RateLimitConfig {
        capacity: 2,
        window_ms: 1000,
    };
    let (pool, connector) = pool_with(cfg);

    pool.acquire("a").await.unwrap();
    pool.acquire("b").await.unwrap();
    let err = pool.acquire("c").await.unwrap_err();

    match err {
        PoolError::RateLimitExceeded { retry_after } => {
            assert!(retry_after.unwrap() <= Duration::from_millis(500));
        }
        other => panic!("expected rate limit error, got {other:?}"),
    }
    assert_eq!(connector.dial_count(), 2);

    tokio::time::advance(Duration::from_millis(600)).await;
    assert!(pool.acquire("c").await.is_ok());
}

#[tokio::test]
async fn dial_failure_is_reported_and_frees_capacity() {
    let (pool, connector) = pool_with(testkit::config::pool(1));
    connector.fail_next(crate::error::StreamError::Connect("refused".into()));

    let err = pool.acquire("a").await.unwrap_err();
    assert!(matches!(err, PoolError::ConnectionCreationFailed { .. }));
    assert_eq!(pool.stats().total, 0);

    // The reservation was released, so the single slot is usable again.
    assert!(pool.acquire("a").await.is_ok());
    assert_eq!(connector.dial_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn dial_timeout_is_creation_failure() {
    let mut cfg = testkit::config::pool(1);
    cfg.connect_timeout_secs = 1;
    let (pool, connector) = pool_with(cfg);
    connector.set_dial_delay(Duration::from_secs(5));

    let err = pool.acquire("a").await.unwrap_err();
    assert!(matches!(
        err,
        PoolError::ConnectionCreationFailed { ref reason, .. } if reason.contains("timed out")
    ));
    assert_eq!(pool.stats().total, 0);
}

// -- LRU reassignment -----------------------------------------------------

#[tokio::test(start_paused = true)]
async fn full_pool_reassigns_least_recently_used() {
    let (pool, connector) = pool_with(testkit::config::pool(3));

    let a = pool.acquire("a").await.unwrap();
    tick().await;
    let b = pool.acquire("b").await.unwrap();
    tick().await;
    pool.acquire("c").await.unwrap();
    tick().await;
    pool.acquire("a").await.unwrap();
    tick().await;

    let d = pool.acquire("d").await.unwrap();

    assert!(d.same_connection(&b));
    assert!(!d.same_connection(&a));
    assert!(pool.entry_snapshot("b").is_none());
    assert_eq!(connector.dial_count(), 3);

    let stats = pool.stats();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.owner_counts.get("d"), Some(&1));
    assert!(!stats.owner_counts.contains_key("b"));
}

#[tokio::test(start_paused = true)]
async fn lru_ties_go_to_the_oldest_entry() {
    let (pool, connector) = pool_with(testkit::config::pool(2));

    // Same frozen instant, never touched again.
    let a = pool.acquire("a").await.unwrap();
    let b = pool.acquire("b").await.unwrap();
    assert_eq!(
        pool.entry_snapshot("a").unwrap().last_used_at,
        pool.entry_snapshot("b").unwrap().last_used_at
    );

    let c = pool.acquire("c").await.unwrap();

    assert!(c.same_connection(&a));
    assert!(!c.same_connection(&b));
    assert!(pool.entry_snapshot("a").is_none());
    assert!(pool.entry_snapshot("b").is_some());
    assert_eq!(connector.dial_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn eviction_cancels_previous_owners_stream() {
    let (pool, connector) = pool_with(testkit::config::pool(2));

    let (a, mut a_stream, a_control) = acquire_and_bind(&pool, &connector, "a").await;
    tick().await;
    let (b, _b_stream, b_control) = acquire_and_bind(&pool, &connector, "b").await;
    tick().await;

    let c = pool.acquire("c").await.unwrap();

    assert!(c.same_connection(&a));
    assert!(a_control.is_cancelled());
    assert!(!b_control.is_cancelled());
    assert_eq!(
        a_stream.next().await,
        Some(Err(crate::error::StreamError::Cancelled))
    );

    // "a" lost its connection; it must not get "c"'s back.
    tick().await;
    let a_again = pool.acquire("a").await.unwrap();
    assert!(!a_again.same_connection(&c));
    assert!(a_again.same_connection(&b));
    assert!(pool.entry_snapshot("c").is_some());
}

#[tokio::test(start_paused = true)]
async fn evicted_owner_gets_fresh_connection_when_room() {
    let (pool, connector) = pool_with(testkit::config::pool(2));

    let a = pool.acquire("a").await.unwrap();
    tick().await;
    pool.acquire("b").await.unwrap();
    tick().await;
    pool.acquire("c").await.unwrap(); // takes a's connection
    tick().await;

    // Free b's slot through a failure so a can dial.
    let handle = pool.acquire("b").await.unwrap();
    let stream = handle.open_stream().await.unwrap();
    let control = connector.last_stream().unwrap();
    let mut bound = pool.bind_stream("b", stream).await.unwrap();
    control
        .fail(crate::error::StreamError::Transport("reset".into()))
        .await;
    assert!(matches!(bound.next().await, Some(Err(_))));
    pool.inner.sweep().await;

    let fresh = pool.acquire("a").await.unwrap();
    assert!(!fresh.same_connection(&a));
    assert_eq!(connector.dial_count(), 3);
}

#[tokio::test]
async fn full_pool_without_healthy_entries_reports_unavailable() {
    let (pool, connector) = pool_with(testkit::config::pool(1));

    let (_, mut bound, control) = acquire_and_bind(&pool, &connector, "a").await;
    control
        .fail(crate::error::StreamError::Transport("boom".into()))
        .await;
    assert!(matches!(bound.next().await, Some(Err(_))));

    let err = pool.acquire("b").await.unwrap_err();
    assert_eq!(err, PoolError::NoConnectionsAvailable { max_connections: 1 });
}

// -- Stream binding -------------------------------------------------------

#[tokio::test]
async fn bound_stream_forwards_messages_in_order() {
    let (pool, connector) = pool_with(testkit::config::pool(1));
    let (handle, mut bound, control) = acquire_and_bind(&pool, &connector, "a").await;

    control.send("one").await;
    control.send("two").await;

    assert_eq!(bound.next().await.unwrap().unwrap().payload, b"one".to_vec());
    assert_eq!(bound.next().await.unwrap().unwrap().payload, b"two".to_vec());
    assert_eq!(bound.connection_id(), handle.connection_id());
    assert_eq!(bound.owner().as_str(), "a");
    assert!(pool.entry_snapshot("a").unwrap().has_stream);
}

#[tokio::test]
async fn stream_error_marks_entry_unhealthy_and_next_acquire_replaces_it() {
    let (pool, connector) = pool_with(testkit::config::pool(2));
    let (first, mut bound, control) = acquire_and_bind(&pool, &connector, "a").await;

    control
        .fail(crate::error::StreamError::Transport("reset".into()))
        .await;
    assert_eq!(
        bound.next().await,
        Some(Err(crate::error::StreamError::Transport("reset".into())))
    );

    let snapshot = pool.entry_snapshot("a").unwrap();
    assert!(!snapshot.healthy);
    assert!(!snapshot.has_stream);
    assert_eq!(pool.stats().unhealthy, 1);

    let second = pool.acquire("a").await.unwrap();
    assert!(!second.same_connection(&first));
    assert_eq!(connector.dial_count(), 2);
    assert_eq!(pool.stats().total, 1);
    assert_eq!(pool.stats().healthy, 1);
}

#[tokio::test]
async fn natural_end_clears_binding_but_keeps_health() {
    let (pool, connector) = pool_with(testkit::config::pool(1));
    let (_, mut bound, control) = acquire_and_bind(&pool, &connector, "a").await;

    control.close().await;
    assert!(bound.next().await.is_none());

    let snapshot = pool.entry_snapshot("a").unwrap();
    assert!(snapshot.healthy);
    assert!(!snapshot.has_stream);
    assert!(!control.is_cancelled());
}

#[tokio::test]
async fn binding_without_connection_is_rejected() {
    let (pool, _) = pool_with(testkit::config::pool(1));
    let (stream, control) = testkit::stream::channel_subscription(4);

    let err = pool.bind_stream("ghost", Box::new(stream)).await.unwrap_err();

    assert_eq!(
        err,
        PoolError::NotAcquired {
            owner: OwnerId::from("ghost")
        }
    );
    assert!(control.is_cancelled());
}

#[tokio::test]
async fn rebinding_cancels_previous_stream() {
    let (pool, connector) = pool_with(testkit::config::pool(1));
    let (handle, mut old, old_control) = acquire_and_bind(&pool, &connector, "a").await;

    let stream = handle.open_stream().await.unwrap();
    let new_control = connector.last_stream().unwrap();
    let mut new = pool.bind_stream("a", stream).await.unwrap();

    assert!(old_control.is_cancelled());
    assert_eq!(
        old.next().await,
        Some(Err(crate::error::StreamError::Cancelled))
    );

    new_control.send("fresh").await;
    assert_eq!(new.next().await.unwrap().unwrap().payload, b"fresh".to_vec());
    assert!(pool.entry_snapshot("a").unwrap().healthy);
}

#[tokio::test]
async fn dropping_bound_stream_cancels_quiet_upstream() {
    let (pool, connector) = pool_with(testkit::config::pool(1));
    let (_, bound, control) = acquire_and_bind(&pool, &connector, "a").await;

    // No message is ever sent: the drop alone must detach the stream.
    drop(bound);

    for _ in 0..100 {
        if !pool.entry_snapshot("a").unwrap().has_stream {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let snapshot = pool.entry_snapshot("a").unwrap();
    assert!(!snapshot.has_stream);
    assert!(snapshot.healthy);
    assert_eq!(control.cancel_count(), 1);

    // The freed entry accepts a new binding.
    let handle = pool.acquire("a").await.unwrap();
    let stream = handle.open_stream().await.unwrap();
    assert!(pool.bind_stream("a", stream).await.is_ok());
    assert_eq!(connector.dial_count(), 1);
}

// -- Release --------------------------------------------------------------

#[tokio::test]
async fn release_cancels_stream_but_keeps_entry_pinned() {
    let (pool, connector) = pool_with(testkit::config::pool(2));
    let (first, mut bound, control) = acquire_and_bind(&pool, &connector, "a").await;

    pool.release("a").await;

    assert!(control.is_cancelled());
    assert_eq!(
        bound.next().await,
        Some(Err(crate::error::StreamError::Cancelled))
    );
    let snapshot = pool.entry_snapshot("a").unwrap();
    assert!(snapshot.healthy);
    assert!(!snapshot.has_stream);

    let again = pool.acquire("a").await.unwrap();
    assert!(again.same_connection(&first));
    assert_eq!(connector.dial_count(), 1);
}

#[tokio::test]
async fn release_is_idempotent_and_tolerates_unknown_owners() {
    let (pool, connector) = pool_with(testkit::config::pool(1));
    let (_, _bound, control) = acquire_and_bind(&pool, &connector, "a").await;

    pool.release("a").await;
    pool.release("a").await;
    pool.release("nobody").await;

    assert_eq!(control.cancel_count(), 1);
    assert_eq!(pool.stats().total, 1);
}

#[tokio::test]
async fn cancellation_errors_are_absorbed() {
    let (pool, connector) = pool_with(testkit::config::pool(1));
    let (_, mut bound, control) = acquire_and_bind(&pool, &connector, "a").await;
    control.fail_cancel_with(crate::error::StreamError::Cancellation(
        "already closing".into(),
    ));

    pool.release("a").await;

    assert_eq!(
        bound.next().await,
        Some(Err(crate::error::StreamError::Cancelled))
    );
    assert!(pool.entry_snapshot("a").unwrap().healthy);
}

#[tokio::test(start_paused = true)]
async fn stuck_cancellation_is_time_boxed() {
    let (pool, connector) = pool_with(testkit::config::pool(1));
    let (_, _bound, control) = acquire_and_bind(&pool, &connector, "a").await;
    control.hang_on_cancel();

    let started = Instant::now();
    pool.release("a").await;
    let waited = started.elapsed();

    assert!(waited >= Duration::from_millis(100));
    assert!(waited < Duration::from_secs(1));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(control.is_dropped());
}

// -- Health check ---------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn ttl_expiry_removes_entry_and_costs_a_fresh_token() {
    let mut cfg = testkit::config::pool(2);
    cfg.connection_ttl_secs = 90;
    cfg.health_check_interval_secs = 30;
    cfg.rate_limit = RateLimitConfig {
        capacity: 5,
        window_ms: 3_600_000,
    };
    let (pool, connector) = pool_with(cfg);

    let (first, mut bound, control) = acquire_and_bind(&pool, &connector, "a").await;

    // Ticks at 30s and 60s leave it alone.
    tokio::time::sleep(Duration::from_secs(89)).await;
    assert!(pool.entry_snapshot("a").is_some());

    // Tick at 90s expires it.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(pool.entry_snapshot("a").is_none());
    assert!(control.is_cancelled());
    assert_eq!(
        bound.next().await,
        Some(Err(crate::error::StreamError::Cancelled))
    );
    assert_eq!(pool.stats().rate_limit_remaining, 4);

    let second = pool.acquire("a").await.unwrap();
    assert!(!second.same_connection(&first));
    assert_eq!(connector.dial_count(), 2);
    assert_eq!(pool.stats().rate_limit_remaining, 3);
}

#[tokio::test(start_paused = true)]
async fn health_check_prunes_unhealthy_entries() {
    let (pool, connector) = pool_with(testkit::config::pool(2));
    let (_, mut bound, control) = acquire_and_bind(&pool, &connector, "a").await;

    control
        .fail(crate::error::StreamError::Transport("reset".into()))
        .await;
    assert!(matches!(bound.next().await, Some(Err(_))));
    assert_eq!(pool.stats().total, 1);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(pool.stats().total, 0);
}

// -- Stats ----------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn stats_report_distribution_and_budget() {
    let (pool, connector) = pool_with(testkit::config::pool(3));
    let _a = acquire_and_bind(&pool, &connector, "a").await;
    pool.acquire("b").await.unwrap();

    let stats = pool.stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.healthy, 2);
    assert_eq!(stats.unhealthy, 0);
    assert_eq!(stats.bound_streams, 1);
    assert_eq!(stats.max_connections, 3);
    assert_eq!(stats.rate_limit_remaining, 58);
    assert_eq!(stats.owner_counts.len(), 2);
}

// -- Concurrency ----------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn concurrent_acquires_never_exceed_capacity() {
    let (pool, connector) = pool_with(testkit::config::pool(3));
    connector.set_dial_delay(Duration::from_millis(50));

    let tasks: Vec<_> = (0..10)
        .map(|i| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(format!("owner-{i}")).await })
        })
        .collect();
    let results = join_all(tasks).await;

    let ok = results
        .iter()
        .filter(|r| matches!(r, Ok(Ok(_))))
        .count();
    let stats = pool.stats();
    assert!(stats.total <= 3);
    assert_eq!(connector.dial_count(), 3);
    assert!(ok >= 3);
    assert!(stats.owner_counts.values().all(|&n| n == 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reserved_slot_is_never_redialed_during_commit() {
    let (pool, connector) = pool_with(testkit::config::pool(1));
    connector.set_dial_delay(Duration::from_millis(20));

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(format!("owner-{i}")).await })
        })
        .collect();
    join_all(tasks).await;

    // The single slot is reserved, then occupied, with no gap in between:
    // only the first acquire may ever spend a token and dial.
    assert_eq!(connector.dial_count(), 1);
    assert_eq!(pool.stats().rate_limit_remaining, 59);
    assert_eq!(pool.stats().total, 1);
    assert_eq!(pool.inner.state.lock().pending_dials, 0);
}

#[tokio::test(start_paused = true)]
async fn reservation_is_released_on_every_dial_outcome() {
    let (pool, connector) = pool_with(testkit::config::pool(2));

    pool.acquire("a").await.unwrap();
    assert_eq!(pool.inner.state.lock().pending_dials, 0);

    connector.fail_next(crate::error::StreamError::Connect("refused".into()));
    assert!(pool.acquire("b").await.is_err());
    assert_eq!(pool.inner.state.lock().pending_dials, 0);

    // An abandoned acquire gives its slot back.
    connector.set_dial_delay(Duration::from_secs(5));
    let abandoned = tokio::time::timeout(Duration::from_secs(1), pool.acquire("c")).await;
    assert!(abandoned.is_err());
    assert_eq!(pool.inner.state.lock().pending_dials, 0);
    assert_eq!(pool.stats().total, 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_acquires_for_one_owner_share_a_connection() {
    let (pool, connector) = pool_with(testkit::config::pool(3));
    connector.set_dial_delay(Duration::from_millis(50));

    let (first, second) = tokio::join!(pool.acquire("a"), pool.acquire("a"));
    let (first, second) = (first.unwrap(), second.unwrap());

    assert!(first.same_connection(&second));
    assert_eq!(pool.stats().total, 1);
}

// -- Shutdown -------------------------------------------------------------

#[tokio::test]
async fn shutdown_drains_everything() {
    let (pool, connector) = pool_with(testkit::config::pool(3));
    let (_, mut a, a_control) = acquire_and_bind(&pool, &connector, "a").await;
    let (_, _b, b_control) = acquire_and_bind(&pool, &connector, "b").await;
    pool.acquire("c").await.unwrap();

    pool.shutdown().await;

    assert_eq!(pool.stats().total, 0);
    assert!(a_control.is_cancelled());
    assert!(b_control.is_cancelled());
    assert_eq!(
        a.next().await,
        Some(Err(crate::error::StreamError::Cancelled))
    );
    assert_eq!(pool.acquire("a").await.unwrap_err(), PoolError::ShutDown);

    // Idempotent.
    pool.shutdown().await;
    assert_eq!(pool.stats().total, 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_is_bounded_by_stuck_streams() {
    let (pool, connector) = pool_with(testkit::config::pool(2));
    let (_, _a, a_control) = acquire_and_bind(&pool, &connector, "a").await;
    let (_, _b, b_control) = acquire_and_bind(&pool, &connector, "b").await;
    a_control.hang_on_cancel();
    b_control.hang_on_cancel();

    let started = Instant::now();
    pool.shutdown().await;

    // Both cancelled concurrently, each bounded by the grace period.
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(pool.stats().total, 0);
}

#[tokio::test(start_paused = true)]
async fn acquire_racing_shutdown_is_rejected() {
    let (pool, connector) = pool_with(testkit::config::pool(2));
    connector.set_dial_delay(Duration::from_millis(50));

    let racer = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire("late").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    pool.shutdown().await;

    assert_eq!(racer.await.unwrap().unwrap_err(), PoolError::ShutDown);
    assert_eq!(pool.stats().total, 0);
}
