use std::sync::Arc;
use std::time::Duration;

use tether_core::{ManualClock, Scheduler};
use tether_realtime::{ConnectionOptions, ConnectionPool, ConnectionState, PoolConfig};
use tether_test_utils::fixtures::{fast_options, manual_clock};
use tether_test_utils::ScriptedTransport;

const CHAT: &str = "ws://localhost:3000/chat";
const FEED: &str = "ws://localhost:3000/feed";

fn pool_over(transport: &ScriptedTransport, clock: &Arc<ManualClock>) -> ConnectionPool {
    let config = PoolConfig::default()
        .with_cleanup_interval(Duration::from_secs(60))
        .with_max_idle_time(Duration::from_secs(300))
        .with_connection_options(fast_options());
    ConnectionPool::new(transport.shared(), Scheduler::new(), clock.clone(), config)
}

#[tokio::test(start_paused = true)]
async fn test_subscribers_share_one_connection() {
    let transport = ScriptedTransport::new();
    let clock = manual_clock();
    let pool = pool_over(&transport, &clock);

    let a = pool.get_connection(CHAT, "sub-a", None).await.unwrap();
    let b = pool.get_connection(CHAT, "sub-b", None).await.unwrap();

    assert_eq!(a.id(), b.id());
    assert_eq!(transport.open_attempts(), 1);
    assert_eq!(pool.subscribers(CHAT), vec!["sub-a", "sub-b"]);
    assert_eq!(pool.get_active_connection_count(), 1);
    assert_eq!(pool.get_total_connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_release_keeps_connection_until_idle_sweep() {
    let transport = ScriptedTransport::new();
    let clock = manual_clock();
    let pool = pool_over(&transport, &clock);

    let connection = pool.get_connection(CHAT, "sub-a", None).await.unwrap();
    pool.get_connection(CHAT, "sub-b", None).await.unwrap();

    assert!(pool.release_connection(CHAT, "sub-a"));
    assert!(!pool.release_connection(CHAT, "sub-a"));
    assert_eq!(pool.get_active_connection_count(), 1);

    assert!(pool.release_connection(CHAT, "sub-b"));
    assert_eq!(pool.get_active_connection_count(), 0);
    assert_eq!(pool.get_total_connection_count(), 1);
    assert_eq!(connection.state(), ConnectionState::Open);

    // Not idle long enough yet.
    clock.advance(Duration::from_secs(120));
    assert_eq!(pool.cleanup().await, 0);

    clock.advance(Duration::from_secs(181));
    assert_eq!(pool.cleanup().await, 1);
    assert_eq!(pool.get_total_connection_count(), 0);
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_sweep_never_closes_subscribed_connections() {
    let transport = ScriptedTransport::new();
    let clock = manual_clock();
    let pool = pool_over(&transport, &clock);

    pool.get_connection(CHAT, "sub-a", None).await.unwrap();
    clock.advance(Duration::from_secs(3_600));

    assert_eq!(pool.cleanup().await, 0);
    assert_eq!(pool.get_active_connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_started_pool_sweeps_on_interval() {
    let transport = ScriptedTransport::new();
    let clock = manual_clock();
    let pool = pool_over(&transport, &clock);
    pool.start();

    let connection = pool.get_connection(FEED, "sub-a", None).await.unwrap();
    pool.release_connection(FEED, "sub-a");
    clock.advance(Duration::from_secs(301));

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(pool.get_total_connection_count(), 0);
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_all_closes_everything() {
    let transport = ScriptedTransport::new();
    let clock = manual_clock();
    let pool = pool_over(&transport, &clock);

    let chat = pool.get_connection(CHAT, "sub-a", None).await.unwrap();
    let feed = pool.get_connection(FEED, "sub-b", None).await.unwrap();
    assert_eq!(pool.get_total_connection_count(), 2);

    pool.disconnect_all().await;
    assert_eq!(pool.get_total_connection_count(), 0);
    assert_eq!(chat.state(), ConnectionState::Closed);
    assert_eq!(feed.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_failed_connect_drops_the_subscriber() {
    let transport = ScriptedTransport::refusing();
    let clock = manual_clock();
    let pool = pool_over(&transport, &clock);

    let options = ConnectionOptions::new().with_max_reconnect_attempts(0);
    let result = pool.get_connection(CHAT, "sub-a", Some(options)).await;

    assert!(result.is_err());
    assert!(pool.subscribers(CHAT).is_empty());
    assert_eq!(pool.get_active_connection_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_closed_connection_is_revived_on_next_get() {
    let transport = ScriptedTransport::new();
    let clock = manual_clock();
    let pool = pool_over(&transport, &clock);

    let connection = pool.get_connection(CHAT, "sub-a", None).await.unwrap();
    connection.disconnect().await;
    assert_eq!(connection.state(), ConnectionState::Closed);

    let revived = pool.get_connection(CHAT, "sub-b", None).await.unwrap();
    assert_eq!(revived.id(), connection.id());
    assert_eq!(revived.state(), ConnectionState::Open);
    assert_eq!(transport.open_attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_explicit_options_apply_on_creation_only() {
    let transport = ScriptedTransport::new();
    let clock = manual_clock();
    let pool = pool_over(&transport, &clock);

    let slow = ConnectionOptions::new().with_heartbeat_interval(Duration::from_secs(45));
    let first = pool.get_connection(CHAT, "sub-a", Some(slow)).await.unwrap();
    let second = pool
        .get_connection(CHAT, "sub-b", Some(fast_options()))
        .await
        .unwrap();

    assert_eq!(first.options().heartbeat_interval, Duration::from_secs(45));
    assert_eq!(second.options().heartbeat_interval, Duration::from_secs(45));
}
