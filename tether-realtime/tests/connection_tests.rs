use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tether_core::{ConnectionError, Scheduler};
use tether_realtime::{Connection, ConnectionEvent, ConnectionState, Frame};
use tether_test_utils::fixtures::{fast_options, WS_ENDPOINT};
use tether_test_utils::{EventRecorder, ScriptedTransport};

fn connection_over(transport: &ScriptedTransport) -> Connection {
    Connection::new(WS_ENDPOINT, fast_options(), transport.shared(), Scheduler::new())
}

/// Let spawned readers drain without reaching the next heartbeat.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_then_send() {
    let transport = ScriptedTransport::new();
    let connection = connection_over(&transport);
    let events = EventRecorder::attach(&connection);

    connection.connect().await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Open);
    assert!(connection.is_ready());
    assert_eq!(events.kinds(), vec!["connected"]);

    connection.send(Frame::text("hello")).await.unwrap();
    connection
        .send_json(&json!({ "type": "subscribe" }))
        .await
        .unwrap();

    let server = transport.last_server().unwrap();
    assert_eq!(server.endpoint(), WS_ENDPOINT);
    assert_eq!(server.sent_text(), vec!["hello", r#"{"type":"subscribe"}"#]);
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_open_is_noop() {
    let transport = ScriptedTransport::new();
    let connection = connection_over(&transport);

    connection.connect().await.unwrap();
    connection.connect().await.unwrap();
    assert_eq!(transport.open_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_connecting_is_noop() {
    let transport = ScriptedTransport::new();
    transport.set_open_delay(Duration::from_millis(500));
    let connection = connection_over(&transport);
    let events = EventRecorder::attach(&connection);

    let first = connection.clone();
    let opening = tokio::spawn(async move { first.connect().await });
    settle().await;
    assert_eq!(connection.state(), ConnectionState::Connecting);

    connection.connect().await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Connecting);
    assert_eq!(transport.open_attempts(), 1);

    opening.await.unwrap().unwrap();
    assert_eq!(connection.state(), ConnectionState::Open);
    assert_eq!(transport.open_attempts(), 1);
    assert_eq!(transport.servers().len(), 1);
    assert_eq!(events.count("connected"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_messages_dispatched_in_order_without_control_frames() {
    let transport = ScriptedTransport::new();
    let connection = connection_over(&transport);
    let events = EventRecorder::attach(&connection);
    connection.connect().await.unwrap();

    let server = transport.last_server().unwrap();
    assert!(server.push_text("one"));
    assert!(server.push(Frame::Pong(Vec::new())));
    assert!(server.push_text("two"));
    settle().await;

    assert_eq!(events.messages(), vec!["one", "two"]);
    assert_eq!(events.count("message"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_pings_every_interval() {
    let transport = ScriptedTransport::new();
    let connection = connection_over(&transport);
    connection.connect().await.unwrap();
    let server = transport.last_server().unwrap();

    tokio::time::sleep(Duration::from_millis(3_500)).await;

    assert_eq!(server.heartbeat_count(), 3);
    assert!(server.sent_text().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_heartbeat_is_reported() {
    let transport = ScriptedTransport::new();
    let connection = connection_over(&transport);
    let events = EventRecorder::attach(&connection);
    connection.connect().await.unwrap();

    transport.last_server().unwrap().fail_sends(true);
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    let heartbeat_errors = events
        .events()
        .into_iter()
        .filter(|event| {
            matches!(
                event,
                ConnectionEvent::Error(ConnectionError::HeartbeatFailed { .. })
            )
        })
        .count();
    assert_eq!(heartbeat_errors, 1);
    // The stream itself is still up; only a close triggers reconnect.
    assert_eq!(connection.state(), ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_unexpected_close_reconnects_with_linear_backoff() {
    let transport = ScriptedTransport::new();
    let connection = connection_over(&transport);
    let events = EventRecorder::attach(&connection);
    connection.connect().await.unwrap();

    transport.set_accepting(false);
    transport.last_server().unwrap().drop_connection();
    settle().await;

    assert_eq!(connection.state(), ConnectionState::Reconnecting);
    assert_eq!(connection.reconnect_attempts(), 1);
    assert_eq!(events.kinds(), vec!["connected", "disconnected"]);

    // First retry after 100ms fails, second is scheduled 200ms later.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(transport.open_attempts(), 2);
    assert_eq!(connection.reconnect_attempts(), 2);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.open_attempts(), 2);

    transport.set_accepting(true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.open_attempts(), 3);
    assert_eq!(connection.state(), ConnectionState::Open);
    assert_eq!(connection.reconnect_attempts(), 0);
    assert_eq!(events.count("connected"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stream_error_is_reported_then_reconnects() {
    let transport = ScriptedTransport::new();
    let connection = connection_over(&transport);
    let events = EventRecorder::attach(&connection);
    connection.connect().await.unwrap();

    transport.last_server().unwrap().push_error("reset by peer");
    settle().await;
    assert_eq!(events.kinds(), vec!["connected", "error", "disconnected"]);
    assert_eq!(connection.state(), ConnectionState::Reconnecting);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connection.state(), ConnectionState::Open);
    assert_eq!(transport.servers().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_gives_up_after_max_attempts() {
    let transport = ScriptedTransport::refusing();
    let connection = connection_over(&transport);
    let events = EventRecorder::attach(&connection);

    // A retry is scheduled, so the first failure is not an error to the caller.
    connection.connect().await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Reconnecting);

    // Retries at +100ms, +300ms and +600ms.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(transport.open_attempts(), 4);
    assert_eq!(connection.state(), ConnectionState::Closed);
    let exhausted = events.events().into_iter().any(|event| {
        matches!(
            event,
            ConnectionEvent::Error(ConnectionError::ReconnectExhausted { attempts: 3, .. })
        )
    });
    assert!(exhausted);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.open_attempts(), 4);

    // An explicit connect starts over.
    transport.set_accepting(true);
    connection.connect().await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Open);
    assert_eq!(transport.open_attempts(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_handler_does_not_starve_others() {
    let transport = ScriptedTransport::new();
    let connection = connection_over(&transport);
    connection.on(|event| {
        if let ConnectionEvent::Message(_) = event {
            panic!("handler bug");
        }
    });
    let events = EventRecorder::attach(&connection);
    connection.connect().await.unwrap();

    let server = transport.last_server().unwrap();
    server.push_text("first");
    server.push_text("second");
    settle().await;

    assert_eq!(events.messages(), vec!["first", "second"]);
    assert_eq!(connection.state(), ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_removed_handler_stops_receiving() {
    let transport = ScriptedTransport::new();
    let connection = connection_over(&transport);
    let kept = EventRecorder::attach(&connection);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let id = connection.on(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert!(connection.off(id));

    connection.connect().await.unwrap();
    assert_eq!(kept.count("connected"), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(connection.handler_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_closes_without_reconnect() {
    let transport = ScriptedTransport::new();
    let connection = connection_over(&transport);
    let events = EventRecorder::attach(&connection);
    connection.connect().await.unwrap();
    let server = transport.last_server().unwrap();

    connection.disconnect().await;
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(server.closed_by_client());
    assert_eq!(events.kinds(), vec!["connected", "disconnected"]);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.open_attempts(), 1);
    assert_eq!(server.heartbeat_count(), 0);

    let err = connection.send(Frame::text("late")).await.unwrap_err();
    assert!(matches!(err, ConnectionError::NotReady { ref state, .. } if state == "closed"));

    connection.disconnect().await;
    assert_eq!(events.count("disconnected"), 1);
}
