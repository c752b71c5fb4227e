use super::*;
use crate::transport::test_helpers::{ServerEnd, accept, channel_connector};
use serde_json::json;
use std::sync::Arc;

async fn connected(timeout_ms: u64) -> (Correlator, ServerEnd) {
    let (connector, mut servers) = channel_connector();
    let manager = ConnectionManager::new(connector, 3, Duration::ZERO);
    let correlator = Correlator::new(manager, Duration::from_millis(timeout_ms));
    correlator.manager().connect_and_wait().await.unwrap();
    let server = accept(&mut servers).await;
    (correlator, server)
}

fn spawn_request(
    correlator: &Correlator,
    frame: Frame,
    success: &'static str,
    error: &'static str,
) -> tokio::task::JoinHandle<Result<Value, ProtocolError>> {
    let correlator = correlator.clone();
    tokio::spawn(async move { correlator.request(frame, success, error).await })
}

async fn current_pending(correlator: &Correlator) -> usize {
    correlator
        .manager()
        .connect_and_wait()
        .await
        .unwrap()
        .pending_count()
}

// =============================================================================
// outcomes
// =============================================================================

#[tokio::test]
async fn success_event_resolves_with_payload() {
    let (correlator, mut server) = connected(1000).await;
    let call = spawn_request(&correlator, Frame::new("ping", json!({"n": 1})), "pong", "ping_error");

    let req = server.expect("ping").await;
    assert_eq!(req.data["n"], 1);
    server.send("pong", json!({"n": 2}));

    let data = call.await.unwrap().unwrap();
    assert_eq!(data["n"], 2);
    assert_eq!(current_pending(&correlator).await, 0);
}

#[tokio::test]
async fn error_event_surfaces_server_message_verbatim() {
    let (correlator, mut server) = connected(1000).await;
    let call = spawn_request(&correlator, Frame::bare("ping"), "pong", "ping_error");

    server.expect("ping").await;
    server.send("ping_error", json!({"message": "Неверный email или пароль"}));

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(&err, ProtocolError::Rejected { message } if message == "Неверный email или пароль"));
    assert_eq!(err.to_string(), "Неверный email или пароль");
}

#[tokio::test]
async fn error_event_without_message_gets_generic_text() {
    let (correlator, mut server) = connected(1000).await;
    let call = spawn_request(&correlator, Frame::bare("logout"), "logout_success", "logout_error");

    server.expect("logout").await;
    server.send("logout_error", Value::Null);

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.to_string(), "logout rejected by server");
}

#[tokio::test]
async fn silence_times_out_and_cleans_up() {
    let (correlator, mut server) = connected(50).await;
    let call = spawn_request(&correlator, Frame::new("get_messages", json!({"conversationId": 5})), "messages_list", "messages_error");

    server.expect("get_messages").await;
    let err = call.await.unwrap().unwrap_err();

    assert!(matches!(err, ProtocolError::Timeout { ref event } if event == "get_messages"));
    assert_eq!(err.to_string(), "server did not respond in time");
    assert_eq!(current_pending(&correlator).await, 0);
}

#[tokio::test]
async fn late_reply_after_timeout_is_a_noop() {
    let (correlator, mut server) = connected(30).await;
    let mut pushes = correlator.manager().subscribe();
    let call = spawn_request(&correlator, Frame::bare("ping"), "pong", "ping_error");

    server.expect("ping").await;
    assert!(matches!(call.await.unwrap(), Err(ProtocolError::Timeout { .. })));

    server.send("pong", json!(1));
    let seen = tokio::time::timeout(Duration::from_secs(1), pushes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen.event, "pong");
    assert_eq!(current_pending(&correlator).await, 0);
}

#[tokio::test]
async fn concurrent_correlations_resolve_independently() {
    let (correlator, mut server) = connected(1000).await;
    let first = spawn_request(&correlator, Frame::bare("a"), "a_ok", "a_err");
    server.expect("a").await;
    let second = spawn_request(&correlator, Frame::bare("b"), "b_ok", "b_err");
    server.expect("b").await;

    server.send("b_ok", json!("second"));
    assert_eq!(second.await.unwrap().unwrap(), json!("second"));
    assert!(!first.is_finished());
    assert_eq!(current_pending(&correlator).await, 1);

    server.send("a_ok", json!("first"));
    assert_eq!(first.await.unwrap().unwrap(), json!("first"));
}

#[tokio::test]
async fn matching_correlation_ignores_foreign_replies() {
    let (correlator, mut server) = connected(1000).await;
    let call = {
        let correlator = correlator.clone();
        tokio::spawn(async move {
            correlator
                .request_matching(Frame::new("get_messages", json!({"conversationId": 2})), "messages_list", "messages_error", |v| {
                    v["conversationId"] == 2
                })
                .await
        })
    };

    server.expect("get_messages").await;
    server.send("messages_list", json!({"conversationId": 1, "messages": []}));
    server.send("messages_list", json!({"conversationId": 2, "messages": [1]}));

    let data = call.await.unwrap().unwrap();
    assert_eq!(data["conversationId"], 2);
}

// =============================================================================
// connection failures
// =============================================================================

#[tokio::test]
async fn unreachable_server_is_connection_failure() {
    let (connector, _servers) = channel_connector();
    connector.fail_next(3);
    let manager = ConnectionManager::new(Arc::clone(&connector) as Arc<dyn crate::transport::Connector>, 3, Duration::ZERO);
    let correlator = Correlator::new(manager, Duration::from_millis(100));

    let err = correlator
        .request(Frame::bare("ping"), "pong", "ping_error")
        .await
        .unwrap_err();

    assert!(matches!(err, ProtocolError::ConnectionFailure(ConnectionError::Exhausted { .. })));
    assert!(err.to_string().starts_with("cannot reach server"));
    assert_eq!(connector.attempts(), 3);
}

#[tokio::test]
async fn disconnect_rejects_pending_with_connection_failure() {
    let (correlator, mut server) = connected(5000).await;
    let call = spawn_request(&correlator, Frame::bare("ping"), "pong", "ping_error");
    server.expect("ping").await;

    correlator.manager().disconnect();

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, ProtocolError::ConnectionFailure(ConnectionError::Closed)));
}

#[tokio::test]
async fn emit_writes_without_waiting() {
    let (correlator, mut server) = connected(1000).await;

    correlator.emit(Frame::new("auth", 1)).await.unwrap();

    let frame = server.expect("auth").await;
    assert_eq!(frame.data, json!(1));
}

// =============================================================================
// error codes
// =============================================================================

#[test]
fn error_codes_and_retryable_flags() {
    let timeout = ProtocolError::Timeout { event: "login".into() };
    assert_eq!(timeout.error_code(), "E_TIMEOUT");
    assert!(timeout.retryable());

    let conn = ProtocolError::ConnectionFailure(ConnectionError::Closed);
    assert_eq!(conn.error_code(), "E_CONNECTION");
    assert!(conn.retryable());

    let rejected = ProtocolError::Rejected { message: "no".into() };
    assert_eq!(rejected.error_code(), "E_REJECTED");
    assert!(!rejected.retryable());

    assert_eq!(ProtocolError::Validation("empty".into()).error_code(), "E_VALIDATION");
}

#[test]
fn decode_names_the_event() {
    let err = decode::<Vec<i64>>("conversations_list", json!({"not": "a list"})).unwrap_err();
    assert!(err.to_string().contains("conversations_list"));
}
