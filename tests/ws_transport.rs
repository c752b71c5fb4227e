use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use messenger_link::frame::{decode_frame, encode_frame};
use messenger_link::storage::MemoryStore;
use messenger_link::transport::WsConnector;
use messenger_link::{Client, ClientConfig, Frame, ProtocolError};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

fn config(url: String) -> ClientConfig {
    ClientConfig {
        server_url: url,
        request_timeout: Duration::from_secs(2),
        retry_delay: Duration::ZERO,
        ..ClientConfig::default()
    }
}

fn reply_for(frame: &Frame) -> Vec<Frame> {
    match frame.event.as_str() {
        "login" => vec![Frame::new(
            "auth_success",
            json!({"user": {"id": 1, "firstName": "A", "lastName": "B", "email": "a@b.com"}}),
        )],
        "auth" => vec![Frame::new(
            "new_message",
            json!({"id": 50, "content": "welcome", "senderId": 2, "conversationId": 9, "isRead": false, "createdAt": "2024-03-01T10:00:00Z"}),
        )],
        "get_conversations" => vec![Frame::new(
            "conversations_list",
            json!([{
                "id": 9, "name": null, "isGroup": false,
                "participants": [{"id": 1, "firstName": "A", "lastName": "B"}, {"id": 2, "firstName": "Ann", "lastName": "Lee"}],
                "updatedAt": "2024-03-01T10:00:00Z"
            }]),
        )],
        _ => Vec::new(),
    }
}

/// Minimal scripted server: answers each client frame from `reply_for`.
async fn spawn_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            let Message::Text(text) = msg else {
                continue;
            };
            let frame = decode_frame(&text).unwrap();
            for reply in reply_for(&frame) {
                ws.send(Message::Text(encode_frame(&reply).into()))
                    .await
                    .unwrap();
            }
        }
    });
    format!("ws://{addr}")
}

#[tokio::test]
async fn login_push_and_request_over_websocket() {
    let url = spawn_server().await;
    let client = Client::new(
        config(url.clone()),
        Arc::new(WsConnector::new(url)),
        Arc::new(MemoryStore::new()),
    )
    .unwrap();

    let session = client.login("a@b.com", "pw").await.unwrap();
    assert_eq!(session.id, 1);

    let messenger = Arc::clone(client.messenger());
    tokio::time::timeout(Duration::from_secs(2), async {
        while messenger.unread_count(9) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let conversations = messenger.load_conversations().await.unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(messenger.display_name(&conversations[0]), "Ann Lee");

    client.shutdown();
    assert!(!client.manager().is_connected());
}

#[tokio::test]
async fn closed_port_is_connection_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let client = Client::new(
        config(url.clone()),
        Arc::new(WsConnector::new(url)),
        Arc::new(MemoryStore::new()),
    )
    .unwrap();

    let err = client.login("a@b.com", "pw").await.unwrap_err();
    assert!(matches!(err, ProtocolError::ConnectionFailure(_)), "got {err:?}");
}
