use super::*;
use crate::connection::ConnectionState;
use crate::storage::MemoryStore;
use crate::transport::test_helpers::{ServerEnd, accept, channel_connector};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;

fn test_config() -> ClientConfig {
    ClientConfig {
        request_timeout: Duration::from_millis(1000),
        retry_delay: Duration::ZERO,
        ..ClientConfig::default()
    }
}

fn client() -> (Client, mpsc::UnboundedReceiver<ServerEnd>) {
    let (connector, servers) = channel_connector();
    let client = Client::new(test_config(), connector, Arc::new(MemoryStore::new())).unwrap();
    (client, servers)
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

fn user(id: i64) -> serde_json::Value {
    json!({"user": {"id": id, "firstName": "A", "lastName": "B", "email": "a@b.com"}})
}

async fn login(client: &Arc<Client>, server: &mut ServerEnd, id: i64) {
    let call = {
        let client = Arc::clone(client);
        tokio::spawn(async move { client.login("a@b.com", "pw").await })
    };
    server.expect("login").await;
    server.send("auth_success", user(id));
    call.await.unwrap().unwrap();
    server.expect("auth").await;
}

#[tokio::test]
async fn no_connection_until_first_request() {
    let (client, _servers) = client();
    assert_eq!(client.manager().state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn pushes_reach_the_messenger_after_login() {
    let (client, mut servers) = client();
    let client = Arc::new(client);
    let login_task = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.login("a@b.com", "pw").await })
    };
    let mut server = accept(&mut servers).await;
    server.expect("login").await;
    server.send("auth_success", user(1));
    login_task.await.unwrap().unwrap();
    server.expect("auth").await;

    server.send(
        "new_message",
        json!({"id": 3, "content": "yo", "senderId": 2, "conversationId": 9, "isRead": false, "createdAt": "2024-03-01T10:00:00Z"}),
    );

    let messenger = Arc::clone(client.messenger());
    wait_for(|| messenger.unread_count(9) == 1).await;
}

#[tokio::test]
async fn logout_resets_messaging_state() {
    let (client, mut servers) = client();
    let client = Arc::new(client);
    client.manager().connect_and_wait().await.unwrap();
    let mut server = accept(&mut servers).await;
    login(&client, &mut server, 1).await;

    client.messenger().select_conversation(Some(4));
    let call = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.logout().await })
    };
    server.expect("logout").await;
    server.send("logout_success", json!(null));
    call.await.unwrap().unwrap();

    assert!(client.session().current().is_none());
    assert_eq!(client.messenger().active_conversation(), None);
}

#[tokio::test]
async fn switching_user_drops_previous_messages() {
    let (client, mut servers) = client();
    let client = Arc::new(client);
    client.manager().connect_and_wait().await.unwrap();
    let mut server = accept(&mut servers).await;
    login(&client, &mut server, 1).await;
    client.messenger().select_conversation(Some(4));

    login(&client, &mut server, 1).await;
    assert_eq!(client.messenger().active_conversation(), Some(4));

    login(&client, &mut server, 2).await;
    assert_eq!(client.messenger().active_conversation(), None);
}

#[tokio::test]
async fn shutdown_disconnects() {
    let (client, mut servers) = client();
    client.manager().connect_and_wait().await.unwrap();
    let _server = accept(&mut servers).await;

    client.shutdown();

    assert_eq!(client.manager().state(), ConnectionState::Disconnected);
}
