// End-to-end: the client's declared GUID replaces the server's provisional
// one, and every GUID-keyed operation routes through the stable identifier.

use courier::{ClientEvent, DisconnectReason, ServerSettings};
use courier_test_utils::{TestClient, TestServer, wait_for_event};
use std::time::Duration;
use uuid::Uuid;

#[tokio::test]
async fn declared_guid_becomes_the_registry_key() {
    let server = TestServer::start(ServerSettings::default())
        .await
        .expect("start");

    let fixed = Uuid::new_v4();
    let client = TestClient::connect_with(server.addr, |settings| {
        settings.guid = fixed;
    })
    .await
    .expect("connect");
    assert_eq!(client.guid, fixed);

    assert!(
        server.wait_for_client(fixed, Duration::from_secs(5)).await,
        "declared guid should appear in the registry"
    );
    let clients = server.server.list_clients().await;
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].guid, fixed);
    assert!(server.server.is_client_connected(fixed).await);
}

#[tokio::test]
async fn user_labels_survive_on_the_rekeyed_record() {
    let server = TestServer::start(ServerSettings::default())
        .await
        .expect("start");
    let client = TestClient::connect(server.addr).await.expect("connect");
    assert!(
        server
            .wait_for_client(client.guid, Duration::from_secs(5))
            .await
    );

    server
        .server
        .set_client_name(client.guid, Some("start-line".to_owned()))
        .await
        .expect("name");
    server
        .server
        .set_client_metadata(client.guid, Some(serde_json::json!({"lane": 2})))
        .await
        .expect("metadata");

    let clients = server.server.list_clients().await;
    assert_eq!(clients[0].name.as_deref(), Some("start-line"));
    assert_eq!(clients[0].metadata, Some(serde_json::json!({"lane": 2})));
}

#[tokio::test]
async fn disconnect_by_declared_guid_reaches_the_client() {
    let server = TestServer::start(ServerSettings::default())
        .await
        .expect("start");
    let client = TestClient::connect(server.addr).await.expect("connect");
    let mut client_events = client.client.events();
    assert!(
        server
            .wait_for_client(client.guid, Duration::from_secs(5))
            .await
    );

    server
        .server
        .disconnect_client(client.guid)
        .await
        .expect("disconnect");

    let event = wait_for_event(&mut client_events, Duration::from_secs(5), |e| {
        matches!(e, ClientEvent::Disconnected { .. })
    })
    .await
    .expect("Disconnected event");
    match event {
        ClientEvent::Disconnected { reason } => {
            assert_eq!(reason, DisconnectReason::Removed);
        }
        _ => unreachable!(),
    }
    assert!(!client.client.is_connected().await);
    assert_eq!(server.server.connection_count().await, 0);
}
