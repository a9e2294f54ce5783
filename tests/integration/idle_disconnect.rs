// End-to-end: the idle-client reaper disconnects a silent client within one
// reaper tick past the configured timeout, and both ends observe Timeout.

use courier::{ClientEvent, DisconnectReason, ServerEvent, ServerSettings};
use courier_test_utils::{TestClient, TestServer, wait_for_event};
use std::time::Duration;

#[tokio::test]
async fn silent_client_is_reaped_with_timeout_on_both_ends() {
    let mut settings = ServerSettings::default();
    settings.idle_client_timeout = Some(Duration::from_secs(1));
    let server = TestServer::start(settings).await.expect("start");
    let mut server_events = server.server.events();

    let client = TestClient::connect(server.addr).await.expect("connect");
    let mut client_events = client.client.events();

    // Stay silent; the reaper runs on a 5-second tick, so allow one full
    // tick plus slack.
    let disconnected = wait_for_event(&mut server_events, Duration::from_secs(8), |e| {
        matches!(e, ServerEvent::ClientDisconnected { .. })
    })
    .await
    .expect("server ClientDisconnected");
    match disconnected {
        ServerEvent::ClientDisconnected { reason, .. } => {
            assert_eq!(reason, DisconnectReason::Timeout);
        }
        _ => unreachable!(),
    }

    let client_side = wait_for_event(&mut client_events, Duration::from_secs(8), |e| {
        matches!(e, ClientEvent::Disconnected { .. })
    })
    .await
    .expect("client Disconnected");
    match client_side {
        ClientEvent::Disconnected { reason } => {
            assert_eq!(reason, DisconnectReason::Timeout);
        }
        _ => unreachable!(),
    }

    assert!(!client.client.is_connected().await);
    assert_eq!(server.server.connection_count().await, 0);
}

#[tokio::test]
async fn active_clients_survive_the_reaper() {
    let mut settings = ServerSettings::default();
    settings.idle_client_timeout = Some(Duration::from_secs(4));
    let mut server = TestServer::start(settings).await.expect("start");

    let client = TestClient::connect(server.addr).await.expect("connect");

    // Keep the connection warm across one reaper tick.
    for _ in 0..6 {
        client.client.send(b"tick", None).await.expect("send");
        assert!(server.recv(Duration::from_secs(5)).await.is_some());
        tokio::time::sleep(Duration::from_millis(900)).await;
    }
    assert!(client.client.is_connected().await);
    assert_eq!(server.server.connection_count().await, 1);
}
