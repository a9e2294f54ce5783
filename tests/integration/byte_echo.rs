// End-to-end: a client sends a small payload and the server's message
// handler observes exactly those bytes.

use courier::{ServerEvent, ServerSettings};
use courier_test_utils::{TestClient, TestServer, wait_for_event};
use std::time::Duration;

#[tokio::test]
async fn client_payload_reaches_the_server_verbatim() {
    let mut server = TestServer::start(ServerSettings::default())
        .await
        .expect("server start");
    let mut events = server.server.events();

    let client = TestClient::connect(server.addr).await.expect("connect");
    wait_for_event(&mut events, Duration::from_secs(5), |e| {
        matches!(e, ServerEvent::ClientConnected { .. })
    })
    .await
    .expect("ClientConnected");

    client.client.send("Hello", None).await.expect("send");

    let received = server.recv(Duration::from_secs(5)).await.expect("message");
    assert_eq!(received.data, b"Hello");
    assert!(received.metadata.is_none());

    let stats = client.client.statistics().snapshot();
    assert_eq!(stats.sent_messages, 2, "register frame plus the payload");
    assert_eq!(stats.sent_bytes, 5);
}

#[tokio::test]
async fn echo_replies_flow_back_to_the_client() {
    let mut server = TestServer::start(ServerSettings::default())
        .await
        .expect("server start");
    let mut client = TestClient::connect(server.addr).await.expect("connect");
    assert!(
        server
            .wait_for_client(client.guid, Duration::from_secs(5))
            .await
    );

    client.client.send(b"marco", None).await.expect("send");
    let inbound = server.recv(Duration::from_secs(5)).await.expect("message");
    let sender = inbound.guid.expect("server sees the sender guid");
    assert_eq!(sender, client.guid);

    server
        .server
        .send(sender, b"polo", None)
        .await
        .expect("reply");
    let reply = client.recv(Duration::from_secs(5)).await.expect("reply");
    assert_eq!(reply.data, b"polo");
    assert!(reply.guid.is_none(), "client-side events carry no guid");
}

#[tokio::test]
async fn send_from_transmits_the_tail_only() {
    let mut server = TestServer::start(ServerSettings::default())
        .await
        .expect("server start");
    let client = TestClient::connect(server.addr).await.expect("connect");

    let data = b"prefix:payload".to_vec();
    client
        .client
        .send_from(&data, 7, None)
        .await
        .expect("send_from");
    let received = server.recv(Duration::from_secs(5)).await.expect("message");
    assert_eq!(received.data, b"payload");

    // Out-of-bounds offsets fail synchronously.
    assert!(client.client.send_from(&data, 15, None).await.is_err());
}
