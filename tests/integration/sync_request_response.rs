// End-to-end: send_and_wait correlates request and response in both
// directions, preserving metadata.

use courier::{
    ClientSettings, MessageClient, MessageServer, Metadata, ServerSettings, SyncReply,
};
use std::time::Duration;

fn md(key: &str, value: &str) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert(key.to_owned(), serde_json::json!(value));
    metadata
}

#[tokio::test]
async fn client_request_gets_the_correlated_server_response() {
    let mut server = MessageServer::new(
        "127.0.0.1:0".parse().expect("addr"),
        ServerSettings::default(),
    );
    server.set_message_handler(|_| {});
    server.set_sync_request_handler(|request| {
        assert_eq!(request.data, b"ping");
        let metadata = request.metadata.expect("request metadata");
        assert_eq!(metadata["k"], serde_json::json!("v"));
        SyncReply {
            data: b"pong".to_vec(),
            metadata: Some(md("a", "b")),
        }
    });
    server.start().await.expect("start");
    let addr = server.local_addr().expect("addr");

    let mut client = MessageClient::new(ClientSettings::new("127.0.0.1", addr.port()));
    client.set_message_handler(|_| {});
    client.connect().await.expect("connect");

    let started = std::time::Instant::now();
    let response = client
        .send_and_wait(Duration::from_millis(5000), "ping", Some(md("k", "v")))
        .await
        .expect("sync response");

    assert_eq!(response.data, b"pong");
    assert_eq!(
        response.metadata.expect("response metadata")["a"],
        serde_json::json!("b")
    );
    assert!(started.elapsed() < Duration::from_secs(5));

    client.disconnect().await.expect("disconnect");
    server.stop().await.expect("stop");
}

#[tokio::test]
async fn server_can_send_and_wait_on_a_client() {
    let mut server = MessageServer::new(
        "127.0.0.1:0".parse().expect("addr"),
        ServerSettings::default(),
    );
    server.set_message_handler(|_| {});
    server.start().await.expect("start");
    let addr = server.local_addr().expect("addr");

    let settings = ClientSettings::new("127.0.0.1", addr.port());
    let guid = settings.guid;
    let mut client = MessageClient::new(settings);
    client.set_message_handler(|_| {});
    client.set_sync_request_handler(|request| SyncReply {
        data: request.data.iter().rev().copied().collect(),
        metadata: None,
    });
    client.connect().await.expect("connect");

    // Wait for the rekey so the declared guid routes.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !server.is_client_connected(guid).await {
        assert!(tokio::time::Instant::now() < deadline, "client never registered");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let response = server
        .send_and_wait(Duration::from_millis(5000), guid, b"abc", None)
        .await
        .expect("sync response");
    assert_eq!(response.data, b"cba");

    server.stop().await.expect("stop");
}

#[tokio::test]
async fn sub_second_timeouts_are_rejected_up_front() {
    let mut server = MessageServer::new(
        "127.0.0.1:0".parse().expect("addr"),
        ServerSettings::default(),
    );
    server.set_message_handler(|_| {});
    server.start().await.expect("start");
    let addr = server.local_addr().expect("addr");

    let mut client = MessageClient::new(ClientSettings::new("127.0.0.1", addr.port()));
    client.set_message_handler(|_| {});
    client.connect().await.expect("connect");

    match client
        .send_and_wait(Duration::from_millis(999), b"x", None)
        .await
    {
        Err(courier::Error::Config(_)) => {}
        other => panic!("expected Config error, got {other:?}"),
    }

    server.stop().await.expect("stop");
}
