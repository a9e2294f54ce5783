// End-to-end: metadata survives the wire, with and without payload bytes.

use courier::{Metadata, ServerSettings};
use courier_test_utils::{TestClient, TestServer};
use std::time::Duration;

#[tokio::test]
async fn metadata_rides_an_empty_payload() {
    let mut server = TestServer::start(ServerSettings::default())
        .await
        .expect("server start");
    let client = TestClient::connect(server.addr).await.expect("connect");

    let mut md = Metadata::new();
    md.insert("foo".to_owned(), serde_json::json!("bar"));
    client.client.send("", Some(md)).await.expect("send");

    let received = server.recv(Duration::from_secs(5)).await.expect("message");
    assert_eq!(received.data.len(), 0);
    let metadata = received.metadata.expect("metadata present");
    assert_eq!(metadata["foo"], serde_json::json!("bar"));
}

#[tokio::test]
async fn heterogeneous_metadata_values_round_trip() {
    let mut server = TestServer::start(ServerSettings::default())
        .await
        .expect("server start");
    let client = TestClient::connect(server.addr).await.expect("connect");

    let mut md = Metadata::new();
    md.insert("text".to_owned(), serde_json::json!("value"));
    md.insert("number".to_owned(), serde_json::json!(42.5));
    md.insert("flag".to_owned(), serde_json::json!(true));
    md.insert("nothing".to_owned(), serde_json::Value::Null);
    md.insert("list".to_owned(), serde_json::json!([1, 2, 3]));
    md.insert("nested".to_owned(), serde_json::json!({"a": {"b": "c"}}));

    client
        .client
        .send(b"with-metadata", Some(md.clone()))
        .await
        .expect("send");

    let received = server.recv(Duration::from_secs(5)).await.expect("message");
    assert_eq!(received.data, b"with-metadata");
    assert_eq!(received.metadata.expect("metadata"), md);
}
