// End-to-end: concurrent sends on one connection never interleave on the
// wire; every frame decodes cleanly with its payload intact.

use courier::ServerSettings;
use courier_test_utils::{TestClient, TestServer};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_server_sends_arrive_as_whole_frames() {
    let server = TestServer::start(ServerSettings::default())
        .await
        .expect("start");
    let mut client = TestClient::connect(server.addr).await.expect("connect");
    assert!(
        server
            .wait_for_client(client.guid, Duration::from_secs(5))
            .await
    );

    let server = Arc::new(server.server);
    let mut jobs = Vec::new();
    for i in 0..16u8 {
        let server = server.clone();
        let guid = client.guid;
        jobs.push(tokio::spawn(async move {
            // Distinct uniform payloads make torn frames detectable.
            let payload = vec![b'a' + i, b'a' + i].repeat(2048);
            server.send(guid, payload, None).await.expect("send");
        }));
    }
    for job in jobs {
        job.await.expect("join");
    }

    let mut seen = HashSet::new();
    for _ in 0..16 {
        let message = client.recv(Duration::from_secs(5)).await.expect("message");
        assert_eq!(message.data.len(), 4096);
        let first = message.data[0];
        assert!(
            message.data.iter().all(|b| *b == first),
            "payload bytes must be uniform"
        );
        seen.insert(first);
    }
    assert_eq!(seen.len(), 16, "every send arrived exactly once");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_client_sends_arrive_as_whole_frames() {
    let mut server = TestServer::start(ServerSettings::default())
        .await
        .expect("start");
    let client = TestClient::connect(server.addr).await.expect("connect");

    let client = Arc::new(client.client);
    let mut jobs = Vec::new();
    for i in 0..16u8 {
        let client = client.clone();
        jobs.push(tokio::spawn(async move {
            let payload = vec![b'A' + i; 3000];
            client.send(payload, None).await.expect("send");
        }));
    }
    for job in jobs {
        job.await.expect("join");
    }

    let mut seen = HashSet::new();
    for _ in 0..16 {
        let message = server.recv(Duration::from_secs(5)).await.expect("message");
        assert_eq!(message.data.len(), 3000);
        let first = message.data[0];
        assert!(message.data.iter().all(|b| *b == first));
        seen.insert(first);
    }
    assert_eq!(seen.len(), 16);
}
