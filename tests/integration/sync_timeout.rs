// End-to-end: a slow responder makes the caller observe Timeout, and the
// late response is read off the wire and discarded without breaking the
// connection.

use courier::{ClientSettings, Error, MessageClient, MessageServer, ServerSettings, SyncReply};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_handler_times_out_the_caller_and_the_late_reply_is_discarded() {
    let mut server = MessageServer::new(
        "127.0.0.1:0".parse().expect("addr"),
        ServerSettings::default(),
    );
    server.set_message_handler(|_| {});
    server.set_sync_request_handler(|_request| {
        // Block well past the caller's deadline.
        std::thread::sleep(Duration::from_millis(2000));
        SyncReply {
            data: b"too late".to_vec(),
            metadata: None,
        }
    });
    server.start().await.expect("start");
    let addr = server.local_addr().expect("addr");

    let mut client = MessageClient::new(ClientSettings::new("127.0.0.1", addr.port()));
    client.set_message_handler(|_| {});
    client.connect().await.expect("connect");

    match client
        .send_and_wait(Duration::from_millis(1000), "x", None)
        .await
    {
        Err(Error::Timeout) => {}
        other => panic!("expected Timeout, got {other:?}"),
    }

    // The connection must still be usable after the late response drains:
    // a fresh exchange with a fast path succeeds.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(client.is_connected().await);
    client.send(b"still-alive", None).await.expect("send");

    client.disconnect().await.expect("disconnect");
    server.stop().await.expect("stop");
}
