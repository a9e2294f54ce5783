// End-to-end: stream-mode delivery.  Payloads under the proxied threshold
// arrive as buffered readers; larger ones stream straight off the wire, and
// the connection stays aligned for the next frame either way.

use courier::{MessageServer, ServerSettings};
use courier_test_utils::TestClient;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

async fn start_stream_server(settings: ServerSettings) -> (MessageServer, std::net::SocketAddr, mpsc::UnboundedReceiver<(u64, Vec<u8>)>) {
    let mut server = MessageServer::new("127.0.0.1:0".parse().expect("addr"), settings);
    let (tx, rx) = mpsc::unbounded_channel();
    server.set_stream_handler(move |mut event| {
        let tx = tx.clone();
        async move {
            let mut data = Vec::new();
            event
                .payload
                .read_to_end(&mut data)
                .await
                .expect("drain payload");
            let _ = tx.send((event.len, data));
        }
    });
    server.start().await.expect("start");
    let addr = server.local_addr().expect("addr");
    (server, addr, rx)
}

#[tokio::test]
async fn small_payloads_arrive_buffered() {
    let (mut server, addr, mut rx) = start_stream_server(ServerSettings::default()).await;

    let client = TestClient::connect(addr).await.expect("connect");
    client.client.send(b"buffered payload", None).await.expect("send");

    let (len, data) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timely")
        .expect("delivery");
    assert_eq!(len, 16);
    assert_eq!(data, b"buffered payload");

    server.stop().await.expect("stop");
}

#[tokio::test]
async fn large_payloads_stream_off_the_wire() {
    let mut settings = ServerSettings::default();
    // Force the pass-through path for anything over 1 KiB.
    settings.max_proxied_stream_size = 1024;
    settings.stream_buffer_size = 512;
    let (mut server, addr, mut rx) = start_stream_server(settings).await;

    let client = TestClient::connect(addr).await.expect("connect");

    let big: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 251) as u8).collect();
    client.client.send(big.clone(), None).await.expect("send big");
    // A follow-up frame proves the wire stayed aligned after the proxied read.
    client.client.send(b"after", None).await.expect("send small");

    let (len, data) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timely")
        .expect("delivery");
    assert_eq!(len, big.len() as u64);
    assert_eq!(data, big);

    let (len, data) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timely")
        .expect("second delivery");
    assert_eq!(len, 5);
    assert_eq!(data, b"after");

    server.stop().await.expect("stop");
}

#[tokio::test]
async fn streamed_sends_copy_exactly_len_bytes() {
    let (mut server, addr, mut rx) = start_stream_server(ServerSettings::default()).await;

    let client = TestClient::connect(addr).await.expect("connect");
    let mut source = std::io::Cursor::new(b"streamed-bytes-and-then-some".to_vec());
    client
        .client
        .send_stream(14, &mut source, None)
        .await
        .expect("send_stream");

    let (len, data) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timely")
        .expect("delivery");
    assert_eq!(len, 14);
    assert_eq!(data, b"streamed-bytes");

    server.stop().await.expect("stop");
}
