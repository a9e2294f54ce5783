// End-to-end: preshared-key authentication.  A client with the right key is
// admitted; a connection that talks before authenticating is cut off with
// AuthFailure and never delivers a user-visible message.

use courier::{
    ClientEvent, DisconnectReason, PskKey, ServerEvent, ServerSettings,
};
use courier_protocol::{self as protocol, FrameHeader, Status};
use courier_test_utils::{TestClient, TestServer, wait_for_event};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const KEY: &[u8; 16] = b"1234567812345678";

fn psk_settings() -> ServerSettings {
    let mut settings = ServerSettings::default();
    settings.preshared_key = Some(PskKey::new(KEY).expect("key"));
    settings
}

/// Read one frame header off a raw socket (payloads in this suite are empty).
async fn read_raw_header(stream: &mut TcpStream) -> Option<FrameHeader> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => buf.push(byte[0]),
        }
        if let Some(at) = protocol::find_terminator(&buf) {
            return protocol::parse_header(&buf[..at]).ok();
        }
    }
}

#[tokio::test]
async fn matching_key_authenticates_and_messages_flow() {
    let mut server = TestServer::start(psk_settings()).await.expect("start");
    let mut server_events = server.server.events();

    let client = TestClient::connect_with(server.addr, |settings| {
        settings.preshared_key = Some(PskKey::new(KEY).expect("key"));
    })
    .await
    .expect("connect");
    let mut client_events = client.client.events();

    wait_for_event(&mut client_events, Duration::from_secs(5), |e| {
        matches!(e, ClientEvent::AuthenticationSucceeded)
    })
    .await
    .expect("client AuthenticationSucceeded");
    wait_for_event(&mut server_events, Duration::from_secs(5), |e| {
        matches!(e, ServerEvent::AuthenticationSucceeded { .. })
    })
    .await
    .expect("server AuthenticationSucceeded");

    client.client.send(b"ok", None).await.expect("send");
    let received = server.recv(Duration::from_secs(5)).await.expect("message");
    assert_eq!(received.data, b"ok");
}

#[tokio::test]
async fn unauthenticated_normal_frame_is_cut_off_with_auth_failure() {
    let mut server = TestServer::start(psk_settings()).await.expect("start");
    let mut server_events = server.server.events();

    let mut raw = TcpStream::connect(server.addr).await.expect("tcp connect");

    // The server challenges first.
    let challenge = read_raw_header(&mut raw).await.expect("challenge");
    assert_eq!(challenge.status, Status::AuthRequired);

    // Talk without authenticating.
    let rogue = FrameHeader::normal(1, None);
    let mut bytes = protocol::encode_header(&rogue).expect("encode");
    bytes.push(b'x');
    raw.write_all(&bytes).await.expect("write");

    // The server answers AuthFailure and drops the connection.
    let verdict = read_raw_header(&mut raw).await.expect("verdict");
    assert_eq!(verdict.status, Status::AuthFailure);
    assert!(read_raw_header(&mut raw).await.is_none(), "connection closed");

    let disconnected = wait_for_event(&mut server_events, Duration::from_secs(5), |e| {
        matches!(e, ServerEvent::ClientDisconnected { .. })
    })
    .await
    .expect("ClientDisconnected");
    match disconnected {
        ServerEvent::ClientDisconnected { reason, .. } => {
            assert_eq!(reason, DisconnectReason::AuthFailure);
        }
        _ => unreachable!(),
    }

    // Nothing user-visible was delivered.
    assert!(server.recv(Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn wrong_key_is_rejected_with_auth_failure() {
    let server = TestServer::start(psk_settings()).await.expect("start");

    let mut raw = TcpStream::connect(server.addr).await.expect("tcp connect");
    let challenge = read_raw_header(&mut raw).await.expect("challenge");
    assert_eq!(challenge.status, Status::AuthRequired);

    let attempt = FrameHeader::auth_requested(*b"0000000000000000");
    let bytes = protocol::encode_header(&attempt).expect("encode");
    raw.write_all(&bytes).await.expect("write");

    let verdict = read_raw_header(&mut raw).await.expect("verdict");
    assert_eq!(verdict.status, Status::AuthFailure);
    assert!(read_raw_header(&mut raw).await.is_none(), "connection closed");
}

#[tokio::test]
async fn padded_key_material_still_matches() {
    // Key material shorter than 16 bytes is space-padded on the client and
    // the server compares trimmed forms.
    let mut settings = ServerSettings::default();
    settings.preshared_key = Some(PskKey::new(b"shortkey        ").expect("key"));
    let mut server = TestServer::start(settings).await.expect("start");

    let client = TestClient::connect_with(server.addr, |s| {
        s.preshared_key = Some(PskKey::new(b"shortkey        ").expect("key"));
    })
    .await
    .expect("connect");
    let mut client_events = client.client.events();

    wait_for_event(&mut client_events, Duration::from_secs(5), |e| {
        matches!(e, ClientEvent::AuthenticationSucceeded)
    })
    .await
    .expect("authenticated");

    client.client.send(b"trimmed", None).await.expect("send");
    let received = server.recv(Duration::from_secs(5)).await.expect("message");
    assert_eq!(received.data, b"trimmed");
}
