//! A client fixture with a channel-backed message handler.

use crate::ReceivedMessage;
use courier_core::{ClientSettings, MessageClient, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

pub struct TestClient {
    pub client: MessageClient,
    /// The GUID this client declared to the server.
    pub guid: Uuid,
    received: mpsc::UnboundedReceiver<ReceivedMessage>,
}

impl TestClient {
    /// Connect to `addr` with default settings.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::connect_with(addr, |_| {}).await
    }

    /// Connect to `addr`, letting the caller adjust settings first.
    pub async fn connect_with(
        addr: SocketAddr,
        configure: impl FnOnce(&mut ClientSettings),
    ) -> Result<Self> {
        let mut settings = ClientSettings::new(addr.ip().to_string(), addr.port());
        configure(&mut settings);
        let guid = settings.guid;
        let mut client = MessageClient::new(settings);
        let (tx, received) = mpsc::unbounded_channel();
        client.set_message_handler(move |event| {
            let _ = tx.send(ReceivedMessage {
                guid: event.guid,
                metadata: event.metadata,
                data: event.data,
            });
        });
        client.connect().await?;
        Ok(TestClient {
            client,
            guid,
            received,
        })
    }

    /// Next message delivered to the client's handler, within `timeout`.
    pub async fn recv(&mut self, timeout: Duration) -> Option<ReceivedMessage> {
        tokio::time::timeout(timeout, self.received.recv())
            .await
            .ok()
            .flatten()
    }
}
