//! A server fixture with a channel-backed message handler.

use crate::ReceivedMessage;
use courier_core::{MessageServer, Result, ServerSettings};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

pub struct TestServer {
    pub server: MessageServer,
    pub addr: SocketAddr,
    received: mpsc::UnboundedReceiver<ReceivedMessage>,
}

impl TestServer {
    /// Start a server on a random loopback port with a message handler that
    /// forwards everything into [`TestServer::recv`].
    pub async fn start(settings: ServerSettings) -> Result<Self> {
        let bind: SocketAddr = ([127, 0, 0, 1], 0).into();
        let mut server = MessageServer::new(bind, settings);
        let (tx, received) = mpsc::unbounded_channel();
        server.set_message_handler(move |event| {
            let _ = tx.send(ReceivedMessage {
                guid: event.guid,
                metadata: event.metadata,
                data: event.data,
            });
        });
        server.start().await?;
        let addr = server
            .local_addr()
            .ok_or_else(|| courier_core::Error::Config("server reported no address".to_owned()))?;
        Ok(TestServer {
            server,
            addr,
            received,
        })
    }

    /// Next message delivered to the server's handler, within `timeout`.
    pub async fn recv(&mut self, timeout: Duration) -> Option<ReceivedMessage> {
        tokio::time::timeout(timeout, self.received.recv())
            .await
            .ok()
            .flatten()
    }

    /// Poll until the client that declared `guid` is registered under it
    /// (i.e. the RegisterClient rekey has landed), or `timeout` passes.
    pub async fn wait_for_client(&self, guid: Uuid, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.server.is_client_connected(guid).await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
