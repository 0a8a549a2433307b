use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use crate::core::types::ConnectionId;
use crate::feed::ingestor::FeedIngestor;
use crate::health::{ConnectionRole, ReconnectError, Reconnector};

/// WebSocket endpoint that market data feeds connect to.
///
/// Every accepted socket is tracked as its own feed connection named
/// `feed-<peer addr>`. Text and binary frames are handed to the ingestor.
pub struct WebSocketFeedServer {
    ingestor: Arc<FeedIngestor>,
    address: SocketAddr,
    open: DashMap<ConnectionId, SocketAddr>,
}

impl WebSocketFeedServer {
    pub fn new(ingestor: Arc<FeedIngestor>, address: SocketAddr) -> Self {
        Self {
            ingestor,
            address,
            open: DashMap::new(),
        }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(self.address).await?;
        tracing::info!("feed server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    pub async fn start(self: Arc<Self>) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept loop; returns only if the listener fails
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                let id = ConnectionId::new(format!("feed-{}", addr));
                if let Err(e) = server.handle_connection(stream, addr, &id).await {
                    tracing::warn!(connection = %id, "feed connection error: {}", e);
                }
                server.open.remove_if(&id, |_, owner| *owner == addr);
                tracing::info!(connection = %id, "feed connection closed");
            });
        }
    }

    /// Whether the socket behind `id` is still open
    pub fn is_open(&self, id: &ConnectionId) -> bool {
        self.open.contains_key(id)
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        id: &ConnectionId,
    ) -> Result<()> {
        let ws_stream = accept_async(stream).await?;
        self.open.insert(id.clone(), addr);
        self.ingestor
            .health()
            .open_session(id.clone(), ConnectionRole::FeedSource);
        tracing::info!(connection = %id, "new feed connection");

        let (_write, mut read) = ws_stream.split();
        while let Some(msg) = read.next().await {
            let payload = match msg? {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(bytes) => bytes,
                Message::Close(_) => break,
                _ => continue,
            };
            // errors are already logged and counted by the ingestor
            let _ = self.ingestor.on_message(id, &payload);
        }
        Ok(())
    }
}

/// Feed sockets are inbound, so recovery only succeeds while the peer's
/// socket is still open; a peer that went away must dial in again.
#[async_trait]
impl Reconnector for WebSocketFeedServer {
    async fn reconnect(&self, id: &ConnectionId, _role: ConnectionRole) -> Result<(), ReconnectError> {
        if self.is_open(id) {
            Ok(())
        } else {
            Err(ReconnectError::Failed(format!("{} is disconnected", id)))
        }
    }
}
