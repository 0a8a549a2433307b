use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use crate::core::types::ConnectionId;
use crate::gateway::orchestrator::SignalOrchestrator;
use crate::gateway::sink::ChannelSink;
use crate::health::{ConnectionRole, HealthEvent, ReconnectError, Reconnector};

/// WebSocket endpoint for trader workstations.
///
/// A workstation identifies itself with its first text frame; after that
/// any inbound frame counts as liveness and queued signals are written out
/// as JSON text frames.
pub struct WorkstationServer {
    orchestrator: Arc<SignalOrchestrator>,
    address: SocketAddr,
    outbound_capacity: usize,
    open: DashMap<ConnectionId, SocketAddr>,
}

impl WorkstationServer {
    pub fn new(orchestrator: Arc<SignalOrchestrator>, address: SocketAddr, outbound_capacity: usize) -> Self {
        Self {
            orchestrator,
            address,
            outbound_capacity,
            open: DashMap::new(),
        }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(self.address).await?;
        tracing::info!("workstation server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    pub async fn start(self: Arc<Self>) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    tracing::warn!(peer = %addr, "workstation connection error: {}", e);
                }
            });
        }
    }

    pub fn is_open(&self, id: &ConnectionId) -> bool {
        self.open.contains_key(id)
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let ws_stream = accept_async(stream).await?;
        let (write, mut read) = ws_stream.split();

        let id = loop {
            match read.next().await {
                Some(Ok(Message::Text(name))) if !name.trim().is_empty() => {
                    break ConnectionId::new(name.trim())
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        };

        self.open.insert(id.clone(), addr);
        let result = self.pump(&id, write, read).await;
        // a newer session under the same name owns the entry now
        self.open.remove_if(&id, |_, owner| *owner == addr);
        tracing::info!(connection = %id, "workstation disconnected");
        result
    }

    async fn pump(
        &self,
        id: &ConnectionId,
        mut write: SplitSink<WebSocketStream<TcpStream>, Message>,
        mut read: SplitStream<WebSocketStream<TcpStream>>,
    ) -> Result<()> {
        let (sink, mut signals) = ChannelSink::new(self.outbound_capacity);
        self.orchestrator.register_workstation(id.clone(), Arc::new(sink));
        let health = self.orchestrator.health();
        if let Err(err) = health.report(id, HealthEvent::Activity) {
            tracing::debug!(connection = %id, %err, "could not mark workstation alive");
        }
        tracing::info!(connection = %id, "workstation connected");

        loop {
            tokio::select! {
                signal = signals.recv() => {
                    let Some(signal) = signal else { break };
                    write.send(Message::Text(serde_json::to_string(&signal)?)).await?;
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        let _ = health.report(id, HealthEvent::Activity);
                    }
                    Some(Err(e)) => return Err(e.into()),
                },
            }
        }
        Ok(())
    }
}

/// Workstations dial in, so recovery succeeds only while the socket is up
#[async_trait]
impl Reconnector for WorkstationServer {
    async fn reconnect(&self, id: &ConnectionId, _role: ConnectionRole) -> Result<(), ReconnectError> {
        if self.is_open(id) {
            Ok(())
        } else {
            Err(ReconnectError::Failed(format!("{} is disconnected", id)))
        }
    }
}
