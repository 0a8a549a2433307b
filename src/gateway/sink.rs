use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::gateway::signal::{DeliveryError, Signal};

/// Transport to one trader workstation.
///
/// Receivers must tolerate redelivery of the same [`Signal::id`]; the
/// gateway never deduplicates.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkstationSink: Send + Sync {
    async fn deliver(&self, signal: &Signal) -> Result<(), DeliveryError>;
}

/// In-process workstation backed by a bounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<Signal>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Signal>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl WorkstationSink for ChannelSink {
    async fn deliver(&self, signal: &Signal) -> Result<(), DeliveryError> {
        self.sender
            .send(signal.clone())
            .await
            .map_err(|_| DeliveryError::Unreachable("workstation channel closed".into()))
    }
}
