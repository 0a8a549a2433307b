use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::record::RecordDelta;
use crate::core::types::*;
use crate::store::StoreError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IngestError {
    /// Payload could not be decoded or failed validation; it was dropped
    #[error("malformed feed message: {0}")]
    Malformed(String),
    /// Payload was valid but the store refused it
    #[error("store rejected update: {0}")]
    Rejected(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Quote,
    Heartbeat,
}

/// Decoded message at the feed ingestion boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedMessage {
    #[serde(default)]
    pub key: InstrumentKey,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub bid: f64,
    #[serde(default)]
    pub ask: f64,
    pub source_id: SourceId,
    /// Source timestamp, nanoseconds since the Unix epoch
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_rate: Option<f64>,
    #[serde(default)]
    pub message_type: MessageType,
}

impl FeedMessage {
    pub fn quote(
        key: impl Into<InstrumentKey>,
        price: f64,
        bid: f64,
        ask: f64,
        source_id: impl Into<SourceId>,
    ) -> Self {
        Self {
            key: key.into(),
            price,
            bid,
            ask,
            source_id: source_id.into(),
            timestamp: Timestamp::now(),
            change_rate: None,
            message_type: MessageType::Quote,
        }
    }

    pub fn heartbeat(source_id: impl Into<SourceId>) -> Self {
        Self {
            key: InstrumentKey::new(),
            price: 0.0,
            bid: 0.0,
            ask: 0.0,
            source_id: source_id.into(),
            timestamp: Timestamp::now(),
            change_rate: None,
            message_type: MessageType::Heartbeat,
        }
    }

    /// Decodes and validates a raw payload
    pub fn decode(raw: &[u8]) -> Result<Self, IngestError> {
        let msg: FeedMessage =
            serde_json::from_slice(raw).map_err(|e| IngestError::Malformed(e.to_string()))?;
        msg.validate()?;
        Ok(msg)
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.source_id.is_empty() {
            return Err(IngestError::Malformed("missing source_id".into()));
        }
        if self.message_type == MessageType::Heartbeat {
            return Ok(());
        }
        if self.key.is_empty() {
            return Err(IngestError::Malformed("missing instrument key".into()));
        }
        let finite = self.price.is_finite() && self.bid.is_finite() && self.ask.is_finite();
        if !finite || self.price <= 0.0 || self.bid <= 0.0 || self.ask <= 0.0 {
            return Err(IngestError::Malformed(format!(
                "non-positive price fields for {}: price={} bid={} ask={}",
                self.key, self.price, self.bid, self.ask
            )));
        }
        if self.ask < self.bid {
            return Err(IngestError::Malformed(format!(
                "crossed quote for {}: bid={} ask={}",
                self.key, self.bid, self.ask
            )));
        }
        if matches!(self.change_rate, Some(rate) if !rate.is_finite()) {
            return Err(IngestError::Malformed("non-finite change_rate".into()));
        }
        Ok(())
    }

    pub fn to_delta(&self) -> RecordDelta {
        RecordDelta {
            price: Some(self.price),
            bid: Some(self.bid),
            ask: Some(self.ask),
            change_rate: self.change_rate,
            source: self.source_id.clone(),
            source_timestamp: self.timestamp,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.message_type == MessageType::Heartbeat
    }
}

#[derive(Debug, Default)]
pub struct FeedStats {
    pub messages_received: AtomicU64,
    pub messages_processed: AtomicU64,
    pub heartbeats: AtomicU64,
    pub malformed_messages: AtomicU64,
    pub rejected_messages: AtomicU64,
    pub processing_time_ns: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FeedStatsSnapshot {
    pub messages_received: u64,
    pub messages_processed: u64,
    pub heartbeats: u64,
    pub malformed_messages: u64,
    pub rejected_messages: u64,
    pub processing_time_ns: u64,
}

impl FeedStats {
    pub fn snapshot(&self) -> FeedStatsSnapshot {
        FeedStatsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
            rejected_messages: self.rejected_messages.load(Ordering::Relaxed),
            processing_time_ns: self.processing_time_ns.load(Ordering::Relaxed),
        }
    }
}
