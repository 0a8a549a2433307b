use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::core::types::*;
use crate::feed::types::*;
use crate::health::{HealthEvent, HealthMonitor};
use crate::store::MarketDataStore;

/// What a single accepted message did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Applied { key: InstrumentKey, version: Version },
    Heartbeat,
}

/// Turns raw feed payloads into store updates and health observations.
///
/// Decoding and validation happen before the store is touched, so a bad
/// payload never holds a record lock and never changes a record.
pub struct FeedIngestor {
    store: Arc<MarketDataStore>,
    health: Arc<HealthMonitor>,
    stats: FeedStats,
}

impl FeedIngestor {
    pub fn new(store: Arc<MarketDataStore>, health: Arc<HealthMonitor>) -> Self {
        Self {
            store,
            health,
            stats: FeedStats::default(),
        }
    }

    pub fn store(&self) -> &Arc<MarketDataStore> {
        &self.store
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn stats(&self) -> FeedStatsSnapshot {
        self.stats.snapshot()
    }

    /// Processes one payload received on `connection`
    pub fn on_message(
        &self,
        connection: &ConnectionId,
        raw: &[u8],
    ) -> Result<IngestOutcome, IngestError> {
        let start = Instant::now();
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);

        let msg = match FeedMessage::decode(raw) {
            Ok(msg) => msg,
            Err(err) => {
                self.on_malformed(connection, &err);
                return Err(err);
            }
        };

        if msg.is_heartbeat() {
            self.stats.heartbeats.fetch_add(1, Ordering::Relaxed);
            let latency = Timestamp::now().saturating_since(msg.timestamp);
            self.observe(connection, HealthEvent::Heartbeat { latency });
            return Ok(IngestOutcome::Heartbeat);
        }

        let outcome = match self.store.upsert(&msg.key, msg.to_delta()) {
            Ok(version) => IngestOutcome::Applied {
                key: msg.key,
                version,
            },
            Err(err) => {
                self.stats.rejected_messages.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(connection = %connection, %err, "feed update rejected by store");
                return Err(IngestError::Rejected(err));
            }
        };
        self.observe(connection, HealthEvent::Activity);

        self.stats.messages_processed.fetch_add(1, Ordering::Relaxed);
        self.stats
            .processing_time_ns
            .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        Ok(outcome)
    }

    fn on_malformed(&self, connection: &ConnectionId, err: &IngestError) {
        self.stats.malformed_messages.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("gateway_feed_malformed_total", 1);
        tracing::warn!(connection = %connection, %err, "dropping malformed feed message");
        self.observe(connection, HealthEvent::Malformed);
    }

    fn observe(&self, connection: &ConnectionId, event: HealthEvent) {
        if let Err(err) = self.health.report(connection, event) {
            tracing::debug!(connection = %connection, %err, "health observation dropped");
        }
    }
}
