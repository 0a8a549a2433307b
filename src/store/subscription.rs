use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use crate::core::record::Record;
use crate::core::types::InstrumentKey;

/// Receives each new version of one instrument.
///
/// A slow subscriber that falls behind skips the versions it missed and
/// resumes with the oldest one still buffered.
pub struct RecordSubscription {
    key: InstrumentKey,
    receiver: broadcast::Receiver<Record>,
    skipped: u64,
}

impl RecordSubscription {
    pub(crate) fn new(key: InstrumentKey, receiver: broadcast::Receiver<Record>) -> Self {
        Self {
            key,
            receiver,
            skipped: 0,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Versions dropped because this subscriber lagged
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Waits for the next version. Returns `None` once the store is gone.
    pub async fn recv(&mut self) -> Option<Record> {
        loop {
            match self.receiver.recv().await {
                Ok(record) => return Some(record),
                Err(RecvError::Lagged(n)) => {
                    tracing::debug!(key = %self.key, skipped = n, "subscriber lagged");
                    self.skipped += n;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Option<Record> {
        loop {
            match self.receiver.try_recv() {
                Ok(record) => return Some(record),
                Err(TryRecvError::Lagged(n)) => self.skipped += n,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::StoreConfig;
    use crate::core::record::RecordDelta;
    use crate::store::MarketDataStore;

    #[tokio::test]
    async fn test_subscriber_sees_versions_in_order() {
        let store = MarketDataStore::default();
        let mut sub = store.subscribe("005930");

        store.upsert("005930", RecordDelta::price("krx", 70_000.0)).unwrap();
        store.upsert("005930", RecordDelta::price("krx", 70_100.0)).unwrap();

        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(second.last_price, 70_100.0);
        assert_eq!(sub.key(), "005930");
    }

    #[test]
    fn test_lagging_subscriber_skips_to_buffered() {
        let store = MarketDataStore::new(StoreConfig {
            subscription_capacity: 2,
            ..Default::default()
        });
        let mut sub = store.subscribe("005930");
        for i in 0..5 {
            store
                .upsert("005930", RecordDelta::price("krx", 70_000.0 + i as f64))
                .unwrap();
        }

        let record = sub.try_recv().unwrap();
        assert_eq!(record.version, 4);
        assert_eq!(sub.skipped(), 3);
        assert_eq!(sub.try_recv().unwrap().version, 5);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_other_keys_do_not_notify() {
        let store = MarketDataStore::default();
        let mut sub = store.subscribe("005930");
        store.upsert("000660", RecordDelta::price("krx", 120_000.0)).unwrap();
        assert!(sub.try_recv().is_none());
    }
}
