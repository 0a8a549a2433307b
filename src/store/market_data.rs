use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::{ConflictPolicy, StoreConfig};
use crate::core::record::{Holding, Record, RecordDelta};
use crate::core::types::*;
use crate::store::subscription::RecordSubscription;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Key has never been written. Callers treat this as "no data yet".
    #[error("no data for instrument {0}")]
    NotFound(InstrumentKey),
    #[error("stale update for {key}: source timestamp {incoming} is older than {current}")]
    Stale {
        key: InstrumentKey,
        incoming: Timestamp,
        current: Timestamp,
        current_version: Version,
    },
    #[error("invalid update for {key}: {reason}")]
    InvalidDelta { key: InstrumentKey, reason: String },
}

/// Per-key storage cell. Slots are never removed, so an `Arc<RecordSlot>`
/// handed out once stays valid for the life of the store.
pub(crate) struct RecordSlot {
    record: RwLock<Option<Record>>,
    updates: OnceLock<broadcast::Sender<Record>>,
}

impl RecordSlot {
    fn new() -> Self {
        Self {
            record: RwLock::new(None),
            updates: OnceLock::new(),
        }
    }

    #[inline]
    fn read(&self) -> Option<Record> {
        self.record.read().clone()
    }

    // Called with the write lock held so notifications leave in version order.
    #[inline]
    fn notify(&self, record: &Record) {
        if let Some(tx) = self.updates.get() {
            if tx.receiver_count() > 0 {
                let _ = tx.send(record.clone());
            }
        }
    }
}

/// Atomic counters for store activity
#[derive(Debug, Default)]
pub struct StoreStats {
    pub upserts: AtomicU64,
    pub stale_rejected: AtomicU64,
    pub invalid_rejected: AtomicU64,
    pub reads: AtomicU64,
    pub misses: AtomicU64,
}

/// Point-in-time copy of [`StoreStats`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoreStatsSnapshot {
    pub upserts: u64,
    pub stale_rejected: u64,
    pub invalid_rejected: u64,
    pub reads: u64,
    pub misses: u64,
}

impl StoreStats {
    pub fn snapshot(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            upserts: self.upserts.load(Ordering::Relaxed),
            stale_rejected: self.stale_rejected.load(Ordering::Relaxed),
            invalid_rejected: self.invalid_rejected.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Concurrent key → [`Record`] store.
///
/// The shard lock of the underlying map is only held long enough to find or
/// create a key's slot. Reads and writes of the record itself go through the
/// slot's own lock, so traffic on one instrument never waits on another.
pub struct MarketDataStore {
    slots: DashMap<InstrumentKey, Arc<RecordSlot>>,
    populated: AtomicUsize,
    config: StoreConfig,
    stats: StoreStats,
}

impl MarketDataStore {
    pub fn new(config: StoreConfig) -> Self {
        let shard_amount = config.shard_amount.max(2).next_power_of_two();
        Self {
            slots: DashMap::with_capacity_and_shard_amount(config.initial_capacity, shard_amount),
            populated: AtomicUsize::new(0),
            config,
            stats: StoreStats::default(),
        }
    }

    /// Applies `delta` to `key`, creating the record on first write.
    /// Returns the record's new version.
    pub fn upsert(&self, key: &str, delta: RecordDelta) -> Result<Version, StoreError> {
        if let Err(reason) = validate_delta(key, &delta) {
            self.stats.invalid_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(StoreError::InvalidDelta {
                key: key.to_string(),
                reason,
            });
        }

        let slot = self.slot_for(key);
        let mut guard = slot.record.write();
        let version = match guard.as_mut() {
            Some(record) => {
                if self.config.conflict_policy == ConflictPolicy::RejectOlderSource
                    && delta.source_timestamp < record.source_timestamp
                {
                    self.stats.stale_rejected.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("gateway_store_stale_total", 1);
                    return Err(StoreError::Stale {
                        key: key.to_string(),
                        incoming: delta.source_timestamp,
                        current: record.source_timestamp,
                        current_version: record.version,
                    });
                }
                record.apply(delta);
                slot.notify(record);
                record.version
            }
            None => {
                let record = Record::from_delta(key.to_string(), delta);
                slot.notify(&record);
                let version = record.version;
                *guard = Some(record);
                self.populated.fetch_add(1, Ordering::Relaxed);
                version
            }
        };
        drop(guard);

        self.stats.upserts.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("gateway_store_upserts_total", 1);
        Ok(version)
    }

    /// Applies each update independently; a failure on one key does not
    /// affect the others and there is no atomicity across keys.
    pub fn upsert_batch<I>(&self, updates: I) -> Vec<(InstrumentKey, Result<Version, StoreError>)>
    where
        I: IntoIterator<Item = (InstrumentKey, RecordDelta)>,
    {
        updates
            .into_iter()
            .map(|(key, delta)| {
                let result = self.upsert(&key, delta);
                (key, result)
            })
            .collect()
    }

    /// Returns the latest fully-written record for `key`
    pub fn get(&self, key: &str) -> Result<Record, StoreError> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        let slot = self.slots.get(key).map(|entry| Arc::clone(entry.value()));
        match slot.and_then(|slot| slot.read()) {
            Some(record) => Ok(record),
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Err(StoreError::NotFound(key.to_string()))
            }
        }
    }

    /// Lazily yields every record. Each record is read when the iterator
    /// reaches it, so the result is consistent per key but not a frozen
    /// global view.
    pub fn snapshot(&self) -> Snapshot {
        let slots: Vec<Arc<RecordSlot>> = self
            .slots
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        Snapshot {
            slots: slots.into_iter(),
        }
    }

    /// Attaches or replaces the position held in `key`
    pub fn set_holding(&self, key: &str, holding: Holding) -> Result<Version, StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidDelta {
                key: key.to_string(),
                reason: "empty instrument key".into(),
            });
        }
        if !holding.buy_price.is_finite() || holding.buy_price < 0.0 {
            return Err(StoreError::InvalidDelta {
                key: key.to_string(),
                reason: format!("invalid buy price {}", holding.buy_price),
            });
        }

        let slot = self.slot_for(key);
        let mut guard = slot.record.write();
        let version = match guard.as_mut() {
            Some(record) => {
                record.set_holding(holding);
                slot.notify(record);
                record.version
            }
            None => {
                let record = Record::from_holding(key.to_string(), holding);
                slot.notify(&record);
                let version = record.version;
                *guard = Some(record);
                self.populated.fetch_add(1, Ordering::Relaxed);
                version
            }
        };
        Ok(version)
    }

    /// Marks an instrument inactive. The key stays in the store.
    pub fn deactivate(&self, key: &str) -> Result<Version, StoreError> {
        let slot = self
            .slots
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let mut guard = slot.record.write();
        let record = guard
            .as_mut()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        record.deactivate();
        slot.notify(record);
        tracing::info!(key, version = record.version, "instrument deactivated");
        Ok(record.version)
    }

    /// Push notifications for every new version of `key`. Subscribing to a
    /// key that has no data yet is allowed; the first write is delivered.
    ///
    /// Slots are never removed, so every distinct key subscribed to stays
    /// tracked for the life of the store (see [`tracked_keys`](Self::tracked_keys)),
    /// even if it never receives data. Callers subscribing on behalf of
    /// untrusted input should check the key against a known universe first.
    pub fn subscribe(&self, key: &str) -> RecordSubscription {
        let slot = self.slot_for(key);
        let capacity = self.config.subscription_capacity.max(1);
        let receiver = slot
            .updates
            .get_or_init(|| broadcast::channel(capacity).0)
            .subscribe();
        RecordSubscription::new(key.to_string(), receiver)
    }

    /// Number of keys holding data
    pub fn len(&self) -> usize {
        self.populated.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of allocated slots, including subscribed keys with no data yet
    pub fn tracked_keys(&self) -> usize {
        self.slots.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_ok()
    }

    pub fn stats(&self) -> StoreStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn slot_for(&self, key: &str) -> Arc<RecordSlot> {
        if let Some(entry) = self.slots.get(key) {
            return Arc::clone(entry.value());
        }
        let entry = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RecordSlot::new()));
        Arc::clone(entry.value())
    }
}

impl Default for MarketDataStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

/// Lazy iterator returned by [`MarketDataStore::snapshot`]
pub struct Snapshot {
    slots: std::vec::IntoIter<Arc<RecordSlot>>,
}

impl Iterator for Snapshot {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        for slot in self.slots.by_ref() {
            if let Some(record) = slot.read() {
                return Some(record);
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.slots.len()))
    }
}

fn validate_delta(key: &str, delta: &RecordDelta) -> Result<(), String> {
    if key.is_empty() {
        return Err("empty instrument key".into());
    }
    for (name, value) in [("price", delta.price), ("bid", delta.bid), ("ask", delta.ask)] {
        if let Some(v) = value {
            if !v.is_finite() || v < 0.0 {
                return Err(format!("{} must be a finite non-negative number, got {}", name, v));
            }
        }
    }
    if let Some(rate) = delta.change_rate {
        if !rate.is_finite() {
            return Err(format!("change_rate must be finite, got {}", rate));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_upsert_and_get() {
        let store = MarketDataStore::default();

        assert_eq!(store.upsert("005930", RecordDelta::price("krx", 70_000.0)), Ok(1));
        assert_eq!(store.upsert("005930", RecordDelta::price("krx", 70_100.0)), Ok(2));

        let record = store.get("005930").unwrap();
        assert_eq!(record.last_price, 70_100.0);
        assert_eq!(record.version, 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_unknown_key_is_not_found() {
        let store = MarketDataStore::default();
        assert_eq!(
            store.get("999999"),
            Err(StoreError::NotFound("999999".to_string()))
        );
        assert_eq!(store.stats().misses, 1);
    }

    #[test]
    fn test_replayed_delta_bumps_version_only() {
        let store = MarketDataStore::default();
        let delta = RecordDelta::quote("krx", 70_000.0, 69_900.0, 70_100.0)
            .with_source_timestamp(Timestamp::new(42));

        store.upsert("005930", RecordDelta::price("krx", 69_300.0)).unwrap();
        store.upsert("005930", delta.clone()).unwrap();
        let first = store.get("005930").unwrap();
        assert!(first.derived.return_pct.is_some());
        store.upsert("005930", delta).unwrap();
        let second = store.get("005930").unwrap();

        assert_eq!(second.version, first.version + 1);
        assert_eq!(second.last_price, first.last_price);
        assert_eq!(second.bid, first.bid);
        assert_eq!(second.ask, first.ask);
        assert_eq!(second.source, first.source);
        assert_eq!(second.derived, first.derived);
    }

    #[test]
    fn test_reject_older_source_policy() {
        let store = MarketDataStore::new(StoreConfig {
            conflict_policy: ConflictPolicy::RejectOlderSource,
            ..Default::default()
        });
        store
            .upsert("005930", RecordDelta::price("a", 70_000.0).with_source_timestamp(Timestamp::new(200)))
            .unwrap();

        let err = store
            .upsert("005930", RecordDelta::price("b", 69_000.0).with_source_timestamp(Timestamp::new(100)))
            .unwrap_err();
        assert!(matches!(err, StoreError::Stale { current_version: 1, .. }));

        let record = store.get("005930").unwrap();
        assert_eq!(record.last_price, 70_000.0);
        assert_eq!(record.version, 1);
        assert_eq!(store.stats().stale_rejected, 1);
    }

    #[test]
    fn test_last_write_wins_accepts_older_source() {
        let store = MarketDataStore::default();
        store
            .upsert("005930", RecordDelta::price("a", 70_000.0).with_source_timestamp(Timestamp::new(200)))
            .unwrap();
        let version = store
            .upsert("005930", RecordDelta::price("b", 69_000.0).with_source_timestamp(Timestamp::new(100)))
            .unwrap();
        assert_eq!(version, 2);
        assert_eq!(store.get("005930").unwrap().source, "b");
    }

    #[test]
    fn test_invalid_delta_never_reaches_store() {
        let store = MarketDataStore::default();
        assert!(matches!(
            store.upsert("005930", RecordDelta::price("krx", f64::NAN)),
            Err(StoreError::InvalidDelta { .. })
        ));
        assert!(matches!(
            store.upsert("", RecordDelta::price("krx", 1.0)),
            Err(StoreError::InvalidDelta { .. })
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_deactivate_keeps_key() {
        let store = MarketDataStore::default();
        store.upsert("000660", RecordDelta::price("krx", 120_000.0)).unwrap();
        assert_eq!(store.deactivate("000660"), Ok(2));

        let record = store.get("000660").unwrap();
        assert!(!record.is_active());
        assert_eq!(store.len(), 1);
        assert!(matches!(store.deactivate("123456"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_batch_is_per_key() {
        let store = MarketDataStore::default();
        let results = store.upsert_batch(vec![
            ("005930".to_string(), RecordDelta::price("krx", 75_000.0)),
            ("000660".to_string(), RecordDelta::price("krx", -1.0)),
            ("035420".to_string(), RecordDelta::price("krx", 200_000.0)),
        ]);

        assert_eq!(results[0].1, Ok(1));
        assert!(results[1].1.is_err());
        assert_eq!(results[2].1, Ok(1));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_snapshot_skips_subscribed_but_empty_keys() {
        let store = MarketDataStore::default();
        let _sub = store.subscribe("not-yet");
        store.upsert("005930", RecordDelta::price("krx", 70_000.0)).unwrap();

        let keys: Vec<_> = store.snapshot().map(|r| r.key).collect();
        assert_eq!(keys, vec!["005930".to_string()]);
        assert!(!store.contains("not-yet"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.tracked_keys(), 2);

        // resubscribing reuses the slot
        let _again = store.subscribe("not-yet");
        assert_eq!(store.tracked_keys(), 2);
    }

    #[test]
    fn test_concurrent_upserts_same_key() {
        let store = Arc::new(MarketDataStore::default());
        let threads = 8;
        let per_thread = 500;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let mut last_seen = 0;
                    for i in 0..per_thread {
                        let version = store
                            .upsert("005930", RecordDelta::price(format!("feed-{}", t), 70_000.0 + i as f64))
                            .unwrap();
                        assert!(version > last_seen);
                        last_seen = version;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let record = store.get("005930").unwrap();
        assert_eq!(record.version, (threads * per_thread) as u64);
    }
}
