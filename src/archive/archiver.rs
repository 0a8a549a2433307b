use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::archive::sink::{ArchiveBatch, ArchiveError, ArchiveSink};
use crate::config::{ArchiveConfig, ArchiveMode};
use crate::core::types::*;
use crate::store::MarketDataStore;

#[derive(Debug, Default)]
pub struct ArchiveStats {
    pub batches_archived: AtomicU64,
    pub records_archived: AtomicU64,
    pub handoff_failures: AtomicU64,
    pub retries: AtomicU64,
    /// Pending batches folded into a newer one at the queue cap
    pub batches_superseded: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveStatsSnapshot {
    pub batches_archived: u64,
    pub records_archived: u64,
    pub handoff_failures: u64,
    pub retries: u64,
    pub batches_superseded: u64,
}

impl ArchiveStats {
    pub fn snapshot(&self) -> ArchiveStatsSnapshot {
        ArchiveStatsSnapshot {
            batches_archived: self.batches_archived.load(Ordering::Relaxed),
            records_archived: self.records_archived.load(Ordering::Relaxed),
            handoff_failures: self.handoff_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            batches_superseded: self.batches_superseded.load(Ordering::Relaxed),
        }
    }
}

/// Extracts store batches and hands them to an [`ArchiveSink`].
///
/// Extraction goes through [`MarketDataStore::snapshot`], so writers are
/// never blocked. Batches whose handoff fails are queued and retried, in
/// order, ahead of the next extraction. At most `max_pending` batches are
/// kept; beyond that the oldest is folded into the next one.
pub struct Archiver {
    store: Arc<MarketDataStore>,
    sink: Arc<dyn ArchiveSink>,
    config: ArchiveConfig,
    pending: SegQueue<ArchiveBatch>,
    // versions as of the last successful handoff, for diff mode
    archived_versions: Mutex<HashMap<InstrumentKey, Version>>,
    stats: ArchiveStats,
}

impl Archiver {
    pub fn new(store: Arc<MarketDataStore>, sink: Arc<dyn ArchiveSink>, config: ArchiveConfig) -> Self {
        Self {
            store,
            sink,
            config,
            pending: SegQueue::new(),
            archived_versions: Mutex::new(HashMap::new()),
            stats: ArchiveStats::default(),
        }
    }

    pub fn stats(&self) -> ArchiveStatsSnapshot {
        self.stats.snapshot()
    }

    /// Batches waiting for a retry
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Takes one batch and hands it off. Earlier failed batches are retried
    /// first; if one still fails the new batch is queued behind it.
    pub async fn run_once(&self) -> Result<ArchiveBatch, ArchiveError> {
        let retry_result = self.retry_pending().await;
        let batch = self.extract();

        if let Err(err) = retry_result {
            self.enqueue(batch);
            return Err(err);
        }

        match self.handoff(&batch).await {
            Ok(()) => Ok(batch),
            Err(err) => {
                self.enqueue(batch);
                Err(err)
            }
        }
    }

    /// Builds a batch without handing it off
    pub fn extract(&self) -> ArchiveBatch {
        let taken_at = Timestamp::now();
        let records = match self.config.mode {
            ArchiveMode::Full => self.store.snapshot().collect(),
            ArchiveMode::Diff => {
                let archived = self.archived_versions.lock().clone();
                self.store
                    .snapshot()
                    .filter(|record| archived.get(&record.key) != Some(&record.version))
                    .collect()
            }
        };
        ArchiveBatch {
            records,
            taken_at,
            mode: self.config.mode,
        }
    }

    /// Runs [`run_once`](Self::run_once) every `interval`
    pub fn spawn_schedule(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let archiver = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match archiver.run_once().await {
                    Ok(batch) => tracing::info!(
                        taken_at = %batch.taken_at,
                        records = batch.len(),
                        "archive batch handed off"
                    ),
                    Err(err) => tracing::error!(
                        %err,
                        pending = archiver.pending(),
                        "archive run failed, will retry"
                    ),
                }
            }
        })
    }

    async fn retry_pending(&self) -> Result<(), ArchiveError> {
        let mut queued = Vec::with_capacity(self.pending.len());
        while let Some(batch) = self.pending.pop() {
            queued.push(batch);
        }

        let mut queued = queued.into_iter();
        while let Some(batch) = queued.next() {
            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = self.handoff(&batch).await {
                self.pending.push(batch);
                for rest in queued {
                    self.pending.push(rest);
                }
                return Err(err);
            }
            tracing::info!(taken_at = %batch.taken_at, "archive batch retried successfully");
        }
        Ok(())
    }

    /// Queues a failed batch, folding the oldest ones together past the cap
    fn enqueue(&self, batch: ArchiveBatch) {
        self.pending.push(batch);
        let cap = self.config.max_pending.max(1);
        if self.pending.len() <= cap {
            return;
        }

        let mut queued = VecDeque::with_capacity(self.pending.len());
        while let Some(batch) = self.pending.pop() {
            queued.push_back(batch);
        }
        while queued.len() > cap {
            let Some(older) = queued.pop_front() else { break };
            if let Some(newer) = queued.front_mut() {
                let taken_at = older.taken_at;
                fold_into(newer, older);
                self.stats.batches_superseded.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("gateway_archive_superseded_total", 1);
                tracing::warn!(
                    %taken_at,
                    into = %newer.taken_at,
                    "archive retry queue full, folded oldest batch into the next"
                );
            }
        }
        for batch in queued {
            self.pending.push(batch);
        }
    }

    async fn handoff(&self, batch: &ArchiveBatch) -> Result<(), ArchiveError> {
        if let Err(err) = self.sink.persist(batch).await {
            self.stats.handoff_failures.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("gateway_archive_failures_total", 1);
            tracing::warn!(taken_at = %batch.taken_at, %err, "archive handoff failed");
            return Err(err);
        }

        {
            let mut archived = self.archived_versions.lock();
            for record in &batch.records {
                let current = archived.entry(record.key.clone()).or_insert(0);
                *current = (*current).max(record.version);
            }
        }
        self.stats.batches_archived.fetch_add(1, Ordering::Relaxed);
        self.stats
            .records_archived
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        metrics::counter!("gateway_archive_batches_total", 1);
        Ok(())
    }
}

/// Merges `older` into `newer`. A full batch already supersedes anything
/// older; diff batches keep the highest version seen per key.
fn fold_into(newer: &mut ArchiveBatch, older: ArchiveBatch) {
    if newer.mode == ArchiveMode::Full {
        return;
    }
    let mut index: HashMap<InstrumentKey, usize> = newer
        .records
        .iter()
        .enumerate()
        .map(|(i, record)| (record.key.clone(), i))
        .collect();
    for record in older.records {
        match index.get(&record.key) {
            Some(&i) => {
                if newer.records[i].version < record.version {
                    newer.records[i] = record;
                }
            }
            None => {
                index.insert(record.key.clone(), newer.records.len());
                newer.records.push(record);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::sink::{MemoryArchiveSink, MockArchiveSink};
    use crate::core::record::{Record, RecordDelta};
    use std::sync::atomic::{AtomicBool, AtomicU32};

    fn store_with(keys: &[&str]) -> Arc<MarketDataStore> {
        let store = Arc::new(MarketDataStore::default());
        for key in keys {
            store.upsert(key, RecordDelta::price("krx", 100.0)).unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_full_batch_contains_every_record() {
        let store = store_with(&["005930", "000660", "035420"]);
        let sink = Arc::new(MemoryArchiveSink::new());
        let archiver = Archiver::new(Arc::clone(&store), sink.clone(), ArchiveConfig::default());

        let batch = archiver.run_once().await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(sink.len(), 1);
        assert_eq!(archiver.stats().records_archived, 3);
    }

    #[tokio::test]
    async fn test_diff_mode_only_changed_records() {
        let store = store_with(&["005930", "000660"]);
        let sink = Arc::new(MemoryArchiveSink::new());
        let archiver = Archiver::new(
            Arc::clone(&store),
            sink.clone(),
            ArchiveConfig {
                mode: ArchiveMode::Diff,
                ..Default::default()
            },
        );

        assert_eq!(archiver.run_once().await.unwrap().len(), 2);
        store.upsert("000660", RecordDelta::price("krx", 101.0)).unwrap();
        let batch = archiver.run_once().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.records[0].key, "000660");
        assert_eq!(batch.records[0].version, 2);
    }

    #[tokio::test]
    async fn test_failed_handoff_is_retried_next_run() {
        let store = store_with(&["005930"]);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let mut sink = MockArchiveSink::new();
        sink.expect_persist().returning(move |batch| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ArchiveError::HandoffFailed {
                    taken_at: batch.taken_at,
                    reason: "disk full".into(),
                })
            } else {
                Ok(())
            }
        });

        let archiver = Archiver::new(store, Arc::new(sink), ArchiveConfig::default());
        assert!(matches!(
            archiver.run_once().await,
            Err(ArchiveError::HandoffFailed { .. })
        ));
        assert_eq!(archiver.pending(), 1);

        archiver.run_once().await.unwrap();
        assert_eq!(archiver.pending(), 0);
        // retried batch plus the fresh one
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(archiver.stats().batches_archived, 2);
        assert_eq!(archiver.stats().handoff_failures, 1);
    }

    #[tokio::test]
    async fn test_failed_retry_queues_new_batch() {
        let store = store_with(&["005930"]);
        let mut sink = MockArchiveSink::new();
        sink.expect_persist().returning(|batch| {
            Err(ArchiveError::HandoffFailed {
                taken_at: batch.taken_at,
                reason: "offline".into(),
            })
        });
        let archiver = Archiver::new(store, Arc::new(sink), ArchiveConfig::default());

        assert!(archiver.run_once().await.is_err());
        assert!(archiver.run_once().await.is_err());
        assert_eq!(archiver.pending(), 2);
    }

    /// Sink that fails while `down` is set and records what it accepted
    fn flaky_sink(down: Arc<AtomicBool>, accepted: Arc<Mutex<Vec<ArchiveBatch>>>) -> MockArchiveSink {
        let mut sink = MockArchiveSink::new();
        sink.expect_persist().returning(move |batch| {
            if down.load(Ordering::SeqCst) {
                return Err(ArchiveError::HandoffFailed {
                    taken_at: batch.taken_at,
                    reason: "offline".into(),
                });
            }
            accepted.lock().push(batch.clone());
            Ok(())
        });
        sink
    }

    #[tokio::test]
    async fn test_pending_queue_is_capped_in_full_mode() {
        let store = store_with(&["005930", "000660"]);
        let down = Arc::new(AtomicBool::new(true));
        let accepted = Arc::new(Mutex::new(Vec::new()));
        let archiver = Archiver::new(
            store,
            Arc::new(flaky_sink(Arc::clone(&down), Arc::clone(&accepted))),
            ArchiveConfig {
                max_pending: 2,
                ..Default::default()
            },
        );

        for _ in 0..5 {
            assert!(archiver.run_once().await.is_err());
            assert!(archiver.pending() <= 2);
        }
        assert_eq!(archiver.pending(), 2);
        assert_eq!(archiver.stats().batches_superseded, 3);

        down.store(false, Ordering::SeqCst);
        archiver.run_once().await.unwrap();
        assert_eq!(archiver.pending(), 0);
        let accepted = accepted.lock();
        assert_eq!(accepted.len(), 3);
        assert!(accepted.windows(2).all(|w| w[0].taken_at < w[1].taken_at));
        assert!(accepted.iter().all(|b| b.len() == 2));
    }

    #[tokio::test]
    async fn test_pending_diffs_merge_to_highest_version() {
        let store = store_with(&["005930", "000660"]);
        let down = Arc::new(AtomicBool::new(true));
        let accepted = Arc::new(Mutex::new(Vec::new()));
        let archiver = Archiver::new(
            Arc::clone(&store),
            Arc::new(flaky_sink(Arc::clone(&down), Arc::clone(&accepted))),
            ArchiveConfig {
                mode: ArchiveMode::Diff,
                max_pending: 1,
                ..Default::default()
            },
        );

        assert!(archiver.run_once().await.is_err());
        store.upsert("000660", RecordDelta::price("krx", 101.0)).unwrap();
        store.upsert("035420", RecordDelta::price("krx", 200.0)).unwrap();
        assert!(archiver.run_once().await.is_err());
        assert_eq!(archiver.pending(), 1);
        assert_eq!(archiver.stats().batches_superseded, 1);

        down.store(false, Ordering::SeqCst);
        archiver.run_once().await.unwrap();
        let accepted = accepted.lock();
        let merged = &accepted[0];
        let mut versions: Vec<_> = merged
            .records
            .iter()
            .map(|r| (r.key.as_str(), r.version))
            .collect();
        versions.sort();
        assert_eq!(versions, vec![("000660", 2), ("005930", 1), ("035420", 1)]);
        // nothing changed since the merged batch landed
        assert!(accepted[1].is_empty());
    }

    #[test]
    fn test_fold_keeps_newer_diff_records() {
        let record = |key: &str, version| {
            let mut record = Record::from_delta(key.to_string(), RecordDelta::price("krx", 1.0));
            record.version = version;
            record
        };
        let mut newer = ArchiveBatch {
            records: vec![record("a", 3)],
            taken_at: Timestamp::new(2),
            mode: ArchiveMode::Diff,
        };
        let older = ArchiveBatch {
            records: vec![record("a", 5), record("b", 1)],
            taken_at: Timestamp::new(1),
            mode: ArchiveMode::Diff,
        };
        fold_into(&mut newer, older);
        assert_eq!(newer.taken_at, Timestamp::new(2));
        assert_eq!(newer.records.len(), 2);
        assert_eq!(newer.records[0].version, 5);
        assert_eq!(newer.records[1].key, "b");
    }
}
