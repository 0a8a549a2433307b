use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::record::Record;
use crate::health::{ConnectionHealth, HealthMonitor};
use crate::store::{MarketDataStore, RecordSubscription, Snapshot, StoreError};

/// Aggregate over every active record that carries a holding
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PortfolioSummary {
    pub positions: usize,
    pub total_cost: f64,
    pub total_value: f64,
    pub total_pnl: f64,
    /// `None` while nothing has been bought
    pub total_return_pct: Option<f64>,
}

impl PortfolioSummary {
    fn add(&mut self, record: &Record) {
        if let Some(holding) = &record.holding {
            self.positions += 1;
            self.total_cost += holding.cost();
            // unpriced positions count at zero until the first tick
            if record.has_price() {
                self.total_value += holding.value_at(record.last_price);
            }
        }
    }

    fn finish(mut self) -> Self {
        self.total_pnl = self.total_value - self.total_cost;
        self.total_return_pct = if self.total_cost > 0.0 {
            Some(self.total_pnl / self.total_cost * 100.0)
        } else {
            None
        };
        self
    }
}

/// Read-only facade handed to UIs, the archiver and the orchestrator
#[derive(Clone)]
pub struct ReadApi {
    store: Arc<MarketDataStore>,
    health: Arc<HealthMonitor>,
}

impl ReadApi {
    pub fn new(store: Arc<MarketDataStore>, health: Arc<HealthMonitor>) -> Self {
        Self { store, health }
    }

    pub fn get(&self, key: &str) -> Result<Record, StoreError> {
        self.store.get(key)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.store.snapshot()
    }

    pub fn subscribe(&self, key: &str) -> RecordSubscription {
        self.store.subscribe(key)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn portfolio_summary(&self) -> PortfolioSummary {
        self.snapshot()
            .filter(Record::is_active)
            .fold(PortfolioSummary::default(), |mut summary, record| {
                summary.add(&record);
                summary
            })
            .finish()
    }

    pub fn health_report(&self) -> Vec<ConnectionHealth> {
        self.health.health_report()
    }
}
