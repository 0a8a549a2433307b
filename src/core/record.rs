use serde::{Deserialize, Serialize};

use crate::core::types::*;

/// Lifecycle status of an instrument. Records are deactivated, never deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentStatus {
    #[default]
    Active,
    Deactivated,
}

/// Position held in an instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    /// Display name, e.g. "Samsung Electronics"
    pub name: String,
    pub quantity: u64,
    /// Average purchase price
    pub buy_price: f64,
}

impl Holding {
    pub fn new(name: impl Into<String>, quantity: u64, buy_price: f64) -> Self {
        Self {
            name: name.into(),
            quantity,
            buy_price,
        }
    }

    #[inline]
    pub fn cost(&self) -> f64 {
        self.buy_price * self.quantity as f64
    }

    #[inline]
    pub fn value_at(&self, price: f64) -> f64 {
        price * self.quantity as f64
    }
}

/// Fields recomputed on every write
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DerivedFields {
    pub spread: Option<f64>,
    pub mid: Option<f64>,
    /// Percent return relative to the previous last price
    pub return_pct: Option<f64>,
    /// Percent return relative to the holding's buy price
    pub profit_rate: Option<f64>,
    pub unrealized_pnl: Option<f64>,
}

/// Partial update applied by the store's `upsert`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDelta {
    pub price: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub change_rate: Option<f64>,
    pub source: SourceId,
    /// Timestamp reported by the source
    pub source_timestamp: Timestamp,
}

impl RecordDelta {
    /// Delta carrying only a last price
    pub fn price(source: impl Into<SourceId>, price: f64) -> Self {
        Self {
            price: Some(price),
            bid: None,
            ask: None,
            change_rate: None,
            source: source.into(),
            source_timestamp: Timestamp::now(),
        }
    }

    /// Delta carrying a full quote
    pub fn quote(source: impl Into<SourceId>, price: f64, bid: f64, ask: f64) -> Self {
        Self {
            price: Some(price),
            bid: Some(bid),
            ask: Some(ask),
            change_rate: None,
            source: source.into(),
            source_timestamp: Timestamp::now(),
        }
    }

    pub fn with_change_rate(mut self, change_rate: f64) -> Self {
        self.change_rate = Some(change_rate);
        self
    }

    pub fn with_source_timestamp(mut self, ts: Timestamp) -> Self {
        self.source_timestamp = ts;
        self
    }
}

/// Current state of one tradable instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: InstrumentKey,
    pub last_price: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    /// Percent change as reported by the feed
    pub change_rate: Option<f64>,
    pub derived: DerivedFields,
    pub holding: Option<Holding>,
    /// Feed that produced the last write
    pub source: SourceId,
    pub source_timestamp: Timestamp,
    /// Wall clock at the last write
    pub updated_at: Timestamp,
    /// Monotonic clock at the last write
    pub updated_mono: u64,
    pub version: Version,
    pub status: InstrumentStatus,
}

impl Record {
    /// Creates the first version of a record from a delta
    pub(crate) fn from_delta(key: InstrumentKey, delta: RecordDelta) -> Self {
        let mut record = Self::empty(key, delta.source.clone());
        record.apply(delta);
        record
    }

    /// Creates the first version of a record carrying only a holding.
    /// The record stays unpriced until a feed delivers a price.
    pub(crate) fn from_holding(key: InstrumentKey, holding: Holding) -> Self {
        let mut record = Self::empty(key, SourceId::new());
        record.set_holding(holding);
        record
    }

    fn empty(key: InstrumentKey, source: SourceId) -> Self {
        Self {
            key,
            last_price: 0.0,
            bid: None,
            ask: None,
            change_rate: None,
            derived: DerivedFields::default(),
            holding: None,
            source,
            source_timestamp: Timestamp::default(),
            updated_at: Timestamp::default(),
            updated_mono: 0,
            version: 0,
            status: InstrumentStatus::Active,
        }
    }

    /// Applies a delta and bumps the version.
    ///
    /// Must only be called with the slot's write lock held.
    pub(crate) fn apply(&mut self, delta: RecordDelta) {
        let mut previous_price = None;
        if let Some(price) = delta.price {
            if price != self.last_price {
                previous_price = Some(self.last_price);
            }
            self.last_price = price;
        }
        if delta.bid.is_some() {
            self.bid = delta.bid;
        }
        if delta.ask.is_some() {
            self.ask = delta.ask;
        }
        if delta.change_rate.is_some() {
            self.change_rate = delta.change_rate;
        }
        self.source = delta.source;
        self.source_timestamp = delta.source_timestamp;
        self.recompute(previous_price);
        self.touch();
    }

    pub(crate) fn set_holding(&mut self, holding: Holding) {
        self.holding = Some(holding);
        self.recompute(None);
        self.touch();
    }

    pub(crate) fn deactivate(&mut self) {
        self.status = InstrumentStatus::Deactivated;
        self.touch();
    }

    fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Timestamp::now();
        self.updated_mono = monotonic_nanos();
    }

    /// `previous_price` is set only when this write moved the last price
    fn recompute(&mut self, previous_price: Option<f64>) {
        let (spread, mid) = match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => (Some(ask - bid), Some((ask + bid) / 2.0)),
            _ => (None, None),
        };
        let return_pct = match previous_price {
            Some(previous) if previous > 0.0 && self.has_price() => {
                Some((self.last_price / previous - 1.0) * 100.0)
            }
            _ => self.derived.return_pct,
        };
        let (profit_rate, unrealized_pnl) = match &self.holding {
            Some(h) if h.buy_price > 0.0 && self.has_price() => (
                Some((self.last_price / h.buy_price - 1.0) * 100.0),
                Some((self.last_price - h.buy_price) * h.quantity as f64),
            ),
            _ => (None, None),
        };
        self.derived = DerivedFields {
            spread,
            mid,
            return_pct,
            profit_rate,
            unrealized_pnl,
        };
    }

    /// Whether a feed has delivered a price yet
    #[inline]
    pub fn has_price(&self) -> bool {
        self.last_price > 0.0
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.status == InstrumentStatus::Active
    }
}
