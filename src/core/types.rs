use std::fmt;
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Wall-clock timestamp in nanoseconds since the Unix epoch
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a new timestamp from nanoseconds
    #[inline(always)]
    pub fn new(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Gets current wall-clock timestamp with nanosecond precision
    #[inline(always)]
    pub fn now() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Self(nanos)
    }

    /// Gets raw nanosecond value
    #[inline(always)]
    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is in the future
    pub fn saturating_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }

    /// RFC 3339 rendering for logs and display
    pub fn to_rfc3339(&self) -> String {
        let secs = (self.0 / 1_000_000_000) as i64;
        let nanos = (self.0 % 1_000_000_000) as u32;
        chrono::DateTime::<chrono::Utc>::from_timestamp(secs, nanos)
            .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true))
            .unwrap_or_else(|| self.0.to_string())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}

fn process_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Monotonic nanoseconds since the first clock read in this process.
///
/// Immune to wall-clock adjustments; only comparable within one process.
#[inline(always)]
pub fn monotonic_nanos() -> u64 {
    process_epoch().elapsed().as_nanos() as u64
}

/// Instrument identifier, e.g. `"005930"`
pub type InstrumentKey = String;

/// Feed identifier carried by feed messages
pub type SourceId = String;

/// Per-key version counter
pub type Version = u64;

/// Identifier of a tracked connection (upstream feed or downstream workstation)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_ordering() {
        let a = Timestamp::new(1_000);
        let b = Timestamp::new(3_500);
        assert!(a < b);
        assert_eq!(b.saturating_since(a), Duration::from_nanos(2_500));
        assert_eq!(a.saturating_since(b), Duration::ZERO);
    }

    #[test]
    fn test_monotonic_clock_never_goes_back() {
        let first = monotonic_nanos();
        let second = monotonic_nanos();
        assert!(second >= first);
    }

    #[test]
    fn test_rfc3339_rendering() {
        let ts = Timestamp::new(1_700_000_000_000_000_001);
        assert_eq!(ts.to_rfc3339(), "2023-11-14T22:13:20.000000001Z");
    }
}
