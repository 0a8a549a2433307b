use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::types::{ConnectionId, Timestamp};
use crate::health::HealthState;

/// Unique signal identifier; receivers use it to detect redelivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalId(Uuid);

impl SignalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SignalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalScope {
    Broadcast,
    Targets(BTreeSet<ConnectionId>),
}

/// Outbound instruction. The payload is opaque to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub id: SignalId,
    pub payload: Vec<u8>,
    pub scope: SignalScope,
    pub created_at: Timestamp,
}

impl Signal {
    pub fn broadcast(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: SignalId::new(),
            payload: payload.into(),
            scope: SignalScope::Broadcast,
            created_at: Timestamp::now(),
        }
    }

    pub fn targeted<I, T>(payload: impl Into<Vec<u8>>, targets: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ConnectionId>,
    {
        Self {
            id: SignalId::new(),
            payload: payload.into(),
            scope: SignalScope::Targets(targets.into_iter().map(Into::into).collect()),
            created_at: Timestamp::now(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryError {
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
    #[error("workstation unreachable: {0}")]
    Unreachable(String),
    #[error("workstation rejected signal: {0}")]
    Rejected(String),
    #[error("delivery task aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Unhealthy,
    Terminated,
    /// Still connecting or reconnecting
    NotReady(HealthState),
    UnknownTarget,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Unhealthy => f.write_str("unhealthy"),
            SkipReason::Terminated => f.write_str("terminated"),
            SkipReason::NotReady(state) => write!(f, "not ready ({})", state),
            SkipReason::UnknownTarget => f.write_str("unknown target"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// `low_confidence` is set when the target was degraded at send time
    Delivered { low_confidence: bool },
    Failed(DeliveryError),
    Skipped(SkipReason),
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Delivered { .. } => "delivered",
            DeliveryStatus::Failed(_) => "failed",
            DeliveryStatus::Skipped(_) => "skipped",
        }
    }
}

/// Per-target result of a fan-out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub target_id: ConnectionId,
    pub status: DeliveryStatus,
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self.status, DeliveryStatus::Delivered { .. })
    }
}

/// Outcomes for every target of one signal, in target order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanOutReport {
    pub signal_id: SignalId,
    pub outcomes: Vec<DeliveryOutcome>,
}

impl FanOutReport {
    pub fn outcome(&self, target: &ConnectionId) -> Option<&DeliveryStatus> {
        self.outcomes
            .iter()
            .find(|o| &o.target_id == target)
            .map(|o| &o.status)
    }

    pub fn delivered(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_delivered()).count()
    }

    /// True when at least one target did not receive the signal
    pub fn is_partial(&self) -> bool {
        self.delivered() < self.outcomes.len()
    }
}
