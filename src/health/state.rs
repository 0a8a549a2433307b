use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::types::{ConnectionId, Timestamp};

/// Health of one tracked connection
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unregistered = 0,
    Connecting = 1,
    Healthy = 2,
    Degraded = 3,
    Unhealthy = 4,
    Reconnecting = 5,
    Terminated = 6,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Unregistered => "unregistered",
            HealthState::Connecting => "connecting",
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unhealthy => "unhealthy",
            HealthState::Reconnecting => "reconnecting",
            HealthState::Terminated => "terminated",
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => HealthState::Connecting,
            2 => HealthState::Healthy,
            3 => HealthState::Degraded,
            4 => HealthState::Unhealthy,
            5 => HealthState::Reconnecting,
            6 => HealthState::Terminated,
            _ => HealthState::Unregistered,
        }
    }

    /// The only edges the monitor will take
    pub fn can_transition_to(self, next: HealthState) -> bool {
        use HealthState::*;
        matches!(
            (self, next),
            (Unregistered, Connecting)
                | (Connecting, Healthy)
                | (Healthy, Degraded)
                | (Degraded, Healthy)
                | (Degraded, Unhealthy)
                | (Unhealthy, Reconnecting)
                | (Reconnecting, Healthy)
                | (Reconnecting, Unhealthy)
                | (Reconnecting, Terminated)
        )
    }

    /// Whether the orchestrator may deliver to a connection in this state
    pub fn is_deliverable(self) -> bool {
        matches!(self, HealthState::Healthy | HealthState::Degraded)
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionRole {
    FeedSource,
    SignalConsumer,
}

/// Input to [`HealthMonitor::report`](crate::health::HealthMonitor::report)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthEvent {
    /// Heartbeat or data message, with the observed latency
    Heartbeat { latency: Duration },
    /// Proof of life without a latency measurement (e.g. a delivery ack)
    Activity,
    HeartbeatMissed,
    Malformed,
    ReconnectStarted,
    ReconnectSucceeded,
    ReconnectFailed,
}

/// Published for every state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthTransition {
    pub connection_id: ConnectionId,
    pub role: ConnectionRole,
    pub from: HealthState,
    pub to: HealthState,
    pub cause: Option<HealthEvent>,
    pub at: Timestamp,
}

/// Health boundary record handed to external monitoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionHealth {
    pub connection_id: ConnectionId,
    pub role: ConnectionRole,
    pub state: HealthState,
    pub last_seen: Option<Timestamp>,
    pub latency: Option<Duration>,
    pub missed_heartbeats: u32,
    pub reconnect_attempts: u32,
    pub malformed_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use HealthState::*;

    const ALL: [HealthState; 7] = [
        Unregistered,
        Connecting,
        Healthy,
        Degraded,
        Unhealthy,
        Reconnecting,
        Terminated,
    ];

    #[test]
    fn test_u8_round_trip() {
        for state in ALL {
            assert_eq!(HealthState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_terminated_is_absorbing() {
        for next in ALL {
            assert!(!Terminated.can_transition_to(next));
        }
    }

    #[test]
    fn test_no_shortcut_to_unhealthy_or_terminated() {
        assert!(!Healthy.can_transition_to(Unhealthy));
        assert!(!Degraded.can_transition_to(Terminated));
        assert!(!Unhealthy.can_transition_to(Healthy));
        assert!(!Unhealthy.can_transition_to(Terminated));
        assert!(!Connecting.can_transition_to(Degraded));
    }

    #[test]
    fn test_only_healthy_and_degraded_are_deliverable() {
        let deliverable: Vec<_> = ALL.into_iter().filter(|s| s.is_deliverable()).collect();
        assert_eq!(deliverable, vec![Healthy, Degraded]);
    }
}
