use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::core::types::ConnectionId;
use crate::health::monitor::HealthMonitor;
use crate::health::state::{ConnectionRole, HealthEvent, HealthState};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReconnectError {
    #[error("reconnection timed out after {0:?}")]
    Timeout(Duration),
    #[error("reconnection failed: {0}")]
    Failed(String),
}

/// Re-establishes the transport behind a connection
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Reconnector: Send + Sync {
    async fn reconnect(&self, id: &ConnectionId, role: ConnectionRole) -> Result<(), ReconnectError>;
}

/// Drives `Unhealthy` connections through reconnection attempts with
/// exponential backoff until they are healthy again or terminated.
pub struct ReconnectSupervisor {
    monitor: Arc<HealthMonitor>,
    reconnector: Arc<dyn Reconnector>,
    in_flight: DashMap<ConnectionId, ()>,
}

impl ReconnectSupervisor {
    pub fn new(monitor: Arc<HealthMonitor>, reconnector: Arc<dyn Reconnector>) -> Self {
        Self {
            monitor,
            reconnector,
            in_flight: DashMap::new(),
        }
    }

    /// Runs attempts for `id` until it leaves the `Unhealthy`/`Reconnecting`
    /// cycle. Returns the state it settled in.
    pub async fn recover(&self, id: &ConnectionId) -> HealthState {
        let config = self.monitor.config().clone();
        let role = match self.monitor.role(id) {
            Some(role) => role,
            None => return HealthState::Unregistered,
        };

        loop {
            let attempt = match self.monitor.connection(id) {
                Some(conn) if conn.state == HealthState::Unhealthy => conn.reconnect_attempts,
                Some(conn) => return conn.state,
                None => return HealthState::Unregistered,
            };

            tokio::time::sleep(config.backoff_for(attempt)).await;
            if let Err(err) = self.monitor.report(id, HealthEvent::ReconnectStarted) {
                tracing::error!(connection = %id, %err, "could not start reconnection");
                return self.monitor.current_state(id);
            }
            if self.monitor.current_state(id) != HealthState::Reconnecting {
                return self.monitor.current_state(id);
            }

            let timeout = config.reconnect_timeout();
            let result = match tokio::time::timeout(timeout, self.reconnector.reconnect(id, role)).await {
                Ok(result) => result,
                Err(_) => Err(ReconnectError::Timeout(timeout)),
            };

            let event = match result {
                Ok(()) => {
                    tracing::info!(connection = %id, attempt = attempt + 1, "reconnected");
                    HealthEvent::ReconnectSucceeded
                }
                Err(err) => {
                    tracing::warn!(connection = %id, attempt = attempt + 1, %err, "reconnection attempt failed");
                    metrics::counter!("gateway_reconnect_failures_total", 1);
                    HealthEvent::ReconnectFailed
                }
            };
            if let Err(err) = self.monitor.report(id, event) {
                tracing::error!(connection = %id, %err, "could not record reconnection outcome");
                return self.monitor.current_state(id);
            }
        }
    }

    /// Listens for connections turning `Unhealthy` and recovers each one in
    /// its own task. At most one recovery runs per connection.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let mut transitions = self.monitor.subscribe_transitions();
        tokio::spawn(async move {
            loop {
                let transition = match transitions.recv().await {
                    Ok(t) => t,
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "reconnect supervisor lagged behind transitions");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if transition.to != HealthState::Unhealthy {
                    continue;
                }
                let id = transition.connection_id;
                if self.in_flight.insert(id.clone(), ()).is_some() {
                    continue;
                }
                let supervisor = Arc::clone(&self);
                tokio::spawn(async move {
                    let settled = supervisor.recover(&id).await;
                    supervisor.in_flight.remove(&id);
                    tracing::debug!(connection = %id, state = %settled, "recovery finished");
                });
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn unhealthy_monitor(max_attempts: u32) -> (Arc<HealthMonitor>, ConnectionId) {
        let monitor = Arc::new(HealthMonitor::new(HealthConfig {
            reconnect_base_backoff_ms: 1,
            reconnect_max_backoff_ms: 4,
            reconnect_timeout_ms: 20,
            max_reconnect_attempts: max_attempts,
            ..Default::default()
        }));
        let id = ConnectionId::from("feed-a");
        monitor.register(id.clone(), ConnectionRole::FeedSource);
        monitor
            .report(&id, HealthEvent::Heartbeat { latency: Duration::ZERO })
            .unwrap();
        for _ in 0..3 {
            monitor.report(&id, HealthEvent::HeartbeatMissed).unwrap();
        }
        assert_eq!(monitor.current_state(&id), HealthState::Unhealthy);
        (monitor, id)
    }

    #[tokio::test]
    async fn test_recovers_after_failures() {
        let (monitor, id) = unhealthy_monitor(5);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let mut reconnector = MockReconnector::new();
        reconnector.expect_reconnect().returning(move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ReconnectError::Failed("refused".into()))
            } else {
                Ok(())
            }
        });

        let supervisor = ReconnectSupervisor::new(Arc::clone(&monitor), Arc::new(reconnector));
        assert_eq!(supervisor.recover(&id).await, HealthState::Healthy);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(monitor.connection(&id).unwrap().reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn test_terminates_after_bounded_retries() {
        let (monitor, id) = unhealthy_monitor(3);
        let mut reconnector = MockReconnector::new();
        reconnector
            .expect_reconnect()
            .times(3)
            .returning(|_, _| Err(ReconnectError::Failed("refused".into())));

        let supervisor = ReconnectSupervisor::new(Arc::clone(&monitor), Arc::new(reconnector));
        assert_eq!(supervisor.recover(&id).await, HealthState::Terminated);
        assert_eq!(monitor.current_state(&id), HealthState::Terminated);
    }

    struct HangingReconnector;

    #[async_trait]
    impl Reconnector for HangingReconnector {
        async fn reconnect(&self, _id: &ConnectionId, _role: ConnectionRole) -> Result<(), ReconnectError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_attempt_timeout_counts_as_failure() {
        let (monitor, id) = unhealthy_monitor(2);
        let supervisor = ReconnectSupervisor::new(Arc::clone(&monitor), Arc::new(HangingReconnector));
        assert_eq!(supervisor.recover(&id).await, HealthState::Terminated);
    }

    #[tokio::test]
    async fn test_spawned_supervisor_reacts_to_transitions() {
        let monitor = Arc::new(HealthMonitor::new(HealthConfig {
            reconnect_base_backoff_ms: 1,
            ..Default::default()
        }));
        let mut reconnector = MockReconnector::new();
        reconnector.expect_reconnect().returning(|_, _| Ok(()));
        let supervisor = Arc::new(ReconnectSupervisor::new(Arc::clone(&monitor), Arc::new(reconnector)));
        let handle = Arc::clone(&supervisor).spawn();

        let id = ConnectionId::from("ws-1");
        monitor.register(id.clone(), ConnectionRole::SignalConsumer);
        monitor.report(&id, HealthEvent::Activity).unwrap();
        for _ in 0..3 {
            monitor.report(&id, HealthEvent::HeartbeatMissed).unwrap();
        }

        let mut state = monitor.current_state(&id);
        for _ in 0..100 {
            if state == HealthState::Healthy {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            state = monitor.current_state(&id);
        }
        assert_eq!(state, HealthState::Healthy);
        handle.abort();
    }
}
