use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;

use crate::config::OrchestratorConfig;
use crate::core::types::{ConnectionId, Timestamp};
use crate::gateway::signal::*;
use crate::gateway::sink::WorkstationSink;
use crate::health::{ConnectionRole, HealthEvent, HealthMonitor, HealthState};

/// Delivery bookkeeping for one workstation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AckRecord {
    pub delivered: u64,
    pub failed: u64,
    pub skipped: u64,
    pub last_acked: Option<SignalId>,
    pub last_acked_at: Option<Timestamp>,
    pub last_failure: Option<String>,
}

/// Fans signals out to registered workstations.
///
/// Each eligible target is delivered by its own task with its own timeout,
/// so a slow or dead workstation never holds up the others and a call
/// always returns one outcome per target.
pub struct SignalOrchestrator {
    health: Arc<HealthMonitor>,
    workstations: DashMap<ConnectionId, Arc<dyn WorkstationSink>>,
    acks: DashMap<ConnectionId, AckRecord>,
    config: OrchestratorConfig,
}

enum Plan {
    Deliver {
        target: ConnectionId,
        low_confidence: bool,
        sink: Arc<dyn WorkstationSink>,
    },
    Skip(ConnectionId, SkipReason),
}

impl SignalOrchestrator {
    pub fn new(health: Arc<HealthMonitor>, config: OrchestratorConfig) -> Self {
        Self {
            health,
            workstations: DashMap::new(),
            acks: DashMap::new(),
            config,
        }
    }

    /// Adds a workstation and starts tracking its health as a signal consumer.
    ///
    /// Registering again replaces the sink. A workstation that had been
    /// terminated starts a fresh lifecycle, since it dialed in again.
    pub fn register_workstation(
        &self,
        id: impl Into<ConnectionId>,
        sink: Arc<dyn WorkstationSink>,
    ) -> HealthState {
        let id = id.into();
        self.workstations.insert(id.clone(), sink);
        self.acks.entry(id.clone()).or_default();
        self.health.open_session(id, ConnectionRole::SignalConsumer)
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Registered workstation ids, sorted
    pub fn workstations(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.workstations.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn ack_status(&self, id: &ConnectionId) -> Option<AckRecord> {
        self.acks.get(id).map(|r| r.value().clone())
    }

    /// Sends to every registered workstation
    pub async fn broadcast(&self, signal: Signal) -> FanOutReport {
        let targets = self.workstations();
        self.fan_out(signal, targets).await
    }

    /// Sends to an explicit set of workstations
    pub async fn send<I>(&self, signal: Signal, targets: I) -> FanOutReport
    where
        I: IntoIterator<Item = ConnectionId>,
    {
        let targets: BTreeSet<ConnectionId> = targets.into_iter().collect();
        self.fan_out(signal, targets.into_iter().collect()).await
    }

    /// Routes by the signal's own scope
    pub async fn dispatch(&self, signal: Signal) -> FanOutReport {
        let targets: Option<Vec<ConnectionId>> = match &signal.scope {
            SignalScope::Broadcast => None,
            SignalScope::Targets(targets) => Some(targets.iter().cloned().collect()),
        };
        match targets {
            Some(targets) => self.fan_out(signal, targets).await,
            None => self.broadcast(signal).await,
        }
    }

    async fn fan_out(&self, signal: Signal, targets: Vec<ConnectionId>) -> FanOutReport {
        let signal_id = signal.id;
        let signal = Arc::new(signal);
        let budget = self.config.delivery_timeout();

        let plans: Vec<Plan> = targets.into_iter().map(|t| self.plan(t)).collect();

        let deliveries = plans.iter().filter_map(|plan| match plan {
            Plan::Deliver { sink, .. } => {
                let sink = Arc::clone(sink);
                let signal = Arc::clone(&signal);
                Some(tokio::spawn(async move {
                    match tokio::time::timeout(budget, sink.deliver(&signal)).await {
                        Ok(result) => result,
                        Err(_) => Err(DeliveryError::Timeout(budget)),
                    }
                }))
            }
            Plan::Skip(..) => None,
        });
        let mut results = join_all(deliveries).await.into_iter();

        let mut outcomes = Vec::with_capacity(plans.len());
        for plan in plans {
            let (target_id, status) = match plan {
                Plan::Deliver {
                    target,
                    low_confidence,
                    ..
                } => {
                    let result = match results.next() {
                        Some(Ok(result)) => result,
                        Some(Err(join_err)) => Err(DeliveryError::Aborted(join_err.to_string())),
                        None => Err(DeliveryError::Aborted("missing delivery result".into())),
                    };
                    let status = match result {
                        Ok(()) => DeliveryStatus::Delivered { low_confidence },
                        Err(err) => DeliveryStatus::Failed(err),
                    };
                    (target, status)
                }
                Plan::Skip(target, reason) => (target, DeliveryStatus::Skipped(reason)),
            };
            self.record(&target_id, signal_id, &status);
            outcomes.push(DeliveryOutcome { target_id, status });
        }

        let report = FanOutReport { signal_id, outcomes };
        if report.is_partial() {
            tracing::warn!(
                signal = %signal_id,
                delivered = report.delivered(),
                targets = report.outcomes.len(),
                "partial signal delivery"
            );
        } else {
            tracing::debug!(signal = %signal_id, targets = report.outcomes.len(), "signal delivered");
        }
        report
    }

    fn plan(&self, target: ConnectionId) -> Plan {
        let sink = match self.workstations.get(&target) {
            Some(entry) => Arc::clone(entry.value()),
            None => return Plan::Skip(target, SkipReason::UnknownTarget),
        };
        match self.health.current_state(&target) {
            HealthState::Healthy => Plan::Deliver {
                target,
                low_confidence: false,
                sink,
            },
            HealthState::Degraded => Plan::Deliver {
                target,
                low_confidence: true,
                sink,
            },
            HealthState::Unhealthy => Plan::Skip(target, SkipReason::Unhealthy),
            HealthState::Terminated => Plan::Skip(target, SkipReason::Terminated),
            other => Plan::Skip(target, SkipReason::NotReady(other)),
        }
    }

    fn record(&self, target: &ConnectionId, signal_id: SignalId, status: &DeliveryStatus) {
        metrics::counter!("gateway_signal_outcomes_total", 1, "status" => status.as_str());

        if let Some(mut ack) = self.acks.get_mut(target) {
            match status {
                DeliveryStatus::Delivered { .. } => {
                    ack.delivered += 1;
                    ack.last_acked = Some(signal_id);
                    ack.last_acked_at = Some(Timestamp::now());
                }
                DeliveryStatus::Failed(err) => {
                    ack.failed += 1;
                    ack.last_failure = Some(err.to_string());
                }
                DeliveryStatus::Skipped(_) => ack.skipped += 1,
            }
        }

        match status {
            DeliveryStatus::Delivered { .. } => {
                if let Err(err) = self.health.report(target, HealthEvent::Activity) {
                    tracing::debug!(target = %target, %err, "could not record delivery ack");
                }
            }
            DeliveryStatus::Failed(err) => {
                tracing::warn!(target = %target, signal = %signal_id, %err, "signal delivery failed");
            }
            DeliveryStatus::Skipped(reason) => {
                tracing::info!(target = %target, signal = %signal_id, %reason, "signal target skipped");
            }
        }
    }
}
