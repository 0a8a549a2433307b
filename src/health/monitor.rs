use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::HealthConfig;
use crate::core::types::*;
use crate::health::state::*;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HealthError {
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("illegal transition for {id}: {from} -> {to}")]
    IllegalTransition {
        id: ConnectionId,
        from: HealthState,
        to: HealthState,
    },
}

/// Mutable tracking state of one connection
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub role: ConnectionRole,
    pub state: HealthState,
    pub registered_at: Timestamp,
    pub last_seen: Option<Timestamp>,
    /// Monotonic nanos of the last sign of life (or of registration)
    pub last_seen_mono: u64,
    pub latency: Option<Duration>,
    pub missed_heartbeats: u32,
    pub reconnect_attempts: u32,
    pub malformed_streak: u32,
    pub malformed_total: u64,
}

impl Connection {
    fn new(id: ConnectionId, role: ConnectionRole) -> Self {
        Self {
            id,
            role,
            state: HealthState::Unregistered,
            registered_at: Timestamp::now(),
            last_seen: None,
            last_seen_mono: monotonic_nanos(),
            latency: None,
            missed_heartbeats: 0,
            reconnect_attempts: 0,
            malformed_streak: 0,
            malformed_total: 0,
        }
    }

    fn health(&self) -> ConnectionHealth {
        ConnectionHealth {
            connection_id: self.id.clone(),
            role: self.role,
            state: self.state,
            last_seen: self.last_seen,
            latency: self.latency,
            missed_heartbeats: self.missed_heartbeats,
            reconnect_attempts: self.reconnect_attempts,
            malformed_total: self.malformed_total,
        }
    }

    fn mark_seen(&mut self) {
        self.last_seen = Some(Timestamp::now());
        self.last_seen_mono = monotonic_nanos();
        self.missed_heartbeats = 0;
    }
}

struct ConnectionEntry {
    state: AtomicU8,
    inner: Mutex<Connection>,
}

impl ConnectionEntry {
    #[inline]
    fn state(&self) -> HealthState {
        HealthState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Owns every [`Connection`] and drives its health state machine.
///
/// `report` serializes per connection only; `current_state` is a lock-free
/// atomic load once the entry is found.
pub struct HealthMonitor {
    connections: DashMap<ConnectionId, Arc<ConnectionEntry>>,
    transitions: broadcast::Sender<HealthTransition>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        let (transitions, _) = broadcast::channel(config.transition_capacity.max(1));
        Self {
            connections: DashMap::new(),
            transitions,
            config,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Starts tracking a connection (`Unregistered → Connecting`).
    /// Registering an id that is already tracked returns its current state.
    pub fn register(&self, id: impl Into<ConnectionId>, role: ConnectionRole) -> HealthState {
        let id = id.into();
        let entry = self
            .connections
            .entry(id.clone())
            .or_insert_with(|| {
                Arc::new(ConnectionEntry {
                    state: AtomicU8::new(HealthState::Unregistered as u8),
                    inner: Mutex::new(Connection::new(id.clone(), role)),
                })
            })
            .value()
            .clone();

        let mut conn = entry.inner.lock();
        if conn.state == HealthState::Unregistered {
            let transition = self.apply(&entry, &mut conn, HealthState::Connecting, None);
            drop(conn);
            if let Some(t) = transition {
                self.publish(t);
            }
            tracing::info!(connection = %id, ?role, "connection registered");
            return HealthState::Connecting;
        }
        conn.state
    }

    /// Starts tracking a freshly dialed-in session under `id`.
    ///
    /// A `Terminated` connection is replaced by a new one that starts over
    /// from `Connecting` with clean counters. Any other state is left as is,
    /// exactly like [`register`](Self::register).
    pub fn open_session(&self, id: impl Into<ConnectionId>, role: ConnectionRole) -> HealthState {
        let id = id.into();
        if let Ok(entry) = self.entry(&id) {
            let mut conn = entry.inner.lock();
            if conn.state == HealthState::Terminated {
                *conn = Connection::new(id.clone(), role);
                let transition = self.apply(&entry, &mut conn, HealthState::Connecting, None);
                drop(conn);
                if let Some(t) = transition {
                    self.publish(t);
                }
                tracing::info!(connection = %id, ?role, "terminated connection dialed in again");
                return HealthState::Connecting;
            }
        }
        self.register(id, role)
    }

    /// Feeds one observation into the state machine. Safe to call
    /// concurrently from any number of paths for the same connection.
    pub fn report(
        &self,
        id: &ConnectionId,
        event: HealthEvent,
    ) -> Result<Option<HealthTransition>, HealthError> {
        let entry = self.entry(id)?;
        let mut conn = entry.inner.lock();
        let next = self.next_state(&mut conn, event);
        let transition = match next {
            Some(to) if to != conn.state => {
                if !conn.state.can_transition_to(to) {
                    return Err(HealthError::IllegalTransition {
                        id: id.clone(),
                        from: conn.state,
                        to,
                    });
                }
                self.apply(&entry, &mut conn, to, Some(event))
            }
            _ => None,
        };
        drop(conn);

        if let Some(t) = &transition {
            self.publish(t.clone());
        }
        Ok(transition)
    }

    /// Fast non-blocking read. Unknown connections are `Unregistered`.
    pub fn current_state(&self, id: &ConnectionId) -> HealthState {
        self.connections
            .get(id)
            .map(|entry| entry.state())
            .unwrap_or(HealthState::Unregistered)
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<Connection> {
        let entry = self.entry(id).ok()?;
        let conn = entry.inner.lock().clone();
        Some(conn)
    }

    pub fn role(&self, id: &ConnectionId) -> Option<ConnectionRole> {
        self.connection(id).map(|c| c.role)
    }

    /// Push channel of every state change
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<HealthTransition> {
        self.transitions.subscribe()
    }

    /// Health boundary records, sorted by connection id
    pub fn health_report(&self) -> Vec<ConnectionHealth> {
        let mut report: Vec<ConnectionHealth> = self
            .entries()
            .iter()
            .map(|entry| entry.inner.lock().health())
            .collect();
        report.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        report
    }

    /// Reports missed heartbeats for every live connection that has been
    /// silent for whole heartbeat intervals as of `now_mono`.
    pub fn sweep(&self, now_mono: u64) -> Vec<HealthTransition> {
        let interval = self.config.heartbeat_interval().as_nanos().max(1) as u64;
        let mut transitions = Vec::new();

        for entry in self.entries() {
            let (id, missed_due) = {
                let conn = entry.inner.lock();
                if !matches!(conn.state, HealthState::Healthy | HealthState::Degraded) {
                    continue;
                }
                let silent = now_mono.saturating_sub(conn.last_seen_mono);
                let due = (silent / interval).min(u32::MAX as u64) as u32;
                if due <= conn.missed_heartbeats {
                    continue;
                }
                (conn.id.clone(), due - conn.missed_heartbeats)
            };

            for _ in 0..missed_due {
                match self.report(&id, HealthEvent::HeartbeatMissed) {
                    Ok(Some(t)) => {
                        let stop = t.to == HealthState::Unhealthy;
                        transitions.push(t);
                        if stop {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::error!(connection = %id, %err, "heartbeat sweep failed");
                        break;
                    }
                }
            }
        }
        transitions
    }

    /// Runs [`sweep`](Self::sweep) once per heartbeat interval
    pub fn spawn_watchdog(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.heartbeat_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let transitions = monitor.sweep(monotonic_nanos());
                if !transitions.is_empty() {
                    tracing::debug!(count = transitions.len(), "heartbeat sweep changed state");
                }
            }
        })
    }

    fn entry(&self, id: &ConnectionId) -> Result<Arc<ConnectionEntry>, HealthError> {
        self.connections
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| HealthError::UnknownConnection(id.clone()))
    }

    fn entries(&self) -> Vec<Arc<ConnectionEntry>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Updates counters for `event` and returns the state it leads to
    fn next_state(&self, conn: &mut Connection, event: HealthEvent) -> Option<HealthState> {
        use HealthState::*;

        match event {
            HealthEvent::Heartbeat { .. } | HealthEvent::Activity => {
                let slow = match event {
                    HealthEvent::Heartbeat { latency } => {
                        conn.latency = Some(latency);
                        latency > self.config.latency_threshold()
                    }
                    _ => false,
                };
                conn.mark_seen();
                conn.malformed_streak = 0;
                match conn.state {
                    Connecting => Some(Healthy),
                    Healthy if slow => Some(Degraded),
                    Degraded if !slow => Some(Healthy),
                    _ => None,
                }
            }
            HealthEvent::HeartbeatMissed => {
                conn.missed_heartbeats = conn.missed_heartbeats.saturating_add(1);
                match conn.state {
                    Healthy => Some(Degraded),
                    Degraded if conn.missed_heartbeats >= self.config.missed_heartbeat_limit => {
                        Some(Unhealthy)
                    }
                    _ => None,
                }
            }
            HealthEvent::Malformed => {
                conn.malformed_streak = conn.malformed_streak.saturating_add(1);
                conn.malformed_total += 1;
                match conn.state {
                    Healthy if conn.malformed_streak >= self.config.malformed_threshold => {
                        Some(Degraded)
                    }
                    _ => None,
                }
            }
            HealthEvent::ReconnectStarted => match conn.state {
                Unhealthy => Some(Reconnecting),
                _ => None,
            },
            HealthEvent::ReconnectSucceeded => match conn.state {
                Reconnecting => {
                    conn.mark_seen();
                    conn.reconnect_attempts = 0;
                    conn.malformed_streak = 0;
                    Some(Healthy)
                }
                _ => None,
            },
            HealthEvent::ReconnectFailed => match conn.state {
                Reconnecting => {
                    conn.reconnect_attempts = conn.reconnect_attempts.saturating_add(1);
                    if conn.reconnect_attempts >= self.config.max_reconnect_attempts {
                        Some(Terminated)
                    } else {
                        Some(Unhealthy)
                    }
                }
                _ => None,
            },
        }
    }

    fn apply(
        &self,
        entry: &ConnectionEntry,
        conn: &mut Connection,
        to: HealthState,
        cause: Option<HealthEvent>,
    ) -> Option<HealthTransition> {
        let from = conn.state;
        if !from.can_transition_to(to) {
            return None;
        }
        conn.state = to;
        entry.state.store(to as u8, Ordering::Release);

        match to {
            HealthState::Healthy | HealthState::Connecting | HealthState::Reconnecting => {
                tracing::info!(connection = %conn.id, %from, %to, "health transition")
            }
            HealthState::Terminated => tracing::error!(
                connection = %conn.id,
                attempts = conn.reconnect_attempts,
                "connection terminated after exhausting reconnection attempts"
            ),
            _ => tracing::warn!(
                connection = %conn.id,
                %from,
                %to,
                missed = conn.missed_heartbeats,
                latency_ms = conn.latency.map(|l| l.as_millis() as u64),
                "health transition"
            ),
        }
        metrics::counter!("gateway_health_transitions_total", 1, "to" => to.as_str());

        Some(HealthTransition {
            connection_id: conn.id.clone(),
            role: conn.role,
            from,
            to,
            cause,
            at: Timestamp::now(),
        })
    }

    fn publish(&self, transition: HealthTransition) {
        // No subscribers is fine; pollers use current_state.
        let _ = self.transitions.send(transition);
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}
