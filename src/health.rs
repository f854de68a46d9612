//! Per-server health tracking
//!
//! Each server moves `Alive -> Suspect -> Dead` as consecutive transport
//! failures accumulate, and back to `Alive` once a reconnection probe gets
//! through. `Removed` is terminal. The tracker owns the state table and the
//! event channel; the dispatcher and the topology only act on what it returns.

use crate::cluster::ServerId;
use crate::error::TransportError;
use crate::event::{ClientEvent, EventKind, IssueEvent};
use crate::metrics::Metrics;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Health state of a server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ServerStatus {
    #[default]
    Alive,
    /// Some consecutive failures, still below the threshold
    Suspect,
    Dead,
    /// Permanently out of the ring, never probed again
    Removed,
}

/// Counters and timestamps for one server
#[derive(Debug, Clone, Default)]
pub struct ServerState {
    pub status: ServerStatus,
    /// Consecutive failures
    pub failures: u32,
    pub total_failures: u64,
    pub total_reconnects_attempted: u64,
    pub total_reconnects_success: u64,
    pub total_reconnects_failed: u64,
    /// Probes since the server last died
    pub probe_attempts: u32,
    pub dead_since: Option<Instant>,
    /// Closed outages only; see `down_time` for the running total
    pub total_down_time: Duration,
    pub next_retry: Option<Instant>,
    pub last_error: Option<String>,
}

impl ServerState {
    /// Down time including the current outage
    pub fn down_time(&self) -> Duration {
        self.total_down_time + self.dead_since.map(|t| t.elapsed()).unwrap_or_default()
    }

    fn close_outage(&mut self) {
        if let Some(since) = self.dead_since.take() {
            self.total_down_time += since.elapsed();
        }
    }
}

/// Result of reporting a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Counted; the server is still usable
    Issue,
    /// This failure crossed the threshold
    Dead,
    /// The server was already dead or removed
    AlreadyDead,
}

/// What the probe loop should do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Retry,
    /// The attempt ceiling was hit; `removed` is set when the server was
    /// taken out for good
    GiveUp { removed: bool },
}

/// Shared health table for every server of a client
pub struct HealthTracker {
    servers: Vec<(String, Mutex<ServerState>)>,
    threshold: u32,
    remove: bool,
    reconnect_attempts: Option<u32>,
    events: broadcast::Sender<ClientEvent>,
    metrics: Arc<Metrics>,
}

impl HealthTracker {
    /// Create a tracker for `labels`, indexed by `ServerId`
    pub fn new(
        labels: Vec<String>,
        threshold: u32,
        remove: bool,
        reconnect_attempts: Option<u32>,
        event_capacity: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            servers: labels
                .into_iter()
                .map(|label| (label, Mutex::new(ServerState::default())))
                .collect(),
            threshold: threshold.max(1),
            remove,
            reconnect_attempts,
            events,
            metrics,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn status(&self, id: ServerId) -> ServerStatus {
        self.servers[id.0].1.lock().status
    }

    /// True for servers that must not receive traffic
    pub fn is_dead(&self, id: ServerId) -> bool {
        matches!(self.status(id), ServerStatus::Dead | ServerStatus::Removed)
    }

    /// Copy of a server's current state
    pub fn state(&self, id: ServerId) -> ServerState {
        self.servers[id.0].1.lock().clone()
    }

    /// Count a transport failure and emit `issue`, plus `failure` when the
    /// threshold is crossed
    pub fn record_failure(
        &self,
        id: ServerId,
        operation: &str,
        err: &TransportError,
    ) -> FailureOutcome {
        let (label, slot) = &self.servers[id.0];
        let tokens = [operation.to_string(), err.code().to_string()];

        let (outcome, issue) = {
            let mut state = slot.lock();
            state.failures = state.failures.saturating_add(1);
            state.total_failures += 1;
            state.last_error = Some(err.to_string());

            let outcome = match state.status {
                ServerStatus::Dead | ServerStatus::Removed => FailureOutcome::AlreadyDead,
                _ if state.failures >= self.threshold => {
                    state.status = ServerStatus::Dead;
                    state.dead_since = Some(Instant::now());
                    state.probe_attempts = 0;
                    FailureOutcome::Dead
                }
                _ => {
                    state.status = ServerStatus::Suspect;
                    FailureOutcome::Issue
                }
            };
            (outcome, snapshot(label, &state, tokens))
        };

        self.metrics.issues.inc();
        warn!(
            server = %label,
            command = operation,
            error = %err,
            failures = issue.failures,
            "Server issue"
        );
        self.emit(EventKind::Issue, issue.clone());

        if outcome == FailureOutcome::Dead {
            self.metrics.failures.inc();
            error!(server = %label, failures = issue.failures, "Server marked dead");
            self.emit(EventKind::Failure, issue);
        }

        outcome
    }

    /// A request went through; clears the consecutive failure count
    pub fn record_success(&self, id: ServerId) {
        let mut state = self.servers[id.0].1.lock();
        if state.status == ServerStatus::Suspect {
            state.status = ServerStatus::Alive;
            state.failures = 0;
        }
    }

    /// Remember when the next probe is due
    pub fn schedule_probe(&self, id: ServerId, at: Instant) {
        self.servers[id.0].1.lock().next_retry = Some(at);
    }

    /// A probe is starting; emits `reconnecting`
    pub fn begin_reconnect(&self, id: ServerId) {
        let (label, slot) = &self.servers[id.0];
        let issue = {
            let mut state = slot.lock();
            state.total_reconnects_attempted += 1;
            state.probe_attempts = state.probe_attempts.saturating_add(1);
            state.next_retry = None;
            snapshot(label, &state, probe_tokens("reconnecting"))
        };
        debug!(server = %label, attempt = issue.total_reconnects_attempted, "Reconnecting");
        self.emit(EventKind::Reconnecting, issue);
    }

    /// A probe succeeded; the server is alive again. Emits `reconnect`.
    pub fn reconnected(&self, id: ServerId) {
        let (label, slot) = &self.servers[id.0];
        let issue = {
            let mut state = slot.lock();
            state.status = ServerStatus::Alive;
            state.failures = 0;
            state.probe_attempts = 0;
            state.total_reconnects_success += 1;
            state.next_retry = None;
            state.last_error = None;
            state.close_outage();
            snapshot(label, &state, probe_tokens("reconnected"))
        };
        self.metrics.reconnects.inc();
        info!(server = %label, down_time = ?issue.total_down_time, "Server reconnected");
        self.emit(EventKind::Reconnect, issue);
    }

    /// A probe failed. Emits `remove` if the attempt ceiling was reached with
    /// removal enabled.
    pub fn reconnect_failed(&self, id: ServerId, err: &TransportError) -> ProbeOutcome {
        let (label, slot) = &self.servers[id.0];
        let (outcome, issue) = {
            let mut state = slot.lock();
            state.total_reconnects_failed += 1;
            state.last_error = Some(err.to_string());

            let exhausted = self
                .reconnect_attempts
                .is_some_and(|max| state.probe_attempts >= max);
            let outcome = if !exhausted {
                ProbeOutcome::Retry
            } else if self.remove {
                state.status = ServerStatus::Removed;
                state.close_outage();
                ProbeOutcome::GiveUp { removed: true }
            } else {
                ProbeOutcome::GiveUp { removed: false }
            };
            let tokens = ["reconnect".to_string(), err.code().to_string()];
            (outcome, snapshot(label, &state, tokens))
        };

        self.metrics.reconnects_failed.inc();
        match outcome {
            ProbeOutcome::Retry => {
                debug!(server = %label, error = %err, "Reconnection probe failed");
            }
            ProbeOutcome::GiveUp { removed: true } => {
                self.metrics.removals.inc();
                warn!(
                    server = %label,
                    attempts = issue.total_reconnects_attempted,
                    "Server removed"
                );
                self.emit(EventKind::Remove, issue);
            }
            ProbeOutcome::GiveUp { removed: false } => {
                warn!(server = %label, "Giving up on reconnection, server stays dead");
            }
        }
        outcome
    }

    fn emit(&self, kind: EventKind, issue: IssueEvent) {
        // No subscribers is fine
        let _ = self.events.send(ClientEvent { kind, issue });
    }
}

fn probe_tokens(stage: &str) -> [String; 2] {
    ["reconnect".to_string(), stage.to_string()]
}

fn snapshot(label: &str, state: &ServerState, tokens: [String; 2]) -> IssueEvent {
    IssueEvent {
        server: label.to_string(),
        tokens,
        messages: state.last_error.iter().cloned().collect(),
        failures: state.failures,
        total_failures: state.total_failures,
        total_reconnects_attempted: state.total_reconnects_attempted,
        total_reconnects_success: state.total_reconnects_success,
        total_reconnects_failed: state.total_reconnects_failed,
        total_down_time: state.down_time(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(threshold: u32, remove: bool, attempts: Option<u32>) -> HealthTracker {
        HealthTracker::new(
            vec!["10.0.0.1:11211".to_string(), "10.0.0.2:11211".to_string()],
            threshold,
            remove,
            attempts,
            64,
            Arc::new(Metrics::new()),
        )
    }

    fn drain(rx: &mut broadcast::Receiver<ClientEvent>) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        kinds
    }

    fn refused() -> TransportError {
        TransportError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused))
    }

    #[test]
    fn test_threshold_marks_dead() {
        let health = tracker(3, false, None);
        let mut rx = health.subscribe();
        let id = ServerId(0);

        assert_eq!(health.record_failure(id, "get", &refused()), FailureOutcome::Issue);
        assert_eq!(health.status(id), ServerStatus::Suspect);
        assert_eq!(health.record_failure(id, "get", &refused()), FailureOutcome::Issue);
        assert_eq!(health.record_failure(id, "set", &refused()), FailureOutcome::Dead);
        assert!(health.is_dead(id));
        assert!(!health.is_dead(ServerId(1)));

        assert_eq!(
            drain(&mut rx),
            vec![
                EventKind::Issue,
                EventKind::Issue,
                EventKind::Issue,
                EventKind::Failure
            ]
        );

        // Failures against a dead server are still counted and reported
        assert_eq!(
            health.record_failure(id, "get", &TransportError::ServerDead),
            FailureOutcome::AlreadyDead
        );
        assert_eq!(drain(&mut rx), vec![EventKind::Issue]);
        assert_eq!(health.state(id).total_failures, 4);
    }

    #[test]
    fn test_issue_payload() {
        let health = tracker(5, false, None);
        let mut rx = health.subscribe();
        health.record_failure(ServerId(1), "incr", &TransportError::RequestTimeout);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, EventKind::Issue);
        assert_eq!(event.issue.server, "10.0.0.2:11211");
        assert_eq!(event.issue.tokens, ["incr".to_string(), "request_timeout".to_string()]);
        assert_eq!(event.issue.messages, vec!["Request timed out".to_string()]);
        assert_eq!(event.issue.failures, 1);
        assert_eq!(event.issue.total_failures, 1);
    }

    #[test]
    fn test_success_clears_suspect() {
        let health = tracker(2, false, None);
        let id = ServerId(0);
        health.record_failure(id, "get", &refused());
        health.record_success(id);
        assert_eq!(health.status(id), ServerStatus::Alive);

        // Counter restarted, so one more failure is not enough
        assert_eq!(health.record_failure(id, "get", &refused()), FailureOutcome::Issue);
        assert_eq!(health.state(id).total_failures, 2);
    }

    #[test]
    fn test_reconnect_cycle() {
        let health = tracker(1, true, None);
        let mut rx = health.subscribe();
        let id = ServerId(0);

        health.record_failure(id, "get", &refused());
        health.begin_reconnect(id);
        assert_eq!(health.reconnect_failed(id, &refused()), ProbeOutcome::Retry);
        health.begin_reconnect(id);
        health.reconnected(id);

        assert_eq!(health.status(id), ServerStatus::Alive);
        let state = health.state(id);
        assert_eq!(state.failures, 0);
        assert_eq!(state.total_reconnects_attempted, 2);
        assert_eq!(state.total_reconnects_failed, 1);
        assert_eq!(state.total_reconnects_success, 1);
        assert!(state.dead_since.is_none());

        assert_eq!(
            drain(&mut rx),
            vec![
                EventKind::Issue,
                EventKind::Failure,
                EventKind::Reconnecting,
                EventKind::Reconnecting,
                EventKind::Reconnect
            ]
        );
    }

    #[test]
    fn test_attempt_ceiling_removes() {
        let health = tracker(1, true, Some(2));
        let mut rx = health.subscribe();
        let id = ServerId(0);

        health.record_failure(id, "get", &refused());
        health.begin_reconnect(id);
        assert_eq!(health.reconnect_failed(id, &refused()), ProbeOutcome::Retry);
        health.begin_reconnect(id);
        assert_eq!(
            health.reconnect_failed(id, &refused()),
            ProbeOutcome::GiveUp { removed: true }
        );
        assert_eq!(health.status(id), ServerStatus::Removed);
        assert!(drain(&mut rx).ends_with(&[EventKind::Remove]));
    }

    #[test]
    fn test_attempt_ceiling_without_remove() {
        let health = tracker(1, false, Some(1));
        let mut rx = health.subscribe();
        let id = ServerId(0);

        health.record_failure(id, "get", &refused());
        health.begin_reconnect(id);
        assert_eq!(
            health.reconnect_failed(id, &refused()),
            ProbeOutcome::GiveUp { removed: false }
        );
        assert_eq!(health.status(id), ServerStatus::Dead);
        assert!(!drain(&mut rx).contains(&EventKind::Remove));
    }
}
