use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connected,
    /// Recent failures, threshold not yet reached.
    Degraded,
    /// Threshold of consecutive failures reached: no server connection.
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Healthy,
    Unhealthy,
    /// A disconnected monitor saw the server come back. Reported on every
    /// tick until the caller acknowledges it with `reset`.
    ConnectionRestored,
}

/// Lightweight reachability check run by `tick` while disconnected.
pub trait ConnectionProbe: Send + Sync {
    fn check(&self) -> bool;
}

impl<F> ConnectionProbe for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn check(&self) -> bool {
        self()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub failure_threshold: u32,
    /// Minimum time between probes; also how long a degraded or disconnected
    /// monitor must go without failures before time alone counts as recovery.
    pub probe_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            probe_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct MonitorState {
    state: ConnectionState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_failure_reason: Option<String>,
    last_probe: Option<Instant>,
    last_good: Instant,
    success_observed: bool,
}

/// Tracks whether the backend is reachable, fed by delivery outcomes and
/// driven by an external `tick`.
pub struct ConnectionMonitor {
    config: MonitorConfig,
    probe: Option<Arc<dyn ConnectionProbe>>,
    state: Mutex<MonitorState>,
}

impl ConnectionMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config: MonitorConfig {
                failure_threshold: config.failure_threshold.max(1),
                ..config
            },
            probe: None,
            state: Mutex::new(MonitorState {
                state: ConnectionState::Connected,
                consecutive_failures: 0,
                last_failure: None,
                last_failure_reason: None,
                last_probe: None,
                last_good: Instant::now(),
                success_observed: false,
            }),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ConnectionProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn connection_failed(&self, reason: &str) {
        let mut st = self.state.lock();
        st.consecutive_failures = st.consecutive_failures.saturating_add(1);
        st.last_failure = Some(Instant::now());
        st.last_failure_reason = Some(reason.to_string());
        st.success_observed = false;

        if st.consecutive_failures >= self.config.failure_threshold {
            if st.state != ConnectionState::Disconnected {
                tracing::warn!(
                    failures = st.consecutive_failures,
                    reason,
                    "Server connection lost"
                );
            }
            st.state = ConnectionState::Disconnected;
        } else if st.state == ConnectionState::Connected {
            tracing::debug!(
                failures = st.consecutive_failures,
                reason,
                "Server connection degraded"
            );
            st.state = ConnectionState::Degraded;
        }
    }

    pub fn connection_succeeded(&self) {
        let mut st = self.state.lock();
        st.consecutive_failures = 0;
        st.last_good = Instant::now();
        match st.state {
            ConnectionState::Degraded => st.state = ConnectionState::Connected,
            // Restoration is reported by the next tick.
            ConnectionState::Disconnected => st.success_observed = true,
            ConnectionState::Connected => {}
        }
    }

    /// Periodic health evaluation. Probes at most once per `probe_interval`
    /// and never while holding the state lock.
    pub fn tick(&self) -> TickOutcome {
        let now = Instant::now();
        let run_probe = {
            let mut st = self.state.lock();
            match st.state {
                ConnectionState::Connected => return TickOutcome::Healthy,
                ConnectionState::Degraded => {
                    if self.quiet_since_last_failure(&st, now) {
                        st.state = ConnectionState::Connected;
                        st.consecutive_failures = 0;
                        tracing::debug!("Server connection recovered from degraded state");
                    }
                    return TickOutcome::Healthy;
                }
                ConnectionState::Disconnected => {
                    if st.success_observed {
                        return TickOutcome::ConnectionRestored;
                    }
                    let probe_due = st
                        .last_probe
                        .is_none_or(|last| now.duration_since(last) >= self.config.probe_interval);
                    match &self.probe {
                        Some(_) if probe_due => {
                            st.last_probe = Some(now);
                            true
                        }
                        Some(_) => return TickOutcome::Unhealthy,
                        None if self.quiet_since_last_failure(&st, now) => {
                            return TickOutcome::ConnectionRestored;
                        }
                        None => return TickOutcome::Unhealthy,
                    }
                }
            }
        };

        let reachable = run_probe && self.probe.as_ref().is_some_and(|probe| probe.check());
        let mut st = self.state.lock();
        if st.state != ConnectionState::Disconnected {
            // Reset or a success raced with the probe.
            return TickOutcome::Healthy;
        }
        if reachable {
            st.success_observed = true;
            TickOutcome::ConnectionRestored
        } else {
            TickOutcome::Unhealthy
        }
    }

    /// Acknowledges a restoration: back to connected with a clean slate.
    pub fn reset(&self) {
        let mut st = self.state.lock();
        if st.state != ConnectionState::Connected {
            tracing::info!("Server connection restored");
        }
        st.state = ConnectionState::Connected;
        st.consecutive_failures = 0;
        st.success_observed = false;
        st.last_probe = None;
        st.last_good = Instant::now();
    }

    pub fn has_server_connection(&self) -> bool {
        self.state.lock().state != ConnectionState::Disconnected
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    pub fn last_good(&self) -> Instant {
        self.state.lock().last_good
    }

    pub fn last_failure_reason(&self) -> Option<String> {
        self.state.lock().last_failure_reason.clone()
    }

    fn quiet_since_last_failure(&self, st: &MonitorState, now: Instant) -> bool {
        st.last_failure
            .is_none_or(|at| now.duration_since(at) >= self.config.probe_interval)
    }
}

impl std::fmt::Debug for ConnectionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionMonitor")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("has_probe", &self.probe.is_some())
            .finish()
    }
}
