use crate::{
    reconciler::ClientGameState,
    timer::{
        self,
        Timer,
    },
    watchdog::{
        ConnectionHealth,
        ConnectionStatus,
    },
};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{
    debug,
    info,
    warn,
};

#[derive(Clone, Copy, Debug)]
pub struct Cadence {
    pub nominal: Duration,
    pub backoff: Duration,
    pub recovering: Duration,
}

impl Cadence {
    pub fn for_state(&self, status: ConnectionStatus, state: ClientGameState) -> Duration {
        match (status, state) {
            (ConnectionStatus::Connected, ClientGameState::Recovering) => self.recovering,
            (ConnectionStatus::Connected, _) => self.nominal,
            (ConnectionStatus::Disconnected | ConnectionStatus::Reconnecting, _) => self.backoff,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ScheduledWork {
    Poll,
    WatchdogCheck,
    SafetyNet,
    Resync,
    HistoryRetry,
}

#[derive(Clone, Copy, Debug)]
pub struct SchedulerSettings {
    pub cadence: Cadence,
    pub watchdog_period: Duration,
    pub safety_net_period: Duration,
    pub resync_debounce: Duration,
    pub history_retry_delay: Duration,
    pub resync_after_errors: u32,
    pub reconnect_after_errors: u32,
}

/// Owns the polling timers and `ConnectionHealth`.
pub struct PollScheduler {
    health: ConnectionHealth,
    settings: SchedulerSettings,
    poll: Timer,
    watchdog: Timer,
    safety_net: Timer,
    resync: Timer,
    history_retry: Timer,
    last_resync_at: Option<Instant>,
    resyncs_scheduled: u32,
}

impl PollScheduler {
    pub fn new(settings: SchedulerSettings) -> Self {
        Self {
            health: ConnectionHealth::default(),
            poll: Timer::periodic("poll", settings.cadence.nominal),
            watchdog: Timer::periodic("watchdog", settings.watchdog_period),
            safety_net: Timer::periodic("safety-net", settings.safety_net_period),
            resync: Timer::one_shot("resync"),
            history_retry: Timer::one_shot("history-retry"),
            settings,
            last_resync_at: None,
            resyncs_scheduled: 0,
        }
    }

    pub fn health(&self) -> &ConnectionHealth {
        &self.health
    }

    pub fn resyncs_scheduled(&self) -> u32 {
        self.resyncs_scheduled
    }

    pub fn poll_period(&self) -> Option<Duration> {
        self.poll.period()
    }

    pub fn start(&mut self, now: Instant) {
        self.poll.start(now);
        self.watchdog.start(now);
        self.safety_net.start(now);
    }

    pub fn stop(&mut self) {
        for timer in self.timers_mut() {
            timer.stop();
        }
    }

    pub fn timers(&self) -> [&Timer; 5] {
        [
            &self.poll,
            &self.watchdog,
            &self.safety_net,
            &self.resync,
            &self.history_retry,
        ]
    }

    fn timers_mut(&mut self) -> [&mut Timer; 5] {
        [
            &mut self.poll,
            &mut self.watchdog,
            &mut self.safety_net,
            &mut self.resync,
            &mut self.history_retry,
        ]
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        timer::earliest(self.timers())
    }

    /// Fires every due timer, in a fixed order.
    pub fn due(&mut self, now: Instant) -> Vec<ScheduledWork> {
        let mut work = Vec::new();
        if self.resync.fire(now) {
            work.push(ScheduledWork::Resync);
        }
        if self.poll.fire(now) {
            work.push(ScheduledWork::Poll);
        }
        if self.history_retry.fire(now) {
            work.push(ScheduledWork::HistoryRetry);
        }
        if self.watchdog.fire(now) {
            work.push(ScheduledWork::WatchdogCheck);
        }
        if self.safety_net.fire(now) {
            work.push(ScheduledWork::SafetyNet);
        }
        work
    }

    pub fn record_poll_success(&mut self, now: Instant, state: ClientGameState) {
        if !self.health.is_connected() {
            info!(
                after_errors = self.health.consecutive_errors,
                "connection restored"
            );
        }
        self.health.record_success(now);
        self.retune(now, state);
    }

    /// Returns whether the failure streak asks for a resync.
    pub fn record_poll_failure(&mut self, now: Instant, state: ClientGameState) -> bool {
        self.health
            .record_failure(self.settings.reconnect_after_errors);
        warn!(
            consecutive_errors = self.health.consecutive_errors,
            status = %self.health.status,
            "poll failed"
        );
        self.retune(now, state);
        self.health.consecutive_errors >= self.settings.resync_after_errors
    }

    pub fn mark_disconnected(&mut self, now: Instant, state: ClientGameState) {
        if self.health.is_connected() {
            warn!("no successful poll recently; marking disconnected");
            self.health.set_status(ConnectionStatus::Disconnected);
        }
        self.retune(now, state);
    }

    /// Adapts the poll cadence to connection health and local state.
    pub fn retune(&mut self, now: Instant, state: ClientGameState) {
        let period = self.settings.cadence.for_state(self.health.status, state);
        if self.poll.period() != Some(period) {
            debug!(period_ms = period.as_millis() as u64, "poll cadence changed");
            self.poll.set_period(now, period);
        }
    }

    /// Schedules one debounced resync. Requests while one is pending, or
    /// shortly after one ran, coalesce into it.
    pub fn request_resync(&mut self, now: Instant, reason: &'static str) -> bool {
        if self.resync.is_armed() {
            debug!(reason, "resync already pending");
            return false;
        }
        let debounce = self.settings.resync_debounce;
        if self
            .last_resync_at
            .is_some_and(|at| now.saturating_duration_since(at) < debounce)
        {
            debug!(reason, "resync ran recently");
            return false;
        }
        info!(reason, "resync scheduled");
        self.resync.start_in(now, debounce);
        self.resyncs_scheduled += 1;
        true
    }

    /// Called as a resync starts its requests.
    pub fn begin_resync(&mut self, now: Instant) {
        self.last_resync_at = Some(now);
        if !self.health.is_connected() {
            self.health.set_status(ConnectionStatus::Reconnecting);
        }
    }

    pub fn schedule_history_retry(&mut self, now: Instant) {
        self.history_retry
            .start_in(now, self.settings.history_retry_delay);
    }
}
