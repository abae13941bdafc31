use crate::reconciler::ClientGameState;
use std::{
    fmt,
    time::Duration,
};
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum ConnectionStatus {
    #[default]
    Connected,
    Disconnected,
    Reconnecting,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Reconnecting => "reconnecting",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionHealth {
    pub status: ConnectionStatus,
    pub consecutive_errors: u32,
    pub last_success_at: Option<Instant>,
}

impl ConnectionHealth {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    pub(crate) fn record_success(&mut self, now: Instant) {
        self.status = ConnectionStatus::Connected;
        self.consecutive_errors = 0;
        self.last_success_at = Some(now);
    }

    pub(crate) fn record_failure(&mut self, reconnect_after: u32) {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.status = if self.consecutive_errors >= reconnect_after {
            ConnectionStatus::Reconnecting
        } else {
            ConnectionStatus::Disconnected
        };
    }

    pub(crate) fn set_status(&mut self, status: ConnectionStatus) {
        self.status = status;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum StallKind {
    /// No poll has succeeded for too long.
    NoSuccessfulPoll,
    /// The countdown stopped moving while waiting.
    CountdownFrozen,
    /// Active bets have not been checked against the server for too long.
    BetStateStale,
    /// Stuck in `playing` or `waiting` well past the phase's expected length.
    PhaseOverrun,
}

#[derive(Clone, Copy, Debug)]
pub struct StallThresholds {
    pub no_successful_poll: Duration,
    pub countdown_frozen: Duration,
    pub bet_state_stale: Duration,
    pub playing_silence: Duration,
    pub overrun_grace: Duration,
    pub unknown_crash_point_cap: Duration,
    pub growth_per_sec: f64,
}

/// The clocks each detector reads, sampled when the watchdog runs.
#[derive(Clone, Copy, Debug)]
pub struct StallInputs {
    pub now: Instant,
    pub watching_since: Instant,
    pub last_success_at: Option<Instant>,
    pub state: ClientGameState,
    pub entered_state_at: Instant,
    pub countdown: u32,
    pub countdown_at_entry: u32,
    pub countdown_changed_at: Instant,
    pub crash_point: Option<f64>,
    pub has_active_slips: bool,
    pub bet_state_refreshed_at: Instant,
}

impl StallInputs {
    fn since(&self, at: Instant) -> Duration {
        self.now.saturating_duration_since(at)
    }

    fn silence(&self) -> Duration {
        self.since(self.last_success_at.unwrap_or(self.watching_since))
    }
}

/// How long `playing` should last when the multiplier climbs to `crash_point`.
pub fn expected_flight(crash_point: f64, growth_per_sec: f64) -> Option<Duration> {
    if !crash_point.is_finite() || growth_per_sec <= 0.0 {
        return None;
    }
    let secs = (crash_point - 1.0).max(0.0) / growth_per_sec;
    Duration::try_from_secs_f64(secs).ok()
}

/// Every stall condition tripped by `inputs`.
pub fn detect_stalls(inputs: &StallInputs, limits: &StallThresholds) -> Vec<StallKind> {
    let mut stalls = Vec::new();

    if inputs.silence() >= limits.no_successful_poll {
        stalls.push(StallKind::NoSuccessfulPoll);
    }

    if inputs.state == ClientGameState::Waiting
        && inputs.countdown > 0
        && inputs.since(inputs.countdown_changed_at) >= limits.countdown_frozen
    {
        stalls.push(StallKind::CountdownFrozen);
    }

    if inputs.has_active_slips && inputs.since(inputs.bet_state_refreshed_at) >= limits.bet_state_stale {
        stalls.push(StallKind::BetStateStale);
    }

    let in_phase = inputs.since(inputs.entered_state_at);
    let overrun = match inputs.state {
        ClientGameState::Playing => {
            let expected = inputs
                .crash_point
                .and_then(|point| expected_flight(point, limits.growth_per_sec))
                .map(|flight| flight + limits.overrun_grace)
                .unwrap_or(limits.unknown_crash_point_cap);
            inputs.silence() >= limits.playing_silence || in_phase > expected
        }
        ClientGameState::Waiting => {
            in_phase > Duration::from_secs(u64::from(inputs.countdown_at_entry)) + limits.overrun_grace
        }
        ClientGameState::Crashed | ClientGameState::Recovering => false,
    };
    if overrun {
        stalls.push(StallKind::PhaseOverrun);
    }

    stalls
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    fn limits() -> StallThresholds {
        StallThresholds {
            no_successful_poll: Duration::from_secs(8),
            countdown_frozen: Duration::from_secs(5),
            bet_state_stale: Duration::from_secs(10),
            playing_silence: Duration::from_secs(6),
            overrun_grace: Duration::from_secs(10),
            unknown_crash_point_cap: Duration::from_secs(300),
            growth_per_sec: 0.05,
        }
    }

    fn healthy_inputs(start: Instant, now: Instant) -> StallInputs {
        StallInputs {
            now,
            watching_since: start,
            last_success_at: Some(now),
            state: ClientGameState::Waiting,
            entered_state_at: now,
            countdown: 6,
            countdown_at_entry: 10,
            countdown_changed_at: now,
            crash_point: None,
            has_active_slips: false,
            bet_state_refreshed_at: now,
        }
    }

    #[test]
    fn record_failure__escalates_to_reconnecting() {
        let mut health = ConnectionHealth::default();

        health.record_failure(5);
        let after_one = health.status;
        for _ in 0..4 {
            health.record_failure(5);
        }

        assert_eq!(after_one, ConnectionStatus::Disconnected);
        assert_eq!(health.status, ConnectionStatus::Reconnecting);
        assert_eq!(health.consecutive_errors, 5);
    }

    #[test]
    fn record_success__restores_connected() {
        let now = Instant::now();
        let mut health = ConnectionHealth::default();
        health.record_failure(5);

        health.record_success(now);

        assert_eq!(health.status, ConnectionStatus::Connected);
        assert_eq!(health.consecutive_errors, 0);
        assert_eq!(health.last_success_at, Some(now));
    }

    #[test]
    fn detect_stalls__quiet_when_everything_is_fresh() {
        let now = Instant::now();

        let stalls = detect_stalls(&healthy_inputs(now, now), &limits());

        assert!(stalls.is_empty());
    }

    #[test]
    fn detect_stalls__no_poll_ever_succeeded() {
        // given
        let start = Instant::now();
        let now = start + Duration::from_secs(8);
        let mut inputs = healthy_inputs(start, now);
        inputs.last_success_at = None;

        // when
        let stalls = detect_stalls(&inputs, &limits());

        // then
        assert_eq!(stalls, vec![StallKind::NoSuccessfulPoll]);
    }

    #[test]
    fn detect_stalls__frozen_countdown() {
        let start = Instant::now();
        let now = start + Duration::from_secs(5);
        let mut inputs = healthy_inputs(start, now);
        inputs.countdown_changed_at = start;

        assert_eq!(detect_stalls(&inputs, &limits()), vec![StallKind::CountdownFrozen]);
    }

    #[test]
    fn detect_stalls__stale_bet_state_only_with_active_slips() {
        let start = Instant::now();
        let now = start + Duration::from_secs(11);
        let mut inputs = healthy_inputs(start, now);
        inputs.bet_state_refreshed_at = start;

        let idle = detect_stalls(&inputs, &limits());
        inputs.has_active_slips = true;
        let betting = detect_stalls(&inputs, &limits());

        assert!(idle.is_empty());
        assert_eq!(betting, vec![StallKind::BetStateStale]);
    }

    #[test]
    fn detect_stalls__playing_past_expected_flight() {
        // given a 2.0x round should fly for 20s
        let start = Instant::now();
        let now = start + Duration::from_secs(31);
        let mut inputs = healthy_inputs(start, now);
        inputs.state = ClientGameState::Playing;
        inputs.entered_state_at = start;
        inputs.crash_point = Some(2.0);

        // when
        let stalls = detect_stalls(&inputs, &limits());

        // then
        assert_eq!(stalls, vec![StallKind::PhaseOverrun]);
    }

    #[test]
    fn detect_stalls__playing_without_polls() {
        let start = Instant::now();
        let now = start + Duration::from_secs(6);
        let mut inputs = healthy_inputs(start, now);
        inputs.state = ClientGameState::Playing;
        inputs.last_success_at = Some(start);

        assert_eq!(detect_stalls(&inputs, &limits()), vec![StallKind::PhaseOverrun]);
    }

    #[test]
    fn detect_stalls__waiting_past_countdown() {
        let start = Instant::now();
        let now = start + Duration::from_secs(21);
        let mut inputs = healthy_inputs(start, now);
        inputs.entered_state_at = start;

        assert_eq!(detect_stalls(&inputs, &limits()), vec![StallKind::PhaseOverrun]);
    }
}
