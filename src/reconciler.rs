use crate::{
    snapshot::{
        Phase,
        RoundSnapshot,
        SAFE_MULTIPLIER,
    },
    timer::Timer,
};
use std::{
    fmt,
    time::Duration,
};
use tokio::time::Instant;
use tracing::{
    debug,
    info,
};

const TARGET_EPSILON: f64 = 0.001;

/// The locally reconstructed phase of the current round.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum ClientGameState {
    #[default]
    Waiting,
    Playing,
    Crashed,
    /// Local pause between a crash and the next countdown.
    Recovering,
}

impl ClientGameState {
    /// Crash display or recovery is in progress.
    pub fn is_settling(self) -> bool {
        matches!(self, ClientGameState::Crashed | ClientGameState::Recovering)
    }
}

impl fmt::Display for ClientGameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientGameState::Waiting => "waiting",
            ClientGameState::Playing => "playing",
            ClientGameState::Crashed => "crashed",
            ClientGameState::Recovering => "recovering",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CrashSource {
    Server,
    Safeguard,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RoundEvent {
    NewRound {
        finished: u64,
        current: u64,
    },
    EnteredPlaying {
        round: u64,
        multiplier: f64,
        crash_point: Option<f64>,
    },
    Crashed {
        round: u64,
        value: f64,
        source: CrashSource,
    },
    CountdownChanged {
        seconds: u32,
    },
    RecoveryStarted,
    RecoveryFinished,
}

/// Fields that changed in one reconciliation pass. `None` means unchanged.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StateDelta {
    pub state: Option<ClientGameState>,
    pub round_number: Option<u64>,
    pub time_remaining: Option<u32>,
    pub live_multiplier: Option<f64>,
    pub crash_point: Option<Option<f64>>,
    pub last_crash: Option<f64>,
}

impl StateDelta {
    pub fn is_empty(&self) -> bool {
        *self == StateDelta::default()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Reconciliation {
    /// The snapshot is older than what has already been applied.
    Stale { local_round: u64, snapshot_round: u64 },
    Applied {
        delta: StateDelta,
        events: Vec<RoundEvent>,
    },
}

/// What user commands are validated against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhaseGate {
    pub state: ClientGameState,
    pub round: Option<u64>,
    pub time_remaining: u32,
}

pub struct Reconciler {
    state: ClientGameState,
    round_number: Option<u64>,
    observed_phase: Option<Phase>,
    time_remaining: u32,
    live_multiplier: f64,
    crash_point: Option<f64>,
    last_crash: Option<f64>,
    last_crashed_round: Option<u64>,
    entered_state_at: Instant,
    countdown_changed_at: Instant,
    countdown_at_entry: u32,
    phase_timer: Timer,
    crash_display: Duration,
    recovery_delay: Duration,
}

impl Reconciler {
    pub fn new(now: Instant, crash_display: Duration, recovery_delay: Duration) -> Self {
        Self {
            state: ClientGameState::Waiting,
            round_number: None,
            observed_phase: None,
            time_remaining: 0,
            live_multiplier: SAFE_MULTIPLIER,
            crash_point: None,
            last_crash: None,
            last_crashed_round: None,
            entered_state_at: now,
            countdown_changed_at: now,
            countdown_at_entry: 0,
            phase_timer: Timer::one_shot("phase"),
            crash_display,
            recovery_delay,
        }
    }

    pub fn state(&self) -> ClientGameState {
        self.state
    }

    pub fn round_number(&self) -> Option<u64> {
        self.round_number
    }

    pub fn time_remaining(&self) -> u32 {
        self.time_remaining
    }

    pub fn live_multiplier(&self) -> f64 {
        self.live_multiplier
    }

    pub fn crash_point(&self) -> Option<f64> {
        self.crash_point
    }

    pub fn last_crash(&self) -> Option<f64> {
        self.last_crash
    }

    pub fn entered_state_at(&self) -> Instant {
        self.entered_state_at
    }

    pub fn countdown_changed_at(&self) -> Instant {
        self.countdown_changed_at
    }

    pub fn countdown_at_entry(&self) -> u32 {
        self.countdown_at_entry
    }

    pub fn gate(&self) -> PhaseGate {
        PhaseGate {
            state: self.state,
            round: self.round_number,
            time_remaining: self.time_remaining,
        }
    }

    pub fn phase_timer(&self) -> &Timer {
        &self.phase_timer
    }

    pub fn stop(&mut self) {
        self.phase_timer.stop();
    }

    /// Applies one snapshot as a single batch.
    pub fn reconcile(&mut self, now: Instant, snapshot: &RoundSnapshot) -> Reconciliation {
        if let Some(local_round) = self.is_stale(snapshot) {
            debug!(
                local_round,
                snapshot_round = snapshot.round_number,
                phase = %snapshot.phase,
                "discarding stale snapshot"
            );
            return Reconciliation::Stale {
                local_round,
                snapshot_round: snapshot.round_number,
            };
        }

        let mut delta = StateDelta::default();
        let mut events = Vec::new();

        // A crash report wins over whatever else the payload says.
        let crashed_now = self.apply_server_crash(now, snapshot, &mut delta, &mut events);

        self.adopt_round(now, snapshot, &mut delta, &mut events);

        if !crashed_now && !self.state.is_settling() {
            if let Some(target) = self.safeguard_trip(snapshot) {
                self.enter_crashed(
                    now,
                    snapshot.round_number,
                    target,
                    CrashSource::Safeguard,
                    &mut delta,
                    &mut events,
                );
            } else {
                self.apply_phase(now, snapshot, &mut delta, &mut events);
            }
        }

        Reconciliation::Applied { delta, events }
    }

    /// Drives the `crashed → recovering → waiting` pacing.
    pub fn on_phase_timer(&mut self, now: Instant) -> Option<(StateDelta, RoundEvent)> {
        if !self.phase_timer.fire(now) {
            return None;
        }
        let mut delta = StateDelta::default();
        match self.state {
            ClientGameState::Crashed => {
                self.set_state(now, ClientGameState::Recovering, &mut delta);
                self.phase_timer.start_in(now, self.recovery_delay);
                Some((delta, RoundEvent::RecoveryStarted))
            }
            ClientGameState::Recovering => {
                self.set_state(now, ClientGameState::Waiting, &mut delta);
                self.countdown_at_entry = self.time_remaining;
                self.countdown_changed_at = now;
                info!(round = ?self.round_number, "recovery finished");
                Some((delta, RoundEvent::RecoveryFinished))
            }
            ClientGameState::Waiting | ClientGameState::Playing => None,
        }
    }

    fn is_stale(&self, snapshot: &RoundSnapshot) -> Option<u64> {
        let local_round = self.round_number?;
        if snapshot.round_number < local_round {
            return Some(local_round);
        }
        let regressed = snapshot.round_number == local_round
            && self
                .observed_phase
                .is_some_and(|seen| snapshot.phase.rank() < seen.rank());
        regressed.then_some(local_round)
    }

    fn apply_server_crash(
        &mut self,
        now: Instant,
        snapshot: &RoundSnapshot,
        delta: &mut StateDelta,
        events: &mut Vec<RoundEvent>,
    ) -> bool {
        let Some(crash_round) = snapshot.crashed_round() else {
            return false;
        };
        if self.state.is_settling() || self.last_crashed_round >= Some(crash_round) {
            return false;
        }
        match self.round_number {
            None => {
                // Joined after the crash; nothing local to settle.
                self.last_crashed_round = Some(crash_round);
                if let Some(value) = snapshot.crashed_value {
                    self.last_crash = Some(value);
                    delta.last_crash = Some(value);
                }
                false
            }
            Some(local) if local <= crash_round => {
                let value = snapshot
                    .crashed_value
                    .or_else(|| {
                        (crash_round == snapshot.round_number)
                            .then_some(snapshot.target_crash_point)
                            .flatten()
                    })
                    .or_else(|| (crash_round == local).then_some(self.crash_point).flatten())
                    .unwrap_or(self.live_multiplier);
                self.enter_crashed(now, crash_round, value, CrashSource::Server, delta, events);
                true
            }
            Some(_) => false,
        }
    }

    fn safeguard_trip(&self, snapshot: &RoundSnapshot) -> Option<f64> {
        if self.last_crashed_round >= Some(snapshot.round_number) {
            return None;
        }
        snapshot.safeguard_crash_point()
    }

    fn adopt_round(
        &mut self,
        now: Instant,
        snapshot: &RoundSnapshot,
        delta: &mut StateDelta,
        events: &mut Vec<RoundEvent>,
    ) {
        let current = snapshot.round_number;
        if self.round_number.is_some_and(|local| local >= current) {
            self.observe(snapshot.phase);
            return;
        }
        let previous = self.round_number.replace(current);
        delta.round_number = Some(current);
        self.observed_phase = Some(snapshot.phase);
        self.countdown_changed_at = now;
        self.countdown_at_entry = snapshot.countdown_secs();
        if !self.state.is_settling() {
            self.entered_state_at = now;
        }
        if let Some(finished) = previous {
            info!(finished, current, "new round");
            events.push(RoundEvent::NewRound { finished, current });
        }
        // Missed the crash of the round we were watching.
        if self.state == ClientGameState::Playing {
            self.set_state(now, ClientGameState::Waiting, delta);
        }
        if self.crash_point.is_some() && !self.state.is_settling() {
            self.crash_point = None;
            delta.crash_point = Some(None);
        }
    }

    fn observe(&mut self, phase: Phase) {
        if self.observed_phase.is_none_or(|seen| phase.rank() > seen.rank()) {
            self.observed_phase = Some(phase);
        }
    }

    fn apply_phase(
        &mut self,
        now: Instant,
        snapshot: &RoundSnapshot,
        delta: &mut StateDelta,
        events: &mut Vec<RoundEvent>,
    ) {
        match snapshot.phase {
            Phase::Waiting => {
                if self.state != ClientGameState::Waiting {
                    self.set_state(now, ClientGameState::Waiting, delta);
                    self.countdown_at_entry = snapshot.countdown_secs();
                }
                self.set_live_multiplier(SAFE_MULTIPLIER, delta);
                let seconds = snapshot.countdown_secs();
                if seconds != self.time_remaining {
                    // First countdown seen since recovery.
                    if self.countdown_at_entry == 0 {
                        self.countdown_at_entry = seconds;
                    }
                    self.time_remaining = seconds;
                    self.countdown_changed_at = now;
                    delta.time_remaining = Some(seconds);
                    events.push(RoundEvent::CountdownChanged { seconds });
                }
            }
            Phase::Playing => {
                let round = snapshot.round_number;
                if self.state != ClientGameState::Playing {
                    if self.last_crashed_round >= Some(round) {
                        return;
                    }
                    self.set_state(now, ClientGameState::Playing, delta);
                    if self.time_remaining != 0 {
                        self.time_remaining = 0;
                        delta.time_remaining = Some(0);
                    }
                    self.set_live_multiplier(snapshot.live_multiplier, delta);
                    self.set_crash_point(snapshot.target_crash_point, delta);
                    info!(round, multiplier = snapshot.live_multiplier, "round in play");
                    events.push(RoundEvent::EnteredPlaying {
                        round,
                        multiplier: snapshot.live_multiplier,
                        crash_point: snapshot.target_crash_point,
                    });
                } else {
                    self.set_live_multiplier(snapshot.live_multiplier, delta);
                    let moved = match (self.crash_point, snapshot.target_crash_point) {
                        (Some(old), Some(new)) => (old - new).abs() > TARGET_EPSILON,
                        (None, Some(_)) => true,
                        (_, None) => false,
                    };
                    if moved {
                        self.set_crash_point(snapshot.target_crash_point, delta);
                    }
                }
            }
            // Already settled for this round.
            Phase::Crashed => {}
        }
    }

    fn enter_crashed(
        &mut self,
        now: Instant,
        round: u64,
        value: f64,
        source: CrashSource,
        delta: &mut StateDelta,
        events: &mut Vec<RoundEvent>,
    ) {
        if self.state == ClientGameState::Crashed {
            return;
        }
        info!(round, value, ?source, "round crashed");
        self.set_state(now, ClientGameState::Crashed, delta);
        self.last_crashed_round = Some(round);
        self.last_crash = Some(value);
        delta.last_crash = Some(value);
        if self.time_remaining != 0 {
            self.time_remaining = 0;
            delta.time_remaining = Some(0);
        }
        self.phase_timer.start_in(now, self.crash_display);
        events.push(RoundEvent::Crashed {
            round,
            value,
            source,
        });
    }

    fn set_state(&mut self, now: Instant, state: ClientGameState, delta: &mut StateDelta) {
        if self.state != state {
            self.state = state;
            self.entered_state_at = now;
            delta.state = Some(state);
        }
    }

    fn set_live_multiplier(&mut self, multiplier: f64, delta: &mut StateDelta) {
        if self.live_multiplier != multiplier {
            self.live_multiplier = multiplier;
            delta.live_multiplier = Some(multiplier);
        }
    }

    fn set_crash_point(&mut self, crash_point: Option<f64>, delta: &mut StateDelta) {
        if self.crash_point != crash_point {
            self.crash_point = crash_point;
            delta.crash_point = Some(crash_point);
        }
    }
}
