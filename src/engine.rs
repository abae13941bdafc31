use crate::{
    animator::Animator,
    api::{
        ApiError,
        CashedOut,
        GameApi,
        PlacedBet,
    },
    config::EngineConfig,
    error::CommandError,
    ledger::{
        BetSlip,
        CashOutTicket,
        Ledger,
        SlipId,
    },
    money::Money,
    reconciler::{
        ClientGameState,
        Reconciler,
        Reconciliation,
        RoundEvent,
        StateDelta,
    },
    scheduler::{
        PollScheduler,
        ScheduledWork,
    },
    snapshot::{
        RoundSnapshot,
        SAFE_MULTIPLIER,
    },
    timer,
    watchdog::{
        ConnectionStatus,
        StallKind,
        StallInputs,
        StallThresholds,
        detect_stalls,
    },
};
use futures::{
    FutureExt,
    StreamExt,
    future::LocalBoxFuture,
    stream::FuturesUnordered,
};
use std::{
    future::Future,
    rc::Rc,
};
use tokio::{
    sync::{
        mpsc,
        oneshot,
        watch,
    },
    time::{
        self,
        Instant,
    },
};
use tracing::{
    debug,
    error,
    info,
    warn,
};

type Reply<T> = oneshot::Sender<Result<T, CommandError>>;

pub enum Command {
    PlaceBet {
        stake: Money,
        reply: Reply<BetSlip>,
    },
    CashOut {
        slip_id: SlipId,
        reply: Reply<BetSlip>,
    },
    ForceResync,
    /// Re-places `stake` once per round while set.
    SetAutoBet {
        stake: Option<Money>,
    },
    /// The user logged in again; queued actions are replayed.
    SessionRestored {
        token: String,
    },
    Stop,
}

enum Completion {
    Snapshot(Result<RoundSnapshot, ApiError>),
    Balance(Result<Money, ApiError>),
    History(Result<Vec<f64>, ApiError>),
    ActiveBet {
        round: u64,
        result: Result<bool, ApiError>,
    },
    PlaceBet {
        slip_id: SlipId,
        stake: Money,
        reply: Option<Reply<BetSlip>>,
        result: Result<PlacedBet, ApiError>,
    },
    CashOut {
        slip_id: SlipId,
        multiplier: f64,
        reply: Reply<BetSlip>,
        result: Result<CashedOut, ApiError>,
    },
}

/// Read-only picture of the engine, published after every applied batch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EngineView {
    pub state: ClientGameState,
    pub round_number: Option<u64>,
    pub time_remaining: u32,
    /// What the user should see: animated while playing, the crash value
    /// once crashed.
    pub multiplier: f64,
    pub crash_point: Option<f64>,
    pub last_crash: Option<f64>,
    pub connection: ConnectionStatus,
    pub consecutive_errors: u32,
    pub balance: Money,
    pub available_balance: Money,
    pub slips: Vec<BetSlip>,
    pub crash_history: Vec<f64>,
    pub server_reports_active_bet: Option<bool>,
    pub login_required: bool,
    pub queued_actions: usize,
    pub auto_bet: Option<Money>,
    pub resyncs_scheduled: u32,
    pub message: Option<String>,
}

impl EngineView {
    pub fn active_slips(&self) -> impl Iterator<Item = &BetSlip> {
        self.slips.iter().filter(|slip| slip.is_active())
    }

    pub fn can_place_bet(&self) -> bool {
        self.state == ClientGameState::Waiting && self.time_remaining > 0
    }

    pub fn can_cash_out(&self) -> bool {
        self.state == ClientGameState::Playing && self.active_slips().next().is_some()
    }
}

/// Cloneable front door to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<EngineView>,
}

impl EngineHandle {
    /// Resolves once the server confirmed or rejected the bet.
    pub async fn place_bet(&self, stake: Money) -> Result<BetSlip, CommandError> {
        self.request(|reply| Command::PlaceBet { stake, reply }).await
    }

    pub async fn cash_out(&self, slip_id: SlipId) -> Result<BetSlip, CommandError> {
        self.request(|reply| Command::CashOut { slip_id, reply }).await
    }

    pub fn force_resync(&self) -> Result<(), CommandError> {
        self.send(Command::ForceResync)
    }

    /// `None` turns auto-bet off.
    pub fn set_auto_bet(&self, stake: Option<Money>) -> Result<(), CommandError> {
        self.send(Command::SetAutoBet { stake })
    }

    pub fn session_restored(&self, token: impl Into<String>) -> Result<(), CommandError> {
        self.send(Command::SessionRestored {
            token: token.into(),
        })
    }

    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    pub fn view(&self) -> EngineView {
        self.view.borrow().clone()
    }

    /// Waits for the next published view.
    pub async fn changed(&mut self) -> Result<EngineView, CommandError> {
        self.view
            .changed()
            .await
            .map_err(|_| CommandError::EngineStopped)?;
        Ok(self.view.borrow_and_update().clone())
    }

    fn send(&self, command: Command) -> Result<(), CommandError> {
        self.commands
            .send(command)
            .map_err(|_| CommandError::EngineStopped)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, CommandError> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply))?;
        response.await.map_err(|_| CommandError::EngineStopped)?
    }
}

/// The single-task reconciliation loop.
pub struct Engine<A> {
    api: Rc<A>,
    commands: mpsc::UnboundedReceiver<Command>,
    view_tx: watch::Sender<EngineView>,
    reconciler: Reconciler,
    ledger: Ledger,
    scheduler: PollScheduler,
    animator: Animator,
    stall_limits: StallThresholds,
    history_len: usize,
    in_flight: FuturesUnordered<LocalBoxFuture<'static, Completion>>,
    crash_history: Vec<f64>,
    login_required: bool,
    queued_stakes: Vec<Money>,
    auto_bet: Option<Money>,
    auto_bet_round: Option<u64>,
    message: Option<String>,
    started_at: Instant,
}

impl<A: GameApi + 'static> Engine<A> {
    pub fn new(api: Rc<A>, config: EngineConfig) -> (Self, EngineHandle) {
        let now = Instant::now();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (view_tx, view) = watch::channel(EngineView::default());
        let engine = Self {
            api,
            commands,
            view_tx,
            reconciler: Reconciler::new(now, config.crash_display, config.recovery_delay),
            ledger: Ledger::new(
                now,
                config.min_stake,
                config.bet_mode,
                config.retained_settled_slips,
            ),
            scheduler: PollScheduler::new(config.scheduler_settings()),
            animator: Animator::new(config.frame_period, config.growth_per_sec),
            stall_limits: config.stall_thresholds(),
            history_len: config.history_len,
            in_flight: FuturesUnordered::new(),
            crash_history: Vec::new(),
            login_required: false,
            queued_stakes: Vec::new(),
            auto_bet: None,
            auto_bet_round: None,
            message: None,
            started_at: now,
        };
        let handle = EngineHandle {
            commands: commands_tx,
            view,
        };
        (engine, handle)
    }

    /// Timers still armed. Zero once `run` has returned.
    pub fn timers_armed(&self) -> usize {
        self.scheduler
            .timers()
            .into_iter()
            .chain([self.reconciler.phase_timer(), self.animator.frame_timer()])
            .filter(|timer| timer.is_armed())
            .count()
    }

    /// Runs until `Stop` arrives or every handle is dropped.
    pub async fn run(&mut self) {
        let now = Instant::now();
        info!("engine started");
        self.started_at = now;
        self.scheduler.start(now);
        self.resync(now, "startup");
        self.publish();

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                biased;
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Stop) | None => break,
                        Some(command) => self.handle_command(Instant::now(), command),
                    }
                }
                Some(completion) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.handle_completion(Instant::now(), completion);
                }
                _ = sleep_until(deadline) => {
                    self.handle_timers(Instant::now());
                }
            }
            self.publish();
        }

        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.scheduler.stop();
        self.reconciler.stop();
        self.animator.stop();
        let abandoned = self.in_flight.len();
        self.in_flight = FuturesUnordered::new();
        info!(abandoned, "engine stopped");
        self.publish();
    }

    fn next_deadline(&self) -> Option<Instant> {
        timer::earliest(
            self.scheduler
                .timers()
                .into_iter()
                .chain([self.reconciler.phase_timer(), self.animator.frame_timer()]),
        )
    }

    fn spawn(&mut self, work: impl Future<Output = Completion> + 'static) {
        self.in_flight.push(work.boxed_local());
    }

    fn spawn_poll(&mut self) {
        let api = Rc::clone(&self.api);
        self.spawn(async move { Completion::Snapshot(api.fetch_snapshot().await) });
    }

    fn spawn_balance(&mut self) {
        let api = Rc::clone(&self.api);
        self.spawn(async move { Completion::Balance(api.fetch_balance().await) });
    }

    fn spawn_history(&mut self) {
        let api = Rc::clone(&self.api);
        self.spawn(async move { Completion::History(api.fetch_history().await) });
    }

    fn spawn_active_bet_check(&mut self, round: u64) {
        let api = Rc::clone(&self.api);
        self.spawn(async move {
            Completion::ActiveBet {
                round,
                result: api.check_active_bet(round).await,
            }
        });
    }

    fn resync(&mut self, now: Instant, reason: &'static str) {
        info!(reason, "resynchronizing");
        self.scheduler.begin_resync(now);
        self.spawn_poll();
        self.spawn_balance();
        self.spawn_history();
        if let Some(round) = self.reconciler.round_number() {
            self.spawn_active_bet_check(round);
        }
    }

    fn handle_command(&mut self, now: Instant, command: Command) {
        match command {
            Command::PlaceBet { stake, reply } => self.place_bet(stake, Some(reply)),
            Command::CashOut { slip_id, reply } => self.cash_out(slip_id, reply),
            Command::ForceResync => self.resync(now, "requested"),
            Command::SetAutoBet { stake } => self.set_auto_bet(stake),
            Command::SessionRestored { token } => self.restore_session(now, token),
            // handled by the loop
            Command::Stop => {}
        }
    }

    fn place_bet(&mut self, stake: Money, reply: Option<Reply<BetSlip>>) {
        if self.login_required {
            info!(%stake, "bet queued until login");
            self.queued_stakes.push(stake);
            respond(reply, Err(CommandError::SessionExpired));
            return;
        }
        match self.ledger.begin_place(self.reconciler.gate(), stake) {
            Ok(slip_id) => {
                let api = Rc::clone(&self.api);
                self.spawn(async move {
                    let result = api.place_bet(stake).await;
                    Completion::PlaceBet {
                        slip_id,
                        stake,
                        reply,
                        result,
                    }
                });
            }
            Err(err) => {
                warn!(%stake, %err, "bet rejected locally");
                self.message = Some(err.to_string());
                respond(reply, Err(err));
            }
        }
    }

    fn set_auto_bet(&mut self, stake: Option<Money>) {
        info!(stake = ?stake, "auto-bet set");
        self.auto_bet = stake;
        self.message = Some(match stake {
            Some(stake) => format!("Auto-bet {stake} each round"),
            None => "Auto-bet off".to_string(),
        });
        self.place_auto_bet();
    }

    /// Bets the auto-bet stake once per round, as soon as its countdown is
    /// known.
    fn place_auto_bet(&mut self) {
        let Some(stake) = self.auto_bet else {
            return;
        };
        let gate = self.reconciler.gate();
        let Some(round) = gate.round else {
            return;
        };
        if gate.state != ClientGameState::Waiting
            || gate.time_remaining == 0
            || self.login_required
            || self.auto_bet_round >= Some(round)
        {
            return;
        }
        self.auto_bet_round = Some(round);
        let available = self.ledger.available_balance();
        if available < stake {
            warn!(round, %stake, %available, "auto-bet stopped: insufficient balance");
            self.auto_bet = None;
            self.message = Some(format!("Auto-bet stopped: {available} available"));
            return;
        }
        debug!(round, %stake, "auto-bet");
        self.place_bet(stake, None);
    }

    /// The multiplier quoted in a cash-out request.
    fn cash_out_multiplier(&self) -> f64 {
        if self.animator.is_running() {
            self.animator.rendered()
        } else {
            self.reconciler.live_multiplier()
        }
    }

    fn cash_out(&mut self, slip_id: SlipId, reply: Reply<BetSlip>) {
        let multiplier = self.cash_out_multiplier();
        match self
            .ledger
            .begin_cash_out(self.reconciler.gate(), &slip_id, multiplier)
        {
            Ok(CashOutTicket { slip_id, request }) => {
                let api = Rc::clone(&self.api);
                self.spawn(async move {
                    let result = api.cash_out(request).await;
                    Completion::CashOut {
                        slip_id,
                        multiplier,
                        reply,
                        result,
                    }
                });
            }
            Err(err) => {
                warn!(slip = %slip_id, %err, "cash-out rejected locally");
                self.message = Some(err.to_string());
                let _ = reply.send(Err(err));
            }
        }
    }

    fn restore_session(&mut self, now: Instant, token: String) {
        self.api.restore_session(token);
        self.login_required = false;
        let queued = std::mem::take(&mut self.queued_stakes);
        info!(replaying = queued.len(), "session restored");
        for stake in queued {
            self.place_bet(stake, None);
        }
        self.resync(now, "session restored");
    }

    fn handle_completion(&mut self, now: Instant, completion: Completion) {
        match completion {
            Completion::Snapshot(Ok(snapshot)) => self.apply_snapshot(now, &snapshot),
            Completion::Snapshot(Err(err)) => {
                debug!(%err, "poll error");
                if self
                    .scheduler
                    .record_poll_failure(now, self.reconciler.state())
                {
                    self.scheduler
                        .request_resync(now, "consecutive poll failures");
                }
            }
            Completion::Balance(Ok(balance)) => self.ledger.sync_balance(now, balance),
            Completion::Balance(Err(err)) => warn!(%err, "balance fetch failed"),
            Completion::History(Ok(mut history)) => {
                history.truncate(self.history_len);
                self.crash_history = history;
            }
            Completion::History(Err(err)) => warn!(%err, "history fetch failed"),
            Completion::ActiveBet {
                round,
                result: Ok(has_active_bet),
            } => self
                .ledger
                .record_active_bet_check(now, round, has_active_bet),
            Completion::ActiveBet {
                round,
                result: Err(err),
            } => warn!(round, %err, "active bet check failed"),
            Completion::PlaceBet {
                slip_id,
                stake,
                reply,
                result,
            } => self.finish_place_bet(now, slip_id, stake, reply, result),
            Completion::CashOut {
                slip_id,
                multiplier,
                reply,
                result,
            } => self.finish_cash_out(now, slip_id, multiplier, reply, result),
        }
    }

    fn finish_place_bet(
        &mut self,
        now: Instant,
        slip_id: SlipId,
        stake: Money,
        reply: Option<Reply<BetSlip>>,
        result: Result<PlacedBet, ApiError>,
    ) {
        match result {
            Ok(placed) => {
                self.ledger.confirm_place(now, &slip_id, placed);
                self.message = Some(format!("Bet of {stake} placed"));
                let slip = self
                    .ledger
                    .slip(&slip_id)
                    .cloned()
                    .ok_or(CommandError::UnknownSlip(slip_id));
                respond(reply, slip);
            }
            Err(err) => {
                self.ledger.rollback_place(&slip_id);
                if err.is_unauthorized() {
                    self.login_required = true;
                    self.queued_stakes.push(stake);
                    warn!(%stake, "session expired; bet queued until login");
                } else {
                    error!(slip = %slip_id, %stake, %err, "bet failed");
                    // The server may have taken the stake anyway.
                    if !matches!(err, ApiError::Rejected { .. }) {
                        self.spawn_balance();
                    }
                }
                let err = CommandError::from_api(err, &slip_id);
                self.message = Some(err.to_string());
                respond(reply, Err(err));
            }
        }
    }

    fn finish_cash_out(
        &mut self,
        now: Instant,
        slip_id: SlipId,
        multiplier: f64,
        reply: Reply<BetSlip>,
        result: Result<CashedOut, ApiError>,
    ) {
        let outcome = match result {
            Ok(cashed) => match self
                .ledger
                .complete_cash_out(now, &slip_id, multiplier, cashed)
            {
                Some(slip) => {
                    if let Some(payout) = slip.payout {
                        self.message = Some(format!("Cashed out {payout}"));
                    }
                    Ok(slip.clone())
                }
                None => Err(CommandError::UnknownSlip(slip_id)),
            },
            Err(err) => {
                let status = self.ledger.fail_cash_out(&slip_id);
                if err.is_unauthorized() {
                    self.login_required = true;
                }
                error!(slip = %slip_id, %err, ?status, "cash-out failed");
                let err = CommandError::from_api(err, &slip_id);
                self.message = Some(err.to_string());
                Err(err)
            }
        };
        // the server owns the balance
        self.spawn_balance();
        self.ledger.prune();
        let _ = reply.send(outcome);
    }

    fn apply_snapshot(&mut self, now: Instant, snapshot: &RoundSnapshot) {
        self.scheduler
            .record_poll_success(now, self.reconciler.state());
        match self.reconciler.reconcile(now, snapshot) {
            Reconciliation::Stale {
                local_round,
                snapshot_round,
            } => {
                debug!(local_round, snapshot_round, "stale snapshot ignored");
            }
            Reconciliation::Applied { delta, events } => {
                self.apply_round_changes(now, events);
                self.steer_animation(&delta);
            }
        }
        self.scheduler.retune(now, self.reconciler.state());
    }

    fn steer_animation(&mut self, delta: &StateDelta) {
        if !self.animator.is_running() {
            return;
        }
        if let Some(multiplier) = delta.live_multiplier {
            self.animator.set_target(multiplier);
        }
        if let Some(crash_point) = delta.crash_point {
            self.animator.set_cap(crash_point);
        }
    }

    fn apply_round_changes(&mut self, now: Instant, events: Vec<RoundEvent>) {
        for event in events {
            match event {
                RoundEvent::NewRound { finished, current } => {
                    self.ledger.settle_round(finished);
                    if !self.reconciler.state().is_settling() {
                        self.animator.reset();
                    }
                    self.spawn_active_bet_check(current);
                }
                RoundEvent::EnteredPlaying {
                    round,
                    multiplier,
                    crash_point,
                } => {
                    self.animator.start(now, multiplier, crash_point);
                    self.spawn_active_bet_check(round);
                }
                RoundEvent::Crashed {
                    round,
                    value,
                    source,
                } => {
                    self.animator.settle_at(value);
                    let lost = self.ledger.settle_round(round);
                    if !lost.is_empty() {
                        self.message = Some(format!(
                            "Crashed at {value:.2}x: {} bet(s) lost",
                            lost.len()
                        ));
                    }
                    debug!(round, ?source, "fetching crash history");
                    self.spawn_history();
                    self.scheduler.schedule_history_retry(now);
                }
                RoundEvent::CountdownChanged { seconds } => {
                    debug!(seconds, "countdown");
                }
                RoundEvent::RecoveryStarted => self.animator.reset(),
                RoundEvent::RecoveryFinished => self.resync(now, "recovery finished"),
            }
        }
        self.place_auto_bet();
        self.ledger.prune();
    }

    fn handle_timers(&mut self, now: Instant) {
        if let Some((delta, event)) = self.reconciler.on_phase_timer(now) {
            debug!(?delta, "phase timer");
            self.apply_round_changes(now, vec![event]);
        }
        self.animator.on_frame(now);
        for work in self.scheduler.due(now) {
            match work {
                ScheduledWork::Poll => self.spawn_poll(),
                ScheduledWork::WatchdogCheck => self.check_watchdogs(now),
                ScheduledWork::SafetyNet => self.resync(now, "safety net"),
                ScheduledWork::Resync => self.resync(now, "watchdog"),
                ScheduledWork::HistoryRetry => self.spawn_history(),
            }
        }
        self.scheduler.retune(now, self.reconciler.state());
    }

    fn check_watchdogs(&mut self, now: Instant) {
        let inputs = StallInputs {
            now,
            watching_since: self.started_at,
            last_success_at: self.scheduler.health().last_success_at,
            state: self.reconciler.state(),
            entered_state_at: self.reconciler.entered_state_at(),
            countdown: self.reconciler.time_remaining(),
            countdown_at_entry: self.reconciler.countdown_at_entry(),
            countdown_changed_at: self.reconciler.countdown_changed_at(),
            crash_point: self.reconciler.crash_point(),
            has_active_slips: self.ledger.active_slips().next().is_some(),
            bet_state_refreshed_at: self.ledger.refreshed_at(),
        };
        let stalls = detect_stalls(&inputs, &self.stall_limits);
        for stall in &stalls {
            warn!(stall = ?stall, state = %inputs.state, "watchdog tripped");
            if *stall == StallKind::NoSuccessfulPoll {
                self.scheduler
                    .mark_disconnected(now, self.reconciler.state());
            }
        }
        if !stalls.is_empty() {
            self.scheduler.request_resync(now, "watchdog");
        }
    }

    fn render_multiplier(&self) -> f64 {
        match self.reconciler.state() {
            ClientGameState::Playing => {
                if self.animator.is_running() {
                    self.animator.rendered()
                } else {
                    self.reconciler.live_multiplier()
                }
            }
            ClientGameState::Crashed => self
                .reconciler
                .last_crash()
                .unwrap_or(self.animator.rendered()),
            ClientGameState::Waiting | ClientGameState::Recovering => SAFE_MULTIPLIER,
        }
    }

    fn publish(&self) {
        let health = self.scheduler.health();
        let view = EngineView {
            state: self.reconciler.state(),
            round_number: self.reconciler.round_number(),
            time_remaining: self.reconciler.time_remaining(),
            multiplier: self.render_multiplier(),
            crash_point: self.reconciler.crash_point(),
            last_crash: self.reconciler.last_crash(),
            connection: health.status,
            consecutive_errors: health.consecutive_errors,
            balance: self.ledger.balance(),
            available_balance: self.ledger.available_balance(),
            slips: self.ledger.slips().to_vec(),
            crash_history: self.crash_history.clone(),
            server_reports_active_bet: self.ledger.server_reports_active_bet(),
            login_required: self.login_required,
            queued_actions: self.queued_stakes.len(),
            auto_bet: self.auto_bet,
            resyncs_scheduled: self.scheduler.resyncs_scheduled(),
            message: self.message.clone(),
        };
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }
}

fn respond(reply: Option<Reply<BetSlip>>, result: Result<BetSlip, CommandError>) {
    if let Some(reply) = reply {
        let _ = reply.send(result);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
