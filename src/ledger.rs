use crate::{
    api::{
        CashOutRequest,
        CashedOut,
        PlacedBet,
    },
    error::CommandError,
    money::Money,
    reconciler::{
        ClientGameState,
        PhaseGate,
    },
};
use chrono::{
    DateTime,
    Utc,
};
use rand::{
    Rng,
    distr::Alphanumeric,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::fmt;
use tokio::time::Instant;
use tracing::{
    debug,
    info,
    warn,
};

const SLIP_SUFFIX_LEN: usize = 10;

#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct SlipId(String);

impl SlipId {
    pub fn new(id: impl Into<String>) -> Self {
        SlipId(id.into())
    }

    pub fn generate() -> Self {
        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(SLIP_SUFFIX_LEN)
            .map(|b| char::from(b).to_ascii_lowercase())
            .collect();
        SlipId(format!("{:x}-{suffix}", Utc::now().timestamp_millis()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SlipStatus {
    Active,
    Cashed,
    Lost,
}

impl SlipStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SlipStatus::Active)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetMode {
    /// At most one active slip.
    Single,
    /// Any number of active slips, all in the same round.
    #[default]
    Multi,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct CashOutAttempt {
    /// The round was settled while the request was out.
    loss_deferred: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BetSlip {
    pub id: SlipId,
    pub backend_id: Option<String>,
    pub round_id: u64,
    pub stake: Money,
    pub status: SlipStatus,
    pub placed_at: DateTime<Utc>,
    pub cashed_at: Option<DateTime<Utc>>,
    pub cashout_multiplier: Option<f64>,
    pub payout: Option<Money>,
    cash_out: Option<CashOutAttempt>,
}

impl BetSlip {
    pub fn is_confirmed(&self) -> bool {
        self.backend_id.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.status == SlipStatus::Active
    }

    pub fn cash_out_in_flight(&self) -> bool {
        self.cash_out.is_some()
    }
}

/// A validated cash-out, ready to send.
#[derive(Clone, Debug, PartialEq)]
pub struct CashOutTicket {
    pub slip_id: SlipId,
    pub request: CashOutRequest,
}

/// Owns every bet slip and the server-confirmed balance.
pub struct Ledger {
    slips: Vec<BetSlip>,
    balance: Money,
    min_stake: Money,
    mode: BetMode,
    retained_settled: usize,
    server_reports_active_bet: Option<bool>,
    refreshed_at: Instant,
}

impl Ledger {
    pub fn new(now: Instant, min_stake: Money, mode: BetMode, retained_settled: usize) -> Self {
        Self {
            slips: Vec::new(),
            balance: Money::ZERO,
            min_stake,
            mode,
            retained_settled,
            server_reports_active_bet: None,
            refreshed_at: now,
        }
    }

    pub fn balance(&self) -> Money {
        self.balance
    }

    /// Balance minus stakes the server has not confirmed yet.
    pub fn available_balance(&self) -> Money {
        let reserved: Money = self
            .slips
            .iter()
            .filter(|slip| !slip.is_confirmed() && slip.is_active())
            .map(|slip| slip.stake)
            .sum();
        self.balance.saturating_sub(reserved)
    }

    /// Newest first.
    pub fn slips(&self) -> &[BetSlip] {
        &self.slips
    }

    pub fn slip(&self, id: &SlipId) -> Option<&BetSlip> {
        self.slips.iter().find(|slip| &slip.id == id)
    }

    pub fn active_slips(&self) -> impl Iterator<Item = &BetSlip> {
        self.slips.iter().filter(|slip| slip.is_active())
    }

    pub fn has_active_slip_in(&self, round: u64) -> bool {
        self.active_slips().any(|slip| slip.round_id == round)
    }

    pub fn server_reports_active_bet(&self) -> Option<bool> {
        self.server_reports_active_bet
    }

    /// When bet state last agreed with the server.
    pub fn refreshed_at(&self) -> Instant {
        self.refreshed_at
    }

    pub fn sync_balance(&mut self, now: Instant, balance: Money) {
        if self.balance != balance {
            debug!(%balance, "balance synced");
        }
        self.balance = balance;
        self.refreshed_at = now;
    }

    /// Validates a wager and records it optimistically.
    pub fn begin_place(
        &mut self,
        gate: PhaseGate,
        stake: Money,
    ) -> Result<SlipId, CommandError> {
        if gate.state != ClientGameState::Waiting || gate.time_remaining == 0 {
            return Err(CommandError::InvalidPhase { state: gate.state });
        }
        let round_id = gate.round.ok_or(CommandError::RoundUnknown)?;
        if stake.is_zero() || stake < self.min_stake {
            return Err(CommandError::InvalidStake {
                stake,
                min: self.min_stake,
            });
        }
        let available = self.available_balance();
        if stake > available {
            return Err(CommandError::InsufficientBalance { stake, available });
        }
        let conflicting = match self.mode {
            BetMode::Single => self.active_slips().next().is_some(),
            BetMode::Multi => self.active_slips().any(|slip| slip.round_id != round_id),
        };
        if conflicting {
            return Err(CommandError::ActiveBetExists);
        }

        let id = SlipId::generate();
        info!(slip = %id, round = round_id, %stake, "bet placed optimistically");
        self.slips.insert(
            0,
            BetSlip {
                id: id.clone(),
                backend_id: None,
                round_id,
                stake,
                status: SlipStatus::Active,
                placed_at: Utc::now(),
                cashed_at: None,
                cashout_multiplier: None,
                payout: None,
                cash_out: None,
            },
        );
        Ok(id)
    }

    pub fn confirm_place(&mut self, now: Instant, id: &SlipId, placed: PlacedBet) {
        self.balance = placed.balance;
        self.refreshed_at = now;
        match self.slip_mut(id) {
            Some(slip) => {
                info!(slip = %id, bet = %placed.bet_id, "bet confirmed");
                if placed.amount != slip.stake {
                    warn!(slip = %id, requested = %slip.stake, accepted = %placed.amount, "server accepted a different stake");
                    slip.stake = placed.amount;
                }
                slip.backend_id = Some(placed.bet_id);
            }
            None => warn!(slip = %id, "confirmation for unknown slip"),
        }
    }

    /// Drops an optimistic slip the server never accepted.
    pub fn rollback_place(&mut self, id: &SlipId) -> Option<BetSlip> {
        let index = self
            .slips
            .iter()
            .position(|slip| &slip.id == id && !slip.is_confirmed())?;
        info!(slip = %id, "optimistic bet rolled back");
        Some(self.slips.remove(index))
    }

    pub fn begin_cash_out(
        &mut self,
        gate: PhaseGate,
        id: &SlipId,
        multiplier: f64,
    ) -> Result<CashOutTicket, CommandError> {
        if gate.state != ClientGameState::Playing {
            return Err(CommandError::InvalidPhase { state: gate.state });
        }
        let slip = self
            .slip_mut(id)
            .ok_or_else(|| CommandError::UnknownSlip(id.clone()))?;
        if slip.status.is_terminal() {
            return Err(CommandError::AlreadySettled(id.clone()));
        }
        if slip.cash_out.is_some() {
            return Err(CommandError::CashOutInFlight(id.clone()));
        }
        if gate.round != Some(slip.round_id) {
            return Err(CommandError::InvalidPhase { state: gate.state });
        }
        let bet_id = slip
            .backend_id
            .clone()
            .ok_or_else(|| CommandError::AwaitingConfirmation(id.clone()))?;

        slip.cash_out = Some(CashOutAttempt {
            loss_deferred: false,
        });
        info!(slip = %id, round = slip.round_id, multiplier, "cash-out requested");
        Ok(CashOutTicket {
            slip_id: id.clone(),
            request: CashOutRequest {
                round_id: slip.round_id,
                multiplier_at_request: multiplier,
                bet_id,
            },
        })
    }

    pub fn complete_cash_out(
        &mut self,
        now: Instant,
        id: &SlipId,
        requested_multiplier: f64,
        cashed: CashedOut,
    ) -> Option<&BetSlip> {
        self.balance = cashed.balance;
        self.refreshed_at = now;
        let slip = self.slip_mut(id)?;
        slip.cash_out = None;
        if slip.status.is_terminal() {
            warn!(slip = %id, status = ?slip.status, "cash-out landed on a settled slip");
            return Some(&*slip);
        }
        let multiplier = requested_multiplier;
        let payout = slip.stake.times(multiplier);
        if cashed.multiplier.is_some_and(|reported| reported != multiplier)
            || cashed.payout.is_some_and(|reported| reported != payout)
        {
            warn!(
                slip = %id,
                multiplier,
                %payout,
                reported_multiplier = ?cashed.multiplier,
                reported_payout = ?cashed.payout,
                "server reported different cash-out figures"
            );
        }
        slip.status = SlipStatus::Cashed;
        slip.cashed_at = Some(Utc::now());
        slip.cashout_multiplier = Some(multiplier);
        slip.payout = Some(payout);
        info!(slip = %id, multiplier, %payout, "cashed out");
        Some(&*slip)
    }

    /// Clears an in-flight cash-out. A round settled in the meantime makes
    /// the slip lost now.
    pub fn fail_cash_out(&mut self, id: &SlipId) -> Option<SlipStatus> {
        let slip = self.slip_mut(id)?;
        let attempt = slip.cash_out.take()?;
        if attempt.loss_deferred && slip.is_active() {
            slip.status = SlipStatus::Lost;
            info!(slip = %id, round = slip.round_id, "deferred loss applied");
        }
        Some(slip.status)
    }

    /// Marks every active slip from `round` or earlier as lost. Slips with a
    /// cash-out in flight are decided when its response lands.
    pub fn settle_round(&mut self, round: u64) -> Vec<SlipId> {
        let mut lost = Vec::new();
        for slip in self
            .slips
            .iter_mut()
            .filter(|slip| slip.is_active() && slip.round_id <= round)
        {
            match slip.cash_out.as_mut() {
                Some(attempt) => attempt.loss_deferred = true,
                None => {
                    slip.status = SlipStatus::Lost;
                    lost.push(slip.id.clone());
                }
            }
        }
        if !lost.is_empty() {
            info!(round, lost = lost.len(), "round settled");
        }
        lost
    }

    pub fn record_active_bet_check(&mut self, now: Instant, round: u64, has_active_bet: bool) {
        self.refreshed_at = now;
        self.server_reports_active_bet = Some(has_active_bet);
        let local = self
            .active_slips()
            .any(|slip| slip.round_id == round && slip.is_confirmed());
        if local != has_active_bet {
            warn!(round, server = has_active_bet, local, "active bet mismatch");
        }
    }

    /// Drops the oldest settled slips beyond the retention limit.
    pub fn prune(&mut self) {
        let mut settled_seen = 0;
        let retained = self.retained_settled;
        self.slips.retain(|slip| {
            if slip.is_active() {
                return true;
            }
            settled_seen += 1;
            settled_seen <= retained
        });
    }

    fn slip_mut(&mut self, id: &SlipId) -> Option<&mut BetSlip> {
        self.slips.iter_mut().find(|slip| &slip.id == id)
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn waiting(round: u64, seconds: u32) -> PhaseGate {
        PhaseGate {
            state: ClientGameState::Waiting,
            round: Some(round),
            time_remaining: seconds,
        }
    }

    fn playing(round: u64) -> PhaseGate {
        PhaseGate {
            state: ClientGameState::Playing,
            round: Some(round),
            time_remaining: 0,
        }
    }

    fn ledger_with(balance: u64, mode: BetMode) -> (Ledger, Instant) {
        let now = Instant::now();
        let mut ledger = Ledger::new(now, Money::from_units(1), mode, 20);
        ledger.sync_balance(now, Money::from_units(balance));
        (ledger, now)
    }

    fn placed(ledger: &mut Ledger, now: Instant, round: u64, stake: u64) -> SlipId {
        let id = ledger
            .begin_place(waiting(round, 5), Money::from_units(stake))
            .unwrap();
        let balance = ledger.balance().saturating_sub(Money::from_units(stake));
        ledger.confirm_place(
            now,
            &id,
            PlacedBet {
                balance,
                bet_id: format!("b-{id}"),
                amount: Money::from_units(stake),
            },
        );
        id
    }

    #[test]
    fn begin_place__creates_an_active_unconfirmed_slip() {
        // given
        let (mut ledger, _) = ledger_with(100, BetMode::Multi);

        // when
        let id = ledger
            .begin_place(waiting(3, 8), Money::from_units(50))
            .unwrap();

        // then
        let slip = ledger.slip(&id).unwrap();
        assert_eq!(slip.status, SlipStatus::Active);
        assert_eq!(slip.stake, Money::from_units(50));
        assert!(!slip.is_confirmed());
        assert_eq!(ledger.available_balance(), Money::from_units(50));
    }

    #[test]
    fn begin_place__rejects_outside_the_countdown() {
        let (mut ledger, _) = ledger_with(100, BetMode::Multi);

        let expired = ledger.begin_place(waiting(3, 0), Money::from_units(5));
        let live = ledger.begin_place(playing(3), Money::from_units(5));

        assert_eq!(
            expired,
            Err(CommandError::InvalidPhase {
                state: ClientGameState::Waiting
            })
        );
        assert_eq!(
            live,
            Err(CommandError::InvalidPhase {
                state: ClientGameState::Playing
            })
        );
        assert!(ledger.slips().is_empty());
    }

    #[test]
    fn begin_place__rejects_stakes_outside_bounds() {
        let (mut ledger, _) = ledger_with(100, BetMode::Multi);

        let tiny = ledger.begin_place(waiting(3, 5), Money::from_cents(50));
        let huge = ledger.begin_place(waiting(3, 5), Money::from_units(101));

        assert!(matches!(tiny, Err(CommandError::InvalidStake { .. })));
        assert_eq!(
            huge,
            Err(CommandError::InsufficientBalance {
                stake: Money::from_units(101),
                available: Money::from_units(100)
            })
        );
    }

    #[test]
    fn begin_place__reserves_unconfirmed_stakes() {
        let (mut ledger, _) = ledger_with(100, BetMode::Multi);
        ledger
            .begin_place(waiting(3, 5), Money::from_units(70))
            .unwrap();

        let second = ledger.begin_place(waiting(3, 5), Money::from_units(40));

        assert!(matches!(
            second,
            Err(CommandError::InsufficientBalance { .. })
        ));
    }

    #[test]
    fn begin_place__single_mode_allows_one_active_slip() {
        let (mut ledger, now) = ledger_with(100, BetMode::Single);
        placed(&mut ledger, now, 3, 10);

        let second = ledger.begin_place(waiting(3, 5), Money::from_units(10));

        assert_eq!(second, Err(CommandError::ActiveBetExists));
    }

    #[test]
    fn rollback_place__removes_only_unconfirmed_slips() {
        let (mut ledger, now) = ledger_with(100, BetMode::Multi);
        let confirmed = placed(&mut ledger, now, 3, 10);
        let pending = ledger
            .begin_place(waiting(3, 5), Money::from_units(10))
            .unwrap();

        assert!(ledger.rollback_place(&confirmed).is_none());
        assert!(ledger.rollback_place(&pending).is_some());
        assert_eq!(ledger.slips().len(), 1);
        assert_eq!(ledger.balance(), Money::from_units(90));
    }

    #[test]
    fn begin_cash_out__requires_playing_phase() {
        // given
        let (mut ledger, now) = ledger_with(100, BetMode::Multi);
        let id = placed(&mut ledger, now, 3, 50);

        // when
        let result = ledger.begin_cash_out(waiting(3, 7), &id, 1.0);

        // then
        assert_eq!(
            result,
            Err(CommandError::InvalidPhase {
                state: ClientGameState::Waiting
            })
        );
    }

    #[test]
    fn begin_cash_out__guards_against_duplicates() {
        let (mut ledger, now) = ledger_with(100, BetMode::Multi);
        let id = placed(&mut ledger, now, 7, 20);

        let first = ledger.begin_cash_out(playing(7), &id, 1.85);
        let second = ledger.begin_cash_out(playing(7), &id, 1.90);

        assert!(first.is_ok());
        assert_eq!(second, Err(CommandError::CashOutInFlight(id)));
    }

    #[test]
    fn complete_cash_out__pays_stake_times_requested_multiplier() {
        // given
        let (mut ledger, now) = ledger_with(100, BetMode::Multi);
        let id = placed(&mut ledger, now, 7, 20);
        ledger.begin_cash_out(playing(7), &id, 1.85).unwrap();

        // when
        let cashed = CashedOut {
            balance: Money::from_units(117),
            bet_id: None,
            multiplier: None,
            payout: None,
        };
        ledger.complete_cash_out(now, &id, 1.85, cashed);

        // then
        let slip = ledger.slip(&id).unwrap();
        assert_eq!(slip.status, SlipStatus::Cashed);
        assert_eq!(slip.payout, Some(Money::from_units(37)));
        assert_eq!(slip.cashout_multiplier, Some(1.85));
        assert_eq!(ledger.balance(), Money::from_units(117));
        assert_eq!(
            ledger.begin_cash_out(playing(7), &id, 2.0),
            Err(CommandError::AlreadySettled(id))
        );
    }

    #[test]
    fn complete_cash_out__keeps_requested_multiplier_over_reported_figures() {
        // given
        let (mut ledger, now) = ledger_with(100, BetMode::Multi);
        let id = placed(&mut ledger, now, 7, 20);
        ledger.begin_cash_out(playing(7), &id, 1.85).unwrap();

        // when
        let cashed = CashedOut {
            balance: Money::from_units(120),
            bet_id: Some("b-1".to_string()),
            multiplier: Some(2.0),
            payout: Some(Money::from_units(40)),
        };
        let slip = ledger.complete_cash_out(now, &id, 1.85, cashed).cloned();

        // then
        let slip = slip.unwrap();
        assert_eq!(slip.cashout_multiplier, Some(1.85));
        assert_eq!(slip.payout, Some(Money::from_units(37)));
        assert_eq!(slip.payout.unwrap().to_string(), "37.00");
        assert_eq!(ledger.balance(), Money::from_units(120));
    }

    #[test]
    fn settle_round__loses_active_slips_of_finished_rounds_only() {
        let (mut ledger, now) = ledger_with(100, BetMode::Multi);
        let old = placed(&mut ledger, now, 8, 30);
        let balance = ledger.balance();

        let lost = ledger.settle_round(8);
        let again = ledger.settle_round(8);

        assert_eq!(lost, vec![old.clone()]);
        assert!(again.is_empty());
        assert_eq!(ledger.slip(&old).unwrap().status, SlipStatus::Lost);
        assert_eq!(ledger.balance(), balance);
    }

    #[test]
    fn settle_round__defers_slips_with_cash_out_in_flight() {
        // given
        let (mut ledger, now) = ledger_with(100, BetMode::Multi);
        let id = placed(&mut ledger, now, 4, 10);
        ledger.begin_cash_out(playing(4), &id, 1.4).unwrap();

        // when
        let lost = ledger.settle_round(4);
        let status_after_failure = ledger.fail_cash_out(&id);

        // then
        assert!(lost.is_empty());
        assert_eq!(status_after_failure, Some(SlipStatus::Lost));
    }

    #[test]
    fn prune__keeps_active_slips_and_newest_settled() {
        let now = Instant::now();
        let mut ledger = Ledger::new(now, Money::from_units(1), BetMode::Multi, 2);
        ledger.sync_balance(now, Money::from_units(100));
        for round in 1..=4 {
            placed(&mut ledger, now, round, 1);
            ledger.settle_round(round);
        }
        let active = placed(&mut ledger, now, 5, 1);

        ledger.prune();

        let rounds: Vec<u64> = ledger.slips().iter().map(|s| s.round_id).collect();
        assert_eq!(rounds, vec![5, 4, 3]);
        assert!(ledger.slip(&active).is_some());
    }

    #[derive(Clone, Debug)]
    enum Op {
        Place(u64),
        CashOut(usize),
        CashOutLands(usize, bool),
        Settle,
        NextRound,
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u64..30).prop_map(Op::Place),
            (0usize..6).prop_map(Op::CashOut),
            ((0usize..6), any::<bool>()).prop_map(|(i, ok)| Op::CashOutLands(i, ok)),
            Just(Op::Settle),
            Just(Op::NextRound),
        ]
    }

    proptest! {
        #[test]
        fn settled_slips_never_change_status(ops in prop::collection::vec(arb_op(), 1..60)) {
            let now = Instant::now();
            let mut ledger = Ledger::new(now, Money::from_units(1), BetMode::Multi, 100);
            ledger.sync_balance(now, Money::from_units(1_000));
            let mut round = 1;
            let mut terminal: HashMap<SlipId, SlipStatus> = HashMap::new();

            for op in ops {
                match op {
                    Op::Place(stake) => {
                        if let Ok(id) = ledger.begin_place(waiting(round, 5), Money::from_units(stake)) {
                            let balance = ledger.balance();
                            ledger.confirm_place(now, &id, PlacedBet {
                                balance,
                                bet_id: id.to_string(),
                                amount: Money::from_units(stake),
                            });
                        }
                    }
                    Op::CashOut(i) => {
                        if let Some(id) = ledger.slips().get(i).map(|s| s.id.clone()) {
                            let _ = ledger.begin_cash_out(playing(round), &id, 1.5);
                        }
                    }
                    Op::CashOutLands(i, ok) => {
                        let in_flight = ledger
                            .slips()
                            .get(i)
                            .filter(|s| s.cash_out_in_flight())
                            .map(|s| s.id.clone());
                        if let Some(id) = in_flight {
                            if ok {
                                let balance = ledger.balance();
                                ledger.complete_cash_out(now, &id, 1.5, CashedOut {
                                    balance,
                                    bet_id: None,
                                    multiplier: None,
                                    payout: None,
                                });
                            } else {
                                ledger.fail_cash_out(&id);
                            }
                        }
                    }
                    Op::Settle => {
                        ledger.settle_round(round);
                    }
                    Op::NextRound => {
                        ledger.settle_round(round);
                        round += 1;
                    }
                }

                for slip in ledger.slips() {
                    if let Some(previous) = terminal.get(&slip.id) {
                        prop_assert_eq!(*previous, slip.status);
                    } else if slip.status.is_terminal() {
                        terminal.insert(slip.id.clone(), slip.status);
                    }
                    if slip.status == SlipStatus::Cashed {
                        prop_assert!(slip.payout.is_some());
                    }
                }
            }
        }
    }
}
