use crate::{
    FakeGameApi,
    advance,
    run_engine,
    settle,
};
use crash_client::{
    ledger::SlipStatus,
    money::Money,
    reconciler::ClientGameState,
    snapshot::RoundSnapshot,
};

#[tokio::test(start_paused = true)]
async fn crash__loses_active_slips_without_touching_the_balance() {
    // given
    let api = FakeGameApi::serving(RoundSnapshot::waiting(8, 5.0), Money::from_units(100));

    run_engine(api.clone(), move |handle| async move {
        settle().await;
        let slip = handle.place_bet(Money::from_units(30)).await.unwrap();
        api.serve(RoundSnapshot::playing(8, 1.05));
        advance(600).await;
        let balance_in_flight = handle.view().balance;

        // when
        api.serve(RoundSnapshot::crashed(8, 1.10));
        advance(600).await;

        // then
        let view = handle.view();
        assert_eq!(view.state, ClientGameState::Crashed);
        assert_eq!(view.last_crash, Some(1.10));
        assert_eq!(view.multiplier, 1.10);
        let settled = view.slips.iter().find(|s| s.id == slip.id).unwrap();
        assert_eq!(settled.status, SlipStatus::Lost);
        assert_eq!(settled.payout, None);
        assert_eq!(view.balance, balance_in_flight);
        assert_eq!(view.balance, Money::from_units(70));
        assert!(api.calls().history >= 2);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn safeguard__crashes_locally_once_the_target_is_reached() {
    // given
    let api = FakeGameApi::serving(
        RoundSnapshot::playing(4, 1.5).with_crash_point(2.40),
        Money::from_units(100),
    );

    run_engine(api.clone(), move |handle| async move {
        settle().await;
        assert_eq!(handle.view().state, ClientGameState::Playing);

        // when
        api.serve(RoundSnapshot::playing(4, 2.47).with_crash_point(2.40));
        advance(600).await;

        // then
        let view = handle.view();
        assert_eq!(view.state, ClientGameState::Crashed);
        assert_eq!(view.last_crash, Some(2.40));
        assert_eq!(view.multiplier, 2.40);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn crash__is_shown_then_recovers_into_the_next_countdown() {
    // given
    let api = FakeGameApi::serving(RoundSnapshot::waiting(2, 5.0), Money::from_units(100));

    run_engine(api.clone(), move |handle| async move {
        settle().await;
        api.serve(RoundSnapshot::playing(2, 1.3));
        advance(600).await;
        api.serve(RoundSnapshot::crashed(2, 1.9));
        advance(600).await;
        assert_eq!(handle.view().state, ClientGameState::Crashed);

        // when
        api.serve(RoundSnapshot::waiting(3, 9.0));
        advance(3000).await;
        let recovering = handle.view();
        advance(1500).await;
        let next_round = handle.view();

        // then
        assert_eq!(recovering.state, ClientGameState::Recovering);
        assert_eq!(recovering.multiplier, 1.0);
        assert_eq!(next_round.state, ClientGameState::Waiting);
        assert_eq!(next_round.round_number, Some(3));
        assert_eq!(next_round.time_remaining, 9);
        assert_eq!(next_round.last_crash, Some(1.9));
        assert!(next_round.can_place_bet());
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn stale_round__is_ignored() {
    // given
    let api = FakeGameApi::serving(RoundSnapshot::waiting(6, 5.0), Money::from_units(100));

    run_engine(api.clone(), move |handle| async move {
        settle().await;
        let before = handle.view();

        // when
        api.serve(RoundSnapshot::waiting(5, 3.0));
        advance(1200).await;

        // then
        let after = handle.view();
        assert_eq!(after.round_number, Some(6));
        assert_eq!(after.time_remaining, before.time_remaining);
        assert_eq!(after.state, before.state);
        assert!(api.calls().polls >= 3);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn new_round__settles_slips_of_an_unseen_flight() {
    // given
    let api = FakeGameApi::serving(RoundSnapshot::waiting(8, 5.0), Money::from_units(100));

    run_engine(api.clone(), move |handle| async move {
        settle().await;
        let slip = handle.place_bet(Money::from_units(30)).await.unwrap();

        // when
        api.serve(RoundSnapshot::waiting(9, 7.0));
        advance(600).await;

        // then
        let view = handle.view();
        assert_eq!(view.round_number, Some(9));
        assert_eq!(view.time_remaining, 7);
        assert_eq!(view.state, ClientGameState::Waiting);
        let settled = view.slips.iter().find(|s| s.id == slip.id).unwrap();
        assert_eq!(settled.status, SlipStatus::Lost);
        assert!(api.calls().active_bet_checks.contains(&9));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn active_bet_check__reflects_the_server_answer() {
    // given
    let api = FakeGameApi::serving(RoundSnapshot::waiting(8, 5.0), Money::from_units(100));
    api.set_active_bet(true);

    run_engine(api.clone(), move |handle| async move {
        settle().await;

        // when
        api.serve(RoundSnapshot::playing(8, 1.02));
        advance(600).await;

        // then
        assert!(api.calls().active_bet_checks.contains(&8));
        assert_eq!(handle.view().server_reports_active_bet, Some(true));
    })
    .await;
}
