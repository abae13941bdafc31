use clap::Parser;
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use crash_client::{
    config::EngineConfig,
    engine::{
        Engine,
        EngineHandle,
        EngineView,
    },
    error::CommandError,
    http_client::GameApiClient,
    ledger::BetMode,
    money::Money,
};
use crossterm::event::EventStream;
use futures::{
    FutureExt,
    StreamExt,
    future::LocalBoxFuture,
    stream::FuturesUnordered,
};
use std::{
    ops::ControlFlow,
    rc::Rc,
};
use tracing::{
    info,
    warn,
};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling,
};
use tracing_subscriber::{
    EnvFilter,
    fmt,
};

mod ui;

/// Terminal client for the crash game.
#[derive(Parser, Debug)]
#[command(name = "crash-client", version)]
struct Args {
    /// Game server base URL
    #[arg(long, env = "CRASH_CLIENT_BASE_URL", default_value = "http://localhost:8000")]
    base_url: String,
    #[arg(long, env = "CRASH_CLIENT_USER_ID", default_value = "player_1")]
    user_id: String,
    /// Session token sent as a bearer credential
    #[arg(long, env = "CRASH_CLIENT_TOKEN", hide_env_values = true)]
    token: Option<String>,
    /// Read the session token from the terminal without echo
    #[arg(long, conflicts_with = "token")]
    prompt_token: bool,
    /// Allow only one active bet at a time
    #[arg(long, env = "CRASH_CLIENT_SINGLE_BET")]
    single_bet: bool,
    #[arg(long, env = "CRASH_CLIENT_MIN_STAKE")]
    min_stake: Option<Money>,
    /// JSON file overriding engine timings
    #[arg(long, env = "CRASH_CLIENT_CONFIG")]
    config: Option<String>,
    #[arg(long, env = "CRASH_CLIENT_LOG_DIR", default_value = "~/.crash-client/logs")]
    log_dir: String,
}

fn init_tracing(log_dir: &str) -> Result<WorkerGuard> {
    let dir = shellexpand::tilde(log_dir).into_owned();
    std::fs::create_dir_all(&dir)
        .wrap_err_with(|| format!("failed to create log directory {dir}"))?;
    let (writer, guard) = tracing_appender::non_blocking(rolling::daily(&dir, "crash-client.log"));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| eyre!("failed to install tracing subscriber: {e}"))?;
    Ok(guard)
}

fn engine_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_json_file(shellexpand::tilde(path).as_ref())?,
        None => EngineConfig::default(),
    };
    if args.single_bet {
        config.bet_mode = BetMode::Single;
    }
    if let Some(min_stake) = args.min_stake {
        config.min_stake = min_stake;
    }
    config.validate()?;
    Ok(config)
}

async fn run_app(api: GameApiClient, config: EngineConfig) -> Result<()> {
    let (mut engine, handle) = Engine::new(Rc::new(api), config);
    let mut ui_state = ui::UiState::default();

    ui::terminal_enter(&mut ui_state)?;
    info!("UI ready");
    let ((), res) = tokio::join!(engine.run(), ui_loop(handle, &mut ui_state));
    ui::terminal_exit()?;
    info!(timers_armed = engine.timers_armed(), "engine shut down");
    res
}

async fn ui_loop(mut handle: EngineHandle, ui_state: &mut ui::UiState) -> Result<()> {
    let mut input = EventStream::new();
    let res = drive_ui(&mut handle, ui_state, &mut input).await;
    handle.stop();
    res
}

async fn drive_ui(
    handle: &mut EngineHandle,
    ui_state: &mut ui::UiState,
    input: &mut EventStream,
) -> Result<()> {
    let mut view: EngineView = handle.view();
    // bet and cash-out round trips resolve here so input stays live
    let mut in_flight: FuturesUnordered<LocalBoxFuture<'static, Result<(), CommandError>>> =
        FuturesUnordered::new();
    ui::draw(ui_state, &view).wrap_err("initial draw failed")?;

    loop {
        tokio::select! {
            changed = handle.changed() => {
                match changed {
                    Ok(next) => view = next,
                    Err(_) => break,
                }
            }
            Some(outcome) = in_flight.next(), if !in_flight.is_empty() => {
                if report(outcome).is_break() {
                    break;
                }
            }
            maybe_event = input.next() => {
                let Some(event) = maybe_event else {
                    break;
                };
                let event = event.wrap_err("terminal input failed")?;
                let Some(action) = ui::interpret_event(ui_state, &view, event) else {
                    continue;
                };
                let outcome = match action {
                    ui::UserEvent::Quit => break,
                    ui::UserEvent::Redraw => Ok(()),
                    ui::UserEvent::PlaceBet(stake) => {
                        let handle = handle.clone();
                        in_flight.push(async move { handle.place_bet(stake).await.map(drop) }.boxed_local());
                        Ok(())
                    }
                    ui::UserEvent::CashOut(slip_id) => {
                        let handle = handle.clone();
                        in_flight.push(async move { handle.cash_out(slip_id).await.map(drop) }.boxed_local());
                        Ok(())
                    }
                    ui::UserEvent::ToggleAutoBet(stake) => handle.set_auto_bet(stake),
                    ui::UserEvent::Resync => handle.force_resync(),
                    ui::UserEvent::SubmitToken(token) => handle.session_restored(token),
                };
                if report(outcome).is_break() {
                    break;
                }
                view = handle.view();
            }
            _ = tokio::signal::ctrl_c() => break,
        }
        ui::draw(ui_state, &view).wrap_err("draw failed")?;
    }
    Ok(())
}

fn report(outcome: Result<(), CommandError>) -> ControlFlow<()> {
    match outcome {
        Ok(()) => ControlFlow::Continue(()),
        Err(CommandError::EngineStopped) => ControlFlow::Break(()),
        // the engine reports these through the view
        Err(err) => {
            warn!(%err, "command failed");
            ControlFlow::Continue(())
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    let _log_guard = init_tracing(&args.log_dir)?;
    info!(base_url = %args.base_url, "starting crash-client");

    let config = engine_config(&args)?;
    let token = if args.prompt_token {
        Some(rpassword::prompt_password("Session token: ").wrap_err("failed to read session token")?)
    } else {
        args.token.clone()
    };
    let api = GameApiClient::new(args.base_url.as_str(), args.user_id.as_str(), token)?;
    run_app(api, config).await
}
