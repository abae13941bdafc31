use color_eyre::eyre::Result;
use crash_client::{
    engine::EngineView,
    ledger::{
        BetSlip,
        SlipId,
        SlipStatus,
    },
    money::Money,
    reconciler::ClientGameState,
    watchdog::ConnectionStatus,
};
use crossterm::{
    event::{
        Event,
        KeyCode,
        KeyEvent,
        KeyEventKind,
        KeyModifiers,
    },
    terminal::{
        disable_raw_mode,
        enable_raw_mode,
    },
};
use ratatui::{
    prelude::*,
    widgets::*,
};
use std::io::stdout;

const MAX_STAKE_INPUT: usize = 12;

#[derive(Debug, PartialEq)]
pub enum UserEvent {
    Quit,
    Redraw,
    PlaceBet(Money),
    CashOut(SlipId),
    Resync,
    SubmitToken(String),
    /// `None` switches auto-bet off.
    ToggleAutoBet(Option<Money>),
}

#[derive(Default)]
pub struct UiState {
    mode: Mode,
    selected: usize,
    last_stake: Option<Money>,
    terminal: Option<Terminal<CrosstermBackend<std::io::Stdout>>>,
}

#[derive(Clone, Debug, Default, PartialEq)]
enum Mode {
    #[default]
    Normal,
    StakeEntry(String),
    TokenEntry(String),
    QuitModal,
}

pub fn terminal_enter(state: &mut UiState) -> Result<()> {
    enable_raw_mode()?;
    crossterm::execute!(std::io::stdout(), crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout());
    state.terminal = Some(Terminal::new(backend)?);
    Ok(())
}

pub fn terminal_exit() -> Result<()> {
    disable_raw_mode()?;
    crossterm::execute!(std::io::stdout(), crossterm::terminal::LeaveAlternateScreen)?;
    Ok(())
}

pub fn draw(state: &mut UiState, view: &EngineView) -> Result<()> {
    let active = view.active_slips().count();
    state.selected = state.selected.min(active.saturating_sub(1));
    if let Some(mut term) = state.terminal.take() {
        term.draw(|f| ui(f, state, view))?;
        state.terminal = Some(term);
    }
    Ok(())
}

fn selected_slip<'a>(state: &UiState, view: &'a EngineView) -> Option<&'a BetSlip> {
    view.active_slips().nth(state.selected)
}

/// Turns a terminal event into an action against the engine.
pub fn interpret_event(
    state: &mut UiState,
    view: &EngineView,
    event: Event,
) -> Option<UserEvent> {
    let KeyEvent {
        code,
        modifiers,
        kind,
        ..
    } = match event {
        Event::Key(key) => key,
        Event::Resize(..) => return Some(UserEvent::Redraw),
        _ => return None,
    };
    if kind != KeyEventKind::Press {
        return None;
    }
    if modifiers.contains(KeyModifiers::CONTROL) && code == KeyCode::Char('c') {
        return Some(UserEvent::Quit);
    }

    match &mut state.mode {
        Mode::StakeEntry(input) => {
            return match code {
                KeyCode::Esc => {
                    state.mode = Mode::Normal;
                    Some(UserEvent::Redraw)
                }
                KeyCode::Enter => {
                    let stake = input.parse::<Money>().ok();
                    state.mode = Mode::Normal;
                    state.last_stake = stake.or(state.last_stake);
                    Some(stake.map_or(UserEvent::Redraw, UserEvent::PlaceBet))
                }
                KeyCode::Backspace => {
                    input.pop();
                    Some(UserEvent::Redraw)
                }
                KeyCode::Char(c)
                    if (c.is_ascii_digit() || (c == '.' && !input.contains('.')))
                        && input.len() < MAX_STAKE_INPUT =>
                {
                    input.push(c);
                    Some(UserEvent::Redraw)
                }
                _ => None,
            };
        }
        Mode::TokenEntry(input) => {
            return match code {
                KeyCode::Esc => {
                    state.mode = Mode::Normal;
                    Some(UserEvent::Redraw)
                }
                KeyCode::Enter => {
                    let token = std::mem::take(input);
                    state.mode = Mode::Normal;
                    if token.is_empty() {
                        Some(UserEvent::Redraw)
                    } else {
                        Some(UserEvent::SubmitToken(token))
                    }
                }
                KeyCode::Backspace => {
                    input.pop();
                    Some(UserEvent::Redraw)
                }
                KeyCode::Char(c) => {
                    input.push(c);
                    Some(UserEvent::Redraw)
                }
                _ => None,
            };
        }
        Mode::QuitModal => {
            return match code {
                KeyCode::Char('y') | KeyCode::Char('Y') => Some(UserEvent::Quit),
                KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => {
                    state.mode = Mode::Normal;
                    Some(UserEvent::Redraw)
                }
                _ => None,
            };
        }
        Mode::Normal => {}
    }

    match code {
        KeyCode::Char('q') | KeyCode::Esc => {
            state.mode = Mode::QuitModal;
            Some(UserEvent::Redraw)
        }
        KeyCode::Char('b') | KeyCode::Enter => {
            state.mode = Mode::StakeEntry(String::new());
            Some(UserEvent::Redraw)
        }
        KeyCode::Char(c) if c.is_ascii_digit() => {
            state.mode = Mode::StakeEntry(c.to_string());
            Some(UserEvent::Redraw)
        }
        KeyCode::Char('c') | KeyCode::Char(' ') => {
            selected_slip(state, view).map(|slip| UserEvent::CashOut(slip.id.clone()))
        }
        KeyCode::Up | KeyCode::Char('k') => {
            state.selected = state.selected.saturating_sub(1);
            Some(UserEvent::Redraw)
        }
        KeyCode::Down | KeyCode::Char('j') => {
            let active = view.active_slips().count();
            state.selected = (state.selected + 1).min(active.saturating_sub(1));
            Some(UserEvent::Redraw)
        }
        KeyCode::Char('r') => Some(UserEvent::Resync),
        // repeats the last stake entered
        KeyCode::Char('a') => match view.auto_bet {
            Some(_) => Some(UserEvent::ToggleAutoBet(None)),
            None => state.last_stake.map(|stake| UserEvent::ToggleAutoBet(Some(stake))),
        },
        KeyCode::Char('L') if view.login_required => {
            state.mode = Mode::TokenEntry(String::new());
            Some(UserEvent::Redraw)
        }
        _ => None,
    }
}

fn ui(f: &mut Frame, state: &UiState, view: &EngineView) {
    f.render_widget(Clear, f.area());
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(4), // round + connection
            Constraint::Length(5), // multiplier
            Constraint::Length(3), // crash history
            Constraint::Min(6),    // bet slips
            Constraint::Length(5), // status, auto-bet, help
        ])
        .split(f.area());

    draw_round(f, chunks[0], view);
    draw_multiplier(f, chunks[1], view);
    draw_history(f, chunks[2], view);
    draw_slips(f, chunks[3], state, view);
    draw_bottom(f, chunks[4], view);
    draw_modals(f, state, view);
}

fn connection_style(status: ConnectionStatus) -> Style {
    match status {
        ConnectionStatus::Connected => Style::default().fg(Color::Green),
        ConnectionStatus::Disconnected => Style::default().fg(Color::Yellow),
        ConnectionStatus::Reconnecting => Style::default().fg(Color::Red),
    }
}

fn draw_round(f: &mut Frame, area: Rect, view: &EngineView) {
    let round = view
        .round_number
        .map_or_else(|| "-".to_string(), |r| r.to_string());
    let phase = match view.state {
        ClientGameState::Waiting if view.time_remaining > 0 => {
            format!("betting closes in {}s", view.time_remaining)
        }
        ClientGameState::Waiting => "waiting for next round".to_string(),
        ClientGameState::Playing => "in flight".to_string(),
        ClientGameState::Crashed => "crashed".to_string(),
        ClientGameState::Recovering => "next round loading".to_string(),
    };
    let mut connection = vec![
        Span::raw("Connection: "),
        Span::styled(view.connection.to_string(), connection_style(view.connection)),
    ];
    if view.consecutive_errors > 0 {
        connection.push(Span::raw(format!(
            " ({} failed polls)",
            view.consecutive_errors
        )));
    }
    let lines = vec![
        Line::from(format!("Round {round} | {phase}")),
        Line::from(connection),
    ];
    let balance = format!(
        " Balance {} (available {}) ",
        view.balance, view.available_balance
    );
    let block = Block::default().borders(Borders::ALL).title(balance);
    f.render_widget(Paragraph::new(lines).block(block), area);
}

fn draw_multiplier(f: &mut Frame, area: Rect, view: &EngineView) {
    let (text, style) = match view.state {
        ClientGameState::Playing => (
            format!("{:.2}x", view.multiplier),
            Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
        ),
        ClientGameState::Crashed => (
            format!("CRASHED AT {:.2}x", view.multiplier),
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        ),
        ClientGameState::Waiting | ClientGameState::Recovering => (
            view.last_crash
                .map_or_else(|| "--".to_string(), |c| format!("last crash {c:.2}x")),
            Style::default().fg(Color::DarkGray),
        ),
    };
    let p = Paragraph::new(Line::from(Span::styled(text, style)))
        .alignment(Alignment::Center)
        .block(Block::default().borders(Borders::ALL).title("Multiplier"));
    f.render_widget(p, area);
}

fn draw_history(f: &mut Frame, area: Rect, view: &EngineView) {
    let spans: Vec<Span> = view
        .crash_history
        .iter()
        .map(|point| {
            let color = if *point >= 2.0 { Color::Green } else { Color::Red };
            Span::styled(format!("{point:.2}x "), Style::default().fg(color))
        })
        .collect();
    let p = Paragraph::new(Line::from(spans))
        .block(Block::default().borders(Borders::ALL).title("History"));
    f.render_widget(p, area);
}

fn slip_line(slip: &BetSlip, selected: bool) -> Line<'static> {
    let marker = if selected { "> " } else { "  " };
    let detail = match slip.status {
        SlipStatus::Active if !slip.is_confirmed() => "placing...".to_string(),
        SlipStatus::Active if slip.cash_out_in_flight() => "cashing out...".to_string(),
        SlipStatus::Active => "active".to_string(),
        SlipStatus::Cashed => format!(
            "cashed at {:.2}x, won {}",
            slip.cashout_multiplier.unwrap_or_default(),
            slip.payout.unwrap_or_default()
        ),
        SlipStatus::Lost => "lost".to_string(),
    };
    let style = match slip.status {
        SlipStatus::Active => Style::default(),
        SlipStatus::Cashed => Style::default().fg(Color::Green),
        SlipStatus::Lost => Style::default().fg(Color::DarkGray),
    };
    Line::from(Span::styled(
        format!(
            "{marker}#{} stake {} | {detail} | {}",
            slip.round_id,
            slip.stake,
            slip.placed_at.format("%H:%M:%S")
        ),
        style,
    ))
}

fn draw_slips(f: &mut Frame, area: Rect, state: &UiState, view: &EngineView) {
    let selected = selected_slip(state, view).map(|slip| &slip.id);
    let lines: Vec<Line> = if view.slips.is_empty() {
        vec![Line::from("  No bets yet")]
    } else {
        view.slips
            .iter()
            .map(|slip| slip_line(slip, Some(&slip.id) == selected))
            .collect()
    };
    let title = match view.server_reports_active_bet {
        Some(true) => "Bet slips (server: active bet)",
        _ => "Bet slips",
    };
    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(p, area);
}

fn draw_bottom(f: &mut Frame, area: Rect, view: &EngineView) {
    let mut lines = Vec::new();
    if view.login_required {
        lines.push(Line::from(Span::styled(
            format!(
                "Session expired: press L to log in ({} queued)",
                view.queued_actions
            ),
            Style::default().fg(Color::Yellow),
        )));
    } else if let Some(message) = &view.message {
        lines.push(Line::from(message.clone()));
    }
    if let Some(stake) = view.auto_bet {
        lines.push(Line::from(Span::styled(
            format!("Auto-bet {stake} each round"),
            Style::default().fg(Color::Magenta),
        )));
    }
    let help = if view.can_cash_out() {
        "[c] cash out  [j/k] select  [r] resync  [q] quit"
    } else if view.can_place_bet() {
        "[b/0-9] bet  [a] auto-bet  [r] resync  [q] quit"
    } else {
        "[a] auto-bet  [r] resync  [q] quit"
    };
    lines.push(Line::from(Span::styled(help, Style::default().fg(Color::Cyan))));
    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Status"));
    f.render_widget(p, area);
}

fn draw_modals(f: &mut Frame, state: &UiState, view: &EngineView) {
    let (title, body) = match &state.mode {
        Mode::Normal => return,
        Mode::StakeEntry(input) => (
            "Place Bet",
            format!(
                "Stake: {input}_\nAvailable: {}\n(Enter to confirm, Esc to cancel)",
                view.available_balance
            ),
        ),
        Mode::TokenEntry(input) => (
            "Log In",
            format!(
                "Session token: {}_\n(Enter to submit, Esc to cancel)",
                "*".repeat(input.chars().count())
            ),
        ),
        Mode::QuitModal => ("Confirm Quit", "Quit the game? (Y/N)".to_string()),
    };
    let area = centered_rect(50, 25, f.area());
    let block = Block::default().borders(Borders::ALL).title(title);
    f.render_widget(Clear, area);
    f.render_widget(block.clone(), area);
    f.render_widget(Paragraph::new(body), block.inner(area));
}

fn centered_rect(w_percent: u16, h_percent: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - h_percent) / 2),
            Constraint::Percentage(h_percent),
            Constraint::Percentage((100 - h_percent) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - w_percent) / 2),
            Constraint::Percentage(w_percent),
            Constraint::Percentage((100 - w_percent) / 2),
        ])
        .split(popup_layout[1])[1]
}
