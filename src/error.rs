use crate::{
    api::ApiError,
    ledger::SlipId,
    money::Money,
    reconciler::ClientGameState,
};
use thiserror::Error;

/// Failures surfaced to callers of `place_bet` / `cash_out`.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("cannot do that while the round is {state}")]
    InvalidPhase { state: ClientGameState },
    #[error("round has not been observed yet")]
    RoundUnknown,
    #[error("stake {stake} is below the minimum of {min}")]
    InvalidStake { stake: Money, min: Money },
    #[error("stake {stake} exceeds the available balance of {available}")]
    InsufficientBalance { stake: Money, available: Money },
    #[error("a bet is already active this round")]
    ActiveBetExists,
    #[error("unknown bet slip {0}")]
    UnknownSlip(SlipId),
    #[error("bet slip {0} has not been confirmed by the server yet")]
    AwaitingConfirmation(SlipId),
    #[error("a cash-out for bet slip {0} is already in flight")]
    CashOutInFlight(SlipId),
    #[error("bet slip {0} is already settled")]
    AlreadySettled(SlipId),
    #[error("session expired; log in again")]
    SessionExpired,
    #[error("server rejected the request: {0}")]
    Rejected(String),
    #[error("network error: {0}")]
    Transport(String),
    #[error("engine is not running")]
    EngineStopped,
}

impl CommandError {
    /// Maps a network failure of a command aimed at `slip`.
    pub fn from_api(err: ApiError, slip: &SlipId) -> Self {
        match err {
            ApiError::Unauthorized(_) => CommandError::SessionExpired,
            ApiError::Conflict(_) => CommandError::AlreadySettled(slip.clone()),
            ApiError::Rejected { message, .. } => CommandError::Rejected(message),
            ApiError::Transport(msg) => CommandError::Transport(msg),
            ApiError::InvalidPayload(msg) => CommandError::Transport(msg),
        }
    }
}
