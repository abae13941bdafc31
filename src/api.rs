use crate::{
    money::Money,
    snapshot::{
        RoundSnapshot,
        SnapshotError,
    },
};
use std::future::Future;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ApiError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("session rejected with status {0}")]
    Unauthorized(u16),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized(_))
    }
}

impl From<SnapshotError> for ApiError {
    fn from(err: SnapshotError) -> Self {
        ApiError::InvalidPayload(err.to_string())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlacedBet {
    pub balance: Money,
    pub bet_id: String,
    pub amount: Money,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CashOutRequest {
    pub round_id: u64,
    pub multiplier_at_request: f64,
    pub bet_id: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CashedOut {
    pub balance: Money,
    pub bet_id: Option<String>,
    /// Figures the server echoes back. Logged when they disagree with the
    /// request; the slip always records the multiplier at request time.
    pub multiplier: Option<f64>,
    pub payout: Option<Money>,
}

/// The authoritative game server.
pub trait GameApi {
    fn fetch_snapshot(
        &self,
    ) -> impl Future<Output = Result<RoundSnapshot, ApiError>>;

    /// Past crash multipliers, most recent first.
    fn fetch_history(&self) -> impl Future<Output = Result<Vec<f64>, ApiError>>;

    fn fetch_balance(&self) -> impl Future<Output = Result<Money, ApiError>>;

    fn place_bet(
        &self,
        stake: Money,
    ) -> impl Future<Output = Result<PlacedBet, ApiError>>;

    fn cash_out(
        &self,
        request: CashOutRequest,
    ) -> impl Future<Output = Result<CashedOut, ApiError>>;

    fn check_active_bet(
        &self,
        round_number: u64,
    ) -> impl Future<Output = Result<bool, ApiError>>;

    /// Installs a fresh session token after re-authentication.
    fn restore_session(&self, token: String);
}
