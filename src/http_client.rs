use crate::{
    api::{
        ApiError,
        CashOutRequest,
        CashedOut,
        GameApi,
        PlacedBet,
    },
    money::Money,
    snapshot::{
        RoundSnapshot,
        coerce_f64,
    },
};
use color_eyre::eyre::{
    Result,
    WrapErr,
};
use reqwest::{
    RequestBuilder,
    StatusCode,
};
use serde::Serialize;
use serde_json::Value;
use std::{
    sync::RwLock,
    time::Duration,
};
use tracing::debug;

const API_PREFIX: &str = "api/aviator";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// `GameApi` over the server's JSON endpoints.
pub struct GameApiClient {
    base_url: String,
    user_id: String,
    http: reqwest::Client,
    token: RwLock<Option<String>>,
}

#[derive(Serialize)]
struct PlaceBetBody<'a> {
    amount: Money,
    user_id: &'a str,
}

#[derive(Serialize)]
struct CashOutBody<'a> {
    round_number: u64,
    multiplier: f64,
    user_id: &'a str,
    bet_id: &'a str,
}

impl GameApiClient {
    pub fn new(
        base_url: impl Into<String>,
        user_id: impl Into<String>,
        token: Option<String>,
    ) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .wrap_err("failed to build HTTP client for game server")?;
        Ok(Self {
            base_url,
            user_id: user_id.into(),
            http,
            token: RwLock::new(token),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{API_PREFIX}/{endpoint}/", self.base_url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let token = self.token.read().ok().and_then(|guard| guard.clone());
        match token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value, ApiError> {
        let res = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let status = res.status();
        let bytes = res
            .bytes()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(status_error(status, &bytes));
        }
        serde_json::from_slice(&bytes).map_err(|e| ApiError::InvalidPayload(e.to_string()))
    }
}

fn status_error(status: StatusCode, body: &[u8]) -> ApiError {
    let message = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| {
            ["error", "detail", "message"]
                .iter()
                .find_map(|key| v.get(*key).and_then(Value::as_str).map(str::to_owned))
        })
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ApiError::Unauthorized(status.as_u16())
        }
        StatusCode::CONFLICT => ApiError::Conflict(message),
        _ => ApiError::Rejected {
            status: status.as_u16(),
            message,
        },
    }
}

impl GameApi for GameApiClient {
    async fn fetch_snapshot(&self) -> Result<RoundSnapshot, ApiError> {
        let payload = self.send(self.http.get(self.url("realtime"))).await?;
        debug!(?payload, "realtime payload");
        Ok(RoundSnapshot::from_realtime(&payload)?)
    }

    async fn fetch_history(&self) -> Result<Vec<f64>, ApiError> {
        let payload = self.send(self.http.get(self.url("game-history"))).await?;
        parse_history(&payload)
    }

    async fn fetch_balance(&self) -> Result<Money, ApiError> {
        let payload = self
            .send(
                self.http
                    .get(self.url("balance"))
                    .query(&[("user_id", self.user_id.as_str())]),
            )
            .await?;
        parse_balance(&payload)
    }

    async fn place_bet(&self, stake: Money) -> Result<PlacedBet, ApiError> {
        let body = PlaceBetBody {
            amount: stake,
            user_id: &self.user_id,
        };
        let payload = self
            .send(self.http.post(self.url("place-bet")).json(&body))
            .await?;
        parse_placed_bet(&payload, stake)
    }

    async fn cash_out(&self, request: CashOutRequest) -> Result<CashedOut, ApiError> {
        let body = CashOutBody {
            round_number: request.round_id,
            multiplier: request.multiplier_at_request,
            user_id: &self.user_id,
            bet_id: &request.bet_id,
        };
        let payload = self
            .send(self.http.post(self.url("cashout")).json(&body))
            .await?;
        parse_cashed_out(&payload)
    }

    async fn check_active_bet(&self, round_number: u64) -> Result<bool, ApiError> {
        let round = round_number.to_string();
        let payload = self
            .send(self.http.get(self.url("check-active-bet")).query(&[
                ("user_id", self.user_id.as_str()),
                ("round_number", round.as_str()),
            ]))
            .await?;
        parse_active_bet(&payload)
    }

    fn restore_session(&self, token: String) {
        if let Ok(mut guard) = self.token.write() {
            *guard = Some(token);
        }
    }
}

/// Accepts either bare numbers or `{crash_point}` records, most recent
/// first. Non-positive entries are dropped.
pub fn parse_history(payload: &Value) -> Result<Vec<f64>, ApiError> {
    let entries = payload
        .as_array()
        .or_else(|| payload.get("results").and_then(Value::as_array))
        .ok_or_else(|| ApiError::InvalidPayload("history is not a list".to_string()))?;
    Ok(entries
        .iter()
        .filter_map(|entry| match entry {
            Value::Object(_) => entry.get("crash_point").and_then(coerce_f64),
            other => coerce_f64(other),
        })
        .filter(|point| *point > 0.0)
        .collect())
}

pub fn parse_balance(payload: &Value) -> Result<Money, ApiError> {
    payload
        .get("balance")
        .and_then(money)
        .ok_or_else(|| ApiError::InvalidPayload("missing balance".to_string()))
}

pub fn parse_placed_bet(payload: &Value, stake: Money) -> Result<PlacedBet, ApiError> {
    let balance = parse_balance(payload)?;
    let bet = payload.get("bet");
    let bet_id = bet
        .and_then(|bet| bet.get("id"))
        .and_then(identifier)
        .ok_or_else(|| ApiError::InvalidPayload("missing bet id".to_string()))?;
    let amount = bet
        .and_then(|bet| bet.get("amount"))
        .and_then(money)
        .unwrap_or(stake);
    Ok(PlacedBet {
        balance,
        bet_id,
        amount,
    })
}

pub fn parse_cashed_out(payload: &Value) -> Result<CashedOut, ApiError> {
    let balance = parse_balance(payload)?;
    let bet = payload.get("bet");
    let field = |keys: &[&str]| {
        bet.and_then(|bet| keys.iter().find_map(|key| bet.get(*key)))
            .filter(|v| !v.is_null())
    };
    Ok(CashedOut {
        balance,
        bet_id: field(&["id"]).and_then(identifier),
        multiplier: field(&["cashout_multiplier", "multiplier"])
            .and_then(coerce_f64)
            .filter(|m| *m >= 1.0),
        payout: field(&["payout", "win_amount"]).and_then(money),
    })
}

pub fn parse_active_bet(payload: &Value) -> Result<bool, ApiError> {
    payload
        .get("has_active_bet")
        .or_else(|| payload.get("hasActiveBet"))
        .and_then(Value::as_bool)
        .ok_or_else(|| ApiError::InvalidPayload("missing has_active_bet".to_string()))
}

fn money(value: &Value) -> Option<Money> {
    coerce_f64(value).and_then(Money::from_decimal)
}

fn identifier(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_history__keeps_valid_crash_points_in_order() {
        // given
        let payload = json!([
            {"crash_point": "2.31"},
            {"crash_point": null},
            {"crash_point": 1.0},
            {"crash_point": -4},
            {"crash_point": 7.5},
        ]);

        // when
        let history = parse_history(&payload).unwrap();

        // then
        assert_eq!(history, vec![2.31, 1.0, 7.5]);
    }

    #[test]
    fn parse_placed_bet__reads_numeric_ids_and_string_amounts() {
        let payload = json!({"balance": "50.00", "bet": {"id": 812, "amount": "50"}});

        let placed = parse_placed_bet(&payload, Money::from_units(50)).unwrap();

        assert_eq!(placed.balance, Money::from_units(50));
        assert_eq!(placed.bet_id, "812");
        assert_eq!(placed.amount, Money::from_units(50));
    }

    #[test]
    fn parse_placed_bet__requires_a_bet_id() {
        let payload = json!({"balance": 50.0, "bet": {}});

        let err = parse_placed_bet(&payload, Money::from_units(50)).unwrap_err();

        assert!(matches!(err, ApiError::InvalidPayload(_)));
    }

    #[test]
    fn parse_cashed_out__reads_echoed_figures_when_present() {
        let with_figures = json!({
            "balance": 117.0,
            "bet": {"id": "b-1", "cashout_multiplier": 1.85, "payout": "37.00"},
        });
        let bare = json!({"balance": 117.0});

        let with_figures = parse_cashed_out(&with_figures).unwrap();
        let bare = parse_cashed_out(&bare).unwrap();

        assert_eq!(with_figures.multiplier, Some(1.85));
        assert_eq!(with_figures.payout, Some(Money::from_units(37)));
        assert_eq!(bare.multiplier, None);
        assert_eq!(bare.payout, None);
    }

    #[test]
    fn parse_active_bet__accepts_both_spellings() {
        assert_eq!(parse_active_bet(&json!({"has_active_bet": true})), Ok(true));
        assert_eq!(parse_active_bet(&json!({"hasActiveBet": false})), Ok(false));
        assert!(parse_active_bet(&json!({})).is_err());
    }

    #[test]
    fn status_error__maps_session_and_conflict_statuses() {
        let body = br#"{"error": "Bet already cashed out"}"#;

        assert_eq!(
            status_error(StatusCode::FORBIDDEN, b""),
            ApiError::Unauthorized(403)
        );
        assert_eq!(
            status_error(StatusCode::CONFLICT, body),
            ApiError::Conflict("Bet already cashed out".to_string())
        );
        assert_eq!(
            status_error(StatusCode::BAD_REQUEST, body),
            ApiError::Rejected {
                status: 400,
                message: "Bet already cashed out".to_string()
            }
        );
    }
}
