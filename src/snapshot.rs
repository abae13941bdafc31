use serde_json::{
    Map,
    Value,
};
use std::fmt;
use thiserror::Error;

/// Fallback for live multipliers the server reports as missing, non-finite
/// or non-positive.
pub const SAFE_MULTIPLIER: f64 = 1.0;

const ROUND_KEYS: &[&str] = &["round_number", "roundNumber", "round", "round_id"];
const PHASE_KEYS: &[&str] = &["phase", "game_phase"];
const STATUS_KEYS: &[&str] = &["status", "state"];
const TIME_KEYS: &[&str] = &["time_remaining", "timeRemaining", "countdown"];
const MULTIPLIER_KEYS: &[&str] = &[
    "current_multiplier",
    "currentMultiplier",
    "live_multiplier",
    "liveMultiplier",
    "multiplier",
];
const CRASH_POINT_KEYS: &[&str] = &[
    "crash_point",
    "crashPoint",
    "target_crash_point",
    "targetCrashPoint",
];
const CRASHED_FLAG_KEYS: &[&str] = &["game_crashed", "gameCrashed", "crashed"];
/// Only sent alongside a crash, so their presence reports one.
const REALIZED_CRASH_KEYS: &[&str] = &["crashed_value", "crashedValue"];
const CRASHED_VALUE_KEYS: &[&str] = &[
    "crashed_at",
    "crashedAt",
    "crashed_value",
    "crashedValue",
    "previous_crash_point",
    "previousCrashPoint",
];

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Phase {
    Waiting,
    Playing,
    Crashed,
}

impl Phase {
    /// Order of phases within one round.
    pub fn rank(self) -> u8 {
        match self {
            Phase::Waiting => 0,
            Phase::Playing => 1,
            Phase::Crashed => 2,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "waiting" | "countdown" | "betting" => Some(Phase::Waiting),
            "playing" | "starting" | "active" | "running" | "flying" => {
                Some(Phase::Playing)
            }
            "crashed" | "ended" | "finished" => Some(Phase::Crashed),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Waiting => "waiting",
            Phase::Playing => "playing",
            Phase::Crashed => "crashed",
        };
        write!(f, "{name}")
    }
}

/// One polled read of the server's round state, normalized.
#[derive(Clone, Debug, PartialEq)]
pub struct RoundSnapshot {
    pub round_number: u64,
    pub phase: Phase,
    /// Seconds left in the countdown; zero outside `waiting`.
    pub time_remaining: f64,
    /// Always `>= 1.0`; only meaningful while `playing`.
    pub live_multiplier: f64,
    pub target_crash_point: Option<f64>,
    pub crashed_value: Option<f64>,
    /// The payload flagged a crash for this round or the one just before it.
    pub crash_reported: bool,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum SnapshotError {
    #[error("realtime payload is not a JSON object")]
    NotAnObject,
    #[error("realtime payload has no round number")]
    MissingRoundNumber,
    #[error("realtime payload has an invalid round number: {0}")]
    InvalidRoundNumber(String),
    #[error("realtime payload has an unknown phase: {0:?}")]
    UnknownPhase(Option<String>),
}

impl RoundSnapshot {
    pub fn waiting(round_number: u64, time_remaining: f64) -> Self {
        Self {
            round_number,
            phase: Phase::Waiting,
            time_remaining,
            live_multiplier: SAFE_MULTIPLIER,
            target_crash_point: None,
            crashed_value: None,
            crash_reported: false,
        }
    }

    pub fn playing(round_number: u64, live_multiplier: f64) -> Self {
        Self {
            round_number,
            phase: Phase::Playing,
            time_remaining: 0.0,
            live_multiplier: coerce_multiplier(Some(live_multiplier)),
            target_crash_point: None,
            crashed_value: None,
            crash_reported: false,
        }
    }

    pub fn crashed(round_number: u64, crashed_value: f64) -> Self {
        Self {
            round_number,
            phase: Phase::Crashed,
            time_remaining: 0.0,
            live_multiplier: coerce_multiplier(Some(crashed_value)),
            target_crash_point: None,
            crashed_value: positive(Some(crashed_value)),
            crash_reported: true,
        }
    }

    pub fn with_crash_point(mut self, crash_point: f64) -> Self {
        self.target_crash_point = positive(Some(crash_point));
        self
    }

    /// Whole seconds shown to the user, rounded up.
    pub fn countdown_secs(&self) -> u32 {
        if self.phase != Phase::Waiting || !self.time_remaining.is_finite() {
            return 0;
        }
        self.time_remaining.max(0.0).ceil() as u32
    }

    /// The round a reported crash belongs to. A payload already counting down
    /// the next round is reporting the tail of the previous one.
    pub fn crashed_round(&self) -> Option<u64> {
        if !self.crash_reported && self.phase != Phase::Crashed {
            return None;
        }
        match self.phase {
            Phase::Waiting => self.round_number.checked_sub(1),
            Phase::Playing | Phase::Crashed => Some(self.round_number),
        }
    }

    /// The crash point the live multiplier has already reached, if any.
    pub fn safeguard_crash_point(&self) -> Option<f64> {
        if self.phase != Phase::Playing {
            return None;
        }
        self.target_crash_point
            .filter(|target| self.live_multiplier >= *target)
    }

    /// Normalizes the realtime payload, tolerating the field spellings the
    /// server has used over time and numbers sent as strings.
    pub fn from_realtime(payload: &Value) -> Result<Self, SnapshotError> {
        let fields = payload.as_object().ok_or(SnapshotError::NotAnObject)?;

        let round_number = round_number(fields)?;
        let phase = phase(fields)?;

        let crash_flag = lookup(fields, CRASHED_FLAG_KEYS)
            .map(coerce_bool)
            .unwrap_or(false);
        let realized = lookup(fields, REALIZED_CRASH_KEYS)
            .and_then(coerce_f64)
            .is_some_and(|v| v > 0.0);
        let crash_reported = crash_flag || realized || phase == Phase::Crashed;

        let time_remaining = match phase {
            Phase::Waiting => lookup(fields, TIME_KEYS)
                .and_then(coerce_f64)
                .map(|t| t.max(0.0))
                .unwrap_or(0.0),
            Phase::Playing | Phase::Crashed => 0.0,
        };

        let live_multiplier =
            coerce_multiplier(lookup(fields, MULTIPLIER_KEYS).and_then(coerce_f64));
        let target_crash_point =
            positive(lookup(fields, CRASH_POINT_KEYS).and_then(coerce_f64));

        let crashed_value = if crash_reported {
            let explicit = CRASHED_VALUE_KEYS
                .iter()
                .find_map(|key| positive(fields.get(*key).and_then(coerce_f64)));
            match (explicit, phase) {
                (Some(value), _) => Some(value),
                // A waiting payload's crash point already belongs to the next round.
                (None, Phase::Waiting) => None,
                (None, Phase::Playing | Phase::Crashed) => target_crash_point,
            }
        } else {
            None
        };

        Ok(Self {
            round_number,
            phase,
            time_remaining,
            live_multiplier,
            target_crash_point,
            crashed_value,
            crash_reported,
        })
    }
}

fn round_number(fields: &Map<String, Value>) -> Result<u64, SnapshotError> {
    let raw = lookup(fields, ROUND_KEYS).ok_or(SnapshotError::MissingRoundNumber)?;
    match raw {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| SnapshotError::InvalidRoundNumber(n.to_string())),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| SnapshotError::InvalidRoundNumber(s.clone())),
        other => Err(SnapshotError::InvalidRoundNumber(other.to_string())),
    }
}

fn phase(fields: &Map<String, Value>) -> Result<Phase, SnapshotError> {
    let explicit = lookup(fields, PHASE_KEYS).and_then(Value::as_str);
    if let Some(phase) = explicit.and_then(Phase::parse) {
        return Ok(phase);
    }
    let status = lookup(fields, STATUS_KEYS).and_then(Value::as_str);
    status
        .and_then(Phase::parse)
        .ok_or_else(|| SnapshotError::UnknownPhase(explicit.or(status).map(str::to_owned)))
}

fn lookup<'a>(fields: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| fields.get(*key))
        .find(|value| !value.is_null())
}

pub(crate) fn coerce_f64(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn coerce_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1"),
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        _ => false,
    }
}

fn positive(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v > 0.0)
}

pub fn coerce_multiplier(value: Option<f64>) -> f64 {
    positive(value)
        .map(|v| v.max(SAFE_MULTIPLIER))
        .unwrap_or(SAFE_MULTIPLIER)
}
