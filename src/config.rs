use crate::{
    ledger::BetMode,
    money::Money,
    scheduler::{
        Cadence,
        SchedulerSettings,
    },
    watchdog::StallThresholds,
};
use color_eyre::eyre::{
    Result,
    WrapErr,
    bail,
};
use serde::{
    Deserialize,
    Deserializer,
};
use std::{
    path::Path,
    time::Duration,
};

/// Timing constants, stake bounds and bet mode for one engine.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(rename = "poll_nominal_ms", deserialize_with = "millis")]
    pub poll_nominal: Duration,
    #[serde(rename = "poll_backoff_ms", deserialize_with = "millis")]
    pub poll_backoff: Duration,
    #[serde(rename = "poll_recovering_ms", deserialize_with = "millis")]
    pub poll_recovering: Duration,
    #[serde(rename = "watchdog_period_ms", deserialize_with = "millis")]
    pub watchdog_period: Duration,
    #[serde(rename = "no_successful_poll_ms", deserialize_with = "millis")]
    pub no_successful_poll: Duration,
    #[serde(rename = "countdown_frozen_ms", deserialize_with = "millis")]
    pub countdown_frozen: Duration,
    #[serde(rename = "bet_state_stale_ms", deserialize_with = "millis")]
    pub bet_state_stale: Duration,
    #[serde(rename = "playing_silence_ms", deserialize_with = "millis")]
    pub playing_silence: Duration,
    #[serde(rename = "overrun_grace_ms", deserialize_with = "millis")]
    pub overrun_grace: Duration,
    #[serde(rename = "unknown_crash_point_cap_ms", deserialize_with = "millis")]
    pub unknown_crash_point_cap: Duration,
    #[serde(rename = "resync_debounce_ms", deserialize_with = "millis")]
    pub resync_debounce: Duration,
    #[serde(rename = "safety_net_period_ms", deserialize_with = "millis")]
    pub safety_net_period: Duration,
    #[serde(rename = "crash_display_ms", deserialize_with = "millis")]
    pub crash_display: Duration,
    #[serde(rename = "recovery_delay_ms", deserialize_with = "millis")]
    pub recovery_delay: Duration,
    #[serde(rename = "history_retry_ms", deserialize_with = "millis")]
    pub history_retry: Duration,
    #[serde(rename = "frame_period_ms", deserialize_with = "millis")]
    pub frame_period: Duration,
    pub growth_per_sec: f64,
    pub resync_after_errors: u32,
    pub reconnect_after_errors: u32,
    pub min_stake: Money,
    pub bet_mode: BetMode,
    pub retained_settled_slips: usize,
    pub history_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_nominal: Duration::from_millis(500),
            poll_backoff: Duration::from_millis(2000),
            poll_recovering: Duration::from_millis(1000),
            watchdog_period: Duration::from_secs(2),
            no_successful_poll: Duration::from_secs(8),
            countdown_frozen: Duration::from_secs(5),
            bet_state_stale: Duration::from_secs(10),
            playing_silence: Duration::from_secs(6),
            overrun_grace: Duration::from_secs(10),
            unknown_crash_point_cap: Duration::from_secs(300),
            resync_debounce: Duration::from_secs(2),
            safety_net_period: Duration::from_secs(30),
            crash_display: Duration::from_secs(3),
            recovery_delay: Duration::from_millis(1500),
            history_retry: Duration::from_millis(800),
            frame_period: Duration::from_millis(50),
            growth_per_sec: 0.05,
            resync_after_errors: 3,
            reconnect_after_errors: 5,
            min_stake: Money::from_units(1),
            bet_mode: BetMode::Multi,
            retained_settled_slips: 20,
            history_len: 20,
        }
    }
}

impl EngineConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read config {}", path.display()))?;
        Self::from_json(&raw).wrap_err_with(|| format!("invalid config {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate().wrap_err("invalid engine timings")?;
        Ok(config)
    }

    /// Every timer needs a positive period, or the loop would wake forever.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("poll_nominal_ms", self.poll_nominal),
            ("poll_backoff_ms", self.poll_backoff),
            ("poll_recovering_ms", self.poll_recovering),
            ("watchdog_period_ms", self.watchdog_period),
            ("no_successful_poll_ms", self.no_successful_poll),
            ("countdown_frozen_ms", self.countdown_frozen),
            ("bet_state_stale_ms", self.bet_state_stale),
            ("playing_silence_ms", self.playing_silence),
            ("overrun_grace_ms", self.overrun_grace),
            ("unknown_crash_point_cap_ms", self.unknown_crash_point_cap),
            ("resync_debounce_ms", self.resync_debounce),
            ("safety_net_period_ms", self.safety_net_period),
            ("crash_display_ms", self.crash_display),
            ("recovery_delay_ms", self.recovery_delay),
            ("history_retry_ms", self.history_retry),
            ("frame_period_ms", self.frame_period),
        ];
        if let Some((key, _)) = durations.iter().find(|(_, value)| value.is_zero()) {
            bail!("{key} must be greater than zero");
        }
        if !self.growth_per_sec.is_finite() || self.growth_per_sec <= 0.0 {
            bail!("growth_per_sec must be positive, got {}", self.growth_per_sec);
        }
        Ok(())
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            cadence: Cadence {
                nominal: self.poll_nominal,
                backoff: self.poll_backoff,
                recovering: self.poll_recovering,
            },
            watchdog_period: self.watchdog_period,
            safety_net_period: self.safety_net_period,
            resync_debounce: self.resync_debounce,
            history_retry_delay: self.history_retry,
            resync_after_errors: self.resync_after_errors,
            reconnect_after_errors: self.reconnect_after_errors,
        }
    }

    pub fn stall_thresholds(&self) -> StallThresholds {
        StallThresholds {
            no_successful_poll: self.no_successful_poll,
            countdown_frozen: self.countdown_frozen,
            bet_state_stale: self.bet_state_stale,
            playing_silence: self.playing_silence,
            overrun_grace: self.overrun_grace,
            unknown_crash_point_cap: self.unknown_crash_point_cap,
            growth_per_sec: self.growth_per_sec,
        }
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}
