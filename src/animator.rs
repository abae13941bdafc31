use crate::{
    snapshot::SAFE_MULTIPLIER,
    timer::Timer,
};
use std::time::Duration;
use tokio::time::Instant;

/// Smoothly climbs a display multiplier toward the latest server value
/// while a round is in play. Display only.
pub struct Animator {
    frame: Timer,
    growth_per_sec: f64,
    rendered: f64,
    target: f64,
    cap: Option<f64>,
    last_frame_at: Option<Instant>,
}

impl Animator {
    pub fn new(frame_period: Duration, growth_per_sec: f64) -> Self {
        Self {
            frame: Timer::periodic("animation-frame", frame_period),
            growth_per_sec,
            rendered: SAFE_MULTIPLIER,
            target: SAFE_MULTIPLIER,
            cap: None,
            last_frame_at: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.frame.is_armed()
    }

    pub fn rendered(&self) -> f64 {
        self.rendered
    }

    pub fn frame_timer(&self) -> &Timer {
        &self.frame
    }

    pub fn start(&mut self, now: Instant, multiplier: f64, cap: Option<f64>) {
        self.cap = cap;
        self.target = multiplier;
        self.rendered = self.clamp(multiplier);
        self.last_frame_at = Some(now);
        self.frame.start(now);
    }

    pub fn stop(&mut self) {
        self.frame.stop();
        self.last_frame_at = None;
    }

    /// Moves the target forward; a lower server value is ignored.
    pub fn set_target(&mut self, multiplier: f64) {
        if multiplier > self.target {
            self.target = multiplier;
        }
    }

    pub fn set_cap(&mut self, cap: Option<f64>) {
        self.cap = cap;
        self.rendered = self.clamp(self.rendered);
    }

    /// Freezes the display at the realized crash value.
    pub fn settle_at(&mut self, value: f64) {
        self.stop();
        self.rendered = value.max(SAFE_MULTIPLIER);
    }

    pub fn reset(&mut self) {
        self.stop();
        self.rendered = SAFE_MULTIPLIER;
        self.target = SAFE_MULTIPLIER;
        self.cap = None;
    }

    /// Advances one frame if it is due. Returns whether the value moved.
    pub fn on_frame(&mut self, now: Instant) -> bool {
        if !self.frame.fire(now) {
            return false;
        }
        let elapsed = self
            .last_frame_at
            .map(|at| now.saturating_duration_since(at).as_secs_f64())
            .unwrap_or(0.0);
        self.last_frame_at = Some(now);

        let step = self.growth_per_sec * elapsed;
        let next = self.clamp((self.rendered + step).min(self.target.max(self.rendered)));
        let moved = next > self.rendered;
        if moved {
            self.rendered = next;
        }
        moved
    }

    fn clamp(&self, value: f64) -> f64 {
        let value = value.max(SAFE_MULTIPLIER);
        match self.cap {
            Some(cap) => value.min(cap.max(SAFE_MULTIPLIER)),
            None => value,
        }
    }
}
