use std::time::Duration;
use tokio::time::Instant;

/// A named, owned deadline. Periodic timers re-arm themselves on `fire`;
/// one-shot timers disarm.
#[derive(Clone, Debug)]
pub struct Timer {
    name: &'static str,
    period: Option<Duration>,
    deadline: Option<Instant>,
}

impl Timer {
    pub fn periodic(name: &'static str, period: Duration) -> Self {
        Self {
            name,
            period: Some(period),
            deadline: None,
        }
    }

    pub fn one_shot(name: &'static str) -> Self {
        Self {
            name,
            period: None,
            deadline: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Arms a periodic timer one period from `now`. One-shot timers need
    /// `start_in`.
    pub fn start(&mut self, now: Instant) {
        if let Some(period) = self.period {
            self.deadline = Some(now + period);
        }
    }

    pub fn start_in(&mut self, now: Instant, delay: Duration) {
        self.deadline = Some(now + delay);
    }

    /// Changes the period of a periodic timer, re-arming it if it was running.
    pub fn set_period(&mut self, now: Instant, period: Duration) {
        if self.period == Some(period) {
            return;
        }
        self.period = Some(period);
        if self.is_armed() {
            self.deadline = Some(now + period);
        }
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Consumes a due deadline. Returns whether the timer fired.
    pub fn fire(&mut self, now: Instant) -> bool {
        if !self.is_due(now) {
            return false;
        }
        self.deadline = self.period.map(|period| now + period);
        true
    }
}

/// Earliest deadline across a set of timers.
pub fn earliest<'a>(timers: impl IntoIterator<Item = &'a Timer>) -> Option<Instant> {
    timers.into_iter().filter_map(Timer::deadline).min()
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    #[test]
    fn fire__rearms_periodic_and_disarms_one_shot() {
        // given
        let now = Instant::now();
        let mut poll = Timer::periodic("poll", Duration::from_millis(500));
        let mut resync = Timer::one_shot("resync");
        poll.start(now);
        resync.start_in(now, Duration::from_secs(2));

        // when
        let later = now + Duration::from_secs(2);
        let poll_fired = poll.fire(later);
        let resync_fired = resync.fire(later);

        // then
        assert!(poll_fired);
        assert!(resync_fired);
        assert_eq!(poll.deadline(), Some(later + Duration::from_millis(500)));
        assert!(!resync.is_armed());
    }

    #[test]
    fn fire__does_nothing_before_the_deadline() {
        let now = Instant::now();
        let mut timer = Timer::periodic("watchdog", Duration::from_secs(2));
        timer.start(now);

        assert!(!timer.fire(now + Duration::from_secs(1)));
        assert_eq!(timer.deadline(), Some(now + Duration::from_secs(2)));
    }

    #[test]
    fn set_period__rearms_only_a_running_timer() {
        let now = Instant::now();
        let mut running = Timer::periodic("poll", Duration::from_millis(500));
        let mut idle = Timer::periodic("poll", Duration::from_millis(500));
        running.start(now);

        running.set_period(now, Duration::from_secs(2));
        idle.set_period(now, Duration::from_secs(2));

        assert_eq!(running.deadline(), Some(now + Duration::from_secs(2)));
        assert!(!idle.is_armed());
    }

    #[test]
    fn earliest__ignores_stopped_timers() {
        let now = Instant::now();
        let mut a = Timer::periodic("a", Duration::from_secs(3));
        let b = Timer::periodic("b", Duration::from_secs(1));
        a.start(now);

        assert_eq!(earliest([&a, &b]), Some(now + Duration::from_secs(3)));
    }
}
