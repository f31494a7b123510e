//! Timer registry owned by the connection manager.
//!
//! Every pending callback (backoff, keepalive ping, pong deadline) is a
//! deadline stored here rather than a detached task, so teardown is one
//! `clear()` call and nothing can fire after it.

use tokio::time::Instant;

/// What a deadline is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Backoff,
    Ping,
    PongTimeout,
}

#[derive(Debug, Default)]
pub struct TimerRegistry {
    backoff: Option<Instant>,
    ping: Option<Instant>,
    pong_timeout: Option<Instant>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) a timer.
    pub fn set(&mut self, kind: TimerKind, at: Instant) {
        *self.slot(kind) = Some(at);
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        *self.slot(kind) = None;
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        match kind {
            TimerKind::Backoff => self.backoff.is_some(),
            TimerKind::Ping => self.ping.is_some(),
            TimerKind::PongTimeout => self.pong_timeout.is_some(),
        }
    }

    /// Cancel the keepalive pair (ping and pong deadline).
    pub fn clear_keepalive(&mut self) {
        self.ping = None;
        self.pong_timeout = None;
    }

    /// Cancel every timer.
    pub fn clear(&mut self) {
        self.backoff = None;
        self.ping = None;
        self.pong_timeout = None;
    }

    pub fn pending(&self) -> usize {
        [self.backoff, self.ping, self.pong_timeout]
            .iter()
            .filter(|t| t.is_some())
            .count()
    }

    /// Earliest armed deadline. Ties go to the pong deadline, then backoff.
    pub fn next(&self) -> Option<(TimerKind, Instant)> {
        [
            (TimerKind::PongTimeout, self.pong_timeout),
            (TimerKind::Backoff, self.backoff),
            (TimerKind::Ping, self.ping),
        ]
        .into_iter()
        .filter_map(|(kind, at)| at.map(|at| (kind, at)))
        .min_by_key(|(_, at)| *at)
    }

    /// Disarm `kind` and report whether it was armed.
    pub fn take(&mut self, kind: TimerKind) -> bool {
        self.slot(kind).take().is_some()
    }

    fn slot(&mut self, kind: TimerKind) -> &mut Option<Instant> {
        match kind {
            TimerKind::Backoff => &mut self.backoff,
            TimerKind::Ping => &mut self.ping,
            TimerKind::PongTimeout => &mut self.pong_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_next_picks_earliest() {
        let now = Instant::now();
        let mut timers = TimerRegistry::new();
        timers.set(TimerKind::Ping, now + Duration::from_secs(30));
        timers.set(TimerKind::PongTimeout, now + Duration::from_secs(5));
        assert_eq!(timers.next().map(|(k, _)| k), Some(TimerKind::PongTimeout));
        assert_eq!(timers.pending(), 2);
    }

    #[test]
    fn test_tie_prefers_pong_timeout() {
        let at = Instant::now();
        let mut timers = TimerRegistry::new();
        timers.set(TimerKind::Ping, at);
        timers.set(TimerKind::PongTimeout, at);
        assert_eq!(timers.next().map(|(k, _)| k), Some(TimerKind::PongTimeout));
    }

    #[test]
    fn test_clear_cancels_everything() {
        let now = Instant::now();
        let mut timers = TimerRegistry::new();
        timers.set(TimerKind::Backoff, now);
        timers.set(TimerKind::Ping, now);
        timers.set(TimerKind::PongTimeout, now);
        timers.clear();
        assert_eq!(timers.pending(), 0);
        assert!(timers.next().is_none());
    }

    #[test]
    fn test_clear_keepalive_leaves_backoff() {
        let now = Instant::now();
        let mut timers = TimerRegistry::new();
        timers.set(TimerKind::Backoff, now);
        timers.set(TimerKind::Ping, now);
        timers.clear_keepalive();
        assert!(timers.is_armed(TimerKind::Backoff));
        assert!(!timers.is_armed(TimerKind::Ping));
    }

    #[test]
    fn test_take_disarms() {
        let mut timers = TimerRegistry::new();
        timers.set(TimerKind::Backoff, Instant::now());
        assert!(timers.take(TimerKind::Backoff));
        assert!(!timers.take(TimerKind::Backoff));
    }
}
