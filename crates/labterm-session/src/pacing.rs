//! Adaptive poll pacing.
//!
//! `PollingState` is the pure half of the poller: it turns fetch outcomes
//! into interval changes, pauses, and permanent stops. The async loop in
//! `poller` owns one per session and is the only writer.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::PollingConfig;
use crate::error::ConsoleError;
use crate::event::PollStopReason;

/// What the poller should do after an outcome was recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollVerdict {
    Continue,
    /// Rate-limit threshold reached; no fetches until the cooldown elapses.
    Pause { cooldown: Duration },
    /// Polling ended for this session. Returned once, on the transition.
    Stop(PollStopReason),
    /// Polling had already ended before this outcome.
    AlreadyStopped,
}

/// Read-only view of the pacing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingSnapshot {
    pub base_interval: Duration,
    pub current_interval: Duration,
    pub consecutive_errors: u32,
    pub consecutive_rate_limits: u32,
    pub active: bool,
    pub paused: bool,
}

#[derive(Debug, Clone)]
pub struct PollingState {
    base_interval: Duration,
    current_interval: Duration,
    max_interval: Duration,
    consecutive_errors: u32,
    consecutive_rate_limits: u32,
    active: bool,
    paused_until: Option<Instant>,
    pause_threshold: u32,
    cooldown: Duration,
    error_threshold: u32,
}

impl PollingState {
    pub fn new(cfg: &PollingConfig) -> Self {
        let base = cfg.base_interval();
        Self {
            base_interval: base,
            current_interval: base,
            max_interval: cfg.max_interval().max(base),
            consecutive_errors: 0,
            consecutive_rate_limits: 0,
            active: true,
            paused_until: None,
            pause_threshold: cfg.rate_limit_pause_threshold.max(1),
            cooldown: cfg.rate_limit_cooldown(),
            error_threshold: cfg.error_stop_threshold.max(1),
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_paused(&self) -> bool {
        self.paused_until.is_some()
    }

    pub fn snapshot(&self) -> PollingSnapshot {
        PollingSnapshot {
            base_interval: self.base_interval,
            current_interval: self.current_interval,
            consecutive_errors: self.consecutive_errors,
            consecutive_rate_limits: self.consecutive_rate_limits,
            active: self.active,
            paused: self.is_paused(),
        }
    }

    /// Delay before the next steady-state tick.
    pub fn next_delay(&self, now: Instant) -> Duration {
        match self.paused_until {
            Some(until) => until.saturating_duration_since(now),
            None => self.current_interval,
        }
    }

    /// Clear an elapsed pause. Returns true when polling resumes.
    pub fn resume_if_due(&mut self, now: Instant) -> bool {
        match self.paused_until {
            Some(until) if now >= until => {
                self.paused_until = None;
                self.reset_pacing();
                true
            }
            _ => false,
        }
    }

    pub fn record_success(&mut self) {
        self.reset_pacing();
    }

    pub fn record_rate_limit(&mut self, now: Instant) -> PollVerdict {
        if !self.active {
            return PollVerdict::AlreadyStopped;
        }
        self.current_interval = (self.current_interval * 2).min(self.max_interval);
        self.consecutive_rate_limits += 1;
        if self.consecutive_rate_limits >= self.pause_threshold {
            self.paused_until = Some(now + self.cooldown);
            return PollVerdict::Pause {
                cooldown: self.cooldown,
            };
        }
        PollVerdict::Continue
    }

    pub fn record_error(&mut self, message: &str) -> PollVerdict {
        if !self.active {
            return PollVerdict::AlreadyStopped;
        }
        self.consecutive_errors += 1;
        if self.consecutive_errors >= self.error_threshold {
            return self.stop(PollStopReason::TooManyErrors {
                count: self.consecutive_errors,
                last_error: message.to_string(),
            });
        }
        PollVerdict::Continue
    }

    /// Route a fetch failure to the matching rule.
    pub fn record_failure(&mut self, err: &ConsoleError, now: Instant) -> PollVerdict {
        match err {
            ConsoleError::RateLimited { .. } => self.record_rate_limit(now),
            ConsoleError::NotFound { .. } => self.stop(PollStopReason::NotFound),
            ConsoleError::AuthExpired { .. } => self.stop(PollStopReason::AuthExpired),
            other => self.record_error(&other.to_string()),
        }
    }

    pub fn stop(&mut self, reason: PollStopReason) -> PollVerdict {
        if !self.active {
            return PollVerdict::AlreadyStopped;
        }
        self.active = false;
        self.paused_until = None;
        PollVerdict::Stop(reason)
    }

    fn reset_pacing(&mut self) {
        self.current_interval = self.base_interval;
        self.consecutive_errors = 0;
        self.consecutive_rate_limits = 0;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn cfg(threshold: u32) -> PollingConfig {
        PollingConfig {
            base_interval_ms: 4_000,
            max_interval_ms: 30_000,
            rate_limit_pause_threshold: threshold,
            rate_limit_cooldown_ms: 60_000,
            error_stop_threshold: 3,
            initial_jitter_max_ms: 0,
        }
    }

    fn rate_limited() -> ConsoleError {
        ConsoleError::RateLimited { retry_after: None }
    }

    #[test]
    fn rate_limits_double_up_to_cap_then_success_resets() {
        let now = Instant::now();
        let mut state = PollingState::new(&cfg(10));
        let mut observed = Vec::new();
        for _ in 0..5 {
            assert_eq!(state.record_failure(&rate_limited(), now), PollVerdict::Continue);
            observed.push(state.current_interval().as_millis());
        }
        assert_eq!(observed, vec![8_000, 16_000, 30_000, 30_000, 30_000]);

        state.record_success();
        assert_eq!(state.current_interval(), Duration::from_secs(4));
        assert_eq!(state.snapshot().consecutive_rate_limits, 0);
    }

    #[test]
    fn threshold_rate_limits_pause_then_resume_resets() {
        let now = Instant::now();
        let mut state = PollingState::new(&cfg(3));
        state.record_rate_limit(now);
        state.record_rate_limit(now);
        let verdict = state.record_rate_limit(now);
        assert_eq!(
            verdict,
            PollVerdict::Pause {
                cooldown: Duration::from_secs(60)
            }
        );
        assert!(state.is_paused());
        assert_eq!(state.next_delay(now), Duration::from_secs(60));

        assert!(!state.resume_if_due(now + Duration::from_secs(59)));
        assert!(state.resume_if_due(now + Duration::from_secs(60)));
        let snap = state.snapshot();
        assert!(!snap.paused);
        assert_eq!(snap.consecutive_rate_limits, 0);
        assert_eq!(snap.current_interval, Duration::from_secs(4));
    }

    #[test]
    fn generic_errors_stop_once_at_threshold() {
        let mut state = PollingState::new(&cfg(3));
        assert_eq!(state.record_error("timeout"), PollVerdict::Continue);
        assert_eq!(state.record_error("timeout"), PollVerdict::Continue);
        match state.record_error("connection reset") {
            PollVerdict::Stop(PollStopReason::TooManyErrors { count, last_error }) => {
                assert_eq!(count, 3);
                assert_eq!(last_error, "connection reset");
            }
            other => panic!("expected stop, got {other:?}"),
        }
        assert!(!state.is_active());
        assert_eq!(state.record_error("again"), PollVerdict::AlreadyStopped);
    }

    #[test]
    fn success_between_errors_resets_counter() {
        let mut state = PollingState::new(&cfg(3));
        state.record_error("a");
        state.record_error("b");
        state.record_success();
        assert_eq!(state.record_error("c"), PollVerdict::Continue);
        assert!(state.is_active());
    }

    #[test]
    fn not_found_and_auth_stop_immediately() {
        let now = Instant::now();
        let mut state = PollingState::new(&cfg(3));
        assert_eq!(
            state.record_failure(&ConsoleError::not_found("console log"), now),
            PollVerdict::Stop(PollStopReason::NotFound)
        );

        let mut state = PollingState::new(&cfg(3));
        let auth = ConsoleError::AuthExpired {
            message: "token expired".into(),
        };
        assert_eq!(
            state.record_failure(&auth, now),
            PollVerdict::Stop(PollStopReason::AuthExpired)
        );
        assert_eq!(state.record_failure(&auth, now), PollVerdict::AlreadyStopped);
    }

    #[test]
    fn rate_limits_do_not_count_as_errors() {
        let now = Instant::now();
        let mut state = PollingState::new(&cfg(10));
        for _ in 0..4 {
            state.record_rate_limit(now);
        }
        assert_eq!(state.snapshot().consecutive_errors, 0);
        assert!(state.is_active());
    }
}
