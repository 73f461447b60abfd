//! Adaptive console log poller.
//!
//! One `Poller` exists per open session. It fetches the console log on a
//! steady cadence, merges results into the shared `LogBuffer`, and applies
//! the pacing rules from `PollingState`. At most one fetch is in flight at
//! a time; a tick that finds a fetch outstanding is skipped, not queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::ConsoleBackend;
use crate::config::PollingConfig;
use crate::event::{ConsoleEvent, ConsoleEventKind, ConsoleEventSink};
use crate::lock_unpoisoned;
use crate::log_buffer::LogBuffer;
use crate::pacing::{PollVerdict, PollingSnapshot, PollingState};
use crate::types::{ConnectionState, Session};

/// Why a tick did not fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InFlight,
    Paused,
    Degraded,
}

/// Result of one poll attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Fetched { new_lines: usize },
    Skipped(SkipReason),
    Failed,
    /// Polling is over for this session (stopped or cancelled).
    Stopped,
}

pub struct Poller {
    backend: Arc<dyn ConsoleBackend>,
    session: Session,
    pacing: Mutex<PollingState>,
    in_flight: AtomicBool,
    buffer: Arc<Mutex<LogBuffer>>,
    events: Arc<dyn ConsoleEventSink>,
    link_state: watch::Receiver<ConnectionState>,
    token: CancellationToken,
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Poller {
    pub fn new(
        backend: Arc<dyn ConsoleBackend>,
        session: Session,
        cfg: &PollingConfig,
        buffer: Arc<Mutex<LogBuffer>>,
        events: Arc<dyn ConsoleEventSink>,
        link_state: watch::Receiver<ConnectionState>,
        token: CancellationToken,
    ) -> Self {
        Self {
            backend,
            session,
            pacing: Mutex::new(PollingState::new(cfg)),
            in_flight: AtomicBool::new(false),
            buffer,
            events,
            link_state,
            token,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn snapshot(&self) -> PollingSnapshot {
        lock_unpoisoned(&self.pacing).snapshot()
    }

    pub fn current_interval(&self) -> Duration {
        lock_unpoisoned(&self.pacing).current_interval()
    }

    pub fn is_fetch_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Run one poll attempt.
    pub async fn poll_once(&self) -> PollOutcome {
        if self.token.is_cancelled() || !lock_unpoisoned(&self.pacing).is_active() {
            return PollOutcome::Stopped;
        }
        let degraded = *self.link_state.borrow() == ConnectionState::Error;
        if degraded {
            return PollOutcome::Skipped(SkipReason::Degraded);
        }

        let resumed = {
            let mut pacing = lock_unpoisoned(&self.pacing);
            if !pacing.is_paused() {
                false
            } else if pacing.resume_if_due(Instant::now()) {
                true
            } else {
                return PollOutcome::Skipped(SkipReason::Paused);
            }
        };
        if resumed {
            debug!(node_id = %self.session.node_id, "rate limit cooldown elapsed");
            self.emit(ConsoleEventKind::PollingResumed);
        }

        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            return PollOutcome::Skipped(SkipReason::InFlight);
        };

        let result = self
            .backend
            .fetch_log(
                &self.session.lab_id,
                &self.session.node_id,
                &self.session.console_id,
            )
            .await;

        // The session may have closed while the request was outstanding.
        if self.token.is_cancelled() {
            return PollOutcome::Stopped;
        }

        match result {
            Ok(payload) => {
                lock_unpoisoned(&self.pacing).record_success();
                let added = lock_unpoisoned(&self.buffer).merge(payload);
                let new_lines = added.len();
                if new_lines > 0 {
                    self.emit(ConsoleEventKind::LogAppended { lines: added });
                }
                PollOutcome::Fetched { new_lines }
            }
            Err(err) => {
                let verdict = lock_unpoisoned(&self.pacing).record_failure(&err, Instant::now());
                match verdict {
                    PollVerdict::Continue => {
                        debug!(
                            node_id = %self.session.node_id,
                            error = %err,
                            interval_ms = self.current_interval().as_millis() as u64,
                            "console log fetch failed"
                        );
                        PollOutcome::Failed
                    }
                    PollVerdict::Pause { cooldown } => {
                        warn!(
                            node_id = %self.session.node_id,
                            cooldown_ms = cooldown.as_millis() as u64,
                            "console log fetch rate limited, pausing"
                        );
                        self.emit(ConsoleEventKind::PollingPaused { cooldown });
                        PollOutcome::Failed
                    }
                    PollVerdict::Stop(reason) => {
                        warn!(
                            node_id = %self.session.node_id,
                            error = %err,
                            "console log polling stopped"
                        );
                        self.emit(ConsoleEventKind::PollingStopped { reason });
                        PollOutcome::Stopped
                    }
                    PollVerdict::AlreadyStopped => PollOutcome::Stopped,
                }
            }
        }
    }

    /// Steady poll loop. Waits `initial_delay`, then polls at the current
    /// pacing interval until polling stops or the session is cancelled.
    pub async fn run(self: Arc<Self>, initial_delay: Duration) {
        if !self.sleep_unless_cancelled(initial_delay).await {
            return;
        }
        loop {
            if self.poll_once().await == PollOutcome::Stopped {
                break;
            }
            let delay = lock_unpoisoned(&self.pacing).next_delay(Instant::now());
            if !self.sleep_unless_cancelled(delay).await {
                break;
            }
        }
        debug!(node_id = %self.session.node_id, "steady poll loop exited");
    }

    /// Sleep for `delay`. Returns false if the session was cancelled first.
    pub async fn sleep_unless_cancelled(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn emit(&self, kind: ConsoleEventKind) {
        self.events.record(ConsoleEvent::new(
            Some(self.session.node_id.clone()),
            Some(self.session.session_id.clone()),
            kind,
        ));
    }
}

/// Random delay in `[0, max]` before a session's first fetch, so sessions
/// opened together do not poll in lockstep.
pub fn initial_jitter(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}
