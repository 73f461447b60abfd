//! Console events emitted toward the UI, log, and notification layers.
//!
//! The session manager never talks to a notification mechanism directly;
//! every user-visible occurrence goes through a `ConsoleEventSink`.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::types::QualityTier;

/// Why polling ended for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStopReason {
    /// The console log endpoint or session is gone (404).
    NotFound,
    /// Credentials expired (401).
    AuthExpired,
    /// Too many consecutive generic failures.
    TooManyErrors { count: u32, last_error: String },
}

impl std::fmt::Display for PollStopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => f.write_str("console log endpoint not found"),
            Self::AuthExpired => f.write_str("authentication expired"),
            Self::TooManyErrors { count, last_error } => {
                write!(f, "{count} consecutive fetch errors (last: {last_error})")
            }
        }
    }
}

/// The kind of console occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEventKind {
    SessionOpened,
    SessionClosed { reason: String },
    SessionFailed { reason: String },
    CommandQueued { command: String, queue_len: usize },
    CommandSent { command: String },
    LogAppended { lines: Vec<String> },
    LinkDegraded { detail: String },
    LinkRecovered { latency: Duration, tier: QualityTier },
    PollingPaused { cooldown: Duration },
    PollingResumed,
    PollingStopped { reason: PollStopReason },
}

impl ConsoleEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionOpened => "session_opened",
            Self::SessionClosed { .. } => "session_closed",
            Self::SessionFailed { .. } => "session_failed",
            Self::CommandQueued { .. } => "command_queued",
            Self::CommandSent { .. } => "command_sent",
            Self::LogAppended { .. } => "log_appended",
            Self::LinkDegraded { .. } => "link_degraded",
            Self::LinkRecovered { .. } => "link_recovered",
            Self::PollingPaused { .. } => "polling_paused",
            Self::PollingResumed => "polling_resumed",
            Self::PollingStopped { .. } => "polling_stopped",
        }
    }
}

impl std::fmt::Display for ConsoleEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionOpened => f.write_str("session opened"),
            Self::SessionClosed { reason } => write!(f, "session closed: {reason}"),
            Self::SessionFailed { reason } => write!(f, "session failed: {reason}"),
            Self::CommandQueued { command, queue_len } => {
                write!(f, "queued {command:?} ({queue_len} pending)")
            }
            Self::CommandSent { command } => write!(f, "sent {command:?}"),
            Self::LogAppended { lines } => write!(f, "{} new log lines", lines.len()),
            Self::LinkDegraded { detail } => write!(f, "link degraded: {detail}"),
            Self::LinkRecovered { latency, tier } => {
                write!(f, "link recovered ({tier}, {}ms)", latency.as_millis())
            }
            Self::PollingPaused { cooldown } => {
                write!(f, "polling paused for {}s", cooldown.as_secs())
            }
            Self::PollingResumed => f.write_str("polling resumed"),
            Self::PollingStopped { reason } => write!(f, "polling stopped: {reason}"),
        }
    }
}

/// An event emitted by the session manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleEvent {
    pub timestamp: DateTime<Utc>,
    pub node_id: Option<String>,
    pub session_id: Option<String>,
    pub kind: ConsoleEventKind,
}

impl ConsoleEvent {
    pub fn new(
        node_id: Option<String>,
        session_id: Option<String>,
        kind: ConsoleEventKind,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            node_id,
            session_id,
            kind,
        }
    }
}

/// Trait for sinks that receive console events.
pub trait ConsoleEventSink: Send + Sync {
    fn record(&self, event: ConsoleEvent);
}

/// In-memory event sink for testing.
#[derive(Default)]
pub struct InMemoryEventSink {
    events: Mutex<Vec<ConsoleEvent>>,
}

impl InMemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ConsoleEvent> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Event names in emission order.
    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.kind.name()).collect()
    }

    /// Number of recorded events with the given name.
    pub fn count_of(&self, name: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.kind.name() == name)
            .count()
    }

    pub fn count(&self) -> usize {
        match self.events.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl ConsoleEventSink for InMemoryEventSink {
    fn record(&self, event: ConsoleEvent) {
        match self.events.lock() {
            Ok(mut guard) => guard.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// No-op event sink that discards all events.
pub struct NullEventSink;

impl ConsoleEventSink for NullEventSink {
    fn record(&self, _event: ConsoleEvent) {}
}

/// Forwards events to `tracing` at a level matching their severity.
pub struct TracingEventSink;

impl ConsoleEventSink for TracingEventSink {
    fn record(&self, event: ConsoleEvent) {
        let node = event.node_id.as_deref().unwrap_or("-");
        let session = event.session_id.as_deref().unwrap_or("-");
        match &event.kind {
            ConsoleEventKind::SessionFailed { .. }
            | ConsoleEventKind::LinkDegraded { .. }
            | ConsoleEventKind::PollingPaused { .. }
            | ConsoleEventKind::PollingStopped { .. } => {
                tracing::warn!(
                    node_id = node,
                    session_id = session,
                    event = event.kind.name(),
                    "{}",
                    event.kind
                );
            }
            ConsoleEventKind::LogAppended { .. } => {
                tracing::debug!(
                    node_id = node,
                    session_id = session,
                    event = event.kind.name(),
                    "{}",
                    event.kind
                );
            }
            _ => {
                tracing::info!(
                    node_id = node,
                    session_id = session,
                    event = event.kind.name(),
                    "{}",
                    event.kind
                );
            }
        }
    }
}

/// Pushes events onto an unbounded channel for a consumer task.
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<ConsoleEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConsoleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ConsoleEventSink for ChannelEventSink {
    fn record(&self, event: ConsoleEvent) {
        // A dropped receiver means nobody is listening anymore.
        let _ = self.tx.send(event);
    }
}

/// Fans one event out to several sinks.
pub struct FanoutEventSink {
    sinks: Vec<std::sync::Arc<dyn ConsoleEventSink>>,
}

impl FanoutEventSink {
    pub fn new(sinks: Vec<std::sync::Arc<dyn ConsoleEventSink>>) -> Self {
        Self { sinks }
    }
}

impl ConsoleEventSink for FanoutEventSink {
    fn record(&self, event: ConsoleEvent) {
        for sink in &self.sinks {
            sink.record(event.clone());
        }
    }
}
