//! Transport-agnostic console session types.
//!
//! These types provide the domain model for console operations, decoupled
//! from the REST wire format.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection state of the single console slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Error,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Error => "error",
        }
    }

    /// Whether commands can be written to the remote session right now.
    pub fn accepts_input(self) -> bool {
        matches!(self, Self::Open)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open console session against one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub lab_id: String,
    pub node_id: String,
    pub console_id: String,
    pub protocol: Option<String>,
    pub console_type: Option<String>,
    pub opened_at: DateTime<Utc>,
}

/// A console exposed by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleInfo {
    pub id: String,
    #[serde(rename = "type", default)]
    pub console_type: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
}

/// Backend response to a session create request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedSession {
    #[serde(alias = "sessionId")]
    pub session_id: String,
    #[serde(alias = "nodeId", default)]
    pub node_id: Option<String>,
    #[serde(alias = "consoleId", default)]
    pub console_id: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(rename = "type", default)]
    pub console_type: Option<String>,
}

/// Raw console log content as returned by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogPayload {
    Lines(Vec<String>),
    Blob(String),
}

impl LogPayload {
    /// Flatten the payload into individual lines. Entries of a line list may
    /// themselves contain line breaks and are split as well.
    pub fn into_lines(self) -> Vec<String> {
        match self {
            Self::Lines(lines) => lines
                .iter()
                .flat_map(|entry| entry.lines().map(str::to_string).collect::<Vec<_>>())
                .collect(),
            Self::Blob(blob) => blob.lines().map(str::to_string).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Lines(lines) => lines.is_empty(),
            Self::Blob(blob) => blob.is_empty(),
        }
    }
}

/// Result of a backend reachability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub reachable: bool,
    pub latency: Duration,
}

/// Coarse link quality classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QualityTier {
    Excellent,
    Good,
    Poor,
}

impl QualityTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Poor => "poor",
        }
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest latency measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualitySample {
    pub latency: Duration,
    pub tier: QualityTier,
    pub measured_at: DateTime<Utc>,
}

/// A command submitted while no session was open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub id: String,
    pub text: String,
    pub enqueued_at: DateTime<Utc>,
}

/// What happened to a submitted command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the open remote session.
    Accepted,
    /// Held in the command queue until a session opens.
    Queued { pending_id: String, position: usize },
}
