//! Console backend trait: the remote operations the session manager consumes.
//!
//! Implementations can talk to the lab portal REST API or be mocked for
//! testing.

use async_trait::async_trait;

use crate::error::ConsoleError;
use crate::types::{ConsoleInfo, CreatedSession, LogPayload, ProbeResult, Session};

/// The console backend interface.
#[async_trait]
pub trait ConsoleBackend: Send + Sync {
    /// List the consoles a node exposes.
    async fn list_consoles(
        &self,
        lab_id: &str,
        node_id: &str,
    ) -> Result<Vec<ConsoleInfo>, ConsoleError>;

    /// Ask the backend to create a console session for a node.
    async fn create_session(
        &self,
        lab_id: &str,
        node_id: &str,
        console_type: Option<&str>,
    ) -> Result<CreatedSession, ConsoleError>;

    /// Close a remote session. Callers treat failures as best effort.
    async fn close_session(&self, session_id: &str) -> Result<(), ConsoleError>;

    /// Fetch the current console log of a node.
    async fn fetch_log(
        &self,
        lab_id: &str,
        node_id: &str,
        console_id: &str,
    ) -> Result<LogPayload, ConsoleError>;

    /// Write a command line into an open session.
    async fn send_command(&self, session: &Session, command: &str) -> Result<(), ConsoleError>;

    /// Check backend reachability and measure round-trip latency.
    async fn probe_availability(&self) -> Result<ProbeResult, ConsoleError>;
}
