//! Mock console backend for testing.
//!
//! Provides a scriptable backend that records all calls and returns
//! pre-configured responses. Scripted results are consumed in order; once a
//! script runs dry the matching fallback is returned.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::ConsoleBackend;
use crate::error::ConsoleError;
use crate::lock_unpoisoned;
use crate::types::{ConsoleInfo, CreatedSession, LogPayload, ProbeResult, Session};

/// A recorded call to the mock backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    ListConsoles {
        lab_id: String,
        node_id: String,
    },
    CreateSession {
        lab_id: String,
        node_id: String,
        console_type: Option<String>,
    },
    CloseSession {
        session_id: String,
    },
    FetchLog {
        node_id: String,
        console_id: String,
    },
    SendCommand {
        session_id: String,
        command: String,
    },
    Probe,
}

/// Mock implementation of `ConsoleBackend` for testing.
pub struct MockConsoleBackend {
    calls: Mutex<Vec<MockCall>>,
    consoles: Mutex<HashMap<String, Vec<ConsoleInfo>>>,
    create_errors: Mutex<VecDeque<ConsoleError>>,
    create_omits_console: Mutex<bool>,
    create_delay: Mutex<Duration>,
    close_error: Mutex<Option<ConsoleError>>,
    fetch_script: Mutex<VecDeque<Result<LogPayload, ConsoleError>>>,
    fetch_fallback: Mutex<Result<LogPayload, ConsoleError>>,
    fetch_delay: Mutex<Duration>,
    probe_script: Mutex<VecDeque<Result<ProbeResult, ConsoleError>>>,
    probe_fallback: Mutex<Result<ProbeResult, ConsoleError>>,
    send_errors: Mutex<VecDeque<ConsoleError>>,
    command_output: Mutex<HashMap<String, LogPayload>>,
    session_seq: AtomicU32,
}

impl Default for MockConsoleBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConsoleBackend {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            consoles: Mutex::new(HashMap::new()),
            create_errors: Mutex::new(VecDeque::new()),
            create_omits_console: Mutex::new(false),
            create_delay: Mutex::new(Duration::ZERO),
            close_error: Mutex::new(None),
            fetch_script: Mutex::new(VecDeque::new()),
            fetch_fallback: Mutex::new(Ok(LogPayload::Lines(Vec::new()))),
            fetch_delay: Mutex::new(Duration::ZERO),
            probe_script: Mutex::new(VecDeque::new()),
            probe_fallback: Mutex::new(Ok(ProbeResult {
                reachable: true,
                latency: Duration::from_millis(20),
            })),
            send_errors: Mutex::new(VecDeque::new()),
            command_output: Mutex::new(HashMap::new()),
            session_seq: AtomicU32::new(0),
        }
    }

    // ── builder ──

    /// Consoles reported for a node. Nodes without an entry expose a single
    /// serial console.
    pub fn with_consoles(self, node_id: &str, consoles: Vec<ConsoleInfo>) -> Self {
        lock_unpoisoned(&self.consoles).insert(node_id.to_string(), consoles);
        self
    }

    /// Fail the next session create with `err`.
    pub fn with_create_error(self, err: ConsoleError) -> Self {
        lock_unpoisoned(&self.create_errors).push_back(err);
        self
    }

    /// Create responses carry no console id, forcing a console lookup.
    pub fn without_console_on_create(self) -> Self {
        *lock_unpoisoned(&self.create_omits_console) = true;
        self
    }

    /// Delay every session create by `delay`.
    pub fn with_create_delay(self, delay: Duration) -> Self {
        *lock_unpoisoned(&self.create_delay) = delay;
        self
    }

    pub fn with_close_error(self, err: ConsoleError) -> Self {
        *lock_unpoisoned(&self.close_error) = Some(err);
        self
    }

    /// Delay every log fetch by `delay`.
    pub fn with_fetch_delay(self, delay: Duration) -> Self {
        *lock_unpoisoned(&self.fetch_delay) = delay;
        self
    }

    pub fn with_probe_latency(self, latency: Duration) -> Self {
        *lock_unpoisoned(&self.probe_fallback) = Ok(ProbeResult {
            reachable: true,
            latency,
        });
        self
    }

    /// After `command` is sent, the next fetch returns `output`.
    pub fn with_command_output(self, command: &str, output: LogPayload) -> Self {
        lock_unpoisoned(&self.command_output).insert(command.to_string(), output);
        self
    }

    // ── scripting ──

    pub fn push_fetch(&self, result: Result<LogPayload, ConsoleError>) {
        lock_unpoisoned(&self.fetch_script).push_back(result);
    }

    pub fn push_fetch_lines(&self, lines: &[&str]) {
        self.push_fetch(Ok(LogPayload::Lines(
            lines.iter().map(|l| l.to_string()).collect(),
        )));
    }

    /// Result returned once the fetch script is exhausted.
    pub fn set_fetch_fallback(&self, result: Result<LogPayload, ConsoleError>) {
        *lock_unpoisoned(&self.fetch_fallback) = result;
    }

    pub fn push_probe(&self, result: Result<ProbeResult, ConsoleError>) {
        lock_unpoisoned(&self.probe_script).push_back(result);
    }

    /// Result returned once the probe script is exhausted.
    pub fn set_probe_fallback(&self, result: Result<ProbeResult, ConsoleError>) {
        *lock_unpoisoned(&self.probe_fallback) = result;
    }

    /// Make the backend unreachable (or reachable again) for every
    /// following probe.
    pub fn set_reachable(&self, reachable: bool) {
        let result = if reachable {
            Ok(ProbeResult {
                reachable: true,
                latency: Duration::from_millis(20),
            })
        } else {
            Err(ConsoleError::Unreachable {
                message: "connection refused".into(),
            })
        };
        self.set_probe_fallback(result);
    }

    /// Fail the next command write with `err`.
    pub fn fail_next_send(&self, err: ConsoleError) {
        lock_unpoisoned(&self.send_errors).push_back(err);
    }

    // ── inspection ──

    pub fn calls(&self) -> Vec<MockCall> {
        lock_unpoisoned(&self.calls).clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.count_calls(|c| matches!(c, MockCall::FetchLog { .. }))
    }

    pub fn probe_count(&self) -> usize {
        self.count_calls(|c| matches!(c, MockCall::Probe))
    }

    pub fn create_count(&self) -> usize {
        self.count_calls(|c| matches!(c, MockCall::CreateSession { .. }))
    }

    /// Commands written to remote sessions, in order.
    pub fn sent_commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::SendCommand { command, .. } => Some(command),
                _ => None,
            })
            .collect()
    }

    /// Session ids closed remotely, in order.
    pub fn closed_sessions(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::CloseSession { session_id } => Some(session_id),
                _ => None,
            })
            .collect()
    }

    fn count_calls(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        lock_unpoisoned(&self.calls).iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: MockCall) {
        lock_unpoisoned(&self.calls).push(call);
    }
}

#[async_trait]
impl ConsoleBackend for MockConsoleBackend {
    async fn list_consoles(
        &self,
        lab_id: &str,
        node_id: &str,
    ) -> Result<Vec<ConsoleInfo>, ConsoleError> {
        self.record(MockCall::ListConsoles {
            lab_id: lab_id.to_string(),
            node_id: node_id.to_string(),
        });
        let configured = lock_unpoisoned(&self.consoles).get(node_id).cloned();
        Ok(configured.unwrap_or_else(|| {
            vec![ConsoleInfo {
                id: format!("con-{node_id}"),
                console_type: Some("serial".into()),
                protocol: Some("telnet".into()),
            }]
        }))
    }

    async fn create_session(
        &self,
        lab_id: &str,
        node_id: &str,
        console_type: Option<&str>,
    ) -> Result<CreatedSession, ConsoleError> {
        self.record(MockCall::CreateSession {
            lab_id: lab_id.to_string(),
            node_id: node_id.to_string(),
            console_type: console_type.map(str::to_string),
        });
        let delay = *lock_unpoisoned(&self.create_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = lock_unpoisoned(&self.create_errors).pop_front() {
            return Err(err);
        }
        let seq = self.session_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let console_id = if *lock_unpoisoned(&self.create_omits_console) {
            None
        } else {
            Some(format!("con-{node_id}"))
        };
        Ok(CreatedSession {
            session_id: format!("sess-{seq}"),
            node_id: Some(node_id.to_string()),
            console_id,
            protocol: Some("telnet".into()),
            console_type: console_type.map(str::to_string),
        })
    }

    async fn close_session(&self, session_id: &str) -> Result<(), ConsoleError> {
        self.record(MockCall::CloseSession {
            session_id: session_id.to_string(),
        });
        match lock_unpoisoned(&self.close_error).clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn fetch_log(
        &self,
        _lab_id: &str,
        node_id: &str,
        console_id: &str,
    ) -> Result<LogPayload, ConsoleError> {
        self.record(MockCall::FetchLog {
            node_id: node_id.to_string(),
            console_id: console_id.to_string(),
        });
        let delay = *lock_unpoisoned(&self.fetch_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let scripted = lock_unpoisoned(&self.fetch_script).pop_front();
        match scripted {
            Some(result) => result,
            None => lock_unpoisoned(&self.fetch_fallback).clone(),
        }
    }

    async fn send_command(&self, session: &Session, command: &str) -> Result<(), ConsoleError> {
        self.record(MockCall::SendCommand {
            session_id: session.session_id.clone(),
            command: command.to_string(),
        });
        if let Some(err) = lock_unpoisoned(&self.send_errors).pop_front() {
            return Err(err);
        }
        let output = lock_unpoisoned(&self.command_output).get(command).cloned();
        if let Some(output) = output {
            self.push_fetch(Ok(output));
        }
        Ok(())
    }

    async fn probe_availability(&self) -> Result<ProbeResult, ConsoleError> {
        self.record(MockCall::Probe);
        let scripted = lock_unpoisoned(&self.probe_script).pop_front();
        match scripted {
            Some(result) => result,
            None => lock_unpoisoned(&self.probe_fallback).clone(),
        }
    }
}
