//! Console session manager.
//!
//! `ConsoleManager` owns the single console slot: at most one session is
//! open at a time and opening another one closes the current one first.
//! Background work for a session (steady polling, poll bursts, link
//! probes) lives in that session's `SessionScope` and dies with it.
//!
//! Locking:
//! - `lifecycle` (async) serializes `open` and `close`.
//! - The dispatcher gate (async) serializes command writes, the open
//!   transition, and queue flushes.
//! - Plain `std::sync::Mutex`es guard in-memory state and are never held
//!   across an await.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::ConsoleBackend;
use crate::config::ConsoleConfig;
use crate::dispatcher::{DispatchTarget, Dispatcher};
use crate::error::ConsoleError;
use crate::event::{ConsoleEvent, ConsoleEventKind, ConsoleEventSink};
use crate::lock_unpoisoned;
use crate::log_buffer::LogBuffer;
use crate::pacing::PollingSnapshot;
use crate::poller::{initial_jitter, Poller};
use crate::quality::{ensure_reachable, ProbeReading, QualityEstimator};
use crate::scope::SessionScope;
use crate::session::SessionStore;
use crate::types::{
    ConnectionState, ConsoleInfo, PendingCommand, QualitySample, SendOutcome, Session,
};

struct ActiveSession {
    scope: Arc<SessionScope>,
    poller: Arc<Poller>,
}

struct Core {
    backend: Arc<dyn ConsoleBackend>,
    config: ConsoleConfig,
    events: Arc<dyn ConsoleEventSink>,
    store: Mutex<SessionStore>,
    buffer: Arc<Mutex<LogBuffer>>,
    dispatcher: Dispatcher,
    estimator: Mutex<QualityEstimator>,
    active: Mutex<Option<ActiveSession>>,
    lifecycle: tokio::sync::Mutex<()>,
}

pub struct ConsoleManager {
    core: Arc<Core>,
}

impl ConsoleManager {
    pub fn new(
        backend: Arc<dyn ConsoleBackend>,
        config: ConsoleConfig,
        events: Arc<dyn ConsoleEventSink>,
    ) -> Self {
        let core = Core {
            buffer: Arc::new(Mutex::new(LogBuffer::new(config.buffer.capacity))),
            dispatcher: Dispatcher::new(config.burst.clone(), events.clone()),
            estimator: Mutex::new(QualityEstimator::new(config.quality.clone())),
            store: Mutex::new(SessionStore::new()),
            active: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            backend,
            config,
            events,
        };
        Self {
            core: Arc::new(core),
        }
    }

    pub fn config(&self) -> &ConsoleConfig {
        &self.core.config
    }

    pub fn state(&self) -> ConnectionState {
        lock_unpoisoned(&self.core.store).state()
    }

    pub fn session(&self) -> Option<Session> {
        lock_unpoisoned(&self.core.store).session().cloned()
    }

    /// Watch connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        lock_unpoisoned(&self.core.store).subscribe()
    }

    /// Retained console lines, oldest first.
    pub fn log_lines(&self) -> Vec<String> {
        lock_unpoisoned(&self.core.buffer).texts()
    }

    pub fn pending_commands(&self) -> Vec<PendingCommand> {
        self.core.dispatcher.pending()
    }

    /// Drop every queued command. Returns how many were dropped.
    pub fn clear_queue(&self) -> usize {
        self.core.dispatcher.clear_queue()
    }

    /// Most recent successful link probe.
    pub fn quality(&self) -> Option<QualitySample> {
        lock_unpoisoned(&self.core.estimator).latest().copied()
    }

    /// Pacing state of the active session's poller.
    pub fn polling(&self) -> Option<PollingSnapshot> {
        lock_unpoisoned(&self.core.active)
            .as_ref()
            .map(|active| active.poller.snapshot())
    }

    pub async fn list_consoles(
        &self,
        lab_id: &str,
        node_id: &str,
    ) -> Result<Vec<ConsoleInfo>, ConsoleError> {
        self.core.backend.list_consoles(lab_id, node_id).await
    }

    /// Open a console session on `node_id`, closing the current session
    /// first. Queued commands are flushed into the new session before this
    /// returns.
    pub async fn open(
        &self,
        lab_id: &str,
        node_id: &str,
        console_type: Option<&str>,
    ) -> Result<Session, ConsoleError> {
        let lab_id = lab_id.trim();
        let node_id = node_id.trim();
        if lab_id.is_empty() {
            return Err(ConsoleError::invalid("lab id is empty"));
        }
        if node_id.is_empty() {
            return Err(ConsoleError::invalid("node id is empty"));
        }
        let console_type = console_type.map(str::trim).filter(|t| !t.is_empty());

        let core = &self.core;
        let _lifecycle = core.lifecycle.lock().await;

        let previous = lock_unpoisoned(&core.store).session().cloned();
        if let Some(previous) = previous {
            let reason = if previous.node_id == node_id {
                "session replaced"
            } else {
                "node switch"
            };
            core.close_locked(reason).await;
        }

        lock_unpoisoned(&core.store).begin_connect()?;
        info!(lab_id, node_id, "opening console session");

        match ensure_reachable(core.backend.as_ref()).await {
            Ok(probe) => {
                lock_unpoisoned(&core.estimator).record(Ok(probe));
            }
            Err(err) => return Err(core.fail_open(node_id, err)),
        }

        let created = match core
            .backend
            .create_session(lab_id, node_id, console_type)
            .await
        {
            Ok(created) => created,
            Err(err @ ConsoleError::AuthExpired { .. }) => return Err(core.fail_open(node_id, err)),
            Err(other) => {
                return Err(core.fail_open(
                    node_id,
                    ConsoleError::CreateFailed {
                        node_id: node_id.to_string(),
                        message: other.to_string(),
                    },
                ))
            }
        };

        let console_id = match created.console_id.clone().filter(|id| !id.is_empty()) {
            Some(id) => id,
            None => match core.resolve_console(lab_id, node_id, console_type).await {
                Ok(id) => id,
                Err(err) => {
                    core.release_remote(&created.session_id).await;
                    return Err(core.fail_open(
                        node_id,
                        ConsoleError::CreateFailed {
                            node_id: node_id.to_string(),
                            message: err.to_string(),
                        },
                    ));
                }
            },
        };

        let session = Session {
            session_id: created.session_id,
            lab_id: lab_id.to_string(),
            node_id: node_id.to_string(),
            console_id,
            protocol: created.protocol,
            console_type: created
                .console_type
                .or_else(|| console_type.map(str::to_string)),
            opened_at: Utc::now(),
        };

        core.activate(&session).await?;
        Ok(session)
    }

    /// Close the current session. Returns the session that was closed, or
    /// `None` if nothing was open; the reason is reported either way.
    pub async fn close(&self, reason: &str) -> Option<Session> {
        let _lifecycle = self.core.lifecycle.lock().await;
        self.core.close_locked(reason).await
    }

    /// Send a command to the open session, or queue it while none is open.
    pub async fn send(&self, command: &str) -> Result<SendOutcome, ConsoleError> {
        if command.trim().is_empty() {
            return Err(ConsoleError::invalid("command is empty"));
        }
        let gate = self.core.dispatcher.lock().await;
        let target = self.core.dispatch_target(true);
        self.core
            .dispatcher
            .submit(&gate, target.as_ref(), command)
            .await
    }

    /// Run one link check now instead of waiting for the probe cadence.
    pub async fn probe_now(&self) -> ProbeReading {
        self.core.check_link(None).await
    }

    /// Tear the session down locally without waiting on the backend. The
    /// remote close is fired off in the background when a runtime is
    /// available.
    pub fn shutdown(&self, reason: &str) {
        self.core.teardown_local(reason);
    }
}

impl Drop for ConsoleManager {
    fn drop(&mut self) {
        self.core.teardown_local("manager dropped");
    }
}

impl Core {
    fn emit(&self, session: Option<&Session>, kind: ConsoleEventKind) {
        self.events.record(ConsoleEvent::new(
            session.map(|s| s.node_id.clone()),
            session.map(|s| s.session_id.clone()),
            kind,
        ));
    }

    fn fail_open(&self, node_id: &str, err: ConsoleError) -> ConsoleError {
        if let Err(transition) = lock_unpoisoned(&self.store).connect_failed() {
            warn!(error = %transition, "unexpected state after failed open");
        }
        warn!(node_id, error = %err, "console session open failed");
        self.events.record(ConsoleEvent::new(
            Some(node_id.to_string()),
            None,
            ConsoleEventKind::SessionFailed {
                reason: err.to_string(),
            },
        ));
        err
    }

    /// Best-effort remote close for a session that never became active.
    async fn release_remote(&self, session_id: &str) {
        if let Err(err) = self.backend.close_session(session_id).await {
            warn!(session_id, error = %err, "failed to release unused remote session");
        }
    }

    async fn resolve_console(
        &self,
        lab_id: &str,
        node_id: &str,
        console_type: Option<&str>,
    ) -> Result<String, ConsoleError> {
        let consoles = self.backend.list_consoles(lab_id, node_id).await?;
        let preferred = console_type.and_then(|wanted| {
            consoles
                .iter()
                .find(|c| c.console_type.as_deref() == Some(wanted))
        });
        preferred
            .or_else(|| consoles.first())
            .map(|c| c.id.clone())
            .ok_or_else(|| ConsoleError::not_found(format!("console for node {node_id}")))
    }

    /// Bring a freshly created session online: start its scope, flip the
    /// store to open, and flush queued commands while holding the gate.
    async fn activate(self: &Arc<Self>, session: &Session) -> Result<(), ConsoleError> {
        let scope = Arc::new(SessionScope::new());
        let link_state = lock_unpoisoned(&self.store).subscribe();
        let poller = Arc::new(Poller::new(
            self.backend.clone(),
            session.clone(),
            &self.config.polling,
            self.buffer.clone(),
            self.events.clone(),
            link_state,
            scope.token(),
        ));

        let gate = self.dispatcher.lock().await;
        // The active slot is filled under the store lock, so a concurrent
        // teardown sees either no session or this session's scope.
        let opened = {
            let mut store = lock_unpoisoned(&self.store);
            let opened = store.connect_succeeded(session.clone());
            if opened.is_ok() {
                *lock_unpoisoned(&self.active) = Some(ActiveSession {
                    scope: scope.clone(),
                    poller: poller.clone(),
                });
            }
            opened
        };
        if let Err(err) = opened {
            drop(gate);
            scope.cancel();
            warn!(
                node_id = %session.node_id,
                session_id = %session.session_id,
                error = %err,
                "session torn down while opening"
            );
            self.release_remote(&session.session_id).await;
            let cancelled = ConsoleError::Cancelled {
                operation: "session open".into(),
            };
            self.events.record(ConsoleEvent::new(
                Some(session.node_id.clone()),
                None,
                ConsoleEventKind::SessionFailed {
                    reason: cancelled.to_string(),
                },
            ));
            return Err(cancelled);
        }
        lock_unpoisoned(&self.buffer).clear();
        info!(
            lab_id = %session.lab_id,
            node_id = %session.node_id,
            session_id = %session.session_id,
            console_id = %session.console_id,
            "console session open"
        );
        self.emit(Some(session), ConsoleEventKind::SessionOpened);

        let jitter = initial_jitter(self.config.polling.initial_jitter_max());
        debug!(jitter_ms = jitter.as_millis() as u64, "starting console poller");
        scope.spawn(poller.clone().run(jitter));
        scope.spawn(link_monitor(
            Arc::downgrade(self),
            scope.token(),
            self.config.quality.probe_interval(),
        ));

        let target = DispatchTarget {
            backend: self.backend.clone(),
            session: session.clone(),
            poller,
            buffer: self.buffer.clone(),
            scope,
        };
        let report = self.dispatcher.flush(&gate, &target).await;
        if report.sent > 0 || report.requeued > 0 {
            info!(
                sent = report.sent,
                requeued = report.requeued,
                "queued commands flushed"
            );
        }
        Ok(())
    }

    /// Writable view of the active session. With `require_open`, only while
    /// the store is open (not degraded).
    fn dispatch_target(&self, require_open: bool) -> Option<DispatchTarget> {
        let session = {
            let store = lock_unpoisoned(&self.store);
            if require_open && !store.state().accepts_input() {
                return None;
            }
            store.session()?.clone()
        };
        let active = lock_unpoisoned(&self.active);
        let active = active.as_ref()?;
        Some(DispatchTarget {
            backend: self.backend.clone(),
            session,
            poller: active.poller.clone(),
            buffer: self.buffer.clone(),
            scope: active.scope.clone(),
        })
    }

    async fn close_locked(&self, reason: &str) -> Option<Session> {
        if let Some(active) = lock_unpoisoned(&self.active).take() {
            active.scope.cancel();
        }

        let (closing, in_closing) = {
            let mut store = lock_unpoisoned(&self.store);
            let closing = store.begin_close();
            (closing, store.state() == ConnectionState::Closing)
        };
        if !in_closing {
            info!(reason, "close requested with no session open");
            self.emit(
                None,
                ConsoleEventKind::SessionClosed {
                    reason: reason.to_string(),
                },
            );
            return None;
        }

        if let Some(session) = &closing {
            if let Err(err) = self.backend.close_session(&session.session_id).await {
                warn!(
                    session_id = %session.session_id,
                    error = %err,
                    "remote session close failed"
                );
            }
        }
        if let Err(err) = lock_unpoisoned(&self.store).finish_close() {
            warn!(error = %err, "unexpected state while closing");
        }

        info!(
            node_id = closing.as_ref().map(|s| s.node_id.as_str()).unwrap_or("-"),
            reason,
            "console session closed"
        );
        self.emit(
            closing.as_ref(),
            ConsoleEventKind::SessionClosed {
                reason: reason.to_string(),
            },
        );
        closing
    }

    fn teardown_local(&self, reason: &str) {
        if let Some(active) = lock_unpoisoned(&self.active).take() {
            active.scope.cancel();
        }
        let Some(session) = lock_unpoisoned(&self.store).reset_local() else {
            return;
        };

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let backend = self.backend.clone();
            let session_id = session.session_id.clone();
            runtime.spawn(async move {
                if let Err(err) = backend.close_session(&session_id).await {
                    warn!(session_id, error = %err, "background session close failed");
                }
            });
        }
        info!(node_id = %session.node_id, reason, "console session torn down");
        self.emit(
            Some(&session),
            ConsoleEventKind::SessionClosed {
                reason: reason.to_string(),
            },
        );
    }

    /// One reachability probe. A failure degrades an open session; a
    /// success recovers a degraded one and flushes commands queued while it
    /// was degraded.
    async fn check_link(&self, token: Option<&CancellationToken>) -> ProbeReading {
        let probe = self.backend.probe_availability().await;
        let reading = lock_unpoisoned(&self.estimator).record(probe);
        if token.is_some_and(CancellationToken::is_cancelled) {
            return reading;
        }

        match reading.clone() {
            ProbeReading::Unreachable(detail) => {
                let degraded = {
                    let mut store = lock_unpoisoned(&self.store);
                    if store.mark_degraded() {
                        store.session().cloned()
                    } else {
                        None
                    }
                };
                if let Some(session) = degraded {
                    warn!(node_id = %session.node_id, detail = %detail, "console link degraded");
                    self.emit(
                        Some(&session),
                        ConsoleEventKind::LinkDegraded { detail },
                    );
                }
            }
            ProbeReading::Reachable(sample) => {
                if lock_unpoisoned(&self.store).state() != ConnectionState::Error {
                    return reading;
                }
                let gate = self.dispatcher.lock().await;
                let recovered = {
                    let mut store = lock_unpoisoned(&self.store);
                    if store.mark_recovered() {
                        store.session().cloned()
                    } else {
                        None
                    }
                };
                if let Some(session) = recovered {
                    info!(
                        node_id = %session.node_id,
                        latency_ms = sample.latency.as_millis() as u64,
                        tier = %sample.tier,
                        "console link recovered"
                    );
                    self.emit(
                        Some(&session),
                        ConsoleEventKind::LinkRecovered {
                            latency: sample.latency,
                            tier: sample.tier,
                        },
                    );
                    if let Some(target) = self.dispatch_target(false) {
                        self.dispatcher.flush(&gate, &target).await;
                    }
                }
            }
        }
        reading
    }
}

async fn link_monitor(core: Weak<Core>, token: CancellationToken, interval: Duration) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        let Some(core) = core.upgrade() else {
            break;
        };
        core.check_link(Some(&token)).await;
    }
}
