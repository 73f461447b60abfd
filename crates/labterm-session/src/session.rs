//! Single-slot session store.
//!
//! Holds the connection state and the active session record. Every state
//! change goes through `lifecycle::validate_transition` and is published on
//! a watch channel so background tasks can react without holding the store.

use tokio::sync::watch;

use crate::lifecycle::{validate_transition, TransitionError};
use crate::types::{ConnectionState, Session};

pub struct SessionStore {
    state: ConnectionState,
    session: Option<Session>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            state: ConnectionState::Idle,
            session: None,
            state_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn transition(&mut self, to: ConnectionState) -> Result<(), TransitionError> {
        validate_transition(self.state, to)?;
        self.set(to);
        Ok(())
    }

    fn set(&mut self, to: ConnectionState) {
        self.state = to;
        self.state_tx.send_replace(to);
    }

    /// Enter `Connecting`. Valid from idle, closed, and error.
    pub fn begin_connect(&mut self) -> Result<(), TransitionError> {
        if self.state == ConnectionState::Connecting {
            return Err(TransitionError {
                from: self.state,
                to: ConnectionState::Connecting,
            });
        }
        self.transition(ConnectionState::Connecting)?;
        self.session = None;
        Ok(())
    }

    pub fn connect_succeeded(&mut self, session: Session) -> Result<(), TransitionError> {
        if self.state != ConnectionState::Connecting {
            return Err(TransitionError {
                from: self.state,
                to: ConnectionState::Open,
            });
        }
        self.session = Some(session);
        self.transition(ConnectionState::Open)
    }

    pub fn connect_failed(&mut self) -> Result<(), TransitionError> {
        if self.state != ConnectionState::Connecting {
            return Err(TransitionError {
                from: self.state,
                to: ConnectionState::Error,
            });
        }
        self.session = None;
        self.transition(ConnectionState::Error)
    }

    /// Start closing. Returns the session that should be closed remotely,
    /// if any. A store with nothing to close is left unchanged.
    pub fn begin_close(&mut self) -> Option<Session> {
        match self.state {
            ConnectionState::Open | ConnectionState::Error => {
                self.set(ConnectionState::Closing);
                self.session.clone()
            }
            _ => None,
        }
    }

    /// Finish a close started with `begin_close`.
    pub fn finish_close(&mut self) -> Result<(), TransitionError> {
        self.transition(ConnectionState::Closed)?;
        self.session = None;
        Ok(())
    }

    /// Open session lost its link. Returns true on the transition.
    pub fn mark_degraded(&mut self) -> bool {
        if self.state != ConnectionState::Open || self.session.is_none() {
            return false;
        }
        self.set(ConnectionState::Error);
        true
    }

    /// Degraded session got its link back. Returns true on the transition.
    pub fn mark_recovered(&mut self) -> bool {
        if self.state != ConnectionState::Error || self.session.is_none() {
            return false;
        }
        self.set(ConnectionState::Open);
        true
    }

    /// Force the store closed without the remote round-trip. Used on
    /// teardown; returns the session that was dropped.
    pub fn reset_local(&mut self) -> Option<Session> {
        let dropped = self.session.take();
        if self.state != ConnectionState::Idle {
            self.set(ConnectionState::Closed);
        }
        dropped
    }
}
