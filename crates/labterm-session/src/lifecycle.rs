//! Connection state transition guardrails.

use crate::types::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal console state transition {from} -> {to}")]
pub struct TransitionError {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

pub fn is_valid_transition(from: ConnectionState, to: ConnectionState) -> bool {
    if from == to {
        return true;
    }

    matches!(
        (from, to),
        (ConnectionState::Idle, ConnectionState::Connecting)
            | (ConnectionState::Connecting, ConnectionState::Open)
            | (ConnectionState::Connecting, ConnectionState::Error)
            | (ConnectionState::Open, ConnectionState::Closing)
            | (ConnectionState::Open, ConnectionState::Error)
            | (ConnectionState::Error, ConnectionState::Open)
            | (ConnectionState::Error, ConnectionState::Closing)
            | (ConnectionState::Closing, ConnectionState::Closed)
            // Reopen after a close or a failed create.
            | (ConnectionState::Closed, ConnectionState::Connecting)
            | (ConnectionState::Error, ConnectionState::Connecting)
    )
}

pub fn validate_transition(
    from: ConnectionState,
    to: ConnectionState,
) -> Result<(), TransitionError> {
    if is_valid_transition(from, to) {
        Ok(())
    } else {
        Err(TransitionError { from, to })
    }
}
