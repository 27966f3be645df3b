//! Typed error enums for the three component boundaries: admission,
//! control/binary-frame protocol parsing, and room mutation.
//!
//! One small `thiserror` enum per subsystem rather than a single
//! catch-all error type, so each boundary's callers only have to match on
//! the failures that can actually occur there.

use thiserror::Error;

/// Failures during WebSocket admission (§4.A, §4.B, §4.C admission step).
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("path does not match the configured relay path")]
    PathNotAllowed,
    #[error("origin is not in the allow-list")]
    OriginNotAllowed,
    #[error("room registry is at capacity ({0} rooms)")]
    RoomBudgetExceeded(usize),
    #[error("room is at capacity")]
    RoomFull,
    #[error("clientId is already in use in this room")]
    DuplicateClientId,
}

/// Failures while parsing or authorizing a single inbound frame (§7).
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed JSON control frame")]
    MalformedJson,
    #[error("malformed binary CRDT frame")]
    MalformedBinaryFrame,
}

/// Failures mutating a room's canonical state (§4.C, §7).
#[derive(Debug, Error)]
pub enum RoomError {
    #[error("document size limit exceeded: {current} + {incoming} > {limit}")]
    DocumentBudgetExceeded {
        current: usize,
        incoming: usize,
        limit: usize,
    },
    #[error("failed to apply CRDT update: {0}")]
    InvalidUpdate(String),
    #[error("internal invariant violation: {0}")]
    Internal(String),
}
