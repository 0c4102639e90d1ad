//! Custom error types for the application.
//!
//! This module defines the error types shared by the camera operator. Using the
//! `thiserror` crate, it provides a centralized and consistent way to handle the
//! different kinds of failures that can occur while talking to the camera
//! server subprocess, the pulse generator, or while enforcing the camera's
//! state machine.
//!
//! ## Error Hierarchy
//!
//! - **`ProtocolError`**: failures of the line protocol spoken with the camera
//!   server. `Timeout` is recoverable (the caller usually degrades to an
//!   "unknown" value), while `Violation` means the request/response stream is
//!   out of step and is always escalated.
//! - **`PeripheralError`**: failures of the serial pulse generator. Only the
//!   connect path produces these; commands sent while unconnected are warnings.
//! - **`ControlError`**: the orchestrator-level error. Transition refusals
//!   (`UnknownState`, `IllegalTransition`) leave the instrument untouched;
//!   `TransitionFailed` means the camera reports a different state than the
//!   one requested.
//!
//! By using `#[from]`, `ControlError` can be created from the lower-level
//! errors, so orchestrator code propagates them with the `?` operator.

use crate::state::InstrumentState;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the orchestrator error type.
pub type AppResult<T> = std::result::Result<T, ControlError>;

/// Errors from the camera server line protocol.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// `connect` was called while a session is already open.
    #[error("Camera server already connected, disconnect first")]
    AlreadyConnected,

    /// The camera server subprocess could not be launched.
    #[error("Failed to launch camera server '{command}': {source}")]
    Connection {
        /// Command line that was attempted.
        command: String,
        /// Underlying launch failure.
        #[source]
        source: std::io::Error,
    },

    /// A response line did not arrive within the read timeout.
    #[error("'{command}' timed out after {after:?}")]
    Timeout {
        /// Command awaiting a response.
        command: String,
        /// Timeout that expired.
        after: Duration,
    },

    /// The completion marker did not match, the stream is desynchronised.
    #[error("'{command}' unexpected response line: {line:?}")]
    Violation {
        /// Command that produced the bad line.
        command: String,
        /// The line received in place of the completion marker.
        line: String,
    },

    /// The camera server closed its response channel.
    #[error("Camera server closed the response channel during '{0}'")]
    Closed(String),

    /// I/O error on the command or response channel.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether the caller may carry on with an "unknown" result.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProtocolError::Timeout { .. })
    }

    /// Whether the camera server stream is unusable.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, ProtocolError::Closed(_) | ProtocolError::Io(_))
    }
}

/// Errors from the pulse generator serial link.
#[derive(Error, Debug)]
pub enum PeripheralError {
    /// The serial port could not be opened.
    #[error("Failed to open pulse generator on '{port}' at {baud_rate} baud: {reason}")]
    Connection {
        /// Serial device path.
        port: String,
        /// Requested baud rate.
        baud_rate: u32,
        /// Reason reported by the serial layer.
        reason: String,
    },

    /// The pulse generator did not reply to a command.
    #[error("Pulse generator did not reply to '{command}' within {after:?}")]
    Timeout {
        /// Command awaiting a reply.
        command: String,
        /// Timeout that expired.
        after: Duration,
    },

    /// I/O error on the serial link.
    #[error("Pulse generator I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial support was compiled out.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

/// Orchestrator-level errors.
#[derive(Error, Debug)]
pub enum ControlError {
    /// The requested state name is not a camera state.
    #[error("Attempted transition to unknown state refused: {0}")]
    UnknownState(String),

    /// The requested state is not reachable from the current one.
    #[error("Attempt to perform restricted transition refused: {from} -> {to}")]
    IllegalTransition {
        /// State in the current snapshot.
        from: InstrumentState,
        /// Requested state.
        to: InstrumentState,
    },

    /// The camera did not end up in the requested state.
    #[error("State transition failed: {from} -> {requested} (camera reports {actual})")]
    TransitionFailed {
        /// State before the transition was issued.
        from: InstrumentState,
        /// Requested state.
        requested: InstrumentState,
        /// State reported by the camera afterwards.
        actual: InstrumentState,
    },

    /// The operation requires the camera to be in READY.
    #[error("Must be in READY to {0}")]
    NotReady(String),

    /// An observation time literal could not be parsed.
    #[error("Invalid observation time '{0}', expected hours:minutes:seconds")]
    InvalidObservationTime(String),

    /// Camera server protocol failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Pulse generator failure.
    #[error(transparent)]
    Peripheral(#[from] PeripheralError),

    /// Local file I/O (persisted configuration, trigger marker file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),
}
