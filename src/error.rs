//! Error taxonomy for the runtime.
//!
//! Two families of failures exist and are deliberately kept apart:
//!
//! - **Transfer outcomes** (`TransferError`): transient results of a single
//!   send/receive/poll. They are plain values, never propagate as errors
//!   through the state machine, and map onto the stable numeric codes
//!   (`success=0, error=-1, timeout=-2, interrupted=-3`) that external
//!   tooling relies on.
//! - **Structural errors** (`DeviceError` and friends): configuration
//!   mistakes, transport setup failures, illegal state transitions and user
//!   hook failures. The state machine catches these at hook boundaries and
//!   converts them into the `Error` state uniformly.

use crate::states::{State, Transition};
use thiserror::Error;

/// Transient outcome of a transfer operation that did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    /// The transfer failed (peer gone, framing error, transport mismatch).
    Error,
    /// The deadline expired before the transfer could complete.
    Timeout,
    /// A pending state change or interrupt aborted the wait.
    Interrupted,
}

impl TransferError {
    /// Stable numeric code: `error=-1`, `timeout=-2`, `interrupted=-3`.
    /// A successful transfer reports its byte count (`>= 0`) instead.
    pub fn code(self) -> i64 {
        match self {
            TransferError::Error => -1,
            TransferError::Timeout => -2,
            TransferError::Interrupted => -3,
        }
    }
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferError::Error => write!(f, "error"),
            TransferError::Timeout => write!(f, "timeout"),
            TransferError::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Result of a send or receive: bytes transferred on success (0 is legal,
/// an empty message was transferred), a `TransferError` otherwise.
pub type TransferResult = Result<usize, TransferError>;

/// Failures in transport machinery: sockets, messages, regions, pollers.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown transport: \"{0}\"")]
    UnknownTransport(String),

    #[error("invalid address \"{address}\": {reason}")]
    BadAddress { address: String, reason: String },

    #[error("message error: {0}")]
    Message(String),

    #[error("message transport ({message}) does not match socket transport ({socket})")]
    TransportMismatch {
        message: crate::transport::Transport,
        socket: crate::transport::Transport,
    },

    #[error("socket error: {0}")]
    Socket(String),

    #[error("unmanaged region error: {0}")]
    Region(String),

    #[error("poller error: {0}")]
    Poller(String),

    #[error("shared memory error: {0}")]
    Shmem(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration mistakes the device refuses to run with.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid channel \"{channel}\": {reason}")]
    InvalidChannel { channel: String, reason: String },

    #[error("invalid value for property \"{key}\": {reason}")]
    InvalidProperty { key: String, reason: String },

    #[error("property \"{key}\" has type {actual}, requested {requested}")]
    TypeMismatch {
        key: String,
        actual: &'static str,
        requested: &'static str,
    },

    #[error("cannot read config file {path}: {reason}")]
    File { path: String, reason: String },

    #[error("cannot parse \"{input}\": {reason}")]
    Parse { input: String, reason: String },
}

/// Top-level device failure, the only error type crossing hook boundaries.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Illegal transition request; the machine state is unchanged.
    #[error("transition {transition} not allowed in current state {state}")]
    StateChangeFailed { state: State, transition: Transition },

    /// The controlled device transitioned to the `Error` state; waits on
    /// the state queue unblock with this.
    #[error("controlled device transitioned to error state")]
    ErrorState,

    /// An asynchronous request was rejected because a prior one is still
    /// being processed.
    #[error("operation in progress: {0}")]
    OperationInProgress(String),

    #[error("operation timed out: {0}")]
    OperationTimeout(String),

    /// A global interrupt aborted the wait.
    #[error("operation canceled: {0}")]
    OperationCanceled(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Failure raised from a user hook, reported with its message.
    #[error("{0}")]
    Hook(String),
}

impl DeviceError {
    /// Convenience for user hooks reporting a failure by message.
    pub fn hook(msg: impl Into<String>) -> Self {
        DeviceError::Hook(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_codes_are_stable() {
        assert_eq!(TransferError::Error.code(), -1);
        assert_eq!(TransferError::Timeout.code(), -2);
        assert_eq!(TransferError::Interrupted.code(), -3);
    }

    #[test]
    fn hook_error_carries_message() {
        let err = DeviceError::hook("sampler failed to open input");
        assert_eq!(err.to_string(), "sampler failed to open input");
    }
}
