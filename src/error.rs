//! Error types shared across the bench library.

use std::io;
use std::time::Duration;

use crate::codec::Command;

/// A command could not be framed because one of its parameters is out of range.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    /// Channel id is not valid for this command family.
    #[error("invalid channel id 0x{0:02X}")]
    InvalidChannel(u8),

    /// Voltage is NaN or outside the range the output stage accepts.
    #[error("voltage {volts:.2} V out of range ({allowed})")]
    VoltageOutOfRange { volts: f64, allowed: &'static str },

    /// Step-adjust direction code is neither UP (0x01) nor DOWN (0x02).
    #[error("invalid step direction code 0x{0:02X}")]
    InvalidDirection(u8),

    /// Link test payload must contain at least one byte.
    #[error("link test payload is empty")]
    EmptyPayload,
}

/// Failures raised by a [`crate::transport::Transport`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The port is closed or was never opened.
    #[error("serial port is not open")]
    NotOpen,

    /// The hardware did not report transmission complete in time.
    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),

    /// Fewer bytes were accepted by the driver than requested.
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    /// The device node disappeared or never existed.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The port is held by another process or we lack access rights.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The device stopped responding at the driver level (e.g. unplugged).
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// Any other serial failure the driver could not classify.
    #[error("unknown serial error: {0}")]
    Unknown(String),

    /// Transient I/O failure (interrupted, would block, ...).
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

impl TransportError {
    /// Fatal errors force the port closed and raise a disconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::DeviceNotFound(_)
                | TransportError::PermissionDenied(_)
                | TransportError::ResourceUnavailable(_)
                | TransportError::Unknown(_)
        )
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::InvalidInput
            | io::ErrorKind::WriteZero => TransportError::Io(err),
            io::ErrorKind::NotFound => TransportError::DeviceNotFound(err.to_string()),
            io::ErrorKind::PermissionDenied => TransportError::PermissionDenied(err.to_string()),
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => TransportError::ResourceUnavailable(err.to_string()),
            _ => TransportError::Unknown(err.to_string()),
        }
    }
}

impl From<serialport::Error> for TransportError {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::NoDevice => TransportError::DeviceNotFound(err.description),
            serialport::ErrorKind::InvalidInput => {
                TransportError::Io(io::Error::new(io::ErrorKind::InvalidInput, err.description))
            }
            serialport::ErrorKind::Io(kind) => io::Error::new(kind, err.description).into(),
            serialport::ErrorKind::Unknown => TransportError::Unknown(err.description),
        }
    }
}

/// Errors returned synchronously by the link controller's command API.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Another command is still waiting for its confirmation.
    #[error("command {0} is still awaiting confirmation")]
    AlreadyPending(Command),

    /// The transport is closed.
    #[error("link is not connected")]
    NotConnected,

    /// The frame could not be built.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The address or data phase failed; nothing is pending.
    #[error("send failed: {0}")]
    Transport(#[from] TransportError),
}

/// Rejected sequencer API calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SequencerError {
    /// Steps cannot be replaced and a run cannot be started while one is active.
    #[error("a test sequence is already running")]
    Running,

    /// `start` was called with an empty step list.
    #[error("no test steps loaded")]
    NoSteps,
}

/// Step catalog interchange failures.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// I/O error reading or writing a catalog file.
    #[error("failed to access step file: {0}")]
    Io(#[from] io::Error),

    /// The document is not valid JSON or has the wrong shape.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// The `type` index does not name a sub-action kind.
    #[error("unknown sub-action type {0}")]
    UnknownActionType(i64),

    /// A field holds a value that cannot be represented.
    #[error("invalid value for '{field}': {value}")]
    InvalidField { field: &'static str, value: i64 },
}

/// Configuration file failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading the configuration file.
    #[error("failed to read config file: {0}")]
    Io(#[from] io::Error),

    /// The TOML could not be parsed into [`crate::config::BenchConfig`].
    #[error("failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),
}
