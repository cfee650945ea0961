//! Error taxonomy for the voice session stack.
//!
//! Each boundary has its own error type so callers can tell a denied
//! microphone apart from a dropped connection. The facade folds both into
//! [`ConnectError`]; everything else is logged and absorbed at the boundary
//! where it happens.

use thiserror::Error;

/// Microphone or speaker could not be used.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    /// The platform refused access to the microphone.
    #[error("microphone permission denied")]
    PermissionDenied,
    /// No input (or output) device is present.
    #[error("no {0} device available")]
    NotFound(&'static str),
    /// The device cannot run at the requested rate/channel layout.
    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),
    /// The device stream failed to build, start or keep running.
    #[error("audio stream error: {0}")]
    Stream(String),
}

/// A wire payload could not be decoded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(String),
}

impl From<base64::DecodeError> for CodecError {
    fn from(err: base64::DecodeError) -> Self {
        Self::InvalidBase64(err.to_string())
    }
}

/// The bidirectional session failed to open or dropped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("no API key configured for the live session")]
    MissingApiKey,
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("failed to send setup message: {0}")]
    Setup(String),
    #[error("setupComplete not received within {0}s")]
    SetupTimeout(u64),
    #[error("connection closed before setupComplete: {0}")]
    ClosedDuringSetup(String),
    /// `disconnect` ran while the connection was still being established.
    #[error("connection cancelled")]
    Cancelled,
    #[error("transport is {0:?}, cannot open")]
    InvalidState(crate::voice::transport::TransportState),
}

/// Failure surfaced by [`VoiceAssistant::connect`](crate::voice::VoiceAssistant::connect).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A session is already open on this controller; call `disconnect` first.
    #[error("a voice session is already active")]
    AlreadyActive,
}
