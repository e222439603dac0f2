//! # Error Definitions
//!
//! Everything a host-side call can fail with. Errors are `Clone` because a
//! single session failure is delivered to every command waiting on it.

use crrcan::ScriptFault;

/// Errors surfaced by sessions, commands and the app.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The peer broke the protocol (unknown ccid, malformed frame, ...).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Script code in the page raised an exception.
    #[error("{kind}: {message}")]
    RemoteScript {
        kind: String,
        message: String,
        file: Option<String>,
        line: Option<u64>,
        column: Option<u64>,
    },

    /// The session ended through the `*last*` handshake.
    #[error("session closed normally")]
    SessionClosedNormally,

    /// The connection dropped, or the page went away on its own.
    #[error("session closed unexpectedly: {}", .0.as_deref().unwrap_or("no reason given"))]
    SessionClosedUnexpectedly(Option<String>),

    /// A socket arrived for a session nobody summoned.
    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    /// A payload could not be decoded.
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(String),

    /// `strict_feature_list` is on and the page enabled a different set.
    #[error("page features {reported:?} differ from requested {requested:?}")]
    StrictFeatures { requested: Vec<String>, reported: Vec<String> },

    #[error("timed out")]
    Timeout,

    /// Route registration touched `/` or `/mupf`.
    #[error("route `{0}` is reserved")]
    ReservedRoute(String),

    /// A host callback reported failure.
    #[error("callback failed: {0}")]
    Callback(String),

    /// The script preprocessor rejected its input.
    #[error("macro error on line {line}: {message}")]
    Macro { line: usize, message: String },
}

impl Error {
    /// Name used when the error crosses to the page as a script exception.
    pub fn kind_name(&self) -> &str {
        match self {
            Error::Protocol(_) => "ProtocolError",
            Error::RemoteScript { kind, .. } => kind.as_str(),
            Error::SessionClosedNormally => "SessionClosedNormally",
            Error::SessionClosedUnexpectedly(_) => "SessionClosedUnexpectedly",
            Error::UnknownConnection(_) => "UnknownConnectionError",
            Error::Codec(_) => "CodecError",
            Error::InvalidArgument(_) => "ValueError",
            Error::Io(_) => "IOError",
            Error::StrictFeatures { .. } => "StrictFeaturesError",
            Error::Timeout => "TimeoutError",
            Error::ReservedRoute(_) => "ReservedRouteError",
            Error::Callback(_) => "CallbackError",
            Error::Macro { .. } => "MacroError",
        }
    }

    /// True for both ways a session can end.
    pub fn is_session_closed(&self) -> bool {
        matches!(self, Error::SessionClosedNormally | Error::SessionClosedUnexpectedly(_))
    }

    /// Converts to the quintuple sent back to the page.
    pub fn to_fault(&self) -> ScriptFault {
        match self {
            Error::RemoteScript { kind, message, file, line, column } => ScriptFault {
                kind: kind.clone(),
                message: message.clone(),
                file: file.clone(),
                line: *line,
                column: *column,
            },
            Error::Callback(message) => ScriptFault::new(self.kind_name(), message.clone()),
            other => ScriptFault::new(other.kind_name(), other.to_string()),
        }
    }
}

impl From<ScriptFault> for Error {
    fn from(f: ScriptFault) -> Self {
        Error::RemoteScript {
            kind: f.kind,
            message: f.message,
            file: f.file,
            line: f.line,
            column: f.column,
        }
    }
}

impl From<crrcan::Error> for Error {
    fn from(e: crrcan::Error) -> Self {
        match e {
            crrcan::Error::Codec(inner) => Error::Codec(inner.to_string()),
            other => Error::Protocol(other.to_string()),
        }
    }
}

impl From<enhjson::Error> for Error {
    fn from(e: enhjson::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

/// A specialized Result type for mupf operations.
pub type Result<T> = std::result::Result<T, Error>;
