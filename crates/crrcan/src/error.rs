//! # Error Definitions
//!
//! Frame-level failures, and the fault a remote script reports back.

use std::fmt;

use enhjson::Value;

/// Failures while reading or interpreting a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Text does not start with `[mode,ccid,`.
    BadPrefix,
    /// The mode number is not part of the protocol.
    UnknownMode(u64),
    /// The frame is JSON but not a `[mode,ccid,noun,payload]` quadruple.
    MalformedFrame(String),
    /// A reply payload lacks its `result` member.
    MissingResult,
    /// The payload failed enhanced JSON decoding.
    Codec(enhjson::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadPrefix => write!(f, "Frame does not start with `[mode,ccid,`"),
            Error::UnknownMode(m) => write!(f, "Unknown frame mode {}", m),
            Error::MalformedFrame(msg) => write!(f, "Malformed frame: {}", msg),
            Error::MissingResult => write!(f, "Reply payload has no `result`"),
            Error::Codec(e) => write!(f, "Payload decoding failed: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<enhjson::Error> for Error {
    fn from(e: enhjson::Error) -> Self { Self::Codec(e) }
}

/// A specialized Result type for frame operations.
pub type Result<T> = std::result::Result<T, Error>;

/// An exception raised by script code on the far side.
///
/// Travels as `[kind, message, file, line, column]` in a reply whose noun is
/// non-zero. Location parts are `null` when the script engine omits them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFault {
    pub kind: String,
    pub message: String,
    pub file: Option<String>,
    pub line: Option<u64>,
    pub column: Option<u64>,
}

impl ScriptFault {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind: kind.into(), message: message.into(), file: None, line: None, column: None }
    }

    /// Reads the error quintuple. Missing trailing parts are tolerated.
    pub fn from_value(value: &Value) -> Result<Self> {
        let items = value
            .as_array()
            .ok_or_else(|| Error::MalformedFrame("error result is not an array".into()))?;
        let text = |i: usize| items.get(i).and_then(Value::as_str).map(str::to_string);
        let number = |i: usize| items.get(i).and_then(Value::as_u64);
        Ok(Self {
            kind: text(0).unwrap_or_else(|| "Error".to_string()),
            message: text(1).unwrap_or_default(),
            file: text(2),
            line: number(3),
            column: number(4),
        })
    }

    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            self.kind.clone().into(),
            self.message.clone().into(),
            self.file.clone().into(),
            self.line.into(),
            self.column.into(),
        ])
    }
}

impl fmt::Display for ScriptFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(file) = &self.file {
            write!(f, " [{}", file)?;
            if let Some(line) = self.line {
                write!(f, ":{}", line)?;
                if let Some(column) = self.column {
                    write!(f, ":{}", column)?;
                }
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}
