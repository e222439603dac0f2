//! # Enhanced JSON
//!
//! JSON with an escape layer for values plain JSON cannot carry: host
//! object references, callbacks, `undefined`, `NaN` and the infinities.
//!
//! ## Philosophy
//!
//! - **Plain by default**: Outside an enhanced block the output is ordinary JSON.
//! - **Opt-in escapes**: An [`EnhancedBlock`] marks the subtree where escapes may occur.
//! - **Counted**: Each emitted block records how many escapes it holds, so a
//!   reader can skip resolution entirely when the count is zero.
//! - **Total encoder**: Encoding never fails. Unencodable values degrade to a
//!   `"~?"` diagnostic escape.
//!
//! ## Format
//!
//! - **Block**: `["~", <body>, {"c": N}]`
//! - **Escape**: `["~<handler>", args...]`
//! - **Fence**: `["~~", <array>]` for arrays whose first item is a `~` string
//! - **Literal**: `["~-", <json>]` taken verbatim by the reader
//! - **Sentinel**: `["~S", "undefined" | "NaN" | "Infinity" | "-Infinity"]`

#[cfg(test)]
mod tests;

mod decoder;
mod encoder;
mod value;

pub use decoder::Handler;
pub use decoder::Handlers;
pub use decoder::decode;
pub use decoder::decode_str;
pub use decoder::decode_value;
pub use decoder::from_json;
pub use encoder::OptPolicy;
pub use encoder::encode;
pub use encoder::write_str;
pub use value::EnhancedBlock;
pub use value::Escapable;
pub use value::Escape;
pub use value::Sentinel;
pub use value::Value;

/// Enhanced JSON decoding errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The input is not JSON.
    Json(String),
    /// An escape names a handler nobody registered.
    UnknownHandler(String),
    /// A built-in escape has the wrong shape.
    MalformedEscape(String),
    /// A registered handler rejected its arguments.
    Handler { handler: String, message: String },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Json(e) => write!(f, "Invalid JSON: {}", e),
            Error::UnknownHandler(name) => write!(f, "No handler for escape \"~{}\"", name),
            Error::MalformedEscape(msg) => write!(f, "Malformed escape: {}", msg),
            Error::Handler { handler, message } => {
                write!(f, "Handler \"~{}\" failed: {}", handler, message)
            }
        }
    }
}

impl std::error::Error for Error {}

/// Specialized `Result` for enhanced JSON operations.
pub type Result<T> = std::result::Result<T, Error>;
