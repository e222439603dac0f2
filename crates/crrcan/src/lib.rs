//! # CRRCAN
//!
//! Command, Response, Run, Callback, Answer, Notification: the message
//! protocol spoken between a host process and a browser page.
//!
//! ## Philosophy
//!
//! - **Symmetric**: Either side may start an exchange at any time.
//! - **Correlated**: Every exchange that expects a reply carries a ccid, and the
//!   reply echoes it.
//! - **Text**: Frames are enhanced JSON arrays sent as WebSocket text messages.
//!
//! ## Frame
//!
//! `[mode, ccid, noun, payload]`
//!
//! | mode | direction | noun | payload |
//! |---|---|---|---|
//! | 0 cmd | host to page | command name | `{"args", "kwargs"}` |
//! | 1 res | page to host | `0` ok, `1` error | `{"result"}` |
//! | 2 run | host to page | command name | `{"args", "kwargs"}` |
//! | 5 clb | page to host | callback id | `{"args"}` |
//! | 6 ans | host to page | `0` ok, `1` error | `{"result"}` |
//! | 7 ntf | page to host | event name | `{"result"}` |

#[cfg(test)]
mod tests;

mod error;
mod frame;

pub use error::Error;
pub use error::Result;
pub use error::ScriptFault;
pub use frame::Frame;
pub use frame::FrameHeader;
pub use frame::Mode;
pub use frame::Noun;
pub use frame::Outcome;
pub use frame::encode_answer;
pub use frame::encode_command;
pub use frame::encode_inbound;
pub use frame::encode_reply;

/// The ccid of `*first*`. Its response may arrive before it is registered.
pub const FIRST_CCID: u64 = 0;

/// The ccid reserved for `*last*`. It is the largest integer a JS number
/// holds exactly, so ordinary ccids never reach it.
pub const LAST_CCID: u64 = (1 << 53) - 1;

/// Command names with protocol meaning.
pub mod names {
    /// Opens the connection. Run by the page itself, never sent by the host.
    pub const FIRST: &str = "*first*";
    /// Asks the page to close the socket once pending commands finish.
    pub const LAST: &str = "*last*";
    pub const INSTALL: &str = "*install*";
    pub const FEATURES: &str = "*features*";
    pub const GET: &str = "*get*";
    pub const SET: &str = "*set*";
    pub const GETI: &str = "*geti*";
    pub const SETI: &str = "*seti*";
    pub const CALL: &str = "*call*";
    pub const NEW: &str = "*new*";
    pub const GC: &str = "*gc*";
    pub const GETCMDS: &str = "*getcmds*";
    /// Event noun the page sends while unloading.
    pub const CLOSE_EVENT: &str = "*close*";

    /// Names every page knows before any script is installed.
    pub const BUILTIN: [&str; 4] = [FIRST, LAST, INSTALL, FEATURES];
}
