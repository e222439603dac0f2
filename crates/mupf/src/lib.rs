//! # mupf
//!
//! Drive a live browser page from a host process. The app serves a small
//! bootstrap page over HTTP; the page connects back over a WebSocket and from
//! then on both sides exchange CRRCAN frames.
//!
//! ## Philosophy
//!
//! - **Blocking host API**: Application threads call into the page and wait
//!   for results. All socket work happens on one network thread.
//! - **Remote objects stay remote**: JavaScript objects come back as
//!   [`RemoteHandle`]s; the page keeps them alive until the host lets go.
//! - **Callbacks are pulled**: Calls from the page queue up until the
//!   application runs them.
//! - **Nothing hangs**: When a session ends, every waiter wakes with an error.

pub mod app;
pub mod assets;
pub mod callback;
pub mod command;
pub mod config;
pub mod error;
pub mod features;
pub mod launcher;
pub mod listener;
pub mod logging;
pub mod macros;
pub mod net;
pub mod remote;
pub mod session;
pub mod session_loop;
pub mod socket;
pub mod testing;


pub use app::App;
pub use callback::CallbackRef;
pub use callback::ControlEvent;
pub use callback::Dispatched;
pub use command::Command;
pub use config::AppConfig;
pub use enhjson::Sentinel;
pub use enhjson::Value;
pub use error::Error;
pub use error::Result;
pub use features::Features;
pub use remote::RemoteHandle;
pub use session::Script;
pub use session::Session;
