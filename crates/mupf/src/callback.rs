//! # Callback Dispatch
//!
//! Frames the page starts (callbacks and events) are queued by the session
//! loop and run later on an application thread, never on the network thread.
//!
//! ## Philosophy
//!
//! - **Pulled**: Nothing runs until the application asks with
//!   [`Session::run_one_callback_blocking`] or [`Session::run_callbacks`].
//! - **Stable ids**: A host closure gets one id for its lifetime in the
//!   session; passing it twice sends the same `["~$",null,id]` escape.
//! - **Answered**: Every callback frame gets an answer, an error one if the
//!   closure fails or is unknown.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use crrcan::Frame;
use crrcan::Noun;
use crrcan::Outcome;
use crrcan::ScriptFault;
use enhjson::Escapable;
use enhjson::Escape;
use enhjson::Value;
use tracing::debug;
use tracing::warn;

use crate::error::Error;
use crate::error::Result;
use crate::session::Session;

/// Bound of the per-session callback queue. Frames beyond it are dropped.
pub const CALLBACK_QUEUE_CAPACITY: usize = 1024;

/// A host closure callable from the page.
pub type HostCallback = Arc<dyn Fn(Vec<Value>) -> Result<Value> + Send + Sync>;

/// Work queued by the session loop.
#[derive(Debug)]
pub enum CallbackTask {
    /// A callback frame `[5, ccid, id, {"args"}]`, not decoded yet.
    Invoke { ccid: u64, raw: String },
    /// An event frame `[7, 0, name, {"result"}]`, not decoded yet.
    Event { raw: String },
    Control(ControlEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// An event the page sent, other than `*close*`.
    PeerEvent { name: String, payload: Value },
    /// The page is unloading.
    PeerClosing,
    /// The session loop ended. Always the last task.
    SessionEnded,
}

/// What one dispatch step did.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    Invoked { callback_id: i64, ccid: u64 },
    /// A callback arrived after the session stopped being healthy.
    Discarded,
    Control(ControlEvent),
}

/// Host callbacks of one session, keyed by id.
#[derive(Default)]
pub(crate) struct CallbackRegistry {
    next: i64,
    by_id: HashMap<i64, HostCallback>,
    ids: HashMap<usize, i64>,
}

impl CallbackRegistry {
    /// Returns the id of `callback`, assigning one on first sight.
    pub(crate) fn register(&mut self, callback: HostCallback) -> i64 {
        let key = Arc::as_ptr(&callback) as *const () as usize;
        if let Some(id) = self.ids.get(&key) {
            return *id;
        }
        self.next += 1;
        let id = self.next;
        self.ids.insert(key, id);
        self.by_id.insert(id, callback);
        id
    }

    pub(crate) fn get(&self, id: i64) -> Option<HostCallback> {
        self.by_id.get(&id).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }
}

/// A registered host callback, as passed to the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackRef {
    id: i64,
}

impl CallbackRef {
    pub(crate) fn new(id: i64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> i64 {
        self.id
    }
}

impl Escapable for CallbackRef {
    fn escape(&self) -> Option<Escape> {
        Some(Escape::new("$", vec![Value::Null, self.id.into()]))
    }

    fn describe(&self) -> String {
        format!("<callback #{}>", self.id)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl From<CallbackRef> for Value {
    fn from(cb: CallbackRef) -> Self {
        Value::host(Arc::new(cb))
    }
}

// ============================================================================
//  DISPATCH
// ============================================================================

impl Session {
    /// Runs one queued task, blocking until there is one.
    ///
    /// After the loop has ended and the queue is empty, returns the error the
    /// session was closed with.
    pub fn run_one_callback_blocking(&self) -> Result<Dispatched> {
        let task = self.next_callback_task(None)?;
        self.dispatch(task)
    }

    /// Runs queued tasks without waiting for new ones, stopping after `limit`
    /// tasks or once `budget` has elapsed. Returns how many ran.
    pub fn run_callbacks(&self, limit: usize, budget: Duration) -> usize {
        let deadline = Instant::now() + budget;
        let mut ran = 0;
        while ran < limit && Instant::now() < deadline {
            let Some(task) = self.try_next_callback_task() else { break };
            if let Err(e) = self.dispatch(task) {
                warn!(session = %self.id(), error = %e, "callback dispatch failed");
            }
            ran += 1;
        }
        ran
    }

    /// Like [`Session::run_one_callback_blocking`], giving up after `timeout`.
    pub fn run_one_callback_timeout(&self, timeout: Duration) -> Result<Dispatched> {
        let task = self.next_callback_task(Some(timeout))?;
        self.dispatch(task)
    }

    fn dispatch(&self, task: CallbackTask) -> Result<Dispatched> {
        match task {
            CallbackTask::Invoke { ccid, raw } => {
                if !self.is_healthy() {
                    debug!(session = %self.id(), ccid, "discarding callback, session not healthy");
                    return Ok(Dispatched::Discarded);
                }
                let (callback_id, outcome) = self.invoke(&raw);
                self.send_frame(crrcan::encode_answer(ccid, &outcome), false);
                Ok(Dispatched::Invoked { callback_id, ccid })
            }
            CallbackTask::Event { raw } => {
                let frame = Frame::decode(&raw, self.handlers())?;
                let name = match &frame.noun {
                    Noun::Name(name) => name.clone(),
                    Noun::Code(code) => code.to_string(),
                };
                let payload = frame.into_outcome().ok().and_then(std::result::Result::ok).unwrap_or(Value::Null);
                Ok(Dispatched::Control(ControlEvent::PeerEvent { name, payload }))
            }
            CallbackTask::Control(event) => Ok(Dispatched::Control(event)),
        }
    }

    /// Decodes a callback frame and runs the closure it names.
    fn invoke(&self, raw: &str) -> (i64, Outcome) {
        let frame = match Frame::decode(raw, self.handlers()) {
            Ok(frame) => frame,
            Err(e) => return (0, Err(Error::from(e).to_fault())),
        };
        let Some(callback_id) = frame.noun.as_code() else {
            return (0, Err(ScriptFault::new("CallbackUnknownError", "callback noun is not an id")));
        };
        let Some(callback) = self.callback(callback_id) else {
            warn!(session = %self.id(), callback_id, "page called an unknown callback");
            let message = format!("no callback with id {}", callback_id);
            return (callback_id, Err(ScriptFault::new("CallbackUnknownError", message)));
        };
        let (args, _) = frame.into_arguments();
        let outcome = callback(args).map_err(|e| e.to_fault());
        (callback_id, outcome)
    }
}
