//! # Command Correlation
//!
//! Every command that expects a reply holds a slot in the session's
//! [`CommandTable`], keyed by its ccid. The session loop hands raw reply
//! frames to [`CommandTable::resolve`]; the thread that issued the command
//! blocks in [`Command::wait`] and decodes the frame itself on first read.
//!
//! ## Invariants
//! - **One lock**: ccid allocation and registration happen in a single
//!   critical section, so ids are strictly increasing in issue order.
//! - **At most once**: A slot is fulfilled once. Resolving an unknown or
//!   already resolved ccid is a protocol error.
//! - **Nothing hangs**: Closing the table fails every pending slot and every
//!   later issue with the same error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use crrcan::FIRST_CCID;
use crrcan::Frame;
use crrcan::LAST_CCID;
use enhjson::Handlers;
use enhjson::Value;
use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::error::Error;
use crate::error::Result;

/// Pending commands of one session.
pub struct CommandTable {
    handlers: Arc<Handlers>,
    state: Mutex<TableState>,
}

struct TableState {
    next: u64,
    unresolved: HashMap<u64, Arc<Slot>>,
    /// A `*first*` reply that arrived before `*first*` was registered.
    resolved_in_advance: Option<String>,
    first_registered: bool,
    last_issued: bool,
    sealed: Option<Error>,
}

impl CommandTable {
    /// `handlers` resolve escapes in reply payloads.
    pub fn new(handlers: Arc<Handlers>) -> Self {
        Self {
            handlers,
            state: Mutex::new(TableState {
                next: FIRST_CCID + 1,
                unresolved: HashMap::new(),
                resolved_in_advance: None,
                first_registered: false,
                last_issued: false,
                sealed: None,
            }),
        }
    }

    /// Reserves the next ccid without registering anything under it.
    pub fn next_ccid(&self) -> u64 {
        let mut state = self.state.lock();
        let ccid = state.next;
        state.next += 1;
        ccid
    }

    /// Registers a command under a ccid chosen by the caller.
    ///
    /// Used for `*first*`, whose ccid is fixed. A reply already stored for it
    /// resolves the command immediately.
    pub fn register(&self, ccid: u64, name: &str) -> Result<Command> {
        let mut state = self.state.lock();
        if let Some(fault) = &state.sealed {
            return Err(fault.clone());
        }
        let taken = state.unresolved.contains_key(&ccid) || (ccid == FIRST_CCID && state.first_registered);
        if taken {
            return Err(Error::Protocol(format!("ccid {} registered twice", ccid)));
        }

        let slot = Arc::new(Slot::new());
        if ccid == FIRST_CCID {
            state.first_registered = true;
            if let Some(raw) = state.resolved_in_advance.take() {
                slot.fulfill(SlotState::Raw(raw));
            } else {
                state.unresolved.insert(ccid, slot.clone());
            }
        } else {
            state.unresolved.insert(ccid, slot.clone());
        }
        Ok(self.command(ccid, name, false, slot))
    }

    /// Allocates a ccid and registers a command under it.
    ///
    /// Notifications are born resolved with `null`. `*last*` takes the
    /// reserved [`LAST_CCID`]; once it is out, nothing else may be issued.
    pub fn issue(&self, name: &str, notification: bool, is_last: bool) -> Result<Command> {
        let mut state = self.state.lock();
        if let Some(fault) = &state.sealed {
            return Err(fault.clone());
        }
        if state.last_issued {
            return Err(Error::SessionClosedNormally);
        }

        let ccid = if is_last {
            state.last_issued = true;
            LAST_CCID
        } else {
            let ccid = state.next;
            state.next += 1;
            ccid
        };

        let slot = Arc::new(Slot::new());
        if notification {
            slot.fulfill(SlotState::Decoded(Ok(Value::Null)));
        } else {
            state.unresolved.insert(ccid, slot.clone());
        }
        Ok(self.command(ccid, name, notification, slot))
    }

    /// Hands the raw reply frame for `ccid` to its waiter.
    ///
    /// A reply for `*first*` may come before `*first*` is registered; it is
    /// kept until then. Any other unknown ccid is a protocol error.
    pub fn resolve(&self, ccid: u64, raw: String) -> Result<()> {
        let mut state = self.state.lock();
        match state.unresolved.remove(&ccid) {
            Some(slot) => {
                drop(state);
                slot.fulfill(SlotState::Raw(raw));
                Ok(())
            }
            None if ccid == FIRST_CCID && !state.first_registered && state.resolved_in_advance.is_none() => {
                state.resolved_in_advance = Some(raw);
                Ok(())
            }
            None => Err(Error::Protocol(format!("reply for unknown ccid {}", ccid))),
        }
    }

    /// Fails every pending command with `fault`. New commands may still be issued.
    pub fn resolve_all_with_fault(&self, fault: Error) {
        let drained: Vec<Arc<Slot>> = self.state.lock().unresolved.drain().map(|(_, slot)| slot).collect();
        for slot in drained {
            slot.fulfill(SlotState::Decoded(Err(fault.clone())));
        }
    }

    /// Fails every pending command with `fault`, and every later issue too.
    pub fn close_with_fault(&self, fault: Error) {
        let drained: Vec<Arc<Slot>> = {
            let mut state = self.state.lock();
            if state.sealed.is_none() {
                state.sealed = Some(fault.clone());
            }
            state.unresolved.drain().map(|(_, slot)| slot).collect()
        };
        for slot in drained {
            slot.fulfill(SlotState::Decoded(Err(fault.clone())));
        }
    }

    /// Number of commands still waiting for a reply.
    pub fn pending(&self) -> usize {
        self.state.lock().unresolved.len()
    }

    pub fn last_issued(&self) -> bool {
        self.state.lock().last_issued
    }

    /// The error the table was closed with, if any.
    pub fn sealed(&self) -> Option<Error> {
        self.state.lock().sealed.clone()
    }

    fn command(&self, ccid: u64, name: &str, notification: bool, slot: Arc<Slot>) -> Command {
        Command {
            ccid,
            name: Arc::from(name),
            notification,
            slot,
            handlers: self.handlers.clone(),
        }
    }
}

// ============================================================================
//  SLOTS
// ============================================================================

enum SlotState {
    Pending,
    /// The reply frame, not decoded yet.
    Raw(String),
    Decoded(Result<Value>),
}

struct Slot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl Slot {
    fn new() -> Self {
        Self { state: Mutex::new(SlotState::Pending), ready: Condvar::new() }
    }

    /// Moves out of `Pending`. Returns false if already resolved.
    fn fulfill(&self, outcome: SlotState) -> bool {
        let mut state = self.state.lock();
        if !matches!(*state, SlotState::Pending) {
            return false;
        }
        *state = outcome;
        self.ready.notify_all();
        true
    }
}

/// A command issued to the page. Clones share the same resolution.
#[derive(Clone)]
pub struct Command {
    ccid: u64,
    name: Arc<str>,
    notification: bool,
    slot: Arc<Slot>,
    handlers: Arc<Handlers>,
}

impl Command {
    pub fn ccid(&self) -> u64 {
        self.ccid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_notification(&self) -> bool {
        self.notification
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(*self.slot.state.lock(), SlotState::Pending)
    }

    /// Blocks until the command is resolved.
    pub fn wait(&self) {
        let mut state = self.slot.state.lock();
        while matches!(*state, SlotState::Pending) {
            self.slot.ready.wait(&mut state);
        }
    }

    /// Blocks up to `timeout`. Returns whether the command is resolved.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.slot.state.lock();
        while matches!(*state, SlotState::Pending) {
            if self.slot.ready.wait_until(&mut state, deadline).timed_out() {
                return !matches!(*state, SlotState::Pending);
            }
        }
        true
    }

    /// Waits, then returns the result. The reply is decoded on first call.
    pub fn result(&self) -> Result<Value> {
        self.wait();
        self.decoded()
    }

    /// Like [`Command::result`], but gives up with [`Error::Timeout`].
    pub fn result_timeout(&self, timeout: Duration) -> Result<Value> {
        if !self.wait_timeout(timeout) {
            return Err(Error::Timeout);
        }
        self.decoded()
    }

    fn decoded(&self) -> Result<Value> {
        let mut state = self.slot.state.lock();
        if let SlotState::Raw(raw) = &*state {
            let outcome = decode_reply(raw, &self.handlers);
            *state = SlotState::Decoded(outcome);
        }
        match &*state {
            SlotState::Decoded(outcome) => outcome.clone(),
            _ => Err(Error::Protocol(format!("command {} read before resolution", self.ccid))),
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("ccid", &self.ccid)
            .field("name", &self.name)
            .field("notification", &self.notification)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

fn decode_reply(raw: &str, handlers: &Handlers) -> Result<Value> {
    let outcome = Frame::decode(raw, handlers)?.into_outcome()?;
    outcome.map_err(Error::from)
}
