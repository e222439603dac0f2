//! # Sessions
//!
//! A [`Session`] is one browser page driven by the host. It is shared by the
//! application threads that issue commands and the network task that runs
//! its [`session_loop`](crate::session_loop).
//!
//! ## Lifecycle
//!
//! 1. Summoned: the app registers `*first*` and waits for the page.
//! 2. Attached: a socket arrives; frames queued so far are flushed in order.
//! 3. Healthy: commands flow both ways.
//! 4. Closing: [`Session::close`] sent `*last*`; only that frame still goes out.
//! 5. Closed: the loop ended; every pending and future command fails.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use crrcan::Mode;
use crrcan::names;
use enhjson::Handlers;
use enhjson::Value;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::app::AppShared;
use crate::callback::CALLBACK_QUEUE_CAPACITY;
use crate::callback::CallbackRef;
use crate::callback::CallbackRegistry;
use crate::callback::CallbackTask;
use crate::callback::ControlEvent;
use crate::callback::HostCallback;
use crate::command::Command;
use crate::command::CommandTable;
use crate::error::Error;
use crate::error::Result;
use crate::features::Features;
use crate::remote::ROOT_RID;
use crate::remote::RemoteHandle;
use crate::remote::RemoteInner;

const HEALTHY: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// A script to install into the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    /// Inline source text.
    Code(String),
    /// A URL the page loads, usually a route registered on the app.
    Src(String),
}

/// A handle to one page. Clones refer to the same session.
#[derive(Clone)]
pub struct Session(pub(crate) Arc<SessionInner>);

pub(crate) struct SessionInner {
    id: String,
    url: String,
    app: Weak<AppShared>,
    close_timeout: Duration,
    health: AtomicU8,
    attached: AtomicBool,
    handlers: Arc<Handlers>,
    commands: CommandTable,
    outbound_tx: mpsc::UnboundedSender<String>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    callback_tx: Mutex<Option<std_mpsc::SyncSender<CallbackTask>>>,
    callback_rx: Mutex<std_mpsc::Receiver<CallbackTask>>,
    remotes: Mutex<HashMap<(u64, Option<u64>), Weak<RemoteInner>>>,
    callbacks: Mutex<CallbackRegistry>,
    features: OnceLock<Features>,
    user_agent: OnceLock<String>,
    legal_names: RwLock<Option<HashSet<String>>>,
    ready: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
}

impl Session {
    pub(crate) fn new(id: String, url: String, app: Weak<AppShared>, close_timeout: Duration) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (callback_tx, callback_rx) = std_mpsc::sync_channel(CALLBACK_QUEUE_CAPACITY);
        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner>| {
            let handlers = escape_handlers(weak.clone());
            SessionInner {
                id,
                url,
                app,
                close_timeout,
                health: AtomicU8::new(HEALTHY),
                attached: AtomicBool::new(false),
                commands: CommandTable::new(handlers.clone()),
                handlers,
                outbound_tx,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                callback_tx: Mutex::new(Some(callback_tx)),
                callback_rx: Mutex::new(callback_rx),
                remotes: Mutex::new(HashMap::new()),
                callbacks: Mutex::new(CallbackRegistry::default()),
                features: OnceLock::new(),
                user_agent: OnceLock::new(),
                legal_names: RwLock::new(None),
                ready: watch::Sender::new(false),
                shutdown: watch::Sender::new(false),
            }
        });
        Self(inner)
    }

    /// A session owned by no app. Used with [`testing`](crate::testing) sockets.
    pub fn detached(id: impl Into<String>, close_timeout: Duration) -> Self {
        Self::new(id.into(), String::new(), Weak::new(), close_timeout)
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    /// The page URL that connects to this session.
    pub fn url(&self) -> &str {
        &self.0.url
    }

    pub fn is_healthy(&self) -> bool {
        self.0.health.load(Ordering::Acquire) == HEALTHY
    }

    pub fn is_closed(&self) -> bool {
        self.0.health.load(Ordering::Acquire) == CLOSED
    }

    /// Features the page reported at summon time.
    pub fn features(&self) -> Option<&Features> {
        self.0.features.get()
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.0.user_agent.get().map(String::as_str)
    }

    /// Commands still waiting for a reply.
    pub fn pending_commands(&self) -> usize {
        self.0.commands.pending()
    }

    /// Starts building a command.
    pub fn command(&self, name: &str) -> CommandBuilder<'_> {
        CommandBuilder { session: self, name: name.to_string(), args: Vec::new(), kwargs: Vec::new() }
    }

    /// Issues a command and queues its frame.
    ///
    /// Names outside the list the page reported are sent anyway, with a warning.
    pub fn send_command(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        notification: bool,
    ) -> Result<Command> {
        let is_last = name == names::LAST;
        if !is_last {
            match self.0.health.load(Ordering::Acquire) {
                HEALTHY => {}
                CLOSING => return Err(Error::SessionClosedNormally),
                _ => return Err(self.closed_error()),
            }
        }
        if let Some(legal) = self.0.legal_names.read().as_ref() {
            if !legal.contains(name) && !names::BUILTIN.contains(&name) {
                warn!(session = %self.0.id, command = name, "command not offered by the page");
            }
        }

        let command = self.0.commands.issue(name, notification, is_last)?;
        let mode = if notification { Mode::Notification } else { Mode::Command };
        debug!(session = %self.0.id, ccid = command.ccid(), %mode, command = name, "issuing");
        let frame = crrcan::encode_command(mode, command.ccid(), name, args, kwargs);
        self.send_frame(frame, is_last);
        Ok(command)
    }

    /// Queues a frame for the socket. Frames sent before the socket attaches
    /// wait in the queue. Dropped once the session is not healthy, unless
    /// `force` is set while closing.
    pub(crate) fn send_frame(&self, text: String, force: bool) {
        match self.0.health.load(Ordering::Acquire) {
            HEALTHY => {}
            CLOSING if force => {}
            _ => {
                debug!(session = %self.0.id, frame = %text, "dropping frame, session not healthy");
                return;
            }
        }
        if self.0.outbound_tx.send(text).is_err() {
            debug!(session = %self.0.id, "outbound queue closed");
        }
    }

    /// `window` in the page.
    pub fn root(&self) -> RemoteHandle {
        self.remote_handle(ROOT_RID, None, None)
    }

    /// Runs `script` in the page and waits until it has loaded. With
    /// `remove`, the script element is taken out of the document afterwards.
    pub fn install_script(&self, script: Script, remove: bool) -> Result<()> {
        let builder = match script {
            Script::Code(code) => self.command(names::INSTALL).kwarg("code", code),
            Script::Src(src) => self.command(names::INSTALL).kwarg("src", src),
        };
        builder.kwarg("remove", remove).call()?;
        Ok(())
    }

    /// Installs a script that adds commands, then refreshes the list of
    /// command names the page offers.
    pub fn install_commands(&self, script: Script) -> Result<()> {
        self.install_script(script, true)?;
        self.refresh_commands()
    }

    /// Asks the page for its command names.
    pub fn refresh_commands(&self) -> Result<()> {
        let listed = self.command(names::GETCMDS).call()?;
        let listed = listed
            .as_array()
            .ok_or_else(|| Error::Protocol("`*getcmds*` did not return an array".into()))?;
        let names: HashSet<String> = listed.iter().filter_map(Value::as_str).map(str::to_string).collect();
        debug!(session = %self.0.id, count = names.len(), "page commands");
        *self.0.legal_names.write() = Some(names);
        Ok(())
    }

    /// Registers a host closure the page may call.
    pub fn register_callback<F>(&self, callback: F) -> CallbackRef
    where
        F: Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        self.register_shared_callback(Arc::new(callback))
    }

    /// Registers a shared closure. The same `Arc` always gets the same id.
    pub fn register_shared_callback(&self, callback: HostCallback) -> CallbackRef {
        CallbackRef::new(self.0.callbacks.lock().register(callback))
    }

    /// Ends the session through the `*last*` handshake.
    ///
    /// Waits up to the configured close timeout for the page to close its
    /// socket; after that the connection is dropped. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.0.health.compare_exchange(HEALTHY, CLOSING, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Ok(());
        }
        info!(session = %self.0.id, "closing session");

        if !self.0.attached.load(Ordering::Acquire) {
            self.finish(Error::SessionClosedNormally);
            return Ok(());
        }

        let last = match self.send_command(names::LAST, Vec::new(), Vec::new(), false) {
            Ok(command) => command,
            Err(e) => {
                self.request_shutdown();
                return if e.is_session_closed() { Ok(()) } else { Err(e) };
            }
        };
        match last.result_timeout(self.0.close_timeout) {
            Ok(_) | Err(Error::SessionClosedNormally) => Ok(()),
            Err(Error::Timeout) => {
                warn!(session = %self.0.id, "page did not acknowledge `*last*`, dropping connection");
                self.request_shutdown();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------------
    //  Crate internals used by the loop, the app and the dispatcher
    // ------------------------------------------------------------------------

    pub(crate) fn handlers(&self) -> &Handlers {
        &self.0.handlers
    }

    pub(crate) fn commands(&self) -> &CommandTable {
        &self.0.commands
    }

    pub(crate) fn callback(&self, id: i64) -> Option<HostCallback> {
        self.0.callbacks.lock().get(id)
    }

    /// Host callbacks registered so far.
    pub fn registered_callbacks(&self) -> usize {
        self.0.callbacks.lock().len()
    }

    /// Hands the outbound queue to the socket that attaches first.
    pub(crate) fn attach(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        let rx = self.0.outbound_rx.lock().take()?;
        self.0.attached.store(true, Ordering::Release);
        Some(rx)
    }

    pub(crate) fn mark_ready(&self) {
        self.0.ready.send_replace(true);
    }

    /// Resolves once the app has finished registering the session.
    pub(crate) async fn wait_ready(&self) {
        let mut rx = self.0.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.0.shutdown.subscribe()
    }

    /// Tells the loop to drop the connection.
    pub(crate) fn request_shutdown(&self) {
        self.0.shutdown.send_replace(true);
    }

    pub(crate) fn set_user_agent(&self, ua: String) {
        let _ = self.0.user_agent.set(ua);
    }

    pub(crate) fn set_features(&self, features: Features) {
        let _ = self.0.features.set(features);
    }

    /// Queues a task for the dispatcher. False if the queue is full or gone.
    pub(crate) fn push_callback(&self, task: CallbackTask) -> bool {
        match self.0.callback_tx.lock().as_ref() {
            Some(tx) => tx.try_send(task).is_ok(),
            None => false,
        }
    }

    pub(crate) fn next_callback_task(&self, timeout: Option<Duration>) -> Result<CallbackTask> {
        let rx = self.0.callback_rx.lock();
        let received = match timeout {
            None => rx.recv().map_err(|_| std_mpsc::RecvTimeoutError::Disconnected),
            Some(timeout) => rx.recv_timeout(timeout),
        };
        match received {
            Ok(task) => Ok(task),
            Err(std_mpsc::RecvTimeoutError::Timeout) => Err(Error::Timeout),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => Err(self.closed_error()),
        }
    }

    pub(crate) fn try_next_callback_task(&self) -> Option<CallbackTask> {
        self.0.callback_rx.try_lock()?.try_recv().ok()
    }

    /// Marks the session closed and fails everything still waiting on it.
    pub(crate) fn finish(&self, fault: Error) {
        self.0.health.store(CLOSED, Ordering::Release);
        self.0.commands.close_with_fault(fault);
        if let Some(tx) = self.0.callback_tx.lock().take() {
            let _ = tx.try_send(CallbackTask::Control(ControlEvent::SessionEnded));
        }
        if let Some(app) = self.0.app.upgrade() {
            app.forget_session(&self.0.id);
        }
        info!(session = %self.0.id, "session closed");
    }

    fn closed_error(&self) -> Error {
        self.0.commands.sealed().unwrap_or(Error::SessionClosedUnexpectedly(None))
    }

    /// Returns the live handle for `(rid, ctx)`, creating it if needed.
    pub(crate) fn remote_handle(&self, rid: u64, ctx: Option<u64>, name: Option<String>) -> RemoteHandle {
        let ctx_handle = ctx.map(|c| self.remote_handle(c, None, None));
        let mut remotes = self.0.remotes.lock();
        if let Some(live) = remotes.get(&(rid, ctx)).and_then(Weak::upgrade) {
            return RemoteHandle(live);
        }
        let inner = Arc::new(RemoteInner::new(rid, ctx_handle, name, Arc::downgrade(&self.0)));
        remotes.insert((rid, ctx), Arc::downgrade(&inner));
        RemoteHandle(inner)
    }

    /// Drops the dead cache entry for `key`. Returns true when another live
    /// handle still refers to the same page object.
    pub(crate) fn forget_remote(&self, key: (u64, Option<u64>)) -> bool {
        let mut remotes = self.0.remotes.lock();
        if remotes.get(&key).is_some_and(|w| w.strong_count() == 0) {
            remotes.remove(&key);
        }
        remotes.iter().any(|((rid, _), w)| *rid == key.0 && w.strong_count() > 0)
    }
}

/// Escape handlers for reply payloads. `~@` becomes a [`RemoteHandle`].
fn escape_handlers(session: Weak<SessionInner>) -> Arc<Handlers> {
    let handlers = Handlers::new().with("@", move |args: Vec<Value>| {
        let fail = |message: &str| enhjson::Error::Handler { handler: "@".into(), message: message.into() };
        let inner = session.upgrade().ok_or_else(|| fail("session is gone"))?;
        let rid = args.first().and_then(Value::as_u64).ok_or_else(|| fail("object id missing"))?;
        let ctx = args.get(1).and_then(Value::as_u64);
        let name = args.get(2).and_then(Value::as_str).map(str::to_string);
        Ok(Session(inner).remote_handle(rid, ctx, name).into())
    });
    Arc::new(handlers)
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.0.id)
            .field("healthy", &self.is_healthy())
            .field("pending", &self.pending_commands())
            .finish()
    }
}

// ============================================================================
//  COMMAND BUILDER
// ============================================================================

/// Collects arguments for one command.
#[must_use]
pub struct CommandBuilder<'a> {
    session: &'a Session,
    name: String,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
}

impl CommandBuilder<'_> {
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.args.extend(values);
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.push((key.into(), value.into()));
        self
    }

    /// Sends the command and returns it without waiting.
    pub fn issue(self) -> Result<Command> {
        self.session.send_command(&self.name, self.args, self.kwargs, false)
    }

    /// Sends the command as a notification; the page will not reply.
    pub fn notify(self) -> Result<()> {
        self.session.send_command(&self.name, self.args, self.kwargs, true)?;
        Ok(())
    }

    /// Sends the command and blocks for its result.
    pub fn call(self) -> Result<Value> {
        self.issue()?.result()
    }
}
