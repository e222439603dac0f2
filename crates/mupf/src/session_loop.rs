//! # Session Loop
//!
//! One task per connected page, running on the network thread. It moves
//! frames between the socket and the session: replies resolve commands,
//! callbacks and events go to the callback queue, and queued outbound frames
//! are written in order.
//!
//! ## States
//!
//! `Connecting -> Active -> Draining -> Closed`
//!
//! - **Connecting**: waiting to take the session's outbound queue. Frames
//!   sent before this point are already in it and go out first.
//! - **Active**: multiplexing the socket, the outbound queue, the one send in
//!   flight and the host's shutdown request.
//! - **Draining**: the connection is over; unsent frames are logged and
//!   every pending command is failed once.
//!
//! ## Endings
//!
//! | Trigger | Pending commands fail with |
//! |---|---|
//! | Page closes after `*last*` | `SessionClosedNormally` (`*last*` itself gets `null`) |
//! | Host drops the connection after `*last*` | `SessionClosedNormally` |
//! | Socket error, abrupt close, `*close*` event | `SessionClosedUnexpectedly` |

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crrcan::FIRST_CCID;
use crrcan::Frame;
use crrcan::FrameHeader;
use crrcan::LAST_CCID;
use crrcan::Mode;
use crrcan::names;
use enhjson::Handlers;
use enhjson::Value;
use futures_util::future::OptionFuture;
use serde::de::IgnoredAny;
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::callback::CallbackTask;
use crate::callback::ControlEvent;
use crate::error::Error;
use crate::error::Result;
use crate::session::Session;
use crate::socket::Incoming;
use crate::socket::Socket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Connecting,
    Active,
    Draining,
    Closed,
}

#[derive(Debug)]
enum Ending {
    PeerClosed { code: Option<u16>, reason: String },
    PeerClosing,
    Failed(String),
    Shutdown,
}

type SendFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Serves `session` over `socket` until either side ends the connection.
///
/// `first` is a frame the listener already read from the socket.
pub async fn run(session: Session, socket: Arc<dyn Socket>, first: Option<String>) {
    let mut state = LoopState::Connecting;
    debug!(session = %session.id(), ?state, "socket arrived");

    let Some(mut outbound) = session.attach() else {
        warn!(session = %session.id(), "session already has a socket, refusing another");
        let _ = socket.close(1008, "session already connected").await;
        return;
    };
    if session.is_closed() {
        let _ = socket.close(1000, names::LAST).await;
        return;
    }

    state = LoopState::Active;
    info!(session = %session.id(), ?state, "page connected");
    let mut guard = FinishGuard { session: session.clone(), armed: true };

    let mut shutdown = session.shutdown_signal();
    let mut queue: VecDeque<String> = VecDeque::new();
    let mut in_flight: Option<SendFuture> = None;
    let mut outbound_open = true;
    let mut early = first.and_then(|raw| route(&session, raw));

    let ending = loop {
        if let Some(ending) = early.take() {
            break ending;
        }
        if in_flight.is_none() {
            if let Some(text) = queue.pop_front() {
                trace!(session = %session.id(), frame = %text, "send");
                let socket = socket.clone();
                in_flight = Some(Box::pin(async move { socket.send(text).await }));
            }
        }

        tokio::select! {
            incoming = socket.recv() => match incoming {
                Ok(Incoming::Text(raw)) => early = route(&session, raw),
                Ok(Incoming::Closed { code, reason }) => break Ending::PeerClosed { code, reason },
                Err(e) => break Ending::Failed(e.to_string()),
            },
            batch = next_batch(&mut outbound), if outbound_open => match batch {
                Some(batch) => queue.extend(batch),
                None => outbound_open = false,
            },
            sent = OptionFuture::from(in_flight.as_mut()), if in_flight.is_some() => {
                in_flight = None;
                if let Some(Err(e)) = sent {
                    break Ending::Failed(e.to_string());
                }
            },
            _ = wait_for_shutdown(&mut shutdown) => break Ending::Shutdown,
        }
    };

    state = LoopState::Draining;
    debug!(session = %session.id(), ?state, ?ending, "connection over");
    drop(in_flight);
    while let Ok(text) = outbound.try_recv() {
        queue.push_back(text);
    }
    for text in queue.drain(..) {
        debug!(session = %session.id(), frame = %text, "unsent frame dropped");
    }

    let last_issued = session.commands().last_issued();
    let fault = match ending {
        Ending::PeerClosed { .. } | Ending::PeerClosing if last_issued => {
            let reply = crrcan::encode_reply(Mode::Response, LAST_CCID, &Ok(Value::Null));
            if let Err(e) = session.commands().resolve(LAST_CCID, reply) {
                debug!(session = %session.id(), error = %e, "`*last*` already resolved");
            }
            Error::SessionClosedNormally
        }
        Ending::Shutdown if last_issued => Error::SessionClosedNormally,
        Ending::Shutdown => Error::SessionClosedUnexpectedly(Some("connection dropped by host".into())),
        Ending::PeerClosing => Error::SessionClosedUnexpectedly(Some("page unloaded".into())),
        Ending::PeerClosed { code, reason } => {
            let code = code.map_or_else(|| "no code".to_string(), |c| c.to_string());
            Error::SessionClosedUnexpectedly(Some(format!("socket closed ({}) {}", code, reason).trim_end().to_string()))
        }
        Ending::Failed(message) => Error::SessionClosedUnexpectedly(Some(message)),
    };
    let normal = fault == Error::SessionClosedNormally;
    guard.armed = false;
    session.finish(fault);

    let _ = socket.close(1000, if normal { names::LAST } else { "" }).await;
    state = LoopState::Closed;
    debug!(session = %session.id(), ?state, "loop finished");
}

/// Fails the session if the loop is dropped mid-flight, as happens when the
/// network thread stops under it.
struct FinishGuard {
    session: Session,
    armed: bool,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!(session = %self.session.id(), "session loop cancelled");
            self.session.finish(Error::SessionClosedUnexpectedly(Some("network thread stopped".into())));
        }
    }
}

/// Routes one inbound frame by its `[mode,ccid,` prefix.
fn route(session: &Session, raw: String) -> Option<Ending> {
    trace!(session = %session.id(), frame = %raw, "recv");
    let header = match FrameHeader::parse(&raw) {
        Ok(header) => header,
        Err(e) => {
            warn!(session = %session.id(), error = %e, "dropping unreadable frame");
            return None;
        }
    };

    match header.mode {
        Mode::Response => {
            if header.ccid == FIRST_CCID {
                if let Some(hello) = FirstReply::parse(&raw) {
                    session.set_user_agent(hello.ua);
                }
            }
            if let Err(e) = session.commands().resolve(header.ccid, raw) {
                warn!(session = %session.id(), ccid = header.ccid, error = %e, "dropping reply");
            }
        }
        Mode::Callback => {
            let task = CallbackTask::Invoke { ccid: header.ccid, raw };
            if !session.push_callback(task) {
                warn!(session = %session.id(), ccid = header.ccid, "callback queue full, dropping callback");
            }
        }
        Mode::Event => {
            if event_name(&raw).as_deref() == Some(names::CLOSE_EVENT) {
                info!(session = %session.id(), "page is unloading");
                session.push_callback(CallbackTask::Control(ControlEvent::PeerClosing));
                return Some(Ending::PeerClosing);
            }
            if !session.push_callback(CallbackTask::Event { raw }) {
                warn!(session = %session.id(), "callback queue full, dropping event");
            }
        }
        mode => {
            warn!(session = %session.id(), %mode, ccid = header.ccid, "page sent a host-only frame, dropping");
        }
    }
    None
}

/// The noun of an event frame, read without decoding the payload.
fn event_name(raw: &str) -> Option<String> {
    let (_, _, noun, _): (u64, u64, Json, IgnoredAny) = serde_json::from_str(raw).ok()?;
    match noun {
        Json::String(name) => Some(name),
        _ => None,
    }
}

/// The page's reply to `*first*`: `{"cid": ..., "ua": ...}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FirstReply {
    pub cid: String,
    pub ua: String,
}

impl FirstReply {
    pub(crate) fn parse(raw: &str) -> Option<Self> {
        let frame = Frame::decode(raw, &Handlers::new()).ok()?;
        if frame.mode != Mode::Response || frame.ccid != FIRST_CCID {
            return None;
        }
        let result = frame.into_outcome().ok()?.ok()?;
        Some(Self {
            cid: result.get("cid")?.as_str()?.to_string(),
            ua: result.get("ua").and_then(Value::as_str).unwrap_or_default().to_string(),
        })
    }
}

async fn next_batch(rx: &mut mpsc::UnboundedReceiver<String>) -> Option<Vec<String>> {
    let first = rx.recv().await?;
    let mut batch = vec![first];
    while let Ok(more) = rx.try_recv() {
        batch.push(more);
    }
    Some(batch)
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
