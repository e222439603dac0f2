//! # Test Sockets
//!
//! Drive a session without a browser. [`MockSocket::pair`] gives the socket
//! half the session loop reads from and a [`BrowserEnd`] the test plays the
//! page with. The browser end is synchronous, so tests can run it on their
//! own thread while another thread blocks in host calls.

use std::sync::Arc;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use crrcan::FIRST_CCID;
use crrcan::Frame;
use crrcan::Mode;
use crrcan::Outcome;
use crrcan::names;
use enhjson::Handlers;
use enhjson::Value;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::error::Result;
use crate::net::NetworkThread;
use crate::session::Session;
use crate::session_loop;
use crate::socket::Incoming;
use crate::socket::Socket;

/// What the host wrote to the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToBrowser {
    Text(String),
    Close { code: u16, reason: String },
}

/// The host half of an in-memory socket.
pub struct MockSocket {
    to_browser: std_mpsc::Sender<ToBrowser>,
    from_browser: Mutex<mpsc::UnboundedReceiver<Result<Incoming>>>,
}

impl MockSocket {
    /// A connected pair. Dropping the [`BrowserEnd`], or [`BrowserEnd::fail`],
    /// looks like a lost connection.
    pub fn pair() -> (Self, BrowserEnd) {
        let (to_browser, browser_rx) = std_mpsc::channel();
        let (browser_tx, from_browser) = mpsc::unbounded_channel();
        let socket = Self { to_browser, from_browser: Mutex::new(from_browser) };
        (socket, BrowserEnd { tx: browser_tx, rx: browser_rx })
    }
}

#[async_trait::async_trait]
impl Socket for MockSocket {
    async fn recv(&self) -> Result<Incoming> {
        match self.from_browser.lock().await.recv().await {
            Some(incoming) => incoming,
            None => Err(Error::Io("connection reset by peer".into())),
        }
    }

    async fn send(&self, text: String) -> Result<()> {
        self.to_browser.send(ToBrowser::Text(text)).map_err(|_| Error::Io("peer is gone".into()))
    }

    async fn close(&self, code: u16, reason: &str) -> Result<()> {
        let _ = self.to_browser.send(ToBrowser::Close { code, reason: reason.to_string() });
        Ok(())
    }
}

/// The test's side of a [`MockSocket`], standing in for a page.
pub struct BrowserEnd {
    tx: mpsc::UnboundedSender<Result<Incoming>>,
    rx: std_mpsc::Receiver<ToBrowser>,
}

impl BrowserEnd {
    pub fn send_text(&self, raw: impl Into<String>) {
        let _ = self.tx.send(Ok(Incoming::Text(raw.into())));
    }

    /// Replies to command `ccid`.
    pub fn respond(&self, ccid: u64, outcome: Outcome) {
        self.send_text(crrcan::encode_reply(Mode::Response, ccid, &outcome));
    }

    /// The page's opening frame, the reply to `*first*`.
    pub fn hello(&self, cid: &str, ua: &str) {
        let result = Value::object([("cid", Value::from(cid)), ("ua", Value::from(ua))]);
        self.respond(FIRST_CCID, Ok(result));
    }

    /// Calls host callback `callback_id`; the answer comes back as ccid `ccid`.
    pub fn call_back(&self, ccid: u64, callback_id: i64, args: Vec<Value>) {
        self.send_text(crrcan::encode_inbound(Mode::Callback, ccid, callback_id.into(), args));
    }

    /// Sends event `name` with `result`.
    pub fn event(&self, name: &str, result: Value) {
        let payload = Value::object([("result", result)]);
        let frame = Value::Array(vec![Mode::Event.as_u8().into(), 0u64.into(), name.into(), payload]);
        self.send_text(enhjson::encode(&frame));
    }

    /// Closes the socket the way a page does.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(Ok(Incoming::Closed { code: Some(code), reason: reason.to_string() }));
    }

    /// Makes the host's next read fail, as a broken connection does.
    pub fn fail(&self, message: &str) {
        let _ = self.tx.send(Err(Error::Io(message.to_string())));
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<ToBrowser> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// The next text frame, decoded. Host escapes become marker objects:
    /// `{"remote": rid}` and `{"callback": id}`.
    pub fn next_frame(&self, timeout: Duration) -> Option<Frame> {
        match self.recv_timeout(timeout)? {
            ToBrowser::Text(raw) => Frame::decode(&raw, &page_handlers()).ok(),
            ToBrowser::Close { .. } => None,
        }
    }

    /// Waits for a command named `name`, skipping other frames.
    pub fn expect_command(&self, name: &str, timeout: Duration) -> Option<Frame> {
        loop {
            let frame = self.next_frame(timeout)?;
            if frame.noun.as_name() == Some(name) {
                return Some(frame);
            }
        }
    }
}

fn page_handlers() -> Handlers {
    Handlers::new()
        .with("@", |args: Vec<Value>| {
            Ok(Value::object([("remote", args.into_iter().next().unwrap_or(Value::Null))]))
        })
        .with("$", |args: Vec<Value>| {
            Ok(Value::object([("callback", args.into_iter().nth(1).unwrap_or(Value::Null))]))
        })
}

/// A detached session connected to a [`BrowserEnd`] through a running loop.
pub struct Harness {
    pub session: Session,
    pub browser: BrowserEnd,
    net: NetworkThread,
}

impl Harness {
    /// Starts the loop and completes the `*first*` exchange.
    pub fn connect() -> Result<Self> {
        Self::connect_with(Duration::from_secs(2))
    }

    pub fn connect_with(close_timeout: Duration) -> Result<Self> {
        let net = NetworkThread::spawn("mupf-test-net")?;
        let session = Session::detached("test-session", close_timeout);
        let first = session.commands().register(FIRST_CCID, names::FIRST)?;
        let (socket, browser) = MockSocket::pair();
        net.handle().spawn(session_loop::run(session.clone(), Arc::new(socket), None));
        browser.hello(session.id(), "mock-browser");
        first.result_timeout(Duration::from_secs(5))?;
        Ok(Self { session, browser, net })
    }

    /// Runs `host` on its own thread while the test keeps playing the page.
    pub fn spawn_host<T, F>(&self, host: F) -> std::thread::JoinHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(Session) -> T + Send + 'static,
    {
        let session = self.session.clone();
        std::thread::spawn(move || host(session))
    }

    /// Stops the network thread, ending the loop without a close handshake.
    pub fn shutdown(mut self) {
        self.net.stop();
    }
}
