//! # App
//!
//! The host side entry point. An [`App`] owns the network thread and the
//! HTTP server, and keeps every session it summoned until that session ends.
//!
//! ```no_run
//! use mupf::App;
//! use mupf::AppConfig;
//!
//! fn main() -> mupf::Result<()> {
//!     let mut app = App::open(AppConfig::new().open_browser(true))?;
//!     let session = app.summon_session()?;
//!     let document = session.root().get("document")?;
//!     println!("{:?}", document);
//!     app.close()
//! }
//! ```

use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Weak;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use crrcan::FIRST_CCID;
use crrcan::names;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tracing::error;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::assets;
use crate::config::AppConfig;
use crate::error::Error;
use crate::error::Result;
use crate::features::CORE_FEATURES;
use crate::features::Features;
use crate::features::STRICT_FEATURE_LIST;
use crate::launcher;
use crate::listener;
use crate::net::NetworkThread;
use crate::session::Script;
use crate::session::Session;

/// Route the core script is served from.
pub const CORE_SCRIPT_ROUTE: &str = "/mupf/core";

/// State shared between the app and the request handlers.
pub(crate) struct AppShared {
    pub(crate) config: AppConfig,
    /// The core script, preprocessed once at open.
    pub(crate) core_script: String,
    sessions: DashMap<String, Session>,
    routes: DashMap<String, PathBuf>,
}

impl AppShared {
    pub(crate) fn session(&self, id: &str) -> Option<Session> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    pub(crate) fn forget_session(&self, id: &str) {
        self.sessions.remove(id);
    }

    pub(crate) fn resolve_route(&self, route: &str) -> Option<PathBuf> {
        let routes: Vec<(String, PathBuf)> =
            self.routes.iter().map(|r| (r.key().clone(), r.value().clone())).collect();
        listener::lookup(&routes, route)
    }
}

pub struct App {
    shared: Arc<AppShared>,
    net: NetworkThread,
    server_stop: watch::Sender<bool>,
    local_addr: SocketAddr,
    closed: bool,
}

impl App {
    /// Starts the network thread and binds the HTTP server.
    pub fn open(config: AppConfig) -> Result<Self> {
        let core_script = assets::core(&config.features)?;
        let net = NetworkThread::spawn("mupf-net")?;
        let shared = Arc::new(AppShared {
            config,
            core_script,
            sessions: DashMap::new(),
            routes: DashMap::new(),
        });

        let (addr_tx, addr_rx) = oneshot::channel::<Result<SocketAddr>>();
        let (server_stop, mut stop_rx) = watch::channel(false);
        let router = listener::router(shared.clone());
        let (host, port) = (shared.config.host.clone(), shared.config.port);

        net.handle().spawn(async move {
            let listener = match TcpListener::bind((host.as_str(), port)).await {
                Ok(listener) => listener,
                Err(e) => {
                    let _ = addr_tx.send(Err(e.into()));
                    return;
                }
            };
            let addr = match listener.local_addr() {
                Ok(addr) => addr,
                Err(e) => {
                    let _ = addr_tx.send(Err(e.into()));
                    return;
                }
            };
            let _ = addr_tx.send(Ok(addr));
            info!(%addr, "listening");

            let stopped = async move {
                let _ = stop_rx.wait_for(|stop| *stop).await;
            };
            if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(stopped).await {
                error!(error = %e, "server failed");
            }
        });

        let local_addr = addr_rx
            .blocking_recv()
            .map_err(|_| Error::Io("server task ended before binding".into()))??;
        Ok(Self { shared, net, server_stop, local_addr, closed: false })
    }

    pub fn config(&self) -> &AppConfig {
        &self.shared.config
    }

    /// The bound address. Differs from the config when port `0` was asked for.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `http://host:port/`, with unspecified hosts shown as loopback.
    pub fn base_url(&self) -> String {
        let ip = match self.local_addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        format!("http://{}/", SocketAddr::new(ip, self.local_addr.port()))
    }

    /// Creates a session and waits for a page to connect to it.
    ///
    /// With `open_browser` set the default browser is pointed at the session
    /// URL; otherwise the caller opens [`Session::url`] somehow. Once
    /// connected, the core script is installed and the page's features are
    /// read back. With `strict_feature_list` on, any difference from the
    /// requested features fails the summon.
    pub fn summon_session(&self) -> Result<Session> {
        let session = self.new_session();
        let first = session.commands().register(FIRST_CCID, names::FIRST)?;
        session.mark_ready();
        info!(session = %session.id(), url = %session.url(), "session summoned");

        if self.shared.config.open_browser {
            if let Err(e) = launcher::open(session.url()) {
                warn!(session = %session.id(), error = %e, "could not launch a browser");
            }
        }

        let connected = first
            .result_timeout(self.shared.config.connect_timeout)
            .and_then(|_| self.negotiate(&session));
        match connected {
            Ok(()) => Ok(session),
            Err(e) => {
                warn!(session = %session.id(), error = %e, "summon failed");
                let _ = session.close();
                Err(e)
            }
        }
    }

    fn new_session(&self) -> Session {
        loop {
            let id = new_client_id();
            if let Entry::Vacant(slot) = self.shared.sessions.entry(id.clone()) {
                let url = format!("{}#{}", self.base_url(), id);
                let app: Weak<AppShared> = Arc::downgrade(&self.shared);
                let session = Session::new(id, url, app, self.shared.config.close_timeout);
                slot.insert(session.clone());
                return session;
            }
        }
    }

    fn negotiate(&self, session: &Session) -> Result<()> {
        session.install_script(Script::Src(CORE_SCRIPT_ROUTE.into()), false)?;
        let reported = Features::from_reported(&session.command(names::FEATURES).call()?)?;

        let requested = &self.shared.config.features;
        if requested.is_enabled(STRICT_FEATURE_LIST) && requested.enabled() != reported.enabled() {
            return Err(Error::StrictFeatures {
                requested: requested.enabled().into_iter().collect(),
                reported: reported.enabled().into_iter().collect(),
            });
        }
        let agreed = requested.intersect(&reported);
        let core = agreed.is_enabled(CORE_FEATURES);
        session.set_features(agreed);
        if core {
            session.refresh_commands()?;
        }
        Ok(())
    }

    pub fn session(&self, id: &str) -> Option<Session> {
        self.shared.session(id)
    }

    /// Sessions that have not ended yet.
    pub fn sessions(&self) -> Vec<Session> {
        self.shared.sessions.iter().map(|s| s.value().clone()).collect()
    }

    /// Serves `file` at `path`. A directory serves the files below it.
    /// Returns the normalized route.
    pub fn register_route(&self, path: &str, file: impl Into<PathBuf>) -> Result<String> {
        let route = listener::normalize_route(path)?;
        self.shared.routes.insert(route.clone(), file.into());
        Ok(route)
    }

    pub fn unregister_route(&self, path: &str) -> Result<bool> {
        let route = listener::normalize_route(path)?;
        Ok(self.shared.routes.remove(&route).is_some())
    }

    /// Points the default browser at `url`.
    pub fn open_browser(&self, url: &str) -> Result<()> {
        launcher::open(url)
    }

    /// Closes every session, then stops the server and the network thread.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut first_error = None;
        for session in self.sessions() {
            if let Err(e) = session.close() {
                warn!(session = %session.id(), error = %e, "session did not close cleanly");
                first_error.get_or_insert(e);
            }
        }
        self.server_stop.send_replace(true);
        self.net.stop();
        info!("app closed");
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for App {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "app close on drop failed");
        }
    }
}

/// 22 URL-safe characters from a random UUID.
fn new_client_id() -> String {
    URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes())
}
