//! # Listener
//!
//! The HTTP side of an app: pages, scripts, WebSocket upgrades and the file
//! routes registered by the application.
//!
//! | Route | Serves |
//! |---|---|
//! | `/` | landing page; the session id is in the URL fragment |
//! | `/mupf/{sid}/bootstrap` | bootstrap script, once the session is ready |
//! | `/mupf/core` | core script, preprocessed for the app's features |
//! | `/mupf/{sid}/ws` | WebSocket for session `sid` |
//! | `/mupf/ws` | WebSocket whose first frame names the session |
//! | `/mupf/closed` | page shown after `*last*` |
//! | other `/mupf/...` | `410 Gone` |
//! | anything else | registered file routes, or `404` |

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::extract::Path;
use axum::extract::Request;
use axum::extract::State;
use axum::extract::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::http::header;
use axum::response::Html;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use tower_http::services::ServeFile;
use tracing::debug;
use tracing::warn;

use crate::app::AppShared;
use crate::assets;
use crate::error::Error;
use crate::error::Result;
use crate::session_loop;
use crate::session_loop::FirstReply;
use crate::socket::Incoming;
use crate::socket::Socket;
use crate::socket::WsSocket;

pub(crate) fn router(shared: Arc<AppShared>) -> Router {
    Router::new()
        .route("/", get(main_page))
        .route("/mupf/core", get(core_script))
        .route("/mupf/closed", get(closed_page))
        .route("/mupf/ws", get(ws_first_frame))
        .route("/mupf/{sid}/bootstrap", get(bootstrap))
        .route("/mupf/{sid}/ws", get(ws_session))
        .fallback(file_route)
        .with_state(shared)
}

async fn main_page(State(shared): State<Arc<AppShared>>) -> Html<String> {
    Html(assets::main_page(&shared.config.charset))
}

async fn closed_page(State(shared): State<Arc<AppShared>>) -> Html<String> {
    Html(assets::closed_page(&shared.config.charset))
}

async fn core_script(State(shared): State<Arc<AppShared>>) -> Response {
    javascript(&shared.config.charset, shared.core_script.clone())
}

async fn bootstrap(Path(sid): Path<String>, State(shared): State<Arc<AppShared>>) -> Response {
    let Some(session) = shared.session(&sid) else {
        debug!(session = %sid, "bootstrap for unknown session");
        return StatusCode::NOT_FOUND.into_response();
    };
    session.wait_ready().await;
    javascript(&shared.config.charset, assets::bootstrap(session.id()))
}

async fn ws_session(
    ws: WebSocketUpgrade,
    Path(sid): Path<String>,
    State(shared): State<Arc<AppShared>>,
) -> Response {
    let Some(session) = shared.session(&sid) else {
        warn!(error = %Error::UnknownConnection(sid), "refusing socket");
        return StatusCode::NOT_FOUND.into_response();
    };
    ws.on_upgrade(move |socket| async move {
        session_loop::run(session, Arc::new(WsSocket::new(socket)), None).await;
    })
}

async fn ws_first_frame(ws: WebSocketUpgrade, State(shared): State<Arc<AppShared>>) -> Response {
    ws.on_upgrade(move |socket| async move {
        let socket: Arc<dyn Socket> = Arc::new(WsSocket::new(socket));
        let raw = match socket.recv().await {
            Ok(Incoming::Text(raw)) => raw,
            other => {
                debug!(?other, "socket ended before its first frame");
                return;
            }
        };
        let session = FirstReply::parse(&raw).and_then(|hello| shared.session(&hello.cid));
        match session {
            Some(session) => session_loop::run(session, socket, Some(raw)).await,
            None => {
                warn!(error = %Error::UnknownConnection(raw), "refusing socket");
                let _ = socket.close(1008, "unknown connection").await;
            }
        }
    })
}

async fn file_route(State(shared): State<Arc<AppShared>>, request: Request) -> Response {
    let path = request.uri().path();
    if path == "/mupf" || path.starts_with("/mupf/") {
        return StatusCode::GONE.into_response();
    }
    let Ok(route) = normalize_route(path) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(file) = shared.resolve_route(&route) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match ServeFile::new(&file).try_call(request).await {
        Ok(response) => response.into_response(),
        Err(e) => {
            debug!(route = %route, file = %file.display(), error = %e, "route file unreadable");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn javascript(charset: &str, body: String) -> Response {
    let content_type = format!("application/javascript; charset={}", charset);
    ([(header::CONTENT_TYPE, content_type)], body).into_response()
}

// ============================================================================
//  ROUTE TABLE
// ============================================================================

/// Percent-decodes `path` and reduces it to `/seg/seg`.
///
/// Fails for `/` itself, anything starting with `/mupf`, `.` and `..`
/// segments, and escapes that do not decode to UTF-8.
pub fn normalize_route(path: &str) -> Result<String> {
    let decoded = percent_decode(path)?;
    let mut segments = Vec::new();
    for segment in decoded.split('/').filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." {
            return Err(Error::InvalidArgument(format!("route `{}` has relative segments", path)));
        }
        segments.push(segment);
    }
    let route = format!("/{}", segments.join("/"));
    if segments.is_empty() || segments[0].starts_with("mupf") {
        return Err(Error::ReservedRoute(route));
    }
    Ok(route)
}

fn percent_decode(path: &str) -> Result<String> {
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| Error::InvalidArgument(format!("bad escape in `{}`", path)))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| Error::InvalidArgument(format!("`{}` is not UTF-8 once decoded", path)))
}

/// Finds the file for `route`: an exact registration, or a file under a
/// registered directory.
pub(crate) fn lookup(routes: &[(String, PathBuf)], route: &str) -> Option<PathBuf> {
    let mut best: Option<(&str, &PathBuf)> = None;
    for (prefix, target) in routes {
        if prefix == route {
            return Some(target.clone());
        }
        let under = route.strip_prefix(prefix.as_str()).is_some_and(|rest| rest.starts_with('/'));
        if under && target.is_dir() && best.is_none_or(|(b, _)| prefix.len() > b.len()) {
            best = Some((prefix, target));
        }
    }
    let (prefix, dir) = best?;
    Some(dir.join(route[prefix.len() + 1..].trim_start_matches('/')))
}
