//! The HTTP side of an app, exercised with plain TCP requests.

use std::io::Read;
use std::io::Write;
use std::net::SocketAddr;
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;

use mupf::App;
use mupf::AppConfig;
use mupf::Error;

fn open_app() -> App {
    let config = AppConfig::new().host("127.0.0.1").port(0).open_browser(false);
    App::open(config).expect("app opens")
}

/// Sends a GET and returns the status code, the raw head and the body.
fn get(addr: SocketAddr, path: &str) -> (u16, String, String) {
    get_with(addr, path, "")
}

/// Like [`get`], with `extra` appended to the request head.
fn get_with(addr: SocketAddr, path: &str, extra: &str) -> (u16, String, String) {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream.set_read_timeout(Some(Duration::from_secs(5))).expect("read timeout");
    write!(stream, "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n{}\r\n", path, addr, extra)
        .expect("write request");

    let mut response = String::new();
    stream.read_to_string(&mut response).expect("read response");
    let (head, body) = response.split_once("\r\n\r\n").unwrap_or((response.as_str(), ""));
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("status code");
    (status, head.to_ascii_lowercase(), body.to_string())
}

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("mupf-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).expect("scratch dir");
    dir
}

#[test]
fn test_open_binds_requested_host() {
    let mut app = open_app();
    assert_ne!(app.local_addr().port(), 0);
    assert_eq!(app.base_url(), format!("http://127.0.0.1:{}/", app.local_addr().port()));
    app.close().expect("close");
}

#[test]
fn test_fixed_routes() {
    let mut app = open_app();
    let addr = app.local_addr();

    let (status, _, body) = get(addr, "/");
    assert_eq!(status, 200);
    assert!(body.contains("/mupf/"));

    let (status, head, body) = get(addr, "/mupf/core");
    assert_eq!(status, 200);
    assert!(head.contains("application/javascript"));
    assert!(body.contains("mupf.fts"));

    assert_eq!(get(addr, "/mupf/closed").0, 200);
    assert_eq!(get(addr, "/mupf/whatever").0, 410);
    assert_eq!(get(addr, "/mupf/no-such-session/bootstrap").0, 404);
    assert_eq!(get(addr, "/nothing/here").0, 404);
    app.close().expect("close");
}

#[test]
fn test_registered_routes_serve_files() {
    let mut app = open_app();
    let addr = app.local_addr();
    let dir = scratch_dir("routes");
    std::fs::write(dir.join("hello.txt"), "hello there").expect("write file");
    std::fs::write(dir.join("page.html"), "<p>page</p>").expect("write file");

    assert_eq!(app.register_route("files/", &dir).expect("register"), "/files");
    assert_eq!(app.register_route("/page", dir.join("page.html")).expect("register"), "/page");

    let (status, head, body) = get(addr, "/files/hello.txt");
    assert_eq!((status, body.as_str()), (200, "hello there"));
    assert!(head.contains("text/plain"));
    let (status, head, _) = get(addr, "/page");
    assert_eq!(status, 200);
    assert!(head.contains("text/html"));
    assert_eq!(get(addr, "/files/missing.txt").0, 404);

    assert_eq!(app.unregister_route("/page"), Ok(true));
    assert_eq!(get(addr, "/page").0, 404);
    app.close().expect("close");
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn test_route_files_get_content_types_and_ranges() {
    let mut app = open_app();
    let addr = app.local_addr();
    let dir = scratch_dir("ranges");
    std::fs::write(dir.join("module.wasm"), b"\0asm").expect("write file");
    std::fs::write(dir.join("greeting.txt"), "hello there").expect("write file");
    app.register_route("/assets", &dir).expect("register");

    let (status, head, _) = get(addr, "/assets/module.wasm");
    assert_eq!(status, 200);
    assert!(head.contains("application/wasm"));

    let (status, head, body) = get_with(addr, "/assets/greeting.txt", "Range: bytes=0-4\r\n");
    assert_eq!((status, body.as_str()), (206, "hello"));
    assert!(head.contains("content-range: bytes 0-4/11"));

    let (status, head, _) = get(addr, "/assets/greeting.txt");
    assert_eq!(status, 200);
    assert!(head.contains("last-modified: "));
    assert!(head.contains("accept-ranges: bytes"));

    app.close().expect("close");
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn test_reserved_routes_are_refused() {
    let mut app = open_app();
    assert!(matches!(app.register_route("/", "index.html"), Err(Error::ReservedRoute(_))));
    assert!(matches!(app.register_route("/mupf/x", "x.js"), Err(Error::ReservedRoute(_))));
    assert!(matches!(app.register_route("/a/../b", "x.js"), Err(Error::InvalidArgument(_))));
    app.close().expect("close");
}

#[test]
fn test_summon_times_out_without_a_page() {
    let config = AppConfig::new()
        .host("127.0.0.1")
        .port(0)
        .open_browser(false)
        .connect_timeout(Duration::from_millis(200));
    let mut app = App::open(config).expect("app opens");

    assert_eq!(app.summon_session().err(), Some(Error::Timeout));
    assert!(app.sessions().is_empty());
    app.close().expect("close");
    app.close().expect("second close is a no-op");
}
