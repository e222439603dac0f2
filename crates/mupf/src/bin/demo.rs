//! Opens a browser tab, writes into the page and echoes button clicks.
//!
//! `MUPF_HOST` and `MUPF_PORT` override the listen address; `RUST_LOG`
//! controls log output.

use std::time::Duration;

use anyhow::Context;
use mupf::App;
use mupf::AppConfig;
use mupf::ControlEvent;
use mupf::Dispatched;
use mupf::RemoteHandle;
use mupf::Value;

fn main() -> anyhow::Result<()> {
    mupf::logging::init();

    let config = AppConfig::from_env()?.open_browser(true).connect_timeout(Duration::from_secs(120));
    let mut app = App::open(config).context("opening the app")?;
    println!("waiting for a browser at {}", app.base_url());

    let session = app.summon_session().context("summoning a session")?;
    println!("connected: {}", session.user_agent().unwrap_or("unknown browser"));

    let window = session.root();
    let document = handle(window.get("document")?, "document")?;
    let body = handle(document.get("body")?, "document.body")?;

    let button = handle(document.call_method("createElement", vec!["button".into()])?, "button")?;
    button.set("textContent", "Click me")?;
    body.call_method("appendChild", vec![button.clone().into()])?;

    let clicks = std::sync::atomic::AtomicU64::new(0);
    let on_click = session.register_callback(move |_args| {
        let n = clicks.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
        println!("clicked {} time(s)", n);
        Ok(Value::Null)
    });
    button.call_method("addEventListener", vec!["click".into(), on_click.into()])?;

    println!("click the button; close the tab to stop");
    loop {
        match session.run_one_callback_blocking() {
            Ok(Dispatched::Control(ControlEvent::PeerClosing | ControlEvent::SessionEnded)) => break,
            Ok(_) => {}
            Err(e) if e.is_session_closed() => break,
            Err(e) => return Err(e.into()),
        }
    }

    app.close()?;
    Ok(())
}

fn handle(value: Value, what: &str) -> anyhow::Result<RemoteHandle> {
    RemoteHandle::from_value(&value).with_context(|| format!("`{}` is not an object", what))
}
