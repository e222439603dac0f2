//! Session loop behaviour over an in-memory socket.

use std::sync::Arc;
use std::time::Duration;

use crrcan::LAST_CCID;
use crrcan::Mode;
use crrcan::Noun;
use enhjson::Value;
use mupf::ControlEvent;
use mupf::Dispatched;
use mupf::Error;
use mupf::RemoteHandle;
use mupf::Session;
use mupf::net::NetworkThread;
use mupf::session_loop;
use mupf::testing::BrowserEnd;
use mupf::testing::Harness;
use mupf::testing::MockSocket;
use mupf::testing::ToBrowser;

const WAIT: Duration = Duration::from_secs(5);

/// Reads frames until the socket is closed by the host.
fn wait_for_close(browser: &BrowserEnd) -> Option<(u16, String)> {
    loop {
        match browser.recv_timeout(WAIT)? {
            ToBrowser::Close { code, reason } => return Some((code, reason)),
            ToBrowser::Text(_) => continue,
        }
    }
}

// ============================================================================
//  CLOSING
// ============================================================================

#[test]
fn test_last_handshake() {
    let h = Harness::connect().expect("harness");
    let pending = h.session.command("slow").issue().expect("issue");
    let closer = h.spawn_host(|session| session.close());

    let last = h.browser.expect_command("*last*", WAIT).expect("*last* sent");
    assert_eq!(last.ccid, LAST_CCID);
    h.browser.close(1000, "*last*");

    assert_eq!(closer.join().expect("closer thread"), Ok(()));
    assert_eq!(pending.result_timeout(WAIT), Err(Error::SessionClosedNormally));
    assert_eq!(wait_for_close(&h.browser), Some((1000, "*last*".to_string())));
    assert!(h.session.is_closed());
    assert_eq!(h.session.pending_commands(), 0);
    h.shutdown();
}

#[test]
fn test_page_unload_after_last_is_normal() {
    let h = Harness::connect().expect("harness");
    let pending = h.session.command("slow").issue().expect("issue");
    let closer = h.spawn_host(|session| session.close());

    h.browser.expect_command("*last*", WAIT).expect("*last* sent");
    h.browser.event("*close*", Value::Null);

    assert_eq!(closer.join().expect("closer thread"), Ok(()));
    assert_eq!(pending.result_timeout(WAIT), Err(Error::SessionClosedNormally));
    assert_eq!(wait_for_close(&h.browser), Some((1000, "*last*".to_string())));
    assert!(h.session.is_closed());
    h.shutdown();
}

#[test]
fn test_close_gives_up_after_timeout() {
    let h = Harness::connect_with(Duration::from_millis(200)).expect("harness");
    let closer = h.spawn_host(|session| session.close());

    h.browser.expect_command("*last*", WAIT).expect("*last* sent");
    assert_eq!(closer.join().expect("closer thread"), Ok(()));
    assert_eq!(wait_for_close(&h.browser), Some((1000, "*last*".to_string())));
    assert!(h.session.is_closed());
    h.shutdown();
}

#[test]
fn test_no_commands_while_closing() {
    let h = Harness::connect_with(Duration::from_secs(2)).expect("harness");
    let closer = h.spawn_host(|session| session.close());
    h.browser.expect_command("*last*", WAIT).expect("*last* sent");

    assert_eq!(h.session.command("late").issue().err(), Some(Error::SessionClosedNormally));
    h.browser.close(1000, "*last*");
    assert_eq!(closer.join().expect("closer thread"), Ok(()));
    h.shutdown();
}

#[test]
fn test_abrupt_close_is_unexpected() {
    let h = Harness::connect().expect("harness");
    let pending = h.session.command("slow").issue().expect("issue");
    h.browser.close(1001, "going away");

    match pending.result_timeout(WAIT) {
        Err(Error::SessionClosedUnexpectedly(Some(reason))) => assert!(reason.contains("1001"), "{}", reason),
        other => panic!("unexpected outcome: {:?}", other),
    }
    h.shutdown();
}

// ============================================================================
//  CALLBACKS AND EVENTS
// ============================================================================

#[test]
fn test_callback_is_answered() {
    let h = Harness::connect().expect("harness");
    let cb = h.session.register_callback(|args| Ok(Value::Int(args.len() as i64)));
    h.browser.call_back(11, cb.id(), vec![Value::from(1), Value::from("two")]);

    let done = h.session.run_one_callback_timeout(WAIT).expect("dispatch");
    assert_eq!(done, Dispatched::Invoked { callback_id: cb.id(), ccid: 11 });

    let answer = h.browser.next_frame(WAIT).expect("answer sent");
    assert_eq!((answer.mode, answer.ccid), (Mode::Answer, 11));
    assert_eq!(answer.into_outcome().expect("reply payload"), Ok(Value::Int(2)));
    h.shutdown();
}

#[test]
fn test_failing_callback_answers_with_error() {
    let h = Harness::connect().expect("harness");
    let cb = h.session.register_callback(|_| Err(Error::Callback("nope".into())));
    h.browser.call_back(4, cb.id(), Vec::new());
    h.session.run_one_callback_timeout(WAIT).expect("dispatch");

    let answer = h.browser.next_frame(WAIT).expect("answer sent");
    assert_eq!(answer.noun, Noun::Code(1));
    let fault = answer.into_outcome().expect("reply payload").expect_err("error answer");
    assert_eq!(fault.kind, "CallbackError");
    assert_eq!(fault.message, "nope");
    h.shutdown();
}

#[test]
fn test_unknown_callback_answers_with_error() {
    let h = Harness::connect().expect("harness");
    h.browser.call_back(6, 99, Vec::new());

    let done = h.session.run_one_callback_timeout(WAIT).expect("dispatch");
    assert_eq!(done, Dispatched::Invoked { callback_id: 99, ccid: 6 });
    let fault = h
        .browser
        .next_frame(WAIT)
        .expect("answer sent")
        .into_outcome()
        .expect("reply payload")
        .expect_err("error answer");
    assert_eq!(fault.kind, "CallbackUnknownError");
    h.shutdown();
}

#[test]
fn test_callback_receives_remote_objects() {
    let h = Harness::connect().expect("harness");
    let cb = h.session.register_callback(|args| {
        let target = args.first().and_then(RemoteHandle::from_value);
        Ok(Value::Bool(target.is_some_and(|t| t.rid() == 4)))
    });
    h.browser.send_text(format!(r#"[5,3,{},["~",{{"args":[["~@",4,null]]}},{{"c":1}}]]"#, cb.id()));
    h.session.run_one_callback_timeout(WAIT).expect("dispatch");

    let answer = h.browser.next_frame(WAIT).expect("answer sent");
    assert_eq!(answer.into_outcome().expect("reply payload"), Ok(Value::Bool(true)));
    h.shutdown();
}

#[test]
fn test_callback_queue_waits_for_the_app() {
    let h = Harness::connect().expect("harness");
    assert_eq!(h.session.run_one_callback_timeout(Duration::from_millis(50)), Err(Error::Timeout));
    assert_eq!(h.session.run_callbacks(10, Duration::from_millis(50)), 0);

    let cb = h.session.register_callback(|_| Ok(Value::Null));
    for ccid in 1..=3 {
        h.browser.call_back(ccid, cb.id(), Vec::new());
    }
    let mut ran = 0;
    let deadline = std::time::Instant::now() + WAIT;
    while ran < 3 && std::time::Instant::now() < deadline {
        ran += h.session.run_callbacks(10, Duration::from_millis(100));
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(ran, 3);
    for ccid in 1..=3 {
        assert_eq!(h.browser.next_frame(WAIT).map(|f| f.ccid), Some(ccid));
    }
    h.shutdown();
}

#[test]
fn test_page_event_is_delivered() {
    let h = Harness::connect().expect("harness");
    h.browser.event("resize", Value::Int(3));

    let done = h.session.run_one_callback_timeout(WAIT).expect("dispatch");
    assert_eq!(
        done,
        Dispatched::Control(ControlEvent::PeerEvent { name: "resize".into(), payload: Value::Int(3) })
    );
    assert!(h.session.is_healthy());
    h.shutdown();
}

#[test]
fn test_page_unload_ends_session() {
    let h = Harness::connect().expect("harness");
    let pending = h.session.command("slow").issue().expect("issue");
    h.browser.event("*close*", Value::Null);

    let wait = |session: &Session| session.run_one_callback_timeout(WAIT);
    assert_eq!(wait(&h.session), Ok(Dispatched::Control(ControlEvent::PeerClosing)));
    assert_eq!(wait(&h.session), Ok(Dispatched::Control(ControlEvent::SessionEnded)));
    assert!(matches!(wait(&h.session), Err(Error::SessionClosedUnexpectedly(_))));
    assert!(matches!(pending.result(), Err(Error::SessionClosedUnexpectedly(_))));
    assert_eq!(wait_for_close(&h.browser), Some((1000, String::new())));
    h.shutdown();
}

#[test]
fn test_callbacks_after_close_are_discarded() {
    let h = Harness::connect().expect("harness");
    let cb = h.session.register_callback(|_| Ok(Value::Null));
    let pending = h.session.command("slow").issue().expect("issue");
    h.browser.call_back(2, cb.id(), Vec::new());
    h.browser.fail("gone");
    pending.wait();

    assert_eq!(h.session.run_one_callback_timeout(WAIT), Ok(Dispatched::Discarded));
    assert_eq!(h.session.run_one_callback_timeout(WAIT), Ok(Dispatched::Control(ControlEvent::SessionEnded)));
    h.shutdown();
}

// ============================================================================
//  FRAMES
// ============================================================================

#[test]
fn test_bad_frames_are_dropped() {
    let h = Harness::connect().expect("harness");
    h.browser.send_text("not a frame");
    h.browser.send_text(r#"[1,999,0,{"result":null}]"#);
    h.browser.send_text(r#"[0,1,"*get*",{"args":[]}]"#);

    let host = h.spawn_host(|session| session.command("ping").call());
    let ping = h.browser.expect_command("ping", WAIT).expect("ping sent");
    h.browser.respond(ping.ccid, Ok(Value::from("pong")));
    assert_eq!(host.join().expect("host thread"), Ok(Value::from("pong")));
    assert!(h.session.is_healthy());
    h.shutdown();
}

#[test]
fn test_stashed_frames_flush_in_order() {
    let session = Session::detached("stash", Duration::from_secs(1));
    for text in ["one", "two", "three"] {
        session.command("alert").arg(text).notify().expect("notify");
    }

    let mut net = NetworkThread::spawn("stash-net").expect("network thread");
    let (socket, browser) = MockSocket::pair();
    net.handle().spawn(session_loop::run(session.clone(), Arc::new(socket), None));

    let seen: Vec<Value> = (0..3)
        .map(|_| browser.next_frame(WAIT).expect("flushed frame").into_arguments().0.remove(0))
        .collect();
    assert_eq!(seen, vec![Value::from("one"), Value::from("two"), Value::from("three")]);
    net.stop();
    assert!(session.is_closed());
}

#[test]
fn test_second_socket_is_refused() {
    let h = Harness::connect().expect("harness");
    let (socket, browser) = MockSocket::pair();
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().expect("runtime");
    runtime.block_on(session_loop::run(h.session.clone(), Arc::new(socket), None));

    assert_eq!(browser.recv_timeout(WAIT), Some(ToBrowser::Close { code: 1008, reason: "session already connected".into() }));
    assert!(h.session.is_healthy());
    h.shutdown();
}

#[test]
fn test_concurrent_commands_get_their_own_replies() {
    let h = Harness::connect().expect("harness");
    let hosts: Vec<_> = (0..8i64)
        .map(|i| h.spawn_host(move |session| session.command("echo").arg(i).call()))
        .collect();

    for _ in 0..8 {
        let echo = h.browser.expect_command("echo", WAIT).expect("echo sent");
        let ccid = echo.ccid;
        let arg = echo.into_arguments().0.remove(0);
        h.browser.respond(ccid, Ok(arg));
    }
    for (i, host) in hosts.into_iter().enumerate() {
        assert_eq!(host.join().expect("host thread"), Ok(Value::Int(i as i64)));
    }
    h.shutdown();
}

// ============================================================================
//  REMOTE OBJECTS
// ============================================================================

/// Answers the next `*get*` with remote object `rid`, bound to `ctx`.
fn reply_remote(browser: &BrowserEnd, rid: u64, ctx: Option<u64>) {
    let get = browser.expect_command("*get*", WAIT).expect("*get* sent");
    let ctx = ctx.map_or_else(|| "null".to_string(), |c| c.to_string());
    browser.send_text(format!(r#"[1,{},0,["~",{{"result":["~@",{},{}]}},{{"c":1}}]]"#, get.ccid, rid, ctx));
}

#[test]
fn test_dropped_remote_is_collected_once() {
    let h = Harness::connect().expect("harness");
    let host = h.spawn_host(|session| {
        let a = session.root().get("a").and_then(|v| RemoteHandle::from_value(&v).ok_or(Error::Timeout))?;
        let b = session.root().get("a").and_then(|v| RemoteHandle::from_value(&v).ok_or(Error::Timeout))?;
        Ok::<_, Error>(a == b)
    });
    reply_remote(&h.browser, 7, None);
    reply_remote(&h.browser, 7, None);
    assert_eq!(host.join().expect("host thread"), Ok(true));

    let gc = h.browser.expect_command("*gc*", WAIT).expect("*gc* sent");
    assert_eq!(gc.mode, Mode::Notification);
    assert_eq!(gc.into_arguments().0, vec![Value::Int(7)]);
    assert!(h.browser.recv_timeout(Duration::from_millis(100)).is_none());
    h.shutdown();
}

#[test]
fn test_call_passes_object_and_context() {
    let h = Harness::connect().expect("harness");
    let host = h.spawn_host(|session| {
        let alert = session.root().get("alert")?;
        let alert = RemoteHandle::from_value(&alert).ok_or(Error::Timeout)?;
        assert_eq!(alert.context().map(RemoteHandle::rid), Some(0));
        alert.call(vec![Value::from("hi")])
    });
    reply_remote(&h.browser, 12, Some(0));

    let call = h.browser.expect_command("*call*", WAIT).expect("*call* sent");
    let ccid = call.ccid;
    let (args, kwargs) = call.into_arguments();
    assert_eq!(args, vec![Value::from("hi")]);
    assert_eq!(kwargs.get("objid"), Some(&Value::Int(12)));
    assert_eq!(kwargs.get("cntx"), Some(&Value::Int(0)));
    h.browser.respond(ccid, Ok(Value::from("done")));

    assert_eq!(host.join().expect("host thread"), Ok(Value::from("done")));
    h.shutdown();
}

#[test]
fn test_property_commands_pass_the_object_first() {
    let h = Harness::connect().expect("harness");
    let host = h.spawn_host(|session| {
        let list = session.root().get("list")?;
        let list = RemoteHandle::from_value(&list).ok_or(Error::Timeout)?;
        list.set("title", "todo")?;
        let first = list.get_index(0)?;
        list.set_index(1, Value::Bool(true))?;
        Ok::<_, Error>(first)
    });
    reply_remote(&h.browser, 21, None);
    let this = Value::object([("remote", Value::Int(21))]);

    let set = h.browser.expect_command("*set*", WAIT).expect("*set* sent");
    let ccid = set.ccid;
    assert_eq!(set.into_arguments().0, vec![this.clone(), Value::from("title"), Value::from("todo")]);
    h.browser.respond(ccid, Ok(Value::Null));

    let geti = h.browser.expect_command("*geti*", WAIT).expect("*geti* sent");
    let ccid = geti.ccid;
    assert_eq!(geti.into_arguments().0, vec![this.clone(), Value::Int(0)]);
    h.browser.respond(ccid, Ok(Value::from("milk")));

    let seti = h.browser.expect_command("*seti*", WAIT).expect("*seti* sent");
    let ccid = seti.ccid;
    let (args, kwargs) = seti.into_arguments();
    assert_eq!(args, vec![this, Value::Int(1), Value::Bool(true)]);
    assert_eq!(kwargs.get("objid"), None);
    h.browser.respond(ccid, Ok(Value::Null));

    assert_eq!(host.join().expect("host thread"), Ok(Value::from("milk")));
    h.shutdown();
}

#[test]
fn test_new_instance_names_the_constructor() {
    let h = Harness::connect().expect("harness");
    let host = h.spawn_host(|session| {
        let date = session.root().get("Date")?;
        let date = RemoteHandle::from_value(&date).ok_or(Error::Timeout)?;
        date.new_instance(vec![Value::Int(2026), Value::Int(9)])
    });
    reply_remote(&h.browser, 30, Some(0));

    let new = h.browser.expect_command("*new*", WAIT).expect("*new* sent");
    assert_eq!(new.mode, Mode::Command);
    let ccid = new.ccid;
    let (args, kwargs) = new.into_arguments();
    assert_eq!(args, vec![Value::Int(2026), Value::Int(9)]);
    assert_eq!(kwargs.get("objid"), Some(&Value::Int(30)));
    assert_eq!(kwargs.get("cntx"), None);
    h.browser.respond(ccid, Ok(Value::from("instance")));

    assert_eq!(host.join().expect("host thread"), Ok(Value::from("instance")));
    h.shutdown();
}
