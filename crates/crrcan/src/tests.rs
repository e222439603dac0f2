use enhjson::Handlers;
use enhjson::Value;

use crate::*;

// ============================================================================
//  HEADER PREFIX
// ============================================================================

#[test]
fn test_header_prefix() {
    let header = FrameHeader::parse("[1,42,0,{\"result\":null}]").expect("header");
    assert_eq!(header, FrameHeader { mode: Mode::Response, ccid: 42 });

    let header = FrameHeader::parse("  [ 5 ,\n 7 , 3, {}]").expect("header with spaces");
    assert_eq!(header, FrameHeader { mode: Mode::Callback, ccid: 7 });
}

#[test]
fn test_header_prefix_ignores_the_rest() {
    // The payload is never looked at.
    let header = FrameHeader::parse("[7,0,this is not json").expect("header");
    assert_eq!(header.mode, Mode::Event);
}

#[test]
fn test_header_prefix_rejects() {
    assert_eq!(FrameHeader::parse("{\"a\":1}"), Err(Error::BadPrefix));
    assert_eq!(FrameHeader::parse("[1,\"x\",0]"), Err(Error::BadPrefix));
    assert_eq!(FrameHeader::parse("[1,2]"), Err(Error::BadPrefix));
    assert_eq!(FrameHeader::parse("[-1,2,0]"), Err(Error::BadPrefix));
    assert_eq!(FrameHeader::parse("[3,2,0,{}]"), Err(Error::UnknownMode(3)));
    assert_eq!(FrameHeader::parse("[1,99999999999999999999999,0]"), Err(Error::BadPrefix));
}

// ============================================================================
//  ENCODING
// ============================================================================

#[test]
fn test_encode_plain_command() {
    let text = encode_command(
        Mode::Command,
        3,
        names::INSTALL,
        vec!["alert(1)".into()],
        vec![("remove".to_string(), true.into())],
    );
    assert_eq!(text, r#"[0,3,"*install*",{"args":["alert(1)"],"kwargs":{"remove":true}}]"#);
}

#[test]
fn test_encode_notification_with_sentinel() {
    let text = encode_command(Mode::Notification, 9, "log", vec![enhjson::Sentinel::Undefined.into()], vec![]);
    assert_eq!(text, r#"[2,9,"log",["~",{"args":[["~S","undefined"]],"kwargs":{}},{"c":1}]]"#);
}

#[test]
fn test_encode_answers() {
    let ok = encode_answer(4, &Ok(Value::Int(12)));
    assert_eq!(ok, r#"[6,4,0,{"result":12}]"#);

    let mut fault = ScriptFault::new("ValueError", "bad");
    fault.line = Some(3);
    let err = encode_answer(4, &Err(fault));
    assert_eq!(err, r#"[6,4,1,{"result":["ValueError","bad",null,3,null]}]"#);
}

// ============================================================================
//  DECODING
// ============================================================================

#[test]
fn test_decode_ok_response() {
    let frame = Frame::decode(r#"[1,5,0,{"result":{"cid":"abc","ua":"test"}}]"#, &Handlers::new())
        .expect("frame");
    assert_eq!(frame.mode, Mode::Response);
    assert_eq!(frame.ccid, 5);
    let outcome = frame.into_outcome().expect("outcome").expect("ok");
    assert_eq!(outcome.get("cid").and_then(Value::as_str), Some("abc"));
}

#[test]
fn test_decode_error_response() {
    let raw = r#"[1,8,1,{"result":["DOMAttributeError","object has no attribute 'x'","core.js",10,4]}]"#;
    let fault = Frame::decode(raw, &Handlers::new())
        .expect("frame")
        .into_outcome()
        .expect("outcome")
        .expect_err("fault");
    assert_eq!(fault.kind, "DOMAttributeError");
    assert_eq!(fault.file.as_deref(), Some("core.js"));
    assert_eq!(fault.line, Some(10));
    assert_eq!(fault.to_string(), "DOMAttributeError: object has no attribute 'x' [core.js:10:4]");
}

#[test]
fn test_decode_enhanced_payload() {
    let handlers = Handlers::new().with("@", |args| {
        Ok(Value::String(format!("obj{}", args.first().and_then(Value::as_i64).unwrap_or(-1))))
    });
    let raw = r#"[5,2,11,["~",{"args":[["~@",4,null],["~S","undefined"]]},{"c":2}]]"#;
    let frame = Frame::decode(raw, &handlers).expect("frame");
    assert_eq!(frame.noun, Noun::Code(11));
    let (args, _) = frame.into_arguments();
    assert_eq!(args, vec![Value::from("obj4"), Value::Sentinel(enhjson::Sentinel::Undefined)]);
}

#[test]
fn test_decode_event() {
    let frame = Frame::decode(r#"[7,0,"*close*",{"result":null}]"#, &Handlers::new()).expect("frame");
    assert_eq!(frame.noun.as_name(), Some(names::CLOSE_EVENT));
}

#[test]
fn test_decode_rejects_bad_shapes() {
    let handlers = Handlers::new();
    assert!(matches!(Frame::decode("[1,2,0]", &handlers), Err(Error::MalformedFrame(_))));
    assert!(matches!(Frame::decode("[1,2,{},{}]", &handlers), Err(Error::MalformedFrame(_))));
    assert!(matches!(Frame::decode("[4,2,0,{}]", &handlers), Err(Error::UnknownMode(4))));
    assert!(matches!(
        Frame::decode(r#"[1,2,0,["~",["~x"],{"c":1}]]"#, &handlers),
        Ok(_)
    ));
    assert!(matches!(
        Frame::decode(r#"[1,2,0,["~",["~x",1],{"c":1}]]"#, &handlers),
        Err(Error::Codec(enhjson::Error::UnknownHandler(_)))
    ));
}

#[test]
fn test_reply_without_result_is_rejected() {
    let frame = Frame::decode(r#"[1,2,0,{}]"#, &Handlers::new()).expect("frame");
    assert_eq!(frame.into_outcome(), Err(Error::MissingResult));
}

#[test]
fn test_reply_roundtrip() {
    let text = encode_reply(Mode::Response, LAST_CCID, &Ok(Value::Null));
    let frame = Frame::decode(&text, &Handlers::new()).expect("frame");
    assert_eq!(frame.ccid, LAST_CCID);
    assert_eq!(frame.into_outcome(), Ok(Ok(Value::Null)));
}
