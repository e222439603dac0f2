use std::any::Any;
use std::sync::Arc;

use crate::*;

// ============================================================================
//  FIXTURES
// ============================================================================

/// Host object escaping as `["~<handler>", args...]`.
struct Tagged {
    handler: &'static str,
    args: Vec<i64>,
}

impl Escapable for Tagged {
    fn escape(&self) -> Option<Escape> {
        Some(Escape::new(self.handler, self.args.iter().map(|&a| Value::Int(a)).collect()))
    }

    fn describe(&self) -> String {
        format!("<Tagged {}>", self.handler)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Host object that does not know how to escape itself.
struct Opaque;

impl Escapable for Opaque {
    fn escape(&self) -> Option<Escape> {
        None
    }

    fn describe(&self) -> String {
        "<Opaque>".to_string()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

fn k() -> Value {
    Value::host(Arc::new(Tagged { handler: "@", args: vec![650] }))
}

fn kk() -> Value {
    Value::host(Arc::new(Tagged { handler: "@", args: vec![650, 340] }))
}

fn u(x: i64) -> Value {
    Value::host(Arc::new(Tagged { handler: "u", args: vec![x] }))
}

fn arr(items: Vec<Value>) -> Value {
    Value::Array(items)
}

fn block(value: Value) -> EnhancedBlock {
    EnhancedBlock::new(value)
}

fn wrap(block: EnhancedBlock) -> Value {
    Value::Enhanced(Box::new(block))
}

fn set_frame(target: Value, policy: OptPolicy) -> Value {
    let payload = Value::object([
        ("args", arr(vec![target, "prop".into(), 0.into()])),
        ("kwargs", Value::object(Vec::<(String, Value)>::new())),
    ]);
    arr(vec![0.into(), 0.into(), "*set*".into(), wrap(block(payload).with_policy(policy))])
}

// ============================================================================
//  ENCODING
// ============================================================================

#[test]
fn test_plain_string() {
    assert_eq!(encode(&"basic".into()), "\"basic\"");
}

#[test]
fn test_blocks_without_escapes_are_erased() {
    let inner = Value::from(vec![3, 5, 6]).enhanced();
    let value = arr(vec![7.into(), "a".into(), inner]).enhanced();
    assert_eq!(encode(&value), "[7,\"a\",[3,5,6]]");
}

#[test]
fn test_escape_inside_command_payload() {
    let frame = set_frame(k(), OptPolicy::NonZeroCount);
    assert_eq!(
        encode(&frame),
        r#"[0,0,"*set*",["~",{"args":[["~@",650],"prop",0],"kwargs":{}},{"c":1}]]"#
    );

    let frame = set_frame(kk(), OptPolicy::NonZeroCount);
    assert_eq!(
        encode(&frame),
        r#"[0,0,"*set*",["~",{"args":[["~@",650,340],"prop",0],"kwargs":{}},{"c":1}]]"#
    );
}

#[test]
fn test_tilde_arrays_are_fenced_and_counted() {
    let value = Value::object([(
        "a",
        Value::object([
            ("z", arr(vec![k(), arr(vec!["~test".into(), k()])])),
            ("5", 11.into()),
        ]),
    )]);
    let encoded = encode(&wrap(block(value).explicit()));
    assert_eq!(
        encoded,
        r#"["~",{"a":{"z":[["~@",650],["~~",["~test",["~@",650]]]],"5":11}},{"c":3}]"#
    );
}

#[test]
fn test_mixed_plain_and_enhanced_members() {
    let h = arr(vec!["~test".into(), arr(vec![5.into(), arr(vec!["~~".into(), 6.into()])])]);
    let ff = arr(vec![
        u(20),
        "6ą7".into(),
        Value::object([("5", 4.into()), ("0", 23.into()), ("4", "kk/\t\u{8}k".into())]),
    ]);
    let value = Value::object([
        ("d", Value::from(vec![100, 200])),
        ("h", h.enhanced()),
        ("ff", wrap(block(ff).explicit())),
    ]);
    assert_eq!(
        encode(&value),
        r#"{"d":[100,200],"h":["~",["~~",["~test",[5,["~~",["~~",6]]]]],{"c":2}],"ff":["~",[["~u",20],"6ą7",{"5":4,"0":23,"4":"kk/\t\bk"}],{"c":1}]}"#
    );
}

#[test]
fn test_host_object_without_escape_degrades() {
    let value = Value::host(Arc::new(Opaque)).enhanced();
    assert_eq!(encode(&value), r#"["~",["~?","NoEnhJSONAPIError","<Opaque>"],{"c":1}]"#);
}

#[test]
fn test_escape_outside_block_degrades() {
    assert_eq!(
        encode(&arr(vec![k()])),
        r#"[["~?","NoEnhJSONBlockError","ENHANCED JSON ENCODING NOT STARTED"]]"#
    );
    assert_eq!(
        encode(&Value::Float(f64::NAN)),
        r#"["~?","NoEnhJSONBlockError","ENHANCED JSON ENCODING NOT STARTED"]"#
    );
}

#[test]
fn test_empty_handler_is_illformed() {
    let value = Value::host(Arc::new(Tagged { handler: "", args: vec![] })).enhanced();
    // Not counted, so the surrounding block is erased.
    assert_eq!(encode(&value), r#"["~?","IllformedEscTupleError"]"#);
}

#[test]
fn test_optimization_policies() {
    let plain = || arr(vec![7.into(), "a".into(), Value::from(vec![3, 5, 6])]);

    let always = wrap(block(plain()).with_policy(OptPolicy::AlwaysCount));
    assert_eq!(encode(&always), r#"["~",[7,"a",[3,5,6]],{"c":0}]"#);

    let frame = set_frame(k(), OptPolicy::None);
    assert_eq!(
        encode(&frame),
        r#"[0,0,"*set*",["~",{"args":[["~@",650],"prop",0],"kwargs":{}},{}]]"#
    );

    let none = wrap(block(plain()).with_policy(OptPolicy::None));
    assert_eq!(encode(&none), r#"[7,"a",[3,5,6]]"#);
}

#[test]
fn test_nested_emitted_block_counts_once() {
    let inner = wrap(block(k()).explicit());
    let outer = wrap(block(arr(vec![inner, 1.into()])));
    assert_eq!(encode(&outer), r#"["~",[["~",["~@",650],{"c":1}],1],{"c":1}]"#);
}

#[test]
fn test_sentinels_and_floats() {
    let value = arr(vec![
        Sentinel::Undefined.into(),
        Value::Float(f64::INFINITY),
        Value::Float(f64::NEG_INFINITY),
        Value::Float(1.5),
        Value::Float(2.0),
    ])
    .enhanced();
    assert_eq!(
        encode(&value),
        r#"["~",[["~S","undefined"],["~S","Infinity"],["~S","-Infinity"],1.5,2.0],{"c":3}]"#
    );
}

#[test]
fn test_raw_json_is_checked() {
    assert_eq!(encode(&arr(vec![Value::Raw("{\"x\":[1]}".into())])), r#"[{"x":[1]}]"#);
    assert_eq!(
        encode(&Value::Raw("{not json".into())),
        r#"["~?","BadDirectJsonValueError"]"#
    );
}

#[test]
fn test_string_escape_table() {
    let mut out = String::new();
    write_str(&mut out, "q\"b\\s\n\r\u{1}\u{1f}\u{7f}é");
    assert_eq!(out, "\"q\\\"b\\\\s\\n\\r\\u0001\\u001F\u{7f}é\"");
}

// ============================================================================
//  DECODING
// ============================================================================

#[test]
fn test_decode_plain_json() {
    let value = decode_str(r#"{"a":[1,2.5,"x",null,true]}"#, &Handlers::new()).expect("decode");
    assert_eq!(
        value,
        Value::object([(
            "a",
            arr(vec![1.into(), 2.5.into(), "x".into(), Value::Null, true.into()])
        )])
    );
}

#[test]
fn test_plain_arrays_are_not_escapes_outside_blocks() {
    let value = decode_str(r#"["~@",1]"#, &Handlers::new()).expect("decode");
    assert_eq!(value, arr(vec!["~@".into(), 1.into()]));
}

#[test]
fn test_decode_with_handlers() {
    let handlers = Handlers::new().with("@", |args| {
        let id = args.first().and_then(Value::as_i64).unwrap_or(-1);
        Ok(Value::String(format!("remote#{id}")))
    });
    let text = r#"["~",{"r":["~@",7],"f":["~~",["~@",1]],"l":["~-",["~@",2]],"u":["~S","undefined"]},{"c":4}]"#;
    let value = decode_str(text, &handlers).expect("decode");

    assert_eq!(value.get("r"), Some(&Value::from("remote#7")));
    assert_eq!(value.get("f"), Some(&arr(vec!["~@".into(), 1.into()])));
    assert_eq!(value.get("l"), Some(&arr(vec!["~@".into(), 2.into()])));
    assert_eq!(value.get("u"), Some(&Value::Sentinel(Sentinel::Undefined)));
}

#[test]
fn test_zero_count_skips_resolution() {
    let value = decode_str(r#"["~",["~@",7],{"c":0}]"#, &Handlers::new()).expect("decode");
    assert_eq!(value, arr(vec!["~@".into(), 7.into()]));
}

#[test]
fn test_unknown_handler_is_an_error() {
    let err = decode_str(r#"["~",["~x",1],{"c":1}]"#, &Handlers::new()).expect_err("must fail");
    assert_eq!(err, Error::UnknownHandler("x".into()));
}

#[test]
fn test_invalid_json_is_an_error() {
    let err = decode(b"[1,", &Handlers::new()).expect_err("must fail");
    assert!(matches!(err, Error::Json(_)));
}

#[test]
fn test_plain_values_survive_a_trip_through_a_block() {
    let value = Value::object([
        ("n", Value::Int(-3)),
        ("f", Value::Float(0.25)),
        ("s", "tab\tquote\"".into()),
        ("tilde", arr(vec!["~x".into(), 1.into()])),
        ("undef", Sentinel::NaN.into()),
    ]);
    let text = encode(&value.clone().enhanced());
    let back = decode_str(&text, &Handlers::new()).expect("decode");
    assert_eq!(back.get("n"), value.get("n"));
    assert_eq!(back.get("f"), value.get("f"));
    assert_eq!(back.get("s"), value.get("s"));
    assert_eq!(back.get("tilde"), value.get("tilde"));
    assert!(matches!(back.get("undef"), Some(Value::Sentinel(Sentinel::NaN))));
}

#[test]
fn test_top_level_tilde_arrays_round_trip() {
    let tilde = arr(vec!["~".into(), "a".into()]);
    let text = encode(&tilde);
    assert_eq!(text, r#"["~",["~~",["~","a"]],{"c":1}]"#);
    assert_eq!(decode_str(&text, &Handlers::new()), Ok(tilde));

    let block_like = arr(vec![
        "~".into(),
        arr(vec!["~@".into(), 1.into()]),
        Value::object([("c", 1.into())]),
    ]);
    let text = encode(&block_like);
    assert_eq!(text, r#"["~",["~~",["~",["~~",["~@",1]],{"c":1}]],{"c":2}]"#);
    assert_eq!(decode_str(&text, &Handlers::new()), Ok(block_like));

    let single = arr(vec!["~".into()]);
    assert_eq!(encode(&single), r#"["~"]"#);
}

#[test]
fn test_single_tilde_item_is_not_fenced() {
    let args = arr(vec![arr(vec!["~x".into()]), Sentinel::Undefined.into()]);
    let text = encode(&Value::object([("args", args)]).enhanced());
    assert_eq!(text, r#"["~",{"args":[["~x"],["~S","undefined"]]},{"c":1}]"#);

    let back = decode_str(&text, &Handlers::new()).expect("decode");
    let first = back.get("args").and_then(Value::as_array).and_then(|items| items.first());
    assert_eq!(first, Some(&arr(vec!["~x".into()])));
}

#[test]
fn test_downcast_host() {
    let value = k();
    let tagged = value.downcast_host::<Tagged>().expect("tagged");
    assert_eq!(tagged.args, vec![650]);
    assert!(value.downcast_host::<Opaque>().is_none());
}
