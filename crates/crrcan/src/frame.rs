//! # Protocol Frames
//!
//! Every message is a JSON array `[mode, ccid, noun, payload]`.
//!
//! ## Invariants
//! - **Cheap routing**: [`FrameHeader::parse`] reads only the `[mode,ccid,` prefix,
//!   so a frame can be routed without parsing its payload.
//! - **Payload always enhanced**: Outbound payloads are wrapped in an enhanced
//!   block. The wrapper disappears when nothing needed escaping.

use enhjson::EnhancedBlock;
use enhjson::Handlers;
use enhjson::Value;
use serde_json::Value as Json;

use crate::error::Error;
use crate::error::Result;
use crate::error::ScriptFault;

/// Frame kinds. Values below 5 originate on the host, 5 and up in the browser.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Host asks the browser to run a command and reply.
    Command = 0,
    /// Browser replies to a command.
    Response = 1,
    /// Host runs a command without expecting a reply.
    Notification = 2,
    /// Browser asks the host to run a registered callback.
    Callback = 5,
    /// Host replies to a callback.
    Answer = 6,
    /// Browser notifies the host of an event.
    Event = 7,
}

impl Mode {
    pub fn from_u64(v: u64) -> Option<Self> {
        match v {
            0 => Some(Mode::Command),
            1 => Some(Mode::Response),
            2 => Some(Mode::Notification),
            5 => Some(Mode::Callback),
            6 => Some(Mode::Answer),
            7 => Some(Mode::Event),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Mode::Command => "cmd",
            Mode::Response => "res",
            Mode::Notification => "run",
            Mode::Callback => "clb",
            Mode::Answer => "ans",
            Mode::Event => "ntf",
        };
        write!(f, "{}", name)
    }
}

/// The third slot of a frame. Commands and events carry a name, replies a status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Noun {
    Name(String),
    Code(i64),
}

impl Noun {
    /// A reply noun of `0` means success.
    pub fn is_ok(&self) -> bool {
        matches!(self, Noun::Code(0))
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            Noun::Name(s) => Some(s),
            Noun::Code(_) => None,
        }
    }

    pub fn as_code(&self) -> Option<i64> {
        match self {
            Noun::Code(c) => Some(*c),
            Noun::Name(_) => None,
        }
    }
}

// ============================================================================
//  HEADER PREFIX
// ============================================================================

/// Mode and correlation id, read from the frame prefix only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub mode: Mode,
    pub ccid: u64,
}

impl FrameHeader {
    /// Matches `\s*\[\s*(\d+)\s*,\s*(\d+)\s*,` at the start of `raw`.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut cur = Prefix { bytes: raw.as_bytes(), pos: 0 };
        cur.skip_ws();
        cur.expect(b'[')?;
        cur.skip_ws();
        let mode = cur.number()?;
        cur.skip_ws();
        cur.expect(b',')?;
        cur.skip_ws();
        let ccid = cur.number()?;
        cur.skip_ws();
        cur.expect(b',')?;

        let mode = Mode::from_u64(mode).ok_or(Error::UnknownMode(mode))?;
        Ok(Self { mode, ccid })
    }
}

struct Prefix<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Prefix<'_> {
    fn skip_ws(&mut self) {
        while self.bytes.get(self.pos).is_some_and(u8::is_ascii_whitespace) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, b: u8) -> Result<()> {
        if self.bytes.get(self.pos) == Some(&b) {
            self.pos += 1;
            Ok(())
        } else {
            Err(Error::BadPrefix)
        }
    }

    fn number(&mut self) -> Result<u64> {
        let start = self.pos;
        let mut acc: u64 = 0;
        while let Some(d) = self.bytes.get(self.pos).filter(|b| b.is_ascii_digit()) {
            acc = acc
                .checked_mul(10)
                .and_then(|a| a.checked_add(u64::from(d - b'0')))
                .ok_or(Error::BadPrefix)?;
            self.pos += 1;
        }
        if self.pos == start { Err(Error::BadPrefix) } else { Ok(acc) }
    }
}

// ============================================================================
//  FULL FRAMES
// ============================================================================

/// A fully decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub mode: Mode,
    pub ccid: u64,
    pub noun: Noun,
    pub payload: Value,
}

/// The outcome a reply carries: a value, or the fault the script raised.
pub type Outcome = std::result::Result<Value, ScriptFault>;

impl Frame {
    /// Parses a whole frame, resolving payload escapes through `handlers`.
    pub fn decode(raw: &str, handlers: &Handlers) -> Result<Self> {
        let json: Json = serde_json::from_str(raw).map_err(|e| Error::MalformedFrame(e.to_string()))?;
        let Json::Array(items) = json else {
            return Err(Error::MalformedFrame("frame is not an array".into()));
        };
        if items.len() != 4 {
            return Err(Error::MalformedFrame(format!("expected 4 items, got {}", items.len())));
        }
        let mut items = items.into_iter();
        let mode = next_u64(&mut items, "mode")?;
        let mode = Mode::from_u64(mode).ok_or(Error::UnknownMode(mode))?;
        let ccid = next_u64(&mut items, "ccid")?;
        let noun = match items.next() {
            Some(Json::String(s)) => Noun::Name(s),
            Some(Json::Number(n)) => Noun::Code(
                n.as_i64().ok_or_else(|| Error::MalformedFrame("noun is not an integer".into()))?,
            ),
            _ => return Err(Error::MalformedFrame("noun must be a string or an integer".into())),
        };
        let payload = enhjson::decode_value(items.next().unwrap_or(Json::Null), handlers)?;
        Ok(Self { mode, ccid, noun, payload })
    }

    /// Interprets a reply payload `{"result": ...}` against its noun.
    pub fn into_outcome(mut self) -> Result<Outcome> {
        let result = self.payload.take("result").ok_or(Error::MissingResult)?;
        if self.noun.is_ok() {
            Ok(Ok(result))
        } else {
            Ok(Err(ScriptFault::from_value(&result)?))
        }
    }

    /// Splits a command or callback payload `{"args": [...], "kwargs": {...}}`.
    pub fn into_arguments(mut self) -> (Vec<Value>, Value) {
        let args = self.payload.take("args").and_then(Value::into_array).unwrap_or_default();
        let kwargs = self.payload.take("kwargs").unwrap_or_else(|| Value::Object(Vec::new()));
        (args, kwargs)
    }
}

fn next_u64(items: &mut impl Iterator<Item = Json>, what: &str) -> Result<u64> {
    items
        .next()
        .and_then(|v| v.as_u64())
        .ok_or_else(|| Error::MalformedFrame(format!("{} is not an unsigned integer", what)))
}

// ============================================================================
//  ENCODERS
// ============================================================================

fn frame(mode: Mode, ccid: u64, noun: Value, payload: Value) -> String {
    let payload = Value::Enhanced(Box::new(EnhancedBlock::new(payload)));
    enhjson::encode(&Value::Array(vec![mode.as_u8().into(), ccid.into(), noun, payload]))
}

/// Encodes a command or notification `[mode, ccid, name, {"args", "kwargs"}]`.
pub fn encode_command(
    mode: Mode,
    ccid: u64,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> String {
    let payload = Value::Object(vec![
        ("args".to_string(), Value::Array(args)),
        ("kwargs".to_string(), Value::Object(kwargs)),
    ]);
    frame(mode, ccid, name.into(), payload)
}

/// Encodes a reply (response or answer) `[mode, ccid, 0|1, {"result": ...}]`.
pub fn encode_reply(mode: Mode, ccid: u64, outcome: &Outcome) -> String {
    let (noun, result) = match outcome {
        Ok(value) => (0, value.clone()),
        Err(fault) => (1, fault.to_value()),
    };
    frame(mode, ccid, noun.into(), Value::Object(vec![("result".to_string(), result)]))
}

/// Encodes the answer to callback `ccid`.
pub fn encode_answer(ccid: u64, outcome: &Outcome) -> String {
    encode_reply(Mode::Answer, ccid, outcome)
}

/// Encodes a browser-side frame `[mode, ccid, noun, {"args": [...]}]`.
///
/// The host never sends these. They are built by test peers standing in
/// for a browser.
pub fn encode_inbound(mode: Mode, ccid: u64, noun: Value, args: Vec<Value>) -> String {
    frame(mode, ccid, noun, Value::Object(vec![("args".to_string(), Value::Array(args))]))
}
