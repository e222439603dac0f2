//! # Encoder
//!
//! Walks a [`Value`] tree with an explicit task stack and writes JSON text.
//!
//! Outside enhanced blocks the output is plain JSON. Inside a block, values
//! JSON cannot carry become escape sequences `["~<handler>",args...]`, and
//! arrays that would be mistaken for an escape are fenced with `["~~",arr]`.
//! Every escape and every emitted nested block bumps the block's counter,
//! which ends up in the block suffix `{"c":N}`.
//!
//! Encoding never fails. Values that cannot be written degrade to a `"~?"`
//! diagnostic escape so the peer sees what went wrong.

use std::borrow::Cow;
use std::fmt::Write;

use serde::de::IgnoredAny;

use crate::value::EnhancedBlock;
use crate::value::Escape;
use crate::value::Sentinel;
use crate::value::Value;

/// When an enhanced block keeps its `["~",...,opts]` wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptPolicy {
    /// Wrapper with an empty `{}` suffix, only if explicit or escaped.
    None,
    /// Wrapper with `{"c":N}`, only if explicit or escaped.
    #[default]
    NonZeroCount,
    /// Wrapper with `{"c":N}`, always.
    AlwaysCount,
}

const BLOCK_OPEN: &str = "[\"~\",";

const ILLFORMED_ESCAPE: &str = "[\"~?\",\"IllformedEscTupleError\"]";
const NO_BLOCK: &str = "[\"~?\",\"NoEnhJSONBlockError\",\"ENHANCED JSON ENCODING NOT STARTED\"]";
const BAD_RAW: &str = "[\"~?\",\"BadDirectJsonValueError\"]";

// ============================================================================
//  STRING ESCAPE TABLE
// ============================================================================

/// Per-byte escape kind. `0` passes the byte through, `u` means `\u00XX`,
/// anything else is the character following the backslash.
const ESCAPES: [u8; 256] = {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 0x20 {
        table[i] = b'u';
        i += 1;
    }
    table[0x08] = b'b';
    table[0x09] = b't';
    table[0x0A] = b'n';
    table[0x0C] = b'f';
    table[0x0D] = b'r';
    table[b'"' as usize] = b'"';
    table[b'\\' as usize] = b'\\';
    table
};

/// Appends `s` as a quoted JSON string.
pub fn write_str(out: &mut String, s: &str) {
    out.push('"');
    let bytes = s.as_bytes();
    let mut run_start = 0;
    for (i, &b) in bytes.iter().enumerate() {
        let kind = ESCAPES[b as usize];
        if kind == 0 {
            continue;
        }
        // Escaped bytes are ASCII, so `i` is always a char boundary.
        out.push_str(&s[run_start..i]);
        if kind == b'u' {
            let _ = write!(out, "\\u{:04X}", b);
        } else {
            out.push('\\');
            out.push(kind as char);
        }
        run_start = i + 1;
    }
    out.push_str(&s[run_start..]);
    out.push('"');
}

// ============================================================================
//  ENCODER
// ============================================================================

enum Task<'a> {
    /// Encode a value. `fenced` marks the array sitting directly inside a
    /// `"~~"` escape, which must not be fenced again.
    Value { value: Cow<'a, Value>, fenced: bool },
    Lit(&'static str),
    Key(Cow<'a, str>),
    EndBlock,
}

struct BlockState {
    start: usize,
    count: u64,
    explicit: bool,
    policy: OptPolicy,
}

struct Encoder<'a> {
    out: String,
    tasks: Vec<Task<'a>>,
    blocks: Vec<BlockState>,
}

/// Encodes a value tree to JSON text.
///
/// A top-level array that reads as an escape or a block is wrapped in an
/// enhanced block so that its fence survives decoding.
pub fn encode(value: &Value) -> String {
    let value = match value {
        Value::Array(items) if needs_fence(items) => Cow::Owned(value.clone().enhanced()),
        _ => Cow::Borrowed(value),
    };
    let mut enc = Encoder { out: String::new(), tasks: Vec::new(), blocks: Vec::new() };
    enc.tasks.push(Task::Value { value, fenced: false });
    enc.run();
    enc.out
}

impl<'a> Encoder<'a> {
    fn run(&mut self) {
        while let Some(task) = self.tasks.pop() {
            match task {
                Task::Value { value, fenced } => self.value(value, fenced),
                Task::Lit(s) => self.out.push_str(s),
                Task::Key(k) => {
                    write_str(&mut self.out, &k);
                    self.out.push(':');
                }
                Task::EndBlock => self.end_block(),
            }
        }
    }

    fn in_block(&self) -> bool {
        !self.blocks.is_empty()
    }

    fn bump(&mut self) {
        if let Some(block) = self.blocks.last_mut() {
            block.count += 1;
        }
    }

    fn value(&mut self, value: Cow<'a, Value>, fenced: bool) {
        match value.as_ref() {
            Value::Null => self.out.push_str("null"),
            Value::Bool(b) => self.out.push_str(if *b { "true" } else { "false" }),
            Value::Int(i) => {
                let _ = write!(self.out, "{i}");
            }
            Value::Float(f) => self.float(*f),
            Value::String(s) => write_str(&mut self.out, s),
            Value::Sentinel(s) => self.sentinel(*s),
            Value::Host(obj) => {
                let escape = obj.escape().unwrap_or_else(|| {
                    Escape::new("?", vec!["NoEnhJSONAPIError".into(), obj.describe().into()])
                });
                self.escape(escape);
            }
            Value::Raw(text) => {
                if serde_json::from_str::<IgnoredAny>(text).is_ok() {
                    self.out.push_str(text);
                } else {
                    self.out.push_str(BAD_RAW);
                }
            }
            Value::Array(items) => {
                if !fenced && self.in_block() && needs_fence(items) {
                    self.bump();
                    self.out.push_str("[\"~~\",");
                    self.tasks.push(Task::Lit("]"));
                    self.tasks.push(Task::Value { value, fenced: true });
                    return;
                }
                match value {
                    Cow::Borrowed(Value::Array(items)) => {
                        self.open_array(items.iter().map(Cow::Borrowed).collect())
                    }
                    Cow::Owned(Value::Array(items)) => {
                        self.open_array(items.into_iter().map(Cow::Owned).collect())
                    }
                    _ => {}
                }
            }
            Value::Object(_) => match value {
                Cow::Borrowed(Value::Object(entries)) => self.open_object(
                    entries.iter().map(|(k, v)| (Cow::Borrowed(k.as_str()), Cow::Borrowed(v))).collect(),
                ),
                Cow::Owned(Value::Object(entries)) => self.open_object(
                    entries.into_iter().map(|(k, v)| (Cow::Owned(k), Cow::Owned(v))).collect(),
                ),
                _ => {}
            },
            Value::Enhanced(_) => match value {
                Cow::Borrowed(Value::Enhanced(block)) => {
                    self.open_block(block);
                    self.tasks.push(Task::Value { value: Cow::Borrowed(&block.value), fenced: false });
                }
                Cow::Owned(Value::Enhanced(block)) => {
                    self.open_block(&block);
                    let EnhancedBlock { value, .. } = *block;
                    self.tasks.push(Task::Value { value: Cow::Owned(value), fenced: false });
                }
                _ => {}
            },
        }
    }

    fn float(&mut self, f: f64) {
        if let Some(sentinel) = Sentinel::from_f64(f) {
            self.sentinel(sentinel);
            return;
        }
        match serde_json::Number::from_f64(f) {
            Some(n) => {
                let _ = write!(self.out, "{n}");
            }
            None => self.out.push_str("null"),
        }
    }

    fn sentinel(&mut self, sentinel: Sentinel) {
        self.escape(Escape::new("S", vec![sentinel.as_str().into()]));
    }

    fn escape(&mut self, escape: Escape) {
        if escape.handler.is_empty() {
            self.out.push_str(ILLFORMED_ESCAPE);
            return;
        }
        if !self.in_block() {
            self.out.push_str(NO_BLOCK);
            return;
        }
        self.bump();
        self.out.push('[');
        write_str(&mut self.out, &format!("~{}", escape.handler));
        self.tasks.push(Task::Lit("]"));
        for arg in escape.args.into_iter().rev() {
            self.tasks.push(Task::Value { value: Cow::Owned(arg), fenced: false });
            self.tasks.push(Task::Lit(","));
        }
    }

    fn open_array(&mut self, items: Vec<Cow<'a, Value>>) {
        self.out.push('[');
        self.tasks.push(Task::Lit("]"));
        for (i, item) in items.into_iter().enumerate().rev() {
            self.tasks.push(Task::Value { value: item, fenced: false });
            if i > 0 {
                self.tasks.push(Task::Lit(","));
            }
        }
    }

    fn open_object(&mut self, entries: Vec<(Cow<'a, str>, Cow<'a, Value>)>) {
        self.out.push('{');
        self.tasks.push(Task::Lit("}"));
        for (i, (key, value)) in entries.into_iter().enumerate().rev() {
            self.tasks.push(Task::Value { value, fenced: false });
            self.tasks.push(Task::Key(key));
            if i > 0 {
                self.tasks.push(Task::Lit(","));
            }
        }
    }

    fn open_block(&mut self, block: &EnhancedBlock) {
        self.blocks.push(BlockState {
            start: self.out.len(),
            count: 0,
            explicit: block.explicit,
            policy: block.policy,
        });
        self.out.push_str(BLOCK_OPEN);
        self.tasks.push(Task::EndBlock);
    }

    fn end_block(&mut self) {
        let Some(block) = self.blocks.pop() else { return };
        let emit = match block.policy {
            OptPolicy::AlwaysCount => true,
            OptPolicy::None | OptPolicy::NonZeroCount => block.explicit || block.count > 0,
        };
        if !emit {
            self.out.replace_range(block.start..block.start + BLOCK_OPEN.len(), "");
            return;
        }
        match block.policy {
            OptPolicy::None => self.out.push_str(",{}]"),
            _ => {
                let _ = write!(self.out, ",{{\"c\":{}}}]", block.count);
            }
        }
        self.bump();
    }
}

/// An array needs the `"~~"` fence when it would otherwise read as an escape.
fn needs_fence(items: &[Value]) -> bool {
    items.len() > 1 && items[0].as_str().is_some_and(|s| s.starts_with('~'))
}
