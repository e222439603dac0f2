//! # Value Model
//!
//! The host-side value tree handed to the encoder and produced by the decoder.
//! It is plain JSON plus the few things JSON has no syntax for: sentinels,
//! host objects that know their own escape, enhanced-block markers and raw
//! pre-encoded JSON text.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::encoder::OptPolicy;

/// JS values that have no JSON literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sentinel {
    Undefined,
    NaN,
    Infinity,
    NegInfinity,
}

impl Sentinel {
    /// The wire name carried by the `"~S"` escape.
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentinel::Undefined => "undefined",
            Sentinel::NaN => "NaN",
            Sentinel::Infinity => "Infinity",
            Sentinel::NegInfinity => "-Infinity",
        }
    }

    /// Returns the sentinel for a wire name, or `None` if unknown.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "undefined" => Some(Sentinel::Undefined),
            "NaN" => Some(Sentinel::NaN),
            "Infinity" => Some(Sentinel::Infinity),
            "-Infinity" => Some(Sentinel::NegInfinity),
            _ => None,
        }
    }

    /// Maps a non-finite float onto its sentinel.
    pub fn from_f64(v: f64) -> Option<Self> {
        if v.is_nan() {
            Some(Sentinel::NaN)
        } else if v == f64::INFINITY {
            Some(Sentinel::Infinity)
        } else if v == f64::NEG_INFINITY {
            Some(Sentinel::NegInfinity)
        } else {
            None
        }
    }
}

/// An escape sequence: `["~<handler>", args...]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Escape {
    pub handler: String,
    pub args: Vec<Value>,
}

impl Escape {
    pub fn new(handler: impl Into<String>, args: Vec<Value>) -> Self {
        Self { handler: handler.into(), args }
    }
}

/// A host object that knows how to put itself on the wire.
///
/// Implementors are carried inside [`Value::Host`]. The encoder asks for the
/// escape once per occurrence; a `None` answer degrades to a diagnostic
/// escape carrying [`Escapable::describe`].
pub trait Escapable: Send + Sync + 'static {
    /// Returns the escape handler (without the leading `~`) and its arguments.
    fn escape(&self) -> Option<Escape>;

    /// Human readable form used in diagnostics.
    fn describe(&self) -> String;

    /// Upcast used by [`Value::downcast_host`].
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Wraps a subtree; the encoder switches into enhanced mode inside it.
#[derive(Debug, Clone, PartialEq)]
pub struct EnhancedBlock {
    pub value: Value,
    /// Emit the wrapper even when no escapes occurred.
    pub explicit: bool,
    pub policy: OptPolicy,
}

impl EnhancedBlock {
    pub fn new(value: Value) -> Self {
        Self { value, explicit: false, policy: OptPolicy::NonZeroCount }
    }

    pub fn explicit(mut self) -> Self {
        self.explicit = true;
        self
    }

    pub fn with_policy(mut self, policy: OptPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// A node of the value tree.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    /// Insertion-ordered members.
    Object(Vec<(String, Value)>),
    Sentinel(Sentinel),
    Host(Arc<dyn Escapable>),
    Enhanced(Box<EnhancedBlock>),
    /// Pre-encoded JSON text, copied to the output verbatim.
    Raw(String),
}

impl Value {
    /// Builds an object from `(key, value)` pairs.
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Wraps this value in a default enhanced block.
    pub fn enhanced(self) -> Self {
        Value::Enhanced(Box::new(EnhancedBlock::new(self)))
    }

    pub fn host<T: Escapable>(obj: Arc<T>) -> Self {
        Value::Host(obj)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_i64().and_then(|i| u64::try_from(i).ok())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Object(entries) => Some(entries),
            _ => None,
        }
    }

    /// Looks up an object member by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object()?.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Removes and returns an object member by key.
    pub fn take(&mut self, key: &str) -> Option<Value> {
        let Value::Object(entries) = self else { return None };
        let idx = entries.iter().position(|(k, _)| k == key)?;
        Some(entries.remove(idx).1)
    }

    /// Returns the host object if it is a `T`.
    pub fn downcast_host<T: Escapable>(&self) -> Option<Arc<T>> {
        match self {
            Value::Host(obj) => obj.clone().into_any().downcast::<T>().ok(),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Sentinel(a), Value::Sentinel(b)) => a == b,
            (Value::Host(a), Value::Host(b)) => Arc::ptr_eq(a, b),
            (Value::Enhanced(a), Value::Enhanced(b)) => a == b,
            (Value::Raw(a), Value::Raw(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(i) => write!(f, "Int({i})"),
            Value::Float(v) => write!(f, "Float({v})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Array(items) => f.debug_list().entries(items).finish(),
            Value::Object(entries) => f
                .debug_map()
                .entries(entries.iter().map(|(k, v)| (k, v)))
                .finish(),
            Value::Sentinel(s) => write!(f, "Sentinel({})", s.as_str()),
            Value::Host(obj) => write!(f, "Host({})", obj.describe()),
            Value::Enhanced(block) => f.debug_tuple("Enhanced").field(&block.value).finish(),
            Value::Raw(text) => write!(f, "Raw({text})"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self { Value::Bool(v) }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self { Value::Int(v.into()) }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self { Value::Int(v.into()) }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self { Value::Int(v) }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self { Value::Int(v.into()) }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        match i64::try_from(v) {
            Ok(i) => Value::Int(i),
            Err(_) => Value::Float(v as f64),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self { Value::Float(v) }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self { Value::String(v.to_string()) }
}

impl From<String> for Value {
    fn from(v: String) -> Self { Value::String(v) }
}

impl From<Sentinel> for Value {
    fn from(v: Sentinel) -> Self { Value::Sentinel(v) }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self { Value::Array(v.into_iter().map(Into::into).collect()) }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self { v.map_or(Value::Null, Into::into) }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        crate::decoder::from_json(v)
    }
}
