//! # Decoder
//!
//! Parses JSON text and resolves escape sequences into [`Value`]s.
//!
//! Only a top-level `["~",body,opts]` switches escape resolution on. A block
//! whose options say `{"c":0}` carries no escapes and is converted as plain
//! JSON. Everything else is plain JSON and is taken literally.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value as Json;

use crate::Error;
use crate::Result;
use crate::value::Sentinel;
use crate::value::Value;

/// Builds a value from the arguments of one escape sequence.
pub type Handler = Box<dyn Fn(Vec<Value>) -> Result<Value> + Send + Sync>;

/// Escape handlers keyed by name, without the leading `~`.
#[derive(Default)]
pub struct Handlers {
    map: HashMap<String, Handler>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`, replacing any previous one.
    pub fn insert<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        self.map.insert(name.into(), Box::new(handler));
    }

    pub fn with<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        self.insert(name, handler);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let handler = self.map.get(name).ok_or_else(|| Error::UnknownHandler(name.to_string()))?;
        handler(args)
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.map.keys()).finish()
    }
}

/// Decodes JSON bytes, resolving escapes through `handlers`.
pub fn decode(bytes: &[u8], handlers: &Handlers) -> Result<Value> {
    let json: Json = serde_json::from_slice(bytes).map_err(|e| Error::Json(e.to_string()))?;
    decode_value(json, handlers)
}

pub fn decode_str(text: &str, handlers: &Handlers) -> Result<Value> {
    decode(text.as_bytes(), handlers)
}

/// Decodes an already parsed JSON tree.
pub fn decode_value(json: Json, handlers: &Handlers) -> Result<Value> {
    match json {
        Json::Array(items) if is_block(&items) => {
            let escape_free = items
                .get(2)
                .and_then(|opts| opts.get("c"))
                .and_then(Json::as_u64)
                == Some(0);
            let body = items.into_iter().nth(1).unwrap_or(Json::Null);
            if escape_free {
                Ok(from_json(body))
            } else {
                resolve(body, handlers)
            }
        }
        other => Ok(from_json(other)),
    }
}

/// Converts plain JSON without looking at escapes.
pub fn from_json(json: Json) -> Value {
    match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Json::String(s) => Value::String(s),
        Json::Array(items) => Value::Array(items.into_iter().map(from_json).collect()),
        Json::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, from_json(v))).collect()),
    }
}

fn is_block(items: &[Json]) -> bool {
    items.len() >= 2 && items[0].as_str() == Some("~")
}

fn escape_name(items: &[Json]) -> Option<&str> {
    if items.len() < 2 {
        return None;
    }
    items[0].as_str().filter(|s| s.starts_with('~'))
}

fn resolve(json: Json, handlers: &Handlers) -> Result<Value> {
    match json {
        Json::Array(items) => match escape_name(&items).map(str::to_owned) {
            Some(name) => resolve_escape(&name, items, handlers),
            None => Ok(Value::Array(resolve_all(items, handlers)?)),
        },
        Json::Object(map) => {
            let mut entries = Vec::with_capacity(map.len());
            for (k, v) in map {
                entries.push((k, resolve(v, handlers)?));
            }
            Ok(Value::Object(entries))
        }
        scalar => Ok(from_json(scalar)),
    }
}

fn resolve_all(items: Vec<Json>, handlers: &Handlers) -> Result<Vec<Value>> {
    items.into_iter().map(|item| resolve(item, handlers)).collect()
}

fn resolve_escape(name: &str, items: Vec<Json>, handlers: &Handlers) -> Result<Value> {
    let mut args = items.into_iter().skip(1);
    match name {
        "~-" => Ok(args.next().map(from_json).unwrap_or(Value::Null)),
        "~~" => match args.next() {
            Some(Json::Array(inner)) => Ok(Value::Array(resolve_all(inner, handlers)?)),
            _ => Err(Error::MalformedEscape("\"~~\" expects an array".into())),
        },
        "~S" => {
            let which = args.next();
            which
                .as_ref()
                .and_then(Json::as_str)
                .and_then(Sentinel::from_name)
                .map(Value::Sentinel)
                .ok_or_else(|| Error::MalformedEscape(format!("unknown sentinel {which:?}")))
        }
        "~" => resolve(args.next().unwrap_or(Json::Null), handlers),
        _ => {
            let args = resolve_all(args.collect(), handlers)?;
            handlers.call(&name[1..], args)
        }
    }
}
