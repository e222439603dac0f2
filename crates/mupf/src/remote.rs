//! # Remote Handles
//!
//! A [`RemoteHandle`] stands for a JavaScript object living in the page. The
//! page keeps the object alive in its registry under an id (`rid`) for as long
//! as the host holds a handle to it.
//!
//! ## Invariants
//! - **Identity**: A session hands out one live handle per `(rid, ctx)`.
//!   Decoding the same object twice yields clones of the same handle.
//! - **Release once**: When the last clone drops, a single `*gc*`
//!   notification is sent, unless the handle is the root (`window`, rid 0),
//!   the session is no longer healthy, or the page does not collect.
//! - **Never blocks**: Dropping a handle only queues a frame.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::Weak;

use crrcan::names;
use enhjson::Escapable;
use enhjson::Escape;
use enhjson::Value;
use tracing::trace;

use crate::error::Error;
use crate::error::Result;
use crate::features::GARBAGE_COLLECTION;
use crate::session::Session;
use crate::session::SessionInner;

/// The id of `window` in every page.
pub const ROOT_RID: u64 = 0;

/// A reference to an object in the page. Clones share identity.
#[derive(Clone)]
pub struct RemoteHandle(pub(crate) Arc<RemoteInner>);

pub(crate) struct RemoteInner {
    rid: u64,
    /// The object a function was read from; its `this` when called.
    ctx: Option<RemoteHandle>,
    /// Constructor name, sent when `friendly_obj_names` is on.
    name: Option<String>,
    session: Weak<SessionInner>,
}

impl RemoteInner {
    pub(crate) fn new(rid: u64, ctx: Option<RemoteHandle>, name: Option<String>, session: Weak<SessionInner>) -> Self {
        Self { rid, ctx, name, session }
    }
}

impl RemoteHandle {
    pub fn rid(&self) -> u64 {
        self.0.rid
    }

    pub fn context(&self) -> Option<&RemoteHandle> {
        self.0.ctx.as_ref()
    }

    pub fn type_name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    pub fn is_root(&self) -> bool {
        self.0.rid == ROOT_RID
    }

    /// Cache key inside the owning session.
    pub(crate) fn key(&self) -> (u64, Option<u64>) {
        (self.0.rid, self.0.ctx.as_ref().map(RemoteHandle::rid))
    }

    fn session(&self) -> Result<Session> {
        self.0
            .session
            .upgrade()
            .map(Session)
            .ok_or_else(|| Error::SessionClosedUnexpectedly(Some("session dropped".into())))
    }

    /// Reads property `name`.
    pub fn get(&self, name: &str) -> Result<Value> {
        self.session()?.command(names::GET).arg(self.clone()).arg(name).call()
    }

    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.session()?.command(names::SET).arg(self.clone()).arg(name).arg(value).call()?;
        Ok(())
    }

    /// Reads `obj[key]`, for array indices and computed keys.
    pub fn get_index(&self, key: impl Into<Value>) -> Result<Value> {
        self.session()?.command(names::GETI).arg(self.clone()).arg(key).call()
    }

    pub fn set_index(&self, key: impl Into<Value>, value: impl Into<Value>) -> Result<()> {
        self.session()?.command(names::SETI).arg(self.clone()).arg(key).arg(value).call()?;
        Ok(())
    }

    /// Calls this object as a function, with its context as `this`.
    pub fn call(&self, args: Vec<Value>) -> Result<Value> {
        let cntx = self.0.ctx.as_ref().map(RemoteHandle::rid);
        self.session()?
            .command(names::CALL)
            .args(args)
            .kwarg("objid", self.0.rid)
            .kwarg("cntx", cntx)
            .call()
    }

    /// `new this(...args)`.
    pub fn new_instance(&self, args: Vec<Value>) -> Result<Value> {
        self.session()?.command(names::NEW).args(args).kwarg("objid", self.0.rid).call()
    }

    /// Reads method `name` and calls it on this object.
    pub fn call_method(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let method = self.get(name)?;
        let method = RemoteHandle::from_value(&method)
            .ok_or_else(|| Error::InvalidArgument(format!("`{}` is not a function", name)))?;
        method.call(args)
    }

    /// Recovers a handle from a decoded value.
    pub fn from_value(value: &Value) -> Option<Self> {
        value.downcast_host::<RemoteHandle>().map(|h| (*h).clone())
    }
}

impl Escapable for RemoteHandle {
    fn escape(&self) -> Option<Escape> {
        Some(Escape::new("@", vec![self.0.rid.into()]))
    }

    fn describe(&self) -> String {
        match &self.0.name {
            Some(name) => format!("<remote {} #{}>", name, self.0.rid),
            None => format!("<remote #{}>", self.0.rid),
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl From<RemoteHandle> for Value {
    fn from(handle: RemoteHandle) -> Self {
        Value::host(Arc::new(handle))
    }
}

impl From<&RemoteHandle> for Value {
    fn from(handle: &RemoteHandle) -> Self {
        Value::host(Arc::new(handle.clone()))
    }
}

impl PartialEq for RemoteHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for RemoteHandle {}

impl fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteHandle")
            .field("rid", &self.0.rid)
            .field("ctx", &self.0.ctx.as_ref().map(RemoteHandle::rid))
            .field("name", &self.0.name)
            .finish()
    }
}

impl Drop for RemoteInner {
    fn drop(&mut self) {
        if self.rid == ROOT_RID {
            return;
        }
        let Some(inner) = self.session.upgrade() else { return };
        let session = Session(inner);
        let key = (self.rid, self.ctx.as_ref().map(RemoteHandle::rid));
        if session.forget_remote(key) {
            return;
        }
        let collect = session.features().is_none_or(|f| f.is_enabled(GARBAGE_COLLECTION));
        if collect && session.is_healthy() {
            trace!(session = %session.id(), rid = self.rid, "releasing remote object");
            if let Err(e) = session.command(names::GC).arg(self.rid).notify() {
                trace!(session = %session.id(), rid = self.rid, error = %e, "`*gc*` not sent");
            }
        }
    }
}
