// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Objects passed by reference.
//!
//! A local object implementing `Referenceable` is wrapped in a
//! `LocalReference` and put into a graph; the broker sends it as a
//! `my-reference` sequence and the peer gets a `RemoteReference`.  All
//! clones of a `RemoteReference` share one handle.  When the last clone is
//! dropped, the number of times the peer sent the reference is queued for a
//! `decref` message, which the broker sends on its next turn.

use std::fmt;
use std::rc::{Rc, Weak};
use std::cell::{Cell, RefCell};

use crate::broker::Arguments;
use crate::error::Result;
use crate::schema::RemoteInterface;
use crate::value::Graph;

/// An object whose methods can be invoked by the peer.
pub trait Referenceable {
    /// The interface to announce (and to check inbound calls against).
    fn interface(&self) -> Option<&RemoteInterface> {
        None
    }

    /// Run a method.  Errors are sent back to the caller as copied failures.
    fn remote_call(&self, method: &str, args: Arguments) -> Result<Graph>;
}

/// A local `Referenceable`, ready to be sent by reference.
#[derive(Clone)]
pub struct LocalReference {
    object: Rc<dyn Referenceable>,
}

impl LocalReference {
    pub fn new<R: Referenceable + 'static>(object: R) -> LocalReference {
        LocalReference { object: Rc::new(object) }
    }

    pub fn from_rc(object: Rc<dyn Referenceable>) -> LocalReference {
        LocalReference { object }
    }

    pub fn object(&self) -> &Rc<dyn Referenceable> {
        &self.object
    }

    pub fn interface_name(&self) -> Option<String> {
        self.object.interface().map(|i| i.name.clone())
    }

    /// Process-unique identity of the wrapped object.
    pub(crate) fn puid(&self) -> usize {
        Rc::as_ptr(&self.object) as *const () as usize
    }
}

impl PartialEq for LocalReference {
    fn eq(&self, other: &LocalReference) -> bool {
        self.puid() == other.puid()
    }
}

impl fmt::Debug for LocalReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.interface_name() {
            Some(name) => write!(f, "<LocalReference 0x{:x} {}>", self.puid(), name),
            None => write!(f, "<LocalReference 0x{:x}>", self.puid()),
        }
    }
}

/// State shared between a broker and the remote references it created.
#[derive(Default)]
pub(crate) struct Shared {
    /// `(clid, count)` of references whose last handle was dropped.
    pub released: RefCell<Vec<(i64, u64)>>,
    pub disconnected: Cell<bool>,
    watchers: RefCell<Vec<(u64, Box<dyn FnOnce()>)>>,
    next_watcher: Cell<u64>,
}

impl Shared {
    pub fn add_watcher(&self, callback: Box<dyn FnOnce()>) -> u64 {
        if self.disconnected.get() {
            callback();
            return 0;
        }
        let id = self.next_watcher.get() + 1;
        self.next_watcher.set(id);
        self.watchers.borrow_mut().push((id, callback));
        id
    }

    pub fn remove_watcher(&self, id: u64) -> bool {
        let mut watchers = self.watchers.borrow_mut();
        let before = watchers.len();
        watchers.retain(|&(i, _)| i != id);
        watchers.len() != before
    }

    /// Mark as disconnected and run the watchers.  Only the first call does
    /// anything.
    pub fn disconnect(&self) {
        if self.disconnected.replace(true) {
            return;
        }
        self.released.borrow_mut().clear();
        let watchers = std::mem::take(&mut *self.watchers.borrow_mut());
        for (_, callback) in watchers {
            callback();
        }
    }
}

struct RemoteInner {
    clid: i64,
    interface_name: Option<String>,
    url: Option<String>,
    /// How often the peer sent us this reference.
    received: Cell<u64>,
    /// The broker's own reference (clid 0) is not counted.
    counted: bool,
    shared: Rc<Shared>,
}

impl Drop for RemoteInner {
    fn drop(&mut self) {
        if self.counted && !self.shared.disconnected.get() {
            self.shared.released.borrow_mut().push((self.clid, self.received.get()));
        }
    }
}

/// Handle for an object that lives on the other side of a broker.
#[derive(Clone)]
pub struct RemoteReference {
    inner: Rc<RemoteInner>,
}

impl RemoteReference {
    pub(crate) fn new(clid: i64, interface_name: Option<String>, url: Option<String>,
                      shared: Rc<Shared>, counted: bool) -> RemoteReference {
        RemoteReference {
            inner: Rc::new(RemoteInner {
                clid, interface_name, url, counted, shared,
                received: Cell::new(if counted { 1 } else { 0 }),
            })
        }
    }

    pub fn clid(&self) -> i64 {
        self.inner.clid
    }

    pub fn interface_name(&self) -> Option<String> {
        self.inner.interface_name.clone()
    }

    pub fn url(&self) -> Option<&str> {
        self.inner.url.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.shared.disconnected.get()
    }

    /// Run `callback` once when the owning broker loses its connection.
    /// If it is already gone, the callback runs immediately.  Returns an id
    /// for `dont_notify_on_disconnect`.
    pub fn notify_on_disconnect<F: FnOnce() + 'static>(&self, callback: F) -> u64 {
        self.inner.shared.add_watcher(Box::new(callback))
    }

    pub fn dont_notify_on_disconnect(&self, id: u64) -> bool {
        self.inner.shared.remove_watcher(id)
    }

    pub(crate) fn belongs_to(&self, shared: &Rc<Shared>) -> bool {
        Rc::ptr_eq(&self.inner.shared, shared)
    }

    pub(crate) fn note_received(&self) {
        self.inner.received.set(self.inner.received.get() + 1);
    }

    pub(crate) fn downgrade(&self) -> WeakRemote {
        WeakRemote(Rc::downgrade(&self.inner))
    }
}

impl PartialEq for RemoteReference {
    fn eq(&self, other: &RemoteReference) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for RemoteReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<RemoteReference clid={}", self.inner.clid)?;
        if let Some(ref url) = self.inner.url {
            write!(f, " [{}]", url)?;
        }
        f.write_str(">")
    }
}

/// The broker's view of a `RemoteReference` it handed out.
#[derive(Clone)]
pub(crate) struct WeakRemote(Weak<RemoteInner>);

impl WeakRemote {
    pub fn upgrade(&self) -> Option<RemoteReference> {
        self.0.upgrade().map(|inner| RemoteReference { inner })
    }
}
