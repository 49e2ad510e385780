// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! # Perspective Broker
//!
//! A `Broker` is one end of a PB connection.  It does no I/O itself: bytes
//! from the transport go into `data_received`, bytes for the transport come
//! out of `take_output`, and the transport reports the end of the connection
//! with `connection_lost`.
//!
//! Remote method calls return a `PendingCall`, which is resolved exactly
//! once: by the answer, by a copied failure, by disconnection or by
//! cancellation.  Inbound calls are dispatched to the `Referenceable`
//! objects we exported.  Object 0 is the broker itself; it answers
//! `getReferenceByName` and `decref`.

use std::fmt;
use std::mem;
use std::rc::Rc;
use std::cell::RefCell;
use std::pin::Pin;
use std::sync::Arc;
use std::future::Future;
use std::task::{Context, Poll, Waker};
use std::collections::{BTreeMap, BTreeSet};
use log::{debug, error, info, warn};

use crate::banana::{Receiver, Sender};
use crate::consts::*;
use crate::error::{Error, ErrorCode, Result, Violation};
use crate::failure::CopiedFailure;
use crate::referenceable::{LocalReference, RemoteReference, Shared, WeakRemote};
use crate::schema::{Constraint, MethodSchema, RemoteInterface};
use crate::slicer::{FrameId, JellyOptions, Jellier, Piece, SliceEnvironment};
use crate::taster::{SecurityOptions, Taster};
use crate::tokens::Token;
use crate::unslicer::{ClassRegistry, Delivery, Environment, Mode, UnjellyOptions};
use crate::value::{Graph, Heap, Object, Value};

const STALE_BROKER: &str = "Calling Stale Broker";
const DECREF: &str = "decref";
const GET_REFERENCE_BY_NAME: &str = "getReferenceByName";

/// Named arguments of a method call, sharing one heap.
#[derive(Clone, Debug, Default)]
pub struct Arguments {
    pub heap: Heap,
    pub named: BTreeMap<String, Value>,
}

impl Arguments {
    pub fn new() -> Arguments {
        Arguments::default()
    }

    /// Add an argument, copying `graph` into the argument heap.
    pub fn arg<S: Into<String>>(mut self, name: S, graph: Graph) -> Self {
        let value = self.heap.adopt(graph);
        self.named.insert(name.into(), value);
        self
    }

    /// Add a scalar argument (or one already living in `self.heap`).
    pub fn value<S: Into<String>>(mut self, name: S, value: Value) -> Self {
        self.named.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.named.get(name)
    }

    pub fn len(&self) -> usize {
        self.named.len()
    }

    pub fn is_empty(&self) -> bool {
        self.named.is_empty()
    }
}

/// Options for a broker.
#[derive(Clone)]
pub struct BrokerOptions {
    taster: Arc<dyn Taster>,
    unsafe_tracebacks: bool,
    require_schema: bool,
    vocabulary: Option<BTreeMap<u64, Vec<u8>>>,
    interfaces: BTreeMap<String, RemoteInterface>,
    classes: ClassRegistry,
}

impl BrokerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn taster<T: Taster + 'static>(mut self, taster: T) -> Self {
        self.taster = Arc::new(taster);
        self
    }

    pub fn shared_taster(mut self, taster: Arc<dyn Taster>) -> Self {
        self.taster = taster;
        self
    }

    /// Send real traceback texts in copied failures.
    pub fn unsafe_tracebacks(mut self, enable: bool) -> Self {
        self.unsafe_tracebacks = enable;
        self
    }

    /// Refuse inbound calls to objects without a remote interface.
    pub fn require_schema(mut self, enable: bool) -> Self {
        self.require_schema = enable;
        self
    }

    /// Outgoing vocabulary announced when the broker starts.
    pub fn vocabulary(mut self, table: BTreeMap<u64, Vec<u8>>) -> Self {
        self.vocabulary = Some(table);
        self
    }

    /// Make a remote interface known, so that calls to references claiming
    /// it are checked before they are sent.
    pub fn interface(mut self, interface: RemoteInterface) -> Self {
        self.interfaces.insert(interface.name.clone(), interface);
        self
    }

    /// Classes that may arrive as copies.
    pub fn classes(mut self, classes: ClassRegistry) -> Self {
        self.classes = classes;
        self
    }
}

impl Default for BrokerOptions {
    fn default() -> Self {
        BrokerOptions {
            taster: Arc::new(SecurityOptions::default()),
            unsafe_tracebacks: false,
            require_schema: false,
            vocabulary: None,
            interfaces: BTreeMap::new(),
            classes: ClassRegistry::default(),
        }
    }
}

impl fmt::Debug for BrokerOptions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BrokerOptions")
         .field("taster", &self.taster)
         .field("unsafe_tracebacks", &self.unsafe_tracebacks)
         .field("require_schema", &self.require_schema)
         .field("vocabulary", &self.vocabulary.as_ref().map(|v| v.len()))
         .field("interfaces", &self.interfaces.keys().collect::<Vec<_>>())
         .field("classes", &self.classes)
         .finish()
    }
}

type Callback = Box<dyn FnOnce(&Result<Graph>)>;

struct CallInner {
    req_id: Option<u64>,
    resolved: bool,
    result: Option<Result<Graph>>,
    waker: Option<Waker>,
    callbacks: Vec<Callback>,
}

/// The local end of an outstanding remote call.
///
/// Clones share the same state.  The result can be awaited, fetched with
/// `take_result` or observed with `on_resolved`.
#[derive(Clone)]
pub struct PendingCall {
    inner: Rc<RefCell<CallInner>>,
}

impl PendingCall {
    fn new(req_id: Option<u64>) -> PendingCall {
        PendingCall {
            inner: Rc::new(RefCell::new(CallInner {
                req_id,
                resolved: false,
                result: None,
                waker: None,
                callbacks: Vec::new(),
            }))
        }
    }

    /// A call that failed before it was sent.
    fn failed(error: Error) -> PendingCall {
        let call = PendingCall::new(None);
        call.resolve(Err(error));
        call
    }

    /// The request id, if the call was sent.
    pub fn req_id(&self) -> Option<u64> {
        self.inner.borrow().req_id
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.borrow().resolved
    }

    /// Fetch the result.  Returns `None` while the call is pending, and
    /// after the result was taken.
    pub fn take_result(&self) -> Option<Result<Graph>> {
        self.inner.borrow_mut().result.take()
    }

    /// Run `callback` when the call is resolved.  If it already is and the
    /// result was not taken yet, the callback runs immediately.
    pub fn on_resolved<F: FnOnce(&Result<Graph>) + 'static>(&self, callback: F) {
        let mut inner = self.inner.borrow_mut();
        if !inner.resolved {
            inner.callbacks.push(Box::new(callback));
            return;
        }
        if let Some(result) = inner.result.take() {
            drop(inner);
            callback(&result);
            let mut inner = self.inner.borrow_mut();
            if inner.result.is_none() {
                inner.result = Some(result);
            }
        }
    }

    /// Give up waiting.  The call resolves with `Error::Cancelled`, and a
    /// late answer is dropped.  Does nothing if the call is already
    /// resolved.
    pub fn cancel(&self) {
        if !self.is_resolved() {
            debug!("cancelling request {:?}", self.req_id());
            self.resolve(Err(Error::Cancelled));
        }
    }

    /// Resolve the call.  Returns false (and logs) if it was resolved
    /// before.
    fn resolve(&self, result: Result<Graph>) -> bool {
        let callbacks = {
            let mut inner = self.inner.borrow_mut();
            if inner.resolved {
                error!("multiple failures: request {:?} already resolved, dropping {}",
                       inner.req_id, match result {
                           Ok(ref graph) => graph.to_string(),
                           Err(ref e) => e.to_string(),
                       });
                return false;
            }
            inner.resolved = true;
            mem::take(&mut inner.callbacks)
        };
        for callback in callbacks {
            callback(&result);
        }
        let waker = {
            let mut inner = self.inner.borrow_mut();
            inner.result = Some(result);
            inner.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }
}

impl Future for PendingCall {
    type Output = Result<Graph>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<Graph>> {
        let mut inner = self.inner.borrow_mut();
        if let Some(result) = inner.result.take() {
            return Poll::Ready(result);
        }
        if inner.resolved {
            return Poll::Ready(Err(Error::Banana(ErrorCode::Protocol(
                "result was already taken".into()))));
        }
        inner.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.borrow();
        write!(f, "<PendingCall req={:?} resolved={}>", inner.req_id, inner.resolved)
    }
}

struct Outstanding {
    call: PendingCall,
    response: Option<Constraint>,
}

/// One of our objects, as known to the peer.
struct Exported {
    local: LocalReference,
    /// How often we sent it and the peer has not released it yet.
    count: u64,
}

/// One of the peer's objects.
struct Imported {
    remote: WeakRemote,
    interface_name: Option<String>,
    url: Option<String>,
}

/// Connection state seen by the codec while it runs.
struct State {
    options: BrokerOptions,
    shared: Rc<Shared>,
    next_req_id: u64,
    outstanding: BTreeMap<u64, Outstanding>,
    /// Cancelled requests whose answer has not arrived yet.
    cancelled: BTreeSet<u64>,
    next_clid: i64,
    exported: BTreeMap<i64, Exported>,
    /// Export counts taken for the message being sliced.
    in_flight: Vec<i64>,
    clids: BTreeMap<usize, i64>,
    imported: BTreeMap<i64, Imported>,
    published: BTreeMap<String, LocalReference>,
}

fn unknown_object(clid: i64) -> Violation {
    Violation::new(format!("unknown object id {}", clid))
}

fn broker_schema(method: &str) -> Option<MethodSchema> {
    match method {
        DECREF => Some(MethodSchema::new(DECREF)
                       .arg("clid", Constraint::int())
                       .arg("count", Constraint::int())),
        GET_REFERENCE_BY_NAME => Some(MethodSchema::new(GET_REFERENCE_BY_NAME)
                                      .arg("name", Constraint::string())),
        _ => None,
    }
}

impl State {
    fn decref(&mut self, clid: i64, count: u64) {
        let gone = match self.exported.get_mut(&clid) {
            Some(entry) => {
                entry.count = entry.count.saturating_sub(count);
                entry.count == 0
            }
            None => {
                debug!("decref of unknown object {}", clid);
                false
            }
        };
        if gone {
            debug!("releasing object {}", clid);
            if let Some(entry) = self.exported.remove(&clid) {
                self.clids.remove(&entry.local.puid());
            }
        }
    }

    /// Give back the export counts of a message that was not sent.
    fn rollback_exports(&mut self) {
        for clid in mem::take(&mut self.in_flight) {
            self.decref(clid, 1);
        }
    }

    /// Forget calls that were resolved locally.  A late answer to them is
    /// still expected and gets dropped.
    fn prune_outstanding(&mut self) {
        let resolved: Vec<u64> = self.outstanding.iter()
            .filter(|&(_, o)| o.call.is_resolved())
            .map(|(&req_id, _)| req_id)
            .collect();
        for req_id in resolved {
            self.outstanding.remove(&req_id);
            self.cancelled.insert(req_id);
        }
    }
}

impl Environment for State {
    fn response_constraint(&mut self, req_id: u64) -> Result<Option<Constraint>> {
        match self.outstanding.get(&req_id) {
            Some(outstanding) => Ok(outstanding.response.clone()),
            None if self.cancelled.contains(&req_id) => Ok(None),
            None => Err(Error::Banana(ErrorCode::UnknownRequest(req_id))),
        }
    }

    fn method_schema(&mut self, clid: i64, method: &str)
                     -> std::result::Result<Option<MethodSchema>, Violation> {
        if clid == 0 {
            return broker_schema(method).map(Some).ok_or_else(
                || Violation::new(format!("method '{}' not defined in the broker", method)));
        }
        let entry = self.exported.get(&clid).ok_or_else(|| unknown_object(clid))?;
        match entry.local.object().interface() {
            Some(interface) => interface.get(method).cloned().map(Some).ok_or_else(
                || Violation::new(format!("method '{}' not defined in {}", method, interface.name))),
            None if self.options.require_schema =>
                Err(Violation::new(format!("object {} has no schema", clid))),
            None => Ok(None),
        }
    }

    fn local_reference(&mut self, clid: i64) -> std::result::Result<LocalReference, Violation> {
        self.exported.get(&clid).map(|e| e.local.clone()).ok_or_else(|| unknown_object(clid))
    }

    fn remote_reference(&mut self, clid: i64, interface_name: Option<String>, url: Option<String>)
                        -> std::result::Result<RemoteReference, Violation> {
        if clid == 0 {
            return Err(Violation::new("the broker can not be sent as my-reference"));
        }
        if let Some(entry) = self.imported.get_mut(&clid) {
            if let Some(remote) = entry.remote.upgrade() {
                remote.note_received();
                return Ok(remote);
            }
            let remote = RemoteReference::new(
                clid, interface_name.or_else(|| entry.interface_name.clone()),
                url.or_else(|| entry.url.clone()), self.shared.clone(), true);
            entry.remote = remote.downgrade();
            return Ok(remote);
        }
        let remote = RemoteReference::new(clid, interface_name.clone(), url.clone(),
                                          self.shared.clone(), true);
        self.imported.insert(clid, Imported { remote: remote.downgrade(), interface_name, url });
        Ok(remote)
    }
}

impl SliceEnvironment for State {
    fn my_reference(&mut self, local: &LocalReference) -> (i64, Option<(String, Option<String>)>) {
        if let Some(&clid) = self.clids.get(&local.puid()) {
            if let Some(entry) = self.exported.get_mut(&clid) {
                entry.count += 1;
                self.in_flight.push(clid);
                return (clid, None);
            }
        }
        let clid = self.next_clid;
        self.next_clid += 1;
        self.clids.insert(local.puid(), clid);
        self.exported.insert(clid, Exported { local: local.clone(), count: 1 });
        self.in_flight.push(clid);
        (clid, local.interface_name().map(|name| (name, None)))
    }

    fn your_reference(&mut self, remote: &RemoteReference) -> Result<i64> {
        if !remote.belongs_to(&self.shared) {
            return Err(Error::Violation(Violation::new(
                "cannot send a reference to another broker's object")));
        }
        Ok(remote.clid())
    }
}

/// One end of a PB connection.
pub struct Broker {
    receiver: Receiver,
    sender: Sender,
    jelly_options: JellyOptions,
    state: State,
}

impl Broker {
    pub fn new(options: BrokerOptions) -> Broker {
        let unjelly_options = UnjellyOptions::new().shared_taster(options.taster.clone())
                                                   .classes(options.classes.clone());
        let jelly_options = JellyOptions::new().shared_taster(options.taster.clone());
        let vocabulary = options.vocabulary.clone();
        let mut broker = Broker {
            receiver: Receiver::new(Mode::Broker, unjelly_options),
            sender: Sender::new(),
            jelly_options,
            state: State {
                options,
                shared: Rc::new(Shared::default()),
                next_req_id: 0,
                outstanding: BTreeMap::new(),
                cancelled: BTreeSet::new(),
                next_clid: 1,
                exported: BTreeMap::new(),
                in_flight: Vec::new(),
                clids: BTreeMap::new(),
                imported: BTreeMap::new(),
                published: BTreeMap::new(),
            },
        };
        if let Some(table) = vocabulary {
            if let Err(e) = broker.sender.set_vocabulary(&table) {
                warn!("initial vocabulary not sent: {}", e);
            }
        }
        broker
    }

    pub fn is_connected(&self) -> bool {
        !self.state.shared.disconnected.get()
    }

    /// Replace the outgoing vocabulary.
    pub fn set_outgoing_vocabulary(&mut self, table: &BTreeMap<u64, Vec<u8>>) -> Result<()> {
        self.sender.set_vocabulary(table)
    }

    /// Make `object` available to `getReferenceByName`.
    pub fn publish<S: Into<String>>(&mut self, name: S, object: LocalReference) {
        self.state.published.insert(name.into(), object);
    }

    /// The peer's broker object (clid 0).
    pub fn remote_broker(&self) -> RemoteReference {
        RemoteReference::new(0, None, None, self.state.shared.clone(), false)
    }

    /// Ask the peer for an object it published.  The call resolves to a
    /// graph whose root is the remote reference.
    pub fn get_reference_by_name(&mut self, name: &str) -> PendingCall {
        let broker = self.remote_broker();
        let args = Arguments::new().value("name", Value::Bytes(name.as_bytes().to_vec()));
        self.call_remote(&broker, GET_REFERENCE_BY_NAME, args)
    }

    /// Number of our objects the peer currently holds references to.
    pub fn exported_count(&self) -> usize {
        self.state.exported.len()
    }

    /// Number of calls waiting for an answer.
    pub fn outstanding_count(&self) -> usize {
        self.state.outstanding.values().filter(|o| !o.call.is_resolved()).count()
    }

    /// Run `callback` once when the connection is lost.
    pub fn notify_on_disconnect<F: FnOnce() + 'static>(&self, callback: F) -> u64 {
        self.state.shared.add_watcher(Box::new(callback))
    }

    pub fn dont_notify_on_disconnect(&self, id: u64) -> bool {
        self.state.shared.remove_watcher(id)
    }

    /// Invoke `method` on the peer's object `target`.
    ///
    /// If the target claims an interface we know, the method and arguments
    /// are checked here and the call fails locally on a mismatch.
    pub fn call_remote(&mut self, target: &RemoteReference, method: &str, args: Arguments) -> PendingCall {
        match self.start_call(target, method, args) {
            Ok(call) => call,
            Err(e) => PendingCall::failed(e),
        }
    }

    /// Like `call_remote`, with positional arguments.  This needs a known
    /// interface to name the arguments.
    pub fn call_remote_positional(&mut self, target: &RemoteReference, method: &str,
                                  heap: Heap, positional: Vec<Value>) -> PendingCall {
        let named = match self.known_schema(target, method) {
            Ok(Some(schema)) => schema.map_arguments(positional, Vec::new()),
            Ok(None) => Err(Error::Violation(Violation::new(
                "positional arguments need a known interface"))),
            Err(e) => Err(e),
        };
        match named {
            Ok(named) => self.call_remote(target, method, Arguments {
                heap, named: named.into_iter().collect(),
            }),
            Err(e) => PendingCall::failed(e),
        }
    }

    fn known_schema(&self, target: &RemoteReference, method: &str) -> Result<Option<MethodSchema>> {
        if target.clid() == 0 {
            return Ok(broker_schema(method));
        }
        let name = match target.interface_name() {
            Some(name) => name,
            None => return Ok(None),
        };
        match self.state.options.interfaces.get(&name) {
            Some(interface) => interface.get(method).cloned().map(Some).ok_or_else(
                || Error::Violation(Violation::new(format!(
                    "method '{}' not defined in {}", method, name)))),
            None => Ok(None),
        }
    }

    fn start_call(&mut self, target: &RemoteReference, method: &str, args: Arguments) -> Result<PendingCall> {
        if !self.is_connected() {
            return Err(Error::DeadReference(STALE_BROKER.into()));
        }
        if !target.belongs_to(&self.state.shared) {
            return Err(Error::Violation(Violation::new(
                "cannot call a reference belonging to another broker")));
        }
        let schema = self.known_schema(target, method)?;
        if let Some(ref schema) = schema {
            let pairs: Vec<(String, Value)> = args.named.iter()
                .map(|(k, v)| (k.clone(), v.clone())).collect();
            schema.check_all_args(&args.heap, &pairs)?;
        }
        self.state.prune_outstanding();
        let req_id = self.state.next_req_id;
        let clid = target.clid();
        self.send_frame(&args.heap, |jellier| {
            let frame = jellier.open_frame(CALL_ATOM);
            jellier.push_token(frame, Token::Int(req_id as i64));
            jellier.push_token(frame, Token::Int(clid));
            jellier.push_token(frame, Token::String(method.as_bytes().to_vec()));
            for (name, value) in &args.named {
                jellier.push_token(frame, Token::String(name.as_bytes().to_vec()));
                jellier.push_value(frame, value)?;
            }
            Ok(frame)
        })?;
        self.state.next_req_id += 1;
        debug!("sent call {} to {}.{}", req_id, target.clid(), method);
        let call = PendingCall::new(Some(req_id));
        self.state.outstanding.insert(req_id, Outstanding {
            call: call.clone(),
            response: schema.and_then(|s| s.response),
        });
        Ok(call)
    }

    /// Feed bytes from the transport.  An error means the connection is
    /// broken: an ERROR token was queued for the peer, every pending call
    /// has failed, and the transport should be closed after writing out
    /// `take_output`.
    pub fn data_received(&mut self, data: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::DeadReference(STALE_BROKER.into()));
        }
        let result = self.receiver.data_received(data, &mut self.state);
        for delivery in self.receiver.take_deliveries() {
            self.dispatch(delivery);
        }
        if let Err(ref e) = result {
            error!("fatal protocol error: {}", e);
            if let Err(send_error) = self.sender.send_error(&e.to_string()) {
                error!("could not send ERROR token: {}", send_error);
            }
            self.connection_lost(&e.to_string());
        }
        result
    }

    /// Bytes to write to the transport.  Also sends `decref` messages for
    /// remote references dropped since the last call.
    pub fn take_output(&mut self) -> Vec<u8> {
        self.state.prune_outstanding();
        self.flush_decrefs();
        self.sender.take_output()
    }

    /// The transport is gone.  Calling this more than once has no effect.
    pub fn connection_lost(&mut self, reason: &str) {
        if !self.is_connected() {
            return;
        }
        info!("connection lost: {}", reason);
        let outstanding = mem::take(&mut self.state.outstanding);
        self.state.cancelled.clear();
        self.state.exported.clear();
        self.state.clids.clear();
        self.state.imported.clear();
        self.state.shared.disconnect();
        for (_, outstanding) in outstanding {
            if !outstanding.call.is_resolved() {
                outstanding.call.resolve(Err(Error::DeadReference(reason.into())));
            }
        }
    }

    fn flush_decrefs(&mut self) {
        let released = mem::take(&mut *self.state.shared.released.borrow_mut());
        if released.is_empty() || !self.is_connected() {
            return;
        }
        let broker = self.remote_broker();
        for (clid, count) in released {
            debug!("decref {} by {}", clid, count);
            let args = Arguments::new().value("clid", Value::I64(clid))
                                       .value("count", Value::I64(count as i64));
            let call = self.call_remote(&broker, DECREF, args);
            if let Some(Err(e)) = call.take_result() {
                warn!("decref of {} not sent: {}", clid, e);
            }
        }
    }

    fn dispatch(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Call { req_id, clid, method, args, schema } => {
                debug!("inbound call {} to {}.{}", req_id, clid, method);
                let result = self.run_call(clid, &method, args);
                let result = result.and_then(|graph| {
                    if let Some(ref schema) = schema {
                        schema.check_results(&graph.heap, &graph.root)?;
                    }
                    Ok(graph)
                });
                self.reply(req_id, result);
            }
            Delivery::CallFailed { req_id, error } => {
                debug!("inbound call {} rejected: {}", req_id, error);
                self.reply(req_id, Err(error));
            }
            Delivery::Answer { req_id, result } => {
                debug!("answer for {}", req_id);
                self.finish_call(req_id, Ok(result));
            }
            Delivery::Error { req_id, failure } => {
                debug!("error for {}: {}", req_id, failure);
                self.finish_call(req_id, Err(Error::Remote(failure)));
            }
            Delivery::AnswerFailed { req_id, error } => self.finish_call(req_id, Err(error)),
            Delivery::Rejected(error) => debug!("dropped top-level frame: {}", error),
            Delivery::Object(graph) => debug!("ignoring bare object {}", graph),
        }
    }

    fn finish_call(&mut self, req_id: u64, result: Result<Graph>) {
        match self.state.outstanding.remove(&req_id) {
            Some(outstanding) => if !outstanding.call.is_resolved() {
                outstanding.call.resolve(result);
            } else {
                debug!("dropping answer for cancelled request {}", req_id);
            },
            None if self.state.cancelled.remove(&req_id) =>
                debug!("dropping answer for cancelled request {}", req_id),
            None => debug!("answer for forgotten request {}", req_id),
        }
    }

    fn run_call(&mut self, clid: i64, method: &str, args: Arguments) -> Result<Graph> {
        if clid == 0 {
            return self.broker_call(method, args);
        }
        let local = self.state.local_reference(clid)?;
        local.object().remote_call(method, args)
    }

    fn broker_call(&mut self, method: &str, args: Arguments) -> Result<Graph> {
        match method {
            DECREF => {
                let int = |name: &str| args.get(name).and_then(|v| v.as_i64()).ok_or_else(
                    || Error::Violation(Violation::new(format!("decref needs an integer '{}'", name))));
                let clid = int("clid")?;
                let count = int("count")?;
                self.state.decref(clid, count.max(0) as u64);
                Ok(Graph::scalar(Value::None))
            }
            GET_REFERENCE_BY_NAME => {
                let name = args.get("name").and_then(|v| v.as_bytes())
                               .map(|b| String::from_utf8_lossy(b).into_owned())
                               .unwrap_or_default();
                let local = self.state.published.get(&name).cloned().ok_or_else(
                    || Error::Violation(Violation::new(format!("unknown name '{}'", name))))?;
                let mut heap = Heap::new();
                let root = Value::Obj(heap.alloc(Object::Local(local)));
                Ok(Graph::new(heap, root))
            }
            _ => Err(Error::Violation(Violation::new(format!(
                "method '{}' not defined in the broker", method)))),
        }
    }

    /// Send an answer or an error frame.
    fn reply(&mut self, req_id: u64, result: Result<Graph>) {
        let result: Result<()> = match result {
            Ok(graph) => match self.send_answer(req_id, &graph) {
                Ok(()) => return,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            if e.is_disconnection() || matches!(e, Error::Violation(_)) {
                warn!("request {} failed: {}", req_id, e);
            } else {
                debug!("request {} failed: {}", req_id, e);
            }
            let failure = CopiedFailure::from_error(&e, self.state.options.unsafe_tracebacks);
            if let Err(e) = self.send_failure(req_id, &failure) {
                error!("could not send error for request {}: {}", req_id, e);
            }
        }
    }

    fn send_answer(&mut self, req_id: u64, graph: &Graph) -> Result<()> {
        self.send_frame(&graph.heap, |jellier| {
            let frame = jellier.open_frame(ANSWER_ATOM);
            jellier.push_token(frame, Token::Int(req_id as i64));
            jellier.push_value(frame, &graph.root)?;
            Ok(frame)
        })
    }

    /// Slice a PB frame built by `fill` and queue it.  Export counts taken
    /// while slicing are given back if nothing was sent.
    fn send_frame<F>(&mut self, heap: &Heap, fill: F) -> Result<()>
        where F: FnOnce(&mut Jellier<'_>) -> Result<FrameId>
    {
        self.state.in_flight.clear();
        let sent = {
            let env: &mut dyn SliceEnvironment = &mut self.state;
            let mut jellier = Jellier::new(heap, &self.jelly_options, Some(env));
            match fill(&mut jellier) {
                Ok(frame) => self.sender.send(&jellier, &Piece::Frame(frame)),
                Err(e) => Err(e),
            }
        };
        if sent.is_err() {
            self.state.rollback_exports();
        }
        self.state.in_flight.clear();
        sent
    }

    fn send_failure(&mut self, req_id: u64, failure: &CopiedFailure) -> Result<()> {
        let mut heap = Heap::new();
        let state = failure.to_state(&mut heap);
        let mut jellier = Jellier::new(&heap, &self.jelly_options, None);
        let frame = jellier.open_frame(ERROR_ATOM);
        jellier.push_token(frame, Token::Int(req_id as i64));
        let copyable = jellier.open_frame(COPYABLE_ATOM);
        jellier.push_token(copyable, Token::String(FAILURE_CLASS.as_bytes().to_vec()));
        for (name, value) in &state {
            jellier.push_token(copyable, Token::String(name.as_bytes().to_vec()));
            jellier.push_value(copyable, value)?;
        }
        jellier.push_frame(frame, copyable);
        self.sender.send(&jellier, &Piece::Frame(frame))
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Broker")
         .field("connected", &self.is_connected())
         .field("outstanding", &self.state.outstanding.len())
         .field("exported", &self.state.exported.len())
         .field("depth", &self.receiver.depth())
         .finish()
    }
}
