// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! # Jelly deserialization
//!
//! The receive loop in `banana` drives a stack of frames, one per open
//! sequence.  Frames check each token against their constraint before its
//! body is read, collect their children and produce a value on CLOSE.
//!
//! Values that are referenced before they are complete are represented by
//! placeholders.  Mutable containers are allocated as soon as they open, so
//! a back-reference to them is immediately usable.  Immutable ones (tuples,
//! methods) can only be built once all of their children are known; a
//! container that receives a placeholder records itself as a dependant and
//! gets its slot filled in when the placeholder resolves.
//!
//! When a frame rejects its input, the failure travels down the stack until
//! a frame absorbs it: unconstrained containers keep a `Value::Failure`
//! marker in the slot, everything else gives up its own sequence too.  The
//! root absorbs whatever reaches it and reports it for the current
//! top-level object.

use std::fmt;
use std::mem;
use std::sync::Arc;
use std::collections::{BTreeMap, BTreeSet};
use log::warn;

use crate::broker::Arguments;
use crate::consts::*;
use crate::error::{Error, ErrorCode, Result, Violation};
use crate::failure::CopiedFailure;
use crate::referenceable::{LocalReference, RemoteReference};
use crate::schema::{Constraint, MethodSchema};
use crate::taster::{module_of, SecurityOptions, Taster};
use crate::tokens::Token;
use crate::value::{Graph, HashableValue, Heap, Object, ObjId, Value};

/// Message of the violation raised for a received ABORT token.
pub(crate) const ABORT_RECEIVED: &str = "ABORT received";

/// Hook turning a `persistent` payload back into a value.
pub type PersistentLoad =
    Arc<dyn Fn(&mut Heap, Value) -> std::result::Result<Value, Violation> + Send + Sync>;

/// Builds an application object from the attributes of a sequence
/// tagged with a registered class name.
pub type Unjellyable =
    Arc<dyn Fn(&mut Heap, Vec<(String, Value)>) -> std::result::Result<Value, Violation> + Send + Sync>;

/// Class tags the receiving side knows how to build.
///
/// A registered tag is accepted in three places: as the class of a
/// `copyable` sequence, as the atom of a sequence of its own, and as the
/// class of an `instance` (which still has to pass the taster).  The
/// copied-failure class is built in and can not be replaced.
///
/// For instances the constructor should return an object: it takes the
/// place of the instance, so back-references to it see the built object.
#[derive(Clone, Default)]
pub struct ClassRegistry {
    classes: BTreeMap<String, Unjellyable>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S, F>(mut self, class: S, build: F) -> Self
        where S: Into<String>,
              F: Fn(&mut Heap, Vec<(String, Value)>) -> std::result::Result<Value, Violation>
                 + Send + Sync + 'static
    {
        let class = class.into();
        if class == FAILURE_CLASS {
            warn!("not replacing the built-in {} class", FAILURE_CLASS);
            return self;
        }
        self.classes.insert(class, Arc::new(build));
        self
    }

    pub fn get(&self, class: &str) -> Option<&Unjellyable> {
        self.classes.get(class)
    }

    pub fn contains(&self, class: &str) -> bool {
        class == FAILURE_CLASS || self.classes.contains_key(class)
    }

    /// Length of the longest tag, for limiting index tokens.
    fn longest(&self) -> usize {
        self.classes.keys().map(|c| c.len()).fold(FAILURE_CLASS.len(), usize::max)
    }
}

impl fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.classes.keys()).finish()
    }
}

/// Options for unjellying.
#[derive(Clone)]
pub struct UnjellyOptions {
    taster: Arc<dyn Taster>,
    persistent_load: Option<PersistentLoad>,
    constraint: Option<Constraint>,
    classes: ClassRegistry,
}

impl UnjellyOptions {
    /// Construct with the default security policy and no constraint.
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

    pub fn persistent_load<F>(mut self, hook: F) -> Self
        where F: Fn(&mut Heap, Value) -> std::result::Result<Value, Violation> + Send + Sync + 'static
    {
        self.persistent_load = Some(Arc::new(hook));
        self
    }

    /// Constrain every top-level object.
    pub fn constraint(mut self, constraint: Constraint) -> Self {
        self.constraint = Some(constraint);
        self
    }

    pub fn classes(mut self, classes: ClassRegistry) -> Self {
        self.classes = classes;
        self
    }

    pub(crate) fn get_taster(&self) -> &dyn Taster {
        &*self.taster
    }
}

impl Default for UnjellyOptions {
    fn default() -> Self {
        UnjellyOptions {
            taster: Arc::new(SecurityOptions::default()),
            persistent_load: None,
            constraint: None,
            classes: ClassRegistry::default(),
        }
    }
}

impl fmt::Debug for UnjellyOptions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("UnjellyOptions")
         .field("taster", &self.taster)
         .field("persistent_load", &self.persistent_load.is_some())
         .field("constraint", &self.constraint)
         .field("classes", &self.classes)
         .finish()
    }
}

/// What the broker provides to PB frames while they decode.
pub(crate) trait Environment {
    /// The response constraint of an outstanding request.  An unknown id is
    /// fatal for the connection.
    fn response_constraint(&mut self, req_id: u64) -> Result<Option<Constraint>>;
    /// Find the target of an inbound call and the schema of the method.
    fn method_schema(&mut self, clid: i64, method: &str)
                     -> std::result::Result<Option<MethodSchema>, Violation>;
    /// One of our own objects, sent back to us.
    fn local_reference(&mut self, clid: i64) -> std::result::Result<LocalReference, Violation>;
    /// An object living on the peer.
    fn remote_reference(&mut self, clid: i64, interface_name: Option<String>, url: Option<String>)
                        -> std::result::Result<RemoteReference, Violation>;
}

/// Environment for plain jelly streams: there is no broker.
pub(crate) struct NoEnvironment;

impl Environment for NoEnvironment {
    fn response_constraint(&mut self, req_id: u64) -> Result<Option<Constraint>> {
        Err(Error::Banana(ErrorCode::UnknownRequest(req_id)))
    }

    fn method_schema(&mut self, _: i64, _: &str)
                     -> std::result::Result<Option<MethodSchema>, Violation> {
        Err(Violation::new("method calls need a broker"))
    }

    fn local_reference(&mut self, _: i64) -> std::result::Result<LocalReference, Violation> {
        Err(Violation::new("references need a broker"))
    }

    fn remote_reference(&mut self, _: i64, _: Option<String>, _: Option<String>)
                        -> std::result::Result<RemoteReference, Violation> {
        Err(Violation::new("references need a broker"))
    }
}

/// Things the decoder hands to its owner.
#[derive(Debug)]
pub(crate) enum Delivery {
    /// A complete top-level jelly object.
    Object(Graph),
    Call { req_id: u64, clid: i64, method: String, args: Arguments, schema: Option<MethodSchema> },
    Answer { req_id: u64, result: Graph },
    Error { req_id: u64, failure: CopiedFailure },
    /// An inbound call that could not be decoded; the caller gets an error.
    CallFailed { req_id: u64, error: Error },
    /// An answer (or error) that could not be decoded; the request fails.
    AnswerFailed { req_id: u64, error: Error },
    /// A top-level object was rejected.
    Rejected(Error),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Mode {
    /// Top-level objects are plain jelly values.
    Jelly,
    /// Top-level objects are PB frames.
    Broker,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Atom {
    None, Boolean, Unicode, List, Tuple, Dict, Set, FrozenSet, Instance,
    Reference, Dereference, Class, Module, Function, Method, Persistent,
    Unpersistable, Vocab, Copyable, MyReference, YourReference, Call, Answer, Error,
}

const ATOMS: &[(&str, Atom)] = &[
    (NONE_ATOM, Atom::None),
    (BOOLEAN_ATOM, Atom::Boolean),
    (UNICODE_ATOM, Atom::Unicode),
    (LIST_ATOM, Atom::List),
    (TUPLE_ATOM, Atom::Tuple),
    (DICT_ATOM, Atom::Dict),
    (SET_ATOM, Atom::Set),
    (FROZENSET_ATOM, Atom::FrozenSet),
    (INSTANCE_ATOM, Atom::Instance),
    (REFERENCE_ATOM, Atom::Reference),
    (DEREFERENCE_ATOM, Atom::Dereference),
    (CLASS_ATOM, Atom::Class),
    (MODULE_ATOM, Atom::Module),
    (FUNCTION_ATOM, Atom::Function),
    (METHOD_ATOM, Atom::Method),
    (PERSISTENT_ATOM, Atom::Persistent),
    (UNPERSISTABLE_ATOM, Atom::Unpersistable),
    (VOCAB_ATOM, Atom::Vocab),
    (COPYABLE_ATOM, Atom::Copyable),
    (MY_REFERENCE, Atom::MyReference),
    (YOUR_REFERENCE, Atom::YourReference),
    (CALL_ATOM, Atom::Call),
    (ANSWER_ATOM, Atom::Answer),
    (ERROR_ATOM, Atom::Error),
];

impl Atom {
    fn parse(name: &[u8]) -> Option<Atom> {
        ATOMS.iter().find(|&&(n, _)| n.as_bytes() == name).map(|&(_, a)| a)
    }

    fn name(self) -> &'static str {
        ATOMS.iter().find(|&&(_, a)| a == self).map_or("?", |&(n, _)| n)
    }

    /// Plain jelly atoms, subject to the taster.
    fn is_jelly(self) -> bool {
        match self {
            Atom::Vocab | Atom::Copyable | Atom::MyReference | Atom::YourReference |
            Atom::Call | Atom::Answer | Atom::Error => false,
            _ => true,
        }
    }
}

fn max_index_length() -> usize {
    ATOMS.iter().map(|&(n, _)| n.len()).max().unwrap_or(0)
}

/// A child value, or the placeholder standing in for it.
#[derive(Clone, Debug)]
enum Slot {
    Ready(Value),
    Pending(usize),
}

/// Where a resolved placeholder's value has to go.
#[derive(Debug)]
enum Dependant {
    Item(ObjId, usize),
    /// An element of a mutable set, hashed once it is known.
    SetItem(ObjId),
    DictKey(ObjId, usize),
    DictValue(ObjId, usize),
    Attr(ObjId, usize),
    Build(usize, usize),
    Alias(usize),
}

#[derive(Debug, Default)]
struct Placeholder {
    resolved: Option<Value>,
    dependants: Vec<Dependant>,
}

#[derive(Debug)]
enum BuildKind {
    Tuple,
    FrozenSet,
    Method(String),
}

impl BuildKind {
    fn into_object(self, values: Vec<Value>) -> Object {
        match self {
            BuildKind::Tuple => Object::Tuple(values),
            BuildKind::FrozenSet => Object::FrozenSet(values),
            BuildKind::Method(name) => {
                let mut values = values.into_iter();
                let receiver = values.next().unwrap_or(Value::None);
                let class = values.next().unwrap_or(Value::None);
                Object::Method { name, receiver, class }
            }
        }
    }
}

/// An immutable object waiting for some of its slots.
#[derive(Debug)]
struct Build {
    kind: BuildKind,
    slots: Vec<Value>,
    remaining: usize,
    placeholder: usize,
}

/// Per top-level object state: the heap being filled and the reference
/// table.  Reference ids are only valid within one top-level object.
#[derive(Debug, Default)]
struct Scope {
    heap: Heap,
    refs: BTreeMap<u64, Slot>,
    placeholders: Vec<Placeholder>,
    builds: Vec<Build>,
    /// Keys seen so far by each set and dict.
    keys: BTreeMap<ObjId, BTreeSet<HashableValue>>,
    /// A problem found while filling in a slot after its frame was done.
    late: Option<Violation>,
}

impl Scope {
    fn placeholder(&mut self) -> usize {
        self.placeholders.push(Placeholder::default());
        self.placeholders.len() - 1
    }

    fn settle(&self, slot: Slot) -> Slot {
        match slot {
            Slot::Pending(p) => match self.placeholders[p].resolved {
                Some(ref value) => Slot::Ready(value.clone()),
                None => Slot::Pending(p),
            },
            ready => ready,
        }
    }

    /// Record the key of a set element or dict key.  Returns false for a
    /// duplicate.
    fn add_key(&mut self, container: ObjId, value: &Value, what: &str)
               -> std::result::Result<bool, Violation> {
        let key = self.heap.to_hashable(value)
                           .ok_or_else(|| Violation::new(format!("unhashable {}", what)))?;
        Ok(self.keys.entry(container).or_default().insert(key))
    }

    fn fail_late(&mut self, violation: Violation) {
        if self.late.is_none() {
            self.late = Some(violation);
        }
    }

    /// Allocate a finished immutable object.
    fn assemble(&mut self, kind: BuildKind, values: Vec<Value>) -> ObjId {
        let values = match kind {
            BuildKind::FrozenSet => {
                let mut seen = BTreeSet::new();
                let mut unique = Vec::with_capacity(values.len());
                for value in values {
                    match self.heap.to_hashable(&value) {
                        Some(key) => if seen.insert(key) {
                            unique.push(value);
                        },
                        None if value.failure().is_some() => unique.push(value),
                        None => self.fail_late(Violation::new("unhashable set element")),
                    }
                }
                unique
            }
            _ => values,
        };
        self.heap.alloc(kind.into_object(values))
    }

    fn depend(&mut self, p: usize, dependant: Dependant) {
        match self.placeholders[p].resolved.clone() {
            Some(value) => if let Some((q, value)) = self.apply(dependant, value) {
                self.resolve(q, value);
            },
            None => self.placeholders[p].dependants.push(dependant),
        }
    }

    fn resolve(&mut self, p: usize, value: Value) {
        let mut work = vec![(p, value)];
        while let Some((p, value)) = work.pop() {
            if self.placeholders[p].resolved.is_some() {
                continue;
            }
            self.placeholders[p].resolved = Some(value.clone());
            let dependants = mem::take(&mut self.placeholders[p].dependants);
            for dependant in dependants {
                if let Some(next) = self.apply(dependant, value.clone()) {
                    work.push(next);
                }
            }
        }
    }

    /// Fill in one slot.  Returns a placeholder that can now be resolved.
    fn apply(&mut self, dependant: Dependant, value: Value) -> Option<(usize, Value)> {
        match dependant {
            Dependant::Item(id, i) => {
                if let Some(&mut Object::List(ref mut items)) = self.heap.get_mut(id) {
                    if let Some(slot) = items.get_mut(i) {
                        *slot = value;
                    }
                }
                None
            }
            Dependant::SetItem(id) => {
                match self.add_key(id, &value, "set element") {
                    Ok(true) => if let Some(&mut Object::Set(ref mut items)) = self.heap.get_mut(id) {
                        items.push(value);
                    },
                    Ok(false) => {}
                    Err(v) => self.fail_late(v),
                }
                None
            }
            Dependant::DictKey(id, i) => {
                match self.add_key(id, &value, "dict key") {
                    Ok(true) => {}
                    Ok(false) => self.fail_late(Violation::new(
                        format!("duplicate key '{}'", key_text(&value)))),
                    Err(v) => self.fail_late(v),
                }
                if let Some(&mut Object::Dict(ref mut pairs)) = self.heap.get_mut(id) {
                    if let Some(pair) = pairs.get_mut(i) {
                        pair.0 = value;
                    }
                }
                None
            }
            Dependant::DictValue(id, i) => {
                if let Some(&mut Object::Dict(ref mut pairs)) = self.heap.get_mut(id) {
                    if let Some(pair) = pairs.get_mut(i) {
                        pair.1 = value;
                    }
                }
                None
            }
            Dependant::Attr(id, i) => {
                if let Some(&mut Object::Instance { ref mut state, .. }) = self.heap.get_mut(id) {
                    if let Some(attr) = state.get_mut(i) {
                        attr.1 = value;
                    }
                }
                None
            }
            Dependant::Alias(q) => Some((q, value)),
            Dependant::Build(b, i) => {
                let build = &mut self.builds[b];
                build.slots[i] = value;
                build.remaining -= 1;
                if build.remaining > 0 {
                    return None;
                }
                let kind = mem::replace(&mut build.kind, BuildKind::Tuple);
                let values = mem::take(&mut build.slots);
                let placeholder = build.placeholder;
                let id = self.assemble(kind, values);
                Some((placeholder, Value::Obj(id)))
            }
        }
    }

    /// Assemble an immutable object, or defer it until its pending slots
    /// resolve.
    fn build(&mut self, kind: BuildKind, slots: Vec<Slot>) -> Slot {
        let slots: Vec<Slot> = slots.into_iter().map(|s| self.settle(s)).collect();
        let mut values = Vec::with_capacity(slots.len());
        let mut waiting = Vec::new();
        for (i, slot) in slots.into_iter().enumerate() {
            match slot {
                Slot::Ready(value) => values.push(value),
                Slot::Pending(p) => {
                    values.push(Value::None);
                    waiting.push((p, i));
                }
            }
        }
        if waiting.is_empty() {
            return Slot::Ready(Value::Obj(self.assemble(kind, values)));
        }
        let placeholder = self.placeholder();
        let b = self.builds.len();
        self.builds.push(Build { kind, slots: values, remaining: waiting.len(), placeholder });
        for (p, i) in waiting {
            self.depend(p, Dependant::Build(b, i));
        }
        Slot::Pending(placeholder)
    }

    fn value(&self, slot: Slot) -> std::result::Result<Value, Violation> {
        match self.settle(slot) {
            Slot::Ready(value) => Ok(value),
            Slot::Pending(_) => Err(Violation::new("unresolved reference")),
        }
    }

    /// Check that nothing is left pending at the end of the object.
    fn complete(&self) -> std::result::Result<(), Violation> {
        if let Some(ref violation) = self.late {
            return Err(violation.clone());
        }
        if self.placeholders.iter().any(|p| p.resolved.is_none()) {
            return Err(Violation::new("unresolved reference"));
        }
        Ok(())
    }

    fn finish(self, root: Slot) -> std::result::Result<Graph, Violation> {
        let root = self.value(root)?;
        self.complete()?;
        Ok(Graph::new(self.heap, root))
    }
}

/// Result of closing a frame.
enum Closed {
    Value(Slot),
    Top(Top),
}

/// Top-level PB frames.
enum Top {
    Call { req_id: u64, clid: i64, method: String, args: Vec<(String, Slot)>,
           schema: Option<MethodSchema> },
    Answer { req_id: u64, result: Slot },
    Error { req_id: u64, failure: CopiedFailure },
    Vocab(BTreeMap<u64, Vec<u8>>),
}

struct DictState {
    id: ObjId,
    len: usize,
    key: Option<Slot>,
    keep: bool,
    value: Option<Constraint>,
}

struct InstanceState {
    id: ObjId,
    class: Option<String>,
    attr: Option<String>,
    keep: bool,
    value: Option<Constraint>,
    names: Vec<String>,
    /// Attributes still waiting for a placeholder.
    pending: usize,
}

#[derive(Default)]
struct CallState {
    req_id: Option<u64>,
    clid: Option<i64>,
    method: Option<String>,
    schema: Option<MethodSchema>,
    /// Name of the argument whose value comes next; whether to keep it
    /// and its constraint.
    arg: Option<(String, bool, Option<Constraint>)>,
    args: Vec<(String, Slot)>,
}

enum Kind {
    Root,
    None,
    Boolean(Option<bool>),
    Unicode(Option<String>),
    /// class, module, function and unpersistable: one string
    Text(Atom, Option<String>),
    List { id: ObjId, len: usize },
    Tuple(Vec<Slot>),
    Set { id: ObjId, len: usize },
    FrozenSet { items: Vec<Slot>, seen: BTreeSet<HashableValue> },
    Dict(DictState),
    Instance(InstanceState),
    Reference { refid: Option<u64>, object: Option<Slot> },
    Dereference(Option<Slot>),
    Method { name: Option<String>, parts: Vec<Slot> },
    Persistent(Option<Value>),
    Vocab { table: BTreeMap<u64, Vec<u8>>, key: Option<u64> },
    Copyable { class: String, build: Option<Unjellyable>, state: Vec<(String, Value)>,
               attr: Option<(String, bool)>, value: Option<Constraint> },
    MyReference { clid: Option<i64>, strings: Vec<String> },
    YourReference(Option<i64>),
    Call(CallState),
    Answer { req_id: Option<u64>, result: Option<Slot> },
    Error { req_id: Option<u64>, failure: Option<Value> },
}

struct Context<'a> {
    scope: &'a mut Scope,
    env: &'a mut dyn Environment,
    options: &'a UnjellyOptions,
}

struct Frame {
    open_count: u64,
    /// What the value built by this frame must satisfy.
    constraint: Option<Constraint>,
    kind: Kind,
}

fn protocol<S: Into<String>>(message: S) -> Error {
    Error::Banana(ErrorCode::Protocol(message.into()))
}

fn violation<S: Into<String>>(message: S) -> Error {
    Error::Violation(Violation::new(message))
}

/// Violations and taster rejections are local to a subtree; everything
/// else is fatal.
pub(crate) fn is_rejection(err: &Error) -> bool {
    match *err {
        Error::Violation(_) | Error::Insecure(_) => true,
        _ => false,
    }
}

fn duplicate(err: &Error) -> Error {
    match *err {
        Error::Violation(ref v) => Error::Violation(v.clone()),
        Error::Insecure(ref why) => Error::Insecure(why.clone()),
        ref other => protocol(other.to_string()),
    }
}

fn failure_value(err: &Error) -> Value {
    match *err {
        Error::Violation(ref v) => Value::Failure(Box::new(v.clone())),
        ref other => Value::Failure(Box::new(Violation::new(other.to_string()))),
    }
}

fn is_abort(err: &Error) -> bool {
    match *err {
        Error::Violation(ref v) => v.message() == ABORT_RECEIVED,
        _ => false,
    }
}

fn ready(slot: Slot, what: &str) -> Result<Value> {
    match slot {
        Slot::Ready(value) => Ok(value),
        Slot::Pending(_) => Err(violation(what)),
    }
}

fn int_of(value: &Value) -> Result<i64> {
    value.as_i64().ok_or_else(|| protocol("expected an integer"))
}

fn text_of(value: &Value) -> Result<String> {
    match *value {
        Value::Bytes(ref b) =>
            String::from_utf8(b.clone()).map_err(|_| Error::Banana(ErrorCode::StringNotUTF8)),
        Value::String(ref s) => Ok(s.clone()),
        _ => Err(protocol("expected a string")),
    }
}

/// Render a key for locations and messages without quoting.
fn key_text(value: &Value) -> String {
    match *value {
        Value::Bytes(ref b) => String::from_utf8_lossy(b).into_owned(),
        Value::String(ref s) => s.clone(),
        ref other => other.to_string(),
    }
}

/// Strip `Optional` and `Any`.
fn effective(constraint: Option<&Constraint>) -> Option<&Constraint> {
    match constraint {
        Some(&Constraint::Any) | None => None,
        Some(&Constraint::Optional(ref inner)) => effective(Some(inner)),
        Some(other) => Some(other),
    }
}

/// Pick the constraint for a sequence of type `atom`.  References keep the
/// whole constraint, their target is checked against it.
fn narrow(constraint: &Constraint, atom: Atom) -> Option<Constraint> {
    let constraint = effective(Some(constraint))?;
    match *constraint {
        Constraint::Choice(ref alternatives) if atom != Atom::Reference && atom != Atom::Dereference =>
            alternatives.iter()
                        .find(|c| c.check_opentype(atom.name()).is_ok())
                        .and_then(|c| narrow(c, atom)),
        ref other => Some(other.clone()),
    }
}

impl Frame {
    fn open(atom: Atom, open_count: u64, constraint: Option<Constraint>, scope: &mut Scope) -> Frame {
        let mut constraint = constraint;
        let kind = match atom {
            Atom::None => Kind::None,
            Atom::Boolean => Kind::Boolean(None),
            Atom::Unicode => Kind::Unicode(None),
            Atom::Class | Atom::Module | Atom::Function | Atom::Unpersistable => Kind::Text(atom, None),
            Atom::List => Kind::List { id: scope.heap.alloc(Object::List(Vec::new())), len: 0 },
            Atom::Tuple => Kind::Tuple(Vec::new()),
            Atom::Set => Kind::Set {
                id: scope.heap.alloc(Object::Set(Vec::new())), len: 0,
            },
            Atom::FrozenSet => Kind::FrozenSet { items: Vec::new(), seen: BTreeSet::new() },
            Atom::Dict => Kind::Dict(DictState {
                id: scope.heap.alloc(Object::Dict(Vec::new())),
                len: 0, key: None, keep: true, value: None,
            }),
            Atom::Instance => Kind::Instance(InstanceState {
                id: scope.heap.alloc(Object::Instance { class: String::new(), state: Vec::new() }),
                class: None, attr: None, keep: true, value: None, names: Vec::new(), pending: 0,
            }),
            Atom::Reference => Kind::Reference { refid: None, object: None },
            Atom::Dereference => Kind::Dereference(None),
            Atom::Method => Kind::Method { name: None, parts: Vec::new() },
            Atom::Persistent => Kind::Persistent(None),
            Atom::Vocab => Kind::Vocab { table: BTreeMap::new(), key: None },
            Atom::Copyable => Kind::Copyable {
                class: FAILURE_CLASS.into(), build: None, state: Vec::new(), attr: None, value: None,
            },
            Atom::MyReference => Kind::MyReference { clid: None, strings: Vec::new() },
            Atom::YourReference => Kind::YourReference(None),
            Atom::Call => Kind::Call(CallState::default()),
            Atom::Answer => Kind::Answer { req_id: None, result: None },
            Atom::Error => {
                constraint = Some(Constraint::Failure);
                Kind::Error { req_id: None, failure: None }
            }
        };
        Frame { open_count, constraint, kind }
    }

    /// The object a mutable container allocated on open.
    fn early_value(&self) -> Option<Value> {
        match self.kind {
            Kind::List { id, .. } | Kind::Set { id, .. } => Some(Value::Obj(id)),
            Kind::Dict(ref d) => Some(Value::Obj(d.id)),
            Kind::Instance(ref s) => Some(Value::Obj(s.id)),
            _ => None,
        }
    }

    /// Constraint for the next child value.
    fn child_constraint(&self) -> Option<&Constraint> {
        let c = match self.kind {
            Kind::Root | Kind::Reference { .. } | Kind::Answer { .. } | Kind::Error { .. } =>
                self.constraint.as_ref(),
            Kind::List { .. } => match self.constraint {
                Some(Constraint::ListOf(ref item, _)) => Some(&**item),
                _ => None,
            },
            Kind::Tuple(ref slots) => match self.constraint {
                Some(Constraint::TupleOf(ref elements)) => elements.get(slots.len()),
                _ => None,
            },
            Kind::Dict(ref d) => match (&self.constraint, &d.key) {
                (&Some(Constraint::DictOf(ref key, _, _)), &None) => Some(&**key),
                (&Some(Constraint::DictOf(_, ref value, _)), &Some(_)) => Some(&**value),
                (_, &Some(_)) => d.value.as_ref(),
                _ => None,
            },
            Kind::Instance(ref s) => s.value.as_ref(),
            Kind::Copyable { ref value, .. } => value.as_ref(),
            Kind::Call(ref c) => c.arg.as_ref().and_then(|a| a.2.as_ref()),
            _ => None,
        };
        effective(c)
    }

    fn check_token(&self, typebyte: u8, size: u64, mode: Mode) -> Result<()> {
        let string = typebyte == STRING || typebyte == VOCAB;
        let int = typebyte == INT || typebyte == NEG;
        match self.kind {
            Kind::Root => if mode == Mode::Broker && typebyte != OPEN {
                return Err(protocol("top-level must be OPEN"));
            },
            Kind::None => return Err(protocol("NoneUnslicer does not accept any tokens")),
            Kind::Boolean(ref b) => {
                if b.is_some() || typebyte != INT {
                    return Err(protocol("BooleanUnslicer only accepts an INT token"));
                }
                return Ok(());
            }
            Kind::Unicode(ref text) => {
                if text.is_some() || !string {
                    return Err(protocol("UnicodeUnslicer only accepts one string"));
                }
                if let Some(Constraint::Unicode(Some(max))) = self.constraint {
                    if typebyte == STRING && size > max as u64 {
                        return Err(violation(format!("token too large: {}>{}", size, max)));
                    }
                }
                return Ok(());
            }
            Kind::Text(atom, ref text) => {
                if text.is_some() || !string {
                    return Err(protocol(format!("{} only accepts one string", atom.name())));
                }
                return Ok(());
            }
            Kind::List { len, .. } => if let Some(Constraint::ListOf(_, Some(max))) = self.constraint {
                if len >= max {
                    return Err(violation("the list is full"));
                }
            },
            Kind::Tuple(ref slots) => if let Some(Constraint::TupleOf(ref elements)) = self.constraint {
                if slots.len() >= elements.len() {
                    return Err(violation("the tuple is full"));
                }
            },
            Kind::Dict(ref d) => if d.key.is_none() {
                match self.constraint {
                    Some(Constraint::DictOf(_, _, Some(max))) if d.len >= max =>
                        return Err(violation("the table is full")),
                    Some(Constraint::AttributeDict(_)) if !string =>
                        return Err(violation("attribute names must be strings")),
                    _ => {}
                }
            },
            Kind::Instance(ref s) => if s.class.is_none() {
                if !string {
                    return Err(protocol("InstanceUnslicer classname must be string"));
                }
                return Ok(());
            } else if s.attr.is_none() {
                if !string {
                    return Err(protocol("InstanceUnslicer keys must be STRINGs"));
                }
                return Ok(());
            },
            Kind::Reference { refid, ref object } => {
                if refid.is_none() {
                    if typebyte != INT {
                        return Err(protocol("reference ID must be an INT"));
                    }
                    return Ok(());
                }
                if object.is_some() {
                    return Err(protocol("reference takes a single object"));
                }
            }
            Kind::Dereference(ref target) => {
                if target.is_some() || typebyte != INT {
                    return Err(protocol("dereference only accepts one INT"));
                }
                return Ok(());
            }
            Kind::Method { ref name, ref parts } => {
                if name.is_none() {
                    if !string {
                        return Err(protocol("method name must be a STRING"));
                    }
                    return Ok(());
                }
                if parts.len() >= 2 {
                    return Err(protocol("method takes a receiver and a class"));
                }
            }
            Kind::Persistent(ref payload) => if payload.is_some() {
                return Err(protocol("persistent takes a single object"));
            },
            Kind::Vocab { key, .. } => {
                match key {
                    None if typebyte != INT =>
                        return Err(protocol("VocabUnslicer only accepts INT keys")),
                    Some(_) if typebyte != STRING =>
                        return Err(protocol("VocabUnslicer only accepts STRING values")),
                    _ => {}
                }
                return Ok(());
            }
            Kind::Copyable { ref attr, .. } => if attr.is_none() {
                if !string {
                    return Err(protocol("copyable attribute names must be STRINGs"));
                }
                return Ok(());
            },
            Kind::MyReference { clid, ref strings } => {
                if clid.is_none() {
                    if !int {
                        return Err(protocol("my-reference ID must be an INT/NEG"));
                    }
                } else if strings.len() >= 2 || typebyte != STRING {
                    return Err(protocol("my-reference takes an interface name and a url"));
                } else if size > 200 {
                    return Err(violation(format!("token too large: {}>200", size)));
                }
                return Ok(());
            }
            Kind::YourReference(ref clid) => {
                if clid.is_some() || !int {
                    return Err(protocol("your-reference only accepts one INT"));
                }
                return Ok(());
            }
            Kind::Call(ref c) => {
                if c.req_id.is_none() {
                    if typebyte != INT {
                        return Err(protocol("request ID must be an INT"));
                    }
                    return Ok(());
                }
                if c.clid.is_none() {
                    if !int {
                        return Err(protocol("object ID must be an INT/NEG"));
                    }
                    return Ok(());
                }
                if c.method.is_none() {
                    if !string {
                        return Err(protocol("method name must be a STRING"));
                    }
                    return Ok(());
                }
                if c.arg.is_none() {
                    if !string {
                        return Err(protocol("argument name must be a STRING"));
                    }
                    return Ok(());
                }
            }
            Kind::Answer { req_id, ref result } => {
                if req_id.is_none() {
                    if typebyte != INT {
                        return Err(protocol("request ID must be an INT"));
                    }
                    return Ok(());
                }
                if result.is_some() {
                    return Err(protocol("stop sending me stuff!"));
                }
                return match self.child_constraint() {
                    Some(c) => c.check_token(typebyte, size)
                                .map_err(|v| Error::Violation(v.suffixed("in inbound method results"))),
                    None => Ok(()),
                };
            }
            Kind::Error { req_id, ref failure } => {
                if req_id.is_none() {
                    if typebyte != INT {
                        return Err(protocol("request ID must be an INT"));
                    }
                    return Ok(());
                }
                if failure.is_some() {
                    return Err(protocol("stop sending me stuff!"));
                }
            }
            Kind::Set { .. } | Kind::FrozenSet { .. } => {}
        }
        match self.child_constraint() {
            Some(c) => c.check_token(typebyte, size).map_err(Error::from),
            None => Ok(()),
        }
    }

    fn receive(&mut self, slot: Slot, cx: &mut Context) -> Result<()> {
        let constraint = &mut self.constraint;
        match self.kind {
            Kind::Root | Kind::None => return Err(protocol("unexpected child")),
            Kind::Boolean(ref mut b) => {
                let flag = match ready(slot, "boolean needs an INT")? {
                    Value::I64(i) => i != 0,
                    _ => return Err(protocol("BooleanUnslicer only accepts an INT token")),
                };
                if let Some(ref c) = *constraint {
                    c.check_object(&cx.scope.heap, &Value::Bool(flag))?;
                }
                *b = Some(flag);
            }
            Kind::Unicode(ref mut text) => {
                let value = ready(slot, "unicode needs a string")?;
                let s = text_of(&value)?;
                if let Some(ref c) = *constraint {
                    c.check_object(&cx.scope.heap, &Value::String(s.clone()))?;
                }
                *text = Some(s);
            }
            Kind::Text(atom, ref mut text) => {
                let name = text_of(&ready(slot, "expected a string")?)?;
                let taster = cx.options.get_taster();
                match atom {
                    Atom::Class => if !taster.is_class_allowed(&name) ||
                        !taster.is_module_allowed(module_of(&name)) {
                        return Err(Error::Insecure(format!("Class not allowed: {}", name)));
                    },
                    Atom::Module => if !taster.is_module_allowed(&name) {
                        return Err(Error::Insecure(format!("Module not allowed: {}", name)));
                    },
                    Atom::Function => if !taster.is_module_allowed(module_of(&name)) {
                        return Err(Error::Insecure(format!("Module not allowed: {}",
                                                           module_of(&name))));
                    },
                    _ => {}
                }
                *text = Some(name);
            }
            Kind::List { id, ref mut len } => {
                let value = match slot {
                    Slot::Ready(value) => value,
                    Slot::Pending(p) => {
                        cx.scope.depend(p, Dependant::Item(id, *len));
                        Value::None
                    }
                };
                if let Some(&mut Object::List(ref mut items)) = cx.scope.heap.get_mut(id) {
                    items.push(value);
                }
                *len += 1;
            }
            Kind::Tuple(ref mut slots) => slots.push(slot),
            Kind::Set { id, ref mut len } => {
                match slot {
                    // a tuple still waiting for a cycle through this set
                    Slot::Pending(p) => cx.scope.depend(p, Dependant::SetItem(id)),
                    Slot::Ready(value) => if cx.scope.add_key(id, &value, "set element")? {
                        if let Some(&mut Object::Set(ref mut items)) = cx.scope.heap.get_mut(id) {
                            items.push(value);
                        }
                    },
                }
                *len += 1;
            }
            Kind::FrozenSet { ref mut items, ref mut seen } => match slot {
                Slot::Pending(p) => items.push(Slot::Pending(p)),
                Slot::Ready(value) => {
                    let key = cx.scope.heap.to_hashable(&value)
                                           .ok_or_else(|| violation("unhashable set element"))?;
                    if seen.insert(key) {
                        items.push(Slot::Ready(value));
                    }
                }
            },
            Kind::Dict(ref mut d) => match d.key.take() {
                None => {
                    let key = match slot {
                        Slot::Ready(key) => {
                            if !cx.scope.add_key(d.id, &key, "dict key")? {
                                return Err(violation(format!("duplicate key '{}'", key_text(&key))));
                            }
                            match *constraint {
                                Some(Constraint::AttributeDict(ref attrs)) => {
                                    let (keep, c) = attrs.attr_constraint(&key_text(&key))?;
                                    d.keep = keep;
                                    d.value = c.cloned();
                                }
                                _ => d.keep = true,
                            }
                            Slot::Ready(key)
                        }
                        Slot::Pending(p) => {
                            if let Some(Constraint::AttributeDict(_)) = *constraint {
                                return Err(violation("attribute names must be strings"));
                            }
                            d.keep = true;
                            Slot::Pending(p)
                        }
                    };
                    d.key = Some(key);
                }
                Some(key) => if d.keep {
                    let (key, key_wait) = match cx.scope.settle(key) {
                        Slot::Ready(key) => (key, None),
                        Slot::Pending(p) => (Value::None, Some(p)),
                    };
                    let (value, value_wait) = match slot {
                        Slot::Ready(value) => (value, None),
                        Slot::Pending(p) => (Value::None, Some(p)),
                    };
                    let index = match cx.scope.heap.get_mut(d.id) {
                        Some(&mut Object::Dict(ref mut pairs)) => {
                            pairs.push((key, value));
                            pairs.len() - 1
                        }
                        _ => return Err(protocol("dict went missing")),
                    };
                    if let Some(p) = value_wait {
                        cx.scope.depend(p, Dependant::DictValue(d.id, index));
                    }
                    if let Some(p) = key_wait {
                        cx.scope.depend(p, Dependant::DictKey(d.id, index));
                    }
                    d.len += 1;
                },
            },
            Kind::Instance(ref mut s) => {
                if s.class.is_none() {
                    let class = text_of(&ready(slot, "expected a string")?)?;
                    if let Some(Constraint::Class(ref want)) = *constraint {
                        if *want != class {
                            return Err(violation(format!("is not an instance of {}", want)));
                        }
                    }
                    let taster = cx.options.get_taster();
                    if !taster.is_class_allowed(&class) || !taster.is_module_allowed(module_of(&class)) {
                        return Err(Error::Insecure(format!("Class not allowed: {}", class)));
                    }
                    if let Some(&mut Object::Instance { class: ref mut c, .. }) = cx.scope.heap.get_mut(s.id) {
                        *c = class.clone();
                    }
                    s.class = Some(class);
                    return Ok(());
                }
                match s.attr.take() {
                    None => {
                        let name = text_of(&ready(slot, "expected a string")?)?;
                        if s.names.contains(&name) {
                            return Err(violation(format!("duplicate attribute '{}'", name)));
                        }
                        match *constraint {
                            Some(Constraint::AttributeDict(ref attrs)) => {
                                let (keep, c) = attrs.attr_constraint(&name)?;
                                s.keep = keep;
                                s.value = c.cloned();
                            }
                            _ => {
                                s.keep = true;
                                s.value = None;
                            }
                        }
                        s.attr = Some(name);
                    }
                    Some(name) => {
                        if s.keep {
                            if let Some(&mut Object::Instance { ref mut state, .. }) = cx.scope.heap.get_mut(s.id) {
                                let index = state.len();
                                match slot {
                                    Slot::Ready(value) => state.push((name.clone(), value)),
                                    Slot::Pending(p) => {
                                        state.push((name.clone(), Value::None));
                                        s.pending += 1;
                                        cx.scope.depend(p, Dependant::Attr(s.id, index));
                                    }
                                }
                            }
                        }
                        s.names.push(name);
                    }
                }
            }
            Kind::Reference { ref mut refid, ref mut object } => match *refid {
                None => {
                    let id = int_of(&ready(slot, "expected a reference ID")?)? as u64;
                    if cx.scope.refs.contains_key(&id) {
                        return Err(violation("Multiple references with same ID"));
                    }
                    *refid = Some(id);
                }
                Some(id) => {
                    match (cx.scope.refs.get(&id).cloned(), slot.clone()) {
                        (None, _) => { cx.scope.refs.insert(id, slot.clone()); }
                        (Some(Slot::Pending(p)), Slot::Ready(value)) => {
                            cx.scope.resolve(p, value.clone());
                            cx.scope.refs.insert(id, Slot::Ready(value));
                        }
                        (Some(Slot::Pending(p)), Slot::Pending(q)) => {
                            cx.scope.depend(q, Dependant::Alias(p));
                        }
                        (Some(Slot::Ready(_)), _) => {}
                    }
                    *object = Some(slot);
                }
            },
            Kind::Dereference(ref mut target) => {
                let id = int_of(&ready(slot, "expected a reference ID")?)? as u64;
                let found = cx.scope.refs.get(&id).cloned().ok_or_else(
                    || violation(format!("dereference of unknown reference ID {}", id)))?;
                let found = cx.scope.settle(found);
                if let (&Slot::Ready(ref value), Some(c)) = (&found, effective(constraint.as_ref())) {
                    if value.failure().is_none() {
                        c.check_object(&cx.scope.heap, value)?;
                    }
                }
                *target = Some(found);
            }
            Kind::Method { ref mut name, ref mut parts } => match *name {
                None => *name = Some(text_of(&ready(slot, "expected a string")?)?),
                Some(_) => parts.push(slot),
            },
            Kind::Persistent(ref mut payload) => {
                *payload = Some(ready(slot, "unresolved reference in persistent payload")?);
            }
            Kind::Vocab { ref mut table, ref mut key } => match key.take() {
                None => {
                    let index = int_of(&ready(slot, "expected an index")?)? as u64;
                    if table.contains_key(&index) {
                        return Err(violation(format!("duplicate key '{}'", index)));
                    }
                    *key = Some(index);
                }
                Some(index) => match ready(slot, "expected a string")? {
                    Value::Bytes(b) => { table.insert(index, b); }
                    _ => return Err(protocol("VocabUnslicer only accepts STRING values")),
                },
            },
            Kind::Copyable { ref build, ref mut state, ref mut attr, ref mut value, .. } => match attr.take() {
                None => {
                    let name = text_of(&ready(slot, "expected a string")?)?;
                    if state.iter().any(|&(ref n, _)| *n == name) {
                        return Err(violation(format!("duplicate attribute '{}'", name)));
                    }
                    if build.is_some() {
                        *attr = Some((name, true));
                        return Ok(());
                    }
                    let attrs = Constraint::failure_attributes();
                    let (keep, c) = attrs.attr_constraint(&name)?;
                    *value = c.cloned();
                    *attr = Some((name, keep));
                }
                Some((name, keep)) => {
                    let v = ready(slot, "unresolved reference in a copyable")?;
                    if keep {
                        state.push((name, v));
                    }
                    *value = None;
                }
            },
            Kind::MyReference { ref mut clid, ref mut strings } => {
                let value = ready(slot, "expected a reference ID")?;
                match *clid {
                    None => *clid = Some(int_of(&value)?),
                    Some(_) => strings.push(text_of(&value)?),
                }
            }
            Kind::YourReference(ref mut clid) => {
                *clid = Some(int_of(&ready(slot, "expected a reference ID")?)?);
            }
            Kind::Call(ref mut c) => {
                if c.req_id.is_none() {
                    c.req_id = Some(int_of(&ready(slot, "expected a request ID")?)? as u64);
                } else if c.clid.is_none() {
                    c.clid = Some(int_of(&ready(slot, "expected an object ID")?)?);
                } else if c.method.is_none() {
                    let method = text_of(&ready(slot, "expected a method name")?)?;
                    let clid = c.clid.unwrap_or(0);
                    c.schema = cx.env.method_schema(clid, &method)?;
                    c.method = Some(method);
                } else {
                    match c.arg.take() {
                        None => {
                            let name = text_of(&ready(slot, "expected an argument name")?)?;
                            if c.args.iter().any(|&(ref n, _)| *n == name) {
                                return Err(protocol(format!("duplicate argument '{}'", name)));
                            }
                            let (keep, constraint) = match c.schema {
                                Some(ref schema) => {
                                    let (keep, constraint) = schema.arg_constraint(&name)?;
                                    (keep, constraint.cloned())
                                }
                                None => (true, None),
                            };
                            c.arg = Some((name, keep, constraint));
                        }
                        Some((name, keep, _)) => if keep {
                            c.args.push((name, slot));
                        },
                    }
                }
            }
            Kind::Answer { ref mut req_id, ref mut result } => match *req_id {
                None => {
                    let id = int_of(&ready(slot, "expected a request ID")?)? as u64;
                    *constraint = cx.env.response_constraint(id)?;
                    *req_id = Some(id);
                }
                Some(_) => *result = Some(slot),
            },
            Kind::Error { ref mut req_id, ref mut failure } => match *req_id {
                None => {
                    let id = int_of(&ready(slot, "expected a request ID")?)? as u64;
                    cx.env.response_constraint(id)?;
                    *req_id = Some(id);
                }
                Some(_) => *failure = Some(ready(slot, "unresolved reference in a failure")?),
            },
        }
        Ok(())
    }

    fn receive_close(&mut self, cx: &mut Context) -> Result<Closed> {
        let scope = &mut *cx.scope;
        let slot = match self.kind {
            Kind::Root => return Err(protocol("unbalanced CLOSE")),
            Kind::None => Slot::Ready(Value::None),
            Kind::Boolean(b) => Slot::Ready(Value::Bool(
                b.ok_or_else(|| violation("boolean without a value"))?)),
            Kind::Unicode(ref mut text) => Slot::Ready(Value::String(
                text.take().ok_or_else(|| violation("unicode without a value"))?)),
            Kind::Text(atom, ref mut text) => {
                let text = text.take().ok_or_else(|| violation(format!("{} without a name", atom.name())))?;
                let object = match atom {
                    Atom::Class => Object::Class(text),
                    Atom::Module => Object::Module(text),
                    Atom::Function => Object::Function(text),
                    _ => Object::Unpersistable(text),
                };
                Slot::Ready(Value::Obj(scope.heap.alloc(object)))
            }
            Kind::List { id, .. } | Kind::Set { id, .. } => Slot::Ready(Value::Obj(id)),
            Kind::Tuple(ref mut slots) => {
                if let Some(Constraint::TupleOf(ref elements)) = self.constraint {
                    if slots.len() != elements.len() {
                        return Err(violation("wrong size tuple"));
                    }
                }
                scope.build(BuildKind::Tuple, mem::take(slots))
            }
            Kind::FrozenSet { ref mut items, .. } => scope.build(BuildKind::FrozenSet, mem::take(items)),
            Kind::Dict(ref d) => {
                if d.key.is_some() {
                    return Err(violation("dict has a key without a value"));
                }
                Slot::Ready(Value::Obj(d.id))
            }
            Kind::Instance(ref s) => {
                if s.class.is_none() || s.attr.is_some() {
                    return Err(violation("incomplete instance"));
                }
                if let Some(Constraint::AttributeDict(ref attrs)) = self.constraint {
                    attrs.check_complete(s.names.iter().map(|n| n.as_str()))?;
                }
                let classes = &cx.options.classes;
                let build = s.class.as_deref().and_then(|class| classes.get(class));
                match build {
                    Some(build) => build_instance(scope, s, build)?,
                    None => Slot::Ready(Value::Obj(s.id)),
                }
            }
            Kind::Reference { ref mut object, .. } =>
                object.take().ok_or_else(|| violation("reference without an object"))?,
            Kind::Dereference(ref mut target) =>
                target.take().ok_or_else(|| violation("dereference without an ID"))?,
            Kind::Method { ref mut name, ref mut parts } => {
                if parts.len() != 2 {
                    return Err(violation("method needs a name, a receiver and a class"));
                }
                let name = name.take().ok_or_else(|| violation("method without a name"))?;
                scope.build(BuildKind::Method(name), mem::take(parts))
            }
            Kind::Persistent(ref mut payload) => {
                let payload = payload.take().ok_or_else(|| violation("persistent without a payload"))?;
                match cx.options.persistent_load {
                    Some(ref hook) => Slot::Ready(hook(&mut scope.heap, payload)?),
                    None => Slot::Ready(Value::Obj(scope.heap.alloc(Object::Persistent(payload)))),
                }
            }
            Kind::Vocab { ref mut table, key } => {
                if key.is_some() {
                    return Err(violation("vocabulary index without a string"));
                }
                return Ok(Closed::Top(Top::Vocab(mem::take(table))));
            }
            Kind::Copyable { ref class, ref build, ref mut state, ref attr, .. } => {
                if attr.is_some() {
                    return Err(violation("copyable attribute without a value"));
                }
                match *build {
                    Some(ref build) => Slot::Ready(build(&mut scope.heap, mem::take(state))?),
                    None => {
                        let object = Object::Instance { class: class.clone(), state: mem::take(state) };
                        Slot::Ready(Value::Obj(scope.heap.alloc(object)))
                    }
                }
            }
            Kind::MyReference { clid, ref mut strings } => {
                let clid = clid.ok_or_else(|| violation("my-reference without an ID"))?;
                let mut strings = mem::take(strings).into_iter();
                let remote = cx.env.remote_reference(clid, strings.next(), strings.next())?;
                let value = Value::Obj(scope.heap.alloc(Object::Remote(remote)));
                if let Some(c) = effective(self.constraint.as_ref()) {
                    c.check_object(&scope.heap, &value)?;
                }
                Slot::Ready(value)
            }
            Kind::YourReference(clid) => {
                let clid = clid.ok_or_else(|| violation("your-reference without an ID"))?;
                let local = cx.env.local_reference(clid)?;
                let value = Value::Obj(scope.heap.alloc(Object::Local(local)));
                if let Some(c) = effective(self.constraint.as_ref()) {
                    c.check_object(&scope.heap, &value)?;
                }
                Slot::Ready(value)
            }
            Kind::Call(ref mut c) => {
                let (req_id, clid, method) = match (c.req_id, c.clid, c.method.take()) {
                    (Some(r), Some(o), Some(m)) if c.arg.is_none() => (r, o, m),
                    _ => return Err(protocol("'call' sequence ended too early")),
                };
                if let Some(ref schema) = c.schema {
                    schema.check_args(c.args.iter().map(|&(ref n, _)| n.as_str()))?;
                }
                return Ok(Closed::Top(Top::Call {
                    req_id, clid, method, args: mem::take(&mut c.args), schema: c.schema.take(),
                }));
            }
            Kind::Answer { req_id, ref mut result } => {
                return match (req_id, result.take()) {
                    (Some(req_id), Some(result)) => Ok(Closed::Top(Top::Answer { req_id, result })),
                    _ => Err(protocol("'answer' sequence ended too early")),
                };
            }
            Kind::Error { req_id, ref mut failure } => {
                let (req_id, value) = match (req_id, failure.take()) {
                    (Some(r), Some(v)) => (r, v),
                    _ => return Err(protocol("'error' sequence ended too early")),
                };
                let failure = match scope.heap.deref(&value) {
                    Some(&Object::Instance { ref state, .. }) => CopiedFailure::from_state(&scope.heap, state)?,
                    _ => return Err(violation("error frame without a failure")),
                };
                return Ok(Closed::Top(Top::Error { req_id, failure }));
            }
        };
        Ok(Closed::Value(slot))
    }

    /// Can this frame keep going after a failure?  `child_failed` tells if
    /// the failure belongs to the child being received rather than to this
    /// frame.
    fn absorbs(&self, err: &Error, child_failed: bool) -> bool {
        if let Kind::Root = self.kind {
            return true;
        }
        if !child_failed || !matches!(*err, Error::Violation(_)) || self.constraint.is_some() {
            return false;
        }
        match self.kind {
            Kind::List { .. } | Kind::Tuple(_) | Kind::Set { .. } | Kind::FrozenSet { .. } => true,
            Kind::Dict(ref d) => d.key.is_some(),
            Kind::Instance(ref s) => s.attr.is_some(),
            _ => false,
        }
    }

    /// Keep a failure marker in the slot of the failed child.
    fn absorb(&mut self, err: &Error, scope: &mut Scope) {
        let marker = failure_value(err);
        match self.kind {
            Kind::List { id, ref mut len } => {
                if let Some(&mut Object::List(ref mut items)) = scope.heap.get_mut(id) {
                    items.push(marker);
                }
                *len += 1;
            }
            Kind::Tuple(ref mut slots) => slots.push(Slot::Ready(marker)),
            Kind::Set { id, ref mut len, .. } => {
                if let Some(&mut Object::Set(ref mut items)) = scope.heap.get_mut(id) {
                    items.push(marker);
                }
                *len += 1;
            }
            Kind::FrozenSet { ref mut items, .. } => items.push(Slot::Ready(marker)),
            Kind::Dict(ref mut d) => if let Some(key) = d.key.take() {
                if d.keep {
                    let (key, key_wait) = match scope.settle(key) {
                        Slot::Ready(key) => (key, None),
                        Slot::Pending(p) => (Value::None, Some(p)),
                    };
                    if let Some(&mut Object::Dict(ref mut pairs)) = scope.heap.get_mut(d.id) {
                        pairs.push((key, marker));
                        if let Some(p) = key_wait {
                            let index = pairs.len() - 1;
                            scope.depend(p, Dependant::DictKey(d.id, index));
                        }
                    }
                    d.len += 1;
                }
            },
            Kind::Instance(ref mut s) => if let Some(name) = s.attr.take() {
                if s.keep {
                    if let Some(&mut Object::Instance { ref mut state, .. }) = scope.heap.get_mut(s.id) {
                        state.push((name.clone(), marker));
                    }
                }
                s.names.push(name);
            },
            _ => {}
        }
    }

    /// Side effects of giving up this frame.  Returns true if the failure
    /// was reported to someone.
    fn failed(self, err: &Error, scope: &mut Scope, deliveries: &mut Vec<Delivery>) -> bool {
        match self.kind {
            Kind::Call(ref c) => match c.req_id {
                // the sender knows about an ABORT, no need to answer
                Some(req_id) if !is_abort(err) => {
                    deliveries.push(Delivery::CallFailed { req_id, error: duplicate(err) });
                    true
                }
                _ => false,
            },
            Kind::Answer { req_id: Some(req_id), .. } | Kind::Error { req_id: Some(req_id), .. } => {
                deliveries.push(Delivery::AnswerFailed { req_id, error: duplicate(err) });
                true
            }
            Kind::Reference { refid: Some(refid), .. } => {
                if let Some(Slot::Pending(p)) = scope.refs.get(&refid).cloned() {
                    scope.resolve(p, failure_value(err));
                }
                false
            }
            _ => false,
        }
    }

    fn describe(&self) -> String {
        match self.kind {
            Kind::Root => "root".into(),
            Kind::None => "<None>".into(),
            Kind::Boolean(_) => "<bool>".into(),
            Kind::Unicode(_) => "<unicode>".into(),
            Kind::Text(atom, _) => format!("<{}>", atom.name()),
            Kind::List { len, .. } | Kind::Set { len, .. } => format!("[{}]", len),
            Kind::Tuple(ref slots) => format!("[{}]", slots.len()),
            Kind::FrozenSet { ref items, .. } => format!("[{}]", items.len()),
            Kind::Dict(ref d) => match d.key {
                Some(Slot::Ready(ref key)) => format!("{{}}[{}]", key_text(key)),
                Some(Slot::Pending(_)) => "{}[?]".into(),
                None => "{}".into(),
            },
            Kind::Instance(ref s) => {
                let class = s.class.as_deref().unwrap_or("??");
                match s.attr {
                    Some(ref attr) => format!("<{}>.{}", class, attr),
                    None => format!("<{}>", class),
                }
            }
            Kind::Reference { refid: Some(refid), .. } => format!("<reference-{}>", refid),
            Kind::Reference { refid: None, .. } => "<reference-?>".into(),
            Kind::Dereference(_) => "<dereference>".into(),
            Kind::Method { .. } => "<method>".into(),
            Kind::Persistent(_) => "<persistent>".into(),
            Kind::Vocab { .. } => "<vocabdict>".into(),
            Kind::Copyable { ref class, ref attr, .. } => match *attr {
                Some((ref name, _)) => format!("<{}>.{}", class, name),
                None => format!("<{}>", class),
            },
            Kind::MyReference { clid: Some(clid), .. } => format!("<ref-{}>", clid),
            Kind::MyReference { clid: None, .. } => "<ref-?>".into(),
            Kind::YourReference(Some(clid)) => format!("<your-ref-{}>", clid),
            Kind::YourReference(None) => "<your-ref-?>".into(),
            Kind::Call(ref c) => {
                let mut s = String::from("<methodcall");
                if let Some(req_id) = c.req_id {
                    s.push_str(&format!(" reqID={}", req_id));
                }
                if let Some(ref method) = c.method {
                    s.push_str(&format!(" .{}", method));
                }
                if let Some((ref name, _, _)) = c.arg {
                    s.push_str(&format!(" arg[{}]", name));
                }
                s.push('>');
                s
            }
            Kind::Answer { req_id: Some(req_id), .. } => format!("Answer(req={})", req_id),
            Kind::Answer { req_id: None, .. } => "Answer(req=?)".into(),
            Kind::Error { req_id: Some(req_id), .. } => format!("<error-{}>", req_id),
            Kind::Error { req_id: None, .. } => "<error-?>".into(),
        }
    }
}

/// The frame stack of one receiving connection.
pub(crate) struct Unjellier {
    mode: Mode,
    options: UnjellyOptions,
    stack: Vec<Frame>,
    scope: Scope,
    /// Number of CLOSE tokens still to be dropped.
    discard: u64,
    deliveries: Vec<Delivery>,
    vocabulary: Option<BTreeMap<u64, Vec<u8>>>,
}

impl Unjellier {
    pub fn new(mode: Mode, options: UnjellyOptions) -> Unjellier {
        let constraint = match mode {
            Mode::Jelly => effective(options.constraint.as_ref()).cloned(),
            Mode::Broker => None,
        };
        Unjellier {
            mode, options,
            stack: vec![Frame { open_count: 0, constraint, kind: Kind::Root }],
            scope: Scope::default(),
            discard: 0,
            deliveries: Vec::new(),
            vocabulary: None,
        }
    }

    pub fn discarding(&self) -> bool {
        self.discard > 0
    }

    /// An OPEN arrived inside a discarded sequence.
    pub fn discard_open(&mut self) {
        self.discard += 1;
    }

    /// Consume a CLOSE of a discarded sequence, if any.
    pub fn discard_close(&mut self) -> bool {
        if self.discard > 0 {
            self.discard -= 1;
            true
        } else {
            false
        }
    }

    pub fn take_deliveries(&mut self) -> Vec<Delivery> {
        mem::take(&mut self.deliveries)
    }

    /// A vocabulary table that arrived since the last call.
    pub fn take_vocabulary(&mut self) -> Option<BTreeMap<u64, Vec<u8>>> {
        self.vocabulary.take()
    }

    /// Number of open sequences.
    pub fn depth(&self) -> usize {
        self.stack.len() - 1
    }

    /// Check a token of the OPEN index phase.
    pub fn check_index_token(&self, typebyte: u8, size: u64, opentype: &[Vec<u8>]) -> Result<()> {
        match typebyte {
            VOCAB => Ok(()),
            STRING => {
                if opentype.is_empty() {
                    let max = max_index_length().max(self.options.classes.longest()) as u64;
                    if size > max {
                        return Err(violation(format!("STRING token is too long, {}>{}", size, max)));
                    }
                } else if opentype.len() == 1 && opentype[0] == COPYABLE_ATOM.as_bytes() {
                    let max = self.options.classes.longest() as u64;
                    if size > max {
                        return Err(violation(format!(
                            "copyable-classname token is too long, {}>{}", size, max)));
                    }
                }
                Ok(())
            }
            other => Err(violation(format!("index token 0x{:02x} not STRING or VOCAB", other))),
        }
    }

    pub fn check_token(&self, typebyte: u8, size: u64) -> Result<()> {
        match self.stack.last() {
            Some(top) => top.check_token(typebyte, size, self.mode),
            None => Err(protocol("empty receive stack")),
        }
    }

    /// Handle one index token.  Returns false while more index tokens are
    /// needed.
    pub fn handle_open(&mut self, open_count: u64, opentype: &[Vec<u8>]) -> Result<bool> {
        let child = match self.open_child(open_count, opentype) {
            Ok(Some(child)) => child,
            Ok(None) => return Ok(false),
            Err(e) => {
                if !is_rejection(&e) {
                    return Err(e);
                }
                self.handle_violation(e, true, false)?;
                return Ok(true);
            }
        };
        let parent = self.stack.len() - 1;
        if let Kind::Reference { refid: Some(refid), .. } = self.stack[parent].kind {
            let slot = match child.early_value() {
                Some(value) => Slot::Ready(value),
                None => Slot::Pending(self.scope.placeholder()),
            };
            self.scope.refs.insert(refid, slot);
        }
        self.stack.push(child);
        Ok(true)
    }

    fn open_child(&mut self, open_count: u64, opentype: &[Vec<u8>]) -> Result<Option<Frame>> {
        let name = opentype.first().ok_or_else(|| protocol("empty OPEN type"))?;
        let (atom, mut tag) = match Atom::parse(name) {
            Some(atom) => (atom, None),
            None => {
                // a registered class tag opens a copyable of that class
                let tag = String::from_utf8_lossy(name).into_owned();
                if tag == FAILURE_CLASS || self.options.classes.get(&tag).is_none() {
                    return Err(Error::Banana(ErrorCode::UnknownOpenType(tag)));
                }
                (Atom::Copyable, Some(tag))
            }
        };
        let at_top = self.stack.len() == 1;
        let allowed = match (self.mode, at_top) {
            (_, true) if atom == Atom::Vocab => true,
            (_, false) if atom == Atom::Vocab => false,
            (Mode::Broker, true) => atom == Atom::Call || atom == Atom::Answer || atom == Atom::Error,
            (Mode::Broker, false) =>
                atom.is_jelly() || atom == Atom::Copyable ||
                atom == Atom::MyReference || atom == Atom::YourReference,
            (Mode::Jelly, _) => atom.is_jelly() || atom == Atom::Copyable,
        };
        if !allowed {
            return Err(violation(format!("unacceptable OPEN type '{}'", atom.name())));
        }
        let top = &self.stack[self.stack.len() - 1];
        let constraint = match top.child_constraint() {
            Some(c) => {
                c.check_opentype(atom.name())?;
                narrow(c, atom)
            }
            None => None,
        };
        if atom == Atom::Copyable && tag.is_none() {
            let class = match opentype.get(1) {
                None => return Ok(None),
                Some(class) => String::from_utf8_lossy(class).into_owned(),
            };
            if !self.options.classes.contains(&class) {
                return Err(violation(format!("unknown RemoteCopy class '{}'", class)));
            }
            tag = Some(class);
        }
        if atom.is_jelly() && !self.options.get_taster().is_type_allowed(atom.name()) {
            return Err(Error::Insecure(format!("Type not allowed: {}", atom.name())));
        }
        let mut frame = Frame::open(atom, open_count, constraint, &mut self.scope);
        if let Some(tag) = tag {
            if let Kind::Copyable { ref mut class, ref mut build, .. } = frame.kind {
                *build = self.options.classes.get(&tag).cloned();
                *class = tag;
            }
        }
        Ok(Some(frame))
    }

    /// A complete scalar token.
    pub fn handle_token(&mut self, value: Value, env: &mut dyn Environment) -> Result<()> {
        self.receive(Closed::Value(Slot::Ready(value)), env)
    }

    pub fn handle_close(&mut self, close_count: u64, env: &mut dyn Environment) -> Result<()> {
        let top = self.stack.len() - 1;
        if top == 0 {
            return Err(protocol("CLOSE without an open sequence"));
        }
        let expected = self.stack[top].open_count;
        if close_count != expected {
            return Err(Error::Banana(ErrorCode::LostSync(close_count, expected)));
        }
        let closed = {
            let mut cx = Context { scope: &mut self.scope, env, options: &self.options };
            self.stack[top].receive_close(&mut cx)
        };
        let closed = match closed {
            Ok(closed) => closed,
            Err(e) => {
                if !is_rejection(&e) {
                    return Err(e);
                }
                return self.handle_violation(e, false, true);
            }
        };
        self.stack.pop();
        self.receive(closed, env)
    }

    /// Report a rejected token.  `in_open` is set if it belonged to the
    /// index phase of a sequence that will now be dropped.
    pub fn reject(&mut self, err: Error, in_open: bool) -> Result<()> {
        self.handle_violation(err, in_open, false)
    }

    fn receive(&mut self, closed: Closed, env: &mut dyn Environment) -> Result<()> {
        let result = if self.stack.len() == 1 {
            self.finish_top(closed)
        } else {
            let top = self.stack.len() - 1;
            let mut cx = Context { scope: &mut self.scope, env, options: &self.options };
            match closed {
                Closed::Value(slot) => self.stack[top].receive(slot, &mut cx),
                Closed::Top(_) => Err(protocol("PB frame below top level")),
            }
        };
        match result {
            Err(e) => {
                if !is_rejection(&e) {
                    return Err(e);
                }
                self.handle_violation(e, false, false)
            }
            Ok(()) => Ok(()),
        }
    }

    /// A top-level object is complete.
    fn finish_top(&mut self, closed: Closed) -> Result<()> {
        let scope = mem::take(&mut self.scope);
        let delivery = match closed {
            Closed::Value(slot) => {
                if self.mode == Mode::Broker {
                    return Err(protocol("top-level must be OPEN"));
                }
                match scope.finish(slot) {
                    Ok(graph) => Delivery::Object(graph),
                    Err(v) => Delivery::Rejected(Error::Violation(located(v, "root"))),
                }
            }
            Closed::Top(Top::Vocab(table)) => {
                self.vocabulary = Some(table);
                return Ok(());
            }
            Closed::Top(Top::Call { req_id, clid, method, args, schema }) => {
                let mut named = BTreeMap::new();
                let mut error = scope.complete().err();
                for (name, slot) in args {
                    match scope.value(slot) {
                        Ok(value) => { named.insert(name, value); }
                        Err(v) => error = Some(v),
                    }
                }
                match error {
                    Some(v) => Delivery::CallFailed {
                        req_id, error: Error::Violation(located(v, "root")),
                    },
                    None => Delivery::Call {
                        req_id, clid, method, schema,
                        args: Arguments { heap: scope.heap, named },
                    },
                }
            }
            Closed::Top(Top::Answer { req_id, result }) => match scope.finish(result) {
                Ok(result) => Delivery::Answer { req_id, result },
                Err(v) => Delivery::AnswerFailed {
                    req_id, error: Error::Violation(located(v, "root")),
                },
            },
            Closed::Top(Top::Error { req_id, failure }) => Delivery::Error { req_id, failure },
        };
        self.deliveries.push(delivery);
        Ok(())
    }

    fn describe(&self, frames: usize) -> String {
        self.stack[..frames].iter().map(|f| f.describe()).collect::<Vec<_>>().join(".")
    }

    /// Route a rejection down the stack until a frame absorbs it.
    fn handle_violation(&mut self, mut err: Error, in_open: bool, mut in_close: bool) -> Result<()> {
        if in_open {
            // the would-be child was never pushed; drop its CLOSE
            self.discard += 1;
        }
        let top = self.stack.len() - 1;
        let absorber = (0..=top).rev()
            .find(|&i| self.stack[i].absorbs(&err, if i == top { in_open } else { true }))
            .unwrap_or(0);
        let location = if absorber == 0 {
            self.describe(self.stack.len())
        } else {
            self.describe(absorber + 1)
        };
        if let Error::Violation(ref mut v) = err {
            v.set_location(&location);
        }
        warn!("{}", err);
        let mut reported = false;
        while self.stack.len() > absorber + 1 {
            if !in_close {
                self.discard += 1;
            }
            in_close = false;
            if let Some(frame) = self.stack.pop() {
                reported |= frame.failed(&err, &mut self.scope, &mut self.deliveries);
            }
        }
        if absorber == 0 {
            self.scope = Scope::default();
            if !reported {
                self.deliveries.push(Delivery::Rejected(err));
            }
        } else {
            self.stack[absorber].absorb(&err, &mut self.scope);
        }
        Ok(())
    }
}

/// Run the constructor of a registered class on a received instance.
fn build_instance(scope: &mut Scope, s: &InstanceState, build: &Unjellyable) -> Result<Slot> {
    let class = s.class.as_deref().unwrap_or("??");
    if s.pending > 0 {
        return Err(violation(format!("{} can not be built from unresolved attributes", class)));
    }
    let state = match scope.heap.get_mut(s.id) {
        Some(&mut Object::Instance { ref mut state, .. }) => mem::take(state),
        _ => Vec::new(),
    };
    let built = build(&mut scope.heap, state)?;
    Ok(match built {
        Value::Obj(id) if id != s.id => {
            let object = scope.heap.get(id).cloned();
            if let (Some(object), Some(slot)) = (object, scope.heap.get_mut(s.id)) {
                *slot = object;
            }
            Slot::Ready(Value::Obj(s.id))
        }
        other => Slot::Ready(other),
    })
}

fn located(mut violation: Violation, location: &str) -> Violation {
    violation.set_location(location);
    violation
}

/// Unjelly one object from a token sequence.
pub fn unjelly(tokens: &[Token], options: &UnjellyOptions) -> Result<Graph> {
    unjelly_from_slice(&crate::tokens::tokens_to_vec(tokens)?, options)
}

/// Unjelly one object from Banana bytes.  Data after the first object is
/// ignored.
pub fn unjelly_from_slice(data: &[u8], options: &UnjellyOptions) -> Result<Graph> {
    let mut decoder = crate::banana::Decoder::new(options.clone());
    match decoder.feed(data)?.into_iter().next() {
        Some(result) => result,
        None => Err(Error::Banana(ErrorCode::Protocol("no complete object in input".into()))),
    }
}
