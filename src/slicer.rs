// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! # Jelly serialization
//!
//! Turning a graph into tokens happens in two passes.  The first pass walks
//! the graph depth-first with an explicit stack and builds an arena of
//! frames, one per opened sequence.  Every container is *prepared* when it
//! is first seen: it gets a reference id and its frame is remembered.  When
//! the same object shows up again, the remembered frame is *cooked*: it is
//! marked to be wrapped in `reference <id>`, and the new occurrence becomes a
//! `dereference <id>` sequence.  Since the frame may still be in the middle
//! of being filled (the object contains itself), cooking only flags the
//! frame; the wrapping is written out by the second pass, which flattens the
//! arena into tokens and assigns open ids.

use std::fmt;
use std::sync::Arc;
use std::collections::BTreeMap;

use crate::consts::*;
use crate::error::{Error, Result, Violation};
use crate::referenceable::{LocalReference, RemoteReference};
use crate::taster::{module_of, SecurityOptions, Taster};
use crate::tokens::Token;
use crate::value::{Graph, Heap, Object, ObjId, Value};

/// Hook asked for every instance; returning a payload replaces the instance
/// with a `persistent` sequence carrying it.
pub type PersistentStore = Arc<dyn Fn(&Heap, &Value) -> Option<Value> + Send + Sync>;

/// Options for jellying.
#[derive(Clone)]
pub struct JellyOptions {
    taster: Arc<dyn Taster>,
    persistent_store: Option<PersistentStore>,
}

impl JellyOptions {
    /// Construct with the default security policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `taster` instead of the default security policy.
    pub fn taster<T: Taster + 'static>(mut self, taster: T) -> Self {
        self.taster = Arc::new(taster);
        self
    }

    /// Share a policy between several codecs.
    pub fn shared_taster(mut self, taster: Arc<dyn Taster>) -> Self {
        self.taster = taster;
        self
    }

    pub fn persistent_store<F>(mut self, hook: F) -> Self
        where F: Fn(&Heap, &Value) -> Option<Value> + Send + Sync + 'static
    {
        self.persistent_store = Some(Arc::new(hook));
        self
    }

    pub(crate) fn get_taster(&self) -> &dyn Taster {
        &*self.taster
    }
}

impl Default for JellyOptions {
    fn default() -> Self {
        JellyOptions {
            taster: Arc::new(SecurityOptions::default()),
            persistent_store: None,
        }
    }
}

impl fmt::Debug for JellyOptions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("JellyOptions")
         .field("taster", &self.taster)
         .field("persistent_store", &self.persistent_store.is_some())
         .finish()
    }
}

/// Lets a broker assign connection-local ids to references.
pub(crate) trait SliceEnvironment {
    /// Returns the clid, and on the first send the interface name and url.
    fn my_reference(&mut self, local: &LocalReference) -> (i64, Option<(String, Option<String>)>);
    fn your_reference(&mut self, remote: &RemoteReference) -> Result<i64>;
}

pub(crate) type FrameId = usize;

/// One element of a frame body.
#[derive(Debug)]
pub(crate) enum Piece {
    Token(Token),
    Frame(FrameId),
}

#[derive(Debug)]
struct Frame {
    atom: &'static str,
    /// Set when the object turned out to be shared.
    refid: Option<u64>,
    body: Vec<Piece>,
}

enum Child {
    Token(Token),
    Value(Value),
}

/// The first pass: builds the frame arena for one top-level scope.
pub(crate) struct Jellier<'a> {
    heap: &'a Heap,
    options: &'a JellyOptions,
    env: Option<&'a mut dyn SliceEnvironment>,
    arena: Vec<Frame>,
    preserved: BTreeMap<ObjId, (FrameId, u64)>,
    next_refid: u64,
}

impl<'a> Jellier<'a> {
    pub fn new(heap: &'a Heap, options: &'a JellyOptions,
               env: Option<&'a mut dyn SliceEnvironment>) -> Jellier<'a> {
        Jellier {
            heap, options, env,
            arena: Vec::new(),
            preserved: BTreeMap::new(),
            next_refid: 1,
        }
    }

    /// Start a frame that the caller fills itself (used for PB frames).
    pub fn open_frame(&mut self, atom: &'static str) -> FrameId {
        self.new_frame(atom, Vec::new())
    }

    pub fn push_token(&mut self, frame: FrameId, token: Token) {
        self.arena[frame].body.push(Piece::Token(token));
    }

    pub fn push_frame(&mut self, frame: FrameId, child: FrameId) {
        self.arena[frame].body.push(Piece::Frame(child));
    }

    /// Slice `value` and append it to `frame`.
    pub fn push_value(&mut self, frame: FrameId, value: &Value) -> Result<()> {
        let piece = self.slice(value, false)?;
        self.arena[frame].body.push(piece);
        Ok(())
    }

    fn new_frame(&mut self, atom: &'static str, body: Vec<Piece>) -> FrameId {
        self.arena.push(Frame { atom, refid: None, body });
        self.arena.len() - 1
    }

    fn text_frame(&mut self, atom: &'static str, text: &str) -> Piece {
        Piece::Frame(self.new_frame(atom, vec![Piece::Token(Token::String(text.as_bytes().to_vec()))]))
    }

    fn check_type(&self, type_name: &str, value: &Value) -> Result<()> {
        if self.options.get_taster().is_type_allowed(type_name) {
            Ok(())
        } else {
            Err(Error::Insecure(format!("Type not allowed for object: {} {}",
                                        type_name, self.heap.show(value))))
        }
    }

    /// Slice one value and everything reachable from it.
    pub fn slice(&mut self, value: &Value, top: bool) -> Result<Piece> {
        let (piece, work) = self.start(value, top)?;
        let mut stack: Vec<(FrameId, Vec<Child>)> = work.into_iter().collect();
        loop {
            let (frame, next) = match stack.last_mut() {
                Some(&mut (frame, ref mut todo)) => (frame, todo.pop()),
                None => break,
            };
            match next {
                Some(Child::Token(token)) => self.arena[frame].body.push(Piece::Token(token)),
                Some(Child::Value(child)) => {
                    let (piece, work) = self.start(&child, false)?;
                    self.arena[frame].body.push(piece);
                    if let Some(work) = work {
                        stack.push(work);
                    }
                }
                None => { stack.pop(); }
            }
        }
        Ok(piece)
    }

    /// Produce the piece for `value`; for containers, also the frame whose
    /// children still have to be sliced (in reverse order).
    fn start(&mut self, value: &Value, top: bool) -> Result<(Piece, Option<(FrameId, Vec<Child>)>)> {
        let piece = match *value {
            Value::None => {
                self.check_type("None", value)?;
                Piece::Frame(self.new_frame(NONE_ATOM, Vec::new()))
            }
            Value::Bool(b) => {
                self.check_type("boolean", value)?;
                Piece::Frame(self.new_frame(BOOLEAN_ATOM, vec![Piece::Token(Token::Int(b as i64))]))
            }
            Value::I64(i) => {
                self.check_type("int", value)?;
                Piece::Token(Token::Int(i))
            }
            Value::Int(ref i) => {
                self.check_type("long", value)?;
                Piece::Token(Token::Long(i.clone()))
            }
            Value::F64(f) => {
                self.check_type("float", value)?;
                Piece::Token(Token::Float(f))
            }
            Value::Bytes(ref b) => {
                self.check_type("string", value)?;
                Piece::Token(Token::String(b.clone()))
            }
            Value::String(ref s) => {
                self.check_type("unicode", value)?;
                self.text_frame(UNICODE_ATOM, s)
            }
            Value::Failure(ref v) => self.text_frame(UNPERSISTABLE_ATOM, &v.to_string()),
            Value::Obj(id) => return self.start_object(id, value, top),
        };
        Ok((piece, None))
    }

    fn start_object(&mut self, id: ObjId, value: &Value, top: bool)
                    -> Result<(Piece, Option<(FrameId, Vec<Child>)>)> {
        if let Some(&(frame, refid)) = self.preserved.get(&id) {
            self.arena[frame].refid = Some(refid);
            let deref = self.new_frame(DEREFERENCE_ATOM, vec![Piece::Token(Token::Int(refid as i64))]);
            return Ok((Piece::Frame(deref), None));
        }
        let heap = self.heap;
        let options = self.options;
        let object = heap.get(id).ok_or_else(
            || Error::Violation(Violation::new(format!("dangling object #{}", id.index()))))?;
        let taster = options.get_taster();
        match *object {
            Object::Remote(_) | Object::Local(_) => {}
            _ => self.check_type(object.type_name(), value)?,
        }
        let (atom, children) = match *object {
            Object::Remote(ref remote) => return self.remote(remote).map(|p| (p, None)),
            Object::Local(ref local) => return Ok((self.local(local), None)),
            Object::Unpersistable(ref why) => {
                return Ok((self.text_frame(UNPERSISTABLE_ATOM, why), None));
            }
            Object::Class(ref name) => {
                if !taster.is_module_allowed(module_of(name)) || !taster.is_class_allowed(name) {
                    return Err(Error::Insecure(format!("Class not allowed: {}", name)));
                }
                return Ok((self.text_frame(CLASS_ATOM, name), None));
            }
            Object::Module(ref name) => {
                if !taster.is_module_allowed(name) {
                    return Err(Error::Insecure(format!("Module not allowed: {}", name)));
                }
                return Ok((self.text_frame(MODULE_ATOM, name), None));
            }
            Object::Function(ref name) => {
                if !taster.is_module_allowed(module_of(name)) {
                    return Err(Error::Insecure(format!("Module not allowed: {}", module_of(name))));
                }
                return Ok((self.text_frame(FUNCTION_ATOM, name), None));
            }
            Object::List(ref items) => (LIST_ATOM, values(items)),
            Object::Tuple(ref items) => (TUPLE_ATOM, values(items)),
            Object::Set(ref items) => (SET_ATOM, values(items)),
            Object::FrozenSet(ref items) => (FROZENSET_ATOM, values(items)),
            Object::Dict(ref pairs) => (DICT_ATOM, pairs.iter().flat_map(|&(ref k, ref v)| {
                vec![Child::Value(k.clone()), Child::Value(v.clone())]
            }).collect()),
            Object::Instance { ref class, ref state } => {
                if !taster.is_class_allowed(class) || !taster.is_module_allowed(module_of(class)) {
                    if top {
                        return Err(Error::Insecure(format!("Class not allowed: {}", class)));
                    }
                    let why = format!("instance of class {} deemed insecure", class);
                    return Ok((self.text_frame(UNPERSISTABLE_ATOM, &why), None));
                }
                let stored = options.persistent_store.as_ref().and_then(|hook| hook(heap, value));
                match stored {
                    Some(payload) => (PERSISTENT_ATOM, vec![Child::Value(payload)]),
                    None => {
                        let mut children = vec![Child::Token(Token::String(class.as_bytes().to_vec()))];
                        for &(ref name, ref v) in state {
                            children.push(Child::Token(Token::String(name.as_bytes().to_vec())));
                            children.push(Child::Value(v.clone()));
                        }
                        (INSTANCE_ATOM, children)
                    }
                }
            }
            Object::Method { ref name, ref receiver, ref class } => (METHOD_ATOM, vec![
                Child::Token(Token::String(name.as_bytes().to_vec())),
                Child::Value(receiver.clone()),
                Child::Value(class.clone()),
            ]),
            Object::Persistent(ref payload) => (PERSISTENT_ATOM, vec![Child::Value(payload.clone())]),
        };
        let frame = self.new_frame(atom, Vec::new());
        self.preserved.insert(id, (frame, self.next_refid));
        self.next_refid += 1;
        let mut children = children;
        children.reverse();
        Ok((Piece::Frame(frame), Some((frame, children))))
    }

    fn local(&mut self, local: &LocalReference) -> Piece {
        let env = match self.env {
            Some(ref mut env) => env,
            None => return self.text_frame(UNPERSISTABLE_ATOM, "references need a broker"),
        };
        let (clid, first) = env.my_reference(local);
        let mut body = vec![Piece::Token(Token::Int(clid))];
        if let Some((iname, url)) = first {
            body.push(Piece::Token(Token::String(iname.into_bytes())));
            if let Some(url) = url {
                body.push(Piece::Token(Token::String(url.into_bytes())));
            }
        }
        Piece::Frame(self.new_frame(MY_REFERENCE, body))
    }

    fn remote(&mut self, remote: &RemoteReference) -> Result<Piece> {
        let clid = match self.env {
            Some(ref mut env) => env.your_reference(remote)?,
            None => return Ok(self.text_frame(UNPERSISTABLE_ATOM, "references need a broker")),
        };
        Ok(Piece::Frame(self.new_frame(YOUR_REFERENCE, vec![Piece::Token(Token::Int(clid))])))
    }

    /// Second pass: write `root` out as tokens, numbering OPENs from
    /// `*counter` on.
    pub fn flatten(&self, root: &Piece, counter: &mut u64, out: &mut Vec<Token>) {
        enum Step<'p> { Piece(&'p Piece), Close(u64) }
        let mut stack = vec![Step::Piece(root)];
        while let Some(step) = stack.pop() {
            let frame = match step {
                Step::Close(id) => { out.push(Token::Close(id)); continue; }
                Step::Piece(&Piece::Token(ref token)) => { out.push(token.clone()); continue; }
                Step::Piece(&Piece::Frame(frame)) => &self.arena[frame],
            };
            if let Some(refid) = frame.refid {
                let id = next_open(counter);
                out.push(Token::Open(id));
                out.push(Token::String(REFERENCE_ATOM.as_bytes().to_vec()));
                out.push(Token::Int(refid as i64));
                stack.push(Step::Close(id));
            }
            let id = next_open(counter);
            out.push(Token::Open(id));
            out.push(Token::String(frame.atom.as_bytes().to_vec()));
            stack.push(Step::Close(id));
            for piece in frame.body.iter().rev() {
                stack.push(Step::Piece(piece));
            }
        }
    }
}

fn next_open(counter: &mut u64) -> u64 {
    let id = *counter;
    *counter += 1;
    id
}

fn values(items: &[Value]) -> Vec<Child> {
    items.iter().cloned().map(Child::Value).collect()
}

/// Jelly a graph into tokens.  Open ids start at 0.
pub fn jelly(graph: &Graph, options: &JellyOptions) -> Result<Vec<Token>> {
    let mut jellier = Jellier::new(&graph.heap, options, None);
    let root = jellier.slice(&graph.root, true)?;
    let mut tokens = Vec::new();
    jellier.flatten(&root, &mut 0, &mut tokens);
    Ok(tokens)
}

/// Jelly a graph directly into Banana bytes.
pub fn jelly_to_vec(graph: &Graph, options: &JellyOptions) -> Result<Vec<u8>> {
    crate::tokens::tokens_to_vec(&jelly(graph, options)?)
}
