// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Jelly values and the object heap they live in.
//!
//! Scalars are stored inline in a `Value`.  Everything that can be shared or
//! be part of a cycle (containers, instances, references) lives in a `Heap`
//! and is referred to by `Value::Obj`.  Two slots holding the same `ObjId`
//! hold the *identical* object, which is what back-references preserve.

use std::fmt;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive};

pub use crate::value_impls::{to_graph, from_graph};

use crate::error::Violation;
use crate::referenceable::{LocalReference, RemoteReference};

/// Index of an object in its `Heap`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjId(pub(crate) usize);

impl ObjId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A slot value.
///
/// Note on integers: the wire has no fixed integer width.  While decoding,
/// we put all integers that fit into an i64 into `I64`, and use `BigInt` for
/// the rest.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// None
    None,
    /// Boolean
    Bool(bool),
    /// Short integer
    I64(i64),
    /// Long integer (unbounded length)
    Int(BigInt),
    /// Float
    F64(f64),
    /// Byte string (a Banana STRING)
    Bytes(Vec<u8>),
    /// Unicode string
    String(String),
    /// A heap object
    Obj(ObjId),
    /// Marker left in place of a subtree that failed to decode
    Failure(Box<Violation>),
}

impl Value {
    pub fn obj_id(&self) -> Option<ObjId> {
        match *self {
            Value::Obj(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::I64(i) => Some(i),
            Value::Int(ref i) => i.to_i64(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match *self {
            Value::Bytes(ref b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match *self {
            Value::String(ref s) => Some(s),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&Violation> {
        match *self {
            Value::Failure(ref v) => Some(v),
            _ => None,
        }
    }

    /// Normalize a big integer into `I64` if it fits.
    pub fn from_bigint(i: BigInt) -> Value {
        match i.to_i64() {
            Some(small) => Value::I64(small),
            None => Value::Int(i),
        }
    }
}

/// Objects that live in a `Heap`.
#[derive(Clone, Debug)]
pub enum Object {
    List(Vec<Value>),
    Tuple(Vec<Value>),
    /// Dictionary, in wire order.  Keys are unique.
    Dict(Vec<(Value, Value)>),
    Set(Vec<Value>),
    FrozenSet(Vec<Value>),
    /// Instance of a class named by its qualified name, with its state.
    Instance { class: String, state: Vec<(String, Value)> },
    Class(String),
    Module(String),
    Function(String),
    /// A bound method, kept in its wire shape.
    Method { name: String, receiver: Value, class: Value },
    /// Opaque payload produced by a persistent-store hook.
    Persistent(Value),
    Unpersistable(String),
    /// Handle for an object living on the other side of a broker.
    Remote(RemoteReference),
    /// A local object to be exposed by reference.
    Local(LocalReference),
}

impl Object {
    /// The type name the security taster knows this object by.
    pub fn type_name(&self) -> &'static str {
        match *self {
            Object::List(_) => "list",
            Object::Tuple(_) => "tuple",
            Object::Dict(_) => "dictionary",
            Object::Set(_) => "set",
            Object::FrozenSet(_) => "frozenset",
            Object::Instance { .. } => "instance",
            Object::Class(_) => "class",
            Object::Module(_) => "module",
            Object::Function(_) => "function",
            Object::Method { .. } => "method",
            Object::Persistent(_) => "persistent",
            Object::Unpersistable(_) => "unpersistable",
            Object::Remote(_) => "remote-reference",
            Object::Local(_) => "local-reference",
        }
    }

    /// Mutable containers can be filled in after allocation; they can
    /// close a cycle.
    pub fn is_mutable(&self) -> bool {
        match *self {
            Object::List(_) | Object::Dict(_) | Object::Set(_) |
            Object::Instance { .. } => true,
            _ => false,
        }
    }
}

/// Arena of objects for one object graph.
#[derive(Clone, Debug, Default)]
pub struct Heap {
    objects: Vec<Object>,
}

impl Heap {
    pub fn new() -> Heap {
        Heap { objects: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn alloc(&mut self, object: Object) -> ObjId {
        self.objects.push(object);
        ObjId(self.objects.len() - 1)
    }

    pub fn get(&self, id: ObjId) -> Option<&Object> {
        self.objects.get(id.0)
    }

    pub fn get_mut(&mut self, id: ObjId) -> Option<&mut Object> {
        self.objects.get_mut(id.0)
    }

    /// The object a value points at, if any.
    pub fn deref(&self, value: &Value) -> Option<&Object> {
        value.obj_id().and_then(|id| self.get(id))
    }

    pub fn list(&mut self, items: Vec<Value>) -> Value {
        Value::Obj(self.alloc(Object::List(items)))
    }

    pub fn tuple(&mut self, items: Vec<Value>) -> Value {
        Value::Obj(self.alloc(Object::Tuple(items)))
    }

    pub fn dict(&mut self, items: Vec<(Value, Value)>) -> Value {
        Value::Obj(self.alloc(Object::Dict(items)))
    }

    pub fn set(&mut self, items: Vec<Value>) -> Value {
        Value::Obj(self.alloc(Object::Set(items)))
    }

    pub fn frozenset(&mut self, items: Vec<Value>) -> Value {
        Value::Obj(self.alloc(Object::FrozenSet(items)))
    }

    pub fn instance<S: Into<String>>(&mut self, class: S, state: Vec<(String, Value)>) -> Value {
        Value::Obj(self.alloc(Object::Instance { class: class.into(), state }))
    }

    /// Allocate a copy of `graph`'s objects in this heap, returning the
    /// translated root.
    pub fn adopt(&mut self, graph: Graph) -> Value {
        let offset = self.objects.len();
        let shift = |v: Value| shift_value(v, offset);
        for object in graph.heap.objects {
            let moved = match object {
                Object::List(items) => Object::List(items.into_iter().map(shift).collect()),
                Object::Tuple(items) => Object::Tuple(items.into_iter().map(shift).collect()),
                Object::Set(items) => Object::Set(items.into_iter().map(shift).collect()),
                Object::FrozenSet(items) =>
                    Object::FrozenSet(items.into_iter().map(shift).collect()),
                Object::Dict(items) =>
                    Object::Dict(items.into_iter().map(|(k, v)| (shift(k), shift(v))).collect()),
                Object::Instance { class, state } => Object::Instance {
                    class,
                    state: state.into_iter().map(|(k, v)| (k, shift(v))).collect(),
                },
                Object::Method { name, receiver, class } =>
                    Object::Method { name, receiver: shift(receiver), class: shift(class) },
                Object::Persistent(v) => Object::Persistent(shift(v)),
                other => other,
            };
            self.objects.push(moved);
        }
        shift_value(graph.root, offset)
    }

    /// Convert to a hashable key.  Lists, dicts and sets are not hashable;
    /// other objects hash by identity.
    pub fn to_hashable(&self, value: &Value) -> Option<HashableValue> {
        self.hashable_inner(value, &mut Vec::new())
    }

    fn hashable_inner(&self, value: &Value, seen: &mut Vec<ObjId>) -> Option<HashableValue> {
        Some(match *value {
            Value::None => HashableValue::None,
            Value::Bool(b) => HashableValue::Bool(b),
            Value::I64(i) => HashableValue::I64(i),
            Value::Int(ref i) => HashableValue::Int(i.clone()),
            Value::F64(f) => HashableValue::F64(f),
            Value::Bytes(ref b) => HashableValue::Bytes(b.clone()),
            Value::String(ref s) => HashableValue::String(s.clone()),
            Value::Failure(_) => return None,
            Value::Obj(id) => {
                if seen.contains(&id) {
                    return None;
                }
                seen.push(id);
                let result = match *self.get(id)? {
                    Object::Tuple(ref items) => HashableValue::Tuple(
                        items.iter().map(|v| self.hashable_inner(v, seen))
                             .collect::<Option<Vec<_>>>()?),
                    Object::FrozenSet(ref items) => HashableValue::FrozenSet(
                        items.iter().map(|v| self.hashable_inner(v, seen))
                             .collect::<Option<BTreeSet<_>>>()?),
                    Object::List(_) | Object::Dict(_) | Object::Set(_) => return None,
                    _ => HashableValue::Ref(id),
                };
                seen.pop();
                result
            }
        })
    }

    /// Deep structural comparison of `a` (in this heap) and `b` (in
    /// `other`).  Cycles are compared co-inductively; dicts and sets ignore
    /// order.
    pub fn equivalent(&self, a: &Value, other: &Heap, b: &Value) -> bool {
        Equiv { left: self, right: other, assumed: Vec::new() }.values(a, b)
    }

    /// Display adapter rendering values like Python's `repr`.
    pub fn show<'a>(&'a self, value: &'a Value) -> Show<'a> {
        Show { heap: self, value }
    }
}

fn shift_value(value: Value, offset: usize) -> Value {
    match value {
        Value::Obj(ObjId(i)) => Value::Obj(ObjId(i + offset)),
        other => other,
    }
}

struct Equiv<'a> {
    left: &'a Heap,
    right: &'a Heap,
    assumed: Vec<(ObjId, ObjId)>,
}

impl<'a> Equiv<'a> {
    fn values(&mut self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (&Value::Obj(x), &Value::Obj(y)) => self.objects(x, y),
            (&Value::Obj(_), _) | (_, &Value::Obj(_)) => false,
            (&Value::Failure(ref x), &Value::Failure(ref y)) => x == y,
            (&Value::F64(x), &Value::F64(y)) => x == y || (x.is_nan() && y.is_nan()),
            _ => scalar_key(a) == scalar_key(b),
        }
    }

    fn seq(&mut self, xs: &[Value], ys: &[Value]) -> bool {
        xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| self.values(x, y))
    }

    fn unordered(&mut self, xs: &[Value], ys: &[Value]) -> bool {
        xs.len() == ys.len() &&
            xs.iter().all(|x| ys.iter().any(|y| self.values(x, y)))
    }

    fn objects(&mut self, x: ObjId, y: ObjId) -> bool {
        if self.assumed.contains(&(x, y)) {
            return true;
        }
        // assumptions made while proving a failed pair must not outlive it
        let mark = self.assumed.len();
        self.assumed.push((x, y));
        let same = self.compare(x, y);
        if !same {
            self.assumed.truncate(mark);
        }
        same
    }

    fn compare(&mut self, x: ObjId, y: ObjId) -> bool {
        let (left, right) = (self.left, self.right);
        let (ox, oy) = match (left.get(x), right.get(y)) {
            (Some(ox), Some(oy)) => (ox, oy),
            _ => return false,
        };
        match (ox, oy) {
            (&Object::List(ref a), &Object::List(ref b)) |
            (&Object::Tuple(ref a), &Object::Tuple(ref b)) => self.seq(a, b),
            (&Object::Set(ref a), &Object::Set(ref b)) |
            (&Object::FrozenSet(ref a), &Object::FrozenSet(ref b)) => self.unordered(a, b),
            (&Object::Dict(ref a), &Object::Dict(ref b)) => {
                a.len() == b.len() && a.iter().all(|&(ref ka, ref va)| {
                    b.iter().any(|&(ref kb, ref vb)| self.values(ka, kb) && self.values(va, vb))
                })
            }
            (&Object::Instance { class: ref ca, state: ref sa },
             &Object::Instance { class: ref cb, state: ref sb }) => {
                ca == cb && sa.len() == sb.len() && sa.iter().all(|&(ref name, ref va)| {
                    sb.iter().any(|&(ref n, ref vb)| n == name && self.values(va, vb))
                })
            }
            (&Object::Method { name: ref na, receiver: ref ra, class: ref ca },
             &Object::Method { name: ref nb, receiver: ref rb, class: ref cb }) =>
                na == nb && self.values(ra, rb) && self.values(ca, cb),
            (&Object::Class(ref a), &Object::Class(ref b)) |
            (&Object::Module(ref a), &Object::Module(ref b)) |
            (&Object::Function(ref a), &Object::Function(ref b)) |
            (&Object::Unpersistable(ref a), &Object::Unpersistable(ref b)) => a == b,
            (&Object::Persistent(ref a), &Object::Persistent(ref b)) => self.values(a, b),
            (&Object::Remote(ref a), &Object::Remote(ref b)) => a == b,
            (&Object::Local(ref a), &Object::Local(ref b)) => a == b,
            _ => false,
        }
    }
}

fn scalar_key(value: &Value) -> Option<HashableValue> {
    Heap::new().to_hashable(value)
}

/// A self-contained object graph: a heap plus the value at its root.
#[derive(Clone, Debug)]
pub struct Graph {
    pub heap: Heap,
    pub root: Value,
}

impl Graph {
    pub fn new(heap: Heap, root: Value) -> Graph {
        Graph { heap, root }
    }

    /// A graph holding a single scalar.
    pub fn scalar(root: Value) -> Graph {
        Graph { heap: Heap::new(), root }
    }

    pub fn root_object(&self) -> Option<&Object> {
        self.heap.deref(&self.root)
    }

    pub fn equivalent(&self, other: &Graph) -> bool {
        self.heap.equivalent(&self.root, &other.heap, &other.root)
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.heap.show(&self.root))
    }
}

/// See `Heap::show`.
pub struct Show<'a> {
    heap: &'a Heap,
    value: &'a Value,
}

impl<'a> fmt::Display for Show<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write_value(f, self.heap, self.value, &mut Vec::new())
    }
}

fn write_elements<'a, I>(f: &mut fmt::Formatter, heap: &Heap, seen: &mut Vec<ObjId>, it: I,
                         prefix: &'static str, suffix: &'static str,
                         len: usize, always_comma: bool) -> fmt::Result
    where I: Iterator<Item=&'a Value>
{
    f.write_str(prefix)?;
    for (i, item) in it.enumerate() {
        write_value(f, heap, item, seen)?;
        if i < len - 1 || always_comma {
            f.write_str(", ")?;
        }
    }
    f.write_str(suffix)
}

fn write_value(f: &mut fmt::Formatter, heap: &Heap, value: &Value,
               seen: &mut Vec<ObjId>) -> fmt::Result {
    let id = match *value {
        Value::Obj(id) => id,
        ref scalar => return fmt::Display::fmt(scalar, f),
    };
    let object = match heap.get(id) {
        Some(object) => object,
        None => return write!(f, "<dangling #{}>", id.0),
    };
    if seen.contains(&id) {
        return match *object {
            Object::List(_) => f.write_str("[...]"),
            Object::Dict(_) => f.write_str("{...}"),
            _ => f.write_str("(...)"),
        };
    }
    seen.push(id);
    let result = match *object {
        Object::List(ref v) => write_elements(f, heap, seen, v.iter(), "[", "]", v.len(), false),
        Object::Tuple(ref v) =>
            write_elements(f, heap, seen, v.iter(), "(", ")", v.len(), v.len() == 1),
        Object::FrozenSet(ref v) =>
            write_elements(f, heap, seen, v.iter(), "frozenset([", "])", v.len(), false),
        Object::Set(ref v) => if v.is_empty() {
            f.write_str("set()")
        } else {
            write_elements(f, heap, seen, v.iter(), "{", "}", v.len(), false)
        },
        Object::Dict(ref v) => {
            f.write_str("{")?;
            for (i, &(ref key, ref val)) in v.iter().enumerate() {
                write_value(f, heap, key, seen)?;
                f.write_str(": ")?;
                write_value(f, heap, val, seen)?;
                if i < v.len() - 1 {
                    f.write_str(", ")?;
                }
            }
            f.write_str("}")
        }
        Object::Instance { ref class, ref state } => {
            write!(f, "{}(", class)?;
            for (i, &(ref name, ref val)) in state.iter().enumerate() {
                write!(f, "{}=", name)?;
                write_value(f, heap, val, seen)?;
                if i < state.len() - 1 {
                    f.write_str(", ")?;
                }
            }
            f.write_str(")")
        }
        Object::Class(ref name) => write!(f, "<class {}>", name),
        Object::Module(ref name) => write!(f, "<module {}>", name),
        Object::Function(ref name) => write!(f, "<function {}>", name),
        Object::Method { ref name, ref receiver, .. } => {
            write!(f, "<method {} of ", name)?;
            write_value(f, heap, receiver, seen)?;
            f.write_str(">")
        }
        Object::Persistent(ref v) => {
            f.write_str("persistent(")?;
            write_value(f, heap, v, seen)?;
            f.write_str(")")
        }
        Object::Unpersistable(ref why) => write!(f, "Unpersistable({:?})", why),
        Object::Remote(ref r) => write!(f, "{:?}", r),
        Object::Local(ref l) => write!(f, "{:?}", l),
    };
    seen.pop();
    result
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Value::None          => write!(f, "None"),
            Value::Bool(b)       => write!(f, "{}", if b { "True" } else { "False" }),
            Value::I64(i)        => write!(f, "{}", i),
            Value::Int(ref i)    => write!(f, "{}", i),
            Value::F64(v)        => write!(f, "{}", v),
            Value::Bytes(ref b)  => write!(f, "b{:?}", String::from_utf8_lossy(b)),
            Value::String(ref s) => write!(f, "{:?}", s),
            Value::Obj(id)       => write!(f, "<object #{}>", id.0),
            Value::Failure(ref v) => write!(f, "<Failure: {}>", v),
        }
    }
}

/// Values that can be used as dictionary keys and set elements.
///
/// In Rust, the type is *not* hashable, since we use B-tree maps and sets
/// instead of the hash variants.  To be able to put all values into these
/// B-trees, we implement a consistent ordering between all the possible
/// types (see below).  Objects other than tuples and frozensets are keyed by
/// identity.
#[derive(Clone, Debug)]
pub enum HashableValue {
    /// None
    None,
    /// Boolean
    Bool(bool),
    /// Short integer
    I64(i64),
    /// Long integer
    Int(BigInt),
    /// Float
    F64(f64),
    /// Bytestring
    Bytes(Vec<u8>),
    /// Unicode string
    String(String),
    /// Tuple
    Tuple(Vec<HashableValue>),
    /// Frozen (immutable) set
    FrozenSet(BTreeSet<HashableValue>),
    /// Any other object, by identity
    Ref(ObjId),
}

impl PartialEq for HashableValue {
    fn eq(&self, other: &HashableValue) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HashableValue {}

impl PartialOrd for HashableValue {
    fn partial_cmp(&self, other: &HashableValue) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Implement a (more or less) consistent ordering for `HashableValue`s
/// so that they can be added to dictionaries and sets.
///
/// Also, like in Python, numeric values with the same value (integral or not)
/// must compare equal.
///
/// For other types, we define an ordering between all types A and B so that all
/// objects of type A are always lesser than objects of type B.
impl Ord for HashableValue {
    fn cmp(&self, other: &HashableValue) -> Ordering {
        use self::HashableValue::*;
        match *self {
            None => match *other {
                None => Ordering::Equal,
                _    => Ordering::Less
            },
            Bool(b) => match *other {
                None         => Ordering::Greater,
                Bool(b2)     => b.cmp(&b2),
                I64(i2)      => (b as i64).cmp(&i2),
                Int(ref bi)  => BigInt::from(b as i64).cmp(bi),
                F64(f)       => float_ord(b as i64 as f64, f),
                _            => Ordering::Less
            },
            I64(i) => match *other {
                None         => Ordering::Greater,
                Bool(b)      => i.cmp(&(b as i64)),
                I64(i2)      => i.cmp(&i2),
                Int(ref bi)  => BigInt::from(i).cmp(bi),
                F64(f)       => float_ord(i as f64, f),
                _            => Ordering::Less
            },
            Int(ref bi) => match *other {
                None         => Ordering::Greater,
                Bool(b)      => bi.cmp(&BigInt::from(b as i64)),
                I64(i)       => bi.cmp(&BigInt::from(i)),
                Int(ref bi2) => bi.cmp(bi2),
                F64(f)       => float_bigint_ord(bi, f),
                _            => Ordering::Less
            },
            F64(f) => match *other {
                None         => Ordering::Greater,
                Bool(b)      => float_ord(f, b as i64 as f64),
                I64(i)       => float_ord(f, i as f64),
                Int(ref bi)  => float_bigint_ord(bi, f).reverse(),
                F64(f2)      => float_ord(f, f2),
                _            => Ordering::Less
            },
            Bytes(ref bs) => match *other {
                String(_) | FrozenSet(_) |
                Tuple(_) | Ref(_) => Ordering::Less,
                Bytes(ref bs2)    => bs.cmp(bs2),
                _                 => Ordering::Greater
            },
            String(ref s) => match *other {
                FrozenSet(_) |
                Tuple(_) | Ref(_) => Ordering::Less,
                String(ref s2)    => s.cmp(s2),
                _                 => Ordering::Greater
            },
            FrozenSet(ref s) => match *other {
                Tuple(_) | Ref(_) => Ordering::Less,
                FrozenSet(ref s2) => s.cmp(s2),
                _                 => Ordering::Greater
            },
            Tuple(ref t) => match *other {
                Ref(_)        => Ordering::Less,
                Tuple(ref t2) => t.cmp(t2),
                _             => Ordering::Greater
            },
            Ref(id) => match *other {
                Ref(id2) => id.cmp(&id2),
                _        => Ordering::Greater
            },
        }
    }
}

/// A "reasonable" total ordering for floats.
fn float_ord(f: f64, g: f64) -> Ordering {
    match f.partial_cmp(&g) {
        Some(o) => o,
        None    => Ordering::Less
    }
}

/// Ordering between floats and big integers.
fn float_bigint_ord(bi: &BigInt, g: f64) -> Ordering {
    match bi.to_f64() {
        Some(f) => float_ord(f, g),
        None => if bi.is_positive() { Ordering::Greater } else { Ordering::Less }
    }
}
