// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! # Constraints
//!
//! A `Constraint` is enforced in two ways.  While tokens arrive, the
//! receiving unslicer asks `check_token` (and `check_opentype` for OPEN
//! sequences) before the token body is even buffered, so oversized strings
//! and unexpected containers are rejected early.  Values that already exist
//! (outgoing arguments and results, or objects reached through a
//! `dereference`) are validated with `check_object`.
//!
//! Method schemas and remote interfaces describe what a remotely callable
//! object accepts and returns.

use std::fmt;
use std::collections::BTreeMap;
use num_bigint::BigInt;
use num_traits::{Signed, One};

use crate::consts::*;
use crate::error::{Error, Violation};
use crate::value::{Heap, Object, ObjId, Value};

/// Limit on the size of integers.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum IntLimit {
    /// Only values in `[-2**31, 2**31)`, sent as INT/NEG.
    Int32,
    /// Magnitudes below `2**(8*n)`; LONGINT bodies up to `n` bytes.
    Bytes(usize),
    Unlimited,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Constraint {
    /// Accept everything.
    Any,
    /// Only `None`.
    Nothing,
    /// Byte strings up to a maximum length.
    String(Option<usize>),
    /// Unicode strings up to a maximum length (in bytes of UTF-8).
    Unicode(Option<usize>),
    Integer(IntLimit),
    /// Integers or floats.
    Number(IntLimit),
    /// Booleans, optionally only one specific value.
    Boolean(Option<bool>),
    ListOf(Box<Constraint>, Option<usize>),
    TupleOf(Vec<Constraint>),
    DictOf(Box<Constraint>, Box<Constraint>, Option<usize>),
    AttributeDict(AttributeDict),
    /// An instance of the named class.
    Class(String),
    /// Any one of the alternatives.
    Choice(Vec<Constraint>),
    /// The value may be left out (method arguments, attributes).
    Optional(Box<Constraint>),
    /// A copied failure, as carried by an `error` frame.
    Failure,
    /// A remote reference, optionally claiming a named interface.
    Reference(Option<String>),
}

/// Per-attribute constraints for instance state and string-keyed dicts.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AttributeDict {
    pub attributes: BTreeMap<String, Constraint>,
    pub ignore_unknown: bool,
    pub accept_unknown: bool,
}

impl AttributeDict {
    pub fn new() -> AttributeDict {
        AttributeDict::default()
    }

    pub fn attr<S: Into<String>>(mut self, name: S, constraint: Constraint) -> Self {
        self.attributes.insert(name.into(), constraint);
        self
    }

    /// Look up the constraint for `name`.  Returns `(accept, constraint)`:
    /// unknown attributes are either dropped, accepted unconstrained, or
    /// rejected.
    pub fn attr_constraint(&self, name: &str) -> Result<(bool, Option<&Constraint>), Violation> {
        if let Some(c) = self.attributes.get(name) {
            return Ok((true, Some(c.required())));
        }
        if self.ignore_unknown {
            return Ok((false, None));
        }
        if self.accept_unknown {
            return Ok((true, None));
        }
        Err(Violation::new(format!("unknown attribute '{}'", name)))
    }

    fn check_pairs<'a, I>(&self, heap: &Heap, pairs: I, seen: &mut Seen) -> Result<(), Violation>
        where I: Iterator<Item=(&'a str, &'a Value)>
    {
        let mut names = Vec::new();
        for (name, value) in pairs {
            match self.attributes.get(name) {
                Some(c) => c.check_inner(heap, value, seen)?,
                None => if !self.ignore_unknown && !self.accept_unknown {
                    return Err(Violation::new(format!("key '{}' not in schema", name)));
                },
            }
            names.push(name);
        }
        self.check_complete(names)
    }

    /// Check that every required attribute is among `names`.
    pub fn check_complete<'a, I: IntoIterator<Item=&'a str>>(&self, names: I) -> Result<(), Violation> {
        let names: Vec<&str> = names.into_iter().collect();
        let missing: Vec<&str> = self.attributes.iter()
            .filter(|&(k, c)| !c.is_optional() && !names.contains(&k.as_str()))
            .map(|(k, _)| k.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(Violation::new(format!("object is missing required keys: {}",
                                              missing.join(","))));
        }
        Ok(())
    }
}

type Seen = Vec<(ObjId, *const Constraint)>;

impl Constraint {
    pub fn list_of(item: Constraint, max_length: Option<usize>) -> Constraint {
        Constraint::ListOf(Box::new(item), max_length)
    }

    pub fn dict_of(key: Constraint, value: Constraint, max_keys: Option<usize>) -> Constraint {
        Constraint::DictOf(Box::new(key), Box::new(value), max_keys)
    }

    pub fn optional(inner: Constraint) -> Constraint {
        Constraint::Optional(Box::new(inner))
    }

    /// The default integer constraint: 32-bit values.
    pub fn int() -> Constraint {
        Constraint::Integer(IntLimit::Int32)
    }

    /// The default string constraint: up to 1000 bytes.
    pub fn string() -> Constraint {
        Constraint::String(Some(SIZE_LIMIT))
    }

    /// The failure schema used for `error` frames.
    pub fn failure_attributes() -> AttributeDict {
        let mut attrs = AttributeDict::new()
            .attr("type", Constraint::String(Some(200)))
            .attr("value", Constraint::String(Some(1000)))
            .attr("traceback", Constraint::String(Some(2000)))
            .attr("parents", Constraint::list_of(Constraint::String(Some(200)), Some(30)));
        attrs.ignore_unknown = true;
        attrs
    }

    pub fn is_optional(&self) -> bool {
        match *self {
            Constraint::Optional(_) => true,
            _ => false,
        }
    }

    /// Strip an `Optional` wrapper.
    pub fn required(&self) -> &Constraint {
        match *self {
            Constraint::Optional(ref inner) => inner.required(),
            ref other => other,
        }
    }

    pub fn name(&self) -> &'static str {
        match *self {
            Constraint::Any => "Any",
            Constraint::Nothing => "Nothing",
            Constraint::String(_) => "StringConstraint",
            Constraint::Unicode(_) => "UnicodeConstraint",
            Constraint::Integer(_) => "IntegerConstraint",
            Constraint::Number(_) => "NumberConstraint",
            Constraint::Boolean(_) => "BooleanConstraint",
            Constraint::ListOf(..) => "ListConstraint",
            Constraint::TupleOf(_) => "TupleConstraint",
            Constraint::DictOf(..) => "DictConstraint",
            Constraint::AttributeDict(_) => "AttributeDictConstraint",
            Constraint::Class(_) => "ClassConstraint",
            Constraint::Choice(_) => "PolyConstraint",
            Constraint::Optional(_) => "Optional",
            Constraint::Failure => "FailureConstraint",
            Constraint::Reference(_) => "RemoteInterfaceConstraint",
        }
    }

    /// The token taster: `Ok(None)` if the type byte is rejected, otherwise
    /// the optional body size limit.
    fn token_limit(&self, typebyte: u8) -> Option<Option<u64>> {
        let int_limit = |limit: IntLimit| match typebyte {
            INT | NEG => Some(None),
            LONGINT | LONGNEG => match limit {
                IntLimit::Int32 => None,
                IntLimit::Bytes(n) => Some(Some(n as u64)),
                IntLimit::Unlimited => Some(None),
            },
            _ => None,
        };
        match *self {
            Constraint::Any => Some(None),
            Constraint::String(max) => match typebyte {
                STRING => Some(max.map(|m| m as u64)),
                VOCAB => Some(None),
                _ => None,
            },
            Constraint::Integer(limit) => int_limit(limit),
            Constraint::Number(limit) => match typebyte {
                FLOAT => Some(None),
                _ => int_limit(limit),
            },
            Constraint::Optional(ref inner) => inner.token_limit(typebyte),
            Constraint::Choice(ref alternatives) => {
                let mut best: Option<Option<u64>> = None;
                for alt in alternatives {
                    match (alt.token_limit(typebyte), best) {
                        (Some(None), _) => return Some(None),
                        (Some(Some(n)), Some(Some(m))) if n > m => best = Some(Some(n)),
                        (Some(Some(n)), None) => best = Some(Some(n)),
                        _ => {}
                    }
                }
                best
            }
            // everything else is built from OPEN sequences
            _ => match typebyte {
                OPEN => Some(None),
                _ => None,
            },
        }
    }

    /// Check a token header before its body is read.
    pub fn check_token(&self, typebyte: u8, size: u64) -> Result<(), Violation> {
        match self.token_limit(typebyte) {
            None => Err(Violation::new(format!("{} token rejected by {}",
                                               token_name(typebyte), self.name()))),
            Some(Some(limit)) if size > limit =>
                Err(Violation::new(format!("token too large: {}>{}", size, limit))),
            Some(_) => Ok(()),
        }
    }

    fn opentypes(&self) -> Option<&'static [&'static str]> {
        Some(match *self {
            Constraint::Any | Constraint::Choice(_) | Constraint::Optional(_) => return None,
            Constraint::Nothing => &[NONE_ATOM],
            Constraint::Boolean(_) => &[BOOLEAN_ATOM],
            Constraint::Unicode(_) => &[UNICODE_ATOM],
            Constraint::ListOf(..) => &[LIST_ATOM],
            Constraint::TupleOf(_) => &[TUPLE_ATOM],
            Constraint::DictOf(..) => &[DICT_ATOM],
            Constraint::AttributeDict(_) => &[DICT_ATOM, INSTANCE_ATOM],
            Constraint::Class(_) => &[INSTANCE_ATOM],
            Constraint::Failure => &[COPYABLE_ATOM],
            Constraint::Reference(_) => &[MY_REFERENCE, YOUR_REFERENCE],
            Constraint::String(_) | Constraint::Integer(_) | Constraint::Number(_) => &[],
        })
    }

    /// Check the type of an OPEN sequence.  Back-references are accepted
    /// wherever a container is; what they point at is checked separately.
    pub fn check_opentype(&self, opentype: &str) -> Result<(), Violation> {
        match *self {
            Constraint::Optional(ref inner) => return inner.check_opentype(opentype),
            Constraint::Choice(ref alternatives) => {
                if alternatives.iter().any(|c| c.check_opentype(opentype).is_ok()) {
                    return Ok(());
                }
            }
            _ => match self.opentypes() {
                None => return Ok(()),
                Some(types) => {
                    if types.contains(&opentype) {
                        return Ok(());
                    }
                    let referencing = opentype == REFERENCE_ATOM || opentype == DEREFERENCE_ATOM;
                    if referencing && !types.is_empty() {
                        return Ok(());
                    }
                }
            },
        }
        Err(Violation::new(format!("unacceptable OPEN type '{}'", opentype)))
    }

    /// Validate an existing value.
    pub fn check_object(&self, heap: &Heap, value: &Value) -> Result<(), Violation> {
        self.check_inner(heap, value, &mut Vec::new())
    }

    fn check_inner(&self, heap: &Heap, value: &Value, seen: &mut Seen) -> Result<(), Violation> {
        if let Value::Obj(id) = *value {
            let key = (id, self as *const Constraint);
            if seen.contains(&key) {
                return Ok(());
            }
            seen.push(key);
        }
        let object = heap.deref(value);
        match *self {
            Constraint::Any => Ok(()),
            Constraint::Nothing => match *value {
                Value::None => Ok(()),
                _ => Err(Violation::new("not None")),
            },
            Constraint::String(max) => {
                let len = match *value {
                    Value::Bytes(ref b) => b.len(),
                    Value::String(ref s) => s.len(),
                    _ => return Err(Violation::new("not a String")),
                };
                match max {
                    Some(max) if len > max => Err(Violation::new("string too long")),
                    _ => Ok(()),
                }
            }
            Constraint::Unicode(max) => match *value {
                Value::String(ref s) => match max {
                    Some(max) if s.len() > max => Err(Violation::new("string too long")),
                    _ => Ok(()),
                },
                _ => Err(Violation::new("not a unicode string")),
            },
            Constraint::Integer(limit) => check_integer(value, limit),
            Constraint::Number(limit) => match *value {
                Value::F64(_) => Ok(()),
                _ => check_integer(value, limit),
            },
            Constraint::Boolean(expected) => match *value {
                Value::Bool(b) => match expected {
                    Some(e) if e != b =>
                        Err(Violation::new(format!("not {}", if e { "True" } else { "False" }))),
                    _ => Ok(()),
                },
                _ => Err(Violation::new("not a bool")),
            },
            Constraint::ListOf(ref item, max) => match object {
                Some(&Object::List(ref items)) => {
                    if let Some(max) = max {
                        if items.len() > max {
                            return Err(Violation::new("list too long"));
                        }
                    }
                    for v in items {
                        item.check_inner(heap, v, seen)?;
                    }
                    Ok(())
                }
                _ => Err(Violation::new("not a list")),
            },
            Constraint::TupleOf(ref elements) => match object {
                Some(&Object::Tuple(ref items)) => {
                    if items.len() != elements.len() {
                        return Err(Violation::new("wrong size tuple"));
                    }
                    for (c, v) in elements.iter().zip(items) {
                        c.check_inner(heap, v, seen)?;
                    }
                    Ok(())
                }
                _ => Err(Violation::new("not a tuple")),
            },
            Constraint::DictOf(ref key, ref val, max) => match object {
                Some(&Object::Dict(ref items)) => {
                    if let Some(max) = max {
                        if items.len() > max {
                            return Err(Violation::new(format!("Dict keys={} > maxKeys={}",
                                                              items.len(), max)));
                        }
                    }
                    for &(ref k, ref v) in items {
                        key.check_inner(heap, k, seen)?;
                        val.check_inner(heap, v, seen)?;
                    }
                    Ok(())
                }
                _ => Err(Violation::new(format!("'{}' is not a Dictionary", heap.show(value)))),
            },
            Constraint::AttributeDict(ref attrs) => match object {
                Some(&Object::Instance { ref state, .. }) =>
                    attrs.check_pairs(heap, state.iter().map(|&(ref k, ref v)| (k.as_str(), v)),
                                      seen),
                Some(&Object::Dict(ref items)) => {
                    let mut pairs = Vec::with_capacity(items.len());
                    for &(ref k, ref v) in items {
                        match *k {
                            Value::Bytes(ref b) => match std::str::from_utf8(b) {
                                Ok(s) => pairs.push((s, v)),
                                Err(_) => return Err(Violation::new("attribute names must be strings")),
                            },
                            Value::String(ref s) => pairs.push((s.as_str(), v)),
                            _ => return Err(Violation::new("attribute names must be strings")),
                        }
                    }
                    attrs.check_pairs(heap, pairs.into_iter(), seen)
                }
                _ => Err(Violation::new(format!("'{}' is not a Dictionary", heap.show(value)))),
            },
            Constraint::Class(ref name) => match object {
                Some(&Object::Instance { ref class, .. }) if class == name => Ok(()),
                _ => Err(Violation::new(format!("is not an instance of {}", name))),
            },
            Constraint::Choice(ref alternatives) => {
                for alt in alternatives {
                    if alt.check_inner(heap, value, seen).is_ok() {
                        return Ok(());
                    }
                }
                Err(Violation::new(format!("does not satisfy any of {}", self)))
            }
            Constraint::Optional(ref inner) => inner.check_inner(heap, value, seen),
            Constraint::Failure => match object {
                Some(&Object::Instance { ref class, .. }) if class == FAILURE_CLASS => Ok(()),
                _ => Err(Violation::new(format!("is not an instance of {}", FAILURE_CLASS))),
            },
            Constraint::Reference(ref iface) => {
                let provided = match object {
                    Some(&Object::Remote(ref r)) => r.interface_name(),
                    Some(&Object::Local(ref l)) => l.interface_name(),
                    _ => return Err(Violation::new("not a reference")),
                };
                match *iface {
                    Some(ref want) if provided.as_deref() != Some(want.as_str()) =>
                        Err(Violation::new(format!("does not provide interface {}", want))),
                    _ => Ok(()),
                }
            }
        }
    }
}

fn check_integer(value: &Value, limit: IntLimit) -> Result<(), Violation> {
    let big = match *value {
        Value::I64(i) => BigInt::from(i),
        Value::Int(ref i) => i.clone(),
        _ => return Err(Violation::new("not a number")),
    };
    let too_large = match limit {
        IntLimit::Int32 => big >= BigInt::from(1i64 << 31) || big < -BigInt::from(1i64 << 31),
        IntLimit::Bytes(n) => big.abs() >= (BigInt::one() << (8 * n)),
        IntLimit::Unlimited => false,
    };
    if too_large {
        Err(Violation::new("number too large"))
    } else {
        Ok(())
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Constraint::ListOf(ref c, _) => write!(f, "ListOf({})", c),
            Constraint::DictOf(ref k, ref v, _) => write!(f, "DictOf({}, {})", k, v),
            Constraint::TupleOf(ref cs) | Constraint::Choice(ref cs) => {
                f.write_str(if let Constraint::Choice(_) = *self { "ChoiceOf(" } else { "TupleOf(" })?;
                for (i, c) in cs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", c)?;
                }
                f.write_str(")")
            }
            Constraint::Optional(ref c) => write!(f, "Optional({})", c),
            Constraint::Class(ref name) => write!(f, "ClassConstraint({})", name),
            _ => f.write_str(self.name()),
        }
    }
}

/// Schema for one remotely invokable method.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MethodSchema {
    pub name: String,
    /// Arguments in declaration order.
    pub arguments: Vec<(String, Constraint)>,
    pub response: Option<Constraint>,
    pub ignore_unknown: bool,
    pub accept_unknown: bool,
}

impl MethodSchema {
    pub fn new<S: Into<String>>(name: S) -> MethodSchema {
        MethodSchema { name: name.into(), ..MethodSchema::default() }
    }

    pub fn arg<S: Into<String>>(mut self, name: S, constraint: Constraint) -> Self {
        self.arguments.push((name.into(), constraint));
        self
    }

    pub fn returns(mut self, constraint: Constraint) -> Self {
        self.response = Some(constraint);
        self
    }

    pub fn ignore_unknown(mut self) -> Self {
        self.ignore_unknown = true;
        self
    }

    pub fn accept_unknown(mut self) -> Self {
        self.accept_unknown = true;
        self
    }

    fn required(&self) -> impl Iterator<Item=&str> {
        self.arguments.iter().filter(|&&(_, ref c)| !c.is_optional()).map(|&(ref n, _)| n.as_str())
    }

    /// Turn positional arguments into named ones, by declaration order.
    pub fn map_arguments(&self, positional: Vec<Value>, named: Vec<(String, Value)>)
                         -> Result<Vec<(String, Value)>, Error> {
        if positional.len() > self.arguments.len() {
            return Err(Error::Violation(Violation::new(format!(
                "{}() takes at most {} arguments ({} given)",
                self.name, self.arguments.len(), positional.len()))));
        }
        let mut result = Vec::with_capacity(positional.len() + named.len());
        for (value, &(ref name, _)) in positional.into_iter().zip(&self.arguments) {
            if named.iter().any(|&(ref n, _)| n == name) {
                return Err(Error::Violation(Violation::new(format!(
                    "got multiple values for keyword argument '{}'", name))));
            }
            result.push((name.clone(), value));
        }
        result.extend(named);
        Ok(result)
    }

    /// `(accept, constraint)` for an argument name.
    pub fn arg_constraint(&self, name: &str) -> Result<(bool, Option<&Constraint>), Violation> {
        if let Some(&(_, ref c)) = self.arguments.iter().find(|&&(ref n, _)| n == name) {
            return Ok((true, Some(c.required())));
        }
        if self.ignore_unknown {
            return Ok((false, None));
        }
        if self.accept_unknown {
            return Ok((true, None));
        }
        Err(Violation::new(format!("unknown argument '{}'", name)))
    }

    /// Inbound side: every argument has been checked individually, so only
    /// verify that the required ones are present.
    pub fn check_args<'a, I: IntoIterator<Item=&'a str>>(&self, names: I) -> Result<(), Violation> {
        let names: Vec<&str> = names.into_iter().collect();
        for required in self.required() {
            if !names.contains(&required) {
                return Err(Violation::new(format!("missing required argument '{}'", required)));
            }
        }
        Ok(())
    }

    /// Outbound side: check every argument value, then completeness.
    pub fn check_all_args(&self, heap: &Heap, args: &[(String, Value)]) -> Result<(), Violation> {
        for &(ref name, ref value) in args {
            if let (_, Some(c)) = self.arg_constraint(name)? {
                c.check_object(heap, value)
                 .map_err(|v| v.suffixed(&format!("in argument '{}'", name)))?;
            }
        }
        self.check_args(args.iter().map(|&(ref n, _)| n.as_str()))
    }

    /// Check results we are about to send back.
    pub fn check_results(&self, heap: &Heap, value: &Value) -> Result<(), Violation> {
        match self.response {
            Some(ref c) => c.check_object(heap, value)
                            .map_err(|v| v.suffixed("in outbound method results")),
            None => Ok(()),
        }
    }
}

/// A named set of method schemas, announced when a reference is first sent.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RemoteInterface {
    pub name: String,
    pub methods: BTreeMap<String, MethodSchema>,
}

impl RemoteInterface {
    pub fn new<S: Into<String>>(name: S) -> RemoteInterface {
        RemoteInterface { name: name.into(), methods: BTreeMap::new() }
    }

    pub fn method(mut self, schema: MethodSchema) -> Self {
        self.methods.insert(schema.name.clone(), schema);
        self
    }

    pub fn get(&self, method: &str) -> Option<&MethodSchema> {
        self.methods.get(method)
    }
}
