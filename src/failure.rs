// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Copied failures: the wire form of an exception raised by a remote method.

use std::fmt;

use crate::consts::*;
use crate::error::{Error, Result, Violation};
use crate::value::{Heap, Object, Value};

pub const VIOLATION_CLASS: &str = "twisted.pb.tokens.Violation";
pub const INSECURE_CLASS: &str = "twisted.pb.tokens.InsecureJelly";
pub const DEAD_REFERENCE_CLASS: &str = "twisted.pb.tokens.DeadReferenceError";
pub const GENERIC_CLASS: &str = "banana_jelly.Error";
const EXCEPTION_CLASS: &str = "exceptions.Exception";

/// A shadow of an exception raised on the other side.
///
/// Only string representations survive the trip: the exception type, its
/// message, a traceback text and the names of the type's ancestors, which
/// is what `check` and `trap` match against.
#[derive(Clone, Debug, PartialEq)]
pub struct CopiedFailure {
    pub type_name: String,
    pub value: String,
    pub traceback: String,
    pub parents: Vec<String>,
}

impl CopiedFailure {
    pub fn new<T: Into<String>, V: Into<String>>(type_name: T, value: V) -> CopiedFailure {
        let type_name = type_name.into();
        CopiedFailure {
            parents: vec![type_name.clone(), EXCEPTION_CLASS.into()],
            type_name,
            value: value.into(),
            traceback: TRACEBACK_UNAVAILABLE.into(),
        }
    }

    pub fn with_parents(mut self, parents: Vec<String>) -> Self {
        self.parents = parents;
        self
    }

    /// Attach a traceback text, truncated to the wire limit.
    pub fn with_traceback(mut self, traceback: &str) -> Self {
        self.traceback = truncate_traceback(traceback);
        self
    }

    /// Wrap a local error so that it can be sent in an `error` frame.
    pub fn from_error(error: &Error, unsafe_tracebacks: bool) -> CopiedFailure {
        let failure = match *error {
            Error::Remote(ref f) => return f.clone(),
            Error::Violation(ref v) => CopiedFailure::new(VIOLATION_CLASS, v.to_string()),
            Error::Insecure(ref why) => CopiedFailure::new(INSECURE_CLASS, why.clone()),
            Error::DeadReference(ref why) => CopiedFailure::new(DEAD_REFERENCE_CLASS, why.clone()),
            ref other => CopiedFailure::new(GENERIC_CLASS, other.to_string()),
        };
        if unsafe_tracebacks {
            let text = format!("Traceback from local error:\n{:?}\n{}: {}\n",
                               error, failure.type_name, failure.value);
            failure.with_traceback(&text)
        } else {
            failure
        }
    }

    /// Return the first of `names` this failure is an instance of.
    pub fn check<'a, S: AsRef<str>>(&self, names: &'a [S]) -> Option<&'a str> {
        names.iter().map(|n| n.as_ref()).find(|&n| self.parents.iter().any(|p| p == n))
    }

    /// Like `check`, but hands the failure back as an error if nothing
    /// matches.
    pub fn trap<'a, S: AsRef<str>>(&self, names: &'a [S]) -> Result<&'a str> {
        self.check(names).ok_or_else(|| Error::Remote(self.clone()))
    }

    /// Attribute pairs for the `copyable` sequence.
    pub(crate) fn to_state(&self, heap: &mut Heap) -> Vec<(String, Value)> {
        let parents = self.parents.iter().map(|p| Value::Bytes(p.clone().into_bytes())).collect();
        vec![
            ("parents".into(), heap.list(parents)),
            ("traceback".into(), Value::Bytes(self.traceback.clone().into_bytes())),
            ("type".into(), Value::Bytes(self.type_name.clone().into_bytes())),
            ("value".into(), Value::Bytes(self.value.clone().into_bytes())),
        ]
    }

    pub(crate) fn from_state(heap: &Heap, state: &[(String, Value)]) -> std::result::Result<CopiedFailure, Violation> {
        let text = |name: &str| -> std::result::Result<String, Violation> {
            match state.iter().find(|&&(ref k, _)| k == name) {
                Some(&(_, ref v)) => value_text(v).ok_or_else(
                    || Violation::new(format!("failure attribute '{}' is not a string", name))),
                None => Ok(String::new()),
            }
        };
        let mut failure = CopiedFailure {
            type_name: text("type")?,
            value: text("value")?,
            traceback: text("traceback")?,
            parents: Vec::new(),
        };
        if let Some(&(_, ref parents)) = state.iter().find(|&&(ref k, _)| k == "parents") {
            match heap.deref(parents) {
                Some(&Object::List(ref items)) => for item in items {
                    failure.parents.push(value_text(item).ok_or_else(
                        || Violation::new("failure parents must be strings"))?);
                },
                _ => return Err(Violation::new("failure parents must be a list")),
            }
        }
        Ok(failure)
    }
}

fn value_text(value: &Value) -> Option<String> {
    match *value {
        Value::Bytes(ref b) => Some(String::from_utf8_lossy(b).into_owned()),
        Value::String(ref s) => Some(s.clone()),
        _ => None,
    }
}

/// Cut a traceback down to the wire limit, marking the cut.
pub fn truncate_traceback(traceback: &str) -> String {
    if traceback.len() <= TRACEBACK_LIMIT {
        return traceback.to_string();
    }
    let mut end = TRACEBACK_LIMIT;
    while !traceback.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &traceback[..end], TRUNCATION_MARKER)
}

impl fmt::Display for CopiedFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[CopiedFailure instance: {}: {}]", self.type_name, self.value)
    }
}
