// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Security policy: which types, modules and classes may cross the wire.
//!
//! Tasters are coarse allow/deny lists.  They are consulted for every
//! opened sequence on the way in and for every value on the way out, after
//! the (finer grained) constraint checks.

use std::collections::BTreeSet;
use std::fmt;

/// The security policy seam.
pub trait Taster: fmt::Debug + Send + Sync {
    fn is_type_allowed(&self, type_name: &str) -> bool;
    fn is_module_allowed(&self, module_name: &str) -> bool;
    /// Classes are identified by their qualified name.
    fn is_class_allowed(&self, class_name: &str) -> bool;
}

/// Allows anything.  Only for trusted peers and local testing.
#[derive(Clone, Copy, Debug, Default)]
pub struct DummySecurityOptions;

impl Taster for DummySecurityOptions {
    fn is_type_allowed(&self, _: &str) -> bool { true }
    fn is_module_allowed(&self, _: &str) -> bool { true }
    fn is_class_allowed(&self, _: &str) -> bool { true }
}

const SCALAR_TYPES: &[&str] = &[
    "None", "bool", "boolean", "string", "str", "int", "float",
    "datetime", "time", "date", "timedelta", "NoneType",
    "unicode", "decimal", "set", "frozenset",
];

const BASIC_TYPES: &[&str] = &[
    "dictionary", "list", "tuple", "reference", "dereference",
    "unpersistable", "persistent", "long_int", "long", "dict",
];

/// A configurable allow-list.
///
/// `SecurityOptions::new()` only allows scalars; `SecurityOptions::default()`
/// additionally allows the basic containers and references, which is what
/// new connections use unless told otherwise.
#[derive(Clone, Debug)]
pub struct SecurityOptions {
    allowed_types: BTreeSet<String>,
    allowed_modules: BTreeSet<String>,
    allowed_classes: BTreeSet<String>,
}

impl SecurityOptions {
    pub fn new() -> SecurityOptions {
        SecurityOptions {
            allowed_types: SCALAR_TYPES.iter().map(|s| s.to_string()).collect(),
            allowed_modules: BTreeSet::new(),
            allowed_classes: BTreeSet::new(),
        }
    }

    /// Allow dictionaries, lists, tuples and references.
    pub fn allow_basic_types(&mut self) -> &mut Self {
        self.allow_types(BASIC_TYPES)
    }

    pub fn allow_types<S: AsRef<str>>(&mut self, types: &[S]) -> &mut Self {
        for t in types {
            self.allowed_types.insert(t.as_ref().to_string());
        }
        self
    }

    /// Allow instances of the given qualified class names.  This also
    /// allows the basic types, the `instance`, `class` and `module` types,
    /// and each class's module.
    pub fn allow_instances_of<S: AsRef<str>>(&mut self, classes: &[S]) -> &mut Self {
        self.allow_basic_types();
        self.allow_types(&["instance", "class", "classobj", "module"]);
        for class in classes {
            let class = class.as_ref();
            self.allowed_types.insert(class.to_string());
            self.allowed_modules.insert(module_of(class).to_string());
            self.allowed_classes.insert(class.to_string());
        }
        self
    }

    pub fn allow_modules<S: AsRef<str>>(&mut self, modules: &[S]) -> &mut Self {
        for m in modules {
            self.allowed_modules.insert(m.as_ref().to_string());
        }
        self
    }
}

impl Default for SecurityOptions {
    fn default() -> Self {
        let mut options = SecurityOptions::new();
        options.allow_basic_types();
        options
    }
}

impl Taster for SecurityOptions {
    fn is_type_allowed(&self, type_name: &str) -> bool {
        self.allowed_types.contains(type_name)
    }

    fn is_module_allowed(&self, module_name: &str) -> bool {
        self.allowed_modules.contains(module_name)
    }

    fn is_class_allowed(&self, class_name: &str) -> bool {
        self.allowed_classes.contains(class_name)
    }
}

/// The module part of a qualified name ("" for undotted names).
pub fn module_of(qualified: &str) -> &str {
    match qualified.rfind('.') {
        Some(idx) => &qualified[..idx],
        None => "",
    }
}
