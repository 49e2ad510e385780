// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Banana token framing, Jelly object graphs and a Perspective Broker core
//!
//! # Banana
//!
//! Banana is a binary token stream.  Every token is a base-128 header (at
//! most 64 bytes, least significant digit first) followed by a type byte and
//! an optional body.  Scalars (ints, long ints, floats, byte strings) are
//! single tokens; sequences are bracketed by OPEN and CLOSE tokens that
//! carry a sender-assigned open id.  An ABORT token abandons the current
//! sequence, and an ERROR token carries a fatal message to the peer.
//!
//! # Jelly
//!
//! Jelly encodes object graphs on top of Banana.  The first token of every
//! sequence is a type atom (`list`, `dict`, `instance`, `reference`, ...).
//! Objects seen twice are sent once and referenced by index afterwards, so
//! shared and cyclic structures come back with their identity intact.
//!
//! Decoding is guarded twice:
//!
//! * a `Taster` decides which types, modules and classes may be
//!   deserialized at all, and refusals are `Error::Insecure`;
//! * a `Constraint` describes the expected shape; tokens are checked before
//!   their bodies are read, and a mismatch is a `Violation` naming the path
//!   of the offending node (like `root.[3]`).
//!
//! A violation only fails the subtree it occurs in: the enclosing container
//! drops the child and decoding of the rest of the stream continues.
//!
//! Decoded objects live in a `Heap` arena and are handed out as a `Graph`
//! (heap plus root value).  `to_graph` and `from_graph` bridge graphs to
//! any serde-compatible Rust type.
//!
//! *Note on enums:* Enum variants are serialized as tuples `(name, data)`.
//! On deserialization, plain strings and single-entry dicts are accepted as
//! well.
//!
//! # Perspective Broker
//!
//! `Broker` implements the PB protocol state of one connection: remote
//! calls with request ids, answers and copied failures, reference counting
//! of exported objects, and disconnect notification.  It does no I/O of its
//! own; feed it received bytes with `data_received` and send whatever
//! `take_output` returns.  Each remote call returns a `PendingCall`, which
//! resolves exactly once and can be polled as a `Future`.
//!
//! # Exported API
//!
//! `jelly`/`jelly_to_vec` and `unjelly`/`unjelly_from_slice` handle single
//! objects, `Encoder`/`Decoder` handle streams of them, and the `tokens`
//! module gives access to the raw token layer.
//!
//! # Minimum Supported Rust Version
//!
//! The minimum supported version of the toolchain is 1.58.1.

#![cfg_attr(feature = "unstable", feature(test))]

pub use self::banana::{Encoder, Decoder};

pub use self::broker::{
    Arguments,
    Broker,
    BrokerOptions,
    PendingCall,
};

pub use self::slicer::{
    JellyOptions,
    PersistentStore,
    jelly,
    jelly_to_vec,
};

pub use self::unslicer::{
    ClassRegistry,
    PersistentLoad,
    Unjellyable,
    UnjellyOptions,
    unjelly,
    unjelly_from_slice,
};

pub use self::value::{
    Graph,
    Heap,
    HashableValue,
    Object,
    ObjId,
    Value,
    to_graph,
    from_graph,
};

pub use self::schema::{
    AttributeDict,
    Constraint,
    IntLimit,
    MethodSchema,
    RemoteInterface,
};

pub use self::taster::{Taster, SecurityOptions, DummySecurityOptions};
pub use self::failure::CopiedFailure;
pub use self::referenceable::{Referenceable, LocalReference, RemoteReference};
pub use self::tokens::Token;
pub use self::error::{Error, ErrorCode, Result, Violation};

pub mod banana;
pub mod broker;
pub mod error;
pub mod failure;
pub mod referenceable;
pub mod schema;
pub mod slicer;
pub mod taster;
pub mod tokens;
pub mod unslicer;
pub mod value;
mod consts;
mod value_impls;

#[cfg(test)]
#[path = "../test/mod.rs"]
mod test;
