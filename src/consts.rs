// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Constants for Banana type bytes and Jelly/PB atoms.
//!
//! These constants use the names the Twisted sources use.  They are not in an
//! enum because it's not very useful to make it one.

pub const LIST             : u8 = 0x80;    // old banana list, refused
pub const INT              : u8 = 0x81;    // non-negative int below 2**31; header is value
pub const STRING           : u8 = 0x82;    // byte string; header is length
pub const NEG              : u8 = 0x83;    // negative int in [-2**31, 0); header is magnitude
pub const FLOAT            : u8 = 0x84;    // 8-byte big-endian double, no header
pub const LONGINT          : u8 = 0x85;    // big positive int; header is byte count
pub const LONGNEG          : u8 = 0x86;    // big negative int; header is byte count
pub const VOCAB            : u8 = 0x87;    // string from the vocabulary table; header is index
pub const OPEN             : u8 = 0x88;    // start of a sequence; header is open id
pub const CLOSE            : u8 = 0x89;    // end of a sequence; header is open id
pub const ABORT            : u8 = 0x8A;    // abandon the current sequence
pub const ERROR            : u8 = 0x8D;    // fatal error message; header is length

/// Longest accepted header, in bytes.
pub const MAX_PREFIX: usize = 64;
/// Default body limit for ERROR tokens (and the default string constraint).
pub const SIZE_LIMIT: usize = 1000;

pub const TRUNCATION_MARKER: &str = "\n\n-- TRACEBACK TRUNCATED --\n";
pub const TRACEBACK_LIMIT: usize = 1900;
pub const TRACEBACK_UNAVAILABLE: &str = "Traceback unavailable\n";
pub const FAILURE_CLASS: &str = "twisted.python.failure.Failure";

// Jelly atoms
pub const NONE_ATOM        : &str = "None";
pub const BOOLEAN_ATOM     : &str = "boolean";
pub const UNICODE_ATOM     : &str = "unicode";
pub const LIST_ATOM        : &str = "list";
pub const TUPLE_ATOM       : &str = "tuple";
pub const DICT_ATOM        : &str = "dict";
pub const SET_ATOM         : &str = "set";
pub const FROZENSET_ATOM   : &str = "frozenset";
pub const INSTANCE_ATOM    : &str = "instance";
pub const REFERENCE_ATOM   : &str = "reference";
pub const DEREFERENCE_ATOM : &str = "dereference";
pub const CLASS_ATOM       : &str = "class";
pub const MODULE_ATOM      : &str = "module";
pub const FUNCTION_ATOM    : &str = "function";
pub const METHOD_ATOM      : &str = "method";
pub const VOCAB_ATOM       : &str = "vocab";
pub const PERSISTENT_ATOM  : &str = "persistent";
pub const UNPERSISTABLE_ATOM : &str = "unpersistable";

// PB atoms
pub const CALL_ATOM        : &str = "call";
pub const ANSWER_ATOM      : &str = "answer";
pub const ERROR_ATOM       : &str = "error";
pub const MY_REFERENCE     : &str = "my-reference";
pub const YOUR_REFERENCE   : &str = "your-reference";
pub const COPYABLE_ATOM    : &str = "copyable";

/// Name used in Violation messages for each type byte.
pub fn token_name(typebyte: u8) -> &'static str {
    match typebyte {
        LIST    => "LIST",
        INT     => "INT",
        STRING  => "STRING",
        NEG     => "NEG",
        FLOAT   => "FLOAT",
        LONGINT => "LONGINT",
        LONGNEG => "LONGNEG",
        VOCAB   => "VOCAB",
        OPEN    => "OPEN",
        CLOSE   => "CLOSE",
        ABORT   => "ABORT",
        ERROR   => "ERROR",
        _       => "???",
    }
}
