// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Error objects and codes

use std::fmt;
use std::io;
use std::error;
use std::result;
use serde::{ser, de};

use crate::failure::CopiedFailure;

/// Reasons for a fatal protocol (framing) error.
#[derive(Clone, PartialEq, Debug)]
pub enum ErrorCode {
    /// The peer speaks the old LIST-based banana
    OldBanana,
    /// More than 64 header bytes before the type byte
    PrefixTooLong,
    /// Header does not fit into 64 bits
    HeaderOverflow,
    /// Unknown type byte
    InvalidTypeByte(u8),
    /// ERROR token larger than `SIZE_LIMIT`
    OversizedError(u64),
    /// CLOSE for a different open id than the current sequence
    LostSync(u64, u64),
    /// OPEN received while still reading the previous OPEN's index tokens
    OpenAfterOpen,
    /// VOCAB token with an index missing from the table
    UnknownVocab(u64),
    /// `unicode` payload is not valid UTF-8
    StringNotUTF8,
    /// OPEN sequence type nobody knows
    UnknownOpenType(String),
    /// An answer or error for a request we never sent
    UnknownRequest(u64),
    /// The peer sent us an ERROR token
    RemoteError(String),
    /// An outgoing ERROR message exceeds `SIZE_LIMIT`
    MessageTooLong(usize),
    /// Recursive structure found, which the serde bridge can't represent
    Recursive,
    /// Any other protocol-level breakage
    Protocol(String),
    /// Structure deserialization error (e.g., unknown variant)
    Structure(String),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ErrorCode::OldBanana =>
                write!(fmt, "oldbanana peer detected, compatibility code not yet written"),
            ErrorCode::PrefixTooLong => write!(fmt, "token prefix is limited to 64 bytes"),
            ErrorCode::HeaderOverflow => write!(fmt, "token header too large"),
            ErrorCode::InvalidTypeByte(b) => write!(fmt, "Invalid Type Byte 0x{:x}", b),
            ErrorCode::OversizedError(n) => write!(fmt, "oversized ERROR token ({})", n),
            ErrorCode::LostSync(got, expected) =>
                write!(fmt, "lost sync, got CLOSE({}) but expecting {}", got, expected),
            ErrorCode::OpenAfterOpen => write!(fmt, "OPEN token followed by OPEN"),
            ErrorCode::UnknownVocab(n) => write!(fmt, "unknown vocabulary index {}", n),
            ErrorCode::StringNotUTF8 => write!(fmt, "string is not UTF-8 encoded"),
            ErrorCode::UnknownOpenType(ref t) => write!(fmt, "unknown OPEN type '{}'", t),
            ErrorCode::UnknownRequest(id) => write!(fmt, "non-existent reqID '{}'", id),
            ErrorCode::RemoteError(ref msg) => write!(fmt, "remote error: {}", msg),
            ErrorCode::MessageTooLong(n) =>
                write!(fmt, "error string is too long to send ({})", n),
            ErrorCode::Recursive => write!(fmt, "recursive structure found"),
            ErrorCode::Protocol(ref s) => fmt.write_str(s),
            ErrorCode::Structure(ref s) => fmt.write_str(s),
        }
    }
}

/// A localized rejection of one subtree of the incoming (or outgoing) data.
///
/// The location is a dotted path like `root.[1].{}[b]` naming the node that
/// was being processed; only the first location set sticks.
#[derive(Clone, PartialEq, Debug)]
pub struct Violation {
    location: Option<String>,
    message: String,
}

impl Violation {
    pub fn new<S: Into<String>>(message: S) -> Violation {
        Violation { location: None, message: message.into() }
    }

    pub fn at<L: Into<String>, S: Into<String>>(location: L, message: S) -> Violation {
        Violation { location: Some(location.into()), message: message.into() }
    }

    pub fn set_location(&mut self, location: &str) {
        if self.location.is_none() {
            self.location = Some(location.into());
        }
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Extend the message, e.g. with "in outbound method results".
    pub fn suffixed(mut self, suffix: &str) -> Violation {
        self.message.push(' ');
        self.message.push_str(suffix);
        self
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self.location {
            Some(ref loc) => write!(fmt, "Violation (at {}): {}", loc, self.message),
            None => write!(fmt, "Violation: {}", self.message),
        }
    }
}

impl error::Error for Violation {}

/// This type represents all possible errors that can occur when encoding,
/// decoding or talking to a peer.
#[derive(Debug)]
pub enum Error {
    /// Some IO error occurred when reading or writing a stream.
    Io(io::Error),
    /// The byte stream violated the Banana framing; the connection is dead.
    Banana(ErrorCode),
    /// A schema or protocol rule rejected part of the data.
    Violation(Violation),
    /// The security taster refused a type, module or class.
    Insecure(String),
    /// The broker (or the reference) is no longer connected.
    DeadReference(String),
    /// The pending call was cancelled locally.
    Cancelled,
    /// The remote side raised an exception while running our call.
    Remote(CopiedFailure),
    /// Error while transforming into Rust values.
    Syntax(ErrorCode),
}

impl Error {
    /// True if this error means the peer is gone.
    pub fn is_disconnection(&self) -> bool {
        match *self {
            Error::DeadReference(_) => true,
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Error {
        Error::Io(error)
    }
}

impl From<Violation> for Error {
    fn from(violation: Violation) -> Error {
        Error::Violation(violation)
    }
}

pub type Result<T> = result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Io(ref error) => fmt::Display::fmt(error, fmt),
            Error::Banana(ref code) => write!(fmt, "BananaError: {}", code),
            Error::Violation(ref v) => fmt::Display::fmt(v, fmt),
            Error::Insecure(ref why) => write!(fmt, "InsecureJelly: {}", why),
            Error::DeadReference(ref why) => write!(fmt, "DeadReferenceError: {}", why),
            Error::Cancelled => write!(fmt, "call cancelled"),
            Error::Remote(ref failure) => write!(fmt, "remote failure: {}", failure),
            Error::Syntax(ref code) => write!(fmt, "decoding error: {}", code),
        }
    }
}

impl error::Error for Error {}

impl de::Error for Error {
    fn custom<T: fmt::Display>(msg: T) -> Error {
        Error::Syntax(ErrorCode::Structure(msg.to_string()))
    }
}

impl ser::Error for Error {
    fn custom<T: fmt::Display>(msg: T) -> Error {
        Error::Syntax(ErrorCode::Structure(msg.to_string()))
    }
}
