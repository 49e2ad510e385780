// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! # Banana tokens
//!
//! Every token is a header, a type byte and (for some types) a body.  The
//! header is a little-endian base-128 number written with the high bit
//! clear, so the first byte with the high bit set is the type byte.  At most
//! 64 header bytes are accepted.
//!
//! Tokens can be split across reads at any byte, so the reader keeps the
//! unconsumed tail of its input and resumes on the next `feed`.

use std::io;
use std::collections::BTreeMap;
use byteorder::{ByteOrder, BigEndian};
use num_bigint::{BigInt, Sign};
use num_traits::{Signed, ToPrimitive};

use crate::consts::*;
use crate::error::{Error, ErrorCode, Result};

/// One wire-level token.
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    /// INT or NEG
    Int(i64),
    /// LONGINT or LONGNEG (or an INT/NEG header too large for i64)
    Long(BigInt),
    /// FLOAT
    Float(f64),
    /// STRING
    String(Vec<u8>),
    /// VOCAB index
    Vocab(u64),
    /// OPEN with its open id
    Open(u64),
    /// CLOSE with the open id it terminates
    Close(u64),
    /// ABORT
    Abort(u64),
    /// ERROR message
    Error(Vec<u8>),
}

/// Result of scanning the start of a buffer for a header and type byte.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Header {
    pub typebyte: u8,
    pub value: u64,
    /// Number of bytes consumed by header plus type byte.
    pub len: usize,
}

/// Find the header at the start of `buf`.  Returns `None` if the type byte
/// has not arrived yet.
pub fn scan_header(buf: &[u8]) -> Result<Option<Header>> {
    let pos = match buf.iter().position(|&b| b >= 0x80) {
        Some(pos) => pos,
        None => {
            if buf.len() > MAX_PREFIX {
                return Err(Error::Banana(ErrorCode::PrefixTooLong));
            }
            return Ok(None);
        }
    };
    if pos > MAX_PREFIX {
        return Err(Error::Banana(ErrorCode::PrefixTooLong));
    }
    let mut value: u64 = 0;
    for &b in buf[..pos].iter().rev() {
        value = value.checked_mul(128)
                     .and_then(|v| v.checked_add(b as u64))
                     .ok_or(Error::Banana(ErrorCode::HeaderOverflow))?;
    }
    Ok(Some(Header { typebyte: buf[pos], value, len: pos + 1 }))
}

/// Number of body bytes that follow a header of this type.
pub fn body_length(header: &Header) -> u64 {
    match header.typebyte {
        STRING | LONGINT | LONGNEG | ERROR => header.value,
        FLOAT => 8,
        _ => 0,
    }
}

fn header_int(value: u64, negative: bool) -> Token {
    match value.to_i64() {
        Some(v) if negative => Token::Int(-v),
        Some(v) => Token::Int(v),
        None => {
            let big = BigInt::from(value);
            Token::Long(if negative { -big } else { big })
        }
    }
}

/// Build the token from a complete header and body.  Vocabulary lookups are
/// left to the caller.
pub fn decode_token(header: &Header, body: &[u8]) -> Result<Token> {
    Ok(match header.typebyte {
        INT     => header_int(header.value, false),
        NEG     => header_int(header.value, true),
        FLOAT   => Token::Float(BigEndian::read_f64(body)),
        STRING  => Token::String(body.to_vec()),
        LONGINT => Token::Long(BigInt::from_bytes_be(Sign::Plus, body)),
        LONGNEG => Token::Long(-BigInt::from_bytes_be(Sign::Plus, body)),
        VOCAB   => Token::Vocab(header.value),
        OPEN    => Token::Open(header.value),
        CLOSE   => Token::Close(header.value),
        ABORT   => Token::Abort(header.value),
        ERROR   => Token::Error(body.to_vec()),
        LIST    => return Err(Error::Banana(ErrorCode::OldBanana)),
        other   => return Err(Error::Banana(ErrorCode::InvalidTypeByte(other))),
    })
}

/// Splits a byte stream into tokens, without any schema checking.
///
/// This is what the `tokens` demo and the tests use; the protocol's receive
/// loop does its own scanning so it can reject bodies before they arrive.
#[derive(Default)]
pub struct TokenReader {
    buffer: Vec<u8>,
}

impl TokenReader {
    pub fn new() -> TokenReader {
        TokenReader { buffer: Vec::new() }
    }

    /// Append `chunk` and return all tokens completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Token>> {
        self.buffer.extend_from_slice(chunk);
        let mut tokens = Vec::new();
        let mut pos = 0;
        while pos < self.buffer.len() {
            let header = match scan_header(&self.buffer[pos..])? {
                Some(h) => h,
                None => break,
            };
            if header.typebyte == ERROR && header.value > SIZE_LIMIT as u64 {
                return Err(Error::Banana(ErrorCode::OversizedError(header.value)));
            }
            let start = pos + header.len;
            let avail = (self.buffer.len() - start) as u64;
            let needed = body_length(&header);
            if avail < needed {
                break;
            }
            let end = start + needed as usize;
            tokens.push(decode_token(&header, &self.buffer[start..end])?);
            pos = end;
        }
        self.buffer.drain(..pos);
        Ok(tokens)
    }

    /// True if a partial token is buffered.
    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }
}

/// Decode a complete byte slice into tokens; trailing partial tokens are an
/// error.
pub fn tokens_from_slice(data: &[u8]) -> Result<Vec<Token>> {
    let mut reader = TokenReader::new();
    let tokens = reader.feed(data)?;
    if reader.has_pending() {
        return Err(Error::Banana(ErrorCode::Protocol("truncated token".into())));
    }
    Ok(tokens)
}

/// Write a base-128 header.
pub fn write_header<W: io::Write>(w: &mut W, mut value: u64) -> io::Result<()> {
    if value == 0 {
        return w.write_all(&[0]);
    }
    let mut buf = [0u8; 10];
    let mut n = 0;
    while value > 0 {
        buf[n] = (value & 0x7f) as u8;
        value >>= 7;
        n += 1;
    }
    w.write_all(&buf[..n])
}

fn write_long<W: io::Write>(w: &mut W, magnitude: &[u8], negative: bool) -> io::Result<()> {
    write_header(w, magnitude.len() as u64)?;
    w.write_all(&[if negative { LONGNEG } else { LONGINT }])?;
    w.write_all(magnitude)
}

const INT_LIMIT: i64 = 1 << 31;

fn write_i64<W: io::Write>(w: &mut W, v: i64) -> io::Result<()> {
    if v >= INT_LIMIT {
        let bytes = (v as u64).to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        write_long(w, &bytes[skip..], false)
    } else if v >= 0 {
        write_header(w, v as u64)?;
        w.write_all(&[INT])
    } else if v >= -INT_LIMIT {
        write_header(w, v.unsigned_abs())?;
        w.write_all(&[NEG])
    } else {
        let bytes = v.unsigned_abs().to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        write_long(w, &bytes[skip..], true)
    }
}

fn write_bigint<W: io::Write>(w: &mut W, v: &BigInt) -> io::Result<()> {
    match v.to_i64() {
        Some(small) => write_i64(w, small),
        None => write_long(w, &v.abs().to_bytes_be().1, v.is_negative()),
    }
}

/// Writes tokens to a byte sink, compressing strings found in the outgoing
/// vocabulary into VOCAB tokens.
pub struct TokenWriter<W> {
    writer: W,
    vocab: BTreeMap<Vec<u8>, u64>,
}

impl<W: io::Write> TokenWriter<W> {
    pub fn new(writer: W) -> Self {
        TokenWriter { writer, vocab: BTreeMap::new() }
    }

    /// Unwrap the `Writer` from the `TokenWriter`.
    pub fn into_inner(self) -> W {
        self.writer
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Replace the table used for outgoing string compression.
    pub fn set_vocabulary(&mut self, table: &BTreeMap<u64, Vec<u8>>) {
        self.vocab = table.iter().map(|(k, v)| (v.clone(), *k)).collect();
    }

    pub fn clear_vocabulary(&mut self) {
        self.vocab.clear();
    }

    pub fn write(&mut self, token: &Token) -> Result<()> {
        let w = &mut self.writer;
        match *token {
            Token::Int(v) => write_i64(w, v)?,
            Token::Long(ref v) => write_bigint(w, v)?,
            Token::Float(f) => {
                let mut buf = [0u8; 9];
                buf[0] = FLOAT;
                BigEndian::write_f64(&mut buf[1..], f);
                w.write_all(&buf)?;
            }
            Token::String(ref s) => match self.vocab.get(s) {
                Some(&index) => {
                    write_header(w, index)?;
                    w.write_all(&[VOCAB])?;
                }
                None => {
                    write_header(w, s.len() as u64)?;
                    w.write_all(&[STRING])?;
                    w.write_all(s)?;
                }
            },
            Token::Vocab(index) => {
                write_header(w, index)?;
                w.write_all(&[VOCAB])?;
            }
            Token::Open(id) => {
                write_header(w, id)?;
                w.write_all(&[OPEN])?;
            }
            Token::Close(id) => {
                write_header(w, id)?;
                w.write_all(&[CLOSE])?;
            }
            Token::Abort(id) => {
                write_header(w, id)?;
                w.write_all(&[ABORT])?;
            }
            Token::Error(ref msg) => {
                if msg.len() > SIZE_LIMIT {
                    return Err(Error::Banana(ErrorCode::MessageTooLong(msg.len())));
                }
                write_header(w, msg.len() as u64)?;
                w.write_all(&[ERROR])?;
                w.write_all(msg)?;
            }
        }
        Ok(())
    }
}

/// Encode a sequence of tokens without vocabulary compression.
pub fn tokens_to_vec(tokens: &[Token]) -> Result<Vec<u8>> {
    let mut writer = TokenWriter::new(Vec::new());
    for token in tokens {
        writer.write(token)?;
    }
    Ok(writer.into_inner())
}
