// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! # Banana streams
//!
//! The receive side scans token headers as they arrive and asks the decoder
//! whether it wants the token before the body is read, so oversized or
//! unwanted bodies are skipped without ever being buffered completely.
//! While a sequence is being discarded, its tokens are only counted.
//!
//! The send side numbers OPEN tokens connection-wide and compresses strings
//! found in the outgoing vocabulary.
//!
//! `Encoder` and `Decoder` carry plain jelly objects over a byte stream; the
//! broker uses the same machinery for PB frames.

use std::collections::BTreeMap;
use log::debug;

use crate::consts::*;
use crate::error::{Error, ErrorCode, Result, Violation};
use crate::slicer::{JellyOptions, Jellier, Piece};
use crate::tokens::{body_length, decode_token, scan_header, Token, TokenWriter};
use crate::unslicer::{is_rejection, Delivery, Environment, Mode, NoEnvironment,
                      Unjellier, UnjellyOptions, ABORT_RECEIVED};
use crate::value::{Graph, Value};

/// Receiving half of a connection.
pub(crate) struct Receiver {
    buffer: Vec<u8>,
    /// Body bytes of a rejected token that are still to come.
    skip_bytes: u64,
    /// Set between an OPEN and the end of its index tokens.
    in_open: bool,
    open_id: u64,
    opentype: Vec<Vec<u8>>,
    vocabulary: BTreeMap<u64, Vec<u8>>,
    unjellier: Unjellier,
}

impl Receiver {
    pub fn new(mode: Mode, options: UnjellyOptions) -> Receiver {
        Receiver {
            buffer: Vec::new(),
            skip_bytes: 0,
            in_open: false,
            open_id: 0,
            opentype: Vec::new(),
            vocabulary: BTreeMap::new(),
            unjellier: Unjellier::new(mode, options),
        }
    }

    pub fn take_deliveries(&mut self) -> Vec<Delivery> {
        self.unjellier.take_deliveries()
    }

    /// Number of open sequences, for diagnostics.
    pub fn depth(&self) -> usize {
        self.unjellier.depth()
    }

    /// Process newly received bytes.  An error is fatal for the connection.
    pub fn data_received(&mut self, data: &[u8], env: &mut dyn Environment) -> Result<()> {
        self.buffer.extend_from_slice(data);
        let mut pos = 0;
        let result = self.process(&mut pos, env);
        self.buffer.drain(..pos.min(self.buffer.len()));
        result
    }

    fn process(&mut self, pos: &mut usize, env: &mut dyn Environment) -> Result<()> {
        loop {
            if self.skip_bytes > 0 {
                let available = (self.buffer.len() - *pos) as u64;
                let skipped = self.skip_bytes.min(available);
                *pos += skipped as usize;
                self.skip_bytes -= skipped;
                if self.skip_bytes > 0 {
                    return Ok(());
                }
            }
            let header = match scan_header(&self.buffer[*pos..])? {
                Some(header) => header,
                None => return Ok(()),
            };
            let typebyte = header.typebyte;
            match typebyte {
                LIST => return Err(Error::Banana(ErrorCode::OldBanana)),
                INT | STRING | NEG | FLOAT | LONGINT | LONGNEG | VOCAB | OPEN | CLOSE |
                ABORT | ERROR => {}
                other => return Err(Error::Banana(ErrorCode::InvalidTypeByte(other))),
            }

            let mut rejected = self.unjellier.discarding();
            let was_in_open = self.in_open;
            if typebyte == OPEN {
                if self.in_open {
                    return Err(Error::Banana(ErrorCode::OpenAfterOpen));
                }
                self.in_open = true;
            }
            if !rejected && typebyte != ABORT && typebyte != CLOSE && typebyte != ERROR {
                let check = if was_in_open {
                    self.unjellier.check_index_token(typebyte, header.value, &self.opentype)
                } else {
                    self.unjellier.check_token(typebyte, header.value)
                };
                if let Err(e) = check {
                    if !is_rejection(&e) {
                        return Err(e);
                    }
                    rejected = true;
                    self.unjellier.reject(e, self.in_open)?;
                    self.in_open = false;
                    self.opentype.clear();
                }
            }
            if typebyte == ERROR && header.value > SIZE_LIMIT as u64 {
                return Err(Error::Banana(ErrorCode::OversizedError(header.value)));
            }

            match typebyte {
                OPEN => {
                    *pos += header.len;
                    self.open_id = header.value;
                    if rejected {
                        if self.in_open {
                            // everything below a discarded sequence goes too
                            self.unjellier.discard_open();
                            self.in_open = false;
                        }
                    } else {
                        self.opentype.clear();
                    }
                    continue;
                }
                CLOSE => {
                    *pos += header.len;
                    if self.in_open {
                        return Err(Error::Banana(ErrorCode::Protocol(
                            "CLOSE token before the OPEN type was complete".into())));
                    }
                    if !self.unjellier.discard_close() {
                        self.unjellier.handle_close(header.value, env)?;
                        self.update_vocabulary();
                    }
                    continue;
                }
                ABORT => {
                    *pos += header.len;
                    if !rejected {
                        let in_open = self.in_open;
                        self.in_open = false;
                        self.opentype.clear();
                        self.unjellier.reject(Error::Violation(Violation::new(ABORT_RECEIVED)), in_open)?;
                    }
                    continue;
                }
                _ => {}
            }

            let start = *pos + header.len;
            let available = (self.buffer.len() - start) as u64;
            let needed = body_length(&header);
            if available < needed {
                if rejected && typebyte != ERROR {
                    *pos = self.buffer.len();
                    self.skip_bytes = needed - available;
                }
                return Ok(());
            }
            let end = start + needed as usize;
            let token = decode_token(&header, &self.buffer[start..end])?;
            *pos = end;

            let value = match token {
                Token::Error(msg) => return Err(Error::Banana(ErrorCode::RemoteError(
                    String::from_utf8_lossy(&msg).into_owned()))),
                _ if rejected => continue,
                Token::Int(i) => Value::I64(i),
                Token::Long(i) => Value::from_bigint(i),
                Token::Float(f) => Value::F64(f),
                Token::String(s) => Value::Bytes(s),
                Token::Vocab(index) => match self.vocabulary.get(&index) {
                    Some(s) => Value::Bytes(s.clone()),
                    None => return Err(Error::Banana(ErrorCode::UnknownVocab(index))),
                },
                Token::Open(_) | Token::Close(_) | Token::Abort(_) => continue,
            };

            if self.in_open {
                if let Value::Bytes(s) = value {
                    self.opentype.push(s);
                }
                if self.unjellier.handle_open(self.open_id, &self.opentype)? {
                    self.in_open = false;
                    self.opentype.clear();
                }
            } else {
                self.unjellier.handle_token(value, env)?;
                self.update_vocabulary();
            }
        }
    }

    fn update_vocabulary(&mut self) {
        if let Some(table) = self.unjellier.take_vocabulary() {
            debug!("incoming vocabulary replaced ({} entries)", table.len());
            self.vocabulary = table;
        }
    }
}

/// Sending half of a connection.
pub(crate) struct Sender {
    open_count: u64,
    writer: TokenWriter<Vec<u8>>,
}

impl Sender {
    pub fn new() -> Sender {
        Sender { open_count: 0, writer: TokenWriter::new(Vec::new()) }
    }

    /// Write out the frames a `Jellier` has built up.
    pub fn send(&mut self, jellier: &Jellier, root: &Piece) -> Result<()> {
        let mut tokens = Vec::new();
        jellier.flatten(root, &mut self.open_count, &mut tokens);
        self.send_tokens(&tokens)
    }

    pub fn send_tokens(&mut self, tokens: &[Token]) -> Result<()> {
        for token in tokens {
            self.writer.write(token)?;
        }
        Ok(())
    }

    /// Announce a new outgoing vocabulary and compress with it from now on.
    pub fn set_vocabulary(&mut self, table: &BTreeMap<u64, Vec<u8>>) -> Result<()> {
        self.writer.clear_vocabulary();
        let id = self.open_count;
        self.open_count += 1;
        let mut tokens = vec![Token::Open(id), Token::String(VOCAB_ATOM.as_bytes().to_vec())];
        for (&index, string) in table {
            tokens.push(Token::Int(index as i64));
            tokens.push(Token::String(string.clone()));
        }
        tokens.push(Token::Close(id));
        self.send_tokens(&tokens)?;
        self.writer.set_vocabulary(table);
        Ok(())
    }

    /// Send a fatal error message.  Long messages are cut to the limit.
    pub fn send_error(&mut self, message: &str) -> Result<()> {
        let mut end = message.len().min(SIZE_LIMIT);
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        self.writer.write(&Token::Error(message[..end].as_bytes().to_vec()))
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(self.writer.get_mut())
    }
}

/// Writes a stream of jelly objects.
///
/// Open ids keep counting across objects, as they do on a connection.
pub struct Encoder {
    options: JellyOptions,
    sender: Sender,
}

impl Encoder {
    pub fn new(options: JellyOptions) -> Encoder {
        Encoder { options, sender: Sender::new() }
    }

    /// Send a vocabulary table; later strings found in it are sent as VOCAB
    /// tokens.
    pub fn vocabulary(&mut self, table: &BTreeMap<u64, Vec<u8>>) -> Result<()> {
        self.sender.set_vocabulary(table)
    }

    pub fn encode(&mut self, graph: &Graph) -> Result<()> {
        let mut jellier = Jellier::new(&graph.heap, &self.options, None);
        let root = jellier.slice(&graph.root, true)?;
        self.sender.send(&jellier, &root)
    }

    /// Bytes written since the last call.
    pub fn take_output(&mut self) -> Vec<u8> {
        self.sender.take_output()
    }
}

/// Reads a stream of jelly objects.
///
/// Feed it bytes in chunks of any size.  Each complete top-level object is
/// returned as `Ok`, or as the `Err` that rejected it; rejecting one object
/// does not affect the next.  An `Err` from `feed` itself means the stream
/// is broken and the decoder can not be used any more.
pub struct Decoder {
    receiver: Receiver,
    broken: bool,
}

impl Decoder {
    pub fn new(options: UnjellyOptions) -> Decoder {
        Decoder { receiver: Receiver::new(Mode::Jelly, options), broken: false }
    }

    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Result<Graph>>> {
        if self.broken {
            return Err(Error::Banana(ErrorCode::Protocol("stream is broken".into())));
        }
        if let Err(e) = self.receiver.data_received(data, &mut NoEnvironment) {
            self.broken = true;
            return Err(e);
        }
        Ok(self.receiver.take_deliveries().into_iter().filter_map(|delivery| match delivery {
            Delivery::Object(graph) => Some(Ok(graph)),
            Delivery::Rejected(err) => Some(Err(err)),
            _ => None,
        }).collect())
    }
}
