// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! QuickCheck Arbitrary instances for object trees, and associated helpers.
//!
//! Graphs hold `Rc`s and can't cross threads, so the generators produce
//! plain trees that are turned into graphs inside the property.

use std::collections::BTreeSet;
use num_bigint::BigInt;
use quickcheck::{Arbitrary, Gen, empty_shrinker};
use rand::Rng;
use crate::{Graph, Heap, Value};

const MAX_DEPTH: u32 = 2;

/// Something that can be a dict key or set element.
#[derive(Clone, Debug)]
pub enum Key {
    None,
    I64(i64),
    Bytes(Vec<u8>),
    String(String),
    Tuple(Vec<Key>),
}

#[derive(Clone, Debug)]
pub enum Tree {
    None,
    Bool(bool),
    I64(i64),
    Int(BigInt),
    F64(f64),
    Bytes(Vec<u8>),
    String(String),
    List(Vec<Tree>),
    Tuple(Vec<Tree>),
    Set(Vec<Key>),
    FrozenSet(Vec<Key>),
    Dict(Vec<(Key, Tree)>),
}

impl Key {
    fn build(&self, heap: &mut Heap) -> Value {
        match *self {
            Key::None => Value::None,
            Key::I64(i) => Value::I64(i),
            Key::Bytes(ref b) => Value::Bytes(b.clone()),
            Key::String(ref s) => Value::String(s.clone()),
            Key::Tuple(ref items) => {
                let items = items.iter().map(|k| k.build(heap)).collect();
                heap.tuple(items)
            }
        }
    }
}

/// Build keys, dropping the ones that compare equal to an earlier one.
fn unique_keys<'a, I: Iterator<Item=&'a Key>>(heap: &mut Heap, keys: I) -> Vec<(usize, Value)> {
    let mut seen = BTreeSet::new();
    let mut result = Vec::new();
    for (i, key) in keys.enumerate() {
        let value = key.build(heap);
        if let Some(hashed) = heap.to_hashable(&value) {
            if seen.insert(hashed) {
                result.push((i, value));
            }
        }
    }
    result
}

impl Tree {
    pub fn build(&self, heap: &mut Heap) -> Value {
        match *self {
            Tree::None => Value::None,
            Tree::Bool(b) => Value::Bool(b),
            Tree::I64(i) => Value::I64(i),
            Tree::Int(ref i) => Value::Int(i.clone()),
            Tree::F64(f) => Value::F64(f),
            Tree::Bytes(ref b) => Value::Bytes(b.clone()),
            Tree::String(ref s) => Value::String(s.clone()),
            Tree::List(ref items) => {
                let items = items.iter().map(|t| t.build(heap)).collect();
                heap.list(items)
            }
            Tree::Tuple(ref items) => {
                let items = items.iter().map(|t| t.build(heap)).collect();
                heap.tuple(items)
            }
            Tree::Set(ref keys) => {
                let items = unique_keys(heap, keys.iter()).into_iter().map(|(_, v)| v).collect();
                heap.set(items)
            }
            Tree::FrozenSet(ref keys) => {
                let items = unique_keys(heap, keys.iter()).into_iter().map(|(_, v)| v).collect();
                heap.frozenset(items)
            }
            Tree::Dict(ref pairs) => {
                let keys = unique_keys(heap, pairs.iter().map(|&(ref k, _)| k));
                let pairs = keys.into_iter().map(|(i, k)| (k, pairs[i].1.build(heap))).collect();
                heap.dict(pairs)
            }
        }
    }

    pub fn to_graph(&self) -> Graph {
        let mut heap = Heap::new();
        let root = self.build(&mut heap);
        Graph::new(heap, root)
    }
}

fn gen_tree<G: Gen>(g: &mut G, depth: u32) -> Tree {
    let upper = if depth > 0 { 12 } else { 7 };
    match g.gen_range(0, upper) {
        // leaves
        0  => Tree::None,
        1  => Tree::Bool(Arbitrary::arbitrary(g)),
        2  => Tree::I64(Arbitrary::arbitrary(g)),
        3  => Tree::Int(gen_bigint(g)),
        4  => Tree::F64(Arbitrary::arbitrary(g)),
        5  => Tree::Bytes(Arbitrary::arbitrary(g)),
        6  => Tree::String(Arbitrary::arbitrary(g)),
        // recursive variants
        7  => Tree::List(gen_vec(g, depth - 1)),
        8  => Tree::Tuple(gen_vec(g, depth - 1)),
        9  => Tree::Set(gen_kvec(g, depth - 1)),
        10 => Tree::FrozenSet(gen_kvec(g, depth - 1)),
        11 => { let kvec = gen_kvec(g, depth - 1);
                let vvec = gen_vec(g, depth - 1);
                Tree::Dict(kvec.into_iter().zip(vvec).collect()) },
        _  => unreachable!(),
    }
}

fn gen_bigint<G: Gen>(g: &mut G) -> BigInt {
    // Values inside the i64 range come back as I64, so stay outside of it.
    let offset = BigInt::from(4) * BigInt::from(if g.gen() { i64::MIN } else { i64::MAX });
    offset + BigInt::from(g.gen::<i64>())
}

fn gen_vec<G: Gen>(g: &mut G, depth: u32) -> Vec<Tree> {
    let size = { let s = g.size(); g.gen_range(0, s) };
    (0..size).map(|_| gen_tree(g, depth)).collect()
}

fn gen_key<G: Gen>(g: &mut G, depth: u32) -> Key {
    let upper = if depth > 0 { 5 } else { 4 };
    match g.gen_range(0, upper) {
        0 => Key::None,
        1 => Key::I64(Arbitrary::arbitrary(g)),
        2 => Key::Bytes(Arbitrary::arbitrary(g)),
        3 => Key::String(Arbitrary::arbitrary(g)),
        4 => Key::Tuple(gen_kvec(g, depth - 1)),
        _ => unreachable!(),
    }
}

fn gen_kvec<G: Gen>(g: &mut G, depth: u32) -> Vec<Key> {
    let size = { let s = g.size(); g.gen_range(0, s) };
    (0..size).map(|_| gen_key(g, depth)).collect()
}

impl Arbitrary for Tree {
    fn arbitrary<G: Gen>(g: &mut G) -> Tree {
        gen_tree(g, MAX_DEPTH)
    }

    fn shrink(&self) -> Box<dyn Iterator<Item=Tree>> {
        match *self {
            Tree::None => empty_shrinker(),
            Tree::Bool(v) => Box::new(Arbitrary::shrink(&v).map(Tree::Bool)),
            Tree::I64(v) => Box::new(Arbitrary::shrink(&v).map(Tree::I64)),
            Tree::Int(_) => empty_shrinker(),
            Tree::F64(v) => Box::new(Arbitrary::shrink(&v).map(Tree::F64)),
            Tree::Bytes(ref v) => Box::new(Arbitrary::shrink(v).map(Tree::Bytes)),
            Tree::String(ref v) => Box::new(Arbitrary::shrink(v).map(Tree::String)),
            Tree::List(ref v) => Box::new(Arbitrary::shrink(v).map(Tree::List)),
            Tree::Tuple(ref v) => Box::new(Arbitrary::shrink(v).map(Tree::Tuple)),
            Tree::Set(ref v) => Box::new(Arbitrary::shrink(v).map(Tree::Set)),
            Tree::FrozenSet(ref v) => Box::new(Arbitrary::shrink(v).map(Tree::FrozenSet)),
            Tree::Dict(ref v) => Box::new(Arbitrary::shrink(v).map(Tree::Dict)),
        }
    }
}

impl Arbitrary for Key {
    fn arbitrary<G: Gen>(g: &mut G) -> Key {
        gen_key(g, MAX_DEPTH)
    }

    fn shrink(&self) -> Box<dyn Iterator<Item=Key>> {
        match *self {
            Key::None => empty_shrinker(),
            Key::I64(v) => Box::new(Arbitrary::shrink(&v).map(Key::I64)),
            Key::Bytes(ref v) => Box::new(Arbitrary::shrink(v).map(Key::Bytes)),
            Key::String(ref v) => Box::new(Arbitrary::shrink(v).map(Key::String)),
            Key::Tuple(ref v) => Box::new(Arbitrary::shrink(v).map(Key::Tuple)),
        }
    }
}
