// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Serializer/Deserializer implementations for `value::Graph`.
//!
//! Rust values map onto jelly objects like this:
//!
//! * `()`, `None` and unit structs become None
//! * strings and chars become `unicode`, byte buffers become Banana strings
//! * sequences become lists, tuples and tuple structs become tuples
//! * maps and structs become dicts (struct field names are `unicode` keys)
//! * enum variants become tuples `(name,)`, `(name, value)`,
//!   `(name, [items])` or `(name, {fields})`
//!
//! When deserializing, a variant can also be given as a plain string or as
//! a dict with a single entry, instances deserialize like dicts of their
//! attributes, and any shared object is simply visited again.  Cyclic
//! graphs can't be represented and give an error.

use std::vec;
use std::result::Result as StdResult;
use num_traits::ToPrimitive;
use serde::{ser, de};
use serde::ser::{Serialize, SerializeMap, SerializeSeq};
use serde::de::{DeserializeOwned, IntoDeserializer, Visitor};

use crate::error::{Error, ErrorCode, Result};
use crate::value::{Graph, Heap, Object, ObjId, Value};

fn structure<S: Into<String>>(msg: S) -> Error {
    Error::Syntax(ErrorCode::Structure(msg.into()))
}

impl Serialize for Graph {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> StdResult<S::Ok, S::Error> {
        Node { heap: &self.heap, value: &self.root, ancestors: Vec::new() }.serialize(serializer)
    }
}

/// A value together with its heap, for serializing graphs with serde.
struct Node<'a> {
    heap: &'a Heap,
    value: &'a Value,
    ancestors: Vec<ObjId>,
}

impl<'a> Node<'a> {
    fn child(&self, value: &'a Value, parent: ObjId) -> Node<'a> {
        let mut ancestors = self.ancestors.clone();
        ancestors.push(parent);
        Node { heap: self.heap, value, ancestors }
    }
}

impl<'a> Serialize for Node<'a> {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> StdResult<S::Ok, S::Error> {
        use serde::ser::Error as SerError;
        let id = match *self.value {
            Value::None => return serializer.serialize_unit(),
            Value::Bool(b) => return serializer.serialize_bool(b),
            Value::I64(i) => return serializer.serialize_i64(i),
            Value::Int(ref i) => return match i.to_i64() {
                Some(i) => serializer.serialize_i64(i),
                None => serializer.serialize_str(&i.to_string()),
            },
            Value::F64(f) => return serializer.serialize_f64(f),
            Value::Bytes(ref b) => return serializer.serialize_bytes(b),
            Value::String(ref s) => return serializer.serialize_str(s),
            Value::Failure(ref v) => return serializer.serialize_str(&v.to_string()),
            Value::Obj(id) => id,
        };
        if self.ancestors.contains(&id) {
            return Err(S::Error::custom(ErrorCode::Recursive));
        }
        let object = self.heap.get(id).ok_or_else(
            || S::Error::custom(format!("dangling object #{}", id.index())))?;
        match *object {
            Object::List(ref items) | Object::Tuple(ref items) |
            Object::Set(ref items) | Object::FrozenSet(ref items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(&self.child(item, id))?;
                }
                seq.end()
            }
            Object::Dict(ref pairs) => {
                let mut map = serializer.serialize_map(Some(pairs.len()))?;
                for &(ref k, ref v) in pairs {
                    map.serialize_entry(&self.child(k, id), &self.child(v, id))?;
                }
                map.end()
            }
            Object::Instance { ref class, ref state } => {
                let mut map = serializer.serialize_map(Some(state.len() + 1))?;
                map.serialize_entry("__class__", class)?;
                for &(ref k, ref v) in state {
                    map.serialize_entry(k, &self.child(v, id))?;
                }
                map.end()
            }
            Object::Class(ref name) | Object::Module(ref name) | Object::Function(ref name) |
            Object::Unpersistable(ref name) | Object::Method { ref name, .. } =>
                serializer.serialize_str(name),
            Object::Persistent(ref payload) => self.child(payload, id).serialize(serializer),
            Object::Remote(ref remote) => serializer.serialize_str(&format!("{:?}", remote)),
            Object::Local(ref local) => serializer.serialize_str(&format!("{:?}", local)),
        }
    }
}

/// Serializes Rust values into objects on a heap.
struct Serializer<'h> {
    heap: &'h mut Heap,
}

enum SeqKind {
    List,
    Tuple,
    Variant(&'static str),
}

struct Compound<'a, 'h> {
    ser: &'a mut Serializer<'h>,
    items: Vec<Value>,
    kind: SeqKind,
}

struct MapCompound<'a, 'h> {
    ser: &'a mut Serializer<'h>,
    pairs: Vec<(Value, Value)>,
    key: Option<Value>,
    variant: Option<&'static str>,
}

fn variant_name(name: &str) -> Value {
    Value::String(name.into())
}

impl<'a, 'h> ser::Serializer for &'a mut Serializer<'h> {
    type Ok = Value;
    type Error = Error;

    type SerializeSeq = Compound<'a, 'h>;
    type SerializeTuple = Compound<'a, 'h>;
    type SerializeTupleStruct = Compound<'a, 'h>;
    type SerializeTupleVariant = Compound<'a, 'h>;
    type SerializeMap = MapCompound<'a, 'h>;
    type SerializeStruct = MapCompound<'a, 'h>;
    type SerializeStructVariant = MapCompound<'a, 'h>;

    fn serialize_bool(self, value: bool) -> Result<Value> {
        Ok(Value::Bool(value))
    }

    fn serialize_i8(self, value: i8) -> Result<Value> {
        Ok(Value::I64(value.into()))
    }

    fn serialize_i16(self, value: i16) -> Result<Value> {
        Ok(Value::I64(value.into()))
    }

    fn serialize_i32(self, value: i32) -> Result<Value> {
        Ok(Value::I64(value.into()))
    }

    fn serialize_i64(self, value: i64) -> Result<Value> {
        Ok(Value::I64(value))
    }

    fn serialize_u8(self, value: u8) -> Result<Value> {
        Ok(Value::I64(value.into()))
    }

    fn serialize_u16(self, value: u16) -> Result<Value> {
        Ok(Value::I64(value.into()))
    }

    fn serialize_u32(self, value: u32) -> Result<Value> {
        Ok(Value::I64(value.into()))
    }

    fn serialize_u64(self, value: u64) -> Result<Value> {
        Ok(Value::from_bigint(value.into()))
    }

    fn serialize_f32(self, value: f32) -> Result<Value> {
        Ok(Value::F64(value.into()))
    }

    fn serialize_f64(self, value: f64) -> Result<Value> {
        Ok(Value::F64(value))
    }

    fn serialize_char(self, value: char) -> Result<Value> {
        Ok(Value::String(value.to_string()))
    }

    fn serialize_str(self, value: &str) -> Result<Value> {
        Ok(Value::String(value.into()))
    }

    fn serialize_bytes(self, value: &[u8]) -> Result<Value> {
        Ok(Value::Bytes(value.to_vec()))
    }

    fn serialize_none(self) -> Result<Value> {
        Ok(Value::None)
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<Value> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<Value> {
        Ok(Value::None)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<Value> {
        Ok(Value::None)
    }

    fn serialize_unit_variant(self, _name: &'static str, _index: u32, variant: &'static str)
                              -> Result<Value> {
        Ok(self.heap.tuple(vec![variant_name(variant)]))
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(self, _name: &'static str, value: &T)
                                                       -> Result<Value> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(self, _name: &'static str, _index: u32,
                                                        variant: &'static str, value: &T)
                                                        -> Result<Value> {
        let data = value.serialize(&mut *self)?;
        Ok(self.heap.tuple(vec![variant_name(variant), data]))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<Self::SerializeSeq> {
        Ok(Compound { ser: self, items: Vec::with_capacity(len.unwrap_or(0)), kind: SeqKind::List })
    }

    fn serialize_tuple(self, len: usize) -> Result<Self::SerializeTuple> {
        Ok(Compound { ser: self, items: Vec::with_capacity(len), kind: SeqKind::Tuple })
    }

    fn serialize_tuple_struct(self, _name: &'static str, len: usize) -> Result<Self::SerializeTupleStruct> {
        self.serialize_tuple(len)
    }

    fn serialize_tuple_variant(self, _name: &'static str, _index: u32, variant: &'static str,
                               len: usize) -> Result<Self::SerializeTupleVariant> {
        Ok(Compound { ser: self, items: Vec::with_capacity(len), kind: SeqKind::Variant(variant) })
    }

    fn serialize_map(self, len: Option<usize>) -> Result<Self::SerializeMap> {
        Ok(MapCompound { ser: self, pairs: Vec::with_capacity(len.unwrap_or(0)),
                         key: None, variant: None })
    }

    fn serialize_struct(self, _name: &'static str, len: usize) -> Result<Self::SerializeStruct> {
        self.serialize_map(Some(len))
    }

    fn serialize_struct_variant(self, _name: &'static str, _index: u32, variant: &'static str,
                                len: usize) -> Result<Self::SerializeStructVariant> {
        Ok(MapCompound { ser: self, pairs: Vec::with_capacity(len),
                         key: None, variant: Some(variant) })
    }
}

impl<'a, 'h> Compound<'a, 'h> {
    fn push<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let value = value.serialize(&mut *self.ser)?;
        self.items.push(value);
        Ok(())
    }

    fn finish(self) -> Result<Value> {
        let heap = &mut *self.ser.heap;
        Ok(match self.kind {
            SeqKind::List => heap.list(self.items),
            SeqKind::Tuple => heap.tuple(self.items),
            SeqKind::Variant(name) => {
                let data = heap.list(self.items);
                heap.tuple(vec![variant_name(name), data])
            }
        })
    }
}

impl<'a, 'h> ser::SerializeSeq for Compound<'a, 'h> {
    type Ok = Value;
    type Error = Error;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.push(value)
    }

    fn end(self) -> Result<Value> {
        self.finish()
    }
}

impl<'a, 'h> ser::SerializeTuple for Compound<'a, 'h> {
    type Ok = Value;
    type Error = Error;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.push(value)
    }

    fn end(self) -> Result<Value> {
        self.finish()
    }
}

impl<'a, 'h> ser::SerializeTupleStruct for Compound<'a, 'h> {
    type Ok = Value;
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.push(value)
    }

    fn end(self) -> Result<Value> {
        self.finish()
    }
}

impl<'a, 'h> ser::SerializeTupleVariant for Compound<'a, 'h> {
    type Ok = Value;
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.push(value)
    }

    fn end(self) -> Result<Value> {
        self.finish()
    }
}

impl<'a, 'h> MapCompound<'a, 'h> {
    fn field<T: Serialize + ?Sized>(&mut self, key: &'static str, value: &T) -> Result<()> {
        let value = value.serialize(&mut *self.ser)?;
        self.pairs.push((Value::String(key.into()), value));
        Ok(())
    }

    fn finish(self) -> Result<Value> {
        let heap = &mut *self.ser.heap;
        let dict = heap.dict(self.pairs);
        Ok(match self.variant {
            Some(name) => heap.tuple(vec![variant_name(name), dict]),
            None => dict,
        })
    }
}

impl<'a, 'h> ser::SerializeMap for MapCompound<'a, 'h> {
    type Ok = Value;
    type Error = Error;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<()> {
        self.key = Some(key.serialize(&mut *self.ser)?);
        Ok(())
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let key = self.key.take().ok_or_else(|| structure("map value without a key"))?;
        let value = value.serialize(&mut *self.ser)?;
        self.pairs.push((key, value));
        Ok(())
    }

    fn end(self) -> Result<Value> {
        self.finish()
    }
}

impl<'a, 'h> ser::SerializeStruct for MapCompound<'a, 'h> {
    type Ok = Value;
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, key: &'static str, value: &T) -> Result<()> {
        self.field(key, value)
    }

    fn end(self) -> Result<Value> {
        self.finish()
    }
}

impl<'a, 'h> ser::SerializeStructVariant for MapCompound<'a, 'h> {
    type Ok = Value;
    type Error = Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, key: &'static str, value: &T) -> Result<()> {
        self.field(key, value)
    }

    fn end(self) -> Result<Value> {
        self.finish()
    }
}

/// Deserializes one value of a graph.
struct Deserializer<'g> {
    heap: &'g Heap,
    value: &'g Value,
    ancestors: Vec<ObjId>,
}

impl<'g> Deserializer<'g> {
    fn child(&self, value: &'g Value, parent: Option<ObjId>) -> Deserializer<'g> {
        let mut ancestors = self.ancestors.clone();
        ancestors.extend(parent);
        Deserializer { heap: self.heap, value, ancestors }
    }

    /// The object behind the value, refusing cycles.
    fn object(&self) -> Result<Option<(ObjId, &'g Object)>> {
        match *self.value {
            Value::Obj(id) => {
                if self.ancestors.contains(&id) {
                    return Err(Error::Syntax(ErrorCode::Recursive));
                }
                let object = self.heap.get(id).ok_or_else(
                    || structure(format!("dangling object #{}", id.index())))?;
                Ok(Some((id, object)))
            }
            _ => Ok(None),
        }
    }

    fn seq(&self, id: ObjId, items: &'g [Value]) -> SeqDeserializer<'g> {
        let mut ancestors = self.ancestors.clone();
        ancestors.push(id);
        SeqDeserializer { heap: self.heap, iter: items.iter(), ancestors }
    }

    fn map(&self, id: ObjId, pairs: Vec<(Key<'g>, &'g Value)>) -> MapDeserializer<'g> {
        let mut ancestors = self.ancestors.clone();
        ancestors.push(id);
        MapDeserializer { heap: self.heap, iter: pairs.into_iter(), value: None, ancestors }
    }
}

impl<'de, 'g> de::Deserializer<'de> for Deserializer<'g> {
    type Error = Error;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        let (id, object) = match self.object()? {
            Some(found) => found,
            None => return match *self.value {
                Value::None => visitor.visit_unit(),
                Value::Bool(b) => visitor.visit_bool(b),
                Value::I64(i) => visitor.visit_i64(i),
                Value::Int(ref i) => match i.to_i64() {
                    Some(i) => visitor.visit_i64(i),
                    None => match i.to_u64() {
                        Some(u) => visitor.visit_u64(u),
                        None => Err(structure(format!("integer too large: {}", i))),
                    },
                },
                Value::F64(f) => visitor.visit_f64(f),
                Value::Bytes(ref b) => visitor.visit_byte_buf(b.clone()),
                Value::String(ref s) => visitor.visit_string(s.clone()),
                Value::Failure(ref v) => Err(Error::Violation((**v).clone())),
                Value::Obj(_) => Err(structure("unresolved object")),
            },
        };
        match *object {
            Object::List(ref items) | Object::Tuple(ref items) |
            Object::Set(ref items) | Object::FrozenSet(ref items) =>
                visitor.visit_seq(self.seq(id, items)),
            Object::Dict(ref pairs) => {
                let pairs = pairs.iter().map(|&(ref k, ref v)| (Key::Value(k), v)).collect();
                visitor.visit_map(self.map(id, pairs))
            }
            Object::Instance { ref state, .. } => {
                let pairs = state.iter().map(|&(ref k, ref v)| (Key::Name(k), v)).collect();
                visitor.visit_map(self.map(id, pairs))
            }
            Object::Class(ref name) | Object::Module(ref name) | Object::Function(ref name) =>
                visitor.visit_string(name.clone()),
            Object::Persistent(ref payload) => self.child(payload, Some(id)).deserialize_any(visitor),
            Object::Unpersistable(ref why) => Err(structure(format!("unpersistable object: {}", why))),
            Object::Method { ref name, .. } => Err(structure(format!("cannot deserialize method {}", name))),
            Object::Remote(_) | Object::Local(_) => Err(structure("cannot deserialize a reference")),
        }
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match *self.value {
            Value::None => visitor.visit_none(),
            _ => visitor.visit_some(self),
        }
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(self, _name: &'static str, visitor: V)
                                                   -> Result<V::Value> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_enum<V: Visitor<'de>>(self, _name: &'static str, _variants: &'static [&'static str],
                                         visitor: V) -> Result<V::Value> {
        let name_of = |value: &Value| match *value {
            Value::String(ref s) => Ok(s.clone()),
            Value::Bytes(ref b) => Ok(String::from_utf8_lossy(b).into_owned()),
            _ => Err(structure("enum variant name must be a string")),
        };
        let (name, data, parent) = match self.object()? {
            None => (name_of(self.value)?, None, None),
            Some((id, &Object::Tuple(ref items))) | Some((id, &Object::List(ref items))) => {
                match items.len() {
                    1 | 2 => (name_of(&items[0])?, items.get(1), Some(id)),
                    _ => return Err(structure("enum tuples must have one or two items")),
                }
            }
            Some((id, &Object::Dict(ref pairs))) if pairs.len() == 1 =>
                (name_of(&pairs[0].0)?, Some(&pairs[0].1), Some(id)),
            _ => return Err(structure("enum variants must be tuples, strings or single-entry dicts")),
        };
        let data = data.map(|value| self.child(value, parent));
        visitor.visit_enum(VariantDeserializer { name, data })
    }

    serde::forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf unit unit_struct seq tuple tuple_struct map struct
        identifier ignored_any
    }
}

struct SeqDeserializer<'g> {
    heap: &'g Heap,
    iter: std::slice::Iter<'g, Value>,
    ancestors: Vec<ObjId>,
}

impl<'de, 'g> de::SeqAccess<'de> for SeqDeserializer<'g> {
    type Error = Error;

    fn next_element_seed<T: de::DeserializeSeed<'de>>(&mut self, seed: T) -> Result<Option<T::Value>> {
        match self.iter.next() {
            Some(value) => seed.deserialize(Deserializer {
                heap: self.heap, value, ancestors: self.ancestors.clone(),
            }).map(Some),
            None => Ok(None),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}

enum Key<'g> {
    Value(&'g Value),
    Name(&'g str),
}

struct MapDeserializer<'g> {
    heap: &'g Heap,
    iter: vec::IntoIter<(Key<'g>, &'g Value)>,
    value: Option<&'g Value>,
    ancestors: Vec<ObjId>,
}

impl<'de, 'g> de::MapAccess<'de> for MapDeserializer<'g> {
    type Error = Error;

    fn next_key_seed<K: de::DeserializeSeed<'de>>(&mut self, seed: K) -> Result<Option<K::Value>> {
        match self.iter.next() {
            Some((key, value)) => {
                self.value = Some(value);
                match key {
                    Key::Value(key) => seed.deserialize(Deserializer {
                        heap: self.heap, value: key, ancestors: self.ancestors.clone(),
                    }).map(Some),
                    Key::Name(name) => {
                        let name: de::value::StrDeserializer<Error> = name.into_deserializer();
                        seed.deserialize(name).map(Some)
                    }
                }
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V: de::DeserializeSeed<'de>>(&mut self, seed: V) -> Result<V::Value> {
        let value = self.value.take().ok_or_else(|| structure("map value requested before key"))?;
        seed.deserialize(Deserializer { heap: self.heap, value, ancestors: self.ancestors.clone() })
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}

struct VariantDeserializer<'g> {
    name: String,
    data: Option<Deserializer<'g>>,
}

impl<'de, 'g> de::EnumAccess<'de> for VariantDeserializer<'g> {
    type Error = Error;
    type Variant = Self;

    fn variant_seed<V: de::DeserializeSeed<'de>>(self, seed: V) -> Result<(V::Value, Self)> {
        let name: de::value::StringDeserializer<Error> = self.name.clone().into_deserializer();
        let variant = seed.deserialize(name)?;
        Ok((variant, self))
    }
}

impl<'de, 'g> de::VariantAccess<'de> for VariantDeserializer<'g> {
    type Error = Error;

    fn unit_variant(self) -> Result<()> {
        match self.data {
            None => Ok(()),
            Some(data) => match *data.value {
                Value::None => Ok(()),
                _ => Err(structure(format!("unit variant {} with data", self.name))),
            },
        }
    }

    fn newtype_variant_seed<T: de::DeserializeSeed<'de>>(self, seed: T) -> Result<T::Value> {
        match self.data {
            Some(data) => seed.deserialize(data),
            None => Err(structure(format!("variant {} needs data", self.name))),
        }
    }

    fn tuple_variant<V: Visitor<'de>>(self, _len: usize, visitor: V) -> Result<V::Value> {
        match self.data {
            Some(data) => de::Deserializer::deserialize_any(data, visitor),
            None => Err(structure(format!("variant {} needs data", self.name))),
        }
    }

    fn struct_variant<V: Visitor<'de>>(self, _fields: &'static [&'static str], visitor: V)
                                       -> Result<V::Value> {
        match self.data {
            Some(data) => de::Deserializer::deserialize_any(data, visitor),
            None => Err(structure(format!("variant {} needs data", self.name))),
        }
    }
}

/// Encode a `T` into a graph.
pub fn to_graph<T: Serialize + ?Sized>(value: &T) -> Result<Graph> {
    let mut heap = Heap::new();
    let root = value.serialize(&mut Serializer { heap: &mut heap })?;
    Ok(Graph::new(heap, root))
}

/// Decode a `T` from a graph.  Cyclic graphs give `ErrorCode::Recursive`.
pub fn from_graph<T: DeserializeOwned>(graph: &Graph) -> Result<T> {
    T::deserialize(Deserializer { heap: &graph.heap, value: &graph.root, ancestors: Vec::new() })
}
