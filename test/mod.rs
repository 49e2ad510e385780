// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

mod arby;

use crate::tokens::Token;

fn s(text: &str) -> Token {
    Token::String(text.as_bytes().to_vec())
}

mod token_tests {
    use num_bigint::BigInt;
    use rand::{RngCore, thread_rng};
    use crate::consts::{INT, STRING};
    use crate::error::{Error, ErrorCode};
    use crate::tokens::{Header, Token, TokenReader, TokenWriter, scan_header,
                        tokens_from_slice, tokens_to_vec, write_header};
    use std::collections::BTreeMap;

    fn test_encode_ok(token: Token, bytes: &[u8]) {
        assert_eq!(tokens_to_vec(&[token.clone()]).unwrap(), bytes);
        assert_eq!(tokens_from_slice(bytes).unwrap(), vec![token]);
    }

    #[test]
    fn encode_ints() {
        test_encode_ok(Token::Int(0), b"\x00\x81");
        test_encode_ok(Token::Int(1), b"\x01\x81");
        test_encode_ok(Token::Int(130), b"\x02\x01\x81");
        test_encode_ok(Token::Int(-1), b"\x01\x83");
        test_encode_ok(Token::Long(BigInt::from(1u64 << 31)), b"\x04\x85\x80\x00\x00\x00");
        test_encode_ok(Token::Long(-BigInt::from(1u64 << 40)), b"\x06\x86\x01\x00\x00\x00\x00\x00");
        // plain ints outside the 32-bit range go out as long ints
        assert_eq!(tokens_to_vec(&[Token::Int(1 << 31)]).unwrap(), b"\x04\x85\x80\x00\x00\x00");
    }

    #[test]
    fn encode_others() {
        test_encode_ok(Token::String(b"abc".to_vec()), b"\x03\x82abc");
        test_encode_ok(Token::String(Vec::new()), b"\x00\x82");
        test_encode_ok(Token::Float(1.5), b"\x84\x3f\xf8\x00\x00\x00\x00\x00\x00");
        test_encode_ok(Token::Open(0), b"\x00\x88");
        test_encode_ok(Token::Close(300), b"\x2c\x02\x89");
        test_encode_ok(Token::Abort(1), b"\x01\x8a");
        test_encode_ok(Token::Vocab(5), b"\x05\x87");
        test_encode_ok(Token::Error(b"bad".to_vec()), b"\x03\x8dbad");
    }

    #[test]
    fn header_limits() {
        let mut data = vec![0u8; 64];
        data.push(INT);
        assert_eq!(scan_header(&data).unwrap(), Some(Header { typebyte: INT, value: 0, len: 65 }));
        let mut data = vec![0u8; 65];
        data.push(INT);
        assert!(matches!(scan_header(&data), Err(Error::Banana(ErrorCode::PrefixTooLong))));
        // no type byte yet, but already too long
        assert!(matches!(scan_header(&[0u8; 65]), Err(Error::Banana(ErrorCode::PrefixTooLong))));
        assert_eq!(scan_header(&[0u8; 10]).unwrap(), None);
        let mut data = vec![0x7f; 11];
        data.push(INT);
        assert!(matches!(scan_header(&data), Err(Error::Banana(ErrorCode::HeaderOverflow))));
    }

    #[test]
    fn padded_empty_string() {
        let mut data = vec![0u8; 64];
        data.push(STRING);
        assert_eq!(tokens_from_slice(&data).unwrap(), vec![Token::String(Vec::new())]);
        let mut data = vec![0u8; 65];
        data.push(STRING);
        assert!(matches!(tokens_from_slice(&data), Err(Error::Banana(ErrorCode::PrefixTooLong))));
    }

    #[test]
    fn bad_type_bytes() {
        assert!(matches!(tokens_from_slice(b"\x00\x80"), Err(Error::Banana(ErrorCode::OldBanana))));
        assert!(matches!(tokens_from_slice(b"\x00\x90"),
                         Err(Error::Banana(ErrorCode::InvalidTypeByte(0x90)))));
        let mut data = Vec::new();
        write_header(&mut data, 1001).unwrap();
        data.push(crate::consts::ERROR);
        assert!(matches!(tokens_from_slice(&data),
                         Err(Error::Banana(ErrorCode::OversizedError(1001)))));
    }

    #[test]
    fn error_message_too_long() {
        let mut writer = TokenWriter::new(Vec::new());
        assert!(matches!(writer.write(&Token::Error(vec![b'x'; 1001])),
                         Err(Error::Banana(ErrorCode::MessageTooLong(1001)))));
        writer.write(&Token::Error(vec![b'x'; 1000])).unwrap();
    }

    #[test]
    fn split_feed() {
        let tokens = vec![Token::Open(0), super::s("list"), Token::Int(1 << 20),
                          Token::Float(-0.25), Token::String(b"hello world".to_vec()),
                          Token::Close(0)];
        let data = tokens_to_vec(&tokens).unwrap();
        let mut reader = TokenReader::new();
        let mut result = Vec::new();
        for byte in &data {
            result.extend(reader.feed(&[*byte]).unwrap());
        }
        assert!(!reader.has_pending());
        assert_eq!(result, tokens);
        // a truncated body is reported as such
        assert!(tokens_from_slice(&data[..data.len() - 3]).is_err());
    }

    #[test]
    fn writer_vocabulary() {
        let mut table = BTreeMap::new();
        table.insert(1, b"list".to_vec());
        let mut writer = TokenWriter::new(Vec::new());
        writer.set_vocabulary(&table);
        writer.write(&super::s("list")).unwrap();
        writer.write(&super::s("tuple")).unwrap();
        writer.clear_vocabulary();
        writer.write(&super::s("list")).unwrap();
        assert_eq!(writer.into_inner(), b"\x01\x87\x05\x82tuple\x04\x82list");
    }

    #[test]
    fn fuzzing() {
        // Tokenizing random input must not panic.
        let mut data = [0u8; 1000];
        for _ in 0..1000 {
            thread_rng().fill_bytes(&mut data);
            let _ = tokens_from_slice(&data);
        }
    }
}

mod jelly_tests {
    use std::collections::BTreeMap;
    use num_bigint::BigInt;
    use rand::{Rng, RngCore, thread_rng};
    use quickcheck::{QuickCheck, StdGen};
    use crate::{jelly, jelly_to_vec, unjelly, unjelly_from_slice};
    use crate::{ClassRegistry, Constraint, Decoder, DummySecurityOptions, Encoder, Error, ErrorCode,
                Graph, Heap, JellyOptions, Object, SecurityOptions, Taster, UnjellyOptions, Value,
                Violation};
    use crate::tokens::{Token, tokens_to_vec};
    use super::arby::Tree;
    use super::s;

    fn roundtrip(graph: &Graph) -> Graph {
        let data = jelly_to_vec(graph, &JellyOptions::new()).unwrap();
        unjelly_from_slice(&data, &UnjellyOptions::new()).unwrap()
    }

    fn test_encode_ok(graph: Graph, repr: &str) {
        let decoded = roundtrip(&graph);
        assert!(decoded.equivalent(&graph), "{} != {}", decoded, graph);
        assert_eq!(decoded.to_string(), repr);
    }

    fn decode(tokens: &[Token]) -> crate::Result<Graph> {
        unjelly(tokens, &UnjellyOptions::new())
    }

    fn constrained(tokens: &[Token], constraint: Constraint) -> crate::Result<Graph> {
        unjelly(tokens, &UnjellyOptions::new().constraint(constraint))
    }

    fn violation(result: crate::Result<Graph>) -> crate::Violation {
        match result {
            Err(Error::Violation(v)) => v,
            other => panic!("expected a violation, got {:?}", other),
        }
    }

    fn items(graph: &Graph) -> Vec<Value> {
        match graph.root_object() {
            Some(&Object::List(ref v)) | Some(&Object::Tuple(ref v)) => v.clone(),
            other => panic!("not a sequence: {:?}", other),
        }
    }

    #[test]
    fn encode_scalars() {
        test_encode_ok(Graph::scalar(Value::None), "None");
        test_encode_ok(Graph::scalar(Value::Bool(true)), "True");
        test_encode_ok(Graph::scalar(Value::I64(-5)), "-5");
        test_encode_ok(Graph::scalar(Value::I64(1 << 40)), "1099511627776");
        test_encode_ok(Graph::scalar(Value::Int(BigInt::from(1u64 << 63) * 256)),
                       "2361183241434822606848");
        test_encode_ok(Graph::scalar(Value::F64(1.5)), "1.5");
        test_encode_ok(Graph::scalar(Value::Bytes(b"abc".to_vec())), "b\"abc\"");
        test_encode_ok(Graph::scalar(Value::String("s\u{fc}\u{df}".into())), "\"s\u{fc}\u{df}\"");
    }

    #[test]
    fn encode_containers() {
        let mut heap = Heap::new();
        let tuple = heap.tuple(vec![Value::I64(2), Value::String("x".into())]);
        let dict = heap.dict(vec![(Value::Bytes(b"k".to_vec()), Value::None)]);
        let root = heap.list(vec![Value::I64(1), tuple, dict]);
        test_encode_ok(Graph::new(heap, root), "[1, (2, \"x\"), {b\"k\": None}]");

        let mut heap = Heap::new();
        let root = heap.tuple(vec![Value::I64(1)]);
        test_encode_ok(Graph::new(heap, root), "(1, )");

        let mut heap = Heap::new();
        let root = heap.tuple(vec![]);
        test_encode_ok(Graph::new(heap, root), "()");

        let mut heap = Heap::new();
        let inner = heap.frozenset(vec![Value::I64(3)]);
        let root = heap.set(vec![Value::I64(1), inner]);
        test_encode_ok(Graph::new(heap, root), "{1, frozenset([3])}");

        let mut heap = Heap::new();
        let root = heap.set(vec![]);
        test_encode_ok(Graph::new(heap, root), "set()");
    }

    #[test]
    fn wire_format() {
        let mut heap = Heap::new();
        let root = heap.list(vec![Value::I64(1), Value::None]);
        let tokens = jelly(&Graph::new(heap, root), &JellyOptions::new()).unwrap();
        assert_eq!(tokens, vec![Token::Open(0), s("list"), Token::Int(1),
                                Token::Open(1), s("None"), Token::Close(1), Token::Close(0)]);
    }

    #[test]
    fn shared_objects() {
        let mut heap = Heap::new();
        let shared = heap.list(vec![Value::I64(1)]);
        let root = heap.list(vec![shared.clone(), shared]);
        let graph = Graph::new(heap, root);
        let tokens = jelly(&graph, &JellyOptions::new()).unwrap();
        assert_eq!(&tokens[..6], &[Token::Open(0), s("list"),
                                   Token::Open(1), s("reference"), Token::Int(2),
                                   Token::Open(2)]);
        assert!(tokens.contains(&s("dereference")));

        let decoded = roundtrip(&graph);
        let items = items(&decoded);
        assert_eq!(items[0], items[1]);
        assert_eq!(decoded.to_string(), "[[1], [1]]");
    }

    #[test]
    fn cyclic_list() {
        let mut heap = Heap::new();
        let root = heap.list(vec![]);
        let id = root.obj_id().unwrap();
        if let Some(&mut Object::List(ref mut v)) = heap.get_mut(id) {
            v.push(root.clone());
        }
        let decoded = roundtrip(&Graph::new(heap, root));
        assert_eq!(items(&decoded)[0], decoded.root);
        assert_eq!(decoded.to_string(), "[[...]]");
    }

    #[test]
    fn tuple_through_list_cycle() {
        let mut heap = Heap::new();
        let list = heap.list(vec![]);
        let root = heap.tuple(vec![list.clone()]);
        if let Some(&mut Object::List(ref mut v)) = heap.get_mut(list.obj_id().unwrap()) {
            v.push(root.clone());
        }
        let decoded = roundtrip(&Graph::new(heap, root));
        let list = items(&decoded)[0].clone();
        match decoded.heap.deref(&list) {
            Some(&Object::List(ref v)) => assert_eq!(v[0], decoded.root),
            other => panic!("not a list: {:?}", other),
        }
    }

    fn trusted_roundtrip(graph: &Graph) -> Graph {
        let data = jelly_to_vec(graph, &JellyOptions::new().taster(DummySecurityOptions)).unwrap();
        unjelly_from_slice(&data, &UnjellyOptions::new().taster(DummySecurityOptions)).unwrap()
    }

    /// `(node, )` where `node.x` is the container `wrap` builds around the
    /// tuple itself.
    fn tuple_through_instance<F>(wrap: F) -> Graph
        where F: FnOnce(&mut Heap, Value) -> Value
    {
        let mut heap = Heap::new();
        let node = heap.instance("app.Node", vec![]);
        let root = heap.tuple(vec![node.clone()]);
        let container = wrap(&mut heap, root.clone());
        if let Some(&mut Object::Instance { ref mut state, .. }) = heap.get_mut(node.obj_id().unwrap()) {
            state.push(("x".into(), container));
        }
        Graph::new(heap, root)
    }

    fn node_attr(graph: &Graph) -> Value {
        match graph.heap.deref(&items(graph)[0]) {
            Some(&Object::Instance { ref state, .. }) => state[0].1.clone(),
            other => panic!("not an instance: {:?}", other),
        }
    }

    #[test]
    fn cycle_through_set_element() {
        let graph = tuple_through_instance(|heap, t| heap.set(vec![t]));
        let decoded = trusted_roundtrip(&graph);
        assert!(decoded.equivalent(&graph), "{} != {}", decoded, graph);
        match decoded.heap.deref(&node_attr(&decoded)) {
            Some(&Object::Set(ref v)) => assert_eq!(v, &vec![decoded.root.clone()]),
            other => panic!("not a set: {:?}", other),
        }

        let graph = tuple_through_instance(|heap, t| heap.frozenset(vec![t]));
        let decoded = trusted_roundtrip(&graph);
        assert!(decoded.equivalent(&graph), "{} != {}", decoded, graph);
        match decoded.heap.deref(&node_attr(&decoded)) {
            Some(&Object::FrozenSet(ref v)) => assert_eq!(v, &vec![decoded.root.clone()]),
            other => panic!("not a frozenset: {:?}", other),
        }
    }

    #[test]
    fn cycle_through_dict_key() {
        let graph = tuple_through_instance(|heap, t| heap.dict(vec![(t, Value::I64(1))]));
        let decoded = trusted_roundtrip(&graph);
        assert!(decoded.equivalent(&graph), "{} != {}", decoded, graph);
        match decoded.heap.deref(&node_attr(&decoded)) {
            Some(&Object::Dict(ref pairs)) =>
                assert_eq!(pairs, &vec![(decoded.root.clone(), Value::I64(1))]),
            other => panic!("not a dict: {:?}", other),
        }
    }

    #[test]
    fn equivalence_forgets_failed_guesses() {
        // Matching the frozensets first tries a against b, which fails;
        // the second list element then compares a and b for real.
        let mut left = Heap::new();
        let a = left.list(vec![Value::I64(1)]);
        let z = left.list(vec![Value::I64(2)]);
        let set = left.frozenset(vec![a.clone(), z]);
        let left_root = left.list(vec![set, a]);
        let mut right = Heap::new();
        let b = right.list(vec![Value::I64(2)]);
        let a2 = right.list(vec![Value::I64(1)]);
        let set = right.frozenset(vec![b.clone(), a2]);
        let right_root = right.list(vec![set, b]);
        assert!(!Graph::new(left, left_root).equivalent(&Graph::new(right, right_root)));
    }

    #[test]
    fn self_containing_tuple() {
        let mut heap = Heap::new();
        let id = heap.alloc(Object::Tuple(vec![]));
        if let Some(&mut Object::Tuple(ref mut v)) = heap.get_mut(id) {
            v.push(Value::Obj(id));
        }
        let data = jelly_to_vec(&Graph::new(heap, Value::Obj(id)), &JellyOptions::new()).unwrap();
        let v = violation(unjelly_from_slice(&data, &UnjellyOptions::new()));
        assert!(v.message().contains("unresolved reference"), "{}", v);
        assert_eq!(v.location(), Some("root"));
    }

    #[test]
    fn security() {
        let mut heap = Heap::new();
        let root = heap.instance("app.Doc", vec![("title".into(), Value::String("x".into())),
                                                 ("n".into(), Value::I64(3))]);
        let graph = Graph::new(heap, root);
        assert!(matches!(jelly(&graph, &JellyOptions::new()), Err(Error::Insecure(_))));

        let mut taster = SecurityOptions::new();
        taster.allow_instances_of(&["app.Doc"]);
        let data = jelly_to_vec(&graph, &JellyOptions::new().taster(taster.clone())).unwrap();
        assert!(matches!(unjelly_from_slice(&data, &UnjellyOptions::new()), Err(Error::Insecure(_))));
        let decoded = unjelly_from_slice(&data, &UnjellyOptions::new().taster(taster)).unwrap();
        assert!(decoded.equivalent(&graph));
        assert_eq!(decoded.to_string(), "app.Doc(title=\"x\", n=3)");

        let decoded = unjelly_from_slice(&data, &UnjellyOptions::new().taster(DummySecurityOptions)).unwrap();
        assert!(decoded.equivalent(&graph));
    }

    #[test]
    fn dotted_type_names_need_registration() {
        let mut taster = SecurityOptions::default();
        assert!(!taster.is_type_allowed("os.system"));
        taster.allow_instances_of(&["app.Doc"]);
        assert!(taster.is_type_allowed("app.Doc"));
        assert!(!taster.is_type_allowed("app.Other"));
    }

    fn point_classes() -> ClassRegistry {
        ClassRegistry::new().register("app.Point", |heap: &mut Heap, state: Vec<(String, Value)>| {
            let coord = |name: &str| state.iter().find(|&&(ref n, _)| n == name)
                                          .and_then(|&(_, ref v)| v.as_i64())
                                          .ok_or_else(|| Violation::new(format!("point without {}", name)));
            let (x, y) = (coord("x")?, coord("y")?);
            Ok(heap.tuple(vec![Value::I64(x), Value::I64(y)]))
        })
    }

    #[test]
    fn registered_classes() {
        let options = UnjellyOptions::new().classes(point_classes());
        let tokens = [Token::Open(0), s("list"),
                      Token::Open(1), s("copyable"), s("app.Point"),
                      s("x"), Token::Int(1), s("y"), Token::Int(2), Token::Close(1),
                      Token::Open(2), s("app.Point"), s("x"), Token::Int(3), s("y"), Token::Int(4),
                      Token::Close(2),
                      Token::Open(3), s("copyable"), s("app.Point"), s("x"), Token::Int(5),
                      Token::Close(3),
                      Token::Close(0)];
        let decoded = unjelly(&tokens, &options).unwrap();
        let items = items(&decoded);
        assert_eq!(decoded.heap.show(&items[0]).to_string(), "(1, 2)");
        assert_eq!(decoded.heap.show(&items[1]).to_string(), "(3, 4)");
        assert_eq!(items[2].failure().map(|v| v.message()), Some("point without y"));

        // instances of a registered class are built too, once allowed
        let mut taster = SecurityOptions::new();
        taster.allow_instances_of(&["app.Point"]);
        let tokens = [Token::Open(0), s("instance"), s("app.Point"),
                      s("x"), Token::Int(5), s("y"), Token::Int(6), Token::Close(0)];
        let decoded = unjelly(&tokens, &options.clone().taster(taster)).unwrap();
        assert_eq!(decoded.to_string(), "(5, 6)");
    }

    #[test]
    fn unregistered_classes() {
        let tokens = [Token::Open(0), s("list"),
                      Token::Open(1), s("copyable"), s("app.Point"), s("x"), Token::Int(1),
                      Token::Close(1),
                      Token::Int(7), Token::Close(0)];
        let decoded = decode(&tokens).unwrap();
        let items = items(&decoded);
        let failure = items[0].failure().unwrap();
        assert_eq!(failure.message(), "unknown RemoteCopy class 'app.Point'");
        assert_eq!(items[1], Value::I64(7));

        assert!(matches!(decode(&[Token::Open(0), s("app.Point"), Token::Close(0)]),
                         Err(Error::Banana(ErrorCode::UnknownOpenType(ref tag))) if tag == "app.Point"));
    }

    #[test]
    fn insecure_nested_instance() {
        let mut heap = Heap::new();
        let inner = heap.instance("other.Thing", vec![]);
        let root = heap.list(vec![inner]);
        let mut taster = SecurityOptions::default();
        taster.allow_types(&["instance"]);
        let data = jelly_to_vec(&Graph::new(heap, root), &JellyOptions::new().taster(taster)).unwrap();
        let decoded = unjelly_from_slice(&data, &UnjellyOptions::new()).unwrap();
        assert_eq!(decoded.to_string(),
                   "[Unpersistable(\"instance of class other.Thing deemed insecure\")]");
    }

    #[test]
    fn persistent_hooks() {
        let mut heap = Heap::new();
        let root = heap.instance("app.Doc", vec![("title".into(), Value::String("x".into()))]);
        let graph = Graph::new(heap, root);
        let mut taster = SecurityOptions::new();
        taster.allow_instances_of(&["app.Doc"]);
        let options = JellyOptions::new().taster(taster).persistent_store(|heap, value| {
            match heap.deref(value) {
                Some(&Object::Instance { ref class, .. }) if class == "app.Doc" => Some(Value::I64(7)),
                _ => None,
            }
        });
        let data = jelly_to_vec(&graph, &options).unwrap();

        let plain = unjelly_from_slice(&data, &UnjellyOptions::new()).unwrap();
        assert_eq!(plain.to_string(), "persistent(7)");

        let load = UnjellyOptions::new().persistent_load(|heap, payload| {
            Ok(heap.instance("app.Doc", vec![("id".into(), payload)]))
        });
        let loaded = unjelly_from_slice(&data, &load).unwrap();
        assert_eq!(loaded.to_string(), "app.Doc(id=7)");
    }

    #[test]
    fn list_constraints() {
        let four: Vec<Token> = vec![Token::Open(0), s("list"), Token::Int(1), Token::Int(2),
                                    Token::Int(3), Token::Int(4), Token::Close(0)];
        let three = Constraint::list_of(Constraint::int(), Some(3));
        let v = violation(constrained(&four, three.clone()));
        assert_eq!(v.location(), Some("root.[3]"));
        assert!(v.message().contains("full"), "{}", v);

        let v = violation(constrained(&[Token::Open(0), s("list"), Token::Int(1), s("two"),
                                        Token::Close(0)], three.clone()));
        assert_eq!(v.location(), Some("root.[1]"));
        assert_eq!(v.message(), "STRING token rejected by IntegerConstraint");

        let ok = constrained(&[Token::Open(0), s("list"), Token::Int(1), Token::Close(0)], three);
        assert_eq!(ok.unwrap().to_string(), "[1]");

        // wrong sequence type
        assert!(matches!(constrained(&four, Constraint::int()), Err(Error::Violation(_))));
    }

    #[test]
    fn dict_duplicate_key() {
        let tokens = vec![Token::Open(0), s("dict"), s("a"), Token::Int(1), s("a"), Token::Int(2),
                          Token::Close(0)];
        let v = violation(decode(&tokens));
        assert_eq!(v.location(), Some("root.{}"));
        assert!(v.message().contains("duplicate key"), "{}", v);
    }

    #[test]
    fn unconstrained_containers_absorb() {
        let tokens = vec![Token::Open(0), s("list"), Token::Int(1),
                          Token::Open(1), s("dict"), s("a"), Token::Int(1), s("a"), Token::Int(2),
                          Token::Close(1), Token::Int(3), Token::Close(0)];
        let graph = decode(&tokens).unwrap();
        let items = items(&graph);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], Value::I64(1));
        assert!(items[1].failure().is_some());
        assert_eq!(items[2], Value::I64(3));
    }

    #[test]
    fn abort() {
        let tokens = vec![Token::Open(0), s("list"), Token::Int(1),
                          Token::Open(1), s("list"), Token::Int(2), Token::Int(3), Token::Abort(1),
                          Token::Close(1), Token::Close(0),
                          Token::Open(2), s("list"), Token::Int(4), Token::Close(2)];
        let data = tokens_to_vec(&tokens).unwrap();
        let mut decoder = Decoder::new(UnjellyOptions::new());
        let results = decoder.feed(&data).unwrap();
        assert_eq!(results.len(), 2);
        let first = results[0].as_ref().unwrap();
        let items = items(first);
        let failure = items[1].failure().unwrap();
        assert_eq!(failure.location(), Some("root.[1]"));
        assert_eq!(failure.message(), "ABORT received");
        assert_eq!(results[1].as_ref().unwrap().to_string(), "[4]");

        let v = violation(constrained(&tokens[..10],
                                      Constraint::list_of(Constraint::Any, None)));
        assert!(v.location().unwrap().starts_with("root.[1]"), "{}", v);
    }

    #[test]
    fn rejected_objects_do_not_break_the_stream() {
        let tokens = vec![Token::Open(0), s("list"), Token::Int(1), Token::Int(2), Token::Close(0),
                          Token::Open(1), s("list"), Token::Int(3), Token::Close(1)];
        let data = tokens_to_vec(&tokens).unwrap();
        let options = UnjellyOptions::new().constraint(Constraint::list_of(Constraint::int(), Some(1)));
        let results = Decoder::new(options).feed(&data).unwrap();
        assert!(matches!(results[0], Err(Error::Violation(_))));
        assert_eq!(results[1].as_ref().unwrap().to_string(), "[3]");
    }

    #[test]
    fn fatal_errors() {
        assert!(matches!(decode(&[Token::Open(0), s("bogus"), Token::Close(0)]),
                         Err(Error::Banana(ErrorCode::UnknownOpenType(ref t))) if t == "bogus"));
        assert!(matches!(decode(&[Token::Open(0), s("list"), Token::Close(1)]),
                         Err(Error::Banana(ErrorCode::LostSync(1, 0)))));
        assert!(matches!(unjelly_from_slice(b"\x05\x87", &UnjellyOptions::new()),
                         Err(Error::Banana(ErrorCode::UnknownVocab(5)))));
        assert!(matches!(unjelly_from_slice(b"\x00\x80", &UnjellyOptions::new()),
                         Err(Error::Banana(ErrorCode::OldBanana))));
        assert!(matches!(unjelly_from_slice(b"\x03\x8dbad", &UnjellyOptions::new()),
                         Err(Error::Banana(ErrorCode::RemoteError(ref m))) if m == "bad"));

        // a broken decoder stays broken
        let mut decoder = Decoder::new(UnjellyOptions::new());
        assert!(decoder.feed(b"\x00\x80").is_err());
        assert!(decoder.feed(b"\x01\x81").is_err());
    }

    #[test]
    fn stream_with_vocabulary() {
        let mut table = BTreeMap::new();
        table.insert(0, b"list".to_vec());
        table.insert(1, b"unicode".to_vec());
        let mut encoder = Encoder::new(JellyOptions::new());
        encoder.vocabulary(&table).unwrap();
        let mut heap = Heap::new();
        let root = heap.list(vec![Value::String("x".into()), Value::I64(2)]);
        let graph = Graph::new(heap, root);
        encoder.encode(&graph).unwrap();
        encoder.encode(&Graph::scalar(Value::I64(7))).unwrap();
        let data = encoder.take_output();
        assert!(data.windows(2).any(|w| w == b"\x00\x87"));

        // feed it in small pieces
        let mut decoder = Decoder::new(UnjellyOptions::new());
        let mut results = Vec::new();
        for chunk in data.chunks(3) {
            results.extend(decoder.feed(chunk).unwrap());
        }
        assert_eq!(results.len(), 2);
        assert!(results[0].as_ref().unwrap().equivalent(&graph));
        assert_eq!(results[1].as_ref().unwrap().root, Value::I64(7));
    }

    #[test]
    fn qc_roundtrip() {
        fn roundtrip_tree(tree: Tree) -> bool {
            let graph = tree.to_graph();
            roundtrip(&graph).equivalent(&graph)
        }
        QuickCheck::new().gen(StdGen::new(thread_rng(), 10))
                         .tests(500)
                         .quickcheck(roundtrip_tree as fn(_) -> _);
    }

    #[test]
    fn fuzzing() {
        // Decoding random input must not panic.
        let mut data = [0u8; 1000];
        for _ in 0..1000 {
            thread_rng().fill_bytes(&mut data);
            let _ = unjelly_from_slice(&data, &UnjellyOptions::new());
        }
    }

    #[test]
    fn fuzzing_valid_streams() {
        // Corrupting single bytes of a valid stream must not panic either.
        let mut heap = Heap::new();
        let inner = heap.dict(vec![(Value::String("k".into()), Value::F64(0.5))]);
        let root = heap.list(vec![inner.clone(), Value::Bytes(b"xyz".to_vec()), inner]);
        let data = jelly_to_vec(&Graph::new(heap, root), &JellyOptions::new()).unwrap();
        let mut rng = thread_rng();
        for _ in 0..1000 {
            let mut copy = data.clone();
            let pos = rng.gen_range(0, copy.len());
            copy[pos] = rng.gen();
            let _ = unjelly_from_slice(&copy, &UnjellyOptions::new());
        }
    }
}

mod struct_tests {
    use std::fmt;
    use std::collections::BTreeMap;
    use serde::{de::DeserializeOwned, ser::Serialize};
    use serde_derive::{Serialize, Deserialize};
    use crate::{Error, ErrorCode, Graph, Heap, JellyOptions, Object, UnjellyOptions, Value,
                from_graph, jelly_to_vec, to_graph, unjelly_from_slice};

    fn test_encode_ok<T>(value: T, repr: &str)
        where T: PartialEq + fmt::Debug + Serialize + DeserializeOwned
    {
        let graph = to_graph(&value).unwrap();
        let data = jelly_to_vec(&graph, &JellyOptions::new()).unwrap();
        let decoded = unjelly_from_slice(&data, &UnjellyOptions::new()).unwrap();
        assert_eq!(decoded.to_string(), repr);
        let back: T = from_graph(&decoded).unwrap();
        assert_eq!(back, value);
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Unit;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Newtype(i32);

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Tuple(i32, bool);

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Inner {
        a: (),
        b: i32,
        c: Vec<String>,
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Outer {
        inner: Vec<Inner>,
        data: BTreeMap<String, Option<f64>>,
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    enum Animal {
        Dog,
        AntHive(Vec<String>),
        Frog(String, Vec<isize>),
        Cat { age: usize, name: String },
    }

    #[test]
    fn encode_types() {
        test_encode_ok((), "None");
        test_encode_ok(Unit, "None");
        test_encode_ok(Newtype(42), "42");
        test_encode_ok(Tuple(42, false), "(42, False)");
        test_encode_ok(Some(5u8), "5");
        test_encode_ok(None::<u8>, "None");
        test_encode_ok(u64::max_value(), "18446744073709551615");
        test_encode_ok(i64::min_value(), "-9223372036854775808");
        test_encode_ok(vec!['a', 'b'], "[\"a\", \"b\"]");
    }

    #[test]
    fn encode_struct() {
        test_encode_ok(Inner { a: (), b: 32, c: vec!["doc".into()] },
                       "{\"a\": None, \"b\": 32, \"c\": [\"doc\"]}");
        let mut data = BTreeMap::new();
        data.insert("x".to_string(), Some(0.5));
        data.insert("y".to_string(), None);
        test_encode_ok(Outer { inner: vec![Inner { a: (), b: 1, c: vec![] }], data },
                       "{\"inner\": [{\"a\": None, \"b\": 1, \"c\": []}], \
                        \"data\": {\"x\": 0.5, \"y\": None}}");
    }

    #[test]
    fn encode_enums() {
        test_encode_ok(Animal::Dog, "(\"Dog\", )");
        test_encode_ok(Animal::AntHive(vec!["ant".into(), "aunt".into()]),
                       "(\"AntHive\", [\"ant\", \"aunt\"])");
        test_encode_ok(Animal::Frog("Henry".into(), vec![1, 5]),
                       "(\"Frog\", [\"Henry\", [1, 5]])");
        test_encode_ok(Animal::Cat { age: 5, name: "Molyneux".into() },
                       "(\"Cat\", {\"age\": 5, \"name\": \"Molyneux\"})");
    }

    #[test]
    fn decode_enum_shapes() {
        let dog: Animal = from_graph(&Graph::scalar(Value::String("Dog".into()))).unwrap();
        assert_eq!(dog, Animal::Dog);

        let mut heap = Heap::new();
        let hive = heap.list(vec![Value::Bytes(b"ant".to_vec())]);
        let root = heap.dict(vec![(Value::String("AntHive".into()), hive)]);
        let hive: Animal = from_graph(&Graph::new(heap, root)).unwrap();
        assert_eq!(hive, Animal::AntHive(vec!["ant".into()]));

        let mut heap = Heap::new();
        let root = heap.tuple(vec![Value::String("Horse".into())]);
        assert!(matches!(from_graph::<Animal>(&Graph::new(heap, root)), Err(Error::Syntax(_))));
    }

    #[test]
    fn json_values() {
        let value = serde_json::json!({
            "a": [1, 2.5, "x", null, true],
            "b": {"c": -3},
        });
        let graph = to_graph(&value).unwrap();
        let data = jelly_to_vec(&graph, &JellyOptions::new()).unwrap();
        let decoded = unjelly_from_slice(&data, &UnjellyOptions::new()).unwrap();
        let back: serde_json::Value = from_graph(&decoded).unwrap();
        assert_eq!(back, value);
        assert_eq!(serde_json::to_value(&decoded).unwrap(), value);
    }

    #[test]
    fn recursive() {
        let mut heap = Heap::new();
        let root = heap.list(vec![]);
        if let Some(&mut Object::List(ref mut v)) = heap.get_mut(root.obj_id().unwrap()) {
            v.push(root.clone());
        }
        let graph = Graph::new(heap, root);
        assert!(matches!(from_graph::<serde_json::Value>(&graph),
                         Err(Error::Syntax(ErrorCode::Recursive))));
        assert!(serde_json::to_string(&graph).is_err());
    }
}

mod broker_tests {
    use std::cell::Cell;
    use std::pin::Pin;
    use std::rc::Rc;
    use std::future::Future;
    use std::collections::BTreeMap;
    use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
    use rand::{RngCore, thread_rng};
    use crate::failure::VIOLATION_CLASS;
    use crate::tokens::{Token, tokens_from_slice, tokens_to_vec};
    use crate::{Arguments, Broker, BrokerOptions, ClassRegistry, Constraint, DummySecurityOptions,
                Error, ErrorCode, Graph, Heap, LocalReference, MethodSchema, Object, Referenceable,
                RemoteInterface, RemoteReference, Result, Value, Violation};
    use super::s;

    struct Calculator {
        interface: Option<RemoteInterface>,
    }

    impl Referenceable for Calculator {
        fn interface(&self) -> Option<&RemoteInterface> {
            self.interface.as_ref()
        }

        fn remote_call(&self, method: &str, args: Arguments) -> Result<Graph> {
            match method {
                "add" => {
                    let a = args.get("a").and_then(|v| v.as_i64()).unwrap_or(0);
                    let b = args.get("b").and_then(|v| v.as_i64()).unwrap_or(0);
                    Ok(Graph::scalar(Value::I64(a + b)))
                }
                "echo" => {
                    let value = args.get("value").cloned().unwrap_or(Value::None);
                    Ok(Graph::new(args.heap, value))
                }
                _ => Err(Error::Violation(Violation::new(format!("no method {}", method)))),
            }
        }
    }

    fn calc_interface() -> RemoteInterface {
        RemoteInterface::new("calc.ICalc")
            .method(MethodSchema::new("add")
                    .arg("a", Constraint::int())
                    .arg("b", Constraint::int())
                    .returns(Constraint::int()))
    }

    fn pump(a: &mut Broker, b: &mut Broker) {
        loop {
            let out_a = a.take_output();
            let out_b = b.take_output();
            if out_a.is_empty() && out_b.is_empty() {
                break;
            }
            if !out_a.is_empty() {
                b.data_received(&out_a).unwrap();
            }
            if !out_b.is_empty() {
                a.data_received(&out_b).unwrap();
            }
        }
    }

    fn remote_of(graph: &Graph) -> RemoteReference {
        match graph.root_object() {
            Some(&Object::Remote(ref remote)) => remote.clone(),
            other => panic!("not a remote reference: {:?}", other),
        }
    }

    fn connect(server: BrokerOptions, client: BrokerOptions, interface: Option<RemoteInterface>)
               -> (Broker, Broker, RemoteReference) {
        let mut server = Broker::new(server);
        server.publish("calc", LocalReference::new(Calculator { interface }));
        let mut client = Broker::new(client);
        let call = client.get_reference_by_name("calc");
        pump(&mut server, &mut client);
        let graph = call.take_result().unwrap().unwrap();
        (server, client, remote_of(&graph))
    }

    fn add(a: i64, b: i64) -> Arguments {
        Arguments::new().value("a", Value::I64(a)).value("b", Value::I64(b))
    }

    fn remote_failure(result: Option<Result<Graph>>) -> crate::CopiedFailure {
        match result {
            Some(Err(Error::Remote(failure))) => failure,
            other => panic!("expected a remote failure, got {:?}", other),
        }
    }

    fn noop_waker() -> Waker {
        fn clone(_: *const ()) -> RawWaker {
            RawWaker::new(std::ptr::null(), &VTABLE)
        }
        fn noop(_: *const ()) {}
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
        unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
    }

    #[test]
    fn call_and_decref() {
        let (mut server, mut client, remote) = connect(BrokerOptions::new(), BrokerOptions::new(), None);
        assert_eq!(remote.clid(), 1);
        assert!(remote.is_connected());
        assert_eq!(server.exported_count(), 1);

        let call = client.call_remote(&remote, "add", add(2, 3));
        assert_eq!(call.req_id(), Some(1));
        assert_eq!(client.outstanding_count(), 1);
        pump(&mut server, &mut client);
        assert_eq!(call.take_result().unwrap().unwrap().root, Value::I64(5));
        assert_eq!(client.outstanding_count(), 0);

        drop(remote);
        pump(&mut server, &mut client);
        assert_eq!(server.exported_count(), 0);
    }

    #[test]
    fn same_reference_twice() {
        let mut server = Broker::new(BrokerOptions::new());
        server.publish("calc", LocalReference::new(Calculator { interface: None }));
        let mut client = Broker::new(BrokerOptions::new());
        let first = client.get_reference_by_name("calc");
        let second = client.get_reference_by_name("calc");
        pump(&mut server, &mut client);
        let first = remote_of(&first.take_result().unwrap().unwrap());
        let second = remote_of(&second.take_result().unwrap().unwrap());
        assert_eq!(first, second);
        assert_eq!(server.exported_count(), 1);

        drop(first);
        pump(&mut server, &mut client);
        assert_eq!(server.exported_count(), 1);
        drop(second);
        pump(&mut server, &mut client);
        assert_eq!(server.exported_count(), 0);
    }

    #[test]
    fn echo_graphs_and_references() {
        let (mut server, mut client, remote) = connect(BrokerOptions::new(), BrokerOptions::new(), None);
        let mut heap = Heap::new();
        let tuple = heap.tuple(vec![Value::I64(2)]);
        let root = heap.list(vec![Value::I64(1), Value::String("x".into()), tuple]);
        let call = client.call_remote(&remote, "echo",
                                      Arguments::new().arg("value", Graph::new(heap, root)));
        pump(&mut server, &mut client);
        assert_eq!(call.take_result().unwrap().unwrap().to_string(), "[1, \"x\", (2, )]");

        // our reference to their object comes back as the same reference
        let mut heap = Heap::new();
        let root = Value::Obj(heap.alloc(Object::Remote(remote.clone())));
        let call = client.call_remote(&remote, "echo",
                                      Arguments::new().arg("value", Graph::new(heap, root)));
        pump(&mut server, &mut client);
        assert_eq!(remote_of(&call.take_result().unwrap().unwrap()), remote);
    }

    #[test]
    fn remote_failures() {
        let (mut server, mut client, remote) = connect(BrokerOptions::new(), BrokerOptions::new(), None);
        let call = client.call_remote(&remote, "explode", Arguments::new());
        pump(&mut server, &mut client);
        let failure = remote_failure(call.take_result());
        assert_eq!(failure.type_name, VIOLATION_CLASS);
        assert!(failure.value.contains("no method explode"), "{}", failure.value);
        assert_eq!(failure.traceback, "Traceback unavailable\n");

        let call = client.get_reference_by_name("nothing");
        pump(&mut server, &mut client);
        let failure = remote_failure(call.take_result());
        assert!(failure.value.contains("unknown name 'nothing'"), "{}", failure.value);
        assert!(client.is_connected());
    }

    #[test]
    fn interfaces() {
        let (mut server, mut client, remote) = connect(
            BrokerOptions::new(), BrokerOptions::new().interface(calc_interface()),
            Some(calc_interface()));
        assert_eq!(remote.interface_name().as_deref(), Some("calc.ICalc"));

        // checked locally, never sent
        let call = client.call_remote(&remote, "add", Arguments::new()
                                      .value("a", Value::Bytes(b"one".to_vec()))
                                      .value("b", Value::I64(1)));
        assert_eq!(call.req_id(), None);
        assert!(matches!(call.take_result(), Some(Err(Error::Violation(_)))));
        let call = client.call_remote(&remote, "mul", add(1, 2));
        assert!(matches!(call.take_result(), Some(Err(Error::Violation(_)))));

        let call = client.call_remote_positional(&remote, "add", Heap::new(),
                                                 vec![Value::I64(2), Value::I64(3)]);
        pump(&mut server, &mut client);
        assert_eq!(call.take_result().unwrap().unwrap().root, Value::I64(5));
    }

    #[test]
    fn inbound_calls_are_checked() {
        let (mut server, mut client, remote) = connect(
            BrokerOptions::new(), BrokerOptions::new(), Some(calc_interface()));
        let call = client.call_remote(&remote, "add", Arguments::new()
                                      .value("a", Value::Bytes(b"one".to_vec()))
                                      .value("b", Value::I64(1)));
        assert!(call.req_id().is_some());
        pump(&mut server, &mut client);
        assert_eq!(remote_failure(call.take_result()).type_name, VIOLATION_CLASS);

        // the connection survives and the next call works
        let call = client.call_remote(&remote, "add", add(4, 5));
        pump(&mut server, &mut client);
        assert_eq!(call.take_result().unwrap().unwrap().root, Value::I64(9));
    }

    #[test]
    fn require_schema() {
        let (mut server, mut client, remote) = connect(
            BrokerOptions::new().require_schema(true), BrokerOptions::new(), None);
        let call = client.call_remote(&remote, "add", add(1, 1));
        pump(&mut server, &mut client);
        let failure = remote_failure(call.take_result());
        assert!(failure.value.contains("has no schema"), "{}", failure.value);
    }

    #[test]
    fn vocabulary() {
        let mut table = BTreeMap::new();
        for (i, word) in ["call", "answer", "my-reference", "add"].iter().enumerate() {
            table.insert(i as u64, word.as_bytes().to_vec());
        }
        let (mut server, mut client, remote) = connect(
            BrokerOptions::new().vocabulary(table.clone()), BrokerOptions::new().vocabulary(table),
            None);
        let call = client.call_remote(&remote, "add", add(20, 22));
        pump(&mut server, &mut client);
        assert_eq!(call.take_result().unwrap().unwrap().root, Value::I64(42));
    }

    #[test]
    fn future() {
        let (mut server, mut client, remote) = connect(BrokerOptions::new(), BrokerOptions::new(), None);
        let mut call = client.call_remote(&remote, "add", add(2, 3));
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(Pin::new(&mut call).poll(&mut cx).is_pending());
        pump(&mut server, &mut client);
        match Pin::new(&mut call).poll(&mut cx) {
            Poll::Ready(Ok(graph)) => assert_eq!(graph.root, Value::I64(5)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn cancel() {
        let mut server = Broker::new(BrokerOptions::new());
        server.publish("calc", LocalReference::new(Calculator { interface: None }));
        let mut client = Broker::new(BrokerOptions::new());
        let call = client.get_reference_by_name("calc");
        call.cancel();
        assert!(matches!(call.take_result(), Some(Err(Error::Cancelled))));
        // the late answer is dropped, and so is the reference it carried
        pump(&mut server, &mut client);
        assert_eq!(client.outstanding_count(), 0);
        assert_eq!(server.exported_count(), 0);
        call.cancel();
        assert!(call.take_result().is_none());
    }

    #[test]
    fn cancel_without_answer() {
        let mut client = Broker::new(BrokerOptions::new());
        let call = client.get_reference_by_name("calc");
        assert_eq!(client.outstanding_count(), 1);
        call.cancel();
        assert!(matches!(call.take_result(), Some(Err(Error::Cancelled))));
        assert_eq!(client.outstanding_count(), 0);
        client.take_output();
        assert_eq!(client.outstanding_count(), 0);
        // a late answer is still accepted and dropped
        let data = tokens_to_vec(&[Token::Open(0), s("answer"), Token::Int(0), Token::Int(1),
                                   Token::Close(0)]).unwrap();
        client.data_received(&data).unwrap();
        assert!(client.is_connected());
        assert!(call.take_result().is_none());
    }

    #[test]
    fn unsent_call_keeps_nothing_exported() {
        let (mut server, mut client, remote) = connect(BrokerOptions::new(), BrokerOptions::new(), None);
        let mut args = Arguments::new();
        let local = args.heap.alloc(Object::Local(LocalReference::new(Calculator { interface: None })));
        let secret = args.heap.instance("app.Secret", vec![]);
        args.named.insert("a".into(), Value::Obj(local));
        args.named.insert("b".into(), secret);
        let call = client.call_remote(&remote, "echo", args);
        assert!(matches!(call.take_result(), Some(Err(Error::Insecure(_)))));
        assert_eq!(call.req_id(), None);
        assert_eq!(client.exported_count(), 0);

        // the request id was not used up
        let call = client.call_remote(&remote, "add", add(1, 1));
        assert_eq!(call.req_id(), Some(1));
        pump(&mut server, &mut client);
        assert_eq!(call.take_result().unwrap().unwrap().root, Value::I64(2));
    }

    #[test]
    fn registered_classes_arrive_built() {
        let classes = ClassRegistry::new().register(
            "app.Point", |heap: &mut Heap, state: Vec<(String, Value)>| {
                Ok(heap.tuple(state.into_iter().map(|(_, v)| v).collect()))
            });
        let (mut server, mut client, remote) = connect(
            BrokerOptions::new().taster(DummySecurityOptions).classes(classes),
            BrokerOptions::new().taster(DummySecurityOptions), None);
        let mut heap = Heap::new();
        let point = heap.instance("app.Point", vec![("x".into(), Value::I64(1)),
                                                    ("y".into(), Value::I64(2))]);
        let call = client.call_remote(&remote, "echo",
                                      Arguments::new().arg("value", Graph::new(heap, point)));
        pump(&mut server, &mut client);
        assert_eq!(call.take_result().unwrap().unwrap().to_string(), "(1, 2)");
    }

    #[test]
    fn disconnect_resolves_once() {
        let (_server, mut client, remote) = connect(BrokerOptions::new(), BrokerOptions::new(), None);
        let call = client.call_remote(&remote, "add", add(1, 2));
        let resolved = Rc::new(Cell::new(0));
        let counter = resolved.clone();
        call.on_resolved(move |result| {
            assert!(matches!(*result, Err(Error::DeadReference(_))));
            counter.set(counter.get() + 1);
        });
        let notified = Rc::new(Cell::new(0));
        let counter = notified.clone();
        remote.notify_on_disconnect(move || counter.set(counter.get() + 1));

        client.connection_lost("first");
        client.connection_lost("second");
        assert_eq!(resolved.get(), 1);
        assert_eq!(notified.get(), 1);
        assert!(!remote.is_connected());
        assert!(matches!(call.take_result(), Some(Err(Error::DeadReference(ref why))) if why == "first"));

        let late = client.call_remote(&remote, "add", add(1, 2));
        assert!(matches!(late.take_result(), Some(Err(Error::DeadReference(_)))));
        // watchers added after the fact run right away
        let counter = notified.clone();
        client.notify_on_disconnect(move || counter.set(counter.get() + 1));
        assert_eq!(notified.get(), 2);
    }

    #[test]
    fn unknown_request_is_fatal() {
        let mut client = Broker::new(BrokerOptions::new());
        let pending = client.get_reference_by_name("calc");
        let data = tokens_to_vec(&[Token::Open(0), s("answer"), Token::Int(99), Token::Int(1),
                                   Token::Close(0)]).unwrap();
        client.take_output();
        assert!(matches!(client.data_received(&data),
                         Err(Error::Banana(ErrorCode::UnknownRequest(99)))));
        assert!(!client.is_connected());
        assert!(matches!(pending.take_result(), Some(Err(Error::DeadReference(_)))));
        let output = tokens_from_slice(&client.take_output()).unwrap();
        match output.last() {
            Some(&Token::Error(ref msg)) => {
                assert!(String::from_utf8_lossy(msg).contains("non-existent reqID '99'"));
            }
            other => panic!("expected an ERROR token, got {:?}", other),
        }
        assert!(client.data_received(b"\x00\x81").is_err());
    }

    #[test]
    fn fuzzing() {
        // Feeding random bytes into a broker must not panic.
        let mut data = [0u8; 1000];
        for _ in 0..200 {
            thread_rng().fill_bytes(&mut data);
            let mut broker = Broker::new(BrokerOptions::new());
            broker.publish("calc", LocalReference::new(Calculator { interface: None }));
            let _ = broker.data_received(&data);
            let _ = broker.take_output();
        }
    }
}
