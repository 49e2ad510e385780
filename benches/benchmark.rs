use criterion::{black_box, criterion_group, criterion_main, Criterion};
use banana_jelly::{Graph, Heap, JellyOptions, UnjellyOptions, Value, jelly_to_vec, unjelly_from_slice};

fn big_list() -> Graph {
    let mut heap = Heap::new();
    let items = (0..10_000).map(|i| Value::I64(i * 1000)).collect();
    let root = heap.list(items);
    Graph::new(heap, root)
}

fn many_refs() -> Graph {
    let mut heap = Heap::new();
    let shared = heap.dict(vec![(Value::String("key".into()), Value::F64(1.5))]);
    let root = heap.list(vec![shared; 5000]);
    Graph::new(heap, root)
}

fn many_strings() -> Graph {
    let mut heap = Heap::new();
    let items = (0..5000).map(|i| Value::String(format!("string number {}", i))).collect();
    let root = heap.tuple(items);
    Graph::new(heap, root)
}

fn bench_graph(c: &mut Criterion, name: &str, graph: Graph) {
    let contents = jelly_to_vec(&graph, &JellyOptions::new()).unwrap();

    c.bench_function(&format!("unjelly {}", name), |b| {
        b.iter(|| unjelly_from_slice(black_box(&contents), &UnjellyOptions::new()).unwrap())
    });
    c.bench_function(&format!("jelly {}", name), |b| {
        b.iter(|| jelly_to_vec(black_box(&graph), &JellyOptions::new()).unwrap())
    });
}

pub fn criterion_benchmark(c: &mut Criterion) {
    bench_graph(c, "biglist", big_list());
    bench_graph(c, "manyrefs", many_refs());
    bench_graph(c, "manystrings", many_strings());
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
