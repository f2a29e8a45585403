use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use metrond::config::{ConfigKey, EngineConfig};
use metrond::engine::Engine;
use metrond::field::{Atom, Field, FieldPath, FieldValue, Value};
use metrond::guardrail::EngineStats;
use metrond::metrics::init::InitDeps;
use metrond::wire::{decode_atom, encode_atom};

const SEC: i64 = 1_000_000_000;

fn build_engine() -> (Engine, ConfigKey) {
    let config: EngineConfig = serde_yaml::from_str(
        r#"
id: 1
matchers:
  - id: 1
    simple:
      atom_id: 10
      field_tests: [{field: 2, eq_int: 1}]
  - id: 2
    simple:
      atom_id: 10
      field_tests: [{field: 2, eq_int: 0}]
  - id: 3
    simple:
      atom_id: 11
predicates:
  - id: 50
    simple:
      start: 1
      stop: 2
      dimensions: [{field: 1}]
metrics:
  - kind: count
    id: 100
    what: 3
    bucket: 60s
    dimensions_in_what: [{field: 1}]
  - kind: duration
    id: 101
    what: 50
    aggregation: sum
    bucket: 60s
    dimensions_in_what: [{field: 1}]
"#,
    )
    .expect("config parses");

    let key = ConfigKey { uid: 1000, id: 1 };
    let engine = Engine::new(0, InitDeps::bare(Arc::new(EngineStats::new())), None);
    assert!(engine.install_config(key, config, 0));
    (engine, key)
}

fn count_atom(uid: i32, ts: i64) -> Atom {
    Atom::new(
        11,
        1000,
        ts,
        vec![FieldValue::new(
            Field::new(11, FieldPath::leaf(1)),
            Value::Int(uid),
        )],
    )
}

fn duration_atom(uid: i32, state: i32, ts: i64) -> Atom {
    Atom::new(
        10,
        1000,
        ts,
        vec![
            FieldValue::new(Field::new(10, FieldPath::leaf(1)), Value::Int(uid)),
            FieldValue::new(Field::new(10, FieldPath::leaf(2)), Value::Int(state)),
        ],
    )
}

fn bench_wire_decode(c: &mut Criterion) {
    let bytes = encode_atom(&duration_atom(1337, 1, 42 * SEC));
    // Strip the length prefix; decode_atom takes the record body.
    let body = &bytes[1..];

    c.bench_function("wire_decode", |b| {
        b.iter(|| decode_atom(black_box(body)).expect("decodes"))
    });
}

fn bench_count_ingestion(c: &mut Criterion) {
    let (engine, _) = build_engine();
    let atoms: Vec<Atom> = (0..128).map(|i| count_atom(4000 + i, SEC)).collect();

    c.bench_function("count_ingest_128", |b| {
        b.iter(|| {
            for atom in &atoms {
                engine.on_atom(black_box(atom));
            }
        })
    });
}

fn bench_duration_start_stop(c: &mut Criterion) {
    let (engine, _) = build_engine();
    let starts: Vec<Atom> = (0..64).map(|i| duration_atom(i, 1, SEC)).collect();
    let stops: Vec<Atom> = (0..64).map(|i| duration_atom(i, 0, 2 * SEC)).collect();

    c.bench_function("duration_start_stop_64", |b| {
        b.iter(|| {
            for atom in starts.iter().chain(stops.iter()) {
                engine.on_atom(black_box(atom));
            }
        })
    });
}

fn bench_uninteresting_tag(c: &mut Criterion) {
    let (engine, _) = build_engine();
    let atom = Atom::new(999, 1000, SEC, vec![]);

    c.bench_function("uninteresting_tag_discard", |b| {
        b.iter(|| engine.on_atom(black_box(&atom)))
    });
}

criterion_group!(
    benches,
    bench_wire_decode,
    bench_count_ingestion,
    bench_duration_start_stop,
    bench_uninteresting_tag,
);
criterion_main!(benches);
