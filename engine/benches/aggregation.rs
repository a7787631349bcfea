//! FILENAME: engine/benches/aggregation.rs
//! PURPOSE: Hot paths of a recalculation pass: reference scanning,
//! substitution and a bulk pass over a wide table.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use engine::{
    AggregationEngine, AggregationSpec, ColumnKind, ColumnMetadata, DataValue, IdentityAttributes,
    MemorySchema, MemorySnapshots, Resolver, SimpleStatistic, SnapshotStore, SubstituteOptions,
};
use parser::Reference;
use std::sync::atomic::AtomicBool;

const TEMPLATE: &str = "Dear $PREFERREDNAME$, your scores were $Q0$, $Q1.round1$ and $Q2$. \
                        Legacy Q3->>\"$[0]\" and a stray $ sign.";

const SOURCES: usize = 20;
const IDENTIFIERS: usize = 200;

fn fixture() -> (MemorySchema, MemorySnapshots, Vec<String>) {
    let schema = MemorySchema::new();
    let store = MemorySnapshots::new();
    let mut sources = Vec::new();
    for i in 0..SOURCES {
        let id = format!("Q{}", i);
        schema.insert(ColumnMetadata::new(id.as_str(), "T1", id.as_str(), ColumnKind::SimpleEntry));
        sources.push(Reference::new(id));
    }
    schema.insert(ColumnMetadata::aggregator(
        "TOTAL",
        "T1",
        "Total",
        AggregationSpec::simple(SimpleStatistic::Sum, sources.clone()),
    ));
    schema.insert(ColumnMetadata::aggregator(
        "MEAN",
        "T1",
        "Mean",
        AggregationSpec::formula(format!("$TOTAL$ / {}", SOURCES)),
    ));

    let mut identifiers = Vec::new();
    for n in 0..IDENTIFIERS {
        let identifier = format!("s{}", n);
        store.enrol(identifier.as_str(), "T1", IdentityAttributes::default());
        for (i, source) in sources.iter().enumerate() {
            store.set_value(&identifier, &source.base_column_id, DataValue::Number((n + i) as f64), "seed");
        }
        identifiers.push(identifier);
    }
    (schema, store, identifiers)
}

fn bench_scan(c: &mut Criterion) {
    c.bench_function("references/scan_template", |b| {
        b.iter(|| black_box(parser::parse_references(black_box(TEMPLATE)).count()));
    });
}

fn bench_substitute(c: &mut Criterion) {
    let (schema, store, _) = fixture();
    let ids: Vec<String> = (0..4).map(|i| format!("Q{}", i)).collect();
    let snapshot = store.get_attributes("s0", &ids).unwrap_or_default();
    let resolver = Resolver::new(&schema);
    let options = SubstituteOptions::default();

    c.bench_function("resolver/substitute_template", |b| {
        b.iter(|| black_box(resolver.substitute(black_box(TEMPLATE), &snapshot, &options)));
    });
}

fn bench_bulk(c: &mut Criterion) {
    let (schema, store, identifiers) = fixture();
    let sources = vec!["Q0".to_string()];
    let cancel = AtomicBool::new(false);

    c.bench_function("aggregation/bulk_two_levels", |b| {
        b.iter(|| {
            let engine = AggregationEngine::new(&schema, &store);
            black_box(engine.compute_bulk(&sources, &identifiers, false, &cancel).order.len())
        });
    });
}

criterion_group!(benches, bench_scan, bench_substitute, bench_bulk);
criterion_main!(benches);
