//! Performance benchmarks for tether-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use std::collections::HashSet;
use tether_engine::operation::compact;
use tether_engine::{
    object_union, CollectionSchema, ConflictResolver, Entity, FieldDef, FieldType, LastWriteWins,
    LocalStore, Operation, Schema,
};

fn create_test_schema() -> Schema {
    let fields = vec![
        FieldDef::required("name", FieldType::String),
        FieldDef::optional("email", FieldType::String),
        FieldDef::optional("age", FieldType::Int),
    ];
    Schema::new(1).with_collection(CollectionSchema::new("users", fields))
}

/// `entities` never-pushed entities, each with a create and `updates` updates.
fn queue(entities: usize, updates: usize) -> Vec<Operation> {
    let mut ops = Vec::with_capacity(entities * (updates + 1));
    for i in 0..entities {
        let mut entity = Entity::new_local("users", json!({"name": format!("user{i}")}), 1000);
        ops.push(Operation::create(&entity, 1000));
        for u in 0..updates {
            entity.apply_local_update(json!({"name": format!("user{i}-{u}")}), 1001 + u as u64);
            ops.push(Operation::update(&entity, 0, 1001 + u as u64));
        }
    }
    ops
}

fn bench_compaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("compaction");

    for size in [10, 100, 1000] {
        let ops = queue(size, 4);
        group.bench_with_input(BenchmarkId::new("create_update_runs", size), &ops, |b, ops| {
            b.iter(|| compact(black_box(ops)))
        });
    }

    // Nothing to fold: every head was already attempted.
    let mut attempted = queue(1000, 0);
    for op in &mut attempted {
        op.attempt_count = 1;
    }
    group.bench_function("nothing_to_fold", |b| b.iter(|| compact(black_box(&attempted))));

    group.finish();
}

fn bench_conflict_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("conflict_resolution");

    let local = Entity::remote("l-1", "r-1", "users", 3, json!({"name": "local"}), 2000);
    let remote = Entity::remote("l-1", "r-1", "users", 4, json!({"name": "remote"}), 1000);
    group.bench_function("last_write_wins", |b| {
        b.iter(|| LastWriteWins.resolve(black_box(&local), black_box(&remote)))
    });

    for fields in [10, 100, 1000] {
        let left: serde_json::Map<String, serde_json::Value> = (0..fields)
            .map(|i| (format!("field{i}"), json!({"value": i, "tags": ["a", "b"]})))
            .collect();
        let right: serde_json::Map<String, serde_json::Value> = (0..fields)
            .map(|i| (format!("field{}", i + fields / 2), json!({"value": -i, "tags": ["b", "c"]})))
            .collect();
        let (left, right) = (
            serde_json::Value::Object(left),
            serde_json::Value::Object(right),
        );

        group.bench_with_input(
            BenchmarkId::new("object_union", fields),
            &(left, right),
            |b, (left, right)| b.iter(|| object_union(black_box(left), black_box(right))),
        );
    }

    group.finish();
}

fn bench_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("validation");
    let schema = create_test_schema();
    let payload = json!({"name": "Test User", "email": "test@example.com", "age": 30});

    group.bench_function("valid_payload", |b| {
        b.iter(|| schema.validate(black_box("users"), black_box(&payload)))
    });

    group.finish();
}

fn bench_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("store");
    let Ok(rt) = tokio::runtime::Runtime::new() else {
        return;
    };

    group.bench_function("write_entity_and_operation", |b| {
        let Ok(store) = rt.block_on(LocalStore::in_memory()) else {
            return;
        };
        b.iter(|| {
            rt.block_on(async {
                let entity = Entity::new_local("users", json!({"name": "Test User"}), 1000);
                let op = Operation::create(&entity, 1000);
                let mut tx = store.begin().await?;
                tether_engine::store::entities::upsert(&mut tx, &entity).await?;
                tether_engine::store::operations::insert(&mut tx, &op).await?;
                tx.commit().await?;
                Ok::<_, tether_engine::Error>(())
            })
        })
    });

    group.bench_function("dequeue_batch_1000", |b| {
        let Ok(store) = rt.block_on(LocalStore::in_memory()) else {
            return;
        };
        rt.block_on(async {
            for op in queue(1000, 0) {
                let _ = store.enqueue(&op).await;
            }
        });
        let exclude = HashSet::new();
        b.iter(|| rt.block_on(store.dequeue_batch(black_box(50), &exclude)))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_compaction,
    bench_conflict_resolution,
    bench_validation,
    bench_store,
);
criterion_main!(benches);
