use std::{sync::Arc, time::Duration};

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tokio::runtime::Runtime;
use upsertgraph::{
    Entity, EntityType, ExecutionConfig, GraphOption, MemoryStorage, ModelGraph, PropertyList,
    Relation, UpsertGraph, UpsertOptions,
};

const WIDE_SEED: u64 = 0xA17C;
const SAMPLE_SIZE: usize = 20;
const WARM_UP: Duration = Duration::from_millis(300);
const MEASURE: Duration = Duration::from_millis(500);

struct Schema {
    order: Arc<EntityType>,
    item: Arc<EntityType>,
    product: Arc<EntityType>,
    items: Arc<Relation>,
    product_rel: Arc<Relation>,
}

fn schema() -> Schema {
    Schema {
        order: Arc::new(EntityType::new("Order").with_relation("items")),
        item: Arc::new(EntityType::new("Item").with_relation("product")),
        product: Arc::new(EntityType::new("Product")),
        items: Arc::new(Relation::has_many(
            "items",
            "Order",
            "Item",
            PropertyList::new(["id"]),
            PropertyList::new(["order_id"]),
        )),
        product_rel: Arc::new(Relation::belongs_to_one(
            "product",
            "Item",
            "Product",
            PropertyList::new(["product_id"]),
            PropertyList::new(["id"]),
        )),
    }
}

fn bench_scales() -> &'static [usize] {
    &[100, 1_000, 5_000]
}

/// One order with `items` children; roughly a third carry a product. With
/// `with_ids` every entity carries a fixed identifier.
fn wide_graph(schema: &Schema, items: usize, seed: u64, with_ids: bool) -> ModelGraph {
    let mut rng = StdRng::seed_from_u64(seed);
    let entity = |mut value: serde_json::Value, id: usize| {
        if with_ids {
            value["id"] = json!(id);
        }
        Entity::from_json(value).expect("entity")
    };
    let mut graph = ModelGraph::single();
    let root = graph.add_root(Arc::clone(&schema.order), entity(json!({"no": "bench"}), 1));
    for n in 0..items {
        let item = graph
            .add_child(
                root,
                Arc::clone(&schema.items),
                Arc::clone(&schema.item),
                entity(json!({"sku": n, "qty": rng.gen_range(1..10)}), n + 1),
            )
            .expect("item");
        if rng.gen_bool(0.33) {
            graph
                .add_child(
                    item,
                    Arc::clone(&schema.product_rel),
                    Arc::clone(&schema.product),
                    entity(json!({"title": format!("p{n}")}), n + 1),
                )
                .expect("product");
        }
    }
    graph
}

fn bench_insert_wide(c: &mut Criterion) {
    let runtime = Runtime::new().expect("runtime");
    let schema = schema();
    let mut group = c.benchmark_group("upsert_insert_wide");
    group.sample_size(SAMPLE_SIZE);
    group.warm_up_time(WARM_UP);
    group.measurement_time(MEASURE);
    for &items in bench_scales() {
        let graph = wide_graph(&schema, items, WIDE_SEED + items as u64, false);
        group.bench_function(BenchmarkId::from_parameter(items), |b| {
            b.to_async(&runtime).iter(|| {
                let desired = graph.clone();
                async move {
                    let storage = MemoryStorage::new();
                    UpsertGraph::new(&storage)
                        .with_config(ExecutionConfig::new().with_max_batch_size(500))
                        .run(desired, &storage)
                        .await
                        .expect("upsert");
                }
            });
        });
    }
    group.finish();
}

fn bench_noop_rerun(c: &mut Criterion) {
    let runtime = Runtime::new().expect("runtime");
    let schema = schema();
    let mut group = c.benchmark_group("upsert_noop_rerun");
    group.sample_size(SAMPLE_SIZE);
    group.warm_up_time(WARM_UP);
    group.measurement_time(MEASURE);
    for &items in bench_scales() {
        let storage = MemoryStorage::new();
        runtime
            .block_on(
                UpsertGraph::new(&storage)
                    .with_options(UpsertOptions::new().with(GraphOption::InsertMissing, true))
                    .run(wide_graph(&schema, items, WIDE_SEED, true), &storage),
            )
            .expect("seed run");
        let desired = wide_graph(&schema, items, WIDE_SEED, true);
        group.bench_function(BenchmarkId::from_parameter(items), |b| {
            b.to_async(&runtime).iter(|| {
                let desired = desired.clone();
                let storage = &storage;
                async move {
                    UpsertGraph::new(storage)
                        .run(desired, storage)
                        .await
                        .expect("upsert");
                }
            });
        });
    }
    group.finish();
}

criterion_group!(
    name = upsert_benches;
    config = Criterion::default();
    targets = bench_insert_wide, bench_noop_rerun
);
criterion_main!(upsert_benches);
