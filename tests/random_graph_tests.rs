mod common;

use common::shop;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Value, json};
use upsertgraph::{IdKey, MemoryStorage, UpsertGraph};

#[tokio::test]
async fn test_random_item_churn_converges() {
    let shop = shop();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for round in 0..20 {
        let storage = MemoryStorage::new();
        storage.seed(&shop.order, json!({"id": 1})).expect("seed");
        let existing: Vec<i64> = (1..=rng.gen_range(0..12)).collect();
        for &id in &existing {
            storage
                .seed(&shop.item, json!({"id": id, "order_id": 1, "sku": format!("s{id}")}))
                .expect("seed");
        }

        let kept: Vec<i64> = existing
            .iter()
            .copied()
            .filter(|_| rng.gen_bool(0.5))
            .collect();
        let renamed: Vec<i64> = kept.iter().copied().filter(|_| rng.gen_bool(0.3)).collect();
        let added = rng.gen_range(0..8);

        let mut items: Vec<Value> = kept
            .iter()
            .map(|&id| {
                let sku = if renamed.contains(&id) {
                    format!("r{id}")
                } else {
                    format!("s{id}")
                };
                json!({"id": id, "sku": sku})
            })
            .collect();
        items.extend((0..added).map(|n| json!({"sku": format!("new{n}")})));

        let (desired, _) = shop.graph(json!({"id": 1, "items": items}));
        let outcome = UpsertGraph::new(&storage)
            .run(desired, &storage)
            .await
            .expect("upsert");

        let stats = outcome.stats();
        assert_eq!(stats.inserted, added, "round {round}");
        assert_eq!(stats.deleted, existing.len() - kept.len(), "round {round}");
        assert_eq!(stats.patched, renamed.len(), "round {round}");

        let rows = storage.rows("Item");
        assert_eq!(rows.len(), kept.len() + added, "round {round}");
        assert!(
            rows.iter().all(|row| row.get("order_id") == Some(&json!(1))),
            "round {round}"
        );
        for &id in &renamed {
            let row = storage
                .find(&shop.item, &IdKey::single(id))
                .expect("renamed row");
            assert_eq!(row.get("sku"), Some(&json!(format!("r{id}"))));
        }
    }
}
