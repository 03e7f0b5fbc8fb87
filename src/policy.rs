//! Per-node decisions: insert, relate, patch, update, delete, unrelate.
//!
//! Insert-side decisions look at a desired node and its current counterpart.
//! Delete-side decisions look at a current node and its desired counterpart.
//! All of them are pure reads of the graph pair and the options.

use crate::config::{GraphOption, UpsertOptions};
use crate::graph::{GraphPair, Node, NodeId, NodeKind};

#[derive(Clone, Debug, Default)]
pub struct GraphOptions {
    options: UpsertOptions,
}

impl GraphOptions {
    pub fn new(options: UpsertOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &UpsertOptions {
        &self.options
    }

    fn has_option(&self, node: &Node, option: GraphOption) -> bool {
        self.options.flag(option).applies_to(node.relation_path())
    }

    pub fn is_insert_disabled(&self, pair: &GraphPair, node: NodeId) -> bool {
        self.has_option(pair.desired().node(node), GraphOption::NoInsert)
    }

    pub fn is_relate_disabled(&self, pair: &GraphPair, node: NodeId) -> bool {
        self.has_option(pair.desired().node(node), GraphOption::NoRelate)
    }

    pub fn should_relate(&self, pair: &GraphPair, node: NodeId) -> bool {
        !self.is_relate_disabled(pair, node) && self.relate_applies(pair, node)
    }

    pub fn should_insert(&self, pair: &GraphPair, node: NodeId) -> bool {
        let desired = pair.desired().node(node);
        pair.current_of(node).is_none()
            && !self.has_option(desired, GraphOption::NoInsert)
            && !self.relate_applies(pair, node)
            && (!desired.has_id() || self.has_option(desired, GraphOption::InsertMissing))
    }

    pub fn should_patch(&self, pair: &GraphPair, node: NodeId) -> bool {
        self.patch_applies(pair, node)
            && !self.has_option(pair.desired().node(node), GraphOption::Update)
    }

    pub fn should_update(&self, pair: &GraphPair, node: NodeId) -> bool {
        self.patch_applies(pair, node)
            && self.has_option(pair.desired().node(node), GraphOption::Update)
    }

    pub fn should_unrelate(&self, pair: &GraphPair, current: NodeId) -> bool {
        self.removal_eligible(pair, current)
            && !self.has_option(pair.current().node(current), GraphOption::NoUnrelate)
            && self.has_option(pair.current().node(current), GraphOption::Unrelate)
    }

    pub fn should_delete(&self, pair: &GraphPair, current: NodeId) -> bool {
        self.removal_eligible(pair, current)
            && !self.has_option(pair.current().node(current), GraphOption::NoDelete)
            && !self.has_option(pair.current().node(current), GraphOption::Unrelate)
    }

    pub fn should_insert_or_relate(&self, pair: &GraphPair, node: NodeId) -> bool {
        self.should_insert(pair, node) || self.should_relate(pair, node)
    }

    pub fn should_delete_or_unrelate(&self, pair: &GraphPair, current: NodeId) -> bool {
        self.should_delete(pair, current) || self.should_unrelate(pair, current)
    }

    pub fn should_patch_or_update(&self, pair: &GraphPair, node: NodeId) -> bool {
        self.should_patch(pair, node) || self.should_update(pair, node)
    }

    fn patch_applies(&self, pair: &GraphPair, node: NodeId) -> bool {
        // Nodes about to be related are always candidates; nothing is written
        // unless the diff finds something.
        if self.should_relate(pair, node) {
            return true;
        }
        pair.current_of(node).is_some()
            && !self.has_option(pair.desired().node(node), GraphOption::NoUpdate)
    }

    fn relate_applies(&self, pair: &GraphPair, node: NodeId) -> bool {
        let desired = pair.desired();
        let n = desired.node(node);
        if !matches!(n.kind(), NodeKind::Entity) {
            return true;
        }
        if pair.current_of(node).is_some() || !self.has_option(n, GraphOption::Relate) {
            return false;
        }
        n.parent_edge()
            .and_then(|edge| desired.edge(edge).relation())
            .is_some_and(|relation| relation.has_relate_prop(n.entity(), n.entity_type()))
    }

    /// Absent from the desired graph and no ancestor already going away.
    /// Removing a parent takes its children with it, so they get no action
    /// of their own.
    fn removal_eligible(&self, pair: &GraphPair, current: NodeId) -> bool {
        pair.desired_of(current).is_none() && !pair.ancestor_removed(current)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::config::OptionFlag;
    use crate::graph::ModelGraph;
    use crate::model::{Entity, EntityType, PropertyList, Relation};

    struct Fixture {
        order: Arc<EntityType>,
        item: Arc<EntityType>,
        items: Arc<Relation>,
    }

    fn fixture() -> Fixture {
        Fixture {
            order: Arc::new(EntityType::new("Order").with_relation("items")),
            item: Arc::new(EntityType::new("Item")),
            items: Arc::new(Relation::has_many(
                "items",
                "Order",
                "Item",
                PropertyList::new(["id"]),
                PropertyList::new(["order_id"]),
            )),
        }
    }

    fn entity(value: serde_json::Value) -> Entity {
        Entity::from_json(value).unwrap()
    }

    fn graph(f: &Fixture, root: serde_json::Value, items: &[serde_json::Value]) -> ModelGraph {
        let mut graph = ModelGraph::single();
        let root = graph.add_root(Arc::clone(&f.order), entity(root));
        for item in items {
            graph
                .add_child(
                    root,
                    Arc::clone(&f.items),
                    Arc::clone(&f.item),
                    entity(item.clone()),
                )
                .unwrap();
        }
        graph
    }

    #[test]
    fn test_new_node_without_id_is_inserted() {
        let f = fixture();
        let pair = GraphPair::new(
            graph(&f, json!({}), &[json!({"name": "a"})]),
            ModelGraph::single(),
        );
        let opts = GraphOptions::default();
        for id in pair.desired().node_ids() {
            assert!(opts.should_insert(&pair, id));
            assert!(!opts.should_relate(&pair, id));
            assert!(!opts.should_patch_or_update(&pair, id));
        }
    }

    #[test]
    fn test_no_insert_path_blocks_only_that_path() {
        let f = fixture();
        let pair = GraphPair::new(graph(&f, json!({}), &[json!({})]), ModelGraph::single());
        let opts = GraphOptions::new(UpsertOptions {
            no_insert: OptionFlag::paths(["items"]),
            ..UpsertOptions::default()
        });
        let ids: Vec<_> = pair.desired().node_ids().collect();
        assert!(opts.should_insert(&pair, ids[0]));
        assert!(!opts.should_insert(&pair, ids[1]));
        assert!(opts.is_insert_disabled(&pair, ids[1]));
    }

    #[test]
    fn test_missing_node_with_id_needs_relate_or_insert_missing() {
        let f = fixture();
        let desired = graph(&f, json!({"id": 1}), &[json!({"id": 5})]);
        let current = graph(&f, json!({"id": 1}), &[]);

        let pair = GraphPair::new(desired.clone(), current.clone());
        let item = NodeId(1);
        let plain = GraphOptions::default();
        assert!(!plain.should_insert_or_relate(&pair, item));

        let relate = GraphOptions::new(UpsertOptions::new().with(GraphOption::Relate, true));
        assert!(relate.should_relate(&pair, item));
        assert!(!relate.should_insert(&pair, item));
        assert!(relate.should_patch(&pair, item));

        let insert_missing =
            GraphOptions::new(UpsertOptions::new().with(GraphOption::InsertMissing, true));
        assert!(insert_missing.should_insert(&pair, item));

        let no_relate = GraphOptions::new(
            UpsertOptions::new()
                .with(GraphOption::Relate, true)
                .with(GraphOption::NoRelate, true),
        );
        assert!(!no_relate.should_relate(&pair, item));
    }

    #[test]
    fn test_existing_node_is_patched_or_updated() {
        let f = fixture();
        let desired = graph(&f, json!({"id": 1, "note": "x"}), &[]);
        let current = graph(&f, json!({"id": 1}), &[]);
        let pair = GraphPair::new(desired, current);
        let root = NodeId(0);

        assert!(GraphOptions::default().should_patch(&pair, root));
        let update = GraphOptions::new(UpsertOptions::new().with(GraphOption::Update, true));
        assert!(update.should_update(&pair, root));
        assert!(!update.should_patch(&pair, root));
        let no_update = GraphOptions::new(UpsertOptions::new().with(GraphOption::NoUpdate, true));
        assert!(!no_update.should_patch_or_update(&pair, root));
    }

    #[test]
    fn test_removed_child_is_deleted_or_unrelated_exactly_once() {
        let f = fixture();
        let desired = graph(&f, json!({"id": 1}), &[]);
        let current = graph(&f, json!({"id": 1}), &[json!({"id": 7, "order_id": 1})]);
        let pair = GraphPair::new(desired, current);
        let child = NodeId(1);

        let delete = GraphOptions::default();
        assert!(delete.should_delete(&pair, child));
        assert!(!delete.should_unrelate(&pair, child));

        let unrelate = GraphOptions::new(UpsertOptions::new().with(GraphOption::Unrelate, true));
        assert!(unrelate.should_unrelate(&pair, child));
        assert!(!unrelate.should_delete(&pair, child));

        let keep = GraphOptions::new(UpsertOptions::new().with(GraphOption::NoDelete, true));
        assert!(!keep.should_delete_or_unrelate(&pair, child));
    }

    #[test]
    fn test_descendants_of_removed_nodes_get_no_action() {
        let f = fixture();
        let product = Arc::new(EntityType::new("Product"));
        let parts = Arc::new(Relation::has_many(
            "parts",
            "Item",
            "Product",
            PropertyList::new(["id"]),
            PropertyList::new(["item_id"]),
        ));
        let desired = graph(&f, json!({"id": 1}), &[]);
        let mut current = graph(&f, json!({"id": 1}), &[json!({"id": 7})]);
        let part = current
            .add_child(NodeId(1), parts, product, entity(json!({"id": 9})))
            .unwrap();
        let pair = GraphPair::new(desired, current);

        let opts = GraphOptions::default();
        assert!(opts.should_delete(&pair, NodeId(1)));
        assert!(pair.ancestor_removed(part));
        assert!(!opts.should_delete_or_unrelate(&pair, part));
    }

    #[test]
    fn test_references_always_relate() {
        let f = fixture();
        let mut desired = graph(&f, json!({}), &[]);
        let external = desired
            .add_external_reference(
                NodeId(0),
                Arc::clone(&f.items),
                Arc::clone(&f.item),
                entity(json!({"id": 3})),
            )
            .unwrap();
        let pair = GraphPair::new(desired, ModelGraph::single());
        let opts = GraphOptions::default();
        assert!(opts.should_relate(&pair, external));
        assert!(!opts.should_insert(&pair, external));
    }
}
