#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{Map, Value, json};
use upsertgraph::{
    Entity, EntityType, JoinTable, ModelGraph, NodeId, PropertyList, Relation, StorageCall,
    StorageOp,
};

/// Orders with items, an owning customer and tags; items point at a product.
pub struct Shop {
    pub order: Arc<EntityType>,
    pub item: Arc<EntityType>,
    pub customer: Arc<EntityType>,
    pub product: Arc<EntityType>,
    pub tag: Arc<EntityType>,
    pub items: Arc<Relation>,
    pub customer_rel: Arc<Relation>,
    pub product_rel: Arc<Relation>,
    pub tags: Arc<Relation>,
}

pub fn shop() -> Shop {
    let customer = Arc::new(EntityType::new("Customer"));
    let product = Arc::new(EntityType::new("Product"));
    let tag = Arc::new(EntityType::new("Tag"));
    let product_rel = Arc::new(Relation::belongs_to_one(
        "product",
        "Item",
        "Product",
        PropertyList::new(["product_id"]),
        PropertyList::new(["id"]),
    ));
    let item = Arc::new(
        EntityType::new("Item").with_related(Arc::clone(&product_rel), Arc::clone(&product)),
    );
    let items = Arc::new(Relation::has_many(
        "items",
        "Order",
        "Item",
        PropertyList::new(["id"]),
        PropertyList::new(["order_id"]),
    ));
    let customer_rel = Arc::new(Relation::belongs_to_one(
        "customer",
        "Order",
        "Customer",
        PropertyList::new(["customer_id"]),
        PropertyList::new(["id"]),
    ));
    let tags = Arc::new(Relation::many_to_many(
        "tags",
        "Order",
        "Tag",
        PropertyList::new(["id"]),
        PropertyList::new(["id"]),
        JoinTable {
            table: "orders_tags".into(),
            owner_columns: vec!["order_id".into()],
            related_columns: vec!["tag_id".into()],
            extras: vec!["position".into()],
        },
    ));
    let order = Arc::new(
        EntityType::new("Order")
            .with_related(Arc::clone(&items), Arc::clone(&item))
            .with_related(Arc::clone(&customer_rel), Arc::clone(&customer))
            .with_related(Arc::clone(&tags), Arc::clone(&tag)),
    );
    Shop {
        order,
        item,
        customer,
        product,
        tag,
        items,
        customer_rel,
        product_rel,
        tags,
    }
}

pub fn entity(value: Value) -> Entity {
    Entity::from_json(value).unwrap()
}

/// Own properties of a nested input object: everything but the named
/// relation keys, except that an explicit `null` relation is kept.
fn own_props(object: &Map<String, Value>, relations: &[&str]) -> Value {
    let mut props = Map::new();
    for (key, value) in object {
        if !relations.contains(&key.as_str()) || value.is_null() {
            props.insert(key.clone(), value.clone());
        }
    }
    Value::Object(props)
}

impl Shop {
    /// Builds a desired graph from nested order JSON (`customer`, `items`
    /// with optional `product`, `tags`).
    pub fn graph(&self, order: Value) -> (ModelGraph, NodeId) {
        let mut graph = ModelGraph::single();
        let root = self.add_order(&mut graph, order);
        (graph, root)
    }

    /// Builds a many-roots graph from an array of orders.
    pub fn graph_many(&self, orders: Vec<Value>) -> ModelGraph {
        let mut graph = ModelGraph::many();
        for order in orders {
            self.add_order(&mut graph, order);
        }
        graph
    }

    fn add_order(&self, graph: &mut ModelGraph, order: Value) -> NodeId {
        let object = order.as_object().cloned().unwrap_or_default();
        let root = graph.add_root(
            Arc::clone(&self.order),
            entity(own_props(&object, &["items", "customer", "tags"])),
        );
        if let Some(customer) = object.get("customer").filter(|c| c.is_object()) {
            graph
                .add_child(
                    root,
                    Arc::clone(&self.customer_rel),
                    Arc::clone(&self.customer),
                    entity(customer.clone()),
                )
                .unwrap();
        }
        for item in object
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
        {
            let item_object = item.as_object().cloned().unwrap_or_default();
            let child = graph
                .add_child(
                    root,
                    Arc::clone(&self.items),
                    Arc::clone(&self.item),
                    entity(own_props(&item_object, &["product"])),
                )
                .unwrap();
            if let Some(product) = item_object.get("product").filter(|p| p.is_object()) {
                graph
                    .add_child(
                        child,
                        Arc::clone(&self.product_rel),
                        Arc::clone(&self.product),
                        entity(product.clone()),
                    )
                    .unwrap();
            }
        }
        for tag in object
            .get("tags")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
        {
            graph
                .add_child(
                    root,
                    Arc::clone(&self.tags),
                    Arc::clone(&self.tag),
                    entity(tag),
                )
                .unwrap();
        }
        root
    }
}

pub fn ops(calls: &[StorageCall]) -> Vec<StorageOp> {
    calls.iter().map(StorageCall::op).collect()
}

/// Row counts of every insert call, in call order.
pub fn insert_sizes(calls: &[StorageCall], entity_type: &str) -> Vec<usize> {
    calls
        .iter()
        .filter_map(|call| match call {
            StorageCall::Insert {
                entity_type: name,
                rows,
            } if name == entity_type => Some(*rows),
            _ => None,
        })
        .collect()
}

pub fn id_of(graph: &ModelGraph, node: NodeId) -> Value {
    graph
        .node(node)
        .entity()
        .get("id")
        .cloned()
        .unwrap_or(json!(null))
}

/// The `nth` node of `entity_type` in arena order.
pub fn find_node(graph: &ModelGraph, entity_type: &str, nth: usize) -> NodeId {
    graph
        .node_ids()
        .filter(|&id| graph.node(id).entity_type().name == entity_type)
        .nth(nth)
        .unwrap()
}

/// Sorted column names of the `nth` update call.
pub fn update_columns(calls: &[StorageCall], nth: usize) -> Vec<String> {
    let mut columns = calls
        .iter()
        .filter_map(|call| match call {
            StorageCall::Update { columns, .. } => Some(columns.clone()),
            _ => None,
        })
        .nth(nth)
        .unwrap();
    columns.sort();
    columns
}
