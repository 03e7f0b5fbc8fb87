//! Entity objects: the property bags carried by graph nodes.

use ahash::AHashSet;
use serde_json::{Map, Value};

use crate::errors::UpsertGraphError;

use super::value::{IdKey, get_path, set_path};

/// Prefix of columns that only exist while a query runs and must never be
/// copied between graphs.
pub const TEMP_COLUMN_PREFIX: &str = "upsertgraph_tmp_";

/// Properties starting with `$` or `#` are bookkeeping, never persisted.
pub fn is_internal_prop(name: &str) -> bool {
    name.starts_with('$') || name.starts_with('#')
}

pub fn is_temp_column(name: &str) -> bool {
    name.starts_with(TEMP_COLUMN_PREFIX)
}

/// A single entity instance.
///
/// Holds plain properties, query-time properties (values computed by the
/// storage whose effect cannot be known up front) and the properties that
/// must be left out of the database payload. Marks set by the caller survive
/// a reconciliation; marks set while building a write are reset per write.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Entity {
    props: Map<String, Value>,
    query_props: Map<String, Value>,
    omitted: AHashSet<String>,
    write_omitted: AHashSet<String>,
}

impl Entity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_props(props: Map<String, Value>) -> Self {
        Self {
            props,
            ..Self::default()
        }
    }

    /// Builds an entity from a JSON object.
    pub fn from_json(value: Value) -> Result<Self, UpsertGraphError> {
        match value {
            Value::Object(props) => Ok(Self::from_props(props)),
            other => Err(UpsertGraphError::configuration(format!(
                "entity must be a JSON object, got {other}"
            ))),
        }
    }

    pub fn props(&self) -> &Map<String, Value> {
        &self.props
    }

    pub fn props_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.props
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.props.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.props.contains_key(name)
    }

    pub fn set<V: Into<Value>>(&mut self, name: &str, value: V) {
        self.props.insert(name.to_string(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.props.remove(name)
    }

    pub fn get_path(&self, path: &[String]) -> Option<&Value> {
        get_path(&self.props, path)
    }

    pub fn set_path(&mut self, path: &[String], value: Value) -> bool {
        set_path(&mut self.props, path, value)
    }

    pub fn query_props(&self) -> &Map<String, Value> {
        &self.query_props
    }

    pub fn set_query_prop<V: Into<Value>>(&mut self, name: &str, expression: V) {
        self.query_props.insert(name.to_string(), expression.into());
    }

    /// Identifier of this entity when every identifier property is present
    /// and non-null.
    pub fn id_key(&self, id_props: &[String]) -> Option<IdKey> {
        IdKey::from_row(&self.props, id_props)
    }

    pub fn has_id(&self, id_props: &[String]) -> bool {
        self.id_key(id_props).is_some()
    }

    /// Marks properties to be left out of the database payload. The values
    /// stay readable on the entity.
    pub fn omit_from_database<I, S>(&mut self, props: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.omitted.extend(props.into_iter().map(Into::into));
    }

    /// Whether the caller marked `name` with [`Entity::omit_from_database`].
    pub fn is_omitted(&self, name: &str) -> bool {
        self.omitted.contains(name)
    }

    pub(crate) fn omit_for_write<I, S>(&mut self, props: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.write_omitted.extend(props.into_iter().map(Into::into));
    }

    pub(crate) fn reset_write_omitted(&mut self) {
        self.write_omitted.clear();
    }

    /// The row written to storage: plain and query-time properties minus
    /// bookkeeping, relation-valued and omitted properties.
    pub fn database_json(&self, relation_names: &[String]) -> Map<String, Value> {
        let keep = |name: &String| {
            !is_internal_prop(name)
                && !self.omitted.contains(name)
                && !self.write_omitted.contains(name)
                && !relation_names.iter().any(|rel| rel == name)
        };
        let mut row = Map::new();
        for (name, value) in self.props.iter().filter(|(name, _)| keep(name)) {
            row.insert(name.clone(), value.clone());
        }
        for (name, value) in self.query_props.iter().filter(|(name, _)| keep(name)) {
            row.insert(name.clone(), value.clone());
        }
        row
    }

    /// Merges values produced by storage (generated keys, defaults).
    pub fn merge(&mut self, generated: Map<String, Value>) {
        for (name, value) in generated {
            self.props.insert(name, value);
        }
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.props.clone())
    }
}

impl From<Map<String, Value>> for Entity {
    fn from(props: Map<String, Value>) -> Self {
        Self::from_props(props)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(value: Value) -> Entity {
        Entity::from_json(value).unwrap()
    }

    #[test]
    fn test_id_key_requires_every_identifier_prop() {
        let ids = vec!["a".to_string(), "b".to_string()];
        assert!(entity(json!({"a": 1})).id_key(&ids).is_none());
        assert!(entity(json!({"a": 1, "b": null})).id_key(&ids).is_none());
        assert_eq!(
            entity(json!({"a": 1, "b": 2})).id_key(&ids),
            Some(IdKey::new(vec![json!(1), json!(2)]))
        );
    }

    #[test]
    fn test_database_json_skips_internal_relations_and_omitted() {
        let mut e = entity(json!({
            "id": 1,
            "name": "n",
            "#id": "tmp",
            "items": [],
            "extra": true
        }));
        e.omit_from_database(["extra"]);
        e.set_query_prop("rank", json!({"raw": "rank + 1"}));
        let row = e.database_json(&["items".to_string()]);
        assert_eq!(
            Value::Object(row),
            json!({"id": 1, "name": "n", "rank": {"raw": "rank + 1"}})
        );
        assert_eq!(e.get("extra"), Some(&json!(true)));
    }

    #[test]
    fn test_resetting_write_marks_keeps_caller_marks() {
        let mut e = entity(json!({"id": 1, "secret": "s", "position": 2}));
        e.omit_from_database(["secret"]);
        e.omit_for_write(["position"]);
        assert_eq!(Value::Object(e.database_json(&[])), json!({"id": 1}));

        e.reset_write_omitted();
        assert!(e.is_omitted("secret"));
        assert_eq!(
            Value::Object(e.database_json(&[])),
            json!({"id": 1, "position": 2})
        );
    }

    #[test]
    fn test_from_json_rejects_non_objects() {
        assert!(Entity::from_json(json!([1])).is_err());
    }
}
