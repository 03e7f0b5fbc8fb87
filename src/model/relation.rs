//! Entity type and relation metadata consumed by the reconciliation engine.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::entity::Entity;

/// Options passed to an entity validator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationContext {
    /// Position of the entity in the input, e.g. `[0].items[1]`.
    pub data_path: String,
    /// `true` when only the present properties are written.
    pub patch: bool,
}

/// Validation rules of an entity type.
pub trait EntityValidator: Send + Sync {
    fn validate(&self, entity: &Entity, ctx: &ValidationContext) -> Result<(), String>;
}

/// Relation-specific hook run on every child entity right before it is inserted.
pub trait RelationHook: Send + Sync {
    fn before_insert(&self, relation: &Relation, entity: &mut Entity) -> Result<(), String>;
}

/// Storage class of an entity.
#[derive(Clone)]
pub struct EntityType {
    pub name: String,
    pub id_props: Vec<String>,
    /// Client-side placeholder identifier removed before insert.
    pub uid_prop: String,
    /// Properties that hold related entities rather than columns.
    pub relation_names: Vec<String>,
    /// Relations declared with their related type via [`EntityType::with_related`].
    pub relations: Vec<RelationDef>,
    pub validator: Option<Arc<dyn EntityValidator>>,
}

impl EntityType {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            id_props: vec!["id".to_string()],
            uid_prop: "#id".to_string(),
            relation_names: Vec::new(),
            relations: Vec::new(),
            validator: None,
        }
    }

    pub fn with_id_props<I, S>(mut self, props: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.id_props = props.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_relation<S: Into<String>>(mut self, name: S) -> Self {
        self.relation_names.push(name.into());
        self
    }

    /// Declares `relation` together with the type it points at. Unlike
    /// [`EntityType::with_relation`], the current graph can then be loaded
    /// for the relation even when the desired graph sets it to `null`.
    pub fn with_related(mut self, relation: Arc<Relation>, related_type: Arc<EntityType>) -> Self {
        if !self.is_relation(&relation.name) {
            self.relation_names.push(relation.name.clone());
        }
        self.relations.push(RelationDef {
            relation,
            related_type,
        });
        self
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDef> {
        self.relations.iter().find(|def| def.relation.name == name)
    }

    pub fn with_validator(mut self, validator: Arc<dyn EntityValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn is_relation(&self, prop: &str) -> bool {
        self.relation_names.iter().any(|name| name == prop)
    }

    pub fn is_id_prop(&self, prop: &str) -> bool {
        self.id_props.iter().any(|id| id == prop)
    }

    pub fn validate(&self, entity: &Entity, ctx: &ValidationContext) -> Result<(), String> {
        match &self.validator {
            Some(validator) => validator.validate(entity, ctx),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityType")
            .field("name", &self.name)
            .field("id_props", &self.id_props)
            .field("relation_names", &self.relation_names)
            .finish_non_exhaustive()
    }
}

/// A relation of an entity type and the type on its related side.
#[derive(Clone, Debug)]
pub struct RelationDef {
    pub relation: Arc<Relation>,
    pub related_type: Arc<EntityType>,
}

/// Ordered list of properties forming one side of a relation key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PropertyList {
    props: Vec<String>,
}

impl PropertyList {
    pub fn new<I, S>(props: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            props: props.into_iter().map(Into::into).collect(),
        }
    }

    pub fn size(&self) -> usize {
        self.props.len()
    }

    pub fn props(&self) -> &[String] {
        &self.props
    }

    pub fn prop(&self, index: usize) -> &str {
        &self.props[index]
    }

    pub fn get_prop<'e>(&self, entity: &'e Entity, index: usize) -> Option<&'e Value> {
        entity.get(&self.props[index])
    }

    pub fn set_prop(&self, entity: &mut Entity, index: usize, value: Value) {
        entity.set(&self.props[index], value);
    }

    /// `true` when every property is present with a non-null value.
    pub fn is_complete(&self, entity: &Entity) -> bool {
        self.props
            .iter()
            .all(|prop| !matches!(entity.get(prop), None | Some(Value::Null)))
    }
}

/// Many-to-many join table layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinTable {
    pub table: String,
    /// Join columns matching the owner properties, position by position.
    pub owner_columns: Vec<String>,
    /// Join columns matching the related properties, position by position.
    pub related_columns: Vec<String>,
    /// Extra join columns whose values are carried on the related entity.
    pub extras: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelationKind {
    /// Related rows hold the foreign key.
    HasMany,
    /// The owner row holds the foreign key.
    BelongsToOne,
    ManyToMany(JoinTable),
}

/// A declared association between an owner type and a related type.
#[derive(Clone)]
pub struct Relation {
    pub name: String,
    pub kind: RelationKind,
    pub owner_type: String,
    pub related_type: String,
    pub owner_props: PropertyList,
    pub related_props: PropertyList,
    pub hook: Option<Arc<dyn RelationHook>>,
}

impl Relation {
    fn with_kind(
        name: &str,
        kind: RelationKind,
        owner_type: &str,
        related_type: &str,
        owner_props: PropertyList,
        related_props: PropertyList,
    ) -> Self {
        Self {
            name: name.to_string(),
            kind,
            owner_type: owner_type.to_string(),
            related_type: related_type.to_string(),
            owner_props,
            related_props,
            hook: None,
        }
    }

    /// `owner.<owner_props> = related.<related_props>`, the related rows
    /// holding the foreign key.
    pub fn has_many(
        name: &str,
        owner_type: &str,
        related_type: &str,
        owner_props: PropertyList,
        related_props: PropertyList,
    ) -> Self {
        Self::with_kind(
            name,
            RelationKind::HasMany,
            owner_type,
            related_type,
            owner_props,
            related_props,
        )
    }

    pub fn belongs_to_one(
        name: &str,
        owner_type: &str,
        related_type: &str,
        owner_props: PropertyList,
        related_props: PropertyList,
    ) -> Self {
        Self::with_kind(
            name,
            RelationKind::BelongsToOne,
            owner_type,
            related_type,
            owner_props,
            related_props,
        )
    }

    pub fn many_to_many(
        name: &str,
        owner_type: &str,
        related_type: &str,
        owner_props: PropertyList,
        related_props: PropertyList,
        join: JoinTable,
    ) -> Self {
        Self::with_kind(
            name,
            RelationKind::ManyToMany(join),
            owner_type,
            related_type,
            owner_props,
            related_props,
        )
    }

    pub fn with_hook(mut self, hook: Arc<dyn RelationHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn is_has_many(&self) -> bool {
        matches!(self.kind, RelationKind::HasMany)
    }

    pub fn is_belongs_to_one(&self) -> bool {
        matches!(self.kind, RelationKind::BelongsToOne)
    }

    pub fn join_table(&self) -> Option<&JoinTable> {
        match &self.kind {
            RelationKind::ManyToMany(join) => Some(join),
            _ => None,
        }
    }

    pub fn join_table_extras(&self) -> &[String] {
        match self.join_table() {
            Some(join) => &join.extras,
            None => &[],
        }
    }

    /// Keeps the join-table extras on the entity but out of its row payload.
    pub fn omit_extra_props(&self, entity: &mut Entity) {
        entity.omit_for_write(self.join_table_extras().iter().cloned());
    }

    /// Whether `entity` carries enough key data to be related by id.
    pub fn has_relate_prop(&self, entity: &Entity, related_type: &EntityType) -> bool {
        match self.kind {
            RelationKind::BelongsToOne => self.related_props.is_complete(entity),
            RelationKind::HasMany | RelationKind::ManyToMany(_) => {
                entity.has_id(&related_type.id_props)
            }
        }
    }

    pub fn before_insert(&self, entity: &mut Entity) -> Result<(), String> {
        match &self.hook {
            Some(hook) => hook.before_insert(self, entity),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relation")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("owner_type", &self.owner_type)
            .field("related_type", &self.related_type)
            .field("owner_props", &self.owner_props)
            .field("related_props", &self.related_props)
            .finish_non_exhaustive()
    }
}
