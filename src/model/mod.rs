mod entity;
mod relation;
mod value;

pub use entity::{Entity, TEMP_COLUMN_PREFIX, is_internal_prop, is_temp_column};
pub use relation::{
    EntityType, EntityValidator, JoinTable, PropertyList, Relation, RelationDef, RelationHook,
    RelationKind, ValidationContext,
};
pub use value::{IdKey, get_path, loosely_equal, parse_path, set_path, value_to_text};
