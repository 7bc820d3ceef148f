//! Schema: the mapping from attribute keyword to its declared value type,
//! cardinality, uniqueness and component-ness, plus the built-in
//! attributes every database carries before any user schema is
//! transacted.

pub mod attribute;
pub mod default;

use std::collections::HashMap;
use std::rc::Rc;

use thiserror::Error;

pub use attribute::{Attribute, Cardinality, Unique};

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("component attribute `{0}` must have value type `ref`")]
    ComponentNotRef(Rc<str>),
}

/// Identifier of the built-in `:db/ident` attribute: gives an entity a
/// keyword name other attributes/lookups can use instead of its raw id.
pub const DB_IDENT_ID: u64 = 1;
pub const DB_IDENT_IDENT: &str = "db/ident";

/// Identifier of the built-in `:db/fn` attribute: holds the name of a
/// registered transaction function (see [`crate::tx::functions`]).
pub const DB_FN_ID: u64 = 2;
pub const DB_FN_IDENT: &str = "db/fn";

/// `rschema`: the reverse index from a schema property to the set of
/// attribute ids that carry it. Rebuilt whenever the schema changes;
/// cheap because schemas are small relative to data.
#[derive(Debug, Default, Clone)]
pub struct ReverseSchema {
    pub unique_identity: Vec<u64>,
    pub unique_value: Vec<u64>,
    pub cardinality_many: Vec<u64>,
    pub refs: Vec<u64>,
    pub components: Vec<u64>,
}

impl ReverseSchema {
    pub fn build(attributes: &HashMap<u64, Attribute>) -> Self {
        let mut rschema = ReverseSchema::default();
        for attribute in attributes.values() {
            match attribute.unique {
                Some(Unique::Identity) => rschema.unique_identity.push(attribute.id),
                Some(Unique::Value) => rschema.unique_value.push(attribute.id),
                None => {}
            }
            if attribute.cardinality == Cardinality::Many {
                rschema.cardinality_many.push(attribute.id);
            }
            if attribute.value_type == crate::datom::ValueType::Ref {
                rschema.refs.push(attribute.id);
            }
            if attribute.is_component {
                rschema.components.push(attribute.id);
            }
        }
        rschema
    }
}

/// The schema known to a database snapshot: attribute keyword -> id,
/// id -> attribute definition, and the derived reverse index.
#[derive(Debug, Default, Clone)]
pub struct Schema {
    pub by_ident: HashMap<Rc<str>, u64>,
    pub by_id: HashMap<u64, Attribute>,
    pub rschema: ReverseSchema,
}

impl Schema {
    pub fn new() -> Self {
        let mut schema = Schema::default();
        for attribute in default::built_in_attributes() {
            schema.register(attribute);
        }
        schema
    }

    pub fn register(&mut self, attribute: Attribute) {
        self.by_ident
            .insert(Rc::clone(&attribute.ident), attribute.id);
        self.by_id.insert(attribute.id, attribute);
        self.rschema = ReverseSchema::build(&self.by_id);
    }

    pub fn attribute_by_id(&self, id: u64) -> Option<&Attribute> {
        self.by_id.get(&id)
    }

    pub fn attribute_by_ident(&self, ident: &str) -> Option<&Attribute> {
        self.by_ident.get(ident).and_then(|id| self.by_id.get(id))
    }

    pub fn is_unique(&self, attribute_id: u64) -> bool {
        self.rschema.unique_identity.contains(&attribute_id)
            || self.rschema.unique_value.contains(&attribute_id)
    }

    pub fn is_ref(&self, attribute_id: u64) -> bool {
        self.rschema.refs.contains(&attribute_id)
    }

    pub fn is_component(&self, attribute_id: u64) -> bool {
        self.rschema.components.contains(&attribute_id)
    }

    pub fn is_many(&self, attribute_id: u64) -> bool {
        self.rschema.cardinality_many.contains(&attribute_id)
    }
}
