//! The `Attribute` record: what a schema remembers about one attribute
//! keyword, independent of any value ever asserted against it.

use std::rc::Rc;

use crate::datom::ValueType;

/// Cardinality of an attribute: whether an entity may hold at most one
/// value (`One`, the default) or a set of values (`Many`) for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    One,
    Many,
}

/// Uniqueness constraint on an attribute's values.
///
/// `Identity` additionally makes the attribute eligible for upsert: a
/// `:db/add` naming a tempid and this attribute resolves to the
/// existing entity that already carries the given value, if any.
/// `Value` enforces uniqueness without upsert semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unique {
    Identity,
    Value,
}

/// One schema entry: everything known about an attribute keyword.
#[derive(Debug, Clone)]
pub struct Attribute {
    /// Entity id this attribute is itself registered under.
    pub id: u64,
    pub ident: Rc<str>,
    pub value_type: ValueType,
    pub cardinality: Cardinality,
    pub doc: Option<Rc<str>>,
    pub unique: Option<Unique>,
    pub is_component: bool,
}

impl Attribute {
    pub fn new(id: u64, ident: impl Into<Rc<str>>, value_type: ValueType) -> Self {
        Attribute {
            id,
            ident: ident.into(),
            value_type,
            cardinality: Cardinality::One,
            doc: None,
            unique: None,
            is_component: false,
        }
    }

    pub fn with_doc(mut self, doc: impl Into<Rc<str>>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    pub fn many(mut self) -> Self {
        self.cardinality = Cardinality::Many;
        self
    }

    pub fn unique_identity(mut self) -> Self {
        self.unique = Some(Unique::Identity);
        self
    }

    pub fn unique_value(mut self) -> Self {
        self.unique = Some(Unique::Value);
        self
    }

    pub fn component(mut self) -> Self {
        self.is_component = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_to_cardinality_one_and_no_uniqueness() {
        let attribute = Attribute::new(100, "person/name", ValueType::Str);
        assert_eq!(Cardinality::One, attribute.cardinality);
        assert_eq!(None, attribute.unique);
        assert!(!attribute.is_component);
    }

    #[test]
    fn builder_methods_compose() {
        let attribute = Attribute::new(100, "person/aliases", ValueType::Str)
            .many()
            .with_doc("other names this person goes by");
        assert_eq!(Cardinality::Many, attribute.cardinality);
        assert_eq!(Some("other names this person goes by"), attribute.doc.as_deref());
    }
}
