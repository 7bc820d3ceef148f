//! The built-in attributes every database carries before any user
//! schema is transacted: `:db/ident` and `:db/fn`.

use crate::datom::ValueType;
use crate::schema::attribute::Attribute;
use crate::schema::{DB_FN_ID, DB_FN_IDENT, DB_IDENT_ID, DB_IDENT_IDENT};

pub fn built_in_attributes() -> Vec<Attribute> {
    vec![
        Attribute::new(DB_IDENT_ID, DB_IDENT_IDENT, ValueType::Keyword)
            .unique_identity()
            .with_doc("Keyword name of an entity, usable in place of its raw id"),
        Attribute::new(DB_FN_ID, DB_FN_IDENT, ValueType::Keyword)
            .with_doc("Name of a registered transaction function this entity invokes"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_attributes_cover_ident_and_fn() {
        let idents: Vec<_> = built_in_attributes()
            .into_iter()
            .map(|a| a.ident.to_string())
            .collect();
        assert!(idents.contains(&DB_IDENT_IDENT.to_string()));
        assert!(idents.contains(&DB_FN_IDENT.to_string()));
    }
}
