//! Entity resolution: turning an "entity identifier" — a raw id, an
//! attribute/value lookup-ref, or (at the API boundary) a `:db/ident`
//! keyword — into the concrete `u64` entity id the storage layer deals
//! in. Three entry points:
//!
//! - [`entid`] resolves and returns `None` if nothing matches;
//! - [`entid_strict`] is the same but turns a missing/malformed
//!   identifier into an error callers are expected to handle;
//! - [`entid_some`] is `entid_strict` lifted through an `Option`: useful
//!   where the identifier itself may simply be absent (as opposed to
//!   present but unresolvable), so a caller doesn't have to invent a
//!   placeholder `EntityId` just to get a `None` back out.

use std::rc::Rc;

use thiserror::Error;

use crate::datom::{Index, Value};
use crate::db::Db;
use crate::schema::attribute::Unique;

/// An entity identifier as accepted at the public API boundary.
#[derive(Debug, Clone)]
pub enum EntityId {
    Id(u64),
    Ident(Rc<str>),
    LookupRef { attribute: Rc<str>, value: Value },
}

impl From<u64> for EntityId {
    fn from(id: u64) -> Self {
        EntityId::Id(id)
    }
}

#[derive(Debug, Error)]
pub enum EntityIdError {
    #[error("`{0}` is not a known `:db/ident`")]
    Missing(Rc<str>),
    #[error("no entity found with `{attribute}` = {value:?}")]
    LookupRefNotFound { attribute: Rc<str>, value: Value },
    #[error("`{attribute}` is not a `:db/unique identity` attribute, cannot be used in a lookup-ref")]
    LookupRefNotUnique { attribute: Rc<str> },
    #[error("`{0}` is not registered as an attribute")]
    LookupRefUnknownAttribute(Rc<str>),
}

/// Resolves `ident` to an entity id, or `None` if it does not (yet, or
/// ever) name one.
pub fn entid(db: &Db, ident: &EntityId) -> Option<u64> {
    match ident {
        EntityId::Id(id) => Some(*id),
        EntityId::Ident(name) => db.schema.attribute_by_ident(name).map(|a| a.id),
        EntityId::LookupRef { attribute, value } => {
            let attr = db.schema.attribute_by_ident(attribute)?;
            if attr.unique != Some(Unique::Identity) {
                return None;
            }
            db.storage
                .slice(Index::Avet, None, Some(attr.id), Some(value))
                .ok()?
                .into_iter()
                .next()
                .map(|d| d.entity)
        }
    }
}

/// Same as [`entid`], but a failed resolution is an error describing
/// *why* — syntactically invalid lookup-ref, unknown attribute, missing
/// ident — rather than a bare `None`.
pub fn entid_strict(db: &Db, ident: &EntityId) -> Result<u64, EntityIdError> {
    match ident {
        EntityId::Id(id) => Ok(*id),
        EntityId::Ident(name) => db
            .schema
            .attribute_by_ident(name)
            .map(|a| a.id)
            .ok_or_else(|| EntityIdError::Missing(Rc::clone(name))),
        EntityId::LookupRef { attribute, value } => {
            let attr = db
                .schema
                .attribute_by_ident(attribute)
                .ok_or_else(|| EntityIdError::LookupRefUnknownAttribute(Rc::clone(attribute)))?;
            if attr.unique != Some(Unique::Identity) {
                return Err(EntityIdError::LookupRefNotUnique {
                    attribute: Rc::clone(attribute),
                });
            }
            db.storage
                .slice(Index::Avet, None, Some(attr.id), Some(value))
                .map_err(|_| EntityIdError::LookupRefNotFound {
                    attribute: Rc::clone(attribute),
                    value: value.clone(),
                })?
                .into_iter()
                .next()
                .map(|d| d.entity)
                .ok_or_else(|| EntityIdError::LookupRefNotFound {
                    attribute: Rc::clone(attribute),
                    value: value.clone(),
                })
        }
    }
}

/// `entid_strict` lifted through `Option`: `None` in, `None` out;
/// `Some(ident)` in, `Some(entid_strict(db, ident))` out.
pub fn entid_some(db: &Db, ident: Option<&EntityId>) -> Option<Result<u64, EntityIdError>> {
    ident.map(|ident| entid_strict(db, ident))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use tempdir::TempDir;

    #[test]
    fn entid_some_passes_none_through_and_lifts_strict_resolution_otherwise() {
        let dir = TempDir::new("triplestore-entid-some").unwrap();
        let db = Db::empty_db(dir.path()).unwrap();

        assert!(entid_some(&db, None).is_none());

        let ident = EntityId::Ident(Rc::from("db/ident"));
        assert!(matches!(entid_some(&db, Some(&ident)), Some(Ok(1))));

        let missing = EntityId::Ident(Rc::from("no/such-attribute"));
        assert!(matches!(entid_some(&db, Some(&missing)), Some(Err(EntityIdError::Missing(_)))));
    }
}
