//! The transaction pipeline's public vocabulary: entity references,
//! attribute/value pairs, the map-entity shorthand, and the primitive
//! operation forms a [`Transaction`] is made of. The actual resolution
//! and commit logic lives in [`transactor`].

pub mod functions;
pub mod transactor;

use std::cell::Cell;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use thiserror::Error;

use crate::datom::{Datom, Value};
use crate::schema::Schema;
use crate::storage::StorageError;

/// How an operation names the entity it targets.
#[derive(Debug, Clone)]
pub enum Entity {
    /// Allocate a fresh entity id.
    New,
    /// An existing (or not-yet-existing, for upsert purposes) entity id.
    Id(u64),
    /// A placeholder scoped to this transaction; every occurrence of the
    /// same tempid within one transaction resolves to the same entity.
    TempId(Rc<str>),
    /// Resolved at transact time to the unique entity currently holding
    /// `value` for `attribute` (which must be `:db/unique identity`).
    /// Fails the transaction if no such entity exists.
    LookupRef { attribute: Rc<str>, value: Value },
}

impl Entity {
    pub fn temp_id(name: impl Into<Rc<str>>) -> Self {
        Entity::TempId(name.into())
    }

    pub fn lookup_ref(attribute: impl Into<Rc<str>>, value: impl Into<Value>) -> Self {
        Entity::LookupRef {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    pub fn is_temp_id(&self) -> bool {
        matches!(self, Entity::TempId(_))
    }
}

#[derive(Debug, Clone)]
pub struct AttributeValue {
    pub attribute: Rc<str>,
    pub value: Value,
}

/// The map-entity shorthand: one entity plus a batch of attribute/value
/// assertions, exploded into primitive `Statement::Assert`s by the
/// transactor. An attribute name prefixed with `_` (e.g. `_parent`) is a
/// reverse reference: `{:_parent temp-id}` on entity E asserts
/// `(temp-id, parent, E)` instead of `(E, parent, temp-id)`.
#[derive(Debug, Clone)]
pub struct Operation {
    pub entity: Entity,
    pub attributes: Vec<AttributeValue>,
}

impl Operation {
    pub fn new(entity: Entity) -> Self {
        Operation {
            entity,
            attributes: Vec::new(),
        }
    }

    pub fn on_new() -> Self {
        Self::new(Entity::New)
    }

    pub fn on_id(entity_id: u64) -> Self {
        Self::new(Entity::Id(entity_id))
    }

    pub fn on_temp_id(temp_id: &str) -> Self {
        Self::new(Entity::temp_id(temp_id))
    }

    pub fn on_lookup_ref(attribute: &str, value: impl Into<Value>) -> Self {
        Self::new(Entity::lookup_ref(attribute, value))
    }

    pub fn set<V: Into<Value>>(mut self, attribute: &str, value: V) -> Self {
        self.set_mut(attribute, value);
        self
    }

    pub fn set_mut<V: Into<Value>>(&mut self, attribute: &str, value: V) {
        self.attributes.push(AttributeValue {
            attribute: Rc::from(attribute),
            value: value.into(),
        });
    }
}

/// One statement in a transaction: either the map-entity shorthand or a
/// primitive operation. `Transaction::with` accepts anything convertible
/// into a `Statement`, so callers mostly never name this type directly.
#[derive(Debug, Clone)]
pub enum Statement {
    Map(Operation),
    Assert {
        entity: Entity,
        attribute: Rc<str>,
        value: Value,
    },
    Retract {
        entity: Entity,
        attribute: Rc<str>,
        value: Value,
    },
    RetractAttribute {
        entity: Entity,
        attribute: Rc<str>,
    },
    RetractEntity {
        entity: Entity,
    },
    Cas {
        entity: Entity,
        attribute: Rc<str>,
        old: Value,
        new: Value,
    },
    CallFn {
        entity: Entity,
        name: Rc<str>,
        args: Vec<Value>,
    },
}

impl From<Operation> for Statement {
    fn from(operation: Operation) -> Self {
        Statement::Map(operation)
    }
}

impl Statement {
    pub fn assert(entity: Entity, attribute: &str, value: impl Into<Value>) -> Self {
        Statement::Assert {
            entity,
            attribute: Rc::from(attribute),
            value: value.into(),
        }
    }

    pub fn retract(entity: Entity, attribute: &str, value: impl Into<Value>) -> Self {
        Statement::Retract {
            entity,
            attribute: Rc::from(attribute),
            value: value.into(),
        }
    }

    pub fn retract_attribute(entity: Entity, attribute: &str) -> Self {
        Statement::RetractAttribute {
            entity,
            attribute: Rc::from(attribute),
        }
    }

    pub fn retract_entity(entity: Entity) -> Self {
        Statement::RetractEntity { entity }
    }

    pub fn cas(entity: Entity, attribute: &str, old: impl Into<Value>, new: impl Into<Value>) -> Self {
        Statement::Cas {
            entity,
            attribute: Rc::from(attribute),
            old: old.into(),
            new: new.into(),
        }
    }
}

#[derive(Default, Debug, Clone)]
pub struct Transaction {
    pub statements: Vec<Statement>,
    /// Opaque caller-supplied annotation, threaded through unchanged to
    /// the resulting [`TxReport`]. Not interpreted by the transactor.
    pub tx_meta: Option<Value>,
}

impl Transaction {
    pub fn new() -> Self {
        Transaction::default()
    }

    pub fn with(mut self, statement: impl Into<Statement>) -> Self {
        self.statements.push(statement.into());
        self
    }

    pub fn with_tx_meta(mut self, tx_meta: impl Into<Value>) -> Self {
        self.tx_meta = Some(tx_meta.into());
        self
    }
}

/// A cheap, immutable snapshot of a database's schema and id counters,
/// taken before and after a transaction so a [`TxReport`] can describe
/// what changed without re-reading storage.
#[derive(Debug, Clone)]
pub struct DbSnapshot {
    pub schema: Schema,
    pub next_eid: u64,
    pub next_tx: u64,
}

#[derive(Debug)]
pub struct TxReport {
    pub db_before: DbSnapshot,
    pub db_after: DbSnapshot,
    pub tx_id: u64,
    pub tx_data: Vec<Datom>,
    pub tempids: HashMap<Rc<str>, u64>,
    pub tx_meta: Option<Value>,
    cached_hash: Cell<Option<u64>>,
}

impl TxReport {
    pub fn new(tx_id: u64, db_before: DbSnapshot, tempids: HashMap<Rc<str>, u64>, tx_meta: Option<Value>) -> Self {
        TxReport {
            db_after: db_before.clone(),
            db_before,
            tx_id,
            tx_data: Vec::new(),
            tempids,
            tx_meta,
            cached_hash: Cell::new(None),
        }
    }

    /// Appends one datom to the report, invalidating any cached content
    /// hash — the cache is only ever trusted between here and the next
    /// mutation of `tx_data`.
    pub fn push_datom(&mut self, datom: Datom) {
        self.tx_data.push(datom);
        self.cached_hash.set(None);
    }

    /// A content hash of `tx_data`, memoized until the next `push_datom`.
    /// Lets callers compare or deduplicate reports cheaply without
    /// re-hashing `tx_data` on every call.
    pub fn tx_data_hash(&self) -> u64 {
        if let Some(hash) = self.cached_hash.get() {
            return hash;
        }
        let mut hasher = DefaultHasher::new();
        self.tx_data.hash(&mut hasher);
        let hash = hasher.finish();
        self.cached_hash.set(Some(hash));
        hash
    }
}

#[derive(Debug, Error)]
pub enum TransactError {
    #[error("attribute `{0}` is not in the schema")]
    UnknownAttribute(Rc<str>),
    #[error("duplicate tempid `{0}` within one transaction")]
    DuplicateTempId(Rc<str>),
    #[error("tempid `{0}` was never resolved")]
    UnresolvedTempId(Rc<str>),
    #[error("no entity found with `{attribute}` = {value:?}")]
    LookupRefNotFound { attribute: Rc<str>, value: Value },
    #[error("`{attribute}` is not a `:db/unique identity` attribute, cannot be used in a lookup-ref")]
    LookupRefNotUnique { attribute: Rc<str> },
    #[error("value {value:?} does not match the declared type of attribute `{attribute}`")]
    TypeMismatch { attribute: Rc<str>, value: Value },
    #[error("cardinality-one attribute `{attribute}` given more than one value in this transaction")]
    CardinalityConflict { attribute: Rc<str> },
    #[error(
        "compare-and-swap on `{attribute}` failed: expected {expected:?}, found {found:?}"
    )]
    CasFailed {
        attribute: Rc<str>,
        expected: Value,
        found: Value,
    },
    #[error("transaction function `{0}` is not registered")]
    UnknownFunction(Rc<str>),
    #[error("conflicting upsert: tempid `{0}` resolves to more than one existing entity")]
    ConflictingUpsert(Rc<str>),
    #[error("unique attribute `{attribute}` already has an entity asserting value {value:?}")]
    UniqueConflict { attribute: Rc<str>, value: Value },
    #[error(transparent)]
    Storage(#[from] StorageError),
}
