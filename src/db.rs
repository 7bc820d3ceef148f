//! The public entry point: `Db` owns one durable storage directory and
//! exposes the operations a durable triple-store core needs — opening a database,
//! transacting, and reading datoms back out through the four indexes.

use std::path::Path;
use std::rc::Rc;

use thiserror::Error;

use crate::clock::{Clock, SystemClock};
use crate::datom::{Datom, Index, Value, ValueType};
use crate::entity::{entid_strict, EntityId, EntityIdError};
use crate::schema::attribute::Attribute;
use crate::schema::{Schema, SchemaError};
use crate::storage::{Storage, StorageError};
use crate::tx::functions::TxFunctions;
use crate::tx::{transactor, DbSnapshot, Transaction, TransactError, TxReport};

/// First entity id available for user data and user-defined attributes.
/// Ids below this are reserved for the implicit schema (`:db/ident`,
/// `:db/fn`) and the handful of attributes this crate itself registers
/// during initialization (`:db/txInstant`).
const INITIAL_EID: u64 = 100;

pub const DB_TX_INSTANT_IDENT: &str = "db/txInstant";

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Transact(#[from] TransactError),
    #[error(transparent)]
    EntityId(#[from] EntityIdError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// One open, durable database. Not `Sync`/`Send`-shared across threads:
/// This crate's concurrency model is single-writer, and reads go through
/// `heed`'s own pooled read transactions rather than through `&Db`
/// being handed to multiple threads directly.
pub struct Db<C: Clock = SystemClock> {
    pub(crate) storage: Storage,
    pub(crate) schema: Schema,
    pub(crate) next_eid: u64,
    pub(crate) next_tx: u64,
    pub(crate) functions: TxFunctions,
    clock: C,
}

impl Db<SystemClock> {
    /// Opens `dir`, recovering schema and counters from any data already
    /// there, or initializing a fresh database if it is empty/absent.
    pub fn init_db(dir: impl AsRef<Path>) -> Result<Self, DbError> {
        Self::init_db_with_clock(dir, SystemClock)
    }

    /// Discards whatever is at `dir` and opens a fresh, empty database.
    /// Mainly useful for tests and examples that want a clean slate.
    pub fn empty_db(dir: impl AsRef<Path>) -> Result<Self, DbError> {
        let dir = dir.as_ref();
        if dir.exists() {
            std::fs::remove_dir_all(dir)
                .map_err(|e| StorageError::Engine(crate::storage::engine::EngineError::Mdb(heed::Error::Io(e))))?;
        }
        Self::init_db(dir)
    }
}

impl<C: Clock> Db<C> {
    pub fn init_db_with_clock(dir: impl AsRef<Path>, clock: C) -> Result<Self, DbError> {
        let path = dir.as_ref();
        let mut storage = Storage::open(path)?;
        let mut schema = storage.schema()?;
        let max_eid = storage.max_eid()?;
        let next_eid = if max_eid == 0 { INITIAL_EID } else { max_eid + 1 };
        let next_tx = storage.max_tx()?;

        let mut next_eid = next_eid;
        if schema.attribute_by_ident(DB_TX_INSTANT_IDENT).is_none() {
            let attribute = Attribute::new(next_eid, DB_TX_INSTANT_IDENT, ValueType::Instant)
                .with_doc("Wall-clock time this transaction was committed");
            next_eid += 1;
            storage.save_attribute(&attribute)?;
            schema.register(attribute);
        }

        log::debug!("opened database at {path:?} (next_eid={next_eid}, next_tx={next_tx})");
        Ok(Db {
            storage,
            schema,
            next_eid,
            next_tx,
            functions: TxFunctions::default(),
            clock,
        })
    }

    /// Applies `transaction`, persisting the resulting datoms (plus the
    /// transaction's own `:db/txInstant` datom) in one write.
    pub fn transact(&mut self, transaction: Transaction) -> Result<TxReport, DbError> {
        log::debug!("transacting {} statement(s)", transaction.statements.len());
        let tx = self.next_tx;
        let tx_meta = transaction.tx_meta.clone();
        let db_before = self.snapshot();
        let result = transactor::transact(self, transaction)?;

        let mut report = TxReport::new(tx, db_before, result.tempids, tx_meta);
        for datom in result.tx_data {
            report.push_datom(datom);
        }

        let tx_instant_attr = self
            .schema
            .attribute_by_ident(DB_TX_INSTANT_IDENT)
            .expect("db/txInstant is registered during init_db")
            .id;
        report.push_datom(Datom::add(tx, tx_instant_attr, Value::Instant(self.clock.now_millis()), tx));

        self.storage.save(&report.tx_data, result.next_eid, tx + 1, &self.schema)?;
        self.next_eid = result.next_eid;
        self.next_tx = tx + 1;
        report.db_after = self.snapshot();

        log::debug!("committed transaction {tx} ({} datoms)", report.tx_data.len());
        Ok(report)
    }

    fn snapshot(&self) -> DbSnapshot {
        DbSnapshot {
            schema: self.schema.clone(),
            next_eid: self.next_eid,
            next_tx: self.next_tx,
        }
    }

    /// Registers a brand-new attribute, assigning it the next available
    /// entity id. Attribute definitions are themselves entities, sharing
    /// the same id space as user data.
    pub fn add_attribute(&mut self, mut attribute: Attribute) -> Result<u64, DbError> {
        if attribute.is_component && attribute.value_type != ValueType::Ref {
            return Err(SchemaError::ComponentNotRef(Rc::clone(&attribute.ident)).into());
        }
        attribute.id = self.next_eid;
        self.next_eid += 1;
        self.storage.save_attribute(&attribute)?;
        let id = attribute.id;
        self.schema.register(attribute);
        log::debug!("registered attribute {id}");
        Ok(id)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Resolves an entity identifier (raw id, `:db/ident`, or
    /// lookup-ref) to its concrete entity id.
    pub fn entid(&self, ident: impl Into<EntityId>) -> Result<u64, DbError> {
        Ok(entid_strict(self, &ident.into())?)
    }

    /// Ascending scan of `index`, restricted to whichever of (entity,
    /// attribute, value) are given.
    pub fn datoms(
        &self,
        index: Index,
        entity: Option<u64>,
        attribute: Option<u64>,
        value: Option<&Value>,
    ) -> Result<Vec<Datom>, DbError> {
        Ok(self.storage.slice(index, entity, attribute, value)?)
    }

    /// Forward scan starting at the smallest key ≥ the given components,
    /// continuing to the index's end — unlike [`Db::datoms`], not bounded
    /// back down once the given components are exhausted.
    pub fn seek_datoms(
        &self,
        index: Index,
        entity: Option<u64>,
        attribute: Option<u64>,
        value: Option<&Value>,
    ) -> Result<Vec<Datom>, DbError> {
        Ok(self.storage.seek(index, entity, attribute, value)?)
    }

    /// Reverse scan starting at the largest key ≤ the given components,
    /// continuing down to the index's beginning.
    pub fn rseek_datoms(
        &self,
        index: Index,
        entity: Option<u64>,
        attribute: Option<u64>,
        value: Option<&Value>,
    ) -> Result<Vec<Datom>, DbError> {
        Ok(self.storage.rseek(index, entity, attribute, value)?)
    }

    /// All live datoms for `attribute` whose value lies in `[start,
    /// end)`, ascending. `attribute` is resolved by ident first.
    pub fn index_range(
        &self,
        attribute: &str,
        start: Option<&Value>,
        end: Option<&Value>,
    ) -> Result<Vec<Datom>, DbError> {
        let attribute_id = self
            .schema
            .attribute_by_ident(attribute)
            .ok_or_else(|| TransactError::UnknownAttribute(Rc::from(attribute)))?
            .id;
        Ok(self.storage.index_range(attribute_id, start, end)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::attribute::Cardinality;
    use crate::tx::Operation;
    use tempdir::TempDir;

    fn open_test_db() -> (TempDir, Db) {
        let dir = TempDir::new("triplestore-db-test").unwrap();
        let db = Db::empty_db(dir.path()).unwrap();
        (dir, db)
    }

    #[test]
    fn empty_db_registers_implicit_and_tx_instant_attributes() {
        let (_dir, db) = open_test_db();
        assert!(db.schema.attribute_by_ident("db/ident").is_some());
        assert!(db.schema.attribute_by_ident("db/fn").is_some());
        assert!(db.schema.attribute_by_ident(DB_TX_INSTANT_IDENT).is_some());
    }

    #[test]
    fn transact_simple_add_round_trips() {
        let (_dir, mut db) = open_test_db();
        db.add_attribute(Attribute::new(0, "person/name", ValueType::Str))
            .unwrap();

        let report = db
            .transact(Transaction::new().with(Operation::on_new().set("person/name", "Joe")))
            .unwrap();
        assert_eq!(2, report.tx_data.len()); // the assert + the txInstant datom

        let attr_id = db.schema.attribute_by_ident("person/name").unwrap().id;
        let datoms = db.datoms(Index::Aevt, None, Some(attr_id), None).unwrap();
        assert_eq!(1, datoms.len());
        assert_eq!(Value::str("Joe"), datoms[0].value);
    }

    #[test]
    fn cardinality_many_keeps_every_value() {
        let (_dir, mut db) = open_test_db();
        db.add_attribute(
            Attribute::new(0, "person/alias", ValueType::Str).many(),
        )
        .unwrap();

        db.transact(
            Transaction::new().with(
                Operation::on_temp_id("joe")
                    .set("person/alias", "Joey")
                    .set("person/alias", "Joseph"),
            ),
        )
        .unwrap();

        let attr_id = db.schema.attribute_by_ident("person/alias").unwrap().id;
        let datoms = db.datoms(Index::Aevt, None, Some(attr_id), None).unwrap();
        assert_eq!(2, datoms.len());
    }

    #[test]
    fn asserting_a_unique_value_already_held_by_another_entity_is_rejected() {
        let (_dir, mut db) = open_test_db();
        db.add_attribute(Attribute::new(0, "person/email", ValueType::Str).unique_value())
            .unwrap();

        db.transact(Transaction::new().with(Operation::on_new().set("person/email", "joe@example.com")))
            .unwrap();

        let result = db.transact(
            Transaction::new().with(Operation::on_new().set("person/email", "joe@example.com")),
        );
        assert!(result.is_err());
    }

    #[test]
    fn on_new_with_multiple_attributes_creates_a_single_entity() {
        let (_dir, mut db) = open_test_db();
        db.add_attribute(Attribute::new(0, "person/name", ValueType::Str))
            .unwrap();
        db.add_attribute(Attribute::new(0, "person/age", ValueType::Long))
            .unwrap();

        let report = db
            .transact(
                Transaction::new().with(Operation::on_new().set("person/name", "A").set("person/age", 20i64)),
            )
            .unwrap();

        let name_attr = db.schema.attribute_by_ident("person/name").unwrap().id;
        let age_attr = db.schema.attribute_by_ident("person/age").unwrap().id;
        let name_datom = report.tx_data.iter().find(|d| d.attribute == name_attr).unwrap();
        let age_datom = report.tx_data.iter().find(|d| d.attribute == age_attr).unwrap();
        assert_eq!(
            name_datom.entity, age_datom.entity,
            "both attributes of one on_new() map must land on the same entity"
        );
    }

    #[test]
    fn on_new_upserts_onto_an_existing_entity_via_unique_identity_attribute() {
        let (_dir, mut db) = open_test_db();
        db.add_attribute(Attribute::new(0, "person/name", ValueType::Str).unique_identity())
            .unwrap();
        db.add_attribute(Attribute::new(0, "person/age", ValueType::Long))
            .unwrap();

        let first = db
            .transact(Transaction::new().with(Operation::on_new().set("person/name", "A")))
            .unwrap();
        let existing_id = first
            .tx_data
            .iter()
            .find(|d| d.attribute == db.schema.attribute_by_ident("person/name").unwrap().id)
            .unwrap()
            .entity;

        // No tempid anywhere in this map — the upsert has to be found
        // purely through the unique-identity attribute.
        let second = db
            .transact(
                Transaction::new().with(Operation::on_new().set("person/name", "A").set("person/age", 20i64)),
            )
            .unwrap();

        let age_attr = db.schema.attribute_by_ident("person/age").unwrap().id;
        let age_datom = second.tx_data.iter().find(|d| d.attribute == age_attr).unwrap();
        assert_eq!(existing_id, age_datom.entity, "on_new() must upsert onto the existing entity");
    }

    #[test]
    fn retract_attribute_cascades_through_a_component_value() {
        let (_dir, mut db) = open_test_db();
        db.add_attribute(Attribute::new(0, "order/line-item", ValueType::Ref).component())
            .unwrap();
        db.add_attribute(Attribute::new(0, "line-item/sku", ValueType::Str))
            .unwrap();

        let report = db
            .transact(
                Transaction::new()
                    .with(Operation::on_temp_id("item").set("line-item/sku", "ABC-1")),
            )
            .unwrap();
        let item_id = *report.tempids.get("item").unwrap();

        let report = db
            .transact(
                Transaction::new()
                    .with(Operation::on_temp_id("order").set("order/line-item", item_id)),
            )
            .unwrap();
        let order_id = *report.tempids.get("order").unwrap();

        db.transact(Transaction::new().with(crate::tx::Statement::retract_attribute(
            crate::tx::Entity::Id(order_id),
            "order/line-item",
        )))
        .unwrap();

        let sku_attr = db.schema.attribute_by_ident("line-item/sku").unwrap().id;
        let remaining = db.datoms(Index::Eavt, Some(item_id), Some(sku_attr), None).unwrap();
        assert!(remaining.is_empty());
    }
}
