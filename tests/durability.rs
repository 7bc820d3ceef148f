//! End-to-end tests against the real `heed`-backed storage directory
//! (no in-process shortcuts), covering durability across reopen and the
//! index-scan scenarios.

use tempdir::TempDir;

use triplestore::datom::{Index, Value, ValueType};
use triplestore::db::Db;
use triplestore::schema::attribute::Attribute;
use triplestore::tx::{Entity, Operation, Statement, Transaction};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn schema_and_data_survive_reopen() {
    init_logging();
    let dir = TempDir::new("triplestore-durability").unwrap();

    let joe_id = {
        let mut db = Db::init_db(dir.path()).unwrap();
        db.add_attribute(Attribute::new(0, "person/name", ValueType::Str).unique_identity())
            .unwrap();
        let report = db
            .transact(Transaction::new().with(Operation::on_temp_id("joe").set("person/name", "Joe")))
            .unwrap();
        *report.tempids.get("joe").unwrap()
    };

    // Reopen the same directory in a fresh `Db` — simulates a process
    // restart. The attribute registry and data must both come back.
    let db = Db::init_db(dir.path()).unwrap();
    let attr = db.schema().attribute_by_ident("person/name").unwrap();
    assert!(attr.unique.is_some());

    let datoms = db
        .datoms(Index::Eavt, Some(joe_id), Some(attr.id), None)
        .unwrap();
    assert_eq!(1, datoms.len());
    assert_eq!(Value::str("Joe"), datoms[0].value);
}

#[test]
fn max_eid_and_max_tx_survive_reopen_and_keep_advancing() {
    init_logging();
    let dir = TempDir::new("triplestore-durability-counters").unwrap();

    let first_id = {
        let mut db = Db::init_db(dir.path()).unwrap();
        db.add_attribute(Attribute::new(0, "widget/tag", ValueType::Str))
            .unwrap();
        let report = db
            .transact(Transaction::new().with(Operation::on_new().set("widget/tag", "a")))
            .unwrap();
        *report
            .tx_data
            .iter()
            .find(|d| d.value == Value::str("a"))
            .map(|d| d.entity)
            .as_ref()
            .unwrap()
    };

    let mut db = Db::init_db(dir.path()).unwrap();
    let report = db
        .transact(Transaction::new().with(Operation::on_new().set("widget/tag", "b")))
        .unwrap();
    let second_id = report
        .tx_data
        .iter()
        .find(|d| d.value == Value::str("b"))
        .map(|d| d.entity)
        .unwrap();

    assert!(second_id > first_id);
}

#[test]
fn index_range_scans_a_bounded_window_in_ascending_value_order() {
    init_logging();
    let dir = TempDir::new("triplestore-index-range").unwrap();
    let mut db = Db::init_db(dir.path()).unwrap();
    db.add_attribute(Attribute::new(0, "item/id", ValueType::Long))
        .unwrap();

    let mut txn = Transaction::new();
    for n in 1..=100i64 {
        txn = txn.with(Operation::on_new().set("item/id", n));
    }
    db.transact(txn).unwrap();

    let in_range = db
        .index_range(
            "item/id",
            Some(&Value::Long(40)),
            Some(&Value::Long(60)),
        )
        .unwrap();
    // [40, 60] is inclusive on both ends: 21 values, not 20.
    assert_eq!(21, in_range.len());
    let values: Vec<i64> = in_range.iter().map(|d| d.value.as_long().unwrap()).collect();
    let mut sorted = values.clone();
    sorted.sort();
    assert_eq!(values, sorted);
    assert_eq!(Some(&40), values.first());
    assert_eq!(Some(&60), values.last());
}

#[test]
fn rseek_datoms_descends_from_the_largest_value_and_continues_past_the_attribute() {
    init_logging();
    let dir = TempDir::new("triplestore-rseek").unwrap();
    let mut db = Db::init_db(dir.path()).unwrap();
    db.add_attribute(Attribute::new(0, "item/id", ValueType::Long))
        .unwrap();

    let mut txn = Transaction::new();
    for n in 1..=10i64 {
        txn = txn.with(Operation::on_new().set("item/id", n));
    }
    db.transact(txn).unwrap();

    let attr_id = db.schema().attribute_by_ident("item/id").unwrap().id;
    let descending = db.rseek_datoms(Index::Avet, None, Some(attr_id), None).unwrap();

    // The scan starts at the largest `item/id` key and descends through
    // all ten values in order before continuing past the attribute
    // boundary into whatever sorts earlier in AVET (here, the
    // transaction's own `db/txInstant` datom) — unlike `datoms`, it is
    // not bounded back up once the given attribute's own range ends.
    let item_values: Vec<i64> = descending
        .iter()
        .take_while(|d| d.attribute == attr_id)
        .map(|d| d.value.as_long().unwrap())
        .collect();
    assert_eq!((1..=10).rev().collect::<Vec<_>>(), item_values);
    assert!(
        descending.len() > item_values.len(),
        "rseek_datoms must continue past the attribute's own range to the index's beginning"
    );
}

#[test]
fn seek_datoms_scans_forward_past_the_given_entity_to_the_indexs_end() {
    init_logging();
    let dir = TempDir::new("triplestore-seek").unwrap();
    let mut db = Db::init_db(dir.path()).unwrap();
    db.add_attribute(Attribute::new(0, "item/id", ValueType::Long))
        .unwrap();

    let mut txn = Transaction::new();
    for n in 1..=5i64 {
        txn = txn.with(Operation::on_new().set("item/id", n));
    }
    let report = db.transact(txn).unwrap();
    let attr_id = db.schema().attribute_by_ident("item/id").unwrap().id;
    let first_entity = report
        .tx_data
        .iter()
        .filter(|d| d.attribute == attr_id)
        .map(|d| d.entity)
        .min()
        .unwrap();

    // Bound only on entity: a plain `datoms` call would return just
    // `first_entity`'s own datom, but `seek_datoms` must keep going
    // through every later entity in `Eavt` order up to the index's end.
    let forward = db
        .seek_datoms(Index::Eavt, Some(first_entity), None, None)
        .unwrap();
    assert!(
        forward.len() > 1,
        "seek_datoms must continue past the given entity, not stop at its own datoms"
    );
    assert_eq!(first_entity, forward[0].entity);
    assert!(forward.iter().all(|d| d.entity >= first_entity));
    let entities: Vec<u64> = forward.iter().map(|d| d.entity).collect();
    let mut sorted = entities.clone();
    sorted.sort();
    assert_eq!(entities, sorted, "seek_datoms must stay in ascending key order");
}

#[test]
fn retracting_an_entity_cascades_through_nested_components() {
    init_logging();
    let dir = TempDir::new("triplestore-cascade").unwrap();
    let mut db = Db::init_db(dir.path()).unwrap();
    db.add_attribute(Attribute::new(0, "node/child", ValueType::Ref).component())
        .unwrap();
    db.add_attribute(Attribute::new(0, "node/name", ValueType::Str))
        .unwrap();

    let report = db
        .transact(
            Transaction::new()
                .with(Operation::on_temp_id("root").set("node/name", "root"))
                .with(Operation::on_temp_id("mid").set("node/name", "mid"))
                .with(Operation::on_temp_id("leaf").set("node/name", "leaf")),
        )
        .unwrap();
    let root = *report.tempids.get("root").unwrap();
    let mid = *report.tempids.get("mid").unwrap();
    let leaf = *report.tempids.get("leaf").unwrap();

    db.transact(
        Transaction::new()
            .with(Statement::assert(Entity::Id(root), "node/child", mid as u64))
            .with(Statement::assert(Entity::Id(mid), "node/child", leaf as u64)),
    )
    .unwrap();

    db.transact(Transaction::new().with(Statement::retract_entity(Entity::Id(root))))
        .unwrap();

    let name_attr = db.schema().attribute_by_ident("node/name").unwrap().id;
    for id in [root, mid, leaf] {
        let remaining = db.datoms(Index::Eavt, Some(id), Some(name_attr), None).unwrap();
        assert!(remaining.is_empty(), "entity {id} should have been cascaded away");
    }
}
