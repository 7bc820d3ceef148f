//! Resolves a [`Transaction`] against a snapshot of storage+schema into
//! the concrete list of datoms it produces, without touching storage —
//! `Db::transact` is the only thing that persists the result. Keeping
//! resolution pure makes the upsert-conflict restart loop (step 4 below)
//! just "run this function again with fresh state" rather than having to
//! unwind partial writes.
//!
//! Processing follows five steps:
//! 1. explode map-entity operations into primitive `Assert`s, expanding
//!    `_reverse` attribute shorthand along the way;
//! 2. resolve every `Entity` reference (new id, tempid, existing id, or
//!    lookup-ref) to a concrete entity id, upserting tempids that carry a
//!    `:db/unique identity` attribute onto an already-existing entity;
//! 3. if a tempid would upsert onto two different existing entities,
//!    restart resolution — bounded by the number of distinct tempids, so
//!    this always terminates;
//! 4. execute each resolved statement (assert/retract/cas/retractEntity/
//!    retractAttribute/call), expanding stored transaction functions
//!    inline;
//! 5. assemble the transaction's own datom and the final tempid map.

use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use crate::datom::{Datom, Index, Value};
use crate::db::Db;
use crate::schema::attribute::{Attribute, Unique};
use crate::tx::{Entity, Operation, Statement, Transaction, TransactError};

const MAX_UPSERT_RESTARTS: usize = 64;

pub struct TxResult {
    pub tx_data: Vec<Datom>,
    pub tempids: HashMap<Rc<str>, u64>,
    pub next_eid: u64,
}

pub fn transact(db: &Db, transaction: Transaction) -> Result<TxResult, TransactError> {
    let flat = flatten(transaction.statements)?;

    let mut restarts = 0;
    loop {
        match resolve_and_execute(db, &flat) {
            Ok(result) => return Ok(result),
            Err(RestartableError::Conflict) if restarts < MAX_UPSERT_RESTARTS => {
                restarts += 1;
                continue;
            }
            Err(RestartableError::Conflict) => {
                return Err(TransactError::ConflictingUpsert(Rc::from("<transaction>")))
            }
            Err(RestartableError::Fatal(e)) => return Err(e),
        }
    }
}

enum RestartableError {
    Conflict,
    Fatal(TransactError),
}

impl From<TransactError> for RestartableError {
    fn from(e: TransactError) -> Self {
        RestartableError::Fatal(e)
    }
}

/// A tempid name no caller can type (leading NUL), scoping the
/// synthetic names `explode` mints for `Entity::New` map-entities to an
/// internal namespace that can't collide with a user-supplied tempid
/// and is stripped back out of the final tempid map before it's
/// returned (see `is_synthetic_new_tempid`).
const NEW_ENTITY_TEMPID_PREFIX: &str = "\u{0}new/";

fn is_synthetic_new_tempid(name: &str) -> bool {
    name.starts_with(NEW_ENTITY_TEMPID_PREFIX)
}

/// Expands every `Statement::Map` into one `Statement::Assert` per
/// attribute/value pair, handling `_attr` reverse references. Other
/// statement kinds pass through unchanged.
///
/// An `Entity::New` map-entity is lowered to a synthetic tempid unique
/// to this statement's position before exploding, so every attribute
/// the map carries resolves to the *same* entity id instead of
/// `resolve_entity` minting a fresh id per exploded `Assert` — and so
/// that a `:db/unique identity` attribute in the map can upsert onto an
/// existing entity the same way a user-supplied tempid does.
fn flatten(statements: Vec<Statement>) -> Result<Vec<Statement>, TransactError> {
    let mut flat = Vec::with_capacity(statements.len());
    for (index, statement) in statements.into_iter().enumerate() {
        match statement {
            Statement::Map(operation) => flat.extend(explode(operation, index)?),
            other => flat.push(other),
        }
    }
    Ok(flat)
}

fn explode(operation: Operation, statement_index: usize) -> Result<Vec<Statement>, TransactError> {
    let entity = match operation.entity {
        Entity::New => Entity::TempId(Rc::from(format!("{NEW_ENTITY_TEMPID_PREFIX}{statement_index}"))),
        other => other,
    };
    let mut out = Vec::with_capacity(operation.attributes.len());
    for attribute_value in operation.attributes {
        if let Some(reverse_ident) = attribute_value.attribute.strip_prefix('_') {
            let owner_value = entity_to_value(&entity)?;
            let referenced = value_to_entity(&attribute_value.value)?;
            out.push(Statement::Assert {
                entity: referenced,
                attribute: Rc::from(reverse_ident),
                value: owner_value,
            });
        } else {
            out.push(Statement::Assert {
                entity: entity.clone(),
                attribute: attribute_value.attribute,
                value: attribute_value.value,
            });
        }
    }
    Ok(out)
}

fn entity_to_value(entity: &Entity) -> Result<Value, TransactError> {
    match entity {
        Entity::Id(id) => Ok(Value::Ref(*id)),
        Entity::TempId(name) => Ok(Value::str(name.as_ref())),
        Entity::New | Entity::LookupRef { .. } => Err(TransactError::UnresolvedTempId(Rc::from(
            "reverse-ref owner must be an existing id or tempid",
        ))),
    }
}

fn value_to_entity(value: &Value) -> Result<Entity, TransactError> {
    match value {
        Value::Ref(id) => Ok(Entity::Id(*id)),
        Value::Str(s) | Value::Keyword(s) => Ok(Entity::temp_id(Rc::clone(s))),
        other => Err(TransactError::TypeMismatch {
            attribute: Rc::from("_reverse"),
            value: other.clone(),
        }),
    }
}

/// One attempt at resolving every entity reference and executing the
/// flattened statement list. Returns `Err(RestartableError::Conflict)`
/// when a later statement reveals that an earlier upsert decision was
/// wrong (see `resolve_tempids`), which the caller retries fresh.
fn resolve_and_execute(db: &Db, flat: &[Statement]) -> Result<TxResult, RestartableError> {
    let mut tempids = resolve_tempids(db, flat)?;
    let tx = db.next_tx;
    let mut next_eid = db.next_eid;

    let mut datoms = Vec::new();
    let mut cardinality_one_seen: HashMap<(u64, u64), Value> = HashMap::new();
    let mut cardinality_many_seen: HashSet<(u64, u64, Value)> = HashSet::new();
    let mut unique_seen: HashMap<(u64, Value), u64> = HashMap::new();
    let mut queue: VecDeque<Statement> = flat.iter().cloned().collect();

    while let Some(statement) = queue.pop_front() {
        match statement {
            Statement::Map(_) => unreachable!("flattened before resolution"),
            Statement::Assert {
                entity,
                attribute,
                value,
            } => {
                let entity_id = resolve_entity(db, &entity, &mut tempids, &mut next_eid)?;
                let attr = lookup_attribute(db, &attribute)?;
                let value = substitute_tempid_ref(&attr, value, &mut tempids, &mut next_eid);
                check_type(&attr, &value)?;

                if db.schema.is_unique(attr.id) {
                    check_unique(db, &attr, &value, entity_id, &mut unique_seen)?;
                }

                if db.schema.is_many(attr.id) {
                    // Cardinality-many: a (e, a, v) already live (committed,
                    // or already queued earlier in this same transaction) is
                    // a no-op — only ever emit the add once.
                    let seen_key = (entity_id, attr.id, value.clone());
                    if cardinality_many_seen.insert(seen_key) {
                        let already_live = live_values(db, entity_id, attr.id)?
                            .iter()
                            .any(|existing| existing == &value);
                        if !already_live {
                            datoms.push(Datom::add(entity_id, attr.id, value, tx));
                        }
                    }
                } else {
                    // Cardinality-one: first assertion in this transaction
                    // for (e, a) retracts whatever was live and differs, and
                    // only emits the add if the new value isn't already the
                    // live one (idempotence). Later assertions in the same
                    // transaction must agree with the first, or conflict.
                    let key = (entity_id, attr.id);
                    match cardinality_one_seen.get(&key) {
                        Some(previous) if previous != &value => {
                            return Err(TransactError::CardinalityConflict {
                                attribute: Rc::clone(&attribute),
                            }
                            .into());
                        }
                        Some(_) => {}
                        None => {
                            cardinality_one_seen.insert(key, value.clone());
                            let existing = live_values(db, entity_id, attr.id)?;
                            let already_live = existing.iter().any(|v| v == &value);
                            for existing_value in existing {
                                if existing_value != value {
                                    datoms.push(Datom::retract(entity_id, attr.id, existing_value, tx));
                                }
                            }
                            if !already_live {
                                datoms.push(Datom::add(entity_id, attr.id, value, tx));
                            }
                        }
                    }
                }
            }
            Statement::Retract {
                entity,
                attribute,
                value,
            } => {
                let entity_id = resolve_entity(db, &entity, &mut tempids, &mut next_eid)?;
                let attr = lookup_attribute(db, &attribute)?;
                let value = substitute_tempid_ref(&attr, value, &mut tempids, &mut next_eid);
                if db.storage.fetch(entity_id, attr.id, &value)?.is_some() {
                    datoms.push(Datom::retract(entity_id, attr.id, value, tx));
                }
            }
            Statement::RetractAttribute { entity, attribute } => {
                let entity_id = resolve_entity(db, &entity, &mut tempids, &mut next_eid)?;
                let attr = lookup_attribute(db, &attribute)?;
                let is_component = db.schema.is_component(attr.id);
                for existing in live_values(db, entity_id, attr.id)? {
                    if is_component {
                        if let Value::Ref(component_entity) = existing {
                            retract_entity_cascade(db, component_entity, tx, &mut datoms, &mut HashSet::new())?;
                        }
                    }
                    datoms.push(Datom::retract(entity_id, attr.id, existing, tx));
                }
            }
            Statement::RetractEntity { entity } => {
                let entity_id = resolve_entity(db, &entity, &mut tempids, &mut next_eid)?;
                retract_entity_cascade(db, entity_id, tx, &mut datoms, &mut HashSet::new())?;
            }
            Statement::Cas {
                entity,
                attribute,
                old,
                new,
            } => {
                let entity_id = resolve_entity(db, &entity, &mut tempids, &mut next_eid)?;
                let attr = lookup_attribute(db, &attribute)?;
                let new = substitute_tempid_ref(&attr, new, &mut tempids, &mut next_eid);
                check_type(&attr, &new)?;
                let current = live_values(db, entity_id, attr.id)?.into_iter().next();
                if current.as_ref() != Some(&old) {
                    return Err(TransactError::CasFailed {
                        attribute: Rc::clone(&attribute),
                        expected: old,
                        found: current.unwrap_or(Value::Boolean(false)),
                    }
                    .into());
                }
                datoms.push(Datom::retract(entity_id, attr.id, old, tx));
                datoms.push(Datom::add(entity_id, attr.id, new, tx));
            }
            Statement::CallFn { entity, name, args } => {
                let entity_id = resolve_entity(db, &entity, &mut tempids, &mut next_eid)?;
                let f = db
                    .functions
                    .resolve(&name)
                    .ok_or_else(|| TransactError::UnknownFunction(Rc::clone(&name)))?;
                let expansion = f(db, entity_id, &args)?;
                for statement in expansion.into_iter().rev() {
                    queue.push_front(statement);
                }
            }
        }
    }

    // The synthetic names `explode` mints for `Entity::New` map-entities
    // are an implementation detail of this pass, not something a caller
    // ever named — keep them out of the map a caller inspects.
    tempids.retain(|name, _| !is_synthetic_new_tempid(name));

    Ok(TxResult {
        tx_data: datoms,
        tempids,
        next_eid,
    })
}

/// First pass over every `Assert`: for tempids that appear as the entity
/// of an assertion on a `:db/unique identity` attribute, look up whether
/// an entity already carries that (attribute, value) pair, and if so
/// bind the tempid to it instead of a fresh id. A tempid that upserts to
/// two different existing entities across two different unique
/// attributes is a conflicting upsert.
fn resolve_tempids(
    db: &Db,
    flat: &[Statement],
) -> Result<HashMap<Rc<str>, u64>, RestartableError> {
    let mut tempids: HashMap<Rc<str>, u64> = HashMap::new();
    for statement in flat {
        let Statement::Assert {
            entity: Entity::TempId(name),
            attribute,
            value,
        } = statement
        else {
            continue;
        };
        let Some(attr) = db.schema.attribute_by_ident(attribute) else {
            continue;
        };
        if attr.unique != Some(Unique::Identity) {
            continue;
        }
        let value = try_substitute_tempid_ref(attr, value.clone(), &tempids);
        let matches = db
            .storage
            .slice(Index::Avet, None, Some(attr.id), Some(&value))
            .map_err(TransactError::from)?;
        let Some(found) = matches.into_iter().next() else {
            continue;
        };
        match tempids.get(name) {
            Some(&existing) if existing != found.entity => return Err(RestartableError::Conflict),
            Some(_) => {}
            None => {
                tempids.insert(Rc::clone(name), found.entity);
            }
        }
    }
    Ok(tempids)
}

fn resolve_entity(
    db: &Db,
    entity: &Entity,
    tempids: &mut HashMap<Rc<str>, u64>,
    next_eid: &mut u64,
) -> Result<u64, RestartableError> {
    match entity {
        Entity::New => {
            let id = *next_eid;
            *next_eid += 1;
            Ok(id)
        }
        Entity::Id(id) => Ok(*id),
        Entity::TempId(name) => match tempids.get(name) {
            Some(&id) => Ok(id),
            None => {
                let id = *next_eid;
                *next_eid += 1;
                tempids.insert(Rc::clone(name), id);
                Ok(id)
            }
        },
        Entity::LookupRef { attribute, value } => {
            let attr = lookup_attribute(db, attribute).map_err(RestartableError::from)?;
            if attr.unique != Some(Unique::Identity) {
                return Err(TransactError::LookupRefNotUnique {
                    attribute: Rc::clone(attribute),
                }
                .into());
            }
            let matches = db
                .storage
                .slice(Index::Avet, None, Some(attr.id), Some(value))
                .map_err(TransactError::from)?;
            matches
                .into_iter()
                .next()
                .map(|d| d.entity)
                .ok_or_else(|| {
                    TransactError::LookupRefNotFound {
                        attribute: Rc::clone(attribute),
                        value: value.clone(),
                    }
                    .into()
                })
        }
    }
}

/// Enforces invariant 2 (§3): at most one live entity may hold `value`
/// for a `:db/unique` attribute. Checks both durable storage and the
/// datoms this same transaction has already queued for `attr`, since
/// uniqueness must see the cumulative state of the in-flight batch, not
/// just what is already committed.
fn check_unique(
    db: &Db,
    attr: &Attribute,
    value: &Value,
    entity_id: u64,
    unique_seen: &mut HashMap<(u64, Value), u64>,
) -> Result<(), TransactError> {
    let key = (attr.id, value.clone());
    if let Some(&holder) = unique_seen.get(&key) {
        if holder != entity_id {
            return Err(TransactError::UniqueConflict {
                attribute: Rc::clone(&attr.ident),
                value: value.clone(),
            });
        }
        return Ok(());
    }
    let existing = db
        .storage
        .slice(Index::Avet, None, Some(attr.id), Some(value))?;
    if existing.into_iter().any(|d| d.entity != entity_id) {
        return Err(TransactError::UniqueConflict {
            attribute: Rc::clone(&attr.ident),
            value: value.clone(),
        });
    }
    unique_seen.insert(key, entity_id);
    Ok(())
}

fn lookup_attribute(db: &Db, ident: &Rc<str>) -> Result<Attribute, TransactError> {
    db.schema
        .attribute_by_ident(ident)
        .cloned()
        .ok_or_else(|| TransactError::UnknownAttribute(Rc::clone(ident)))
}

fn check_type(attr: &Attribute, value: &Value) -> Result<(), TransactError> {
    if value.matches_type(attr.value_type) {
        Ok(())
    } else {
        Err(TransactError::TypeMismatch {
            attribute: Rc::clone(&attr.ident),
            value: value.clone(),
        })
    }
}

/// Read-only variant used while only probing upsert candidates (§
/// `resolve_tempids`): a tempid not yet bound is left as-is rather than
/// allocated, since this pass must not invent entity ids for names that
/// turn out not to need one.
fn try_substitute_tempid_ref(attr: &Attribute, value: Value, tempids: &HashMap<Rc<str>, u64>) -> Value {
    if attr.value_type != crate::datom::ValueType::Ref {
        return value;
    }
    match &value {
        Value::Str(s) | Value::Keyword(s) => match tempids.get(s) {
            Some(&id) => Value::Ref(id),
            None => value,
        },
        _ => value,
    }
}

/// Substitutes a `Value::Str`/`Value::Keyword` naming a tempid with the
/// tempid's resolved `Value::Ref`, when `attr` is ref-typed. A tempid
/// named here for the first time — e.g. a forward reference, used as a
/// value before its own entity position is processed — is allocated and
/// bound on the spot, the same as if `resolve_entity` had seen it first.
fn substitute_tempid_ref(
    attr: &Attribute,
    value: Value,
    tempids: &mut HashMap<Rc<str>, u64>,
    next_eid: &mut u64,
) -> Value {
    if attr.value_type != crate::datom::ValueType::Ref {
        return value;
    }
    match &value {
        Value::Str(s) | Value::Keyword(s) => {
            let id = *tempids.entry(Rc::clone(s)).or_insert_with(|| {
                let id = *next_eid;
                *next_eid += 1;
                id
            });
            Value::Ref(id)
        }
        _ => value,
    }
}

fn live_values(db: &Db, entity: u64, attribute: u64) -> Result<Vec<Value>, TransactError> {
    Ok(db
        .storage
        .slice(Index::Eavt, Some(entity), Some(attribute), None)
        .map_err(TransactError::from)?
        .into_iter()
        .map(|d| d.value)
        .collect())
}

/// Retracts every datom with `entity` as subject, cascading into
/// component-referenced entities, and every datom with `entity` as
/// value (a dangling incoming reference once `entity` is gone).
fn retract_entity_cascade(
    db: &Db,
    entity: u64,
    tx: u64,
    datoms: &mut Vec<Datom>,
    visited: &mut HashSet<u64>,
) -> Result<(), TransactError> {
    if !visited.insert(entity) {
        return Ok(());
    }
    let owned = db
        .storage
        .slice(Index::Eavt, Some(entity), None, None)
        .map_err(TransactError::from)?;
    for datom in &owned {
        if db.schema.is_component(datom.attribute) {
            if let Value::Ref(component_entity) = datom.value {
                retract_entity_cascade(db, component_entity, tx, datoms, visited)?;
            }
        }
    }
    for datom in owned {
        datoms.push(Datom::retract(entity, datom.attribute, datom.value, tx));
    }

    let incoming = db
        .storage
        .slice(Index::Vaet, None, None, Some(&Value::Ref(entity)))
        .map_err(TransactError::from)?;
    for datom in incoming {
        // An entity already in `visited` is part of this same cascade and
        // had its own outgoing datoms (including this one) retracted above;
        // skip it so the datom isn't queued for retraction twice.
        if visited.contains(&datom.entity) {
            continue;
        }
        datoms.push(Datom::retract(datom.entity, datom.attribute, datom.value, tx));
    }
    Ok(())
}
