//! The storage layer: the durable, sorted representation of a database
//! as four datom indexes (`eav`, `aev`, `ave`, `vae`) plus a `schema`
//! sub-database (the attribute registry) and a `meta` sub-database
//! (max entity id, max transaction id, on-disk layout version) — all
//! held in one `heed`/LMDB environment via [`engine::Engine`].

pub mod codec;
pub mod engine;

use std::rc::Rc;

use thiserror::Error;

use crate::datom::{Datom, Index, Op, Value, TX0};
use crate::schema::attribute::{Attribute, Cardinality, Unique};
use crate::schema::Schema;
use crate::storage::codec::CodecError;
use crate::storage::engine::{Engine, EngineError, WriteBatch};

const SUB_EAV: &str = "eav";
const SUB_AEV: &str = "aev";
const SUB_AVE: &str = "ave";
const SUB_VAE: &str = "vae";
const SUB_SCHEMA: &str = "schema";
const SUB_META: &str = "meta";

pub const SUB_DATABASES: &[&str] = &[SUB_EAV, SUB_AEV, SUB_AVE, SUB_VAE, SUB_SCHEMA, SUB_META];

const META_KEY_VERSION: &[u8] = b"version";
const META_KEY_MAX_EID: &[u8] = b"max-eid";
const META_KEY_MAX_TX: &[u8] = b"max-tx";

/// The on-disk layout version this crate writes and expects to read.
/// Bumped whenever the key/value encoding changes incompatibly.
pub const LAYOUT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("value codec error: {0}")]
    Codec(#[from] CodecError),
    #[error(
        "on-disk layout version {found} does not match the version {expected} this build expects"
    )]
    Version { found: u32, expected: u32 },
    #[error("corrupt storage: {0}")]
    Corrupt(String),
}

/// One index's sub-database, for dispatch convenience.
fn sub_for(index: Index) -> &'static str {
    match index {
        Index::Eavt => SUB_EAV,
        Index::Aevt => SUB_AEV,
        Index::Avet => SUB_AVE,
        Index::Vaet => SUB_VAE,
    }
}

/// Encodes the key for `datom` under `index`: the bare `(e, a, v)` triple
/// in whichever order `index` places them, with no transaction suffix.
/// A live datom occupies exactly one row under this key per index; the
/// transaction that last asserted it travels in the value instead (see
/// [`encode_row_value`]), so re-asserting the same `(e, a, v)` overwrites
/// its row rather than appending a new one, and retracting it deletes
/// the row outright.
fn encode_key(index: Index, datom: &Datom) -> Result<Vec<u8>, CodecError> {
    let mut key = Vec::with_capacity(32);
    match index {
        Index::Eavt => {
            codec::encode_u64(datom.entity, &mut key);
            codec::encode_u64(datom.attribute, &mut key);
            codec::encode_value(&datom.value, &mut key)?;
        }
        Index::Aevt => {
            codec::encode_u64(datom.attribute, &mut key);
            codec::encode_u64(datom.entity, &mut key);
            codec::encode_value(&datom.value, &mut key)?;
        }
        Index::Avet => {
            codec::encode_u64(datom.attribute, &mut key);
            codec::encode_value(&datom.value, &mut key)?;
            codec::encode_u64(datom.entity, &mut key);
        }
        Index::Vaet => {
            codec::encode_value(&datom.value, &mut key)?;
            codec::encode_u64(datom.attribute, &mut key);
            codec::encode_u64(datom.entity, &mut key);
        }
    }
    Ok(key)
}

/// Encodes a row's value: just the transaction id that last asserted it.
/// Presence of the row is what means "added" — there is nothing else to
/// record, since retracted datoms are deleted rather than tombstoned.
fn encode_row_value(tx: u64) -> Vec<u8> {
    tx.to_be_bytes().to_vec()
}

fn decode_row_value(bytes: &[u8]) -> Result<u64, StorageError> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StorageError::Corrupt("expected 8-byte tx value".into()))?;
    Ok(codec::decode_u64(array))
}

/// Decodes the `(e, a, v)` triple from a key under `index`; `tx` comes
/// from the row's value, decoded separately by the caller.
fn decode_key(index: Index, key: &[u8], tx: u64) -> Result<Datom, StorageError> {
    let (e, a, v, rest) = match index {
        Index::Eavt => {
            let (e, rest) = take_u64(key)?;
            let (a, rest) = take_u64(rest)?;
            let (v, rest) = codec::decode_value(rest)?;
            (e, a, v, rest)
        }
        Index::Aevt => {
            let (a, rest) = take_u64(key)?;
            let (e, rest) = take_u64(rest)?;
            let (v, rest) = codec::decode_value(rest)?;
            (e, a, v, rest)
        }
        Index::Avet => {
            let (a, rest) = take_u64(key)?;
            let (v, rest) = codec::decode_value(rest)?;
            let (e, rest) = take_u64(rest)?;
            (e, a, v, rest)
        }
        Index::Vaet => {
            let (v, rest) = codec::decode_value(key)?;
            let (a, rest) = take_u64(rest)?;
            let (e, rest) = take_u64(rest)?;
            (e, a, v, rest)
        }
    };
    if !rest.is_empty() {
        return Err(StorageError::Corrupt("trailing bytes after value".into()));
    }
    Ok(Datom {
        entity: e,
        attribute: a,
        value: v,
        tx,
        op: Op::Added,
    })
}

fn take_u64(bytes: &[u8]) -> Result<(u64, &[u8]), StorageError> {
    if bytes.len() < 8 {
        return Err(StorageError::Corrupt("short u64".into()));
    }
    let (head, rest) = bytes.split_at(8);
    let mut array = [0u8; 8];
    array.copy_from_slice(head);
    Ok((u64::from_be_bytes(array), rest))
}

/// Persistent storage over a `heed` environment: four datom indexes, the
/// attribute registry, and the max-eid/max-tx counters.
pub struct Storage {
    engine: Engine,
}

impl Storage {
    /// Opens (creating if absent) a storage directory, checking the
    /// on-disk layout version and loading the schema into memory.
    pub fn open(dir: impl AsRef<std::path::Path>) -> Result<Self, StorageError> {
        let mut engine = Engine::open(dir, SUB_DATABASES, 10 * 1024 * 1024)?;
        let rtxn = engine.read()?;
        let version = engine.get(&rtxn, SUB_META, META_KEY_VERSION)?;
        drop(rtxn);
        match version {
            Some(bytes) => {
                let found = read_u32(&bytes)?;
                if found != LAYOUT_VERSION {
                    return Err(StorageError::Version {
                        found,
                        expected: LAYOUT_VERSION,
                    });
                }
            }
            None => {
                let mut batch = WriteBatch::new();
                batch.put(SUB_META, META_KEY_VERSION.to_vec(), LAYOUT_VERSION.to_be_bytes().to_vec());
                engine.write(&batch)?;
            }
        }
        Ok(Storage { engine })
    }

    /// Loads the attribute registry persisted in the `schema` sub-database,
    /// including any previously-registered user attributes, so a process
    /// restart recovers the same `aid` assignment it had before — the
    /// durability guarantee a restart-safe attribute registry requires.
    pub fn schema(&self) -> Result<Schema, StorageError> {
        let mut schema = Schema::new();
        let rtxn = self.engine.read()?;
        let rows = self.engine.scan(&rtxn, SUB_SCHEMA, None, None)?;
        for (key, value) in rows {
            let id = read_u64(&key)?;
            if schema.by_id.contains_key(&id) {
                continue;
            }
            let attribute = decode_attribute(id, &value)?;
            schema.register(attribute);
        }
        Ok(schema)
    }

    /// Persists (or updates) one attribute's registry entry.
    pub fn save_attribute(&mut self, attribute: &Attribute) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new();
        batch.put(
            SUB_SCHEMA,
            attribute.id.to_be_bytes().to_vec(),
            encode_attribute(attribute),
        );
        self.engine.write(&batch)?;
        Ok(())
    }

    pub fn max_eid(&self) -> Result<u64, StorageError> {
        let rtxn = self.engine.read()?;
        Ok(match self.engine.get(&rtxn, SUB_META, META_KEY_MAX_EID)? {
            Some(bytes) => read_u64(&bytes)?,
            None => 0,
        })
    }

    pub fn max_tx(&self) -> Result<u64, StorageError> {
        let rtxn = self.engine.read()?;
        Ok(match self.engine.get(&rtxn, SUB_META, META_KEY_MAX_TX)? {
            Some(bytes) => read_u64(&bytes)?,
            None => TX0,
        })
    }

    /// Durably applies `datoms` to their indexes and bumps the max-eid/
    /// max-tx counters to cover them. One write transaction, so a crash
    /// mid-commit leaves either all or none of `datoms` visible.
    ///
    /// An added datom overwrites its row (recording the asserting `tx`);
    /// a retracted datom deletes its row outright — "added?" is encoded
    /// by presence, not a flag, so a later full scan never resurrects a
    /// datom retracted in an earlier transaction.
    ///
    /// `Index::Vaet` only ever holds ref-typed datoms (invariant: no VAET
    /// entry exists for a non-ref attribute) — `schema` is consulted to
    /// restrict that index's write/delete to ref-typed attributes.
    pub fn save(
        &mut self,
        datoms: &[Datom],
        max_eid: u64,
        max_tx: u64,
        schema: &Schema,
    ) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new();
        for datom in datoms {
            let indexes: &[Index] = if schema.is_ref(datom.attribute) {
                &[Index::Eavt, Index::Aevt, Index::Avet, Index::Vaet]
            } else {
                &[Index::Eavt, Index::Aevt, Index::Avet]
            };
            for &index in indexes {
                let key = encode_key(index, datom)?;
                if datom.added() {
                    batch.put(sub_for(index), key, encode_row_value(datom.tx));
                } else {
                    batch.delete(sub_for(index), key);
                }
            }
        }
        batch.put(SUB_META, META_KEY_MAX_EID.to_vec(), max_eid.to_be_bytes().to_vec());
        batch.put(SUB_META, META_KEY_MAX_TX.to_vec(), max_tx.to_be_bytes().to_vec());
        self.engine.write(&batch)?;
        Ok(())
    }

    /// Returns every non-retracted datom stored, in `EAVT` order. Used
    /// by `init_db` to rebuild in-memory caches after a restart.
    pub fn load_datoms(&self) -> Result<Vec<Datom>, StorageError> {
        self.slice(Index::Eavt, None, None, None)
    }

    /// Ascending scan of `index` restricted to datoms whose leading
    /// key components match the `Some` arguments, in whatever order
    /// `index` places them (e.g. `Avet` expects `(attribute, value,
    /// entity)`). Retracted datoms are excluded.
    pub fn slice(
        &self,
        index: Index,
        entity: Option<u64>,
        attribute: Option<u64>,
        value: Option<&Value>,
    ) -> Result<Vec<Datom>, StorageError> {
        self.slice_raw(index, entity, attribute, value, false)
    }

    pub fn rslice(
        &self,
        index: Index,
        entity: Option<u64>,
        attribute: Option<u64>,
        value: Option<&Value>,
    ) -> Result<Vec<Datom>, StorageError> {
        self.slice_raw(index, entity, attribute, value, true)
    }

    fn slice_raw(
        &self,
        index: Index,
        entity: Option<u64>,
        attribute: Option<u64>,
        value: Option<&Value>,
        descending: bool,
    ) -> Result<Vec<Datom>, StorageError> {
        let prefix = key_prefix(index, entity, attribute, value)?;
        let rtxn = self.engine.read()?;
        let sub = sub_for(index);
        let upper = prefix_upper_bound(&prefix);
        let rows = if descending {
            self.engine
                .rscan(&rtxn, sub, Some(&prefix), upper.as_deref())?
        } else {
            self.engine
                .scan(&rtxn, sub, Some(&prefix), upper.as_deref())?
        };
        let mut datoms = Vec::with_capacity(rows.len());
        for (key, raw_value) in rows {
            let tx = decode_row_value(&raw_value)?;
            let datom = decode_key(index, &key, tx)?;
            // `prefix` only covers the leading contiguous `Some`
            // components (see `key_prefix`); a component bound *after*
            // an unbound one (e.g. entity+value but no attribute) can't
            // be folded into the key, so it's checked here instead.
            if matches_components(&datom, entity, attribute, value) {
                datoms.push(datom);
            }
        }
        Ok(datoms)
    }

    /// Forward scan starting at the smallest key whose leading
    /// components (in `index` order) match the given `Some` arguments,
    /// continuing all the way to the index's end — unlike [`Storage::slice`],
    /// not bounded back down once those components are exhausted. Backs
    /// the public `seek_datoms` operation.
    pub fn seek(
        &self,
        index: Index,
        entity: Option<u64>,
        attribute: Option<u64>,
        value: Option<&Value>,
    ) -> Result<Vec<Datom>, StorageError> {
        let lower = key_prefix(index, entity, attribute, value)?;
        let rtxn = self.engine.read()?;
        let rows = self.engine.scan(&rtxn, sub_for(index), Some(&lower), None)?;
        let mut datoms = Vec::with_capacity(rows.len());
        for (key, raw_value) in rows {
            let tx = decode_row_value(&raw_value)?;
            datoms.push(decode_key(index, &key, tx)?);
        }
        Ok(datoms)
    }

    /// Reverse scan starting at the largest key whose leading components
    /// match the given `Some` arguments, continuing down to the index's
    /// beginning. Backs the public `rseek_datoms` operation.
    pub fn rseek(
        &self,
        index: Index,
        entity: Option<u64>,
        attribute: Option<u64>,
        value: Option<&Value>,
    ) -> Result<Vec<Datom>, StorageError> {
        let prefix = key_prefix(index, entity, attribute, value)?;
        let upper = prefix_upper_bound(&prefix);
        let rtxn = self.engine.read()?;
        let rows = self.engine.rscan(&rtxn, sub_for(index), None, upper.as_deref())?;
        let mut datoms = Vec::with_capacity(rows.len());
        for (key, raw_value) in rows {
            let tx = decode_row_value(&raw_value)?;
            datoms.push(decode_key(index, &key, tx)?);
        }
        Ok(datoms)
    }

    /// Like [`Storage::slice`], but additionally filters by a predicate
    /// over the decoded datom — used by the transaction pipeline's
    /// uniqueness checks, which need "does any datom exist for (a, v)"
    /// without caring about entity.
    pub fn slice_filter(
        &self,
        index: Index,
        entity: Option<u64>,
        attribute: Option<u64>,
        value: Option<&Value>,
        predicate: impl Fn(&Datom) -> bool,
    ) -> Result<Vec<Datom>, StorageError> {
        Ok(self
            .slice(index, entity, attribute, value)?
            .into_iter()
            .filter(predicate)
            .collect())
    }

    /// A single, fully-bound lookup: does this exact (e, a, v) have a
    /// live (non-retracted) datom? Used by CAS and retraction.
    pub fn fetch(&self, entity: u64, attribute: u64, value: &Value) -> Result<Option<Datom>, StorageError> {
        Ok(self
            .slice(Index::Eavt, Some(entity), Some(attribute), Some(value))?
            .into_iter()
            .next())
    }

    /// All live datoms for `attribute` whose value falls in `[start,
    /// end]` (either bound omitted means unbounded on that side),
    /// ascending by value. Backs the public `index_range` operation:
    /// an AVET range scan restricted to one attribute. Both bounds are
    /// inclusive: `end` is the last value that should still be
    /// returned, not an exclusive ceiling.
    pub fn index_range(
        &self,
        attribute: u64,
        start: Option<&Value>,
        end: Option<&Value>,
    ) -> Result<Vec<Datom>, StorageError> {
        let mut lower = Vec::new();
        codec::encode_u64(attribute, &mut lower);
        if let Some(v) = start {
            codec::encode_value(v, &mut lower)?;
        }
        let mut attribute_prefix = Vec::new();
        codec::encode_u64(attribute, &mut attribute_prefix);
        let upper = match end {
            Some(v) => {
                let mut end_key = Vec::new();
                codec::encode_u64(attribute, &mut end_key);
                codec::encode_value(v, &mut end_key)?;
                // `end_key` is the key of the smallest datom with
                // value == end; its entity suffix sorts after it, so the
                // exclusive upper bound of `end_key` itself (not of
                // `attribute_prefix`) is what lets value == end through.
                prefix_upper_bound(&end_key).unwrap_or_else(|| {
                    let mut upper = end_key.clone();
                    upper.push(0xff);
                    upper
                })
            }
            None => prefix_upper_bound(&attribute_prefix)
                .unwrap_or_else(|| vec![0xff; attribute_prefix.len() + 1]),
        };
        let rtxn = self.engine.read()?;
        let rows = self.engine.scan(&rtxn, SUB_AVE, Some(&lower), Some(&upper))?;
        let mut datoms = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            let tx = decode_row_value(&value)?;
            datoms.push(decode_key(Index::Avet, &key, tx)?);
        }
        Ok(datoms)
    }
}

/// Picks the index and encodes the shared key prefix for a (partially)
/// bound (entity, attribute, value) pattern: whichever of e/a/v are
/// bound determines which index's natural prefix order lets the store
/// satisfy the lookup with a single ordered range scan.
///
/// Only the *leading* run of bound components can become part of the
/// key — a key is the concatenation of all three components in the
/// index's fixed order, so a bound component following an unbound one
/// (e.g. `Eavt` with entity and value given but not attribute) has
/// nothing contiguous to splice onto and is left for the caller to
/// filter from the decoded datom instead (see `matches_components`).
fn key_prefix(
    index: Index,
    entity: Option<u64>,
    attribute: Option<u64>,
    value: Option<&Value>,
) -> Result<Vec<u8>, CodecError> {
    let mut prefix = Vec::new();
    match index {
        Index::Eavt => {
            let Some(e) = entity else { return Ok(prefix) };
            codec::encode_u64(e, &mut prefix);
            let Some(a) = attribute else { return Ok(prefix) };
            codec::encode_u64(a, &mut prefix);
            let Some(v) = value else { return Ok(prefix) };
            codec::encode_value(v, &mut prefix)?;
        }
        Index::Aevt => {
            let Some(a) = attribute else { return Ok(prefix) };
            codec::encode_u64(a, &mut prefix);
            let Some(e) = entity else { return Ok(prefix) };
            codec::encode_u64(e, &mut prefix);
            let Some(v) = value else { return Ok(prefix) };
            codec::encode_value(v, &mut prefix)?;
        }
        Index::Avet => {
            let Some(a) = attribute else { return Ok(prefix) };
            codec::encode_u64(a, &mut prefix);
            let Some(v) = value else { return Ok(prefix) };
            codec::encode_value(v, &mut prefix)?;
            let Some(e) = entity else { return Ok(prefix) };
            codec::encode_u64(e, &mut prefix);
        }
        Index::Vaet => {
            let Some(v) = value else { return Ok(prefix) };
            codec::encode_value(v, &mut prefix)?;
            let Some(a) = attribute else { return Ok(prefix) };
            codec::encode_u64(a, &mut prefix);
            let Some(e) = entity else { return Ok(prefix) };
            codec::encode_u64(e, &mut prefix);
        }
    }
    Ok(prefix)
}

/// Does `datom` match every given `Some` component? Used after decoding
/// to enforce components `key_prefix` couldn't fold into the scan
/// range.
fn matches_components(
    datom: &Datom,
    entity: Option<u64>,
    attribute: Option<u64>,
    value: Option<&Value>,
) -> bool {
    entity.map_or(true, |e| e == datom.entity)
        && attribute.map_or(true, |a| a == datom.attribute)
        && value.map_or(true, |v| v == &datom.value)
}

/// Smallest key strictly greater than every key starting with `prefix`,
/// i.e. the exclusive upper bound of a prefix scan. `None` (unbounded)
/// only for the empty prefix.
fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    if prefix.is_empty() {
        return None;
    }
    let mut upper = prefix.to_vec();
    for i in (0..upper.len()).rev() {
        if upper[i] != 0xff {
            upper[i] += 1;
            upper.truncate(i + 1);
            return Some(upper);
        }
    }
    None
}

fn read_u32(bytes: &[u8]) -> Result<u32, StorageError> {
    bytes
        .try_into()
        .map(u32::from_be_bytes)
        .map_err(|_| StorageError::Corrupt("expected 4-byte u32".into()))
}

fn read_u64(bytes: &[u8]) -> Result<u64, StorageError> {
    bytes
        .try_into()
        .map(u64::from_be_bytes)
        .map_err(|_| StorageError::Corrupt("expected 8-byte u64".into()))
}

/// Encodes one attribute's registry row: value type, cardinality,
/// uniqueness, component flag, ident and optional doc, all as a single
/// opaque value blob under the `aid` key.
fn encode_attribute(attribute: &Attribute) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(value_type_tag(attribute.value_type));
    out.push(match attribute.cardinality {
        Cardinality::One => 0,
        Cardinality::Many => 1,
    });
    out.push(match attribute.unique {
        None => 0,
        Some(Unique::Identity) => 1,
        Some(Unique::Value) => 2,
    });
    out.push(attribute.is_component as u8);
    let ident = attribute.ident.as_bytes();
    out.extend_from_slice(&(ident.len() as u16).to_be_bytes());
    out.extend_from_slice(ident);
    match &attribute.doc {
        Some(doc) => {
            let doc = doc.as_bytes();
            out.extend_from_slice(&(doc.len() as u16).to_be_bytes());
            out.extend_from_slice(doc);
        }
        None => out.extend_from_slice(&0u16.to_be_bytes()),
    }
    out
}

fn decode_attribute(id: u64, bytes: &[u8]) -> Result<Attribute, StorageError> {
    let corrupt = || StorageError::Corrupt(format!("malformed schema row for attribute {id}"));
    if bytes.len() < 4 {
        return Err(corrupt());
    }
    let value_type = value_type_from_tag(bytes[0]).ok_or_else(corrupt)?;
    let cardinality = match bytes[1] {
        0 => Cardinality::One,
        1 => Cardinality::Many,
        _ => return Err(corrupt()),
    };
    let unique = match bytes[2] {
        0 => None,
        1 => Some(Unique::Identity),
        2 => Some(Unique::Value),
        _ => return Err(corrupt()),
    };
    let is_component = bytes[3] != 0;
    let mut rest = &bytes[4..];
    let ident = read_len_prefixed_str(&mut rest).ok_or_else(corrupt)?;
    let doc = read_len_prefixed_str(&mut rest).filter(|d| !d.is_empty());

    let mut attribute = Attribute::new(id, ident, value_type);
    attribute.cardinality = cardinality;
    attribute.unique = unique;
    attribute.is_component = is_component;
    attribute.doc = doc.map(Rc::from);
    Ok(attribute)
}

fn read_len_prefixed_str(bytes: &mut &[u8]) -> Option<String> {
    if bytes.len() < 2 {
        return None;
    }
    let (len_bytes, rest) = bytes.split_at(2);
    let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
    if rest.len() < len {
        return None;
    }
    let (s, rest) = rest.split_at(len);
    *bytes = rest;
    Some(String::from_utf8_lossy(s).into_owned())
}

fn value_type_tag(value_type: crate::datom::ValueType) -> u8 {
    use crate::datom::ValueType::*;
    match value_type {
        Keyword => 0,
        Symbol => 1,
        Str => 2,
        Boolean => 3,
        Long => 4,
        Double => 5,
        Float => 6,
        Ref => 7,
        Instant => 8,
        Uuid => 9,
        Bytes => 10,
    }
}

fn value_type_from_tag(tag: u8) -> Option<crate::datom::ValueType> {
    use crate::datom::ValueType::*;
    Some(match tag {
        0 => Keyword,
        1 => Symbol,
        2 => Str,
        3 => Boolean,
        4 => Long,
        5 => Double,
        6 => Float,
        7 => Ref,
        8 => Instant,
        9 => Uuid,
        10 => Bytes,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_upper_bound_is_exclusive_successor() {
        assert_eq!(Some(vec![0x01, 0x01]), prefix_upper_bound(&[0x01, 0x00]));
        assert_eq!(None, prefix_upper_bound(&[]));
        assert_eq!(Some(vec![0x02]), prefix_upper_bound(&[0x01, 0xff]));
    }

    #[test]
    fn key_prefix_stops_at_the_first_unbound_component() {
        // `Eavt` with entity and value bound but not attribute: the
        // value can't be folded into the key (it would land where the
        // attribute belongs), so the prefix only covers the entity.
        let mut expected = Vec::new();
        codec::encode_u64(10, &mut expected);
        let prefix = key_prefix(Index::Eavt, Some(10), None, Some(&Value::Long(1))).unwrap();
        assert_eq!(expected, prefix);
    }

    #[test]
    fn slice_filters_a_middle_unbound_component_in_memory() {
        let mut storage = Storage::open(tempdir::TempDir::new("triplestore-storage-test-3").unwrap().path()).unwrap();
        let schema = Schema::new();
        storage
            .save(
                &[
                    Datom::add(10, 20, 1i64, TX0 + 1),
                    Datom::add(10, 21, 2i64, TX0 + 1),
                    Datom::add(10, 22, 1i64, TX0 + 1),
                ],
                10,
                TX0 + 1,
                &schema,
            )
            .unwrap();

        // entity bound, attribute unbound, value bound: only the two
        // datoms with value == 1 should come back, not all three of
        // entity 10's datoms.
        let matching = storage
            .slice(Index::Eavt, Some(10), None, Some(&Value::Long(1)))
            .unwrap();
        assert_eq!(2, matching.len());
        assert!(matching.iter().all(|d| d.value == Value::Long(1)));
    }

    #[test]
    fn eavt_key_roundtrips_through_decode() {
        let datom = Datom::add(1, 2, 3i64, TX0);
        let key = encode_key(Index::Eavt, &datom).unwrap();
        let decoded = decode_key(Index::Eavt, &key, TX0).unwrap();
        assert_eq!(datom, decoded);
    }

    #[test]
    fn re_asserting_a_datom_overwrites_its_row_instead_of_appending() {
        let mut storage = Storage::open(tempdir::TempDir::new("triplestore-storage-test").unwrap().path()).unwrap();
        let schema = Schema::new();
        let first = Datom::add(10, 20, 1i64, TX0 + 1);
        storage.save(&[first.clone()], 10, TX0 + 1, &schema).unwrap();
        let second = Datom::add(10, 20, 1i64, TX0 + 2);
        storage.save(&[second.clone()], 10, TX0 + 2, &schema).unwrap();

        let live = storage.slice(Index::Eavt, Some(10), Some(20), None).unwrap();
        assert_eq!(1, live.len(), "re-asserting the same datom must not leave two live rows");
        assert_eq!(TX0 + 2, live[0].tx);
    }

    #[test]
    fn retracting_a_datom_removes_it_even_though_it_was_added_in_an_earlier_transaction() {
        let mut storage = Storage::open(tempdir::TempDir::new("triplestore-storage-test-2").unwrap().path()).unwrap();
        let schema = Schema::new();
        let add = Datom::add(10, 20, 1i64, TX0 + 1);
        storage.save(&[add], 10, TX0 + 1, &schema).unwrap();
        let retract = Datom::retract(10, 20, 1i64, TX0 + 2);
        storage.save(&[retract], 10, TX0 + 2, &schema).unwrap();

        let live = storage.slice(Index::Eavt, Some(10), Some(20), None).unwrap();
        assert!(live.is_empty(), "retraction from a later transaction must remove the earlier row");
    }

    #[test]
    fn attribute_roundtrips_through_registry_encoding() {
        let attribute = Attribute::new(50, "person/name", crate::datom::ValueType::Str)
            .unique_identity()
            .with_doc("a person's name");
        let encoded = encode_attribute(&attribute);
        let decoded = decode_attribute(50, &encoded).unwrap();
        assert_eq!(attribute.ident, decoded.ident);
        assert_eq!(attribute.unique, decoded.unique);
        assert_eq!(attribute.doc, decoded.doc);
    }
}
