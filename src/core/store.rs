//! Purpose: Thin adapter over the LMDB environment shared by all queue code.
//! Exports: `Store`, `StoreOptions`, typed database aliases, error mapping.
//! Role: Owns environment open parameters and translates `heed` failures.
//! Invariants: One `Store` per environment handle; transactions are scoped and
//! abort on drop unless committed.
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use heed::types::{Bytes, Str, Unit};
use heed::{Database, DatabaseStat, Env, EnvOpenOptions, RoTxn, RwTxn};

use crate::core::error::{Error, ErrorKind};
use crate::core::schema;

/// msg_id -> opaque payload.
pub type PayloadDb = Database<Str, Bytes>;
/// msg_id -> ASCII decimal, and the parameter records.
pub type TextDb = Database<Str, Str>;
/// msg_id -> empty marker (per-subscriber queues).
pub type MarkDb = Database<Str, Unit>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StoreOptions {
    pub map_size_bytes: usize,
    pub max_dbs: u32,
    pub max_readers: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            map_size_bytes: schema::DEFAULT_MAP_SIZE_BYTES,
            max_dbs: schema::DEFAULT_MAX_DBS,
            max_readers: schema::DEFAULT_MAX_READERS,
        }
    }
}

/// Canonical paths of every environment open in this process. LMDB's reader
/// lock table breaks if one process maps the same environment twice, so a
/// second open must be refused until the last handle drops.
fn open_environments() -> &'static Mutex<BTreeSet<PathBuf>> {
    static REGISTRY: OnceLock<Mutex<BTreeSet<PathBuf>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(BTreeSet::new()))
}

#[derive(Debug)]
pub struct Store {
    env: Env,
    path: PathBuf,
}

impl Store {
    /// Open the environment in an existing queue directory. The directory is
    /// registered process-wide; a second open of the same queue fails with
    /// `Conflict` until every handle on the first is gone.
    pub fn open(path: &Path, options: StoreOptions) -> Result<Self, Error> {
        if !path.is_dir() {
            return Err(Error::new(ErrorKind::Io)
                .with_message("queue directory does not exist")
                .with_path(path));
        }
        let canonical = path.canonicalize().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to canonicalize queue directory")
                .with_path(path)
                .with_source(err)
        })?;

        {
            let mut open = open_environments()
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());
            if !open.insert(canonical.clone()) {
                return Err(Error::new(ErrorKind::Conflict)
                    .with_message("queue environment is already open in this process")
                    .with_path(&canonical)
                    .with_hint("share the existing Environment instead of opening a second one"));
            }
        }

        // Safety contract of `EnvOpenOptions::open`: the same environment must
        // not be mapped twice in one process. The registry insert above
        // guarantees exclusivity until this `Store` drops.
        let opened = unsafe {
            EnvOpenOptions::new()
                .map_size(options.map_size_bytes)
                .max_dbs(options.max_dbs)
                .max_readers(options.max_readers)
                .open(&canonical)
        };
        let env = match opened {
            Ok(env) => env,
            Err(err) => {
                let mut open = open_environments()
                    .lock()
                    .unwrap_or_else(|poison| poison.into_inner());
                open.remove(&canonical);
                return Err(map_store_error(err).with_path(&canonical));
            }
        };
        Ok(Self {
            env,
            path: canonical,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_txn(&self) -> Result<RoTxn<'_>, Error> {
        self.env
            .read_txn()
            .map_err(|err| map_store_error(err).with_path(&self.path))
    }

    pub fn write_txn(&self) -> Result<RwTxn<'_>, Error> {
        self.env
            .write_txn()
            .map_err(|err| map_store_error(err).with_path(&self.path))
    }

    pub fn commit(&self, txn: RwTxn<'_>) -> Result<(), Error> {
        txn.commit()
            .map_err(|err| map_store_error(err).with_path(&self.path))
    }

    /// Open a named sub-database, creating it when absent.
    pub fn create_db<KC: 'static, DC: 'static>(
        &self,
        txn: &mut RwTxn<'_>,
        name: &str,
    ) -> Result<Database<KC, DC>, Error> {
        self.env
            .create_database::<KC, DC>(txn, Some(name))
            .map_err(|err| map_store_error(err).with_path(&self.path).with_key(name))
    }

    /// Open a named sub-database that must already exist.
    pub fn open_db<KC: 'static, DC: 'static>(
        &self,
        txn: &RoTxn<'_>,
        name: &str,
    ) -> Result<Option<Database<KC, DC>>, Error> {
        self.env
            .open_database::<KC, DC>(txn, Some(name))
            .map_err(|err| map_store_error(err).with_path(&self.path).with_key(name))
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let mut open = open_environments()
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        open.remove(&self.path);
    }
}

/// Approximate on-disk size of one sub-database: page size times used pages.
pub fn approximate_db_size(stat: &DatabaseStat) -> u64 {
    stat.page_size as u64
        * (stat.branch_pages as u64 + stat.leaf_pages as u64 + stat.overflow_pages as u64)
}

pub fn map_store_error(err: heed::Error) -> Error {
    let kind = match &err {
        heed::Error::Mdb(heed::MdbError::MapFull) => ErrorKind::MapFull,
        heed::Error::Io(_) => ErrorKind::Io,
        _ => ErrorKind::Store,
    };
    let base = Error::new(kind).with_source(err);
    match kind {
        ErrorKind::MapFull => base
            .with_message("store map is full")
            .with_hint("enlarge max_db_size_bytes for this queue"),
        _ => base.with_message("key/value store failure"),
    }
}
