//! Purpose: Per-process construction of queue components over one directory.
//! Exports: `Environment`, `EnvironmentOptions`.
//! Role: Factory for control, publisher, and subscriber handles.
//! Invariants: At most one live environment per queue directory per process;
//! the store's canonical-path registry refuses a second open with `Conflict`.
//! Invariants: Handles must never cross a fork; the LMDB lock table is
//! per-process state.
use std::path::Path;
use std::sync::Arc;

use crate::core::control::Control;
use crate::core::error::{Error, ErrorKind};
use crate::core::queue::{Queue, QueueCell};
use crate::core::schema;
use crate::core::store::{Store, StoreOptions};

use super::publisher::Publisher;
use super::subscriber::Subscriber;

/// Environment open limits, written once per queue directory creation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EnvironmentOptions {
    pub max_reader_num: u32,
    pub max_db_num: u32,
    pub max_db_size_bytes: usize,
}

impl Default for EnvironmentOptions {
    fn default() -> Self {
        Self {
            max_reader_num: schema::DEFAULT_MAX_READERS,
            max_db_num: schema::DEFAULT_MAX_DBS,
            max_db_size_bytes: schema::DEFAULT_MAP_SIZE_BYTES,
        }
    }
}

/// The per-process handle to one on-disk queue. Clones share the same
/// underlying environment; the queue stays registered as open until the last
/// handle derived from it is gone.
#[derive(Clone, Debug)]
pub struct Environment {
    cell: Arc<QueueCell>,
}

impl Environment {
    /// Open the queue directory with default limits, creating the directory
    /// when absent.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::with_options(path, EnvironmentOptions::default())
    }

    pub fn with_options(
        path: impl AsRef<Path>,
        options: EnvironmentOptions,
    ) -> Result<Self, Error> {
        let path = path.as_ref();
        std::fs::create_dir_all(path).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to create queue directory")
                .with_path(path)
                .with_source(err)
        })?;
        let store_options = StoreOptions {
            map_size_bytes: options.max_db_size_bytes,
            max_dbs: options.max_db_num,
            max_readers: options.max_reader_num,
        };
        let store = Arc::new(Store::open(path, store_options)?);
        Ok(Self {
            cell: Arc::new(QueueCell::new(store)),
        })
    }

    pub fn path(&self) -> &Path {
        self.cell.store().path()
    }

    /// Administrative handle; works before the queue is initialized.
    pub fn control(&self) -> Control {
        Control::new(Arc::clone(&self.cell))
    }

    /// Direct engine access for embedders that need counts, sizes, or raw
    /// front/pop. Fails with `NotInitialized` until the control plane has
    /// written the parameter records.
    pub fn queue(&self) -> Result<Arc<Queue>, Error> {
        self.cell.get_or_open()
    }

    /// Publisher over the queue's configured subscriber set, captured now.
    /// Defaults to autosync: one committed transaction per message.
    pub fn publisher(&self) -> Result<Publisher, Error> {
        self.publisher_with(true)
    }

    /// Publisher with explicit autosync choice: `true` commits one
    /// transaction per message, `false` batches `send_many` into one.
    pub fn publisher_with(&self, autosync: bool) -> Result<Publisher, Error> {
        let queue = self.queue()?;
        let subscriber_ids = queue.subscriber_ids();
        Ok(Publisher::new(queue, subscriber_ids, autosync))
    }

    pub fn subscriber(&self, sub_id: impl Into<String>) -> Result<Subscriber, Error> {
        let sub_id = sub_id.into();
        schema::validate_subscriber_id(&sub_id)?;
        Ok(Subscriber::new(self.queue()?, sub_id))
    }
}
