//! Purpose: The queue engine: put/front/pop, pending bookkeeping, and vacuum.
//! Exports: `Queue`, `QueueCell`, `FrontMessage`, `VacuumStats`, `ConsistencyReport`.
//! Role: Encodes a multi-subscriber FIFO atop ordered LMDB sub-databases.
//! Invariants: Every mutation runs in exactly one write transaction.
//! Invariants: Vacuum executes at the top of every publisher write transaction.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};

use heed::{RoTxn, RwTxn};

use crate::core::error::{Error, ErrorKind};
use crate::core::schema::{self, HighWaterMark, Strategy};
use crate::core::store::{approximate_db_size, map_store_error, MarkDb, PayloadDb, Store, TextDb};

/// Shared sub-database handles, opened once per process.
#[derive(Clone, Copy, Debug)]
pub struct QueueDbs {
    pub data: PayloadDb,
    pub meta: TextDb,
    pub pending: TextDb,
    pub params: TextDb,
}

/// In-memory copy of the `queue_db` parameter records.
#[derive(Clone, Debug)]
pub struct QueueParams {
    pub hwm: HighWaterMark,
    pub strategy: Strategy,
    pub subscriber_ids: BTreeSet<String>,
}

/// The oldest undelivered message of one subscriber, copied out of the read
/// transaction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FrontMessage {
    pub msg_id: String,
    pub payload: Vec<u8>,
}

/// What one vacuum pass removed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VacuumStats {
    pub dangling_reclaimed: u64,
    pub overflow_pruned: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConsistencyIssue {
    pub code: String,
    pub message: String,
    pub msg_id: Option<String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConsistencyReport {
    pub issues: Vec<ConsistencyIssue>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.issues.is_empty()
    }

    fn push(&mut self, code: &str, message: impl Into<String>, msg_id: Option<&str>) {
        self.issues.push(ConsistencyIssue {
            code: code.to_string(),
            message: message.into(),
            msg_id: msg_id.map(str::to_string),
        });
    }
}

#[derive(Debug)]
pub struct Queue {
    store: Arc<Store>,
    dbs: QueueDbs,
    params: RwLock<QueueParams>,
}

impl Queue {
    /// Open an initialized queue: all shared sub-databases and the five
    /// parameter records must exist.
    pub(crate) fn open(store: Arc<Store>) -> Result<Self, Error> {
        let txn = store.read_txn()?;
        let dbs = open_queue_dbs(&store, &txn)?;
        let params = read_params(&store, &txn, &dbs)?;
        drop(txn);
        Ok(Self {
            store,
            dbs,
            params: RwLock::new(params),
        })
    }

    pub fn hwm(&self) -> HighWaterMark {
        self.read_params().hwm
    }

    pub fn strategy(&self) -> Strategy {
        self.read_params().strategy
    }

    pub fn subscriber_ids(&self) -> BTreeSet<String> {
        self.read_params().subscriber_ids.clone()
    }

    /// Re-read the parameter records, picking up control-plane changes.
    pub fn reload_params(&self) -> Result<(), Error> {
        let txn = self.store.read_txn()?;
        let fresh = read_params(&self.store, &txn, &self.dbs)?;
        drop(txn);
        let mut guard = self
            .params
            .write()
            .unwrap_or_else(|poison| poison.into_inner());
        *guard = fresh;
        Ok(())
    }

    fn read_params(&self) -> QueueParams {
        self.params
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }

    fn store_err(&self, err: heed::Error) -> Error {
        map_store_error(err).with_path(self.store.path())
    }

    fn sub_db(&self, txn: &RoTxn<'_>, sub_id: &str) -> Result<MarkDb, Error> {
        match self.store.open_db::<heed::types::Str, heed::types::Unit>(txn, sub_id)? {
            Some(db) => Ok(db),
            None => Err(Error::new(ErrorKind::Usage)
                .with_message("subscriber has no sub-database in this queue")
                .with_path(self.store.path())
                .with_subscriber(sub_id)
                .with_hint("add the subscriber through the control plane first")),
        }
    }

    /// Append one message for the given subscribers. Vacuum runs first inside
    /// the same write transaction; the whole operation commits or aborts as
    /// one unit.
    pub fn put(&self, payload: &[u8], subscriber_ids: &BTreeSet<String>) -> Result<String, Error> {
        let mut txn = self.store.write_txn()?;
        self.vacuum(&mut txn)?;
        let timestamp = schema::now_secs();
        let msg_id = schema::msg_id(timestamp);
        self.write_message(&mut txn, &msg_id, timestamp, payload, subscriber_ids)?;
        self.store.commit(txn)?;
        Ok(msg_id)
    }

    /// Append a batch under one write transaction and one shared timestamp.
    /// Each message gets its own UUID suffix, so delivery order within the
    /// batch is unspecified.
    pub fn put_many<P: AsRef<[u8]>>(
        &self,
        payloads: &[P],
        subscriber_ids: &BTreeSet<String>,
    ) -> Result<Vec<String>, Error> {
        let mut txn = self.store.write_txn()?;
        self.vacuum(&mut txn)?;
        let timestamp = schema::now_secs();
        let mut msg_ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let msg_id = schema::msg_id(timestamp);
            self.write_message(&mut txn, &msg_id, timestamp, payload.as_ref(), subscriber_ids)?;
            msg_ids.push(msg_id);
        }
        self.store.commit(txn)?;
        Ok(msg_ids)
    }

    fn write_message(
        &self,
        txn: &mut RwTxn<'_>,
        msg_id: &str,
        timestamp: u64,
        payload: &[u8],
        subscriber_ids: &BTreeSet<String>,
    ) -> Result<(), Error> {
        let sub_dbs: Vec<MarkDb> = subscriber_ids
            .iter()
            .map(|id| self.sub_db(txn, id))
            .collect::<Result<_, _>>()?;

        self.dbs
            .pending
            .put(txn, msg_id, &schema::encode_u64(subscriber_ids.len() as u64))
            .map_err(|err| self.store_err(err))?;
        self.dbs
            .meta
            .put(txn, msg_id, &schema::encode_u64(timestamp))
            .map_err(|err| self.store_err(err))?;
        self.dbs
            .data
            .put(txn, msg_id, payload)
            .map_err(|err| self.store_err(err))?;
        for db in &sub_dbs {
            db.put(txn, msg_id, &())
                .map_err(|err| self.store_err(err))?;
        }
        Ok(())
    }

    /// Peek at the oldest message of one subscriber. A missing data record
    /// reads as `None`: the message was reclaimed between the sub-database
    /// walk and the payload lookup, and the caller should retry.
    pub fn front(&self, sub_id: &str) -> Result<Option<FrontMessage>, Error> {
        let txn = self.store.read_txn()?;
        let sub_db = self.sub_db(&txn, sub_id)?;
        let first = sub_db.first(&txn).map_err(|err| self.store_err(err))?;
        let msg_id = match first {
            Some((key, ())) => key.to_string(),
            None => return Ok(None),
        };
        let payload = self
            .dbs
            .data
            .get(&txn, &msg_id)
            .map_err(|err| self.store_err(err))?;
        Ok(payload.map(|bytes| FrontMessage {
            msg_id,
            payload: bytes.to_vec(),
        }))
    }

    /// Remove the oldest entry of one subscriber and decrement its pending
    /// count (floor zero). Popping an empty sub-database is a no-op; the
    /// returned flag tells strict callers whether anything was removed.
    pub fn pop(&self, sub_id: &str) -> Result<bool, Error> {
        let mut txn = self.store.write_txn()?;
        let sub_db = self.sub_db(&txn, sub_id)?;
        let msg_id = match sub_db.first(&txn).map_err(|err| self.store_err(err))? {
            Some((key, ())) => key.to_string(),
            None => return Ok(false),
        };
        sub_db
            .delete(&mut txn, &msg_id)
            .map_err(|err| self.store_err(err))?;
        self.decrement_pending(&mut txn, &msg_id)?;
        self.store.commit(txn)?;
        Ok(true)
    }

    fn decrement_pending(&self, txn: &mut RwTxn<'_>, msg_id: &str) -> Result<(), Error> {
        decrement_pending(&self.store, &self.dbs, txn, msg_id)
    }

    /// Drop every message of one subscriber except the newest, then return
    /// that newest payload. One write transaction covers all the pops.
    pub fn receive_to_top(&self, sub_id: &str) -> Result<Option<FrontMessage>, Error> {
        let mut txn = self.store.write_txn()?;
        let sub_db = self.sub_db(&txn, sub_id)?;
        let mut keys = Vec::new();
        {
            let iter = sub_db.iter(&txn).map_err(|err| self.store_err(err))?;
            for entry in iter {
                let (key, ()) = entry.map_err(|err| self.store_err(err))?;
                keys.push(key.to_string());
            }
        }
        if keys.len() > 1 {
            for msg_id in &keys[..keys.len() - 1] {
                sub_db
                    .delete(&mut txn, msg_id)
                    .map_err(|err| self.store_err(err))?;
                self.decrement_pending(&mut txn, msg_id)?;
            }
            self.store.commit(txn)?;
        } else {
            drop(txn);
        }
        self.front(sub_id)
    }

    /// Number of messages currently stored (entries of `meta_db`).
    pub fn count_msgs(&self) -> Result<u64, Error> {
        let txn = self.store.read_txn()?;
        self.dbs.meta.len(&txn).map_err(|err| self.store_err(err))
    }

    /// Approximate size of the payload sub-database in bytes.
    pub fn data_size_bytes(&self) -> Result<u64, Error> {
        let txn = self.store.read_txn()?;
        let stat = self
            .dbs
            .data
            .stat(&txn)
            .map_err(|err| self.store_err(err))?;
        Ok(approximate_db_size(&stat))
    }

    /// Run the dangling-reclamation half of vacuum in its own transaction.
    pub fn prune_dangling_messages(&self) -> Result<VacuumStats, Error> {
        let mut txn = self.store.write_txn()?;
        let reclaimed = self.reclaim_dangling(&mut txn)?;
        self.store.commit(txn)?;
        Ok(VacuumStats {
            dangling_reclaimed: reclaimed,
            overflow_pruned: 0,
        })
    }

    /// Combined reclamation and overflow pruning, inside the caller's write
    /// transaction. Idempotent: a second pass with no intervening writes
    /// removes nothing.
    pub(crate) fn vacuum(&self, txn: &mut RwTxn<'_>) -> Result<VacuumStats, Error> {
        let mut stats = VacuumStats {
            dangling_reclaimed: self.reclaim_dangling(txn)?,
            overflow_pruned: 0,
        };
        let hwm = self.hwm();

        let count = self.dbs.meta.len(txn).map_err(|err| self.store_err(err))?;
        if count >= hwm.max_msgs_num {
            stats.overflow_pruned += self.prune_half(txn)?;
        }
        let stat = self.dbs.data.stat(txn).map_err(|err| self.store_err(err))?;
        if approximate_db_size(&stat) >= hwm.hwm_db_size_bytes {
            stats.overflow_pruned += self.prune_half(txn)?;
        }
        Ok(stats)
    }

    /// Dangling messages have no pending subscribers or outlived
    /// `msg_timeout_secs`. The age scan walks `meta_db`, where the creation
    /// timestamps live.
    fn reclaim_dangling(&self, txn: &mut RwTxn<'_>) -> Result<u64, Error> {
        let params = self.read_params();
        let mut dangling = BTreeSet::new();

        {
            let iter = self
                .dbs
                .pending
                .iter(txn)
                .map_err(|err| self.store_err(err))?;
            for entry in iter {
                let (msg_id, count) = entry.map_err(|err| self.store_err(err))?;
                if schema::parse_u64(count, msg_id)? == 0 {
                    dangling.insert(msg_id.to_string());
                }
            }
        }
        {
            let now = schema::now_secs();
            let iter = self.dbs.meta.iter(txn).map_err(|err| self.store_err(err))?;
            for entry in iter {
                let (msg_id, timestamp) = entry.map_err(|err| self.store_err(err))?;
                let age = now.saturating_sub(schema::parse_u64(timestamp, msg_id)?);
                if age > params.hwm.msg_timeout_secs {
                    dangling.insert(msg_id.to_string());
                }
            }
        }

        self.delete_everywhere(txn, &dangling, &params.subscriber_ids)?;
        Ok(dangling.len() as u64)
    }

    /// Remove the lexicographically smallest (`prune_first`) or largest
    /// (`prune_last`) ⌈N/2⌉ keys of `meta_db` from every sub-database.
    fn prune_half(&self, txn: &mut RwTxn<'_>) -> Result<u64, Error> {
        let params = self.read_params();
        let entries = self.dbs.meta.len(txn).map_err(|err| self.store_err(err))? as usize;
        if entries == 0 {
            return Ok(0);
        }
        let take = entries.div_ceil(2);

        let mut victims = BTreeSet::new();
        {
            match params.strategy {
                Strategy::PruneFirst => {
                    let iter = self.dbs.meta.iter(txn).map_err(|err| self.store_err(err))?;
                    for entry in iter {
                        let (msg_id, _) = entry.map_err(|err| self.store_err(err))?;
                        victims.insert(msg_id.to_string());
                        if victims.len() == take {
                            break;
                        }
                    }
                }
                Strategy::PruneLast => {
                    let iter = self
                        .dbs
                        .meta
                        .rev_iter(txn)
                        .map_err(|err| self.store_err(err))?;
                    for entry in iter {
                        let (msg_id, _) = entry.map_err(|err| self.store_err(err))?;
                        victims.insert(msg_id.to_string());
                        if victims.len() == take {
                            break;
                        }
                    }
                }
            }
        }

        self.delete_everywhere(txn, &victims, &params.subscriber_ids)?;
        Ok(victims.len() as u64)
    }

    fn delete_everywhere(
        &self,
        txn: &mut RwTxn<'_>,
        msg_ids: &BTreeSet<String>,
        subscriber_ids: &BTreeSet<String>,
    ) -> Result<(), Error> {
        if msg_ids.is_empty() {
            return Ok(());
        }
        let sub_dbs: Vec<MarkDb> = subscriber_ids
            .iter()
            .map(|id| self.sub_db(txn, id))
            .collect::<Result<_, _>>()?;
        for msg_id in msg_ids {
            self.dbs
                .pending
                .delete(txn, msg_id)
                .map_err(|err| self.store_err(err))?;
            self.dbs
                .meta
                .delete(txn, msg_id)
                .map_err(|err| self.store_err(err))?;
            self.dbs
                .data
                .delete(txn, msg_id)
                .map_err(|err| self.store_err(err))?;
            for db in &sub_dbs {
                db.delete(txn, msg_id)
                    .map_err(|err| self.store_err(err))?;
            }
        }
        Ok(())
    }

    /// Verify the cross-database invariants under one read transaction:
    /// every pending message is backed by data and meta records, every
    /// queued message is pending, and pending counts match the number of
    /// subscriber sub-databases still holding the key.
    pub fn check(&self) -> Result<ConsistencyReport, Error> {
        let params = self.read_params();
        let txn = self.store.read_txn()?;
        let mut report = ConsistencyReport::default();

        let mut held_by: BTreeMap<String, u64> = BTreeMap::new();
        for sub_id in &params.subscriber_ids {
            let sub_db = match self
                .store
                .open_db::<heed::types::Str, heed::types::Unit>(&txn, sub_id)?
            {
                Some(db) => db,
                None => {
                    report.push(
                        "missing-sub-db",
                        format!("subscriber '{sub_id}' is listed but has no sub-database"),
                        None,
                    );
                    continue;
                }
            };
            let iter = sub_db.iter(&txn).map_err(|err| self.store_err(err))?;
            for entry in iter {
                let (msg_id, ()) = entry.map_err(|err| self.store_err(err))?;
                *held_by.entry(msg_id.to_string()).or_insert(0) += 1;
                let in_data = self
                    .dbs
                    .data
                    .get(&txn, msg_id)
                    .map_err(|err| self.store_err(err))?
                    .is_some();
                let in_meta = self
                    .dbs
                    .meta
                    .get(&txn, msg_id)
                    .map_err(|err| self.store_err(err))?
                    .is_some();
                if !in_data || !in_meta {
                    report.push(
                        "queued-without-record",
                        format!("message queued for '{sub_id}' lacks data or meta records"),
                        Some(msg_id),
                    );
                }
            }
        }

        let iter = self
            .dbs
            .pending
            .iter(&txn)
            .map_err(|err| self.store_err(err))?;
        let mut pending_seen = BTreeSet::new();
        for entry in iter {
            let (msg_id, count) = entry.map_err(|err| self.store_err(err))?;
            let count = schema::parse_u64(count, msg_id)?;
            pending_seen.insert(msg_id.to_string());
            if count > 0 {
                let in_data = self
                    .dbs
                    .data
                    .get(&txn, msg_id)
                    .map_err(|err| self.store_err(err))?
                    .is_some();
                let in_meta = self
                    .dbs
                    .meta
                    .get(&txn, msg_id)
                    .map_err(|err| self.store_err(err))?
                    .is_some();
                if !in_data || !in_meta {
                    report.push(
                        "pending-without-record",
                        "pending message lacks data or meta records",
                        Some(msg_id),
                    );
                }
            }
            let held = held_by.get(msg_id).copied().unwrap_or(0);
            if held != count {
                report.push(
                    "pending-count-mismatch",
                    format!("pending count {count} but {held} subscriber queue(s) hold the key"),
                    Some(msg_id),
                );
            }
        }

        for (msg_id, _) in held_by {
            if !pending_seen.contains(&msg_id) {
                report.push(
                    "queued-without-pending",
                    "message queued for a subscriber has no pending record",
                    Some(msg_id.as_str()),
                );
            }
        }

        Ok(report)
    }
}

/// Lazily-opened engine shared by the environment and its control plane.
/// The queue can only open once the parameter records exist, so the factory
/// defers opening until first use and the control plane refreshes cached
/// parameters after rewriting them.
#[derive(Debug)]
pub struct QueueCell {
    store: Arc<Store>,
    cell: Mutex<Option<Arc<Queue>>>,
}

impl QueueCell {
    pub(crate) fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            cell: Mutex::new(None),
        }
    }

    pub(crate) fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn get_or_open(&self) -> Result<Arc<Queue>, Error> {
        let mut guard = self.cell.lock().unwrap_or_else(|poison| poison.into_inner());
        if let Some(queue) = guard.as_ref() {
            return Ok(Arc::clone(queue));
        }
        let queue = Arc::new(Queue::open(Arc::clone(&self.store))?);
        *guard = Some(Arc::clone(&queue));
        Ok(queue)
    }

    /// Refresh cached parameters after a control-plane rewrite, if the
    /// engine is already open.
    pub fn reload_if_open(&self) -> Result<(), Error> {
        let guard = self.cell.lock().unwrap_or_else(|poison| poison.into_inner());
        if let Some(queue) = guard.as_ref() {
            queue.reload_params()?;
        }
        Ok(())
    }
}

/// Drop one subscriber's claim on a message, flooring the count at zero.
/// A missing pending record means vacuum already reclaimed the message.
pub(crate) fn decrement_pending(
    store: &Store,
    dbs: &QueueDbs,
    txn: &mut RwTxn<'_>,
    msg_id: &str,
) -> Result<(), Error> {
    let current = match dbs
        .pending
        .get(txn, msg_id)
        .map_err(|err| map_store_error(err).with_path(store.path()))?
    {
        Some(text) => schema::parse_u64(text, msg_id)?,
        None => return Ok(()),
    };
    let decremented = current.saturating_sub(1);
    dbs.pending
        .put(txn, msg_id, &schema::encode_u64(decremented))
        .map_err(|err| map_store_error(err).with_path(store.path()))?;
    Ok(())
}

pub(crate) fn open_queue_dbs(store: &Store, txn: &RoTxn<'_>) -> Result<QueueDbs, Error> {
    let missing = |name: &str| {
        Error::new(ErrorKind::NotInitialized)
            .with_message("queue sub-database is missing")
            .with_path(store.path())
            .with_key(name)
            .with_hint("run initialize on this queue first")
    };
    let data = store
        .open_db::<heed::types::Str, heed::types::Bytes>(txn, schema::DATA_DB)?
        .ok_or_else(|| missing(schema::DATA_DB))?;
    let meta = store
        .open_db::<heed::types::Str, heed::types::Str>(txn, schema::META_DB)?
        .ok_or_else(|| missing(schema::META_DB))?;
    let pending = store
        .open_db::<heed::types::Str, heed::types::Str>(txn, schema::PENDING_DB)?
        .ok_or_else(|| missing(schema::PENDING_DB))?;
    let params = store
        .open_db::<heed::types::Str, heed::types::Str>(txn, schema::QUEUE_DB)?
        .ok_or_else(|| missing(schema::QUEUE_DB))?;
    Ok(QueueDbs {
        data,
        meta,
        pending,
        params,
    })
}

pub(crate) fn read_params(
    store: &Store,
    txn: &RoTxn<'_>,
    dbs: &QueueDbs,
) -> Result<QueueParams, Error> {
    let read = |key: &str| -> Result<String, Error> {
        let value = dbs
            .params
            .get(txn, key)
            .map_err(|err| map_store_error(err).with_path(store.path()))?;
        match value {
            Some(text) => Ok(text.to_string()),
            None => Err(Error::new(ErrorKind::NotInitialized)
                .with_message("queue parameter record is missing")
                .with_path(store.path())
                .with_key(key)
                .with_hint("run initialize on this queue first")),
        }
    };

    let hwm = HighWaterMark {
        msg_timeout_secs: schema::parse_u64(
            &read(schema::MSG_TIMEOUT_SECS_KEY)?,
            schema::MSG_TIMEOUT_SECS_KEY,
        )?,
        max_msgs_num: schema::parse_u64(&read(schema::MAX_MSGS_NUM_KEY)?, schema::MAX_MSGS_NUM_KEY)?,
        hwm_db_size_bytes: schema::parse_u64(
            &read(schema::HWM_DB_SIZE_BYTES_KEY)?,
            schema::HWM_DB_SIZE_BYTES_KEY,
        )?,
    };
    let strategy = Strategy::parse(&read(schema::STRATEGY_KEY)?)?;
    let subscriber_ids = schema::decode_subscriber_ids(&read(schema::SUBSCRIBER_IDS_KEY)?);

    Ok(QueueParams {
        hwm,
        strategy,
        subscriber_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::control::Control;
    use crate::core::store::StoreOptions;

    fn subs(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn open_queue(dir: &std::path::Path, ids: &[&str]) -> (Arc<QueueCell>, Arc<Queue>) {
        open_queue_with(dir, ids, HighWaterMark::default(), Strategy::PruneFirst)
    }

    fn open_queue_with(
        dir: &std::path::Path,
        ids: &[&str],
        hwm: HighWaterMark,
        strategy: Strategy,
    ) -> (Arc<QueueCell>, Arc<Queue>) {
        let options = StoreOptions {
            map_size_bytes: 10 * 1024 * 1024,
            max_dbs: 32,
            max_readers: 16,
        };
        let store = Arc::new(Store::open(dir, options).expect("open store"));
        let cell = Arc::new(QueueCell::new(store));
        Control::new(Arc::clone(&cell))
            .initialize(&subs(ids), hwm, strategy)
            .expect("initialize");
        let queue = cell.get_or_open().expect("open queue");
        (cell, queue)
    }

    /// Write a message with a chosen timestamp, bypassing vacuum, so ordering
    /// tests do not depend on the wall clock.
    fn put_at(queue: &Queue, timestamp: u64, payload: &[u8], ids: &BTreeSet<String>) -> String {
        let mut txn = queue.store.write_txn().expect("write txn");
        let msg_id = schema::msg_id(timestamp);
        queue
            .write_message(&mut txn, &msg_id, timestamp, payload, ids)
            .expect("write message");
        queue.store.commit(txn).expect("commit");
        msg_id
    }

    fn dump_state(queue: &Queue) -> BTreeMap<String, Vec<(String, String)>> {
        let txn = queue.store.read_txn().expect("read txn");
        let mut dump: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();

        let mut meta = Vec::new();
        for entry in queue.dbs.meta.iter(&txn).expect("meta iter") {
            let (k, v) = entry.expect("meta entry");
            meta.push((k.to_string(), v.to_string()));
        }
        dump.insert("meta".to_string(), meta);

        let mut pending = Vec::new();
        for entry in queue.dbs.pending.iter(&txn).expect("pending iter") {
            let (k, v) = entry.expect("pending entry");
            pending.push((k.to_string(), v.to_string()));
        }
        dump.insert("pending".to_string(), pending);

        let mut data = Vec::new();
        for entry in queue.dbs.data.iter(&txn).expect("data iter") {
            let (k, v) = entry.expect("data entry");
            data.push((k.to_string(), format!("{v:?}")));
        }
        dump.insert("data".to_string(), data);

        for sub_id in queue.subscriber_ids() {
            let sub_db = queue.sub_db(&txn, &sub_id).expect("sub db");
            let mut held = Vec::new();
            for entry in sub_db.iter(&txn).expect("sub iter") {
                let (k, ()) = entry.expect("sub entry");
                held.push((k.to_string(), String::new()));
            }
            dump.insert(format!("sub:{sub_id}"), held);
        }
        dump
    }

    #[test]
    fn put_front_pop_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_cell, queue) = open_queue(dir.path(), &["sub"]);

        queue.put(b"Hello there!", &subs(&["sub"])).expect("put");
        let front = queue.front("sub").expect("front").expect("message");
        assert_eq!(front.payload, b"Hello there!");

        assert!(queue.pop("sub").expect("pop"));
        assert!(queue.front("sub").expect("front").is_none());
    }

    #[test]
    fn broadcast_pops_are_independent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_cell, queue) = open_queue(dir.path(), &["sub1", "sub2"]);
        let ids = subs(&["sub1", "sub2"]);

        queue.put(b"I'm a message.\n", &ids).expect("put");
        assert_eq!(
            queue.front("sub1").expect("front").expect("m").payload,
            b"I'm a message.\n"
        );
        assert_eq!(
            queue.front("sub2").expect("front").expect("m").payload,
            b"I'm a message.\n"
        );

        queue.pop("sub1").expect("pop");
        assert!(queue.front("sub1").expect("front").is_none());
        assert_eq!(
            queue.front("sub2").expect("front").expect("m").payload,
            b"I'm a message.\n"
        );

        let report = queue.check().expect("check");
        assert!(report.is_consistent(), "issues: {:?}", report.issues);
    }

    #[test]
    fn delivery_follows_msg_id_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_cell, queue) = open_queue(dir.path(), &["sub"]);
        let ids = subs(&["sub"]);

        let now = schema::now_secs();
        let first = put_at(&queue, now - 3, b"a", &ids);
        let second = put_at(&queue, now - 2, b"b", &ids);
        let third = put_at(&queue, now - 1, b"c", &ids);
        assert!(first < second && second < third);

        for expected in [b"a", b"b", b"c"] {
            let front = queue.front("sub").expect("front").expect("message");
            assert_eq!(front.payload, expected);
            queue.pop("sub").expect("pop");
        }
        assert!(queue.front("sub").expect("front").is_none());
    }

    #[test]
    fn put_many_is_one_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_cell, queue) = open_queue(dir.path(), &["sub"]);
        let ids = subs(&["sub"]);

        let msg_ids = queue
            .put_many(&[b"What's up?".as_slice(), b"Do you like the README?"], &ids)
            .expect("put_many");
        assert_eq!(msg_ids.len(), 2);
        assert_eq!(queue.count_msgs().expect("count"), 2);

        let mut seen = Vec::new();
        for _ in 0..2 {
            let front = queue.front("sub").expect("front").expect("message");
            seen.push(front.payload);
            queue.pop("sub").expect("pop");
        }
        seen.sort();
        let mut expected = vec![b"Do you like the README?".to_vec(), b"What's up?".to_vec()];
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn pop_on_empty_is_a_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_cell, queue) = open_queue(dir.path(), &["sub"]);
        assert!(!queue.pop("sub").expect("pop"));
    }

    #[test]
    fn pending_count_floors_at_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_cell, queue) = open_queue(dir.path(), &["sub"]);
        let ids = subs(&["sub"]);

        let msg_id = queue.put(b"once", &ids).expect("put");
        assert!(queue.pop("sub").expect("pop"));
        assert!(!queue.pop("sub").expect("second pop"));

        let txn = queue.store.read_txn().expect("read txn");
        let pending = queue
            .dbs
            .pending
            .get(&txn, &msg_id)
            .expect("get")
            .expect("entry");
        assert_eq!(pending, "0");
    }

    #[test]
    fn popped_message_is_reclaimed_by_vacuum() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_cell, queue) = open_queue(dir.path(), &["sub"]);
        let ids = subs(&["sub"]);

        queue.put(b"gone soon", &ids).expect("put");
        queue.pop("sub").expect("pop");

        let stats = queue.prune_dangling_messages().expect("prune");
        assert_eq!(stats.dangling_reclaimed, 1);
        assert_eq!(queue.count_msgs().expect("count"), 0);
        assert_eq!(queue.front("sub").expect("front"), None);
    }

    #[test]
    fn timed_out_message_is_reclaimed_everywhere() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_cell, queue) = open_queue(dir.path(), &["sub"]);
        let ids = subs(&["sub"]);

        // Timestamp far in the past: age exceeds any timeout.
        put_at(&queue, 0, b"stale", &ids);
        assert_eq!(queue.count_msgs().expect("count"), 1);

        let stats = queue.prune_dangling_messages().expect("prune");
        assert_eq!(stats.dangling_reclaimed, 1);
        assert_eq!(queue.count_msgs().expect("count"), 0);
        assert!(queue.front("sub").expect("front").is_none());

        let report = queue.check().expect("check");
        assert!(report.is_consistent(), "issues: {:?}", report.issues);
    }

    #[test]
    fn vacuum_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_cell, queue) = open_queue(dir.path(), &["sub"]);
        let ids = subs(&["sub"]);

        let now = schema::now_secs();
        put_at(&queue, now, b"keep", &ids);
        put_at(&queue, 0, b"stale", &ids);

        let mut txn = queue.store.write_txn().expect("txn");
        queue.vacuum(&mut txn).expect("vacuum once");
        queue.store.commit(txn).expect("commit");
        let once = dump_state(&queue);

        let mut txn = queue.store.write_txn().expect("txn");
        let stats = queue.vacuum(&mut txn).expect("vacuum twice");
        queue.store.commit(txn).expect("commit");
        let twice = dump_state(&queue);

        assert_eq!(stats, VacuumStats::default());
        assert_eq!(once, twice);
    }

    #[test]
    fn overflow_prune_first_keeps_newest_half() {
        let dir = tempfile::tempdir().expect("tempdir");
        let hwm = HighWaterMark {
            max_msgs_num: 4,
            ..HighWaterMark::default()
        };
        let (_cell, queue) = open_queue_with(dir.path(), &["sub"], hwm, Strategy::PruneFirst);
        let ids = subs(&["sub"]);

        let now = schema::now_secs();
        for (i, payload) in [b"1", b"2", b"3", b"4", b"5"].iter().enumerate() {
            put_at(&queue, now - 10 + i as u64, *payload, &ids);
        }

        let mut txn = queue.store.write_txn().expect("txn");
        let stats = queue.vacuum(&mut txn).expect("vacuum");
        queue.store.commit(txn).expect("commit");

        assert_eq!(stats.overflow_pruned, 3);
        assert_eq!(queue.count_msgs().expect("count"), 2);
        let mut remaining = Vec::new();
        while let Some(front) = queue.front("sub").expect("front") {
            remaining.push(front.payload);
            queue.pop("sub").expect("pop");
        }
        assert_eq!(remaining, vec![b"4".to_vec(), b"5".to_vec()]);
    }

    #[test]
    fn overflow_prune_last_keeps_oldest_half() {
        let dir = tempfile::tempdir().expect("tempdir");
        let hwm = HighWaterMark {
            max_msgs_num: 4,
            ..HighWaterMark::default()
        };
        let (_cell, queue) = open_queue_with(dir.path(), &["sub"], hwm, Strategy::PruneLast);
        let ids = subs(&["sub"]);

        let now = schema::now_secs();
        for (i, payload) in [b"1", b"2", b"3", b"4", b"5"].iter().enumerate() {
            put_at(&queue, now - 10 + i as u64, *payload, &ids);
        }

        let mut txn = queue.store.write_txn().expect("txn");
        let stats = queue.vacuum(&mut txn).expect("vacuum");
        queue.store.commit(txn).expect("commit");

        assert_eq!(stats.overflow_pruned, 3);
        let mut remaining = Vec::new();
        while let Some(front) = queue.front("sub").expect("front") {
            remaining.push(front.payload);
            queue.pop("sub").expect("pop");
        }
        assert_eq!(remaining, vec![b"1".to_vec(), b"2".to_vec()]);
    }

    #[test]
    fn successive_puts_converge_below_the_mark() {
        let dir = tempfile::tempdir().expect("tempdir");
        let hwm = HighWaterMark {
            max_msgs_num: 4,
            ..HighWaterMark::default()
        };
        let (_cell, queue) = open_queue_with(dir.path(), &["sub"], hwm, Strategy::PruneFirst);
        let ids = subs(&["sub"]);

        for i in 0..10u8 {
            queue.put(&[i], &ids).expect("put");
            assert!(queue.count_msgs().expect("count") <= 4);
        }
    }

    #[test]
    fn front_reads_missing_data_as_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_cell, queue) = open_queue(dir.path(), &["sub"]);
        let ids = subs(&["sub"]);

        let msg_id = queue.put(b"vanishing", &ids).expect("put");
        let mut txn = queue.store.write_txn().expect("txn");
        queue.dbs.data.delete(&mut txn, &msg_id).expect("delete");
        queue.store.commit(txn).expect("commit");

        assert!(queue.front("sub").expect("front").is_none());
    }

    #[test]
    fn receive_to_top_keeps_only_newest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_cell, queue) = open_queue(dir.path(), &["sub"]);
        let ids = subs(&["sub"]);

        let now = schema::now_secs();
        put_at(&queue, now - 3, b"a", &ids);
        put_at(&queue, now - 2, b"b", &ids);
        put_at(&queue, now - 1, b"c", &ids);

        let top = queue.receive_to_top("sub").expect("top").expect("message");
        assert_eq!(top.payload, b"c");

        queue.pop("sub").expect("pop");
        assert!(queue.front("sub").expect("front").is_none());

        let report = queue.check().expect("check");
        assert!(report.is_consistent(), "issues: {:?}", report.issues);
    }

    #[test]
    fn receive_to_top_on_empty_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_cell, queue) = open_queue(dir.path(), &["sub"]);
        assert!(queue.receive_to_top("sub").expect("top").is_none());
    }

    #[test]
    fn check_flags_pending_count_mismatch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_cell, queue) = open_queue(dir.path(), &["sub"]);
        let ids = subs(&["sub"]);

        let msg_id = queue.put(b"skewed", &ids).expect("put");
        let mut txn = queue.store.write_txn().expect("txn");
        queue
            .dbs
            .pending
            .put(&mut txn, &msg_id, "5")
            .expect("pending rewrite");
        queue.store.commit(txn).expect("commit");

        let report = queue.check().expect("check");
        assert!(!report.is_consistent());
        assert!(report
            .issues
            .iter()
            .any(|issue| issue.code == "pending-count-mismatch"));
    }

    #[test]
    fn front_on_unknown_subscriber_is_usage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_cell, queue) = open_queue(dir.path(), &["sub"]);
        let err = queue.front("stranger").expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
