//! Purpose: Control plane: (re)initialize queue parameters and manage subscribers.
//! Exports: `Control`.
//! Role: Administrative operations over one queue directory.
//! Invariants: Every operation runs in a single write transaction and either
//! completes or leaves the queue untouched.
use std::collections::BTreeSet;
use std::sync::Arc;

use heed::types::{Bytes, Str, Unit};

use crate::core::error::Error;
use crate::core::queue::{
    decrement_pending, open_queue_dbs, read_params, ConsistencyReport, QueueCell, VacuumStats,
};
use crate::core::schema::{self, HighWaterMark, Strategy};
use crate::core::store::map_store_error;

#[derive(Debug)]
pub struct Control {
    cell: Arc<QueueCell>,
}

impl Control {
    pub(crate) fn new(cell: Arc<QueueCell>) -> Self {
        Self { cell }
    }

    /// Write the five parameter records and create every required
    /// sub-database. Re-initializing an existing queue rewrites the
    /// parameters and keeps stored messages; the returned flag reports
    /// whether that happened.
    pub fn initialize(
        &self,
        subscriber_ids: &BTreeSet<String>,
        hwm: HighWaterMark,
        strategy: Strategy,
    ) -> Result<bool, Error> {
        for id in subscriber_ids {
            schema::validate_subscriber_id(id)?;
        }
        let reinitialized = self.is_initialized()?;

        let store = self.cell.store();
        let mut txn = store.write_txn()?;
        store.create_db::<Str, Bytes>(&mut txn, schema::DATA_DB)?;
        store.create_db::<Str, Str>(&mut txn, schema::META_DB)?;
        store.create_db::<Str, Str>(&mut txn, schema::PENDING_DB)?;
        let params = store.create_db::<Str, Str>(&mut txn, schema::QUEUE_DB)?;
        for id in subscriber_ids {
            store.create_db::<Str, Unit>(&mut txn, id)?;
        }

        let put = |txn: &mut heed::RwTxn<'_>, key: &str, value: &str| {
            params
                .put(txn, key, value)
                .map_err(|err| map_store_error(err).with_path(store.path()))
        };
        put(
            &mut txn,
            schema::MSG_TIMEOUT_SECS_KEY,
            &schema::encode_u64(hwm.msg_timeout_secs),
        )?;
        put(
            &mut txn,
            schema::MAX_MSGS_NUM_KEY,
            &schema::encode_u64(hwm.max_msgs_num),
        )?;
        put(
            &mut txn,
            schema::HWM_DB_SIZE_BYTES_KEY,
            &schema::encode_u64(hwm.hwm_db_size_bytes),
        )?;
        put(&mut txn, schema::STRATEGY_KEY, strategy.as_str())?;
        put(
            &mut txn,
            schema::SUBSCRIBER_IDS_KEY,
            &schema::encode_subscriber_ids(subscriber_ids),
        )?;
        store.commit(txn)?;

        self.cell.reload_if_open()?;
        Ok(reinitialized)
    }

    /// True iff all five parameter records exist.
    pub fn is_initialized(&self) -> Result<bool, Error> {
        let store = self.cell.store();
        let txn = store.read_txn()?;
        let params = match store.open_db::<Str, Str>(&txn, schema::QUEUE_DB)? {
            Some(db) => db,
            None => return Ok(false),
        };
        let keys = [
            schema::MSG_TIMEOUT_SECS_KEY,
            schema::MAX_MSGS_NUM_KEY,
            schema::HWM_DB_SIZE_BYTES_KEY,
            schema::STRATEGY_KEY,
            schema::SUBSCRIBER_IDS_KEY,
        ];
        for key in keys {
            let present = params
                .get(&txn, key)
                .map_err(|err| map_store_error(err).with_path(store.path()))?
                .is_some();
            if !present {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Create a sub-database for the subscriber and append its id to the
    /// parameter record. The new subscriber sees only messages published
    /// after this commit.
    pub fn add_subscriber(&self, sub_id: &str) -> Result<(), Error> {
        schema::validate_subscriber_id(sub_id)?;
        let store = self.cell.store();
        let mut txn = store.write_txn()?;
        let dbs = open_queue_dbs(store, &txn)?;
        let params = read_params(store, &txn, &dbs)?;

        store.create_db::<Str, Unit>(&mut txn, sub_id)?;
        let mut ids = params.subscriber_ids;
        ids.insert(sub_id.to_string());
        dbs.params
            .put(
                &mut txn,
                schema::SUBSCRIBER_IDS_KEY,
                &schema::encode_subscriber_ids(&ids),
            )
            .map_err(|err| map_store_error(err).with_path(store.path()))?;
        store.commit(txn)?;

        self.cell.reload_if_open()
    }

    /// Empty the subscriber's sub-database, decrement the pending count of
    /// every message it still held, and drop the id from the parameter
    /// record. Removing an unknown subscriber is a no-op.
    pub fn remove_subscriber(&self, sub_id: &str) -> Result<(), Error> {
        let store = self.cell.store();
        let mut txn = store.write_txn()?;
        let dbs = open_queue_dbs(store, &txn)?;
        let params = read_params(store, &txn, &dbs)?;

        if let Some(sub_db) = store.open_db::<Str, Unit>(&txn, sub_id)? {
            let mut held = Vec::new();
            {
                let iter = sub_db
                    .iter(&txn)
                    .map_err(|err| map_store_error(err).with_path(store.path()))?;
                for entry in iter {
                    let (msg_id, ()) = entry.map_err(|err| {
                        map_store_error(err).with_path(store.path())
                    })?;
                    held.push(msg_id.to_string());
                }
            }
            for msg_id in &held {
                decrement_pending(store, &dbs, &mut txn, msg_id)?;
            }
            sub_db
                .clear(&mut txn)
                .map_err(|err| map_store_error(err).with_path(store.path()))?;
        }

        let mut ids = params.subscriber_ids;
        ids.remove(sub_id);
        dbs.params
            .put(
                &mut txn,
                schema::SUBSCRIBER_IDS_KEY,
                &schema::encode_subscriber_ids(&ids),
            )
            .map_err(|err| map_store_error(err).with_path(store.path()))?;
        store.commit(txn)?;

        self.cell.reload_if_open()
    }

    /// Empty every subscriber sub-database and zero all pending counts; the
    /// next vacuum reclaims the message bodies.
    pub fn clear_all_subscribers(&self) -> Result<(), Error> {
        let store = self.cell.store();
        let mut txn = store.write_txn()?;
        let dbs = open_queue_dbs(store, &txn)?;
        let params = read_params(store, &txn, &dbs)?;

        for sub_id in &params.subscriber_ids {
            if let Some(sub_db) = store.open_db::<Str, Unit>(&txn, sub_id)? {
                sub_db.clear(&mut txn).map_err(|err| {
                    map_store_error(err).with_path(store.path())
                })?;
            }
        }

        let mut pending_ids = Vec::new();
        {
            let iter = dbs
                .pending
                .iter(&txn)
                .map_err(|err| map_store_error(err).with_path(store.path()))?;
            for entry in iter {
                let (msg_id, _) = entry.map_err(|err| {
                    map_store_error(err).with_path(store.path())
                })?;
                pending_ids.push(msg_id.to_string());
            }
        }
        for msg_id in &pending_ids {
            dbs.pending
                .put(&mut txn, msg_id, "0")
                .map_err(|err| map_store_error(err).with_path(store.path()))?;
        }
        store.commit(txn)?;
        Ok(())
    }

    /// Run the dangling-reclamation half of vacuum explicitly.
    pub fn prune_dangling_messages(&self) -> Result<VacuumStats, Error> {
        self.cell.get_or_open()?.prune_dangling_messages()
    }

    /// Verify the cross-database invariants of this queue.
    pub fn check(&self) -> Result<ConsistencyReport, Error> {
        self.cell.get_or_open()?.check()
    }
}
