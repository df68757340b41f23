//! Purpose: Deployment configuration file: queues, publishers, subscribers.
//! Exports: `DeployConfig` and its entry types.
//! Role: Maps logical publisher/subscriber ids to queue directories and
//! carries per-queue limits and high-water-mark settings.
//! Invariants: Field names and defaults are a stable on-disk contract;
//! unspecified fields fall back to the documented defaults.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::api::{EnvironmentOptions, Error, ErrorKind, HighWaterMark, Strategy};
use crate::core::schema;

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DeployConfig {
    #[serde(default, rename = "pub")]
    pub publishers: BTreeMap<String, PublisherEntry>,
    #[serde(default, rename = "sub")]
    pub subscribers: BTreeMap<String, SubscriberEntry>,
    #[serde(default)]
    pub queues: BTreeMap<String, QueueEntry>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PublisherEntry {
    pub out_queue: PathBuf,
    #[serde(default)]
    pub subscribers: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SubscriberEntry {
    pub in_queue: PathBuf,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct QueueEntry {
    #[serde(default = "default_max_reader_num")]
    pub max_reader_num: u32,
    #[serde(default = "default_max_db_num")]
    pub max_db_num: u32,
    #[serde(default = "default_max_db_size_bytes")]
    pub max_db_size_bytes: usize,
    #[serde(default)]
    pub subscribers: Vec<String>,
    #[serde(default, rename = "high-water-mark")]
    pub high_water_mark: HighWaterMarkEntry,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HighWaterMarkEntry {
    #[serde(default = "default_msg_timeout_secs", rename = "MSG_TIMEOUT_SECS")]
    pub msg_timeout_secs: u64,
    #[serde(default = "default_max_msgs_num", rename = "MAX_MSGS_NUM")]
    pub max_msgs_num: u64,
    #[serde(default = "default_hwm_db_size_bytes", rename = "HWM_LMDB_SIZE_BYTES")]
    pub hwm_db_size_bytes: u64,
    #[serde(default = "default_strategy")]
    pub strategy: String,
}

impl Default for HighWaterMarkEntry {
    fn default() -> Self {
        Self {
            msg_timeout_secs: default_msg_timeout_secs(),
            max_msgs_num: default_max_msgs_num(),
            hwm_db_size_bytes: default_hwm_db_size_bytes(),
            strategy: default_strategy(),
        }
    }
}

fn default_max_reader_num() -> u32 {
    schema::DEFAULT_MAX_READERS
}

fn default_max_db_num() -> u32 {
    schema::DEFAULT_MAX_DBS
}

fn default_max_db_size_bytes() -> usize {
    schema::DEFAULT_MAP_SIZE_BYTES
}

fn default_msg_timeout_secs() -> u64 {
    schema::DEFAULT_MSG_TIMEOUT_SECS
}

fn default_max_msgs_num() -> u64 {
    schema::DEFAULT_MAX_MSGS_NUM
}

fn default_hwm_db_size_bytes() -> u64 {
    schema::DEFAULT_HWM_DB_SIZE_BYTES
}

fn default_strategy() -> String {
    Strategy::PruneFirst.as_str().to_string()
}

impl DeployConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read config file")
                .with_path(path)
                .with_source(err)
        })?;
        serde_json::from_str(&text).map_err(|err| {
            Error::new(ErrorKind::Config)
                .with_message("config file is not valid JSON for a deployment")
                .with_path(path)
                .with_source(err)
        })
    }

    pub fn publisher(&self, pub_id: &str) -> Result<&PublisherEntry, Error> {
        self.publishers.get(pub_id).ok_or_else(|| {
            Error::new(ErrorKind::Config)
                .with_message(format!("config has no publisher '{pub_id}'"))
        })
    }

    pub fn subscriber(&self, sub_id: &str) -> Result<&SubscriberEntry, Error> {
        self.subscribers.get(sub_id).ok_or_else(|| {
            Error::new(ErrorKind::Config)
                .with_message(format!("config has no subscriber '{sub_id}'"))
                .with_subscriber(sub_id)
        })
    }

    pub fn queue(&self, path: &str) -> Result<&QueueEntry, Error> {
        self.queues.get(path).ok_or_else(|| {
            Error::new(ErrorKind::Config)
                .with_message("config has no entry for this queue")
                .with_path(path)
        })
    }
}

impl QueueEntry {
    pub fn environment_options(&self) -> EnvironmentOptions {
        EnvironmentOptions {
            max_reader_num: self.max_reader_num,
            max_db_num: self.max_db_num,
            max_db_size_bytes: self.max_db_size_bytes,
        }
    }

    pub fn high_water_mark(&self) -> HighWaterMark {
        HighWaterMark {
            msg_timeout_secs: self.high_water_mark.msg_timeout_secs,
            max_msgs_num: self.high_water_mark.max_msgs_num,
            hwm_db_size_bytes: self.high_water_mark.hwm_db_size_bytes,
        }
    }

    pub fn strategy(&self) -> Result<Strategy, Error> {
        Strategy::parse(&self.high_water_mark.strategy)
    }
}
