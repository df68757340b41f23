// On-disk schema: sub-database names, parameter records, and key/value encodings.
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::core::error::{Error, ErrorKind};

// Shared sub-database names. Every other name in the environment belongs to a
// subscriber.
pub const DATA_DB: &str = "data_db";
pub const META_DB: &str = "meta_db";
pub const PENDING_DB: &str = "pending_db";
pub const QUEUE_DB: &str = "queue_db";

pub const RESERVED_DB_NAMES: [&str; 4] = [DATA_DB, META_DB, PENDING_DB, QUEUE_DB];

// Parameter record keys inside `queue_db`. Values are ASCII decimal except
// `strategy` (token) and `subscriber_ids` (space-separated tokens).
pub const HWM_DB_SIZE_BYTES_KEY: &str = "hwm_db_size_bytes";
pub const MAX_MSGS_NUM_KEY: &str = "max_msgs_num";
pub const MSG_TIMEOUT_SECS_KEY: &str = "msg_timeout_secs";
pub const STRATEGY_KEY: &str = "strategy";
pub const SUBSCRIBER_IDS_KEY: &str = "subscriber_ids";

pub const DEFAULT_MSG_TIMEOUT_SECS: u64 = 500;
pub const DEFAULT_MAX_MSGS_NUM: u64 = 64 * 1024;
pub const DEFAULT_HWM_DB_SIZE_BYTES: u64 = 30 * 1024 * 1024 * 1024;

pub const DEFAULT_MAX_READERS: u32 = 1024;
pub const DEFAULT_MAX_DBS: u32 = 1024;
pub const DEFAULT_MAP_SIZE_BYTES: usize = 32 * 1024 * 1024 * 1024;


#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Strategy {
    PruneFirst,
    PruneLast,
}

impl Strategy {
    pub fn parse(token: &str) -> Result<Self, Error> {
        match token {
            "prune_first" => Ok(Strategy::PruneFirst),
            "prune_last" => Ok(Strategy::PruneLast),
            other => Err(Error::new(ErrorKind::UnknownStrategy)
                .with_message(format!("unknown strategy '{other}'"))
                .with_hint("expected 'prune_first' or 'prune_last'")),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::PruneFirst => "prune_first",
            Strategy::PruneLast => "prune_last",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HighWaterMark {
    pub msg_timeout_secs: u64,
    pub max_msgs_num: u64,
    pub hwm_db_size_bytes: u64,
}

impl Default for HighWaterMark {
    fn default() -> Self {
        Self {
            msg_timeout_secs: DEFAULT_MSG_TIMEOUT_SECS,
            max_msgs_num: DEFAULT_MAX_MSGS_NUM,
            hwm_db_size_bytes: DEFAULT_HWM_DB_SIZE_BYTES,
        }
    }
}

/// Current time as whole seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Build a message id from a creation timestamp: the seconds zero-padded to
/// 20 digits (lexicographic key order stays temporal) followed by a random
/// UUID that breaks ties within one second.
pub fn msg_id(timestamp_secs: u64) -> String {
    format!("{timestamp_secs:020}{}", Uuid::new_v4())
}

pub fn encode_u64(value: u64) -> String {
    value.to_string()
}

pub fn parse_u64(text: &str, key: &str) -> Result<u64, Error> {
    text.parse::<u64>().map_err(|err| {
        Error::new(ErrorKind::Store)
            .with_message(format!("parameter '{key}' is not a decimal integer"))
            .with_key(key)
            .with_source(err)
    })
}

pub fn encode_subscriber_ids(ids: &BTreeSet<String>) -> String {
    ids.iter().cloned().collect::<Vec<_>>().join(" ")
}

pub fn decode_subscriber_ids(text: &str) -> BTreeSet<String> {
    text.split_whitespace().map(str::to_string).collect()
}

/// Subscriber ids become LMDB database names and tokens in a space-separated
/// parameter record, so they must be non-empty, whitespace-free, and must not
/// shadow a shared sub-database.
pub fn validate_subscriber_id(id: &str) -> Result<(), Error> {
    if id.is_empty() {
        return Err(Error::new(ErrorKind::Usage).with_message("subscriber id must not be empty"));
    }
    if id.chars().any(char::is_whitespace) {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("subscriber id must not contain whitespace")
            .with_subscriber(id));
    }
    if RESERVED_DB_NAMES.contains(&id) {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("subscriber id collides with a reserved database name")
            .with_subscriber(id));
    }
    Ok(())
}
