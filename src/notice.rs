//! Purpose: Structured stderr notices for queue maintenance commands.
//! Exports: `Notice`, `NoticeKind`, `notice_json`.
//! Role: Non-error reporting channel for reclaimed, pruned, and rewritten queues.
//! Invariants: Notices are non-fatal and never alter stdout payloads.
//! Invariants: The `kind` vocabulary and JSON envelope are stable; fields are
//! additive-only.
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Map, Value};

/// Non-fatal events the maintenance commands report.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NoticeKind {
    /// An already-initialized queue had its parameter records rewritten.
    Reinit,
    /// An explicit prune reclaimed dangling messages.
    Reclaim,
    /// Overflow pruning dropped messages to relieve the high-water mark.
    OverflowPruned,
}

impl NoticeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoticeKind::Reinit => "reinit",
            NoticeKind::Reclaim => "reclaim",
            NoticeKind::OverflowPruned => "overflow-pruned",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub time: String,
    pub cmd: String,
    pub queue: String,
    pub message: String,
    pub details: Map<String, Value>,
}

impl Notice {
    /// Stamp a notice with the current Unix time in seconds.
    pub fn new(
        kind: NoticeKind,
        cmd: impl Into<String>,
        queue: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            .to_string();
        Self {
            kind,
            time,
            cmd: cmd.into(),
            queue: queue.into(),
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

pub fn notice_json(notice: &Notice) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(notice.kind.as_str()));
    inner.insert("time".to_string(), json!(notice.time));
    inner.insert("cmd".to_string(), json!(notice.cmd));
    inner.insert("queue".to_string(), json!(notice.queue));
    inner.insert("message".to_string(), json!(notice.message));
    inner.insert("details".to_string(), Value::Object(notice.details.clone()));

    let mut outer = Map::new();
    outer.insert("notice".to_string(), Value::Object(inner));
    Value::Object(outer)
}
