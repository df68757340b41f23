//! Purpose: Publisher façade over the queue engine.
//! Exports: `Publisher`.
//! Role: Sends opaque payloads to the subscriber set captured at construction.
//! Invariants: With autosync, every message commits its own transaction;
//! without it, `send_many` commits one transaction for the whole batch.
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::core::error::Error;
use crate::core::queue::Queue;

#[derive(Debug)]
pub struct Publisher {
    queue: Arc<Queue>,
    subscriber_ids: BTreeSet<String>,
    autosync: bool,
}

impl Publisher {
    pub(crate) fn new(queue: Arc<Queue>, subscriber_ids: BTreeSet<String>, autosync: bool) -> Self {
        Self {
            queue,
            subscriber_ids,
            autosync,
        }
    }

    pub fn subscriber_ids(&self) -> &BTreeSet<String> {
        &self.subscriber_ids
    }

    /// Publish one message to every captured subscriber.
    pub fn send(&self, payload: &[u8]) -> Result<(), Error> {
        self.queue.put(payload, &self.subscriber_ids)?;
        Ok(())
    }

    /// Publish a batch. Batched sends share one timestamp, so delivery order
    /// within the batch is unspecified.
    pub fn send_many<P: AsRef<[u8]>>(&self, payloads: &[P]) -> Result<(), Error> {
        if self.autosync {
            for payload in payloads {
                self.queue.put(payload.as_ref(), &self.subscriber_ids)?;
            }
        } else {
            self.queue.put_many(payloads, &self.subscriber_ids)?;
        }
        Ok(())
    }
}
