//! Purpose: Subscriber façade: scoped read-and-ack over front/pop.
//! Exports: `Subscriber`, `MessageGuard`, `ReceiveOptions`.
//! Role: Delivers at-least-once; the pop happens only on explicit ack.
//! Invariants: Dropping a guard without `ack` leaves the message queued for
//! redelivery.
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::core::error::Error;
use crate::core::queue::Queue;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReceiveOptions {
    /// Upper bound on the total wait.
    pub timeout: Duration,
    /// Number of `front` polls spread across the timeout.
    pub retries: u32,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            retries: 10,
        }
    }
}

#[derive(Debug)]
pub struct Subscriber {
    queue: Arc<Queue>,
    sub_id: String,
}

impl Subscriber {
    pub(crate) fn new(queue: Arc<Queue>, sub_id: String) -> Self {
        Self { queue, sub_id }
    }

    pub fn id(&self) -> &str {
        &self.sub_id
    }

    /// Peek at the oldest queued payload without consuming it.
    pub fn front(&self) -> Result<Option<Vec<u8>>, Error> {
        Ok(self
            .queue
            .front(&self.sub_id)?
            .map(|message| message.payload))
    }

    /// Receive with the default poll budget (60 s across 10 polls).
    pub fn receive(&self) -> Result<Option<MessageGuard<'_>>, Error> {
        self.receive_with(ReceiveOptions::default())
    }

    /// Poll `front` until a message arrives or the budget runs out. `None`
    /// means timeout. The returned guard owns the in-flight message; call
    /// `ack` to pop it, drop the guard to leave it queued.
    pub fn receive_with(&self, options: ReceiveOptions) -> Result<Option<MessageGuard<'_>>, Error> {
        let deadline = Instant::now() + options.timeout;
        let interval = options.timeout / options.retries.max(1);
        loop {
            if let Some(message) = self.queue.front(&self.sub_id)? {
                return Ok(Some(MessageGuard {
                    subscriber: self,
                    msg_id: message.msg_id,
                    payload: message.payload,
                }));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(interval);
        }
    }

    /// Skip to the newest queued message, dropping everything older. For
    /// subscribers that only care about the most recent state snapshot.
    pub fn receive_to_top(&self) -> Result<Option<MessageGuard<'_>>, Error> {
        Ok(self
            .queue
            .receive_to_top(&self.sub_id)?
            .map(|message| MessageGuard {
                subscriber: self,
                msg_id: message.msg_id,
                payload: message.payload,
            }))
    }

    /// Consume the oldest entry without a guard. Returns false when the
    /// sub-database was empty; strict callers can treat that as a fault.
    pub fn pop(&self) -> Result<bool, Error> {
        self.queue.pop(&self.sub_id)
    }
}

/// Exclusive handle on one delivered-but-unacked message. The payload borrow
/// ends with the guard.
#[derive(Debug)]
pub struct MessageGuard<'a> {
    subscriber: &'a Subscriber,
    msg_id: String,
    payload: Vec<u8>,
}

impl MessageGuard<'_> {
    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Successful release: pop the message and decrement its pending count.
    pub fn ack(self) -> Result<(), Error> {
        self.subscriber.queue.pop(&self.subscriber.sub_id)?;
        Ok(())
    }
}
