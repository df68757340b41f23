//! Purpose: Define the stable public Rust API boundary for postbus.
//! Exports: Core types and operations needed by the CLI and embedders.
//! Role: Public, additive-only surface; hides internal storage modules.
//! Invariants: This module is the only public path to storage primitives.
//! Invariants: Internal modules remain private and are not directly exposed.

mod environment;
mod publisher;
mod subscriber;

pub use crate::core::control::Control;
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::queue::{
    ConsistencyIssue, ConsistencyReport, FrontMessage, Queue, VacuumStats,
};
pub use crate::core::schema::{HighWaterMark, Strategy};
pub use environment::{Environment, EnvironmentOptions};
pub use publisher::Publisher;
pub use subscriber::{MessageGuard, ReceiveOptions, Subscriber};
