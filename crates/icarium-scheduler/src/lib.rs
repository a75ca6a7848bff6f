//! Queue consumption and build dispatch for icarium.
//!
//! Reads push notifications from the queue, decodes them, and runs one
//! independent build task per `build` message. Uses PostgreSQL with
//! SKIP LOCKED for batch claiming.

pub mod decoder;
pub mod dispatcher;
pub mod queue;
pub mod service;

pub use decoder::{DecodeError, decode_message};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use queue::{PgMessageQueue, QueueBatch, QueueClient, QueueError, RawMessage, ReadOptions};
pub use service::{BuildError, BuildOutcome, BuildService, TriggerHandler};
