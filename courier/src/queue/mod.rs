//! Queue module: message envelope, queue naming and the client façade.
//!
//! ## Queues per message type
//!
//! ```text
//! mq:{T}.priorityq ─┐
//! mq:{T}.inq ───────┴─▶ worker ─┬─▶ mq:{T}.outq  (one-way, notify)
//!                               └─▶ mq:{T}.dlq   (retries exhausted)
//! ```

pub mod client;
pub mod names;
pub mod types;

pub use client::{ClientFilters, MessageQueueClient, PublishFilter, ReceiveFilter, Received};
pub use names::{QueueNameSet, QueueNames, ResolveQueueNameFn};
pub use types::{Message, MessageError, MessageOptions, QueueMessage};
