//! Courier - typed message-queue processing engine.
//!
//! Producers publish typed messages to queues derived from the message type
//! name; an [`MqServer`] hosts one handler per type and runs its workers, with
//! retries, dead-lettering and request/reply routing.
//!
//! ## Architecture
//!
//! ```text
//! MessageQueueClient ─publish─▶ mq:{T}.inq ─▶ MqServer workers ─▶ handler
//!                                                   │
//!            reply_to / mq:{R}.inq / mq:{T}.outq ◀──┤ success
//!            mq:{T}.inq (retry) / mq:{T}.dlq    ◀──┘ failure
//! ```
//!
//! Brokers are reached through the [`Transport`] trait: RabbitMQ via lapin, or
//! an in-process broker for tests and embedding.

pub mod config;
pub mod error;
pub mod handler;
pub mod queue;
pub mod server;
pub mod transport;

// Re-export commonly used types
pub use config::MqConfig;
pub use error::{MqError, MqResult};
pub use handler::{
    ExceptionHandler, Failure, FailureAction, HandlerOptions, HandlerResult, MessageHandler,
    StatsSnapshot,
};
pub use queue::{
    Message, MessageError, MessageOptions, MessageQueueClient, QueueMessage, QueueNames,
    Received,
};
pub use server::{MqServer, MqServerBuilder, ServerSettings, ServerStatus};
pub use transport::{
    AmqpTransport, DefaultTransportFactory, FailoverTransport, MemoryTransport, Transport,
    TransportFactory,
};
