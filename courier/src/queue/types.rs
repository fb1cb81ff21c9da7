//! Message envelope carried through every queue operation.
//!
//! The serialised shape is a JSON object with PascalCase fields:
//!
//! ```text
//! { Id, Body, CreatedDate, Priority, RetryAttempts, ReplyTo, Tag, Meta, Error, Options }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::MqResult;

/// A message type that can be published and handled.
///
/// `TYPE_NAME` is the stable token queue names are derived from, e.g.
/// `mq:{TYPE_NAME}.inq`.
pub trait QueueMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE_NAME: &'static str;
}

/// Structured failure record attached to dead-lettered messages and error replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageError {
    /// Failure classification, e.g. `ArgumentException`
    pub error_code: String,
    /// Human-readable failure message
    pub message: String,
}

impl MessageError {
    pub fn new(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_code, self.message)
    }
}

/// Message option bit flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageOptions(u32);

impl MessageOptions {
    pub const NONE: MessageOptions = MessageOptions(0);
    /// Publish one-way messages (no response) to the type's out queue.
    pub const NOTIFY_ONE_WAY: MessageOptions = MessageOptions(1);
    pub const ALL: MessageOptions = MessageOptions(1);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: MessageOptions) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn without(self, other: MessageOptions) -> Self {
        MessageOptions(self.0 & !other.0)
    }
}

impl Default for MessageOptions {
    fn default() -> Self {
        MessageOptions::ALL
    }
}

impl std::ops::BitOr for MessageOptions {
    type Output = MessageOptions;

    fn bitor(self, rhs: Self) -> Self::Output {
        MessageOptions(self.0 | rhs.0)
    }
}

/// A message envelope with a typed body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Message<T> {
    /// Unique message identifier, fixed at creation
    pub id: Uuid,
    /// Message payload
    pub body: T,
    /// When the message was created
    pub created_date: DateTime<Utc>,
    /// Advisory priority; positive values use the priority queue
    #[serde(default)]
    pub priority: i64,
    /// Times this message has been requeued after a failure
    #[serde(default)]
    pub retry_attempts: u32,
    /// Queue the response should be delivered to
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Correlation token echoed into replies
    #[serde(default)]
    pub tag: Option<String>,
    /// Custom headers
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    /// Set when the message failed terminally
    #[serde(default)]
    pub error: Option<MessageError>,
    #[serde(default)]
    pub options: MessageOptions,
}

impl<T> Message<T> {
    /// Create a new message with a fresh id.
    pub fn new(body: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            body,
            created_date: Utc::now(),
            priority: 0,
            retry_attempts: 0,
            reply_to: None,
            tag: None,
            meta: BTreeMap::new(),
            error: None,
            options: MessageOptions::default(),
        }
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn with_options(mut self, options: MessageOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the body while keeping every envelope field.
    pub fn map_body<U>(self, f: impl FnOnce(T) -> U) -> Message<U> {
        Message {
            id: self.id,
            body: f(self.body),
            created_date: self.created_date,
            priority: self.priority,
            retry_attempts: self.retry_attempts,
            reply_to: self.reply_to,
            tag: self.tag,
            meta: self.meta,
            error: self.error,
            options: self.options,
        }
    }

    pub fn is_priority(&self) -> bool {
        self.priority > 0
    }

    fn clone_envelope<U>(&self, body: U) -> Message<U> {
        Message {
            id: self.id,
            body,
            created_date: self.created_date,
            priority: self.priority,
            retry_attempts: self.retry_attempts,
            reply_to: self.reply_to.clone(),
            tag: self.tag.clone(),
            meta: self.meta.clone(),
            error: self.error.clone(),
            options: self.options,
        }
    }
}

impl<T: Serialize> Message<T> {
    /// Convert into an untyped envelope.
    pub fn to_value(&self) -> MqResult<Message<Value>> {
        let body = serde_json::to_value(&self.body)?;
        Ok(self.clone_envelope(body))
    }

    pub fn to_bytes(&self) -> MqResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl<T: DeserializeOwned> Message<T> {
    pub fn from_bytes(bytes: &[u8]) -> MqResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl Message<Value> {
    /// Decode the untyped body into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> MqResult<Message<T>> {
        let body = serde_json::from_value(self.body.clone())?;
        Ok(self.clone_envelope(body))
    }
}
