//! Queue naming conventions.
//!
//! Every queue the engine touches is derived from a message type name:
//!
//! ```text
//! mq:{Type}.inq        mq:{Type}.priorityq   mq:{Type}.outq   mq:{Type}.dlq
//! mq:topic:in          mq:topic:out          mq:tmp:{uuid}
//! ```
//!
//! A prefix, when configured, is prepended verbatim to all of them. The same
//! [`QueueNames`] value is shared by producers and consumers so both sides always
//! resolve identical names.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use uuid::Uuid;

/// Scheme every default queue name starts with.
pub const MQ_SCHEME: &str = "mq:";

pub const IN_SUFFIX: &str = ".inq";
pub const PRIORITY_SUFFIX: &str = ".priorityq";
pub const OUT_SUFFIX: &str = ".outq";
pub const DLQ_SUFFIX: &str = ".dlq";

const TOPIC_IN: &str = "topic:in";
const TOPIC_OUT: &str = "topic:out";
const TEMP_MARKER: &str = "tmp:";

/// Sample id used to locate where the resolver places a temp-queue id.
const TEMP_SAMPLE_ID: &str = "0123456789abcdef0123456789abcdef";

/// Maps `(type_name, suffix)` to a queue name, before the prefix is applied.
pub type ResolveQueueNameFn = Arc<dyn Fn(&str, &str) -> String + Send + Sync>;

/// The derived queue names for one message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNameSet {
    pub in_q: String,
    pub priority_q: String,
    pub out_q: String,
    pub dlq: String,
    pub topic_in: String,
    pub topic_out: String,
}

/// Queue name resolver with an optional prefix and a swappable naming function.
///
/// Name sets are cached per type name for the lifetime of the value. Changing the
/// prefix or resolver yields a new value with an empty cache.
pub struct QueueNames {
    prefix: String,
    resolver: ResolveQueueNameFn,
    temp_head: String,
    temp_tail: String,
    cache: RwLock<HashMap<String, Arc<QueueNameSet>>>,
}

impl QueueNames {
    /// Default conventions, no prefix.
    pub fn new() -> Self {
        Self::build(String::new(), Arc::new(default_resolve))
    }

    /// Prepend `prefix` verbatim to every resolved name.
    pub fn with_prefix(self, prefix: impl Into<String>) -> Self {
        Self::build(prefix.into(), self.resolver)
    }

    /// Replace the naming function.
    pub fn with_resolver<F>(self, resolver: F) -> Self
    where
        F: Fn(&str, &str) -> String + Send + Sync + 'static,
    {
        Self::build(self.prefix, Arc::new(resolver))
    }

    fn build(prefix: String, resolver: ResolveQueueNameFn) -> Self {
        let sample = format!("{}{}", prefix, resolver(&temp_id(TEMP_SAMPLE_ID), ""));
        let (temp_head, temp_tail) = match sample.find(TEMP_SAMPLE_ID) {
            Some(at) => (
                sample[..at].to_string(),
                sample[at + TEMP_SAMPLE_ID.len()..].to_string(),
            ),
            // Resolver discards the id; fall back to matching the marker itself.
            None => (format!("{}{}", prefix, resolver(TEMP_MARKER, "")), String::new()),
        };

        Self {
            prefix,
            resolver,
            temp_head,
            temp_tail,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Resolve a name for `type_name` with the given suffix.
    pub fn resolve(&self, type_name: &str, suffix: &str) -> String {
        format!("{}{}", self.prefix, (self.resolver)(type_name, suffix))
    }

    /// All queue names for a message type, cached after the first lookup.
    pub fn for_type(&self, type_name: &str) -> Arc<QueueNameSet> {
        if let Ok(cache) = self.cache.read() {
            if let Some(set) = cache.get(type_name) {
                return Arc::clone(set);
            }
        }

        let set = Arc::new(QueueNameSet {
            in_q: self.resolve(type_name, IN_SUFFIX),
            priority_q: self.resolve(type_name, PRIORITY_SUFFIX),
            out_q: self.resolve(type_name, OUT_SUFFIX),
            dlq: self.resolve(type_name, DLQ_SUFFIX),
            topic_in: self.topic_in(),
            topic_out: self.topic_out(),
        });

        if let Ok(mut cache) = self.cache.write() {
            cache
                .entry(type_name.to_string())
                .or_insert_with(|| Arc::clone(&set));
        }
        set
    }

    pub fn in_queue(&self, type_name: &str) -> String {
        self.for_type(type_name).in_q.clone()
    }

    pub fn priority_queue(&self, type_name: &str) -> String {
        self.for_type(type_name).priority_q.clone()
    }

    pub fn out_queue(&self, type_name: &str) -> String {
        self.for_type(type_name).out_q.clone()
    }

    pub fn dlq(&self, type_name: &str) -> String {
        self.for_type(type_name).dlq.clone()
    }

    /// Broker-wide topic name, independent of message type.
    pub fn topic_in(&self) -> String {
        format!("{}{}{}", self.prefix, MQ_SCHEME, TOPIC_IN)
    }

    pub fn topic_out(&self) -> String {
        format!("{}{}{}", self.prefix, MQ_SCHEME, TOPIC_OUT)
    }

    /// A fresh, unique temporary queue name.
    pub fn temp_queue_name(&self) -> String {
        let id = Uuid::new_v4().simple().to_string();
        self.resolve(&temp_id(&id), "")
    }

    /// Whether `name` was produced by [`QueueNames::temp_queue_name`] under this
    /// prefix and resolver.
    pub fn is_temp_queue(&self, name: &str) -> bool {
        name.len() > self.temp_head.len() + self.temp_tail.len()
            && name.starts_with(&self.temp_head)
            && name.ends_with(&self.temp_tail)
    }
}

impl Default for QueueNames {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QueueNames {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueNames")
            .field("prefix", &self.prefix)
            .field("temp_head", &self.temp_head)
            .field("temp_tail", &self.temp_tail)
            .finish_non_exhaustive()
    }
}

fn temp_id(id: &str) -> String {
    format!("{}{}", TEMP_MARKER, id)
}

fn default_resolve(type_name: &str, suffix: &str) -> String {
    format!("{}{}{}", MQ_SCHEME, type_name, suffix)
}
