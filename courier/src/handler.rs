//! Per-type message handlers and the processing pipeline.
//!
//! ## Pipeline
//!
//! ```text
//! receive → get filter → callback ─┬─ Ok(Some(r)) → reply_to | mq:{R}.inq → ack
//!                                  ├─ Ok(None)    → reply_to | mq:{T}.outq → ack
//!                                  └─ Err(f)      → requeue (retry_attempts + 1)
//!                                                   | dead letter (error set) → ack
//! ```

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::MqResult;
use crate::queue::{
    Message, MessageError, MessageOptions, MessageQueueClient, QueueMessage, QueueNameSet,
    Received,
};

/// Why a handler could not process a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// Eligible for requeue until the retry budget is spent.
    Retryable(MessageError),
    /// Dead-lettered immediately.
    Unretryable(MessageError),
}

impl Failure {
    pub fn retryable(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Failure::Retryable(MessageError::new(error_code, message))
    }

    pub fn unretryable(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Failure::Unretryable(MessageError::new(error_code, message))
    }

    /// A retryable failure classified by the error's type name.
    pub fn from_error<E: std::error::Error>(err: &E) -> Self {
        let type_name = std::any::type_name::<E>();
        // `a::Wrapper<b::Inner>` is classified as `Wrapper`.
        let path = type_name.split('<').next().unwrap_or(type_name);
        let short = path.rsplit("::").next().unwrap_or(path);
        Failure::retryable(short, err.to_string())
    }

    pub fn error(&self) -> &MessageError {
        match self {
            Failure::Retryable(e) | Failure::Unretryable(e) => e,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Failure::Retryable(_))
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error().fmt(f)
    }
}

/// What a handler callback returns: an optional response, or a failure.
pub type HandlerResult<R> = Result<Option<R>, Failure>;

/// Decision taken for a failed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Republish to the in queue with `retry_attempts` incremented.
    Requeue,
    /// Attach the error and publish to the dead-letter queue.
    DeadLetter,
}

/// Replaces the default retry policy for failed messages.
pub type ExceptionHandler =
    Arc<dyn Fn(&MessageHandler, &Message<Value>, &Failure) -> FailureAction + Send + Sync>;

/// Observes each message before its callback runs.
pub type GetMessageFilter = Arc<dyn Fn(&str, &Message<Value>) + Send + Sync>;

/// Post-processes a response before it is routed. Receives the request type name.
pub type ResponseFilter = Arc<dyn Fn(&str, &mut Message<Value>) + Send + Sync>;

/// Server-wide pipeline settings shared by every handler.
#[derive(Clone, Default)]
pub struct PipelineHooks {
    pub get_message_filter: Option<GetMessageFilter>,
    pub response_filter: Option<ResponseFilter>,
    pub disable_publishing_responses: bool,
    pub disable_publishing_to_outq: bool,
}

/// Per-registration options.
#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    /// Worker tasks for this type; falls back to the server default.
    pub worker_threads: Option<usize>,
    /// Copy the request's meta into replies.
    pub echo_meta: bool,
}

impl HandlerOptions {
    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = Some(worker_threads.max(1));
        self
    }

    pub fn with_echo_meta(mut self) -> Self {
        self.echo_meta = true;
        self
    }
}

/// Counters for one handler, shared by all of its workers.
#[derive(Debug, Default)]
pub struct MessageHandlerStats {
    processed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    normal_received: AtomicU64,
    priority_received: AtomicU64,
    last_processed: Mutex<Option<DateTime<Utc>>>,
}

/// Point-in-time copy of [`MessageHandlerStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub name: String,
    pub total_messages_processed: u64,
    pub total_messages_failed: u64,
    pub total_retries: u64,
    pub total_normal_messages_received: u64,
    pub total_priority_messages_received: u64,
    pub last_message_processed: Option<DateTime<Utc>>,
}

impl MessageHandlerStats {
    fn record_received(&self, priority: bool) {
        if priority {
            self.priority_received.fetch_add(1, Ordering::Relaxed);
        } else {
            self.normal_received.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_processed.lock() {
            *last = Some(Utc::now());
        }
    }

    pub fn snapshot(&self, name: &str) -> StatsSnapshot {
        StatsSnapshot {
            name: name.to_string(),
            total_messages_processed: self.processed.load(Ordering::Relaxed),
            total_messages_failed: self.failed.load(Ordering::Relaxed),
            total_retries: self.retries.load(Ordering::Relaxed),
            total_normal_messages_received: self.normal_received.load(Ordering::Relaxed),
            total_priority_messages_received: self.priority_received.load(Ordering::Relaxed),
            last_message_processed: self.last_processed.lock().ok().and_then(|last| *last),
        }
    }
}

impl StatsSnapshot {
    /// Fold another snapshot into this one.
    pub fn add(&mut self, other: &StatsSnapshot) {
        self.total_messages_processed += other.total_messages_processed;
        self.total_messages_failed += other.total_messages_failed;
        self.total_retries += other.total_retries;
        self.total_normal_messages_received += other.total_normal_messages_received;
        self.total_priority_messages_received += other.total_priority_messages_received;
        self.last_message_processed = self.last_message_processed.max(other.last_message_processed);
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: processed={} failed={} retries={} normal={} priority={}",
            self.name,
            self.total_messages_processed,
            self.total_messages_failed,
            self.total_retries,
            self.total_normal_messages_received,
            self.total_priority_messages_received,
        )?;
        if let Some(last) = self.last_message_processed {
            write!(f, " last={}", last.to_rfc3339())?;
        }
        Ok(())
    }
}

type Invoker =
    Arc<dyn Fn(Message<Value>) -> BoxFuture<'static, Result<Option<Value>, Failure>> + Send + Sync>;

/// One message type bound to its callback and retry policy.
pub struct MessageHandler {
    type_name: &'static str,
    response_type: Option<&'static str>,
    invoker: Invoker,
    options: HandlerOptions,
    retry_count: u32,
    exception_handler: Option<ExceptionHandler>,
    hooks: Arc<PipelineHooks>,
    stats: MessageHandlerStats,
}

impl MessageHandler {
    /// Bind `callback` to messages of type `T` that may respond with `R`.
    pub fn new<T, R, F, Fut>(callback: F) -> Self
    where
        T: QueueMessage,
        R: QueueMessage,
        F: Fn(Message<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<R>> + Send + 'static,
    {
        let invoker: Invoker = Arc::new(move |message: Message<Value>| {
            let call = message.decode::<T>().map(|decoded| callback(decoded));
            async move {
                let call = call.map_err(|e| Failure::unretryable("SerializationError", e.to_string()))?;
                match call.await? {
                    Some(response) => serde_json::to_value(response)
                        .map(Some)
                        .map_err(|e| Failure::unretryable("SerializationError", e.to_string())),
                    None => Ok(None),
                }
            }
            .boxed()
        });

        Self::from_invoker(T::TYPE_NAME, Some(R::TYPE_NAME), invoker)
    }

    /// Bind a callback that never responds.
    pub fn one_way<T, F, Fut>(callback: F) -> Self
    where
        T: QueueMessage,
        F: Fn(Message<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Failure>> + Send + 'static,
    {
        let invoker: Invoker = Arc::new(move |message: Message<Value>| {
            let call = message.decode::<T>().map(|decoded| callback(decoded));
            async move {
                let call = call.map_err(|e| Failure::unretryable("SerializationError", e.to_string()))?;
                call.await.map(|()| None)
            }
            .boxed()
        });

        Self::from_invoker(T::TYPE_NAME, None, invoker)
    }

    fn from_invoker(
        type_name: &'static str,
        response_type: Option<&'static str>,
        invoker: Invoker,
    ) -> Self {
        Self {
            type_name,
            response_type,
            invoker,
            options: HandlerOptions::default(),
            retry_count: 1,
            exception_handler: None,
            hooks: Arc::new(PipelineHooks::default()),
            stats: MessageHandlerStats::default(),
        }
    }

    pub fn with_options(mut self, options: HandlerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_exception_handler(mut self, exception_handler: Option<ExceptionHandler>) -> Self {
        self.exception_handler = exception_handler;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<PipelineHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn options(&self) -> &HandlerOptions {
        &self.options
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.type_name)
    }

    /// Run one received message through the pipeline.
    ///
    /// Handler failures are resolved here (requeue or dead letter). Broker
    /// errors are returned after the delivery has been handed back to its queue.
    pub async fn process(
        &self,
        client: &MessageQueueClient,
        received: Received<Value>,
    ) -> MqResult<()> {
        let delivery = received.delivery.clone();
        let result = self.run_pipeline(client, received).await;
        if let Err(e) = &result {
            warn!(
                type_name = self.type_name,
                queue = %delivery.queue,
                error = %e,
                "mq_delivery_returned"
            );
            if let Err(reject_error) = client.transport().reject(&delivery, true).await {
                warn!(
                    type_name = self.type_name,
                    queue = %delivery.queue,
                    error = %reject_error,
                    "mq_delivery_return_failed"
                );
            }
        }
        result
    }

    async fn run_pipeline(
        &self,
        client: &MessageQueueClient,
        mut received: Received<Value>,
    ) -> MqResult<()> {
        let names = client.names().for_type(self.type_name);
        let priority = received.queue() == names.priority_q;
        self.stats.record_received(priority);
        received.type_name = Some(self.type_name.to_string());

        if let Some(filter) = &self.hooks.get_message_filter {
            filter(received.queue(), &received.message);
        }

        debug!(
            type_name = self.type_name,
            message_id = %received.message.id,
            retry_attempts = received.message.retry_attempts,
            "mq_message_processing"
        );

        let outcome = AssertUnwindSafe((self.invoker)(received.message.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(Failure::retryable("Panic", panic_message(&*panic))));

        match outcome {
            Ok(response) => {
                self.route_success(client, &names, &received.message, response)
                    .await?;
                client.ack(&received).await?;
                self.stats.record_processed();
                Ok(())
            }
            Err(failure) => self.handle_failure(client, received, failure).await,
        }
    }

    async fn route_success(
        &self,
        client: &MessageQueueClient,
        names: &QueueNameSet,
        request: &Message<Value>,
        response: Option<Value>,
    ) -> MqResult<()> {
        match (response, self.response_type) {
            (Some(body), Some(response_type)) => {
                if self.hooks.disable_publishing_responses {
                    debug!(type_name = self.type_name, "mq_response_discarded");
                    return Ok(());
                }

                let mut reply = Message::new(body);
                reply.tag = request.tag.clone();
                if self.options.echo_meta {
                    reply.meta = request.meta.clone();
                }
                if let Some(filter) = &self.hooks.response_filter {
                    filter(self.type_name, &mut reply);
                }

                let queue = match &request.reply_to {
                    Some(reply_to) => reply_to.clone(),
                    None => client.names().in_queue(response_type),
                };
                client.publish_untyped(&queue, response_type, &reply).await?;
                debug!(
                    type_name = self.type_name,
                    response_type = response_type,
                    queue = %queue,
                    "mq_response_published"
                );
            }
            _ => {
                if let Some(reply_to) = &request.reply_to {
                    client
                        .publish_untyped(reply_to, self.type_name, request)
                        .await?;
                } else if request.options.contains(MessageOptions::NOTIFY_ONE_WAY)
                    && !self.hooks.disable_publishing_to_outq
                {
                    client
                        .publish_untyped(&names.out_q, self.type_name, request)
                        .await?;
                }
            }
        }
        Ok(())
    }

    fn decide(&self, message: &Message<Value>, failure: &Failure) -> FailureAction {
        if let Some(exception_handler) = &self.exception_handler {
            return std::panic::catch_unwind(AssertUnwindSafe(|| {
                exception_handler(self, message, failure)
            }))
            .unwrap_or_else(|panic| {
                error!(
                    type_name = self.type_name,
                    message_id = %message.id,
                    panic = %panic_message(&*panic),
                    "mq_exception_handler_panicked"
                );
                FailureAction::DeadLetter
            });
        }

        if !failure.is_retryable() || message.retry_attempts >= self.retry_count {
            FailureAction::DeadLetter
        } else {
            FailureAction::Requeue
        }
    }

    async fn handle_failure(
        &self,
        client: &MessageQueueClient,
        mut received: Received<Value>,
        failure: Failure,
    ) -> MqResult<()> {
        self.stats.failed.fetch_add(1, Ordering::Relaxed);

        match self.decide(&received.message, &failure) {
            FailureAction::Requeue => {
                received.message.retry_attempts =
                    received.message.retry_attempts.saturating_add(1);
                self.stats.retries.fetch_add(1, Ordering::Relaxed);
                warn!(
                    type_name = self.type_name,
                    message_id = %received.message.id,
                    retry_attempts = received.message.retry_attempts,
                    error = %failure,
                    "mq_message_requeued"
                );
                client.nak(received, true, None).await
            }
            FailureAction::DeadLetter => {
                let error = failure.error().clone();
                if let Some(reply_to) = received.message.reply_to.clone() {
                    let mut reply = received.message.clone();
                    reply.error = Some(error.clone());
                    client
                        .publish_untyped(&reply_to, self.type_name, &reply)
                        .await?;
                }

                error!(
                    type_name = self.type_name,
                    message_id = %received.message.id,
                    retry_attempts = received.message.retry_attempts,
                    error = %failure,
                    "mq_message_dead_lettered"
                );
                client.nak(received, false, Some(error)).await
            }
        }
    }
}

impl fmt::Debug for MessageHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHandler")
            .field("type_name", &self.type_name)
            .field("response_type", &self.response_type)
            .field("options", &self.options)
            .field("retry_count", &self.retry_count)
            .finish_non_exhaustive()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Log line for a handler registration.
pub(crate) fn log_registration(handler: &MessageHandler, worker_threads: usize) {
    info!(
        type_name = handler.type_name,
        response_type = ?handler.response_type,
        worker_threads = worker_threads,
        retry_count = handler.retry_count,
        "mq_handler_registered"
    );
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use serde::Deserialize;

    use super::*;
    use crate::queue::QueueNames;
    use crate::transport::MemoryTransport;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Hello {
        name: String,
    }

    impl QueueMessage for Hello {
        const TYPE_NAME: &'static str = "Hello";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct HelloResponse {
        result: String,
    }

    impl QueueMessage for HelloResponse {
        const TYPE_NAME: &'static str = "HelloResponse";
    }

    fn client() -> MessageQueueClient {
        MessageQueueClient::new(Arc::new(MemoryTransport::new()), Arc::new(QueueNames::new()))
    }

    fn greeter() -> MessageHandler {
        MessageHandler::new(|m: Message<Hello>| async move {
            Ok(Some(HelloResponse {
                result: format!("Hello, {}!", m.body.name),
            }))
        })
    }

    async fn publish_and_take(client: &MessageQueueClient, message: Message<Hello>) -> Received<Value> {
        client.publish_message(message).await.unwrap();
        client.try_get("mq:Hello.inq").await.unwrap().unwrap()
    }

    fn hello(name: &str) -> Message<Hello> {
        Message::new(Hello {
            name: name.to_string(),
        })
    }

    #[test]
    fn test_failure_from_error_uses_type_name() {
        let err = "x".parse::<u32>().unwrap_err();
        let failure = Failure::from_error(&err);
        assert!(failure.is_retryable());
        assert_eq!(failure.error().error_code, "ParseIntError");
    }

    #[derive(Debug)]
    struct Wrapped<E>(E);

    impl<E: fmt::Display> fmt::Display for Wrapped<E> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "wrapped: {}", self.0)
        }
    }

    impl<E: std::error::Error> std::error::Error for Wrapped<E> {}

    #[test]
    fn test_failure_from_generic_error_drops_type_arguments() {
        let err = Wrapped("x".parse::<u32>().unwrap_err());
        let failure = Failure::from_error(&err);
        assert_eq!(failure.error().error_code, "Wrapped");
        assert!(failure.error().message.starts_with("wrapped: "));
    }

    #[tokio::test]
    async fn test_response_routed_to_response_in_queue() {
        let client = client();
        let handler = greeter();

        let received = publish_and_take(&client, hello("World").with_tag("t-1")).await;
        handler.process(&client, received).await.unwrap();

        let reply: Received<HelloResponse> = client.try_get("mq:HelloResponse.inq").await.unwrap().unwrap();
        assert_eq!(reply.message.body.result, "Hello, World!");
        assert_eq!(reply.message.tag.as_deref(), Some("t-1"));
        assert_eq!(handler.stats().total_messages_processed, 1);
        assert!(handler.stats().last_message_processed.is_some());
    }

    #[tokio::test]
    async fn test_response_routed_to_reply_to() {
        let client = client();
        let handler = greeter().with_options(HandlerOptions::default().with_echo_meta());

        let received = publish_and_take(
            &client,
            hello("World").with_reply_to("mq:tmp:reply").with_meta("k", "v"),
        )
        .await;
        handler.process(&client, received).await.unwrap();

        let reply: Received<HelloResponse> = client.try_get("mq:tmp:reply").await.unwrap().unwrap();
        assert_eq!(reply.message.body.result, "Hello, World!");
        assert_eq!(reply.message.meta.get("k").map(String::as_str), Some("v"));
        assert!(client.try_get::<Value>("mq:HelloResponse.inq").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_no_response_goes_to_out_queue() {
        let client = client();
        let handler = MessageHandler::one_way(|_m: Message<Hello>| async { Ok(()) });

        let message = hello("World");
        let received = publish_and_take(&client, message.clone()).await;
        handler.process(&client, received).await.unwrap();

        let out: Received<Hello> = client.try_get("mq:Hello.outq").await.unwrap().unwrap();
        assert_eq!(out.message.id, message.id);
        assert_eq!(out.message.body, message.body);
    }

    #[tokio::test]
    async fn test_no_response_without_notify_flag_is_not_tapped() {
        let client = client();
        let handler = MessageHandler::one_way(|_m: Message<Hello>| async { Ok(()) });

        let received = publish_and_take(
            &client,
            hello("World").with_options(MessageOptions::NONE),
        )
        .await;
        handler.process(&client, received).await.unwrap();

        assert!(client.try_get::<Value>("mq:Hello.outq").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retryable_failure_is_requeued_then_dead_lettered() {
        let client = client();
        let calls = Arc::new(AtomicU32::new(0));
        let handler = {
            let calls = Arc::clone(&calls);
            MessageHandler::new(move |_m: Message<Hello>| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<Option<HelloResponse>, _>(Failure::retryable("ArgumentException", "Name")) }
            })
        };

        let received = publish_and_take(&client, hello("World")).await;
        handler.process(&client, received).await.unwrap();

        let retried: Received<Value> = client.try_get("mq:Hello.inq").await.unwrap().unwrap();
        assert_eq!(retried.message.retry_attempts, 1);
        assert!(retried.message.error.is_none());
        handler.process(&client, retried).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let dead: Received<Value> = client.try_get("mq:Hello.dlq").await.unwrap().unwrap();
        let error = dead.message.error.unwrap();
        assert_eq!(error.error_code, "ArgumentException");
        assert_eq!(error.message, "Name");
        assert_eq!(dead.message.retry_attempts, 1);

        let stats = handler.stats();
        assert_eq!(stats.total_messages_failed, 2);
        assert_eq!(stats.total_retries, 1);
        assert_eq!(stats.total_messages_processed, 0);
    }

    #[tokio::test]
    async fn test_unretryable_failure_skips_retries() {
        let client = client();
        let handler = MessageHandler::one_way(|_m: Message<Hello>| async {
            Err(Failure::unretryable("Validation", "bad input"))
        })
        .with_retry_count(5);

        let received = publish_and_take(&client, hello("World")).await;
        handler.process(&client, received).await.unwrap();

        assert!(client.try_get::<Value>("mq:Hello.inq").await.unwrap().is_none());
        let dead: Received<Value> = client.try_get("mq:Hello.dlq").await.unwrap().unwrap();
        assert_eq!(dead.message.retry_attempts, 0);
    }

    #[tokio::test]
    async fn test_dead_letter_with_reply_to_sends_error_reply() {
        let client = client();
        let handler = MessageHandler::one_way(|_m: Message<Hello>| async {
            Err(Failure::unretryable("Validation", "bad input"))
        });

        let received = publish_and_take(&client, hello("World").with_reply_to("mq:tmp:reply")).await;
        handler.process(&client, received).await.unwrap();

        let reply: Received<Value> = client.try_get("mq:tmp:reply").await.unwrap().unwrap();
        assert_eq!(reply.message.error.unwrap().message, "bad input");
        assert!(client.try_get::<Value>("mq:Hello.dlq").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_panicking_handler_is_a_retryable_failure() {
        let client = client();
        let handler = MessageHandler::one_way(|m: Message<Hello>| async move {
            if m.retry_attempts == 0 {
                panic!("boom");
            }
            Ok(())
        });

        let received = publish_and_take(&client, hello("World")).await;
        handler.process(&client, received).await.unwrap();

        let retried: Received<Value> = client.try_get("mq:Hello.inq").await.unwrap().unwrap();
        assert_eq!(retried.message.retry_attempts, 1);
        handler.process(&client, retried).await.unwrap();
        assert_eq!(handler.stats().total_messages_processed, 1);
    }

    #[tokio::test]
    async fn test_exception_handler_overrides_policy() {
        let client = client();
        let always_requeue: ExceptionHandler = Arc::new(
            |_h: &MessageHandler, _m: &Message<Value>, _f: &Failure| FailureAction::Requeue,
        );
        let handler = MessageHandler::one_way(|_m: Message<Hello>| async {
            Err(Failure::unretryable("Fatal", "never works"))
        })
        .with_exception_handler(Some(always_requeue));

        let mut received = publish_and_take(&client, hello("World")).await;
        for attempt in 1..=4 {
            handler.process(&client, received).await.unwrap();
            received = client.try_get("mq:Hello.inq").await.unwrap().unwrap();
            assert_eq!(received.message.retry_attempts, attempt);
        }
        assert!(client.try_get::<Value>("mq:Hello.dlq").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_attempts_saturate() {
        let client = client();
        let always_requeue: ExceptionHandler = Arc::new(
            |_h: &MessageHandler, _m: &Message<Value>, _f: &Failure| FailureAction::Requeue,
        );
        let handler = MessageHandler::one_way(|_m: Message<Hello>| async {
            Err(Failure::retryable("Busy", "try later"))
        })
        .with_exception_handler(Some(always_requeue));

        let mut message = hello("World");
        message.retry_attempts = u32::MAX;
        let received = publish_and_take(&client, message).await;
        handler.process(&client, received).await.unwrap();

        let retried: Received<Value> = client.try_get("mq:Hello.inq").await.unwrap().unwrap();
        assert_eq!(retried.message.retry_attempts, u32::MAX);
        assert_eq!(handler.stats().total_retries, 1);
    }

    #[tokio::test]
    async fn test_panicking_exception_handler_dead_letters() {
        let client = client();
        let broken: ExceptionHandler = Arc::new(
            |_h: &MessageHandler, _m: &Message<Value>, _f: &Failure| -> FailureAction {
                panic!("handler bug")
            },
        );
        let handler = MessageHandler::one_way(|_m: Message<Hello>| async {
            Err(Failure::retryable("Transient", "try again"))
        })
        .with_retry_count(3)
        .with_exception_handler(Some(broken));

        let received = publish_and_take(&client, hello("World")).await;
        handler.process(&client, received).await.unwrap();

        assert!(client.try_get::<Value>("mq:Hello.dlq").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_undecodable_body_is_dead_lettered() {
        let client = client();
        let handler = greeter().with_retry_count(3);

        let wrong = Message::new(serde_json::json!({ "unexpected": true }));
        client.publish_untyped("mq:Hello.inq", "Hello", &wrong).await.unwrap();
        let received: Received<Value> = client
            .get("mq:Hello.inq", Some(Duration::from_secs(1)))
            .await
            .unwrap();
        handler.process(&client, received).await.unwrap();

        let dead: Received<Value> = client.try_get("mq:Hello.dlq").await.unwrap().unwrap();
        assert_eq!(dead.message.error.unwrap().error_code, "SerializationError");
    }

    #[tokio::test]
    async fn test_disabled_responses_are_dropped() {
        let client = client();
        let hooks = PipelineHooks {
            disable_publishing_responses: true,
            ..Default::default()
        };
        let handler = greeter().with_hooks(Arc::new(hooks));

        let received = publish_and_take(&client, hello("World")).await;
        handler.process(&client, received).await.unwrap();

        assert!(client.try_get::<Value>("mq:HelloResponse.inq").await.unwrap().is_none());
        assert_eq!(handler.stats().total_messages_processed, 1);
    }

    #[test]
    fn test_stats_snapshot_add() {
        let mut total = StatsSnapshot {
            name: "total".to_string(),
            ..Default::default()
        };
        let one = StatsSnapshot {
            name: "Hello".to_string(),
            total_messages_processed: 2,
            total_retries: 1,
            ..Default::default()
        };
        total.add(&one);
        total.add(&one);
        assert_eq!(total.total_messages_processed, 4);
        assert_eq!(total.total_retries, 2);
        assert!(total.to_string().starts_with("total: processed=4"));
    }
}
