//! End-to-end server behaviour against the in-process broker.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use courier::queue::Received;
use courier::transport::{Delivery, Headers, QueueInfo, RawMessage};
use courier::{
    DefaultTransportFactory, Failure, FailoverTransport, FailureAction, MemoryTransport, Message,
    MessageHandler, MessageOptions, MqError, MqResult, MqServer, QueueMessage, QueueNames,
    ServerStatus, Transport,
};

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Hello {
    name: String,
}

impl QueueMessage for Hello {
    const TYPE_NAME: &'static str = "Hello";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HelloResponse {
    result: String,
}

impl QueueMessage for HelloResponse {
    const TYPE_NAME: &'static str = "HelloResponse";
}

fn hello(name: &str) -> Hello {
    Hello {
        name: name.to_string(),
    }
}

fn memory_server() -> (Arc<MemoryTransport>, MqServer) {
    let broker = Arc::new(MemoryTransport::new());
    let server = MqServer::builder(broker.clone())
        .poll_interval(Duration::from_millis(20))
        .build();
    (broker, server)
}

fn register_greeter(server: &MqServer) {
    server
        .register_handler(|m: Message<Hello>| async move {
            Ok(Some(HelloResponse {
                result: format!("Hello, {}!", m.body.name),
            }))
        })
        .unwrap();
}

#[tokio::test]
async fn test_successful_request_is_answered_once() {
    let (broker, server) = memory_server();
    register_greeter(&server);
    server.start().await.unwrap();

    let client = server.create_message_queue_client();
    client.publish(hello("World")).await.unwrap();

    let reply: Received<HelloResponse> = client.get("mq:HelloResponse.inq", WAIT).await.unwrap();
    assert_eq!(reply.message.body.result, "Hello, World!");
    assert_eq!(reply.message.retry_attempts, 0);
    client.ack(&reply).await.unwrap();

    server.stop().await.unwrap();
    assert_eq!(broker.len("mq:Hello.dlq"), 0);
    assert_eq!(broker.len("mq:Hello.inq"), 0);

    let stats = server.stats();
    assert_eq!(stats.total_messages_processed, 1);
    assert_eq!(stats.total_messages_failed, 0);
    assert_eq!(stats.total_normal_messages_received, 1);
}

/// In-process broker whose first publish to one queue fails like a dropped
/// connection.
struct DroppedPublish {
    broker: Arc<MemoryTransport>,
    queue: &'static str,
    tripped: AtomicBool,
}

#[async_trait]
impl Transport for DroppedPublish {
    fn name(&self) -> &str {
        "dropped-publish"
    }

    async fn publish(&self, queue: &str, message: RawMessage) -> MqResult<()> {
        if queue == self.queue && !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(MqError::Connection("connection reset by peer".to_string()));
        }
        self.broker.publish(queue, message).await
    }

    async fn receive(&self, queue: &str, timeout: Duration) -> MqResult<Option<Delivery>> {
        self.broker.receive(queue, timeout).await
    }

    async fn ack(&self, delivery: &Delivery) -> MqResult<()> {
        self.broker.ack(delivery).await
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> MqResult<()> {
        self.broker.reject(delivery, requeue).await
    }

    async fn create_temp_queue(&self, queue: &str) -> MqResult<()> {
        self.broker.create_temp_queue(queue).await
    }

    async fn purge(&self, queue: &str) -> MqResult<u64> {
        self.broker.purge(queue).await
    }

    async fn list_queues(&self) -> MqResult<Vec<QueueInfo>> {
        self.broker.list_queues().await
    }

    async fn delete_queue(&self, queue: &str) -> MqResult<()> {
        self.broker.delete_queue(queue).await
    }

    async fn delete_queue_if_idle(&self, queue: &str, idle: Duration) -> MqResult<bool> {
        self.broker.delete_queue_if_idle(queue, idle).await
    }

    async fn close(&self) -> MqResult<()> {
        self.broker.close().await
    }
}

#[tokio::test]
async fn test_reply_publish_failure_hands_request_back_for_redelivery() {
    let broker = Arc::new(MemoryTransport::new());
    let transport = Arc::new(DroppedPublish {
        broker: broker.clone(),
        queue: "mq:HelloResponse.inq",
        tripped: AtomicBool::new(false),
    });
    let server = MqServer::builder(transport.clone())
        .poll_interval(Duration::from_millis(20))
        .restart_backoff(Duration::from_millis(5), Duration::from_millis(20))
        .build();
    register_greeter(&server);
    server.start().await.unwrap();

    let client = server.create_message_queue_client();
    client.publish(hello("World")).await.unwrap();

    let reply: Received<HelloResponse> = client.get("mq:HelloResponse.inq", WAIT).await.unwrap();
    assert_eq!(reply.message.body.result, "Hello, World!");
    client.ack(&reply).await.unwrap();
    server.stop().await.unwrap();

    assert!(transport.tripped.load(Ordering::SeqCst));
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.len("mq:Hello.inq"), 0);
    assert_eq!(broker.len("mq:Hello.dlq"), 0);
    assert_eq!(server.stats().total_messages_processed, 1);
}

#[tokio::test]
async fn test_always_failing_handler_is_dead_lettered_after_retries() {
    let (_broker, server) = memory_server();
    let calls = Arc::new(AtomicU32::new(0));
    {
        let calls = Arc::clone(&calls);
        server
            .register_one_way(move |_m: Message<Hello>| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Failure::retryable("ArgumentException", "Name")) }
            })
            .unwrap();
    }
    server.start().await.unwrap();

    let client = server.create_message_queue_client();
    client.publish(hello("World")).await.unwrap();

    let dead: Received<Hello> = client.get("mq:Hello.dlq", WAIT).await.unwrap();
    server.stop().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(dead.message.retry_attempts, 1);
    let error = dead.message.error.clone().unwrap();
    assert_eq!(error.error_code, "ArgumentException");
    assert_eq!(error.message, "Name");
    assert!(client.try_get::<Value>("mq:Hello.dlq").await.unwrap().is_none());

    let stats = server.stats();
    assert_eq!(stats.total_messages_failed, 2);
    assert_eq!(stats.total_retries, 1);
}

#[tokio::test]
async fn test_reply_to_receives_response() {
    let (broker, server) = memory_server();
    register_greeter(&server);
    server.start().await.unwrap();

    let client = server.create_message_queue_client();
    let reply_to = client.get_temp_queue_name().await.unwrap();
    client
        .publish_message(Message::new(hello("World")).with_reply_to(reply_to.clone()))
        .await
        .unwrap();

    let reply: Received<HelloResponse> = client.get(&reply_to, WAIT).await.unwrap();
    assert_eq!(reply.message.body.result, "Hello, World!");

    server.stop().await.unwrap();
    assert_eq!(broker.len("mq:HelloResponse.inq"), 0);

    client.close().await.unwrap();
    assert!(!broker
        .list_queues()
        .await
        .unwrap()
        .iter()
        .any(|q| q.name == reply_to));
}

#[tokio::test]
async fn test_one_way_message_is_published_to_out_queue() {
    let (_broker, server) = memory_server();
    server
        .register_one_way(|_m: Message<Hello>| async { Ok(()) })
        .unwrap();
    server.start().await.unwrap();

    let client = server.create_message_queue_client();
    let original = Message::new(hello("World")).with_tag("order-7");
    client.publish_message(original.clone()).await.unwrap();

    let out: Received<Hello> = client.get("mq:Hello.outq", WAIT).await.unwrap();
    server.stop().await.unwrap();

    assert_eq!(out.message.id, original.id);
    assert_eq!(out.message.body, original.body);
    assert_eq!(out.message.tag.as_deref(), Some("order-7"));
    assert!(out.message.error.is_none());
}

#[tokio::test]
async fn test_out_queue_publishing_can_be_disabled() {
    let broker = Arc::new(MemoryTransport::new());
    let server = MqServer::builder(broker.clone())
        .poll_interval(Duration::from_millis(20))
        .disable_publishing_to_outq(true)
        .build();
    server
        .register_one_way(|_m: Message<Hello>| async { Ok(()) })
        .unwrap();
    server.start().await.unwrap();

    let client = server.create_message_queue_client();
    client
        .publish_message(Message::new(hello("World")).with_options(MessageOptions::NOTIFY_ONE_WAY))
        .await
        .unwrap();

    for _ in 0..100 {
        if server.stats().total_messages_processed == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    server.stop().await.unwrap();

    assert_eq!(server.stats().total_messages_processed, 1);
    assert_eq!(broker.len("mq:Hello.outq"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_start_and_stop_settle() {
    let broker = Arc::new(MemoryTransport::new());
    let server = MqServer::builder(broker)
        .worker_threads(2)
        .poll_interval(Duration::from_millis(20))
        .build();
    register_greeter(&server);

    let starts: Vec<_> = (0..8)
        .map(|_| {
            let server = server.clone();
            tokio::spawn(async move { server.start().await })
        })
        .collect();
    for start in starts {
        start.await.unwrap().unwrap();
    }

    assert_eq!(server.status(), ServerStatus::Started);
    assert_eq!(server.bg_thread_count(), 1);
    assert_eq!(server.live_worker_count(), 2);

    let stops: Vec<_> = (0..8)
        .map(|_| {
            let server = server.clone();
            tokio::spawn(async move { server.stop().await })
        })
        .collect();
    for stop in stops {
        stop.await.unwrap().unwrap();
    }

    assert_eq!(server.status(), ServerStatus::Stopped);
    assert_eq!(server.live_worker_count(), 0);

    server.start().await.unwrap();
    assert_eq!(server.bg_thread_count(), 2);
    server.dispose().await.unwrap();
    assert_eq!(server.live_worker_count(), 0);
}

#[tokio::test]
async fn test_custom_exception_handler_that_requeues_never_dead_letters() {
    let broker = Arc::new(MemoryTransport::new());
    let server = MqServer::builder(broker.clone())
        .poll_interval(Duration::from_millis(20))
        .exception_handler::<Hello, _>(|_h: &MessageHandler, _m: &Message<Value>, _f: &Failure| {
            FailureAction::Requeue
        })
        .build();
    server
        .register_one_way(|m: Message<Hello>| async move {
            if m.retry_attempts < 4 {
                return Err(Failure::unretryable("Fatal", "not yet"));
            }
            Ok(())
        })
        .unwrap();
    server.start().await.unwrap();

    let client = server.create_message_queue_client();
    client.publish(hello("World")).await.unwrap();

    let out: Received<Hello> = client.get("mq:Hello.outq", WAIT).await.unwrap();
    server.stop().await.unwrap();

    assert_eq!(out.message.retry_attempts, 4);
    assert_eq!(broker.len("mq:Hello.dlq"), 0);
    assert_eq!(server.stats().total_retries, 4);
}

#[tokio::test]
async fn test_default_exception_handler_applies_to_every_type() {
    let broker = Arc::new(MemoryTransport::new());
    let server = MqServer::builder(broker.clone())
        .poll_interval(Duration::from_millis(20))
        .retry_count(10)
        .default_exception_handler(|_h: &MessageHandler, _m: &Message<Value>, _f: &Failure| {
            FailureAction::DeadLetter
        })
        .build();
    server
        .register_one_way(|_m: Message<Hello>| async {
            Err(Failure::retryable("Transient", "flaky"))
        })
        .unwrap();
    server.start().await.unwrap();

    let client = server.create_message_queue_client();
    client.publish(hello("World")).await.unwrap();

    let dead: Received<Hello> = client.get("mq:Hello.dlq", WAIT).await.unwrap();
    server.stop().await.unwrap();
    assert_eq!(dead.message.retry_attempts, 0);
}

#[tokio::test]
async fn test_priority_queue_is_drained_first() {
    let (_broker, server) = memory_server();
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        server
            .register_one_way(move |m: Message<Hello>| {
                seen.lock().unwrap().push(m.body.name.clone());
                async { Ok(()) }
            })
            .unwrap();
    }

    let client = server.create_message_queue_client();
    client.publish(hello("normal")).await.unwrap();
    client
        .publish_message(Message::new(hello("urgent")).with_priority(1))
        .await
        .unwrap();

    server.start().await.unwrap();
    let _first: Received<Hello> = client.get("mq:Hello.outq", WAIT).await.unwrap();
    let _second: Received<Hello> = client.get("mq:Hello.outq", WAIT).await.unwrap();
    server.stop().await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["urgent", "normal"]);
    let stats = server.stats();
    assert_eq!(stats.total_priority_messages_received, 1);
    assert_eq!(stats.total_normal_messages_received, 1);
}

#[tokio::test]
async fn test_prefixed_queue_names_and_temp_queue_expiry() {
    let broker = Arc::new(MemoryTransport::new());
    let server = MqServer::builder(broker.clone())
        .queue_names(QueueNames::new().with_prefix("site1."))
        .poll_interval(Duration::from_millis(20))
        .build();
    register_greeter(&server);
    server.start().await.unwrap();

    let client = server.create_message_queue_client();
    let temp = client.get_temp_queue_name().await.unwrap();
    assert!(temp.starts_with("site1.mq:tmp:"));
    assert!(server.names().is_temp_queue(&temp));

    client.publish(hello("World")).await.unwrap();
    let reply: Received<HelloResponse> = client
        .get("site1.mq:HelloResponse.inq", WAIT)
        .await
        .unwrap();
    assert_eq!(reply.message.body.result, "Hello, World!");
    server.stop().await.unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(
        server
            .expire_temp_queues(Duration::from_millis(10))
            .await
            .unwrap(),
        1
    );
    let remaining: Vec<String> = broker
        .list_queues()
        .await
        .unwrap()
        .into_iter()
        .map(|q| q.name)
        .collect();
    assert!(!remaining.contains(&temp));
    assert!(remaining.contains(&"site1.mq:Hello.inq".to_string()));
}

#[tokio::test]
async fn test_disposed_server_cannot_restart() {
    let (_broker, server) = memory_server();
    register_greeter(&server);
    server.start().await.unwrap();
    server.dispose().await.unwrap();

    assert_eq!(server.status(), ServerStatus::Disposed);
    assert!(matches!(server.start().await, Err(MqError::ObjectDisposed)));
    assert!(matches!(server.stop().await, Err(MqError::ObjectDisposed)));
    server.dispose().await.unwrap();
}

#[tokio::test]
async fn test_failover_retargets_running_server() {
    let factory = Arc::new(DefaultTransportFactory::new());
    let failover = Arc::new(
        FailoverTransport::connect("memory://primary", factory.clone())
            .await
            .unwrap(),
    );
    let server = courier::MqServerBuilder::with_failover(failover)
        .poll_interval(Duration::from_millis(20))
        .build();
    register_greeter(&server);
    server.start().await.unwrap();

    let client = server.create_message_queue_client();
    client.publish(hello("primary")).await.unwrap();
    let reply: Received<HelloResponse> = client.get("mq:HelloResponse.inq", WAIT).await.unwrap();
    assert_eq!(reply.message.body.result, "Hello, primary!");
    client.ack(&reply).await.unwrap();

    server.failover_to("memory://backup").await.unwrap();
    client.publish(hello("backup")).await.unwrap();
    let reply: Received<HelloResponse> = client.get("mq:HelloResponse.inq", WAIT).await.unwrap();
    assert_eq!(reply.message.body.result, "Hello, backup!");
    client.ack(&reply).await.unwrap();
    server.stop().await.unwrap();

    let backup = factory.memory_broker("backup").unwrap();
    assert_eq!(backup.len("mq:Hello.inq"), 0);
    assert_eq!(backup.unacked_count(), 0);
}

#[tokio::test]
async fn test_filters_and_response_hooks() {
    let broker = Arc::new(MemoryTransport::new());
    let received_headers = Arc::new(Mutex::new(Vec::new()));
    let observed = Arc::new(AtomicU32::new(0));
    let server = {
        let received_headers = Arc::clone(&received_headers);
        let observed = Arc::clone(&observed);
        MqServer::builder(broker)
            .poll_interval(Duration::from_millis(20))
            .publish_filter(|_queue: &str, headers: &mut Headers| {
                headers.insert("x-tenant".to_string(), "acme".to_string());
            })
            .receive_filter(move |queue: &str, headers: &Headers| {
                received_headers
                    .lock()
                    .unwrap()
                    .push((queue.to_string(), headers.get("x-tenant").cloned()));
            })
            .get_message_filter(move |_queue: &str, _m: &Message<Value>| {
                observed.fetch_add(1, Ordering::SeqCst);
            })
            .response_filter(|request_type: &str, reply: &mut Message<Value>| {
                reply
                    .meta
                    .insert("handled-by".to_string(), request_type.to_string());
            })
            .build()
    };
    register_greeter(&server);
    server.start().await.unwrap();

    let client = server.create_message_queue_client();
    client.publish(hello("World")).await.unwrap();
    let reply: Received<HelloResponse> = client.get("mq:HelloResponse.inq", WAIT).await.unwrap();
    server.stop().await.unwrap();

    assert_eq!(
        reply.message.meta.get("handled-by").map(String::as_str),
        Some("Hello")
    );
    assert_eq!(observed.load(Ordering::SeqCst), 1);
    let received_headers = received_headers.lock().unwrap();
    assert!(received_headers.contains(&("mq:Hello.inq".to_string(), Some("acme".to_string()))));
}
