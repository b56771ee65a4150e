//! Kafka-backed broker (C3/C7, §4.7): a [`BrokerConsumer`]/[`BrokerProducer`]
//! pair for the host loop and publisher, plus a `broker-produce`
//! [`ProtocolHandler`] for nodes whose effect is publishing to a topic
//! rather than calling out over REST/Cypher/SQL.
//!
//! Offset tracking assumes one partition per subscribed topic: a
//! `Delivery` carries only `(topic, offset)` (§4.7), so committing back a
//! specific partition requires remembering which partition a given
//! `(topic, offset)` pair came from. Multi-partition topics would need a
//! richer `Delivery` shape upstream.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nodeforge::broker::{BrokerConsumer, BrokerError, BrokerProducer, Delivery};
use nodeforge::contract::{ConnectionConfig, ProtocolKind};
use nodeforge::envelope::Envelope;
use nodeforge::handler::{HandlerInitError, HandlerOutcome, HandlerRequest, HandlerResponse, HandlerTimeout, ProtocolHandler};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use serde_json::Value;
use tokio::sync::RwLock;

/// Wraps one `rdkafka` [`StreamConsumer`]. Built once per process by the
/// host loop (§3 ownership rules).
pub struct KafkaConsumer {
    consumer: StreamConsumer,
    partitions: Mutex<HashMap<(String, u64), i32>>,
}

impl KafkaConsumer {
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Result<Self, BrokerError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| BrokerError(e.to_string()))?;
        Ok(Self { consumer, partitions: Mutex::new(HashMap::new()) })
    }
}

#[async_trait]
impl BrokerConsumer for KafkaConsumer {
    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        let refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&refs).map_err(|e| BrokerError(e.to_string()))
    }

    async fn poll(&self) -> Result<Option<Delivery>, BrokerError> {
        match tokio::time::timeout(Duration::from_millis(50), self.consumer.recv()).await {
            Ok(Ok(message)) => {
                let topic = message.topic().to_string();
                let offset = message.offset() as u64;
                let raw = message.payload().unwrap_or_default().to_vec();
                self.partitions.lock().expect("kafka consumer mutex poisoned").insert((topic.clone(), offset), message.partition());
                Ok(Some(Delivery { topic, raw, offset }))
            }
            Ok(Err(e)) => Err(BrokerError(e.to_string())),
            Err(_) => Ok(None),
        }
    }

    async fn commit(&self, topic: &str, offset: u64) -> Result<(), BrokerError> {
        let partition = self
            .partitions
            .lock()
            .expect("kafka consumer mutex poisoned")
            .remove(&(topic.to_string(), offset))
            .unwrap_or(0);
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(offset as i64 + 1)).map_err(|e| BrokerError(e.to_string()))?;
        self.consumer.commit(&tpl, CommitMode::Async).map_err(|e| BrokerError(e.to_string()))
    }
}

/// Wraps one `rdkafka` [`FutureProducer`], shared by [`nodeforge::publisher::ResultPublisher`]
/// and any `broker-produce` handler instances in the same process.
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    pub fn new(bootstrap_servers: &str) -> Result<Self, BrokerError> {
        let producer: FutureProducer = producer_config(bootstrap_servers).create().map_err(|e| BrokerError(e.to_string()))?;
        Ok(Self { producer })
    }
}

/// Shared producer configuration (§4.3: "idempotent, acks=all, compressed").
fn producer_config(bootstrap_servers: &str) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", bootstrap_servers)
        .set("enable.idempotence", "true")
        .set("acks", "all")
        .set("compression.type", "snappy");
    config
}

#[async_trait]
impl BrokerProducer for KafkaProducer {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), BrokerError> {
        let payload = serde_json::to_vec(envelope).map_err(|e| BrokerError(e.to_string()))?;
        let key = envelope.correlation_id.as_str().to_string();
        let record = FutureRecord::to(topic).payload(&payload).key(&key);
        self.producer.send(record, Duration::from_secs(5)).await.map(|_| ()).map_err(|(e, _)| BrokerError(e.to_string()))
    }
}

/// `broker-produce` protocol handler (§4.3): executes `RequestTemplate::Broker`
/// operations by publishing the operation's input payload as the message
/// body to `topic`, keyed by `key` (defaulting to the correlation id) and
/// carrying `headers`. `acks=all` and `compression.type` are set on the
/// producer at `init` time so every `broker-produce` handler inherits them.
pub struct BrokerProduceHandler {
    producer: RwLock<Option<FutureProducer>>,
}

impl Default for BrokerProduceHandler {
    fn default() -> Self {
        Self { producer: RwLock::new(None) }
    }
}

impl BrokerProduceHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProtocolHandler for BrokerProduceHandler {
    async fn init(&self, config: &ConnectionConfig) -> Result<(), HandlerInitError> {
        let bootstrap_servers = config
            .url
            .clone()
            .or_else(|| config.host.clone())
            .ok_or_else(|| HandlerInitError::InvalidConfig("broker connection requires 'url' or 'host'".to_string()))?;
        let producer: FutureProducer =
            producer_config(&bootstrap_servers).create().map_err(|e| HandlerInitError::ConnectionFailed(e.to_string()))?;
        *self.producer.write().await = Some(producer);
        Ok(())
    }

    async fn execute(&self, request: HandlerRequest) -> HandlerOutcome {
        let start = Instant::now();

        let Some(producer) = self.producer.read().await.clone() else {
            return HandlerOutcome::Response(HandlerResponse::failure("broker handler not initialized", 0.0));
        };

        let template = match BrokerRequest::from_params(&request.params) {
            Ok(t) => t,
            Err(message) => return HandlerOutcome::Response(HandlerResponse::failure(message, 0.0)),
        };

        let payload = match serde_json::to_vec(&request.input_payload) {
            Ok(bytes) => bytes,
            Err(e) => return HandlerOutcome::Response(HandlerResponse::failure(e.to_string(), 0.0)),
        };
        let key = resolve_key(template.key.as_deref(), &request.correlation_id);

        let record = FutureRecord::to(&template.topic).payload(&payload).key(&key).headers(kafka_headers(&template.headers));

        let deadline = Duration::from_millis(request.timeout_ms);
        match tokio::time::timeout(deadline, producer.send(record, Duration::from_secs(0))).await {
            Ok(Ok((partition, offset))) => HandlerOutcome::Response(HandlerResponse::ok(
                serde_json::json!({"topic": template.topic, "partition": partition, "offset": offset}),
                elapsed_ms(start),
            )),
            Ok(Err((e, _))) => HandlerOutcome::Response(HandlerResponse::failure(e.to_string(), elapsed_ms(start))),
            Err(_) => HandlerOutcome::Timeout(HandlerTimeout { elapsed: start.elapsed(), limit: deadline }),
        }
    }

    async fn health(&self) -> bool {
        self.producer.read().await.is_some()
    }

    async fn shutdown(&self) {
        *self.producer.write().await = None;
    }

    fn protocol_kind(&self) -> ProtocolKind {
        ProtocolKind::BrokerProduce
    }
}

fn kafka_headers(fields: &HashMap<String, Value>) -> OwnedHeaders {
    let mut headers = OwnedHeaders::new();
    for (k, v) in fields {
        let value = match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        headers = headers.insert(Header { key: k, value: Some(&value) });
    }
    headers
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// A template without an explicit `key` falls back to the correlation id,
/// so related messages still land on the same partition (§4.3).
fn resolve_key(template_key: Option<&str>, correlation_id: &str) -> String {
    template_key.unwrap_or(correlation_id).to_string()
}

/// Parsed, substituted shape of a `RequestTemplate::Broker` as rendered by
/// [`nodeforge::substitute::render`].
struct BrokerRequest {
    topic: String,
    key: Option<String>,
    headers: HashMap<String, Value>,
}

impl BrokerRequest {
    fn from_params(params: &Value) -> Result<Self, String> {
        let obj = params.as_object().ok_or("broker request params must be an object")?;
        let topic = obj.get("topic").and_then(Value::as_str).ok_or("missing 'topic'")?.to_string();
        let key = obj.get("key").and_then(Value::as_str).map(str::to_string);
        let headers = obj
            .get("headers")
            .and_then(Value::as_object)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Ok(Self { topic, key, headers })
    }
}
