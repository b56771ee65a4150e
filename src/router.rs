//! Envelope router / host loop (C7, §4.7): the single consumer-side loop
//! that polls the broker, resolves a topic to a node, enforces the
//! router-owned backpressure bound, and dispatches the bound executor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::broker::{BrokerConsumer, BrokerError, Delivery};
use crate::envelope::{CorrelationId, Envelope};
use crate::executor::EffectInput;
use crate::metrics::HostMetrics;
use crate::publisher::ResultPublisher;
use crate::registry::NodeRegistry;

/// What one call to [`Router::run_once`] did, for the caller's own
/// idle-backoff decision.
#[derive(Debug, PartialEq, Eq)]
pub enum Tick {
    /// Nothing was waiting on the broker.
    Idle,
    /// One delivery was accepted and dispatched (or routed to the DLQ).
    Routed,
}

/// Owns the single [`BrokerConsumer`] for this process and drives the
/// poll -> route -> dispatch -> publish -> commit cycle (§4.7 steps 1–7).
///
/// `max_in_flight` bounds concurrent dispatches independently of any
/// per-handler pool bulkhead (§5 "Backpressure": "two independent knobs").
pub struct Router {
    consumer: Arc<dyn BrokerConsumer>,
    registry: Arc<NodeRegistry>,
    publisher: Arc<ResultPublisher>,
    metrics: Arc<HostMetrics>,
    semaphore: Arc<Semaphore>,
    max_in_flight: usize,
    shutting_down: Arc<AtomicBool>,
}

impl Router {
    pub fn new(
        consumer: Arc<dyn BrokerConsumer>,
        registry: Arc<NodeRegistry>,
        publisher: Arc<ResultPublisher>,
        max_in_flight: usize,
    ) -> Self {
        Self {
            consumer,
            registry,
            publisher,
            metrics: Arc::new(HostMetrics::default()),
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn metrics(&self) -> Arc<HostMetrics> {
        self.metrics.clone()
    }

    /// Current in-flight dispatch count, for [`crate::health::HealthMonitor::shutdown`]'s
    /// drain check.
    pub fn in_flight(&self) -> u64 {
        self.metrics.snapshot().current_in_flight
    }

    pub async fn subscribe(&self) -> Result<(), BrokerError> {
        let topics: Vec<String> = self.registry.subscribed_topics().map(str::to_string).collect();
        self.consumer.subscribe(&topics).await
    }

    /// Stops [`Router::run`]'s poll loop after its current iteration.
    pub fn request_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    /// Runs the poll loop until [`Router::request_shutdown`] is called,
    /// sleeping briefly between empty polls rather than busy-waiting.
    pub async fn run(&self) {
        while !self.shutting_down.load(Ordering::Acquire) {
            if self.run_once().await == Tick::Idle {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    /// One poll of the broker. Dispatch itself happens on a spawned task so
    /// backpressure is the only thing that blocks this call; panics inside
    /// the spawned task are caught and routed to the DLQ rather than
    /// silently dropping the in-flight permit (§8: "no poison pills").
    pub async fn run_once(&self) -> Tick {
        let delivery = match self.consumer.poll().await {
            Ok(Some(d)) => d,
            Ok(None) => return Tick::Idle,
            Err(e) => {
                tracing::error!(error = %e, "broker poll failed");
                return Tick::Idle;
            }
        };

        self.route_delivery(delivery).await;
        Tick::Routed
    }

    async fn route_delivery(&self, delivery: Delivery) {
        let envelope: Envelope = match serde_json::from_slice(&delivery.raw) {
            Ok(e) => e,
            Err(err) => {
                let (unknown, _warning) = CorrelationId::sanitize("");
                self.dlq(unknown, format!("envelope parse failure: {err}"), &delivery.raw, Some(delivery.topic.clone()))
                    .await;
                let _ = self.consumer.commit(&delivery.topic, delivery.offset).await;
                return;
            }
        };

        let (correlation_id, warning) = CorrelationId::sanitize(envelope.correlation_id.as_str());
        if let Some(warning) = warning {
            tracing::warn!(prefix = %warning.original_prefix, "correlation id failed sanitization, replaced with 'unknown'");
        }

        let node_id = match self.registry.node_for_topic(&delivery.topic) {
            Some(id) => id.to_string(),
            None => {
                self.dlq(
                    correlation_id,
                    format!("no node bound to topic '{}'", delivery.topic),
                    &delivery.raw,
                    Some(delivery.topic.clone()),
                )
                .await;
                let _ = self.consumer.commit(&delivery.topic, delivery.offset).await;
                return;
            }
        };

        let Some(executor) = self.registry.get(&node_id).cloned() else {
            self.dlq(
                correlation_id,
                format!("node '{node_id}' not bound to an executor"),
                &delivery.raw,
                Some(delivery.topic.clone()),
            )
            .await;
            let _ = self.consumer.commit(&delivery.topic, delivery.offset).await;
            return;
        };

        let wait_start = Instant::now();
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return,
        };
        let waited_ms = wait_start.elapsed().as_millis() as u64;
        self.metrics.record_acquired(self.max_in_flight, waited_ms);

        let publisher = self.publisher.clone();
        let consumer = self.consumer.clone();
        let metrics = self.metrics.clone();
        let topic = delivery.topic.clone();
        let offset = delivery.offset;
        let raw = delivery.raw.clone();
        let operation = envelope.operation.clone();
        let contract = executor.contract().clone();

        tokio::spawn(async move {
            let _permit = permit;
            let input = EffectInput {
                operation: operation.clone(),
                params: envelope.payload.clone(),
                correlation_id: correlation_id.as_str().to_string(),
                context: serde_json::Value::Object(
                    envelope.metadata.iter().map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone()))).collect(),
                ),
            };

            let dispatch = std::panic::AssertUnwindSafe(executor.execute(input)).catch_unwind();
            match dispatch.await {
                Ok(output) => {
                    if let Err(err) = publisher.publish_result(&envelope, &contract, &output).await {
                        tracing::error!(node_id = %contract.node_id, error = %err, "failed to publish operation result");
                    }
                }
                Err(_) => {
                    tracing::error!(node_id = %contract.node_id, "executor panicked, routing to dead-letter queue");
                    if let Err(err) = publisher
                        .publish_dlq(correlation_id.clone(), "executor panicked during dispatch", &raw, Some(topic.clone()))
                        .await
                    {
                        tracing::error!(error = %err, "failed to publish dead-letter record after panic");
                    }
                }
            }

            if let Err(err) = consumer.commit(&topic, offset).await {
                tracing::error!(error = %err, "failed to commit offset after dispatch");
            }
            metrics.record_released();
        });
    }

    async fn dlq(&self, correlation_id: CorrelationId, reason: String, raw: &[u8], source_topic: Option<String>) {
        if let Err(err) = self.publisher.publish_dlq(correlation_id, reason, raw, source_topic).await {
            tracing::error!(error = %err, "failed to publish dead-letter record");
        }
    }
}
