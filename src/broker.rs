//! Broker abstraction (§3, §4.7): the consumer/producer seam the host
//! loop and publisher are built against. `memory` backs the `local-dev`
//! profile and `simulate-workflow`; a live Kafka implementation lives in
//! the separate `nodeforge-broker-kafka` crate so this crate stays free
//! of a librdkafka build dependency.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;

use crate::envelope::Envelope;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerError(pub String);

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "broker error: {}", self.0)
    }
}

impl std::error::Error for BrokerError {}

/// One delivered message, carrying enough to commit its offset after
/// successful dispatch (§4.7: "offset committed only after dispatch").
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub raw: Vec<u8>,
    pub offset: u64,
}

/// Consumer half of the broker seam. The host loop owns exactly one of
/// these per process (§3 ownership rules).
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError>;
    async fn poll(&self) -> Result<Option<Delivery>, BrokerError>;
    async fn commit(&self, topic: &str, offset: u64) -> Result<(), BrokerError>;
}

/// Producer half of the broker seam, used by [`crate::publisher`].
#[async_trait]
pub trait BrokerProducer: Send + Sync {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), BrokerError>;
}

pub mod memory {
    //! In-process mpsc-backed broker: every published topic becomes a
    //! channel any test or `simulate-workflow` run can drain directly.

    use super::*;
    use tokio::sync::mpsc;
    use tokio::sync::Mutex as AsyncMutex;

    struct TopicQueue {
        sender: mpsc::UnboundedSender<(Vec<u8>, u64)>,
        receiver: AsyncMutex<mpsc::UnboundedReceiver<(Vec<u8>, u64)>>,
    }

    /// A broker that lives entirely in process memory. `publish` on one
    /// handle is visible to `poll` on a handle built from the same
    /// [`MemoryBroker::handle`] family (they share the same topic map).
    pub struct MemoryBroker {
        topics: std::sync::Mutex<HashMap<String, std::sync::Arc<TopicQueue>>>,
        next_offset: std::sync::atomic::AtomicU64,
        published: AsyncMutex<Vec<(String, Envelope)>>,
    }

    impl Default for MemoryBroker {
        fn default() -> Self {
            Self {
                topics: std::sync::Mutex::new(HashMap::new()),
                next_offset: std::sync::atomic::AtomicU64::new(0),
                published: AsyncMutex::new(Vec::new()),
            }
        }
    }

    impl MemoryBroker {
        pub fn new() -> std::sync::Arc<Self> {
            std::sync::Arc::new(Self::default())
        }

        fn queue_for(&self, topic: &str) -> std::sync::Arc<TopicQueue> {
            let mut topics = self.topics.lock().expect("memory broker mutex poisoned");
            topics
                .entry(topic.to_string())
                .or_insert_with(|| {
                    let (tx, rx) = mpsc::unbounded_channel();
                    std::sync::Arc::new(TopicQueue { sender: tx, receiver: AsyncMutex::new(rx) })
                })
                .clone()
        }

        /// Pushes a raw message directly onto a topic, as if a test were
        /// acting as an upstream producer.
        pub fn push(&self, topic: &str, raw: Vec<u8>) {
            let offset = self.next_offset.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let queue = self.queue_for(topic);
            let _ = queue.sender.send((raw, offset));
        }

        /// Every envelope published so far, in publish order. Used by
        /// `simulate-workflow` and integration tests to assert on output
        /// without standing up a real consumer loop.
        pub async fn published(&self) -> Vec<(String, Envelope)> {
            self.published.lock().await.clone()
        }
    }

    #[async_trait]
    impl BrokerConsumer for MemoryBroker {
        async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
            for topic in topics {
                self.queue_for(topic);
            }
            Ok(())
        }

        async fn poll(&self) -> Result<Option<Delivery>, BrokerError> {
            let topics: Vec<std::sync::Arc<TopicQueue>> = {
                let map = self.topics.lock().expect("memory broker mutex poisoned");
                map.values().cloned().collect()
            };
            for queue in topics {
                let mut receiver = queue.receiver.lock().await;
                if let Ok((raw, offset)) = receiver.try_recv() {
                    let topic = {
                        let map = self.topics.lock().expect("memory broker mutex poisoned");
                        map.iter().find(|(_, q)| std::sync::Arc::ptr_eq(q, &queue)).map(|(t, _)| t.clone())
                    };
                    if let Some(topic) = topic {
                        return Ok(Some(Delivery { topic, raw, offset }));
                    }
                }
            }
            Ok(None)
        }

        async fn commit(&self, _topic: &str, _offset: u64) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    #[async_trait]
    impl BrokerProducer for MemoryBroker {
        async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), BrokerError> {
            let raw = serde_json::to_vec(envelope).map_err(|e| BrokerError(e.to_string()))?;
            self.push(topic, raw);
            self.published.lock().await.push((topic.to_string(), envelope.clone()));
            Ok(())
        }
    }

}
