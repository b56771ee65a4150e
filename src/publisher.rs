//! Result publisher & DLQ (C8, §4.8): serializes one [`EffectOutput`] back
//! onto the broker, preserving correlation, or routes an envelope the
//! router itself could not process to the DLQ topic.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::broker::{BrokerError, BrokerProducer};
use crate::contract::Contract;
use crate::envelope::{Envelope, EnvelopeSource};
use crate::error::ErrorRecord;
use crate::executor::EffectOutput;

/// A DLQ envelope's payload (§4.8: "preserves every byte of routing
/// context available").
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DlqRecord {
    pub code: String,
    pub reason: String,
    pub raw_payload: String,
    pub source_topic: Option<String>,
}

/// Publishes [`EffectOutput`]s and DLQ records, stamping `event_id`/
/// `causation_id`/`timestamp` per §3's response-envelope invariant.
pub struct ResultPublisher {
    producer: Arc<dyn BrokerProducer>,
    source: EnvelopeSource,
    dlq_topic: String,
}

impl ResultPublisher {
    pub fn new(producer: Arc<dyn BrokerProducer>, source: EnvelopeSource, dlq_topic: impl Into<String>) -> Self {
        Self { producer, source, dlq_topic: dlq_topic.into() }
    }

    /// Publishes the success or failure envelope for one operation result
    /// (§4.8). The request envelope supplies `correlation_id`/`event_id`
    /// for the invariant in §3 ("response's causation_id equals the
    /// triggering request's event_id").
    pub async fn publish_result(
        &self,
        request: &Envelope,
        contract: &Contract,
        output: &EffectOutput,
    ) -> Result<(), BrokerError> {
        let event_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        if output.success {
            let payload = output.data.clone().unwrap_or(serde_json::Value::Null);
            let envelope =
                request.respond(event_id, contract.node_id.clone(), output.operation.clone(), payload, self.source.clone(), now);
            self.producer.publish(&contract.success_topic, &envelope).await
        } else {
            let record = output.error.clone().unwrap_or_else(|| {
                ErrorRecord::new(
                    crate::error::ErrorCode::HandlerFailure,
                    "operation failed with no recorded error",
                    output.correlation_id.clone(),
                    contract.node_id.clone(),
                    false,
                )
            });
            let payload = serde_json::to_value(&record).unwrap_or(serde_json::Value::Null);
            let envelope =
                request.respond(event_id, contract.node_id.clone(), output.operation.clone(), payload, self.source.clone(), now);
            self.producer.publish(&contract.failure_topic, &envelope).await
        }
    }

    /// Publishes a DLQ envelope for a message the router itself could not
    /// route (§4.7 steps 1/3, §7 `ENVELOPE_ROUTING_FAILURE`): a parse
    /// failure, an unknown topic, or an unhandled executor panic.
    pub async fn publish_dlq(
        &self,
        correlation_id: crate::envelope::CorrelationId,
        reason: impl Into<String>,
        raw_payload: &[u8],
        source_topic: Option<String>,
    ) -> Result<(), BrokerError> {
        let record = DlqRecord {
            code: "ENVELOPE_ROUTING_FAILURE".to_string(),
            reason: reason.into(),
            raw_payload: String::from_utf8_lossy(raw_payload).to_string(),
            source_topic,
        };
        let envelope = Envelope {
            event_id: Uuid::new_v4().to_string(),
            event_type: "onex.event".to_string(),
            correlation_id,
            causation_id: None,
            timestamp: Utc::now(),
            version: "1.0.0".to_string(),
            trace_id: None,
            metadata: HashMap::new(),
            source: self.source.clone(),
            node_id: "router".to_string(),
            operation: "route".to_string(),
            payload: serde_json::to_value(&record).unwrap_or(serde_json::Value::Null),
        };
        self.producer.publish(&self.dlq_topic, &envelope).await
    }
}
