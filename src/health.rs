//! Health & lifecycle (C9, §4.9): per-node lifecycle state, aggregated
//! process health, and the cooperative shutdown sequence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::handler::ProtocolHandler;
use crate::registry::NodeRegistry;

const STATE_INITIALIZING: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_PROCESSING: u8 = 2;
const STATE_DEGRADED: u8 = 3;
const STATE_FAILED: u8 = 4;
const STATE_SHUTTING_DOWN: u8 = 5;
const STATE_STOPPED: u8 = 6;

/// One executor's lifecycle state (§4.9). `Processing` is informational
/// only — a node oscillates `Ready <-> Processing` on every dispatch; it
/// never gates routing decisions the way `Degraded`/`Failed` do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Initializing,
    Ready,
    Processing,
    Degraded,
    Failed,
    ShuttingDown,
    Stopped,
}

impl LifecycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            STATE_INITIALIZING => LifecycleState::Initializing,
            STATE_READY => LifecycleState::Ready,
            STATE_PROCESSING => LifecycleState::Processing,
            STATE_DEGRADED => LifecycleState::Degraded,
            STATE_FAILED => LifecycleState::Failed,
            STATE_SHUTTING_DOWN => LifecycleState::ShuttingDown,
            STATE_STOPPED => LifecycleState::Stopped,
            _ => unreachable!("invalid lifecycle state"),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            LifecycleState::Initializing => STATE_INITIALIZING,
            LifecycleState::Ready => STATE_READY,
            LifecycleState::Processing => STATE_PROCESSING,
            LifecycleState::Degraded => STATE_DEGRADED,
            LifecycleState::Failed => STATE_FAILED,
            LifecycleState::ShuttingDown => STATE_SHUTTING_DOWN,
            LifecycleState::Stopped => STATE_STOPPED,
        }
    }
}

/// Tracks one node's lifecycle state plus the consecutive-failure counter
/// that drives the `Ready -> Degraded` transition (§4.9: "two consecutive
/// checks").
pub struct NodeHealth {
    state: AtomicU8,
    consecutive_health_failures: AtomicUsize,
}

impl Default for NodeHealth {
    fn default() -> Self {
        Self { state: AtomicU8::new(STATE_INITIALIZING), consecutive_health_failures: AtomicUsize::new(0) }
    }
}

impl NodeHealth {
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set(&self, state: LifecycleState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    /// `INITIALIZING -> READY` once required handler init succeeds.
    pub fn mark_ready(&self) {
        self.set(LifecycleState::Ready);
        self.consecutive_health_failures.store(0, Ordering::Release);
    }

    /// Informational `READY <-> PROCESSING` toggle around one dispatch.
    pub fn enter_processing(&self) {
        if self.state() == LifecycleState::Ready {
            self.set(LifecycleState::Processing);
        }
    }

    pub fn leave_processing(&self) {
        if self.state() == LifecycleState::Processing {
            self.set(LifecycleState::Ready);
        }
    }

    /// Feeds one handler health-probe result. Two consecutive `false`
    /// probes transition `Ready -> Degraded`; one `true` probe from
    /// `Degraded` recovers to `Ready` (§4.9).
    pub fn record_probe(&self, healthy: bool) {
        if healthy {
            self.consecutive_health_failures.store(0, Ordering::Release);
            if self.state() == LifecycleState::Degraded {
                self.set(LifecycleState::Ready);
                tracing::info!("node recovered -> ready");
            }
            return;
        }
        let failures = self.consecutive_health_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= 2 && matches!(self.state(), LifecycleState::Ready | LifecycleState::Processing) {
            self.set(LifecycleState::Degraded);
            tracing::warn!(failures, "node degraded: handler health check failed twice");
        }
    }

    pub fn mark_failed(&self) {
        self.set(LifecycleState::Failed);
    }

    pub fn begin_shutdown(&self) {
        self.set(LifecycleState::ShuttingDown);
    }

    pub fn mark_stopped(&self) {
        self.set(LifecycleState::Stopped);
    }
}

/// Aggregated process health (§4.9): `Healthy` only if every required
/// handler is healthy and no node is `Degraded`/`Failed`; `Degraded` if an
/// optional handler is unhealthy or a node is individually `Degraded`;
/// otherwise `Unhealthy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Owns one [`NodeHealth`] per registered node and drives the periodic
/// handler health probe loop (§4.9: 30s interval).
pub struct HealthMonitor {
    nodes: HashMap<String, Arc<NodeHealth>>,
    probe_interval: Duration,
}

impl HealthMonitor {
    pub fn new(registry: &NodeRegistry) -> Self {
        let nodes = registry.iter().map(|e| (e.node_id().to_string(), Arc::new(NodeHealth::default()))).collect();
        Self { nodes, probe_interval: Duration::from_secs(30) }
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn probe_interval(&self) -> Duration {
        self.probe_interval
    }

    pub fn node(&self, node_id: &str) -> Option<&Arc<NodeHealth>> {
        self.nodes.get(node_id)
    }

    pub fn mark_all_ready(&self) {
        for node in self.nodes.values() {
            node.mark_ready();
        }
    }

    /// Runs one probe round against every distinct handler bound in the
    /// registry, updating each node's consecutive-failure counter.
    pub async fn probe_once(&self, registry: &NodeRegistry) {
        for executor in registry.iter() {
            let Some(node_health) = self.node(executor.node_id()) else { continue };
            let healthy = probe_with_budget(executor.handler()).await;
            node_health.record_probe(healthy);
        }
    }

    /// Aggregated view per §4.9's rule.
    pub fn process_health(&self) -> ProcessHealth {
        let mut degraded = false;
        for node in self.nodes.values() {
            match node.state() {
                LifecycleState::Failed => return ProcessHealth::Unhealthy,
                LifecycleState::Degraded => degraded = true,
                _ => {}
            }
        }
        if degraded {
            ProcessHealth::Degraded
        } else {
            ProcessHealth::Healthy
        }
    }

    /// Readiness view for a load balancer / orchestrator probe: ready once
    /// every node has left `Initializing`.
    pub fn is_ready(&self) -> bool {
        self.nodes.values().all(|n| !matches!(n.state(), LifecycleState::Initializing))
    }

    /// Cooperative shutdown (§4.9): marks every node `SHUTTING_DOWN`, waits
    /// for `in_flight` to drain to zero (via `in_flight_fn`) up to
    /// `timeout`, then returns whether the drain completed cleanly.
    pub async fn shutdown(&self, timeout: Duration, in_flight_fn: impl Fn() -> u64) -> bool {
        for node in self.nodes.values() {
            node.begin_shutdown();
        }
        let start = tokio::time::Instant::now();
        loop {
            if in_flight_fn() == 0 {
                for node in self.nodes.values() {
                    node.mark_stopped();
                }
                return true;
            }
            if start.elapsed() >= timeout {
                for node in self.nodes.values() {
                    node.mark_stopped();
                }
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Races a handler's `health()` against the 2s bound the contract requires
/// of implementers — a defensive measure against a handler that doesn't
/// self-bound (§4.3).
async fn probe_with_budget(handler: &Arc<dyn ProtocolHandler>) -> bool {
    match tokio::time::timeout(Duration::from_secs(2), handler.health()).await {
        Ok(healthy) => healthy,
        Err(_) => false,
    }
}
