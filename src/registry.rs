//! Node registry (C6, §4.6): binds loaded contracts to protocol handlers,
//! resolves the runtime profile, and validates the dependency graph.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::contract::{Contract, NodeKind, OnMissingHandler, ProtocolKind};
use crate::error::NodeforgeError;
use crate::executor::Executor;
use crate::handler::ProtocolHandler;

/// Which population of nodes this process hosts (§4.6). A process with the
/// `main` profile runs compute/reducer/orchestrator nodes; `effects` runs
/// only `effect` nodes against live protocol handlers; `all` runs every
/// node in one process; `local-dev` runs every node against
/// [`crate::handler::memory::MockProtocolHandler`] instead of live handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeProfile {
    Main,
    Effects,
    All,
    LocalDev,
}

impl RuntimeProfile {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "main" => Some(RuntimeProfile::Main),
            "effects" => Some(RuntimeProfile::Effects),
            "all" => Some(RuntimeProfile::All),
            "local-dev" => Some(RuntimeProfile::LocalDev),
            _ => None,
        }
    }

    /// Whether a node of this kind is hosted under this profile (§4.6).
    pub fn admits(&self, kind: NodeKind) -> bool {
        match self {
            RuntimeProfile::Effects => matches!(kind, NodeKind::Effect),
            RuntimeProfile::Main => !matches!(kind, NodeKind::Effect),
            RuntimeProfile::All | RuntimeProfile::LocalDev => true,
        }
    }

    /// Whether handlers should be served from the in-memory mock rather
    /// than a live protocol handler pool.
    pub fn uses_mock_handlers(&self) -> bool {
        matches!(self, RuntimeProfile::LocalDev)
    }
}

impl fmt::Display for RuntimeProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuntimeProfile::Main => "main",
            RuntimeProfile::Effects => "effects",
            RuntimeProfile::All => "all",
            RuntimeProfile::LocalDev => "local-dev",
        };
        write!(f, "{s}")
    }
}

/// The bound, validated set of nodes this process hosts (§4.6). Built once
/// at startup; the executor table is never mutated afterward.
pub struct NodeRegistry {
    profile: RuntimeProfile,
    executors: HashMap<String, Arc<Executor>>,
    topic_to_node: HashMap<String, String>,
}

impl NodeRegistry {
    /// Builds a registry from every loaded contract and a table of
    /// protocol handlers keyed by the kind they service.
    ///
    /// Validates, in order: no duplicate `node_id`, the dependency graph
    /// named by `depends_on` is acyclic, and every node retained by the
    /// profile has its required handler bound (subject to
    /// `on_missing_handler`, §4.6).
    pub fn build(
        contracts: Vec<Contract>,
        handlers: &HashMap<ProtocolKind, Arc<dyn ProtocolHandler>>,
        profile: RuntimeProfile,
        env: HashMap<String, String>,
    ) -> Result<NodeRegistry, NodeforgeError> {
        let mut by_id: HashMap<String, Contract> = HashMap::with_capacity(contracts.len());
        for contract in contracts {
            let node_id = contract.node_id.clone();
            if by_id.insert(node_id.clone(), contract).is_some() {
                return Err(NodeforgeError::DuplicateNodeId(node_id));
            }
        }

        detect_cycles(&by_id)?;

        let mut executors = HashMap::with_capacity(by_id.len());
        let mut topic_to_node = HashMap::with_capacity(by_id.len());

        for (node_id, contract) in by_id {
            if !profile.admits(contract.kind) {
                continue;
            }

            let handler = match handlers.get(&contract.protocol_kind) {
                Some(h) => h.clone(),
                None => match contract.on_missing_handler {
                    OnMissingHandler::SkipSilently => continue,
                    OnMissingHandler::WarnAndSkip => {
                        tracing::warn!(node_id, protocol = %contract.protocol_kind, "handler missing, skipping node");
                        continue;
                    }
                    OnMissingHandler::Degrade => {
                        tracing::error!(node_id, protocol = %contract.protocol_kind, "handler missing, node degraded");
                        continue;
                    }
                    OnMissingHandler::Error => {
                        return Err(NodeforgeError::RequiredHandlerMissing {
                            node_id: node_id.clone(),
                            handler_kind: contract.protocol_kind.to_string(),
                        })
                    }
                },
            };

            topic_to_node.insert(contract.subscribe_topic.clone(), node_id.clone());
            let executor = Executor::new(Arc::new(contract), handler, env.clone());
            executors.insert(node_id, Arc::new(executor));
        }

        Ok(NodeRegistry { profile, executors, topic_to_node })
    }

    pub fn profile(&self) -> RuntimeProfile {
        self.profile
    }

    pub fn get(&self, node_id: &str) -> Option<&Arc<Executor>> {
        self.executors.get(node_id)
    }

    pub fn node_for_topic(&self, topic: &str) -> Option<&str> {
        self.topic_to_node.get(topic).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Executor>> {
        self.executors.values()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    pub fn subscribed_topics(&self) -> impl Iterator<Item = &str> {
        self.topic_to_node.keys().map(String::as_str)
    }
}

fn detect_cycles(contracts: &HashMap<String, Contract>) -> Result<(), NodeforgeError> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        node_id: &str,
        contracts: &HashMap<String, Contract>,
        marks: &mut HashMap<String, Mark>,
        stack: &mut Vec<String>,
    ) -> Result<(), NodeforgeError> {
        match marks.get(node_id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                stack.push(node_id.to_string());
                let cycle_start = stack.iter().position(|n| n == node_id).unwrap_or(0);
                return Err(NodeforgeError::DependencyCycle(stack[cycle_start..].join(" -> ")));
            }
            None => {}
        }

        let Some(contract) = contracts.get(node_id) else { return Ok(()) };
        marks.insert(node_id.to_string(), Mark::Visiting);
        stack.push(node_id.to_string());
        for dep in &contract.depends_on {
            visit(dep, contracts, marks, stack)?;
        }
        stack.pop();
        marks.insert(node_id.to_string(), Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    for node_id in contracts.keys() {
        let mut stack = Vec::new();
        visit(node_id, contracts, &mut marks, &mut stack)?;
    }
    Ok(())
}
