//! Cypher-over-Bolt protocol handler (C3, §4.3): executes
//! `RequestTemplate::Cypher` operations against a pooled [`neo4rs::Graph`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use nodeforge::contract::{AuthConfig, ConnectionConfig, ProtocolKind};
use nodeforge::handler::{HandlerInitError, HandlerOutcome, HandlerRequest, HandlerResponse, HandlerTimeout, ProtocolHandler};
use serde_json::Value;
use tokio::sync::RwLock;

/// One Bolt connection pool. `init` is idempotent across a
/// `shutdown -> init` boundary, rebuilding from the same config (§4.3).
pub struct GraphHandler {
    graph: RwLock<Option<neo4rs::Graph>>,
}

impl Default for GraphHandler {
    fn default() -> Self {
        Self { graph: RwLock::new(None) }
    }
}

impl GraphHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProtocolHandler for GraphHandler {
    async fn init(&self, config: &ConnectionConfig) -> Result<(), HandlerInitError> {
        let uri = match (&config.url, &config.host, config.port) {
            (Some(url), _, _) => url.clone(),
            (None, Some(host), Some(port)) => format!("bolt://{host}:{port}"),
            (None, Some(host), None) => format!("bolt://{host}:7687"),
            _ => return Err(HandlerInitError::InvalidConfig("graph connection requires 'url' or 'host'".to_string())),
        };

        let (user, password) = match &config.auth {
            Some(AuthConfig::Basic { username, password }) => (username.clone(), password.clone()),
            Some(_) => return Err(HandlerInitError::InvalidConfig("graph handler only supports basic auth".to_string())),
            None => return Err(HandlerInitError::InvalidConfig("graph connection requires basic auth credentials".to_string())),
        };

        let mut builder = neo4rs::ConfigBuilder::default().uri(uri).user(user).password(password).max_connections(config.pool_max as usize);
        if let Some(database) = &config.database {
            builder = builder.db(database.clone());
        }
        let graph_config = builder.build().map_err(|e| HandlerInitError::InvalidConfig(e.to_string()))?;

        let graph = neo4rs::Graph::connect(graph_config).await.map_err(|e| HandlerInitError::ConnectionFailed(e.to_string()))?;

        *self.graph.write().await = Some(graph);
        Ok(())
    }

    async fn execute(&self, request: HandlerRequest) -> HandlerOutcome {
        let start = Instant::now();

        let Some(graph) = self.graph.read().await.clone() else {
            return HandlerOutcome::Response(HandlerResponse::failure("graph handler not initialized", 0.0));
        };

        let template = match CypherRequest::from_params(&request.params) {
            Ok(t) => t,
            Err(message) => return HandlerOutcome::Response(HandlerResponse::failure(message, 0.0)),
        };

        let deadline = Duration::from_millis(request.timeout_ms);
        match tokio::time::timeout(deadline, run_query(&graph, &template)).await {
            Ok(Ok((records, counters))) => HandlerOutcome::Response(HandlerResponse::ok(
                serde_json::json!({ "records": records, "counters": counters }),
                elapsed_ms(start),
            )),
            Ok(Err(message)) => HandlerOutcome::Response(HandlerResponse::failure(message, elapsed_ms(start))),
            Err(_) => HandlerOutcome::Timeout(HandlerTimeout { elapsed: start.elapsed(), limit: deadline }),
        }
    }

    async fn health(&self) -> bool {
        let Some(graph) = self.graph.read().await.clone() else { return false };
        let probe = async {
            let mut stream = graph.execute(neo4rs::query("RETURN 1")).await.ok()?;
            stream.next().await.ok().flatten()
        };
        tokio::time::timeout(Duration::from_secs(2), probe).await.ok().flatten().is_some()
    }

    async fn shutdown(&self) {
        *self.graph.write().await = None;
    }

    fn protocol_kind(&self) -> ProtocolKind {
        ProtocolKind::GraphCypher
    }
}

/// Returns `(records, counters)`: `records` is every result row, `counters`
/// is the write summary (nodes/relationships/properties created/deleted),
/// or `null` if the driver reported no summary for this query.
async fn run_query(graph: &neo4rs::Graph, template: &CypherRequest) -> Result<(Vec<Value>, Value), String> {
    let mut query = neo4rs::query(&template.query);
    for (name, value) in &template.param_mapping {
        query = bind_param(query, name, value);
    }

    let mut stream = graph.execute(query).await.map_err(|e| e.to_string())?;
    let mut records = Vec::new();
    while let Some(row) = stream.next().await.map_err(|e| e.to_string())? {
        records.push(row.to::<Value>().unwrap_or(Value::Null));
    }
    let counters = match stream.finish().await.map_err(|e| e.to_string())? {
        Some(summary) => counters_to_json(summary.stats()),
        None => Value::Null,
    };
    Ok((records, counters))
}

fn counters_to_json(stats: neo4rs::summary::Counters) -> Value {
    serde_json::json!({
        "nodes_created": stats.nodes_created(),
        "nodes_deleted": stats.nodes_deleted(),
        "relationships_created": stats.relationships_created(),
        "relationships_deleted": stats.relationships_deleted(),
        "properties_set": stats.properties_set(),
    })
}

fn bind_param(query: neo4rs::Query, name: &str, value: &Value) -> neo4rs::Query {
    match value {
        Value::String(s) => query.param(name, s.clone()),
        Value::Bool(b) => query.param(name, *b),
        Value::Number(n) if n.is_i64() => query.param(name, n.as_i64().unwrap_or_default()),
        Value::Number(n) => query.param(name, n.as_f64().unwrap_or_default()),
        Value::Null => query.param(name, ""),
        other => query.param(name, other.to_string()),
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Parsed, substituted shape of a `RequestTemplate::Cypher` as rendered by
/// [`nodeforge::substitute::render`].
struct CypherRequest {
    query: String,
    param_mapping: Vec<(String, Value)>,
}

impl CypherRequest {
    fn from_params(params: &Value) -> Result<Self, String> {
        let obj = params.as_object().ok_or("cypher request params must be an object")?;
        let query = obj.get("query").and_then(Value::as_str).ok_or("missing 'query'")?.to_string();
        let param_mapping = obj
            .get("param_mapping")
            .and_then(Value::as_object)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Ok(Self { query, param_mapping })
    }
}
