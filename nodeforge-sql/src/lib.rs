//! SQL protocol handler (C3, §4.3): executes `RequestTemplate::Sql`
//! operations against a pooled [`sqlx::PgPool`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use nodeforge::contract::{AuthConfig, ConnectionConfig, ProtocolKind};
use nodeforge::handler::{HandlerInitError, HandlerOutcome, HandlerRequest, HandlerResponse, HandlerTimeout, ProtocolHandler};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column, Row, TypeInfo};
use tokio::sync::RwLock;

/// One Postgres connection pool. `init` is idempotent across a
/// `shutdown -> init` boundary (§4.3).
pub struct SqlHandler {
    pool: RwLock<Option<sqlx::PgPool>>,
}

impl Default for SqlHandler {
    fn default() -> Self {
        Self { pool: RwLock::new(None) }
    }
}

impl SqlHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProtocolHandler for SqlHandler {
    async fn init(&self, config: &ConnectionConfig) -> Result<(), HandlerInitError> {
        let url = match &config.url {
            Some(url) => url.clone(),
            None => {
                let host = config
                    .host
                    .clone()
                    .ok_or_else(|| HandlerInitError::InvalidConfig("sql connection requires 'url' or 'host'".to_string()))?;
                let port = config.port.unwrap_or(5432);
                let database = config.database.clone().unwrap_or_default();
                match &config.auth {
                    Some(AuthConfig::Basic { username, password }) => {
                        format!("postgres://{username}:{password}@{host}:{port}/{database}")
                    }
                    _ => return Err(HandlerInitError::InvalidConfig("sql connection requires basic auth credentials".to_string())),
                }
            }
        };

        let pool = PgPoolOptions::new()
            .min_connections(config.pool_min)
            .max_connections(config.pool_max)
            .acquire_timeout(Duration::from_millis(config.timeout_ms))
            .connect(&url)
            .await
            .map_err(|e| HandlerInitError::ConnectionFailed(e.to_string()))?;

        *self.pool.write().await = Some(pool);
        Ok(())
    }

    async fn execute(&self, request: HandlerRequest) -> HandlerOutcome {
        let start = Instant::now();

        let Some(pool) = self.pool.read().await.clone() else {
            return HandlerOutcome::Response(HandlerResponse::failure("sql handler not initialized", 0.0));
        };

        let template = match SqlRequest::from_params(&request.params) {
            Ok(t) => t,
            Err(message) => return HandlerOutcome::Response(HandlerResponse::failure(message, 0.0)),
        };

        let deadline = Duration::from_millis(request.timeout_ms);
        match tokio::time::timeout(deadline, run_statement(&pool, &template)).await {
            Ok(Ok(data)) => HandlerOutcome::Response(HandlerResponse::ok(data, elapsed_ms(start))),
            Ok(Err(message)) => HandlerOutcome::Response(HandlerResponse::failure(message, elapsed_ms(start))),
            Err(_) => HandlerOutcome::Timeout(HandlerTimeout { elapsed: start.elapsed(), limit: deadline }),
        }
    }

    async fn health(&self) -> bool {
        let Some(pool) = self.pool.read().await.clone() else { return false };
        tokio::time::timeout(Duration::from_secs(2), sqlx::query("SELECT 1").execute(&pool)).await.ok().and_then(Result::ok).is_some()
    }

    async fn shutdown(&self) {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
        }
    }

    fn protocol_kind(&self) -> ProtocolKind {
        ProtocolKind::Sql
    }
}

/// `SELECT` (and `WITH ... SELECT` CTEs) return `{rows, row_count}`; every
/// other statement kind returns `{affected_rows, result}` (§4.3).
async fn run_statement(pool: &sqlx::PgPool, template: &SqlRequest) -> Result<Value, String> {
    let mut query = sqlx::query(&template.statement);
    for value in &template.param_mapping {
        query = bind_json(query, value);
    }

    if returns_rows(&template.statement) {
        let rows: Vec<PgRow> = query.fetch_all(pool).await.map_err(|e| e.to_string())?;
        let row_count = rows.len();
        let rows: Vec<Value> = rows.iter().map(row_to_json).collect();
        Ok(serde_json::json!({ "rows": rows, "row_count": row_count }))
    } else {
        let result = query.execute(pool).await.map_err(|e| e.to_string())?;
        Ok(serde_json::json!({ "affected_rows": result.rows_affected(), "result": Value::Null }))
    }
}

/// A statement "returns rows" when it's a `SELECT`/CTE or carries an
/// explicit `RETURNING` clause; everything else reports affected-row counts
/// instead.
fn returns_rows(statement: &str) -> bool {
    let upper = statement.trim_start().to_uppercase();
    upper.starts_with("SELECT") || upper.starts_with("WITH") || upper.contains("RETURNING")
}

fn bind_json<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    value: &'q Value,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    match value {
        Value::String(s) => query.bind(s.as_str()),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) if n.is_i64() => query.bind(n.as_i64()),
        Value::Number(n) => query.bind(n.as_f64()),
        Value::Null => query.bind(Option::<String>::None),
        other => query.bind(sqlx::types::Json(other.clone())),
    }
}

/// Converts one row to a JSON object by column type name, falling back to
/// a text cast for types without a direct mapping. Good enough for the
/// closed set of shapes a contract's `response_mapping` expects to read
/// back (§3's "Dynamic attribute-based contracts" is explicitly excluded).
fn row_to_json(row: &PgRow) -> Value {
    let mut object = serde_json::Map::new();
    for column in row.columns() {
        let name = column.name().to_string();
        let value = match column.type_info().name() {
            "INT2" | "INT4" => row.try_get::<i32, _>(name.as_str()).map(|v| serde_json::json!(v)),
            "INT8" => row.try_get::<i64, _>(name.as_str()).map(|v| serde_json::json!(v)),
            "FLOAT4" | "FLOAT8" | "NUMERIC" => row.try_get::<f64, _>(name.as_str()).map(|v| serde_json::json!(v)),
            "BOOL" => row.try_get::<bool, _>(name.as_str()).map(|v| serde_json::json!(v)),
            "JSON" | "JSONB" => row.try_get::<Value, _>(name.as_str()),
            _ => row.try_get::<String, _>(name.as_str()).map(|v| serde_json::json!(v)),
        }
        .unwrap_or(Value::Null);
        object.insert(name, value);
    }
    Value::Object(object)
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Parsed, substituted shape of a `RequestTemplate::Sql` as rendered by
/// [`nodeforge::substitute::render`].
struct SqlRequest {
    statement: String,
    param_mapping: Vec<Value>,
}

impl SqlRequest {
    fn from_params(params: &Value) -> Result<Self, String> {
        let obj = params.as_object().ok_or("sql request params must be an object")?;
        let statement = obj.get("statement").and_then(Value::as_str).ok_or("missing 'statement'")?.to_string();
        let param_mapping = obj.get("param_mapping").and_then(Value::as_array).cloned().unwrap_or_default();
        Ok(Self { statement, param_mapping })
    }
}
