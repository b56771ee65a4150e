//! REST protocol handler (C3, §4.3): executes `RequestTemplate::Rest`
//! operations over one pooled [`reqwest::Client`] per contract connection.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use nodeforge::contract::{AuthConfig, ConnectionConfig, ProtocolKind};
use nodeforge::handler::{HandlerInitError, HandlerOutcome, HandlerRequest, HandlerResponse, HandlerTimeout, ProtocolHandler};
use reqwest::{Client, Method};
use serde_json::Value;
use tokio::sync::RwLock;

/// One REST connection pool, built from a contract's [`ConnectionConfig`].
/// `init` is idempotent: calling it again after [`RestHandler::shutdown`]
/// rebuilds the client from the same config (§4.3).
pub struct RestHandler {
    client: RwLock<Option<Client>>,
    base_url: RwLock<Option<String>>,
    auth: RwLock<Option<AuthConfig>>,
}

impl Default for RestHandler {
    fn default() -> Self {
        Self { client: RwLock::new(None), base_url: RwLock::new(None), auth: RwLock::new(None) }
    }
}

impl RestHandler {
    pub fn new() -> Self {
        Self::default()
    }

    async fn client(&self) -> Option<Client> {
        self.client.read().await.clone()
    }

    async fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth.read().await.as_ref() {
            Some(AuthConfig::Bearer { token }) => builder.bearer_auth(token),
            Some(AuthConfig::Basic { username, password }) => builder.basic_auth(username, Some(password)),
            Some(AuthConfig::ApiKey { header, value }) => builder.header(header, value),
            None => builder,
        }
    }
}

#[async_trait]
impl ProtocolHandler for RestHandler {
    async fn init(&self, config: &ConnectionConfig) -> Result<(), HandlerInitError> {
        let base_url = config
            .url
            .clone()
            .ok_or_else(|| HandlerInitError::InvalidConfig("rest connection requires 'url'".to_string()))?;

        let mut builder = Client::builder()
            .pool_max_idle_per_host(config.pool_max as usize)
            .timeout(Duration::from_millis(config.timeout_ms));

        if let Some(tls) = &config.tls {
            if !tls.verify {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        let client = builder.build().map_err(|e| HandlerInitError::ConnectionFailed(e.to_string()))?;

        *self.client.write().await = Some(client);
        *self.base_url.write().await = Some(base_url);
        *self.auth.write().await = config.auth.clone();
        Ok(())
    }

    async fn execute(&self, request: HandlerRequest) -> HandlerOutcome {
        let start = Instant::now();

        let Some(client) = self.client().await else {
            return HandlerOutcome::Response(HandlerResponse::failure("rest handler not initialized", 0.0));
        };
        let Some(base_url) = self.base_url.read().await.clone() else {
            return HandlerOutcome::Response(HandlerResponse::failure("rest handler not initialized", 0.0));
        };

        let template = match RestRequest::from_params(&request.params) {
            Ok(t) => t,
            Err(message) => return HandlerOutcome::Response(HandlerResponse::failure(message, 0.0)),
        };

        let method = match Method::from_bytes(template.method.as_bytes()) {
            Ok(m) => m,
            Err(_) => {
                return HandlerOutcome::Response(HandlerResponse::failure(format!("invalid method: {}", template.method), 0.0))
            }
        };

        let url = format!("{}{}", base_url.trim_end_matches('/'), template.path);
        let mut builder = client
            .request(method, url)
            .timeout(Duration::from_millis(request.timeout_ms))
            .query(&template.query)
            .headers(template.headers());
        builder = self.apply_auth(builder).await;
        if let Some(body) = &template.body {
            builder = builder.json(body);
        }

        match builder.send().await {
            Ok(response) => {
                let status = response.status();
                let duration_ms = elapsed_ms(start);
                let is_json = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(|ct| ct.contains("application/json"))
                    .unwrap_or(false);
                let data: Value = if is_json {
                    response.json().await.unwrap_or(Value::Null)
                } else {
                    match response.text().await {
                        Ok(text) if text.is_empty() => Value::Null,
                        Ok(text) => serde_json::json!({"raw": text}),
                        Err(_) => Value::Null,
                    }
                };

                if is_success(status, &request.success_codes) {
                    HandlerOutcome::Response(HandlerResponse::ok(data, duration_ms).with_status(status.as_u16() as i64))
                } else {
                    let error = data
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("request failed with status {status}"));
                    HandlerOutcome::Response(HandlerResponse::failure(error, duration_ms).with_status(status.as_u16() as i64))
                }
            }
            Err(err) if err.is_timeout() => HandlerOutcome::Timeout(HandlerTimeout {
                elapsed: start.elapsed(),
                limit: Duration::from_millis(request.timeout_ms),
            }),
            Err(err) => HandlerOutcome::Response(HandlerResponse::failure(err.to_string(), elapsed_ms(start))),
        }
    }

    async fn health(&self) -> bool {
        let (Some(client), Some(base_url)) = (self.client().await, self.base_url.read().await.clone()) else {
            return false;
        };
        client
            .get(base_url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map(|r| r.status().as_u16() < 500)
            .unwrap_or(false)
    }

    async fn shutdown(&self) {
        *self.client.write().await = None;
    }

    fn protocol_kind(&self) -> ProtocolKind {
        ProtocolKind::Rest
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// An empty `success_codes` falls back to the protocol's own 2xx notion of
/// success; a non-empty set overrides it entirely, so a contract can treat
/// e.g. `404` as success or exclude `202` (§3, §4.3).
fn is_success(status: reqwest::StatusCode, success_codes: &[u16]) -> bool {
    if success_codes.is_empty() {
        status.is_success()
    } else {
        success_codes.contains(&status.as_u16())
    }
}

/// Parsed, substituted shape of a `RequestTemplate::Rest` as rendered by
/// [`nodeforge::substitute::render`] (the executor hands the whole
/// rendered document to the handler as `request.params`).
struct RestRequest {
    method: String,
    path: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Option<Value>,
}

impl RestRequest {
    fn from_params(params: &Value) -> Result<Self, String> {
        let obj = params.as_object().ok_or("rest request params must be an object")?;
        let method = obj.get("method").and_then(Value::as_str).ok_or("missing 'method'")?.to_uppercase();
        let path = obj.get("path").and_then(Value::as_str).ok_or("missing 'path'")?.to_string();
        let query = obj
            .get("query")
            .and_then(Value::as_object)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), value_to_string(v))).collect())
            .unwrap_or_default();
        let headers = obj
            .get("headers")
            .and_then(Value::as_object)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), value_to_string(v))).collect())
            .unwrap_or_default();
        let body = obj.get("body").cloned().filter(|v| !v.is_null());
        Ok(Self { method, path, query, headers, body })
    }

    fn headers(&self) -> reqwest::header::HeaderMap {
        let mut map = reqwest::header::HeaderMap::new();
        for (k, v) in &self.headers {
            if let (Ok(name), Ok(value)) =
                (reqwest::header::HeaderName::from_bytes(k.as_bytes()), reqwest::header::HeaderValue::from_str(v))
            {
                map.insert(name, value);
            }
        }
        map
    }
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
