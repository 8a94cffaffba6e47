// # Unauthenticated HTTP Connector
//
// Request assembly shared with the authenticated variant lives here: method
// inference, URL/query/header composition, and the three body strategies
// (JSON, raw string, form-encoded). `start` performs a connectivity probe;
// a 5xx is an error while a 4xx counts as "connected but unauthorized to
// that path".

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::connector::{Connector, ConnectorBase, PeriodicTask, RuntimeContext};
use crate::error::{BridgeError, Result};
use crate::model::config::{get_bool, HttpConnectionConfig, ParamsConfig};
use crate::model::{
    operation, source_type, DataSource, ExecuteRequest, ExecuteResponse, HealthState,
};
use crate::pool::{HttpClientPool, PoolConfig};
use crate::query::parser::ResponseParserConfig;
use crate::script::ScriptHttp;

/// Body strategy chosen from the request shape.
#[derive(Debug, Clone)]
pub(crate) enum BodyKind {
    None,
    Json(Value),
    Raw(String),
    Form(Vec<(String, String)>),
}

/// A transport-ready request bundle.
#[derive(Debug, Clone)]
pub(crate) struct RequestPlan {
    pub method: reqwest::Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: BodyKind,
}

impl RequestPlan {
    /// Add a query parameter (used by auth injection).
    pub fn add_query(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.query.push((key.into(), value.into()));
    }

    /// Add a header (auth headers are applied last and win).
    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.push((key.into(), value.into()));
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn infer_method(request: &ExecuteRequest) -> Result<reqwest::Method> {
    if let Some(explicit) = request.param_str("method") {
        return explicit
            .to_uppercase()
            .parse()
            .map_err(|_| BridgeError::ConfigInvalid(format!("invalid http method {:?}", explicit)));
    }
    Ok(match request.operation.as_str() {
        operation::QUERY | operation::SELECT | operation::READ => reqwest::Method::GET,
        operation::INSERT => reqwest::Method::POST,
        operation::UPDATE => reqwest::Method::PUT,
        operation::DELETE => reqwest::Method::DELETE,
        _ => reqwest::Method::GET,
    })
}

/// Compile an execute request against a base URL into a transport plan.
pub(crate) fn plan_request(base_url: &str, request: &ExecuteRequest) -> Result<RequestPlan> {
    let method = infer_method(request)?;

    let path = request
        .param_str("path")
        .or(request.query.as_deref())
        .unwrap_or("");
    let url = if path.starts_with("http://") || path.starts_with("https://") {
        path.to_string()
    } else if path.is_empty() {
        base_url.to_string()
    } else {
        format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    };

    let mut query = Vec::new();
    if let Some(Value::Object(params)) = request.params.get("query") {
        for (key, value) in params {
            query.push((key.clone(), stringify(value)));
        }
    }

    let mut headers = Vec::new();
    if let Some(Value::Object(header_map)) = request.params.get("headers") {
        for (key, value) in header_map {
            headers.push((key.clone(), stringify(value)));
        }
    }

    // Body-located pagination parameters merge into an object body.
    let mut data = request.data.clone();
    if let Some(Value::Object(extra)) = request.params.get("body_params") {
        match &mut data {
            Some(Value::Object(body)) => {
                for (key, value) in extra {
                    body.insert(key.clone(), value.clone());
                }
            }
            None => data = Some(Value::Object(extra.clone())),
            _ => {}
        }
    }

    let use_form = get_bool(&request.params, "use_form_data").unwrap_or(false);
    let body = match data {
        None => BodyKind::None,
        Some(Value::String(raw)) if !use_form => BodyKind::Raw(raw),
        Some(value) if use_form => {
            let fields = value
                .as_object()
                .map(|m| m.iter().map(|(k, v)| (k.clone(), stringify(v))).collect())
                .unwrap_or_default();
            BodyKind::Form(fields)
        }
        Some(value) => BodyKind::Json(value),
    };

    Ok(RequestPlan {
        method,
        url,
        query,
        headers,
        body,
    })
}

/// Execute a plan and return `(status, body_text, final_url)`.
pub(crate) async fn send_plan(
    client: &reqwest::Client,
    plan: &RequestPlan,
    timeout: Duration,
) -> Result<(u16, String, String)> {
    let mut builder = client
        .request(plan.method.clone(), plan.url.as_str())
        .timeout(timeout);
    if !plan.query.is_empty() {
        builder = builder.query(&plan.query);
    }
    for (key, value) in &plan.headers {
        builder = builder.header(key, value);
    }
    builder = match &plan.body {
        BodyKind::None => builder,
        BodyKind::Json(value) => builder.json(value),
        BodyKind::Raw(raw) => builder
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(raw.clone()),
        BodyKind::Form(fields) => builder.form(fields),
    };

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let final_url = response.url().to_string();
    let text = response.text().await?;
    Ok((status, text, final_url))
}

/// Normalize a raw response: through the configured parser when the request
/// carries one, otherwise 2xx + JSON body.
pub(crate) fn normalize_response(
    request: &ExecuteRequest,
    status: u16,
    body: &str,
) -> Result<ExecuteResponse> {
    let parser_cfg = request
        .params
        .get("response_parser")
        .and_then(|v| v.as_object())
        .and_then(ResponseParserConfig::from_interface);

    let mut response = match parser_cfg {
        Some(parser) => {
            let parsed = parser.parse(status, body)?;
            if parsed.success {
                let mut resp = ExecuteResponse::ok(Some(parsed.data));
                if let Some(total) = parsed.total {
                    resp = resp.with_metadata("total", json!(total));
                }
                if let Some(page) = parsed.page {
                    resp = resp.with_metadata("page", json!(page));
                }
                if let Some(size) = parsed.page_size {
                    resp = resp.with_metadata("page_size", json!(size));
                }
                resp.with_metadata("has_next", json!(parsed.has_next))
            } else {
                ExecuteResponse::failure(parsed.error_message, parsed.error_code)
            }
        }
        None => {
            if (200..300).contains(&status) {
                let data = serde_json::from_str(body).unwrap_or(Value::String(body.to_string()));
                ExecuteResponse::ok(Some(data))
            } else {
                ExecuteResponse::failure(format!("http status {}", status), status.to_string())
            }
        }
    };
    response.metadata.insert("status_code".to_string(), json!(status));
    Ok(response)
}

/// Probe a base URL: HEAD preferred, GET fallback. 5xx is a transport error.
pub(crate) async fn probe_connectivity(client: &reqwest::Client, url: &str) -> Result<u16> {
    let head = client.head(url).send().await;
    let status = match head {
        Ok(resp) => resp.status().as_u16(),
        Err(_) => {
            debug!(url, "HEAD probe failed, falling back to GET");
            client.get(url).send().await?.status().as_u16()
        }
    };
    if status >= 500 {
        return Err(BridgeError::TransportUnavailable(format!(
            "probe of {} returned status {}",
            url, status
        )));
    }
    Ok(status)
}

pub struct HttpConnector {
    base: ConnectorBase,
    config: RwLock<Option<(HttpConnectionConfig, ParamsConfig)>>,
    pool: RwLock<Option<Arc<HttpClientPool>>>,
    sweeper: tokio::sync::Mutex<Option<PeriodicTask>>,
}

impl HttpConnector {
    pub fn new(ctx: Arc<RuntimeContext>) -> Self {
        Self {
            base: ConnectorBase::new(source_type::API_HTTP, ctx.scripts()),
            config: RwLock::new(None),
            pool: RwLock::new(None),
            sweeper: tokio::sync::Mutex::new(None),
        }
    }

    fn require_config(&self) -> Result<(HttpConnectionConfig, ParamsConfig)> {
        self.config
            .read()
            .clone()
            .ok_or_else(|| BridgeError::NotReady("http connector not initialized".to_string()))
    }

    fn require_pool(&self) -> Result<Arc<HttpClientPool>> {
        self.pool
            .read()
            .clone()
            .ok_or_else(|| BridgeError::NotReady("http pool not open".to_string()))
    }

    async fn dispatch(&self, request: &ExecuteRequest) -> Result<ExecuteResponse> {
        let (http_cfg, params) = self.require_config()?;
        match request.operation.as_str() {
            operation::API_CALL
            | operation::QUERY
            | operation::SELECT
            | operation::INSERT
            | operation::UPDATE
            | operation::DELETE => {
                let plan = plan_request(&http_cfg.base_url, request)?;
                let timeout = request.timeout.unwrap_or(params.timeout);
                let pool = self.require_pool()?;
                let pooled = pool.get()?;
                let result = send_plan(&pooled.client, &plan, timeout).await;
                pool.put(pooled);

                let (status, body, final_url) = result?;
                let response = normalize_response(request, status, &body)?;
                Ok(response
                    .with_metadata("method", json!(plan.method.as_str()))
                    .with_metadata("url", json!(final_url)))
            }
            operation::CONNECT_TEST => {
                let pool = self.require_pool()?;
                let pooled = pool.get()?;
                let status = probe_connectivity(&pooled.client, &http_cfg.base_url).await;
                pool.put(pooled);
                let status = status?;
                Ok(ExecuteResponse::ok(None)
                    .with_message("connection test passed")
                    .with_metadata("status_code", json!(status)))
            }
            operation::STATUS => {
                let pool_stats = self.pool.read().as_ref().map(|p| serde_json::to_value(p.stats()).unwrap_or(Value::Null));
                Ok(ExecuteResponse::ok(Some(json!({
                    "initialized": self.base.is_initialized(),
                    "started": self.base.is_started(),
                    "type": self.base.source_type(),
                    "base_url": http_cfg.base_url,
                    "pool": pool_stats,
                }))))
            }
            other => Err(BridgeError::OperationUnsupported(format!(
                "http connector does not support {:?}",
                other
            ))),
        }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    fn source_type(&self) -> &str {
        self.base.source_type()
    }

    fn is_resident(&self) -> bool {
        false
    }

    async fn init(&self, data_source: DataSource) -> Result<()> {
        let _guard = self.base.lifecycle_guard().await;
        self.base.check_not_initialized()?;

        let http_cfg = HttpConnectionConfig::from_map(&data_source.connection_config)?;
        let params = ParamsConfig::from_map(&data_source.params_config)?;
        let pool = HttpClientPool::new(PoolConfig {
            max_idle: params.max_connections as usize,
            request_timeout: params.timeout,
            ..PoolConfig::default()
        });
        *self.config.write() = Some((http_cfg, params));
        *self.pool.write() = Some(pool);

        self.base.set_script_http(ScriptHttp::new(reqwest::Client::new()));
        self.base.set_initialized(data_source);
        if let Err(e) = self.base.run_hook("init", None).await {
            self.base.reset();
            *self.config.write() = None;
            *self.pool.write() = None;
            return Err(e);
        }
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let _guard = self.base.lifecycle_guard().await;
        self.base.check_can_start()?;
        let (http_cfg, _) = self.require_config()?;

        let pool = self.require_pool()?;
        let pooled = pool.get()?;
        let status = probe_connectivity(&pooled.client, &http_cfg.base_url).await;
        pool.put(pooled);
        let status = status?;
        if (400..500).contains(&status) {
            debug!(status, "base url reachable but unauthorized at probe path");
        }

        *self.sweeper.lock().await = Some(pool.start_sweeper());
        self.base.run_hook("start", None).await?;
        self.base.set_started(true);
        info!(base_url = %http_cfg.base_url, "http connector started");
        Ok(())
    }

    async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResponse> {
        self.base.check_ready(true)?;
        let started = Instant::now();
        match self.dispatch(&request).await {
            Ok(resp) => Ok(resp.with_duration(started.elapsed())),
            Err(e @ BridgeError::OperationUnsupported(_)) => Err(e),
            Err(e) => Ok(ExecuteResponse::from_error(&e)
                .with_metadata("operation", Value::String(request.operation.clone()))
                .with_duration(started.elapsed())),
        }
    }

    async fn stop(&self) -> Result<()> {
        let _guard = self.base.lifecycle_guard().await;
        if !self.base.is_started() {
            return Ok(());
        }
        if let Some(sweeper) = self.sweeper.lock().await.take() {
            sweeper.cancel();
        }
        self.base.run_stop_hook().await;
        self.base.set_started(false);
        info!("http connector stopped");
        Ok(())
    }

    async fn health_check(&self) -> HealthState {
        if !self.base.is_initialized() {
            return HealthState::offline();
        }
        if !self.base.is_started() {
            return HealthState::ready();
        }
        let Ok((http_cfg, _)) = self.require_config() else {
            return HealthState::error("configuration missing");
        };
        let Ok(pool) = self.require_pool() else {
            return HealthState::error("pool missing");
        };
        let pooled = match pool.get() {
            Ok(p) => p,
            Err(e) => return HealthState::error(e.to_string()),
        };
        let result = probe_connectivity(&pooled.client, &http_cfg.base_url).await;
        pool.put(pooled);
        match result {
            Ok(status) => HealthState::online().with_detail("status_code", status.to_string()),
            Err(e) => HealthState::error(e.to_string()),
        }
    }
}
