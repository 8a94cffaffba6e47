// # Inbound HTTP Push Connector
//
// External producers POST to `/<prefix>/<suffix>`; the host web server routes
// the request here by suffix. Each suffix binds to exactly one connector in a
// runtime-scoped registry. Accepted messages carry a `_metadata` envelope and
// flow through a bounded channel into a ring buffer, subscriber fan-out, and
// optionally the real-time processor. A full channel drops the message with a
// recorded warning; the producer still gets its 200.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connector::{Connector, ConnectorBase, RuntimeContext};
use crate::error::{BridgeError, Result};
use crate::model::config::{ParamsConfig, WebhookConnectionConfig};
use crate::model::{
    operation, source_type, DataSource, ExecuteRequest, ExecuteResponse, HealthState, JsonMap,
};

/// Ring buffer retention for inbound messages.
const RING_CAPACITY: usize = 1000;
const SUBSCRIBER_BUFFER: usize = 100;

/// Inbound request as handed over by the host web server.
#[derive(Debug, Clone, Default)]
pub struct WebhookRequest {
    pub method: String,
    pub url: String,
    pub remote_addr: String,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl WebhookRequest {
    pub fn post(body: impl Into<Vec<u8>>) -> Self {
        Self {
            method: "POST".to_string(),
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_lowercase(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(|s| s.as_str())
    }
}

/// Response handed back to the host web server.
#[derive(Debug, Clone)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: Value,
}

impl WebhookResponse {
    fn ok() -> Self {
        Self {
            status: 200,
            body: json!({"success": true}),
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            body: json!({"success": false, "error": message}),
        }
    }
}

#[derive(Default)]
struct EndpointCounters {
    received: AtomicU64,
    accepted: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
}

/// Everything needed to serve one bound suffix. Lives in the registry while
/// the connector is started.
pub struct WebhookEndpoint {
    config: WebhookConnectionConfig,
    max_body_size: usize,
    tx: mpsc::Sender<Value>,
    counters: Arc<EndpointCounters>,
}

impl WebhookEndpoint {
    /// Validate and enqueue one inbound request.
    pub fn handle(&self, request: &WebhookRequest) -> WebhookResponse {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        if !request.method.eq_ignore_ascii_case("POST") {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return WebhookResponse::error(405, "only POST is accepted");
        }

        if self.config.auth_required && !self.authorized(request) {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return WebhookResponse::error(401, "invalid or missing token");
        }

        if request.body.len() > self.max_body_size {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return WebhookResponse::error(413, "body exceeds configured limit");
        }

        let record = self.build_record(request);
        match self.tx.try_send(record) {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                // The producer already got its 200; the loss is recorded, not
                // surfaced.
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(suffix = %self.config.suffix, "webhook channel full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(suffix = %self.config.suffix, "webhook consumer gone, dropping message");
            }
        }
        WebhookResponse::ok()
    }

    fn authorized(&self, request: &WebhookRequest) -> bool {
        let presented = request
            .header("authorization")
            .map(|v| v.strip_prefix("Bearer ").unwrap_or(v))
            .or_else(|| request.header("x-auth-token"))
            .or_else(|| request.query.get("token").map(|s| s.as_str()));
        match presented {
            Some(token) => constant_time_eq(token.as_bytes(), self.config.auth_token.as_bytes()),
            None => false,
        }
    }

    fn build_record(&self, request: &WebhookRequest) -> Value {
        let mut record = match serde_json::from_slice::<Value>(&request.body) {
            Ok(Value::Object(obj)) => obj,
            Ok(other) => {
                let mut obj = JsonMap::new();
                obj.insert("data".to_string(), other);
                obj
            }
            Err(_) => {
                // Non-JSON payloads are kept as tagged raw text.
                let mut obj = JsonMap::new();
                obj.insert(
                    "raw".to_string(),
                    Value::String(String::from_utf8_lossy(&request.body).into_owned()),
                );
                obj.insert(
                    "content_type".to_string(),
                    Value::String(request.header("content-type").unwrap_or("unknown").to_string()),
                );
                obj
            }
        };

        let headers: JsonMap = request
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        record.insert(
            "_metadata".to_string(),
            json!({
                "received_at": Utc::now().to_rfc3339(),
                "remote_addr": request.remote_addr,
                "user_agent": request.header("user-agent").unwrap_or(""),
                "content_length": request.body.len(),
                "method": request.method,
                "url": request.url,
                "headers": headers,
            }),
        );
        Value::Object(record)
    }
}

/// Timing-safe token comparison.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Runtime-scoped partial mapping `suffix → endpoint`. One namespace per
/// runtime instance keeps tests isolated.
pub struct WebhookRegistry {
    routes: DashMap<String, Arc<WebhookEndpoint>>,
}

impl WebhookRegistry {
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
        }
    }

    fn bind(&self, suffix: &str, endpoint: Arc<WebhookEndpoint>) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.routes.entry(suffix.to_string()) {
            Entry::Occupied(_) => Err(BridgeError::AlreadyBound(suffix.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(endpoint);
                Ok(())
            }
        }
    }

    fn unbind(&self, suffix: &str) {
        self.routes.remove(suffix);
    }

    pub fn bound_suffixes(&self) -> Vec<String> {
        self.routes.iter().map(|e| e.key().clone()).collect()
    }

    /// Route an inbound request to the connector bound at `suffix`.
    pub fn dispatch(&self, suffix: &str, request: &WebhookRequest) -> WebhookResponse {
        match self.routes.get(suffix) {
            Some(endpoint) => endpoint.handle(request),
            None => WebhookResponse::error(404, "no connector bound to this suffix"),
        }
    }
}

impl Default for WebhookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

type SubscriberSet = Arc<RwLock<Vec<(String, mpsc::Sender<Value>)>>>;

pub struct WebhookConnector {
    base: ConnectorBase,
    ctx: Arc<RuntimeContext>,
    config: RwLock<Option<(WebhookConnectionConfig, ParamsConfig)>>,
    endpoint: RwLock<Option<Arc<WebhookEndpoint>>>,
    ring: Arc<RwLock<VecDeque<Value>>>,
    subscribers: SubscriberSet,
    /// Receivers opened through `execute("subscribe")`, parked until the host
    /// claims them with `take_subscriber`.
    pending_receivers: RwLock<std::collections::HashMap<String, mpsc::Receiver<Value>>>,
    started_at: RwLock<Option<Instant>>,
}

impl WebhookConnector {
    pub fn new(ctx: Arc<RuntimeContext>) -> Self {
        Self {
            base: ConnectorBase::new(source_type::MESSAGING_HTTP_POST, ctx.scripts()),
            ctx,
            config: RwLock::new(None),
            endpoint: RwLock::new(None),
            ring: Arc::new(RwLock::new(VecDeque::with_capacity(RING_CAPACITY))),
            subscribers: Arc::new(RwLock::new(Vec::new())),
            pending_receivers: RwLock::new(std::collections::HashMap::new()),
            started_at: RwLock::new(None),
        }
    }

    fn require_config(&self) -> Result<(WebhookConnectionConfig, ParamsConfig)> {
        self.config
            .read()
            .clone()
            .ok_or_else(|| BridgeError::NotReady("webhook connector not initialized".to_string()))
    }

    /// Open a typed subscription onto the inbound stream.
    pub fn subscribe(&self) -> (String, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = uuid::Uuid::new_v4().to_string();
        self.subscribers.write().push((id.clone(), tx));
        (id, rx)
    }

    pub fn unsubscribe(&self, subscriber_id: &str) -> bool {
        self.pending_receivers.write().remove(subscriber_id);
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(id, _)| id != subscriber_id);
        subscribers.len() != before
    }

    /// Claim the receiver opened by a prior `execute("subscribe")`.
    pub fn take_subscriber(&self, subscriber_id: &str) -> Option<mpsc::Receiver<Value>> {
        self.pending_receivers.write().remove(subscriber_id)
    }

    fn spawn_consumer(&self, mut rx: mpsc::Receiver<Value>, datasource_id: String, auto_write: bool) {
        let ring = self.ring.clone();
        let subscribers = self.subscribers.clone();
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                {
                    let mut ring = ring.write();
                    if ring.len() >= RING_CAPACITY {
                        ring.pop_front();
                    }
                    ring.push_back(record.clone());
                }

                {
                    let mut subs = subscribers.write();
                    subs.retain(|(id, tx)| match tx.try_send(record.clone()) {
                        Ok(()) => true,
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            debug!(subscriber = %id, "subscriber buffer full, skipping delivery");
                            true
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => false,
                    });
                }

                if auto_write {
                    if let Some(processor) = ctx.realtime() {
                        processor.process_realtime_data(&datasource_id, &record);
                    }
                }
            }
            debug!(datasource_id = %datasource_id, "webhook consumer stopped");
        });
    }

    fn query_response(&self, request: &ExecuteRequest) -> ExecuteResponse {
        let page = request.param_i64("page").unwrap_or(1).max(1);
        let page_size = request.param_i64("page_size").unwrap_or(100).clamp(1, 1000);
        let topic = request.param_str("topic").map(|s| s.to_string());

        let ring = self.ring.read();
        let filtered: Vec<&Value> = ring
            .iter()
            .filter(|record| match &topic {
                Some(topic) => record_matches_topic(record, topic),
                None => true,
            })
            .collect();
        let total = filtered.len() as i64;
        let start = ((page - 1) * page_size) as usize;
        let items: Vec<Value> = filtered
            .into_iter()
            .skip(start)
            .take(page_size as usize)
            .cloned()
            .collect();

        ExecuteResponse::ok(Some(json!({
            "items": items,
            "total": total,
            "page": page,
            "page_size": page_size,
        })))
        .with_row_count(total)
    }

    fn status_response(&self) -> ExecuteResponse {
        let (config, params) = match self.require_config() {
            Ok(pair) => pair,
            Err(e) => return ExecuteResponse::from_error(&e),
        };
        let counters = self.endpoint.read().as_ref().map(|e| {
            json!({
                "received": e.counters.received.load(Ordering::Relaxed),
                "accepted": e.counters.accepted.load(Ordering::Relaxed),
                "dropped": e.counters.dropped.load(Ordering::Relaxed),
                "rejected": e.counters.rejected.load(Ordering::Relaxed),
            })
        });
        ExecuteResponse::ok(Some(json!({
            "initialized": self.base.is_initialized(),
            "started": self.base.is_started(),
            "type": self.base.source_type(),
            "suffix": config.suffix,
            "auth_required": config.auth_required,
            "channel_capacity": params.channel_capacity,
            "buffered": self.ring.read().len(),
            "subscribers": self.subscribers.read().len(),
            "counters": counters,
            "uptime_secs": self.started_at.read().map(|t| t.elapsed().as_secs()),
        })))
    }
}

fn record_matches_topic(record: &Value, topic: &str) -> bool {
    if record.get("topic").and_then(|v| v.as_str()) == Some(topic) {
        return true;
    }
    record
        .pointer("/_metadata/url")
        .and_then(|v| v.as_str())
        .map(|url| url.contains(topic))
        .unwrap_or(false)
}

#[async_trait]
impl Connector for WebhookConnector {
    fn source_type(&self) -> &str {
        self.base.source_type()
    }

    fn is_resident(&self) -> bool {
        true
    }

    async fn init(&self, data_source: DataSource) -> Result<()> {
        let _guard = self.base.lifecycle_guard().await;
        self.base.check_not_initialized()?;

        let config = WebhookConnectionConfig::from_map(&data_source.connection_config)?;
        let params = ParamsConfig::from_map(&data_source.params_config)?;
        *self.config.write() = Some((config, params));

        self.base.set_initialized(data_source);
        if let Err(e) = self.base.run_hook("init", None).await {
            self.base.reset();
            *self.config.write() = None;
            return Err(e);
        }
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let _guard = self.base.lifecycle_guard().await;
        self.base.check_can_start()?;
        let (config, params) = self.require_config()?;
        let data_source = self.base.require_data_source()?;

        let (tx, rx) = mpsc::channel(params.channel_capacity);
        let endpoint = Arc::new(WebhookEndpoint {
            config: config.clone(),
            max_body_size: params.max_body_size,
            tx,
            counters: Arc::new(EndpointCounters::default()),
        });

        // Binding is the only gate: a suffix collision fails this start and
        // leaves the first connector untouched.
        self.ctx.webhooks().bind(&config.suffix, endpoint.clone())?;
        self.spawn_consumer(rx, data_source.id.clone(), params.enable_auto_write);
        *self.endpoint.write() = Some(endpoint);
        *self.started_at.write() = Some(Instant::now());

        if let Err(e) = self.base.run_hook("start", None).await {
            self.ctx.webhooks().unbind(&config.suffix);
            *self.endpoint.write() = None;
            return Err(e);
        }
        self.base.set_started(true);
        info!(suffix = %config.suffix, "webhook connector bound");
        Ok(())
    }

    async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResponse> {
        self.base.check_ready(true)?;
        let started = Instant::now();
        let response = match request.operation.as_str() {
            operation::QUERY | operation::READ => self.query_response(&request),
            operation::SUBSCRIBE => {
                let (id, rx) = self.subscribe();
                self.pending_receivers.write().insert(id.clone(), rx);
                ExecuteResponse::ok(Some(json!({
                    "subscriber_id": id,
                    "subscribers": self.subscribers.read().len(),
                })))
                .with_message("subscription registered; claim the channel with take_subscriber")
            }
            operation::UNSUBSCRIBE => {
                let removed = request
                    .param_str("subscriber_id")
                    .map(|id| self.unsubscribe(id))
                    .unwrap_or(false);
                ExecuteResponse::ok(Some(json!({"removed": removed})))
            }
            operation::STATUS => self.status_response(),
            operation::CONNECT_TEST => ExecuteResponse::ok(None).with_message("webhook endpoint is passive; bound suffixes accept POSTs"),
            other => {
                return Err(BridgeError::OperationUnsupported(format!(
                    "webhook connector does not support {:?}",
                    other
                )))
            }
        };
        Ok(response.with_duration(started.elapsed()))
    }

    async fn stop(&self) -> Result<()> {
        let _guard = self.base.lifecycle_guard().await;
        if !self.base.is_started() {
            return Ok(());
        }
        if let Ok((config, _)) = self.require_config() {
            self.ctx.webhooks().unbind(&config.suffix);
        }
        // Dropping the endpoint closes the channel; the consumer drains and
        // exits on its own.
        *self.endpoint.write() = None;
        self.subscribers.write().clear();
        self.pending_receivers.write().clear();
        self.base.run_stop_hook().await;
        self.base.set_started(false);
        info!("webhook connector stopped");
        Ok(())
    }

    async fn health_check(&self) -> HealthState {
        if !self.base.is_initialized() {
            return HealthState::offline();
        }
        if !self.base.is_started() {
            return HealthState::ready();
        }
        let bound = self
            .config
            .read()
            .as_ref()
            .map(|(c, _)| self.ctx.webhooks().routes.contains_key(&c.suffix))
            .unwrap_or(false);
        if bound {
            HealthState::online().with_detail("buffered", self.ring.read().len().to_string())
        } else {
            HealthState::error("suffix binding lost")
        }
    }
}
