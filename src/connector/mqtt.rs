// # MQTT Connector
//
// Broker session over rumqttc: subscribes the configured topic set, turns
// every publish into a normalized message record (JSON payloads are parsed
// eagerly), and feeds the same ring-buffer/subscriber/auto-write pipeline as
// the webhook connector, with a 5000-entry ring. Reconnection is driven by
// the client's event loop; a lost connection bumps the reconnect counter and
// a successful CONNACK resets it and re-subscribes.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connector::{Connector, ConnectorBase, RuntimeContext};
use crate::error::{BridgeError, Result};
use crate::model::config::{MqttConnectionConfig, ParamsConfig};
use crate::model::{
    operation, source_type, DataSource, ExecuteRequest, ExecuteResponse, HealthState,
};

/// Ring buffer retention for broker messages.
const RING_CAPACITY: usize = 5000;
const SUBSCRIBER_BUFFER: usize = 100;

fn qos_from(level: u8) -> QoS {
    match level {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

/// MQTT topic filter match supporting `+` and `#` wildcards.
fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[derive(Default)]
struct MqttCounters {
    received: AtomicU64,
    dropped: AtomicU64,
    reconnects: AtomicU64,
    non_json_dropped: AtomicU64,
}

type SubscriberSet = Arc<RwLock<Vec<(String, mpsc::Sender<Value>)>>>;

pub struct MqttConnector {
    base: ConnectorBase,
    ctx: Arc<RuntimeContext>,
    config: RwLock<Option<(MqttConnectionConfig, ParamsConfig)>>,
    client: RwLock<Option<AsyncClient>>,
    topics: Arc<RwLock<HashSet<String>>>,
    ring: Arc<RwLock<VecDeque<Value>>>,
    subscribers: SubscriberSet,
    counters: Arc<MqttCounters>,
    last_error: Arc<RwLock<Option<String>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttConnector {
    pub fn new(ctx: Arc<RuntimeContext>) -> Self {
        Self {
            base: ConnectorBase::new(source_type::MESSAGING_MQTT, ctx.scripts()),
            ctx,
            config: RwLock::new(None),
            client: RwLock::new(None),
            topics: Arc::new(RwLock::new(HashSet::new())),
            ring: Arc::new(RwLock::new(VecDeque::with_capacity(1024))),
            subscribers: Arc::new(RwLock::new(Vec::new())),
            counters: Arc::new(MqttCounters::default()),
            last_error: Arc::new(RwLock::new(None)),
            event_loop: Mutex::new(None),
        }
    }

    fn require_config(&self) -> Result<(MqttConnectionConfig, ParamsConfig)> {
        self.config
            .read()
            .clone()
            .ok_or_else(|| BridgeError::NotReady("mqtt connector not initialized".to_string()))
    }

    fn require_client(&self) -> Result<AsyncClient> {
        self.client
            .read()
            .clone()
            .ok_or_else(|| BridgeError::NotReady("mqtt client not connected".to_string()))
    }

    /// Open a typed subscription onto the inbound stream.
    pub fn subscribe_channel(&self) -> (String, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = uuid::Uuid::new_v4().to_string();
        self.subscribers.write().push((id.clone(), tx));
        (id, rx)
    }

    /// Normalize one broker publish into a message record.
    fn build_message(publish: &rumqttc::Publish) -> Value {
        let payload_text = String::from_utf8_lossy(&publish.payload).into_owned();
        let parsed: Option<Value> = serde_json::from_str(&payload_text).ok();
        json!({
            "topic": publish.topic,
            "payload": payload_text,
            "qos": publish.qos as u8,
            "retained": publish.retain,
            "message_id": publish.pkid,
            "received_at": Utc::now().to_rfc3339(),
            "parsed_data": parsed,
        })
    }

    fn spawn_consumer(&self, mut rx: mpsc::Receiver<Value>, datasource_id: String, auto_write: bool) {
        let ring = self.ring.clone();
        let subscribers = self.subscribers.clone();
        let counters = self.counters.clone();
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                {
                    let mut ring = ring.write();
                    if ring.len() >= RING_CAPACITY {
                        ring.pop_front();
                    }
                    ring.push_back(message.clone());
                }

                {
                    let mut subs = subscribers.write();
                    subs.retain(|(id, tx)| match tx.try_send(message.clone()) {
                        Ok(()) => true,
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            debug!(subscriber = %id, "subscriber buffer full, skipping delivery");
                            true
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => false,
                    });
                }

                if auto_write {
                    match message.get("parsed_data") {
                        Some(parsed) if !parsed.is_null() => {
                            if let Some(processor) = ctx.realtime() {
                                processor.process_realtime_data(&datasource_id, parsed);
                            }
                        }
                        _ => {
                            // Raw payloads stay in the ring and reach
                            // subscribers but cannot be written as records.
                            counters.non_json_dropped.fetch_add(1, Ordering::Relaxed);
                            debug!("non-json payload skipped by auto-write");
                        }
                    }
                }
            }
            debug!(datasource_id = %datasource_id, "mqtt consumer stopped");
        });
    }

    fn spawn_event_loop(
        &self,
        mut event_loop: rumqttc::EventLoop,
        tx: mpsc::Sender<Value>,
        reconnect_delay: Duration,
    ) -> JoinHandle<()> {
        let counters = self.counters.clone();
        let last_error = self.last_error.clone();
        let topics = self.topics.clone();
        let client = self.require_client().ok();
        let qos = self
            .config
            .read()
            .as_ref()
            .map(|(c, _)| c.qos)
            .unwrap_or(0);
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        counters.received.fetch_add(1, Ordering::Relaxed);
                        let message = Self::build_message(&publish);
                        if tx.try_send(message).is_err() {
                            counters.dropped.fetch_add(1, Ordering::Relaxed);
                            warn!(topic = %publish.topic, "mqtt channel full, dropping message");
                        }
                    }
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        // Fresh session after (re)connect: reset the counter
                        // and restore the subscription set.
                        counters.reconnects.store(0, Ordering::Relaxed);
                        *last_error.write() = None;
                        if let Some(client) = &client {
                            let current: Vec<String> = topics.read().iter().cloned().collect();
                            for topic in current {
                                if let Err(e) = client.subscribe(topic.clone(), qos_from(qos)).await {
                                    warn!(topic = %topic, error = %e, "resubscribe failed");
                                }
                            }
                        }
                        debug!("mqtt session (re)established");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        counters.reconnects.fetch_add(1, Ordering::Relaxed);
                        *last_error.write() = Some(e.to_string());
                        // Jitter keeps a fleet of connectors from hammering a
                        // recovering broker in lockstep.
                        let jitter = Duration::from_millis(rand::random::<u64>() % 250);
                        warn!(error = %e, "mqtt connection lost, backing off");
                        tokio::time::sleep(reconnect_delay + jitter).await;
                    }
                }
            }
        })
    }

    async fn dispatch(&self, request: &ExecuteRequest) -> Result<ExecuteResponse> {
        match request.operation.as_str() {
            operation::PUBLISH => self.run_publish(request).await,
            operation::SUBSCRIBE => {
                let topic = request
                    .param_str("topic")
                    .ok_or_else(|| BridgeError::ConfigInvalid("subscribe requires topic".to_string()))?
                    .to_string();
                let (config, _) = self.require_config()?;
                self.require_client()?
                    .subscribe(topic.clone(), qos_from(config.qos))
                    .await
                    .map_err(|e| BridgeError::Transport(format!("subscribe failed: {}", e)))?;
                self.topics.write().insert(topic.clone());
                Ok(ExecuteResponse::ok(Some(json!({
                    "topic": topic,
                    "topics": self.topics.read().iter().cloned().collect::<Vec<_>>(),
                }))))
            }
            operation::UNSUBSCRIBE => {
                let topic = request
                    .param_str("topic")
                    .ok_or_else(|| BridgeError::ConfigInvalid("unsubscribe requires topic".to_string()))?
                    .to_string();
                self.require_client()?
                    .unsubscribe(topic.clone())
                    .await
                    .map_err(|e| BridgeError::Transport(format!("unsubscribe failed: {}", e)))?;
                self.topics.write().remove(&topic);
                Ok(ExecuteResponse::ok(Some(json!({"topic": topic}))))
            }
            operation::QUERY | operation::READ => Ok(self.query_response(request)),
            operation::STATUS => Ok(self.status_response()),
            operation::CONNECT_TEST => self.run_connect_test().await,
            other => Err(BridgeError::OperationUnsupported(format!(
                "mqtt connector does not support {:?}",
                other
            ))),
        }
    }

    async fn run_publish(&self, request: &ExecuteRequest) -> Result<ExecuteResponse> {
        let topic = request
            .param_str("topic")
            .ok_or_else(|| BridgeError::ConfigInvalid("publish requires topic".to_string()))?
            .to_string();
        let payload: Vec<u8> = match &request.data {
            Some(Value::String(s)) => s.clone().into_bytes(),
            Some(other) => serde_json::to_vec(other)?,
            None => {
                return Err(BridgeError::ConfigInvalid("publish requires a payload".to_string()))
            }
        };
        let (config, _) = self.require_config()?;
        let size = payload.len();
        self.require_client()?
            .publish(topic.clone(), qos_from(config.qos), false, payload)
            .await
            .map_err(|e| BridgeError::Transport(format!("publish failed: {}", e)))?;
        Ok(ExecuteResponse::ok(None)
            .with_message(format!("published {} bytes to {}", size, topic))
            .with_metadata("topic", json!(topic)))
    }

    async fn run_connect_test(&self) -> Result<ExecuteResponse> {
        let (config, params) = self.require_config()?;
        let addr = format!("{}:{}", config.host, config.port);
        let started = Instant::now();
        tokio::time::timeout(params.timeout, tokio::net::TcpStream::connect(&addr))
            .await
            .map_err(|_| BridgeError::Timeout(format!("broker {} unreachable", addr)))?
            .map_err(|e| BridgeError::TransportUnavailable(format!("broker {}: {}", addr, e)))?;
        Ok(ExecuteResponse::ok(None)
            .with_message("broker reachable")
            .with_metadata("elapsed_ms", json!(started.elapsed().as_millis() as u64)))
    }

    fn query_response(&self, request: &ExecuteRequest) -> ExecuteResponse {
        let page = request.param_i64("page").unwrap_or(1).max(1);
        let page_size = request.param_i64("page_size").unwrap_or(100).clamp(1, 1000);
        let filter = request.param_str("topic").map(|s| s.to_string());

        let ring = self.ring.read();
        let filtered: Vec<&Value> = ring
            .iter()
            .filter(|message| match &filter {
                Some(filter) => message
                    .get("topic")
                    .and_then(|t| t.as_str())
                    .map(|topic| topic_matches(filter, topic))
                    .unwrap_or(false),
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
        let config = self.config.read().as_ref().map(|(c, _)| c.clone());
        ExecuteResponse::ok(Some(json!({
            "initialized": self.base.is_initialized(),
            "started": self.base.is_started(),
            "type": self.base.source_type(),
            "broker": config.as_ref().map(|c| format!("{}:{}", c.host, c.port)),
            "client_id": config.as_ref().map(|c| c.client_id.clone()),
            "topics": self.topics.read().iter().cloned().collect::<Vec<_>>(),
            "buffered": self.ring.read().len(),
            "subscribers": self.subscribers.read().len(),
            "received": self.counters.received.load(Ordering::Relaxed),
            "dropped": self.counters.dropped.load(Ordering::Relaxed),
            "reconnects": self.counters.reconnects.load(Ordering::Relaxed),
            "non_json_dropped": self.counters.non_json_dropped.load(Ordering::Relaxed),
            "last_error": self.last_error.read().clone(),
        })))
    }
}

#[async_trait]
impl Connector for MqttConnector {
    fn source_type(&self) -> &str {
        self.base.source_type()
    }

    fn is_resident(&self) -> bool {
        true
    }

    async fn init(&self, data_source: DataSource) -> Result<()> {
        let _guard = self.base.lifecycle_guard().await;
        self.base.check_not_initialized()?;

        let config = MqttConnectionConfig::from_map(&data_source.connection_config)?;
        let params = ParamsConfig::from_map(&data_source.params_config)?;
        *self.topics.write() = config.topics.iter().cloned().collect();
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

        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(params.keep_alive);
        options.set_clean_session(config.clean_session);
        if !config.username.is_empty() {
            options.set_credentials(&config.username, &config.password);
        }

        let (client, event_loop) = AsyncClient::new(options, params.channel_capacity);
        *self.client.write() = Some(client.clone());

        for topic in config.topics.iter() {
            client
                .subscribe(topic.clone(), qos_from(config.qos))
                .await
                .map_err(|e| BridgeError::TransportUnavailable(format!("subscribe {}: {}", topic, e)))?;
        }

        let (tx, rx) = mpsc::channel(params.channel_capacity);
        self.spawn_consumer(rx, data_source.id.clone(), params.enable_auto_write);
        let handle = self.spawn_event_loop(event_loop, tx, params.reconnect_delay);
        *self.event_loop.lock().await = Some(handle);

        self.base.run_hook("start", None).await?;
        self.base.set_started(true);
        info!(broker = %format!("{}:{}", config.host, config.port), client_id = %config.client_id, "mqtt connector started");
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
        let client = self.client.write().take();
        if let Some(client) = client {
            if let Err(e) = client.disconnect().await {
                debug!(error = %e, "mqtt disconnect while stopping");
            }
        }
        if let Some(handle) = self.event_loop.lock().await.take() {
            handle.abort();
        }
        self.subscribers.write().clear();
        self.base.run_stop_hook().await;
        self.base.set_started(false);
        info!("mqtt connector stopped");
        Ok(())
    }

    async fn health_check(&self) -> HealthState {
        if !self.base.is_initialized() {
            return HealthState::offline();
        }
        if !self.base.is_started() {
            return HealthState::ready();
        }
        match self.last_error.read().clone() {
            Some(error) => HealthState::error(error),
            None => HealthState::online()
                .with_detail("buffered", self.ring.read().len().to_string())
                .with_detail("topics", self.topics.read().len().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataSourceCategory, FieldMapping, InterfaceInfo, ParseConfig};
    use crate::realtime::{DataWriter, ProcessorConfig, RealtimeProcessor, StaticInterfaceLoader};

    fn data_source() -> DataSource {
        DataSource::new("ds-mqtt", source_type::MESSAGING_MQTT, DataSourceCategory::Messaging)
            .with_connection("broker", json!("tcp://127.0.0.1:1883"))
            .with_connection("topics", json!(["sensors/+"]))
    }

    #[test]
    fn test_topic_wildcards() {
        assert!(topic_matches("sensors/+", "sensors/d1"));
        assert!(!topic_matches("sensors/+", "sensors/d1/temp"));
        assert!(topic_matches("sensors/#", "sensors/d1/temp"));
        assert!(topic_matches("a/b", "a/b"));
        assert!(!topic_matches("a/b", "a/c"));
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(qos_from(0), QoS::AtMostOnce);
        assert_eq!(qos_from(1), QoS::AtLeastOnce);
        assert_eq!(qos_from(2), QoS::ExactlyOnce);
        assert_eq!(qos_from(9), QoS::AtMostOnce);
    }

    #[test]
    fn test_build_message_parses_json_payload() {
        let mut publish = rumqttc::Publish::new("sensors/d1", QoS::AtLeastOnce, br#"{"temp_c": 22.5}"#.to_vec());
        publish.retain = true;
        let message = MqttConnector::build_message(&publish);
        assert_eq!(message["topic"], json!("sensors/d1"));
        assert_eq!(message["retained"], json!(true));
        assert_eq!(message["parsed_data"]["temp_c"], json!(22.5));
    }

    #[test]
    fn test_build_message_keeps_raw_payload() {
        let publish = rumqttc::Publish::new("sensors/d1", QoS::AtMostOnce, b"not json".to_vec());
        let message = MqttConnector::build_message(&publish);
        assert_eq!(message["payload"], json!("not json"));
        assert!(message["parsed_data"].is_null());
    }

    #[tokio::test]
    async fn test_health_and_preconditions() {
        let c = MqttConnector::new(RuntimeContext::new());
        assert_eq!(c.health_check().await.status, crate::model::HealthStatus::Offline);

        c.init(data_source()).await.unwrap();
        assert_eq!(c.health_check().await.status, crate::model::HealthStatus::Ready);

        let err = c.execute(ExecuteRequest::new(operation::PUBLISH)).await.unwrap_err();
        assert_eq!(err.kind(), "not_ready");
    }

    struct CountingWriter {
        batches: parking_lot::Mutex<Vec<(String, Vec<Value>)>>,
    }

    #[async_trait]
    impl DataWriter for CountingWriter {
        async fn write_data(&self, interface_id: &str, records: Vec<Value>) -> Result<u64> {
            let count = records.len() as u64;
            self.batches.lock().push((interface_id.to_string(), records));
            Ok(count)
        }
    }

    /// Auto-write path: a parsed sensor message reaches the processor with
    /// the interface's field mapping applied, within the batch timeout.
    #[tokio::test]
    async fn test_auto_write_applies_field_mapping() {
        let ctx = RuntimeContext::new();
        let writer = Arc::new(CountingWriter {
            batches: parking_lot::Mutex::new(Vec::new()),
        });
        let loader = Arc::new(StaticInterfaceLoader::new());
        loader.insert(InterfaceInfo {
            id: "if-sensors".to_string(),
            schema_name: String::new(),
            table_name: "sensor_readings".to_string(),
            parse_config: ParseConfig {
                field_mapping: vec![FieldMapping {
                    source: "temp_c".to_string(),
                    target: "temperature".to_string(),
                }],
            },
        });
        let processor = RealtimeProcessor::with_config(
            writer.clone(),
            loader,
            ProcessorConfig {
                batch_size: 100,
                batch_timeout: Duration::from_millis(50),
            },
        );
        processor.register_interface("if-sensors", "ds-mqtt").await.unwrap();
        ctx.set_realtime(processor);

        let c = MqttConnector::new(ctx.clone());
        let ds = data_source().with_param("enableAutoWrite", json!(true));
        c.init(ds).await.unwrap();

        // Drive the consumer pipeline directly; the broker session is not
        // needed for the fan-out contract.
        let (tx, rx) = mpsc::channel(16);
        c.spawn_consumer(rx, "ds-mqtt".to_string(), true);

        let publish = rumqttc::Publish::new(
            "sensors/d1",
            QoS::AtMostOnce,
            br#"{"device": "d1", "temp_c": 22.5}"#.to_vec(),
        );
        tx.send(MqttConnector::build_message(&publish)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let batches = writer.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0, "if-sensors");
        assert_eq!(batches[0].1, vec![json!({"device": "d1", "temperature": 22.5})]);
        assert_eq!(c.ring.read().len(), 1);
    }

    #[tokio::test]
    async fn test_non_json_skipped_by_auto_write() {
        let ctx = RuntimeContext::new();
        let c = MqttConnector::new(ctx.clone());
        c.init(data_source().with_param("enableAutoWrite", json!(true)))
            .await
            .unwrap();

        let (tx, rx) = mpsc::channel(16);
        c.spawn_consumer(rx, "ds-mqtt".to_string(), true);

        let publish = rumqttc::Publish::new("sensors/d1", QoS::AtMostOnce, b"raw bytes".to_vec());
        tx.send(MqttConnector::build_message(&publish)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(c.counters.non_json_dropped.load(Ordering::Relaxed), 1);
        assert_eq!(c.ring.read().len(), 1, "raw payload still buffered");
    }

    #[tokio::test]
    async fn test_query_filters_by_topic_pattern() {
        let c = MqttConnector::new(RuntimeContext::new());
        c.init(data_source()).await.unwrap();
        {
            let mut ring = c.ring.write();
            for (topic, n) in [("sensors/d1", 1), ("sensors/d2", 2), ("alerts/high", 3)] {
                ring.push_back(json!({"topic": topic, "n": n}));
            }
        }
        c.base.set_started(true);

        let resp = c
            .execute(ExecuteRequest::new(operation::QUERY).with_param("topic", json!("sensors/+")))
            .await
            .unwrap();
        let data = resp.data.unwrap();
        assert_eq!(data["total"], json!(2));

        let all = c.execute(ExecuteRequest::new(operation::QUERY)).await.unwrap();
        assert_eq!(all.data.unwrap()["total"], json!(3));
    }

    #[tokio::test]
    async fn test_ring_eviction_at_capacity() {
        let c = MqttConnector::new(RuntimeContext::new());
        c.init(data_source()).await.unwrap();

        let (tx, rx) = mpsc::channel(16);
        c.spawn_consumer(rx, "ds-mqtt".to_string(), false);

        for i in 0..(RING_CAPACITY + 10) {
            let publish = rumqttc::Publish::new(
                "sensors/d1",
                QoS::AtMostOnce,
                format!(r#"{{"n": {}}}"#, i).into_bytes(),
            );
            tx.send(MqttConnector::build_message(&publish)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        let ring = c.ring.read();
        assert_eq!(ring.len(), RING_CAPACITY);
        // FIFO eviction: the oldest entries are gone.
        assert_eq!(ring.front().unwrap()["parsed_data"]["n"], json!(10));
    }
}
