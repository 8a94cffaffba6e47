// # Connector Contract
//
// The uniform lifecycle every connector kind implements, the factory that
// maps type tags to constructors, and the shared runtime context (script
// executor, webhook suffix registry, optional fan-out processor handle)
// handed to each connector at creation.

pub mod base;
pub mod http;
pub mod http_auth;
pub mod mqtt;
pub mod postgres;
pub mod webhook;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{BridgeError, Result};
use crate::model::{source_type, DataSource, ExecuteRequest, ExecuteResponse, HealthState};
use crate::realtime::RealtimeProcessor;
use crate::script::ScriptExecutor;

pub use base::ConnectorBase;
pub use webhook::{WebhookRegistry, WebhookRequest, WebhookResponse};

/// Uniform connector lifecycle: Init → Start → Execute → Stop.
///
/// `init` and `start` hold the connector's lifecycle lock exclusively;
/// `execute` and `health_check` only take shared state. `stop` is idempotent
/// and always safe to call.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Type tag this connector was created for.
    fn source_type(&self) -> &str;

    /// Resident connectors hold long-lived resources and are auto-started by
    /// the supervisor; non-resident ones are started around each call.
    fn is_resident(&self) -> bool;

    /// Store and validate configuration; runs the optional init hook.
    async fn init(&self, data_source: DataSource) -> Result<()>;

    /// Establish long-lived resources; runs the optional start hook.
    async fn start(&self) -> Result<()>;

    /// Dispatch one operation. Precondition violations (`NotReady`,
    /// `OperationUnsupported`) surface as errors; dispatch failures are
    /// reported in band with `success = false` and diagnostic metadata.
    async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResponse>;

    /// Release resources; runs the optional stop hook. Never fails the
    /// caller: internal errors are logged and swallowed.
    async fn stop(&self) -> Result<()>;

    /// Probe liveness without mutating state.
    async fn health_check(&self) -> HealthState;
}

impl std::fmt::Debug for dyn Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("source_type", &self.source_type())
            .finish()
    }
}

/// A cancellable periodic background task: session refreshers, pool sweepers,
/// and the supervisor tickers all run through this.
pub struct PeriodicTask {
    name: String,
    handle: JoinHandle<()>,
    cancel: watch::Sender<bool>,
}

impl PeriodicTask {
    /// Spawn a task invoking `tick` every `interval`. The tick returning
    /// `false` ends the task.
    pub fn spawn<F, Fut>(name: &str, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send,
    {
        let (cancel, mut cancelled) = watch::channel(false);
        let task_name = name.to_string();
        let loop_name = task_name.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately; skip it so
            // the task waits a full period before its first run.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !tick().await {
                            debug!(task = %loop_name, "periodic task finished");
                            break;
                        }
                    }
                    _ = cancelled.changed() => {
                        debug!(task = %loop_name, "periodic task cancelled");
                        break;
                    }
                }
            }
        });
        Self {
            name: task_name,
            handle,
            cancel,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal the task to stop and abort the underlying join handle.
    pub fn cancel(self) {
        let _ = self.cancel.send(true);
        self.handle.abort();
    }
}

/// Shared services handed to every connector by the factory.
pub struct RuntimeContext {
    scripts: Arc<ScriptExecutor>,
    webhooks: Arc<WebhookRegistry>,
    realtime: RwLock<Option<Arc<RealtimeProcessor>>>,
}

impl RuntimeContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Arc::new(ScriptExecutor::new()),
            webhooks: Arc::new(WebhookRegistry::new()),
            realtime: RwLock::new(None),
        })
    }

    pub fn scripts(&self) -> Arc<ScriptExecutor> {
        self.scripts.clone()
    }

    pub fn webhooks(&self) -> Arc<WebhookRegistry> {
        self.webhooks.clone()
    }

    /// Attach the fan-out processor; push connectors with auto-write enabled
    /// forward records to it.
    pub fn set_realtime(&self, processor: Arc<RealtimeProcessor>) {
        *self.realtime.write() = Some(processor);
    }

    pub fn realtime(&self) -> Option<Arc<RealtimeProcessor>> {
        self.realtime.read().clone()
    }
}

type ConnectorBuilder = Box<dyn Fn(Arc<RuntimeContext>) -> Arc<dyn Connector> + Send + Sync>;

/// Maps data source type tags to connector constructors. Hosts may register
/// additional kinds.
pub struct ConnectorFactory {
    context: Arc<RuntimeContext>,
    builders: RwLock<HashMap<String, ConnectorBuilder>>,
}

impl ConnectorFactory {
    pub fn new(context: Arc<RuntimeContext>) -> Self {
        let factory = Self {
            context,
            builders: RwLock::new(HashMap::new()),
        };
        factory.register_defaults();
        factory
    }

    fn register_defaults(&self) {
        self.register(source_type::DB_POSTGRESQL, |ctx| {
            Arc::new(postgres::PostgresConnector::new(ctx))
        });
        self.register(source_type::API_HTTP, |ctx| {
            Arc::new(http::HttpConnector::new(ctx))
        });
        self.register(source_type::API_HTTP_WITH_AUTH, |ctx| {
            Arc::new(http_auth::AuthHttpConnector::new(ctx))
        });
        self.register(source_type::MESSAGING_HTTP_POST, |ctx| {
            Arc::new(webhook::WebhookConnector::new(ctx))
        });
        self.register(source_type::MESSAGING_MQTT, |ctx| {
            Arc::new(mqtt::MqttConnector::new(ctx))
        });
    }

    pub fn register<F>(&self, type_tag: &str, builder: F)
    where
        F: Fn(Arc<RuntimeContext>) -> Arc<dyn Connector> + Send + Sync + 'static,
    {
        self.builders
            .write()
            .insert(type_tag.to_string(), Box::new(builder));
    }

    pub fn create(&self, type_tag: &str) -> Result<Arc<dyn Connector>> {
        let builders = self.builders.read();
        let builder = builders.get(type_tag).ok_or_else(|| {
            BridgeError::ConfigInvalid(format!("unsupported data source type {:?}", type_tag))
        })?;
        Ok(builder(self.context.clone()))
    }

    pub fn supported_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.builders.read().keys().cloned().collect();
        types.sort();
        types
    }

    pub fn context(&self) -> Arc<RuntimeContext> {
        self.context.clone()
    }
}
