// # Lifecycle Supervisor
//
// Owns the connector registry and its status mirror. Registration creates,
// initializes, and (for resident kinds) starts the connector, capturing
// failures into the status instead of refusing the registration so later
// reconnect passes can recover it. Two tickers run in the background: a
// health probe with a bounded per-connector deadline, and a reconnection
// pass honoring the per-status reconnect budget. Status snapshots are always
// returned as copies.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::connector::{Connector, ConnectorFactory, PeriodicTask, RuntimeContext, WebhookRegistry};
use crate::error::{BridgeError, Result};
use crate::model::config::get_i64;
use crate::model::{operation, DataSource, ExecuteRequest, ExecuteResponse, HealthStatus};
use crate::realtime::RealtimeProcessor;

/// Supervisor tunables.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub health_check_interval: Duration,
    pub health_probe_timeout: Duration,
    pub reconnect_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            health_probe_timeout: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Supervisor-side view of one registered connector.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectorStatus {
    pub id: String,
    pub source_type: String,
    pub is_resident: bool,
    pub is_started: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub health_status: HealthStatus,
    pub error_message: Option<String>,
    pub reconnect_attempts: u32,
    pub max_reconnects: u32,
    pub auto_restart: bool,
    pub usage_count: u64,
    pub last_used: Option<DateTime<Utc>>,
}

impl ConnectorStatus {
    fn new(id: &str, source_type: &str, is_resident: bool, max_reconnects: u32) -> Self {
        Self {
            id: id.to_string(),
            source_type: source_type.to_string(),
            is_resident,
            is_started: false,
            started_at: None,
            last_health_check: None,
            health_status: HealthStatus::Offline,
            error_message: None,
            reconnect_attempts: 0,
            max_reconnects,
            auto_restart: is_resident,
            usage_count: 0,
            last_used: None,
        }
    }
}

#[derive(Default)]
struct Registries {
    connectors: HashMap<String, Arc<dyn Connector>>,
    statuses: HashMap<String, ConnectorStatus>,
}

/// The supervisor proper.
pub struct DataSourceManager {
    config: ManagerConfig,
    factory: ConnectorFactory,
    inner: RwLock<Registries>,
    tickers: Mutex<Vec<PeriodicTask>>,
    self_weak: Weak<Self>,
}

impl DataSourceManager {
    pub fn new() -> Arc<Self> {
        Self::with_config(ManagerConfig::default())
    }

    pub fn with_config(config: ManagerConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            factory: ConnectorFactory::new(RuntimeContext::new()),
            inner: RwLock::new(Registries::default()),
            tickers: Mutex::new(Vec::new()),
            self_weak: weak.clone(),
        })
    }

    pub fn factory(&self) -> &ConnectorFactory {
        &self.factory
    }

    /// The runtime's webhook suffix namespace, for host request routing.
    pub fn webhooks(&self) -> Arc<WebhookRegistry> {
        self.factory.context().webhooks()
    }

    /// Attach the fan-out processor used by push connectors with auto-write.
    pub fn set_realtime(&self, processor: Arc<RealtimeProcessor>) {
        self.factory.context().set_realtime(processor);
    }

    /// Register a data source: create the connector, initialize it, and
    /// auto-start resident kinds. Init/start failures land in the status so a
    /// later pass (or a manual restart) can retry.
    pub async fn register(&self, data_source: DataSource) -> Result<()> {
        let id = data_source.id.clone();
        if self.inner.read().connectors.contains_key(&id) {
            return Err(BridgeError::AlreadyInitialized(format!(
                "data source {} already registered",
                id
            )));
        }

        let connector = self.factory.create(&data_source.source_type)?;
        let max_reconnects = get_i64(&data_source.params_config, "maxReconnects").unwrap_or(3) as u32;
        let mut status = ConnectorStatus::new(
            &id,
            &data_source.source_type,
            connector.is_resident(),
            max_reconnects,
        );

        match connector.init(data_source).await {
            Ok(()) => {
                status.health_status = HealthStatus::Ready;
                if connector.is_resident() {
                    match connector.start().await {
                        Ok(()) => {
                            status.is_started = true;
                            status.started_at = Some(Utc::now());
                            status.health_status = HealthStatus::Online;
                            info!(id = %id, "resident connector started");
                        }
                        Err(e) => {
                            warn!(id = %id, error = %e, "resident connector failed to start");
                            status.health_status = HealthStatus::Error;
                            status.error_message = Some(e.to_string());
                        }
                    }
                }
            }
            Err(e) => {
                warn!(id = %id, error = %e, "connector init failed, kept for retry");
                status.health_status = HealthStatus::Error;
                status.error_message = Some(e.to_string());
            }
        }

        let lost_race = {
            let mut inner = self.inner.write();
            if inner.connectors.contains_key(&id) {
                true
            } else {
                inner.connectors.insert(id.clone(), connector.clone());
                inner.statuses.insert(id.clone(), status);
                false
            }
        };
        if lost_race {
            // Lost a registration race; the stored connector wins and this
            // one releases whatever it grabbed.
            if let Err(e) = connector.stop().await {
                warn!(id = %id, error = %e, "stop of raced connector failed");
            }
            return Err(BridgeError::AlreadyInitialized(format!(
                "data source {} already registered",
                id
            )));
        }
        Ok(())
    }

    /// Stop and remove a connector and its status.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let connector = {
            let mut inner = self.inner.write();
            inner.statuses.remove(id);
            inner.connectors.remove(id)
        };
        match connector {
            Some(connector) => {
                if let Err(e) = connector.stop().await {
                    warn!(id, error = %e, "stop during remove failed");
                }
                Ok(())
            }
            None => Err(BridgeError::NotFound(format!("data source {} not registered", id))),
        }
    }

    fn lookup(&self, id: &str) -> Result<Arc<dyn Connector>> {
        self.inner
            .read()
            .connectors
            .get(id)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound(format!("data source {} not registered", id)))
    }

    fn touch_usage(&self, id: &str) {
        let mut inner = self.inner.write();
        if let Some(status) = inner.statuses.get_mut(id) {
            status.usage_count += 1;
            status.last_used = Some(Utc::now());
        }
    }

    /// Execute one request against a registered data source. Non-resident
    /// kinds get a surrounding start/stop; errors come back in band.
    pub async fn execute_data_source(&self, id: &str, request: ExecuteRequest) -> ExecuteResponse {
        let connector = match self.lookup(id) {
            Ok(c) => c,
            Err(e) => return ExecuteResponse::from_error(&e),
        };
        self.touch_usage(id);

        if connector.is_resident() {
            return match connector.execute(request).await {
                Ok(resp) => resp,
                Err(e) => ExecuteResponse::from_error(&e),
            };
        }

        // Non-resident: start, execute, and always stop again.
        if let Err(e) = connector.start().await {
            return ExecuteResponse::from_error(&e);
        }
        let response = match connector.execute(request).await {
            Ok(resp) => resp,
            Err(e) => ExecuteResponse::from_error(&e),
        };
        if let Err(e) = connector.stop().await {
            warn!(id, error = %e, "stop after non-resident execute failed");
        }
        response
    }

    /// Bounded connection probe for a registered data source.
    pub async fn test_data_source(&self, id: &str) -> ExecuteResponse {
        self.execute_data_source(id, ExecuteRequest::new(operation::CONNECT_TEST))
            .await
    }

    pub fn get_status(&self, id: &str) -> Option<ConnectorStatus> {
        self.inner.read().statuses.get(id).cloned()
    }

    pub fn list_statuses(&self) -> Vec<ConnectorStatus> {
        let mut statuses: Vec<ConnectorStatus> = self.inner.read().statuses.values().cloned().collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    pub fn reset_reconnect_attempts(&self, id: &str) {
        let mut inner = self.inner.write();
        if let Some(status) = inner.statuses.get_mut(id) {
            status.reconnect_attempts = 0;
        }
    }

    /// Manual restart: resets the reconnect budget, then stop + start.
    pub async fn restart(&self, id: &str) -> Result<()> {
        let connector = self.lookup(id)?;
        self.reset_reconnect_attempts(id);

        if let Err(e) = connector.stop().await {
            warn!(id, error = %e, "stop during restart failed");
        }
        let result = connector.start().await;

        let mut inner = self.inner.write();
        if let Some(status) = inner.statuses.get_mut(id) {
            match &result {
                Ok(()) => {
                    status.is_started = true;
                    status.started_at = Some(Utc::now());
                    status.health_status = HealthStatus::Online;
                    status.error_message = None;
                }
                Err(e) => {
                    status.is_started = false;
                    status.health_status = HealthStatus::Error;
                    status.error_message = Some(e.to_string());
                }
            }
        }
        result
    }

    /// One health sweep over every connector with a bounded probe deadline.
    pub async fn run_health_pass(&self) {
        let targets: Vec<(String, Arc<dyn Connector>)> = self
            .inner
            .read()
            .connectors
            .iter()
            .map(|(id, c)| (id.clone(), c.clone()))
            .collect();

        for (id, connector) in targets {
            let health = match tokio::time::timeout(self.config.health_probe_timeout, connector.health_check()).await {
                Ok(health) => health,
                Err(_) => crate::model::HealthState::error("health probe timed out"),
            };

            let mut inner = self.inner.write();
            if let Some(status) = inner.statuses.get_mut(&id) {
                status.last_health_check = Some(Utc::now());
                status.health_status = health.status;
                status.error_message = health.message;
            }
        }
    }

    /// One reconnection sweep: resident connectors in error with spare budget
    /// get a stop + start; past the cap they are left alone until a manual
    /// reset.
    pub async fn run_reconnect_pass(&self) {
        let candidates: Vec<(String, Arc<dyn Connector>)> = {
            let inner = self.inner.read();
            inner
                .statuses
                .values()
                .filter(|s| {
                    s.is_resident
                        && s.auto_restart
                        && s.health_status == HealthStatus::Error
                        && !s.is_started
                        && s.reconnect_attempts < s.max_reconnects
                })
                .filter_map(|s| inner.connectors.get(&s.id).map(|c| (s.id.clone(), c.clone())))
                .collect()
        };

        for (id, connector) in candidates {
            {
                let mut inner = self.inner.write();
                let Some(status) = inner.statuses.get_mut(&id) else { continue };
                status.reconnect_attempts += 1;
                info!(id = %id, attempt = status.reconnect_attempts, max = status.max_reconnects, "reconnect attempt");
            }

            if let Err(e) = connector.stop().await {
                warn!(id = %id, error = %e, "stop before reconnect failed");
            }
            let result = connector.start().await;

            let mut inner = self.inner.write();
            if let Some(status) = inner.statuses.get_mut(&id) {
                match &result {
                    Ok(()) => {
                        status.is_started = true;
                        status.started_at = Some(Utc::now());
                        status.health_status = HealthStatus::Online;
                        status.error_message = None;
                        info!(id = %id, "reconnect succeeded");
                    }
                    Err(e) => {
                        status.health_status = HealthStatus::Error;
                        status.error_message = Some(e.to_string());
                        if status.reconnect_attempts >= status.max_reconnects {
                            error!(id = %id, "reconnect budget exhausted, giving up until manual restart");
                        }
                    }
                }
            }
        }
    }

    /// Arm the health and reconnection tickers.
    pub async fn start_supervision(&self) {
        let health_target = self.self_weak.clone();
        let health = PeriodicTask::spawn("health-probe", self.config.health_check_interval, move || {
            let target = health_target.clone();
            async move {
                match target.upgrade() {
                    Some(manager) => {
                        manager.run_health_pass().await;
                        true
                    }
                    None => false,
                }
            }
        });

        let reconnect_target = self.self_weak.clone();
        let reconnect = PeriodicTask::spawn("reconnect", self.config.reconnect_interval, move || {
            let target = reconnect_target.clone();
            async move {
                match target.upgrade() {
                    Some(manager) => {
                        manager.run_reconnect_pass().await;
                        true
                    }
                    None => false,
                }
            }
        });

        let mut tickers = self.tickers.lock().await;
        tickers.push(health);
        tickers.push(reconnect);
    }

    /// Cancel tickers and stop every connector under one deadline.
    pub async fn shutdown(&self) {
        for ticker in self.tickers.lock().await.drain(..) {
            ticker.cancel();
        }

        let connectors: Vec<(String, Arc<dyn Connector>)> = self
            .inner
            .read()
            .connectors
            .iter()
            .map(|(id, c)| (id.clone(), c.clone()))
            .collect();

        let stops = connectors.into_iter().map(|(id, connector)| async move {
            if let Err(e) = connector.stop().await {
                warn!(id = %id, error = %e, "stop during shutdown failed");
            }
        });
        if tokio::time::timeout(self.config.shutdown_timeout, futures::future::join_all(stops))
            .await
            .is_err()
        {
            error!("shutdown deadline exceeded, abandoning remaining stops");
        }

        if let Some(processor) = self.factory.context().realtime() {
            processor.shutdown();
        }

        let mut inner = self.inner.write();
        for status in inner.statuses.values_mut() {
            status.is_started = false;
            status.health_status = HealthStatus::Offline;
        }
        info!("data source manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{source_type, DataSourceCategory, HealthState};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Resident connector whose start always fails; init succeeds.
    struct FailingConnector {
        initialized: AtomicBool,
        start_calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl crate::connector::Connector for FailingConnector {
        fn source_type(&self) -> &str {
            "test_failing"
        }

        fn is_resident(&self) -> bool {
            true
        }

        async fn init(&self, _ds: DataSource) -> Result<()> {
            self.initialized.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn start(&self) -> Result<()> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            Err(BridgeError::TransportUnavailable("endpoint is down".to_string()))
        }

        async fn execute(&self, _request: ExecuteRequest) -> Result<ExecuteResponse> {
            Err(BridgeError::NotReady("never started".to_string()))
        }

        async fn stop(&self) -> Result<()> {
            Ok(())
        }

        async fn health_check(&self) -> HealthState {
            if self.initialized.load(Ordering::SeqCst) {
                HealthState::error("start keeps failing")
            } else {
                HealthState::offline()
            }
        }
    }

    fn failing_source(id: &str) -> DataSource {
        DataSource::new(id, "test_failing", DataSourceCategory::Api)
            .with_param("maxReconnects", json!(3))
    }

    fn register_failing_type(manager: &Arc<DataSourceManager>, calls: Arc<AtomicU32>) {
        manager.factory().register("test_failing", move |_ctx| {
            Arc::new(FailingConnector {
                initialized: AtomicBool::new(false),
                start_calls: calls.clone(),
            })
        });
    }

    #[tokio::test]
    async fn test_register_captures_start_failure() {
        let manager = DataSourceManager::new();
        let calls = Arc::new(AtomicU32::new(0));
        register_failing_type(&manager, calls.clone());

        manager.register(failing_source("ds-f")).await.unwrap();
        let status = manager.get_status("ds-f").unwrap();
        assert!(!status.is_started);
        assert_eq!(status.health_status, HealthStatus::Error);
        assert!(status.error_message.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reconnect_budget_cap_and_manual_reset() {
        let manager = DataSourceManager::new();
        let calls = Arc::new(AtomicU32::new(0));
        register_failing_type(&manager, calls.clone());
        manager.register(failing_source("ds-f")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Three reconnect passes consume the whole budget.
        for expected in 1..=3u32 {
            manager.run_reconnect_pass().await;
            assert_eq!(manager.get_status("ds-f").unwrap().reconnect_attempts, expected);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        // Past the cap, passes stop calling start.
        manager.run_reconnect_pass().await;
        manager.run_reconnect_pass().await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(manager.get_status("ds-f").unwrap().reconnect_attempts, 3);

        // Manual restart resets the counter and retries.
        let _ = manager.restart("ds-f").await;
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        let status = manager.get_status("ds-f").unwrap();
        assert_eq!(status.reconnect_attempts, 0);

        // With a fresh budget the pass tries again.
        manager.run_reconnect_pass().await;
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let manager = DataSourceManager::new();
        let calls = Arc::new(AtomicU32::new(0));
        register_failing_type(&manager, calls);
        manager.register(failing_source("ds-f")).await.unwrap();
        let err = manager.register(failing_source("ds-f")).await.unwrap_err();
        assert_eq!(err.kind(), "already_initialized");
    }

    #[tokio::test]
    async fn test_execute_unknown_source_in_band() {
        let manager = DataSourceManager::new();
        let resp = manager
            .execute_data_source("ghost", ExecuteRequest::new(operation::QUERY))
            .await;
        assert!(!resp.success);
        assert_eq!(resp.error, "not_found");
    }

    #[tokio::test]
    async fn test_health_pass_updates_statuses() {
        let manager = DataSourceManager::new();
        let calls = Arc::new(AtomicU32::new(0));
        register_failing_type(&manager, calls);
        manager.register(failing_source("ds-f")).await.unwrap();

        manager.run_health_pass().await;
        let status = manager.get_status("ds-f").unwrap();
        assert!(status.last_health_check.is_some());
        assert_eq!(status.health_status, HealthStatus::Error);
    }

    #[tokio::test]
    async fn test_status_snapshots_are_copies() {
        let manager = DataSourceManager::new();
        let calls = Arc::new(AtomicU32::new(0));
        register_failing_type(&manager, calls);
        manager.register(failing_source("ds-f")).await.unwrap();

        let mut snapshot = manager.get_status("ds-f").unwrap();
        snapshot.usage_count = 999;
        assert_eq!(manager.get_status("ds-f").unwrap().usage_count, 0);
    }

    #[tokio::test]
    async fn test_usage_tracking_on_execute() {
        let manager = DataSourceManager::new();
        let calls = Arc::new(AtomicU32::new(0));
        register_failing_type(&manager, calls);
        manager.register(failing_source("ds-f")).await.unwrap();

        manager
            .execute_data_source("ds-f", ExecuteRequest::new(operation::QUERY))
            .await;
        let status = manager.get_status("ds-f").unwrap();
        assert_eq!(status.usage_count, 1);
        assert!(status.last_used.is_some());
    }

    #[tokio::test]
    async fn test_remove_unregistered_not_found() {
        let manager = DataSourceManager::new();
        let err = manager.remove("ghost").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_shutdown_marks_all_offline() {
        let manager = DataSourceManager::new();
        let calls = Arc::new(AtomicU32::new(0));
        register_failing_type(&manager, calls);
        manager.register(failing_source("ds-f")).await.unwrap();
        manager.start_supervision().await;

        manager.shutdown().await;
        let status = manager.get_status("ds-f").unwrap();
        assert!(!status.is_started);
        assert_eq!(status.health_status, HealthStatus::Offline);
    }
}
