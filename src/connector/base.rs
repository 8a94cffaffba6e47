// # Connector Base
//
// Shared plumbing embedded by every connector kind: the lifecycle flags and
// their locks, the DataSource snapshot, the per-connector session data map,
// and the script-hook invocation path.

use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::warn;

use crate::error::{BridgeError, Result};
use crate::model::{DataSource, ExecuteRequest, JsonMap};
use crate::script::{ScriptContext, ScriptExecutor, ScriptHttp};

#[derive(Debug, Default)]
struct BaseState {
    initialized: bool,
    started: bool,
    data_source: Option<DataSource>,
}

/// State and hook plumbing shared by all connectors. Lifecycle transitions
/// serialize on an async mutex; flag reads take the shared state lock only.
pub struct ConnectorBase {
    source_type: String,
    lifecycle: Mutex<()>,
    state: RwLock<BaseState>,
    session: RwLock<JsonMap>,
    scripts: Arc<ScriptExecutor>,
    script_http: RwLock<Option<ScriptHttp>>,
}

impl ConnectorBase {
    pub fn new(source_type: impl Into<String>, scripts: Arc<ScriptExecutor>) -> Self {
        Self {
            source_type: source_type.into(),
            lifecycle: Mutex::new(()),
            state: RwLock::new(BaseState::default()),
            session: RwLock::new(JsonMap::new()),
            scripts,
            script_http: RwLock::new(None),
        }
    }

    pub fn source_type(&self) -> &str {
        &self.source_type
    }

    /// Serialize a lifecycle transition (init/start/stop).
    pub async fn lifecycle_guard(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock().await
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().initialized
    }

    pub fn is_started(&self) -> bool {
        self.state.read().started
    }

    pub fn data_source(&self) -> Option<DataSource> {
        self.state.read().data_source.clone()
    }

    pub fn require_data_source(&self) -> Result<DataSource> {
        self.data_source()
            .ok_or_else(|| BridgeError::NotReady(format!("{} connector not initialized", self.source_type)))
    }

    pub fn check_not_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            return Err(BridgeError::AlreadyInitialized(self.identity()));
        }
        Ok(())
    }

    pub fn check_can_start(&self) -> Result<()> {
        let state = self.state.read();
        if !state.initialized {
            return Err(BridgeError::NotReady(format!("{}: start before init", self.source_type)));
        }
        if state.started {
            return Err(BridgeError::AlreadyStarted(self.identity()));
        }
        Ok(())
    }

    /// Precondition for `execute`: initialized, and started when the kind
    /// requires a surrounding start.
    pub fn check_ready(&self, require_started: bool) -> Result<()> {
        let state = self.state.read();
        if !state.initialized {
            return Err(BridgeError::NotReady(format!("{}: not initialized", self.source_type)));
        }
        if require_started && !state.started {
            return Err(BridgeError::NotReady(format!("{}: not started", self.source_type)));
        }
        Ok(())
    }

    pub fn set_initialized(&self, data_source: DataSource) {
        let mut state = self.state.write();
        state.initialized = true;
        state.data_source = Some(data_source);
    }

    pub fn set_started(&self, started: bool) {
        self.state.write().started = started;
    }

    /// Roll the connector back to its pre-init state; used when an init hook
    /// fails after configuration was stored.
    pub fn reset(&self) {
        let mut state = self.state.write();
        state.initialized = false;
        state.started = false;
        state.data_source = None;
        drop(state);
        self.session_clear();
    }

    fn identity(&self) -> String {
        let state = self.state.read();
        match &state.data_source {
            Some(ds) => format!("{} ({})", self.source_type, ds.id),
            None => self.source_type.clone(),
        }
    }

    // --- session data ---

    pub fn session_snapshot(&self) -> JsonMap {
        self.session.read().clone()
    }

    pub fn session_get(&self, key: &str) -> Option<Value> {
        self.session.read().get(key).cloned()
    }

    pub fn session_set(&self, key: impl Into<String>, value: Value) {
        self.session.write().insert(key.into(), value);
    }

    /// Merge a script result into session data; null values remove the key.
    pub fn session_merge(&self, update: JsonMap) {
        if update.is_empty() {
            return;
        }
        let mut session = self.session.write();
        for (key, value) in update {
            match value {
                Value::Null => {
                    session.remove(&key);
                }
                other => {
                    session.insert(key, other);
                }
            }
        }
    }

    pub fn session_clear(&self) {
        self.session.write().clear();
    }

    // --- script hooks ---

    pub fn set_script_http(&self, http: ScriptHttp) {
        *self.script_http.write() = Some(http);
    }

    pub fn scripts(&self) -> Arc<ScriptExecutor> {
        self.scripts.clone()
    }

    fn hook_body(&self) -> Option<String> {
        let state = self.state.read();
        let ds = state.data_source.as_ref()?;
        if !ds.script_enabled {
            return None;
        }
        ds.script.clone()
    }

    /// Invoke the lifecycle hook for `operation` when a script is enabled;
    /// the script's result is merged into session data and also returned.
    pub async fn run_hook(&self, operation: &str, request: Option<&ExecuteRequest>) -> Result<JsonMap> {
        let Some(body) = self.hook_body() else {
            return Ok(JsonMap::new());
        };
        let data_source = self.data_source();
        let credentials = data_source
            .as_ref()
            .map(|ds| ds.connection_config.clone())
            .unwrap_or_default();

        let ctx = ScriptContext {
            operation: operation.to_string(),
            data_source,
            request: request.cloned(),
            credentials,
            session: self.session_snapshot(),
            http: self.script_http.read().clone(),
        };
        let result = self.scripts.execute(&body, &ctx).await?;
        self.session_merge(result.clone());
        Ok(result)
    }

    /// Hook variant for `stop`: failures are logged, never propagated, and
    /// session data is cleared afterwards regardless.
    pub async fn run_stop_hook(&self) {
        if let Err(e) = self.run_hook("stop", None).await {
            warn!(source_type = %self.source_type, error = %e, "stop hook failed");
        }
        self.session_clear();
    }
}
