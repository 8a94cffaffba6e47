// # Authenticated HTTP Connector
//
// The unauthenticated pipeline plus an auth stage chosen by strategy:
// basic, bearer, api-key, oauth2 (client_credentials / password grants with
// token caching), or custom scripted session acquisition. Resident mode runs
// the start hook to acquire session state and, when configured, a periodic
// refresh task that re-invokes the script and merges the result. `stop`
// cancels the refresher and clears session data even when the stop hook
// fails.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::connector::http::{normalize_response, plan_request, probe_connectivity, send_plan, RequestPlan};
use crate::connector::{Connector, ConnectorBase, PeriodicTask, RuntimeContext};
use crate::error::{BridgeError, Result};
use crate::model::config::{AuthType, HttpConnectionConfig, ParamsConfig};
use crate::model::{
    operation, source_type, DataSource, ExecuteRequest, ExecuteResponse, HealthState,
};
use crate::pool::{HttpClientPool, PoolConfig};
use crate::script::ScriptHttp;

/// Tokens expiring within this window are refreshed before use.
const TOKEN_EXPIRY_SKEW: Duration = Duration::from_secs(30);
const DEFAULT_TOKEN_TTL: i64 = 3600;

pub struct AuthHttpConnector {
    base: Arc<ConnectorBase>,
    config: RwLock<Option<(HttpConnectionConfig, ParamsConfig)>>,
    pool: RwLock<Option<Arc<HttpClientPool>>>,
    refresher: Mutex<Option<PeriodicTask>>,
    sweeper: Mutex<Option<PeriodicTask>>,
    last_refresh_error: Arc<RwLock<Option<String>>>,
}

impl AuthHttpConnector {
    pub fn new(ctx: Arc<RuntimeContext>) -> Self {
        Self {
            base: Arc::new(ConnectorBase::new(source_type::API_HTTP_WITH_AUTH, ctx.scripts())),
            config: RwLock::new(None),
            pool: RwLock::new(None),
            refresher: Mutex::new(None),
            sweeper: Mutex::new(None),
            last_refresh_error: Arc::new(RwLock::new(None)),
        }
    }

    fn require_config(&self) -> Result<(HttpConnectionConfig, ParamsConfig)> {
        self.config
            .read()
            .clone()
            .ok_or_else(|| BridgeError::NotReady("auth http connector not initialized".to_string()))
    }

    fn require_pool(&self) -> Result<Arc<HttpClientPool>> {
        self.pool
            .read()
            .clone()
            .ok_or_else(|| BridgeError::NotReady("http pool not open".to_string()))
    }

    /// Apply the configured auth strategy to an outgoing plan. Runs last so
    /// auth headers win over request-supplied ones.
    async fn apply_auth(&self, plan: &mut RequestPlan, cfg: &HttpConnectionConfig) -> Result<()> {
        match cfg.auth_type {
            AuthType::Basic => {
                let token = BASE64.encode(format!("{}:{}", cfg.username, cfg.password));
                plan.add_header("Authorization", format!("Basic {}", token));
            }
            AuthType::Bearer => {
                let token = if !cfg.token.is_empty() { &cfg.token } else { &cfg.api_key };
                if token.is_empty() {
                    return Err(BridgeError::AuthFailure(
                        "bearer auth requires token or api_key".to_string(),
                    ));
                }
                plan.add_header("Authorization", format!("Bearer {}", token));
            }
            AuthType::ApiKey => {
                if cfg.api_key.is_empty() {
                    return Err(BridgeError::AuthFailure("api_key auth requires apiKey".to_string()));
                }
                plan.add_header(cfg.api_key_header.clone(), cfg.api_key.clone());
                if !cfg.api_secret.is_empty() {
                    plan.add_header("X-API-Secret", cfg.api_secret.clone());
                }
            }
            AuthType::OAuth2 => {
                let token = self.ensure_oauth_token(cfg).await?;
                plan.add_header("Authorization", format!("Bearer {}", token));
            }
            AuthType::Custom => {
                if let Some(session_id) = self.base.session_get("sessionId").and_then(as_text) {
                    match &cfg.session_id_param {
                        Some(param) => plan.add_query(param.clone(), session_id),
                        None => plan.add_header(cfg.session_id_header.clone(), session_id),
                    }
                } else if let Some(token) = self
                    .base
                    .session_get("auth_token")
                    .or_else(|| self.base.session_get("access_token"))
                    .and_then(as_text)
                {
                    plan.add_header("Authorization", format!("Bearer {}", token));
                } else {
                    return Err(BridgeError::SessionExpired(
                        "no session credentials available; start the connector first".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Return a valid OAuth2 access token, fetching a fresh one when the
    /// cache is empty or expires within the skew window.
    async fn ensure_oauth_token(&self, cfg: &HttpConnectionConfig) -> Result<String> {
        let now = Utc::now().timestamp();
        let cached = self.base.session_get("access_token").and_then(as_text);
        let expiry = self
            .base
            .session_get("token_expiry")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        if let Some(token) = cached {
            if expiry - now > TOKEN_EXPIRY_SKEW.as_secs() as i64 {
                return Ok(token);
            }
            debug!("cached oauth token near expiry, refreshing");
        }

        if cfg.token_endpoint.is_empty() {
            return Err(BridgeError::ConfigInvalid(
                "oauth2 auth requires tokenEndpoint".to_string(),
            ));
        }

        let mut form: Vec<(String, String)> = vec![
            ("grant_type".to_string(), cfg.grant_type.clone()),
            ("client_id".to_string(), cfg.client_id.clone()),
            ("client_secret".to_string(), cfg.client_secret.clone()),
        ];
        if cfg.grant_type == "password" {
            form.push(("username".to_string(), cfg.username.clone()));
            form.push(("password".to_string(), cfg.password.clone()));
        }
        if !cfg.scope.is_empty() {
            form.push(("scope".to_string(), cfg.scope.clone()));
        }

        let pool = self.require_pool()?;
        let pooled = pool.get()?;
        let response = pooled
            .client
            .post(cfg.token_endpoint.as_str())
            .form(&form)
            .send()
            .await;
        pool.put(pooled);
        let response = response?;

        let status = response.status();
        let body: Value = response.json().await.map_err(|e| {
            BridgeError::AuthFailure(format!("token endpoint returned non-json body: {}", e))
        })?;
        if !status.is_success() {
            return Err(BridgeError::AuthFailure(format!(
                "token endpoint returned status {}: {}",
                status, body
            )));
        }

        let token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BridgeError::AuthFailure("token response missing access_token".to_string()))?
            .to_string();
        let ttl = body.get("expires_in").and_then(|v| v.as_i64()).unwrap_or(DEFAULT_TOKEN_TTL);

        self.base.session_set("access_token", json!(token.clone()));
        self.base.session_set("token_expiry", json!(now + ttl));
        if let Some(refresh) = body.get("refresh_token").and_then(|v| v.as_str()) {
            self.base.session_set("refresh_token", json!(refresh));
        }
        info!(ttl, "acquired oauth2 access token");
        Ok(token)
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
                self.base.run_hook("execute", Some(request)).await?;

                let mut plan = plan_request(&http_cfg.base_url, request)?;
                self.apply_auth(&mut plan, &http_cfg).await?;

                let timeout = request.timeout.unwrap_or(params.timeout);
                let pool = self.require_pool()?;
                let pooled = pool.get()?;
                let result = send_plan(&pooled.client, &plan, timeout).await;
                pool.put(pooled);

                let (status, body, final_url) = result?;
                if status == 401 {
                    // Surface auth distinctly so the scheduler can refresh
                    // and retry instead of treating it as a dead endpoint.
                    return Err(BridgeError::AuthFailure(format!("unauthorized at {}", final_url)));
                }
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
                let session = self.base.session_snapshot();
                Ok(ExecuteResponse::ok(Some(json!({
                    "initialized": self.base.is_initialized(),
                    "started": self.base.is_started(),
                    "type": self.base.source_type(),
                    "base_url": http_cfg.base_url,
                    "session_keys": session.keys().cloned().collect::<Vec<_>>(),
                    "last_refresh_error": self.last_refresh_error.read().clone(),
                }))))
            }
            other => Err(BridgeError::OperationUnsupported(format!(
                "auth http connector does not support {:?}",
                other
            ))),
        }
    }

    async fn spawn_refresher(&self, interval: Duration) {
        let base = self.base.clone();
        let last_error = self.last_refresh_error.clone();
        let task = PeriodicTask::spawn("session-refresh", interval, move || {
            let base = base.clone();
            let last_error = last_error.clone();
            async move {
                if !base.is_started() {
                    return false;
                }
                match base.run_hook("refresh", None).await {
                    Ok(_) => {
                        base.session_set("last_refresh_time", json!(Utc::now().to_rfc3339()));
                        *last_error.write() = None;
                    }
                    Err(e) => {
                        // A failed refresh keeps the connector running; the
                        // next tick retries.
                        warn!(error = %e, "session refresh failed");
                        *last_error.write() = Some(e.to_string());
                    }
                }
                true
            }
        });
        *self.refresher.lock().await = Some(task);
    }
}

fn as_text(value: Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl Connector for AuthHttpConnector {
    fn source_type(&self) -> &str {
        self.base.source_type()
    }

    fn is_resident(&self) -> bool {
        true
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
        let (http_cfg, params) = self.require_config()?;

        // Session acquisition: the start hook runs first so scripted auth can
        // populate session data before any request goes out.
        self.base.run_hook("start", None).await?;

        let pool = self.require_pool()?;
        *self.sweeper.lock().await = Some(pool.start_sweeper());

        self.base.set_started(true);
        if let Some(interval) = params.session_refresh_interval {
            self.spawn_refresher(interval).await;
            debug!(interval_secs = interval.as_secs_f64(), "session refresher armed");
        }
        info!(base_url = %http_cfg.base_url, auth = ?http_cfg.auth_type, "auth http connector started");
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
        if let Some(refresher) = self.refresher.lock().await.take() {
            refresher.cancel();
        }
        if let Some(sweeper) = self.sweeper.lock().await.take() {
            sweeper.cancel();
        }
        // Stop hook runs, then the session is cleared no matter what.
        self.base.run_stop_hook().await;
        self.base.set_started(false);
        *self.last_refresh_error.write() = None;
        info!("auth http connector stopped");
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
            Ok(status) => {
                let mut health = HealthState::online().with_detail("status_code", status.to_string());
                if let Some(err) = self.last_refresh_error.read().clone() {
                    health = health.with_detail("last_refresh_error", err);
                }
                health
            }
            Err(e) => HealthState::error(e.to_string()),
        }
    }
}
