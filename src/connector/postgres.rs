// # Relational Connector
//
// Wraps a pooled PostgreSQL engine. Queries read columns dynamically so any
// table shape round-trips as JSON records; DML returns affected-row counts;
// `batch` runs an ordered list of statements inside one transaction. A
// non-resident connection test opens a minimized short-lived pool and closes
// it immediately.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row, TypeInfo};
use tracing::{info, warn};

use crate::connector::{Connector, ConnectorBase, RuntimeContext};
use crate::error::{BridgeError, Result};
use crate::model::config::{DbConnectionConfig, ParamsConfig};
use crate::model::{operation, source_type, DataSource, ExecuteRequest, ExecuteResponse, HealthState, JsonMap};
use crate::script::ScriptHttp;

const PING_TIMEOUT: Duration = Duration::from_secs(5);

pub struct PostgresConnector {
    base: ConnectorBase,
    config: RwLock<Option<(DbConnectionConfig, ParamsConfig)>>,
    pool: RwLock<Option<PgPool>>,
}

impl PostgresConnector {
    pub fn new(ctx: Arc<RuntimeContext>) -> Self {
        Self {
            base: ConnectorBase::new(source_type::DB_POSTGRESQL, ctx.scripts()),
            config: RwLock::new(None),
            pool: RwLock::new(None),
        }
    }

    fn require_config(&self) -> Result<(DbConnectionConfig, ParamsConfig)> {
        self.config
            .read()
            .clone()
            .ok_or_else(|| BridgeError::NotReady("postgres connector not initialized".to_string()))
    }

    fn require_pool(&self) -> Result<PgPool> {
        self.pool
            .read()
            .clone()
            .ok_or_else(|| BridgeError::NotReady("postgres pool not open".to_string()))
    }

    fn effective_timeout(&self, request: &ExecuteRequest) -> Duration {
        request.timeout.unwrap_or_else(|| {
            self.config
                .read()
                .as_ref()
                .map(|(_, p)| p.timeout)
                .unwrap_or(Duration::from_secs(30))
        })
    }

    async fn dispatch(&self, request: &ExecuteRequest) -> Result<ExecuteResponse> {
        let timeout = self.effective_timeout(request);
        match request.operation.as_str() {
            operation::QUERY | operation::SELECT => self.run_query(request, timeout).await,
            operation::INSERT | operation::UPDATE | operation::DELETE => {
                self.run_modify(request, timeout).await
            }
            operation::BATCH => self.run_batch(request, timeout).await,
            operation::CONNECT_TEST => self.run_connect_test(timeout).await,
            operation::STATUS => Ok(self.status_response()),
            other => Err(BridgeError::OperationUnsupported(format!(
                "postgres connector does not support {:?}",
                other
            ))),
        }
    }

    async fn run_query(&self, request: &ExecuteRequest, limit: Duration) -> Result<ExecuteResponse> {
        let sql = request
            .query
            .as_deref()
            .ok_or_else(|| BridgeError::ConfigInvalid("query operation requires sql text".to_string()))?;
        let pool = self.require_pool()?;

        let rows = tokio::time::timeout(limit, sqlx::query(sql).fetch_all(&pool)).await??;
        let records: Vec<Value> = rows.iter().map(row_to_json).collect();
        let count = records.len() as i64;
        Ok(ExecuteResponse::ok(Some(Value::Array(records)))
            .with_row_count(count)
            .with_message(format!("query returned {} rows", count)))
    }

    async fn run_modify(&self, request: &ExecuteRequest, limit: Duration) -> Result<ExecuteResponse> {
        let sql = request
            .query
            .as_deref()
            .ok_or_else(|| BridgeError::ConfigInvalid("modify operation requires sql text".to_string()))?;
        let pool = self.require_pool()?;

        let result = tokio::time::timeout(limit, sqlx::query(sql).execute(&pool)).await??;
        let affected = result.rows_affected() as i64;
        Ok(ExecuteResponse::ok(None)
            .with_row_count(affected)
            .with_message(format!("{} affected {} rows", request.operation, affected)))
    }

    /// Ordered statements inside one transaction; the first failure rolls the
    /// whole batch back.
    async fn run_batch(&self, request: &ExecuteRequest, limit: Duration) -> Result<ExecuteResponse> {
        let statements: Vec<String> = match &request.data {
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(|s| s.to_string())
                        .ok_or_else(|| BridgeError::ConfigInvalid("batch items must be sql strings".to_string()))
                })
                .collect::<Result<_>>()?,
            _ => {
                return Err(BridgeError::ConfigInvalid(
                    "batch operation requires an array of sql strings".to_string(),
                ))
            }
        };
        let pool = self.require_pool()?;

        let affected = tokio::time::timeout(limit, async {
            let mut tx = pool.begin().await?;
            let mut affected: i64 = 0;
            for (index, sql) in statements.iter().enumerate() {
                match sqlx::query(sql).execute(&mut *tx).await {
                    Ok(result) => affected += result.rows_affected() as i64,
                    Err(e) => {
                        tx.rollback().await.ok();
                        return Err(BridgeError::Sql(format!("batch statement {} failed: {}", index, e)));
                    }
                }
            }
            tx.commit().await?;
            Ok::<i64, BridgeError>(affected)
        })
        .await??;

        Ok(ExecuteResponse::ok(None)
            .with_row_count(affected)
            .with_message(format!("batch of {} statements committed", statements.len())))
    }

    /// Short-lived probe with minimized pool sizing.
    async fn run_connect_test(&self, limit: Duration) -> Result<ExecuteResponse> {
        let (db_cfg, _) = self.require_config()?;
        let started = Instant::now();
        let probe = async {
            let pool = PgPoolOptions::new()
                .max_connections(1)
                .min_connections(0)
                .acquire_timeout(limit)
                .connect(&db_cfg.connection_url())
                .await?;
            sqlx::query("SELECT 1").execute(&pool).await?;
            pool.close().await;
            Ok::<(), BridgeError>(())
        };
        tokio::time::timeout(limit, probe).await??;
        Ok(ExecuteResponse::ok(None)
            .with_message("connection test passed")
            .with_metadata("elapsed_ms", json!(started.elapsed().as_millis() as u64)))
    }

    fn status_response(&self) -> ExecuteResponse {
        let pool_status = self.pool.read().as_ref().map(|p| {
            json!({
                "size": p.size(),
                "idle": p.num_idle(),
            })
        });
        ExecuteResponse::ok(Some(json!({
            "initialized": self.base.is_initialized(),
            "started": self.base.is_started(),
            "type": self.base.source_type(),
            "pool": pool_status,
        })))
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    fn source_type(&self) -> &str {
        self.base.source_type()
    }

    fn is_resident(&self) -> bool {
        true
    }

    async fn init(&self, data_source: DataSource) -> Result<()> {
        let _guard = self.base.lifecycle_guard().await;
        self.base.check_not_initialized()?;

        let db_cfg = DbConnectionConfig::from_map(&data_source.connection_config)?;
        let params = ParamsConfig::from_map(&data_source.params_config)?;
        *self.config.write() = Some((db_cfg, params));

        self.base.set_script_http(ScriptHttp::new(reqwest::Client::new()));
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
        let (db_cfg, params) = self.require_config()?;

        let pool = PgPoolOptions::new()
            .max_connections(params.max_connections)
            .min_connections(params.min_connections)
            .acquire_timeout(params.timeout)
            .connect(&db_cfg.connection_url())
            .await
            .map_err(|e| BridgeError::TransportUnavailable(format!("postgres connect failed: {}", e)))?;

        tokio::time::timeout(PING_TIMEOUT, sqlx::query("SELECT 1").execute(&pool))
            .await
            .map_err(|_| BridgeError::Timeout("liveness ping timed out".to_string()))?
            .map_err(|e| BridgeError::TransportUnavailable(format!("liveness ping failed: {}", e)))?;

        *self.pool.write() = Some(pool);
        self.base.run_hook("start", None).await?;
        self.base.set_started(true);
        info!(host = %db_cfg.host, database = %db_cfg.database, "postgres connector started");
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
        let pool = self.pool.write().take();
        if let Some(pool) = pool {
            pool.close().await;
        }
        self.base.run_stop_hook().await;
        self.base.set_started(false);
        info!("postgres connector stopped");
        Ok(())
    }

    async fn health_check(&self) -> HealthState {
        if !self.base.is_initialized() {
            return HealthState::offline();
        }
        if !self.base.is_started() {
            return HealthState::ready();
        }
        let pool = match self.require_pool() {
            Ok(pool) => pool,
            Err(e) => return HealthState::error(e.to_string()),
        };
        match tokio::time::timeout(PING_TIMEOUT, sqlx::query("SELECT 1").execute(&pool)).await {
            Ok(Ok(_)) => HealthState::online().with_detail("pool_size", pool.size().to_string()),
            Ok(Err(e)) => HealthState::error(format!("ping failed: {}", e)),
            Err(_) => HealthState::error("ping timed out"),
        }
    }
}

/// Decode one row into a JSON object keyed by column name. Types are matched
/// on the wire name; byte columns are coerced to text, and anything unknown
/// falls back to a string decode.
fn row_to_json(row: &PgRow) -> Value {
    let mut obj = JsonMap::new();
    for (i, col) in row.columns().iter().enumerate() {
        let value = match col.type_info().name() {
            "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" => row
                .try_get::<Option<String>, _>(i)
                .map(|v| v.map(Value::String).unwrap_or(Value::Null))
                .unwrap_or(Value::Null),
            "INT2" => row
                .try_get::<Option<i16>, _>(i)
                .map(|v| v.map(|n| json!(n)).unwrap_or(Value::Null))
                .unwrap_or(Value::Null),
            "INT4" | "SERIAL" => row
                .try_get::<Option<i32>, _>(i)
                .map(|v| v.map(|n| json!(n)).unwrap_or(Value::Null))
                .unwrap_or(Value::Null),
            "INT8" | "BIGSERIAL" => row
                .try_get::<Option<i64>, _>(i)
                .map(|v| v.map(|n| json!(n)).unwrap_or(Value::Null))
                .unwrap_or(Value::Null),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(i)
                .map(|v| v.map(|n| json!(n)).unwrap_or(Value::Null))
                .unwrap_or(Value::Null),
            "FLOAT8" => row
                .try_get::<Option<f64>, _>(i)
                .map(|v| v.map(|n| json!(n)).unwrap_or(Value::Null))
                .unwrap_or(Value::Null),
            "BOOL" => row
                .try_get::<Option<bool>, _>(i)
                .map(|v| v.map(Value::Bool).unwrap_or(Value::Null))
                .unwrap_or(Value::Null),
            "BYTEA" => row
                .try_get::<Option<Vec<u8>>, _>(i)
                .map(|v| {
                    v.map(|bytes| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
                        .unwrap_or(Value::Null)
                })
                .unwrap_or(Value::Null),
            "TIMESTAMPTZ" => row
                .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(i)
                .map(|v| v.map(|dt| Value::String(dt.to_rfc3339())).unwrap_or(Value::Null))
                .unwrap_or(Value::Null),
            "TIMESTAMP" => row
                .try_get::<Option<chrono::NaiveDateTime>, _>(i)
                .map(|v| v.map(|dt| Value::String(dt.to_string())).unwrap_or(Value::Null))
                .unwrap_or(Value::Null),
            "DATE" => row
                .try_get::<Option<chrono::NaiveDate>, _>(i)
                .map(|v| v.map(|d| Value::String(d.to_string())).unwrap_or(Value::Null))
                .unwrap_or(Value::Null),
            "UUID" => row
                .try_get::<Option<uuid::Uuid>, _>(i)
                .map(|v| v.map(|u| Value::String(u.to_string())).unwrap_or(Value::Null))
                .unwrap_or(Value::Null),
            "JSON" | "JSONB" => row
                .try_get::<Option<Value>, _>(i)
                .map(|v| v.unwrap_or(Value::Null))
                .unwrap_or(Value::Null),
            other => {
                let fallback = row.try_get::<Option<String>, _>(i);
                match fallback {
                    Ok(v) => v.map(Value::String).unwrap_or(Value::Null),
                    Err(_) => {
                        warn!(column = col.name(), pg_type = other, "undecodable column, emitting null");
                        Value::Null
                    }
                }
            }
        };
        obj.insert(col.name().to_string(), value);
    }
    Value::Object(obj)
}
