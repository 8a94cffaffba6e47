// # Core Data Model
//
// Entities shared across the runtime: data-source and interface descriptions,
// the uniform execute request/response pair, the normalized parsed response,
// and the pagination/incremental parameter types consumed by the query builder.

pub mod config;

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BridgeError;

/// Free-form JSON object used for configs, records, and metadata.
pub type JsonMap = serde_json::Map<String, Value>;

/// Well-known data source type tags. The factory registry is keyed by string
/// so hosts can register additional kinds.
pub mod source_type {
    pub const DB_POSTGRESQL: &str = "db_postgresql";
    pub const API_HTTP: &str = "api_http";
    pub const API_HTTP_WITH_AUTH: &str = "api_http_with_auth";
    pub const MESSAGING_HTTP_POST: &str = "messaging_http_post";
    pub const MESSAGING_MQTT: &str = "messaging_mqtt";
}

/// Operation verbs accepted by `Connector::execute`.
pub mod operation {
    pub const QUERY: &str = "query";
    pub const SELECT: &str = "select";
    pub const INSERT: &str = "insert";
    pub const UPDATE: &str = "update";
    pub const DELETE: &str = "delete";
    pub const API_CALL: &str = "api_call";
    pub const PUBLISH: &str = "publish";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const READ: &str = "read";
    pub const STATUS: &str = "status";
    pub const CONNECT_TEST: &str = "connect_test";
    pub const BATCH: &str = "batch";
}

/// Data source category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSourceCategory {
    Database,
    Api,
    Messaging,
}

/// Persistent description of one external producer. Immutable to the runtime
/// after `Init`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSource {
    /// Stable identifier
    pub id: String,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    /// Type tag, resolved through the connector factory
    pub source_type: String,
    /// Category deciding the query-builder strategy
    pub category: DataSourceCategory,
    /// Credentials, URLs, broker addresses
    #[serde(default)]
    pub connection_config: JsonMap,
    /// Timeouts, pool sizes, channel lists
    #[serde(default)]
    pub params_config: JsonMap,
    /// Optional lifecycle hook script
    #[serde(default)]
    pub script: Option<String>,
    /// Whether the hook script runs
    #[serde(default)]
    pub script_enabled: bool,
}

impl DataSource {
    pub fn new(id: impl Into<String>, source_type: impl Into<String>, category: DataSourceCategory) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            source_type: source_type.into(),
            category,
            connection_config: JsonMap::new(),
            params_config: JsonMap::new(),
            script: None,
            script_enabled: false,
        }
    }

    pub fn with_connection(mut self, key: impl Into<String>, value: Value) -> Self {
        self.connection_config.insert(key.into(), value);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params_config.insert(key.into(), value);
        self
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self.script_enabled = true;
        self
    }
}

/// One entry of a field-mapping: rename `source` keys to `target` keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source: String,
    pub target: String,
}

/// Record-shaping config attached to an interface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParseConfig {
    #[serde(default)]
    pub field_mapping: Vec<FieldMapping>,
}

/// Logical schema attached to a DataSource: how records are extracted and
/// where they are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataInterface {
    pub id: String,
    /// Owning data source
    #[serde(default)]
    pub data_source_id: String,
    /// URL pattern, method, pagination, response-parser config, or table name
    #[serde(default)]
    pub interface_config: JsonMap,
    #[serde(default)]
    pub parse_config: ParseConfig,
}

impl DataInterface {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data_source_id: String::new(),
            interface_config: JsonMap::new(),
            parse_config: ParseConfig::default(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.interface_config.insert(key.into(), value);
        self
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.interface_config.get(key).and_then(|v| v.as_str())
    }
}

/// Target description handed to the fan-out processor by the interface loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub id: String,
    #[serde(default)]
    pub schema_name: String,
    #[serde(default)]
    pub table_name: String,
    #[serde(default)]
    pub parse_config: ParseConfig,
}

/// Uniform request dispatched through `Connector::execute`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Operation verb, see [`operation`]
    pub operation: String,
    /// SQL text or request path, operation dependent
    #[serde(default)]
    pub query: Option<String>,
    /// Request payload
    #[serde(default)]
    pub data: Option<Value>,
    /// Runtime parameters (method override, topic, page, ...)
    #[serde(default)]
    pub params: JsonMap,
    /// Per-request deadline; category defaults apply when unset
    #[serde(default, skip_serializing_if = "Option::is_none", with = "optional_duration_secs")]
    pub timeout: Option<Duration>,
}

impl ExecuteRequest {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    pub fn param_i64(&self, key: &str) -> Option<i64> {
        match self.params.get(key) {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }
}

mod optional_duration_secs {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> std::result::Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<Duration>, D::Error> {
        let secs: Option<u64> = Option::deserialize(d)?;
        Ok(secs.map(Duration::from_secs))
    }
}

/// Uniform response returned from `Connector::execute`. Errors are carried in
/// band (`success = false`) rather than panicking through the call stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub row_count: i64,
    /// Human-readable outcome
    #[serde(default)]
    pub message: String,
    /// Machine-readable error text, empty on success
    #[serde(default)]
    pub error: String,
    /// Diagnostic context: status_code, method, url, attempt counts
    #[serde(default)]
    pub metadata: JsonMap,
    /// Wall-clock duration of the dispatch in milliseconds
    #[serde(default)]
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl ExecuteResponse {
    pub fn ok(data: Option<Value>) -> Self {
        Self {
            success: true,
            data,
            row_count: 0,
            message: "ok".to_string(),
            error: String::new(),
            metadata: JsonMap::new(),
            duration_ms: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            row_count: 0,
            message: message.into(),
            error: error.into(),
            metadata: JsonMap::new(),
            duration_ms: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn from_error(err: &BridgeError) -> Self {
        let mut resp = Self::failure(err.to_string(), err.kind());
        resp.metadata.insert("error_kind".to_string(), Value::String(err.kind().to_string()));
        resp
    }

    pub fn with_row_count(mut self, count: i64) -> Self {
        self.row_count = count;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }
}

/// Normalized response shape produced by the response parser.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub error_code: String,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub total: Option<i64>,
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub page_size: Option<i64>,
    #[serde(default)]
    pub has_next: bool,
    #[serde(default)]
    pub metadata: JsonMap,
}

/// Where pagination parameters are placed in the outgoing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamLocation {
    #[default]
    Query,
    Body,
    Header,
}

impl ParamLocation {
    pub fn parse(s: &str) -> Self {
        match s {
            "body" => ParamLocation::Body,
            "header" => ParamLocation::Header,
            _ => ParamLocation::Query,
        }
    }
}

/// Pagination settings pulled from an interface config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginationConfig {
    pub enabled: bool,
    pub page_param: String,
    pub size_param: String,
    pub page_start: i64,
    pub page_size: i64,
    pub param_location: ParamLocation,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            page_param: "page".to_string(),
            size_param: "size".to_string(),
            page_start: 1,
            page_size: 20,
            param_location: ParamLocation::Query,
        }
    }
}

/// Comparison operator for incremental cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonType {
    Gt,
    Gte,
    Eq,
}

impl ComparisonType {
    pub fn sql_op(&self) -> &'static str {
        match self {
            ComparisonType::Gt => ">",
            ComparisonType::Gte => ">=",
            ComparisonType::Eq => "=",
        }
    }
}

/// Incremental pull cursor: bound a sync to records newer than the last one
/// seen. A `None` cursor means first-time sync and degrades to a full pull.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalParams {
    pub last_sync_value: Option<Value>,
    pub incremental_key: String,
    pub comparison: ComparisonType,
    #[serde(default)]
    pub batch_size: Option<i64>,
}

impl IncrementalParams {
    pub fn new(incremental_key: impl Into<String>) -> Self {
        Self {
            last_sync_value: None,
            incremental_key: incremental_key.into(),
            comparison: ComparisonType::Gt,
            batch_size: None,
        }
    }

    pub fn with_last_sync(mut self, value: Value) -> Self {
        self.last_sync_value = Some(value);
        self
    }

    pub fn with_comparison(mut self, comparison: ComparisonType) -> Self {
        self.comparison = comparison;
        self
    }

    pub fn with_batch_size(mut self, size: i64) -> Self {
        self.batch_size = Some(size);
        self
    }
}

/// Page request composed onto a sync request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PageParams {
    pub page: i64,
    pub page_size: i64,
}

/// Health state of a connector as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Online,
    Offline,
    Error,
    Ready,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Online => write!(f, "online"),
            HealthStatus::Offline => write!(f, "offline"),
            HealthStatus::Error => write!(f, "error"),
            HealthStatus::Ready => write!(f, "ready"),
        }
    }
}

/// Result of a liveness probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthState {
    pub status: HealthStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub details: HashMap<String, String>,
}

impl HealthState {
    pub fn online() -> Self {
        Self {
            status: HealthStatus::Online,
            message: None,
            details: HashMap::new(),
        }
    }

    pub fn offline() -> Self {
        Self {
            status: HealthStatus::Offline,
            message: None,
            details: HashMap::new(),
        }
    }

    pub fn ready() -> Self {
        Self {
            status: HealthStatus::Ready,
            message: None,
            details: HashMap::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Error,
            message: Some(message.into()),
            details: HashMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}
