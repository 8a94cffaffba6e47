// # Request Compilation
//
// Builds execute requests from a DataSource + DataInterface pair. Database
// interfaces compile to SQL text with incremental WHERE clauses and
// LIMIT/OFFSET pagination; API interfaces compile to a method/path/query/
// header/body bundle with `${...}` variable substitution, a pagination layer,
// and an incremental layer.

use std::time::Duration;

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use crate::error::{BridgeError, Result};
use crate::model::{
    operation, ComparisonType, DataInterface, DataSource, DataSourceCategory, ExecuteRequest,
    IncrementalParams, JsonMap, PageParams, PaginationConfig, ParamLocation,
};
use crate::model::config::{get_bool, get_i64, get_string};

/// `${name}` / `${name.path}` placeholder.
static VAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z0-9_][A-Za-z0-9_.]*)\}").unwrap());

/// `${{name}}` special binding.
static SPECIAL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{\{([A-Za-z0-9_]+)\}\}").unwrap());

const TEST_TIMEOUT: Duration = Duration::from_secs(30);
const SYNC_TIMEOUT: Duration = Duration::from_secs(300);

/// Pull strategy selected by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    Full,
    Incremental,
    Sync,
}

impl SyncStrategy {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(SyncStrategy::Full),
            "incremental" => Ok(SyncStrategy::Incremental),
            "sync" => Ok(SyncStrategy::Sync),
            other => Err(BridgeError::ConfigInvalid(format!("unknown sync strategy {:?}", other))),
        }
    }
}

/// Incremental time cursors are rendered in UTC+8 with a plain timestamp
/// layout, matching the convention of the downstream database columns.
pub fn format_shanghai_time(dt: &DateTime<Utc>) -> String {
    let offset = FixedOffset::east_opt(8 * 3600).expect("fixed +08:00 offset");
    dt.with_timezone(&offset).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Look up a dotted path inside a params map.
fn lookup_path<'a>(map: &'a JsonMap, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = map.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn resolve_special(name: &str, params: &JsonMap) -> Option<Value> {
    let now = Utc::now();
    match name {
        "current_time" | "now" => Some(Value::String(now.to_rfc3339())),
        "current_date" => Some(Value::String(now.format("%Y-%m-%d").to_string())),
        "current_timestamp" => Some(json!(now.timestamp())),
        // First-time sync carries no cursor; the binding resolves to null.
        "last_sync_value" => Some(params.get("last_sync_value").cloned().unwrap_or(Value::Null)),
        _ => None,
    }
}

/// Resolve `${name}` and `${{name}}` placeholders in a template string.
///
/// A template that is exactly one placeholder resolves to the typed value of
/// the binding; embedded placeholders interpolate as strings. Unknown names
/// are left as literal text.
pub fn resolve_template(input: &str, params: &JsonMap) -> Value {
    // Whole-string special: keep the bound value's type.
    if let Some(caps) = SPECIAL_PATTERN.captures(input) {
        if caps.get(0).map(|m| m.as_str()) == Some(input) {
            if let Some(v) = resolve_special(&caps[1], params) {
                return v;
            }
            return Value::String(input.to_string());
        }
    }
    // Whole-string variable: same.
    if let Some(caps) = VAR_PATTERN.captures(input) {
        if caps.get(0).map(|m| m.as_str()) == Some(input) {
            return match lookup_path(params, &caps[1]) {
                Some(v) => v.clone(),
                None => Value::String(input.to_string()),
            };
        }
    }

    // Interpolated form: substitute each placeholder as text.
    let pass1 = SPECIAL_PATTERN.replace_all(input, |caps: &regex::Captures| {
        match resolve_special(&caps[1], params) {
            Some(Value::String(s)) => s,
            Some(Value::Null) => String::new(),
            Some(v) => v.to_string(),
            None => caps[0].to_string(),
        }
    });
    let pass2 = VAR_PATTERN.replace_all(&pass1, |caps: &regex::Captures| {
        match lookup_path(params, &caps[1]) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => caps[0].to_string(),
            Some(v) => v.to_string(),
        }
    });
    Value::String(pass2.into_owned())
}

/// Translate the common Go reference-time layout tokens into strftime.
fn translate_time_layout(layout: &str) -> String {
    if !layout.contains("2006") {
        return layout.to_string();
    }
    layout
        .replace("2006", "%Y")
        .replace("01", "%m")
        .replace("02", "%d")
        .replace("15", "%H")
        .replace("04", "%M")
        .replace("05", "%S")
}

fn apply_time_format(value: Value, layout: &str) -> Value {
    let pattern = translate_time_layout(layout);
    let parsed: Option<DateTime<Utc>> = match &value {
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    };
    match parsed {
        Some(dt) => Value::String(dt.format(&pattern).to_string()),
        None => value,
    }
}

/// Resolve a parameter value. Plain strings go through template resolution;
/// a config object `{name, type, value, format}` resolves its `value` and
/// then applies the optional time layout.
pub fn resolve_value(value: &Value, params: &JsonMap) -> Value {
    match value {
        Value::String(s) => resolve_template(s, params),
        // Parameter config object: {name, type, value, format}. Requires a
        // discriminating key besides "value" so plain data objects pass
        // through untouched.
        Value::Object(obj)
            if obj.contains_key("value")
                && (obj.contains_key("name") || obj.contains_key("type") || obj.contains_key("format")) =>
        {
            let resolved = resolve_value(obj.get("value").unwrap_or(&Value::Null), params);
            match obj.get("format").and_then(|f| f.as_str()).filter(|f| !f.is_empty()) {
                Some(layout) => apply_time_format(resolved, layout),
                None => resolved,
            }
        }
        Value::Object(obj) => {
            let mut out = JsonMap::new();
            for (k, v) in obj {
                out.insert(k.clone(), resolve_value(v, params));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, params)).collect()),
        other => other.clone(),
    }
}

/// Render an incremental cursor value for SQL. RFC3339 time strings are
/// converted to UTC+8 and single-quoted; other strings are quoted with
/// escaping; numbers pass through.
fn sql_literal(value: &Value) -> String {
    match value {
        Value::String(s) => match DateTime::parse_from_rfc3339(s) {
            Ok(dt) => format!("'{}'", format_shanghai_time(&dt.with_timezone(&Utc))),
            Err(_) => format!("'{}'", s.replace('\'', "''")),
        },
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

/// Compiles execute requests for one DataSource + DataInterface pair.
pub struct QueryBuilder<'a> {
    data_source: &'a DataSource,
    interface: &'a DataInterface,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(data_source: &'a DataSource, interface: &'a DataInterface) -> Self {
        Self { data_source, interface }
    }

    fn table_name(&self) -> Result<String> {
        get_string(&self.interface.interface_config, "tableName")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BridgeError::ConfigInvalid("interfaceConfig.tableName is required".to_string()))
    }

    fn base_sql(&self) -> Result<String> {
        match get_string(&self.interface.interface_config, "query").filter(|s| !s.is_empty()) {
            Some(custom) => Ok(custom.trim_end_matches(';').trim().to_string()),
            None => Ok(format!("SELECT * FROM {}", self.table_name()?)),
        }
    }

    /// Pagination settings from the interface config.
    pub fn pagination_config(&self) -> PaginationConfig {
        let cfg = &self.interface.interface_config;
        let defaults = PaginationConfig::default();
        PaginationConfig {
            enabled: get_bool(cfg, "paginationEnabled").unwrap_or(false),
            page_param: get_string(cfg, "paginationPageParam").unwrap_or(defaults.page_param),
            size_param: get_string(cfg, "paginationSizeParam").unwrap_or(defaults.size_param),
            page_start: get_i64(cfg, "paginationStartValue").unwrap_or(defaults.page_start),
            page_size: get_i64(cfg, "paginationDefaultSize").unwrap_or(defaults.page_size),
            param_location: get_string(cfg, "paginationParamLocation")
                .map(|s| ParamLocation::parse(&s))
                .unwrap_or(defaults.param_location),
        }
    }

    /// Lightweight probe request used by connection tests.
    pub fn build_test_request(&self) -> Result<ExecuteRequest> {
        match self.data_source.category {
            DataSourceCategory::Database => {
                let sql = format!("{} LIMIT 5", self.base_sql()?);
                Ok(ExecuteRequest::new(operation::QUERY)
                    .with_query(sql)
                    .with_timeout(TEST_TIMEOUT))
            }
            DataSourceCategory::Api => {
                let mut req = self.build_api_request(&JsonMap::new())?;
                req.timeout = Some(TEST_TIMEOUT);
                Ok(req)
            }
            DataSourceCategory::Messaging => Ok(ExecuteRequest::new(operation::CONNECT_TEST)
                .with_timeout(TEST_TIMEOUT)),
        }
    }

    /// Strategy-driven sync request with runtime parameters bound into the
    /// variable scope.
    pub fn build_sync_request(&self, strategy: SyncStrategy, params: &JsonMap) -> Result<ExecuteRequest> {
        let mut req = match self.data_source.category {
            DataSourceCategory::Database => ExecuteRequest::new(operation::QUERY)
                .with_query(self.base_sql()?),
            DataSourceCategory::Api => self.build_api_request(params)?,
            DataSourceCategory::Messaging => {
                return Err(BridgeError::OperationUnsupported(format!(
                    "sync strategy {:?} does not apply to messaging sources",
                    strategy
                )))
            }
        };
        req.timeout = Some(SYNC_TIMEOUT);
        Ok(req)
    }

    /// Sync request with the pagination layer applied.
    pub fn build_paginated_request(
        &self,
        strategy: SyncStrategy,
        page: PageParams,
        params: &JsonMap,
    ) -> Result<ExecuteRequest> {
        let mut req = self.build_sync_request(strategy, params)?;
        let pagination = self.pagination_config();

        match self.data_source.category {
            DataSourceCategory::Database => {
                let offset = (page.page - 1).max(0) * page.page_size;
                let sql = req.query.take().unwrap_or_default();
                req.query = Some(format!("{} LIMIT {} OFFSET {}", sql, page.page_size, offset));
            }
            DataSourceCategory::Api => {
                if pagination.enabled {
                    self.insert_param(
                        &mut req,
                        pagination.param_location,
                        &pagination.page_param,
                        json!(page.page),
                    );
                    self.insert_param(
                        &mut req,
                        pagination.param_location,
                        &pagination.size_param,
                        json!(page.page_size),
                    );
                }
            }
            DataSourceCategory::Messaging => {}
        }
        Ok(req)
    }

    /// Sync request with the incremental layer applied. A missing cursor
    /// yields a request equivalent to a full pull.
    pub fn build_incremental_request(
        &self,
        strategy: SyncStrategy,
        inc: &IncrementalParams,
        params: &JsonMap,
    ) -> Result<ExecuteRequest> {
        // The cursor joins the variable scope so `${{last_sync_value}}`
        // resolves inside parameter templates.
        let mut scope = params.clone();
        if let Some(v) = &inc.last_sync_value {
            scope.insert("last_sync_value".to_string(), v.clone());
        }
        let mut req = self.build_sync_request(strategy, &scope)?;

        match self.data_source.category {
            DataSourceCategory::Database => {
                let mut sql = req.query.take().unwrap_or_default();
                if let Some(last) = &inc.last_sync_value {
                    let connector = if sql.to_lowercase().contains(" where ") { "AND" } else { "WHERE" };
                    sql = format!(
                        "{} {} {} {} {}",
                        sql,
                        connector,
                        inc.incremental_key,
                        inc.comparison.sql_op(),
                        sql_literal(last)
                    );
                }
                if !sql.to_lowercase().contains("order by") {
                    sql = format!("{} ORDER BY {} ASC", sql, inc.incremental_key);
                }
                if let Some(batch) = inc.batch_size {
                    sql = format!("{} LIMIT {}", sql, batch);
                }
                req.query = Some(sql);
            }
            DataSourceCategory::Api => {
                if let Some(last) = &inc.last_sync_value {
                    let rendered = match last {
                        Value::String(s) => match DateTime::parse_from_rfc3339(s) {
                            Ok(dt) => Value::String(format_shanghai_time(&dt.with_timezone(&Utc))),
                            Err(_) => last.clone(),
                        },
                        other => other.clone(),
                    };
                    for key in ["last_sync_value", "since", "updated_after"] {
                        self.insert_param(&mut req, ParamLocation::Query, key, rendered.clone());
                    }
                }
                self.insert_param(&mut req, ParamLocation::Query, "incremental_key", json!(inc.incremental_key));
                self.insert_param(&mut req, ParamLocation::Query, "sort", json!(inc.incremental_key));
                self.insert_param(&mut req, ParamLocation::Query, "order", json!("asc"));
                if let Some(batch) = inc.batch_size {
                    self.insert_param(&mut req, ParamLocation::Query, "limit", json!(batch));
                    self.insert_param(&mut req, ParamLocation::Query, "page_size", json!(batch));
                }
            }
            DataSourceCategory::Messaging => {}
        }
        Ok(req)
    }

    /// Assemble the API-category request bundle: method, path (with `{name}`
    /// placeholders substituted), query map, header map, and body.
    fn build_api_request(&self, params: &JsonMap) -> Result<ExecuteRequest> {
        let cfg = &self.interface.interface_config;
        let pattern = get_string(cfg, "urlPattern").unwrap_or_else(|| "suffix".to_string());
        let method = get_string(cfg, "method").unwrap_or_else(|| "GET".to_string());

        let mut path = get_string(cfg, "urlSuffix").unwrap_or_default();
        let mut query = JsonMap::new();
        let mut headers = JsonMap::new();

        // Path placeholders.
        if pattern == "path" || pattern == "combined" {
            if let Some(Value::Object(path_params)) = cfg.get("pathParams") {
                for (name, template) in path_params {
                    let resolved = resolve_value(template, params);
                    let text = match &resolved {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    path = path.replace(&format!("{{{}}}", name), &text);
                }
            }
        }

        // Configured query parameters plus runtime params.
        if pattern == "query" || pattern == "combined" {
            if let Some(Value::Object(query_params)) = cfg.get("queryParams") {
                for (name, template) in query_params {
                    query.insert(name.clone(), resolve_value(template, params));
                }
            }
            for (name, value) in params {
                if name != "last_sync_value" && !query.contains_key(name) {
                    query.insert(name.clone(), value.clone());
                }
            }
        }

        if let Some(Value::Object(header_map)) = cfg.get("headers") {
            for (name, template) in header_map {
                headers.insert(name.clone(), resolve_value(template, params));
            }
        }

        let body = cfg.get("body").map(|b| resolve_value(b, params));

        let mut req = ExecuteRequest::new(operation::API_CALL)
            .with_param("method", Value::String(method))
            .with_param("path", Value::String(path))
            .with_param("query", Value::Object(query))
            .with_param("headers", Value::Object(headers));
        if let Some(body) = body {
            req.data = Some(body);
        }
        if get_bool(cfg, "useFormData").unwrap_or(false) {
            req.params.insert("use_form_data".to_string(), Value::Bool(true));
        }

        // Response-parser settings ride along so the executing connector can
        // normalize the reply without a second catalog lookup.
        let parser_cfg: JsonMap = crate::query::parser::PARSER_KEYS
            .iter()
            .filter_map(|key| cfg.get(*key).map(|v| (key.to_string(), v.clone())))
            .collect();
        if !parser_cfg.is_empty() {
            req.params.insert("response_parser".to_string(), Value::Object(parser_cfg));
        }
        Ok(req)
    }

    fn insert_param(&self, req: &mut ExecuteRequest, location: ParamLocation, key: &str, value: Value) {
        let slot = match location {
            ParamLocation::Query => "query",
            ParamLocation::Body => "body_params",
            ParamLocation::Header => "headers",
        };
        let entry = req
            .params
            .entry(slot.to_string())
            .or_insert_with(|| Value::Object(JsonMap::new()));
        if let Value::Object(map) = entry {
            map.insert(key.to_string(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::source_type;
    use serde_json::json;

    fn db_source() -> DataSource {
        DataSource::new("ds-db", source_type::DB_POSTGRESQL, DataSourceCategory::Database)
    }

    fn api_source() -> DataSource {
        DataSource::new("ds-api", source_type::API_HTTP, DataSourceCategory::Api)
            .with_connection("baseUrl", json!("https://api.example.com"))
    }

    #[test]
    fn test_substitution_is_pure() {
        let mut params = JsonMap::new();
        params.insert("x".to_string(), json!(1));

        assert_eq!(resolve_template("${x}", &params), json!(1));
        assert_eq!(resolve_template("${unknown}", &JsonMap::new()), json!("${unknown}"));

        let now = resolve_template("${{now}}", &JsonMap::new());
        let text = now.as_str().expect("now resolves to a time string");
        assert!(DateTime::parse_from_rfc3339(text).is_ok());
    }

    #[test]
    fn test_substitution_interpolates_embedded() {
        let mut params = JsonMap::new();
        params.insert("region".to_string(), json!("eu"));
        assert_eq!(
            resolve_template("prefix-${region}-suffix", &params),
            json!("prefix-eu-suffix")
        );
    }

    #[test]
    fn test_last_sync_value_special_defaults_null() {
        assert_eq!(resolve_template("${{last_sync_value}}", &JsonMap::new()), Value::Null);
    }

    #[test]
    fn test_param_config_object_with_format() {
        let value = json!({"name": "day", "type": "time", "value": "2025-01-15T10:30:00Z", "format": "%Y-%m-%d"});
        assert_eq!(resolve_value(&value, &JsonMap::new()), json!("2025-01-15"));
    }

    #[test]
    fn test_go_layout_translation() {
        let value = json!({"value": "2025-01-15T10:30:00Z", "format": "2006-01-02 15:04:05"});
        assert_eq!(resolve_value(&value, &JsonMap::new()), json!("2025-01-15 10:30:00"));
    }

    #[test]
    fn test_db_incremental_pull_scenario() {
        let ds = db_source();
        let iface = DataInterface::new("if-orders").with_config("tableName", json!("orders"));
        let builder = QueryBuilder::new(&ds, &iface);

        let inc = IncrementalParams::new("updated_at")
            .with_last_sync(json!("2025-01-01T00:00:00Z"))
            .with_comparison(ComparisonType::Gt)
            .with_batch_size(50);
        let req = builder
            .build_incremental_request(SyncStrategy::Incremental, &inc, &JsonMap::new())
            .unwrap();

        assert_eq!(
            req.query.as_deref(),
            Some("SELECT * FROM orders WHERE updated_at > '2025-01-01 08:00:00' ORDER BY updated_at ASC LIMIT 50")
        );
    }

    #[test]
    fn test_incremental_first_sync_omits_where() {
        let ds = db_source();
        let iface = DataInterface::new("if-orders").with_config("tableName", json!("orders"));
        let builder = QueryBuilder::new(&ds, &iface);

        let inc = IncrementalParams::new("updated_at");
        let req = builder
            .build_incremental_request(SyncStrategy::Incremental, &inc, &JsonMap::new())
            .unwrap();

        let sql = req.query.unwrap();
        assert!(!sql.contains("WHERE"));
        assert!(sql.contains("ORDER BY updated_at ASC"));
    }

    #[test]
    fn test_incremental_custom_query_uses_and() {
        let ds = db_source();
        let iface = DataInterface::new("if-active")
            .with_config("query", json!("SELECT * FROM orders WHERE status = 'active'"));
        let builder = QueryBuilder::new(&ds, &iface);

        let inc = IncrementalParams::new("updated_at").with_last_sync(json!(42));
        let req = builder
            .build_incremental_request(SyncStrategy::Incremental, &inc, &JsonMap::new())
            .unwrap();

        let sql = req.query.unwrap();
        assert!(sql.contains("AND updated_at > 42"));
        assert_eq!(sql.matches("WHERE").count(), 1);
    }

    #[test]
    fn test_db_pagination_layer() {
        let ds = db_source();
        let iface = DataInterface::new("if-orders").with_config("tableName", json!("orders"));
        let builder = QueryBuilder::new(&ds, &iface);

        let req = builder
            .build_paginated_request(
                SyncStrategy::Full,
                PageParams { page: 3, page_size: 25 },
                &JsonMap::new(),
            )
            .unwrap();
        assert_eq!(req.query.as_deref(), Some("SELECT * FROM orders LIMIT 25 OFFSET 50"));
    }

    #[test]
    fn test_api_pagination_scenario() {
        let ds = api_source();
        let iface = DataInterface::new("if-items")
            .with_config("urlSuffix", json!("/items"))
            .with_config("method", json!("GET"))
            .with_config("paginationEnabled", json!(true))
            .with_config("paginationPageParam", json!("page"))
            .with_config("paginationSizeParam", json!("size"))
            .with_config("paginationStartValue", json!(1))
            .with_config("paginationDefaultSize", json!(20));
        let builder = QueryBuilder::new(&ds, &iface);

        let req = builder
            .build_paginated_request(
                SyncStrategy::Full,
                PageParams { page: 1, page_size: 20 },
                &JsonMap::new(),
            )
            .unwrap();
        let query = req.params.get("query").unwrap().as_object().unwrap();
        assert_eq!(query.get("page"), Some(&json!(1)));
        assert_eq!(query.get("size"), Some(&json!(20)));
    }

    #[test]
    fn test_api_pagination_disabled_adds_nothing() {
        let ds = api_source();
        let iface = DataInterface::new("if-items").with_config("urlSuffix", json!("/items"));
        let builder = QueryBuilder::new(&ds, &iface);

        let req = builder
            .build_paginated_request(
                SyncStrategy::Sync,
                PageParams { page: 1, page_size: 20 },
                &JsonMap::new(),
            )
            .unwrap();
        let query = req.params.get("query").unwrap().as_object().unwrap();
        assert!(!query.contains_key("page"));
        assert!(!query.contains_key("size"));
    }

    #[test]
    fn test_api_path_pattern_substitution() {
        let ds = api_source();
        let iface = DataInterface::new("if-detail")
            .with_config("urlPattern", json!("path"))
            .with_config("urlSuffix", json!("/items/{id}/history"))
            .with_config("pathParams", json!({"id": "${item_id}"}));
        let builder = QueryBuilder::new(&ds, &iface);

        let mut params = JsonMap::new();
        params.insert("item_id".to_string(), json!(982));
        let req = builder.build_sync_request(SyncStrategy::Full, &params).unwrap();
        assert_eq!(req.param_str("path"), Some("/items/982/history"));
    }

    #[test]
    fn test_api_incremental_layer_params() {
        let ds = api_source();
        let iface = DataInterface::new("if-items").with_config("urlSuffix", json!("/items"));
        let builder = QueryBuilder::new(&ds, &iface);

        let inc = IncrementalParams::new("updated_at")
            .with_last_sync(json!("2025-01-01T00:00:00Z"))
            .with_batch_size(100);
        let req = builder
            .build_incremental_request(SyncStrategy::Incremental, &inc, &JsonMap::new())
            .unwrap();

        let query = req.params.get("query").unwrap().as_object().unwrap();
        assert_eq!(query.get("since"), Some(&json!("2025-01-01 08:00:00")));
        assert_eq!(query.get("sort"), Some(&json!("updated_at")));
        assert_eq!(query.get("order"), Some(&json!("asc")));
        assert_eq!(query.get("limit"), Some(&json!(100)));
    }

    #[test]
    fn test_test_request_db() {
        let ds = db_source();
        let iface = DataInterface::new("if-orders").with_config("tableName", json!("orders"));
        let req = QueryBuilder::new(&ds, &iface).build_test_request().unwrap();
        assert_eq!(req.query.as_deref(), Some("SELECT * FROM orders LIMIT 5"));
        assert_eq!(req.timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_shanghai_conversion() {
        let dt = DateTime::parse_from_rfc3339("2025-06-30T16:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_shanghai_time(&dt), "2025-07-01 00:30:00");
    }
}
