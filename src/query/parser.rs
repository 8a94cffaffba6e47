// # Response Normalization
//
// Reads an interface's response-parser config and folds heterogeneous
// success/error/pagination conventions into the uniform `ParsedResponse`
// shape. Success can be judged by status code, by a field value at a dotted
// path, or by both.

use serde_json::Value;

use crate::error::{BridgeError, Result};
use crate::model::config::get_string;
use crate::model::{JsonMap, ParsedResponse};

const DEFAULT_STATUS_SUCCESS: &str = "200-299";
const DEFAULT_ERROR_MESSAGE: &str = "request failed";

/// Interface-config keys that configure the response parser.
pub const PARSER_KEYS: &[&str] = &[
    "responseType",
    "successCondition",
    "statusCodeSuccess",
    "successField",
    "successValue",
    "errorField",
    "errorMessageField",
    "dataPath",
    "totalField",
    "pageField",
    "pageSizeField",
];

/// How success is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SuccessCondition {
    #[default]
    StatusCode,
    FieldValue,
    Both,
    Custom,
}

impl SuccessCondition {
    fn parse(s: &str) -> Self {
        match s {
            "field_value" => SuccessCondition::FieldValue,
            "both" => SuccessCondition::Both,
            "custom" => SuccessCondition::Custom,
            _ => SuccessCondition::StatusCode,
        }
    }
}

/// Response body shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    #[default]
    Json,
    Text,
    Html,
}

impl ResponseType {
    fn parse(s: &str) -> Self {
        match s {
            "text" => ResponseType::Text,
            "html" => ResponseType::Html,
            _ => ResponseType::Json,
        }
    }
}

/// Parser settings extracted from an interface config.
#[derive(Debug, Clone)]
pub struct ResponseParserConfig {
    pub response_type: ResponseType,
    pub success_condition: SuccessCondition,
    pub status_code_success: String,
    pub success_field: String,
    pub success_value: String,
    pub error_field: String,
    pub error_message_field: String,
    pub data_path: String,
    pub total_field: String,
    pub page_field: String,
    pub page_size_field: String,
}

impl Default for ResponseParserConfig {
    fn default() -> Self {
        Self {
            response_type: ResponseType::Json,
            success_condition: SuccessCondition::StatusCode,
            status_code_success: DEFAULT_STATUS_SUCCESS.to_string(),
            success_field: String::new(),
            success_value: String::new(),
            error_field: String::new(),
            error_message_field: String::new(),
            data_path: String::new(),
            total_field: String::new(),
            page_field: String::new(),
            page_size_field: String::new(),
        }
    }
}

impl ResponseParserConfig {
    /// Read parser settings from an interface config map. Returns `None` when
    /// the interface configures no parser at all, in which case callers fall
    /// back to plain 2xx + JSON handling.
    pub fn from_interface(config: &JsonMap) -> Option<Self> {
        if !PARSER_KEYS.iter().any(|k| config.contains_key(*k)) {
            return None;
        }
        let defaults = Self::default();
        Some(Self {
            response_type: get_string(config, "responseType")
                .map(|s| ResponseType::parse(&s))
                .unwrap_or(defaults.response_type),
            success_condition: get_string(config, "successCondition")
                .map(|s| SuccessCondition::parse(&s))
                .unwrap_or(defaults.success_condition),
            status_code_success: get_string(config, "statusCodeSuccess")
                .unwrap_or(defaults.status_code_success),
            success_field: get_string(config, "successField").unwrap_or_default(),
            success_value: get_string(config, "successValue").unwrap_or_default(),
            error_field: get_string(config, "errorField").unwrap_or_default(),
            error_message_field: get_string(config, "errorMessageField").unwrap_or_default(),
            data_path: get_string(config, "dataPath").unwrap_or_default(),
            total_field: get_string(config, "totalField").unwrap_or_default(),
            page_field: get_string(config, "pageField").unwrap_or_default(),
            page_size_field: get_string(config, "pageSizeField").unwrap_or_default(),
        })
    }

    /// Normalize a raw transport response.
    pub fn parse(&self, status_code: u16, body: &str) -> Result<ParsedResponse> {
        let mut parsed = ParsedResponse::default();
        parsed
            .metadata
            .insert("status_code".to_string(), Value::from(status_code));

        let status_ok = status_matches(&self.status_code_success, status_code)?;

        let json_body: Value = match self.response_type {
            ResponseType::Json => serde_json::from_str(body)
                .map_err(|e| BridgeError::Parse(format!("response body is not valid JSON: {}", e)))?,
            ResponseType::Text | ResponseType::Html => {
                parsed.success = status_ok;
                parsed.data = Value::String(body.to_string());
                if !parsed.success {
                    parsed.error_message = DEFAULT_ERROR_MESSAGE.to_string();
                }
                return Ok(parsed);
            }
        };

        let field_ok = if self.success_field.is_empty() {
            None
        } else {
            let actual = navigate(&json_body, &self.success_field);
            Some(value_matches(&actual, &self.success_value))
        };

        parsed.success = match self.success_condition {
            SuccessCondition::StatusCode => status_ok,
            SuccessCondition::FieldValue => field_ok.unwrap_or(false),
            // Intersection: a success status with a failing field value is a
            // failure.
            SuccessCondition::Both => status_ok && field_ok.unwrap_or(false),
            SuccessCondition::Custom => field_ok.unwrap_or(status_ok),
        };

        if parsed.success {
            parsed.data = if self.data_path.is_empty() {
                json_body.clone()
            } else {
                navigate(&json_body, &self.data_path)
            };
            self.extract_pagination(&json_body, &mut parsed);
        } else {
            parsed.error_code = render_scalar(&navigate(&json_body, &self.error_field));
            let message = render_scalar(&navigate(&json_body, &self.error_message_field));
            parsed.error_message = if message.is_empty() {
                DEFAULT_ERROR_MESSAGE.to_string()
            } else {
                message
            };
        }
        Ok(parsed)
    }

    fn extract_pagination(&self, body: &Value, parsed: &mut ParsedResponse) {
        if !self.total_field.is_empty() {
            parsed.total = navigate(body, &self.total_field).as_i64();
        }
        if !self.page_field.is_empty() {
            parsed.page = navigate(body, &self.page_field).as_i64();
        }
        if !self.page_size_field.is_empty() {
            parsed.page_size = navigate(body, &self.page_size_field).as_i64();
        }
        if let (Some(total), Some(page), Some(size)) = (parsed.total, parsed.page, parsed.page_size) {
            if size > 0 {
                let pages = (total + size - 1) / size;
                parsed.has_next = page < pages;
            }
        }
    }
}

/// Check a status code against a spec string: a single code (`"200"`), a
/// comma list (`"200,201"`), or a range (`"200-299"`). Lists may mix forms.
pub fn status_matches(spec: &str, status: u16) -> Result<bool> {
    let spec = if spec.trim().is_empty() { DEFAULT_STATUS_SUCCESS } else { spec };
    for part in spec.split(',') {
        let part = part.trim();
        if let Some((start, end)) = part.split_once('-') {
            let start: u16 = start.trim().parse().map_err(|_| bad_spec(spec))?;
            let end: u16 = end.trim().parse().map_err(|_| bad_spec(spec))?;
            if (start..=end).contains(&status) {
                return Ok(true);
            }
        } else {
            let code: u16 = part.parse().map_err(|_| bad_spec(spec))?;
            if code == status {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn bad_spec(spec: &str) -> BridgeError {
    BridgeError::ConfigInvalid(format!("statusCodeSuccess: unparseable spec {:?}", spec))
}

/// Navigate a dotted path through a JSON value. At array nodes the remaining
/// path is collected from each element.
pub fn navigate(value: &Value, path: &str) -> Value {
    if path.is_empty() {
        return Value::Null;
    }
    let mut current = value.clone();
    let parts: Vec<&str> = path.split('.').collect();
    for (i, part) in parts.iter().enumerate() {
        match current {
            Value::Object(ref obj) => {
                current = obj.get(*part).cloned().unwrap_or(Value::Null);
            }
            Value::Array(ref items) => {
                let rest = parts[i..].join(".");
                return Value::Array(items.iter().map(|item| navigate(item, &rest)).collect());
            }
            _ => return Value::Null,
        }
    }
    current
}

/// Compare a field value against a comma-separated accept list using
/// stringified equality.
fn value_matches(actual: &Value, expected: &str) -> bool {
    let actual = render_scalar(actual);
    expected.split(',').any(|candidate| candidate.trim() == actual)
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parser(config: Value) -> ResponseParserConfig {
        ResponseParserConfig::from_interface(config.as_object().unwrap()).unwrap()
    }

    #[test]
    fn test_status_spec_forms() {
        for spec in ["200", "200,201", "200-299"] {
            assert!(status_matches(spec, 200).unwrap(), "spec {}", spec);
        }
        assert!(!status_matches("200", 201).unwrap());
        assert!(!status_matches("200,201", 300).unwrap());
        assert!(status_matches("200-299,304", 304).unwrap());
        assert!(!status_matches("200-299", 300).unwrap());
        assert!(status_matches("", 204).unwrap());
        assert!(status_matches("300-399", 300).unwrap());
    }

    #[test]
    fn test_field_value_success() {
        let p = parser(json!({
            "successCondition": "field_value",
            "successField": "code",
            "successValue": "0,ok"
        }));
        assert!(p.parse(500, r#"{"code": 0}"#).unwrap().success);
        assert!(p.parse(200, r#"{"code": "ok"}"#).unwrap().success);
        assert!(!p.parse(200, r#"{"code": 1}"#).unwrap().success);
    }

    #[test]
    fn test_both_condition_is_intersection() {
        let p = parser(json!({
            "successCondition": "both",
            "statusCodeSuccess": "200-299",
            "successField": "status",
            "successValue": "success"
        }));
        assert!(p.parse(200, r#"{"status": "success"}"#).unwrap().success);
        assert!(!p.parse(200, r#"{"status": "partial"}"#).unwrap().success);
        assert!(!p.parse(500, r#"{"status": "success"}"#).unwrap().success);
    }

    #[test]
    fn test_data_path_navigation_with_arrays() {
        let p = parser(json!({"dataPath": "result.items"}));
        let parsed = p
            .parse(200, r#"{"result": {"items": [{"id": 1}, {"id": 2}]}}"#)
            .unwrap();
        assert_eq!(parsed.data, json!([{"id": 1}, {"id": 2}]));

        let names = navigate(&json!({"rows": [{"name": "a"}, {"name": "b"}]}), "rows.name");
        assert_eq!(names, json!(["a", "b"]));
    }

    #[test]
    fn test_pagination_extraction_and_has_next() {
        let p = parser(json!({
            "dataPath": "data",
            "totalField": "total",
            "pageField": "page",
            "pageSizeField": "size"
        }));
        let parsed = p
            .parse(200, r#"{"data": [], "total": 45, "page": 1, "size": 20}"#)
            .unwrap();
        assert_eq!(parsed.total, Some(45));
        assert!(parsed.has_next);

        let last = p
            .parse(200, r#"{"data": [], "total": 45, "page": 3, "size": 20}"#)
            .unwrap();
        assert!(!last.has_next);
    }

    #[test]
    fn test_error_extraction_with_default_message() {
        let p = parser(json!({
            "successCondition": "field_value",
            "successField": "code",
            "successValue": "0",
            "errorField": "code",
            "errorMessageField": "msg"
        }));
        let parsed = p.parse(200, r#"{"code": 17, "msg": "bad token"}"#).unwrap();
        assert!(!parsed.success);
        assert_eq!(parsed.error_code, "17");
        assert_eq!(parsed.error_message, "bad token");

        let silent = p.parse(200, r#"{"code": 17}"#).unwrap();
        assert_eq!(silent.error_message, "request failed");
    }

    #[test]
    fn test_text_response_uses_status_only() {
        let p = parser(json!({"responseType": "text"}));
        let parsed = p.parse(200, "pong").unwrap();
        assert!(parsed.success);
        assert_eq!(parsed.data, json!("pong"));
        assert!(!p.parse(503, "down").unwrap().success);
    }

    #[test]
    fn test_invalid_json_is_parse_error() {
        let p = parser(json!({"dataPath": "data"}));
        let err = p.parse(200, "<html>").unwrap_err();
        assert_eq!(err.kind(), "parse");
    }

    #[test]
    fn test_no_parser_configured() {
        assert!(ResponseParserConfig::from_interface(&JsonMap::new()).is_none());
    }
}
