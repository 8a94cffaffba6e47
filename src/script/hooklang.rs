// # Declarative Hook Language
//
// The built-in script engine. A script is a JSON object mapping lifecycle
// operations to action lists:
//
// ```json
// {
//   "start":   [{"http_post": {"url": "${credentials.tokenEndpoint}", "body": {"user": "${credentials.username}"}, "into": "login"}},
//               {"set": {"sessionId": "${login.data.session_id}"}}],
//   "refresh": [{"set": {"sessionId": "${uuid}"}}],
//   "stop":    [{"clear": ["sessionId"]}]
// }
// ```
//
// Actions: `set` merges templated values into the result, `http_get` /
// `http_post` round-trip through the injected transport helper and bind the
// response into scope, `clear` removes session keys, `fail` aborts. Template
// resolution uses the shared `${...}` resolver with scopes `credentials.*`,
// `session.*`, `request.*`, `data_source.*` plus `uuid` and the time specials.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{BridgeError, Result};
use crate::model::JsonMap;
use crate::query::resolve_value;
use crate::script::{CompiledScript, ScriptContext, ScriptEngine};

/// One parsed hook action.
#[derive(Debug, Clone)]
enum Action {
    Set(JsonMap),
    HttpGet {
        url: String,
        headers: JsonMap,
        into: Option<String>,
    },
    HttpPost {
        url: String,
        body: Value,
        headers: JsonMap,
        form: bool,
        into: Option<String>,
    },
    Clear(Vec<String>),
    Fail(String),
}

impl Action {
    fn parse(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| BridgeError::ScriptFailure("action must be an object".to_string()))?;
        if obj.len() != 1 {
            return Err(BridgeError::ScriptFailure(format!(
                "action must have exactly one verb, found {}",
                obj.len()
            )));
        }
        let (verb, spec) = obj.iter().next().expect("len checked above");
        match verb.as_str() {
            "set" => {
                let map = spec
                    .as_object()
                    .ok_or_else(|| BridgeError::ScriptFailure("set expects an object".to_string()))?;
                Ok(Action::Set(map.clone()))
            }
            "http_get" => {
                let spec = spec
                    .as_object()
                    .ok_or_else(|| BridgeError::ScriptFailure("http_get expects an object".to_string()))?;
                Ok(Action::HttpGet {
                    url: required_str(spec, "url", "http_get")?,
                    headers: object_or_empty(spec, "headers"),
                    into: spec.get("into").and_then(|v| v.as_str()).map(|s| s.to_string()),
                })
            }
            "http_post" => {
                let spec = spec
                    .as_object()
                    .ok_or_else(|| BridgeError::ScriptFailure("http_post expects an object".to_string()))?;
                Ok(Action::HttpPost {
                    url: required_str(spec, "url", "http_post")?,
                    body: spec.get("body").cloned().unwrap_or(Value::Null),
                    headers: object_or_empty(spec, "headers"),
                    form: spec.get("form").and_then(|v| v.as_bool()).unwrap_or(false),
                    into: spec.get("into").and_then(|v| v.as_str()).map(|s| s.to_string()),
                })
            }
            "clear" => {
                let keys = match spec {
                    Value::Array(items) => items
                        .iter()
                        .map(|v| {
                            v.as_str()
                                .map(|s| s.to_string())
                                .ok_or_else(|| BridgeError::ScriptFailure("clear expects string keys".to_string()))
                        })
                        .collect::<Result<Vec<_>>>()?,
                    Value::String(key) => vec![key.clone()],
                    _ => {
                        return Err(BridgeError::ScriptFailure(
                            "clear expects a key or list of keys".to_string(),
                        ))
                    }
                };
                Ok(Action::Clear(keys))
            }
            "fail" => {
                let message = spec
                    .as_str()
                    .ok_or_else(|| BridgeError::ScriptFailure("fail expects a message".to_string()))?;
                Ok(Action::Fail(message.to_string()))
            }
            other => Err(BridgeError::ScriptFailure(format!("unknown action verb {:?}", other))),
        }
    }
}

fn required_str(spec: &JsonMap, key: &str, verb: &str) -> Result<String> {
    spec.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| BridgeError::ScriptFailure(format!("{} requires {:?}", verb, key)))
}

fn object_or_empty(spec: &JsonMap, key: &str) -> JsonMap {
    spec.get(key).and_then(|v| v.as_object()).cloned().unwrap_or_default()
}

/// A fully parsed hook script: operation tag to action list.
struct HookScript {
    hooks: Vec<(String, Vec<Action>)>,
}

impl HookScript {
    fn actions_for(&self, operation: &str) -> Option<&[Action]> {
        self.hooks
            .iter()
            .find(|(op, _)| op == operation)
            .map(|(_, actions)| actions.as_slice())
    }
}

#[async_trait]
impl CompiledScript for HookScript {
    async fn invoke(&self, ctx: &ScriptContext) -> Result<JsonMap> {
        let Some(actions) = self.actions_for(&ctx.operation) else {
            return Ok(JsonMap::new());
        };

        let mut scope = build_scope(ctx);
        let mut result = JsonMap::new();

        for action in actions {
            match action {
                Action::Set(entries) => {
                    for (key, template) in entries {
                        let resolved = resolve_value(template, &scope);
                        scope.insert(key.clone(), resolved.clone());
                        result.insert(key.clone(), resolved);
                    }
                }
                Action::HttpGet { url, headers, into } => {
                    let http = transport(ctx)?;
                    let url = render_text(url, &scope);
                    let headers = resolve_map(headers, &scope);
                    let response = http.get(&url, &headers).await?;
                    if let Some(name) = into {
                        scope.insert(name.clone(), response);
                    }
                }
                Action::HttpPost {
                    url,
                    body,
                    headers,
                    form,
                    into,
                } => {
                    let http = transport(ctx)?;
                    let url = render_text(url, &scope);
                    let body = resolve_value(body, &scope);
                    let headers = resolve_map(headers, &scope);
                    let response = http.post(&url, &body, &headers, *form).await?;
                    if let Some(name) = into {
                        scope.insert(name.clone(), response);
                    }
                }
                Action::Clear(keys) => {
                    for key in keys {
                        scope.remove(key);
                        result.insert(key.clone(), Value::Null);
                    }
                }
                Action::Fail(message) => {
                    return Err(BridgeError::ScriptFailure(render_text(message, &scope)));
                }
            }
        }
        Ok(result)
    }
}

fn transport(ctx: &ScriptContext) -> Result<&crate::script::ScriptHttp> {
    ctx.http
        .as_ref()
        .ok_or_else(|| BridgeError::ScriptFailure("transport helper unavailable in this context".to_string()))
}

fn render_text(template: &str, scope: &JsonMap) -> String {
    match resolve_value(&Value::String(template.to_string()), scope) {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn resolve_map(map: &JsonMap, scope: &JsonMap) -> JsonMap {
    map.iter()
        .map(|(k, v)| (k.clone(), resolve_value(v, scope)))
        .collect()
}

fn build_scope(ctx: &ScriptContext) -> JsonMap {
    let mut scope = JsonMap::new();
    scope.insert("operation".to_string(), Value::String(ctx.operation.clone()));
    scope.insert("uuid".to_string(), Value::String(Uuid::new_v4().to_string()));
    scope.insert("credentials".to_string(), Value::Object(ctx.credentials.clone()));
    scope.insert("session".to_string(), Value::Object(ctx.session.clone()));
    if let Some(ds) = &ctx.data_source {
        if let Ok(v) = serde_json::to_value(ds) {
            scope.insert("data_source".to_string(), v);
        }
    }
    if let Some(req) = &ctx.request {
        if let Ok(v) = serde_json::to_value(req) {
            scope.insert("request".to_string(), v);
        }
    }
    scope
}

/// The built-in declarative engine.
pub struct HookLangEngine;

impl HookLangEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HookLangEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptEngine for HookLangEngine {
    fn compile(&self, body: &str) -> Result<Arc<dyn CompiledScript>> {
        let root: Value = serde_json::from_str(body)
            .map_err(|e| BridgeError::ScriptFailure(format!("script is not valid JSON: {}", e)))?;
        let obj = root
            .as_object()
            .ok_or_else(|| BridgeError::ScriptFailure("script must be a JSON object".to_string()))?;

        let mut hooks = Vec::with_capacity(obj.len());
        for (op, spec) in obj {
            let actions = match spec {
                Value::Array(items) => items.iter().map(Action::parse).collect::<Result<Vec<_>>>()?,
                single @ Value::Object(_) => vec![Action::parse(single)?],
                _ => {
                    return Err(BridgeError::ScriptFailure(format!(
                        "hook {:?} must be an action or action list",
                        op
                    )))
                }
            };
            hooks.push((op.clone(), actions));
        }
        Ok(Arc::new(HookScript { hooks }))
    }
}
