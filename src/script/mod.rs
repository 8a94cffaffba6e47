// # Script Executor
//
// Content-addressed cache of compiled lifecycle hook scripts. The engine is a
// pluggable seam: `ScriptEngine` compiles script text into a callable
// `CompiledScript`, and `ScriptExecutor` owns the cache keyed by the SHA-256
// of the text so recompilation cost is bounded. Changing a script means
// replacing the DataSource definition; there is no hot reload.

pub mod hooklang;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{BridgeError, Result};
use crate::model::{DataSource, ExecuteRequest, JsonMap};

pub use hooklang::HookLangEngine;

/// Parameters injected into every script invocation.
#[derive(Debug, Clone, Default)]
pub struct ScriptContext {
    /// Lifecycle phase tag: init|start|execute|refresh|stop
    pub operation: String,
    pub data_source: Option<DataSource>,
    pub request: Option<ExecuteRequest>,
    /// Connection credentials exposed to the script
    pub credentials: JsonMap,
    /// Snapshot of the connector's session data
    pub session: JsonMap,
    /// Transport helpers; absent in validate-only contexts
    pub http: Option<ScriptHttp>,
}

impl ScriptContext {
    pub fn for_operation(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }
}

/// HTTP helpers handed to scripts (`http_get`, `http_post`).
#[derive(Debug, Clone)]
pub struct ScriptHttp {
    client: reqwest::Client,
}

impl ScriptHttp {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// GET a URL; returns `{status, data}` where `data` is the JSON body when
    /// parseable, the raw text otherwise.
    pub async fn get(&self, url: &str, headers: &JsonMap) -> Result<Value> {
        let mut req = self.client.get(url);
        for (name, value) in headers {
            if let Some(v) = value.as_str() {
                req = req.header(name, v);
            }
        }
        let resp = req.send().await?;
        Self::bundle(resp).await
    }

    /// POST a JSON body; same response bundling as `get`.
    pub async fn post(&self, url: &str, body: &Value, headers: &JsonMap, form: bool) -> Result<Value> {
        let mut req = self.client.post(url);
        for (name, value) in headers {
            if let Some(v) = value.as_str() {
                req = req.header(name, v);
            }
        }
        req = if form {
            let fields: Vec<(String, String)> = body
                .as_object()
                .map(|m| {
                    m.iter()
                        .map(|(k, v)| (k.clone(), v.as_str().map(|s| s.to_string()).unwrap_or_else(|| v.to_string())))
                        .collect()
                })
                .unwrap_or_default();
            req.form(&fields)
        } else {
            req.json(body)
        };
        let resp = req.send().await?;
        Self::bundle(resp).await
    }

    async fn bundle(resp: reqwest::Response) -> Result<Value> {
        let status = resp.status().as_u16();
        let text = resp.text().await?;
        let data = serde_json::from_str(&text).unwrap_or(Value::String(text));
        let mut out = JsonMap::new();
        out.insert("status".to_string(), Value::from(status));
        out.insert("data".to_string(), data);
        Ok(Value::Object(out))
    }
}

/// A compiled script ready to invoke. The returned mapping is merged into the
/// connector's session data; null values remove the key.
#[async_trait]
pub trait CompiledScript: Send + Sync {
    async fn invoke(&self, ctx: &ScriptContext) -> Result<JsonMap>;
}

impl std::fmt::Debug for dyn CompiledScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledScript").finish()
    }
}

/// Pluggable compilation seam.
pub trait ScriptEngine: Send + Sync {
    fn compile(&self, body: &str) -> Result<Arc<dyn CompiledScript>>;
}

/// Cache statistics snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub cached: usize,
}

/// Compile-and-cache front end for hook scripts.
pub struct ScriptExecutor {
    engine: Arc<dyn ScriptEngine>,
    cache: DashMap<String, Arc<dyn CompiledScript>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ScriptExecutor {
    pub fn new() -> Self {
        Self::with_engine(Arc::new(HookLangEngine::new()))
    }

    pub fn with_engine(engine: Arc<dyn ScriptEngine>) -> Self {
        Self {
            engine,
            cache: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cache key for a script body.
    pub fn content_hash(body: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(body.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Compile-only check used before accepting a script at configuration
    /// time. The compiled form is retained so a later execute hits the cache.
    pub fn validate(&self, body: &str) -> Result<()> {
        self.lookup_or_compile(body).map(|_| ())
    }

    /// Execute a script body against an invocation context.
    pub async fn execute(&self, body: &str, ctx: &ScriptContext) -> Result<JsonMap> {
        let compiled = self.lookup_or_compile(body)?;
        compiled.invoke(ctx).await
    }

    pub fn stats(&self) -> ScriptCacheStats {
        ScriptCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            cached: self.cache.len(),
        }
    }

    fn lookup_or_compile(&self, body: &str) -> Result<Arc<dyn CompiledScript>> {
        let hash = Self::content_hash(body);
        if let Some(found) = self.cache.get(&hash) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(found.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let compiled = self
            .engine
            .compile(body)
            .map_err(|e| BridgeError::ScriptFailure(format!("compile failed: {}", e)))?;
        debug!(hash = %&hash[..12], "compiled hook script");
        self.cache.insert(hash, compiled.clone());
        Ok(compiled)
    }
}

impl Default for ScriptExecutor {
    fn default() -> Self {
        Self::new()
    }
}
