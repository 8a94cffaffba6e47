// # Real-Time Fan-Out Processor
//
// Push-mode records arriving from webhook and MQTT connectors are fanned out
// to every interface registered for the producing data source. Each interface
// owns one batching actor: a single task draining a record channel into a
// local buffer, flushing on size or age through the external `DataWriter`.
// Ordering within an interface is structural (one consumer), and no lock is
// held across collaborator calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::model::{FieldMapping, InterfaceInfo, JsonMap};

/// Downstream sink for flushed batches.
#[async_trait]
pub trait DataWriter: Send + Sync {
    /// Write one batch for one interface; returns the inserted count.
    async fn write_data(&self, interface_id: &str, records: Vec<Value>) -> Result<u64>;
}

/// Interface metadata lookup, backed by the host's catalog.
#[async_trait]
pub trait InterfaceLoader: Send + Sync {
    async fn load_interface(&self, interface_id: &str) -> Result<InterfaceInfo>;
}

/// Batch tunables.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Flush as soon as a buffer reaches this size
    pub batch_size: usize,
    /// Flush a non-empty buffer no later than this after the last flush
    pub batch_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_timeout: Duration::from_millis(100),
        }
    }
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ProcessorStats {
    pub total_processed: u64,
    pub total_written: u64,
    pub total_failed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_processed_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Counters {
    total_processed: AtomicU64,
    total_written: AtomicU64,
    total_failed: AtomicU64,
    last_processed_at: RwLock<Option<DateTime<Utc>>>,
}

enum BatchCommand {
    Record(Value),
    Flush,
    Shutdown,
}

struct InterfaceHandle {
    info: InterfaceInfo,
    tx: mpsc::UnboundedSender<BatchCommand>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    /// datasource id → ordered interface ids
    datasource_interfaces: HashMap<String, Vec<String>>,
    /// interface id → actor handle + cached info
    interfaces: HashMap<String, InterfaceHandle>,
}

/// The fan-out processor.
pub struct RealtimeProcessor {
    config: ProcessorConfig,
    writer: Arc<dyn DataWriter>,
    loader: Arc<dyn InterfaceLoader>,
    registry: RwLock<Registry>,
    counters: Arc<Counters>,
}

impl RealtimeProcessor {
    pub fn new(writer: Arc<dyn DataWriter>, loader: Arc<dyn InterfaceLoader>) -> Arc<Self> {
        Self::with_config(writer, loader, ProcessorConfig::default())
    }

    pub fn with_config(
        writer: Arc<dyn DataWriter>,
        loader: Arc<dyn InterfaceLoader>,
        config: ProcessorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            writer,
            loader,
            registry: RwLock::new(Registry::default()),
            counters: Arc::new(Counters::default()),
        })
    }

    /// Register an interface as a fan-out target of a data source. Loads and
    /// caches the interface metadata and spawns its batching actor on first
    /// registration.
    pub async fn register_interface(&self, interface_id: &str, datasource_id: &str) -> Result<()> {
        // Loader call happens outside the registry lock.
        let info = self.loader.load_interface(interface_id).await?;

        let mut registry = self.registry.write();
        if !registry.interfaces.contains_key(interface_id) {
            let (tx, rx) = mpsc::unbounded_channel();
            let task = tokio::spawn(run_batch_actor(
                interface_id.to_string(),
                rx,
                self.writer.clone(),
                self.config.clone(),
                self.counters.clone(),
            ));
            registry
                .interfaces
                .insert(interface_id.to_string(), InterfaceHandle { info, tx, task });
        }

        let targets = registry
            .datasource_interfaces
            .entry(datasource_id.to_string())
            .or_default();
        if !targets.iter().any(|id| id == interface_id) {
            targets.push(interface_id.to_string());
        }
        info!(interface_id, datasource_id, "registered realtime interface");
        Ok(())
    }

    /// Remove an interface from every data source; pending records are
    /// flushed by the actor on shutdown.
    pub fn unregister_interface(&self, interface_id: &str) {
        let mut registry = self.registry.write();
        for targets in registry.datasource_interfaces.values_mut() {
            targets.retain(|id| id != interface_id);
        }
        registry.datasource_interfaces.retain(|_, v| !v.is_empty());

        if let Some(handle) = registry.interfaces.remove(interface_id) {
            let _ = handle.tx.send(BatchCommand::Shutdown);
            drop(handle.task);
            info!(interface_id, "unregistered realtime interface");
        }
    }

    /// Fan one record out to every interface of the data source. Returns the
    /// number of interfaces targeted; zero means the record was ignored.
    pub fn process_realtime_data(&self, datasource_id: &str, record: &Value) -> usize {
        let targets: Vec<(mpsc::UnboundedSender<BatchCommand>, Vec<FieldMapping>)> = {
            let registry = self.registry.read();
            let Some(interface_ids) = registry.datasource_interfaces.get(datasource_id) else {
                return 0;
            };
            interface_ids
                .iter()
                .filter_map(|id| registry.interfaces.get(id))
                .map(|handle| (handle.tx.clone(), handle.info.parse_config.field_mapping.clone()))
                .collect()
        };
        if targets.is_empty() {
            return 0;
        }

        self.counters.total_processed.fetch_add(1, Ordering::Relaxed);
        *self.counters.last_processed_at.write() = Some(Utc::now());

        let mut delivered = 0;
        for (tx, mapping) in &targets {
            let mapped = apply_field_mapping(record, mapping);
            if tx.send(BatchCommand::Record(mapped)).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Force a flush of one interface's pending batch.
    pub fn flush_interface(&self, interface_id: &str) {
        let registry = self.registry.read();
        if let Some(handle) = registry.interfaces.get(interface_id) {
            let _ = handle.tx.send(BatchCommand::Flush);
        }
    }

    /// Interfaces currently registered for a data source, in order.
    pub fn interfaces_for(&self, datasource_id: &str) -> Vec<String> {
        self.registry
            .read()
            .datasource_interfaces
            .get(datasource_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            total_processed: self.counters.total_processed.load(Ordering::Relaxed),
            total_written: self.counters.total_written.load(Ordering::Relaxed),
            total_failed: self.counters.total_failed.load(Ordering::Relaxed),
            last_processed_at: *self.counters.last_processed_at.read(),
        }
    }

    /// Flush everything and stop all actors.
    pub fn shutdown(&self) {
        let mut registry = self.registry.write();
        registry.datasource_interfaces.clear();
        for (interface_id, handle) in registry.interfaces.drain() {
            debug!(interface_id = %interface_id, "shutting down batch actor");
            let _ = handle.tx.send(BatchCommand::Shutdown);
        }
    }
}

/// Rename `source` keys to `target` keys per the mapping; unmapped keys pass
/// through unchanged. Non-object records pass through whole.
pub fn apply_field_mapping(record: &Value, mapping: &[FieldMapping]) -> Value {
    let Some(obj) = record.as_object() else {
        return record.clone();
    };
    if mapping.is_empty() {
        return record.clone();
    }
    let renames: HashMap<&str, &str> = mapping
        .iter()
        .map(|m| (m.source.as_str(), m.target.as_str()))
        .collect();
    let mut out = JsonMap::new();
    for (key, value) in obj {
        let target = renames.get(key.as_str()).copied().unwrap_or(key.as_str());
        out.insert(target.to_string(), value.clone());
    }
    Value::Object(out)
}

/// One interface's batching loop: buffer records, flush on size or age, call
/// the writer synchronously, flush the remainder on shutdown.
async fn run_batch_actor(
    interface_id: String,
    mut rx: mpsc::UnboundedReceiver<BatchCommand>,
    writer: Arc<dyn DataWriter>,
    config: ProcessorConfig,
    counters: Arc<Counters>,
) {
    let mut buffer: Vec<Value> = Vec::new();
    let mut last_flush = Instant::now();

    loop {
        let command = if buffer.is_empty() {
            rx.recv().await
        } else {
            let deadline = last_flush + config.batch_timeout;
            tokio::select! {
                cmd = rx.recv() => cmd,
                _ = tokio::time::sleep_until(deadline) => Some(BatchCommand::Flush),
            }
        };

        match command {
            Some(BatchCommand::Record(record)) => {
                buffer.push(record);
                let stale = last_flush.elapsed() >= config.batch_timeout;
                if buffer.len() >= config.batch_size || stale {
                    flush(&interface_id, &mut buffer, &mut last_flush, &writer, &counters).await;
                }
            }
            Some(BatchCommand::Flush) => {
                flush(&interface_id, &mut buffer, &mut last_flush, &writer, &counters).await;
            }
            Some(BatchCommand::Shutdown) | None => {
                flush(&interface_id, &mut buffer, &mut last_flush, &writer, &counters).await;
                debug!(interface_id = %interface_id, "batch actor stopped");
                break;
            }
        }
    }
}

async fn flush(
    interface_id: &str,
    buffer: &mut Vec<Value>,
    last_flush: &mut Instant,
    writer: &Arc<dyn DataWriter>,
    counters: &Arc<Counters>,
) {
    *last_flush = Instant::now();
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    let size = batch.len() as u64;
    match writer.write_data(interface_id, batch).await {
        Ok(written) => {
            counters.total_written.fetch_add(size, Ordering::Relaxed);
            debug!(interface_id, written, "flushed batch");
        }
        Err(e) => {
            counters.total_failed.fetch_add(size, Ordering::Relaxed);
            error!(interface_id, batch_size = size, error = %e, "batch write failed");
        }
    }
}

/// Loader used when no catalog is attached: every interface resolves to bare
/// metadata with no field mapping.
pub struct StaticInterfaceLoader {
    interfaces: RwLock<HashMap<String, InterfaceInfo>>,
}

impl StaticInterfaceLoader {
    pub fn new() -> Self {
        Self {
            interfaces: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, info: InterfaceInfo) {
        self.interfaces.write().insert(info.id.clone(), info);
    }
}

impl Default for StaticInterfaceLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InterfaceLoader for StaticInterfaceLoader {
    async fn load_interface(&self, interface_id: &str) -> Result<InterfaceInfo> {
        Ok(self
            .interfaces
            .read()
            .get(interface_id)
            .cloned()
            .unwrap_or_else(|| {
                warn!(interface_id, "interface not in static catalog, using bare metadata");
                InterfaceInfo {
                    id: interface_id.to_string(),
                    schema_name: String::new(),
                    table_name: String::new(),
                    parse_config: Default::default(),
                }
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ParseConfig;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Writer that records every batch it receives.
    struct RecordingWriter {
        batches: Mutex<Vec<(String, Vec<Value>)>>,
        fail: bool,
    }

    impl RecordingWriter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
                fail: true,
            })
        }

        fn total_records(&self) -> usize {
            self.batches.lock().iter().map(|(_, b)| b.len()).sum()
        }
    }

    #[async_trait]
    impl DataWriter for RecordingWriter {
        async fn write_data(&self, interface_id: &str, records: Vec<Value>) -> Result<u64> {
            if self.fail {
                return Err(crate::error::BridgeError::Transport("sink down".to_string()));
            }
            let count = records.len() as u64;
            self.batches.lock().push((interface_id.to_string(), records));
            Ok(count)
        }
    }

    fn loader_with(id: &str, mapping: Vec<FieldMapping>) -> Arc<StaticInterfaceLoader> {
        let loader = Arc::new(StaticInterfaceLoader::new());
        loader.insert(InterfaceInfo {
            id: id.to_string(),
            schema_name: String::new(),
            table_name: String::new(),
            parse_config: ParseConfig { field_mapping: mapping },
        });
        loader
    }

    fn mapping(source: &str, target: &str) -> Vec<FieldMapping> {
        vec![FieldMapping {
            source: source.to_string(),
            target: target.to_string(),
        }]
    }

    #[test]
    fn test_field_mapping_renames_and_passes_through() {
        let mapped = apply_field_mapping(&json!({"a": 1, "c": 2}), &mapping("a", "b"));
        assert_eq!(mapped, json!({"b": 1, "c": 2}));
    }

    #[tokio::test]
    async fn test_flush_on_batch_size() {
        let writer = RecordingWriter::new();
        let processor = RealtimeProcessor::with_config(
            writer.clone(),
            loader_with("if-1", vec![]),
            ProcessorConfig {
                batch_size: 3,
                batch_timeout: Duration::from_secs(60),
            },
        );
        processor.register_interface("if-1", "ds-1").await.unwrap();

        for i in 0..3 {
            assert_eq!(processor.process_realtime_data("ds-1", &json!({"n": i})), 1);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let batches = writer.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1.len(), 3);
    }

    #[tokio::test]
    async fn test_flush_on_timeout() {
        let writer = RecordingWriter::new();
        let processor = RealtimeProcessor::with_config(
            writer.clone(),
            loader_with("if-1", vec![]),
            ProcessorConfig {
                batch_size: 100,
                batch_timeout: Duration::from_millis(50),
            },
        );
        processor.register_interface("if-1", "ds-1").await.unwrap();

        processor.process_realtime_data("ds-1", &json!({"n": 1}));
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(writer.total_records(), 1);
        let stats = processor.stats();
        assert_eq!(stats.total_processed, 1);
        assert_eq!(stats.total_written, 1);
    }

    #[tokio::test]
    async fn test_no_record_vanishes_before_flush() {
        let writer = RecordingWriter::new();
        let processor = RealtimeProcessor::with_config(
            writer.clone(),
            loader_with("if-1", vec![]),
            ProcessorConfig {
                batch_size: 7,
                batch_timeout: Duration::from_millis(20),
            },
        );
        processor.register_interface("if-1", "ds-1").await.unwrap();

        let calls = 23;
        for i in 0..calls {
            processor.process_realtime_data("ds-1", &json!({"n": i}));
        }
        processor.unregister_interface("if-1");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(writer.total_records(), calls);
        let order: Vec<i64> = writer
            .batches
            .lock()
            .iter()
            .flat_map(|(_, b)| b.iter().map(|r| r["n"].as_i64().unwrap()))
            .collect();
        let expected: Vec<i64> = (0..calls as i64).collect();
        assert_eq!(order, expected);
    }

    #[tokio::test]
    async fn test_fan_out_to_multiple_interfaces() {
        let writer = RecordingWriter::new();
        let loader = Arc::new(StaticInterfaceLoader::new());
        loader.insert(InterfaceInfo {
            id: "if-a".to_string(),
            schema_name: String::new(),
            table_name: String::new(),
            parse_config: ParseConfig {
                field_mapping: mapping("temp_c", "temperature"),
            },
        });
        loader.insert(InterfaceInfo {
            id: "if-b".to_string(),
            schema_name: String::new(),
            table_name: String::new(),
            parse_config: ParseConfig::default(),
        });
        let processor = RealtimeProcessor::with_config(
            writer.clone(),
            loader,
            ProcessorConfig {
                batch_size: 1,
                batch_timeout: Duration::from_millis(50),
            },
        );
        processor.register_interface("if-a", "ds-1").await.unwrap();
        processor.register_interface("if-b", "ds-1").await.unwrap();

        let delivered = processor.process_realtime_data("ds-1", &json!({"device": "d1", "temp_c": 22.5}));
        assert_eq!(delivered, 2);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let batches = writer.batches.lock();
        let for_a = batches.iter().find(|(id, _)| id == "if-a").unwrap();
        assert_eq!(for_a.1[0], json!({"device": "d1", "temperature": 22.5}));
        let for_b = batches.iter().find(|(id, _)| id == "if-b").unwrap();
        assert_eq!(for_b.1[0], json!({"device": "d1", "temp_c": 22.5}));
    }

    #[tokio::test]
    async fn test_writer_failure_counts_failed_and_isolates() {
        let writer = RecordingWriter::failing();
        let processor = RealtimeProcessor::with_config(
            writer,
            loader_with("if-1", vec![]),
            ProcessorConfig {
                batch_size: 1,
                batch_timeout: Duration::from_millis(20),
            },
        );
        processor.register_interface("if-1", "ds-1").await.unwrap();
        processor.process_realtime_data("ds-1", &json!({"n": 1}));
        tokio::time::sleep(Duration::from_millis(60)).await;

        let stats = processor.stats();
        assert_eq!(stats.total_failed, 1);
        assert_eq!(stats.total_written, 0);
    }

    #[tokio::test]
    async fn test_unknown_datasource_is_noop() {
        let writer = RecordingWriter::new();
        let processor = RealtimeProcessor::new(writer, Arc::new(StaticInterfaceLoader::new()));
        assert_eq!(processor.process_realtime_data("nobody", &json!({})), 0);
        assert_eq!(processor.stats().total_processed, 0);
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_idempotent() {
        let writer = RecordingWriter::new();
        let processor = RealtimeProcessor::new(writer, loader_with("if-1", vec![]));
        processor.register_interface("if-1", "ds-1").await.unwrap();
        processor.register_interface("if-1", "ds-1").await.unwrap();
        assert_eq!(processor.interfaces_for("ds-1"), vec!["if-1".to_string()]);
    }
}
