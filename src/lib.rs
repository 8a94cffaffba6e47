// DataBridge - Pluggable data-source connector runtime
// Core library module

pub mod connector;
pub mod error;
pub mod manager;
pub mod model;
pub mod pool;
pub mod query;
pub mod realtime;
pub mod script;

pub use connector::{Connector, ConnectorFactory, RuntimeContext, WebhookRegistry, WebhookRequest, WebhookResponse};
pub use error::{BridgeError, Result};
pub use manager::{ConnectorStatus, DataSourceManager, ManagerConfig};
pub use model::{
    DataInterface, DataSource, DataSourceCategory, ExecuteRequest, ExecuteResponse, HealthState,
    HealthStatus, IncrementalParams, InterfaceInfo, PageParams, PaginationConfig, ParsedResponse,
};
pub use query::{QueryBuilder, ResponseParserConfig, SyncStrategy};
pub use realtime::{DataWriter, InterfaceLoader, ProcessorConfig, RealtimeProcessor};
pub use script::{ScriptEngine, ScriptExecutor};
