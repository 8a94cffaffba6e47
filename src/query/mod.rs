// # Query Builder and Response Parser
//
// Compiles interface metadata plus runtime parameters into transport-agnostic
// execute requests, and normalizes heterogeneous success/error/pagination
// conventions back into a uniform shape.

pub mod builder;
pub mod parser;

pub use builder::{QueryBuilder, SyncStrategy, format_shanghai_time, resolve_template, resolve_value};
pub use parser::ResponseParserConfig;
