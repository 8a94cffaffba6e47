// Builder-to-parser pipeline tests: the compiled request for a paginated API
// pull, the incremental SQL cursor, and the normalized pagination the caller
// uses to decide whether to fetch the next page.

use serde_json::json;

use databridge::model::{ComparisonType, JsonMap};
use databridge::{
    DataInterface, DataSource, DataSourceCategory, IncrementalParams, PageParams, QueryBuilder,
    ResponseParserConfig, SyncStrategy,
};
use databridge::model::source_type;

fn items_interface() -> DataInterface {
    DataInterface::new("if-items")
        .with_config("urlSuffix", json!("/items"))
        .with_config("method", json!("GET"))
        .with_config("paginationEnabled", json!(true))
        .with_config("paginationPageParam", json!("page"))
        .with_config("paginationSizeParam", json!("size"))
        .with_config("paginationStartValue", json!(1))
        .with_config("paginationDefaultSize", json!(20))
        .with_config("dataPath", json!("data.items"))
        .with_config("totalField", json!("data.total"))
        .with_config("pageField", json!("data.page"))
        .with_config("pageSizeField", json!("data.size"))
}

#[test]
fn paginated_api_pull_drives_next_page_from_parsed_total() {
    let ds = DataSource::new("ds-api", source_type::API_HTTP, DataSourceCategory::Api)
        .with_connection("baseUrl", json!("https://api.example.com"));
    let iface = items_interface();
    let builder = QueryBuilder::new(&ds, &iface);

    // First page request carries page=1&size=20.
    let first = builder
        .build_paginated_request(SyncStrategy::Full, PageParams { page: 1, page_size: 20 }, &JsonMap::new())
        .unwrap();
    let query = first.params.get("query").unwrap().as_object().unwrap();
    assert_eq!(query.get("page"), Some(&json!(1)));
    assert_eq!(query.get("size"), Some(&json!(20)));
    assert_eq!(first.param_str("path"), Some("/items"));

    // The connector would feed the reply through the attached parser config.
    let parser_cfg = first
        .params
        .get("response_parser")
        .and_then(|v| v.as_object())
        .and_then(ResponseParserConfig::from_interface)
        .expect("builder attaches the parser settings");

    let body = json!({
        "data": {
            "items": [{"id": 1}, {"id": 2}],
            "total": 45,
            "page": 1,
            "size": 20
        }
    });
    let parsed = parser_cfg.parse(200, &body.to_string()).unwrap();
    assert!(parsed.success);
    assert_eq!(parsed.total, Some(45));
    assert!(parsed.has_next, "45 items at size 20 leave more pages");

    // Caller advances and the second request carries page=2.
    let second = builder
        .build_paginated_request(SyncStrategy::Full, PageParams { page: 2, page_size: 20 }, &JsonMap::new())
        .unwrap();
    let query = second.params.get("query").unwrap().as_object().unwrap();
    assert_eq!(query.get("page"), Some(&json!(2)));

    // Final page: 45/20 rounds to 3 pages, so page 3 has no successor.
    let last_body = json!({
        "data": {"items": [{"id": 45}], "total": 45, "page": 3, "size": 20}
    });
    let parsed = parser_cfg.parse(200, &last_body.to_string()).unwrap();
    assert!(!parsed.has_next);
}

#[test]
fn incremental_database_pull_composes_cursor_and_batch() {
    let ds = DataSource::new("ds-db", source_type::DB_POSTGRESQL, DataSourceCategory::Database);
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

    // First sync carries no cursor and degrades to a bounded full pull.
    let first_sync = builder
        .build_incremental_request(
            SyncStrategy::Incremental,
            &IncrementalParams::new("updated_at").with_batch_size(50),
            &JsonMap::new(),
        )
        .unwrap();
    assert_eq!(
        first_sync.query.as_deref(),
        Some("SELECT * FROM orders ORDER BY updated_at ASC LIMIT 50")
    );
}

#[test]
fn api_test_request_keeps_probe_lightweight() {
    let ds = DataSource::new("ds-api", source_type::API_HTTP, DataSourceCategory::Api)
        .with_connection("baseUrl", json!("https://api.example.com"));
    let iface = items_interface();
    let req = QueryBuilder::new(&ds, &iface).build_test_request().unwrap();

    // No pagination on the probe, and the short test deadline applies.
    let query = req.params.get("query").unwrap().as_object().unwrap();
    assert!(!query.contains_key("page"));
    assert_eq!(req.timeout, Some(std::time::Duration::from_secs(30)));
}
