use rangeql::engine::{
    drivers::duckdb::DuckDbBackend,
    error::{BackendFailure, ExecutionError},
    metadata::{EntityDefinition, StaticMetadata},
    sql_generator::{AnsiSqlGenerator, SqlDialect},
    traits::{Backend, FsSourceReader},
    types::{Parameters, QueryResult, ResultSet, Value},
};
use rangeql::federation::{PaginationOutcome, QueryEngine};
use rangeql::query::{
    AggregateFunc, CompareOp, Expr, QueryPlan, Range, SelectItem, SortItem, IN_VALUES_ARE_FINAL,
};
use rangeql::EngineConfig;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::time::Duration;

const SCHEMA: &str = "
    CREATE TABLE users (id INTEGER PRIMARY KEY, name VARCHAR, age INTEGER);
    INSERT INTO users VALUES
        (1, 'Bob', 25), (2, 'Dee', 19), (3, 'Ada', 36), (4, 'Eve', 30), (5, 'Cy', 41);
    CREATE TABLE orders (id INTEGER PRIMARY KEY, user_id INTEGER, total INTEGER);
    INSERT INTO orders VALUES (10, 1, 25), (11, 1, 5), (12, 2, 40), (13, 5, 15);
    CREATE VIEW adults AS SELECT * FROM users WHERE age >= 21;
";

const TAGS: &str = r#"{"tags": [
    {"user_id": 1, "tag": "vip"},
    {"user_id": 3, "tag": "new"},
    {"user_id": 3, "tag": "beta"}
]}"#;

const PEOPLE: &str = r#"[{"id": 1, "age": 50}, {"id": 2}, {"id": 3, "age": 20}]"#;

const SETTINGS: &str = r#"[{"currency": "EUR"}]"#;

struct Fixture {
    engine: QueryEngine,
    _dir: TempDir,
}

fn metadata() -> StaticMetadata {
    StaticMetadata::new()
        .with_entity("User", EntityDefinition::table("users", &["id"]))
        .with_entity("Order", EntityDefinition::table("orders", &["id"]))
        .with_entity("Adult", EntityDefinition::view("adults"))
}

fn fixture() -> Fixture {
    let backend = DuckDbBackend::open_in_memory().expect("open duckdb");
    backend.execute_batch(SCHEMA).expect("create schema");

    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("tags.json"), TAGS).expect("write tags");
    std::fs::write(dir.path().join("people.json"), PEOPLE).expect("write people");
    std::fs::write(dir.path().join("settings.json"), SETTINGS).expect("write settings");

    let engine = QueryEngine::new(
        Arc::new(backend),
        Arc::new(AnsiSqlGenerator::new(SqlDialect::DuckDb)),
        Arc::new(FsSourceReader::with_root(dir.path())),
        Arc::new(metadata()),
    );
    Fixture { engine, _dir: dir }
}

fn column(rows: &ResultSet, key: &str) -> Vec<Value> {
    rows.iter()
        .map(|row| row.get(key).cloned().unwrap_or(Value::Null))
        .collect()
}

fn text(values: &[&str]) -> Vec<Value> {
    values.iter().map(|v| Value::from(*v)).collect()
}

fn users_by_name() -> QueryPlan {
    QueryPlan::new()
        .with_range(Range::entity("u", "User"))
        .with_value(SelectItem::aliased(Expr::ident("u", "name"), "name"))
        .with_sort(SortItem::asc(Expr::ident("u", "name")))
}

fn users_with_orders() -> Range {
    Range::entity("o", "Order").via(
        Expr::eq(Expr::ident("o", "user_id"), Expr::ident("u", "id")),
        true,
    )
}

#[test]
fn test_inner_join_across_tables_with_pushed_filter() {
    let fx = fixture();
    let plan = QueryPlan::new()
        .with_range(Range::entity("u", "User"))
        .with_range(users_with_orders())
        .with_condition(Expr::compare(
            CompareOp::Gt,
            Expr::ident("o", "total"),
            Expr::lit(10),
        ))
        .with_value(SelectItem::aliased(Expr::ident("u", "name"), "name"))
        .with_value(SelectItem::aliased(Expr::ident("o", "total"), "total"))
        .with_sort(SortItem::desc(Expr::ident("o", "total")));

    let (rows, meta) = fx
        .engine
        .execute_plan_with_metadata(plan, &Parameters::new())
        .unwrap();

    assert_eq!(column(&rows, "name"), text(&["Dee", "Bob", "Cy"]));
    assert_eq!(
        column(&rows, "total"),
        vec![Value::Int(40), Value::Int(25), Value::Int(15)]
    );
    assert_eq!(meta.range_results.len(), 2);
    assert_eq!(meta.range_results[1].pushed_conditions, 1);
    assert_eq!(meta.range_results[1].row_count, 3);
    assert_eq!(meta.pagination, PaginationOutcome::NotRequested);
}

#[test]
fn test_left_join_table_with_json_document() {
    let fx = fixture();
    let plan = QueryPlan::new()
        .with_range(Range::entity("u", "User"))
        .with_range(
            Range::json("t", "tags.json")
                .with_filter("$.tags")
                .via(Expr::eq(Expr::ident("t", "user_id"), Expr::ident("u", "id")), false),
        )
        .with_value(SelectItem::aliased(Expr::ident("u", "name"), "name"))
        .with_value(SelectItem::aliased(Expr::ident("t", "tag"), "tag"))
        .with_sort(SortItem::asc(Expr::ident("u", "id")));

    let rows = fx.engine.execute_plan(plan, &Parameters::new()).unwrap();

    assert_eq!(column(&rows, "name"), text(&["Bob", "Dee", "Ada", "Ada", "Eve", "Cy"]));
    assert_eq!(
        column(&rows, "tag"),
        vec![
            Value::from("vip"),
            Value::Null,
            Value::from("new"),
            Value::from("beta"),
            Value::Null,
            Value::Null,
        ]
    );
}

#[test]
fn test_bound_parameters_reach_the_backend() {
    let fx = fixture();
    let plan = users_by_name().with_condition(Expr::compare(
        CompareOp::Gte,
        Expr::ident("u", "age"),
        Expr::param("min_age"),
    ));
    let params = Parameters::from([("min_age".to_string(), Value::Int(30))]);

    let rows = fx.engine.execute_plan(plan, &params).unwrap();
    assert_eq!(column(&rows, "name"), text(&["Ada", "Cy", "Eve"]));
}

#[test]
fn test_list_parameter_expands_inside_in() {
    let fx = fixture();
    let plan = users_by_name().with_condition(Expr::in_list(
        Expr::ident("u", "id"),
        vec![Expr::param("ids")],
    ));
    let params = Parameters::from([(
        "ids".to_string(),
        Value::Array(vec![Value::Int(2), Value::Int(4)]),
    )]);

    let rows = fx.engine.execute_plan(plan, &params).unwrap();
    assert_eq!(column(&rows, "name"), text(&["Dee", "Eve"]));
}

#[test]
fn test_final_list_parameter_is_paged_through_probe() {
    let fx = fixture();
    let plan = users_by_name()
        .with_condition(Expr::in_list(
            Expr::ident("u", "id"),
            vec![Expr::param("ids")],
        ))
        .with_directive(IN_VALUES_ARE_FINAL, true)
        .with_window(1, 2);
    let params = Parameters::from([(
        "ids".to_string(),
        Value::Array(vec![Value::Int(5), Value::Int(3), Value::Int(1), Value::Int(4)]),
    )]);

    let (rows, meta) = fx.engine.execute_plan_with_metadata(plan, &params).unwrap();
    assert_eq!(column(&rows, "name"), text(&["Cy", "Eve"]));
    assert_eq!(
        meta.pagination,
        PaginationOutcome::KeysProbed {
            total_keys: 4,
            page_keys: 2
        }
    );
}

#[test]
fn test_sparse_json_filters_alike_pushed_or_residual() {
    let fx = fixture();
    let older = || Expr::compare(CompareOp::Gt, Expr::ident("p", "age"), Expr::lit(30));
    let people = || {
        QueryPlan::new()
            .with_range(Range::json("p", "people.json"))
            .with_value(SelectItem::aliased(Expr::ident("p", "id"), "id"))
            .with_condition(older())
    };

    let (pushed, meta) = fx
        .engine
        .execute_plan_with_metadata(people(), &Parameters::new())
        .unwrap();
    assert_eq!(meta.range_results[0].pushed_conditions, 1);
    assert_eq!(column(&pushed, "id"), vec![Value::Int(1)]);

    // A cross-joined range keeps the filter out of the JSON executor.
    let residual = people().with_range(Range::json("s", "settings.json"));
    let (rows, meta) = fx
        .engine
        .execute_plan_with_metadata(residual, &Parameters::new())
        .unwrap();
    assert_eq!(meta.range_results[0].pushed_conditions, 0);
    assert_eq!(column(&rows, "id"), vec![Value::Int(1)]);
}

#[test]
fn test_pages_concatenate_to_the_full_ordering() {
    let fx = fixture();
    let full = fx
        .engine
        .execute_plan(users_by_name(), &Parameters::new())
        .unwrap();
    assert_eq!(column(&full, "name"), text(&["Ada", "Bob", "Cy", "Dee", "Eve"]));

    let mut paged = Vec::new();
    for window in 0..3 {
        let (rows, meta) = fx
            .engine
            .execute_plan_with_metadata(users_by_name().with_window(window, 2), &Parameters::new())
            .unwrap();
        let expected_page = if window < 2 { 2 } else { 1 };
        assert_eq!(
            meta.pagination,
            PaginationOutcome::KeysProbed {
                total_keys: 5,
                page_keys: expected_page
            }
        );
        paged.extend(rows);
    }
    assert_eq!(column(&paged, "name"), column(&full, "name"));
}

#[test]
fn test_window_past_the_end_is_empty() {
    let fx = fixture();
    let (rows, meta) = fx
        .engine
        .execute_plan_with_metadata(users_by_name().with_window(7, 2), &Parameters::new())
        .unwrap();
    assert!(rows.is_empty());
    assert_eq!(meta.pagination, PaginationOutcome::EmptyPage { total_keys: 5 });
}

#[test]
fn test_window_counts_base_rows_not_joined_rows() {
    let fx = fixture();
    let plan = QueryPlan::new()
        .with_range(Range::entity("u", "User"))
        .with_range(Range::entity("o", "Order").via(
            Expr::eq(Expr::ident("o", "user_id"), Expr::ident("u", "id")),
            false,
        ))
        .with_value(SelectItem::aliased(Expr::ident("u", "name"), "name"))
        .with_value(SelectItem::aliased(Expr::ident("o", "id"), "order"))
        .with_sort(SortItem::asc(Expr::ident("u", "name")))
        .with_sort(SortItem::asc(Expr::ident("o", "id")))
        .with_window(0, 2);

    let rows = fx.engine.execute_plan(plan, &Parameters::new()).unwrap();
    assert_eq!(column(&rows, "name"), text(&["Ada", "Bob", "Bob"]));
    assert_eq!(
        column(&rows, "order"),
        vec![Value::Null, Value::Int(10), Value::Int(11)]
    );
}

#[test]
fn test_view_base_range_is_windowed_in_memory() {
    let fx = fixture();
    let plan = QueryPlan::new()
        .with_range(Range::entity("a", "Adult"))
        .with_value(SelectItem::aliased(Expr::ident("a", "name"), "name"))
        .with_sort(SortItem::desc(Expr::ident("a", "age")))
        .with_window(1, 2);

    let (rows, meta) = fx
        .engine
        .execute_plan_with_metadata(plan, &Parameters::new())
        .unwrap();
    assert_eq!(column(&rows, "name"), text(&["Eve", "Bob"]));
    assert!(matches!(meta.pagination, PaginationOutcome::Skipped { .. }));
}

#[test]
fn test_aggregates_with_filter_clause() {
    let fx = fixture();
    let plan = QueryPlan::new()
        .with_range(Range::entity("o", "Order"))
        .with_value(SelectItem::aliased(
            Expr::aggregate(AggregateFunc::Count, None, None),
            "orders",
        ))
        .with_value(SelectItem::aliased(
            Expr::aggregate(
                AggregateFunc::Sum,
                Some(Expr::ident("o", "total")),
                Some(Expr::compare(
                    CompareOp::Gt,
                    Expr::ident("o", "total"),
                    Expr::lit(10),
                )),
            ),
            "large_total",
        ));

    let rows = fx.engine.execute_plan(plan, &Parameters::new()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("orders"), Some(&Value::Int(4)));
    assert_eq!(rows[0].get("large_total"), Some(&Value::Int(80)));
}

#[test]
fn test_unknown_entity_and_missing_document_fail_with_context() {
    let fx = fixture();

    let ghost = QueryPlan::new().with_range(Range::entity("g", "Ghost"));
    let err = fx.engine.execute_plan(ghost, &Parameters::new()).unwrap_err();
    assert!(matches!(err.root(), ExecutionError::InvalidPlan { .. }));

    let missing = QueryPlan::new()
        .with_range(Range::entity("u", "User"))
        .with_range(Range::json("m", "missing.json"));
    let err = fx.engine.execute_plan(missing, &Parameters::new()).unwrap_err();
    assert!(err.to_string().contains("fetching range 'm'"));
    assert!(matches!(err.root(), ExecutionError::SourceNotFound { .. }));
}

#[test]
fn test_engine_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("tags.json"), TAGS).unwrap();
    let config_path = dir.path().join("rangeql.json");
    let config = serde_json::json!({
        "json_root": dir.path(),
        "dialect": "duckdb",
        "query_timeout_ms": 0,
        "entities": {
            "User": { "table": "users", "primary_key": ["id"] }
        }
    });
    std::fs::write(&config_path, config.to_string()).unwrap();

    let config = EngineConfig::load(&config_path).unwrap();
    let backend = DuckDbBackend::open_in_memory().unwrap();
    backend.execute_batch(SCHEMA).unwrap();
    let engine = QueryEngine::from_config(&config, Arc::new(backend));
    assert!(engine.query_timeout().is_none());

    let plan = QueryPlan::new()
        .with_range(Range::json("t", "tags.json").with_filter("$.tags[?(@.user_id == 3)]"))
        .with_range(Range::entity("u", "User").via(
            Expr::eq(Expr::ident("u", "id"), Expr::ident("t", "user_id")),
            true,
        ))
        .with_value(SelectItem::aliased(Expr::ident("t", "tag"), "tag"))
        .with_value(SelectItem::aliased(Expr::ident("u", "name"), "name"));

    let rows = engine.execute_plan(plan, &Parameters::new()).unwrap();
    assert_eq!(column(&rows, "tag"), text(&["new", "beta"]));
    assert_eq!(column(&rows, "name"), text(&["Ada", "Ada"]));
}

/// Backend that blocks longer than any test timeout
struct SlowBackend;

impl Backend for SlowBackend {
    fn driver_id(&self) -> &'static str {
        "slow"
    }

    fn execute(&self, _sql: &str, _params: &[Value]) -> Result<QueryResult, BackendFailure> {
        std::thread::sleep(std::time::Duration::from_millis(300));
        Ok(QueryResult::empty())
    }
}

#[tokio::test]
async fn test_timeout_aborts_waiting_for_slow_backend() {
    let engine = Arc::new(
        QueryEngine::new(
            Arc::new(SlowBackend),
            Arc::new(AnsiSqlGenerator::default()),
            Arc::new(FsSourceReader::new()),
            Arc::new(metadata()),
        )
        .with_timeout(Some(Duration::from_millis(20))),
    );

    let plan = QueryPlan::new().with_range(Range::entity("u", "User"));
    let err = engine
        .execute_plan_with_timeout(plan, Parameters::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::Timeout { timeout_ms: 20 }));
}
