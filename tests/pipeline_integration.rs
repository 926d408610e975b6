//! End-to-end pipeline tests: partitioned raw files on disk, a real SQLite
//! store, every layer exercised through the public API.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use medallion_etl::config::PipelineConfig;
use medallion_etl::context::{Layer, RunContext, RunMode};
use medallion_etl::db::open_store;
use medallion_etl::model::EntityKind;
use medallion_etl::{orchestrator, quality};

fn write_partition(root: &Path, entity: &str, date: &str, lines: &[&str]) {
    let dir = root.join(entity).join(date);
    std::fs::create_dir_all(&dir).unwrap();
    let mut f = File::create(dir.join("data.jsonl")).unwrap();
    for line in lines {
        writeln!(f, "{line}").unwrap();
    }
}

/// A small but realistic drop: clean rows, a duplicate customer, an invalid
/// email, an orphaned order and an item with a discount.
fn seed_inputs(raw_dir: &Path) {
    write_partition(raw_dir, "customers", "2025-03-01", &[
        r#"{"customer_id": 1, "customer_name": "ada lovelace", "email": "ada@example.com", "country": "UK", "signup_date": "2025-01-01", "customer_segment": "Premium"}"#,
        r#"{"customer_id": 2, "customer_name": "bob tables", "email": "bob@example.com", "signup_date": "2025-01-02"}"#,
        r#"{"customer_id": 3, "customer_name": "carol", "email": "broken-email", "signup_date": "2025-01-03"}"#,
        r#"{"customer_id": 4, "customer_name": "dan", "email": "dan@example.com", "signup_date": "2025-01-04", "customer_segment": "Basic"}"#,
        r#"{"customer_id": 5, "customer_name": "eve", "email": "eve@example.com", "signup_date": "2025-01-05"}"#,
    ]);
    write_partition(raw_dir, "customers", "2025-03-02", &[
        // Later partition updates customer 1's country.
        r#"{"customer_id": 1, "customer_name": "ada lovelace", "email": "ada@example.com", "country": "FR", "signup_date": "2025-01-01", "customer_segment": "Premium"}"#,
    ]);
    write_partition(raw_dir, "products", "2025-03-01", &[
        r#"{"product_id": 10, "product_name": "Widget", "category": "Tools", "price": 5.0, "cost": 2.0}"#,
        r#"{"product_id": 11, "product_name": "Gadget", "category": "Electronics", "price": 20.0, "cost": 8.0}"#,
    ]);
    write_partition(raw_dir, "orders", "2025-03-02", &[
        r#"{"order_id": 100, "customer_id": 1, "order_date": "2025-03-01", "order_status": "completed", "total_amount": 25.0}"#,
        r#"{"order_id": 101, "customer_id": 2, "order_date": "2025-03-01", "order_status": "completed", "total_amount": 36.0}"#,
        r#"{"order_id": 102, "customer_id": 999, "order_date": "2025-03-02", "order_status": "completed", "total_amount": 10.0}"#,
        r#"{"order_id": 103, "customer_id": 2, "order_date": "2025-03-02", "order_status": "cancelled", "total_amount": 50.0}"#,
        r#"{"order_id": 104, "customer_id": 4, "order_date": "2025-03-03", "order_status": "completed", "total_amount": 15.0}"#,
    ]);
    write_partition(raw_dir, "order_items", "2025-03-02", &[
        r#"{"order_item_id": 1000, "order_id": 100, "product_id": 10, "quantity": 5, "unit_price": 5.0}"#,
        r#"{"order_item_id": 1001, "order_id": 101, "product_id": 11, "quantity": 2, "unit_price": 20.0, "discount_percent": 10.0}"#,
        r#"{"order_item_id": 1002, "order_id": 102, "product_id": 10, "quantity": 1, "unit_price": 5.0}"#,
        r#"{"order_item_id": 1003, "order_id": 104, "product_id": 10, "quantity": 3, "unit_price": 5.0}"#,
        r#"{"order_item_id": 1004, "order_id": 103, "product_id": 11, "quantity": 1, "unit_price": 20.0}"#,
    ]);
}

fn config_in(dir: &Path) -> PipelineConfig {
    PipelineConfig {
        db_path: dir.join("pipeline.db"),
        raw_dir: dir.join("raw"),
        quality: Default::default(),
    }
}

#[test]
fn full_pipeline_stages_validates_and_aggregates() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config_in(tmp.path());
    seed_inputs(&config.raw_dir);

    let mut ctx = RunContext::new(RunMode::Incremental, None, Layer::Raw);
    let report = orchestrator::run(&config, &mut ctx).unwrap();

    // Raw: every line landed, both customer partitions included.
    assert_eq!(report.raw.as_ref().unwrap().total_rows(), 18);

    let staging = report.staging.as_ref().unwrap();
    let entity = |kind: EntityKind| {
        staging
            .entities
            .iter()
            .find(|e| e.entity == kind)
            .unwrap()
    };

    // Customer 1 deduped across partitions (later partition wins), customer
    // 3 rejected on email.
    let customers = entity(EntityKind::Customers);
    assert_eq!(customers.duplicates_resolved, 1);
    assert_eq!(customers.inserted, 4);
    assert_eq!(customers.reasons["invalid_email"], 1);

    // Order 102 references an unknown customer; its item 1002 then loses
    // its parent order.
    let orders = entity(EntityKind::Orders);
    assert_eq!(orders.reasons["missing_parent:customer_id"], 1);
    let items = entity(EntityKind::OrderItems);
    assert_eq!(items.reasons["missing_parent:order_id"], 1);

    let conn = open_store(&config.db_path).unwrap();

    // Dedup kept the later country for customer 1.
    let country: String = conn
        .query_row(
            "SELECT country FROM stg_customers WHERE customer_id = 1",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(country, "FR");

    // Name capitalization applied.
    let name: String = conn
        .query_row(
            "SELECT customer_name FROM stg_customers WHERE customer_id = 2",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(name, "Bob Tables");

    // Line total derivation with discount: 2 * 20 * 0.9 = 36.
    let line_total: f64 = conn
        .query_row(
            "SELECT line_total FROM stg_order_items WHERE order_item_id = 1001",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(line_total, 36.0);

    // Daily sales: only the two completed, staged orders on 2025-03-01.
    let (total_orders, revenue): (i64, f64) = conn
        .query_row(
            "SELECT total_orders, total_revenue FROM prod_daily_sales WHERE order_date = '2025-03-01'",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!(total_orders, 2);
    assert_eq!(revenue, 61.0);

    // The cancelled order's date never aggregates.
    let cancelled_day: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM prod_daily_sales WHERE order_date = '2025-03-02'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(cancelled_day, 0);

    // The quality report over the finished store passes.
    let quality_report = quality::validate(&conn, &config.quality).unwrap();
    assert!(quality_report.passed(), "checks: {:?}", quality_report.checks);
}

#[test]
fn second_run_is_a_noop_apart_from_timestamps() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config_in(tmp.path());
    seed_inputs(&config.raw_dir);

    let mut first = RunContext::new(RunMode::Incremental, None, Layer::Raw);
    orchestrator::run(&config, &mut first).unwrap();

    let mut second = RunContext::new(RunMode::Incremental, None, Layer::Raw);
    let report = orchestrator::run(&config, &mut second).unwrap();

    // No partitions re-ingested, everything restaged as updates.
    assert_eq!(report.raw.as_ref().unwrap().total_rows(), 0);
    let staging = report.staging.as_ref().unwrap();
    assert!(staging.entities.iter().all(|e| e.inserted == 0));

    let conn = open_store(&config.db_path).unwrap();
    let raw_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM raw_orders", [], |r| r.get(0))
        .unwrap();
    assert_eq!(raw_count, 5);
    let stg_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM stg_customers", [], |r| r.get(0))
        .unwrap();
    assert_eq!(stg_count, 4);
    let daily_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM prod_daily_sales", [], |r| r.get(0))
        .unwrap();
    assert_eq!(daily_count, 2);
}

#[test]
fn full_refresh_rebuilds_raw_without_duplication() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config_in(tmp.path());
    seed_inputs(&config.raw_dir);

    let mut first = RunContext::new(RunMode::Incremental, None, Layer::Raw);
    orchestrator::run(&config, &mut first).unwrap();

    let mut refresh = RunContext::new(RunMode::FullRefresh, None, Layer::Raw);
    let report = orchestrator::run(&config, &mut refresh).unwrap();
    assert_eq!(report.raw.as_ref().unwrap().total_rows(), 18);

    let conn = open_store(&config.db_path).unwrap();
    let raw_customers: i64 = conn
        .query_row("SELECT COUNT(*) FROM raw_customers", [], |r| r.get(0))
        .unwrap();
    assert_eq!(raw_customers, 6);
}

#[test]
fn resume_from_prod_reuses_existing_staging() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config_in(tmp.path());
    seed_inputs(&config.raw_dir);

    let mut first = RunContext::new(RunMode::Incremental, None, Layer::Raw);
    orchestrator::run(&config, &mut first).unwrap();

    // Drop a new raw partition, then resume from prod: the new file must
    // not be picked up, and the aggregates must still match staging.
    write_partition(&config.raw_dir, "orders", "2025-03-05", &[
        r#"{"order_id": 200, "customer_id": 1, "order_date": "2025-03-05", "order_status": "completed", "total_amount": 99.0}"#,
    ]);
    let mut resumed = RunContext::new(RunMode::Incremental, None, Layer::Prod);
    let report = orchestrator::run(&config, &mut resumed).unwrap();
    assert_eq!(report.layers_completed, vec![Layer::Prod]);
    assert!(report.raw.is_none());
    assert!(report.staging.is_none());

    let conn = open_store(&config.db_path).unwrap();
    let late_orders: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM raw_orders WHERE partition_date = '2025-03-05'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(late_orders, 0);
}

#[test]
fn rejections_carry_entity_key_and_reason() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config_in(tmp.path());
    seed_inputs(&config.raw_dir);

    let mut ctx = RunContext::new(RunMode::Incremental, None, Layer::Raw);
    let report = orchestrator::run(&config, &mut ctx).unwrap();

    let order_rejection = report
        .rejections
        .iter()
        .find(|r| r.entity == EntityKind::Orders)
        .unwrap();
    assert_eq!(order_rejection.business_key, Some(102));
}
