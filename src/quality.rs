//! Quality Validator
//!
//! Read-only health report over all three layers. Runs a fixed list of
//! checks and classifies each as pass / warn / fail; nothing here mutates
//! the store. Intended to run after a pipeline run, or standalone against
//! any existing store.

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::Serialize;
use tracing::info;

use crate::config::QualityThresholds;
use crate::model::EntityKind;
use crate::rules::{rules_for, VALID_CUSTOMER_SEGMENTS, VALID_ORDER_STATUSES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub struct QualityReport {
    pub checks: Vec<CheckResult>,
}

impl QualityReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.status != CheckStatus::Fail)
    }

    pub fn failures(&self) -> usize {
        self.checks
            .iter()
            .filter(|c| c.status == CheckStatus::Fail)
            .count()
    }

    fn push(&mut self, name: &str, status: CheckStatus, detail: String) {
        self.checks.push(CheckResult {
            name: name.to_string(),
            status,
            detail,
        });
    }
}

fn count(conn: &Connection, sql: &str) -> Result<i64> {
    conn.query_row(sql, [], |row| row.get(0))
        .with_context(|| format!("quality query: {sql}"))
}

/// Run every check against the store.
pub fn validate(conn: &Connection, thresholds: &QualityThresholds) -> Result<QualityReport> {
    let mut report = QualityReport { checks: Vec::new() };

    check_layer_population(conn, &mut report)?;
    check_data_loss(conn, thresholds, &mut report)?;
    check_staging_integrity(conn, &mut report)?;
    check_revenue_reconciliation(conn, thresholds, &mut report)?;
    check_timestamps(conn, &mut report)?;

    info!(
        checks = report.checks.len(),
        failures = report.failures(),
        "quality validation complete"
    );
    Ok(report)
}

/// Every raw and staging table should hold data once the pipeline has run.
fn check_layer_population(conn: &Connection, report: &mut QualityReport) -> Result<()> {
    for &kind in EntityKind::dependency_order() {
        let raw = count(conn, &format!("SELECT COUNT(*) FROM {}", kind.raw_table()))?;
        let stg = count(
            conn,
            &format!("SELECT COUNT(*) FROM {}", kind.staging_table()),
        )?;
        let status = if raw == 0 || stg == 0 {
            CheckStatus::Fail
        } else {
            CheckStatus::Pass
        };
        report.push(
            &format!("populated:{kind}"),
            status,
            format!("raw={raw} staging={stg}"),
        );
    }
    Ok(())
}

/// Raw-to-staging loss per entity, measured against distinct business keys
/// (raw duplicates are expected and not loss).
fn check_data_loss(
    conn: &Connection,
    thresholds: &QualityThresholds,
    report: &mut QualityReport,
) -> Result<()> {
    for &kind in EntityKind::dependency_order() {
        let distinct_raw = count(
            conn,
            &format!(
                "SELECT COUNT(DISTINCT {key}) FROM {raw} WHERE {key} IS NOT NULL",
                key = kind.business_key(),
                raw = kind.raw_table()
            ),
        )?;
        let staged = count(
            conn,
            &format!("SELECT COUNT(*) FROM {}", kind.staging_table()),
        )?;
        if distinct_raw == 0 {
            report.push(
                &format!("data_loss:{kind}"),
                CheckStatus::Warn,
                "no raw keys to measure against".to_string(),
            );
            continue;
        }
        if staged > distinct_raw {
            report.push(
                &format!("data_loss:{kind}"),
                CheckStatus::Fail,
                format!("staging holds {staged} rows but raw only has {distinct_raw} keys"),
            );
            continue;
        }
        let loss = 1.0 - staged as f64 / distinct_raw as f64;
        let status = if loss > thresholds.max_data_loss {
            CheckStatus::Fail
        } else if loss > 0.0 {
            CheckStatus::Warn
        } else {
            CheckStatus::Pass
        };
        report.push(
            &format!("data_loss:{kind}"),
            status,
            format!("lost {:.1}% of {distinct_raw} keys (max {:.1}%)",
                loss * 100.0, thresholds.max_data_loss * 100.0),
        );
    }
    Ok(())
}

/// Staging-layer invariants: unique emails, closed references, valid
/// domains, consistent derived line totals.
fn check_staging_integrity(conn: &Connection, report: &mut QualityReport) -> Result<()> {
    let mut dup_keys = 0i64;
    for &kind in EntityKind::dependency_order() {
        dup_keys += count(
            conn,
            &format!(
                "SELECT COUNT(*) FROM (SELECT {key} FROM {table} GROUP BY {key} HAVING COUNT(*) > 1)",
                key = kind.business_key(),
                table = kind.staging_table()
            ),
        )?;
    }
    report.push(
        "unique_business_keys",
        if dup_keys == 0 { CheckStatus::Pass } else { CheckStatus::Fail },
        format!("{dup_keys} duplicated business keys"),
    );

    let dup_emails = count(
        conn,
        "SELECT COUNT(*) FROM (SELECT email FROM stg_customers GROUP BY email HAVING COUNT(*) > 1)",
    )?;
    report.push(
        "unique_emails",
        if dup_emails == 0 { CheckStatus::Pass } else { CheckStatus::Fail },
        format!("{dup_emails} duplicated addresses"),
    );

    // Orphan and required-field checks come straight from the rules
    // registry, so a new entity or reference is covered automatically.
    for &kind in EntityKind::dependency_order() {
        let rules = rules_for(kind);
        for (fk, parent) in rules.parents {
            let orphans = count(
                conn,
                &format!(
                    "SELECT COUNT(*) FROM {child} c \
                     LEFT JOIN {parent_table} p ON p.{parent_key} = c.{fk} \
                     WHERE p.{parent_key} IS NULL",
                    child = kind.staging_table(),
                    parent_table = parent.staging_table(),
                    parent_key = parent.business_key(),
                ),
            )?;
            report.push(
                &format!("orphans:{kind}:{fk}"),
                if orphans == 0 { CheckStatus::Pass } else { CheckStatus::Fail },
                format!("{orphans} orphaned rows"),
            );
        }
        let mut nulls = 0i64;
        for field in rules.required {
            nulls += count(
                conn,
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE {field} IS NULL",
                    kind.staging_table()
                ),
            )?;
        }
        report.push(
            &format!("required_fields:{kind}"),
            if nulls == 0 { CheckStatus::Pass } else { CheckStatus::Fail },
            format!("{nulls} nulls across required fields"),
        );
    }

    let status_list = VALID_ORDER_STATUSES
        .iter()
        .map(|s| format!("'{s}'"))
        .collect::<Vec<_>>()
        .join(", ");
    let bad_statuses = count(
        conn,
        &format!("SELECT COUNT(*) FROM stg_orders WHERE order_status NOT IN ({status_list})"),
    )?;
    report.push(
        "valid_statuses",
        if bad_statuses == 0 { CheckStatus::Pass } else { CheckStatus::Fail },
        format!("{bad_statuses} orders outside the accepted statuses"),
    );

    let segment_list = VALID_CUSTOMER_SEGMENTS
        .iter()
        .map(|s| format!("'{s}'"))
        .collect::<Vec<_>>()
        .join(", ");
    let bad_segments = count(
        conn,
        &format!(
            "SELECT COUNT(*) FROM stg_customers WHERE customer_segment NOT IN ({segment_list})"
        ),
    )?;
    report.push(
        "valid_segments",
        if bad_segments == 0 { CheckStatus::Pass } else { CheckStatus::Fail },
        format!("{bad_segments} customers outside the accepted segments"),
    );

    // SQLite has no regex, so staged addresses are re-checked in Rust.
    let bad_emails = {
        let mut stmt = conn.prepare("SELECT email FROM stg_customers")?;
        let emails = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("load staged emails")?;
        emails.iter().filter(|e| !crate::rules::is_valid_email(e)).count()
    };
    report.push(
        "valid_emails",
        if bad_emails == 0 { CheckStatus::Pass } else { CheckStatus::Fail },
        format!("{bad_emails} staged addresses fail the format rule"),
    );

    let negatives = count(
        conn,
        "SELECT (SELECT COUNT(*) FROM stg_products WHERE price < 0 OR cost < 0) \
              + (SELECT COUNT(*) FROM stg_orders WHERE total_amount < 0) \
              + (SELECT COUNT(*) FROM stg_order_items WHERE unit_price < 0 OR line_total < 0)",
    )?;
    report.push(
        "non_negative_money",
        if negatives == 0 { CheckStatus::Pass } else { CheckStatus::Fail },
        format!("{negatives} rows with negative monetary fields"),
    );

    let future_orders = count(
        conn,
        "SELECT COUNT(*) FROM stg_orders WHERE order_date > date('now')",
    )?;
    report.push(
        "order_dates_not_future",
        if future_orders == 0 { CheckStatus::Pass } else { CheckStatus::Fail },
        format!("{future_orders} orders dated after today"),
    );

    // A free product is legal but usually a load error, so it only warns.
    let zero_priced = count(conn, "SELECT COUNT(*) FROM stg_products WHERE price = 0")?;
    report.push(
        "zero_priced_products",
        if zero_priced == 0 { CheckStatus::Pass } else { CheckStatus::Warn },
        format!("{zero_priced} products priced at zero"),
    );

    let bad_discounts = count(
        conn,
        "SELECT COUNT(*) FROM stg_order_items \
         WHERE quantity <= 0 OR discount_percent < 0 OR discount_percent > 100",
    )?;
    report.push(
        "quantity_and_discount_bounds",
        if bad_discounts == 0 { CheckStatus::Pass } else { CheckStatus::Fail },
        format!("{bad_discounts} items outside quantity/discount bounds"),
    );

    let bad_line_totals = count(
        conn,
        "SELECT COUNT(*) FROM stg_order_items \
         WHERE ABS(line_total - ROUND(quantity * unit_price * (1.0 - discount_percent / 100.0), 2)) > 0.01",
    )?;
    report.push(
        "line_totals",
        if bad_line_totals == 0 { CheckStatus::Pass } else { CheckStatus::Fail },
        format!("{bad_line_totals} items with inconsistent line totals"),
    );

    Ok(())
}

/// Revenue must agree across layers within tolerance.
fn check_revenue_reconciliation(
    conn: &Connection,
    thresholds: &QualityThresholds,
    report: &mut QualityReport,
) -> Result<()> {
    let within = |a: f64, b: f64| -> bool {
        let scale = a.abs().max(b.abs()).max(1.0);
        (a - b).abs() / scale <= thresholds.revenue_tolerance
    };
    let sum = |sql: &str| -> Result<f64> {
        conn.query_row(sql, [], |row| row.get::<_, Option<f64>>(0))
            .map(|v| v.unwrap_or(0.0))
            .with_context(|| format!("quality query: {sql}"))
    };

    let staging_revenue = sum(
        "SELECT SUM(total_amount) FROM stg_orders WHERE order_status = 'completed'",
    )?;
    let daily_revenue = sum("SELECT SUM(total_revenue) FROM prod_daily_sales")?;
    report.push(
        "revenue:staging_vs_daily",
        if within(staging_revenue, daily_revenue) { CheckStatus::Pass } else { CheckStatus::Fail },
        format!("staging={staging_revenue:.2} daily={daily_revenue:.2}"),
    );

    let monthly_revenue = sum("SELECT SUM(total_revenue) FROM prod_monthly_sales")?;
    report.push(
        "revenue:daily_vs_monthly",
        if within(daily_revenue, monthly_revenue) { CheckStatus::Pass } else { CheckStatus::Fail },
        format!("daily={daily_revenue:.2} monthly={monthly_revenue:.2}"),
    );

    // Order headers versus their line items. The header amount comes from
    // the source, so disagreement is a data-quality smell, not corruption.
    let mismatched_orders = count(
        conn,
        "SELECT COUNT(*) FROM ( \
             SELECT o.order_id, o.total_amount, COALESCE(SUM(i.line_total), 0) AS items_total \
             FROM stg_orders o \
             LEFT JOIN stg_order_items i ON i.order_id = o.order_id \
             WHERE o.order_status = 'completed' \
             GROUP BY o.order_id \
             HAVING ABS(o.total_amount - items_total) > 0.01 \
         )",
    )?;
    report.push(
        "revenue:orders_vs_items",
        if mismatched_orders == 0 { CheckStatus::Pass } else { CheckStatus::Warn },
        format!("{mismatched_orders} completed orders disagree with their items"),
    );

    Ok(())
}

/// Lineage timestamps must be present and ordered.
fn check_timestamps(conn: &Connection, report: &mut QualityReport) -> Result<()> {
    let mut bad = 0i64;
    for &kind in EntityKind::dependency_order() {
        bad += count(
            conn,
            &format!(
                "SELECT COUNT(*) FROM {} WHERE first_seen_at_ms <= 0 \
                 OR updated_at_ms < first_seen_at_ms",
                kind.staging_table()
            ),
        )?;
        bad += count(
            conn,
            &format!("SELECT COUNT(*) FROM {} WHERE ingested_at_ms <= 0", kind.raw_table()),
        )?;
    }
    for table in [
        "prod_daily_sales",
        "prod_monthly_sales",
        "prod_daily_category_metrics",
        "prod_daily_product_metrics",
        "prod_customer_metrics",
    ] {
        bad += count(conn, &format!("SELECT COUNT(*) FROM {table} WHERE computed_at_ms <= 0"))?;
    }
    report.push(
        "timestamps",
        if bad == 0 { CheckStatus::Pass } else { CheckStatus::Fail },
        format!("{bad} rows with missing or inverted timestamps"),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;

    fn seed_healthy(conn: &Connection) {
        conn.execute_batch(
            "INSERT INTO raw_customers (customer_id, ingested_at_ms, source_file, partition_date) \
                 VALUES (1, 10, 'f', '2025-03-01'); \
             INSERT INTO raw_products (product_id, ingested_at_ms, source_file, partition_date) \
                 VALUES (10, 10, 'f', '2025-03-01'); \
             INSERT INTO raw_orders (order_id, ingested_at_ms, source_file, partition_date) \
                 VALUES (100, 10, 'f', '2025-03-01'); \
             INSERT INTO raw_order_items (order_item_id, ingested_at_ms, source_file, partition_date) \
                 VALUES (1000, 10, 'f', '2025-03-01'); \
             INSERT INTO stg_customers VALUES \
                 (1, 'Ada', 'ada@example.com', 'UK', '2025-01-01', 'Premium', 10, 10); \
             INSERT INTO stg_products VALUES (10, 'Widget', 'Tools', 5.0, 2.0, 10, 10); \
             INSERT INTO stg_orders VALUES (100, 1, '2025-03-01', 'completed', 25.0, 10, 10); \
             INSERT INTO stg_order_items VALUES (1000, 100, 10, 5, 5.0, 0.0, 25.0, 10, 10); \
             INSERT INTO prod_daily_sales VALUES ('2025-03-01', 1, 5, 25.0, 1, 25.0, 10); \
             INSERT INTO prod_monthly_sales VALUES ('2025-03', 2025, 3, 1, 5, 25.0, 1, 25.0, 10);",
        )
        .unwrap();
    }

    #[test]
    fn healthy_store_passes() {
        let conn = open_in_memory().unwrap();
        seed_healthy(&conn);
        let report = validate(&conn, &QualityThresholds::default()).unwrap();
        assert!(report.passed(), "failures: {:?}", report.checks);
    }

    #[test]
    fn excessive_data_loss_fails() {
        let conn = open_in_memory().unwrap();
        seed_healthy(&conn);
        // 9 extra raw customers that never staged: 90% loss.
        for id in 2..=10 {
            conn.execute(
                "INSERT INTO raw_customers (customer_id, ingested_at_ms, source_file, partition_date) \
                 VALUES (?1, 10, 'f', '2025-03-01')",
                [id],
            )
            .unwrap();
        }
        let report = validate(&conn, &QualityThresholds::default()).unwrap();
        assert!(!report.passed());
        let check = report
            .checks
            .iter()
            .find(|c| c.name == "data_loss:customers")
            .unwrap();
        assert_eq!(check.status, CheckStatus::Fail);
    }

    #[test]
    fn orphaned_order_fails() {
        let conn = open_in_memory().unwrap();
        seed_healthy(&conn);
        conn.execute(
            "INSERT INTO stg_orders VALUES (999, 777, '2025-03-01', 'completed', 5.0, 10, 10)",
            [],
        )
        .unwrap();
        let report = validate(&conn, &QualityThresholds::default()).unwrap();
        let check = report.checks.iter().find(|c| c.name == "orphans:orders:customer_id").unwrap();
        assert_eq!(check.status, CheckStatus::Fail);
    }

    #[test]
    fn future_order_date_fails() {
        let conn = open_in_memory().unwrap();
        seed_healthy(&conn);
        conn.execute("UPDATE stg_orders SET order_date = '2999-01-01' WHERE order_id = 100", [])
            .unwrap();
        let report = validate(&conn, &QualityThresholds::default()).unwrap();
        let check = report
            .checks
            .iter()
            .find(|c| c.name == "order_dates_not_future")
            .unwrap();
        assert_eq!(check.status, CheckStatus::Fail);
        assert!(!report.passed());
    }

    #[test]
    fn zero_priced_product_is_a_warning_only() {
        let conn = open_in_memory().unwrap();
        seed_healthy(&conn);
        conn.execute("UPDATE stg_products SET price = 0.0 WHERE product_id = 10", [])
            .unwrap();
        let report = validate(&conn, &QualityThresholds::default()).unwrap();
        let check = report
            .checks
            .iter()
            .find(|c| c.name == "zero_priced_products")
            .unwrap();
        assert_eq!(check.status, CheckStatus::Warn);
        assert!(report.passed());
    }

    #[test]
    fn revenue_drift_between_layers_fails() {
        let conn = open_in_memory().unwrap();
        seed_healthy(&conn);
        conn.execute("UPDATE prod_daily_sales SET total_revenue = 999.0", [])
            .unwrap();
        let report = validate(&conn, &QualityThresholds::default()).unwrap();
        let check = report
            .checks
            .iter()
            .find(|c| c.name == "revenue:staging_vs_daily")
            .unwrap();
        assert_eq!(check.status, CheckStatus::Fail);
    }

    #[test]
    fn header_item_disagreement_is_a_warning_only() {
        let conn = open_in_memory().unwrap();
        seed_healthy(&conn);
        conn.execute("UPDATE stg_order_items SET line_total = 20.0, unit_price = 4.0", [])
            .unwrap();
        let report = validate(&conn, &QualityThresholds::default()).unwrap();
        let check = report
            .checks
            .iter()
            .find(|c| c.name == "revenue:orders_vs_items")
            .unwrap();
        assert_eq!(check.status, CheckStatus::Warn);
        // A warning alone does not fail the report.
        assert!(report.passed());
    }
}
