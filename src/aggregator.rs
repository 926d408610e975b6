//! Production Aggregator
//!
//! Recomputes the derived prod tables from staging:
//! - `prod_daily_sales`        per order date
//! - `prod_monthly_sales`      per month, rolled up from the daily table
//! - `prod_daily_category_metrics`  per (date, category)
//! - `prod_daily_product_metrics`   per (date, product)
//! - `prod_customer_metrics`   per customer, always a full recompute
//!
//! Only completed orders count toward sales metrics. Every monetary value
//! is rounded to cents. Each table is rewritten inside its own transaction
//! (delete the targeted range, insert fresh rows), so re-running over the
//! same staging data is a no-op apart from `computed_at_ms`.
//!
//! Orphaned references in staging would silently skew the aggregates, so
//! the run fails up front if any are found.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::info;

use crate::context::{DateRange, ProdSummary, ProdTableSummary, RunContext};
use crate::db::now_ms;
use crate::model::{round_money, EntityKind};
use crate::rules::rules_for;

/// Effective date bounds: an unbounded run covers everything.
fn bounds(range: Option<DateRange>) -> (String, String) {
    match range {
        Some(range) => (range.start.to_string(), range.end.to_string()),
        None => ("0000-01-01".to_string(), "9999-12-31".to_string()),
    }
}

/// Recompute all prod tables for the context's date range.
pub fn aggregate(conn: &mut Connection, ctx: &RunContext) -> Result<ProdSummary> {
    check_preconditions(conn)?;
    let (start, end) = bounds(ctx.date_range);

    let mut summary = ProdSummary::default();
    for (table, rows) in [
        ("prod_daily_sales", daily_sales(conn, &start, &end)?),
        ("prod_monthly_sales", monthly_sales(conn, &start, &end)?),
        (
            "prod_daily_category_metrics",
            daily_category_metrics(conn, &start, &end)?,
        ),
        (
            "prod_daily_product_metrics",
            daily_product_metrics(conn, &start, &end)?,
        ),
        ("prod_customer_metrics", customer_metrics(conn)?),
    ] {
        info!(table, rows, "aggregated");
        summary.tables.push(ProdTableSummary {
            table: table.to_string(),
            rows_written: rows,
        });
    }
    Ok(summary)
}

/// Staging is supposed to be referentially closed; aggregating on top of
/// orphans would produce wrong numbers, so fail fast instead.
fn check_preconditions(conn: &Connection) -> Result<()> {
    for &kind in EntityKind::dependency_order() {
        for (fk, parent) in rules_for(kind).parents {
            let sql = format!(
                "SELECT COUNT(*) FROM {child} c \
                 LEFT JOIN {parent_table} p ON p.{parent_key} = c.{fk} \
                 WHERE p.{parent_key} IS NULL",
                child = kind.staging_table(),
                parent_table = parent.staging_table(),
                parent_key = parent.business_key(),
            );
            let orphans: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
            if orphans > 0 {
                bail!("staging is not referentially closed: {orphans} {kind} rows reference a missing {fk}");
            }
        }
    }
    Ok(())
}

// =============================================================================
// DAILY AND MONTHLY SALES
// =============================================================================

struct SalesRow {
    period: String,
    total_orders: i64,
    total_items: i64,
    total_revenue: f64,
    total_customers: i64,
}

impl SalesRow {
    fn avg_order_value(&self) -> f64 {
        if self.total_orders == 0 {
            0.0
        } else {
            round_money(self.total_revenue / self.total_orders as f64)
        }
    }
}

fn daily_sales(conn: &mut Connection, start: &str, end: &str) -> Result<u64> {
    let rows = {
        let mut stmt = conn.prepare(
            "WITH items_per_order AS ( \
                 SELECT order_id, SUM(quantity) AS items FROM stg_order_items GROUP BY order_id \
             ) \
             SELECT o.order_date, \
                    COUNT(o.order_id), \
                    COALESCE(SUM(ipo.items), 0), \
                    SUM(o.total_amount), \
                    COUNT(DISTINCT o.customer_id) \
             FROM stg_orders o \
             LEFT JOIN items_per_order ipo ON ipo.order_id = o.order_id \
             WHERE o.order_status = 'completed' AND o.order_date BETWEEN ?1 AND ?2 \
             GROUP BY o.order_date ORDER BY o.order_date",
        )?;
        let mapped = stmt.query_map(params![start, end], |row| {
            Ok(SalesRow {
                period: row.get(0)?,
                total_orders: row.get(1)?,
                total_items: row.get(2)?,
                total_revenue: row.get(3)?,
                total_customers: row.get(4)?,
            })
        })?;
        mapped
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("compute daily sales")?
    };

    let now = now_ms();
    let tx = conn.transaction()?;
    tx.execute(
        "DELETE FROM prod_daily_sales WHERE order_date BETWEEN ?1 AND ?2",
        params![start, end],
    )?;
    {
        let mut insert = tx.prepare(
            "INSERT INTO prod_daily_sales \
             (order_date, total_orders, total_items, total_revenue, total_customers, \
              avg_order_value, computed_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        for row in &rows {
            insert.execute(params![
                row.period,
                row.total_orders,
                row.total_items,
                round_money(row.total_revenue),
                row.total_customers,
                row.avg_order_value(),
                now,
            ])?;
        }
    }
    tx.commit().context("commit daily sales")?;
    Ok(rows.len() as u64)
}

/// Months are rolled up from the daily table, never recomputed
/// independently, so monthly revenue always reconciles with the sum of its
/// days. Distinct customer counts cannot be summed across days and come
/// from staging directly.
fn monthly_sales(conn: &mut Connection, start: &str, end: &str) -> Result<u64> {
    // Any month overlapping the range is rewritten whole.
    let month_start = format!("{}-01", &start[..7.min(start.len())]);
    let month_end = format!("{}-31", &end[..7.min(end.len())]);

    let rows = {
        let mut stmt = conn.prepare(
            "SELECT substr(order_date, 1, 7) AS ym, \
                    SUM(total_orders), SUM(total_items), SUM(total_revenue) \
             FROM prod_daily_sales \
             WHERE order_date BETWEEN ?1 AND ?2 \
             GROUP BY ym ORDER BY ym",
        )?;
        let mapped = stmt.query_map(params![month_start, month_end], |row| {
            Ok(SalesRow {
                period: row.get(0)?,
                total_orders: row.get(1)?,
                total_items: row.get(2)?,
                total_revenue: row.get(3)?,
                total_customers: 0,
            })
        })?;
        mapped
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("roll up monthly sales")?
    };

    let now = now_ms();
    let tx = conn.transaction()?;
    tx.execute(
        "DELETE FROM prod_monthly_sales WHERE year_month BETWEEN substr(?1, 1, 7) AND substr(?2, 1, 7)",
        params![month_start, month_end],
    )?;
    {
        let mut customers_stmt = tx.prepare(
            "SELECT COUNT(DISTINCT customer_id) FROM stg_orders \
             WHERE order_status = 'completed' AND substr(order_date, 1, 7) = ?1",
        )?;
        let mut insert = tx.prepare(
            "INSERT INTO prod_monthly_sales \
             (year_month, year, month, total_orders, total_items, total_revenue, \
              total_customers, avg_order_value, computed_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        for row in &rows {
            let year: i64 = row.period[..4].parse().context("month key year")?;
            let month: i64 = row.period[5..7].parse().context("month key month")?;
            let total_customers: i64 =
                customers_stmt.query_row(params![row.period], |r| r.get(0))?;
            insert.execute(params![
                row.period,
                year,
                month,
                row.total_orders,
                row.total_items,
                round_money(row.total_revenue),
                total_customers,
                row.avg_order_value(),
                now,
            ])?;
        }
    }
    tx.commit().context("commit monthly sales")?;
    Ok(rows.len() as u64)
}

// =============================================================================
// CATEGORY AND PRODUCT METRICS
// =============================================================================

fn daily_category_metrics(conn: &mut Connection, start: &str, end: &str) -> Result<u64> {
    struct Row {
        order_date: String,
        category: String,
        total_orders: i64,
        total_items: i64,
        total_revenue: f64,
        unique_customers: i64,
        unique_products: i64,
    }

    let rows = {
        let mut stmt = conn.prepare(
            "SELECT o.order_date, p.category, \
                    COUNT(DISTINCT o.order_id), SUM(i.quantity), SUM(i.line_total), \
                    COUNT(DISTINCT o.customer_id), COUNT(DISTINCT i.product_id) \
             FROM stg_order_items i \
             JOIN stg_orders o ON o.order_id = i.order_id \
             JOIN stg_products p ON p.product_id = i.product_id \
             WHERE o.order_status = 'completed' AND o.order_date BETWEEN ?1 AND ?2 \
             GROUP BY o.order_date, p.category ORDER BY o.order_date, p.category",
        )?;
        let mapped = stmt.query_map(params![start, end], |row| {
            Ok(Row {
                order_date: row.get(0)?,
                category: row.get(1)?,
                total_orders: row.get(2)?,
                total_items: row.get(3)?,
                total_revenue: row.get(4)?,
                unique_customers: row.get(5)?,
                unique_products: row.get(6)?,
            })
        })?;
        mapped
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("compute category metrics")?
    };

    let now = now_ms();
    let tx = conn.transaction()?;
    tx.execute(
        "DELETE FROM prod_daily_category_metrics WHERE order_date BETWEEN ?1 AND ?2",
        params![start, end],
    )?;
    {
        let mut insert = tx.prepare(
            "INSERT INTO prod_daily_category_metrics \
             (order_date, category, total_orders, total_items, total_revenue, \
              unique_customers, unique_products, computed_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for row in &rows {
            insert.execute(params![
                row.order_date,
                row.category,
                row.total_orders,
                row.total_items,
                round_money(row.total_revenue),
                row.unique_customers,
                row.unique_products,
                now,
            ])?;
        }
    }
    tx.commit().context("commit category metrics")?;
    Ok(rows.len() as u64)
}

fn daily_product_metrics(conn: &mut Connection, start: &str, end: &str) -> Result<u64> {
    struct Row {
        order_date: String,
        product_id: i64,
        product_name: String,
        category: String,
        total_orders: i64,
        total_quantity: i64,
        total_revenue: f64,
        unique_customers: i64,
    }

    let rows = {
        let mut stmt = conn.prepare(
            "SELECT o.order_date, p.product_id, p.product_name, p.category, \
                    COUNT(DISTINCT o.order_id), SUM(i.quantity), SUM(i.line_total), \
                    COUNT(DISTINCT o.customer_id) \
             FROM stg_order_items i \
             JOIN stg_orders o ON o.order_id = i.order_id \
             JOIN stg_products p ON p.product_id = i.product_id \
             WHERE o.order_status = 'completed' AND o.order_date BETWEEN ?1 AND ?2 \
             GROUP BY o.order_date, p.product_id ORDER BY o.order_date, p.product_id",
        )?;
        let mapped = stmt.query_map(params![start, end], |row| {
            Ok(Row {
                order_date: row.get(0)?,
                product_id: row.get(1)?,
                product_name: row.get(2)?,
                category: row.get(3)?,
                total_orders: row.get(4)?,
                total_quantity: row.get(5)?,
                total_revenue: row.get(6)?,
                unique_customers: row.get(7)?,
            })
        })?;
        mapped
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("compute product metrics")?
    };

    let now = now_ms();
    let tx = conn.transaction()?;
    tx.execute(
        "DELETE FROM prod_daily_product_metrics WHERE order_date BETWEEN ?1 AND ?2",
        params![start, end],
    )?;
    {
        let mut insert = tx.prepare(
            "INSERT INTO prod_daily_product_metrics \
             (order_date, product_id, product_name, category, total_orders, \
              total_quantity, total_revenue, unique_customers, computed_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        for row in &rows {
            insert.execute(params![
                row.order_date,
                row.product_id,
                row.product_name,
                row.category,
                row.total_orders,
                row.total_quantity,
                round_money(row.total_revenue),
                row.unique_customers,
                now,
            ])?;
        }
    }
    tx.commit().context("commit product metrics")?;
    Ok(rows.len() as u64)
}

// =============================================================================
// CUSTOMER METRICS
// =============================================================================

/// Denormalized per-customer rollup. Recency fields shift with the clock,
/// so this table is always recomputed in full regardless of date range.
fn customer_metrics(conn: &mut Connection) -> Result<u64> {
    struct Row {
        customer_id: i64,
        customer_name: String,
        customer_segment: String,
        first_order_date: Option<String>,
        last_order_date: Option<String>,
        total_orders: i64,
        total_items: i64,
        total_revenue: f64,
    }

    let rows = {
        let mut stmt = conn.prepare(
            "WITH items_per_order AS ( \
                 SELECT order_id, SUM(quantity) AS items FROM stg_order_items GROUP BY order_id \
             ), \
             completed AS ( \
                 SELECT o.customer_id, o.order_id, o.order_date, o.total_amount, \
                        COALESCE(ipo.items, 0) AS items \
                 FROM stg_orders o \
                 LEFT JOIN items_per_order ipo ON ipo.order_id = o.order_id \
                 WHERE o.order_status = 'completed' \
             ) \
             SELECT c.customer_id, c.customer_name, c.customer_segment, \
                    MIN(x.order_date), MAX(x.order_date), \
                    COUNT(x.order_id), COALESCE(SUM(x.items), 0), \
                    COALESCE(SUM(x.total_amount), 0) \
             FROM stg_customers c \
             LEFT JOIN completed x ON x.customer_id = c.customer_id \
             GROUP BY c.customer_id ORDER BY c.customer_id",
        )?;
        let mapped = stmt.query_map([], |row| {
            Ok(Row {
                customer_id: row.get(0)?,
                customer_name: row.get(1)?,
                customer_segment: row.get(2)?,
                first_order_date: row.get(3)?,
                last_order_date: row.get(4)?,
                total_orders: row.get(5)?,
                total_items: row.get(6)?,
                total_revenue: row.get(7)?,
            })
        })?;
        mapped
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("compute customer metrics")?
    };

    let today = Utc::now().date_naive();
    let days_since = |date: &Option<String>| -> Option<i64> {
        date.as_deref()
            .and_then(crate::rules::parse_date)
            .map(|d| (today - d).num_days())
    };

    let now = now_ms();
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM prod_customer_metrics", [])?;
    {
        let mut insert = tx.prepare(
            "INSERT INTO prod_customer_metrics \
             (customer_id, customer_name, customer_segment, first_order_date, \
              last_order_date, total_orders, total_items, total_revenue, \
              avg_order_value, days_since_first_order, days_since_last_order, \
              computed_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )?;
        for row in &rows {
            let avg = if row.total_orders == 0 {
                0.0
            } else {
                round_money(row.total_revenue / row.total_orders as f64)
            };
            insert.execute(params![
                row.customer_id,
                row.customer_name,
                row.customer_segment,
                row.first_order_date,
                row.last_order_date,
                row.total_orders,
                row.total_items,
                round_money(row.total_revenue),
                avg,
                days_since(&row.first_order_date),
                days_since(&row.last_order_date),
                now,
            ])?;
        }
    }
    tx.commit().context("commit customer metrics")?;
    Ok(rows.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Layer, RunContext, RunMode};
    use crate::db::open_in_memory;

    fn seed_staging(conn: &Connection) {
        conn.execute_batch(
            "INSERT INTO stg_customers VALUES \
                 (1, 'Ada', 'ada@example.com', 'DE', '2025-01-01', 'Premium', 0, 0), \
                 (2, 'Bob', 'bob@example.com', 'US', '2025-01-02', 'Basic', 0, 0); \
             INSERT INTO stg_products VALUES \
                 (10, 'Widget', 'Tools', 5.0, 2.0, 0, 0), \
                 (11, 'Gadget', 'Electronics', 20.0, 8.0, 0, 0); \
             INSERT INTO stg_orders VALUES \
                 (100, 1, '2025-03-01', 'completed', 25.0, 0, 0), \
                 (101, 2, '2025-03-01', 'completed', 40.0, 0, 0), \
                 (102, 1, '2025-03-02', 'pending', 99.0, 0, 0), \
                 (103, 2, '2025-04-05', 'completed', 20.0, 0, 0); \
             INSERT INTO stg_order_items VALUES \
                 (1000, 100, 10, 5, 5.0, 0.0, 25.0, 0, 0), \
                 (1001, 101, 11, 2, 20.0, 0.0, 40.0, 0, 0), \
                 (1002, 103, 10, 4, 5.0, 0.0, 20.0, 0, 0);",
        )
        .unwrap();
    }

    fn run_ctx() -> RunContext {
        RunContext::new(RunMode::Incremental, None, Layer::Prod)
    }

    #[test]
    fn daily_sales_counts_only_completed_orders() {
        let mut conn = open_in_memory().unwrap();
        seed_staging(&conn);
        aggregate(&mut conn, &run_ctx()).unwrap();

        let (orders, items, revenue, customers, aov): (i64, i64, f64, i64, f64) = conn
            .query_row(
                "SELECT total_orders, total_items, total_revenue, total_customers, avg_order_value \
                 FROM prod_daily_sales WHERE order_date = '2025-03-01'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
            )
            .unwrap();
        assert_eq!(orders, 2);
        assert_eq!(items, 7);
        assert_eq!(revenue, 65.0);
        assert_eq!(customers, 2);
        assert_eq!(aov, 32.5);

        // The pending order's date must not appear at all.
        let pending_days: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM prod_daily_sales WHERE order_date = '2025-03-02'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(pending_days, 0);
    }

    #[test]
    fn monthly_reconciles_with_daily() {
        let mut conn = open_in_memory().unwrap();
        seed_staging(&conn);
        aggregate(&mut conn, &run_ctx()).unwrap();

        let monthly: f64 = conn
            .query_row(
                "SELECT total_revenue FROM prod_monthly_sales WHERE year_month = '2025-03'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        let daily_sum: f64 = conn
            .query_row(
                "SELECT SUM(total_revenue) FROM prod_daily_sales WHERE order_date LIKE '2025-03%'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(monthly, daily_sum);

        let (year, month): (i64, i64) = conn
            .query_row(
                "SELECT year, month FROM prod_monthly_sales WHERE year_month = '2025-04'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!((year, month), (2025, 4));
    }

    #[test]
    fn customer_metrics_cover_customers_without_orders() {
        let mut conn = open_in_memory().unwrap();
        seed_staging(&conn);
        conn.execute(
            "INSERT INTO stg_customers VALUES \
             (3, 'Eve', 'eve@example.com', 'FR', '2025-02-01', 'Standard', 0, 0)",
            [],
        )
        .unwrap();
        aggregate(&mut conn, &run_ctx()).unwrap();

        let (orders, revenue, first): (i64, f64, Option<String>) = conn
            .query_row(
                "SELECT total_orders, total_revenue, first_order_date \
                 FROM prod_customer_metrics WHERE customer_id = 3",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(orders, 0);
        assert_eq!(revenue, 0.0);
        assert!(first.is_none());

        // Ada: completed orders 100 only (102 is pending).
        let (orders, revenue): (i64, f64) = conn
            .query_row(
                "SELECT total_orders, total_revenue FROM prod_customer_metrics WHERE customer_id = 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(orders, 1);
        assert_eq!(revenue, 25.0);
    }

    #[test]
    fn bounded_range_leaves_other_dates_untouched() {
        let mut conn = open_in_memory().unwrap();
        seed_staging(&conn);
        aggregate(&mut conn, &run_ctx()).unwrap();

        // Re-aggregate only April; March rows stay as computed before.
        let march_before: i64 = conn
            .query_row(
                "SELECT computed_at_ms FROM prod_daily_sales WHERE order_date = '2025-03-01'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        let range = DateRange::new(
            chrono::NaiveDate::from_ymd_opt(2025, 4, 1).unwrap(),
            chrono::NaiveDate::from_ymd_opt(2025, 4, 30).unwrap(),
        );
        let ctx = RunContext::new(RunMode::Incremental, Some(range), Layer::Prod);
        aggregate(&mut conn, &ctx).unwrap();

        let march_after: i64 = conn
            .query_row(
                "SELECT computed_at_ms FROM prod_daily_sales WHERE order_date = '2025-03-01'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(march_before, march_after);

        let april_rows: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM prod_daily_sales WHERE order_date LIKE '2025-04%'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(april_rows, 1);
    }

    #[test]
    fn orphaned_staging_fails_the_stage() {
        let mut conn = open_in_memory().unwrap();
        seed_staging(&conn);
        conn.execute(
            "INSERT INTO stg_orders VALUES (999, 777, '2025-03-01', 'completed', 5.0, 0, 0)",
            [],
        )
        .unwrap();
        let err = aggregate(&mut conn, &run_ctx()).unwrap_err();
        assert!(err.to_string().contains("referentially closed"), "{err}");
    }

    #[test]
    fn rerun_is_idempotent() {
        let mut conn = open_in_memory().unwrap();
        seed_staging(&conn);
        aggregate(&mut conn, &run_ctx()).unwrap();
        aggregate(&mut conn, &run_ctx()).unwrap();

        let days: i64 = conn
            .query_row("SELECT COUNT(*) FROM prod_daily_sales", [], |r| r.get(0))
            .unwrap();
        assert_eq!(days, 2);
        let months: i64 = conn
            .query_row("SELECT COUNT(*) FROM prod_monthly_sales", [], |r| r.get(0))
            .unwrap();
        assert_eq!(months, 2);
    }
}
