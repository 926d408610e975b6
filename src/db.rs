//! Store Access
//!
//! Opens the SQLite store and initializes the raw/staging/prod tables.
//! Raw tables are append-only; staging tables are keyed by business key;
//! prod tables are keyed by their natural aggregate key. All timestamps
//! are assigned explicitly by the engine (epoch millis) - nothing relies
//! on database-side triggers.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

const SCHEMA_SQL: &str = r#"
-- Raw layer (append-only, as-ingested plus lineage metadata)
CREATE TABLE IF NOT EXISTS raw_customers (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    customer_id INTEGER,
    customer_name TEXT,
    email TEXT,
    country TEXT,
    signup_date TEXT,
    customer_segment TEXT,
    ingested_at_ms INTEGER NOT NULL,
    source_file TEXT NOT NULL,
    partition_date TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS raw_products (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    product_id INTEGER,
    product_name TEXT,
    category TEXT,
    price REAL,
    cost REAL,
    ingested_at_ms INTEGER NOT NULL,
    source_file TEXT NOT NULL,
    partition_date TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS raw_orders (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    order_id INTEGER,
    customer_id INTEGER,
    order_date TEXT,
    order_status TEXT,
    total_amount REAL,
    ingested_at_ms INTEGER NOT NULL,
    source_file TEXT NOT NULL,
    partition_date TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS raw_order_items (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    order_item_id INTEGER,
    order_id INTEGER,
    product_id INTEGER,
    quantity INTEGER,
    unit_price REAL,
    discount_percent REAL,
    ingested_at_ms INTEGER NOT NULL,
    source_file TEXT NOT NULL,
    partition_date TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_raw_customers_partition ON raw_customers(partition_date);
CREATE INDEX IF NOT EXISTS idx_raw_products_partition ON raw_products(partition_date);
CREATE INDEX IF NOT EXISTS idx_raw_orders_partition ON raw_orders(partition_date);
CREATE INDEX IF NOT EXISTS idx_raw_order_items_partition ON raw_order_items(partition_date);

-- Staging layer (one canonical row per business key)
CREATE TABLE IF NOT EXISTS stg_customers (
    customer_id INTEGER PRIMARY KEY,
    customer_name TEXT NOT NULL,
    email TEXT NOT NULL UNIQUE,
    country TEXT NOT NULL,
    signup_date TEXT NOT NULL,
    customer_segment TEXT NOT NULL,
    first_seen_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS stg_products (
    product_id INTEGER PRIMARY KEY,
    product_name TEXT NOT NULL,
    category TEXT NOT NULL,
    price REAL NOT NULL,
    cost REAL NOT NULL,
    first_seen_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS stg_orders (
    order_id INTEGER PRIMARY KEY,
    customer_id INTEGER NOT NULL,
    order_date TEXT NOT NULL,
    order_status TEXT NOT NULL,
    total_amount REAL NOT NULL,
    first_seen_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS stg_order_items (
    order_item_id INTEGER PRIMARY KEY,
    order_id INTEGER NOT NULL,
    product_id INTEGER NOT NULL,
    quantity INTEGER NOT NULL,
    unit_price REAL NOT NULL,
    discount_percent REAL NOT NULL,
    line_total REAL NOT NULL,
    first_seen_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_stg_orders_date ON stg_orders(order_date);
CREATE INDEX IF NOT EXISTS idx_stg_orders_customer ON stg_orders(customer_id);
CREATE INDEX IF NOT EXISTS idx_stg_order_items_order ON stg_order_items(order_id);
CREATE INDEX IF NOT EXISTS idx_stg_order_items_product ON stg_order_items(product_id);

-- Production layer (fully derived aggregates, overwritten per range)
CREATE TABLE IF NOT EXISTS prod_daily_sales (
    order_date TEXT PRIMARY KEY,
    total_orders INTEGER NOT NULL,
    total_items INTEGER NOT NULL,
    total_revenue REAL NOT NULL,
    total_customers INTEGER NOT NULL,
    avg_order_value REAL NOT NULL,
    computed_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS prod_monthly_sales (
    year_month TEXT PRIMARY KEY,
    year INTEGER NOT NULL,
    month INTEGER NOT NULL,
    total_orders INTEGER NOT NULL,
    total_items INTEGER NOT NULL,
    total_revenue REAL NOT NULL,
    total_customers INTEGER NOT NULL,
    avg_order_value REAL NOT NULL,
    computed_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS prod_daily_category_metrics (
    order_date TEXT NOT NULL,
    category TEXT NOT NULL,
    total_orders INTEGER NOT NULL,
    total_items INTEGER NOT NULL,
    total_revenue REAL NOT NULL,
    unique_customers INTEGER NOT NULL,
    unique_products INTEGER NOT NULL,
    computed_at_ms INTEGER NOT NULL,
    PRIMARY KEY (order_date, category)
);

CREATE TABLE IF NOT EXISTS prod_daily_product_metrics (
    order_date TEXT NOT NULL,
    product_id INTEGER NOT NULL,
    product_name TEXT NOT NULL,
    category TEXT NOT NULL,
    total_orders INTEGER NOT NULL,
    total_quantity INTEGER NOT NULL,
    total_revenue REAL NOT NULL,
    unique_customers INTEGER NOT NULL,
    computed_at_ms INTEGER NOT NULL,
    PRIMARY KEY (order_date, product_id)
);

CREATE TABLE IF NOT EXISTS prod_customer_metrics (
    customer_id INTEGER PRIMARY KEY,
    customer_name TEXT NOT NULL,
    customer_segment TEXT NOT NULL,
    first_order_date TEXT,
    last_order_date TEXT,
    total_orders INTEGER NOT NULL,
    total_items INTEGER NOT NULL,
    total_revenue REAL NOT NULL,
    avg_order_value REAL NOT NULL,
    days_since_first_order INTEGER,
    days_since_last_order INTEGER,
    computed_at_ms INTEGER NOT NULL
);
"#;

/// Open the store and make sure all layer tables exist.
pub fn open_store(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("open store {}", path.display()))?;
    conn.pragma_update(None, "journal_mode", "WAL").ok();
    conn.pragma_update(None, "synchronous", "NORMAL").ok();
    conn.pragma_update(None, "foreign_keys", "ON").ok();
    init_schema(&conn)?;
    Ok(conn)
}

/// In-memory store, used by tests.
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().context("open in-memory store")?;
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_SQL).context("initialize schema")?;
    Ok(())
}

/// Current wall-clock time as epoch millis.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_initializes_twice() {
        let conn = open_in_memory().unwrap();
        // CREATE IF NOT EXISTS makes re-init a no-op.
        init_schema(&conn).unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name LIKE 'stg_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 4);
    }

    #[test]
    fn prod_tables_exist() {
        let conn = open_in_memory().unwrap();
        for table in [
            "prod_daily_sales",
            "prod_monthly_sales",
            "prod_daily_category_metrics",
            "prod_daily_product_metrics",
            "prod_customer_metrics",
        ] {
            let found: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(found, 1, "missing table {table}");
        }
    }
}
