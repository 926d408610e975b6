//! Raw Layer
//!
//! Ingests partitioned JSONL drops into the append-only raw tables:
//! - Partition layout: `<raw_dir>/<entity>/<YYYY-MM-DD>/data.jsonl`
//! - Incremental runs skip partitions already present in the raw table
//! - Full-refresh runs truncate the raw tables and re-ingest everything
//! - Every row is stamped with ingestion time, source file and partition
//!
//! Raw rows are stored exactly as they arrive, injected errors included.
//! Nothing here validates business fields; that is the cleaner's job.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use rusqlite::{params, Connection, Row, Statement};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::context::{RawIngestSummary, RawTableSummary, RunMode};
use crate::db::now_ms;
use crate::model::{
    EntityKind, RawCustomer, RawMeta, RawOrder, RawOrderItem, RawProduct,
};

/// Name of the data file inside each partition directory.
const PARTITION_FILE: &str = "data.jsonl";

// =============================================================================
// RAW RECORD BINDING
// =============================================================================

/// A record type stored in one of the raw tables. Implementations bind the
/// typed fields to their table's insert statement and read them back.
pub trait RawRecord: DeserializeOwned + Send {
    const KIND: EntityKind;
    const INSERT_SQL: &'static str;
    const SELECT_SQL: &'static str;

    fn insert(
        &self,
        stmt: &mut Statement<'_>,
        ingested_at_ms: i64,
        source_file: &str,
        partition_date: &str,
    ) -> rusqlite::Result<()>;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<(RawMeta, Self)>;
}

fn meta_from_row(row: &Row<'_>) -> rusqlite::Result<RawMeta> {
    Ok(RawMeta {
        seq: row.get("seq")?,
        ingested_at_ms: row.get("ingested_at_ms")?,
        source_file: row.get("source_file")?,
        partition_date: row.get("partition_date")?,
    })
}

impl RawRecord for RawCustomer {
    const KIND: EntityKind = EntityKind::Customers;
    const INSERT_SQL: &'static str = "INSERT INTO raw_customers \
        (customer_id, customer_name, email, country, signup_date, customer_segment, \
         ingested_at_ms, source_file, partition_date) \
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";
    const SELECT_SQL: &'static str = "SELECT seq, customer_id, customer_name, email, \
        country, signup_date, customer_segment, ingested_at_ms, source_file, partition_date \
        FROM raw_customers ORDER BY seq";

    fn insert(
        &self,
        stmt: &mut Statement<'_>,
        ingested_at_ms: i64,
        source_file: &str,
        partition_date: &str,
    ) -> rusqlite::Result<()> {
        stmt.execute(params![
            self.customer_id,
            self.customer_name,
            self.email,
            self.country,
            self.signup_date,
            self.customer_segment,
            ingested_at_ms,
            source_file,
            partition_date,
        ])?;
        Ok(())
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<(RawMeta, Self)> {
        Ok((
            meta_from_row(row)?,
            Self {
                customer_id: row.get("customer_id")?,
                customer_name: row.get("customer_name")?,
                email: row.get("email")?,
                country: row.get("country")?,
                signup_date: row.get("signup_date")?,
                customer_segment: row.get("customer_segment")?,
            },
        ))
    }
}

impl RawRecord for RawProduct {
    const KIND: EntityKind = EntityKind::Products;
    const INSERT_SQL: &'static str = "INSERT INTO raw_products \
        (product_id, product_name, category, price, cost, \
         ingested_at_ms, source_file, partition_date) \
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)";
    const SELECT_SQL: &'static str = "SELECT seq, product_id, product_name, category, \
        price, cost, ingested_at_ms, source_file, partition_date \
        FROM raw_products ORDER BY seq";

    fn insert(
        &self,
        stmt: &mut Statement<'_>,
        ingested_at_ms: i64,
        source_file: &str,
        partition_date: &str,
    ) -> rusqlite::Result<()> {
        stmt.execute(params![
            self.product_id,
            self.product_name,
            self.category,
            self.price,
            self.cost,
            ingested_at_ms,
            source_file,
            partition_date,
        ])?;
        Ok(())
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<(RawMeta, Self)> {
        Ok((
            meta_from_row(row)?,
            Self {
                product_id: row.get("product_id")?,
                product_name: row.get("product_name")?,
                category: row.get("category")?,
                price: row.get("price")?,
                cost: row.get("cost")?,
            },
        ))
    }
}

impl RawRecord for RawOrder {
    const KIND: EntityKind = EntityKind::Orders;
    const INSERT_SQL: &'static str = "INSERT INTO raw_orders \
        (order_id, customer_id, order_date, order_status, total_amount, \
         ingested_at_ms, source_file, partition_date) \
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)";
    const SELECT_SQL: &'static str = "SELECT seq, order_id, customer_id, order_date, \
        order_status, total_amount, ingested_at_ms, source_file, partition_date \
        FROM raw_orders ORDER BY seq";

    fn insert(
        &self,
        stmt: &mut Statement<'_>,
        ingested_at_ms: i64,
        source_file: &str,
        partition_date: &str,
    ) -> rusqlite::Result<()> {
        stmt.execute(params![
            self.order_id,
            self.customer_id,
            self.order_date,
            self.order_status,
            self.total_amount,
            ingested_at_ms,
            source_file,
            partition_date,
        ])?;
        Ok(())
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<(RawMeta, Self)> {
        Ok((
            meta_from_row(row)?,
            Self {
                order_id: row.get("order_id")?,
                customer_id: row.get("customer_id")?,
                order_date: row.get("order_date")?,
                order_status: row.get("order_status")?,
                total_amount: row.get("total_amount")?,
            },
        ))
    }
}

impl RawRecord for RawOrderItem {
    const KIND: EntityKind = EntityKind::OrderItems;
    const INSERT_SQL: &'static str = "INSERT INTO raw_order_items \
        (order_item_id, order_id, product_id, quantity, unit_price, discount_percent, \
         ingested_at_ms, source_file, partition_date) \
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";
    const SELECT_SQL: &'static str = "SELECT seq, order_item_id, order_id, product_id, \
        quantity, unit_price, discount_percent, ingested_at_ms, source_file, partition_date \
        FROM raw_order_items ORDER BY seq";

    fn insert(
        &self,
        stmt: &mut Statement<'_>,
        ingested_at_ms: i64,
        source_file: &str,
        partition_date: &str,
    ) -> rusqlite::Result<()> {
        stmt.execute(params![
            self.order_item_id,
            self.order_id,
            self.product_id,
            self.quantity,
            self.unit_price,
            self.discount_percent,
            ingested_at_ms,
            source_file,
            partition_date,
        ])?;
        Ok(())
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<(RawMeta, Self)> {
        Ok((
            meta_from_row(row)?,
            Self {
                order_item_id: row.get("order_item_id")?,
                order_id: row.get("order_id")?,
                product_id: row.get("product_id")?,
                quantity: row.get("quantity")?,
                unit_price: row.get("unit_price")?,
                discount_percent: row.get("discount_percent")?,
            },
        ))
    }
}

// =============================================================================
// INGEST
// =============================================================================

/// Ingest all entity types from the partitioned raw directory.
pub fn ingest(conn: &mut Connection, raw_dir: &Path, mode: RunMode) -> Result<RawIngestSummary> {
    let mut summary = RawIngestSummary::default();
    for &kind in EntityKind::dependency_order() {
        let table = match kind {
            EntityKind::Customers => ingest_entity::<RawCustomer>(conn, raw_dir, mode)?,
            EntityKind::Products => ingest_entity::<RawProduct>(conn, raw_dir, mode)?,
            EntityKind::Orders => ingest_entity::<RawOrder>(conn, raw_dir, mode)?,
            EntityKind::OrderItems => ingest_entity::<RawOrderItem>(conn, raw_dir, mode)?,
        };
        summary.tables.push(table);
    }
    info!(
        total_rows = summary.total_rows(),
        "raw ingest complete"
    );
    Ok(summary)
}

fn ingest_entity<R: RawRecord>(
    conn: &mut Connection,
    raw_dir: &Path,
    mode: RunMode,
) -> Result<RawTableSummary> {
    let kind = R::KIND;
    let mut summary = RawTableSummary {
        entity: Some(kind),
        ..Default::default()
    };

    if mode == RunMode::FullRefresh {
        let truncated = conn
            .execute(&format!("DELETE FROM {}", kind.raw_table()), [])
            .with_context(|| format!("truncate {}", kind.raw_table()))?;
        if truncated > 0 {
            info!(entity = %kind, rows = truncated, "full refresh: truncated raw table");
        }
    }

    let entity_dir = raw_dir.join(kind.name());
    if !entity_dir.is_dir() {
        warn!(entity = %kind, dir = %entity_dir.display(), "no raw directory, skipping");
        return Ok(summary);
    }

    let already_ingested = match mode {
        RunMode::Incremental => ingested_partitions(conn, kind)?,
        RunMode::FullRefresh => HashSet::new(),
    };

    for partition in scan_partitions(&entity_dir)? {
        if already_ingested.contains(&partition) {
            debug!(entity = %kind, %partition, "partition already ingested, skipping");
            continue;
        }
        let file = entity_dir.join(&partition).join(PARTITION_FILE);
        if !file.is_file() {
            warn!(entity = %kind, %partition, "partition directory has no data file");
            continue;
        }
        let rows = ingest_partition::<R>(conn, &file, &partition)?;
        summary.partitions_processed += 1;
        summary.rows_ingested += rows;
        info!(entity = %kind, %partition, rows, "ingested partition");
    }

    Ok(summary)
}

/// Partition dates already present in the raw table.
fn ingested_partitions(conn: &Connection, kind: EntityKind) -> Result<HashSet<String>> {
    let sql = format!("SELECT DISTINCT partition_date FROM {}", kind.raw_table());
    let mut stmt = conn.prepare(&sql)?;
    let dates = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<HashSet<_>>>()
        .with_context(|| format!("list ingested partitions for {kind}"))?;
    Ok(dates)
}

/// Subdirectories named as dates, sorted ascending so ingest order (and
/// therefore raw seq) is deterministic.
fn scan_partitions(entity_dir: &Path) -> Result<Vec<String>> {
    let mut partitions = Vec::new();
    let entries = std::fs::read_dir(entity_dir)
        .with_context(|| format!("read raw directory {}", entity_dir.display()))?;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if NaiveDate::parse_from_str(&name, "%Y-%m-%d").is_ok() {
            partitions.push(name);
        } else {
            warn!(dir = %name, "ignoring non-date directory under raw root");
        }
    }
    partitions.sort();
    Ok(partitions)
}

/// Append one partition file inside a single transaction. A malformed line
/// aborts the whole partition; raw files are machine-written and a bad line
/// means the drop itself is broken.
fn ingest_partition<R: RawRecord>(
    conn: &mut Connection,
    file: &Path,
    partition: &str,
) -> Result<u64> {
    let source_file = file.display().to_string();
    let reader = BufReader::new(
        File::open(file).with_context(|| format!("open partition file {source_file}"))?,
    );
    let ingested_at_ms = now_ms();

    let tx = conn.transaction()?;
    let mut rows = 0u64;
    {
        let mut stmt = tx.prepare(R::INSERT_SQL)?;
        for (line_no, line) in reader.lines().enumerate() {
            let line = line.with_context(|| format!("read {source_file}"))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: R = match serde_json::from_str(&line) {
                Ok(record) => record,
                Err(err) => bail!("{source_file}:{}: malformed record: {err}", line_no + 1),
            };
            record.insert(&mut stmt, ingested_at_ms, &source_file, partition)?;
            rows += 1;
        }
    }
    tx.commit()
        .with_context(|| format!("commit partition {partition}"))?;
    Ok(rows)
}

// =============================================================================
// READ-BACK
// =============================================================================

/// Load every raw row of one entity type, in seq order, for the cleaner.
pub fn load_raw<R: RawRecord>(conn: &Connection) -> Result<Vec<(RawMeta, R)>> {
    let mut stmt = conn.prepare(R::SELECT_SQL)?;
    let rows = stmt
        .query_map([], |row| R::from_row(row))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("load raw rows for {}", R::KIND))?;
    Ok(rows)
}
