//! Data Model
//!
//! One entity type per business table, each with a RAW form (as-ingested,
//! every field optional) and a STAGING form (canonical, validated). The
//! four entity types form a fixed dependency chain: customers and products
//! are parents, orders reference customers, order items reference orders
//! and products.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// =============================================================================
// ENTITY TYPES
// =============================================================================

/// The entity types flowing through the pipeline.
///
/// This is the canonical definition - any table not listed here is not part
/// of the pipeline contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Customers,
    Products,
    Orders,
    OrderItems,
}

impl EntityKind {
    /// Canonical entity name, used for raw partition directories and logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Customers => "customers",
            Self::Products => "products",
            Self::Orders => "orders",
            Self::OrderItems => "order_items",
        }
    }

    /// Raw-layer table name.
    pub fn raw_table(&self) -> &'static str {
        match self {
            Self::Customers => "raw_customers",
            Self::Products => "raw_products",
            Self::Orders => "raw_orders",
            Self::OrderItems => "raw_order_items",
        }
    }

    /// Staging-layer table name.
    pub fn staging_table(&self) -> &'static str {
        match self {
            Self::Customers => "stg_customers",
            Self::Products => "stg_products",
            Self::Orders => "stg_orders",
            Self::OrderItems => "stg_order_items",
        }
    }

    /// Business-key column name.
    pub fn business_key(&self) -> &'static str {
        match self {
            Self::Customers => "customer_id",
            Self::Products => "product_id",
            Self::Orders => "order_id",
            Self::OrderItems => "order_item_id",
        }
    }

    /// All entity types in fixed dependency order (parents before children).
    /// This ordering is a correctness requirement: referential validation of
    /// a child depends on its parents already being staged.
    pub fn dependency_order() -> &'static [EntityKind] {
        &[
            Self::Customers,
            Self::Products,
            Self::Orders,
            Self::OrderItems,
        ]
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "customers" => Some(Self::Customers),
            "products" => Some(Self::Products),
            "orders" => Some(Self::Orders),
            "order_items" => Some(Self::OrderItems),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// RAW RECORDS (AS-INGESTED)
// =============================================================================

/// Ingestion metadata attached to every raw row. Append-only, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMeta {
    /// Raw sequence: the rowid assigned at ingest. Monotonic per table,
    /// used as the deterministic dedup tie-break.
    pub seq: i64,
    /// Ingestion timestamp (epoch millis).
    pub ingested_at_ms: i64,
    /// Source identifier (the partition file the row came from).
    pub source_file: String,
    /// Partition date bucket (`YYYY-MM-DD`). Lineage only, no business
    /// semantics.
    pub partition_date: String,
}

/// A raw customer record. All business fields optional: raw is stored
/// exactly as ingested, injected errors included.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawCustomer {
    pub customer_id: Option<i64>,
    pub customer_name: Option<String>,
    pub email: Option<String>,
    pub country: Option<String>,
    /// Kept as text: malformed dates must land in raw unchanged and be
    /// rejected at cleaning time, not at ingest.
    pub signup_date: Option<String>,
    pub customer_segment: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawProduct {
    pub product_id: Option<i64>,
    pub product_name: Option<String>,
    pub category: Option<String>,
    pub price: Option<f64>,
    pub cost: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawOrder {
    pub order_id: Option<i64>,
    pub customer_id: Option<i64>,
    pub order_date: Option<String>,
    pub order_status: Option<String>,
    pub total_amount: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawOrderItem {
    pub order_item_id: Option<i64>,
    pub order_id: Option<i64>,
    pub product_id: Option<i64>,
    pub quantity: Option<i64>,
    pub unit_price: Option<f64>,
    pub discount_percent: Option<f64>,
}

// =============================================================================
// STAGING ROWS (CANONICAL)
// =============================================================================

/// Canonical customer row as upserted into staging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StgCustomer {
    pub customer_id: i64,
    pub customer_name: String,
    pub email: String,
    pub country: String,
    pub signup_date: NaiveDate,
    pub customer_segment: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StgProduct {
    pub product_id: i64,
    pub product_name: String,
    pub category: String,
    pub price: f64,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StgOrder {
    pub order_id: i64,
    pub customer_id: i64,
    pub order_date: NaiveDate,
    pub order_status: String,
    pub total_amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StgOrderItem {
    pub order_item_id: i64,
    pub order_id: i64,
    pub product_id: i64,
    pub quantity: i64,
    pub unit_price: f64,
    pub discount_percent: f64,
    /// Always derived, never independently supplied.
    pub line_total: f64,
}

impl StgOrderItem {
    /// `quantity * unit_price * (1 - discount_percent/100)`, rounded to cents.
    pub fn compute_line_total(quantity: i64, unit_price: f64, discount_percent: f64) -> f64 {
        round_money(quantity as f64 * unit_price * (1.0 - discount_percent / 100.0))
    }
}

/// Round a monetary amount to 2 decimal places.
pub fn round_money(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
