//! Staging Cleaner
//!
//! Transforms raw rows into canonical staging rows:
//! - Dedup per business key: latest `ingested_at_ms` wins, highest raw seq
//!   breaks ties. Deterministic for any input order.
//! - Field validation and normalization per entity (rayon across rows)
//! - Referential checks against already-staged parents, so entities must be
//!   cleaned in dependency order
//! - Email uniqueness across the whole staging layer, resolved serially in
//!   business-key order
//! - Idempotent upserts keyed by business key; `first_seen_at_ms` survives
//!   re-runs, `updated_at_ms` moves
//!
//! Rejections are row-level data, recorded on the run context; they never
//! abort the batch. Anything that does abort (store errors, raw read
//! failures) surfaces as an error from the stage.

use anyhow::{Context, Result};
use rayon::prelude::*;
use rusqlite::{params, Connection, Statement};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::context::{EntitySummary, RunContext, StagingSummary};
use crate::db::now_ms;
use crate::model::{
    EntityKind, RawCustomer, RawMeta, RawOrder, RawOrderItem, RawProduct, StgCustomer, StgOrder,
    StgOrderItem, StgProduct,
};
use crate::raw_store::{load_raw, RawRecord};
use crate::rules::{
    capitalize_name, is_valid_customer_segment, is_valid_email, is_valid_order_status,
    parse_date, RejectReason, DEFAULT_COUNTRY, DEFAULT_SEGMENT,
};

// =============================================================================
// STAGING INDEX
// =============================================================================

/// Business keys (and claimed emails) currently in staging, updated as the
/// batch progresses. Children validate their parent references against this.
#[derive(Debug, Default)]
pub struct StagingIndex {
    pub customer_ids: HashSet<i64>,
    pub product_ids: HashSet<i64>,
    pub order_ids: HashSet<i64>,
    pub order_item_ids: HashSet<i64>,
    /// email -> owning customer_id
    pub emails: HashMap<String, i64>,
}

impl StagingIndex {
    /// Load keys and emails from the staging tables.
    pub fn load(conn: &Connection) -> Result<Self> {
        let mut index = Self::default();
        index.customer_ids = load_key_set(conn, "SELECT customer_id FROM stg_customers")?;
        index.product_ids = load_key_set(conn, "SELECT product_id FROM stg_products")?;
        index.order_ids = load_key_set(conn, "SELECT order_id FROM stg_orders")?;
        index.order_item_ids = load_key_set(conn, "SELECT order_item_id FROM stg_order_items")?;

        let mut stmt = conn.prepare("SELECT email, customer_id FROM stg_customers")?;
        index.emails = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<HashMap<_, _>>>()
            .context("load staged emails")?;
        Ok(index)
    }

    fn keys_for(&self, kind: EntityKind) -> &HashSet<i64> {
        match kind {
            EntityKind::Customers => &self.customer_ids,
            EntityKind::Products => &self.product_ids,
            EntityKind::Orders => &self.order_ids,
            EntityKind::OrderItems => &self.order_item_ids,
        }
    }
}

fn load_key_set(conn: &Connection, sql: &str) -> Result<HashSet<i64>> {
    let mut stmt = conn.prepare(sql)?;
    let keys = stmt
        .query_map([], |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<HashSet<_>>>()
        .with_context(|| format!("load staging keys: {sql}"))?;
    Ok(keys)
}

// =============================================================================
// PER-ENTITY BINDING
// =============================================================================

/// Extends a raw record with validation and the staging upsert.
trait CleanEntity: RawRecord + Sync {
    type Staged: Send;

    const UPSERT_SQL: &'static str;

    fn business_key(&self) -> Option<i64>;

    /// Full validation and normalization for one deduped candidate.
    /// Pure with respect to the index: batch-wide conflicts (email claims)
    /// are resolved afterwards, serially.
    fn validate(&self, index: &StagingIndex) -> Result<Self::Staged, RejectReason>;

    /// Serial admission in business-key order. Registers the key (and any
    /// batch-wide claims) or rejects.
    fn claim(staged: &Self::Staged, index: &mut StagingIndex) -> Result<(), RejectReason>;

    fn bind_upsert(
        staged: &Self::Staged,
        stmt: &mut Statement<'_>,
        first_seen_at_ms: i64,
        updated_at_ms: i64,
    ) -> rusqlite::Result<()>;
}

fn require<T>(value: Option<T>, field: &'static str) -> Result<T, RejectReason> {
    value.ok_or(RejectReason::MissingField(field))
}

impl CleanEntity for RawCustomer {
    type Staged = StgCustomer;

    const UPSERT_SQL: &'static str = "INSERT INTO stg_customers \
        (customer_id, customer_name, email, country, signup_date, customer_segment, \
         first_seen_at_ms, updated_at_ms) \
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
        ON CONFLICT(customer_id) DO UPDATE SET \
            customer_name = excluded.customer_name, \
            email = excluded.email, \
            country = excluded.country, \
            signup_date = excluded.signup_date, \
            customer_segment = excluded.customer_segment, \
            updated_at_ms = excluded.updated_at_ms";

    fn business_key(&self) -> Option<i64> {
        self.customer_id
    }

    fn validate(&self, _index: &StagingIndex) -> Result<StgCustomer, RejectReason> {
        let customer_id = require(self.customer_id, "customer_id")?;
        let name = require(self.customer_name.as_deref(), "customer_name")?;
        let email = require(self.email.as_deref(), "email")?;
        let signup_raw = require(self.signup_date.as_deref(), "signup_date")?;

        if !is_valid_email(email) {
            return Err(RejectReason::InvalidEmail);
        }
        let signup_date = parse_date(signup_raw).ok_or(RejectReason::InvalidDate("signup_date"))?;
        let customer_segment = match self.customer_segment.as_deref() {
            None => DEFAULT_SEGMENT.to_string(),
            Some(s) if is_valid_customer_segment(s) => s.to_string(),
            Some(_) => return Err(RejectReason::InvalidSegment),
        };

        Ok(StgCustomer {
            customer_id,
            customer_name: capitalize_name(name),
            email: email.to_string(),
            country: self
                .country
                .clone()
                .unwrap_or_else(|| DEFAULT_COUNTRY.to_string()),
            signup_date,
            customer_segment,
        })
    }

    fn claim(staged: &StgCustomer, index: &mut StagingIndex) -> Result<(), RejectReason> {
        // The email may already belong to this same customer (re-run or
        // update); only a different owner is a conflict.
        if let Some(&owner) = index.emails.get(&staged.email) {
            if owner != staged.customer_id {
                return Err(RejectReason::DuplicateEmail);
            }
        }
        // An update may release the customer's previous address.
        index
            .emails
            .retain(|_, &mut owner| owner != staged.customer_id);
        index.emails.insert(staged.email.clone(), staged.customer_id);
        index.customer_ids.insert(staged.customer_id);
        Ok(())
    }

    fn bind_upsert(
        staged: &StgCustomer,
        stmt: &mut Statement<'_>,
        first_seen_at_ms: i64,
        updated_at_ms: i64,
    ) -> rusqlite::Result<()> {
        stmt.execute(params![
            staged.customer_id,
            staged.customer_name,
            staged.email,
            staged.country,
            staged.signup_date.to_string(),
            staged.customer_segment,
            first_seen_at_ms,
            updated_at_ms,
        ])?;
        Ok(())
    }
}

impl CleanEntity for RawProduct {
    type Staged = StgProduct;

    const UPSERT_SQL: &'static str = "INSERT INTO stg_products \
        (product_id, product_name, category, price, cost, first_seen_at_ms, updated_at_ms) \
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
        ON CONFLICT(product_id) DO UPDATE SET \
            product_name = excluded.product_name, \
            category = excluded.category, \
            price = excluded.price, \
            cost = excluded.cost, \
            updated_at_ms = excluded.updated_at_ms";

    fn business_key(&self) -> Option<i64> {
        self.product_id
    }

    fn validate(&self, _index: &StagingIndex) -> Result<StgProduct, RejectReason> {
        let product_id = require(self.product_id, "product_id")?;
        let product_name = require(self.product_name.clone(), "product_name")?;
        let category = require(self.category.clone(), "category")?;
        let price = require(self.price, "price")?;
        let cost = require(self.cost, "cost")?;

        if price < 0.0 {
            return Err(RejectReason::NegativeValue("price"));
        }
        if cost < 0.0 {
            return Err(RejectReason::NegativeValue("cost"));
        }

        Ok(StgProduct {
            product_id,
            product_name: capitalize_name(&product_name),
            category,
            price,
            cost,
        })
    }

    fn claim(staged: &StgProduct, index: &mut StagingIndex) -> Result<(), RejectReason> {
        index.product_ids.insert(staged.product_id);
        Ok(())
    }

    fn bind_upsert(
        staged: &StgProduct,
        stmt: &mut Statement<'_>,
        first_seen_at_ms: i64,
        updated_at_ms: i64,
    ) -> rusqlite::Result<()> {
        stmt.execute(params![
            staged.product_id,
            staged.product_name,
            staged.category,
            staged.price,
            staged.cost,
            first_seen_at_ms,
            updated_at_ms,
        ])?;
        Ok(())
    }
}

impl CleanEntity for RawOrder {
    type Staged = StgOrder;

    const UPSERT_SQL: &'static str = "INSERT INTO stg_orders \
        (order_id, customer_id, order_date, order_status, total_amount, \
         first_seen_at_ms, updated_at_ms) \
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
        ON CONFLICT(order_id) DO UPDATE SET \
            customer_id = excluded.customer_id, \
            order_date = excluded.order_date, \
            order_status = excluded.order_status, \
            total_amount = excluded.total_amount, \
            updated_at_ms = excluded.updated_at_ms";

    fn business_key(&self) -> Option<i64> {
        self.order_id
    }

    fn validate(&self, index: &StagingIndex) -> Result<StgOrder, RejectReason> {
        let order_id = require(self.order_id, "order_id")?;
        let customer_id = require(self.customer_id, "customer_id")?;
        let date_raw = require(self.order_date.as_deref(), "order_date")?;
        let status = require(self.order_status.as_deref(), "order_status")?;
        let total_amount = require(self.total_amount, "total_amount")?;

        let order_date = parse_date(date_raw).ok_or(RejectReason::InvalidDate("order_date"))?;
        if !is_valid_order_status(status) {
            return Err(RejectReason::InvalidStatus);
        }
        if total_amount < 0.0 {
            return Err(RejectReason::NegativeValue("total_amount"));
        }
        if !index.customer_ids.contains(&customer_id) {
            return Err(RejectReason::MissingParent("customer_id"));
        }

        Ok(StgOrder {
            order_id,
            customer_id,
            order_date,
            order_status: status.to_string(),
            total_amount,
        })
    }

    fn claim(staged: &StgOrder, index: &mut StagingIndex) -> Result<(), RejectReason> {
        index.order_ids.insert(staged.order_id);
        Ok(())
    }

    fn bind_upsert(
        staged: &StgOrder,
        stmt: &mut Statement<'_>,
        first_seen_at_ms: i64,
        updated_at_ms: i64,
    ) -> rusqlite::Result<()> {
        stmt.execute(params![
            staged.order_id,
            staged.customer_id,
            staged.order_date.to_string(),
            staged.order_status,
            staged.total_amount,
            first_seen_at_ms,
            updated_at_ms,
        ])?;
        Ok(())
    }
}

impl CleanEntity for RawOrderItem {
    type Staged = StgOrderItem;

    const UPSERT_SQL: &'static str = "INSERT INTO stg_order_items \
        (order_item_id, order_id, product_id, quantity, unit_price, discount_percent, \
         line_total, first_seen_at_ms, updated_at_ms) \
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
        ON CONFLICT(order_item_id) DO UPDATE SET \
            order_id = excluded.order_id, \
            product_id = excluded.product_id, \
            quantity = excluded.quantity, \
            unit_price = excluded.unit_price, \
            discount_percent = excluded.discount_percent, \
            line_total = excluded.line_total, \
            updated_at_ms = excluded.updated_at_ms";

    fn business_key(&self) -> Option<i64> {
        self.order_item_id
    }

    fn validate(&self, index: &StagingIndex) -> Result<StgOrderItem, RejectReason> {
        let order_item_id = require(self.order_item_id, "order_item_id")?;
        let order_id = require(self.order_id, "order_id")?;
        let product_id = require(self.product_id, "product_id")?;
        let quantity = require(self.quantity, "quantity")?;
        let unit_price = require(self.unit_price, "unit_price")?;
        let discount_percent = self.discount_percent.unwrap_or(0.0);

        if quantity <= 0 {
            return Err(RejectReason::NonPositiveQuantity);
        }
        if unit_price < 0.0 {
            return Err(RejectReason::NegativeValue("unit_price"));
        }
        if !(0.0..=100.0).contains(&discount_percent) {
            return Err(RejectReason::DiscountOutOfRange);
        }
        if !index.order_ids.contains(&order_id) {
            return Err(RejectReason::MissingParent("order_id"));
        }
        if !index.product_ids.contains(&product_id) {
            return Err(RejectReason::MissingParent("product_id"));
        }

        Ok(StgOrderItem {
            order_item_id,
            order_id,
            product_id,
            quantity,
            unit_price,
            discount_percent,
            line_total: StgOrderItem::compute_line_total(quantity, unit_price, discount_percent),
        })
    }

    fn claim(staged: &StgOrderItem, index: &mut StagingIndex) -> Result<(), RejectReason> {
        index.order_item_ids.insert(staged.order_item_id);
        Ok(())
    }

    fn bind_upsert(
        staged: &StgOrderItem,
        stmt: &mut Statement<'_>,
        first_seen_at_ms: i64,
        updated_at_ms: i64,
    ) -> rusqlite::Result<()> {
        stmt.execute(params![
            staged.order_item_id,
            staged.order_id,
            staged.product_id,
            staged.quantity,
            staged.unit_price,
            staged.discount_percent,
            staged.line_total,
            first_seen_at_ms,
            updated_at_ms,
        ])?;
        Ok(())
    }
}

// =============================================================================
// DRIVER
// =============================================================================

/// Clean every entity type, parents before children.
pub fn clean_all(conn: &mut Connection, ctx: &mut RunContext) -> Result<StagingSummary> {
    let mut index = StagingIndex::load(conn)?;
    let mut summary = StagingSummary::default();
    for &kind in EntityKind::dependency_order() {
        let entity = match kind {
            EntityKind::Customers => clean_entity::<RawCustomer>(conn, ctx, &mut index)?,
            EntityKind::Products => clean_entity::<RawProduct>(conn, ctx, &mut index)?,
            EntityKind::Orders => clean_entity::<RawOrder>(conn, ctx, &mut index)?,
            EntityKind::OrderItems => clean_entity::<RawOrderItem>(conn, ctx, &mut index)?,
        };
        info!(
            entity = %kind,
            upserted = entity.upserted(),
            rejected = entity.rejected,
            duplicates = entity.duplicates_resolved,
            "cleaned entity"
        );
        summary.entities.push(entity);
    }
    Ok(summary)
}

/// Clean a single entity type against the current staging state. Parents
/// must already be staged (by a prior run or an earlier `clean_one` call)
/// or the children will reject on their references.
pub fn clean_one(
    conn: &mut Connection,
    ctx: &mut RunContext,
    kind: EntityKind,
) -> Result<EntitySummary> {
    let mut index = StagingIndex::load(conn)?;
    let entity = match kind {
        EntityKind::Customers => clean_entity::<RawCustomer>(conn, ctx, &mut index)?,
        EntityKind::Products => clean_entity::<RawProduct>(conn, ctx, &mut index)?,
        EntityKind::Orders => clean_entity::<RawOrder>(conn, ctx, &mut index)?,
        EntityKind::OrderItems => clean_entity::<RawOrderItem>(conn, ctx, &mut index)?,
    };
    info!(
        entity = %kind,
        upserted = entity.upserted(),
        rejected = entity.rejected,
        duplicates = entity.duplicates_resolved,
        "cleaned entity"
    );
    Ok(entity)
}

fn clean_entity<E: CleanEntity>(
    conn: &mut Connection,
    ctx: &mut RunContext,
    index: &mut StagingIndex,
) -> Result<EntitySummary> {
    let kind = E::KIND;
    let mut summary = EntitySummary::new(kind);
    let reject = |summary: &mut EntitySummary,
                      ctx: &mut RunContext,
                      key: Option<i64>,
                      reason: RejectReason| {
        *summary.reasons.entry(reason.code()).or_insert(0) += 1;
        summary.rejected += 1;
        ctx.reject(kind, key, reason);
    };

    let rows = load_raw::<E>(conn)?;
    summary.rows_read = rows.len() as u64;

    // Dedup: one winner per business key. Latest ingestion wins, highest
    // seq breaks ties. Keyless rows cannot be deduped and reject outright.
    let mut winners: HashMap<i64, (RawMeta, E)> = HashMap::new();
    for (meta, record) in rows {
        let Some(key) = record.business_key() else {
            reject(
                &mut summary,
                ctx,
                None,
                RejectReason::MissingField(kind.business_key()),
            );
            continue;
        };
        match winners.entry(key) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert((meta, record));
            }
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                let held = (slot.get().0.ingested_at_ms, slot.get().0.seq);
                if (meta.ingested_at_ms, meta.seq) > held {
                    debug!(entity = %kind, key, superseded_seq = held.1, winner_seq = meta.seq,
                        "duplicate resolved");
                    slot.insert((meta, record));
                } else {
                    debug!(entity = %kind, key, superseded_seq = meta.seq, winner_seq = held.1,
                        "duplicate resolved");
                }
                summary.duplicates_resolved += 1;
            }
        }
    }
    summary.distinct_keys = winners.len() as u64;

    // Validate in parallel; rows are independent once deduped. Sorted by
    // key so the serial claim pass below is deterministic.
    let mut candidates: Vec<(i64, E)> = winners
        .into_iter()
        .map(|(key, (_, record))| (key, record))
        .collect();
    candidates.sort_by_key(|(key, _)| *key);

    let validated: Vec<(i64, Result<E::Staged, RejectReason>)> = candidates
        .par_iter()
        .map(|(key, record)| (*key, record.validate(index)))
        .collect();

    // Serial pass: admit claims in key order, then upsert in one transaction.
    let now = now_ms();
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(E::UPSERT_SQL)?;
        for (key, outcome) in validated {
            let staged = match outcome {
                Ok(staged) => staged,
                Err(reason) => {
                    reject(&mut summary, ctx, Some(key), reason);
                    continue;
                }
            };
            let existed = index.keys_for(kind).contains(&key);
            if let Err(reason) = E::claim(&staged, index) {
                reject(&mut summary, ctx, Some(key), reason);
                continue;
            }
            E::bind_upsert(&staged, &mut stmt, now, now)?;
            if existed {
                summary.updated += 1;
            } else {
                summary.inserted += 1;
            }
        }
    }
    tx.commit().with_context(|| format!("commit staging batch for {kind}"))?;

    Ok(summary)
}
