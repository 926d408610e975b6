//! Run Context and Summaries
//!
//! Every Cleaner/Aggregator/Orchestrator call receives an explicit
//! `RunContext` carrying the run id, mode, target date range, resume point
//! and the rejection-log sink. There is no implicit global pipeline state.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::model::EntityKind;
use crate::rules::RejectReason;

// =============================================================================
// LAYERS AND MODES
// =============================================================================

/// Pipeline layers in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Raw,
    Staging,
    Prod,
}

impl Layer {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Staging => "staging",
            Self::Prod => "prod",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "raw" => Some(Self::Raw),
            "staging" => Some(Self::Staging),
            "prod" => Some(Self::Prod),
            _ => None,
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Run mode selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Ingest only new raw partitions; restage and re-aggregate on top.
    Incremental,
    /// Truncate raw tables and re-ingest every partition from scratch.
    FullRefresh,
}

/// Inclusive date range targeted by an aggregation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

// =============================================================================
// REJECTION LOG
// =============================================================================

/// One rejected candidate, recorded with its reason code.
#[derive(Debug, Clone, Serialize)]
pub struct Rejection {
    pub entity: EntityKind,
    pub business_key: Option<i64>,
    pub reason: RejectReason,
}

// =============================================================================
// RUN CONTEXT
// =============================================================================

/// Explicit per-run state threaded through every engine call.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: Uuid,
    pub mode: RunMode,
    /// Date range for aggregation; `None` means all staging data.
    pub date_range: Option<DateRange>,
    /// Layers before this one are assumed correct and skipped.
    pub resume_from: Layer,
    rejections: Vec<Rejection>,
}

impl RunContext {
    pub fn new(mode: RunMode, date_range: Option<DateRange>, resume_from: Layer) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode,
            date_range,
            resume_from,
            rejections: Vec::new(),
        }
    }

    pub fn reject(&mut self, entity: EntityKind, business_key: Option<i64>, reason: RejectReason) {
        self.rejections.push(Rejection {
            entity,
            business_key,
            reason,
        });
    }

    pub fn rejections(&self) -> &[Rejection] {
        &self.rejections
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(RunMode::Incremental, None, Layer::Raw)
    }
}

// =============================================================================
// STAGE SUMMARIES
// =============================================================================

/// Raw-layer ingest result for one entity table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawTableSummary {
    pub entity: Option<EntityKind>,
    pub partitions_processed: usize,
    pub rows_ingested: u64,
}

/// Raw-layer ingest result over all entity tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawIngestSummary {
    pub tables: Vec<RawTableSummary>,
}

impl RawIngestSummary {
    pub fn total_rows(&self) -> u64 {
        self.tables.iter().map(|t| t.rows_ingested).sum()
    }
}

/// Cleaner result for one entity type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySummary {
    pub entity: EntityKind,
    pub rows_read: u64,
    pub distinct_keys: u64,
    /// Raw candidates superseded by a later duplicate. Informational only.
    pub duplicates_resolved: u64,
    pub inserted: u64,
    pub updated: u64,
    pub rejected: u64,
    /// Rejection counts keyed by reason code.
    pub reasons: BTreeMap<String, u64>,
}

impl EntitySummary {
    pub fn new(entity: EntityKind) -> Self {
        Self {
            entity,
            rows_read: 0,
            distinct_keys: 0,
            duplicates_resolved: 0,
            inserted: 0,
            updated: 0,
            rejected: 0,
            reasons: BTreeMap::new(),
        }
    }

    pub fn upserted(&self) -> u64 {
        self.inserted + self.updated
    }
}

/// Cleaner result over all entity types.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StagingSummary {
    pub entities: Vec<EntitySummary>,
}

impl StagingSummary {
    pub fn total_upserted(&self) -> u64 {
        self.entities.iter().map(|e| e.upserted()).sum()
    }

    pub fn total_rejected(&self) -> u64 {
        self.entities.iter().map(|e| e.rejected).sum()
    }
}

/// Aggregator result for one target table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProdTableSummary {
    pub table: String,
    pub rows_written: u64,
}

/// Aggregator result over all five targets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProdSummary {
    pub tables: Vec<ProdTableSummary>,
}

impl ProdSummary {
    pub fn total_rows(&self) -> u64 {
        self.tables.iter().map(|t| t.rows_written).sum()
    }
}
