//! Validation Rules
//!
//! Declarative per-entity rule registry plus the field-level validators the
//! cleaner applies. One configuration record per entity type lists required
//! fields and parent references; a single generic cleaning routine consumes
//! the registry rather than per-entity bespoke code paths.

use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

use crate::model::EntityKind;

lazy_static! {
    static ref EMAIL_RE: Regex =
        Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap();
}

/// Order statuses accepted into staging.
pub const VALID_ORDER_STATUSES: &[&str] = &["completed", "pending", "cancelled", "returned"];

/// Customer segments accepted into staging. A missing segment defaults to
/// `Standard`; a supplied but unknown segment is rejected.
pub const VALID_CUSTOMER_SEGMENTS: &[&str] = &["Premium", "Standard", "Basic"];

/// Default for raw customers with no country.
pub const DEFAULT_COUNTRY: &str = "Unknown";
/// Default for raw customers with no segment.
pub const DEFAULT_SEGMENT: &str = "Standard";

// =============================================================================
// REASON CODES
// =============================================================================

/// Why a raw candidate was rejected. Row-level and non-fatal: rejected rows
/// are excluded from staging and logged, the batch continues.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum RejectReason {
    /// A required field is null or missing.
    MissingField(&'static str),
    /// Email does not match the standard address pattern.
    InvalidEmail,
    /// Date field present but not `YYYY-MM-DD`.
    InvalidDate(&'static str),
    /// Email already claimed by a different staged customer.
    DuplicateEmail,
    /// Order status outside the accepted set.
    InvalidStatus,
    /// Customer segment supplied but outside the accepted set.
    InvalidSegment,
    /// A monetary field is negative.
    NegativeValue(&'static str),
    /// Quantity must be strictly positive.
    NonPositiveQuantity,
    /// Discount percent outside 0..=100.
    DiscountOutOfRange,
    /// Referenced parent business key absent from staging.
    MissingParent(&'static str),
}

impl RejectReason {
    /// Stable code for summaries and the rejection log.
    pub fn code(&self) -> String {
        match self {
            Self::MissingField(field) => format!("missing_field:{field}"),
            Self::InvalidEmail => "invalid_email".into(),
            Self::InvalidDate(field) => format!("invalid_date:{field}"),
            Self::DuplicateEmail => "duplicate_email".into(),
            Self::InvalidStatus => "invalid_status".into(),
            Self::InvalidSegment => "invalid_segment".into(),
            Self::NegativeValue(field) => format!("negative_value:{field}"),
            Self::NonPositiveQuantity => "non_positive_quantity".into(),
            Self::DiscountOutOfRange => "discount_out_of_range".into(),
            Self::MissingParent(field) => format!("missing_parent:{field}"),
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.code())
    }
}

// =============================================================================
// RULE REGISTRY
// =============================================================================

/// Declarative rule record for one entity type.
#[derive(Debug, Clone, Copy)]
pub struct EntityRules {
    pub kind: EntityKind,
    /// Fields that must be present for a candidate to stage.
    pub required: &'static [&'static str],
    /// Parent references: (foreign-key column, parent entity).
    pub parents: &'static [(&'static str, EntityKind)],
}

const RULES: &[EntityRules] = &[
    EntityRules {
        kind: EntityKind::Customers,
        required: &["customer_id", "customer_name", "email", "signup_date"],
        parents: &[],
    },
    EntityRules {
        kind: EntityKind::Products,
        required: &["product_id", "product_name", "category", "price", "cost"],
        parents: &[],
    },
    EntityRules {
        kind: EntityKind::Orders,
        required: &[
            "order_id",
            "customer_id",
            "order_date",
            "order_status",
            "total_amount",
        ],
        parents: &[("customer_id", EntityKind::Customers)],
    },
    EntityRules {
        kind: EntityKind::OrderItems,
        required: &[
            "order_item_id",
            "order_id",
            "product_id",
            "quantity",
            "unit_price",
        ],
        parents: &[
            ("order_id", EntityKind::Orders),
            ("product_id", EntityKind::Products),
        ],
    },
];

/// Look up the rule record for an entity type.
pub fn rules_for(kind: EntityKind) -> &'static EntityRules {
    RULES
        .iter()
        .find(|r| r.kind == kind)
        .expect("every entity kind has a rule record")
}

// =============================================================================
// FIELD VALIDATORS
// =============================================================================

/// Standard address pattern check.
pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

pub fn is_valid_order_status(status: &str) -> bool {
    VALID_ORDER_STATUSES.contains(&status)
}

pub fn is_valid_customer_segment(segment: &str) -> bool {
    VALID_CUSTOMER_SEGMENTS.contains(&segment)
}

/// Strict `YYYY-MM-DD` parse. Anything else is rejected at cleaning time.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()
}

/// Capitalize each word of a name. Applied during staging so re-runs
/// produce byte-identical text.
pub fn capitalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
