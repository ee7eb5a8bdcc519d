//! Tracking-and-view engine for inventory discrepancy snapshots.
//!
//! The crate is storage-agnostic: persistence goes through
//! [`PersistenceGateway`] and snapshots arrive through [`SnapshotSource`].

mod actions;
mod classify;
mod gateway;
mod history;
mod record;
mod views;

pub use actions::{ActionAssignment, ActionBook, ActionKind};
pub use classify::{
    is_returned, is_visually_cleared, CategorySummary, Category, Classification, RETURNED_SUFFIX,
    VISUAL_CHECK_MARKERS,
};
pub use gateway::{GatewayError, MemoryGateway, PersistenceGateway, SnapshotSource, SourceError};
pub use history::{
    ceiling_days, format_duration, HistoryLog, MergeSummary, StatusHistoryEntry, StatusTransition,
};
pub use record::{columns, normalize_rows, NormalizedSnapshot, RawRow, StockRecord, StockStatus};
pub use views::{
    buyer_totals, filter_and_sort, view_rows, BuyerDirectory, BuyerFilter, BuyerTotal,
    BuyerTotals, CanonicalBuyer, ViewRow, ALL_BUYERS_KEY, OTHER_BUYERS_KEY,
};

/// Gateway key holding the per-item status history log.
pub const HISTORY_KEY: &str = "status-history-log";
/// Gateway key holding stock id → action label.
pub const ACTIONS_KEY: &str = "action-assignments";
/// Gateway key holding stock id → free-form text for `Other` actions.
pub const ACTION_TEXT_KEY: &str = "action-freeform-text";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("malformed record: {0}")]
    MalformedRecord(String),
    #[error("codec error: {0}")]
    Codec(String),
}
