//! Engine facade: owns the published ledger state, runs ingestion, and records
//! action assignments through a [`PersistenceGateway`].

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stock_ledger_core::{
    normalize_rows, ActionAssignment, ActionBook, ActionKind, BuyerDirectory, BuyerTotals,
    Category, CategorySummary, Classification, GatewayError, HistoryLog, KernelError,
    MergeSummary, PersistenceGateway, RawRow, SnapshotSource, SourceError, StatusHistoryEntry,
    StockRecord, ViewRow, ACTIONS_KEY, ACTION_TEXT_KEY, HISTORY_KEY,
};
use time::OffsetDateTime;

mod config;
mod source;

pub use config::EngineConfig;
pub use source::{JsonFileSource, WorkbookSource};

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Gateway key holding the last ingested records, so a fresh process can serve views.
pub const LAST_SNAPSHOT_KEY: &str = "last-snapshot";

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("snapshot source unavailable: {0}")]
    SourceUnavailable(#[from] SourceError),
    #[error("an ingestion cycle is already in flight")]
    IngestionInFlight,
    #[error("failed to persist `{key}`: {message}")]
    PersistenceWriteFailure { key: String, message: String },
    #[error("failed to load `{key}`: {message}")]
    PersistenceReadFailure { key: String, message: String },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    fn write_failure(err: GatewayError) -> Self {
        Self::PersistenceWriteFailure { key: err.key, message: err.message }
    }

    fn read_failure(key: &str, message: impl Into<String>) -> Self {
        Self::PersistenceReadFailure { key: key.to_string(), message: message.into() }
    }
}

impl From<KernelError> for EngineError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::Validation(message)
            | KernelError::MalformedRecord(message)
            | KernelError::Codec(message) => Self::Validation(message),
        }
    }
}

/// One immutable, versioned view of everything the engine serves.
#[derive(Debug, Clone, Default)]
pub struct LedgerState {
    pub version: u64,
    pub last_update: Option<OffsetDateTime>,
    pub records: Arc<Vec<StockRecord>>,
    pub classification: Arc<Classification>,
    pub history: Arc<HistoryLog>,
    pub actions: Arc<ActionBook>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategoryCount {
    pub category: Category,
    pub count: usize,
    pub total_cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestReport {
    pub version: u64,
    pub source: Option<String>,
    pub stock_rows: usize,
    pub skipped_rows: usize,
    pub merge: MergeSummary,
    pub categories: Vec<CategoryCount>,
    /// Keys whose write failed this cycle; their previous values remain authoritative.
    pub persistence_failures: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub ingested_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct PersistedSnapshot {
    #[serde(with = "time::serde::rfc3339")]
    last_update: OffsetDateTime,
    records: Vec<StockRecord>,
}

pub struct StockLedgerApi {
    gateway: Arc<dyn PersistenceGateway>,
    directory: BuyerDirectory,
    state: RwLock<Arc<LedgerState>>,
    ingest_gate: Mutex<()>,
    write_gate: Mutex<()>,
}

impl StockLedgerApi {
    /// Load persisted history, actions, and the last snapshot from `gateway`.
    ///
    /// # Errors
    /// Returns [`EngineError::PersistenceReadFailure`] when a stored blob cannot be
    /// read or decoded.
    pub fn open(
        gateway: Arc<dyn PersistenceGateway>,
        config: &EngineConfig,
    ) -> Result<Self, EngineError> {
        let history = match gateway.get(HISTORY_KEY) {
            Ok(Some(blob)) => HistoryLog::from_blob(blob)
                .map_err(|err| EngineError::read_failure(HISTORY_KEY, err.to_string()))?,
            Ok(None) => HistoryLog::new(),
            Err(err) => return Err(EngineError::read_failure(HISTORY_KEY, err.message)),
        };

        let kinds = gateway
            .get(ACTIONS_KEY)
            .map_err(|err| EngineError::read_failure(ACTIONS_KEY, err.message))
            .and_then(|blob| {
                ActionBook::decode_kinds(blob)
                    .map_err(|err| EngineError::read_failure(ACTIONS_KEY, err.to_string()))
            })?;
        let texts = gateway
            .get(ACTION_TEXT_KEY)
            .map_err(|err| EngineError::read_failure(ACTION_TEXT_KEY, err.message))
            .and_then(|blob| {
                ActionBook::decode_texts(blob)
                    .map_err(|err| EngineError::read_failure(ACTION_TEXT_KEY, err.to_string()))
            })?;

        let snapshot = match gateway.get(LAST_SNAPSHOT_KEY) {
            Ok(Some(blob)) => Some(
                serde_json::from_value::<PersistedSnapshot>(blob)
                    .map_err(|err| EngineError::read_failure(LAST_SNAPSHOT_KEY, err.to_string()))?,
            ),
            Ok(None) => None,
            Err(err) => return Err(EngineError::read_failure(LAST_SNAPSHOT_KEY, err.message)),
        };

        let (last_update, records) = match snapshot {
            Some(snapshot) => (Some(snapshot.last_update), snapshot.records),
            None => (None, Vec::new()),
        };
        let classification = Classification::classify(&records);

        tracing::info!(
            history_entries = history.len(),
            action_assignments = kinds.len(),
            stock_rows = records.len(),
            "opened stock ledger"
        );

        let state = LedgerState {
            version: 0,
            last_update,
            records: Arc::new(records),
            classification: Arc::new(classification),
            history: Arc::new(history),
            actions: Arc::new(ActionBook::from_parts(kinds, texts)),
        };

        Ok(Self {
            gateway,
            directory: config.buyers.clone(),
            state: RwLock::new(Arc::new(state)),
            ingest_gate: Mutex::new(()),
            write_gate: Mutex::new(()),
        })
    }

    /// The currently published state. Holding it never blocks writers.
    #[must_use]
    pub fn snapshot(&self) -> Arc<LedgerState> {
        Arc::clone(&self.state.read())
    }

    #[must_use]
    pub fn directory(&self) -> &BuyerDirectory {
        &self.directory
    }

    #[must_use]
    pub fn state_version(&self) -> u64 {
        self.snapshot().version
    }

    #[must_use]
    pub fn last_update(&self) -> Option<OffsetDateTime> {
        self.snapshot().last_update
    }

    /// Fetch a snapshot from `source` and merge it.
    ///
    /// # Errors
    /// Returns [`EngineError::IngestionInFlight`] when another ingestion holds the gate
    /// and [`EngineError::SourceUnavailable`] when the fetch fails; neither changes state.
    pub fn ingest(
        &self,
        source: &dyn SnapshotSource,
        now: OffsetDateTime,
    ) -> Result<IngestReport, EngineError> {
        let _gate = self.ingest_gate.try_lock().ok_or(EngineError::IngestionInFlight)?;
        let description = source.describe();
        let rows = source.fetch().map_err(|err| {
            tracing::warn!(source = %description, error = %err, "snapshot fetch failed");
            EngineError::from(err)
        })?;
        Ok(self.merge_rows(&rows, Some(description), now))
    }

    /// Classify and merge an already-fetched snapshot.
    ///
    /// # Errors
    /// Returns [`EngineError::IngestionInFlight`] when another ingestion holds the gate.
    pub fn merge_snapshot(
        &self,
        rows: &[RawRow],
        now: OffsetDateTime,
    ) -> Result<IngestReport, EngineError> {
        let _gate = self.ingest_gate.try_lock().ok_or(EngineError::IngestionInFlight)?;
        Ok(self.merge_rows(rows, None, now))
    }

    fn merge_rows(&self, rows: &[RawRow], source: Option<String>, now: OffsetDateTime) -> IngestReport {
        let normalized = normalize_rows(rows);
        let classification = Classification::classify(&normalized.records);
        let base = self.snapshot();
        let (next_history, merge) = base.history.merge_snapshot(&normalized.records, now);

        let mut persistence_failures = Vec::new();
        let history = if merge.changed() {
            match self.persist(HISTORY_KEY, next_history.to_blob()) {
                Ok(()) => Arc::new(next_history),
                Err(err) => {
                    tracing::warn!(key = HISTORY_KEY, error = %err, "keeping previous status history");
                    persistence_failures.push(HISTORY_KEY.to_string());
                    Arc::clone(&base.history)
                }
            }
        } else {
            Arc::clone(&base.history)
        };

        let persisted = PersistedSnapshot { last_update: now, records: normalized.records };
        let blob = serde_json::to_value(&persisted)
            .map_err(|err| KernelError::Codec(format!("failed to encode snapshot: {err}")));
        if let Err(err) = self.persist(LAST_SNAPSHOT_KEY, blob) {
            tracing::warn!(key = LAST_SNAPSHOT_KEY, error = %err, "snapshot not persisted");
            persistence_failures.push(LAST_SNAPSHOT_KEY.to_string());
        }

        let categories = Category::ALL
            .iter()
            .map(|category| CategoryCount {
                category: *category,
                count: classification.count(*category),
                total_cost: classification.total_cost(*category),
            })
            .collect();
        let stock_rows = persisted.records.len();

        let version = {
            let _writer = self.write_gate.lock();
            let current = self.snapshot();
            let next = LedgerState {
                version: current.version + 1,
                last_update: Some(now),
                records: Arc::new(persisted.records),
                classification: Arc::new(classification),
                history,
                actions: Arc::clone(&current.actions),
            };
            let version = next.version;
            *self.state.write() = Arc::new(next);
            version
        };

        tracing::info!(
            version,
            stock_rows,
            skipped_rows = normalized.skipped_rows,
            created = merge.created,
            transitioned = merge.transitioned,
            failures = persistence_failures.len(),
            "published snapshot"
        );

        IngestReport {
            version,
            source,
            stock_rows,
            skipped_rows: normalized.skipped_rows,
            merge,
            categories,
            persistence_failures,
            ingested_at: now,
        }
    }

    /// Per-category items, counts, and total cost in display order.
    #[must_use]
    pub fn categories(&self) -> Vec<CategorySummary> {
        self.snapshot().classification.summaries()
    }

    #[must_use]
    pub fn buyer_totals(&self, category: Category) -> BuyerTotals {
        let state = self.snapshot();
        stock_ledger_core::buyer_totals(state.classification.records(category), &self.directory)
    }

    /// Render one category table for a buyer filter key.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] for an unknown buyer filter key.
    pub fn view(
        &self,
        category: Category,
        buyer_filter: &str,
        now: OffsetDateTime,
    ) -> Result<Vec<ViewRow>, EngineError> {
        let filter = self.directory.parse_filter(buyer_filter)?;
        let state = self.snapshot();
        Ok(stock_ledger_core::view_rows(
            state.classification.records(category),
            &filter,
            &self.directory,
            &state.actions,
            &state.history,
            now,
        ))
    }

    #[must_use]
    pub fn get_action(&self, stock_id: &str) -> ActionAssignment {
        self.snapshot().actions.get(stock_id.trim())
    }

    /// Whole days in the current status as of `now`, or `None` for an untracked id.
    #[must_use]
    pub fn current_duration(&self, stock_id: &str, now: OffsetDateTime) -> Option<u64> {
        self.snapshot().history.current_duration_days(stock_id.trim(), now)
    }

    #[must_use]
    pub fn history(&self, stock_id: &str) -> Option<StatusHistoryEntry> {
        self.snapshot().history.get(stock_id.trim()).cloned()
    }

    /// Assign an action; any kind other than `Other` clears stored text.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] for an empty id and
    /// [`EngineError::PersistenceWriteFailure`] when a changed key cannot be written.
    pub fn set_action(
        &self,
        stock_id: &str,
        kind: ActionKind,
    ) -> Result<ActionAssignment, EngineError> {
        let stock_id = validate_stock_id(stock_id)?;
        self.update_actions(|book| book.set_action(stock_id, kind))?;
        Ok(self.get_action(stock_id))
    }

    /// Store free-form text; ignored unless the action is already `Other`.
    ///
    /// # Errors
    /// Same as [`Self::set_action`].
    pub fn set_action_text(
        &self,
        stock_id: &str,
        text: &str,
    ) -> Result<ActionAssignment, EngineError> {
        let stock_id = validate_stock_id(stock_id)?;
        self.update_actions(|book| book.set_action_text(stock_id, text))?;
        Ok(self.get_action(stock_id))
    }

    /// Apply one action (and text, for `Other`) to many ids; returns the distinct id count.
    ///
    /// # Errors
    /// Same as [`Self::set_action`]; the whole batch is validated before anything changes.
    pub fn bulk_apply(
        &self,
        stock_ids: &[String],
        kind: ActionKind,
        text: Option<&str>,
    ) -> Result<usize, EngineError> {
        let ids = stock_ids
            .iter()
            .map(|stock_id| validate_stock_id(stock_id))
            .collect::<Result<Vec<_>, _>>()?;
        let mut applied = 0;
        self.update_actions(|book| applied = book.bulk_apply(ids.iter().copied(), kind, text))?;
        Ok(applied)
    }

    fn update_actions(&self, mutate: impl FnOnce(&mut ActionBook)) -> Result<(), EngineError> {
        let _writer = self.write_gate.lock();
        let current = self.snapshot();
        let mut next = (*current.actions).clone();
        mutate(&mut next);

        let kinds_changed = next.kinds() != current.actions.kinds();
        if !kinds_changed && next.texts() == current.actions.texts() {
            return Ok(());
        }

        // Texts land first so a stored kind never sits next to stale stored text.
        if let Err(err) = self.persist(ACTION_TEXT_KEY, next.texts_blob()) {
            tracing::warn!(error = %err, "action write not persisted");
            return Err(err);
        }
        let texts = next.texts().clone();
        let mut kinds = current.actions.kinds().clone();
        let mut failure = None;
        if kinds_changed {
            match self.persist(ACTIONS_KEY, next.kinds_blob()) {
                Ok(()) => kinds = next.kinds().clone(),
                Err(err) => failure = Some(err),
            }
        }

        let adopted = ActionBook::from_parts(kinds, texts);
        if adopted != *current.actions {
            let state = LedgerState {
                version: current.version + 1,
                actions: Arc::new(adopted),
                ..(*current).clone()
            };
            *self.state.write() = Arc::new(state);
        }

        match failure {
            Some(err) => {
                tracing::warn!(error = %err, "action write not persisted");
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn persist(&self, key: &str, blob: Result<Value, KernelError>) -> Result<(), EngineError> {
        let blob = blob.map_err(|err| EngineError::PersistenceWriteFailure {
            key: key.to_string(),
            message: err.to_string(),
        })?;
        self.gateway.set(key, &blob).map_err(EngineError::write_failure)?;
        tracing::debug!(key, "persisted blob");
        Ok(())
    }
}

/// Resolve a category name such as `Missing` or `not-inspected`.
///
/// # Errors
/// Returns [`EngineError::Validation`] for an unknown name.
pub fn parse_category(value: &str) -> Result<Category, EngineError> {
    Category::parse(value)
        .ok_or_else(|| EngineError::Validation(format!("unknown category `{value}`")))
}

fn validate_stock_id(stock_id: &str) -> Result<&str, EngineError> {
    let trimmed = stock_id.trim();
    if trimmed.is_empty() {
        return Err(EngineError::Validation("stock id MUST be non-empty".to_string()));
    }
    Ok(trimmed)
}
